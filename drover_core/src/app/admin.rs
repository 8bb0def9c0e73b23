//! The local admin endpoint.
//!
//! Routes are deliberately tiny; what matters is the authorization
//! contract: when any admin account is configured the endpoint always
//! demands authentication, and a Unix-socket peer with uid 0 or the owning
//! uid always has full access.

use std::sync::Arc;

use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use tokio::io::{AsyncWriteExt, BufReader, BufWriter};
use tokio::net::UnixListener;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::connection::Connection;
use crate::http::http_value::{HttpMethod, StatusCode};
use crate::http::meta::{parse_request_head, ParseLimits};
use crate::pool::Pool;

#[derive(Debug, Clone)]
pub struct AdminAccount {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone)]
pub struct AdminConfig {
    /// Unix-socket path the endpoint listens on.
    pub address: std::path::PathBuf,
    pub accounts: Vec<AdminAccount>,
    /// The uid that owns this instance; its peer credentials always grant
    /// access, as do root's.
    pub owner_uid: u32,
}

pub struct AdminServer {
    pool: Arc<Pool>,
    config: AdminConfig,
    instance_config_dump: String,
    shutdown_tx: watch::Sender<bool>,
}

impl AdminServer {
    pub fn new(
        pool: Arc<Pool>,
        config: AdminConfig,
        instance_config_dump: String,
        shutdown_tx: watch::Sender<bool>,
    ) -> Arc<Self> {
        Arc::new(Self {
            pool,
            config,
            instance_config_dump,
            shutdown_tx,
        })
    }

    /// Binds the admin socket and serves until the process shuts down.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> std::io::Result<()> {
        let _ = std::fs::remove_file(&self.config.address);
        let listener = UnixListener::bind(&self.config.address)?;
        info!(address = %self.config.address.display(), "admin endpoint listening");
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                result = listener.accept() => {
                    let Ok((stream, _)) = result else { continue };
                    let server = self.clone();
                    tokio::spawn(async move {
                        let conn = Connection::new_unix(stream, "admin client");
                        server.serve_connection(conn).await;
                    });
                }
            }
        }
        let _ = std::fs::remove_file(&self.config.address);
        Ok(())
    }

    /// Serves one request on an admin connection, then closes it.
    pub async fn serve_connection(&self, conn: Connection) {
        let peer_uid = conn.peer_uid();
        let (read_half, write_half) = conn.split();
        let mut reader = BufReader::new(read_half);
        let mut writer = BufWriter::new(write_half);

        let Ok((start_line, headers)) =
            parse_request_head(&mut reader, &ParseLimits::default()).await
        else {
            return;
        };

        if !self.authorized(peer_uid, headers.get("Authorization")) {
            debug!(path = %start_line.path(), "unauthorized admin request");
            let _ = write_response(
                &mut writer,
                StatusCode::UNAUTHORIZED,
                "application/json",
                &[("WWW-Authenticate", "Basic realm=\"admin\"")],
                "{\"status\": \"unauthorized\"}\n",
            )
            .await;
            return;
        }

        let path = start_line.path().to_string();
        match (start_line.method.clone(), path.as_str()) {
            (HttpMethod::GET, "/ping.json") => {
                let _ = write_response(&mut writer, StatusCode::OK, "application/json", &[], "{\"status\": \"ok\"}\n").await;
            }
            (HttpMethod::GET, "/config.json") => {
                let _ = write_response(
                    &mut writer,
                    StatusCode::OK,
                    "application/json",
                    &[],
                    &self.instance_config_dump,
                )
                .await;
            }
            (HttpMethod::GET, "/status.txt") => {
                let _ = write_response(
                    &mut writer,
                    StatusCode::OK,
                    "text/plain",
                    &[],
                    &self.pool.inspect(),
                )
                .await;
            }
            (HttpMethod::PUT | HttpMethod::POST, "/shutdown.json") => {
                warn!("shutdown requested through the admin endpoint");
                let _ = write_response(&mut writer, StatusCode::OK, "application/json", &[], "{\"status\": \"ok\"}\n").await;
                let _ = self.shutdown_tx.send(true);
            }
            _ => {
                let _ = write_response(
                    &mut writer,
                    StatusCode::NOT_FOUND,
                    "application/json",
                    &[],
                    "{\"status\": \"not found\"}\n",
                )
                .await;
            }
        }
    }

    /// The authorization contract. Peer uid 0 or the owning uid always has
    /// full access; otherwise a configured account must match.
    fn authorized(&self, peer_uid: Option<u32>, authorization: Option<&str>) -> bool {
        if let Some(uid) = peer_uid {
            if uid == 0 || uid == self.config.owner_uid {
                return true;
            }
        }
        if self.config.accounts.is_empty() {
            return false;
        }
        let Some(value) = authorization else {
            return false;
        };
        self.config.accounts.iter().any(|account| {
            let expected = format!(
                "Basic {}",
                BASE64.encode(format!("{}:{}", account.username, account.password))
            );
            value.trim() == expected
        })
    }
}

async fn write_response(
    writer: &mut BufWriter<tokio::io::WriteHalf<Connection>>,
    status: StatusCode,
    content_type: &str,
    extra_headers: &[(&str, &str)],
    body: &str,
) -> std::io::Result<()> {
    let mut head = format!(
        "HTTP/1.1 {}\r\nContent-Type: {}\r\nContent-Length: {}\r\nConnection: close\r\n",
        status,
        content_type,
        body.len()
    );
    for (name, value) in extra_headers {
        head.push_str(&format!("{}: {}\r\n", name, value));
    }
    head.push_str("\r\n");
    writer.write_all(head.as_bytes()).await?;
    writer.write_all(body.as_bytes()).await?;
    writer.flush().await?;
    writer.shutdown().await
}

