//! The Request Controller: terminates client connections, parses requests,
//! consults the turbocache, checks sessions out of the application pool and
//! proxies bytes between the client and the chosen worker.

pub mod checkout;
pub mod envelope;
pub mod forward;
pub mod request;

use std::io;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::io::{AsyncWriteExt, BufReader, BufWriter, ReadHalf, WriteHalf};
use tracing::{debug, info, warn};

use crate::buffer::MbufPool;
use crate::cache::response_cache::{
    freshness_expiry, request_is_cache_eligible, response_date, response_is_cache_eligible,
    CacheEntry, ResponseCache, MAX_ENTRY_BODY_SIZE,
};
use crate::cache::TurboCaching;
use crate::connection::Connection;
use crate::http::date::now_epoch;
use crate::http::http_value::{HttpVersion, StatusCode};
use crate::http::meta::{parse_request_head, parse_response_head, HeadError, HeaderMap, ParseLimits};
use crate::http::start_line::{RequestStartLine, StatusStartLine};
use crate::pool::{Options, Pool, SocketProtocol};

use checkout::{checkout_session, error_page_for, write_simple_response};
use forward::{
    buffer_request_body, build_client_response_head, forward_fixed_body, pump_response_body,
    run_upgrade_pump, write_header_to_app, BodyBufferError, ResponseFraming,
};
use request::{analyze_body, BodyAnalysis, Request, RequestBodyType, RequestState};

/// Response header through which a worker asks for an out-of-band-work
/// cycle.
pub const OOBW_REQUEST_HEADER: &str = "X-Drover-Request-OOBW";

#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Template for per-request pool options (single-application mode).
    pub default_options: Options,
    pub parse_limits: ParseLimits,
    /// Show exception details and spawn logs on error pages.
    pub friendly_error_pages: bool,
    pub show_version_in_header: bool,
    pub turbocaching_enabled: bool,
    /// Cookie carrying the sticky-session routing id.
    pub sticky_cookie_name: String,
    pub server_name: String,
    pub server_port: String,
    /// Upper bound for bodies that must be buffered before dispatch.
    pub max_buffered_request_body: usize,
}

impl ControllerConfig {
    pub fn new(default_options: Options) -> Self {
        Self {
            default_options,
            parse_limits: ParseLimits::default(),
            friendly_error_pages: false,
            show_version_in_header: true,
            turbocaching_enabled: true,
            sticky_cookie_name: "drover_route".to_string(),
            server_name: "localhost".to_string(),
            server_port: "80".to_string(),
            max_buffered_request_body: 128 * 1024,
        }
    }
}

pub struct Controller {
    pool: Arc<Pool>,
    pub config: ControllerConfig,
    turbo: Mutex<TurboCaching>,
    mbufs: MbufPool,
}

impl Controller {
    pub fn new(pool: Arc<Pool>, config: ControllerConfig) -> Arc<Self> {
        let turbo = TurboCaching::new(config.turbocaching_enabled, now_epoch());
        Arc::new(Self {
            pool,
            config,
            turbo: Mutex::new(turbo),
            mbufs: MbufPool::default(),
        })
    }

    pub fn pool(&self) -> &Arc<Pool> {
        &self.pool
    }

    /// Test and admin hook into the cache.
    pub fn with_turbocache<R>(&self, f: impl FnOnce(&mut TurboCaching) -> R) -> R {
        f(&mut self.turbo.lock())
    }

    /// Drives one client connection through its keep-alive request loop.
    pub async fn handle_connection(self: Arc<Self>, conn: Connection, remote_addr: String) {
        let (read_half, write_half) = conn.split();
        let mut reader = BufReader::new(read_half);
        let mut writer = BufWriter::new(write_half);

        loop {
            match parse_request_head(&mut reader, &self.config.parse_limits).await {
                Ok((start_line, headers)) => {
                    let keep_alive = self
                        .handle_request(&mut reader, &mut writer, start_line, headers, &remote_addr)
                        .await;
                    if !keep_alive {
                        break;
                    }
                }
                Err(HeadError::Closed) => break,
                Err(HeadError::Io(err)) => {
                    log_client_error(&err);
                    break;
                }
                Err(HeadError::TooLarge) => {
                    let _ = write_simple_response(
                        &mut writer,
                        StatusCode::BAD_REQUEST,
                        HttpVersion::Http11,
                        false,
                        "<h1>Bad request</h1><p>Request head too large.</p>",
                    )
                    .await;
                    break;
                }
                Err(HeadError::Malformed(reason)) => {
                    debug!(%reason, "rejecting malformed request");
                    let _ = write_simple_response(
                        &mut writer,
                        StatusCode::BAD_REQUEST,
                        HttpVersion::Http11,
                        false,
                        "<h1>Bad request</h1>",
                    )
                    .await;
                    break;
                }
            }
        }
        let _ = writer.shutdown().await;
    }

    /// Drives one request to `Ended`. Returns whether the client connection
    /// can carry another request.
    async fn handle_request(
        self: &Arc<Self>,
        reader: &mut BufReader<ReadHalf<Connection>>,
        writer: &mut BufWriter<WriteHalf<Connection>>,
        start_line: RequestStartLine,
        headers: HeaderMap,
        remote_addr: &str,
    ) -> bool {
        let mut req = Request::new(start_line, headers);

        match analyze_body(&req.start_line, &req.headers) {
            BodyAnalysis::Ok { body_type, upgrade } => {
                req.body_type = body_type;
                req.upgrade = upgrade;
            }
            BodyAnalysis::Reject(reason) => {
                debug!(%reason, "rejecting request");
                let _ = write_simple_response(
                    writer,
                    StatusCode::BAD_REQUEST,
                    req.start_line.http_version,
                    false,
                    &format!("<h1>Bad request</h1><p>{}</p>", reason),
                )
                .await;
                req.end(false, false);
                return false;
            }
        }

        // Turbocache probe. A hit short-circuits the whole pool machinery.
        if !req.upgrade {
            let now = now_epoch();
            let host = req.headers.get("Host").unwrap_or(self.config.server_name.as_str());
            let key = ResponseCache::key_for(&req.start_line.method, host, &req.start_line.target);
            let cache_hit = {
                let mut turbo = self.turbo.lock();
                turbo.update_state(now);
                if turbo.is_enabled()
                    && request_is_cache_eligible(&req.start_line.method, &req.headers)
                {
                    if let Some(entry) = turbo.cache.fetch(key, now) {
                        let bytes = turbo.render_response(
                            &self.mbufs,
                            &entry,
                            now,
                            req.start_line.http_version,
                            req.keep_alive,
                            self.config.show_version_in_header,
                        );
                        Some(bytes)
                    } else {
                        req.cache_key = Some(key);
                        None
                    }
                } else {
                    None
                }
            };
            if let Some(bytes) = cache_hit {
                debug!(key, "turbocache hit");
                if writer.write_all(&bytes).await.is_err() || writer.flush().await.is_err() {
                    req.end(false, false);
                    return false;
                }
                req.end(false, false);
                return req.keep_alive;
            }
        }

        // The controller answers Expect: 100-continue itself and strips the
        // header towards the worker; session-protocol apps never send it,
        // and it must go out before the client will start its body.
        if req.start_line.http_version == HttpVersion::Http11
            && req.body_type != RequestBodyType::NoBody
            && req
                .headers
                .get("Expect")
                .map(|v| v.eq_ignore_ascii_case("100-continue"))
                .unwrap_or(false)
        {
            if writer.write_all(b"HTTP/1.1 100 Continue\r\n\r\n").await.is_err()
                || writer.flush().await.is_err()
            {
                req.end(false, false);
                return false;
            }
        }

        // Chunked bodies are buffered up front so workers always see a
        // Content-Length.
        if req.body_type == RequestBodyType::Chunked {
            req.state = RequestState::BufferingRequestBody;
            match buffer_request_body(
                reader,
                &req.body_type,
                self.config.max_buffered_request_body,
            )
            .await
            {
                Ok(body) => req.buffered_body = Some(body),
                Err(BodyBufferError::TooLarge) => {
                    let _ = write_simple_response(
                        writer,
                        StatusCode(413),
                        req.start_line.http_version,
                        false,
                        "<h1>Payload too large</h1>",
                    )
                    .await;
                    req.end(false, false);
                    return false;
                }
                Err(BodyBufferError::BadFraming(reason)) => {
                    debug!(%reason, "bad request body framing");
                    let _ = write_simple_response(
                        writer,
                        StatusCode::BAD_REQUEST,
                        req.start_line.http_version,
                        false,
                        "<h1>Bad request</h1>",
                    )
                    .await;
                    req.end(false, false);
                    return false;
                }
                Err(BodyBufferError::Io(err)) => {
                    log_client_error(&err);
                    req.end(false, false);
                    return false;
                }
            }
        }

        let mut options = self.config.default_options.clone();
        options.sticky_session_id = req
            .headers
            .cookie(&self.config.sticky_cookie_name)
            .and_then(|v| v.parse().ok());

        req.state = RequestState::CheckingOutSession;
        let session = match checkout_session(&self.pool, &options).await {
            Ok(session) => session,
            Err(error) => {
                // An error page is only possible while the client connection
                // is still in a well-defined state: the body must not be
                // half-read.
                let reusable = req.known_body_length() == Some(0) || req.buffered_body.is_some();
                let keep = req.keep_alive && reusable;
                let (status, body) =
                    error_page_for(&error, &req.headers, self.config.friendly_error_pages);
                let _ = write_simple_response(
                    writer,
                    status,
                    req.start_line.http_version,
                    keep,
                    &body,
                )
                .await;
                req.end(false, false);
                return keep;
            }
        };

        if session.is_noop() {
            let _ = write_simple_response(
                writer,
                StatusCode::OK,
                req.start_line.http_version,
                req.keep_alive,
                "",
            )
            .await;
            req.end(false, false);
            return req.keep_alive;
        }

        let protocol = session.protocol();
        let gupid = session.gupid().to_string();
        req.session = Some(session);
        let half_close_app = protocol == SocketProtocol::Session && !req.upgrade;

        let mut app_conn = req
            .session
            .as_mut()
            .expect("session present")
            .take_connection()
            .expect("initiated session has a connection");

        // Forward the request head.
        req.state = RequestState::ForwardingHeaderToApp;
        if let Err(err) = write_header_to_app(
            &mut app_conn,
            &req,
            &options,
            protocol,
            &self.config.server_name,
            &self.config.server_port,
            remote_addr,
        )
        .await
        {
            return self.worker_error(writer, &mut req, "error sending header to app", err).await;
        }

        // Forward the request body.
        req.state = RequestState::ForwardingBodyToApp;
        let body_result: io::Result<()> = async {
            if let Some(body) = &req.buffered_body {
                tokio::io::AsyncWriteExt::write_all(&mut app_conn, body).await?;
            } else if let RequestBodyType::FixedLength(n) = req.body_type {
                forward_fixed_body(reader, &mut app_conn, n).await?;
            }
            tokio::io::AsyncWriteExt::flush(&mut app_conn).await?;
            if half_close_app {
                // End-of-request marker for the session protocol.
                tokio::io::AsyncWriteExt::shutdown(&mut app_conn).await?;
            }
            Ok(())
        }
        .await;
        if let Err(err) = body_result {
            return self.worker_error(writer, &mut req, "error forwarding request body", err).await;
        }

        // Read the response head.
        req.state = RequestState::WaitingForAppResponse;
        let mut app_reader = BufReader::new(&mut app_conn);
        let (status_line, app_headers) =
            match parse_response_head(&mut app_reader, &self.config.parse_limits).await {
                Ok(parsed) => parsed,
                Err(err) => {
                    drop(app_reader);
                    return self
                        .worker_error(
                            writer,
                            &mut req,
                            "app did not send a complete response",
                            io::Error::new(io::ErrorKind::InvalidData, err.to_string()),
                        )
                        .await;
                }
            };

        if app_headers.contains(OOBW_REQUEST_HEADER) {
            self.pool.request_oobw(&gupid);
        }

        // Upgrade accepted: switch to the bidirectional pump.
        if req.upgrade && status_line.status == StatusCode::SWITCHING_PROTOCOLS {
            let leftover = app_reader.buffer().to_vec();
            drop(app_reader);
            return self
                .run_upgrade(reader, writer, &mut req, app_conn, &status_line, &app_headers, leftover)
                .await;
        }

        // Forward the response.
        let framing =
            ResponseFraming::from_headers(status_line.status, &req.start_line.method, &app_headers);
        let client_keep = req.keep_alive
            && match framing {
                ResponseFraming::ContentLength(_) => true,
                ResponseFraming::Chunked => req.start_line.http_version == HttpVersion::Http11,
                ResponseFraming::UntilEof => false,
            };
        let head = build_client_response_head(
            status_line.status,
            &app_headers,
            req.start_line.http_version,
            client_keep,
            framing,
            self.config.show_version_in_header,
        );
        if let Err(err) = writer.write_all(head.as_bytes()).await {
            log_client_error(&err);
            req.end(false, true);
            return false;
        }
        req.response_begun = true;
        req.state = RequestState::ForwardingResponseToClient;

        let want_store = req.cache_key.is_some()
            && response_is_cache_eligible(status_line.status, &app_headers)
            && framing != ResponseFraming::UntilEof;
        let collect_limit = want_store.then_some(MAX_ENTRY_BODY_SIZE);

        let outcome = match pump_response_body(
            &mut app_reader,
            writer,
            reader,
            framing,
            collect_limit,
            &mut req,
        )
        .await
        {
            Ok(outcome) => outcome,
            Err(err) => {
                // Headers already went out; nothing to do but disconnect.
                log_client_error(&err);
                req.end(false, true);
                return false;
            }
        };
        drop(app_reader);

        if !outcome.complete {
            warn!("app closed the connection before the response was complete; disconnecting client");
            req.end(false, true);
            return false;
        }

        if let Some(body) = outcome.collected_body {
            self.maybe_store_response(&mut req, &status_line, &app_headers, body);
        }

        let worker_keep_alive = protocol == SocketProtocol::Http
            && !app_headers.connection_has_token("close")
            && status_line.http_version == HttpVersion::Http11;

        req.session
            .as_mut()
            .expect("session present")
            .restore_connection(app_conn);
        req.end(worker_keep_alive, false);

        if let Some(err) = req.early_client_error.take() {
            log_client_error(&err);
            return false;
        }
        client_keep && outcome.client_reusable
    }

    /// Writes the accepted-upgrade head and runs the bidirectional pump.
    #[allow(clippy::too_many_arguments)]
    async fn run_upgrade(
        self: &Arc<Self>,
        reader: &mut BufReader<ReadHalf<Connection>>,
        writer: &mut BufWriter<WriteHalf<Connection>>,
        req: &mut Request,
        app_conn: Connection,
        status_line: &StatusStartLine,
        app_headers: &HeaderMap,
        leftover: Vec<u8>,
    ) -> bool {
        let mut head = format!("{} {}\r\n", req.start_line.http_version, status_line.status);
        for (name, value) in app_headers.iter() {
            head.push_str(name);
            head.push_str(": ");
            head.push_str(value);
            head.push_str("\r\n");
        }
        head.push_str("\r\n");
        if writer.write_all(head.as_bytes()).await.is_err() {
            req.end(false, true);
            return false;
        }
        req.response_begun = true;
        info!("connection upgraded; entering bidirectional pump");

        let _ = run_upgrade_pump(reader, writer, app_conn, &leftover).await;
        // The connection never returns to the keep-alive list.
        req.end(false, false);
        false
    }

    /// Maps a worker-side failure: 502 while the response has not started,
    /// plain disconnect afterwards. The session's connection is gone, so
    /// closing it counts as a failure and is never reused.
    async fn worker_error(
        self: &Arc<Self>,
        writer: &mut BufWriter<WriteHalf<Connection>>,
        req: &mut Request,
        context: &str,
        err: io::Error,
    ) -> bool {
        warn!("{}: {}", context, err);
        if !req.response_begun {
            let _ = write_simple_response(
                writer,
                StatusCode::BAD_GATEWAY,
                req.start_line.http_version,
                false,
                "<h1>Bad gateway</h1><p>The application did not respond properly.</p>",
            )
            .await;
        }
        req.end(false, true);
        false
    }

    fn maybe_store_response(
        &self,
        req: &mut Request,
        status_line: &StatusStartLine,
        app_headers: &HeaderMap,
        body: Vec<u8>,
    ) {
        let Some(key) = req.cache_key else {
            return;
        };
        let now = now_epoch();
        let Some(expiry) = freshness_expiry(app_headers, now) else {
            return;
        };
        let date = response_date(app_headers).unwrap_or(now);

        let mut block = format!("HTTP/1.1 {}\r\n", status_line.status);
        for (name, value) in app_headers.iter() {
            if name.eq_ignore_ascii_case("Content-Length")
                || name.eq_ignore_ascii_case("Connection")
                || name.eq_ignore_ascii_case("Keep-Alive")
                || name.eq_ignore_ascii_case("Transfer-Encoding")
                || name.eq_ignore_ascii_case(OOBW_REQUEST_HEADER)
            {
                continue;
            }
            block.push_str(name);
            block.push_str(": ");
            block.push_str(value);
            block.push_str("\r\n");
        }
        if !app_headers.contains("Date") {
            block.push_str(&format!(
                "Date: {}\r\n",
                crate::http::date::format_imf_fixdate(date)
            ));
        }
        // Stored without the trailing blank line; the serving path appends
        // its synthesized fields.
        let block = block.trim_end_matches("\r\n").to_string();

        let entry = CacheEntry {
            key,
            header_block: block.into_bytes().into(),
            body: body.into(),
            date,
            expiry,
        };
        let mut turbo = self.turbo.lock();
        if turbo.is_enabled() {
            let stored = turbo.cache.store(entry, now);
            debug!(key, stored, "turbocache store");
        }
    }
}

fn log_client_error(err: &io::Error) {
    match err.kind() {
        io::ErrorKind::BrokenPipe | io::ErrorKind::ConnectionReset | io::ErrorKind::UnexpectedEof => {
            info!("client disconnected: {}", err);
        }
        _ => warn!("client I/O error: {}", err),
    }
}
