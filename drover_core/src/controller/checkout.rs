//! Session checkout and the error responses for checkout failures.

use std::sync::Arc;

use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing::{debug, error, warn};

use crate::http::date::{format_imf_fixdate, now_epoch};
use crate::http::http_value::{HttpVersion, StatusCode};
use crate::http::meta::HeaderMap;
use crate::pool::{GetError, Options, Pool, Session};

/// How often a failed worker handshake is retried through a fresh `get`.
const MAX_SESSION_CHECKOUT_TRY: u32 = 10;

/// Secure header through which the fronting web server overrides the status
/// code used for queue-overflow responses.
pub const QUEUE_OVERFLOW_STATUS_HEADER: &str = "!~DROVER_REQUEST_QUEUE_OVERFLOW_STATUS_CODE";

const HEAVY_LOAD_PAGE: &str = "<h1>This website is under heavy load</h1>\
<p>We're sorry, too many people are accessing this website at the same time. \
We're working on this problem. Please try again later.</p>";

const GENERIC_ERROR_PAGE: &str = "<h1>Internal server error</h1>\
<p>The application could not be started, or encountered an error. Please try \
again later.</p>";

#[derive(Debug)]
pub enum CheckoutError {
    Get(GetError),
    /// Every handshake attempt with a worker failed.
    InitiateFailed(String),
}

/// Checks out a session and initiates it, retrying through the pool when a
/// worker refuses the handshake (the pool detaches such workers, so the next
/// attempt lands elsewhere).
pub async fn checkout_session(
    pool: &Arc<Pool>,
    options: &Options,
) -> Result<Session, CheckoutError> {
    let mut last_error = String::new();
    for attempt in 1..=MAX_SESSION_CHECKOUT_TRY {
        let mut session = pool
            .get(options.clone())
            .await
            .map_err(CheckoutError::Get)?;
        if session.is_noop() {
            return Ok(session);
        }
        match session.initiate().await {
            Ok(()) => {
                debug!(pid = session.pid(), gupid = %session.gupid(), "session checked out");
                return Ok(session);
            }
            Err(err) => {
                debug!(
                    pid = session.pid(),
                    attempt, "error initiating session ({}); retrying", err
                );
                last_error = err.to_string();
                session.initiate_failed();
            }
        }
    }
    Err(CheckoutError::InitiateFailed(last_error))
}

/// Maps a checkout failure to a status code and body, honoring the
/// friendly-error-pages switch.
pub fn error_page_for(
    error: &CheckoutError,
    secure_headers: &HeaderMap,
    friendly_error_pages: bool,
) -> (StatusCode, String) {
    match error {
        CheckoutError::Get(GetError::RequestQueueFull) => {
            let status = secure_headers
                .get(QUEUE_OVERFLOW_STATUS_HEADER)
                .and_then(|v| v.trim().parse::<u16>().ok())
                .map(StatusCode)
                .unwrap_or(StatusCode::SERVICE_UNAVAILABLE);
            warn!(status = status.as_u16(), "returning queue overflow response");
            (status, HEAVY_LOAD_PAGE.to_string())
        }
        CheckoutError::Get(GetError::SpawnFailed {
            category,
            summary,
            details,
        }) => {
            error!(category = %category,
                "cannot checkout session because a spawning error occurred: {}", summary);
            if friendly_error_pages {
                let mut page = format!(
                    "<h1>The application could not be started</h1>\
                     <p>Error category: {}</p><p>{}</p>",
                    category, summary
                );
                if let Some(details) = details {
                    page.push_str(&format!("<pre>{}</pre>", details));
                }
                (StatusCode::INTERNAL_SERVER_ERROR, page)
            } else {
                (StatusCode::INTERNAL_SERVER_ERROR, GENERIC_ERROR_PAGE.to_string())
            }
        }
        CheckoutError::Get(other) => {
            warn!("cannot checkout session: {}", other);
            if friendly_error_pages {
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    format!(
                        "<h1>An internal error occurred</h1><p>{}</p>",
                        other
                    ),
                )
            } else {
                (StatusCode::INTERNAL_SERVER_ERROR, GENERIC_ERROR_PAGE.to_string())
            }
        }
        CheckoutError::InitiateFailed(message) => {
            warn!("could not initiate a session: {}", message);
            if friendly_error_pages {
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    format!("<h1>An internal error occurred</h1><p>could not initiate a session ({})</p>", message),
                )
            } else {
                (StatusCode::INTERNAL_SERVER_ERROR, GENERIC_ERROR_PAGE.to_string())
            }
        }
    }
}

/// Writes a complete, self-contained HTML response to the client.
pub async fn write_simple_response<W: AsyncWrite + Unpin>(
    writer: &mut W,
    status: StatusCode,
    version: HttpVersion,
    keep_alive: bool,
    body: &str,
) -> std::io::Result<()> {
    let head = format!(
        "{} {}\r\n\
         Status: {}\r\n\
         Date: {}\r\n\
         Content-Type: text/html; charset=UTF-8\r\n\
         Content-Length: {}\r\n\
         Connection: {}\r\n\
         \r\n",
        version,
        status,
        status.as_u16(),
        format_imf_fixdate(now_epoch()),
        body.len(),
        if keep_alive { "keep-alive" } else { "close" },
    );
    writer.write_all(head.as_bytes()).await?;
    writer.write_all(body.as_bytes()).await?;
    writer.flush().await
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn queue_overflow_status_can_be_overridden() {
        let error = CheckoutError::Get(GetError::RequestQueueFull);
        let mut headers = HeaderMap::new();
        let (status, body) = error_page_for(&error, &headers, false);
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert!(body.contains("heavy load"));

        headers.set(QUEUE_OVERFLOW_STATUS_HEADER, "429");
        let (status, _) = error_page_for(&error, &headers, false);
        assert_eq!(status.as_u16(), 429);
    }

    #[test]
    fn spawn_details_only_on_friendly_pages() {
        let error = CheckoutError::Get(GetError::SpawnFailed {
            category: "INTERNAL_ERROR".to_string(),
            summary: "exit status 1".to_string(),
            details: Some("boom".to_string()),
        });
        let headers = HeaderMap::new();
        let (_, body) = error_page_for(&error, &headers, true);
        assert!(body.contains("exit status 1"));
        assert!(body.contains("boom"));
        let (_, body) = error_page_for(&error, &headers, false);
        assert!(!body.contains("exit status 1"));
    }
}
