//! The per-request object driven through its lifecycle by the controller.

use std::io;

use crate::http::http_value::{HttpMethod, HttpVersion};
use crate::http::meta::HeaderMap;
use crate::http::start_line::RequestStartLine;
use crate::pool::Session;

/// The request lifecycle. Every state may transition to `Ended` on error;
/// `Ended` releases the session exactly once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestState {
    AnalyzingRequest,
    BufferingRequestBody,
    CheckingOutSession,
    ForwardingHeaderToApp,
    ForwardingBodyToApp,
    WaitingForAppResponse,
    ForwardingResponseToClient,
    Ended,
}

/// How the request body is framed on the client connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestBodyType {
    NoBody,
    FixedLength(u64),
    Chunked,
    /// Upgraded connection: the "body" runs until EOF.
    Unbounded,
}

/// Outcome of analyzing the request head against the body-handling
/// decision matrix.
#[derive(Debug, PartialEq, Eq)]
pub enum BodyAnalysis {
    Ok { body_type: RequestBodyType, upgrade: bool },
    /// The combination is ambiguous or undefined; answer 400.
    Reject(&'static str),
}

/// Applies the decision matrix: method, presence of `Upgrade`, and framing
/// headers. (The app-socket protocol half of the matrix is applied later,
/// once a session is checked out and its protocol is known.)
pub fn analyze_body(start_line: &RequestStartLine, headers: &HeaderMap) -> BodyAnalysis {
    let has_upgrade = headers.contains("Upgrade");
    let is_chunked = headers.is_chunked();
    let content_length = headers.content_length();
    let has_framing = is_chunked || content_length.map(|n| n > 0).unwrap_or(false);
    let get_like = matches!(start_line.method, HttpMethod::GET | HttpMethod::HEAD);

    if has_upgrade {
        if !get_like {
            return BodyAnalysis::Reject("upgrades are only defined for GET requests");
        }
        if has_framing {
            return BodyAnalysis::Reject("an upgrade request may not carry a request body");
        }
        return BodyAnalysis::Ok {
            body_type: RequestBodyType::Unbounded,
            upgrade: true,
        };
    }

    let body_type = if is_chunked {
        RequestBodyType::Chunked
    } else {
        match content_length {
            Some(n) if n > 0 => RequestBodyType::FixedLength(n),
            _ => RequestBodyType::NoBody,
        }
    };
    BodyAnalysis::Ok {
        body_type,
        upgrade: false,
    }
}

pub struct Request {
    pub start_line: RequestStartLine,
    pub headers: HeaderMap,
    pub state: RequestState,
    pub body_type: RequestBodyType,
    pub upgrade: bool,
    /// Body bytes read ahead of dispatch (chunked bodies are always
    /// buffered so the worker sees a `Content-Length`).
    pub buffered_body: Option<Vec<u8>>,
    pub session: Option<Session>,
    /// Cache fingerprint, set when the request was cache-eligible but
    /// missed; a cacheable response is stored under it.
    pub cache_key: Option<u64>,
    /// Response bytes have reached the client; past this point errors can
    /// only disconnect, never produce an error page.
    pub response_begun: bool,
    /// Client connection may carry another request after this one.
    pub keep_alive: bool,
    /// Client EOF or read error observed while the response was still being
    /// forwarded; surfaced once the response completes.
    pub early_client_error: Option<io::Error>,
}

impl Request {
    pub fn new(start_line: RequestStartLine, headers: HeaderMap) -> Self {
        let keep_alive = client_wants_keep_alive(start_line.http_version, &headers);
        Self {
            start_line,
            headers,
            state: RequestState::AnalyzingRequest,
            body_type: RequestBodyType::NoBody,
            upgrade: false,
            buffered_body: None,
            session: None,
            cache_key: None,
            response_begun: false,
            keep_alive,
            early_client_error: None,
        }
    }

    pub fn ended(&self) -> bool {
        self.state == RequestState::Ended
    }

    /// Ends the request, releasing the session exactly once.
    pub fn end(&mut self, session_keep_alive: bool, session_fail: bool) {
        if self.state == RequestState::Ended {
            return;
        }
        self.state = RequestState::Ended;
        if let Some(session) = self.session.take() {
            session.close(session_keep_alive, session_fail);
        }
    }

    /// Effective request body length, when known.
    pub fn known_body_length(&self) -> Option<u64> {
        if let Some(buffered) = &self.buffered_body {
            return Some(buffered.len() as u64);
        }
        match self.body_type {
            RequestBodyType::NoBody => Some(0),
            RequestBodyType::FixedLength(n) => Some(n),
            RequestBodyType::Chunked | RequestBodyType::Unbounded => None,
        }
    }
}

impl Drop for Request {
    fn drop(&mut self) {
        // A request dropped mid-flight failed; its session must not be
        // reused.
        if let Some(session) = self.session.take() {
            session.close(false, true);
        }
    }
}

/// The client connection's keep-alive decision, per HTTP/1.x defaults.
pub fn client_wants_keep_alive(version: HttpVersion, headers: &HeaderMap) -> bool {
    if headers.connection_has_token("close") {
        false
    } else if headers.connection_has_token("keep-alive") {
        true
    } else {
        version.keep_alive_by_default()
    }
}
