//! Byte forwarding between the client and the checked-out worker: request
//! head translation, body pumps, response streaming with client readahead,
//! and the bidirectional pump for upgraded connections.

use std::io;

use tokio::io::{
    AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader, BufWriter,
    ReadHalf, WriteHalf,
};
use tracing::{debug, trace};

use crate::connection::Connection;
use crate::http::chunked::{ChunkedDecoder, Event};
use crate::http::date::{format_imf_fixdate, now_epoch};
use crate::http::http_value::{HttpMethod, HttpVersion, StatusCode};
use crate::http::meta::HeaderMap;
use crate::pool::{Options, SocketProtocol};

use super::envelope::{http_header_to_envelope_key, SessionEnvelope};
use super::request::{Request, RequestBodyType};

/// Hop-by-hop fields that never cross the proxy boundary unchanged.
const HOP_BY_HOP: [&str; 5] = [
    "Connection",
    "Keep-Alive",
    "Transfer-Encoding",
    "Proxy-Authorization",
    "Proxy-Connection",
];

#[derive(Debug)]
pub enum BodyBufferError {
    TooLarge,
    BadFraming(String),
    Io(io::Error),
}

impl From<io::Error> for BodyBufferError {
    fn from(err: io::Error) -> Self {
        BodyBufferError::Io(err)
    }
}

/// Reads the whole request body into memory, bounded by `limit`. Chunked
/// bodies are always routed through here so the worker sees a
/// `Content-Length`.
pub async fn buffer_request_body<R: AsyncRead + Unpin>(
    reader: &mut BufReader<R>,
    body_type: &RequestBodyType,
    limit: usize,
) -> Result<Vec<u8>, BodyBufferError> {
    match body_type {
        RequestBodyType::NoBody => Ok(Vec::new()),
        RequestBodyType::FixedLength(n) => {
            if *n as usize > limit {
                return Err(BodyBufferError::TooLarge);
            }
            let mut body = vec![0u8; *n as usize];
            reader.read_exact(&mut body).await?;
            Ok(body)
        }
        RequestBodyType::Chunked => {
            let mut decoder = ChunkedDecoder::new();
            let mut body = Vec::new();
            loop {
                let (consumed_total, done) = {
                    let available = reader.fill_buf().await?;
                    if available.is_empty() {
                        return Err(BodyBufferError::BadFraming(
                            "connection closed inside chunked body".into(),
                        ));
                    }
                    let mut pos = 0;
                    let mut done = false;
                    while pos < available.len() {
                        let (consumed, event) = decoder
                            .feed(&available[pos..])
                            .map_err(|e| BodyBufferError::BadFraming(e.to_string()))?;
                        pos += consumed;
                        match event {
                            Event::Data(data) => {
                                if body.len() + data.len() > limit {
                                    return Err(BodyBufferError::TooLarge);
                                }
                                body.extend_from_slice(data);
                            }
                            Event::End => {
                                done = true;
                                break;
                            }
                            Event::NeedMore => break,
                        }
                    }
                    (pos, done)
                };
                reader.consume(consumed_total);
                if done {
                    return Ok(body);
                }
            }
        }
        RequestBodyType::Unbounded => Err(BodyBufferError::BadFraming(
            "an unbounded body cannot be buffered".into(),
        )),
    }
}

/// Writes the request head towards the worker, in whichever dialect its
/// socket speaks.
pub async fn write_header_to_app<W: AsyncWrite + Unpin>(
    writer: &mut W,
    req: &Request,
    options: &Options,
    protocol: SocketProtocol,
    server_name: &str,
    server_port: &str,
    remote_addr: &str,
) -> io::Result<()> {
    match protocol {
        SocketProtocol::Session => {
            let mut envelope = SessionEnvelope::new();
            envelope.push("REQUEST_METHOD", req.start_line.method.as_str());
            envelope.push("PATH_INFO", req.start_line.path());
            envelope.push("QUERY_STRING", req.start_line.query());
            envelope.push(
                "SERVER_NAME",
                req.headers.get("Host").unwrap_or(server_name),
            );
            envelope.push("SERVER_PORT", server_port);
            envelope.push("REMOTE_ADDR", remote_addr);
            envelope.push("SERVER_PROTOCOL", req.start_line.http_version.as_str());
            if let Some(len) = req.known_body_length() {
                if len > 0 {
                    envelope.push("CONTENT_LENGTH", len.to_string());
                }
            }
            if let Some(content_type) = req.headers.get("Content-Type") {
                envelope.push("CONTENT_TYPE", content_type);
            }
            if let Some(password) = &options.connect_password {
                envelope.push("DROVER_CONNECT_PASSWORD", password.clone());
            }
            for (name, value) in req.headers.iter() {
                // Expect is answered by the controller itself, never by the
                // worker.
                if name.eq_ignore_ascii_case("Content-Length")
                    || name.eq_ignore_ascii_case("Content-Type")
                    || name.eq_ignore_ascii_case("Expect")
                {
                    continue;
                }
                envelope.push(http_header_to_envelope_key(name), value);
            }
            writer.write_all(&envelope.encode()).await
        }
        SocketProtocol::Http => {
            let mut head = format!(
                "{} {} HTTP/1.1\r\n",
                req.start_line.method, req.start_line.target
            );
            for (name, value) in req.headers.iter() {
                if HOP_BY_HOP.iter().any(|h| h.eq_ignore_ascii_case(name))
                    || name.eq_ignore_ascii_case("Expect")
                {
                    continue;
                }
                if req.buffered_body.is_some() && name.eq_ignore_ascii_case("Content-Length") {
                    continue;
                }
                head.push_str(name);
                head.push_str(": ");
                head.push_str(value);
                head.push_str("\r\n");
            }
            if let Some(body) = &req.buffered_body {
                // A chunked request was fully buffered; the worker gets a
                // plain Content-Length.
                head.push_str(&format!("Content-Length: {}\r\n", body.len()));
            }
            if req.upgrade {
                if let Some(upgrade) = req.headers.get("Upgrade") {
                    head.push_str(&format!("Connection: upgrade\r\nUpgrade: {}\r\n", upgrade));
                }
            } else {
                head.push_str("Connection: keep-alive\r\n");
            }
            head.push_str("\r\n");
            writer.write_all(head.as_bytes()).await
        }
    }
}

/// Streams a fixed-length request body from the client to the worker.
pub async fn forward_fixed_body<R, W>(reader: &mut R, writer: &mut W, length: u64) -> io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut limited = reader.take(length);
    let copied = tokio::io::copy(&mut limited, writer).await?;
    if copied < length {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "client closed the connection inside the request body",
        ));
    }
    Ok(())
}

/// How the worker's response body is delimited.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseFraming {
    ContentLength(u64),
    Chunked,
    UntilEof,
}

impl ResponseFraming {
    pub fn from_headers(status: StatusCode, method: &HttpMethod, headers: &HeaderMap) -> Self {
        if *method == HttpMethod::HEAD
            || status.as_u16() == 204
            || status.as_u16() == 304
            || (100..200).contains(&status.as_u16())
        {
            return ResponseFraming::ContentLength(0);
        }
        if headers.is_chunked() {
            return ResponseFraming::Chunked;
        }
        match headers.content_length() {
            Some(n) => ResponseFraming::ContentLength(n),
            None => ResponseFraming::UntilEof,
        }
    }
}

pub struct ResponseForwardOutcome {
    /// The response reached its delimited end.
    pub complete: bool,
    /// The client connection may carry another request.
    pub client_reusable: bool,
    /// Body bytes collected for the response cache, when it was eligible
    /// and small enough.
    pub collected_body: Option<Vec<u8>>,
}

/// Serializes the response head for the client: the worker's headers minus
/// hop-by-hop fields, plus `Date`, server identification and the connection
/// decision.
pub fn build_client_response_head(
    status: StatusCode,
    app_headers: &HeaderMap,
    client_version: HttpVersion,
    client_keep_alive: bool,
    framing: ResponseFraming,
    show_version_in_header: bool,
) -> String {
    let mut head = format!("{} {}\r\n", client_version, status);
    for (name, value) in app_headers.iter() {
        if HOP_BY_HOP.iter().any(|h| h.eq_ignore_ascii_case(name)) {
            continue;
        }
        head.push_str(name);
        head.push_str(": ");
        head.push_str(value);
        head.push_str("\r\n");
    }
    if !app_headers.contains("Date") {
        head.push_str(&format!("Date: {}\r\n", format_imf_fixdate(now_epoch())));
    }
    if show_version_in_header {
        head.push_str(concat!("X-Powered-By: Drover ", env!("CARGO_PKG_VERSION"), "\r\n"));
    } else {
        head.push_str("X-Powered-By: Drover\r\n");
    }
    if framing == ResponseFraming::Chunked && client_version == HttpVersion::Http11 {
        head.push_str("Transfer-Encoding: chunked\r\n");
    }
    if client_keep_alive {
        if client_version == HttpVersion::Http10 {
            head.push_str("Connection: keep-alive\r\n");
        }
    } else if client_version == HttpVersion::Http11 {
        head.push_str("Connection: close\r\n");
    }
    head.push_str("\r\n");
    head
}

/// Streams the response body from the worker to the client.
///
/// While streaming, the client side is polled opportunistically: an EOF or
/// error found there is recorded on the request and surfaced only after the
/// response completes, per the readahead contract.
pub async fn pump_response_body<A>(
    app_reader: &mut BufReader<A>,
    client_writer: &mut BufWriter<WriteHalf<Connection>>,
    client_reader: &mut BufReader<ReadHalf<Connection>>,
    framing: ResponseFraming,
    collect_limit: Option<usize>,
    req: &mut Request,
) -> io::Result<ResponseForwardOutcome>
where
    A: AsyncRead + Unpin,
{
    let limit = collect_limit.unwrap_or(0);
    let mut collected: Option<Vec<u8>> = collect_limit.map(|_| Vec::new());
    let rechunk = framing == ResponseFraming::Chunked
        && req.start_line.http_version == HttpVersion::Http11;
    let mut decoder = ChunkedDecoder::new();
    let mut remaining = match framing {
        ResponseFraming::ContentLength(n) => n,
        _ => u64::MAX,
    };
    let mut readahead_armed = true;
    let mut complete = matches!(framing, ResponseFraming::ContentLength(0));
    let mut buf = vec![0u8; 8 * 1024];

    while !complete {
        let n = tokio::select! {
            biased;
            result = app_reader.read(&mut buf) => result?,
            result = client_readahead(client_reader), if readahead_armed => {
                readahead_armed = false;
                if let Some(err) = result {
                    trace!("client readahead observed: {}", err);
                    req.early_client_error = Some(err);
                }
                continue;
            }
        };
        if n == 0 {
            match framing {
                ResponseFraming::UntilEof => complete = true,
                _ => {
                    debug!("worker closed the connection before the response was complete");
                }
            }
            break;
        }

        match framing {
            ResponseFraming::ContentLength(_) => {
                let take = (n as u64).min(remaining) as usize;
                client_writer.write_all(&buf[..take]).await?;
                collect_into(&mut collected, limit, &buf[..take]);
                remaining -= take as u64;
                if remaining == 0 {
                    complete = true;
                }
            }
            ResponseFraming::Chunked => {
                let mut pos = 0;
                while pos < n && !complete {
                    let (consumed, event) = decoder.feed(&buf[pos..n]).map_err(|e| {
                        io::Error::new(io::ErrorKind::InvalidData, e.to_string())
                    })?;
                    match event {
                        Event::Data(data) => {
                            if !rechunk {
                                client_writer.write_all(data).await?;
                            }
                            collect_into(&mut collected, limit, data);
                        }
                        Event::End => complete = true,
                        Event::NeedMore => {}
                    }
                    pos += consumed;
                }
                if rechunk {
                    // Pass the worker's own chunk framing through untouched,
                    // up to and including the terminator.
                    client_writer.write_all(&buf[..pos]).await?;
                }
            }
            ResponseFraming::UntilEof => {
                client_writer.write_all(&buf[..n]).await?;
                collect_into(&mut collected, limit, &buf[..n]);
            }
        }
    }
    client_writer.flush().await?;

    // A client can only reuse the connection when it can find the end of
    // the body: a Content-Length, or chunked framing it actually received.
    let delimited_for_client = match framing {
        ResponseFraming::ContentLength(_) => true,
        ResponseFraming::Chunked => rechunk,
        ResponseFraming::UntilEof => false,
    };
    Ok(ResponseForwardOutcome {
        complete,
        client_reusable: complete && delimited_for_client && req.early_client_error.is_none(),
        collected_body: collected.filter(|_| complete),
    })
}

fn collect_into(collected: &mut Option<Vec<u8>>, limit: usize, data: &[u8]) {
    if let Some(body) = collected {
        if body.len() + data.len() <= limit {
            body.extend_from_slice(data);
        } else {
            // Over the limit: stop collecting entirely.
            *collected = None;
        }
    }
}

/// Peeks at the client while the response streams. Resolves with an error
/// for EOF or a read failure; resolves with None when the client has sent
/// bytes (the next pipelined request — not ours to consume here).
async fn client_readahead(
    reader: &mut BufReader<ReadHalf<Connection>>,
) -> Option<io::Error> {
    match reader.fill_buf().await {
        Ok(data) if data.is_empty() => Some(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "client closed the connection",
        )),
        Ok(_) => None,
        Err(err) => Some(err),
    }
}

/// The bidirectional byte pump for upgraded connections. Each direction is
/// an independent half-connection: EOF on the source propagates as a write
/// shutdown on the sink, and the pump ends when both directions finished.
pub async fn run_upgrade_pump(
    client_reader: &mut BufReader<ReadHalf<Connection>>,
    client_writer: &mut BufWriter<WriteHalf<Connection>>,
    app_conn: Connection,
    app_leftover: &[u8],
) -> io::Result<()> {
    let (mut app_read, mut app_write) = app_conn.split();

    if !app_leftover.is_empty() {
        client_writer.write_all(app_leftover).await?;
    }
    client_writer.flush().await?;

    let client_to_app = async {
        let _ = tokio::io::copy(client_reader, &mut app_write).await;
        let _ = app_write.shutdown().await;
    };
    let app_to_client = async {
        let _ = tokio::io::copy(&mut app_read, client_writer).await;
        let _ = client_writer.shutdown().await;
    };
    tokio::join!(client_to_app, app_to_client);
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn buffers_fixed_length_bodies() {
        let data = b"hello world";
        let mut reader = BufReader::new(&data[..]);
        let body = buffer_request_body(&mut reader, &RequestBodyType::FixedLength(5), 1024)
            .await
            .unwrap();
        assert_eq!(body, b"hello");
    }

    #[tokio::test]
    async fn buffers_chunked_bodies() {
        let data = b"5\r\nhello\r\n6\r\n world\r\n0\r\n\r\n";
        let mut reader = BufReader::new(&data[..]);
        let body = buffer_request_body(&mut reader, &RequestBodyType::Chunked, 1024)
            .await
            .unwrap();
        assert_eq!(body, b"hello world");
    }

    #[tokio::test]
    async fn rejects_oversized_bodies() {
        let data = b"hello world";
        let mut reader = BufReader::new(&data[..]);
        assert!(matches!(
            buffer_request_body(&mut reader, &RequestBodyType::FixedLength(11), 5).await,
            Err(BodyBufferError::TooLarge)
        ));
    }

    #[test]
    fn response_framing_rules() {
        let mut headers = HeaderMap::new();
        headers.set("Content-Length", "10");
        assert_eq!(
            ResponseFraming::from_headers(StatusCode::OK, &HttpMethod::GET, &headers),
            ResponseFraming::ContentLength(10)
        );
        assert_eq!(
            ResponseFraming::from_headers(StatusCode::OK, &HttpMethod::HEAD, &headers),
            ResponseFraming::ContentLength(0)
        );
        headers.set("Transfer-Encoding", "chunked");
        assert_eq!(
            ResponseFraming::from_headers(StatusCode::OK, &HttpMethod::GET, &headers),
            ResponseFraming::Chunked
        );
        assert_eq!(
            ResponseFraming::from_headers(StatusCode::OK, &HttpMethod::GET, &HeaderMap::new()),
            ResponseFraming::UntilEof
        );
    }

    #[test]
    fn client_head_carries_connection_decision() {
        let mut headers = HeaderMap::new();
        headers.set("Content-Type", "text/plain");
        headers.set("Connection", "keep-alive");
        let head = build_client_response_head(
            StatusCode::OK,
            &headers,
            HttpVersion::Http11,
            false,
            ResponseFraming::ContentLength(2),
            false,
        );
        assert!(head.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(head.contains("Content-Type: text/plain\r\n"));
        assert!(head.contains("Connection: close\r\n"));
        // The worker's own hop-by-hop header was stripped.
        assert_eq!(head.matches("Connection:").count(), 1);
        assert!(head.contains("Date: "));
    }
}
