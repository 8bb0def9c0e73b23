//! Request and response head parsing.
//!
//! The controller parses heads incrementally off a buffered reader and keeps
//! headers in arrival order, because it re-serializes them towards the worker
//! (and duplicates such as `Set-Cookie` must survive the round trip). Lookup
//! is case-insensitive per RFC 9110.

use std::io;

use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};

use super::start_line::{RequestStartLine, StatusStartLine};

/// Limits applied while reading a head off the wire.
#[derive(Debug, Clone)]
pub struct ParseLimits {
    pub max_line_length: usize,
    pub max_headers: usize,
}

impl Default for ParseLimits {
    fn default() -> Self {
        Self {
            max_line_length: 8192,
            max_headers: 128,
        }
    }
}

#[derive(Debug, Error)]
pub enum HeadError {
    /// The peer closed the connection before sending any byte. Not an error
    /// on a keep-alive connection between requests.
    #[error("connection closed before a request line")]
    Closed,
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("head exceeds configured limits")]
    TooLarge,
    #[error("malformed head: {0}")]
    Malformed(String),
}

/// Ordered, case-insensitive multimap of header fields.
#[derive(Debug, Clone, Default)]
pub struct HeaderMap {
    entries: Vec<(String, String)>,
}

impl HeaderMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a field, keeping any existing fields of the same name.
    pub fn append<N: Into<String>, V: Into<String>>(&mut self, name: N, value: V) {
        self.entries.push((name.into(), value.into()));
    }

    /// Replaces every field of this name with a single one.
    pub fn set<N: Into<String>, V: Into<String>>(&mut self, name: N, value: V) {
        let name = name.into();
        self.remove(&name);
        self.entries.push((name, value.into()));
    }

    /// First value of the named field, if present.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn get_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.entries
            .iter()
            .filter(move |(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn remove(&mut self, name: &str) {
        self.entries.retain(|(n, _)| !n.eq_ignore_ascii_case(name));
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Parsed `Content-Length`, when present and well-formed.
    pub fn content_length(&self) -> Option<u64> {
        self.get("Content-Length").and_then(|v| v.trim().parse().ok())
    }

    /// Whether `Transfer-Encoding` names chunked as the final coding.
    pub fn is_chunked(&self) -> bool {
        self.get("Transfer-Encoding")
            .map(|v| {
                v.split(',')
                    .next_back()
                    .map(|t| t.trim().eq_ignore_ascii_case("chunked"))
                    .unwrap_or(false)
            })
            .unwrap_or(false)
    }

    /// Whether the `Connection` header carries the given token.
    pub fn connection_has_token(&self, token: &str) -> bool {
        self.get_all("Connection")
            .any(|v| v.split(',').any(|t| t.trim().eq_ignore_ascii_case(token)))
    }

    /// One cookie value out of the `Cookie` header, by name.
    pub fn cookie(&self, name: &str) -> Option<&str> {
        for header in self.get_all("Cookie") {
            for pair in header.split(';') {
                if let Some((k, v)) = pair.split_once('=') {
                    if k.trim() == name {
                        return Some(v.trim());
                    }
                }
            }
        }
        None
    }
}

async fn read_head_line<R: AsyncRead + Unpin>(
    reader: &mut BufReader<R>,
    limits: &ParseLimits,
) -> Result<Option<String>, HeadError> {
    let mut line = String::new();
    let n = reader.read_line(&mut line).await?;
    if n == 0 {
        return Ok(None);
    }
    if n > limits.max_line_length {
        return Err(HeadError::TooLarge);
    }
    while line.ends_with('\n') || line.ends_with('\r') {
        line.pop();
    }
    Ok(Some(line))
}

async fn parse_header_fields<R: AsyncRead + Unpin>(
    reader: &mut BufReader<R>,
    limits: &ParseLimits,
) -> Result<HeaderMap, HeadError> {
    let mut headers = HeaderMap::new();
    loop {
        let line = read_head_line(reader, limits)
            .await?
            .ok_or(HeadError::Malformed("truncated head".into()))?;
        if line.is_empty() {
            return Ok(headers);
        }
        if headers.len() >= limits.max_headers {
            return Err(HeadError::TooLarge);
        }
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| HeadError::Malformed(format!("header line without colon: {}", line)))?;
        if name.is_empty() || name.contains(' ') {
            return Err(HeadError::Malformed(format!("invalid field name: {}", name)));
        }
        headers.append(name, value.trim());
    }
}

/// Reads one request head (request line plus header fields) off the reader.
pub async fn parse_request_head<R: AsyncRead + Unpin>(
    reader: &mut BufReader<R>,
    limits: &ParseLimits,
) -> Result<(RequestStartLine, HeaderMap), HeadError> {
    let line = read_head_line(reader, limits).await?.ok_or(HeadError::Closed)?;
    if line.is_empty() {
        return Err(HeadError::Malformed("empty request line".into()));
    }
    let start_line = RequestStartLine::parse(&line).map_err(HeadError::Malformed)?;
    let headers = parse_header_fields(reader, limits).await?;
    Ok((start_line, headers))
}

/// Reads one response head (status line plus header fields) off the reader.
pub async fn parse_response_head<R: AsyncRead + Unpin>(
    reader: &mut BufReader<R>,
    limits: &ParseLimits,
) -> Result<(StatusStartLine, HeaderMap), HeadError> {
    let line = read_head_line(reader, limits).await?.ok_or(HeadError::Closed)?;
    let start_line = StatusStartLine::parse(&line).map_err(HeadError::Malformed)?;
    let headers = parse_header_fields(reader, limits).await?;
    Ok((start_line, headers))
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::http::http_value::HttpMethod;

    #[tokio::test]
    async fn parses_request_head() {
        let raw = b"GET /hello?x=1 HTTP/1.1\r\nHost: example.com\r\nCookie: a=1; b=2\r\n\r\nrest";
        let mut reader = BufReader::new(&raw[..]);
        let (line, headers) = parse_request_head(&mut reader, &ParseLimits::default())
            .await
            .unwrap();
        assert_eq!(line.method, HttpMethod::GET);
        assert_eq!(headers.get("host"), Some("example.com"));
        assert_eq!(headers.cookie("b"), Some("2"));
    }

    #[tokio::test]
    async fn keeps_duplicate_fields_in_order() {
        let raw = b"HTTP/1.1 200 OK\r\nSet-Cookie: a=1\r\nSet-Cookie: b=2\r\n\r\n";
        let mut reader = BufReader::new(&raw[..]);
        let (line, headers) = parse_response_head(&mut reader, &ParseLimits::default())
            .await
            .unwrap();
        assert_eq!(line.status.as_u16(), 200);
        let cookies: Vec<_> = headers.get_all("set-cookie").collect();
        assert_eq!(cookies, vec!["a=1", "b=2"]);
    }

    #[tokio::test]
    async fn clean_eof_reports_closed() {
        let raw: &[u8] = b"";
        let mut reader = BufReader::new(raw);
        match parse_request_head(&mut reader, &ParseLimits::default()).await {
            Err(HeadError::Closed) => {}
            other => panic!("expected Closed, got {:?}", other.map(|_| ())),
        }
    }

    #[tokio::test]
    async fn rejects_header_without_colon() {
        let raw = b"GET / HTTP/1.1\r\nbroken header\r\n\r\n";
        let mut reader = BufReader::new(&raw[..]);
        assert!(matches!(
            parse_request_head(&mut reader, &ParseLimits::default()).await,
            Err(HeadError::Malformed(_))
        ));
    }

    #[test]
    fn chunked_detection_uses_final_coding() {
        let mut headers = HeaderMap::new();
        headers.set("Transfer-Encoding", "gzip, chunked");
        assert!(headers.is_chunked());
        headers.set("Transfer-Encoding", "chunked, gzip");
        assert!(!headers.is_chunked());
    }
}
