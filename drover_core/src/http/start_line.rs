use super::http_value::*;

/// RequestStartLine is the first line of an HTTP request: method, target and
/// HTTP version.
#[derive(Debug, Clone)]
pub struct RequestStartLine {
    pub http_version: HttpVersion,
    pub method: HttpMethod,
    pub target: String,
}

impl RequestStartLine {
    pub fn new(http_version: HttpVersion, method: HttpMethod, target: String) -> Self {
        Self {
            http_version,
            method,
            target,
        }
    }

    /// Parses a request line such as `GET /index.html HTTP/1.1`.
    ///
    /// # Errors
    ///
    /// Returns an error if the line does not have exactly three parts or
    /// names an HTTP version this server does not speak.
    pub fn parse<T: AsRef<str>>(line: T) -> Result<Self, String> {
        let line = line.as_ref();
        let parts: Vec<&str> = line.split_whitespace().collect();

        if parts.len() != 3 {
            return Err("malformed request line".into());
        }

        let method = HttpMethod::from_string(parts[0]);
        let target = parts[1].to_string();
        let http_version = HttpVersion::from_string(parts[2]);
        if http_version == HttpVersion::Unknown {
            return Err(format!("unsupported HTTP version: {}", parts[2]));
        }

        Ok(Self::new(http_version, method, target))
    }

    pub fn represent(&self) -> String {
        format!("{} {} {}", self.method, self.target, self.http_version)
    }

    /// The path component of the target, without the query string.
    pub fn path(&self) -> &str {
        match self.target.split_once('?') {
            Some((path, _)) => path,
            None => &self.target,
        }
    }

    /// The query string, without the leading `?`. Empty when absent.
    pub fn query(&self) -> &str {
        match self.target.split_once('?') {
            Some((_, query)) => query,
            None => "",
        }
    }
}

impl std::fmt::Display for RequestStartLine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.represent())
    }
}

/// StatusStartLine is the first line of an HTTP response.
#[derive(Debug, Clone)]
pub struct StatusStartLine {
    pub http_version: HttpVersion,
    pub status: StatusCode,
}

impl StatusStartLine {
    pub fn new(http_version: HttpVersion, status: StatusCode) -> Self {
        Self {
            http_version,
            status,
        }
    }

    /// Parses a status line such as `HTTP/1.1 200 OK`. The reason phrase is
    /// accepted but ignored; only the code is meaningful.
    pub fn parse<T: AsRef<str>>(line: T) -> Result<Self, String> {
        let line = line.as_ref();
        let mut parts = line.splitn(3, ' ');
        let version = parts.next().ok_or("empty status line")?;
        let code = parts.next().ok_or("status line missing code")?;

        let http_version = HttpVersion::from_string(version);
        if http_version == HttpVersion::Unknown {
            return Err(format!("unsupported HTTP version: {}", version));
        }
        let code: u16 = code
            .parse()
            .map_err(|_| format!("invalid status code: {}", code))?;

        Ok(Self::new(http_version, StatusCode(code)))
    }

    pub fn represent(&self) -> String {
        format!("{} {}", self.http_version, self.status)
    }
}

impl std::fmt::Display for StatusStartLine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.represent())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn parses_request_line() {
        let line = RequestStartLine::parse("GET /a/b?x=1 HTTP/1.1").unwrap();
        assert_eq!(line.method, HttpMethod::GET);
        assert_eq!(line.path(), "/a/b");
        assert_eq!(line.query(), "x=1");
        assert_eq!(line.http_version, HttpVersion::Http11);
        assert_eq!(line.represent(), "GET /a/b?x=1 HTTP/1.1");
    }

    #[test]
    fn rejects_malformed_request_line() {
        assert!(RequestStartLine::parse("GET /").is_err());
        assert!(RequestStartLine::parse("GET / HTTP/2.0").is_err());
    }

    #[test]
    fn parses_status_line_with_and_without_phrase() {
        let line = StatusStartLine::parse("HTTP/1.1 200 OK").unwrap();
        assert_eq!(line.status, StatusCode::OK);
        let line = StatusStartLine::parse("HTTP/1.0 502").unwrap();
        assert_eq!(line.status.as_u16(), 502);
        assert_eq!(line.http_version, HttpVersion::Http10);
    }
}
