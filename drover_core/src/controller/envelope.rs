//! The framed request envelope of the "session" worker protocol.
//!
//! One message per request: a 4-byte big-endian body size, then
//! NUL-separated key/value pairs. The request body follows on the same
//! connection, and end-of-request is signalled by shutting down the write
//! side. The worker answers with a full HTTP/1.x response.

/// Builder for one envelope.
pub struct SessionEnvelope {
    pairs: Vec<(String, String)>,
}

impl SessionEnvelope {
    pub fn new() -> Self {
        Self { pairs: Vec::new() }
    }

    pub fn push<K: Into<String>, V: Into<String>>(&mut self, key: K, value: V) {
        self.pairs.push((key.into(), value.into()));
    }

    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    /// Serializes the envelope, including the size prefix.
    pub fn encode(&self) -> Vec<u8> {
        let mut body = Vec::with_capacity(256);
        for (key, value) in &self.pairs {
            body.extend_from_slice(key.as_bytes());
            body.push(0);
            body.extend_from_slice(value.as_bytes());
            body.push(0);
        }
        let mut out = Vec::with_capacity(4 + body.len());
        out.extend_from_slice(&(body.len() as u32).to_be_bytes());
        out.extend_from_slice(&body);
        out
    }
}

impl Default for SessionEnvelope {
    fn default() -> Self {
        Self::new()
    }
}

/// Translates an HTTP header name to its CGI-style envelope key:
/// `Content-Type` becomes `HTTP_CONTENT_TYPE`.
pub fn http_header_to_envelope_key(name: &str) -> String {
    let mut key = String::with_capacity(name.len() + 5);
    key.push_str("HTTP_");
    for c in name.chars() {
        if c == '-' {
            key.push('_');
        } else {
            key.push(c.to_ascii_uppercase());
        }
    }
    key
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn encodes_size_prefix_and_nul_separated_pairs() {
        let mut envelope = SessionEnvelope::new();
        envelope.push("REQUEST_METHOD", "GET");
        envelope.push("PATH_INFO", "/");
        let bytes = envelope.encode();

        let body = b"REQUEST_METHOD\0GET\0PATH_INFO\0/\0";
        assert_eq!(&bytes[..4], &(body.len() as u32).to_be_bytes());
        assert_eq!(&bytes[4..], body);
    }

    #[test]
    fn header_names_map_to_cgi_keys() {
        assert_eq!(http_header_to_envelope_key("Content-Type"), "HTTP_CONTENT_TYPE");
        assert_eq!(http_header_to_envelope_key("x-forwarded-for"), "HTTP_X_FORWARDED_FOR");
    }
}
