//! Callback wire protocol
//!
//! The bank notifies us with a plain HTTP request against
//! `https://<host>[:<port>]/<marker>`. TLS is terminated upstream, so the
//! listener only ever sees plaintext HTTP/1.1.
//!
//! # Constraints
//!
//! The parser is deliberately small:
//! - one read of at most [`CALLBACK_BUFFER_SIZE`] bytes
//! - request line and headers only; bodies and chunked encoding are ignored
//! - `GET` and `POST` are accepted identically
//!
//! The notification body is never needed: a request on the marker path is
//! the whole signal.

use std::net::Ipv6Addr;

use crate::error::ProtocolError;
use crate::{CALLBACK_BUFFER_SIZE, HTTPS_PORT};

/// Fixed reply sent for every request, matching or not
pub const CALLBACK_RESPONSE: &[u8] = b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nOK";

/// Header set by reverse proxies carrying the client address
pub const HEADER_REAL_IP: &str = "X-Real-IP";

/// Header carrying the chain of forwarded addresses, client first
pub const HEADER_FORWARDED_FOR: &str = "X-Forwarded-For";

/// Accepted request methods
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
}

impl std::str::FromStr for Method {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "GET" => Ok(Self::Get),
            "POST" => Ok(Self::Post),
            other => Err(ProtocolError::UnsupportedMethod(other.to_string())),
        }
    }
}

/// A parsed callback request
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CallbackRequest {
    pub method: Method,
    /// Percent-decoded request path
    pub path: String,
    /// Header name/value pairs in arrival order
    pub headers: Vec<(String, String)>,
}

impl CallbackRequest {
    /// Parse the head of a request
    pub fn parse(buf: &[u8]) -> Result<Self, ProtocolError> {
        if buf.len() > CALLBACK_BUFFER_SIZE {
            return Err(ProtocolError::TooLarge {
                size: buf.len(),
                max: CALLBACK_BUFFER_SIZE,
            });
        }

        let text = String::from_utf8_lossy(buf);
        let mut lines = text.split("\r\n").flat_map(|l| l.split('\n'));

        let request_line = lines
            .next()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .ok_or(ProtocolError::Empty)?;

        let mut parts = request_line.split_whitespace();
        let (method, target) = match (parts.next(), parts.next()) {
            (Some(m), Some(t)) => (m, t),
            _ => return Err(ProtocolError::MalformedRequestLine(request_line.to_string())),
        };
        let method: Method = method.parse()?;
        if !target.starts_with('/') {
            return Err(ProtocolError::MalformedRequestLine(request_line.to_string()));
        }

        let headers = lines
            .take_while(|l| !l.is_empty())
            .filter_map(|l| {
                let (name, value) = l.split_once(':')?;
                Some((name.trim().to_string(), value.trim().to_string()))
            })
            .collect();

        Ok(Self {
            method,
            path: decode_path(target),
            headers,
        })
    }

    /// First value of a header, name compared case-insensitively
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Client address announced by a reverse proxy
    ///
    /// `X-Real-IP` wins over the first `X-Forwarded-For` entry.
    pub fn forwarded_source(&self) -> Option<&str> {
        if let Some(ip) = self
            .header(HEADER_REAL_IP)
            .and_then(|v| v.split_whitespace().next())
        {
            return Some(ip);
        }
        self.header(HEADER_FORWARDED_FOR)
            .and_then(|v| v.split(',').next())
            .map(str::trim)
            .filter(|v| !v.is_empty())
    }

    /// Whether this request targets the callback endpoint
    pub fn matches_marker(&self, marker: &str) -> bool {
        path_matches_marker(&self.path, marker)
    }
}

/// `/<marker>` or anything below `/<marker>/`
pub fn path_matches_marker(path: &str, marker: &str) -> bool {
    match path.strip_prefix('/').and_then(|p| p.strip_prefix(marker)) {
        Some(rest) => rest.is_empty() || rest.starts_with('/'),
        None => false,
    }
}

/// Public callback URL registered with the bank
///
/// IPv6 literals are bracketed.
pub fn callback_url(host: &str, port: u16, marker: &str) -> String {
    let bracketed;
    let host = if host.parse::<Ipv6Addr>().is_ok() {
        bracketed = format!("[{}]", host);
        bracketed.as_str()
    } else {
        host
    };
    if port == HTTPS_PORT {
        format!("https://{}/{}", host, marker)
    } else {
        format!("https://{}:{}/{}", host, port, marker)
    }
}

fn decode_path(target: &str) -> String {
    let path = target.split(['?', '#']).next().unwrap_or(target);
    String::from_utf8_lossy(&urlencoding::decode_binary(path.as_bytes())).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    const MARKER: &str = "bunq2ynab-autosync";

    #[test]
    fn test_parse_post_with_headers() {
        let raw = b"POST /bunq2ynab-autosync HTTP/1.1\r\nHost: example.com\r\nX-Real-IP: 185.40.108.7\r\nContent-Length: 10\r\n\r\n{\"a\": 1}";
        let req = CallbackRequest::parse(raw).unwrap();

        assert_eq!(req.method, Method::Post);
        assert_eq!(req.path, "/bunq2ynab-autosync");
        assert_eq!(req.header("host"), Some("example.com"));
        assert_eq!(req.headers.len(), 3);
    }

    #[test]
    fn test_get_and_post_match_identically() {
        let get = CallbackRequest::parse(b"GET /bunq2ynab-autosync HTTP/1.1\r\n\r\n").unwrap();
        let post = CallbackRequest::parse(b"POST /bunq2ynab-autosync HTTP/1.1\r\n\r\n").unwrap();
        assert!(get.matches_marker(MARKER));
        assert!(post.matches_marker(MARKER));
    }

    #[test]
    fn test_marker_matching() {
        assert!(path_matches_marker("/bunq2ynab-autosync", MARKER));
        assert!(path_matches_marker("/bunq2ynab-autosync/extra", MARKER));
        assert!(!path_matches_marker("/other", MARKER));
        assert!(!path_matches_marker("/bunq2ynab-autosyncX", MARKER));
        assert!(!path_matches_marker("/", MARKER));
        assert!(!path_matches_marker("bunq2ynab-autosync", MARKER));
    }

    #[test]
    fn test_path_is_percent_decoded() {
        let req = CallbackRequest::parse(b"GET /bunq2ynab%2Dautosync?x=1 HTTP/1.1\r\n\r\n").unwrap();
        assert_eq!(req.path, "/bunq2ynab-autosync");
        assert!(req.matches_marker(MARKER));
    }

    #[test]
    fn test_real_ip_wins_over_forwarded_for() {
        let raw = b"POST /m HTTP/1.1\r\nX-Forwarded-For: 10.0.0.1, 10.0.0.2\r\nx-real-ip: 185.40.108.1\r\n\r\n";
        let req = CallbackRequest::parse(raw).unwrap();
        assert_eq!(req.forwarded_source(), Some("185.40.108.1"));
    }

    #[test]
    fn test_forwarded_for_first_value() {
        let raw = b"POST /m HTTP/1.1\r\nX-Forwarded-For: 185.40.109.4, 10.0.0.2\r\n\r\n";
        let req = CallbackRequest::parse(raw).unwrap();
        assert_eq!(req.forwarded_source(), Some("185.40.109.4"));
    }

    #[test]
    fn test_no_forwarding_headers() {
        let req = CallbackRequest::parse(b"GET /m HTTP/1.1\r\nHost: x\r\n\r\n").unwrap();
        assert_eq!(req.forwarded_source(), None);
    }

    #[test]
    fn test_malformed_requests() {
        assert_eq!(CallbackRequest::parse(b""), Err(ProtocolError::Empty));
        assert!(matches!(
            CallbackRequest::parse(b"GET\r\n\r\n"),
            Err(ProtocolError::MalformedRequestLine(_))
        ));
        assert!(matches!(
            CallbackRequest::parse(b"GET http://evil/ HTTP/1.1\r\n\r\n"),
            Err(ProtocolError::MalformedRequestLine(_))
        ));
        assert_eq!(
            CallbackRequest::parse(b"DELETE /m HTTP/1.1\r\n\r\n"),
            Err(ProtocolError::UnsupportedMethod("DELETE".into()))
        );
    }

    #[test]
    fn test_oversized_request() {
        let raw = vec![b'a'; CALLBACK_BUFFER_SIZE + 1];
        assert!(matches!(
            CallbackRequest::parse(&raw),
            Err(ProtocolError::TooLarge { .. })
        ));
    }

    #[test]
    fn test_callback_url_formatting() {
        assert_eq!(
            callback_url("app.example.com", 443, MARKER),
            "https://app.example.com/bunq2ynab-autosync"
        );
        assert_eq!(
            callback_url("203.0.113.9", 8443, MARKER),
            "https://203.0.113.9:8443/bunq2ynab-autosync"
        );
    }

    #[test]
    fn test_callback_url_brackets_ipv6() {
        assert_eq!(
            callback_url("2001:db8::1", 8443, MARKER),
            "https://[2001:db8::1]:8443/bunq2ynab-autosync"
        );
        assert_eq!(
            callback_url("2001:db8::1", 443, MARKER),
            "https://[2001:db8::1]/bunq2ynab-autosync"
        );
    }

    #[test]
    fn test_response_is_fixed() {
        assert_eq!(
            CALLBACK_RESPONSE,
            b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nOK"
        );
    }
}
