//! HTTP message type
//!
//! One [`Msg`] value covers requests, responses and push promises: the
//! pseudo-headers (method, scheme, authority, path, status) map directly
//! onto HTTP/2 and are synthesized when parsing HTTP/1.1. Header names are
//! compared case-insensitively on lookup; insertion order is preserved.

use std::fmt;

/// What a message (or a stream direction) carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MsgKind {
    Request,
    Response,
    PushPromise,
    PushResponse,
}

impl MsgKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MsgKind::Request => "REQUEST",
            MsgKind::Response => "RESPONSE",
            MsgKind::PushPromise => "PUSH_PROMISE",
            MsgKind::PushResponse => "PUSH_RESPONSE",
        }
    }
}

/// An HTTP message: pseudo-headers, ordered header pairs and an opaque body.
#[derive(Debug, Clone, Default)]
pub struct Msg {
    method: Option<String>,
    scheme: Option<String>,
    authority: Option<String>,
    path: Option<String>,
    status: u16,
    headers: Vec<(String, String)>,
    body: Vec<u8>,
}

impl Msg {
    /// Create an empty message
    pub fn new() -> Self {
        Msg::default()
    }

    /// Create a request with method and path set
    pub fn request(method: impl Into<String>, path: impl Into<String>) -> Self {
        let mut msg = Msg::new();
        msg.method = Some(method.into());
        msg.path = Some(path.into());
        msg
    }

    /// Create a response with the status set
    pub fn response(status: u16) -> Self {
        let mut msg = Msg::new();
        msg.status = status;
        msg
    }

    /// Create a response to a request, carrying the proxying header over
    pub fn response_to(req: &Msg, status: u16) -> Self {
        let mut rsp = Msg::response(status);
        rsp.copy_header(req, "x-forwarded-for");
        rsp
    }

    /// Create a push-promise request reusing the scheme and authority of
    /// the request it rides on
    pub fn promise_from(
        req: &Msg,
        method: impl Into<String>,
        path: impl Into<String>,
    ) -> Self {
        let mut prm = Msg::request(method, path);
        if let Some(scheme) = req.scheme() {
            prm.set_scheme(scheme);
        }
        if let Some(authority) = req.authority() {
            prm.set_authority(authority);
        }
        prm
    }

    /// Copy a header from `src` if present; returns true when copied
    pub fn copy_header(&mut self, src: &Msg, name: &str) -> bool {
        match src.header(name) {
            Some(value) => {
                let value = value.to_string();
                self.add_header(name, value);
                true
            }
            None => false,
        }
    }

    pub fn method(&self) -> Option<&str> {
        self.method.as_deref()
    }

    pub fn scheme(&self) -> Option<&str> {
        self.scheme.as_deref()
    }

    pub fn authority(&self) -> Option<&str> {
        self.authority.as_deref()
    }

    pub fn path(&self) -> Option<&str> {
        self.path.as_deref()
    }

    pub fn status(&self) -> u16 {
        self.status
    }

    pub fn set_method(&mut self, method: impl Into<String>) {
        self.method = Some(method.into());
    }

    pub fn set_scheme(&mut self, scheme: impl Into<String>) {
        self.scheme = Some(scheme.into());
    }

    pub fn set_authority(&mut self, authority: impl Into<String>) {
        self.authority = Some(authority.into());
    }

    pub fn set_path(&mut self, path: impl Into<String>) {
        self.path = Some(path.into());
    }

    pub fn set_status(&mut self, status: u16) {
        self.status = status;
    }

    /// Get the first value for a header (case-insensitive)
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Append a header pair; duplicates are not checked
    pub fn add_header(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.headers.push((name.into(), value.into()));
    }

    /// Update the first matching header or append a new one
    pub fn set_header(&mut self, name: &str, value: impl Into<String>) {
        let value = value.into();
        match self
            .headers
            .iter_mut()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
        {
            Some((_, v)) => *v = value,
            None => self.headers.push((name.to_string(), value)),
        }
    }

    /// Remove all instances of a header; returns how many were removed
    pub fn del_header(&mut self, name: &str) -> usize {
        let before = self.headers.len();
        self.headers.retain(|(n, _)| !n.eq_ignore_ascii_case(name));
        before - self.headers.len()
    }

    /// Iterate over all header pairs in insertion order
    pub fn headers(&self) -> impl Iterator<Item = (&str, &str)> {
        self.headers.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    pub fn header_count(&self) -> usize {
        self.headers.len()
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    pub fn body_len(&self) -> usize {
        self.body.len()
    }

    pub fn set_body(&mut self, body: Vec<u8>) {
        self.body = body;
    }

    pub fn append_body(&mut self, chunk: &[u8]) {
        self.body.extend_from_slice(chunk);
    }

    pub fn take_body(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.body)
    }

    /// Multi-line dump used by verbose logging
    pub fn dump(&self, line_prefix: &str) -> String {
        let mut out = String::new();
        if let Some(m) = self.method() {
            out.push_str(&format!("{}    :method = {}\n", line_prefix, m));
        }
        if let Some(s) = self.scheme() {
            out.push_str(&format!("{}    :scheme = {}\n", line_prefix, s));
        }
        if let Some(a) = self.authority() {
            out.push_str(&format!("{}    :authority = {}\n", line_prefix, a));
        }
        if let Some(p) = self.path() {
            out.push_str(&format!("{}    :path = {}\n", line_prefix, p));
        }
        if self.status != 0 {
            out.push_str(&format!("{}    :status = {}\n", line_prefix, self.status));
        }
        for (n, v) in self.headers() {
            out.push_str(&format!("{}    {} = {}\n", line_prefix, n, v));
        }
        if !self.body.is_empty() {
            out.push_str(&format!("{}    <body {} bytes>\n", line_prefix, self.body.len()));
        }
        out
    }
}

impl fmt::Display for Msg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.status != 0 {
            write!(f, "response {}", self.status)
        } else {
            write!(
                f,
                "{} {}",
                self.method().unwrap_or("-"),
                self.path().unwrap_or("-")
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_constructor() {
        let req = Msg::request("GET", "/index.html");
        assert_eq!(req.method(), Some("GET"));
        assert_eq!(req.path(), Some("/index.html"));
        assert_eq!(req.status(), 0);
    }

    #[test]
    fn test_header_lookup_case_insensitive() {
        let mut msg = Msg::new();
        msg.add_header("Content-Type", "text/plain");
        assert_eq!(msg.header("content-type"), Some("text/plain"));
        assert_eq!(msg.header("CONTENT-TYPE"), Some("text/plain"));
        assert_eq!(msg.header("content-length"), None);
    }

    #[test]
    fn test_set_header_updates_in_place() {
        let mut msg = Msg::new();
        msg.add_header("x-a", "1");
        msg.add_header("x-b", "2");
        msg.set_header("X-A", "3");
        assert_eq!(msg.header("x-a"), Some("3"));
        assert_eq!(msg.header_count(), 2);
    }

    #[test]
    fn test_del_header() {
        let mut msg = Msg::new();
        msg.add_header("x-a", "1");
        msg.add_header("X-A", "2");
        msg.add_header("x-b", "3");
        assert_eq!(msg.del_header("x-a"), 2);
        assert_eq!(msg.header_count(), 1);
        assert_eq!(msg.header("x-b"), Some("3"));
    }

    #[test]
    fn test_headers_keep_insertion_order() {
        let mut msg = Msg::new();
        msg.add_header("b", "2");
        msg.add_header("a", "1");
        let names: Vec<&str> = msg.headers().map(|(n, _)| n).collect();
        assert_eq!(names, vec!["b", "a"]);
    }

    #[test]
    fn test_response_to_carries_proxy_header() {
        let mut req = Msg::request("GET", "/");
        req.add_header("x-forwarded-for", "10.0.0.1");
        req.add_header("x-other", "ignored");
        let rsp = Msg::response_to(&req, 200);
        assert_eq!(rsp.status(), 200);
        assert_eq!(rsp.header("x-forwarded-for"), Some("10.0.0.1"));
        assert_eq!(rsp.header("x-other"), None);
    }

    #[test]
    fn test_promise_from_reuses_origin() {
        let mut req = Msg::request("GET", "/index.html");
        req.set_scheme("https");
        req.set_authority("example.com:443");
        let prm = Msg::promise_from(&req, "GET", "/style.css");
        assert_eq!(prm.method(), Some("GET"));
        assert_eq!(prm.path(), Some("/style.css"));
        assert_eq!(prm.scheme(), Some("https"));
        assert_eq!(prm.authority(), Some("example.com:443"));
    }

    #[test]
    fn test_body_roundtrip() {
        let mut msg = Msg::new();
        msg.set_body(b"hello".to_vec());
        msg.append_body(b" world");
        assert_eq!(msg.body(), b"hello world");
        assert_eq!(msg.body_len(), 11);
    }
}
