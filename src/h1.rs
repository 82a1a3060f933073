//! HTTP/1.1 support: incremental parser, wire serializers and the
//! line-based send path
//!
//! The parser is restartable across arbitrary chunk boundaries. Bytes
//! accumulate in the session's [`ReadBuf`](crate::buf::ReadBuf); each pass
//! consumes complete lines (CRLF or bare LF) until the empty line, then
//! waits for `Content-Length` bytes of body. Streams are touched in FIFO
//! order: a server parses into the stream being constructed at the tail, a
//! client parses into the head stream awaiting its response.
//!
//! Chunked transfer encoding and folded (multi-line) headers are not
//! supported; a chunked message is rejected as a parse error.

use bytes::Bytes;
use log::warn;

use crate::h2::codec::StreamId;
use crate::io::IoKind;
use crate::msg::{Msg, MsgKind};
use crate::session::{ResponseCb, Role, SendBuf, Session, Stream, Term};
use crate::{CloseReason, Error, Result};

fn is_ws(b: u8) -> bool {
    b == b' ' || b == b'\t'
}

/// Canonical reason phrase for a status code.
pub fn reason_phrase(status: u16) -> &'static str {
    match status {
        100 => "Continue",
        101 => "Switching Protocols",
        200 => "OK",
        201 => "Created",
        202 => "Accepted",
        203 => "Non-Authoritative Information",
        204 => "No Content",
        205 => "Reset Content",
        206 => "Partial Content",
        300 => "Multiple Choices",
        301 => "Moved Permanently",
        302 => "Found",
        303 => "See Other",
        304 => "Not Modified",
        305 => "Use Proxy",
        307 => "Temporary Redirect",
        400 => "Bad Request",
        401 => "Unauthorized",
        402 => "Payment Required",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        406 => "Not Acceptable",
        407 => "Proxy Authentication Required",
        408 => "Request Timeout",
        409 => "Conflict",
        410 => "Gone",
        411 => "Length Required",
        412 => "Precondition Failed",
        413 => "Payload Too Large",
        414 => "URI Too Long",
        415 => "Unsupported Media Type",
        416 => "Range Not Satisfiable",
        417 => "Expectation Failed",
        500 => "Internal Server Error",
        501 => "Not Implemented",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        504 => "Gateway Timeout",
        505 => "HTTP Version Not Supported",
        _ => "Unknown",
    }
}

/// Serialize a request for the wire.
pub(crate) fn encode_request(req: &Msg, single_req: bool) -> Bytes {
    let mut buf = Vec::with_capacity(256 + req.body_len());
    buf.extend_from_slice(req.method().unwrap_or("GET").as_bytes());
    buf.push(b' ');
    buf.extend_from_slice(req.path().unwrap_or("/").as_bytes());
    buf.extend_from_slice(b" HTTP/1.1\r\n");
    if let Some(authority) = req.authority() {
        buf.extend_from_slice(b"host: ");
        buf.extend_from_slice(authority.as_bytes());
        buf.extend_from_slice(b"\r\n");
    }
    if req.body_len() > 0 {
        buf.extend_from_slice(format!("content-length: {}\r\n", req.body_len()).as_bytes());
    }
    if single_req {
        buf.extend_from_slice(b"connection: close\r\n");
    }
    for (name, value) in req.headers() {
        buf.extend_from_slice(name.as_bytes());
        buf.extend_from_slice(b": ");
        buf.extend_from_slice(value.as_bytes());
        buf.extend_from_slice(b"\r\n");
    }
    buf.extend_from_slice(b"\r\n");
    buf.extend_from_slice(req.body());
    Bytes::from(buf)
}

/// Serialize a response for the wire.
pub(crate) fn encode_response(rsp: &Msg, single_req: bool) -> Bytes {
    let mut buf = Vec::with_capacity(256 + rsp.body_len());
    buf.extend_from_slice(
        format!("HTTP/1.1 {} {}\r\n", rsp.status(), reason_phrase(rsp.status())).as_bytes(),
    );
    if rsp.body_len() > 0 {
        buf.extend_from_slice(format!("content-length: {}\r\n", rsp.body_len()).as_bytes());
    }
    if single_req {
        buf.extend_from_slice(b"connection: close\r\n");
    }
    for (name, value) in rsp.headers() {
        buf.extend_from_slice(name.as_bytes());
        buf.extend_from_slice(b": ");
        buf.extend_from_slice(value.as_bytes());
        buf.extend_from_slice(b"\r\n");
    }
    buf.extend_from_slice(b"\r\n");
    buf.extend_from_slice(rsp.body());
    Bytes::from(buf)
}

impl Session {
    pub(crate) fn h1_send_request(
        &mut self,
        req: &Msg,
        response_cb: Option<ResponseCb>,
        user_data: Option<Box<dyn std::any::Any>>,
    ) -> Result<StreamId> {
        let data = encode_request(req, self.settings.single_req);
        let sid = (self.req_cnt * 2 + 1) as StreamId;
        let mut strm = Stream::new(sid, MsgKind::Response);
        strm.is_req = true;
        strm.response_cb = response_cb;
        strm.user_data = user_data;
        if self.settings.single_req {
            strm.close_sess = true;
        }
        strm.send_buf = SendBuf { data, used: 0 };
        self.streams.push_back(strm);
        self.req_cnt += 1;
        self.mark_send_pending();
        self.send_step()?;
        Ok(sid)
    }

    pub(crate) fn h1_send_response(&mut self, stream: StreamId, rsp: &Msg) -> Result<()> {
        let idx = self
            .stream_idx(stream)
            .ok_or_else(|| Error::Protocol(format!("unknown stream: {}", stream)))?;
        let single = self.settings.single_req;
        let data = encode_response(rsp, single);
        let strm = &mut self.streams[idx];
        strm.send_buf = SendBuf { data, used: 0 };
        strm.is_rsp_set = true;
        if single {
            strm.close_sess = true;
        }
        self.rsp_cnt += 1;
        self.mark_send_pending();
        Ok(())
    }

    /// Stage stream send data into the write buffer.
    ///
    /// A server walks the FIFO prefix of answered streams, retiring the
    /// ones whose data has fully left the buffer; a client takes the first
    /// stream that still has unsent bytes.
    pub(crate) fn fill_from_streams(&mut self) {
        while !self.wr.has_tail() && self.wr.merge_room() > 0 {
            let mut span: Option<Bytes> = None;
            if self.role() == Role::Server {
                while let Some(front) = self.streams.front() {
                    if !front.is_rsp_set {
                        break;
                    }
                    if front.send_buf.is_drained() {
                        let strm = self.streams.pop_front().expect("front checked");
                        self.strm_close_cnt += 1;
                        if strm.close_sess {
                            self.set_close_after_flush();
                        }
                        continue;
                    }
                    let strm = self.streams.front_mut().expect("front checked");
                    let s = strm.send_buf.data.slice(strm.send_buf.used..);
                    strm.send_buf.used = strm.send_buf.data.len();
                    span = Some(s);
                    break;
                }
            } else {
                for strm in self.streams.iter_mut() {
                    if strm.send_buf.is_drained() {
                        continue;
                    }
                    let s = strm.send_buf.data.slice(strm.send_buf.used..);
                    strm.send_buf.used = strm.send_buf.data.len();
                    span = Some(s);
                    break;
                }
            }
            let Some(s) = span else { break };
            if s.len() <= self.wr.merge_room() {
                self.wr.push_merge(&s);
            } else {
                self.wr.set_tail(s);
                break;
            }
        }
    }

    /// Feed a received chunk to the parser and deliver as many complete
    /// messages as the buffer holds.
    pub(crate) fn recv_h1(&mut self, data: &[u8]) -> Result<usize> {
        self.rd.push(data);
        loop {
            let complete = match self.parse_h1_once() {
                Ok(c) => c,
                Err(e) => {
                    if self.close_reason.is_none() {
                        self.close_reason = Some(CloseReason::HttpErr);
                    }
                    warn!("{}HTTP/1.1 read error: {}", self.log_prefix(), e);
                    return Err(e);
                }
            };
            if !complete {
                break;
            }
            if self.rd.is_drained()
                || self.term == Term::Closed
                || (self.term == Term::Draining && self.req_cnt == self.rsp_cnt)
            {
                break;
            }
        }
        self.rd.reclaim();
        Ok(data.len())
    }

    /// One message-parse attempt. `Ok(true)` when a message completed and
    /// its callbacks ran.
    fn parse_h1_once(&mut self) -> Result<bool> {
        if self.h1.recving.is_none() {
            if self.role() == Role::Server {
                let sid = (self.req_cnt * 2 + 1) as StreamId;
                self.streams.push_back(Stream::new(sid, MsgKind::Request));
                self.h1.recving = Some(sid);
            } else {
                let sid = match self.streams.front() {
                    Some(s) => s.id,
                    None => {
                        warn!(
                            "{}HTTP/1.1 response received for no request at {}",
                            self.log_prefix(),
                            self.rd.position()
                        );
                        return Err(Error::Parse("response with no outstanding request".into()));
                    }
                };
                self.h1.recving = Some(sid);
            }
            self.h1.header_done = false;
            self.h1.header_line = 0;
            self.h1.content_length = 0;
        }
        let sid = self.h1.recving.expect("set above");

        if !self.h1.header_done {
            loop {
                let (line, consumed) = {
                    let unread = self.rd.unread();
                    let Some(nl) = unread.iter().position(|&b| b == b'\n') else {
                        break;
                    };
                    let mut end = nl;
                    if end > 0 && unread[end - 1] == b'\r' {
                        end -= 1;
                    }
                    (unread[..end].to_vec(), nl + 1)
                };
                self.rd.consume(consumed);
                if line.is_empty() {
                    self.h1.header_done = true;
                    break;
                }
                if self.h1.header_line == 0 {
                    if self.role() == Role::Server {
                        self.parse_request_line(sid, &line)?;
                    } else {
                        self.parse_status_line(sid, &line)?;
                    }
                } else {
                    self.parse_header_line(sid, &line)?;
                }
                self.h1.header_line += 1;
            }
        }

        if self.h1.header_done {
            let cl = self.h1.content_length;
            let idx = match self.stream_idx(sid) {
                Some(i) => i,
                None => return Ok(false),
            };
            if cl > 0 && self.streams[idx].rmsg.body_len() == 0 {
                if self.rd.unread().len() >= cl {
                    let body = self.rd.unread()[..cl].to_vec();
                    self.streams[idx].rmsg.set_body(body);
                    self.rd.consume(cl);
                }
            }
            if cl == self.streams[idx].rmsg.body_len() {
                self.h1.recving = None;
                if self.role() == Role::Server {
                    self.req_cnt += 1;
                    self.deliver_request(sid)?;
                } else {
                    let close_sess = self.streams[idx].close_sess;
                    self.deliver_response(sid)?;
                    self.remove_stream(sid);
                    self.strm_close_cnt += 1;
                    if close_sess {
                        self.terminate(false);
                    }
                }
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// `METHOD SP PATH SP HTTP/1.1`
    fn parse_request_line(&mut self, sid: StreamId, line: &[u8]) -> Result<()> {
        if line.len() < 1 + 1 + 1 + 1 + 8 || &line[line.len() - 8..] != b"HTTP/1.1" {
            warn!(
                "{}HTTP/1.1 request line parse failed at {}",
                self.log_prefix(),
                self.rd.position()
            );
            self.close_reason = Some(CloseReason::HttpErr);
            return Err(Error::Parse("request line".into()));
        }
        let mut end = line.len() - 8;
        while end > 1 + 1 + 1 && is_ws(line[end - 1]) {
            end -= 1;
        }
        let line = &line[..end];
        let method_end = line
            .iter()
            .position(|&b| is_ws(b))
            .unwrap_or(line.len());
        let method = String::from_utf8_lossy(&line[..method_end]).into_owned();
        let mut q = method_end;
        while q < line.len() && is_ws(line[q]) {
            q += 1;
        }
        let path = String::from_utf8_lossy(&line[q..]).into_owned();
        let scheme = if self.io.kind() == IoKind::Tls {
            "https"
        } else {
            "http"
        };

        let idx = self.stream_idx(sid).expect("receiving stream exists");
        let rmsg = &mut self.streams[idx].rmsg;
        rmsg.set_method(method);
        rmsg.set_scheme(scheme);
        // placeholder until the Host header arrives
        rmsg.set_authority("http");
        rmsg.set_path(path);
        Ok(())
    }

    /// `[HTTP/1.1 ]STATUS[ REASON]`; the reason phrase is ignored
    fn parse_status_line(&mut self, sid: StreamId, line: &[u8]) -> Result<()> {
        let mut s = line;
        if s.starts_with(b"HTTP/") {
            let tok_end = s.iter().position(|&b| is_ws(b)).unwrap_or(s.len());
            s = &s[tok_end..];
            while !s.is_empty() && is_ws(s[0]) {
                s = &s[1..];
            }
        }
        let valid = s.len() >= 3
            && (b'1'..=b'5').contains(&s[0])
            && s[1].is_ascii_digit()
            && s[2].is_ascii_digit()
            && (s.len() == 3 || is_ws(s[3]));
        if !valid {
            warn!(
                "{}HTTP/1.1 status line parse failed at {}",
                self.log_prefix(),
                self.rd.position()
            );
            self.close_reason = Some(CloseReason::HttpErr);
            return Err(Error::Parse("status line".into()));
        }
        let status = (s[0] - b'0') as u16 * 100 + (s[1] - b'0') as u16 * 10 + (s[2] - b'0') as u16;
        let idx = self.stream_idx(sid).expect("receiving stream exists");
        self.streams[idx].rmsg.set_status(status);
        Ok(())
    }

    /// `name: value`, with the value trimmed of surrounding whitespace
    fn parse_header_line(&mut self, sid: StreamId, line: &[u8]) -> Result<()> {
        let Some(colon) = line.iter().position(|&b| b == b':') else {
            warn!(
                "{}HTTP/1.1 message header parse failed at {}",
                self.log_prefix(),
                self.rd.position()
            );
            self.close_reason = Some(CloseReason::HttpErr);
            return Err(Error::Parse("header line".into()));
        };
        let name = &line[..colon];
        let mut value = &line[colon + 1..];
        while !value.is_empty() && is_ws(value[0]) {
            value = &value[1..];
        }
        while !value.is_empty() && is_ws(value[value.len() - 1]) {
            value = &value[..value.len() - 1];
        }

        let idx = self.stream_idx(sid).expect("receiving stream exists");
        if name.eq_ignore_ascii_case(b"host") && self.role() == Role::Server {
            let authority = String::from_utf8_lossy(value).into_owned();
            self.streams[idx].rmsg.set_authority(authority);
        } else if name.eq_ignore_ascii_case(b"content-length") {
            let text = String::from_utf8_lossy(value);
            self.h1.content_length = text.parse().map_err(|_| {
                self.close_reason = Some(CloseReason::HttpErr);
                Error::Parse(format!("invalid content-length: {}", text))
            })?;
        } else if name.eq_ignore_ascii_case(b"connection") {
            if value.eq_ignore_ascii_case(b"close") {
                self.streams[idx].close_sess = true;
            }
        } else if name.eq_ignore_ascii_case(b"keep-alive") {
            // ignored
        } else if name.eq_ignore_ascii_case(b"transfer-encoding") {
            warn!(
                "{}HTTP/1.1 chunked transfer encoding is not supported at {}",
                self.log_prefix(),
                self.rd.position()
            );
            self.close_reason = Some(CloseReason::HttpErr);
            return Err(Error::Parse("transfer-encoding not supported".into()));
        } else {
            let name = String::from_utf8_lossy(name).into_owned();
            let value = String::from_utf8_lossy(value).into_owned();
            self.streams[idx].rmsg.add_header(name, value);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{request_cb, response_cb};
    use crate::testutil::{h1_session, MockIo, SharedIoState};
    use std::cell::RefCell;
    use std::rc::Rc;

    fn server_collecting(requests: Rc<RefCell<Vec<Msg>>>) -> Session {
        let mut sess = h1_session(Role::Server, MockIo::new(SharedIoState::new()));
        sess.cbs.request = Some(request_cb(move |_s, _sid, req| {
            requests.borrow_mut().push(req.clone());
            0
        }));
        sess
    }

    #[test]
    fn test_encode_request() {
        let mut req = Msg::request("GET", "/");
        req.set_authority("example.com:80");
        req.add_header("accept", "*/*");
        let wire = encode_request(&req, false);
        assert_eq!(
            &wire[..],
            b"GET / HTTP/1.1\r\nhost: example.com:80\r\naccept: */*\r\n\r\n".as_slice()
        );
    }

    #[test]
    fn test_encode_request_with_body_and_close() {
        let mut req = Msg::request("POST", "/x");
        req.set_authority("h:80");
        req.set_body(b"hello".to_vec());
        let wire = encode_request(&req, true);
        let text = std::str::from_utf8(&wire).unwrap();
        assert!(text.starts_with("POST /x HTTP/1.1\r\n"));
        assert!(text.contains("content-length: 5\r\n"));
        assert!(text.contains("connection: close\r\n"));
        assert!(text.ends_with("\r\n\r\nhello"));
    }

    #[test]
    fn test_encode_response() {
        let mut rsp = Msg::response(200);
        rsp.set_body(b"OK".to_vec());
        let wire = encode_response(&rsp, false);
        assert_eq!(
            &wire[..],
            b"HTTP/1.1 200 OK\r\ncontent-length: 2\r\n\r\nOK".as_slice()
        );
    }

    #[test]
    fn test_reason_phrase() {
        assert_eq!(reason_phrase(200), "OK");
        assert_eq!(reason_phrase(404), "Not Found");
        assert_eq!(reason_phrase(599), "Unknown");
    }

    #[test]
    fn test_parse_get_round_trip_fields() {
        let requests = Rc::new(RefCell::new(Vec::new()));
        let mut sess = server_collecting(requests.clone());
        sess.recv_h1(b"GET /a HTTP/1.1\r\nHost: h:80\r\n\r\n").unwrap();

        let reqs = requests.borrow();
        assert_eq!(reqs.len(), 1);
        assert_eq!(reqs[0].method(), Some("GET"));
        assert_eq!(reqs[0].path(), Some("/a"));
        assert_eq!(reqs[0].authority(), Some("h:80"));
        assert_eq!(reqs[0].scheme(), Some("http"));
        assert_eq!(sess.req_cnt, 1);
    }

    #[test]
    fn test_parse_post_with_body() {
        let requests = Rc::new(RefCell::new(Vec::new()));
        let mut sess = server_collecting(requests.clone());
        sess.recv_h1(b"POST /x HTTP/1.1\r\nHost: h:80\r\nContent-Length: 5\r\n\r\nhello")
            .unwrap();

        let reqs = requests.borrow();
        assert_eq!(reqs.len(), 1);
        assert_eq!(reqs[0].method(), Some("POST"));
        assert_eq!(reqs[0].path(), Some("/x"));
        assert_eq!(reqs[0].body(), b"hello");
    }

    #[test]
    fn test_parse_is_chunk_agnostic() {
        // any partition of a valid message yields exactly one identical
        // message-complete event
        let msg = b"POST /chunky HTTP/1.1\r\nHost: h:80\r\nX-Tag: v\r\nContent-Length: 11\r\n\r\nhello world";
        let partitions: Vec<Vec<&[u8]>> = vec![
            vec![&msg[..]],
            msg.chunks(1).collect(),
            msg.chunks(7).collect(),
            vec![&msg[..3], &msg[3..40], &msg[40..41], &msg[41..]],
        ];

        for chunks in partitions {
            let requests = Rc::new(RefCell::new(Vec::new()));
            let mut sess = server_collecting(requests.clone());
            for chunk in chunks {
                sess.recv_h1(chunk).unwrap();
            }
            let reqs = requests.borrow();
            assert_eq!(reqs.len(), 1);
            assert_eq!(reqs[0].method(), Some("POST"));
            assert_eq!(reqs[0].path(), Some("/chunky"));
            assert_eq!(reqs[0].header("x-tag"), Some("v"));
            assert_eq!(reqs[0].body(), b"hello world");
        }
    }

    #[test]
    fn test_parse_two_pipelined_requests_in_one_chunk() {
        let requests = Rc::new(RefCell::new(Vec::new()));
        let mut sess = server_collecting(requests.clone());
        sess.recv_h1(
            b"GET /1 HTTP/1.1\r\nHost: h:80\r\n\r\nGET /2 HTTP/1.1\r\nHost: h:80\r\n\r\n",
        )
        .unwrap();
        let reqs = requests.borrow();
        assert_eq!(reqs.len(), 2);
        assert_eq!(reqs[0].path(), Some("/1"));
        assert_eq!(reqs[1].path(), Some("/2"));
        assert_eq!(sess.req_cnt, 2);
    }

    #[test]
    fn test_parse_header_value_trimmed() {
        let requests = Rc::new(RefCell::new(Vec::new()));
        let mut sess = server_collecting(requests.clone());
        sess.recv_h1(b"GET / HTTP/1.1\r\nHost: h:80\r\nX-Pad: \t padded \t\r\n\r\n")
            .unwrap();
        assert_eq!(requests.borrow()[0].header("x-pad"), Some("padded"));
    }

    #[test]
    fn test_parse_bare_lf_line_endings() {
        let requests = Rc::new(RefCell::new(Vec::new()));
        let mut sess = server_collecting(requests.clone());
        sess.recv_h1(b"GET /lf HTTP/1.1\nHost: h:80\n\n").unwrap();
        assert_eq!(requests.borrow()[0].path(), Some("/lf"));
    }

    #[test]
    fn test_parse_request_line_without_version_fails() {
        let requests = Rc::new(RefCell::new(Vec::new()));
        let mut sess = server_collecting(requests.clone());
        let r = sess.recv_h1(b"GET /a\r\nHost: h:80\r\n\r\n");
        assert!(r.is_err());
        assert_eq!(sess.close_reason, Some(CloseReason::HttpErr));
    }

    #[test]
    fn test_parse_chunked_body_rejected() {
        let requests = Rc::new(RefCell::new(Vec::new()));
        let mut sess = server_collecting(requests.clone());
        let r = sess.recv_h1(
            b"POST /c HTTP/1.1\r\nHost: h:80\r\nTransfer-Encoding: chunked\r\n\r\n",
        );
        assert!(r.is_err());
        assert_eq!(sess.close_reason, Some(CloseReason::HttpErr));
    }

    #[test]
    fn test_parse_status_line_forms() {
        for wire in [
            b"HTTP/1.1 200 OK\r\ncontent-length: 2\r\n\r\nOK".as_slice(),
            b"200 OK\r\ncontent-length: 2\r\n\r\nOK".as_slice(),
            b"204\r\n\r\n".as_slice(),
        ] {
            let state = SharedIoState::new();
            let mut sess = h1_session(Role::Client, MockIo::new(state));
            let status = Rc::new(RefCell::new(0u16));
            let status2 = status.clone();
            let mut req = Msg::request("GET", "/");
            req.set_authority("h:80");
            sess.send_request(
                req,
                Some(response_cb(move |_s, _sid, rsp| {
                    *status2.borrow_mut() = rsp.unwrap().status();
                    0
                })),
                None,
            )
            .unwrap();
            sess.recv_h1(wire).unwrap();
            assert!(*status.borrow() == 200 || *status.borrow() == 204);
        }
    }

    #[test]
    fn test_parse_bad_status_line_fails() {
        let state = SharedIoState::new();
        let mut sess = h1_session(Role::Client, MockIo::new(state));
        let mut req = Msg::request("GET", "/");
        req.set_authority("h:80");
        sess.send_request(req, None, None).unwrap();
        assert!(sess.recv_h1(b"999 Nope\r\n\r\n").is_err());
        assert_eq!(sess.close_reason, Some(CloseReason::HttpErr));
    }

    #[test]
    fn test_response_with_no_outstanding_request_fails() {
        let state = SharedIoState::new();
        let mut sess = h1_session(Role::Client, MockIo::new(state));
        assert!(sess.recv_h1(b"HTTP/1.1 200 OK\r\n\r\n").is_err());
    }

    #[test]
    fn test_read_buffer_reclaimed_after_large_body() {
        let requests = Rc::new(RefCell::new(Vec::new()));
        let mut sess = server_collecting(requests.clone());
        let body = vec![b'q'; 3 * crate::buf::RD_ALLOC_DEFAULT];
        let mut wire = format!(
            "POST /big HTTP/1.1\r\nHost: h:80\r\nContent-Length: {}\r\n\r\n",
            body.len()
        )
        .into_bytes();
        wire.extend_from_slice(&body);

        sess.recv_h1(&wire).unwrap();
        assert_eq!(requests.borrow()[0].body_len(), body.len());
        // the grown accumulator was released once fully drained
        assert_eq!(sess.rd.capacity(), 0);
    }

    #[test]
    fn test_connection_close_from_client_closes_after_response() {
        let requests = Rc::new(RefCell::new(Vec::new()));
        let state = SharedIoState::new();
        let mut sess = h1_session(Role::Server, MockIo::new(state.clone()));
        let requests2 = requests.clone();
        sess.cbs.request = Some(request_cb(move |sess, sid, req| {
            requests2.borrow_mut().push(req.clone());
            let _ = sess.send_response_simple(sid, 200, None, b"bye");
            0
        }));
        sess.recv_h1(b"GET / HTTP/1.1\r\nHost: h:80\r\nConnection: close\r\n\r\n")
            .unwrap();
        sess.send_step().unwrap();
        assert!(sess.is_terminated());
        assert!(state.shutdown_both_called());
        let wire = String::from_utf8(state.written()).unwrap();
        assert!(wire.contains("bye"));
    }
}
