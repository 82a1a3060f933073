//! Session: one established transport connection
//!
//! A session owns its socket (or TLS stream), its write and read buffers,
//! the FIFO list of streams multiplexed on it and, for HTTP/2, the codec
//! handle. The readiness loop in [`crate::ctx`] delivers read/write events
//! here; everything else (parsing, callback dispatch, termination) happens
//! on this thread inside those steps.
//!
//! # Send path
//!
//! `send_step` repeats `send_once` until no progress is made. One
//! `send_once` stages outgoing data (pulled from the codec on HTTP/2, from
//! stream send buffers on HTTP/1.1) into the two-stage [`WriteBuf`], then
//! attempts at most one write per stage. Transient write failures mark the
//! session send-pending so the loop re-polls for writability; a partial
//! write compacts the merge buffer or advances the tail offset, never
//! re-staging, so a blocked TLS write is always retried with the identical
//! span.

use std::any::Any;
use std::cell::RefCell;
use std::collections::VecDeque;
use std::io;
use std::rc::Rc;
use std::time::Instant;

use bytes::Bytes;
use log::{debug, info, warn};

use crate::buf::{ReadBuf, WriteBuf};
use crate::h2::codec::{FrameCodec, Settings, StreamId};
use crate::io::{IoKind, SessionIo};
use crate::msg::{Msg, MsgKind};
use crate::{CloseReason, Error, HttpVer, Result, RD_BUF_SIZE};

/// Which end of the connection this session is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

/// Closing state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Term {
    Open,
    /// No new requests; in-flight responses still drain
    Draining,
    /// Closing now
    Closed,
}

/// Result of [`Session::terminate`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TermStatus {
    Done,
    /// The session was already terminated; the call had no effect
    Already,
}

/// Server-side request callback.
///
/// Return 0 when the request was handled (a response was or will be sent),
/// a positive status code to have the engine send a no-body response, or a
/// negative value to signal an error (the engine answers 500).
pub type RequestCb = Rc<RefCell<dyn FnMut(&mut Session, StreamId, &Msg) -> i32>>;

/// Client-side response callback; `None` means the stream was reset or the
/// session closed before a response arrived. Negative return fails the
/// session.
pub type ResponseCb = Rc<RefCell<dyn FnMut(&mut Session, StreamId, Option<&Msg>) -> i32>>;

/// Client-side push promise callback. Return user data to accept the
/// promised stream, or `None` to have it reset.
pub type PushPromiseCb =
    Rc<RefCell<dyn FnMut(&mut Session, StreamId, &Msg) -> Option<Box<dyn Any>>>>;

/// Invoked while the session is being freed, before the transport closes.
pub type SessionFreeCb = Rc<RefCell<dyn FnMut(&mut Session)>>;

/// Listener accept callback; `None` rejects the connection.
pub type AcceptCb = Box<dyn FnMut(&str, u16) -> Option<crate::server::SessionAccept>>;

pub fn request_cb(f: impl FnMut(&mut Session, StreamId, &Msg) -> i32 + 'static) -> RequestCb {
    Rc::new(RefCell::new(f))
}

pub fn response_cb(
    f: impl FnMut(&mut Session, StreamId, Option<&Msg>) -> i32 + 'static,
) -> ResponseCb {
    Rc::new(RefCell::new(f))
}

pub fn push_promise_cb(
    f: impl FnMut(&mut Session, StreamId, &Msg) -> Option<Box<dyn Any>> + 'static,
) -> PushPromiseCb {
    Rc::new(RefCell::new(f))
}

pub fn session_free_cb(f: impl FnMut(&mut Session) + 'static) -> SessionFreeCb {
    Rc::new(RefCell::new(f))
}

#[derive(Default)]
pub(crate) struct SessionCbs {
    pub request: Option<RequestCb>,
    pub push_promise: Option<PushPromiseCb>,
    pub push_response: Option<ResponseCb>,
    pub free: Option<SessionFreeCb>,
}

/// Serialized send data for one stream, drained by the HTTP/1.1 send path.
#[derive(Debug, Default)]
pub(crate) struct SendBuf {
    pub data: Bytes,
    pub used: usize,
}

impl SendBuf {
    pub fn is_drained(&self) -> bool {
        self.used >= self.data.len()
    }
}

/// One request/response exchange on a session.
pub(crate) struct Stream {
    pub id: StreamId,
    pub recv_kind: MsgKind,
    pub send_kind: MsgKind,
    pub rmsg: Msg,
    pub send_buf: SendBuf,
    pub response_cb: Option<ResponseCb>,
    pub user_data: Option<Box<dyn Any>>,
    pub is_req: bool,
    pub is_rsp_set: bool,
    pub close_sess: bool,
}

impl Stream {
    pub fn new(id: StreamId, recv_kind: MsgKind) -> Self {
        let send_kind = match recv_kind {
            MsgKind::Request => MsgKind::Response,
            MsgKind::Response => MsgKind::Request,
            MsgKind::PushPromise => MsgKind::PushPromise,
            MsgKind::PushResponse => MsgKind::PushResponse,
        };
        Stream {
            id,
            recv_kind,
            send_kind,
            rmsg: Msg::new(),
            send_buf: SendBuf::default(),
            response_cb: None,
            user_data: None,
            is_req: false,
            is_rsp_set: false,
            close_sess: false,
        }
    }
}

/// HTTP/1.1 incremental parse state, per session.
#[derive(Debug, Default)]
pub(crate) struct H1State {
    pub recving: Option<StreamId>,
    pub header_done: bool,
    pub header_line: u32,
    pub content_length: usize,
}

/// One connection: framed (HTTP/2) or line-based (HTTP/1.1).
pub struct Session {
    pub(crate) id: u64,
    role: Role,
    ver: HttpVer,
    pub(crate) io: Box<dyn SessionIo>,
    pub(crate) codec: Option<Box<dyn FrameCodec>>,
    log_prefix: String,
    pub(crate) streams: VecDeque<Stream>,
    pub(crate) wr: WriteBuf,
    pub(crate) rd: ReadBuf,
    pub(crate) h1: H1State,
    pub(crate) settings: Settings,
    send_pending: bool,
    pub(crate) term: Term,
    shutdown_sent: bool,
    close_after_flush: bool,
    pub(crate) close_reason: Option<CloseReason>,
    pub(crate) cbs: SessionCbs,
    user_data: Option<Box<dyn Any>>,
    /// Weak back-link into the owning peer's slot array
    pub(crate) peer_slot: Option<(u64, usize)>,
    pub(crate) req_cnt: u32,
    pub(crate) rsp_cnt: u32,
    pub(crate) rsp_rst_cnt: u32,
    pub(crate) strm_close_cnt: u32,
    started: Instant,
    pub(crate) verbose: bool,
}

impl Session {
    pub(crate) fn new(
        id: u64,
        role: Role,
        ver: HttpVer,
        io: Box<dyn SessionIo>,
        log_prefix: String,
        settings: Settings,
        verbose: bool,
    ) -> Self {
        Session {
            id,
            role,
            ver,
            io,
            codec: None,
            log_prefix,
            streams: VecDeque::new(),
            wr: WriteBuf::new(),
            rd: ReadBuf::new(),
            h1: H1State::default(),
            settings,
            send_pending: false,
            term: Term::Open,
            shutdown_sent: false,
            close_after_flush: false,
            close_reason: None,
            cbs: SessionCbs::default(),
            user_data: None,
            peer_slot: None,
            req_cnt: 0,
            rsp_cnt: 0,
            rsp_rst_cnt: 0,
            strm_close_cnt: 0,
            started: Instant::now(),
            verbose,
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn ver(&self) -> HttpVer {
        self.ver
    }

    pub fn log_prefix(&self) -> &str {
        &self.log_prefix
    }

    pub fn close_reason(&self) -> Option<CloseReason> {
        self.close_reason
    }

    pub fn req_cnt(&self) -> u32 {
        self.req_cnt
    }

    pub fn rsp_cnt(&self) -> u32 {
        self.rsp_cnt
    }

    pub fn rsp_rst_cnt(&self) -> u32 {
        self.rsp_rst_cnt
    }

    pub fn strm_close_cnt(&self) -> u32 {
        self.strm_close_cnt
    }

    pub fn send_pending(&self) -> bool {
        self.send_pending
    }

    pub fn is_terminated(&self) -> bool {
        self.term == Term::Closed
    }

    pub fn set_user_data(&mut self, data: Box<dyn Any>) {
        self.user_data = Some(data);
    }

    pub fn user_data(&mut self) -> Option<&mut Box<dyn Any>> {
        self.user_data.as_mut()
    }

    pub fn take_user_data(&mut self) -> Option<Box<dyn Any>> {
        self.user_data.take()
    }

    pub(crate) fn set_codec(&mut self, codec: Box<dyn FrameCodec>) {
        self.codec = Some(codec);
    }

    pub(crate) fn mark_send_pending(&mut self) {
        self.send_pending = true;
    }

    /// Close the session once the write buffer fully drains
    pub(crate) fn set_close_after_flush(&mut self) {
        self.close_after_flush = true;
    }

    pub(crate) fn clear_send_pending(&mut self) {
        self.send_pending = false;
    }

    /// The (read, write) interest this session wants registered this tick.
    pub(crate) fn interest(&self) -> (bool, bool) {
        match self.ver {
            HttpVer::H2 => {
                let (cr, cw) = match &self.codec {
                    Some(c) => (c.wants_read(), c.wants_write()),
                    None => (false, false),
                };
                (cr, self.send_pending || cw)
            }
            _ => (self.term != Term::Closed, self.send_pending),
        }
    }

    pub(crate) fn stream_idx(&self, sid: StreamId) -> Option<usize> {
        self.streams.iter().position(|s| s.id == sid)
    }

    pub(crate) fn remove_stream(&mut self, sid: StreamId) -> Option<Stream> {
        let idx = self.stream_idx(sid)?;
        self.streams.remove(idx)
    }

    /// Send an HTTP request on this (client) session.
    pub fn send_request(
        &mut self,
        req: Msg,
        response_cb: Option<ResponseCb>,
        user_data: Option<Box<dyn Any>>,
    ) -> Result<StreamId> {
        if self.role != Role::Client {
            warn!("{}cannot send request: not a client session", self.log_prefix);
            return Err(Error::Protocol("not a client session".into()));
        }
        if self.term != Term::Open {
            warn!(
                "{}cannot send request: session is terminated",
                self.log_prefix
            );
            return Err(Error::SessionClosed);
        }
        match self.ver {
            HttpVer::H2 => self.h2_send_request(&req, response_cb, user_data),
            _ => self.h1_send_request(&req, response_cb, user_data),
        }
    }

    /// Send a response on an inbound stream of this (server) session.
    pub fn send_response(&mut self, stream: StreamId, rsp: Msg) -> Result<()> {
        if self.role != Role::Server {
            warn!(
                "{}cannot send response: not a server session",
                self.log_prefix
            );
            return Err(Error::Protocol("not a server session".into()));
        }
        if self.term == Term::Closed {
            warn!(
                "{}cannot send response: session is terminated",
                self.log_prefix
            );
            return Err(Error::SessionClosed);
        }
        match self.ver {
            HttpVer::H2 => self.h2_send_response(stream, &rsp),
            _ => self.h1_send_response(stream, &rsp),
        }
    }

    /// Send a no-frills response with optional content type and body.
    pub fn send_response_simple(
        &mut self,
        stream: StreamId,
        status: u16,
        content_type: Option<&str>,
        body: &[u8],
    ) -> Result<()> {
        let mut rsp = Msg::response(status);
        if let Some(ct) = content_type {
            rsp.add_header("content-type", ct);
        }
        if !body.is_empty() {
            rsp.set_body(body.to_vec());
        }
        self.send_response(stream, rsp)
    }

    /// Send a push promise tied to the given request stream, followed by its
    /// response. HTTP/2 only; must precede the original response.
    pub fn send_push_promise(
        &mut self,
        stream: StreamId,
        prm_req: Msg,
        prm_rsp: Msg,
    ) -> Result<()> {
        if self.role != Role::Server {
            warn!(
                "{}cannot send push promise: not a server session",
                self.log_prefix
            );
            return Err(Error::Protocol("not a server session".into()));
        }
        if let Some(idx) = self.stream_idx(stream) {
            if self.streams[idx].is_rsp_set {
                warn!(
                    "{}[{}] push promise must not follow the original response",
                    self.log_prefix, stream
                );
                return Err(Error::Protocol("push promise after response".into()));
            }
        }
        if self.ver != HttpVer::H2 {
            warn!(
                "{}[{}] push promise is not available on an HTTP/1.1 session",
                self.log_prefix, stream
            );
            return Err(Error::Protocol("push promise needs HTTP/2".into()));
        }
        self.h2_send_push_promise(stream, &prm_req, &prm_rsp)
    }

    /// Trigger session termination; the session is destroyed later by the
    /// readiness loop.
    ///
    /// With `wait_rsp` a client session with outstanding requests enters a
    /// draining state: no new requests, remaining responses are still
    /// delivered, then the session closes. Otherwise closing is immediate.
    /// More receive callbacks may fire after this call.
    pub fn terminate(&mut self, wait_rsp: bool) -> TermStatus {
        if self.term == Term::Closed {
            return TermStatus::Already;
        }
        if wait_rsp && self.role == Role::Client && self.req_cnt > self.rsp_cnt {
            if self.term == Term::Draining {
                return TermStatus::Already;
            }
            self.term = Term::Draining;
            self.mark_send_pending();
            return TermStatus::Done;
        }
        self.term = Term::Closed;
        match self.ver {
            HttpVer::H2 => {
                if let Some(codec) = self.codec.as_mut() {
                    if let Err(e) = codec.terminate(0) {
                        warn!(
                            "{}codec terminate failed; ignored: {}",
                            self.log_prefix, e
                        );
                    }
                }
            }
            _ => self.io.shutdown_both(),
        }
        self.mark_send_pending();
        TermStatus::Done
    }

    /// One receive pass: read a chunk, feed the codec or the HTTP/1.1
    /// parser. `Ok(0)` means nothing was readable; an error means the
    /// session must be freed.
    pub(crate) fn recv_step(&mut self) -> Result<usize> {
        let mut buf = [0u8; RD_BUF_SIZE];
        let n = match self.io.read(&mut buf) {
            Ok(0) => {
                info!("{}disconnected from the remote host", self.log_prefix);
                self.close_reason = Some(CloseReason::SockEof);
                return Err(Error::SessionClosed);
            }
            Ok(n) => n,
            Err(e)
                if e.kind() == io::ErrorKind::WouldBlock
                    || e.kind() == io::ErrorKind::Interrupted =>
            {
                return Ok(0)
            }
            Err(e) => {
                warn!("{}network error: {}", self.log_prefix, e);
                self.close_reason = Some(match self.io.kind() {
                    IoKind::Tls => CloseReason::SslErr,
                    IoKind::Tcp => CloseReason::SockErr,
                });
                return Err(e.into());
            }
        };
        match self.ver {
            HttpVer::H2 => self.recv_h2(&buf[..n]),
            _ => self.recv_h1(&buf[..n]),
        }
    }

    /// Drive the send path until it stops making progress.
    pub(crate) fn send_step(&mut self) -> Result<usize> {
        let mut total = 0;
        loop {
            let n = self.send_once()?;
            if n == 0 {
                return Ok(total);
            }
            total += n;
        }
    }

    fn send_once(&mut self) -> Result<usize> {
        let codec_drained = match self.ver {
            HttpVer::H2 => self.fill_from_codec()?,
            _ => {
                self.fill_from_streams();
                false
            }
        };

        let mut total = 0;

        if !self.wr.merge_pending().is_empty() {
            let to_send = self.wr.merge_pending().len();
            match self.io.write(self.wr.merge_pending()) {
                Ok(n) if n > 0 => {
                    self.wr.merge_consume(n);
                    total += n;
                    if n < to_send {
                        debug!(
                            "{}partial send of merge buffer: {}/{}",
                            self.log_prefix, n, to_send
                        );
                        self.mark_send_pending();
                        return Ok(total);
                    }
                }
                Ok(_) => {
                    self.mark_send_pending();
                    return Ok(total);
                }
                Err(e) if is_transient(&e) => {
                    self.mark_send_pending();
                    return Ok(total);
                }
                Err(e) => return Err(self.tag_send_error(e, to_send)),
            }
        }

        if self.wr.has_tail() {
            // the tail span must be re-presented byte-identical after a
            // blocked TLS write; only confirmed progress moves the offset
            let to_send = self.wr.tail_pending().len();
            match self.io.write(self.wr.tail_pending()) {
                Ok(n) if n > 0 => {
                    self.wr.tail_consume(n);
                    total += n;
                    if n < to_send {
                        debug!(
                            "{}partial send of tail span: {}/{}",
                            self.log_prefix, n, to_send
                        );
                        self.mark_send_pending();
                        return Ok(total);
                    }
                }
                Ok(_) => {
                    self.mark_send_pending();
                    return Ok(total);
                }
                Err(e) if is_transient(&e) => {
                    self.mark_send_pending();
                    return Ok(total);
                }
                Err(e) => return Err(self.tag_send_error(e, to_send)),
            }
        }

        if total == 0 {
            self.clear_send_pending();
            if self.term == Term::Draining && !self.shutdown_sent {
                self.shutdown_send();
                self.shutdown_sent = true;
            }
            if self.close_after_flush && self.wr.is_idle() && self.term == Term::Open {
                self.terminate(false);
            }
        }

        if self.ver == HttpVer::H2 && codec_drained && self.wr.is_idle() {
            let wants_read = self
                .codec
                .as_ref()
                .map(|c| c.wants_read())
                .unwrap_or(false);
            if !wants_read {
                self.close_reason = Some(CloseReason::CodecEnd);
                return Err(Error::SessionClosed);
            }
        }

        Ok(total)
    }

    fn tag_send_error(&mut self, e: io::Error, to_send: usize) -> Error {
        if self.term == Term::Closed && e.raw_os_error() == Some(libc::EPIPE) {
            self.close_reason = Some(CloseReason::SockEof);
        } else {
            warn!(
                "{}send error with to_send={}: {}",
                self.log_prefix, to_send, e
            );
            self.close_reason = Some(match self.io.kind() {
                IoKind::Tls => CloseReason::SslErr,
                IoKind::Tcp => CloseReason::SockErr,
            });
        }
        e.into()
    }

    /// Half-close the write direction once a draining session's send path
    /// runs dry. HTTP/2 relies on stream-level end-of-stream instead; the
    /// final close submits the codec's GOAWAY-equivalent.
    fn shutdown_send(&mut self) {
        match self.ver {
            HttpVer::H2 => {}
            _ => self.io.shutdown_write(),
        }
    }

    /// A completed inbound request: validate, hand to the request callback,
    /// auto-answer when the callback declines to.
    pub(crate) fn deliver_request(&mut self, sid: StreamId) -> Result<()> {
        let idx = match self.stream_idx(sid) {
            Some(i) => i,
            None => return Ok(()),
        };
        let have_pseudo = {
            let m = &self.streams[idx].rmsg;
            m.method().is_some() && m.authority().is_some() && m.path().is_some()
        };
        if !have_pseudo {
            warn!(
                "{}[{}] request pseudo header missing; sending 400 response",
                self.log_prefix, sid
            );
            self.send_response_simple(sid, 400, None, &[])?;
            return Ok(());
        }
        if self.verbose {
            debug!(
                "{}[{}] {}:\n{}",
                self.log_prefix,
                sid,
                MsgKind::Request.as_str(),
                self.streams[idx].rmsg.dump(&self.log_prefix)
            );
        }

        let req = std::mem::take(&mut self.streams[idx].rmsg);
        let cb = self.cbs.request.clone();
        let mut rs: i32 = match cb {
            Some(cb) => (&mut *cb.borrow_mut())(self, sid, &req),
            None => 404,
        };
        if let Some(i) = self.stream_idx(sid) {
            self.streams[i].rmsg = req;
        }

        if rs < 0 {
            warn!(
                "{}[{}] request callback returned error; sending 500 response: ret={}",
                self.log_prefix, sid, rs
            );
            rs = 500;
        }
        if rs > 0 {
            self.send_response_simple(sid, rs as u16, None, &[])?;
        }
        Ok(())
    }

    /// A completed inbound response on a client stream.
    pub(crate) fn deliver_response(&mut self, sid: StreamId) -> Result<()> {
        let idx = match self.stream_idx(sid) {
            Some(i) => i,
            None => return Ok(()),
        };
        if !self.streams[idx].is_req {
            return Ok(());
        }
        if self.streams[idx].is_rsp_set {
            warn!(
                "{}[{}] response already handled before this response; ignoring",
                self.log_prefix, sid
            );
            return Err(Error::Protocol("duplicate response".into()));
        }
        if self.verbose {
            debug!(
                "{}[{}] {}:\n{}",
                self.log_prefix,
                sid,
                MsgKind::Response.as_str(),
                self.streams[idx].rmsg.dump(&self.log_prefix)
            );
        }

        let rmsg = std::mem::take(&mut self.streams[idx].rmsg);
        let cb = self.streams[idx].response_cb.clone();
        if let Some(cb) = cb {
            let r = (&mut *cb.borrow_mut())(self, sid, Some(&rmsg));
            if r < 0 {
                warn!(
                    "{}[{}] response callback failed; going ahead: ret={}",
                    self.log_prefix, sid, r
                );
            }
        }
        if let Some(i) = self.stream_idx(sid) {
            self.streams[i].rmsg = rmsg;
            self.streams[i].is_rsp_set = true;
        }
        self.rsp_cnt += 1;
        self.check_drain_done();
        Ok(())
    }

    /// A stream observed reset before its response: deliver the
    /// no-response callback and keep the request/response accounting even.
    pub(crate) fn deliver_reset(&mut self, sid: StreamId) -> Result<()> {
        let idx = match self.stream_idx(sid) {
            Some(i) => i,
            None => return Ok(()),
        };
        if !self.streams[idx].is_req || self.streams[idx].is_rsp_set {
            return Ok(());
        }
        let cb = self.streams[idx].response_cb.clone();
        if let Some(cb) = cb {
            let r = (&mut *cb.borrow_mut())(self, sid, None);
            if r < 0 {
                warn!(
                    "{}[{}] response callback for reset stream failed; going ahead: ret={}",
                    self.log_prefix, sid, r
                );
            }
        }
        if let Some(i) = self.stream_idx(sid) {
            self.streams[i].is_rsp_set = true;
        }
        self.rsp_rst_cnt += 1;
        self.rsp_cnt += 1;
        self.check_drain_done();
        Ok(())
    }

    /// A completed response on a promised stream.
    pub(crate) fn deliver_push_response(&mut self, sid: StreamId) -> Result<()> {
        let idx = match self.stream_idx(sid) {
            Some(i) => i,
            None => return Ok(()),
        };
        if self.verbose {
            debug!(
                "{}[{}] {}:\n{}",
                self.log_prefix,
                sid,
                MsgKind::PushResponse.as_str(),
                self.streams[idx].rmsg.dump(&self.log_prefix)
            );
        }
        let rmsg = std::mem::take(&mut self.streams[idx].rmsg);
        let cb = self.streams[idx]
            .response_cb
            .clone()
            .or_else(|| self.cbs.push_response.clone());
        if let Some(cb) = cb {
            let r = (&mut *cb.borrow_mut())(self, sid, Some(&rmsg));
            if r < 0 {
                warn!(
                    "{}[{}] push response callback failed; going ahead: ret={}",
                    self.log_prefix, sid, r
                );
            }
        }
        if let Some(i) = self.stream_idx(sid) {
            self.streams[i].rmsg = rmsg;
        }
        Ok(())
    }

    fn check_drain_done(&mut self) {
        if self.term == Term::Draining && self.req_cnt == self.rsp_cnt {
            self.terminate(false);
        }
    }

    fn close_reason_str(&self) -> &'static str {
        match self.close_reason {
            Some(CloseReason::CodecEnd) if self.term == Term::Closed => "sess term",
            Some(r) => r.as_str(),
            None => "",
        }
    }

    /// Tear-down hook run by the context while freeing this session: pending
    /// client streams get their no-response callback, the session free
    /// callback fires, the transport is shut down.
    pub(crate) fn on_free(&mut self) {
        let elapsed = self.started.elapsed().as_secs_f64().max(1e-9);
        let reason = self.close_reason_str();
        let by = if reason.is_empty() { "" } else { " by " };
        if self.role == Role::Server {
            if self.req_cnt > 1 {
                info!(
                    "{}DISCONNECTED{}{}: {:.0} tps ({:.3} secs for {} streams)",
                    self.log_prefix,
                    by,
                    reason,
                    self.strm_close_cnt as f64 / elapsed,
                    elapsed,
                    self.strm_close_cnt
                );
            }
        } else {
            debug!(
                "{}DISCONNECTED{}{}: {:.0} tps ({:.3} secs for {} reqs {} rsps {} rsts {} streams){}",
                self.log_prefix,
                by,
                reason,
                self.strm_close_cnt as f64 / elapsed,
                elapsed,
                self.req_cnt,
                self.rsp_cnt,
                self.rsp_rst_cnt,
                self.strm_close_cnt,
                if self.req_cnt != self.rsp_cnt { " !!!" } else { "" }
            );
        }

        let pending: Vec<StreamId> = self
            .streams
            .iter()
            .filter(|s| s.is_req && !s.is_rsp_set && s.response_cb.is_some())
            .map(|s| s.id)
            .collect();
        for sid in pending {
            let cb = self
                .stream_idx(sid)
                .and_then(|i| self.streams[i].response_cb.clone());
            if let Some(cb) = cb {
                let _ = (&mut *cb.borrow_mut())(self, sid, None);
            }
            if let Some(i) = self.stream_idx(sid) {
                self.streams[i].is_rsp_set = true;
            }
        }
        self.streams.clear();

        if let Some(cb) = self.cbs.free.take() {
            (&mut *cb.borrow_mut())(self);
        }

        self.io.shutdown_both();
    }
}

fn is_transient(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{h1_session, MockIo, SharedIoState};
    use std::rc::Rc;

    fn drive_send(sess: &mut Session) -> usize {
        sess.send_step().unwrap()
    }

    #[test]
    fn test_h1_server_partial_writes_one_byte_at_a_time() {
        // the socket accepts one byte per write; a 4000-byte body response
        // takes exactly wire-length write attempts and send_pending clears
        // only after the final byte
        let state = SharedIoState::new();
        state.set_max_write(1);
        state.push_read(b"GET /a HTTP/1.1\r\nhost: h:80\r\n\r\n".to_vec());

        let mut sess = h1_session(Role::Server, MockIo::new(state.clone()));
        sess.cbs.request = Some(request_cb(|sess, sid, _req| {
            let mut rsp = Msg::response(200);
            rsp.set_body(vec![b'x'; 4000]);
            sess.send_response(sid, rsp).unwrap();
            0
        }));

        sess.recv_step().unwrap();
        assert_eq!(sess.req_cnt, 1);
        assert!(sess.send_pending());

        let sent = drive_send(&mut sess);
        let wire_len = state.written().len();
        assert_eq!(sent, wire_len);
        assert!(wire_len > 4000);
        assert_eq!(state.write_calls().len(), wire_len);
        assert!(!sess.send_pending());
        assert!(sess.wr.is_idle());
    }

    #[test]
    fn test_send_pending_invariant_under_blocking_writes() {
        // property: after each send step, either the write buffer is idle
        // or send_pending is set
        let state = SharedIoState::new();
        state.push_read(b"GET /a HTTP/1.1\r\nhost: h:80\r\n\r\n".to_vec());
        let mut sess = h1_session(Role::Server, MockIo::new(state.clone()));
        sess.cbs.request = Some(request_cb(|sess, sid, _req| {
            let mut rsp = Msg::response(200);
            rsp.set_body(vec![b'y'; 1024]);
            sess.send_response(sid, rsp).unwrap();
            0
        }));
        sess.recv_step().unwrap();

        state.block_next_writes(3);
        for _ in 0..5 {
            sess.send_step().unwrap();
            assert!(sess.wr.is_idle() || sess.send_pending());
        }
        assert!(sess.wr.is_idle());
        assert!(!sess.send_pending());
    }

    #[test]
    fn test_blocked_tail_write_replays_identical_span() {
        // a write that would-block must be retried with the identical
        // pointer and length, and no byte may be sent twice
        let state = SharedIoState::new();
        state.push_read(b"GET /big HTTP/1.1\r\nhost: h:80\r\n\r\n".to_vec());
        let mut sess = h1_session(Role::Server, MockIo::new(state.clone()));
        let body_len = 20000; // larger than the merge area, lands in the tail
        sess.cbs.request = Some(request_cb(move |sess, sid, _req| {
            let mut rsp = Msg::response(200);
            rsp.set_body(vec![b'z'; body_len]);
            sess.send_response(sid, rsp).unwrap();
            0
        }));
        sess.recv_step().unwrap();

        // accept 100 bytes, then block; the retry must present the same span
        state.set_write_budget(Some(100));
        drive_send(&mut sess);
        assert!(sess.send_pending());
        state.set_write_budget(None);
        drive_send(&mut sess);

        let calls = state.write_calls();
        let blocked_at = state.blocked_call_indexes()[0];
        assert_eq!(calls[blocked_at], calls[blocked_at + 1]);

        // every byte sent exactly once: the total equals the wire length
        let written = state.written();
        let header_end = written
            .windows(4)
            .position(|w| w == b"\r\n\r\n")
            .unwrap()
            + 4;
        assert_eq!(written.len(), header_end + body_len);
        assert!(written[header_end..].iter().all(|&b| b == b'z'));
        assert!(!sess.send_pending());
        assert!(sess.wr.is_idle());
    }

    #[test]
    fn test_h1_client_roundtrip_over_mock() {
        let state = SharedIoState::new();
        let mut sess = h1_session(Role::Client, MockIo::new(state.clone()));

        let got = Rc::new(RefCell::new(None::<(u16, Vec<u8>)>));
        let got2 = got.clone();
        let mut req = Msg::request("GET", "/a");
        req.set_authority("h:80");
        req.set_scheme("http");
        sess.send_request(
            req,
            Some(response_cb(move |_s, _sid, rsp| {
                let rsp = rsp.unwrap();
                *got2.borrow_mut() = Some((rsp.status(), rsp.body().to_vec()));
                0
            })),
            None,
        )
        .unwrap();

        let wire = String::from_utf8(state.written()).unwrap();
        assert!(wire.starts_with("GET /a HTTP/1.1\r\n"));
        assert!(wire.contains("host: h:80\r\n"));
        assert_eq!(sess.req_cnt, 1);

        state.push_read(b"HTTP/1.1 200 OK\r\ncontent-length: 2\r\n\r\nOK".to_vec());
        sess.recv_step().unwrap();

        assert_eq!(got.borrow().as_ref().unwrap().0, 200);
        assert_eq!(got.borrow().as_ref().unwrap().1, b"OK");
        assert_eq!(sess.rsp_cnt, 1);
        assert_eq!(sess.strm_close_cnt, 1);
        assert!(sess.streams.is_empty());
    }

    #[test]
    fn test_terminate_is_idempotent() {
        let state = SharedIoState::new();
        let mut sess = h1_session(Role::Client, MockIo::new(state));
        assert_eq!(sess.terminate(false), TermStatus::Done);
        assert_eq!(sess.terminate(false), TermStatus::Already);
        assert_eq!(sess.terminate(true), TermStatus::Already);
    }

    #[test]
    fn test_terminate_drains_outstanding_responses_first() {
        let state = SharedIoState::new();
        let mut sess = h1_session(Role::Client, MockIo::new(state.clone()));
        let mut req = Msg::request("GET", "/a");
        req.set_authority("h:80");
        sess.send_request(req, None, None).unwrap();

        assert_eq!(sess.terminate(true), TermStatus::Done);
        assert_eq!(sess.term, Term::Draining);
        assert_eq!(sess.terminate(true), TermStatus::Already);

        // the outstanding response arrives; the session closes itself
        state.push_read(b"HTTP/1.1 204 No Content\r\n\r\n".to_vec());
        sess.recv_step().unwrap();
        assert_eq!(sess.term, Term::Closed);
    }

    #[test]
    fn test_request_callback_refused_becomes_500() {
        let state = SharedIoState::new();
        state.push_read(b"GET /x HTTP/1.1\r\nhost: h:80\r\n\r\n".to_vec());
        let mut sess = h1_session(Role::Server, MockIo::new(state.clone()));
        sess.cbs.request = Some(request_cb(|_s, _sid, _req| -7));
        sess.recv_step().unwrap();
        drive_send(&mut sess);
        let wire = String::from_utf8(state.written()).unwrap();
        assert!(wire.starts_with("HTTP/1.1 500 Internal Server Error\r\n"));
    }

    #[test]
    fn test_missing_request_callback_becomes_404() {
        let state = SharedIoState::new();
        state.push_read(b"GET /x HTTP/1.1\r\nhost: h:80\r\n\r\n".to_vec());
        let mut sess = h1_session(Role::Server, MockIo::new(state.clone()));
        sess.recv_step().unwrap();
        drive_send(&mut sess);
        let wire = String::from_utf8(state.written()).unwrap();
        assert!(wire.starts_with("HTTP/1.1 404 Not Found\r\n"));
    }

    #[test]
    fn test_peer_eof_tags_close_reason() {
        let state = SharedIoState::new();
        state.set_eof_on_empty(true);
        let mut sess = h1_session(Role::Client, MockIo::new(state));
        let r = sess.recv_step();
        assert!(r.is_err());
        assert_eq!(sess.close_reason(), Some(crate::CloseReason::SockEof));
    }

    #[test]
    fn test_pending_streams_get_no_response_callback_on_free() {
        let state = SharedIoState::new();
        let mut sess = h1_session(Role::Client, MockIo::new(state));
        let got_none = Rc::new(RefCell::new(false));
        let got_none2 = got_none.clone();
        let mut req = Msg::request("GET", "/a");
        req.set_authority("h:80");
        sess.send_request(
            req,
            Some(response_cb(move |_s, _sid, rsp| {
                *got_none2.borrow_mut() = rsp.is_none();
                0
            })),
            None,
        )
        .unwrap();

        sess.on_free();
        assert!(*got_none.borrow());
        assert!(sess.streams.is_empty());
    }
}
