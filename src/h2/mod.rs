//! HTTP/2 adapter
//!
//! Bridges a session to the external frame codec: outbound messages are
//! submitted through the codec, inbound bytes are pushed into
//! [`FrameCodec::mem_recv`] and the returned [`CodecEvent`]s are translated
//! into stream bookkeeping and user callbacks. The engine never inspects
//! HTTP/2 frames itself.

pub mod codec;

use log::{debug, warn};

use crate::msg::{Msg, MsgKind};
use crate::session::{ResponseCb, Session, Stream};
use crate::{CloseReason, Error, Result};

use codec::{CodecEvent, StreamId, StreamKind};

impl Session {
    /// Feed received bytes to the codec and apply the resulting events.
    pub(crate) fn recv_h2(&mut self, data: &[u8]) -> Result<usize> {
        let r = match self.codec.as_mut() {
            Some(codec) => codec.mem_recv(data),
            None => return Err(Error::NoCodecFactory),
        };
        let events = match r {
            Ok(events) => events,
            Err(e) => {
                warn!("{}codec receive failed: {}", self.log_prefix(), e);
                self.close_reason = Some(CloseReason::CodecErr);
                return Err(e.into());
            }
        };
        for ev in events {
            self.on_codec_event(ev)?;
        }
        Ok(data.len())
    }

    fn on_codec_event(&mut self, ev: CodecEvent) -> Result<()> {
        match ev {
            CodecEvent::StreamBegin { stream, kind } => self.on_stream_begin(stream, kind),
            CodecEvent::Field {
                stream,
                name,
                value,
            } => self.on_field(stream, &name, &value),
            CodecEvent::Data { stream, chunk } => {
                if let Some(idx) = self.stream_idx(stream) {
                    if self.verbose {
                        debug!(
                            "{}[{}] {} DATA({})",
                            self.log_prefix(),
                            stream,
                            self.streams[idx].recv_kind.as_str(),
                            chunk.len()
                        );
                    }
                    self.streams[idx].rmsg.append_body(&chunk);
                }
                Ok(())
            }
            CodecEvent::EndOfMessage { stream } => self.on_end_of_message(stream),
            CodecEvent::PushPromiseDone { parent, promised } => {
                self.on_push_promise_done(parent, promised)
            }
            CodecEvent::StreamClose { stream, error } => self.on_stream_close(stream, error),
        }
    }

    fn on_stream_begin(&mut self, stream: StreamId, kind: StreamKind) -> Result<()> {
        match kind {
            StreamKind::Request => {
                self.streams.push_back(Stream::new(stream, MsgKind::Request));
            }
            StreamKind::Response => {
                if self.stream_idx(stream).is_none() {
                    warn!(
                        "{}[{}] response headers for unknown stream; ignored",
                        self.log_prefix(),
                        stream
                    );
                }
            }
            StreamKind::PushPromise => {
                self.streams
                    .push_back(Stream::new(stream, MsgKind::PushPromise));
            }
            StreamKind::PushResponse => {
                if let Some(idx) = self.stream_idx(stream) {
                    let strm = &mut self.streams[idx];
                    strm.recv_kind = MsgKind::PushResponse;
                    strm.rmsg = Msg::new();
                } else {
                    warn!(
                        "{}[{}] push response headers for unknown stream; ignored",
                        self.log_prefix(),
                        stream
                    );
                }
            }
        }
        if self.verbose {
            if let Some(idx) = self.stream_idx(stream) {
                debug!(
                    "{}[{}] {} HEADER:",
                    self.log_prefix(),
                    stream,
                    self.streams[idx].recv_kind.as_str()
                );
            }
        }
        Ok(())
    }

    fn on_field(&mut self, stream: StreamId, name: &[u8], value: &[u8]) -> Result<()> {
        let idx = match self.stream_idx(stream) {
            Some(i) => i,
            None => {
                warn!(
                    "{}[{}] header field for unknown stream; ignored",
                    self.log_prefix(),
                    stream
                );
                return Ok(());
            }
        };
        if self.verbose {
            debug!(
                "{}[{}]     {} = {}",
                self.log_prefix(),
                stream,
                String::from_utf8_lossy(name),
                String::from_utf8_lossy(value)
            );
        }
        let kind = self.streams[idx].recv_kind;
        let rmsg = &mut self.streams[idx].rmsg;
        if name.first() == Some(&b':') {
            let request_like = matches!(kind, MsgKind::Request | MsgKind::PushPromise);
            if request_like {
                match name {
                    b":method" => rmsg.set_method(String::from_utf8_lossy(value).into_owned()),
                    b":scheme" => rmsg.set_scheme(String::from_utf8_lossy(value).into_owned()),
                    b":authority" => {
                        rmsg.set_authority(String::from_utf8_lossy(value).into_owned())
                    }
                    b":path" => rmsg.set_path(String::from_utf8_lossy(value).into_owned()),
                    _ => warn!(
                        "{}[{}] unknown pseudo header for request; ignored: {}",
                        self.log_prefix(),
                        stream,
                        String::from_utf8_lossy(name)
                    ),
                }
            } else if name == b":status"
                && value.len() == 3
                && value.iter().all(|b| b.is_ascii_digit())
            {
                rmsg.set_status(
                    (value[0] - b'0') as u16 * 100
                        + (value[1] - b'0') as u16 * 10
                        + (value[2] - b'0') as u16,
                );
            } else {
                warn!(
                    "{}[{}] invalid pseudo header for response; ignored: {}={}",
                    self.log_prefix(),
                    stream,
                    String::from_utf8_lossy(name),
                    String::from_utf8_lossy(value)
                );
            }
        } else {
            rmsg.add_header(
                String::from_utf8_lossy(name).into_owned(),
                String::from_utf8_lossy(value).into_owned(),
            );
        }
        Ok(())
    }

    fn on_end_of_message(&mut self, stream: StreamId) -> Result<()> {
        let kind = match self.stream_idx(stream) {
            Some(i) => self.streams[i].recv_kind,
            None => return Ok(()),
        };
        match kind {
            MsgKind::Request => {
                self.req_cnt += 1;
                self.deliver_request(stream)
            }
            MsgKind::Response => self.deliver_response(stream),
            MsgKind::PushResponse => self.deliver_push_response(stream),
            MsgKind::PushPromise => Ok(()),
        }
    }

    fn on_push_promise_done(&mut self, parent: StreamId, promised: StreamId) -> Result<()> {
        let cb = self.cbs.push_promise.clone();
        let mut accepted = false;
        if let Some(cb) = cb {
            let prm_req = match self.stream_idx(promised) {
                Some(i) => std::mem::take(&mut self.streams[i].rmsg),
                None => return Ok(()),
            };
            let user_data = (&mut *cb.borrow_mut())(self, parent, &prm_req);
            if let Some(i) = self.stream_idx(promised) {
                self.streams[i].rmsg = prm_req;
                if let Some(ud) = user_data {
                    self.streams[i].user_data = Some(ud);
                    accepted = true;
                }
            }
        }
        if !accepted {
            // promise refused; reset the promised stream
            if let Some(i) = self.stream_idx(promised) {
                self.streams[i].response_cb = None;
                self.streams[i].user_data = None;
            }
            let r = self
                .codec
                .as_mut()
                .map(|c| c.submit_rst_stream(promised));
            if let Some(Err(e)) = r {
                warn!(
                    "{}[{}] cannot submit stream reset: {}",
                    self.log_prefix(),
                    promised,
                    e
                );
            }
            self.mark_send_pending();
        }
        Ok(())
    }

    fn on_stream_close(&mut self, stream: StreamId, error: bool) -> Result<()> {
        if self.stream_idx(stream).is_none() {
            return Ok(());
        }
        if self.verbose {
            if error {
                debug!("{}[{}] END OF STREAM (error)", self.log_prefix(), stream);
            } else {
                debug!("{}[{}] END OF STREAM", self.log_prefix(), stream);
            }
        }
        if error {
            self.deliver_reset(stream)?;
        }
        self.remove_stream(stream);
        self.strm_close_cnt += 1;
        Ok(())
    }

    /// Pull outgoing spans from the codec into the write buffer.
    ///
    /// Returns true when the codec reported nothing further pending.
    pub(crate) fn fill_from_codec(&mut self) -> Result<bool> {
        let mut drained = false;
        loop {
            if self.wr.has_tail() || self.wr.merge_room() == 0 {
                break;
            }
            let r = self.codec.as_mut().map(|c| c.mem_send());
            let chunk = match r {
                None => {
                    drained = true;
                    break;
                }
                Some(Ok(chunk)) => chunk,
                Some(Err(e)) => {
                    warn!("{}codec send failed: {}", self.log_prefix(), e);
                    self.close_reason = Some(CloseReason::CodecErr);
                    return Err(e.into());
                }
            };
            if chunk.is_empty() {
                drained = true;
                break;
            }
            if chunk.len() <= self.wr.merge_room() {
                self.wr.push_merge(&chunk);
            } else {
                self.wr.set_tail(chunk);
                break;
            }
        }
        Ok(drained)
    }

    pub(crate) fn h2_send_request(
        &mut self,
        req: &Msg,
        response_cb: Option<ResponseCb>,
        user_data: Option<Box<dyn std::any::Any>>,
    ) -> Result<StreamId> {
        let r = match self.codec.as_mut() {
            Some(codec) => codec.submit_request(req),
            None => return Err(Error::NoCodecFactory),
        };
        let sid = match r {
            Ok(sid) => sid,
            Err(e) => {
                warn!("{}cannot submit request: {}", self.log_prefix(), e);
                return Err(e.into());
            }
        };
        let mut strm = Stream::new(sid, MsgKind::Response);
        strm.is_req = true;
        strm.response_cb = response_cb;
        strm.user_data = user_data;
        self.streams.push_back(strm);
        self.req_cnt += 1;
        if self.verbose {
            debug!(
                "{}[{}] REQUEST HEADER:\n{}",
                self.log_prefix(),
                sid,
                req.dump(self.log_prefix())
            );
        }
        self.send_step()?;
        Ok(sid)
    }

    pub(crate) fn h2_send_response(&mut self, stream: StreamId, rsp: &Msg) -> Result<()> {
        let idx = self
            .stream_idx(stream)
            .ok_or_else(|| Error::Protocol(format!("unknown stream: {}", stream)))?;
        let r = match self.codec.as_mut() {
            Some(codec) => codec.submit_response(stream, rsp),
            None => return Err(Error::NoCodecFactory),
        };
        if let Err(e) = r {
            warn!(
                "{}[{}] cannot submit response: {}",
                self.log_prefix(),
                stream,
                e
            );
            return Err(e.into());
        }
        self.streams[idx].is_rsp_set = true;
        self.rsp_cnt += 1;
        if self.verbose {
            debug!(
                "{}[{}] {} HEADER:\n{}",
                self.log_prefix(),
                stream,
                self.streams[idx].send_kind.as_str(),
                rsp.dump(self.log_prefix())
            );
        }
        self.mark_send_pending();
        Ok(())
    }

    pub(crate) fn h2_send_push_promise(
        &mut self,
        parent: StreamId,
        prm_req: &Msg,
        prm_rsp: &Msg,
    ) -> Result<()> {
        let r = match self.codec.as_mut() {
            Some(codec) => codec.submit_push_promise(parent, prm_req),
            None => return Err(Error::NoCodecFactory),
        };
        let promised = match r {
            Ok(sid) => sid,
            Err(e) => {
                warn!(
                    "{}[{}] cannot submit push promise: {}",
                    self.log_prefix(),
                    parent,
                    e
                );
                return Err(e.into());
            }
        };
        let mut strm = Stream::new(promised, MsgKind::PushPromise);
        strm.send_kind = MsgKind::PushResponse;
        self.streams.push_back(strm);
        if self.verbose {
            debug!(
                "{}[{}] PUSH_PROMISE({}):\n{}",
                self.log_prefix(),
                parent,
                promised,
                prm_req.dump(self.log_prefix())
            );
        }
        self.h2_send_response(promised, prm_rsp)
    }

    /// Submit the SETTINGS carried on this session's configuration and
    /// flush.
    pub(crate) fn h2_submit_settings(&mut self) -> Result<()> {
        let settings = self.settings.clone();
        let r = match self.codec.as_mut() {
            Some(codec) => codec.submit_settings(&settings),
            None => return Err(Error::NoCodecFactory),
        };
        if let Err(e) = r {
            warn!("{}submit settings failed: {}", self.log_prefix(), e);
            return Err(e.into());
        }
        self.send_step()?;
        Ok(())
    }
}
