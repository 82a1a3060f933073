//! External HTTP/2 frame codec interface
//!
//! The engine never frames HTTP/2 itself; it drives a [`FrameCodec`]
//! implementation supplied by the application through
//! [`Ctx::set_codec_factory`](crate::Ctx::set_codec_factory). The codec is a
//! black-box state machine: the engine pushes inbound bytes through
//! [`mem_recv`](FrameCodec::mem_recv), pulls outbound spans from
//! [`mem_send`](FrameCodec::mem_send) and reacts to the returned
//! [`CodecEvent`] stream.

use bytes::Bytes;

use crate::msg::Msg;

/// Codec-assigned stream identifier (synthetic odd ids on HTTP/1.1).
pub type StreamId = i32;

/// Opaque error raised by the codec.
#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct CodecError(pub String);

impl CodecError {
    pub fn new(msg: impl Into<String>) -> Self {
        CodecError(msg.into())
    }
}

/// Which endpoint of the connection a codec instance serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodecRole {
    Client,
    Server,
}

/// What a beginning header block announces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    /// Inbound request headers (server side)
    Request,
    /// Inbound response headers (client side)
    Response,
    /// Promised request headers pushed by the server (client side)
    PushPromise,
    /// Response headers on a promised stream (client side)
    PushResponse,
}

/// Protocol events produced by [`FrameCodec::mem_recv`], in protocol order.
#[derive(Debug, Clone)]
pub enum CodecEvent {
    /// A header block opened on a stream
    StreamBegin { stream: StreamId, kind: StreamKind },
    /// One header field; pseudo-headers arrive with a `:` prefix
    Field {
        stream: StreamId,
        name: Bytes,
        value: Bytes,
    },
    /// A chunk of message body
    Data { stream: StreamId, chunk: Bytes },
    /// End of the message on this stream (END_STREAM observed)
    EndOfMessage { stream: StreamId },
    /// A push promise finished its header block
    PushPromiseDone {
        parent: StreamId,
        promised: StreamId,
    },
    /// The stream closed; `error` is set on RST or protocol failure
    StreamClose { stream: StreamId, error: bool },
}

/// HTTP/2 settings plus pool-level knobs carried alongside them.
///
/// Each `Option` field is forwarded to the codec's SETTINGS submission when
/// set and omitted when `None`.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Parallel sessions per peer
    pub sess_num: usize,
    /// Per-session request threshold triggering proactive rotation; 0 = off
    pub req_max_per_sess: u32,
    /// HTTP/1.1: one request per connection (`Connection: close`)
    pub single_req: bool,

    pub header_table_size: Option<u32>,
    pub enable_push: Option<u32>,
    pub max_concurrent_streams: Option<u32>,
    pub initial_window_size: Option<u32>,
    pub max_frame_size: Option<u32>,
    pub max_header_list_size: Option<u32>,
    pub enable_connect_protocol: Option<u32>,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            sess_num: 1,
            req_max_per_sess: 0,
            single_req: false,
            header_table_size: None,
            enable_push: None,
            max_concurrent_streams: None,
            initial_window_size: None,
            max_frame_size: None,
            max_header_list_size: None,
            enable_connect_protocol: None,
        }
    }
}

impl Settings {
    pub fn new() -> Self {
        Settings::default()
    }

    /// Apply one `<id>=<value>` assignment, e.g. `max_frame_size=65536`.
    pub fn set_kv(&mut self, id_value: &str) -> crate::Result<()> {
        let (id, value) = id_value
            .split_once('=')
            .ok_or_else(|| crate::Error::Protocol(format!(
                "setting should be <id>=<value>: {}",
                id_value
            )))?;
        let val: u32 = value.trim().parse().map_err(|_| {
            crate::Error::Protocol(format!("setting value should be a natural number: {}", value))
        })?;
        match id.trim().to_ascii_lowercase().as_str() {
            "header_table_size" => self.header_table_size = Some(val),
            "enable_push" => self.enable_push = Some(val),
            "max_concurrent_streams" => self.max_concurrent_streams = Some(val),
            "initial_window_size" => self.initial_window_size = Some(val),
            "max_frame_size" => self.max_frame_size = Some(val),
            "max_header_list_size" => self.max_header_list_size = Some(val),
            "enable_connect_protocol" => self.enable_connect_protocol = Some(val),
            "sess_num" => self.sess_num = val as usize,
            "req_max_per_sess" => self.req_max_per_sess = val,
            "single_request" => self.single_req = val != 0,
            other => {
                return Err(crate::Error::Protocol(format!(
                    "unknown setting identifier: {}",
                    other
                )))
            }
        }
        Ok(())
    }

    /// The HTTP/2 settings that are actually set, as (name, value) pairs.
    pub fn h2_entries(&self) -> Vec<(&'static str, u32)> {
        let mut out = Vec::new();
        let mut add = |name, v: Option<u32>| {
            if let Some(v) = v {
                out.push((name, v));
            }
        };
        add("header_table_size", self.header_table_size);
        add("enable_push", self.enable_push);
        add("max_concurrent_streams", self.max_concurrent_streams);
        add("initial_window_size", self.initial_window_size);
        add("max_frame_size", self.max_frame_size);
        add("max_header_list_size", self.max_header_list_size);
        add("enable_connect_protocol", self.enable_connect_protocol);
        out
    }
}

/// Black-box HTTP/2 frame state machine.
///
/// # Send-span contract
///
/// The [`Bytes`] handle returned by `mem_send` must stay byte-stable: the
/// engine may sit on it across WANT_WRITE retries and re-present the same
/// address and length to TLS until the span is fully written.
pub trait FrameCodec {
    /// Enqueue a SETTINGS frame built from the set fields of `settings`
    fn submit_settings(&mut self, settings: &Settings) -> Result<(), CodecError>;

    /// Enqueue a request; returns the codec-assigned stream id
    fn submit_request(&mut self, req: &Msg) -> Result<StreamId, CodecError>;

    /// Enqueue a response on an open inbound stream
    fn submit_response(&mut self, stream: StreamId, rsp: &Msg) -> Result<(), CodecError>;

    /// Enqueue a push promise tied to `parent`; returns the promised stream id
    fn submit_push_promise(&mut self, parent: StreamId, req: &Msg)
        -> Result<StreamId, CodecError>;

    /// Enqueue a stream reset
    fn submit_rst_stream(&mut self, stream: StreamId) -> Result<(), CodecError>;

    /// Yield the next outgoing byte span; empty means nothing is pending
    fn mem_send(&mut self) -> Result<Bytes, CodecError>;

    /// Consume inbound bytes and return the protocol events they produced
    fn mem_recv(&mut self, data: &[u8]) -> Result<Vec<CodecEvent>, CodecError>;

    fn wants_read(&self) -> bool;

    fn wants_write(&self) -> bool;

    /// Enqueue the GOAWAY-equivalent and stop accepting new streams
    fn terminate(&mut self, error_code: u32) -> Result<(), CodecError>;
}

/// Produces one codec instance per HTTP/2 session.
pub type CodecFactory = Box<dyn Fn(CodecRole) -> Box<dyn FrameCodec>>;
