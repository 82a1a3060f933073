//! hypermux - dual-protocol HTTP engine
//!
//! A single-threaded HTTP/2 + HTTP/1.1 client/server engine that multiplexes
//! many peers over non-blocking sockets, optionally over TLS with ALPN
//! negotiation. HTTP/2 framing is delegated to an external codec injected
//! through the [`FrameCodec`](h2::codec::FrameCodec) trait; HTTP/1.1 is
//! parsed incrementally in-crate.
//!
//! # Architecture
//!
//! A [`Ctx`] owns every listener, peer and session and drives them from one
//! poll-based readiness loop:
//!
//! - [`Ctx::listen`] binds a server socket and turns inbound connections
//!   into sessions.
//! - [`Ctx::connect`] builds a [`Peer`](peer::Peer): a pool of N parallel
//!   sessions to one authority with round-robin dispatch and per-slot
//!   reconnect.
//! - [`Session`](session::Session) owns one transport connection, its
//!   write/read buffers, its streams and (for HTTP/2) its codec handle.
//!
//! All user callbacks run on the loop thread; there are no worker threads.
//!
//! # Example
//!
//! ```no_run
//! use hypermux::{Ctx, HttpVer, Msg, SessionAccept};
//!
//! let mut ctx = Ctx::new(HttpVer::H1_1);
//! let srv = ctx.listen("127.0.0.1:8080", None, Box::new(|_host, _port| {
//!     Some(SessionAccept::new().request(hypermux::request_cb(|sess, strm, _req| {
//!         let mut rsp = Msg::response(200);
//!         rsp.set_body(b"OK".to_vec());
//!         let _ = sess.send_response(strm, rsp);
//!         0
//!     })))
//! })).unwrap();
//! ctx.run().unwrap();
//! # let _ = srv;
//! ```

pub mod buf;
pub mod ctx;
pub mod h1;
pub mod h2;
pub mod io;
pub mod msg;
pub mod peer;
pub mod server;
pub mod session;
pub mod tls;

#[cfg(test)]
pub(crate) mod testutil;

pub use ctx::{Ctx, CtxStopper, PeerId, ServerId, SessId};
pub use h2::codec::{
    CodecError, CodecEvent, CodecFactory, CodecRole, FrameCodec, Settings, StreamId, StreamKind,
};
pub use msg::Msg;
pub use peer::{peer_free_cb, Peer, PeerCbs, PeerFreeCb};
pub use server::SessionAccept;
pub use session::{
    push_promise_cb, request_cb, response_cb, session_free_cb, AcceptCb, PushPromiseCb,
    RequestCb, ResponseCb, Role, Session, SessionFreeCb, TermStatus,
};
pub use tls::TlsConfig;

/// Result type for engine operations
pub type Result<T> = std::result::Result<T, Error>;

/// Engine errors
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TLS error: {0}")]
    Tls(#[from] openssl::error::ErrorStack),

    #[error("TLS handshake failed: {0}")]
    Handshake(String),

    #[error("ALPN negotiation failed: {0}")]
    AlpnMismatch(String),

    #[error("parse error: {0}")]
    Parse(String),

    #[error("codec error: {0}")]
    Codec(#[from] h2::codec::CodecError),

    #[error("invalid authority; expected host:port: {0}")]
    InvalidAuthority(String),

    #[error("cannot connect to {0}")]
    ConnectFailed(String),

    #[error("peer is terminated: {0}")]
    PeerTerminated(String),

    #[error("no session available to peer: {0}")]
    NoSession(String),

    #[error("session is closed")]
    SessionClosed,

    #[error("no codec factory registered for HTTP/2")]
    NoCodecFactory,

    #[error("{0}")]
    Protocol(String),
}

/// Protocol version preference and negotiated result.
///
/// `H2Try` (cleartext HTTP/1.1 upgrade to h2c) is a reserved placeholder:
/// it is accepted as a preference but sessions run HTTP/1.1.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpVer {
    /// HTTP/1.1
    H1_1,
    /// HTTP/2
    H2,
    /// HTTP/1.1 trying to upgrade to HTTP/2 (reserved, not functional)
    H2Try,
}

/// Why a session was closed, kept for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// Peer closed the connection cleanly
    SockEof,
    /// Socket I/O failure other than transient
    SockErr,
    /// TLS failure other than WANT_READ/WANT_WRITE
    SslErr,
    /// The HTTP/2 codec signalled an unrecoverable state
    CodecErr,
    /// The HTTP/2 codec wants neither read nor write
    CodecEnd,
    /// HTTP/1.1 parse failure
    HttpErr,
    /// Nothing left to do on an HTTP/1.1 session
    HttpEnd,
}

impl CloseReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            CloseReason::SockEof => "socket closed",
            CloseReason::SockErr => "socket error",
            CloseReason::SslErr => "SSL error",
            CloseReason::CodecErr => "codec error",
            CloseReason::CodecEnd => "codec end",
            CloseReason::HttpErr => "http error",
            CloseReason::HttpEnd => "http end",
        }
    }
}

/// Receive chunk size for the per-tick socket read.
pub(crate) const RD_BUF_SIZE: usize = 16 * 1024;
