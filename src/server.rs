//! Server listener: a bound accept socket producing inbound sessions
//!
//! The listener itself is thin; accepted connections are turned into
//! sessions by the context (TLS handshake, ALPN inspection, protocol
//! selection, initial SETTINGS). The accept callback decides per-session
//! configuration and can reject a connection outright.

use std::any::Any;
use std::net::TcpListener;

use crate::h2::codec::Settings;
use crate::session::{AcceptCb, RequestCb, SessionFreeCb};
use crate::tls::TlsConfig;

/// What the accept callback hands back for a new inbound session.
pub struct SessionAccept {
    /// Overrides the listener's TLS configuration when set
    pub tls: Option<TlsConfig>,
    pub settings: Settings,
    pub request_cb: Option<RequestCb>,
    pub free_cb: Option<SessionFreeCb>,
    pub user_data: Option<Box<dyn Any>>,
}

impl SessionAccept {
    pub fn new() -> Self {
        SessionAccept {
            tls: None,
            settings: Settings::default(),
            request_cb: None,
            free_cb: None,
            user_data: None,
        }
    }

    pub fn tls(mut self, tls: TlsConfig) -> Self {
        self.tls = Some(tls);
        self
    }

    pub fn settings(mut self, settings: Settings) -> Self {
        self.settings = settings;
        self
    }

    pub fn request(mut self, cb: RequestCb) -> Self {
        self.request_cb = Some(cb);
        self
    }

    pub fn on_free(mut self, cb: SessionFreeCb) -> Self {
        self.free_cb = Some(cb);
        self
    }

    pub fn user_data(mut self, data: Box<dyn Any>) -> Self {
        self.user_data = Some(data);
        self
    }
}

impl Default for SessionAccept {
    fn default() -> Self {
        Self::new()
    }
}

/// A listening socket registered on the context.
pub(crate) struct Server {
    pub authority: String,
    pub listener: TcpListener,
    pub tls: Option<TlsConfig>,
    pub accept_cb: AcceptCb,
}

impl Server {
    /// The actually-bound address, e.g. after a `:0` ephemeral bind.
    pub fn bound_authority(&self) -> Option<String> {
        self.listener.local_addr().ok().map(|a| a.to_string())
    }
}
