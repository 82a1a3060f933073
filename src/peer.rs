//! Peer: a pool of parallel sessions to one authority
//!
//! A peer presents one logical client endpoint. Requests are spread over N
//! sessions round-robin; a per-session request threshold triggers proactive
//! rotation (the loaded session drains gracefully while a replacement is
//! connected in its slot), and any session that dies is reconnected in
//! place unless the peer or the context is shutting down. Routing and
//! reconnect live on the context, which owns both the peer and its
//! sessions; the peer keeps the slot table and the aggregate counters.

use std::any::Any;
use std::cell::RefCell;
use std::rc::Rc;
use std::time::Instant;

use crate::h2::codec::Settings;
use crate::session::{PushPromiseCb, ResponseCb, Session, SessionFreeCb};
use crate::tls::TlsConfig;

/// Invoked when the peer is destroyed.
pub type PeerFreeCb = Rc<RefCell<dyn FnMut(&Peer)>>;

pub fn peer_free_cb(f: impl FnMut(&Peer) + 'static) -> PeerFreeCb {
    Rc::new(RefCell::new(f))
}

/// Callback set installed on every session the peer opens, plus the
/// peer-level user data.
#[derive(Default)]
pub struct PeerCbs {
    pub push_promise: Option<PushPromiseCb>,
    pub push_response: Option<ResponseCb>,
    pub sess_free: Option<SessionFreeCb>,
    pub peer_free: Option<PeerFreeCb>,
    pub user_data: Option<Box<dyn Any>>,
}

/// Client-side pool of N sessions to a single authority.
pub struct Peer {
    authority: String,
    pub(crate) tls: Option<TlsConfig>,
    pub(crate) settings: Settings,
    /// Session handles by slot; `None` while a slot is disconnected
    pub(crate) slots: Vec<Option<u64>>,
    pub(crate) active: Vec<bool>,
    pub(crate) active_cnt: usize,
    pub(crate) next_idx: usize,
    pub(crate) terminating: bool,
    pub(crate) push_promise_cb: Option<PushPromiseCb>,
    pub(crate) push_response_cb: Option<ResponseCb>,
    pub(crate) sess_free_cb: Option<SessionFreeCb>,
    pub(crate) free_cb: Option<PeerFreeCb>,
    user_data: Option<Box<dyn Any>>,
    /// Counters aggregated from freed sessions
    pub(crate) req_cnt: u64,
    pub(crate) rsp_cnt: u64,
    pub(crate) rsp_rst_cnt: u64,
    pub(crate) strm_close_cnt: u64,
    /// Sessions ever opened, replacements included
    pub(crate) sess_total: u32,
    pub(crate) started: Instant,
    pub(crate) ended: Option<Instant>,
}

impl Peer {
    pub(crate) fn new(
        authority: &str,
        tls: Option<TlsConfig>,
        settings: Settings,
        cbs: PeerCbs,
    ) -> Self {
        let n = settings.sess_num.max(1);
        Peer {
            authority: authority.to_string(),
            tls,
            settings,
            slots: vec![None; n],
            active: vec![false; n],
            active_cnt: 0,
            next_idx: 0,
            terminating: false,
            push_promise_cb: cbs.push_promise,
            push_response_cb: cbs.push_response,
            sess_free_cb: cbs.sess_free,
            free_cb: cbs.peer_free,
            user_data: cbs.user_data,
            req_cnt: 0,
            rsp_cnt: 0,
            rsp_rst_cnt: 0,
            strm_close_cnt: 0,
            sess_total: 0,
            started: Instant::now(),
            ended: None,
        }
    }

    pub fn authority(&self) -> &str {
        &self.authority
    }

    /// Configured pool width
    pub fn sess_num(&self) -> usize {
        self.slots.len()
    }

    /// Slots currently holding a live, routable session
    pub fn active_sess_num(&self) -> usize {
        self.active_cnt
    }

    /// Sessions ever opened on this peer, replacements included
    pub fn sess_total(&self) -> u32 {
        self.sess_total
    }

    /// Handles of the sessions currently occupying slots
    pub fn session_ids(&self) -> Vec<u64> {
        self.slots.iter().flatten().copied().collect()
    }

    pub fn is_terminated(&self) -> bool {
        self.terminating
    }

    pub fn user_data(&self) -> Option<&Box<dyn Any>> {
        self.user_data.as_ref()
    }

    /// Requests accounted on sessions already freed
    pub fn req_cnt(&self) -> u64 {
        self.req_cnt
    }

    pub fn rsp_cnt(&self) -> u64 {
        self.rsp_cnt
    }

    pub fn rsp_rst_cnt(&self) -> u64 {
        self.rsp_rst_cnt
    }

    pub fn strm_close_cnt(&self) -> u64 {
        self.strm_close_cnt
    }

    /// Time the peer has been (or was) in service
    pub fn uptime(&self) -> std::time::Duration {
        match self.ended {
            Some(end) => end.duration_since(self.started),
            None => self.started.elapsed(),
        }
    }

    /// Roll a freed session's counters into the aggregates.
    pub(crate) fn absorb(&mut self, sess: &Session) {
        self.req_cnt += sess.req_cnt() as u64;
        self.rsp_cnt += sess.rsp_cnt() as u64;
        self.rsp_rst_cnt += sess.rsp_rst_cnt() as u64;
        self.strm_close_cnt += sess.strm_close_cnt() as u64;
    }
}
