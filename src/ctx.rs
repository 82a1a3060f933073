//! Context: owner of every listener, peer and session, and the readiness
//! loop that drives them
//!
//! One context is one cooperative scheduler thread. Each tick collects the
//! current sessions and listeners, computes their interest sets, waits up
//! to 100 ms in `poll`, then dispatches: accepts on listeners, receive
//! before send on sessions, error/hangup last. A session whose step fails
//! is freed on the spot; freeing a pooled session triggers the peer's
//! slot reconnect.

use std::any::Any;
use std::cell::Cell;
use std::collections::HashMap;
use std::collections::VecDeque;
use std::os::fd::AsRawFd;
use std::rc::Rc;
use std::time::Instant;

use log::{error, info, warn};

use crate::h2::codec::{CodecFactory, CodecRole, FrameCodec, Settings, StreamId};
use crate::io::{self, SessionIo, TcpIo, TlsIo};
use crate::msg::Msg;
use crate::peer::{Peer, PeerCbs};
use crate::server::{Server, SessionAccept};
use crate::session::{AcceptCb, ResponseCb, Role, Session, TermStatus};
use crate::tls::{self, TlsConfig};
use crate::{CloseReason, Error, HttpVer, Result};

pub type SessId = u64;
pub type ServerId = u64;
pub type PeerId = u64;

/// Poll tick upper bound, so timed termination can always proceed.
const POLL_TIMEOUT_MS: libc::c_int = 100;

/// Cloneable handle that stops a running context loop; hand it to
/// callbacks that decide when the work is done.
#[derive(Clone)]
pub struct CtxStopper(Rc<Cell<bool>>);

impl CtxStopper {
    pub fn stop(&self) {
        self.0.set(false);
    }
}

enum PollTag {
    Server(ServerId),
    Session(SessId),
}

/// The owning unit of one scheduler and its listeners, peers and sessions.
pub struct Ctx {
    sessions: HashMap<SessId, Session>,
    servers: HashMap<ServerId, Server>,
    peers: HashMap<PeerId, Peer>,
    next_id: u64,
    running: Rc<Cell<bool>>,
    http_ver: HttpVer,
    verbose: bool,
    codec_factory: Option<CodecFactory>,
}

impl Ctx {
    pub fn new(http_ver: HttpVer) -> Self {
        Ctx {
            sessions: HashMap::new(),
            servers: HashMap::new(),
            peers: HashMap::new(),
            next_id: 0,
            running: Rc::new(Cell::new(true)),
            http_ver,
            verbose: false,
            codec_factory: None,
        }
    }

    pub fn set_http_ver(&mut self, ver: HttpVer) {
        self.http_ver = ver;
    }

    pub fn http_ver(&self) -> HttpVer {
        self.http_ver
    }

    pub fn set_verbose(&mut self, verbose: bool) {
        self.verbose = verbose;
        for sess in self.sessions.values_mut() {
            sess.verbose = verbose;
        }
    }

    /// Install the factory that produces one HTTP/2 codec per session.
    pub fn set_codec_factory(&mut self, factory: CodecFactory) {
        self.codec_factory = Some(factory);
    }

    pub fn stopper(&self) -> CtxStopper {
        CtxStopper(self.running.clone())
    }

    pub fn stop(&mut self) {
        self.running.set(false);
    }

    pub fn session(&self, id: SessId) -> Option<&Session> {
        self.sessions.get(&id)
    }

    pub fn session_mut(&mut self, id: SessId) -> Option<&mut Session> {
        self.sessions.get_mut(&id)
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn peer(&self, id: PeerId) -> Option<&Peer> {
        self.peers.get(&id)
    }

    fn alloc_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn make_codec(&self, role: CodecRole) -> Result<Box<dyn FrameCodec>> {
        match &self.codec_factory {
            Some(factory) => Ok(factory(role)),
            None => Err(Error::NoCodecFactory),
        }
    }

    /// Bind a listening socket on `authority` and register it.
    pub fn listen(
        &mut self,
        authority: &str,
        tls: Option<TlsConfig>,
        accept_cb: AcceptCb,
    ) -> Result<ServerId> {
        let listener = io::listen_stream(authority)?;
        let id = self.alloc_id();
        info!(
            "listen {} for {}",
            authority,
            if tls.is_some() { "tls" } else { "tcp" }
        );
        self.servers.insert(
            id,
            Server {
                authority: authority.to_string(),
                listener,
                tls,
                accept_cb,
            },
        );
        Ok(id)
    }

    /// The address a listener actually bound, e.g. after a `:0` bind.
    pub fn server_authority(&self, id: ServerId) -> Option<String> {
        self.servers.get(&id).and_then(|s| s.bound_authority())
    }

    /// Remove a listener; established sessions are unaffected.
    pub fn free_server(&mut self, id: ServerId) {
        if let Some(server) = self.servers.remove(&id) {
            info!("stop listening on {}", server.authority);
        }
    }

    /// Build a peer: N parallel client sessions to `authority`.
    ///
    /// Construction fails only if every initial session fails to connect;
    /// partially-connected pools go live and reconnect the rest on demand.
    pub fn connect(
        &mut self,
        authority: &str,
        tls: Option<TlsConfig>,
        settings: Settings,
        cbs: PeerCbs,
    ) -> Result<PeerId> {
        let peer = Peer::new(authority, tls, settings, cbs);
        let n = peer.sess_num();
        let pid = self.alloc_id();
        self.peers.insert(pid, peer);

        let mut connected = 0;
        for slot in 0..n {
            match self.connect_slot(pid, slot) {
                Ok(_) => connected += 1,
                Err(e) => warn!(
                    "peer session connect failed: {} slot {}: {}",
                    authority, slot, e
                ),
            }
        }
        if connected == 0 {
            self.drop_peer(pid);
            warn!("{} cannot connect", authority);
            return Err(Error::ConnectFailed(authority.to_string()));
        }
        Ok(pid)
    }

    /// Connect one session into a peer slot: TCP connect, optional TLS
    /// handshake with ALPN, protocol selection, initial SETTINGS.
    fn connect_slot(&mut self, pid: PeerId, slot: usize) -> Result<SessId> {
        let (authority, tls_cfg, settings, ppc, prc, sfc) = {
            let peer = self
                .peers
                .get(&pid)
                .ok_or_else(|| Error::Protocol("unknown peer".into()))?;
            (
                peer.authority().to_string(),
                peer.tls.clone(),
                peer.settings.clone(),
                peer.push_promise_cb.clone(),
                peer.push_response_cb.clone(),
                peer.sess_free_cb.clone(),
            )
        };

        let stream = io::connect_stream(&authority)?;
        let log_prefix = match stream.local_addr() {
            Ok(addr) => format!("{} ", addr),
            Err(_) => format!("to:{} ", authority),
        };

        let (io_box, ver): (Box<dyn SessionIo>, HttpVer) = match &tls_cfg {
            Some(cfg) => {
                let (host, _) = io::parse_authority(&authority)?;
                let tls_stream = cfg.connect(stream, Some(&host))?;
                let ver = if tls::alpn_h2_selected(&tls_stream) {
                    HttpVer::H2
                } else if self.http_ver == HttpVer::H2 {
                    warn!("{} h2 is not negotiated", authority);
                    return Err(Error::AlpnMismatch(authority.clone()));
                } else {
                    HttpVer::H1_1
                };
                (Box::new(TlsIo::new(tls_stream)), ver)
            }
            None => {
                let ver = match self.http_ver {
                    HttpVer::H2 => HttpVer::H2,
                    _ => HttpVer::H1_1,
                };
                (Box::new(TcpIo::new(stream)), ver)
            }
        };

        let sid = self.alloc_id();
        let mut sess = Session::new(
            sid,
            Role::Client,
            ver,
            io_box,
            log_prefix,
            settings,
            self.verbose,
        );
        sess.cbs.push_promise = ppc;
        sess.cbs.push_response = prc;
        sess.cbs.free = sfc;
        sess.peer_slot = Some((pid, slot));
        if ver == HttpVer::H2 {
            sess.set_codec(self.make_codec(CodecRole::Client)?);
            sess.h2_submit_settings()?;
        }
        sess.io.set_nonblocking()?;
        info!("{}CONNECTED", sess.log_prefix());
        self.sessions.insert(sid, sess);

        let peer = self.peers.get_mut(&pid).expect("peer checked above");
        peer.slots[slot] = Some(sid);
        if !peer.active[slot] {
            peer.active[slot] = true;
            peer.active_cnt += 1;
        }
        peer.sess_total += 1;
        Ok(sid)
    }

    /// Route a request onto one of the peer's sessions.
    ///
    /// Probes slots round-robin from the cursor. A session that reached the
    /// rotation threshold while the pool is full is retired (drained
    /// gracefully, replacement connected when it frees) and probing
    /// continues. The cursor advances whether or not a session was found.
    pub fn send_request(
        &mut self,
        pid: PeerId,
        req: Msg,
        response_cb: Option<ResponseCb>,
        user_data: Option<Box<dyn Any>>,
    ) -> Result<StreamId> {
        let (authority, n, nsi, thr) = {
            let peer = self
                .peers
                .get(&pid)
                .ok_or_else(|| Error::Protocol("unknown peer".into()))?;
            if peer.is_terminated() {
                warn!(
                    "cannot send request for peer is terminated: {}",
                    peer.authority()
                );
                return Err(Error::PeerTerminated(peer.authority().to_string()));
            }
            (
                peer.authority().to_string(),
                peer.sess_num(),
                peer.next_idx,
                peer.settings.req_max_per_sess,
            )
        };

        let mut chosen: Option<SessId> = None;
        let mut i = 0;
        while i < n {
            let si = (nsi + i) % n;
            let (slot_sess, slot_active, active_cnt) = {
                let peer = self.peers.get(&pid).expect("peer checked above");
                (peer.slots[si], peer.active[si], peer.active_cnt)
            };
            if let (Some(sid), true) = (slot_sess, slot_active) {
                let sess_reqs = self.sessions.get(&sid).map(|s| s.req_cnt()).unwrap_or(0);
                if thr > 0 && sess_reqs >= thr && active_cnt >= n {
                    // rotate: retire this session and probe the next slot
                    {
                        let peer = self.peers.get_mut(&pid).expect("peer checked above");
                        peer.active[si] = false;
                        peer.active_cnt -= 1;
                    }
                    if let Some(sess) = self.sessions.get_mut(&sid) {
                        sess.terminate(true);
                    }
                } else {
                    chosen = Some(sid);
                    break;
                }
            }
            i += 1;
        }
        {
            let peer = self.peers.get_mut(&pid).expect("peer checked above");
            peer.next_idx = (nsi + i + 1) % n;
        }

        let sid = match chosen {
            Some(sid) => sid,
            None => {
                warn!("no session available to peer: {}", authority);
                return Err(Error::NoSession(authority));
            }
        };
        let r = match self.sessions.get_mut(&sid) {
            Some(sess) => sess.send_request(req, response_cb, user_data),
            None => return Err(Error::SessionClosed),
        };
        match r {
            Ok(stream) => Ok(stream),
            Err(e) => {
                // the send path failed hard; the session tagged its reason
                if self
                    .sessions
                    .get(&sid)
                    .and_then(|s| s.close_reason())
                    .is_some()
                {
                    self.free_session(sid);
                }
                Err(e)
            }
        }
    }

    /// Terminate every session of a peer and stop routing to it.
    pub fn terminate_peer(&mut self, pid: PeerId, wait_rsp: bool) -> Result<TermStatus> {
        let sids: Vec<SessId> = {
            let peer = self
                .peers
                .get_mut(&pid)
                .ok_or_else(|| Error::Protocol("unknown peer".into()))?;
            if peer.is_terminated() {
                return Ok(TermStatus::Already);
            }
            peer.terminating = true;
            for si in 0..peer.sess_num() {
                if peer.active[si] {
                    peer.active[si] = false;
                    peer.active_cnt -= 1;
                }
            }
            peer.slots.iter().flatten().copied().collect()
        };
        for sid in sids {
            if let Some(sess) = self.sessions.get_mut(&sid) {
                sess.terminate(wait_rsp);
            }
        }
        Ok(TermStatus::Done)
    }

    fn drop_peer(&mut self, pid: PeerId) {
        if let Some(mut peer) = self.peers.remove(&pid) {
            peer.ended = Some(Instant::now());
            if let Some(cb) = peer.free_cb.take() {
                (&mut *cb.borrow_mut())(&peer);
            }
        }
    }

    /// Free a session: run its tear-down, then handle the peer slot by
    /// aggregating counters and reconnecting a replacement in place unless
    /// the peer or the context is shutting down.
    pub(crate) fn free_session(&mut self, sid: SessId) {
        let Some(mut sess) = self.sessions.remove(&sid) else {
            return;
        };
        sess.on_free();
        if let Some((pid, slot)) = sess.peer_slot {
            let reconnect = match self.peers.get_mut(&pid) {
                Some(peer) => {
                    peer.absorb(&sess);
                    if peer.slots[slot] == Some(sess.id) {
                        peer.slots[slot] = None;
                        if peer.active[slot] {
                            peer.active[slot] = false;
                            peer.active_cnt -= 1;
                        }
                    }
                    !peer.is_terminated() && self.running.get()
                }
                None => false,
            };
            if reconnect {
                if let Err(e) = self.connect_slot(pid, slot) {
                    warn!("peer session reconnect failed for slot {}: {}", slot, e);
                }
            }
        }
    }

    /// Accept one pending connection on a listener and build its session.
    /// Failures are logged and discarded; the listener keeps running.
    fn accept_on(&mut self, id: ServerId) {
        let (stream, log_prefix, acc, tls_cfg) = {
            let server = match self.servers.get_mut(&id) {
                Some(s) => s,
                None => return,
            };
            let (stream, peer_addr) = match server.listener.accept() {
                Ok(x) => x,
                Err(e) => {
                    warn!("accept() failed on server socket: {}", e);
                    return;
                }
            };
            let _ = stream.set_nodelay(true);
            let host = peer_addr.ip().to_string();
            let port = peer_addr.port();
            let log_prefix = format!("{}:{} ", host, port);
            let acc = match (server.accept_cb)(&host, port) {
                Some(acc) => acc,
                None => {
                    warn!("{}connection rejected by accept callback", log_prefix);
                    return;
                }
            };
            let tls_cfg = acc.tls.clone().or_else(|| server.tls.clone());
            (stream, log_prefix, acc, tls_cfg)
        };
        let SessionAccept {
            settings,
            request_cb,
            free_cb,
            user_data,
            ..
        } = acc;

        let (io_box, ver): (Box<dyn SessionIo>, HttpVer) = match tls_cfg {
            Some(cfg) => {
                let tls_stream = match cfg.accept(stream) {
                    Ok(s) => s,
                    Err(e) => {
                        warn!("{}{}", log_prefix, e);
                        return;
                    }
                };
                info!("{}CONNECTED TLS", log_prefix);
                let ver = if tls::alpn_h2_selected(&tls_stream) {
                    HttpVer::H2
                } else if self.http_ver == HttpVer::H2 {
                    warn!("{}tls alpn h2 is not negotiated", log_prefix);
                    return;
                } else {
                    HttpVer::H1_1
                };
                (Box::new(TlsIo::new(tls_stream)), ver)
            }
            None => {
                info!("{}CONNECTED TCP", log_prefix);
                let ver = match self.http_ver {
                    HttpVer::H2 => HttpVer::H2,
                    _ => HttpVer::H1_1,
                };
                (Box::new(TcpIo::new(stream)), ver)
            }
        };

        let sid = self.alloc_id();
        let mut sess = Session::new(
            sid,
            Role::Server,
            ver,
            io_box,
            log_prefix,
            settings,
            self.verbose,
        );
        sess.cbs.request = request_cb;
        sess.cbs.free = free_cb;
        if let Some(data) = user_data {
            sess.set_user_data(data);
        }
        if ver == HttpVer::H2 {
            let codec = match self.make_codec(CodecRole::Server) {
                Ok(c) => c,
                Err(e) => {
                    warn!("{}{}", sess.log_prefix(), e);
                    return;
                }
            };
            sess.set_codec(codec);
            if sess.h2_submit_settings().is_err() {
                return;
            }
        }
        if let Err(e) = sess.io.set_nonblocking() {
            warn!("{}cannot set non-blocking: {}", sess.log_prefix(), e);
            return;
        }
        self.sessions.insert(sid, sess);
    }

    /// One readiness tick. Returns false when there is nothing left to
    /// poll (no sessions and no listeners).
    pub fn poll_once(&mut self) -> Result<bool> {
        let mut pfds: Vec<libc::pollfd> = Vec::new();
        let mut tags: Vec<PollTag> = Vec::new();

        for (&id, server) in &self.servers {
            pfds.push(libc::pollfd {
                fd: server.listener.as_raw_fd(),
                events: libc::POLLIN,
                revents: 0,
            });
            tags.push(PollTag::Server(id));
        }

        let mut ended: VecDeque<SessId> = VecDeque::new();
        for (&id, sess) in &self.sessions {
            let (want_read, want_write) = sess.interest();
            if !want_read && !want_write {
                // nothing left for this session to do
                ended.push_back(id);
                continue;
            }
            let mut events: libc::c_short = 0;
            if want_read {
                events |= libc::POLLIN;
            }
            if want_write {
                events |= libc::POLLOUT;
            }
            pfds.push(libc::pollfd {
                fd: sess.io.raw_fd(),
                events,
                revents: 0,
            });
            tags.push(PollTag::Session(id));
        }
        while let Some(id) = ended.pop_front() {
            if let Some(sess) = self.sessions.get_mut(&id) {
                if sess.close_reason.is_none() {
                    sess.close_reason = Some(CloseReason::HttpEnd);
                }
            }
            self.free_session(id);
        }

        if pfds.is_empty() {
            return Ok(false);
        }

        let ready = unsafe { libc::poll(pfds.as_mut_ptr(), pfds.len() as libc::nfds_t, POLL_TIMEOUT_MS) };
        if ready == 0 {
            return Ok(true);
        }
        if ready < 0 {
            let e = std::io::Error::last_os_error();
            if e.kind() == std::io::ErrorKind::Interrupted {
                return Ok(true);
            }
            error!("poll() error; quitting run loop: {}", e);
            return Err(e.into());
        }

        for (pfd, tag) in pfds.iter().zip(&tags) {
            if pfd.revents == 0 {
                continue;
            }
            match *tag {
                PollTag::Server(id) => {
                    if pfd.revents & libc::POLLIN != 0 {
                        self.accept_on(id);
                    }
                }
                PollTag::Session(id) => {
                    let revents = pfd.revents;
                    if revents & libc::POLLIN != 0 {
                        match self.sessions.get_mut(&id) {
                            Some(sess) => {
                                if sess.recv_step().is_err() {
                                    self.free_session(id);
                                    continue;
                                }
                            }
                            None => continue,
                        }
                    }
                    if revents & (libc::POLLIN | libc::POLLOUT) != 0 {
                        match self.sessions.get_mut(&id) {
                            Some(sess) => {
                                if sess.send_step().is_err() {
                                    self.free_session(id);
                                    continue;
                                }
                            }
                            None => continue,
                        }
                    }
                    if revents & (libc::POLLERR | libc::POLLHUP | libc::POLLNVAL) != 0 {
                        if let Some(sess) = self.sessions.get_mut(&id) {
                            warn!(
                                "{}socket errored: revents=0x{:02x}",
                                sess.log_prefix(),
                                revents
                            );
                            sess.close_reason = Some(CloseReason::SockErr);
                            self.free_session(id);
                        }
                        continue;
                    }
                }
            }
        }
        Ok(true)
    }

    /// Run the readiness loop until stopped or out of work.
    pub fn run(&mut self) -> Result<()> {
        self.running.set(true);
        while self.running.get() {
            if !self.poll_once()? {
                break;
            }
        }
        Ok(())
    }
}

impl Drop for Ctx {
    fn drop(&mut self) {
        self.running.set(false);
        let sids: Vec<SessId> = self.sessions.keys().copied().collect();
        for sid in sids {
            self.free_session(sid);
        }
        let pids: Vec<PeerId> = self.peers.keys().copied().collect();
        for pid in pids {
            self.drop_peer(pid);
        }
    }
}
