//! Shared unit-test helpers: a scripted in-memory transport that can
//! simulate partial writes, WANT_WRITE-style blocking and peer EOF.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::io;
use std::os::fd::RawFd;
use std::rc::Rc;

use crate::h2::codec::Settings;
use crate::io::{IoKind, SessionIo};
use crate::session::{Role, Session};
use crate::HttpVer;

struct IoState {
    reads: VecDeque<Vec<u8>>,
    eof_on_empty: bool,
    written: Vec<u8>,
    write_calls: Vec<(usize, usize)>,
    blocked_calls: Vec<usize>,
    max_write: usize,
    write_budget: Option<usize>,
    block_next: usize,
    shutdown_write: bool,
    shutdown_both: bool,
}

/// Handle shared between a test and its [`MockIo`].
#[derive(Clone)]
pub(crate) struct SharedIoState(Rc<RefCell<IoState>>);

impl SharedIoState {
    pub fn new() -> Self {
        SharedIoState(Rc::new(RefCell::new(IoState {
            reads: VecDeque::new(),
            eof_on_empty: false,
            written: Vec::new(),
            write_calls: Vec::new(),
            blocked_calls: Vec::new(),
            max_write: usize::MAX,
            write_budget: None,
            block_next: 0,
            shutdown_write: false,
            shutdown_both: false,
        })))
    }

    /// Queue a chunk the next read will return
    pub fn push_read(&self, data: Vec<u8>) {
        self.0.borrow_mut().reads.push_back(data);
    }

    /// When the read queue is empty return EOF instead of WouldBlock
    pub fn set_eof_on_empty(&self, eof: bool) {
        self.0.borrow_mut().eof_on_empty = eof;
    }

    /// Cap how many bytes a single write call accepts
    pub fn set_max_write(&self, n: usize) {
        self.0.borrow_mut().max_write = n;
    }

    /// Total bytes accepted before writes start blocking; `None` = unlimited
    pub fn set_write_budget(&self, n: Option<usize>) {
        self.0.borrow_mut().write_budget = n;
    }

    /// Make the next `n` write calls fail with WouldBlock
    pub fn block_next_writes(&self, n: usize) {
        self.0.borrow_mut().block_next = n;
    }

    /// Everything accepted so far, in order
    pub fn written(&self) -> Vec<u8> {
        self.0.borrow().written.clone()
    }

    /// Every write attempt as (pointer, length), blocked attempts included
    pub fn write_calls(&self) -> Vec<(usize, usize)> {
        self.0.borrow().write_calls.clone()
    }

    /// Indexes into `write_calls` of attempts that returned WouldBlock
    pub fn blocked_call_indexes(&self) -> Vec<usize> {
        self.0.borrow().blocked_calls.clone()
    }

    pub fn shutdown_write_called(&self) -> bool {
        self.0.borrow().shutdown_write
    }

    pub fn shutdown_both_called(&self) -> bool {
        self.0.borrow().shutdown_both
    }
}

/// Scripted transport backed by a [`SharedIoState`].
pub(crate) struct MockIo {
    state: Rc<RefCell<IoState>>,
}

impl MockIo {
    pub fn new(state: SharedIoState) -> Self {
        MockIo { state: state.0 }
    }
}

impl SessionIo for MockIo {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut st = self.state.borrow_mut();
        match st.reads.pop_front() {
            Some(chunk) => {
                assert!(chunk.len() <= buf.len(), "test read chunk too large");
                buf[..chunk.len()].copy_from_slice(&chunk);
                Ok(chunk.len())
            }
            None if st.eof_on_empty => Ok(0),
            None => Err(io::Error::from(io::ErrorKind::WouldBlock)),
        }
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut st = self.state.borrow_mut();
        let idx = st.write_calls.len();
        st.write_calls.push((buf.as_ptr() as usize, buf.len()));
        if st.block_next > 0 {
            st.block_next -= 1;
            st.blocked_calls.push(idx);
            return Err(io::Error::from(io::ErrorKind::WouldBlock));
        }
        if st.write_budget == Some(0) {
            st.blocked_calls.push(idx);
            return Err(io::Error::from(io::ErrorKind::WouldBlock));
        }
        let mut n = buf.len().min(st.max_write);
        if let Some(budget) = st.write_budget {
            n = n.min(budget);
            st.write_budget = Some(budget - n);
        }
        st.written.extend_from_slice(&buf[..n]);
        Ok(n)
    }

    fn raw_fd(&self) -> RawFd {
        -1
    }

    fn kind(&self) -> IoKind {
        IoKind::Tcp
    }

    fn set_nonblocking(&mut self) -> io::Result<()> {
        Ok(())
    }

    fn shutdown_write(&mut self) {
        self.state.borrow_mut().shutdown_write = true;
    }

    fn shutdown_both(&mut self) {
        self.state.borrow_mut().shutdown_both = true;
    }
}

/// A bare HTTP/1.1 session over a mock transport
pub(crate) fn h1_session(role: Role, io: MockIo) -> Session {
    Session::new(
        0,
        role,
        HttpVer::H1_1,
        Box::new(io),
        "test ".to_string(),
        Settings::default(),
        false,
    )
}

/// A bare HTTP/2 session over a mock transport; the caller installs a codec
pub(crate) fn h2_session(role: Role, io: MockIo) -> Session {
    Session::new(
        0,
        role,
        HttpVer::H2,
        Box::new(io),
        "test ".to_string(),
        Settings::default(),
        false,
    )
}
