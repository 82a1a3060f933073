//! Transport abstraction and socket plumbing
//!
//! The [`SessionIo`] trait lets session code run unchanged over plain TCP
//! and TLS. Both implementations return std `io::Result` values where
//! `WouldBlock` / `Interrupted` mean "retry on the next readiness tick" and
//! `Ok(0)` on read means the peer closed cleanly; the openssl stream wrapper
//! already maps WANT_READ / WANT_WRITE onto `WouldBlock`.

use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::os::fd::{AsRawFd, FromRawFd, RawFd};

use openssl::ssl::SslStream;

use crate::{Error, Result};

/// Transport flavor, used to pick the close-reason tag on hard errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoKind {
    Tcp,
    Tls,
}

/// Operations a session performs on its transport.
pub trait SessionIo {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;
    fn write(&mut self, buf: &[u8]) -> io::Result<usize>;
    fn raw_fd(&self) -> RawFd;
    fn kind(&self) -> IoKind;
    fn set_nonblocking(&mut self) -> io::Result<()>;
    /// Half-close the write direction (TLS: send close_notify)
    fn shutdown_write(&mut self);
    /// Shut down both directions
    fn shutdown_both(&mut self);
}

/// Plain TCP transport
pub struct TcpIo {
    stream: TcpStream,
}

impl TcpIo {
    pub fn new(stream: TcpStream) -> Self {
        TcpIo { stream }
    }
}

impl SessionIo for TcpIo {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.stream.read(buf)
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.stream.write(buf)
    }

    fn raw_fd(&self) -> RawFd {
        self.stream.as_raw_fd()
    }

    fn kind(&self) -> IoKind {
        IoKind::Tcp
    }

    fn set_nonblocking(&mut self) -> io::Result<()> {
        self.stream.set_nonblocking(true)
    }

    fn shutdown_write(&mut self) {
        let _ = self.stream.shutdown(Shutdown::Write);
    }

    fn shutdown_both(&mut self) {
        let _ = self.stream.shutdown(Shutdown::Both);
    }
}

/// TLS transport over an established openssl stream
pub struct TlsIo {
    stream: SslStream<TcpStream>,
}

impl TlsIo {
    pub fn new(stream: SslStream<TcpStream>) -> Self {
        TlsIo { stream }
    }

    pub fn ssl(&self) -> &openssl::ssl::SslRef {
        self.stream.ssl()
    }
}

impl SessionIo for TlsIo {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.stream.read(buf)
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.stream.write(buf)
    }

    fn raw_fd(&self) -> RawFd {
        self.stream.get_ref().as_raw_fd()
    }

    fn kind(&self) -> IoKind {
        IoKind::Tls
    }

    fn set_nonblocking(&mut self) -> io::Result<()> {
        self.stream.get_ref().set_nonblocking(true)
    }

    fn shutdown_write(&mut self) {
        // first SSL_shutdown stage sends close_notify; the read direction
        // stays open until the peer answers
        let _ = self.stream.shutdown();
    }

    fn shutdown_both(&mut self) {
        let _ = self.stream.shutdown();
        let _ = self.stream.get_ref().shutdown(Shutdown::Both);
    }
}

/// Split an authority string into host and port.
///
/// Accepts `host:port` and `[ipv6]:port`.
pub fn parse_authority(authority: &str) -> Result<(String, u16)> {
    let (host, port) = authority
        .rsplit_once(':')
        .ok_or_else(|| Error::InvalidAuthority(authority.to_string()))?;
    if host.is_empty() {
        return Err(Error::InvalidAuthority(authority.to_string()));
    }
    let port: u16 = port
        .parse()
        .map_err(|_| Error::InvalidAuthority(authority.to_string()))?;
    let host = host
        .strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(host);
    Ok((host.to_string(), port))
}

/// Connect a TCP stream to an authority, trying each resolved candidate.
///
/// The stream comes back blocking (the TLS handshake runs before the socket
/// is switched to non-blocking) with `TCP_NODELAY` set.
pub fn connect_stream(authority: &str) -> Result<TcpStream> {
    let addrs: Vec<SocketAddr> = authority
        .to_socket_addrs()
        .map_err(|_| Error::ConnectFailed(authority.to_string()))?
        .collect();
    for addr in &addrs {
        if let Ok(stream) = TcpStream::connect(addr) {
            stream.set_nodelay(true)?;
            return Ok(stream);
        }
    }
    Err(Error::ConnectFailed(authority.to_string()))
}

/// Bind and listen on an authority, trying each resolved candidate.
///
/// The socket is created close-on-exec with `SO_REUSEADDR` and a backlog of
/// 1024, and is left blocking; accept runs only when poll reports readiness.
pub fn listen_stream(authority: &str) -> Result<TcpListener> {
    let addrs: Vec<SocketAddr> = authority
        .to_socket_addrs()
        .map_err(|_| Error::InvalidAuthority(authority.to_string()))?
        .collect();
    let mut last_err = io::Error::new(io::ErrorKind::AddrNotAvailable, "no address candidates");
    for addr in &addrs {
        match listen_on(addr) {
            Ok(listener) => return Ok(listener),
            Err(e) => last_err = e,
        }
    }
    log::warn!("cannot listen on {}: {}", authority, last_err);
    Err(Error::Io(last_err))
}

fn listen_on(addr: &SocketAddr) -> io::Result<TcpListener> {
    let family = match addr {
        SocketAddr::V4(_) => libc::AF_INET,
        SocketAddr::V6(_) => libc::AF_INET6,
    };
    unsafe {
        let fd = libc::socket(family, libc::SOCK_STREAM | libc::SOCK_CLOEXEC, 0);
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        let one: libc::c_int = 1;
        if libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_REUSEADDR,
            &one as *const _ as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        ) < 0
        {
            log::warn!("setsockopt(SO_REUSEADDR) failed; going ahead: {}", addr);
        }
        let (storage, len) = sockaddr_from(addr);
        if libc::bind(fd, &storage as *const _ as *const libc::sockaddr, len) < 0 {
            let e = io::Error::last_os_error();
            libc::close(fd);
            return Err(e);
        }
        if libc::listen(fd, 1024) < 0 {
            let e = io::Error::last_os_error();
            libc::close(fd);
            return Err(e);
        }
        Ok(TcpListener::from_raw_fd(fd))
    }
}

fn sockaddr_from(addr: &SocketAddr) -> (libc::sockaddr_storage, libc::socklen_t) {
    let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
    match addr {
        SocketAddr::V4(a) => {
            let sin = libc::sockaddr_in {
                sin_family: libc::AF_INET as libc::sa_family_t,
                sin_port: a.port().to_be(),
                sin_addr: libc::in_addr {
                    s_addr: u32::from(*a.ip()).to_be(),
                },
                sin_zero: [0; 8],
            };
            unsafe {
                std::ptr::write(&mut storage as *mut _ as *mut libc::sockaddr_in, sin);
            }
            (
                storage,
                std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
            )
        }
        SocketAddr::V6(a) => {
            let sin6 = libc::sockaddr_in6 {
                sin6_family: libc::AF_INET6 as libc::sa_family_t,
                sin6_port: a.port().to_be(),
                sin6_flowinfo: a.flowinfo(),
                sin6_addr: libc::in6_addr {
                    s6_addr: a.ip().octets(),
                },
                sin6_scope_id: a.scope_id(),
            };
            unsafe {
                std::ptr::write(&mut storage as *mut _ as *mut libc::sockaddr_in6, sin6);
            }
            (
                storage,
                std::mem::size_of::<libc::sockaddr_in6>() as libc::socklen_t,
            )
        }
    }
}
