//! SCTP carrier, client and server role.
//!
//! One-to-one SOCK_STREAM association over `IPPROTO_SCTP`, driven through
//! nonblocking libc calls under an [`AsyncFd`]. SCTP preserves message
//! boundaries, so each send carries one whole wire packet and each receive
//! yields one; the association handles path-MTU discovery and chunking on
//! its own. Nagle is disabled on every association.

use std::io;
use std::mem;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use async_trait::async_trait;
use tokio::io::unix::AsyncFd;

use super::{RawSocket, StreamTransport};
use crate::error::{CanwireError, Result};

const SCTP_NODELAY: libc::c_int = 3;

/// A connected one-to-one SCTP association.
pub struct SctpStream {
    fd: AsyncFd<RawSocket>,
}

/// A listening SCTP endpoint accepting one association at a time.
pub struct SctpListener {
    fd: AsyncFd<RawSocket>,
}

fn new_socket(family: libc::c_int) -> io::Result<RawSocket> {
    let fd = unsafe {
        libc::socket(
            family,
            libc::SOCK_STREAM | libc::SOCK_NONBLOCK,
            libc::IPPROTO_SCTP,
        )
    };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(RawSocket::new(fd))
}

fn family_of(addr: &SocketAddr) -> libc::c_int {
    if addr.is_ipv6() {
        libc::AF_INET6
    } else {
        libc::AF_INET
    }
}

fn sockaddr_from(addr: &SocketAddr) -> (libc::sockaddr_storage, libc::socklen_t) {
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    match addr {
        SocketAddr::V4(v4) => {
            let sin = libc::sockaddr_in {
                sin_family: libc::AF_INET as libc::sa_family_t,
                sin_port: v4.port().to_be(),
                sin_addr: libc::in_addr {
                    s_addr: u32::from(*v4.ip()).to_be(),
                },
                sin_zero: [0; 8],
            };
            unsafe {
                std::ptr::write(&mut storage as *mut _ as *mut libc::sockaddr_in, sin);
            }
            (storage, mem::size_of::<libc::sockaddr_in>() as libc::socklen_t)
        }
        SocketAddr::V6(v6) => {
            let sin6 = libc::sockaddr_in6 {
                sin6_family: libc::AF_INET6 as libc::sa_family_t,
                sin6_port: v6.port().to_be(),
                sin6_flowinfo: v6.flowinfo(),
                sin6_addr: libc::in6_addr {
                    s6_addr: v6.ip().octets(),
                },
                sin6_scope_id: v6.scope_id(),
            };
            unsafe {
                std::ptr::write(&mut storage as *mut _ as *mut libc::sockaddr_in6, sin6);
            }
            (storage, mem::size_of::<libc::sockaddr_in6>() as libc::socklen_t)
        }
    }
}

fn sockaddr_to(storage: &libc::sockaddr_storage) -> Option<SocketAddr> {
    match storage.ss_family as libc::c_int {
        libc::AF_INET => {
            let sin = unsafe { &*(storage as *const _ as *const libc::sockaddr_in) };
            Some(SocketAddr::new(
                IpAddr::V4(Ipv4Addr::from(u32::from_be(sin.sin_addr.s_addr))),
                u16::from_be(sin.sin_port),
            ))
        }
        libc::AF_INET6 => {
            let sin6 = unsafe { &*(storage as *const _ as *const libc::sockaddr_in6) };
            Some(SocketAddr::new(
                IpAddr::V6(Ipv6Addr::from(sin6.sin6_addr.s6_addr)),
                u16::from_be(sin6.sin6_port),
            ))
        }
        _ => None,
    }
}

fn take_socket_error(fd: libc::c_int) -> io::Result<()> {
    let mut err: libc::c_int = 0;
    let mut len = mem::size_of::<libc::c_int>() as libc::socklen_t;
    let ret = unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_ERROR,
            &mut err as *mut libc::c_int as *mut libc::c_void,
            &mut len,
        )
    };
    if ret != 0 {
        return Err(io::Error::last_os_error());
    }
    if err != 0 {
        return Err(io::Error::from_raw_os_error(err));
    }
    Ok(())
}

impl SctpListener {
    /// Bind and listen with a backlog of one.
    pub fn bind(local: SocketAddr) -> io::Result<Self> {
        let socket = new_socket(family_of(&local))?;
        let reuse: libc::c_int = 1;
        unsafe {
            libc::setsockopt(
                socket.raw(),
                libc::SOL_SOCKET,
                libc::SO_REUSEADDR,
                &reuse as *const libc::c_int as *const libc::c_void,
                mem::size_of::<libc::c_int>() as libc::socklen_t,
            );
        }
        let (addr, len) = sockaddr_from(&local);
        let ret = unsafe {
            libc::bind(
                socket.raw(),
                &addr as *const libc::sockaddr_storage as *const libc::sockaddr,
                len,
            )
        };
        if ret != 0 {
            return Err(io::Error::last_os_error());
        }
        if unsafe { libc::listen(socket.raw(), 1) } != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Self {
            fd: AsyncFd::new(socket)?,
        })
    }

    /// Accept one association.
    pub async fn accept(&self) -> io::Result<(SctpStream, SocketAddr)> {
        loop {
            let mut guard = self.fd.readable().await?;
            let result = guard.try_io(|inner| {
                let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
                let mut len = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
                let fd = unsafe {
                    libc::accept4(
                        inner.get_ref().raw(),
                        &mut storage as *mut libc::sockaddr_storage as *mut libc::sockaddr,
                        &mut len,
                        libc::SOCK_NONBLOCK,
                    )
                };
                if fd < 0 {
                    Err(io::Error::last_os_error())
                } else {
                    Ok((RawSocket::new(fd), storage))
                }
            });
            match result {
                Ok(Ok((socket, storage))) => {
                    let addr = sockaddr_to(&storage).ok_or_else(|| {
                        io::Error::new(io::ErrorKind::InvalidData, "unknown address family")
                    })?;
                    return Ok((
                        SctpStream {
                            fd: AsyncFd::new(socket)?,
                        },
                        addr,
                    ));
                }
                Ok(Err(e)) if e.raw_os_error() == Some(libc::EINTR) => continue,
                Ok(Err(e)) => return Err(e),
                Err(_would_block) => continue,
            }
        }
    }
}

impl SctpStream {
    /// Establish an association with `remote`.
    pub async fn connect(remote: SocketAddr) -> io::Result<Self> {
        let socket = new_socket(family_of(&remote))?;
        let (addr, len) = sockaddr_from(&remote);
        let ret = unsafe {
            libc::connect(
                socket.raw(),
                &addr as *const libc::sockaddr_storage as *const libc::sockaddr,
                len,
            )
        };
        let fd = AsyncFd::new(socket)?;
        if ret != 0 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::EINPROGRESS) {
                return Err(err);
            }
            let _guard = fd.writable().await?;
            take_socket_error(fd.get_ref().raw())?;
        }
        Ok(Self { fd })
    }

    /// Disable Nagle on the association.
    pub fn set_nodelay(&self) -> io::Result<()> {
        let on: libc::c_int = 1;
        let ret = unsafe {
            libc::setsockopt(
                self.fd.get_ref().raw(),
                libc::IPPROTO_SCTP,
                SCTP_NODELAY,
                &on as *const libc::c_int as *const libc::c_void,
                mem::size_of::<libc::c_int>() as libc::socklen_t,
            )
        };
        if ret != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// Receive one message; `Ok(0)` means the peer shut the association
    /// down.
    pub async fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            let mut guard = self.fd.readable().await?;
            let result = guard.try_io(|inner| {
                let n = unsafe {
                    libc::recv(
                        inner.get_ref().raw(),
                        buf.as_mut_ptr() as *mut libc::c_void,
                        buf.len(),
                        0,
                    )
                };
                if n < 0 {
                    Err(io::Error::last_os_error())
                } else {
                    Ok(n as usize)
                }
            });
            match result {
                Ok(Ok(n)) => return Ok(n),
                Ok(Err(e)) if e.raw_os_error() == Some(libc::EINTR) => continue,
                Ok(Err(e)) => return Err(e),
                Err(_would_block) => continue,
            }
        }
    }

    /// Send one message.
    pub async fn send(&self, buf: &[u8]) -> io::Result<usize> {
        loop {
            let mut guard = self.fd.writable().await?;
            let result = guard.try_io(|inner| {
                let n = unsafe {
                    libc::send(
                        inner.get_ref().raw(),
                        buf.as_ptr() as *const libc::c_void,
                        buf.len(),
                        libc::MSG_NOSIGNAL,
                    )
                };
                if n < 0 {
                    Err(io::Error::last_os_error())
                } else {
                    Ok(n as usize)
                }
            });
            match result {
                Ok(Ok(n)) => return Ok(n),
                Ok(Err(e)) if e.raw_os_error() == Some(libc::EINTR) => continue,
                Ok(Err(e)) => return Err(e),
                Err(_would_block) => continue,
            }
        }
    }
}

/// Outgoing SCTP association to a fixed remote.
pub struct SctpClientTransport {
    remote: SocketAddr,
    stream: Option<SctpStream>,
}

impl SctpClientTransport {
    pub fn new(remote: SocketAddr) -> Self {
        Self {
            remote,
            stream: None,
        }
    }
}

#[async_trait]
impl StreamTransport for SctpClientTransport {
    fn name(&self) -> &'static str {
        "sctp"
    }

    fn message_oriented(&self) -> bool {
        true
    }

    async fn attempt_connect(&mut self) -> Result<()> {
        tracing::info!(remote = %self.remote, "connecting");
        let stream = SctpStream::connect(self.remote).await?;
        stream.set_nodelay()?;
        tracing::info!(remote = %self.remote, "connected");
        self.stream = Some(stream);
        Ok(())
    }

    async fn recv(&mut self, buf: &mut [u8]) -> Result<usize> {
        let stream = self.stream.as_ref().ok_or(CanwireError::NotConnected)?;
        Ok(stream.recv(buf).await?)
    }

    async fn send(&mut self, buf: &[u8]) -> Result<()> {
        let stream = self.stream.as_ref().ok_or(CanwireError::NotConnected)?;
        let n = stream.send(buf).await?;
        if n != buf.len() {
            return Err(CanwireError::Protocol(format!(
                "short SCTP send: {n} of {} bytes",
                buf.len()
            )));
        }
        Ok(())
    }

    fn close(&mut self) {
        self.stream = None;
    }
}

/// Listening SCTP endpoint accepting one association at a time.
pub struct SctpServerTransport {
    listener: SctpListener,
    expected_peer: Option<IpAddr>,
    stream: Option<SctpStream>,
}

impl SctpServerTransport {
    /// Bind the listener. `expected_peer` enables the connect-time peer
    /// check.
    pub fn bind(local: SocketAddr, expected_peer: Option<IpAddr>) -> Result<Self> {
        Ok(Self {
            listener: SctpListener::bind(local)?,
            expected_peer,
            stream: None,
        })
    }
}

#[async_trait]
impl StreamTransport for SctpServerTransport {
    fn name(&self) -> &'static str {
        "sctp"
    }

    fn message_oriented(&self) -> bool {
        true
    }

    async fn attempt_connect(&mut self) -> Result<()> {
        tracing::info!("waiting for a client to connect");
        let (stream, addr) = self.listener.accept().await?;
        if let Some(expected) = self.expected_peer {
            if addr.ip() != expected {
                tracing::warn!(from = %addr, "rejecting connection from unexpected peer");
                return Err(CanwireError::PeerRejected(addr));
            }
        }
        stream.set_nodelay()?;
        tracing::info!(from = %addr, "accepted connection");
        self.stream = Some(stream);
        Ok(())
    }

    async fn recv(&mut self, buf: &mut [u8]) -> Result<usize> {
        let stream = self.stream.as_ref().ok_or(CanwireError::NotConnected)?;
        Ok(stream.recv(buf).await?)
    }

    async fn send(&mut self, buf: &[u8]) -> Result<()> {
        let stream = self.stream.as_ref().ok_or(CanwireError::NotConnected)?;
        let n = stream.send(buf).await?;
        if n != buf.len() {
            return Err(CanwireError::Protocol(format!(
                "short SCTP send: {n} of {} bytes",
                buf.len()
            )));
        }
        Ok(())
    }

    fn close(&mut self) {
        self.stream = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sockaddr_roundtrip_v4() {
        let addr: SocketAddr = "192.168.7.12:20000".parse().unwrap();
        let (storage, _) = sockaddr_from(&addr);
        assert_eq!(sockaddr_to(&storage), Some(addr));
    }

    #[test]
    fn test_sockaddr_roundtrip_v6() {
        let addr: SocketAddr = "[fd00::1234]:20001".parse().unwrap();
        let (storage, _) = sockaddr_from(&addr);
        assert_eq!(sockaddr_to(&storage), Some(addr));
    }

    #[test]
    fn test_sockaddr_unknown_family() {
        let storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
        assert_eq!(sockaddr_to(&storage), None);
    }
}
