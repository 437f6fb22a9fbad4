//! Raw SocketCAN socket with tokio readiness integration.
//!
//! Opens an `AF_CAN`/`CAN_RAW` socket bound to one interface, probes the
//! interface MTU to decide whether CAN FD frames can be enabled, and wraps
//! the nonblocking descriptor in an [`AsyncFd`] so the worker can `select!`
//! on frame arrival. Receives land directly in a [`CanFrame`], whose layout
//! matches the kernel frame structs; the kernel reports 16 bytes for a
//! classic frame and 72 for an FD frame.

use std::ffi::CString;
use std::io;
use std::mem;

use tokio::io::unix::AsyncFd;

use super::RawSocket;
use crate::protocol::frame::{CanFrame, CANFD_MTU, CAN_MTU};

const SOL_CAN_RAW: libc::c_int = 101;
const CAN_RAW_FD_FRAMES: libc::c_int = 5;

/// A raw CAN socket bound to a single interface.
pub struct CanSocket {
    fd: AsyncFd<RawSocket>,
    fd_frames: bool,
}

impl CanSocket {
    /// Open a nonblocking raw CAN socket on `interface`.
    ///
    /// When the interface MTU indicates CAN FD support, the socket is
    /// switched into FD mode; failure to do so leaves the socket in
    /// classic mode with a warning.
    pub fn open(interface: &str) -> io::Result<Self> {
        let raw = unsafe {
            libc::socket(
                libc::PF_CAN,
                libc::SOCK_RAW | libc::SOCK_NONBLOCK,
                libc::CAN_RAW,
            )
        };
        if raw < 0 {
            return Err(io::Error::last_os_error());
        }
        let socket = RawSocket::new(raw);

        let c_name = CString::new(interface).map_err(|_| {
            io::Error::new(io::ErrorKind::InvalidInput, "interface name contains NUL")
        })?;
        let ifindex = unsafe { libc::if_nametoindex(c_name.as_ptr()) };
        if ifindex == 0 {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("unknown CAN interface {interface}"),
            ));
        }

        let mut fd_frames = false;
        match interface_mtu(raw, &c_name) {
            Ok(mtu) if mtu == CANFD_MTU => {
                if enable_fd_frames(raw) {
                    fd_frames = true;
                } else {
                    tracing::warn!(interface, "could not switch socket into CAN FD mode");
                }
            }
            Ok(_) => tracing::warn!(interface, "CAN FD is not supported on this interface"),
            Err(e) => tracing::warn!(interface, "could not read interface MTU: {e}"),
        }

        let mut addr: libc::sockaddr_can = unsafe { mem::zeroed() };
        addr.can_family = libc::AF_CAN as libc::sa_family_t;
        addr.can_ifindex = ifindex as libc::c_int;
        let ret = unsafe {
            libc::bind(
                raw,
                &addr as *const libc::sockaddr_can as *const libc::sockaddr,
                mem::size_of::<libc::sockaddr_can>() as libc::socklen_t,
            )
        };
        if ret != 0 {
            return Err(io::Error::last_os_error());
        }

        Ok(Self {
            fd: AsyncFd::new(socket)?,
            fd_frames,
        })
    }

    /// Whether the socket accepts CAN FD frames.
    pub fn supports_fd(&self) -> bool {
        self.fd_frames
    }

    /// Receive one frame into `frame`, waiting for readiness. Returns the
    /// raw byte count: [`CAN_MTU`] for classic, [`CANFD_MTU`] for FD;
    /// anything else is an incomplete frame the caller discards.
    pub async fn recv_into(&self, frame: &mut CanFrame) -> io::Result<usize> {
        loop {
            let mut guard = self.fd.readable().await?;
            let result = guard.try_io(|inner| {
                let slot = (&mut *frame) as *mut CanFrame as *mut libc::c_void;
                let n = unsafe { libc::read(inner.get_ref().raw(), slot, CANFD_MTU) };
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

    /// Nonblocking frame transmission. `fd_frame` selects the write size;
    /// the caller strips the FD marker from `len` beforehand. A would-block
    /// error surfaces as [`io::ErrorKind::WouldBlock`] so the caller can
    /// re-queue the frame and back off.
    pub fn try_send(&self, frame: &CanFrame, fd_frame: bool) -> io::Result<()> {
        let size = if fd_frame { CANFD_MTU } else { CAN_MTU };
        loop {
            let n = unsafe {
                libc::write(
                    self.fd.get_ref().raw(),
                    frame as *const CanFrame as *const libc::c_void,
                    size,
                )
            };
            if n == size as isize {
                return Ok(());
            }
            if n >= 0 {
                return Err(io::Error::new(
                    io::ErrorKind::WriteZero,
                    "short CAN frame write",
                ));
            }
            let err = io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EINTR) {
                continue;
            }
            return Err(err);
        }
    }
}

fn interface_mtu(fd: libc::c_int, name: &CString) -> io::Result<usize> {
    let mut req: libc::ifreq = unsafe { mem::zeroed() };
    let bytes = name.as_bytes_with_nul();
    if bytes.len() > req.ifr_name.len() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "interface name too long",
        ));
    }
    for (dst, src) in req.ifr_name.iter_mut().zip(bytes) {
        *dst = *src as libc::c_char;
    }
    let ret = unsafe { libc::ioctl(fd, libc::SIOCGIFMTU, &mut req) };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(unsafe { req.ifr_ifru.ifru_mtu } as usize)
}

fn enable_fd_frames(fd: libc::c_int) -> bool {
    let on: libc::c_int = 1;
    let ret = unsafe {
        libc::setsockopt(
            fd,
            SOL_CAN_RAW,
            CAN_RAW_FD_FRAMES,
            &on as *const libc::c_int as *const libc::c_void,
            mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    ret == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_open_unknown_interface_fails() {
        let result = CanSocket::open("canwire-no-such-iface");
        assert!(result.is_err());
    }
}
