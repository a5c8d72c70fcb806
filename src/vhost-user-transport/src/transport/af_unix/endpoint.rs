// Copyright 2025 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0
#![allow(clippy::cast_possible_truncation)]

//! Raw AF_UNIX socket operations used by the connect/accept engine.

use std::ffi::OsStr;
use std::fmt;
use std::io;
use std::mem::size_of;
use std::os::fd::{AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::ffi::OsStrExt;
use std::path::PathBuf;

use crate::logger::warn;

/// Listen backlog of server sockets.
pub const MAX_VIRTIO_BACKLOG: i32 = 128;

/// A filesystem `sockaddr_un`.
#[derive(Clone, Copy)]
pub struct UnixAddr {
    addr: libc::sockaddr_un,
    truncated: bool,
}

impl fmt::Debug for UnixAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UnixAddr")
            .field("path", &self.path())
            .field("truncated", &self.truncated)
            .finish()
    }
}

impl UnixAddr {
    /// Builds the address of `path`.
    ///
    /// Paths that do not fit `sun_path` are cut to its size minus the terminating NUL; the
    /// socket then lives at the shortened path.
    pub fn new(path: &str) -> Self {
        // SAFETY: `sockaddr_un` is plain data, all zeroes is a valid value.
        let mut addr: libc::sockaddr_un = unsafe { std::mem::zeroed() };
        addr.sun_family = libc::AF_UNIX as libc::sa_family_t;

        let max = addr.sun_path.len() - 1;
        let bytes = path.as_bytes();
        let truncated = bytes.len() > max;
        if truncated {
            warn!(
                "socket path {} is longer than {} bytes and was truncated",
                path, max
            );
        }
        for (dst, src) in addr.sun_path.iter_mut().zip(bytes.iter().take(max)) {
            *dst = *src as libc::c_char;
        }

        UnixAddr { addr, truncated }
    }

    /// Path the socket is bound or connected to, after truncation.
    pub fn path(&self) -> PathBuf {
        let bytes: Vec<u8> = self
            .addr
            .sun_path
            .iter()
            .take_while(|c| **c != 0)
            .map(|c| *c as u8)
            .collect();
        PathBuf::from(OsStr::from_bytes(&bytes))
    }

    /// Whether the configured path had to be shortened.
    pub fn is_truncated(&self) -> bool {
        self.truncated
    }

    fn as_ptr(&self) -> *const libc::sockaddr {
        std::ptr::from_ref(&self.addr).cast()
    }

    fn len() -> libc::socklen_t {
        size_of::<libc::sockaddr_un>() as libc::socklen_t
    }
}

/// Failure of a non-blocking connect.
#[derive(Debug)]
pub enum ConnectError {
    /// The peer is not reachable yet; retrying may succeed.
    Transient(io::Error),
    /// The socket itself is unusable.
    Fatal(io::Error),
}

fn cvt(ret: libc::c_int) -> io::Result<libc::c_int> {
    if ret < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(ret)
    }
}

/// Opens a blocking stream socket.
pub fn create_unix_socket() -> io::Result<OwnedFd> {
    // SAFETY: Plain syscall, the result is checked.
    let fd = cvt(unsafe {
        libc::socket(libc::AF_UNIX, libc::SOCK_STREAM | libc::SOCK_CLOEXEC, 0)
    })?;
    // SAFETY: `fd` was just created and is owned by nobody else.
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

/// Sets `O_NONBLOCK` on `fd`.
pub fn set_nonblocking(fd: BorrowedFd<'_>) -> io::Result<()> {
    // SAFETY: Plain syscall on an fd we borrow, the result is checked.
    let flags = cvt(unsafe { libc::fcntl(fd.as_raw_fd(), libc::F_GETFL) })?;
    // SAFETY: As above.
    cvt(unsafe { libc::fcntl(fd.as_raw_fd(), libc::F_SETFL, flags | libc::O_NONBLOCK) })?;
    Ok(())
}

/// Binds `fd` to `addr`.
pub fn bind(fd: BorrowedFd<'_>, addr: &UnixAddr) -> io::Result<()> {
    // SAFETY: `addr` is a valid, NUL-terminated `sockaddr_un` of the given length.
    cvt(unsafe { libc::bind(fd.as_raw_fd(), addr.as_ptr(), UnixAddr::len()) })?;
    Ok(())
}

/// Starts listening on a bound `fd`.
pub fn listen(fd: BorrowedFd<'_>) -> io::Result<()> {
    // SAFETY: Plain syscall, the result is checked.
    cvt(unsafe { libc::listen(fd.as_raw_fd(), MAX_VIRTIO_BACKLOG) })?;
    Ok(())
}

/// Accepts one pending peer of the listening `fd`.
pub fn accept(fd: RawFd) -> io::Result<OwnedFd> {
    // SAFETY: Null address pointers are allowed when the peer address is not wanted.
    let peer = cvt(unsafe {
        libc::accept4(
            fd,
            std::ptr::null_mut(),
            std::ptr::null_mut(),
            libc::SOCK_CLOEXEC,
        )
    })?;
    // SAFETY: `peer` was just returned by accept4 and is owned by nobody else.
    Ok(unsafe { OwnedFd::from_raw_fd(peer) })
}

/// Connects the non-blocking `fd` to `addr` and switches it back to blocking mode.
///
/// An already established connection (`EISCONN`) counts as success. Any other connect error
/// is [`ConnectError::Transient`]; failing to read or update the fd flags is
/// [`ConnectError::Fatal`].
pub fn connect_nonblock(fd: BorrowedFd<'_>, addr: &UnixAddr) -> Result<(), ConnectError> {
    let raw = fd.as_raw_fd();
    // SAFETY: `addr` is a valid, NUL-terminated `sockaddr_un` of the given length.
    if let Err(err) = cvt(unsafe { libc::connect(raw, addr.as_ptr(), UnixAddr::len()) }) {
        if err.raw_os_error() != Some(libc::EISCONN) {
            return Err(ConnectError::Transient(err));
        }
    }

    clear_nonblocking(raw).map_err(ConnectError::Fatal)
}

#[cfg(test)]
thread_local! {
    static FAIL_FD_FLAGS: std::cell::Cell<bool> = const { std::cell::Cell::new(false) };
}

/// Makes flag updates after a successful connect fail with `EBADF` on the calling thread.
#[cfg(test)]
pub(crate) fn fail_fd_flags(fail: bool) {
    FAIL_FD_FLAGS.with(|cell| cell.set(fail));
}

fn clear_nonblocking(fd: RawFd) -> io::Result<()> {
    #[cfg(test)]
    if FAIL_FD_FLAGS.with(std::cell::Cell::get) {
        return Err(io::Error::from_raw_os_error(libc::EBADF));
    }

    // SAFETY: Plain syscall, the result is checked.
    let flags = cvt(unsafe { libc::fcntl(fd, libc::F_GETFL) })?;
    if flags & libc::O_NONBLOCK != 0 {
        // SAFETY: As above.
        cvt(unsafe { libc::fcntl(fd, libc::F_SETFL, flags & !libc::O_NONBLOCK) })?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::os::fd::AsFd;
    use std::os::unix::net::UnixListener;

    use vmm_sys_util::tempdir::TempDir;

    use super::*;

    fn is_nonblocking(fd: BorrowedFd<'_>) -> bool {
        // SAFETY: Plain syscall on a valid fd.
        let flags = unsafe { libc::fcntl(fd.as_raw_fd(), libc::F_GETFL) };
        assert!(flags >= 0);
        flags & libc::O_NONBLOCK != 0
    }

    #[test]
    fn test_addr() {
        let addr = UnixAddr::new("/tmp/vhost-user.sock");
        assert_eq!(addr.path(), PathBuf::from("/tmp/vhost-user.sock"));
        assert!(!addr.is_truncated());
    }

    #[test]
    fn test_addr_truncation() {
        let long = format!("/tmp/{}", "a".repeat(200));
        let addr = UnixAddr::new(&long);
        assert!(addr.is_truncated());

        let path = addr.path();
        assert_eq!(path.as_os_str().len(), 107);
        assert_eq!(path.as_os_str().as_bytes(), &long.as_bytes()[..107]);

        let exact = "b".repeat(107);
        let addr = UnixAddr::new(&exact);
        assert!(!addr.is_truncated());
        assert_eq!(addr.path(), PathBuf::from(exact));
    }

    #[test]
    fn test_socket_modes() {
        let fd = create_unix_socket().unwrap();
        assert!(!is_nonblocking(fd.as_fd()));
        set_nonblocking(fd.as_fd()).unwrap();
        assert!(is_nonblocking(fd.as_fd()));
    }

    fn client_socket() -> OwnedFd {
        let fd = create_unix_socket().unwrap();
        set_nonblocking(fd.as_fd()).unwrap();
        fd
    }

    #[test]
    fn test_bind_listen_accept_connect() {
        let dir = TempDir::new().unwrap();
        let path = dir.as_path().join("sock");
        let addr = UnixAddr::new(path.to_str().unwrap());

        let server = create_unix_socket().unwrap();
        bind(server.as_fd(), &addr).unwrap();
        listen(server.as_fd()).unwrap();
        assert!(path.exists());

        // Binding the same path again fails and leaves it in place.
        let other = create_unix_socket().unwrap();
        let err = bind(other.as_fd(), &addr).unwrap_err();
        assert_eq!(err.raw_os_error(), Some(libc::EADDRINUSE));
        assert!(path.exists());

        let client = client_socket();
        connect_nonblock(client.as_fd(), &addr).unwrap();
        assert!(!is_nonblocking(client.as_fd()));

        // Connecting again reports EISCONN, which is success.
        connect_nonblock(client.as_fd(), &addr).unwrap();

        let peer = accept(server.as_raw_fd()).unwrap();
        // SAFETY: Plain syscall on a valid fd.
        let fd_flags = unsafe { libc::fcntl(peer.as_raw_fd(), libc::F_GETFD) };
        assert!(fd_flags & libc::FD_CLOEXEC != 0);
    }

    #[test]
    fn test_connect_without_peer() {
        let dir = TempDir::new().unwrap();
        let path = dir.as_path().join("missing");
        let addr = UnixAddr::new(path.to_str().unwrap());

        let client = client_socket();
        match connect_nonblock(client.as_fd(), &addr) {
            Err(ConnectError::Transient(err)) => {
                assert_eq!(err.raw_os_error(), Some(libc::ENOENT))
            }
            other => panic!("unexpected result: {other:?}"),
        }
        assert!(is_nonblocking(client.as_fd()));

        // The same fd connects once the peer shows up.
        let _listener = UnixListener::bind(&path).unwrap();
        connect_nonblock(client.as_fd(), &addr).unwrap();
    }

    #[test]
    fn test_flag_errors_are_fatal() {
        let err = clear_nonblocking(-1).unwrap_err();
        assert_eq!(err.raw_os_error(), Some(libc::EBADF));

        let dir = TempDir::new().unwrap();
        let path = dir.as_path().join("peer");
        let _listener = UnixListener::bind(&path).unwrap();
        let addr = UnixAddr::new(path.to_str().unwrap());

        let client = client_socket();
        fail_fd_flags(true);
        let result = connect_nonblock(client.as_fd(), &addr);
        fail_fd_flags(false);
        match result {
            Err(ConnectError::Fatal(err)) => assert_eq!(err.raw_os_error(), Some(libc::EBADF)),
            other => panic!("unexpected result: {other:?}"),
        }
        // Connected, but still non-blocking.
        assert!(is_nonblocking(client.as_fd()));
        connect_nonblock(client.as_fd(), &addr).unwrap();
        assert!(!is_nonblocking(client.as_fd()));
    }
}
