// Copyright 2025 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0
#![allow(clippy::cast_possible_truncation)]

//! Byte payloads with attached file descriptors over AF_UNIX sockets.
//!
//! One call maps to exactly one `sendmsg`/`recvmsg`, with at most one `SCM_RIGHTS` control
//! message. Truncation of either the payload or the control data on receive is a hard error:
//! the descriptors that did arrive are closed and none are handed to the caller.
//!
//! Payload truncation can only be detected on message-preserving sockets (`SOCK_DGRAM`,
//! `SOCK_SEQPACKET`). On `SOCK_STREAM` sockets the kernel leaves unread bytes queued.

use std::io;
use std::mem::size_of;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};

use crate::logger::{IncMetric, METRICS, error};

/// Most descriptors the kernel accepts in one `SCM_RIGHTS` message.
pub const SCM_MAX_FD: usize = 253;

/// Errors associated with sending and receiving fd messages.
#[derive(Debug, thiserror::Error, displaydoc::Display)]
pub enum FdMessageError {
    /// Too many file descriptors in one message: {0}
    TooManyFds(usize),
    /// Failed to send message: {0}
    Send(io::Error),
    /// Failed to receive message: {0}
    Recv(io::Error),
    /// Truncated message
    Truncated,
}

fn cmsg_space(fd_count: usize) -> usize {
    // SAFETY: Pure size computation, no memory is touched.
    unsafe { libc::CMSG_SPACE((fd_count * size_of::<RawFd>()) as u32) as usize }
}

// Backing storage for control messages, aligned for `cmsghdr`.
fn cmsg_buffer(len: usize) -> Vec<u64> {
    vec![0u64; len.div_ceil(size_of::<u64>())]
}

/// Sends `buf` with `fds` attached in one control message.
///
/// Interrupted sends are retried. Returns the number of payload bytes written.
pub fn send_fd_message<S: AsRawFd>(
    sock: &S,
    buf: &[u8],
    fds: &[RawFd],
) -> Result<usize, FdMessageError> {
    if fds.len() > SCM_MAX_FD {
        return Err(FdMessageError::TooManyFds(fds.len()));
    }

    let mut iov = libc::iovec {
        iov_base: buf.as_ptr().cast_mut().cast(),
        iov_len: buf.len(),
    };
    // SAFETY: `msghdr` is plain data, all zeroes is a valid empty header.
    let mut msg: libc::msghdr = unsafe { std::mem::zeroed() };
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1;

    let space = if fds.is_empty() { 0 } else { cmsg_space(fds.len()) };
    let mut control = cmsg_buffer(space);
    if !fds.is_empty() {
        let fd_bytes = std::mem::size_of_val(fds);
        msg.msg_control = control.as_mut_ptr().cast();
        msg.msg_controllen = space as _;

        // SAFETY: `msg_control` points to `msg_controllen` writable bytes.
        let cmsg = unsafe { libc::CMSG_FIRSTHDR(&msg) };
        if cmsg.is_null() {
            return Err(FdMessageError::Send(io::Error::from_raw_os_error(
                libc::EINVAL,
            )));
        }
        // SAFETY: `cmsg` is the first header of `control`, which was sized with CMSG_SPACE
        // for exactly `fds.len()` descriptors.
        unsafe {
            (*cmsg).cmsg_len = libc::CMSG_LEN(fd_bytes as u32) as _;
            (*cmsg).cmsg_level = libc::SOL_SOCKET;
            (*cmsg).cmsg_type = libc::SCM_RIGHTS;
            std::ptr::copy_nonoverlapping(
                fds.as_ptr().cast::<u8>(),
                libc::CMSG_DATA(cmsg),
                fd_bytes,
            );
        }
    }

    loop {
        // SAFETY: `msg` only references `iov`, `buf` and `control`, all alive for the call.
        let ret = unsafe { libc::sendmsg(sock.as_raw_fd(), &msg, libc::MSG_NOSIGNAL) };
        if let Ok(written) = usize::try_from(ret) {
            return Ok(written);
        }

        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            error!("sendmsg error on fd {}: {}", sock.as_raw_fd(), err);
            METRICS.transport.send_fails.inc();
            return Err(FdMessageError::Send(err));
        }
    }
}

/// Receives one message into `buf` together with up to `max_fds` descriptors.
///
/// On success returns the number of bytes read, `0` meaning the peer closed the connection,
/// and exactly `max_fds` descriptor slots: received descriptors first, in order, then `None`
/// for every position that carried no descriptor. Errors such as `EWOULDBLOCK` are returned
/// as [`FdMessageError::Recv`] for the caller to interpret.
pub fn recv_fd_message<S: AsRawFd>(
    sock: &S,
    buf: &mut [u8],
    max_fds: usize,
) -> Result<(usize, Vec<Option<OwnedFd>>), FdMessageError> {
    if max_fds > SCM_MAX_FD {
        return Err(FdMessageError::TooManyFds(max_fds));
    }

    let mut iov = libc::iovec {
        iov_base: buf.as_mut_ptr().cast(),
        iov_len: buf.len(),
    };
    let space = cmsg_space(max_fds);
    let mut control = cmsg_buffer(space);
    // SAFETY: `msghdr` is plain data, all zeroes is a valid empty header.
    let mut msg: libc::msghdr = unsafe { std::mem::zeroed() };
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1;
    msg.msg_control = control.as_mut_ptr().cast();
    msg.msg_controllen = space as _;

    // SAFETY: `msg` only references `iov`, `buf` and `control`, all alive for the call.
    let ret = unsafe { libc::recvmsg(sock.as_raw_fd(), &mut msg, libc::MSG_CMSG_CLOEXEC) };
    let Ok(read) = usize::try_from(ret) else {
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::WouldBlock {
            error!("recvmsg failed on fd {}: {}", sock.as_raw_fd(), err);
            METRICS.transport.recv_fails.inc();
        }
        return Err(FdMessageError::Recv(err));
    };

    // Take ownership of everything the kernel installed before looking at the flags, so
    // descriptors are closed on every error path.
    let received = take_rights(&msg);

    if msg.msg_flags & (libc::MSG_TRUNC | libc::MSG_CTRUNC) != 0 || received.len() > max_fds {
        error!("truncated msg on fd {}", sock.as_raw_fd());
        METRICS.transport.truncated_messages.inc();
        return Err(FdMessageError::Truncated);
    }

    let mut fds: Vec<Option<OwnedFd>> = received.into_iter().map(Some).collect();
    fds.resize_with(max_fds, || None);
    Ok((read, fds))
}

fn take_rights(msg: &libc::msghdr) -> Vec<OwnedFd> {
    let mut fds = Vec::new();

    // SAFETY: `msg` was filled by a successful `recvmsg`, so its control fields describe
    // valid control data inside the caller's buffer.
    let mut cmsg = unsafe { libc::CMSG_FIRSTHDR(msg) };
    while !cmsg.is_null() {
        // SAFETY: Non-null headers returned by CMSG_FIRSTHDR/CMSG_NXTHDR lie in the buffer.
        let hdr = unsafe { &*cmsg };
        if hdr.cmsg_level == libc::SOL_SOCKET && hdr.cmsg_type == libc::SCM_RIGHTS {
            // SAFETY: Pure size computation.
            let header_len = unsafe { libc::CMSG_LEN(0) } as usize;
            let count = (hdr.cmsg_len as usize).saturating_sub(header_len) / size_of::<RawFd>();
            // SAFETY: The payload of an SCM_RIGHTS header holds `count` descriptors.
            let data = unsafe { libc::CMSG_DATA(cmsg) }.cast::<RawFd>();
            for i in 0..count {
                // SAFETY: `i < count`, and CMSG_DATA gives no alignment guarantee.
                let raw = unsafe { data.add(i).read_unaligned() };
                // SAFETY: The kernel installed `raw` in our table for this message only.
                fds.push(unsafe { OwnedFd::from_raw_fd(raw) });
            }
        }
        // SAFETY: `cmsg` is a valid header of `msg`.
        cmsg = unsafe { libc::CMSG_NXTHDR(msg, cmsg) };
    }

    fds
}

#[cfg(test)]
mod tests {
    use std::fs::File;
    use std::io::{Read, Write};
    use std::os::fd::AsRawFd;
    use std::os::unix::net::{UnixDatagram, UnixStream};

    use proptest::prelude::*;
    use vmm_sys_util::eventfd::EventFd;

    use super::*;

    #[test]
    fn test_send_recv_no_fd() {
        let (s1, s2) = UnixStream::pair().unwrap();

        assert_eq!(send_fd_message(&s1, &[1, 1, 2, 3, 5], &[]).unwrap(), 5);

        let mut buf = [0u8; 8];
        let (read, fds) = recv_fd_message(&s2, &mut buf, 4).unwrap();
        assert_eq!(read, 5);
        assert_eq!(&buf[..5], &[1, 1, 2, 3, 5]);
        assert_eq!(fds.len(), 4);
        assert!(fds.iter().all(Option::is_none));
    }

    #[test]
    fn test_send_recv_with_fd() {
        let (s1, s2) = UnixStream::pair().unwrap();
        let evt = EventFd::new(0).unwrap();

        assert_eq!(send_fd_message(&s1, &[237], &[evt.as_raw_fd()]).unwrap(), 1);

        let mut buf = [0u8; 1];
        let (read, mut fds) = recv_fd_message(&s2, &mut buf, 2).unwrap();
        assert_eq!(read, 1);
        assert_eq!(buf[0], 237);
        assert!(fds[1].is_none());

        let fd = fds[0].take().unwrap();
        assert_ne!(fd.as_raw_fd(), evt.as_raw_fd());
        let mut file = File::from(fd);
        file.write_all(&1203u64.to_ne_bytes()).unwrap();
        assert_eq!(evt.read().unwrap(), 1203);
    }

    #[test]
    fn test_recv_peer_closed() {
        let (s1, s2) = UnixStream::pair().unwrap();
        drop(s1);

        let mut buf = [0u8; 4];
        let (read, fds) = recv_fd_message(&s2, &mut buf, 3).unwrap();
        assert_eq!(read, 0);
        assert_eq!(fds.len(), 3);
        assert!(fds.iter().all(Option::is_none));
    }

    #[test]
    fn test_recv_would_block() {
        let (_s1, s2) = UnixStream::pair().unwrap();
        s2.set_nonblocking(true).unwrap();

        let mut buf = [0u8; 4];
        match recv_fd_message(&s2, &mut buf, 1) {
            Err(FdMessageError::Recv(err)) => assert_eq!(err.kind(), io::ErrorKind::WouldBlock),
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn test_recv_truncated_payload() {
        let (s1, s2) = UnixDatagram::pair().unwrap();
        let evt = EventFd::new(0).unwrap();

        send_fd_message(&s1, &[1, 2, 3, 4, 5, 6, 7, 8], &[evt.as_raw_fd()]).unwrap();

        let mut buf = [0u8; 4];
        assert!(matches!(
            recv_fd_message(&s2, &mut buf, 1),
            Err(FdMessageError::Truncated)
        ));
    }

    #[test]
    fn test_recv_too_many_fds() {
        let (s1, s2) = UnixStream::pair().unwrap();
        let evts: Vec<EventFd> = (0..4).map(|_| EventFd::new(0).unwrap()).collect();
        let raw: Vec<RawFd> = evts.iter().map(AsRawFd::as_raw_fd).collect();

        send_fd_message(&s1, &[0xaa], &raw).unwrap();

        let mut buf = [0u8; 1];
        assert!(matches!(
            recv_fd_message(&s2, &mut buf, 1),
            Err(FdMessageError::Truncated)
        ));
    }

    #[test]
    fn test_recv_no_room_for_fds() {
        let (s1, s2) = UnixStream::pair().unwrap();
        let evt = EventFd::new(0).unwrap();

        send_fd_message(&s1, &[0xaa], &[evt.as_raw_fd()]).unwrap();

        let mut buf = [0u8; 1];
        assert!(matches!(
            recv_fd_message(&s2, &mut buf, 0),
            Err(FdMessageError::Truncated)
        ));
    }

    #[test]
    fn test_fd_limits() {
        let (s1, s2) = UnixStream::pair().unwrap();
        let raw = vec![s1.as_raw_fd(); SCM_MAX_FD + 1];
        assert!(matches!(
            send_fd_message(&s1, &[0], &raw),
            Err(FdMessageError::TooManyFds(n)) if n == SCM_MAX_FD + 1
        ));

        let mut buf = [0u8; 1];
        assert!(matches!(
            recv_fd_message(&s2, &mut buf, SCM_MAX_FD + 1),
            Err(FdMessageError::TooManyFds(_))
        ));
    }

    #[test]
    fn test_send_to_closed_peer() {
        let (s1, s2) = UnixStream::pair().unwrap();
        drop(s2);

        match send_fd_message(&s1, &[1], &[]) {
            Err(FdMessageError::Send(err)) => {
                assert_eq!(err.raw_os_error(), Some(libc::EPIPE))
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn test_fd_positions((max_fds, attached) in (0usize..8).prop_flat_map(|k| (Just(k), 0..=k))) {
            let (s1, s2) = UnixStream::pair().unwrap();
            let evts: Vec<EventFd> = (0..attached).map(|_| EventFd::new(0).unwrap()).collect();
            let raw: Vec<RawFd> = evts.iter().map(AsRawFd::as_raw_fd).collect();

            send_fd_message(&s1, b"vhost", &raw).unwrap();

            let mut buf = [0u8; 16];
            let (read, fds) = recv_fd_message(&s2, &mut buf, max_fds).unwrap();
            prop_assert_eq!(read, 5);
            prop_assert_eq!(fds.len(), max_fds);

            for (i, slot) in fds.into_iter().enumerate() {
                if i < attached {
                    let mut file = File::from(slot.unwrap());
                    file.write_all(&(i as u64 + 1).to_ne_bytes()).unwrap();
                    prop_assert_eq!(evts[i].read().unwrap(), i as u64 + 1);
                } else {
                    prop_assert!(slot.is_none());
                }
            }
        }
    }

    #[test]
    fn test_received_fd_is_independent() {
        let (s1, s2) = UnixStream::pair().unwrap();
        let (p1, mut p2) = UnixStream::pair().unwrap();

        send_fd_message(&s1, &[7], &[p1.as_raw_fd()]).unwrap();
        drop(p1);

        let mut buf = [0u8; 1];
        let (_, mut fds) = recv_fd_message(&s2, &mut buf, 1).unwrap();
        let mut received = UnixStream::from(fds[0].take().unwrap());

        received.write_all(b"ping").unwrap();
        let mut out = [0u8; 4];
        p2.read_exact(&mut out).unwrap();
        assert_eq!(&out, b"ping");
    }
}
