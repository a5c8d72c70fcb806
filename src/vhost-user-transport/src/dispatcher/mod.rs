// Copyright 2025 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! File descriptor event dispatching.
//!
//! The transport registers listening sockets and connections with a [`Dispatcher`] and is
//! called back from the dispatcher thread when they become readable. Handlers run without any
//! dispatcher lock held, so a handler may register new fds or wake the dispatcher. While a
//! handler runs, its fd is *busy*: [`Dispatcher::try_deregister`] reports
//! [`TryDeregister::Busy`] and the caller is expected to release its own locks, yield and
//! retry.

mod fdset;

use std::io;
use std::os::fd::RawFd;
use std::sync::Arc;

pub use self::fdset::{FdSet, MAX_FDS};

/// What the dispatcher does with an fd after its handler returned.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Disposition {
    /// Keep watching the fd.
    Keep,
    /// Deregister the fd and drop the handler.
    Remove,
}

/// Callback for a registered fd.
pub trait FdHandler: Send + Sync {
    /// `fd` is readable, or its peer hung up.
    fn on_readable(&self, fd: RawFd) -> Disposition;
}

/// Outcome of [`Dispatcher::try_deregister`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TryDeregister {
    /// The fd was registered and has been removed.
    Removed,
    /// The fd is not registered.
    NotFound,
    /// The fd's handler is running. Nothing was removed.
    Busy,
}

/// Errors associated with the dispatcher.
#[derive(Debug, thiserror::Error, displaydoc::Display)]
pub enum DispatcherError {
    /// Too many registered file descriptors
    Full,
    /// File descriptor already registered: {0}
    AlreadyRegistered(RawFd),
    /// Epoll operation failed: {0}
    Epoll(io::Error),
    /// Failed to create or signal the wake eventfd: {0}
    EventFd(io::Error),
}

/// Event loop the transport registers its fds with.
pub trait Dispatcher: Send + Sync {
    /// Watches `fd` for read events, calling `handler` for each.
    fn register(&self, fd: RawFd, handler: Arc<dyn FdHandler>) -> Result<(), DispatcherError>;

    /// Stops watching `fd` without waiting for a running handler.
    fn try_deregister(&self, fd: RawFd) -> TryDeregister;

    /// Stops watching `fd`, waiting for its handler to return if it is running.
    ///
    /// Must not be called from the handler of `fd` itself.
    fn deregister(&self, fd: RawFd) {
        while self.try_deregister(fd) == TryDeregister::Busy {
            std::thread::yield_now();
        }
    }

    /// Interrupts a blocking wait so that newly registered fds are picked up.
    fn wake(&self);
}
