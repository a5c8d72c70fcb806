// Copyright 2025 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

#![warn(missing_docs)]
#![warn(clippy::undocumented_unsafe_blocks)]

//! Connection management for vhost-user back-ends over AF_UNIX sockets.
//!
//! A back-end registers one [`VhostUserManager`] socket per vhost-user interface. Server sockets
//! accept front-end connections on a filesystem path; client sockets connect to one and, when
//! configured to, keep retrying in the background until the front-end shows up. Every
//! connection gets its own device from the [`DeviceBackend`], and its incoming messages are
//! handed to the [`ProtocolHandler`] from the dispatcher thread.
//!
//! File descriptors travel alongside messages through [`fd_message`].

pub mod backend;
pub mod config;
pub mod dispatcher;
pub mod fd_message;
pub mod logger;
pub mod manager;
#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;
pub mod transport;

pub use crate::backend::{
    DeviceBackend, DeviceError, DeviceId, NotifyOps, ProtocolError, ProtocolHandler,
};
pub use crate::config::{DeviceParams, SocketConfig, SocketRole};
pub use crate::dispatcher::{Dispatcher, DispatcherError, Disposition, FdHandler, FdSet};
pub use crate::fd_message::{FdMessageError, recv_fd_message, send_fd_message};
pub use crate::manager::{ManagerError, VhostUserManager};
pub use crate::transport::af_unix::AfUnixSocket;
pub use crate::transport::{StartOutcome, Transport, TransportContext, TransportError};
