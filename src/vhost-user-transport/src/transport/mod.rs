// Copyright 2025 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! vhost-user transports.
//!
//! A transport owns the OS side of one vhost-user socket: it listens or connects, turns each
//! peer into a connection backed by a freshly allocated device, feeds readable connections to
//! the protocol handler and tears everything down on cleanup. [`af_unix`] is the only
//! transport.

pub mod af_unix;

use std::fmt;
use std::io;
use std::sync::Arc;

use vmm_sys_util::eventfd::EventFd;

use crate::backend::{DeviceBackend, DeviceError, ProtocolHandler};
use crate::config::SocketConfig;
use crate::dispatcher::{Dispatcher, DispatcherError};
use crate::transport::af_unix::reconnect::ReconnectScheduler;

/// Errors associated with starting and running a transport.
#[derive(Debug, thiserror::Error, displaydoc::Display)]
pub enum TransportError {
    /// Failed to create socket: {0}
    Socket(io::Error),
    /// Failed to set socket non-blocking: {0}
    NonBlocking(io::Error),
    /// Failed to update socket flags: {0}
    FdFlags(io::Error),
    /// Failed to bind to {0}: {1}
    Bind(String, io::Error),
    /// Failed to listen on {0}: {1}
    Listen(String, io::Error),
    /// Failed to connect to {0}: {1}
    Connect(String, io::Error),
    /// Socket was not initialized
    NotInitialized,
    /// Socket is shutting down
    Closed,
    /// Failed to allocate device: {0}
    DeviceAlloc(DeviceError),
    /// Failed to configure device: {0}
    DeviceConfig(DeviceError),
    /// Connection refused by socket owner: {0}
    NewConnection(DeviceError),
    /// Failed to register with the dispatcher: {0}
    Register(DispatcherError),
    /// Failed to signal vring call eventfd: {0}
    VringCall(io::Error),
}

/// Result of [`Transport::start`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StartOutcome {
    /// The server socket is accepting connections.
    Listening,
    /// The client socket is connected.
    Connected,
    /// The peer is not there yet; the connect is retried in the background.
    Pending,
}

/// Collaborators shared by every socket of a manager.
#[derive(Clone)]
pub struct TransportContext {
    /// Event loop the sockets register their fds with.
    pub dispatcher: Arc<dyn Dispatcher>,
    /// Device allocation.
    pub devices: Arc<dyn DeviceBackend>,
    /// vhost-user message handling.
    pub protocol: Arc<dyn ProtocolHandler>,
    /// Background connect retries for client sockets.
    pub reconnect: Arc<ReconnectScheduler>,
}

impl fmt::Debug for TransportContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportContext")
            .field("reconnect", &self.reconnect)
            .finish_non_exhaustive()
    }
}

/// One vhost-user socket.
pub trait Transport: Send + Sync + fmt::Debug {
    /// Prepares per-socket state. Called once before [`Transport::start`].
    fn init(&self) -> Result<(), TransportError>;

    /// Starts listening or connecting.
    fn start(&self) -> Result<StartOutcome, TransportError>;

    /// Stops accepting and reconnecting, then closes every connection.
    ///
    /// Waits for in-flight handlers of this socket's connections, so it must not be called
    /// from one of them.
    fn cleanup(&self);

    /// Notifies the front-end that a vring has new used buffers.
    fn vring_call(&self, call_fd: Option<&EventFd>) -> Result<(), TransportError>;

    /// Configuration the socket was created with.
    fn config(&self) -> &SocketConfig;

    /// Number of live connections.
    fn connection_count(&self) -> usize;
}
