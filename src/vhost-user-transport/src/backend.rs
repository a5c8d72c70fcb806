// Copyright 2025 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Interfaces of the device layer and of the vhost-user message handler.
//!
//! The transport never looks inside a device or a message. It allocates a device per
//! connection, tells the owner of the socket about connections coming and going, and hands
//! readable connection fds to the [`ProtocolHandler`].

use std::fmt;
use std::io;
use std::os::fd::BorrowedFd;

use crate::config::DeviceParams;

/// Handle of a virtio device instance, one per connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DeviceId(pub u32);

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Errors reported by the device layer.
#[derive(Debug, thiserror::Error, displaydoc::Display)]
pub enum DeviceError {
    /// No free device slot
    NoFreeSlot,
    /// Unknown device: {0}
    UnknownDevice(DeviceId),
    /// Failed to attach vDPA device {0}
    VdpaAttach(u32),
    /// Connection rejected: {0}
    Rejected(String),
}

/// Device allocation and configuration.
pub trait DeviceBackend: Send + Sync {
    /// Allocates a new device.
    fn new_device(&self) -> Result<DeviceId, DeviceError>;
    /// Applies the socket's device parameters to a freshly allocated device.
    fn configure_device(&self, vid: DeviceId, params: &DeviceParams) -> Result<(), DeviceError>;
    /// Releases a device. Called exactly once per successfully allocated device.
    fn destroy_device(&self, vid: DeviceId);
}

/// Connection notifications delivered to the owner of a socket.
pub trait NotifyOps: Send + Sync {
    /// A connection was set up for `vid`. Returning an error drops the connection.
    fn new_connection(&self, _vid: DeviceId) -> Result<(), DeviceError> {
        Ok(())
    }

    /// The connection of `vid` failed and is being torn down.
    fn destroy_connection(&self, _vid: DeviceId) {}
}

/// Errors reported by the protocol handler. Any error ends the connection.
#[derive(Debug, thiserror::Error, displaydoc::Display)]
pub enum ProtocolError {
    /// Peer closed the connection
    PeerClosed,
    /// I/O error on the connection: {0}
    Io(#[from] io::Error),
    /// Invalid message: {0}
    InvalidMessage(String),
}

/// Processes vhost-user messages arriving on a connection.
pub trait ProtocolHandler: Send + Sync {
    /// Handles the pending input on `fd`, the connection of device `vid`.
    ///
    /// Called from the dispatcher thread whenever `fd` is readable or has hung up.
    fn handle(&self, vid: DeviceId, fd: BorrowedFd<'_>) -> Result<(), ProtocolError>;
}
