// Copyright 2025 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! vhost-user over AF_UNIX stream sockets.
//!
//! A server socket binds its path and turns every accepted peer into a [`Connection`]. A
//! client socket connects to its path once; with reconnection enabled, a failed connect is
//! handed to the [`ReconnectScheduler`](reconnect::ReconnectScheduler) and a dropped
//! connection makes the socket connect again.
//!
//! Every connection owns one device. The device is destroyed exactly once, by whichever of
//! connection failure or socket cleanup removes the connection from the registry first.

pub mod endpoint;
pub mod reconnect;
pub mod registry;

use std::fmt;
use std::fs;
use std::os::fd::{AsFd, AsRawFd, OwnedFd, RawFd};
use std::os::unix::net::UnixStream;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use vmm_sys_util::eventfd::EventFd;

use self::endpoint::{ConnectError, UnixAddr};
use self::reconnect::ReconnectEntry;
use self::registry::{ConnectionRegistry, RegistryError};
use super::{StartOutcome, Transport, TransportContext, TransportError};
use crate::backend::{DeviceId, NotifyOps};
use crate::config::{SocketConfig, SocketRole};
use crate::dispatcher::{Disposition, FdHandler};
use crate::logger::{IncMetric, METRICS, debug, error, info, warn};

/// An established vhost-user connection and its device.
pub struct Connection {
    stream: UnixStream,
    vid: DeviceId,
    socket: Weak<AfUnixSocket>,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("fd", &self.stream.as_raw_fd())
            .field("vid", &self.vid)
            .finish()
    }
}

impl Connection {
    /// Device allocated for this connection.
    pub fn vid(&self) -> DeviceId {
        self.vid
    }

    /// The connection socket.
    pub fn stream(&self) -> &UnixStream {
        &self.stream
    }

    fn fd(&self) -> RawFd {
        self.stream.as_raw_fd()
    }
}

impl FdHandler for Connection {
    fn on_readable(&self, _fd: RawFd) -> Disposition {
        match self.socket.upgrade() {
            Some(socket) => socket.on_readable(self),
            None => Disposition::Remove,
        }
    }
}

struct ListenHandler {
    fd: OwnedFd,
    socket: Weak<AfUnixSocket>,
}

impl FdHandler for ListenHandler {
    fn on_readable(&self, fd: RawFd) -> Disposition {
        let Some(socket) = self.socket.upgrade() else {
            return Disposition::Remove;
        };

        let peer = match endpoint::accept(fd) {
            Ok(peer) => peer,
            Err(err) => {
                debug!("accept on fd {} failed: {}", fd, err);
                return Disposition::Keep;
            }
        };

        info!("new vhost user connection is {}", peer.as_raw_fd());
        METRICS.transport.connections_accepted.inc();
        // Failures are logged and counted by `on_new_peer`.
        let _ = socket.on_new_peer(peer);
        Disposition::Keep
    }
}

enum EndpointState {
    Closed,
    Prepared(OwnedFd),
    Listening(Arc<ListenHandler>),
}

/// A vhost-user socket on a filesystem path.
pub struct AfUnixSocket {
    config: SocketConfig,
    addr: UnixAddr,
    notify_ops: Arc<dyn NotifyOps>,
    ctx: TransportContext,
    registry: ConnectionRegistry,
    endpoint: Mutex<EndpointState>,
    closing: AtomicBool,
    weak_self: Weak<AfUnixSocket>,
}

impl fmt::Debug for AfUnixSocket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AfUnixSocket")
            .field("config", &self.config)
            .field("addr", &self.addr)
            .field("registry", &self.registry)
            .field("closing", &self.closing)
            .finish_non_exhaustive()
    }
}

impl AfUnixSocket {
    /// Creates a socket for `config`. Nothing is opened before [`Transport::init`].
    pub fn new(
        config: SocketConfig,
        notify_ops: Arc<dyn NotifyOps>,
        ctx: TransportContext,
    ) -> Arc<Self> {
        let addr = UnixAddr::new(&config.path);
        Arc::new_cyclic(|weak_self| AfUnixSocket {
            config,
            addr,
            notify_ops,
            ctx,
            registry: ConnectionRegistry::new(),
            endpoint: Mutex::new(EndpointState::Closed),
            closing: AtomicBool::new(false),
            weak_self: weak_self.clone(),
        })
    }

    /// Path the socket lives at, after truncation.
    pub fn path(&self) -> PathBuf {
        self.addr.path()
    }

    /// Live connections.
    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    /// Fd of the listening socket, if the server is accepting.
    pub fn listen_fd(&self) -> Option<RawFd> {
        match &*self.endpoint() {
            EndpointState::Listening(listener) => Some(listener.fd.as_raw_fd()),
            _ => None,
        }
    }

    fn endpoint(&self) -> MutexGuard<'_, EndpointState> {
        self.endpoint
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn is_closing(&self) -> bool {
        self.closing.load(Ordering::Acquire)
    }

    fn prepare(&self) -> Result<OwnedFd, TransportError> {
        let fd = endpoint::create_unix_socket().map_err(TransportError::Socket)?;
        if self.config.role == SocketRole::Client {
            endpoint::set_nonblocking(fd.as_fd()).map_err(|err| {
                error!(
                    "vhost-user error: can't set nonblocking mode for socket, fd: {}",
                    fd.as_raw_fd()
                );
                TransportError::NonBlocking(err)
            })?;
        }
        Ok(fd)
    }

    fn start_server(&self, fd: OwnedFd) -> Result<StartOutcome, TransportError> {
        let path = self.config.path.clone();

        // A failed bind leaves whatever occupies the path alone.
        if let Err(err) = endpoint::bind(fd.as_fd(), &self.addr) {
            error!(
                "failed to bind to {}: {}; remove it and try again",
                path, err
            );
            return Err(TransportError::Bind(path, err));
        }
        info!("bind to {}", path);

        if let Err(err) = endpoint::listen(fd.as_fd()) {
            error!("failed to listen on {}: {}", path, err);
            return Err(TransportError::Listen(path, err));
        }

        let raw = fd.as_raw_fd();
        let listener = Arc::new(ListenHandler {
            fd,
            socket: self.weak_self.clone(),
        });
        if let Err(err) = self.ctx.dispatcher.register(raw, listener.clone()) {
            error!("failed to add listen fd {} to vhost server fdset", raw);
            return Err(TransportError::Register(err));
        }
        *self.endpoint() = EndpointState::Listening(listener);
        self.ctx.dispatcher.wake();

        Ok(StartOutcome::Listening)
    }

    fn start_client(&self, fd: OwnedFd) -> Result<StartOutcome, TransportError> {
        let path = &self.config.path;

        match endpoint::connect_nonblock(fd.as_fd(), &self.addr) {
            Ok(()) => {
                self.on_new_peer(fd)?;
                Ok(StartOutcome::Connected)
            }
            Err(ConnectError::Fatal(err)) => {
                error!("can't disable nonblocking on fd {}: {}", fd.as_raw_fd(), err);
                METRICS.transport.connect_fails.inc();
                Err(TransportError::FdFlags(err))
            }
            Err(ConnectError::Transient(err)) => {
                warn!("failed to connect to {}: {}", path, err);
                METRICS.transport.connect_fails.inc();
                if !self.config.reconnects() {
                    return Err(TransportError::Connect(path.clone(), err));
                }
                let socket = self.weak_self.upgrade().ok_or(TransportError::Closed)?;

                info!("{}: reconnecting...", path);
                self.ctx.reconnect.push(ReconnectEntry::new(self.addr, fd, socket));
                // Cleanup may have purged the list before the push.
                if self.is_closing() {
                    self.ctx.reconnect.remove_for(self);
                    return Err(TransportError::Closed);
                }
                Ok(StartOutcome::Pending)
            }
        }
    }

    // Replaces a dropped client connection.
    fn restart_client(&self) {
        if self.is_closing() {
            return;
        }
        let result = self.prepare().and_then(|fd| self.start_client(fd));
        if let Err(err) = result {
            error!("failed to restart client {}: {}", self.config.path, err);
        }
    }

    /// Turns a connected peer into a [`Connection`]: allocates and configures its device,
    /// notifies the owner and starts watching the fd.
    ///
    /// On failure the device, if any, is destroyed and `fd` is closed.
    pub fn on_new_peer(&self, fd: OwnedFd) -> Result<(), TransportError> {
        let result = self.add_connection(fd);
        if result.is_err() {
            METRICS.transport.connection_setup_fails.inc();
        }
        result
    }

    fn add_connection(&self, fd: OwnedFd) -> Result<(), TransportError> {
        if self.is_closing() {
            return Err(TransportError::Closed);
        }
        let raw = fd.as_raw_fd();
        let devices = &self.ctx.devices;

        let vid = devices.new_device().map_err(|err| {
            error!("failed to allocate device for connection with fd {}", raw);
            TransportError::DeviceAlloc(err)
        })?;

        if let Err(err) = devices.configure_device(vid, &self.config.device_params()) {
            error!("failed to configure device {} for {}", vid, self.config.path);
            devices.destroy_device(vid);
            return Err(TransportError::DeviceConfig(err));
        }
        info!("new device, handle is {}", vid);

        if let Err(err) = self.notify_ops.new_connection(vid) {
            error!("failed to add vhost user connection with fd {}", raw);
            devices.destroy_device(vid);
            return Err(TransportError::NewConnection(err));
        }

        let conn = Arc::new(Connection {
            stream: UnixStream::from(fd),
            vid,
            socket: self.weak_self.clone(),
        });
        let registered =
            self.registry
                .register(raw, conn.clone(), &*self.ctx.dispatcher, conn.clone());
        if let Err(err) = registered {
            // Dropping `conn` closes the fd.
            self.notify_ops.destroy_connection(vid);
            devices.destroy_device(vid);
            return Err(match err {
                RegistryError::Closed => {
                    info!("dropping connection {} of device {}: socket closed", raw, vid);
                    TransportError::Closed
                }
                RegistryError::Dispatcher(err) => {
                    error!("failed to add fd {} into vhost server fdset", raw);
                    TransportError::Register(err)
                }
            });
        }

        self.ctx.dispatcher.wake();
        METRICS.transport.connections_established.inc();
        Ok(())
    }

    /// Runs the protocol handler for `conn`, tearing the connection down when it fails.
    pub fn on_readable(&self, conn: &Connection) -> Disposition {
        let Err(err) = self.ctx.protocol.handle(conn.vid, conn.stream.as_fd()) else {
            return Disposition::Keep;
        };

        // Cleanup may already own this connection; whoever removes it destroys the device.
        if self.registry.remove(conn.fd()).is_none() {
            return Disposition::Remove;
        }
        info!(
            "vhost-user connection {} of device {} closed: {}",
            conn.fd(),
            conn.vid,
            err
        );
        self.notify_ops.destroy_connection(conn.vid);
        self.ctx.devices.destroy_device(conn.vid);
        METRICS.transport.connections_closed.inc();

        if self.config.reconnects() {
            self.restart_client();
        }
        Disposition::Remove
    }
}

impl Transport for AfUnixSocket {
    fn init(&self) -> Result<(), TransportError> {
        let fd = self.prepare()?;
        *self.endpoint() = EndpointState::Prepared(fd);
        Ok(())
    }

    fn start(&self) -> Result<StartOutcome, TransportError> {
        if self.is_closing() {
            return Err(TransportError::Closed);
        }
        let state = std::mem::replace(&mut *self.endpoint(), EndpointState::Closed);
        let fd = match state {
            EndpointState::Prepared(fd) => fd,
            EndpointState::Listening(listener) => {
                *self.endpoint() = EndpointState::Listening(listener);
                return Ok(StartOutcome::Listening);
            }
            EndpointState::Closed => return Err(TransportError::NotInitialized),
        };

        match self.config.role {
            SocketRole::Server => self.start_server(fd),
            SocketRole::Client => self.start_client(fd),
        }
    }

    fn cleanup(&self) {
        self.closing.store(true, Ordering::Release);

        let endpoint = std::mem::replace(&mut *self.endpoint(), EndpointState::Closed);
        if let EndpointState::Listening(listener) = endpoint {
            self.ctx.dispatcher.deregister(listener.fd.as_raw_fd());
            drop(listener);
            if let Err(err) = fs::remove_file(self.addr.path()) {
                warn!("failed to remove {}: {}", self.addr.path().display(), err);
            }
        } else if self.config.reconnects() {
            self.ctx.reconnect.remove_for(self);
        }

        // Connections set up concurrently either made it in before this point or are refused.
        self.registry.close();
        let devices = &self.ctx.devices;
        let path = &self.config.path;
        self.registry.drain(&*self.ctx.dispatcher, |conn| {
            info!("free connfd = {} for device '{}'", conn.fd(), path);
            devices.destroy_device(conn.vid);
            METRICS.transport.connections_closed.inc();
        });
    }

    fn vring_call(&self, call_fd: Option<&EventFd>) -> Result<(), TransportError> {
        match call_fd {
            Some(evt) => evt.write(1).map_err(TransportError::VringCall),
            None => Ok(()),
        }
    }

    fn config(&self) -> &SocketConfig {
        &self.config
    }

    fn connection_count(&self) -> usize {
        self.registry.len()
    }
}
