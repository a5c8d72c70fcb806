// Copyright 2025 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Socket bookkeeping for an embedding process.

use std::collections::HashMap;
use std::io;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::backend::{DeviceBackend, NotifyOps, ProtocolHandler};
use crate::config::SocketConfig;
use crate::dispatcher::Dispatcher;
use crate::logger::info;
use crate::transport::af_unix::AfUnixSocket;
use crate::transport::af_unix::reconnect::ReconnectScheduler;
use crate::transport::{StartOutcome, Transport, TransportContext, TransportError};

/// Errors associated with managing vhost-user sockets.
#[derive(Debug, thiserror::Error, displaydoc::Display)]
pub enum ManagerError {
    /// Socket already registered: {0}
    DuplicatePath(String),
    /// No socket registered at {0}
    UnknownPath(String),
    /// {0}
    Transport(#[from] TransportError),
    /// Failed to start the reconnect thread: {0}
    ReconnectThread(io::Error),
}

/// Owns the vhost-user sockets of a process, keyed by path.
///
/// Calls into a socket are made without the manager lock, so a socket's cleanup may take as
/// long as its in-flight handlers without blocking lookups of other sockets.
#[derive(Debug)]
pub struct VhostUserManager {
    ctx: TransportContext,
    sockets: Mutex<HashMap<String, Arc<dyn Transport>>>,
}

impl VhostUserManager {
    /// Creates a manager and starts its reconnect thread.
    pub fn new(
        dispatcher: Arc<dyn Dispatcher>,
        devices: Arc<dyn DeviceBackend>,
        protocol: Arc<dyn ProtocolHandler>,
    ) -> Result<Self, ManagerError> {
        let reconnect = Arc::new(ReconnectScheduler::default());
        reconnect.start().map_err(ManagerError::ReconnectThread)?;

        Ok(Self::from_context(TransportContext {
            dispatcher,
            devices,
            protocol,
            reconnect,
        }))
    }

    /// Creates a manager around existing collaborators. The reconnect scheduler is used as
    /// is, running or not.
    pub fn from_context(ctx: TransportContext) -> Self {
        VhostUserManager {
            ctx,
            sockets: Mutex::new(HashMap::new()),
        }
    }

    fn sockets(&self) -> MutexGuard<'_, HashMap<String, Arc<dyn Transport>>> {
        self.sockets
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Creates and initializes the socket described by `config`, notifying `ops` about its
    /// connections.
    pub fn register(
        &self,
        config: SocketConfig,
        ops: Arc<dyn NotifyOps>,
    ) -> Result<Arc<dyn Transport>, ManagerError> {
        let mut sockets = self.sockets();
        if sockets.contains_key(&config.path) {
            return Err(ManagerError::DuplicatePath(config.path));
        }

        let path = config.path.clone();
        let role = config.role;
        let socket: Arc<dyn Transport> = AfUnixSocket::new(config, ops, self.ctx.clone());
        socket.init()?;
        sockets.insert(path.clone(), socket.clone());

        info!("registered vhost-user {} socket {}", role, path);
        Ok(socket)
    }

    /// Starts listening or connecting on the socket at `path`.
    pub fn start(&self, path: &str) -> Result<StartOutcome, ManagerError> {
        let socket = self
            .socket(path)
            .ok_or_else(|| ManagerError::UnknownPath(path.to_string()))?;
        Ok(socket.start()?)
    }

    /// Cleans up and forgets the socket at `path`.
    pub fn unregister(&self, path: &str) -> Result<(), ManagerError> {
        let socket = self
            .sockets()
            .remove(path)
            .ok_or_else(|| ManagerError::UnknownPath(path.to_string()))?;
        socket.cleanup();
        info!("unregistered vhost-user socket {}", path);
        Ok(())
    }

    /// The socket registered at `path`.
    pub fn socket(&self, path: &str) -> Option<Arc<dyn Transport>> {
        self.sockets().get(path).cloned()
    }

    /// Paths of all registered sockets.
    pub fn paths(&self) -> Vec<String> {
        let mut paths: Vec<String> = self.sockets().keys().cloned().collect();
        paths.sort();
        paths
    }

    /// Collaborators shared by the sockets.
    pub fn context(&self) -> &TransportContext {
        &self.ctx
    }
}

impl Drop for VhostUserManager {
    fn drop(&mut self) {
        let sockets: Vec<Arc<dyn Transport>> =
            self.sockets().drain().map(|(_, socket)| socket).collect();
        for socket in sockets {
            socket.cleanup();
        }
        self.ctx.reconnect.stop();
    }
}

#[cfg(test)]
mod tests {
    use std::os::unix::net::UnixStream;
    use std::path::Path;

    use vmm_sys_util::tempdir::TempDir;

    use super::*;
    use crate::test_utils::TestHarness;

    fn path_in(dir: &TempDir, name: &str) -> String {
        dir.as_path().join(name).to_str().unwrap().to_string()
    }

    #[test]
    fn test_register_start_unregister() {
        let dir = TempDir::new().unwrap();
        let path = path_in(&dir, "server.sock");
        let harness = TestHarness::new();
        let manager = VhostUserManager::from_context(harness.context());

        let socket = manager
            .register(SocketConfig::server(&path), harness.notify.clone())
            .unwrap();
        assert_eq!(socket.config().path, path);
        assert_eq!(manager.paths(), vec![path.clone()]);
        assert_eq!(manager.start(&path).unwrap(), StartOutcome::Listening);
        assert!(Path::new(&path).exists());

        manager.unregister(&path).unwrap();
        assert!(!Path::new(&path).exists());
        assert!(manager.socket(&path).is_none());
        assert_eq!(harness.dispatcher.registered_count(), 0);
    }

    #[test]
    fn test_errors() {
        let dir = TempDir::new().unwrap();
        let path = path_in(&dir, "sock");
        let harness = TestHarness::new();
        let manager = VhostUserManager::from_context(harness.context());

        manager
            .register(SocketConfig::server(&path), harness.notify.clone())
            .unwrap();
        assert!(matches!(
            manager.register(SocketConfig::client(&path, true), harness.notify.clone()),
            Err(ManagerError::DuplicatePath(p)) if p == path
        ));
        assert!(matches!(
            manager.start("/nowhere"),
            Err(ManagerError::UnknownPath(_))
        ));
        assert!(matches!(
            manager.unregister("/nowhere"),
            Err(ManagerError::UnknownPath(_))
        ));

        let client = path_in(&dir, "missing");
        manager
            .register(SocketConfig::client(&client, false), harness.notify.clone())
            .unwrap();
        assert!(matches!(
            manager.start(&client),
            Err(ManagerError::Transport(TransportError::Connect(..)))
        ));
    }

    #[test]
    fn test_drop_cleans_up() {
        let dir = TempDir::new().unwrap();
        let server = path_in(&dir, "server.sock");
        let client = path_in(&dir, "client.sock");
        let harness = TestHarness::new();

        {
            let manager = VhostUserManager::from_context(harness.context());
            manager
                .register(SocketConfig::server(&server), harness.notify.clone())
                .unwrap();
            manager.start(&server).unwrap();
            manager
                .register(SocketConfig::client(&client, true), harness.notify.clone())
                .unwrap();
            assert_eq!(manager.start(&client).unwrap(), StartOutcome::Pending);

            let _peer = UnixStream::connect(&server).unwrap();
            assert_eq!(harness.reconnect.len(), 1);
        }

        assert!(!Path::new(&server).exists());
        assert!(harness.reconnect.is_empty());
        assert!(!harness.reconnect.is_running());
        assert_eq!(harness.dispatcher.registered_count(), 0);
    }

    #[test]
    fn test_new_starts_scheduler() {
        let harness = TestHarness::new();
        let manager = VhostUserManager::new(
            harness.dispatcher.clone(),
            harness.devices.clone(),
            harness.protocol.clone(),
        )
        .unwrap();
        assert!(manager.context().reconnect.is_running());

        let reconnect = manager.context().reconnect.clone();
        drop(manager);
        assert!(!reconnect.is_running());
    }
}
