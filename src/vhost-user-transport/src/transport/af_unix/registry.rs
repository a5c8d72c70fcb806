// Copyright 2025 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Live connections of one socket.

use std::collections::BTreeMap;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use super::Connection;
use crate::backend::DeviceId;
use crate::dispatcher::{Dispatcher, DispatcherError, FdHandler, TryDeregister};

/// Errors associated with [`ConnectionRegistry::register`].
#[derive(Debug, thiserror::Error, displaydoc::Display)]
pub enum RegistryError {
    /// Connection registry is closed
    Closed,
    /// {0}
    Dispatcher(#[from] DispatcherError),
}

/// Result of [`ConnectionRegistry::remove_safely`].
#[derive(Debug)]
pub enum Removal<C> {
    /// The connection was removed and its fd is no longer watched.
    Found(Arc<C>),
    /// No connection with that fd.
    NotFound,
    /// The connection's handler is running. Nothing was removed.
    Busy,
}

/// Connections keyed by fd.
///
/// Removal goes through the dispatcher while the registry lock is held, so a connection that
/// left the registry can no longer be handed to a handler. Once closed, the registry refuses
/// new registrations, so a drain that follows [`ConnectionRegistry::close`] is final.
#[derive(Debug)]
pub struct ConnectionRegistry<C = Connection> {
    conns: Mutex<BTreeMap<RawFd, Arc<C>>>,
    // Only changed with `conns` locked.
    closed: AtomicBool,
}

impl<C> Default for ConnectionRegistry<C> {
    fn default() -> Self {
        ConnectionRegistry {
            conns: Mutex::new(BTreeMap::new()),
            closed: AtomicBool::new(false),
        }
    }
}

impl<C> ConnectionRegistry<C> {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    fn conns(&self) -> MutexGuard<'_, BTreeMap<RawFd, Arc<C>>> {
        self.conns.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Adds `conn` under `fd`.
    pub fn insert(&self, fd: RawFd, conn: Arc<C>) {
        self.conns().insert(fd, conn);
    }

    /// Registers `conn` with `dispatcher` and adds it, atomically with respect to removals
    /// and to [`ConnectionRegistry::close`].
    pub fn register(
        &self,
        fd: RawFd,
        conn: Arc<C>,
        dispatcher: &dyn Dispatcher,
        handler: Arc<dyn FdHandler>,
    ) -> Result<(), RegistryError> {
        let mut conns = self.conns();
        if self.closed.load(Ordering::Acquire) {
            return Err(RegistryError::Closed);
        }
        dispatcher.register(fd, handler)?;
        conns.insert(fd, conn);
        Ok(())
    }

    /// Makes every later [`ConnectionRegistry::register`] fail. Registrations that completed
    /// before stay in place for [`ConnectionRegistry::drain`].
    pub fn close(&self) {
        let _conns = self.conns();
        self.closed.store(true, Ordering::Release);
    }

    /// Whether the registry was closed.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Removes the connection of `fd`. The caller is responsible for the dispatcher side.
    pub fn remove(&self, fd: RawFd) -> Option<Arc<C>> {
        self.conns().remove(&fd)
    }

    /// Removes the connection of `fd` if its handler is not running.
    ///
    /// On [`Removal::Busy`] the caller must not retry while holding locks the handler might
    /// need.
    pub fn remove_safely(&self, fd: RawFd, dispatcher: &dyn Dispatcher) -> Removal<C> {
        let mut conns = self.conns();
        if !conns.contains_key(&fd) {
            return Removal::NotFound;
        }
        match dispatcher.try_deregister(fd) {
            TryDeregister::Busy => Removal::Busy,
            TryDeregister::Removed | TryDeregister::NotFound => match conns.remove(&fd) {
                Some(conn) => Removal::Found(conn),
                None => Removal::NotFound,
            },
        }
    }

    /// Removes every connection, calling `f` on each with the registry locked.
    ///
    /// A busy connection makes the scan start over after the lock was released and the
    /// thread yielded, giving its handler the chance to finish. Returns only when the
    /// registry is empty.
    pub fn drain<F>(&self, dispatcher: &dyn Dispatcher, mut f: F)
    where
        F: FnMut(Arc<C>),
    {
        'again: loop {
            let mut conns = self.conns();
            let fds: Vec<RawFd> = conns.keys().copied().collect();
            for fd in fds {
                match dispatcher.try_deregister(fd) {
                    TryDeregister::Busy => {
                        drop(conns);
                        std::thread::yield_now();
                        continue 'again;
                    }
                    TryDeregister::Removed | TryDeregister::NotFound => {
                        if let Some(conn) = conns.remove(&fd) {
                            f(conn);
                        }
                    }
                }
            }
            return;
        }
    }

    /// Number of connections.
    pub fn len(&self) -> usize {
        self.conns().len()
    }

    /// Whether there are no connections.
    pub fn is_empty(&self) -> bool {
        self.conns().is_empty()
    }

    /// Whether a connection is registered under `fd`.
    pub fn contains(&self, fd: RawFd) -> bool {
        self.conns().contains_key(&fd)
    }

    /// Fds of all connections, ascending.
    pub fn fds(&self) -> Vec<RawFd> {
        self.conns().keys().copied().collect()
    }
}

impl ConnectionRegistry<Connection> {
    /// Devices of all connections, in fd order.
    pub fn device_ids(&self) -> Vec<DeviceId> {
        self.conns().values().map(|conn| conn.vid()).collect()
    }
}
