// Copyright 2025 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

#![doc(hidden)]
#![allow(missing_docs, clippy::unwrap_used)]

//! Mock collaborators for unit and integration tests.

use std::collections::{BTreeSet, HashMap};
use std::os::fd::{BorrowedFd, RawFd};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::mpsc::{Receiver, Sender, channel};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::backend::{
    DeviceBackend, DeviceError, DeviceId, NotifyOps, ProtocolError, ProtocolHandler,
};
use crate::config::{DeviceParams, SocketConfig};
use crate::dispatcher::{
    Dispatcher, DispatcherError, Disposition, FdHandler, TryDeregister,
};
use crate::fd_message::{FdMessageError, recv_fd_message};
use crate::transport::TransportContext;
use crate::transport::af_unix::AfUnixSocket;
use crate::transport::af_unix::reconnect::{DEFAULT_RECONNECT_INTERVAL, ReconnectScheduler};

/// Hands out increasing device ids and checks that each is destroyed exactly once.
#[derive(Debug, Default)]
pub struct MockDeviceBackend {
    next: AtomicU32,
    live: Mutex<BTreeSet<DeviceId>>,
    destroyed: Mutex<Vec<DeviceId>>,
    params: Mutex<HashMap<DeviceId, DeviceParams>>,
    fail_alloc: AtomicBool,
    fail_config: AtomicBool,
}

impl MockDeviceBackend {
    pub fn fail_allocations(&self, fail: bool) {
        self.fail_alloc.store(fail, Ordering::SeqCst);
    }

    pub fn fail_configuration(&self, fail: bool) {
        self.fail_config.store(fail, Ordering::SeqCst);
    }

    pub fn live(&self) -> usize {
        self.live.lock().unwrap().len()
    }

    pub fn destroyed(&self) -> Vec<DeviceId> {
        self.destroyed.lock().unwrap().clone()
    }

    pub fn params(&self, vid: DeviceId) -> Option<DeviceParams> {
        self.params.lock().unwrap().get(&vid).cloned()
    }
}

impl DeviceBackend for MockDeviceBackend {
    fn new_device(&self) -> Result<DeviceId, DeviceError> {
        if self.fail_alloc.load(Ordering::SeqCst) {
            return Err(DeviceError::NoFreeSlot);
        }
        let vid = DeviceId(self.next.fetch_add(1, Ordering::SeqCst));
        self.live.lock().unwrap().insert(vid);
        Ok(vid)
    }

    fn configure_device(&self, vid: DeviceId, params: &DeviceParams) -> Result<(), DeviceError> {
        if !self.live.lock().unwrap().contains(&vid) {
            return Err(DeviceError::UnknownDevice(vid));
        }
        if self.fail_config.load(Ordering::SeqCst) {
            return Err(DeviceError::VdpaAttach(params.vdpa_device_id.unwrap_or_default()));
        }
        self.params.lock().unwrap().insert(vid, params.clone());
        Ok(())
    }

    fn destroy_device(&self, vid: DeviceId) {
        assert!(
            self.live.lock().unwrap().remove(&vid),
            "device {vid} destroyed twice"
        );
        self.destroyed.lock().unwrap().push(vid);
    }
}

/// Records connection notifications and optionally rejects or holds new connections.
#[derive(Debug, Default)]
pub struct MockNotifyOps {
    reject: AtomicBool,
    hold: Mutex<Option<(Sender<DeviceId>, Receiver<()>)>>,
    pub new_connections: Mutex<Vec<DeviceId>>,
    pub destroyed_connections: Mutex<Vec<DeviceId>>,
}

impl MockNotifyOps {
    pub fn reject_connections(&self, reject: bool) {
        self.reject.store(reject, Ordering::SeqCst);
    }

    /// Blocks the next `new_connection` call. Its device id is reported on the returned
    /// receiver; the call returns once the returned sender is used or dropped.
    pub fn hold_next_connection(&self) -> (Receiver<DeviceId>, Sender<()>) {
        let (entered_tx, entered_rx) = channel();
        let (release_tx, release_rx) = channel();
        *self.hold.lock().unwrap() = Some((entered_tx, release_rx));
        (entered_rx, release_tx)
    }
}

impl NotifyOps for MockNotifyOps {
    fn new_connection(&self, vid: DeviceId) -> Result<(), DeviceError> {
        let hold = self.hold.lock().unwrap().take();
        if let Some((entered, release)) = hold {
            entered.send(vid).unwrap();
            let _ = release.recv();
        }
        if self.reject.load(Ordering::SeqCst) {
            return Err(DeviceError::Rejected(format!("device {vid}")));
        }
        self.new_connections.lock().unwrap().push(vid);
        Ok(())
    }

    fn destroy_connection(&self, vid: DeviceId) {
        self.destroyed_connections.lock().unwrap().push(vid);
    }
}

/// Reads one message per call; fails on peer close or when told to.
#[derive(Debug, Default)]
pub struct MockProtocol {
    fail: AtomicBool,
    delay: Mutex<Duration>,
    entered: Mutex<Option<Sender<DeviceId>>>,
    calls: AtomicUsize,
}

impl MockProtocol {
    pub fn fail(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = delay;
    }

    /// Reports every handler invocation on `tx` before the delay starts.
    pub fn notify_entry(&self, tx: Sender<DeviceId>) {
        *self.entered.lock().unwrap() = Some(tx);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl ProtocolHandler for MockProtocol {
    fn handle(&self, vid: DeviceId, fd: BorrowedFd<'_>) -> Result<(), ProtocolError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(tx) = self.entered.lock().unwrap().as_ref() {
            let _ = tx.send(vid);
        }
        let delay = *self.delay.lock().unwrap();
        if !delay.is_zero() {
            std::thread::sleep(delay);
        }

        let mut buf = [0u8; 64];
        match recv_fd_message(&fd, &mut buf, 8) {
            Ok((0, _)) => return Err(ProtocolError::PeerClosed),
            Ok(_) => {}
            Err(FdMessageError::Recv(err)) => return Err(ProtocolError::Io(err)),
            Err(err) => return Err(ProtocolError::InvalidMessage(err.to_string())),
        }
        if self.fail.load(Ordering::SeqCst) {
            return Err(ProtocolError::InvalidMessage("rejected by test".to_string()));
        }
        Ok(())
    }
}

/// Dispatcher without an event loop; tests fire handlers by hand.
#[derive(Default)]
pub struct MockDispatcher {
    handlers: Mutex<HashMap<RawFd, Arc<dyn FdHandler>>>,
    busy: Mutex<HashMap<RawFd, usize>>,
    busy_reports: AtomicUsize,
    wakes: AtomicUsize,
}

impl std::fmt::Debug for MockDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockDispatcher")
            .field("registered", &self.registered_count())
            .finish_non_exhaustive()
    }
}

impl MockDispatcher {
    /// Makes the next `times` removals of `fd` report busy.
    pub fn set_busy(&self, fd: RawFd, times: usize) {
        self.busy.lock().unwrap().insert(fd, times);
    }

    pub fn is_registered(&self, fd: RawFd) -> bool {
        self.handlers.lock().unwrap().contains_key(&fd)
    }

    pub fn registered_count(&self) -> usize {
        self.handlers.lock().unwrap().len()
    }

    pub fn registered_fds(&self) -> Vec<RawFd> {
        let mut fds: Vec<RawFd> = self.handlers.lock().unwrap().keys().copied().collect();
        fds.sort_unstable();
        fds
    }

    pub fn busy_reports(&self) -> usize {
        self.busy_reports.load(Ordering::SeqCst)
    }

    pub fn wakes(&self) -> usize {
        self.wakes.load(Ordering::SeqCst)
    }

    /// Runs the handler of `fd` as the event loop would.
    pub fn fire(&self, fd: RawFd) -> Option<Disposition> {
        let handler = self.handlers.lock().unwrap().get(&fd)?.clone();
        let disposition = handler.on_readable(fd);
        if disposition == Disposition::Remove {
            self.handlers.lock().unwrap().remove(&fd);
        }
        Some(disposition)
    }
}

impl Dispatcher for MockDispatcher {
    fn register(&self, fd: RawFd, handler: Arc<dyn FdHandler>) -> Result<(), DispatcherError> {
        let mut handlers = self.handlers.lock().unwrap();
        if handlers.contains_key(&fd) {
            return Err(DispatcherError::AlreadyRegistered(fd));
        }
        handlers.insert(fd, handler);
        Ok(())
    }

    fn try_deregister(&self, fd: RawFd) -> TryDeregister {
        let mut handlers = self.handlers.lock().unwrap();
        if !handlers.contains_key(&fd) {
            return TryDeregister::NotFound;
        }
        if let Some(times) = self.busy.lock().unwrap().get_mut(&fd) {
            if *times > 0 {
                *times -= 1;
                self.busy_reports.fetch_add(1, Ordering::SeqCst);
                return TryDeregister::Busy;
            }
        }
        handlers.remove(&fd);
        TryDeregister::Removed
    }

    fn wake(&self) {
        self.wakes.fetch_add(1, Ordering::SeqCst);
    }
}

/// Mocks wired into a [`TransportContext`].
#[derive(Debug)]
pub struct TestHarness {
    pub dispatcher: Arc<MockDispatcher>,
    pub devices: Arc<MockDeviceBackend>,
    pub protocol: Arc<MockProtocol>,
    pub notify: Arc<MockNotifyOps>,
    pub reconnect: Arc<ReconnectScheduler>,
}

impl Default for TestHarness {
    fn default() -> Self {
        Self::new()
    }
}

impl TestHarness {
    pub fn new() -> Self {
        Self::with_interval(DEFAULT_RECONNECT_INTERVAL)
    }

    pub fn with_interval(interval: Duration) -> Self {
        TestHarness {
            dispatcher: Arc::new(MockDispatcher::default()),
            devices: Arc::new(MockDeviceBackend::default()),
            protocol: Arc::new(MockProtocol::default()),
            notify: Arc::new(MockNotifyOps::default()),
            reconnect: Arc::new(ReconnectScheduler::new(interval)),
        }
    }

    pub fn context(&self) -> TransportContext {
        TransportContext {
            dispatcher: self.dispatcher.clone(),
            devices: self.devices.clone(),
            protocol: self.protocol.clone(),
            reconnect: self.reconnect.clone(),
        }
    }

    pub fn socket(&self, config: SocketConfig) -> Arc<AfUnixSocket> {
        AfUnixSocket::new(config, self.notify.clone(), self.context())
    }
}

impl Drop for TestHarness {
    fn drop(&mut self) {
        self.reconnect.stop();
    }
}
