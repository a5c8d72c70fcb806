// Copyright 2025 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Background connect retries for client sockets.

use std::fmt;
use std::io;
use std::os::fd::{AsFd, AsRawFd, OwnedFd};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use super::AfUnixSocket;
use super::endpoint::{self, ConnectError, UnixAddr};
use crate::logger::{IncMetric, METRICS, error, info};

/// Time between two scans of the reconnect list.
pub const DEFAULT_RECONNECT_INTERVAL: Duration = Duration::from_secs(1);

const RECONNECT_THREAD_NAME: &str = "vhost_reconn";

/// A client socket waiting for its peer.
pub struct ReconnectEntry {
    addr: UnixAddr,
    fd: OwnedFd,
    socket: Arc<AfUnixSocket>,
}

impl fmt::Debug for ReconnectEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReconnectEntry")
            .field("addr", &self.addr)
            .field("fd", &self.fd.as_raw_fd())
            .finish_non_exhaustive()
    }
}

impl ReconnectEntry {
    /// Retries connecting the non-blocking `fd` to `addr` on behalf of `socket`.
    pub fn new(addr: UnixAddr, fd: OwnedFd, socket: Arc<AfUnixSocket>) -> Self {
        ReconnectEntry { addr, fd, socket }
    }
}

#[derive(Default)]
struct StopSignal {
    stopped: Mutex<bool>,
    cond: Condvar,
}

impl StopSignal {
    fn stopped(&self) -> MutexGuard<'_, bool> {
        self.stopped
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn set(&self, value: bool) {
        *self.stopped() = value;
        self.cond.notify_all();
    }

    // Sleeps for `timeout` unless stopped. Returns whether the signal is set.
    fn wait(&self, timeout: Duration) -> bool {
        let guard = self.stopped();
        let (guard, _) = self
            .cond
            .wait_timeout_while(guard, timeout, |stopped| !*stopped)
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *guard
    }
}

/// Retries the connects of client sockets whose peer was not there yet.
///
/// One scheduler serves every socket of a manager. The list lock is held during a whole scan,
/// including the setup of connections that came up, so sockets must not push or remove
/// entries from their connection setup path.
pub struct ReconnectScheduler {
    entries: Mutex<Vec<ReconnectEntry>>,
    interval: Duration,
    signal: Arc<StopSignal>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl fmt::Debug for ReconnectScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReconnectScheduler")
            .field("pending", &self.len())
            .field("interval", &self.interval)
            .finish_non_exhaustive()
    }
}

impl Default for ReconnectScheduler {
    fn default() -> Self {
        Self::new(DEFAULT_RECONNECT_INTERVAL)
    }
}

impl ReconnectScheduler {
    /// Creates a stopped scheduler scanning every `interval`.
    pub fn new(interval: Duration) -> Self {
        ReconnectScheduler {
            entries: Mutex::new(Vec::new()),
            interval,
            signal: Arc::new(StopSignal::default()),
            thread: Mutex::new(None),
        }
    }

    fn entries(&self) -> MutexGuard<'_, Vec<ReconnectEntry>> {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn thread(&self) -> MutexGuard<'_, Option<JoinHandle<()>>> {
        self.thread
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Starts the `vhost_reconn` thread. Does nothing if it is already running.
    pub fn start(self: &Arc<Self>) -> io::Result<()> {
        let mut thread = self.thread();
        if thread.is_some() {
            return Ok(());
        }
        self.signal.set(false);

        let scheduler: Weak<Self> = Arc::downgrade(self);
        let signal = self.signal.clone();
        let interval = self.interval;
        *thread = Some(
            thread::Builder::new()
                .name(RECONNECT_THREAD_NAME.to_string())
                .spawn(move || {
                    while !signal.wait(interval) {
                        let Some(scheduler) = scheduler.upgrade() else {
                            break;
                        };
                        scheduler.run_once();
                    }
                })?,
        );
        Ok(())
    }

    /// Stops the thread and closes the fds of all pending entries.
    pub fn stop(&self) {
        self.signal.set(true);
        if let Some(handle) = self.thread().take() {
            // The last reference may be dropped by the thread itself.
            if handle.thread().id() != thread::current().id() && handle.join().is_err() {
                error!("reconnect thread panicked");
            }
        }
        let pending = std::mem::take(&mut *self.entries());
        drop(pending);
    }

    /// Whether the thread is running.
    pub fn is_running(&self) -> bool {
        self.thread().is_some()
    }

    /// Queues `entry` for the next scan.
    pub fn push(&self, entry: ReconnectEntry) {
        self.entries().push(entry);
    }

    /// Drops the entry of `socket`, closing its fd. Returns whether there was one.
    pub fn remove_for(&self, socket: &AfUnixSocket) -> bool {
        let mut entries = self.entries();
        let Some(pos) = entries
            .iter()
            .position(|entry| std::ptr::eq(Arc::as_ptr(&entry.socket), socket))
        else {
            return false;
        };
        entries.remove(pos);
        true
    }

    /// Number of sockets waiting for their peer.
    pub fn len(&self) -> usize {
        self.entries().len()
    }

    /// Whether no socket is waiting.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Retries every pending connect once. Returns the number of connections set up.
    ///
    /// A connect that cannot succeed anymore drops its entry; a connect whose peer is still
    /// missing keeps it.
    pub fn run_once(&self) -> usize {
        let mut entries = self.entries();
        let mut connected = 0;
        let mut i = 0;

        while i < entries.len() {
            METRICS.transport.reconnect_attempts.inc();
            let entry = &entries[i];
            match endpoint::connect_nonblock(entry.fd.as_fd(), &entry.addr) {
                Err(ConnectError::Transient(_)) => {
                    i += 1;
                }
                Err(ConnectError::Fatal(err)) => {
                    error!("reconnection for fd {} failed: {}", entry.fd.as_raw_fd(), err);
                    entries.remove(i);
                }
                Ok(()) => {
                    let ReconnectEntry { fd, socket, .. } = entries.remove(i);
                    info!("{}: connected", socket.config.path);
                    if socket.on_new_peer(fd).is_ok() {
                        METRICS.transport.reconnect_successes.inc();
                        connected += 1;
                    }
                }
            }
        }

        connected
    }
}

#[cfg(test)]
mod tests {
    use std::os::unix::net::UnixListener;

    use vmm_sys_util::tempdir::TempDir;

    use super::*;
    use crate::config::SocketConfig;
    use crate::test_utils::TestHarness;
    use crate::transport::{StartOutcome, Transport};

    #[test]
    fn test_pending_client_connects_on_scan() {
        let dir = TempDir::new().unwrap();
        let path = dir.as_path().join("sock");
        let harness = TestHarness::new();
        let socket = harness.socket(SocketConfig::client(path.to_str().unwrap(), true));

        socket.init().unwrap();
        assert_eq!(socket.start().unwrap(), StartOutcome::Pending);
        assert_eq!(harness.reconnect.len(), 1);

        // Peer still missing: the entry stays.
        assert_eq!(harness.reconnect.run_once(), 0);
        assert_eq!(harness.reconnect.len(), 1);

        let listener = UnixListener::bind(&path).unwrap();
        assert_eq!(harness.reconnect.run_once(), 1);
        assert!(harness.reconnect.is_empty());
        assert_eq!(socket.connection_count(), 1);
        assert_eq!(harness.devices.live(), 1);
        listener.accept().unwrap();

        socket.cleanup();
        assert_eq!(harness.devices.live(), 0);
    }

    #[test]
    fn test_failed_setup_drops_entry() {
        let dir = TempDir::new().unwrap();
        let path = dir.as_path().join("sock");
        let harness = TestHarness::new();
        harness.devices.fail_allocations(true);
        let socket = harness.socket(SocketConfig::client(path.to_str().unwrap(), true));

        socket.init().unwrap();
        assert_eq!(socket.start().unwrap(), StartOutcome::Pending);

        let _listener = UnixListener::bind(&path).unwrap();
        assert_eq!(harness.reconnect.run_once(), 0);
        assert!(harness.reconnect.is_empty());
        assert_eq!(socket.connection_count(), 0);
    }

    #[test]
    fn test_fd_flag_failure_drops_entry() {
        let dir = TempDir::new().unwrap();
        let path = dir.as_path().join("sock");
        let harness = TestHarness::new();
        let socket = harness.socket(SocketConfig::client(path.to_str().unwrap(), true));

        socket.init().unwrap();
        assert_eq!(socket.start().unwrap(), StartOutcome::Pending);

        let _listener = UnixListener::bind(&path).unwrap();
        endpoint::fail_fd_flags(true);
        let connected = harness.reconnect.run_once();
        endpoint::fail_fd_flags(false);

        assert_eq!(connected, 0);
        assert!(harness.reconnect.is_empty());
        assert_eq!(socket.connection_count(), 0);
        assert!(harness.notify.new_connections.lock().unwrap().is_empty());
        assert_eq!(harness.devices.live(), 0);

        // Dropped for good: later scans have nothing to retry.
        assert_eq!(harness.reconnect.run_once(), 0);
        assert_eq!(socket.connection_count(), 0);
    }

    #[test]
    fn test_remove_for() {
        let dir = TempDir::new().unwrap();
        let harness = TestHarness::new();
        let first = harness.socket(SocketConfig::client(
            dir.as_path().join("a").to_str().unwrap(),
            true,
        ));
        let second = harness.socket(SocketConfig::client(
            dir.as_path().join("b").to_str().unwrap(),
            true,
        ));
        for socket in [&first, &second] {
            socket.init().unwrap();
            assert_eq!(socket.start().unwrap(), StartOutcome::Pending);
        }
        assert_eq!(harness.reconnect.len(), 2);

        assert!(harness.reconnect.remove_for(&first));
        assert!(!harness.reconnect.remove_for(&first));
        assert_eq!(harness.reconnect.len(), 1);

        // Cleanup removes the remaining entry.
        second.cleanup();
        assert!(harness.reconnect.is_empty());
    }

    #[test]
    fn test_thread_liveness() {
        let dir = TempDir::new().unwrap();
        let path = dir.as_path().join("sock");
        let harness = TestHarness::with_interval(Duration::from_millis(10));
        let socket = harness.socket(SocketConfig::client(path.to_str().unwrap(), true));

        socket.init().unwrap();
        assert_eq!(socket.start().unwrap(), StartOutcome::Pending);
        harness.reconnect.start().unwrap();
        assert!(harness.reconnect.is_running());

        let _listener = UnixListener::bind(&path).unwrap();
        for _ in 0..500 {
            if socket.connection_count() == 1 {
                break;
            }
            thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(socket.connection_count(), 1);
        assert!(harness.reconnect.is_empty());

        harness.reconnect.stop();
        assert!(!harness.reconnect.is_running());
        socket.cleanup();
    }

    #[test]
    fn test_stop_closes_pending() {
        let dir = TempDir::new().unwrap();
        let harness = TestHarness::with_interval(Duration::from_secs(3600));
        let socket = harness.socket(SocketConfig::client(
            dir.as_path().join("sock").to_str().unwrap(),
            true,
        ));
        socket.init().unwrap();
        socket.start().unwrap();
        harness.reconnect.start().unwrap();

        // Returns promptly despite the long interval.
        harness.reconnect.stop();
        assert!(harness.reconnect.is_empty());
        assert_eq!(Arc::strong_count(&socket), 1);
    }
}
