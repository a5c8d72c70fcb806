// Copyright 2025 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use std::collections::HashMap;
use std::fmt;
use std::io;
use std::os::fd::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use vmm_sys_util::epoll::{ControlOperation, Epoll, EpollEvent, EventSet};
use vmm_sys_util::eventfd::EventFd;

use super::{Dispatcher, DispatcherError, Disposition, FdHandler, TryDeregister};
use crate::logger::{error, warn};

/// Default limit on registered fds.
pub const MAX_FDS: usize = 1024;

const EVENT_BUFFER_SIZE: usize = 128;
const WAKE_TOKEN: u64 = 0;
const DISPATCHER_THREAD_NAME: &str = "vhost_events";

struct FdEntry {
    // Epoll user data of this registration. Events carrying another token belong to an
    // earlier registration of the same fd number.
    token: u64,
    handler: Arc<dyn FdHandler>,
    busy: bool,
}

struct Table {
    entries: HashMap<RawFd, FdEntry>,
    tokens: HashMap<u64, RawFd>,
    next_token: u64,
}

impl Table {
    fn remove(&mut self, fd: RawFd) -> Option<FdEntry> {
        let entry = self.entries.remove(&fd)?;
        self.tokens.remove(&entry.token);
        Some(entry)
    }
}

/// Epoll based [`Dispatcher`].
///
/// The set lock is held only while the table is inspected or changed. Handlers run without
/// it, with their entry marked busy.
pub struct FdSet {
    epoll: Epoll,
    wake_evt: EventFd,
    table: Mutex<Table>,
    capacity: usize,
    stopped: AtomicBool,
}

impl fmt::Debug for FdSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FdSet")
            .field("epoll", &self.epoll.as_raw_fd())
            .field("len", &self.len())
            .field("capacity", &self.capacity)
            .finish()
    }
}

impl FdSet {
    /// Creates a set holding up to [`MAX_FDS`] fds.
    pub fn new() -> Result<Self, DispatcherError> {
        Self::with_capacity(MAX_FDS)
    }

    /// Creates a set holding up to `capacity` fds.
    pub fn with_capacity(capacity: usize) -> Result<Self, DispatcherError> {
        let epoll = Epoll::new().map_err(DispatcherError::Epoll)?;
        let wake_evt = EventFd::new(libc::EFD_NONBLOCK).map_err(DispatcherError::EventFd)?;
        epoll
            .ctl(
                ControlOperation::Add,
                wake_evt.as_raw_fd(),
                EpollEvent::new(EventSet::IN, WAKE_TOKEN),
            )
            .map_err(DispatcherError::Epoll)?;

        Ok(FdSet {
            epoll,
            wake_evt,
            table: Mutex::new(Table {
                entries: HashMap::new(),
                tokens: HashMap::new(),
                next_token: WAKE_TOKEN + 1,
            }),
            capacity,
            stopped: AtomicBool::new(false),
        })
    }

    fn table(&self) -> std::sync::MutexGuard<'_, Table> {
        self.table.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Number of registered fds.
    pub fn len(&self) -> usize {
        self.table().entries.len()
    }

    /// Whether no fd is registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether `fd` is registered.
    pub fn contains(&self, fd: RawFd) -> bool {
        self.table().entries.contains_key(&fd)
    }

    fn acquire(&self, token: u64) -> Option<(RawFd, Arc<dyn FdHandler>)> {
        let mut table = self.table();
        let fd = *table.tokens.get(&token)?;
        let entry = table.entries.get_mut(&fd)?;
        if entry.token != token || entry.busy {
            return None;
        }
        entry.busy = true;
        Some((fd, entry.handler.clone()))
    }

    fn release(&self, fd: RawFd, token: u64, disposition: Disposition) {
        let removed = {
            let mut table = self.table();
            match table.entries.get_mut(&fd) {
                Some(entry) if entry.token == token => match disposition {
                    Disposition::Keep => {
                        entry.busy = false;
                        None
                    }
                    Disposition::Remove => {
                        self.epoll_del(fd);
                        table.remove(fd)
                    }
                },
                _ => None,
            }
        };
        // The handler may own `fd`; drop it only once the fd left the epoll set.
        drop(removed);
    }

    fn epoll_del(&self, fd: RawFd) {
        if let Err(err) = self
            .epoll
            .ctl(ControlOperation::Delete, fd, EpollEvent::default())
        {
            warn!("failed to remove fd {} from epoll: {}", fd, err);
        }
    }

    /// Waits up to `timeout_ms` milliseconds (`-1` blocks) and runs the handlers of the fds
    /// that became ready. Returns the number of handlers run.
    pub fn dispatch(&self, timeout_ms: i32) -> Result<usize, DispatcherError> {
        let mut events = vec![EpollEvent::default(); EVENT_BUFFER_SIZE];
        let count = match self.epoll.wait(timeout_ms, &mut events[..]) {
            Ok(count) => count,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => return Ok(0),
            Err(err) => return Err(DispatcherError::Epoll(err)),
        };

        let mut handled = 0;
        for event in &events[..count] {
            let token = event.data();
            if token == WAKE_TOKEN {
                // Only the wakeup matters, not the counter.
                let _ = self.wake_evt.read();
                continue;
            }

            let Some((fd, handler)) = self.acquire(token) else {
                continue;
            };
            let disposition = handler.on_readable(fd);
            self.release(fd, token, disposition);
            handled += 1;
        }

        Ok(handled)
    }

    /// Dispatches events until [`FdSet::stop`] is called.
    pub fn run(&self) -> Result<(), DispatcherError> {
        while !self.stopped.load(Ordering::Acquire) {
            self.dispatch(-1)?;
        }
        Ok(())
    }

    /// Makes [`FdSet::run`] return after the current iteration.
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::Release);
        self.wake();
    }

    /// Runs the set on a dedicated thread.
    pub fn spawn(self: &Arc<Self>) -> io::Result<JoinHandle<()>> {
        let fdset = self.clone();
        thread::Builder::new()
            .name(DISPATCHER_THREAD_NAME.to_string())
            .spawn(move || {
                if let Err(err) = fdset.run() {
                    error!("fd dispatcher stopped: {}", err);
                }
            })
    }
}

impl Dispatcher for FdSet {
    fn register(&self, fd: RawFd, handler: Arc<dyn FdHandler>) -> Result<(), DispatcherError> {
        let mut table = self.table();
        if table.entries.contains_key(&fd) {
            return Err(DispatcherError::AlreadyRegistered(fd));
        }
        if table.entries.len() >= self.capacity {
            return Err(DispatcherError::Full);
        }

        let token = table.next_token;
        self.epoll
            .ctl(
                ControlOperation::Add,
                fd,
                EpollEvent::new(EventSet::IN | EventSet::READ_HANG_UP, token),
            )
            .map_err(DispatcherError::Epoll)?;

        table.next_token += 1;
        table.tokens.insert(token, fd);
        table.entries.insert(
            fd,
            FdEntry {
                token,
                handler,
                busy: false,
            },
        );
        Ok(())
    }

    fn try_deregister(&self, fd: RawFd) -> TryDeregister {
        let removed = {
            let mut table = self.table();
            match table.entries.get(&fd) {
                None => return TryDeregister::NotFound,
                Some(entry) if entry.busy => return TryDeregister::Busy,
                Some(_) => {
                    self.epoll_del(fd);
                    table.remove(fd)
                }
            }
        };
        drop(removed);
        TryDeregister::Removed
    }

    fn wake(&self) {
        if let Err(err) = self.wake_evt.write(1) {
            error!("failed to wake fd dispatcher: {}", err);
        }
    }
}
