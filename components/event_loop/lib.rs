/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

//! The cooperative single-threaded scheduler.
//!
//! One [`EventLoop::step`] drains due timers, retires finished transfers,
//! flushes both connections, polls the host fd, the protocol listener fd and
//! every user-registered watch, and dispatches whatever became ready. Every
//! callback runs to completion; the only suspension points in the process
//! are the poll in here and the fence/idle waits in the renderer.

pub mod timers;

use std::os::fd::BorrowedFd;
use std::time::Instant;

use log::trace;
use rustix::event::{PollFd, PollFlags};

pub use crate::timers::{TimerHandle, Timers};

/// Which direction a watch waits for.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Direction {
    Read,
    Write,
}

/// What fired on a watch.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Ready {
    pub readable: bool,
    pub writable: bool,
    pub hangup: bool,
}

/// The host- and client-facing half the loop drives. Implemented by the
/// protocol glue; the loop itself owns no connection.
pub trait Dispatcher {
    /// Retire completed selection transfers and disconnect clients flagged
    /// out-of-memory.
    fn drain_completed_transfers(&mut self);

    /// Flush buffered writes to the host server and all protocol clients.
    fn flush(&mut self);

    /// The host server connection, polled for reading.
    fn host_fd(&self) -> BorrowedFd<'_>;

    /// The protocol listener socket, polled for reading.
    fn listener_fd(&self) -> Option<BorrowedFd<'_>>;

    /// Whether host events are already queued locally, making a poll
    /// pointless until they are drained.
    fn host_events_queued(&self) -> bool;

    /// Drain and process all queued host events.
    fn dispatch_host(&mut self);

    /// Dispatch one batch of protocol-client requests.
    fn dispatch_clients(&mut self);
}

pub type WatchCallback = Box<dyn FnMut(&mut EventLoop, Ready)>;

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct WatchHandle(u64);

struct Watch {
    handle: WatchHandle,
    fd: i32,
    direction: Direction,
    callback: Option<WatchCallback>,
    /// Cleared by `remove_watch` during dispatch; the entry is reaped the
    /// next time the poll set is compiled.
    valid: bool,
}

/// The scheduler. Timers are exposed as a field so subsystems holding a
/// `&mut EventLoop` can schedule without extra plumbing.
#[derive(Default)]
pub struct EventLoop {
    pub timers: Timers,
    watches: Vec<Watch>,
    next_watch: u64,
}

impl EventLoop {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a file descriptor. The callback may add or remove watches
    /// and timers through the loop reference it is handed.
    pub fn add_watch(
        &mut self,
        fd: i32,
        direction: Direction,
        callback: WatchCallback,
    ) -> WatchHandle {
        self.next_watch += 1;
        let handle = WatchHandle(self.next_watch);
        self.watches.push(Watch {
            handle,
            fd,
            direction,
            callback: Some(callback),
            valid: true,
        });
        handle
    }

    /// Flags a watch for removal. Safe to call from inside its own (or any
    /// other) callback; the slot is reaped before the next poll.
    pub fn remove_watch(&mut self, handle: WatchHandle) {
        if let Some(watch) = self.watches.iter_mut().find(|w| w.handle == handle) {
            watch.valid = false;
        }
    }

    pub fn watch_count(&self) -> usize {
        self.watches.iter().filter(|w| w.valid).count()
    }

    /// Runs one step of the loop. Returns after dispatching at most one
    /// poll's worth of readiness.
    pub fn step(&mut self, dispatcher: &mut dyn Dispatcher) {
        // Time sources may register new fds, so run them before compiling
        // the poll set.
        self.dispatch_due_timers();

        dispatcher.drain_completed_transfers();
        dispatcher.flush();

        // Host events read during a previous dispatch may still be queued
        // locally; a poll would sleep through them.
        while dispatcher.host_events_queued() {
            dispatcher.dispatch_host();
            dispatcher.flush();
        }

        self.watches.retain(|watch| watch.valid);

        let mut poll_fds = Vec::with_capacity(self.watches.len() + 2);
        poll_fds.push(PollFd::from_borrowed_fd(dispatcher.host_fd(), PollFlags::IN));
        if let Some(fd) = dispatcher.listener_fd() {
            poll_fds.push(PollFd::from_borrowed_fd(fd, PollFlags::IN));
        }
        let watch_base = poll_fds.len();
        for watch in &self.watches {
            let flags = match watch.direction {
                Direction::Read => PollFlags::IN | PollFlags::HUP,
                Direction::Write => PollFlags::OUT,
            };
            // The glue owns the fd for at least as long as the watch is
            // registered; removal always precedes close.
            let fd = unsafe { BorrowedFd::borrow_raw(watch.fd) };
            poll_fds.push(PollFd::from_borrowed_fd(fd, flags));
        }

        let timeout = self.timers.poll_timeout_ms(Instant::now());
        trace!("polling {} fds, timeout {timeout}", poll_fds.len());
        match rustix::event::poll(&mut poll_fds, timeout) {
            Ok(_) => {},
            Err(error) if error == rustix::io::Errno::INTR => return,
            Err(error) => {
                log::warn!("poll failed: {error}");
                return;
            },
        }

        let host_ready = !poll_fds[0].revents().is_empty();
        let fired: Vec<(WatchHandle, Ready)> = self
            .watches
            .iter()
            .enumerate()
            .filter_map(|(index, watch)| {
                let revents = poll_fds[watch_base + index].revents();
                if revents.is_empty() {
                    return None;
                }
                Some((
                    watch.handle,
                    Ready {
                        readable: revents.contains(PollFlags::IN),
                        writable: revents.contains(PollFlags::OUT),
                        hangup: revents.contains(PollFlags::HUP) ||
                            revents.contains(PollFlags::ERR),
                    },
                ))
            })
            .collect();
        drop(poll_fds);

        if host_ready || dispatcher.host_events_queued() {
            dispatcher.dispatch_host();
        }
        // One batch of client requests per step; a readable listener only
        // guarantees the poll woke up for it.
        dispatcher.dispatch_clients();

        for (handle, ready) in fired {
            self.run_watch_callback(handle, ready);
        }
    }

    fn run_watch_callback(&mut self, handle: WatchHandle, ready: Ready) {
        let Some(index) = self
            .watches
            .iter()
            .position(|watch| watch.handle == handle && watch.valid)
        else {
            return;
        };
        let Some(mut callback) = self.watches[index].callback.take() else {
            return;
        };
        callback(self, ready);
        // The callback may have removed this watch or shuffled the list.
        if let Some(watch) = self
            .watches
            .iter_mut()
            .find(|watch| watch.handle == handle && watch.valid)
        {
            watch.callback = Some(callback);
        }
    }

    fn dispatch_due_timers(&mut self) {
        let now = Instant::now();
        while let Some(callback) = self.timers.take_due(now) {
            callback(self);
        }
    }
}
