/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

//! A process-scoped pool of kernel-shared fences.
//!
//! Each fence is a shared-memory page holding a single futex word (the
//! `xshmfence` convention): we map one half, the host server maps the other
//! through a descriptor we hand it at creation. The server triggers the
//! fence once some condition holds; [`FencePool::await_fence`] blocks on the
//! futex word, which is the only blocking primitive the pool uses.
//!
//! Fences are recycled through a free list. They are process-scoped and safe
//! to reuse across unrelated render targets, but the pool is single-threaded
//! like everything else in the compositor.

#![deny(unsafe_op_in_unsafe_fn)]

use std::os::fd::OwnedFd;
use std::ptr::NonNull;
use std::rc::Rc;
use std::sync::atomic::{AtomicI32, Ordering};

use log::trace;
use rustix::fs::{MemfdFlags, memfd_create};
use rustix::io::fcntl_dupfd_cloexec;
use rustix::mm::{MapFlags, ProtFlags, mmap, munmap};
use thiserror::Error;
use x11rb::connection::Connection;
use x11rb::protocol::dri3::ConnectionExt as _;
use x11rb::protocol::sync::ConnectionExt as _;
use x11rb::protocol::xproto::Window;
use x11rb::rust_connection::RustConnection;

#[derive(Debug, Error)]
pub enum FenceError {
    #[error("creating the fence page failed: {0}")]
    Page(#[from] rustix::io::Errno),
    #[error("handing the fence to the host failed: {0}")]
    Host(String),
}

/// Creates server-side fence objects from shared-memory descriptors. The
/// production implementation is [`X11FenceHost`]; tests substitute their
/// own.
pub trait FenceHost {
    /// Hands `fd` to the host, which assumes ownership, and returns the
    /// host-side fence id.
    fn create_fence(&self, fd: OwnedFd) -> Result<u32, FenceError>;
    fn destroy_fence(&self, id: u32);
}

/// DRI3-backed fence creation against a live host connection.
pub struct X11FenceHost {
    connection: Rc<RustConnection>,
    root: Window,
}

impl X11FenceHost {
    pub fn new(connection: Rc<RustConnection>, root: Window) -> Self {
        Self { connection, root }
    }
}

impl FenceHost for X11FenceHost {
    fn create_fence(&self, fd: OwnedFd) -> Result<u32, FenceError> {
        let id = self
            .connection
            .generate_id()
            .map_err(|error| FenceError::Host(error.to_string()))?;
        self.connection
            .dri3_fence_from_fd(self.root, id, false, fd)
            .map_err(|error| FenceError::Host(error.to_string()))?;
        Ok(id)
    }

    fn destroy_fence(&self, id: u32) {
        let _ = self.connection.sync_destroy_fence(id);
    }
}

/// A handle into the pool. Plain index; the pool never shrinks, so handles
/// stay valid for the life of the pool.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct Fence(usize);

struct Entry {
    /// Host-side fence id.
    server_id: u32,
    /// Our mapping of the shared futex word.
    word: NonNull<AtomicI32>,
    refcount: u32,
    free: bool,
}

impl Entry {
    fn word(&self) -> &AtomicI32 {
        unsafe { self.word.as_ref() }
    }
}

pub struct FencePool<H: FenceHost> {
    host: H,
    entries: Vec<Entry>,
    free: Vec<usize>,
}

impl<H: FenceHost> FencePool<H> {
    pub fn new(host: H) -> Self {
        Self {
            host,
            entries: Vec::new(),
            free: Vec::new(),
        }
    }

    /// Takes a fence off the free list, or creates a fresh one: an anonymous
    /// shared page, mapped locally, with a close-on-exec duplicate handed to
    /// the host.
    pub fn acquire(&mut self) -> Result<Fence, FenceError> {
        if let Some(index) = self.free.pop() {
            let entry = &mut self.entries[index];
            debug_assert_eq!(entry.word().load(Ordering::Acquire), 0);
            entry.free = false;
            entry.refcount = 1;
            trace!("reusing fence {}", entry.server_id);
            return Ok(Fence(index));
        }

        let fd = memfd_create("waybridge-fence", MemfdFlags::CLOEXEC)?;
        rustix::fs::ftruncate(&fd, 4)?;
        let mapping = unsafe {
            mmap(
                std::ptr::null_mut(),
                4,
                ProtFlags::READ | ProtFlags::WRITE,
                MapFlags::SHARED,
                &fd,
                0,
            )
        }?;
        let server_fd = fcntl_dupfd_cloexec(&fd, 0)?;
        let server_id = self.host.create_fence(server_fd)?;

        let word = NonNull::new(mapping.cast::<AtomicI32>())
            .ok_or_else(|| FenceError::Host("fence page mapped at null".into()))?;
        trace!("created fence {server_id}");
        self.entries.push(Entry {
            server_id,
            word,
            refcount: 1,
            free: false,
        });
        Ok(Fence(self.entries.len() - 1))
    }

    /// The host-side id, for embedding in requests.
    pub fn id(&self, fence: Fence) -> u32 {
        self.entries[fence.0].server_id
    }

    pub fn retain(&mut self, fence: Fence) {
        let entry = &mut self.entries[fence.0];
        debug_assert!(!entry.free);
        entry.refcount += 1;
    }

    /// Blocks until the host triggers the fence, then resets the word and
    /// drops one reference, recycling the fence when it was the last.
    ///
    /// This is one of the two legal suspension points in the process (the
    /// other being the event-loop poll); it yields only inside the futex
    /// system call.
    pub fn await_fence(&mut self, fence: Fence) {
        let entry = &mut self.entries[fence.0];
        debug_assert!(!entry.free);
        futex_wait_until_triggered(entry.word());
        entry.word().store(0, Ordering::Release);
        entry.refcount -= 1;
        if entry.refcount == 0 {
            entry.free = true;
            self.free.push(fence.0);
        }
    }

    /// Whether the fence is currently on the free list.
    pub fn is_free(&self, fence: Fence) -> bool {
        self.entries[fence.0].free
    }

    pub fn triggered(&self, fence: Fence) -> bool {
        self.entries[fence.0].word().load(Ordering::Acquire) != 0
    }
}

impl<H: FenceHost> Drop for FencePool<H> {
    fn drop(&mut self) {
        for entry in &self.entries {
            self.host.destroy_fence(entry.server_id);
            unsafe {
                let _ = munmap(entry.word.as_ptr().cast(), 4);
            }
        }
    }
}

fn futex_wait_until_triggered(word: &AtomicI32) {
    loop {
        if word.load(Ordering::Acquire) != 0 {
            return;
        }
        let result = unsafe {
            libc::syscall(
                libc::SYS_futex,
                word.as_ptr(),
                libc::FUTEX_WAIT,
                0,
                std::ptr::null::<libc::timespec>(),
            )
        };
        if result == 0 {
            continue;
        }
        match std::io::Error::last_os_error().raw_os_error() {
            // Raced with the trigger, or interrupted: re-check the word.
            Some(libc::EAGAIN) | Some(libc::EINTR) => continue,
            _ => return,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::rc::Rc;

    use super::*;

    const TRIGGERED: i32 = 1;

    #[derive(Default)]
    struct MockHost {
        created: Rc<RefCell<Vec<u32>>>,
        destroyed: Rc<RefCell<Vec<u32>>>,
    }

    impl FenceHost for MockHost {
        fn create_fence(&self, fd: OwnedFd) -> Result<u32, FenceError> {
            drop(fd);
            let mut created = self.created.borrow_mut();
            let id = 100 + created.len() as u32;
            created.push(id);
            Ok(id)
        }

        fn destroy_fence(&self, id: u32) {
            self.destroyed.borrow_mut().push(id);
        }
    }

    fn trigger<H: FenceHost>(pool: &FencePool<H>, fence: Fence) {
        pool.entries[fence.0].word().store(TRIGGERED, Ordering::Release);
    }

    #[test]
    fn acquire_creates_then_recycles() {
        let mut pool = FencePool::new(MockHost::default());
        let fence = pool.acquire().expect("acquire");
        assert_eq!(pool.id(fence), 100);
        trigger(&pool, fence);
        pool.await_fence(fence);
        assert!(pool.is_free(fence));

        let again = pool.acquire().expect("reacquire");
        assert_eq!(pool.id(again), 100, "free-listed fence is reused");
        assert!(!pool.is_free(again));
    }

    #[test]
    fn retain_keeps_fence_off_the_free_list() {
        let mut pool = FencePool::new(MockHost::default());
        let fence = pool.acquire().expect("acquire");
        pool.retain(fence);

        trigger(&pool, fence);
        pool.await_fence(fence);
        // One reference remains, so the fence stays allocated and the word
        // is already reset for the next trigger.
        assert!(!pool.is_free(fence));
        assert!(!pool.triggered(fence));

        trigger(&pool, fence);
        pool.await_fence(fence);
        assert!(pool.is_free(fence));
        assert!(!pool.triggered(fence));
    }

    #[test]
    fn distinct_fences_when_none_free() {
        let mut pool = FencePool::new(MockHost::default());
        let a = pool.acquire().expect("acquire");
        let b = pool.acquire().expect("acquire");
        assert_ne!(pool.id(a), pool.id(b));
    }

    #[test]
    fn await_returns_immediately_when_already_triggered() {
        let mut pool = FencePool::new(MockHost::default());
        let fence = pool.acquire().expect("acquire");
        trigger(&pool, fence);
        pool.await_fence(fence);
        assert!(pool.is_free(fence));
    }
}
