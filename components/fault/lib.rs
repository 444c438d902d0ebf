/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

//! Bus-fault recovery for shared-memory pools.
//!
//! A client may truncate a pool while the host still has a pixmap on it and
//! while we still have it mapped; touching the dead pages then raises
//! `SIGBUS` in this process. Registered address ranges are recovered by
//! mapping anonymous zero pages over the faulting page, so the read
//! completes with undefined (zeroed) pixel contents instead of killing the
//! compositor. Faults outside every registered range print a one-line
//! diagnostic to fd 2 and exit.
//!
//! The handler runs in signal context and therefore only ever reads an
//! immutable snapshot published through an atomic pointer; all mutation
//! happens with `SIGBUS` blocked. The snapshot pointer is the single piece
//! of process-global state in the workspace, forced by the signal ABI
//! having no context argument.

#![deny(unsafe_op_in_unsafe_fn)]

use std::collections::BTreeMap;
use std::io;
use std::mem::MaybeUninit;
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicUsize, Ordering};

use log::debug;

/// Sorted base → length table read by the signal handler. Rebuilt on every
/// mutation and swapped in whole.
struct Snapshot {
    ranges: Vec<(usize, usize)>,
}

impl Snapshot {
    fn covers(&self, addr: usize) -> bool {
        let index = self.ranges.partition_point(|&(base, _)| base <= addr);
        if index == 0 {
            return false;
        }
        let (base, len) = self.ranges[index - 1];
        addr - base < len
    }
}

static SNAPSHOT: AtomicPtr<Snapshot> = AtomicPtr::new(ptr::null_mut());
static PAGE_SIZE: AtomicUsize = AtomicUsize::new(4096);
static INSTALLED: AtomicBool = AtomicBool::new(false);

/// Owner of the registered-range table. There is at most one per process;
/// every subsystem that maps client pools is handed a reference at
/// construction.
pub struct BusFaultGuard {
    ranges: BTreeMap<usize, usize>,
    /// Whether this guard publishes to the handler snapshot. False for
    /// guards created without the handler, whose faults stay fatal.
    publish: bool,
}

impl BusFaultGuard {
    /// Installs the `SIGBUS` handler and returns the guard. Fails if a guard
    /// was already installed in this process.
    pub fn install() -> io::Result<BusFaultGuard> {
        if INSTALLED.swap(true, Ordering::SeqCst) {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                "bus fault guard already installed",
            ));
        }
        PAGE_SIZE.store(
            rustix::param::page_size(),
            Ordering::Relaxed,
        );
        publish(Snapshot { ranges: Vec::new() });

        let mut action: libc::sigaction = unsafe { MaybeUninit::zeroed().assume_init() };
        action.sa_sigaction = handle_bus_fault as usize;
        action.sa_flags = libc::SA_SIGINFO;
        unsafe {
            libc::sigemptyset(&mut action.sa_mask);
            if libc::sigaction(libc::SIGBUS, &action, ptr::null_mut()) != 0 {
                return Err(io::Error::last_os_error());
            }
        }
        Ok(BusFaultGuard {
            ranges: BTreeMap::new(),
            publish: true,
        })
    }

    /// A guard that only tracks ranges, without installing the handler:
    /// faults remain fatal. For processes that cannot own the `SIGBUS`
    /// disposition, and for bookkeeping tests.
    pub fn new_untrapped() -> BusFaultGuard {
        BusFaultGuard {
            ranges: BTreeMap::new(),
            publish: false,
        }
    }

    /// Registers `[addr, addr + len)` for recovery. Reads from the range
    /// will no longer crash the process even if the backing mapping is
    /// invalidated.
    pub fn record(&mut self, addr: usize, len: usize) {
        if len == 0 {
            return;
        }
        debug!("recording bus fault range {addr:#x}..{:#x}", addr + len);
        self.ranges.insert(addr, len);
        self.republish();
    }

    /// Drops a previously registered range. Must be called before the
    /// mapping itself is unmapped.
    pub fn forget(&mut self, addr: usize) {
        if self.ranges.remove(&addr).is_some() {
            self.republish();
        }
    }

    pub fn is_recorded(&self, addr: usize) -> bool {
        self.ranges
            .range(..=addr)
            .next_back()
            .is_some_and(|(&base, &len)| addr - base < len)
    }

    fn republish(&self) {
        if !self.publish {
            return;
        }
        // The swap must not race a fault on the same table, so SIGBUS is
        // held off for the duration.
        let mut mask: libc::sigset_t = unsafe { MaybeUninit::zeroed().assume_init() };
        let mut old: libc::sigset_t = unsafe { MaybeUninit::zeroed().assume_init() };
        unsafe {
            libc::sigemptyset(&mut mask);
            libc::sigaddset(&mut mask, libc::SIGBUS);
            libc::pthread_sigmask(libc::SIG_BLOCK, &mask, &mut old);
        }
        let previous = publish(Snapshot {
            ranges: self.ranges.iter().map(|(&base, &len)| (base, len)).collect(),
        });
        if !previous.is_null() {
            drop(unsafe { Box::from_raw(previous) });
        }
        unsafe {
            libc::pthread_sigmask(libc::SIG_SETMASK, &old, ptr::null_mut());
        }
    }
}

fn publish(snapshot: Snapshot) -> *mut Snapshot {
    SNAPSHOT.swap(Box::into_raw(Box::new(snapshot)), Ordering::AcqRel)
}

extern "C" fn handle_bus_fault(
    _signal: libc::c_int,
    info: *mut libc::siginfo_t,
    _context: *mut libc::c_void,
) {
    // Only async-signal-safe calls from here on.
    let addr = unsafe { (*info).si_addr() } as usize;
    let snapshot = SNAPSHOT.load(Ordering::Acquire);
    if !snapshot.is_null() && unsafe { (*snapshot).covers(addr) } {
        let page_size = PAGE_SIZE.load(Ordering::Relaxed);
        let page = addr & !(page_size - 1);
        let mapped = unsafe {
            libc::mmap(
                page as *mut libc::c_void,
                page_size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_FIXED | libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if mapped != libc::MAP_FAILED {
            // The faulting access restarts against the zero page.
            return;
        }
    }
    const MESSAGE: &[u8] = b"waybridge: fatal bus fault outside registered shm ranges\n";
    unsafe {
        libc::write(2, MESSAGE.as_ptr().cast(), MESSAGE.len());
        libc::_exit(1);
    }
}

#[cfg(test)]
mod tests {
    use std::fs::OpenOptions;
    use std::os::unix::io::AsFd;

    use rustix::mm::{MapFlags, ProtFlags, mmap, munmap};

    use super::*;

    #[test]
    fn snapshot_lookup() {
        let snapshot = Snapshot {
            ranges: vec![(0x1000, 0x100), (0x3000, 0x10)],
        };
        assert!(snapshot.covers(0x1000));
        assert!(snapshot.covers(0x10ff));
        assert!(!snapshot.covers(0x1100));
        assert!(!snapshot.covers(0xfff));
        assert!(snapshot.covers(0x300f));
        assert!(!snapshot.covers(0x3010));
    }

    // The install/record/truncate/read path cannot be mocked; this is the
    // one test that actually takes the SIGBUS.
    #[test]
    fn truncated_mapping_reads_back_zero() {
        let mut guard = BusFaultGuard::install().expect("install guard");
        let page = rustix::param::page_size();

        let dir = std::env::temp_dir();
        let path = dir.join(format!("waybridge-fault-test-{}", std::process::id()));
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)
            .expect("create pool file");
        file.set_len((page * 2) as u64).expect("size pool");

        let mapping = unsafe {
            mmap(
                ptr::null_mut(),
                page * 2,
                ProtFlags::READ | ProtFlags::WRITE,
                MapFlags::SHARED,
                file.as_fd(),
                0,
            )
        }
        .expect("map pool");
        let base = mapping as usize;
        guard.record(base, page * 2);
        assert!(guard.is_recorded(base + page));

        unsafe { ptr::write_volatile(mapping.cast::<u8>(), 0xab) };

        // Truncate the pool under the live mapping, then touch the dead
        // page. The handler swallows the fault and zero-fills.
        file.set_len(0).expect("truncate pool");
        let value = unsafe { ptr::read_volatile(mapping.cast::<u8>().add(page)) };
        assert_eq!(value, 0);

        guard.forget(base);
        assert!(!guard.is_recorded(base));
        unsafe { munmap(mapping, page * 2) }.expect("unmap pool");
        let _ = std::fs::remove_file(&path);
    }
}
