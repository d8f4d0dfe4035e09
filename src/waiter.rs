// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 shmcast contributors
//
// Cross-process waiter used to park consumers on an empty ring.
//
// The waiter's registry (spin lock + event-id pool) lives in its own named
// shared region so any process can notify. Each parked thread registers a
// fresh wait-id, then blocks on a POSIX named semaphore backing the region
// "__IPC_WAIT__<id>"; notifiers walk the registry and post the semaphores.
//
// This is an idle-avoidance path only: ring correctness never depends on a
// notification arriving. All failures here are logged and suppressed — the
// caller just polls again.

use std::cell::UnsafeCell;
use std::io;
use std::mem;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::OnceLock;

use crate::platform::Semaphore;
use crate::shm::ShmHandle;
use crate::spin_lock::SpinLock;

/// Maximum concurrently parked threads per waiter.
const WAITER_CAP: usize = 32;

/// Shared-region name prefix for per-wait events.
const WAIT_EVENT_PREFIX: &str = "__IPC_WAIT__";

/// Shared region holding the global wait-id accumulator.
const WAIT_ACC_NAME: &str = "GLOBAL_WAIT_ACC_STORAGE__";

// ---------------------------------------------------------------------------
// Event-id pool — free-list over a fixed slot array, guarded by the
// waiter's spin lock. Zero-filled memory is detected and initialised on
// first use (a valid pool never has cursor == 0 with next[0] == 0).
// ---------------------------------------------------------------------------

#[repr(C)]
struct IdPool {
    cursor: u8,
    next: [u8; WAITER_CAP],
    used: [u8; WAITER_CAP],
    vals: [u16; WAITER_CAP],
}

impl IdPool {
    fn ensure_init(&mut self) {
        if self.cursor == 0 && self.next[0] == 0 {
            for i in 0..WAITER_CAP {
                self.next[i] = (i + 1) as u8;
            }
        }
    }

    fn acquire(&mut self, val: u16) -> Option<usize> {
        self.ensure_init();
        if self.cursor as usize >= WAITER_CAP {
            return None;
        }
        let id = self.cursor as usize;
        self.cursor = self.next[id];
        self.used[id] = 1;
        self.vals[id] = val;
        Some(id)
    }

    fn release(&mut self, id: usize) {
        self.used[id] = 0;
        self.next[id] = self.cursor;
        self.cursor = id as u8;
    }
}

/// Process-shared waiter state at the start of the waiter's region.
#[repr(C)]
struct WaiterState {
    lock: SpinLock,
    pool: UnsafeCell<IdPool>,
}

// ---------------------------------------------------------------------------
// Wait event — one kernel semaphore plus a shared ref-count region per
// unique wait-id. The last close destroys the semaphore object.
// ---------------------------------------------------------------------------

struct WaitEvent {
    wait_id: u16,
    shm: ShmHandle,
    sem: Semaphore,
}

impl WaitEvent {
    fn open(wait_id: u16) -> io::Result<Self> {
        let name = format!("{WAIT_EVENT_PREFIX}{wait_id}");
        let shm = ShmHandle::acquire(&name, mem::size_of::<AtomicUsize>())?;
        let sem = Semaphore::open(&name)?;
        unsafe { &*(shm.get() as *const AtomicUsize) }.fetch_add(1, Ordering::AcqRel);
        Ok(Self { wait_id, shm, sem })
    }

    fn wait(&self) -> io::Result<()> {
        self.sem.wait()
    }

    fn notify(&self) -> io::Result<()> {
        self.sem.post()
    }
}

impl Drop for WaitEvent {
    fn drop(&mut self) {
        let cnt = unsafe { &*(self.shm.get() as *const AtomicUsize) };
        if cnt.fetch_sub(1, Ordering::AcqRel) == 1 {
            Semaphore::unlink(&format!("{WAIT_EVENT_PREFIX}{}", self.wait_id));
        }
    }
}

/// A new wait-id from the global accumulator; 16-bit wrapping, so ids may
/// recycle after 2^16 outstanding waits, which the event ref-counting
/// tolerates.
fn calc_unique_id() -> Option<u16> {
    static ACC: OnceLock<Option<ShmHandle>> = OnceLock::new();
    let acc = ACC.get_or_init(|| {
        ShmHandle::acquire(WAIT_ACC_NAME, mem::size_of::<AtomicU64>())
            .map_err(|e| log::warn!("wait-id accumulator unavailable: {e}"))
            .ok()
    });
    acc.as_ref()
        .map(|h| unsafe { &*(h.get() as *const AtomicU64) }.fetch_add(1, Ordering::Relaxed) as u16)
}

// ---------------------------------------------------------------------------
// Waiter
// ---------------------------------------------------------------------------

/// A named cross-process waiter.
///
/// `wait_if` parks the calling thread while a predicate holds; `notify`
/// wakes one parked thread, `broadcast` wakes all of them.
pub struct Waiter {
    name: String,
    shm: ShmHandle,
}

impl Waiter {
    /// Open (or create) a named waiter.
    pub fn open(name: &str) -> io::Result<Self> {
        let shm = ShmHandle::acquire(name, mem::size_of::<WaiterState>())?;
        Ok(Self {
            name: name.to_string(),
            shm,
        })
    }

    fn state(&self) -> &WaiterState {
        unsafe { &*(self.shm.get() as *const WaiterState) }
    }

    /// Park the calling thread while `pred` returns `true`.
    ///
    /// The predicate is re-checked after the event is registered, so a
    /// notify racing with the registration is never lost. Returns `false`
    /// when parking was not possible (registry full, event setup failed);
    /// the caller should poll instead.
    pub fn wait_if<F: Fn() -> bool>(&self, pred: F) -> bool {
        if !pred() {
            return true;
        }
        let Some(wait_id) = calc_unique_id() else {
            return false;
        };
        let evt = match WaitEvent::open(wait_id) {
            Ok(evt) => evt,
            Err(e) => {
                log::warn!("waiter {}: event open failed: {e}", self.name);
                return false;
            }
        };

        let st = self.state();
        st.lock.lock();
        let slot = unsafe { &mut *st.pool.get() }.acquire(wait_id);
        st.lock.unlock();
        let Some(slot) = slot else {
            log::warn!("waiter {}: too many waiters", self.name);
            return false;
        };

        // From here on a notifier sees our registration and posts the
        // semaphore, so checking the predicate again closes the race with
        // a publication that happened before we registered.
        if pred() {
            if let Err(e) = evt.wait() {
                log::warn!("waiter {}: wait failed: {e}", self.name);
            }
        }

        st.lock.lock();
        unsafe { &mut *st.pool.get() }.release(slot);
        st.lock.unlock();
        true
    }

    /// Wake one parked thread, if any.
    pub fn notify(&self) {
        self.post_events(false);
    }

    /// Wake all parked threads.
    pub fn broadcast(&self) {
        self.post_events(true);
    }

    fn post_events(&self, all: bool) {
        let st = self.state();
        st.lock.lock();
        let pool = unsafe { &mut *st.pool.get() };
        for i in 0..WAITER_CAP {
            if pool.used[i] == 0 {
                continue;
            }
            match WaitEvent::open(pool.vals[i]) {
                Ok(evt) => match evt.notify() {
                    Ok(()) => {
                        if !all {
                            break;
                        }
                    }
                    Err(e) => {
                        log::warn!("waiter {}: post failed: {e}", self.name);
                    }
                },
                Err(e) => {
                    log::warn!("waiter {}: notify open failed: {e}", self.name);
                }
            }
        }
        st.lock.unlock();
    }

    /// Remove the backing storage for a named waiter.
    pub fn clear_storage(name: &str) {
        ShmHandle::unlink_by_name(name);
    }
}
