// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 shmcast contributors
//
// Lock-free circular element arrays in shared memory.
//
// A ring of 256 fixed-size slots broadcasts each published slot to every
// connected consumer exactly once. The array head tracks a connection
// counter and a write cursor; each slot carries a read counter that a
// producer stamps with the connection count at publish time and each
// consumer decrements after copying the payload out. A slot is writable
// again once its read counter returns to zero, so a consumer that falls a
// full ring behind stalls producers — that is the intended back-pressure.
//
// Two variants share one contract:
// - `ElemArray`   — single producer. One cursor; publish is a release
//                   increment.
// - `MpElemArray` — multiple producers. A reservation cursor hands out
//                   slots, a per-slot ownership flag serialises writers
//                   that lapped the ring, and a separate commit cursor
//                   advances over a contiguous prefix of written slots so
//                   consumers always observe publications in order.
//
// Both are `#[repr(C)]` and valid in the all-zero state, so they attach
// directly over freshly created (zero-filled) shared memory.

use std::cell::UnsafeCell;
use std::mem;
use std::sync::atomic::{fence, AtomicBool, AtomicU16, AtomicU32, AtomicU8, Ordering};

use crate::spin_lock::Backoff;

/// Number of slots in a ring (2^8; indices wrap via u8 truncation).
pub const ELEM_MAX: usize = 256;

/// Truncate a cursor to its slot index.
#[inline]
pub const fn index_of(cursor: u16) -> u8 {
    cursor as u8
}

/// The common contract of both array variants.
///
/// `acquire`/`commit` form the producer side, `take`/`put` the consumer
/// side. Pointers handed out address a slot's data area; `commit` and
/// `put` recover the owning slot from them.
pub trait RingArray {
    /// Payload bytes per slot.
    const DATA_SIZE: usize;

    /// Attach to an array living at `mem`.
    ///
    /// # Safety
    /// `mem` must point to at least [`RingArray::shm_size`] bytes that are
    /// either zero-initialised or already hold a live array of this exact
    /// type, and must stay mapped for the returned lifetime.
    unsafe fn attach<'a>(mem: *mut u8) -> &'a Self
    where
        Self: Sized;

    /// Bytes required in shared memory for this array type.
    fn shm_size() -> usize
    where
        Self: Sized,
    {
        mem::size_of::<Self>()
    }

    /// Increment the connection counter; returns the prior count.
    fn connect(&self) -> usize;

    /// Decrement the connection counter; returns the prior count.
    fn disconnect(&self) -> usize;

    /// Current number of connected endpoints.
    fn conn_count(&self) -> usize;

    /// Current publication cursor.
    fn cursor(&self) -> u16;

    /// Claim the next writable slot, spinning until its read counter
    /// drains to zero, and stamp it with the current connection count.
    /// Returns the slot's data area.
    fn acquire(&self) -> *mut u8;

    /// Publish a slot previously returned by [`RingArray::acquire`].
    ///
    /// # Safety
    /// `ptr` must be the exact pointer returned by `acquire` on `self`,
    /// committed exactly once.
    unsafe fn commit(&self, ptr: *mut u8);

    /// Data area of the slot addressed by `cursor`.
    fn take(&self, cursor: u16) -> *mut u8;

    /// Release one read of the slot containing `ptr`.
    ///
    /// # Safety
    /// `ptr` must be a pointer previously returned by [`RingArray::take`]
    /// on `self`, released exactly once per take.
    unsafe fn put(&self, ptr: *mut u8);
}

// ---------------------------------------------------------------------------
// Single-producer array
// ---------------------------------------------------------------------------

/// Array head: connection counter + write cursor, padded to max alignment
/// so the slot block starts at a 16-byte boundary.
#[repr(C, align(16))]
pub struct ArrayHead {
    cc: AtomicU16,
    wt: AtomicU16,
}

/// Per-slot header: the broadcast read counter.
#[repr(C)]
pub struct ElemHead {
    rc: AtomicU32,
}

#[repr(C)]
struct Elem<const DATA_SIZE: usize> {
    head: ElemHead,
    data: UnsafeCell<[u8; DATA_SIZE]>,
}

/// Single-producer broadcast ring.
#[repr(C)]
pub struct ElemArray<const DATA_SIZE: usize> {
    head: ArrayHead,
    block: [Elem<DATA_SIZE>; ELEM_MAX],
}

unsafe impl<const DATA_SIZE: usize> Send for ElemArray<DATA_SIZE> {}
unsafe impl<const DATA_SIZE: usize> Sync for ElemArray<DATA_SIZE> {}

impl<const DATA_SIZE: usize> ElemArray<DATA_SIZE> {
    const ALIGN_OK: () = assert!(DATA_SIZE % mem::align_of::<ElemHead>() == 0);

    /// Padded size of the array head.
    pub const HEAD_SIZE: usize = mem::size_of::<ArrayHead>();

    /// Bytes per slot including its header.
    pub const ELEM_SIZE: usize = mem::size_of::<Elem<DATA_SIZE>>();

    fn elem(&self, i: u8) -> &Elem<DATA_SIZE> {
        &self.block[i as usize]
    }
}

impl<const DATA_SIZE: usize> RingArray for ElemArray<DATA_SIZE> {
    const DATA_SIZE: usize = DATA_SIZE;

    unsafe fn attach<'a>(mem: *mut u8) -> &'a Self {
        let () = Self::ALIGN_OK;
        &*(mem as *const Self)
    }

    fn connect(&self) -> usize {
        self.head.cc.fetch_add(1, Ordering::Release) as usize
    }

    fn disconnect(&self) -> usize {
        self.head.cc.fetch_sub(1, Ordering::Release) as usize
    }

    fn conn_count(&self) -> usize {
        self.head.cc.load(Ordering::Acquire) as usize
    }

    fn cursor(&self) -> u16 {
        self.head.wt.load(Ordering::Acquire)
    }

    fn acquire(&self) -> *mut u8 {
        let el = self.elem(index_of(self.head.wt.load(Ordering::Acquire)));
        let mut backoff = Backoff::new();
        loop {
            // Gate on all consumers having finished the previous round for
            // this slot. Acquire on success orders our payload writes after
            // the last consumer's release `put`; the connection count is
            // sampled relaxed, bounded by the fence below.
            let conns = self.head.cc.load(Ordering::Relaxed) as u32;
            if el
                .head
                .rc
                .compare_exchange_weak(0, conns, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
            {
                break;
            }
            backoff.snooze();
            fence(Ordering::Acquire);
        }
        el.data.get() as *mut u8
    }

    unsafe fn commit(&self, _ptr: *mut u8) {
        self.head.wt.fetch_add(1, Ordering::Release);
    }

    fn take(&self, cursor: u16) -> *mut u8 {
        self.elem(index_of(cursor)).data.get() as *mut u8
    }

    unsafe fn put(&self, ptr: *mut u8) {
        let head = &*(ptr.sub(mem::size_of::<ElemHead>()) as *const ElemHead);
        head.rc.fetch_sub(1, Ordering::Release);
    }
}

// ---------------------------------------------------------------------------
// Multi-producer array
// ---------------------------------------------------------------------------

/// Multi-producer array head: connection counter, commit cursor, and the
/// 8-bit reservation index (wraps over the 256 slots by overflow).
#[repr(C, align(16))]
pub struct MpArrayHead {
    cc: AtomicU16,
    cr: AtomicU16,
    wt: AtomicU8,
}

/// Multi-producer slot header: read counter, committed flag, owner flag.
#[repr(C)]
pub struct MpElemHead {
    rf: AtomicU16,
    wf: AtomicBool,
    acq: AtomicBool,
}

#[repr(C)]
struct MpElem<const DATA_SIZE: usize> {
    head: MpElemHead,
    data: UnsafeCell<[u8; DATA_SIZE]>,
}

/// Multi-producer broadcast ring with a two-phase publish.
///
/// A producer reserves a slot with a fetch-add on the reservation index
/// and takes ownership via the slot's `acq` flag, then gates on the read
/// counter like the single-producer ring. Commit either advances the
/// commit cursor (when this slot is the next one due) and keeps walking
/// over neighbours that already finished (consuming their `wf` flags), or
/// records its own completion in `wf` for whichever producer currently
/// owns the cursor front.
#[repr(C)]
pub struct MpElemArray<const DATA_SIZE: usize> {
    head: MpArrayHead,
    block: [MpElem<DATA_SIZE>; ELEM_MAX],
}

unsafe impl<const DATA_SIZE: usize> Send for MpElemArray<DATA_SIZE> {}
unsafe impl<const DATA_SIZE: usize> Sync for MpElemArray<DATA_SIZE> {}

impl<const DATA_SIZE: usize> MpElemArray<DATA_SIZE> {
    const ALIGN_OK: () = assert!(DATA_SIZE % mem::align_of::<MpElemHead>() == 0);

    /// Padded size of the array head.
    pub const HEAD_SIZE: usize = mem::size_of::<MpArrayHead>();

    /// Bytes per slot including its header.
    pub const ELEM_SIZE: usize = mem::size_of::<MpElem<DATA_SIZE>>();

    fn elem(&self, i: u8) -> &MpElem<DATA_SIZE> {
        &self.block[i as usize]
    }

    fn index_of_data(&self, ptr: *mut u8) -> u8 {
        let base = self.block.as_ptr() as usize;
        let off = (ptr as usize) - mem::size_of::<MpElemHead>() - base;
        (off / mem::size_of::<MpElem<DATA_SIZE>>()) as u8
    }
}

impl<const DATA_SIZE: usize> RingArray for MpElemArray<DATA_SIZE> {
    const DATA_SIZE: usize = DATA_SIZE;

    unsafe fn attach<'a>(mem: *mut u8) -> &'a Self {
        let () = Self::ALIGN_OK;
        &*(mem as *const Self)
    }

    fn connect(&self) -> usize {
        self.head.cc.fetch_add(1, Ordering::Release) as usize
    }

    fn disconnect(&self) -> usize {
        self.head.cc.fetch_sub(1, Ordering::Release) as usize
    }

    fn conn_count(&self) -> usize {
        self.head.cc.load(Ordering::Acquire) as usize
    }

    fn cursor(&self) -> u16 {
        self.head.cr.load(Ordering::Acquire)
    }

    fn acquire(&self) -> *mut u8 {
        loop {
            // Reserve the next slot; if another producer still owns it
            // (lapped the ring), move on to the one after.
            let wi = self.head.wt.fetch_add(1, Ordering::Acquire);
            let el = self.elem(wi);
            if el.head.acq.swap(true, Ordering::AcqRel) {
                std::thread::yield_now();
                continue;
            }
            // Gate on all consumers having drained this slot.
            let mut backoff = Backoff::new();
            loop {
                fence(Ordering::Acquire);
                let conns = self.head.cc.load(Ordering::Relaxed);
                if el
                    .head
                    .rf
                    .compare_exchange_weak(0, conns, Ordering::Release, Ordering::Relaxed)
                    .is_ok()
                {
                    break;
                }
                backoff.snooze();
            }
            el.head.acq.store(false, Ordering::Release);
            return el.data.get() as *mut u8;
        }
    }

    unsafe fn commit(&self, ptr: *mut u8) {
        let mut wi = self.index_of_data(ptr);
        let mut el = self.elem(wi);
        loop {
            let mut curr = self.head.cr.load(Ordering::Acquire);
            let cas;
            let mut no_next;
            loop {
                let mut next = curr;
                no_next = index_of(curr) != wi;
                if no_next {
                    // Not the cursor front: leave a committed mark for the
                    // producer that is, and confirm the cursor is unchanged.
                    el.head.wf.store(true, Ordering::Release);
                } else {
                    next = next.wrapping_add(1);
                    el.head.wf.store(false, Ordering::Release);
                }
                // Strong CAS: a failure here must mean the cursor really
                // moved, otherwise a spurious failure at the cursor front
                // would abandon the walk with the slot unpublished.
                match self.head.cr.compare_exchange(
                    curr,
                    next,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                ) {
                    Ok(_) => {
                        cas = true;
                        break;
                    }
                    Err(seen) => {
                        // The cursor moved under us; re-judge against it.
                        curr = seen;
                        if no_next {
                            continue;
                        }
                        cas = false;
                        break;
                    }
                }
            }
            if no_next || !cas {
                // Either our mark is visible to the cursor owner, or another
                // producer advanced the cursor over our slot already.
                return;
            }
            // We advanced the cursor; keep walking while neighbours have
            // already committed, consuming their marks.
            wi = wi.wrapping_add(1);
            el = self.elem(wi);
            if !el.head.wf.swap(false, Ordering::AcqRel) {
                return;
            }
        }
    }

    fn take(&self, cursor: u16) -> *mut u8 {
        self.elem(index_of(cursor)).data.get() as *mut u8
    }

    unsafe fn put(&self, ptr: *mut u8) {
        let head = &*(ptr.sub(mem::size_of::<MpElemHead>()) as *const MpElemHead);
        head.rf.fetch_sub(1, Ordering::Release);
    }
}

// ---------------------------------------------------------------------------
// Layout pins
// ---------------------------------------------------------------------------

use static_assertions::const_assert_eq;

const_assert_eq!(mem::size_of::<ArrayHead>(), 16);
const_assert_eq!(mem::size_of::<MpArrayHead>(), 16);
const_assert_eq!(mem::size_of::<ElemHead>(), 4);
const_assert_eq!(mem::size_of::<MpElemHead>(), 4);
const_assert_eq!(mem::size_of::<ElemArray<12>>(), 16 + ELEM_MAX * 16);
const_assert_eq!(mem::size_of::<MpElemArray<36>>(), 16 + ELEM_MAX * 40);
