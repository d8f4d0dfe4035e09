// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 shmcast contributors
//
// Typed queue endpoints over a circular element array.
//
// A `Queue` binds one endpoint (producer, consumer, or both) to an array
// living in shared memory and moves fixed-size `Copy` records through it.
// Producers only ever push; a consumer endpoint must `connect` first,
// which registers it for broadcast accounting and snapshots the cursor —
// publications committed before the snapshot are never seen.

use std::marker::PhantomData;
use std::ptr;

use crate::circ::RingArray;
use crate::spin_lock::Backoff;

/// Sentinel returned by [`Queue::connect`] / [`Queue::disconnect`] when the
/// endpoint is already in the requested state.
pub const INVALID_VALUE: usize = usize::MAX;

/// A typed endpoint over a ring array in shared memory.
pub struct Queue<T, A: RingArray> {
    elems: *const A,
    cursor: u16,
    connected: bool,
    _marker: PhantomData<T>,
}

// The array behind the pointer is process-shared and every access to it is
// atomic; the endpoint-local cursor state stays with the moved value.
unsafe impl<T: Send, A: RingArray> Send for Queue<T, A> {}

impl<T: Copy, A: RingArray> Queue<T, A> {
    const FIT: () = assert!(std::mem::size_of::<T>() <= A::DATA_SIZE);

    /// Bind an endpoint to an attached array. The endpoint starts
    /// unconnected: producers can push immediately, consumers call
    /// [`Queue::connect`] (or let the channel layer do it lazily).
    pub fn attach(elems: &A) -> Self {
        let () = Self::FIT;
        Self {
            elems,
            cursor: 0,
            connected: false,
            _marker: PhantomData,
        }
    }

    fn elems(&self) -> &A {
        unsafe { &*self.elems }
    }

    /// Whether this endpoint is consumer-connected.
    pub fn connected(&self) -> bool {
        self.connected
    }

    /// Register this endpoint as a consumer. The connection count is
    /// incremented before the cursor snapshot, so any slot stamped after
    /// the increment counts us in. Returns the prior connection count, or
    /// [`INVALID_VALUE`] if already connected.
    pub fn connect(&mut self) -> usize {
        if self.connected {
            return INVALID_VALUE;
        }
        let prior = self.elems().connect();
        self.cursor = self.elems().cursor();
        self.connected = true;
        prior
    }

    /// Deregister this consumer. Returns the prior connection count, or
    /// [`INVALID_VALUE`] if not connected.
    pub fn disconnect(&mut self) -> usize {
        if !self.connected {
            return INVALID_VALUE;
        }
        self.connected = false;
        self.elems().disconnect()
    }

    /// Current number of connected consumers on the underlying array.
    pub fn conn_count(&self) -> usize {
        self.elems().conn_count()
    }

    /// Whether a publication is pending for this consumer.
    pub fn has_next(&self) -> bool {
        self.connected && self.cursor != self.elems().cursor()
    }

    /// Publish one record. Blocks (spin + yield) while the target slot is
    /// still owed reads from the previous round.
    pub fn push(&self, item: T) -> bool {
        let a = self.elems();
        let ptr = a.acquire();
        unsafe {
            ptr::write_unaligned(ptr as *mut T, item);
            a.commit(ptr);
        }
        true
    }

    /// Take the pending record, if any. Returns `None` when the ring has
    /// nothing new for this consumer (or it is not connected).
    pub fn try_pop(&mut self) -> Option<T> {
        if !self.has_next() {
            return None;
        }
        let a = self.elems();
        let ptr = a.take(self.cursor);
        let item = unsafe { ptr::read_unaligned(ptr as *const T) };
        unsafe { a.put(ptr) };
        self.cursor = self.cursor.wrapping_add(1);
        Some(item)
    }

    /// Pop the next record, spinning with escalating backoff until one is
    /// published.
    pub fn pop(&mut self) -> T {
        let mut backoff = Backoff::new();
        loop {
            if let Some(item) = self.try_pop() {
                return item;
            }
            backoff.snooze();
        }
    }
}

impl<T, A: RingArray> Drop for Queue<T, A> {
    fn drop(&mut self) {
        if self.connected {
            unsafe { &*self.elems }.disconnect();
        }
    }
}
