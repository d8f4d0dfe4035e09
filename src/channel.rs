// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 shmcast contributors
//
// Broadcast channels over a shared-memory ring, with fragmentation.
//
// A channel maps a named region holding a multi-producer element array and
// moves arbitrary-length payloads through it as fixed-size fragments. Every
// fragment of a message carries the same monotonic message id (drawn from a
// process-shared accumulator) and a descending `remain` byte count; a
// fragment with `remain <= 0` terminates its message. Each receiving handle
// reassembles fragments in its own cache keyed by message id, so fragments
// of in-flight messages from different senders may interleave freely.
//
// Endpoints are symmetric: any handle can send, and a handle joins the
// consumer side lazily on its first `recv`. A handle drops fragments
// stamped with its own tag, so it never receives its own messages.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::io;
use std::mem;
use std::ptr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;
use std::time::{Duration, Instant};

use static_assertions::const_assert_eq;

use crate::buffer::Buffer;
use crate::circ::{MpElemArray, RingArray};
use crate::queue::Queue;
use crate::shm::ShmHandle;
use crate::spin_lock::Backoff;
use crate::waiter::Waiter;

/// Payload bytes carried by one fragment.
pub const DATA_LENGTH: usize = 16;

/// Shared region holding the global message-id accumulator.
const MSG_ACC_NAME: &str = "GLOBAL_ACC_STORAGE__";

/// Times a receiver spins before parking on the waiter.
const SPIN_COUNT: u32 = 32;

/// One ring slot's worth of a message.
///
/// `remain` is the byte count still to come after this fragment's nominal
/// `DATA_LENGTH` bytes: positive for middle fragments, `<= 0` for the
/// terminator, whose valid byte count is `DATA_LENGTH + remain`.
#[repr(C, packed(1))]
#[derive(Clone, Copy)]
struct Fragment {
    tag: u64,
    id: u64,
    remain: i32,
    data: [u8; DATA_LENGTH],
}

/// Slot payload size required by the fragment layout.
const FRAG_SIZE: usize = mem::size_of::<Fragment>();

const_assert_eq!(FRAG_SIZE, 8 + 8 + 4 + DATA_LENGTH);

type Elems = MpElemArray<FRAG_SIZE>;

/// Split `data` into fragments stamped `(tag, id)` with descending
/// `remain` values.
fn fragments<'a>(tag: u64, id: u64, data: &'a [u8]) -> impl Iterator<Item = Fragment> + 'a {
    let size = data.len();
    let full = size / DATA_LENGTH;
    let tail = size % DATA_LENGTH;
    (0..full)
        .map(move |i| {
            let offset = i * DATA_LENGTH;
            let mut d = [0u8; DATA_LENGTH];
            d.copy_from_slice(&data[offset..offset + DATA_LENGTH]);
            Fragment {
                tag,
                id,
                remain: (size - offset - DATA_LENGTH) as i32,
                data: d,
            }
        })
        .chain((tail > 0).then(move || {
            let offset = full * DATA_LENGTH;
            let mut d = [0u8; DATA_LENGTH];
            d[..tail].copy_from_slice(&data[offset..]);
            Fragment {
                tag,
                id,
                remain: tail as i32 - DATA_LENGTH as i32,
                data: d,
            }
        }))
}

/// The process-shared message-id accumulator. Ids start at 1; 0 is
/// reserved as "no message".
fn msg_id_acc() -> Option<&'static AtomicU64> {
    static ACC: OnceLock<Option<ShmHandle>> = OnceLock::new();
    let acc = ACC.get_or_init(|| {
        ShmHandle::acquire(MSG_ACC_NAME, mem::size_of::<AtomicU64>())
            .map_err(|e| log::warn!("message-id accumulator unavailable: {e}"))
            .ok()
    });
    acc.as_ref()
        .map(|h| unsafe { &*(h.get() as *const AtomicU64) })
}

/// A broadcast channel endpoint.
///
/// Handles with the same name share one ring. `send` publishes to every
/// handle that was receiving at publish time; `recv` blocks until a whole
/// message (from some other handle) has been reassembled.
pub struct Channel {
    name: String,
    shm: ShmHandle,
    que: Box<Queue<Fragment, Elems>>,
    tag: u64,
    waiter: Waiter,
    cache: HashMap<u64, Vec<u8>>,
}

impl Channel {
    fn waiter_name(name: &str) -> String {
        format!("{name}__IPC_WAITER__")
    }

    /// Connect to the named channel, creating its region on first use.
    ///
    /// The handle can send immediately; it joins the consumer side on its
    /// first `recv`/`try_recv`.
    pub fn connect(name: &str) -> io::Result<Self> {
        let shm = ShmHandle::acquire(name, Elems::shm_size()).map_err(|e| {
            log::warn!("channel {name}: region acquire failed: {e}");
            e
        })?;
        let elems = unsafe { Elems::attach(shm.get()) };
        let que = Box::new(Queue::attach(elems));
        // The boxed endpoint's address identifies this handle in fragments
        // it emits; it is stable for the handle's lifetime.
        let tag = &*que as *const Queue<Fragment, Elems> as u64;
        let waiter = Waiter::open(&Self::waiter_name(name))?;
        Ok(Self {
            name: name.to_string(),
            shm,
            que,
            tag,
            waiter,
            cache: HashMap::new(),
        })
    }

    /// The channel name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of handles currently receiving on this channel.
    pub fn recv_count(&self) -> usize {
        self.que.conn_count()
    }

    /// Poll until at least `count` receivers are connected. With a
    /// timeout, returns `false` when it elapses first.
    pub fn wait_for_recv(&self, count: usize, timeout_ms: Option<u64>) -> bool {
        let deadline = timeout_ms.map(|ms| Instant::now() + Duration::from_millis(ms));
        let mut backoff = Backoff::new();
        while self.recv_count() < count {
            if let Some(dl) = deadline {
                if Instant::now() >= dl {
                    return false;
                }
            }
            backoff.snooze();
        }
        true
    }

    /// Publish `data` to every currently-receiving handle.
    ///
    /// Returns `false` for empty input or when the message-id accumulator
    /// is unavailable; otherwise blocks (spin + yield per slot) until all
    /// fragments are published and returns `true`.
    pub fn send(&self, data: &[u8]) -> bool {
        if data.is_empty() {
            return false;
        }
        let Some(acc) = msg_id_acc() else {
            return false;
        };
        let id = acc.fetch_add(1, Ordering::Relaxed) + 1;
        for frag in fragments(self.tag, id, data) {
            if !self.que.push(frag) {
                return false;
            }
            self.waiter.broadcast();
        }
        true
    }

    /// Receive the next whole message, blocking until one arrives.
    ///
    /// The first call registers this handle as a receiver; publications
    /// committed before that are not seen. Returns an empty buffer only if
    /// the ring produced the reserved id 0 (a cleared region).
    pub fn recv(&mut self) -> Buffer {
        if !self.que.connected() {
            self.que.connect();
        }
        loop {
            let frag = {
                let mut k = 0u32;
                loop {
                    if let Some(f) = self.que.try_pop() {
                        break f;
                    }
                    if k < SPIN_COUNT {
                        k += 1;
                        std::thread::yield_now();
                    } else {
                        self.waiter.wait_if(|| !self.que.has_next());
                        k = 0;
                    }
                }
            };
            if let Some(buf) = self.absorb(frag) {
                return buf;
            }
        }
    }

    /// Drain available fragments; returns a message if one completed.
    ///
    /// Like `recv`, the first call registers this handle as a receiver.
    pub fn try_recv(&mut self) -> Option<Buffer> {
        if !self.que.connected() {
            self.que.connect();
        }
        while let Some(frag) = self.que.try_pop() {
            if let Some(buf) = self.absorb(frag) {
                if buf.is_empty() {
                    return None;
                }
                return Some(buf);
            }
        }
        None
    }

    /// Fold one fragment into the reassembly cache; returns the finished
    /// message when this fragment completed one.
    fn absorb(&mut self, frag: Fragment) -> Option<Buffer> {
        let id = frag.id;
        let tag = frag.tag;
        let remain = frag.remain;
        let data = frag.data;

        if id == 0 {
            // Reserved "no message" id; only a cleared region yields it.
            return Some(Buffer::new());
        }
        if tag == self.tag {
            return None; // own message echoed back
        }

        let remain_bytes = (DATA_LENGTH as i32 + remain) as usize;
        match self.cache.entry(id) {
            Entry::Vacant(entry) => {
                if remain_bytes <= DATA_LENGTH {
                    // Single-fragment message.
                    return Some(Buffer::from_slice(&data[..remain_bytes]));
                }
                // First fragment: remain counts every byte still to come,
                // so this reserves the full message size up front.
                let mut buff = Vec::with_capacity(remain_bytes);
                buff.extend_from_slice(&data);
                entry.insert(buff);
                None
            }
            Entry::Occupied(mut entry) => {
                if remain <= 0 {
                    entry.get_mut().extend_from_slice(&data[..remain_bytes]);
                    Some(Buffer::from_vec(entry.remove()))
                } else {
                    entry.get_mut().extend_from_slice(&data);
                    None
                }
            }
        }
    }

    /// Zero the channel's shared region and reset this handle's endpoint
    /// state. Destructive; test setup only.
    pub fn clear_recv(&mut self) {
        if self.que.connected() {
            self.que.disconnect();
        }
        self.cache.clear();
        unsafe { ptr::write_bytes(self.shm.get(), 0, Elems::shm_size()) };
        let elems = unsafe { Elems::attach(self.shm.get()) };
        *self.que = Queue::attach(elems);
    }

    /// Zero the named channel's shared region.
    pub fn clear_recv_by_name(name: &str) -> io::Result<()> {
        let mut ch = Channel::connect(name)?;
        ch.clear_recv();
        Ok(())
    }

    /// Remove all backing storage for a named channel.
    pub fn clear_storage(name: &str) {
        ShmHandle::unlink_by_name(name);
        Waiter::clear_storage(&Self::waiter_name(name));
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        // Deregister the endpoint while `shm` is still mapped: the queue
        // holds a pointer into the region, and fields drop in declaration
        // order, so the mapping would otherwise be gone first.
        self.que.disconnect();
    }
}
