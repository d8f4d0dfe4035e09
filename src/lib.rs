// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 shmcast contributors
//
// Lock-free shared-memory broadcast channels.
//
// The core is a fixed-capacity circular element array in a named
// shared-memory region, coordinated entirely by atomics: producers
// acquire/commit slots, and every connected consumer reads each published
// slot exactly once. A fragmenting channel layer on top moves
// arbitrary-length messages through the fixed-size slots.

#[cfg(not(unix))]
compile_error!("shmcast requires a POSIX platform");

mod platform;

mod shm;
pub use shm::ShmHandle;

mod spin_lock;
pub use spin_lock::{Backoff, SpinLock};

pub mod waiter;
pub use waiter::Waiter;

pub mod circ;

pub mod queue;
pub use queue::{Queue, INVALID_VALUE};

pub mod buffer;
pub use buffer::Buffer;

pub mod channel;
pub use channel::{Channel, DATA_LENGTH};
