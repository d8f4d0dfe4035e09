// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 shmcast contributors
//
// Named, reference-counted shared-memory regions.
//
// The first acquire of a name creates the region zero-filled; later
// acquires of the same name map the same region. Each mapping holds one
// reference; when the last mapping anywhere is released, the named
// kernel object is destroyed.

use std::io;

use crate::platform::PlatformShm;

/// A named, inter-process shared memory region.
pub struct ShmHandle {
    inner: PlatformShm,
}

impl ShmHandle {
    /// Acquire a named region of `size` bytes (user-visible), creating it
    /// zero-filled if this is the first acquire of `name`.
    pub fn acquire(name: &str, size: usize) -> io::Result<Self> {
        let inner = PlatformShm::acquire(name, size)?;
        Ok(Self { inner })
    }

    /// Mutable pointer to the start of the user-visible region.
    pub fn get(&self) -> *mut u8 {
        self.inner.as_mut_ptr()
    }

    /// User-requested size (the usable portion).
    pub fn user_size(&self) -> usize {
        self.inner.user_size()
    }

    /// Total mapped size, including the trailing ref counter.
    pub fn mapped_size(&self) -> usize {
        self.inner.mapped_size()
    }

    /// The platform name used to open the region.
    pub fn name(&self) -> &str {
        self.inner.name()
    }

    /// Number of mappings of this region across all processes.
    pub fn ref_count(&self) -> i32 {
        self.inner.ref_count()
    }

    /// The ref count before this handle's own increment.
    /// Zero means this handle created the region.
    pub fn prev_ref_count(&self) -> i32 {
        self.inner.prev_ref_count()
    }

    /// Remove a named region's backing object without an open handle.
    pub fn unlink_by_name(name: &str) {
        PlatformShm::unlink_by_name(name);
    }
}
