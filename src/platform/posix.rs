// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 shmcast contributors
//
// POSIX backing for named shared-memory regions and named semaphores.
//
// Regions are reference-counted in place: the mapping is extended by one
// trailing `atomic<int32_t>` slot, incremented on acquire and decremented
// on release. The last release unlinks the kernel object, so a region
// lives exactly as long as some process has it mapped.

use std::ffi::CString;
use std::io;
use std::ptr;
use std::sync::atomic::{AtomicI32, Ordering};

// ---------------------------------------------------------------------------
// Name mangling
// ---------------------------------------------------------------------------

/// FNV-1a 64-bit hash, used to shorten over-long region names.
pub fn fnv1a_64(data: &[u8]) -> u64 {
    let mut hash: u64 = 0xcbf29ce484222325;
    for &b in data {
        hash ^= b as u64;
        hash = hash.wrapping_mul(0x100000001b3);
    }
    hash
}

fn to_hex(val: u64) -> [u8; 16] {
    const DIGITS: &[u8; 16] = b"0123456789abcdef";
    let mut buf = [0u8; 16];
    let mut v = val;
    for i in (0..16).rev() {
        buf[i] = DIGITS[(v & 0xf) as usize];
        v >>= 4;
    }
    buf
}

/// Maximum length for POSIX object names. 0 disables truncation.
///
/// macOS caps shm names at `PSHMNAMLEN` (31); Linux allows up to 255.
#[cfg(target_os = "macos")]
pub const NAME_MAX: usize = 31;

#[cfg(not(target_os = "macos"))]
pub const NAME_MAX: usize = 0;

/// Produce a POSIX-safe object name (with leading '/').
///
/// Names longer than [`NAME_MAX`] are shortened to
/// `/<prefix>_<16-hex-fnv1a-hash>`, keeping a truncated portion of the
/// original for debuggability.
pub fn object_name(name: &str) -> String {
    let result = if name.starts_with('/') {
        name.to_string()
    } else {
        format!("/{name}")
    };

    if NAME_MAX == 0 || result.len() <= NAME_MAX {
        return result;
    }

    // 1 (underscore) + 16 (hex hash)
    const HASH_SUFFIX_LEN: usize = 1 + 16;
    let prefix_len = if NAME_MAX > HASH_SUFFIX_LEN + 1 {
        NAME_MAX - HASH_SUFFIX_LEN - 1 // -1 for leading '/'
    } else {
        0
    };

    let hash = fnv1a_64(result.as_bytes());
    let hex = to_hex(hash);
    let hex_str = std::str::from_utf8(&hex).unwrap();

    let mut shortened = String::with_capacity(NAME_MAX);
    shortened.push('/');
    if prefix_len > 0 {
        let original_body = &result[1..];
        let take = prefix_len.min(original_body.len());
        shortened.push_str(&original_body[..take]);
    }
    shortened.push('_');
    shortened.push_str(hex_str);
    shortened
}

fn c_name(posix_name: &str) -> io::Result<CString> {
    CString::new(posix_name.as_bytes())
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))
}

// ---------------------------------------------------------------------------
// Region layout helpers
// ---------------------------------------------------------------------------

const ALIGN: usize = std::mem::align_of::<AtomicI32>();

/// Total mapped size: the user size rounded up to the ref-counter
/// alignment, plus the trailing counter itself.
pub(crate) fn mapped_size(user_size: usize) -> usize {
    let aligned = ((user_size.wrapping_sub(1) / ALIGN) + 1) * ALIGN;
    aligned + std::mem::size_of::<AtomicI32>()
}

/// The trailing ref counter of a mapped region of `total` bytes at `mem`.
///
/// # Safety
/// `mem` must point to a valid mapped region of at least `total` bytes.
unsafe fn acc_of(mem: *mut u8, total: usize) -> &'static AtomicI32 {
    let offset = total - std::mem::size_of::<AtomicI32>();
    &*(mem.add(offset) as *const AtomicI32)
}

// ---------------------------------------------------------------------------
// PlatformShm
// ---------------------------------------------------------------------------

pub struct PlatformShm {
    mem: *mut u8,
    size: usize,      // total mapped size (including ref counter)
    user_size: usize, // caller-requested size
    name: String,     // POSIX name (with leading '/')
    prev_ref: i32,    // ref count before our own increment
}

// The region is process-shared by design.
unsafe impl Send for PlatformShm {}
unsafe impl Sync for PlatformShm {}

impl PlatformShm {
    /// Acquire a named region of `user_size` bytes, creating it (zero-filled)
    /// if it does not exist yet.
    pub fn acquire(name: &str, user_size: usize) -> io::Result<Self> {
        if name.is_empty() {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "name is empty"));
        }
        if user_size == 0 {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "size is 0"));
        }

        let posix_name = object_name(name);
        let cname = c_name(&posix_name)?;

        let perms: libc::mode_t = 0o666;
        let total = mapped_size(user_size);

        // Try exclusive create first so ftruncate only runs on a region we
        // actually own. On macOS ftruncate on an already-sized object can
        // zero its contents before returning EINVAL.
        let fd = unsafe {
            libc::shm_open(
                cname.as_ptr(),
                libc::O_RDWR | libc::O_CREAT | libc::O_EXCL,
                perms as libc::c_uint,
            )
        };
        let fd = if fd != -1 {
            let ret = unsafe { libc::ftruncate(fd, total as libc::off_t) };
            if ret != 0 {
                let err = io::Error::last_os_error();
                unsafe { libc::close(fd) };
                return Err(err);
            }
            fd
        } else {
            let e = io::Error::last_os_error();
            if e.raw_os_error() != Some(libc::EEXIST) {
                return Err(e);
            }
            let fd = unsafe { libc::shm_open(cname.as_ptr(), libc::O_RDWR, perms as libc::c_uint) };
            if fd == -1 {
                return Err(io::Error::last_os_error());
            }
            fd
        };

        unsafe { libc::fchmod(fd, perms) };

        let mem = unsafe {
            libc::mmap(
                ptr::null_mut(),
                total,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd,
                0,
            )
        };
        unsafe { libc::close(fd) };

        if mem == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }

        let mem = mem as *mut u8;
        let prev = unsafe { acc_of(mem, total).fetch_add(1, Ordering::AcqRel) };

        Ok(Self {
            mem,
            size: total,
            user_size,
            name: posix_name,
            prev_ref: prev,
        })
    }

    /// Pointer to the user-visible region (excludes the trailing counter).
    pub fn as_mut_ptr(&self) -> *mut u8 {
        self.mem
    }

    /// Total mapped size (including the trailing counter).
    pub fn mapped_size(&self) -> usize {
        self.size
    }

    /// Caller-requested size.
    pub fn user_size(&self) -> usize {
        self.user_size
    }

    /// POSIX name (with leading '/').
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The ref count before our own increment; 0 means we created the region.
    pub fn prev_ref_count(&self) -> i32 {
        self.prev_ref
    }

    /// Current reference count.
    pub fn ref_count(&self) -> i32 {
        if self.mem.is_null() {
            return 0;
        }
        unsafe { acc_of(self.mem, self.size).load(Ordering::Acquire) }
    }

    /// Unlink a named region without needing an open handle.
    pub fn unlink_by_name(name: &str) {
        let posix_name = object_name(name);
        if let Ok(c) = c_name(&posix_name) {
            unsafe { libc::shm_unlink(c.as_ptr()) };
        }
    }
}

impl Drop for PlatformShm {
    fn drop(&mut self) {
        if self.mem.is_null() {
            return;
        }
        let prev = unsafe { acc_of(self.mem, self.size).fetch_sub(1, Ordering::AcqRel) };
        unsafe { libc::munmap(self.mem as *mut libc::c_void, self.size) };
        if prev <= 1 {
            if let Ok(c) = c_name(&self.name) {
                unsafe { libc::shm_unlink(c.as_ptr()) };
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Semaphore — POSIX named counting semaphore
// ---------------------------------------------------------------------------

/// A named, inter-process counting semaphore.
///
/// Used by the waiter to park idle consumers. The semaphore shares its
/// mangled name with the wait event's shared-memory ref-count region;
/// the two live in separate kernel namespaces.
pub struct Semaphore {
    sem: *mut libc::sem_t,
}

unsafe impl Send for Semaphore {}

impl Semaphore {
    /// Open (or create, with an initial count of 0) a named semaphore.
    pub fn open(name: &str) -> io::Result<Self> {
        let posix_name = object_name(name);
        let cname = c_name(&posix_name)?;
        let sem = unsafe {
            libc::sem_open(
                cname.as_ptr(),
                libc::O_CREAT,
                0o666 as libc::c_uint,
                0 as libc::c_uint,
            )
        };
        if sem == libc::SEM_FAILED {
            return Err(io::Error::last_os_error());
        }
        Ok(Self { sem })
    }

    /// Increment the count, waking one blocked waiter.
    pub fn post(&self) -> io::Result<()> {
        if unsafe { libc::sem_post(self.sem) } != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// Block until the count is positive, then decrement it.
    /// Restarts transparently when interrupted by a signal.
    pub fn wait(&self) -> io::Result<()> {
        loop {
            if unsafe { libc::sem_wait(self.sem) } == 0 {
                return Ok(());
            }
            let e = io::Error::last_os_error();
            if e.raw_os_error() != Some(libc::EINTR) {
                return Err(e);
            }
        }
    }

    /// Remove the named semaphore object.
    pub fn unlink(name: &str) {
        let posix_name = object_name(name);
        if let Ok(c) = c_name(&posix_name) {
            unsafe { libc::sem_unlink(c.as_ptr()) };
        }
    }
}

impl Drop for Semaphore {
    fn drop(&mut self) {
        unsafe { libc::sem_close(self.sem) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fnv1a_known_value() {
        assert_eq!(fnv1a_64(b""), 0xcbf29ce484222325);
    }

    #[test]
    fn object_name_prepends_slash() {
        let name = object_name("foo");
        assert!(name.starts_with('/'));
        assert!(name.contains("foo"));
    }

    #[test]
    fn object_name_keeps_existing_slash() {
        let name = object_name("/bar");
        assert_eq!(&name[..4], "/bar");
    }

    #[test]
    fn mapped_size_rounds_up() {
        assert_eq!(mapped_size(1), 8);
        assert_eq!(mapped_size(4), 8);
        assert_eq!(mapped_size(5), 12);
    }
}
