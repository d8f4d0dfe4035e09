// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 shmcast contributors

#[cfg(unix)]
pub mod posix;

#[cfg(unix)]
pub use posix::{PlatformShm, Semaphore};
