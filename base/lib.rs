// This file is part of Vigil NVR, a security camera network video recorder.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

pub mod clock;
mod error;
pub mod shutdown;
pub mod strutil;
pub mod time;
pub mod tracing_setup;

pub(crate) use std::sync::Condvar;
pub(crate) use std::sync::Mutex as StdMutex;

/// Thin wrapper matching the `parking_lot`-style `.lock()` call sites used
/// throughout this crate while staying on `std::sync::Mutex` underneath.
pub(crate) struct Mutex<T>(StdMutex<T>);

impl<T> Mutex<T> {
    pub(crate) fn new(t: T) -> Self {
        Mutex(StdMutex::new(t))
    }

    pub(crate) fn lock(&self) -> std::sync::MutexGuard<'_, T> {
        self.0.lock().unwrap_or_else(|e| e.into_inner())
    }
}

pub use crate::error::{Error, ErrorKind, ResultExt};
