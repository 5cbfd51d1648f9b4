//! Native boundary helpers mirroring the JNI critical-array functions.
//!
//! `Get*Critical` / `Release*Critical` map to [`begin_critical`] and
//! [`end_critical`]; [`CriticalSection`] and [`CriticalArray`] scope them
//! so the matching exit runs even when the native code unwinds.

use crate::critical::RegionId;
use crate::java_thread::JavaThread;
use std::ops::{Deref, DerefMut};

/// Explicit critical entry. Returns the new depth.
pub fn begin_critical(thread: &JavaThread, region: Option<RegionId>) -> u32 {
    match region {
        Some(region) => thread.begin_critical_region(region),
        None => thread.begin_critical(),
    }
}

/// Explicit critical exit. Returns the new depth.
pub fn end_critical(thread: &JavaThread) -> u32 {
    thread.end_critical()
}

/// An open critical region, closed on drop.
#[must_use = "the critical region closes as soon as the guard is dropped"]
#[derive(Debug)]
pub struct CriticalSection<'t> {
    thread: &'t JavaThread,
    depth: u32,
}

impl<'t> CriticalSection<'t> {
    pub fn enter(thread: &'t JavaThread) -> Self {
        let depth = begin_critical(thread, None);
        Self { thread, depth }
    }

    pub fn enter_region(thread: &'t JavaThread, region: RegionId) -> Self {
        let depth = begin_critical(thread, Some(region));
        Self { thread, depth }
    }

    /// Nesting depth this guard opened.
    pub fn depth(&self) -> u32 {
        self.depth
    }
}

impl Drop for CriticalSection<'_> {
    fn drop(&mut self) {
        end_critical(self.thread);
    }
}

/// Direct access to an array's storage while its region is held critical,
/// the equivalent of `GetPrimitiveArrayCritical`.
#[derive(Debug)]
pub struct CriticalArray<'t, 'a, T> {
    data: &'a mut [T],
    _section: CriticalSection<'t>,
}

impl<'t, 'a, T> CriticalArray<'t, 'a, T> {
    pub fn new(thread: &'t JavaThread, region: RegionId, data: &'a mut [T]) -> Self {
        Self {
            _section: CriticalSection::enter_region(thread, region),
            data,
        }
    }
}

impl<T> Deref for CriticalArray<'_, '_, T> {
    type Target = [T];

    fn deref(&self) -> &[T] {
        self.data
    }
}

impl<T> DerefMut for CriticalArray<'_, '_, T> {
    fn deref_mut(&mut self) -> &mut [T] {
        self.data
    }
}
