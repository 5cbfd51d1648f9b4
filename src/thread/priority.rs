//! Managed thread priorities and their OS mapping.

use crate::error::{VmError, VmResult};
use std::fmt;

/// Linux-style mapping from managed priority to a nice value. Index 0 is
/// unused; managed priorities run from 1 to 10.
const JAVA_TO_OS_PRIORITY: [i32; 11] = [19, 4, 3, 2, 1, 0, -1, -2, -3, -4, -5];

/// A managed thread priority in `1..=10`.
///
/// # Examples
///
/// ```
/// use vmsync::thread::Priority;
///
/// let p = Priority::new(7).unwrap();
/// assert_eq!(p.get(), 7);
/// assert_eq!(p.os_priority(), -2);
/// assert!(Priority::new(0).is_err());
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Priority(u8);

impl Priority {
    pub const MIN: Priority = Priority(1);
    pub const NORM: Priority = Priority(5);
    pub const MAX: Priority = Priority(10);

    pub fn new(value: i32) -> VmResult<Self> {
        if (Self::MIN.0 as i32..=Self::MAX.0 as i32).contains(&value) {
            Ok(Priority(value as u8))
        } else {
            Err(VmError::InvalidPriority(value))
        }
    }

    pub fn get(self) -> i32 {
        self.0 as i32
    }

    /// OS priority reported next to the managed one by thread dumps.
    pub fn os_priority(self) -> i32 {
        JAVA_TO_OS_PRIORITY[self.0 as usize]
    }

    pub(crate) fn from_raw(raw: u8) -> Self {
        debug_assert!((Self::MIN.0..=Self::MAX.0).contains(&raw));
        Priority(raw)
    }

    pub(crate) fn raw(self) -> u8 {
        self.0
    }
}

impl Default for Priority {
    fn default() -> Self {
        Priority::NORM
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl TryFrom<i32> for Priority {
    type Error = VmError;

    fn try_from(value: i32) -> VmResult<Self> {
        Priority::new(value)
    }
}
