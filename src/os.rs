//! Thin OS glue.

use crate::signal::SignalSet;
use std::io;

/// Replace the calling OS thread's blocked signal set, returning the old one.
#[cfg(target_os = "linux")]
pub fn set_thread_sigmask(mask: SignalSet) -> io::Result<SignalSet> {
    // SAFETY: both sets are initialised by sigemptyset before use and only
    // live on this stack frame.
    unsafe {
        let mut set: libc::sigset_t = std::mem::zeroed();
        libc::sigemptyset(&mut set);
        for signo in mask.numbers() {
            // Signals reserved by the threading library are rejected; skip them.
            libc::sigaddset(&mut set, signo);
        }
        let mut old: libc::sigset_t = std::mem::zeroed();
        libc::sigemptyset(&mut old);
        let rc = libc::pthread_sigmask(libc::SIG_SETMASK, &set, &mut old);
        if rc != 0 {
            return Err(io::Error::from_raw_os_error(rc));
        }
        Ok(decode(&old))
    }
}

/// The calling OS thread's blocked signal set.
#[cfg(target_os = "linux")]
pub fn thread_sigmask() -> io::Result<SignalSet> {
    // SAFETY: a null new set only queries the mask.
    unsafe {
        let mut old: libc::sigset_t = std::mem::zeroed();
        libc::sigemptyset(&mut old);
        let rc = libc::pthread_sigmask(libc::SIG_SETMASK, std::ptr::null(), &mut old);
        if rc != 0 {
            return Err(io::Error::from_raw_os_error(rc));
        }
        Ok(decode(&old))
    }
}

#[cfg(target_os = "linux")]
fn decode(set: &libc::sigset_t) -> SignalSet {
    let mut mask = SignalSet::empty();
    for signo in 1..=crate::signal::Signal::MAX {
        // SAFETY: `set` is a valid, initialised sigset.
        if unsafe { libc::sigismember(set, signo) } == 1 {
            mask |= SignalSet::from_bits_retain(1u64 << (signo - 1));
        }
    }
    mask
}

#[cfg(not(target_os = "linux"))]
pub fn set_thread_sigmask(_mask: SignalSet) -> io::Result<SignalSet> {
    Ok(SignalSet::empty())
}

#[cfg(not(target_os = "linux"))]
pub fn thread_sigmask() -> io::Result<SignalSet> {
    Ok(SignalSet::empty())
}
