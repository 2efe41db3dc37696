// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! OS process helpers.
//!
//! Ownership claims and the consumer-slot janitor need to decide whether
//! the process behind a recorded pid still exists. `kill(pid, 0)` performs
//! the permission checks but sends no signal; `ESRCH` means the pid names
//! no live process.

/// Current OS process id.
#[must_use]
pub fn current_pid() -> u32 {
    // SAFETY: getpid never fails and has no side effects.
    unsafe { libc::getpid() as u32 }
}

/// Whether a process with the given OS pid is alive.
///
/// A pid of 0 is treated as "no owner" and reported dead. `EPERM` from the
/// probe means the process exists but belongs to another user; that counts
/// as alive.
#[must_use]
pub fn process_alive(pid: u32) -> bool {
    // Reject 0 and anything that would go negative as pid_t: negative
    // arguments to kill() address process groups, not processes.
    if pid == 0 || pid > i32::MAX as u32 {
        return false;
    }
    // SAFETY: kill with signal 0 performs error checking only; no signal
    // is delivered. pid is a positive pid_t, so no group addressing.
    let ret = unsafe { libc::kill(pid as libc::pid_t, 0) };
    if ret == 0 {
        return true;
    }
    std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_current_pid_nonzero() {
        assert_ne!(current_pid(), 0);
    }

    #[test]
    fn test_self_is_alive() {
        assert!(process_alive(current_pid()));
    }

    #[test]
    fn test_zero_pid_is_dead() {
        assert!(!process_alive(0));
    }

    #[test]
    fn test_bogus_pid_is_dead() {
        // Far above the default pid_max of 4 million
        assert!(!process_alive(i32::MAX as u32 - 1));
        // Would be negative as pid_t
        assert!(!process_alive(u32::MAX - 1));
    }
}
