// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Cross-process mutex and condition variable.
//!
//! Both primitives are a single 32-bit futex word and live inside
//! shared-memory segment headers. A zeroed word is a valid initial state
//! (unlocked / no signals), so freshly created segments need no placement
//! construction.
//!
//! # Futex words
//!
//! All blocking funnels through `SYS_futex` on the word itself, modelled
//! here as the [`Futex`] type. The op codes matter: Linux also offers
//! `FUTEX_WAIT_PRIVATE` / `FUTEX_WAKE_PRIVATE`, which skip the global
//! hash-bucket lookup but only match sleepers inside one process - a
//! wake through the private op would silently strand peers in other
//! processes. Every word below sits in an mmap'd segment shared across
//! processes, so only the non-private ops are usable here.
//!
//! # Mutex protocol
//!
//! The state word encodes: `0` unlocked, `1` locked, `2` locked with
//! (possible) waiters. Lock attempts CAS 0 -> 1; contended lockers park
//! on the word at 2. Unlock swaps to 0 and wakes one waiter only when
//! the word was 2, keeping the uncontended path syscall-free.
//!
//! # Condvar protocol
//!
//! A monotone sequence counter. Waiters snapshot the counter while
//! holding the mutex, release the mutex, then sleep until the counter
//! moves past the snapshot. Notifiers bump the counter and wake. A
//! notify between the unlock and the sleep makes the kernel refuse to
//! park (the word no longer matches), so no wake is ever lost. Spurious
//! wakeups are possible; callers must re-check their predicate in a
//! loop.
//!
//! Neither primitive is robust against a holder dying inside the
//! critical section; critical sections in this crate are a handful of
//! loads and stores with no I/O, which keeps that window minimal.

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

/// Sleep while the word holds the expected value (non-private form).
const FUTEX_WAIT: libc::c_int = 0;
/// Release up to n sleepers (non-private form).
const FUTEX_WAKE: libc::c_int = 1;

const UNLOCKED: u32 = 0;
const LOCKED: u32 = 1;
const CONTENDED: u32 = 2;

/// A 32-bit atomic that doubles as a kernel sleep queue.
///
/// Derefs to [`AtomicU32`] so lock and counter protocols operate on the
/// word directly; `sleep`/`wake` add the kernel side.
#[repr(transparent)]
pub(crate) struct Futex {
    word: AtomicU32,
}

impl Futex {
    pub(crate) const fn new(value: u32) -> Self {
        Self {
            word: AtomicU32::new(value),
        }
    }

    /// Park until the word moves away from `expected`, a wake arrives,
    /// or the timeout lapses.
    ///
    /// Returns immediately when the word already changed; callers treat
    /// every return as potentially spurious and re-check their
    /// predicate.
    pub(crate) fn sleep(&self, expected: u32, timeout: Option<Duration>) {
        let ts = timeout.map(|t| libc::timespec {
            tv_sec: t.as_secs() as libc::time_t,
            tv_nsec: t.subsec_nanos() as libc::c_long,
        });
        let ts_ptr = match &ts {
            Some(t) => t as *const libc::timespec,
            None => std::ptr::null(),
        };
        // SAFETY: the word and the optional timespec outlive the call
        // and FUTEX_WAIT only reads them. Non-private op per the module
        // doc so sleepers in other processes share this queue.
        unsafe {
            libc::syscall(
                libc::SYS_futex,
                self.word.as_ptr(),
                FUTEX_WAIT,
                expected,
                ts_ptr,
                std::ptr::null::<u32>(),
                0,
            );
        }
    }

    /// Release up to `count` parked threads, in any process.
    pub(crate) fn wake(&self, count: i32) {
        // SAFETY: FUTEX_WAKE takes only the word address; the trailing
        // arguments are ignored for this op.
        unsafe {
            libc::syscall(
                libc::SYS_futex,
                self.word.as_ptr(),
                FUTEX_WAKE,
                count,
                std::ptr::null::<libc::timespec>(),
                std::ptr::null::<u32>(),
                0,
            );
        }
    }
}

impl std::ops::Deref for Futex {
    type Target = AtomicU32;

    fn deref(&self) -> &AtomicU32 {
        &self.word
    }
}

/// Futex-based mutex shared between processes.
#[repr(C)]
pub struct ShmMutex {
    state: Futex,
}

impl ShmMutex {
    /// New unlocked mutex.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            state: Futex::new(UNLOCKED),
        }
    }

    /// Acquire the mutex, blocking if necessary.
    pub fn lock(&self) -> ShmMutexGuard<'_> {
        if self
            .state
            .compare_exchange(UNLOCKED, LOCKED, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            self.lock_contended();
        }
        ShmMutexGuard { mutex: self }
    }

    fn lock_contended(&self) {
        // Once we park, leave the word at CONTENDED so unlock knows to wake.
        while self.state.swap(CONTENDED, Ordering::Acquire) != UNLOCKED {
            self.state.sleep(CONTENDED, None);
        }
    }

    /// Try to acquire without blocking.
    pub fn try_lock(&self) -> Option<ShmMutexGuard<'_>> {
        self.state
            .compare_exchange(UNLOCKED, LOCKED, Ordering::Acquire, Ordering::Relaxed)
            .ok()
            .map(|_| ShmMutexGuard { mutex: self })
    }

    fn unlock(&self) {
        if self.state.swap(UNLOCKED, Ordering::Release) == CONTENDED {
            self.state.wake(1);
        }
    }
}

impl Default for ShmMutex {
    fn default() -> Self {
        Self::new()
    }
}

/// RAII guard for [`ShmMutex`]. Unlocks on drop.
pub struct ShmMutexGuard<'a> {
    mutex: &'a ShmMutex,
}

impl Drop for ShmMutexGuard<'_> {
    fn drop(&mut self) {
        self.mutex.unlock();
    }
}

/// Futex-based condition variable shared between processes.
#[repr(C)]
pub struct ShmCondvar {
    seq: Futex,
}

impl ShmCondvar {
    /// New condition variable.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            seq: Futex::new(0),
        }
    }

    /// Release the guard, wait for a notification, re-acquire.
    ///
    /// Subject to spurious wakeups; call in a predicate loop.
    pub fn wait<'a>(&self, guard: ShmMutexGuard<'a>) -> ShmMutexGuard<'a> {
        let mutex = guard.mutex;
        let snapshot = self.seq.load(Ordering::Acquire);
        drop(guard);
        self.seq.sleep(snapshot, None);
        mutex.lock()
    }

    /// Like [`wait`](Self::wait) with an upper bound on the sleep.
    ///
    /// Returns the re-acquired guard and whether the full timeout elapsed
    /// without a notification. The flag is advisory; callers re-check
    /// their predicate and their own deadline.
    pub fn wait_timeout<'a>(
        &self,
        guard: ShmMutexGuard<'a>,
        timeout: Duration,
    ) -> (ShmMutexGuard<'a>, bool) {
        let mutex = guard.mutex;
        let snapshot = self.seq.load(Ordering::Acquire);
        drop(guard);
        let start = Instant::now();
        self.seq.sleep(snapshot, Some(timeout));
        let timed_out = start.elapsed() >= timeout;
        (mutex.lock(), timed_out)
    }

    /// Wake every waiter.
    pub fn notify_all(&self) {
        self.seq.fetch_add(1, Ordering::Release);
        self.seq.wake(i32::MAX);
    }

    /// Wake one waiter.
    pub fn notify_one(&self) {
        self.seq.fetch_add(1, Ordering::Release);
        self.seq.wake(1);
    }
}

impl Default for ShmCondvar {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_sleep_refuses_stale_expected() {
        // The kernel compares the word against `expected` before
        // parking; a mismatch returns immediately instead of sleeping.
        let futex = Futex::new(7);
        let start = Instant::now();
        futex.sleep(0, Some(Duration::from_millis(200)));
        assert!(start.elapsed() < Duration::from_millis(100));
    }

    #[test]
    fn test_sleep_honours_timeout() {
        let futex = Futex::new(0);
        let start = Instant::now();
        futex.sleep(0, Some(Duration::from_millis(50)));
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(40));
        assert!(elapsed < Duration::from_millis(500));
    }

    #[test]
    fn test_wake_without_sleepers_is_noop() {
        Futex::new(0).wake(i32::MAX);
    }

    #[test]
    fn test_wake_crosses_threads() {
        let futex = Arc::new(Futex::new(0));
        let peer = Arc::clone(&futex);

        let sleeper = thread::spawn(move || {
            while peer.load(Ordering::Acquire) == 0 {
                peer.sleep(0, Some(Duration::from_secs(1)));
            }
            peer.load(Ordering::Acquire)
        });

        thread::sleep(Duration::from_millis(10));
        futex.store(9, Ordering::Release);
        futex.wake(i32::MAX);

        assert_eq!(sleeper.join().expect("sleeper thread panicked"), 9);
    }

    #[test]
    fn test_zeroed_is_unlocked() {
        // Segments start zeroed; a zeroed mutex must be immediately usable
        let mutex = ShmMutex::new();
        assert_eq!(mutex.state.load(Ordering::Relaxed), UNLOCKED);
        let guard = mutex.lock();
        drop(guard);
        assert_eq!(mutex.state.load(Ordering::Relaxed), UNLOCKED);
    }

    #[test]
    fn test_try_lock_while_held() {
        let mutex = ShmMutex::new();
        let guard = mutex.lock();
        assert!(mutex.try_lock().is_none());
        drop(guard);
        assert!(mutex.try_lock().is_some());
    }

    #[test]
    fn test_mutex_contention() {
        let mutex = Arc::new(ShmMutex::new());
        let counter = Arc::new(AtomicU32::new(0));
        let mut handles = Vec::new();

        for _ in 0..4 {
            let mutex = Arc::clone(&mutex);
            let counter = Arc::clone(&counter);
            handles.push(thread::spawn(move || {
                for _ in 0..1000 {
                    let _guard = mutex.lock();
                    // Non-atomic read-modify-write made safe by the lock
                    let v = counter.load(Ordering::Relaxed);
                    counter.store(v + 1, Ordering::Relaxed);
                }
            }));
        }
        for h in handles {
            h.join().expect("locker thread panicked");
        }
        assert_eq!(counter.load(Ordering::Relaxed), 4000);
    }

    #[test]
    fn test_condvar_notify_all() {
        let mutex = Arc::new(ShmMutex::new());
        let condvar = Arc::new(ShmCondvar::new());
        let flag = Arc::new(AtomicU32::new(0));

        let mut handles = Vec::new();
        for _ in 0..3 {
            let mutex = Arc::clone(&mutex);
            let condvar = Arc::clone(&condvar);
            let flag = Arc::clone(&flag);
            handles.push(thread::spawn(move || {
                let mut guard = mutex.lock();
                while flag.load(Ordering::Acquire) == 0 {
                    guard = condvar.wait(guard);
                }
                drop(guard);
            }));
        }

        thread::sleep(Duration::from_millis(20));
        {
            let _guard = mutex.lock();
            flag.store(1, Ordering::Release);
        }
        condvar.notify_all();

        for h in handles {
            h.join().expect("waiter thread panicked");
        }
    }

    #[test]
    fn test_condvar_wait_timeout_expires() {
        let mutex = ShmMutex::new();
        let condvar = ShmCondvar::new();

        let guard = mutex.lock();
        let start = Instant::now();
        let (guard, timed_out) = condvar.wait_timeout(guard, Duration::from_millis(50));
        drop(guard);

        assert!(timed_out);
        assert!(start.elapsed() >= Duration::from_millis(40));
    }
}
