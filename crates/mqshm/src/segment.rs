// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! POSIX shared memory segment management.
//!
//! Safe wrappers around `shm_open`, `ftruncate`, and `mmap` for creating
//! and mapping named segments.
//!
//! # Segment Lifecycle
//!
//! 1. The creator calls [`ShmSegment::create`]; the region starts zeroed.
//! 2. The creator writes its header, then publishes an `initialized` flag
//!    with release ordering.
//! 3. Openers call [`ShmSegment::open`] and spin on the flag with
//!    [`wait_initialized`] before trusting any header field.
//! 4. A segment is unmapped when the `ShmSegment` drops; the name is
//!    removed only by an explicit [`ShmSegment::unlink`], which does not
//!    invalidate live mappings.
//!
//! # Naming Convention
//!
//! Caller-facing names are printable ASCII, at most 63 characters, with no
//! `/`. The leading `/` required by POSIX is added internally.

use crate::config::{INIT_WAIT_TIMEOUT, MAX_SHM_NAME_LEN};
use crate::error::{Result, ShmError};
use std::ffi::CString;
use std::io;
use std::ptr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

/// POSIX shared memory segment wrapper.
///
/// Automatically unmaps the region on drop. Does NOT automatically unlink
/// the name (explicit lifecycle decision by the caller).
pub struct ShmSegment {
    /// Pointer to the mapped region
    ptr: *mut u8,
    /// Size of the mapping
    size: usize,
    /// Segment name without the leading slash (for unlink and logging)
    name: String,
}

// SAFETY: the pointer targets shared memory designed for concurrent
// access from multiple processes; all mutation inside goes through
// atomics or cross-process locks owned by the layered structures.
unsafe impl Send for ShmSegment {}
unsafe impl Sync for ShmSegment {}

fn posix_name(name: &str) -> Result<CString> {
    validate_name(name)?;
    CString::new(format!("/{name}")).map_err(|_| ShmError::InvalidName(name.to_string()))
}

/// Validate a caller-facing segment name.
pub fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() || name.len() > MAX_SHM_NAME_LEN {
        return Err(ShmError::InvalidName(format!(
            "segment name must be 1..={MAX_SHM_NAME_LEN} chars: {name:?}"
        )));
    }
    if !name
        .bytes()
        .all(|b| b.is_ascii_graphic() && b != b'/')
    {
        return Err(ShmError::InvalidName(format!(
            "segment name must be printable ASCII without '/': {name:?}"
        )));
    }
    Ok(())
}

impl ShmSegment {
    /// Create a new shared memory segment of `size` bytes, zero-filled.
    ///
    /// # Errors
    ///
    /// `SegmentExists` when the name is taken; the caller decides whether
    /// stale-segment takeover applies (see the port queue ownership
    /// claim). Other failures map to `SegmentCreate` / `Mmap`.
    pub fn create(name: &str, size: usize) -> Result<Self> {
        let c_name = posix_name(name)?;

        // SAFETY: c_name is a valid null-terminated CString. O_EXCL makes
        // a name collision an error instead of silently reusing a peer's
        // segment. Mode 0o600: owner read/write only.
        let fd = unsafe {
            libc::shm_open(
                c_name.as_ptr(),
                libc::O_CREAT | libc::O_RDWR | libc::O_EXCL,
                0o600,
            )
        };

        if fd < 0 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EEXIST) {
                return Err(ShmError::SegmentExists(name.to_string()));
            }
            return Err(ShmError::SegmentCreate(err));
        }

        // SAFETY: fd is valid from the successful shm_open above; the
        // size fits off_t for any realistic segment.
        let ret = unsafe { libc::ftruncate(fd, size as libc::off_t) };
        if ret < 0 {
            let err = io::Error::last_os_error();
            // SAFETY: fd is valid and not used after this error path.
            unsafe { libc::close(fd) };
            return Err(ShmError::SegmentCreate(err));
        }

        let ptr = Self::map(fd, size)?;

        log::debug!("[SHM] created segment {name} ({size} bytes)");

        Ok(Self {
            ptr,
            size,
            name: name.to_string(),
        })
    }

    /// Open an existing shared memory segment, mapping its full size.
    ///
    /// # Errors
    ///
    /// `SegmentMissing` if the name does not exist; `SegmentOpen` / `Mmap`
    /// on OS failures.
    pub fn open(name: &str) -> Result<Self> {
        let c_name = posix_name(name)?;

        // SAFETY: valid CString; O_RDWR opens the existing segment, mode
        // is ignored without O_CREAT.
        let fd = unsafe { libc::shm_open(c_name.as_ptr(), libc::O_RDWR, 0) };

        if fd < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::NotFound {
                return Err(ShmError::SegmentMissing(name.to_string()));
            }
            return Err(ShmError::SegmentOpen(err));
        }

        // The mapping size is whatever the creator truncated to.
        // SAFETY: fd is valid; stat is a plain out-parameter.
        let size = unsafe {
            let mut stat: libc::stat = std::mem::zeroed();
            if libc::fstat(fd, &mut stat) < 0 {
                let err = io::Error::last_os_error();
                libc::close(fd);
                return Err(ShmError::SegmentOpen(err));
            }
            stat.st_size as usize
        };

        let ptr = Self::map(fd, size)?;

        Ok(Self {
            ptr,
            size,
            name: name.to_string(),
        })
    }

    fn map(fd: libc::c_int, size: usize) -> Result<*mut u8> {
        // SAFETY: null hint lets the kernel pick the address; fd is valid;
        // MAP_SHARED makes the mapping visible to other processes. The fd
        // is closed right after - the mapping keeps its own reference.
        let ptr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd,
                0,
            )
        };

        // SAFETY: fd is valid; closing after mmap (success or failure) is
        // always safe.
        unsafe { libc::close(fd) };

        if ptr == libc::MAP_FAILED {
            return Err(ShmError::Mmap(io::Error::last_os_error()));
        }
        Ok(ptr as *mut u8)
    }

    /// Unlink (delete) a segment name.
    ///
    /// Idempotent: a missing name is not an error. Live mappings stay
    /// valid; the kernel frees the memory once the last one is gone.
    pub fn unlink(name: &str) -> Result<()> {
        let c_name = posix_name(name)?;

        // SAFETY: valid CString; shm_unlink only touches the namespace.
        let ret = unsafe { libc::shm_unlink(c_name.as_ptr()) };

        if ret < 0 {
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::NotFound {
                return Err(ShmError::SegmentOpen(err));
            }
        } else {
            log::debug!("[SHM] unlinked segment {name}");
        }

        Ok(())
    }

    /// Whether a segment with the given name exists.
    #[must_use]
    pub fn exists(name: &str) -> bool {
        let Ok(c_name) = posix_name(name) else {
            return false;
        };

        // SAFETY: valid CString; O_RDONLY probe, mode ignored.
        let fd = unsafe { libc::shm_open(c_name.as_ptr(), libc::O_RDONLY, 0) };

        if fd >= 0 {
            // SAFETY: fd is valid and unused afterwards.
            unsafe { libc::close(fd) };
            true
        } else {
            false
        }
    }

    /// Raw pointer to the mapped memory.
    #[inline]
    #[must_use]
    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr
    }

    /// Size of the mapping in bytes.
    #[inline]
    #[must_use]
    pub fn size(&self) -> usize {
        self.size
    }

    /// Segment name (without the leading slash).
    #[inline]
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Drop for ShmSegment {
    fn drop(&mut self) {
        // SAFETY: ptr/size come from our own successful mmap and Drop runs
        // once. The name is intentionally NOT unlinked here.
        unsafe {
            libc::munmap(self.ptr as *mut libc::c_void, self.size);
        }
    }
}

/// Spin until a creator publishes its `initialized` flag.
///
/// Bounded wait; a flag that never appears means a crashed or incompatible
/// creator and surfaces as `SegmentIncompatible`.
pub fn wait_initialized(flag: &AtomicBool, name: &str) -> Result<()> {
    wait_initialized_for(flag, name, INIT_WAIT_TIMEOUT)
}

/// [`wait_initialized`] with an explicit bound.
pub fn wait_initialized_for(flag: &AtomicBool, name: &str, timeout: Duration) -> Result<()> {
    let deadline = Instant::now() + timeout;
    let mut spins = 0u32;
    while !flag.load(Ordering::Acquire) {
        if Instant::now() >= deadline {
            return Err(ShmError::SegmentIncompatible(format!(
                "{name}: initialized flag never published"
            )));
        }
        if spins < 1000 {
            spins += 1;
            std::hint::spin_loop();
        } else {
            std::thread::sleep(Duration::from_millis(1));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unique_name() -> String {
        use std::time::{SystemTime, UNIX_EPOCH};
        let ts = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        format!("mqshm_test_seg_{ts}")
    }

    #[test]
    fn test_validate_name() {
        assert!(validate_name("mqshm_pool_small").is_ok());
        assert!(validate_name("").is_err());
        assert!(validate_name("with/slash").is_err());
        assert!(validate_name("with space").is_err());
        assert!(validate_name(&"x".repeat(64)).is_err());
        assert!(validate_name(&"x".repeat(63)).is_ok());
    }

    #[test]
    fn test_create_starts_zeroed_and_open_sees_writes() {
        let name = unique_name();
        let seg1 = ShmSegment::create(&name, 4096).expect("create");
        assert_eq!(seg1.size(), 4096);

        // SAFETY: the segment is 4096 bytes; offsets 0..2 are in bounds.
        unsafe {
            assert_eq!(*seg1.as_ptr(), 0);
            *seg1.as_ptr() = 0x42;
            *seg1.as_ptr().add(1) = 0x43;
        }

        let seg2 = ShmSegment::open(&name).expect("open");
        assert_eq!(seg2.size(), 4096);
        // SAFETY: same segment, same bounds.
        unsafe {
            assert_eq!(*seg2.as_ptr(), 0x42);
            assert_eq!(*seg2.as_ptr().add(1), 0x43);
        }

        drop(seg1);
        drop(seg2);
        ShmSegment::unlink(&name).ok();
    }

    #[test]
    fn test_create_collision() {
        let name = unique_name();
        let _seg = ShmSegment::create(&name, 4096).expect("create");
        assert!(matches!(
            ShmSegment::create(&name, 4096),
            Err(ShmError::SegmentExists(_))
        ));
        ShmSegment::unlink(&name).ok();
    }

    #[test]
    fn test_open_nonexistent() {
        assert!(matches!(
            ShmSegment::open("mqshm_test_nonexistent_12345"),
            Err(ShmError::SegmentMissing(_))
        ));
    }

    #[test]
    fn test_exists() {
        let name = unique_name();
        assert!(!ShmSegment::exists(&name));
        let _seg = ShmSegment::create(&name, 4096).expect("create");
        assert!(ShmSegment::exists(&name));
        ShmSegment::unlink(&name).ok();
    }

    #[test]
    fn test_unlink_idempotent() {
        let name = unique_name();
        let _seg = ShmSegment::create(&name, 4096).expect("create");
        assert!(ShmSegment::unlink(&name).is_ok());
        assert!(ShmSegment::unlink(&name).is_ok());
    }

    #[test]
    fn test_wait_initialized() {
        let flag = AtomicBool::new(true);
        assert!(wait_initialized(&flag, "test").is_ok());

        let unset = AtomicBool::new(false);
        let result = wait_initialized_for(&unset, "test", Duration::from_millis(20));
        assert!(matches!(result, Err(ShmError::SegmentIncompatible(_))));
    }
}
