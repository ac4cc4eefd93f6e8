//! POSIX shared memory segment management.
//!
//! Safe wrappers around `shm_open`, `ftruncate`, and `mmap` for creating and
//! mapping the named regions the worker/DCP handshake protocol uses.
//!
//! # Segment lifecycle
//!
//! 1. Creator maps the segment with [`ShmSegment::create`].
//! 2. Other processes attach with [`ShmSegment::open`].
//! 3. The mapping is unmapped automatically on drop.
//! 4. The creator is responsible for calling [`ShmSegment::unlink`].
//!
//! # Naming convention
//!
//! Segment names must start with `/` and contain no other `/`.
//! This crate's convention is `/DatabaseCommitProcessSHM<worker_pid>` for a
//! worker's data region and `/DatabaseCommitProcessSHM<worker_pid>_handshake`
//! for its transient handshake region.

use crate::error::ShmError;
use std::ffi::CString;
use std::io;
use std::ptr;
use tracing::debug;

/// POSIX shared memory segment wrapper.
///
/// Automatically unmaps the memory region on drop. Does NOT automatically
/// unlink the segment; that is the creator's responsibility.
pub struct ShmSegment {
    ptr: *mut u8,
    size: usize,
    name: String,
}

// SAFETY: the mapped region is shared across processes; all in-process
// access to it goes through atomic operations (see `slot.rs`).
unsafe impl Send for ShmSegment {}
unsafe impl Sync for ShmSegment {}

impl ShmSegment {
    /// Create a new shared memory segment, replacing any existing segment of
    /// the same name.
    pub fn create(name: &str, size: usize) -> Result<Self, ShmError> {
        Self::validate_name(name)?;
        let c_name = CString::new(name).map_err(|_| ShmError::InvalidName(name.to_string()))?;

        // SAFETY: c_name is a valid NUL-terminated string; shm_unlink tolerates
        // a missing segment; O_CREAT|O_RDWR|O_EXCL either creates fresh shared
        // memory or fails, both handled below.
        let fd = unsafe {
            libc::shm_unlink(c_name.as_ptr());
            libc::shm_open(c_name.as_ptr(), libc::O_CREAT | libc::O_RDWR | libc::O_EXCL, 0o600)
        };
        if fd < 0 {
            return Err(ShmError::Open {
                name: name.to_string(),
                source: io::Error::last_os_error(),
            });
        }

        // SAFETY: fd is a valid descriptor from the shm_open above.
        let ret = unsafe { libc::ftruncate(fd, size as libc::off_t) };
        if ret < 0 {
            let source = io::Error::last_os_error();
            unsafe { libc::close(fd) };
            return Err(ShmError::Truncate {
                name: name.to_string(),
                source,
            });
        }

        // SAFETY: fd is sized and valid; mapping the whole region read/write
        // and shared is exactly the POSIX shm contract.
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
        unsafe { libc::close(fd) };

        if ptr == libc::MAP_FAILED {
            return Err(ShmError::Map {
                name: name.to_string(),
                source: io::Error::last_os_error(),
            });
        }

        // SAFETY: ptr is a freshly mapped region of `size` bytes with write
        // permission; no other reference to it exists yet.
        unsafe {
            ptr::write_bytes(ptr as *mut u8, 0, size);
        }

        Ok(Self {
            ptr: ptr as *mut u8,
            size,
            name: name.to_string(),
        })
    }

    /// Attach to an existing shared memory segment.
    pub fn open(name: &str, size: usize) -> Result<Self, ShmError> {
        Self::validate_name(name)?;
        let c_name = CString::new(name).map_err(|_| ShmError::InvalidName(name.to_string()))?;

        // SAFETY: c_name is valid; O_RDWR attaches to an existing segment.
        let fd = unsafe { libc::shm_open(c_name.as_ptr(), libc::O_RDWR, 0) };
        if fd < 0 {
            let source = io::Error::last_os_error();
            if source.kind() == io::ErrorKind::NotFound {
                return Err(ShmError::NotFound(name.to_string()));
            }
            return Err(ShmError::Open {
                name: name.to_string(),
                source,
            });
        }

        // SAFETY: fd refers to an existing segment at least `size` bytes long
        // (caller guarantees this); mapping shared/read-write matches the
        // creator's mapping.
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
        unsafe { libc::close(fd) };

        if ptr == libc::MAP_FAILED {
            return Err(ShmError::Map {
                name: name.to_string(),
                source: io::Error::last_os_error(),
            });
        }

        Ok(Self {
            ptr: ptr as *mut u8,
            size,
            name: name.to_string(),
        })
    }

    fn validate_name(name: &str) -> Result<(), ShmError> {
        if !name.starts_with('/') {
            return Err(ShmError::InvalidName(format!(
                "segment name must start with '/': {name}"
            )));
        }
        if name.len() > 1 && name[1..].contains('/') {
            return Err(ShmError::InvalidName(format!(
                "segment name cannot contain '/' after the prefix: {name}"
            )));
        }
        if name.len() > 255 {
            return Err(ShmError::InvalidName(format!(
                "segment name too long (max 255): {name}"
            )));
        }
        Ok(())
    }

    /// Remove a segment by name. Idempotent: a missing segment is not an
    /// error.
    pub fn unlink(name: &str) -> Result<(), ShmError> {
        let c_name = CString::new(name).map_err(|_| ShmError::InvalidName(name.to_string()))?;

        // SAFETY: c_name is valid; shm_unlink only touches the shm namespace.
        let ret = unsafe { libc::shm_unlink(c_name.as_ptr()) };
        if ret < 0 {
            let source = io::Error::last_os_error();
            if source.kind() != io::ErrorKind::NotFound {
                return Err(ShmError::Open {
                    name: name.to_string(),
                    source,
                });
            }
        }
        Ok(())
    }

    #[inline]
    #[must_use]
    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr
    }

    #[inline]
    #[must_use]
    pub fn size(&self) -> usize {
        self.size
    }

    #[inline]
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn exists(name: &str) -> bool {
        let Ok(c_name) = CString::new(name) else {
            return false;
        };
        // SAFETY: c_name is valid; O_RDONLY open is used purely as an
        // existence probe and the fd is closed immediately.
        let fd = unsafe { libc::shm_open(c_name.as_ptr(), libc::O_RDONLY, 0) };
        if fd >= 0 {
            unsafe { libc::close(fd) };
            true
        } else {
            false
        }
    }
}

impl Drop for ShmSegment {
    fn drop(&mut self) {
        // SAFETY: self.ptr/self.size come from the successful mmap in
        // create()/open() and are unmapped exactly once here.
        unsafe {
            libc::munmap(self.ptr as *mut libc::c_void, self.size);
        }
        // The creator, not every holder, is responsible for unlink().
    }
}

/// Remove any `/DatabaseCommitProcessSHM*` segments left behind by a
/// previous, abruptly-terminated run. Called by the supervisor at startup.
pub fn cleanup_stale_segments() -> usize {
    let mut cleaned = 0;
    let shm_dir = std::path::Path::new("/dev/shm");
    let Ok(entries) = std::fs::read_dir(shm_dir) else {
        return 0;
    };

    for entry in entries.flatten() {
        let file_name = entry.file_name();
        let Some(name) = file_name.to_str() else {
            continue;
        };
        if !name.starts_with("DatabaseCommitProcessSHM") {
            continue;
        }
        let segment_name = format!("/{name}");
        if ShmSegment::unlink(&segment_name).is_ok() {
            debug!(segment = %segment_name, "cleaned up stale segment");
            cleaned += 1;
        }
    }

    cleaned
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
        format!("/DatabaseCommitProcessSHMtest{ts}")
    }

    #[test]
    fn validate_name_rules() {
        assert!(ShmSegment::validate_name("/foo").is_ok());
        assert!(ShmSegment::validate_name("foo").is_err());
        assert!(ShmSegment::validate_name("/foo/bar").is_err());
    }

    #[test]
    fn create_and_open_share_memory() {
        let name = unique_name();
        let size = 4096;

        let seg1 = ShmSegment::create(&name, size).expect("create");
        assert_eq!(seg1.size(), size);

        // SAFETY: seg1 was just created with size 4096; offsets 0/1 valid.
        unsafe {
            *seg1.as_ptr() = 0x42;
            *seg1.as_ptr().add(1) = 0x43;
        }

        let seg2 = ShmSegment::open(&name, size).expect("open");
        // SAFETY: seg2 maps the same segment seg1 wrote into above.
        unsafe {
            assert_eq!(*seg2.as_ptr(), 0x42);
            assert_eq!(*seg2.as_ptr().add(1), 0x43);
        }

        drop(seg1);
        drop(seg2);
        ShmSegment::unlink(&name).ok();
    }

    #[test]
    fn open_nonexistent_is_not_found() {
        let result = ShmSegment::open("/DatabaseCommitProcessSHMnonexistent", 4096);
        assert!(matches!(result, Err(ShmError::NotFound(_))));
    }

    #[test]
    fn exists_reflects_lifecycle() {
        let name = unique_name();
        assert!(!ShmSegment::exists(&name));
        let _seg = ShmSegment::create(&name, 4096).expect("create");
        assert!(ShmSegment::exists(&name));
        ShmSegment::unlink(&name).ok();
    }

    #[test]
    fn unlink_is_idempotent() {
        let name = unique_name();
        let _seg = ShmSegment::create(&name, 4096).expect("create");
        assert!(ShmSegment::unlink(&name).is_ok());
        assert!(ShmSegment::unlink(&name).is_ok());
    }
}
