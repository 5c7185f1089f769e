// Copyright 2026-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::error::{Error, Result};
use nix::errno::Errno;
use nix::fcntl::OFlag;
use nix::sys::mman::{mmap, munmap, shm_open, shm_unlink, MapFlags, ProtFlags};
use nix::sys::stat::{fstat, Mode};
use nix::unistd::ftruncate;
use std::ffi::{CStr, CString};
use std::io;
use std::num::NonZeroUsize;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::ptr;
use std::time::{Duration, Instant};

/// How long an opener waits for the creator to finish sizing a fresh
/// segment before giving up.
const SIZE_SETTLE_TIMEOUT: Duration = Duration::from_secs(2);

fn page_aligned_size(size: usize) -> usize {
    let page_size = page_size::get();
    // round up to nearest page
    ((size - 1) & !(page_size - 1)) + page_size
}

/// A named POSIX shared memory segment mapped into this process.
///
/// The name is global: every process that computes the same name reaches the
/// same bytes. Access goes through the copy helpers rather than slices; all
/// cross-process consistency comes from the named mutexes layered above, the
/// mapping itself hands out raw bytes only.
pub struct NamedMapping {
    ptr: *mut u8,
    len: usize,
    // Kept open so the segment cannot be reused under us between operations.
    _fd: OwnedFd,
    name: CString,
    created_new: bool,
}

unsafe impl Send for NamedMapping {}
unsafe impl Sync for NamedMapping {}

impl NamedMapping {
    /// Opens the segment `name`, creating it with `len` bytes (rounded up to
    /// a page) if it does not exist yet. Reports whether this call created
    /// it.
    ///
    /// Creation uses an exclusive-create first attempt so exactly one of any
    /// number of racing processes observes `created_new`; losers fall back to
    /// a plain open and wait for the winner to finish sizing the segment.
    pub fn open_or_create(name: &CStr, len: usize) -> Result<NamedMapping> {
        let len = page_aligned_size(len);
        loop {
            let mode = Mode::S_IWUSR
                | Mode::S_IRUSR
                | Mode::S_IRGRP
                | Mode::S_IWGRP
                | Mode::S_IROTH
                | Mode::S_IWOTH;
            match shm_open(name, OFlag::O_CREAT | OFlag::O_EXCL | OFlag::O_RDWR, mode) {
                Ok(raw) => {
                    let fd = unsafe { OwnedFd::from_raw_fd(raw) };
                    ftruncate(fd.as_raw_fd(), len as libc::off_t)?;
                    return Self::map(fd, name, len, true);
                }
                Err(Errno::EEXIST) => match shm_open(name, OFlag::O_RDWR, Mode::empty()) {
                    Ok(raw) => {
                        let fd = unsafe { OwnedFd::from_raw_fd(raw) };
                        Self::wait_for_size(&fd, len)?;
                        return Self::map(fd, name, len, false);
                    }
                    // The segment was unlinked between the two attempts.
                    Err(Errno::ENOENT) => continue,
                    Err(err) => return Err(err.into()),
                },
                Err(err) => return Err(err.into()),
            }
        }
    }

    /// A freshly created segment may still have length zero while its
    /// creator is between `shm_open` and `ftruncate`.
    fn wait_for_size(fd: &OwnedFd, len: usize) -> Result<()> {
        let start = Instant::now();
        loop {
            if fstat(fd.as_raw_fd())?.st_size as usize >= len {
                return Ok(());
            }
            if start.elapsed() > SIZE_SETTLE_TIMEOUT {
                return Err(Error::Io(io::Error::new(
                    io::ErrorKind::TimedOut,
                    "shared segment never reached its advertised size",
                )));
            }
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    fn map(fd: OwnedFd, name: &CStr, len: usize, created_new: bool) -> Result<NamedMapping> {
        // len was rounded up to at least one page.
        let length = NonZeroUsize::new(len).unwrap();
        let ptr = unsafe {
            mmap(
                None,
                length,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_SHARED,
                fd.as_raw_fd(),
                0,
            )?
        };
        Ok(NamedMapping {
            ptr: ptr as *mut u8,
            len,
            _fd: fd,
            name: name.to_owned(),
            created_new,
        })
    }

    pub fn created_new(&self) -> bool {
        self.created_new
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn name(&self) -> &CStr {
        &self.name
    }

    /// Removes the global name. Existing mappings stay valid; the segment is
    /// reclaimed once the last process unmaps it.
    pub fn unlink(&self) {
        if let Err(err) = shm_unlink(self.name.as_c_str()) {
            if err != Errno::ENOENT {
                tracing::warn!(name = ?self.name, %err, "failed to unlink shared segment");
            }
        }
    }

    /// Base pointer for in-place structures (mutexes, event headers) placed
    /// at offset zero by the primitives built on top of this mapping.
    pub(crate) fn base_ptr(&self) -> *mut u8 {
        self.ptr
    }

    pub fn read_bytes(&self, offset: usize, buf: &mut [u8]) {
        assert!(offset + buf.len() <= self.len);
        unsafe { ptr::copy_nonoverlapping(self.ptr.add(offset), buf.as_mut_ptr(), buf.len()) };
    }

    pub fn write_bytes(&self, offset: usize, bytes: &[u8]) {
        assert!(offset + bytes.len() <= self.len);
        unsafe { ptr::copy_nonoverlapping(bytes.as_ptr(), self.ptr.add(offset), bytes.len()) };
    }

    pub fn fill_bytes(&self, offset: usize, len: usize, value: u8) {
        assert!(offset + len <= self.len);
        unsafe { ptr::write_bytes(self.ptr.add(offset), value, len) };
    }

    pub fn read_i32(&self, offset: usize) -> i32 {
        let mut buf = [0u8; 4];
        self.read_bytes(offset, &mut buf);
        i32::from_le_bytes(buf)
    }

    pub fn write_i32(&self, offset: usize, value: i32) {
        self.write_bytes(offset, &value.to_le_bytes());
    }
}

impl Drop for NamedMapping {
    fn drop(&mut self) {
        unsafe {
            _ = munmap(self.ptr as *mut libc::c_void, self.len);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ffi::CString;

    fn unique_name(tag: &str) -> CString {
        use std::sync::atomic::{AtomicU32, Ordering};
        static SEQ: AtomicU32 = AtomicU32::new(0);
        let seq = SEQ.fetch_add(1, Ordering::Relaxed);
        CString::new(format!("/shmbus-test-map-{tag}-{}-{seq}", std::process::id())).unwrap()
    }

    #[test]
    fn create_then_open_shares_bytes() {
        let name = unique_name("share");
        let first = NamedMapping::open_or_create(&name, 64).unwrap();
        assert!(first.created_new());
        first.write_bytes(3, &[7, 8, 9]);

        let second = NamedMapping::open_or_create(&name, 64).unwrap();
        assert!(!second.created_new());
        let mut buf = [0u8; 3];
        second.read_bytes(3, &mut buf);
        assert_eq!(buf, [7, 8, 9]);
        first.unlink();
    }

    #[test]
    fn unlinked_name_creates_fresh_segment() {
        let name = unique_name("fresh");
        let first = NamedMapping::open_or_create(&name, 32).unwrap();
        first.write_i32(0, 42);
        first.unlink();

        let second = NamedMapping::open_or_create(&name, 32).unwrap();
        assert!(second.created_new());
        assert_eq!(second.read_i32(0), 0);
        second.unlink();
    }

    #[test]
    fn i32_round_trip_is_little_endian() {
        let name = unique_name("i32");
        let map = NamedMapping::open_or_create(&name, 16).unwrap();
        map.write_i32(4, -7);
        let mut raw = [0u8; 4];
        map.read_bytes(4, &mut raw);
        assert_eq!(raw, (-7i32).to_le_bytes());
        assert_eq!(map.read_i32(4), -7);
        map.unlink();
    }
}
