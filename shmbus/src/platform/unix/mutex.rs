// Copyright 2026-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::error::{Error, Result};
use crate::platform::NamedMapping;
use std::ffi::CStr;
use std::io;
use std::mem;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

const STATE_READY: u32 = 1;
const INIT_SETTLE_TIMEOUT: Duration = Duration::from_secs(2);

#[repr(C)]
struct MutexSegment {
    state: AtomicU32,
    _pad: u32,
    lock: libc::pthread_mutex_t,
}

/// A mutex addressable by global name from unrelated processes.
///
/// Backed by a process-shared pthread mutex living in its own named shared
/// segment. The mutex is recursive (the bulk lock is re-acquired by `write`
/// running inside a `lock_read_write` body on the same thread) and robust: a
/// lock whose owner died is made consistent and handed out as a normal
/// acquisition, never surfaced to callers.
pub struct NamedMutex {
    map: NamedMapping,
}

impl NamedMutex {
    pub fn open_or_create(name: &CStr) -> Result<NamedMutex> {
        let map = NamedMapping::open_or_create(name, mem::size_of::<MutexSegment>())?;
        let mutex = NamedMutex { map };
        if mutex.map.created_new() {
            mutex.init_segment()?;
        } else {
            wait_ready(mutex.segment_state(), name)?;
        }
        Ok(mutex)
    }

    fn segment(&self) -> *mut MutexSegment {
        self.map.base_ptr() as *mut MutexSegment
    }

    fn lock_ptr(&self) -> *mut libc::pthread_mutex_t {
        unsafe { std::ptr::addr_of_mut!((*self.segment()).lock) }
    }

    fn segment_state(&self) -> &AtomicU32 {
        unsafe { &(*self.segment()).state }
    }

    fn init_segment(&self) -> Result<()> {
        unsafe {
            let mut attr: libc::pthread_mutexattr_t = mem::zeroed();
            check(libc::pthread_mutexattr_init(&mut attr))?;
            check(libc::pthread_mutexattr_setpshared(
                &mut attr,
                libc::PTHREAD_PROCESS_SHARED,
            ))?;
            check(libc::pthread_mutexattr_settype(
                &mut attr,
                libc::PTHREAD_MUTEX_RECURSIVE,
            ))?;
            #[cfg(target_os = "linux")]
            check(libc::pthread_mutexattr_setrobust(
                &mut attr,
                libc::PTHREAD_MUTEX_ROBUST,
            ))?;
            let rc = libc::pthread_mutex_init(self.lock_ptr(), &attr);
            libc::pthread_mutexattr_destroy(&mut attr);
            check(rc)?;
        }
        self.segment_state().store(STATE_READY, Ordering::Release);
        Ok(())
    }

    /// Blocks until the mutex is held. Abandonment by a dead owner is
    /// recovered transparently.
    pub fn lock(&self) -> Result<MutexGuard<'_>> {
        let lock = self.lock_ptr();
        let rc = unsafe { libc::pthread_mutex_lock(lock) };
        match rc {
            0 => Ok(MutexGuard { owner: self }),
            #[cfg(target_os = "linux")]
            libc::EOWNERDEAD => {
                // The previous owner died mid-section; the protocol treats
                // this as a successful acquisition.
                unsafe { libc::pthread_mutex_consistent(lock) };
                Ok(MutexGuard { owner: self })
            }
            rc => Err(Error::Io(io::Error::from_raw_os_error(rc))),
        }
    }

    pub fn name(&self) -> &CStr {
        self.map.name()
    }
}

pub(crate) fn wait_ready(state: &AtomicU32, name: &CStr) -> Result<()> {
    let start = Instant::now();
    while state.load(Ordering::Acquire) != STATE_READY {
        if start.elapsed() > INIT_SETTLE_TIMEOUT {
            return Err(Error::Io(io::Error::new(
                io::ErrorKind::TimedOut,
                format!("named object {name:?} was never initialized by its creator"),
            )));
        }
        std::thread::yield_now();
    }
    Ok(())
}

pub(crate) fn check(rc: libc::c_int) -> Result<()> {
    if rc == 0 {
        Ok(())
    } else {
        Err(Error::Io(io::Error::from_raw_os_error(rc)))
    }
}

pub struct MutexGuard<'a> {
    owner: &'a NamedMutex,
}

impl Drop for MutexGuard<'_> {
    fn drop(&mut self) {
        unsafe {
            _ = libc::pthread_mutex_unlock(self.owner.lock_ptr());
        }
    }
}
