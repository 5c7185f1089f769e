// Copyright 2026-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::error::{Error, Result};
use crate::platform::unix::mutex::{check, wait_ready};
use crate::platform::NamedMapping;
use nix::errno::Errno;
use nix::sys::signal::kill;
use nix::unistd::Pid;
use std::ffi::CStr;
use std::io;
use std::mem;
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, Ordering};
use std::time::Duration;

#[repr(C)]
struct EventSegment {
    state: AtomicU32,
    owner_pid: AtomicI32,
    signaled: AtomicU32,
    _pad: u32,
    lock: libc::pthread_mutex_t,
    cond: libc::pthread_cond_t,
}

/// A named single-slot auto-reset signal.
///
/// `signal` stores one pending wakeup; the next `wait` consumes it and the
/// event returns to idle. At most one waiter is woken per signal.
///
/// Existence doubles as the liveness proxy of the whole protocol: an
/// instance `claim`s its inbound events (recording its pid), and a
/// broadcaster probing a name learns from `created_new` whether anyone was
/// listening. Named POSIX segments outlive their creator, so a probe also
/// checks the claimed owner pid and re-creates segments whose owner died,
/// the equivalent of a kernel object vanishing with its last handle.
pub struct NamedEvent {
    map: NamedMapping,
    created_new: bool,
    claimed: AtomicBool,
}

impl NamedEvent {
    pub fn open_or_create(name: &CStr) -> Result<NamedEvent> {
        loop {
            let map = NamedMapping::open_or_create(name, mem::size_of::<EventSegment>())?;
            if map.created_new() {
                let event = NamedEvent {
                    map,
                    created_new: true,
                    claimed: AtomicBool::new(false),
                };
                event.init_segment()?;
                return Ok(event);
            }

            wait_ready(unsafe { &(*(map.base_ptr() as *mut EventSegment)).state }, name)?;
            let owner = unsafe { &(*(map.base_ptr() as *mut EventSegment)).owner_pid }
                .load(Ordering::Acquire);
            if owner > 0 && process_is_gone(owner) {
                tracing::debug!(name = ?name, owner, "reclaiming event abandoned by dead process");
                map.unlink();
                drop(map);
                continue;
            }
            return Ok(NamedEvent {
                map,
                created_new: false,
                claimed: AtomicBool::new(false),
            });
        }
    }

    fn segment(&self) -> *mut EventSegment {
        self.map.base_ptr() as *mut EventSegment
    }

    fn lock_ptr(&self) -> *mut libc::pthread_mutex_t {
        unsafe { ptr::addr_of_mut!((*self.segment()).lock) }
    }

    fn cond_ptr(&self) -> *mut libc::pthread_cond_t {
        unsafe { ptr::addr_of_mut!((*self.segment()).cond) }
    }

    fn signaled(&self) -> &AtomicU32 {
        unsafe { &(*self.segment()).signaled }
    }

    fn init_segment(&self) -> Result<()> {
        unsafe {
            let mut mattr: libc::pthread_mutexattr_t = mem::zeroed();
            check(libc::pthread_mutexattr_init(&mut mattr))?;
            check(libc::pthread_mutexattr_setpshared(
                &mut mattr,
                libc::PTHREAD_PROCESS_SHARED,
            ))?;
            #[cfg(target_os = "linux")]
            check(libc::pthread_mutexattr_setrobust(
                &mut mattr,
                libc::PTHREAD_MUTEX_ROBUST,
            ))?;
            let rc = libc::pthread_mutex_init(self.lock_ptr(), &mattr);
            libc::pthread_mutexattr_destroy(&mut mattr);
            check(rc)?;

            let mut cattr: libc::pthread_condattr_t = mem::zeroed();
            check(libc::pthread_condattr_init(&mut cattr))?;
            check(libc::pthread_condattr_setpshared(
                &mut cattr,
                libc::PTHREAD_PROCESS_SHARED,
            ))?;
            #[cfg(target_os = "linux")]
            check(libc::pthread_condattr_setclock(
                &mut cattr,
                libc::CLOCK_MONOTONIC,
            ))?;
            let rc = libc::pthread_cond_init(self.cond_ptr(), &cattr);
            libc::pthread_condattr_destroy(&mut cattr);
            check(rc)?;
        }
        let segment = unsafe { &*self.segment() };
        segment.owner_pid.store(0, Ordering::Release);
        segment.signaled.store(0, Ordering::Release);
        segment.state.store(1, Ordering::Release);
        Ok(())
    }

    /// Whether this call brought the name into existence. A pre-existing
    /// event means a live listener owns it.
    pub fn created_new(&self) -> bool {
        self.created_new
    }

    /// Marks this process as the event's owning listener. Claimed events are
    /// not unlinked on drop; the owner unlinks them explicitly when it
    /// leaves.
    pub fn claim(&self) {
        let pid = std::process::id() as i32;
        unsafe { &(*self.segment()).owner_pid }.store(pid, Ordering::Release);
        self.claimed.store(true, Ordering::Release);
    }

    /// Stores one pending wakeup and wakes one waiter, if any.
    pub fn signal(&self) -> Result<()> {
        let _guard = self.lock_internal()?;
        self.signaled().store(1, Ordering::Relaxed);
        check(unsafe { libc::pthread_cond_signal(self.cond_ptr()) })?;
        Ok(())
    }

    /// Blocks until signaled, consuming the pending wakeup. With a timeout,
    /// returns `Ok(false)` if it elapsed first.
    pub fn wait(&self, timeout: Option<Duration>) -> Result<bool> {
        let deadline = timeout.map(absolute_deadline);
        let _guard = self.lock_internal()?;
        loop {
            if self.signaled().swap(0, Ordering::Relaxed) == 1 {
                return Ok(true);
            }
            let rc = match &deadline {
                Some(ts) => unsafe {
                    libc::pthread_cond_timedwait(self.cond_ptr(), self.lock_ptr(), ts)
                },
                None => unsafe { libc::pthread_cond_wait(self.cond_ptr(), self.lock_ptr()) },
            };
            match rc {
                0 => {}
                libc::ETIMEDOUT => return Ok(false),
                #[cfg(target_os = "linux")]
                libc::EOWNERDEAD => unsafe {
                    // Reacquired from a dead owner, same recovery as a plain
                    // lock.
                    libc::pthread_mutex_consistent(self.lock_ptr());
                },
                rc => return Err(Error::Io(io::Error::from_raw_os_error(rc))),
            }
        }
    }

    /// Removes the global name so the next probe observes `created_new`.
    pub fn unlink(&self) {
        self.map.unlink();
    }

    pub fn name(&self) -> &CStr {
        self.map.name()
    }

    fn lock_internal(&self) -> Result<EventLockGuard<'_>> {
        let rc = unsafe { libc::pthread_mutex_lock(self.lock_ptr()) };
        match rc {
            0 => Ok(EventLockGuard { owner: self }),
            #[cfg(target_os = "linux")]
            libc::EOWNERDEAD => {
                unsafe { libc::pthread_mutex_consistent(self.lock_ptr()) };
                Ok(EventLockGuard { owner: self })
            }
            rc => Err(Error::Io(io::Error::from_raw_os_error(rc))),
        }
    }
}

impl Drop for NamedEvent {
    fn drop(&mut self) {
        // Probe handles clean up names they brought into existence; the
        // Windows original gets this for free from kernel handle refcounts.
        if self.created_new && !self.claimed.load(Ordering::Acquire) {
            self.map.unlink();
        }
    }
}

struct EventLockGuard<'a> {
    owner: &'a NamedEvent,
}

impl Drop for EventLockGuard<'_> {
    fn drop(&mut self) {
        unsafe {
            _ = libc::pthread_mutex_unlock(self.owner.lock_ptr());
        }
    }
}

fn process_is_gone(pid: i32) -> bool {
    matches!(kill(Pid::from_raw(pid), None), Err(Errno::ESRCH))
}

#[cfg(target_os = "linux")]
const DEADLINE_CLOCK: libc::clockid_t = libc::CLOCK_MONOTONIC;
#[cfg(not(target_os = "linux"))]
const DEADLINE_CLOCK: libc::clockid_t = libc::CLOCK_REALTIME;

fn absolute_deadline(timeout: Duration) -> libc::timespec {
    let mut now = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    unsafe { libc::clock_gettime(DEADLINE_CLOCK, &mut now) };
    let nanos = now.tv_nsec as i64 + timeout.subsec_nanos() as i64;
    libc::timespec {
        tv_sec: now.tv_sec + timeout.as_secs() as libc::time_t + (nanos / 1_000_000_000) as libc::time_t,
        tv_nsec: (nanos % 1_000_000_000) as libc::c_long,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ffi::CString;
    use std::sync::Arc;
    use std::time::Instant;

    fn unique_name(tag: &str) -> CString {
        static SEQ: AtomicU32 = AtomicU32::new(0);
        let seq = SEQ.fetch_add(1, Ordering::Relaxed);
        CString::new(format!("/shmbus-test-ev-{tag}-{}-{seq}", std::process::id())).unwrap()
    }

    #[test]
    fn pending_signal_satisfies_wait_immediately() {
        let name = unique_name("pending");
        let event = NamedEvent::open_or_create(&name).unwrap();
        event.claim();
        event.signal().unwrap();
        assert!(event.wait(Some(Duration::from_millis(10))).unwrap());
        event.unlink();
    }

    #[test]
    fn auto_reset_consumes_the_signal() {
        let name = unique_name("reset");
        let event = NamedEvent::open_or_create(&name).unwrap();
        event.claim();
        event.signal().unwrap();
        assert!(event.wait(Some(Duration::from_millis(10))).unwrap());
        assert!(!event.wait(Some(Duration::from_millis(20))).unwrap());
        event.unlink();
    }

    #[test]
    fn timed_wait_elapses_without_signal() {
        let name = unique_name("timeout");
        let event = NamedEvent::open_or_create(&name).unwrap();
        event.claim();
        let start = Instant::now();
        assert!(!event.wait(Some(Duration::from_millis(50))).unwrap());
        assert!(start.elapsed() >= Duration::from_millis(40));
        event.unlink();
    }

    #[test]
    fn signal_through_second_handle_wakes_waiter() {
        let name = unique_name("cross");
        let listener = Arc::new(NamedEvent::open_or_create(&name).unwrap());
        listener.claim();
        let waiter = {
            let listener = listener.clone();
            std::thread::spawn(move || listener.wait(Some(Duration::from_secs(2))).unwrap())
        };
        std::thread::sleep(Duration::from_millis(30));

        let probe = NamedEvent::open_or_create(&name).unwrap();
        assert!(!probe.created_new());
        probe.signal().unwrap();
        assert!(waiter.join().unwrap());
        listener.unlink();
    }

    #[test]
    fn probe_of_missing_event_creates_and_removes_it() {
        let name = unique_name("probe");
        {
            let probe = NamedEvent::open_or_create(&name).unwrap();
            assert!(probe.created_new());
        }
        // The probe unlinked on drop, so the name is free again.
        let second = NamedEvent::open_or_create(&name).unwrap();
        assert!(second.created_new());
        second.unlink();
    }
}
