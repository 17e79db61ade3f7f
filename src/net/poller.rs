// src/net/poller.rs - Readiness poller for worker loops
//
// Unified edge-triggered IO multiplexing:
// - Linux: epoll (EPOLLET)
// - macOS/FreeBSD/OpenBSD: kqueue (EV_CLEAR)
//
// Design principles:
// - Edge-triggered mode requires drain until WouldBlock
// - EINTR auto-retry
// - Tokens are 64-bit so a full SessionId fits in one

use std::io;
use std::os::unix::io::RawFd;
use std::time::Duration;

pub type RawHandle = RawFd;

const MAX_EVENTS: usize = 256;

/// Event interest flags
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Interest {
    pub readable: bool,
    pub writable: bool,
}

impl Interest {
    pub const NONE: Interest = Interest {
        readable: false,
        writable: false,
    };

    pub const READABLE: Interest = Interest {
        readable: true,
        writable: false,
    };

    #[cfg(test)]
    pub const WRITABLE: Interest = Interest {
        readable: false,
        writable: true,
    };

    pub fn add_writable(self) -> Interest {
        Interest {
            writable: true,
            ..self
        }
    }
}

/// IO event
#[derive(Debug, Clone, Copy)]
pub struct Event {
    pub token: u64,
    pub readable: bool,
    pub writable: bool,
    pub error: bool,
    pub hangup: bool,
}

impl Event {
    pub fn is_readable(&self) -> bool {
        self.readable
    }

    pub fn is_writable(&self) -> bool {
        self.writable
    }

    pub fn is_error(&self) -> bool {
        self.error
    }

    pub fn is_hangup(&self) -> bool {
        self.hangup
    }
}

/// Poll timeout in milliseconds, rounding sub-millisecond waits up so a short
/// timeout never turns into a busy loop.
fn timeout_millis(timeout: Option<Duration>) -> i32 {
    match timeout {
        None => -1,
        Some(d) if d.is_zero() => 0,
        Some(d) => d.as_millis().clamp(1, i32::MAX as u128) as i32,
    }
}

#[cfg(target_os = "linux")]
mod linux {
    use super::*;

    pub struct Poller {
        epfd: RawFd,
    }

    impl Poller {
        pub fn new() -> io::Result<Self> {
            // SAFETY: epoll_create1 takes no pointers; the result is checked.
            let epfd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
            if epfd < 0 {
                return Err(io::Error::last_os_error());
            }
            Ok(Poller { epfd })
        }

        fn ctl(&mut self, op: i32, fd: RawHandle, token: u64, interest: Interest) -> io::Result<()> {
            let mut event = libc::epoll_event {
                events: interest_to_epoll(interest) | libc::EPOLLET as u32,
                u64: token,
            };

            // SAFETY: self.epfd is owned by self and `event` lives on the stack
            // for the duration of the call.
            let ret = unsafe { libc::epoll_ctl(self.epfd, op, fd, &mut event) };
            if ret < 0 {
                return Err(io::Error::last_os_error());
            }
            Ok(())
        }

        pub fn register(&mut self, fd: RawHandle, token: u64, interest: Interest) -> io::Result<()> {
            self.ctl(libc::EPOLL_CTL_ADD, fd, token, interest)
        }

        pub fn modify(&mut self, fd: RawHandle, token: u64, interest: Interest) -> io::Result<()> {
            self.ctl(libc::EPOLL_CTL_MOD, fd, token, interest)
        }

        pub fn deregister(&mut self, fd: RawHandle) -> io::Result<()> {
            // SAFETY: a null event pointer is accepted for EPOLL_CTL_DEL
            // (Linux 2.6.9+).
            let ret = unsafe {
                libc::epoll_ctl(self.epfd, libc::EPOLL_CTL_DEL, fd, std::ptr::null_mut())
            };
            if ret < 0 {
                return Err(io::Error::last_os_error());
            }
            Ok(())
        }

        pub fn poll(&mut self, timeout: Option<Duration>) -> io::Result<Vec<Event>> {
            let timeout_ms = timeout_millis(timeout);
            let mut events: Vec<libc::epoll_event> = Vec::with_capacity(MAX_EVENTS);

            loop {
                // SAFETY: `events` has room for MAX_EVENTS entries and epoll_wait
                // writes at most that many.
                let ret = unsafe {
                    libc::epoll_wait(
                        self.epfd,
                        events.as_mut_ptr(),
                        MAX_EVENTS as i32,
                        timeout_ms,
                    )
                };

                if ret < 0 {
                    let err = io::Error::last_os_error();
                    if err.kind() == io::ErrorKind::Interrupted {
                        continue; // EINTR - retry
                    }
                    return Err(err);
                }

                // SAFETY: epoll_wait initialized the first `ret` entries.
                unsafe { events.set_len(ret as usize) };

                return Ok(events
                    .iter()
                    .map(|ev| {
                        let flags = ev.events;
                        let token = ev.u64;
                        Event {
                            token,
                            readable: flags & (libc::EPOLLIN as u32) != 0,
                            writable: flags & (libc::EPOLLOUT as u32) != 0,
                            error: flags & (libc::EPOLLERR as u32) != 0,
                            hangup: flags & (libc::EPOLLHUP as u32) != 0,
                        }
                    })
                    .collect());
            }
        }
    }

    impl Drop for Poller {
        fn drop(&mut self) {
            // SAFETY: epfd is owned exclusively by self and closed only here.
            unsafe { libc::close(self.epfd) };
        }
    }

    fn interest_to_epoll(interest: Interest) -> u32 {
        let mut events = 0;
        if interest.readable {
            events |= libc::EPOLLIN as u32;
        }
        if interest.writable {
            events |= libc::EPOLLOUT as u32;
        }
        events
    }
}

#[cfg(any(target_os = "macos", target_os = "freebsd", target_os = "openbsd"))]
mod bsd {
    use super::*;
    use std::collections::HashMap;

    pub struct Poller {
        kq: RawFd,
    }

    fn change(fd: RawHandle, filter: i16, flags: u16, token: u64) -> libc::kevent {
        // SAFETY: kevent is a plain C struct, all-zero is a valid value.
        let mut ev: libc::kevent = unsafe { std::mem::zeroed() };
        ev.ident = fd as _;
        ev.filter = filter as _;
        ev.flags = flags as _;
        ev.udata = token as usize as *mut _;
        ev
    }

    impl Poller {
        pub fn new() -> io::Result<Self> {
            // SAFETY: kqueue takes no arguments; the result is checked.
            let kq = unsafe { libc::kqueue() };
            if kq < 0 {
                return Err(io::Error::last_os_error());
            }
            Ok(Poller { kq })
        }

        fn apply(&mut self, changes: &[libc::kevent]) -> io::Result<()> {
            if changes.is_empty() {
                return Ok(());
            }
            // SAFETY: `changes` is a valid slice; no events are requested back.
            let ret = unsafe {
                libc::kevent(
                    self.kq,
                    changes.as_ptr(),
                    changes.len() as _,
                    std::ptr::null_mut(),
                    0,
                    std::ptr::null(),
                )
            };
            if ret < 0 {
                return Err(io::Error::last_os_error());
            }
            Ok(())
        }

        pub fn register(&mut self, fd: RawHandle, token: u64, interest: Interest) -> io::Result<()> {
            let add = libc::EV_ADD | libc::EV_ENABLE | libc::EV_CLEAR;
            let mut changes = Vec::with_capacity(2);
            if interest.readable {
                changes.push(change(fd, libc::EVFILT_READ, add, token));
            }
            if interest.writable {
                changes.push(change(fd, libc::EVFILT_WRITE, add, token));
            }
            self.apply(&changes)
        }

        pub fn modify(&mut self, fd: RawHandle, token: u64, interest: Interest) -> io::Result<()> {
            let add = libc::EV_ADD | libc::EV_ENABLE | libc::EV_CLEAR;
            // kqueue registers filters separately; delete the unwanted ones one
            // by one since EV_DELETE on a missing filter fails with ENOENT.
            for (wanted, filter) in [
                (interest.readable, libc::EVFILT_READ),
                (interest.writable, libc::EVFILT_WRITE),
            ] {
                if wanted {
                    self.apply(&[change(fd, filter, add, token)])?;
                } else if let Err(e) = self.apply(&[change(fd, filter, libc::EV_DELETE, 0)]) {
                    if e.raw_os_error() != Some(libc::ENOENT) {
                        return Err(e);
                    }
                }
            }
            Ok(())
        }

        pub fn deregister(&mut self, fd: RawHandle) -> io::Result<()> {
            // Ignore errors - a filter might not be registered
            for filter in [libc::EVFILT_READ, libc::EVFILT_WRITE] {
                let _ = self.apply(&[change(fd, filter, libc::EV_DELETE, 0)]);
            }
            Ok(())
        }

        pub fn poll(&mut self, timeout: Option<Duration>) -> io::Result<Vec<Event>> {
            let timespec = timeout.map(|d| libc::timespec {
                tv_sec: d.as_secs() as _,
                tv_nsec: d.subsec_nanos() as _,
            });
            let timeout_ptr = timespec
                .as_ref()
                .map(|t| t as *const libc::timespec)
                .unwrap_or(std::ptr::null());

            let mut events: Vec<libc::kevent> = Vec::with_capacity(MAX_EVENTS);

            loop {
                // SAFETY: `events` has room for MAX_EVENTS entries; the
                // timespec outlives the call.
                let ret = unsafe {
                    libc::kevent(
                        self.kq,
                        std::ptr::null(),
                        0,
                        events.as_mut_ptr(),
                        MAX_EVENTS as _,
                        timeout_ptr,
                    )
                };

                if ret < 0 {
                    let err = io::Error::last_os_error();
                    if err.kind() == io::ErrorKind::Interrupted {
                        continue; // EINTR - retry
                    }
                    return Err(err);
                }

                // SAFETY: kevent initialized the first `ret` entries.
                unsafe { events.set_len(ret as usize) };

                // Aggregate read/write filters of the same token
                let mut by_token: HashMap<u64, Event> = HashMap::new();
                for ev in &events {
                    let token = ev.udata as usize as u64;
                    let entry = by_token.entry(token).or_insert(Event {
                        token,
                        readable: false,
                        writable: false,
                        error: false,
                        hangup: false,
                    });
                    if ev.filter == libc::EVFILT_READ {
                        entry.readable = true;
                    } else if ev.filter == libc::EVFILT_WRITE {
                        entry.writable = true;
                    }
                    if ev.flags & libc::EV_ERROR != 0 {
                        entry.error = true;
                    }
                    if ev.flags & libc::EV_EOF != 0 {
                        entry.hangup = true;
                    }
                }

                return Ok(by_token.into_values().collect());
            }
        }
    }

    impl Drop for Poller {
        fn drop(&mut self) {
            // SAFETY: kq is owned exclusively by self and closed only here.
            unsafe { libc::close(self.kq) };
        }
    }
}

#[cfg(target_os = "linux")]
pub use linux::Poller;

#[cfg(any(target_os = "macos", target_os = "freebsd", target_os = "openbsd"))]
pub use bsd::Poller;
