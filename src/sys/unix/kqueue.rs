//! BSD backend over the kernel event queue. One change entry per distinct
//! (ident, filter) pair; results fan back out to every interest on that
//! pair. Registration failures come back as `EV_ERROR` events and are
//! delivered per-interest rather than failing the call.

// The filter and udata member types vary across the BSDs; casts that are
// trivial on one of them are load-bearing on another.
#![allow(trivial_numeric_casts)]

use crate::sys::{Backend, Direction, FdInterest, Readiness, ReadyState, WaitOutcome};
use crate::{Error, Result};
use std::os::fd::{FromRawFd, OwnedFd};
use std::time::Duration;

pub struct KqueueBackend;

struct Registration {
    ident: libc::uintptr_t,
    direction: Direction,
    interests: Vec<usize>,
}

impl Backend for KqueueBackend {
    fn name(&self) -> &'static str {
        "kqueue"
    }

    fn wait(&self, interests: &[FdInterest], timeout: Option<Duration>) -> Result<WaitOutcome> {
        let kq = unsafe { libc::kqueue() };
        if kq < 0 {
            return Err(std::io::Error::last_os_error().into());
        }
        // RAII close of the queue fd.
        let kq = unsafe { OwnedFd::from_raw_fd(kq) };

        let mut registrations: Vec<Registration> = Vec::new();
        for (idx, interest) in interests.iter().enumerate() {
            let ident = interest.pollable.0 as libc::uintptr_t;
            match registrations
                .iter()
                .position(|reg| reg.ident == ident && reg.direction == interest.direction)
            {
                Some(pos) => registrations[pos].interests.push(idx),
                None => registrations.push(Registration {
                    ident,
                    direction: interest.direction,
                    interests: vec![idx],
                }),
            }
        }

        // Field-by-field init: the kevent struct grows extra members on some
        // of the BSDs.
        let mut changes: Vec<libc::kevent> = registrations
            .iter()
            .enumerate()
            .map(|(token, reg)| {
                let mut change = unsafe { std::mem::zeroed::<libc::kevent>() };
                change.ident = reg.ident;
                change.filter = match reg.direction {
                    Direction::Read => libc::EVFILT_READ as _,
                    Direction::Write => libc::EVFILT_WRITE as _,
                };
                change.flags = libc::EV_ADD;
                change.udata = token as _;
                change
            })
            .collect();

        let ts = timeout.map(|t| libc::timespec {
            tv_sec: t.as_secs().try_into().unwrap_or(libc::time_t::MAX),
            tv_nsec: t.subsec_nanos() as libc::c_long,
        });
        let ts_ptr = ts
            .as_ref()
            .map_or(std::ptr::null(), |ts| ts as *const libc::timespec);

        let mut events: Vec<libc::kevent> = Vec::with_capacity(registrations.len().max(1));
        let n_ready = loop {
            let rc = unsafe {
                libc::kevent(
                    std::os::fd::AsRawFd::as_raw_fd(&kq),
                    changes.as_mut_ptr(),
                    changes.len() as libc::c_int,
                    events.as_mut_ptr(),
                    events.capacity() as libc::c_int,
                    ts_ptr,
                )
            };
            if rc >= 0 {
                break rc as usize;
            }
            let err = std::io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EINTR) {
                continue;
            }
            return Err(err.into());
        };
        unsafe { events.set_len(n_ready) };

        let mut outcome = WaitOutcome {
            ready: Vec::new(),
            timed_out: n_ready == 0,
        };
        for event in &events {
            let token = event.udata as usize;
            let reg = match registrations.get(token) {
                Some(reg) => reg,
                None => return Err(Error::Io),
            };
            let state = if event.flags & libc::EV_ERROR != 0 {
                if event.data as i32 == libc::EBADF {
                    ReadyState::Error(Error::Badf)
                } else {
                    ReadyState::Error(Error::Io)
                }
            } else {
                ReadyState::Ready {
                    hangup: event.flags & libc::EV_EOF != 0,
                }
            };
            for &idx in &reg.interests {
                outcome.ready.push(Readiness {
                    interest: idx,
                    state,
                });
            }
        }
        Ok(outcome)
    }
}
