//! Legacy bitmask backend over `select(2)`. Bounded by `FD_SETSIZE`;
//! descriptors past the bound make the call `Notsup` rather than being
//! silently dropped. The bitmask primitive cannot observe hangup or
//! per-fd errors, so readiness is all it ever reports.

use crate::sys::{Backend, Direction, FdInterest, Readiness, ReadyState, WaitOutcome};
use crate::{Error, Result};
use std::time::Duration;

pub struct SelectBackend;

impl Backend for SelectBackend {
    fn name(&self) -> &'static str {
        "select"
    }

    fn wait(&self, interests: &[FdInterest], timeout: Option<Duration>) -> Result<WaitOutcome> {
        for interest in interests {
            let fd = interest.pollable.0;
            if fd < 0 || fd as usize >= libc::FD_SETSIZE {
                return Err(Error::Notsup);
            }
        }

        let outcome = loop {
            let mut readfds = unsafe { std::mem::zeroed::<libc::fd_set>() };
            let mut writefds = unsafe { std::mem::zeroed::<libc::fd_set>() };
            let mut nfds: libc::c_int = 0;
            for interest in interests {
                let fd = interest.pollable.0;
                unsafe {
                    match interest.direction {
                        Direction::Read => libc::FD_SET(fd, &mut readfds),
                        Direction::Write => libc::FD_SET(fd, &mut writefds),
                    }
                }
                nfds = nfds.max(fd + 1);
            }

            // select may scribble on the timeout, so it is rebuilt per retry.
            let mut tv = timeout.map(timeval_round_up);
            let tv_ptr = tv
                .as_mut()
                .map_or(std::ptr::null_mut(), |tv| tv as *mut libc::timeval);

            let rc = unsafe {
                libc::select(
                    nfds,
                    &mut readfds,
                    &mut writefds,
                    std::ptr::null_mut(),
                    tv_ptr,
                )
            };
            if rc >= 0 {
                break collect_ready(interests, &readfds, &writefds, rc);
            }
            let err = std::io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EINTR) {
                continue;
            }
            return Err(err.into());
        };

        Ok(outcome)
    }
}

fn collect_ready(
    interests: &[FdInterest],
    readfds: &libc::fd_set,
    writefds: &libc::fd_set,
    rc: libc::c_int,
) -> WaitOutcome {
    let mut outcome = WaitOutcome {
        ready: Vec::new(),
        timed_out: rc == 0,
    };
    if rc > 0 {
        for (idx, interest) in interests.iter().enumerate() {
            let fd = interest.pollable.0;
            let set = match interest.direction {
                Direction::Read => unsafe { libc::FD_ISSET(fd, readfds) },
                Direction::Write => unsafe { libc::FD_ISSET(fd, writefds) },
            };
            if set {
                outcome.ready.push(Readiness {
                    interest: idx,
                    state: ReadyState::Ready { hangup: false },
                });
            }
        }
    }
    outcome
}

/// Convert to a timeval, rounding up so the wait is never early.
fn timeval_round_up(t: Duration) -> libc::timeval {
    let mut sec = t.as_secs();
    let mut usec = u64::from(t.subsec_nanos()).div_ceil(1_000);
    if usec >= 1_000_000 {
        sec += 1;
        usec = 0;
    }
    libc::timeval {
        tv_sec: sec.try_into().unwrap_or(libc::time_t::MAX),
        tv_usec: usec as libc::suseconds_t,
    }
}
