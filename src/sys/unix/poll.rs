//! Generic POSIX backend over `poll(2)`, with the minimum clock timeout
//! expressed as the millisecond wait bound.

use crate::sys::{Backend, Direction, FdInterest, Readiness, ReadyState, WaitOutcome};
use crate::{Error, Result};
use rustix::event::{PollFd, PollFlags};
use std::os::fd::BorrowedFd;
use std::time::Duration;

pub struct PollBackend;

impl Backend for PollBackend {
    fn name(&self) -> &'static str {
        "poll"
    }

    fn wait(&self, interests: &[FdInterest], timeout: Option<Duration>) -> Result<WaitOutcome> {
        let timeout_ms = match timeout {
            // Round up: the wait must never be shorter than the deadline.
            Some(t) => {
                let ms = t.as_nanos().div_ceil(1_000_000);
                i32::try_from(ms).unwrap_or(i32::MAX)
            }
            None => -1,
        };

        let mut pollfds: Vec<PollFd<'_>> = interests
            .iter()
            .map(|interest| {
                let fd = unsafe { BorrowedFd::borrow_raw(interest.pollable.0) };
                let flags = match interest.direction {
                    Direction::Read => PollFlags::IN,
                    Direction::Write => PollFlags::OUT,
                };
                PollFd::from_borrowed_fd(fd, flags)
            })
            .collect();

        let n_ready = loop {
            match rustix::event::poll(&mut pollfds, timeout_ms) {
                Ok(n) => break n,
                Err(errno) if errno == rustix::io::Errno::INTR => continue,
                Err(errno) => return Err(errno.into()),
            }
        };

        let mut outcome = WaitOutcome {
            ready: Vec::new(),
            timed_out: n_ready == 0,
        };
        if n_ready > 0 {
            for (idx, pollfd) in pollfds.iter().enumerate() {
                let revents = pollfd.revents();
                if revents.is_empty() {
                    continue;
                }
                let state = if revents.contains(PollFlags::NVAL) {
                    ReadyState::Error(Error::Badf)
                } else if revents.contains(PollFlags::ERR) {
                    ReadyState::Error(Error::Io)
                } else {
                    ReadyState::Ready {
                        hangup: revents.contains(PollFlags::HUP),
                    }
                };
                outcome.ready.push(Readiness {
                    interest: idx,
                    state,
                });
            }
        }
        Ok(outcome)
    }
}
