//! Linux backend: a readiness event queue plus a kernel timer object.
//!
//! Interests on the same underlying fd are folded into one registration
//! with the union of their masks, since the queue refuses duplicate
//! registrations; readiness fans back out to every interest the reported
//! mask satisfies. The minimum clock timeout is armed as a timer-fd in the
//! same queue (a zero expiration cannot be armed, so it is floored to one
//! nanosecond). A closed-while-waiting fd is auto-deregistered by the
//! kernel without a wakeup; such a wait ends at the deadline.

use crate::sys::{Backend, Direction, FdInterest, Readiness, ReadyState, WaitOutcome};
use crate::{Error, Result};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::time::Duration;

pub struct EpollBackend;

const TIMER_TOKEN: u64 = u64::MAX;

struct Registration {
    fd: RawFd,
    events: u32,
    interests: Vec<usize>,
}

impl Backend for EpollBackend {
    fn name(&self) -> &'static str {
        "epoll"
    }

    fn wait(&self, interests: &[FdInterest], timeout: Option<Duration>) -> Result<WaitOutcome> {
        let epfd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epfd < 0 {
            return Err(std::io::Error::last_os_error().into());
        }
        let epfd = unsafe { OwnedFd::from_raw_fd(epfd) };

        let mut registrations: Vec<Registration> = Vec::new();
        for (idx, interest) in interests.iter().enumerate() {
            let mask = match interest.direction {
                Direction::Read => libc::EPOLLIN,
                Direction::Write => libc::EPOLLOUT,
            } as u32;
            match registrations
                .iter()
                .position(|reg| reg.fd == interest.pollable.0)
            {
                Some(pos) => {
                    registrations[pos].events |= mask;
                    registrations[pos].interests.push(idx);
                }
                None => registrations.push(Registration {
                    fd: interest.pollable.0,
                    events: mask,
                    interests: vec![idx],
                }),
            }
        }
        let mut outcome = WaitOutcome {
            ready: Vec::new(),
            timed_out: false,
        };

        // Interests whose readiness is already decided before the wait:
        // regular files refuse to join the queue (EPERM) but by definition
        // never block, and an fd closed since collection shows up as EBADF.
        let mut predecided = false;
        for (token, reg) in registrations.iter().enumerate() {
            match epoll_add(&epfd, reg.fd, reg.events, token as u64) {
                Ok(()) => {}
                Err(err) if err.raw_os_error() == Some(libc::EPERM) => {
                    for &idx in &reg.interests {
                        outcome.ready.push(Readiness {
                            interest: idx,
                            state: ReadyState::Ready { hangup: false },
                        });
                    }
                    predecided = true;
                }
                Err(err) if err.raw_os_error() == Some(libc::EBADF) => {
                    for &idx in &reg.interests {
                        outcome.ready.push(Readiness {
                            interest: idx,
                            state: ReadyState::Error(Error::Badf),
                        });
                    }
                    predecided = true;
                }
                Err(err) => return Err(err.into()),
            }
        }

        // The deadline lives in the queue as a timer-fd; with events already
        // decided the wait degrades to a non-blocking sample instead.
        let _timer: Option<OwnedFd> = match (timeout, predecided) {
            (Some(t), false) => {
                let tfd = unsafe {
                    libc::timerfd_create(
                        libc::CLOCK_MONOTONIC,
                        libc::TFD_NONBLOCK | libc::TFD_CLOEXEC,
                    )
                };
                if tfd < 0 {
                    return Err(std::io::Error::last_os_error().into());
                }
                let tfd = unsafe { OwnedFd::from_raw_fd(tfd) };
                let ns = u64::try_from(t.as_nanos()).unwrap_or(u64::MAX).max(1);
                let mut spec: libc::itimerspec = unsafe { std::mem::zeroed() };
                spec.it_value.tv_sec = (ns / 1_000_000_000) as libc::time_t;
                spec.it_value.tv_nsec = (ns % 1_000_000_000) as libc::c_long;
                let rc = unsafe {
                    libc::timerfd_settime(tfd.as_raw_fd(), 0, &spec, std::ptr::null_mut())
                };
                if rc != 0 {
                    return Err(std::io::Error::last_os_error().into());
                }
                epoll_add(&epfd, tfd.as_raw_fd(), libc::EPOLLIN as u32, TIMER_TOKEN)
                    .map_err(Error::from)?;
                Some(tfd)
            }
            _ => None,
        };

        let wait_timeout_ms: libc::c_int = if predecided { 0 } else { -1 };
        let capacity = registrations.len() + 1;
        let mut events: Vec<libc::epoll_event> = Vec::with_capacity(capacity);
        let n_ready = loop {
            let rc = unsafe {
                libc::epoll_wait(
                    epfd.as_raw_fd(),
                    events.as_mut_ptr(),
                    capacity as libc::c_int,
                    wait_timeout_ms,
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

        for event in &events {
            let token = event.u64;
            if token == TIMER_TOKEN {
                outcome.timed_out = true;
                continue;
            }
            let reg = match registrations.get(token as usize) {
                Some(reg) => reg,
                None => return Err(Error::Io),
            };
            let revents = event.events;
            let errored = revents & libc::EPOLLERR as u32 != 0;
            let hangup = revents & libc::EPOLLHUP as u32 != 0;
            for &idx in &reg.interests {
                let wanted = match interests[idx].direction {
                    Direction::Read => libc::EPOLLIN,
                    Direction::Write => libc::EPOLLOUT,
                } as u32;
                if revents & (wanted | libc::EPOLLHUP as u32 | libc::EPOLLERR as u32) == 0 {
                    continue;
                }
                let state = if errored {
                    ReadyState::Error(Error::Io)
                } else {
                    ReadyState::Ready { hangup }
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

fn epoll_add(
    epfd: &OwnedFd,
    fd: RawFd,
    events: u32,
    token: u64,
) -> std::result::Result<(), std::io::Error> {
    let mut event = libc::epoll_event {
        events,
        u64: token,
    };
    let rc = unsafe { libc::epoll_ctl(epfd.as_raw_fd(), libc::EPOLL_CTL_ADD, fd, &mut event) };
    if rc != 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}
