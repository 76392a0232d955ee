//! The readiness/timeout multiplexer: one `poll_oneoff` protocol written
//! against the [`Backend`] trait, with the OS primitive chosen per platform.
//!
//! A call runs Collecting → Dispatched → Draining. Collecting resolves fd
//! subscriptions through the descriptor table (failures become immediate
//! events, never call failures) and normalizes clock subscriptions to an
//! effective relative timeout. Dispatched blocks in exactly one backend
//! wait, with no table or descriptor lock held. Draining emits events in a
//! fixed order: the immediate bucket, then fd readiness in registration
//! order, then whichever clock subscriptions fired.

use crate::clocks::Clocks;
use crate::descriptor::{Resource, Rights};
use crate::sys::{self, Backend, Direction, FdInterest, ReadyState};
use crate::table::DescriptorTable;
use crate::{Error, Result};
use std::time::Duration;

pub mod subscription;

use self::subscription::{Event, EventKind, RwEventFlags, Subscription, SubscriptionKind, Userdata};

struct PendingClock {
    userdata: Userdata,
    sub: subscription::ClockSubscription,
    effective_ns: u64,
}

pub struct Scheduler {
    backend: Box<dyn Backend>,
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Scheduler {
    /// A scheduler on the preferred backend for this platform.
    pub fn new() -> Self {
        Self {
            backend: sys::default_backend(),
        }
    }

    /// A scheduler on an explicit backend. Useful for exercising the
    /// fallback primitives on platforms that prefer another one.
    pub fn with_backend(backend: Box<dyn Backend>) -> Self {
        Self { backend }
    }

    pub fn sched_yield(&self) {
        std::thread::yield_now();
    }

    pub fn sleep(&self, duration: Duration) {
        std::thread::sleep(duration);
    }

    /// Wait for the first of the given subscriptions to be satisfied and
    /// report between 0 and `subs.len()` events.
    ///
    /// An empty batch is rejected with `Inval`. Per-subscription failures
    /// are reported as events carrying the failure; only a failure of the
    /// OS primitive itself (which cannot be attributed to one subscription)
    /// fails the whole call.
    pub fn poll_oneoff(
        &self,
        table: &DescriptorTable,
        clocks: &Clocks,
        subs: &[Subscription],
    ) -> Result<Vec<Event>> {
        if subs.is_empty() {
            return Err(Error::Inval);
        }
        if subs.len() > sys::MAX_SUBSCRIPTIONS {
            return Err(Error::Overflow);
        }

        // A lone clock subscription is just a sleep with an event attached.
        if let [one] = subs {
            if let SubscriptionKind::Clock(clock) = &one.kind {
                let remaining = clocks.remaining(clock)?;
                if remaining > 0 {
                    self.sleep(Duration::from_nanos(remaining));
                }
                return Ok(vec![Event::clock(one.userdata)]);
            }
        }

        // Collecting.
        let mut immediates: Vec<Event> = Vec::new();
        let mut interests: Vec<FdInterest> = Vec::new();
        let mut pending_clocks: Vec<PendingClock> = Vec::new();
        let mut min_timeout_ns: Option<u64> = None;

        for sub in subs {
            match sub.kind {
                SubscriptionKind::FdRead(fd) | SubscriptionKind::FdWrite(fd) => {
                    let (direction, kind) = match sub.kind {
                        SubscriptionKind::FdRead(_) => (Direction::Read, EventKind::FdRead),
                        _ => (Direction::Write, EventKind::FdWrite),
                    };
                    let guard = match table.resolve(fd) {
                        Ok(guard) => guard,
                        Err(err) => {
                            immediates.push(Event::failed(sub.userdata, kind, err));
                            continue;
                        }
                    };
                    if let Err(err) = guard.expect_rights(Rights::POLL_FD_READWRITE) {
                        immediates.push(Event::failed(sub.userdata, kind, err));
                        continue;
                    }
                    match guard.resource() {
                        // Directories are valid poll targets that can never
                        // become ready; they produce no event at all.
                        Resource::Dir(_) => continue,
                        Resource::Null => {
                            immediates.push(Event::failed(sub.userdata, kind, Error::Badf));
                            continue;
                        }
                        resource => match resource.pollable() {
                            Some(pollable) => interests.push(FdInterest {
                                pollable,
                                direction,
                                userdata: sub.userdata,
                            }),
                            None => {
                                immediates.push(Event::failed(sub.userdata, kind, Error::Badf));
                            }
                        },
                    }
                    // Guard drops here: nothing is held across the wait.
                }
                SubscriptionKind::Clock(clock) => {
                    let effective_ns = clocks.remaining(&clock)?;
                    min_timeout_ns = Some(match min_timeout_ns {
                        Some(min) => min.min(effective_ns),
                        None => effective_ns,
                    });
                    pending_clocks.push(PendingClock {
                        userdata: sub.userdata,
                        sub: clock,
                        effective_ns,
                    });
                }
            }
        }

        if interests.is_empty() && pending_clocks.is_empty() {
            return Ok(immediates);
        }

        // With events already in hand the wait degrades to a readiness
        // sample; the guest gets its error reports without delay.
        let forced_zero = !immediates.is_empty();
        let timeout = if forced_zero {
            Some(Duration::ZERO)
        } else {
            min_timeout_ns.map(Duration::from_nanos)
        };

        tracing::debug!(
            backend = self.backend.name(),
            interests = interests.len(),
            clocks = pending_clocks.len(),
            ?timeout,
            "poll dispatch"
        );
        let outcome = self.backend.wait(&interests, timeout)?;

        // Draining.
        let mut events = immediates;

        let mut ready = outcome.ready;
        ready.sort_by_key(|r| r.interest);
        for r in &ready {
            let interest = &interests[r.interest];
            let kind = match interest.direction {
                Direction::Read => EventKind::FdRead,
                Direction::Write => EventKind::FdWrite,
            };
            events.push(match r.state {
                ReadyState::Error(err) => Event::failed(interest.userdata, kind, err),
                ReadyState::Ready { hangup } => {
                    let nbytes = match interest.direction {
                        Direction::Read => sys::num_ready_bytes(interest.pollable),
                        Direction::Write => 0,
                    };
                    let flags = if hangup {
                        RwEventFlags::HANGUP
                    } else {
                        RwEventFlags::empty()
                    };
                    Event::fd_ready(interest.userdata, kind, nbytes, flags)
                }
            });
        }

        // Clock firing: a wait that ran to the deadline fires every holder
        // of the minimum timeout; a wait an fd (or pending immediates) cut
        // short fires only subscriptions already expired when collected.
        // Absolute deadlines are re-checked against their clock so an
        // expired timer is never dropped just because an fd won the race.
        let full_wait = outcome.timed_out && !forced_zero;
        for pending in &pending_clocks {
            let fires = if full_wait {
                Some(pending.effective_ns) == min_timeout_ns
            } else {
                pending.effective_ns == 0
            };
            if !fires {
                continue;
            }
            if pending.sub.absolute {
                let now = clocks.now(
                    pending.sub.id,
                    Duration::from_nanos(pending.sub.precision),
                )?;
                if now < pending.sub.timeout {
                    continue;
                }
            }
            events.push(Event::clock(pending.userdata));
        }

        Ok(events)
    }
}
