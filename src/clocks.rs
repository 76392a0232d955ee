use crate::sched::subscription::ClockSubscription;
use crate::Result;
use cap_std::time::{MonotonicClock, SystemClock};
use cap_std::AmbientAuthority;
use cap_time_ext::{MonotonicClockExt, SystemClockExt};
use std::time::Duration;

/// Clock identifiers a subscription may name. The CPU-time clocks are only
/// measurable on unix hosts; elsewhere they fail with `Notsup`.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ClockId {
    Realtime,
    Monotonic,
    ProcessCputime,
    ThreadCputime,
}

/// Host clock access for the multiplexer and for the embedder's `clock_*`
/// host calls.
///
/// Guest-visible monotonic time is nanoseconds since the context was
/// created, so absolute monotonic deadlines from the guest re-base against
/// `creation_time`.
pub struct Clocks {
    system: SystemClock,
    monotonic: MonotonicClock,
    creation_time: cap_std::time::Instant,
}

impl Clocks {
    pub fn new(ambient_authority: AmbientAuthority) -> Self {
        let monotonic = MonotonicClock::new(ambient_authority);
        let creation_time = monotonic.now();
        Self {
            system: SystemClock::new(ambient_authority),
            monotonic,
            creation_time,
        }
    }

    /// Current value of `id` in nanoseconds, coarsened to `precision`.
    pub fn now(&self, id: ClockId, precision: Duration) -> Result<u64> {
        match id {
            ClockId::Realtime => {
                let now = self.system.now_with(precision);
                let since_epoch = now
                    .duration_since(SystemClock::UNIX_EPOCH)
                    .unwrap_or(Duration::ZERO);
                Ok(duration_to_ns(since_epoch))
            }
            ClockId::Monotonic => {
                let now = self.monotonic.now_with(precision);
                Ok(duration_to_ns(now.duration_since(self.creation_time)))
            }
            ClockId::ProcessCputime | ClockId::ThreadCputime => cputime_ns(id),
        }
    }

    pub fn resolution(&self, id: ClockId) -> Result<u64> {
        match id {
            ClockId::Realtime => Ok(duration_to_ns(self.system.resolution())),
            ClockId::Monotonic => Ok(duration_to_ns(self.monotonic.resolution())),
            ClockId::ProcessCputime | ClockId::ThreadCputime => cputime_resolution_ns(id),
        }
    }

    /// Effective relative timeout of a clock subscription, in nanoseconds.
    /// Absolute deadlines already in the past clamp to zero.
    pub fn remaining(&self, sub: &ClockSubscription) -> Result<u64> {
        if sub.absolute {
            let now = self.now(sub.id, Duration::from_nanos(sub.precision))?;
            Ok(sub.timeout.saturating_sub(now))
        } else {
            Ok(sub.timeout)
        }
    }
}

fn duration_to_ns(d: Duration) -> u64 {
    u64::try_from(d.as_nanos()).unwrap_or(u64::MAX)
}

#[cfg(unix)]
fn cputime_ns(id: ClockId) -> Result<u64> {
    let ts = rustix::time::clock_gettime(cputime_clock_id(id));
    Ok(timespec_to_ns(ts))
}

#[cfg(unix)]
fn cputime_resolution_ns(id: ClockId) -> Result<u64> {
    let ts = rustix::time::clock_getres(cputime_clock_id(id));
    Ok(timespec_to_ns(ts).max(1))
}

#[cfg(unix)]
fn cputime_clock_id(id: ClockId) -> rustix::time::ClockId {
    match id {
        ClockId::ProcessCputime => rustix::time::ClockId::ProcessCPUTime,
        ClockId::ThreadCputime => rustix::time::ClockId::ThreadCPUTime,
        ClockId::Realtime | ClockId::Monotonic => unreachable!("handled by cap-std clocks"),
    }
}

#[cfg(unix)]
fn timespec_to_ns(ts: rustix::time::Timespec) -> u64 {
    u64::try_from(ts.tv_sec)
        .unwrap_or(0)
        .saturating_mul(1_000_000_000)
        .saturating_add(u64::try_from(ts.tv_nsec).unwrap_or(0))
}

#[cfg(not(unix))]
fn cputime_ns(_id: ClockId) -> Result<u64> {
    Err(crate::Error::Notsup)
}

#[cfg(not(unix))]
fn cputime_resolution_ns(_id: ClockId) -> Result<u64> {
    Err(crate::Error::Notsup)
}
