use crate::clocks::ClockId;
use crate::Error;
use bitflags::bitflags;

bitflags! {
    #[derive(Copy, Clone, Debug, PartialEq, Eq)]
    pub struct RwEventFlags: u32 {
        const HANGUP = 0b1;
    }
}

impl Default for RwEventFlags {
    fn default() -> Self {
        Self::empty()
    }
}

/// Opaque value echoed from a subscription into the event it produces.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Userdata(u64);

impl From<u64> for Userdata {
    fn from(u: u64) -> Userdata {
        Userdata(u)
    }
}

impl From<Userdata> for u64 {
    fn from(u: Userdata) -> u64 {
        u.0
    }
}

/// A clock-timer request. `timeout` is nanoseconds: a duration when
/// `absolute` is false, a deadline on `id`'s timescale when true.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct ClockSubscription {
    pub id: ClockId,
    pub timeout: u64,
    pub precision: u64,
    pub absolute: bool,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum SubscriptionKind {
    Clock(ClockSubscription),
    FdRead(u32),
    FdWrite(u32),
}

/// One entry of a `poll_oneoff` batch, as decoded from the guest's
/// subscription record by the marshaling layer.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Subscription {
    pub userdata: Userdata,
    pub kind: SubscriptionKind,
}

impl Subscription {
    pub fn clock(userdata: impl Into<Userdata>, clock: ClockSubscription) -> Self {
        Self {
            userdata: userdata.into(),
            kind: SubscriptionKind::Clock(clock),
        }
    }

    pub fn fd_read(userdata: impl Into<Userdata>, fd: u32) -> Self {
        Self {
            userdata: userdata.into(),
            kind: SubscriptionKind::FdRead(fd),
        }
    }

    pub fn fd_write(userdata: impl Into<Userdata>, fd: u32) -> Self {
        Self {
            userdata: userdata.into(),
            kind: SubscriptionKind::FdWrite(fd),
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum EventKind {
    Clock,
    FdRead,
    FdWrite,
}

/// Readiness payload of an fd event; zero-valued on error events and absent
/// on clock events.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub struct FdEventPayload {
    /// Bytes believed readable without blocking (a hint, not a promise).
    pub nbytes: u64,
    pub flags: RwEventFlags,
}

/// One entry of a `poll_oneoff` result batch.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Event {
    pub userdata: Userdata,
    /// `None` is success; per-subscription failures are delivered here
    /// rather than failing the whole call.
    pub error: Option<Error>,
    pub kind: EventKind,
    pub fd_state: Option<FdEventPayload>,
}

impl Event {
    pub(crate) fn clock(userdata: Userdata) -> Self {
        Self {
            userdata,
            error: None,
            kind: EventKind::Clock,
            fd_state: None,
        }
    }

    pub(crate) fn fd_ready(
        userdata: Userdata,
        kind: EventKind,
        nbytes: u64,
        flags: RwEventFlags,
    ) -> Self {
        Self {
            userdata,
            error: None,
            kind,
            fd_state: Some(FdEventPayload { nbytes, flags }),
        }
    }

    /// The event recorded when a subscription fails during collection or
    /// resolves to an errored pollable: same shape, zeroed payload.
    pub(crate) fn failed(userdata: Userdata, kind: EventKind, error: Error) -> Self {
        Self {
            userdata,
            error: Some(error),
            kind,
            fd_state: match kind {
                EventKind::Clock => None,
                EventKind::FdRead | EventKind::FdWrite => Some(FdEventPayload::default()),
            },
        }
    }
}
