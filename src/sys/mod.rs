//! Platform readiness primitives behind one narrow interface.
//!
//! The protocol in [`crate::sched`] is written once against [`Backend`];
//! each OS primitive gets one thin implementation. Which backend a platform
//! prefers is decided here, at build time; it is never a guest-visible
//! choice.

use crate::sched::subscription::Userdata;
use crate::{Error, Result};
use std::time::Duration;

cfg_if::cfg_if! {
    if #[cfg(unix)] {
        pub mod unix;
        pub use unix::{num_ready_bytes, Pollable};
        pub(crate) use unix::{stderr, stdin, stdout};
        pub use unix::poll::PollBackend;
        pub use unix::select::SelectBackend;
        #[cfg(target_os = "linux")]
        pub use unix::epoll::EpollBackend;
        #[cfg(any(
            target_os = "macos",
            target_os = "ios",
            target_os = "freebsd",
            target_os = "netbsd",
            target_os = "openbsd",
            target_os = "dragonfly",
        ))]
        pub use unix::kqueue::KqueueBackend;
    } else if #[cfg(windows)] {
        pub mod windows;
        pub use windows::{num_ready_bytes, HandleWaitBackend, Pollable};
        pub(crate) use windows::{stderr, stdin, stdout};
    }
}

/// Largest subscription batch the protocol accepts; the readiness
/// primitives all take an `int`-sized count somewhere.
pub const MAX_SUBSCRIPTIONS: usize = i32::MAX as usize;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Direction {
    Read,
    Write,
}

/// One fd subscription after table resolution: the raw handle to watch,
/// which direction, and the userdata to echo. Raw handles are sampled under
/// the descriptor lock during collection and not revalidated afterwards; a
/// concurrent close surfaces through the backend, which is also the only
/// way to cancel a wait.
#[derive(Debug, Copy, Clone)]
pub struct FdInterest {
    pub pollable: Pollable,
    pub direction: Direction,
    pub userdata: Userdata,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ReadyState {
    Ready { hangup: bool },
    /// The primitive reported the fd itself is bad (`Badf`) or failed
    /// (`Io`); delivered as that interest's event.
    Error(Error),
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Readiness {
    /// Index into the interest slice passed to [`Backend::wait`].
    pub interest: usize,
    pub state: ReadyState,
}

#[derive(Debug)]
pub struct WaitOutcome {
    pub ready: Vec<Readiness>,
    /// The deadline elapsed. Backends that can observe readiness and the
    /// deadline in the same wake (the readiness-queue ones) may report both.
    pub timed_out: bool,
}

pub trait Backend: Send + Sync {
    fn name(&self) -> &'static str;

    /// Block until an interest is ready or the timeout elapses.
    /// `None` means wait indefinitely; `Some(ZERO)` samples without
    /// blocking. Must retry internally on spurious interruption.
    fn wait(&self, interests: &[FdInterest], timeout: Option<Duration>) -> Result<WaitOutcome>;
}

/// The preferred backend for this platform.
pub fn default_backend() -> Box<dyn Backend> {
    #[cfg(target_os = "linux")]
    return Box::new(EpollBackend);

    #[cfg(any(
        target_os = "macos",
        target_os = "ios",
        target_os = "freebsd",
        target_os = "netbsd",
        target_os = "openbsd",
        target_os = "dragonfly",
    ))]
    return Box::new(KqueueBackend);

    #[cfg(all(
        unix,
        not(target_os = "linux"),
        not(any(
            target_os = "macos",
            target_os = "ios",
            target_os = "freebsd",
            target_os = "netbsd",
            target_os = "openbsd",
            target_os = "dragonfly",
        ))
    ))]
    return Box::new(PollBackend);

    #[cfg(windows)]
    return Box::new(HandleWaitBackend);
}
