//! Windows backend: a native waitable timer for the deadline plus one WSA
//! event object per distinct socket, multiplexed through the bounded
//! handle-wait primitive. Regular file handles never block on Windows, so
//! file interests report ready without waiting (reads still surface their
//! queued-bytes hint as zero). Exceeding the handle-wait cap is `Notsup`.

use crate::sys::{Backend, Direction, FdInterest, Readiness, ReadyState, WaitOutcome};
use crate::{Error, Result};
use std::os::windows::io::{RawHandle, RawSocket};
use std::time::Duration;
use windows_sys::Win32::Foundation::{
    CloseHandle, HANDLE, WAIT_FAILED, WAIT_OBJECT_0, WAIT_TIMEOUT,
};
use windows_sys::Win32::Networking::WinSock::{
    ioctlsocket, WSACloseEvent, WSACreateEvent, WSAEnumNetworkEvents, WSAEventSelect, FIONREAD,
    FD_ACCEPT, FD_CLOSE, FD_CONNECT, FD_READ, FD_WRITE, SOCKET, WSANETWORKEVENTS,
};
use windows_sys::Win32::System::Threading::{
    CreateWaitableTimerW, SetWaitableTimer, WaitForMultipleObjects, INFINITE,
};

/// The raw, non-owning handle a descriptor exposes for readiness checks.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Pollable {
    Handle(RawHandle),
    Socket(RawSocket),
}

// Raw handles are only ever dereferenced by the owning thread's wait call.
unsafe impl Send for Pollable {}
unsafe impl Sync for Pollable {}

pub(crate) fn stdin() -> Pollable {
    use std::os::windows::io::AsRawHandle;
    Pollable::Handle(std::io::stdin().as_raw_handle())
}

pub(crate) fn stdout() -> Pollable {
    use std::os::windows::io::AsRawHandle;
    Pollable::Handle(std::io::stdout().as_raw_handle())
}

pub(crate) fn stderr() -> Pollable {
    use std::os::windows::io::AsRawHandle;
    Pollable::Handle(std::io::stderr().as_raw_handle())
}

/// Queued-bytes hint. Only sockets can answer on Windows.
pub fn num_ready_bytes(p: Pollable) -> u64 {
    match p {
        Pollable::Handle(_) => 0,
        Pollable::Socket(socket) => {
            let mut avail: u32 = 0;
            let rc = unsafe { ioctlsocket(socket as SOCKET, FIONREAD, &mut avail) };
            if rc == 0 {
                u64::from(avail)
            } else {
                0
            }
        }
    }
}

/// The documented bound of the handle-wait primitive.
const HANDLE_WAIT_CAP: usize = 64;

struct SocketRegistration {
    socket: RawSocket,
    event: HANDLE,
    read_interests: Vec<usize>,
    write_interests: Vec<usize>,
}

impl Drop for SocketRegistration {
    fn drop(&mut self) {
        unsafe {
            // Deregister before the event object goes away.
            WSAEventSelect(self.socket as SOCKET, 0, 0);
            WSACloseEvent(self.event);
        }
    }
}

struct TimerHandle(HANDLE);

impl Drop for TimerHandle {
    fn drop(&mut self) {
        unsafe {
            CloseHandle(self.0);
        }
    }
}

pub struct HandleWaitBackend;

impl Backend for HandleWaitBackend {
    fn name(&self) -> &'static str {
        "handle-wait"
    }

    fn wait(&self, interests: &[FdInterest], timeout: Option<Duration>) -> Result<WaitOutcome> {
        let mut outcome = WaitOutcome {
            ready: Vec::new(),
            timed_out: false,
        };

        // File handles are always ready; collect them up front and turn the
        // wait into a sample.
        let mut file_ready = false;
        for (idx, interest) in interests.iter().enumerate() {
            if matches!(interest.pollable, Pollable::Handle(_)) {
                outcome.ready.push(Readiness {
                    interest: idx,
                    state: ReadyState::Ready { hangup: false },
                });
                file_ready = true;
            }
        }

        let mut registrations: Vec<SocketRegistration> = Vec::new();
        for (idx, interest) in interests.iter().enumerate() {
            let socket = match interest.pollable {
                Pollable::Socket(socket) => socket,
                Pollable::Handle(_) => continue,
            };
            let pos = match registrations.iter().position(|reg| reg.socket == socket) {
                Some(pos) => pos,
                None => {
                    let event = unsafe { WSACreateEvent() };
                    if event == 0 || event == -1 {
                        return Err(Error::Io);
                    }
                    registrations.push(SocketRegistration {
                        socket,
                        event,
                        read_interests: Vec::new(),
                        write_interests: Vec::new(),
                    });
                    registrations.len() - 1
                }
            };
            match interest.direction {
                Direction::Read => registrations[pos].read_interests.push(idx),
                Direction::Write => registrations[pos].write_interests.push(idx),
            }
        }
        for reg in &registrations {
            let mut mask = FD_CLOSE;
            if !reg.read_interests.is_empty() {
                mask |= FD_READ | FD_ACCEPT;
            }
            if !reg.write_interests.is_empty() {
                mask |= FD_WRITE | FD_CONNECT;
            }
            let rc = unsafe { WSAEventSelect(reg.socket as SOCKET, reg.event, mask as i32) };
            if rc != 0 {
                return Err(Error::Io);
            }
        }

        if registrations.is_empty() && timeout.is_none() && !file_ready {
            // Nothing to watch and no deadline: the protocol never asks for
            // this, and the primitive cannot express it.
            return Err(Error::Inval);
        }

        let effective_timeout = if file_ready {
            Some(Duration::ZERO)
        } else {
            timeout
        };

        let mut handles: Vec<HANDLE> = registrations.iter().map(|reg| reg.event).collect();
        let mut timer_guard: Option<TimerHandle> = None;
        if let Some(t) = effective_timeout {
            let timer = unsafe { CreateWaitableTimerW(std::ptr::null(), 1, std::ptr::null()) };
            if timer == 0 {
                return Err(std::io::Error::last_os_error().into());
            }
            let timer = TimerHandle(timer);
            // Relative due time in 100ns ticks, negative, with at least one
            // tick so a zero wait still fires.
            let ticks = (t.as_nanos() / 100).max(1);
            let due = -i64::try_from(ticks).unwrap_or(i64::MAX);
            let rc = unsafe { SetWaitableTimer(timer.0, &due, 0, None, std::ptr::null(), 0) };
            if rc == 0 {
                return Err(std::io::Error::last_os_error().into());
            }
            handles.push(timer.0);
            timer_guard = Some(timer);
        }
        let timer_index = timer_guard.as_ref().map(|_| handles.len() - 1);

        if handles.len() > HANDLE_WAIT_CAP {
            return Err(Error::Notsup);
        }

        let rc = unsafe {
            WaitForMultipleObjects(handles.len() as u32, handles.as_ptr(), 0, INFINITE)
        };
        if rc == WAIT_FAILED {
            return Err(std::io::Error::last_os_error().into());
        }
        let timer_fired = match timer_index {
            Some(idx) => rc == WAIT_TIMEOUT || rc == WAIT_OBJECT_0 + idx as u32,
            None => rc == WAIT_TIMEOUT,
        };

        // Enumerate every socket's network events; the enumeration is
        // non-blocking, so sockets beyond the one that satisfied the wait
        // still get reported.
        for reg in &registrations {
            let mut net_events: WSANETWORKEVENTS = unsafe { std::mem::zeroed() };
            let rc = unsafe {
                WSAEnumNetworkEvents(reg.socket as SOCKET, reg.event, &mut net_events)
            };
            if rc != 0 {
                for &idx in reg.read_interests.iter().chain(&reg.write_interests) {
                    outcome.ready.push(Readiness {
                        interest: idx,
                        state: ReadyState::Error(Error::Io),
                    });
                }
                continue;
            }
            let bits = net_events.lNetworkEvents as u32;
            let hangup = bits & FD_CLOSE != 0;
            if bits & (FD_READ | FD_ACCEPT) != 0 || hangup {
                for &idx in &reg.read_interests {
                    outcome.ready.push(Readiness {
                        interest: idx,
                        state: ReadyState::Ready { hangup },
                    });
                }
            }
            if bits & (FD_WRITE | FD_CONNECT) != 0 || hangup {
                for &idx in &reg.write_interests {
                    outcome.ready.push(Readiness {
                        interest: idx,
                        state: ReadyState::Ready { hangup },
                    });
                }
            }
        }

        outcome.timed_out = timer_fired && !file_ready;
        drop(timer_guard);
        Ok(outcome)
    }
}
