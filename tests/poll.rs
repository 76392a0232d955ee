#![cfg(unix)]

use std::io::Write;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::time::{Duration, Instant};
use wasi_hostfd::sys::{PollBackend, SelectBackend};
use wasi_hostfd::{
    Backend, ClockId, ClockSubscription, Error, EventKind, Pollable, Resource, Rights,
    RwEventFlags, Subscription, WasiCtx,
};

fn ctx() -> WasiCtx {
    WasiCtx::builder().build().unwrap()
}

fn ctx_with(backend: Box<dyn Backend>) -> WasiCtx {
    WasiCtx::builder().backend(backend).build().unwrap()
}

/// Run a scenario against the platform default backend and the two
/// always-available fallbacks.
fn each_backend(scenario: impl Fn(WasiCtx)) {
    scenario(ctx());
    scenario(ctx_with(Box::new(PollBackend)));
    scenario(ctx_with(Box::new(SelectBackend)));
}

fn pipe() -> (OwnedFd, OwnedFd) {
    let mut fds = [0; 2];
    assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
    unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) }
}

fn insert_observer(ctx: &WasiCtx, fd: &OwnedFd) -> u32 {
    ctx.insert_resource(
        Resource::FileObserver(Pollable(fd.as_raw_fd())),
        Rights::file_base(),
    )
    .unwrap()
}

fn relative_clock(userdata: u64, timeout: Duration) -> Subscription {
    Subscription::clock(
        userdata,
        ClockSubscription {
            id: ClockId::Monotonic,
            timeout: timeout.as_nanos() as u64,
            precision: 0,
            absolute: false,
        },
    )
}

#[test]
fn empty_batch_is_invalid() {
    each_backend(|ctx| {
        assert_eq!(ctx.poll_oneoff(&[]).err(), Some(Error::Inval));
    });
}

#[test]
fn expired_absolute_clock_fires_once() {
    each_backend(|ctx| {
        let now = ctx.clocks().now(ClockId::Monotonic, Duration::ZERO).unwrap();
        let sub = Subscription::clock(
            9,
            ClockSubscription {
                id: ClockId::Monotonic,
                timeout: now.saturating_sub(1),
                precision: 0,
                absolute: true,
            },
        );
        let start = Instant::now();
        let events = ctx.poll_oneoff(&[sub]).unwrap();
        assert!(start.elapsed() < Duration::from_secs(2));
        assert_eq!(events.len(), 1);
        let event = &events[0];
        assert_eq!(u64::from(event.userdata), 9);
        assert_eq!(event.error, None);
        assert_eq!(event.kind, EventKind::Clock);
        assert_eq!(event.fd_state, None);
    });
}

#[test]
fn relative_clock_blocks_for_duration() {
    let ctx = ctx();
    let start = Instant::now();
    let events = ctx
        .poll_oneoff(&[relative_clock(1, Duration::from_millis(60))])
        .unwrap();
    assert!(start.elapsed() >= Duration::from_millis(60));
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].kind, EventKind::Clock);
    assert_eq!(events[0].error, None);
}

#[test]
fn clock_with_idle_fd_waits_out_the_minimum() {
    each_backend(|ctx| {
        let (reader, _writer) = pipe();
        let fd = insert_observer(&ctx, &reader);
        let start = Instant::now();
        let events = ctx
            .poll_oneoff(&[
                Subscription::fd_read(1, fd),
                relative_clock(2, Duration::from_millis(80)),
            ])
            .unwrap();
        assert!(start.elapsed() >= Duration::from_millis(75));
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, EventKind::Clock);
        assert_eq!(u64::from(events[0].userdata), 2);
    });
}

#[test]
fn bad_fd_reports_immediately_without_blocking() {
    each_backend(|ctx| {
        let start = Instant::now();
        let events = ctx
            .poll_oneoff(&[
                Subscription::fd_read(1, 42),
                relative_clock(2, Duration::from_secs(10)),
            ])
            .unwrap();
        assert!(start.elapsed() < Duration::from_secs(2));
        assert_eq!(events.len(), 1);
        let event = &events[0];
        assert_eq!(event.error, Some(Error::Badf));
        assert_eq!(event.kind, EventKind::FdRead);
        assert_eq!(u64::from(event.userdata), 1);
        // The zero-valued payload is still present on failed fd events.
        assert_eq!(event.fd_state.unwrap().nbytes, 0);
    });
}

#[test]
fn insufficient_rights_report_notcapable() {
    each_backend(|ctx| {
        let (reader, _writer) = pipe();
        let fd = ctx
            .insert_resource(
                Resource::FileObserver(Pollable(reader.as_raw_fd())),
                Rights::FD_READ,
            )
            .unwrap();
        let start = Instant::now();
        let events = ctx.poll_oneoff(&[Subscription::fd_read(3, fd)]).unwrap();
        assert!(start.elapsed() < Duration::from_secs(2));
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].error, Some(Error::Notcapable));
    });
}

#[test]
fn readable_pipe_reports_ready() {
    each_backend(|ctx| {
        let (reader, writer) = pipe();
        let mut writer_file = std::fs::File::from(writer);
        writer_file.write_all(b"ready").unwrap();
        let fd = insert_observer(&ctx, &reader);
        let events = ctx.poll_oneoff(&[Subscription::fd_read(4, fd)]).unwrap();
        assert_eq!(events.len(), 1);
        let event = &events[0];
        assert_eq!(event.error, None);
        assert_eq!(event.kind, EventKind::FdRead);
        let payload = event.fd_state.unwrap();
        assert_eq!(payload.nbytes, 5);
        assert!(!payload.flags.contains(RwEventFlags::HANGUP));
    });
}

#[test]
fn writable_pipe_reports_ready() {
    each_backend(|ctx| {
        let (_reader, writer) = pipe();
        let fd = insert_observer(&ctx, &writer);
        let events = ctx.poll_oneoff(&[Subscription::fd_write(5, fd)]).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].error, None);
        assert_eq!(events[0].kind, EventKind::FdWrite);
        assert_eq!(events[0].fd_state.unwrap().nbytes, 0);
    });
}

#[test]
fn closed_writer_raises_hangup() {
    // select cannot observe hangup, so only the richer primitives assert it.
    for ctx in [ctx(), ctx_with(Box::new(PollBackend))] {
        let (reader, writer) = pipe();
        drop(writer);
        let fd = insert_observer(&ctx, &reader);
        let events = ctx.poll_oneoff(&[Subscription::fd_read(6, fd)]).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].error, None);
        assert!(events[0].fd_state.unwrap().flags.contains(RwEventFlags::HANGUP));
    }
}

#[test]
fn directories_are_skipped_not_errored() {
    each_backend(|ctx| {
        let dir = tempfile::tempdir().unwrap();
        let dir_file = std::fs::File::open(dir.path()).unwrap();
        let dir_fd = ctx
            .insert_resource(Resource::Dir(dir_file), Rights::dir_base())
            .unwrap();
        let (reader, writer) = pipe();
        let mut writer_file = std::fs::File::from(writer);
        writer_file.write_all(b"x").unwrap();
        let pipe_fd = insert_observer(&ctx, &reader);
        let events = ctx
            .poll_oneoff(&[
                Subscription::fd_read(7, dir_fd),
                Subscription::fd_read(8, pipe_fd),
            ])
            .unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(u64::from(events[0].userdata), 8);
    });
}

#[test]
fn regular_file_reports_remaining_bytes() {
    each_backend(|ctx| {
        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        tmp.write_all(b"0123456789").unwrap();
        tmp.flush().unwrap();
        let file = std::fs::File::open(tmp.path()).unwrap();
        let fd = ctx
            .insert_resource(Resource::File(file), Rights::file_base())
            .unwrap();
        let events = ctx.poll_oneoff(&[Subscription::fd_read(9, fd)]).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].error, None);
        assert_eq!(events[0].fd_state.unwrap().nbytes, 10);
    });
}

#[test]
fn immediate_events_precede_fd_events() {
    each_backend(|ctx| {
        let (reader, writer) = pipe();
        let mut writer_file = std::fs::File::from(writer);
        writer_file.write_all(b"x").unwrap();
        let pipe_fd = insert_observer(&ctx, &reader);
        let events = ctx
            .poll_oneoff(&[
                Subscription::fd_read(10, pipe_fd),
                Subscription::fd_read(11, 4096),
            ])
            .unwrap();
        assert_eq!(events.len(), 2);
        // The failed resolution is reported first even though the pipe
        // subscription came first in the batch.
        assert_eq!(u64::from(events[0].userdata), 11);
        assert_eq!(events[0].error, Some(Error::Badf));
        assert_eq!(u64::from(events[1].userdata), 10);
        assert_eq!(events[1].error, None);
    });
}

#[test]
fn expired_clock_fires_alongside_ready_fd() {
    each_backend(|ctx| {
        let (reader, writer) = pipe();
        let mut writer_file = std::fs::File::from(writer);
        writer_file.write_all(b"x").unwrap();
        let pipe_fd = insert_observer(&ctx, &reader);
        let now = ctx.clocks().now(ClockId::Monotonic, Duration::ZERO).unwrap();
        let events = ctx
            .poll_oneoff(&[
                Subscription::fd_read(12, pipe_fd),
                Subscription::clock(
                    13,
                    ClockSubscription {
                        id: ClockId::Monotonic,
                        timeout: now.saturating_sub(1),
                        precision: 0,
                        absolute: true,
                    },
                ),
            ])
            .unwrap();
        assert_eq!(events.len(), 2);
        // fd readiness drains before clock events.
        assert_eq!(events[0].kind, EventKind::FdRead);
        assert_eq!(u64::from(events[0].userdata), 12);
        assert_eq!(events[1].kind, EventKind::Clock);
        assert_eq!(u64::from(events[1].userdata), 13);
    });
}

#[test]
fn userdata_round_trips_verbatim() {
    each_backend(|ctx| {
        let (reader, writer) = pipe();
        let mut writer_file = std::fs::File::from(writer);
        writer_file.write_all(b"x").unwrap();
        let read_fd = insert_observer(&ctx, &reader);
        let (_second_reader, second_writer) = pipe();
        let write_fd = insert_observer(&ctx, &second_writer);
        let tags = [u64::MAX, 0, 0xdead_beef_cafe];
        let events = ctx
            .poll_oneoff(&[
                Subscription::fd_read(tags[0], read_fd),
                Subscription::fd_read(tags[1], 9999),
                Subscription::fd_write(tags[2], write_fd),
            ])
            .unwrap();
        assert_eq!(events.len(), 3);
        let mut seen: Vec<u64> = events.iter().map(|e| u64::from(e.userdata)).collect();
        seen.sort_unstable();
        let mut expected = tags.to_vec();
        expected.sort_unstable();
        assert_eq!(seen, expected);
    });
}

#[test]
fn inherit_stdio_seeds_first_three_fds() {
    let ctx = WasiCtx::builder().inherit_stdio().build().unwrap();
    for fd in 0..3 {
        let guard = ctx.resolve_fd(fd).unwrap();
        guard.expect_rights(Rights::POLL_FD_READWRITE).unwrap();
    }
    assert_eq!(ctx.resolve_fd(3).err(), Some(Error::Badf));
}

#[test]
fn close_and_renumber_through_ctx() {
    let ctx = ctx();
    let (reader, _writer) = pipe();
    let fd = insert_observer(&ctx, &reader);
    ctx.fd_renumber(fd, 77).unwrap();
    assert_eq!(ctx.resolve_fd(fd).err(), Some(Error::Badf));
    ctx.fd_close(77).unwrap();
    assert_eq!(ctx.resolve_fd(77).err(), Some(Error::Badf));
}
