use std::os::fd::RawFd;

pub mod poll;
pub mod select;

#[cfg(target_os = "linux")]
pub mod epoll;

#[cfg(any(
    target_os = "macos",
    target_os = "ios",
    target_os = "freebsd",
    target_os = "netbsd",
    target_os = "openbsd",
    target_os = "dragonfly",
))]
pub mod kqueue;

/// A raw, non-owning fd as watched by the readiness backends.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Pollable(pub RawFd);

pub(crate) fn stdin() -> Pollable {
    Pollable(libc::STDIN_FILENO)
}

pub(crate) fn stdout() -> Pollable {
    Pollable(libc::STDOUT_FILENO)
}

pub(crate) fn stderr() -> Pollable {
    Pollable(libc::STDERR_FILENO)
}

/// Bytes readable from `p` without blocking, best effort. Regular files
/// answer from size and cursor since `FIONREAD` may overflow on them;
/// everything else answers from `FIONREAD`. A hint of 0 on failure.
pub fn num_ready_bytes(p: Pollable) -> u64 {
    let fd = p.0;
    unsafe {
        let mut st: libc::stat = std::mem::zeroed();
        if libc::fstat(fd, &mut st) == 0 && (st.st_mode & libc::S_IFMT) == libc::S_IFREG {
            let pos = libc::lseek(fd, 0, libc::SEEK_CUR);
            if pos >= 0 {
                return (st.st_size as u64).saturating_sub(pos as u64);
            }
            return 0;
        }
        let mut avail: libc::c_int = 0;
        if libc::ioctl(fd, libc::FIONREAD, &mut avail) == 0 && avail > 0 {
            avail as u64
        } else {
            0
        }
    }
}
