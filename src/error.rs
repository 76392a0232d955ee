use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Internal error type for the `wasi-hostfd` crate.
/// Variants mirror the subset of the WASI `$errno` space this layer can
/// itself produce; the embedder maps them onto the guest's error codes.
/// All variants are data-free so that poll events can carry them by value.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Error)]
pub enum Error {
    /// Errno::Badf: Bad file descriptor
    #[error("Badf: bad file descriptor")]
    Badf,
    /// Errno::Notcapable: Extension: Capabilities insufficient
    #[error("Notcapable: capabilities insufficient")]
    Notcapable,
    /// Errno::Inval: Invalid argument
    #[error("Inval: invalid argument")]
    Inval,
    /// Errno::Overflow: Value too large to be stored in data type.
    #[error("Overflow: value too large to be stored in data type")]
    Overflow,
    /// Errno::Io: I/O error
    #[error("Io: I/O error")]
    Io,
    /// Errno::Notsup: Not supported, or operation not supported on socket.
    #[error("Notsup: not supported")]
    Notsup,
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        #[cfg(unix)]
        match err.raw_os_error() {
            Some(libc::EBADF) => return Self::Badf,
            Some(libc::EINVAL) => return Self::Inval,
            Some(libc::EOVERFLOW) => return Self::Overflow,
            _ => {}
        }
        match err.kind() {
            std::io::ErrorKind::InvalidInput => Self::Inval,
            std::io::ErrorKind::Unsupported => Self::Notsup,
            _ => {
                tracing::debug!(error = %err, "host I/O error folded to Io");
                Self::Io
            }
        }
    }
}

#[cfg(unix)]
impl From<rustix::io::Errno> for Error {
    fn from(err: rustix::io::Errno) -> Self {
        use rustix::io::Errno;
        if err == Errno::BADF {
            Self::Badf
        } else if err == Errno::INVAL {
            Self::Inval
        } else if err == Errno::OVERFLOW {
            Self::Overflow
        } else if err == Errno::NOSYS || err == Errno::OPNOTSUPP {
            Self::Notsup
        } else {
            tracing::debug!(error = %err, "host errno folded to Io");
            Self::Io
        }
    }
}

impl From<std::convert::Infallible> for Error {
    fn from(_err: std::convert::Infallible) -> Self {
        unreachable!("should be impossible: From<Infallible>")
    }
}
