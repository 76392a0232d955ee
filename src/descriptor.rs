use crate::sys::Pollable;
use crate::{Error, Result};
use bitflags::bitflags;
use std::fs;

bitflags! {
    /// WASI preview1 rights, as granted to a descriptor at creation time.
    /// A descriptor's mask may only ever shrink (see [`Descriptor::limit_rights`]).
    #[derive(Copy, Clone, Debug, PartialEq, Eq)]
    pub struct Rights: u64 {
        const FD_DATASYNC             = 1 << 0;
        const FD_READ                 = 1 << 1;
        const FD_SEEK                 = 1 << 2;
        const FD_FDSTAT_SET_FLAGS     = 1 << 3;
        const FD_SYNC                 = 1 << 4;
        const FD_TELL                 = 1 << 5;
        const FD_WRITE                = 1 << 6;
        const FD_ADVISE               = 1 << 7;
        const FD_ALLOCATE             = 1 << 8;
        const PATH_CREATE_DIRECTORY   = 1 << 9;
        const PATH_CREATE_FILE        = 1 << 10;
        const PATH_LINK_SOURCE        = 1 << 11;
        const PATH_LINK_TARGET        = 1 << 12;
        const PATH_OPEN               = 1 << 13;
        const FD_READDIR              = 1 << 14;
        const PATH_READLINK           = 1 << 15;
        const PATH_RENAME_SOURCE      = 1 << 16;
        const PATH_RENAME_TARGET      = 1 << 17;
        const PATH_FILESTAT_GET       = 1 << 18;
        const PATH_FILESTAT_SET_SIZE  = 1 << 19;
        const PATH_FILESTAT_SET_TIMES = 1 << 20;
        const FD_FILESTAT_GET         = 1 << 21;
        const FD_FILESTAT_SET_SIZE    = 1 << 22;
        const FD_FILESTAT_SET_TIMES   = 1 << 23;
        const PATH_SYMLINK            = 1 << 24;
        const PATH_REMOVE_DIRECTORY   = 1 << 25;
        const PATH_UNLINK_FILE        = 1 << 26;
        const POLL_FD_READWRITE       = 1 << 27;
        const SOCK_SHUTDOWN           = 1 << 28;
        const SOCK_ACCEPT             = 1 << 29;
    }
}

impl Rights {
    /// Base rights for a regular file descriptor.
    pub fn file_base() -> Self {
        Self::FD_DATASYNC
            | Self::FD_READ
            | Self::FD_SEEK
            | Self::FD_FDSTAT_SET_FLAGS
            | Self::FD_SYNC
            | Self::FD_TELL
            | Self::FD_WRITE
            | Self::FD_ADVISE
            | Self::FD_ALLOCATE
            | Self::FD_FILESTAT_GET
            | Self::FD_FILESTAT_SET_SIZE
            | Self::FD_FILESTAT_SET_TIMES
            | Self::POLL_FD_READWRITE
    }

    /// Base rights for a preopened directory descriptor.
    pub fn dir_base() -> Self {
        Self::FD_FDSTAT_SET_FLAGS
            | Self::FD_SYNC
            | Self::FD_ADVISE
            | Self::PATH_CREATE_DIRECTORY
            | Self::PATH_CREATE_FILE
            | Self::PATH_LINK_SOURCE
            | Self::PATH_LINK_TARGET
            | Self::PATH_OPEN
            | Self::FD_READDIR
            | Self::PATH_READLINK
            | Self::PATH_RENAME_SOURCE
            | Self::PATH_RENAME_TARGET
            | Self::PATH_FILESTAT_GET
            | Self::PATH_FILESTAT_SET_SIZE
            | Self::PATH_FILESTAT_SET_TIMES
            | Self::FD_FILESTAT_GET
            | Self::FD_FILESTAT_SET_TIMES
            | Self::PATH_SYMLINK
            | Self::PATH_REMOVE_DIRECTORY
            | Self::PATH_UNLINK_FILE
            | Self::POLL_FD_READWRITE
    }

    /// Base rights for a socket descriptor.
    pub fn socket_base() -> Self {
        Self::FD_READ
            | Self::FD_WRITE
            | Self::FD_FDSTAT_SET_FLAGS
            | Self::FD_FILESTAT_GET
            | Self::POLL_FD_READWRITE
            | Self::SOCK_SHUTDOWN
            | Self::SOCK_ACCEPT
    }
}

/// The host resource backing one guest descriptor. Owning variants release
/// the native handle on drop; observer variants alias a handle owned
/// elsewhere (the process's stdio, typically) and release nothing.
#[derive(Debug)]
pub enum Resource {
    File(fs::File),
    Dir(fs::File),
    #[cfg(unix)]
    Socket(std::os::fd::OwnedFd),
    #[cfg(windows)]
    Socket(std::os::windows::io::OwnedSocket),
    FileObserver(Pollable),
    SocketObserver(Pollable),
    /// Tombstone state: what remains once a descriptor has been drained by
    /// close or renumber.
    Null,
}

impl Resource {
    pub fn is_dir(&self) -> bool {
        matches!(self, Self::Dir(_))
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// The raw handle the readiness backends watch, if this resource has one.
    #[cfg(unix)]
    pub fn pollable(&self) -> Option<Pollable> {
        use std::os::fd::AsRawFd;
        match self {
            Self::File(f) | Self::Dir(f) => Some(Pollable(f.as_raw_fd())),
            Self::Socket(s) => Some(Pollable(s.as_raw_fd())),
            Self::FileObserver(p) | Self::SocketObserver(p) => Some(*p),
            Self::Null => None,
        }
    }

    #[cfg(windows)]
    pub fn pollable(&self) -> Option<Pollable> {
        use std::os::windows::io::{AsRawHandle, AsRawSocket};
        match self {
            Self::File(f) | Self::Dir(f) => Some(Pollable::Handle(f.as_raw_handle())),
            Self::Socket(s) => Some(Pollable::Socket(s.as_raw_socket())),
            Self::FileObserver(p) | Self::SocketObserver(p) => Some(*p),
            Self::Null => None,
        }
    }
}

/// One open entry in the descriptor table: the backing resource plus the
/// capability mask every operation is checked against.
#[derive(Debug)]
pub struct Descriptor {
    resource: Resource,
    rights: Rights,
}

impl Descriptor {
    pub fn new(resource: Resource, rights: Rights) -> Self {
        Self { resource, rights }
    }

    pub fn resource(&self) -> &Resource {
        &self.resource
    }

    pub fn rights(&self) -> Rights {
        self.rights
    }

    /// The capability check: every table-resolved operation calls this with
    /// the rights it needs before touching the backing resource. Fails with
    /// [`Error::Notcapable`] and mutates nothing.
    pub fn expect_rights(&self, required: Rights) -> Result<()> {
        if self.rights.contains(required) {
            Ok(())
        } else {
            tracing::trace!(
                required = ?required,
                actual = ?self.rights,
                "rights check failed"
            );
            Err(Error::Notcapable)
        }
    }

    /// Shrink the rights mask. Attempting to add rights that are not
    /// currently held fails with [`Error::Notcapable`].
    pub fn limit_rights(&mut self, rights: Rights) -> Result<()> {
        if self.rights.contains(rights) {
            self.rights = rights;
            Ok(())
        } else {
            Err(Error::Notcapable)
        }
    }

    /// Detach the backing resource, leaving the tombstone state behind.
    /// Used by the table's drain step so the native handle can be released
    /// outside any lock.
    pub(crate) fn take_resource(&mut self) -> Resource {
        self.rights = Rights::empty();
        std::mem::replace(&mut self.resource, Resource::Null)
    }
}
