//! Low-level FUSE wire types.
//!
//! This module is the boundary between the kernel's binary protocol and the
//! rest of the crate: the small newtype wrappers below (`INodeNo`,
//! `FileHandle`, `Errno`, ...) are what `Filesystem` trait methods and
//! `Reply*` types actually traffic in, so callers never touch a bare `u64`
//! where a mismatched id would type-check.

use std::num::NonZeroI32;
use std::time::SystemTime;

pub(crate) mod argument;
pub(crate) mod errno;
pub mod flags;
pub mod fuse_abi;
pub(crate) mod ioctl;
pub(crate) mod ioslice_concat;
pub(crate) mod reply;
pub mod request;

pub use request::{Operation, Request, RequestError};

/// The inode number the kernel addresses a file or directory by.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct INodeNo(pub u64);

impl From<u64> for INodeNo {
    fn from(ino: u64) -> Self {
        INodeNo(ino)
    }
}

impl From<INodeNo> for u64 {
    fn from(ino: INodeNo) -> Self {
        ino.0
    }
}

/// The inode generation number returned alongside a `lookup`/`create` entry,
/// used by NFS-style export support to detect inode number reuse.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Generation(pub u64);

/// An opaque handle a filesystem hands back from `open`/`opendir` and the
/// kernel echoes back on every subsequent operation against that open file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FileHandle(pub u64);

impl From<u64> for FileHandle {
    fn from(fh: u64) -> Self {
        FileHandle(fh)
    }
}

impl From<FileHandle> for u64 {
    fn from(fh: FileHandle) -> Self {
        fh.0
    }
}

/// Identifies the owner of a POSIX record lock, stable across `fork`/`dup`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LockOwner(pub u64);

/// The unique id the kernel assigns to a single request, echoed back in its
/// reply header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestId(pub u64);

/// The negotiated FUSE kernel ABI version, `(major, minor)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Version(pub u32, pub u32);

/// Either "use the current time" or an explicit timestamp, as `setattr`'s
/// `atime`/`mtime` arguments distinguish (the kernel can ask for "now" without
/// itself knowing what time it is, to avoid clock skew against the server).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeOrNow {
    SpecificTime(SystemTime),
    Now,
}

/// An error number to hand back to the kernel in a reply's `error` field.
/// Wraps a `NonZeroI32` because a zero error means success, which a reply
/// expresses by not being an error reply at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Errno(pub NonZeroI32);

impl Errno {
    /// Build an `Errno` from a raw `libc`-style errno value. Panics if `e` is
    /// zero, since that isn't an error.
    pub fn from_i32(e: i32) -> Errno {
        Errno(NonZeroI32::new(e).expect("Errno::from_i32(0) is not an error"))
    }

    /// The raw errno value, as passed to `libc` functions.
    pub fn into_i32(self) -> i32 {
        self.0.get()
    }

    /// The raw errno value, as passed to `libc` functions.
    pub(crate) fn code(self) -> i32 {
        self.0.get()
    }
}

macro_rules! errno_consts {
    ($($name:ident),* $(,)?) => {
        impl Errno {
            $(
                #[allow(missing_docs)]
                pub const $name: Errno = Errno(match NonZeroI32::new(libc::$name) {
                    Some(n) => n,
                    None => panic!(concat!("libc::", stringify!($name), " must not be zero")),
                });
            )*
        }
    };
}

errno_consts!(
    EPERM, ENOENT, ESRCH, EINTR, EIO, ENXIO, E2BIG, ENOEXEC, EBADF, ECHILD, EAGAIN, ENOMEM,
    EACCES, EFAULT, ENOTBLK, EBUSY, EEXIST, EXDEV, ENODEV, ENOTDIR, EISDIR, EINVAL, ENFILE,
    EMFILE, ENOTTY, ETXTBSY, EFBIG, ENOSPC, ESPIPE, EROFS, EMLINK, EPIPE, EDOM, ERANGE, EDEADLK,
    ENAMETOOLONG, ENOLCK, ENOSYS, ENOTEMPTY, ELOOP, ENOMSG, EIDRM, ENODATA, ETIME, EOVERFLOW,
    EOPNOTSUPP,
);

/// A POSIX record lock range, as carried by `getlk`/`setlk` replies.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Lock {
    pub range: (u64, u64),
    pub typ: i32,
    pub pid: u32,
}
