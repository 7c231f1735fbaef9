//! Host-syscall layer (the non-`faulty` half of component E).
//!
//! Grounded on `core/operations.py`: every method there resolves an inode to
//! a path via `self.paths[inode]` and calls straight into a host syscall,
//! folding any `OSError` into `FUSEError(exc.errno)`. This module is that
//! same path-based syscall surface, minus the fault injection and bookkeeping
//! that `operations.rs` layers on top.
//!
//! Calls go through `nix` rather than `std::fs`: `std::fs` has no way to ask
//! for `O_NOFOLLOW` semantics on `chown`, no raw `mknod`, and turns every
//! failure into an opaque `io::Error` that's already lost the distinction
//! between "this errno" and "some other errno" by the time it would reach a
//! reply. `nix::Error` preserves the raw errno all the way to
//! [`crate::error::CharybdisError`]. The one gap `nix` leaves is extended
//! attributes, which it dropped from its public API years ago; those four
//! calls go through `libc` directly.

use std::ffi::CString;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::io::RawFd;
use std::path::Path;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use nix::dir::Dir;
use nix::fcntl::{self, OFlag};
use nix::sys::stat::{FileStat, Mode, SFlag};
use nix::sys::statvfs::Statvfs;
use nix::sys::time::TimeSpec;
use nix::sys::uio::{pread, pwrite};
use nix::unistd::{AccessFlags, Gid, Uid};

use crate::error::{CharybdisError, CharybdisResult};

/// `lstat` a path: never follows a trailing symlink, matching
/// `os.stat(target, follow_symlinks=False)` in `_get_attr`.
pub fn lstat(path: &Path) -> CharybdisResult<FileStat> {
    Ok(nix::sys::stat::lstat(path)?)
}

/// `fstat` an already-open descriptor, for attribute lookups on a file held
/// open rather than addressed by path.
pub fn fstat(fd: RawFd) -> CharybdisResult<FileStat> {
    Ok(nix::sys::stat::fstat(fd)?)
}

/// `open(2)` a path with the given flags and mode, returning the raw host
/// descriptor. Callers are responsible for eventually `close`ing it via the
/// descriptor map's refcounting.
pub fn open(path: &Path, flags: OFlag, mode: Mode) -> CharybdisResult<RawFd> {
    Ok(fcntl::open(path, flags, mode)?)
}

/// `close(2)` a host descriptor.
pub fn close(fd: RawFd) -> CharybdisResult<()> {
    Ok(nix::unistd::close(fd)?)
}

/// `dup(2)` a descriptor and immediately `close(2)` the duplicate, matching
/// `os.close(os.dup(fd))` in `flush`. The real `fd` is left open (it's
/// released later via `release`); closing a dup of it is the standard way to
/// force the kernel to run its close-time writeback/error-reporting path
/// without giving up the caller's own reference.
pub fn dup_and_close(fd: RawFd) -> CharybdisResult<()> {
    let dup_fd = nix::unistd::dup(fd)?;
    close(dup_fd)
}

/// Positioned read, matching `os.lseek` + `os.read` in `read`.
pub fn read_at(fd: RawFd, buf: &mut [u8], offset: i64) -> CharybdisResult<usize> {
    Ok(pread(fd, buf, offset)?)
}

/// Positioned write, matching `os.lseek` + `os.write` in `write`.
pub fn write_at(fd: RawFd, buf: &[u8], offset: i64) -> CharybdisResult<usize> {
    Ok(pwrite(fd, buf, offset)?)
}

/// `fsync(2)` or `fdatasync(2)`, matching `fsync`/`fsyncdir`.
pub fn fsync(fd: RawFd, datasync: bool) -> CharybdisResult<()> {
    if datasync {
        Ok(nix::unistd::fdatasync(fd)?)
    } else {
        Ok(nix::unistd::fsync(fd)?)
    }
}

/// `mkdir(2)`.
pub fn mkdir(path: &Path, mode: Mode) -> CharybdisResult<()> {
    Ok(nix::unistd::mkdir(path, mode)?)
}

/// `unlink(2)`, matching `unlink`.
pub fn unlink(path: &Path) -> CharybdisResult<()> {
    Ok(nix::unistd::unlink(path)?)
}

/// `rmdir(2)`, matching `rmdir`.
pub fn rmdir(path: &Path) -> CharybdisResult<()> {
    Ok(nix::unistd::rmdir(path)?)
}

/// `symlink(2)`: `nix` only exposes the `*at` form, so both `dirfd`s are
/// `None` (`AT_FDCWD`) since every path this engine deals with is absolute.
pub fn symlink(target: &Path, link_path: &Path) -> CharybdisResult<()> {
    Ok(nix::unistd::symlinkat(target, None, link_path)?)
}

/// `readlink(2)`, matching `os.readlink` in `readlink`.
pub fn readlink(path: &Path) -> CharybdisResult<std::path::PathBuf> {
    Ok(nix::unistd::readlink(path)?)
}

/// `rename(2)` with no flags, matching `rename`'s `flags` rejection above
/// this call (CharybdisFS never passes a nonzero `RenameFlags` through).
pub fn rename(old_path: &Path, new_path: &Path) -> CharybdisResult<()> {
    Ok(fcntl::renameat(None, old_path, None, new_path)?)
}

/// `link(2)` with no symlink-follow, matching `os.link(..., follow_symlinks=False)`.
pub fn link(existing: &Path, new_path: &Path) -> CharybdisResult<()> {
    Ok(nix::unistd::linkat(
        None,
        existing,
        None,
        new_path,
        nix::unistd::LinkatFlags::NoSymlinkFollow,
    )?)
}

/// `chmod(2)`, matching `os.chmod` in `setattr`.
pub fn chmod(path: &Path, mode: Mode) -> CharybdisResult<()> {
    Ok(nix::sys::stat::fchmodat(
        None,
        path,
        mode,
        nix::sys::stat::FchmodatFlags::FollowSymlink,
    )?)
}

/// `chown(2)` without following a trailing symlink, matching
/// `os.chown(..., follow_symlinks=False)`. Either id may be left unchanged by
/// passing `None`.
pub fn chown(path: &Path, uid: Option<u32>, gid: Option<u32>) -> CharybdisResult<()> {
    Ok(nix::unistd::fchownat(
        None,
        path,
        uid.map(Uid::from_raw),
        gid.map(Gid::from_raw),
        fcntl::AtFlags::AT_SYMLINK_NOFOLLOW,
    )?)
}

/// `truncate(2)`, matching `os.truncate` in `setattr`.
pub fn truncate(path: &Path, length: i64) -> CharybdisResult<()> {
    Ok(nix::unistd::truncate(path, length)?)
}

/// `ftruncate(2)`, used when `setattr` targets an already-open file handle
/// rather than a path.
pub fn ftruncate(fd: RawFd, length: i64) -> CharybdisResult<()> {
    Ok(nix::unistd::ftruncate(fd, length)?)
}

/// `utimensat(2)`, matching `os.utime(..., ns=(atime_ns, mtime_ns))` in
/// `setattr`. `None` for either timestamp means "leave unchanged"
/// (`UTIME_OMIT`); `follow` mirrors `setattr`'s `follow_symlinks=fh is not None`.
pub fn set_times(
    path: &Path,
    atime: Option<SystemTime>,
    mtime: Option<SystemTime>,
    follow: bool,
) -> CharybdisResult<()> {
    let flag = if follow {
        nix::sys::stat::UtimensatFlags::FollowSymlink
    } else {
        nix::sys::stat::UtimensatFlags::NoFollowSymlink
    };
    Ok(nix::sys::stat::utimensat(
        None,
        path,
        &time_spec_or_omit(atime),
        &time_spec_or_omit(mtime),
        flag,
    )?)
}

fn time_spec_or_omit(time: Option<SystemTime>) -> TimeSpec {
    match time {
        None => TimeSpec::UTIME_OMIT,
        Some(t) => {
            let since_epoch = t
                .duration_since(UNIX_EPOCH)
                .unwrap_or(Duration::from_secs(0));
            TimeSpec::new(since_epoch.as_secs() as i64, since_epoch.subsec_nanos() as i64)
        }
    }
}

/// `statvfs(2)`, matching `statfs`.
pub fn statvfs(path: &Path) -> CharybdisResult<Statvfs> {
    Ok(nix::sys::statvfs::statvfs(path)?)
}

/// `mknod(2)` plus the `chown` to the caller's ids, matching `mknod`.
pub fn mknod(path: &Path, kind: SFlag, mode: Mode, dev: u64, uid: u32, gid: u32) -> CharybdisResult<()> {
    nix::sys::stat::mknod(path, kind, mode, dev)?;
    chown(path, Some(uid), Some(gid))
}

/// `access(2)`, matching `os.access` in `access`.
pub fn access(path: &Path, mode: AccessFlags) -> CharybdisResult<()> {
    Ok(nix::unistd::access(path, mode)?)
}

/// Opens a directory for enumeration, used by `readdir`/`readdirplus`.
/// `nix::dir::Dir` is used instead of `std::fs::read_dir` so a later refactor
/// can switch to the fd-relative form without changing the call site, and so
/// enumeration failures surface as the same `nix::Error` the rest of this
/// module propagates rather than `std::io::Error`'s looser errno mapping.
pub fn open_dir(path: &Path) -> CharybdisResult<Dir> {
    Ok(Dir::open(path, OFlag::O_RDONLY | OFlag::O_DIRECTORY, Mode::empty())?)
}

fn path_to_cstring(path: &Path) -> CharybdisResult<CString> {
    CString::new(path.as_os_str().as_bytes()).map_err(|_| {
        CharybdisError::Invariant(format!("path {path:?} contains an interior NUL byte"))
    })
}

fn last_os_error() -> CharybdisError {
    CharybdisError::Io(std::io::Error::last_os_error())
}

/// `lgetxattr(2)`, matching `pyfuse3.getxattr` (which never follows
/// symlinks). `buf` is sized by the caller from a prior zero-length probe
/// call, same two-step protocol `getxattr`'s FUSE reply uses.
pub fn getxattr(path: &Path, name: &std::ffi::OsStr, buf: &mut [u8]) -> CharybdisResult<usize> {
    let path = path_to_cstring(path)?;
    let name = CString::new(name.as_bytes())
        .map_err(|_| CharybdisError::Invariant(format!("xattr name {name:?} contains a NUL byte")))?;
    let ret = unsafe {
        libc::lgetxattr(
            path.as_ptr(),
            name.as_ptr(),
            buf.as_mut_ptr() as *mut libc::c_void,
            buf.len(),
        )
    };
    if ret < 0 {
        return Err(last_os_error());
    }
    Ok(ret as usize)
}

/// `lsetxattr(2)`, matching `pyfuse3.setxattr`.
pub fn setxattr(path: &Path, name: &std::ffi::OsStr, value: &[u8], flags: i32) -> CharybdisResult<()> {
    let path = path_to_cstring(path)?;
    let name = CString::new(name.as_bytes())
        .map_err(|_| CharybdisError::Invariant(format!("xattr name {name:?} contains a NUL byte")))?;
    let ret = unsafe {
        libc::lsetxattr(
            path.as_ptr(),
            name.as_ptr(),
            value.as_ptr() as *const libc::c_void,
            value.len(),
            flags,
        )
    };
    if ret < 0 {
        return Err(last_os_error());
    }
    Ok(())
}

/// `llistxattr(2)`, matching `os.listxattr(..., follow_symlinks=False)` in
/// `listxattr`. Returns the raw NUL-separated name list the kernel expects.
pub fn listxattr(path: &Path, buf: &mut [u8]) -> CharybdisResult<usize> {
    let path = path_to_cstring(path)?;
    let ret = unsafe {
        libc::llistxattr(path.as_ptr(), buf.as_mut_ptr() as *mut libc::c_char, buf.len())
    };
    if ret < 0 {
        return Err(last_os_error());
    }
    Ok(ret as usize)
}

/// `lremovexattr(2)`, matching `removexattr`.
pub fn removexattr(path: &Path, name: &std::ffi::OsStr) -> CharybdisResult<()> {
    let path = path_to_cstring(path)?;
    let name = CString::new(name.as_bytes())
        .map_err(|_| CharybdisError::Invariant(format!("xattr name {name:?} contains a NUL byte")))?;
    let ret = unsafe { libc::lremovexattr(path.as_ptr(), name.as_ptr()) };
    if ret < 0 {
        return Err(last_os_error());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn lstat_reports_regular_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("f");
        fs::write(&path, b"hi").unwrap();
        let st = lstat(&path).unwrap();
        assert_eq!(st.st_size, 2);
    }

    #[test]
    fn lstat_missing_file_is_enoent() {
        let dir = tempdir().unwrap();
        let err = lstat(&dir.path().join("nope")).unwrap_err();
        assert_eq!(err.errno().into_i32(), libc::ENOENT);
    }

    #[test]
    fn write_then_read_round_trips() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("f");
        let fd = open(
            &path,
            OFlag::O_RDWR | OFlag::O_CREAT,
            Mode::from_bits_truncate(0o644),
        )
        .unwrap();
        let written = write_at(fd, b"hello", 0).unwrap();
        assert_eq!(written, 5);
        let mut buf = [0u8; 5];
        let read = read_at(fd, &mut buf, 0).unwrap();
        assert_eq!(read, 5);
        assert_eq!(&buf, b"hello");
        close(fd).unwrap();
    }

    #[test]
    fn mkdir_rmdir_round_trip() {
        let dir = tempdir().unwrap();
        let sub = dir.path().join("sub");
        mkdir(&sub, Mode::from_bits_truncate(0o755)).unwrap();
        assert!(sub.is_dir());
        rmdir(&sub).unwrap();
        assert!(!sub.exists());
    }

    #[test]
    fn symlink_and_readlink_round_trip() {
        let dir = tempdir().unwrap();
        let target = dir.path().join("target");
        fs::write(&target, b"x").unwrap();
        let link_path = dir.path().join("link");
        symlink(&target, &link_path).unwrap();
        let resolved = readlink(&link_path).unwrap();
        assert_eq!(resolved, target);
    }

    #[test]
    fn xattr_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("f");
        fs::write(&path, b"hi").unwrap();
        let name = std::ffi::OsStr::new("user.charybdis.test");
        if setxattr(&path, name, b"value", 0).is_err() {
            // Extended attributes aren't supported on every filesystem a CI
            // runner's temp dir might be backed by; skip rather than fail.
            return;
        }
        let mut buf = vec![0u8; 16];
        let n = getxattr(&path, name, &mut buf).unwrap();
        assert_eq!(&buf[..n], b"value");
        removexattr(&path, name).unwrap();
        assert!(getxattr(&path, name, &mut buf).is_err());
    }

    #[test]
    fn rename_moves_file() {
        let dir = tempdir().unwrap();
        let old_path = dir.path().join("old");
        let new_path = dir.path().join("new");
        fs::write(&old_path, b"x").unwrap();
        rename(&old_path, &new_path).unwrap();
        assert!(!old_path.exists());
        assert!(new_path.exists());
    }
}
