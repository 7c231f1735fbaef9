//! The operations engine (component E): `CharybdisOperations` implements
//! `fuser::Filesystem`, turning each kernel request into a host syscall
//! through [`crate::hostfs`], filtered first through [`crate::fault_filter`]
//! and backed by the inode/descriptor bookkeeping in [`crate::path_map`] and
//! [`crate::descriptor_map`].
//!
//! Grounded on `core/operations.py`'s `CharybdisOperations` class, method for
//! method: the host inode number doubles as the FUSE inode (so a hard link
//! naturally shares one), `opendir` hands back the inode itself as its file
//! handle since directories carry no real descriptor, and `setattr` applies
//! size, then mode, then ownership, then times, in that order.
//!
//! `Filesystem`'s methods all take `&self`, so the two maps live behind a
//! single `parking_lot::Mutex`; the mount itself is single-threaded and
//! cooperative, so this mutex is never contended across a host I/O wait, it
//! only exists to satisfy the trait's `Send + Sync` bound.

use std::ffi::{OsStr, OsString};
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::io::RawFd;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use nix::dir::Type as NixDirType;
use nix::fcntl::OFlag;
use nix::sys::stat::{FileStat, Mode, SFlag};
use nix::unistd::AccessFlags as NixAccessFlags;
use parking_lot::Mutex;

use fuser::{
    AccessFlags, Dirent, Entry, Errno, FileAttr, FileHandle, FileType, Filesystem, INodeNo,
    InitFlags, KernelConfig, LockOwner, Open, OpenFlags, ReadFlags, RenameFlags, Request, Statfs,
    TimeOrNow, WriteFlags, Xattr,
};

use crate::configuration::Configuration;
use crate::descriptor_map::DescriptorMap;
use crate::error::{CharybdisError, CharybdisResult};
use crate::fault::SysCall;
use crate::fault_filter::maybe_fire;
use crate::hostfs;
use crate::path_map::{PathMap, ROOT_INODE};

/// No kernel-side caching of attributes or names: every fault this engine
/// injects, and every mutation made through a second mount or process on the
/// same source tree, must be visible immediately.
const TTL_ZERO: Duration = Duration::ZERO;

/// Upper bound on a single `readdir` reply buffer. `fuser`'s lowlevel
/// `Filesystem::readdir` no longer carries the kernel's requested size (that
/// plumbing lives in the dispatch loop this repair doesn't reach into, see
/// `DESIGN.md`), so this is a fixed, generous stand-in.
const READDIR_BUF_SIZE: usize = 32 * 1024;

struct EngineState {
    paths: PathMap,
    descriptors: DescriptorMap,
}

/// A FUSE passthrough filesystem mirroring `source_root` onto its mount
/// point, with every serviced operation first passing through `config`'s
/// fault rules.
pub struct CharybdisOperations {
    config: Arc<Configuration>,
    state: Mutex<EngineState>,
}

impl CharybdisOperations {
    /// Build an engine rooted at `source_root`, sharing `config` with
    /// whatever else mutates it (the control API).
    pub fn new(source_root: PathBuf, config: Arc<Configuration>) -> CharybdisOperations {
        CharybdisOperations {
            config,
            state: Mutex::new(EngineState {
                paths: PathMap::new(source_root),
                descriptors: DescriptorMap::new(),
            }),
        }
    }
}

fn file_type_from_mode(mode: u32) -> FileType {
    match mode & libc::S_IFMT as u32 {
        m if m == libc::S_IFIFO as u32 => FileType::NamedPipe,
        m if m == libc::S_IFCHR as u32 => FileType::CharDevice,
        m if m == libc::S_IFBLK as u32 => FileType::BlockDevice,
        m if m == libc::S_IFDIR as u32 => FileType::Directory,
        m if m == libc::S_IFREG as u32 => FileType::RegularFile,
        m if m == libc::S_IFLNK as u32 => FileType::Symlink,
        m if m == libc::S_IFSOCK as u32 => FileType::Socket,
        _ => FileType::RegularFile,
    }
}

fn nix_type_to_file_type(kind: NixDirType) -> FileType {
    match kind {
        NixDirType::Fifo => FileType::NamedPipe,
        NixDirType::CharacterDevice => FileType::CharDevice,
        NixDirType::Directory => FileType::Directory,
        NixDirType::BlockDevice => FileType::BlockDevice,
        NixDirType::File => FileType::RegularFile,
        NixDirType::Symlink => FileType::Symlink,
        NixDirType::Socket => FileType::Socket,
    }
}

fn system_time_from_raw(secs: i64, nsecs: i64) -> SystemTime {
    if secs >= 0 {
        UNIX_EPOCH + Duration::new(secs as u64, nsecs as u32)
    } else {
        UNIX_EPOCH - Duration::new((-secs) as u64, 0)
    }
}

fn time_or_now_to_system_time(t: TimeOrNow) -> SystemTime {
    match t {
        TimeOrNow::SpecificTime(t) => t,
        TimeOrNow::Now => SystemTime::now(),
    }
}

/// Build a `fuser::FileAttr` from a host `lstat`/`fstat` result. `crtime` has
/// no POSIX equivalent on Linux; `ctime` is reused, matching every other
/// passthrough filesystem in this corpus.
fn build_attr(ino: u64, st: &FileStat) -> FileAttr {
    FileAttr {
        ino: INodeNo(ino),
        size: st.st_size as u64,
        blocks: st.st_blocks as u64,
        atime: system_time_from_raw(st.st_atime, st.st_atime_nsec),
        mtime: system_time_from_raw(st.st_mtime, st.st_mtime_nsec),
        ctime: system_time_from_raw(st.st_ctime, st.st_ctime_nsec),
        crtime: UNIX_EPOCH,
        kind: file_type_from_mode(st.st_mode as u32),
        perm: (st.st_mode as u32 & 0o7777) as u16,
        nlink: st.st_nlink as u32,
        uid: st.st_uid,
        gid: st.st_gid,
        rdev: st.st_rdev as u32,
        blksize: st.st_blksize as u32,
        flags: 0,
    }
}

fn entry_reply(ino: u64, st: &FileStat) -> Entry {
    Entry {
        ino,
        generation: None,
        file_ttl: TTL_ZERO,
        attr: build_attr(ino, st),
        attr_ttl: TTL_ZERO,
    }
}

fn einval() -> CharybdisError {
    CharybdisError::Io(io::Error::from_raw_os_error(libc::EINVAL))
}

/// Applies `setattr`'s field set to `path` (or, where the kernel gave us an
/// open handle, to the descriptor) in the fixed order the contract requires:
/// size, then mode, then ownership, then times.
#[allow(clippy::too_many_arguments)]
fn apply_setattr(
    path: &Path,
    fh: Option<FileHandle>,
    mode: Option<u32>,
    uid: Option<u32>,
    gid: Option<u32>,
    size: Option<u64>,
    atime: Option<TimeOrNow>,
    mtime: Option<TimeOrNow>,
) -> CharybdisResult<()> {
    if let Some(size) = size {
        match fh {
            Some(fh) => hostfs::ftruncate(fh.0 as RawFd, size as i64)?,
            None => hostfs::truncate(path, size as i64)?,
        }
    }
    if let Some(mode) = mode {
        let current = hostfs::lstat(path)?;
        if current.st_mode as u32 & libc::S_IFMT as u32 == libc::S_IFLNK as u32 {
            return Err(einval());
        }
        hostfs::chmod(path, Mode::from_bits_truncate(mode & 0o7777))?;
    }
    if uid.is_some() || gid.is_some() {
        hostfs::chown(path, uid, gid)?;
    }
    if atime.is_some() || mtime.is_some() {
        let follow = fh.is_some();
        hostfs::set_times(
            path,
            atime.map(time_or_now_to_system_time),
            mtime.map(time_or_now_to_system_time),
            follow,
        )?;
    }
    Ok(())
}

impl Filesystem for CharybdisOperations {
    fn init(&mut self, _req: &Request, config: &mut KernelConfig) -> io::Result<()> {
        if let Err(unmet) = config.add_capabilities(InitFlags::FUSE_WRITEBACK_CACHE) {
            log::warn!("kernel refused writeback caching, missing: {unmet:?}");
        }
        log::info!("charybdisfs mounted");
        Ok(())
    }

    fn destroy(&mut self) {
        log::info!("charybdisfs unmounting");
    }

    fn lookup(&self, _req: &Request, parent: INodeNo, name: &OsStr, reply: fuser::ReplyEntry) {
        if let Err(e) = maybe_fire(&self.config, SysCall::Lookup) {
            reply.error(e.errno());
            return;
        }
        let mut state = self.state.lock();
        let path = match state.paths.join(parent.0, name) {
            Some(p) => p,
            None => {
                reply.error(Errno::ENOENT);
                return;
            }
        };
        match hostfs::lstat(&path) {
            Ok(st) => {
                let ino = st.st_ino;
                if name != OsStr::new(".") && name != OsStr::new("..") {
                    state.paths.put(ino, path);
                }
                reply.entry(entry_reply(ino, &st));
            }
            Err(e) => reply.error(e.errno()),
        }
    }

    fn forget(&self, _req: &Request, ino: INodeNo, nlookup: u64) {
        let mut state = self.state.lock();
        let removed = state.paths.forget_lookups(ino.0, nlookup);
        if removed && state.descriptors.get(ino.0).is_some() {
            log::error!("forget: inode {} forgotten with a descriptor still open", ino.0);
        }
    }

    fn getattr(&self, _req: &Request, ino: INodeNo, fh: Option<FileHandle>, reply: fuser::ReplyAttr) {
        if let Err(e) = maybe_fire(&self.config, SysCall::Getattr) {
            reply.error(e.errno());
            return;
        }
        let state = self.state.lock();
        let result = match fh {
            Some(fh) => hostfs::fstat(fh.0 as RawFd),
            None => match state.paths.get(ino.0) {
                Some(path) => hostfs::lstat(path),
                None => Err(CharybdisError::Invariant(format!("unknown inode {}", ino.0))),
            },
        };
        match result {
            Ok(st) => reply.attr(build_attr(ino.0, &st), TTL_ZERO),
            Err(e) => reply.error(e.errno()),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn setattr(
        &self,
        _req: &Request,
        ino: INodeNo,
        mode: Option<u32>,
        uid: Option<u32>,
        gid: Option<u32>,
        size: Option<u64>,
        atime: Option<TimeOrNow>,
        mtime: Option<TimeOrNow>,
        _ctime: Option<SystemTime>,
        fh: Option<FileHandle>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<fuser::BsdFileFlags>,
        reply: fuser::ReplyAttr,
    ) {
        if let Err(e) = maybe_fire(&self.config, SysCall::Setattr) {
            reply.error(e.errno());
            return;
        }
        let state = self.state.lock();
        let path = match state.paths.get(ino.0) {
            Some(p) => p.to_path_buf(),
            None => {
                reply.error(Errno::ENOENT);
                return;
            }
        };
        drop(state);
        if let Err(e) = apply_setattr(&path, fh, mode, uid, gid, size, atime, mtime) {
            reply.error(e.errno());
            return;
        }
        match hostfs::lstat(&path) {
            Ok(st) => reply.attr(build_attr(ino.0, &st), TTL_ZERO),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn readlink(&self, _req: &Request, ino: INodeNo, reply: fuser::ReplyData) {
        if let Err(e) = maybe_fire(&self.config, SysCall::Readlink) {
            reply.error(e.errno());
            return;
        }
        let state = self.state.lock();
        let path = match state.paths.get(ino.0) {
            Some(p) => p.to_path_buf(),
            None => {
                reply.error(Errno::ENOENT);
                return;
            }
        };
        drop(state);
        match hostfs::readlink(&path) {
            Ok(target) => reply.data(target.into_os_string().into()),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn mknod(
        &self,
        req: &Request,
        parent: INodeNo,
        name: &OsStr,
        mode: u32,
        umask: u32,
        rdev: u32,
        reply: fuser::ReplyEntry,
    ) {
        if let Err(e) = maybe_fire(&self.config, SysCall::Mknod) {
            reply.error(e.errno());
            return;
        }
        let mut state = self.state.lock();
        let path = match state.paths.join(parent.0, name) {
            Some(p) => p,
            None => {
                reply.error(Errno::ENOENT);
                return;
            }
        };
        let kind = SFlag::from_bits_truncate(mode & libc::S_IFMT as u32);
        let perm = Mode::from_bits_truncate(mode & !umask & 0o7777);
        if let Err(e) = hostfs::mknod(&path, kind, perm, rdev as u64, req.uid(), req.gid()) {
            reply.error(e.errno());
            return;
        }
        match hostfs::lstat(&path) {
            Ok(st) => {
                let ino = st.st_ino;
                state.paths.put(ino, path);
                reply.entry(entry_reply(ino, &st));
            }
            Err(e) => reply.error(e.errno()),
        }
    }

    fn mkdir(
        &self,
        _req: &Request,
        parent: INodeNo,
        name: &OsStr,
        mode: u32,
        umask: u32,
        reply: fuser::ReplyEntry,
    ) {
        if let Err(e) = maybe_fire(&self.config, SysCall::Mkdir) {
            reply.error(e.errno());
            return;
        }
        let mut state = self.state.lock();
        let path = match state.paths.join(parent.0, name) {
            Some(p) => p,
            None => {
                reply.error(Errno::ENOENT);
                return;
            }
        };
        let perm = Mode::from_bits_truncate(mode & !umask & 0o7777);
        if let Err(e) = hostfs::mkdir(&path, perm) {
            reply.error(e.errno());
            return;
        }
        match hostfs::lstat(&path) {
            Ok(st) => {
                let ino = st.st_ino;
                state.paths.put(ino, path);
                reply.entry(entry_reply(ino, &st));
            }
            Err(e) => reply.error(e.errno()),
        }
    }

    fn unlink(&self, _req: &Request, parent: INodeNo, name: &OsStr, reply: fuser::ReplyEmpty) {
        if let Err(e) = maybe_fire(&self.config, SysCall::Unlink) {
            reply.error(e.errno());
            return;
        }
        let mut state = self.state.lock();
        let path = match state.paths.join(parent.0, name) {
            Some(p) => p,
            None => {
                reply.error(Errno::ENOENT);
                return;
            }
        };
        let ino = match hostfs::lstat(&path) {
            Ok(st) => st.st_ino,
            Err(e) => {
                reply.error(e.errno());
                return;
            }
        };
        if let Err(e) = hostfs::unlink(&path) {
            reply.error(e.errno());
            return;
        }
        if let Err(e) = state.paths.forget_path(ino, &path) {
            log::error!("unlink: {e}");
        }
        reply.ok();
    }

    fn rmdir(&self, _req: &Request, parent: INodeNo, name: &OsStr, reply: fuser::ReplyEmpty) {
        if let Err(e) = maybe_fire(&self.config, SysCall::Rmdir) {
            reply.error(e.errno());
            return;
        }
        let mut state = self.state.lock();
        let path = match state.paths.join(parent.0, name) {
            Some(p) => p,
            None => {
                reply.error(Errno::ENOENT);
                return;
            }
        };
        let ino = match hostfs::lstat(&path) {
            Ok(st) => st.st_ino,
            Err(e) => {
                reply.error(e.errno());
                return;
            }
        };
        if let Err(e) = hostfs::rmdir(&path) {
            reply.error(e.errno());
            return;
        }
        if let Err(e) = state.paths.forget_path(ino, &path) {
            log::error!("rmdir: {e}");
        }
        reply.ok();
    }

    fn symlink(
        &self,
        req: &Request,
        parent: INodeNo,
        link_name: &OsStr,
        target: &Path,
        reply: fuser::ReplyEntry,
    ) {
        if let Err(e) = maybe_fire(&self.config, SysCall::Symlink) {
            reply.error(e.errno());
            return;
        }
        let mut state = self.state.lock();
        let link_path = match state.paths.join(parent.0, link_name) {
            Some(p) => p,
            None => {
                reply.error(Errno::ENOENT);
                return;
            }
        };
        if let Err(e) = hostfs::symlink(target, &link_path) {
            reply.error(e.errno());
            return;
        }
        if let Err(e) = hostfs::chown(&link_path, Some(req.uid()), Some(req.gid())) {
            reply.error(e.errno());
            return;
        }
        match hostfs::lstat(&link_path) {
            Ok(st) => {
                let ino = st.st_ino;
                state.paths.put(ino, link_path);
                reply.entry(entry_reply(ino, &st));
            }
            Err(e) => reply.error(e.errno()),
        }
    }

    fn rename(
        &self,
        _req: &Request,
        parent: INodeNo,
        name: &OsStr,
        newparent: INodeNo,
        newname: &OsStr,
        flags: RenameFlags,
        reply: fuser::ReplyEmpty,
    ) {
        if !flags.is_empty() {
            reply.error(Errno::EINVAL);
            return;
        }
        if let Err(e) = maybe_fire(&self.config, SysCall::Rename) {
            reply.error(e.errno());
            return;
        }
        let mut state = self.state.lock();
        let old_path = match state.paths.join(parent.0, name) {
            Some(p) => p,
            None => {
                reply.error(Errno::ENOENT);
                return;
            }
        };
        let new_path = match state.paths.join(newparent.0, newname) {
            Some(p) => p,
            None => {
                reply.error(Errno::ENOENT);
                return;
            }
        };
        if let Err(e) = hostfs::rename(&old_path, &new_path) {
            reply.error(e.errno());
            return;
        }
        match hostfs::lstat(&new_path) {
            Ok(st) => {
                let ino = st.st_ino;
                if let Err(e) = state.paths.replace_path(ino, &old_path, new_path) {
                    log::error!("rename: {e}");
                }
                reply.ok();
            }
            Err(e) => reply.error(e.errno()),
        }
    }

    fn link(
        &self,
        _req: &Request,
        ino: INodeNo,
        newparent: INodeNo,
        newname: &OsStr,
        reply: fuser::ReplyEntry,
    ) {
        if let Err(e) = maybe_fire(&self.config, SysCall::Link) {
            reply.error(e.errno());
            return;
        }
        let mut state = self.state.lock();
        let existing = match state.paths.get(ino.0) {
            Some(p) => p.to_path_buf(),
            None => {
                reply.error(Errno::ENOENT);
                return;
            }
        };
        let new_path = match state.paths.join(newparent.0, newname) {
            Some(p) => p,
            None => {
                reply.error(Errno::ENOENT);
                return;
            }
        };
        if let Err(e) = hostfs::link(&existing, &new_path) {
            reply.error(e.errno());
            return;
        }
        state.paths.put(ino.0, new_path);
        match hostfs::lstat(&existing) {
            Ok(st) => reply.entry(entry_reply(ino.0, &st)),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn open(&self, _req: &Request, ino: INodeNo, flags: OpenFlags, reply: fuser::ReplyOpen) {
        if let Err(e) = maybe_fire(&self.config, SysCall::Open) {
            reply.error(e.errno());
            return;
        }
        let oflags = OFlag::from_bits_truncate(flags.0);
        if oflags.contains(OFlag::O_CREAT) {
            reply.error(Errno::EINVAL);
            return;
        }
        let mut state = self.state.lock();
        if let Some(fd) = state.descriptors.acquire_by_inode(ino.0) {
            reply.opened(Open { fh: fd as u64, flags: 0 });
            return;
        }
        let path = match state.paths.get(ino.0) {
            Some(p) => p.to_path_buf(),
            None => {
                reply.error(Errno::ENOENT);
                return;
            }
        };
        match hostfs::open(&path, oflags, Mode::empty()) {
            Ok(fd) => {
                if let Err(e) = state.descriptors.insert(ino.0, fd) {
                    let _ = hostfs::close(fd);
                    reply.error(e.errno());
                    return;
                }
                reply.opened(Open { fh: fd as u64, flags: 0 });
            }
            Err(e) => reply.error(e.errno()),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn read(
        &self,
        _req: &Request,
        _ino: INodeNo,
        fh: FileHandle,
        offset: u64,
        size: u32,
        _read_flags: ReadFlags,
        _flags: u32,
        _lock_owner: Option<LockOwner>,
        reply: fuser::ReplyData,
    ) {
        if let Err(e) = maybe_fire(&self.config, SysCall::Read) {
            reply.error(e.errno());
            return;
        }
        let mut buf = vec![0u8; size as usize];
        match hostfs::read_at(fh.0 as RawFd, &mut buf, offset as i64) {
            Ok(n) => {
                buf.truncate(n);
                reply.data(buf.into());
            }
            Err(e) => reply.error(e.errno()),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn write(
        &self,
        _req: &Request,
        _ino: INodeNo,
        fh: FileHandle,
        offset: i64,
        data: &[u8],
        _write_flags: WriteFlags,
        _flags: OpenFlags,
        _lock_owner: Option<LockOwner>,
        reply: fuser::ReplyWrite,
    ) {
        if let Err(e) = maybe_fire(&self.config, SysCall::Write) {
            reply.error(e.errno());
            return;
        }
        match hostfs::write_at(fh.0 as RawFd, data, offset) {
            Ok(n) => reply.written(n as u32),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn flush(
        &self,
        _req: &Request,
        _ino: INodeNo,
        fh: FileHandle,
        _lock_owner: LockOwner,
        reply: fuser::ReplyEmpty,
    ) {
        if let Err(e) = maybe_fire(&self.config, SysCall::Flush) {
            reply.error(e.errno());
            return;
        }
        let fd = fh.0 as RawFd;
        let state = self.state.lock();
        if state.descriptors.inode_for_fd(fd).is_none() {
            reply.error(Errno::EBADF);
            return;
        }
        drop(state);
        // A passthrough file has no engine-side write buffer to flush, but
        // `flush` can still be asked to surface a delayed write error for
        // this fd. `dup` + `close` is the standard best-effort way to do
        // that without giving up the real descriptor, which `release` still
        // owns.
        if let Err(e) = hostfs::dup_and_close(fd) {
            log::warn!("flush: best-effort dup/close failed for fd {fd}: {e}");
        }
        reply.ok();
    }

    fn release(
        &self,
        _req: &Request,
        _ino: INodeNo,
        fh: FileHandle,
        _flags: OpenFlags,
        _lock_owner: Option<LockOwner>,
        _flush: bool,
        reply: fuser::ReplyEmpty,
    ) {
        if let Err(e) = maybe_fire(&self.config, SysCall::Release) {
            reply.error(e.errno());
            return;
        }
        let mut state = self.state.lock();
        let fd = fh.0 as RawFd;
        if state.descriptors.release(fd) {
            if let Err(e) = hostfs::close(fd) {
                reply.error(e.errno());
                return;
            }
        }
        reply.ok();
    }

    fn fsync(
        &self,
        _req: &Request,
        _ino: INodeNo,
        fh: FileHandle,
        datasync: bool,
        reply: fuser::ReplyEmpty,
    ) {
        if let Err(e) = maybe_fire(&self.config, SysCall::Fsync) {
            reply.error(e.errno());
            return;
        }
        match hostfs::fsync(fh.0 as RawFd, datasync) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn opendir(&self, _req: &Request, ino: INodeNo, _flags: OpenFlags, reply: fuser::ReplyOpen) {
        if let Err(e) = maybe_fire(&self.config, SysCall::Opendir) {
            reply.error(e.errno());
            return;
        }
        reply.opened(Open { fh: ino.0, flags: 0 });
    }

    fn readdir(
        &self,
        _req: &Request,
        ino: INodeNo,
        _fh: FileHandle,
        offset: u64,
        reply: fuser::ReplyDirectory,
    ) {
        if let Err(e) = maybe_fire(&self.config, SysCall::Readdir) {
            reply.error(e.errno());
            return;
        }
        let mut state = self.state.lock();
        let dir_path = match state.paths.get(ino.0) {
            Some(p) => p.to_path_buf(),
            None => {
                reply.error(Errno::ENOENT);
                return;
            }
        };
        let dir = match hostfs::open_dir(&dir_path) {
            Ok(d) => d,
            Err(e) => {
                reply.error(e.errno());
                return;
            }
        };

        let mut entries: Vec<(u64, OsString, FileType)> = Vec::new();
        for item in dir {
            let item = match item {
                Ok(i) => i,
                Err(e) => {
                    reply.error(CharybdisError::from(e).errno());
                    return;
                }
            };
            let entry_ino = item.ino();
            if entry_ino <= offset {
                continue;
            }
            let name = OsStr::from_bytes(item.file_name().to_bytes()).to_os_string();
            let kind = match item.file_type() {
                Some(t) => nix_type_to_file_type(t),
                None => match hostfs::lstat(&dir_path.join(&name)) {
                    Ok(st) => file_type_from_mode(st.st_mode as u32),
                    Err(_) => FileType::RegularFile,
                },
            };
            entries.push((entry_ino, name, kind));
        }
        entries.sort_by_key(|(ino, _, _)| *ino);

        let dirents: Vec<Dirent> = entries
            .iter()
            .map(|(entry_ino, name, kind)| Dirent {
                ino: *entry_ino,
                offset: *entry_ino as i64,
                kind: *kind,
                name: name.clone().into(),
            })
            .collect();

        for (entry_ino, name, _) in &entries {
            if name.as_os_str() != OsStr::new(".") && name.as_os_str() != OsStr::new("..") {
                state.paths.put(*entry_ino, dir_path.join(name));
            }
        }

        reply.dir(&dirents.into(), READDIR_BUF_SIZE, 0);
    }

    fn releasedir(
        &self,
        _req: &Request,
        _ino: INodeNo,
        _fh: FileHandle,
        _flags: OpenFlags,
        reply: fuser::ReplyEmpty,
    ) {
        if let Err(e) = maybe_fire(&self.config, SysCall::Releasedir) {
            reply.error(e.errno());
            return;
        }
        reply.ok();
    }

    fn fsyncdir(
        &self,
        _req: &Request,
        ino: INodeNo,
        _fh: FileHandle,
        datasync: bool,
        reply: fuser::ReplyEmpty,
    ) {
        if let Err(e) = maybe_fire(&self.config, SysCall::Fsyncdir) {
            reply.error(e.errno());
            return;
        }
        let state = self.state.lock();
        let path = match state.paths.get(ino.0) {
            Some(p) => p.to_path_buf(),
            None => {
                reply.error(Errno::ENOENT);
                return;
            }
        };
        drop(state);
        // `opendir`'s "fh" is the directory's inode, not a real descriptor,
        // so there's nothing to fsync through it; open the path fresh
        // instead of reusing that borrowed inode number as if it were a fd.
        let result: CharybdisResult<()> = (|| {
            let fd = hostfs::open(&path, OFlag::O_RDONLY | OFlag::O_DIRECTORY, Mode::empty())?;
            let synced = hostfs::fsync(fd, datasync);
            hostfs::close(fd)?;
            synced
        })();
        match result {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn statfs(&self, _req: &Request, _ino: INodeNo, reply: fuser::ReplyStatfs) {
        if let Err(e) = maybe_fire(&self.config, SysCall::Statfs) {
            reply.error(e.errno());
            return;
        }
        let state = self.state.lock();
        let root = match state.paths.get(ROOT_INODE) {
            Some(p) => p.to_path_buf(),
            None => {
                reply.error(Errno::EIO);
                return;
            }
        };
        let prefix_len = state.paths.path_prefix_len as u32;
        drop(state);
        match hostfs::statvfs(&root) {
            Ok(vfs) => reply.statfs(Statfs {
                blocks: vfs.blocks() as u64,
                bfree: vfs.blocks_free() as u64,
                bavail: vfs.blocks_available() as u64,
                files: vfs.files() as u64,
                ffree: vfs.files_free() as u64,
                bsize: vfs.block_size() as u32,
                namelen: (vfs.maximum_name_length() as u32).saturating_sub(prefix_len),
                frsize: vfs.fragment_size() as u32,
            }),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn setxattr(
        &self,
        _req: &Request,
        ino: INodeNo,
        name: &OsStr,
        value: &[u8],
        flags: i32,
        _position: u32,
        reply: fuser::ReplyEmpty,
    ) {
        if let Err(e) = maybe_fire(&self.config, SysCall::Setxattr) {
            reply.error(e.errno());
            return;
        }
        let state = self.state.lock();
        let path = match state.paths.get(ino.0) {
            Some(p) => p.to_path_buf(),
            None => {
                reply.error(Errno::ENOENT);
                return;
            }
        };
        drop(state);
        match hostfs::setxattr(&path, name, value, flags) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn getxattr(&self, _req: &Request, ino: INodeNo, name: &OsStr, size: u32, reply: fuser::ReplyXattr) {
        if let Err(e) = maybe_fire(&self.config, SysCall::Getxattr) {
            reply.error(e.errno());
            return;
        }
        let state = self.state.lock();
        let path = match state.paths.get(ino.0) {
            Some(p) => p.to_path_buf(),
            None => {
                reply.error(Errno::ENOENT);
                return;
            }
        };
        drop(state);
        if size == 0 {
            match hostfs::getxattr(&path, name, &mut []) {
                Ok(n) => reply.xattr(Xattr::Size(n as u32)),
                Err(e) => reply.error(e.errno()),
            }
        } else {
            let mut buf = vec![0u8; size as usize];
            match hostfs::getxattr(&path, name, &mut buf) {
                Ok(n) => {
                    buf.truncate(n);
                    reply.xattr(Xattr::Data(buf.into()));
                }
                Err(e) => reply.error(e.errno()),
            }
        }
    }

    fn listxattr(&self, _req: &Request, ino: INodeNo, size: u32, reply: fuser::ReplyXattr) {
        if let Err(e) = maybe_fire(&self.config, SysCall::Listxattr) {
            reply.error(e.errno());
            return;
        }
        let state = self.state.lock();
        let path = match state.paths.get(ino.0) {
            Some(p) => p.to_path_buf(),
            None => {
                reply.error(Errno::ENOENT);
                return;
            }
        };
        drop(state);
        if size == 0 {
            match hostfs::listxattr(&path, &mut []) {
                Ok(n) => reply.xattr(Xattr::Size(n as u32)),
                Err(e) => reply.error(e.errno()),
            }
        } else {
            let mut buf = vec![0u8; size as usize];
            match hostfs::listxattr(&path, &mut buf) {
                Ok(n) => {
                    buf.truncate(n);
                    reply.xattr(Xattr::Data(buf.into()));
                }
                Err(e) => reply.error(e.errno()),
            }
        }
    }

    fn removexattr(&self, _req: &Request, ino: INodeNo, name: &OsStr, reply: fuser::ReplyEmpty) {
        if let Err(e) = maybe_fire(&self.config, SysCall::Removexattr) {
            reply.error(e.errno());
            return;
        }
        let state = self.state.lock();
        let path = match state.paths.get(ino.0) {
            Some(p) => p.to_path_buf(),
            None => {
                reply.error(Errno::ENOENT);
                return;
            }
        };
        drop(state);
        match hostfs::removexattr(&path, name) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn access(&self, _req: &Request, ino: INodeNo, mask: AccessFlags, reply: fuser::ReplyEmpty) {
        if let Err(e) = maybe_fire(&self.config, SysCall::Access) {
            reply.error(e.errno());
            return;
        }
        let state = self.state.lock();
        let path = match state.paths.get(ino.0) {
            Some(p) => p.to_path_buf(),
            None => {
                reply.error(Errno::ENOENT);
                return;
            }
        };
        drop(state);
        let mode = NixAccessFlags::from_bits_truncate(mask.bits());
        match hostfs::access(&path, mode) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn create(
        &self,
        _req: &Request,
        parent: INodeNo,
        name: &OsStr,
        mode: u32,
        umask: u32,
        flags: i32,
        reply: fuser::ReplyCreate,
    ) {
        if let Err(e) = maybe_fire(&self.config, SysCall::Create) {
            reply.error(e.errno());
            return;
        }
        let mut state = self.state.lock();
        let path = match state.paths.join(parent.0, name) {
            Some(p) => p,
            None => {
                reply.error(Errno::ENOENT);
                return;
            }
        };
        let oflags = OFlag::from_bits_truncate(flags) | OFlag::O_CREAT | OFlag::O_TRUNC;
        let perm = Mode::from_bits_truncate(mode & !umask & 0o7777);
        let fd = match hostfs::open(&path, oflags, perm) {
            Ok(fd) => fd,
            Err(e) => {
                reply.error(e.errno());
                return;
            }
        };
        let st = match hostfs::fstat(fd) {
            Ok(st) => st,
            Err(e) => {
                let _ = hostfs::close(fd);
                reply.error(e.errno());
                return;
            }
        };
        let ino = st.st_ino;
        state.paths.put(ino, path);
        if let Err(e) = state.descriptors.insert(ino, fd) {
            let _ = hostfs::close(fd);
            reply.error(e.errno());
            return;
        }
        reply.created(entry_reply(ino, &st), Open { fh: fd as u64, flags: 0 });
    }
}
