//! The inode/file-descriptor map (component D).
//!
//! Grounded on `core/operations.py`'s `FileDescriptorMapping`: a bidirectional
//! inode<->fd mapping plus a reference count per fd, so that `open` on an
//! already-open inode reuses the existing host descriptor instead of opening
//! a second one. Owned solely by the operations engine, no internal locking.

use std::collections::HashMap;
use std::os::unix::io::RawFd;

use crate::error::CharybdisError;

#[derive(Debug, Default)]
pub struct DescriptorMap {
    inode_to_fd: HashMap<u64, RawFd>,
    fd_to_inode: HashMap<RawFd, u64>,
    open_counters: HashMap<RawFd, u32>,
}

impl DescriptorMap {
    pub fn new() -> DescriptorMap {
        DescriptorMap::default()
    }

    /// Record that `inode` is now backed by host descriptor `fd`, with one
    /// outstanding reference. It is an invariant violation to insert a
    /// second descriptor for an inode that already has one; callers must
    /// `acquire_by_inode` first to check.
    pub fn insert(&mut self, inode: u64, fd: RawFd) -> Result<(), CharybdisError> {
        if self.inode_to_fd.contains_key(&inode) {
            return Err(CharybdisError::Invariant(format!(
                "tried to assign fd {fd} to inode {inode}, which already has an open descriptor"
            )));
        }
        self.inode_to_fd.insert(inode, fd);
        self.fd_to_inode.insert(fd, inode);
        self.open_counters.insert(fd, 1);
        Ok(())
    }

    /// If `inode` already has an open descriptor, bump its reference count
    /// and return it.
    pub fn acquire_by_inode(&mut self, inode: u64) -> Option<RawFd> {
        let fd = *self.inode_to_fd.get(&inode)?;
        *self.open_counters.entry(fd).or_insert(0) += 1;
        Some(fd)
    }

    /// Bump the reference count of an already-tracked `fd` (used when a
    /// second caller opens a path that maps to an inode already tracked
    /// under a different acquisition path, e.g. `create`).
    pub fn acquire(&mut self, fd: RawFd) {
        *self.open_counters.entry(fd).or_insert(0) += 1;
    }

    /// Drop one reference to `fd`. Returns `true` (and forgets the mapping
    /// entirely) once the reference count reaches zero, signaling that the
    /// caller should now actually `close` the host descriptor.
    pub fn release(&mut self, fd: RawFd) -> bool {
        let count = self.open_counters.get(&fd).copied().unwrap_or(0);
        if count <= 1 {
            if let Some(inode) = self.fd_to_inode.remove(&fd) {
                self.inode_to_fd.remove(&inode);
            }
            self.open_counters.remove(&fd);
            true
        } else {
            self.open_counters.insert(fd, count - 1);
            false
        }
    }

    /// The fd currently backing `inode`, if any, without touching its
    /// reference count.
    pub fn get(&self, inode: u64) -> Option<RawFd> {
        self.inode_to_fd.get(&inode).copied()
    }

    /// The inode currently backed by `fd`, if any.
    pub fn inode_for_fd(&self, fd: RawFd) -> Option<u64> {
        self.fd_to_inode.get(&fd).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_then_acquire_by_inode_shares_the_same_fd() {
        let mut map = DescriptorMap::new();
        map.insert(1, 10).unwrap();
        assert_eq!(map.acquire_by_inode(1), Some(10));
    }

    #[test]
    fn inserting_a_second_fd_for_the_same_inode_is_an_invariant_violation() {
        let mut map = DescriptorMap::new();
        map.insert(1, 10).unwrap();
        assert!(map.insert(1, 11).is_err());
    }

    #[test]
    fn release_is_a_no_op_until_the_last_reference_drops() {
        let mut map = DescriptorMap::new();
        map.insert(1, 10).unwrap();
        map.acquire_by_inode(1);
        assert!(!map.release(10));
        assert_eq!(map.get(1), Some(10));
        assert!(map.release(10));
        assert_eq!(map.get(1), None);
        assert_eq!(map.inode_for_fd(10), None);
    }

    #[test]
    fn acquire_release_round_trip_is_a_no_op_on_the_mapping() {
        let mut map = DescriptorMap::new();
        map.insert(1, 10).unwrap();
        map.acquire(10);
        map.release(10);
        assert_eq!(map.get(1), Some(10));
    }
}
