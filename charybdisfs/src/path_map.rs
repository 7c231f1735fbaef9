//! The inode-to-path map (component C).
//!
//! Grounded on `core/operations.py`'s `PathMapping`, re-cast per this
//! engine's {One, Many} tagged-variant design: a hard link is the only way an
//! inode legitimately maps to more than one path, so the common case (one
//! path) never pays for a `HashSet`.
//!
//! Owned solely by the single-threaded operations engine; nothing else ever
//! touches it, so it carries no internal locking of its own.

use std::collections::{HashMap, HashSet};
use std::ffi::OsStr;
use std::path::{Path, PathBuf};

use crate::error::CharybdisError;

/// The inode FUSE addresses the mount root as.
pub const ROOT_INODE: u64 = 1;

/// Either the single path an inode is known by, or the set of paths a hard
/// link has given it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathEntry {
    One(PathBuf),
    Many(HashSet<PathBuf>),
}

/// Tracks, for every inode the kernel currently holds a reference to, the
/// host path(s) it corresponds to and how many outstanding `lookup`s the
/// kernel has been granted for it.
#[derive(Debug)]
pub struct PathMap {
    entries: HashMap<u64, PathEntry>,
    lookups: HashMap<u64, u64>,
    /// `len(source_root) + 1`, subtracted from `f_namemax` in `statfs` since
    /// every host path the kernel sees is really `source_root/<rest>`.
    pub path_prefix_len: usize,
}

impl PathMap {
    /// Build a map pre-populated with `ROOT_INODE -> source_root`.
    pub fn new(source_root: PathBuf) -> PathMap {
        let path_prefix_len = source_root.as_os_str().len() + 1;
        let mut entries = HashMap::new();
        entries.insert(ROOT_INODE, PathEntry::One(source_root));
        PathMap {
            entries,
            lookups: HashMap::new(),
            path_prefix_len,
        }
    }

    /// Record a lookup of `inode` at `path`, incrementing its lookup count.
    /// If `inode` is already known by a *different* path, it becomes a
    /// `Many` entry (a hard link); recording the same path again is a no-op
    /// on the path set but still counts as a lookup.
    pub fn put(&mut self, inode: u64, path: PathBuf) {
        *self.lookups.entry(inode).or_insert(0) += 1;
        match self.entries.get_mut(&inode) {
            None => {
                self.entries.insert(inode, PathEntry::One(path));
            }
            Some(PathEntry::One(existing)) => {
                if *existing != path {
                    let mut set = HashSet::with_capacity(2);
                    set.insert(existing.clone());
                    set.insert(path);
                    self.entries.insert(inode, PathEntry::Many(set));
                }
            }
            Some(PathEntry::Many(set)) => {
                set.insert(path);
            }
        }
    }

    /// Any one path this inode is currently known by (arbitrary but stable
    /// for the lifetime of the entry when there's only one path).
    pub fn get(&self, inode: u64) -> Option<&Path> {
        match self.entries.get(&inode)? {
            PathEntry::One(path) => Some(path.as_path()),
            PathEntry::Many(set) => set.iter().next().map(PathBuf::as_path),
        }
    }

    /// `self.get(inode).join(name)`, for building a child path under a known
    /// parent.
    pub fn join(&self, parent_inode: u64, name: &OsStr) -> Option<PathBuf> {
        self.get(parent_inode).map(|parent| parent.join(name))
    }

    /// Drop `path` as one of `inode`'s known paths (a `link`/`rename` target
    /// went away, or the only name for an unlinked file did). A no-op if
    /// `inode` isn't tracked at all. Returns an invariant error if `inode`
    /// is tracked but not under `path`.
    pub fn forget_path(&mut self, inode: u64, path: &Path) -> Result<(), CharybdisError> {
        let Some(entry) = self.entries.get_mut(&inode) else {
            return Ok(());
        };
        match entry {
            PathEntry::One(existing) => {
                if existing != path {
                    return Err(CharybdisError::Invariant(format!(
                        "forget_path: inode {inode} known by {existing:?}, not {path:?}"
                    )));
                }
                self.entries.remove(&inode);
            }
            PathEntry::Many(set) => {
                if !set.remove(path) {
                    return Err(CharybdisError::Invariant(format!(
                        "forget_path: inode {inode} has no path {path:?}"
                    )));
                }
                if set.len() == 1 {
                    let remaining = set.iter().next().cloned().expect("len == 1");
                    self.entries.insert(inode, PathEntry::One(remaining));
                }
            }
        }
        Ok(())
    }

    /// Rename `inode`'s `old_path` to `new_path` in place. A no-op if
    /// `inode` isn't tracked. Returns an invariant error if `inode` is
    /// tracked but `old_path` isn't one of its known paths.
    pub fn replace_path(
        &mut self,
        inode: u64,
        old_path: &Path,
        new_path: PathBuf,
    ) -> Result<(), CharybdisError> {
        let Some(entry) = self.entries.get_mut(&inode) else {
            return Ok(());
        };
        match entry {
            PathEntry::One(existing) => {
                if existing != old_path {
                    return Err(CharybdisError::Invariant(format!(
                        "replace_path: inode {inode} known by {existing:?}, not {old_path:?}"
                    )));
                }
                *existing = new_path;
            }
            PathEntry::Many(set) => {
                if !set.remove(old_path) {
                    return Err(CharybdisError::Invariant(format!(
                        "replace_path: inode {inode} has no path {old_path:?}"
                    )));
                }
                set.insert(new_path);
            }
        }
        Ok(())
    }

    /// Release `nlookup` outstanding lookups for `inode`. Returns `true`
    /// (and drops the entry) once the running total reaches zero, mirroring
    /// the FUSE `forget` contract.
    pub fn forget_lookups(&mut self, inode: u64, nlookup: u64) -> bool {
        let remaining = self.lookups.get(&inode).copied().unwrap_or(0);
        if nlookup >= remaining {
            self.lookups.remove(&inode);
            self.entries.remove(&inode);
            true
        } else {
            self.lookups.insert(inode, remaining - nlookup);
            false
        }
    }

    /// Whether `inode` currently has an entry at all.
    pub fn contains(&self, inode: u64) -> bool {
        self.entries.contains_key(&inode)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn root_inode_is_prepopulated() {
        let map = PathMap::new(PathBuf::from("/srv/data"));
        assert_eq!(map.get(ROOT_INODE), Some(Path::new("/srv/data")));
    }

    #[test]
    fn putting_a_second_distinct_path_for_an_inode_creates_a_hard_link_set() {
        let mut map = PathMap::new(PathBuf::from("/srv"));
        map.put(42, PathBuf::from("/srv/a"));
        map.put(42, PathBuf::from("/srv/b"));
        assert!(matches!(map.entries.get(&42), Some(PathEntry::Many(_))));
        let path = map.get(42).unwrap();
        assert!(path == Path::new("/srv/a") || path == Path::new("/srv/b"));
    }

    #[test]
    fn forget_path_collapses_a_pair_back_to_a_single_entry() {
        let mut map = PathMap::new(PathBuf::from("/srv"));
        map.put(42, PathBuf::from("/srv/a"));
        map.put(42, PathBuf::from("/srv/b"));
        map.forget_path(42, Path::new("/srv/a")).unwrap();
        assert_eq!(
            map.entries.get(&42),
            Some(&PathEntry::One(PathBuf::from("/srv/b")))
        );
    }

    #[test]
    fn forget_path_on_an_untracked_inode_is_a_no_op() {
        let mut map = PathMap::new(PathBuf::from("/srv"));
        assert!(map.forget_path(999, Path::new("/srv/nope")).is_ok());
    }

    #[test]
    fn forget_path_with_the_wrong_path_is_an_invariant_violation() {
        let mut map = PathMap::new(PathBuf::from("/srv"));
        map.put(42, PathBuf::from("/srv/a"));
        assert!(map.forget_path(42, Path::new("/srv/wrong")).is_err());
    }

    #[test]
    fn replace_path_renames_a_single_entry_in_place() {
        let mut map = PathMap::new(PathBuf::from("/srv"));
        map.put(42, PathBuf::from("/srv/a"));
        map.replace_path(42, Path::new("/srv/a"), PathBuf::from("/srv/b"))
            .unwrap();
        assert_eq!(map.get(42), Some(Path::new("/srv/b")));
    }

    #[test]
    fn forget_lookups_removes_the_entry_once_the_count_is_exhausted() {
        let mut map = PathMap::new(PathBuf::from("/srv"));
        map.put(42, PathBuf::from("/srv/a"));
        map.put(42, PathBuf::from("/srv/a"));
        assert!(!map.forget_lookups(42, 1));
        assert!(map.contains(42));
        assert!(map.forget_lookups(42, 1));
        assert!(!map.contains(42));
    }
}
