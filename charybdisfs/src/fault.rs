//! The fault model: the syscall tag set and the two fault kinds that can be
//! attached to them (injected latency, injected errno failures).
//!
//! Grounded on `core/faults.py`'s `SysCall`/`BaseFault`/`LatencyFault`/
//! `ErrorFault`. The Python version throws the fault as a control-flow
//! exception from `apply()`; here `apply()` returns a `CharybdisError` through
//! the normal `Result` channel instead, which is what every other host-I/O
//! failure in the engine already does.

use std::fmt;
use std::thread;
use std::time::Duration;

use serde_json::{json, Value};

use crate::error::CharybdisError;

/// The FUSE operation a fault rule targets. `All` matches every operation;
/// `Unknown` is never produced on the wire, it's the catch-all a lookup
/// falls back to when nothing more specific applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SysCall {
    Access,
    Create,
    Flush,
    Fsync,
    Fsyncdir,
    Getattr,
    Getxattr,
    Link,
    Listxattr,
    Lookup,
    Mkdir,
    Mknod,
    Open,
    Opendir,
    Read,
    Readdir,
    Readlink,
    Release,
    Releasedir,
    Removexattr,
    Rename,
    Rmdir,
    Setattr,
    Setxattr,
    Statfs,
    Symlink,
    Write,
    Unlink,
    All,
    Unknown,
}

impl SysCall {
    /// The wire/display form of this tag (`"*"` for `All`).
    pub fn as_str(self) -> &'static str {
        match self {
            SysCall::Access => "access",
            SysCall::Create => "create",
            SysCall::Flush => "flush",
            SysCall::Fsync => "fsync",
            SysCall::Fsyncdir => "fsyncdir",
            SysCall::Getattr => "getattr",
            SysCall::Getxattr => "getxattr",
            SysCall::Link => "link",
            SysCall::Listxattr => "listxattr",
            SysCall::Lookup => "lookup",
            SysCall::Mkdir => "mkdir",
            SysCall::Mknod => "mknod",
            SysCall::Open => "open",
            SysCall::Opendir => "opendir",
            SysCall::Read => "read",
            SysCall::Readdir => "readdir",
            SysCall::Readlink => "readlink",
            SysCall::Release => "release",
            SysCall::Releasedir => "releasedir",
            SysCall::Removexattr => "removexattr",
            SysCall::Rename => "rename",
            SysCall::Rmdir => "rmdir",
            SysCall::Setattr => "setattr",
            SysCall::Setxattr => "setxattr",
            SysCall::Statfs => "statfs",
            SysCall::Symlink => "symlink",
            SysCall::Write => "write",
            SysCall::Unlink => "unlink",
            SysCall::All => "*",
            SysCall::Unknown => "unknown",
        }
    }

    /// Parse a wire tag. Returns `SysCall::Unknown` for anything unrecognized
    /// rather than failing, matching `Fault::from_dict`'s never-throw contract.
    pub fn parse(raw: &str) -> SysCall {
        match raw {
            "access" => SysCall::Access,
            "create" => SysCall::Create,
            "flush" => SysCall::Flush,
            "fsync" => SysCall::Fsync,
            "fsyncdir" => SysCall::Fsyncdir,
            "getattr" => SysCall::Getattr,
            "getxattr" => SysCall::Getxattr,
            "link" => SysCall::Link,
            "listxattr" => SysCall::Listxattr,
            "lookup" => SysCall::Lookup,
            "mkdir" => SysCall::Mkdir,
            "mknod" => SysCall::Mknod,
            "open" => SysCall::Open,
            "opendir" => SysCall::Opendir,
            "read" => SysCall::Read,
            "readdir" => SysCall::Readdir,
            "readlink" => SysCall::Readlink,
            "release" => SysCall::Release,
            "releasedir" => SysCall::Releasedir,
            "removexattr" => SysCall::Removexattr,
            "rename" => SysCall::Rename,
            "rmdir" => SysCall::Rmdir,
            "setattr" => SysCall::Setattr,
            "setxattr" => SysCall::Setxattr,
            "statfs" => SysCall::Statfs,
            "symlink" => SysCall::Symlink,
            "write" => SysCall::Write,
            "unlink" => SysCall::Unlink,
            "*" => SysCall::All,
            _ => SysCall::Unknown,
        }
    }
}

impl fmt::Display for SysCall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle of a rule: `New` until its first (and, for errors, only) firing,
/// then `Applied` forever after.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    New,
    Applied,
}

impl Status {
    fn as_str(self) -> &'static str {
        match self {
            Status::New => "new",
            Status::Applied => "applied",
        }
    }
}

/// The effect a fault has when it fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultKind {
    /// Sleep for `delay_us` microseconds before the real operation runs.
    Latency { delay_us: u64 },
    /// Fail the operation outright with the given errno.
    Error { error_no: i32 },
}

/// A single fault rule: which syscall it targets, how likely it is to fire,
/// what it does when it does, and whether it has fired yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fault {
    pub sys_call: SysCall,
    pub probability: u8,
    pub status: Status,
    pub kind: FaultKind,
}

impl Fault {
    /// Build a new, unfired latency fault. `probability` is clamped to `0..=100`.
    pub fn latency(sys_call: SysCall, probability: u8, delay_us: u64) -> Fault {
        Fault {
            sys_call,
            probability: probability.min(100),
            status: Status::New,
            kind: FaultKind::Latency { delay_us },
        }
    }

    /// Build a new, unfired error fault. `probability` is clamped to `0..=100`.
    pub fn error(sys_call: SysCall, probability: u8, error_no: i32) -> Fault {
        Fault {
            sys_call,
            probability: probability.min(100),
            status: Status::New,
            kind: FaultKind::Error { error_no },
        }
    }

    /// Apply this fault's effect. For a latency fault this blocks the calling
    /// thread (FUSE dispatch is single-threaded and cooperative, so this is a
    /// real stall of the whole filesystem, by design) and returns `Ok(())`
    /// once the sleep elapses. For an error fault this returns immediately
    /// with `CharybdisError::Injected`. Either way `status` transitions to
    /// `Applied`, once, the first time this is called.
    pub fn apply(&mut self) -> Result<(), CharybdisError> {
        self.status = Status::Applied;
        match self.kind {
            FaultKind::Latency { delay_us } => {
                thread::sleep(Duration::from_micros(delay_us));
                Ok(())
            }
            FaultKind::Error { error_no } => Err(CharybdisError::Injected(error_no)),
        }
    }

    /// Serialize to the wire dict shape: `fault_type`, `sys_call`,
    /// `probability`, `status`, plus `delay`/`error_no` depending on kind.
    pub fn to_dict(&self) -> Value {
        let mut obj = json!({
            "sys_call": self.sys_call.as_str(),
            "probability": self.probability,
            "status": self.status.as_str(),
        });
        let map = obj.as_object_mut().expect("object literal");
        match self.kind {
            FaultKind::Latency { delay_us } => {
                map.insert("fault_type".into(), json!("LatencyFault"));
                map.insert("delay".into(), json!(delay_us));
            }
            FaultKind::Error { error_no } => {
                map.insert("fault_type".into(), json!("ErrorFault"));
                map.insert("error_no".into(), json!(error_no));
            }
        }
        obj
    }

    /// Parse a wire dict produced by [`Fault::to_dict`] (or an equivalent
    /// hand-built JSON body). Never panics: any unknown `fault_type`,
    /// missing field, or field of the wrong JSON type yields `None` rather
    /// than an error, so a malformed request never takes the process down.
    pub fn from_dict(value: &Value) -> Option<Fault> {
        let obj = value.as_object()?;
        let sys_call = SysCall::parse(obj.get("sys_call")?.as_str()?);
        let probability = obj.get("probability")?.as_u64()?.min(100) as u8;
        let status = match obj.get("status").and_then(Value::as_str) {
            Some("applied") => Status::Applied,
            _ => Status::New,
        };
        let kind = match obj.get("fault_type")?.as_str()? {
            "LatencyFault" => FaultKind::Latency {
                delay_us: obj.get("delay")?.as_u64()?,
            },
            "ErrorFault" => FaultKind::Error {
                error_no: obj.get("error_no")?.as_i64()?.try_into().ok()?,
            },
            _ => return None,
        };
        Some(Fault {
            sys_call,
            probability,
            status,
            kind,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wildcard_syscall_roundtrips_through_the_star_token() {
        assert_eq!(SysCall::All.as_str(), "*");
        assert_eq!(SysCall::parse("*"), SysCall::All);
    }

    #[test]
    fn unknown_syscall_name_parses_to_unknown_not_an_error() {
        assert_eq!(SysCall::parse("frobnicate"), SysCall::Unknown);
    }

    #[test]
    fn to_dict_from_dict_is_the_identity_for_latency_faults() {
        let fault = Fault::latency(SysCall::Read, 42, 1_500);
        let round_tripped = Fault::from_dict(&fault.to_dict()).expect("valid dict");
        assert_eq!(fault, round_tripped);
    }

    #[test]
    fn to_dict_from_dict_is_the_identity_for_error_faults() {
        let fault = Fault::error(SysCall::Write, 7, libc::ENOSPC);
        let round_tripped = Fault::from_dict(&fault.to_dict()).expect("valid dict");
        assert_eq!(fault, round_tripped);
    }

    #[test]
    fn from_dict_rejects_unknown_fault_type_without_panicking() {
        let value = json!({
            "fault_type": "NetworkPartitionFault",
            "sys_call": "write",
            "probability": 10,
        });
        assert!(Fault::from_dict(&value).is_none());
    }

    #[test]
    fn from_dict_rejects_missing_fields_without_panicking() {
        let value = json!({"fault_type": "ErrorFault", "sys_call": "write"});
        assert!(Fault::from_dict(&value).is_none());
    }

    #[test]
    fn probability_is_clamped_to_one_hundred() {
        assert_eq!(Fault::latency(SysCall::All, 255, 0).probability, 100);
    }

    #[test]
    fn latency_fault_applies_and_marks_itself_applied() {
        let mut fault = Fault::latency(SysCall::Read, 100, 1);
        assert_eq!(fault.status, Status::New);
        assert!(fault.apply().is_ok());
        assert_eq!(fault.status, Status::Applied);
    }

    #[test]
    fn error_fault_applies_by_returning_the_injected_errno() {
        let mut fault = Fault::error(SysCall::Write, 100, libc::ENOSPC);
        match fault.apply() {
            Err(CharybdisError::Injected(no)) => assert_eq!(no, libc::ENOSPC),
            other => panic!("expected injected error, got {other:?}"),
        }
        assert_eq!(fault.status, Status::Applied);
    }
}
