//! Re-export of the `fuse_setattr_in.valid` bitmask constants, so low-level
//! ABI code can refer to them as `crate::consts::FATTR_*` regardless of which
//! module actually defines them.

pub use crate::ll::fuse_abi::consts::*;
