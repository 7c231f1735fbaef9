//! CharybdisFS: a passthrough FUSE filesystem that mirrors a source
//! directory onto a target mount point while letting an HTTP control API
//! inject latency and errno faults into individual syscalls at runtime.

pub mod configuration;
pub mod control_api;
pub mod descriptor_map;
pub mod error;
pub mod fault;
pub mod fault_filter;
pub mod hostfs;
pub mod operations;
pub mod path_map;
