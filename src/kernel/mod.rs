//! Thin wrappers around Linux kernel primitives.
//!
//! All `unsafe` code is concentrated here with explicit SAFETY comments.
//! Everything called between fork and exec is async-signal-safe.

pub mod cgroup;
pub mod credentials;
pub mod namespace;
pub mod rlimits;
pub mod signal;
