//! Safety and cleanup
//!
//! Per-submission scopes and symlink-safe removal.

pub mod safe_cleanup;
pub mod workspace;

pub use workspace::{Scope, ScopeArena};
