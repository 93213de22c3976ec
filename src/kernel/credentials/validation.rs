//! Credential validation logic.

use crate::config::types::{Identity, Result, RunnerError};

/// Reject root UIDs/GIDs (0) as an execution identity.
pub fn validate_ids(identity: &Identity) -> Result<()> {
    if identity.is_privileged() {
        return Err(RunnerError::Config(format!(
            "Cannot run submissions as root UID/GID (uid={}, gid={})",
            identity.uid, identity.gid
        )));
    }
    Ok(())
}

/// Identity the payload must switch to, if any.
///
/// A privileged host drops every step to `configured`. An unprivileged host
/// already runs as a non-root user and cannot switch, so steps keep its
/// credentials.
pub fn effective_identity(configured: Identity) -> Option<Identity> {
    if nix::unistd::geteuid().is_root() {
        Some(configured)
    } else {
        None
    }
}
