//! UID/GID transition for the payload process.
//!
//! Runs in the forked child between fork and exec: raw syscalls only, no
//! allocation, no logging.
//!
//! CRITICAL: setresgid MUST be called BEFORE setresuid. Once the UID is
//! dropped the process can no longer change its groups.

use crate::config::types::Identity;
use std::io;

/// clear groups -> setresgid -> setresuid -> verify.
pub fn transition_to_unprivileged(identity: Identity) -> io::Result<()> {
    let uid = identity.uid as libc::uid_t;
    let gid = identity.gid as libc::gid_t;

    // SAFETY: setgroups with a zero-length list reads no memory.
    if unsafe { libc::setgroups(0, std::ptr::null()) } != 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: setresgid/setresuid take plain integers.
    if unsafe { libc::setresgid(gid, gid, gid) } != 0 {
        return Err(io::Error::last_os_error());
    }
    if unsafe { libc::setresuid(uid, uid, uid) } != 0 {
        return Err(io::Error::last_os_error());
    }

    // SAFETY: getters cannot fail.
    let (ruid, euid, rgid, egid) =
        unsafe { (libc::getuid(), libc::geteuid(), libc::getgid(), libc::getegid()) };
    if ruid != uid || euid != uid || rgid != gid || egid != gid {
        return Err(io::Error::from_raw_os_error(libc::EPERM));
    }
    Ok(())
}
