/// Namespace isolation for payload processes.
///
/// Only namespaces that need no filesystem setup are used: network (no
/// interfaces but loopback), IPC and UTS. All of them require CAP_SYS_ADMIN,
/// so an unprivileged host skips them with a warning.
use nix::sched::{unshare, CloneFlags};
use std::io;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct NamespacePlan {
    pub network: bool,
    pub ipc: bool,
    pub uts: bool,
}

impl NamespacePlan {
    /// Everything on when the host can create namespaces, nothing otherwise.
    pub fn for_host(privileged: bool) -> Self {
        let full = Self {
            network: true,
            ipc: true,
            uts: true,
        };
        if !privileged {
            log::warn!("Running unprivileged: network namespace isolation disabled");
            return Self::default();
        }
        if Self::is_supported() && can_unshare(full.flags()) {
            full
        } else {
            // Root without CAP_SYS_ADMIN, e.g. inside a default container.
            log::warn!("unshare refused on this host: namespace isolation disabled");
            Self::default()
        }
    }

    /// Check if namespace isolation is supported on this system
    pub fn is_supported() -> bool {
        std::fs::read_dir("/proc/self/ns").is_ok()
    }

    pub fn is_enabled(&self) -> bool {
        self.network || self.ipc || self.uts
    }

    fn flags(&self) -> CloneFlags {
        let mut flags = CloneFlags::empty();
        if self.network {
            flags |= CloneFlags::CLONE_NEWNET;
        }
        if self.ipc {
            flags |= CloneFlags::CLONE_NEWIPC;
        }
        if self.uts {
            flags |= CloneFlags::CLONE_NEWUTS;
        }
        flags
    }

    /// Unshare the planned namespaces. Runs in the forked child, so it only
    /// issues raw syscalls.
    pub fn apply(&self) -> io::Result<()> {
        let flags = self.flags();
        if flags.is_empty() {
            return Ok(());
        }
        unshare(flags).map_err(io::Error::from)?;
        if self.uts {
            nix::unistd::sethostname("coderun").map_err(io::Error::from)?;
        }
        if self.network {
            bring_up_loopback()?;
        }
        Ok(())
    }
}

/// Try `flags` in a throwaway child so the service itself keeps its
/// namespaces.
fn can_unshare(flags: CloneFlags) -> bool {
    use nix::sys::wait::{waitpid, WaitStatus};
    use nix::unistd::{fork, ForkResult};

    // SAFETY: the child only calls unshare(2) and _exit(2).
    match unsafe { fork() } {
        Ok(ForkResult::Child) => {
            let code = if unshare(flags).is_ok() { 0 } else { 1 };
            // SAFETY: _exit skips atexit handlers and stdio flushing.
            unsafe { libc::_exit(code) }
        }
        Ok(ForkResult::Parent { child }) => {
            matches!(waitpid(child, None), Ok(WaitStatus::Exited(_, 0)))
        }
        Err(_) => false,
    }
}

fn bring_up_loopback() -> io::Result<()> {
    // SAFETY: plain socket(2); the fd is closed on every path below.
    let sock = unsafe { libc::socket(libc::AF_INET, libc::SOCK_DGRAM | libc::SOCK_CLOEXEC, 0) };
    if sock < 0 {
        return Err(io::Error::last_os_error());
    }

    // SAFETY: ifreq is plain old data; all-zero is a valid value.
    let mut ifr: libc::ifreq = unsafe { std::mem::zeroed() };
    for (idx, b) in b"lo\0".iter().enumerate() {
        ifr.ifr_name[idx] = *b as libc::c_char;
    }

    // SAFETY: ifr is a valid, initialised ifreq for the duration of both calls.
    let result = unsafe {
        if libc::ioctl(sock, libc::SIOCGIFFLAGS as _, &mut ifr) != 0 {
            Err(io::Error::last_os_error())
        } else {
            let flags = ifr.ifr_ifru.ifru_flags as libc::c_int | libc::IFF_UP;
            ifr.ifr_ifru.ifru_flags = flags as libc::c_short;
            if libc::ioctl(sock, libc::SIOCSIFFLAGS as _, &ifr) != 0 {
                Err(io::Error::last_os_error())
            } else {
                Ok(())
            }
        }
    };
    // SAFETY: sock is owned here and closed exactly once.
    unsafe { libc::close(sock) };
    result
}
