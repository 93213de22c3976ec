//! Symlink-safe recursive removal of sandbox scopes.
//!
//! A scope is written to by untrusted code, so it may contain symlinks to
//! host paths, mount points, or directories with their permissions stripped.
//! Removal walks the tree with openat/fstatat/unlinkat and never follows a
//! link or crosses a filesystem boundary.

use crate::config::types::{Result, RunnerError};
use std::ffi::{CStr, CString};
use std::os::fd::RawFd;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;

struct FdGuard(RawFd);

impl Drop for FdGuard {
    fn drop(&mut self) {
        if self.0 >= 0 {
            // SAFETY: the guard owns the descriptor.
            unsafe {
                libc::close(self.0);
            }
        }
    }
}

struct DirStream(*mut libc::DIR);

impl Drop for DirStream {
    fn drop(&mut self) {
        // SAFETY: the stream came from fdopendir and is closed exactly once.
        unsafe {
            libc::closedir(self.0);
        }
    }
}

fn fs_error(what: &str, subject: &dyn std::fmt::Debug) -> RunnerError {
    RunnerError::Internal(format!(
        "{} failed for {:?}: {}",
        what,
        subject,
        std::io::Error::last_os_error()
    ))
}

fn open_dir_nofollow(path: &Path) -> Result<FdGuard> {
    let path_c = CString::new(path.as_os_str().as_bytes()).map_err(|_| {
        RunnerError::Internal(format!(
            "Path contains NUL byte and cannot be opened safely: {}",
            path.display()
        ))
    })?;

    // SAFETY: path_c is a valid NUL-terminated string.
    let fd = unsafe {
        libc::open(
            path_c.as_ptr(),
            libc::O_RDONLY | libc::O_DIRECTORY | libc::O_CLOEXEC | libc::O_NOFOLLOW,
        )
    };
    if fd < 0 {
        return Err(fs_error("open directory", &path));
    }
    Ok(FdGuard(fd))
}

fn fstatat_nofollow(parent_fd: RawFd, name: &CStr) -> Result<libc::stat> {
    let mut st = std::mem::MaybeUninit::<libc::stat>::zeroed();
    // SAFETY: st is writable storage for one stat struct.
    let rc = unsafe {
        libc::fstatat(
            parent_fd,
            name.as_ptr(),
            st.as_mut_ptr(),
            libc::AT_SYMLINK_NOFOLLOW,
        )
    };
    if rc != 0 {
        return Err(fs_error("fstatat", &name));
    }
    // SAFETY: fstatat succeeded and filled the struct.
    Ok(unsafe { st.assume_init() })
}

fn remove_entry_at(parent_fd: RawFd, name: &CStr, flags: i32) -> Result<()> {
    // SAFETY: name is a valid C string relative to parent_fd.
    if unsafe { libc::unlinkat(parent_fd, name.as_ptr(), flags) } != 0 {
        return Err(fs_error("unlinkat", &name));
    }
    Ok(())
}

fn recurse_remove_dir(parent_fd: RawFd, name: &CStr, root_dev: libc::dev_t) -> Result<()> {
    // The payload may have stripped its own directories; restore enough
    // permission to list and unlink. Fails harmlessly on foreign-owned dirs.
    // SAFETY: plain fchmodat on a name relative to parent_fd.
    unsafe {
        libc::fchmodat(parent_fd, name.as_ptr(), 0o700, 0);
    }
    // SAFETY: openat with O_NOFOLLOW never follows a symlink planted here.
    let child_fd = unsafe {
        libc::openat(
            parent_fd,
            name.as_ptr(),
            libc::O_RDONLY | libc::O_DIRECTORY | libc::O_CLOEXEC | libc::O_NOFOLLOW,
        )
    };
    if child_fd < 0 {
        return Err(fs_error("openat", &name));
    }
    let child = FdGuard(child_fd);

    remove_dir_contents_fd(child.0, root_dev)?;
    remove_entry_at(parent_fd, name, libc::AT_REMOVEDIR)
}

fn remove_dir_contents_fd(dir_fd: RawFd, root_dev: libc::dev_t) -> Result<()> {
    // SAFETY: dup of a descriptor we own; fdopendir takes ownership of the copy.
    let iter_fd = unsafe { libc::dup(dir_fd) };
    if iter_fd < 0 {
        return Err(fs_error("dup", &dir_fd));
    }
    let dir = unsafe { libc::fdopendir(iter_fd) };
    if dir.is_null() {
        unsafe {
            libc::close(iter_fd);
        }
        return Err(fs_error("fdopendir", &dir_fd));
    }
    let stream = DirStream(dir);

    loop {
        // SAFETY: errno is thread-local; readdir reports errors only through it.
        unsafe {
            *libc::__errno_location() = 0;
        }
        let entry = unsafe { libc::readdir(stream.0) };
        if entry.is_null() {
            let errno = unsafe { *libc::__errno_location() };
            if errno != 0 {
                return Err(RunnerError::Internal(format!(
                    "readdir failed: {}",
                    std::io::Error::from_raw_os_error(errno)
                )));
            }
            break;
        }

        // SAFETY: d_name is NUL-terminated and valid until the next readdir.
        let name = unsafe { CStr::from_ptr((*entry).d_name.as_ptr()) }.to_owned();
        let bytes = name.to_bytes();
        if bytes == b"." || bytes == b".." {
            continue;
        }

        let st = fstatat_nofollow(dir_fd, &name)?;
        if st.st_mode & libc::S_IFMT == libc::S_IFDIR {
            if st.st_dev != root_dev {
                return Err(RunnerError::Internal(format!(
                    "Refusing to cross filesystem boundary at directory {:?}",
                    name
                )));
            }
            recurse_remove_dir(dir_fd, &name, root_dev)?;
        } else {
            remove_entry_at(dir_fd, &name, 0)?;
        }
    }

    Ok(())
}

/// Remove a tree without following symlinks. Missing paths are not an error.
pub fn remove_tree_secure(path: &Path) -> Result<()> {
    if std::fs::symlink_metadata(path).is_err() {
        return Ok(());
    }

    let parent = path.parent().ok_or_else(|| {
        RunnerError::Internal(format!("Cannot remove path without parent: {}", path.display()))
    })?;
    let name = path.file_name().ok_or_else(|| {
        RunnerError::Internal(format!(
            "Cannot remove path without file name: {}",
            path.display()
        ))
    })?;
    let name_c = CString::new(name.as_bytes()).map_err(|_| {
        RunnerError::Internal(format!(
            "Path contains NUL byte and cannot be removed safely: {}",
            path.display()
        ))
    })?;

    let parent_fd = open_dir_nofollow(parent)?;
    let st = fstatat_nofollow(parent_fd.0, &name_c)?;
    if st.st_mode & libc::S_IFMT == libc::S_IFDIR {
        recurse_remove_dir(parent_fd.0, &name_c, st.st_dev)
    } else {
        remove_entry_at(parent_fd.0, &name_c, 0)
    }
}
