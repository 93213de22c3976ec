/// Per-submission filesystem scopes.
///
/// Every sandbox gets `<work_root>/<uuid>`; nothing is ever shared between
/// two live scopes. The root is traversable but not listable, so one payload
/// cannot discover another's scope name.
use crate::config::types::{Identity, Result, RunnerError};
use crate::safety::safe_cleanup;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use uuid::Uuid;

const ROOT_MODE: u32 = 0o711;
const SCOPE_MODE: u32 = 0o700;

/// One submission's private directory.
#[derive(Debug)]
pub struct Scope {
    id: String,
    dir: PathBuf,
    owner: Option<Identity>,
    removed: bool,
}

impl Scope {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn path(&self) -> &Path {
        &self.dir
    }

    pub fn owner(&self) -> Option<Identity> {
        self.owner
    }

    pub fn is_removed(&self) -> bool {
        self.removed
    }

    /// Create `name` inside the scope with `content`.
    ///
    /// Refuses to replace an existing entry or follow a symlink, and hands
    /// the file to the scope owner.
    pub fn write_file(&self, name: &str, content: &[u8]) -> Result<PathBuf> {
        if name.is_empty() || name.contains('/') || name == "." || name == ".." {
            return Err(RunnerError::Internal(format!(
                "refusing to write {:?} outside scope {}",
                name, self.id
            )));
        }
        let path = self.dir.join(name);
        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .mode(0o600)
            .custom_flags(libc::O_NOFOLLOW | libc::O_CLOEXEC)
            .open(&path)
            .map_err(|e| {
                RunnerError::Internal(format!("Failed to create {}: {}", path.display(), e))
            })?;
        file.write_all(content).map_err(|e| {
            RunnerError::Internal(format!("Failed to write {}: {}", path.display(), e))
        })?;
        if let Some(owner) = self.owner {
            chown(&path, owner)?;
        }
        Ok(path)
    }

    pub fn contains(&self, name: &str) -> bool {
        fs::symlink_metadata(self.dir.join(name)).is_ok()
    }

    /// Remove the scope and everything the payload left in it. Idempotent.
    pub fn cleanup(&mut self) -> Result<()> {
        if self.removed {
            return Ok(());
        }
        safe_cleanup::remove_tree_secure(&self.dir)?;
        self.removed = true;
        log::debug!("Removed scope {}", self.id);
        Ok(())
    }
}

impl Drop for Scope {
    fn drop(&mut self) {
        if let Err(e) = self.cleanup() {
            log::warn!("Failed to remove scope {}: {}", self.dir.display(), e);
        }
    }
}

/// Parent of all scopes for this service instance.
#[derive(Debug)]
pub struct ScopeArena {
    root: PathBuf,
}

impl ScopeArena {
    pub fn new(root: PathBuf) -> Result<Self> {
        if let Ok(meta) = fs::symlink_metadata(&root) {
            if !meta.is_dir() {
                return Err(RunnerError::Config(format!(
                    "work root {} exists and is not a directory",
                    root.display()
                )));
            }
        }
        fs::create_dir_all(&root).map_err(|e| {
            RunnerError::Config(format!(
                "Failed to create work root {}: {}",
                root.display(),
                e
            ))
        })?;
        fs::set_permissions(&root, fs::Permissions::from_mode(ROOT_MODE)).map_err(|e| {
            RunnerError::Config(format!(
                "Failed to set permissions on work root {}: {}",
                root.display(),
                e
            ))
        })?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Create a fresh scope owned by `owner` (or by the caller when None).
    pub fn create_scope(&self, owner: Option<Identity>) -> Result<Scope> {
        let id = Uuid::new_v4().to_string();
        let dir = self.root.join(&id);

        // create_dir (not create_dir_all): a collision must fail, not merge.
        fs::create_dir(&dir).map_err(|e| {
            RunnerError::ResourceUnavailable(format!(
                "Failed to create scope {}: {}",
                dir.display(),
                e
            ))
        })?;
        let mut scope = Scope {
            id,
            dir,
            owner,
            removed: false,
        };
        fs::set_permissions(&scope.dir, fs::Permissions::from_mode(SCOPE_MODE))?;
        if let Some(owner) = owner {
            if let Err(e) = chown(&scope.dir, owner) {
                let _ = scope.cleanup();
                return Err(e);
            }
        }
        log::debug!("Created scope {}", scope.dir.display());
        Ok(scope)
    }

    /// Remove scopes older than `max_age`, left behind by a crashed process.
    pub fn cleanup_stale(&self, max_age: Duration) -> Result<usize> {
        let now = SystemTime::now();
        let mut cleaned = 0;

        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => {
                return Err(RunnerError::Internal(format!(
                    "Failed to read work root {}: {}",
                    self.root.display(),
                    e
                )))
            }
        };

        for entry in entries.flatten() {
            let path = entry.path();
            let is_scope = entry
                .file_name()
                .to_str()
                .map(|name| Uuid::parse_str(name).is_ok())
                .unwrap_or(false);
            if !is_scope {
                continue;
            }
            let age = fs::symlink_metadata(&path)
                .and_then(|m| m.modified())
                .ok()
                .and_then(|modified| now.duration_since(modified).ok());
            match age {
                Some(age) if age >= max_age => {
                    log::info!("Cleaning up stale scope: {}", path.display());
                    match safe_cleanup::remove_tree_secure(&path) {
                        Ok(()) => cleaned += 1,
                        Err(e) => log::warn!("Failed to remove stale scope {}: {}", path.display(), e),
                    }
                }
                _ => {}
            }
        }

        Ok(cleaned)
    }
}

fn chown(path: &Path, owner: Identity) -> Result<()> {
    nix::unistd::chown(
        path,
        Some(nix::unistd::Uid::from_raw(owner.uid)),
        Some(nix::unistd::Gid::from_raw(owner.gid)),
    )
    .map_err(|e| {
        RunnerError::Internal(format!(
            "Failed to chown {} to {}:{}: {}",
            path.display(),
            owner.uid,
            owner.gid,
            e
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn arena() -> ScopeArena {
        let root = std::env::temp_dir().join(format!("coderun-test-{}", Uuid::new_v4()));
        ScopeArena::new(root).unwrap()
    }

    #[test]
    fn test_scopes_are_disjoint() {
        let arena = arena();
        let a = arena.create_scope(None).unwrap();
        let b = arena.create_scope(None).unwrap();
        assert_ne!(a.path(), b.path());

        a.write_file("marker.txt", b"a").unwrap();
        assert!(a.contains("marker.txt"));
        assert!(!b.contains("marker.txt"));

        drop((a, b));
        fs::remove_dir_all(arena.root()).unwrap();
    }

    #[test]
    fn test_cleanup_is_idempotent() {
        let arena = arena();
        let mut scope = arena.create_scope(None).unwrap();
        let dir = scope.path().to_path_buf();
        scope.write_file("main.py", b"print(1)").unwrap();

        scope.cleanup().unwrap();
        scope.cleanup().unwrap();
        assert!(!dir.exists());
        assert!(scope.is_removed());
        fs::remove_dir_all(arena.root()).unwrap();
    }

    #[test]
    fn test_write_file_refuses_escape_and_overwrite() {
        let arena = arena();
        let scope = arena.create_scope(None).unwrap();
        assert!(scope.write_file("../x", b"").is_err());
        scope.write_file("stdin.txt", b"").unwrap();
        assert!(scope.write_file("stdin.txt", b"again").is_err());

        std::os::unix::fs::symlink("/etc/passwd", scope.path().join("link")).unwrap();
        assert!(scope.write_file("link", b"pwned").is_err());
        drop(scope);
        fs::remove_dir_all(arena.root()).unwrap();
    }

    #[test]
    fn test_cleanup_stale_only_touches_scopes() {
        let arena = arena();
        let stale = arena.create_scope(None).unwrap();
        let stale_dir = stale.path().to_path_buf();
        std::mem::forget(stale);
        fs::create_dir(arena.root().join("not-a-scope")).unwrap();

        let cleaned = arena.cleanup_stale(Duration::ZERO).unwrap();
        assert_eq!(cleaned, 1);
        assert!(!stale_dir.exists());
        assert!(arena.root().join("not-a-scope").exists());
        fs::remove_dir_all(arena.root()).unwrap();
    }
}
