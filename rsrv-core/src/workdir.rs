//! Per-connection working-directory sandbox (component C2, spec §4.2).
//!
//! A forked-process server can simply `chdir()`; a task-based one cannot,
//! since the current directory is process-global and connections run
//! concurrently in the same process (spec §4.7's isolation contract is
//! "no shared mutable state", and a shared cwd would violate that). This
//! implementation instead hands every file command an absolute base path
//! to resolve against (see [`crate::fileio`]), which gives the same
//! sandboxing guarantee without a process-wide side effect.

use std::path::{Path, PathBuf};
use tracing::warn;

#[cfg(unix)]
const DIR_MODE: u32 = 0o777;

/// The scratch directory owned by one connection.
#[derive(Debug)]
pub struct WorkDir {
    path: PathBuf,
}

impl WorkDir {
    /// Create `<root>/conn<index>` (mode 0777 on unix) if `root` is set.
    pub async fn create(root: Option<&Path>, index: u64) -> std::io::Result<Option<WorkDir>> {
        let Some(root) = root else { return Ok(None) };
        let path = root.join(format!("conn{index}"));
        tokio::fs::create_dir_all(&path).await?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let perms = std::fs::Permissions::from_mode(DIR_MODE);
            tokio::fs::set_permissions(&path, perms).await?;
        }
        Ok(Some(WorkDir { path }))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Resolve a client-supplied, possibly relative path against this
    /// sandbox. Absolute paths supplied by the client are honored as-is,
    /// matching the original tool's behavior (`allowIO` is the only gate,
    /// not a chroot).
    pub fn resolve(&self, client_path: &str) -> PathBuf {
        let p = Path::new(client_path);
        if p.is_absolute() {
            p.to_path_buf()
        } else {
            self.path.join(p)
        }
    }

    /// Best-effort removal on disconnect (spec §4.2: "failures are
    /// ignored").
    pub async fn remove(self) {
        if let Err(e) = tokio::fs::remove_dir_all(&self.path).await {
            warn!(path = %self.path.display(), error = %e, "failed to remove connection workdir");
        }
    }
}
