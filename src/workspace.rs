//! Maps client-supplied relative paths onto the workspace storage root.

use crate::errors::{SandboxError, SandboxResult};
use std::fs;
use std::path::{Component, Path, PathBuf};
use tokio::io::AsyncWriteExt;

/// Fixed storage directory under which every project lives.
#[derive(Debug, Clone)]
pub struct WorkspaceRoot {
    root: PathBuf,
}

impl WorkspaceRoot {
    /// Create the root directory if needed and pin its canonical form.
    pub fn open(root: impl AsRef<Path>) -> SandboxResult<Self> {
        let root = root.as_ref();
        fs::create_dir_all(root)?;
        let root = root.canonicalize()?;
        Ok(Self { root })
    }

    pub fn path(&self) -> &Path {
        &self.root
    }

    /// Resolve `relative` to an absolute path that is the root or one of its
    /// descendants.
    ///
    /// Leading separators are stripped so absolute-looking input is treated as
    /// relative. `..` segments are applied lexically, then the deepest existing
    /// ancestor is canonicalized so symlinks cannot point the result outside
    /// the root. The path does not need to exist.
    pub fn resolve(&self, relative: &str) -> SandboxResult<PathBuf> {
        if relative.contains('\0') {
            return Err(SandboxError::InvalidPath(relative.escape_default().to_string()));
        }

        let trimmed = relative.trim_start_matches(['/', '\\']);
        let joined = self.root.join(trimmed);
        let normalized = normalize(&joined)
            .ok_or_else(|| SandboxError::InvalidPath(relative.to_string()))?;

        if !normalized.starts_with(&self.root) {
            return Err(SandboxError::InvalidPath(relative.to_string()));
        }

        let resolved = canonicalize_existing(&normalized, relative)?;
        if !resolved.starts_with(&self.root) {
            tracing::warn!(path = %relative, resolved = %resolved.display(), "blocked workspace escape");
            return Err(SandboxError::InvalidPath(relative.to_string()));
        }

        Ok(resolved)
    }

    /// Replace the file at `relative` with `content`, creating parent
    /// directories as needed.
    ///
    /// The final component is opened without following symlinks, so a link
    /// planted after [`resolve`](Self::resolve) ran still cannot redirect the
    /// write.
    pub async fn write_file(&self, relative: &str, content: &[u8]) -> SandboxResult<PathBuf> {
        let target = self.resolve(relative)?;
        if target == self.root {
            return Err(SandboxError::InvalidPath(relative.to_string()));
        }
        if let Ok(meta) = tokio::fs::symlink_metadata(&target).await {
            if meta.is_dir() || meta.file_type().is_symlink() {
                return Err(SandboxError::InvalidPath(relative.to_string()));
            }
        }

        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let mut options = tokio::fs::OpenOptions::new();
        options.write(true).create(true).truncate(true);
        #[cfg(target_os = "linux")]
        options.custom_flags(nix::fcntl::OFlag::O_NOFOLLOW.bits());
        let mut file = match options.open(&target).await {
            Ok(file) => file,
            // ELOOP: the last component became a symlink.
            #[cfg(target_os = "linux")]
            Err(e) if e.raw_os_error() == Some(nix::errno::Errno::ELOOP as i32) => {
                tracing::warn!(path = %relative, "refusing to write through a symlink");
                return Err(SandboxError::InvalidPath(relative.to_string()));
            }
            Err(e) => return Err(e.into()),
        };
        file.write_all(content).await?;
        file.flush().await?;
        Ok(target)
    }
}

/// Lexically apply `.` and `..`. Returns `None` when `..` climbs above the
/// filesystem root.
fn normalize(path: &Path) -> Option<PathBuf> {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Prefix(prefix) => out.push(prefix.as_os_str()),
            Component::RootDir => out.push(component.as_os_str()),
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() || out.as_os_str().is_empty() {
                    return None;
                }
            }
            Component::Normal(part) => out.push(part),
        }
    }
    Some(out)
}

/// Canonicalize the longest existing prefix of `path` and re-append the rest.
///
/// A component that exists but cannot be canonicalized is a dangling symlink;
/// its target is outside our control, so the whole path is rejected.
fn canonicalize_existing(path: &Path, relative: &str) -> SandboxResult<PathBuf> {
    let mut existing = path.to_path_buf();
    let mut tail = Vec::new();

    loop {
        match existing.canonicalize() {
            Ok(canonical) => {
                let mut resolved = canonical;
                for part in tail.iter().rev() {
                    resolved.push(part);
                }
                return Ok(resolved);
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                if fs::symlink_metadata(&existing).is_ok() {
                    tracing::warn!(path = %relative, link = %existing.display(), "dangling symlink in workspace path");
                    return Err(SandboxError::InvalidPath(relative.to_string()));
                }
                let Some(name) = existing.file_name().map(|n| n.to_os_string()) else {
                    return Err(err.into());
                };
                tail.push(name);
                if !existing.pop() {
                    return Err(err.into());
                }
            }
            Err(err) => return Err(err.into()),
        }
    }
}
