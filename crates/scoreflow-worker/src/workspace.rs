// Per-step workspace management.
//
// Each (app, environment, step-key) owns a private directory under a
// predictable root: workspaces/<app>-<env>/<step-key>/. Workspaces survive
// success (operators inspect them) and are reused on retry so terraform
// state stays put. Single-writer: one worker owns a given directory at a
// time, guaranteed by the queue's one-claimant-per-task rule.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Context;

/// Creates and resolves per-step workspace directories
#[derive(Debug, Clone)]
pub struct WorkspaceManager {
    root: PathBuf,
}

impl WorkspaceManager {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// The workspace for one step, created on first use
    pub fn step_dir(&self, app: &str, environment: &str, step_key: &str) -> anyhow::Result<PathBuf> {
        let dir = self
            .root
            .join(format!("{app}-{environment}"))
            .join(sanitize(step_key));
        fs::create_dir_all(&dir).with_context(|| format!("create workspace {}", dir.display()))?;
        Ok(dir)
    }

    /// Remove and recreate, for steps that need a fresh checkout
    pub fn fresh_step_dir(
        &self,
        app: &str,
        environment: &str,
        step_key: &str,
    ) -> anyhow::Result<PathBuf> {
        let dir = self.step_dir(app, environment, step_key)?;
        fs::remove_dir_all(&dir).with_context(|| format!("clear workspace {}", dir.display()))?;
        fs::create_dir_all(&dir).with_context(|| format!("create workspace {}", dir.display()))?;
        Ok(dir)
    }
}

/// Step keys come from user-authored names and paths; keep them inside the
/// workspace root
fn sanitize(key: &str) -> String {
    key.chars()
        .map(|c| match c {
            'a'..='z' | 'A'..='Z' | '0'..='9' | '-' | '_' | '.' => c,
            _ => '-',
        })
        .collect()
}

/// Recursively copy every file matching `extension` from `src` into `dst`,
/// preserving relative paths
pub fn copy_files_with_extension(src: &Path, dst: &Path, extension: &str) -> anyhow::Result<usize> {
    let mut copied = 0;
    copy_recursive(src, src, dst, extension, &mut copied)?;
    Ok(copied)
}

fn copy_recursive(
    root: &Path,
    current: &Path,
    dst: &Path,
    extension: &str,
    copied: &mut usize,
) -> anyhow::Result<()> {
    for entry in fs::read_dir(current).with_context(|| format!("read {}", current.display()))? {
        let path = entry?.path();
        if path.is_dir() {
            copy_recursive(root, &path, dst, extension, copied)?;
        } else if path.extension().and_then(|e| e.to_str()) == Some(extension) {
            let relative = path.strip_prefix(root).expect("path is under root");
            let target = dst.join(relative);
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::copy(&path, &target)
                .with_context(|| format!("copy {} to {}", path.display(), target.display()))?;
            *copied += 1;
        }
    }
    Ok(())
}
