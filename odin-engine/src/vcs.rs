//! Narrow interface to an external version-control tool.
//!
//! Only three things are needed: a diff of the working tree, the current
//! commit, and applying a patch in reverse. Every failure degrades to `None`
//! or an `Err(String)` the caller records as a warning.

use std::io;
use std::path::Path;
use std::process::{Command, Output};
use tracing::{debug, warn};

pub trait Vcs: Send + Sync {
    fn is_available(&self, root: &Path) -> bool;

    /// Working-tree diff; `None` when unavailable or the command fails.
    /// An empty diff is `Some("")`.
    fn diff(&self, root: &Path) -> Option<String>;

    fn head_commit(&self, root: &Path) -> Option<String>;

    fn apply_reverse(&self, root: &Path, patch: &str) -> Result<(), String>;
}

/// `git` on the PATH. Available when the root has a `.git` entry.
#[derive(Debug, Clone)]
pub struct GitCli {
    program: String,
}

impl GitCli {
    pub fn new() -> Self {
        Self {
            program: "git".to_string(),
        }
    }

    fn run(&self, root: &Path, args: &[&str]) -> io::Result<Output> {
        debug!("Running {} {}", self.program, args.join(" "));
        Command::new(&self.program)
            .args(args)
            .current_dir(root)
            .output()
    }

    fn stdout_if_ok(&self, root: &Path, args: &[&str]) -> Option<String> {
        match self.run(root, args) {
            Ok(out) if out.status.success() => Some(String::from_utf8_lossy(&out.stdout).into_owned()),
            Ok(out) => {
                debug!(
                    "{} {} exited with {}: {}",
                    self.program,
                    args.join(" "),
                    out.status,
                    String::from_utf8_lossy(&out.stderr).trim()
                );
                None
            }
            Err(e) => {
                warn!("Cannot run {}: {}", self.program, e);
                None
            }
        }
    }
}

impl Default for GitCli {
    fn default() -> Self {
        Self::new()
    }
}

impl Vcs for GitCli {
    fn is_available(&self, root: &Path) -> bool {
        root.join(".git").exists()
    }

    fn diff(&self, root: &Path) -> Option<String> {
        if !self.is_available(root) {
            return None;
        }
        // `diff HEAD` fails in a repository without commits.
        self.stdout_if_ok(root, &["diff", "HEAD"])
            .or_else(|| self.stdout_if_ok(root, &["diff"]))
    }

    fn head_commit(&self, root: &Path) -> Option<String> {
        if !self.is_available(root) {
            return None;
        }
        self.stdout_if_ok(root, &["rev-parse", "HEAD"])
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
    }

    fn apply_reverse(&self, root: &Path, patch: &str) -> Result<(), String> {
        if !self.is_available(root) {
            return Err("no repository at project root".to_string());
        }

        let patch_path = root
            .join(".odin")
            .join(format!(".rollback.{}.patch", std::process::id()));
        if let Some(parent) = patch_path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| e.to_string())?;
        }
        std::fs::write(&patch_path, patch).map_err(|e| e.to_string())?;

        let path_arg = patch_path.to_string_lossy().into_owned();
        let result = match self.run(root, &["apply", "--reverse", &path_arg]) {
            Ok(out) if out.status.success() => Ok(()),
            Ok(out) => Err(format!(
                "git apply --reverse failed: {}",
                String::from_utf8_lossy(&out.stderr).trim()
            )),
            Err(e) => Err(format!("cannot run git: {e}")),
        };

        let _ = std::fs::remove_file(&patch_path);
        result
    }
}

/// Stand-in used when no VCS should be consulted.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoVcs;

impl Vcs for NoVcs {
    fn is_available(&self, _root: &Path) -> bool {
        false
    }

    fn diff(&self, _root: &Path) -> Option<String> {
        None
    }

    fn head_commit(&self, _root: &Path) -> Option<String> {
        None
    }

    fn apply_reverse(&self, _root: &Path, _patch: &str) -> Result<(), String> {
        Err("version control unavailable".to_string())
    }
}
