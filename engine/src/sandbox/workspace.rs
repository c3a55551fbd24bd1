/// Per-run workspace directories
///
/// Every sandbox run gets a fresh directory under the sandbox root,
/// named by the run id. Teardown is idempotent: removing a workspace
/// that is already gone succeeds, so a retry after a crash cannot fail
/// on cleanup.
use sdk::errors::CoreError;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

pub struct Workspace {
    run_id: String,
    path: PathBuf,
}

impl Workspace {
    /// Create the directory for a run. Failure here is a provisioning
    /// failure, not an execution failure.
    pub fn provision(root: &Path, run_id: &str) -> Result<Self, CoreError> {
        if run_id.is_empty() || run_id.contains(['/', '\\', '.']) {
            return Err(CoreError::Validation(format!(
                "Invalid sandbox run id '{}'",
                run_id
            )));
        }
        let path = root.join(run_id);
        std::fs::create_dir_all(&path).map_err(|e| {
            CoreError::ProvisionError(format!(
                "Failed to create workspace {}: {}",
                path.display(),
                e
            ))
        })?;
        debug!(run_id = %run_id, path = %path.display(), "Provisioned workspace");
        Ok(Self {
            run_id: run_id.to_string(),
            path,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Remove the workspace directory. Safe to call more than once.
    pub fn teardown(&self) -> Result<(), CoreError> {
        match std::fs::remove_dir_all(&self.path) {
            Ok(()) => {
                debug!(run_id = %self.run_id, "Tore down workspace");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(CoreError::Io(e)),
        }
    }
}

/// Remove workspace directories left behind by runs that no longer
/// exist, e.g. after an unclean shutdown. Returns how many were removed.
pub fn sweep_orphans(root: &Path, active_run_ids: &HashSet<String>) -> Result<usize, CoreError> {
    let entries = match std::fs::read_dir(root) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(CoreError::Io(e)),
    };

    let mut removed = 0;
    for entry in entries {
        let entry = entry.map_err(CoreError::Io)?;
        let name = entry.file_name().to_string_lossy().to_string();
        if active_run_ids.contains(&name) {
            continue;
        }
        match std::fs::remove_dir_all(entry.path()) {
            Ok(()) => removed += 1,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                warn!(workspace = %name, error = %e, "Failed to sweep orphaned workspace");
            }
        }
    }
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_provision_and_teardown_idempotent() {
        let temp = TempDir::new().unwrap();
        let ws = Workspace::provision(temp.path(), "run-1").unwrap();
        assert!(ws.path().is_dir());

        ws.teardown().unwrap();
        assert!(!ws.path().exists());
        // Second teardown is a no-op
        ws.teardown().unwrap();
    }

    #[test]
    fn test_run_id_cannot_escape_root() {
        let temp = TempDir::new().unwrap();
        for bad in ["../escape", "a/b", "", "."] {
            assert!(Workspace::provision(temp.path(), bad).is_err());
        }
    }

    #[test]
    fn test_sweep_keeps_active_runs() {
        let temp = TempDir::new().unwrap();
        let _active = Workspace::provision(temp.path(), "run-live").unwrap();
        let _orphan = Workspace::provision(temp.path(), "run-dead").unwrap();

        let mut active = HashSet::new();
        active.insert("run-live".to_string());
        let removed = sweep_orphans(temp.path(), &active).unwrap();

        assert_eq!(removed, 1);
        assert!(temp.path().join("run-live").exists());
        assert!(!temp.path().join("run-dead").exists());
    }
}
