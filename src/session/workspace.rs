use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

/// Session ids name host directories, so they are restricted to a safe set.
pub fn validate_session_id(id: &str) -> Result<()> {
    let valid = !id.is_empty()
        && id != "."
        && id != ".."
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'));
    if valid {
        Ok(())
    } else {
        Err(Error::InvalidSessionId(id.to_string()))
    }
}

/// `{root}/{id}/workspace`
pub fn workspace_path(root: &Path, id: &str) -> PathBuf {
    root.join(id).join("workspace")
}

/// Create the session workspace if missing. Safe to race on the same path.
pub fn ensure_workspace(root: &Path, id: &str) -> Result<PathBuf> {
    let path = workspace_path(root, id);
    fs::create_dir_all(&path)?;
    Ok(path)
}
