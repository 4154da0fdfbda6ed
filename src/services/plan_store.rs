//! Where plan files live between `plan` and `apply`.

use crate::domain::Project;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

/// Extension of every plan file
const PLAN_EXTENSION: &str = "tfplan";

/// Plan filename for a workspace, prefixed by the project name when it has one.
///
/// Both parts are escaped so the only raw `-` is the name separator and no
/// `/` leaves the project dir: `core-prod.tfplan`, `team%2Fcore-prod.tfplan`,
/// `staging%2Deu.tfplan`.
pub fn plan_filename(workspace: &str, project: Option<&Project>) -> String {
    match project.and_then(|p| p.name.as_deref()) {
        Some(name) => format!(
            "{}-{}.{}",
            escape(name),
            escape(workspace),
            PLAN_EXTENSION
        ),
        None => format!("{}.{}", escape(workspace), PLAN_EXTENSION),
    }
}

fn escape(part: &str) -> String {
    let mut out = String::with_capacity(part.len());
    for c in part.chars() {
        match c {
            '%' => out.push_str("%25"),
            '-' => out.push_str("%2D"),
            '/' => out.push_str("%2F"),
            c => out.push(c),
        }
    }
    out
}

/// Full path of the plan file inside `base_dir`. Pure; touches no files.
pub fn plan_path(base_dir: &Path, workspace: &str, project: Option<&Project>) -> PathBuf {
    base_dir.join(plan_filename(workspace, project))
}

/// Whether a plan file is present. Directories don't count.
pub fn plan_exists(path: &Path) -> bool {
    fs::metadata(path).map(|m| m.is_file()).unwrap_or(false)
}

/// Delete a stale plan. Returns whether a file was removed.
pub fn remove_plan(path: &Path) -> std::io::Result<bool> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}
