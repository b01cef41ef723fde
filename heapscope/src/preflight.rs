//! Pre-flight checks for heapscope
//!
//! Validates the target before a session tries to connect to it. Provides
//! clear, actionable error messages when requirements aren't met.

use anyhow::{bail, Context, Result};
use log::warn;
use std::path::Path;

use crate::engine::live;

/// Yama setting above which attaching to non-child processes needs privileges
const PTRACE_SCOPE_PATH: &str = "/proc/sys/kernel/yama/ptrace_scope";

/// Run all pre-flight checks before attaching to a live process
///
/// # Errors
/// Returns an actionable error if the process is gone or unreadable
pub fn run_attach_checks(pid: u32, quiet: bool) -> Result<()> {
    check_process_exists(pid)?;
    check_proc_access(pid)?;
    check_ptrace_scope(quiet);
    Ok(())
}

/// Check if the target process exists
///
/// # Errors
/// Returns an error if `/proc/<pid>` does not exist
pub fn check_process_exists(pid: u32) -> Result<()> {
    if !live::process_alive(pid) {
        bail!(
            "Process {pid} not found.\n\n\
             Is the process still running? Check with: ps -p {pid}"
        );
    }
    Ok(())
}

/// Check if we can read the process's memory maps
///
/// # Errors
/// Returns an error if `/proc/<pid>/maps` is unreadable
pub fn check_proc_access(pid: u32) -> Result<()> {
    let maps_path = format!("/proc/{pid}/maps");
    std::fs::read_to_string(&maps_path).with_context(|| {
        format!(
            "Cannot read {maps_path}\n\n\
             This usually means:\n\
             - The process doesn't exist (check: ps -p {pid})\n\
             - Permission denied (run as the process owner or with sudo)\n\
             - /proc is not mounted"
        )
    })?;
    Ok(())
}

/// Warn when kernel policy is likely to refuse a debugger attach
fn check_ptrace_scope(quiet: bool) {
    if quiet {
        return;
    }
    let Ok(scope) = std::fs::read_to_string(PTRACE_SCOPE_PATH) else {
        return;
    };
    match scope.trim() {
        "0" | "" => {}
        "3" => warn!("ptrace is disabled ({PTRACE_SCOPE_PATH} = 3); live attach will fail"),
        level => warn!(
            "{PTRACE_SCOPE_PATH} = {level}; attaching to a non-child process may need \
             CAP_SYS_PTRACE or sudo"
        ),
    }
}

/// Check that a snapshot file exists and is readable
///
/// # Errors
/// Returns an error if the path is missing, is a directory, or is unreadable
pub fn check_snapshot_file(path: &Path) -> Result<()> {
    if !path.exists() {
        bail!(
            "Snapshot not found: {}\n\n\
             Make sure the path is correct and the file exists.",
            path.display()
        );
    }
    if !path.is_file() {
        bail!(
            "Not a file: {}\n\n\
             --snapshot must point to a snapshot file, not a directory.",
            path.display()
        );
    }
    std::fs::File::open(path)
        .with_context(|| format!("Cannot open snapshot {}: permission denied?", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_not_found() {
        let result = check_snapshot_file(Path::new("/nonexistent/path/to/app.heap"));
        let err = result.unwrap_err().to_string();
        assert!(err.contains("Snapshot not found"));
    }

    #[test]
    fn test_snapshot_is_directory() {
        let dir = tempfile::tempdir().unwrap();
        let err = check_snapshot_file(dir.path()).unwrap_err().to_string();
        assert!(err.contains("Not a file"));
    }

    #[test]
    fn test_process_not_found() {
        let result = check_process_exists(999_999_999);
        let err = result.unwrap_err().to_string();
        assert!(err.contains("not found"));
    }

    #[test]
    fn test_own_process_passes() {
        assert!(check_process_exists(std::process::id()).is_ok());
    }
}
