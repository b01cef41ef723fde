//! Resolve a process name to its PID.

use anyhow::{bail, Context, Result};
use std::fs;
use std::path::{Path, PathBuf};

use crate::domain::Pid;

/// Result of process lookup.
#[derive(Debug)]
pub struct ProcessInfo {
    pub pid: Pid,
    pub exe_path: PathBuf,
    pub command: String,
    /// Full command line; managed apps launched through a host (`dotnet
    /// app.dll`) are only recognisable by their arguments
    pub cmdline: String,
}

/// Find a process by name.
///
/// Searches `/proc` for processes matching the given name.
/// Matches against the command name from `/proc/<pid>/stat`, the
/// executable basename from `/proc/<pid>/exe`, and the arguments from
/// `/proc/<pid>/cmdline`. The calling process is never matched.
///
/// # Errors
/// - No processes found
/// - Multiple processes found (ambiguous)
pub fn find_process_by_name(name: &str) -> Result<ProcessInfo> {
    let mut matches: Vec<ProcessInfo> = Vec::new();
    let own_pid = std::process::id();

    let proc_dir = fs::read_dir("/proc").context("Failed to read /proc")?;

    for entry in proc_dir.flatten() {
        let file_name = entry.file_name();
        let pid_str = file_name.to_string_lossy();

        let Ok(pid) = pid_str.parse::<u32>() else {
            continue;
        };
        if pid == own_pid {
            continue;
        }

        // Skip kernel threads and inaccessible processes
        let Ok(exe_path) = fs::read_link(format!("/proc/{pid}/exe")) else {
            continue;
        };

        let Ok(stat_content) = fs::read_to_string(format!("/proc/{pid}/stat")) else {
            continue;
        };

        let Ok(command) = extract_comm(&stat_content) else {
            continue;
        };

        let cmdline = fs::read(format!("/proc/{pid}/cmdline"))
            .map(|raw| parse_cmdline(&raw))
            .unwrap_or_default();

        if is_match(&command, &exe_path, &cmdline, name) {
            matches.push(ProcessInfo {
                pid: Pid(pid),
                exe_path,
                command,
                cmdline,
            });
        }
    }

    match matches.len() {
        0 => bail!(
            "No process matching '{name}' found.\n\
             Check running processes with: ps aux | grep {name}"
        ),
        1 => Ok(matches.remove(0)),
        _ => {
            let list: Vec<String> =
                matches.iter().map(|m| format!("  {} ({})", m.pid.0, m.cmdline)).collect();
            bail!(
                "Multiple processes match '{name}':\n{}\n\n\
                 Specify PID explicitly: heapscope --pid <PID>",
                list.join("\n")
            )
        }
    }
}

/// Extract command name from `/proc/<pid>/stat`.
/// Format: "pid (comm) state ..."
fn extract_comm(stat_line: &str) -> Result<String> {
    let open = stat_line.find('(').context("Invalid stat format")?;
    let close = stat_line.rfind(')').context("Invalid stat format")?;
    if open >= close {
        bail!("Invalid stat format");
    }
    Ok(stat_line[open + 1..close].to_string())
}

/// NUL-separated arguments → space-separated string
fn parse_cmdline(raw: &[u8]) -> String {
    raw.split(|b| *b == 0)
        .filter(|arg| !arg.is_empty())
        .map(String::from_utf8_lossy)
        .collect::<Vec<_>>()
        .join(" ")
}

/// Check if process matches the search pattern.
fn is_match(command: &str, exe_path: &Path, cmdline: &str, pattern: &str) -> bool {
    let exe_basename = exe_path.file_name().and_then(|n| n.to_str()).unwrap_or("");

    let pattern_basename =
        Path::new(pattern).file_name().and_then(|n| n.to_str()).unwrap_or(pattern);

    // Exact match on command or exe basename
    command == pattern_basename
        || exe_basename == pattern_basename
        // Substring match for flexibility
        || command.contains(pattern)
        || exe_basename.contains(pattern)
        // Hosted apps: `dotnet MyApp.dll`
        || cmdline.split_whitespace().skip(1).any(|arg| {
            Path::new(arg).file_stem().and_then(|s| s.to_str()) == Some(pattern_basename)
        })
}
