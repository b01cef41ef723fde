//! Live process probing
//!
//! Reads `/proc/<pid>/maps` to find the managed runtime module loaded into a
//! process. This is how a live attach decides between "no managed runtime"
//! and "runtime present but no native reader available".

use std::fmt;
use std::fs;

use heapscope_common::EngineError;
use log::{debug, info};

/// Shared objects that host a managed runtime
const RUNTIME_MODULES: &[(&str, &str)] = &[
    ("libcoreclr.so", "CoreCLR"),
    ("libmonosgen-2.0.so", "Mono"),
    ("libmono-native.so", "Mono"),
];

/// Memory range of a loaded module in a process's address space
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryRange {
    pub start: u64,
    pub end: u64,
}

impl fmt::Display for MemoryRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "0x{:x} - 0x{:x} (size: {} KB)",
            self.start,
            self.end,
            self.end.saturating_sub(self.start) / 1024
        )
    }
}

/// A managed runtime module found in a live process
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeModule {
    pub flavor: &'static str,
    pub path: String,
    pub range: MemoryRange,
}

/// Check that `pid` exists, that its maps are readable, and that it hosts a
/// managed runtime
///
/// # Errors
/// Returns [`EngineError::ProcessNotFound`], [`EngineError::AccessDenied`] or
/// [`EngineError::NoManagedRuntime`]
pub fn probe_process(pid: u32) -> Result<RuntimeModule, EngineError> {
    if !process_alive(pid) {
        return Err(EngineError::ProcessNotFound(pid));
    }
    let maps_path = format!("/proc/{pid}/maps");
    let maps = fs::read_to_string(&maps_path).map_err(|e| EngineError::AccessDenied {
        pid,
        reason: format!("cannot read {maps_path}: {e}"),
    })?;
    find_runtime_module(&maps)
        .ok_or_else(|| EngineError::NoManagedRuntime(format!("process {pid}")))
}

/// Returns true while `/proc/<pid>` exists
#[must_use]
pub fn process_alive(pid: u32) -> bool {
    std::path::Path::new(&format!("/proc/{pid}")).exists()
}

/// Find the first runtime module in the text of a `/proc/<pid>/maps` file,
/// returning the range spanning all of its mappings
#[must_use]
pub fn find_runtime_module(maps: &str) -> Option<RuntimeModule> {
    let (module, flavor) = RUNTIME_MODULES.iter().find(|(module, _)| {
        maps.lines().any(|line| mapping_path(line).is_some_and(|p| p.ends_with(module)))
    })?;

    let mut path = None;
    let mut start_addr: Option<u64> = None;
    let mut end_addr: Option<u64> = None;

    // Find ALL mappings of the module to get the full range
    for line in maps.lines() {
        let Some(mapped) = mapping_path(line) else { continue };
        if !mapped.ends_with(module) {
            continue;
        }
        let Some((start, end)) = parse_range(line) else {
            debug!("Skipping malformed maps line: {line}");
            continue;
        };
        start_addr = Some(start_addr.map_or(start, |s| s.min(start)));
        end_addr = Some(end_addr.map_or(end, |e| e.max(end)));
        path.get_or_insert_with(|| mapped.to_string());
    }

    let range = MemoryRange {
        start: start_addr?,
        end: end_addr?,
    };
    let path = path?;
    info!("{flavor} runtime at {range}: {path}");
    Some(RuntimeModule {
        flavor,
        path,
        range,
    })
}

/// Parse the line: "start-end perms offset dev inode pathname"
fn parse_range(line: &str) -> Option<(u64, u64)> {
    let range = line.split_whitespace().next()?;
    let (start, end) = range.split_once('-')?;
    Some((u64::from_str_radix(start, 16).ok()?, u64::from_str_radix(end, 16).ok()?))
}

fn mapping_path(line: &str) -> Option<&str> {
    line.split_whitespace().nth(5)
}

#[cfg(test)]
mod tests {
    use super::*;

    const MAPS: &str = "\
55d0c0a00000-55d0c0a02000 r--p 00000000 08:01 1312 /usr/share/dotnet/dotnet
7f3a10000000-7f3a10200000 r--p 00000000 08:01 4242 /usr/share/dotnet/shared/Microsoft.NETCore.App/8.0.0/libcoreclr.so
7f3a10200000-7f3a10600000 r-xp 00200000 08:01 4242 /usr/share/dotnet/shared/Microsoft.NETCore.App/8.0.0/libcoreclr.so
7f3a10600000-7f3a10640000 rw-p 00600000 08:01 4242 /usr/share/dotnet/shared/Microsoft.NETCore.App/8.0.0/libcoreclr.so
7ffd00000000-7ffd00021000 rw-p 00000000 00:00 0 [stack]
";

    #[test]
    fn test_find_runtime_module_spans_all_mappings() {
        let module = find_runtime_module(MAPS).unwrap();
        assert_eq!(module.flavor, "CoreCLR");
        assert!(module.path.ends_with("libcoreclr.so"));
        assert_eq!(
            module.range,
            MemoryRange {
                start: 0x7f3a_1000_0000,
                end: 0x7f3a_1064_0000,
            }
        );
    }

    #[test]
    fn test_no_runtime_module() {
        let maps = "55d0c0a00000-55d0c0a02000 r--p 00000000 08:01 1312 /usr/bin/sleep\n";
        assert!(find_runtime_module(maps).is_none());
    }

    #[test]
    fn test_memory_range_display() {
        let range = MemoryRange {
            start: 0x1000,
            end: 0x3000,
        };
        assert_eq!(range.to_string(), "0x1000 - 0x3000 (size: 8 KB)");
    }

    #[test]
    fn test_probe_missing_process() {
        assert_eq!(probe_process(999_999_999), Err(EngineError::ProcessNotFound(999_999_999)));
    }

    #[test]
    fn test_probe_self_has_no_runtime() {
        let pid = std::process::id();
        // Either our maps are readable (and contain no managed runtime) or the
        // sandbox denies access
        let err = probe_process(pid).unwrap_err();
        assert!(matches!(
            err,
            EngineError::NoManagedRuntime(_) | EngineError::AccessDenied { .. }
        ));
    }
}
