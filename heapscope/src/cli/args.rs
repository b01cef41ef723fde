//! CLI argument definitions

use clap::{Parser, ValueEnum};
use heapscope_common::ReaderKind;
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "heapscope",
    about = "Inspect the managed heap of a running process or snapshot",
    after_help = "\
EXAMPLES:
    heapscope --snapshot app.heap.json --stats          Heap size by generation
    heapscope --snapshot app.heap.json --object 0x7f..  Materialize one object
    heapscope --snapshot app.heap.json --blocking 4242  Blocking objects of a thread
    heapscope my-app --threads                          Attach by process name"
)]
pub struct Args {
    /// Process name to attach to (auto-detects PID)
    #[arg(value_name = "PROCESS", conflicts_with_all = ["pid", "snapshot"])]
    pub process: Option<String>,

    /// Process ID to attach to
    #[arg(short, long, conflicts_with = "snapshot")]
    pub pid: Option<u32>,

    /// Snapshot file to load instead of attaching
    #[arg(short, long, value_name = "FILE")]
    pub snapshot: Option<PathBuf>,

    /// Snapshot reader backend
    #[arg(long, value_enum, default_value_t = ReaderArg::DebugEngine)]
    pub reader: ReaderArg,

    /// Attach/load timeout in milliseconds
    #[arg(long, default_value = "5000")]
    pub timeout_ms: u64,

    /// Symbol search path (`;`-separated)
    #[arg(long, env = "_NT_SYMBOL_PATH", value_name = "PATHS")]
    pub symbol_path: Option<String>,

    /// Append --symbol-path to the current search path instead of replacing it
    #[arg(long, requires = "symbol_path")]
    pub append_symbols: bool,

    /// Local symbol cache directory
    #[arg(long, value_name = "DIR")]
    pub symbol_cache: Option<PathBuf>,

    /// List managed threads with their stacks
    #[arg(long)]
    pub threads: bool,

    /// Show heap size by generation
    #[arg(long)]
    pub stats: bool,

    /// Show object counts and sizes by type
    #[arg(long)]
    pub histogram: bool,

    /// Materialize the object at ADDR (hex)
    #[arg(long, value_name = "ADDR")]
    pub object: Option<String>,

    /// Type handle for --object (hex); read from the object header if omitted
    #[arg(long = "type", value_name = "HANDLE", requires = "object")]
    pub type_handle: Option<String>,

    /// Detect blocking objects of the thread with this OS thread ID
    #[arg(long, value_name = "TID")]
    pub blocking: Option<u32>,

    /// Print results as JSON
    #[arg(long)]
    pub json: bool,

    /// Suppress non-essential output
    #[arg(short, long)]
    pub quiet: bool,
}

impl Args {
    /// Returns true if no inspection action was requested
    #[must_use]
    pub fn no_action(&self) -> bool {
        !(self.threads
            || self.stats
            || self.histogram
            || self.object.is_some()
            || self.blocking.is_some())
    }
}

/// `--reader` values
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ReaderArg {
    DebugEngine,
    Direct,
}

impl From<ReaderArg> for ReaderKind {
    fn from(arg: ReaderArg) -> Self {
        match arg {
            ReaderArg::DebugEngine => ReaderKind::DebugEngine,
            ReaderArg::Direct => ReaderKind::Direct,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_args() {
        let args = Args::try_parse_from([
            "heapscope",
            "--snapshot",
            "app.heap.json",
            "--reader",
            "direct",
            "--object",
            "0x1000",
        ])
        .unwrap();
        assert_eq!(ReaderKind::from(args.reader), ReaderKind::Direct);
        assert_eq!(args.object.as_deref(), Some("0x1000"));
        assert_eq!(args.timeout_ms, 5000);
        assert!(!args.no_action());
    }

    #[test]
    fn test_pid_conflicts_with_snapshot() {
        assert!(Args::try_parse_from(["heapscope", "--pid", "1", "--snapshot", "x"]).is_err());
    }

    #[test]
    fn test_type_requires_object() {
        assert!(Args::try_parse_from(["heapscope", "--pid", "1", "--type", "0x10"]).is_err());
    }
}
