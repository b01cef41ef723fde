//! Domain types providing compile-time safety and self-documentation
//!
//! These newtype wrappers prevent common bugs like passing a thread ID where a
//! process ID is expected, and make function signatures more expressive.

use std::fmt;

pub use heapscope_common::{DomainId, Tid, TypeHandle};

/// Process ID
///
/// Represents a process ID in the system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Pid(pub u32);

impl fmt::Display for Pid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PID:{}", self.0)
    }
}

impl From<u32> for Pid {
    fn from(pid: u32) -> Self {
        Pid(pid)
    }
}

/// Address in the target's address space
///
/// Displays as a fixed-width hex pointer so every rendered address lines up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Address(pub u64);

impl Address {
    pub const NULL: Address = Address(0);

    #[must_use]
    pub fn is_null(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:016x}", self.0)
    }
}

impl From<u64> for Address {
    fn from(addr: u64) -> Self {
        Address(addr)
    }
}

/// Parse a user-supplied address (`0x`-prefixed hex or bare hex)
///
/// # Errors
/// Returns an error if the string is not valid hexadecimal
pub fn parse_address(s: &str) -> Result<u64, std::num::ParseIntError> {
    let digits = s.trim().trim_start_matches("0x").trim_start_matches("0X");
    u64::from_str_radix(digits, 16)
}

/// Where the session is connected
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    Process(Pid),
    Snapshot(std::path::PathBuf),
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Target::Process(pid) => write!(f, "{pid}"),
            Target::Snapshot(path) => write!(f, "snapshot {}", path.display()),
        }
    }
}
