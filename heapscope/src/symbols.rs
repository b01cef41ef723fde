//! Symbol search-path configuration
//!
//! The search path is a `;`-separated list of local directories and symbol
//! server entries handed opaquely to the engine, together with a local cache
//! directory that is always configured.

use std::path::{Path, PathBuf};

use serde::Serialize;

/// Separator between search path entries
pub const PATH_SEPARATOR: char = ';';

/// How [`SymbolConfig::apply`] combines new entries with the current path
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SymbolPathMode {
    /// Concatenate to the existing search path
    Append,
    /// Overwrite the existing search path
    #[default]
    Replace,
}

/// Effective symbol configuration
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct SymbolConfig {
    search_path: String,
    cache_dir: Option<PathBuf>,
}

impl SymbolConfig {
    #[must_use]
    pub fn new(search_path: &str, cache_dir: Option<PathBuf>) -> Self {
        let mut config = Self::default();
        config.set_cache_dir(cache_dir);
        config.apply(search_path, SymbolPathMode::Replace);
        config
    }

    /// Combine `paths` with the current search path
    pub fn apply(&mut self, paths: &str, mode: SymbolPathMode) {
        let incoming = entries(paths);
        self.search_path = match mode {
            SymbolPathMode::Replace => incoming.join(";"),
            SymbolPathMode::Append => {
                let mut combined = entries(&self.search_path);
                combined.extend(incoming);
                combined.join(";")
            }
        };
    }

    pub fn set_cache_dir(&mut self, cache_dir: Option<PathBuf>) {
        self.cache_dir = cache_dir.filter(|dir| !dir.as_os_str().is_empty());
    }

    #[must_use]
    pub fn search_path(&self) -> &str {
        &self.search_path
    }

    /// Configured cache directory, or the platform default
    #[must_use]
    pub fn cache_dir(&self) -> PathBuf {
        self.cache_dir.clone().unwrap_or_else(default_cache_dir)
    }
}

/// `<platform cache dir>/heapscope/symbols`
#[must_use]
pub fn default_cache_dir() -> PathBuf {
    dirs::cache_dir().unwrap_or_else(std::env::temp_dir).join("heapscope").join("symbols")
}

/// Create the cache directory if it is missing
///
/// # Errors
/// Returns an error if the directory cannot be created
pub fn ensure_cache_dir(dir: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(dir)
}

fn entries(paths: &str) -> Vec<&str> {
    paths.split(PATH_SEPARATOR).map(str::trim).filter(|e| !e.is_empty()).collect()
}
