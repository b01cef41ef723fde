//! Bundled introspection engine
//!
//! [`DefaultEngine`] is the engine heapscope uses when no native backend is
//! plugged in. It serves heap-image snapshots with either reader kind,
//! recognises native dump formats it cannot read, and probes live processes
//! far enough to give an accurate reason for refusing them.

pub mod image;
pub mod live;

use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::Duration;

use heapscope_common::{DataTarget, Engine, EngineError, ReaderKind};
use log::{debug, info};
use object::FileKind;

pub use image::{HeapImage, HeapImageBuilder};

/// Creates the engine on the session's serialized context
pub type EngineLoader = Box<dyn FnOnce() -> Result<Box<dyn Engine>, EngineError> + Send>;

/// Number of leading bytes inspected to identify a snapshot file
const SNIFF_LEN: usize = 64;

/// Container format of a snapshot file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotFormat {
    /// JSON heap image
    HeapImage,
    /// Windows minidump (`MDMP`)
    Minidump,
    /// ELF core file
    ElfCore,
    Unknown,
}

impl SnapshotFormat {
    /// Identify a snapshot from its leading bytes
    #[must_use]
    pub fn detect(header: &[u8]) -> Self {
        let trimmed = header
            .iter()
            .position(|b| !b.is_ascii_whitespace())
            .map_or(&[][..], |start| &header[start..]);
        if trimmed.first() == Some(&b'{') {
            return SnapshotFormat::HeapImage;
        }
        if header.starts_with(b"MDMP") {
            return SnapshotFormat::Minidump;
        }
        match FileKind::parse(header) {
            Ok(FileKind::Elf32 | FileKind::Elf64) => SnapshotFormat::ElfCore,
            _ => SnapshotFormat::Unknown,
        }
    }
}

/// Engine serving heap images and probing live processes
#[derive(Debug, Default)]
pub struct DefaultEngine {
    search_path: String,
    cache_dir: Option<PathBuf>,
}

impl DefaultEngine {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Loader for [`crate::Session::new`]
    #[must_use]
    pub fn loader() -> EngineLoader {
        Box::new(|| Ok::<_, EngineError>(Box::new(DefaultEngine::new()) as Box<dyn Engine>))
    }

    /// Symbol search path last configured on this engine
    #[must_use]
    pub fn search_path(&self) -> &str {
        &self.search_path
    }

    #[must_use]
    pub fn cache_dir(&self) -> Option<&Path> {
        self.cache_dir.as_deref()
    }
}

impl Engine for DefaultEngine {
    fn attach(&mut self, pid: u32, timeout: Duration) -> Result<Box<dyn DataTarget>, EngineError> {
        debug!("Probing process {pid} (timeout {timeout:?})");
        let module = live::probe_process(pid)?;
        info!("Process {pid} hosts {} from {} at {}", module.flavor, module.path, module.range);
        Err(EngineError::Unsupported(format!(
            "process {pid} runs {}, but live attach needs a native debugger engine; \
             capture a heap image and load it as a snapshot instead",
            module.flavor
        )))
    }

    fn open_snapshot(
        &mut self,
        path: &Path,
        reader: ReaderKind,
    ) -> Result<Box<dyn DataTarget>, EngineError> {
        let mut header = Vec::with_capacity(SNIFF_LEN);
        File::open(path)
            .and_then(|f| f.take(SNIFF_LEN as u64).read_to_end(&mut header))
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    EngineError::SnapshotMissing(path.display().to_string())
                } else {
                    EngineError::SnapshotCorrupt(format!("{}: {e}", path.display()))
                }
            })?;

        match SnapshotFormat::detect(&header) {
            SnapshotFormat::HeapImage => {
                let image = HeapImage::load(path)?;
                info!(
                    "Loaded heap image {} ({} objects, {} threads, reader {reader})",
                    path.display(),
                    image.objects.len(),
                    image.threads.len()
                );
                Ok(Box::new(image.into_target(reader)))
            }
            SnapshotFormat::Minidump => Err(EngineError::Unsupported(format!(
                "{} is a minidump; reading it needs a native debugger engine",
                path.display()
            ))),
            SnapshotFormat::ElfCore => Err(EngineError::Unsupported(format!(
                "{} is an ELF core file; reading it needs a native debugger engine",
                path.display()
            ))),
            SnapshotFormat::Unknown => Err(EngineError::SnapshotCorrupt(format!(
                "{}: unrecognized snapshot format",
                path.display()
            ))),
        }
    }

    fn set_symbol_path(&mut self, search_path: &str, cache_dir: &Path) -> Result<(), EngineError> {
        debug!("Symbol path: {search_path} (cache {})", cache_dir.display());
        self.search_path = search_path.to_string();
        self.cache_dir = Some(cache_dir.to_path_buf());
        Ok(())
    }
}
