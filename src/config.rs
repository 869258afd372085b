//! Run configuration: tuning constants, the typed options record consumed by
//! the coordinator, and `.cratekeep.toml` file loading (CLI only — the lib
//! API takes an [`IngestOptions`] directly, same split as the teacher's
//! `NefaxOpts`/`Opts` vs `.nefaxer.toml`).

use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use serde::Deserialize;

// ---- Package / paths (from CARGO_PKG_NAME, cached) ----

pub struct PackagePaths {
    pkg_name: &'static str,
    default_db_dir: String,
    probe_dir_name: String,
}

static PACKAGE_PATHS: OnceLock<PackagePaths> = OnceLock::new();

impl PackagePaths {
    pub fn get() -> &'static PackagePaths {
        PACKAGE_PATHS.get_or_init(|| {
            let pkg = env!("CARGO_PKG_NAME");
            PackagePaths {
                pkg_name: pkg,
                default_db_dir: format!(".{pkg}"),
                probe_dir_name: format!(".{pkg}_probe"),
            }
        })
    }

    pub fn pkg_name(&self) -> &str {
        self.pkg_name
    }

    pub fn default_catalog_dir(&self) -> &str {
        &self.default_db_dir
    }

    pub fn probe_dir_name(&self) -> &str {
        &self.probe_dir_name
    }
}

// ---- Buffer pool ----

/// Default size classes for the tiered buffer pool, in bytes.
pub const DEFAULT_SIZE_CLASSES: &[usize] = &[4096, 16384, 65536, 262144, 1024 * 1024];

pub struct BufferPoolConsts;

impl BufferPoolConsts {
    pub const BACKOFF_START_NS: u64 = 1_000;
    pub const BACKOFF_CAP_NS: u64 = 10_000_000;
    pub const BACKOFF_JITTER: f64 = 0.10;
    pub const RESIZE_INTERVAL_SECS: u64 = 30;
    pub const RESIZE_FAILURE_THRESHOLD: u64 = 5;
    pub const HIGH_UTILIZATION: f64 = 0.8;
    pub const HIGH_FAILURE_RATE: f64 = 0.1;
    pub const LOW_UTILIZATION: f64 = 0.3;
    pub const LOW_FAILURE_RATE: f64 = 0.01;
}

// ---- Worker pool manager ----

pub struct WorkerPoolConsts;

impl WorkerPoolConsts {
    pub const CPU_QUEUE_MIN: usize = 200;
    pub const IO_QUEUE_MIN: usize = 500;
    pub const BATCH_QUEUE_MIN: usize = 200;
    pub const MGMT_QUEUE_MIN: usize = 50;
    pub const IO_BACKPRESSURE_K: f64 = 0.5;
    pub const BATCH_BACKPRESSURE_K: f64 = 0.3;
    pub const RESIZE_INTERVAL_SECS_MIN: u64 = 5;
    pub const RESIZE_INTERVAL_SECS_MAX: u64 = 10;
    pub const HIGH_LOAD: f64 = 0.8;
    pub const LOW_LOAD: f64 = 0.3;
    pub const GROW_FACTOR: f64 = 1.2;
    pub const SHRINK_FACTOR: f64 = 0.9;
    pub const FAILURE_RATE_WARN: f64 = 0.1;
    pub const DEFAULT_SHUTDOWN_DEADLINE_SECS: u64 = 30;
}

// ---- Chunking ----

pub struct ChunkingConsts;

impl ChunkingConsts {
    pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;
    pub const DEFAULT_MAX_CONCURRENT_CHUNKS: usize = 8;
    pub const DEFAULT_MAX_CONCURRENT_FILES: usize = 4;
    /// Whole-file hashing goes single-shot-in-one-buffer below this size, incremental above it.
    pub const SINGLE_SHOT_THRESHOLD: u64 = 1024 * 1024;
}

// ---- Persistence worker ----

pub struct PersistenceConsts;

impl PersistenceConsts {
    pub const DEFAULT_QUEUE_CAPACITY: usize = 10_000;
    pub const DEFAULT_BATCH_SIZE: usize = 200;
    pub const FIRST_ITEM_WAIT_MS: u64 = 100;
    pub const MAX_RETRY_ATTEMPTS: u32 = 5;
    pub const RETRY_BACKOFF_MS: u64 = 200;
    pub const DEFAULT_SHUTDOWN_DEADLINE_SECS: u64 = 30;
}

// ---- Coordinator ----

pub struct CoordinatorConsts;

impl CoordinatorConsts {
    pub const DEFAULT_CHUNKING_TIMEOUT_SECS: u64 = 30;
}

/// Run-scoped, immutable configuration built once at coordinator construction
/// time. Replaces the teacher's post-construction setter wiring: every
/// collaborator and tuning knob is supplied up front via [`IngestOptionsBuilder`].
#[derive(Clone, Debug)]
pub struct IngestOptions {
    pub root: PathBuf,
    pub snapshot_id: Option<String>,
    pub snapshot_name: Option<String>,
    pub chunk_size: usize,
    pub max_concurrent_files: usize,
    pub max_concurrent_chunks: usize,
    pub queue_capacity: usize,
    pub batch_size: usize,
    pub include: Vec<String>,
    pub exclude: Vec<String>,
    pub follow_symlinks: bool,
    pub detect_sparse: bool,
    pub size_classes: Vec<usize>,
    pub catalog_path: PathBuf,
    pub store_dir: PathBuf,
    pub catalog_passphrase: Option<String>,
}

impl IngestOptions {
    pub fn builder(root: impl Into<PathBuf>) -> IngestOptionsBuilder {
        IngestOptionsBuilder::new(root)
    }

    pub fn validate(&self) -> crate::error::Result<()> {
        use crate::error::IngestError;
        if !self.root.is_dir() {
            return Err(IngestError::invalid_input(format!(
                "root is not a directory: {}",
                self.root.display()
            )));
        }
        if self.chunk_size == 0 {
            return Err(IngestError::invalid_input("chunk_size must be > 0"));
        }
        if self.max_concurrent_chunks == 0 || self.max_concurrent_files == 0 {
            return Err(IngestError::invalid_input(
                "max_concurrent_chunks and max_concurrent_files must be > 0",
            ));
        }
        if self.queue_capacity == 0 {
            return Err(IngestError::invalid_input("queue_capacity must be > 0"));
        }
        Ok(())
    }
}

/// Immutable builder: all collaborators and knobs are fixed before the first
/// coordinator state transition, so nothing is re-bound once a run is in flight.
#[derive(Clone, Debug)]
pub struct IngestOptionsBuilder {
    root: PathBuf,
    snapshot_id: Option<String>,
    snapshot_name: Option<String>,
    chunk_size: usize,
    max_concurrent_files: usize,
    max_concurrent_chunks: usize,
    queue_capacity: usize,
    batch_size: usize,
    include: Vec<String>,
    exclude: Vec<String>,
    follow_symlinks: bool,
    detect_sparse: bool,
    size_classes: Vec<usize>,
    catalog_path: Option<PathBuf>,
    store_dir: Option<PathBuf>,
    catalog_passphrase: Option<String>,
}

impl IngestOptionsBuilder {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            snapshot_id: None,
            snapshot_name: None,
            chunk_size: ChunkingConsts::DEFAULT_CHUNK_SIZE,
            max_concurrent_files: ChunkingConsts::DEFAULT_MAX_CONCURRENT_FILES,
            max_concurrent_chunks: ChunkingConsts::DEFAULT_MAX_CONCURRENT_CHUNKS,
            queue_capacity: PersistenceConsts::DEFAULT_QUEUE_CAPACITY,
            batch_size: PersistenceConsts::DEFAULT_BATCH_SIZE,
            include: Vec::new(),
            exclude: Vec::new(),
            follow_symlinks: false,
            detect_sparse: false,
            size_classes: DEFAULT_SIZE_CLASSES.to_vec(),
            catalog_path: None,
            store_dir: None,
            catalog_passphrase: None,
        }
    }

    pub fn snapshot_id(mut self, id: impl Into<String>) -> Self {
        self.snapshot_id = Some(id.into());
        self
    }

    pub fn snapshot_name(mut self, name: impl Into<String>) -> Self {
        self.snapshot_name = Some(name.into());
        self
    }

    pub fn chunk_size(mut self, v: usize) -> Self {
        self.chunk_size = v;
        self
    }

    pub fn max_concurrent_files(mut self, v: usize) -> Self {
        self.max_concurrent_files = v;
        self
    }

    pub fn max_concurrent_chunks(mut self, v: usize) -> Self {
        self.max_concurrent_chunks = v;
        self
    }

    pub fn queue_capacity(mut self, v: usize) -> Self {
        self.queue_capacity = v;
        self
    }

    pub fn batch_size(mut self, v: usize) -> Self {
        self.batch_size = v;
        self
    }

    pub fn include(mut self, patterns: Vec<String>) -> Self {
        self.include = patterns;
        self
    }

    pub fn exclude(mut self, patterns: Vec<String>) -> Self {
        self.exclude = patterns;
        self
    }

    pub fn follow_symlinks(mut self, v: bool) -> Self {
        self.follow_symlinks = v;
        self
    }

    pub fn detect_sparse(mut self, v: bool) -> Self {
        self.detect_sparse = v;
        self
    }

    pub fn size_classes(mut self, v: Vec<usize>) -> Self {
        self.size_classes = v;
        self
    }

    pub fn catalog_path(mut self, p: impl Into<PathBuf>) -> Self {
        self.catalog_path = Some(p.into());
        self
    }

    pub fn store_dir(mut self, p: impl Into<PathBuf>) -> Self {
        self.store_dir = Some(p.into());
        self
    }

    pub fn catalog_passphrase(mut self, p: impl Into<String>) -> Self {
        self.catalog_passphrase = Some(p.into());
        self
    }

    pub fn build(self) -> IngestOptions {
        let default_dir = self.root.join(PackagePaths::get().default_catalog_dir());
        IngestOptions {
            catalog_path: self
                .catalog_path
                .unwrap_or_else(|| default_dir.join("catalog.db3")),
            store_dir: self.store_dir.unwrap_or_else(|| default_dir.join("blobs")),
            root: self.root,
            snapshot_id: self.snapshot_id,
            snapshot_name: self.snapshot_name,
            chunk_size: self.chunk_size,
            max_concurrent_files: self.max_concurrent_files,
            max_concurrent_chunks: self.max_concurrent_chunks,
            queue_capacity: self.queue_capacity,
            batch_size: self.batch_size,
            include: self.include,
            exclude: self.exclude,
            follow_symlinks: self.follow_symlinks,
            detect_sparse: self.detect_sparse,
            size_classes: self.size_classes,
            catalog_passphrase: self.catalog_passphrase,
        }
    }
}

// ---- `.cratekeep.toml` (CLI only) ----

#[derive(Debug, Default, Deserialize)]
pub struct CratekeepToml {
    #[serde(default)]
    pub ingest: IngestSection,
}

#[derive(Debug, Default, Deserialize)]
pub struct IngestSection {
    pub chunk_size: Option<usize>,
    pub max_concurrent_files: Option<usize>,
    pub max_concurrent_chunks: Option<usize>,
    pub queue_capacity: Option<usize>,
    pub batch_size: Option<usize>,
    pub include: Option<Vec<String>>,
    pub exclude: Option<Vec<String>>,
    pub follow_symlinks: Option<bool>,
    pub catalog_path: Option<String>,
    pub store_dir: Option<String>,
}

/// Load `.cratekeep.toml` from `dir` if present. Returns `None` if missing or unreadable.
pub fn load_cratekeep_toml(dir: &Path) -> Option<CratekeepToml> {
    let path = dir.join(".cratekeep.toml");
    let s = std::fs::read_to_string(&path).ok()?;
    toml::from_str(&s)
        .map_err(|e| log::warn!("{}: {}", path.display(), e))
        .ok()
}

/// Apply file config into a builder, only overwriting fields present in the file.
/// CLI flags are expected to be applied afterward so they win over file config.
pub fn apply_file_to_builder(
    file: &CratekeepToml,
    mut builder: IngestOptionsBuilder,
) -> IngestOptionsBuilder {
    let s = &file.ingest;
    if let Some(v) = s.chunk_size {
        builder = builder.chunk_size(v);
    }
    if let Some(v) = s.max_concurrent_files {
        builder = builder.max_concurrent_files(v);
    }
    if let Some(v) = s.max_concurrent_chunks {
        builder = builder.max_concurrent_chunks(v);
    }
    if let Some(v) = s.queue_capacity {
        builder = builder.queue_capacity(v);
    }
    if let Some(v) = s.batch_size {
        builder = builder.batch_size(v);
    }
    if let Some(ref v) = s.include {
        builder = builder.include(v.clone());
    }
    if let Some(ref v) = s.exclude {
        builder = builder.exclude(v.clone());
    }
    if let Some(v) = s.follow_symlinks {
        builder = builder.follow_symlinks(v);
    }
    if let Some(ref v) = s.catalog_path {
        builder = builder.catalog_path(PathBuf::from(v));
    }
    if let Some(ref v) = s.store_dir {
        builder = builder.store_dir(PathBuf::from(v));
    }
    builder
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_defaults_match_consts() {
        let opts = IngestOptions::builder("/tmp").build();
        assert_eq!(opts.chunk_size, ChunkingConsts::DEFAULT_CHUNK_SIZE);
        assert_eq!(opts.queue_capacity, PersistenceConsts::DEFAULT_QUEUE_CAPACITY);
        assert_eq!(opts.catalog_path, PathBuf::from("/tmp/.cratekeep/catalog.db3"));
    }

    #[test]
    fn builder_overrides_apply() {
        let opts = IngestOptions::builder("/tmp")
            .chunk_size(1024)
            .max_concurrent_chunks(2)
            .build();
        assert_eq!(opts.chunk_size, 1024);
        assert_eq!(opts.max_concurrent_chunks, 2);
    }

    #[test]
    fn validate_rejects_zero_chunk_size() {
        let tmp = std::env::temp_dir();
        let opts = IngestOptions::builder(tmp.as_path()).chunk_size(0).build();
        assert!(opts.validate().is_err());
    }

    #[test]
    fn file_config_applies_before_cli_override() {
        let file = CratekeepToml {
            ingest: IngestSection {
                chunk_size: Some(4096),
                ..Default::default()
            },
        };
        let builder = apply_file_to_builder(&file, IngestOptions::builder("/tmp"));
        let opts = builder.chunk_size(8192).build();
        assert_eq!(opts.chunk_size, 8192);
    }
}
