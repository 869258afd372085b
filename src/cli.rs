//! Command-line surface (§4.9): a `clap`-derived `Cli`, grounded in the
//! teacher's `engine::arg_parser::Cli` field-for-flag shape, plus the
//! builder-overlay glue the teacher's `engine::cli::setup_opts` used to
//! apply `.nefaxer.toml` before CLI flags win.

use std::path::PathBuf;

use clap::Parser;

use crate::config::{
    ChunkingConsts, IngestOptions, PackagePaths, PersistenceConsts, apply_file_to_builder,
    load_cratekeep_toml,
};

/// Ingest a directory tree into a content-addressed snapshot catalog.
#[derive(Clone, Debug, Parser)]
#[command(name = "cratekeep")]
#[command(about = "Content-addressed filesystem backup ingest.")]
pub struct Cli {
    /// Directory to ingest. Default: current directory.
    #[arg(value_name = "ROOT", default_value = ".")]
    pub root: PathBuf,

    /// Snapshot id to write into. Default: minted from the current time.
    #[arg(long)]
    pub snapshot_id: Option<String>,

    /// Human-readable snapshot name. Default: same as the snapshot id.
    #[arg(long)]
    pub snapshot_name: Option<String>,

    /// Chunk size in bytes.
    #[arg(long)]
    pub chunk_size: Option<usize>,

    /// Include glob patterns (repeatable): -i '*.rs' -i '*.toml'
    #[arg(long = "include", short = 'i')]
    pub include: Vec<String>,

    /// Exclude glob patterns (repeatable): -e '*.log' -e 'target'
    #[arg(long = "exclude", short = 'e')]
    pub exclude: Vec<String>,

    /// Follow symbolic links during the scan. Default: false.
    #[arg(long)]
    pub follow_symlinks: bool,

    /// Detect and preserve sparse-file holes during chunking. Default: false.
    #[arg(long)]
    pub detect_sparse: bool,

    /// Max files chunked concurrently.
    #[arg(long)]
    pub max_concurrent_files: Option<usize>,

    /// Max chunks read concurrently within a single file.
    #[arg(long)]
    pub max_concurrent_chunks: Option<usize>,

    /// Persistence queue capacity (backpressure bound).
    #[arg(long)]
    pub queue_capacity: Option<usize>,

    /// Persistence batch size (chunk rows per transaction).
    #[arg(long)]
    pub batch_size: Option<usize>,

    /// Catalog database path. Default: `<ROOT>/.cratekeep/catalog.db3`.
    #[arg(long)]
    pub db: Option<PathBuf>,

    /// Blob store directory. Default: `<ROOT>/.cratekeep/blobs`.
    #[arg(long)]
    pub store_dir: Option<PathBuf>,

    /// Encrypt the catalog with SQLCipher. Prompts for a passphrase (or reads
    /// `CRATEKEEP_DB_KEY` / `.env`).
    #[arg(long, short = 'x')]
    pub encrypt: bool,

    /// Verbose (debug-level) logging. Default: info-level only.
    #[arg(long, short = 'v')]
    pub verbose: bool,

    /// Shutdown deadline for the persistence worker drain, in seconds.
    #[arg(long, default_value_t = PersistenceConsts::DEFAULT_SHUTDOWN_DEADLINE_SECS)]
    pub shutdown_deadline_secs: u64,
}

/// Overwrite a builder field with the CLI value only when the user actually
/// passed the flag. Mirrors the teacher's `apply_cli_opt!` macro.
macro_rules! apply_cli_opt {
    ($cli:expr, $builder:expr, $field:ident => $setter:ident) => {
        if let Some(v) = $cli.$field.clone() {
            $builder = $builder.$setter(v);
        }
    };
}

impl Cli {
    /// Build an [`IngestOptions`] by layering `.cratekeep.toml` (if present
    /// in `root`) under the CLI flags the user actually passed, the same
    /// file-then-flags precedence as the teacher's `setup_opts`.
    pub fn build_options(&self) -> IngestOptions {
        let mut builder = IngestOptions::builder(self.root.as_path());
        if let Some(file) = load_cratekeep_toml(&self.root) {
            builder = apply_file_to_builder(&file, builder);
        }

        apply_cli_opt!(self, builder, snapshot_id => snapshot_id);
        apply_cli_opt!(self, builder, snapshot_name => snapshot_name);
        apply_cli_opt!(self, builder, chunk_size => chunk_size);
        apply_cli_opt!(self, builder, max_concurrent_files => max_concurrent_files);
        apply_cli_opt!(self, builder, max_concurrent_chunks => max_concurrent_chunks);
        apply_cli_opt!(self, builder, queue_capacity => queue_capacity);
        apply_cli_opt!(self, builder, batch_size => batch_size);
        apply_cli_opt!(self, builder, db => catalog_path);
        apply_cli_opt!(self, builder, store_dir => store_dir);

        if !self.include.is_empty() {
            builder = builder.include(self.include.clone());
        }
        if !self.exclude.is_empty() {
            builder = builder.exclude(self.exclude.clone());
        }
        if self.follow_symlinks {
            builder = builder.follow_symlinks(true);
        }
        if self.detect_sparse {
            builder = builder.detect_sparse(true);
        }

        builder.build()
    }

    pub fn default_chunk_size() -> usize {
        ChunkingConsts::DEFAULT_CHUNK_SIZE
    }

    /// Where `.cratekeep` lives under `root`, used to default `--db`/`--store-dir`.
    pub fn default_state_dir(&self) -> PathBuf {
        self.root.join(PackagePaths::get().default_catalog_dir())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_flags_win_over_defaults() {
        let cli = Cli {
            root: PathBuf::from("/tmp"),
            snapshot_id: None,
            snapshot_name: None,
            chunk_size: Some(1024),
            include: vec![],
            exclude: vec!["*.log".to_string()],
            follow_symlinks: true,
            detect_sparse: false,
            max_concurrent_files: Some(2),
            max_concurrent_chunks: None,
            queue_capacity: None,
            batch_size: None,
            db: None,
            store_dir: None,
            encrypt: false,
            verbose: false,
            shutdown_deadline_secs: PersistenceConsts::DEFAULT_SHUTDOWN_DEADLINE_SECS,
        };
        let opts = cli.build_options();
        assert_eq!(opts.chunk_size, 1024);
        assert_eq!(opts.max_concurrent_files, 2);
        assert_eq!(opts.exclude, vec!["*.log".to_string()]);
        assert!(opts.follow_symlinks);
    }

    #[test]
    fn parses_bare_root_with_defaults() {
        let cli = Cli::parse_from(["cratekeep", "/some/dir"]);
        assert_eq!(cli.root, PathBuf::from("/some/dir"));
        assert_eq!(cli.chunk_size, None);
        assert!(!cli.verbose);
    }

    #[test]
    fn default_state_dir_is_rooted_under_target() {
        let cli = Cli::parse_from(["cratekeep", "/some/dir"]);
        assert_eq!(cli.default_state_dir(), PathBuf::from("/some/dir/.cratekeep"));
    }
}
