//! End-to-end ingest tests: run the real coordinator over a small tree and
//! check what landed in the catalog and content store, rather than poking
//! individual modules.

use std::path::Path;
use std::sync::Arc;

use cratekeep::catalog::{Catalog, SnapshotState};
use cratekeep::config::IngestOptions;
use cratekeep::coordinator::IngestCoordinator;
use cratekeep::progress::NullProgressListener;
use cratekeep::store::ContentStore;

fn write_file(dir: &Path, name: &str, content: &[u8]) {
    std::fs::write(dir.join(name), content).unwrap();
}

fn run(options: IngestOptions) -> (Arc<IngestCoordinator>, cratekeep::coordinator::IngestReport) {
    let coordinator = Arc::new(IngestCoordinator::new(options, Arc::new(NullProgressListener)).unwrap());
    let report = coordinator.start().unwrap();
    (coordinator, report)
}

fn chunk_row_count(db_path: &Path) -> i64 {
    let conn = rusqlite::Connection::open(db_path).unwrap();
    conn.query_row("SELECT COUNT(*) FROM chunks", [], |row| row.get(0))
        .unwrap()
}

fn chunk_refcount_and_size(db_path: &Path, fingerprint_hex: &str) -> (i64, i64) {
    let conn = rusqlite::Connection::open(db_path).unwrap();
    conn.query_row(
        "SELECT refcount, size FROM chunks WHERE fingerprint = ?1",
        [fingerprint_hex],
        |row| Ok((row.get(0)?, row.get(1)?)),
    )
    .unwrap()
}

#[test]
fn identical_file_contents_share_a_single_chunk_row() {
    use cratekeep::hash::{Blake3Hasher, Hasher};

    let dir = tempfile::tempdir().unwrap();
    write_file(dir.path(), "a.txt", b"the quick brown fox");
    write_file(dir.path(), "b.txt", b"the quick brown fox");
    write_file(dir.path(), "c.txt", b"something else entirely");

    let options = IngestOptions::builder(dir.path()).snapshot_id("dedup-1").build();
    let (coordinator, report) = run(options.clone());

    assert_eq!(report.counters.processed_files, 3);
    // two distinct contents -> two chunk rows, no matter how many files share one.
    assert_eq!(chunk_row_count(&options.catalog_path), 2);

    // the shared content's chunk row was referenced by two manifests, so its
    // refcount should reflect both references, and its size should have been
    // filled in rather than left at the placeholder 0.
    let shared_fp = Blake3Hasher.hash(b"the quick brown fox");
    let (refcount, size) = chunk_refcount_and_size(&options.catalog_path, &shared_fp.to_hex());
    assert_eq!(refcount, 2);
    assert_eq!(size, 19);

    let lone_fp = Blake3Hasher.hash(b"something else entirely");
    let (lone_refcount, lone_size) = chunk_refcount_and_size(&options.catalog_path, &lone_fp.to_hex());
    assert_eq!(lone_refcount, 1);
    assert_eq!(lone_size, 24);

    let snap = coordinator
        .catalog()
        .get_snapshot("dedup-1")
        .unwrap()
        .unwrap();
    assert_eq!(snap.state, SnapshotState::Sealed);
    assert_eq!(snap.file_count, 3);
}

#[test]
fn stored_chunk_bytes_round_trip_through_the_content_store() {
    use cratekeep::hash::{Blake3Hasher, Hasher};

    let dir = tempfile::tempdir().unwrap();
    write_file(dir.path(), "only.txt", b"round trip me");

    let options = IngestOptions::builder(dir.path()).build();
    let (coordinator, report) = run(options);
    assert_eq!(report.counters.processed_files, 1);

    let fp = Blake3Hasher.hash(b"round trip me");
    let store = coordinator.content_store();
    assert!(store.exists(&fp).unwrap());
    assert_eq!(store.retrieve(&fp).unwrap(), b"round trip me");
}

#[test]
fn exclude_patterns_skip_matching_files() {
    let dir = tempfile::tempdir().unwrap();
    write_file(dir.path(), "keep.rs", b"fn main() {}");
    write_file(dir.path(), "drop.log", b"noisy log line");

    let options = IngestOptions::builder(dir.path())
        .exclude(vec!["*.log".to_string()])
        .build();
    let (_coordinator, report) = run(options);

    assert_eq!(report.counters.processed_files, 1);
}

#[test]
fn include_patterns_restrict_to_matching_files() {
    let dir = tempfile::tempdir().unwrap();
    write_file(dir.path(), "keep.rs", b"fn main() {}");
    write_file(dir.path(), "also.rs", b"fn other() {}");
    write_file(dir.path(), "skip.txt", b"plain text");

    let options = IngestOptions::builder(dir.path())
        .include(vec!["*.rs".to_string()])
        .build();
    let (_coordinator, report) = run(options);

    assert_eq!(report.counters.processed_files, 2);
}

#[test]
fn nested_directories_are_walked_recursively() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::create_dir_all(dir.path().join("a/b/c")).unwrap();
    write_file(dir.path(), "top.txt", b"top");
    write_file(&dir.path().join("a"), "mid.txt", b"mid");
    write_file(&dir.path().join("a/b/c"), "deep.txt", b"deep");

    let options = IngestOptions::builder(dir.path()).build();
    let (_coordinator, report) = run(options);

    assert_eq!(report.counters.processed_files, 3);
    assert_eq!(report.counters.errored_files, 0);
}

#[test]
fn cancelling_before_start_still_produces_a_valid_sealed_snapshot() {
    // Requesting cancellation before any scan work has happened should not
    // corrupt the run: the coordinator seals whatever (possibly nothing) it
    // managed to process rather than leaving the catalog mid-transaction.
    let dir = tempfile::tempdir().unwrap();
    write_file(dir.path(), "a.txt", b"hello");

    let options = IngestOptions::builder(dir.path()).snapshot_id("cancel-1").build();
    let coordinator = Arc::new(IngestCoordinator::new(options, Arc::new(NullProgressListener)).unwrap());
    coordinator.request_cancel();

    let report = coordinator.start().unwrap();
    let snap = coordinator
        .catalog()
        .get_snapshot("cancel-1")
        .unwrap()
        .unwrap();
    assert_eq!(snap.state, SnapshotState::Sealed);
    assert!(report.counters.processed_files <= 1);
}

#[test]
fn chunk_size_smaller_than_file_splits_into_multiple_chunks() {
    let dir = tempfile::tempdir().unwrap();
    write_file(dir.path(), "big.bin", &vec![7u8; 10_000]);

    let options = IngestOptions::builder(dir.path()).chunk_size(1024).build();
    let (_coordinator, report) = run(options);

    assert_eq!(report.counters.processed_files, 1);
    assert_eq!(report.counters.errored_files, 0);
}
