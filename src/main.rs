//! cratekeep CLI: ingest a directory tree into a content-addressed catalog.

use std::process::ExitCode;
use std::sync::Arc;
use std::time::Instant;

use clap::Parser;

use cratekeep::cli::Cli;
use cratekeep::config::IngestOptions;
use cratekeep::coordinator::IngestCoordinator;
use cratekeep::logging::setup_logging;
use cratekeep::progress::{KdamProgressListener, ProgressListener};
use cratekeep::utils::passphrase::get_passphrase;

fn running_as_root() -> bool {
    #[cfg(unix)]
    {
        unsafe { libc::geteuid() == 0 }
    }
    #[cfg(not(unix))]
    {
        false
    }
}

fn build_options(cli: &Cli) -> anyhow::Result<IngestOptions> {
    let mut opts = cli.build_options();
    if cli.encrypt {
        let is_new = !opts.catalog_path.exists();
        opts.catalog_passphrase = Some(get_passphrase(&cli.root, is_new)?);
    }
    Ok(opts)
}

fn main() -> ExitCode {
    let start_time = Instant::now();
    let cli = Cli::parse();
    setup_logging(cli.verbose);

    if running_as_root() && !cli.encrypt {
        log::info!("Running as root. Consider using -x/--encrypt to protect the catalog.");
    }

    let opts = match build_options(&cli) {
        Ok(opts) => opts,
        Err(e) => {
            log::error!("{e:#}");
            return ExitCode::from(2);
        }
    };

    let listener: Arc<dyn ProgressListener> = KdamProgressListener::new("ingesting");
    let coordinator = match IngestCoordinator::new(opts, listener) {
        Ok(c) => Arc::new(c),
        Err(e) => {
            log::error!("fatal: {e}");
            return ExitCode::from(2);
        }
    };

    {
        let coordinator = Arc::clone(&coordinator);
        if let Err(e) = ctrlc::set_handler(move || {
            log::warn!("cancellation requested; finishing in-flight work");
            coordinator.request_cancel();
        }) {
            log::warn!("failed to install Ctrl+C handler: {e}");
        }
    }

    let report = match coordinator.start() {
        Ok(report) => report,
        Err(e) => {
            log::error!("fatal: {e}");
            return ExitCode::from(2);
        }
    };

    log::debug!("total time: {:?}", start_time.elapsed());
    log::info!(
        "snapshot {} sealed: {} processed, {} skipped, {} errored",
        report.snapshot_id,
        report.counters.processed_files,
        report.counters.skipped_files,
        report.counters.errored_files
    );

    if report.counters.errored_files > 0 {
        ExitCode::from(1)
    } else {
        ExitCode::SUCCESS
    }
}
