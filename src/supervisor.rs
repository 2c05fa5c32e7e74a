// ABOUTME: Orchestrates the copy and streaming stages, signals, and exit codes
// ABOUTME: One shutdown flag read by workers at safe points; stage death stops the pipeline

use anyhow::{Context, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};

use crate::catalog::SourceCatalog;
use crate::copy::TableDataCopier;
use crate::extensions;
use crate::filters::CopyFilters;
use crate::indexes::IndexBuilder;
use crate::lsn::Lsn;
use crate::pg;
use crate::schema::{DumpSection, RestoreOptions, SchemaDriver};
use crate::sentinel;
use crate::sequences;
use crate::snapshot;
use crate::stream::apply::{ApplyOutcome, StreamApplier};
use crate::stream::receive::{resume_position, StreamReceiver};
use crate::stream::transform::{self, TransformState};
use crate::stream::{list_complete_segments, segment_sql_path, StreamSpecs};
use crate::workdir::WorkDir;
use crate::{EXIT_CODE_INTERNAL_ERROR, EXIT_CODE_QUIT};

/// Cooperative shutdown shared by every stage.
///
/// Workers read the flag at safe points (between units, chunks, and
/// statements); the broadcast channel wakes stages blocked on I/O.
#[derive(Debug, Clone)]
pub struct Shutdown {
    stop: Arc<AtomicBool>,
    notify: broadcast::Sender<()>,
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

impl Shutdown {
    pub fn new() -> Shutdown {
        let (notify, _) = broadcast::channel(4);
        Shutdown {
            stop: Arc::new(AtomicBool::new(false)),
            notify,
        }
    }

    /// Translate SIGINT/SIGTERM into a stop request.
    #[cfg(unix)]
    pub fn install_signal_handlers(&self) -> Result<()> {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigint = signal(SignalKind::interrupt()).context("Failed to install SIGINT")?;
        let mut sigterm = signal(SignalKind::terminate()).context("Failed to install SIGTERM")?;
        let this = self.clone();

        tokio::spawn(async move {
            tokio::select! {
                _ = sigint.recv() => tracing::info!("Received SIGINT, shutting down"),
                _ = sigterm.recv() => tracing::info!("Received SIGTERM, shutting down"),
            }
            this.request_stop();
        });

        Ok(())
    }

    #[cfg(not(unix))]
    pub fn install_signal_handlers(&self) -> Result<()> {
        let this = self.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("Received interrupt, shutting down");
                this.request_stop();
            }
        });
        Ok(())
    }

    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::Relaxed);
        let _ = self.notify.send(());
    }

    pub fn is_stopped(&self) -> bool {
        self.stop.load(Ordering::Relaxed)
    }

    pub fn stop_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.stop)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.notify.subscribe()
    }
}

/// Overall exit status: the highest stage code, so internal-error trumps
/// quit.
pub fn aggregate_exit_codes(codes: &[i32]) -> i32 {
    codes.iter().copied().max().unwrap_or(EXIT_CODE_QUIT)
}

/// Everything the bulk phase needs, assembled by the command layer.
#[derive(Debug, Clone)]
pub struct CloneOptions {
    pub source_uri: String,
    pub target_uri: String,
    pub table_jobs: usize,
    pub index_jobs: usize,
    pub drop_if_exists: bool,
    pub skip_extensions: bool,
    pub resume: bool,
    pub split_threshold: i64,
}

/// The bulk copy phases: schema, data, indexes, extensions, sequences.
///
/// `snapshot_name` is the snapshot every stage works under; `follow` makes
/// the final step flip the sentinel apply switch so the applier starts
/// catching up.
pub async fn run_clone(
    opts: &CloneOptions,
    filters: &CopyFilters,
    workdir: &WorkDir,
    snapshot_name: &str,
    snapshot_client: &tokio_postgres::Client,
    shutdown: &Shutdown,
    follow: bool,
) -> Result<()> {
    let driver = SchemaDriver::new(&opts.source_uri, &opts.target_uri, workdir, filters);

    tracing::info!("STEP 1: dump the source database schema (pre/post data)");
    driver.dump_section(DumpSection::PreData, snapshot_name).await?;
    driver.dump_section(DumpSection::PostData, snapshot_name).await?;

    tracing::info!("STEP 2: fetch source database tables, indexes, and sequences");
    let catalog =
        SourceCatalog::fetch(snapshot_client, filters, opts.split_threshold).await?;

    tracing::info!("STEP 3: restore the pre-data section to the target database");
    let restore_options = RestoreOptions {
        drop_if_exists: opts.drop_if_exists,
    };
    driver
        .restore_section(DumpSection::PreData, &catalog, &restore_options)
        .await?;

    // auxiliary process; its failure does not fail the run
    let extension_task = if opts.skip_extensions {
        None
    } else {
        Some(extensions::spawn_extension_copy(
            opts.source_uri.clone(),
            opts.target_uri.clone(),
            Some(snapshot_name.to_string()),
            catalog.extensions.clone(),
            true,
        ))
    };

    tracing::info!(
        "STEP 4: copy data from source to target in {} concurrent jobs",
        opts.table_jobs
    );

    let copier = TableDataCopier {
        source_uri: opts.source_uri.clone(),
        target_uri: opts.target_uri.clone(),
        snapshot_name: Some(snapshot_name.to_string()),
        jobs: opts.table_jobs,
        resume: opts.resume,
    };
    let builder = IndexBuilder {
        target_uri: opts.target_uri.clone(),
        jobs: opts.index_jobs,
    };

    // index builds start as soon as their table's data load finishes
    let copy_finished = Arc::new(AtomicBool::new(false));
    let copy_fut = async {
        let result = copier.run(&catalog, workdir, shutdown.stop_flag()).await;
        copy_finished.store(true, Ordering::Relaxed);
        result
    };
    let (copy_result, index_result) = tokio::join!(
        copy_fut,
        builder.run(
            &catalog,
            workdir,
            shutdown.stop_flag(),
            Arc::clone(&copy_finished)
        ),
    );
    copy_result?;
    index_result?;

    if shutdown.is_stopped() {
        anyhow::bail!("Shutdown requested during the copy phase");
    }

    tracing::info!("STEP 5: restore the post-data section to the target database");
    driver
        .restore_section(DumpSection::PostData, &catalog, &restore_options)
        .await?;

    tracing::info!("STEP 6: reset sequences on the target database");
    sequences::reset_sequences(&opts.source_uri, &opts.target_uri, &catalog.sequences).await?;

    if let Some(task) = extension_task {
        match task.await {
            Ok(Ok(())) => {}
            Ok(Err(_)) => {
                // already logged by the task; non-strict runs carry on
            }
            Err(e) => tracing::error!("Extension copy task panicked: {}", e),
        }
    }

    if follow {
        tracing::info!("Updating the sentinel to enable applying changes");
        let client = pg::connect_with_retry(&opts.source_uri).await?;
        sentinel::update_apply(&client, true).await?;
    }

    Ok(())
}

/// The streaming pipeline: receiver, transformer, and applier wired through
/// in-process channels, with file-based catchup first.
///
/// The transformer and applier run at parallelism one each; this is what
/// preserves commit order on the target.
pub async fn run_follow(
    specs: &StreamSpecs,
    workdir: &WorkDir,
    shutdown: &Shutdown,
) -> Result<ApplyOutcome> {
    let sentinel_client = pg::connect_with_retry(&specs.source_uri).await?;
    let row = sentinel::get(&sentinel_client).await?;

    if row.endpos.is_valid() && row.endpos <= row.replay_lsn {
        tracing::info!(
            "Current endpos {} was previously reached at {}",
            row.endpos,
            row.replay_lsn
        );
        return Ok(ApplyOutcome {
            last_applied: row.replay_lsn,
            reached_endpos: true,
        });
    }

    let slot = workdir
        .load_slot()?
        .context("No replication slot descriptor; run the setup phase first")?;

    crate::stream::discard_partial_segments(&specs.cdc_dir)?;

    // transform any complete segments still missing their SQL script, so
    // the applier's file-mode catchup sees every transaction
    let mut state = TransformState::new();
    for json_path in list_complete_segments(&specs.cdc_dir)? {
        if !segment_sql_path(&json_path).exists() {
            transform::transform_file(&mut state, &json_path)?;
        }
    }

    let start_lsn = resume_position(slot.consistent_lsn, row.flush_lsn, specs)?;

    let (message_tx, message_rx) = mpsc::channel(1024);
    let (line_tx, line_rx) = mpsc::channel(1024);

    let receiver = StreamReceiver {
        specs: specs.clone(),
    };
    let applier = StreamApplier {
        specs: specs.clone(),
    };

    let stop = shutdown.stop_flag();
    let receiver_task = tokio::spawn({
        let stop = Arc::clone(&stop);
        async move { receiver.run(start_lsn, stop, Some(message_tx)).await }
    });

    let transformer_task = tokio::spawn(transform::run_live(message_rx, line_tx));

    let applier_task = tokio::spawn({
        let stop = Arc::clone(&stop);
        async move { applier.run(Some(line_rx), stop).await }
    });

    // the applier decides when the pipeline is done; any stage dying
    // unexpectedly shuts the whole pipeline down
    let outcome = match applier_task.await.context("Applier task panicked")? {
        Ok(outcome) => {
            shutdown.request_stop();
            outcome
        }
        Err(e) => {
            shutdown.request_stop();
            let _ = receiver_task.await;
            let _ = transformer_task.await;
            return Err(e.context("The stream applier failed"));
        }
    };

    match receiver_task.await.context("Receiver task panicked")? {
        Ok(flush_lsn) => tracing::debug!("Receiver flushed up to {}", flush_lsn),
        Err(e) => tracing::warn!("Receiver stopped with: {:#}", e),
    }
    match transformer_task.await.context("Transformer task panicked")? {
        Ok(()) => {}
        Err(e) => tracing::warn!("Transformer stopped with: {:#}", e),
    }

    Ok(outcome)
}

/// Set the sentinel endpos from the command line before streaming starts.
pub async fn push_endpos(source_uri: &str, endpos: Lsn) -> Result<()> {
    if !endpos.is_valid() {
        return Ok(());
    }
    let client = pg::connect_with_retry(source_uri).await?;
    let row = sentinel::update_endpos(&client, endpos).await?;
    tracing::info!("Sentinel endpos set to {}", row.endpos);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_aggregate_exit_codes() {
        assert_eq!(aggregate_exit_codes(&[]), EXIT_CODE_QUIT);
        assert_eq!(aggregate_exit_codes(&[0, 0, 0]), EXIT_CODE_QUIT);
        // internal-error trumps quit
        assert_eq!(
            aggregate_exit_codes(&[0, EXIT_CODE_INTERNAL_ERROR, 0]),
            EXIT_CODE_INTERNAL_ERROR
        );
        assert_eq!(aggregate_exit_codes(&[EXIT_CODE_INTERNAL_ERROR]), 12);
    }

    #[test]
    fn test_shutdown_flag() {
        let shutdown = Shutdown::new();
        assert!(!shutdown.is_stopped());
        let flag = shutdown.stop_flag();
        shutdown.request_stop();
        assert!(shutdown.is_stopped());
        assert!(flag.load(Ordering::Relaxed));
    }
}
