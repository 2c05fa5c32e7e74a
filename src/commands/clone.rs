// ABOUTME: The `clone` command: full bulk migration, optionally with --follow
// ABOUTME: With --follow the streaming pipeline runs concurrently with the copy

use anyhow::{Context, Result};

use crate::commands::CommonOptions;
use crate::pg;
use crate::sentinel;
use crate::sequences;
use crate::snapshot::{self, SourceSnapshot};
use crate::stream::StreamSpecs;
use crate::supervisor::{self, CloneOptions, Shutdown};
use crate::workdir::WorkDir;

pub async fn run(opts: &CommonOptions, follow: bool, shutdown: &Shutdown) -> Result<()> {
    let workdir = WorkDir::for_target(&opts.target_uri, opts.dir.as_deref())?;
    workdir.prepare(opts.resume, opts.restart)?;
    workdir.create_pid_file()?;

    let result = if follow {
        clone_and_follow(opts, &workdir, shutdown).await
    } else {
        clone_only(opts, &workdir, shutdown).await
    };

    workdir.remove_pid_file()?;
    result
}

fn clone_options(opts: &CommonOptions) -> CloneOptions {
    CloneOptions {
        source_uri: opts.source_uri.clone(),
        target_uri: opts.target_uri.clone(),
        table_jobs: opts.table_jobs,
        index_jobs: opts.index_jobs,
        drop_if_exists: opts.drop_if_exists,
        skip_extensions: opts.skip_extensions,
        resume: opts.resume,
        split_threshold: opts.split_tables_larger_than,
    }
}

async fn clone_only(opts: &CommonOptions, workdir: &WorkDir, shutdown: &Shutdown) -> Result<()> {
    let held = snapshot::export_snapshot(&opts.source_uri).await?;

    supervisor::run_clone(
        &clone_options(opts),
        &opts.filters,
        workdir,
        held.snapshot_name(),
        held.client(),
        shutdown,
        false,
    )
    .await?;

    held.close()
        .await
        .context("Failed to release the snapshot")?;

    Ok(())
}

async fn clone_and_follow(
    opts: &CommonOptions,
    workdir: &WorkDir,
    shutdown: &Shutdown,
) -> Result<()> {
    // slot and snapshot are created atomically on one connection; that
    // connection stays open so the exported snapshot survives the bulk phase
    let slot_snapshot = snapshot::create_replication_slot(
        &opts.source_uri,
        &opts.slot_name,
        opts.plugin,
        workdir,
    )
    .await?;

    let startpos = slot_snapshot.slot.consistent_lsn;
    workdir.save_origin(&opts.origin)?;

    let setup_client = pg::connect_with_retry(&opts.source_uri).await?;
    sentinel::setup(&setup_client, startpos, opts.endpos).await?;
    drop(setup_client);

    let specs = stream_specs(opts, workdir).await?;

    let mut held_fallback: Option<SourceSnapshot> = None;
    let snapshot_name = match slot_snapshot.snapshot_name() {
        Some(name) => name.to_string(),
        None => {
            // resumed run: the slot's exported snapshot is gone; the
            // remaining units copy under a fresh snapshot and the stream
            // fills the gap between the two
            tracing::warn!(
                "Reusing slot \"{}\" without its exported snapshot; \
                 copying remaining tables under a new snapshot",
                opts.slot_name
            );
            let held = snapshot::export_snapshot(&opts.source_uri).await?;
            let name = held.snapshot_name().to_string();
            held_fallback = Some(held);
            name
        }
    };

    let snapshot_client = snapshot::attach_snapshot(&opts.source_uri, &snapshot_name).await?;

    let clone_opts = clone_options(opts);
    let clone_fut = async {
        let result = supervisor::run_clone(
            &clone_opts,
            &opts.filters,
            workdir,
            &snapshot_name,
            &snapshot_client,
            shutdown,
            true,
        )
        .await;

        if result.is_err() {
            // never leave the follow pipeline waiting on an apply switch
            // that will not be flipped
            tracing::warn!("Clone phase failed, stopping the streaming pipeline");
            shutdown.request_stop();
        }

        result
    };

    let follow_fut = supervisor::run_follow(&specs, workdir, shutdown);

    let (clone_result, follow_result) = tokio::join!(clone_fut, follow_fut);

    // the snapshot is only needed by the bulk phase
    drop(snapshot_client);
    drop(held_fallback);
    drop(slot_snapshot);

    clone_result?;
    let outcome = follow_result?;

    tracing::info!(
        "Follow stopped at {} (reached endpos: {})",
        outcome.last_applied,
        outcome.reached_endpos
    );

    // sequences are not streamed by logical decoding; re-read their values
    // now that the stream has stopped
    reset_sequences_at_cutover(opts).await?;

    Ok(())
}

pub(crate) async fn stream_specs(opts: &CommonOptions, workdir: &WorkDir) -> Result<StreamSpecs> {
    let client = pg::connect_with_retry(&opts.source_uri).await?;
    let wal_segment_size = pg::wal_segment_size(&client).await?;
    let (_systemid, timeline) = snapshot::identify_system(&opts.source_uri).await?;

    Ok(StreamSpecs {
        source_uri: opts.source_uri.clone(),
        target_uri: opts.target_uri.clone(),
        slot_name: opts.slot_name.clone(),
        plugin: opts.plugin,
        origin: opts.origin.clone(),
        endpos: opts.endpos,
        cdc_dir: workdir.cdc_dir(),
        wal_segment_size,
        timeline,
    })
}

async fn reset_sequences_at_cutover(opts: &CommonOptions) -> Result<()> {
    let client = pg::connect_with_retry(&opts.source_uri).await?;
    let catalog = crate::catalog::SourceCatalog::fetch(
        &client,
        &opts.filters,
        opts.split_tables_larger_than,
    )
    .await?;
    sequences::reset_sequences(&opts.source_uri, &opts.target_uri, &catalog.sequences).await?;
    Ok(())
}
