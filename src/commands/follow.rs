// ABOUTME: The `follow` command: stream and apply changes until endpos
// ABOUTME: Creates the slot, sentinel, and origin when missing, then runs the pipeline

use anyhow::Result;

use crate::commands::{clone::stream_specs, CommonOptions};
use crate::pg;
use crate::sentinel;
use crate::snapshot;
use crate::supervisor::{self, Shutdown};
use crate::workdir::WorkDir;

pub async fn run(opts: &CommonOptions, shutdown: &Shutdown) -> Result<()> {
    let workdir = WorkDir::for_target(&opts.target_uri, opts.dir.as_deref())?;
    workdir.ensure()?;
    workdir.create_pid_file()?;

    let result = follow(opts, &workdir, shutdown).await;

    workdir.remove_pid_file()?;
    result
}

async fn follow(opts: &CommonOptions, workdir: &WorkDir, shutdown: &Shutdown) -> Result<()> {
    // the slot may be left over from a clone --follow; create it otherwise.
    // The exported snapshot is unused here: the bulk phase already ran or
    // was never wanted.
    let slot_snapshot = snapshot::create_replication_slot(
        &opts.source_uri,
        &opts.slot_name,
        opts.plugin,
        workdir,
    )
    .await?;
    let startpos = slot_snapshot.slot.consistent_lsn;
    drop(slot_snapshot);

    workdir.save_origin(&opts.origin)?;

    let client = pg::connect_with_retry(&opts.source_uri).await?;
    sentinel::setup(&client, startpos, opts.endpos).await?;

    // a standalone follow has no bulk phase to wait for
    sentinel::update_apply(&client, true).await?;
    drop(client);

    if opts.endpos.is_valid() {
        supervisor::push_endpos(&opts.source_uri, opts.endpos).await?;
    }

    let specs = stream_specs(opts, workdir).await?;
    let outcome = supervisor::run_follow(&specs, workdir, shutdown).await?;

    tracing::info!(
        "Follow stopped at {} (reached endpos: {})",
        outcome.last_applied,
        outcome.reached_endpos
    );

    Ok(())
}
