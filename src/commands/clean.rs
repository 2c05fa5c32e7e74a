// ABOUTME: The `stream cleanup` command: drops the slot, origin, and sentinel
// ABOUTME: Also clears the streaming subtree of the work directory

use anyhow::Result;

use crate::commands::CommonOptions;
use crate::pg;
use crate::sentinel;
use crate::snapshot;
use crate::stream::apply;
use crate::workdir::WorkDir;

pub async fn run(opts: &CommonOptions) -> Result<()> {
    let workdir = WorkDir::for_target(&opts.target_uri, opts.dir.as_deref())?;

    let slot_name = workdir
        .load_slot()?
        .map(|slot| slot.slot_name)
        .unwrap_or_else(|| opts.slot_name.clone());
    let origin = workdir
        .load_origin()?
        .unwrap_or_else(|| opts.origin.clone());

    snapshot::drop_replication_slot(&opts.source_uri, &slot_name).await?;
    apply::drop_origin(&opts.target_uri, &origin).await?;

    let client = pg::connect_with_retry(&opts.source_uri).await?;
    sentinel::teardown(&client).await?;

    workdir.cleanup_stream_state()?;
    tracing::info!("Stream state cleaned up");

    Ok(())
}
