// ABOUTME: Exports a snapshot on the source and holds it until interrupted
// ABOUTME: Lets an operator pin one snapshot across several command invocations

use anyhow::Result;

use crate::commands::CommonOptions;
use crate::snapshot;
use crate::supervisor::Shutdown;

pub async fn run(opts: &CommonOptions, shutdown: &Shutdown) -> Result<()> {
    let held = snapshot::export_snapshot(&opts.source_uri).await?;

    println!("{}", held.snapshot_name());
    tracing::info!(
        "Holding snapshot \"{}\" until interrupted",
        held.snapshot_name()
    );

    // the snapshot lives as long as this connection; park until a signal
    let mut stopped = shutdown.subscribe();
    let _ = stopped.recv().await;

    held.close().await?;
    tracing::info!("Snapshot released");

    Ok(())
}
