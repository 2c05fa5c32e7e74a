// ABOUTME: The `copy table-data` command: bulk data and index phase only
// ABOUTME: Idempotent: done-markers make a second run skip finished work

use anyhow::{Context, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::catalog::SourceCatalog;
use crate::commands::CommonOptions;
use crate::copy::TableDataCopier;
use crate::indexes::IndexBuilder;
use crate::snapshot;
use crate::supervisor::Shutdown;
use crate::workdir::WorkDir;

pub async fn run(opts: &CommonOptions, shutdown: &Shutdown) -> Result<()> {
    let workdir = WorkDir::for_target(&opts.target_uri, opts.dir.as_deref())?;
    workdir.prepare(opts.resume, opts.restart)?;
    workdir.create_pid_file()?;

    let result = copy_table_data(opts, &workdir, shutdown).await;

    workdir.remove_pid_file()?;
    result
}

async fn copy_table_data(
    opts: &CommonOptions,
    workdir: &WorkDir,
    shutdown: &Shutdown,
) -> Result<()> {
    let held = snapshot::export_snapshot(&opts.source_uri).await?;

    let catalog = SourceCatalog::fetch(
        held.client(),
        &opts.filters,
        opts.split_tables_larger_than,
    )
    .await?;

    tracing::info!(
        "Copying {} tables in {} table jobs and {} index jobs",
        catalog.tables.len(),
        opts.table_jobs,
        opts.index_jobs
    );

    let copier = TableDataCopier {
        source_uri: opts.source_uri.clone(),
        target_uri: opts.target_uri.clone(),
        snapshot_name: Some(held.snapshot_name().to_string()),
        jobs: opts.table_jobs,
        resume: opts.resume,
    };
    let builder = IndexBuilder {
        target_uri: opts.target_uri.clone(),
        jobs: opts.index_jobs,
    };

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

    held.close()
        .await
        .context("Failed to release the snapshot")?;

    if shutdown.is_stopped() {
        anyhow::bail!("Shutdown requested during the copy phase");
    }

    Ok(())
}
