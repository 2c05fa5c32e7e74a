// ABOUTME: Copies extension-declared configuration table rows to the target
// ABOUTME: Runs as a detached auxiliary task; failures only fail strict-mode runs

use anyhow::{Context, Result};
use futures::{SinkExt, StreamExt};
use tokio::task::JoinHandle;

use crate::catalog::SourceExtension;
use crate::pg;
use crate::snapshot;

/// Create extensions on the target and copy their configuration rows.
///
/// Each extension's configuration tables carry a WHERE clause declared via
/// `pg_extension_config_dump` narrowing the rows that belong to the dump.
pub async fn copy_extensions(
    source_uri: &str,
    target_uri: &str,
    snapshot_name: Option<&str>,
    extensions: &[SourceExtension],
    create_extensions: bool,
) -> Result<()> {
    let source = match snapshot_name {
        Some(name) => snapshot::attach_snapshot(source_uri, name).await?,
        None => pg::connect_with_retry(source_uri).await?,
    };
    let target = pg::connect_with_retry(target_uri).await?;

    let mut errors = 0usize;

    for ext in extensions {
        if create_extensions {
            let sql = format!(
                "CREATE EXTENSION IF NOT EXISTS {} CASCADE",
                pg::quote_ident(&ext.name)
            );
            tracing::info!("Creating extension \"{}\"", ext.name);
            if let Err(e) = target.batch_execute(&sql).await {
                tracing::error!("Failed to create extension \"{}\": {}", ext.name, e);
                errors += 1;
            }
        }

        for config in &ext.config {
            let qname = pg::qualified_name(&config.nspname, &config.relname);
            tracing::info!(
                "COPY extension \"{}\" configuration table {}",
                ext.name,
                qname
            );

            let source_sql = format!(
                "COPY (SELECT * FROM {} {}) TO STDOUT",
                qname, config.condition
            );
            let target_sql = format!("COPY {} FROM STDIN", qname);

            let out = source
                .copy_out(&source_sql)
                .await
                .with_context(|| format!("COPY OUT failed for {}", qname))?;
            let sink = target
                .copy_in::<_, bytes::Bytes>(&target_sql)
                .await
                .with_context(|| format!("COPY IN failed for {}", qname))?;

            futures::pin_mut!(out);
            futures::pin_mut!(sink);

            while let Some(chunk) = out.next().await {
                let chunk = chunk.context("Error reading extension config rows")?;
                sink.send(chunk)
                    .await
                    .context("Error writing extension config rows")?;
            }
            sink.finish()
                .await
                .context("Failed to finish the extension config COPY")?;
        }
    }

    if errors > 0 {
        anyhow::bail!("{} extension(s) failed to install on the target", errors);
    }

    Ok(())
}

/// Start the extension-config copy as a detached auxiliary task.
///
/// The returned handle only matters in strict mode, where the caller awaits
/// it and propagates failure; otherwise the task logs and is forgotten.
pub fn spawn_extension_copy(
    source_uri: String,
    target_uri: String,
    snapshot_name: Option<String>,
    extensions: Vec<SourceExtension>,
    create_extensions: bool,
) -> JoinHandle<Result<()>> {
    tokio::spawn(async move {
        let result = copy_extensions(
            &source_uri,
            &target_uri,
            snapshot_name.as_deref(),
            &extensions,
            create_extensions,
        )
        .await;

        if let Err(e) = &result {
            tracing::error!("Failed to copy extension configuration tables: {:#}", e);
        }

        result
    })
}
