// ABOUTME: Resets target sequences to the source's current values
// ABOUTME: Runs outside the snapshot because logical decoding never streams sequences

use anyhow::{Context, Result};
use tokio_postgres::Client;

use crate::catalog::SourceSequence;
use crate::pg;

/// Copy every sequence's current value from source to target.
///
/// Reads happen on a fresh connection, deliberately outside any snapshot:
/// after a streamed migration the target needs the values current at
/// cut-over, not the ones current when the snapshot was exported.
pub async fn reset_sequences(
    source_uri: &str,
    target_uri: &str,
    sequences: &[SourceSequence],
) -> Result<usize> {
    if sequences.is_empty() {
        return Ok(0);
    }

    let source = pg::connect_with_retry(source_uri).await?;
    let target = pg::connect_with_retry(target_uri).await?;

    let mut reset = 0usize;
    for sequence in sequences {
        reset_one(&source, &target, sequence).await?;
        reset += 1;
    }

    tracing::info!("Reset {} sequence(s) on the target", reset);
    Ok(reset)
}

async fn reset_one(source: &Client, target: &Client, sequence: &SourceSequence) -> Result<()> {
    let qname = pg::qualified_name(&sequence.nspname, &sequence.relname);

    let row = source
        .query_one(&format!("SELECT last_value, is_called FROM {}", qname), &[])
        .await
        .with_context(|| format!("Failed to read sequence {}", qname))?;

    let last_value: i64 = row.get(0);
    let is_called: bool = row.get(1);

    target
        .execute(
            "SELECT pg_catalog.setval($1::text::regclass, $2, $3)",
            &[&qname, &last_value, &is_called],
        )
        .await
        .with_context(|| format!("Failed to set sequence {}", qname))?;

    tracing::debug!(
        "Sequence {} set to {} (is_called={})",
        qname,
        last_value,
        is_called
    );

    Ok(())
}
