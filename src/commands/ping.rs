// ABOUTME: Health check: succeeds iff both endpoints are reachable

use anyhow::Result;

use crate::pg;
use crate::ExitError;

pub async fn run(source_uri: &str, target_uri: &str) -> Result<()> {
    pg::validate_connection_string(source_uri)
        .map_err(|e| ExitError::bad_args(format!("Invalid --source: {:#}", e)))?;
    pg::validate_connection_string(target_uri)
        .map_err(|e| ExitError::bad_args(format!("Invalid --target: {:#}", e)))?;

    let source = pg::connect(source_uri).await.map_err(|e| {
        ExitError::unreachable(format!(
            "Failed to connect to the source database: {:#}",
            e
        ))
    })?;
    let target = pg::connect(target_uri).await.map_err(|e| {
        ExitError::unreachable(format!(
            "Failed to connect to the target database: {:#}",
            e
        ))
    })?;

    let source_version: String = source
        .query_one("SELECT version()", &[])
        .await
        .map_err(|e| ExitError::unreachable(format!("Source query failed: {}", e)))?
        .get(0);
    let target_version: String = target
        .query_one("SELECT version()", &[])
        .await
        .map_err(|e| ExitError::unreachable(format!("Target query failed: {}", e)))?
        .get(0);

    tracing::info!("Source: {}", source_version);
    tracing::info!("Target: {}", target_version);
    println!("ping: both source and target are reachable");

    Ok(())
}
