// ABOUTME: Source snapshot export and logical replication slot creation
// ABOUTME: Slot and snapshot are created atomically on one replication connection

use anyhow::{bail, Context, Result};
use tokio_postgres::error::SqlState;
use tokio_postgres::{Client, SimpleQueryMessage};

use crate::lsn::Lsn;
use crate::pg;
use crate::stream::Plugin;
use crate::workdir::{SlotDescriptor, WorkDir};

/// A transactional snapshot held open on the source.
///
/// The snapshot lives as long as the owning connection and its transaction;
/// dropping this struct releases both. The supervisor owns this for the
/// whole pre-data phase.
pub struct SourceSnapshot {
    client: Client,
    snapshot_name: String,
}

impl SourceSnapshot {
    pub fn snapshot_name(&self) -> &str {
        &self.snapshot_name
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    /// Commit the snapshot transaction and release the connection.
    pub async fn close(self) -> Result<()> {
        self.client
            .batch_execute("COMMIT")
            .await
            .context("Failed to close the snapshot transaction")
    }
}

/// Export a snapshot on a plain connection.
///
/// Used when streaming is not requested: a REPEATABLE READ transaction
/// exports a snapshot that every copy worker then attaches to.
pub async fn export_snapshot(source_uri: &str) -> Result<SourceSnapshot> {
    let client = pg::connect_with_retry(source_uri).await?;

    client
        .batch_execute("BEGIN ISOLATION LEVEL REPEATABLE READ READ ONLY")
        .await
        .context("Failed to open the snapshot transaction")?;

    let row = client
        .query_one("SELECT pg_export_snapshot()", &[])
        .await
        .context("Failed to export a snapshot; is the source too old to support it?")?;

    let snapshot_name: String = row.get(0);
    tracing::info!("Exported snapshot \"{}\" from the source", snapshot_name);

    Ok(SourceSnapshot {
        client,
        snapshot_name,
    })
}

/// Attach an existing exported snapshot on a worker connection.
///
/// The returned client sits inside a REPEATABLE READ transaction seeing the
/// same state as the exporting connection.
pub async fn attach_snapshot(source_uri: &str, snapshot_name: &str) -> Result<Client> {
    let client = pg::connect_with_retry(source_uri).await?;

    client
        .batch_execute("BEGIN ISOLATION LEVEL REPEATABLE READ READ ONLY")
        .await
        .context("Failed to open a worker snapshot transaction")?;

    let sql = format!(
        "SET TRANSACTION SNAPSHOT {}",
        pg::quote_literal(snapshot_name)
    );
    client
        .batch_execute(&sql)
        .await
        .with_context(|| format!("Failed to attach snapshot \"{}\"", snapshot_name))?;

    Ok(client)
}

/// A replication slot plus the snapshot exported at its creation.
///
/// CREATE_REPLICATION_SLOT ... EXPORT_SNAPSHOT returns both in a single
/// command, which is what guarantees the slot's consistent point and the
/// snapshot agree. The exported snapshot stays valid only while the
/// replication connection is held, so this struct owns it.
pub struct SlotSnapshot {
    /// Replication connection holding the exported snapshot open.
    #[allow(dead_code)]
    client: Client,
    pub slot: SlotDescriptor,
}

impl SlotSnapshot {
    pub fn snapshot_name(&self) -> Option<&str> {
        self.slot.snapshot_name.as_deref()
    }
}

/// Create the logical replication slot and export its snapshot, atomically.
///
/// When the slot already exists, a persisted descriptor matching the same
/// plugin lets a resumed run reuse it; anything else is a fatal error, per
/// the non-retryable contract of slot creation.
pub async fn create_replication_slot(
    source_uri: &str,
    slot_name: &str,
    plugin: Plugin,
    workdir: &WorkDir,
) -> Result<SlotSnapshot> {
    let client = pg::connect_replication(source_uri).await?;

    let command = format!(
        "CREATE_REPLICATION_SLOT {} LOGICAL {} EXPORT_SNAPSHOT",
        pg::quote_ident(slot_name),
        plugin.as_str()
    );

    match client.simple_query(&command).await {
        Ok(messages) => {
            let row = messages
                .iter()
                .find_map(|m| match m {
                    SimpleQueryMessage::Row(row) => Some(row),
                    _ => None,
                })
                .context("CREATE_REPLICATION_SLOT returned no row")?;

            let consistent_point = row
                .get(1)
                .context("CREATE_REPLICATION_SLOT returned no consistent point")?;
            let consistent_lsn: Lsn = consistent_point.parse()?;
            let snapshot_name = row.get(2).map(|s| s.to_string());

            let slot = SlotDescriptor {
                slot_name: slot_name.to_string(),
                plugin: plugin.as_str().to_string(),
                consistent_lsn,
                snapshot_name: snapshot_name.clone(),
                created_at: chrono::Utc::now(),
            };

            workdir.save_slot(&slot)?;

            tracing::info!(
                "Created replication slot \"{}\" (plugin {}) at {}",
                slot_name,
                plugin.as_str(),
                consistent_lsn
            );

            Ok(SlotSnapshot { client, slot })
        }

        Err(e) if e.code() == Some(&SqlState::DUPLICATE_OBJECT) => {
            let Some(slot) = workdir.load_slot()? else {
                bail!(
                    "Replication slot \"{}\" already exists on the source but no \
                     descriptor was found in the work directory.\n\
                     Drop it with `pgcopydb stream cleanup` or use a different --slot-name.",
                    slot_name
                );
            };

            if slot.slot_name != slot_name || slot.plugin != plugin.as_str() {
                bail!(
                    "Replication slot \"{}\" exists but was created with plugin \"{}\"; \
                     this run requested \"{}\"",
                    slot_name,
                    slot.plugin,
                    plugin.as_str()
                );
            }

            tracing::info!(
                "Reusing replication slot \"{}\" created at {} ({})",
                slot.slot_name,
                slot.consistent_lsn,
                slot.created_at
            );

            Ok(SlotSnapshot { client, slot })
        }

        Err(e) => Err(e).context("Failed to create the replication slot"),
    }
}

/// Drop the replication slot on the source, if it exists.
pub async fn drop_replication_slot(source_uri: &str, slot_name: &str) -> Result<()> {
    let client = pg::connect_with_retry(source_uri).await?;

    let dropped = client
        .query_opt(
            "SELECT pg_drop_replication_slot(slot_name) \
               FROM pg_replication_slots WHERE slot_name = $1",
            &[&slot_name],
        )
        .await
        .context("Failed to drop the replication slot")?;

    if dropped.is_some() {
        tracing::info!("Dropped replication slot \"{}\"", slot_name);
    } else {
        tracing::info!("Replication slot \"{}\" does not exist, nothing to drop", slot_name);
    }

    Ok(())
}

/// IDENTIFY_SYSTEM on a replication connection: (system id, timeline).
pub async fn identify_system(source_uri: &str) -> Result<(String, u32)> {
    let client = pg::connect_replication(source_uri).await?;

    let messages = client
        .simple_query("IDENTIFY_SYSTEM")
        .await
        .context("IDENTIFY_SYSTEM failed")?;

    let row = messages
        .iter()
        .find_map(|m| match m {
            SimpleQueryMessage::Row(row) => Some(row),
            _ => None,
        })
        .context("IDENTIFY_SYSTEM returned no row")?;

    let systemid = row
        .get(0)
        .context("IDENTIFY_SYSTEM returned no system id")?
        .to_string();
    let timeline: u32 = row
        .get(1)
        .context("IDENTIFY_SYSTEM returned no timeline")?
        .parse()
        .context("IDENTIFY_SYSTEM returned a non-numeric timeline")?;

    Ok((systemid, timeline))
}
