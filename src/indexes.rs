// ABOUTME: Parallel index and constraint builder, gated on table done-markers
// ABOUTME: Runs concurrently with the table-data copier; foreign keys stay in post-data

use anyhow::{bail, Context, Result};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

use crate::catalog::{SourceCatalog, SourceIndex};
use crate::pg;
use crate::workdir::{DoneKey, WorkDir};

/// Delay between eligibility scans while tables are still being copied.
const POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Build the index work queue in per-table order: primary keys and unique
/// constraints ahead of plain indexes. Foreign keys are never queued here;
/// the post-data restore creates them once every referenced table is loaded.
pub fn build_index_queue(catalog: &SourceCatalog, workdir: &WorkDir) -> VecDeque<SourceIndex> {
    let mut queue = VecDeque::new();

    for table in &catalog.tables {
        for index in catalog.indexes_for_table(table.oid) {
            if workdir.is_done(DoneKey::Index(index.oid)) {
                continue;
            }
            queue.push_back(index.clone());
        }
    }

    queue
}

/// Synthesize the statements that create one index and, when it backs a
/// constraint, attach that constraint to the table.
pub fn build_statements(index: &SourceIndex, table_qname: &str) -> Vec<String> {
    let mut statements = vec![index.indexdef.clone()];

    if let Some(constraint) = &index.constraint {
        let kind = if index.is_primary {
            "PRIMARY KEY"
        } else {
            "UNIQUE"
        };
        statements.push(format!(
            "ALTER TABLE {} ADD CONSTRAINT {} {} USING INDEX {}",
            table_qname,
            pg::quote_ident(&constraint.conname),
            kind,
            pg::quote_ident(&index.relname),
        ));
    }

    statements
}

/// The parallel worker pool creating indexes and constraints on the target.
pub struct IndexBuilder {
    pub target_uri: String,
    pub jobs: usize,
}

struct BuilderShared {
    queue: Mutex<VecDeque<SourceIndex>>,
    failures: Mutex<Vec<String>>,
    workdir: WorkDir,
    catalog: SourceCatalog,
    stop: Arc<AtomicBool>,
    copy_finished: Arc<AtomicBool>,
}

impl IndexBuilder {
    /// Build every pending index, waiting for each table's data load to
    /// finish before touching its indexes.
    ///
    /// `copy_finished` flips once the copier drained its queue; indexes of
    /// tables that never got their marker by then are reported as failures
    /// instead of being waited on forever.
    pub async fn run(
        &self,
        catalog: &SourceCatalog,
        workdir: &WorkDir,
        stop: Arc<AtomicBool>,
        copy_finished: Arc<AtomicBool>,
    ) -> Result<usize> {
        let queue = build_index_queue(catalog, workdir);

        if queue.is_empty() {
            tracing::info!("All indexes already built, nothing to do");
            return Ok(0);
        }

        tracing::info!(
            "Building {} indexes in {} concurrent jobs",
            queue.len(),
            self.jobs
        );

        let total = queue.len();
        let shared = Arc::new(BuilderShared {
            queue: Mutex::new(queue),
            failures: Mutex::new(Vec::new()),
            workdir: workdir.clone(),
            catalog: catalog.clone(),
            stop,
            copy_finished,
        });

        let mut workers = Vec::new();
        for worker_id in 0..self.jobs.max(1) {
            let shared = Arc::clone(&shared);
            let target_uri = self.target_uri.clone();
            workers.push(tokio::spawn(async move {
                index_worker(worker_id, shared, target_uri).await
            }));
        }

        for worker in workers {
            worker.await.context("Index worker panicked")??;
        }

        let failures = shared.failures.lock().await;
        if !failures.is_empty() {
            bail!(
                "{} index build(s) failed:\n{}",
                failures.len(),
                failures.join("\n")
            );
        }

        Ok(total)
    }
}

async fn index_worker(
    worker_id: usize,
    shared: Arc<BuilderShared>,
    target_uri: String,
) -> Result<()> {
    let client = pg::connect_with_retry(&target_uri).await?;
    let mut copy_done_seen = false;

    loop {
        if shared.stop.load(Ordering::Relaxed) {
            tracing::info!("Index worker {} stopping on request", worker_id);
            return Ok(());
        }

        // an index becomes eligible once its table's data load completed
        let next = {
            let mut queue = shared.queue.lock().await;
            if queue.is_empty() {
                return Ok(());
            }
            let position = queue
                .iter()
                .position(|i| shared.workdir.is_done(DoneKey::Table(i.table_oid)));
            position.and_then(|p| queue.remove(p))
        };

        let Some(index) = next else {
            if shared.copy_finished.load(Ordering::Relaxed) {
                // no more markers will appear; give eligibility one final
                // pass before declaring leftovers failed
                if !copy_done_seen {
                    copy_done_seen = true;
                    continue;
                }
                let mut queue = shared.queue.lock().await;
                let mut failures = shared.failures.lock().await;
                for index in queue.drain(..) {
                    failures.push(format!(
                        "{}: table data load did not complete",
                        index.relname
                    ));
                }
                return Ok(());
            }
            tokio::time::sleep(POLL_INTERVAL).await;
            continue;
        };

        let table_qname = shared
            .catalog
            .table_by_oid(index.table_oid)
            .map(|t| t.qualified_name())
            .unwrap_or_else(|| pg::qualified_name(&index.nspname, "unknown"));

        tracing::info!(
            "Worker {} creating index {} on {}",
            worker_id,
            index.relname,
            table_qname
        );

        let mut failed = false;
        for sql in build_statements(&index, &table_qname) {
            if let Err(e) = client.batch_execute(&sql).await {
                tracing::error!("Failed to run: {}: {}", sql, e);
                shared
                    .failures
                    .lock()
                    .await
                    .push(format!("{}: {}", index.relname, e));
                failed = true;
                break;
            }
        }

        if failed {
            continue;
        }

        // the post-data restore skips both entries once these exist
        shared.workdir.mark_done(DoneKey::Index(index.oid))?;
        if let Some(constraint) = &index.constraint {
            shared.workdir.mark_done(DoneKey::Index(constraint.oid))?;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{CopyPartitioning, SourceConstraint, SourceTable};
    use tempfile::TempDir;

    fn catalog_with_indexes() -> SourceCatalog {
        let mut catalog = SourceCatalog::default();
        catalog.tables.push(SourceTable {
            oid: 1,
            nspname: "public".to_string(),
            relname: "users".to_string(),
            estimated_row_count: 0,
            bytes: 0,
            relpages: 0,
            attributes: vec![],
            partition_key: None,
            partitioning: CopyPartitioning::Whole,
            partitions: vec![],
        });
        catalog.indexes.push(SourceIndex {
            oid: 10,
            table_oid: 1,
            nspname: "public".to_string(),
            relname: "users_email_idx".to_string(),
            indexdef: "CREATE INDEX users_email_idx ON public.users (email)".to_string(),
            is_primary: false,
            is_unique: false,
            constraint: None,
        });
        catalog.indexes.push(SourceIndex {
            oid: 11,
            table_oid: 1,
            nspname: "public".to_string(),
            relname: "users_pkey".to_string(),
            indexdef: "CREATE UNIQUE INDEX users_pkey ON public.users (id)".to_string(),
            is_primary: true,
            is_unique: true,
            constraint: Some(SourceConstraint {
                oid: 20,
                conname: "users_pkey".to_string(),
                condef: "PRIMARY KEY (id)".to_string(),
            }),
        });
        catalog
    }

    #[test]
    fn test_queue_orders_constraints_first() {
        let tmp = TempDir::new().unwrap();
        let wd = WorkDir::for_target("postgresql://u@h/db", Some(tmp.path())).unwrap();
        wd.ensure().unwrap();

        let catalog = catalog_with_indexes();
        let queue = build_index_queue(&catalog, &wd);
        let order: Vec<u32> = queue.iter().map(|i| i.oid).collect();
        assert_eq!(order, vec![11, 10]);
    }

    #[test]
    fn test_queue_skips_done_indexes() {
        let tmp = TempDir::new().unwrap();
        let wd = WorkDir::for_target("postgresql://u@h/db", Some(tmp.path())).unwrap();
        wd.ensure().unwrap();
        wd.mark_done(DoneKey::Index(11)).unwrap();

        let catalog = catalog_with_indexes();
        let queue = build_index_queue(&catalog, &wd);
        let order: Vec<u32> = queue.iter().map(|i| i.oid).collect();
        assert_eq!(order, vec![10]);
    }

    #[test]
    fn test_build_statements_plain_index() {
        let catalog = catalog_with_indexes();
        let index = &catalog.indexes[0];
        let statements = build_statements(index, "\"public\".\"users\"");
        assert_eq!(
            statements,
            vec!["CREATE INDEX users_email_idx ON public.users (email)".to_string()]
        );
    }

    #[test]
    fn test_build_statements_primary_key() {
        let catalog = catalog_with_indexes();
        let index = &catalog.indexes[1];
        let statements = build_statements(index, "\"public\".\"users\"");
        assert_eq!(statements.len(), 2);
        assert_eq!(
            statements[1],
            "ALTER TABLE \"public\".\"users\" ADD CONSTRAINT \"users_pkey\" \
             PRIMARY KEY USING INDEX \"users_pkey\""
        );
    }
}
