// ABOUTME: Parallel table-data copier: streams COPY data from source to target
// ABOUTME: Splits large tables into ctid ranges and partitioned tables by partition

use anyhow::{bail, Context, Result};
use futures::{SinkExt, StreamExt};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

use crate::catalog::{CopyPartitioning, SourceCatalog, SourceTable};
use crate::pg;
use crate::snapshot;
use crate::workdir::{DoneKey, WorkDir};

/// Retries per copy unit on mid-stream failure.
pub const COPY_UNIT_RETRIES: u32 = 2;

const PAGES_PER_RANGE: i64 = 128 * 1024;

/// One schedulable piece of table data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CopyUnit {
    pub table_oid: u32,
    pub nspname: String,
    pub relname: String,
    pub bytes: i64,
    pub kind: UnitKind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnitKind {
    /// One COPY for the whole table.
    Whole,
    /// A ctid page range of a large heap table; `end_page` of None means
    /// "to the end of the table" and absorbs pages added after planning.
    CtidRange { start_page: i64, end_page: Option<i64> },
    /// One leaf partition; rows land in the same leaf on the target.
    Partition { nspname: String, relname: String },
}

impl CopyUnit {
    /// SQL the source side streams from.
    pub fn source_sql(&self) -> String {
        let qname = pg::qualified_name(&self.nspname, &self.relname);
        match &self.kind {
            UnitKind::Whole => format!("COPY {} TO STDOUT", qname),
            UnitKind::CtidRange {
                start_page,
                end_page,
            } => {
                let range = match end_page {
                    Some(end) => format!(
                        "ctid >= '({},0)'::tid AND ctid < '({},0)'::tid",
                        start_page, end
                    ),
                    None => format!("ctid >= '({},0)'::tid", start_page),
                };
                format!("COPY (SELECT * FROM {} WHERE {}) TO STDOUT", qname, range)
            }
            UnitKind::Partition { nspname, relname } => {
                format!("COPY {} TO STDOUT", pg::qualified_name(nspname, relname))
            }
        }
    }

    /// SQL the target side loads into.
    pub fn target_sql(&self) -> String {
        let qname = match &self.kind {
            UnitKind::Partition { nspname, relname } => pg::qualified_name(nspname, relname),
            _ => pg::qualified_name(&self.nspname, &self.relname),
        };
        format!("COPY {} FROM STDIN", qname)
    }

    /// Relation to TRUNCATE before loading, when allowed.
    fn truncate_target(&self) -> Option<String> {
        match &self.kind {
            UnitKind::Whole => Some(pg::qualified_name(&self.nspname, &self.relname)),
            UnitKind::Partition { nspname, relname } => {
                Some(pg::qualified_name(nspname, relname))
            }
            UnitKind::CtidRange { .. } => None,
        }
    }
}

/// Build the shared queue of copy units, largest tables first.
///
/// Tables whose done-marker already exists produce no units. The returned
/// map counts pending units per table; the worker that completes the last
/// unit of a table writes the table's done-marker.
pub fn build_units(
    catalog: &SourceCatalog,
    workdir: &WorkDir,
) -> (VecDeque<CopyUnit>, HashMap<u32, usize>) {
    let mut tables: Vec<&SourceTable> = catalog
        .tables
        .iter()
        .filter(|t| !workdir.is_done(DoneKey::Table(t.oid)))
        .collect();

    // longest-processing-time first keeps the tail short
    tables.sort_by(|a, b| b.bytes.cmp(&a.bytes));

    let mut queue = VecDeque::new();
    let mut remaining = HashMap::new();

    for table in tables {
        let units = units_for_table(table);
        if units.is_empty() {
            // a partitioned table with no leaves holds no rows
            let _ = workdir.mark_done(DoneKey::Table(table.oid));
            continue;
        }
        remaining.insert(table.oid, units.len());
        queue.extend(units);
    }

    (queue, remaining)
}

fn units_for_table(table: &SourceTable) -> Vec<CopyUnit> {
    let base = |kind| CopyUnit {
        table_oid: table.oid,
        nspname: table.nspname.clone(),
        relname: table.relname.clone(),
        bytes: table.bytes,
        kind,
    };

    match &table.partitioning {
        CopyPartitioning::Whole => vec![base(UnitKind::Whole)],
        CopyPartitioning::ByPartitionKey => {
            if table.partitions.is_empty() {
                // partitioned table with no leaves holds no rows
                Vec::new()
            } else {
                table
                    .partitions
                    .iter()
                    .map(|p| {
                        base(UnitKind::Partition {
                            nspname: p.nspname.clone(),
                            relname: p.relname.clone(),
                        })
                    })
                    .collect()
            }
        }
        CopyPartitioning::CtidRange { ranges } => {
            let ranges = (*ranges).max(1) as i64;
            (0..ranges)
                .map(|i| {
                    let start_page = i * PAGES_PER_RANGE;
                    let end_page = if i == ranges - 1 {
                        None
                    } else {
                        Some((i + 1) * PAGES_PER_RANGE)
                    };
                    base(UnitKind::CtidRange {
                        start_page,
                        end_page,
                    })
                })
                .collect()
        }
    }
}

#[derive(Debug, Default, Clone)]
pub struct CopySummary {
    pub units_copied: usize,
    pub tables_done: usize,
    pub bytes_copied: u64,
    pub failures: Vec<String>,
}

/// The parallel worker pool streaming table data from source to target.
pub struct TableDataCopier {
    pub source_uri: String,
    pub target_uri: String,
    /// Snapshot every worker attaches to, when the run holds one.
    pub snapshot_name: Option<String>,
    pub jobs: usize,
    /// In resume mode the target is never truncated.
    pub resume: bool,
}

struct CopierShared {
    queue: Mutex<VecDeque<CopyUnit>>,
    remaining: Mutex<HashMap<u32, usize>>,
    failures: Mutex<Vec<String>>,
    summary: Mutex<CopySummary>,
    workdir: WorkDir,
    stop: Arc<AtomicBool>,
}

impl TableDataCopier {
    /// Copy every pending unit. Failed units are retried, then recorded;
    /// the run drains all other units before reporting failure.
    pub async fn run(
        &self,
        catalog: &SourceCatalog,
        workdir: &WorkDir,
        stop: Arc<AtomicBool>,
    ) -> Result<CopySummary> {
        let (queue, remaining) = build_units(catalog, workdir);

        if queue.is_empty() {
            tracing::info!("All table data already copied, nothing to do");
            return Ok(CopySummary::default());
        }

        tracing::info!(
            "Copying {} units across {} tables in {} concurrent jobs",
            queue.len(),
            remaining.len(),
            self.jobs
        );

        let shared = Arc::new(CopierShared {
            queue: Mutex::new(queue),
            remaining: Mutex::new(remaining),
            failures: Mutex::new(Vec::new()),
            summary: Mutex::new(CopySummary::default()),
            workdir: workdir.clone(),
            stop,
        });

        let mut workers = Vec::new();
        for worker_id in 0..self.jobs.max(1) {
            let shared = Arc::clone(&shared);
            let source_uri = self.source_uri.clone();
            let target_uri = self.target_uri.clone();
            let snapshot_name = self.snapshot_name.clone();
            let resume = self.resume;

            workers.push(tokio::spawn(async move {
                copy_worker(
                    worker_id,
                    shared,
                    source_uri,
                    target_uri,
                    snapshot_name,
                    resume,
                )
                .await
            }));
        }

        for worker in workers {
            worker.await.context("Copy worker panicked")??;
        }

        let mut summary = shared.summary.lock().await.clone();
        summary.failures = shared.failures.lock().await.clone();

        if !summary.failures.is_empty() {
            bail!(
                "{} copy unit(s) failed:\n{}",
                summary.failures.len(),
                summary.failures.join("\n")
            );
        }

        Ok(summary)
    }
}

async fn copy_worker(
    worker_id: usize,
    shared: Arc<CopierShared>,
    source_uri: String,
    target_uri: String,
    snapshot_name: Option<String>,
    resume: bool,
) -> Result<()> {
    loop {
        if shared.stop.load(Ordering::Relaxed) {
            tracing::info!("Copy worker {} stopping on request", worker_id);
            return Ok(());
        }

        let Some(unit) = shared.queue.lock().await.pop_front() else {
            return Ok(());
        };

        tracing::debug!(
            "Worker {} copying {}.{} ({:?})",
            worker_id,
            unit.nspname,
            unit.relname,
            unit.kind
        );

        let result = pg::retry_with_backoff(
            || {
                copy_one_unit(
                    &source_uri,
                    &target_uri,
                    snapshot_name.as_deref(),
                    &unit,
                    resume,
                    &shared.stop,
                )
            },
            COPY_UNIT_RETRIES,
            Duration::from_secs(1),
        )
        .await;

        match result {
            Ok(bytes) => {
                let table_finished = {
                    let mut remaining = shared.remaining.lock().await;
                    let count = remaining
                        .get_mut(&unit.table_oid)
                        .map(|c| {
                            *c -= 1;
                            *c
                        })
                        .unwrap_or(0);
                    count == 0
                };

                let mut summary = shared.summary.lock().await;
                summary.units_copied += 1;
                summary.bytes_copied += bytes;

                if table_finished {
                    // the last unit of the table writes the marker; index
                    // builds become eligible from this point on
                    shared.workdir.mark_done(DoneKey::Table(unit.table_oid))?;
                    summary.tables_done += 1;
                    tracing::info!("Table {}.{} copied", unit.nspname, unit.relname);
                }
            }
            Err(e) => {
                if shared.stop.load(Ordering::Relaxed) {
                    // an interrupted unit is not a failure; it simply has
                    // no done-marker and reruns on resume
                    tracing::info!(
                        "Copy of {}.{} interrupted by shutdown",
                        unit.nspname,
                        unit.relname
                    );
                    return Ok(());
                }
                tracing::error!(
                    "Failed to copy {}.{} ({:?}): {:#}",
                    unit.nspname,
                    unit.relname,
                    unit.kind,
                    e
                );
                shared.failures.lock().await.push(format!(
                    "{}.{} ({:?}): {:#}",
                    unit.nspname, unit.relname, unit.kind, e
                ));
            }
        }
    }
}

/// Stream one unit from source to target. Returns the byte count moved.
async fn copy_one_unit(
    source_uri: &str,
    target_uri: &str,
    snapshot_name: Option<&str>,
    unit: &CopyUnit,
    resume: bool,
    stop: &AtomicBool,
) -> Result<u64> {
    let source = match snapshot_name {
        Some(name) => snapshot::attach_snapshot(source_uri, name).await?,
        None => pg::connect(source_uri).await?,
    };
    let target = pg::connect(target_uri).await?;

    if !resume {
        if let Some(qname) = unit.truncate_target() {
            target
                .batch_execute(&format!("TRUNCATE ONLY {}", qname))
                .await
                .with_context(|| format!("Failed to truncate {}", qname))?;
        }
    }

    let out = source
        .copy_out(&unit.source_sql())
        .await
        .with_context(|| format!("COPY OUT failed for {}", unit.source_sql()))?;
    let sink = target
        .copy_in::<_, bytes::Bytes>(&unit.target_sql())
        .await
        .with_context(|| format!("COPY IN failed for {}", unit.target_sql()))?;

    futures::pin_mut!(out);
    futures::pin_mut!(sink);

    let mut bytes_copied = 0u64;

    while let Some(chunk) = out.next().await {
        // chunk boundaries are the cooperative cancellation points
        if stop.load(Ordering::Relaxed) {
            bail!("Copy interrupted by shutdown request");
        }

        let chunk = chunk.context("Error reading COPY data from the source")?;
        bytes_copied += chunk.len() as u64;
        sink.send(chunk)
            .await
            .context("Error writing COPY data to the target")?;
    }

    let rows = sink
        .finish()
        .await
        .context("Failed to finish the COPY on the target")?;

    tracing::debug!(
        "Copied {} rows ({} bytes) into {}.{}",
        rows,
        bytes_copied,
        unit.nspname,
        unit.relname
    );

    Ok(bytes_copied)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::SourcePartition;
    use tempfile::TempDir;

    fn table(oid: u32, bytes: i64, partitioning: CopyPartitioning) -> SourceTable {
        SourceTable {
            oid,
            nspname: "public".to_string(),
            relname: format!("t{}", oid),
            estimated_row_count: 0,
            bytes,
            relpages: 0,
            attributes: vec!["id".to_string()],
            partition_key: None,
            partitioning,
            partitions: Vec::new(),
        }
    }

    fn workdir() -> (TempDir, WorkDir) {
        let tmp = TempDir::new().unwrap();
        let wd = WorkDir::for_target("postgresql://u@h/db", Some(tmp.path())).unwrap();
        wd.ensure().unwrap();
        (tmp, wd)
    }

    #[test]
    fn test_units_sorted_largest_first() {
        let (_tmp, wd) = workdir();
        let mut catalog = SourceCatalog::default();
        catalog.tables.push(table(1, 100, CopyPartitioning::Whole));
        catalog.tables.push(table(2, 900, CopyPartitioning::Whole));
        catalog.tables.push(table(3, 500, CopyPartitioning::Whole));

        let (queue, remaining) = build_units(&catalog, &wd);
        let order: Vec<u32> = queue.iter().map(|u| u.table_oid).collect();
        assert_eq!(order, vec![2, 3, 1]);
        assert_eq!(remaining.len(), 3);
        assert!(remaining.values().all(|&c| c == 1));
    }

    #[test]
    fn test_done_tables_produce_no_units() {
        let (_tmp, wd) = workdir();
        let mut catalog = SourceCatalog::default();
        catalog.tables.push(table(1, 100, CopyPartitioning::Whole));
        catalog.tables.push(table(2, 900, CopyPartitioning::Whole));

        wd.mark_done(DoneKey::Table(2)).unwrap();

        let (queue, remaining) = build_units(&catalog, &wd);
        assert_eq!(queue.len(), 1);
        assert_eq!(queue[0].table_oid, 1);
        assert!(!remaining.contains_key(&2));
    }

    #[test]
    fn test_ctid_range_units() {
        let (_tmp, wd) = workdir();
        let mut catalog = SourceCatalog::default();
        catalog
            .tables
            .push(table(1, 4_000_000_000, CopyPartitioning::CtidRange { ranges: 3 }));

        let (queue, _) = build_units(&catalog, &wd);
        assert_eq!(queue.len(), 3);

        let sql = queue[0].source_sql();
        assert!(sql.contains("ctid >= '(0,0)'::tid"));
        assert!(sql.contains(&format!("ctid < '({},0)'::tid", PAGES_PER_RANGE)));

        // the last range is open-ended
        let last = queue[2].source_sql();
        assert!(last.contains(&format!("ctid >= '({},0)'::tid", 2 * PAGES_PER_RANGE)));
        assert!(!last.contains("ctid <"));

        // ranges never truncate the target
        assert!(queue[0].truncate_target().is_none());
    }

    #[test]
    fn test_partition_units() {
        let (_tmp, wd) = workdir();
        let mut catalog = SourceCatalog::default();
        let mut parent = table(1, 100, CopyPartitioning::ByPartitionKey);
        parent.partitions = vec![
            SourcePartition {
                oid: 10,
                nspname: "public".to_string(),
                relname: "t1_2026_01".to_string(),
            },
            SourcePartition {
                oid: 11,
                nspname: "public".to_string(),
                relname: "t1_2026_02".to_string(),
            },
        ];
        catalog.tables.push(parent);

        let (queue, remaining) = build_units(&catalog, &wd);
        assert_eq!(queue.len(), 2);
        assert_eq!(remaining[&1], 2);
        assert_eq!(
            queue[0].target_sql(),
            "COPY \"public\".\"t1_2026_01\" FROM STDIN"
        );
    }

    #[test]
    fn test_whole_unit_sql() {
        let unit = CopyUnit {
            table_oid: 1,
            nspname: "public".to_string(),
            relname: "users".to_string(),
            bytes: 0,
            kind: UnitKind::Whole,
        };
        assert_eq!(unit.source_sql(), "COPY \"public\".\"users\" TO STDOUT");
        assert_eq!(unit.target_sql(), "COPY \"public\".\"users\" FROM STDIN");
        assert_eq!(
            unit.truncate_target().unwrap(),
            "\"public\".\"users\""
        );
    }
}
