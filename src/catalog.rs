// ABOUTME: In-memory model of the source schema, fetched under the snapshot
// ABOUTME: Tables, indexes, constraints, sequences, extensions and their sizes

use anyhow::{Context, Result};
use tokio_postgres::Client;

use crate::filters::CopyFilters;

/// How the table data copier splits one table into copy units.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CopyPartitioning {
    /// One COPY for the whole table.
    Whole,
    /// Split a large heap table into ctid page ranges.
    CtidRange { ranges: u32 },
    /// Copy each partition of a partitioned table separately.
    ByPartitionKey,
}

/// One leaf partition of a partitioned table.
#[derive(Debug, Clone)]
pub struct SourcePartition {
    pub oid: u32,
    pub nspname: String,
    pub relname: String,
}

#[derive(Debug, Clone)]
pub struct SourceTable {
    pub oid: u32,
    pub nspname: String,
    pub relname: String,
    /// Planner estimate, good enough for scheduling.
    pub estimated_row_count: i64,
    pub bytes: i64,
    pub relpages: i64,
    pub attributes: Vec<String>,
    pub partition_key: Option<String>,
    pub partitioning: CopyPartitioning,
    pub partitions: Vec<SourcePartition>,
}

impl SourceTable {
    pub fn qualified_name(&self) -> String {
        crate::pg::qualified_name(&self.nspname, &self.relname)
    }
}

/// A constraint backed by an index (primary key or unique).
#[derive(Debug, Clone)]
pub struct SourceConstraint {
    pub oid: u32,
    pub conname: String,
    pub condef: String,
}

#[derive(Debug, Clone)]
pub struct SourceIndex {
    pub oid: u32,
    pub table_oid: u32,
    pub nspname: String,
    pub relname: String,
    pub indexdef: String,
    pub is_primary: bool,
    pub is_unique: bool,
    pub constraint: Option<SourceConstraint>,
}

#[derive(Debug, Clone)]
pub struct SourceSequence {
    pub oid: u32,
    pub nspname: String,
    pub relname: String,
}

#[derive(Debug, Clone)]
pub struct ExtensionConfig {
    pub nspname: String,
    pub relname: String,
    /// WHERE clause narrowing the rows to copy, possibly empty.
    pub condition: String,
}

#[derive(Debug, Clone)]
pub struct SourceExtension {
    pub name: String,
    pub config: Vec<ExtensionConfig>,
}

/// Everything the bulk copy phase needs to know about the source, fetched
/// once under the snapshot and immutable afterwards.
#[derive(Debug, Clone, Default)]
pub struct SourceCatalog {
    pub tables: Vec<SourceTable>,
    pub indexes: Vec<SourceIndex>,
    pub sequences: Vec<SourceSequence>,
    pub extensions: Vec<SourceExtension>,
    /// Source objects that exist but are rejected by the filters; used to
    /// comment out their archive entries at restore time.
    pub filtered_out_oids: Vec<u32>,
}

/// Tables larger than this are split into ctid ranges unless they are
/// partitioned. Matches a COPY unit of roughly one gigabyte.
pub const DEFAULT_SPLIT_THRESHOLD: i64 = 1024 * 1024 * 1024;

/// Pages per ctid-range unit for split tables.
const PAGES_PER_RANGE: i64 = 128 * 1024;

impl SourceCatalog {
    /// Populate the catalog from the source, applying filters.
    ///
    /// `client` must already be inside the snapshot transaction so every
    /// query sees the same consistent state as the schema dump.
    pub async fn fetch(
        client: &Client,
        filters: &CopyFilters,
        split_threshold: i64,
    ) -> Result<SourceCatalog> {
        let mut catalog = SourceCatalog::default();

        catalog.fetch_tables(client, filters, split_threshold).await?;
        catalog.fetch_indexes(client, filters).await?;
        catalog.fetch_sequences(client, filters).await?;
        catalog.fetch_extensions(client).await?;

        tracing::info!(
            "Fetched {} tables ({} bytes), {} indexes, {} sequences, {} extensions",
            catalog.tables.len(),
            catalog.total_bytes(),
            catalog.indexes.len(),
            catalog.sequences.len(),
            catalog.extensions.len()
        );

        Ok(catalog)
    }

    async fn fetch_tables(
        &mut self,
        client: &Client,
        filters: &CopyFilters,
        split_threshold: i64,
    ) -> Result<()> {
        let rows = client
            .query(
                r#"
                SELECT c.oid,
                       n.nspname,
                       c.relname,
                       c.reltuples::bigint,
                       pg_table_size(c.oid),
                       c.relpages::bigint,
                       c.relkind = 'p' AS is_partitioned,
                       CASE WHEN c.relkind = 'p'
                            THEN pg_get_partkeydef(c.oid)
                       END AS partition_key
                  FROM pg_class c
                  JOIN pg_namespace n ON n.oid = c.relnamespace
                 WHERE c.relkind IN ('r', 'p')
                   AND c.relpersistence = 'p'
                   AND NOT c.relispartition
                   AND n.nspname NOT IN ('pg_catalog', 'information_schema', 'pgcopydb')
                 ORDER BY pg_table_size(c.oid) DESC
                "#,
                &[],
            )
            .await
            .context("Failed to list source tables")?;

        for row in rows {
            let oid: u32 = row.get(0);
            let nspname: String = row.get(1);
            let relname: String = row.get(2);

            if !filters.allows_table(&nspname, &relname) {
                self.filtered_out_oids.push(oid);
                continue;
            }

            let estimated_row_count: i64 = row.get(3);
            let bytes: i64 = row.get(4);
            let relpages: i64 = row.get(5);
            let is_partitioned: bool = row.get(6);
            let partition_key: Option<String> = row.get(7);

            let attributes = fetch_attributes(client, oid).await?;

            let (partitioning, partitions) = if is_partitioned {
                let partitions = fetch_partitions(client, oid).await?;
                (CopyPartitioning::ByPartitionKey, partitions)
            } else if bytes > split_threshold && relpages > PAGES_PER_RANGE {
                let ranges = (relpages / PAGES_PER_RANGE + 1) as u32;
                (CopyPartitioning::CtidRange { ranges }, Vec::new())
            } else {
                (CopyPartitioning::Whole, Vec::new())
            };

            self.tables.push(SourceTable {
                oid,
                nspname,
                relname,
                estimated_row_count: estimated_row_count.max(0),
                bytes,
                relpages,
                attributes,
                partition_key,
                partitioning,
                partitions,
            });
        }

        Ok(())
    }

    async fn fetch_indexes(&mut self, client: &Client, filters: &CopyFilters) -> Result<()> {
        let rows = client
            .query(
                r#"
                SELECT i.oid,
                       x.indrelid,
                       n.nspname,
                       i.relname,
                       pg_get_indexdef(i.oid),
                       x.indisprimary,
                       x.indisunique,
                       con.oid,
                       con.conname,
                       pg_get_constraintdef(con.oid)
                  FROM pg_index x
                  JOIN pg_class i ON i.oid = x.indexrelid
                  JOIN pg_class t ON t.oid = x.indrelid
                  JOIN pg_namespace n ON n.oid = t.relnamespace
                  LEFT JOIN pg_constraint con
                         ON con.conindid = i.oid
                        AND con.contype IN ('p', 'u')
                 WHERE t.relkind IN ('r', 'p')
                   AND NOT t.relispartition
                   AND n.nspname NOT IN ('pg_catalog', 'information_schema', 'pgcopydb')
                 ORDER BY x.indrelid, i.oid
                "#,
                &[],
            )
            .await
            .context("Failed to list source indexes")?;

        for row in rows {
            let oid: u32 = row.get(0);
            let table_oid: u32 = row.get(1);
            let nspname: String = row.get(2);
            let relname: String = row.get(3);

            let table = self.tables.iter().find(|t| t.oid == table_oid);
            let Some(table) = table else {
                // index on a filtered-out table
                if !filters.allows_schema(&nspname) || self.filtered_out_oids.contains(&table_oid)
                {
                    self.filtered_out_oids.push(oid);
                }
                continue;
            };

            let constraint_oid: Option<u32> = row.get(7);
            let constraint = constraint_oid.map(|con_oid| SourceConstraint {
                oid: con_oid,
                conname: row.get(8),
                condef: row.get(9),
            });

            self.indexes.push(SourceIndex {
                oid,
                table_oid: table.oid,
                nspname,
                relname,
                indexdef: row.get(4),
                is_primary: row.get(5),
                is_unique: row.get(6),
                constraint,
            });
        }

        Ok(())
    }

    async fn fetch_sequences(&mut self, client: &Client, filters: &CopyFilters) -> Result<()> {
        let rows = client
            .query(
                r#"
                SELECT c.oid, n.nspname, c.relname
                  FROM pg_class c
                  JOIN pg_namespace n ON n.oid = c.relnamespace
                 WHERE c.relkind = 'S'
                   AND n.nspname NOT IN ('pg_catalog', 'information_schema', 'pgcopydb')
                 ORDER BY n.nspname, c.relname
                "#,
                &[],
            )
            .await
            .context("Failed to list source sequences")?;

        for row in rows {
            let oid: u32 = row.get(0);
            let nspname: String = row.get(1);
            let relname: String = row.get(2);

            if !filters.allows_schema(&nspname) {
                self.filtered_out_oids.push(oid);
                continue;
            }

            self.sequences.push(SourceSequence {
                oid,
                nspname,
                relname,
            });
        }

        Ok(())
    }

    async fn fetch_extensions(&mut self, client: &Client) -> Result<()> {
        let rows = client
            .query(
                r#"
                SELECT e.extname, n.nspname, c.relname, cfg.condition
                  FROM pg_extension e
                 CROSS JOIN LATERAL
                       unnest(e.extconfig, e.extcondition) AS cfg(attrelid, condition)
                  JOIN pg_class c ON c.oid = cfg.attrelid
                  JOIN pg_namespace n ON n.oid = c.relnamespace
                 ORDER BY e.extname
                "#,
                &[],
            )
            .await
            .context("Failed to list extension configuration tables")?;

        for row in rows {
            let extname: String = row.get(0);
            let config = ExtensionConfig {
                nspname: row.get(1),
                relname: row.get(2),
                condition: row.get::<_, Option<String>>(3).unwrap_or_default(),
            };

            match self.extensions.iter_mut().find(|e| e.name == extname) {
                Some(ext) => ext.config.push(config),
                None => self.extensions.push(SourceExtension {
                    name: extname,
                    config: vec![config],
                }),
            }
        }

        // extensions without any configuration table still matter for
        // CREATE EXTENSION on the target
        let rows = client
            .query("SELECT extname FROM pg_extension ORDER BY extname", &[])
            .await
            .context("Failed to list extensions")?;

        for row in rows {
            let extname: String = row.get(0);
            if extname == "plpgsql" {
                continue;
            }
            if !self.extensions.iter().any(|e| e.name == extname) {
                self.extensions.push(SourceExtension {
                    name: extname,
                    config: Vec::new(),
                });
            }
        }

        Ok(())
    }

    pub fn total_bytes(&self) -> i64 {
        self.tables.iter().map(|t| t.bytes).sum()
    }

    pub fn total_estimated_rows(&self) -> i64 {
        self.tables.iter().map(|t| t.estimated_row_count).sum()
    }

    pub fn table_by_oid(&self, oid: u32) -> Option<&SourceTable> {
        self.tables.iter().find(|t| t.oid == oid)
    }

    /// Indexes of one table, in build order.
    pub fn indexes_for_table(&self, table_oid: u32) -> Vec<&SourceIndex> {
        let mut indexes: Vec<&SourceIndex> = self
            .indexes
            .iter()
            .filter(|i| i.table_oid == table_oid)
            .collect();
        // primary and unique constraints come first within a table
        indexes.sort_by_key(|i| (!i.is_primary, !i.is_unique, i.oid));
        indexes
    }
}

async fn fetch_attributes(client: &Client, table_oid: u32) -> Result<Vec<String>> {
    let rows = client
        .query(
            r#"
            SELECT attname
              FROM pg_attribute
             WHERE attrelid = $1
               AND attnum > 0
               AND NOT attisdropped
             ORDER BY attnum
            "#,
            &[&table_oid],
        )
        .await
        .context("Failed to list table attributes")?;

    Ok(rows.iter().map(|row| row.get(0)).collect())
}

async fn fetch_partitions(client: &Client, parent_oid: u32) -> Result<Vec<SourcePartition>> {
    let rows = client
        .query(
            r#"
            SELECT c.oid, n.nspname, c.relname
              FROM pg_inherits h
              JOIN pg_class c ON c.oid = h.inhrelid
              JOIN pg_namespace n ON n.oid = c.relnamespace
             WHERE h.inhparent = $1
               AND c.relkind = 'r'
             ORDER BY c.relname
            "#,
            &[&parent_oid],
        )
        .await
        .context("Failed to list table partitions")?;

    Ok(rows
        .iter()
        .map(|row| SourcePartition {
            oid: row.get(0),
            nspname: row.get(1),
            relname: row.get(2),
        })
        .collect())
}
