// ABOUTME: Drives pg_dump and pg_restore for the pre-data and post-data passes
// ABOUTME: Parses the restore catalog and rewrites it into a filtered include-list

use anyhow::{bail, Context, Result};
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;
use tokio::process::Command;
use tokio_postgres::Client;

use crate::catalog::SourceCatalog;
use crate::filters::CopyFilters;
use crate::pg;
use crate::workdir::{durable_write, DoneKey, WorkDir};

/// Which half of the schema a pass covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DumpSection {
    /// Tables, types, functions, sequences. No indexes or constraints.
    PreData,
    /// Indexes, constraints, triggers, policies, rules.
    PostData,
}

impl DumpSection {
    fn as_str(self) -> &'static str {
        match self {
            DumpSection::PreData => "pre-data",
            DumpSection::PostData => "post-data",
        }
    }

    fn dump_marker(self) -> DoneKey {
        match self {
            DumpSection::PreData => DoneKey::PreDataDump,
            DumpSection::PostData => DoneKey::PostDataDump,
        }
    }

    fn restore_marker(self) -> DoneKey {
        match self {
            DumpSection::PreData => DoneKey::PreDataRestore,
            DumpSection::PostData => DoneKey::PostDataRestore,
        }
    }
}

/// One line of the pg_restore catalog (`pg_restore --list` output).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveEntry {
    pub dump_id: u32,
    pub catalog_oid: u32,
    pub object_oid: u32,
    pub desc: String,
    pub restore_list_name: String,
}

/// Options forwarded to the restore pass.
#[derive(Debug, Clone, Default)]
pub struct RestoreOptions {
    pub drop_if_exists: bool,
}

/// Descriptions that span multiple words in pg_restore list output, longest
/// first so greedy matching picks the right one.
const MULTI_WORD_DESCS: &[&str] = &[
    "MATERIALIZED VIEW DATA",
    "TEXT SEARCH CONFIGURATION",
    "TEXT SEARCH DICTIONARY",
    "TEXT SEARCH PARSER",
    "TEXT SEARCH TEMPLATE",
    "FK CONSTRAINT",
    "CHECK CONSTRAINT",
    "TABLE DATA",
    "TABLE ATTACH",
    "INDEX ATTACH",
    "SEQUENCE OWNED BY",
    "SEQUENCE SET",
    "DEFAULT ACL",
    "OPERATOR CLASS",
    "OPERATOR FAMILY",
    "MATERIALIZED VIEW",
    "FOREIGN TABLE",
    "FOREIGN DATA WRAPPER",
    "EVENT TRIGGER",
    "ROW SECURITY",
    "USER MAPPING",
    "ACCESS METHOD",
    "LARGE OBJECT",
    "PROCEDURAL LANGUAGE",
];

/// Parse the output of `pg_restore --list`.
///
/// Data lines look like `123; 1259 16385 TABLE public users owner`; comment
/// and header lines start with `;` and are skipped.
pub fn parse_archive_list(contents: &str) -> Result<Vec<ArchiveEntry>> {
    let mut entries = Vec::new();

    for line in contents.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with(';') {
            continue;
        }

        let Some((dump_id, rest)) = line.split_once(';') else {
            continue;
        };
        let dump_id: u32 = dump_id
            .trim()
            .parse()
            .with_context(|| format!("Invalid archive list line: {}", line))?;

        let rest = rest.trim();
        let mut words = rest.splitn(3, ' ');
        let catalog_oid: u32 = words
            .next()
            .unwrap_or_default()
            .parse()
            .with_context(|| format!("Invalid archive list line: {}", line))?;
        let object_oid: u32 = words
            .next()
            .unwrap_or_default()
            .parse()
            .with_context(|| format!("Invalid archive list line: {}", line))?;
        let tail = words.next().unwrap_or_default();

        let (desc, restore_list_name) = split_desc(tail);

        entries.push(ArchiveEntry {
            dump_id,
            catalog_oid,
            object_oid,
            desc,
            restore_list_name,
        });
    }

    Ok(entries)
}

fn split_desc(tail: &str) -> (String, String) {
    for multi in MULTI_WORD_DESCS {
        if let Some(rest) = tail.strip_prefix(multi) {
            if rest.is_empty() || rest.starts_with(' ') {
                return (multi.to_string(), rest.trim_start().to_string());
            }
        }
    }
    match tail.split_once(' ') {
        Some((desc, name)) => (desc.to_string(), name.to_string()),
        None => (tail.to_string(), String::new()),
    }
}

/// Render an include-list for `pg_restore --use-list`: every entry verbatim,
/// except entries to skip which are prefixed with the `;` comment sentinel.
pub fn render_restore_list(entries: &[ArchiveEntry], skip: &dyn Fn(&ArchiveEntry) -> bool) -> String {
    let mut out = String::new();
    for entry in entries {
        if skip(entry) {
            out.push(';');
            tracing::debug!(
                "Skipping dumpId {}: {} {} {}",
                entry.dump_id,
                entry.desc,
                entry.object_oid,
                entry.restore_list_name
            );
        }
        out.push_str(&format!(
            "{}; {} {} {} {}\n",
            entry.dump_id, entry.catalog_oid, entry.object_oid, entry.desc, entry.restore_list_name
        ));
    }
    out
}

/// Whether an archive entry should be commented out of the include-list:
/// either the object was already built concurrently (its done-marker
/// exists), or it is rejected by the filters.
pub fn should_skip_entry(
    entry: &ArchiveEntry,
    workdir: &WorkDir,
    filters: &CopyFilters,
    filtered_out_oids: &HashSet<u32>,
) -> bool {
    if entry.object_oid != 0
        && (workdir.is_done(DoneKey::Index(entry.object_oid))
            || filtered_out_oids.contains(&entry.object_oid))
    {
        return true;
    }

    if entry.desc == "SCHEMA" {
        // list name for a schema is "<name> <owner>"
        let name = entry
            .restore_list_name
            .split(' ')
            .next()
            .unwrap_or_default();
        return !filters.allows_schema(name);
    }

    // restore list names are "<schema> <name> <owner>"
    if let Some((nspname, rest)) = entry.restore_list_name.split_once(' ') {
        if !filters.allows_schema(nspname) {
            return true;
        }
        if matches!(entry.desc.as_str(), "TABLE" | "TABLE DATA") {
            if let Some((relname, _owner)) = rest.rsplit_once(' ') {
                return !filters.allows_table(nspname, relname);
            }
            return !filters.allows_table(nspname, rest);
        }
    }

    false
}

/// Runs the external dumper and restorer, one pass per schema section, each
/// gated by a done-marker.
pub struct SchemaDriver {
    source_uri: String,
    target_uri: String,
    workdir: WorkDir,
    filters: CopyFilters,
}

impl SchemaDriver {
    pub fn new(
        source_uri: &str,
        target_uri: &str,
        workdir: &WorkDir,
        filters: &CopyFilters,
    ) -> SchemaDriver {
        SchemaDriver {
            source_uri: source_uri.to_string(),
            target_uri: target_uri.to_string(),
            workdir: workdir.clone(),
            filters: filters.clone(),
        }
    }

    /// pg_dump one section of the source schema under the snapshot.
    pub async fn dump_section(&self, section: DumpSection, snapshot_name: &str) -> Result<()> {
        if self.workdir.is_done(section.dump_marker()) {
            tracing::info!(
                "Skipping pg_dump --section={}, done on a previous run",
                section.as_str()
            );
            return Ok(());
        }

        let dump_path = match section {
            DumpSection::PreData => self.workdir.pre_dump_path(),
            DumpSection::PostData => self.workdir.post_dump_path(),
        };

        tracing::info!("Running pg_dump --section={}", section.as_str());

        let mut cmd = Command::new("pg_dump");
        cmd.arg("--format=custom")
            .arg(format!("--section={}", section.as_str()))
            .arg(format!("--snapshot={}", snapshot_name))
            .arg("--file")
            .arg(&dump_path)
            .arg(&self.source_uri);

        run_pg_tool(cmd, "pg_dump").await?;

        self.workdir.mark_done(section.dump_marker())
    }

    /// pg_restore one section into the target, driven by a rewritten
    /// include-list so filtered and already-built objects are skipped.
    pub async fn restore_section(
        &self,
        section: DumpSection,
        catalog: &SourceCatalog,
        options: &RestoreOptions,
    ) -> Result<()> {
        let (dump_path, list_path) = match section {
            DumpSection::PreData => (self.workdir.pre_dump_path(), self.workdir.pre_list_path()),
            DumpSection::PostData => (self.workdir.post_dump_path(), self.workdir.post_list_path()),
        };

        if !dump_path.exists() {
            bail!("Dump file {:?} does not exist", dump_path);
        }

        if self.workdir.is_done(section.restore_marker()) {
            tracing::info!(
                "Skipping pg_restore of the {} section, done on a previous run",
                section.as_str()
            );
            return Ok(());
        }

        self.write_restore_list(&dump_path, &list_path, catalog)
            .await?;

        if section == DumpSection::PreData {
            // pg_restore --clean gets confused by partial include-lists, so
            // --drop-if-exists is implemented as one big DROP statement
            if options.drop_if_exists {
                let target = pg::connect_with_retry(&self.target_uri).await?;
                drop_target_tables(&target, catalog).await?;
            }

            if !self.filters.include_only_schemas().is_empty() {
                let target = pg::connect_with_retry(&self.target_uri).await?;
                create_target_namespaces(&target, self.filters.include_only_schemas()).await?;
            }
        }

        tracing::info!("Running pg_restore --section={}", section.as_str());

        let mut cmd = Command::new("pg_restore");
        cmd.arg("--no-owner")
            .arg("--use-list")
            .arg(&list_path)
            .arg("--dbname")
            .arg(&self.target_uri)
            .arg(&dump_path);

        run_pg_tool(cmd, "pg_restore").await?;

        self.workdir.mark_done(section.restore_marker())
    }

    /// Fetch the archive's entry list and rewrite it as the include-list.
    async fn write_restore_list(
        &self,
        dump_path: &Path,
        list_path: &Path,
        catalog: &SourceCatalog,
    ) -> Result<()> {
        let output = Command::new("pg_restore")
            .arg("--list")
            .arg(dump_path)
            .output()
            .await
            .context("Failed to run pg_restore --list")?;

        if !output.status.success() {
            bail!(
                "pg_restore --list failed with exit code {}:\n{}",
                output.status.code().unwrap_or(-1),
                String::from_utf8_lossy(&output.stderr)
            );
        }

        let entries = parse_archive_list(&String::from_utf8_lossy(&output.stdout))?;
        let filtered_out: HashSet<u32> = catalog.filtered_out_oids.iter().copied().collect();

        let contents = render_restore_list(&entries, &|entry| {
            should_skip_entry(entry, &self.workdir, &self.filters, &filtered_out)
        });

        durable_write(list_path, contents.as_bytes())
            .with_context(|| format!("Failed to write the include-list {:?}", list_path))
    }
}

/// Issue a single `DROP TABLE IF EXISTS ... CASCADE` naming every table of
/// this run.
pub async fn drop_target_tables(target: &Client, catalog: &SourceCatalog) -> Result<()> {
    if catalog.tables.is_empty() {
        tracing::info!("No tables to migrate, skipping drop tables on the target database");
        return Ok(());
    }

    tracing::info!("Drop tables on the target database, per --drop-if-exists");

    let names: Vec<String> = catalog.tables.iter().map(|t| t.qualified_name()).collect();
    let sql = format!("DROP TABLE IF EXISTS {} CASCADE", names.join(", "));

    target
        .batch_execute(&sql)
        .await
        .context("Failed to drop existing tables on the target")
}

/// CREATE SCHEMA IF NOT EXISTS for each include-only schema, so restoring
/// into a fresh database succeeds.
pub async fn create_target_namespaces(target: &Client, schemas: &[String]) -> Result<()> {
    tracing::info!("Creating schemas specified in the inclusion filter");

    for nspname in schemas {
        let sql = format!("CREATE SCHEMA IF NOT EXISTS {}", pg::quote_ident(nspname));
        target
            .batch_execute(&sql)
            .await
            .with_context(|| format!("Failed to create schema \"{}\"", nspname))?;
    }

    Ok(())
}

/// Run a pg_dump/pg_restore invocation, retrying connection-class failures
/// with exponential backoff and propagating the exit code otherwise.
async fn run_pg_tool(mut cmd: Command, name: &str) -> Result<()> {
    let mut delay = Duration::from_secs(1);
    let mut last_error = None;

    for attempt in 0..=pg::CONNECT_RETRIES {
        let output = cmd
            .output()
            .await
            .with_context(|| format!("Failed to execute {}", name))?;

        if output.status.success() {
            return Ok(());
        }

        let stderr = String::from_utf8_lossy(&output.stderr).to_string();
        let error = anyhow::anyhow!(
            "{} failed with exit code {}:\n{}",
            name,
            output.status.code().unwrap_or(-1),
            stderr.trim()
        );

        if !is_connection_error(&stderr) {
            return Err(error);
        }
        last_error = Some(error);

        if attempt < pg::CONNECT_RETRIES {
            tracing::warn!(
                "{} failed (attempt {}/{}), retrying in {:?}...",
                name,
                attempt + 1,
                pg::CONNECT_RETRIES + 1,
                delay
            );
            tokio::time::sleep(delay).await;
            delay *= 2;
        }
    }

    Err(last_error.unwrap_or_else(|| anyhow::anyhow!("{} failed after retries", name)))
}

fn is_connection_error(stderr: &str) -> bool {
    const PATTERNS: &[&str] = &[
        "connection closed",
        "connection refused",
        "could not connect",
        "server closed the connection",
        "timeout",
        "Connection timed out",
    ];
    PATTERNS.iter().any(|p| stderr.contains(p))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const SAMPLE_LIST: &str = "\
;
; Archive created at 2026-07-14 09:21:04 CEST
;     dbname: app
;
; Selected TOC Entries:
;
4; 2615 16386 SCHEMA s owner
5; 2615 2200 SCHEMA public owner
215; 1259 16387 TABLE public users owner
216; 1259 16390 TABLE s secret owner
3215; 1259 16400 INDEX public i1 owner
3216; 1259 16401 INDEX public i2 owner
3300; 2606 16410 FK CONSTRAINT public orders_user_id_fkey owner
";

    #[test]
    fn test_parse_archive_list() {
        let entries = parse_archive_list(SAMPLE_LIST).unwrap();
        assert_eq!(entries.len(), 7);

        assert_eq!(entries[0].dump_id, 4);
        assert_eq!(entries[0].catalog_oid, 2615);
        assert_eq!(entries[0].object_oid, 16386);
        assert_eq!(entries[0].desc, "SCHEMA");
        assert_eq!(entries[0].restore_list_name, "s owner");

        let fk = &entries[6];
        assert_eq!(fk.desc, "FK CONSTRAINT");
        assert_eq!(fk.restore_list_name, "public orders_user_id_fkey owner");
    }

    #[test]
    fn test_parse_archive_list_skips_comments() {
        let entries = parse_archive_list("; only comments\n;\n").unwrap();
        assert!(entries.is_empty());
    }

    #[test]
    fn test_render_restore_list_comments_skipped_entries() {
        let entries = parse_archive_list(SAMPLE_LIST).unwrap();
        let rendered = render_restore_list(&entries, &|e| e.object_oid == 16400);

        assert!(rendered.contains("\n;3215; 1259 16400 INDEX public i1 owner\n"));
        assert!(rendered.contains("\n3216; 1259 16401 INDEX public i2 owner\n"));
        // entries count preserved, commented or not
        assert_eq!(rendered.lines().count(), entries.len());
    }

    #[test]
    fn test_should_skip_done_and_filtered_entries() {
        let tmp = TempDir::new().unwrap();
        let workdir = WorkDir::for_target("postgresql://u@h/db", Some(tmp.path())).unwrap();
        workdir.ensure().unwrap();

        // concurrently built index
        workdir.mark_done(DoneKey::Index(16400)).unwrap();

        let filters = CopyFilters::new(
            vec![],
            vec![],
            vec![],
            vec!["s.secret".to_string()],
        )
        .unwrap();

        let entries = parse_archive_list(SAMPLE_LIST).unwrap();
        let filtered_out: HashSet<u32> = [16390u32].into_iter().collect();

        let skipped: Vec<bool> = entries
            .iter()
            .map(|e| should_skip_entry(e, &workdir, &filters, &filtered_out))
            .collect();

        // schemas stay, the excluded table and the built index are commented
        assert_eq!(
            skipped,
            vec![false, false, false, true, true, false, false]
        );
    }

    #[test]
    fn test_should_skip_excluded_schema_entries() {
        let tmp = TempDir::new().unwrap();
        let workdir = WorkDir::for_target("postgresql://u@h/db", Some(tmp.path())).unwrap();
        workdir.ensure().unwrap();

        let filters =
            CopyFilters::new(vec![], vec!["s".to_string()], vec![], vec![]).unwrap();

        let entries = parse_archive_list(SAMPLE_LIST).unwrap();
        let filtered_out = HashSet::new();

        let schema_s = &entries[0];
        assert!(should_skip_entry(schema_s, &workdir, &filters, &filtered_out));

        let table_secret = &entries[3];
        assert!(should_skip_entry(
            table_secret,
            &workdir,
            &filters,
            &filtered_out
        ));

        let table_users = &entries[2];
        assert!(!should_skip_entry(
            table_users,
            &workdir,
            &filters,
            &filtered_out
        ));
    }
}
