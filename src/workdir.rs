// ABOUTME: Work directory layout, done-marker store, and PID file handling
// ABOUTME: All cross-process coordination state lives under this tree

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::lsn::Lsn;
use crate::pg::sanitize_uri;

/// A unit of work tracked by a zero-byte done-marker file.
///
/// The marker's existence proves the unit succeeded; writing it is the last
/// action of a successful unit, and callers check for it before doing the
/// work again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DoneKey {
    PreDataDump,
    PostDataDump,
    PreDataRestore,
    PostDataRestore,
    Table(u32),
    Index(u32),
}

/// Descriptor of the replication slot created on the source, persisted so a
/// resumed run can check it is resuming from the same stream.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SlotDescriptor {
    pub slot_name: String,
    pub plugin: String,
    pub consistent_lsn: Lsn,
    pub snapshot_name: Option<String>,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

/// The on-disk tree backing one migration.
///
/// The root is derived from the target connection string, so two runs
/// targeting the same database share their tree and resume each other's
/// work. Layout:
///
/// ```text
/// <root>/run.pid
/// <root>/schema/{pre.dump, post.dump, pre.list, post.list}
/// <root>/objects/tables/<oid>.done
/// <root>/objects/indexes/<oid>.done
/// <root>/cdc/<wal-segment>.{json,sql}
/// <root>/slot
/// <root>/origin
/// ```
#[derive(Debug, Clone)]
pub struct WorkDir {
    root: PathBuf,
}

impl WorkDir {
    /// Work directory for a given target URI, under `XDG_DATA_HOME` (or the
    /// platform data directory) unless an explicit directory is given.
    pub fn for_target(target_uri: &str, explicit_dir: Option<&Path>) -> Result<WorkDir> {
        if let Some(dir) = explicit_dir {
            return Ok(WorkDir {
                root: dir.to_path_buf(),
            });
        }

        let base = match std::env::var_os("XDG_DATA_HOME") {
            Some(dir) if !dir.is_empty() => PathBuf::from(dir),
            _ => dirs::data_dir().context("Failed to determine the user data directory")?,
        };

        let mut hasher = Sha256::new();
        hasher.update(sanitize_uri(target_uri).as_bytes());
        let digest = format!("{:x}", hasher.finalize());

        Ok(WorkDir {
            root: base.join("pgcopydb").join(&digest[..12]),
        })
    }

    /// Create the directory tree. Idempotent.
    pub fn ensure(&self) -> Result<()> {
        for dir in [
            self.root.clone(),
            self.schema_dir(),
            self.tables_done_dir(),
            self.indexes_done_dir(),
            self.cdc_dir(),
        ] {
            fs::create_dir_all(&dir)
                .with_context(|| format!("Failed to create work directory {:?}", dir))?;
        }
        Ok(())
    }

    /// Enforce the restart/resume policy before reusing an existing tree.
    ///
    /// A non-empty tree from a previous run is only reused with `--resume`
    /// (keep all markers) or `--restart` (wipe everything and start over).
    pub fn prepare(&self, resume: bool, restart: bool) -> Result<()> {
        if restart && self.root.exists() {
            tracing::info!("Removing work directory {:?} per --restart", self.root);
            fs::remove_dir_all(&self.root)
                .with_context(|| format!("Failed to remove work directory {:?}", self.root))?;
        }

        if !resume && !restart && self.has_previous_state()? {
            bail!(
                "Work directory {:?} contains files from a previous run.\n\
                 Use --resume to continue that run, or --restart to start over.",
                self.root
            );
        }

        self.ensure()
    }

    fn has_previous_state(&self) -> Result<bool> {
        if !self.root.exists() {
            return Ok(false);
        }
        for dir in [self.schema_dir(), self.tables_done_dir(), self.cdc_dir()] {
            if dir.exists() && fs::read_dir(&dir)?.next().is_some() {
                return Ok(true);
            }
        }
        Ok(false)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn schema_dir(&self) -> PathBuf {
        self.root.join("schema")
    }

    pub fn pre_dump_path(&self) -> PathBuf {
        self.schema_dir().join("pre.dump")
    }

    pub fn post_dump_path(&self) -> PathBuf {
        self.schema_dir().join("post.dump")
    }

    pub fn pre_list_path(&self) -> PathBuf {
        self.schema_dir().join("pre.list")
    }

    pub fn post_list_path(&self) -> PathBuf {
        self.schema_dir().join("post.list")
    }

    fn tables_done_dir(&self) -> PathBuf {
        self.root.join("objects").join("tables")
    }

    fn indexes_done_dir(&self) -> PathBuf {
        self.root.join("objects").join("indexes")
    }

    pub fn cdc_dir(&self) -> PathBuf {
        self.root.join("cdc")
    }

    pub fn slot_path(&self) -> PathBuf {
        self.root.join("slot")
    }

    pub fn origin_path(&self) -> PathBuf {
        self.root.join("origin")
    }

    pub fn pid_path(&self) -> PathBuf {
        self.root.join("run.pid")
    }

    fn marker_path(&self, key: DoneKey) -> PathBuf {
        match key {
            DoneKey::PreDataDump => self.schema_dir().join("pre-data-dump.done"),
            DoneKey::PostDataDump => self.schema_dir().join("post-data-dump.done"),
            DoneKey::PreDataRestore => self.schema_dir().join("pre-data-restore.done"),
            DoneKey::PostDataRestore => self.schema_dir().join("post-data-restore.done"),
            DoneKey::Table(oid) => self.tables_done_dir().join(format!("{}.done", oid)),
            DoneKey::Index(oid) => self.indexes_done_dir().join(format!("{}.done", oid)),
        }
    }

    /// Whether the unit of work behind `key` already completed.
    pub fn is_done(&self, key: DoneKey) -> bool {
        self.marker_path(key).exists()
    }

    /// Record that the unit of work behind `key` completed.
    ///
    /// Atomic with respect to crashes: the marker is created under a
    /// temporary name, fsynced, then renamed into place, so a partial file
    /// never counts as done. Callers guarantee at-most-one writer per key.
    pub fn mark_done(&self, key: DoneKey) -> Result<()> {
        let path = self.marker_path(key);
        durable_create(&path)
            .with_context(|| format!("Failed to write the tracking file {:?}", path))
    }

    /// Persist the replication slot descriptor.
    pub fn save_slot(&self, slot: &SlotDescriptor) -> Result<()> {
        let contents =
            serde_json::to_string_pretty(slot).context("Failed to serialize slot descriptor")?;
        fs::write(self.slot_path(), contents)
            .with_context(|| format!("Failed to write {:?}", self.slot_path()))
    }

    /// Load the replication slot descriptor from a previous run, if any.
    pub fn load_slot(&self) -> Result<Option<SlotDescriptor>> {
        let path = self.slot_path();
        if !path.exists() {
            return Ok(None);
        }
        let contents =
            fs::read_to_string(&path).with_context(|| format!("Failed to read {:?}", path))?;
        let slot = serde_json::from_str(&contents)
            .with_context(|| format!("Failed to parse slot descriptor {:?}", path))?;
        Ok(Some(slot))
    }

    /// Persist the replication origin name used on the target.
    pub fn save_origin(&self, origin: &str) -> Result<()> {
        fs::write(self.origin_path(), origin)
            .with_context(|| format!("Failed to write {:?}", self.origin_path()))
    }

    pub fn load_origin(&self) -> Result<Option<String>> {
        let path = self.origin_path();
        if !path.exists() {
            return Ok(None);
        }
        let origin =
            fs::read_to_string(&path).with_context(|| format!("Failed to read {:?}", path))?;
        Ok(Some(origin.trim().to_string()))
    }

    /// Take the PID file, refusing to start when another live run holds it.
    pub fn create_pid_file(&self) -> Result<()> {
        let path = self.pid_path();

        if let Some(pid) = read_pid(&path)? {
            if is_process_running(pid) {
                bail!(
                    "Another run (pid {}) is already using the work directory {:?}",
                    pid,
                    self.root
                );
            }
            tracing::warn!("Removing stale PID file for dead process {}", pid);
            fs::remove_file(&path)
                .with_context(|| format!("Failed to remove stale PID file {:?}", path))?;
        }

        fs::write(&path, std::process::id().to_string())
            .with_context(|| format!("Failed to write PID file {:?}", path))
    }

    pub fn remove_pid_file(&self) -> Result<()> {
        let path = self.pid_path();
        if path.exists() {
            fs::remove_file(&path)
                .with_context(|| format!("Failed to remove PID file {:?}", path))?;
        }
        Ok(())
    }

    /// Remove the streaming subtree and slot/origin descriptors.
    pub fn cleanup_stream_state(&self) -> Result<()> {
        if self.cdc_dir().exists() {
            fs::remove_dir_all(self.cdc_dir())
                .with_context(|| format!("Failed to remove {:?}", self.cdc_dir()))?;
        }
        for path in [self.slot_path(), self.origin_path()] {
            if path.exists() {
                fs::remove_file(&path).with_context(|| format!("Failed to remove {:?}", path))?;
            }
        }
        Ok(())
    }
}

/// Create an empty file durably: write a temporary sibling, fsync it, then
/// rename into place.
fn durable_create(path: &Path) -> Result<()> {
    let parent = path
        .parent()
        .context("Marker path has no parent directory")?;
    fs::create_dir_all(parent)?;

    let tmp = parent.join(format!(
        ".{}.tmp-{:08x}",
        path.file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("marker"),
        rand::random::<u32>()
    ));

    let file = OpenOptions::new()
        .create(true)
        .truncate(true)
        .write(true)
        .open(&tmp)?;
    file.sync_all()?;
    drop(file);

    fs::rename(&tmp, path)?;

    // fsync the directory so the rename itself survives a crash
    if let Ok(dir) = File::open(parent) {
        let _ = dir.sync_all();
    }

    Ok(())
}

fn read_pid(path: &Path) -> Result<Option<i32>> {
    if !path.exists() {
        return Ok(None);
    }
    let content =
        fs::read_to_string(path).with_context(|| format!("Failed to read PID file {:?}", path))?;
    let pid: i32 = content
        .trim()
        .parse()
        .with_context(|| format!("Invalid PID in file: {}", content.trim()))?;
    Ok(Some(pid))
}

#[cfg(unix)]
fn is_process_running(pid: i32) -> bool {
    // signal 0 checks existence without delivering anything
    unsafe { libc::kill(pid, 0) == 0 }
}

#[cfg(not(unix))]
fn is_process_running(_pid: i32) -> bool {
    false
}

/// Write `contents` to `path` through a fsynced temporary file and rename.
pub fn durable_write(path: &Path, contents: &[u8]) -> Result<()> {
    let parent = path.parent().context("Path has no parent directory")?;
    let tmp = parent.join(format!(
        ".{}.tmp-{:08x}",
        path.file_name().and_then(|n| n.to_str()).unwrap_or("file"),
        rand::random::<u32>()
    ));

    let mut file = OpenOptions::new()
        .create(true)
        .truncate(true)
        .write(true)
        .open(&tmp)
        .with_context(|| format!("Failed to create {:?}", tmp))?;
    file.write_all(contents)
        .with_context(|| format!("Failed to write {:?}", tmp))?;
    file.sync_all()
        .with_context(|| format!("Failed to fsync {:?}", tmp))?;
    drop(file);

    fs::rename(&tmp, path).with_context(|| format!("Failed to rename {:?} to {:?}", tmp, path))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn workdir() -> (TempDir, WorkDir) {
        let tmp = TempDir::new().unwrap();
        let wd = WorkDir {
            root: tmp.path().join("run"),
        };
        wd.ensure().unwrap();
        (tmp, wd)
    }

    #[test]
    fn test_markers_roundtrip() {
        let (_tmp, wd) = workdir();

        assert!(!wd.is_done(DoneKey::PreDataDump));
        wd.mark_done(DoneKey::PreDataDump).unwrap();
        assert!(wd.is_done(DoneKey::PreDataDump));

        assert!(!wd.is_done(DoneKey::Table(16385)));
        wd.mark_done(DoneKey::Table(16385)).unwrap();
        assert!(wd.is_done(DoneKey::Table(16385)));
        assert!(!wd.is_done(DoneKey::Table(16386)));

        wd.mark_done(DoneKey::Index(16400)).unwrap();
        assert!(wd.is_done(DoneKey::Index(16400)));
    }

    #[test]
    fn test_marker_is_zero_bytes_and_leaves_no_temp() {
        let (_tmp, wd) = workdir();
        wd.mark_done(DoneKey::Table(1)).unwrap();

        let path = wd.marker_path(DoneKey::Table(1));
        assert_eq!(fs::metadata(&path).unwrap().len(), 0);

        // no temporary file left behind
        let leftovers: Vec<_> = fs::read_dir(path.parent().unwrap())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().contains(".tmp-"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn test_mark_done_idempotent() {
        let (_tmp, wd) = workdir();
        wd.mark_done(DoneKey::PostDataRestore).unwrap();
        wd.mark_done(DoneKey::PostDataRestore).unwrap();
        assert!(wd.is_done(DoneKey::PostDataRestore));
    }

    #[test]
    fn test_prepare_refuses_previous_state_without_resume() {
        let (_tmp, wd) = workdir();
        wd.mark_done(DoneKey::Table(1)).unwrap();

        assert!(wd.prepare(false, false).is_err());
        assert!(wd.prepare(true, false).is_ok());
        assert!(wd.is_done(DoneKey::Table(1)));
    }

    #[test]
    fn test_prepare_restart_wipes_state() {
        let (_tmp, wd) = workdir();
        wd.mark_done(DoneKey::Table(1)).unwrap();

        wd.prepare(false, true).unwrap();
        assert!(!wd.is_done(DoneKey::Table(1)));
    }

    #[test]
    fn test_slot_descriptor_roundtrip() {
        let (_tmp, wd) = workdir();
        let slot = SlotDescriptor {
            slot_name: "pgcopydb".to_string(),
            plugin: "wal2json".to_string(),
            consistent_lsn: "0/24E3C48".parse().unwrap(),
            snapshot_name: Some("00000003-0000001B-1".to_string()),
            created_at: chrono::Utc::now(),
        };

        assert!(wd.load_slot().unwrap().is_none());
        wd.save_slot(&slot).unwrap();
        assert_eq!(wd.load_slot().unwrap().unwrap(), slot);
    }

    #[test]
    fn test_origin_roundtrip() {
        let (_tmp, wd) = workdir();
        assert!(wd.load_origin().unwrap().is_none());
        wd.save_origin("pgcopydb").unwrap();
        assert_eq!(wd.load_origin().unwrap().unwrap(), "pgcopydb");
    }

    #[test]
    fn test_pid_file() {
        let (_tmp, wd) = workdir();
        wd.create_pid_file().unwrap();
        // our own pid is alive, so a second run must refuse
        assert!(wd.create_pid_file().is_err());
        wd.remove_pid_file().unwrap();
        assert!(wd.create_pid_file().is_ok());
    }

    #[test]
    fn test_for_target_is_deterministic() {
        let a = WorkDir::for_target("postgresql://user@host/db", None).unwrap();
        let b = WorkDir::for_target("postgresql://user@host/db", None).unwrap();
        let c = WorkDir::for_target("postgresql://user@host/other", None).unwrap();
        assert_eq!(a.root(), b.root());
        assert_ne!(a.root(), c.root());
    }
}
