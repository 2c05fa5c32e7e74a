// ABOUTME: Shared types of the receive/transform/apply streaming pipeline
// ABOUTME: Logical messages, plugin selection, and WAL-segment file naming

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::lsn::Lsn;

pub mod apply;
pub mod protocol;
pub mod receive;
pub mod transform;

/// Logical decoding output plugin on the source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Plugin {
    Wal2Json,
    TestDecoding,
    PgOutput,
}

impl Plugin {
    pub fn as_str(self) -> &'static str {
        match self {
            Plugin::Wal2Json => "wal2json",
            Plugin::TestDecoding => "test_decoding",
            Plugin::PgOutput => "pgoutput",
        }
    }
}

impl FromStr for Plugin {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "wal2json" => Ok(Plugin::Wal2Json),
            "test_decoding" => Ok(Plugin::TestDecoding),
            "pgoutput" => Ok(Plugin::PgOutput),
            other => bail!(
                "Unknown logical decoding plugin \"{}\" \
                 (expected wal2json, test_decoding, or pgoutput)",
                other
            ),
        }
    }
}

/// The verb of one logical message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamAction {
    Begin,
    Commit,
    Insert,
    Update,
    Delete,
    Truncate,
    Message,
    Keepalive,
    Switch,
    Endpos,
}

/// One record of the streaming pipeline, as persisted in the JSON-line
/// segment files. The `payload` carries the plugin-specific change body for
/// DML actions and is absent on protocol-level actions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogicalMessage {
    pub action: StreamAction,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub xid: Option<u32>,
    pub lsn: Lsn,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub commit_lsn: Option<Lsn>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
}

impl LogicalMessage {
    pub fn control(action: StreamAction, lsn: Lsn) -> LogicalMessage {
        LogicalMessage {
            action,
            xid: None,
            lsn,
            commit_lsn: None,
            timestamp: None,
            payload: None,
        }
    }
}

/// Configuration shared by the three streaming stages.
#[derive(Debug, Clone)]
pub struct StreamSpecs {
    pub source_uri: String,
    pub target_uri: String,
    pub slot_name: String,
    pub plugin: Plugin,
    pub origin: String,
    pub endpos: Lsn,
    pub cdc_dir: PathBuf,
    pub wal_segment_size: u64,
    pub timeline: u32,
}

/// Path of a JSON segment file for the WAL segment containing `lsn`.
pub fn segment_json_path(specs: &StreamSpecs, lsn: Lsn) -> PathBuf {
    specs.cdc_dir.join(format!(
        "{}.json",
        lsn.segment_file_name(specs.timeline, specs.wal_segment_size)
    ))
}

/// A `.json` segment still being written carries this suffix until the
/// WAL-segment switch renames it to its final name.
pub fn partial_path(final_path: &Path) -> PathBuf {
    let mut name = final_path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    name.push_str(".partial");
    final_path.with_file_name(name)
}

/// SQL script produced by the transformer for one JSON segment.
pub fn segment_sql_path(json_path: &Path) -> PathBuf {
    json_path.with_extension("sql")
}

/// List the completed `.json` segments of the streaming subtree, sorted by
/// segment name, which sorts by WAL order.
pub fn list_complete_segments(cdc_dir: &Path) -> Result<Vec<PathBuf>> {
    let mut segments = Vec::new();

    if !cdc_dir.exists() {
        return Ok(segments);
    }

    for entry in std::fs::read_dir(cdc_dir)
        .with_context(|| format!("Failed to read the streaming directory {:?}", cdc_dir))?
    {
        let path = entry?.path();
        if path.extension().and_then(|e| e.to_str()) == Some("json") {
            segments.push(path);
        }
    }

    segments.sort();
    Ok(segments)
}

/// Remove partial (un-renamed) segment files left by a previous run. The
/// source re-sends their contents.
pub fn discard_partial_segments(cdc_dir: &Path) -> Result<usize> {
    let mut discarded = 0;

    if !cdc_dir.exists() {
        return Ok(0);
    }

    for entry in std::fs::read_dir(cdc_dir)
        .with_context(|| format!("Failed to read the streaming directory {:?}", cdc_dir))?
    {
        let path = entry?.path();
        if path
            .file_name()
            .and_then(|n| n.to_str())
            .map(|n| n.ends_with(".partial"))
            .unwrap_or(false)
        {
            tracing::warn!("Discarding partial segment {:?}", path);
            std::fs::remove_file(&path)
                .with_context(|| format!("Failed to remove {:?}", path))?;
            discarded += 1;
        }
    }

    Ok(discarded)
}

/// Find where to resume receiving after a restart: the last commit LSN
/// recorded in the highest complete segment, if any.
pub fn last_recorded_commit(cdc_dir: &Path) -> Result<Option<Lsn>> {
    let segments = list_complete_segments(cdc_dir)?;
    let Some(last) = segments.last() else {
        return Ok(None);
    };

    let contents = std::fs::read_to_string(last)
        .with_context(|| format!("Failed to read segment {:?}", last))?;

    let mut last_commit = None;
    for line in contents.lines() {
        if line.trim().is_empty() {
            continue;
        }
        let message: LogicalMessage = serde_json::from_str(line)
            .with_context(|| format!("Invalid JSON line in segment {:?}", last))?;
        if message.action == StreamAction::Commit {
            last_commit = Some(message.lsn);
        }
    }

    Ok(last_commit)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plugin_from_str() {
        assert_eq!("wal2json".parse::<Plugin>().unwrap(), Plugin::Wal2Json);
        assert_eq!(
            "test_decoding".parse::<Plugin>().unwrap(),
            Plugin::TestDecoding
        );
        assert_eq!("pgoutput".parse::<Plugin>().unwrap(), Plugin::PgOutput);
        assert!("decoderbufs".parse::<Plugin>().is_err());
    }

    #[test]
    fn test_logical_message_json_shape() {
        let message = LogicalMessage {
            action: StreamAction::Commit,
            xid: Some(505),
            lsn: "0/24E3C48".parse().unwrap(),
            commit_lsn: None,
            timestamp: Some("2026-07-14 09:21:04.123456+00".to_string()),
            payload: None,
        };

        let line = serde_json::to_string(&message).unwrap();
        assert!(line.contains("\"action\":\"commit\""));
        assert!(line.contains("\"lsn\":\"0/24E3C48\""));
        assert!(!line.contains("payload"));

        let back: LogicalMessage = serde_json::from_str(&line).unwrap();
        assert_eq!(back.action, StreamAction::Commit);
        assert_eq!(back.xid, Some(505));
    }

    #[test]
    fn test_partial_path() {
        let path = PathBuf::from("/x/cdc/000000010000000000000002.json");
        assert_eq!(
            partial_path(&path),
            PathBuf::from("/x/cdc/000000010000000000000002.json.partial")
        );
    }

    #[test]
    fn test_segment_sql_path() {
        let path = PathBuf::from("/x/cdc/000000010000000000000002.json");
        assert_eq!(
            segment_sql_path(&path),
            PathBuf::from("/x/cdc/000000010000000000000002.sql")
        );
    }

    #[test]
    fn test_segment_listing_and_partial_discard() {
        let tmp = tempfile::TempDir::new().unwrap();
        let cdc = tmp.path();

        std::fs::write(cdc.join("000000010000000000000003.json"), "").unwrap();
        std::fs::write(cdc.join("000000010000000000000002.json"), "").unwrap();
        std::fs::write(cdc.join("000000010000000000000004.json.partial"), "").unwrap();
        std::fs::write(cdc.join("000000010000000000000002.sql"), "").unwrap();

        let segments = list_complete_segments(cdc).unwrap();
        let names: Vec<String> = segments
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(
            names,
            vec![
                "000000010000000000000002.json",
                "000000010000000000000003.json"
            ]
        );

        assert_eq!(discard_partial_segments(cdc).unwrap(), 1);
        assert!(!cdc.join("000000010000000000000004.json.partial").exists());
    }

    #[test]
    fn test_last_recorded_commit() {
        let tmp = tempfile::TempDir::new().unwrap();
        let cdc = tmp.path();

        let lines = [
            serde_json::to_string(&LogicalMessage {
                action: StreamAction::Begin,
                xid: Some(1),
                lsn: "0/1000".parse().unwrap(),
                commit_lsn: Some("0/1100".parse().unwrap()),
                timestamp: None,
                payload: None,
            })
            .unwrap(),
            serde_json::to_string(&LogicalMessage {
                action: StreamAction::Commit,
                xid: Some(1),
                lsn: "0/1100".parse().unwrap(),
                commit_lsn: None,
                timestamp: None,
                payload: None,
            })
            .unwrap(),
        ];
        std::fs::write(
            cdc.join("000000010000000000000002.json"),
            lines.join("\n") + "\n",
        )
        .unwrap();

        let resume = last_recorded_commit(cdc).unwrap().unwrap();
        assert_eq!(resume.to_string(), "0/1100");
    }
}
