// ABOUTME: Consumes the logical decoding stream into JSON-line segment files
// ABOUTME: Acknowledges progress with standby status updates, at most once per second

use anyhow::{bail, Context, Result};
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

use crate::lsn::Lsn;
use crate::pg;
use crate::sentinel;
use crate::stream::protocol::{parse_frame, standby_status_update, ReplicationFrame};
use crate::stream::{
    last_recorded_commit, partial_path, segment_json_path, LogicalMessage, Plugin, StreamAction,
    StreamSpecs,
};

/// Standby status updates go out at most once per second.
const STATUS_INTERVAL: Duration = Duration::from_secs(1);

/// Where to restart receiving: the furthest of the slot's consistent point,
/// the flushed position acknowledged in the sentinel, and the last commit
/// recorded in a complete on-disk segment.
pub fn resume_position(
    consistent_lsn: Lsn,
    sentinel_flush: Lsn,
    specs: &StreamSpecs,
) -> Result<Lsn> {
    let on_disk = last_recorded_commit(&specs.cdc_dir)?.unwrap_or(Lsn::INVALID);
    Ok(consistent_lsn.max(sentinel_flush).max(on_disk))
}

/// Decode one XLogData payload into logical messages.
///
/// wal2json (format-version 2) emits one JSON document per change;
/// test_decoding emits text lines that we wrap with their raw body so the
/// transformer can parse the tuple syntax. An unknown payload shape is a
/// replication-protocol violation and fatal.
pub fn decode_payload(
    plugin: Plugin,
    wal_start: Lsn,
    payload: &[u8],
) -> Result<Vec<LogicalMessage>> {
    let text = std::str::from_utf8(payload).context("Logical message is not valid UTF-8")?;

    let mut messages = Vec::new();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match plugin {
            Plugin::Wal2Json => messages.push(decode_wal2json_line(wal_start, line)?),
            Plugin::TestDecoding => messages.push(decode_test_decoding_line(wal_start, line)?),
            Plugin::PgOutput => {
                bail!("The pgoutput plugin emits binary messages this receiver does not decode")
            }
        }
    }

    Ok(messages)
}

fn decode_wal2json_line(wal_start: Lsn, line: &str) -> Result<LogicalMessage> {
    let value: serde_json::Value = serde_json::from_str(line)
        .with_context(|| format!("Invalid wal2json message: {}", line))?;

    let action = match value.get("action").and_then(|a| a.as_str()) {
        Some("B") => StreamAction::Begin,
        Some("C") => StreamAction::Commit,
        Some("I") => StreamAction::Insert,
        Some("U") => StreamAction::Update,
        Some("D") => StreamAction::Delete,
        Some("T") => StreamAction::Truncate,
        Some("M") => StreamAction::Message,
        other => bail!(
            "Unexpected wal2json action {:?} in message: {}",
            other,
            line
        ),
    };

    let xid = value.get("xid").and_then(|x| x.as_u64()).map(|x| x as u32);
    let timestamp = value
        .get("timestamp")
        .and_then(|t| t.as_str())
        .map(|t| t.to_string());

    let payload = match action {
        StreamAction::Begin | StreamAction::Commit => None,
        _ => Some(value.clone()),
    };

    Ok(LogicalMessage {
        action,
        xid,
        lsn: wal_start,
        commit_lsn: None,
        timestamp,
        payload,
    })
}

fn decode_test_decoding_line(wal_start: Lsn, line: &str) -> Result<LogicalMessage> {
    let (action, xid) = if let Some(xid) = line.strip_prefix("BEGIN ") {
        (StreamAction::Begin, xid.trim().parse().ok())
    } else if let Some(rest) = line.strip_prefix("COMMIT ") {
        let xid = rest.split_whitespace().next().and_then(|x| x.parse().ok());
        (StreamAction::Commit, xid)
    } else if line.starts_with("table ") {
        let action = if line.contains(": INSERT:") {
            StreamAction::Insert
        } else if line.contains(": UPDATE:") {
            StreamAction::Update
        } else if line.contains(": DELETE:") {
            StreamAction::Delete
        } else {
            bail!("Unexpected test_decoding change line: {}", line);
        };
        (action, None)
    } else if line.starts_with("message:") {
        (StreamAction::Message, None)
    } else {
        bail!("Unexpected test_decoding line: {}", line);
    };

    let payload = match action {
        StreamAction::Begin | StreamAction::Commit => None,
        _ => Some(serde_json::json!({ "raw": line })),
    };

    Ok(LogicalMessage {
        action,
        xid,
        lsn: wal_start,
        commit_lsn: None,
        timestamp: None,
        payload,
    })
}

/// Writes JSON lines into per-WAL-segment files, renaming each segment to
/// its final name on switch so readers only ever see complete segments.
struct SegmentWriter {
    specs: StreamSpecs,
    current: Option<(u64, PathBuf, File)>,
    /// Last LSN written to the current (partial) segment.
    write_lsn: Lsn,
    /// Boundary below which everything is durably renamed.
    flush_lsn: Lsn,
}

impl SegmentWriter {
    fn new(specs: &StreamSpecs) -> SegmentWriter {
        SegmentWriter {
            specs: specs.clone(),
            current: None,
            write_lsn: Lsn::INVALID,
            flush_lsn: Lsn::INVALID,
        }
    }

    fn write_message(&mut self, message: &LogicalMessage) -> Result<()> {
        let seg_no = message.lsn.segment_number(self.specs.wal_segment_size);

        let switched = match &self.current {
            Some((current_seg, _, _)) => seg_no > *current_seg,
            None => false,
        };
        if switched {
            self.finalize_current()?;
        }

        if self.current.is_none() {
            let final_path = segment_json_path(&self.specs, message.lsn);
            let path = partial_path(&final_path);
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .with_context(|| format!("Failed to open segment {:?}", path))?;
            self.current = Some((seg_no, final_path, file));

            if switched {
                // sentinel line marking the WAL segment boundary
                let switch = LogicalMessage::control(StreamAction::Switch, message.lsn);
                self.append_line(&switch)?;
            }
        }

        self.append_line(message)?;
        self.write_lsn = self.write_lsn.max(message.lsn);
        Ok(())
    }

    fn append_line(&mut self, message: &LogicalMessage) -> Result<()> {
        let (_, final_path, file) = self
            .current
            .as_mut()
            .context("No open segment to append to")?;
        let line = serde_json::to_string(message).context("Failed to serialize a JSON line")?;
        writeln!(file, "{}", line)
            .with_context(|| format!("Failed to append to segment for {:?}", final_path))?;
        Ok(())
    }

    /// Flush, fsync, and rename the current partial segment to its final
    /// name. Advances the durable flush boundary to the last written
    /// position; never past it, so resuming re-reads rather than skips.
    fn finalize_current(&mut self) -> Result<()> {
        let Some((_seg_no, final_path, file)) = self.current.take() else {
            return Ok(());
        };

        file.sync_all()
            .with_context(|| format!("Failed to fsync segment for {:?}", final_path))?;
        drop(file);

        fs::rename(partial_path(&final_path), &final_path)
            .with_context(|| format!("Failed to finalize segment {:?}", final_path))?;

        self.flush_lsn = self.flush_lsn.max(self.write_lsn);

        tracing::debug!("Finalized segment {:?}", final_path);
        Ok(())
    }
}

/// The long-running receiver stage.
pub struct StreamReceiver {
    pub specs: StreamSpecs,
}

impl StreamReceiver {
    /// Receive from `start_lsn` until the sentinel endpos is reached or a
    /// stop is requested. Returns the last flushed position.
    ///
    /// When `live` is given, every message is also forwarded to the
    /// transformer for live replay.
    pub async fn run(
        &self,
        start_lsn: Lsn,
        stop: Arc<AtomicBool>,
        live: Option<mpsc::Sender<LogicalMessage>>,
    ) -> Result<Lsn> {
        let specs = &self.specs;

        let sentinel_client = pg::connect_with_retry(&specs.source_uri).await?;
        let repl_client = pg::connect_replication(&specs.source_uri).await?;

        let command = start_replication_command(specs, start_lsn);
        tracing::info!(
            "Starting replication from {} on slot \"{}\" (plugin {})",
            start_lsn,
            specs.slot_name,
            specs.plugin.as_str()
        );

        let duplex = repl_client
            .copy_both_simple::<Bytes>(&command)
            .await
            .context("START_REPLICATION failed")?;
        futures::pin_mut!(duplex);

        let mut writer = SegmentWriter::new(specs);
        let mut endpos = specs.endpos;
        let mut reached_endpos = false;
        let mut last_status = Instant::now();
        let mut status_due = false;

        loop {
            if stop.load(Ordering::Relaxed) {
                tracing::info!("Receiver stopping on request");
                break;
            }
            if reached_endpos {
                break;
            }

            // rate limit status updates to one per second, also while a
            // steady message flow keeps the timeout from firing
            if status_due || last_status.elapsed() >= STATUS_INTERVAL {
                let row = sentinel::update_received(
                    &sentinel_client,
                    writer.write_lsn,
                    writer.flush_lsn,
                )
                .await?;
                endpos = row.endpos;

                duplex
                    .send(standby_status_update(
                        writer.write_lsn,
                        writer.flush_lsn,
                        row.replay_lsn,
                        false,
                    ))
                    .await
                    .context("Failed to send a standby status update")?;

                last_status = Instant::now();
                status_due = false;

                if endpos.is_valid() && writer.write_lsn >= endpos {
                    tracing::info!(
                        "Sentinel endpos {} reached, stopping the receiver",
                        endpos
                    );
                    break;
                }
            }

            let frame = match tokio::time::timeout(STATUS_INTERVAL, duplex.next()).await {
                Ok(Some(frame)) => frame,
                Ok(None) => {
                    tracing::warn!("Replication stream closed by the source");
                    break;
                }
                Err(_elapsed) => {
                    status_due = true;
                    continue;
                }
            };
            let frame = parse_frame(frame.context("Replication stream error")?)?;

            match frame {
                ReplicationFrame::XLogData {
                    wal_start, payload, ..
                } => {
                    let messages = decode_payload(specs.plugin, wal_start, &payload)?;
                    for message in messages {
                        writer.write_message(&message)?;
                        if let Some(tx) = &live {
                            // the applier crashing closes the pipe; keep
                            // receiving and persisting anyway
                            let _ = tx.send(message.clone()).await;
                        }
                    }

                    if endpos.is_valid() && writer.write_lsn >= endpos {
                        let mark =
                            LogicalMessage::control(StreamAction::Endpos, writer.write_lsn);
                        writer.write_message(&mark)?;
                        if let Some(tx) = &live {
                            let _ = tx.send(mark).await;
                        }
                        tracing::info!(
                            "Received up to endpos {}, stopping the receiver",
                            endpos
                        );
                        reached_endpos = true;
                    }
                }
                ReplicationFrame::Keepalive {
                    wal_end,
                    reply_requested,
                    ..
                } => {
                    let keepalive = LogicalMessage::control(StreamAction::Keepalive, wal_end);
                    writer.write_message(&keepalive)?;
                    if let Some(tx) = &live {
                        let _ = tx.send(keepalive).await;
                    }

                    if reply_requested {
                        status_due = true;
                    }
                }
            }
        }

        writer.finalize_current()?;

        let _ = sentinel::update_received(&sentinel_client, writer.write_lsn, writer.flush_lsn)
            .await;

        Ok(writer.flush_lsn)
    }
}

fn start_replication_command(specs: &StreamSpecs, start_lsn: Lsn) -> String {
    let options = match specs.plugin {
        Plugin::Wal2Json => {
            "(\"format-version\" '2', \"include-xids\" 'true', \"include-timestamp\" 'true')"
        }
        Plugin::TestDecoding => "(\"include-xids\" 'on', \"include-timestamp\" 'on')",
        Plugin::PgOutput => "",
    };

    format!(
        "START_REPLICATION SLOT {} LOGICAL {} {}",
        pg::quote_ident(&specs.slot_name),
        start_lsn,
        options
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn specs(dir: &std::path::Path) -> StreamSpecs {
        StreamSpecs {
            source_uri: "postgresql://u@h/src".to_string(),
            target_uri: "postgresql://u@h/dst".to_string(),
            slot_name: "pgcopydb".to_string(),
            plugin: Plugin::Wal2Json,
            origin: "pgcopydb".to_string(),
            endpos: Lsn::INVALID,
            cdc_dir: dir.to_path_buf(),
            wal_segment_size: 16 * 1024 * 1024,
            timeline: 1,
        }
    }

    #[test]
    fn test_decode_wal2json_actions() {
        let lsn: Lsn = "0/1000".parse().unwrap();

        let begin = decode_payload(
            Plugin::Wal2Json,
            lsn,
            br#"{"action":"B","xid":505,"timestamp":"2026-07-14 09:21:04+00"}"#,
        )
        .unwrap();
        assert_eq!(begin.len(), 1);
        assert_eq!(begin[0].action, StreamAction::Begin);
        assert_eq!(begin[0].xid, Some(505));
        assert!(begin[0].payload.is_none());

        let insert = decode_payload(
            Plugin::Wal2Json,
            lsn,
            br#"{"action":"I","schema":"public","table":"t","columns":[{"name":"id","type":"integer","value":1}]}"#,
        )
        .unwrap();
        assert_eq!(insert[0].action, StreamAction::Insert);
        assert!(insert[0].payload.is_some());
    }

    #[test]
    fn test_decode_wal2json_rejects_unknown_action() {
        let lsn: Lsn = "0/1000".parse().unwrap();
        assert!(decode_payload(Plugin::Wal2Json, lsn, br#"{"action":"Z"}"#).is_err());
        assert!(decode_payload(Plugin::Wal2Json, lsn, b"not json").is_err());
    }

    #[test]
    fn test_decode_test_decoding_lines() {
        let lsn: Lsn = "0/1000".parse().unwrap();

        let begin = decode_payload(Plugin::TestDecoding, lsn, b"BEGIN 505").unwrap();
        assert_eq!(begin[0].action, StreamAction::Begin);
        assert_eq!(begin[0].xid, Some(505));

        let commit =
            decode_payload(Plugin::TestDecoding, lsn, b"COMMIT 505 (at 2026-07-14)").unwrap();
        assert_eq!(commit[0].action, StreamAction::Commit);
        assert_eq!(commit[0].xid, Some(505));

        let insert = decode_payload(
            Plugin::TestDecoding,
            lsn,
            b"table public.t: INSERT: id[integer]:1 v[text]:'a'",
        )
        .unwrap();
        assert_eq!(insert[0].action, StreamAction::Insert);

        assert!(decode_payload(Plugin::TestDecoding, lsn, b"gibberish").is_err());
    }

    #[test]
    fn test_segment_writer_switches_and_renames() {
        let tmp = tempfile::TempDir::new().unwrap();
        let specs = specs(tmp.path());
        let mut writer = SegmentWriter::new(&specs);

        // two messages in segment 2, then one in segment 3
        let m1 = LogicalMessage::control(StreamAction::Keepalive, "0/2000010".parse().unwrap());
        let m2 = LogicalMessage::control(StreamAction::Keepalive, "0/2000020".parse().unwrap());
        let m3 = LogicalMessage::control(StreamAction::Keepalive, "0/3000010".parse().unwrap());

        writer.write_message(&m1).unwrap();
        writer.write_message(&m2).unwrap();

        let partial = tmp.path().join("000000010000000000000002.json.partial");
        assert!(partial.exists());

        writer.write_message(&m3).unwrap();

        // the first segment got its final name on switch
        let finalized = tmp.path().join("000000010000000000000002.json");
        assert!(finalized.exists());
        assert!(!partial.exists());
        // flush never moves past what was actually written
        assert_eq!(writer.flush_lsn.to_string(), "0/2000020");

        // the next file opens with the SWITCH sentinel line
        writer.finalize_current().unwrap();
        let next = std::fs::read_to_string(tmp.path().join("000000010000000000000003.json"))
            .unwrap();
        let first: LogicalMessage = serde_json::from_str(next.lines().next().unwrap()).unwrap();
        assert_eq!(first.action, StreamAction::Switch);
    }

    #[test]
    fn test_resume_position_takes_the_furthest() {
        let tmp = tempfile::TempDir::new().unwrap();
        let specs = specs(tmp.path());

        let consistent: Lsn = "0/1000".parse().unwrap();
        let flushed: Lsn = "0/2000".parse().unwrap();
        assert_eq!(
            resume_position(consistent, flushed, &specs).unwrap(),
            flushed
        );
        assert_eq!(
            resume_position(flushed, consistent, &specs).unwrap(),
            flushed
        );
    }

    #[test]
    fn test_start_replication_command_shape() {
        let tmp = tempfile::TempDir::new().unwrap();
        let specs = specs(tmp.path());
        let cmd = start_replication_command(&specs, "0/24E3C48".parse().unwrap());
        assert!(cmd.starts_with("START_REPLICATION SLOT \"pgcopydb\" LOGICAL 0/24E3C48"));
        assert!(cmd.contains("\"format-version\" '2'"));
    }
}
