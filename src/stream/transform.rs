// ABOUTME: Turns JSON-line segments into replayable SQL scripts, one per transaction
// ABOUTME: Transactions are buffered until COMMIT so scripts never split a transaction

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tokio::sync::mpsc;

use crate::lsn::Lsn;
use crate::pg::{quote_ident, quote_literal};
use crate::stream::{segment_sql_path, LogicalMessage, StreamAction};
use crate::workdir::durable_write;

/// One line of a replayable SQL script.
///
/// BEGIN and COMMIT lines carry their metadata in a trailing JSON comment;
/// protocol-level progress lines are pure comments. Everything else is a SQL
/// statement to execute verbatim.
#[derive(Debug, Clone, PartialEq)]
pub enum ScriptLine {
    Begin { xid: Option<u32>, lsn: Lsn },
    Commit { lsn: Lsn },
    Keepalive { lsn: Lsn },
    Switch { lsn: Lsn },
    Endpos { lsn: Lsn },
    Sql(String),
}

#[derive(Debug, Serialize, Deserialize)]
struct LineMeta {
    #[serde(skip_serializing_if = "Option::is_none")]
    xid: Option<u32>,
    lsn: Lsn,
}

impl ScriptLine {
    pub fn render(&self) -> String {
        match self {
            ScriptLine::Begin { xid, lsn } => {
                let meta = LineMeta { xid: *xid, lsn: *lsn };
                format!("BEGIN; -- {}", serde_json::to_string(&meta).unwrap_or_default())
            }
            ScriptLine::Commit { lsn } => {
                let meta = LineMeta { xid: None, lsn: *lsn };
                format!("COMMIT; -- {}", serde_json::to_string(&meta).unwrap_or_default())
            }
            ScriptLine::Keepalive { lsn } => format!("-- KEEPALIVE {{\"lsn\":\"{}\"}}", lsn),
            ScriptLine::Switch { lsn } => format!("-- SWITCH {{\"lsn\":\"{}\"}}", lsn),
            ScriptLine::Endpos { lsn } => format!("-- ENDPOS {{\"lsn\":\"{}\"}}", lsn),
            ScriptLine::Sql(sql) => sql.clone(),
        }
    }

    pub fn parse(line: &str) -> Result<ScriptLine> {
        fn meta_of(line: &str) -> Result<LineMeta> {
            let json = line
                .split_once("-- ")
                .map(|(_, json)| json)
                .context("Script line misses its metadata comment")?;
            serde_json::from_str(json).context("Invalid script line metadata")
        }
        fn lsn_of(line: &str, marker: &str) -> Result<Lsn> {
            let json = line
                .strip_prefix(marker)
                .context("Script line misses its marker")?;
            let meta: LineMeta =
                serde_json::from_str(json.trim()).context("Invalid script line metadata")?;
            Ok(meta.lsn)
        }

        if line.starts_with("BEGIN; -- ") {
            let meta = meta_of(line)?;
            Ok(ScriptLine::Begin {
                xid: meta.xid,
                lsn: meta.lsn,
            })
        } else if line.starts_with("COMMIT; -- ") {
            let meta = meta_of(line)?;
            Ok(ScriptLine::Commit { lsn: meta.lsn })
        } else if line.starts_with("-- KEEPALIVE ") {
            Ok(ScriptLine::Keepalive {
                lsn: lsn_of(line, "-- KEEPALIVE ")?,
            })
        } else if line.starts_with("-- SWITCH ") {
            Ok(ScriptLine::Switch {
                lsn: lsn_of(line, "-- SWITCH ")?,
            })
        } else if line.starts_with("-- ENDPOS ") {
            Ok(ScriptLine::Endpos {
                lsn: lsn_of(line, "-- ENDPOS ")?,
            })
        } else {
            Ok(ScriptLine::Sql(line.to_string()))
        }
    }
}

/// A source transaction being buffered until its COMMIT is seen.
#[derive(Debug, Default)]
struct PendingTxn {
    xid: Option<u32>,
    timestamp: Option<String>,
    statements: Vec<String>,
}

/// Stateful converter from logical messages to script lines.
///
/// State survives across segment files so a transaction straddling a
/// segment boundary lands, whole, in the file holding its COMMIT.
#[derive(Debug, Default)]
pub struct TransformState {
    current: Option<PendingTxn>,
}

impl TransformState {
    pub fn new() -> TransformState {
        TransformState::default()
    }

    pub fn in_transaction(&self) -> bool {
        self.current.is_some()
    }

    /// Feed one logical message; returns the script lines ready to emit.
    pub fn transform_message(&mut self, message: &LogicalMessage) -> Result<Vec<ScriptLine>> {
        match message.action {
            StreamAction::Begin => {
                if self.current.is_some() {
                    bail!("BEGIN while a transaction is already open (xid {:?})", message.xid);
                }
                self.current = Some(PendingTxn {
                    xid: message.xid,
                    timestamp: message.timestamp.clone(),
                    statements: Vec::new(),
                });
                Ok(Vec::new())
            }

            StreamAction::Commit => {
                let Some(txn) = self.current.take() else {
                    bail!("COMMIT without a matching BEGIN (xid {:?})", message.xid);
                };

                let commit_lsn = message.lsn;
                let timestamp = message.timestamp.clone().or(txn.timestamp);

                let mut lines = Vec::with_capacity(txn.statements.len() + 3);
                lines.push(ScriptLine::Begin {
                    xid: txn.xid,
                    lsn: commit_lsn,
                });
                lines.extend(txn.statements.into_iter().map(ScriptLine::Sql));
                lines.push(ScriptLine::Sql(origin_setup_sql(commit_lsn, timestamp.as_deref())));
                lines.push(ScriptLine::Commit { lsn: commit_lsn });
                Ok(lines)
            }

            StreamAction::Insert
            | StreamAction::Update
            | StreamAction::Delete
            | StreamAction::Truncate
            | StreamAction::Message => {
                let sql = render_dml(message)?;
                match &mut self.current {
                    Some(txn) => {
                        txn.statements.push(sql);
                        Ok(Vec::new())
                    }
                    None => {
                        // decoding always wraps changes in BEGIN/COMMIT; a
                        // bare change means we joined mid-transaction
                        tracing::warn!(
                            "Skipping {:?} change outside any transaction at {}",
                            message.action,
                            message.lsn
                        );
                        Ok(Vec::new())
                    }
                }
            }

            StreamAction::Keepalive => Ok(vec![ScriptLine::Keepalive { lsn: message.lsn }]),
            StreamAction::Switch => Ok(vec![ScriptLine::Switch { lsn: message.lsn }]),
            StreamAction::Endpos => Ok(vec![ScriptLine::Endpos { lsn: message.lsn }]),
        }
    }
}

/// The target-side helper recording replay progress inside the transaction,
/// so data and origin advance atomically.
fn origin_setup_sql(commit_lsn: Lsn, timestamp: Option<&str>) -> String {
    match timestamp {
        Some(ts) => format!(
            "SELECT pg_replication_origin_xact_setup('{}', {});",
            commit_lsn,
            quote_literal(ts)
        ),
        None => format!(
            "SELECT pg_replication_origin_xact_setup('{}', now());",
            commit_lsn
        ),
    }
}

fn render_dml(message: &LogicalMessage) -> Result<String> {
    let payload = message
        .payload
        .as_ref()
        .with_context(|| format!("{:?} message carries no payload", message.action))?;

    if let Some(raw) = payload.get("raw").and_then(|r| r.as_str()) {
        return render_test_decoding(message.action, raw);
    }

    render_wal2json(message.action, payload)
}

fn render_wal2json(action: StreamAction, payload: &serde_json::Value) -> Result<String> {
    let table = || -> Result<String> {
        let schema = payload
            .get("schema")
            .and_then(|s| s.as_str())
            .context("wal2json change misses schema")?;
        let table = payload
            .get("table")
            .and_then(|t| t.as_str())
            .context("wal2json change misses table")?;
        Ok(format!("{}.{}", quote_ident(schema), quote_ident(table)))
    };

    match action {
        StreamAction::Insert => {
            let columns = payload
                .get("columns")
                .and_then(|c| c.as_array())
                .context("wal2json INSERT misses columns")?;
            let names: Vec<String> = columns
                .iter()
                .map(|c| column_name(c).map(quote_ident))
                .collect::<Result<_>>()?;
            let values: Vec<String> = columns.iter().map(column_value).collect::<Result<_>>()?;
            Ok(format!(
                "INSERT INTO {} ({}) VALUES ({});",
                table()?,
                names.join(", "),
                values.join(", ")
            ))
        }

        StreamAction::Update => {
            let columns = payload
                .get("columns")
                .and_then(|c| c.as_array())
                .context("wal2json UPDATE misses columns")?;
            let identity = payload
                .get("identity")
                .and_then(|i| i.as_array())
                .context("wal2json UPDATE misses identity; set REPLICA IDENTITY on the table")?;

            let sets: Vec<String> = columns
                .iter()
                .map(|c| Ok(format!("{} = {}", quote_ident(column_name(c)?), column_value(c)?)))
                .collect::<Result<_>>()?;
            let conds: Vec<String> = identity
                .iter()
                .map(|c| Ok(format!("{} = {}", quote_ident(column_name(c)?), column_value(c)?)))
                .collect::<Result<_>>()?;

            Ok(format!(
                "UPDATE {} SET {} WHERE {};",
                table()?,
                sets.join(", "),
                conds.join(" AND ")
            ))
        }

        StreamAction::Delete => {
            let identity = payload
                .get("identity")
                .and_then(|i| i.as_array())
                .context("wal2json DELETE misses identity; set REPLICA IDENTITY on the table")?;
            let conds: Vec<String> = identity
                .iter()
                .map(|c| Ok(format!("{} = {}", quote_ident(column_name(c)?), column_value(c)?)))
                .collect::<Result<_>>()?;
            Ok(format!("DELETE FROM {} WHERE {};", table()?, conds.join(" AND ")))
        }

        StreamAction::Truncate => Ok(format!("TRUNCATE ONLY {};", table()?)),

        StreamAction::Message => {
            let prefix = payload.get("prefix").and_then(|p| p.as_str()).unwrap_or("");
            let content = payload.get("content").and_then(|c| c.as_str()).unwrap_or("");
            let transactional = payload
                .get("transactional")
                .and_then(|t| t.as_bool())
                .unwrap_or(true);
            Ok(format!(
                "SELECT pg_logical_emit_message({}, {}, {});",
                transactional,
                quote_literal(prefix),
                quote_literal(content)
            ))
        }

        other => bail!("Not a DML action: {:?}", other),
    }
}

fn column_name(column: &serde_json::Value) -> Result<&str> {
    column
        .get("name")
        .and_then(|n| n.as_str())
        .context("wal2json column misses its name")
}

/// Render a wal2json column value as a SQL literal, keyed by the declared
/// column type so numerics and booleans stay unquoted.
fn column_value(column: &serde_json::Value) -> Result<String> {
    let value = column
        .get("value")
        .context("wal2json column misses its value")?;

    Ok(match value {
        serde_json::Value::Null => "NULL".to_string(),
        serde_json::Value::Bool(b) => b.to_string(),
        serde_json::Value::Number(n) => n.to_string(),
        serde_json::Value::String(s) => quote_literal(s),
        other => quote_literal(&other.to_string()),
    })
}

/// Render a test_decoding text change into SQL.
///
/// Handles the `col[type]:value` tuple syntax, including quoted values with
/// doubled-quote escapes.
fn render_test_decoding(action: StreamAction, raw: &str) -> Result<String> {
    let rest = raw
        .strip_prefix("table ")
        .with_context(|| format!("Unexpected test_decoding change: {}", raw))?;
    let (qualified, rest) = rest
        .split_once(':')
        .with_context(|| format!("Unexpected test_decoding change: {}", raw))?;
    let (schema, table) = qualified
        .trim()
        .split_once('.')
        .with_context(|| format!("Unqualified relation in test_decoding change: {}", raw))?;
    let table_sql = format!("{}.{}", quote_ident(schema), quote_ident(table));

    let rest = rest.trim();

    match action {
        StreamAction::Insert => {
            let tuple = rest
                .strip_prefix("INSERT:")
                .with_context(|| format!("Unexpected test_decoding INSERT: {}", raw))?;
            let columns = parse_test_decoding_tuple(tuple)?;
            let names: Vec<String> =
                columns.iter().map(|(n, _)| quote_ident(n)).collect();
            let values: Vec<String> = columns.into_iter().map(|(_, v)| v).collect();
            Ok(format!(
                "INSERT INTO {} ({}) VALUES ({});",
                table_sql,
                names.join(", "),
                values.join(", ")
            ))
        }

        StreamAction::Delete => {
            let tuple = rest
                .strip_prefix("DELETE:")
                .with_context(|| format!("Unexpected test_decoding DELETE: {}", raw))?;
            let columns = parse_test_decoding_tuple(tuple)?;
            if columns.is_empty() {
                bail!(
                    "test_decoding DELETE without key columns; \
                     set REPLICA IDENTITY on the table: {}",
                    raw
                );
            }
            let conds: Vec<String> = columns
                .into_iter()
                .map(|(n, v)| format!("{} = {}", quote_ident(&n), v))
                .collect();
            Ok(format!(
                "DELETE FROM {} WHERE {};",
                table_sql,
                conds.join(" AND ")
            ))
        }

        StreamAction::Update => {
            let tuple = rest
                .strip_prefix("UPDATE:")
                .with_context(|| format!("Unexpected test_decoding UPDATE: {}", raw))?;
            let tuple = tuple.trim();

            let (old, new) = match tuple.strip_prefix("old-key:") {
                Some(rest) => {
                    let (old, new) = rest
                        .split_once("new-tuple:")
                        .context("test_decoding UPDATE misses its new-tuple")?;
                    (Some(old), new)
                }
                None => (None, tuple),
            };

            let Some(old) = old else {
                bail!(
                    "test_decoding UPDATE without old-key columns; \
                     set REPLICA IDENTITY FULL on the table or use wal2json: {}",
                    raw
                );
            };

            let sets: Vec<String> = parse_test_decoding_tuple(new)?
                .into_iter()
                .map(|(n, v)| format!("{} = {}", quote_ident(&n), v))
                .collect();
            let conds: Vec<String> = parse_test_decoding_tuple(old)?
                .into_iter()
                .map(|(n, v)| format!("{} = {}", quote_ident(&n), v))
                .collect();

            Ok(format!(
                "UPDATE {} SET {} WHERE {};",
                table_sql,
                sets.join(", "),
                conds.join(" AND ")
            ))
        }

        other => bail!("Not a test_decoding DML action: {:?}", other),
    }
}

/// Parse `col[type]:value ...` pairs. Values are either bare tokens or
/// quoted strings with `''` escapes.
fn parse_test_decoding_tuple(tuple: &str) -> Result<Vec<(String, String)>> {
    let mut columns = Vec::new();
    let mut chars = tuple.trim().chars().peekable();

    while chars.peek().is_some() {
        // column name up to '['
        let mut name = String::new();
        for c in chars.by_ref() {
            if c == '[' {
                break;
            }
            name.push(c);
        }
        let name = name.trim().to_string();
        if name.is_empty() {
            break;
        }

        // type up to ']'
        let mut typ = String::new();
        for c in chars.by_ref() {
            if c == ']' {
                break;
            }
            typ.push(c);
        }

        match chars.next() {
            Some(':') => {}
            _ => bail!("Malformed test_decoding tuple near column \"{}\"", name),
        }

        // value: quoted or bare
        let value = if chars.peek() == Some(&'\'') {
            chars.next();
            let mut value = String::from("'");
            loop {
                match chars.next() {
                    Some('\'') => {
                        if chars.peek() == Some(&'\'') {
                            chars.next();
                            value.push_str("''");
                        } else {
                            value.push('\'');
                            break;
                        }
                    }
                    Some(c) => value.push(c),
                    None => bail!("Unterminated quoted value in test_decoding tuple"),
                }
            }
            value
        } else {
            let mut value = String::new();
            while let Some(&c) = chars.peek() {
                if c == ' ' {
                    break;
                }
                value.push(c);
                chars.next();
            }
            if value == "null" {
                "NULL".to_string()
            } else {
                value
            }
        };

        // skip the separating space
        while chars.peek() == Some(&' ') {
            chars.next();
        }

        columns.push((name, value));
    }

    Ok(columns)
}

/// Transform one complete `.json` segment into its `.sql` script.
///
/// `state` persists across calls so straddling transactions end up in the
/// segment holding their COMMIT.
pub fn transform_file(state: &mut TransformState, json_path: &Path) -> Result<()> {
    let sql_path = segment_sql_path(json_path);

    let contents = std::fs::read_to_string(json_path)
        .with_context(|| format!("Failed to read segment {:?}", json_path))?;

    let mut out = String::new();
    for line in contents.lines() {
        if line.trim().is_empty() {
            continue;
        }
        let message: LogicalMessage = serde_json::from_str(line)
            .with_context(|| format!("Invalid JSON line in segment {:?}", json_path))?;
        for script_line in state.transform_message(&message)? {
            out.push_str(&script_line.render());
            out.push('\n');
        }
    }

    durable_write(&sql_path, out.as_bytes())
        .with_context(|| format!("Failed to write SQL script {:?}", sql_path))?;

    tracing::debug!("Transformed {:?} into {:?}", json_path, sql_path);
    Ok(())
}

/// Live transformer stage: messages in, script lines out.
///
/// Runs at parallelism one, which is what preserves commit order.
pub async fn run_live(
    mut messages: mpsc::Receiver<LogicalMessage>,
    lines: mpsc::Sender<ScriptLine>,
) -> Result<()> {
    let mut state = TransformState::new();

    while let Some(message) = messages.recv().await {
        for line in state.transform_message(&message)? {
            if lines.send(line).await.is_err() {
                // applier went away; stop transforming
                return Ok(());
            }
        }
    }

    if state.in_transaction() {
        tracing::warn!("Transformer stopping with an unfinished transaction buffered");
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(action: StreamAction, lsn: &str, payload: Option<serde_json::Value>) -> LogicalMessage {
        LogicalMessage {
            action,
            xid: Some(505),
            lsn: lsn.parse().unwrap(),
            commit_lsn: None,
            timestamp: None,
            payload,
        }
    }

    #[test]
    fn test_script_line_roundtrip() {
        let lines = vec![
            ScriptLine::Begin {
                xid: Some(505),
                lsn: "0/1100".parse().unwrap(),
            },
            ScriptLine::Sql("INSERT INTO \"public\".\"t\" (\"id\") VALUES (1);".to_string()),
            ScriptLine::Commit {
                lsn: "0/1100".parse().unwrap(),
            },
            ScriptLine::Keepalive {
                lsn: "0/1200".parse().unwrap(),
            },
            ScriptLine::Switch {
                lsn: "0/2000000".parse().unwrap(),
            },
            ScriptLine::Endpos {
                lsn: "0/1300".parse().unwrap(),
            },
        ];

        for line in lines {
            let rendered = line.render();
            let parsed = ScriptLine::parse(&rendered).unwrap();
            assert_eq!(parsed, line, "roundtrip failed for {}", rendered);
        }
    }

    #[test]
    fn test_transaction_buffered_until_commit() {
        let mut state = TransformState::new();

        let out = state
            .transform_message(&msg(StreamAction::Begin, "0/1000", None))
            .unwrap();
        assert!(out.is_empty());
        assert!(state.in_transaction());

        let out = state
            .transform_message(&msg(
                StreamAction::Insert,
                "0/1010",
                Some(serde_json::json!({
                    "schema": "public", "table": "t",
                    "columns": [{"name": "id", "type": "integer", "value": 1}]
                })),
            ))
            .unwrap();
        assert!(out.is_empty());

        let out = state
            .transform_message(&msg(StreamAction::Commit, "0/1100", None))
            .unwrap();

        assert_eq!(
            out[0],
            ScriptLine::Begin {
                xid: Some(505),
                lsn: "0/1100".parse().unwrap()
            }
        );
        assert_eq!(
            out[1],
            ScriptLine::Sql(
                "INSERT INTO \"public\".\"t\" (\"id\") VALUES (1);".to_string()
            )
        );
        assert!(matches!(&out[2], ScriptLine::Sql(sql)
            if sql.contains("pg_replication_origin_xact_setup('0/1100'")));
        assert_eq!(
            out[3],
            ScriptLine::Commit {
                lsn: "0/1100".parse().unwrap()
            }
        );
        assert!(!state.in_transaction());
    }

    #[test]
    fn test_wal2json_update_and_delete() {
        let update = render_wal2json(
            StreamAction::Update,
            &serde_json::json!({
                "schema": "public", "table": "t",
                "columns": [
                    {"name": "id", "type": "integer", "value": 1},
                    {"name": "v", "type": "text", "value": "it's"}
                ],
                "identity": [{"name": "id", "type": "integer", "value": 1}]
            }),
        )
        .unwrap();
        assert_eq!(
            update,
            "UPDATE \"public\".\"t\" SET \"id\" = 1, \"v\" = 'it''s' WHERE \"id\" = 1;"
        );

        let delete = render_wal2json(
            StreamAction::Delete,
            &serde_json::json!({
                "schema": "public", "table": "t",
                "identity": [{"name": "id", "type": "integer", "value": 3}]
            }),
        )
        .unwrap();
        assert_eq!(delete, "DELETE FROM \"public\".\"t\" WHERE \"id\" = 3;");

        let truncate = render_wal2json(
            StreamAction::Truncate,
            &serde_json::json!({"schema": "public", "table": "t"}),
        )
        .unwrap();
        assert_eq!(truncate, "TRUNCATE ONLY \"public\".\"t\";");
    }

    #[test]
    fn test_wal2json_null_and_bool_values() {
        let insert = render_wal2json(
            StreamAction::Insert,
            &serde_json::json!({
                "schema": "public", "table": "t",
                "columns": [
                    {"name": "id", "type": "integer", "value": 1},
                    {"name": "ok", "type": "boolean", "value": true},
                    {"name": "note", "type": "text", "value": null}
                ]
            }),
        )
        .unwrap();
        assert_eq!(
            insert,
            "INSERT INTO \"public\".\"t\" (\"id\", \"ok\", \"note\") VALUES (1, true, NULL);"
        );
    }

    #[test]
    fn test_update_without_identity_is_an_error() {
        let result = render_wal2json(
            StreamAction::Update,
            &serde_json::json!({
                "schema": "public", "table": "t",
                "columns": [{"name": "id", "type": "integer", "value": 1}]
            }),
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_test_decoding_insert() {
        let sql = render_test_decoding(
            StreamAction::Insert,
            "table public.t: INSERT: id[integer]:1 v[text]:'a b''c'",
        )
        .unwrap();
        assert_eq!(
            sql,
            "INSERT INTO \"public\".\"t\" (\"id\", \"v\") VALUES (1, 'a b''c');"
        );
    }

    #[test]
    fn test_test_decoding_update_with_old_key() {
        let sql = render_test_decoding(
            StreamAction::Update,
            "table public.t: UPDATE: old-key: id[integer]:1 new-tuple: id[integer]:1 v[text]:'b'",
        )
        .unwrap();
        assert_eq!(
            sql,
            "UPDATE \"public\".\"t\" SET \"id\" = 1, \"v\" = 'b' WHERE \"id\" = 1;"
        );
    }

    #[test]
    fn test_test_decoding_update_without_old_key_is_an_error() {
        let result = render_test_decoding(
            StreamAction::Update,
            "table public.t: UPDATE: id[integer]:1 v[text]:'b'",
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_test_decoding_delete_and_null() {
        let sql = render_test_decoding(
            StreamAction::Delete,
            "table public.t: DELETE: id[integer]:7",
        )
        .unwrap();
        assert_eq!(sql, "DELETE FROM \"public\".\"t\" WHERE \"id\" = 7;");

        let columns = parse_test_decoding_tuple("id[integer]:1 note[text]:null").unwrap();
        assert_eq!(columns[1].1, "NULL");
    }

    #[test]
    fn test_transform_file_straddling_transaction() {
        let tmp = tempfile::TempDir::new().unwrap();
        let seg2 = tmp.path().join("000000010000000000000002.json");
        let seg3 = tmp.path().join("000000010000000000000003.json");

        let insert_payload = serde_json::json!({
            "schema": "public", "table": "t",
            "columns": [{"name": "id", "type": "integer", "value": 1}]
        });

        // BEGIN + INSERT in the first segment, COMMIT in the next
        let lines2 = [
            serde_json::to_string(&msg(StreamAction::Begin, "0/2000010", None)).unwrap(),
            serde_json::to_string(&msg(
                StreamAction::Insert,
                "0/2000020",
                Some(insert_payload),
            ))
            .unwrap(),
        ];
        std::fs::write(&seg2, lines2.join("\n") + "\n").unwrap();

        let lines3 = [
            serde_json::to_string(&msg(StreamAction::Commit, "0/3000010", None)).unwrap(),
        ];
        std::fs::write(&seg3, lines3.join("\n") + "\n").unwrap();

        let mut state = TransformState::new();
        transform_file(&mut state, &seg2).unwrap();
        transform_file(&mut state, &seg3).unwrap();

        let sql2 = std::fs::read_to_string(segment_sql_path(&seg2)).unwrap();
        let sql3 = std::fs::read_to_string(segment_sql_path(&seg3)).unwrap();

        // the whole transaction sits in the segment holding the COMMIT
        assert!(sql2.is_empty());
        assert!(sql3.contains("BEGIN;"));
        assert!(sql3.contains("INSERT INTO \"public\".\"t\""));
        assert!(sql3.contains("COMMIT;"));
    }
}
