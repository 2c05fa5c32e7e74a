// ABOUTME: The pgcopydb.sentinel control row on the source database
// ABOUTME: Coordinates startpos/endpos/apply and replay progress between processes

use anyhow::{Context, Result};
use tokio_postgres::{Client, Row};

use crate::lsn::Lsn;

/// The single control row shared by the receiver and the applier.
///
/// Invariants maintained by the writers: `startpos <= write_lsn <= flush_lsn
/// <= replay_lsn`, and `replay_lsn <= endpos` whenever `endpos` is set.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Sentinel {
    pub startpos: Lsn,
    pub endpos: Lsn,
    pub apply: bool,
    pub write_lsn: Lsn,
    pub flush_lsn: Lsn,
    pub replay_lsn: Lsn,
}

const SENTINEL_COLUMNS: &str =
    "startpos::text, endpos::text, apply, write_lsn::text, flush_lsn::text, replay_lsn::text";

fn parse_row(row: &Row) -> Result<Sentinel> {
    let parse = |idx: usize| -> Result<Lsn> {
        let text: Option<String> = row.get(idx);
        match text {
            Some(text) => text.parse(),
            None => Ok(Lsn::INVALID),
        }
    };

    Ok(Sentinel {
        startpos: parse(0)?,
        endpos: parse(1)?,
        apply: row.get(2),
        write_lsn: parse(3)?,
        flush_lsn: parse(4)?,
        replay_lsn: parse(5)?,
    })
}

/// Create the sentinel schema and row, setting startpos and endpos.
///
/// Idempotent: an existing row is updated in place, so a resumed run keeps
/// its progress columns.
pub async fn setup(client: &Client, startpos: Lsn, endpos: Lsn) -> Result<Sentinel> {
    client
        .batch_execute(
            "CREATE SCHEMA IF NOT EXISTS pgcopydb;
             CREATE TABLE IF NOT EXISTS pgcopydb.sentinel (
                 startpos pg_lsn,
                 endpos pg_lsn,
                 apply bool,
                 write_lsn pg_lsn,
                 flush_lsn pg_lsn,
                 replay_lsn pg_lsn
             )",
        )
        .await
        .context("Failed to create the pgcopydb.sentinel table")?;

    let existing = client
        .query_opt("SELECT count(*) > 0 FROM pgcopydb.sentinel", &[])
        .await
        .context("Failed to read pgcopydb.sentinel")?
        .map(|row| row.get::<_, bool>(0))
        .unwrap_or(false);

    let row = if existing {
        client
            .query_one(
                &format!(
                    "UPDATE pgcopydb.sentinel
                        SET startpos = $1::pg_lsn, endpos = $2::pg_lsn
                  RETURNING {}",
                    SENTINEL_COLUMNS
                ),
                &[&startpos.to_string(), &endpos.to_string()],
            )
            .await
            .context("Failed to update pgcopydb.sentinel")?
    } else {
        client
            .query_one(
                &format!(
                    "INSERT INTO pgcopydb.sentinel
                         (startpos, endpos, apply, write_lsn, flush_lsn, replay_lsn)
                  VALUES ($1::pg_lsn, $2::pg_lsn, false, '0/0', '0/0', '0/0')
               RETURNING {}",
                    SENTINEL_COLUMNS
                ),
                &[&startpos.to_string(), &endpos.to_string()],
            )
            .await
            .context("Failed to insert the pgcopydb.sentinel row")?
    };

    parse_row(&row)
}

/// Read the current sentinel row.
pub async fn get(client: &Client) -> Result<Sentinel> {
    let row = client
        .query_one(
            &format!("SELECT {} FROM pgcopydb.sentinel", SENTINEL_COLUMNS),
            &[],
        )
        .await
        .context("Failed to read pgcopydb.sentinel; was `follow` set up on this source?")?;
    parse_row(&row)
}

/// Flip the apply switch, enabling or pausing the applier.
pub async fn update_apply(client: &Client, apply: bool) -> Result<Sentinel> {
    let row = client
        .query_one(
            &format!(
                "UPDATE pgcopydb.sentinel SET apply = $1 RETURNING {}",
                SENTINEL_COLUMNS
            ),
            &[&apply],
        )
        .await
        .context("Failed to update pgcopydb.sentinel apply")?;
    parse_row(&row)
}

/// Move the cut-over position.
pub async fn update_endpos(client: &Client, endpos: Lsn) -> Result<Sentinel> {
    let row = client
        .query_one(
            &format!(
                "UPDATE pgcopydb.sentinel SET endpos = $1::pg_lsn RETURNING {}",
                SENTINEL_COLUMNS
            ),
            &[&endpos.to_string()],
        )
        .await
        .context("Failed to update pgcopydb.sentinel endpos")?;
    parse_row(&row)
}

/// Record replay progress from the applier.
pub async fn update_replay(client: &Client, replay_lsn: Lsn) -> Result<Sentinel> {
    let row = client
        .query_one(
            &format!(
                "UPDATE pgcopydb.sentinel SET replay_lsn = $1::pg_lsn RETURNING {}",
                SENTINEL_COLUMNS
            ),
            &[&replay_lsn.to_string()],
        )
        .await
        .context("Failed to update pgcopydb.sentinel replay_lsn")?;
    parse_row(&row)
}

/// Record receive progress from the stream receiver.
pub async fn update_received(client: &Client, write_lsn: Lsn, flush_lsn: Lsn) -> Result<Sentinel> {
    let row = client
        .query_one(
            &format!(
                "UPDATE pgcopydb.sentinel
                    SET write_lsn = $1::pg_lsn, flush_lsn = $2::pg_lsn
              RETURNING {}",
                SENTINEL_COLUMNS
            ),
            &[&write_lsn.to_string(), &flush_lsn.to_string()],
        )
        .await
        .context("Failed to update pgcopydb.sentinel write/flush")?;
    parse_row(&row)
}

/// Drop the sentinel table, used by `stream cleanup`.
pub async fn teardown(client: &Client) -> Result<()> {
    client
        .batch_execute("DROP TABLE IF EXISTS pgcopydb.sentinel")
        .await
        .context("Failed to drop pgcopydb.sentinel")
}
