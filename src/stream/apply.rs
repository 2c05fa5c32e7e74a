// ABOUTME: Replays transformed SQL on the target and advances the replication origin
// ABOUTME: Enforces the endpos cut-over and reports replay progress to the sentinel

use anyhow::{bail, Context, Result};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_postgres::error::SqlState;
use tokio_postgres::Client;

use crate::lsn::Lsn;
use crate::pg;
use crate::sentinel::{self, Sentinel};
use crate::stream::transform::ScriptLine;
use crate::stream::{list_complete_segments, segment_sql_path, StreamSpecs};

/// Progress updates to the sentinel are rate limited to one per second.
const SYNC_INTERVAL: Duration = Duration::from_secs(1);

/// The applier's state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyState {
    /// Waiting for `sentinel.apply` to become true.
    WaitingForSentinel,
    /// Allowed to apply, outside any transaction, nothing applied yet.
    Ready,
    /// Inside a replayed transaction.
    InTxn,
    /// Between transactions.
    Idle,
    /// Reached endpos or hit an unrecoverable error.
    Stopped,
}

/// What the applier did, reported back to the supervisor.
#[derive(Debug, Clone, Copy)]
pub struct ApplyOutcome {
    pub last_applied: Lsn,
    pub reached_endpos: bool,
}

struct ApplyContext {
    target: Client,
    sentinel_client: Arc<Client>,
    state: ApplyState,
    /// Origin progress at startup; transactions at or below are duplicates.
    previous_lsn: Lsn,
    /// Commit LSN of the last transaction applied by this run.
    last_applied: Lsn,
    /// Progress position including keepalives, drives the endpos check.
    progress_lsn: Lsn,
    endpos: Lsn,
    /// Commit LSN of the transaction currently being applied.
    current_commit: Option<Lsn>,
    /// True while skipping a duplicate transaction line by line.
    skipping: bool,
    in_flight: Option<JoinHandle<Result<Sentinel>>>,
    last_sync: Instant,
}

/// The applier stage. Consumes `.sql` scripts (file mode) and then,
/// optionally, a live stream of script lines; both flow through the same
/// state machine.
pub struct StreamApplier {
    pub specs: StreamSpecs,
}

impl StreamApplier {
    pub async fn run(
        &self,
        live: Option<mpsc::Receiver<ScriptLine>>,
        stop: Arc<AtomicBool>,
    ) -> Result<ApplyOutcome> {
        let specs = &self.specs;

        let target = pg::connect_with_retry(&specs.target_uri).await?;
        let sentinel_client = Arc::new(pg::connect_with_retry(&specs.source_uri).await?);

        let previous_lsn = setup_origin(&target, &specs.origin).await?;

        let mut ctx = ApplyContext {
            target,
            sentinel_client,
            state: ApplyState::WaitingForSentinel,
            previous_lsn,
            last_applied: previous_lsn,
            progress_lsn: previous_lsn,
            endpos: specs.endpos,
            current_commit: None,
            skipping: false,
            in_flight: None,
            last_sync: Instant::now() - SYNC_INTERVAL,
        };

        // WAITING_FOR_SENTINEL -> READY
        if !wait_for_sentinel(&mut ctx, &stop).await? {
            return Ok(ApplyOutcome {
                last_applied: ctx.last_applied,
                reached_endpos: true,
            });
        }

        if ctx.endpos.is_valid() && ctx.endpos <= ctx.previous_lsn {
            tracing::info!(
                "Current endpos {} was previously reached at {}",
                ctx.endpos,
                ctx.previous_lsn
            );
            let _ = final_sentinel_sync(&mut ctx).await;
            return Ok(ApplyOutcome {
                last_applied: ctx.last_applied,
                reached_endpos: true,
            });
        }

        tracing::info!(
            "Replaying changes from LSN {} {}",
            ctx.previous_lsn,
            if ctx.endpos.is_valid() {
                format!("up to endpos LSN {}", ctx.endpos)
            } else {
                String::new()
            }
        );

        let result = self.apply_all(&mut ctx, live, &stop).await;

        // one final synchronous sentinel update, also on error paths
        let sync_result = final_sentinel_sync(&mut ctx).await;
        result?;
        sync_result?;

        Ok(ApplyOutcome {
            last_applied: ctx.last_applied,
            reached_endpos: ctx.state == ApplyState::Stopped,
        })
    }

    async fn apply_all(
        &self,
        ctx: &mut ApplyContext,
        live: Option<mpsc::Receiver<ScriptLine>>,
        stop: &AtomicBool,
    ) -> Result<()> {
        // file mode first: catch up on scripts already on disk
        for json_path in list_complete_segments(&self.specs.cdc_dir)? {
            if ctx.state == ApplyState::Stopped || stop.load(Ordering::Relaxed) {
                return Ok(());
            }
            let sql_path = segment_sql_path(&json_path);
            if sql_path.exists() {
                apply_file(ctx, &sql_path, stop).await?;
            }
        }

        // then live-replay mode on the same state machine
        if let Some(mut lines) = live {
            while ctx.state != ApplyState::Stopped && !stop.load(Ordering::Relaxed) {
                let Some(line) = lines.recv().await else {
                    break;
                };
                apply_line(ctx, &line).await?;
            }
        }

        Ok(())
    }
}

/// Replay one `.sql` script. Safe to run twice: the origin marker advances
/// inside each transaction, so duplicates are skipped wholesale.
async fn apply_file(ctx: &mut ApplyContext, sql_path: &Path, stop: &AtomicBool) -> Result<()> {
    tracing::info!("Applying {:?}", sql_path);

    let contents = std::fs::read_to_string(sql_path)
        .with_context(|| format!("Failed to read SQL script {:?}", sql_path))?;

    for line in contents.lines() {
        if line.trim().is_empty() {
            continue;
        }
        // statement boundaries are the cooperative cancellation points
        if stop.load(Ordering::Relaxed) && ctx.state != ApplyState::InTxn {
            return Ok(());
        }
        if ctx.state == ApplyState::Stopped {
            return Ok(());
        }
        let line = ScriptLine::parse(line)?;
        apply_line(ctx, &line).await?;
    }

    Ok(())
}

/// How a BEGIN line is handled, given the origin progress and the cut-over
/// position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BeginDisposition {
    /// Commit LSN at or below the origin progress: a duplicate, skip it.
    Skip,
    /// Commit LSN past endpos: the cut-over point, stop before applying.
    Stop,
    /// Replay the transaction.
    Apply,
}

fn begin_disposition(commit_lsn: Lsn, previous_lsn: Lsn, endpos: Lsn) -> BeginDisposition {
    if commit_lsn <= previous_lsn {
        BeginDisposition::Skip
    } else if endpos.is_valid() && commit_lsn > endpos {
        BeginDisposition::Stop
    } else {
        BeginDisposition::Apply
    }
}

/// Drive the state machine with one script line.
async fn apply_line(ctx: &mut ApplyContext, line: &ScriptLine) -> Result<()> {
    match line {
        ScriptLine::Begin { lsn, xid } => {
            if ctx.state == ApplyState::InTxn {
                bail!("BEGIN while already in a transaction (commit {:?})", ctx.current_commit);
            }

            match begin_disposition(*lsn, ctx.previous_lsn, ctx.endpos) {
                BeginDisposition::Skip => {
                    // duplicate from a previous run or an overlapping catchup
                    tracing::debug!(
                        "Skipping already-applied transaction xid {:?} with commit LSN {}",
                        xid,
                        lsn
                    );
                    ctx.skipping = true;
                    ctx.state = ApplyState::InTxn;
                    ctx.current_commit = Some(*lsn);
                }
                BeginDisposition::Stop => {
                    // commits arrive in order: the previous commit was the
                    // greatest one at or below endpos, so the cut-over is here
                    tracing::info!(
                        "Transaction with commit LSN {} is past endpos {}, stopping",
                        lsn,
                        ctx.endpos
                    );
                    ctx.state = ApplyState::Stopped;
                }
                BeginDisposition::Apply => {
                    ctx.target
                        .batch_execute("BEGIN")
                        .await
                        .context("Failed to BEGIN on the target")?;
                    ctx.state = ApplyState::InTxn;
                    ctx.skipping = false;
                    ctx.current_commit = Some(*lsn);
                }
            }
        }

        ScriptLine::Commit { lsn } => {
            if ctx.state != ApplyState::InTxn {
                bail!("COMMIT outside any transaction at {}", lsn);
            }

            if !ctx.skipping {
                ctx.target
                    .batch_execute("COMMIT")
                    .await
                    .context("Failed to COMMIT on the target")?;
                ctx.last_applied = *lsn;
                ctx.previous_lsn = (*lsn).max(ctx.previous_lsn);
            }

            ctx.progress_lsn = (*lsn).max(ctx.progress_lsn);
            ctx.skipping = false;
            ctx.current_commit = None;
            ctx.state = ApplyState::Idle;

            maybe_report_progress(ctx).await?;

            if ctx.endpos.is_valid() && *lsn >= ctx.endpos {
                tracing::info!(
                    "Replay reached endpos {} at commit LSN {}, stopping",
                    ctx.endpos,
                    lsn
                );
                ctx.state = ApplyState::Stopped;
            }
        }

        ScriptLine::Sql(sql) => {
            if ctx.skipping {
                return Ok(());
            }
            if ctx.state != ApplyState::InTxn {
                tracing::warn!("Skipping SQL outside any transaction: {}", sql);
                return Ok(());
            }
            execute_statement(ctx, sql).await?;
        }

        ScriptLine::Keepalive { lsn } | ScriptLine::Endpos { lsn } => {
            if ctx.state != ApplyState::InTxn {
                ctx.progress_lsn = (*lsn).max(ctx.progress_lsn);
            }

            maybe_report_progress(ctx).await?;

            if ctx.endpos.is_valid()
                && ctx.state != ApplyState::InTxn
                && ctx.progress_lsn >= ctx.endpos
            {
                tracing::info!(
                    "Progress {} reached endpos {} with no transaction open, stopping",
                    ctx.progress_lsn,
                    ctx.endpos
                );
                ctx.state = ApplyState::Stopped;
            }
        }

        ScriptLine::Switch { .. } => {}
    }

    Ok(())
}

/// Execute one replayed statement, downgrading deterministic duplicate
/// errors on already-applied transactions into a wholesale skip.
async fn execute_statement(ctx: &mut ApplyContext, sql: &str) -> Result<()> {
    let Err(e) = ctx.target.batch_execute(sql).await else {
        return Ok(());
    };

    let deterministic_duplicate = matches!(
        e.code(),
        Some(&SqlState::UNIQUE_VIOLATION) | Some(&SqlState::CHECK_VIOLATION)
    );

    if deterministic_duplicate {
        if let Some(commit_lsn) = ctx.current_commit {
            // the failed statement aborted the transaction; roll back
            // before asking the target anything else
            ctx.target
                .batch_execute("ROLLBACK")
                .await
                .context("Failed to ROLLBACK after a replay error")?;

            let origin_progress = origin_progress(&ctx.target).await.unwrap_or(Lsn::INVALID);
            if commit_lsn <= origin_progress {
                tracing::warn!(
                    "Transaction with commit LSN {} already applied per origin progress {}, \
                     skipping it",
                    commit_lsn,
                    origin_progress
                );
                ctx.skipping = true;
                ctx.previous_lsn = commit_lsn.max(ctx.previous_lsn);
                return Ok(());
            }
        }
    }

    Err(e).with_context(|| format!("Failed to replay: {}", sql))
}

/// Send an asynchronous replay_lsn update, at most once per second, after
/// draining the previous in-flight update.
async fn maybe_report_progress(ctx: &mut ApplyContext) -> Result<()> {
    if let Some(handle) = ctx.in_flight.take() {
        if handle.is_finished() {
            let row = handle
                .await
                .context("Sentinel update task panicked")??;
            // the endpos may have moved while we were applying
            ctx.endpos = row.endpos;
        } else {
            // previous update still in flight; skip this progress point
            ctx.in_flight = Some(handle);
            return Ok(());
        }
    }

    if ctx.last_sync.elapsed() >= SYNC_INTERVAL {
        let client = Arc::clone(&ctx.sentinel_client);
        let lsn = ctx.last_applied;
        ctx.in_flight = Some(tokio::spawn(async move {
            sentinel::update_replay(&client, lsn).await
        }));
        ctx.last_sync = Instant::now();
    }

    Ok(())
}

/// Drain any in-flight update and send one final synchronous one. Mandatory
/// on every exit path.
async fn final_sentinel_sync(ctx: &mut ApplyContext) -> Result<()> {
    if let Some(handle) = ctx.in_flight.take() {
        let _ = handle.await;
    }

    let row = sentinel::update_replay(&ctx.sentinel_client, ctx.last_applied)
        .await
        .context("Failed the final sentinel replay_lsn update")?;

    tracing::info!(
        "Replayed up to {} (sentinel endpos {})",
        row.replay_lsn,
        row.endpos
    );

    Ok(())
}

/// Block until the sentinel allows applying. Returns false when the endpos
/// was already reached before we even started.
async fn wait_for_sentinel(ctx: &mut ApplyContext, stop: &AtomicBool) -> Result<bool> {
    loop {
        if stop.load(Ordering::Relaxed) {
            ctx.state = ApplyState::Stopped;
            return Ok(false);
        }

        let row = sentinel::get(&ctx.sentinel_client).await?;

        if !ctx.endpos.is_valid() {
            ctx.endpos = row.endpos;
        }

        if row.endpos.is_valid() && row.endpos <= row.replay_lsn {
            tracing::info!(
                "Current endpos {} was previously reached at {}",
                row.endpos,
                row.replay_lsn
            );
            ctx.state = ApplyState::Stopped;
            ctx.last_applied = row.replay_lsn;
            return Ok(false);
        }

        if row.apply {
            ctx.state = ApplyState::Ready;
            return Ok(true);
        }

        tracing::debug!("Waiting for the sentinel apply switch");
        tokio::time::sleep(Duration::from_secs(1)).await;
    }
}

/// Create the replication origin if needed, start an origin session, and
/// return the recorded progress.
async fn setup_origin(target: &Client, origin: &str) -> Result<Lsn> {
    let exists = target
        .query_opt(
            "SELECT roident FROM pg_replication_origin WHERE roname = $1",
            &[&origin],
        )
        .await
        .context("Failed to look up the replication origin")?;

    if exists.is_none() {
        target
            .execute("SELECT pg_replication_origin_create($1)", &[&origin])
            .await
            .context("Failed to create the replication origin")?;
        tracing::info!("Created replication origin \"{}\"", origin);
    }

    let row = target
        .query_one(
            "SELECT pg_replication_origin_progress($1, false)::text",
            &[&origin],
        )
        .await
        .context("Failed to read the replication origin progress")?;
    let progress: Option<String> = row.get(0);
    let progress = match progress {
        Some(text) => text.parse()?,
        None => Lsn::INVALID,
    };

    target
        .execute("SELECT pg_replication_origin_session_setup($1)", &[&origin])
        .await
        .context("Failed to set up the replication origin session")?;

    tracing::info!(
        "Replication origin \"{}\" progress is {}",
        origin,
        progress
    );

    Ok(progress)
}

/// Current origin progress on the target, outside the origin session.
async fn origin_progress(target: &Client) -> Result<Lsn> {
    let row = target
        .query_one("SELECT pg_replication_origin_session_progress(false)::text", &[])
        .await
        .context("Failed to read the origin session progress")?;
    let progress: Option<String> = row.get(0);
    match progress {
        Some(text) => text.parse(),
        None => Ok(Lsn::INVALID),
    }
}

/// Drop the replication origin on the target, used by `stream cleanup`.
pub async fn drop_origin(target_uri: &str, origin: &str) -> Result<()> {
    let target = pg::connect_with_retry(target_uri).await?;

    let exists = target
        .query_opt(
            "SELECT roident FROM pg_replication_origin WHERE roname = $1",
            &[&origin],
        )
        .await
        .context("Failed to look up the replication origin")?;

    if exists.is_some() {
        target
            .execute("SELECT pg_replication_origin_drop($1)", &[&origin])
            .await
            .context("Failed to drop the replication origin")?;
        tracing::info!("Dropped replication origin \"{}\"", origin);
    } else {
        tracing::info!("Replication origin \"{}\" does not exist, nothing to drop", origin);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lsn(s: &str) -> Lsn {
        s.parse().unwrap()
    }

    #[test]
    fn test_begin_disposition_duplicates_are_skipped() {
        // commit at or below origin progress: already applied
        assert_eq!(
            begin_disposition(lsn("0/1000"), lsn("0/1000"), Lsn::INVALID),
            BeginDisposition::Skip
        );
        assert_eq!(
            begin_disposition(lsn("0/0FFF"), lsn("0/1000"), Lsn::INVALID),
            BeginDisposition::Skip
        );
    }

    #[test]
    fn test_begin_disposition_applies_newer_transactions() {
        assert_eq!(
            begin_disposition(lsn("0/1001"), lsn("0/1000"), Lsn::INVALID),
            BeginDisposition::Apply
        );
        // commit exactly at endpos is still applied
        assert_eq!(
            begin_disposition(lsn("0/2000"), lsn("0/1000"), lsn("0/2000")),
            BeginDisposition::Apply
        );
    }

    #[test]
    fn test_begin_disposition_stops_past_endpos() {
        assert_eq!(
            begin_disposition(lsn("0/2001"), lsn("0/1000"), lsn("0/2000")),
            BeginDisposition::Stop
        );
        // duplicate check wins over the endpos check
        assert_eq!(
            begin_disposition(lsn("0/0500"), lsn("0/1000"), lsn("0/0400")),
            BeginDisposition::Skip
        );
    }
}
