// ABOUTME: CLI entry point for pgcopydb
// ABOUTME: Parses commands and flags, then routes into the library

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use pgcopydb::catalog::DEFAULT_SPLIT_THRESHOLD;
use pgcopydb::commands::{self, CommonOptions};
use pgcopydb::filters::CopyFilters;
use pgcopydb::lsn::Lsn;
use pgcopydb::pg;
use pgcopydb::stream::Plugin;
use pgcopydb::supervisor::Shutdown;
use pgcopydb::{exit_code_for, ExitError, EXIT_CODE_BAD_ARGS};

#[derive(Parser)]
#[command(name = "pgcopydb")]
#[command(about = "Clone a PostgreSQL database to a target instance", long_about = None)]
#[command(version)]
struct Cli {
    /// Postgres URI of the source database
    #[arg(long, global = true, env = "PGCOPYDB_SOURCE_PGURI")]
    source: Option<String>,
    /// Postgres URI of the target database
    #[arg(long, global = true, env = "PGCOPYDB_TARGET_PGURI")]
    target: Option<String>,
    /// Work directory to use (defaults to a per-target tree under XDG_DATA_HOME)
    #[arg(long, global = true)]
    dir: Option<PathBuf>,
    /// Number of concurrent COPY jobs
    #[arg(
        long = "table-jobs",
        global = true,
        env = "PGCOPYDB_TABLE_JOBS",
        default_value_t = 4
    )]
    table_jobs: usize,
    /// Number of concurrent CREATE INDEX jobs
    #[arg(
        long = "index-jobs",
        global = true,
        env = "PGCOPYDB_INDEX_JOBS",
        default_value_t = 4
    )]
    index_jobs: usize,
    /// On the target database, clean up from a previous run first
    #[arg(long = "drop-if-exists", global = true)]
    drop_if_exists: bool,
    /// Skip copying extensions and their configuration tables
    #[arg(long = "skip-extensions", global = true)]
    skip_extensions: bool,
    /// Allow restarting when the work directory has files already
    #[arg(long, global = true)]
    restart: bool,
    /// Allow resuming operations after a failure
    #[arg(long, global = true)]
    resume: bool,
    /// Logical decoding output plugin (wal2json, test_decoding, pgoutput)
    #[arg(long, global = true, default_value = "wal2json")]
    plugin: String,
    /// Replication slot name on the source
    #[arg(long = "slot-name", global = true, default_value = "pgcopydb")]
    slot_name: String,
    /// Replication origin node name on the target
    #[arg(long, global = true, default_value = "pgcopydb")]
    origin: String,
    /// Stop replaying changes when reaching this LSN
    #[arg(long, global = true)]
    endpos: Option<String>,
    /// Same-table concurrency size threshold, in bytes
    #[arg(long = "split-tables-larger-than", global = true, default_value_t = DEFAULT_SPLIT_THRESHOLD)]
    split_tables_larger_than: i64,
    /// Restrict the migration to these schemas (repeatable)
    #[arg(long = "include-only-schema", global = true)]
    include_only_schema: Vec<String>,
    /// Exclude these schemas (repeatable)
    #[arg(long = "exclude-schema", global = true)]
    exclude_schema: Vec<String>,
    /// Restrict the migration to these tables, as schema.table (repeatable)
    #[arg(long = "include-only-table", global = true)]
    include_only_table: Vec<String>,
    /// Exclude these tables, as schema.table (repeatable)
    #[arg(long = "exclude-table", global = true)]
    exclude_table: Vec<String>,
    /// Set the log level (error, warn, info, debug, trace)
    #[arg(long, global = true, default_value = "info")]
    log: String,
    /// Shorthand for --log debug
    #[arg(long, global = true)]
    notice: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Check that both source and target databases are reachable
    Ping,
    /// Export a snapshot on the source and hold it until interrupted
    Snapshot,
    /// Clone the source database into the target database
    Clone {
        /// Also replay changes happening during and after the copy
        #[arg(long)]
        follow: bool,
    },
    /// Run one bulk phase on its own
    Copy {
        #[command(subcommand)]
        phase: CopyCommands,
    },
    /// Replay changes from the source to the target until endpos
    Follow,
    /// Streaming pipeline maintenance
    Stream {
        #[command(subcommand)]
        action: StreamCommands,
    },
}

#[derive(Subcommand)]
enum CopyCommands {
    /// Copy table data and build indexes, skipping finished work
    TableData,
}

#[derive(Subcommand)]
enum StreamCommands {
    /// Drop the replication slot, origin, and sentinel
    Cleanup,
}

fn init_logging(cli: &Cli) {
    let level = if cli.notice { "debug" } else { cli.log.as_str() };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn build_options(cli: &Cli, streaming: bool) -> Result<CommonOptions> {
    let source_uri = cli.source.clone().ok_or_else(|| {
        ExitError::bad_args("Missing --source (or PGCOPYDB_SOURCE_PGURI)")
    })?;
    let target_uri = cli.target.clone().ok_or_else(|| {
        ExitError::bad_args("Missing --target (or PGCOPYDB_TARGET_PGURI)")
    })?;

    pg::validate_connection_string(&source_uri)
        .map_err(|e| ExitError::bad_args(format!("Invalid --source: {:#}", e)))?;
    pg::validate_connection_string(&target_uri)
        .map_err(|e| ExitError::bad_args(format!("Invalid --target: {:#}", e)))?;

    if cli.restart && cli.resume {
        return Err(ExitError::bad_args("Cannot use both --restart and --resume").into());
    }

    let plugin: Plugin = cli
        .plugin
        .parse()
        .map_err(|e| ExitError::bad_args(format!("{:#}", e)))?;

    if streaming && plugin == Plugin::PgOutput {
        return Err(ExitError::bad_args(
            "The pgoutput plugin is not supported by the transformer; \
             use wal2json or test_decoding",
        )
        .into());
    }

    let endpos = match &cli.endpos {
        Some(text) => text
            .parse::<Lsn>()
            .map_err(|e| ExitError::bad_args(format!("Invalid --endpos: {:#}", e)))?,
        None => Lsn::INVALID,
    };

    let filters = CopyFilters::new(
        cli.include_only_schema.clone(),
        cli.exclude_schema.clone(),
        cli.include_only_table.clone(),
        cli.exclude_table.clone(),
    )
    .map_err(|e| ExitError::bad_args(format!("{:#}", e)))?;

    Ok(CommonOptions {
        source_uri,
        target_uri,
        dir: cli.dir.clone(),
        table_jobs: cli.table_jobs.max(1),
        index_jobs: cli.index_jobs.max(1),
        drop_if_exists: cli.drop_if_exists,
        skip_extensions: cli.skip_extensions,
        restart: cli.restart,
        resume: cli.resume,
        plugin,
        slot_name: cli.slot_name.clone(),
        origin: cli.origin.clone(),
        endpos,
        split_tables_larger_than: cli.split_tables_larger_than,
        filters,
    })
}

async fn dispatch(cli: Cli, shutdown: &Shutdown) -> Result<()> {
    match &cli.command {
        Commands::Ping => {
            let opts = build_options(&cli, false)?;
            commands::ping::run(&opts.source_uri, &opts.target_uri).await
        }
        Commands::Snapshot => {
            let opts = build_options(&cli, false)?;
            commands::snapshot::run(&opts, shutdown).await
        }
        Commands::Clone { follow } => {
            let opts = build_options(&cli, *follow)?;
            pg::check_required_tools().map_err(|e| ExitError::bad_args(format!("{:#}", e)))?;
            commands::clone::run(&opts, *follow, shutdown).await
        }
        Commands::Copy { phase } => match phase {
            CopyCommands::TableData => {
                let opts = build_options(&cli, false)?;
                commands::copy::run(&opts, shutdown).await
            }
        },
        Commands::Follow => {
            let opts = build_options(&cli, true)?;
            commands::follow::run(&opts, shutdown).await
        }
        Commands::Stream { action } => match action {
            StreamCommands::Cleanup => {
                let opts = build_options(&cli, false)?;
                commands::clean::run(&opts).await
            }
        },
    }
}

#[tokio::main]
async fn main() {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            // clap handles --help and --version through this path too
            let code = if e.use_stderr() { EXIT_CODE_BAD_ARGS } else { 0 };
            let _ = e.print();
            std::process::exit(code);
        }
    };

    init_logging(&cli);

    let shutdown = Shutdown::new();
    if let Err(e) = shutdown.install_signal_handlers() {
        tracing::warn!("Failed to install signal handlers: {:#}", e);
    }

    match dispatch(cli, &shutdown).await {
        Ok(()) => {}
        Err(e) => {
            tracing::error!("{:#}", e);
            std::process::exit(exit_code_for(&e));
        }
    }
}
