// ABOUTME: Library surface of pgcopydb: bulk copy phases and the streaming pipeline
// ABOUTME: The binary in main.rs routes CLI commands into these modules

use std::fmt;

pub mod catalog;
pub mod commands;
pub mod copy;
pub mod extensions;
pub mod filters;
pub mod indexes;
pub mod lsn;
pub mod pg;
pub mod schema;
pub mod sentinel;
pub mod sequences;
pub mod snapshot;
pub mod stream;
pub mod supervisor;
pub mod workdir;

/// Clean exit, or cooperative stop on a signal.
pub const EXIT_CODE_QUIT: i32 = 0;
/// Any failure inside the migration itself.
pub const EXIT_CODE_INTERNAL_ERROR: i32 = 12;
/// Invalid command line or configuration.
pub const EXIT_CODE_BAD_ARGS: i32 = 13;
/// Source or target unreachable.
pub const EXIT_CODE_UNREACHABLE: i32 = 14;

/// An error carrying the process exit code it should map to.
///
/// Commands wrap configuration and connectivity failures in this type; the
/// binary downcasts it from the anyhow chain and exits accordingly.
/// Everything else exits with the internal-error code.
#[derive(Debug)]
pub struct ExitError {
    pub code: i32,
    pub message: String,
}

impl ExitError {
    pub fn bad_args(message: impl Into<String>) -> ExitError {
        ExitError {
            code: EXIT_CODE_BAD_ARGS,
            message: message.into(),
        }
    }

    pub fn unreachable(message: impl Into<String>) -> ExitError {
        ExitError {
            code: EXIT_CODE_UNREACHABLE,
            message: message.into(),
        }
    }
}

impl fmt::Display for ExitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for ExitError {}

/// Map an anyhow error chain to the process exit code.
pub fn exit_code_for(error: &anyhow::Error) -> i32 {
    match error.downcast_ref::<ExitError>() {
        Some(exit) => exit.code,
        None => EXIT_CODE_INTERNAL_ERROR,
    }
}
