// ABOUTME: Command handlers routed from the CLI front-end
// ABOUTME: Shared option plumbing lives here, one module per command

use std::path::PathBuf;

use crate::filters::CopyFilters;
use crate::lsn::Lsn;
use crate::stream::Plugin;

pub mod clean;
pub mod clone;
pub mod copy;
pub mod follow;
pub mod ping;
pub mod snapshot;

/// Options shared by every command, resolved from flags and environment.
#[derive(Debug, Clone)]
pub struct CommonOptions {
    pub source_uri: String,
    pub target_uri: String,
    pub dir: Option<PathBuf>,
    pub table_jobs: usize,
    pub index_jobs: usize,
    pub drop_if_exists: bool,
    pub skip_extensions: bool,
    pub restart: bool,
    pub resume: bool,
    pub plugin: Plugin,
    pub slot_name: String,
    pub origin: String,
    pub endpos: Lsn,
    pub split_tables_larger_than: i64,
    pub filters: CopyFilters,
}
