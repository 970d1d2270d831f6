//!
//! pg_arman: an out-of-process backup and point-in-time-recovery manager
//! for a PostgreSQL cluster.
//!
//! The engine takes physical backups of the data directory, either in full
//! or as page-level deltas discovered by parsing the archived WAL between
//! two log positions, and maintains a crash-safe catalog of the results.
//!

pub mod backup;
pub mod catalog;
pub mod config;
pub mod datafile;
pub mod delete;
pub mod dirscan;
pub mod pagemap;
pub mod restore;
pub mod server;
pub mod show;
pub mod validate;
pub mod walscan;

pub const PROGRAM_NAME: &str = "pg_arman";
pub const PROGRAM_VERSION: &str = "0.1";

/// Process exit codes. Lock contention gets its own code so wrapper
/// scripts can tell "another invocation is running" from real failures.
pub const EXIT_SUCCESS: i32 = 0;
pub const EXIT_ERROR: i32 = 1;
pub const EXIT_ALREADY_RUNNING: i32 = 2;
