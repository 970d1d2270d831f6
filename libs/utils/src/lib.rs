//! Generic plumbing shared by the pg_arman crates: the LSN type,
//! crash-safe file replacement, the catalog lock file and signal handling.

pub mod crashsafe;
pub mod lock_file;
pub mod logging;
pub mod lsn;
pub mod signals;
