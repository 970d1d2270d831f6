//!
//! On-disk and WAL format knowledge for the PostgreSQL version this engine
//! is built against (PostgreSQL 11). Sizes and constants here are frozen at
//! build time; the server protocol driver cross-checks them against the
//! live server before any backup starts.
//!

pub mod page;
pub mod pg_constants;
pub mod relfile_utils;
pub mod waldecoder;
pub mod xlog_utils;

pub use xlog_utils::{IsXLogFileName, XLogFileName, XLogFromFileName};

pub type Oid = u32;
pub type TransactionId = u32;
pub type BlockNumber = u32;
pub type OffsetNumber = u16;
pub type MultiXactId = TransactionId;
pub type TimeLineID = u32;
pub type TimestampTz = i64;
pub type XLogRecPtr = u64;
pub type XLogSegNo = u64;

/// Size of a database data block. The live value is asserted via
/// `current_setting('block_size')`.
pub const BLCKSZ: u16 = 8192;

/// Size of a WAL page. Asserted via `current_setting('wal_block_size')`.
pub const XLOG_BLCKSZ: usize = 8192;

/// Size of one WAL segment file.
pub const WAL_SEGMENT_SIZE: usize = 16 * 1024 * 1024;

/// Blocks per relation segment file; a fork larger than this is sharded
/// into `<relnode>`, `<relnode>.1`, `<relnode>.2`, ...
pub const RELSEG_SIZE: u32 = 1024 * 1024 * 1024 / (BLCKSZ as u32);

pub const PG_MAJORVERSION: &str = "11";

/// `server_version_num` bounds accepted by the version check.
pub const PG_VERSION_NUM_MIN: i32 = 110000;
pub const PG_VERSION_NUM_MAX: i32 = 120000;

/// Identity of a relation on disk: which tablespace, which database, which
/// relation. Together with a fork number and segment number this names one
/// file under the data directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RelFileNode {
    pub spcnode: Oid,
    pub dbnode: Oid,
    pub relnode: Oid,
}
