//!
//! Misc constants, copied from PostgreSQL headers.
//!
//! Only the ones the backup engine actually dispatches on are kept here;
//! they are all frozen properties of the PostgreSQL 11 on-disk format.
//!

//
// From pg_tablespace_d.h
//
pub const DEFAULTTABLESPACE_OID: u32 = 1663;
pub const GLOBALTABLESPACE_OID: u32 = 1664;

//
// Fork numbers, from relpath.h
//
pub const MAIN_FORKNUM: u8 = 0;
pub const FSM_FORKNUM: u8 = 1;
pub const VISIBILITYMAP_FORKNUM: u8 = 2;
pub const INIT_FORKNUM: u8 = 3;

// From catalog.h
pub const TABLESPACE_VERSION_DIRECTORY: &str = "PG_11_201809051";

// From storage_xlog.h
pub const XLOG_SMGR_CREATE: u8 = 0x10;
pub const XLOG_SMGR_TRUNCATE: u8 = 0x20;

// From rmgrlist.h
pub const RM_XLOG_ID: u8 = 0;
pub const RM_XACT_ID: u8 = 1;
pub const RM_SMGR_ID: u8 = 2;
pub const RM_CLOG_ID: u8 = 3;
pub const RM_DBASE_ID: u8 = 4;
pub const RM_TBLSPC_ID: u8 = 5;
pub const RM_MULTIXACT_ID: u8 = 6;
pub const RM_RELMAP_ID: u8 = 7;
pub const RM_STANDBY_ID: u8 = 8;
pub const RM_HEAP2_ID: u8 = 9;
pub const RM_HEAP_ID: u8 = 10;
pub const RM_LOGICALMSG_ID: u8 = 21;
pub const RM_MAX_ID: u8 = RM_LOGICALMSG_ID;

// From pg_control.h
pub const XLOG_SWITCH: u8 = 0x40;

// from xlogreader.h
pub const XLR_INFO_MASK: u8 = 0x0F;
pub const XLR_RMGR_INFO_MASK: u8 = 0xF0;

//
// from xlogrecord.h
//
pub const XLR_MAX_BLOCK_ID: u8 = 32;

pub const XLR_BLOCK_ID_DATA_SHORT: u8 = 255;
pub const XLR_BLOCK_ID_DATA_LONG: u8 = 254;
pub const XLR_BLOCK_ID_ORIGIN: u8 = 253;

pub const BKPBLOCK_FORK_MASK: u8 = 0x0F;
pub const BKPBLOCK_HAS_IMAGE: u8 = 0x10; /* block data is an XLogRecordBlockImage */
pub const BKPBLOCK_HAS_DATA: u8 = 0x20;
pub const BKPBLOCK_WILL_INIT: u8 = 0x40; /* redo will re-init the page */
pub const BKPBLOCK_SAME_REL: u8 = 0x80; /* RelFileNode omitted, same as previous */

/* Information stored in bimg_info */
pub const BKPIMAGE_HAS_HOLE: u8 = 0x01; /* page image has "hole" */
pub const BKPIMAGE_IS_COMPRESSED: u8 = 0x02; /* page image is compressed */
pub const BKPIMAGE_APPLY: u8 = 0x04; /* page image should be restored during replay */

/* From transam.h */
pub const FIRST_NORMAL_TRANSACTION_ID: u32 = 3;
pub const INVALID_TRANSACTION_ID: u32 = 0;

//
// Sentinel files the server maintains in the data directory.
//
pub const BACKUP_LABEL_FILE: &str = "backup_label";
pub const RECOVERY_CONF_FILE: &str = "recovery.conf";
pub const POSTMASTER_PID_FILE: &str = "postmaster.pid";
pub const PG_WAL_DIR: &str = "pg_wal";
pub const ARCHIVE_STATUS_DIR: &str = "pg_wal/archive_status";

// Runtime-only subdirectories: the directory entry itself is captured so
// restore can recreate the tree, but the contents are not backed up.
// Fixed for the target server version, like initdb's subdirectory list.
pub const PGDATA_EXCLUDE_CONTENTS: [&str; 8] = [
    "pg_wal",
    "pg_replslot",
    "pg_dynshmem",
    "pg_notify",
    "pg_serial",
    "pg_snapshots",
    "pg_stat_tmp",
    "pg_subtrans",
];

// Runtime-only files, never backed up.
pub const PGDATA_EXCLUDE_FILES: [&str; 3] =
    ["postmaster.pid", "postmaster.opts", "pg_internal.init"];

// Prefix of temporary-tablespace directories and temp relation files.
pub const PG_TEMP_FILES_PREFIX: &str = "pgsql_tmp";
