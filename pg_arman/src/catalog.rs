//! The backup catalog.
//!
//! One subdirectory per backup under `$BACKUP_PATH/backup/`, named by the
//! record's start time (`YYYYMMDD'T'HHMMSS`); each holds the manifest
//! (`backup.ini`), the file list, the directory-scaffolding script and the
//! copied `database/` tree. An exclusive lock file at the catalog root
//! guards the whole catalog; manifest writes go through temp-file + rename
//! so readers never observe a torn record.

use std::fmt;
use std::fs;

use anyhow::{bail, Context};
use camino::{Utf8Path, Utf8PathBuf};
use chrono::{NaiveDate, NaiveDateTime};
use tracing::warn;

use utils::crashsafe;
use utils::lock_file::{self, LockAcquisition, LockFileGuard};
use utils::lsn::Lsn;

use crate::config::BackupMode;

pub const BACKUP_SUBDIR: &str = "backup";
pub const LOCK_FILE_NAME: &str = "backup.lock";
pub const BACKUP_INI_NAME: &str = "backup.ini";
pub const FILE_LIST_NAME: &str = "file_database.txt";
pub const MKDIRS_SCRIPT_NAME: &str = "mkdirs.sh";
pub const DATABASE_DIR_NAME: &str = "database";

const ID_FORMAT: &str = "%Y%m%dT%H%M%S";
const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Another invocation holds the catalog lock. Mapped to its own process
/// exit status; the catalog was not touched.
#[derive(Debug, thiserror::Error)]
#[error("another pg_arman is running against this backup catalog")]
pub struct CatalogLocked;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackupStatus {
    Running,
    Done,
    Error,
    Deleted,
    Corrupt,
}

impl fmt::Display for BackupStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BackupStatus::Running => "RUNNING",
            BackupStatus::Done => "DONE",
            BackupStatus::Error => "ERROR",
            BackupStatus::Deleted => "DELETED",
            BackupStatus::Corrupt => "CORRUPT",
        };
        f.write_str(s)
    }
}

impl std::str::FromStr for BackupStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "RUNNING" => Ok(BackupStatus::Running),
            "DONE" => Ok(BackupStatus::Done),
            "ERROR" => Ok(BackupStatus::Error),
            "DELETED" => Ok(BackupStatus::Deleted),
            "CORRUPT" => Ok(BackupStatus::Corrupt),
            _ => bail!("invalid backup status \"{s}\""),
        }
    }
}

/// One catalog entry. The start time doubles as the record's identity and
/// its directory name.
#[derive(Debug, Clone)]
pub struct BackupRecord {
    pub start_time: NaiveDateTime,
    pub mode: BackupMode,
    pub status: BackupStatus,
    pub tli: u32,
    pub start_lsn: Lsn,
    pub stop_lsn: Lsn,
    pub recovery_xid: u32,
    pub recovery_time: Option<NaiveDateTime>,
    pub block_size: u32,
    pub wal_block_size: u32,
    /// Bytes read from the data directory.
    pub data_bytes: i64,
    /// Bytes written into the backup.
    pub write_bytes: i64,
    pub end_time: Option<NaiveDateTime>,
}

impl BackupRecord {
    pub fn new(
        start_time: NaiveDateTime,
        mode: BackupMode,
        block_size: u32,
        wal_block_size: u32,
    ) -> BackupRecord {
        BackupRecord {
            start_time,
            mode,
            status: BackupStatus::Running,
            tli: 0,
            start_lsn: Lsn::INVALID,
            stop_lsn: Lsn::INVALID,
            recovery_xid: 0,
            recovery_time: None,
            block_size,
            wal_block_size,
            data_bytes: 0,
            write_bytes: 0,
            end_time: None,
        }
    }

    /// Directory name under `backup/`.
    pub fn id(&self) -> String {
        self.start_time.format(ID_FORMAT).to_string()
    }

    /// Only a completed full backup can anchor a differential chain.
    pub fn is_valid_full_parent(&self, tli: u32) -> bool {
        self.mode == BackupMode::Full && self.status == BackupStatus::Done && self.tli == tli
    }

    fn to_ini(&self) -> String {
        let mut out = String::new();
        out.push_str("# backup manifest\n");
        out.push_str(&format!("BACKUP_MODE={}\n", self.mode));
        out.push_str(&format!("TIMELINEID={}\n", self.tli));
        out.push_str(&format!("START_LSN={}\n", self.start_lsn));
        out.push_str(&format!("STOP_LSN={}\n", self.stop_lsn));
        out.push_str(&format!(
            "START_TIME='{}'\n",
            self.start_time.format(TIME_FORMAT)
        ));
        if let Some(end_time) = self.end_time {
            out.push_str(&format!("END_TIME='{}'\n", end_time.format(TIME_FORMAT)));
        }
        out.push_str(&format!("RECOVERY_XID={}\n", self.recovery_xid));
        if let Some(recovery_time) = self.recovery_time {
            out.push_str(&format!(
                "RECOVERY_TIME='{}'\n",
                recovery_time.format(TIME_FORMAT)
            ));
        }
        out.push_str(&format!("BLOCK_SIZE={}\n", self.block_size));
        out.push_str(&format!("XLOG_BLOCK_SIZE={}\n", self.wal_block_size));
        out.push_str(&format!("DATA_BYTES={}\n", self.data_bytes));
        out.push_str(&format!("WRITE_BYTES={}\n", self.write_bytes));
        out.push_str(&format!("STATUS={}\n", self.status));
        out
    }

    fn from_ini(start_time: NaiveDateTime, text: &str) -> anyhow::Result<BackupRecord> {
        let mut record = BackupRecord::new(start_time, BackupMode::Full, 0, 0);
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let Some((key, value)) = line.split_once('=') else {
                continue;
            };
            let value = value.trim().trim_matches('\'');
            match key.trim() {
                "BACKUP_MODE" => record.mode = value.parse()?,
                "TIMELINEID" => record.tli = value.parse()?,
                "START_LSN" => record.start_lsn = value.parse()?,
                "STOP_LSN" => record.stop_lsn = value.parse()?,
                "START_TIME" => {
                    record.start_time = NaiveDateTime::parse_from_str(value, TIME_FORMAT)?
                }
                "END_TIME" => {
                    record.end_time = Some(NaiveDateTime::parse_from_str(value, TIME_FORMAT)?)
                }
                "RECOVERY_XID" => record.recovery_xid = value.parse()?,
                "RECOVERY_TIME" => {
                    record.recovery_time = Some(NaiveDateTime::parse_from_str(value, TIME_FORMAT)?)
                }
                "BLOCK_SIZE" => record.block_size = value.parse()?,
                "XLOG_BLOCK_SIZE" => record.wal_block_size = value.parse()?,
                "DATA_BYTES" => record.data_bytes = value.parse()?,
                "WRITE_BYTES" => record.write_bytes = value.parse()?,
                "STATUS" => record.status = value.parse()?,
                other => warn!("ignoring unknown manifest key {other}"),
            }
        }
        Ok(record)
    }
}

/// Handle on the catalog rooted at `$BACKUP_PATH`.
#[derive(Clone)]
pub struct Catalog {
    root: Utf8PathBuf,
}

impl Catalog {
    pub fn new(root: &Utf8Path) -> Catalog {
        Catalog {
            root: root.to_owned(),
        }
    }

    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    /// Create the catalog skeleton. Fails if it already holds a catalog.
    pub fn init(&self) -> anyhow::Result<()> {
        let backup_dir = self.root.join(BACKUP_SUBDIR);
        if backup_dir.exists() {
            bail!("backup catalog already exists at {}", self.root);
        }
        fs::create_dir_all(&backup_dir)
            .with_context(|| format!("could not create {backup_dir}"))?;
        crashsafe::fsync_dir(&self.root)?;
        Ok(())
    }

    /// Take the exclusive catalog lock. Contention is a distinct error so
    /// the caller can exit with the dedicated status without touching any
    /// catalog state.
    pub fn lock(&self) -> anyhow::Result<LockFileGuard> {
        let path = self.root.join(LOCK_FILE_NAME);
        match lock_file::try_lock(&path)
            .with_context(|| format!("could not open lock file {path}"))?
        {
            LockAcquisition::Acquired(guard) => Ok(guard),
            LockAcquisition::Contended => Err(CatalogLocked.into()),
        }
    }

    pub fn backup_dir(&self, id: &str) -> Utf8PathBuf {
        self.root.join(BACKUP_SUBDIR).join(id)
    }

    pub fn database_dir(&self, id: &str) -> Utf8PathBuf {
        self.backup_dir(id).join(DATABASE_DIR_NAME)
    }

    /// Create the directory tree for a new record and persist its initial
    /// manifest.
    pub fn create_backup(&self, record: &BackupRecord) -> anyhow::Result<()> {
        let dir = self.database_dir(&record.id());
        fs::create_dir_all(&dir).with_context(|| format!("could not create {dir}"))?;
        self.write_ini(record)
    }

    /// Persist the manifest with temp-file + rename: a concurrent reader
    /// sees the old or the new manifest, never a torn one.
    pub fn write_ini(&self, record: &BackupRecord) -> anyhow::Result<()> {
        let path = self.backup_dir(&record.id()).join(BACKUP_INI_NAME);
        crashsafe::overwrite(&path, record.to_ini().as_bytes())
            .with_context(|| format!("could not write {path}"))
    }

    /// All records, newest first. A record still marked RUNNING on disk is
    /// reported as ERROR: we hold the lock, so no live invocation can own
    /// it, meaning its writer died mid-backup.
    pub fn list_backups(&self) -> anyhow::Result<Vec<BackupRecord>> {
        let dir = self.root.join(BACKUP_SUBDIR);
        let mut records = Vec::new();
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                bail!("backup catalog not found at {}; run init first", self.root)
            }
            Err(e) => return Err(e).with_context(|| format!("could not list {dir}")),
        };
        for entry in entries {
            let entry = entry?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            let Ok(start_time) = NaiveDateTime::parse_from_str(name, ID_FORMAT) else {
                warn!("ignoring foreign entry \"{name}\" in the backup catalog");
                continue;
            };
            match self.read_backup(start_time) {
                Ok(record) => records.push(record),
                Err(e) => warn!("could not read backup {name}: {e:#}"),
            }
        }
        records.sort_by_key(|r| std::cmp::Reverse(r.start_time));
        Ok(records)
    }

    pub fn read_backup(&self, start_time: NaiveDateTime) -> anyhow::Result<BackupRecord> {
        let mut record = self.read_backup_raw(start_time)?;
        if record.status == BackupStatus::Running {
            record.status = BackupStatus::Error;
        }
        Ok(record)
    }

    /// Like [`Self::read_backup`], but without the RUNNING -> ERROR fixup;
    /// the crash-cleanup handler needs the status exactly as persisted.
    pub fn read_backup_raw(&self, start_time: NaiveDateTime) -> anyhow::Result<BackupRecord> {
        let id = start_time.format(ID_FORMAT).to_string();
        let path = self.backup_dir(&id).join(BACKUP_INI_NAME);
        let text =
            fs::read_to_string(&path).with_context(|| format!("could not read {path}"))?;
        let mut record = BackupRecord::from_ini(start_time, &text)?;
        record.start_time = start_time;
        Ok(record)
    }

    /// The most recent completed full backup on the timeline, if any.
    pub fn last_full_backup<'a>(
        records: &'a [BackupRecord],
        tli: u32,
    ) -> Option<&'a BackupRecord> {
        records.iter().find(|r| r.is_valid_full_parent(tli))
    }

    /// Remove a record's directory tree; used by the physical sweep after
    /// records were marked DELETED.
    pub fn remove_backup_dir(&self, id: &str) -> anyhow::Result<()> {
        let dir = self.backup_dir(id);
        fs::remove_dir_all(&dir).with_context(|| format!("could not remove {dir}"))
    }
}

/// The init command: create the catalog skeleton and seed a configuration
/// file with the paths the operator already supplied.
pub fn do_init(config: &crate::config::Config) -> anyhow::Result<()> {
    let backup_path = config.require_backup_path()?;
    fs::create_dir_all(backup_path)
        .with_context(|| format!("could not create {backup_path}"))?;

    let catalog = Catalog::new(backup_path);
    catalog.init()?;

    let ini_path = backup_path.join(crate::config::INI_FILE_NAME);
    if !ini_path.exists() {
        let mut sample = String::from("# pg_arman configuration\n");
        if let Some(pgdata) = &config.pgdata {
            sample.push_str(&format!("PGDATA={pgdata}\n"));
        }
        if let Some(arclog_path) = &config.arclog_path {
            sample.push_str(&format!("ARCLOG_PATH={arclog_path}\n"));
        }
        crashsafe::overwrite(&ini_path, sample.as_bytes())
            .with_context(|| format!("could not write {ini_path}"))?;
    }

    tracing::info!("backup catalog initialized at {backup_path}");
    Ok(())
}

/// Pick the retention cut point: the start time of the oldest completed
/// FULL backup retained by either active policy. Everything strictly older
/// is eligible for deletion; everything at or after it stays, which keeps
/// every surviving differential chain anchored to a surviving full backup.
/// Returns `None` when nothing may be deleted.
pub fn retention_cut(
    records_desc: &[BackupRecord],
    keep_generations: Option<i32>,
    keep_days: Option<i32>,
    now: NaiveDateTime,
) -> Option<NaiveDateTime> {
    if keep_generations.is_none() && keep_days.is_none() {
        return None;
    }

    let mut cut = None;
    let mut generations = 0i32;
    for record in records_desc {
        if record.status != BackupStatus::Done {
            continue;
        }
        let is_full = record.mode == BackupMode::Full;
        if is_full {
            generations += 1;
        }

        let by_generations = keep_generations.is_some_and(|keep| is_full && generations <= keep);
        let by_days = keep_days.is_some_and(|keep| {
            let age = now.signed_duration_since(record.start_time);
            age.num_days() <= i64::from(keep)
        });

        if is_full && (by_generations || by_days) {
            cut = Some(record.start_time);
        }
        if !by_generations && !by_days && keep_generations.is_some_and(|keep| generations > keep) {
            // Past the last generation any policy could still retain.
            break;
        }
    }
    cut
}

/// Parse a DATE argument of `show`/`validate`/`delete`: either the catalog
/// id form or a timestamp.
pub fn parse_date(value: &str) -> anyhow::Result<NaiveDateTime> {
    if let Ok(t) = NaiveDateTime::parse_from_str(value, ID_FORMAT) {
        return Ok(t);
    }
    if let Ok(t) = NaiveDateTime::parse_from_str(value, TIME_FORMAT) {
        return Ok(t);
    }
    if let Ok(d) = NaiveDate::parse_from_str(value, "%Y-%m-%d") {
        return Ok(d.and_hms_opt(0, 0, 0).unwrap());
    }
    bail!("invalid date \"{value}\"");
}
