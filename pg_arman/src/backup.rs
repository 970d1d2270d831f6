//! The backup pipeline.
//!
//! One invocation: lock the catalog, register a RUNNING record, coordinate
//! the server-side backup window, discover dirtied blocks from the WAL
//! (differential mode), copy files, register the result. A crash-cleanup
//! guard is armed across the fallible middle: on any early return, panic
//! or interrupt it ends the server-side backup if one is still open and
//! flips the record to ERROR, so no RUNNING record ever outlives its
//! invocation.

use std::collections::HashSet;

use anyhow::{bail, ensure, Context};
use camino::{Utf8Path, Utf8PathBuf};
use chrono::Local;
use scopeguard::ScopeGuard;
use tracing::{error, info, warn};

use postgres_ffi::pg_constants::BACKUP_LABEL_FILE;
use postgres_ffi::{BLCKSZ, XLOG_BLCKSZ};
use utils::signals::check_interrupt;

use crate::catalog::{
    retention_cut, BackupRecord, BackupStatus, Catalog, FILE_LIST_NAME, MKDIRS_SCRIPT_NAME,
};
use crate::config::{BackupMode, Config};
use crate::datafile::{copy_file_delta, copy_file_verbatim};
use crate::dirscan::{
    read_file_list, scan_data_directory, write_file_list, write_mkdirs_script, BYTES_INVALID,
};
use crate::pagemap::PageMap;
use crate::server::{self, ConnectionConf};
use crate::walscan::{scan_wal, BlockSink};
use crate::{validate, PROGRAM_NAME};

pub fn do_backup(config: &Config) -> anyhow::Result<()> {
    let backup_path = config.require_backup_path()?;
    let mode = config.require_backup_mode()?;
    let pgdata = config.require_pgdata()?.to_owned();
    let arclog_path = config.require_arclog_path()?.to_owned();

    let conn = ConnectionConf {
        host: config.host.clone(),
        port: config.port.clone(),
        dbname: config.dbname.clone(),
        username: config.username.clone(),
    };

    let catalog = Catalog::new(backup_path);
    let _lock = catalog.lock()?;

    if config.check {
        return dry_run(&catalog, &conn, &pgdata, mode);
    }

    let start_time = Local::now().naive_local();
    let record = BackupRecord::new(start_time, mode, u32::from(BLCKSZ), XLOG_BLCKSZ as u32);
    catalog.create_backup(&record)?;
    info!("backup {} started in {} mode", record.id(), mode);

    // Armed until the pipeline completes: ends the server-side backup if
    // the label file is still there, then persists ERROR status.
    let cleanup = scopeguard::guard(
        (catalog.clone(), record.clone(), conn.clone(), pgdata.clone()),
        |(catalog, record, conn, pgdata)| {
            cleanup_failed_backup(&catalog, &record, &conn, &pgdata);
        },
    );

    let mut run = BackupRun {
        config,
        catalog: &catalog,
        conn: &conn,
        pgdata: &pgdata,
        arclog_path: &arclog_path,
        record,
    };
    run.run()?;

    // Completed: disarm the cleanup.
    let _ = ScopeGuard::into_inner(cleanup);

    apply_retention_policy(config, &catalog)?;

    if config.validate_after {
        validate::validate_one(&catalog, run.record.start_time)?;
    }

    info!(
        "backup {} completed: {} bytes read, {} bytes written",
        run.record.id(),
        run.record.data_bytes,
        run.record.write_bytes
    );
    Ok(())
}

/// `--check`: walk the validations without creating a record or copying a
/// byte.
fn dry_run(
    catalog: &Catalog,
    conn: &ConnectionConf,
    pgdata: &Utf8Path,
    mode: BackupMode,
) -> anyhow::Result<()> {
    let info = conn.check_system()?;
    ensure!(
        !server::is_standby(pgdata)?,
        "cannot take a backup from a standby server"
    );
    if mode == BackupMode::Page {
        let records = catalog.list_backups()?;
        if Catalog::last_full_backup(&records, info.timeline).is_none() {
            bail!("Valid full backup not found for differential backup");
        }
    }
    info!("dry run: a {mode} backup on timeline {} would be taken", info.timeline);
    Ok(())
}

struct BackupRun<'a> {
    config: &'a Config,
    catalog: &'a Catalog,
    conn: &'a ConnectionConf,
    pgdata: &'a Utf8Path,
    arclog_path: &'a Utf8Path,
    record: BackupRecord,
}

impl BackupRun<'_> {
    fn run(&mut self) -> anyhow::Result<()> {
        let info = self.conn.check_system()?;
        ensure!(
            !server::is_standby(self.pgdata)?,
            "cannot take a backup from a standby server"
        );
        self.record.tli = info.timeline;

        // A differential backup needs a completed full backup on this
        // timeline to anchor the chain.
        let parent = if self.record.mode == BackupMode::Page {
            let records = self.catalog.list_backups()?;
            Some(
                Catalog::last_full_backup(&records, info.timeline)
                    .ok_or_else(|| {
                        anyhow::anyhow!("Valid full backup not found for differential backup")
                    })?
                    .clone(),
            )
        } else {
            None
        };

        // Start the server-side backup window. The server flushes all
        // dirty buffers before returning, so the directory scan below
        // observes every block the start position accounts for.
        let label = format!(
            "{PROGRAM_NAME} backup started at {}",
            self.record.start_time.format("%Y-%m-%d %H:%M:%S")
        );
        let start_lsn = self
            .conn
            .start_backup(&label, self.config.smooth_checkpoint)?;
        self.record.start_lsn = start_lsn;
        self.catalog.write_ini(&self.record)?;
        info!("backup start position is {start_lsn} on timeline {}", info.timeline);

        if !server::file_exists(&self.pgdata.join(BACKUP_LABEL_FILE))? {
            // The server claims a backup is running but left no label; do
            // not copy anything on top of that contradiction.
            let _ = self.conn.stop_backup();
            bail!("the server did not write {BACKUP_LABEL_FILE} into the data directory");
        }

        let mut pagemap = PageMap::new();
        if let Some(parent) = &parent {
            // Everything the WAL dirtied between the two start positions;
            // archived up to the forced switch, which covers the window.
            let switch_lsn = self.conn.force_switch()?;
            server::wait_for_archive(self.pgdata, switch_lsn, info.timeline)?;

            let mut sink = BlockSink::new(self.pgdata, &mut pagemap);
            scan_wal(
                self.arclog_path,
                info.timeline,
                parent.start_lsn,
                start_lsn,
                &mut sink,
            )?;
            info!(
                "WAL scan marked {} blocks in {} files",
                pagemap.block_count(),
                pagemap.file_count()
            );
        }

        let parent_files: Option<HashSet<Utf8PathBuf>> = match &parent {
            Some(parent) => {
                let list_path = self.catalog.backup_dir(&parent.id()).join(FILE_LIST_NAME);
                let entries = read_file_list(&list_path)
                    .context("could not read the parent backup's file list")?;
                Some(
                    entries
                        .into_iter()
                        .filter(|e| e.write_size != BYTES_INVALID)
                        .map(|e| e.path)
                        .collect(),
                )
            }
            None => None,
        };

        let mut entries = scan_data_directory(self.pgdata)?;
        let database_dir = self.catalog.database_dir(&self.record.id());
        for entry in &mut entries {
            check_interrupt()?;
            if entry.is_dir() || entry.is_symlink() {
                continue;
            }

            // Page-level copy applies to relation files the parent backup
            // holds; a relation created since the parent is copied whole,
            // its empty page map notwithstanding.
            let delta = entry.is_datafile
                && parent.is_some()
                && parent_files
                    .as_ref()
                    .is_some_and(|files| files.contains(&entry.path));

            let stats = if delta {
                let parent = parent.as_ref().unwrap();
                let dirty = pagemap.get(&self.pgdata.join(&entry.path));
                copy_file_delta(self.pgdata, &database_dir, entry, parent.start_lsn, dirty)?
            } else {
                copy_file_verbatim(self.pgdata, &database_dir, entry)?
            };

            match stats {
                Some(stats) => {
                    self.record.data_bytes += stats.read_bytes;
                    self.record.write_bytes += entry.write_size.max(0);
                }
                None => info!("{} vanished during the backup, skipped", entry.path),
            }
        }

        // Capture the recovery target while the backup window is still
        // open, then close it.
        self.record.recovery_xid = self.conn.current_txid()?;
        self.record.recovery_time = Some(self.conn.current_time()?);
        let stop_lsn = self.conn.stop_backup()?;
        self.record.stop_lsn = stop_lsn;
        info!("backup stop position is {stop_lsn}");

        let backup_dir = self.catalog.backup_dir(&self.record.id());
        write_file_list(&entries, &backup_dir.join(FILE_LIST_NAME))?;
        write_mkdirs_script(&entries, &backup_dir.join(MKDIRS_SCRIPT_NAME))?;

        self.record.status = BackupStatus::Done;
        self.record.end_time = Some(Local::now().naive_local());
        self.catalog.write_ini(&self.record)?;
        Ok(())
    }
}

/// Crash cleanup, §7 policy: close the server-side backup window if it is
/// still open, then persist ERROR for the record if it is still RUNNING.
/// Idempotent; every step tolerates the previous invocation having already
/// done its work.
fn cleanup_failed_backup(
    catalog: &Catalog,
    record: &BackupRecord,
    conn: &ConnectionConf,
    pgdata: &Utf8Path,
) {
    warn!("backup {} failed, cleaning up", record.id());

    match server::file_exists(&pgdata.join(BACKUP_LABEL_FILE)) {
        Ok(true) => {
            if let Err(e) = conn.stop_backup() {
                error!("could not stop the server-side backup: {e:#}");
            }
        }
        Ok(false) => {}
        Err(e) => error!("could not probe for {BACKUP_LABEL_FILE}: {e:#}"),
    }

    match catalog.read_backup_raw(record.start_time) {
        Ok(mut on_disk) => {
            if on_disk.status == BackupStatus::Running {
                on_disk.status = BackupStatus::Error;
                if let Err(e) = catalog.write_ini(&on_disk) {
                    error!("could not persist ERROR status for {}: {e:#}", record.id());
                }
            }
        }
        Err(e) => error!("could not re-read record {}: {e:#}", record.id()),
    }
}

/// Mark records beyond the retention policies DELETED. Marking only; the
/// physical sweep belongs to the delete command.
fn apply_retention_policy(config: &Config, catalog: &Catalog) -> anyhow::Result<()> {
    if config.keep_data_generations.is_none() && config.keep_data_days.is_none() {
        return Ok(());
    }
    let records = catalog.list_backups()?;
    let now = Local::now().naive_local();
    let Some(cut) = retention_cut(
        &records,
        config.keep_data_generations,
        config.keep_data_days,
        now,
    ) else {
        return Ok(());
    };

    for record in records {
        if record.start_time < cut && record.status != BackupStatus::Deleted {
            info!("marking backup {} DELETED by retention policy", record.id());
            let mut record = record;
            record.status = BackupStatus::Deleted;
            catalog.write_ini(&record)?;
        }
    }
    Ok(())
}
