//! The restore command.
//!
//! Rebuilds a data directory from a full backup plus the chain of
//! differential backups after it, then writes a `recovery.conf` so the
//! server replays archived WAL up to the requested recovery target. The
//! server must be stopped; restoring under a live postmaster would corrupt
//! the cluster.

use std::fs;

use anyhow::{anyhow, bail, Context};
use camino::Utf8Path;
use chrono::NaiveDateTime;
use tracing::info;

use postgres_ffi::pg_constants::{POSTMASTER_PID_FILE, RECOVERY_CONF_FILE};
use utils::crashsafe;
use utils::signals::check_interrupt;

use crate::catalog::{parse_date, BackupRecord, BackupStatus, Catalog, FILE_LIST_NAME};
use crate::config::{BackupMode, Config};
use crate::datafile::{apply_delta_file, is_delta_file};
use crate::dirscan::{read_file_list, BYTES_INVALID};
use crate::server::file_exists;

pub fn do_restore(config: &Config) -> anyhow::Result<()> {
    let pgdata = config.require_pgdata()?;
    let backup_path = config.require_backup_path()?;
    let arclog_path = config.require_arclog_path()?;

    if file_exists(&pgdata.join(POSTMASTER_PID_FILE))? {
        bail!("the server seems to be running in {pgdata}; stop it before restoring");
    }

    let catalog = Catalog::new(backup_path);
    let _lock = catalog.lock()?;

    let target_time = config
        .recovery_target_time
        .as_deref()
        .map(parse_date)
        .transpose()
        .context("bad --recovery-target-time")?;

    let records = catalog.list_backups()?;
    let (full, chain) = select_restore_chain(&records, target_time)?;

    info!(
        "restoring full backup {} plus {} differential backup(s) into {pgdata}",
        full.id(),
        chain.len()
    );

    fs::create_dir_all(pgdata).with_context(|| format!("could not create {pgdata}"))?;
    restore_backup_files(&catalog, full, pgdata)?;
    for backup in &chain {
        restore_backup_files(&catalog, backup, pgdata)?;
    }

    // Contents of these were never captured; the server expects the
    // directories to exist.
    fs::create_dir_all(pgdata.join("pg_wal/archive_status"))?;

    write_recovery_conf(config, arclog_path, pgdata)?;
    info!("restore complete; start the server to begin recovery");
    Ok(())
}

/// The newest usable full backup for the target, and the differential
/// backups to layer on top, oldest first.
fn select_restore_chain(
    records: &[BackupRecord],
    target_time: Option<NaiveDateTime>,
) -> anyhow::Result<(&BackupRecord, Vec<&BackupRecord>)> {
    let usable = |r: &BackupRecord| {
        r.status == BackupStatus::Done
            && target_time.map_or(true, |t| r.recovery_time.unwrap_or(r.start_time) <= t)
    };

    let full = records
        .iter()
        .find(|r| r.mode == BackupMode::Full && usable(r))
        .ok_or_else(|| anyhow!("no full backup found to restore"))?;

    let mut chain: Vec<&BackupRecord> = records
        .iter()
        .filter(|r| {
            r.mode == BackupMode::Page
                && r.tli == full.tli
                && r.start_time > full.start_time
                && usable(r)
        })
        .collect();
    chain.reverse(); // listing order is newest first; apply oldest first
    Ok((full, chain))
}

fn restore_backup_files(
    catalog: &Catalog,
    record: &BackupRecord,
    pgdata: &Utf8Path,
) -> anyhow::Result<()> {
    let id = record.id();
    let database_dir = catalog.database_dir(&id);
    let entries = read_file_list(&catalog.backup_dir(&id).join(FILE_LIST_NAME))?;

    for entry in &entries {
        check_interrupt()?;
        let target = pgdata.join(&entry.path);
        if entry.is_dir() {
            fs::create_dir_all(&target)?;
            set_mode(&target, entry.mode)?;
            continue;
        }
        if entry.is_symlink() {
            // Tablespace links are recreated by mkdirs.sh, which captured
            // the target; nothing to copy here.
            continue;
        }
        if entry.write_size == BYTES_INVALID {
            continue;
        }

        let source = database_dir.join(&entry.path);
        if is_delta_file(&source)? {
            apply_delta_file(&source, &target)
                .with_context(|| format!("could not apply {} from backup {id}", entry.path))?;
        } else {
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::copy(&source, &target)
                .with_context(|| format!("could not restore {} from backup {id}", entry.path))?;
        }
        set_mode(&target, entry.mode)?;
    }
    Ok(())
}

fn set_mode(path: &Utf8Path, mode: u32) -> anyhow::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(mode & 0o7777))
        .with_context(|| format!("could not set permissions on {path}"))
}

fn write_recovery_conf(
    config: &Config,
    arclog_path: &Utf8Path,
    pgdata: &Utf8Path,
) -> anyhow::Result<()> {
    let mut conf = String::from("# generated by pg_arman restore\n");
    conf.push_str(&format!("restore_command = 'cp {arclog_path}/%f \"%p\"'\n"));
    if let Some(time) = &config.recovery_target_time {
        conf.push_str(&format!("recovery_target_time = '{time}'\n"));
    }
    if let Some(xid) = &config.recovery_target_xid {
        conf.push_str(&format!("recovery_target_xid = '{xid}'\n"));
    }
    if let Some(inclusive) = config.recovery_target_inclusive {
        conf.push_str(&format!("recovery_target_inclusive = '{inclusive}'\n"));
    }
    if let Some(timeline) = config.recovery_target_timeline {
        conf.push_str(&format!("recovery_target_timeline = '{timeline}'\n"));
    }

    let path = pgdata.join(RECOVERY_CONF_FILE);
    crashsafe::overwrite(&path, conf.as_bytes())
        .with_context(|| format!("could not write {path}"))?;
    info!("wrote {path}");
    Ok(())
}
