//! The delete command.
//!
//! Everything older than the newest full backup at or before the given
//! date is marked DELETED: that full backup stays, so the date itself
//! remains recoverable. The physical sweep then removes the directories
//! of every DELETED record, and archived WAL segments wholly before the
//! oldest surviving backup are pruned from the archive.

use std::fs;

use anyhow::{anyhow, Context};
use tracing::{info, warn};

use postgres_ffi::xlog_utils::XLogFromFileName;
use postgres_ffi::WAL_SEGMENT_SIZE;
use utils::signals::check_interrupt;

use crate::catalog::{parse_date, BackupStatus, Catalog};
use crate::config::{BackupMode, Config};

pub fn do_delete(config: &Config, date: Option<&str>) -> anyhow::Result<()> {
    let backup_path = config.require_backup_path()?;
    let arclog_path = config
        .arclog_path
        .as_ref()
        .ok_or_else(|| anyhow!("delete command needs ARCLOG_PATH"))?;
    let date = date
        .ok_or_else(|| anyhow!("required delete range option not specified: delete DATE"))?;
    let target = parse_date(date)?;

    let catalog = Catalog::new(backup_path);
    let _lock = catalog.lock()?;

    let mut records = catalog.list_backups()?;

    // The newest completed full backup at or before the date anchors the
    // recovery window; everything strictly older is expendable.
    let anchor = records
        .iter()
        .find(|r| {
            r.mode == BackupMode::Full
                && r.status == BackupStatus::Done
                && r.start_time <= target
        })
        .ok_or_else(|| anyhow!("no full backup to delete found before \"{date}\""))?;
    let cut = anchor.start_time;
    let anchor_segno = anchor.start_lsn.segment_number(WAL_SEGMENT_SIZE);

    for record in &mut records {
        if record.start_time < cut && record.status != BackupStatus::Deleted {
            info!("marking backup {} DELETED", record.id());
            record.status = BackupStatus::Deleted;
            catalog.write_ini(record)?;
        }
    }

    // Physical sweep of everything marked, by this call or earlier ones.
    for record in &records {
        check_interrupt()?;
        if record.status == BackupStatus::Deleted {
            info!("removing backup directory {}", record.id());
            catalog.remove_backup_dir(&record.id())?;
        }
    }

    prune_archived_wal(arclog_path, anchor_segno)?;
    Ok(())
}

/// Remove archived segments wholly before the anchor's start segment; the
/// anchor backup needs that segment and everything after it to recover.
fn prune_archived_wal(
    arclog_path: &camino::Utf8Path,
    keep_from_segno: u64,
) -> anyhow::Result<()> {
    let entries = fs::read_dir(arclog_path)
        .with_context(|| format!("could not list archive {arclog_path}"))?;
    let mut pruned = 0usize;
    for entry in entries {
        check_interrupt()?;
        let entry = entry?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else {
            continue;
        };
        let Some((_tli, segno)) = XLogFromFileName(name, WAL_SEGMENT_SIZE) else {
            continue;
        };
        if segno < keep_from_segno {
            if let Err(e) = fs::remove_file(entry.path()) {
                warn!("could not remove archived segment {name}: {e}");
            } else {
                pruned += 1;
            }
        }
    }
    info!("pruned {pruned} archived WAL segments");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::BackupRecord;
    use chrono::NaiveDateTime;
    use postgres_ffi::xlog_utils::XLogFileName;
    use utils::lsn::Lsn;

    fn ts(s: &str) -> NaiveDateTime {
        NaiveDateTime::parse_from_str(s, "%Y%m%dT%H%M%S").unwrap()
    }

    fn seeded_catalog(dir: &camino::Utf8Path) -> Catalog {
        let catalog = Catalog::new(dir);
        catalog.init().unwrap();
        for (start, mode, status) in [
            ("20260801T000000", BackupMode::Full, BackupStatus::Done),
            ("20260802T000000", BackupMode::Page, BackupStatus::Done),
            ("20260803T000000", BackupMode::Full, BackupStatus::Done),
            ("20260804T000000", BackupMode::Page, BackupStatus::Done),
        ] {
            let mut record = BackupRecord::new(ts(start), mode, 8192, 8192);
            record.status = status;
            record.tli = 1;
            record.start_lsn = Lsn(0x0200_0028);
            catalog.create_backup(&record).unwrap();
        }
        catalog
    }

    #[test]
    fn delete_cuts_below_anchor_full() {
        let dir = camino_tempfile::tempdir().unwrap();
        let arclog = dir.path().join("arclog");
        std::fs::create_dir_all(&arclog).unwrap();
        let catalog = seeded_catalog(dir.path());

        // One prunable segment and one the anchor still needs.
        std::fs::write(arclog.join(XLogFileName(1, 1, WAL_SEGMENT_SIZE)), b"").unwrap();
        std::fs::write(arclog.join(XLogFileName(1, 2, WAL_SEGMENT_SIZE)), b"").unwrap();

        let config = Config {
            backup_path: Some(dir.path().to_owned()),
            arclog_path: Some(arclog.clone()),
            ..Config::default()
        };
        do_delete(&config, Some("20260804T120000")).unwrap();

        let records = catalog.list_backups().unwrap();
        let by_id = |id: &str| records.iter().find(|r| r.id() == id);
        // The anchor (newest full at or before the date) and its chain stay.
        assert_eq!(by_id("20260803T000000").unwrap().status, BackupStatus::Done);
        assert_eq!(by_id("20260804T000000").unwrap().status, BackupStatus::Done);
        // Everything older is gone from disk entirely.
        assert!(by_id("20260801T000000").is_none());
        assert!(by_id("20260802T000000").is_none());

        // start_lsn 0/2000028 sits in segment 2: segment 1 is prunable.
        assert!(!arclog.join(XLogFileName(1, 1, WAL_SEGMENT_SIZE)).exists());
        assert!(arclog.join(XLogFileName(1, 2, WAL_SEGMENT_SIZE)).exists());
    }

    #[test]
    fn delete_requires_arclog_and_date() {
        let dir = camino_tempfile::tempdir().unwrap();
        let config = Config {
            backup_path: Some(dir.path().to_owned()),
            ..Config::default()
        };
        let err = do_delete(&config, Some("20260804T000000")).unwrap_err();
        assert!(format!("{err:#}").contains("delete command needs ARCLOG_PATH"));

        let config = Config {
            backup_path: Some(dir.path().to_owned()),
            arclog_path: Some(dir.path().join("arclog")),
            ..Config::default()
        };
        let err = do_delete(&config, None).unwrap_err();
        assert!(
            format!("{err:#}").contains("required delete range option not specified: delete DATE")
        );
    }
}
