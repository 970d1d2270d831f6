//! Verification of stored backups against their file lists.
//!
//! Every file written into a backup carries a CRC and a written size in
//! `file_database.txt`; validation recomputes both. A mismatch or missing
//! file moves the record from DONE to CORRUPT. A record that passes stays
//! DONE.

use anyhow::bail;
use chrono::NaiveDateTime;
use tracing::{info, warn};

use crate::catalog::{parse_date, BackupStatus, Catalog, FILE_LIST_NAME};
use crate::config::Config;
use crate::datafile::recompute_crc;
use crate::dirscan::{read_file_list, BYTES_INVALID};
use utils::signals::check_interrupt;

pub fn do_validate(config: &Config, date: Option<&str>) -> anyhow::Result<()> {
    let backup_path = config.require_backup_path()?;
    let catalog = Catalog::new(backup_path);
    let _lock = catalog.lock()?;

    let mut corrupt = 0usize;
    match date {
        Some(date) => {
            let start_time = parse_date(date)?;
            if !validate_record(&catalog, start_time)? {
                corrupt += 1;
            }
        }
        None => {
            for record in catalog.list_backups()? {
                if record.status != BackupStatus::Done {
                    continue;
                }
                if !validate_record(&catalog, record.start_time)? {
                    corrupt += 1;
                }
            }
        }
    }

    if corrupt > 0 {
        bail!("{corrupt} backup(s) failed validation");
    }
    Ok(())
}

/// Validate one backup while already holding the catalog lock; used by
/// `backup --validate` right after a backup completes.
pub fn validate_one(catalog: &Catalog, start_time: NaiveDateTime) -> anyhow::Result<()> {
    if !validate_record(catalog, start_time)? {
        bail!("backup failed validation");
    }
    Ok(())
}

/// Returns whether the backup is intact. Structural problems with the
/// catalog itself (unreadable file list) stay hard errors.
fn validate_record(catalog: &Catalog, start_time: NaiveDateTime) -> anyhow::Result<bool> {
    let mut record = catalog.read_backup(start_time)?;
    let id = record.id();
    if record.status != BackupStatus::Done {
        warn!("backup {id} is {} and can not be validated", record.status);
        return Ok(true);
    }

    let backup_dir = catalog.backup_dir(&id);
    let database_dir = catalog.database_dir(&id);
    let entries = read_file_list(&backup_dir.join(FILE_LIST_NAME))?;

    let mut intact = true;
    for entry in &entries {
        check_interrupt()?;
        if entry.is_dir() || entry.is_symlink() || entry.write_size == BYTES_INVALID {
            continue;
        }
        let path = database_dir.join(&entry.path);
        match recompute_crc(&path) {
            Ok((crc, len)) => {
                if crc != entry.crc || len != entry.write_size {
                    warn!(
                        "backup {id}: {} is damaged (crc {crc:08X}/{:08X}, size {len}/{})",
                        entry.path, entry.crc, entry.write_size
                    );
                    intact = false;
                }
            }
            Err(e) => {
                warn!("backup {id}: could not verify {}: {e:#}", entry.path);
                intact = false;
            }
        }
    }

    if intact {
        info!("backup {id} is valid");
    } else {
        record.status = BackupStatus::Corrupt;
        catalog.write_ini(&record)?;
        warn!("backup {id} is marked CORRUPT");
    }
    Ok(intact)
}
