//! The show command: the catalog as a table, or one record in detail.
//!
//! Reads without taking the catalog lock; manifests are replaced by
//! rename, so a concurrent backup can not expose a torn record here.

use crate::catalog::{parse_date, BackupRecord, Catalog, FILE_LIST_NAME};
use crate::config::Config;
use crate::dirscan::read_file_list;

pub fn do_show(config: &Config, date: Option<&str>) -> anyhow::Result<()> {
    let backup_path = config.require_backup_path()?;
    let catalog = Catalog::new(backup_path);

    match date {
        Some(date) => {
            let start_time = parse_date(date)?;
            let record = catalog.read_backup(start_time)?;
            show_detail(&catalog, &record)
        }
        None => {
            let records = catalog.list_backups()?;
            show_list(&records);
            Ok(())
        }
    }
}

fn show_list(records: &[BackupRecord]) {
    println!(
        "{:=<width$}",
        "",
        width = 19 + 2 + 4 + 2 + 3 + 2 + 10 + 2 + 10 + 2 + 8 + 2 + 8 + 2 + 7
    );
    println!(
        "{:<19}  {:<4}  {:>3}  {:>10}  {:>10}  {:>8}  {:>8}  {:<7}",
        "Start", "Mode", "TLI", "Start LSN", "Stop LSN", "Time", "Data", "Status"
    );
    println!(
        "{:=<width$}",
        "",
        width = 19 + 2 + 4 + 2 + 3 + 2 + 10 + 2 + 10 + 2 + 8 + 2 + 8 + 2 + 7
    );
    for record in records {
        let duration = match record.end_time {
            Some(end) => {
                let secs = end.signed_duration_since(record.start_time).num_seconds();
                format!("{secs}s")
            }
            None => "----".to_owned(),
        };
        println!(
            "{:<19}  {:<4}  {:>3}  {:>10}  {:>10}  {:>8}  {:>8}  {:<7}",
            record.start_time.format("%Y-%m-%d %H:%M:%S"),
            record.mode.to_string(),
            record.tli,
            record.start_lsn.to_string(),
            record.stop_lsn.to_string(),
            duration,
            format_bytes(record.write_bytes),
            record.status.to_string(),
        );
    }
}

fn show_detail(catalog: &Catalog, record: &BackupRecord) -> anyhow::Result<()> {
    println!("# backup {}", record.id());
    println!("BACKUP_MODE={}", record.mode);
    println!("STATUS={}", record.status);
    println!("TIMELINEID={}", record.tli);
    println!("START_LSN={}", record.start_lsn);
    println!("STOP_LSN={}", record.stop_lsn);
    println!("START_TIME='{}'", record.start_time.format("%Y-%m-%d %H:%M:%S"));
    if let Some(end_time) = record.end_time {
        println!("END_TIME='{}'", end_time.format("%Y-%m-%d %H:%M:%S"));
    }
    println!("RECOVERY_XID={}", record.recovery_xid);
    if let Some(recovery_time) = record.recovery_time {
        println!("RECOVERY_TIME='{}'", recovery_time.format("%Y-%m-%d %H:%M:%S"));
    }
    println!("BLOCK_SIZE={}", record.block_size);
    println!("XLOG_BLOCK_SIZE={}", record.wal_block_size);
    println!("DATA_BYTES={}", record.data_bytes);
    println!("WRITE_BYTES={}", record.write_bytes);

    let list_path = catalog.backup_dir(&record.id()).join(FILE_LIST_NAME);
    if let Ok(entries) = read_file_list(&list_path) {
        println!("FILES={}", entries.len());
    }
    Ok(())
}

fn format_bytes(bytes: i64) -> String {
    const UNITS: [&str; 4] = ["B", "kB", "MB", "GB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes}B")
    } else {
        format!("{value:.1}{}", UNITS[unit])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bytes_formatting() {
        assert_eq!(format_bytes(0), "0B");
        assert_eq!(format_bytes(512), "512B");
        assert_eq!(format_bytes(2048), "2.0kB");
        assert_eq!(format_bytes(54 * 1024 * 1024), "54.0MB");
    }
}
