//! Driver for the database server's backup control primitives.
//!
//! All calls go over the native client protocol; one connection is opened
//! per operation and closed when the operation completes. The engine
//! refuses to run against a server whose version or block geometry differs
//! from what it was built against, and against a standby.

use std::time::Duration;

use anyhow::{bail, ensure, Context};
use camino::Utf8Path;
use chrono::NaiveDateTime;
use postgres::types::PgLsn;
use postgres::{Client, NoTls};
use tracing::info;

use postgres_ffi::pg_constants::{ARCHIVE_STATUS_DIR, RECOVERY_CONF_FILE};
use postgres_ffi::xlog_utils::{XLByteToPrevSeg, XLogFileName};
use postgres_ffi::{
    TimeLineID, BLCKSZ, PG_MAJORVERSION, PG_VERSION_NUM_MAX, PG_VERSION_NUM_MIN, WAL_SEGMENT_SIZE,
    XLOG_BLCKSZ,
};
use utils::lsn::Lsn;
use utils::signals::check_interrupt;

/// The archived segment must appear within this many seconds of the WAL
/// switch, or the backup fails.
pub const ARCHIVE_TIMEOUT: u64 = 10;

/// Connection options for the server; unset fields fall back to the usual
/// client environment variables, then to local defaults.
#[derive(Debug, Clone, Default)]
pub struct ConnectionConf {
    pub host: Option<String>,
    pub port: Option<String>,
    pub dbname: Option<String>,
    pub username: Option<String>,
}

/// What the version check learned about the live server.
#[derive(Debug, Clone, Copy)]
pub struct ServerInfo {
    pub version_num: i32,
    pub block_size: u32,
    pub wal_block_size: u32,
    pub timeline: TimeLineID,
}

impl ConnectionConf {
    fn client_config(&self) -> postgres::Config {
        let env = |name: &str| std::env::var(name).ok();
        let mut config = postgres::Config::new();
        config.host(
            self.host
                .clone()
                .or_else(|| env("PGHOST"))
                .unwrap_or_else(|| "localhost".to_owned())
                .as_str(),
        );
        if let Some(port) = self.port.clone().or_else(|| env("PGPORT")) {
            if let Ok(port) = port.parse::<u16>() {
                config.port(port);
            }
        }
        config.dbname(
            self.dbname
                .clone()
                .or_else(|| env("PGDATABASE"))
                .unwrap_or_else(|| "postgres".to_owned())
                .as_str(),
        );
        if let Some(user) = self
            .username
            .clone()
            .or_else(|| env("PGUSER"))
            .or_else(|| env("USER"))
        {
            config.user(user.as_str());
        }
        if let Some(password) = env("PGPASSWORD") {
            config.password(password.as_str());
        }
        config.connect_timeout(Duration::from_secs(10));
        config
    }

    fn connect(&self) -> anyhow::Result<Client> {
        self.client_config()
            .connect(NoTls)
            .context("could not connect to server")
    }

    /// Read the server version and block geometry and require them to
    /// match what the engine was built against.
    pub fn check_system(&self) -> anyhow::Result<ServerInfo> {
        let mut client = self.connect()?;

        let version_num: i32 = current_setting(&mut client, "server_version_num")?
            .parse()
            .context("unparsable server_version_num")?;
        if !(PG_VERSION_NUM_MIN..PG_VERSION_NUM_MAX).contains(&version_num) {
            bail!(
                "server version {version_num} does not match the PostgreSQL {PG_MAJORVERSION} \
                 this binary was built against"
            );
        }

        let block_size: u32 = current_setting(&mut client, "block_size")?.parse()?;
        ensure!(
            block_size == u32::from(BLCKSZ),
            "server block_size {block_size} does not match the built-in {BLCKSZ}"
        );
        let wal_block_size: u32 = current_setting(&mut client, "wal_block_size")?.parse()?;
        ensure!(
            wal_block_size as usize == XLOG_BLCKSZ,
            "server wal_block_size {wal_block_size} does not match the built-in {XLOG_BLCKSZ}"
        );

        let timeline: i32 = client
            .query_one("SELECT timeline_id FROM pg_control_checkpoint()", &[])?
            .get(0);

        Ok(ServerInfo {
            version_num,
            block_size,
            wal_block_size,
            timeline: timeline as TimeLineID,
        })
    }

    /// Begin an exclusive server-side backup; the server flushes dirty
    /// buffers (immediately unless a smooth checkpoint was requested) and
    /// writes the backup-label file. Returns the start position.
    pub fn start_backup(&self, label: &str, smooth_checkpoint: bool) -> anyhow::Result<Lsn> {
        let mut client = self.connect()?;
        let row = client
            .query_one(
                "SELECT pg_start_backup($1, $2, true)",
                &[&label, &!smooth_checkpoint],
            )
            .context("pg_start_backup failed")?;
        let lsn: PgLsn = row.get(0);
        Ok(Lsn(u64::from(lsn)))
    }

    /// Finish the exclusive backup: removes the backup label and makes the
    /// server archive the partially-filled final segment. Returns the stop
    /// position.
    pub fn stop_backup(&self) -> anyhow::Result<Lsn> {
        let mut client = self.connect()?;
        let row = client
            .query_one("SELECT pg_stop_backup()", &[])
            .context("pg_stop_backup failed")?;
        let lsn: PgLsn = row.get(0);
        Ok(Lsn(u64::from(lsn)))
    }

    /// Force a WAL switch so everything written so far becomes archivable.
    pub fn force_switch(&self) -> anyhow::Result<Lsn> {
        let mut client = self.connect()?;
        let row = client
            .query_one("SELECT pg_switch_wal()", &[])
            .context("pg_switch_wal failed")?;
        let lsn: PgLsn = row.get(0);
        Ok(Lsn(u64::from(lsn)))
    }

    /// The current transaction id, recorded as the recovery-target XID.
    pub fn current_txid(&self) -> anyhow::Result<u32> {
        let mut client = self.connect()?;
        let txid: i64 = client.query_one("SELECT txid_current()", &[])?.get(0);
        Ok(txid as u32)
    }

    /// Server wall-clock time, recorded as the recovery time.
    pub fn current_time(&self) -> anyhow::Result<NaiveDateTime> {
        let mut client = self.connect()?;
        let epoch: i64 = client
            .query_one("SELECT extract(epoch FROM now())::bigint", &[])?
            .get(0);
        chrono::DateTime::from_timestamp(epoch, 0)
            .map(|dt| dt.naive_utc())
            .ok_or_else(|| anyhow::anyhow!("server reported an out-of-range timestamp"))
    }
}

fn current_setting(client: &mut Client, name: &str) -> anyhow::Result<String> {
    let row = client
        .query_one("SELECT current_setting($1)", &[&name])
        .with_context(|| format!("could not read current_setting('{name}')"))?;
    Ok(row.get(0))
}

/// Probe for a path, treating only "does not exist" as absence. A
/// permission failure on the probe is an error, not an answer.
pub fn file_exists(path: &Utf8Path) -> anyhow::Result<bool> {
    match std::fs::metadata(path) {
        Ok(_) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e).with_context(|| format!("could not stat {path}")),
    }
}

/// A standby keeps a recovery configuration in its data directory; backups
/// must run against the primary.
pub fn is_standby(pgdata: &Utf8Path) -> anyhow::Result<bool> {
    file_exists(&pgdata.join(RECOVERY_CONF_FILE))
}

/// Wait for the archiver to pick up the last segment before `switch_lsn`:
/// the `.ready` marker under the archive-status directory disappears when
/// archival completes. Polls once a second, up to [`ARCHIVE_TIMEOUT`].
pub fn wait_for_archive(
    pgdata: &Utf8Path,
    switch_lsn: Lsn,
    tli: TimeLineID,
) -> anyhow::Result<String> {
    let segno = XLByteToPrevSeg(switch_lsn, WAL_SEGMENT_SIZE);
    let fname = XLogFileName(tli, segno, WAL_SEGMENT_SIZE);
    let ready = pgdata
        .join(ARCHIVE_STATUS_DIR)
        .join(format!("{fname}.ready"));

    info!("waiting for WAL segment {fname} to be archived");
    for _ in 0..ARCHIVE_TIMEOUT {
        check_interrupt()?;
        if !file_exists(&ready)? {
            return Ok(fname);
        }
        std::thread::sleep(Duration::from_secs(1));
    }
    bail!("switched WAL segment {fname} was not archived within {ARCHIVE_TIMEOUT} seconds");
}
