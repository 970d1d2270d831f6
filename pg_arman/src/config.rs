//! Engine configuration.
//!
//! Three layers, weakest first: the key=value file at
//! `$BACKUP_PATH/pg_arman.ini`, the environment (`PGDATA`, `BACKUP_PATH`,
//! `ARCLOG_PATH`), and explicit command-line flags. Every ini key is the
//! long name of an option; unknown keys and wrong-typed values are errors,
//! a line without `=` is warned about and skipped.

use std::fmt;
use std::fs;
use std::str::FromStr;

use anyhow::{bail, Context};
use camino::{Utf8Path, Utf8PathBuf};
use tracing::warn;

pub const INI_FILE_NAME: &str = "pg_arman.ini";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackupMode {
    /// Copy every file of the data directory.
    Full,
    /// Copy only pages whose LSN advanced past the parent full backup.
    Page,
}

impl FromStr for BackupMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.eq_ignore_ascii_case("full") {
            Ok(BackupMode::Full)
        } else if s.eq_ignore_ascii_case("page") {
            Ok(BackupMode::Page)
        } else {
            bail!("invalid backup-mode \"{s}\"");
        }
    }
}

impl fmt::Display for BackupMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackupMode::Full => f.write_str("FULL"),
            BackupMode::Page => f.write_str("PAGE"),
        }
    }
}

/// Merged option set a command runs with.
#[derive(Debug, Clone, Default)]
pub struct Config {
    pub pgdata: Option<Utf8PathBuf>,
    pub backup_path: Option<Utf8PathBuf>,
    pub arclog_path: Option<Utf8PathBuf>,

    pub backup_mode: Option<BackupMode>,
    pub smooth_checkpoint: bool,
    pub validate_after: bool,
    pub keep_data_generations: Option<i32>,
    pub keep_data_days: Option<i32>,
    pub check: bool,

    pub host: Option<String>,
    pub port: Option<String>,
    pub dbname: Option<String>,
    pub username: Option<String>,

    pub recovery_target_time: Option<String>,
    pub recovery_target_xid: Option<String>,
    pub recovery_target_inclusive: Option<bool>,
    pub recovery_target_timeline: Option<u32>,
}

fn parse_int32(name: &str, value: &str) -> anyhow::Result<i32> {
    value
        .parse::<i32>()
        .map_err(|_| anyhow::anyhow!("option --{name} should be a 32bit signed integer: '{value}'"))
}

fn parse_bool(name: &str, value: &str) -> anyhow::Result<bool> {
    match value.to_ascii_lowercase().as_str() {
        "true" | "on" | "yes" | "1" => Ok(true),
        "false" | "off" | "no" | "0" => Ok(false),
        _ => bail!("option --{name} should be a boolean: '{value}'"),
    }
}

impl Config {
    /// Read `$BACKUP_PATH/pg_arman.ini` if it exists.
    pub fn load_ini(backup_path: &Utf8Path) -> anyhow::Result<Config> {
        let path = backup_path.join(INI_FILE_NAME);
        let text = match fs::read_to_string(&path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Config::default()),
            Err(e) => return Err(e).with_context(|| format!("could not read {path}")),
        };
        Self::parse_ini(&text).with_context(|| format!("in configuration file {path}"))
    }

    pub fn parse_ini(text: &str) -> anyhow::Result<Config> {
        let mut config = Config::default();
        for raw_line in text.lines() {
            let line = raw_line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let Some((key, value)) = line.split_once('=') else {
                warn!("syntax error in \"{line}\"");
                continue;
            };
            let key = key.trim();
            if key.is_empty() {
                warn!("syntax error in \"{line}\"");
                continue;
            }
            let value = strip_value(value);
            config.apply_key(key, value)?;
        }
        Ok(config)
    }

    /// Set one option from its ini spelling. Keys are matched against the
    /// long option names, case-insensitively, with `_` and `-` equivalent.
    fn apply_key(&mut self, key: &str, value: &str) -> anyhow::Result<()> {
        let name = key.to_ascii_lowercase().replace('_', "-");
        match name.as_str() {
            "pgdata" => self.pgdata = Some(Utf8PathBuf::from(value)),
            "backup-path" => self.backup_path = Some(Utf8PathBuf::from(value)),
            "arclog-path" => self.arclog_path = Some(Utf8PathBuf::from(value)),
            "backup-mode" => self.backup_mode = Some(value.parse()?),
            "smooth-checkpoint" => self.smooth_checkpoint = parse_bool(&name, value)?,
            "validate" => self.validate_after = parse_bool(&name, value)?,
            "keep-data-generations" => {
                self.keep_data_generations = Some(parse_int32(&name, value)?)
            }
            "keep-data-days" => self.keep_data_days = Some(parse_int32(&name, value)?),
            "host" => self.host = Some(value.to_owned()),
            "port" => self.port = Some(value.to_owned()),
            "dbname" => self.dbname = Some(value.to_owned()),
            "username" => self.username = Some(value.to_owned()),
            "recovery-target-time" => self.recovery_target_time = Some(value.to_owned()),
            "recovery-target-xid" => self.recovery_target_xid = Some(value.to_owned()),
            "recovery-target-inclusive" => {
                self.recovery_target_inclusive = Some(parse_bool(&name, value)?)
            }
            "recovery-target-timeline" => {
                self.recovery_target_timeline = Some(parse_int32(&name, value)? as u32)
            }
            _ => bail!("invalid option \"{key}\""),
        }
        Ok(())
    }

    /// Defaults from the environment; sits between the ini file and the
    /// command line.
    pub fn from_env() -> Config {
        let path_var = |name: &str| std::env::var(name).ok().map(Utf8PathBuf::from);
        Config {
            pgdata: path_var("PGDATA"),
            backup_path: path_var("BACKUP_PATH"),
            arclog_path: path_var("ARCLOG_PATH"),
            ..Config::default()
        }
    }

    /// Overlay `stronger` on top of self: set options win, boolean switches
    /// accumulate.
    pub fn overlay(&mut self, stronger: &Config) {
        macro_rules! take {
            ($field:ident) => {
                if stronger.$field.is_some() {
                    self.$field = stronger.$field.clone();
                }
            };
        }
        take!(pgdata);
        take!(backup_path);
        take!(arclog_path);
        take!(backup_mode);
        take!(keep_data_generations);
        take!(keep_data_days);
        take!(host);
        take!(port);
        take!(dbname);
        take!(username);
        take!(recovery_target_time);
        take!(recovery_target_xid);
        take!(recovery_target_inclusive);
        take!(recovery_target_timeline);
        self.smooth_checkpoint |= stronger.smooth_checkpoint;
        self.validate_after |= stronger.validate_after;
        self.check |= stronger.check;
    }

    pub fn require_backup_path(&self) -> anyhow::Result<&Utf8Path> {
        match &self.backup_path {
            Some(path) => Ok(path),
            None => bail!("required parameter not specified: BACKUP_PATH (-B, --backup-path)"),
        }
    }

    pub fn require_pgdata(&self) -> anyhow::Result<&Utf8Path> {
        match &self.pgdata {
            Some(path) => Ok(path),
            None => bail!("required parameter not specified: PGDATA (-D, --pgdata)"),
        }
    }

    pub fn require_arclog_path(&self) -> anyhow::Result<&Utf8Path> {
        match &self.arclog_path {
            Some(path) => Ok(path),
            None => bail!("required parameter not specified: ARCLOG_PATH (-A, --arclog-path)"),
        }
    }

    pub fn require_backup_mode(&self) -> anyhow::Result<BackupMode> {
        match self.backup_mode {
            Some(mode) => Ok(mode),
            None => bail!("Required parameter not specified: BACKUP_MODE (-b, --backup-mode)"),
        }
    }
}

/// Strip optional surrounding quotes or a trailing comment from an ini
/// value.
fn strip_value(raw: &str) -> &str {
    let v = raw.trim();
    for quote in ['\'', '"'] {
        if v.len() >= 2 && v.starts_with(quote) && v.ends_with(quote) {
            return &v[1..v.len() - 1];
        }
    }
    match v.find('#') {
        Some(pos) => v[..pos].trim_end(),
        None => v,
    }
}
