//!
//! Command-line entry point.
//!
//! Option values come from three layers: `$BACKUP_PATH/pg_arman.ini`,
//! the environment, and the flags below, strongest last. Validation of
//! required parameters happens in the commands so the diagnostics name the
//! missing option, not clap's idea of it.
//!

use std::process::exit;

use camino::Utf8PathBuf;
use clap::{Parser, Subcommand};
use tracing_subscriber::filter::LevelFilter;

use pg_arman::catalog::{do_init, CatalogLocked};
use pg_arman::config::Config;
use pg_arman::{
    backup, delete, restore, show, validate, EXIT_ALREADY_RUNNING, EXIT_ERROR, PROGRAM_NAME,
    PROGRAM_VERSION,
};
use utils::logging;
use utils::signals::install_interrupt_handlers;

#[derive(Parser)]
#[command(
    name = PROGRAM_NAME,
    version = PROGRAM_VERSION,
    about = "backup and recovery manager for PostgreSQL",
    disable_help_flag = true
)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// print help
    #[allow(dead_code)]
    #[arg(long = "help", global = true, action = clap::ArgAction::HelpLong)]
    help: Option<bool>,

    /// location of the database cluster's data directory
    #[arg(short = 'D', long = "pgdata", global = true, value_name = "PATH")]
    pgdata: Option<Utf8PathBuf>,

    /// location of the backup catalog
    #[arg(short = 'B', long = "backup-path", global = true, value_name = "PATH")]
    backup_path: Option<Utf8PathBuf>,

    /// location of the WAL archive
    #[arg(short = 'A', long = "arclog-path", global = true, value_name = "PATH")]
    arclog_path: Option<Utf8PathBuf>,

    /// dry run: validate and report, change nothing
    #[arg(short = 'c', long = "check", global = true)]
    check: bool,

    /// database name to connect with
    #[arg(short = 'd', long = "dbname", global = true)]
    dbname: Option<String>,

    /// database server host or socket directory
    #[arg(short = 'h', long = "host", global = true)]
    host: Option<String>,

    /// database server port
    #[arg(short = 'p', long = "port", global = true)]
    port: Option<String>,

    /// database user name
    #[arg(short = 'U', long = "username", global = true)]
    username: Option<String>,

    /// never prompt for a password (passwords come from PGPASSWORD)
    #[arg(short = 'w', long = "no-password", global = true)]
    no_password: bool,

    /// prompt for a password (unsupported; use PGPASSWORD)
    #[arg(short = 'W', long = "password", global = true)]
    password: bool,

    /// log only errors
    #[arg(short = 'q', long = "quiet", global = true, conflicts_with = "verbose")]
    quiet: bool,

    /// log debug detail
    #[arg(short = 'v', long = "verbose", global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Command {
    /// Initialize the backup catalog
    Init,
    /// Take a backup of the data directory
    Backup {
        /// backup mode: full or page
        #[arg(short = 'b', long = "backup-mode", value_name = "MODE")]
        backup_mode: Option<String>,
        /// spread the checkpoint out instead of forcing it immediately
        #[arg(short = 'C', long = "smooth-checkpoint")]
        smooth_checkpoint: bool,
        /// validate the backup right after taking it
        #[arg(long = "validate")]
        validate: bool,
        /// retention: number of full-backup generations to keep
        #[arg(long = "keep-data-generations", value_name = "N")]
        keep_data_generations: Option<i32>,
        /// retention: keep backups younger than this many days
        #[arg(long = "keep-data-days", value_name = "DAYS")]
        keep_data_days: Option<i32>,
    },
    /// Restore the data directory from the catalog
    Restore {
        #[arg(long = "recovery-target-time", value_name = "TIME")]
        recovery_target_time: Option<String>,
        #[arg(long = "recovery-target-xid", value_name = "XID")]
        recovery_target_xid: Option<String>,
        #[arg(long = "recovery-target-inclusive", value_name = "BOOL")]
        recovery_target_inclusive: Option<bool>,
        #[arg(long = "recovery-target-timeline", value_name = "TLI")]
        recovery_target_timeline: Option<u32>,
    },
    /// Show backups in the catalog
    Show { date: Option<String> },
    /// Verify backup files against their recorded checksums
    Validate { date: Option<String> },
    /// Drop backups older than the date and prune archived WAL
    Delete { date: Option<String> },
}

fn main() {
    let cli = Cli::parse();

    let level = if cli.quiet {
        LevelFilter::ERROR
    } else if cli.verbose {
        LevelFilter::DEBUG
    } else {
        LevelFilter::INFO
    };
    if let Err(e) = logging::init(level) {
        eprintln!("ERROR: {e:#}");
        exit(EXIT_ERROR);
    }
    if let Err(e) = install_interrupt_handlers() {
        eprintln!("ERROR: {e:#}");
        exit(EXIT_ERROR);
    }

    // -w is already the default behavior: passwords only ever come from
    // the client environment.
    if cli.password && !cli.no_password {
        tracing::warn!("password prompts are not supported; set PGPASSWORD instead");
    }

    match run(cli) {
        Ok(()) => {}
        Err(e) => {
            eprintln!("ERROR: {e:#}");
            let code = if e.is::<CatalogLocked>() {
                EXIT_ALREADY_RUNNING
            } else {
                EXIT_ERROR
            };
            exit(code);
        }
    }
}

fn run(cli: Cli) -> anyhow::Result<()> {
    let config = merge_config(&cli)?;
    match &cli.command {
        Command::Init => do_init(&config),
        Command::Backup { .. } => backup::do_backup(&config),
        Command::Restore { .. } => restore::do_restore(&config),
        Command::Show { date } => show::do_show(&config, date.as_deref()),
        Command::Validate { date } => validate::do_validate(&config, date.as_deref()),
        Command::Delete { date } => delete::do_delete(&config, date.as_deref()),
    }
}

/// ini file, then environment, then flags.
fn merge_config(cli: &Cli) -> anyhow::Result<Config> {
    let env = Config::from_env();

    let mut flags = Config {
        pgdata: cli.pgdata.clone(),
        backup_path: cli.backup_path.clone(),
        arclog_path: cli.arclog_path.clone(),
        host: cli.host.clone(),
        port: cli.port.clone(),
        dbname: cli.dbname.clone(),
        username: cli.username.clone(),
        check: cli.check,
        ..Config::default()
    };
    match &cli.command {
        Command::Backup {
            backup_mode,
            smooth_checkpoint,
            validate,
            keep_data_generations,
            keep_data_days,
        } => {
            flags.backup_mode = backup_mode.as_deref().map(str::parse).transpose()?;
            flags.smooth_checkpoint = *smooth_checkpoint;
            flags.validate_after = *validate;
            flags.keep_data_generations = *keep_data_generations;
            flags.keep_data_days = *keep_data_days;
        }
        Command::Restore {
            recovery_target_time,
            recovery_target_xid,
            recovery_target_inclusive,
            recovery_target_timeline,
        } => {
            flags.recovery_target_time = recovery_target_time.clone();
            flags.recovery_target_xid = recovery_target_xid.clone();
            flags.recovery_target_inclusive = *recovery_target_inclusive;
            flags.recovery_target_timeline = *recovery_target_timeline;
        }
        _ => {}
    }

    // The ini file lives under the backup path, which the flags or the
    // environment must reveal first.
    let backup_path = flags.backup_path.clone().or_else(|| env.backup_path.clone());
    let mut config = match &backup_path {
        Some(path) => Config::load_ini(path)?,
        None => Config::default(),
    };
    config.overlay(&env);
    config.overlay(&flags);
    Ok(config)
}
