//! Data-directory enumeration.
//!
//! Walks the cluster's data directory, skipping runtime-only state that
//! must not be captured, and tags the files that qualify for page-level
//! copying. Directories and symlinks are reported too: the restore side
//! recreates the tree before it copies any file into it.

use std::fs;
use std::io::{BufRead, BufReader, Write};
use std::os::unix::fs::MetadataExt;

use anyhow::{bail, Context};
use camino::{Utf8Path, Utf8PathBuf};
use walkdir::WalkDir;

use postgres_ffi::pg_constants::{
    PGDATA_EXCLUDE_CONTENTS, PGDATA_EXCLUDE_FILES, PG_TEMP_FILES_PREFIX,
};
use postgres_ffi::relfile_utils::parse_relfilename;
use utils::crashsafe;

/// `write_size` value meaning "nothing was written for this file": it
/// vanished between scan and copy, or copying never got to it.
pub const BYTES_INVALID: i64 = -1;

const S_IFMT: u32 = 0o170000;
const S_IFDIR: u32 = 0o040000;
const S_IFLNK: u32 = 0o120000;

/// One captured file, directory or symlink. Paths are relative to the
/// data-directory root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    pub path: Utf8PathBuf,
    /// POSIX mode bits, file-type bits included.
    pub mode: u32,
    pub size: i64,
    pub mtime: i64,
    /// CRC of the bytes written verbatim; 0 when not computed.
    pub crc: u32,
    /// Bytes actually written into the backup, or [`BYTES_INVALID`].
    pub write_size: i64,
    /// Qualifies for page-level copying.
    pub is_datafile: bool,
    /// Symlink target, kept only for scaffolding-script generation.
    pub link_target: Option<Utf8PathBuf>,
}

impl FileEntry {
    pub fn is_dir(&self) -> bool {
        self.mode & S_IFMT == S_IFDIR
    }

    pub fn is_symlink(&self) -> bool {
        self.mode & S_IFMT == S_IFLNK
    }
}

/// List the data directory, excluding runtime-only state.
///
/// Relation data files are the regular files under `base/`, `global/` and
/// `pg_tblspc/` whose name starts with a decimal digit and parses as a
/// relation file name.
pub fn scan_data_directory(pgdata: &Utf8Path) -> anyhow::Result<Vec<FileEntry>> {
    let mut entries = Vec::new();

    let walker = WalkDir::new(pgdata)
        .follow_links(false)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|e| {
            let name = e.file_name().to_string_lossy();
            if name.starts_with(PG_TEMP_FILES_PREFIX) {
                return false;
            }
            if e.file_type().is_file() && PGDATA_EXCLUDE_FILES.contains(&name.as_ref()) {
                return false;
            }
            // Excluded directories keep their entry but lose their contents:
            // filter out everything whose parent is on the exclusion list.
            if let Some(parent) = e.path().parent() {
                if let Ok(rel_parent) = parent.strip_prefix(pgdata) {
                    if let Some(rel_parent) = rel_parent.to_str() {
                        if PGDATA_EXCLUDE_CONTENTS.contains(&rel_parent) {
                            return false;
                        }
                    }
                }
            }
            true
        });

    for entry in walker {
        let entry = entry.context("could not list data directory")?;
        if entry.depth() == 0 {
            continue;
        }
        let path = Utf8Path::from_path(entry.path())
            .with_context(|| format!("non-UTF8 path in data directory: {:?}", entry.path()))?;
        let rel_path = path.strip_prefix(pgdata)?.to_owned();

        let meta = fs::symlink_metadata(path)
            .with_context(|| format!("could not stat {path}"))?;
        let link_target = if meta.file_type().is_symlink() {
            let target = fs::read_link(path)?;
            Some(
                Utf8PathBuf::from_path_buf(target)
                    .map_err(|t| anyhow::anyhow!("non-UTF8 symlink target {t:?}"))?,
            )
        } else {
            None
        };

        let is_datafile = meta.file_type().is_file() && is_relation_path(&rel_path);

        entries.push(FileEntry {
            path: rel_path,
            mode: meta.mode(),
            size: meta.size() as i64,
            mtime: meta.mtime(),
            crc: 0,
            write_size: BYTES_INVALID,
            is_datafile,
            link_target,
        });
    }

    Ok(entries)
}

fn is_relation_path(rel_path: &Utf8Path) -> bool {
    let mut components = rel_path.components();
    let top = match components.next() {
        Some(c) => c.as_str(),
        None => return false,
    };
    if !matches!(top, "base" | "global" | "pg_tblspc") {
        return false;
    }
    let Some(name) = rel_path.file_name() else {
        return false;
    };
    name.starts_with(|c: char| c.is_ascii_digit()) && parse_relfilename(name).is_ok()
}

/// Header line of `file_database.txt`, declaring the field order.
pub const FILE_LIST_HEADER: &str = "PATH\0MODE\0SIZE\0MTIME\0CRC\0WRITE_SIZE\0IS_DATAFILE\0";

/// Serialize the file list, one NUL-terminated field per column.
pub fn write_file_list(entries: &[FileEntry], path: &Utf8Path) -> anyhow::Result<()> {
    let mut out = Vec::new();
    out.extend_from_slice(FILE_LIST_HEADER.as_bytes());
    out.push(b'\n');
    for entry in entries {
        write!(
            out,
            "{}\0{:o}\0{}\0{}\0{:08X}\0{}\0{}\0\n",
            entry.path,
            entry.mode,
            entry.size,
            entry.mtime,
            entry.crc,
            entry.write_size,
            entry.is_datafile as u8,
        )?;
    }
    crashsafe::overwrite(path, &out).with_context(|| format!("could not write {path}"))?;
    Ok(())
}

pub fn read_file_list(path: &Utf8Path) -> anyhow::Result<Vec<FileEntry>> {
    let file = fs::File::open(path).with_context(|| format!("could not open {path}"))?;
    let mut entries = Vec::new();
    for (lineno, line) in BufReader::new(file).lines().enumerate() {
        let line = line?;
        if lineno == 0 {
            if line != FILE_LIST_HEADER {
                bail!("{path} has an unexpected header line");
            }
            continue;
        }
        if line.is_empty() {
            continue;
        }
        let fields: Vec<&str> = line.split('\0').collect();
        if fields.len() != 8 || !fields[7].is_empty() {
            bail!("{path}:{}: malformed file entry", lineno + 1);
        }
        entries.push(FileEntry {
            path: Utf8PathBuf::from(fields[0]),
            mode: u32::from_str_radix(fields[1], 8)
                .with_context(|| format!("{path}:{}: bad mode", lineno + 1))?,
            size: fields[2]
                .parse()
                .with_context(|| format!("{path}:{}: bad size", lineno + 1))?,
            mtime: fields[3]
                .parse()
                .with_context(|| format!("{path}:{}: bad mtime", lineno + 1))?,
            crc: u32::from_str_radix(fields[4], 16)
                .with_context(|| format!("{path}:{}: bad crc", lineno + 1))?,
            write_size: fields[5]
                .parse()
                .with_context(|| format!("{path}:{}: bad write size", lineno + 1))?,
            is_datafile: fields[6] == "1",
            link_target: None,
        });
    }
    Ok(entries)
}

/// Write the directory-scaffolding script: `mkdir -p` for every captured
/// directory and `ln -s` for every captured symlink, in walk order.
pub fn write_mkdirs_script(entries: &[FileEntry], path: &Utf8Path) -> anyhow::Result<()> {
    let mut script = String::from("#!/bin/sh\n\n");
    for entry in entries {
        if entry.is_dir() {
            script.push_str(&format!(
                "mkdir -p \"{}\" && chmod {:o} \"{}\"\n",
                entry.path,
                entry.mode & 0o7777,
                entry.path
            ));
        } else if entry.is_symlink() {
            if let Some(target) = &entry.link_target {
                script.push_str(&format!("ln -s \"{}\" \"{}\"\n", target, entry.path));
            }
        }
    }
    crashsafe::overwrite(path, script.as_bytes())
        .with_context(|| format!("could not write {path}"))?;
    Ok(())
}
