//! Crash-safe file replacement.

use std::fs::{self, File};
use std::io::{self, Write};

use camino::{Utf8Path, Utf8PathBuf};

/// Suffix carried by in-flight replacement files until they are renamed
/// over the target.
pub const TEMP_FILE_SUFFIX: &str = "tmp";

fn temp_path_for(path: &Utf8Path) -> Utf8PathBuf {
    let mut tmp = path.to_owned();
    match path.extension() {
        Some(ext) => tmp.set_extension(format!("{ext}.{TEMP_FILE_SUFFIX}")),
        None => tmp.set_extension(TEMP_FILE_SUFFIX),
    };
    tmp
}

/// Replace the file at `path` with the given contents, atomically with
/// respect to concurrent readers: they observe either the previous version
/// or the new one, never a torn write.
///
/// The contents are written to a sibling temporary file first, fsynced,
/// renamed over the target, and the parent directory is fsynced so the
/// rename itself survives a crash.
pub fn overwrite(path: &Utf8Path, contents: &[u8]) -> io::Result<()> {
    let tmp_path = temp_path_for(path);
    let mut file = File::create(&tmp_path)?;
    file.write_all(contents)?;
    file.sync_all()?;
    drop(file);

    fs::rename(&tmp_path, path)?;

    let parent = path.parent().ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("{path:?} has no parent directory"),
        )
    })?;
    fsync_dir(parent)
}

/// fsync a directory so that entry creations and renames inside it are
/// durable.
pub fn fsync_dir(path: &Utf8Path) -> io::Result<()> {
    File::open(path)?.sync_all()
}

/// fsync a regular file by path.
pub fn fsync_file(path: &Utf8Path) -> io::Result<()> {
    File::open(path)?.sync_all()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overwrite_is_readable_back() {
        let dir = camino_tempfile::tempdir().unwrap();
        let target = dir.path().join("backup.ini");

        overwrite(&target, b"STATUS=RUNNING\n").unwrap();
        assert_eq!(fs::read(&target).unwrap(), b"STATUS=RUNNING\n");

        overwrite(&target, b"STATUS=DONE\n").unwrap();
        assert_eq!(fs::read(&target).unwrap(), b"STATUS=DONE\n");

        // No temporary file may survive a completed overwrite.
        let leftovers: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .filter(|n| n.to_string_lossy().ends_with(TEMP_FILE_SUFFIX))
            .collect();
        assert!(leftovers.is_empty(), "leftover temp files: {leftovers:?}");
    }

    #[test]
    fn temp_path_keeps_directory() {
        let tmp = temp_path_for(Utf8Path::new("/backup/20200101T000000/backup.ini"));
        assert_eq!(tmp, Utf8Path::new("/backup/20200101T000000/backup.ini.tmp"));
    }
}
