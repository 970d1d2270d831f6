//! Copying data files into and out of a backup.
//!
//! Two write modes: verbatim (the byte stream, with a CRC over it) and
//! delta (only the blocks whose page LSN advanced past the parent backup's
//! start position, or which the WAL scan marked dirty). A delta file is
//! self-describing: a short header with a magic number and the block size,
//! then `(blockno, page, checksum)` records in ascending block order,
//! terminated by an all-ones block number. The restorer tells the two
//! kinds apart by the magic.

use std::collections::BTreeSet;
use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, BufWriter, ErrorKind, Read, Seek, SeekFrom, Write};
use std::os::unix::fs::PermissionsExt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{bail, ensure, Context};
use camino::Utf8Path;

use postgres_ffi::page::{page_is_new, page_lsn};
use postgres_ffi::{BlockNumber, BLCKSZ};
use utils::lsn::Lsn;
use utils::signals::check_interrupt;

use crate::dirscan::{FileEntry, BYTES_INVALID};

pub const DELTA_MAGIC: [u8; 4] = *b"ARMN";
pub const DELTA_FORMAT_VERSION: u32 = 1;
/// Terminates the block-record sequence; no real block number reaches it.
pub const DELTA_END_MARKER: u32 = 0xFFFF_FFFF;

const COPY_BUF_SIZE: usize = 64 * 1024;

/// Bytes read from the source during one copy.
pub struct CopyStats {
    pub read_bytes: i64,
}

/// A file's mtime equal to the current wall-clock second means writes
/// bearing that mtime may still be in flight on a second-resolution
/// filesystem: stall to the next second before copying. An mtime in the
/// future means the clock was set back, and the LSN-based delta criterion
/// cannot be trusted.
fn wait_out_mtime_second(path: &Utf8Path, mtime: i64) -> anyhow::Result<()> {
    loop {
        let now = SystemTime::now().duration_since(UNIX_EPOCH)?;
        let now_secs = now.as_secs() as i64;
        if mtime > now_secs {
            bail!(
                "{path} is modified in the future ({mtime} > {now_secs}); \
                 the system clock may have been set back, retry with a full backup"
            );
        }
        if mtime < now_secs {
            return Ok(());
        }
        std::thread::sleep(Duration::from_micros(
            1_000_000 - u64::from(now.subsec_micros()),
        ));
    }
}

fn open_source(path: &Utf8Path) -> anyhow::Result<Option<File>> {
    match File::open(path) {
        Ok(file) => Ok(Some(file)),
        // Vanished between scan and copy: a dropped relation, not an error.
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e).with_context(|| format!("could not open {path}")),
    }
}

fn prepare_destination(dst: &Utf8Path, mode: u32) -> anyhow::Result<File> {
    if let Some(parent) = dst.parent() {
        fs::create_dir_all(parent).with_context(|| format!("could not create {parent}"))?;
    }
    let file = File::create(dst).with_context(|| format!("could not create {dst}"))?;
    fs::set_permissions(dst, fs::Permissions::from_mode(mode & 0o7777))?;
    Ok(file)
}

/// Copy the whole byte stream of `entry` from under `src_root` to the same
/// relative path under `dst_root`. Returns `None` if the source vanished
/// (recorded as skipped, not an error).
pub fn copy_file_verbatim(
    src_root: &Utf8Path,
    dst_root: &Utf8Path,
    entry: &mut FileEntry,
) -> anyhow::Result<Option<CopyStats>> {
    let src_path = src_root.join(&entry.path);
    let Some(src) = open_source(&src_path)? else {
        entry.write_size = BYTES_INVALID;
        return Ok(None);
    };

    let meta = src.metadata()?;
    entry.mtime = meta.modified()?.duration_since(UNIX_EPOCH)?.as_secs() as i64;
    wait_out_mtime_second(&src_path, entry.mtime)?;

    let dst_path = dst_root.join(&entry.path);
    let dst = prepare_destination(&dst_path, entry.mode)?;

    let mut reader = BufReader::new(src);
    let mut writer = BufWriter::new(dst);
    let mut buf = [0u8; COPY_BUF_SIZE];
    let mut crc = 0u32;
    let mut copied: i64 = 0;
    loop {
        check_interrupt()?;
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        crc = crc32c::crc32c_append(crc, &buf[..n]);
        writer.write_all(&buf[..n])?;
        copied += n as i64;
    }
    writer.flush()?;
    writer.get_ref().sync_all()?;

    entry.size = copied;
    entry.crc = crc;
    entry.write_size = copied;
    Ok(Some(CopyStats { read_bytes: copied }))
}

/// Copy only the blocks of a relation segment that changed since the
/// parent backup: a block is emitted if its page LSN is at or past
/// `parent_start_lsn`, or if the WAL scan marked it in `dirty`.
pub fn copy_file_delta(
    src_root: &Utf8Path,
    dst_root: &Utf8Path,
    entry: &mut FileEntry,
    parent_start_lsn: Lsn,
    dirty: Option<&BTreeSet<BlockNumber>>,
) -> anyhow::Result<Option<CopyStats>> {
    let src_path = src_root.join(&entry.path);
    let Some(src) = open_source(&src_path)? else {
        entry.write_size = BYTES_INVALID;
        return Ok(None);
    };

    let meta = src.metadata()?;
    entry.mtime = meta.modified()?.duration_since(UNIX_EPOCH)?.as_secs() as i64;
    wait_out_mtime_second(&src_path, entry.mtime)?;

    let dst_path = dst_root.join(&entry.path);
    let dst = prepare_destination(&dst_path, entry.mode)?;

    let mut reader = BufReader::new(src);
    let mut writer = BufWriter::new(dst);
    let mut crc = 0u32;
    let mut written: i64 = 0;
    let mut read_bytes: i64 = 0;

    let mut emit = |writer: &mut BufWriter<File>, bytes: &[u8]| -> std::io::Result<()> {
        crc = crc32c::crc32c_append(crc, bytes);
        written += bytes.len() as i64;
        writer.write_all(bytes)
    };

    emit(&mut writer, &DELTA_MAGIC)?;
    emit(&mut writer, &u32::from(BLCKSZ).to_le_bytes())?;
    emit(&mut writer, &DELTA_FORMAT_VERSION.to_le_bytes())?;

    let mut page = vec![0u8; BLCKSZ as usize];
    let mut blkno: BlockNumber = 0;
    loop {
        check_interrupt()?;
        let n = read_full(&mut reader, &mut page)?;
        if n == 0 {
            break;
        }
        if n < page.len() {
            // A torn tail block: the server is extending the file under
            // us. WAL replay past the stop position recreates it.
            read_bytes += n as i64;
            break;
        }
        read_bytes += n as i64;

        // A freshly-extended page that was never written carries nothing;
        // WAL replay past the parent recreates it. Everything else is
        // emitted if its LSN advanced or the WAL scan named it.
        let changed = !page_is_new(&page)
            && (page_lsn(&page) >= parent_start_lsn
                || dirty.map_or(false, |blocks| blocks.contains(&blkno)));
        if changed {
            emit(&mut writer, &blkno.to_le_bytes())?;
            emit(&mut writer, &page)?;
            let page_crc = crc32c::crc32c(&page);
            emit(&mut writer, &page_crc.to_le_bytes())?;
        }
        blkno += 1;
    }
    emit(&mut writer, &DELTA_END_MARKER.to_le_bytes())?;
    writer.flush()?;
    writer.get_ref().sync_all()?;

    entry.size = read_bytes;
    entry.crc = crc;
    entry.write_size = written;
    Ok(Some(CopyStats { read_bytes }))
}

/// Read until `buf` is full or EOF; returns the number of bytes read.
fn read_full(reader: &mut impl Read, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut total = 0;
    while total < buf.len() {
        let n = reader.read(&mut buf[total..])?;
        if n == 0 {
            break;
        }
        total += n;
    }
    Ok(total)
}

/// Does this backup file carry the delta header, or is it a verbatim copy?
pub fn is_delta_file(path: &Utf8Path) -> anyhow::Result<bool> {
    let mut file = match File::open(path) {
        Ok(f) => f,
        Err(e) => return Err(e).with_context(|| format!("could not open {path}")),
    };
    let mut magic = [0u8; 4];
    match file.read_exact(&mut magic) {
        Ok(()) => Ok(magic == DELTA_MAGIC),
        Err(e) if e.kind() == ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(e.into()),
    }
}

/// Apply a delta file onto `target`: every recorded block overwrites the
/// block at the same offset; blocks the delta does not mention keep the
/// contents the parent chain put there.
pub fn apply_delta_file(delta_path: &Utf8Path, target_path: &Utf8Path) -> anyhow::Result<()> {
    let mut reader = BufReader::new(
        File::open(delta_path).with_context(|| format!("could not open {delta_path}"))?,
    );

    let mut header = [0u8; 12];
    reader
        .read_exact(&mut header)
        .with_context(|| format!("{delta_path} is truncated"))?;
    ensure!(
        header[0..4] == DELTA_MAGIC,
        "{delta_path} is not a delta file"
    );
    let blcksz = u32::from_le_bytes(header[4..8].try_into().unwrap());
    ensure!(
        blcksz == u32::from(BLCKSZ),
        "{delta_path} was taken with block size {blcksz}"
    );
    let version = u32::from_le_bytes(header[8..12].try_into().unwrap());
    ensure!(
        version == DELTA_FORMAT_VERSION,
        "{delta_path} has unsupported format version {version}"
    );

    if let Some(parent) = target_path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut target = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .open(target_path)
        .with_context(|| format!("could not open {target_path}"))?;

    let mut page = vec![0u8; BLCKSZ as usize];
    loop {
        check_interrupt()?;
        let mut word = [0u8; 4];
        reader
            .read_exact(&mut word)
            .with_context(|| format!("{delta_path} is missing its end marker"))?;
        let blkno = u32::from_le_bytes(word);
        if blkno == DELTA_END_MARKER {
            break;
        }
        reader
            .read_exact(&mut page)
            .with_context(|| format!("{delta_path}: truncated block {blkno}"))?;
        reader
            .read_exact(&mut word)
            .with_context(|| format!("{delta_path}: truncated checksum of block {blkno}"))?;
        let stored_crc = u32::from_le_bytes(word);
        let crc = crc32c::crc32c(&page);
        ensure!(
            crc == stored_crc,
            "{delta_path}: checksum mismatch on block {blkno}"
        );

        target.seek(SeekFrom::Start(u64::from(blkno) * u64::from(BLCKSZ)))?;
        target.write_all(&page)?;
    }
    target.sync_all()?;
    Ok(())
}

/// Recompute the CRC over a backup file's byte stream, for validation
/// against the recorded file-list entry.
pub fn recompute_crc(path: &Utf8Path) -> anyhow::Result<(u32, i64)> {
    let file = File::open(path).with_context(|| format!("could not open {path}"))?;
    let mut reader = BufReader::new(file);
    let mut buf = [0u8; COPY_BUF_SIZE];
    let mut crc = 0u32;
    let mut len: i64 = 0;
    loop {
        check_interrupt()?;
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        crc = crc32c::crc32c_append(crc, &buf[..n]);
        len += n as i64;
    }
    Ok((crc, len))
}

#[cfg(test)]
mod tests {
    use super::*;
    use camino::Utf8PathBuf;
    use postgres_ffi::page::set_page_lsn;

    fn entry_for(path: &str, mode: u32) -> FileEntry {
        FileEntry {
            path: Utf8PathBuf::from(path),
            mode,
            size: 0,
            mtime: 0,
            crc: 0,
            write_size: BYTES_INVALID,
            is_datafile: true,
            link_target: None,
        }
    }

    fn make_page(lsn: Lsn, fill: u8) -> Vec<u8> {
        let mut page = vec![fill; BLCKSZ as usize];
        set_page_lsn(&mut page, lsn);
        page
    }

    /// Make the file's mtime stale so the same-second stall does not fire.
    fn age(path: &Utf8Path) {
        let old = SystemTime::now() - Duration::from_secs(10);
        let f = File::options().append(true).open(path).unwrap();
        f.set_modified(old).unwrap();
    }

    #[test]
    fn verbatim_copy_records_crc() {
        let dir = camino_tempfile::tempdir().unwrap();
        let src_root = dir.path().join("pgdata");
        let dst_root = dir.path().join("backup");
        fs::create_dir_all(&src_root).unwrap();

        let contents = b"cluster configuration".to_vec();
        fs::write(src_root.join("postgresql.conf"), &contents).unwrap();
        age(&src_root.join("postgresql.conf"));

        let mut entry = entry_for("postgresql.conf", 0o100600);
        let stats = copy_file_verbatim(&src_root, &dst_root, &mut entry)
            .unwrap()
            .expect("source exists");

        assert_eq!(stats.read_bytes, contents.len() as i64);
        assert_eq!(entry.write_size, contents.len() as i64);
        assert_eq!(entry.crc, crc32c::crc32c(&contents));
        assert_eq!(fs::read(dst_root.join("postgresql.conf")).unwrap(), contents);
    }

    #[test]
    fn verbatim_copy_skips_vanished_file() {
        let dir = camino_tempfile::tempdir().unwrap();
        let src_root = dir.path().join("pgdata");
        let dst_root = dir.path().join("backup");
        fs::create_dir_all(&src_root).unwrap();

        let mut entry = entry_for("base/13000/99999", 0o100600);
        let result = copy_file_verbatim(&src_root, &dst_root, &mut entry).unwrap();
        assert!(result.is_none());
        assert_eq!(entry.write_size, BYTES_INVALID);
    }

    #[test]
    fn delta_roundtrip_reconstructs_source() {
        let dir = camino_tempfile::tempdir().unwrap();
        let src_root = dir.path().join("pgdata");
        let dst_root = dir.path().join("backup");
        fs::create_dir_all(src_root.join("base/13000")).unwrap();

        let parent_lsn = Lsn(0x0100_0000);

        // Four blocks: 0 and 3 unchanged since the parent, 1 advanced past
        // the parent LSN, 2 unchanged by LSN but named dirty by the WAL.
        let pages = [
            make_page(Lsn(0x0050_0000), 0x11),
            make_page(Lsn(0x0150_0000), 0x22),
            make_page(Lsn(0x0060_0000), 0x33),
            make_page(Lsn(0x0070_0000), 0x44),
        ];
        let source: Vec<u8> = pages.concat();
        let src_file = src_root.join("base/13000/16384");
        fs::write(&src_file, &source).unwrap();
        age(&src_file);

        let mut dirty = BTreeSet::new();
        dirty.insert(2u32);

        let mut entry = entry_for("base/13000/16384", 0o100600);
        let stats = copy_file_delta(&src_root, &dst_root, &mut entry, parent_lsn, Some(&dirty))
            .unwrap()
            .expect("source exists");
        assert_eq!(stats.read_bytes, source.len() as i64);
        // header + two blocks + end marker
        let expected_len = 12 + 2 * (4 + BLCKSZ as i64 + 4) + 4;
        assert_eq!(entry.write_size, expected_len);

        let delta_file = dst_root.join("base/13000/16384");
        assert!(is_delta_file(&delta_file).unwrap());

        // The "parent" restore state: blocks 1 and 2 still hold their old
        // contents; applying the delta must reproduce the source exactly.
        let restored = dir.path().join("restore/base/13000/16384");
        fs::create_dir_all(restored.parent().unwrap()).unwrap();
        let mut parent_state = Vec::new();
        parent_state.extend_from_slice(&pages[0]);
        parent_state.extend_from_slice(&make_page(Lsn(0x0040_0000), 0xAA));
        parent_state.extend_from_slice(&make_page(Lsn(0x0040_0000), 0xBB));
        parent_state.extend_from_slice(&pages[3]);
        fs::write(&restored, &parent_state).unwrap();

        apply_delta_file(&delta_file, &restored).unwrap();
        assert_eq!(fs::read(&restored).unwrap(), source);
    }

    #[test]
    fn delta_skips_never_initialized_pages() {
        let dir = camino_tempfile::tempdir().unwrap();
        let src_root = dir.path().join("pgdata");
        let dst_root = dir.path().join("backup");
        fs::create_dir_all(src_root.join("base/13000")).unwrap();

        // Block 0 changed; block 1 was extended but never written, and
        // stays out of the delta even though the WAL scan named it.
        let mut source = make_page(Lsn(0x0200_0000), 0x11);
        source.extend_from_slice(&vec![0u8; BLCKSZ as usize]);
        let src_file = src_root.join("base/13000/16384");
        fs::write(&src_file, &source).unwrap();
        age(&src_file);

        let mut dirty = BTreeSet::new();
        dirty.insert(1u32);

        let mut entry = entry_for("base/13000/16384", 0o100600);
        copy_file_delta(
            &src_root,
            &dst_root,
            &mut entry,
            Lsn(0x0100_0000),
            Some(&dirty),
        )
        .unwrap()
        .unwrap();

        // header + one block + end marker
        assert_eq!(entry.write_size, 12 + (4 + BLCKSZ as i64 + 4) + 4);
    }

    #[test]
    fn delta_apply_rejects_corrupt_block() {
        let dir = camino_tempfile::tempdir().unwrap();
        let src_root = dir.path().join("pgdata");
        let dst_root = dir.path().join("backup");
        fs::create_dir_all(src_root.join("base/13000")).unwrap();

        let src_file = src_root.join("base/13000/16384");
        fs::write(&src_file, make_page(Lsn(0x0200_0000), 0x55)).unwrap();
        age(&src_file);

        let mut entry = entry_for("base/13000/16384", 0o100600);
        copy_file_delta(&src_root, &dst_root, &mut entry, Lsn(0x0100_0000), None)
            .unwrap()
            .unwrap();

        // Flip a byte inside the stored page image.
        let delta_file = dst_root.join("base/13000/16384");
        let mut bytes = fs::read(&delta_file).unwrap();
        bytes[12 + 4 + 100] ^= 0xFF;
        fs::write(&delta_file, &bytes).unwrap();

        let target = dir.path().join("restore-target");
        let err = apply_delta_file(&delta_file, &target).unwrap_err();
        assert!(format!("{err:#}").contains("checksum mismatch"), "got: {err:#}");
    }

    #[test]
    fn verbatim_file_is_not_mistaken_for_delta() {
        let dir = camino_tempfile::tempdir().unwrap();
        let path = dir.path().join("PG_VERSION");
        fs::write(&path, b"11\n").unwrap();
        assert!(!is_delta_file(&path).unwrap());
    }
}
