//! WAL scan between two log positions.
//!
//! Reads archived segments covering `[from_lsn, to_lsn)` and reports every
//! data block the records in that window dirty. A record is in the window
//! if its *beginning* is at or past `from_lsn` and before `to_lsn`; the
//! record starting exactly at `from_lsn` belongs to the parent backup's
//! window and is skipped by that rule on the parent's side, not here.

use std::fs::File;
use std::io::Read;

use anyhow::{bail, Context};
use camino::Utf8Path;

use postgres_ffi::pg_constants::{
    MAIN_FORKNUM, RM_SMGR_ID, XLOG_SMGR_CREATE, XLOG_SMGR_TRUNCATE, XLR_RMGR_INFO_MASK,
};
use postgres_ffi::relfile_utils::{block_to_segment, relpath};
use postgres_ffi::waldecoder::{
    decode_smgr_create, decode_smgr_truncate, decode_wal_record, WalDecodeError, WalStreamDecoder,
};
use postgres_ffi::xlog_utils::{XLogFileName, XLogSegNoToRecPtr};
use postgres_ffi::{BlockNumber, RelFileNode, TimeLineID, WAL_SEGMENT_SIZE, XLOG_BLCKSZ};
use utils::lsn::Lsn;
use utils::signals::check_interrupt;

use crate::pagemap::PageMap;

/// Receives block changes from the WAL scan and files them under the
/// segment file they live in. Lookup keys are full paths (data-directory
/// root joined with the relative relation path), so the copier can consult
/// the map with the paths the directory scan produced.
pub struct BlockSink<'a> {
    pgdata: &'a Utf8Path,
    map: &'a mut PageMap,
}

impl<'a> BlockSink<'a> {
    pub fn new(pgdata: &'a Utf8Path, map: &'a mut PageMap) -> BlockSink<'a> {
        BlockSink { pgdata, map }
    }

    fn block_change(&mut self, rnode: RelFileNode, forknum: u8, blkno: BlockNumber) {
        let (segno, block_in_segment) = block_to_segment(blkno);
        let path = self.pgdata.join(relpath(&rnode, forknum, segno));
        self.map.add(path, block_in_segment);
    }
}

/// Scan archived WAL on `tli` and feed every dirtied block into the sink.
///
/// A missing segment and a corrupt record are both fatal. Running out of
/// WAL is normal only at or past `to_lsn`.
pub fn scan_wal(
    arclog_path: &Utf8Path,
    tli: TimeLineID,
    from_lsn: Lsn,
    to_lsn: Lsn,
    sink: &mut BlockSink,
) -> anyhow::Result<()> {
    if from_lsn >= to_lsn {
        return Ok(());
    }

    let mut segno = from_lsn.segment_number(WAL_SEGMENT_SIZE);
    let mut decoder = WalStreamDecoder::new(XLogSegNoToRecPtr(segno, WAL_SEGMENT_SIZE), tli);
    let mut buf = vec![0u8; XLOG_BLCKSZ];

    'segments: loop {
        let seg_start = XLogSegNoToRecPtr(segno, WAL_SEGMENT_SIZE);
        if seg_start >= to_lsn {
            return Ok(());
        }

        let fname = XLogFileName(tli, segno, WAL_SEGMENT_SIZE);
        let path = arclog_path.join(&fname);
        let mut file = match File::open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                bail!("WAL segment \"{fname}\" is missing in the archive")
            }
            Err(e) => {
                return Err(e).with_context(|| format!("could not open WAL segment \"{fname}\""))
            }
        };

        loop {
            check_interrupt()?;
            let n = file.read(&mut buf)?;
            if n == 0 {
                break;
            }
            decoder.feed_bytes(&buf[..n]);

            loop {
                match decoder.poll_decode() {
                    Ok(Some((lsn, recordbuf))) => {
                        if lsn >= to_lsn {
                            return Ok(());
                        }
                        let record = decode_wal_record(lsn, recordbuf)
                            .with_context(|| format!("in WAL segment \"{fname}\""))?;
                        if lsn >= from_lsn {
                            emit_block_changes(lsn, &record, sink)?;
                        }
                        if record.is_xlog_switch() {
                            // The rest of the segment is zero padding.
                            segno += 1;
                            decoder = WalStreamDecoder::new(
                                XLogSegNoToRecPtr(segno, WAL_SEGMENT_SIZE),
                                tli,
                            );
                            continue 'segments;
                        }
                    }
                    Ok(None) => break,
                    Err(WalDecodeError::EndOfWal { lsn }) => {
                        if lsn >= to_lsn {
                            return Ok(());
                        }
                        bail!(
                            "WAL ends at {lsn} in segment \"{fname}\", before the backup start position {to_lsn}"
                        );
                    }
                    Err(e @ WalDecodeError::Corrupt { .. }) => {
                        return Err(e).with_context(|| format!("in WAL segment \"{fname}\""));
                    }
                }
            }
        }

        segno += 1;
    }
}

fn emit_block_changes(
    lsn: Lsn,
    record: &postgres_ffi::waldecoder::DecodedWALRecord,
    sink: &mut BlockSink,
) -> anyhow::Result<()> {
    // Block references cover every record kind that touches page contents,
    // full-page images included. The storage-manager records modify
    // relation files without referencing the affected blocks, so they are
    // cracked separately.
    for blk in &record.blocks {
        sink.block_change(blk.rnode, blk.forknum, blk.blkno);
    }

    if record.xl_rmid == RM_SMGR_ID {
        match record.xl_info & XLR_RMGR_INFO_MASK {
            XLOG_SMGR_CREATE => {
                let (rnode, forknum) = decode_smgr_create(lsn, record)?;
                sink.block_change(rnode, forknum, 0);
            }
            XLOG_SMGR_TRUNCATE => {
                // The block at the truncation point is the first one cut
                // off; marking it makes the copier revisit the boundary.
                let (rnode, blkno) = decode_smgr_truncate(lsn, record)?;
                sink.block_change(rnode, MAIN_FORKNUM, blkno);
            }
            _ => {}
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use postgres_ffi::pg_constants::{BKPBLOCK_HAS_DATA, RM_HEAP_ID, XLR_BLOCK_ID_DATA_SHORT};
    use postgres_ffi::waldecoder::{
        XLOG_PAGE_MAGIC, XLOG_SIZE_OF_XLOG_LONG_PHD, XLOG_SIZE_OF_XLOG_RECORD, XLP_LONG_HEADER,
    };
    use std::fs;

    const TLI: TimeLineID = 1;

    fn long_page_header(pageaddr: u64) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(&XLOG_PAGE_MAGIC.to_le_bytes());
        buf.extend_from_slice(&XLP_LONG_HEADER.to_le_bytes());
        buf.extend_from_slice(&TLI.to_le_bytes());
        buf.extend_from_slice(&pageaddr.to_le_bytes());
        buf.extend_from_slice(&0u32.to_le_bytes()); // rem_len
        buf.extend_from_slice(&[0u8; 4]);
        buf.extend_from_slice(&0u64.to_le_bytes()); // sysid
        buf.extend_from_slice(&(WAL_SEGMENT_SIZE as u32).to_le_bytes());
        buf.extend_from_slice(&(XLOG_BLCKSZ as u32).to_le_bytes());
        assert_eq!(buf.len(), XLOG_SIZE_OF_XLOG_LONG_PHD);
        buf
    }

    fn heap_record(relnode: u32, blkno: u32) -> Vec<u8> {
        let block_data = [0x5Au8; 8];
        let mut body = Vec::new();
        body.push(0u8); // block id
        body.push(MAIN_FORKNUM | BKPBLOCK_HAS_DATA);
        body.extend_from_slice(&(block_data.len() as u16).to_le_bytes());
        body.extend_from_slice(&1663u32.to_le_bytes());
        body.extend_from_slice(&13000u32.to_le_bytes());
        body.extend_from_slice(&relnode.to_le_bytes());
        body.extend_from_slice(&blkno.to_le_bytes());
        body.push(XLR_BLOCK_ID_DATA_SHORT);
        body.push(0u8);
        body.extend_from_slice(&block_data);

        let tot_len = (XLOG_SIZE_OF_XLOG_RECORD + body.len()) as u32;
        let mut header = Vec::new();
        header.extend_from_slice(&tot_len.to_le_bytes());
        header.extend_from_slice(&7u32.to_le_bytes()); // xid
        header.extend_from_slice(&0u64.to_le_bytes()); // xl_prev
        header.push(0x00); // info
        header.push(RM_HEAP_ID);
        header.extend_from_slice(&[0u8; 2]);
        let crc = crc32c::crc32c_append(crc32c::crc32c(&body), &header);
        header.extend_from_slice(&crc.to_le_bytes());

        let mut rec = header;
        rec.extend_from_slice(&body);
        rec
    }

    fn align8(n: usize) -> usize {
        (n + 7) & !7
    }

    /// One segment with two heap records; returns (segment bytes, record
    /// start offsets, end-of-wal offset).
    fn build_segment(seg_start: u64) -> (Vec<u8>, Vec<usize>, usize) {
        let mut seg = long_page_header(seg_start);
        let mut starts = Vec::new();
        for (relnode, blkno) in [(16384u32, 3u32), (16385, 7)] {
            let pos = align8(seg.len());
            seg.resize(pos, 0);
            starts.push(pos);
            seg.extend_from_slice(&heap_record(relnode, blkno));
        }
        let end = align8(seg.len());
        seg.resize(XLOG_BLCKSZ, 0);
        (seg, starts, end)
    }

    #[test]
    fn scan_collects_dirtied_blocks() {
        let dir = camino_tempfile::tempdir().unwrap();
        let segno = 1u64;
        let seg_start = segno * WAL_SEGMENT_SIZE as u64;
        let (seg, _starts, end) = build_segment(seg_start);
        fs::write(
            dir.path().join(XLogFileName(TLI, segno, WAL_SEGMENT_SIZE)),
            &seg,
        )
        .unwrap();

        let pgdata = Utf8Path::new("/data");
        let mut map = PageMap::new();
        let mut sink = BlockSink::new(pgdata, &mut map);
        scan_wal(
            dir.path(),
            TLI,
            Lsn(seg_start),
            Lsn(seg_start + end as u64),
            &mut sink,
        )
        .unwrap();

        assert_eq!(map.file_count(), 2);
        let blocks: Vec<u32> = map
            .get(&pgdata.join("base/13000/16384"))
            .unwrap()
            .iter()
            .copied()
            .collect();
        assert_eq!(blocks, vec![3]);
        assert!(map.get(&pgdata.join("base/13000/16385")).unwrap().contains(&7));
    }

    #[test]
    fn scan_respects_from_boundary() {
        let dir = camino_tempfile::tempdir().unwrap();
        let segno = 1u64;
        let seg_start = segno * WAL_SEGMENT_SIZE as u64;
        let (seg, starts, end) = build_segment(seg_start);
        fs::write(
            dir.path().join(XLogFileName(TLI, segno, WAL_SEGMENT_SIZE)),
            &seg,
        )
        .unwrap();

        // Start the window at the second record: the first one belongs to
        // the previous backup and must not be reported again.
        let pgdata = Utf8Path::new("/data");
        let mut map = PageMap::new();
        let mut sink = BlockSink::new(pgdata, &mut map);
        scan_wal(
            dir.path(),
            TLI,
            Lsn(seg_start + starts[1] as u64),
            Lsn(seg_start + end as u64),
            &mut sink,
        )
        .unwrap();

        assert_eq!(map.file_count(), 1);
        assert!(map.get(&pgdata.join("base/13000/16384")).is_none());
        assert!(map.get(&pgdata.join("base/13000/16385")).is_some());
    }

    #[test]
    fn missing_segment_is_fatal() {
        let dir = camino_tempfile::tempdir().unwrap();
        let mut map = PageMap::new();
        let mut sink = BlockSink::new(Utf8Path::new("/data"), &mut map);
        let err = scan_wal(
            dir.path(),
            TLI,
            Lsn(WAL_SEGMENT_SIZE as u64),
            Lsn(2 * WAL_SEGMENT_SIZE as u64),
            &mut sink,
        )
        .unwrap_err();
        assert!(
            format!("{err:#}").contains("missing in the archive"),
            "got: {err:#}"
        );
    }

    #[test]
    fn wal_ending_before_target_is_fatal() {
        let dir = camino_tempfile::tempdir().unwrap();
        let segno = 1u64;
        let seg_start = segno * WAL_SEGMENT_SIZE as u64;
        let (seg, _starts, end) = build_segment(seg_start);
        fs::write(
            dir.path().join(XLogFileName(TLI, segno, WAL_SEGMENT_SIZE)),
            &seg,
        )
        .unwrap();

        let mut map = PageMap::new();
        let mut sink = BlockSink::new(Utf8Path::new("/data"), &mut map);
        let err = scan_wal(
            dir.path(),
            TLI,
            Lsn(seg_start),
            Lsn(seg_start + end as u64 + 0x1000),
            &mut sink,
        )
        .unwrap_err();
        assert!(format!("{err:#}").contains("WAL ends at"), "got: {err:#}");
    }
}
