//! WAL segment naming and LSN <-> segment arithmetic.

use crate::{TimeLineID, XLogSegNo, WAL_SEGMENT_SIZE};
use utils::lsn::Lsn;

/// How many segments fit in one "xlogid" (the high half of an LSN).
pub const fn xlog_segments_per_xlog_id(wal_segsz_bytes: usize) -> u64 {
    (0x100000000u64 / wal_segsz_bytes as u64) as u64
}

/// The file name of a WAL segment: 8 hex digits of timeline, 8 of "log id"
/// and 8 of "seg" within the log id.
#[allow(non_snake_case)]
pub fn XLogFileName(tli: TimeLineID, logseg: XLogSegNo, wal_segsz_bytes: usize) -> String {
    format!(
        "{:>08X}{:>08X}{:>08X}",
        tli,
        logseg / xlog_segments_per_xlog_id(wal_segsz_bytes),
        logseg % xlog_segments_per_xlog_id(wal_segsz_bytes)
    )
}

/// Parse the inverse of [`XLogFileName`].
#[allow(non_snake_case)]
pub fn XLogFromFileName(fname: &str, wal_segsz_bytes: usize) -> Option<(TimeLineID, XLogSegNo)> {
    if !IsXLogFileName(fname) {
        return None;
    }
    let tli = u32::from_str_radix(&fname[0..8], 16).ok()?;
    let log = u64::from_str_radix(&fname[8..16], 16).ok()?;
    let seg = u64::from_str_radix(&fname[16..24], 16).ok()?;
    Some((tli, log * xlog_segments_per_xlog_id(wal_segsz_bytes) + seg))
}

/// Is this a well-formed WAL segment file name (24 upper-case hex digits)?
#[allow(non_snake_case)]
pub fn IsXLogFileName(fname: &str) -> bool {
    fname.len() == 24 && fname.chars().all(|c| c.is_ascii_digit() || ('A'..='F').contains(&c))
}

/// LSN of the first byte of the given segment.
#[allow(non_snake_case)]
pub fn XLogSegNoToRecPtr(segno: XLogSegNo, wal_segsz_bytes: usize) -> Lsn {
    Lsn(segno * wal_segsz_bytes as u64)
}

/// Segment number containing the given LSN.
#[allow(non_snake_case)]
pub fn XLByteToSeg(lsn: Lsn, wal_segsz_bytes: usize) -> XLogSegNo {
    lsn.segment_number(wal_segsz_bytes)
}

/// Segment number of the last byte *before* the given LSN. This is the
/// segment that must have been archived once the server switched WAL at
/// `lsn`: a switch position sits on the first byte of the next segment.
#[allow(non_snake_case)]
pub fn XLByteToPrevSeg(lsn: Lsn, wal_segsz_bytes: usize) -> XLogSegNo {
    lsn.0.saturating_sub(1) / wal_segsz_bytes as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn segment_names() {
        assert_eq!(XLogFileName(1, 0, WAL_SEGMENT_SIZE), "000000010000000000000000");
        assert_eq!(XLogFileName(1, 1, WAL_SEGMENT_SIZE), "000000010000000000000001");
        // 256 segments of 16 MiB per 4 GiB "log id"
        assert_eq!(XLogFileName(1, 256, WAL_SEGMENT_SIZE), "000000010000000100000000");
        assert_eq!(
            XLogFileName(0x2B, 0x0105, WAL_SEGMENT_SIZE),
            "0000002B0000000100000005"
        );
    }

    #[test]
    fn segment_name_roundtrip() {
        for segno in [0u64, 1, 255, 256, 257, 0x12345] {
            let name = XLogFileName(3, segno, WAL_SEGMENT_SIZE);
            assert_eq!(XLogFromFileName(&name, WAL_SEGMENT_SIZE), Some((3, segno)));
        }
        assert_eq!(XLogFromFileName("garbage", WAL_SEGMENT_SIZE), None);
        assert_eq!(
            XLogFromFileName("00000001000000000000000G", WAL_SEGMENT_SIZE),
            None
        );
    }

    #[test]
    fn lsn_to_segments() {
        let lsn = Lsn(0x0000000__2__01000000);
        assert_eq!(XLByteToSeg(lsn, WAL_SEGMENT_SIZE), 0x201);
        // An xlog switch lands the reported LSN on the first byte of the
        // next segment; the segment to wait for is the previous one.
        assert_eq!(XLByteToPrevSeg(lsn, WAL_SEGMENT_SIZE), 0x200);
        assert_eq!(XLByteToPrevSeg(lsn + 1, WAL_SEGMENT_SIZE), 0x201);
        assert_eq!(XLogSegNoToRecPtr(0x201, WAL_SEGMENT_SIZE), lsn);
    }
}
