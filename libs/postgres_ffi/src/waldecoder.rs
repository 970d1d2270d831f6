//!
//! Decoder for the WAL stream.
//!
//! [`WalStreamDecoder`] is fed raw segment bytes in order and hands back
//! complete WAL records: it validates every page header on the way, stitches
//! records together across page and segment boundaries, and verifies each
//! record's CRC. [`decode_wal_record`] then cracks a record open far enough
//! to tell which data blocks it touches; the record body itself is not
//! interpreted beyond the block references and the few storage-manager
//! payloads that modify relations without referencing their blocks.
//!

use bytes::{Buf, Bytes, BytesMut};

use crate::pg_constants;
use crate::{BlockNumber, RelFileNode, TimeLineID, TransactionId, WAL_SEGMENT_SIZE, XLOG_BLCKSZ};
use utils::lsn::Lsn;

/// From xlog_internal.h: first two bytes of every WAL page.
pub const XLOG_PAGE_MAGIC: u16 = 0xD098;

pub const XLP_FIRST_IS_CONTRECORD: u16 = 0x0001;
pub const XLP_LONG_HEADER: u16 = 0x0002;

pub const XLOG_SIZE_OF_XLOG_SHORT_PHD: usize = 24;
pub const XLOG_SIZE_OF_XLOG_LONG_PHD: usize = 40;
pub const XLOG_SIZE_OF_XLOG_RECORD: usize = 24;
/// Offset of xl_crc within XLogRecord; the CRC covers everything before it.
pub const XLOG_RECORD_CRC_OFFS: usize = 20;

#[derive(Debug, thiserror::Error)]
pub enum WalDecodeError {
    /// The stream contents contradict the format; scanning must not continue.
    #[error("corrupt WAL at {lsn}: {msg}")]
    Corrupt { msg: String, lsn: Lsn },
    /// A zero record length: the server has written nothing past this point.
    #[error("end of WAL at {lsn}")]
    EndOfWal { lsn: Lsn },
}

/// Assembles WAL records from a stream of segment bytes.
///
/// The decoder must be started on a page boundary (in practice: the first
/// byte of a segment). If the first page continues a record begun earlier,
/// that tail is skipped, not reported.
pub struct WalStreamDecoder {
    lsn: Lsn,
    startlsn: Lsn,
    contlen: usize,
    /// Continuation bytes being skipped, not collected: the tail of a
    /// record that started before our scan position.
    discard: bool,
    /// Set once the first record header has been seen; a continuation
    /// page flag is only acceptable before that.
    seen_record: bool,
    inputbuf: BytesMut,
    recordbuf: BytesMut,
    expected_tli: TimeLineID,
}

impl WalStreamDecoder {
    pub fn new(start: Lsn, expected_tli: TimeLineID) -> WalStreamDecoder {
        assert_eq!(
            start.block_offset(XLOG_BLCKSZ as u64),
            0,
            "decoder must start on a WAL page boundary"
        );
        WalStreamDecoder {
            lsn: start,
            startlsn: Lsn(0),
            contlen: 0,
            discard: false,
            seen_record: false,
            inputbuf: BytesMut::new(),
            recordbuf: BytesMut::new(),
            expected_tli,
        }
    }

    /// Current position: everything before this LSN has been decoded.
    pub fn position(&self) -> Lsn {
        self.lsn
    }

    pub fn feed_bytes(&mut self, buf: &[u8]) {
        self.inputbuf.extend_from_slice(buf);
    }

    /// Try to assemble the next record. `Ok(None)` means more bytes are
    /// needed; feed the next chunk and poll again.
    pub fn poll_decode(&mut self) -> Result<Option<(Lsn, Bytes)>, WalDecodeError> {
        loop {
            // Every WAL page starts with a header that must be validated
            // and skipped before record bytes continue.
            if self.lsn.block_offset(XLOG_BLCKSZ as u64) == 0 {
                let header_size = if self.lsn.segment_offset(WAL_SEGMENT_SIZE) == 0 {
                    XLOG_SIZE_OF_XLOG_LONG_PHD
                } else {
                    XLOG_SIZE_OF_XLOG_SHORT_PHD
                };
                if self.inputbuf.remaining() < header_size {
                    return Ok(None);
                }
                self.decode_page_header(header_size)?;
                continue;
            }

            if self.contlen == 0 {
                // Between records: skip alignment padding, then read the
                // next record's length word.
                let pad = self.lsn.align().0 - self.lsn.0;
                if pad > 0 {
                    if self.inputbuf.remaining() < pad as usize {
                        return Ok(None);
                    }
                    self.inputbuf.advance(pad as usize);
                    self.lsn += pad;
                    continue;
                }
                if self.inputbuf.remaining() < 4 {
                    return Ok(None);
                }
                let xl_tot_len = u32::from_le_bytes(self.inputbuf[0..4].try_into().unwrap());
                if xl_tot_len == 0 {
                    return Err(WalDecodeError::EndOfWal { lsn: self.lsn });
                }
                if (xl_tot_len as usize) < XLOG_SIZE_OF_XLOG_RECORD {
                    return Err(WalDecodeError::Corrupt {
                        msg: format!("invalid record length {xl_tot_len}"),
                        lsn: self.lsn,
                    });
                }
                self.inputbuf.advance(4);
                self.startlsn = self.lsn;
                self.seen_record = true;
                self.recordbuf = BytesMut::with_capacity(xl_tot_len as usize);
                self.recordbuf.extend_from_slice(&xl_tot_len.to_le_bytes());
                self.contlen = xl_tot_len as usize - 4;
                self.lsn += 4;
                continue;
            }

            // Continue the record to the end of the page, the end of the
            // record, or the end of the buffered input, whichever is first.
            let page_left = self.lsn.remaining_in_block(XLOG_BLCKSZ as u64) as usize;
            let n = page_left.min(self.contlen).min(self.inputbuf.remaining());
            if n == 0 {
                return Ok(None);
            }
            if self.discard {
                self.inputbuf.advance(n);
            } else {
                self.recordbuf.extend_from_slice(&self.inputbuf[0..n]);
                self.inputbuf.advance(n);
            }
            self.lsn += n as u64;
            self.contlen -= n;

            if self.contlen > 0 {
                continue;
            }
            if self.discard {
                self.discard = false;
                continue;
            }

            let recordbuf = std::mem::take(&mut self.recordbuf).freeze();
            self.validate_record_crc(&recordbuf)?;
            return Ok(Some((self.startlsn, recordbuf)));
        }
    }

    fn decode_page_header(&mut self, header_size: usize) -> Result<(), WalDecodeError> {
        let buf = &mut self.inputbuf;
        let xlp_magic = buf.get_u16_le();
        let xlp_info = buf.get_u16_le();
        let xlp_tli = buf.get_u32_le();
        let xlp_pageaddr = buf.get_u64_le();
        let xlp_rem_len = buf.get_u32_le();
        buf.advance(4); // alignment padding of PageHeaderData

        if xlp_magic != XLOG_PAGE_MAGIC {
            return Err(WalDecodeError::Corrupt {
                msg: format!("invalid page magic {xlp_magic:#06x}"),
                lsn: self.lsn,
            });
        }
        if xlp_pageaddr != self.lsn.0 {
            return Err(WalDecodeError::Corrupt {
                msg: format!("unexpected page address {}", Lsn(xlp_pageaddr)),
                lsn: self.lsn,
            });
        }
        if xlp_tli != self.expected_tli {
            return Err(WalDecodeError::Corrupt {
                msg: format!("page is on timeline {xlp_tli}"),
                lsn: self.lsn,
            });
        }

        if header_size == XLOG_SIZE_OF_XLOG_LONG_PHD {
            if xlp_info & XLP_LONG_HEADER == 0 {
                return Err(WalDecodeError::Corrupt {
                    msg: "segment start page is missing the long header flag".into(),
                    lsn: self.lsn,
                });
            }
            let _xlp_sysid = buf.get_u64_le();
            let xlp_seg_size = buf.get_u32_le();
            let xlp_xlog_blcksz = buf.get_u32_le();
            if xlp_seg_size as usize != WAL_SEGMENT_SIZE {
                return Err(WalDecodeError::Corrupt {
                    msg: format!("unexpected WAL segment size {xlp_seg_size}"),
                    lsn: self.lsn,
                });
            }
            if xlp_xlog_blcksz as usize != XLOG_BLCKSZ {
                return Err(WalDecodeError::Corrupt {
                    msg: format!("unexpected WAL block size {xlp_xlog_blcksz}"),
                    lsn: self.lsn,
                });
            }
        }

        if self.contlen == 0 {
            if xlp_info & XLP_FIRST_IS_CONTRECORD != 0 {
                if self.seen_record {
                    return Err(WalDecodeError::Corrupt {
                        msg: "unexpected continuation flag between records".into(),
                        lsn: self.lsn,
                    });
                }
                // The scan starts in the middle of a record written before
                // our start position; its tail is skipped unreported.
                log::debug!(
                    "skipping {xlp_rem_len} bytes of a record continued from before {}",
                    self.lsn
                );
                self.contlen = xlp_rem_len as usize;
                self.discard = true;
            }
        } else {
            if xlp_info & XLP_FIRST_IS_CONTRECORD == 0 {
                return Err(WalDecodeError::Corrupt {
                    msg: "record continues but page is missing the continuation flag".into(),
                    lsn: self.lsn,
                });
            }
            if xlp_rem_len as usize != self.contlen {
                return Err(WalDecodeError::Corrupt {
                    msg: format!(
                        "continuation length {} does not match remaining record length {}",
                        xlp_rem_len, self.contlen
                    ),
                    lsn: self.lsn,
                });
            }
        }

        self.lsn += header_size as u64;
        Ok(())
    }

    fn validate_record_crc(&self, rec: &[u8]) -> Result<(), WalDecodeError> {
        // The CRC covers the record body first, then the header up to the
        // CRC field itself; this matches the order the server computes it.
        let stored = u32::from_le_bytes(
            rec[XLOG_RECORD_CRC_OFFS..XLOG_RECORD_CRC_OFFS + 4]
                .try_into()
                .unwrap(),
        );
        let mut crc = crc32c::crc32c(&rec[XLOG_SIZE_OF_XLOG_RECORD..]);
        crc = crc32c::crc32c_append(crc, &rec[0..XLOG_RECORD_CRC_OFFS]);
        if crc != stored {
            return Err(WalDecodeError::Corrupt {
                msg: format!("record CRC mismatch: stored {stored:#010x}, computed {crc:#010x}"),
                lsn: self.startlsn,
            });
        }
        Ok(())
    }
}

/// One block reference carried by a WAL record: this record dirties this
/// block of this relation fork.
#[derive(Debug, Clone, Copy)]
pub struct DecodedBkpBlock {
    pub rnode: RelFileNode,
    pub forknum: u8,
    pub blkno: BlockNumber,
    pub has_image: bool,
    pub will_init: bool,
}

#[derive(Debug)]
pub struct DecodedWALRecord {
    pub xl_xid: TransactionId,
    pub xl_info: u8,
    pub xl_rmid: u8,
    pub blocks: Vec<DecodedBkpBlock>,
    pub main_data: Bytes,
}

impl DecodedWALRecord {
    /// An xlog-switch record: the rest of the segment is zero padding.
    pub fn is_xlog_switch(&self) -> bool {
        self.xl_rmid == pg_constants::RM_XLOG_ID
            && (self.xl_info & pg_constants::XLR_RMGR_INFO_MASK) == pg_constants::XLOG_SWITCH
    }
}

fn decode_error(lsn: Lsn, msg: impl Into<String>) -> WalDecodeError {
    WalDecodeError::Corrupt {
        msg: msg.into(),
        lsn,
    }
}

/// Crack a complete record (as returned by [`WalStreamDecoder`]) into its
/// block references. `lsn` is the record's start position, used only for
/// error reports.
pub fn decode_wal_record(lsn: Lsn, recordbuf: Bytes) -> Result<DecodedWALRecord, WalDecodeError> {
    let mut buf = recordbuf.clone();
    if buf.remaining() < XLOG_SIZE_OF_XLOG_RECORD {
        return Err(decode_error(lsn, "record shorter than its header"));
    }

    let xl_tot_len = buf.get_u32_le();
    let xl_xid = buf.get_u32_le();
    let _xl_prev = buf.get_u64_le();
    let xl_info = buf.get_u8();
    let xl_rmid = buf.get_u8();
    buf.advance(2); // padding
    let _xl_crc = buf.get_u32_le();

    if xl_tot_len as usize != recordbuf.len() {
        return Err(decode_error(
            lsn,
            format!(
                "record length {} does not match buffer length {}",
                xl_tot_len,
                recordbuf.len()
            ),
        ));
    }
    if xl_rmid > pg_constants::RM_MAX_ID {
        return Err(decode_error(lsn, format!("invalid rmgr id {xl_rmid}")));
    }

    // Walk the block-reference headers. `datatotal` accumulates how many
    // payload bytes (block data, block images, main data) follow the
    // headers; the walk ends when only payload remains.
    let mut blocks: Vec<DecodedBkpBlock> = Vec::new();
    let mut main_data_len: usize = 0;
    let mut datatotal: usize = 0;
    let mut prev_rnode: Option<RelFileNode> = None;

    while buf.remaining() > datatotal {
        if buf.remaining() < 1 {
            return Err(decode_error(lsn, "truncated block reference headers"));
        }
        let block_id = buf.get_u8();
        match block_id {
            pg_constants::XLR_BLOCK_ID_DATA_SHORT => {
                if buf.remaining() < 1 {
                    return Err(decode_error(lsn, "truncated main-data header"));
                }
                main_data_len = buf.get_u8() as usize;
                datatotal += main_data_len;
            }
            pg_constants::XLR_BLOCK_ID_DATA_LONG => {
                if buf.remaining() < 4 {
                    return Err(decode_error(lsn, "truncated main-data header"));
                }
                main_data_len = buf.get_u32_le() as usize;
                datatotal += main_data_len;
            }
            pg_constants::XLR_BLOCK_ID_ORIGIN => {
                if buf.remaining() < 2 {
                    return Err(decode_error(lsn, "truncated replication origin"));
                }
                buf.advance(2);
            }
            0..=pg_constants::XLR_MAX_BLOCK_ID => {
                if buf.remaining() < 3 {
                    return Err(decode_error(lsn, "truncated block header"));
                }
                let fork_flags = buf.get_u8();
                let data_len = buf.get_u16_le() as usize;

                let forknum = fork_flags & pg_constants::BKPBLOCK_FORK_MASK;
                let has_image = fork_flags & pg_constants::BKPBLOCK_HAS_IMAGE != 0;
                let has_data = fork_flags & pg_constants::BKPBLOCK_HAS_DATA != 0;
                let will_init = fork_flags & pg_constants::BKPBLOCK_WILL_INIT != 0;

                if has_data != (data_len > 0) {
                    return Err(decode_error(lsn, "block data flag contradicts its length"));
                }
                datatotal += data_len;

                if has_image {
                    if buf.remaining() < 5 {
                        return Err(decode_error(lsn, "truncated block image header"));
                    }
                    let bimg_len = buf.get_u16_le() as usize;
                    let _hole_offset = buf.get_u16_le();
                    let bimg_info = buf.get_u8();
                    if bimg_info & pg_constants::BKPIMAGE_IS_COMPRESSED != 0 {
                        if buf.remaining() < 2 {
                            return Err(decode_error(lsn, "truncated compressed image header"));
                        }
                        let _hole_length = buf.get_u16_le();
                    }
                    datatotal += bimg_len;
                }

                let rnode = if fork_flags & pg_constants::BKPBLOCK_SAME_REL != 0 {
                    prev_rnode
                        .ok_or_else(|| decode_error(lsn, "BKPBLOCK_SAME_REL without a previous relation"))?
                } else {
                    if buf.remaining() < 12 {
                        return Err(decode_error(lsn, "truncated relation file node"));
                    }
                    let rnode = RelFileNode {
                        spcnode: buf.get_u32_le(),
                        dbnode: buf.get_u32_le(),
                        relnode: buf.get_u32_le(),
                    };
                    prev_rnode = Some(rnode);
                    rnode
                };
                if buf.remaining() < 4 {
                    return Err(decode_error(lsn, "truncated block number"));
                }
                let blkno = buf.get_u32_le();

                blocks.push(DecodedBkpBlock {
                    rnode,
                    forknum,
                    blkno,
                    has_image,
                    will_init,
                });
            }
            _ => {
                return Err(decode_error(lsn, format!("invalid block id {block_id}")));
            }
        }
    }

    if buf.remaining() != datatotal {
        return Err(decode_error(lsn, "record payload length mismatch"));
    }
    let main_data = recordbuf.slice(recordbuf.len() - main_data_len..);

    Ok(DecodedWALRecord {
        xl_xid,
        xl_info,
        xl_rmid,
        blocks,
        main_data,
    })
}

/// Payload of an XLOG_SMGR_TRUNCATE record: the relation is cut down to
/// `blkno` blocks.
pub fn decode_smgr_truncate(
    lsn: Lsn,
    rec: &DecodedWALRecord,
) -> Result<(RelFileNode, BlockNumber), WalDecodeError> {
    let mut buf = rec.main_data.clone();
    if buf.remaining() < 20 {
        return Err(decode_error(lsn, "truncated smgr-truncate payload"));
    }
    let blkno = buf.get_u32_le();
    let rnode = RelFileNode {
        spcnode: buf.get_u32_le(),
        dbnode: buf.get_u32_le(),
        relnode: buf.get_u32_le(),
    };
    let _flags = buf.get_u32_le();
    Ok((rnode, blkno))
}

/// Payload of an XLOG_SMGR_CREATE record: a new (empty) relation fork file.
pub fn decode_smgr_create(
    lsn: Lsn,
    rec: &DecodedWALRecord,
) -> Result<(RelFileNode, u8), WalDecodeError> {
    let mut buf = rec.main_data.clone();
    if buf.remaining() < 16 {
        return Err(decode_error(lsn, "truncated smgr-create payload"));
    }
    let rnode = RelFileNode {
        spcnode: buf.get_u32_le(),
        dbnode: buf.get_u32_le(),
        relnode: buf.get_u32_le(),
    };
    let forknum = buf.get_u32_le() as u8;
    Ok((rnode, forknum))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pg_constants::*;

    const TLI: TimeLineID = 1;

    fn long_page_header(pageaddr: u64, rem_len: u32) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(&XLOG_PAGE_MAGIC.to_le_bytes());
        let info = XLP_LONG_HEADER | if rem_len > 0 { XLP_FIRST_IS_CONTRECORD } else { 0 };
        buf.extend_from_slice(&info.to_le_bytes());
        buf.extend_from_slice(&TLI.to_le_bytes());
        buf.extend_from_slice(&pageaddr.to_le_bytes());
        buf.extend_from_slice(&rem_len.to_le_bytes());
        buf.extend_from_slice(&[0u8; 4]); // padding
        buf.extend_from_slice(&0x4242424242424242u64.to_le_bytes()); // sysid
        buf.extend_from_slice(&(WAL_SEGMENT_SIZE as u32).to_le_bytes());
        buf.extend_from_slice(&(XLOG_BLCKSZ as u32).to_le_bytes());
        assert_eq!(buf.len(), XLOG_SIZE_OF_XLOG_LONG_PHD);
        buf
    }

    fn short_page_header(pageaddr: u64, rem_len: u32) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(&XLOG_PAGE_MAGIC.to_le_bytes());
        let info: u16 = if rem_len > 0 { XLP_FIRST_IS_CONTRECORD } else { 0 };
        buf.extend_from_slice(&info.to_le_bytes());
        buf.extend_from_slice(&TLI.to_le_bytes());
        buf.extend_from_slice(&pageaddr.to_le_bytes());
        buf.extend_from_slice(&rem_len.to_le_bytes());
        buf.extend_from_slice(&[0u8; 4]); // padding
        assert_eq!(buf.len(), XLOG_SIZE_OF_XLOG_SHORT_PHD);
        buf
    }

    /// Build a record with one block reference and stamp a valid CRC.
    fn heap_record(blkno: u32, main_data: &[u8]) -> Vec<u8> {
        let block_data = [0xABu8; 10];
        let mut body = Vec::new();
        // block reference 0
        body.push(0u8);
        body.push(MAIN_FORKNUM | BKPBLOCK_HAS_DATA);
        body.extend_from_slice(&(block_data.len() as u16).to_le_bytes());
        body.extend_from_slice(&1663u32.to_le_bytes());
        body.extend_from_slice(&13000u32.to_le_bytes());
        body.extend_from_slice(&16384u32.to_le_bytes());
        body.extend_from_slice(&blkno.to_le_bytes());
        // main data (short form)
        body.push(XLR_BLOCK_ID_DATA_SHORT);
        body.push(main_data.len() as u8);
        // payloads, in block order, main data last
        body.extend_from_slice(&block_data);
        body.extend_from_slice(main_data);

        finish_record(RM_HEAP_ID, 0x00, &body)
    }

    fn finish_record(rmid: u8, info: u8, body: &[u8]) -> Vec<u8> {
        let tot_len = (XLOG_SIZE_OF_XLOG_RECORD + body.len()) as u32;
        let mut header = Vec::new();
        header.extend_from_slice(&tot_len.to_le_bytes());
        header.extend_from_slice(&42u32.to_le_bytes()); // xid
        header.extend_from_slice(&0u64.to_le_bytes()); // xl_prev
        header.push(info);
        header.push(rmid);
        header.extend_from_slice(&[0u8; 2]); // padding
        let crc = crc32c::crc32c_append(crc32c::crc32c(body), &header);
        header.extend_from_slice(&crc.to_le_bytes());
        assert_eq!(header.len(), XLOG_SIZE_OF_XLOG_RECORD);

        let mut rec = header;
        rec.extend_from_slice(body);
        rec
    }

    #[test]
    fn decode_single_record() {
        let seg_start = WAL_SEGMENT_SIZE as u64;
        let rec = heap_record(5, b"main");

        let mut page = long_page_header(seg_start, 0);
        page.extend_from_slice(&rec);
        page.resize(XLOG_BLCKSZ, 0);

        let mut decoder = WalStreamDecoder::new(Lsn(seg_start), TLI);
        decoder.feed_bytes(&page);

        let (lsn, bytes) = decoder.poll_decode().unwrap().expect("expected a record");
        assert_eq!(lsn, Lsn(seg_start + XLOG_SIZE_OF_XLOG_LONG_PHD as u64));

        let decoded = decode_wal_record(lsn, bytes).unwrap();
        assert_eq!(decoded.xl_rmid, RM_HEAP_ID);
        assert_eq!(decoded.xl_xid, 42);
        assert_eq!(decoded.blocks.len(), 1);
        let blk = &decoded.blocks[0];
        assert_eq!(
            blk.rnode,
            RelFileNode {
                spcnode: 1663,
                dbnode: 13000,
                relnode: 16384
            }
        );
        assert_eq!(blk.forknum, MAIN_FORKNUM);
        assert_eq!(blk.blkno, 5);
        assert_eq!(decoded.main_data.as_ref(), b"main");

        // nothing but zero padding follows: end of WAL
        match decoder.poll_decode() {
            Err(WalDecodeError::EndOfWal { .. }) => {}
            other => panic!("expected end of WAL, got {other:?}"),
        }
    }

    #[test]
    fn decode_record_crossing_page_boundary() {
        let seg_start = WAL_SEGMENT_SIZE as u64;

        // A record with enough main data to spill over the first page.
        let page1_payload = XLOG_BLCKSZ - XLOG_SIZE_OF_XLOG_LONG_PHD;
        let spill = 100usize;
        // header(24) + long-data header(5) + main_data == page1_payload + spill
        let main_len = page1_payload + spill - XLOG_SIZE_OF_XLOG_RECORD - 5;
        let mut body = Vec::new();
        body.push(XLR_BLOCK_ID_DATA_LONG);
        body.extend_from_slice(&(main_len as u32).to_le_bytes());
        body.extend(std::iter::repeat(0xCD).take(main_len));
        let rec = finish_record(RM_XLOG_ID, 0x00, &body);
        assert_eq!(rec.len(), page1_payload + spill);

        let mut stream = long_page_header(seg_start, 0);
        stream.extend_from_slice(&rec[..page1_payload]);
        stream.extend_from_slice(&short_page_header(seg_start + XLOG_BLCKSZ as u64, spill as u32));
        stream.extend_from_slice(&rec[page1_payload..]);

        let mut decoder = WalStreamDecoder::new(Lsn(seg_start), TLI);
        // Feed in small chunks to exercise the incremental path.
        let mut polled = None;
        for chunk in stream.chunks(512) {
            decoder.feed_bytes(chunk);
            if let Some(found) = decoder.poll_decode().unwrap() {
                polled = Some(found);
                break;
            }
        }
        let (lsn, bytes) = polled.expect("record did not assemble");
        assert_eq!(lsn, Lsn(seg_start + XLOG_SIZE_OF_XLOG_LONG_PHD as u64));
        assert_eq!(bytes.len(), rec.len());

        let decoded = decode_wal_record(lsn, bytes).unwrap();
        assert!(decoded.blocks.is_empty());
        assert_eq!(decoded.main_data.len(), main_len);
    }

    #[test]
    fn skips_continuation_at_scan_start() {
        // Second segment begins with the tail of a record from the first;
        // a decoder started there must skip it and report the next record.
        let seg_start = 2 * WAL_SEGMENT_SIZE as u64;
        let tail_len = 64u32;

        let mut stream = long_page_header(seg_start, tail_len);
        stream.extend(std::iter::repeat(0xEE).take(tail_len as usize));
        let rec = heap_record(9, b"x");
        stream.extend_from_slice(&rec);

        let mut decoder = WalStreamDecoder::new(Lsn(seg_start), TLI);
        decoder.feed_bytes(&stream);
        let (lsn, bytes) = decoder.poll_decode().unwrap().expect("expected a record");
        assert_eq!(
            lsn,
            Lsn(seg_start + XLOG_SIZE_OF_XLOG_LONG_PHD as u64 + tail_len as u64)
        );
        let decoded = decode_wal_record(lsn, bytes).unwrap();
        assert_eq!(decoded.blocks[0].blkno, 9);
    }

    #[test]
    fn crc_mismatch_is_fatal() {
        let seg_start = WAL_SEGMENT_SIZE as u64;
        let mut rec = heap_record(5, b"main");
        // Flip one bit of the block payload.
        let len = rec.len();
        rec[len - 1] ^= 0x01;

        let mut page = long_page_header(seg_start, 0);
        page.extend_from_slice(&rec);

        let mut decoder = WalStreamDecoder::new(Lsn(seg_start), TLI);
        decoder.feed_bytes(&page);
        match decoder.poll_decode() {
            Err(WalDecodeError::Corrupt { msg, .. }) => {
                assert!(msg.contains("CRC"), "unexpected message: {msg}")
            }
            other => panic!("expected CRC failure, got {other:?}"),
        }
    }

    #[test]
    fn bad_page_magic_is_fatal() {
        let seg_start = WAL_SEGMENT_SIZE as u64;
        let mut page = long_page_header(seg_start, 0);
        page[0] = 0x77;
        let mut decoder = WalStreamDecoder::new(Lsn(seg_start), TLI);
        decoder.feed_bytes(&page);
        match decoder.poll_decode() {
            Err(WalDecodeError::Corrupt { msg, .. }) => {
                assert!(msg.contains("magic"), "unexpected message: {msg}")
            }
            other => panic!("expected corrupt page, got {other:?}"),
        }
    }

    #[test]
    fn smgr_truncate_payload() {
        let mut body = Vec::new();
        body.push(XLR_BLOCK_ID_DATA_SHORT);
        body.push(20u8);
        body.extend_from_slice(&1000u32.to_le_bytes()); // blkno
        body.extend_from_slice(&1663u32.to_le_bytes());
        body.extend_from_slice(&13000u32.to_le_bytes());
        body.extend_from_slice(&16390u32.to_le_bytes());
        body.extend_from_slice(&0u32.to_le_bytes()); // flags
        let rec = finish_record(RM_SMGR_ID, XLOG_SMGR_TRUNCATE, &body);

        let decoded = decode_wal_record(Lsn(0x1000000), Bytes::from(rec)).unwrap();
        let (rnode, blkno) = decode_smgr_truncate(Lsn(0x1000000), &decoded).unwrap();
        assert_eq!(blkno, 1000);
        assert_eq!(rnode.relnode, 16390);
    }
}
