//! Data-page header access, from bufpage.h.
//!
//! The delta copier only needs two things from a page: its LSN (first eight
//! bytes, stored as two little-endian u32 halves) and whether the page is
//! still all-zeros (never initialized since relation extension).

use byteorder::{ByteOrder, LittleEndian};

use utils::lsn::Lsn;

/// Byte offset of `pd_upper` within PageHeaderData.
const PD_UPPER_OFFSET: usize = 14;

/// LSN of the last WAL record that touched this page.
pub fn page_lsn(page: &[u8]) -> Lsn {
    let xlogid = LittleEndian::read_u32(&page[0..4]);
    let xrecoff = LittleEndian::read_u32(&page[4..8]);
    Lsn(((xlogid as u64) << 32) | xrecoff as u64)
}

/// `PageIsNew`: a page that was extended but never written has pd_upper 0.
pub fn page_is_new(page: &[u8]) -> bool {
    LittleEndian::read_u16(&page[PD_UPPER_OFFSET..PD_UPPER_OFFSET + 2]) == 0
}

/// Stamp an LSN into a page image. Test helper for building synthetic pages.
pub fn set_page_lsn(page: &mut [u8], lsn: Lsn) {
    LittleEndian::write_u32(&mut page[0..4], (lsn.0 >> 32) as u32);
    LittleEndian::write_u32(&mut page[4..8], lsn.0 as u32);
    // pd_upper must be non-zero for the page to count as initialized
    LittleEndian::write_u16(&mut page[PD_UPPER_OFFSET..PD_UPPER_OFFSET + 2], 8192);
}
