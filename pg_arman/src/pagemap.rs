//! Per-file map of dirtied blocks.
//!
//! Filled from the WAL scan, consulted by the delta copier. Keys are the
//! full segment-file paths (data-directory root joined with the relative
//! relation path, segment suffix included), so lookup at copy time is a
//! plain path comparison. Emptiness for a file is not a statement that the
//! file is unchanged; a file absent from the parent backup is copied in
//! full regardless of the map.

use std::collections::{BTreeMap, BTreeSet};

use camino::{Utf8Path, Utf8PathBuf};

use postgres_ffi::BlockNumber;

#[derive(Debug, Default)]
pub struct PageMap {
    map: BTreeMap<Utf8PathBuf, BTreeSet<BlockNumber>>,
}

impl PageMap {
    pub fn new() -> PageMap {
        PageMap::default()
    }

    /// Record that `blkno_in_segment` of the given segment file was dirtied.
    /// Duplicates collapse.
    pub fn add(&mut self, file: Utf8PathBuf, blkno_in_segment: BlockNumber) {
        self.map.entry(file).or_default().insert(blkno_in_segment);
    }

    /// The dirty-block set of one segment file, ascending; `None` if the
    /// WAL named no block of this file.
    pub fn get(&self, file: &Utf8Path) -> Option<&BTreeSet<BlockNumber>> {
        self.map.get(file)
    }

    /// Number of files with at least one dirtied block.
    pub fn file_count(&self) -> usize {
        self.map.len()
    }

    /// Total dirtied blocks across all files.
    pub fn block_count(&self) -> usize {
        self.map.values().map(|blocks| blocks.len()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insertion_deduplicates_and_orders() {
        let mut map = PageMap::new();
        let file = Utf8PathBuf::from("/data/base/13000/16384");
        map.add(file.clone(), 7);
        map.add(file.clone(), 3);
        map.add(file.clone(), 7);
        map.add(Utf8PathBuf::from("/data/base/13000/16384.1"), 0);

        assert_eq!(map.file_count(), 2);
        assert_eq!(map.block_count(), 3);

        let blocks: Vec<_> = map.get(&file).unwrap().iter().copied().collect();
        assert_eq!(blocks, vec![3, 7]);

        assert!(map.get(Utf8Path::new("/data/base/13000/99999")).is_none());
    }
}
