//! Utilities for naming relation files the way the server does.

use camino::Utf8PathBuf;
use once_cell::sync::Lazy;
use regex::Regex;

use crate::pg_constants::{
    DEFAULTTABLESPACE_OID, FSM_FORKNUM, GLOBALTABLESPACE_OID, INIT_FORKNUM, MAIN_FORKNUM,
    TABLESPACE_VERSION_DIRECTORY, VISIBILITYMAP_FORKNUM,
};
use crate::{BlockNumber, RelFileNode, RELSEG_SIZE};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FilePathError {
    #[error("invalid relation fork name")]
    InvalidForkName,
    #[error("invalid relation data file name")]
    InvalidFileName,
}

/// Convert Postgres relation file's fork suffix to fork number.
pub fn forkname_to_number(forkname: Option<&str>) -> Result<u8, FilePathError> {
    match forkname {
        // "main" is not in filenames, it's implicit if the fork name is not present
        None => Ok(MAIN_FORKNUM),
        Some("fsm") => Ok(FSM_FORKNUM),
        Some("vm") => Ok(VISIBILITYMAP_FORKNUM),
        Some("init") => Ok(INIT_FORKNUM),
        Some(_) => Err(FilePathError::InvalidForkName),
    }
}

/// Convert fork number to the right suffix of the relation data file.
pub fn forknumber_to_name(forknum: u8) -> Option<&'static str> {
    match forknum {
        MAIN_FORKNUM => None,
        FSM_FORKNUM => Some("fsm"),
        VISIBILITYMAP_FORKNUM => Some("vm"),
        INIT_FORKNUM => Some("init"),
        _ => Some("UNKNOWN FORKNUM"),
    }
}

static RELFILE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(?P<relnode>\d+)(_(?P<fork>[a-z]+))?(\.(?P<segno>\d+))?$").unwrap());

/// Parse a relation file's base name into `(relnode, forknum, segno)`.
///
/// The name must look like `1234`, `1234_fsm`, `1234.5` or `1234_vm.2`.
pub fn parse_relfilename(fname: &str) -> Result<(u32, u8, u32), FilePathError> {
    let caps = RELFILE_RE
        .captures(fname)
        .ok_or(FilePathError::InvalidFileName)?;

    let relnode: u32 = caps
        .name("relnode")
        .unwrap()
        .as_str()
        .parse()
        .map_err(|_| FilePathError::InvalidFileName)?;
    let forknum = forkname_to_number(caps.name("fork").map(|f| f.as_str()))?;
    let segno: u32 = match caps.name("segno") {
        None => 0,
        Some(segno) => segno
            .as_str()
            .parse()
            .map_err(|_| FilePathError::InvalidFileName)?,
    };

    Ok((relnode, forknum, segno))
}

/// Build the path of one segment file of a relation fork, relative to the
/// data directory root. Segment 0 has no suffix, segment N > 0 has `.N`.
pub fn relpath(rnode: &RelFileNode, forknum: u8, segno: u32) -> Utf8PathBuf {
    let mut name = rnode.relnode.to_string();
    if let Some(fork) = forknumber_to_name(forknum) {
        name = format!("{name}_{fork}");
    }
    if segno > 0 {
        name = format!("{name}.{segno}");
    }

    if rnode.spcnode == GLOBALTABLESPACE_OID {
        Utf8PathBuf::from("global").join(name)
    } else if rnode.spcnode == DEFAULTTABLESPACE_OID {
        Utf8PathBuf::from("base")
            .join(rnode.dbnode.to_string())
            .join(name)
    } else {
        Utf8PathBuf::from("pg_tblspc")
            .join(rnode.spcnode.to_string())
            .join(TABLESPACE_VERSION_DIRECTORY)
            .join(rnode.dbnode.to_string())
            .join(name)
    }
}

/// Which segment file of a relation fork does this block live in, and at
/// which block offset inside that segment?
pub fn block_to_segment(blkno: BlockNumber) -> (u32, BlockNumber) {
    (blkno / RELSEG_SIZE, blkno % RELSEG_SIZE)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_plain_relfile() {
        assert_eq!(parse_relfilename("16384"), Ok((16384, MAIN_FORKNUM, 0)));
        assert_eq!(parse_relfilename("16384_fsm"), Ok((16384, FSM_FORKNUM, 0)));
        assert_eq!(
            parse_relfilename("16384_vm.3"),
            Ok((16384, VISIBILITYMAP_FORKNUM, 3))
        );
        assert_eq!(parse_relfilename("16384.17"), Ok((16384, MAIN_FORKNUM, 17)));
    }

    #[test]
    fn parse_rejects_garbage() {
        assert_eq!(
            parse_relfilename("pg_filenode.map"),
            Err(FilePathError::InvalidFileName)
        );
        assert_eq!(parse_relfilename("PG_VERSION"), Err(FilePathError::InvalidFileName));
        assert_eq!(
            parse_relfilename("16384_foo"),
            Err(FilePathError::InvalidForkName)
        );
        assert_eq!(parse_relfilename(""), Err(FilePathError::InvalidFileName));
    }

    #[test]
    fn relpaths() {
        let rel = RelFileNode {
            spcnode: DEFAULTTABLESPACE_OID,
            dbnode: 13325,
            relnode: 16384,
        };
        assert_eq!(relpath(&rel, MAIN_FORKNUM, 0), Utf8PathBuf::from("base/13325/16384"));
        assert_eq!(
            relpath(&rel, FSM_FORKNUM, 2),
            Utf8PathBuf::from("base/13325/16384_fsm.2")
        );

        let shared = RelFileNode {
            spcnode: GLOBALTABLESPACE_OID,
            dbnode: 0,
            relnode: 1262,
        };
        assert_eq!(relpath(&shared, MAIN_FORKNUM, 0), Utf8PathBuf::from("global/1262"));

        let user_spc = RelFileNode {
            spcnode: 16500,
            dbnode: 13325,
            relnode: 16501,
        };
        assert_eq!(
            relpath(&user_spc, MAIN_FORKNUM, 1),
            Utf8PathBuf::from("pg_tblspc/16500/PG_11_201809051/13325/16501.1")
        );
    }

    #[test]
    fn block_to_segment_math() {
        assert_eq!(block_to_segment(0), (0, 0));
        assert_eq!(block_to_segment(RELSEG_SIZE - 1), (0, RELSEG_SIZE - 1));
        assert_eq!(block_to_segment(RELSEG_SIZE), (1, 0));
        assert_eq!(block_to_segment(RELSEG_SIZE * 2 + 7), (2, 7));
    }
}
