//! The file record data model: the metadata and block list describing one
//! repository entry at one version.

use crate::NodeId;
use bytes::Bytes;

/// The fixed block size. Every block of a file is exactly this long
/// except the final one.
pub const BLOCK_SIZE: u64 = 128 * 1024;

/// Flag bits: the low 12 bits carry the unix permission bits.
pub const FLAG_PERM_MASK: u32 = 0o7777;
/// Flag bit: the entry has been deleted.
pub const FLAG_DELETED: u32 = 1 << 12;
/// Flag bit: the entry could not be read by the scanner and carries no
/// usable block list.
pub const FLAG_INVALID: u32 = 1 << 13;
/// Flag bit: the entry is a directory.
pub const FLAG_DIRECTORY: u32 = 1 << 14;
/// Flag bit: the entry is a symlink.
pub const FLAG_SYMLINK: u32 = 1 << 15;

/// One fixed-size span of a file, identified by its SHA-256 hash.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockInfo {
    /// Byte offset of this block within the file.
    pub offset: u64,

    /// Length of this block in bytes. Always [BLOCK_SIZE] except for the
    /// final block of a file.
    pub size: u32,

    /// SHA-256 of the block contents.
    pub hash: Bytes,
}

/// The latest known state of one (repository, path) entry as reported by
/// some node.
///
/// Records are replaced, never mutated in place: a newer observation from
/// scan or peer supersedes the whole record.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FileRecord {
    /// Repository-relative path, forward-slash separated, NFC-normalized.
    pub name: String,

    /// Bitfield of [FLAG_DELETED], [FLAG_INVALID], [FLAG_DIRECTORY],
    /// [FLAG_SYMLINK] and the unix permission bits.
    pub flags: u32,

    /// Modification time, integer seconds since the unix epoch.
    pub modified: i64,

    /// Monotonically increasing change counter, owned by the node that
    /// originated this version of the record.
    pub version: u64,

    /// Receive sequence, scoped per (repository, reporting node). Used
    /// for delta index replication, never compared across nodes.
    pub local_version: u64,

    /// Ordered block list. Empty for directories and deleted entries.
    pub blocks: Vec<BlockInfo>,
}

impl FileRecord {
    /// `true` if the deleted flag bit is set.
    pub fn is_deleted(&self) -> bool {
        self.flags & FLAG_DELETED != 0
    }

    /// `true` if the invalid flag bit is set.
    pub fn is_invalid(&self) -> bool {
        self.flags & FLAG_INVALID != 0
    }

    /// `true` if the directory flag bit is set.
    pub fn is_directory(&self) -> bool {
        self.flags & FLAG_DIRECTORY != 0
    }

    /// `true` if the symlink flag bit is set.
    pub fn is_symlink(&self) -> bool {
        self.flags & FLAG_SYMLINK != 0
    }

    /// The unix permission bits.
    pub fn permissions(&self) -> u32 {
        self.flags & FLAG_PERM_MASK
    }

    /// Total file size implied by the block list.
    pub fn size(&self) -> u64 {
        self.blocks.iter().map(|b| b.size as u64).sum()
    }

    /// Equality over the replicated fields: everything except
    /// `local_version`, which is scoped to the reporting node.
    pub fn wire_eq(&self, other: &FileRecord) -> bool {
        self.name == other.name
            && self.flags == other.flags
            && self.modified == other.modified
            && self.version == other.version
            && self.blocks == other.blocks
    }

    /// Content equality: `(flags, modified, size, block hash sequence)`.
    ///
    /// A rescan that observes content equality keeps the existing record
    /// version rather than bumping it.
    pub fn content_eq(&self, other: &FileRecord) -> bool {
        self.flags == other.flags
            && self.modified == other.modified
            && self.size() == other.size()
            && self.blocks.len() == other.blocks.len()
            && self
                .blocks
                .iter()
                .zip(other.blocks.iter())
                .all(|(a, b)| a.hash == b.hash)
    }
}

/// The record ordering that drives reconciliation: `true` if record `a`
/// (reported by node `a_node`) supersedes record `b` (reported by
/// `b_node`).
///
/// Strictly greater `version` wins; an equal `version` is broken by
/// lexicographic NodeId comparison, lower id winning. The relation is
/// total, antisymmetric and transitive for distinct `(version, node)`
/// pairs, so every node in the cluster agrees on the winner.
pub fn supersedes(
    a_node: &NodeId,
    a: &FileRecord,
    b_node: &NodeId,
    b: &FileRecord,
) -> bool {
    a.version > b.version || (a.version == b.version && a_node < b_node)
}

/// The `(offset, size)` spans a file of length `len` divides into.
///
/// Zero-length files carry an empty block list.
pub fn block_spans(len: u64) -> Vec<(u64, u32)> {
    let mut out = Vec::with_capacity(len.div_ceil(BLOCK_SIZE) as usize);
    let mut offset = 0;
    while offset < len {
        let size = (len - offset).min(BLOCK_SIZE) as u32;
        out.push((offset, size));
        offset += size as u64;
    }
    out
}

#[cfg(test)]
mod test {
    use super::*;

    fn rec(version: u64) -> FileRecord {
        FileRecord {
            name: "a.txt".into(),
            version,
            ..Default::default()
        }
    }

    #[test]
    fn higher_version_wins() {
        let (x, y) = (NodeId::from("X"), NodeId::from("Y"));
        assert!(supersedes(&y, &rec(2), &x, &rec(1)));
        assert!(!supersedes(&x, &rec(1), &y, &rec(2)));
    }

    #[test]
    fn version_tie_breaks_on_lower_node_id() {
        let (x, y) = (NodeId::from("X"), NodeId::from("Y"));
        assert!(supersedes(&x, &rec(1), &y, &rec(1)));
        assert!(!supersedes(&y, &rec(1), &x, &rec(1)));
    }

    #[test]
    fn ordering_is_total_antisymmetric_transitive() {
        let candidates = [
            (NodeId::from("A"), rec(1)),
            (NodeId::from("B"), rec(1)),
            (NodeId::from("A"), rec(2)),
            (NodeId::from("C"), rec(3)),
        ];

        for (an, a) in candidates.iter() {
            for (bn, b) in candidates.iter() {
                if (an, a.version) == (bn, b.version) {
                    continue;
                }
                // Total and antisymmetric: exactly one direction wins.
                assert_ne!(
                    supersedes(an, a, bn, b),
                    supersedes(bn, b, an, a),
                );
                for (cn, c) in candidates.iter() {
                    if supersedes(an, a, bn, b) && supersedes(bn, b, cn, c) {
                        assert!(supersedes(an, a, cn, c));
                    }
                }
            }
        }
    }

    #[test]
    fn content_eq_ignores_version() {
        let mut a = rec(1);
        let mut b = rec(2);
        a.modified = 100;
        b.modified = 100;
        b.local_version = 17;
        assert!(a.content_eq(&b));
        b.modified = 101;
        assert!(!a.content_eq(&b));
    }

    #[test]
    fn block_span_edges() {
        assert!(block_spans(0).is_empty());
        assert_eq!(vec![(0, 1)], block_spans(1));
        assert_eq!(vec![(0, BLOCK_SIZE as u32)], block_spans(BLOCK_SIZE));
        assert_eq!(
            vec![(0, BLOCK_SIZE as u32), (BLOCK_SIZE, 1)],
            block_spans(BLOCK_SIZE + 1)
        );
        assert_eq!(3, block_spans(3 * BLOCK_SIZE).len());
    }
}
