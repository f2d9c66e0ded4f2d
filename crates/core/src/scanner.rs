//! The content-hashing change scanner.
//!
//! A scan walks a repository root and brings the local view into
//! agreement with the filesystem: new and changed files are re-hashed
//! into fixed-size blocks, unchanged files keep their existing block
//! lists, and names that have vanished from disk are emitted as deleted
//! records. A scan either completes and returns the full change list or
//! fails without publishing anything.
//!
//! Scanning is blocking work and is expected to run on a blocking task.

use crate::limit::TokenBucket;
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};
use std::io::Read;
use std::path::Path;
use unicode_normalization::UnicodeNormalization;
use weft_api::{
    block_spans, BlockInfo, FileRecord, VersionClock, WeftError, WeftResult,
    BLOCK_SIZE, FLAG_DELETED, FLAG_DIRECTORY, FLAG_INVALID, FLAG_PERM_MASK,
    FLAG_SYMLINK,
};

/// Suffix of the pull engine's in-progress temp files. Never scanned,
/// never synced.
pub const TMP_SUFFIX: &str = ".weft.tmp";

/// Windows-reserved device names, skipped on every platform so a mixed
/// cluster cannot poison a Windows member.
const RESERVED_NAMES: &[&str] = &[
    "CON", "PRN", "AUX", "NUL", "COM1", "COM2", "COM3", "COM4", "COM5",
    "COM6", "COM7", "COM8", "COM9", "LPT1", "LPT2", "LPT3", "LPT4", "LPT5",
    "LPT6", "LPT7", "LPT8", "LPT9",
];

/// `true` if the walker must not descend into or report this name.
pub fn excluded(name: &str) -> bool {
    if name.starts_with('.') || name.ends_with(TMP_SUFFIX) {
        return true;
    }
    let stem = name.split('.').next().unwrap_or(name);
    RESERVED_NAMES
        .iter()
        .any(|r| stem.eq_ignore_ascii_case(r))
}

#[cfg(unix)]
fn permission_bits(meta: &std::fs::Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    meta.permissions().mode() & FLAG_PERM_MASK
}

#[cfg(not(unix))]
fn permission_bits(meta: &std::fs::Metadata) -> u32 {
    if meta.permissions().readonly() {
        0o444
    } else {
        0o644
    }
}

fn modified_secs(meta: &std::fs::Metadata) -> i64 {
    meta.modified()
        .ok()
        .and_then(|t| {
            t.duration_since(std::time::SystemTime::UNIX_EPOCH).ok()
        })
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// Hash a file into its block list, throttled by `limit` when set.
pub fn hash_blocks(
    path: &Path,
    limit: Option<&TokenBucket>,
) -> std::io::Result<Vec<BlockInfo>> {
    let mut file = std::fs::File::open(path)?;
    let mut blocks = Vec::new();
    let mut buf = vec![0u8; BLOCK_SIZE as usize];
    let mut offset = 0u64;
    loop {
        let mut filled = 0;
        while filled < buf.len() {
            let n = file.read(&mut buf[filled..])?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        if filled == 0 {
            break;
        }
        if let Some(limit) = limit {
            limit.throttle_blocking(filled as u64);
        }
        blocks.push(BlockInfo {
            offset,
            size: filled as u32,
            hash: bytes::Bytes::from(
                Sha256::digest(&buf[..filled]).to_vec(),
            ),
        });
        offset += filled as u64;
        if filled < buf.len() {
            break;
        }
    }
    Ok(blocks)
}

/// Walk `dir` and return the records that differ from `prev`, the
/// current local view.
///
/// Unchanged entries (same size and mtime for files, same permission
/// bits for directories) produce nothing. Names in `prev` that are gone
/// from disk come back as deleted records, unless the walk itself hit
/// errors, in which case deletion detection is skipped for this pass
/// rather than reporting unreachable files as deleted.
pub fn scan(
    dir: &Path,
    prev: &HashMap<String, FileRecord>,
    clock: &VersionClock,
    limit: Option<&TokenBucket>,
) -> WeftResult<Vec<FileRecord>> {
    if !dir.is_dir() {
        return Err(WeftError::io(format!(
            "repository root {} is not a directory",
            dir.display()
        )));
    }

    let mut out = Vec::new();
    let mut seen: HashSet<String> = HashSet::new();
    let mut walk_errors = false;

    let walker = walkdir::WalkDir::new(dir)
        .follow_links(false)
        .into_iter()
        .filter_entry(|e| {
            e.depth() == 0
                || e.file_name()
                    .to_str()
                    .map(|n| !excluded(n))
                    .unwrap_or(false)
        });

    for entry in walker {
        let entry = match entry {
            Ok(e) => e,
            Err(e) => {
                tracing::warn!("scan walk error: {e}");
                walk_errors = true;
                continue;
            }
        };
        if entry.depth() == 0 {
            continue;
        }
        let rel = match entry.path().strip_prefix(dir) {
            Ok(r) => r,
            Err(_) => continue,
        };
        // Record names are NFC so every node keys the same file the
        // same way regardless of what its filesystem hands back.
        let name: String = rel
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/")
            .nfc()
            .collect();

        seen.insert(name.clone());
        let old = prev.get(&name);

        let file_type = entry.file_type();
        if file_type.is_symlink() {
            // Symlink presence replicates; targets do not.
            if old.map(|o| o.is_symlink()).unwrap_or(false) {
                continue;
            }
            out.push(FileRecord {
                name,
                flags: FLAG_SYMLINK,
                modified: 0,
                version: clock.next(),
                local_version: 0,
                blocks: Vec::new(),
            });
            continue;
        }

        let meta = match entry.metadata() {
            Ok(m) => m,
            Err(e) => {
                tracing::warn!("scan stat {name}: {e}");
                walk_errors = true;
                continue;
            }
        };
        let perms = permission_bits(&meta);
        let modified = modified_secs(&meta);

        if file_type.is_dir() {
            let unchanged = old
                .map(|o| o.is_directory() && o.permissions() == perms)
                .unwrap_or(false);
            if unchanged {
                continue;
            }
            out.push(FileRecord {
                name,
                flags: FLAG_DIRECTORY | perms,
                modified,
                version: clock.next(),
                local_version: 0,
                blocks: Vec::new(),
            });
            continue;
        }

        let unchanged = old
            .map(|o| {
                !o.is_deleted()
                    && !o.is_invalid()
                    && !o.is_directory()
                    && !o.is_symlink()
                    && o.permissions() == perms
                    && o.modified == modified
                    && o.size() == meta.len()
            })
            .unwrap_or(false);
        if unchanged {
            continue;
        }

        match hash_blocks(entry.path(), limit) {
            Ok(blocks) => {
                debug_assert_eq!(
                    blocks.len(),
                    block_spans(blocks.iter().map(|b| b.size as u64).sum())
                        .len()
                );
                out.push(FileRecord {
                    name,
                    flags: perms,
                    modified,
                    version: clock.next(),
                    local_version: 0,
                    blocks,
                });
            }
            Err(e) => {
                tracing::warn!("scan hash {name}: {e}");
                if old.map(|o| o.is_invalid()).unwrap_or(false) {
                    continue;
                }
                out.push(FileRecord {
                    name,
                    flags: FLAG_INVALID | perms,
                    modified,
                    version: clock.next(),
                    local_version: 0,
                    blocks: Vec::new(),
                });
            }
        }
    }

    if !walk_errors {
        for (name, old) in prev.iter() {
            if old.is_deleted() || seen.contains(name) {
                continue;
            }
            out.push(FileRecord {
                name: name.clone(),
                flags: (old.flags & FLAG_DIRECTORY) | FLAG_DELETED,
                modified: old.modified,
                version: clock.next(),
                local_version: 0,
                blocks: Vec::new(),
            });
        }
    }

    Ok(out)
}

#[cfg(test)]
mod test {
    use super::*;

    fn write(dir: &Path, name: &str, data: &[u8]) {
        let path = dir.join(name);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(path, data).unwrap();
    }

    fn scan_into(
        dir: &Path,
        prev: &mut HashMap<String, FileRecord>,
        clock: &VersionClock,
    ) -> Vec<FileRecord> {
        let records = scan(dir, prev, clock, None).unwrap();
        for r in records.iter() {
            prev.insert(r.name.clone(), r.clone());
        }
        records
    }

    #[test]
    fn first_scan_reports_everything() {
        let tmp = tempfile::tempdir().unwrap();
        write(tmp.path(), "a.txt", b"hello");
        write(tmp.path(), "sub/b.txt", b"world");

        let clock = VersionClock::new();
        let mut prev = HashMap::new();
        let mut records = scan_into(tmp.path(), &mut prev, &clock);
        records.sort_by(|a, b| a.name.cmp(&b.name));

        let names: Vec<&str> =
            records.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(vec!["a.txt", "sub", "sub/b.txt"], names);
        assert!(records[1].is_directory());
        assert_eq!(5, records[0].size());
        assert_eq!(1, records[0].blocks.len());
        assert_eq!(
            Sha256::digest(b"hello").to_vec(),
            records[0].blocks[0].hash.to_vec()
        );
    }

    #[test]
    fn rescan_of_quiescent_tree_is_empty() {
        let tmp = tempfile::tempdir().unwrap();
        write(tmp.path(), "a.txt", b"hello");
        write(tmp.path(), "sub/b.txt", b"world");

        let clock = VersionClock::new();
        let mut prev = HashMap::new();
        scan_into(tmp.path(), &mut prev, &clock);
        assert!(scan(tmp.path(), &prev, &clock, None).unwrap().is_empty());
    }

    #[test]
    fn vanished_names_come_back_deleted() {
        let tmp = tempfile::tempdir().unwrap();
        write(tmp.path(), "a.txt", b"hello");

        let clock = VersionClock::new();
        let mut prev = HashMap::new();
        scan_into(tmp.path(), &mut prev, &clock);
        let old_version = prev["a.txt"].version;

        std::fs::remove_file(tmp.path().join("a.txt")).unwrap();
        let records = scan_into(tmp.path(), &mut prev, &clock);
        assert_eq!(1, records.len());
        assert!(records[0].is_deleted());
        assert!(records[0].blocks.is_empty());
        assert!(records[0].version > old_version);

        // A deleted record stays deleted without re-bumping.
        assert!(scan(tmp.path(), &prev, &clock, None).unwrap().is_empty());
    }

    #[test]
    fn content_change_is_rehashed() {
        let tmp = tempfile::tempdir().unwrap();
        write(tmp.path(), "a.txt", b"hello");

        let clock = VersionClock::new();
        let mut prev = HashMap::new();
        scan_into(tmp.path(), &mut prev, &clock);
        let v1 = prev["a.txt"].version;

        write(tmp.path(), "a.txt", b"hello world");
        let records = scan_into(tmp.path(), &mut prev, &clock);
        assert_eq!(1, records.len());
        assert!(records[0].version > v1);
        assert_eq!(11, records[0].size());
    }

    #[test]
    fn dotfiles_and_temp_files_are_excluded() {
        let tmp = tempfile::tempdir().unwrap();
        write(tmp.path(), "a.txt", b"x");
        write(tmp.path(), ".hidden", b"x");
        write(tmp.path(), ".hiddendir/inner.txt", b"x");
        write(tmp.path(), "b.txt.weft.tmp", b"x");

        let clock = VersionClock::new();
        let records =
            scan(tmp.path(), &HashMap::new(), &clock, None).unwrap();
        let names: Vec<&str> =
            records.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(vec!["a.txt"], names);
    }

    #[test]
    fn reserved_name_matching() {
        assert!(excluded("CON"));
        assert!(excluded("con"));
        assert!(excluded("lpt1.txt"));
        assert!(excluded(".anything"));
        assert!(excluded("data.weft.tmp"));
        assert!(!excluded("console.txt"));
        assert!(!excluded("a.txt"));
    }

    #[test]
    fn names_are_nfc_normalized() {
        let tmp = tempfile::tempdir().unwrap();
        // "e" followed by a combining acute accent: the decomposed
        // spelling of "é".
        write(tmp.path(), "e\u{0301}tude.txt", b"x");

        let clock = VersionClock::new();
        let records =
            scan(tmp.path(), &HashMap::new(), &clock, None).unwrap();
        assert_eq!(1, records.len());
        assert_eq!("\u{00e9}tude.txt", records[0].name);
    }

    #[test]
    fn multi_block_files_hash_per_block() {
        let tmp = tempfile::tempdir().unwrap();
        let data = vec![42u8; BLOCK_SIZE as usize + 17];
        write(tmp.path(), "big.bin", &data);

        let clock = VersionClock::new();
        let records =
            scan(tmp.path(), &HashMap::new(), &clock, None).unwrap();
        assert_eq!(1, records.len());
        let blocks = &records[0].blocks;
        assert_eq!(2, blocks.len());
        assert_eq!(BLOCK_SIZE as u32, blocks[0].size);
        assert_eq!(17, blocks[1].size);
        assert_eq!(BLOCK_SIZE, blocks[1].offset);
        assert_eq!(
            Sha256::digest(&data[BLOCK_SIZE as usize..]).to_vec(),
            blocks[1].hash.to_vec()
        );
    }
}
