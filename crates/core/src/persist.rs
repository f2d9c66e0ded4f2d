//! On-disk index snapshots.
//!
//! One gzip-compressed file per repository under the configuration
//! directory, name pattern `<repo>.idx.gz`, holding the repository's
//! local view as length-delimited records. Loaded fully into memory at
//! startup, before any connection is accepted, and rewritten after
//! scans.

use bytes::{Buf, Bytes};
use flate2::{read::GzDecoder, write::GzEncoder, Compression};
use prost::Message;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use weft_api::{
    protocol::WireRecord, FileRecord, RepoId, WeftError, WeftResult,
};

/// The snapshot path for a repository.
pub fn index_path(conf_dir: &Path, repo: &RepoId) -> PathBuf {
    conf_dir.join(format!("{repo}.idx.gz"))
}

/// Write a snapshot of `records`, replacing any previous one atomically.
pub fn save_index(
    conf_dir: &Path,
    repo: &RepoId,
    records: &[FileRecord],
) -> WeftResult<()> {
    let path = index_path(conf_dir, repo);
    let tmp = conf_dir.join(format!("{repo}.idx.gz.tmp"));

    let file = std::fs::File::create(&tmp)
        .map_err(|e| WeftError::io_src("create index snapshot", e))?;
    let mut enc = GzEncoder::new(file, Compression::default());
    for record in records {
        let wire = WireRecord::from(record);
        enc.write_all(&wire.encode_length_delimited_to_vec())
            .map_err(|e| WeftError::io_src("write index snapshot", e))?;
    }
    let file = enc
        .finish()
        .map_err(|e| WeftError::io_src("finish index snapshot", e))?;
    file.sync_all()
        .map_err(|e| WeftError::io_src("sync index snapshot", e))?;
    std::fs::rename(&tmp, &path)
        .map_err(|e| WeftError::io_src("rename index snapshot", e))?;
    Ok(())
}

/// Load a repository's snapshot. A missing file is an empty index, a
/// corrupt one is an error.
pub fn load_index(
    conf_dir: &Path,
    repo: &RepoId,
) -> WeftResult<Vec<FileRecord>> {
    let path = index_path(conf_dir, repo);
    let file = match std::fs::File::open(&path) {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Ok(Vec::new())
        }
        Err(e) => return Err(WeftError::io_src("open index snapshot", e)),
    };

    let mut raw = Vec::new();
    GzDecoder::new(file)
        .read_to_end(&mut raw)
        .map_err(|e| WeftError::io_src("read index snapshot", e))?;

    let mut buf = Bytes::from(raw);
    let mut out = Vec::new();
    while buf.has_remaining() {
        let wire = WireRecord::decode_length_delimited(&mut buf)
            .map_err(|e| WeftError::io_src("decode index snapshot", e))?;
        out.push(FileRecord::from(wire));
    }
    Ok(out)
}

#[cfg(test)]
mod test {
    use super::*;
    use bytes::Bytes;
    use weft_api::BlockInfo;

    fn sample() -> Vec<FileRecord> {
        vec![
            FileRecord {
                name: "a.txt".into(),
                flags: 0o644,
                modified: 1_700_000_000,
                version: 41,
                local_version: 1,
                blocks: vec![BlockInfo {
                    offset: 0,
                    size: 5,
                    hash: Bytes::from_static(b"h1"),
                }],
            },
            FileRecord {
                name: "sub/b.txt".into(),
                flags: 0o600,
                modified: 1_700_000_001,
                version: 42,
                local_version: 2,
                blocks: Vec::new(),
            },
        ]
    }

    #[test]
    fn round_trip_preserves_records() {
        let tmp = tempfile::tempdir().unwrap();
        let repo = RepoId::from("default");
        let records = sample();

        save_index(tmp.path(), &repo, &records).unwrap();
        assert_eq!(records, load_index(tmp.path(), &repo).unwrap());
    }

    #[test]
    fn missing_snapshot_is_empty() {
        let tmp = tempfile::tempdir().unwrap();
        assert!(load_index(tmp.path(), &"nope".into()).unwrap().is_empty());
    }

    #[test]
    fn save_replaces_previous_snapshot() {
        let tmp = tempfile::tempdir().unwrap();
        let repo = RepoId::from("default");
        save_index(tmp.path(), &repo, &sample()).unwrap();
        save_index(tmp.path(), &repo, &sample()[..1]).unwrap();
        assert_eq!(1, load_index(tmp.path(), &repo).unwrap().len());
    }
}
