//! The pull engine.
//!
//! One puller per read-write repository materializes the need list onto
//! disk. A pool of workers consumes a job queue fed by the model (fast
//! path) and by a periodic sweep over the need list (catch-up path).
//! Each worker resolves the target record, fetches its blocks from
//! peers that hold it — reusing blocks the existing local file already
//! has — assembles them in a temp file, and atomically renames the
//! result into place. Only then is the local record updated.
//!
//! A per-name in-flight set prevents two workers from touching the same
//! name, and failed names retry on an exponential backoff rather than
//! the sweep cadence alone.

use crate::model::{rel_path, Model};
use crate::scanner::TMP_SUFFIX;
use backon::{BackoffBuilder, ExponentialBuilder};
use bytes::Bytes;
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tokio::sync::mpsc;
use weft_api::{FileRecord, NodeId, RepoId, WeftError, WeftResult};

/// Cadence of the need-list sweep that re-feeds the job queue.
const SWEEP_INTERVAL: Duration = Duration::from_secs(10);

const FIRST_RETRY_DELAY: Duration = Duration::from_secs(5);
const LAST_RETRY_DELAY: Duration = Duration::from_secs(300);
const RETRY_ATTEMPTS: usize = 6;

/// Retry pacing for names whose pulls keep failing.
///
/// Every failure pushes the name's next-attempt deadline out by the next
/// delay of an exponential schedule; workers simply skip a name whose
/// deadline has not passed, and the periodic sweep re-offers it. The
/// schedule itself is backon's exponential iterator, consumed one delay
/// per failure.
#[derive(Debug)]
struct RetrySchedule {
    first_delay: Duration,
    last_delay: Duration,
    max_attempts: usize,
    deadlines: HashMap<String, Retry>,
}

#[derive(Debug)]
struct Retry {
    delays: backon::ExponentialBackoff,
    until: Instant,
}

impl RetrySchedule {
    fn new(
        first_delay: Duration,
        last_delay: Duration,
        max_attempts: usize,
    ) -> Self {
        Self {
            first_delay,
            last_delay,
            max_attempts,
            deadlines: HashMap::new(),
        }
    }

    /// Whether a worker may attempt this name right now.
    fn ready(&self, name: &str) -> bool {
        self.deadlines
            .get(name)
            .map(|retry| Instant::now() >= retry.until)
            .unwrap_or(true)
    }

    /// Note a failed attempt, pushing the name's deadline out by its
    /// next delay. Returns `false` once the schedule is used up; the
    /// caller should then [RetrySchedule::clear] the name so a later
    /// attempt starts a fresh schedule.
    fn defer(&mut self, name: &str) -> bool {
        let (first, last, attempts) =
            (self.first_delay, self.last_delay, self.max_attempts);
        let retry = self
            .deadlines
            .entry(name.to_string())
            .or_insert_with(|| Retry {
                delays: ExponentialBuilder::default()
                    .with_factor(2.0)
                    .with_min_delay(first)
                    .with_max_delay(last)
                    .with_max_times(attempts)
                    .build(),
                until: Instant::now(),
            });
        match retry.delays.next() {
            Some(delay) => {
                retry.until = Instant::now() + delay;
                true
            }
            None => false,
        }
    }

    /// Forget a name, on success or to reset an exhausted schedule.
    fn clear(&mut self, name: &str) {
        self.deadlines.remove(name);
    }
}

#[derive(Debug)]
struct PullState {
    in_flight: HashSet<String>,
    retries: RetrySchedule,
}

/// The running pull engine for one repository. Dropping it aborts the
/// workers.
#[derive(Debug)]
pub struct Puller {
    tasks: Vec<tokio::task::JoinHandle<()>>,
}

impl Drop for Puller {
    fn drop(&mut self) {
        for t in self.tasks.iter() {
            t.abort();
        }
    }
}

impl Puller {
    /// Start `parallel` pull workers for a read-write repository and
    /// attach the job queue to the model.
    pub fn start(
        model: Arc<Model>,
        repo: RepoId,
        parallel: usize,
    ) -> Self {
        let (job_tx, job_rx) = mpsc::channel::<String>(16_384);
        let job_rx = Arc::new(tokio::sync::Mutex::new(job_rx));
        let state = Arc::new(Mutex::new(PullState {
            in_flight: HashSet::new(),
            retries: RetrySchedule::new(
                FIRST_RETRY_DELAY,
                LAST_RETRY_DELAY,
                RETRY_ATTEMPTS,
            ),
        }));

        if let Some(dir) = model.repo_dir(&repo) {
            tokio::task::spawn_blocking(move || discard_temp_files(&dir));
        }

        model.attach_pull_queue(&repo, job_tx.clone());

        let mut tasks = Vec::with_capacity(parallel + 1);
        for _ in 0..parallel.max(1) {
            tasks.push(tokio::task::spawn(pull_worker(
                model.clone(),
                repo.clone(),
                state.clone(),
                job_rx.clone(),
            )));
        }
        tasks.push(tokio::task::spawn(sweep_task(
            model,
            repo,
            job_tx,
        )));

        Self { tasks }
    }
}

/// Remove in-progress temp files left behind by a previous run.
fn discard_temp_files(dir: &Path) {
    for entry in walkdir::WalkDir::new(dir)
        .follow_links(false)
        .into_iter()
        .flatten()
    {
        let is_tmp = entry
            .file_name()
            .to_str()
            .map(|n| n.ends_with(TMP_SUFFIX))
            .unwrap_or(false);
        if is_tmp && entry.file_type().is_file() {
            if let Err(e) = std::fs::remove_file(entry.path()) {
                tracing::warn!(
                    "could not discard temp file {}: {e}",
                    entry.path().display()
                );
            }
        }
    }
}

async fn sweep_task(
    model: Arc<Model>,
    repo: RepoId,
    job_tx: mpsc::Sender<String>,
) {
    let mut tick = tokio::time::interval(SWEEP_INTERVAL);
    loop {
        tick.tick().await;
        for record in model.need_list(&repo) {
            if job_tx.try_send(record.name).is_err() {
                break;
            }
        }
    }
}

async fn pull_worker(
    model: Arc<Model>,
    repo: RepoId,
    state: Arc<Mutex<PullState>>,
    job_rx: Arc<tokio::sync::Mutex<mpsc::Receiver<String>>>,
) {
    loop {
        let name = match job_rx.lock().await.recv().await {
            Some(name) => name,
            None => return,
        };

        {
            let mut st = state.lock().unwrap();
            if st.in_flight.contains(&name) || !st.retries.ready(&name) {
                continue;
            }
            st.in_flight.insert(name.clone());
        }

        let result = pull_one(&model, &repo, &name).await;

        let mut st = state.lock().unwrap();
        st.in_flight.remove(&name);
        match result {
            Ok(()) => st.retries.clear(&name),
            Err(e) => {
                tracing::warn!(target: "weft::pull", "pull {repo}:{name}: {e}");
                if !st.retries.defer(&name) {
                    // Schedule used up; start fresh next time the sweep
                    // offers the name.
                    st.retries.clear(&name);
                }
            }
        }
    }
}

/// Bring one name up to its current global record. A no-op if the need
/// evaporated while the job was queued.
pub(crate) async fn pull_one(
    model: &Arc<Model>,
    repo: &RepoId,
    name: &str,
) -> WeftResult<()> {
    let target = match model.global_record(repo, name) {
        Some(t) => t,
        None => return Ok(()),
    };
    if target.is_invalid() {
        return Ok(());
    }
    let local = model.local_record(repo, name);
    if local.as_ref().map(|l| l.wire_eq(&target)).unwrap_or(false) {
        return Ok(());
    }
    let dir = match model.repo_dir(repo) {
        Some(d) => d,
        None => return Ok(()),
    };
    if model.is_read_only(repo) {
        return Ok(());
    }

    if target.is_deleted() {
        apply_deletion(&dir, &target).await?;
    } else if target.is_directory() {
        apply_directory(&dir, &target).await?;
    } else if target.is_symlink() {
        // Symlink presence replicates without target data; nothing to
        // put on disk.
        tracing::debug!(target: "weft::pull", "adopting symlink record {name}");
    } else {
        pull_file(model, repo, &dir, &target, local.as_ref()).await?;
    }

    model.record_pulled(repo, target);
    Ok(())
}

async fn apply_deletion(
    dir: &Path,
    target: &FileRecord,
) -> WeftResult<()> {
    let path = dir.join(rel_path(&target.name));
    let is_dir = target.is_directory();
    tokio::task::spawn_blocking(move || {
        let res = if is_dir {
            // Only empty directories go; the contents have their own
            // deletion records and go first.
            std::fs::remove_dir(&path)
        } else {
            std::fs::remove_file(&path)
        };
        match res {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(WeftError::io_src(
                format!("delete {}", path.display()),
                e,
            )),
        }
    })
    .await
    .map_err(|e| WeftError::other_src("delete task", e))?
}

async fn apply_directory(
    dir: &Path,
    target: &FileRecord,
) -> WeftResult<()> {
    let path = dir.join(rel_path(&target.name));
    let perms = target.permissions();
    tokio::task::spawn_blocking(move || {
        std::fs::create_dir_all(&path).map_err(|e| {
            WeftError::io_src(format!("mkdir {}", path.display()), e)
        })?;
        set_permissions(&path, perms)
    })
    .await
    .map_err(|e| WeftError::other_src("mkdir task", e))?
}

#[cfg(unix)]
fn set_permissions(path: &Path, mode: u32) -> WeftResult<()> {
    use std::os::unix::fs::PermissionsExt;
    if mode == 0 {
        return Ok(());
    }
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))
        .map_err(|e| {
            WeftError::io_src(format!("chmod {}", path.display()), e)
        })
}

#[cfg(not(unix))]
fn set_permissions(_path: &Path, _mode: u32) -> WeftResult<()> {
    Ok(())
}

fn temp_path(final_path: &Path) -> PathBuf {
    let file_name = final_path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    final_path.with_file_name(format!("{file_name}{TMP_SUFFIX}"))
}

async fn pull_file(
    model: &Arc<Model>,
    repo: &RepoId,
    dir: &Path,
    target: &FileRecord,
    local: Option<&FileRecord>,
) -> WeftResult<()> {
    let final_path = dir.join(rel_path(&target.name));
    let tmp_path = temp_path(&final_path);

    if let Some(parent) = final_path.parent() {
        tokio::fs::create_dir_all(parent).await.map_err(|e| {
            WeftError::io_src(
                format!("mkdir {}", parent.display()),
                e,
            )
        })?;
    }

    // Blocks the existing local file already holds, by hash.
    let reuse: HashMap<Bytes, u64> = local
        .map(|l| {
            l.blocks
                .iter()
                .map(|b| (b.hash.clone(), b.offset))
                .collect()
        })
        .unwrap_or_default();

    let result = assemble(
        model, repo, target, &final_path, &tmp_path, &reuse,
    )
    .await;
    if let Err(e) = result {
        let _ = tokio::fs::remove_file(&tmp_path).await;
        return Err(e);
    }

    let perms = target.permissions();
    let modified = target.modified;
    let tmp = tmp_path.clone();
    let dst = final_path.clone();
    let finalized =
        tokio::task::spawn_blocking(move || finalize(&tmp, &dst, perms, modified))
            .await
            .map_err(|e| WeftError::other_src("finalize task", e))?;
    if finalized.is_err() {
        let _ = tokio::fs::remove_file(&tmp_path).await;
    }
    finalized
}

async fn assemble(
    model: &Arc<Model>,
    repo: &RepoId,
    target: &FileRecord,
    final_path: &Path,
    tmp_path: &Path,
    reuse: &HashMap<Bytes, u64>,
) -> WeftResult<()> {
    let mut file =
        tokio::fs::File::create(tmp_path).await.map_err(|e| {
            WeftError::io_src(
                format!("create {}", tmp_path.display()),
                e,
            )
        })?;

    let mut rotation = 0usize;
    for block in target.blocks.iter() {
        let data = match reuse.get(&block.hash) {
            Some(&offset) => {
                let local =
                    read_local_block(final_path, offset, block.size)
                        .await
                        .filter(|data| {
                            Sha256::digest(data).as_slice()
                                == block.hash.as_ref()
                        });
                match local {
                    Some(data) => data,
                    None => {
                        fetch_block(model, repo, target, block, rotation)
                            .await?
                    }
                }
            }
            None => {
                let data =
                    fetch_block(model, repo, target, block, rotation)
                        .await?;
                rotation += 1;
                data
            }
        };
        file.seek(std::io::SeekFrom::Start(block.offset))
            .await
            .map_err(|e| WeftError::io_src("seek temp file", e))?;
        file.write_all(&data)
            .await
            .map_err(|e| WeftError::io_src("write temp file", e))?;
    }

    file.sync_all()
        .await
        .map_err(|e| WeftError::io_src("sync temp file", e))?;
    Ok(())
}

/// Read a block from the existing local file and verify it still hashes
/// as the index claims; `None` falls back to fetching.
async fn read_local_block(
    path: &Path,
    offset: u64,
    size: u32,
) -> Option<Bytes> {
    use tokio::io::AsyncReadExt;
    let mut file = tokio::fs::File::open(path).await.ok()?;
    file.seek(std::io::SeekFrom::Start(offset)).await.ok()?;
    let mut buf = vec![0u8; size as usize];
    file.read_exact(&mut buf).await.ok()?;
    Some(Bytes::from(buf))
}

/// Fetch one block from some connected peer that holds the target
/// record, starting the round-robin at `rotation` to spread load.
async fn fetch_block(
    model: &Arc<Model>,
    repo: &RepoId,
    target: &FileRecord,
    block: &weft_api::BlockInfo,
    rotation: usize,
) -> WeftResult<Bytes> {
    let peers: Vec<NodeId> = model.availability(repo, target);
    if peers.is_empty() {
        return Err(WeftError::transient(format!(
            "no connected peer holds {}",
            target.name
        )));
    }

    let n = peers.len();
    for i in 0..n {
        let peer = &peers[(rotation + i) % n];
        let data = match model
            .fetch_block(peer, repo, &target.name, block)
            .await
        {
            Ok(data) => data,
            Err(e) => {
                tracing::debug!(target: "weft::pull", "fetch from {peer}: {e}");
                continue;
            }
        };
        if data.len() != block.size as usize
            || Sha256::digest(&data).as_slice() != block.hash.as_ref()
        {
            // A wrong block is peer misbehavior, not bad luck.
            model.drop_connection(peer, "block hash mismatch");
            continue;
        }
        return Ok(data);
    }
    Err(WeftError::transient(format!(
        "no peer could serve a block of {}",
        target.name
    )))
}

fn finalize(
    tmp_path: &Path,
    final_path: &Path,
    perms: u32,
    modified: i64,
) -> WeftResult<()> {
    set_permissions(tmp_path, perms)?;

    let file = std::fs::File::options()
        .write(true)
        .open(tmp_path)
        .map_err(|e| WeftError::io_src("reopen temp file", e))?;
    let mtime = std::time::SystemTime::UNIX_EPOCH
        + Duration::from_secs(modified.max(0) as u64);
    file.set_modified(mtime)
        .map_err(|e| WeftError::io_src("set mtime", e))?;
    drop(file);

    std::fs::rename(tmp_path, final_path).map_err(|e| {
        WeftError::io_src(
            format!("rename into {}", final_path.display()),
            e,
        )
    })
}

#[cfg(test)]
mod test {
    use super::*;
    use weft_api::{
        BlockInfo, NodeId, FLAG_DELETED, FLAG_DIRECTORY,
    };

    fn file_record(name: &str, version: u64, data: &[u8]) -> FileRecord {
        FileRecord {
            name: name.into(),
            flags: 0o644,
            modified: 1_700_000_000,
            version,
            local_version: 0,
            blocks: vec![BlockInfo {
                offset: 0,
                size: data.len() as u32,
                hash: Bytes::from(Sha256::digest(data).to_vec()),
            }],
        }
    }

    fn model_with_repo(dir: &Path) -> Arc<Model> {
        let m = Model::new(NodeId::from("SELF"), "weft", "test");
        m.add_repo(
            &"r".into(),
            dir,
            false,
            vec![NodeId::from("SELF"), NodeId::from("PEER")],
        );
        m
    }

    #[tokio::test]
    async fn deletion_is_applied_and_adopted() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("a.txt"), b"hello").unwrap();
        let m = model_with_repo(tmp.path());
        let repo = RepoId::from("r");

        m.scan_result(&repo, vec![file_record("a.txt", 1, b"hello")]);

        let mut gone = file_record("a.txt", 2, b"");
        gone.flags = FLAG_DELETED;
        gone.blocks.clear();
        m.handle_index(&"PEER".into(), &repo, vec![gone.clone()], true)
            .unwrap();

        pull_one(&m, &repo, "a.txt").await.unwrap();

        assert!(!tmp.path().join("a.txt").exists());
        assert!(m.local_record(&repo, "a.txt").unwrap().is_deleted());
        assert!(m.need_list(&repo).is_empty());
    }

    #[tokio::test]
    async fn directory_records_create_directories() {
        let tmp = tempfile::tempdir().unwrap();
        let m = model_with_repo(tmp.path());
        let repo = RepoId::from("r");

        let mut dir_rec = file_record("sub", 1, b"");
        dir_rec.flags = FLAG_DIRECTORY | 0o755;
        dir_rec.blocks.clear();
        m.handle_index(&"PEER".into(), &repo, vec![dir_rec], true)
            .unwrap();

        pull_one(&m, &repo, "sub").await.unwrap();
        assert!(tmp.path().join("sub").is_dir());
        assert!(m.need_list(&repo).is_empty());
    }

    #[tokio::test]
    async fn full_block_reuse_needs_no_peer() {
        // The peer's record differs only in version; every block is
        // already on disk, so the pull completes with no connection.
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("a.txt"), b"same content").unwrap();
        let m = model_with_repo(tmp.path());
        let repo = RepoId::from("r");

        m.scan_result(
            &repo,
            vec![file_record("a.txt", 1, b"same content")],
        );
        let theirs = file_record("a.txt", 9, b"same content");
        m.handle_index(&"PEER".into(), &repo, vec![theirs.clone()], true)
            .unwrap();
        assert!(!m.need_list(&repo).is_empty());

        pull_one(&m, &repo, "a.txt").await.unwrap();

        assert_eq!(
            b"same content".to_vec(),
            std::fs::read(tmp.path().join("a.txt")).unwrap()
        );
        let local = m.local_record(&repo, "a.txt").unwrap();
        assert_eq!(9, local.version);
        assert!(m.need_list(&repo).is_empty());
        assert!(!temp_path(&tmp.path().join("a.txt")).exists());
    }

    #[tokio::test]
    async fn missing_peers_fail_transient_and_leave_no_temp() {
        let tmp = tempfile::tempdir().unwrap();
        let m = model_with_repo(tmp.path());
        let repo = RepoId::from("r");

        m.handle_index(
            &"PEER".into(),
            &repo,
            vec![file_record("a.txt", 1, b"hello")],
            true,
        )
        .unwrap();

        let err = pull_one(&m, &repo, "a.txt").await.unwrap_err();
        assert!(err.is_transient());
        assert!(!tmp.path().join("a.txt").exists());
        assert!(!temp_path(&tmp.path().join("a.txt")).exists());
        // Still needed; the sweep will retry it.
        assert!(!m.need_list(&repo).is_empty());
    }

    #[tokio::test]
    async fn read_only_repositories_never_write() {
        let tmp = tempfile::tempdir().unwrap();
        let m = Model::new(NodeId::from("SELF"), "weft", "test");
        let repo = RepoId::from("r");
        m.add_repo(
            &repo,
            tmp.path(),
            true,
            vec![NodeId::from("SELF"), NodeId::from("PEER")],
        );

        m.handle_index(
            &"PEER".into(),
            &repo,
            vec![file_record("a.txt", 1, b"hello")],
            true,
        )
        .unwrap();

        pull_one(&m, &repo, "a.txt").await.unwrap();
        assert!(!tmp.path().join("a.txt").exists());
    }

    #[test]
    fn retry_schedule_paces_and_exhausts() {
        let mut retries = RetrySchedule::new(
            Duration::from_millis(10),
            Duration::from_millis(20),
            2,
        );

        assert!(retries.ready("a.txt"));
        assert!(retries.defer("a.txt"));
        assert!(!retries.ready("a.txt"));
        assert!(retries.ready("other.txt"));

        std::thread::sleep(Duration::from_millis(15));
        assert!(retries.ready("a.txt"));

        // Two delays in the schedule, then it runs dry.
        assert!(retries.defer("a.txt"));
        assert!(!retries.defer("a.txt"));

        // Clearing resets to a fresh schedule.
        retries.clear("a.txt");
        assert!(retries.ready("a.txt"));
        assert!(retries.defer("a.txt"));
    }

    #[test]
    fn temp_files_are_discarded() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("keep.txt"), b"x").unwrap();
        std::fs::write(
            tmp.path().join(format!("gone.txt{TMP_SUFFIX}")),
            b"partial",
        )
        .unwrap();

        discard_temp_files(tmp.path());
        assert!(tmp.path().join("keep.txt").exists());
        assert!(!tmp
            .path()
            .join(format!("gone.txt{TMP_SUFFIX}"))
            .exists());
    }
}
