//! The central reconciler.
//!
//! The model is the single source of truth for which repositories exist,
//! which peers are connected, the per-peer file-set views, and the
//! derived need lists. Every protocol message lands here, every outbound
//! index update leaves from here, and the scanner and pull engine feed
//! their results through it.
//!
//! All mutation happens through the model's operations under one state
//! lock; the lock is never held across I/O. Outbound traffic is enqueued
//! onto per-connection bounded queues whose write halves are owned by
//! the connection writer tasks, which breaks the model/connection
//! ownership cycle.

use crate::fileset::FileSet;
use crate::limit::TokenBucket;
use crate::scanner;
use bytes::Bytes;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::{mpsc, oneshot};
use weft_api::protocol::{
    self, ClusterConfig, Envelope, MsgType, RepoAnnounce, ResponseCode,
};
use weft_api::{
    BlockInfo, FileRecord, NodeId, RepoId, VersionClock, WeftError,
    WeftResult,
};

/// Quiet interval for coalescing outbound index updates after a burst of
/// local changes.
const COALESCE_QUIET: std::time::Duration =
    std::time::Duration::from_secs(1);

/// Outstanding block requests awaiting a peer's response, keyed by
/// request id. Shared between the model's peer handle and the
/// connection's reader task.
pub type PendingMap =
    Arc<Mutex<HashMap<u32, oneshot::Sender<WeftResult<Bytes>>>>>;

/// A registered connection as the model sees it: the send queue feeding
/// the connection's writer task, the request correlation state, and the
/// per-repository index send watermarks.
pub struct PeerHandle {
    /// Send queue for encoded frames. The writer task owns the other end.
    pub outbox: mpsc::Sender<Bytes>,

    /// Outstanding block requests on this connection.
    pub pending: PendingMap,

    /// Next request correlation id.
    pub next_request_id: Arc<AtomicU32>,

    /// Abort handles for the connection's reader and writer tasks.
    pub tasks: Vec<tokio::task::AbortHandle>,

    sent: HashMap<RepoId, u64>,
}

impl PeerHandle {
    /// Construct a handle around a connection's queues.
    pub fn new(
        outbox: mpsc::Sender<Bytes>,
        pending: PendingMap,
        next_request_id: Arc<AtomicU32>,
        tasks: Vec<tokio::task::AbortHandle>,
    ) -> Self {
        Self {
            outbox,
            pending,
            next_request_id,
            tasks,
            sent: HashMap::new(),
        }
    }
}

struct Repo {
    dir: PathBuf,
    read_only: bool,
    nodes: Vec<NodeId>,
    files: FileSet,
    pull_tx: Option<mpsc::Sender<String>>,
}

#[derive(Default)]
struct State {
    repos: HashMap<RepoId, Repo>,
    peers: HashMap<NodeId, PeerHandle>,
}

/// The outcome of serving a block request: data, or an error code for
/// the response message.
#[derive(Debug)]
pub enum Served {
    /// The verified block contents.
    Data(Bytes),
    /// The request could not be served; the code says why.
    Code(ResponseCode),
}

/// The central reconciliation state across repositories and peers.
pub struct Model {
    id: NodeId,
    client_name: String,
    client_version: String,
    clock: VersionClock,
    state: Mutex<State>,
    dirty_tx: mpsc::UnboundedSender<RepoId>,
}

impl std::fmt::Debug for Model {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Model").field("id", &self.id).finish()
    }
}

impl Model {
    /// Construct a model and spawn its index fan-out task.
    pub fn new(
        id: NodeId,
        client_name: impl Into<String>,
        client_version: impl Into<String>,
    ) -> Arc<Self> {
        let (dirty_tx, dirty_rx) = mpsc::unbounded_channel();
        let model = Arc::new(Self {
            id,
            client_name: client_name.into(),
            client_version: client_version.into(),
            clock: VersionClock::new(),
            state: Mutex::new(State::default()),
            dirty_tx,
        });
        tokio::task::spawn(coalesce_task(Arc::downgrade(&model), dirty_rx));
        model
    }

    /// This node's id.
    pub fn node_id(&self) -> &NodeId {
        &self.id
    }

    /// Register a repository. Idempotent: re-adding an existing id only
    /// refreshes the allowed peer list.
    pub fn add_repo(
        &self,
        repo: &RepoId,
        dir: &Path,
        read_only: bool,
        nodes: Vec<NodeId>,
    ) {
        let mut state = self.state.lock().unwrap();
        match state.repos.get_mut(repo) {
            Some(existing) => existing.nodes = nodes,
            None => {
                state.repos.insert(
                    repo.clone(),
                    Repo {
                        dir: dir.to_path_buf(),
                        read_only,
                        nodes,
                        files: FileSet::new(repo.clone(), self.id.clone()),
                        pull_tx: None,
                    },
                );
            }
        }
    }

    /// The repository ids currently registered.
    pub fn repos(&self) -> Vec<RepoId> {
        self.state.lock().unwrap().repos.keys().cloned().collect()
    }

    /// The on-disk root of a repository.
    pub fn repo_dir(&self, repo: &RepoId) -> Option<PathBuf> {
        self.state
            .lock()
            .unwrap()
            .repos
            .get(repo)
            .map(|r| r.dir.clone())
    }

    /// Whether a repository is read-only.
    pub fn is_read_only(&self, repo: &RepoId) -> bool {
        self.state
            .lock()
            .unwrap()
            .repos
            .get(repo)
            .map(|r| r.read_only)
            .unwrap_or(true)
    }

    /// Attach the pull job queue for a read-write repository.
    pub fn attach_pull_queue(
        &self,
        repo: &RepoId,
        tx: mpsc::Sender<String>,
    ) {
        if let Some(r) = self.state.lock().unwrap().repos.get_mut(repo) {
            r.pull_tx = Some(tx);
        }
    }

    /// Load every repository's persisted index snapshot. Must run before
    /// any connection is accepted. A corrupt snapshot is discarded and
    /// rebuilt by the next scan rather than keeping the node down.
    pub fn load_indexes(&self, conf_dir: &Path) {
        let mut state = self.state.lock().unwrap();
        for (repo, r) in state.repos.iter_mut() {
            let records = match crate::persist::load_index(conf_dir, repo)
            {
                Ok(records) => records,
                Err(e) => {
                    tracing::warn!("index snapshot for {repo}: {e}");
                    continue;
                }
            };
            tracing::debug!(target: "weft::idx", "loaded {} records for {repo}", records.len());
            for rec in records.iter() {
                self.clock.observe(rec.version);
            }
            r.files.restore_local(records);
        }
    }

    /// Persist every repository's local view.
    pub fn save_indexes(&self, conf_dir: &Path) -> WeftResult<()> {
        let snapshots: Vec<(RepoId, Vec<FileRecord>)> = {
            let state = self.state.lock().unwrap();
            state
                .repos
                .iter()
                .map(|(repo, r)| {
                    (repo.clone(), r.files.local_records().cloned().collect())
                })
                .collect()
        };
        for (repo, records) in snapshots {
            crate::persist::save_index(conf_dir, &repo, &records)?;
        }
        Ok(())
    }

    /// Run one scan pass over a repository and merge the result.
    /// Returns the number of changed records.
    pub async fn scan_once(
        &self,
        repo: &RepoId,
        limit: Option<Arc<TokenBucket>>,
    ) -> WeftResult<usize> {
        let (dir, prev) = {
            let state = self.state.lock().unwrap();
            let r = state
                .repos
                .get(repo)
                .ok_or_else(|| WeftError::other("unknown repository"))?;
            (r.dir.clone(), r.files.local_snapshot())
        };

        let clock_high = {
            // Seed a private clock past every version we have issued, so
            // the blocking scan can stamp versions without locking.
            let c = VersionClock::new();
            c.observe(self.clock.next());
            c
        };
        let records = tokio::task::spawn_blocking(move || {
            scanner::scan(&dir, &prev, &clock_high, limit.as_deref())
        })
        .await
        .map_err(|e| WeftError::other_src("scan task", e))??;

        let count = records.len();
        if count > 0 {
            for rec in records.iter() {
                self.clock.observe(rec.version);
            }
            self.scan_result(repo, records);
        }
        Ok(count)
    }

    /// Merge a completed scan into the local view. Content-unchanged
    /// records keep their existing version; pure mtime changes adopt the
    /// new mtime without bumping the version.
    pub fn scan_result(&self, repo: &RepoId, records: Vec<FileRecord>) {
        let mut dirty = false;
        {
            let mut state = self.state.lock().unwrap();
            let r = match state.repos.get_mut(repo) {
                Some(r) => r,
                None => return,
            };
            for mut rec in records {
                match r.files.local(&rec.name) {
                    Some(old) if old.content_eq(&rec) => {}
                    Some(old) if same_content_new_mtime(old, &rec) => {
                        rec.version = old.version;
                        r.files.apply_local_change(rec);
                        dirty = true;
                    }
                    _ => {
                        r.files.apply_local_change(rec);
                        dirty = true;
                    }
                }
            }
        }
        if dirty {
            let _ = self.dirty_tx.send(repo.clone());
        }
    }

    /// Adopt a record the pull engine has fully materialized on disk.
    pub fn record_pulled(&self, repo: &RepoId, record: FileRecord) {
        {
            let mut state = self.state.lock().unwrap();
            let r = match state.repos.get_mut(repo) {
                Some(r) => r,
                None => return,
            };
            self.clock.observe(record.version);
            r.files.apply_local_change(record);
        }
        let _ = self.dirty_tx.send(repo.clone());
    }

    /// The current need list for a repository.
    pub fn need_list(&self, repo: &RepoId) -> Vec<FileRecord> {
        self.state
            .lock()
            .unwrap()
            .repos
            .get(repo)
            .map(|r| r.files.need())
            .unwrap_or_default()
    }

    /// The global (supremum) record for a name.
    pub fn global_record(
        &self,
        repo: &RepoId,
        name: &str,
    ) -> Option<FileRecord> {
        self.state
            .lock()
            .unwrap()
            .repos
            .get(repo)
            .and_then(|r| r.files.global(name).map(|(_, rec)| rec.clone()))
    }

    /// The local record for a name.
    pub fn local_record(
        &self,
        repo: &RepoId,
        name: &str,
    ) -> Option<FileRecord> {
        self.state
            .lock()
            .unwrap()
            .repos
            .get(repo)
            .and_then(|r| r.files.local(name).cloned())
    }

    /// Connected peers whose view holds exactly `target`, i.e. the nodes
    /// its blocks can be requested from right now.
    pub fn availability(
        &self,
        repo: &RepoId,
        target: &FileRecord,
    ) -> Vec<NodeId> {
        let state = self.state.lock().unwrap();
        state
            .repos
            .get(repo)
            .map(|r| {
                r.files
                    .availability(target)
                    .into_iter()
                    .filter(|n| state.peers.contains_key(n))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Whether a live connection to this peer exists.
    pub fn connected_to(&self, peer: &NodeId) -> bool {
        self.state.lock().unwrap().peers.contains_key(peer)
    }

    /// Register a handshaked connection. Fails on duplicates. On success
    /// returns the initial frames (ClusterConfig, then one Index per
    /// shared repository) for the caller to enqueue.
    pub fn register_connection(
        &self,
        peer: &NodeId,
        handle: PeerHandle,
    ) -> WeftResult<Vec<Bytes>> {
        let mut state = self.state.lock().unwrap();
        if state.peers.contains_key(peer) {
            return Err(WeftError::protocol(format!(
                "duplicate connection to {peer}"
            )));
        }

        let mut handle = handle;
        let mut frames = Vec::new();

        let announce: Vec<RepoAnnounce> = state
            .repos
            .iter()
            .filter(|(_, r)| r.nodes.contains(peer))
            .map(|(repo, r)| RepoAnnounce::new(repo, r.nodes.iter()))
            .collect();
        frames.push(seal_frame(
            MsgType::ClusterConfig,
            &ClusterConfig {
                client_name: self.client_name.clone(),
                client_version: self.client_version.clone(),
                repositories: announce,
            },
        )?);

        for (repo, r) in state.repos.iter() {
            if !r.nodes.contains(peer) {
                continue;
            }
            frames.push(seal_frame(
                MsgType::Index,
                &protocol::Index::new(repo, r.files.local_records()),
            )?);
            handle.sent.insert(repo.clone(), r.files.local_sequence());
        }

        tracing::info!(target: "weft::net", "connected to {peer}");
        state.peers.insert(peer.clone(), handle);
        Ok(frames)
    }

    /// Drop a connection: abort its tasks, fail its outstanding block
    /// requests with a transient error, forget it. Idempotent.
    pub fn drop_connection(&self, peer: &NodeId, reason: &str) {
        let handle =
            match self.state.lock().unwrap().peers.remove(peer) {
                Some(h) => h,
                None => return,
            };
        tracing::info!(target: "weft::net", "dropped connection to {peer}: {reason}");
        for task in handle.tasks.iter() {
            task.abort();
        }
        let mut pending = handle.pending.lock().unwrap();
        for (_, tx) in pending.drain() {
            let _ = tx.send(Err(WeftError::transient(format!(
                "connection to {peer} lost: {reason}"
            ))));
        }
    }

    /// Enqueue a Close frame to every peer and drop the connections.
    pub async fn close_all(&self, reason: &str) {
        let targets: Vec<(NodeId, mpsc::Sender<Bytes>)> = {
            let state = self.state.lock().unwrap();
            state
                .peers
                .iter()
                .map(|(n, h)| (n.clone(), h.outbox.clone()))
                .collect()
        };
        if let Ok(frame) = seal_frame(
            MsgType::Close,
            &protocol::Close {
                reason: reason.to_string(),
            },
        ) {
            for (_, outbox) in targets.iter() {
                let _ = outbox.send(frame.clone()).await;
            }
        }
        // Let the writers flush the Close frames before they go away.
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        for (peer, _) in targets {
            self.drop_connection(&peer, reason);
        }
    }

    /// Handle a peer's ClusterConfig. Announced repositories this node
    /// does not share with the peer are logged and ignored.
    pub fn handle_cluster_config(
        &self,
        peer: &NodeId,
        msg: ClusterConfig,
    ) {
        let state = self.state.lock().unwrap();
        for announce in msg.repositories.iter() {
            let repo = RepoId::from(announce.id.clone());
            let shared = state
                .repos
                .get(&repo)
                .map(|r| r.nodes.contains(peer))
                .unwrap_or(false);
            if !shared {
                tracing::info!(
                    target: "weft::net",
                    "{peer} announces repository {repo} we do not share with it"
                );
            }
        }
        tracing::debug!(
            target: "weft::net",
            "{peer} runs {} {}",
            msg.client_name,
            msg.client_version
        );
    }

    /// Merge a received `Index` (replacing the peer's view) or
    /// `IndexUpdate` (incremental) and schedule pull jobs for anything
    /// newly needed.
    pub fn handle_index(
        &self,
        peer: &NodeId,
        repo: &RepoId,
        records: Vec<FileRecord>,
        initial: bool,
    ) -> WeftResult<()> {
        let (pull_tx, jobs) = {
            let mut state = self.state.lock().unwrap();
            let r = state.repos.get_mut(repo).ok_or_else(|| {
                WeftError::protocol(format!(
                    "{peer} references unknown repository {repo}"
                ))
            })?;
            if !r.nodes.contains(peer) {
                return Err(WeftError::protocol(format!(
                    "{peer} is not allowed on repository {repo}"
                )));
            }

            tracing::debug!(
                target: "weft::idx",
                "{} from {peer} for {repo}: {} records",
                if initial { "index" } else { "index update" },
                records.len()
            );

            if initial {
                r.files.replace_peer_view(peer, records);
            } else {
                r.files.merge_peer_view(peer, records);
            }

            if r.read_only || r.pull_tx.is_none() {
                (None, Vec::new())
            } else {
                let jobs: Vec<String> = r
                    .files
                    .need()
                    .into_iter()
                    .map(|rec| rec.name)
                    .collect();
                (r.pull_tx.clone(), jobs)
            }
        };

        if let Some(tx) = pull_tx {
            for name in jobs {
                tracing::debug!(target: "weft::need", "need {name}");
                if let Err(e) = tx.try_send(name) {
                    tracing::warn!(
                        "could not enqueue pull job: {e}"
                    );
                    break;
                }
            }
        }
        Ok(())
    }

    /// Serve a peer's block request against the current local record.
    ///
    /// The `(offset, size)` must match a block of the local record, and
    /// the data read from disk must still hash to the recorded block
    /// hash; on mismatch an error code is returned rather than stale
    /// data. A protocol error (unknown repository, unauthorized peer) is
    /// returned as `Err` and costs the peer its connection.
    pub async fn request_block(
        &self,
        peer: &NodeId,
        repo: &RepoId,
        name: &str,
        offset: u64,
        size: u32,
    ) -> WeftResult<Served> {
        let (path, want_hash) = {
            let state = self.state.lock().unwrap();
            let r = state.repos.get(repo).ok_or_else(|| {
                WeftError::protocol(format!(
                    "{peer} requests from unknown repository {repo}"
                ))
            })?;
            if !r.nodes.contains(peer) {
                return Err(WeftError::protocol(format!(
                    "{peer} is not allowed on repository {repo}"
                )));
            }
            let rec = match r.files.local(name) {
                Some(rec)
                    if !rec.is_deleted()
                        && !rec.is_invalid()
                        && !rec.is_directory()
                        && !rec.is_symlink() =>
                {
                    rec
                }
                _ => return Ok(Served::Code(ResponseCode::NoSuchFile)),
            };
            let block = match rec
                .blocks
                .iter()
                .find(|b| b.offset == offset && b.size == size)
            {
                Some(b) => b,
                None => {
                    return Ok(Served::Code(ResponseCode::InvalidRequest))
                }
            };
            (r.dir.join(rel_path(name)), block.hash.clone())
        };

        let data =
            match read_block(&path, offset, size as usize).await {
                Ok(d) => d,
                Err(e) => {
                    tracing::warn!(
                        "serving {repo}:{name} to {peer}: {e}"
                    );
                    return Ok(Served::Code(ResponseCode::GenericError));
                }
            };

        if Sha256::digest(&data).as_slice() != want_hash.as_ref() {
            // Disk content has drifted from the index; a rescan will
            // publish the new record.
            tracing::warn!(
                "serving {repo}:{name} to {peer}: on-disk data no longer matches index"
            );
            return Ok(Served::Code(ResponseCode::GenericError));
        }
        Ok(Served::Data(data.into()))
    }

    /// Request one block from a peer and await the verified response
    /// payload. Fails transient when the peer is not connected, the
    /// connection dies mid-request, or the peer answers with an error
    /// code.
    pub async fn fetch_block(
        &self,
        peer: &NodeId,
        repo: &RepoId,
        name: &str,
        block: &BlockInfo,
    ) -> WeftResult<Bytes> {
        let (outbox, pending, id) = {
            let state = self.state.lock().unwrap();
            let h = state.peers.get(peer).ok_or_else(|| {
                WeftError::transient(format!("{peer} is not connected"))
            })?;
            (
                h.outbox.clone(),
                h.pending.clone(),
                h.next_request_id.fetch_add(1, Ordering::Relaxed),
            )
        };

        let (tx, rx) = oneshot::channel();
        pending.lock().unwrap().insert(id, tx);

        let frame = seal_frame(
            MsgType::Request,
            &protocol::Request {
                id,
                repo: repo.to_string(),
                name: name.to_string(),
                offset: block.offset,
                size: block.size,
            },
        )?;
        if outbox.send(frame).await.is_err() {
            pending.lock().unwrap().remove(&id);
            return Err(WeftError::transient(format!(
                "connection to {peer} is closing"
            )));
        }

        match rx.await {
            Ok(result) => result,
            Err(_) => Err(WeftError::transient(format!(
                "connection to {peer} lost"
            ))),
        }
    }
}

/// `true` when only the mtime differs: same flags, same size, same block
/// hash sequence.
fn same_content_new_mtime(old: &FileRecord, new: &FileRecord) -> bool {
    old.flags == new.flags
        && old.size() == new.size()
        && old.blocks.len() == new.blocks.len()
        && old
            .blocks
            .iter()
            .zip(new.blocks.iter())
            .all(|(a, b)| a.hash == b.hash)
}

/// Turn a forward-slash wire name into a relative platform path.
pub(crate) fn rel_path(name: &str) -> PathBuf {
    name.split('/').collect()
}

fn seal_frame<M: prost::Message>(
    ty: MsgType,
    msg: &M,
) -> WeftResult<Bytes> {
    Envelope::seal(ty, protocol::encode_message(msg))?.to_frame()
}

async fn read_block(
    path: &Path,
    offset: u64,
    size: usize,
) -> std::io::Result<Vec<u8>> {
    use tokio::io::{AsyncReadExt, AsyncSeekExt};
    let mut file = tokio::fs::File::open(path).await?;
    file.seek(std::io::SeekFrom::Start(offset)).await?;
    let mut buf = vec![0u8; size];
    file.read_exact(&mut buf).await?;
    Ok(buf)
}

async fn coalesce_task(
    model: Weak<Model>,
    mut dirty_rx: mpsc::UnboundedReceiver<RepoId>,
) {
    loop {
        let first = match dirty_rx.recv().await {
            Some(repo) => repo,
            None => return,
        };
        let mut dirty = vec![first];

        // Absorb the rest of the burst: flush once a full quiet interval
        // passes without further changes.
        loop {
            match tokio::time::timeout(COALESCE_QUIET, dirty_rx.recv())
                .await
            {
                Ok(Some(repo)) => dirty.push(repo),
                Ok(None) => return,
                Err(_) => break,
            }
        }
        dirty.sort();
        dirty.dedup();

        let model = match model.upgrade() {
            Some(m) => m,
            None => return,
        };

        let sends: Vec<(mpsc::Sender<Bytes>, Bytes)> = {
            let mut state = model.state.lock().unwrap();
            let mut out = Vec::new();
            let State { repos, peers } = &mut *state;
            for repo in dirty.iter() {
                let r = match repos.get(repo) {
                    Some(r) => r,
                    None => continue,
                };
                for (peer, handle) in peers.iter_mut() {
                    if !r.nodes.contains(peer) {
                        continue;
                    }
                    let watermark =
                        handle.sent.get(repo).copied().unwrap_or(0);
                    let changes = r.files.changes_since(watermark);
                    if changes.is_empty() {
                        continue;
                    }
                    let frame = match seal_frame(
                        MsgType::IndexUpdate,
                        &protocol::Index::new(repo, changes.iter()),
                    ) {
                        Ok(f) => f,
                        Err(e) => {
                            tracing::warn!("encode index update: {e}");
                            continue;
                        }
                    };
                    handle
                        .sent
                        .insert(repo.clone(), r.files.local_sequence());
                    tracing::debug!(
                        target: "weft::idx",
                        "index update for {repo} to {peer}: {} records",
                        changes.len()
                    );
                    out.push((handle.outbox.clone(), frame));
                }
            }
            out
        };

        for (outbox, frame) in sends {
            // A full queue applies backpressure here, never on a reader.
            let _ = outbox.send(frame).await;
        }
    }
}
