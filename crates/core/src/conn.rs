//! The connection supervisor.
//!
//! Produces a stream of authenticated, ready-to-use peer connections:
//! one accept loop per listen address and one outbound dial loop, both
//! feeding a single fan-in queue whose consumer validates the peer
//! certificate against the configured NodeIds and registers the
//! connection with the model. Each registered connection gets a reader
//! task (owning the read half) and a writer task (owning the write half
//! and the rate limiter); senders reach the writer only through the
//! connection's bounded outbound queue.

use crate::identity::Identity;
use crate::limit::TokenBucket;
use crate::model::{Model, PeerHandle, PendingMap, Served};
use bytes::Bytes;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::AtomicU32;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_rustls::{TlsAcceptor, TlsConnector, TlsStream};
use weft_api::protocol::{
    self, Envelope, MsgType, ResponseCode, DEFAULT_PORT, MAX_FRAME_LEN,
};
use weft_api::{
    DynDiscovery, FileRecord, NodeId, RepoId, WeftError, WeftResult,
};

const DIAL_TIMEOUT: Duration = Duration::from_secs(10);
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
/// Ping after this much write idleness.
const PING_INTERVAL: Duration = Duration::from_secs(30);
/// Close a connection with no inbound bytes for this long.
const RECV_TIMEOUT: Duration = Duration::from_secs(60);
/// Depth of each connection's outbound frame queue.
const OUTBOX_DEPTH: usize = 64;

/// Supervisor configuration, taken from the configuration snapshot at
/// startup.
pub struct SupervisorOptions {
    /// Listen addresses, `host:port` or `:port`.
    pub listen_addresses: Vec<String>,

    /// Every configured peer and its dial addresses. The literal address
    /// `dynamic` resolves through the discovery collaborator.
    pub known_peers: Vec<(NodeId, Vec<String>)>,

    /// Seconds between outbound dial sweeps.
    pub reconnect_interval: Duration,

    /// Shared send rate limiter, when a global ceiling is configured.
    pub limiter: Option<Arc<TokenBucket>>,

    /// The discovery collaborator.
    pub discovery: DynDiscovery,
}

/// The running supervisor. Dropping it aborts every task it spawned;
/// established connections are torn down through the model.
pub struct Supervisor {
    local_addrs: Vec<SocketAddr>,
    tasks: Vec<tokio::task::JoinHandle<()>>,
}

impl Drop for Supervisor {
    fn drop(&mut self) {
        for t in self.tasks.iter() {
            t.abort();
        }
    }
}

impl Supervisor {
    /// The locally bound listen addresses, ports resolved.
    pub fn local_addrs(&self) -> &[SocketAddr] {
        &self.local_addrs
    }

    /// Bind the listeners, then spawn the accept loops, the dial loop
    /// and the validation task.
    pub async fn start(
        model: Arc<Model>,
        identity: &Identity,
        opts: SupervisorOptions,
    ) -> WeftResult<Self> {
        let acceptor =
            TlsAcceptor::from(Arc::new(identity.server_config()?));
        let connector =
            TlsConnector::from(Arc::new(identity.client_config()?));

        let (conn_tx, conn_rx) =
            mpsc::channel::<TlsStream<TcpStream>>(16);
        let mut tasks = Vec::new();
        let mut local_addrs = Vec::new();

        for addr in opts.listen_addresses.iter() {
            let addr = normalize_listen_addr(addr);
            let listener = TcpListener::bind(&addr).await.map_err(|e| {
                WeftError::fatal_src(format!("listen on {addr}"), e)
            })?;
            let local = listener.local_addr().map_err(|e| {
                WeftError::fatal_src("listener local addr", e)
            })?;
            tracing::info!(target: "weft::net", "listening on {local}");
            local_addrs.push(local);
            tasks.push(tokio::task::spawn(accept_loop(
                listener,
                acceptor.clone(),
                conn_tx.clone(),
            )));
        }

        tasks.push(tokio::task::spawn(dial_loop(
            model.clone(),
            connector,
            conn_tx,
            opts.known_peers.clone(),
            opts.reconnect_interval,
            opts.discovery.clone(),
        )));

        let known: Vec<NodeId> =
            opts.known_peers.iter().map(|(n, _)| n.clone()).collect();
        tasks.push(tokio::task::spawn(validate_loop(
            model,
            conn_rx,
            known,
            opts.limiter.clone(),
        )));

        Ok(Self {
            local_addrs,
            tasks,
        })
    }
}

async fn accept_loop(
    listener: TcpListener,
    acceptor: TlsAcceptor,
    conn_tx: mpsc::Sender<TlsStream<TcpStream>>,
) {
    loop {
        let (tcp, remote) = match listener.accept().await {
            Ok(a) => a,
            Err(e) => {
                tracing::warn!(target: "weft::net", "accept: {e}");
                continue;
            }
        };
        tracing::debug!(target: "weft::net", "connect from {remote}");
        match tokio::time::timeout(
            HANDSHAKE_TIMEOUT,
            acceptor.accept(tcp),
        )
        .await
        {
            Ok(Ok(stream)) => {
                if conn_tx.send(stream.into()).await.is_err() {
                    return;
                }
            }
            Ok(Err(e)) => {
                tracing::warn!(target: "weft::net", "handshake with {remote}: {e}")
            }
            Err(_) => {
                tracing::warn!(target: "weft::net", "handshake with {remote} timed out")
            }
        }
    }
}

async fn dial_loop(
    model: Arc<Model>,
    connector: TlsConnector,
    conn_tx: mpsc::Sender<TlsStream<TcpStream>>,
    known_peers: Vec<(NodeId, Vec<String>)>,
    reconnect_interval: Duration,
    discovery: DynDiscovery,
) {
    let server_name =
        match rustls::pki_types::ServerName::try_from("weft") {
            Ok(n) => n,
            Err(_) => return,
        };

    loop {
        'next_peer: for (peer, configured) in known_peers.iter() {
            if peer == model.node_id() || model.connected_to(peer) {
                continue;
            }

            let mut addrs = Vec::new();
            for addr in configured.iter() {
                if addr == "dynamic" {
                    addrs.extend(discovery.lookup(peer.clone()).await);
                } else {
                    addrs.push(addr.clone());
                }
            }

            for addr in addrs {
                let addr = normalize_dial_addr(&addr);
                tracing::debug!(target: "weft::net", "dial {peer} at {addr}");
                let tcp = match tokio::time::timeout(
                    DIAL_TIMEOUT,
                    TcpStream::connect(&addr),
                )
                .await
                {
                    Ok(Ok(tcp)) => tcp,
                    Ok(Err(e)) => {
                        tracing::debug!(target: "weft::net", "dial {addr}: {e}");
                        continue;
                    }
                    Err(_) => {
                        tracing::debug!(target: "weft::net", "dial {addr}: timed out");
                        continue;
                    }
                };
                match tokio::time::timeout(
                    HANDSHAKE_TIMEOUT,
                    connector.connect(server_name.clone(), tcp),
                )
                .await
                {
                    Ok(Ok(stream)) => {
                        if conn_tx.send(stream.into()).await.is_err() {
                            return;
                        }
                        continue 'next_peer;
                    }
                    Ok(Err(e)) => {
                        tracing::debug!(target: "weft::net", "handshake {addr}: {e}")
                    }
                    Err(_) => {
                        tracing::debug!(target: "weft::net", "handshake {addr}: timed out")
                    }
                }
            }
        }
        tokio::time::sleep(reconnect_interval).await;
    }
}

/// The fan-in consumer: peer identity check and registration.
async fn validate_loop(
    model: Arc<Model>,
    mut conn_rx: mpsc::Receiver<TlsStream<TcpStream>>,
    known: Vec<NodeId>,
    limiter: Option<Arc<TokenBucket>>,
) {
    while let Some(stream) = conn_rx.recv().await {
        let certs = match stream.get_ref().1.peer_certificates() {
            Some(certs) => certs,
            None => {
                tracing::warn!(target: "weft::net", "peer presented no certificate");
                continue;
            }
        };
        if certs.len() != 1 {
            tracing::warn!(
                target: "weft::net",
                "peer certificate list of length {} != 1",
                certs.len()
            );
            continue;
        }
        let remote = NodeId::from_cert_der(certs[0].as_ref());

        if &remote == model.node_id() {
            tracing::warn!(target: "weft::net", "connected to myself ({remote})");
            continue;
        }
        if model.connected_to(&remote) {
            tracing::warn!(
                target: "weft::net",
                "connected to already connected node ({remote})"
            );
            continue;
        }
        if !known.contains(&remote) {
            tracing::warn!(target: "weft::net", "connection from unknown node {remote}");
            continue;
        }

        spawn_connection(
            model.clone(),
            remote,
            stream,
            limiter.clone(),
        )
        .await;
    }
}

async fn spawn_connection(
    model: Arc<Model>,
    peer: NodeId,
    stream: TlsStream<TcpStream>,
    limiter: Option<Arc<TokenBucket>>,
) {
    let (rd, wr) = tokio::io::split(stream);
    let (outbox_tx, outbox_rx) = mpsc::channel::<Bytes>(OUTBOX_DEPTH);
    let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));

    let writer = tokio::task::spawn(writer_task(
        model.clone(),
        peer.clone(),
        wr,
        outbox_rx,
        limiter,
    ));
    let reader = tokio::task::spawn(reader_task(
        model.clone(),
        peer.clone(),
        rd,
        pending.clone(),
        outbox_tx.clone(),
    ));

    let handle = PeerHandle::new(
        outbox_tx.clone(),
        pending,
        Arc::new(AtomicU32::new(1)),
        vec![reader.abort_handle(), writer.abort_handle()],
    );

    match model.register_connection(&peer, handle) {
        Ok(frames) => {
            for frame in frames {
                if outbox_tx.send(frame).await.is_err() {
                    break;
                }
            }
        }
        Err(e) => {
            tracing::warn!(target: "weft::net", "{e}");
            reader.abort();
            writer.abort();
        }
    }
}

async fn read_frame(
    rd: &mut ReadHalf<TlsStream<TcpStream>>,
) -> WeftResult<Option<Envelope>> {
    let mut len_buf = [0u8; 4];
    match rd.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            return Ok(None)
        }
        Err(e) => return Err(WeftError::transient_src("read frame", e)),
    }
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_LEN {
        return Err(WeftError::protocol(format!(
            "frame of {len} bytes exceeds the frame ceiling"
        )));
    }
    let mut body = vec![0u8; len];
    rd.read_exact(&mut body)
        .await
        .map_err(|e| WeftError::transient_src("read frame body", e))?;
    Envelope::from_frame_body(body.into()).map(Some)
}

async fn reader_task(
    model: Arc<Model>,
    peer: NodeId,
    mut rd: ReadHalf<TlsStream<TcpStream>>,
    pending: PendingMap,
    outbox: mpsc::Sender<Bytes>,
) {
    let reason =
        match read_loop(&model, &peer, &mut rd, &pending, &outbox).await
        {
            Ok(reason) => reason,
            Err(e) => e.to_string(),
        };
    model.drop_connection(&peer, &reason);
}

async fn read_loop(
    model: &Arc<Model>,
    peer: &NodeId,
    rd: &mut ReadHalf<TlsStream<TcpStream>>,
    pending: &PendingMap,
    outbox: &mpsc::Sender<Bytes>,
) -> WeftResult<String> {
    let mut got_cluster_config = false;
    loop {
        let env = match tokio::time::timeout(RECV_TIMEOUT, read_frame(rd))
            .await
        {
            Ok(Ok(Some(env))) => env,
            Ok(Ok(None)) => return Ok("closed by peer".into()),
            Ok(Err(e)) => return Err(e),
            Err(_) => {
                return Err(WeftError::transient("receive timeout"))
            }
        };
        let (ty, payload) = env.open()?;

        if !got_cluster_config && ty != MsgType::ClusterConfig {
            return Err(WeftError::protocol(format!(
                "{ty:?} before ClusterConfig"
            )));
        }

        match ty {
            MsgType::Unspecified => unreachable!("rejected by open"),
            MsgType::ClusterConfig => {
                if got_cluster_config {
                    return Err(WeftError::protocol(
                        "repeated ClusterConfig",
                    ));
                }
                got_cluster_config = true;
                model.handle_cluster_config(
                    peer,
                    protocol::decode_message(payload)?,
                );
            }
            MsgType::Index | MsgType::IndexUpdate => {
                let index: protocol::Index =
                    protocol::decode_message(payload)?;
                let repo = RepoId::from(index.repo.clone());
                let records: Vec<FileRecord> = index
                    .records
                    .into_iter()
                    .map(FileRecord::from)
                    .collect();
                model.handle_index(
                    peer,
                    &repo,
                    records,
                    ty == MsgType::Index,
                )?;
            }
            MsgType::Request => {
                let req: protocol::Request =
                    protocol::decode_message(payload)?;
                // Served off the reader so a slow disk or a full outbox
                // never stalls inbound traffic.
                let model = model.clone();
                let peer = peer.clone();
                let outbox = outbox.clone();
                tokio::task::spawn(async move {
                    serve_request(model, peer, req, outbox).await;
                });
            }
            MsgType::Response => {
                let resp: protocol::Response =
                    protocol::decode_message(payload)?;
                let waiter = pending.lock().unwrap().remove(&resp.id);
                if let Some(tx) = waiter {
                    let result = match ResponseCode::try_from(resp.code)
                    {
                        Ok(ResponseCode::Ok) => Ok(resp.data),
                        Ok(code) => Err(WeftError::transient(format!(
                            "{peer} answered {code:?}"
                        ))),
                        Err(_) => Err(WeftError::transient(format!(
                            "{peer} answered unknown code {}",
                            resp.code
                        ))),
                    };
                    let _ = tx.send(result);
                }
            }
            MsgType::Ping => {
                let outbox = outbox.clone();
                tokio::task::spawn(async move {
                    if let Ok(frame) = empty_frame(MsgType::Pong) {
                        let _ = outbox.send(frame).await;
                    }
                });
            }
            MsgType::Pong => {}
            MsgType::Close => {
                let close: protocol::Close =
                    protocol::decode_message(payload)?;
                return Ok(format!("closed by peer: {}", close.reason));
            }
        }
    }
}

async fn serve_request(
    model: Arc<Model>,
    peer: NodeId,
    req: protocol::Request,
    outbox: mpsc::Sender<Bytes>,
) {
    let repo = RepoId::from(req.repo.clone());
    let served = match model
        .request_block(&peer, &repo, &req.name, req.offset, req.size)
        .await
    {
        Ok(served) => served,
        Err(e) => {
            // Protocol violation: the request costs the connection.
            model.drop_connection(&peer, &e.to_string());
            return;
        }
    };
    let resp = match served {
        Served::Data(data) => protocol::Response {
            id: req.id,
            code: ResponseCode::Ok as i32,
            data,
        },
        Served::Code(code) => protocol::Response {
            id: req.id,
            code: code as i32,
            data: Bytes::new(),
        },
    };
    match Envelope::seal(
        MsgType::Response,
        protocol::encode_message(&resp),
    )
    .and_then(|env| env.to_frame())
    {
        Ok(frame) => {
            let _ = outbox.send(frame).await;
        }
        Err(e) => tracing::warn!("encode response: {e}"),
    }
}

fn empty_frame(ty: MsgType) -> WeftResult<Bytes> {
    Envelope::seal(ty, Bytes::new())?.to_frame()
}

async fn writer_task(
    model: Arc<Model>,
    peer: NodeId,
    mut wr: WriteHalf<TlsStream<TcpStream>>,
    mut outbox_rx: mpsc::Receiver<Bytes>,
    limiter: Option<Arc<TokenBucket>>,
) {
    let mut idle_check =
        tokio::time::interval(Duration::from_secs(5));
    let mut last_write = Instant::now();

    let reason = loop {
        tokio::select! {
            item = outbox_rx.recv() => match item {
                Some(frame) => {
                    if let Some(limiter) = limiter.as_ref() {
                        limiter.throttle(frame.len() as u64).await;
                    }
                    if let Err(e) = wr.write_all(&frame).await {
                        break format!("write: {e}");
                    }
                    last_write = Instant::now();
                }
                None => {
                    let _ = wr.shutdown().await;
                    break "shutting down".to_string();
                }
            },
            _ = idle_check.tick() => {
                if last_write.elapsed() >= PING_INTERVAL {
                    let frame = match empty_frame(MsgType::Ping) {
                        Ok(f) => f,
                        Err(_) => continue,
                    };
                    if let Err(e) = wr.write_all(&frame).await {
                        break format!("write ping: {e}");
                    }
                    last_write = Instant::now();
                }
            }
        }
    };
    model.drop_connection(&peer, &reason);
}

/// `:22000` binds every interface; a bare host gets the default port.
fn normalize_listen_addr(addr: &str) -> String {
    if let Some(port) = addr.strip_prefix(':') {
        format!("0.0.0.0:{port}")
    } else if !addr.contains(':') {
        format!("{addr}:{DEFAULT_PORT}")
    } else {
        addr.to_string()
    }
}

/// Apply the default port to dial addresses without one.
fn normalize_dial_addr(addr: &str) -> String {
    if !addr.contains(':') {
        format!("{addr}:{DEFAULT_PORT}")
    } else if let Some(host) = addr.strip_suffix(':') {
        format!("{host}:{DEFAULT_PORT}")
    } else {
        addr.to_string()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn listen_addr_normalization() {
        assert_eq!("0.0.0.0:22000", normalize_listen_addr(":22000"));
        assert_eq!("10.0.0.1:22000", normalize_listen_addr("10.0.0.1"));
        assert_eq!(
            "10.0.0.1:9999",
            normalize_listen_addr("10.0.0.1:9999")
        );
    }

    #[test]
    fn dial_addr_normalization() {
        assert_eq!("192.0.2.1:22000", normalize_dial_addr("192.0.2.1"));
        assert_eq!("192.0.2.1:22000", normalize_dial_addr("192.0.2.1:"));
        assert_eq!("192.0.2.1:4242", normalize_dial_addr("192.0.2.1:4242"));
    }
}
