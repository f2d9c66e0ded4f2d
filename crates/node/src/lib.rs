#![deny(missing_docs)]
//! The weft node runtime: wiring for the model, scanner tasks, pull
//! engines, connection supervisor, index persistence and the
//! configuration save task.
//!
//! The binary in `src/bin/weft-node.rs` is a thin shell around
//! [Node::start]; tests drive the same entry point in-process.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use weft_api::config::Config;
use weft_api::discovery::NullDiscovery;
use weft_api::{
    DynDiscovery, DynPortMapper, NodeId, RepoId, WeftError, WeftResult,
};
use weft_core::config_store::{self, ConfigSaver};
use weft_core::conn::{Supervisor, SupervisorOptions};
use weft_core::identity::Identity;
use weft_core::limit::TokenBucket;
use weft_core::model::Model;
use weft_core::puller::Puller;

/// How often indexes are persisted while running, besides after scans
/// and at shutdown.
const PERSIST_INTERVAL: Duration = Duration::from_secs(300);

/// Everything a node needs to start.
pub struct NodeOpts {
    /// The configuration directory holding identity material, the
    /// configuration file and index snapshots.
    pub conf_dir: PathBuf,

    /// The configuration snapshot to run with.
    pub config: Config,

    /// The discovery collaborator. Defaults to the null implementation.
    pub discovery: Option<DynDiscovery>,

    /// The NAT port mapping collaborator, if any.
    pub port_mapper: Option<DynPortMapper>,
}

/// A running node.
pub struct Node {
    model: Arc<Model>,
    supervisor: Supervisor,
    pullers: Vec<Puller>,
    tasks: Vec<tokio::task::JoinHandle<()>>,
    config_saver: ConfigSaver,
    conf_dir: PathBuf,
}

impl Node {
    /// Bring a node up: identity, repositories, persisted indexes, an
    /// initial scan, then connections, pull workers and the periodic
    /// tasks.
    pub async fn start(opts: NodeOpts) -> WeftResult<Self> {
        let NodeOpts {
            conf_dir,
            config,
            discovery,
            port_mapper,
        } = opts;

        std::fs::create_dir_all(&conf_dir).map_err(|e| {
            WeftError::fatal_src("create configuration directory", e)
        })?;
        let identity = Identity::load_or_generate(&conf_dir)?;
        let my_id = identity.node_id().clone();
        tracing::info!("my id: {my_id}");

        let model = Model::new(
            my_id.clone(),
            "weft",
            env!("CARGO_PKG_VERSION"),
        );

        let options = &config.options;
        let change_limit = (options.max_change_kbps > 0).then(|| {
            Arc::new(TokenBucket::new(
                options.max_change_kbps as u64 * 1024,
            ))
        });
        let send_limit = (options.max_send_kbps > 0).then(|| {
            Arc::new(TokenBucket::new(options.max_send_kbps as u64 * 1024))
        });

        for repo in config.repositories.iter() {
            let dir = PathBuf::from(config_store::expand_tilde(
                &repo.directory,
            ));
            std::fs::create_dir_all(&dir).map_err(|e| {
                WeftError::fatal_src(
                    format!("create repository directory {}", dir.display()),
                    e,
                )
            })?;
            let mut nodes: Vec<NodeId> =
                repo.node_ids().cloned().collect();
            nodes.sort();
            nodes.dedup();
            if !nodes.contains(&my_id) {
                nodes.push(my_id.clone());
            }
            model.add_repo(&repo.id, &dir, repo.read_only, nodes);
        }

        // Index snapshots and the initial scan happen before any
        // connection is accepted.
        tracing::info!("populating repository indexes");
        model.load_indexes(&conf_dir);
        for repo in model.repos() {
            match model.scan_once(&repo, change_limit.clone()).await {
                Ok(n) => tracing::info!(
                    "initial scan of {repo}: {n} changed records"
                ),
                Err(e) => {
                    tracing::warn!("initial scan of {repo}: {e}")
                }
            }
        }
        save_indexes(&model, &conf_dir).await;

        let external_port = match port_mapper.as_ref() {
            Some(mapper) => {
                try_port_mapping(mapper, &options.listen_address).await
            }
            None => 0,
        };

        let discovery =
            discovery.unwrap_or_else(NullDiscovery::create);
        if options.local_announce_enabled {
            discovery.start_local();
        }
        if options.global_announce_enabled {
            discovery.start_global(
                options.global_announce_server.clone(),
                external_port,
            );
        }

        // Pull queues attach before the first connection can deliver an
        // index.
        let mut pullers = Vec::new();
        for repo in model.repos() {
            if model.is_read_only(&repo) {
                tracing::info!(
                    "ready to synchronize {repo} (read only; no external updates accepted)"
                );
            } else {
                tracing::info!("ready to synchronize {repo} (read-write)");
                pullers.push(Puller::start(
                    model.clone(),
                    repo,
                    options.parallel_requests.max(1) as usize,
                ));
            }
        }

        let known_peers: Vec<(NodeId, Vec<String>)> = config
            .nodes
            .iter()
            .map(|n| (n.id.clone(), n.addresses.clone()))
            .collect();
        let supervisor = Supervisor::start(
            model.clone(),
            &identity,
            SupervisorOptions {
                listen_addresses: options.listen_address.clone(),
                known_peers,
                reconnect_interval: Duration::from_secs(
                    options.reconnect_interval_s.max(1) as u64,
                ),
                limiter: send_limit,
                discovery,
            },
        )
        .await?;

        let mut tasks = Vec::new();
        for repo in model.repos() {
            tasks.push(tokio::task::spawn(rescan_loop(
                model.clone(),
                repo,
                Duration::from_secs(
                    options.rescan_interval_s.max(1) as u64,
                ),
                change_limit.clone(),
                conf_dir.clone(),
            )));
        }
        tasks.push(tokio::task::spawn(persist_loop(
            model.clone(),
            conf_dir.clone(),
        )));

        let config_saver =
            ConfigSaver::spawn(conf_dir.join(config_store::CONFIG_FILE));

        Ok(Self {
            model,
            supervisor,
            pullers,
            tasks,
            config_saver,
            conf_dir,
        })
    }

    /// This node's id.
    pub fn node_id(&self) -> &NodeId {
        self.model.node_id()
    }

    /// The reconciliation model, for observability surfaces.
    pub fn model(&self) -> &Arc<Model> {
        &self.model
    }

    /// The configuration save handle, for operator actions.
    pub fn config_saver(&self) -> &ConfigSaver {
        &self.config_saver
    }

    /// The bound listen addresses.
    pub fn listen_addrs(&self) -> &[std::net::SocketAddr] {
        self.supervisor.local_addrs()
    }

    /// Graceful shutdown: close connections, flush indexes, stop tasks.
    pub async fn shutdown(self) {
        let Self {
            model,
            supervisor,
            pullers,
            tasks,
            conf_dir,
            ..
        } = self;
        model.close_all("exiting").await;
        for t in tasks.iter() {
            t.abort();
        }
        drop(pullers);
        drop(supervisor);
        save_indexes(&model, &conf_dir).await;
    }
}

async fn save_indexes(model: &Arc<Model>, conf_dir: &std::path::Path) {
    let model = model.clone();
    let conf_dir = conf_dir.to_path_buf();
    let res = tokio::task::spawn_blocking(move || {
        model.save_indexes(&conf_dir)
    })
    .await;
    match res {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::warn!("could not save indexes: {e}"),
        Err(e) => tracing::warn!("index save task failed: {e}"),
    }
}

async fn rescan_loop(
    model: Arc<Model>,
    repo: RepoId,
    interval: Duration,
    limit: Option<Arc<TokenBucket>>,
    conf_dir: PathBuf,
) {
    loop {
        tokio::time::sleep(interval).await;
        match model.scan_once(&repo, limit.clone()).await {
            Ok(0) => {}
            Ok(n) => {
                tracing::debug!("rescan of {repo}: {n} changed records");
                save_indexes(&model, &conf_dir).await;
            }
            Err(e) => tracing::warn!("rescan of {repo}: {e}"),
        }
    }
}

async fn persist_loop(model: Arc<Model>, conf_dir: PathBuf) {
    loop {
        tokio::time::sleep(PERSIST_INTERVAL).await;
        save_indexes(&model, &conf_dir).await;
    }
}

/// Try to install a NAT port mapping for the single listen address.
/// Returns the external port, or zero when no mapping was made.
async fn try_port_mapping(
    mapper: &DynPortMapper,
    listen: &[String],
) -> u16 {
    if listen.len() != 1 {
        tracing::warn!(
            "multiple listening addresses; not attempting port mapping"
        );
        return 0;
    }
    let port = match listen[0]
        .rsplit(':')
        .next()
        .and_then(|p| p.parse::<u16>().ok())
    {
        Some(p) if p > 0 => p,
        _ => {
            tracing::warn!(
                "cannot derive a port from {:?}; not attempting port mapping",
                listen[0]
            );
            return 0;
        }
    };

    let gateway = match mapper.discover().await {
        Ok(g) => g,
        Err(e) => {
            tracing::info!("no gateway device found, no port mapping created ({e})");
            return 0;
        }
    };
    for i in 0..10 {
        let external = port + i;
        if gateway
            .add_port_mapping(external, port, "weft".to_string())
            .await
            .is_ok()
        {
            tracing::info!("created port mapping - external port {external}");
            return external;
        }
    }
    tracing::warn!("failed to create port mapping");
    0
}
