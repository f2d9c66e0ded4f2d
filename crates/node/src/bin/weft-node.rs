//! The binary weft-node.

use std::path::PathBuf;
use weft_api::config::Config;
use weft_core::config_store;
use weft_node::{Node, NodeOpts};

const EXTRA_HELP: &str = "The following environment variables are interpreted by weft-node:

 STRESTART     Set by a supervising process that has just handed its
               sockets over; delays startup by one second so they can be
               released.

 STTRACE       A comma separated string of facilities to trace. The valid
               facility strings:
               - \"files\"    (file set store)
               - \"idx\"      (index sending and receiving)
               - \"need\"     (file need calculations)
               - \"net\"      (connecting and disconnecting, network messages)
               - \"pull\"     (file pull activity)
               - \"scanner\"  (the file change scanner)";

#[derive(clap::Parser, Debug)]
#[command(name = "weft-node", version, after_help = EXTRA_HELP)]
pub struct Args {
    /// Set the configuration directory.
    #[arg(long, value_name = "DIR")]
    pub home: Option<PathBuf>,

    /// Prepare to resync from the cluster: move repository directories
    /// aside and delete the index snapshots, then exit.
    #[arg(long)]
    pub reset: bool,
}

fn main() -> std::process::ExitCode {
    let args = <Args as clap::Parser>::parse();

    if std::env::var_os("STRESTART").is_some() {
        // Give the parent process time to exit and release sockets.
        std::thread::sleep(std::time::Duration::from_secs(1));
    }

    tracing_subscriber::fmt()
        .with_env_filter(tracing_filter())
        .try_init()
        .expect("failed to init tracing");

    let conf_dir = args
        .home
        .unwrap_or_else(config_store::default_conf_dir);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("failed to build runtime");

    let node = match runtime.block_on(prepare(&conf_dir, args.reset)) {
        Ok(Some(node)) => node,
        Ok(None) => return std::process::ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("{e}");
            return std::process::ExitCode::FAILURE;
        }
    };

    let (send, recv) = std::sync::mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = send.send(());
    })
    .expect("failed to install signal handler");

    let _ = recv.recv();

    tracing::info!("terminating...");
    runtime.block_on(node.shutdown());
    std::process::ExitCode::SUCCESS
}

/// Load or create the configuration, handle `--reset`, start the node.
async fn prepare(
    conf_dir: &PathBuf,
    reset: bool,
) -> weft_api::WeftResult<Option<Node>> {
    std::fs::create_dir_all(conf_dir).map_err(|e| {
        weft_api::WeftError::fatal_src(
            "create configuration directory",
            e,
        )
    })?;

    let config_path = conf_dir.join(config_store::CONFIG_FILE);
    let config = match config_store::load_config(&config_path)? {
        Some(config) => config,
        None => {
            tracing::info!("no config file; starting with empty defaults");
            let identity =
                weft_core::identity::Identity::load_or_generate(conf_dir)?;
            let hostname = std::env::var("HOSTNAME")
                .unwrap_or_else(|_| "weft".to_string());
            let config = Config::template(
                identity.node_id(),
                &hostname,
                &config_store::default_sync_dir(),
            );
            config_store::save_config(&config_path, &config)?;
            tracing::info!(
                "edit {} to taste",
                config_path.display()
            );
            config
        }
    };

    if reset {
        reset_repositories(conf_dir, &config);
        return Ok(None);
    }

    let node = Node::start(NodeOpts {
        conf_dir: conf_dir.clone(),
        config,
        discovery: None,
        port_mapper: None,
    })
    .await?;
    Ok(Some(node))
}

/// Move every repository directory aside and delete the index
/// snapshots, so the next run resyncs from the cluster.
fn reset_repositories(conf_dir: &std::path::Path, config: &Config) {
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::SystemTime::UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0);
    let suffix = format!(".weft-reset-{nanos}");

    for repo in config.repositories.iter() {
        let dir = config_store::expand_tilde(&repo.directory);
        if std::path::Path::new(&dir).exists() {
            let target = format!("{dir}{suffix}");
            tracing::info!("reset: moving {dir} -> {target}");
            if let Err(e) = std::fs::rename(&dir, &target) {
                tracing::warn!("reset: {e}");
            }
        }
    }

    let entries = match std::fs::read_dir(conf_dir) {
        Ok(entries) => entries,
        Err(e) => {
            tracing::warn!("reset: {e}");
            return;
        }
    };
    for entry in entries.flatten() {
        let name = entry.file_name();
        let is_index = name
            .to_str()
            .map(|n| n.ends_with(".idx.gz"))
            .unwrap_or(false);
        if is_index {
            tracing::info!("reset: removing {}", entry.path().display());
            if let Err(e) = std::fs::remove_file(entry.path()) {
                tracing::warn!("reset: {e}");
            }
        }
    }
}

/// `info` everywhere, plus `debug` for each facility named in STTRACE.
fn tracing_filter() -> tracing_subscriber::EnvFilter {
    let mut filter = tracing_subscriber::EnvFilter::builder()
        .with_default_directive(tracing::Level::INFO.into())
        .from_env_lossy();

    if let Ok(trace) = std::env::var("STTRACE") {
        for facility in trace.split(',') {
            let target = match facility.trim() {
                "files" => "weft_core::fileset",
                "idx" => "weft::idx",
                "need" => "weft::need",
                "net" => "weft::net",
                "pull" => "weft::pull",
                "scanner" => "weft_core::scanner",
                other => {
                    if !other.is_empty() {
                        eprintln!("unknown trace facility: {other}");
                    }
                    continue;
                }
            };
            filter = filter.add_directive(
                format!("{target}=debug")
                    .parse()
                    .expect("static trace directive"),
            );
        }
    }
    filter
}
