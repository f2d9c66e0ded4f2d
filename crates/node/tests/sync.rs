//! Two-node end-to-end scenarios over real sockets on localhost.

use std::path::Path;
use std::time::Duration;
use weft_api::config::{
    Config, NodeDecl, Options, RepoConfig, RepoNode,
};
use weft_api::{NodeId, RepoId};
use weft_core::identity::Identity;
use weft_node::{Node, NodeOpts};

const REPO: &str = "r";

/// Poll `check` until it passes or the timeout expires.
async fn wait_for<F: Fn() -> bool>(what: &str, check: F) {
    for _ in 0..300 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    panic!("timed out waiting for {what}");
}

fn test_options(listen: &str) -> Options {
    Options {
        listen_address: vec![listen.to_string()],
        global_announce_enabled: false,
        local_announce_enabled: false,
        parallel_requests: 4,
        reconnect_interval_s: 1,
        rescan_interval_s: 1,
        start_browser: false,
        ..Default::default()
    }
}

fn peer_config(
    my_id: &NodeId,
    repo_dir: &Path,
    read_only: bool,
    peers: Vec<(NodeId, Vec<String>)>,
    listen: &str,
) -> Config {
    let mut all = peers;
    all.push((my_id.clone(), Vec::new()));
    Config {
        repositories: vec![RepoConfig {
            id: REPO.into(),
            directory: repo_dir.to_string_lossy().into_owned(),
            read_only,
            nodes: all
                .iter()
                .map(|(id, _)| RepoNode { id: id.clone() })
                .collect(),
        }],
        nodes: all
            .into_iter()
            .map(|(id, addresses)| NodeDecl {
                id,
                name: String::new(),
                addresses,
            })
            .collect(),
        options: test_options(listen),
        ..Default::default()
    }
}

async fn start_node(
    home: &Path,
    repo_dir: &Path,
    read_only: bool,
    peers: Vec<(NodeId, Vec<String>)>,
) -> Node {
    let my_id = Identity::load_or_generate(home).unwrap().node_id().clone();
    Node::start(NodeOpts {
        conf_dir: home.to_path_buf(),
        config: peer_config(
            &my_id,
            repo_dir,
            read_only,
            peers,
            "127.0.0.1:0",
        ),
        discovery: None,
        port_mapper: None,
    })
    .await
    .unwrap()
}

struct Pair {
    a: Node,
    b: Node,
    _homes: Vec<tempfile::TempDir>,
    dir_a: tempfile::TempDir,
    dir_b: tempfile::TempDir,
}

/// Start node a, then node b dialing a, sharing one repository.
async fn connected_pair(b_read_only: bool) -> Pair {
    let home_a = tempfile::tempdir().unwrap();
    let home_b = tempfile::tempdir().unwrap();
    let dir_a = tempfile::tempdir().unwrap();
    let dir_b = tempfile::tempdir().unwrap();

    let id_a = Identity::load_or_generate(home_a.path())
        .unwrap()
        .node_id()
        .clone();
    let id_b = Identity::load_or_generate(home_b.path())
        .unwrap()
        .node_id()
        .clone();

    let a = start_node(
        home_a.path(),
        dir_a.path(),
        false,
        vec![(id_b.clone(), Vec::new())],
    )
    .await;
    let addr_a = format!("127.0.0.1:{}", a.listen_addrs()[0].port());

    let b = start_node(
        home_b.path(),
        dir_b.path(),
        b_read_only,
        vec![(id_a.clone(), vec![addr_a])],
    )
    .await;

    Pair {
        a,
        b,
        _homes: vec![home_a, home_b],
        dir_a,
        dir_b,
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn two_node_initial_sync() {
    let home_a = tempfile::tempdir().unwrap();
    let home_b = tempfile::tempdir().unwrap();
    let dir_a = tempfile::tempdir().unwrap();
    let dir_b = tempfile::tempdir().unwrap();
    std::fs::write(dir_a.path().join("a.txt"), b"hello").unwrap();

    let id_a = Identity::load_or_generate(home_a.path())
        .unwrap()
        .node_id()
        .clone();
    let id_b = Identity::load_or_generate(home_b.path())
        .unwrap()
        .node_id()
        .clone();

    let a = start_node(
        home_a.path(),
        dir_a.path(),
        false,
        vec![(id_b.clone(), Vec::new())],
    )
    .await;
    let addr_a = format!("127.0.0.1:{}", a.listen_addrs()[0].port());
    let b = start_node(
        home_b.path(),
        dir_b.path(),
        false,
        vec![(id_a.clone(), vec![addr_a])],
    )
    .await;

    let target = dir_b.path().join("a.txt");
    wait_for("a.txt to appear on node b", || {
        std::fs::read(&target)
            .map(|data| data == b"hello")
            .unwrap_or(false)
    })
    .await;

    // Both nodes converge on one record: same version, same blocks.
    let repo = RepoId::from(REPO);
    let (model_a, model_b) = (a.model().clone(), b.model().clone());
    wait_for("records to converge", move || {
        let rec_a = model_a.local_record(&repo, "a.txt");
        let rec_b = model_b.local_record(&repo, "a.txt");
        match (rec_a, rec_b) {
            (Some(ra), Some(rb)) => ra.wire_eq(&rb),
            _ => false,
        }
    })
    .await;

    b.shutdown().await;
    a.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn multi_block_files_arrive_intact() {
    let pair = connected_pair(false).await;

    // Three blocks: two full, one short.
    let mut data = vec![0u8; 2 * weft_api::BLOCK_SIZE as usize + 512];
    for (i, byte) in data.iter_mut().enumerate() {
        *byte = (i % 251) as u8;
    }
    std::fs::write(pair.dir_a.path().join("big.bin"), &data).unwrap();

    let target = pair.dir_b.path().join("big.bin");
    let want = data.clone();
    wait_for("big.bin to arrive on node b", move || {
        std::fs::read(&target)
            .map(|got| got == want)
            .unwrap_or(false)
    })
    .await;

    // The temp file is gone once the rename lands.
    assert!(!pair
        .dir_b
        .path()
        .join("big.bin.weft.tmp")
        .exists());

    pair.b.shutdown().await;
    pair.a.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn edits_and_deletions_propagate() {
    let pair = connected_pair(false).await;

    std::fs::write(pair.dir_a.path().join("a.txt"), b"v1").unwrap();
    let target = pair.dir_b.path().join("a.txt");
    {
        let target = target.clone();
        wait_for("initial content on node b", move || {
            std::fs::read(&target)
                .map(|d| d == b"v1")
                .unwrap_or(false)
        })
        .await;
    }

    std::fs::write(pair.dir_a.path().join("a.txt"), b"v2 is longer")
        .unwrap();
    {
        let target = target.clone();
        wait_for("edited content on node b", move || {
            std::fs::read(&target)
                .map(|d| d == b"v2 is longer")
                .unwrap_or(false)
        })
        .await;
    }

    std::fs::remove_file(pair.dir_a.path().join("a.txt")).unwrap();
    wait_for("deletion on node b", || !target.exists()).await;

    let repo = RepoId::from(REPO);
    assert!(pair
        .b
        .model()
        .local_record(&repo, "a.txt")
        .unwrap()
        .is_deleted());

    pair.b.shutdown().await;
    pair.a.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn read_only_node_announces_but_never_writes() {
    let pair = connected_pair(true).await;

    std::fs::write(pair.dir_a.path().join("a.txt"), b"hello").unwrap();

    // Node b learns the record exists...
    let repo = RepoId::from(REPO);
    let model_b = pair.b.model().clone();
    wait_for("node b to receive the index update", move || {
        model_b.global_record(&repo, "a.txt").is_some()
    })
    .await;

    // ...but its filesystem stays untouched.
    tokio::time::sleep(Duration::from_secs(3)).await;
    assert!(!pair.dir_b.path().join("a.txt").exists());

    pair.b.shutdown().await;
    pair.a.shutdown().await;
}
