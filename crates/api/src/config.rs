//! The node configuration tree.
//!
//! The configuration lives as an XML document at `<confDir>/config.xml`.
//! These types carry the serde annotations for that document; reading and
//! atomically rewriting the file is the job of the config store in
//! weft_core. Note that this file is edited by humans, so deserialization
//! is tolerant to missing properties, setting sane defaults.

use crate::{NodeId, RepoId};

/// The whole configuration document.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(rename = "configuration")]
pub struct Config {
    /// Configuration format version.
    #[serde(rename = "@version", default = "default_version")]
    pub version: u32,

    /// The ordered list of repositories this node serves.
    #[serde(rename = "repository", default)]
    pub repositories: Vec<RepoConfig>,

    /// The known peers, including this node itself.
    #[serde(rename = "node", default)]
    pub nodes: Vec<NodeDecl>,

    /// GUI collaborator settings. Parsed and carried, consumed only by
    /// the GUI collaborator.
    #[serde(default)]
    pub gui: GuiConfig,

    /// Runtime tunables.
    #[serde(default)]
    pub options: Options,
}

/// One repository declaration.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct RepoConfig {
    /// The repository id shared across the cluster.
    #[serde(rename = "@id")]
    pub id: RepoId,

    /// Local directory root.
    #[serde(rename = "@directory")]
    pub directory: String,

    /// Read-only repositories serve and announce local content but never
    /// write to disk.
    #[serde(rename = "@ro", default)]
    pub read_only: bool,

    /// The peers allowed on this repository.
    #[serde(rename = "node", default)]
    pub nodes: Vec<RepoNode>,
}

impl RepoConfig {
    /// The NodeIds allowed on this repository.
    pub fn node_ids(&self) -> impl Iterator<Item = &NodeId> {
        self.nodes.iter().map(|n| &n.id)
    }
}

/// Reference to a peer within a repository declaration.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct RepoNode {
    /// The peer's NodeId.
    #[serde(rename = "@id")]
    pub id: NodeId,
}

/// One known peer.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct NodeDecl {
    /// The peer's NodeId.
    #[serde(rename = "@id")]
    pub id: NodeId,

    /// Human-readable name, for log and GUI context.
    #[serde(rename = "@name", default)]
    pub name: String,

    /// Dial addresses. `host`, `host:port`, or the literal `dynamic` to
    /// resolve through the discovery collaborator.
    #[serde(rename = "address", default)]
    pub addresses: Vec<String>,
}

/// GUI collaborator settings.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct GuiConfig {
    /// Whether the GUI should be started at all.
    #[serde(rename = "@enabled", default = "default_true")]
    pub enabled: bool,

    /// Listen address for the GUI.
    #[serde(rename = "@address", default = "default_gui_address")]
    pub address: String,
}

impl Default for GuiConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            address: default_gui_address(),
        }
    }
}

/// Runtime tunables.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Options {
    /// Addresses the connection supervisor listens on.
    #[serde(default = "default_listen_address")]
    pub listen_address: Vec<String>,

    /// The global announce server, when global announcing is enabled.
    #[serde(default = "default_announce_server")]
    pub global_announce_server: String,

    /// Announce this node to the global announce server.
    #[serde(default = "default_true")]
    pub global_announce_enabled: bool,

    /// Announce this node on the local multicast beacon.
    #[serde(default = "default_true")]
    pub local_announce_enabled: bool,

    /// Pull workers per read-write repository.
    #[serde(default = "default_parallel_requests")]
    pub parallel_requests: u32,

    /// Global send ceiling in KiB/s. Zero means unlimited.
    #[serde(default)]
    pub max_send_kbps: u32,

    /// Scanner hashing ceiling in KiB/s. Zero means unlimited.
    #[serde(default)]
    pub max_change_kbps: u32,

    /// Seconds between repository rescans.
    #[serde(default = "default_rescan_interval")]
    pub rescan_interval_s: u32,

    /// Seconds between outbound dial sweeps.
    #[serde(default = "default_reconnect_interval")]
    pub reconnect_interval_s: u32,

    /// Open the GUI in a browser on startup.
    #[serde(default = "default_true")]
    pub start_browser: bool,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            listen_address: default_listen_address(),
            global_announce_server: default_announce_server(),
            global_announce_enabled: true,
            local_announce_enabled: true,
            parallel_requests: default_parallel_requests(),
            max_send_kbps: 0,
            max_change_kbps: 0,
            rescan_interval_s: default_rescan_interval(),
            reconnect_interval_s: default_reconnect_interval(),
            start_browser: true,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            version: default_version(),
            repositories: Vec::new(),
            nodes: Vec::new(),
            gui: GuiConfig::default(),
            options: Options::default(),
        }
    }
}

impl Config {
    /// The first-run template: one repository `default` under `home_dir`,
    /// shared with ourselves only, and our own node entry with a
    /// `dynamic` address.
    pub fn template(
        my_id: &NodeId,
        my_name: &str,
        default_repo_dir: &str,
    ) -> Self {
        Self {
            repositories: vec![RepoConfig {
                id: "default".into(),
                directory: default_repo_dir.into(),
                read_only: false,
                nodes: vec![RepoNode { id: my_id.clone() }],
            }],
            nodes: vec![NodeDecl {
                id: my_id.clone(),
                name: my_name.into(),
                addresses: vec!["dynamic".into()],
            }],
            ..Default::default()
        }
    }

    /// Look up a repository declaration by id.
    pub fn repo(&self, id: &RepoId) -> Option<&RepoConfig> {
        self.repositories.iter().find(|r| &r.id == id)
    }

    /// Look up a peer declaration by id.
    pub fn node(&self, id: &NodeId) -> Option<&NodeDecl> {
        self.nodes.iter().find(|n| &n.id == id)
    }
}

fn default_version() -> u32 {
    2
}

fn default_true() -> bool {
    true
}

fn default_gui_address() -> String {
    "127.0.0.1:8080".into()
}

fn default_listen_address() -> Vec<String> {
    vec![":22000".into()]
}

fn default_announce_server() -> String {
    "announce.weft.net:22025".into()
}

fn default_parallel_requests() -> u32 {
    16
}

fn default_rescan_interval() -> u32 {
    60
}

fn default_reconnect_interval() -> u32 {
    60
}

#[cfg(test)]
mod test {
    use super::*;

    const SAMPLE: &str = r#"<configuration version="2">
    <repository id="default" directory="/home/user/Sync" ro="false">
        <node id="AAAA"/>
        <node id="BBBB"/>
    </repository>
    <node id="AAAA" name="alpha">
        <address>dynamic</address>
    </node>
    <node id="BBBB" name="beta">
        <address>192.0.2.1:22000</address>
        <address>192.0.2.2</address>
    </node>
    <gui enabled="true" address="127.0.0.1:8080"/>
    <options>
        <listenAddress>:22000</listenAddress>
        <maxSendKbps>125</maxSendKbps>
        <parallelRequests>4</parallelRequests>
    </options>
</configuration>"#;

    #[test]
    fn parse_sample() {
        let cfg: Config = quick_xml::de::from_str(SAMPLE).unwrap();

        assert_eq!(1, cfg.repositories.len());
        let repo = &cfg.repositories[0];
        assert_eq!(RepoId::from("default"), repo.id);
        assert_eq!("/home/user/Sync", repo.directory);
        assert!(!repo.read_only);
        assert_eq!(
            vec![NodeId::from("AAAA"), NodeId::from("BBBB")],
            repo.node_ids().cloned().collect::<Vec<_>>()
        );

        assert_eq!(2, cfg.nodes.len());
        assert_eq!("beta", cfg.nodes[1].name);
        assert_eq!(2, cfg.nodes[1].addresses.len());

        // Unset options fall back to defaults.
        assert_eq!(125, cfg.options.max_send_kbps);
        assert_eq!(4, cfg.options.parallel_requests);
        assert_eq!(60, cfg.options.reconnect_interval_s);
        assert!(cfg.options.global_announce_enabled);
    }

    #[test]
    fn round_trip() {
        let cfg: Config = quick_xml::de::from_str(SAMPLE).unwrap();
        let xml =
            quick_xml::se::to_string_with_root("configuration", &cfg).unwrap();
        let back: Config = quick_xml::de::from_str(&xml).unwrap();
        assert_eq!(cfg, back);
    }

    #[test]
    fn empty_document_gets_defaults() {
        let cfg: Config =
            quick_xml::de::from_str("<configuration></configuration>")
                .unwrap();
        assert_eq!(cfg, Config::default());
        assert_eq!(vec![":22000".to_string()], cfg.options.listen_address);
    }

    #[test]
    fn template_lists_self() {
        let id = NodeId::from("SELF");
        let cfg = Config::template(&id, "host", "/data/sync");
        assert_eq!(Some(&id), cfg.repo(&"default".into()).and_then(|r| {
            r.node_ids().next()
        }));
        assert_eq!(
            vec!["dynamic".to_string()],
            cfg.node(&id).unwrap().addresses
        );
    }
}
