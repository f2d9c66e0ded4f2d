//! Configuration file storage.
//!
//! The configuration lives at `<confDir>/config.xml` and is rewritten by
//! writing `config.xml.tmp` and renaming it into place. A dedicated save
//! task serializes writers so concurrent save requests cannot interleave
//! on the temp file.

use std::path::{Path, PathBuf};
use tokio::sync::mpsc;
use weft_api::{config::Config, WeftError, WeftResult};

/// The configuration file name under the configuration directory.
pub const CONFIG_FILE: &str = "config.xml";

const XML_DECL: &str = "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n";

/// Read the configuration document. `Ok(None)` when the file does not
/// exist yet.
pub fn load_config(path: &Path) -> WeftResult<Option<Config>> {
    let text = match std::fs::read_to_string(path) {
        Ok(t) => t,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Ok(None)
        }
        Err(e) => return Err(WeftError::fatal_src("read config", e)),
    };
    quick_xml::de::from_str(&text)
        .map(Some)
        .map_err(|e| WeftError::fatal_src("parse config", e))
}

/// Write the configuration document via temp file and rename.
pub fn save_config(path: &Path, config: &Config) -> WeftResult<()> {
    let xml = quick_xml::se::to_string_with_root("configuration", config)
        .map_err(|e| WeftError::other_src("serialize config", e))?;

    let tmp = path.with_extension("xml.tmp");
    std::fs::write(&tmp, format!("{XML_DECL}{xml}\n"))
        .map_err(|e| WeftError::io_src("write config", e))?;
    std::fs::rename(&tmp, path)
        .map_err(|e| WeftError::io_src("rename config", e))?;
    Ok(())
}

/// Handle to the save task. Dropping every handle stops the task.
#[derive(Debug, Clone)]
pub struct ConfigSaver {
    tx: mpsc::UnboundedSender<Config>,
}

impl ConfigSaver {
    /// Spawn the save task for the given config path.
    pub fn spawn(path: PathBuf) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<Config>();
        tokio::task::spawn(async move {
            while let Some(config) = rx.recv().await {
                let path = path.clone();
                let res = tokio::task::spawn_blocking(move || {
                    save_config(&path, &config)
                })
                .await;
                match res {
                    Ok(Ok(())) => tracing::debug!("configuration saved"),
                    Ok(Err(e)) => {
                        tracing::warn!("could not save configuration: {e}")
                    }
                    Err(e) => {
                        tracing::warn!("config save task failed: {e}")
                    }
                }
            }
        });
        Self { tx }
    }

    /// Queue a configuration snapshot for saving.
    pub fn save(&self, config: Config) {
        if self.tx.send(config).is_err() {
            tracing::warn!("config save task is gone");
        }
    }
}

/// Expand a leading `~` to the user's home directory. A no-op on
/// Windows.
pub fn expand_tilde(path: &str) -> String {
    #[cfg(windows)]
    {
        path.to_string()
    }
    #[cfg(not(windows))]
    {
        match (path.strip_prefix("~/"), std::env::var("HOME")) {
            (Some(rest), Ok(home)) => format!("{home}/{rest}"),
            _ => path.to_string(),
        }
    }
}

/// The platform default configuration directory.
pub fn default_conf_dir() -> PathBuf {
    #[cfg(windows)]
    {
        let appdata =
            std::env::var("AppData").unwrap_or_else(|_| ".".to_string());
        Path::new(&appdata).join("weft")
    }
    #[cfg(not(windows))]
    {
        PathBuf::from(expand_tilde("~/.weft"))
    }
}

/// The default directory for the first-run template repository.
pub fn default_sync_dir() -> String {
    expand_tilde("~/Sync")
}
