mod daemon;
mod session;

pub use daemon::SyncthingFactory;
pub use session::{SyncSession, SyncTimings};

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use rand::Rng;
use rand::distributions::Alphanumeric;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::UpConfig;
use crate::forward::available_port;
use crate::model::{Completion, FolderStatus, Side, SyncMode};

pub const REMOTE_GUI_PORT: u16 = 8384;
pub const REMOTE_DATA_PORT: u16 = 22000;

const INFO_FILE_NAME: &str = "syncthing.info";
const LOG_FILE_NAME: &str = "syncthing.log";
const API_KEY_LENGTH: usize = 32;

/// One file-synchronization daemon pair: the local process and its peer
/// inside the development container, reached through forwarded ports.
#[async_trait]
pub trait SyncDaemon: Send + Sync {
    /// Starts the local daemon and returns once the process is running.
    async fn run(&self) -> Result<()>;
    async fn ping(&self, side: Side) -> Result<()>;
    /// Registers each side as a device of the other and shares the folders.
    async fn pair(&self) -> Result<()>;
    async fn folder_statuses(&self, side: Side) -> Result<Vec<FolderStatus>>;
    async fn completion(&self, side: Side) -> Result<Completion>;
    async fn folder_errors(&self, side: Side) -> Result<Vec<String>>;
    async fn override_changes(&self) -> Result<()>;
    async fn set_mode(&self, mode: SyncMode) -> Result<()>;
    async fn restart(&self, side: Side) -> Result<()>;
    async fn send_ignore_file(&self) -> Result<()>;
    async fn reset_database(&self, side: Side) -> Result<()>;
    async fn stop(&self) -> Result<()>;
    fn log_path(&self) -> PathBuf;
}

pub trait SyncDaemonFactory: Send + Sync {
    fn create(&self, config: &UpConfig, info: &SyncInfo) -> Result<Arc<dyn SyncDaemon>>;
}

/// Persisted next to the state file so a later `kup` invocation can reach the
/// same daemon pair. The API key survives across attempts; ports are picked
/// fresh every attempt.
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncInfo {
    pub api_key: String,
    pub local_gui_port: u16,
    pub local_data_port: u16,
    pub remote_gui_port: u16,
    pub remote_data_port: u16,
}

impl SyncInfo {
    pub fn prepare(workload_home: &Path) -> Result<Self> {
        let path = workload_home.join(INFO_FILE_NAME);
        let api_key = match Self::load(&path) {
            Ok(Some(previous)) => previous.api_key,
            Ok(None) => generate_api_key(),
            Err(error) => {
                debug!("ignoring unreadable {}: {error:#}", path.display());
                generate_api_key()
            }
        };

        let info = Self {
            api_key,
            local_gui_port: available_port()?,
            local_data_port: available_port()?,
            remote_gui_port: available_port()?,
            remote_data_port: available_port()?,
        };
        info.save(&path)?;
        Ok(info)
    }

    fn load(path: &Path) -> Result<Option<Self>> {
        if !path.exists() {
            return Ok(None);
        }
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let info = serde_json::from_str(&raw)
            .with_context(|| format!("failed to parse {}", path.display()))?;
        Ok(Some(info))
    }

    fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let raw = serde_json::to_string_pretty(self)?;
        fs::write(path, raw).with_context(|| format!("failed to write {}", path.display()))
    }
}

pub fn log_path(workload_home: &Path) -> PathBuf {
    workload_home.join(LOG_FILE_NAME)
}

pub fn folder_id(index: usize) -> String {
    format!("kup-{index}")
}

/// Escapes a value for use inside a double-quoted XML attribute.
pub fn xml_attribute(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for ch in value.chars() {
        match ch {
            '&' => escaped.push_str("&amp;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&apos;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            other => escaped.push(other),
        }
    }
    escaped
}

fn generate_api_key() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(API_KEY_LENGTH)
        .map(char::from)
        .collect()
}

/// Daemon configuration shipped to the development container through the
/// sync secret. The remote side listens on all interfaces; only forwarded
/// ports ever reach it.
pub fn remote_config_xml(info: &SyncInfo, config: &UpConfig) -> String {
    let folders = config
        .folders
        .iter()
        .enumerate()
        .map(|(index, folder)| {
            format!(
                "    <folder id=\"{}\" path=\"{}\" type=\"sendreceive\" rescanIntervalS=\"300\" fsWatcherEnabled=\"true\"></folder>\n",
                folder_id(index),
                xml_attribute(&folder.remote_path)
            )
        })
        .collect::<String>();
    format!(
        "<configuration version=\"37\">\n{folders}    <gui enabled=\"true\" tls=\"false\">\n        <address>0.0.0.0:{REMOTE_GUI_PORT}</address>\n        <apikey>{}</apikey>\n    </gui>\n    <options>\n        <listenAddress>tcp://0.0.0.0:{REMOTE_DATA_PORT}</listenAddress>\n        <globalAnnounceEnabled>false</globalAnnounceEnabled>\n        <localAnnounceEnabled>false</localAnnounceEnabled>\n        <relaysEnabled>false</relaysEnabled>\n        <natEnabled>false</natEnabled>\n        <urAccepted>-1</urAccepted>\n        <autoUpgradeIntervalH>0</autoUpgradeIntervalH>\n    </options>\n</configuration>\n",
        info.api_key
    )
}
