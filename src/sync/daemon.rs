use std::fs;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::{Client, Method, RequestBuilder};
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::process::{Child, Command};
use tracing::{debug, info};

use super::{SyncDaemon, SyncDaemonFactory, SyncInfo, folder_id, log_path, xml_attribute};
use crate::config::UpConfig;
use crate::error::UpError;
use crate::model::{Completion, FolderStatus, Side, SyncMode};

const SYNCTHING_BINARY: &str = "syncthing";
const IGNORE_FILE_NAME: &str = ".stignore";
const DELETE_PROTECTED_PREFIX: &str = "(?d)";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
struct LocalFolder {
    id: String,
    local_path: PathBuf,
}

#[derive(Debug, Clone)]
struct Peers {
    local_id: String,
    remote_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SystemStatus {
    #[serde(rename = "myID")]
    my_id: String,
}

#[derive(Debug, Default, Deserialize)]
struct Ignores {
    #[serde(default)]
    ignore: Option<Vec<String>>,
}

#[derive(Debug, Default, Deserialize)]
struct FolderErrors {
    #[serde(default)]
    errors: Option<Vec<FolderError>>,
}

#[derive(Debug, Deserialize)]
struct FolderError {
    #[serde(default)]
    path: String,
    #[serde(default)]
    error: String,
}

/// Local syncthing process plus a REST client for both sides. The remote
/// daemon is reached through the forwarded GUI port.
pub struct SyncthingDaemon {
    http: Client,
    api_key: String,
    home: PathBuf,
    log_path: PathBuf,
    local_gui_port: u16,
    local_data_port: u16,
    remote_gui_port: u16,
    remote_data_port: u16,
    folders: Vec<LocalFolder>,
    peers: Mutex<Option<Peers>>,
    child: tokio::sync::Mutex<Option<Child>>,
}

impl SyncthingDaemon {
    pub fn new(config: &UpConfig, info: &SyncInfo) -> Result<Self> {
        let workload_home = config.workload_home();
        let http = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .context("failed to build the synchronization HTTP client")?;
        let folders = config
            .folders
            .iter()
            .enumerate()
            .map(|(index, folder)| LocalFolder {
                id: folder_id(index),
                local_path: PathBuf::from(&folder.local_path),
            })
            .collect();

        Ok(Self {
            http,
            api_key: info.api_key.clone(),
            home: workload_home.join("syncthing"),
            log_path: log_path(&workload_home),
            local_gui_port: info.local_gui_port,
            local_data_port: info.local_data_port,
            remote_gui_port: info.remote_gui_port,
            remote_data_port: info.remote_data_port,
            folders,
            peers: Mutex::new(None),
            child: tokio::sync::Mutex::new(None),
        })
    }

    fn base_url(&self, side: Side) -> String {
        let port = match side {
            Side::Local => self.local_gui_port,
            Side::Remote => self.remote_gui_port,
        };
        format!("http://127.0.0.1:{port}")
    }

    fn request(&self, side: Side, method: Method, path: &str) -> RequestBuilder {
        self.http
            .request(method, format!("{}/{path}", self.base_url(side)))
            .header("X-API-Key", &self.api_key)
    }

    async fn call(&self, side: Side, request: RequestBuilder, what: &str) -> Result<reqwest::Response> {
        let response = request
            .send()
            .await
            .with_context(|| format!("failed to call '{what}' on the {side} synchronization service"))?;
        response
            .error_for_status()
            .with_context(|| format!("'{what}' failed on the {side} synchronization service"))
    }

    fn peers(&self) -> Result<Peers> {
        let guard = match self.peers.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        guard
            .clone()
            .context("synchronization services have not been paired yet")
    }

    async fn device_id(&self, side: Side) -> Result<String> {
        let response = self
            .call(side, self.request(side, Method::GET, "rest/system/status"), "rest/system/status")
            .await?;
        let status: SystemStatus = response.json().await?;
        Ok(status.my_id)
    }

    fn write_local_config(&self) -> Result<()> {
        fs::create_dir_all(&self.home)
            .with_context(|| format!("failed to create {}", self.home.display()))?;
        let folders = self
            .folders
            .iter()
            .map(|folder| {
                format!(
                    "    <folder id=\"{}\" path=\"{}\" type=\"{}\" rescanIntervalS=\"300\" fsWatcherEnabled=\"true\"></folder>\n",
                    folder.id,
                    xml_attribute(&absolute(&folder.local_path).to_string_lossy()),
                    SyncMode::SendOnly.as_str()
                )
            })
            .collect::<String>();
        let raw = format!(
            "<configuration version=\"37\">\n{folders}    <gui enabled=\"true\" tls=\"false\">\n        <address>127.0.0.1:{}</address>\n        <apikey>{}</apikey>\n    </gui>\n    <options>\n        <listenAddress>tcp://127.0.0.1:{}</listenAddress>\n        <globalAnnounceEnabled>false</globalAnnounceEnabled>\n        <localAnnounceEnabled>false</localAnnounceEnabled>\n        <relaysEnabled>false</relaysEnabled>\n        <natEnabled>false</natEnabled>\n        <urAccepted>-1</urAccepted>\n        <autoUpgradeIntervalH>0</autoUpgradeIntervalH>\n    </options>\n</configuration>\n",
            self.local_gui_port, self.api_key, self.local_data_port
        );
        let path = self.home.join("config.xml");
        fs::write(&path, raw).with_context(|| format!("failed to write {}", path.display()))
    }
}

fn timed_out(error: &anyhow::Error) -> bool {
    error
        .chain()
        .filter_map(|cause| cause.downcast_ref::<reqwest::Error>())
        .any(reqwest::Error::is_timeout)
}

fn absolute(path: &Path) -> PathBuf {
    if path.is_absolute() {
        return path.to_path_buf();
    }
    std::env::current_dir()
        .map(|cwd| cwd.join(path))
        .unwrap_or_else(|_| path.to_path_buf())
}

#[async_trait]
impl SyncDaemon for SyncthingDaemon {
    async fn run(&self) -> Result<()> {
        self.write_local_config()?;
        let child = Command::new(SYNCTHING_BINARY)
            .arg("--home")
            .arg(&self.home)
            .arg("--no-browser")
            .arg("--verbose")
            .arg("--logfile")
            .arg(&self.log_path)
            .arg("--log-max-old-files=0")
            .env("STNOUPGRADE", "1")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .context("failed to start the local synchronization service; is 'syncthing' installed?")?;
        info!(
            "started local synchronization service (pid {:?}, gui port {})",
            child.id(),
            self.local_gui_port
        );
        *self.child.lock().await = Some(child);
        Ok(())
    }

    async fn ping(&self, side: Side) -> Result<()> {
        self.call(side, self.request(side, Method::GET, "rest/system/ping"), "rest/system/ping")
            .await?;
        Ok(())
    }

    async fn pair(&self) -> Result<()> {
        let local_id = self.device_id(Side::Local).await?;
        let remote_id = self.device_id(Side::Remote).await?;

        let remote_device = json!({
            "deviceID": remote_id,
            "addresses": [format!("tcp://127.0.0.1:{}", self.remote_data_port)],
        });
        self.call(
            Side::Local,
            self.request(Side::Local, Method::PUT, &format!("rest/config/devices/{remote_id}"))
                .json(&remote_device),
            "rest/config/devices",
        )
        .await?;

        let local_device = json!({ "deviceID": local_id, "addresses": ["dynamic"] });
        self.call(
            Side::Remote,
            self.request(Side::Remote, Method::PUT, &format!("rest/config/devices/{local_id}"))
                .json(&local_device),
            "rest/config/devices",
        )
        .await?;

        for folder in &self.folders {
            let path = format!("rest/config/folders/{}", folder.id);
            let shared_with_remote = json!({ "devices": [{ "deviceID": remote_id }] });
            self.call(
                Side::Local,
                self.request(Side::Local, Method::PATCH, &path).json(&shared_with_remote),
                "rest/config/folders",
            )
            .await?;
            let shared_with_local = json!({ "devices": [{ "deviceID": local_id }] });
            self.call(
                Side::Remote,
                self.request(Side::Remote, Method::PATCH, &path).json(&shared_with_local),
                "rest/config/folders",
            )
            .await?;
        }

        debug!("paired local device {local_id} with remote device {remote_id}");
        let mut guard = match self.peers.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *guard = Some(Peers { local_id, remote_id });
        Ok(())
    }

    async fn folder_statuses(&self, side: Side) -> Result<Vec<FolderStatus>> {
        let mut statuses = Vec::with_capacity(self.folders.len());
        for folder in &self.folders {
            let request = self
                .request(side, Method::GET, "rest/db/status")
                .query(&[("folder", folder.id.as_str())]);
            let response = self.call(side, request, "rest/db/status").await?;
            statuses.push(response.json::<FolderStatus>().await?);
        }
        Ok(statuses)
    }

    async fn completion(&self, side: Side) -> Result<Completion> {
        let peers = self.peers()?;
        let device = match side {
            Side::Local => peers.remote_id,
            Side::Remote => peers.local_id,
        };
        let mut total = Completion::default();
        for folder in &self.folders {
            let request = self
                .request(side, Method::GET, "rest/db/completion")
                .query(&[("folder", folder.id.as_str()), ("device", device.as_str())]);
            let completion: Completion = match self.call(side, request, "rest/db/completion").await {
                Ok(response) => response.json().await.map_err(|error| {
                    debug!("invalid completion from the {side} synchronization service: {error}");
                    anyhow::Error::new(UpError::LostSync)
                })?,
                Err(error) if timed_out(&error) => {
                    return Err(error.context("synchronization service is busy"));
                }
                Err(error) => {
                    debug!("{error:#}");
                    return Err(UpError::LostSync.into());
                }
            };
            total.global_bytes += completion.global_bytes;
            total.need_bytes += completion.need_bytes;
            total.need_deletes += completion.need_deletes;
        }
        Ok(total)
    }

    async fn folder_errors(&self, side: Side) -> Result<Vec<String>> {
        let mut messages = Vec::new();
        for folder in &self.folders {
            let request = self
                .request(side, Method::GET, "rest/folder/errors")
                .query(&[("folder", folder.id.as_str())]);
            let response = self.call(side, request, "rest/folder/errors").await?;
            let errors: FolderErrors = response.json().await?;
            messages.extend(
                errors
                    .errors
                    .unwrap_or_default()
                    .into_iter()
                    .map(|error| format!("{}: {}", error.path, error.error)),
            );
        }
        Ok(messages)
    }

    async fn override_changes(&self) -> Result<()> {
        for folder in &self.folders {
            info!("overriding remote changes in {}", folder.local_path.display());
            let request = self
                .request(Side::Local, Method::POST, "rest/db/override")
                .query(&[("folder", folder.id.as_str())]);
            if let Err(error) = self.call(Side::Local, request, "rest/db/override").await {
                debug!("{error:#}");
                return Err(UpError::LostSync.into());
            }
        }
        Ok(())
    }

    async fn set_mode(&self, mode: SyncMode) -> Result<()> {
        for folder in &self.folders {
            let path = format!("rest/config/folders/{}", folder.id);
            let body = json!({ "type": mode.as_str() });
            self.call(
                Side::Local,
                self.request(Side::Local, Method::PATCH, &path).json(&body),
                "rest/config/folders",
            )
            .await?;
        }
        debug!("local folders switched to {}", mode.as_str());
        Ok(())
    }

    async fn restart(&self, side: Side) -> Result<()> {
        self.call(side, self.request(side, Method::POST, "rest/system/restart"), "rest/system/restart")
            .await?;
        Ok(())
    }

    async fn send_ignore_file(&self) -> Result<()> {
        for folder in &self.folders {
            let ignore_path = absolute(&folder.local_path).join(IGNORE_FILE_NAME);
            let lines = match fs::read_to_string(&ignore_path) {
                Ok(raw) => raw.lines().map(str::to_string).collect::<Vec<_>>(),
                Err(_) => {
                    let request = self
                        .request(Side::Local, Method::GET, "rest/db/ignores")
                        .query(&[("folder", folder.id.as_str())]);
                    let response = self.call(Side::Local, request, "rest/db/ignores").await?;
                    let ignores: Ignores = response.json().await?;
                    ignores.ignore.unwrap_or_default()
                }
            };

            let body = json!({ "ignore": delete_protected(&lines) });
            let request = self
                .request(Side::Remote, Method::POST, "rest/db/ignores")
                .query(&[("folder", folder.id.as_str())])
                .json(&body);
            self.call(Side::Remote, request, "rest/db/ignores").await?;
            debug!("sent ignore rules for {}", folder.id);
        }
        Ok(())
    }

    async fn reset_database(&self, side: Side) -> Result<()> {
        for folder in &self.folders {
            info!("resetting {side} synchronization database for {}", folder.local_path.display());
            let request = self
                .request(side, Method::POST, "rest/system/reset")
                .query(&[("folder", folder.id.as_str())]);
            if let Err(error) = self.call(side, request, "rest/system/reset").await {
                debug!("{error:#}");
                return Err(UpError::LostSync.into());
            }
        }
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        let Some(mut child) = self.child.lock().await.take() else {
            return Ok(());
        };
        child
            .start_kill()
            .context("failed to terminate the local synchronization service")?;
        let status = child.wait().await?;
        debug!("local synchronization service exited with {status}");
        Ok(())
    }

    fn log_path(&self) -> PathBuf {
        self.log_path.clone()
    }
}

/// Prefixes every rule with the delete-protection marker so the remote side
/// never removes ignored files it owns.
fn delete_protected(lines: &[String]) -> Vec<Value> {
    lines
        .iter()
        .map(|line| line.trim())
        .filter(|line| !line.is_empty())
        .map(|line| {
            if line.contains(DELETE_PROTECTED_PREFIX) || line.starts_with("//") {
                Value::String(line.to_string())
            } else {
                Value::String(format!("{DELETE_PROTECTED_PREFIX}{line}"))
            }
        })
        .collect()
}

pub struct SyncthingFactory;

impl SyncDaemonFactory for SyncthingFactory {
    fn create(&self, config: &UpConfig, info: &SyncInfo) -> Result<Arc<dyn SyncDaemon>> {
        Ok(Arc::new(SyncthingDaemon::new(config, info)?))
    }
}
