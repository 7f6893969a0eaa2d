use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};
use std::str::FromStr;

#[derive(Debug, Clone, Eq, PartialEq, Hash)]
pub struct WorkloadRef {
    pub namespace: String,
    pub name: String,
    pub container: Option<String>,
}

impl Display for WorkloadRef {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// What the cluster currently knows about the target workload.
#[derive(Debug, Clone, Default, Eq, PartialEq)]
pub struct Workload {
    pub namespace: String,
    pub name: String,
    pub containers: Vec<String>,
    pub dev_mode_on: bool,
    pub modified_while_active: bool,
    pub auto_created: bool,
}

impl Workload {
    pub fn resolve_container(&self, wanted: Option<&str>) -> Option<String> {
        match wanted {
            Some(name) => self
                .containers
                .iter()
                .find(|candidate| candidate.as_str() == name)
                .cloned(),
            None => self.containers.first().cloned(),
        }
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct DevPod {
    pub name: String,
    pub namespace: String,
    pub node_name: Option<String>,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Serialize)]
pub struct Forward {
    pub local: u16,
    pub remote: u16,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Serialize)]
pub struct Reverse {
    pub remote: u16,
    pub local: u16,
}

#[derive(Debug, Clone, Eq, PartialEq, Serialize)]
pub struct SyncFolder {
    pub local_path: String,
    pub remote_path: String,
}

fn split_port_pair(raw: &str) -> anyhow::Result<(u16, u16)> {
    let (left, right) = raw
        .trim()
        .split_once(':')
        .with_context(|| format!("'{raw}' must have the form <port>:<port>"))?;
    let left = left
        .trim()
        .parse::<u16>()
        .with_context(|| format!("invalid port '{left}' in '{raw}'"))?;
    let right = right
        .trim()
        .parse::<u16>()
        .with_context(|| format!("invalid port '{right}' in '{raw}'"))?;
    Ok((left, right))
}

impl FromStr for Forward {
    type Err = anyhow::Error;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let (local, remote) = split_port_pair(raw)?;
        Ok(Self { local, remote })
    }
}

impl FromStr for Reverse {
    type Err = anyhow::Error;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let (remote, local) = split_port_pair(raw)?;
        Ok(Self { remote, local })
    }
}

impl FromStr for SyncFolder {
    type Err = anyhow::Error;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let (local, remote) = raw
            .rsplit_once(':')
            .with_context(|| format!("sync folder '{raw}' must have the form <local>:<remote>"))?;
        if local.trim().is_empty() || !remote.starts_with('/') {
            anyhow::bail!("sync folder '{raw}' needs a local path and an absolute remote path");
        }
        Ok(Self {
            local_path: local.trim().to_string(),
            remote_path: remote.trim().to_string(),
        })
    }
}

macro_rules! deserialize_from_str {
    ($ty:ty) => {
        impl<'de> Deserialize<'de> for $ty {
            fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
            where
                D: serde::Deserializer<'de>,
            {
                let raw = String::deserialize(deserializer)?;
                raw.parse().map_err(serde::de::Error::custom)
            }
        }
    };
}

deserialize_from_str!(Forward);
deserialize_from_str!(Reverse);
deserialize_from_str!(SyncFolder);

/// Coarse lifecycle phase persisted for status tooling.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum UpState {
    Provisioning,
    StartingSync,
    Synchronizing,
    Activating,
    Ready,
    Failed,
}

impl UpState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Provisioning => "provisioning",
            Self::StartingSync => "startingSync",
            Self::Synchronizing => "synchronizing",
            Self::Activating => "activating",
            Self::Ready => "ready",
            Self::Failed => "failed",
        }
    }
}

impl Display for UpState {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Everything a background task can tell the activation loop.
#[derive(Debug)]
pub enum SessionEvent {
    CommandExited(Result<(), crate::error::UpError>),
    TunnelError(String),
    Disconnected,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub enum ActivationState {
    Resolving,
    Provisioning,
    Deploying,
    WaitingForPod,
    Forwarding,
    Syncing,
    Running,
    Reconnecting,
    Exited,
}

impl ActivationState {
    /// Transition table of the activation loop. Every state may fall back to
    /// `Reconnecting` (retryable failure) or `Exited` (fatal failure, interrupt).
    pub fn can_transition_to(self, next: Self) -> bool {
        use ActivationState::*;
        if matches!(next, Exited) {
            return self != Exited;
        }
        if matches!(next, Reconnecting) {
            return !matches!(self, Reconnecting | Exited);
        }
        matches!(
            (self, next),
            (Resolving, Provisioning)
                | (Provisioning, Deploying)
                | (Deploying, WaitingForPod)
                | (WaitingForPod, Forwarding)
                | (Forwarding, Syncing)
                | (Syncing, Running)
                | (Reconnecting, Resolving)
        )
    }

    pub fn title(self) -> &'static str {
        match self {
            Self::Resolving => "resolving",
            Self::Provisioning => "provisioning",
            Self::Deploying => "deploying",
            Self::WaitingForPod => "waiting for pod",
            Self::Forwarding => "forwarding",
            Self::Syncing => "syncing",
            Self::Running => "running",
            Self::Reconnecting => "reconnecting",
            Self::Exited => "exited",
        }
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum SyncPhase {
    Idle,
    Starting,
    WaitingForPing,
    WaitingForInitialScan,
    WaitingForPartialCompletion,
    OverridingLocalChanges,
    WaitingForFinalCompletion,
    FullSync,
    Monitoring,
    Failed,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub enum Side {
    Local,
    Remote,
}

impl Side {
    pub fn is_local(self) -> bool {
        self == Self::Local
    }
}

impl Display for Side {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Local => f.write_str("local"),
            Self::Remote => f.write_str("remote"),
        }
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum SyncMode {
    SendOnly,
    SendReceive,
}

impl SyncMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::SendOnly => "sendonly",
            Self::SendReceive => "sendreceive",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Eq, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Completion {
    #[serde(default)]
    pub global_bytes: i64,
    #[serde(default)]
    pub need_bytes: i64,
    #[serde(default)]
    pub need_deletes: i64,
}

impl Completion {
    pub fn progress(&self) -> f64 {
        if self.global_bytes <= 0 {
            return 100.0;
        }
        ((self.global_bytes - self.need_bytes) as f64 / self.global_bytes as f64) * 100.0
    }
}

#[derive(Debug, Clone, Default, Eq, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FolderStatus {
    #[serde(default)]
    pub state: String,
    #[serde(default)]
    pub pull_errors: i64,
}

impl FolderStatus {
    pub fn is_scanning(&self) -> bool {
        self.state == "scanning" || self.state == "scan-waiting"
    }
}
