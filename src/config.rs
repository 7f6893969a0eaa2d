use crate::cli::CliArgs;
use crate::error::UpError;
use crate::model::{Forward, Reverse, SyncFolder, WorkloadRef};
use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

const DEFAULT_SYNC_IMAGE: &str = "syncthing/syncthing:1.27";
const DEFAULT_VOLUME_SIZE: &str = "2Gi";

/// Resolved configuration for one `kup up` invocation. Built once from the
/// manifest and the command line and handed to the activation loop.
#[derive(Debug, Clone)]
pub struct UpConfig {
    pub workload: WorkloadRef,
    pub context: Option<String>,
    pub image: Option<String>,
    pub sync_image: String,
    pub command: Vec<String>,
    pub forwards: Vec<Forward>,
    pub reverses: Vec<Reverse>,
    pub folders: Vec<SyncFolder>,
    pub persistent_volume: Option<String>,
    pub run_as_user: Option<i64>,
    pub run_as_group: Option<i64>,
    pub auto_deploy: bool,
    pub reset_sync: bool,
    pub home: PathBuf,
    pub timeouts: Timeouts,
}

#[derive(Debug, Clone)]
pub struct Timeouts {
    pub resources: Duration,
    pub ping: Duration,
    pub scan: Duration,
    pub stall: Duration,
    pub monitor_interval: Duration,
    pub shutdown_grace: Duration,
    pub retry_initial: Duration,
    pub retry_max: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            resources: Duration::from_secs(120),
            ping: Duration::from_secs(30),
            scan: Duration::from_secs(300),
            stall: Duration::from_secs(90),
            monitor_interval: Duration::from_secs(10),
            shutdown_grace: Duration::from_secs(1),
            retry_initial: Duration::from_secs(3),
            retry_max: Duration::from_secs(30),
        }
    }
}

impl UpConfig {
    pub fn persistent_volume_enabled(&self) -> bool {
        self.persistent_volume.is_some()
    }

    pub fn namespace_home(&self) -> PathBuf {
        self.home.join(&self.workload.namespace)
    }

    /// Per-workload directory holding the state file, pid file and sync daemon home.
    pub fn workload_home(&self) -> PathBuf {
        self.namespace_home().join(&self.workload.name)
    }

    /// True when the command is an interactive shell and should get a tty.
    pub fn interactive(&self) -> bool {
        match self.command.as_slice() {
            [] => true,
            [single] => matches!(single.as_str(), "sh" | "bash" | "zsh"),
            _ => false,
        }
    }
}

#[cfg(test)]
impl UpConfig {
    pub fn for_tests(home: &Path) -> Self {
        use clap::Parser;
        let args = CliArgs::parse_from(["kup"]);
        from_manifest_str("name: api\nforward:\n  - 8080:80\n", &args, home.to_path_buf(), false)
            .expect("test manifest")
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct ManifestFile {
    name: String,
    #[serde(default)]
    namespace: Option<String>,
    #[serde(default)]
    context: Option<String>,
    #[serde(default)]
    container: Option<String>,
    #[serde(default)]
    image: Option<String>,
    #[serde(default)]
    sync_image: Option<String>,
    #[serde(default)]
    command: CommandSpec,
    #[serde(default)]
    forward: Vec<Forward>,
    #[serde(default)]
    reverse: Vec<Reverse>,
    #[serde(default)]
    sync: Vec<SyncFolder>,
    #[serde(default)]
    persistent_volume: Option<VolumeSpec>,
    #[serde(default)]
    security_context: Option<SecurityContextSpec>,
    #[serde(default)]
    timeout: Option<TimeoutSpec>,
    #[serde(default)]
    auto_deploy: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum CommandSpec {
    Line(String),
    Argv(Vec<String>),
}

impl Default for CommandSpec {
    fn default() -> Self {
        Self::Argv(vec!["sh".to_string()])
    }
}

impl CommandSpec {
    fn into_argv(self) -> Vec<String> {
        match self {
            Self::Line(line) => line.split_whitespace().map(str::to_string).collect(),
            Self::Argv(argv) => argv,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct VolumeSpec {
    #[serde(default = "default_volume_enabled")]
    enabled: bool,
    #[serde(default)]
    size: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SecurityContextSpec {
    #[serde(default)]
    run_as_user: Option<i64>,
    #[serde(default)]
    run_as_group: Option<i64>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TimeoutSpec {
    #[serde(default)]
    resources_secs: Option<u64>,
}

fn default_volume_enabled() -> bool {
    true
}

pub fn load(args: &CliArgs) -> Result<UpConfig> {
    let path = discover_manifest_path(args.file.as_deref())
        .context("no manifest found; create kup.yml or pass --file")?;
    let raw = fs::read_to_string(&path)
        .with_context(|| format!("failed to read manifest {}", path.display()))?;
    let home = match args.home.clone() {
        Some(home) => home,
        None => default_home()?,
    };
    let auto_deploy = args.deploy || std::env::var_os("KUP_AUTODEPLOY").is_some();
    from_manifest_str(&raw, args, home, auto_deploy)
        .with_context(|| format!("invalid manifest {}", path.display()))
}

fn from_manifest_str(
    raw: &str,
    args: &CliArgs,
    home: PathBuf,
    auto_deploy: bool,
) -> Result<UpConfig> {
    let manifest: ManifestFile = serde_yaml::from_str(raw).context("failed to parse manifest")?;
    if manifest.name.trim().is_empty() {
        anyhow::bail!("'name' is required");
    }

    let mut seen = HashSet::new();
    for forward in &manifest.forward {
        if !seen.insert(forward.local) {
            return Err(UpError::DuplicateLocalPort(forward.local).into());
        }
    }
    if let Some(reverse) = manifest.reverse.first() {
        return Err(UpError::ReverseNotSupported {
            local: reverse.local,
            remote: reverse.remote,
        }
        .into());
    }

    let folders = if manifest.sync.is_empty() {
        vec![SyncFolder {
            local_path: ".".to_string(),
            remote_path: "/usr/src/app".to_string(),
        }]
    } else {
        manifest.sync
    };

    let persistent_volume = manifest
        .persistent_volume
        .filter(|volume| volume.enabled)
        .map(|volume| volume.size.unwrap_or_else(|| DEFAULT_VOLUME_SIZE.to_string()));

    let mut timeouts = Timeouts::default();
    if let Some(secs) = manifest.timeout.and_then(|timeout| timeout.resources_secs) {
        timeouts.resources = Duration::from_secs(secs);
    }

    let namespace = args
        .namespace
        .clone()
        .or(manifest.namespace)
        .unwrap_or_else(|| "default".to_string());
    let security = manifest.security_context;

    Ok(UpConfig {
        workload: WorkloadRef {
            namespace,
            name: manifest.name,
            container: manifest.container,
        },
        context: args.context.clone().or(manifest.context),
        image: manifest.image,
        sync_image: manifest
            .sync_image
            .unwrap_or_else(|| DEFAULT_SYNC_IMAGE.to_string()),
        command: manifest.command.into_argv(),
        forwards: manifest.forward,
        reverses: manifest.reverse,
        folders,
        persistent_volume,
        run_as_user: security.as_ref().and_then(|value| value.run_as_user),
        run_as_group: security.as_ref().and_then(|value| value.run_as_group),
        auto_deploy: auto_deploy || manifest.auto_deploy,
        reset_sync: args.reset,
        home,
        timeouts,
    })
}

fn default_home() -> Result<PathBuf> {
    let home = std::env::var("HOME").context("HOME is not set; pass --home")?;
    Ok(PathBuf::from(home).join(".kup"))
}

fn discover_manifest_path(explicit: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit {
        return Some(path.to_path_buf());
    }

    if let Ok(path) = std::env::var("KUP_MANIFEST")
        && !path.trim().is_empty()
    {
        return Some(PathBuf::from(path));
    }

    let cwd_candidates = [
        PathBuf::from("kup.yml"),
        PathBuf::from("kup.yaml"),
        PathBuf::from(".kup.yaml"),
    ];
    cwd_candidates
        .into_iter()
        .find(|candidate| candidate.exists())
}
