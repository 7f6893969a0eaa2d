use std::collections::{BTreeMap, HashSet};

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use futures::{StreamExt, TryStreamExt};
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{
    Container, ContainerPort, Event, Namespace, PersistentVolumeClaim, Pod, PodSecurityContext,
    Secret, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, Status};
use kube::api::{AttachParams, DeleteParams, Patch, PatchParams, PostParams};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::runtime::{WatchStreamExt, watcher};
use kube::{Api, Client, Config, ResourceExt};
use tokio::io::{AsyncRead, AsyncWriteExt};
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::config::UpConfig;
use crate::error::{UpError, classify_kube_error};
use crate::exec::{ExecIo, ExecWriter, RemoteExecutor};
use crate::forward::{TunnelDialer, TunnelStream};
use crate::model::{DevPod, Workload, WorkloadRef};
use crate::sync::{REMOTE_DATA_PORT, REMOTE_GUI_PORT, SyncInfo, folder_id, remote_config_xml};

const LABEL_DEV_MODE: &str = "kup.dev/dev-mode";
const LABEL_DEV_NAME: &str = "kup.dev/name";
const LABEL_UP_DISABLED: &str = "kup.dev/up";
const ANNOTATION_AUTO_CREATED: &str = "kup.dev/auto-created";
const FIELD_MANAGER: &str = "kup";
const SYNC_CONTAINER: &str = "kup-sync";
const DATA_VOLUME: &str = "kup-data";
const SECRET_VOLUME: &str = "kup-sync-secret";
const SECRET_MOUNT: &str = "/var/syncthing/secret";
const SYNC_HOME: &str = "/var/syncthing/config";
const SANDBOX_IMAGE: &str = "alpine:3";
const PROTECTED_NAMESPACES: [&str; 3] = ["kube-system", "kube-public", "kube-node-lease"];

/// Cluster operations the activation loop needs. Dev-mode translation lives
/// behind this seam.
#[async_trait]
pub trait ClusterApi: Send + Sync {
    async fn get_workload(&self, workload: &WorkloadRef) -> Result<Option<Workload>>;
    async fn create_sandbox(&self, config: &UpConfig) -> Result<Workload>;
    async fn check_namespace(&self, namespace: &str) -> Result<()>;
    async fn ensure_volume(&self, config: &UpConfig) -> Result<()>;
    async fn ensure_sync_secret(&self, config: &UpConfig, info: &SyncInfo) -> Result<()>;
    async fn deploy_dev_mode(&self, config: &UpConfig, workload: &Workload, container: &str) -> Result<()>;
    /// Waits for the dev pod to run, forwarding human-readable progress.
    async fn wait_for_dev_pod(
        &self,
        config: &UpConfig,
        progress: mpsc::UnboundedSender<String>,
    ) -> Result<DevPod>;
    async fn pod_exists(&self, pod: &DevPod) -> Result<bool>;
    async fn destroy_pod(&self, pod: &DevPod) -> Result<()>;
}

#[derive(Clone)]
pub struct KubeGateway {
    client: Client,
    context: String,
}

impl KubeGateway {
    pub async fn connect(context: Option<String>) -> Result<Self> {
        let kubeconfig = Kubeconfig::read().ok();

        let config = if let Some(kubeconfig_value) = kubeconfig.clone() {
            let options = KubeConfigOptions {
                context: context.clone(),
                cluster: None,
                user: None,
            };
            Config::from_custom_kubeconfig(kubeconfig_value, &options)
                .await
                .context("failed to infer Kubernetes configuration")?
        } else {
            if context.is_some() {
                anyhow::bail!("kubeconfig not found; --context is unavailable in this environment");
            }
            Config::infer()
                .await
                .context("failed to infer Kubernetes configuration")?
        };

        let client = Client::try_from(config).context("failed to initialize Kubernetes client")?;
        let active_context = context
            .or_else(|| {
                kubeconfig
                    .as_ref()
                    .and_then(|cfg| cfg.current_context.clone())
            })
            .unwrap_or_else(|| "in-cluster".to_string());

        Ok(Self {
            client,
            context: active_context,
        })
    }

    pub fn context(&self) -> &str {
        &self.context
    }

    pub fn client(&self) -> Client {
        self.client.clone()
    }

    fn deployments(&self, namespace: &str) -> Api<Deployment> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn pods(&self, namespace: &str) -> Api<Pod> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

#[async_trait]
impl ClusterApi for KubeGateway {
    async fn get_workload(&self, workload: &WorkloadRef) -> Result<Option<Workload>> {
        let deployment = self
            .deployments(&workload.namespace)
            .get_opt(&workload.name)
            .await
            .map_err(classify_kube_error)
            .with_context(|| format!("failed to get deployment {workload}"))?;
        Ok(deployment.map(|deployment| workload_from_deployment(&workload.namespace, &deployment)))
    }

    async fn create_sandbox(&self, config: &UpConfig) -> Result<Workload> {
        let deployment = sandbox_deployment(config);
        let created = self
            .deployments(&config.workload.namespace)
            .create(&PostParams::default(), &deployment)
            .await
            .map_err(classify_kube_error)
            .with_context(|| format!("failed to create sandbox {}", config.workload))?;
        info!("created sandbox deployment {}", config.workload);
        Ok(workload_from_deployment(&config.workload.namespace, &created))
    }

    async fn check_namespace(&self, namespace: &str) -> Result<()> {
        if PROTECTED_NAMESPACES.contains(&namespace) {
            return Err(UpError::NamespaceNotAllowed(namespace.to_string()).into());
        }
        let api: Api<Namespace> = Api::all(self.client.clone());
        let Some(found) = api
            .get_opt(namespace)
            .await
            .map_err(classify_kube_error)
            .with_context(|| format!("failed to get namespace '{namespace}'"))?
        else {
            anyhow::bail!("namespace '{namespace}' doesn't exist");
        };
        if found.labels().get(LABEL_UP_DISABLED).map(String::as_str) == Some("disabled") {
            return Err(UpError::NamespaceNotAllowed(namespace.to_string()).into());
        }
        Ok(())
    }

    async fn ensure_volume(&self, config: &UpConfig) -> Result<()> {
        let Some(size) = config.persistent_volume.as_deref() else {
            return Ok(());
        };
        let api: Api<PersistentVolumeClaim> =
            Api::namespaced(self.client.clone(), &config.workload.namespace);
        let name = volume_name(&config.workload.name);
        if api
            .get_opt(&name)
            .await
            .map_err(classify_kube_error)
            .with_context(|| format!("failed to get persistent volume claim '{name}'"))?
            .is_some()
        {
            debug!("persistent volume claim {name} already exists");
            return Ok(());
        }

        let claim: PersistentVolumeClaim = serde_json::from_value(serde_json::json!({
            "metadata": {
                "name": name,
                "labels": { "kup.dev/name": config.workload.name },
            },
            "spec": {
                "accessModes": ["ReadWriteOnce"],
                "resources": { "requests": { "storage": size } },
            }
        }))?;
        api.create(&PostParams::default(), &claim)
            .await
            .map_err(classify_kube_error)
            .with_context(|| format!("failed to create persistent volume claim '{name}'"))?;
        info!("created persistent volume claim {name} ({size})");
        Ok(())
    }

    async fn ensure_sync_secret(&self, config: &UpConfig, info: &SyncInfo) -> Result<()> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), &config.workload.namespace);
        let name = secret_name(&config.workload.name);
        let mut string_data = BTreeMap::new();
        string_data.insert("config.xml".to_string(), remote_config_xml(info, config));
        let secret = Secret {
            metadata: ObjectMeta {
                name: Some(name.clone()),
                labels: Some(BTreeMap::from([(
                    LABEL_DEV_NAME.to_string(),
                    config.workload.name.clone(),
                )])),
                ..Default::default()
            },
            string_data: Some(string_data),
            type_: Some("Opaque".to_string()),
            ..Default::default()
        };
        let params = PatchParams::apply(FIELD_MANAGER).force();
        api.patch(&name, &params, &Patch::Apply(&secret))
            .await
            .map_err(classify_kube_error)
            .with_context(|| format!("failed to apply secret '{name}'"))?;
        Ok(())
    }

    async fn deploy_dev_mode(&self, config: &UpConfig, workload: &Workload, container: &str) -> Result<()> {
        let api = self.deployments(&workload.namespace);
        let mut deployment = api
            .get(&workload.name)
            .await
            .map_err(classify_kube_error)
            .with_context(|| format!("failed to get deployment {}", config.workload))?;
        translate_to_dev_mode(&mut deployment, config, container)?;
        api.replace(&workload.name, &PostParams::default(), &deployment)
            .await
            .map_err(classify_kube_error)
            .with_context(|| format!("failed to activate dev mode on {}", config.workload))?;
        info!("dev mode requested for {}", config.workload);
        Ok(())
    }

    async fn wait_for_dev_pod(
        &self,
        config: &UpConfig,
        progress: mpsc::UnboundedSender<String>,
    ) -> Result<DevPod> {
        let namespace = config.workload.namespace.as_str();
        let selector = format!("{LABEL_DEV_NAME}={}", config.workload.name);
        let started_at = k8s_openapi::jiff::Timestamp::now().as_second();

        let events: Api<Event> = Api::namespaced(self.client.clone(), namespace);
        let mut pod_stream = watcher(
            self.pods(namespace),
            watcher::Config::default().labels(&selector),
        )
        .default_backoff()
        .applied_objects()
        .boxed();
        let mut event_stream = watcher(
            events,
            watcher::Config::default().fields("involvedObject.kind=Pod"),
        )
        .default_backoff()
        .applied_objects()
        .boxed();

        let deadline = tokio::time::sleep(config.timeouts.resources);
        tokio::pin!(deadline);
        let mut candidates = HashSet::new();
        let mut insufficient_resources = false;

        loop {
            tokio::select! {
                _ = &mut deadline => {
                    if insufficient_resources {
                        return Err(UpError::InsufficientResources.into());
                    }
                    return Err(UpError::PodTimeout(config.timeouts.resources).into());
                }
                pod = pod_stream.try_next() => match pod {
                    Ok(Some(pod)) => {
                        let name = pod.name_any();
                        if pod.metadata.deletion_timestamp.is_some() {
                            candidates.remove(&name);
                            continue;
                        }
                        candidates.insert(name.clone());
                        let phase = pod.status.as_ref().and_then(|status| status.phase.clone());
                        debug!("dev pod {name} is {phase:?}");
                        if phase.as_deref() == Some("Running") {
                            return Ok(DevPod {
                                name,
                                namespace: namespace.to_string(),
                                node_name: pod.spec.as_ref().and_then(|spec| spec.node_name.clone()),
                            });
                        }
                    }
                    Ok(None) => anyhow::bail!("pod watch for {} ended", config.workload),
                    Err(error) => debug!("pod watch error: {error}"),
                },
                event = event_stream.try_next() => match event {
                    Ok(Some(event)) => {
                        let involved = event.involved_object.name.clone().unwrap_or_default();
                        if !candidates.contains(&involved) || event_timestamp_seconds(&event) < started_at {
                            continue;
                        }
                        let reason = event.reason.clone().unwrap_or_default();
                        let message = event.message.clone().unwrap_or_default();
                        debug!("pod {involved} event {reason}: {message}");
                        match classify_pod_event(&reason, &message) {
                            PodEventAction::Ignore => {}
                            PodEventAction::Progress(text) => {
                                let _ = progress.send(text);
                            }
                            PodEventAction::InsufficientResources => {
                                insufficient_resources = true;
                                let _ = progress.send(message);
                            }
                            PodEventAction::Deleted => return Err(UpError::DevPodDeleted.into()),
                            PodEventAction::Fatal => return Err(UpError::PodFailed(message).into()),
                        }
                    }
                    Ok(None) => anyhow::bail!("event watch for {} ended", config.workload),
                    Err(error) => debug!("event watch error: {error}"),
                },
            }
        }
    }

    async fn pod_exists(&self, pod: &DevPod) -> Result<bool> {
        let found = self
            .pods(&pod.namespace)
            .get_opt(&pod.name)
            .await
            .map_err(classify_kube_error)
            .with_context(|| format!("failed to get pod {}/{}", pod.namespace, pod.name))?;
        Ok(found.is_some_and(|found| found.metadata.deletion_timestamp.is_none()))
    }

    async fn destroy_pod(&self, pod: &DevPod) -> Result<()> {
        if !self.pod_exists(pod).await? {
            return Ok(());
        }
        self.pods(&pod.namespace)
            .delete(&pod.name, &DeleteParams::default())
            .await
            .map_err(classify_kube_error)
            .with_context(|| format!("failed to delete pod {}/{}", pod.namespace, pod.name))?;
        info!("deleted dev pod {}/{}", pod.namespace, pod.name);
        Ok(())
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
enum PodEventAction {
    Ignore,
    Progress(String),
    InsufficientResources,
    Deleted,
    Fatal,
}

fn classify_pod_event(reason: &str, message: &str) -> PodEventAction {
    match reason {
        "FailedScheduling"
            if message.contains("Insufficient cpu") || message.contains("Insufficient memory") =>
        {
            PodEventAction::InsufficientResources
        }
        "Failed" | "FailedScheduling" | "FailedCreatePodSandBox" | "ErrImageNeverPull"
        | "InspectFailed" | "FailedCreatePodContainer" => {
            if message.contains("unbound immediate PersistentVolumeClaims") {
                PodEventAction::Ignore
            } else {
                PodEventAction::Fatal
            }
        }
        "FailedAttachVolume" | "FailedMount" => PodEventAction::Progress(format!("{message}: retrying")),
        "Pulling" => PodEventAction::Progress(message.replacen("pulling", "Pulling", 1)),
        "Killing" => PodEventAction::Deleted,
        _ => PodEventAction::Ignore,
    }
}

fn event_timestamp_seconds(event: &Event) -> i64 {
    event
        .event_time
        .as_ref()
        .map(|time| time.0.as_second())
        .or_else(|| event.last_timestamp.as_ref().map(|time| time.0.as_second()))
        .or_else(|| {
            event
                .first_timestamp
                .as_ref()
                .map(|time| time.0.as_second())
        })
        .or_else(|| {
            event
                .metadata
                .creation_timestamp
                .as_ref()
                .map(|time| time.0.as_second())
        })
        .unwrap_or(0)
}

fn workload_from_deployment(namespace: &str, deployment: &Deployment) -> Workload {
    let containers = deployment
        .spec
        .as_ref()
        .and_then(|spec| spec.template.spec.as_ref())
        .map(|spec| {
            spec.containers
                .iter()
                .map(|container| container.name.clone())
                .collect::<Vec<_>>()
        })
        .unwrap_or_default();
    let dev_mode_on = deployment.labels().get(LABEL_DEV_MODE).map(String::as_str) == Some("true");
    let has_sync = containers.iter().any(|name| name == SYNC_CONTAINER);

    Workload {
        namespace: namespace.to_string(),
        name: deployment.name_any(),
        containers: containers
            .into_iter()
            .filter(|name| name != SYNC_CONTAINER)
            .collect(),
        dev_mode_on,
        modified_while_active: dev_mode_on && !has_sync,
        auto_created: deployment.annotations().contains_key(ANNOTATION_AUTO_CREATED),
    }
}

fn volume_name(workload: &str) -> String {
    format!("{workload}-kup")
}

fn secret_name(workload: &str) -> String {
    format!("kup-{workload}")
}

fn sandbox_deployment(config: &UpConfig) -> Deployment {
    let name = config.workload.name.clone();
    let container = config
        .workload
        .container
        .clone()
        .unwrap_or_else(|| name.clone());
    let image = config
        .image
        .clone()
        .unwrap_or_else(|| SANDBOX_IMAGE.to_string());
    let labels = BTreeMap::from([("app".to_string(), name.clone())]);

    let mut deployment = Deployment {
        metadata: ObjectMeta {
            name: Some(name),
            annotations: Some(BTreeMap::from([(
                ANNOTATION_AUTO_CREATED.to_string(),
                "true".to_string(),
            )])),
            ..Default::default()
        },
        ..Default::default()
    };
    deployment.spec = Some(k8s_openapi::api::apps::v1::DeploymentSpec {
        replicas: Some(1),
        selector: k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector {
            match_labels: Some(labels.clone()),
            ..Default::default()
        },
        template: k8s_openapi::api::core::v1::PodTemplateSpec {
            metadata: Some(ObjectMeta {
                labels: Some(labels),
                ..Default::default()
            }),
            spec: Some(k8s_openapi::api::core::v1::PodSpec {
                containers: vec![Container {
                    name: container,
                    image: Some(image),
                    ..Default::default()
                }],
                ..Default::default()
            }),
        },
        ..Default::default()
    });
    deployment
}

/// Rewrites a deployment in place so its pod runs the dev container next to
/// the sync sidecar, both sharing the synchronized folders.
fn translate_to_dev_mode(deployment: &mut Deployment, config: &UpConfig, container: &str) -> Result<()> {
    let name = config.workload.name.clone();
    deployment
        .labels_mut()
        .insert(LABEL_DEV_MODE.to_string(), "true".to_string());

    let spec = deployment
        .spec
        .as_mut()
        .ok_or_else(|| anyhow!("deployment {} has no spec", config.workload))?;
    spec.replicas = Some(1);
    spec.template
        .metadata
        .get_or_insert_with(Default::default)
        .labels
        .get_or_insert_with(Default::default)
        .insert(LABEL_DEV_NAME.to_string(), name.clone());

    let pod_spec = spec
        .template
        .spec
        .as_mut()
        .ok_or_else(|| anyhow!("deployment {} has no pod template", config.workload))?;

    let data_mounts = config
        .folders
        .iter()
        .enumerate()
        .map(|(index, folder)| VolumeMount {
            name: DATA_VOLUME.to_string(),
            mount_path: folder.remote_path.clone(),
            sub_path: Some(folder_id(index)),
            ..Default::default()
        })
        .collect::<Vec<_>>();

    let dev = pod_spec
        .containers
        .iter_mut()
        .find(|candidate| candidate.name == container)
        .ok_or_else(|| UpError::ContainerNotFound {
            container: container.to_string(),
            workload: config.workload.to_string(),
        })?;
    if let Some(image) = &config.image {
        dev.image = Some(image.clone());
    }
    dev.command = Some(vec!["tail".to_string(), "-f".to_string(), "/dev/null".to_string()]);
    dev.args = None;
    dev.readiness_probe = None;
    dev.liveness_probe = None;
    let mounts = dev.volume_mounts.get_or_insert_with(Vec::new);
    mounts.retain(|mount| mount.name != DATA_VOLUME);
    mounts.extend(data_mounts.iter().cloned());

    pod_spec.containers.retain(|candidate| candidate.name != SYNC_CONTAINER);
    let mut sync_mounts = data_mounts;
    sync_mounts.push(VolumeMount {
        name: SECRET_VOLUME.to_string(),
        mount_path: SECRET_MOUNT.to_string(),
        read_only: Some(true),
        ..Default::default()
    });
    pod_spec.containers.push(Container {
        name: SYNC_CONTAINER.to_string(),
        image: Some(config.sync_image.clone()),
        command: Some(vec!["sh".to_string(), "-c".to_string()]),
        args: Some(vec![format!(
            "mkdir -p {SYNC_HOME} && cp {SECRET_MOUNT}/config.xml {SYNC_HOME}/config.xml && exec syncthing --home {SYNC_HOME} --no-browser"
        )]),
        ports: Some(vec![
            ContainerPort {
                container_port: i32::from(REMOTE_GUI_PORT),
                name: Some("sync-gui".to_string()),
                ..Default::default()
            },
            ContainerPort {
                container_port: i32::from(REMOTE_DATA_PORT),
                name: Some("sync-data".to_string()),
                ..Default::default()
            },
        ]),
        volume_mounts: Some(sync_mounts),
        ..Default::default()
    });

    let volumes = pod_spec.volumes.get_or_insert_with(Vec::new);
    volumes.retain(|volume| volume.name != DATA_VOLUME && volume.name != SECRET_VOLUME);
    let data_volume = if config.persistent_volume_enabled() {
        serde_json::json!({
            "name": DATA_VOLUME,
            "persistentVolumeClaim": { "claimName": volume_name(&name) },
        })
    } else {
        serde_json::json!({ "name": DATA_VOLUME, "emptyDir": {} })
    };
    volumes.push(serde_json::from_value::<Volume>(data_volume)?);
    volumes.push(serde_json::from_value::<Volume>(serde_json::json!({
        "name": SECRET_VOLUME,
        "secret": { "secretName": secret_name(&name) },
    }))?);

    if config.run_as_user.is_some() || config.run_as_group.is_some() {
        let security = pod_spec
            .security_context
            .get_or_insert_with(PodSecurityContext::default);
        if let Some(user) = config.run_as_user {
            security.run_as_user = Some(user);
        }
        if let Some(group) = config.run_as_group {
            security.run_as_group = Some(group);
            security.fs_group = Some(group);
        }
    }
    Ok(())
}

#[derive(Clone)]
pub struct KubeTunnelDialer {
    client: Client,
}

impl KubeTunnelDialer {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl TunnelDialer for KubeTunnelDialer {
    async fn dial(&self, namespace: &str, pod: &str, remote_port: u16) -> Result<TunnelStream> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let mut forwarder = api
            .portforward(pod, &[remote_port])
            .await
            .map_err(classify_kube_error)
            .with_context(|| format!("failed to open port-forward to {namespace}/{pod}:{remote_port}"))?;
        let stream = forwarder
            .take_stream(remote_port)
            .with_context(|| format!("port-forward to {pod}:{remote_port} returned no stream"))?;
        let label = format!("{namespace}/{pod}:{remote_port}");
        tokio::spawn(async move {
            if let Err(error) = forwarder.join().await {
                debug!("port-forward {label} ended with error: {error}");
            }
        });
        Ok(Box::new(stream))
    }
}

#[derive(Clone)]
pub struct KubeExecutor {
    client: Client,
}

impl KubeExecutor {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl RemoteExecutor for KubeExecutor {
    async fn exec(
        &self,
        pod: &DevPod,
        container: &str,
        argv: &[String],
        tty: bool,
        io: ExecIo,
    ) -> Result<i32> {
        let ExecIo {
            stdin,
            mut stdout,
            mut stderr,
        } = io;
        let api: Api<Pod> = Api::namespaced(self.client.clone(), &pod.namespace);
        let params = AttachParams::default()
            .container(container)
            .stdin(stdin.is_some())
            .stdout(true)
            .stderr(!tty)
            .tty(tty);
        let mut attached = api
            .exec(&pod.name, argv.to_vec(), &params)
            .await
            .map_err(classify_kube_error)
            .with_context(|| format!("failed to exec in {}/{}", pod.namespace, pod.name))?;

        let status = attached
            .take_status()
            .context("exec session did not provide a status channel")?;
        let remote_stdin = attached.stdin();
        let remote_stdout = attached.stdout();
        let remote_stderr = attached.stderr();

        let stdin_pump = async move {
            if let (Some(mut local), Some(mut remote)) = (stdin, remote_stdin) {
                if let Err(error) = tokio::io::copy(&mut local, &mut remote).await {
                    debug!("stdin pump stopped: {error}");
                }
                let _ = remote.shutdown().await;
            }
        };
        let finished = async {
            let outputs = tokio::try_join!(
                pump_output(remote_stdout, &mut stdout),
                pump_output(remote_stderr, &mut stderr),
            );
            (outputs, status.await)
        };
        tokio::pin!(stdin_pump);
        tokio::pin!(finished);

        let mut stdin_done = false;
        let (outputs, status) = loop {
            tokio::select! {
                done = &mut finished => break done,
                _ = &mut stdin_pump, if !stdin_done => stdin_done = true,
            }
        };

        outputs.context("stream to the remote command broke")?;
        exit_code(status.as_ref())
    }
}

async fn pump_output<R>(remote: Option<R>, local: &mut ExecWriter) -> std::io::Result<()>
where
    R: AsyncRead + Unpin,
{
    let Some(mut remote) = remote else {
        return Ok(());
    };
    tokio::io::copy(&mut remote, local).await?;
    local.flush().await
}

fn exit_code(status: Option<&Status>) -> Result<i32> {
    let Some(status) = status else {
        anyhow::bail!("connection closed before the remote command reported an exit status");
    };
    if status.status.as_deref() == Some("Success") {
        return Ok(0);
    }
    let code = status
        .details
        .as_ref()
        .and_then(|details| details.causes.as_ref())
        .and_then(|causes| {
            causes
                .iter()
                .find(|cause| cause.reason.as_deref() == Some("ExitCode"))
                .and_then(|cause| cause.message.as_deref())
                .and_then(|message| message.trim().parse::<i32>().ok())
        });
    match code {
        Some(code) => Ok(code),
        None => Err(anyhow!(
            "remote command failed: {}",
            status.message.clone().unwrap_or_default()
        )),
    }
}
