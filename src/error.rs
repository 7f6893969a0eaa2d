use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum UpError {
    #[error("port {0} is listed multiple times, please check your configuration")]
    DuplicateLocalPort(u16),

    #[error("reverse forward {local} <- {remote} is not supported over the Kubernetes port-forward transport")]
    ReverseNotSupported { local: u16, remote: u16 },

    #[error("failed to connect to the synchronization service")]
    SyncUnreachable { hint: String },

    #[error("file synchronization is not making progress")]
    SyncFrozen { log_path: PathBuf },

    #[error("there isn't enough space in your development container volume")]
    InsufficientSpace,

    #[error("lost connection to the synchronization service")]
    LostSync,

    #[error("command exited with code {code}")]
    CommandFailed { code: i32 },

    #[error("lost connection to your development container")]
    LostConnection,

    #[error("connection to the remote command was broken: {0}")]
    ConnectionBroken(String),

    #[error("development container has been deactivated")]
    Deactivated,

    #[error("workload '{name}' doesn't exist in namespace '{namespace}'")]
    CreationDeclined { namespace: String, name: String },

    #[error("'kup up' is not allowed in namespace '{0}'")]
    NamespaceNotAllowed(String),

    #[error("container '{container}' does not exist in workload '{workload}'")]
    ContainerNotFound { container: String, workload: String },

    #[error("workload '{0}' has been modified while your development container was active")]
    WorkloadModified(String),

    #[error("development container was not ready after {0:?}")]
    PodTimeout(std::time::Duration),

    #[error("insufficient resources to schedule your development container")]
    InsufficientResources,

    #[error("development container has been deleted")]
    DevPodDeleted,

    #[error("{0}")]
    PodFailed(String),

    #[error("transient error talking to the cluster: {0}")]
    Transient(String),
}

impl UpError {
    /// Errors that abort the current attempt but let the activation loop try
    /// again from `Resolving`.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::LostSync
                | Self::LostConnection
                | Self::ConnectionBroken(_)
                | Self::DevPodDeleted
                | Self::Transient(_)
        )
    }

    pub fn hint(&self) -> Option<String> {
        match self {
            Self::SyncUnreachable { hint } => Some(hint.clone()),
            Self::SyncFrozen { log_path } => Some(format!(
                "Help us improve kup by filing an issue and attaching the synchronization log at {}.\n    Then run 'kup down -v' and 'kup up' again",
                log_path.display()
            )),
            Self::InsufficientSpace => Some(
                "Increase the size of your persistent volume in your manifest ('persistentVolume.size')\n    and run 'kup down -v' and 'kup up' again"
                    .to_string(),
            ),
            Self::CreationDeclined { .. } => Some(
                "Deploy your workload first or run 'kup up --deploy' to create a sandbox".to_string(),
            ),
            Self::WorkloadModified(_) => Some(
                "Follow these steps:\n      1. Execute 'kup down'\n      2. Apply your manifest changes again: 'kubectl apply'\n      3. Execute 'kup up' again"
                    .to_string(),
            ),
            Self::InsufficientResources => Some(
                "Increase cluster resources or the 'timeout.resources' value in your manifest"
                    .to_string(),
            ),
            Self::ReverseNotSupported { .. } => {
                Some("Remove the 'reverse' section from your manifest".to_string())
            }
            _ => None,
        }
    }
}

/// Maps a kube client error into the domain taxonomy. Anything that looks like
/// the API server being unreachable is transient; API responses are not.
pub fn classify_kube_error(error: kube::Error) -> anyhow::Error {
    match error {
        kube::Error::Api(_) => anyhow::Error::new(error),
        kube::Error::HyperError(_) | kube::Error::Service(_) => {
            UpError::Transient(error.to_string()).into()
        }
        other => anyhow::Error::new(other),
    }
}

pub fn as_up_error(error: &anyhow::Error) -> Option<&UpError> {
    error.chain().find_map(|cause| cause.downcast_ref::<UpError>())
}
