use std::net::{Ipv4Addr, SocketAddr, TcpListener as StdTcpListener};
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite, copy_bidirectional};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::error::UpError;
use crate::model::{Forward, Reverse, SessionEvent};

pub trait TunnelIo: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T> TunnelIo for T where T: AsyncRead + AsyncWrite + Send + Unpin {}

pub type TunnelStream = Box<dyn TunnelIo>;

/// Opens one byte stream to a container port of a pod.
#[async_trait]
pub trait TunnelDialer: Send + Sync {
    async fn dial(&self, namespace: &str, pod: &str, remote_port: u16) -> Result<TunnelStream>;
}

#[derive(Debug, Clone)]
struct TunnelTarget {
    namespace: String,
    pod: String,
    forward: Forward,
}

/// A set of local-port to container-port tunnels bound to one pod.
pub struct PortForwardManager {
    dialer: Arc<dyn TunnelDialer>,
    events: mpsc::UnboundedSender<SessionEvent>,
    forwards: Vec<Forward>,
    cancel: CancellationToken,
    tracker: TaskTracker,
    bound: Vec<SocketAddr>,
}

impl PortForwardManager {
    pub fn new(
        dialer: Arc<dyn TunnelDialer>,
        parent: &CancellationToken,
        events: mpsc::UnboundedSender<SessionEvent>,
    ) -> Self {
        Self {
            dialer,
            events,
            forwards: Vec::new(),
            cancel: parent.child_token(),
            tracker: TaskTracker::new(),
            bound: Vec::new(),
        }
    }

    pub fn add(&mut self, local: u16, remote: u16) -> Result<(), UpError> {
        if self.forwards.iter().any(|forward| forward.local == local) {
            return Err(UpError::DuplicateLocalPort(local));
        }
        self.forwards.push(Forward { local, remote });
        Ok(())
    }

    pub fn add_reverse(&mut self, reverse: Reverse) -> Result<(), UpError> {
        Err(UpError::ReverseNotSupported {
            local: reverse.local,
            remote: reverse.remote,
        })
    }

    #[cfg(test)]
    pub fn forwards(&self) -> &[Forward] {
        &self.forwards
    }

    pub fn bound_addresses(&self) -> &[SocketAddr] {
        &self.bound
    }

    /// Binds every listener, then hands each one to its own supervising task.
    /// A bind failure is returned; nothing is left listening in that case.
    pub async fn start(&mut self, pod: &str, namespace: &str) -> Result<()> {
        if self.cancel.is_cancelled() {
            anyhow::bail!("port forwarding to {namespace}/{pod} was already stopped");
        }

        let mut listeners = Vec::with_capacity(self.forwards.len());
        for forward in &self.forwards {
            let address = SocketAddr::from((Ipv4Addr::LOCALHOST, forward.local));
            let listener = TcpListener::bind(address).await.with_context(|| {
                format!(
                    "port {} is already in use in your local machine, please check your configuration",
                    forward.local
                )
            })?;
            listeners.push((listener, *forward));
        }

        for (listener, forward) in listeners {
            if let Ok(address) = listener.local_addr() {
                self.bound.push(address);
            }
            let target = TunnelTarget {
                namespace: namespace.to_string(),
                pod: pod.to_string(),
                forward,
            };
            self.tracker.spawn(supervise_tunnel(
                listener,
                target,
                Arc::clone(&self.dialer),
                self.events.clone(),
                self.cancel.clone(),
                self.tracker.clone(),
            ));
        }

        info!(
            "forwarding {} ports to {namespace}/{pod}",
            self.forwards.len()
        );
        Ok(())
    }

    /// Idempotent. Safe on a manager that never started.
    pub fn stop(&self) {
        if !self.cancel.is_cancelled() {
            self.cancel.cancel();
            info!("stopped port forwarding");
        }
        self.tracker.close();
    }

    /// Resolves once every tunnel task (and therefore every listener) is gone.
    pub async fn wait_stopped(&self) {
        self.tracker.wait().await;
    }
}

impl Drop for PortForwardManager {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn supervise_tunnel(
    listener: TcpListener,
    target: TunnelTarget,
    dialer: Arc<dyn TunnelDialer>,
    events: mpsc::UnboundedSender<SessionEvent>,
    cancel: CancellationToken,
    tracker: TaskTracker,
) {
    debug!(
        "tunnel {} -> {}/{}:{} is listening",
        target.forward.local, target.namespace, target.pod, target.forward.remote
    );
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((socket, peer)) => {
                    debug!("accepted {peer} on port {}", target.forward.local);
                    tracker.spawn(forward_connection(
                        socket,
                        target.clone(),
                        Arc::clone(&dialer),
                        events.clone(),
                        cancel.clone(),
                    ));
                }
                Err(error) => {
                    warn!("accept failed on port {}: {error}", target.forward.local);
                    let _ = events.send(SessionEvent::TunnelError(format!(
                        "port {}: {error}",
                        target.forward.local
                    )));
                    break;
                }
            }
        }
    }
    debug!("tunnel on port {} closed", target.forward.local);
}

async fn forward_connection(
    mut socket: TcpStream,
    target: TunnelTarget,
    dialer: Arc<dyn TunnelDialer>,
    events: mpsc::UnboundedSender<SessionEvent>,
    cancel: CancellationToken,
) {
    let dialed = tokio::select! {
        _ = cancel.cancelled() => return,
        dialed = dialer.dial(&target.namespace, &target.pod, target.forward.remote) => dialed,
    };
    let mut upstream = match dialed {
        Ok(stream) => stream,
        Err(error) => {
            debug!(
                "failed to forward port {} to {}: {error:#}",
                target.forward.local, target.pod
            );
            let _ = events.send(SessionEvent::TunnelError(format!(
                "port {} -> {}: {error:#}",
                target.forward.local, target.forward.remote
            )));
            return;
        }
    };

    tokio::select! {
        _ = cancel.cancelled() => {}
        copied = copy_bidirectional(&mut socket, &mut upstream) => match copied {
            Ok((sent, received)) => debug!(
                "connection on port {} finished ({sent} bytes sent, {received} bytes received)",
                target.forward.local
            ),
            Err(error) => {
                debug!("connection on port {} broke: {error}", target.forward.local);
                let _ = events.send(SessionEvent::TunnelError(format!(
                    "port {} -> {}: {error}",
                    target.forward.local, target.forward.remote
                )));
            }
        }
    }
}

/// Asks the OS for a free local port.
pub fn available_port() -> Result<u16> {
    let listener = StdTcpListener::bind((Ipv4Addr::LOCALHOST, 0))
        .context("failed to find an available local port")?;
    Ok(listener.local_addr()?.port())
}
