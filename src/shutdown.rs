use std::time::Duration;

use futures::future::join_all;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info};

use crate::forward::PortForwardManager;
use crate::sync::SyncSession;

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum ShutdownReport {
    Drained,
    TimedOut,
}

/// Tears down one activation attempt. Never waits longer than `grace` for
/// tasks to notice cancellation.
pub struct ShutdownCoordinator {
    grace: Duration,
}

impl ShutdownCoordinator {
    pub fn new(grace: Duration) -> Self {
        Self { grace }
    }

    pub async fn shutdown(
        &self,
        cancel: &CancellationToken,
        tracker: &TaskTracker,
        forwarders: &[PortForwardManager],
        sync: Option<&SyncSession>,
    ) -> ShutdownReport {
        debug!("cancelling the current attempt");
        cancel.cancel();

        for forwarder in forwarders {
            forwarder.stop();
        }
        tracker.close();

        let drained = async {
            if let Some(sync) = sync {
                sync.stop().await;
            }
            tracker.wait().await;
            join_all(forwarders.iter().map(PortForwardManager::wait_stopped)).await;
        };
        match tokio::time::timeout(self.grace, drained).await {
            Ok(()) => {
                debug!("all tasks of the attempt finished");
                ShutdownReport::Drained
            }
            Err(_) => {
                info!(
                    "tasks still running after {:?}, continuing shutdown",
                    self.grace
                );
                ShutdownReport::TimedOut
            }
        }
    }
}
