use std::sync::Arc;
use std::time::Duration;

use anyhow::{Result, anyhow};
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info};

use super::SyncDaemon;
use crate::error::{UpError, as_up_error};
use crate::model::{Completion, SessionEvent, Side, SyncMode, SyncPhase};

const INSUFFICIENT_SPACE: &str = "insufficient space";
const MAX_MONITOR_FAILURES: u32 = 3;
const MAX_NEED_DELETES_RETRIES: u32 = 50;

#[derive(Debug, Clone)]
pub struct SyncTimings {
    pub ping_timeout: Duration,
    pub ping_interval: Duration,
    pub scan_timeout: Duration,
    pub scan_interval: Duration,
    pub completion_interval: Duration,
    pub stall_timeout: Duration,
    pub health_every_ticks: u64,
    pub monitor_interval: Duration,
}

impl Default for SyncTimings {
    fn default() -> Self {
        Self {
            ping_timeout: Duration::from_secs(30),
            ping_interval: Duration::from_millis(300),
            scan_timeout: Duration::from_secs(300),
            scan_interval: Duration::from_millis(100),
            completion_interval: Duration::from_millis(250),
            stall_timeout: Duration::from_secs(90),
            health_every_ticks: 40,
            monitor_interval: Duration::from_secs(10),
        }
    }
}

/// Drives one daemon pair from launch to steady-state monitoring. Built
/// fresh for every activation attempt, so phases never go backwards.
pub struct SyncSession {
    daemon: Arc<dyn SyncDaemon>,
    timings: SyncTimings,
    cancel: CancellationToken,
    phase: SyncPhase,
    history: Vec<SyncPhase>,
    remote_user_hint: String,
}

impl SyncSession {
    pub fn new(daemon: Arc<dyn SyncDaemon>, timings: SyncTimings, cancel: CancellationToken) -> Self {
        Self {
            daemon,
            timings,
            cancel,
            phase: SyncPhase::Idle,
            history: vec![SyncPhase::Idle],
            remote_user_hint: "Check that your container can write to the synchronized folder, or set 'securityContext.runAsUser' and 'securityContext.runAsGroup' in your manifest".to_string(),
        }
    }

    #[cfg(test)]
    pub fn phase(&self) -> SyncPhase {
        self.phase
    }

    #[cfg(test)]
    pub fn history(&self) -> &[SyncPhase] {
        &self.history
    }

    pub fn daemon(&self) -> &Arc<dyn SyncDaemon> {
        &self.daemon
    }

    fn enter(&mut self, next: SyncPhase) {
        if next <= self.phase && next != SyncPhase::Failed {
            debug!("sync phase stays at {:?}, ignoring {next:?}", self.phase);
            return;
        }
        if self.phase == SyncPhase::Failed {
            return;
        }
        debug!("sync phase {:?} -> {next:?}", self.phase);
        self.phase = next;
        self.history.push(next);
    }

    /// Runs every step up to the full two-way mode. On error the session is
    /// left in `Failed`.
    pub async fn synchronize<F>(&mut self, reset: bool, mut progress: F) -> Result<()>
    where
        F: FnMut(f64) + Send,
    {
        let result = self.synchronize_inner(reset, &mut progress).await;
        if result.is_err() {
            self.enter(SyncPhase::Failed);
        }
        result
    }

    async fn synchronize_inner<F>(&mut self, reset: bool, progress: &mut F) -> Result<()>
    where
        F: FnMut(f64) + Send,
    {
        self.run().await?;

        self.enter(SyncPhase::WaitingForPing);
        self.wait_for_ping(Side::Local).await?;
        self.wait_for_ping(Side::Remote).await?;
        self.daemon.pair().await?;
        if reset {
            self.daemon.reset_database(Side::Local).await?;
            self.daemon.reset_database(Side::Remote).await?;
        }
        if let Err(error) = self.daemon.send_ignore_file().await {
            info!("failed to send the ignore file to the remote side: {error:#}");
        }

        self.enter(SyncPhase::WaitingForInitialScan);
        self.wait_for_scanning(Side::Local).await?;
        self.wait_for_scanning(Side::Remote).await?;

        self.enter(SyncPhase::WaitingForPartialCompletion);
        self.wait_for_completion(&mut *progress).await?;

        self.enter(SyncPhase::OverridingLocalChanges);
        self.daemon.override_changes().await?;

        self.enter(SyncPhase::WaitingForFinalCompletion);
        self.wait_for_completion(&mut *progress).await?;

        self.enter(SyncPhase::FullSync);
        self.daemon.set_mode(SyncMode::SendReceive).await?;
        self.daemon.restart(Side::Local).await?;
        self.wait_for_ping(Side::Local).await?;
        Ok(())
    }

    pub async fn run(&mut self) -> Result<()> {
        self.enter(SyncPhase::Starting);
        self.daemon.run().await
    }

    pub async fn wait_for_ping(&self, side: Side) -> Result<()> {
        let mut ticker = tokio::time::interval(self.timings.ping_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let deadline = tokio::time::sleep(self.timings.ping_timeout);
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return Err(anyhow!("synchronization was cancelled")),
                _ = &mut deadline => {
                    info!("{side} synchronization service did not answer within {:?}", self.timings.ping_timeout);
                    return Err(self.unreachable(side));
                }
                _ = ticker.tick() => {
                    match self.daemon.ping(side).await {
                        Ok(()) => return Ok(()),
                        Err(error) => debug!("{side} ping failed: {error:#}"),
                    }
                }
            }
        }
    }

    fn unreachable(&self, side: Side) -> anyhow::Error {
        if side.is_local() {
            return anyhow!(
                "the local synchronization service did not start, check {}",
                self.daemon.log_path().display()
            );
        }
        UpError::SyncUnreachable {
            hint: self.remote_user_hint.clone(),
        }
        .into()
    }

    pub async fn wait_for_scanning(&self, side: Side) -> Result<()> {
        let mut ticker = tokio::time::interval(self.timings.scan_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let deadline = tokio::time::sleep(self.timings.scan_timeout);
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return Err(anyhow!("synchronization was cancelled")),
                _ = &mut deadline => {
                    anyhow::bail!("{side} folders were still being scanned after {:?}", self.timings.scan_timeout);
                }
                _ = ticker.tick() => {
                    match self.daemon.folder_statuses(side).await {
                        Ok(statuses) if statuses.iter().all(|status| !status.is_scanning()) => {
                            debug!("{side} folders scanned");
                            return Ok(());
                        }
                        Ok(_) => {}
                        Err(error) => debug!("failed to read {side} folder status: {error:#}"),
                    }
                }
            }
        }
    }

    /// Waits until both sides agree on the folder contents, reporting
    /// progress (0-100) on every tick.
    pub async fn wait_for_completion<F>(&self, mut progress: F) -> Result<()>
    where
        F: FnMut(f64) + Send,
    {
        let mut ticker = tokio::time::interval(self.timings.completion_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let stall_ticks = stall_ticks(&self.timings);
        let mut ticks: u64 = 0;
        let mut stalled_ticks: u64 = 0;
        let mut delete_retries: u32 = 0;
        let mut last_progress: Option<f64> = None;

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return Err(anyhow!("synchronization was cancelled")),
                _ = ticker.tick() => {}
            }
            ticks += 1;

            if ticks % self.timings.health_every_ticks == 0 {
                self.check_health().await?;
            }

            let completions = match self.daemon.completion(Side::Local).await {
                Ok(local) => self
                    .daemon
                    .completion(Side::Remote)
                    .await
                    .map(|remote| (local, remote)),
                Err(error) => Err(error),
            };
            let (local, remote) = match completions {
                Ok(completions) => completions,
                Err(error) if as_up_error(&error).is_some() => return Err(error),
                Err(error) => {
                    debug!("synchronization service is busy: {error:#}");
                    stalled_ticks += 1;
                    if stalled_ticks >= stall_ticks {
                        return Err(self.frozen());
                    }
                    continue;
                }
            };

            let current = remote.progress();
            progress(current);

            match evaluate(&local, &remote, &mut delete_retries) {
                CompletionCheck::Done => {
                    progress(100.0);
                    return Ok(());
                }
                CompletionCheck::Pending => {}
            }

            if last_progress == Some(current) {
                stalled_ticks += 1;
                if stalled_ticks >= stall_ticks {
                    info!(
                        "synchronization made no progress for {:?} (local {local:?}, remote {remote:?})",
                        self.timings.stall_timeout
                    );
                    return Err(self.frozen());
                }
            } else {
                stalled_ticks = 0;
                last_progress = Some(current);
            }
        }
    }

    fn frozen(&self) -> anyhow::Error {
        UpError::SyncFrozen {
            log_path: self.daemon.log_path(),
        }
        .into()
    }

    async fn check_health(&self) -> Result<()> {
        if let Err(error) = self.daemon.ping(Side::Remote).await {
            info!("remote synchronization service is not responding: {error:#}");
            return Err(UpError::LostSync.into());
        }
        match self.daemon.folder_errors(Side::Remote).await {
            Ok(errors) => {
                if errors
                    .iter()
                    .any(|error| error.to_ascii_lowercase().contains(INSUFFICIENT_SPACE))
                {
                    return Err(UpError::InsufficientSpace.into());
                }
                for error in errors {
                    debug!("remote folder error: {error}");
                }
            }
            Err(error) => debug!("failed to read remote folder errors: {error:#}"),
        }
        Ok(())
    }

    /// Watches the remote daemon until cancelled. After three consecutive
    /// failed pings the loop reports `Disconnected` once and ends.
    pub fn spawn_monitor(&mut self, tracker: &TaskTracker, events: mpsc::UnboundedSender<SessionEvent>) {
        self.enter(SyncPhase::Monitoring);
        let daemon = Arc::clone(&self.daemon);
        let cancel = self.cancel.clone();
        let interval = self.timings.monitor_interval;
        tracker.spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;
            let mut failures = 0;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = ticker.tick() => {}
                }
                match daemon.ping(Side::Remote).await {
                    Ok(()) => failures = 0,
                    Err(error) => {
                        failures += 1;
                        info!("remote synchronization ping failed ({failures}/{MAX_MONITOR_FAILURES}): {error:#}");
                        if failures >= MAX_MONITOR_FAILURES {
                            let _ = events.send(SessionEvent::Disconnected);
                            return;
                        }
                    }
                }
            }
        });
    }

    pub async fn stop(&self) {
        debug!("stopping synchronization after {:?}", self.history);
        if let Err(error) = self.daemon.stop().await {
            info!("failed to stop the local synchronization service: {error:#}");
        }
    }
}

enum CompletionCheck {
    Done,
    Pending,
}

fn evaluate(local: &Completion, remote: &Completion, delete_retries: &mut u32) -> CompletionCheck {
    if local.global_bytes != remote.global_bytes {
        return CompletionCheck::Pending;
    }
    if local.need_bytes != 0 || remote.need_bytes != 0 {
        return CompletionCheck::Pending;
    }
    if local.need_deletes > 0 || remote.need_deletes > 0 {
        *delete_retries += 1;
        if *delete_retries < MAX_NEED_DELETES_RETRIES {
            return CompletionCheck::Pending;
        }
        debug!("accepting pending deletes after {MAX_NEED_DELETES_RETRIES} checks");
    }
    CompletionCheck::Done
}

fn stall_ticks(timings: &SyncTimings) -> u64 {
    let interval = timings.completion_interval.as_millis().max(1);
    (timings.stall_timeout.as_millis() / interval).max(1) as u64
}
