use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info};

use crate::backoff::Backoff;
use crate::config::{Timeouts, UpConfig};
use crate::error::{UpError, as_up_error};
use crate::exec::{RemoteExecSession, RemoteExecutor, StdioProvider, watches_too_low};
use crate::forward::{PortForwardManager, TunnelDialer};
use crate::k8s::ClusterApi;
use crate::model::{ActivationState, DevPod, SessionEvent, Side, UpState, Workload};
use crate::output::{Printer, Prompt};
use crate::shutdown::ShutdownCoordinator;
use crate::state::{PidFileGuard, StateFile, WarningState};
use crate::sync::{REMOTE_DATA_PORT, REMOTE_GUI_PORT, SyncDaemonFactory, SyncInfo, SyncSession, SyncTimings};
use crate::terminal::{ScopedTerminalMode, TerminalControl};

const RECONNECTING_MESSAGE: &str = "Trying to reconnect to your cluster. File synchronization will automatically resume when the connection improves.";
const DEACTIVATED_MESSAGE: &str = "Development container has been deactivated";
const REMOTE_WATCHER_WARNING: &str = ".remotewatcher";
const BACKOFF_MULTIPLIER: f64 = 2.0;
const BACKOFF_JITTER: f64 = 0.2;

/// Everything `kup up` talks to outside the process.
#[derive(Clone)]
pub struct Collaborators {
    pub cluster: Arc<dyn ClusterApi>,
    pub dialer: Arc<dyn TunnelDialer>,
    pub executor: Arc<dyn RemoteExecutor>,
    pub sync: Arc<dyn SyncDaemonFactory>,
    pub prompt: Arc<dyn Prompt>,
    pub terminal: Arc<dyn TerminalControl>,
    pub stdio: Arc<dyn StdioProvider>,
}

/// Resources owned by a single activation attempt.
struct Attempt {
    cancel: CancellationToken,
    tracker: TaskTracker,
    forwarders: Vec<PortForwardManager>,
    sync: Option<SyncSession>,
    events_tx: mpsc::UnboundedSender<SessionEvent>,
    events_rx: mpsc::UnboundedReceiver<SessionEvent>,
}

impl Attempt {
    fn new(session: &CancellationToken) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            cancel: session.child_token(),
            tracker: TaskTracker::new(),
            forwarders: Vec::new(),
            sync: None,
            events_tx,
            events_rx,
        }
    }
}

pub struct UpContext {
    config: UpConfig,
    deps: Collaborators,
    printer: Printer,
    state_file: StateFile,
    interrupt: CancellationToken,
    session: CancellationToken,
    state: ActivationState,
    transitions: Vec<ActivationState>,
    retry: bool,
    reset_sync: bool,
    success: bool,
    notified: bool,
    container: Option<String>,
    pod: Option<DevPod>,
    backoff: Backoff,
}

impl UpContext {
    pub fn new(config: UpConfig, deps: Collaborators, printer: Printer, interrupt: CancellationToken) -> Self {
        let state_file = StateFile::new(&config.workload_home());
        let backoff = Backoff::new(
            config.timeouts.retry_initial,
            config.timeouts.retry_max,
            BACKOFF_MULTIPLIER,
            BACKOFF_JITTER,
        );
        let session = interrupt.child_token();
        let reset_sync = config.reset_sync;
        Self {
            config,
            deps,
            printer,
            state_file,
            interrupt,
            session,
            state: ActivationState::Resolving,
            transitions: vec![ActivationState::Resolving],
            retry: false,
            reset_sync,
            success: false,
            notified: false,
            container: None,
            pod: None,
            backoff,
        }
    }

    pub fn state(&self) -> ActivationState {
        self.state
    }

    /// Every state the loop went through, starting with `Resolving`.
    pub fn transitions(&self) -> &[ActivationState] {
        &self.transitions
    }

    fn transition(&mut self, next: ActivationState) {
        if !self.state.can_transition_to(next) {
            info!(
                "unexpected activation transition {} -> {}",
                self.state.title(),
                next.title()
            );
        }
        debug!("activation {} -> {}", self.state.title(), next.title());
        self.state = next;
        self.transitions.push(next);
    }

    /// Runs attempts until the command finishes, the user interrupts or a
    /// non-retryable error shows up.
    pub async fn run(&mut self) -> Result<()> {
        let mut terminal = ScopedTerminalMode::acquire(self.deps.terminal.clone());
        let interrupt = self.interrupt.clone();
        loop {
            let mut attempt = Attempt::new(&self.session);
            let outcome = tokio::select! {
                _ = interrupt.cancelled() => {
                    debug!("activation interrupted");
                    Ok(())
                }
                outcome = self.activate(&mut attempt, &mut terminal) => outcome,
            };
            terminal.restore();

            let retry = match &outcome {
                Err(error) if !interrupt.is_cancelled() => self.should_retry(error, &attempt).await,
                _ => false,
            };
            ShutdownCoordinator::new(self.config.timeouts.shutdown_grace)
                .shutdown(
                    &attempt.cancel,
                    &attempt.tracker,
                    &attempt.forwarders,
                    attempt.sync.as_ref(),
                )
                .await;

            if interrupt.is_cancelled() {
                self.transition(ActivationState::Exited);
                return Ok(());
            }

            let error = match outcome {
                Ok(()) => {
                    self.transition(ActivationState::Exited);
                    return Ok(());
                }
                Err(error) => error,
            };

            if matches!(as_up_error(&error), Some(UpError::Deactivated)) {
                self.printer.warning(DEACTIVATED_MESSAGE);
                self.transition(ActivationState::Exited);
                return Ok(());
            }

            if !retry {
                self.state_file.update(UpState::Failed);
                self.transition(ActivationState::Exited);
                return Err(error);
            }

            info!("activation attempt failed, retrying: {error:#}");
            self.transition(ActivationState::Reconnecting);
            if !self.notified {
                self.printer.warning(RECONNECTING_MESSAGE);
                self.notified = true;
            }
            self.destroy_pod_without_volume().await;

            let delay = self.backoff.next_delay();
            debug!("waiting {delay:?} before the next attempt");
            tokio::select! {
                _ = interrupt.cancelled() => {
                    self.transition(ActivationState::Exited);
                    return Ok(());
                }
                _ = tokio::time::sleep(delay) => {}
            }
            self.transition(ActivationState::Resolving);
        }
    }

    async fn activate(&mut self, attempt: &mut Attempt, terminal: &mut ScopedTerminalMode) -> Result<()> {
        let workload = self.resolve().await?;
        let container = self.pin_container(&workload)?;

        self.transition(ActivationState::Provisioning);
        self.state_file.update(UpState::Provisioning);
        let info = self.provision().await?;

        self.transition(ActivationState::Deploying);
        if workload.dev_mode_on {
            debug!("{} is already in development mode", self.config.workload);
        } else {
            self.deps
                .cluster
                .deploy_dev_mode(&self.config, &workload, &container)
                .await?;
        }

        self.transition(ActivationState::WaitingForPod);
        let pod = self.wait_for_pod(attempt).await?;
        self.pod = Some(pod.clone());
        self.retry = true;

        self.transition(ActivationState::Forwarding);
        let mut forwarder = PortForwardManager::new(
            self.deps.dialer.clone(),
            &attempt.cancel,
            attempt.events_tx.clone(),
        );
        forwarder.add(info.remote_gui_port, REMOTE_GUI_PORT)?;
        forwarder.add(info.remote_data_port, REMOTE_DATA_PORT)?;
        for forward in &self.config.forwards {
            forwarder.add(forward.local, forward.remote)?;
        }
        for reverse in &self.config.reverses {
            forwarder.add_reverse(*reverse)?;
        }
        attempt.forwarders.push(forwarder);
        if let Some(forwarder) = attempt.forwarders.last_mut() {
            forwarder.start(&pod.name, &pod.namespace).await?;
            debug!("listening on {:?}", forwarder.bound_addresses());
        }

        self.transition(ActivationState::Syncing);
        self.synchronize(attempt, &info).await?;
        self.printer.success("Files synchronized");
        self.printer.display_context(&self.config, &pod.name);

        self.transition(ActivationState::Running);
        self.state_file.update(UpState::Activating);
        let exec = RemoteExecSession::new(self.deps.executor.clone(), pod.clone(), container);
        if let Some(watches) = exec.run_cleanup().await
            && watches_too_low(watches)
        {
            self.warn_low_watches();
        }
        self.state_file.update(UpState::Ready);
        self.success = true;
        self.notified = false;
        self.backoff.reset();

        let tty = self.config.interactive() && terminal.is_terminal();
        if tty && let Err(error) = terminal.enter_raw() {
            info!("failed to put the terminal in raw mode: {error}");
        }
        let argv = self.config.command.clone();
        let io = self.deps.stdio.open();
        let cancel = attempt.cancel.clone();
        let events = attempt.events_tx.clone();
        attempt.tracker.spawn(async move {
            let result = exec.run_command(&argv, tty, io, &cancel).await;
            let _ = events.send(SessionEvent::CommandExited(result));
        });

        wait_for_outcome(
            &mut attempt.events_rx,
            &attempt.cancel,
            self.deps.cluster.as_ref(),
            &pod,
        )
        .await
    }

    async fn resolve(&mut self) -> Result<Workload> {
        let found = self
            .deps
            .cluster
            .get_workload(&self.config.workload)
            .await
            .with_context(|| format!("failed to get workload {}", self.config.workload))?;
        match found {
            Some(workload) if self.retry && !workload.dev_mode_on => Err(UpError::Deactivated.into()),
            Some(workload) if workload.modified_while_active => {
                Err(UpError::WorkloadModified(workload.name).into())
            }
            Some(workload) => Ok(workload),
            None if self.retry => Err(UpError::Deactivated.into()),
            None => self.create_sandbox().await,
        }
    }

    async fn create_sandbox(&mut self) -> Result<Workload> {
        let namespace = self.config.workload.namespace.clone();
        let name = self.config.workload.name.clone();
        if !self.config.auto_deploy {
            let question = format!(
                "Workload '{name}' doesn't exist in namespace '{namespace}'. Do you want to create a new one?"
            );
            if !self.deps.prompt.confirm(&question, true).await? {
                return Err(UpError::CreationDeclined { namespace, name }.into());
            }
        }
        self.printer.info(format!("Creating sandbox '{name}'..."));
        let workload = self.deps.cluster.create_sandbox(&self.config).await?;
        self.printer.success(format!("Sandbox '{name}' created"));
        Ok(workload)
    }

    /// The container picked on the first attempt sticks for every retry.
    fn pin_container(&mut self, workload: &Workload) -> Result<String> {
        let wanted = self
            .container
            .clone()
            .or_else(|| self.config.workload.container.clone());
        let container = workload
            .resolve_container(wanted.as_deref())
            .ok_or_else(|| UpError::ContainerNotFound {
                container: wanted.unwrap_or_default(),
                workload: workload.name.clone(),
            })?;
        if self.container.is_none() {
            debug!("pinned container {container}");
            self.container = Some(container.clone());
        }
        Ok(container)
    }

    async fn provision(&self) -> Result<SyncInfo> {
        let cluster = &self.deps.cluster;
        cluster.check_namespace(&self.config.workload.namespace).await?;
        if self.config.persistent_volume_enabled() {
            cluster.ensure_volume(&self.config).await?;
        }
        let info = SyncInfo::prepare(&self.config.workload_home())?;
        cluster.ensure_sync_secret(&self.config, &info).await?;
        Ok(info)
    }

    async fn wait_for_pod(&self, attempt: &Attempt) -> Result<DevPod> {
        let (progress_tx, mut progress_rx) = mpsc::unbounded_channel::<String>();
        let printer = self.printer.clone();
        attempt.tracker.spawn(async move {
            while let Some(message) = progress_rx.recv().await {
                printer.info(format!(" i  {message}"));
            }
        });
        self.deps
            .cluster
            .wait_for_dev_pod(&self.config, progress_tx)
            .await
    }

    async fn synchronize(&mut self, attempt: &mut Attempt, info: &SyncInfo) -> Result<()> {
        self.state_file.update(UpState::StartingSync);
        let daemon = self.deps.sync.create(&self.config, info)?;
        let session = attempt.sync.insert(SyncSession::new(
            daemon,
            sync_timings(&self.config.timeouts),
            attempt.cancel.clone(),
        ));

        self.state_file.update(UpState::Synchronizing);
        let printer = self.printer.clone();
        let mut last_shown = None;
        let reset = self.reset_sync;
        session
            .synchronize(reset, move |percent| {
                let whole = percent.floor() as i64;
                if last_shown != Some(whole) {
                    last_shown = Some(whole);
                    printer.progress("Synchronizing your files...", percent);
                }
            })
            .await?;
        self.reset_sync = false;
        session.spawn_monitor(&attempt.tracker, attempt.events_tx.clone());
        Ok(())
    }

    async fn should_retry(&self, error: &anyhow::Error, attempt: &Attempt) -> bool {
        match as_up_error(error) {
            Some(UpError::CommandFailed { .. } | UpError::ConnectionBroken(_)) => {
                self.success && self.dev_container_lost(attempt).await
            }
            Some(up_error) => up_error.is_retryable(),
            None => false,
        }
    }

    /// True when the dev pod is gone or its sync daemon stopped answering.
    async fn dev_container_lost(&self, attempt: &Attempt) -> bool {
        if let Some(pod) = &self.pod {
            match self.deps.cluster.pod_exists(pod).await {
                Ok(true) => {}
                Ok(false) => {
                    info!("pod {} is gone", pod.name);
                    return true;
                }
                Err(error) => {
                    info!("failed to check pod {}: {error:#}", pod.name);
                    return true;
                }
            }
        }
        let Some(sync) = &attempt.sync else {
            return false;
        };
        match sync.daemon().ping(Side::Remote).await {
            Ok(()) => {
                debug!("remote daemon still answers");
                false
            }
            Err(error) => {
                info!("remote daemon is gone: {error:#}");
                true
            }
        }
    }

    /// Shown once per namespace.
    fn warn_low_watches(&self) {
        let warnings = WarningState::new(&self.config.namespace_home());
        if warnings.is_set(REMOTE_WATCHER_WARNING) {
            return;
        }
        self.printer
            .warning("The value of /proc/sys/fs/inotify/max_user_watches in your cluster nodes is too low.");
        self.printer
            .warning("This can affect file synchronization performance.");
        self.printer
            .warning("Raise it on your nodes, for example 'sysctl -w fs.inotify.max_user_watches=524288'.");
        warnings.set(REMOTE_WATCHER_WARNING);
    }

    async fn destroy_pod_without_volume(&mut self) {
        if self.config.persistent_volume_enabled() {
            return;
        }
        let Some(pod) = self.pod.take() else {
            return;
        };
        if let Err(error) = self.deps.cluster.destroy_pod(&pod).await {
            info!("failed to destroy pod {}: {error:#}", pod.name);
        }
    }
}

fn sync_timings(timeouts: &Timeouts) -> SyncTimings {
    SyncTimings {
        ping_timeout: timeouts.ping,
        scan_timeout: timeouts.scan,
        stall_timeout: timeouts.stall,
        monitor_interval: timeouts.monitor_interval,
        ..SyncTimings::default()
    }
}

/// Resolves on the first event that ends the attempt. Tunnel errors only end
/// it when the dev pod is gone.
async fn wait_for_outcome(
    events: &mut mpsc::UnboundedReceiver<SessionEvent>,
    cancel: &CancellationToken,
    cluster: &dyn ClusterApi,
    pod: &DevPod,
) -> Result<()> {
    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            event = events.recv() => event,
        };
        match event {
            Some(SessionEvent::CommandExited(Ok(()))) => {
                debug!("remote command finished");
                return Ok(());
            }
            Some(SessionEvent::CommandExited(Err(error))) => return Err(error.into()),
            Some(SessionEvent::Disconnected) => return Err(UpError::LostConnection.into()),
            Some(SessionEvent::TunnelError(message)) => match cluster.pod_exists(pod).await {
                Ok(true) => info!("port forward error: {message}"),
                Ok(false) => {
                    info!("pod {} is gone after a port forward error: {message}", pod.name);
                    return Err(UpError::LostConnection.into());
                }
                Err(error) => {
                    info!("failed to check pod {}: {error:#}", pod.name);
                    return Err(UpError::LostConnection.into());
                }
            },
            None => return Err(UpError::LostConnection.into()),
        }
    }
}

/// Entry point of `kup up`.
pub async fn run_up(
    config: UpConfig,
    deps: Collaborators,
    printer: Printer,
    interrupt: CancellationToken,
) -> Result<()> {
    let _pid = match PidFileGuard::create(&config.workload_home()) {
        Ok(guard) => Some(guard),
        Err(error) => {
            info!("failed to write the pid file: {error}");
            None
        }
    };
    let mut context = UpContext::new(config, deps, printer, interrupt);
    let result = context.run().await;
    debug!(
        "activation finished in state {} after {} transitions",
        context.state().title(),
        context.transitions().len()
    );
    result
}

#[cfg(test)]
mod tests {
    use super::{Collaborators, UpContext, wait_for_outcome};
    use crate::config::UpConfig;
    use crate::error::{UpError, as_up_error};
    use crate::forward::available_port;
    use crate::model::{ActivationState, DevPod, Forward, SessionEvent};
    use crate::output::Printer;
    use crate::state::StateFile;
    use crate::testing::{
        CapturedStdio, EchoDialer, FakeTerminal, MockCluster, MockExecutor, MockPrompt, MockSyncDaemon,
        MockSyncFactory, ScriptedExit, SharedBuffer,
    };
    use std::sync::Arc;
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio::sync::{Notify, mpsc};
    use tokio_util::sync::CancellationToken;

    struct Harness {
        _home: TempDir,
        config: UpConfig,
        cluster: Arc<MockCluster>,
        executor: Arc<MockExecutor>,
        daemon: Arc<MockSyncDaemon>,
        prompt: Arc<MockPrompt>,
        terminal: Arc<FakeTerminal>,
        stdio: CapturedStdio,
        output: SharedBuffer,
    }

    impl Harness {
        fn new(cluster: MockCluster, scripts: Vec<ScriptedExit>) -> Self {
            let home = TempDir::new().expect("home");
            let mut config = UpConfig::for_tests(home.path());
            config.forwards = vec![Forward {
                local: available_port().expect("port"),
                remote: 80,
            }];
            config.timeouts.retry_initial = Duration::from_millis(10);
            config.timeouts.retry_max = Duration::from_millis(20);
            config.timeouts.monitor_interval = Duration::from_millis(20);
            Self {
                _home: home,
                config,
                cluster: Arc::new(cluster),
                executor: Arc::new(MockExecutor::new(scripts)),
                daemon: Arc::new(MockSyncDaemon::healthy()),
                prompt: Arc::new(MockPrompt::answering(true)),
                terminal: Arc::new(FakeTerminal::new(true)),
                stdio: CapturedStdio::default(),
                output: SharedBuffer::default(),
            }
        }

        fn context(&self, interrupt: CancellationToken) -> UpContext {
            let deps = Collaborators {
                cluster: self.cluster.clone(),
                dialer: Arc::new(EchoDialer::default()),
                executor: self.executor.clone(),
                sync: Arc::new(MockSyncFactory::new(self.daemon.clone())),
                prompt: self.prompt.clone(),
                terminal: self.terminal.clone(),
                stdio: Arc::new(self.stdio.clone()),
            };
            let printer = Printer::new(Box::new(self.output.clone()), false);
            UpContext::new(self.config.clone(), deps, printer, interrupt)
        }
    }

    async fn eventually(mut condition: impl FnMut() -> bool) {
        tokio::time::timeout(Duration::from_secs(10), async {
            while !condition() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition was never met");
    }

    fn pod() -> DevPod {
        DevPod {
            name: "api-dev-0".to_string(),
            namespace: "default".to_string(),
            node_name: None,
        }
    }

    #[tokio::test]
    async fn first_event_decides_the_outcome() {
        let cluster = MockCluster::with_workload("default", "api");
        let (tx, mut rx) = mpsc::unbounded_channel();
        tx.send(SessionEvent::Disconnected).expect("send");
        tx.send(SessionEvent::CommandExited(Ok(()))).expect("send");

        let outcome = wait_for_outcome(&mut rx, &CancellationToken::new(), &cluster, &pod()).await;
        let error = outcome.expect_err("disconnect wins");
        assert!(matches!(as_up_error(&error), Some(UpError::LostConnection)));

        let outcome = wait_for_outcome(&mut rx, &CancellationToken::new(), &cluster, &pod()).await;
        assert!(outcome.is_ok());
    }

    #[tokio::test]
    async fn tunnel_error_with_live_pod_keeps_waiting() {
        let cluster = MockCluster::with_workload("default", "api");
        cluster.set_pod_alive(true);
        let (tx, mut rx) = mpsc::unbounded_channel();
        tx.send(SessionEvent::TunnelError("port 8080 -> 80: reset".to_string()))
            .expect("send");
        tx.send(SessionEvent::CommandExited(Err(UpError::CommandFailed { code: 2 })))
            .expect("send");

        let error = wait_for_outcome(&mut rx, &CancellationToken::new(), &cluster, &pod())
            .await
            .expect_err("command failure");
        assert!(matches!(
            as_up_error(&error),
            Some(UpError::CommandFailed { code: 2 })
        ));
    }

    #[tokio::test]
    async fn tunnel_error_with_missing_pod_is_lost_connection() {
        let cluster = MockCluster::with_workload("default", "api");
        cluster.set_pod_alive(false);
        let (tx, mut rx) = mpsc::unbounded_channel();
        tx.send(SessionEvent::TunnelError("port 8080 -> 80: reset".to_string()))
            .expect("send");

        let error = wait_for_outcome(&mut rx, &CancellationToken::new(), &cluster, &pod())
            .await
            .expect_err("pod gone");
        assert!(matches!(as_up_error(&error), Some(UpError::LostConnection)));
    }

    #[tokio::test]
    async fn interrupted_session_reaches_running_and_exits_cleanly() {
        let harness = Harness::new(
            MockCluster::with_workload("default", "api"),
            vec![ScriptedExit::Hang],
        );
        harness.executor.set_stdout(b"\x1b[32mready\x1b[0m\r\n".to_vec());
        let interrupt = CancellationToken::new();
        let mut context = harness.context(interrupt.clone());
        let run = tokio::spawn(async move {
            let result = context.run().await;
            (result, context)
        });

        let stdout = harness.stdio.output.clone();
        eventually(|| !stdout.bytes().is_empty()).await;
        interrupt.cancel();
        let (result, context) = run.await.expect("join");

        result.expect("interrupt is a clean exit");
        assert_eq!(harness.stdio.output.bytes(), b"\x1b[32mready\x1b[0m\r\n");
        use ActivationState::*;
        assert_eq!(
            context.transitions(),
            &[
                Resolving,
                Provisioning,
                Deploying,
                WaitingForPod,
                Forwarding,
                Syncing,
                Running,
                Exited
            ]
        );
        assert_eq!(harness.terminal.raw_entries(), 1);
        assert_eq!(harness.terminal.restores(), 1);
        assert_eq!(harness.daemon.stops(), 1);
        let state = StateFile::new(&harness.config.workload_home())
            .read()
            .expect("state file");
        assert_eq!(state.as_deref(), Some("ready"));
        assert!(harness.output.contents().contains("Files synchronized"));
    }

    #[tokio::test]
    async fn clean_command_exit_ends_the_session() {
        let harness = Harness::new(
            MockCluster::with_workload("default", "api"),
            vec![ScriptedExit::Code(0)],
        );
        let mut context = harness.context(CancellationToken::new());
        context.run().await.expect("clean exit");
        assert_eq!(context.state(), ActivationState::Exited);
        assert_eq!(harness.cluster.pods_started(), 1);
    }

    #[tokio::test]
    async fn pod_loss_reconnects_once_without_prompting_again() {
        let harness = Harness::new(MockCluster::empty(), vec![ScriptedExit::Hang, ScriptedExit::Hang]);
        harness.executor.set_stdout(b"$ ".to_vec());
        let interrupt = CancellationToken::new();
        let mut context = harness.context(interrupt.clone());
        let run = tokio::spawn(async move {
            let result = context.run().await;
            (result, context)
        });

        let stdout = harness.stdio.output.clone();
        eventually(|| stdout.bytes().len() == 2).await;
        harness.cluster.set_pod_alive(false);
        harness.daemon.fail_next_remote_pings(3);
        eventually(|| stdout.bytes().len() == 4).await;
        interrupt.cancel();
        let (result, context) = run.await.expect("join");

        result.expect("interrupt is a clean exit");
        let output = harness.output.contents();
        assert_eq!(output.matches("Trying to reconnect").count(), 1);
        assert_eq!(harness.prompt.asked(), 1);
        assert_eq!(harness.cluster.sandboxes(), 1);
        assert_eq!(harness.cluster.destroyed_pods(), 1);
        assert_eq!(harness.cluster.pods_started(), 2);

        let transitions = context.transitions();
        let reconnect = transitions
            .iter()
            .position(|state| *state == ActivationState::Reconnecting)
            .expect("reconnected");
        assert_eq!(transitions[reconnect + 1], ActivationState::Resolving);
        assert_eq!(
            transitions
                .iter()
                .filter(|state| **state == ActivationState::Reconnecting)
                .count(),
            1
        );
        assert_eq!(harness.terminal.restores(), 2);
    }

    #[tokio::test]
    async fn missing_workload_on_retry_is_deactivation() {
        let harness = Harness::new(MockCluster::empty(), vec![ScriptedExit::Hang]);
        harness.executor.set_stdout(b"$ ".to_vec());
        let mut context = harness.context(CancellationToken::new());
        let run = tokio::spawn(async move {
            let result = context.run().await;
            (result, context)
        });

        let stdout = harness.stdio.output.clone();
        eventually(|| !stdout.bytes().is_empty()).await;
        harness.cluster.remove_workload();
        harness.daemon.fail_next_remote_pings(3);
        let (result, context) = run.await.expect("join");

        result.expect("deactivation is not an error");
        assert_eq!(harness.prompt.asked(), 1);
        assert_eq!(harness.cluster.sandboxes(), 1);
        assert!(harness.output.contents().contains("deactivated"));
        assert_eq!(context.state(), ActivationState::Exited);
    }

    #[tokio::test]
    async fn declined_creation_is_fatal() {
        let mut harness = Harness::new(MockCluster::empty(), Vec::new());
        harness.prompt = Arc::new(MockPrompt::answering(false));
        let mut context = harness.context(CancellationToken::new());
        let error = context.run().await.expect_err("declined");
        assert!(matches!(
            as_up_error(&error),
            Some(UpError::CreationDeclined { .. })
        ));
        assert_eq!(harness.cluster.sandboxes(), 0);
        let state = StateFile::new(&harness.config.workload_home())
            .read()
            .expect("state file");
        assert_eq!(state.as_deref(), Some("failed"));
    }

    #[tokio::test]
    async fn pod_timeout_is_fatal() {
        let harness = Harness::new(MockCluster::with_workload("default", "api"), Vec::new());
        harness
            .cluster
            .fail_pod_wait(UpError::PodTimeout(Duration::from_secs(120)));
        let mut context = harness.context(CancellationToken::new());
        let error = context.run().await.expect_err("timeout");
        assert!(matches!(as_up_error(&error), Some(UpError::PodTimeout(_))));
        assert_eq!(
            context.transitions().last(),
            Some(&ActivationState::Exited)
        );
        assert!(harness.executor.commands().is_empty());
    }

    #[tokio::test]
    async fn failing_command_with_healthy_sync_is_not_retried() {
        let harness = Harness::new(
            MockCluster::with_workload("default", "api"),
            vec![ScriptedExit::Code(7)],
        );
        let mut context = harness.context(CancellationToken::new());
        let error = context.run().await.expect_err("command failed");
        assert!(matches!(
            as_up_error(&error),
            Some(UpError::CommandFailed { code: 7 })
        ));
        assert!(!context.transitions().contains(&ActivationState::Reconnecting));
    }

    #[tokio::test]
    async fn transient_lookup_failure_still_offers_creation() {
        let harness = Harness::new(MockCluster::empty(), vec![ScriptedExit::Code(0)]);
        harness.cluster.fail_next_lookups(1);
        let mut context = harness.context(CancellationToken::new());
        context.run().await.expect("sandbox created after the api came back");
        assert_eq!(harness.prompt.asked(), 1);
        assert_eq!(harness.cluster.sandboxes(), 1);
        assert!(!harness.output.contents().contains("deactivated"));
        assert!(context.transitions().contains(&ActivationState::Running));
    }

    #[tokio::test]
    async fn broken_stream_with_live_pod_is_not_retried() {
        let harness = Harness::new(
            MockCluster::with_workload("default", "api"),
            vec![ScriptedExit::Broken],
        );
        let mut context = harness.context(CancellationToken::new());
        let error = context.run().await.expect_err("broken stream");
        assert!(matches!(
            as_up_error(&error),
            Some(UpError::ConnectionBroken(_))
        ));
        assert!(!context.transitions().contains(&ActivationState::Reconnecting));
        assert_eq!(harness.cluster.destroyed_pods(), 0);
        assert_eq!(harness.cluster.pods_started(), 1);
    }

    #[tokio::test]
    async fn broken_stream_after_pod_loss_reconnects() {
        let broken = Arc::new(Notify::new());
        let harness = Harness::new(
            MockCluster::with_workload("default", "api"),
            vec![ScriptedExit::BrokenOn(broken.clone()), ScriptedExit::Hang],
        );
        harness.executor.set_stdout(b"$ ".to_vec());
        let interrupt = CancellationToken::new();
        let mut context = harness.context(interrupt.clone());
        let run = tokio::spawn(async move {
            let result = context.run().await;
            (result, context)
        });

        let stdout = harness.stdio.output.clone();
        eventually(|| stdout.bytes().len() == 2).await;
        harness.cluster.set_pod_alive(false);
        broken.notify_one();
        eventually(|| stdout.bytes().len() == 4).await;
        interrupt.cancel();
        let (result, context) = run.await.expect("join");

        result.expect("interrupt is a clean exit");
        assert!(context.transitions().contains(&ActivationState::Reconnecting));
        assert_eq!(harness.cluster.destroyed_pods(), 1);
        assert_eq!(harness.cluster.pods_started(), 2);
    }

    #[tokio::test]
    async fn reconnect_notice_prints_once_per_disconnect() {
        let harness = Harness::new(
            MockCluster::with_workload("default", "api"),
            vec![ScriptedExit::Hang, ScriptedExit::Hang],
        );
        harness.executor.set_stdout(b"$ ".to_vec());
        let interrupt = CancellationToken::new();
        let mut context = harness.context(interrupt.clone());
        let run = tokio::spawn(async move {
            let result = context.run().await;
            (result, context)
        });

        let stdout = harness.stdio.output.clone();
        eventually(|| stdout.bytes().len() == 2).await;
        harness.cluster.fail_next_lookups(3);
        harness.daemon.fail_next_remote_pings(3);
        eventually(|| stdout.bytes().len() == 4).await;
        interrupt.cancel();
        let (result, context) = run.await.expect("join");

        result.expect("interrupt is a clean exit");
        assert_eq!(
            context
                .transitions()
                .iter()
                .filter(|state| **state == ActivationState::Reconnecting)
                .count(),
            4
        );
        assert_eq!(
            harness.output.contents().matches("Trying to reconnect").count(),
            1
        );
    }

    #[tokio::test]
    async fn low_watch_limit_warns_once_per_namespace() {
        let harness = Harness::new(
            MockCluster::with_workload("default", "api"),
            vec![ScriptedExit::Code(0), ScriptedExit::Code(0)],
        );
        harness.executor.set_cleanup_stdout(b"8192\n".to_vec());
        harness
            .context(CancellationToken::new())
            .run()
            .await
            .expect("first run");
        harness
            .context(CancellationToken::new())
            .run()
            .await
            .expect("second run");
        assert_eq!(
            harness.output.contents().matches("max_user_watches").count(),
            1
        );
    }
}
