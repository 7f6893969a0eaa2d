use std::collections::VecDeque;
use std::io;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{Context, Poll};

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::{Notify, mpsc};

use crate::config::UpConfig;
use crate::error::UpError;
use crate::exec::{ExecIo, RemoteExecutor, StdioProvider};
use crate::forward::{TunnelDialer, TunnelStream};
use crate::k8s::ClusterApi;
use crate::model::{Completion, DevPod, FolderStatus, Side, SyncMode, Workload, WorkloadRef};
use crate::output::Prompt;
use crate::sync::{SyncDaemon, SyncDaemonFactory, SyncInfo};
use crate::terminal::TerminalControl;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

pub struct FakeTerminal {
    tty: bool,
    raw: AtomicBool,
    raw_entries: AtomicUsize,
    restores: AtomicUsize,
}

impl FakeTerminal {
    pub fn new(tty: bool) -> Self {
        Self {
            tty,
            raw: AtomicBool::new(false),
            raw_entries: AtomicUsize::new(0),
            restores: AtomicUsize::new(0),
        }
    }

    pub fn raw_entries(&self) -> usize {
        self.raw_entries.load(Ordering::SeqCst)
    }

    pub fn restores(&self) -> usize {
        self.restores.load(Ordering::SeqCst)
    }
}

impl TerminalControl for FakeTerminal {
    fn is_terminal(&self) -> bool {
        self.tty
    }

    fn raw_mode_enabled(&self) -> io::Result<bool> {
        Ok(self.raw.load(Ordering::SeqCst))
    }

    fn enable_raw(&self) -> io::Result<()> {
        self.raw.store(true, Ordering::SeqCst);
        self.raw_entries.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn restore(&self, raw: bool) -> io::Result<()> {
        self.raw.store(raw, Ordering::SeqCst);
        self.restores.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// In-memory writer for capturing printer output.
#[derive(Clone, Default)]
pub struct SharedBuffer(Arc<Mutex<Vec<u8>>>);

impl SharedBuffer {
    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&lock(&self.0)).into_owned()
    }
}

impl io::Write for SharedBuffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        lock(&self.0).extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Dials an in-memory stream that echoes every byte back.
#[derive(Default)]
pub struct EchoDialer {
    failing_port: Option<u16>,
}

impl EchoDialer {
    pub fn failing_on(remote_port: u16) -> Self {
        Self {
            failing_port: Some(remote_port),
        }
    }
}

#[async_trait]
impl TunnelDialer for EchoDialer {
    async fn dial(&self, _namespace: &str, pod: &str, remote_port: u16) -> Result<TunnelStream> {
        if self.failing_port == Some(remote_port) {
            return Err(anyhow!("pod {pod} refused port {remote_port}"));
        }
        let (client, server) = tokio::io::duplex(64 * 1024);
        tokio::spawn(async move {
            let (mut reader, mut writer) = tokio::io::split(server);
            let _ = tokio::io::copy(&mut reader, &mut writer).await;
        });
        Ok(Box::new(client))
    }
}

/// Shared sink for remote command output.
#[derive(Clone, Default)]
pub struct CapturedOutput(Arc<Mutex<Vec<u8>>>);

impl CapturedOutput {
    pub fn bytes(&self) -> Vec<u8> {
        lock(&self.0).clone()
    }
}

impl AsyncWrite for CapturedOutput {
    fn poll_write(self: Pin<&mut Self>, _cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        lock(&self.0).extend_from_slice(buf);
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

#[derive(Clone, Default)]
pub struct CapturedStdio {
    pub output: CapturedOutput,
}

impl StdioProvider for CapturedStdio {
    fn open(&self) -> ExecIo {
        ExecIo {
            stdin: None,
            stdout: Box::new(self.output.clone()),
            stderr: Box::new(tokio::io::sink()),
        }
    }
}

#[derive(Debug, Clone)]
pub enum ScriptedExit {
    Code(i32),
    Broken,
    /// Breaks once the notify fires.
    BrokenOn(Arc<Notify>),
    Hang,
}

/// Replays scripted exits for user commands. The cleanup command has its own
/// outcome so scripts only describe what the user runs.
pub struct MockExecutor {
    scripts: Mutex<VecDeque<ScriptedExit>>,
    cleanup_exit: Mutex<ScriptedExit>,
    cleanup_stdout: Mutex<Vec<u8>>,
    stdout: Mutex<Vec<u8>>,
    commands: Mutex<Vec<Vec<String>>>,
}

impl MockExecutor {
    pub fn new(scripts: Vec<ScriptedExit>) -> Self {
        Self {
            scripts: Mutex::new(scripts.into()),
            cleanup_exit: Mutex::new(ScriptedExit::Code(0)),
            cleanup_stdout: Mutex::new(b"524288\n".to_vec()),
            stdout: Mutex::new(Vec::new()),
            commands: Mutex::new(Vec::new()),
        }
    }

    pub fn set_stdout(&self, bytes: Vec<u8>) {
        *lock(&self.stdout) = bytes;
    }

    pub fn set_cleanup_exit(&self, exit: ScriptedExit) {
        *lock(&self.cleanup_exit) = exit;
    }

    pub fn set_cleanup_stdout(&self, bytes: Vec<u8>) {
        *lock(&self.cleanup_stdout) = bytes;
    }

    pub fn commands(&self) -> Vec<Vec<String>> {
        lock(&self.commands).clone()
    }
}

fn is_cleanup(argv: &[String]) -> bool {
    argv.len() == 3 && argv[0] == "sh" && argv[1] == "-c" && argv[2].contains("max_user_watches")
}

#[async_trait]
impl RemoteExecutor for MockExecutor {
    async fn exec(
        &self,
        _pod: &DevPod,
        _container: &str,
        argv: &[String],
        _tty: bool,
        mut io: ExecIo,
    ) -> Result<i32> {
        lock(&self.commands).push(argv.to_vec());
        let cleanup = is_cleanup(argv);
        let script = if cleanup {
            lock(&self.cleanup_exit).clone()
        } else {
            lock(&self.scripts)
                .pop_front()
                .unwrap_or(ScriptedExit::Code(0))
        };
        let bytes = if cleanup {
            lock(&self.cleanup_stdout).clone()
        } else {
            lock(&self.stdout).clone()
        };
        io.stdout.write_all(&bytes).await?;
        io.stdout.flush().await?;
        drop(io);
        match script {
            ScriptedExit::Code(code) => Ok(code),
            ScriptedExit::Broken => Err(anyhow!("stream reset by peer")),
            ScriptedExit::BrokenOn(notify) => {
                notify.notified().await;
                Err(anyhow!("stream reset by peer"))
            }
            ScriptedExit::Hang => {
                std::future::pending::<()>().await;
                Ok(0)
            }
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub enum CompletionFailure {
    Lost,
    Busy,
}

pub struct MockSyncDaemon {
    remote_alive: AtomicBool,
    local_completion_failure: Mutex<Option<CompletionFailure>>,
    hang_on_stop: AtomicBool,
    remote_ping_failures: AtomicU32,
    completion: Mutex<Completion>,
    folder_errors: Mutex<Vec<String>>,
    scanning_polls: AtomicU32,
    status_polls: AtomicU32,
    overrides: AtomicUsize,
    restarts: AtomicUsize,
    stops: AtomicUsize,
    modes: Mutex<Vec<SyncMode>>,
}

impl MockSyncDaemon {
    pub fn healthy() -> Self {
        Self {
            remote_alive: AtomicBool::new(true),
            local_completion_failure: Mutex::new(None),
            hang_on_stop: AtomicBool::new(false),
            remote_ping_failures: AtomicU32::new(0),
            completion: Mutex::new(Completion {
                global_bytes: 100,
                need_bytes: 0,
                need_deletes: 0,
            }),
            folder_errors: Mutex::new(Vec::new()),
            scanning_polls: AtomicU32::new(0),
            status_polls: AtomicU32::new(0),
            overrides: AtomicUsize::new(0),
            restarts: AtomicUsize::new(0),
            stops: AtomicUsize::new(0),
            modes: Mutex::new(Vec::new()),
        }
    }

    pub fn set_remote_alive(&self, alive: bool) {
        self.remote_alive.store(alive, Ordering::SeqCst);
    }

    /// The next `count` remote pings fail, later ones succeed again.
    pub fn fail_next_remote_pings(&self, count: u32) {
        self.remote_ping_failures.store(count, Ordering::SeqCst);
    }

    pub fn fail_local_completion(&self, failure: CompletionFailure) {
        *lock(&self.local_completion_failure) = Some(failure);
    }

    pub fn hang_on_stop(&self) {
        self.hang_on_stop.store(true, Ordering::SeqCst);
    }

    pub fn set_completion(&self, completion: Completion) {
        *lock(&self.completion) = completion;
    }

    pub fn push_folder_error(&self, error: &str) {
        lock(&self.folder_errors).push(error.to_string());
    }

    pub fn set_scanning_polls(&self, polls: u32) {
        self.scanning_polls.store(polls, Ordering::SeqCst);
    }

    pub fn status_polls(&self) -> u32 {
        self.status_polls.load(Ordering::SeqCst)
    }

    pub fn overrides(&self) -> usize {
        self.overrides.load(Ordering::SeqCst)
    }

    pub fn restarts(&self) -> usize {
        self.restarts.load(Ordering::SeqCst)
    }

    pub fn stops(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }

    pub fn modes(&self) -> Vec<SyncMode> {
        lock(&self.modes).clone()
    }
}

#[async_trait]
impl SyncDaemon for MockSyncDaemon {
    async fn run(&self) -> Result<()> {
        Ok(())
    }

    async fn ping(&self, side: Side) -> Result<()> {
        if side.is_local() {
            return Ok(());
        }
        let pending_failures = self.remote_ping_failures.load(Ordering::SeqCst);
        if pending_failures > 0 {
            self.remote_ping_failures
                .store(pending_failures - 1, Ordering::SeqCst);
            return Err(anyhow!("remote ping timed out"));
        }
        if !self.remote_alive.load(Ordering::SeqCst) {
            return Err(anyhow!("remote ping refused"));
        }
        Ok(())
    }

    async fn pair(&self) -> Result<()> {
        Ok(())
    }

    async fn folder_statuses(&self, _side: Side) -> Result<Vec<FolderStatus>> {
        self.status_polls.fetch_add(1, Ordering::SeqCst);
        let remaining = self.scanning_polls.load(Ordering::SeqCst);
        let state = if remaining > 0 {
            self.scanning_polls.store(remaining - 1, Ordering::SeqCst);
            "scanning"
        } else {
            "idle"
        };
        Ok(vec![FolderStatus {
            state: state.to_string(),
            pull_errors: 0,
        }])
    }

    async fn completion(&self, side: Side) -> Result<Completion> {
        let failure = if side.is_local() {
            *lock(&self.local_completion_failure)
        } else {
            None
        };
        match failure {
            Some(CompletionFailure::Lost) => Err(UpError::LostSync.into()),
            Some(CompletionFailure::Busy) => Err(anyhow!("operation timed out")),
            None => Ok(*lock(&self.completion)),
        }
    }

    async fn folder_errors(&self, _side: Side) -> Result<Vec<String>> {
        Ok(lock(&self.folder_errors).clone())
    }

    async fn override_changes(&self) -> Result<()> {
        self.overrides.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn set_mode(&self, mode: SyncMode) -> Result<()> {
        lock(&self.modes).push(mode);
        Ok(())
    }

    async fn restart(&self, _side: Side) -> Result<()> {
        self.restarts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn send_ignore_file(&self) -> Result<()> {
        Ok(())
    }

    async fn reset_database(&self, _side: Side) -> Result<()> {
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        self.stops.fetch_add(1, Ordering::SeqCst);
        if self.hang_on_stop.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        Ok(())
    }

    fn log_path(&self) -> PathBuf {
        PathBuf::from("/tmp/kup-test/syncthing.log")
    }
}

/// Hands every attempt the same daemon so tests can steer it across retries.
pub struct MockSyncFactory {
    daemon: Arc<MockSyncDaemon>,
}

impl MockSyncFactory {
    pub fn new(daemon: Arc<MockSyncDaemon>) -> Self {
        Self { daemon }
    }
}

impl SyncDaemonFactory for MockSyncFactory {
    fn create(&self, _config: &UpConfig, _info: &SyncInfo) -> Result<Arc<dyn SyncDaemon>> {
        Ok(self.daemon.clone())
    }
}

pub struct MockCluster {
    workload: Mutex<Option<Workload>>,
    pod_alive: AtomicBool,
    pods_started: AtomicUsize,
    sandboxes: AtomicUsize,
    destroyed: AtomicUsize,
    pod_failure: Mutex<Option<UpError>>,
    lookup_failures: AtomicU32,
}

impl MockCluster {
    pub fn with_workload(namespace: &str, name: &str) -> Self {
        let cluster = Self::empty();
        *lock(&cluster.workload) = Some(Workload {
            namespace: namespace.to_string(),
            name: name.to_string(),
            containers: vec![name.to_string()],
            ..Default::default()
        });
        cluster
    }

    pub fn empty() -> Self {
        Self {
            workload: Mutex::new(None),
            pod_alive: AtomicBool::new(false),
            pods_started: AtomicUsize::new(0),
            sandboxes: AtomicUsize::new(0),
            destroyed: AtomicUsize::new(0),
            pod_failure: Mutex::new(None),
            lookup_failures: AtomicU32::new(0),
        }
    }

    pub fn remove_workload(&self) {
        *lock(&self.workload) = None;
    }

    pub fn set_pod_alive(&self, alive: bool) {
        self.pod_alive.store(alive, Ordering::SeqCst);
    }

    /// The next `count` workload lookups fail as if the API server were unreachable.
    pub fn fail_next_lookups(&self, count: u32) {
        self.lookup_failures.store(count, Ordering::SeqCst);
    }

    pub fn fail_pod_wait(&self, error: UpError) {
        *lock(&self.pod_failure) = Some(error);
    }

    pub fn sandboxes(&self) -> usize {
        self.sandboxes.load(Ordering::SeqCst)
    }

    pub fn destroyed_pods(&self) -> usize {
        self.destroyed.load(Ordering::SeqCst)
    }

    pub fn pods_started(&self) -> usize {
        self.pods_started.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ClusterApi for MockCluster {
    async fn get_workload(&self, _workload: &WorkloadRef) -> Result<Option<Workload>> {
        let pending_failures = self.lookup_failures.load(Ordering::SeqCst);
        if pending_failures > 0 {
            self.lookup_failures
                .store(pending_failures - 1, Ordering::SeqCst);
            return Err(UpError::Transient("connection refused".to_string()).into());
        }
        Ok(lock(&self.workload).clone())
    }

    async fn create_sandbox(&self, config: &UpConfig) -> Result<Workload> {
        self.sandboxes.fetch_add(1, Ordering::SeqCst);
        let workload = Workload {
            namespace: config.workload.namespace.clone(),
            name: config.workload.name.clone(),
            containers: vec![config.workload.name.clone()],
            auto_created: true,
            ..Default::default()
        };
        *lock(&self.workload) = Some(workload.clone());
        Ok(workload)
    }

    async fn check_namespace(&self, _namespace: &str) -> Result<()> {
        Ok(())
    }

    async fn ensure_volume(&self, _config: &UpConfig) -> Result<()> {
        Ok(())
    }

    async fn ensure_sync_secret(&self, _config: &UpConfig, _info: &SyncInfo) -> Result<()> {
        Ok(())
    }

    async fn deploy_dev_mode(&self, _config: &UpConfig, _workload: &Workload, _container: &str) -> Result<()> {
        if let Some(workload) = lock(&self.workload).as_mut() {
            workload.dev_mode_on = true;
        }
        Ok(())
    }

    async fn wait_for_dev_pod(
        &self,
        config: &UpConfig,
        progress: mpsc::UnboundedSender<String>,
    ) -> Result<DevPod> {
        if let Some(error) = lock(&self.pod_failure).take() {
            return Err(error.into());
        }
        let _ = progress.send("Pulling image \"node:20\"".to_string());
        let index = self.pods_started.fetch_add(1, Ordering::SeqCst);
        self.pod_alive.store(true, Ordering::SeqCst);
        Ok(DevPod {
            name: format!("{}-dev-{index}", config.workload.name),
            namespace: config.workload.namespace.clone(),
            node_name: Some("node-1".to_string()),
        })
    }

    async fn pod_exists(&self, _pod: &DevPod) -> Result<bool> {
        Ok(self.pod_alive.load(Ordering::SeqCst))
    }

    async fn destroy_pod(&self, _pod: &DevPod) -> Result<()> {
        self.destroyed.fetch_add(1, Ordering::SeqCst);
        self.pod_alive.store(false, Ordering::SeqCst);
        Ok(())
    }
}

pub struct MockPrompt {
    answer: bool,
    asked: AtomicUsize,
}

impl MockPrompt {
    pub fn answering(answer: bool) -> Self {
        Self {
            answer,
            asked: AtomicUsize::new(0),
        }
    }

    pub fn asked(&self) -> usize {
        self.asked.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Prompt for MockPrompt {
    async fn confirm(&self, _question: &str, _default: bool) -> Result<bool> {
        self.asked.fetch_add(1, Ordering::SeqCst);
        Ok(self.answer)
    }
}
