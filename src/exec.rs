use std::io::{self, Read};
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};
use std::task::{Context, Poll};
use std::thread;

use anyhow::Result;
use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::UpError;
use crate::model::DevPod;

/// Kernel default.
const LOW_WATCHES_LIMIT: u64 = 8192;

const CLEANUP_COMMAND: &str = "cat /proc/sys/fs/inotify/max_user_watches; (cp /var/kup/bin/* /usr/local/bin; ps -ef | grep -v -E '/var/kup/bin/|/usr/local/bin/|PPID|ps -ef|grep' | awk '{print $2}' | xargs -r kill -9) >/dev/null 2>&1";

pub type ExecReader = Box<dyn AsyncRead + Send + Unpin>;
pub type ExecWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Local ends of a remote process's standard streams.
pub struct ExecIo {
    pub stdin: Option<ExecReader>,
    pub stdout: ExecWriter,
    pub stderr: ExecWriter,
}

impl ExecIo {
    /// Streams that swallow output; used for the cleanup command.
    pub fn captured(stdout: ExecWriter) -> Self {
        Self {
            stdin: None,
            stdout,
            stderr: Box::new(tokio::io::sink()),
        }
    }
}

/// Hands out a fresh set of streams for every activation attempt.
pub trait StdioProvider: Send + Sync {
    fn open(&self) -> ExecIo;
}

const STDIN_CHUNK_SIZE: usize = 4096;
const STDIN_QUEUED_CHUNKS: usize = 64;

/// The process's own streams. Stdin is read by a single thread for the whole
/// run, started on the first `open` so confirmation prompts still own the
/// terminal before that.
#[derive(Default)]
pub struct ProcessStdio {
    stdin: OnceLock<StdinChannel>,
}

impl ProcessStdio {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StdioProvider for ProcessStdio {
    fn open(&self) -> ExecIo {
        let stdin = self.stdin.get_or_init(StdinChannel::spawn);
        ExecIo {
            stdin: Some(Box::new(stdin.reader())),
            stdout: Box::new(tokio::io::stdout()),
            stderr: Box::new(tokio::io::stderr()),
        }
    }
}

struct StdinQueue {
    chunks: mpsc::Receiver<Vec<u8>>,
    pending: Vec<u8>,
}

/// Chunks read from stdin, shared by every reader handed out. Bytes a dropped
/// reader did not consume stay queued for the next one.
struct StdinChannel {
    queue: Arc<Mutex<StdinQueue>>,
}

impl StdinChannel {
    fn new(chunks: mpsc::Receiver<Vec<u8>>) -> Self {
        Self {
            queue: Arc::new(Mutex::new(StdinQueue {
                chunks,
                pending: Vec::new(),
            })),
        }
    }

    fn spawn() -> Self {
        let (tx, rx) = mpsc::channel(STDIN_QUEUED_CHUNKS);
        thread::spawn(move || forward_stdin(tx));
        Self::new(rx)
    }

    fn reader(&self) -> ChannelStdin {
        ChannelStdin {
            queue: self.queue.clone(),
        }
    }
}

fn forward_stdin(tx: mpsc::Sender<Vec<u8>>) {
    let mut stdin = io::stdin();
    let mut buf = [0u8; STDIN_CHUNK_SIZE];
    loop {
        match stdin.read(&mut buf) {
            Ok(0) => break,
            Ok(read) => {
                if tx.blocking_send(buf[..read].to_vec()).is_err() {
                    break;
                }
            }
            Err(error) if error.kind() == io::ErrorKind::Interrupted => continue,
            Err(error) => {
                debug!("stopped reading stdin: {error}");
                break;
            }
        }
    }
}

struct ChannelStdin {
    queue: Arc<Mutex<StdinQueue>>,
}

impl ChannelStdin {
    fn lock(&self) -> MutexGuard<'_, StdinQueue> {
        match self.queue.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl AsyncRead for ChannelStdin {
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        let mut queue = self.lock();
        if queue.pending.is_empty() {
            match queue.chunks.poll_recv(cx) {
                Poll::Ready(Some(chunk)) => queue.pending = chunk,
                Poll::Ready(None) => return Poll::Ready(Ok(())),
                Poll::Pending => return Poll::Pending,
            }
        }
        let count = buf.remaining().min(queue.pending.len());
        buf.put_slice(&queue.pending[..count]);
        queue.pending.drain(..count);
        Poll::Ready(Ok(()))
    }
}

#[async_trait]
pub trait RemoteExecutor: Send + Sync {
    /// Runs `argv` in `container` and returns its exit code. An `Err` means
    /// the stream to the process broke before an exit code arrived.
    async fn exec(
        &self,
        pod: &DevPod,
        container: &str,
        argv: &[String],
        tty: bool,
        io: ExecIo,
    ) -> Result<i32>;
}

pub fn watches_too_low(max_user_watches: u64) -> bool {
    max_user_watches <= LOW_WATCHES_LIMIT
}

pub struct RemoteExecSession {
    executor: Arc<dyn RemoteExecutor>,
    pod: DevPod,
    container: String,
}

impl RemoteExecSession {
    pub fn new(executor: Arc<dyn RemoteExecutor>, pod: DevPod, container: String) -> Self {
        Self {
            executor,
            pod,
            container,
        }
    }

    /// Never fails; problems end up in the log. Returns the node's
    /// `max_user_watches` when the command printed one.
    pub async fn run_cleanup(&self) -> Option<u64> {
        let argv = vec![
            "sh".to_string(),
            "-c".to_string(),
            CLEANUP_COMMAND.to_string(),
        ];
        let (writer, mut reader) = tokio::io::duplex(64 * 1024);
        let io = ExecIo::captured(Box::new(writer));
        let collect = tokio::spawn(async move {
            let mut output = Vec::new();
            let _ = tokio::io::AsyncReadExt::read_to_end(&mut reader, &mut output).await;
            output
        });

        match self
            .executor
            .exec(&self.pod, &self.container, &argv, false, io)
            .await
        {
            Ok(0) => {}
            Ok(code) => info!("cleanup command exited with code {code}"),
            Err(error) => info!("failed to run the cleanup command: {error:#}"),
        }

        let output = collect.await.ok()?;
        let output = String::from_utf8_lossy(&output);
        let watches = output.lines().next()?.trim();
        match watches.parse() {
            Ok(value) => {
                debug!("remote max_user_watches: {value}");
                Some(value)
            }
            Err(_) => {
                info!("unexpected max_user_watches value {watches:?}");
                None
            }
        }
    }

    pub async fn run_command(
        &self,
        argv: &[String],
        tty: bool,
        io: ExecIo,
        cancel: &CancellationToken,
    ) -> Result<(), UpError> {
        debug!(
            "running {:?} in {}/{} container {}",
            argv, self.pod.namespace, self.pod.name, self.container
        );
        let outcome = tokio::select! {
            _ = cancel.cancelled() => {
                debug!("remote command cancelled");
                return Ok(());
            }
            outcome = self.executor.exec(&self.pod, &self.container, argv, tty, io) => outcome,
        };

        match outcome {
            Ok(0) => Ok(()),
            Ok(code) => {
                info!("remote command exited with code {code}");
                Err(UpError::CommandFailed { code })
            }
            Err(error) => {
                info!("remote command stream broke: {error:#}");
                Err(UpError::ConnectionBroken(format!("{error:#}")))
            }
        }
    }
}
