mod backoff;
mod cli;
mod config;
mod error;
mod exec;
mod forward;
mod k8s;
mod model;
mod output;
mod shutdown;
mod state;
mod sync;
mod terminal;
#[cfg(test)]
mod testing;
mod up;

use anyhow::{Context, Result};
use clap::Parser;
use cli::CliArgs;
use error::{UpError, as_up_error};
use exec::ProcessStdio;
use k8s::{KubeExecutor, KubeGateway, KubeTunnelDialer};
use output::{DialoguerPrompt, Printer};
use std::fs::{self, OpenOptions};
use std::path::Path;
use std::process::ExitCode;
use std::sync::{Arc, Mutex};
use sync::SyncthingFactory;
use terminal::CrosstermTerminal;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use up::{Collaborators, run_up};

const LOG_FILE_NAME: &str = "kup.log";

#[tokio::main]
async fn main() -> ExitCode {
    let args = CliArgs::parse();
    let printer = Printer::stderr();
    match run(args, printer.clone()).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            let hint = as_up_error(&error).and_then(UpError::hint);
            printer.error(format!("{error:#}"), hint.as_deref());
            ExitCode::FAILURE
        }
    }
}

async fn run(args: CliArgs, printer: Printer) -> Result<()> {
    let mut config = config::load(&args)?;
    init_tracing(&args.log_filter, &config.home)?;
    info!("starting development container for {}", config.workload);

    let gateway = KubeGateway::connect(config.context.clone()).await?;
    if config.context.is_none() {
        config.context = Some(gateway.context().to_string());
    }
    let client = gateway.client();
    let deps = Collaborators {
        cluster: Arc::new(gateway),
        dialer: Arc::new(KubeTunnelDialer::new(client.clone())),
        executor: Arc::new(KubeExecutor::new(client)),
        sync: Arc::new(SyncthingFactory),
        prompt: Arc::new(DialoguerPrompt),
        terminal: Arc::new(CrosstermTerminal),
        stdio: Arc::new(ProcessStdio::new()),
    };

    let interrupt = CancellationToken::new();
    let token = interrupt.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            debug!("received interrupt");
            token.cancel();
        }
    });

    run_up(config, deps, printer, interrupt).await
}

/// Logs go to a file under the kup home so they never mix with the remote
/// command's output.
fn init_tracing(level_filter: &str, home: &Path) -> Result<()> {
    let filter = EnvFilter::try_new(level_filter)
        .or_else(|_| EnvFilter::try_new("info"))
        .context("failed to initialize tracing filter")?;

    let writer = match open_log_file(home) {
        Ok(file) => BoxMakeWriter::new(Mutex::new(file)),
        Err(_) => BoxMakeWriter::new(std::io::sink),
    };

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_ansi(false)
        .compact()
        .with_writer(writer)
        .try_init();

    Ok(())
}

fn open_log_file(home: &Path) -> std::io::Result<fs::File> {
    fs::create_dir_all(home)?;
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(home.join(LOG_FILE_NAME))
}
