use anyhow::{Context, Result};
use async_trait::async_trait;
use crossterm::style::Stylize;
use dialoguer::Confirm;
use dialoguer::theme::ColorfulTheme;
use std::io::{self, Write};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::config::UpConfig;

const PROGRESS_BAR_WIDTH: usize = 40;

struct Output {
    writer: Box<dyn Write + Send>,
    /// A progress bar is drawn without its line break yet.
    bar_open: bool,
}

/// User-facing messages. Cloned freely; all clones share one writer so lines
/// from background tasks never interleave mid-line.
#[derive(Clone)]
pub struct Printer {
    out: Arc<Mutex<Output>>,
    color: bool,
}

impl Printer {
    pub fn stderr() -> Self {
        Self::new(Box::new(io::stderr()), true)
    }

    pub fn new(out: Box<dyn Write + Send>, color: bool) -> Self {
        Self {
            out: Arc::new(Mutex::new(Output {
                writer: out,
                bar_open: false,
            })),
            color,
        }
    }

    pub fn success(&self, message: impl AsRef<str>) {
        let prefix = if self.color {
            " ✓ ".green().bold().to_string()
        } else {
            " ✓ ".to_string()
        };
        self.line(format!("{prefix} {}", message.as_ref()));
    }

    pub fn warning(&self, message: impl AsRef<str>) {
        let text = if self.color {
            message.as_ref().yellow().to_string()
        } else {
            message.as_ref().to_string()
        };
        self.line(text);
    }

    pub fn info(&self, message: impl AsRef<str>) {
        self.line(message.as_ref().to_string());
    }

    pub fn error(&self, message: impl AsRef<str>, hint: Option<&str>) {
        let prefix = if self.color {
            " x ".red().bold().to_string()
        } else {
            " x ".to_string()
        };
        self.line(format!("{prefix} {}", message.as_ref()));
        if let Some(hint) = hint {
            self.line(format!("    {hint}"));
        }
    }

    /// Redraws the bar in place; the line is closed once it reaches 100%.
    pub fn progress(&self, label: &str, percent: f64) {
        let mut out = self.lock();
        let bar = render_progress_bar(label, percent);
        let done = percent >= 100.0;
        let _ = write!(out.writer, "\r{bar}");
        if done {
            let _ = write!(out.writer, "\r\n");
        }
        out.bar_open = !done;
        let _ = out.writer.flush();
    }

    pub fn display_context(&self, config: &UpConfig, pod: &str) {
        let key = |name: &str| {
            if self.color {
                name.blue().to_string()
            } else {
                name.to_string()
            }
        };
        if let Some(context) = &config.context {
            self.line(format!("    {}   {context}", key("Context:")));
        }
        self.line(format!(
            "    {} {}",
            key("Namespace:"),
            config.workload.namespace
        ));
        self.line(format!("    {}      {}", key("Name:"), config.workload.name));
        self.line(format!("    {}       {pod}", key("Pod:")));
        for (index, forward) in config.forwards.iter().enumerate() {
            let label = if index == 0 { key("Forward:") } else { " ".repeat(8) };
            self.line(format!("    {label}   {} -> {}", forward.local, forward.remote));
        }
        self.line(String::new());
    }

    fn line(&self, text: String) {
        let mut out = self.lock();
        if out.bar_open {
            let _ = write!(out.writer, "\r\n");
            out.bar_open = false;
        }
        let _ = write!(out.writer, "{text}\r\n");
        let _ = out.writer.flush();
    }

    fn lock(&self) -> MutexGuard<'_, Output> {
        match self.out.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

pub fn render_progress_bar(label: &str, percent: f64) -> String {
    let percent = percent.clamp(0.0, 100.0);
    let filled = ((percent / 100.0) * PROGRESS_BAR_WIDTH as f64).round() as usize;
    let bar = format!(
        "{}{}",
        "=".repeat(filled),
        " ".repeat(PROGRESS_BAR_WIDTH.saturating_sub(filled))
    );
    format!("{label} [{bar}] {percent:>3.0}%")
}

#[async_trait]
pub trait Prompt: Send + Sync {
    async fn confirm(&self, question: &str, default: bool) -> Result<bool>;
}

pub struct DialoguerPrompt;

#[async_trait]
impl Prompt for DialoguerPrompt {
    async fn confirm(&self, question: &str, default: bool) -> Result<bool> {
        let question = question.to_string();
        tokio::task::spawn_blocking(move || {
            Confirm::with_theme(&ColorfulTheme::default())
                .with_prompt(question)
                .default(default)
                .interact()
        })
        .await
        .context("confirmation prompt task failed")?
        .context("failed to read confirmation")
    }
}
