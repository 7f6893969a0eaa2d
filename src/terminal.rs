use std::io::{self, IsTerminal};
use std::sync::Arc;

use crossterm::terminal::{disable_raw_mode, enable_raw_mode, is_raw_mode_enabled};
use tracing::{debug, info};

pub trait TerminalControl: Send + Sync {
    fn is_terminal(&self) -> bool;
    fn raw_mode_enabled(&self) -> io::Result<bool>;
    fn enable_raw(&self) -> io::Result<()>;
    /// Puts the terminal back into the mode captured by `raw_mode_enabled`.
    fn restore(&self, raw: bool) -> io::Result<()>;
}

pub struct CrosstermTerminal;

impl TerminalControl for CrosstermTerminal {
    fn is_terminal(&self) -> bool {
        io::stdin().is_terminal()
    }

    fn raw_mode_enabled(&self) -> io::Result<bool> {
        is_raw_mode_enabled()
    }

    fn enable_raw(&self) -> io::Result<()> {
        enable_raw_mode()
    }

    fn restore(&self, raw: bool) -> io::Result<()> {
        if raw {
            enable_raw_mode()
        } else {
            disable_raw_mode()
        }
    }
}

/// Captures the terminal mode on construction and puts it back on `restore`
/// or drop. Only the activation loop holds one; nothing else touches the tty.
pub struct ScopedTerminalMode {
    control: Arc<dyn TerminalControl>,
    saved_raw: Option<bool>,
    dirty: bool,
}

impl ScopedTerminalMode {
    pub fn acquire(control: Arc<dyn TerminalControl>) -> Self {
        let saved_raw = if control.is_terminal() {
            match control.raw_mode_enabled() {
                Ok(raw) => Some(raw),
                Err(error) => {
                    info!("failed to save the state of the terminal: {error}");
                    None
                }
            }
        } else {
            None
        };
        Self {
            control,
            saved_raw,
            dirty: false,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.saved_raw.is_some()
    }

    pub fn enter_raw(&mut self) -> io::Result<()> {
        if self.saved_raw.is_none() {
            return Ok(());
        }
        self.dirty = true;
        self.control.enable_raw()
    }

    /// No-op unless the mode was changed since the last restore.
    pub fn restore(&mut self) {
        let Some(raw) = self.saved_raw else {
            return;
        };
        if !self.dirty {
            return;
        }
        self.dirty = false;
        match self.control.restore(raw) {
            Ok(()) => debug!("terminal restored"),
            Err(error) => info!("failed to restore terminal: {error}"),
        }
    }
}

impl Drop for ScopedTerminalMode {
    fn drop(&mut self) {
        self.restore();
    }
}
