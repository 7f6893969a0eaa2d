use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::model::UpState;

const STATE_FILE_NAME: &str = "kup.state";
const PID_FILE_NAME: &str = "kup.pid";

/// Best-effort writer for the coarse lifecycle phase read by status tooling.
#[derive(Debug, Clone)]
pub struct StateFile {
    path: PathBuf,
}

impl StateFile {
    pub fn new(workload_home: &Path) -> Self {
        Self {
            path: workload_home.join(STATE_FILE_NAME),
        }
    }

    /// Failures are logged, never returned.
    pub fn update(&self, state: UpState) {
        match self.write(state) {
            Ok(()) => debug!("state file {} is now {state}", self.path.display()),
            Err(error) => info!(
                "failed to update state file {} to {state}: {error}",
                self.path.display()
            ),
        }
    }

    fn write(&self, state: UpState) -> io::Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&self.path, state.as_str())
    }

    #[cfg(test)]
    pub fn read(&self) -> io::Result<Option<String>> {
        match fs::read_to_string(&self.path) {
            Ok(contents) => Ok(Some(contents.trim().to_string())),
            Err(error) if error.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(error) => Err(error),
        }
    }
}

/// One-time warnings already shown, remembered as marker files.
#[derive(Debug, Clone)]
pub struct WarningState {
    dir: PathBuf,
}

impl WarningState {
    pub fn new(dir: &Path) -> Self {
        Self {
            dir: dir.to_path_buf(),
        }
    }

    pub fn is_set(&self, name: &str) -> bool {
        self.dir.join(name).exists()
    }

    pub fn set(&self, name: &str) {
        let path = self.dir.join(name);
        let written = fs::create_dir_all(&self.dir).and_then(|()| fs::write(&path, "true"));
        if let Err(error) = written {
            info!("failed to set warning state {}: {error}", path.display());
        }
    }
}

/// Removes the pid file when dropped.
pub struct PidFileGuard {
    path: PathBuf,
}

impl PidFileGuard {
    pub fn create(workload_home: &Path) -> io::Result<Self> {
        let path = workload_home.join(PID_FILE_NAME);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut file = fs::File::create(&path)?;
        writeln!(file, "{}", std::process::id())?;
        Ok(Self { path })
    }

    #[cfg(test)]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for PidFileGuard {
    fn drop(&mut self) {
        match fs::remove_file(&self.path) {
            Ok(()) => {}
            Err(error) if error.kind() == io::ErrorKind::NotFound => {}
            Err(error) => info!("failed to remove pid file {}: {error}", self.path.display()),
        }
    }
}
