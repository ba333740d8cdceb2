//! Runtime settings shared by every command

use crate::compose::supervisor::RestartBackoff;
use std::path::PathBuf;
use std::time::Duration;

/// Engine binary used when none is configured
pub const DEFAULT_ENGINE: &str = "docker";

/// Grace period given to a container between the stop request and the kill
pub const DEFAULT_STOP_GRACE: Duration = Duration::from_secs(10);

/// Settings resolved from the command line and the environment
#[derive(Debug, Clone)]
pub struct Settings {
    /// Directory holding volumes and other orchestrator state
    pub state_dir: PathBuf,
    /// Engine binary
    pub engine: String,
    /// Grace period for services that do not set `stop_grace_period`
    pub stop_grace: Duration,
    /// Delay between restarts of crashed services
    pub backoff: RestartBackoff,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            state_dir: default_state_dir(),
            engine: DEFAULT_ENGINE.to_string(),
            stop_grace: DEFAULT_STOP_GRACE,
            backoff: RestartBackoff::default(),
        }
    }
}

/// `<data dir>/rune-compose`, falling back to `/var/lib/rune-compose`
pub fn default_state_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("/var/lib"))
        .join("rune-compose")
}

impl Settings {
    /// Set the state directory
    pub fn state_dir(mut self, dir: PathBuf) -> Self {
        self.state_dir = dir;
        self
    }

    /// Set the engine binary
    pub fn engine(mut self, engine: &str) -> Self {
        self.engine = engine.to_string();
        self
    }

    /// Set the default stop grace period
    pub fn stop_grace(mut self, grace: Duration) -> Self {
        self.stop_grace = grace;
        self
    }

    /// Where named volumes live
    pub fn volumes_dir(&self) -> PathBuf {
        self.state_dir.join("volumes")
    }
}
