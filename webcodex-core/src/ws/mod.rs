//! WebSocket endpoints.
//!
//! - `/ws/terminal`: one interactive PTY session per connection, raw bytes
//!   in both directions (see [`terminal`]).

pub mod terminal;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::config::Config;
use crate::paths::resolve_within_root;
use crate::process::{SpawnSpec, TerminalSize};
use crate::registry::SessionRegistry;

pub use terminal::{
    terminal_ws_handler, unit_testable_terminal_handler, SessionEnd, TerminalOutcome,
};

/// How terminal children are launched.
#[derive(Debug, Clone)]
pub struct TerminalSettings {
    pub data_root: PathBuf,
    pub shell: String,
    pub command: String,
    /// Extra environment for every child (credentials).
    pub env: Vec<(String, String)>,
    pub size: TerminalSize,
}

impl TerminalSettings {
    pub fn from_config(config: &Config) -> Self {
        let mut env = Vec::new();
        if let Some(key) = &config.openai_api_key {
            env.push(("OPENAI_API_KEY".to_string(), key.clone()));
        }

        // Canonical so that the fallback and resolved paths compare equal
        let data_root = config
            .data_dir
            .canonicalize()
            .unwrap_or_else(|_| config.data_dir.clone());

        Self {
            data_root,
            shell: config.shell.clone(),
            command: config.codex_cmd.clone(),
            env,
            size: TerminalSize::default(),
        }
    }

    /// Resolve a requested working directory, falling back to the data root
    /// when it is missing, invalid, or outside the root.
    pub fn resolve_working_directory(&self, requested: Option<&str>) -> PathBuf {
        let Some(requested) = requested.filter(|r| !r.trim().is_empty()) else {
            return self.data_root.clone();
        };

        match resolve_within_root(&self.data_root, requested) {
            Ok(path) => path,
            Err(e) => {
                warn!(requested = %requested, "Rejected terminal working directory, using data root: {}", e);
                self.data_root.clone()
            }
        }
    }

    pub fn spawn_spec(&self, working_directory: &Path) -> SpawnSpec {
        let mut spec = SpawnSpec::new(working_directory, &self.shell, &self.command);
        spec.env = self.env.clone();
        spec.size = self.size;
        spec
    }
}

/// Shared state for the WebSocket endpoints.
#[derive(Clone)]
pub struct WsState {
    pub registry: SessionRegistry,
    pub terminal: Arc<TerminalSettings>,
}

impl WsState {
    pub fn new(terminal: TerminalSettings) -> Self {
        Self {
            registry: SessionRegistry::new(),
            terminal: Arc::new(terminal),
        }
    }

    /// Terminate every open session with logging.
    pub fn clear(&self) -> usize {
        let count = self.registry.terminate_all();
        debug!("Told {} terminal sessions to terminate", count);
        count
    }
}
