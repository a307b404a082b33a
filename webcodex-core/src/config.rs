use serde::Deserialize;
use std::fs;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("HOME environment variable not set")]
    MissingHome,

    #[error("Failed to read config file {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid value for {name}: {value:?}")]
    InvalidValue { name: &'static str, value: String },
}

#[derive(Debug, Deserialize, Clone)]
#[serde(deny_unknown_fields, default)]
pub struct Config {
    /// Interface the HTTP server binds to.
    pub host: String,

    pub port: u16,

    pub debug: bool,

    /// Base directory every terminal working directory must resolve into.
    pub data_dir: PathBuf,

    /// Shell binary used to launch the terminal command.
    pub shell: String,

    /// Command run through `<shell> -lc` for each terminal session.
    pub codex_cmd: String,

    pub heartbeat_interval_ms: u64,

    /// Credential injected into every terminal child's environment.
    pub openai_api_key: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: default_port(),
            debug: false,
            data_dir: PathBuf::from("/data/repos"),
            shell: "/bin/sh".to_string(),
            codex_cmd: "codex".to_string(),
            heartbeat_interval_ms: 30_000,
            openai_api_key: None,
        }
    }
}

fn default_port() -> u16 {
    8080
}

impl Config {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    /// Overlay values taken from environment variables.
    ///
    /// `lookup` returns the value of a variable, if set. Empty values are
    /// treated as unset.
    pub fn apply_env<F>(mut self, lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        if let Some(host) = get("HOST") {
            self.host = host;
        }
        if let Some(port) = get("PORT") {
            self.port = port.trim().parse().map_err(|_| ConfigError::InvalidValue {
                name: "PORT",
                value: port,
            })?;
        }
        if let Some(debug) = get("DEBUG") {
            self.debug = is_truthy(&debug);
        }
        if let Some(dir) = get("DATA_DIR") {
            self.data_dir = PathBuf::from(dir);
        }
        if let Some(shell) = get("SHELL") {
            self.shell = shell;
        }
        if let Some(cmd) = get("CODEX_CMD") {
            self.codex_cmd = cmd;
        }
        if let Some(interval) = get("WS_HEARTBEAT_INTERVAL_MS") {
            self.heartbeat_interval_ms = interval.trim().parse().map_err(|_| {
                ConfigError::InvalidValue {
                    name: "WS_HEARTBEAT_INTERVAL_MS",
                    value: interval.clone(),
                }
            })?;
        }
        if let Some(key) = get("OPENAI_API_KEY") {
            self.openai_api_key = Some(key);
        }

        self.validate()?;
        Ok(self)
    }

    /// Copy suitable for logging, with the credential masked.
    pub fn redacted(&self) -> Config {
        Config {
            openai_api_key: self.openai_api_key.as_ref().map(|_| "***".to_string()),
            ..self.clone()
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.heartbeat_interval_ms == 0 {
            return Err(ConfigError::InvalidValue {
                name: "heartbeat_interval_ms",
                value: "0".to_string(),
            });
        }
        Ok(())
    }
}

fn is_truthy(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on" | "debug" | "verbose"
    )
}

pub fn get_config_path() -> Result<PathBuf, ConfigError> {
    let home = std::env::var("HOME").map_err(|_| ConfigError::MissingHome)?;
    Ok(PathBuf::from(home)
        .join(".config")
        .join("webcodex")
        .join("config.toml"))
}

/// Parse the TOML config file contents. Missing keys keep their defaults.
pub fn parse_config(content: &str) -> Result<Config, ConfigError> {
    let config: Config = toml::from_str(content)?;
    config.validate()?;
    Ok(config)
}

/// Load the config file (if any) and overlay the process environment.
/// Called before the tracing subscriber exists, so it must not log.
pub fn load_config() -> Result<Config, ConfigError> {
    let config_path = get_config_path()?;

    let config = if config_path.exists() {
        let content = fs::read_to_string(&config_path).map_err(|source| ConfigError::Io {
            path: config_path.clone(),
            source,
        })?;
        parse_config(&content)?
    } else {
        Config::default()
    };

    config.apply_env(|name| std::env::var(name).ok())
}
