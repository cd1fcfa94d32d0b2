use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Result, StepwiseError};

/// Top-level Stepwise configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub log: LogConfig,
}

/// Drive-loop tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Hard cap on immediate auto-advances within a single drive.
    /// Unset means unbounded: a cycle of non-waiting steps is then a
    /// template error the engine does not detect.
    #[serde(default)]
    pub max_chain_length: Option<usize>,
    /// Number of immediate auto-advances after which a warning is logged.
    #[serde(default = "default_chain_warn_threshold")]
    pub chain_warn_threshold: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_chain_length: None,
            chain_warn_threshold: default_chain_warn_threshold(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// SQLite database holding workflow instances and history.
    #[serde(default = "default_database")]
    pub database: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            database: default_database(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LogConfig {
    /// `EnvFilter` directive. `RUST_LOG` takes precedence when set.
    #[serde(default)]
    pub filter: Option<String>,
}

fn default_chain_warn_threshold() -> usize { 64 }
fn default_database() -> String { "~/.stepwise/workflows.db".to_string() }

impl AppConfig {
    /// Load config from a TOML file, with env var expansion.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|_| StepwiseError::ConfigNotFound(path.display().to_string()))?;

        // Expand ${ENV_VAR} references
        let expanded = expand_env_vars(&content);

        toml::from_str(&expanded).map_err(|e| StepwiseError::Config(e.to_string()))
    }

    /// Load the config if the file exists, defaults otherwise.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Database path with a leading `~` resolved against `$HOME`.
    ///
    /// Left untouched when `HOME` is unset.
    pub fn database_path(&self) -> PathBuf {
        let db = self.store.database.as_str();
        let home = std::env::var_os("HOME").map(PathBuf::from);
        match (db.strip_prefix('~'), home) {
            (Some(""), Some(home)) => home,
            (Some(rest), Some(home)) if rest.starts_with('/') => {
                home.join(rest.trim_start_matches('/'))
            }
            _ => PathBuf::from(db),
        }
    }
}

/// Substitute `${NAME}` with the value of environment variable `NAME`.
///
/// Unset variables and an unterminated `${` are copied through verbatim.
fn expand_env_vars(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;
    while let Some(open) = rest.find("${") {
        out.push_str(&rest[..open]);
        let after = &rest[open + 2..];
        let Some(close) = after.find('}') else {
            out.push_str(&rest[open..]);
            return out;
        };
        let name = &after[..close];
        match std::env::var(name) {
            Ok(value) => out.push_str(&value),
            Err(_) => out.push_str(&rest[open..open + close + 3]),
        }
        rest = &after[close + 1..];
    }
    out.push_str(rest);
    out
}
