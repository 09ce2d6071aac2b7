//! # Config: Persisted Client Settings
//!
//! Username, slot count and coordinator address survive restarts in
//! `~/.mersenne/config.toml`. The pool never reads this file; the CLI and
//! dashboard load it and hand plain values to [`crate::pool::WorkerPool`].

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const DEFAULT_SERVER: &str = "http://workserverm1.curecoin.net:5005";

/// Logical cores available to the process (at least 1).
pub fn available_cores() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

fn default_server() -> String {
    DEFAULT_SERVER.to_string()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientConfig {
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default = "available_cores")]
    pub slots: usize,
    #[serde(default = "default_server")]
    pub server_url: String,
    /// Lifetime total across runs, folded in when a pool stops.
    #[serde(default)]
    pub tasks_completed: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            username: None,
            slots: available_cores(),
            server_url: default_server(),
            tasks_completed: 0,
        }
    }
}

impl ClientConfig {
    /// Load from `path`; a missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self> {
        match std::fs::read_to_string(path) {
            Ok(content) => toml::from_str(&content)
                .with_context(|| format!("parsing config {}", path.display())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(ClientConfig::default()),
            Err(e) => Err(e).with_context(|| format!("reading config {}", path.display())),
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content).with_context(|| format!("writing config {}", path.display()))?;
        Ok(())
    }
}

/// `~/.mersenne/config.toml`.
pub fn default_path() -> Result<PathBuf> {
    let home = std::env::var("HOME")
        .or_else(|_| std::env::var("USERPROFILE"))
        .map_err(|_| anyhow::anyhow!("Cannot determine home directory"))?;
    Ok(PathBuf::from(home).join(".mersenne").join("config.toml"))
}

/// 3 to 20 characters, ASCII letters, digits and underscores only.
pub fn validate_username(name: &str) -> Result<()> {
    let len = name.chars().count();
    if !(3..=20).contains(&len) {
        anyhow::bail!("username must be 3-20 characters, got {}", len);
    }
    if !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        anyhow::bail!("username may only contain letters, digits and underscores");
    }
    Ok(())
}
