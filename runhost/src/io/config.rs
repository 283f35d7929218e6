//! Server configuration stored in `runhost.toml`.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

/// Server configuration (TOML).
///
/// Missing fields default to values suitable for local development.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ServerConfig {
    /// Address to bind the HTTP server to.
    pub bind: String,

    /// Port to listen on.
    pub port: u16,

    /// Path to `apispec.json`.
    pub spec_path: PathBuf,

    /// Directory served as static files for unmatched routes.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub static_dir: Option<PathBuf>,

    /// Include internal error details in 500 responses.
    pub development: bool,

    pub store: StoreConfig,

    pub invocation: InvocationConfig,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    Memory,
    File,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct StoreConfig {
    pub backend: StoreBackend,

    /// Root directory for the `file` backend.
    pub dir: PathBuf,

    /// Parameter/result values whose JSON encoding exceeds this many bytes are
    /// kept out-of-band.
    pub inline_limit_bytes: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct InvocationConfig {
    /// Kill invoked programs after this many seconds (0 = never).
    pub timeout_secs: u64,

    /// Keep at most this many bytes of stdout and of stderr.
    pub output_limit_bytes: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::Memory,
            dir: PathBuf::from(".runhost/instances"),
            inline_limit_bytes: 64 * 1024,
        }
    }
}

impl Default for InvocationConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 0,
            output_limit_bytes: 10_000_000,
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1".to_string(),
            port: 3000,
            spec_path: PathBuf::from("apispec.json"),
            static_dir: None,
            development: false,
            store: StoreConfig::default(),
            invocation: InvocationConfig::default(),
        }
    }
}

impl InvocationConfig {
    pub fn timeout(&self) -> Option<Duration> {
        (self.timeout_secs > 0).then(|| Duration::from_secs(self.timeout_secs))
    }
}

impl ServerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.bind.trim().is_empty() {
            return Err(anyhow!("bind must be non-empty"));
        }
        if self.spec_path.as_os_str().is_empty() {
            return Err(anyhow!("spec_path must be non-empty"));
        }
        if self.store.backend == StoreBackend::File && self.store.dir.as_os_str().is_empty() {
            return Err(anyhow!("store.dir must be set for the file backend"));
        }
        if self.store.inline_limit_bytes == 0 {
            return Err(anyhow!("store.inline_limit_bytes must be > 0"));
        }
        if self.invocation.output_limit_bytes == 0 {
            return Err(anyhow!("invocation.output_limit_bytes must be > 0"));
        }
        Ok(())
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `ServerConfig::default()`.
pub fn load_config(path: &Path) -> Result<ServerConfig> {
    if !path.exists() {
        let cfg = ServerConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: ServerConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &ServerConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    crate::io::fs_atomic::write_atomic(path, &buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_missing_returns_default() {
        let temp = tempfile::tempdir().expect("tempdir");
        let cfg = load_config(&temp.path().join("missing.toml")).expect("load");
        assert_eq!(cfg, ServerConfig::default());
        assert_eq!(cfg.invocation.timeout(), None);
    }

    #[test]
    fn write_then_load_round_trips() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("runhost.toml");
        let mut cfg = ServerConfig::default();
        cfg.store.backend = StoreBackend::File;
        cfg.invocation.timeout_secs = 30;
        write_config(&path, &cfg).expect("write");
        let loaded = load_config(&path).expect("load");
        assert_eq!(loaded, cfg);
        assert_eq!(loaded.invocation.timeout(), Some(Duration::from_secs(30)));
    }

    #[test]
    fn partial_file_fills_defaults() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("runhost.toml");
        fs::write(&path, "port = 8080\n[store]\nbackend = \"file\"\n").expect("write");
        let cfg = load_config(&path).expect("load");
        assert_eq!(cfg.port, 8080);
        assert_eq!(cfg.store.backend, StoreBackend::File);
        assert_eq!(cfg.store.inline_limit_bytes, 64 * 1024);
    }

    #[test]
    fn rejects_zero_limits() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("runhost.toml");
        fs::write(&path, "[invocation]\noutput_limit_bytes = 0\n").expect("write");
        let err = load_config(&path).expect_err("invalid");
        assert!(err.to_string().contains("output_limit_bytes"));
    }
}
