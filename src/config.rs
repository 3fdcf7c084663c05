//! Pool configuration
//!
//! Everything needed to stand up a pool: which module to run, how many
//! instances, what each guest sees, and which host directory it is granted.
//! Configs are plain JSON; every field has a default.
//!
//! ```json
//! {
//!   "module": "guest.wasm",
//!   "max_concurrency": 4,
//!   "root": "/home/me/project",
//!   "hydrate": ["src", "Cargo.toml"],
//!   "guest": { "args": ["--serve"], "trace_syscalls": false }
//! }
//! ```

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Guest name under which the granted directory appears
pub const DEFAULT_PREOPEN: &str = "/repo";

/// Errors that can occur while loading configuration
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid config: {reason}")]
    Invalid { reason: String },
}

/// What one guest instance is started with
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GuestConfig {
    /// Reported as `argv[0]`
    pub program_name: String,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    /// Guest-visible name of the granted directory
    pub preopen_name: String,
    /// Log every syscall at trace level
    pub trace_syscalls: bool,
    /// Keep a copy of everything the guest writes to stdout
    pub capture_stdout: bool,
}

impl Default for GuestConfig {
    fn default() -> Self {
        Self {
            program_name: "guest".to_string(),
            args: Vec::new(),
            env: BTreeMap::new(),
            preopen_name: DEFAULT_PREOPEN.to_string(),
            trace_syscalls: false,
            capture_stdout: false,
        }
    }
}

/// Top-level pool configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Path to the guest `.wasm` (or `.wat`) module
    pub module: PathBuf,
    /// Number of worker slots
    pub max_concurrency: usize,
    pub guest: GuestConfig,
    /// Host directory exposed to every guest, read-only
    pub root: Option<PathBuf>,
    /// Paths under `root` to resolve before the first guest starts
    pub hydrate: Option<Vec<String>>,
    /// Zip archive exposed instead of `root`
    pub zip: Option<PathBuf>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            module: PathBuf::new(),
            max_concurrency: default_concurrency(),
            guest: GuestConfig::default(),
            root: None,
            hydrate: None,
            zip: None,
        }
    }
}

fn default_concurrency() -> usize {
    std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1)
}

impl PoolConfig {
    pub fn builder() -> PoolConfigBuilder {
        PoolConfigBuilder::new()
    }

    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: PoolConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let json = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json(&json)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_concurrency == 0 {
            return Err(ConfigError::Invalid {
                reason: "max_concurrency must be at least 1".to_string(),
            });
        }
        if self.root.is_some() && self.zip.is_some() {
            return Err(ConfigError::Invalid {
                reason: "root and zip are mutually exclusive".to_string(),
            });
        }
        if self.guest.preopen_name.is_empty() {
            return Err(ConfigError::Invalid {
                reason: "preopen_name must not be empty".to_string(),
            });
        }
        Ok(())
    }
}

/// Builder for [`PoolConfig`]
#[derive(Debug, Clone, Default)]
pub struct PoolConfigBuilder {
    config: PoolConfig,
}

impl PoolConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn module(mut self, module: impl Into<PathBuf>) -> Self {
        self.config.module = module.into();
        self
    }

    pub fn max_concurrency(mut self, n: usize) -> Self {
        self.config.max_concurrency = n;
        self
    }

    pub fn root(mut self, root: impl Into<PathBuf>) -> Self {
        self.config.root = Some(root.into());
        self
    }

    pub fn zip(mut self, archive: impl Into<PathBuf>) -> Self {
        self.config.zip = Some(archive.into());
        self
    }

    pub fn hydrate<I, S>(mut self, paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.config.hydrate = Some(paths.into_iter().map(Into::into).collect());
        self
    }

    pub fn program_name(mut self, name: &str) -> Self {
        self.config.guest.program_name = name.to_string();
        self
    }

    pub fn arg(mut self, arg: &str) -> Self {
        self.config.guest.args.push(arg.to_string());
        self
    }

    pub fn env(mut self, name: &str, value: &str) -> Self {
        self.config.guest.env.insert(name.to_string(), value.to_string());
        self
    }

    pub fn preopen_name(mut self, name: &str) -> Self {
        self.config.guest.preopen_name = name.to_string();
        self
    }

    pub fn trace_syscalls(mut self, trace: bool) -> Self {
        self.config.guest.trace_syscalls = trace;
        self
    }

    pub fn capture_stdout(mut self, capture: bool) -> Self {
        self.config.guest.capture_stdout = capture;
        self
    }

    pub fn build(self) -> Result<PoolConfig, ConfigError> {
        self.config.validate()?;
        Ok(self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_fill_missing_fields() {
        let config = PoolConfig::from_json(r#"{"module": "guest.wasm"}"#).unwrap();
        assert_eq!(config.module, PathBuf::from("guest.wasm"));
        assert!(config.max_concurrency >= 1);
        assert_eq!(config.guest.preopen_name, "/repo");
        assert_eq!(config.root, None);
        assert_eq!(config.hydrate, None);
    }

    #[test]
    fn test_full_config() {
        let json = r#"{
            "module": "g.wasm",
            "max_concurrency": 3,
            "root": "/tmp/project",
            "hydrate": ["src"],
            "guest": {"args": ["--serve"], "env": {"RUST_LOG": "debug"}, "trace_syscalls": true}
        }"#;
        let config = PoolConfig::from_json(json).unwrap();
        assert_eq!(config.max_concurrency, 3);
        assert_eq!(config.hydrate, Some(vec!["src".to_string()]));
        assert_eq!(config.guest.args, vec!["--serve"]);
        assert_eq!(config.guest.env.get("RUST_LOG").map(String::as_str), Some("debug"));
        assert!(config.guest.trace_syscalls);
        assert_eq!(config.guest.program_name, "guest");
    }

    #[test]
    fn test_rejects_zero_concurrency() {
        let err = PoolConfig::from_json(r#"{"max_concurrency": 0}"#).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { .. }));
        assert!(PoolConfig::from_json("{not json").is_err());
    }

    #[test]
    fn test_builder() {
        let config = PoolConfig::builder()
            .module("g.wasm")
            .max_concurrency(2)
            .root("/srv")
            .arg("--serve")
            .env("A", "1")
            .preopen_name("/work")
            .build()
            .unwrap();
        assert_eq!(config.max_concurrency, 2);
        assert_eq!(config.root, Some(PathBuf::from("/srv")));
        assert_eq!(config.guest.preopen_name, "/work");
        assert!(PoolConfig::builder().max_concurrency(0).build().is_err());
    }

    #[test]
    fn test_root_or_zip() {
        let config = PoolConfig::from_json(r#"{"module": "g.wasm", "zip": "repo.zip"}"#).unwrap();
        assert_eq!(config.zip, Some(PathBuf::from("repo.zip")));
        assert_eq!(config.root, None);

        let err = PoolConfig::builder().root("/srv").zip("repo.zip").build().unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { ref reason } if reason.contains("zip")));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pool.json");
        fs::write(&path, r#"{"module": "g.wasm", "max_concurrency": 1}"#).unwrap();
        assert_eq!(PoolConfig::load(&path).unwrap().max_concurrency, 1);

        let missing = PoolConfig::load(dir.path().join("absent.json")).unwrap_err();
        assert!(matches!(missing, ConfigError::Read { .. }));
    }
}
