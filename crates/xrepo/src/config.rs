//! Proxy configuration, read from `xrepo.yaml`.
//!
//! Every field is optional; a missing file or section means defaults:
//!
//! ```yaml
//! listen: 127.0.0.1:4389
//! resolver:
//!   cache_ttl_secs: 600
//!   cache_capacity: 10000
//!   request_timeout_secs: 10
//!   max_prefix_attempts: 8
//!   stdlib_revision: null   # detected from the Go toolchain
//! pool:
//!   idle_timeout_secs: 300
//!   reap_interval_secs: 60
//! workspace:
//!   cache_dir: null         # $XDG_CACHE_HOME/xrepo or ~/.cache/xrepo
//!   default_revision: HEAD
//! backends:
//!   go:
//!     command: gopls
//!     args: []
//!     language_id: go
//! ```

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tokio::fs;
use xrepo_importpath::ResolverOptions;

use crate::session::DEFAULT_REVISION;

/// Name of the configuration file looked up in the working directory.
pub const CONFIG_FILE_NAME: &str = "xrepo.yaml";

/// Default listen address.
pub const DEFAULT_LISTEN: &str = "127.0.0.1:4389";

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file could not be read.
    #[error("failed to read {path}: {source}")]
    Read {
        /// The configuration file.
        path: PathBuf,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The file is not valid configuration YAML.
    #[error("invalid configuration: {0}")]
    Parse(String),

    /// A value is out of range.
    #[error("invalid configuration value: {0}")]
    Invalid(String),
}

/// Top-level configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ProxyConfig {
    /// Address the JSON-RPC server listens on.
    pub listen: SocketAddr,
    /// Import path resolution.
    pub resolver: ResolverConfig,
    /// Backend connection pool.
    pub pool: PoolConfig,
    /// Workspace checkouts.
    pub workspace: WorkspaceConfig,
    /// Language servers by mode.
    pub backends: BTreeMap<String, BackendConfig>,
}

/// Resolver section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ResolverConfig {
    /// Seconds a successful resolution stays cached.
    pub cache_ttl_secs: u64,
    /// Maximum cached resolutions.
    pub cache_capacity: usize,
    /// Seconds allowed per discovery request.
    pub request_timeout_secs: u64,
    /// Prefixes tried per import path.
    pub max_prefix_attempts: usize,
    /// Revision of the standard distribution; detected when unset.
    pub stdlib_revision: Option<String>,
}

/// Pool section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PoolConfig {
    /// Seconds an unleased connection may idle before it is retired.
    pub idle_timeout_secs: u64,
    /// Seconds between idle sweeps.
    pub reap_interval_secs: u64,
}

/// Workspace section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct WorkspaceConfig {
    /// Where repositories are checked out.
    pub cache_dir: Option<PathBuf>,
    /// Revision for repositories reached without one; `null` means the
    /// default branch.
    pub default_revision: Option<String>,
}

/// One language server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BackendConfig {
    /// Executable to run.
    pub command: String,
    /// Arguments.
    #[serde(default)]
    pub args: Vec<String>,
    /// `languageId` for opened documents; defaults to the mode.
    #[serde(default)]
    pub language_id: Option<String>,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        let mut backends = BTreeMap::new();
        backends.insert(
            "go".to_string(),
            BackendConfig {
                command: "gopls".to_string(),
                args: Vec::new(),
                language_id: Some("go".to_string()),
            },
        );
        Self {
            listen: SocketAddr::from(([127, 0, 0, 1], 4389)),
            resolver: ResolverConfig::default(),
            pool: PoolConfig::default(),
            workspace: WorkspaceConfig::default(),
            backends,
        }
    }
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            cache_ttl_secs: 600,
            cache_capacity: 10_000,
            request_timeout_secs: 10,
            max_prefix_attempts: 8,
            stdlib_revision: None,
        }
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            idle_timeout_secs: 300,
            reap_interval_secs: 60,
        }
    }
}

impl Default for WorkspaceConfig {
    fn default() -> Self {
        Self {
            cache_dir: None,
            default_revision: Some(DEFAULT_REVISION.to_string()),
        }
    }
}

impl ProxyConfig {
    /// Load configuration from a file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub async fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)
            .await
            .map_err(|source| ConfigError::Read {
                path: path.to_path_buf(),
                source,
            })?;
        Self::from_yaml(&content)
    }

    /// Load `path` if given, else `./xrepo.yaml` if present, else defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if a chosen file cannot be read or parsed.
    pub async fn load_or_default(path: Option<&Path>) -> Result<Self, ConfigError> {
        if let Some(path) = path {
            return Self::load(path).await;
        }
        let local = Path::new(CONFIG_FILE_NAME);
        if fs::try_exists(local).await.unwrap_or(false) {
            return Self::load(local).await;
        }
        Ok(Self::default())
    }

    /// Parse YAML configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] for malformed YAML or unknown keys.
    pub fn from_yaml(content: &str) -> Result<Self, ConfigError> {
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Reject values that would disable the proxy.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] naming the first offending value.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let positive = [
            ("resolver.cache_ttl_secs", self.resolver.cache_ttl_secs),
            ("resolver.request_timeout_secs", self.resolver.request_timeout_secs),
            ("pool.idle_timeout_secs", self.pool.idle_timeout_secs),
            ("pool.reap_interval_secs", self.pool.reap_interval_secs),
        ];
        for (name, value) in positive {
            if value == 0 {
                return Err(ConfigError::Invalid(format!("{name} must be positive")));
            }
        }
        if self.resolver.cache_capacity == 0 {
            return Err(ConfigError::Invalid(
                "resolver.cache_capacity must be positive".to_string(),
            ));
        }
        if self.resolver.max_prefix_attempts == 0 {
            return Err(ConfigError::Invalid(
                "resolver.max_prefix_attempts must be positive".to_string(),
            ));
        }
        if self.backends.is_empty() {
            return Err(ConfigError::Invalid(
                "at least one backend must be configured".to_string(),
            ));
        }
        for (mode, backend) in &self.backends {
            if backend.command.trim().is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "backends.{mode}.command must not be empty"
                )));
            }
        }
        Ok(())
    }

    /// Resolver options, with the standard distribution pinned to
    /// `stdlib_revision`.
    #[must_use]
    pub fn resolver_options(&self, stdlib_revision: String) -> ResolverOptions {
        ResolverOptions {
            stdlib_revision,
            cache_ttl: Duration::from_secs(self.resolver.cache_ttl_secs),
            cache_capacity: self.resolver.cache_capacity,
            request_timeout: Duration::from_secs(self.resolver.request_timeout_secs),
            max_prefix_attempts: self.resolver.max_prefix_attempts,
        }
    }

    /// Idle timeout for pooled connections.
    #[must_use]
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.pool.idle_timeout_secs)
    }

    /// Interval between idle sweeps.
    #[must_use]
    pub fn reap_interval(&self) -> Duration {
        Duration::from_secs(self.pool.reap_interval_secs)
    }

    /// Checkout directory: configured, else the user cache directory.
    #[must_use]
    pub fn cache_dir(&self) -> PathBuf {
        if let Some(dir) = &self.workspace.cache_dir {
            return dir.clone();
        }
        if let Some(xdg) = std::env::var_os("XDG_CACHE_HOME").filter(|v| !v.is_empty()) {
            return PathBuf::from(xdg).join("xrepo");
        }
        match std::env::var_os("HOME").filter(|v| !v.is_empty()) {
            Some(home) => PathBuf::from(home).join(".cache").join("xrepo"),
            None => std::env::temp_dir().join("xrepo"),
        }
    }
}
