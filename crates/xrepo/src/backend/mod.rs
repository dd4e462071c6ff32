//! Analysis backends: the language-specific engines the proxy fronts.
//!
//! A backend is started once per [`WorkspaceKey`] and yields a
//! [`BackendConnection`] that answers requests in workspace-relative
//! coordinates:
//!
//! - file URIs are `file:///<path relative to the workspace root>`;
//! - positions are 0-based LSP positions.
//!
//! A `textDocument/definition` result is one of
//!
//! - `null` when nothing is defined at the position,
//! - an LSP `Location` or `Location[]`,
//! - `{"uri": ..., "span": {"offset": N, "length": N}}` for a raw byte span,
//! - `{"external": {"package": ..., "name": ...}}` when the definition lives
//!   in another repository, identified only by import path and symbol name.
//!
//! `workspace/xdefinition` with `{package, name, dir}` looks a symbol up by
//! name and answers with the same local shapes.

mod error;
mod lsp;
mod materialize;
mod provider;

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::uri::WorkspaceKey;

pub use error::BackendError;
pub use lsp::{LspBackend, LspConnection};
pub use materialize::{GitMaterializer, Materializer, StaticMaterializer};
pub use provider::{ConfiguredProvider, ExternalPackage, GoplsProvider, LspProvider};

/// Method name for the cross-repository symbol lookup.
pub const XDEFINITION: &str = "workspace/xdefinition";

/// Result type for backend operations.
pub type Result<T> = std::result::Result<T, BackendError>;

/// Starts connections for one language mode.
#[async_trait]
pub trait AnalysisBackend: Send + Sync {
    /// The language mode this backend serves, e.g. `go`.
    fn mode(&self) -> &str;

    /// Start a connection for `key`, including any handshake.
    async fn start(&self, key: &WorkspaceKey) -> Result<Arc<dyn BackendConnection>>;
}

/// A live, initialized connection to one workspace.
#[async_trait]
pub trait BackendConnection: Send + Sync {
    /// Send `method` with `params` and wait for the result.
    ///
    /// Cancelling `cancel` abandons the call and returns
    /// [`BackendError::Cancelled`].
    async fn call(&self, method: &str, params: Value, cancel: &CancellationToken) -> Result<Value>;

    /// Contents of a workspace-relative file.
    async fn read_file(&self, path: &str) -> Result<String>;

    /// Tear the connection down. Idempotent.
    async fn shutdown(&self);

    /// Whether the connection can still serve calls.
    fn is_alive(&self) -> bool {
        true
    }
}

/// Backends by mode.
#[derive(Clone, Default)]
pub struct BackendRegistry {
    backends: HashMap<String, Arc<dyn AnalysisBackend>>,
}

impl BackendRegistry {
    /// An empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `backend` under its own mode, replacing any previous one.
    pub fn register(&mut self, backend: Arc<dyn AnalysisBackend>) {
        self.backends.insert(backend.mode().to_string(), backend);
    }

    /// Builder form of [`register`](Self::register).
    #[must_use]
    pub fn with(mut self, backend: Arc<dyn AnalysisBackend>) -> Self {
        self.register(backend);
        self
    }

    /// The backend for `mode`.
    #[must_use]
    pub fn get(&self, mode: &str) -> Option<Arc<dyn AnalysisBackend>> {
        self.backends.get(mode).cloned()
    }

    /// Registered modes, sorted.
    #[must_use]
    pub fn modes(&self) -> Vec<&str> {
        let mut modes: Vec<&str> = self.backends.keys().map(String::as_str).collect();
        modes.sort_unstable();
        modes
    }
}

impl fmt::Debug for BackendRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackendRegistry")
            .field("modes", &self.modes())
            .finish()
    }
}
