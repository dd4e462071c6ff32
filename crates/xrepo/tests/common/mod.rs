//! Common test utilities shared across integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use url::Url;
use xrepo::backend::{
    AnalysisBackend, BackendConnection, BackendError, BackendRegistry, XDEFINITION,
};
use xrepo::{ConnectionPool, SessionServices, WorkspaceKey};
use xrepo_importpath::{FetchResponse, Fetcher, Resolver, ResolverOptions};

/// Canned answers of one fake workspace.
#[derive(Debug, Clone, Default)]
pub struct Script {
    pub definition: Value,
    pub hover: Value,
    pub xdefinition: Value,
    pub files: HashMap<String, String>,
    pub exited: bool,
    pub call_delay: Duration,
}

impl Script {
    pub fn definition(mut self, value: Value) -> Self {
        self.definition = value;
        self
    }

    pub fn hover(mut self, value: Value) -> Self {
        self.hover = value;
        self
    }

    pub fn xdefinition(mut self, value: Value) -> Self {
        self.xdefinition = value;
        self
    }

    /// Every call fails as if the server process had died.
    pub fn exited(mut self) -> Self {
        self.exited = true;
        self
    }

    /// Calls take `delay` unless cancelled first.
    pub fn call_delay(mut self, delay: Duration) -> Self {
        self.call_delay = delay;
        self
    }

    pub fn file(mut self, path: &str, text: &str) -> Self {
        self.files.insert(path.to_string(), text.to_string());
        self
    }
}

/// One recorded backend call.
#[derive(Debug, Clone)]
pub struct Call {
    pub workspace: String,
    pub method: String,
    pub params: Value,
}

/// A backend whose workspaces answer from [`Script`]s keyed by root URI.
///
/// Workspaces without a script fail to start.
#[derive(Default)]
pub struct FakeBackend {
    scripts: HashMap<String, Script>,
    start_delay: Duration,
    pub starts: AtomicUsize,
    pub calls: Arc<Mutex<Vec<Call>>>,
}

impl FakeBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn workspace(mut self, root: &str, script: Script) -> Self {
        self.scripts.insert(root.to_string(), script);
        self
    }

    pub fn start_delay(mut self, delay: Duration) -> Self {
        self.start_delay = delay;
        self
    }

    pub fn start_count(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }

    pub fn calls_to(&self, method: &str) -> Vec<Call> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|call| call.method == method)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl AnalysisBackend for FakeBackend {
    fn mode(&self) -> &str {
        "go"
    }

    async fn start(
        &self,
        key: &WorkspaceKey,
    ) -> xrepo::backend::Result<Arc<dyn BackendConnection>> {
        self.starts.fetch_add(1, Ordering::SeqCst);
        if !self.start_delay.is_zero() {
            tokio::time::sleep(self.start_delay).await;
        }
        let workspace = key.root.to_string();
        let script = self
            .scripts
            .get(&workspace)
            .cloned()
            .ok_or_else(|| BackendError::materialize(&workspace, "no such repository"))?;
        Ok(Arc::new(FakeConnection {
            workspace,
            script,
            calls: Arc::clone(&self.calls),
        }))
    }
}

struct FakeConnection {
    workspace: String,
    script: Script,
    calls: Arc<Mutex<Vec<Call>>>,
}

#[async_trait]
impl BackendConnection for FakeConnection {
    async fn call(
        &self,
        method: &str,
        params: Value,
        cancel: &CancellationToken,
    ) -> xrepo::backend::Result<Value> {
        self.calls.lock().unwrap().push(Call {
            workspace: self.workspace.clone(),
            method: method.to_string(),
            params,
        });
        if self.script.exited {
            return Err(BackendError::Exited);
        }
        if !self.script.call_delay.is_zero() {
            tokio::select! {
                biased;
                () = cancel.cancelled() => return Err(BackendError::Cancelled),
                () = tokio::time::sleep(self.script.call_delay) => {}
            }
        }
        if cancel.is_cancelled() {
            return Err(BackendError::Cancelled);
        }
        Ok(match method {
            "textDocument/definition" => self.script.definition.clone(),
            "textDocument/hover" => self.script.hover.clone(),
            XDEFINITION => self.script.xdefinition.clone(),
            _ => Value::Null,
        })
    }

    async fn read_file(&self, path: &str) -> xrepo::backend::Result<String> {
        self.script
            .files
            .get(path)
            .cloned()
            .ok_or_else(|| BackendError::InvalidPath(path.to_string()))
    }

    async fn shutdown(&self) {}
}

/// A fetcher for which every discovery page is missing.
pub struct NoPages {
    pub requests: AtomicUsize,
}

#[async_trait]
impl Fetcher for NoPages {
    async fn get(&self, _url: &Url) -> Result<FetchResponse, String> {
        self.requests.fetch_add(1, Ordering::SeqCst);
        Ok(FetchResponse {
            status: 404,
            body: String::new(),
        })
    }
}

/// Services over `backend`, with the standard library pinned to `go1.7.1`
/// and no network discovery.
pub fn services(backend: Arc<FakeBackend>) -> Arc<SessionServices> {
    let options = ResolverOptions {
        stdlib_revision: "go1.7.1".to_string(),
        ..ResolverOptions::default()
    };
    let fetcher = Arc::new(NoPages {
        requests: AtomicUsize::new(0),
    });
    let resolver = Arc::new(Resolver::with_fetcher(options, fetcher));
    let registry = BackendRegistry::new().with(backend);
    let pool = ConnectionPool::new(registry, Duration::from_secs(60));
    Arc::new(SessionServices::new(resolver, pool))
}
