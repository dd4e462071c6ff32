//! Language-server backed connections.
//!
//! The server runs over stdio. A reader task owns the server's output and
//! dispatches responses to waiting callers by request id, so any number of
//! calls can be in flight on one connection:
//!
//! - responses (`id`, no `method`) complete the matching pending call;
//! - server requests (`id` and `method`) are acknowledged with `null`;
//! - notifications (`method`, no `id`) are skipped.
//!
//! Callers speak workspace-relative `file:///` URIs; they are translated to
//! absolute URIs inside the materialized checkout on the way in and back on
//! the way out.

use async_trait::async_trait;
use lsp_types::{
    ClientCapabilities, DidOpenTextDocumentParams, GotoDefinitionResponse, InitializeParams,
    OneOf, TextDocumentItem, Uri, WindowClientCapabilities, WorkspaceFolder,
    WorkspaceSymbolResponse,
    notification::{DidOpenTextDocument, Notification},
    request::{Initialize, Request, Shutdown},
};
use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::{Value, json};
use std::collections::{HashMap, HashSet};
use std::path::{Component, Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use super::materialize::Materializer;
use super::provider::{ExternalPackage, LspProvider};
use super::{AnalysisBackend, BackendConnection, BackendError, Result, XDEFINITION};
use crate::rewrite::{LineIndex, local_file_uri, path_from_local_uri};
use crate::rpc::codec::{read_frame, write_message};
use crate::uri::WorkspaceKey;

/// How long teardown waits for each of `shutdown` and process exit.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

const DEFINITION_METHOD: &str = "textDocument/definition";
const WORKSPACE_SYMBOL_METHOD: &str = "workspace/symbol";

/// Starts one language server per workspace.
pub struct LspBackend {
    mode: String,
    provider: Arc<dyn LspProvider>,
    materializer: Arc<dyn Materializer>,
}

impl LspBackend {
    /// A backend serving `mode` with servers configured by `provider`.
    #[must_use]
    pub fn new(
        mode: impl Into<String>,
        provider: Arc<dyn LspProvider>,
        materializer: Arc<dyn Materializer>,
    ) -> Self {
        Self {
            mode: mode.into(),
            provider,
            materializer,
        }
    }
}

#[async_trait]
impl AnalysisBackend for LspBackend {
    fn mode(&self) -> &str {
        &self.mode
    }

    async fn start(&self, key: &WorkspaceKey) -> Result<Arc<dyn BackendConnection>> {
        let dir = self.materializer.materialize(&key.root).await?;
        let connection = LspConnection::spawn(Arc::clone(&self.provider), &dir).await?;
        debug!(workspace = %key, dir = %dir.display(), "Language server ready");
        Ok(Arc::new(connection))
    }
}

type Reply = std::result::Result<Value, (i64, String)>;

/// Request/response plumbing shared with the reader task.
struct Channel {
    writer: tokio::sync::Mutex<Box<dyn AsyncWrite + Send + Unpin>>,
    pending: Mutex<HashMap<i64, oneshot::Sender<Reply>>>,
    next_id: AtomicI64,
    closed: AtomicBool,
}

impl Channel {
    async fn write(&self, message: &Value) -> Result<()> {
        let mut writer = self.writer.lock().await;
        write_message(&mut *writer, message).await?;
        Ok(())
    }

    async fn notify(&self, method: &str, params: Value) -> Result<()> {
        trace!(method, "Sending notification");
        self.write(&json!({
            "jsonrpc": "2.0",
            "method": method,
            "params": params,
        }))
        .await
    }

    async fn request(
        &self,
        method: &str,
        params: Value,
        cancel: &CancellationToken,
    ) -> Result<Value> {
        if cancel.is_cancelled() {
            return Err(BackendError::Cancelled);
        }
        if self.closed.load(Ordering::SeqCst) {
            return Err(BackendError::Exited);
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(id, tx);
        // The reader may have drained `pending` between the check above and
        // the insert.
        if self.closed.load(Ordering::SeqCst) {
            self.pending.lock().remove(&id);
            return Err(BackendError::Exited);
        }

        trace!(method, id, "Sending request");
        let request = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        });
        if let Err(e) = self.write(&request).await {
            self.pending.lock().remove(&id);
            return Err(e);
        }

        tokio::select! {
            biased;
            () = cancel.cancelled() => {
                self.pending.lock().remove(&id);
                if let Err(e) = self.notify("$/cancelRequest", json!({ "id": id })).await {
                    debug!(error = %e, id, "Failed to forward cancellation");
                }
                Err(BackendError::Cancelled)
            }
            reply = rx => match reply {
                Ok(Ok(result)) => Ok(result),
                Ok(Err((code, message))) => Err(BackendError::server_error(code, message)),
                Err(_) => Err(BackendError::Exited),
            },
        }
    }

    fn complete(&self, message: &Value) {
        let Some(id) = message.get("id").and_then(Value::as_i64) else {
            trace!(response = %message, "Dropping response without numeric id");
            return;
        };
        let reply = match message.get("error") {
            Some(error) => Err((
                error["code"].as_i64().unwrap_or(-1),
                error["message"]
                    .as_str()
                    .unwrap_or("unknown error")
                    .to_string(),
            )),
            None => Ok(message.get("result").cloned().unwrap_or(Value::Null)),
        };
        match self.pending.lock().remove(&id) {
            Some(tx) => {
                let _ = tx.send(reply);
            }
            None => trace!(id, "Response for abandoned request"),
        }
    }
}

async fn read_loop<R>(channel: Arc<Channel>, reader: R)
where
    R: AsyncRead + Send + Unpin + 'static,
{
    let mut reader = BufReader::new(reader);
    loop {
        let body = match read_frame(&mut reader).await {
            Ok(Some(body)) => body,
            Ok(None) => {
                debug!("Language server closed its output");
                break;
            }
            Err(e) => {
                warn!(error = %e, "Language server stream failed");
                break;
            }
        };
        let message: Value = match serde_json::from_slice(&body) {
            Ok(message) => message,
            Err(e) => {
                warn!(error = %e, "Skipping undecodable message from language server");
                continue;
            }
        };

        if let Some(method) = message.get("method").and_then(Value::as_str) {
            if let Some(request_id) = message.get("id") {
                trace!(method, "Acknowledging server request");
                let ack = json!({
                    "jsonrpc": "2.0",
                    "id": request_id,
                    "result": null,
                });
                if let Err(e) = channel.write(&ack).await {
                    warn!(error = %e, "Failed to acknowledge server request");
                    break;
                }
            } else {
                trace!(method, "Skipping notification");
            }
            continue;
        }

        channel.complete(&message);
    }

    channel.closed.store(true, Ordering::SeqCst);
    // Dropping the senders fails every waiting call with `Exited`.
    channel.pending.lock().clear();
}

/// A running language server for one checkout.
pub struct LspConnection {
    channel: Arc<Channel>,
    provider: Arc<dyn LspProvider>,
    root: PathBuf,
    opened: Mutex<HashSet<String>>,
    child: tokio::sync::Mutex<Option<Child>>,
    reader: Mutex<Option<JoinHandle<()>>>,
    shut_down: AtomicBool,
}

impl LspConnection {
    /// Spawn the provider's server in `root` and run the initialize
    /// handshake.
    ///
    /// # Errors
    ///
    /// Returns an error if the executable is missing, fails to start, or the
    /// handshake fails.
    pub async fn spawn(provider: Arc<dyn LspProvider>, root: &Path) -> Result<Self> {
        let command = provider.command().to_string();
        let args = provider
            .args()
            .into_iter()
            .map(str::to_string)
            .collect::<Vec<_>>();
        debug!(
            command = %command,
            args = ?args,
            workspace = %root.display(),
            "Starting language server"
        );

        let mut child = Command::new(&command)
            .args(&args)
            .current_dir(root)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    BackendError::not_installed(&command, provider.install_hint())
                } else {
                    BackendError::spawn_failed(&command, e)
                }
            })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| BackendError::Protocol("server stdin was not captured".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| BackendError::Protocol("server stdout was not captured".to_string()))?;

        Self::connect(provider, root, stdout, stdin, Some(child)).await
    }

    /// Run the initialize handshake over an already established stream.
    ///
    /// # Errors
    ///
    /// Returns an error if `root` cannot be resolved or the handshake fails.
    pub async fn connect<R, W>(
        provider: Arc<dyn LspProvider>,
        root: &Path,
        reader: R,
        writer: W,
        child: Option<Child>,
    ) -> Result<Self>
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let root = tokio::fs::canonicalize(root).await.map_err(|e| {
            BackendError::InvalidPath(format!("cannot canonicalize {}: {e}", root.display()))
        })?;

        let channel = Arc::new(Channel {
            writer: tokio::sync::Mutex::new(Box::new(writer)),
            pending: Mutex::new(HashMap::new()),
            next_id: AtomicI64::new(0),
            closed: AtomicBool::new(false),
        });
        let reader = tokio::spawn(read_loop(Arc::clone(&channel), reader));

        let connection = Self {
            channel,
            provider,
            root,
            opened: Mutex::new(HashSet::new()),
            child: tokio::sync::Mutex::new(child),
            reader: Mutex::new(Some(reader)),
            shut_down: AtomicBool::new(false),
        };

        if let Err(e) = connection.initialize().await {
            connection.shutdown().await;
            return Err(e);
        }
        Ok(connection)
    }

    /// Absolute root of the checkout this server analyses.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    #[allow(deprecated)] // root_uri is deprecated but still widely used
    async fn initialize(&self) -> Result<()> {
        let root_uri = self.parse_uri(&path_to_uri(&self.root)?)?;
        let name = self
            .root
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("workspace")
            .to_string();

        let capabilities = ClientCapabilities {
            window: Some(WindowClientCapabilities {
                work_done_progress: Some(true),
                ..Default::default()
            }),
            ..Default::default()
        };
        let params = InitializeParams {
            root_uri: Some(root_uri.clone()),
            workspace_folders: Some(vec![WorkspaceFolder {
                uri: root_uri,
                name,
            }]),
            capabilities,
            initialization_options: self.provider.initialize_options(),
            ..Default::default()
        };
        let params = serde_json::to_value(params)
            .map_err(|e| BackendError::InitializeFailed(e.to_string()))?;

        self.channel
            .request(Initialize::METHOD, params, &CancellationToken::new())
            .await
            .map_err(|e| BackendError::InitializeFailed(e.to_string()))?;
        self.channel.notify("initialized", json!({})).await?;

        debug!(workspace = %self.root.display(), "Initialize handshake complete");
        Ok(())
    }

    fn parse_uri(&self, uri: &str) -> Result<Uri> {
        uri.parse()
            .map_err(|e| BackendError::InvalidPath(format!("invalid URI '{uri}': {e}")))
    }

    /// Absolute path of workspace-relative `rel`, refusing escapes.
    fn workspace_path(&self, rel: &str) -> Result<PathBuf> {
        let rel_path = Path::new(rel);
        if rel.is_empty()
            || !rel_path
                .components()
                .all(|c| matches!(c, Component::Normal(_)))
        {
            return Err(BackendError::InvalidPath(rel.to_string()));
        }
        Ok(self.root.join(rel_path))
    }

    /// Workspace-relative form of an absolute path inside the checkout.
    fn relative(&self, abs: &Path) -> Option<String> {
        let rel = abs.strip_prefix(&self.root).ok()?;
        let rel = rel.to_str()?;
        (!rel.is_empty()).then(|| rel.to_string())
    }

    fn to_server_uris(&self, params: &mut Value) -> Result<()> {
        map_uris(params, &|uri| {
            let rel = path_from_local_uri(uri)
                .map_err(|_| BackendError::InvalidPath(uri.to_string()))?;
            path_to_uri(&self.workspace_path(&rel)?).map(Some)
        })
    }

    fn to_local_uris(&self, result: &mut Value) {
        let _ = map_uris(result, &|uri| {
            Ok(uri_to_path(uri)
                .and_then(|abs| self.relative(&abs))
                .map(|rel| local_file_uri(&rel)))
        });
    }

    async fn ensure_open(&self, params: &Value) -> Result<()> {
        let Some(uri) = params
            .pointer("/textDocument/uri")
            .and_then(Value::as_str)
        else {
            return Ok(());
        };
        if self.opened.lock().contains(uri) {
            return Ok(());
        }

        let path = uri_to_path(uri).ok_or_else(|| BackendError::InvalidPath(uri.to_string()))?;
        let text = tokio::fs::read_to_string(&path).await?;
        let params = DidOpenTextDocumentParams {
            text_document: TextDocumentItem {
                uri: self.parse_uri(uri)?,
                language_id: self.provider.language_id().to_string(),
                version: 1,
                text,
            },
        };
        let params =
            serde_json::to_value(params).map_err(|e| BackendError::Protocol(e.to_string()))?;
        self.channel.notify(DidOpenTextDocument::METHOD, params).await?;
        self.opened.lock().insert(uri.to_string());
        trace!(file = %path.display(), "Sent didOpen notification");
        Ok(())
    }

    /// Rewrite a definition result, turning locations outside the checkout
    /// into external package references where the provider recognises them.
    async fn localize_definition(&self, result: Value) -> Value {
        let parsed = serde_json::from_value::<Option<GotoDefinitionResponse>>(result.clone());
        let response = match parsed {
            Ok(Some(response)) => response,
            Ok(None) => return Value::Null,
            Err(_) => {
                let mut result = result;
                self.to_local_uris(&mut result);
                return result;
            }
        };

        let targets = match response {
            GotoDefinitionResponse::Scalar(location) => vec![(location.uri, location.range)],
            GotoDefinitionResponse::Array(locations) => locations
                .into_iter()
                .map(|l| (l.uri, l.range))
                .collect(),
            GotoDefinitionResponse::Link(links) => links
                .into_iter()
                .map(|l| (l.target_uri, l.target_selection_range))
                .collect(),
        };

        let mut local = Vec::new();
        let mut external = None;
        for (uri, range) in targets {
            let Some(abs) = uri_to_path(uri.as_str()) else {
                continue;
            };
            if let Some(rel) = self.relative(&abs) {
                local.push(json!({ "uri": local_file_uri(&rel), "range": range }));
                continue;
            }
            if external.is_some() {
                continue;
            }
            let Some(package) = self.provider.external_package(&abs) else {
                trace!(path = %abs.display(), "Dropping definition outside the workspace");
                continue;
            };
            match identifier_at(&abs, range.start.line, range.start.character).await {
                Some(name) => external = Some(external_reference(package, &name)),
                None => trace!(path = %abs.display(), "No identifier at external definition"),
            }
        }

        if !local.is_empty() {
            Value::Array(local)
        } else {
            external.unwrap_or(Value::Null)
        }
    }

    /// Find exported symbol `name` of the package in directory `dir`.
    async fn xdefinition(&self, params: Value, cancel: &CancellationToken) -> Result<Value> {
        let query: XDefinitionParams = serde_json::from_value(params)
            .map_err(|e| BackendError::Protocol(format!("invalid {XDEFINITION} params: {e}")))?;
        let qualified = format!(
            "{}.{}",
            query.package.rsplit('/').next().unwrap_or(query.package.as_str()),
            query.name
        );

        let result = self
            .channel
            .request(
                WORKSPACE_SYMBOL_METHOD,
                json!({ "query": query.name }),
                cancel,
            )
            .await?;
        let symbols = serde_json::from_value::<Option<WorkspaceSymbolResponse>>(result)
            .map_err(|e| BackendError::Protocol(format!("invalid workspace/symbol result: {e}")))?;

        let candidates: Vec<(String, Uri, lsp_types::Range)> = match symbols {
            None => Vec::new(),
            Some(WorkspaceSymbolResponse::Flat(symbols)) => symbols
                .into_iter()
                .map(|s| (s.name, s.location.uri, s.location.range))
                .collect(),
            Some(WorkspaceSymbolResponse::Nested(symbols)) => symbols
                .into_iter()
                .map(|s| match s.location {
                    OneOf::Left(location) => (s.name, location.uri, location.range),
                    OneOf::Right(location) => (s.name, location.uri, lsp_types::Range::default()),
                })
                .collect(),
        };

        let mut found = Vec::new();
        for (name, uri, range) in candidates {
            if name != query.name && name != qualified {
                continue;
            }
            let Some(rel) = uri_to_path(uri.as_str()).and_then(|abs| self.relative(&abs)) else {
                continue;
            };
            let dir = Path::new(&rel)
                .parent()
                .and_then(Path::to_str)
                .unwrap_or("");
            if dir == query.dir {
                found.push(json!({ "uri": local_file_uri(&rel), "range": range }));
            }
        }
        debug!(
            package = %query.package,
            name = %query.name,
            matches = found.len(),
            "Resolved cross-repository symbol"
        );
        Ok(Value::Array(found))
    }
}

#[async_trait]
impl BackendConnection for LspConnection {
    async fn call(&self, method: &str, params: Value, cancel: &CancellationToken) -> Result<Value> {
        if method == XDEFINITION {
            return self.xdefinition(params, cancel).await;
        }

        let mut params = params;
        self.to_server_uris(&mut params)?;
        self.ensure_open(&params).await?;

        let result = self.channel.request(method, params, cancel).await?;
        if method == DEFINITION_METHOD {
            Ok(self.localize_definition(result).await)
        } else {
            let mut result = result;
            self.to_local_uris(&mut result);
            Ok(result)
        }
    }

    async fn read_file(&self, path: &str) -> Result<String> {
        let abs = self.workspace_path(path)?;
        Ok(tokio::fs::read_to_string(abs).await?)
    }

    async fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!(workspace = %self.root.display(), "Shutting down language server");

        let cancel = CancellationToken::new();
        match tokio::time::timeout(
            SHUTDOWN_TIMEOUT,
            self.channel.request(Shutdown::METHOD, Value::Null, &cancel),
        )
        .await
        {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => debug!(error = %e, "Shutdown request failed"),
            Err(_) => warn!("Language server did not answer shutdown in time"),
        }
        if let Err(e) = self.channel.notify("exit", Value::Null).await {
            debug!(error = %e, "Failed to send exit notification");
        }

        if let Some(mut child) = self.child.lock().await.take() {
            match tokio::time::timeout(SHUTDOWN_TIMEOUT, child.wait()).await {
                Ok(Ok(status)) if !status.success() => {
                    warn!(
                        exit_code = ?status.code(),
                        "Language server exited with non-zero status"
                    );
                }
                Ok(Ok(_)) => {}
                Ok(Err(e)) => warn!(error = %e, "Failed to wait for language server exit"),
                Err(_) => {
                    warn!("Language server did not exit; killing it");
                    if let Err(e) = child.kill().await {
                        warn!(error = %e, "Failed to kill language server");
                    }
                }
            }
        }

        if let Some(reader) = self.reader.lock().take() {
            reader.abort();
        }
        self.channel.closed.store(true, Ordering::SeqCst);
        self.channel.pending.lock().clear();
    }

    fn is_alive(&self) -> bool {
        !self.channel.closed.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Deserialize)]
struct XDefinitionParams {
    package: String,
    name: String,
    #[serde(default)]
    dir: String,
}

/// Rewrite every `uri`/`targetUri` string in `value` through `f`.
fn map_uris(value: &mut Value, f: &dyn Fn(&str) -> Result<Option<String>>) -> Result<()> {
    match value {
        Value::Object(map) => {
            for (key, item) in map.iter_mut() {
                if key == "uri" || key == "targetUri" {
                    if let Value::String(uri) = item {
                        if uri.starts_with("file://") {
                            if let Some(mapped) = f(uri)? {
                                *uri = mapped;
                            }
                        }
                        continue;
                    }
                }
                map_uris(item, f)?;
            }
        }
        Value::Array(items) => {
            for item in items {
                map_uris(item, f)?;
            }
        }
        _ => {}
    }
    Ok(())
}

/// `{"external": {"package", "name", "revision"?}}` for a definition in
/// another repository.
fn external_reference(package: ExternalPackage, name: &str) -> Value {
    let mut reference = json!({ "package": package.package, "name": name });
    if let Some(revision) = package.revision {
        reference["revision"] = Value::String(revision);
    }
    json!({ "external": reference })
}

fn path_to_uri(path: &Path) -> Result<String> {
    let path = path
        .to_str()
        .ok_or_else(|| {
            BackendError::InvalidPath(format!("path contains invalid UTF-8: {}", path.display()))
        })?;
    Ok(local_file_uri(path))
}

fn uri_to_path(uri: &str) -> Option<PathBuf> {
    path_from_local_uri(uri)
        .ok()
        .map(|p| Path::new("/").join(p))
}

/// The identifier starting at `line`/`character` of the file at `path`.
async fn identifier_at(path: &Path, line: u32, character: u32) -> Option<String> {
    let text = tokio::fs::read_to_string(path).await.ok()?;
    let start = LineIndex::new(&text).offset(line, character).ok()?;
    let name: String = text[start..]
        .chars()
        .take_while(|c| c.is_alphanumeric() || *c == '_')
        .collect();
    (!name.is_empty()).then_some(name)
}
