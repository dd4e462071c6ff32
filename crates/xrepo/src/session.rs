//! One client's view of the proxy.
//!
//! A session moves `Uninitialized → Initializing → Ready → Closed`. While
//! ready it holds a lease on the backend for its workspace and answers
//! definition and hover requests, following definitions that the backend
//! reports as living in another repository:
//!
//! 1. resolve the external package's import path to a repository;
//! 2. lease a backend for that repository at the resolved revision;
//! 3. look the symbol up there with `workspace/xdefinition`;
//! 4. qualify the answer with the target workspace's coordinates.

use serde::Deserialize;
use serde_json::{Value, json};
use std::fmt;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use xrepo_importpath::{RepositoryDescriptor, Resolver};

use crate::backend::{BackendConnection, XDEFINITION};
use crate::error::{ProxyError, Result};
use crate::pool::{ConnectionPool, Lease};
use crate::protocol::{
    HoverResult, InitializeParams, PositionParams, WireLocation, initialize_result,
};
use crate::rewrite::{LocalPosition, Location, Rewriter, local_file_uri, path_from_local_uri};
use crate::uri::{RepoUri, WorkspaceKey};

/// Revision used for a repository when resolution does not pin one.
pub const DEFAULT_REVISION: &str = "HEAD";

/// Chooses the revision of a repository reached through an import path
/// that carries none.
pub trait DefaultRevision: Send + Sync {
    /// Revision to use for `descriptor`, or `None` for the default branch.
    fn default_revision(&self, descriptor: &RepositoryDescriptor) -> Option<String>;
}

/// Always the same revision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FixedRevision(Option<String>);

impl FixedRevision {
    /// Pin every repository to `revision`.
    #[must_use]
    pub fn new(revision: impl Into<String>) -> Self {
        Self(Some(revision.into()))
    }

    /// Leave the revision unspecified.
    #[must_use]
    pub fn unspecified() -> Self {
        Self(None)
    }
}

impl Default for FixedRevision {
    fn default() -> Self {
        Self::new(DEFAULT_REVISION)
    }
}

impl DefaultRevision for FixedRevision {
    fn default_revision(&self, _descriptor: &RepositoryDescriptor) -> Option<String> {
        self.0.clone()
    }
}

/// Shared services every session uses.
pub struct SessionServices {
    /// Import path resolver (cached).
    pub resolver: Arc<Resolver>,
    /// Backend connection pool.
    pub pool: ConnectionPool,
    /// Revision policy for unpinned repositories.
    pub revisions: Arc<dyn DefaultRevision>,
}

impl SessionServices {
    /// Bundle the services with the default revision policy.
    #[must_use]
    pub fn new(resolver: Arc<Resolver>, pool: ConnectionPool) -> Self {
        Self {
            resolver,
            pool,
            revisions: Arc::new(FixedRevision::default()),
        }
    }

    /// Replace the revision policy.
    #[must_use]
    pub fn with_revisions(mut self, revisions: Arc<dyn DefaultRevision>) -> Self {
        self.revisions = revisions;
        self
    }
}

impl fmt::Debug for SessionServices {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionServices")
            .field("pool", &self.pool)
            .finish_non_exhaustive()
    }
}

/// Lifecycle of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Waiting for `initialize`.
    Uninitialized,
    /// `initialize` is acquiring the workspace backend.
    Initializing,
    /// Serving requests.
    Ready,
    /// Closed; no further requests are served.
    Closed,
}

struct Active {
    mode: String,
    rewriter: Rewriter,
    lease: Lease,
}

/// Where a backend says a definition is.
#[derive(Debug, Clone, PartialEq, Eq)]
enum BackendDefinition {
    NotFound,
    Found(Vec<LocalTarget>),
    External {
        package: String,
        name: String,
        revision: Option<String>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum LocalTarget {
    Position(LocalPosition),
    Span {
        path: String,
        offset: usize,
        length: usize,
    },
}

#[derive(Deserialize)]
struct ExternalRef {
    package: String,
    name: String,
    #[serde(default)]
    revision: Option<String>,
}

#[derive(Deserialize)]
struct ByteSpan {
    offset: usize,
    length: usize,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum WireTarget {
    Span {
        uri: String,
        span: ByteSpan,
    },
    #[serde(rename_all = "camelCase")]
    Link {
        target_uri: String,
        target_selection_range: lsp_types::Range,
    },
    Location {
        uri: String,
        range: lsp_types::Range,
    },
}

#[derive(Deserialize)]
#[serde(untagged)]
enum WireDefinition {
    External { external: ExternalRef },
    Many(Vec<WireTarget>),
    One(WireTarget),
}

impl BackendDefinition {
    fn decode(value: Value) -> Result<Self> {
        if value.is_null() {
            return Ok(Self::NotFound);
        }
        let wire: WireDefinition = serde_json::from_value(value).map_err(|e| {
            ProxyError::TransientCommunication(format!("malformed definition from backend: {e}"))
        })?;
        let targets = match wire {
            WireDefinition::External { external } => {
                return Ok(Self::External {
                    package: external.package,
                    name: external.name,
                    revision: external.revision,
                });
            }
            WireDefinition::Many(targets) => targets,
            WireDefinition::One(target) => vec![target],
        };
        if targets.is_empty() {
            return Ok(Self::NotFound);
        }
        targets
            .into_iter()
            .map(LocalTarget::decode)
            .collect::<Result<Vec<_>>>()
            .map(Self::Found)
    }
}

impl LocalTarget {
    fn decode(target: WireTarget) -> Result<Self> {
        let bad_uri = |e: crate::rewrite::RewriteError| {
            ProxyError::TransientCommunication(format!("backend returned {e}"))
        };
        Ok(match target {
            WireTarget::Span { uri, span } => Self::Span {
                path: path_from_local_uri(&uri).map_err(bad_uri)?,
                offset: span.offset,
                length: span.length,
            },
            WireTarget::Link {
                target_uri,
                target_selection_range: range,
            }
            | WireTarget::Location {
                uri: target_uri,
                range,
            } => Self::Position(LocalPosition::new(
                path_from_local_uri(&target_uri).map_err(bad_uri)?,
                range.start.line,
                range.start.character,
            )),
        })
    }
}

/// A client session.
pub struct Session {
    services: Arc<SessionServices>,
    state: SessionState,
    active: Option<Active>,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("state", &self.state)
            .field("root", &self.active.as_ref().map(|a| a.rewriter.root()))
            .finish()
    }
}

impl Session {
    /// A new, uninitialized session.
    #[must_use]
    pub fn new(services: Arc<SessionServices>) -> Self {
        Self {
            services,
            state: SessionState::Uninitialized,
            active: None,
        }
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Bind the session to a workspace.
    ///
    /// # Errors
    ///
    /// Returns [`ProxyError::InvalidRequest`] unless the session is
    /// uninitialized, or [`ProxyError::BackendUnavailable`] if the workspace
    /// backend cannot be started. A failed initialize may be retried.
    pub async fn initialize(
        &mut self,
        params: InitializeParams,
        cancel: &CancellationToken,
    ) -> Result<lsp_types::InitializeResult> {
        if self.state != SessionState::Uninitialized {
            return Err(ProxyError::InvalidRequest(format!(
                "initialize is not allowed in state {:?}",
                self.state
            )));
        }

        self.state = SessionState::Initializing;
        let key = WorkspaceKey::new(params.mode.as_str(), &params.root_uri);
        match acquire(&self.services.pool, &key, cancel).await {
            Ok(lease) => {
                info!(workspace = %key, "Session initialized");
                self.active = Some(Active {
                    mode: params.mode,
                    rewriter: Rewriter::new(&params.root_uri),
                    lease,
                });
                self.state = SessionState::Ready;
                Ok(initialize_result())
            }
            Err(e) => {
                self.state = SessionState::Uninitialized;
                Err(e)
            }
        }
    }

    /// Fail unless the session is ready.
    ///
    /// # Errors
    ///
    /// Returns [`ProxyError::NotInitialized`] before `initialize` completes
    /// and [`ProxyError::InvalidRequest`] after close.
    pub fn ensure_ready(&self) -> Result<()> {
        self.active().map(|_| ())
    }

    fn active(&self) -> Result<&Active> {
        match (&self.state, &self.active) {
            (SessionState::Ready, Some(active)) => Ok(active),
            (SessionState::Closed, _) => {
                Err(ProxyError::InvalidRequest("session is closed".to_string()))
            }
            _ => Err(ProxyError::NotInitialized),
        }
    }

    /// Where the symbol at `params` is defined.
    ///
    /// # Errors
    ///
    /// Returns [`ProxyError::NotFound`] when there is no definition,
    /// including when a cross-repository definition cannot be followed.
    pub async fn definition(
        &self,
        params: &PositionParams,
        cancel: &CancellationToken,
    ) -> Result<Vec<Location>> {
        let active = self.active()?;
        let local = self.localize(active, params)?;
        self.definition_at(active, &local, cancel).await
    }

    /// Hover information for the symbol at `params`, with its definition
    /// when one can be found.
    ///
    /// # Errors
    ///
    /// Returns an error if the session is not ready, the position is
    /// invalid, or the backend call fails.
    pub async fn hover(
        &self,
        params: &PositionParams,
        cancel: &CancellationToken,
    ) -> Result<Option<HoverResult>> {
        let active = self.active()?;
        let local = self.localize(active, params)?;

        let result = active
            .lease
            .call("textDocument/hover", position_params(&local), cancel)
            .await?;
        if result.is_null() {
            return Ok(None);
        }
        let hover: lsp_types::Hover = serde_json::from_value(result).map_err(|e| {
            ProxyError::TransientCommunication(format!("malformed hover from backend: {e}"))
        })?;

        let location = match self.definition_at(active, &local, cancel).await {
            Ok(locations) => locations
                .first()
                .map(WireLocation::try_from)
                .transpose()?,
            Err(ProxyError::Cancelled) => return Err(ProxyError::Cancelled),
            Err(e) => {
                debug!(kind = e.kind(), error = %e, "Hover without definition");
                None
            }
        };

        Ok(Some(HoverResult {
            contents: hover.contents,
            range: hover.range,
            location,
        }))
    }

    /// Release the workspace backend and stop serving.
    pub fn close(&mut self) {
        if let Some(active) = self.active.take() {
            debug!(workspace = %active.lease.key(), "Session closed");
        }
        self.state = SessionState::Closed;
    }

    fn localize(&self, active: &Active, params: &PositionParams) -> Result<LocalPosition> {
        let document = params.document(active.rewriter.root())?;
        Ok(active.rewriter.request_to_local(
            &document,
            params.position.line,
            params.position.character,
        )?)
    }

    async fn definition_at(
        &self,
        active: &Active,
        local: &LocalPosition,
        cancel: &CancellationToken,
    ) -> Result<Vec<Location>> {
        let result = active
            .lease
            .call("textDocument/definition", position_params(local), cancel)
            .await?;

        match BackendDefinition::decode(result)? {
            BackendDefinition::NotFound => Err(ProxyError::definition_not_found()),
            BackendDefinition::Found(targets) => {
                qualify(&*active.lease, &active.rewriter, targets).await
            }
            BackendDefinition::External {
                package,
                name,
                revision,
            } => {
                debug!(
                    package = %package,
                    name = %name,
                    revision = ?revision,
                    "Following cross-repository definition"
                );
                self.cross_repository(&active.mode, &package, &name, revision, cancel)
                    .await
            }
        }
    }

    async fn cross_repository(
        &self,
        mode: &str,
        package: &str,
        name: &str,
        revision: Option<String>,
        cancel: &CancellationToken,
    ) -> Result<Vec<Location>> {
        let swallow = |stage: &'static str, err: ProxyError| {
            if err == ProxyError::Cancelled {
                return err;
            }
            warn!(
                stage,
                package,
                name,
                kind = err.kind(),
                error = %err,
                "Cross-repository definition failed"
            );
            ProxyError::definition_not_found()
        };

        let descriptor = self
            .services
            .resolver
            .resolve(package, cancel)
            .await
            .map_err(|e| swallow("resolve", e.into()))?;

        // A pinned descriptor wins over the version the backend read from.
        let revision = descriptor
            .revision
            .clone()
            .or(revision)
            .or_else(|| self.services.revisions.default_revision(&descriptor));
        let root = RepoUri::git(descriptor.repository(), revision);
        let key = WorkspaceKey::new(mode, &root);

        let lease = acquire(&self.services.pool, &key, cancel)
            .await
            .map_err(|e| swallow("acquire", e))?;

        let params = json!({
            "package": package,
            "name": name,
            "dir": descriptor.repo_dir,
        });
        let result = lease.call(XDEFINITION, params, cancel).await?;
        let locations = match BackendDefinition::decode(result)? {
            BackendDefinition::Found(targets) => {
                qualify(&*lease, &Rewriter::new(&root), targets).await
            }
            _ => Err(ProxyError::definition_not_found()),
        };
        drop(lease);
        locations
    }
}

async fn acquire(
    pool: &ConnectionPool,
    key: &WorkspaceKey,
    cancel: &CancellationToken,
) -> Result<Lease> {
    tokio::select! {
        biased;
        () = cancel.cancelled() => Err(ProxyError::Cancelled),
        lease = pool.acquire(key) => Ok(lease?),
    }
}

fn position_params(local: &LocalPosition) -> Value {
    json!({
        "textDocument": { "uri": local_file_uri(&local.path) },
        "position": { "line": local.line, "character": local.character },
    })
}

/// Turn backend-local targets into qualified locations.
async fn qualify(
    connection: &dyn BackendConnection,
    rewriter: &Rewriter,
    targets: Vec<LocalTarget>,
) -> Result<Vec<Location>> {
    let mut locations = Vec::with_capacity(targets.len());
    for target in targets {
        let local = match target {
            LocalTarget::Position(local) => local,
            LocalTarget::Span {
                path,
                offset,
                length,
            } => {
                let text = connection.read_file(&path).await?;
                Rewriter::span_to_local(&path, &text, offset, length).map_err(|e| {
                    ProxyError::TransientCommunication(format!("backend returned {e}"))
                })?
            }
        };
        let location = rewriter.to_global(&local).map_err(|e| {
            ProxyError::TransientCommunication(format!("backend returned {e}"))
        })?;
        locations.push(location);
    }
    if locations.is_empty() {
        return Err(ProxyError::definition_not_found());
    }
    Ok(locations)
}
