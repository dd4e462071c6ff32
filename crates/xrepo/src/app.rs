//! Wiring of the proxy's long-lived services from configuration.

use std::fmt;
use std::sync::Arc;
use tokio::process::Command;
use tracing::{debug, info};
use xrepo_importpath::{DEFAULT_STDLIB_REVISION, Resolver};

use crate::backend::{
    BackendRegistry, ConfiguredProvider, GitMaterializer, GoplsProvider, LspBackend, LspProvider,
    Materializer,
};
use crate::config::{BackendConfig, ProxyConfig};
use crate::pool::ConnectionPool;
use crate::session::{FixedRevision, SessionServices};

/// Running proxy services.
pub struct App {
    /// Effective configuration.
    pub config: ProxyConfig,
    /// Shared by every client session.
    pub services: Arc<SessionServices>,
}

impl fmt::Debug for App {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("App")
            .field("listen", &self.config.listen)
            .field("services", &self.services)
            .finish()
    }
}

impl App {
    /// Build the resolver, backends and pool described by `config`.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid or the resolver's
    /// HTTP client cannot be created.
    pub async fn from_config(config: ProxyConfig) -> anyhow::Result<Self> {
        config.validate()?;

        let resolver = Arc::new(build_resolver(&config).await?);

        let cache_dir = config.cache_dir();
        debug!(cache_dir = %cache_dir.display(), "Workspace checkout directory");
        let materializer: Arc<dyn Materializer> = Arc::new(GitMaterializer::new(cache_dir));

        let mut registry = BackendRegistry::new();
        for (mode, backend) in &config.backends {
            let provider = build_provider(mode, backend).await;
            registry.register(Arc::new(LspBackend::new(
                mode.clone(),
                provider,
                Arc::clone(&materializer),
            )));
        }
        info!(modes = ?registry.modes(), "Registered backends");

        let pool = ConnectionPool::new(registry, config.idle_timeout());
        let revisions = match &config.workspace.default_revision {
            Some(revision) => FixedRevision::new(revision.clone()),
            None => FixedRevision::unspecified(),
        };
        let services =
            Arc::new(SessionServices::new(resolver, pool).with_revisions(Arc::new(revisions)));

        Ok(Self { config, services })
    }

    /// The backend connection pool.
    #[must_use]
    pub fn pool(&self) -> &ConnectionPool {
        &self.services.pool
    }
}

/// Build only the resolver, for commands that never talk to a backend.
///
/// # Errors
///
/// Returns an error if the resolver's HTTP client cannot be created.
pub async fn build_resolver(config: &ProxyConfig) -> anyhow::Result<Resolver> {
    let stdlib_revision = match &config.resolver.stdlib_revision {
        Some(revision) => revision.clone(),
        None => detect_stdlib_revision().await,
    };
    info!(stdlib_revision = %stdlib_revision, "Standard library revision");
    Ok(Resolver::new(config.resolver_options(stdlib_revision))?)
}

/// The installed Go toolchain's version tag, e.g. `go1.7.1`, or `HEAD`
/// without a toolchain.
async fn detect_stdlib_revision() -> String {
    match Command::new("go").args(["env", "GOVERSION"]).output().await {
        Ok(output) if output.status.success() => {
            let version = String::from_utf8_lossy(&output.stdout).trim().to_string();
            // Development toolchains report e.g. `devel go1.22-abc123`.
            if version.starts_with("go") && !version.contains(' ') {
                return version;
            }
            debug!(version = %version, "Unusable Go version; using default branch");
        }
        Ok(output) => debug!(status = %output.status, "go env GOVERSION failed"),
        Err(e) => debug!(error = %e, "go toolchain not available"),
    }
    DEFAULT_STDLIB_REVISION.to_string()
}

async fn build_provider(mode: &str, backend: &BackendConfig) -> Arc<dyn LspProvider> {
    let language_id = backend.language_id.as_deref().unwrap_or(mode);
    if language_id == "go" {
        let provider = GoplsProvider::default()
            .with_command(backend.command.clone(), backend.args.clone())
            .detect()
            .await;
        Arc::new(provider)
    } else {
        Arc::new(ConfiguredProvider::new(
            backend.command.clone(),
            backend.args.clone(),
            language_id,
        ))
    }
}
