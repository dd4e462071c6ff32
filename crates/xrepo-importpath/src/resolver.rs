//! The import path resolver: static table, known hosts, then discovery.

use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::cache::{DEFAULT_CAPACITY, DEFAULT_TTL, TtlCache};
use crate::descriptor::RepositoryDescriptor;
use crate::discovery::{
    DEFAULT_MAX_PREFIX_ATTEMPTS, DEFAULT_REQUEST_TIMEOUT, Discovery, Fetcher, HttpFetcher,
};
use crate::error::Result;
use crate::known_host::match_known_host;
use crate::path::validate;
use crate::static_table::StaticTable;

/// Revision reported for standard-distribution packages when none is configured.
pub const DEFAULT_STDLIB_REVISION: &str = "HEAD";

/// Tunables for a [`Resolver`].
#[derive(Debug, Clone)]
pub struct ResolverOptions {
    /// Revision reported for standard-distribution packages.
    pub stdlib_revision: String,
    /// How long a successful resolution stays cached.
    pub cache_ttl: Duration,
    /// Maximum number of cached resolutions.
    pub cache_capacity: usize,
    /// Timeout for each discovery request.
    pub request_timeout: Duration,
    /// Maximum number of prefixes tried per import path.
    pub max_prefix_attempts: usize,
}

impl Default for ResolverOptions {
    fn default() -> Self {
        Self {
            stdlib_revision: DEFAULT_STDLIB_REVISION.to_string(),
            cache_ttl: DEFAULT_TTL,
            cache_capacity: DEFAULT_CAPACITY,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            max_prefix_attempts: DEFAULT_MAX_PREFIX_ATTEMPTS,
        }
    }
}

/// Resolves import paths to [`RepositoryDescriptor`]s, memoizing successes.
///
/// Cheap to share behind an `Arc`; all state is internally synchronized.
pub struct Resolver {
    table: StaticTable,
    fetcher: Arc<dyn Fetcher>,
    cache: TtlCache<String, RepositoryDescriptor>,
    max_prefix_attempts: usize,
}

impl Resolver {
    /// Create a resolver that discovers vanity paths over HTTP.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be constructed.
    pub fn new(options: ResolverOptions) -> Result<Self> {
        let fetcher = HttpFetcher::new(options.request_timeout)?;
        Ok(Self::with_fetcher(options, Arc::new(fetcher)))
    }

    /// Create a resolver over a custom [`Fetcher`].
    #[must_use]
    pub fn with_fetcher(options: ResolverOptions, fetcher: Arc<dyn Fetcher>) -> Self {
        Self {
            table: StaticTable::new(options.stdlib_revision),
            fetcher,
            cache: TtlCache::new(options.cache_capacity, options.cache_ttl),
            max_prefix_attempts: options.max_prefix_attempts,
        }
    }

    /// Resolve `import_path` to the repository that defines it.
    ///
    /// Results are cached under the exact import path, so two sub-packages of
    /// one project are cached separately.
    ///
    /// # Errors
    ///
    /// Returns the resolver taxonomy from [`crate::Error`]: malformed input,
    /// ambiguous or mismatched discovery tags, nothing found, or cancellation.
    pub async fn resolve(
        &self,
        import_path: &str,
        cancel: &CancellationToken,
    ) -> Result<RepositoryDescriptor> {
        validate(import_path)?;

        if let Some(hit) = self.cache.get(&import_path.to_string()) {
            trace!(import_path, "Resolver cache hit");
            return Ok(hit);
        }

        let descriptor = self.resolve_uncached(import_path, cancel).await?;
        debug!(
            import_path,
            project_root = %descriptor.project_root,
            clone_url = %descriptor.clone_url,
            vcs = %descriptor.vcs,
            "Resolved import path"
        );
        self.cache.insert(import_path.to_string(), descriptor.clone());
        Ok(descriptor)
    }

    async fn resolve_uncached(
        &self,
        import_path: &str,
        cancel: &CancellationToken,
    ) -> Result<RepositoryDescriptor> {
        if let Some(descriptor) = self.table.lookup(import_path)? {
            return Ok(descriptor);
        }
        if let Some(descriptor) = match_known_host(import_path)? {
            return Ok(descriptor);
        }
        Discovery::new(self.fetcher.as_ref(), self.max_prefix_attempts)
            .resolve(import_path, cancel)
            .await
    }

    /// The static table consulted before any network access.
    #[must_use]
    pub fn static_table(&self) -> &StaticTable {
        &self.table
    }

    /// Number of cached resolutions.
    #[must_use]
    pub fn cached(&self) -> usize {
        self.cache.len()
    }
}
