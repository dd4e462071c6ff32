//! Dynamic discovery of vanity import paths over HTTP.
//!
//! Candidate URLs are produced as an ordered, finite sequence: every prefix
//! of the import path from longest to shortest, each tried over `https` and
//! then `http`. The first document carrying an applicable `go-import` tag
//! wins. If that tag's root is shorter than the import path, the document at
//! the root itself must declare the identical tag.

use async_trait::async_trait;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};
use url::Url;

use crate::descriptor::{RepositoryDescriptor, strip_scheme};
use crate::error::{Error, Result};
use crate::meta::{self, MetaImport, Selection};
use crate::path::{prefixes, remainder};

/// Default bound on how many prefixes are tried per import path.
pub const DEFAULT_MAX_PREFIX_ATTEMPTS: usize = 8;

/// Default per-request timeout.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

const USER_AGENT: &str = concat!("xrepo-importpath/", env!("CARGO_PKG_VERSION"));

/// A fetched discovery document.
#[derive(Debug, Clone)]
pub struct FetchResponse {
    /// HTTP status code.
    pub status: u16,
    /// Response body.
    pub body: String,
}

impl FetchResponse {
    /// Whether the status is 2xx.
    #[must_use]
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Fetches discovery documents.
///
/// Implemented over `reqwest` by [`HttpFetcher`]; tests substitute canned
/// pages.
#[async_trait]
pub trait Fetcher: Send + Sync {
    /// Issue a GET for `url`.
    ///
    /// A non-2xx status is a successful fetch; only transport failures are
    /// errors.
    async fn get(&self, url: &Url) -> std::result::Result<FetchResponse, String>;
}

/// [`Fetcher`] backed by a shared `reqwest` client.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
    timeout: Duration,
}

impl HttpFetcher {
    /// Build a fetcher whose requests each time out after `timeout`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Transient`] if the TLS backend cannot be initialised.
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .redirect(reqwest::redirect::Policy::limited(10))
            .build()
            .map_err(|e| Error::Transient {
                import_path: String::new(),
                message: format!("failed to build HTTP client: {e}"),
            })?;
        Ok(Self { client, timeout })
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn get(&self, url: &Url) -> std::result::Result<FetchResponse, String> {
        let response = self
            .client
            .get(url.clone())
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| e.to_string())?;
        let status = response.status().as_u16();
        let body = response.text().await.map_err(|e| e.to_string())?;
        Ok(FetchResponse { status, body })
    }
}

/// How a single candidate URL fared.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptOutcome {
    /// The request failed before a response arrived.
    Transport(String),
    /// The server answered with a non-2xx status.
    Status(u16),
    /// The document had no applicable `go-import` tag.
    NoMatchingTag,
    /// The document supplied the tag.
    Matched,
}

/// A candidate URL and what happened when it was fetched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attempt {
    /// The URL that was requested.
    pub url: String,
    /// What came back.
    pub outcome: AttemptOutcome,
}

/// Discovery URL for `prefix` over `scheme`.
///
/// A bare host gets a trailing slash so the request targets the site root.
///
/// # Errors
///
/// Returns [`Error::InvalidInput`] if the prefix does not form a valid URL.
pub fn discovery_url(scheme: &str, prefix: &str) -> Result<Url> {
    let slash = if prefix.contains('/') { "" } else { "/" };
    Url::parse(&format!("{scheme}://{prefix}{slash}?go-get=1"))
        .map_err(|e| Error::invalid(prefix, format!("not a valid discovery URL: {e}")))
}

/// Ordered candidate URLs for `import_path`, bounded to `max_prefixes` prefixes.
pub fn candidates(
    import_path: &str,
    max_prefixes: usize,
) -> impl Iterator<Item = (&str, &'static str)> {
    prefixes(import_path)
        .take(max_prefixes)
        .flat_map(|prefix| [(prefix, "https"), (prefix, "http")])
}

fn outcome_was_served(attempts: &[Attempt]) -> bool {
    attempts
        .last()
        .is_some_and(|attempt| attempt.outcome == AttemptOutcome::NoMatchingTag)
}

/// Dynamic resolver over a [`Fetcher`].
pub struct Discovery<'a> {
    fetcher: &'a dyn Fetcher,
    max_prefixes: usize,
}

impl<'a> Discovery<'a> {
    /// Create a discovery run over `fetcher`.
    #[must_use]
    pub fn new(fetcher: &'a dyn Fetcher, max_prefixes: usize) -> Self {
        Self {
            fetcher,
            max_prefixes: max_prefixes.max(1),
        }
    }

    /// Discover the repository that hosts `import_path`.
    ///
    /// # Errors
    ///
    /// - [`Error::Ambiguous`] if a document offers several distinct tags for
    ///   the longest matching root
    /// - [`Error::Mismatch`] if the document at the project root disagrees
    /// - [`Error::NotFound`] if no document offers a tag
    /// - [`Error::Cancelled`] if `cancel` fires first
    pub async fn resolve(
        &self,
        import_path: &str,
        cancel: &CancellationToken,
    ) -> Result<RepositoryDescriptor> {
        let mut attempts = Vec::new();
        let mut found: Option<(MetaImport, String)> = None;
        // A prefix whose https document was served is not retried over http.
        let mut served_over_https: Option<&str> = None;

        for (prefix, scheme) in candidates(import_path, self.max_prefixes) {
            if scheme == "http" && served_over_https == Some(prefix) {
                trace!(prefix, "Skipping http; https document was served");
                continue;
            }
            let url = discovery_url(scheme, prefix)?;
            let (outcome, selection) = self.fetch_selection(&url, prefix, cancel).await?;
            let matched = match selection {
                Selection::One(tag) => Some(tag),
                Selection::Ambiguous(tags) => {
                    return Err(Error::Ambiguous {
                        import_path: import_path.to_string(),
                        url: url.to_string(),
                        candidates: tags.iter().map(ToString::to_string).collect(),
                    });
                }
                Selection::None => None,
            };
            attempts.push(Attempt {
                url: url.to_string(),
                outcome: if matched.is_some() {
                    AttemptOutcome::Matched
                } else {
                    outcome
                },
            });
            if let Some(tag) = matched {
                found = Some((tag, url.to_string()));
                break;
            }
            if scheme == "https" && outcome_was_served(&attempts) {
                served_over_https = Some(prefix);
            }
        }

        let Some((tag, found_at)) = found else {
            return Err(Error::NotFound {
                import_path: import_path.to_string(),
                attempts,
            });
        };
        debug!(import_path, %tag, url = %found_at, "Discovered go-import tag");

        if tag.root != import_path {
            self.verify_root(import_path, &tag, &found_at, cancel).await?;
        }

        let clone_path = strip_scheme(&tag.repo_url).trim_end_matches('/');
        let dir = remainder(import_path, &tag.root);
        let resolved_host_path = if dir.is_empty() {
            clone_path.to_string()
        } else {
            format!("{clone_path}/{dir}")
        };

        Ok(RepositoryDescriptor {
            import_path: import_path.to_string(),
            project_root: tag.root,
            clone_url: tag.repo_url,
            vcs: tag.vcs.parse().unwrap_or_else(|never| match never {}),
            resolved_host_path,
            repo_dir: dir.to_string(),
            revision: None,
        })
    }

    /// Confirm that the document served at the project root declares `tag`.
    async fn verify_root(
        &self,
        import_path: &str,
        tag: &MetaImport,
        found_at: &str,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let mut attempts = Vec::new();
        for scheme in ["https", "http"] {
            let url = discovery_url(scheme, &tag.root)?;
            let (outcome, selection) = self.fetch_selection(&url, &tag.root, cancel).await?;
            match selection {
                Selection::One(root_tag) if root_tag == *tag => return Ok(()),
                Selection::One(root_tag) => {
                    return Err(Error::Mismatch {
                        import_path: import_path.to_string(),
                        found: tag.to_string(),
                        found_at: found_at.to_string(),
                        root_tag: root_tag.to_string(),
                    });
                }
                Selection::Ambiguous(tags) => {
                    return Err(Error::Ambiguous {
                        import_path: import_path.to_string(),
                        url: url.to_string(),
                        candidates: tags.iter().map(ToString::to_string).collect(),
                    });
                }
                Selection::None => {
                    let served = outcome == AttemptOutcome::NoMatchingTag;
                    attempts.push(Attempt {
                        url: url.to_string(),
                        outcome,
                    });
                    if served {
                        break;
                    }
                }
            }
        }
        Err(Error::NotFound {
            import_path: tag.root.clone(),
            attempts,
        })
    }

    /// Fetch `url` and select the tag applying to `prefix`.
    async fn fetch_selection(
        &self,
        url: &Url,
        prefix: &str,
        cancel: &CancellationToken,
    ) -> Result<(AttemptOutcome, Selection)> {
        trace!(%url, "Fetching discovery document");
        let response = tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(Error::Cancelled(prefix.to_string())),
            response = self.fetcher.get(url) => response,
        };

        match response {
            Err(e) => {
                trace!(%url, error = %e, "Discovery fetch failed");
                Ok((AttemptOutcome::Transport(e), Selection::None))
            }
            Ok(response) if !response.is_success() => {
                trace!(%url, status = response.status, "Discovery fetch returned non-success");
                Ok((AttemptOutcome::Status(response.status), Selection::None))
            }
            Ok(response) => Ok((
                AttemptOutcome::NoMatchingTag,
                meta::select(&response.body, prefix),
            )),
        }
    }
}
