//! Import path to repository resolution.
//!
//! Given nothing but an import path string such as `fmt`,
//! `github.com/gorilla/mux/middleware` or `alice.org/pkg/sub`, this crate
//! discovers which version-control repository defines the package and where
//! inside that repository the package lives.
//!
//! Resolution tries, in order:
//!
//! 1. a static table for the standard distribution and a few well-known
//!    redirects (no I/O),
//! 2. recognised hosting patterns such as `github.com/owner/repo` (no I/O),
//! 3. dynamic discovery: `<meta name="go-import">` tags scraped from the
//!    `<head>` of `https://<prefix>?go-get=1`, longest prefix first.
//!
//! Successful resolutions are memoized in a [`TtlCache`] keyed by the exact
//! import path.
//!
//! ```no_run
//! use tokio_util::sync::CancellationToken;
//! use xrepo_importpath::{Resolver, ResolverOptions};
//!
//! # async fn example() -> xrepo_importpath::Result<()> {
//! let resolver = Resolver::new(ResolverOptions::default())?;
//! let descriptor = resolver
//!     .resolve("golang.org/x/net/html", &CancellationToken::new())
//!     .await?;
//! assert_eq!(descriptor.project_root, "golang.org/x/net");
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod cache;
pub mod descriptor;
pub mod discovery;
pub mod error;
pub mod known_host;
pub mod meta;
pub mod resolver;
pub mod static_table;

mod path;

pub use cache::TtlCache;
pub use descriptor::{RepositoryDescriptor, VcsKind};
pub use discovery::{Attempt, FetchResponse, Fetcher, HttpFetcher};
pub use error::{Error, Result};
pub use resolver::{DEFAULT_STDLIB_REVISION, Resolver, ResolverOptions};
pub use static_table::StaticTable;
