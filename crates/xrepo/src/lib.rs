//! xrepo - cross-repository code intelligence proxy.
//!
//! Clients talk LSP-flavoured JSON-RPC to the proxy about documents named by
//! repository URIs (`git://github.com/gorilla/mux?0a192a19#mux.go`). The
//! proxy runs one language server per `(mode, repository@revision)`
//! workspace, translates positions between global locations and the
//! backend's local files, and when a definition lands in another
//! repository's package it resolves that package's import path, leases a
//! backend for the owning repository, and answers from there.
//!
//! The building blocks are usable on their own:
//!
//! - [`uri`] and [`rewrite`]: repository URIs and location translation
//! - [`pool`]: shared, lazily started backend connections
//! - [`session`]: one client's lifecycle and the cross-repository lookup
//! - [`rpc`]: the framed JSON-RPC server

#![forbid(unsafe_code)]

pub mod app;
pub mod backend;
pub mod cli;
pub mod config;
pub mod error;
pub mod pool;
pub mod protocol;
pub mod rewrite;
pub mod rpc;
pub mod session;
pub mod uri;

pub use error::{ProxyError, Result};
pub use pool::{ConnectionPool, Lease, PoolError, PoolStats};
pub use rewrite::{LocalPosition, Location, Rewriter};
pub use session::{DefaultRevision, FixedRevision, Session, SessionServices, SessionState};
pub use uri::{RepoUri, WorkspaceKey};
