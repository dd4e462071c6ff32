//! CLI argument parsing and command dispatch.
//!
//! # Commands
//!
//! - `serve`: run the proxy, accepting JSON-RPC clients over TCP
//! - `resolve`: resolve import paths to repositories and print them
//!
//! # Example
//!
//! ```bash
//! xrepo serve --listen 127.0.0.1:4389
//! xrepo resolve golang.org/x/net/html github.com/gorilla/mux --json
//! ```

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use std::net::SocketAddr;
use std::path::PathBuf;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use xrepo_importpath::RepositoryDescriptor;

use crate::app::{App, build_resolver};
use crate::config::ProxyConfig;
use crate::rpc;

/// xrepo - cross-repository code intelligence proxy
///
/// Sits in front of per-repository language servers and follows
/// go-to-definition and hover into the repositories that define the
/// referenced packages.
#[derive(Parser, Debug)]
#[command(name = "xrepo")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Log at debug level unless `RUST_LOG` says otherwise
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Configuration file (defaults to ./xrepo.yaml when present)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands
#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Run the proxy
    ///
    /// Serves `initialize`, `textDocument/definition` and
    /// `textDocument/hover` until interrupted.
    Serve(ServeArgs),

    /// Resolve import paths
    ///
    /// Prints the repository, revision and directory each import path maps
    /// to. Exits with an error if any path fails to resolve.
    Resolve(ResolveArgs),
}

/// Arguments for the `serve` command
#[derive(Parser, Debug, Clone)]
pub struct ServeArgs {
    /// Address to listen on, overriding the configuration
    #[arg(short, long)]
    pub listen: Option<SocketAddr>,
}

/// Arguments for the `resolve` command
#[derive(Parser, Debug, Clone)]
pub struct ResolveArgs {
    /// Import paths to resolve
    #[arg(required = true, value_name = "IMPORT_PATH")]
    pub import_paths: Vec<String>,

    /// Output in JSON format for programmatic use
    #[arg(long)]
    pub json: bool,
}

impl Cli {
    /// Parse CLI arguments from command line
    #[must_use]
    pub fn parse_args() -> Self {
        <Self as Parser>::parse()
    }

    /// Parse CLI arguments from an iterator (for testing)
    ///
    /// # Errors
    ///
    /// Returns the clap error for invalid arguments.
    pub fn try_parse_from<I, T>(iter: I) -> std::result::Result<Self, clap::Error>
    where
        I: IntoIterator<Item = T>,
        T: Into<std::ffi::OsString> + Clone,
    {
        <Self as Parser>::try_parse_from(iter)
    }

    /// Default log filter for this invocation.
    #[must_use]
    pub fn default_log_filter(&self) -> &'static str {
        if self.verbose {
            "xrepo=debug,xrepo_importpath=debug"
        } else {
            "xrepo=info,xrepo_importpath=info"
        }
    }

    /// Execute the CLI command
    ///
    /// # Errors
    ///
    /// Returns an error if configuration fails to load or the command fails.
    pub async fn execute(&self) -> Result<()> {
        let config = ProxyConfig::load_or_default(self.config.as_deref())
            .await
            .context("failed to load configuration")?;

        match &self.command {
            Commands::Serve(args) => serve(config, args).await,
            Commands::Resolve(args) => resolve(&config, args).await,
        }
    }
}

async fn serve(mut config: ProxyConfig, args: &ServeArgs) -> Result<()> {
    if let Some(listen) = args.listen {
        config.listen = listen;
    }
    let app = App::from_config(config).await?;
    let listener = TcpListener::bind(app.config.listen)
        .await
        .with_context(|| format!("failed to listen on {}", app.config.listen))?;

    let shutdown = CancellationToken::new();
    let reaper = app.pool().spawn_reaper(app.config.reap_interval());
    let interrupt = {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => info!("Interrupted; shutting down"),
                Err(e) => warn!(error = %e, "Failed to listen for interrupt"),
            }
            shutdown.cancel();
        })
    };

    let served = rpc::serve(listener, std::sync::Arc::clone(&app.services), shutdown).await;

    interrupt.abort();
    reaper.abort();
    app.pool().shutdown_all().await;
    served.context("server failed")
}

async fn resolve(config: &ProxyConfig, args: &ResolveArgs) -> Result<()> {
    let resolver = build_resolver(config).await?;
    let cancel = CancellationToken::new();

    let mut resolved = Vec::new();
    let mut failures = 0usize;
    for import_path in &args.import_paths {
        match resolver.resolve(import_path, &cancel).await {
            Ok(descriptor) => {
                if !args.json {
                    print_descriptor(&descriptor);
                }
                resolved.push(descriptor);
            }
            Err(e) => {
                failures += 1;
                if args.json {
                    warn!(
                        import_path = %import_path,
                        kind = e.kind(),
                        error = %e,
                        "Resolution failed"
                    );
                } else {
                    eprintln!("{} {}: {}", "✗".red(), import_path.bold(), e);
                }
            }
        }
    }

    if args.json {
        println!("{}", serde_json::to_string_pretty(&resolved)?);
    }
    if failures > 0 {
        anyhow::bail!(
            "{failures} of {} import paths failed to resolve",
            args.import_paths.len()
        );
    }
    Ok(())
}

fn print_descriptor(descriptor: &RepositoryDescriptor) {
    let revision = descriptor.revision.as_deref().unwrap_or("(default branch)");
    println!("{} {}", "✓".green(), descriptor.import_path.bold());
    println!("  repository: {}", descriptor.repository().cyan());
    println!("  revision:   {revision}");
    println!("  vcs:        {}", descriptor.vcs.as_str());
    if !descriptor.repo_dir.is_empty() {
        println!("  directory:  {}", descriptor.repo_dir);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serve_accepts_listen_override() {
        let cli = Cli::try_parse_from(["xrepo", "serve", "--listen", "0.0.0.0:9999"]).unwrap();
        match cli.command {
            Commands::Serve(args) => assert_eq!(args.listen.unwrap().port(), 9999),
            Commands::Resolve(_) => panic!("expected serve"),
        }
    }

    #[test]
    fn resolve_requires_an_import_path() {
        assert!(Cli::try_parse_from(["xrepo", "resolve"]).is_err());

        let cli =
            Cli::try_parse_from(["xrepo", "resolve", "fmt", "github.com/gorilla/mux", "--json"])
                .unwrap();
        match cli.command {
            Commands::Resolve(args) => {
                assert_eq!(args.import_paths, vec!["fmt", "github.com/gorilla/mux"]);
                assert!(args.json);
            }
            Commands::Serve(_) => panic!("expected resolve"),
        }
    }

    #[test]
    fn verbose_and_config_are_global() {
        let cli = Cli::try_parse_from(["xrepo", "serve", "-v", "--config", "proxy.yaml"]).unwrap();
        assert!(cli.verbose);
        assert_eq!(cli.config, Some(PathBuf::from("proxy.yaml")));
        assert_eq!(
            cli.default_log_filter(),
            "xrepo=debug,xrepo_importpath=debug"
        );
    }
}
