//! xrepo CLI binary.

use anyhow::Result;
use tracing_subscriber::EnvFilter;
use xrepo::cli::Cli;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse_args();

    // Can be controlled via RUST_LOG environment variable
    // Example: RUST_LOG=xrepo=debug,xrepo_importpath=trace xrepo serve
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(cli.default_log_filter())),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    tracing::debug!("Starting xrepo");

    cli.execute().await?;

    tracing::debug!("xrepo completed successfully");
    Ok(())
}
