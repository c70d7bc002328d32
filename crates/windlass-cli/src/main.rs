//! Windlass CLI entry point

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = windlass_cli::Cli::parse();

    // Logs go to stderr so command output stays parseable
    let filter = tracing_subscriber::EnvFilter::new(
        std::env::var("RUST_LOG").unwrap_or_else(|_| "windlass=info,windlass_context=info".into()),
    );
    let registry = tracing_subscriber::registry().with(filter);
    if cli.json {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }

    tracing::debug!("Starting {} v{}", windlass_cli::crate_name(), env!("CARGO_PKG_VERSION"));

    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupted, cancelling");
            on_interrupt.cancel();
        }
    });

    let output = windlass_cli::run(cli, cancel).await?;
    println!("{output}");
    Ok(())
}
