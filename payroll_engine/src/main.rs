//! Entry point for the payroll engine binary.
//!
//! Running this binary starts an HTTP server exposing attendance
//! ingestion, payroll runs and the signature-lock workflow.  Settings
//! come from `PAYROLL_*` environment variables (see
//! [`payroll_engine::config::EngineConfig`]); log verbosity from
//! `RUST_LOG`.

use payroll_engine::config::EngineConfig;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "payroll_engine=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = EngineConfig::from_env();
    tracing::info!(
        "Starting payroll engine v{} (rules from {})",
        env!("CARGO_PKG_VERSION"),
        config.rules_dir.display()
    );
    if let Err(err) = payroll_engine::api::serve(&config).await {
        tracing::error!("Error running server: {:#}", err);
        std::process::exit(1);
    }
}
