mod allowlist;
mod config;
mod edit;
mod error;
mod fs;
mod protocol;
mod sandbox;
mod search;
mod server;
mod workspace;

use anyhow::Result;
use tracing::warn;

#[tokio::main]
async fn main() -> Result<()> {
	let config = config::load_config()?;
	server::init_tracing(&config);
	for diagnostic in &config.diagnostics {
		warn!("{}", diagnostic);
	}
	let result = server::run(config).await;
	opentelemetry::global::shutdown_tracer_provider();
	result
}
