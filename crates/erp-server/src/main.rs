// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! ERP feature flag server binary.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use erp_server::{create_app_state, create_router, load_seed};
use erp_server_config::{BusBackend, ServerConfig};
use erp_server_flags::{InMemoryBus, InMemoryFlagStore, InvalidationBus, RedisBus};
use tokio_util::sync::CancellationToken;
use tower_http::{
	cors::{Any, CorsLayer},
	trace::TraceLayer,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// ERP feature flag server - evaluation API and realtime flag stream.
#[derive(Parser, Debug)]
#[command(name = "erp-server", about = "ERP feature flag server", version)]
struct Args {
	/// Path to a TOML config file (defaults to /etc/erp/server.toml)
	#[arg(long, env = "ERP_SERVER_CONFIG")]
	config: Option<PathBuf>,

	/// JSON seed file with flags and overrides; overrides flags.seed_file
	#[arg(long)]
	seed: Option<PathBuf>,

	#[command(subcommand)]
	command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
	/// Show version information
	Version,
	/// Load and validate configuration, then exit
	CheckConfig,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
	let args = Args::parse();

	if let Some(Command::Version) = args.command {
		println!("erp-server version: {}", env!("CARGO_PKG_VERSION"));
		return Ok(());
	}

	// Load .env file if present
	dotenvy::dotenv().ok();

	let config = match &args.config {
		Some(path) => erp_server_config::load_config_with_file(path)?,
		None => erp_server_config::load_config()?,
	};

	init_tracing(&config);

	if let Some(Command::CheckConfig) = args.command {
		println!("{config:#?}");
		return Ok(());
	}

	tracing::info!(
		host = %config.http.host,
		port = config.http.port,
		bus = %config.bus.backend,
		"starting erp-server"
	);

	let store = match args.seed.as_ref().or(config.flags.seed_file.as_ref()) {
		Some(path) => Arc::new(InMemoryFlagStore::from_seed(load_seed(path)?)),
		None => {
			tracing::warn!("No seed file configured, starting with an empty flag store");
			Arc::new(InMemoryFlagStore::new())
		}
	};

	let bus = create_bus(&config)?;
	let state = create_app_state(store, bus.clone(), &config);

	let shutdown = CancellationToken::new();
	let cache_listener = state.start_background(shutdown.clone())?;
	let hub = state.hub.clone();

	let app = create_router(state)
		.layer(TraceLayer::new_for_http())
		.layer(
			CorsLayer::new()
				.allow_origin(Any)
				.allow_methods(Any)
				.allow_headers(Any),
		);

	let addr = config.socket_addr();
	tracing::info!("listening on {}", addr);

	let listener = tokio::net::TcpListener::bind(&addr).await?;

	tokio::select! {
		result = axum::serve(listener, app) => {
			if let Err(e) = result {
				tracing::error!(error = %e, "Server error");
			}
		}
		_ = tokio::signal::ctrl_c() => {
			tracing::info!("Received shutdown signal");
		}
	}

	tracing::info!("Stopping broadcast hub...");
	hub.shutdown().await;
	shutdown.cancel();
	if let Some(task) = cache_listener {
		if let Err(e) = task.await {
			tracing::warn!(error = %e, "Cache listener task failed");
		}
	}
	if let Err(e) = bus.close().await {
		tracing::warn!(error = %e, "Failed to close invalidation bus");
	}

	tracing::info!("Server shutdown complete");
	Ok(())
}

fn init_tracing(config: &ServerConfig) {
	let json = config.logging.json;
	tracing_subscriber::registry()
		.with(
			tracing_subscriber::EnvFilter::try_from_default_env()
				.unwrap_or_else(|_| config.logging.level.clone().into()),
		)
		.with(json.then(|| tracing_subscriber::fmt::layer().json()))
		.with((!json).then(tracing_subscriber::fmt::layer))
		.init();
}

fn create_bus(config: &ServerConfig) -> Result<Arc<dyn InvalidationBus>, Box<dyn std::error::Error>> {
	match config.bus.backend {
		BusBackend::Memory => Ok(Arc::new(InMemoryBus::with_defaults())),
		BusBackend::Redis => {
			let url = config
				.bus
				.redis_url
				.as_deref()
				.ok_or("bus.redis_url is required for the redis backend")?;
			tracing::info!(channel = %config.bus.channel, "Using redis invalidation bus");
			Ok(Arc::new(RedisBus::new(url, config.bus.channel.clone())?))
		}
	}
}
