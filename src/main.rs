//! Process entry point: CLI parsing, wiring the account pool, refresh
//! engine, upstream client, and HTTP surface together, then serving until
//! shutdown (§6 CLI, §4.5 config load).

use std::sync::Arc;

use b2a_gateway::account::pool::AccountPool;
use b2a_gateway::config::Config;
use b2a_gateway::http::AppState;
use b2a_gateway::http::auth::InMemorySessionStore;
use b2a_gateway::pipeline::Pipeline;
use b2a_gateway::stats::Stats;
use b2a_gateway::upstream::UpstreamClient;
use clap::Parser;
use tracing::{error, info};

#[derive(Debug, Parser)]
#[command(name = "b2a-gateway", about = "OpenAI/Claude/Gemini-compatible gateway over pooled OAuth accounts")]
struct Cli {
	/// Verbose logging and human-readable log format.
	#[arg(long)]
	debug: bool,
	/// Run a single refresh sweep and exit instead of serving.
	#[arg(long)]
	once: bool,
	/// Run the refresh engine continuously without serving HTTP.
	#[arg(long)]
	auto: bool,
	/// Force-refresh one account (or all, if no email given) and exit.
	#[arg(long, value_name = "EMAIL", num_args = 0..=1, default_missing_value = "")]
	refresh: Option<String>,
	/// Path to the JSON config file.
	#[arg(long, default_value = "./config.json")]
	config: String,
}

#[tokio::main]
async fn main() {
	let cli = Cli::parse();
	b2a_gateway::telemetry::init(cli.debug);

	if let Err(e) = run(cli).await {
		error!(error = %e, "startup failed");
		std::process::exit(1);
	}
}

async fn run(cli: Cli) -> anyhow::Result<()> {
	let config = Arc::new(Config::load(&cli.config)?);
	let live = config.live.load();

	let pool = Arc::new(AccountPool::new(
		config.startup.data_dir.clone(),
		live.max_fail,
		live.daily_limit,
		live.use_cooldown_secs,
		live.auto_delete_on_401,
		live.external_refresh_mode,
	));
	pool.load()?;
	drop(live);

	let upstream = Arc::new(UpstreamClient::new());

	if let Some(email) = cli.refresh {
		if email.is_empty() {
			pool.force_refresh_all();
			info!("force-refreshed all ready accounts");
		} else if let Some(mut account) = pool.get(&email) {
			account.get_jwt(&upstream).await?;
			pool.mark_ready(&email);
			info!(email = %account.mask_email(), "refreshed account");
		} else {
			anyhow::bail!("no such account: {email}");
		}
		return Ok(());
	}

	let refresh_engine = Arc::new(b2a_gateway::account::refresh::RefreshEngine::new(
		Arc::clone(&pool),
		Arc::clone(&upstream),
		config.live.load().external_refresh_mode,
	));

	if cli.once {
		let promoted = refresh_engine.run_once().await;
		info!(promoted, "single refresh sweep complete");
		return Ok(());
	}

	let refresh_handle = Arc::clone(&refresh_engine).spawn();

	if cli.auto {
		info!("running refresh engine only (--auto), not serving HTTP");
		refresh_handle.await?;
		return Ok(());
	}

	let _watcher = config.watch().ok();

	let pipeline = Arc::new(Pipeline::new(Arc::clone(&pool), Arc::clone(&upstream)));
	let stats = Arc::new(Stats::new());
	let session_store = Arc::new(InMemorySessionStore::new(
		std::env::var("POOL_SERVER_SECRET").unwrap_or_else(|_| "change-me".to_string()),
	));

	let state = Arc::new(AppState {
		pool,
		upstream,
		pipeline,
		stats,
		config: Arc::clone(&config),
		session_store,
	});

	let app = b2a_gateway::http::build_router(state);
	let listener = tokio::net::TcpListener::bind(&config.startup.listen_addr).await?;
	info!(addr = %config.startup.listen_addr, "listening");

	axum::serve(listener, app)
		.with_graceful_shutdown(shutdown_signal())
		.await?;

	refresh_handle.abort();
	Ok(())
}

async fn shutdown_signal() {
	let ctrl_c = async {
		tokio::signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
	};
	#[cfg(unix)]
	let terminate = async {
		tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
			.expect("failed to install SIGTERM handler")
			.recv()
			.await;
	};
	#[cfg(not(unix))]
	let terminate = std::future::pending::<()>();

	tokio::select! {
		_ = ctrl_c => {},
		_ = terminate => {},
	}
}
