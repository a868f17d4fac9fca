//! C6 — HTTP surface. Routes are grouped by auth scheme: the chat surface
//! (API key only), the admin surface (bearer OR session), and the
//! session-auth panel endpoints that issue the session cookie itself.

pub mod admin;
pub mod auth;
pub mod chat;
pub mod panel;
pub mod registrar;

use std::sync::Arc;

use axum::Router;
use axum::middleware;
use axum::routing::{get, post};
use tower_http::trace::TraceLayer;

use crate::account::pool::AccountPool;
use crate::config::Config;
use crate::pipeline::Pipeline;
use crate::stats::Stats;
use crate::upstream::UpstreamClient;

pub struct AppState {
	pub pool: Arc<AccountPool>,
	pub upstream: Arc<UpstreamClient>,
	pub pipeline: Arc<Pipeline>,
	pub stats: Arc<Stats>,
	pub config: Arc<Config>,
	pub session_store: Arc<dyn auth::SessionStore>,
}

/// Build the full router. The WebSocket cluster endpoint named in §4.6 is
/// deliberately not wired here: cluster "server" mode is outside this
/// core's scope (spec.md §1).
pub fn build_router(state: Arc<AppState>) -> Router {
	let chat_routes = Router::new()
		.route("/v1/chat/completions", post(chat::openai_completions))
		.route("/v1/messages", post(chat::claude_messages))
		.route("/v1beta/models/{model}:generateContent", post(chat::gemini_generate))
		.route(
			"/v1beta/models/{model}:streamGenerateContent",
			post(chat::gemini_stream_generate),
		)
		.route("/v1/models", get(chat::list_models_openai))
		.route("/v1beta/models", get(chat::list_models_gemini))
		.route("/v1beta/models/{model}", get(chat::get_model_gemini))
		.layer(middleware::from_fn_with_state(Arc::clone(&state), auth::require_api_key));

	let admin_routes = Router::new()
		.route("/admin/status", get(admin::status))
		.route("/admin/stats", get(admin::stats))
		.route("/admin/ip", get(admin::ip_stats))
		.route("/admin/refresh", post(admin::refresh))
		.route("/admin/force-refresh", post(admin::force_refresh))
		.route("/admin/register", post(admin::register))
		.route("/admin/reload-config", post(admin::reload_config))
		.route("/admin/config/cooldown", post(admin::set_cooldown))
		.route("/admin/config/browser-refresh", post(admin::set_browser_refresh))
		.route("/admin/accounts", get(admin::list_accounts))
		.route("/admin/pool-files", get(admin::pool_files))
		.route("/admin/pool-files/export", get(admin::pool_files_export))
		.route("/admin/pool-files/import", post(admin::pool_files_import))
		.route("/admin/pool-files/delete-invalid/preview", post(admin::delete_invalid_preview))
		.route("/admin/pool-files/delete-invalid/execute", post(admin::delete_invalid_execute))
		.route("/admin/registrar/upload-account", post(registrar::upload_account))
		.route("/admin/registrar/refresh-tasks/claim", post(registrar::claim_tasks))
		.route("/admin/registrar/refresh-tasks/fail", post(registrar::fail_task))
		.route("/admin/registrar/metrics", get(registrar::metrics))
		.route("/admin/registrar/trigger-register", post(registrar::trigger_register))
		.route("/admin/logs/stream", get(admin::logs_stream))
		.layer(middleware::from_fn_with_state(Arc::clone(&state), auth::require_admin));

	let panel_routes = Router::new()
		.route("/admin/panel/login", post(panel::login))
		.route("/admin/panel/logout", post(panel::logout))
		.route("/admin/panel/change-password", post(panel::change_password))
		.route("/admin/panel/me", get(panel::me));

	Router::new()
		.merge(chat_routes)
		.merge(admin_routes)
		.merge(panel_routes)
		.layer(TraceLayer::new_for_http())
		.with_state(state)
}
