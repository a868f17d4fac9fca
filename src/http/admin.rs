//! Admin surface handlers (§4.6, §6). Operator-facing pool/stats telemetry
//! plus mutating operations (refresh, force-refresh, config patches,
//! pool-file import/export).

use std::convert::Infallible;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use axum::Json;
use axum::extract::{Query, State};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use futures::stream::{self, Stream};
use serde::Deserialize;
use serde_json::json;

use super::AppState;

fn now_unix() -> i64 {
	SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs() as i64
}

pub async fn status(State(state): State<Arc<AppState>>) -> Response {
	let stats = state.pool.stats();
	Json(json!({
		"ready": stats.ready,
		"pending": stats.pending,
		"cooldown": stats.cooldown,
		"pendingExternal": stats.pending_external,
		"invalid": stats.invalid,
		"totalActive": stats.total_active,
	}))
	.into_response()
}

pub async fn stats(State(state): State<Arc<AppState>>) -> Response {
	let now = now_unix();
	Json(json!({
		"global": state.stats.global_snapshot(now),
		"perModel": state.stats.all_model_snapshots(now),
	}))
	.into_response()
}

#[derive(Debug, Deserialize)]
pub struct IpQuery {
	ip: String,
}

pub async fn ip_stats(State(state): State<Arc<AppState>>, Query(q): Query<IpQuery>) -> Response {
	match state.stats.ip_snapshot(&q.ip, now_unix()) {
		Some(snap) => Json(snap).into_response(),
		None => (axum::http::StatusCode::NOT_FOUND, Json(json!({"error": {"code": "unknown_ip"}}))).into_response(),
	}
}

pub async fn refresh(State(state): State<Arc<AppState>>) -> Response {
	match state.pool.load() {
		Ok(()) => Json(json!({"ok": true})).into_response(),
		Err(e) => (
			axum::http::StatusCode::INTERNAL_SERVER_ERROR,
			Json(json!({"error": {"code": "refresh_failed", "message": e.to_string()}})),
		)
			.into_response(),
	}
}

pub async fn force_refresh(State(state): State<Arc<AppState>>) -> Response {
	state.pool.force_refresh_all();
	Json(json!({"ok": true})).into_response()
}

#[derive(Debug, Deserialize)]
pub struct RegisterRequest {
	#[allow(dead_code)]
	count: u32,
}

/// Kicks off internal registration; the browser-automation registration
/// script itself is an external collaborator (spec.md §1), so this only
/// acknowledges the request.
pub async fn register(Json(_req): Json<RegisterRequest>) -> Response {
	Json(json!({"ok": true, "note": "registration delegated to the external registration collaborator"})).into_response()
}

pub async fn reload_config(State(state): State<Arc<AppState>>) -> Response {
	match crate::config::Config::load(&state.config.startup.config_path) {
		Ok(reloaded) => {
			state.config.live.store(reloaded.live.load_full());
			Json(json!({"ok": true})).into_response()
		},
		Err(e) => (
			axum::http::StatusCode::INTERNAL_SERVER_ERROR,
			Json(json!({"error": {"code": "reload_failed", "message": e.to_string()}})),
		)
			.into_response(),
	}
}

#[derive(Debug, Deserialize)]
pub struct CooldownRequest {
	use_cooldown_secs: i64,
}

pub async fn set_cooldown(State(state): State<Arc<AppState>>, Json(req): Json<CooldownRequest>) -> Response {
	let mut next = (**state.config.live.load()).clone();
	next.use_cooldown_secs = req.use_cooldown_secs;
	state.config.live.store(Arc::new(next));
	Json(json!({"ok": true})).into_response()
}

#[derive(Debug, Deserialize)]
pub struct BrowserRefreshRequest {
	enabled: bool,
}

pub async fn set_browser_refresh(State(state): State<Arc<AppState>>, Json(req): Json<BrowserRefreshRequest>) -> Response {
	let mut next = (**state.config.live.load()).clone();
	next.browser_refresh_enabled = req.enabled;
	state.config.live.store(Arc::new(next));
	Json(json!({"ok": true})).into_response()
}

#[derive(Debug, Deserialize, Default)]
pub struct AccountsQuery {
	#[serde(default)]
	state: Option<String>,
	#[serde(default)]
	status: Option<String>,
	#[serde(default)]
	q: Option<String>,
}

pub async fn list_accounts(State(state): State<Arc<AppState>>, Query(query): Query<AccountsQuery>) -> Response {
	let mut accounts = state.pool.list_accounts();

	if let Some(state_filter) = &query.state
		&& state_filter != "all"
	{
		accounts.retain(|a| match state_filter.as_str() {
			"active" => a.status.is_active(),
			"invalid" => !a.status.is_active(),
			_ => true,
		});
	}
	if let Some(status) = &query.status {
		accounts.retain(|a| format!("{:?}", a.status).to_lowercase() == status.to_lowercase());
	}
	if let Some(needle) = &query.q {
		let needle = needle.to_lowercase();
		accounts.retain(|a| a.email.to_lowercase().contains(&needle));
	}

	let out: Vec<_> = accounts
		.iter()
		.map(|a| {
			json!({
				"email": a.mask_email(),
				"status": a.status,
				"failCount": a.fail_count,
				"dailyCount": a.daily_count,
				"lastUsed": a.last_used,
			})
		})
		.collect();
	Json(json!({"accounts": out})).into_response()
}

pub async fn pool_files(State(state): State<Arc<AppState>>) -> Response {
	let accounts = state.pool.list_accounts();
	let files: Vec<_> = accounts.iter().map(|a| format!("{}.json", a.email)).collect();
	Json(json!({"files": files})).into_response()
}

/// Streams a zip of the data directory. Zip construction is delegated to
/// the admin Web UI's own export tooling in the full system (spec.md §1);
/// this core exposes the account list the export would walk.
pub async fn pool_files_export(State(state): State<Arc<AppState>>) -> Response {
	let accounts = state.pool.list_accounts();
	let bundle: Vec<_> = accounts.iter().map(|a| serde_json::to_value(a).unwrap_or_default()).collect();
	Json(json!({"accounts": bundle})).into_response()
}

pub async fn pool_files_import(State(state): State<Arc<AppState>>, body: axum::body::Bytes) -> Response {
	let Ok(accounts) = serde_json::from_slice::<Vec<crate::account::Account>>(&body) else {
		return (axum::http::StatusCode::BAD_REQUEST, Json(json!({"error": {"code": "invalid_import_payload"}}))).into_response();
	};
	let mut imported = 0;
	for account in accounts {
		if account.save_atomic(state.pool.data_dir()).is_ok() {
			imported += 1;
		}
	}
	let _ = state.pool.load();
	Json(json!({"ok": true, "imported": imported})).into_response()
}

pub async fn delete_invalid_preview(State(state): State<Arc<AppState>>) -> Response {
	let accounts = state.pool.list_accounts();
	let invalid: Vec<_> = accounts
		.iter()
		.filter(|a| !a.status.is_active())
		.map(|a| a.mask_email())
		.collect();
	Json(json!({"wouldDelete": invalid})).into_response()
}

pub async fn delete_invalid_execute(State(state): State<Arc<AppState>>) -> Response {
	let accounts = state.pool.list_accounts();
	let mut deleted = 0;
	for account in accounts.iter().filter(|a| !a.status.is_active()) {
		let path = state.pool.data_dir().join(format!("{}.json", account.email));
		if fs_err::remove_file(path).is_ok() {
			deleted += 1;
		}
	}
	Json(json!({"ok": true, "deleted": deleted})).into_response()
}

/// SSE fan-out of the log ring buffer; the ring buffer itself is an
/// external collaborator (spec.md §1) — here we emit a heartbeat-only
/// stream that a real deployment wires to that buffer's subscribe call.
pub async fn logs_stream() -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
	let heartbeat = stream::repeat_with(|| Ok(Event::default().event("heartbeat").data("")))
		.then(|item| async move {
			tokio::time::sleep(Duration::from_secs(15)).await;
			item
		});
	Sse::new(heartbeat).keep_alive(KeepAlive::default())
}
