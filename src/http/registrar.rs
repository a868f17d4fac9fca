//! External registrar protocol endpoints (§4.3, §6): the claim/fail/upload
//! cycle a separate registrar worker process drives. The registrar process
//! itself, and the browser-automation it performs between claim and
//! upload/fail, are external collaborators out of this core's scope.

use std::sync::Arc;

use axum::Json;
use axum::extract::State;
use axum::response::{IntoResponse, Response};
use serde::Deserialize;
use serde_json::json;

use super::AppState;
use crate::account::Cookie as AccountCookie;
use crate::account::pool::UploadRequest;

#[derive(Debug, Deserialize)]
pub struct ClaimRequest {
	worker_id: String,
	limit: usize,
	lease_sec: i64,
}

pub async fn claim_tasks(State(state): State<Arc<AppState>>, Json(req): Json<ClaimRequest>) -> Response {
	let slips = state.pool.claim_external_refresh_tasks(&req.worker_id, req.limit, req.lease_sec);
	Json(json!({"tasks": slips})).into_response()
}

#[derive(Debug, Deserialize)]
pub struct FailRequest {
	task_id: String,
	worker_id: String,
	reason: String,
}

pub async fn fail_task(State(state): State<Arc<AppState>>, Json(req): Json<FailRequest>) -> Response {
	match state.pool.mark_external_refresh_failed(&req.task_id, &req.worker_id, &req.reason) {
		Ok(()) => Json(json!({"ok": true})).into_response(),
		Err(e) => (axum::http::StatusCode::CONFLICT, Json(json!({"error": {"code": "lease_mismatch", "message": e.to_string()}}))).into_response(),
	}
}

#[derive(Debug, Deserialize)]
pub struct UploadAccountRequest {
	email: String,
	#[serde(default)]
	task_id: Option<String>,
	#[serde(default)]
	worker_id: Option<String>,
	authorization: String,
	cookies: Vec<AccountCookie>,
	config_id: String,
	csesidx: String,
	#[serde(default)]
	full_name: Option<String>,
	#[serde(default)]
	mail_provider: Option<String>,
	#[serde(default)]
	mail_password: Option<String>,
}

pub async fn upload_account(State(state): State<Arc<AppState>>, Json(req): Json<UploadAccountRequest>) -> Response {
	let upload = UploadRequest {
		email: req.email,
		task_id: req.task_id,
		worker_id: req.worker_id,
		authorization: req.authorization,
		cookies: req.cookies,
		config_id: req.config_id,
		csesidx: req.csesidx,
		full_name: req.full_name,
		mail_provider: req.mail_provider,
		mail_password: req.mail_password,
	};
	match state.pool.upload_result(upload) {
		Ok(()) => Json(json!({"ok": true})).into_response(),
		Err(e) => (axum::http::StatusCode::BAD_REQUEST, Json(json!({"error": {"code": "validation_failed", "message": e.to_string()}}))).into_response(),
	}
}

/// Read-only view for operators; must never mutate lease state (§9 open
/// question — kept distinct from the claim endpoint above).
pub async fn metrics(State(state): State<Arc<AppState>>) -> Response {
	let stats = state.pool.stats();
	let pending_tasks = state.pool.external_refresh_tasks(usize::MAX);
	Json(json!({
		"pending_external": stats.pending_external,
		"lease_reclaims": stats.lease_reclaims,
		"eligible_now": pending_tasks.len(),
	}))
	.into_response()
}

#[derive(Debug, Deserialize)]
pub struct TriggerRegisterRequest {
	count: u32,
}

/// Proxies to the registrar's own trigger endpoint (an external
/// collaborator); this core only forwards the request and its
/// configured base URL.
pub async fn trigger_register(State(state): State<Arc<AppState>>, Json(req): Json<TriggerRegisterRequest>) -> Response {
	let live = state.config.live.load();
	let Some(base_url) = &live.registrar_url else {
		return (axum::http::StatusCode::SERVICE_UNAVAILABLE, Json(json!({"error": {"code": "registrar_not_configured"}}))).into_response();
	};
	let url = format!("{}/trigger-register", base_url.trim_end_matches('/'));
	match state.upstream.registrar_client().post(&url).json(&json!({"count": req.count})).send().await {
		Ok(resp) => {
			let status = resp.status();
			let body = resp.json::<serde_json::Value>().await.unwrap_or(json!({}));
			(status, Json(body)).into_response()
		},
		Err(e) => (axum::http::StatusCode::BAD_GATEWAY, Json(json!({"error": {"code": "registrar_unreachable", "message": e.to_string()}}))).into_response(),
	}
}
