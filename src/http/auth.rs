//! Dual auth scheme for admin endpoints (bearer API key OR signed session
//! cookie); chat endpoints accept API key only (§4.6).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use axum::extract::State;
use axum::http::{Request, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum_extra::extract::CookieJar;
use parking_lot::Mutex;
use rand::Rng;
use serde_json::json;

use super::AppState;

pub const SESSION_COOKIE_NAME: &str = "b2a_admin_session";
pub const SESSION_TTL_SECS: i64 = 12 * 60 * 60;

/// The admin session/password store is, per scope, an external
/// collaborator; this is the narrow interface our core depends on plus a
/// minimal in-memory implementation so the gateway runs standalone.
pub trait SessionStore: Send + Sync {
	fn login(&self, password: &str) -> Option<String>;
	fn validate(&self, token: &str) -> bool;
	fn logout(&self, token: &str);
	fn change_password(&self, old: &str, new: &str) -> bool;
}

pub struct InMemorySessionStore {
	password: Mutex<String>,
	sessions: Mutex<HashMap<String, i64>>,
}

impl InMemorySessionStore {
	pub fn new(initial_password: impl Into<String>) -> Self {
		InMemorySessionStore {
			password: Mutex::new(initial_password.into()),
			sessions: Mutex::new(HashMap::new()),
		}
	}

	fn now() -> i64 {
		SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs() as i64
	}
}

impl SessionStore for InMemorySessionStore {
	fn login(&self, password: &str) -> Option<String> {
		if *self.password.lock() != password {
			return None;
		}
		let mut rng = rand::thread_rng();
		let bytes: [u8; 24] = rng.r#gen();
		let token = hex::encode(bytes);
		self.sessions.lock().insert(token.clone(), Self::now() + SESSION_TTL_SECS);
		Some(token)
	}

	fn validate(&self, token: &str) -> bool {
		let mut sessions = self.sessions.lock();
		match sessions.get(token) {
			Some(expires) if *expires > Self::now() => true,
			Some(_) => {
				sessions.remove(token);
				false
			},
			None => false,
		}
	}

	fn logout(&self, token: &str) {
		self.sessions.lock().remove(token);
	}

	fn change_password(&self, old: &str, new: &str) -> bool {
		let mut password = self.password.lock();
		if *password != old {
			return false;
		}
		*password = new.to_string();
		true
	}
}

fn bearer_token(headers: &axum::http::HeaderMap) -> Option<&str> {
	headers
		.get(axum::http::header::AUTHORIZATION)
		.and_then(|v| v.to_str().ok())
		.and_then(|v| v.strip_prefix("Bearer "))
}

fn unauthorized(code: &'static str) -> Response {
	(StatusCode::UNAUTHORIZED, axum::Json(json!({"error": {"code": code}}))).into_response()
}

/// Chat surface: API key only.
pub async fn require_api_key(
	State(state): State<Arc<AppState>>,
	request: Request<axum::body::Body>,
	next: Next,
) -> Response {
	let live = state.config.live.load();
	match bearer_token(request.headers()) {
		Some(token) if live.api_keys.iter().any(|k| k == token) => next.run(request).await,
		_ => unauthorized("invalid_api_key"),
	}
}

/// Admin surface: bearer API key OR a valid signed session cookie.
pub async fn require_admin(
	State(state): State<Arc<AppState>>,
	jar: CookieJar,
	request: Request<axum::body::Body>,
	next: Next,
) -> Response {
	let live = state.config.live.load();
	if let Some(token) = bearer_token(request.headers())
		&& live.api_keys.iter().any(|k| k == token)
	{
		return next.run(request).await;
	}
	if let Some(cookie) = jar.get(SESSION_COOKIE_NAME)
		&& state.session_store.validate(cookie.value())
	{
		return next.run(request).await;
	}
	unauthorized("admin_auth_required")
}
