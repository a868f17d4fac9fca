//! Session-auth panel endpoints: these issue and revoke the
//! `b2a_admin_session` cookie the admin surface's dual-auth middleware
//! accepts alongside the bearer API key (§6).

use std::sync::Arc;

use axum::Json;
use axum::extract::State;
use axum::response::{IntoResponse, Response};
use axum_extra::extract::CookieJar;
use axum_extra::extract::cookie::{Cookie, SameSite};
use serde::Deserialize;
use serde_json::json;

use super::AppState;
use super::auth::{SESSION_COOKIE_NAME, SESSION_TTL_SECS};

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
	password: String,
}

pub async fn login(State(state): State<Arc<AppState>>, jar: CookieJar, Json(req): Json<LoginRequest>) -> Response {
	match state.session_store.login(&req.password) {
		Some(token) => {
			let cookie = Cookie::build((SESSION_COOKIE_NAME, token))
				.http_only(true)
				.same_site(SameSite::Strict)
				.max_age(cookie::time::Duration::seconds(SESSION_TTL_SECS))
				.path("/")
				.build();
			(jar.add(cookie), Json(json!({"ok": true}))).into_response()
		},
		None => (axum::http::StatusCode::UNAUTHORIZED, Json(json!({"error": {"code": "invalid_password"}}))).into_response(),
	}
}

pub async fn logout(State(state): State<Arc<AppState>>, jar: CookieJar) -> Response {
	if let Some(cookie) = jar.get(SESSION_COOKIE_NAME) {
		state.session_store.logout(cookie.value());
	}
	(jar.remove(Cookie::from(SESSION_COOKIE_NAME)), Json(json!({"ok": true}))).into_response()
}

#[derive(Debug, Deserialize)]
pub struct ChangePasswordRequest {
	old_password: String,
	new_password: String,
}

pub async fn change_password(State(state): State<Arc<AppState>>, Json(req): Json<ChangePasswordRequest>) -> Response {
	if state.session_store.change_password(&req.old_password, &req.new_password) {
		Json(json!({"ok": true})).into_response()
	} else {
		(axum::http::StatusCode::BAD_REQUEST, Json(json!({"error": {"code": "invalid_old_password"}}))).into_response()
	}
}

pub async fn me(State(state): State<Arc<AppState>>, jar: CookieJar) -> Response {
	let authenticated = jar
		.get(SESSION_COOKIE_NAME)
		.map(|c| state.session_store.validate(c.value()))
		.unwrap_or(false);
	Json(json!({"authenticated": authenticated})).into_response()
}
