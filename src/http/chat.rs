//! Chat surface handlers (§4.6, §6): three input dialects, all routed
//! through the same [`crate::pipeline::Pipeline`].

use std::convert::Infallible;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use axum::Json;
use axum::extract::{Path, State};
use axum::http::HeaderMap;
use axum::response::sse::{KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use futures::stream::{self, Stream};
use serde_json::{Value, json};
use uuid::Uuid;

use super::AppState;
use crate::llm::{CanonicalRequest, ToolKind, anthropic, gemini, openai};
use crate::pipeline::stream::{HEARTBEAT_BYTE, HEARTBEAT_INTERVAL_SECS, error_chunks, response_chunks, role_chunk};
use crate::stats::RequestOutcome;

fn now_unix() -> i64 {
	SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs() as i64
}

fn error_response(status: axum::http::StatusCode, code: &str, message: String) -> Response {
	(status, Json(json!({"error": {"code": code, "message": message}}))).into_response()
}

/// First IP in `X-Forwarded-For`, falling back to `X-Real-Ip`; this gateway
/// always sits behind a reverse proxy (§4.7), so there is no raw socket
/// address to fall back to.
fn client_ip(headers: &HeaderMap) -> String {
	headers
		.get("x-forwarded-for")
		.and_then(|v| v.to_str().ok())
		.and_then(|v| v.split(',').next())
		.or_else(|| headers.get("x-real-ip").and_then(|v| v.to_str().ok()))
		.map(|v| v.trim().to_string())
		.unwrap_or_else(|| "unknown".to_string())
}

fn user_agent(headers: &HeaderMap) -> Option<String> {
	headers.get("user-agent").and_then(|v| v.to_str().ok()).map(str::to_string)
}

/// §4.4 "Non-streaming long-running requests": image/video-producing models
/// keep the client connection open with whitespace heartbeats rather than
/// making it wait for the full generation with no feedback at all.
fn is_long_running(req: &CanonicalRequest) -> bool {
	req.tool_spec.tools.contains(&ToolKind::Image) || req.tool_spec.tools.contains(&ToolKind::Video)
}

pub async fn openai_completions(
	State(state): State<Arc<AppState>>,
	headers: HeaderMap,
	Json(body): Json<Value>,
) -> Response {
	let canonical = match openai::to_canonical(&body) {
		Ok(c) => c,
		Err(e) => return error_response(axum::http::StatusCode::BAD_REQUEST, "invalid_request", e.to_string()),
	};
	let request_id = format!("chatcmpl-{}", Uuid::new_v4().simple());
	let session_id = Uuid::new_v4().to_string();
	let model = canonical.model.clone();
	let stream = canonical.stream;
	let created = now_unix();
	let ip = client_ip(&headers);
	let ua = user_agent(&headers);

	if stream {
		return stream_openai(state, canonical, request_id, session_id, model, created, ip, ua).await;
	}

	if is_long_running(&canonical) {
		return long_running_openai(state, canonical, request_id, session_id, model, created, ip, ua).await;
	}

	let input_tokens = estimate_input_tokens(&canonical);
	match state.pipeline.run(&canonical, &session_id, &request_id, "openai_chat_completions").await {
		Ok(resp) => {
			record_stats(&state, &model, Some(&resp), true, input_tokens, &ip, ua);
			Json(openai::from_canonical(&model, &resp, &request_id, created)).into_response()
		},
		Err(e) => {
			record_stats(&state, &model, None, false, input_tokens, &ip, ua);
			error_response(axum::http::StatusCode::INTERNAL_SERVER_ERROR, e.code(), e.to_string())
		},
	}
}

/// Keeps the connection open with 15s whitespace heartbeats (§4.4) while the
/// attempt loop runs in the background, then emits the real completion body
/// as the final chunk of a chunked-encoded response.
async fn long_running_openai(
	state: Arc<AppState>,
	canonical: CanonicalRequest,
	request_id: String,
	session_id: String,
	model: String,
	created: i64,
	ip: String,
	ua: Option<String>,
) -> Response {
	let input_tokens = estimate_input_tokens(&canonical);
	let (tx, rx) = tokio::sync::oneshot::channel();
	let worker_state = Arc::clone(&state);
	let worker_request_id = request_id.clone();
	tokio::spawn(async move {
		let result = worker_state
			.pipeline
			.run(&canonical, &session_id, &worker_request_id, "openai_chat_completions_long_running")
			.await;
		let _ = tx.send(result);
	});

	let body_stream = stream::unfold(Some(rx), move |rx_opt| {
		let state = Arc::clone(&state);
		let model = model.clone();
		let request_id = request_id.clone();
		let ip = ip.clone();
		let ua = ua.clone();
		async move {
			let mut rx = rx_opt?;
			tokio::select! {
				biased;
				result = &mut rx => {
					let payload = match result {
						Ok(Ok(resp)) => {
							record_stats(&state, &model, Some(&resp), true, input_tokens, &ip, ua);
							serde_json::to_vec(&openai::from_canonical(&model, &resp, &request_id, created))
						},
						Ok(Err(e)) => {
							record_stats(&state, &model, None, false, input_tokens, &ip, ua);
							serde_json::to_vec(&json!({"error": {"code": e.code(), "message": e.to_string()}}))
						},
						Err(_) => {
							record_stats(&state, &model, None, false, input_tokens, &ip, ua);
							serde_json::to_vec(&json!({"error": {"code": "internal_error", "message": "pipeline task dropped"}}))
						},
					};
					Some((Ok::<_, Infallible>(axum::body::Bytes::from(payload.unwrap_or_default())), None))
				},
				_ = tokio::time::sleep(Duration::from_secs(HEARTBEAT_INTERVAL_SECS)) => {
					Some((Ok::<_, Infallible>(axum::body::Bytes::from(vec![HEARTBEAT_BYTE])), Some(rx)))
				},
			}
		}
	});

	Response::builder()
		.header(axum::http::header::CONTENT_TYPE, "application/json")
		.body(axum::body::Body::from_stream(body_stream))
		.unwrap_or_else(|_| axum::http::StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

fn estimate_input_tokens(canonical: &CanonicalRequest) -> u64 {
	let images = canonical
		.media_parts()
		.iter()
		.filter(|p| matches!(p, crate::llm::ContentPart::ImageUrl { .. }))
		.count() as u64;
	crate::stats::estimate_input_tokens(&canonical.assemble_prompt(), images)
}

/// Emits the role chunk immediately, before the attempt loop starts, then
/// runs the pipeline in the background and emits its chunks once it settles
/// (§4.4: "the client sees keepalive immediately").
#[allow(clippy::too_many_arguments)]
async fn stream_openai(
	state: Arc<AppState>,
	canonical: crate::llm::CanonicalRequest,
	request_id: String,
	session_id: String,
	model: String,
	created: i64,
	ip: String,
	ua: Option<String>,
) -> Response {
	let input_tokens = estimate_input_tokens(&canonical);
	let lead = role_chunk(&model, &request_id, created);

	let (tx, rx) = tokio::sync::oneshot::channel();
	let worker_state = Arc::clone(&state);
	let worker_request_id = request_id.clone();
	tokio::spawn(async move {
		let result = worker_state
			.pipeline
			.run(&canonical, &session_id, &worker_request_id, "openai_chat_completions_stream")
			.await;
		let _ = tx.send(result);
	});

	enum Stage {
		Lead(Option<axum::response::sse::Event>, tokio::sync::oneshot::Receiver<Result<crate::llm::CanonicalResponse, crate::pipeline::PipelineError>>),
		Tail(std::vec::IntoIter<axum::response::sse::Event>),
	}

	let body_stream = stream::unfold(Some(Stage::Lead(Some(lead), rx)), move |stage_opt| {
		let state = Arc::clone(&state);
		let model = model.clone();
		let request_id = request_id.clone();
		let ip = ip.clone();
		let ua = ua.clone();
		async move {
			match stage_opt? {
				Stage::Lead(lead, rx) => {
					if let Some(event) = lead {
						return Some((Ok::<_, Infallible>(event), Some(Stage::Lead(None, rx))));
					}
					let result = rx.await;
					let events = match result {
						Ok(Ok(resp)) => {
							record_stats(&state, &model, Some(&resp), true, input_tokens, &ip, ua);
							response_chunks(&model, &request_id, created, &resp)
						},
						Ok(Err(e)) => {
							record_stats(&state, &model, None, false, input_tokens, &ip, ua);
							error_chunks(e.code(), &e.to_string())
						},
						Err(_) => {
							record_stats(&state, &model, None, false, input_tokens, &ip, ua);
							error_chunks("internal_error", "pipeline task dropped")
						},
					};
					let mut iter = events.into_iter();
					let first = iter.next()?;
					Some((Ok(first), Some(Stage::Tail(iter))))
				},
				Stage::Tail(mut iter) => {
					let event = iter.next()?;
					Some((Ok(event), Some(Stage::Tail(iter))))
				},
			}
		}
	});

	let body: Sse<impl Stream<Item = Result<axum::response::sse::Event, Infallible>>> =
		Sse::new(body_stream).keep_alive(KeepAlive::default());
	body.into_response()
}

pub async fn claude_messages(State(state): State<Arc<AppState>>, headers: HeaderMap, Json(body): Json<Value>) -> Response {
	let canonical = match anthropic::to_canonical(&body) {
		Ok(c) => c,
		Err(e) => return error_response(axum::http::StatusCode::BAD_REQUEST, "invalid_request", e.to_string()),
	};
	let session_id = Uuid::new_v4().to_string();
	let message_id = format!("msg_{}", Uuid::new_v4().simple());
	let model = canonical.model.clone();
	let ip = client_ip(&headers);
	let ua = user_agent(&headers);
	let input_tokens = estimate_input_tokens(&canonical);

	match state.pipeline.run(&canonical, &session_id, &message_id, "claude_messages").await {
		Ok(resp) => {
			record_stats(&state, &model, Some(&resp), true, input_tokens, &ip, ua);
			Json(anthropic::from_canonical(&model, &resp, &message_id)).into_response()
		},
		Err(e) => {
			record_stats(&state, &model, None, false, input_tokens, &ip, ua);
			error_response(axum::http::StatusCode::INTERNAL_SERVER_ERROR, e.code(), e.to_string())
		},
	}
}

pub async fn gemini_generate(
	State(state): State<Arc<AppState>>,
	Path(model): Path<String>,
	headers: HeaderMap,
	Json(body): Json<Value>,
) -> Response {
	run_gemini(state, model, headers, body, "gemini_generate_content").await
}

pub async fn gemini_stream_generate(
	State(state): State<Arc<AppState>>,
	Path(model): Path<String>,
	headers: HeaderMap,
	Json(body): Json<Value>,
) -> Response {
	// Gemini's own streaming shape is a JSON-array of partial candidates;
	// this gateway still only performs one upstream call, so non-streaming
	// and streaming converge on the same canonical path (§4.4).
	run_gemini(state, model, headers, body, "gemini_stream_generate_content").await
}

async fn run_gemini(state: Arc<AppState>, model: String, headers: HeaderMap, body: Value, route: &str) -> Response {
	let canonical = match gemini::to_canonical(&model, &body) {
		Ok(c) => c,
		Err(e) => return error_response(axum::http::StatusCode::BAD_REQUEST, "invalid_request", e.to_string()),
	};
	let session_id = Uuid::new_v4().to_string();
	let request_id = Uuid::new_v4().to_string();
	let model_name = canonical.model.clone();
	let ip = client_ip(&headers);
	let ua = user_agent(&headers);
	let input_tokens = estimate_input_tokens(&canonical);

	match state.pipeline.run(&canonical, &session_id, &request_id, route).await {
		Ok(resp) => {
			record_stats(&state, &model_name, Some(&resp), true, input_tokens, &ip, ua);
			Json(gemini::from_canonical(&resp)).into_response()
		},
		Err(e) => {
			record_stats(&state, &model_name, None, false, input_tokens, &ip, ua);
			error_response(axum::http::StatusCode::INTERNAL_SERVER_ERROR, e.code(), e.to_string())
		},
	}
}

#[allow(clippy::too_many_arguments)]
fn record_stats(
	state: &AppState,
	model: &str,
	resp: Option<&crate::llm::CanonicalResponse>,
	success: bool,
	input_tokens: u64,
	client_ip: &str,
	user_agent: Option<String>,
) {
	state.stats.on_request_complete(
		RequestOutcome {
			success,
			model: model.to_string(),
			client_ip: client_ip.to_string(),
			user_agent,
			input_tokens,
			output_tokens: resp.map(|r| openai::estimate_tokens(&r.text)).unwrap_or(0),
			images: resp.map(|r| r.images.len() as u64).unwrap_or(0),
			videos: 0,
		},
		now_unix(),
	);
}

/// Default model catalog (§6): base set with the `-image`/`-video`/
/// `-search` suffix cross-product. Flow models only appear when that
/// collaborator is enabled, which is out of this core's scope.
pub const BASE_MODELS: &[&str] = &[
	"gemini-2.5-flash",
	"gemini-2.5-pro",
	"gemini-3-pro-preview",
	"gemini-3-pro",
	"gemini-3-flash-preview",
	"gemini-3-flash",
	"gemini-2.5-flash-preview-latest",
];
const SUFFIXES: &[&str] = &["", "-image", "-video", "-search"];

fn model_catalog() -> Vec<String> {
	BASE_MODELS
		.iter()
		.flat_map(|base| SUFFIXES.iter().map(move |suffix| format!("{base}{suffix}")))
		.collect()
}

pub async fn list_models_openai() -> Response {
	let data: Vec<Value> = model_catalog()
		.into_iter()
		.map(|id| json!({"id": id, "object": "model", "owned_by": "b2a-gateway"}))
		.collect();
	Json(json!({"object": "list", "data": data})).into_response()
}

pub async fn list_models_gemini() -> Response {
	let models: Vec<Value> = model_catalog()
		.into_iter()
		.map(|id| json!({"name": format!("models/{id}"), "displayName": id}))
		.collect();
	Json(json!({"models": models})).into_response()
}

pub async fn get_model_gemini(Path(model): Path<String>) -> Response {
	if model_catalog().contains(&model) {
		Json(json!({"name": format!("models/{model}"), "displayName": model})).into_response()
	} else {
		error_response(axum::http::StatusCode::NOT_FOUND, "model_not_found", format!("unknown model {model}"))
	}
}
