//! SSE chunk sequencing for the OpenAI-compatible streaming surface (§4.4
//! "Streaming"). The upstream call itself is not actually streamed — the
//! gateway reads one full `streamAssist` body and re-chunks it for the
//! client, but the client-facing shape still honours SSE semantics: a role
//! chunk before the attempt loop starts, ordered content chunks, a
//! `finish_reason` chunk, and a literal `[DONE]` terminator.

use axum::response::sse::Event;
use serde_json::json;

use crate::llm::{CanonicalResponse, FinishReason};
use crate::llm::openai::stream_chunk;

/// The very first frame written, before the attempt loop even begins, so
/// the client sees a keepalive immediately.
pub fn role_chunk(model: &str, request_id: &str, created: i64) -> Event {
	let chunk = stream_chunk(model, request_id, created, json!({"role": "assistant"}), None);
	Event::default().event("message").data(chunk.to_string())
}

/// Translate a finished [`CanonicalResponse`] into the ordered sequence of
/// content/finish/done frames (arrival order is preserved: text, then
/// thoughts are dropped from the OpenAI surface per dialect choice, then
/// images, then files, then tool calls, per §4.4).
pub fn response_chunks(model: &str, request_id: &str, created: i64, resp: &CanonicalResponse) -> Vec<Event> {
	let mut events = Vec::new();

	if !resp.text.is_empty() {
		let chunk = stream_chunk(model, request_id, created, json!({"content": resp.text}), None);
		events.push(Event::default().event("message").data(chunk.to_string()));
	}

	for image in &resp.images {
		let markdown = format!("![generated image](data:{};base64,{})", image.mime_type, image.data_base64);
		let chunk = stream_chunk(model, request_id, created, json!({"content": markdown}), None);
		events.push(Event::default().event("message").data(chunk.to_string()));
	}

	for file in &resp.files {
		if let Some(bytes) = &file.bytes {
			use base64::Engine;
			let encoded = base64::engine::general_purpose::STANDARD.encode(bytes);
			let markdown = format!("![generated file](data:{};base64,{})", file.mime_type, encoded);
			let chunk = stream_chunk(model, request_id, created, json!({"content": markdown}), None);
			events.push(Event::default().event("message").data(chunk.to_string()));
		}
	}

	for call in &resp.tool_calls {
		let delta = json!({
			"tool_calls": [{
				"index": 0,
				"id": call.id,
				"type": "function",
				"function": {"name": call.name, "arguments": call.arguments.to_string()},
			}],
		});
		let chunk = stream_chunk(model, request_id, created, delta, None);
		events.push(Event::default().event("message").data(chunk.to_string()));
	}

	let finish_reason = match resp.finish_reason {
		FinishReason::Stop => "stop",
		FinishReason::ToolCalls => "tool_calls",
	};
	let finish = stream_chunk(model, request_id, created, json!({}), Some(finish_reason));
	events.push(Event::default().event("message").data(finish.to_string()));
	events.push(Event::default().event("message").data("[DONE]"));

	events
}

/// An SSE error frame followed by the mandatory `[DONE]` terminator (§7:
/// "SSE streams always terminate with `[DONE]` even on error").
pub fn error_chunks(code: &str, message: &str) -> Vec<Event> {
	let body = json!({"error": {"code": code, "message": message}});
	vec![
		Event::default().event("message").data(body.to_string()),
		Event::default().event("message").data("[DONE]"),
	]
}

/// Whitespace heartbeat emitted every 15s while a long-running non-stream
/// (image/video-producing) request is still in flight (§4.4).
pub const HEARTBEAT_INTERVAL_SECS: u64 = 15;
pub const HEARTBEAT_BYTE: u8 = b' ';
