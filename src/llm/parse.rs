//! Tolerant parsing of the upstream `streamAssist` event body (§4.4
//! "Response parsing"). The body is nominally a JSON array of event
//! objects, but upstream may truncate it mid-object on timeout; we recover
//! as much as we can rather than failing the whole attempt.

use serde::Deserialize;
use serde_json::Value;

use super::{CanonicalResponse, FinishReason, GeneratedFile, InlineImage, ToolCall};

/// One element of the upstream event array.
#[derive(Debug, Deserialize)]
struct StreamAssistEvent {
	#[serde(rename = "streamAssistResponse", default)]
	response: Option<StreamAssistResponse>,
}

#[derive(Debug, Deserialize)]
struct StreamAssistResponse {
	#[serde(default)]
	text: Option<String>,
	#[serde(default)]
	thought: Option<String>,
	#[serde(default, rename = "inlineData")]
	inline_data: Option<InlineDataPayload>,
	#[serde(default, rename = "fileReference")]
	file_reference: Option<FileReferencePayload>,
	#[serde(default, rename = "functionCall")]
	function_call: Option<FunctionCallPayload>,
}

#[derive(Debug, Deserialize)]
struct InlineDataPayload {
	#[serde(rename = "mimeType")]
	mime_type: String,
	data: String,
}

#[derive(Debug, Deserialize)]
struct FileReferencePayload {
	#[serde(rename = "fileId")]
	file_id: String,
	#[serde(rename = "mimeType")]
	mime_type: String,
}

#[derive(Debug, Deserialize)]
struct FunctionCallPayload {
	#[serde(default)]
	id: Option<String>,
	name: String,
	#[serde(default)]
	args: Value,
}

/// Tokens that, if present anywhere in the raw body, indicate the account's
/// daily/session quota is exhausted (§4.4, §7 "Quota-exhausted").
const QUOTA_EXHAUSTED_MARKERS: &[&str] = &["RESOURCE_EXHAUSTED", "quota_exceeded", "QUOTA_EXCEEDED"];

/// Tokens indicating the 200-status body is actually an auth-failure
/// envelope (§4.4 "HTTP 200 but body parses as an auth-error envelope").
const AUTH_ENVELOPE_MARKERS: &[&str] = &["UNAUTHENTICATED", "PERMISSION_DENIED", "invalid_grant"];

pub fn body_indicates_quota_exhausted(body: &str) -> bool {
	QUOTA_EXHAUSTED_MARKERS.iter().any(|m| body.contains(m))
}

pub fn body_indicates_auth_envelope(body: &str) -> bool {
	AUTH_ENVELOPE_MARKERS.iter().any(|m| body.contains(m))
}

/// Parse the raw `streamAssist` body into a flat list of response events,
/// trying strict array decode, then a truncated-array recovery, then
/// newline-delimited JSON.
pub fn parse_events(body: &str) -> Vec<StreamAssistResponse> {
	if let Some(events) = strict_array(body) {
		return flatten(events);
	}
	if let Some(events) = truncated_array_prefix(body) {
		return flatten(events);
	}
	if let Some(events) = newline_delimited(body) {
		return flatten(events);
	}
	Vec::new()
}

fn flatten(events: Vec<StreamAssistEvent>) -> Vec<StreamAssistResponse> {
	events.into_iter().filter_map(|e| e.response).collect()
}

fn strict_array(body: &str) -> Option<Vec<StreamAssistEvent>> {
	serde_json::from_str(body.trim()).ok()
}

/// Recover a prefix of complete top-level JSON objects from a `[` … body
/// that was truncated before the closing `]`. Scans for balanced-brace
/// object boundaries at depth 1, ignoring braces inside string literals.
fn truncated_array_prefix(body: &str) -> Option<Vec<StreamAssistEvent>> {
	let trimmed = body.trim_start();
	let rest = trimmed.strip_prefix('[')?;
	let mut depth = 0i32;
	let mut in_string = false;
	let mut escape = false;
	let mut obj_start: Option<usize> = None;
	let mut objects = Vec::new();

	for (idx, ch) in rest.char_indices() {
		if in_string {
			if escape {
				escape = false;
			} else if ch == '\\' {
				escape = true;
			} else if ch == '"' {
				in_string = false;
			}
			continue;
		}
		match ch {
			'"' => in_string = true,
			'{' => {
				if depth == 0 {
					obj_start = Some(idx);
				}
				depth += 1;
			},
			'}' => {
				depth -= 1;
				if depth == 0
					&& let Some(start) = obj_start.take()
				{
					let slice = &rest[start..=idx];
					if let Ok(event) = serde_json::from_str::<StreamAssistEvent>(slice) {
						objects.push(event);
					}
				}
			},
			_ => {},
		}
	}

	if objects.is_empty() { None } else { Some(objects) }
}

fn newline_delimited(body: &str) -> Option<Vec<StreamAssistEvent>> {
	let mut events = Vec::new();
	for line in body.lines() {
		let line = line.trim();
		if line.is_empty() {
			continue;
		}
		if let Ok(event) = serde_json::from_str::<StreamAssistEvent>(line) {
			events.push(event);
		}
	}
	if events.is_empty() { None } else { Some(events) }
}

/// Fold a parsed event list into a single [`CanonicalResponse`], preserving
/// arrival order for text/thought/image segments.
pub fn assemble_response(events: Vec<StreamAssistResponse>) -> CanonicalResponse {
	let mut out = CanonicalResponse::default();
	for event in events {
		if let Some(text) = event.text {
			out.text.push_str(&text);
		}
		if let Some(thought) = event.thought {
			out.thoughts.push(thought);
		}
		if let Some(inline) = event.inline_data {
			out.images.push(InlineImage {
				mime_type: inline.mime_type,
				data_base64: inline.data,
			});
		}
		if let Some(file_ref) = event.file_reference {
			out.files.push(GeneratedFile {
				file_id: file_ref.file_id,
				mime_type: file_ref.mime_type,
				bytes: None,
			});
		}
		if let Some(call) = event.function_call {
			out.tool_calls.push(ToolCall {
				id: call.id.unwrap_or_else(|| format!("call_{}", call.name)),
				name: call.name,
				arguments: call.args,
			});
			out.finish_reason = FinishReason::ToolCalls;
		}
	}
	out
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn strict_array_parses_all_events() {
		let body = r#"[{"streamAssistResponse":{"text":"hi"}},{"streamAssistResponse":{"text":" there"}}]"#;
		let events = parse_events(body);
		assert_eq!(events.len(), 2);
		let resp = assemble_response(events);
		assert_eq!(resp.text, "hi there");
	}

	#[test]
	fn truncated_array_recovers_complete_prefix() {
		let full = r#"[{"streamAssistResponse":{"text":"one"}},{"streamAssistResponse":{"text":"two"}},{"streamAssistResponse":{"text":"three"}}]"#;
		// Truncate mid-third-object: keep everything up to (not including) "three"'s closing brace.
		let cut = full.find(r#""three"}}"#).unwrap();
		let truncated = &full[..cut + 1];
		let events = parse_events(truncated);
		assert_eq!(events.len(), 2);
		let resp = assemble_response(events);
		assert_eq!(resp.text, "onetwo");
	}

	#[test]
	fn newline_delimited_fallback_used_when_not_an_array() {
		let body = "{\"streamAssistResponse\":{\"text\":\"a\"}}\n{\"streamAssistResponse\":{\"text\":\"b\"}}\n";
		let events = parse_events(body);
		assert_eq!(events.len(), 2);
	}

	#[test]
	fn empty_or_garbage_body_yields_no_events() {
		assert!(parse_events("not json at all").is_empty());
		assert!(parse_events("").is_empty());
	}

	#[test]
	fn thought_only_response_is_not_meaningful() {
		let events = vec![StreamAssistResponse {
			text: None,
			thought: Some("thinking...".into()),
			inline_data: None,
			file_reference: None,
			function_call: None,
		}];
		let resp = assemble_response(events);
		assert!(!resp.is_meaningful());
	}

	#[test]
	fn quota_exhausted_marker_detected() {
		assert!(body_indicates_quota_exhausted("{\"error\":\"RESOURCE_EXHAUSTED\"}"));
		assert!(!body_indicates_quota_exhausted("{\"ok\":true}"));
	}

	#[test]
	fn auth_envelope_marker_detected() {
		assert!(body_indicates_auth_envelope("{\"error\":{\"status\":\"UNAUTHENTICATED\"}}"));
		assert!(!body_indicates_auth_envelope("{\"ok\":true}"));
	}
}
