//! OpenAI chat-completions dialect ↔ canonical form.

use serde_json::{Value, json};

use super::{
	AIError, CanonicalRequest, CanonicalResponse, ContentPart, FinishReason, Role, ToolCall, Turn,
	TurnContent, derive_tool_spec,
};

pub fn to_canonical(body: &Value) -> Result<CanonicalRequest, AIError> {
	let model = body
		.get("model")
		.and_then(Value::as_str)
		.ok_or(AIError::MissingField("model"))?
		.to_string();
	let stream = body.get("stream").and_then(Value::as_bool).unwrap_or(false);
	let messages = body
		.get("messages")
		.and_then(Value::as_array)
		.ok_or(AIError::MissingField("messages"))?;

	let mut turns = Vec::with_capacity(messages.len());
	for msg in messages {
		let role = parse_role(msg.get("role").and_then(Value::as_str).unwrap_or("user"))?;
		let content = parse_content(msg.get("content"))?;
		let tool_calls = msg
			.get("tool_calls")
			.and_then(Value::as_array)
			.map(|calls| calls.iter().filter_map(parse_tool_call).collect())
			.unwrap_or_default();
		let tool_call_id = msg
			.get("tool_call_id")
			.and_then(Value::as_str)
			.map(str::to_string);
		turns.push(Turn {
			role,
			content,
			tool_calls,
			tool_call_id,
			tool_name: msg.get("name").and_then(Value::as_str).map(str::to_string),
		});
	}

	let tool_spec = derive_tool_spec(&model);
	Ok(CanonicalRequest {
		model: tool_spec.base_model.clone(),
		turns,
		stream,
		tool_spec,
	})
}

fn parse_role(s: &str) -> Result<Role, AIError> {
	Ok(match s {
		"system" | "developer" => Role::System,
		"user" => Role::User,
		"assistant" => Role::Assistant,
		"tool" => Role::Tool,
		other => return Err(AIError::UnsupportedPart(format!("role {other}"))),
	})
}

fn parse_content(value: Option<&Value>) -> Result<TurnContent, AIError> {
	match value {
		None => Ok(TurnContent::Text(String::new())),
		Some(Value::String(s)) => Ok(TurnContent::Text(s.clone())),
		Some(Value::Array(parts)) => {
			let mut out = Vec::with_capacity(parts.len());
			for part in parts {
				let kind = part.get("type").and_then(Value::as_str).unwrap_or("text");
				match kind {
					"text" => {
						let text = part.get("text").and_then(Value::as_str).unwrap_or_default();
						out.push(ContentPart::Text { text: text.to_string() });
					},
					"image_url" => {
						let url = part
							.pointer("/image_url/url")
							.and_then(Value::as_str)
							.ok_or(AIError::MissingField("image_url.url"))?;
						out.push(ContentPart::ImageUrl { url: url.to_string() });
					},
					"video_url" => {
						let url = part
							.pointer("/video_url/url")
							.and_then(Value::as_str)
							.ok_or(AIError::MissingField("video_url.url"))?;
						out.push(ContentPart::VideoUrl { url: url.to_string() });
					},
					other => return Err(AIError::UnsupportedPart(other.to_string())),
				}
			}
			Ok(TurnContent::Parts(out))
		},
		Some(_) => Ok(TurnContent::Text(String::new())),
	}
}

fn parse_tool_call(v: &Value) -> Option<ToolCall> {
	let id = v.get("id")?.as_str()?.to_string();
	let name = v.pointer("/function/name")?.as_str()?.to_string();
	let args_str = v.pointer("/function/arguments").and_then(Value::as_str).unwrap_or("{}");
	let arguments = serde_json::from_str(args_str).unwrap_or(Value::Null);
	Some(ToolCall { id, name, arguments })
}

/// Build an OpenAI-shape completion object from a finished response
/// (§4.4's non-streaming / long-running path).
pub fn from_canonical(model: &str, resp: &CanonicalResponse, request_id: &str, created: i64) -> Value {
	let mut content = resp.text.clone();
	for image in &resp.images {
		content.push_str(&format!(
			"\n![generated image](data:{};base64,{})",
			image.mime_type, image.data_base64
		));
	}

	let finish_reason = match resp.finish_reason {
		FinishReason::Stop => "stop",
		FinishReason::ToolCalls => "tool_calls",
	};

	let mut message = json!({
		"role": "assistant",
		"content": content,
	});
	if !resp.tool_calls.is_empty() {
		message["tool_calls"] = Value::Array(
			resp
				.tool_calls
				.iter()
				.map(|c| {
					json!({
						"id": c.id,
						"type": "function",
						"function": {
							"name": c.name,
							"arguments": c.arguments.to_string(),
						},
					})
				})
				.collect(),
		);
	}

	let estimated_output = estimate_tokens(&content);
	json!({
		"id": request_id,
		"object": "chat.completion",
		"created": created,
		"model": model,
		"choices": [{
			"index": 0,
			"message": message,
			"finish_reason": finish_reason,
		}],
		"usage": {
			"prompt_tokens": 0,
			"completion_tokens": estimated_output,
			"total_tokens": estimated_output,
		},
	})
}

/// `length/4 + 500 per image` estimator used across C7's aggregators
/// (§4.7); kept here so both the pipeline and the stats module share one
/// definition.
pub fn estimate_tokens(text: &str) -> u64 {
	(text.len() as u64) / 4
}

/// Build a single OpenAI-shape SSE delta chunk.
pub fn stream_chunk(model: &str, request_id: &str, created: i64, delta: Value, finish_reason: Option<&str>) -> Value {
	json!({
		"id": request_id,
		"object": "chat.completion.chunk",
		"created": created,
		"model": model,
		"choices": [{
			"index": 0,
			"delta": delta,
			"finish_reason": finish_reason,
		}],
	})
}

#[cfg(test)]
mod tests {
	use super::*;
	use serde_json::json;

	#[test]
	fn simple_single_turn_round_trips_to_plain_text() {
		let body = json!({
			"model": "gemini-2.5-flash",
			"messages": [{"role": "user", "content": "hi"}],
			"stream": false,
		});
		let canonical = to_canonical(&body).unwrap();
		assert_eq!(canonical.model, "gemini-2.5-flash");
		assert_eq!(canonical.assemble_prompt(), "hi");
	}

	#[test]
	fn image_suffix_model_derives_single_tool() {
		let body = json!({
			"model": "gemini-2.5-flash-image",
			"messages": [{"role": "user", "content": "draw a cat"}],
		});
		let canonical = to_canonical(&body).unwrap();
		assert_eq!(canonical.model, "gemini-2.5-flash");
		assert_eq!(canonical.tool_spec.tools, vec![super::super::ToolKind::Image]);
	}

	#[test]
	fn multi_turn_conversation_flattens_with_speaker_tags() {
		let body = json!({
			"model": "gemini-2.5-flash",
			"messages": [
				{"role": "system", "content": "be terse"},
				{"role": "user", "content": "hi"},
				{"role": "assistant", "content": "hello"},
				{"role": "user", "content": "again"},
			],
		});
		let canonical = to_canonical(&body).unwrap();
		let prompt = canonical.assemble_prompt();
		assert!(prompt.starts_with("<system>\nbe terse\n</system>"));
		assert!(prompt.contains("Human: hi"));
		assert!(prompt.contains("Assistant: hello"));
		assert!(prompt.ends_with("Assistant:"));
	}
}
