//! Claude Messages dialect ↔ canonical form. Claude's top-level `system` is
//! merged as a leading system turn (§4.4).

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

	let mut turns = Vec::new();
	if let Some(system) = body.get("system") {
		let text = match system {
			Value::String(s) => s.clone(),
			Value::Array(blocks) => blocks
				.iter()
				.filter_map(|b| b.get("text").and_then(Value::as_str))
				.collect::<Vec<_>>()
				.join("\n"),
			_ => String::new(),
		};
		if !text.is_empty() {
			turns.push(Turn::text(Role::System, text));
		}
	}

	let messages = body
		.get("messages")
		.and_then(Value::as_array)
		.ok_or(AIError::MissingField("messages"))?;
	for msg in messages {
		let role = match msg.get("role").and_then(Value::as_str) {
			Some("user") => Role::User,
			Some("assistant") => Role::Assistant,
			other => return Err(AIError::UnsupportedPart(format!("role {other:?}"))),
		};
		let (content, tool_calls, tool_turns) = parse_blocks(msg.get("content"))?;
		turns.push(Turn {
			role,
			content,
			tool_calls,
			tool_call_id: None,
			tool_name: None,
		});
		turns.extend(tool_turns);
	}

	let tool_spec = derive_tool_spec(&model);
	Ok(CanonicalRequest {
		model: tool_spec.base_model.clone(),
		turns,
		stream,
		tool_spec,
	})
}

/// Claude content blocks can mix text/image/tool_use/tool_result in one
/// array; tool_result blocks become their own synthetic `Tool` turns since
/// the canonical model keeps them as distinct turns.
fn parse_blocks(value: Option<&Value>) -> Result<(TurnContent, Vec<ToolCall>, Vec<Turn>), AIError> {
	match value {
		None => Ok((TurnContent::Text(String::new()), Vec::new(), Vec::new())),
		Some(Value::String(s)) => Ok((TurnContent::Text(s.clone()), Vec::new(), Vec::new())),
		Some(Value::Array(blocks)) => {
			let mut parts = Vec::new();
			let mut tool_calls = Vec::new();
			let mut tool_turns = Vec::new();
			for block in blocks {
				match block.get("type").and_then(Value::as_str) {
					Some("text") => {
						let text = block.get("text").and_then(Value::as_str).unwrap_or_default();
						parts.push(ContentPart::Text { text: text.to_string() });
					},
					Some("image") => {
						let url = block
							.pointer("/source/data")
							.and_then(Value::as_str)
							.map(|data| {
								let mime = block
									.pointer("/source/media_type")
									.and_then(Value::as_str)
									.unwrap_or("image/png");
								format!("data:{mime};base64,{data}")
							})
							.ok_or(AIError::MissingField("image.source"))?;
						parts.push(ContentPart::ImageUrl { url });
					},
					Some("tool_use") => {
						let id = block.get("id").and_then(Value::as_str).unwrap_or_default().to_string();
						let name = block.get("name").and_then(Value::as_str).unwrap_or_default().to_string();
						let arguments = block.get("input").cloned().unwrap_or(Value::Null);
						tool_calls.push(ToolCall { id, name, arguments });
					},
					Some("tool_result") => {
						let tool_call_id = block.get("tool_use_id").and_then(Value::as_str).map(str::to_string);
						let text = block
							.get("content")
							.map(|c| match c {
								Value::String(s) => s.clone(),
								other => other.to_string(),
							})
							.unwrap_or_default();
						tool_turns.push(Turn {
							role: Role::Tool,
							content: TurnContent::Text(text),
							tool_calls: Vec::new(),
							tool_call_id,
							tool_name: None,
						});
					},
					other => return Err(AIError::UnsupportedPart(format!("{other:?}"))),
				}
			}
			Ok((TurnContent::Parts(parts), tool_calls, tool_turns))
		},
		Some(_) => Ok((TurnContent::Text(String::new()), Vec::new(), Vec::new())),
	}
}

/// Build a Claude Messages-shape response object.
pub fn from_canonical(model: &str, resp: &CanonicalResponse, message_id: &str) -> Value {
	let mut content = Vec::new();
	if !resp.text.is_empty() {
		content.push(json!({"type": "text", "text": resp.text}));
	}
	for image in &resp.images {
		content.push(json!({
			"type": "image",
			"source": {"type": "base64", "media_type": image.mime_type, "data": image.data_base64},
		}));
	}
	for call in &resp.tool_calls {
		content.push(json!({
			"type": "tool_use",
			"id": call.id,
			"name": call.name,
			"input": call.arguments,
		}));
	}

	let stop_reason = match resp.finish_reason {
		FinishReason::Stop => "end_turn",
		FinishReason::ToolCalls => "tool_use",
	};

	json!({
		"id": message_id,
		"type": "message",
		"role": "assistant",
		"model": model,
		"content": content,
		"stop_reason": stop_reason,
		"usage": {
			"input_tokens": 0,
			"output_tokens": super::openai::estimate_tokens(&resp.text),
		},
	})
}

#[cfg(test)]
mod tests {
	use super::*;
	use serde_json::json;

	#[test]
	fn top_level_system_merges_as_leading_turn() {
		let body = json!({
			"model": "gemini-2.5-pro",
			"system": "be terse",
			"messages": [{"role": "user", "content": "hi"}],
		});
		let canonical = to_canonical(&body).unwrap();
		assert_eq!(canonical.turns[0].role, Role::System);
		assert_eq!(canonical.assemble_prompt(), "<system>\nbe terse\n</system>\n\nhi");
	}

	#[test]
	fn tool_result_block_becomes_a_tool_turn() {
		let body = json!({
			"model": "gemini-2.5-pro",
			"messages": [
				{"role": "user", "content": "what's the weather"},
				{"role": "assistant", "content": [{"type": "tool_use", "id": "t1", "name": "weather", "input": {}}]},
				{"role": "user", "content": [{"type": "tool_result", "tool_use_id": "t1", "content": "sunny"}]},
			],
		});
		let canonical = to_canonical(&body).unwrap();
		assert!(canonical.turns.iter().any(|t| t.role == Role::Tool));
	}
}
