//! Gemini `generateContent`/`streamGenerateContent` dialect ↔ canonical
//! form. `systemInstruction` is merged as a leading system turn; the
//! `model` role maps to `assistant` (§4.4).

use serde_json::{Value, json};

use super::{
	AIError, CanonicalRequest, CanonicalResponse, ContentPart, FinishReason, Role, Turn, TurnContent,
	derive_tool_spec,
};

pub fn to_canonical(model_path: &str, body: &Value) -> Result<CanonicalRequest, AIError> {
	let mut turns = Vec::new();
	if let Some(text) = body
		.pointer("/systemInstruction/parts/0/text")
		.and_then(Value::as_str)
	{
		turns.push(Turn::text(Role::System, text));
	}

	let contents = body
		.get("contents")
		.and_then(Value::as_array)
		.ok_or(AIError::MissingField("contents"))?;
	for content in contents {
		let role = match content.get("role").and_then(Value::as_str) {
			Some("model") => Role::Assistant,
			_ => Role::User,
		};
		let parts = content
			.get("parts")
			.and_then(Value::as_array)
			.ok_or(AIError::MissingField("parts"))?;
		let mut out_parts = Vec::with_capacity(parts.len());
		for part in parts {
			if let Some(text) = part.get("text").and_then(Value::as_str) {
				out_parts.push(ContentPart::Text { text: text.to_string() });
				continue;
			}
			if let Some(inline) = part.get("inlineData") {
				let mime = inline.get("mimeType").and_then(Value::as_str).unwrap_or("image/png");
				let data = inline
					.get("data")
					.and_then(Value::as_str)
					.ok_or(AIError::MissingField("inlineData.data"))?;
				out_parts.push(ContentPart::ImageUrl {
					url: format!("data:{mime};base64,{data}"),
				});
				continue;
			}
			if let Some(file_data) = part.get("fileData") {
				let uri = file_data
					.get("fileUri")
					.and_then(Value::as_str)
					.ok_or(AIError::MissingField("fileData.fileUri"))?;
				let mime = file_data.get("mimeType").and_then(Value::as_str).map(str::to_string);
				out_parts.push(ContentPart::FileUrl {
					url: uri.to_string(),
					mime_type: mime,
				});
				continue;
			}
			return Err(AIError::UnsupportedPart("unknown gemini part".into()));
		}
		turns.push(Turn {
			role,
			content: TurnContent::Parts(out_parts),
			tool_calls: Vec::new(),
			tool_call_id: None,
			tool_name: None,
		});
	}

	let tool_spec = derive_tool_spec(model_path);
	Ok(CanonicalRequest {
		model: tool_spec.base_model.clone(),
		turns,
		stream: false,
		tool_spec,
	})
}

/// Build a Gemini `generateContent`-shape response.
pub fn from_canonical(resp: &CanonicalResponse) -> Value {
	let mut parts = Vec::new();
	if !resp.text.is_empty() {
		parts.push(json!({"text": resp.text}));
	}
	for image in &resp.images {
		parts.push(json!({"inlineData": {"mimeType": image.mime_type, "data": image.data_base64}}));
	}
	for call in &resp.tool_calls {
		parts.push(json!({"functionCall": {"name": call.name, "args": call.arguments}}));
	}

	let finish_reason = match resp.finish_reason {
		FinishReason::Stop => "STOP",
		FinishReason::ToolCalls => "STOP",
	};

	json!({
		"candidates": [{
			"content": {"role": "model", "parts": parts},
			"finishReason": finish_reason,
			"index": 0,
		}],
		"usageMetadata": {
			"promptTokenCount": 0,
			"candidatesTokenCount": super::openai::estimate_tokens(&resp.text),
		},
	})
}

#[cfg(test)]
mod tests {
	use super::*;
	use serde_json::json;

	#[test]
	fn model_role_maps_to_assistant() {
		let body = json!({
			"contents": [
				{"role": "user", "parts": [{"text": "hi"}]},
				{"role": "model", "parts": [{"text": "hello"}]},
			],
		});
		let canonical = to_canonical("gemini-2.5-flash", &body).unwrap();
		assert_eq!(canonical.turns[1].role, Role::Assistant);
	}

	#[test]
	fn system_instruction_merges_as_leading_turn() {
		let body = json!({
			"systemInstruction": {"parts": [{"text": "be terse"}]},
			"contents": [{"role": "user", "parts": [{"text": "hi"}]}],
		});
		let canonical = to_canonical("gemini-2.5-flash", &body).unwrap();
		assert_eq!(canonical.turns[0].role, Role::System);
	}
}
