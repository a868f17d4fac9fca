//! C4 (translation half) — the canonical request/response model shared by
//! the three wire dialects, plus tolerant parsing of upstream `streamAssist`
//! event bodies. Each dialect gets a pair of free functions
//! (`to_canonical`/`from_canonical`) rather than a trait object hierarchy —
//! the set of dialects is closed and small.

pub mod anthropic;
pub mod gemini;
pub mod openai;
pub mod parse;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AIError {
	#[error("request body is not valid JSON: {0}")]
	InvalidJson(#[from] serde_json::Error),
	#[error("request is missing required field {0}")]
	MissingField(&'static str),
	#[error("unsupported content part kind: {0}")]
	UnsupportedPart(String),
	#[error("unknown model: {0}")]
	UnknownModel(String),
	#[error("data: URL is missing a base64 payload")]
	MalformedDataUrl,
	#[error("invalid base64 payload: {0}")]
	Base64(#[from] base64::DecodeError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
	System,
	User,
	Assistant,
	Tool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ContentPart {
	Text { text: String },
	ImageUrl { url: String },
	VideoUrl { url: String },
	FileUrl { url: String, mime_type: Option<String> },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
	pub id: String,
	pub name: String,
	pub arguments: serde_json::Value,
}

#[derive(Debug, Clone)]
pub enum TurnContent {
	Text(String),
	Parts(Vec<ContentPart>),
}

#[derive(Debug, Clone)]
pub struct Turn {
	pub role: Role,
	pub content: TurnContent,
	/// Present on assistant turns that requested tool calls.
	pub tool_calls: Vec<ToolCall>,
	/// Present on tool turns: which call this is a result for.
	pub tool_call_id: Option<String>,
	pub tool_name: Option<String>,
}

impl Turn {
	pub fn text(role: Role, text: impl Into<String>) -> Self {
		Turn {
			role,
			content: TurnContent::Text(text.into()),
			tool_calls: Vec::new(),
			tool_call_id: None,
			tool_name: None,
		}
	}

	fn plain_text(&self) -> String {
		match &self.content {
			TurnContent::Text(t) => t.clone(),
			TurnContent::Parts(parts) => parts
				.iter()
				.filter_map(|p| match p {
					ContentPart::Text { text } => Some(text.clone()),
					_ => None,
				})
				.collect::<Vec<_>>()
				.join("\n"),
		}
	}

	fn media_parts(&self) -> Vec<&ContentPart> {
		match &self.content {
			TurnContent::Text(_) => Vec::new(),
			TurnContent::Parts(parts) => parts
				.iter()
				.filter(|p| !matches!(p, ContentPart::Text { .. }))
				.collect(),
		}
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolKind {
	Image,
	Video,
	Search,
}

/// Which generator tools a model-name suffix enables. No suffix enables all
/// three (§4.4): `-image`, `-video`, `-search`.
#[derive(Debug, Clone)]
pub struct ToolSpec {
	pub base_model: String,
	pub tools: Vec<ToolKind>,
}

pub fn derive_tool_spec(model: &str) -> ToolSpec {
	const SUFFIXES: [(&str, ToolKind); 3] = [
		("-image", ToolKind::Image),
		("-video", ToolKind::Video),
		("-search", ToolKind::Search),
	];
	for (suffix, kind) in SUFFIXES {
		if let Some(base) = model.strip_suffix(suffix) {
			return ToolSpec {
				base_model: base.to_string(),
				tools: vec![kind],
			};
		}
	}
	ToolSpec {
		base_model: model.to_string(),
		tools: vec![ToolKind::Image, ToolKind::Video, ToolKind::Search],
	}
}

#[derive(Debug, Clone)]
pub struct CanonicalRequest {
	pub model: String,
	pub turns: Vec<Turn>,
	pub stream: bool,
	pub tool_spec: ToolSpec,
}

impl CanonicalRequest {
	fn is_multi_turn(&self) -> bool {
		self
			.turns
			.iter()
			.any(|t| matches!(t.role, Role::Assistant | Role::Tool))
	}

	fn system_text(&self) -> Option<String> {
		let texts: Vec<String> = self
			.turns
			.iter()
			.filter(|t| t.role == Role::System)
			.map(|t| t.plain_text())
			.filter(|t| !t.trim().is_empty())
			.collect();
		if texts.is_empty() {
			None
		} else {
			Some(texts.join("\n\n"))
		}
	}

	/// Render the dialog into the single string the upstream `prompt` field
	/// expects, per §4.4's "Prompt assembly" rule.
	pub fn assemble_prompt(&self) -> String {
		let system = self.system_text();
		if self.is_multi_turn() {
			let mut out = String::new();
			if let Some(sys) = &system {
				out.push_str("<system>\n");
				out.push_str(sys);
				out.push_str("\n</system>\n\n");
			}
			for turn in self.turns.iter().filter(|t| t.role != Role::System) {
				match turn.role {
					Role::User => {
						out.push_str("Human: ");
						out.push_str(&turn.plain_text());
						out.push('\n');
					},
					Role::Assistant => {
						out.push_str("Assistant: ");
						out.push_str(&turn.plain_text());
						out.push('\n');
					},
					Role::Tool => {
						let name = turn.tool_name.as_deref().unwrap_or("tool");
						out.push_str(&format!("Tool Result [{name}]: "));
						out.push_str(&turn.plain_text());
						out.push('\n');
					},
					Role::System => unreachable!("filtered above"),
				}
			}
			out.push_str("Assistant:");
			out
		} else {
			let user_text = self
				.turns
				.iter()
				.find(|t| t.role == Role::User)
				.map(|t| t.plain_text())
				.unwrap_or_default();
			match &system {
				Some(sys) => format!("<system>\n{sys}\n</system>\n\n{user_text}"),
				None => user_text,
			}
		}
	}

	/// All non-text parts across every turn, in turn order, for media
	/// upload (§4.4 "Media handling").
	pub fn media_parts(&self) -> Vec<&ContentPart> {
		self.turns.iter().flat_map(|t| t.media_parts()).collect()
	}
}

#[derive(Debug, Clone, Default)]
pub struct CanonicalResponse {
	pub text: String,
	/// Reasoning/"thought" segments, kept separate so dialects can decide
	/// whether to surface them.
	pub thoughts: Vec<String>,
	pub images: Vec<InlineImage>,
	pub files: Vec<GeneratedFile>,
	pub tool_calls: Vec<ToolCall>,
	pub finish_reason: FinishReason,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FinishReason {
	#[default]
	Stop,
	ToolCalls,
}

#[derive(Debug, Clone)]
pub struct InlineImage {
	pub mime_type: String,
	pub data_base64: String,
}

#[derive(Debug, Clone)]
pub struct GeneratedFile {
	pub file_id: String,
	pub mime_type: String,
	/// Populated once the two-step fetch completes.
	pub bytes: Option<Vec<u8>>,
}

impl CanonicalResponse {
	/// §4.4: a response counts as a success signal only if it carries text,
	/// inline data, a file reference, or a function call — thought-only or
	/// empty bodies must be retried.
	pub fn is_meaningful(&self) -> bool {
		!self.text.trim().is_empty()
			|| !self.images.is_empty()
			|| !self.files.is_empty()
			|| !self.tool_calls.is_empty()
	}
}
