//! The upstream chat/multimodal backend client: JWT minting via the XSRF
//! endpoint, session creation, `streamAssist`, and generated-file
//! retrieval. One `UpstreamClient` is shared process-wide; it holds no
//! per-account state (that lives on `Account`).

use std::time::Duration;

use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::account::{Account, cookies_to_header};

const DEFAULT_BASE_URL: &str = "https://gemini.google.com";
const XSRF_PATH: &str = "/_/BardChatUi/data/assistant.lamda.BardFrontendService/GetAccessToken";
const CREATE_SESSION_PATH: &str = "/_/BardChatUi/data/batchexecute";
const STREAM_ASSIST_PATH: &str = "/_/BardChatUi/data/assistant.lamda.BardFrontendService/StreamGenerate";
const FILE_METADATA_PATH: &str = "/_/BardChatUi/data/batchexecute";

#[derive(Debug, Error)]
pub enum UpstreamError {
	#[error("upstream request failed: {0}")]
	Request(#[from] reqwest::Error),
	#[error("upstream returned {status}: {body}")]
	Status { status: StatusCode, body: String },
	#[error("upstream auth failed ({status})")]
	Unauthorized { status: StatusCode },
	#[error("upstream response was not valid JSON: {0}")]
	BadJson(String),
	#[error("media download for a client-supplied URL failed ({status})")]
	MediaDownloadFailed { status: StatusCode },
}

impl UpstreamError {
	pub fn is_auth_failure(&self) -> bool {
		matches!(self, UpstreamError::Unauthorized { .. })
	}

	/// True for a 401/403 hit while fetching a client-supplied URL, as
	/// opposed to our own account's upstream auth (§4.4 "Media-upload-failed").
	pub fn is_media_download_failure(&self) -> bool {
		matches!(self, UpstreamError::MediaDownloadFailed { .. })
	}
}

pub struct MintedJwt {
	pub token: String,
	pub ttl_secs: Option<u64>,
}

#[derive(Clone)]
pub struct UpstreamClient {
	http: Client,
	/// Separate, shorter-timeout client for registrar calls (§5).
	registrar_http: Client,
	/// Scheme+host the chat endpoints are built against. Always the real
	/// upstream in production; overridden by tests to point at a mock server.
	base_url: String,
}

impl UpstreamClient {
	pub fn new() -> Self {
		Self::with_base_url(DEFAULT_BASE_URL)
	}

	/// Construct a client against a non-default base URL, e.g. a wiremock
	/// server address in tests.
	pub fn with_base_url(base_url: impl Into<String>) -> Self {
		let http = Client::builder()
			.timeout(Duration::from_secs(30))
			.build()
			.expect("failed to build upstream http client");
		let registrar_http = Client::builder()
			.timeout(Duration::from_secs(5))
			.build()
			.expect("failed to build registrar http client");
		Self {
			http,
			registrar_http,
			base_url: base_url.into(),
		}
	}

	pub fn registrar_client(&self) -> &Client {
		&self.registrar_http
	}

	fn endpoint(&self, path: &str) -> String {
		format!("{}{}", self.base_url, path)
	}

	fn auth_headers(account: &Account) -> Vec<(&'static str, String)> {
		vec![
			("authorization", account.authorization.clone()),
			("cookie", cookies_to_header(&account.cookies)),
		]
	}

	/// Mint a short-lived JWT for `account` by calling the upstream XSRF
	/// endpoint with its cookies + authorization header.
	pub async fn mint_jwt(&self, account: &Account) -> Result<MintedJwt, UpstreamError> {
		let mut req = self.http.post(self.endpoint(XSRF_PATH));
		for (k, v) in Self::auth_headers(account) {
			req = req.header(k, v);
		}
		let resp = req.send().await?;
		let status = resp.status();
		if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
			return Err(UpstreamError::Unauthorized { status });
		}
		let body = resp.text().await?;
		if !status.is_success() {
			return Err(UpstreamError::Status { status, body });
		}
		let parsed: XsrfResponse =
			serde_json::from_str(&body).map_err(|e| UpstreamError::BadJson(e.to_string()))?;
		Ok(MintedJwt {
			token: parsed.token,
			ttl_secs: parsed.ttl_secs,
		})
	}

	/// Create an upstream conversation session, required before any media
	/// upload. Transient HTTP 400 is retried by the caller (pipeline), not
	/// here. `request_time_session_id` is the session the pipeline already
	/// generated for this request; if the upstream response omits a session
	/// id, that one is reused (§4.4).
	pub async fn create_session(
		&self,
		account: &Account,
		jwt: &str,
		request_time_session_id: &str,
	) -> Result<SessionHandle, UpstreamError> {
		let resp = self
			.http
			.post(self.endpoint(CREATE_SESSION_PATH))
			.bearer_auth(jwt)
			.header("cookie", cookies_to_header(&account.cookies))
			.json(&serde_json::json!({ "configId": account.config_id }))
			.send()
			.await?;
		let status = resp.status();
		if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
			return Err(UpstreamError::Unauthorized { status });
		}
		let body = resp.text().await?;
		if !status.is_success() {
			return Err(UpstreamError::Status { status, body });
		}
		let parsed: CreateSessionResponse =
			serde_json::from_str(&body).map_err(|e| UpstreamError::BadJson(e.to_string()))?;
		Ok(SessionHandle {
			session_id: parsed.session_id.unwrap_or_else(|| request_time_session_id.to_string()),
		})
	}

	/// Upload a single media part (inline bytes or a URL reference) into an
	/// existing session.
	pub async fn upload_media(
		&self,
		account: &Account,
		jwt: &str,
		session: &SessionHandle,
		upload: &MediaUpload,
	) -> Result<UploadedMedia, UpstreamError> {
		let body = match upload {
			MediaUpload::Url(url) => serde_json::json!({
				"sessionId": session.session_id,
				"url": url,
			}),
			MediaUpload::Inline { mime_type, data } => serde_json::json!({
				"sessionId": session.session_id,
				"mimeType": mime_type,
				"data": data,
			}),
		};
		let resp = self
			.http
			.post(self.endpoint(CREATE_SESSION_PATH))
			.bearer_auth(jwt)
			.header("cookie", cookies_to_header(&account.cookies))
			.json(&body)
			.send()
			.await?;
		let status = resp.status();
		if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
			return Err(UpstreamError::Unauthorized { status });
		}
		if !status.is_success() {
			let body = resp.text().await.unwrap_or_default();
			return Err(UpstreamError::Status { status, body });
		}
		let parsed: UploadMediaResponse = resp
			.json()
			.await
			.map_err(|e| UpstreamError::BadJson(e.to_string()))?;
		Ok(UploadedMedia {
			media_id: parsed.media_id,
		})
	}

	/// Download bytes for a client-supplied HTTP(S) media URL. 401/403 here
	/// is surfaced straight to the client (§4.4): the URL is user-supplied,
	/// not ours to retry with a different account.
	pub async fn download_client_media(&self, url: &str) -> Result<(String, Vec<u8>), UpstreamError> {
		let resp = self.http.get(url).send().await?;
		let status = resp.status();
		if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
			return Err(UpstreamError::MediaDownloadFailed { status });
		}
		if !status.is_success() {
			return Err(UpstreamError::Status {
				status,
				body: String::new(),
			});
		}
		let content_type = resp
			.headers()
			.get(reqwest::header::CONTENT_TYPE)
			.and_then(|v| v.to_str().ok())
			.unwrap_or("application/octet-stream")
			.to_string();
		let bytes = resp.bytes().await?;
		Ok((content_type, bytes.to_vec()))
	}

	/// Run `streamAssist`: the single request whose full body the gateway
	/// reads, then chunks back out to the client itself (§4.4 — upstream
	/// responses are not actually streamed back transparently).
	pub async fn stream_assist(
		&self,
		account: &Account,
		jwt: &str,
		session: &SessionHandle,
		req: &StreamAssistRequest,
	) -> Result<(StatusCode, String), UpstreamError> {
		let resp = self
			.http
			.post(self.endpoint(STREAM_ASSIST_PATH))
			.bearer_auth(jwt)
			.header("cookie", cookies_to_header(&account.cookies))
			.json(&serde_json::json!({
				"sessionId": session.session_id,
				"modelId": req.model_id,
				"prompt": req.prompt,
				"tools": req.tools,
			}))
			.send()
			.await?;
		let status = resp.status();
		let body = resp.text().await?;
		Ok((status, body))
	}

	/// Two-step generated-file fetch: resolve metadata to a session path,
	/// then GET the download URL.
	pub async fn fetch_generated_file(
		&self,
		account: &Account,
		jwt: &str,
		session: &SessionHandle,
		file_ref: &GeneratedFileRef,
	) -> Result<Vec<u8>, UpstreamError> {
		let meta_resp = self
			.http
			.post(self.endpoint(FILE_METADATA_PATH))
			.bearer_auth(jwt)
			.header("cookie", cookies_to_header(&account.cookies))
			.json(&serde_json::json!({
				"sessionId": session.session_id,
				"fileId": file_ref.file_id,
			}))
			.send()
			.await?;
		let status = meta_resp.status();
		if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
			return Err(UpstreamError::Unauthorized { status });
		}
		let meta: FileMetadataResponse = meta_resp
			.json()
			.await
			.map_err(|e| UpstreamError::BadJson(e.to_string()))?;

		let dl_resp = self
			.http
			.get(&meta.download_url)
			.bearer_auth(jwt)
			.header("cookie", cookies_to_header(&account.cookies))
			.send()
			.await?;
		let status = dl_resp.status();
		if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
			return Err(UpstreamError::Unauthorized { status });
		}
		if !status.is_success() {
			return Err(UpstreamError::Status {
				status,
				body: String::new(),
			});
		}
		Ok(dl_resp.bytes().await?.to_vec())
	}
}

impl Default for UpstreamClient {
	fn default() -> Self {
		Self::new()
	}
}

#[derive(Debug, Clone)]
pub struct SessionHandle {
	pub session_id: String,
}

#[derive(Debug, Clone)]
pub struct UploadedMedia {
	pub media_id: String,
}

#[derive(Debug, Clone)]
pub enum MediaUpload {
	Url(String),
	Inline { mime_type: String, data: String },
}

#[derive(Debug, Clone)]
pub struct GeneratedFileRef {
	pub file_id: String,
	pub mime_type: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct StreamAssistRequest {
	pub model_id: String,
	pub prompt: String,
	pub tools: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct XsrfResponse {
	token: String,
	#[serde(default, rename = "ttlSecs")]
	ttl_secs: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct CreateSessionResponse {
	#[serde(rename = "sessionId", default)]
	session_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct UploadMediaResponse {
	#[serde(rename = "mediaId")]
	media_id: String,
}

#[derive(Debug, Deserialize)]
struct FileMetadataResponse {
	#[serde(rename = "downloadUrl")]
	download_url: String,
}
