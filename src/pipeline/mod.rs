//! C4 — request pipeline: the attempt loop that ties the account pool, the
//! canonical translation layer, and the upstream client together.

pub mod media;
pub mod stream;

use std::sync::Arc;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use futures::future::join_all;
use thiserror::Error;
use tokio::sync::Semaphore;
use tracing::{Instrument, Span, info, warn};

use crate::account::Account;
use crate::account::pool::AccountPool;
use crate::llm::parse::{assemble_response, body_indicates_auth_envelope, body_indicates_quota_exhausted, parse_events};
use crate::llm::{AIError, CanonicalRequest, CanonicalResponse};
use crate::telemetry::log as telemetry_log;
use crate::upstream::{GeneratedFileRef, MediaUpload, StreamAssistRequest, UpstreamClient, UpstreamError};

const MAX_ATTEMPTS: u32 = 3;
const MAX_SESSION_RETRIES: u32 = 3;
const RATE_LIMIT_COOLDOWN_FACTOR: i64 = 3;
const QUOTA_COOLDOWN_FACTOR: i64 = 5;
const MAX_PARALLEL_FILE_DOWNLOADS: usize = 8;

#[derive(Debug, Error)]
pub enum PipelineError {
	#[error(transparent)]
	Ai(#[from] AIError),
	#[error("no healthy account is currently available")]
	NoAccountAvailable,
	#[error("all {attempts} attempts against upstream failed: {source}")]
	AttemptsExhausted { attempts: u32, source: UpstreamError },
	#[error("media download failed: {0}")]
	MediaDownloadFailed(#[from] UpstreamError),
	#[error("generated files could not be retrieved; ask the client to resend")]
	DownloadNeedsRetry,
}

impl PipelineError {
	/// Stable machine-readable code surfaced in JSON error bodies (§7).
	pub fn code(&self) -> &'static str {
		match self {
			PipelineError::Ai(_) => "invalid_request",
			PipelineError::NoAccountAvailable => "no_account_available",
			PipelineError::AttemptsExhausted { .. } => "upstream_error",
			PipelineError::MediaDownloadFailed(e) if matches!(e, UpstreamError::MediaDownloadFailed { .. }) => {
				"media_download_failed"
			},
			PipelineError::MediaDownloadFailed(_) => "upstream_error",
			PipelineError::DownloadNeedsRetry => "download_needs_retry",
		}
	}
}

pub struct Pipeline {
	pool: Arc<AccountPool>,
	upstream: Arc<UpstreamClient>,
}

/// Outcome of a single attempt, used to decide whether to rotate accounts
/// and how to adjust the account's cooldown/fail bookkeeping (§4.4 step 6).
enum AttemptOutcome {
	Success(CanonicalResponse),
	/// Retry with a new account; does not count as a used-failure.
	AuthFailure,
	/// Retry with a new account; does not consume an attempt slot.
	RateLimited,
	/// Retry with a new account; counts as a used-failure.
	Transient,
	/// Retry with a new account; 5x cooldown, counts as a used-failure.
	QuotaExhausted,
	/// Retry with a new account; no success credit, no failure credit.
	Empty,
}

/// Internal error type for a single attempt. Distinguishes errors that
/// belong to our account (rotate, mark used) from ones that are terminal to
/// the whole request (§4.4 "Media-upload-failed", "Download-needs-retry").
enum AttemptError {
	Upstream(UpstreamError),
	/// A client-supplied media URL itself returned 401/403; not our account's
	/// fault, surfaced straight to the client with no rotation.
	ClientMedia(UpstreamError),
	/// All generated-file downloads came back 401/403; the account has
	/// already been flagged for refresh by the time this is returned.
	DownloadNeedsRetry,
}

impl From<UpstreamError> for AttemptError {
	fn from(e: UpstreamError) -> Self {
		AttemptError::Upstream(e)
	}
}

impl Pipeline {
	pub fn new(pool: Arc<AccountPool>, upstream: Arc<UpstreamClient>) -> Self {
		Self { pool, upstream }
	}

	/// Run the full attempt loop for `req`, returning the final response or
	/// the error to surface to the client. `request_id`/`route` seed the
	/// per-request span (§C0); account, attempt number, and outcome are
	/// recorded onto it as the loop progresses.
	pub async fn run(
		&self,
		req: &CanonicalRequest,
		request_time_session_id: &str,
		request_id: &str,
		route: &str,
	) -> Result<CanonicalResponse, PipelineError> {
		let span = telemetry_log::request_span(request_id, route, &req.model);
		self.run_attempts(req, request_time_session_id, &span).instrument(span.clone()).await
	}

	async fn run_attempts(
		&self,
		req: &CanonicalRequest,
		request_time_session_id: &str,
		span: &Span,
	) -> Result<CanonicalResponse, PipelineError> {
		let mut last_error: Option<UpstreamError> = None;
		let mut attempts = 0u32;

		loop {
			// Rate-limit retries don't consume an attempt slot (§4.4 step 6),
			// so this loop can run more than MAX_ATTEMPTS iterations overall.
			if attempts >= MAX_ATTEMPTS {
				break;
			}
			telemetry_log::record_attempt(span, attempts + 1);

			let Some(mut account) = self.pool.next() else {
				return Err(PipelineError::NoAccountAvailable);
			};
			let email = account.email.clone();
			telemetry_log::record_account(span, &account.mask_email());

			match self.attempt(&mut account, req, request_time_session_id).await {
				Ok(AttemptOutcome::Success(resp)) => {
					self.pool.mark_used(&email, true);
					telemetry_log::record_outcome(span, "success");
					info!(email = %account.mask_email(), "request served");
					return Ok(resp);
				},
				Ok(AttemptOutcome::AuthFailure) => {
					self.pool.mark_needs_refresh(&email);
					telemetry_log::record_outcome(span, "auth_failure");
					attempts += 1;
				},
				Ok(AttemptOutcome::RateLimited) => {
					self.pool.extend_cooldown(&email, RATE_LIMIT_COOLDOWN_FACTOR);
					telemetry_log::record_outcome(span, "rate_limited");
					// not counted against attempts
				},
				Ok(AttemptOutcome::QuotaExhausted) => {
					self.pool.extend_cooldown(&email, QUOTA_COOLDOWN_FACTOR);
					self.pool.mark_used(&email, false);
					telemetry_log::record_outcome(span, "quota_exhausted");
					attempts += 1;
				},
				Ok(AttemptOutcome::Transient) => {
					self.pool.mark_used(&email, false);
					telemetry_log::record_outcome(span, "transient");
					attempts += 1;
				},
				Ok(AttemptOutcome::Empty) => {
					telemetry_log::record_outcome(span, "empty");
					attempts += 1;
				},
				Err(AttemptError::ClientMedia(e)) => {
					telemetry_log::record_outcome(span, "media_download_failed");
					return Err(PipelineError::MediaDownloadFailed(e));
				},
				Err(AttemptError::DownloadNeedsRetry) => {
					telemetry_log::record_outcome(span, "download_needs_retry");
					return Err(PipelineError::DownloadNeedsRetry);
				},
				Err(AttemptError::Upstream(e)) => {
					warn!(email = %account.mask_email(), error = %e, "attempt failed with media/session error");
					self.pool.mark_used(&email, false);
					telemetry_log::record_outcome(span, "upstream_error");
					last_error = Some(e);
					attempts += 1;
				},
			}
		}

		Err(match last_error {
			Some(source) => PipelineError::AttemptsExhausted {
				attempts: MAX_ATTEMPTS,
				source,
			},
			None => PipelineError::NoAccountAvailable,
		})
	}

	async fn attempt(
		&self,
		account: &mut Account,
		req: &CanonicalRequest,
		request_time_session_id: &str,
	) -> Result<AttemptOutcome, AttemptError> {
		let (jwt, _config_id) = match account.get_jwt(&self.upstream).await {
			Ok(pair) => pair,
			Err(crate::account::AccountError::Upstream(e)) if e.is_auth_failure() => {
				return Ok(AttemptOutcome::AuthFailure);
			},
			Err(crate::account::AccountError::Upstream(e)) => return Err(AttemptError::Upstream(e)),
			Err(_) => return Ok(AttemptOutcome::Transient),
		};

		let session = match self.create_session_with_retry(account, &jwt, request_time_session_id).await {
			Ok(session) => session,
			Err(e) if e.is_auth_failure() => return Ok(AttemptOutcome::AuthFailure),
			Err(_) => return Ok(AttemptOutcome::Transient),
		};

		for part in req.media_parts() {
			let resolved = media::resolve(part).map_err(|_| {
				AttemptError::Upstream(UpstreamError::Status {
					status: reqwest::StatusCode::BAD_REQUEST,
					body: "unsupported media part".into(),
				})
			})?;
			match &resolved {
				media::ResolvedMedia::Remote(url) => {
					let upload = media::resolved_to_upload(&resolved);
					if self.upstream.upload_media(account, &jwt, &session, &upload).await.is_err() {
						// §4.4 "Media-upload-failed": on rejection, fetch the
						// bytes ourselves and retry the upload inline. If the
						// client's own URL is what's unauthorized, that's
						// terminal and not our account's fault.
						let (mime_type, bytes) =
							self.upstream.download_client_media(url).await.map_err(|e| {
								if e.is_media_download_failure() {
									AttemptError::ClientMedia(e)
								} else {
									AttemptError::Upstream(e)
								}
							})?;
						let inline = MediaUpload::Inline {
							mime_type,
							data: BASE64.encode(&bytes),
						};
						self.upstream.upload_media(account, &jwt, &session, &inline).await?;
					}
				},
				media::ResolvedMedia::Inline { .. } => {
					let upload = media::resolved_to_upload(&resolved);
					self.upstream.upload_media(account, &jwt, &session, &upload).await?;
				},
			}
		}

		let tool_names: Vec<String> = req
			.tool_spec
			.tools
			.iter()
			.map(|t| format!("{t:?}").to_lowercase())
			.collect();
		let assist_req = StreamAssistRequest {
			model_id: req.tool_spec.base_model.clone(),
			prompt: req.assemble_prompt(),
			tools: tool_names,
		};

		let (status, body) = self.upstream.stream_assist(account, &jwt, &session, &assist_req).await?;

		if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
			return Ok(AttemptOutcome::AuthFailure);
		}
		if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
			return Ok(AttemptOutcome::RateLimited);
		}
		if status == reqwest::StatusCode::BAD_REQUEST {
			return Ok(AttemptOutcome::Transient);
		}
		if !status.is_success() {
			return Ok(AttemptOutcome::Transient);
		}
		if body_indicates_auth_envelope(&body) {
			return Ok(AttemptOutcome::AuthFailure);
		}
		if body_indicates_quota_exhausted(&body) {
			return Ok(AttemptOutcome::QuotaExhausted);
		}

		let events = parse_events(&body);
		let mut response = assemble_response(events);
		if !response.is_meaningful() {
			return Ok(AttemptOutcome::Empty);
		}

		if !response.files.is_empty() {
			match self.fetch_generated_files(account, &jwt, &session, &mut response).await {
				Ok(()) => {},
				Err(FileFetchOutcome::NeedsRetry) => {
					// §4.4/§7 "Download-needs-retry": the account is flagged
					// for refresh here; the request itself is not retried
					// with a different account, the client is told to resend.
					self.pool.mark_needs_refresh(&account.email);
					return Err(AttemptError::DownloadNeedsRetry);
				},
			}
		}

		Ok(AttemptOutcome::Success(response))
	}

	async fn create_session_with_retry(
		&self,
		account: &Account,
		jwt: &str,
		request_time_session_id: &str,
	) -> Result<crate::upstream::SessionHandle, UpstreamError> {
		let mut last_err = None;
		for _ in 0..MAX_SESSION_RETRIES {
			match self.upstream.create_session(account, jwt, request_time_session_id).await {
				Ok(session) => return Ok(session),
				Err(UpstreamError::Status { status, body }) if status == reqwest::StatusCode::BAD_REQUEST => {
					last_err = Some(UpstreamError::Status { status, body });
					continue;
				},
				Err(e) => return Err(e),
			}
		}
		Err(last_err.expect("loop runs at least once"))
	}

	/// Two-step fetch-then-download for every file reference, bounded to
	/// `MAX_PARALLEL_FILE_DOWNLOADS` in-flight downloads (§5).
	async fn fetch_generated_files(
		&self,
		account: &Account,
		jwt: &str,
		session: &crate::upstream::SessionHandle,
		response: &mut CanonicalResponse,
	) -> Result<(), FileFetchOutcome> {
		let semaphore = Arc::new(Semaphore::new(MAX_PARALLEL_FILE_DOWNLOADS));
		let futures = response.files.iter().map(|file| {
			let semaphore = Arc::clone(&semaphore);
			let file_ref = GeneratedFileRef {
				file_id: file.file_id.clone(),
				mime_type: file.mime_type.clone(),
			};
			async move {
				let _permit = semaphore.acquire().await.expect("semaphore not closed");
				self.upstream.fetch_generated_file(account, jwt, session, &file_ref).await
			}
		});
		let results = join_all(futures).await;

		let mut all_auth_failed = true;
		for (file, result) in response.files.iter_mut().zip(results) {
			match result {
				Ok(bytes) => {
					file.bytes = Some(bytes);
					all_auth_failed = false;
				},
				Err(e) if e.is_auth_failure() => {},
				Err(_) => all_auth_failed = false,
			}
		}

		if all_auth_failed {
			return Err(FileFetchOutcome::NeedsRetry);
		}
		Ok(())
	}
}

enum FileFetchOutcome {
	NeedsRetry,
}
