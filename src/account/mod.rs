//! C1 — account record & persistence.
//!
//! An [`Account`] represents one upstream identity: credentials, cached
//! JWT, and the runtime bookkeeping the pool (`account::pool`) mutates
//! under its own lock. Persistence is a single JSON file per account,
//! written via temp-file-then-rename so a crash never leaves a partial
//! write behind.

pub mod pool;
pub mod refresh;

use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::upstream::{UpstreamClient, UpstreamError};

/// Default JWT lifetime when the upstream XSRF endpoint doesn't echo one back.
pub const DEFAULT_JWT_TTL_SECS: u64 = 270;
/// Minimum remaining JWT life before we treat it as expired and re-mint.
pub const JWT_SAFETY_MARGIN_SECS: u64 = 30;
/// Cookie every ready/pending account must carry.
pub const SESSION_COOKIE_NAME: &str = "__Secure-C_SES";
pub const SESSION_COOKIE_DOMAIN: &str = ".gemini.google";

/// File name prefixes that are not account records and must be skipped
/// when enumerating the data directory.
const SKIPPED_PREFIXES: &[&str] = &["admin_auth", "backup-", "."];

#[derive(Debug, Error)]
pub enum AccountError {
	#[error("failed to read account file {path}: {source}")]
	Read {
		path: PathBuf,
		#[source]
		source: std::io::Error,
	},
	#[error("failed to parse account file {path}: {source}")]
	Parse {
		path: PathBuf,
		#[source]
		source: serde_json::Error,
	},
	#[error("failed to write account file {path}: {source}")]
	Write {
		path: PathBuf,
		#[source]
		source: std::io::Error,
	},
	#[error("account file name {file_stem:?} does not match record email {email:?}")]
	FilenameMismatch { file_stem: String, email: String },
	#[error("account {email} is missing required field {field}")]
	MissingField { email: String, field: &'static str },
	#[error("account {email} has no {SESSION_COOKIE_NAME} cookie on domain {SESSION_COOKIE_DOMAIN}")]
	MissingSessionCookie { email: String },
	#[error(transparent)]
	Upstream(#[from] UpstreamError),
}

/// A single cookie as carried in the account JSON and sent upstream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cookie {
	pub name: String,
	pub value: String,
	pub domain: String,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub path: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub expires: Option<i64>,
}

/// Render cookies the way an HTTP `Cookie:` request header expects:
/// `name=value; name2=value2`.
pub fn cookies_to_header(cookies: &[Cookie]) -> String {
	cookies
		.iter()
		.map(|c| format!("{}={}", c.name, c.value))
		.collect::<Vec<_>>()
		.join("; ")
}

/// Parse a `Cookie:` header string back into a multi-set of (name, value).
/// Domain information is not present in the header form, so this is paired
/// with the original domain list by name when round-tripping in tests.
pub fn parse_cookie_header(header: &str) -> Vec<(String, String)> {
	header
		.split(';')
		.filter_map(|part| {
			let part = part.trim();
			if part.is_empty() {
				return None;
			}
			let (name, value) = part.split_once('=')?;
			Some((name.trim().to_string(), value.trim().to_string()))
		})
		.collect()
}

/// Closed-set account status. Total order exists only for admin display.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccountStatus {
	Ready,
	Pending,
	Cooldown,
	PendingExternal,
	Invalid,
}

impl AccountStatus {
	/// Rank used only for sorting in the admin UI; pool logic never compares
	/// statuses, it only moves accounts between queues.
	fn rank(self) -> u8 {
		match self {
			AccountStatus::Ready => 0,
			AccountStatus::Pending => 1,
			AccountStatus::Cooldown => 2,
			AccountStatus::PendingExternal => 3,
			AccountStatus::Invalid => 4,
		}
	}

	pub fn is_active(self) -> bool {
		!matches!(self, AccountStatus::Invalid)
	}
}

impl PartialOrd for AccountStatus {
	fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
		Some(self.cmp(other))
	}
}
impl Ord for AccountStatus {
	fn cmp(&self, other: &Self) -> std::cmp::Ordering {
		self.rank().cmp(&other.rank())
	}
}

/// Optional mail-provider metadata preserved verbatim across refreshes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MailMeta {
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub mail_provider: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub mail_password: Option<String>,
}

/// Cached short-lived upstream JWT.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CachedJwt {
	pub token: String,
	/// Unix seconds.
	pub expires_at: i64,
}

impl CachedJwt {
	fn is_fresh(&self, now: i64) -> bool {
		self.expires_at - now >= JWT_SAFETY_MARGIN_SECS as i64
	}
}

/// An external-refresh lease: ownership of a `pending_external` account by
/// exactly one registrar worker until `lease_until` passes.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExternalLease {
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub task_id: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub worker_id: Option<String>,
	/// Unix seconds; 0 means no active lease.
	#[serde(default)]
	pub lease_until: i64,
	#[serde(default)]
	pub fail_count: u32,
	/// Unix seconds; 0 means eligible immediately.
	#[serde(default)]
	pub next_retry_at: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
	pub email: String,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub full_name: Option<String>,
	pub authorization: String,
	pub cookies: Vec<Cookie>,
	pub config_id: String,
	pub csesidx: String,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub timestamp: Option<i64>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub response_headers: Option<serde_json::Value>,
	#[serde(flatten)]
	pub mail: MailMeta,

	// --- runtime / derived state, persisted alongside credentials ---
	#[serde(default)]
	pub status: AccountStatus,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub jwt: Option<CachedJwt>,
	#[serde(default)]
	pub fail_count: u32,
	#[serde(default)]
	pub last_used: i64,
	#[serde(default)]
	pub last_refresh: i64,
	#[serde(default)]
	pub daily_count: u64,
	/// UTC date (days since epoch) the daily counter last rolled over on.
	#[serde(default)]
	pub daily_count_day: i64,
	#[serde(default)]
	pub success_count: u64,
	#[serde(default)]
	pub total_count: u64,
	#[serde(default)]
	pub external: ExternalLease,
}

impl Default for AccountStatus {
	fn default() -> Self {
		AccountStatus::Pending
	}
}

impl Account {
	/// Validate the fields `Load` requires before an account can be used.
	pub fn validate(&self) -> Result<(), AccountError> {
		if self.authorization.trim().is_empty() {
			return Err(AccountError::MissingField {
				email: self.email.clone(),
				field: "authorization",
			});
		}
		if !self.email.contains('@') {
			return Err(AccountError::MissingField {
				email: self.email.clone(),
				field: "email",
			});
		}
		if self.config_id.trim().is_empty() {
			return Err(AccountError::MissingField {
				email: self.email.clone(),
				field: "configId",
			});
		}
		let has_session_cookie = self.cookies.iter().any(|c| {
			c.name == SESSION_COOKIE_NAME && c.domain.trim_start_matches('.').eq_ignore_ascii_case(
				SESSION_COOKIE_DOMAIN.trim_start_matches('.'),
			) && !c.value.is_empty()
		});
		if !has_session_cookie {
			return Err(AccountError::MissingSessionCookie {
				email: self.email.clone(),
			});
		}
		Ok(())
	}

	/// Load and validate a single account file. Filename (sans `.json`)
	/// must case-insensitively match the record's email.
	pub fn load(path: &Path) -> Result<Account, AccountError> {
		let bytes = fs_err::read(path).map_err(|source| AccountError::Read {
			path: path.to_path_buf(),
			source: source.into(),
		})?;
		let account: Account = serde_json::from_slice(&bytes).map_err(|source| AccountError::Parse {
			path: path.to_path_buf(),
			source,
		})?;
		let stem = path
			.file_stem()
			.and_then(|s| s.to_str())
			.unwrap_or_default()
			.to_string();
		if !stem.eq_ignore_ascii_case(&account.email) {
			return Err(AccountError::FilenameMismatch {
				file_stem: stem,
				email: account.email,
			});
		}
		account.validate()?;
		Ok(account)
	}

	/// Is this path a file we should even attempt to parse as an account?
	pub fn is_account_file(path: &Path) -> bool {
		let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
			return false;
		};
		if !name.ends_with(".json") {
			return false;
		}
		!SKIPPED_PREFIXES.iter().any(|p| name.starts_with(p))
	}

	/// Atomically persist this account to `dir/{email}.json`.
	pub fn save_atomic(&self, dir: &Path) -> Result<(), AccountError> {
		let target = dir.join(format!("{}.json", self.email));
		let tmp = dir.join(format!("{}.json.tmp", self.email));
		let body = serde_json::to_vec_pretty(self).map_err(|source| AccountError::Parse {
			path: target.clone(),
			source,
		})?;
		fs_err::write(&tmp, &body).map_err(|source| AccountError::Write {
			path: tmp.clone(),
			source: source.into(),
		})?;
		fs_err::rename(&tmp, &target).map_err(|source| AccountError::Write {
			path: target.clone(),
			source: source.into(),
		})?;
		Ok(())
	}

	/// Bearer token usable right now, minting a fresh JWT from upstream if
	/// the cached one is stale or missing. Single attempt: callers own retry
	/// policy.
	pub async fn get_jwt(&mut self, client: &UpstreamClient) -> Result<(String, String), AccountError> {
		let now = now_unix();
		if let Some(jwt) = &self.jwt
			&& jwt.is_fresh(now)
		{
			return Ok((jwt.token.clone(), self.config_id.clone()));
		}
		let minted = client.mint_jwt(self).await?;
		let expires_at = now + minted.ttl_secs.unwrap_or(DEFAULT_JWT_TTL_SECS) as i64;
		self.jwt = Some(CachedJwt {
			token: minted.token.clone(),
			expires_at,
		});
		Ok((minted.token, self.config_id.clone()))
	}

	/// A bearer token synthesized purely from `csesidx`, used as a last
	/// resort locally. Must never be echoed to upstream in
	/// `x-original-authorization` — see spec.md §9 open question.
	pub fn fallback_bearer(&self) -> String {
		format!("fallback-{}", self.csesidx)
	}

	pub fn is_fallback_bearer(token: &str) -> bool {
		token.starts_with("fallback-")
	}

	/// Roll `daily_count` over at UTC midnight, then increment it.
	pub fn bump_daily_count(&mut self, now: i64) {
		let today = now / 86_400;
		if today != self.daily_count_day {
			self.daily_count = 0;
			self.daily_count_day = today;
		}
		self.daily_count += 1;
	}

	pub fn mark_used(&mut self, ok: bool, now: i64) {
		self.last_used = now;
		self.total_count += 1;
		self.bump_daily_count(now);
		if ok {
			self.success_count += 1;
			self.fail_count = 0;
		} else {
			self.fail_count += 1;
		}
	}

	pub fn mask_email(&self) -> String {
		mask_email(&self.email)
	}
}

/// `j***@example.com` style masking for admin listings/logs.
pub fn mask_email(email: &str) -> String {
	match email.split_once('@') {
		Some((local, domain)) if !local.is_empty() => {
			let first = &local[..1];
			format!("{first}***@{domain}")
		},
		_ => "***".to_string(),
	}
}

pub fn now_unix() -> i64 {
	SystemTime::now()
		.duration_since(UNIX_EPOCH)
		.unwrap_or_default()
		.as_secs() as i64
}

/// Generate a random-looking opaque task id for external-refresh claims.
pub fn new_task_id() -> String {
	let mut rng = rand::thread_rng();
	let bytes: [u8; 16] = rng.r#gen();
	hex::encode(bytes)
}

/// Enumerate account JSON files in `dir`, returning (valid, invalid) splits.
/// Invalid entries carry the path and the reason so the caller can log and
/// route them into the `invalid` bucket without crashing the whole load.
pub fn scan_dir(dir: &Path) -> std::io::Result<(Vec<Account>, Vec<(PathBuf, AccountError)>)> {
	let mut valid = Vec::new();
	let mut invalid = Vec::new();
	for entry in fs_err::read_dir(dir)? {
		let entry = entry?;
		let path = entry.path();
		if !path.is_file() || !Account::is_account_file(&path) {
			continue;
		}
		match Account::load(&path) {
			Ok(acc) => valid.push(acc),
			Err(e) => {
				warn!(path = %path.display(), error = %e, "failed to load account file");
				invalid.push((path, e));
			},
		}
	}
	debug!(dir = %dir.display(), valid = valid.len(), invalid = invalid.len(), "scanned account directory");
	Ok((valid, invalid))
}

#[cfg(test)]
mod tests {
	use super::*;

	fn sample_account(email: &str) -> Account {
		Account {
			email: email.to_string(),
			full_name: Some("Test User".into()),
			authorization: "Bearer abc".into(),
			cookies: vec![Cookie {
				name: SESSION_COOKIE_NAME.into(),
				value: "sval".into(),
				domain: SESSION_COOKIE_DOMAIN.into(),
				path: None,
				expires: None,
			}],
			config_id: "cfg-1".into(),
			csesidx: "0".into(),
			timestamp: None,
			response_headers: None,
			mail: MailMeta::default(),
			status: AccountStatus::Pending,
			jwt: None,
			fail_count: 0,
			last_used: 0,
			last_refresh: 0,
			daily_count: 0,
			daily_count_day: 0,
			success_count: 0,
			total_count: 0,
			external: ExternalLease::default(),
		}
	}

	#[test]
	fn round_trip_save_load() {
		let dir = tempfile::tempdir().unwrap();
		let acc = sample_account("person@example.com");
		acc.save_atomic(dir.path()).unwrap();
		let loaded = Account::load(&dir.path().join("person@example.com.json")).unwrap();
		assert_eq!(loaded.email, acc.email);
		assert_eq!(loaded.cookies, acc.cookies);
		assert_eq!(loaded.config_id, acc.config_id);
	}

	#[test]
	fn filename_mismatch_rejected() {
		let dir = tempfile::tempdir().unwrap();
		let acc = sample_account("person@example.com");
		let body = serde_json::to_vec(&acc).unwrap();
		let path = dir.path().join("someone-else@example.com.json");
		fs_err::write(&path, body).unwrap();
		let err = Account::load(&path).unwrap_err();
		assert!(matches!(err, AccountError::FilenameMismatch { .. }));
	}

	#[test]
	fn missing_session_cookie_rejected() {
		let mut acc = sample_account("person@example.com");
		acc.cookies.clear();
		assert!(matches!(
			acc.validate(),
			Err(AccountError::MissingSessionCookie { .. })
		));
	}

	#[test]
	fn cookie_header_round_trips_as_multiset() {
		let acc = sample_account("person@example.com");
		let header = cookies_to_header(&acc.cookies);
		let parsed = parse_cookie_header(&header);
		let expected: Vec<(String, String)> = acc
			.cookies
			.iter()
			.map(|c| (c.name.clone(), c.value.clone()))
			.collect();
		assert_eq!(parsed, expected);
	}

	#[test]
	fn daily_count_rolls_over_at_utc_midnight() {
		let mut acc = sample_account("person@example.com");
		acc.bump_daily_count(10);
		acc.bump_daily_count(20);
		assert_eq!(acc.daily_count, 2);
		acc.bump_daily_count(10 + 86_400);
		assert_eq!(acc.daily_count, 1);
	}

	#[test]
	fn fallback_bearer_is_recognizable_and_never_a_mint() {
		let acc = sample_account("person@example.com");
		let bearer = acc.fallback_bearer();
		assert!(Account::is_fallback_bearer(&bearer));
		assert!(!Account::is_fallback_bearer(&acc.authorization));
	}

	#[test]
	fn mask_email_keeps_domain_hides_local() {
		assert_eq!(mask_email("jane@example.com"), "j***@example.com");
	}
}
