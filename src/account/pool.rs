//! C2 — account pool: a concurrency-safe, multi-queue state machine over
//! [`Account`]s. All queue-membership and status mutation happens under a
//! single `parking_lot::RwLock`; per-account counters are mutated through
//! the same lock for simplicity (spec.md §5 allows either).

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};

use parking_lot::RwLock;
use serde::Serialize;
use thiserror::Error;
use tracing::{info, warn};

use super::{Account, AccountError, AccountStatus, mask_email, new_task_id, now_unix, scan_dir};

#[derive(Debug, Error)]
pub enum PoolError {
	#[error(transparent)]
	Account(#[from] AccountError),
	#[error("account {0} not found")]
	NotFound(String),
	#[error("lease mismatch for task {task_id}")]
	LeaseMismatch { task_id: String },
	#[error("upload is missing required field {0}")]
	InvalidUpload(&'static str),
	#[error(transparent)]
	Io(#[from] std::io::Error),
}

/// A single claim slip handed to an external registrar worker.
#[derive(Debug, Clone, Serialize)]
pub struct ClaimSlip {
	pub email: String,
	pub task_id: String,
	pub authorization: String,
	pub cookies: Vec<super::Cookie>,
	pub config_id: String,
	pub csesidx: String,
}

/// Credentials uploaded back by the registrar after a successful refresh.
#[derive(Debug, Clone)]
pub struct UploadRequest {
	pub email: String,
	pub task_id: Option<String>,
	pub worker_id: Option<String>,
	pub authorization: String,
	pub cookies: Vec<super::Cookie>,
	pub config_id: String,
	pub csesidx: String,
	pub full_name: Option<String>,
	pub mail_provider: Option<String>,
	pub mail_password: Option<String>,
}

#[derive(Debug, Default, Serialize)]
pub struct PoolStats {
	pub ready: usize,
	pub pending: usize,
	pub cooldown: usize,
	pub pending_external: usize,
	pub invalid: usize,
	pub total_active: usize,
	pub lease_reclaims: u64,
}

struct PoolState {
	accounts: HashMap<String, Account>,
	ready: VecDeque<String>,
	pending: VecDeque<String>,
	invalid: Vec<String>,
	/// accounts currently in cooldown, with the unix-seconds they become
	/// usable again; still members of `ready` per spec.md §3 ("cooldown...
	/// sub-state expressed in the pending queue" — we key it off `ready`
	/// membership plus this map since cooldown accounts stay selectable
	/// once the timer lapses without a queue move).
	cooldown_until: HashMap<String, i64>,
	lease_reclaims: u64,
}

pub struct AccountPool {
	state: RwLock<PoolState>,
	data_dir: PathBuf,
	max_fail: u32,
	daily_limit: u64,
	use_cooldown_secs: i64,
	auto_delete_on_401: bool,
	external_refresh_mode: bool,
	external_lease_secs: i64,
	external_backoff_ceiling_secs: i64,
}

impl AccountPool {
	pub fn new(
		data_dir: impl Into<PathBuf>,
		max_fail: u32,
		daily_limit: u64,
		use_cooldown_secs: i64,
		auto_delete_on_401: bool,
		external_refresh_mode: bool,
	) -> Self {
		Self {
			state: RwLock::new(PoolState {
				accounts: HashMap::new(),
				ready: VecDeque::new(),
				pending: VecDeque::new(),
				invalid: Vec::new(),
				cooldown_until: HashMap::new(),
				lease_reclaims: 0,
			}),
			data_dir: data_dir.into(),
			max_fail,
			daily_limit,
			use_cooldown_secs,
			auto_delete_on_401,
			external_refresh_mode,
			external_lease_secs: 120,
			external_backoff_ceiling_secs: 600,
		}
	}

	/// Enumerate `*.json` under the data directory, placing valid accounts
	/// in `pending` and invalid ones in the `invalid` bucket. Idempotent:
	/// re-running merges newly appeared files without duplicating existing
	/// entries (existing in-memory runtime state for an email is kept).
	pub fn load(&self) -> Result<(), PoolError> {
		let (valid, invalid) = scan_dir(&self.data_dir)?;
		let mut state = self.state.write();
		for acc in valid {
			if state.accounts.contains_key(&acc.email) {
				continue;
			}
			let email = acc.email.clone();
			state.accounts.insert(email.clone(), acc);
			state.pending.push_back(email);
		}
		for (path, _err) in invalid {
			let stem = path
				.file_stem()
				.and_then(|s| s.to_str())
				.unwrap_or("unknown")
				.to_string();
			if !state.accounts.contains_key(&stem) && !state.invalid.contains(&stem) {
				state.invalid.push(stem);
			}
		}
		info!(
			ready = state.ready.len(),
			pending = state.pending.len(),
			invalid = state.invalid.len(),
			"account pool loaded"
		);
		Ok(())
	}

	fn persist(&self, acc: &Account) {
		if let Err(e) = acc.save_atomic(&self.data_dir) {
			warn!(email = %acc.mask_email(), error = %e, "failed to persist account");
		}
	}

	fn delete_file(&self, email: &str) {
		let path = self.data_dir.join(format!("{email}.json"));
		let _ = fs_err::remove_file(path);
	}

	/// Promote a pending account to ready after a successful JWT mint.
	pub fn mark_ready(&self, email: &str) {
		let mut state = self.state.write();
		if let Some(pos) = state.pending.iter().position(|e| e == email) {
			state.pending.remove(pos);
		}
		if let Some(acc) = state.accounts.get_mut(email) {
			acc.status = AccountStatus::Ready;
		}
		if !state.ready.contains(&email.to_string()) {
			state.ready.push_back(email.to_string());
		}
		if let Some(acc) = state.accounts.get(email) {
			self.persist(acc);
		}
	}

	/// Return the ready account with the earliest `last_used` that is not
	/// within cooldown, has `fail_count < max_fail`, and `daily_count <
	/// daily_limit`. Ties broken by queue (insertion) order.
	pub fn next(&self) -> Option<Account> {
		let now = now_unix();
		let mut state = self.state.write();
		let candidates: Vec<String> = state.ready.iter().cloned().collect();
		let mut best: Option<(usize, String, i64)> = None;
		for (idx, email) in candidates.iter().enumerate() {
			let Some(acc) = state.accounts.get(email) else {
				continue;
			};
			if acc.fail_count >= self.max_fail {
				continue;
			}
			if acc.daily_count >= self.daily_limit {
				continue;
			}
			if let Some(until) = state.cooldown_until.get(email)
				&& *until > now
			{
				continue;
			}
			match &best {
				Some((_, _, best_last_used)) if *best_last_used <= acc.last_used => {},
				_ => best = Some((idx, email.clone(), acc.last_used)),
			}
		}
		let (_, email, _) = best?;
		state.cooldown_until.remove(&email);
		state.accounts.get(&email).cloned()
	}

	/// Update bookkeeping after an attempt against `email`. Auth failures
	/// should go through [`AccountPool::mark_needs_refresh`] instead — this
	/// is for ordinary success/failure accounting (fail_count is *not*
	/// incremented for auth errors per spec.md scenario 2).
	pub fn mark_used(&self, email: &str, ok: bool) {
		let now = now_unix();
		let mut state = self.state.write();
		let Some(acc) = state.accounts.get_mut(email) else {
			return;
		};
		acc.mark_used(ok, now);
		let exceeded = acc.fail_count >= self.max_fail;
		let snapshot = acc.clone();
		if exceeded {
			if let Some(pos) = state.ready.iter().position(|e| e == email) {
				state.ready.remove(pos);
			}
			if let Some(pos) = state.pending.iter().position(|e| e == email) {
				state.pending.remove(pos);
			}
			if let Some(acc) = state.accounts.get_mut(email) {
				acc.status = AccountStatus::Invalid;
			}
			state.invalid.push(email.to_string());
			warn!(email = %mask_email(email), fail_count = snapshot.fail_count, "account exceeded max fail count, marked invalid");
			if self.auto_delete_on_401 {
				self.delete_file(email);
				return;
			}
		}
		if let Some(acc) = state.accounts.get(email) {
			self.persist(acc);
		}
	}

	/// Extend an account's cooldown window by `factor` times the configured
	/// base cooldown (used for 429/quota-exhausted responses, §4.4).
	pub fn extend_cooldown(&self, email: &str, factor: i64) {
		let now = now_unix();
		let mut state = self.state.write();
		let until = now + self.use_cooldown_secs.max(1) * factor;
		state.cooldown_until.insert(email.to_string(), until);
	}

	/// Move an account from ready to pending (or pending_external, if
	/// external-refresh mode is on) and drop its cached JWT.
	pub fn mark_needs_refresh(&self, email: &str) {
		let mut state = self.state.write();
		if let Some(pos) = state.ready.iter().position(|e| e == email) {
			state.ready.remove(pos);
		}
		let Some(acc) = state.accounts.get_mut(email) else {
			return;
		};
		acc.jwt = None;
		if self.external_refresh_mode {
			acc.status = AccountStatus::PendingExternal;
		} else {
			acc.status = AccountStatus::Pending;
		}
		if !state.pending.contains(&email.to_string()) {
			state.pending.push_back(email.to_string());
		}
		if let Some(acc) = state.accounts.get(email) {
			self.persist(acc);
		}
	}

	/// Next pending account not currently parked for external-refresh flow.
	pub fn get_pending_account(&self) -> Option<Account> {
		let state = self.state.read();
		state.pending.iter().find_map(|email| {
			let acc = state.accounts.get(email)?;
			if acc.status == AccountStatus::PendingExternal {
				None
			} else {
				Some(acc.clone())
			}
		})
	}

	/// Read-only enumeration of accounts in `pending_external` with no
	/// active lease. Never mutates lease state (spec.md §9 open question).
	pub fn external_refresh_tasks(&self, limit: usize) -> Vec<Account> {
		let now = now_unix();
		let state = self.state.read();
		state
			.pending
			.iter()
			.filter_map(|email| state.accounts.get(email))
			.filter(|acc| acc.status == AccountStatus::PendingExternal)
			.filter(|acc| acc.external.lease_until <= now)
			.filter(|acc| acc.external.next_retry_at <= now)
			.take(limit)
			.cloned()
			.collect()
	}

	/// Atomically claim up to `limit` eligible `pending_external` accounts
	/// for `worker_id`. Expired leases are forcibly reclaimed first.
	pub fn claim_external_refresh_tasks(
		&self,
		worker_id: &str,
		limit: usize,
		lease_secs: i64,
	) -> Vec<ClaimSlip> {
		let now = now_unix();
		let mut state = self.state.write();
		let emails: Vec<String> = state.pending.iter().cloned().collect();
		let mut claimed = Vec::new();
		for email in emails {
			if claimed.len() >= limit {
				break;
			}
			let Some(acc) = state.accounts.get(&email) else {
				continue;
			};
			if acc.status != AccountStatus::PendingExternal {
				continue;
			}
			if acc.external.next_retry_at > now {
				continue;
			}
			let lease_active = acc.external.lease_until > now;
			if lease_active {
				continue;
			}
			let had_expired_lease = acc.external.lease_until != 0 && acc.external.lease_until <= now;
			let task_id = new_task_id();
			let slip = ClaimSlip {
				email: acc.email.clone(),
				task_id: task_id.clone(),
				authorization: acc.authorization.clone(),
				cookies: acc.cookies.clone(),
				config_id: acc.config_id.clone(),
				csesidx: acc.csesidx.clone(),
			};
			if let Some(acc) = state.accounts.get_mut(&email) {
				acc.external.task_id = Some(task_id);
				acc.external.worker_id = Some(worker_id.to_string());
				acc.external.lease_until = now + lease_secs.max(1);
			}
			if had_expired_lease {
				state.lease_reclaims += 1;
			}
			claimed.push(slip);
		}
		claimed
	}

	/// The registrar reports a failed refresh attempt: clear the lease and
	/// apply exponential backoff (30s * 2^(n-1), capped).
	pub fn mark_external_refresh_failed(
		&self,
		task_id: &str,
		worker_id: &str,
		_reason: &str,
	) -> Result<(), PoolError> {
		let now = now_unix();
		let mut state = self.state.write();
		let email = state
			.accounts
			.iter()
			.find(|(_, acc)| {
				acc.external.task_id.as_deref() == Some(task_id)
					&& acc.external.worker_id.as_deref() == Some(worker_id)
			})
			.map(|(email, _)| email.clone())
			.ok_or_else(|| PoolError::LeaseMismatch {
				task_id: task_id.to_string(),
			})?;
		let acc = state.accounts.get_mut(&email).expect("just looked up");
		acc.external.task_id = None;
		acc.external.worker_id = None;
		acc.external.lease_until = 0;
		acc.external.fail_count += 1;
		let backoff = backoff_secs(acc.external.fail_count, self.external_backoff_ceiling_secs);
		acc.external.next_retry_at = now + backoff;
		let snapshot = acc.clone();
		self.persist(&snapshot);
		Ok(())
	}

	/// Apply a successful credential upload from the registrar (or a brand
	/// new account with no lease context). See spec.md §4.3 and the §8
	/// "Upload merge semantics" property.
	pub fn upload_result(&self, req: UploadRequest) -> Result<(), PoolError> {
		if req.authorization.trim().is_empty() {
			return Err(PoolError::InvalidUpload("authorization"));
		}
		if req.config_id.trim().is_empty() {
			return Err(PoolError::InvalidUpload("configId"));
		}
		let has_session_cookie = req.cookies.iter().any(|c| {
			c.name == super::SESSION_COOKIE_NAME && !c.value.is_empty()
		});
		if !has_session_cookie {
			return Err(PoolError::InvalidUpload("cookies"));
		}

		let mut state = self.state.write();
		let has_lease_context = req.task_id.is_some() && req.worker_id.is_some();
		let lease_matches = has_lease_context
			&& state.accounts.get(&req.email).is_some_and(|acc| {
				acc.external.task_id.as_deref() == req.task_id.as_deref()
					&& acc.external.worker_id.as_deref() == req.worker_id.as_deref()
			});

		let entry = state.accounts.entry(req.email.clone()).or_insert_with(|| Account {
			email: req.email.clone(),
			full_name: None,
			authorization: String::new(),
			cookies: Vec::new(),
			config_id: String::new(),
			csesidx: String::new(),
			timestamp: None,
			response_headers: None,
			mail: super::MailMeta::default(),
			status: AccountStatus::Pending,
			jwt: None,
			fail_count: 0,
			last_used: 0,
			last_refresh: now_unix(),
			daily_count: 0,
			daily_count_day: 0,
			success_count: 0,
			total_count: 0,
			external: super::ExternalLease::default(),
		});

		// Preserve human-only fields when empty on the upload.
		if req.full_name.is_some() {
			entry.full_name = req.full_name;
		}
		if req.mail_provider.is_some() {
			entry.mail.mail_provider = req.mail_provider;
		}
		if req.mail_password.is_some() {
			entry.mail.mail_password = req.mail_password;
		}
		entry.authorization = req.authorization;
		entry.cookies = req.cookies;
		entry.config_id = req.config_id;
		entry.csesidx = req.csesidx;
		entry.jwt = None;
		entry.last_refresh = now_unix();
		entry.status = AccountStatus::Pending;
		if lease_matches {
			entry.external = super::ExternalLease::default();
		}
		let snapshot = entry.clone();

		if !state.pending.contains(&req.email) {
			state.pending.push_back(req.email.clone());
		}
		if let Some(pos) = state.ready.iter().position(|e| *e == req.email) {
			state.ready.remove(pos);
		}
		state.invalid.retain(|e| *e != req.email);

		drop(state);
		self.persist(&snapshot);
		Ok(())
	}

	pub fn force_refresh_all(&self) {
		let mut state = self.state.write();
		let ready: Vec<String> = state.ready.drain(..).collect();
		for email in ready {
			if let Some(acc) = state.accounts.get_mut(&email) {
				acc.status = if self.external_refresh_mode {
					AccountStatus::PendingExternal
				} else {
					AccountStatus::Pending
				};
				acc.jwt = None;
			}
			if !state.pending.contains(&email) {
				state.pending.push_back(email.clone());
			}
		}
	}

	pub fn stats(&self) -> PoolStats {
		let state = self.state.read();
		let mut s = PoolStats {
			lease_reclaims: state.lease_reclaims,
			..Default::default()
		};
		for acc in state.accounts.values() {
			match acc.status {
				AccountStatus::Ready => s.ready += 1,
				AccountStatus::Pending => s.pending += 1,
				AccountStatus::Cooldown => s.cooldown += 1,
				AccountStatus::PendingExternal => s.pending_external += 1,
				AccountStatus::Invalid => s.invalid += 1,
			}
		}
		s.total_active = s.ready + s.pending + s.cooldown + s.pending_external;
		s
	}

	pub fn list_accounts(&self) -> Vec<Account> {
		self.state.read().accounts.values().cloned().collect()
	}

	pub fn get(&self, email: &str) -> Option<Account> {
		self.state.read().accounts.get(email).cloned()
	}

	pub fn data_dir(&self) -> &Path {
		&self.data_dir
	}
}

fn backoff_secs(fail_count: u32, ceiling: i64) -> i64 {
	let exp = fail_count.saturating_sub(1).min(20);
	let raw = 30i64.saturating_mul(1i64 << exp.min(40));
	raw.min(ceiling)
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::account::{Cookie, SESSION_COOKIE_DOMAIN, SESSION_COOKIE_NAME};

	fn account_with(email: &str, status: AccountStatus) -> Account {
		Account {
			email: email.to_string(),
			full_name: None,
			authorization: "Bearer x".into(),
			cookies: vec![Cookie {
				name: SESSION_COOKIE_NAME.into(),
				value: "v".into(),
				domain: SESSION_COOKIE_DOMAIN.into(),
				path: None,
				expires: None,
			}],
			config_id: "c".into(),
			csesidx: "0".into(),
			timestamp: None,
			response_headers: None,
			mail: super::super::MailMeta::default(),
			status,
			jwt: None,
			fail_count: 0,
			last_used: 0,
			last_refresh: 0,
			daily_count: 0,
			daily_count_day: 0,
			success_count: 0,
			total_count: 0,
			external: super::super::ExternalLease::default(),
		}
	}

	fn pool_with(accounts: Vec<Account>, max_fail: u32, daily_limit: u64) -> AccountPool {
		let dir = tempfile::tempdir().unwrap();
		for acc in &accounts {
			acc.save_atomic(dir.path()).unwrap();
		}
		let pool = AccountPool::new(dir.path().to_path_buf(), max_fail, daily_limit, 60, false, false);
		std::mem::forget(dir); // keep the tempdir alive for the pool's lifetime in tests
		pool.load().unwrap();
		for acc in accounts {
			if acc.status == AccountStatus::Ready {
				pool.mark_ready(&acc.email);
			}
		}
		pool
	}

	#[test]
	fn queue_exclusivity_next_does_not_duplicate_ready() {
		let pool = pool_with(
			vec![account_with("a@example.com", AccountStatus::Ready)],
			5,
			1000,
		);
		let picked = pool.next().unwrap();
		assert_eq!(picked.email, "a@example.com");
		pool.mark_used("a@example.com", true);
		let picked_again = pool.next().unwrap();
		assert_eq!(picked_again.email, "a@example.com");
	}

	#[test]
	fn selection_fairness_round_robins_across_ready_accounts() {
		let pool = pool_with(
			vec![
				account_with("a@example.com", AccountStatus::Ready),
				account_with("b@example.com", AccountStatus::Ready),
			],
			5,
			1000,
		);
		let mut counts = std::collections::HashMap::new();
		for _ in 0..10 {
			let acc = pool.next().unwrap();
			*counts.entry(acc.email.clone()).or_insert(0) += 1;
			pool.mark_used(&acc.email, true);
		}
		for (_email, count) in counts {
			assert!(count <= 6, "fairness: no account should dominate selection");
		}
	}

	#[test]
	fn fail_count_threshold_invalidates_account() {
		let pool = pool_with(vec![account_with("a@example.com", AccountStatus::Ready)], 2, 1000);
		pool.mark_used("a@example.com", false);
		pool.mark_used("a@example.com", false);
		assert!(pool.next().is_none());
		assert_eq!(pool.stats().invalid, 1);
	}

	#[test]
	fn auth_failure_does_not_bump_fail_count() {
		let pool = pool_with(vec![account_with("a@example.com", AccountStatus::Ready)], 2, 1000);
		pool.mark_needs_refresh("a@example.com");
		let acc = pool.get("a@example.com").unwrap();
		assert_eq!(acc.fail_count, 0);
		assert_eq!(acc.status, AccountStatus::Pending);
	}

	#[test]
	fn daily_limit_excludes_account_from_selection() {
		let mut acc = account_with("a@example.com", AccountStatus::Ready);
		acc.daily_count = 5;
		let pool = pool_with(vec![acc], 5, 5);
		assert!(pool.next().is_none());
	}

	#[test]
	fn lease_exclusivity_single_claim_wins() {
		let pool = pool_with(
			vec![account_with("a@example.com", AccountStatus::PendingExternal)],
			5,
			1000,
		);
		let first = pool.claim_external_refresh_tasks("w1", 1, 120);
		let second = pool.claim_external_refresh_tasks("w2", 1, 120);
		assert_eq!(first.len(), 1);
		assert_eq!(second.len(), 0);
	}

	#[test]
	fn upload_merge_preserves_human_fields_when_empty() {
		let pool = pool_with(vec![], 5, 1000);
		pool
			.upload_result(UploadRequest {
				email: "a@example.com".into(),
				task_id: None,
				worker_id: None,
				authorization: "Bearer 1".into(),
				cookies: vec![Cookie {
					name: SESSION_COOKIE_NAME.into(),
					value: "v1".into(),
					domain: SESSION_COOKIE_DOMAIN.into(),
					path: None,
					expires: None,
				}],
				config_id: "cfg1".into(),
				csesidx: "0".into(),
				full_name: Some("Alice".into()),
				mail_provider: Some("gmail".into()),
				mail_password: Some("hunter2".into()),
			})
			.unwrap();

		pool
			.upload_result(UploadRequest {
				email: "a@example.com".into(),
				task_id: None,
				worker_id: None,
				authorization: "Bearer 2".into(),
				cookies: vec![Cookie {
					name: SESSION_COOKIE_NAME.into(),
					value: "v2".into(),
					domain: SESSION_COOKIE_DOMAIN.into(),
					path: None,
					expires: None,
				}],
				config_id: "cfg2".into(),
				csesidx: "1".into(),
				full_name: None,
				mail_provider: None,
				mail_password: None,
			})
			.unwrap();

		let acc = pool.get("a@example.com").unwrap();
		assert_eq!(acc.authorization, "Bearer 2");
		assert_eq!(acc.full_name.as_deref(), Some("Alice"));
		assert_eq!(acc.mail.mail_provider.as_deref(), Some("gmail"));
		assert_eq!(acc.status, AccountStatus::Pending);
	}

	#[test]
	fn backoff_monotonic_and_capped() {
		assert_eq!(backoff_secs(1, 600), 30);
		assert_eq!(backoff_secs(2, 600), 60);
		assert_eq!(backoff_secs(3, 600), 120);
		assert_eq!(backoff_secs(10, 600), 600);
	}
}
