//! C3 — refresh engine. Promotes `pending` accounts to `ready` by minting a
//! JWT, and (in external-refresh mode) hands `pending_external` accounts off
//! to a registrar worker instead of refreshing them in-process. Grounded in
//! the retry/backoff shape of a typical OAuth credential broker: bounded
//! retries with exponential backoff, one attempt in flight per account.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::time::sleep;
use tracing::{error, info, warn};

use super::pool::AccountPool;
use crate::upstream::{UpstreamClient, UpstreamError};

const INITIAL_RETRY_BACKOFF_SECS: u64 = 30;
const MAX_RETRY_BACKOFF_SECS: u64 = 600;
const MAX_REFRESH_ATTEMPTS: u32 = 5;
const POLL_INTERVAL_SECS: u64 = 5;

#[derive(Debug, Error)]
pub enum RefreshError {
	#[error(transparent)]
	Upstream(#[from] UpstreamError),
	#[error(transparent)]
	Pool(#[from] super::pool::PoolError),
	#[error("account {email} exhausted {attempts} refresh attempts")]
	Exhausted { email: String, attempts: u32 },
}

/// Background task handle: promotes `pending` accounts to `ready`, retrying
/// JWT mints with exponential backoff. In external-refresh mode, accounts
/// that need a browser-based re-login are routed to `pending_external`
/// instead and this loop skips them (the registrar drains that queue).
pub struct RefreshEngine {
	pool: Arc<AccountPool>,
	upstream: Arc<UpstreamClient>,
	external_refresh_mode: bool,
}

impl RefreshEngine {
	pub fn new(pool: Arc<AccountPool>, upstream: Arc<UpstreamClient>, external_refresh_mode: bool) -> Self {
		Self {
			pool,
			upstream,
			external_refresh_mode,
		}
	}

	/// Run one sweep: attempt to mint a JWT for every `pending` account not
	/// parked in `pending_external`. Returns the number promoted to ready.
	pub async fn run_once(&self) -> usize {
		let mut promoted = 0;
		loop {
			let Some(mut acc) = self.pool.get_pending_account() else {
				break;
			};
			let email = acc.email.clone();
			match self.refresh_one(&mut acc).await {
				Ok(()) => {
					self.pool.mark_ready(&email);
					promoted += 1;
				},
				Err(RefreshError::Exhausted { email, attempts }) => {
					warn!(email = %super::mask_email(&email), attempts, "refresh exhausted, routing to external queue");
					self.pool.mark_needs_refresh(&email);
				},
				Err(e) => {
					error!(email = %super::mask_email(&email), error = %e, "refresh attempt failed");
					break;
				},
			}
		}
		promoted
	}

	/// Mint a JWT with bounded retries and exponential backoff. On success
	/// the caller promotes the account; on exhaustion it's parked for an
	/// external (browser-based) refresh instead.
	async fn refresh_one(&self, acc: &mut super::Account) -> Result<(), RefreshError> {
		let mut attempt = 0u32;
		loop {
			attempt += 1;
			let err = match acc.get_jwt(&self.upstream).await {
				Ok(_) => return Ok(()),
				Err(super::AccountError::Upstream(e)) => e,
				Err(other) => {
					return Err(RefreshError::Exhausted {
						email: acc.email.clone(),
						attempts: attempt,
					})
					.inspect_err(|_| warn!(email = %acc.mask_email(), error = %other, "unexpected error minting jwt"));
				},
			};
			if !err.is_auth_failure() {
				return Err(RefreshError::Upstream(err));
			}
			if self.external_refresh_mode || attempt >= MAX_REFRESH_ATTEMPTS {
				return Err(RefreshError::Exhausted {
					email: acc.email.clone(),
					attempts: attempt,
				});
			}
			let backoff = backoff_secs(attempt);
			info!(email = %acc.mask_email(), attempt, backoff, "jwt mint failed, retrying after backoff");
			sleep(Duration::from_secs(backoff)).await;
		}
	}

	/// Spawn the background polling loop; returns the `JoinHandle` so the
	/// caller can abort it on shutdown.
	pub fn spawn(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
		tokio::spawn(async move {
			loop {
				self.run_once().await;
				sleep(Duration::from_secs(POLL_INTERVAL_SECS)).await;
			}
		})
	}
}

fn backoff_secs(attempt: u32) -> u64 {
	let exp = attempt.saturating_sub(1).min(20);
	(INITIAL_RETRY_BACKOFF_SECS.saturating_mul(1u64 << exp)).min(MAX_RETRY_BACKOFF_SECS)
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn backoff_doubles_until_ceiling() {
		assert_eq!(backoff_secs(1), 30);
		assert_eq!(backoff_secs(2), 60);
		assert_eq!(backoff_secs(3), 120);
		assert_eq!(backoff_secs(4), 240);
		assert_eq!(backoff_secs(5), 480);
		assert_eq!(backoff_secs(6), 600);
		assert_eq!(backoff_secs(20), 600);
	}
}
