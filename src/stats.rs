//! C7 — statistics. Three aggregators, each under its own `parking_lot`
//! lock, updated exactly once per request from a hook called after C4's
//! attempt loop finishes — never while the pool lock is held (§5).

use std::collections::{HashMap, VecDeque};

use parking_lot::Mutex;
use serde::Serialize;

const HOUR_BUCKETS: usize = 24;
/// Ring size bounding the RPM window's memory; one minute of traffic rarely
/// exceeds this outside pathological abuse, and the window below trims by
/// age anyway.
const RPM_RING_CAP: usize = 4096;
const RPM_WINDOW_SECS: i64 = 60;
const PER_IP_RING_CAP: usize = 512;

#[derive(Debug, Default, Clone, Serialize)]
pub struct AggregateSnapshot {
	pub total: u64,
	pub success: u64,
	pub failed: u64,
	pub input_tokens: u64,
	pub output_tokens: u64,
	pub images: u64,
	pub videos: u64,
	pub hour_buckets: [u64; HOUR_BUCKETS],
	pub rpm: u64,
}

#[derive(Debug, Default)]
struct Aggregate {
	total: u64,
	success: u64,
	failed: u64,
	input_tokens: u64,
	output_tokens: u64,
	images: u64,
	videos: u64,
	hour_buckets: [u64; HOUR_BUCKETS],
	recent: VecDeque<i64>,
	ring_cap: usize,
}

impl Aggregate {
	fn new(ring_cap: usize) -> Self {
		Aggregate {
			ring_cap,
			..Default::default()
		}
	}

	fn record(&mut self, outcome: &RequestOutcome, now: i64) {
		self.total += 1;
		if outcome.success {
			self.success += 1;
		} else {
			self.failed += 1;
		}
		self.input_tokens += outcome.input_tokens;
		self.output_tokens += outcome.output_tokens;
		self.images += outcome.images;
		self.videos += outcome.videos;

		let hour = ((now / 3600) % HOUR_BUCKETS as i64) as usize;
		self.hour_buckets[hour] += 1;

		self.recent.push_back(now);
		while self.recent.len() > self.ring_cap {
			self.recent.pop_front();
		}
	}

	fn rpm(&self, now: i64) -> u64 {
		self.recent.iter().rev().take_while(|&&t| now - t <= RPM_WINDOW_SECS).count() as u64
	}

	fn snapshot(&self, now: i64) -> AggregateSnapshot {
		AggregateSnapshot {
			total: self.total,
			success: self.success,
			failed: self.failed,
			input_tokens: self.input_tokens,
			output_tokens: self.output_tokens,
			images: self.images,
			videos: self.videos,
			hour_buckets: self.hour_buckets,
			rpm: self.rpm(now),
		}
	}
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct IpSnapshot {
	pub aggregate: AggregateSnapshot,
	pub models: HashMap<String, u64>,
	pub user_agents: HashMap<String, u64>,
}

#[derive(Debug, Default)]
struct IpAggregate {
	aggregate: Aggregate,
	models: HashMap<String, u64>,
	user_agents: HashMap<String, u64>,
}

/// Inputs to a single `record` call, computed once the attempt loop has a
/// final verdict (success or the error surfaced to the client).
pub struct RequestOutcome {
	pub success: bool,
	pub model: String,
	pub client_ip: String,
	pub user_agent: Option<String>,
	pub input_tokens: u64,
	pub output_tokens: u64,
	pub images: u64,
	pub videos: u64,
}

pub struct Stats {
	global: Mutex<Aggregate>,
	per_model: Mutex<HashMap<String, Aggregate>>,
	per_ip: Mutex<HashMap<String, IpAggregate>>,
}

impl Stats {
	pub fn new() -> Self {
		Stats {
			global: Mutex::new(Aggregate::new(RPM_RING_CAP)),
			per_model: Mutex::new(HashMap::new()),
			per_ip: Mutex::new(HashMap::new()),
		}
	}

	/// The single hook C4 calls once per request, after it has a final
	/// verdict. §4.7: all three aggregators update exactly once.
	pub fn on_request_complete(&self, outcome: RequestOutcome, now: i64) {
		self.global.lock().record(&outcome, now);

		self
			.per_model
			.lock()
			.entry(outcome.model.clone())
			.or_insert_with(|| Aggregate::new(RPM_RING_CAP))
			.record(&outcome, now);

		let mut per_ip = self.per_ip.lock();
		let entry = per_ip.entry(outcome.client_ip.clone()).or_insert_with(|| IpAggregate {
			aggregate: Aggregate::new(PER_IP_RING_CAP),
			..Default::default()
		});
		entry.aggregate.record(&outcome, now);
		*entry.models.entry(outcome.model.clone()).or_insert(0) += 1;
		if let Some(ua) = &outcome.user_agent {
			*entry.user_agents.entry(ua.clone()).or_insert(0) += 1;
		}
	}

	pub fn global_snapshot(&self, now: i64) -> AggregateSnapshot {
		self.global.lock().snapshot(now)
	}

	pub fn model_snapshot(&self, model: &str, now: i64) -> Option<AggregateSnapshot> {
		self.per_model.lock().get(model).map(|a| a.snapshot(now))
	}

	pub fn all_model_snapshots(&self, now: i64) -> HashMap<String, AggregateSnapshot> {
		self.per_model.lock().iter().map(|(k, v)| (k.clone(), v.snapshot(now))).collect()
	}

	pub fn ip_snapshot(&self, ip: &str, now: i64) -> Option<IpSnapshot> {
		self.per_ip.lock().get(ip).map(|entry| IpSnapshot {
			aggregate: entry.aggregate.snapshot(now),
			models: entry.models.clone(),
			user_agents: entry.user_agents.clone(),
		})
	}
}

impl Default for Stats {
	fn default() -> Self {
		Self::new()
	}
}

/// `length/4 + 500 per image` token estimator (§4.7), shared with the
/// OpenAI response builder.
pub fn estimate_input_tokens(prompt: &str, image_count: u64) -> u64 {
	crate::llm::openai::estimate_tokens(prompt) + image_count * 500
}

#[cfg(test)]
mod tests {
	use super::*;

	fn outcome(model: &str, ip: &str, success: bool) -> RequestOutcome {
		RequestOutcome {
			success,
			model: model.to_string(),
			client_ip: ip.to_string(),
			user_agent: Some("test-agent".to_string()),
			input_tokens: 10,
			output_tokens: 20,
			images: 0,
			videos: 0,
		}
	}

	#[test]
	fn global_and_per_model_update_together() {
		let stats = Stats::new();
		stats.on_request_complete(outcome("gemini-2.5-flash", "1.2.3.4", true), 1000);
		stats.on_request_complete(outcome("gemini-2.5-pro", "1.2.3.4", false), 1001);

		let global = stats.global_snapshot(1001);
		assert_eq!(global.total, 2);
		assert_eq!(global.success, 1);
		assert_eq!(global.failed, 1);

		let flash = stats.model_snapshot("gemini-2.5-flash", 1001).unwrap();
		assert_eq!(flash.total, 1);
	}

	#[test]
	fn rpm_window_excludes_old_requests() {
		let stats = Stats::new();
		stats.on_request_complete(outcome("m", "ip", true), 0);
		stats.on_request_complete(outcome("m", "ip", true), 1000);
		let global = stats.global_snapshot(1000);
		assert_eq!(global.rpm, 1);
	}

	#[test]
	fn per_ip_tracks_model_histogram() {
		let stats = Stats::new();
		stats.on_request_complete(outcome("gemini-2.5-flash", "1.2.3.4", true), 0);
		stats.on_request_complete(outcome("gemini-2.5-flash", "1.2.3.4", true), 1);
		let snap = stats.ip_snapshot("1.2.3.4", 1).unwrap();
		assert_eq!(snap.models.get("gemini-2.5-flash"), Some(&2));
	}
}
