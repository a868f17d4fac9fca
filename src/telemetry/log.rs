//! Per-request span construction. Fields are populated incrementally as
//! the attempt loop progresses rather than built up into one struct first,
//! so a request that fails before account selection still logs what it
//! knew at the point of failure.

use tracing::Span;

pub fn request_span(request_id: &str, route: &str, model: &str) -> Span {
	tracing::info_span!(
		"request",
		request_id = %request_id,
		route = %route,
		model = %model,
		account = tracing::field::Empty,
		attempt = tracing::field::Empty,
		outcome = tracing::field::Empty,
	)
}

pub fn record_account(span: &Span, masked_email: &str) {
	span.record("account", masked_email);
}

pub fn record_attempt(span: &Span, attempt: u32) {
	span.record("attempt", attempt);
}

pub fn record_outcome(span: &Span, outcome: &str) {
	span.record("outcome", outcome);
}
