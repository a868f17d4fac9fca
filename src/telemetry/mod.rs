//! Ambient logging setup. `--debug`/`RUST_LOG` select verbosity; the wire
//! format is human-readable compact text in debug mode and structured JSON
//! otherwise, matching how a deployed gateway's logs get shipped to an
//! aggregator while local runs stay readable.

pub mod log;

use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt;
use tracing_subscriber::prelude::*;

pub fn init(debug: bool) {
	let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
		EnvFilter::new(if debug { "debug" } else { "info" })
	});

	let registry = tracing_subscriber::registry().with(filter);

	if debug {
		registry.with(fmt::layer().with_target(true).compact()).init();
	} else {
		registry.with(fmt::layer().json().with_current_span(true)).init();
	}
}
