//! Shared error taxonomy. Each component owns its own `thiserror` enum;
//! this module only defines the process-boundary error used by `main` and
//! a couple of conversions wired at the seams between components.

use thiserror::Error;

use crate::account::AccountError;
use crate::account::pool::PoolError;
use crate::account::refresh::RefreshError;
use crate::llm::AIError;
use crate::pipeline::PipelineError;
use crate::upstream::UpstreamError;

#[derive(Debug, Error)]
pub enum GatewayError {
	#[error(transparent)]
	Account(#[from] AccountError),
	#[error(transparent)]
	Pool(#[from] PoolError),
	#[error(transparent)]
	Refresh(#[from] RefreshError),
	#[error(transparent)]
	Upstream(#[from] UpstreamError),
	#[error(transparent)]
	Pipeline(#[from] PipelineError),
	#[error(transparent)]
	Ai(#[from] AIError),
	#[error("configuration error: {0}")]
	Config(String),
	#[error(transparent)]
	Io(#[from] std::io::Error),
	#[error(transparent)]
	Other(#[from] anyhow::Error),
}
