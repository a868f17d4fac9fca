//! b2a-gateway: an OpenAI/Claude/Gemini-compatible HTTP gateway that
//! multiplexes many OAuth "Business" accounts against a single upstream
//! chat/multimodal backend.

pub mod account;
pub mod config;
pub mod error;
pub mod http;
pub mod llm;
pub mod pipeline;
pub mod stats;
pub mod telemetry;
pub mod upstream;

pub use account::pool::AccountPool;
pub use config::Config;
pub use error::GatewayError;
