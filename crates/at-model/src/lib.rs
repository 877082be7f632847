//! AutoTransform Model - the generative-model capability
//!
//! Everything the synthesis loop needs to talk to a chat model:
//! - Role-tagged conversation types
//! - The [`ModelClient`] capability trait (conversation in, one reply out)
//! - Reply parsing (fenced code blocks, JSON payloads)
//! - Transport retry with bounded exponential backoff
//! - An OpenAI-compatible HTTP client
//!
//! # Example
//!
//! ```rust,ignore
//! use at_model::{ChatMessage, ModelClient, OpenAiClient, OpenAiConfig, RetryingClient};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let client = RetryingClient::new(OpenAiClient::new(OpenAiConfig::default())?);
//! let reply = client
//!     .complete(&[ChatMessage::user("Return the JSON {\"ok\": true}")])
//!     .await?;
//! println!("{}", reply.content);
//! # Ok(())
//! # }
//! ```

#![warn(unreachable_pub)]
#![allow(missing_docs)]

pub mod chat;
pub mod client;
pub mod error;
pub mod openai;
pub mod parse;
pub mod retry;

pub use chat::{ChatMessage, ChatRole};
pub use client::ModelClient;
pub use error::ModelError;
pub use openai::{OpenAiClient, OpenAiConfig};
pub use parse::{extract_fenced_block, parse_json_output};
pub use retry::{calculate_backoff, retry_transport, BackoffConfig, RetryingClient};

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
