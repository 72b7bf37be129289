//! Model access for ConceptForge.
//!
//! [`LlmGateway`] talks to an OpenAI-compatible chat-completions endpoint
//! behind the [`ConceptModel`] trait, with a linear-backoff retry policy and
//! tolerant response parsing.

mod gateway;
pub mod parse;
pub mod retry;

pub use gateway::{ConceptModel, LlmGateway};
