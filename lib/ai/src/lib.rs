//! LLM collaborator interface for `ai-agent` nodes.
//!
//! The engine depends only on the [`LlmBackend`] trait; concrete providers
//! (Ollama, Anthropic, OpenAI-compatible) live outside the engine core and
//! are injected when the executor registry is built.

pub mod backend;
pub mod error;

pub use backend::{
    LlmBackend, LlmProvider, LlmRequest, LlmResponse, ScriptedBackend, TokenUsage,
};
pub use error::LlmError;
