//! Code-generation backends driven by the relay.
//!
//! A generator is called once per request and reports progress only through
//! [`GenerationCallbacks`]; it has no streaming semantics of its own.

use std::fmt::Debug;

use async_trait::async_trait;
use capsule_error::CapsuleError;
use serde_json::Value;

use crate::relay::GenerationCallbacks;
use crate::sandbox::SandboxHandle;

pub mod claude;
pub mod mock;
pub mod prompt;

pub use claude::ClaudeCliGenerator;
pub use mock::{MockGenerator, MockOutcome};

/// Request fields that shape the prompt, as received from the client.
#[derive(Debug, Clone, Default)]
pub struct GenerationInput {
    pub user_message: String,
    pub is_first_message: bool,
    pub images: Vec<String>,
    pub file_edition: bool,
    /// File the user is editing, when the client names one.
    pub edited_file: Option<String>,
    pub selection_data: Option<Value>,
}

#[derive(Debug, Clone)]
pub struct GenerationRequest {
    pub prompt: String,
    pub user_message: String,
    pub conversation_id: Option<String>,
    pub sandbox: SandboxHandle,
    pub preview_url: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

impl TokenUsage {
    pub fn total(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct GenerationResult {
    /// Conversation id to resume from on the next message.
    pub session_id: Option<String>,
    pub result: Option<String>,
    pub usage: Option<TokenUsage>,
    pub files_changed: Vec<String>,
    pub num_turns: Option<u64>,
    pub cost_usd: Option<f64>,
}

#[async_trait]
pub trait CodeGenerator: Send + Sync + Debug {
    /// Runs one generation. Progress and the outcome are reported through
    /// `callbacks`; returning without a terminal callback is treated as a failure.
    async fn generate(
        &self,
        request: GenerationRequest,
        callbacks: GenerationCallbacks,
    ) -> Result<(), CapsuleError>;
}
