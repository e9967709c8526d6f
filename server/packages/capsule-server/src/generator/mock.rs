use std::time::Duration;

use async_trait::async_trait;
use capsule_error::CapsuleError;
use tokio::time::sleep;

use super::{CodeGenerator, GenerationRequest, GenerationResult, TokenUsage};
use crate::relay::GenerationCallbacks;

const MOCK_MESSAGE_DELAY_MS: u64 = 200;

/// How a scripted generation ends after its messages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockOutcome {
    Complete,
    Error(String),
    /// Returns without calling any terminal callback.
    Stop,
    /// Returns an error instead of calling back.
    Throw(String),
    /// Never returns.
    Hang,
}

/// Scripted generator for local runs without a Claude installation.
#[derive(Debug, Clone)]
pub struct MockGenerator {
    messages: Vec<String>,
    delay: Duration,
    outcome: MockOutcome,
    session_id: Option<String>,
    files_changed: Vec<String>,
    usage: Option<TokenUsage>,
}

impl Default for MockGenerator {
    fn default() -> Self {
        Self {
            messages: vec![
                "Reading the project structure".to_string(),
                "Using Edit: app/index.tsx".to_string(),
                "Updated the home screen.".to_string(),
            ],
            delay: Duration::from_millis(MOCK_MESSAGE_DELAY_MS),
            outcome: MockOutcome::Complete,
            session_id: Some("mock-session".to_string()),
            files_changed: vec!["app/index.tsx".to_string()],
            usage: None,
        }
    }
}

impl MockGenerator {
    pub fn new(messages: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            messages: messages.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn with_outcome(mut self, outcome: MockOutcome) -> Self {
        self.outcome = outcome;
        self
    }

    pub fn with_session_id(mut self, session_id: Option<String>) -> Self {
        self.session_id = session_id;
        self
    }

    pub fn with_files_changed(mut self, files: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.files_changed = files.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_usage(mut self, usage: TokenUsage) -> Self {
        self.usage = Some(usage);
        self
    }
}

#[async_trait]
impl CodeGenerator for MockGenerator {
    async fn generate(
        &self,
        request: GenerationRequest,
        callbacks: GenerationCallbacks,
    ) -> Result<(), CapsuleError> {
        for message in &self.messages {
            if !self.delay.is_zero() {
                sleep(self.delay).await;
            }
            if callbacks.is_completed() {
                return Ok(());
            }
            callbacks.on_message(message.clone()).await;
        }

        match &self.outcome {
            MockOutcome::Complete => {
                callbacks
                    .on_complete(GenerationResult {
                        session_id: self
                            .session_id
                            .clone()
                            .or_else(|| request.conversation_id.clone()),
                        result: Some(format!("Done: {}", request.user_message)),
                        usage: self.usage,
                        files_changed: self.files_changed.clone(),
                        num_turns: Some(self.messages.len() as u64),
                        cost_usd: None,
                    })
                    .await;
                Ok(())
            }
            MockOutcome::Error(message) => {
                callbacks.on_error(message.clone()).await;
                Ok(())
            }
            MockOutcome::Stop => Ok(()),
            MockOutcome::Throw(message) => Err(CapsuleError::generation_failed(message.clone())),
            MockOutcome::Hang => {
                std::future::pending::<()>().await;
                Ok(())
            }
        }
    }
}
