use std::collections::HashMap;
use std::fmt::Debug;

use async_trait::async_trait;
use capsule_error::CapsuleError;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use utoipa::ToSchema;

/// Usage and billing counters. Failures are reported but never fail a generation.
#[async_trait]
pub trait UsageTracker: Send + Sync + Debug {
    async fn track_token_usage(
        &self,
        user_id: &str,
        tokens: u64,
        model: &str,
        project_id: &str,
    ) -> Result<(), CapsuleError>;

    async fn track_code_generation(
        &self,
        user_id: &str,
        project_id: &str,
        file_count: u64,
        tokens: u64,
    ) -> Result<(), CapsuleError>;

    async fn user_totals(&self, user_id: &str) -> Result<UsageTotals, CapsuleError>;
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct UsageTotals {
    pub tokens: u64,
    pub generations: u64,
    pub files_generated: u64,
    pub tokens_by_model: HashMap<String, u64>,
}

#[derive(Debug, Default)]
pub struct InMemoryUsageTracker {
    totals: Mutex<HashMap<String, UsageTotals>>,
}

impl InMemoryUsageTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn totals(&self, user_id: &str) -> UsageTotals {
        self.totals
            .lock()
            .await
            .get(user_id)
            .cloned()
            .unwrap_or_default()
    }
}

#[async_trait]
impl UsageTracker for InMemoryUsageTracker {
    async fn track_token_usage(
        &self,
        user_id: &str,
        tokens: u64,
        model: &str,
        project_id: &str,
    ) -> Result<(), CapsuleError> {
        let mut totals = self.totals.lock().await;
        let entry = totals.entry(user_id.to_string()).or_default();
        entry.tokens += tokens;
        *entry.tokens_by_model.entry(model.to_string()).or_default() += tokens;
        tracing::info!(user_id, project_id, model, tokens, "tracked token usage");
        Ok(())
    }

    async fn track_code_generation(
        &self,
        user_id: &str,
        project_id: &str,
        file_count: u64,
        tokens: u64,
    ) -> Result<(), CapsuleError> {
        let mut totals = self.totals.lock().await;
        let entry = totals.entry(user_id.to_string()).or_default();
        entry.generations += 1;
        entry.files_generated += file_count;
        tracing::info!(user_id, project_id, file_count, tokens, "tracked code generation");
        Ok(())
    }

    async fn user_totals(&self, user_id: &str) -> Result<UsageTotals, CapsuleError> {
        Ok(self.totals(user_id).await)
    }
}

/// Rough token estimate used when the generator does not report usage.
pub fn estimate_tokens(chars: u64) -> u64 {
    chars.div_ceil(4)
}
