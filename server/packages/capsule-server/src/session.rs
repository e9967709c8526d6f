//! Request-scoped generation session state.
//!
//! A session lives for exactly one streaming request. The relay's timer tasks,
//! its driver task and the generator callbacks all share it, so every mutable
//! field is atomic or behind a short-lived lock.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;

#[derive(Debug)]
pub struct GenerationSession {
    pub user_id: String,
    pub project_id: String,
    pub message_id: Option<String>,
    pub team_id: Option<String>,
    pub sandbox_id: String,
    /// Conversation to resume, if any.
    pub conversation_id: Option<String>,
    started_at: Instant,
    last_activity: Mutex<Instant>,
    message_count: AtomicU64,
    relayed_chars: AtomicU64,
    completed: AtomicBool,
}

impl GenerationSession {
    pub fn new(
        user_id: impl Into<String>,
        project_id: impl Into<String>,
        sandbox_id: impl Into<String>,
    ) -> Self {
        let now = Instant::now();
        Self {
            user_id: user_id.into(),
            project_id: project_id.into(),
            message_id: None,
            team_id: None,
            sandbox_id: sandbox_id.into(),
            conversation_id: None,
            started_at: now,
            last_activity: Mutex::new(now),
            message_count: AtomicU64::new(0),
            relayed_chars: AtomicU64::new(0),
            completed: AtomicBool::new(false),
        }
    }

    pub fn with_message_id(mut self, message_id: Option<String>) -> Self {
        self.message_id = message_id;
        self
    }

    pub fn with_team_id(mut self, team_id: Option<String>) -> Self {
        self.team_id = team_id;
        self
    }

    pub fn with_conversation_id(mut self, conversation_id: Option<String>) -> Self {
        self.conversation_id = conversation_id;
        self
    }

    /// Claims the single terminal transition. Returns `true` for exactly one caller.
    pub fn try_complete(&self) -> bool {
        self.completed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn is_completed(&self) -> bool {
        self.completed.load(Ordering::Acquire)
    }

    pub fn touch(&self) {
        if let Ok(mut last) = self.last_activity.lock() {
            *last = Instant::now();
        }
    }

    pub fn idle_for(&self) -> Duration {
        self.last_activity
            .lock()
            .map(|last| last.elapsed())
            .unwrap_or_default()
    }

    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// Counts one relayed message and returns the new total.
    pub fn record_message(&self, text: &str) -> u64 {
        self.relayed_chars
            .fetch_add(text.chars().count() as u64, Ordering::Relaxed);
        self.message_count.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub fn message_count(&self) -> u64 {
        self.message_count.load(Ordering::Acquire)
    }

    pub fn relayed_chars(&self) -> u64 {
        self.relayed_chars.load(Ordering::Relaxed)
    }
}
