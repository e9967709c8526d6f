use std::time::Duration;

pub const DEFAULT_KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);
pub const DEFAULT_STREAM_TIMEOUT: Duration = Duration::from_secs(15 * 60);
pub const DEFAULT_CHANNEL_CAPACITY: usize = 64;
pub const DEFAULT_MODEL: &str = "claude-code";
/// Port the Expo dev server listens on inside the sandbox.
pub const DEFAULT_PREVIEW_PORT: u16 = 8081;

/// Tunables for a single generation stream.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub keepalive_interval: Duration,
    pub stream_timeout: Duration,
    pub channel_capacity: usize,
    /// Model name reported to usage tracking.
    pub model: String,
    pub preview_port: u16,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            keepalive_interval: DEFAULT_KEEPALIVE_INTERVAL,
            stream_timeout: DEFAULT_STREAM_TIMEOUT,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            model: DEFAULT_MODEL.to_string(),
            preview_port: DEFAULT_PREVIEW_PORT,
        }
    }
}

impl RelayConfig {
    pub fn with_keepalive_interval(mut self, interval: Duration) -> Self {
        self.keepalive_interval = interval;
        self
    }

    pub fn with_stream_timeout(mut self, timeout: Duration) -> Self {
        self.stream_timeout = timeout;
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    /// Human readable form of the timeout for the timeout error frame.
    pub fn timeout_label(&self) -> String {
        let secs = self.stream_timeout.as_secs();
        if secs >= 60 && secs % 60 == 0 {
            let minutes = secs / 60;
            if minutes == 1 {
                "1 minute".to_string()
            } else {
                format!("{minutes} minutes")
            }
        } else {
            format!("{}ms", self.stream_timeout.as_millis())
        }
    }
}
