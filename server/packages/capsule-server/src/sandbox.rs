//! Sandbox connectors.
//!
//! Generated apps run inside remote E2B sandboxes. The relay only needs to
//! confirm a sandbox is alive and to derive the public URL for one of its
//! ports.

use std::fmt::Debug;
use std::time::Duration;

use async_trait::async_trait;
use capsule_error::CapsuleError;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use url::Url;

pub const DEFAULT_E2B_API_URL: &str = "https://api.e2b.dev";
pub const DEFAULT_E2B_DOMAIN: &str = "e2b.app";
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SandboxHandle {
    pub sandbox_id: String,
    pub domain: String,
}

impl SandboxHandle {
    pub fn new(sandbox_id: impl Into<String>, domain: impl Into<String>) -> Self {
        Self {
            sandbox_id: sandbox_id.into(),
            domain: domain.into(),
        }
    }

    /// Public URL for a port exposed by the sandbox.
    pub fn host(&self, port: u16) -> String {
        format!("https://{port}-{}.{}", self.sandbox_id, self.domain)
    }
}

#[async_trait]
pub trait SandboxConnector: Send + Sync + Debug {
    async fn connect(&self, sandbox_id: &str) -> Result<SandboxHandle, CapsuleError>;
}

/// Connects through the E2B control-plane API.
#[derive(Debug, Clone)]
pub struct E2bConnector {
    client: Client,
    api_url: Url,
    api_key: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SandboxInfo {
    #[serde(default)]
    domain: Option<String>,
}

impl E2bConnector {
    pub fn new(api_url: &str, api_key: impl Into<String>) -> Result<Self, CapsuleError> {
        let mut api_url = Url::parse(api_url)
            .map_err(|err| CapsuleError::invalid_request(format!("invalid e2b api url: {err}")))?;
        if !api_url.path().ends_with('/') {
            let path = format!("{}/", api_url.path());
            api_url.set_path(&path);
        }
        let client = Client::builder()
            .timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(|err| CapsuleError::invalid_request(format!("http client: {err}")))?;
        Ok(Self {
            client,
            api_url,
            api_key: api_key.into(),
        })
    }

    fn sandbox_url(&self, sandbox_id: &str) -> Result<Url, CapsuleError> {
        self.api_url
            .join(&format!("sandboxes/{sandbox_id}"))
            .map_err(|err| CapsuleError::SandboxUnavailable {
                sandbox_id: sandbox_id.to_string(),
                message: err.to_string(),
            })
    }
}

#[async_trait]
impl SandboxConnector for E2bConnector {
    async fn connect(&self, sandbox_id: &str) -> Result<SandboxHandle, CapsuleError> {
        let url = self.sandbox_url(sandbox_id)?;
        tracing::debug!(sandbox_id, url = %url, "connecting to sandbox");

        let unavailable = |message: String| CapsuleError::SandboxUnavailable {
            sandbox_id: sandbox_id.to_string(),
            message,
        };

        let response = self
            .client
            .get(url)
            .header("X-API-Key", &self.api_key)
            .send()
            .await
            .map_err(|err| unavailable(err.to_string()))?;

        match response.status() {
            StatusCode::NOT_FOUND => Err(CapsuleError::SandboxNotFound {
                sandbox_id: sandbox_id.to_string(),
            }),
            status if !status.is_success() => {
                Err(unavailable(format!("unexpected status {status}")))
            }
            _ => {
                let info: SandboxInfo = response
                    .json()
                    .await
                    .map_err(|err| unavailable(err.to_string()))?;
                Ok(SandboxHandle::new(
                    sandbox_id,
                    info.domain
                        .unwrap_or_else(|| DEFAULT_E2B_DOMAIN.to_string()),
                ))
            }
        }
    }
}

/// Accepts every sandbox id without a network round trip. Used for local runs.
#[derive(Debug, Clone)]
pub struct StaticSandboxConnector {
    domain: String,
}

impl StaticSandboxConnector {
    pub fn new(domain: impl Into<String>) -> Self {
        Self {
            domain: domain.into(),
        }
    }
}

impl Default for StaticSandboxConnector {
    fn default() -> Self {
        Self::new(DEFAULT_E2B_DOMAIN)
    }
}

#[async_trait]
impl SandboxConnector for StaticSandboxConnector {
    async fn connect(&self, sandbox_id: &str) -> Result<SandboxHandle, CapsuleError> {
        if sandbox_id.trim().is_empty() {
            return Err(CapsuleError::SandboxNotFound {
                sandbox_id: sandbox_id.to_string(),
            });
        }
        Ok(SandboxHandle::new(sandbox_id, self.domain.clone()))
    }
}
