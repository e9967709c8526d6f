use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use utoipa::ToSchema;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, JsonSchema, ToSchema)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorType {
    ValidationError,
    ProjectError,
    SandboxError,
    GenerationError,
    TimeoutError,
    StorageError,
}

impl ErrorType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ValidationError => "validation-error",
            Self::ProjectError => "project-error",
            Self::SandboxError => "sandbox-error",
            Self::GenerationError => "generation-error",
            Self::TimeoutError => "timeout-error",
            Self::StorageError => "storage-error",
        }
    }

    pub fn title(&self) -> &'static str {
        match self {
            Self::ValidationError => "Invalid Request",
            Self::ProjectError => "Project Not Found",
            Self::SandboxError => "Sandbox Error",
            Self::GenerationError => "Generation Failed",
            Self::TimeoutError => "Timeout",
            Self::StorageError => "Storage Error",
        }
    }

    pub fn status_code(&self) -> u16 {
        match self {
            Self::ValidationError => 400,
            Self::ProjectError => 404,
            Self::SandboxError => 400,
            Self::GenerationError => 500,
            Self::TimeoutError => 504,
            Self::StorageError => 500,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, ToSchema)]
pub struct ProblemDetails {
    #[serde(rename = "type")]
    pub type_: ErrorType,
    pub title: String,
    pub status: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    #[serde(flatten, default, skip_serializing_if = "Map::is_empty")]
    pub extensions: Map<String, Value>,
}

impl ProblemDetails {
    pub fn new(error_type: ErrorType, detail: Option<String>) -> Self {
        Self {
            type_: error_type,
            title: error_type.title().to_string(),
            status: error_type.status_code(),
            detail,
            extensions: Map::new(),
        }
    }
}

#[derive(Debug, Error)]
pub enum CapsuleError {
    #[error("invalid request: {message}")]
    InvalidRequest { message: String },
    #[error("project not found: {project_id}")]
    ProjectNotFound { project_id: String },
    #[error("no sandbox associated with project {project_id}")]
    SandboxMissing { project_id: String },
    #[error("sandbox not found: {sandbox_id}")]
    SandboxNotFound { sandbox_id: String },
    #[error("sandbox unavailable: {sandbox_id}: {message}")]
    SandboxUnavailable { sandbox_id: String, message: String },
    #[error("generation failed: {message}")]
    GenerationFailed { message: String },
    #[error("timeout")]
    Timeout { message: Option<String> },
    #[error("storage error: {message}")]
    Storage { message: String },
}

impl CapsuleError {
    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::InvalidRequest {
            message: message.into(),
        }
    }

    pub fn generation_failed(message: impl Into<String>) -> Self {
        Self::GenerationFailed {
            message: message.into(),
        }
    }

    /// Timeout with the wording shown to the client.
    pub fn timeout(message: impl Into<String>) -> Self {
        Self::Timeout {
            message: Some(message.into()),
        }
    }

    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage {
            message: message.into(),
        }
    }

    pub fn error_type(&self) -> ErrorType {
        match self {
            Self::InvalidRequest { .. } => ErrorType::ValidationError,
            Self::ProjectNotFound { .. } => ErrorType::ProjectError,
            Self::SandboxMissing { .. }
            | Self::SandboxNotFound { .. }
            | Self::SandboxUnavailable { .. } => ErrorType::SandboxError,
            Self::GenerationFailed { .. } => ErrorType::GenerationError,
            Self::Timeout { .. } => ErrorType::TimeoutError,
            Self::Storage { .. } => ErrorType::StorageError,
        }
    }

    /// Message shown to the client. Timeouts carry their own wording.
    pub fn client_message(&self) -> String {
        match self {
            Self::Timeout {
                message: Some(message),
            } => message.clone(),
            other => other.to_string(),
        }
    }

    pub fn to_problem_details(&self) -> ProblemDetails {
        let mut problem = ProblemDetails::new(self.error_type(), Some(self.client_message()));

        let mut extensions = Map::new();
        match self {
            Self::ProjectNotFound { project_id } | Self::SandboxMissing { project_id } => {
                extensions.insert("projectId".to_string(), Value::String(project_id.clone()));
            }
            Self::SandboxNotFound { sandbox_id } | Self::SandboxUnavailable { sandbox_id, .. } => {
                extensions.insert("sandboxId".to_string(), Value::String(sandbox_id.clone()));
            }
            _ => {}
        }
        problem.extensions = extensions;
        problem
    }
}

impl From<CapsuleError> for ProblemDetails {
    fn from(value: CapsuleError) -> Self {
        value.to_problem_details()
    }
}

impl From<&CapsuleError> for ProblemDetails {
    fn from(value: &CapsuleError) -> Self {
        value.to_problem_details()
    }
}
