//! Project records.
//!
//! The relay reads a project once when a request arrives and writes it once
//! when the generation completes.

use std::collections::HashMap;
use std::fmt::Debug;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use capsule_error::CapsuleError;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use utoipa::ToSchema;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum ProjectStatus {
    Idle,
    Ready,
    Failed,
}

impl Default for ProjectStatus {
    fn default() -> Self {
        Self::Idle
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ProjectRecord {
    pub id: String,
    pub user_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sandbox_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,
    #[serde(default)]
    pub status: ProjectStatus,
}

impl ProjectRecord {
    pub fn new(id: impl Into<String>, user_id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            user_id: user_id.into(),
            sandbox_id: None,
            conversation_id: None,
            status: ProjectStatus::Idle,
        }
    }

    pub fn with_sandbox(mut self, sandbox_id: impl Into<String>) -> Self {
        self.sandbox_id = Some(sandbox_id.into());
        self
    }

    fn apply(&mut self, update: &ProjectUpdate) {
        if let Some(conversation_id) = &update.conversation_id {
            self.conversation_id = Some(conversation_id.clone());
        }
        if let Some(status) = update.status {
            self.status = status;
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProjectUpdate {
    pub conversation_id: Option<String>,
    pub status: Option<ProjectStatus>,
}

#[async_trait]
pub trait ProjectStore: Send + Sync + Debug {
    async fn get(&self, project_id: &str) -> Result<Option<ProjectRecord>, CapsuleError>;

    async fn update(
        &self,
        project_id: &str,
        update: ProjectUpdate,
    ) -> Result<ProjectRecord, CapsuleError>;
}

#[derive(Debug, Default)]
pub struct InMemoryProjectStore {
    projects: Mutex<HashMap<String, ProjectRecord>>,
}

impl InMemoryProjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_projects(projects: impl IntoIterator<Item = ProjectRecord>) -> Self {
        let projects = projects
            .into_iter()
            .map(|project| (project.id.clone(), project))
            .collect();
        Self {
            projects: Mutex::new(projects),
        }
    }
}

#[async_trait]
impl ProjectStore for InMemoryProjectStore {
    async fn get(&self, project_id: &str) -> Result<Option<ProjectRecord>, CapsuleError> {
        Ok(self.projects.lock().await.get(project_id).cloned())
    }

    async fn update(
        &self,
        project_id: &str,
        update: ProjectUpdate,
    ) -> Result<ProjectRecord, CapsuleError> {
        let mut projects = self.projects.lock().await;
        let project = projects
            .get_mut(project_id)
            .ok_or_else(|| CapsuleError::ProjectNotFound {
                project_id: project_id.to_string(),
            })?;
        project.apply(&update);
        Ok(project.clone())
    }
}

/// Projects persisted as a JSON array on disk.
///
/// Writes go to a sibling temp file which is then renamed over the original.
#[derive(Debug)]
pub struct JsonFileProjectStore {
    path: PathBuf,
    projects: Mutex<Vec<ProjectRecord>>,
}

impl JsonFileProjectStore {
    /// Loads the file, starting empty when it does not exist yet.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, CapsuleError> {
        let path = path.into();
        let projects = match tokio::fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice::<Vec<ProjectRecord>>(&bytes).map_err(|err| {
                CapsuleError::storage(format!("failed to parse {}: {err}", path.display()))
            })?,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(err) => {
                return Err(CapsuleError::storage(format!(
                    "failed to read {}: {err}",
                    path.display()
                )))
            }
        };
        tracing::info!(path = %path.display(), projects = projects.len(), "loaded project store");
        Ok(Self {
            path,
            projects: Mutex::new(projects),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn persist(&self, projects: &[ProjectRecord]) -> Result<(), CapsuleError> {
        let bytes = serde_json::to_vec_pretty(projects)
            .map_err(|err| CapsuleError::storage(format!("failed to encode projects: {err}")))?;
        let tmp = self.path.with_extension("json.tmp");
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|err| CapsuleError::storage(err.to_string()))?;
            }
        }
        tokio::fs::write(&tmp, bytes)
            .await
            .map_err(|err| CapsuleError::storage(format!("failed to write {}: {err}", tmp.display())))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .map_err(|err| CapsuleError::storage(format!("failed to replace {}: {err}", self.path.display())))
    }
}

#[async_trait]
impl ProjectStore for JsonFileProjectStore {
    async fn get(&self, project_id: &str) -> Result<Option<ProjectRecord>, CapsuleError> {
        Ok(self
            .projects
            .lock()
            .await
            .iter()
            .find(|project| project.id == project_id)
            .cloned())
    }

    async fn update(
        &self,
        project_id: &str,
        update: ProjectUpdate,
    ) -> Result<ProjectRecord, CapsuleError> {
        let mut projects = self.projects.lock().await;
        let project = projects
            .iter_mut()
            .find(|project| project.id == project_id)
            .ok_or_else(|| CapsuleError::ProjectNotFound {
                project_id: project_id.to_string(),
            })?;
        project.apply(&update);
        let updated = project.clone();
        self.persist(&projects).await?;
        Ok(updated)
    }
}
