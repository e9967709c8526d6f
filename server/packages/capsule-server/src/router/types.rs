use super::*;

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, ToSchema)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

/// `fileEdition` is either a flag or the path of the file being edited.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema, ToSchema)]
#[serde(untagged)]
pub enum FileEdition {
    Enabled(bool),
    Path(String),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct GenerateRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,
    #[serde(rename = "userID", default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(rename = "teamID", default, skip_serializing_if = "Option::is_none")]
    pub team_id: Option<String>,
    #[serde(default)]
    pub is_first_message: bool,
    #[serde(default)]
    pub images: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_edition: Option<FileEdition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schema(value_type = Option<Object>)]
    pub selection_data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sandbox_id: Option<String>,
}

/// Fields every generation request must carry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct RequiredFields {
    pub user_id: String,
    pub project_id: String,
    pub user_message: String,
}

impl GenerateRequest {
    pub(crate) fn validate(&self) -> Result<RequiredFields, CapsuleError> {
        let user_id = non_blank(self.user_id.clone());
        let project_id = non_blank(self.project_id.clone());
        let user_message = non_blank(self.user_message.clone());

        let mut missing = Vec::new();
        if user_id.is_none() {
            missing.push("userID");
        }
        if project_id.is_none() {
            missing.push("projectId");
        }
        if user_message.is_none() {
            missing.push("userMessage");
        }

        match (user_id, project_id, user_message) {
            (Some(user_id), Some(project_id), Some(user_message)) => Ok(RequiredFields {
                user_id,
                project_id,
                user_message,
            }),
            _ => Err(CapsuleError::invalid_request(format!(
                "missing required fields: {}",
                missing.join(", ")
            ))),
        }
    }

    pub(crate) fn into_input(self, user_message: String) -> GenerationInput {
        let (file_edition, edited_file) = match self.file_edition {
            Some(FileEdition::Enabled(enabled)) => (enabled, None),
            Some(FileEdition::Path(path)) if !path.trim().is_empty() => (true, Some(path)),
            Some(FileEdition::Path(_)) | None => (false, None),
        };
        GenerationInput {
            user_message,
            is_first_message: self.is_first_message,
            images: self.images,
            file_edition,
            edited_file,
            selection_data: self.selection_data,
        }
    }
}
