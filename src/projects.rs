// Projects API
// Typed wrapper over `/projects`. Projects group documents and must be
// archived before they can be deleted.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::auth::RefreshCoordinator;
use crate::error::{ApiError, Result};
use crate::http_client::{ApiRequest, Transport};

const MAX_NAME_LEN: usize = 255;
const MAX_DESCRIPTION_LEN: usize = 500;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectSummary {
    pub id: Uuid,
    pub user_id: Uuid,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    pub is_archived: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct NewProject {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub tags: Vec<String>,
}

/// PATCH body; absent fields are left unchanged
#[derive(Debug, Clone, Default, Serialize)]
pub struct ProjectPatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tags: Option<Vec<String>>,
}

pub struct ProjectsApi<T: Transport> {
    coordinator: RefreshCoordinator<T>,
}

impl<T: Transport> Clone for ProjectsApi<T> {
    fn clone(&self) -> Self {
        Self {
            coordinator: self.coordinator.clone(),
        }
    }
}

impl<T: Transport> ProjectsApi<T> {
    pub fn new(coordinator: RefreshCoordinator<T>) -> Self {
        Self { coordinator }
    }

    pub async fn list(&self, include_archived: bool) -> Result<Vec<ProjectSummary>> {
        let request = ApiRequest::get("/projects").query("include_archived", include_archived);
        self.coordinator.request_json(&request).await
    }

    pub async fn get(&self, id: Uuid) -> Result<ProjectSummary> {
        self.coordinator
            .request_json(&ApiRequest::get(format!("/projects/{}", id)))
            .await
    }

    pub async fn create(&self, project: &NewProject) -> Result<ProjectSummary> {
        validate_name(&project.name)?;
        validate_description(project.description.as_deref())?;

        let body = serde_json::to_value(project).map_err(|e| ApiError::Internal(e.into()))?;
        self.coordinator
            .request_json(&ApiRequest::post("/projects").json(body))
            .await
    }

    pub async fn update(&self, id: Uuid, patch: &ProjectPatch) -> Result<ProjectSummary> {
        if let Some(name) = &patch.name {
            validate_name(name)?;
        }
        validate_description(patch.description.as_deref())?;

        let body = serde_json::to_value(patch).map_err(|e| ApiError::Internal(e.into()))?;
        self.coordinator
            .request_json(&ApiRequest::patch(format!("/projects/{}", id)).json(body))
            .await
    }

    pub async fn archive(&self, id: Uuid) -> Result<ProjectSummary> {
        self.coordinator
            .request_json(&ApiRequest::post(format!("/projects/{}/archive", id)))
            .await
    }

    pub async fn unarchive(&self, id: Uuid) -> Result<ProjectSummary> {
        self.coordinator
            .request_json(&ApiRequest::post(format!("/projects/{}/unarchive", id)))
            .await
    }

    /// Permanent delete; the service answers 400 unless the project is archived
    pub async fn delete(&self, id: Uuid) -> Result<()> {
        self.coordinator
            .request(&ApiRequest::delete(format!("/projects/{}", id)))
            .await?;
        tracing::info!(project_id = %id, "Project deleted");
        Ok(())
    }
}

fn validate_name(name: &str) -> Result<()> {
    let len = name.trim().chars().count();
    if len == 0 || len > MAX_NAME_LEN {
        return Err(ApiError::Validation(format!(
            "Project name must be between 1 and {} characters",
            MAX_NAME_LEN
        )));
    }
    Ok(())
}

fn validate_description(description: Option<&str>) -> Result<()> {
    match description {
        Some(d) if d.chars().count() > MAX_DESCRIPTION_LEN => Err(ApiError::Validation(format!(
            "Description must be at most {} characters",
            MAX_DESCRIPTION_LEN
        ))),
        _ => Ok(()),
    }
}
