// Document types

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::poller::PollStatus;

/// Server-side processing state of a document
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DocumentStatus {
    Processing,
    Ready,
    Failed,
}

impl DocumentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentStatus::Processing => "processing",
            DocumentStatus::Ready => "ready",
            DocumentStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for DocumentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

/// Document as shown in lists
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentSummary {
    pub id: Uuid,
    pub project_id: Uuid,
    pub source_type: String,
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    pub status: DocumentStatus,
    #[serde(default)]
    pub status_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl DocumentSummary {
    pub fn is_processing(&self) -> bool {
        self.status == DocumentStatus::Processing
    }

    /// Copy with the polled status merged in
    pub fn with_status(&self, report: &StatusReport) -> Self {
        Self {
            status: report.status,
            status_message: report.status_message.clone(),
            updated_at: report.updated_at,
            ..self.clone()
        }
    }
}

/// Status fields of `GET /documents/{id}`; the rest of the record is ignored
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusReport {
    pub status: DocumentStatus,
    #[serde(default)]
    pub status_message: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl PollStatus for StatusReport {
    fn is_terminal(&self) -> bool {
        self.status != DocumentStatus::Processing
    }
}

/// Body of `GET /documents/{id}/text`; `text` is null until extraction finished
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct DocumentText {
    pub text: Option<String>,
}

/// Originally uploaded file as served by `GET /documents/{id}/file`
#[derive(Debug, Clone, PartialEq)]
pub struct DownloadedFile {
    /// From `Content-Disposition`, when the service sent one
    pub file_name: Option<String>,
    pub mime_type: Option<String>,
    pub content: Bytes,
}

/// Query for listing a project's documents
#[derive(Debug, Clone)]
pub struct DocumentQuery {
    pub project_id: Uuid,
    pub status: Option<DocumentStatus>,
    pub limit: u32,
    pub offset: u32,
}

impl DocumentQuery {
    pub fn for_project(project_id: Uuid) -> Self {
        Self {
            project_id,
            status: None,
            limit: 100,
            offset: 0,
        }
    }
}

/// File plus metadata for a new document
#[derive(Debug, Clone)]
pub struct NewDocument {
    pub project_id: Uuid,
    pub title: String,
    pub description: Option<String>,
    pub file_name: String,
    pub mime_type: String,
    pub content: Bytes,
}

/// PATCH body; absent fields are left unchanged
#[derive(Debug, Clone, Default, Serialize)]
pub struct DocumentPatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// Change notifications for a UI layer
#[derive(Debug, Clone, PartialEq)]
pub enum DocumentEvent {
    Added(Uuid),
    /// A poll tick merged a fresh status into the list
    Updated { id: Uuid, status: DocumentStatus },
    /// The poll budget ran out; the document was marked failed locally
    TimedOut(Uuid),
    /// A status fetch failed and polling for the document stopped
    PollFailed { id: Uuid, message: String },
    Removed(Uuid),
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_summary_from_list_response() {
        let body = json!({
            "id": "0d3c5b7e-3f1e-4c2a-9d7e-1b2c3d4e5f60",
            "projectId": "9a1b2c3d-4e5f-4a6b-8c7d-0e1f2a3b4c5d",
            "sourceType": "upload",
            "title": "Quarterly report",
            "description": null,
            "status": "processing",
            "statusMessage": null,
            "createdAt": "2025-03-01T09:00:00Z",
            "updatedAt": "2025-03-01T09:00:00Z"
        });

        let doc: DocumentSummary = serde_json::from_value(body).unwrap();
        assert!(doc.is_processing());
        assert_eq!(doc.title, "Quarterly report");
    }

    #[test]
    fn test_status_report_ignores_extra_fields() {
        let body = json!({
            "id": "0d3c5b7e-3f1e-4c2a-9d7e-1b2c3d4e5f60",
            "status": "failed",
            "statusMessage": "Text extraction failed: encrypted PDF",
            "updatedAt": "2025-03-01T09:01:00Z",
            "extractedText": null,
            "sourceMetadata": {"size": 1024}
        });

        let report: StatusReport = serde_json::from_value(body).unwrap();
        assert_eq!(report.status, DocumentStatus::Failed);
        assert!(report.is_terminal());
    }

    #[test]
    fn test_with_status_replaces_only_status_fields() {
        let doc: DocumentSummary = serde_json::from_value(json!({
            "id": "0d3c5b7e-3f1e-4c2a-9d7e-1b2c3d4e5f60",
            "projectId": "9a1b2c3d-4e5f-4a6b-8c7d-0e1f2a3b4c5d",
            "sourceType": "upload",
            "title": "Notes",
            "status": "processing",
            "createdAt": "2025-03-01T09:00:00Z",
            "updatedAt": "2025-03-01T09:00:00Z"
        }))
        .unwrap();

        let report = StatusReport {
            status: DocumentStatus::Ready,
            status_message: Some("Extracted 12 pages".to_string()),
            updated_at: "2025-03-01T09:02:00Z".parse().unwrap(),
        };

        let merged = doc.with_status(&report);
        assert_eq!(merged.status, DocumentStatus::Ready);
        assert_eq!(merged.title, "Notes");
        assert_eq!(merged.created_at, doc.created_at);
        assert_eq!(merged.updated_at, report.updated_at);
        assert!(doc.is_processing());
    }

    #[test]
    fn test_document_text_from_service_body() {
        let text: DocumentText = serde_json::from_value(json!({"text": "Revenue grew"})).unwrap();
        assert_eq!(text.text.as_deref(), Some("Revenue grew"));

        let pending: DocumentText = serde_json::from_value(json!({"text": null})).unwrap();
        assert_eq!(pending.text, None);
    }

    #[test]
    fn test_patch_skips_unset_fields() {
        let patch = DocumentPatch {
            title: Some("Renamed".to_string()),
            description: None,
        };
        assert_eq!(serde_json::to_value(&patch).unwrap(), json!({"title": "Renamed"}));
    }
}
