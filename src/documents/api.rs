use reqwest::header::{CONTENT_DISPOSITION, CONTENT_TYPE};
use uuid::Uuid;

use crate::auth::RefreshCoordinator;
use crate::error::{ApiError, Result, TransportError};
use crate::http_client::{ApiRequest, Transport, UploadForm};

use super::types::{
    DocumentPatch, DocumentQuery, DocumentSummary, DocumentText, DownloadedFile, NewDocument,
    StatusReport,
};

/// Upload size limit enforced by the service
pub const MAX_UPLOAD_BYTES: usize = 25 * 1024 * 1024;
const MAX_TITLE_LEN: usize = 255;

/// Typed wrapper over `/documents`
pub struct DocumentsApi<T: Transport> {
    coordinator: RefreshCoordinator<T>,
}

impl<T: Transport> Clone for DocumentsApi<T> {
    fn clone(&self) -> Self {
        Self {
            coordinator: self.coordinator.clone(),
        }
    }
}

impl<T: Transport> DocumentsApi<T> {
    pub fn new(coordinator: RefreshCoordinator<T>) -> Self {
        Self { coordinator }
    }

    pub async fn list(&self, query: &DocumentQuery) -> Result<Vec<DocumentSummary>> {
        let mut request = ApiRequest::get("/documents")
            .query("project_id", query.project_id)
            .query("limit", query.limit)
            .query("offset", query.offset);
        if let Some(status) = query.status {
            request = request.query("status", status);
        }
        self.coordinator.request_json(&request).await
    }

    pub async fn get(&self, id: Uuid) -> Result<DocumentSummary> {
        self.coordinator
            .request_json(&ApiRequest::get(format!("/documents/{}", id)))
            .await
    }

    /// Status fields only; what the poller fetches on each tick
    pub async fn status(&self, id: Uuid) -> Result<StatusReport> {
        self.coordinator
            .request_json(&ApiRequest::get(format!("/documents/{}", id)))
            .await
    }

    pub async fn get_text(&self, id: Uuid) -> Result<DocumentText> {
        self.coordinator
            .request_json(&ApiRequest::get(format!("/documents/{}/text", id)))
            .await
    }

    /// Original file bytes with the name and type the service reports
    pub async fn download(&self, id: Uuid) -> Result<DownloadedFile> {
        let response = self
            .coordinator
            .request(&ApiRequest::get(format!("/documents/{}/file", id)))
            .await?;

        Ok(DownloadedFile {
            file_name: response
                .header(CONTENT_DISPOSITION)
                .and_then(disposition_file_name),
            mime_type: response.header(CONTENT_TYPE).map(str::to_string),
            content: response.body,
        })
    }

    /// Upload a file. The service answers 202 with the new record, normally `processing`.
    pub async fn upload(&self, document: &NewDocument) -> Result<DocumentSummary> {
        validate_upload(document)?;

        let mut fields = vec![
            ("project_id".to_string(), document.project_id.to_string()),
            ("title".to_string(), document.title.clone()),
        ];
        if let Some(description) = &document.description {
            fields.push(("description".to_string(), description.clone()));
        }

        let form = UploadForm {
            fields,
            file_field: "file".to_string(),
            file_name: document.file_name.clone(),
            mime_type: document.mime_type.clone(),
            content: document.content.clone(),
        };

        let response = self
            .coordinator
            .request(&ApiRequest::post("/documents").multipart(form))
            .await
            .map_err(upload_error)?;
        response.json()
    }

    pub async fn update(&self, id: Uuid, patch: &DocumentPatch) -> Result<DocumentSummary> {
        let body = serde_json::to_value(patch).map_err(|e| ApiError::Internal(e.into()))?;
        self.coordinator
            .request_json(&ApiRequest::patch(format!("/documents/{}", id)).json(body))
            .await
    }

    pub async fn delete(&self, id: Uuid) -> Result<()> {
        self.coordinator
            .request(&ApiRequest::delete(format!("/documents/{}", id)))
            .await?;
        Ok(())
    }
}

fn validate_upload(document: &NewDocument) -> Result<()> {
    // The service counts the title as sent, surrounding spaces included
    if document.title.trim().is_empty() || document.title.chars().count() > MAX_TITLE_LEN {
        return Err(ApiError::Validation(format!(
            "Title must be between 1 and {} characters",
            MAX_TITLE_LEN
        )));
    }
    if document.mime_type.parse::<mime::Mime>().is_err() {
        return Err(ApiError::Validation(format!(
            "Invalid MIME type: {}",
            document.mime_type
        )));
    }
    if document.content.is_empty() {
        return Err(ApiError::Validation("File is empty".to_string()));
    }
    if document.content.len() > MAX_UPLOAD_BYTES {
        return Err(ApiError::Validation(format!(
            "File size {:.2}MB exceeds maximum allowed size of {}MB",
            document.content.len() as f64 / 1024.0 / 1024.0,
            MAX_UPLOAD_BYTES / 1024 / 1024
        )));
    }
    Ok(())
}

/// `filename` parameter of a Content-Disposition value, quoted or bare.
/// Directory parts are dropped so the name is safe to write locally.
fn disposition_file_name(value: &str) -> Option<String> {
    let raw = value.split(';').map(str::trim).find_map(|param| {
        let (key, val) = param.split_once('=')?;
        key.trim()
            .eq_ignore_ascii_case("filename")
            .then(|| val.trim().trim_matches('"'))
    })?;

    let name = raw.rsplit(['/', '\\']).next().unwrap_or(raw);
    if name.is_empty() || name == "." || name == ".." {
        return None;
    }
    Some(name.to_string())
}

/// Service rejections become `Upload`; auth failures stay as they are
fn upload_error(error: ApiError) -> ApiError {
    match error {
        ApiError::Transport(TransportError::Http { status, message }) => ApiError::Upload {
            status: Some(status),
            message,
        },
        ApiError::Transport(TransportError::Network(message)) => ApiError::Upload {
            status: None,
            message,
        },
        other => other,
    }
}
