// Documents module
// Typed `/documents` API plus the processing-aware document list

mod api;
mod manager;
mod types;

pub use api::{DocumentsApi, MAX_UPLOAD_BYTES};
pub use manager::{timeout_message, DocumentList, DocumentManager, DocumentPoller};
pub use types::{
    DocumentEvent, DocumentPatch, DocumentQuery, DocumentStatus, DocumentSummary, DocumentText,
    DownloadedFile, NewDocument, StatusReport,
};
