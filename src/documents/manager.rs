use chrono::Utc;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::watch;
use uuid::Uuid;

use crate::error::{ApiError, Result};
use crate::http_client::Transport;
use crate::poller::{PollConfig, PollHandler, ResourcePoller};

use super::api::DocumentsApi;
use super::types::{
    DocumentEvent, DocumentPatch, DocumentQuery, DocumentStatus, DocumentSummary, NewDocument,
    StatusReport,
};

/// Immutable snapshot of the visible document list
pub type DocumentList = Arc<Vec<DocumentSummary>>;

pub type DocumentPoller = ResourcePoller<Uuid, StatusReport>;

const EVENT_CAPACITY: usize = 256;

/// Message shown when we stop waiting, distinct from any server-reported failure
pub fn timeout_message(elapsed: Duration) -> String {
    format!(
        "Processing timed out after {}s; stopped waiting for the server",
        elapsed.as_secs()
    )
}

/// List state shared between the manager and its poll callbacks
struct DocumentState {
    list: watch::Sender<DocumentList>,
    events: broadcast::Sender<DocumentEvent>,
}

impl DocumentState {
    fn snapshot(&self) -> DocumentList {
        self.list.borrow().clone()
    }

    fn emit(&self, event: DocumentEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    /// Replace the entry for `id` with `f(entry)`; no-op when `id` is not listed
    fn merge(&self, id: Uuid, f: impl FnOnce(&DocumentSummary) -> DocumentSummary) -> bool {
        self.list.send_if_modified(|current| {
            let Some(pos) = current.iter().position(|d| d.id == id) else {
                return false;
            };
            let mut next = current.as_ref().clone();
            next[pos] = f(&current[pos]);
            *current = Arc::new(next);
            true
        })
    }

    fn remove(&self, id: Uuid) -> bool {
        let removed = self.list.send_if_modified(|current| {
            if !current.iter().any(|d| d.id == id) {
                return false;
            }
            let next: Vec<DocumentSummary> =
                current.iter().filter(|d| d.id != id).cloned().collect();
            *current = Arc::new(next);
            true
        });
        if removed {
            self.emit(DocumentEvent::Removed(id));
        }
        removed
    }

    fn prepend(&self, doc: DocumentSummary) {
        let id = doc.id;
        self.list.send_modify(|current| {
            let mut next = Vec::with_capacity(current.len() + 1);
            next.push(doc);
            next.extend(current.iter().filter(|d| d.id != id).cloned());
            *current = Arc::new(next);
        });
        self.emit(DocumentEvent::Added(id));
    }
}

impl PollHandler<Uuid, StatusReport, ApiError> for DocumentState {
    fn on_update(&self, id: &Uuid, report: &StatusReport) {
        // A poll result for a document that left the list is discarded
        if self.merge(*id, |doc| doc.with_status(report)) {
            tracing::debug!(document_id = %id, status = %report.status, "Document status updated");
            self.emit(DocumentEvent::Updated {
                id: *id,
                status: report.status,
            });
        }
    }

    fn on_terminal(&self, id: &Uuid, report: &StatusReport) {
        tracing::info!(
            document_id = %id,
            status = %report.status,
            message = ?report.status_message,
            "Document processing finished"
        );
    }

    fn on_timeout(&self, id: &Uuid, elapsed: Duration) {
        let message = timeout_message(elapsed);
        let merged = self.merge(*id, |doc| DocumentSummary {
            status: DocumentStatus::Failed,
            status_message: Some(message.clone()),
            updated_at: Utc::now(),
            ..doc.clone()
        });
        if merged {
            tracing::warn!(document_id = %id, elapsed_secs = elapsed.as_secs(), "Document processing timed out");
            self.emit(DocumentEvent::TimedOut(*id));
        }
    }

    fn on_error(&self, id: &Uuid, error: &ApiError) {
        if error.is_not_found() {
            tracing::info!(document_id = %id, "Document no longer exists, removing from list");
            self.remove(*id);
            return;
        }

        tracing::warn!(document_id = %id, error = %error, "Document status check failed");
        self.emit(DocumentEvent::PollFailed {
            id: *id,
            message: error.to_string(),
        });
    }
}

/// Document lifecycle manager
/// Owns the visible document list and keeps one poll running per processing document.
/// Callers never touch timers; `shutdown` (or dropping the manager) cancels them all.
pub struct DocumentManager<T: Transport> {
    api: DocumentsApi<T>,
    poller: DocumentPoller,
    state: Arc<DocumentState>,
}

impl<T: Transport> DocumentManager<T> {
    pub fn new(api: DocumentsApi<T>, config: PollConfig) -> Self {
        let (list, _) = watch::channel(Arc::new(Vec::new()));
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            api,
            poller: ResourcePoller::new(config),
            state: Arc::new(DocumentState { list, events }),
        }
    }

    /// Current list snapshot
    pub fn documents(&self) -> DocumentList {
        self.state.snapshot()
    }

    pub fn get(&self, id: Uuid) -> Option<DocumentSummary> {
        self.state.snapshot().iter().find(|d| d.id == id).cloned()
    }

    /// Live list; a new snapshot is published on every change
    pub fn subscribe(&self) -> watch::Receiver<DocumentList> {
        self.state.list.subscribe()
    }

    pub fn events(&self) -> broadcast::Receiver<DocumentEvent> {
        self.state.events.subscribe()
    }

    pub fn poller(&self) -> &DocumentPoller {
        &self.poller
    }

    /// Fetch the list and start polling every processing document
    pub async fn load(&self, query: &DocumentQuery) -> Result<DocumentList> {
        let docs = self.api.list(query).await?;

        let processing: HashSet<Uuid> = docs
            .iter()
            .filter(|d| d.is_processing())
            .map(|d| d.id)
            .collect();
        for id in self.poller.tracked_ids() {
            if !processing.contains(&id) {
                self.poller.stop_polling(&id);
            }
        }

        tracing::info!(
            project_id = %query.project_id,
            documents = docs.len(),
            processing = processing.len(),
            "Loaded documents"
        );
        self.state.list.send_replace(Arc::new(docs));

        for id in processing {
            self.track(id);
        }
        Ok(self.documents())
    }

    /// Upload a document. Failed uploads never reach the list.
    pub async fn upload(&self, document: &NewDocument) -> Result<DocumentSummary> {
        let created = self.api.upload(document).await?;
        tracing::info!(document_id = %created.id, status = %created.status, "Document uploaded");

        self.state.prepend(created.clone());
        if created.is_processing() {
            self.track(created.id);
        }
        Ok(created)
    }

    /// Delete a document, stopping its poll first.
    /// A 404 counts as deleted. On any other failure polling resumes if the document is still processing.
    pub async fn delete(&self, id: Uuid) -> Result<()> {
        self.poller.stop_polling(&id);

        match self.api.delete(id).await {
            Ok(()) => {
                self.state.remove(id);
                tracing::info!(document_id = %id, "Document deleted");
                Ok(())
            }
            Err(e) if e.is_not_found() => {
                self.state.remove(id);
                Ok(())
            }
            Err(e) => {
                if self.get(id).is_some_and(|d| d.is_processing()) {
                    self.track(id);
                }
                Err(e)
            }
        }
    }

    /// Update title/description and merge the returned record
    pub async fn update(&self, id: Uuid, patch: &DocumentPatch) -> Result<DocumentSummary> {
        let updated = self.api.update(id, patch).await?;
        let record = updated.clone();
        self.state.merge(id, move |_| record);
        Ok(updated)
    }

    /// Wait until a listed document leaves `processing`, is removed, or stops being polled.
    /// Returns the latest record, or None once the document is gone.
    pub async fn wait_until_settled(&self, id: Uuid) -> Option<DocumentSummary> {
        let mut events = self.events();
        let grace = self.poller.config().interval;

        loop {
            let doc = self.get(id)?;
            if !doc.is_processing() {
                return Some(doc);
            }
            let polling = self.poller.is_polling(&id);

            // Final callbacks fire right after the poll unregisters, so an idle
            // interval with no poll running means nothing more will change
            match tokio::time::timeout(grace, events.recv()).await {
                Ok(Ok(_)) | Ok(Err(RecvError::Lagged(_))) => continue,
                Ok(Err(RecvError::Closed)) => return self.get(id),
                Err(_) if !polling => return self.get(id),
                Err(_) => continue,
            }
        }
    }

    /// Stop every poll
    pub fn shutdown(&self) {
        let stopped = self.poller.stop_all();
        tracing::debug!(stopped, "Document manager shut down");
    }

    fn track(&self, id: Uuid) -> bool {
        let api = self.api.clone();
        self.poller.start_polling(
            id,
            move || {
                let api = api.clone();
                async move { api.status(id).await }
            },
            Arc::clone(&self.state),
        )
    }
}

impl<T: Transport> Drop for DocumentManager<T> {
    fn drop(&mut self) {
        self.poller.stop_all();
    }
}
