use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

use docflow_client::auth::{RefreshCoordinator, Session, TokenStore};
use docflow_client::config::{Command, Config};
use docflow_client::documents::{
    DocumentEvent, DocumentManager, DocumentQuery, DocumentStatus, DocumentSummary, DocumentsApi,
    NewDocument,
};
use docflow_client::http_client::HttpTransport;
use docflow_client::projects::ProjectsApi;

struct Client {
    session: Session<HttpTransport>,
    projects: ProjectsApi<HttpTransport>,
    documents: DocumentsApi<HttpTransport>,
    manager: DocumentManager<HttpTransport>,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration first (for log level)
    let config = Config::load()?;
    config.validate()?;

    // Initialize logging with a configured level
    let log_level = config.log_level.to_lowercase();
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&log_level));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(true)
        .with_line_number(true)
        .with_writer(std::io::stderr)
        .init();

    tracing::debug!(api_url = %config.api_base_url, "Configuration loaded");

    let tokens = TokenStore::new();
    let transport = HttpTransport::new(&config.api_base_url, tokens, &config.http_settings())?;
    let coordinator = RefreshCoordinator::new(transport);
    let documents = DocumentsApi::new(coordinator.clone());
    let client = Client {
        session: Session::new(coordinator.clone()),
        projects: ProjectsApi::new(coordinator.clone()),
        manager: DocumentManager::new(documents.clone(), config.poll_config()),
        documents,
    };

    // The access token only ever lives in this process
    let (email, password) = config.credentials()?;
    let auth = client
        .session
        .sign_in(&email, &password)
        .await
        .context("Sign-in failed")?;
    tracing::info!(user_id = %auth.user.id, "Session established");

    let result = tokio::select! {
        result = run(&client, config.command.clone()) => result,
        _ = shutdown_signal() => Ok(()),
    };

    client.manager.shutdown();
    client.session.sign_out().await;

    if let Err(e) = &result {
        if let Some(api) = e.downcast_ref::<docflow_client::error::ApiError>() {
            if api.is_auth_expired() {
                eprintln!("Your session has expired. Please sign in again.");
            }
        }
    }
    result
}

async fn run(client: &Client, command: Command) -> Result<()> {
    match command {
        Command::Projects { archived } => {
            let projects = client.projects.list(archived).await?;
            if projects.is_empty() {
                println!("No projects");
            }
            for project in projects {
                let archived = if project.is_archived { " [archived]" } else { "" };
                println!("{}  {}{}", project.id, project.name, archived);
                if !project.tags.is_empty() {
                    println!("    tags: {}", project.tags.join(", "));
                }
            }
        }

        Command::Documents { project, status } => {
            let mut query = DocumentQuery::for_project(project);
            query.status = status;
            let documents = client.documents.list(&query).await?;
            if documents.is_empty() {
                println!("No documents");
            }
            for doc in &documents {
                print_document(doc);
            }
        }

        Command::Upload {
            project,
            title,
            description,
            file,
        } => {
            let content = tokio::fs::read(&file)
                .await
                .with_context(|| format!("Failed to read {}", file.display()))?;
            let file_name = file
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .context("Upload path has no file name")?;

            let new_document = NewDocument {
                project_id: project,
                title,
                description,
                mime_type: mime_type_for(&file).to_string(),
                file_name,
                content: content.into(),
            };

            let created = client.manager.upload(&new_document).await?;
            println!("Uploaded {} ({}), waiting for processing...", created.id, created.status);

            match client.manager.wait_until_settled(created.id).await {
                Some(doc) => {
                    print_document(&doc);
                    if doc.status != DocumentStatus::Ready {
                        anyhow::bail!(
                            "Document did not become ready: {}",
                            doc.status_message.as_deref().unwrap_or("no details")
                        );
                    }
                }
                None => anyhow::bail!("Document {} disappeared while processing", created.id),
            }
        }

        Command::Download { id, output } => {
            let file = client.documents.download(id).await?;
            let path = output
                .or_else(|| file.file_name.as_ref().map(PathBuf::from))
                .unwrap_or_else(|| PathBuf::from(id.to_string()));
            tokio::fs::write(&path, &file.content)
                .await
                .with_context(|| format!("Failed to write {}", path.display()))?;
            println!(
                "Saved {} ({} bytes, {})",
                path.display(),
                file.content.len(),
                file.mime_type.as_deref().unwrap_or("unknown type")
            );
        }

        Command::Watch { project } => {
            let mut events = client.manager.events();
            let documents = client
                .manager
                .load(&DocumentQuery::for_project(project))
                .await?;
            for doc in documents.iter() {
                print_document(doc);
            }

            while client.manager.poller().active_count() > 0 {
                let event = match events.recv().await {
                    Ok(event) => event,
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "Missed document events");
                        continue;
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                };
                print_event(client, &event);
            }
            // The last poll unregisters before its final event goes out
            while let Ok(event) = events.try_recv() {
                print_event(client, &event);
            }
            println!("Nothing left processing");
        }

        Command::Delete { id } => {
            client.manager.delete(id).await?;
            println!("Deleted {}", id);
        }

        Command::Whoami => {
            let user = client.session.current_user().await?;
            println!("{} <{}>", user.full_name.as_deref().unwrap_or("-"), user.email);
            println!("    id: {}", user.id);
            println!("    provider: {}", user.auth_provider);
            println!("    member since: {}", user.created_at.format("%Y-%m-%d"));
        }
    }

    Ok(())
}

fn print_document(doc: &DocumentSummary) {
    println!("{}  {:<10}  {}", doc.id, doc.status, doc.title);
    if let Some(message) = &doc.status_message {
        println!("    {}", message);
    }
}

fn print_event(client: &Client, event: &DocumentEvent) {
    match event {
        DocumentEvent::Updated { id, status } if *status != DocumentStatus::Processing => {
            if let Some(doc) = client.manager.get(*id) {
                print_document(&doc);
            }
        }
        DocumentEvent::TimedOut(id) => {
            if let Some(doc) = client.manager.get(*id) {
                print_document(&doc);
            }
        }
        DocumentEvent::PollFailed { id, message } => {
            println!("{}  status check failed: {}", id, message);
        }
        DocumentEvent::Removed(id) => println!("{}  removed", id),
        _ => {}
    }
}

fn mime_type_for(path: &Path) -> &'static str {
    let extension = path
        .extension()
        .map(|e| e.to_string_lossy().to_lowercase())
        .unwrap_or_default();
    match extension.as_str() {
        "pdf" => "application/pdf",
        "txt" => "text/plain",
        "md" => "text/markdown",
        "html" | "htm" => "text/html",
        "docx" => "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        _ => "application/octet-stream",
    }
}

/// Resolve on Ctrl+C or SIGTERM
async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::warn!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "Failed to install signal handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C signal, shutting down");
        },
        _ = terminate => {
            tracing::info!("Received terminate signal, shutting down");
        },
    }
}
