use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use dialoguer::{Input, Password};
use reqwest::Url;
use std::path::PathBuf;
use std::time::Duration;
use uuid::Uuid;

use crate::documents::DocumentStatus;
use crate::http_client::HttpSettings;
use crate::poller::PollConfig;

/// Docflow - document management client
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct CliArgs {
    /// Base URL of the document service API
    #[arg(
        short = 'u',
        long,
        env = "DOCFLOW_API_URL",
        default_value = "http://localhost:8000/api/v1"
    )]
    pub api_url: String,

    /// Account email
    #[arg(short, long, env = "DOCFLOW_EMAIL")]
    pub email: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Delay between document status checks in milliseconds
    #[arg(long, env = "DOCFLOW_POLL_INTERVAL_MS", default_value = "2000")]
    pub poll_interval_ms: u64,

    /// Give up waiting for document processing after this many seconds
    #[arg(long, env = "DOCFLOW_POLL_TIMEOUT", default_value = "300")]
    pub poll_timeout_secs: u64,

    /// HTTP request timeout in seconds
    #[arg(long, env = "HTTP_REQUEST_TIMEOUT", default_value = "120")]
    pub http_timeout: u64,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// List projects
    Projects {
        /// Include archived projects
        #[arg(long)]
        archived: bool,
    },

    /// List the documents of a project
    Documents {
        #[arg(short, long)]
        project: Uuid,

        /// Only show documents with this status (processing, ready, failed)
        #[arg(short, long, value_parser = parse_status)]
        status: Option<DocumentStatus>,
    },

    /// Upload a file and wait for processing to finish
    Upload {
        #[arg(short, long)]
        project: Uuid,

        #[arg(short, long)]
        title: String,

        #[arg(short, long)]
        description: Option<String>,

        file: PathBuf,
    },

    /// Download the originally uploaded file of a document
    Download {
        id: Uuid,

        /// Where to write the file; defaults to the name the service reports
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Follow processing of a project's documents until all have settled
    Watch {
        #[arg(short, long)]
        project: Uuid,
    },

    /// Delete a document
    Delete { id: Uuid },

    /// Show the signed-in user
    Whoami,
}

#[derive(Clone, Debug)]
pub struct Config {
    pub api_base_url: String,

    // Credentials
    pub email: Option<String>,
    pub password: Option<String>,

    pub log_level: String,

    // HTTP client
    pub http_max_connections: usize,
    pub http_connect_timeout: u64,
    pub http_request_timeout: u64,

    // Document polling
    pub poll_interval_ms: u64,
    pub poll_timeout_secs: u64,

    pub command: Command,
}

impl Config {
    /// Load configuration with priority: CLI > ENV > defaults
    pub fn load() -> Result<Self> {
        // Load .env file if it exists
        dotenvy::dotenv().ok();

        Ok(Self::from_args(CliArgs::parse()))
    }

    pub fn from_args(args: CliArgs) -> Self {
        Config {
            api_base_url: args.api_url,

            email: args.email,
            // Never taken from the command line so it stays out of shell history
            password: std::env::var("DOCFLOW_PASSWORD")
                .ok()
                .filter(|p| !p.is_empty()),

            log_level: args.log_level,

            http_max_connections: std::env::var("HTTP_MAX_CONNECTIONS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(20),

            http_connect_timeout: std::env::var("HTTP_CONNECT_TIMEOUT")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(30),

            http_request_timeout: args.http_timeout,

            poll_interval_ms: args.poll_interval_ms,
            poll_timeout_secs: args.poll_timeout_secs,

            command: args.command,
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        Url::parse(&self.api_base_url)
            .with_context(|| format!("Invalid DOCFLOW_API_URL: {}", self.api_base_url))?;

        if self.poll_interval_ms == 0 {
            anyhow::bail!("Poll interval must be greater than zero");
        }

        let poll = self.poll_config();
        if poll.timeout < poll.interval {
            anyhow::bail!(
                "Poll timeout ({}s) is shorter than the poll interval ({}ms)",
                self.poll_timeout_secs,
                self.poll_interval_ms
            );
        }

        Ok(())
    }

    pub fn poll_config(&self) -> PollConfig {
        PollConfig {
            interval: Duration::from_millis(self.poll_interval_ms),
            timeout: Duration::from_secs(self.poll_timeout_secs),
        }
    }

    pub fn http_settings(&self) -> HttpSettings {
        HttpSettings {
            max_connections: self.http_max_connections,
            connect_timeout: self.http_connect_timeout,
            request_timeout: self.http_request_timeout,
        }
    }

    /// Email and password, prompting for whatever is missing
    pub fn credentials(&self) -> Result<(String, String)> {
        let email = match &self.email {
            Some(email) => email.clone(),
            None => Input::new()
                .with_prompt("Email")
                .interact_text()
                .context("Failed to read email")?,
        };

        let password = match &self.password {
            Some(password) => password.clone(),
            None => Password::new()
                .with_prompt(format!("Password for {}", email))
                .interact()
                .context("Failed to read password")?,
        };

        if password.is_empty() {
            anyhow::bail!("Password cannot be empty");
        }

        Ok((email, password))
    }
}

fn parse_status(s: &str) -> std::result::Result<DocumentStatus, String> {
    match s.to_lowercase().as_str() {
        "processing" => Ok(DocumentStatus::Processing),
        "ready" => Ok(DocumentStatus::Ready),
        "failed" => Ok(DocumentStatus::Failed),
        other => Err(format!(
            "unknown status '{}' (expected processing, ready or failed)",
            other
        )),
    }
}
