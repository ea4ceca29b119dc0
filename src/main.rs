// This is the entry point of the Apps Script operations CLI.
//
// **Architecture Overview:**
// - `core/` = Business logic (the poller, retrieval/benchmark/auth-wait
//   workflows - no HTTP or filesystem types)
// - `infra/` = Implementations of core traits (Google APIs, credential and
//   token files)
// - `cli/` = Terminal adapters (clap commands, rendering)
//
// This file's job is to:
// 1. Load configuration from the environment
// 2. Initialize services (dependency injection)
// 3. Map Ctrl-C onto the cancellation token
// 4. Dispatch to the command handlers

// These attrs point each module declaration at a more descriptive root file
// so we don't end up with a handful of mod.rs files that all look the same.
#[path = "cli/cli_layer.rs"]
mod cli;
#[path = "core/core_layer.rs"]
mod core;
#[path = "infra/infra_layer.rs"]
mod infra;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio_util::sync::CancellationToken;

use crate::cli::commands::{self, AuthCommand, Command};
use crate::cli::Cli;
use crate::core::retrieval::LogRetrievalService;
use crate::infra::google_auth::{Credentials, GoogleAuthClient};
use crate::infra::logging_client::CloudLoggingClient;
use crate::infra::script_client::AppsScriptClient;

fn env_path(var: &str, default: &str) -> PathBuf {
    std::env::var(var).unwrap_or_else(|_| default.to_string()).into()
}

fn required_env(var: &str) -> anyhow::Result<String> {
    std::env::var(var).with_context(|| format!("missing {var} environment variable"))
}

async fn auth_client(
    credentials_path: &PathBuf,
    token_path: &PathBuf,
) -> anyhow::Result<Arc<GoogleAuthClient>> {
    let credentials = Credentials::load(credentials_path)
        .await
        .context("run `gscript-ops check-credentials` for setup instructions")?;
    let client = GoogleAuthClient::new(credentials.client().clone(), token_path.clone())?;
    Ok(Arc::new(client))
}

/// Build the execute-and-retrieve service backed by the real Google APIs.
async fn retrieval_service(
    credentials_path: &PathBuf,
    token_path: &PathBuf,
) -> anyhow::Result<LogRetrievalService<AppsScriptClient, CloudLoggingClient>> {
    let script_id = required_env("SCRIPT_PROJECT_ID")?;
    let gcp_project_id = required_env("GCP_PROJECT_ID")?;

    let auth = auth_client(credentials_path, token_path).await?;
    let runner = AppsScriptClient::new(Arc::clone(&auth), script_id);
    let logs = CloudLoggingClient::new(auth, gcp_project_id);
    Ok(LogRetrievalService::new(runner, logs))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging so we can see what's happening
    tracing_subscriber::fmt::init();

    // Load environment variables from .env file (if it exists)
    dotenv::dotenv().ok();

    let cli = Cli::parse();

    let credentials_path = env_path("CREDENTIALS_PATH", "credentials.json");
    let token_path = env_path("TOKEN_PATH", "token.json");

    // Ctrl-C cancels whatever poll session is in flight instead of killing
    // the process mid-request.
    let cancel = CancellationToken::new();
    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("interrupt received, cancelling");
            signal_cancel.cancel();
        }
    });

    match cli.command {
        Command::Auth { command } => match command {
            AuthCommand::Url => {
                let auth = auth_client(&credentials_path, &token_path).await?;
                commands::auth_url(&auth)
            }
            AuthCommand::Exchange { code } => {
                let auth = auth_client(&credentials_path, &token_path).await?;
                commands::auth_exchange(&auth, &code).await
            }
            AuthCommand::Wait => commands::auth_wait(&token_path, &cancel).await,
        },
        Command::Run { function } => {
            let service = retrieval_service(&credentials_path, &token_path).await?;
            commands::run(&service, &function, &cancel).await
        }
        Command::Bench { function, cycles } => {
            let service = retrieval_service(&credentials_path, &token_path).await?;
            commands::bench(service, &function, cycles, &cancel).await
        }
        Command::CheckCredentials => commands::check_credentials(&credentials_path).await,
    }
}
