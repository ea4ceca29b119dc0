// Command definitions and handlers.
//
// Handlers receive already-wired services from `main`; they own the
// terminal-facing behavior (rendering, exit-worthy errors) and nothing else.

use std::path::Path;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;

use crate::cli::render;
use crate::core::benchmark::BenchmarkRunner;
use crate::core::oauth::{AuthMonitor, AuthWait, OAUTH_SCOPES};
use crate::core::retrieval::{LogRetrievalService, LogSource, RetrievalError, ScriptRunner};
use crate::infra::google_auth::{Credentials, GoogleAuthClient};
use crate::infra::token_marker::TokenFileMarker;

#[derive(Parser)]
#[command(
    name = "gscript-ops",
    version,
    about = "Execute Apps Script functions and retrieve their Cloud Logging output"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// OAuth2 authorization helpers
    Auth {
        #[command(subcommand)]
        command: AuthCommand,
    },
    /// Execute a function and retrieve its logs
    Run {
        /// Remote function to execute
        #[arg(long, env = "SCRIPT_TEST_FUNCTION")]
        function: String,
    },
    /// Benchmark repeated execute-and-retrieve cycles
    Bench {
        /// Remote function to execute each cycle
        #[arg(long, env = "SCRIPT_TEST_FUNCTION")]
        function: String,
        /// Number of cycles to run
        #[arg(long, default_value_t = 5)]
        cycles: u32,
    },
    /// Validate credentials.json, writing a template if it is missing
    CheckCredentials,
}

#[derive(Subcommand)]
pub enum AuthCommand {
    /// Print the authorization URL to open in a browser
    Url,
    /// Exchange an authorization code for tokens and save them
    Exchange {
        /// The code copied from the consent page
        code: String,
    },
    /// Block until the token file appears (authorization completed)
    Wait,
}

pub fn auth_url(auth: &GoogleAuthClient) -> anyhow::Result<()> {
    let url = auth.auth_url(OAUTH_SCOPES)?;
    render::print_auth_instructions(&url);
    Ok(())
}

pub async fn auth_exchange(auth: &GoogleAuthClient, code: &str) -> anyhow::Result<()> {
    let token = auth
        .exchange_code(code)
        .await
        .context("authorization code exchange failed")?;
    println!("Tokens saved to {}", auth.token_path().display());
    if token.refresh_token.is_none() {
        println!("Warning: no refresh token issued; you may need to re-authorize later");
    }
    Ok(())
}

pub async fn auth_wait(token_path: &Path, cancel: &CancellationToken) -> anyhow::Result<()> {
    println!(
        "Waiting for authorization to complete (watching {})...",
        token_path.display()
    );

    let marker = TokenFileMarker::new(token_path);
    match AuthMonitor::new().wait_for_authorization(&marker, cancel).await {
        AuthWait::Completed(elapsed) => {
            println!(
                "Authorization completed after {:.0}s",
                elapsed.as_secs_f64()
            );
            Ok(())
        }
        AuthWait::TimedOut(_) => {
            anyhow::bail!("authorization was not completed in time; check manually and retry")
        }
        AuthWait::Cancelled => {
            println!("Wait cancelled");
            Ok(())
        }
    }
}

pub async fn run<R, L>(
    service: &LogRetrievalService<R, L>,
    function: &str,
    cancel: &CancellationToken,
) -> anyhow::Result<()>
where
    R: ScriptRunner,
    L: LogSource,
{
    match service.run_and_retrieve(function, cancel).await {
        Ok(report) => {
            render::print_run_report(&report);
            Ok(())
        }
        Err(RetrievalError::Cancelled) => {
            println!("Cancelled");
            Ok(())
        }
        Err(err) => Err(err.into()),
    }
}

pub async fn bench<R, L>(
    service: LogRetrievalService<R, L>,
    function: &str,
    cycles: u32,
    cancel: &CancellationToken,
) -> anyhow::Result<()>
where
    R: ScriptRunner,
    L: LogSource,
{
    println!("Running {cycles} execute-and-retrieve cycles against '{function}'");
    let summary = BenchmarkRunner::new(service)
        .run(function, cycles, cancel)
        .await;
    render::print_benchmark(&summary);
    Ok(())
}

pub async fn check_credentials(credentials_path: &Path) -> anyhow::Result<()> {
    if !tokio::fs::try_exists(credentials_path).await? {
        Credentials::write_template(credentials_path).await?;
        println!(
            "No credentials found; template written to {}",
            credentials_path.display()
        );
        println!("Create an OAuth client (Desktop application) in the Google Cloud Console,");
        println!("download its JSON, and replace the template with it.");
        return Ok(());
    }

    let credentials = Credentials::load(credentials_path).await?;
    let client = credentials.client();
    client.validate().context("credentials file is not usable")?;

    println!("Credentials file is valid");
    println!(
        "  project: {}",
        client.project_id.as_deref().unwrap_or("(not specified)")
    );
    let preview: String = client.client_id.chars().take(20).collect();
    println!("  client id: {preview}...");
    Ok(())
}
