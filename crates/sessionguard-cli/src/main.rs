//! sessionguard - sign in, inspect the stored session and make authorized
//! calls from the command line.

use std::io::{self, Write};
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use serde_json::json;
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use sessionguard_core::{LoginRequest, SessionConfig, SessionError, SessionManager};

/// Application name used for the log directory
const APP_NAME: &str = "sessionguard";

/// Prefix of the daily rolling log file
const LOG_FILE_PREFIX: &str = "sessionguard.log";

const USAGE: &str = "\
Usage: sessionguard <command> [args]

Commands:
  login [username]        Sign in and store the session
  status                  Show the stored session as JSON
  can [--any] <name>...   Exit 0 if the session holds the capabilities
  get <url>               Authorized GET, printing the response body
  logout                  End the session and revoke the credential";

/// Initialize the tracing subscriber for logging
///
/// Stderr honours `RUST_LOG` (default `warn`); the rolling file log records
/// `info` and above from this workspace.
fn init_tracing() -> Option<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let stderr = fmt::layer().with_writer(io::stderr).with_filter(filter);

    let Some(log_dir) = log_dir() else {
        tracing_subscriber::registry().with(stderr).init();
        return None;
    };
    let appender = tracing_appender::rolling::daily(log_dir, LOG_FILE_PREFIX);
    let (writer, guard) = tracing_appender::non_blocking(appender);
    let file = fmt::layer()
        .with_writer(writer)
        .with_ansi(false)
        .with_filter(EnvFilter::new("sessionguard_core=info,sessionguard=info"));

    tracing_subscriber::registry().with(stderr).with(file).init();
    Some(guard)
}

fn log_dir() -> Option<PathBuf> {
    let dir = dirs::cache_dir()?.join(APP_NAME).join("logs");
    std::fs::create_dir_all(&dir).ok()?;
    Some(dir)
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (silently ignore if not found)
    let _ = dotenvy::dotenv();

    // Held for the lifetime of main so buffered log lines are flushed on exit
    let _log_guard = init_tracing();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let Some((command, rest)) = args.split_first() else {
        eprintln!("{}", USAGE);
        std::process::exit(2);
    };

    let mut config = SessionConfig::load()?.apply_env()?;
    let manager = SessionManager::from_config(&config)?;
    info!(command = %command, "sessionguard starting");

    match command.as_str() {
        "login" => login(&manager, &mut config, rest.first().cloned()).await,
        "status" => status(&manager),
        "can" => can(&manager, rest),
        "get" => {
            let url = rest.first().context("get requires a URL")?;
            get(&manager, url).await
        }
        "logout" => {
            manager.logout_and_revoke().await;
            println!("Signed out");
            Ok(())
        }
        "help" | "--help" | "-h" => {
            println!("{}", USAGE);
            Ok(())
        }
        other => {
            eprintln!("Unknown command: {}\n\n{}", other, USAGE);
            std::process::exit(2);
        }
    }
}

async fn login(
    manager: &SessionManager,
    config: &mut SessionConfig,
    username: Option<String>,
) -> Result<()> {
    let username = match username.or_else(|| config.last_username.clone()) {
        Some(name) => name,
        None => prompt_username()?,
    };
    if username.is_empty() {
        bail!("Username required");
    }
    let password = rpassword::prompt_password(format!("Password for {}: ", username))?;

    match manager.login(LoginRequest::new(username.clone(), password)).await {
        Ok(credential) => {
            println!("Signed in as {}", credential.subject().unwrap_or(&username));
            config.last_username = Some(username);
            if let Err(e) = config.save() {
                tracing::warn!(error = %e, "Failed to save config");
            }
            Ok(())
        }
        Err(SessionError::InvalidCredentials) => bail!("Invalid username or password"),
        Err(e) => Err(e).context("Sign-in failed"),
    }
}

fn prompt_username() -> Result<String> {
    print!("Username: ");
    io::stdout().flush()?;

    let mut username = String::new();
    io::stdin().read_line(&mut username)?;
    Ok(username.trim().to_string())
}

fn status(manager: &SessionManager) -> Result<()> {
    let credential = manager.current_credential();
    let state = manager.state();
    let report = json!({
        "state": state,
        "usable": state.is_usable(),
        "subject": credential.as_ref().and_then(|c| c.subject()),
        "expires_at": credential.as_ref().and_then(|c| c.claims().expires_at),
        "seconds_remaining": manager.time_until_expiry().map(|d| d.num_seconds()),
        "capabilities": manager.capabilities().granted(),
    });
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

fn can(manager: &SessionManager, args: &[String]) -> Result<()> {
    let allowed = capability_query(manager, args);
    println!("{}", if allowed { "yes" } else { "no" });
    if !allowed {
        std::process::exit(1);
    }
    Ok(())
}

/// `can` arguments against the session. An empty query allows, matching
/// `has_all` / `has_any`.
fn capability_query(manager: &SessionManager, args: &[String]) -> bool {
    let any = args.iter().any(|a| a == "--any");
    let names: Vec<&str> = args
        .iter()
        .map(String::as_str)
        .filter(|a| *a != "--any")
        .collect();
    if any {
        manager.has_any(&names)
    } else {
        manager.has_all(&names)
    }
}

async fn get(manager: &SessionManager, url: &str) -> Result<()> {
    match manager.execute(sessionguard_core::ApiRequest::get(url)).await {
        Ok(response) => {
            println!("{}", response.body);
            Ok(())
        }
        Err(e) if e.requires_login() => bail!("{} (run `sessionguard login`)", e),
        Err(e) => Err(e.into()),
    }
}
