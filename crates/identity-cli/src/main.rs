//! identity - command-line host for the identity session manager.
//!
//! Logs in against an identity service, keeps the refresh token in the OS
//! keychain (or a token file), and can stay resident to keep the session
//! renewed.

use std::io::{self, Write};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use identity_core::{
    AuthError, FileStore, IdentityConfig, KeyringStore, Renewal, SessionManager, SessionSnapshot, TokenStore,
};
use serde_json::json;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, info};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

// ============================================================================
// Constants
// ============================================================================

/// Log file name prefix in the cache directory (rotated daily)
const LOG_FILE: &str = "identity.log";

const USAGE: &str = "\
Usage: identity <command>

Commands:
  authenticate      Ask the service for tokens using its existing session
  login [username]  Log in with a username and password
  status            Print the current session as JSON
  refresh           Exchange the stored refresh token for new tokens
  logout            Forget all tokens on this machine
  watch             Stay resident and keep the session renewed
                    (press Enter to re-check, Ctrl-C to quit)
  fetch <path>      GET an API path with the current access token

Environment:
  IDENTITY_BASE_URL   Override base_url from the config file
  IDENTITY_SCOPE      scope sent with authenticate
  IDENTITY_STORE      'keyring' (default) or 'file'
  IDENTITY_USERNAME   Username for login
  IDENTITY_PASSWORD   Password for login
  RUST_LOG            Log filter (default: warn)";

/// Initialize the tracing subscriber for logging.
///
/// Logs go to stderr. With `log_dir`, they are also written to a daily
/// rotating file there; keep the returned guard alive to flush it.
fn init_tracing(log_dir: Option<std::path::PathBuf>) -> Option<WorkerGuard> {
    // Use RUST_LOG env var to control log level (e.g., RUST_LOG=identity_core=debug)
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    let (file_layer, guard) = match log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, LOG_FILE);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (Some(fmt::layer().with_ansi(false).with_writer(writer)), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(io::stderr))
        .with(file_layer)
        .with(filter)
        .init();

    guard
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (silently ignore if not found)
    let _ = dotenvy::dotenv();

    let args: Vec<String> = std::env::args().collect();
    let command = match args.get(1).map(String::as_str) {
        None | Some("-h") | Some("--help") | Some("help") => {
            println!("{}", USAGE);
            return Ok(());
        }
        Some(command) => command,
    };

    let config = load_config()?;

    // Only the resident command keeps a log file.
    let log_dir = if command == "watch" { Some(config.cache_dir()?) } else { None };
    let _guard = init_tracing(log_dir);
    debug!(base_url = %config.base_url, command, "identity starting");

    let store = open_store(&config)?;
    let manager = SessionManager::new(config, store).context("Failed to create session manager")?;

    match command {
        "authenticate" => authenticate(&manager).await,
        "login" => login(&manager, args.get(2).cloned()).await,
        "status" => print_snapshot(&manager.snapshot()),
        "refresh" => refresh(&manager).await,
        "logout" => {
            manager.logout();
            println!("Logged out.");
            Ok(())
        }
        "watch" => watch(&manager).await,
        "fetch" => match args.get(2) {
            Some(path) => fetch(&manager, path).await,
            None => bail!("fetch needs an API path\n\n{}", USAGE),
        },
        other => bail!("Unknown command '{}'\n\n{}", other, USAGE),
    }
}

// ============================================================================
// Setup
// ============================================================================

fn load_config() -> Result<IdentityConfig> {
    let mut config = IdentityConfig::load()?;
    if let Ok(base_url) = std::env::var("IDENTITY_BASE_URL") {
        config.base_url = base_url;
    }
    if let Ok(scope) = std::env::var("IDENTITY_SCOPE") {
        config.scope_param = Some(scope);
    }
    Ok(config)
}

fn open_store(config: &IdentityConfig) -> Result<Arc<dyn TokenStore>> {
    let kind = std::env::var("IDENTITY_STORE").unwrap_or_else(|_| "keyring".to_string());
    match kind.as_str() {
        "keyring" => Ok(Arc::new(KeyringStore::new(config.storage_namespace.clone()))),
        "file" => {
            let store = FileStore::in_dir(config.cache_dir()?);
            debug!(path = %store.path().display(), "Using file token store");
            Ok(Arc::new(store))
        }
        other => bail!("Unknown IDENTITY_STORE '{}', expected 'keyring' or 'file'", other),
    }
}

// ============================================================================
// Commands
// ============================================================================

async fn authenticate(manager: &SessionManager) -> Result<()> {
    manager.authenticate().await.map_err(report)?;
    if manager.access_token().is_none() {
        // Anchored by a stored refresh token; fetch an access token to go with it.
        manager.refresh().await.map_err(report)?;
    }
    print_snapshot(&manager.snapshot())
}

async fn login(manager: &SessionManager, username: Option<String>) -> Result<()> {
    let username = match username.or_else(|| std::env::var("IDENTITY_USERNAME").ok()) {
        Some(username) => username,
        None => prompt_username()?,
    };
    let password = match std::env::var("IDENTITY_PASSWORD") {
        Ok(password) => password,
        Err(_) => prompt_password()?,
    };

    if username.is_empty() || password.is_empty() {
        bail!("Username and password required");
    }

    manager
        .login(&json!({ "username": username, "password": password }))
        .await
        .map_err(report)?;

    println!("Login successful!");
    print_snapshot(&manager.snapshot())
}

async fn refresh(manager: &SessionManager) -> Result<()> {
    manager.refresh().await.map_err(report)?;
    print_snapshot(&manager.snapshot())
}

/// Keep the session alive until stdin closes or Ctrl-C. Each line read from
/// stdin counts as the application regaining focus.
async fn watch(manager: &SessionManager) -> Result<()> {
    if !manager.is_valid() {
        if manager.refresh_token().is_some() {
            manager.refresh().await.map_err(report)?;
        } else {
            manager.authenticate().await.map_err(report)?;
        }
    }

    info!("Watching session");
    let mut snapshots = manager.subscribe();
    print_snapshot(&snapshots.borrow_and_update().clone())?;

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            changed = snapshots.changed() => {
                if changed.is_err() {
                    break;
                }
                let snapshot = snapshots.borrow_and_update().clone();
                print_snapshot(&snapshot)?;
            }
            line = lines.next_line() => {
                match line? {
                    Some(_) => match manager.on_focus().await {
                        Renewal::Inactive => println!("No live session."),
                        Renewal::NotDue => println!("Renewal not due yet ({} min left).", manager.minutes_until_expiry()),
                        Renewal::Renewed => println!("Session renewed."),
                        Renewal::Failed(e) => eprintln!("Renewal failed: {}", e),
                    },
                    None => break,
                }
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    info!("Stopped watching session");
    Ok(())
}

async fn fetch(manager: &SessionManager, path: &str) -> Result<()> {
    if !manager.is_valid() && manager.refresh_token().is_some() {
        manager.refresh().await.map_err(report)?;
    }

    let client = manager.client();
    let url = manager.config().resolve(path);
    let response = client
        .send(client.get(&url))
        .await
        .with_context(|| format!("Request to {} failed", url))?;

    let status = response.status();
    let location = identity_core::gateway::redirect_location(response.headers()).map(str::to_string);
    let body = response.text().await.unwrap_or_default();

    if let Some(location) = location {
        println!("Authentication required: continue at {}", location);
    }
    if !status.is_success() {
        bail!("{} returned {}: {}", url, status, body);
    }
    println!("{}", body);
    Ok(())
}

// ============================================================================
// Output
// ============================================================================

fn print_snapshot(snapshot: &SessionSnapshot) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(snapshot)?);
    Ok(())
}

/// Turn a flow failure into a user-facing error, surfacing where the service
/// wants the user to go.
fn report(err: AuthError) -> anyhow::Error {
    match err.redirect_location() {
        Some(location) => anyhow::anyhow!("Authentication required: continue at {}", location),
        None => anyhow::Error::new(err),
    }
}

fn prompt_username() -> Result<String> {
    print!("Username: ");
    io::stdout().flush()?;

    let mut username = String::new();
    io::stdin().read_line(&mut username)?;
    Ok(username.trim().to_string())
}

fn prompt_password() -> Result<String> {
    let password = rpassword::prompt_password("Password: ")?;
    Ok(password)
}
