//! authkeep - command-line front end for the session manager.
//!
//! Every command restores the previous session first (renewing it if the
//! access credential has expired), then performs its action.

use std::io::{self, Write};
use std::path::PathBuf;

use anyhow::{Context, Result};
use authkeep_core::{ApiError, Claims, Config, SessionManager, SessionSnapshot};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Environment variable consulted before prompting for a password
const PASSWORD_ENV: &str = "AUTHKEEP_PASSWORD";

/// Shortest password accepted when creating an account
const MIN_PASSWORD_LEN: usize = 8;

/// Log file name prefix when logging to a directory
const LOG_FILE_PREFIX: &str = "authkeep.log";

#[derive(Parser)]
#[command(name = "authkeep", version, about = "Manage a persisted login session for a REST backend")]
struct Cli {
    /// Write logs to daily files in this directory instead of stderr
    #[arg(long, global = true)]
    log_dir: Option<PathBuf>,

    /// Override the backend base URL
    #[arg(long, global = true, env = "AUTHKEEP_BASE_URL")]
    base_url: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Show whether a session is active and who it belongs to
    Status,
    /// Log in and store the issued credentials
    Login {
        #[arg(short, long)]
        username: Option<String>,
    },
    /// Forget the stored credentials
    Logout,
    /// Create an account (does not log in)
    Register {
        #[arg(short, long)]
        username: Option<String>,
    },
    /// Renew the access credential now
    Refresh,
    /// Fetch the signed-in account's profile
    Profile,
    /// Print the effective configuration
    Config,
}

/// Initialize the tracing subscriber for logging
fn init_tracing(log_dir: Option<&PathBuf>) -> Option<WorkerGuard> {
    // Use RUST_LOG env var to control log level (e.g., RUST_LOG=debug)
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    match log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::registry()
                .with(fmt::layer().with_ansi(false).with_writer(writer))
                .with(filter)
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::registry()
                .with(fmt::layer().with_writer(io::stderr))
                .with(filter)
                .init();
            None
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (silently ignore if not found)
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();
    let _log_guard = init_tracing(cli.log_dir.as_ref());

    let mut config = Config::load()?.with_env_overrides();
    if let Some(ref url) = cli.base_url {
        config.base_url = url.clone();
    }

    let manager = SessionManager::new(&config)?;
    let snapshot = manager.bootstrap().await;
    info!(authenticated = snapshot.is_authenticated(), "authkeep starting");

    match cli.command {
        Command::Status => print_status(&snapshot),
        Command::Login { username } => {
            let username = match username.or_else(|| config.last_username.clone()) {
                Some(u) => u,
                None => prompt("Username: ")?,
            };
            let password = read_password()?;
            let claims = manager
                .login(&username, &password)
                .await
                .map_err(explain)?;
            println!("Logged in as {}", claims.display_name());
            print_expiry(&claims);

            config.last_username = Some(username);
            config.save().context("Failed to save config")?;
        }
        Command::Logout => {
            manager.logout();
            println!("Logged out");
        }
        Command::Register { username } => {
            let username = match username {
                Some(u) => u,
                None => prompt("Username: ")?,
            };
            let password = read_new_password()?;
            manager
                .register(&username, &password)
                .await
                .map_err(explain)?;
            println!("Account {} created. Run `authkeep login` to sign in.", username);
        }
        Command::Refresh => {
            let claims = manager.refresh().await.map_err(explain)?;
            println!("Session renewed for {}", claims.display_name());
            print_expiry(&claims);
        }
        Command::Profile => {
            let profile = manager.api().fetch_profile().await.map_err(explain)?;
            println!("{}", serde_json::to_string_pretty(&profile)?);
        }
        Command::Config => {
            println!("{}", serde_json::to_string_pretty(&config)?);
            println!("config file: {}", Config::config_path()?.display());
        }
    }

    Ok(())
}

fn print_status(snapshot: &SessionSnapshot) {
    match (&snapshot.credentials, &snapshot.claims) {
        (Some(_), Some(claims)) => {
            println!("Logged in as {}", claims.display_name());
            if let Some(ref email) = claims.email {
                println!("  email: {}", email);
            }
            if let Some(ref role) = claims.role {
                println!("  role:  {}", role);
            }
            print_expiry(claims);
        }
        (Some(_), None) => println!("Logged in (access credential carries no readable claims)"),
        (None, _) => println!("Not logged in"),
    }
}

fn print_expiry(claims: &Claims) {
    if let Some(expiry) = claims.expires_at() {
        println!(
            "  access expires {} ({} min)",
            expiry.format("%Y-%m-%d %H:%M:%S UTC"),
            claims.minutes_until_expiry()
        );
    }
}

/// Turn session failures into the "log in again" message the user should see.
fn explain(error: ApiError) -> anyhow::Error {
    if error.requires_login() {
        anyhow::anyhow!("{}. Run `authkeep login`.", error)
    } else {
        error.into()
    }
}

fn prompt(label: &str) -> Result<String> {
    print!("{}", label);
    io::stdout().flush()?;
    let mut line = String::new();
    io::stdin().read_line(&mut line)?;
    let value = line.trim().to_string();
    if value.is_empty() {
        anyhow::bail!("{} cannot be empty", label.trim_end_matches(": "));
    }
    Ok(value)
}

fn read_password() -> Result<String> {
    if let Ok(password) = std::env::var(PASSWORD_ENV) {
        return Ok(password);
    }
    rpassword::prompt_password("Password: ").context("Failed to read password")
}

/// Read a password for a new account, asking twice when prompting.
fn read_new_password() -> Result<String> {
    if let Ok(password) = std::env::var(PASSWORD_ENV) {
        check_new_password(&password, &password)?;
        return Ok(password);
    }
    let password = rpassword::prompt_password("Password: ").context("Failed to read password")?;
    let confirmation =
        rpassword::prompt_password("Confirm password: ").context("Failed to read password")?;
    check_new_password(&password, &confirmation)?;
    Ok(password)
}

fn check_new_password(password: &str, confirmation: &str) -> Result<()> {
    if password != confirmation {
        anyhow::bail!("Passwords do not match");
    }
    if password.chars().count() < MIN_PASSWORD_LEN {
        anyhow::bail!("Password must be at least {} characters long", MIN_PASSWORD_LEN);
    }
    Ok(())
}
