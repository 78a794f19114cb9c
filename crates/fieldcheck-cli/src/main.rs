//! fieldcheck - command-line companion for the field-sales visit app.
//!
//! Signs in against the hosted backend, shows what the signed-in user can
//! see, and lets administrators broadcast cache invalidations.

use std::io::{self, Write};
use std::path::Path;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use fieldcheck_core::auth::{CredentialStore, LAST_SESSION_KEY};
use fieldcheck_core::cache::{InvalidationKind, LocalHub};
use fieldcheck_core::config::{password_from_env, Config};
use fieldcheck_core::storage::{self, FileStore, KeyValueStore};
use fieldcheck_core::utils::age_display;
use fieldcheck_core::version::VERSION_MARKER_KEY;
use fieldcheck_core::{ApiError, Backend, BackendClient, SyncContext, VersionWatcher};

const LOG_FILE: &str = "fieldcheck.log";

const USAGE: &str = "\
Usage: fieldcheck <command>

Commands:
  login [email]              Sign in and remember the session
  logout                     Sign out and forget the session
  whoami                     Show the signed-in user, role, and branch
  visits                     List visits as your role may see them
  opportunities              List opportunities as your role may see them
  tasks                      List tasks
  invalidate <full|tasks>    Tell every session to refetch (admin only)
  version                    Show the build and whether it changed

Environment:
  FIELDCHECK_URL, FIELDCHECK_ANON_KEY, FIELDCHECK_EMAIL, FIELDCHECK_PASSWORD
  RUST_LOG controls log verbosity (default: warn)";

/// Initialize the tracing subscriber: stderr plus a daily log file in the
/// cache directory.
fn init_tracing(log_dir: Option<&Path>) -> Option<WorkerGuard> {
    // Use RUST_LOG env var to control log level (e.g., RUST_LOG=debug)
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    let (file_layer, guard) = match log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, LOG_FILE);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (
                Some(fmt::layer().with_writer(writer).with_ansi(false)),
                Some(guard),
            )
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

    let mut config = Config::load()?;
    let cache_dir = config.cache_dir().ok();
    if let Some(ref dir) = cache_dir {
        if let Err(e) = std::fs::create_dir_all(dir) {
            eprintln!("Warning: cannot create {}: {}", dir.display(), e);
        }
    }
    let _guard = init_tracing(cache_dir.as_deref());
    info!(version = env!("CARGO_PKG_VERSION"), "fieldcheck starting");

    let args: Vec<String> = std::env::args().skip(1).collect();
    let command = args.first().map(String::as_str).unwrap_or("help");

    match command {
        "login" => login(&mut config, args.get(1).map(String::as_str)).await,
        "logout" => logout(&config).await,
        "whoami" => whoami(&config).await,
        "visits" => visits(&config).await,
        "opportunities" => opportunities(&config).await,
        "tasks" => tasks(&config).await,
        "invalidate" => {
            let kind: InvalidationKind = args
                .get(1)
                .context("Missing invalidation type (full or tasks)")?
                .parse()
                .map_err(anyhow::Error::msg)?;
            invalidate(&config, kind).await
        }
        "version" => version(&config),
        "help" | "--help" | "-h" => {
            println!("{}", USAGE);
            Ok(())
        }
        other => {
            eprintln!("{}", USAGE);
            bail!("Unknown command: {}", other)
        }
    }
}

fn open_store(config: &Config) -> Result<Arc<dyn KeyValueStore>> {
    Ok(Arc::new(FileStore::new(config.cache_dir()?)?))
}

fn prompt(label: &str) -> Result<String> {
    print!("{}", label);
    io::stdout().flush()?;
    let mut line = String::new();
    io::stdin().read_line(&mut line)?;
    Ok(line.trim().to_string())
}

/// Restore the remembered session from the keychain.
async fn restore(config: &Config) -> Result<BackendClient> {
    let client = BackendClient::from_config(config)?;
    let email = config
        .last_email
        .as_deref()
        .context("Not signed in (run `fieldcheck login`)")?;
    let token = CredentialStore::refresh_token(email)
        .context("Not signed in (run `fieldcheck login`)")?;

    let session = match client.restore_session(&token).await {
        Ok(session) => session,
        Err(e) if e.is_auth_error() => {
            let _ = CredentialStore::delete(email);
            bail!("Session expired, run `fieldcheck login` again");
        }
        Err(e) => return Err(e.into()),
    };
    // Refresh tokens are single use.
    if let Err(e) = CredentialStore::store_refresh_token(email, &session.refresh_token) {
        warn!(error = %e, "Failed to store refresh token");
    }
    Ok(client)
}

async fn open_context(config: &Config) -> Result<SyncContext> {
    let client = restore(config).await?;
    let ctx = SyncContext::start(Backend::hosted(client, LocalHub::new_shared(), open_store(config)?));
    if let Some(notice) = ctx.check_version().notification() {
        eprintln!("{}", notice);
    }
    Ok(ctx)
}

async fn login(config: &mut Config, email_arg: Option<&str>) -> Result<()> {
    let client = BackendClient::from_config(config)?;

    let email = match email_arg.map(str::to_string).or_else(|| config.last_email.clone()) {
        Some(email) => email,
        None => prompt("Email: ")?,
    };
    if email.is_empty() {
        bail!("Email required");
    }
    let password = match password_from_env() {
        Some(password) => password,
        None => rpassword::prompt_password("Password: ")?,
    };

    let session = match client.sign_in_with_password(&email, &password).await {
        Ok(session) => session,
        Err(ApiError::InvalidCredentials) => bail!("Invalid email or password"),
        Err(e) => return Err(e.into()),
    };
    if let Err(e) = CredentialStore::store_refresh_token(&email, &session.refresh_token) {
        warn!(error = %e, "Failed to store refresh token");
        eprintln!("Warning: session could not be saved to the keychain");
    }

    let ctx = SyncContext::start(Backend::hosted(client, LocalHub::new_shared(), open_store(config)?));
    let profile = ctx.policy().resolve_profile(Some(&session.user)).await;
    let role = ctx.policy().resolve_role(Some(&session.user)).await;

    config.last_email = Some(email.clone());
    config.filial = profile.as_ref().and_then(|p| p.filial.clone());
    config.save()?;

    let name = profile
        .as_ref()
        .map(|p| p.display_name().to_string())
        .unwrap_or(email);
    println!("Signed in as {} ({})", name, role.role);
    ctx.shutdown();
    Ok(())
}

async fn logout(config: &Config) -> Result<()> {
    let Some(email) = config.last_email.as_deref() else {
        println!("Not signed in");
        return Ok(());
    };
    match restore(config).await {
        Ok(client) => client.sign_out().await,
        Err(e) => warn!(error = %e, "No session to end remotely"),
    }
    if CredentialStore::has_credentials(email) {
        CredentialStore::delete(email)?;
    }
    println!("Signed out {}", email);
    Ok(())
}

async fn whoami(config: &Config) -> Result<()> {
    let store = open_store(config)?;
    let last_seen = storage::load_json(store.as_ref(), LAST_SESSION_KEY)
        .ok()
        .flatten()
        .map(age_display);

    let ctx = open_context(config).await?;
    let user = ctx.current_user().await.context("No active session")?;
    let role = ctx.role_info().await;
    let requester = ctx.requester().await;

    println!("User:     {}", user.email.as_deref().unwrap_or(&user.id));
    println!("Role:     {}", role.role);
    if role.roles.len() > 1 {
        let all: Vec<&str> = role.roles.iter().map(|r| r.as_str()).collect();
        println!("Roles:    {}", all.join(", "));
    }
    println!(
        "Branch:   {}",
        requester
            .and_then(|r| r.filial)
            .or_else(|| config.filial.clone())
            .unwrap_or_else(|| "-".to_string())
    );
    println!("Admin:    {}", if role.is_admin { "yes" } else { "no" });
    if let Some(seen) = last_seen {
        println!("Previous session: {}", seen);
    }
    if let Some(session) = ctx.sessions().get_session().await {
        if session.is_expired() {
            println!("Token expired");
        } else {
            println!("Token expires in {} min", session.minutes_until_expiry());
        }
    }
    ctx.shutdown();
    Ok(())
}

fn show(value: Option<&str>) -> &str {
    value.unwrap_or("-")
}

async fn visits(config: &Config) -> Result<()> {
    let ctx = open_context(config).await?;
    let visits = ctx.visits().await?;
    if visits.is_empty() {
        println!("No visits");
    }
    for view in &visits {
        let visit = &view.record;
        let (done, total) = visit.checklist_progress();
        let checklist = if total > 0 && visit.is_checklist_complete() {
            "done".to_string()
        } else {
            format!("{}/{}", done, total)
        };
        println!(
            "{:<12} {:<28} {:<28} {:<16} {:<5} [{}]{}",
            visit.status,
            visit.customer_name,
            show(visit.customer_email.as_deref()),
            show(visit.customer_phone.as_deref()),
            checklist,
            view.tier,
            view.indicator().map(|i| format!(" {}", i)).unwrap_or_default(),
        );
    }
    ctx.shutdown();
    Ok(())
}

async fn opportunities(config: &Config) -> Result<()> {
    let ctx = open_context(config).await?;
    let opportunities = ctx.opportunities().await?;
    if opportunities.is_empty() {
        println!("No opportunities");
    }
    for view in &opportunities {
        let opp = &view.record;
        println!(
            "{:<12} {:<28} {:<28} {:>12} [{}]{}",
            opp.stage_display(),
            opp.prospect_name,
            show(opp.contact_email.as_deref()),
            opp.estimated_value
                .map(|v| format!("{:.2}", v))
                .unwrap_or_else(|| "-".to_string()),
            view.tier,
            view.indicator().map(|i| format!(" {}", i)).unwrap_or_default(),
        );
    }
    ctx.shutdown();
    Ok(())
}

async fn tasks(config: &Config) -> Result<()> {
    let ctx = open_context(config).await?;
    let today = chrono::Local::now().date_naive();
    let tasks = ctx.tasks().await?;
    if tasks.is_empty() {
        println!("No tasks");
    }
    for task in &tasks {
        let mark = if task.completed {
            "x"
        } else if task.is_overdue(today) {
            "!"
        } else {
            " "
        };
        println!(
            "[{}] {:<40} {}",
            mark,
            task.title,
            task.due_date
                .map(|d| d.to_string())
                .unwrap_or_else(|| "-".to_string())
        );
    }
    ctx.shutdown();
    Ok(())
}

async fn invalidate(config: &Config, kind: InvalidationKind) -> Result<()> {
    let ctx = open_context(config).await?;
    match ctx.publish_invalidation(kind).await {
        Ok(()) => println!("Broadcast {} invalidation", kind),
        Err(ApiError::AccessDenied(reason)) => bail!("Not allowed: {}", reason),
        Err(e) => return Err(e.into()),
    }
    ctx.shutdown();
    Ok(())
}

fn version(config: &Config) -> Result<()> {
    let store = Arc::new(FileStore::new(config.cache_dir()?)?);
    let last_run = store.stored_at(VERSION_MARKER_KEY).ok().flatten();
    let watcher = VersionWatcher::new(store);
    let check = watcher.check_version();
    println!("fieldcheck {}", check.version_info.display());
    if let Some(ref build_time) = check.version_info.build_time {
        println!("Built {}", build_time);
    }
    match check.notification() {
        Some(notice) => println!("{}", notice),
        None => {
            if let Some(previous) = check.previous {
                let seen = last_run.map(age_display).unwrap_or_else(|| "-".to_string());
                println!("Unchanged since last run ({}, {})", previous.display(), seen);
            }
        }
    }
    Ok(())
}
