//! CLI entry point for MedPASS.
//!
//! The `medpass` command signs in, keeps the cached session fresh and
//! answers route-guard questions. Configuration comes from `MEDPASS_*`
//! environment variables, optionally loaded from a `.env` file.

mod cli;

use std::io;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result, anyhow, bail};
use clap::Parser;
use medpass_auth::{
    AuthConfig, AuthError, AuthRequest, CallbackListener, GuardDecision, RouteGuard, Session,
    SessionPersistence, VaultPersistence,
};
use medpass_vault::{KeyFile, Vault};
use tracing::debug;
use tracing_subscriber::EnvFilter;

use crate::cli::{Cli, Commands};

const SESSION_DB: &str = "session.db";

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    init_tracing("info");

    let cli = Cli::parse();
    let config = AuthConfig::from_env().context("invalid MEDPASS_* configuration")?;

    match cli.command {
        Commands::Login { username, password } => {
            cmd_login(config, &cli.data_dir, username, password).await
        }
        Commands::Google { return_to, timeout } => {
            cmd_google(config, &cli.data_dir, return_to, timeout).await
        }
        Commands::Refresh => cmd_refresh(config, &cli.data_dir).await,
        Commands::Status { json } => cmd_status(&cli.data_dir, json),
        Commands::Token => cmd_token(config, &cli.data_dir).await,
        Commands::Logout => cmd_logout(config, &cli.data_dir),
        Commands::Guard { path } => cmd_guard(config, &cli.data_dir, &path).await,
        Commands::VerifyNetid => cmd_verify_netid(config, &cli.data_dir).await,
    }
}

// ---------------------------------------------------------------------------
// Subcommands
// ---------------------------------------------------------------------------

async fn cmd_login(
    config: AuthConfig,
    data_dir: &Path,
    username: String,
    password: Option<String>,
) -> Result<()> {
    let password = match password {
        Some(password) => password,
        None => rpassword::prompt_password("Password: ").context("failed to read password")?,
    };

    let session = open_session(config, data_dir)?;
    let destination = session
        .login(AuthRequest::CredentialLogin {
            subject_id: username,
            secret: password,
        })
        .await
        .map_err(user_facing)?;

    print_signed_in(&session, &destination);
    Ok(())
}

async fn cmd_google(
    config: AuthConfig,
    data_dir: &Path,
    return_to: Option<String>,
    timeout: u64,
) -> Result<()> {
    let redirect_uri = config.provider.redirect_uri.clone();
    let session = open_session(config, data_dir)?;

    let ticket = session
        .begin_provider_login(return_to.as_deref())
        .map_err(user_facing)?;
    let listener = CallbackListener::for_redirect_uri(&redirect_uri)
        .await
        .with_context(|| format!("failed to listen on {redirect_uri}"))?;

    println!("Open this URL in your browser to sign in with Google:");
    println!();
    println!("  {}", ticket.url);
    println!();

    let params = listener.wait(timeout).await.map_err(user_facing)?;
    let destination = session
        .login(params.into_request())
        .await
        .map_err(user_facing)?;

    print_signed_in(&session, &destination);
    Ok(())
}

async fn cmd_refresh(config: AuthConfig, data_dir: &Path) -> Result<()> {
    let session = open_session(config, data_dir)?;
    // Restoring already trades the cached refresh token for a new access
    // token.
    if !session.restore().await.map_err(user_facing)? {
        bail!("Not signed in.");
    }
    let expires_at = session
        .credentials()
        .get()
        .and_then(|c| c.expires_at)
        .map(|exp| exp.to_string())
        .unwrap_or_else(|| "unknown".to_string());
    println!("Session refreshed (expires at {expires_at}).");
    Ok(())
}

fn cmd_status(data_dir: &Path, json: bool) -> Result<()> {
    let persistence = open_persistence(data_dir)?;
    let cached = persistence.load().map_err(user_facing)?;
    let verified = persistence
        .flag(medpass_auth::persistence::NET_ID_VERIFIED_FLAG)
        .map_err(user_facing)?;

    if json {
        let value = match &cached {
            Some(session) => serde_json::json!({
                "signed_in": true,
                "subject_id": session.identity.subject_id,
                "display_name": session.identity.display_name,
                "is_privileged": session.identity.is_privileged,
                "net_id_verified": verified,
            }),
            None => serde_json::json!({ "signed_in": false }),
        };
        println!("{}", serde_json::to_string_pretty(&value)?);
        return Ok(());
    }

    match cached {
        Some(session) => {
            let identity = &session.identity;
            println!("Signed in as {} ({})", identity.display_name, identity.subject_id);
            if identity.is_privileged {
                println!("  administrator");
            }
            println!("  NetID verified: {}", if verified { "yes" } else { "no" });
        }
        None => println!("Not signed in."),
    }
    Ok(())
}

async fn cmd_token(config: AuthConfig, data_dir: &Path) -> Result<()> {
    let session = open_session(config, data_dir)?;
    if !session.restore().await.map_err(user_facing)? {
        bail!("Not signed in.");
    }
    let token = session.access_token().await.map_err(user_facing)?;
    println!("{token}");
    Ok(())
}

fn cmd_logout(config: AuthConfig, data_dir: &Path) -> Result<()> {
    let session = open_session(config, data_dir)?;
    session.logout();
    println!("Signed out.");
    Ok(())
}

async fn cmd_guard(config: AuthConfig, data_dir: &Path, path: &str) -> Result<()> {
    let guard = RouteGuard::new(config.guard.clone());
    let session = open_session(config, data_dir)?;
    if let Err(e) = session.restore().await {
        tracing::warn!(error = %e, "could not restore session, treating as signed out");
    }

    let decision = session.check_route(&guard, path);
    match (&decision, guard.location(&decision)) {
        (GuardDecision::Admit, _) => println!("admit {path}"),
        (_, Some(location)) => println!("redirect {location}"),
        (_, None) => println!("admit {path}"),
    }
    Ok(())
}

async fn cmd_verify_netid(config: AuthConfig, data_dir: &Path) -> Result<()> {
    let session = open_session(config, data_dir)?;
    if !session.restore().await.map_err(user_facing)? {
        bail!("Not signed in.");
    }
    session.mark_net_id_verified().map_err(user_facing)?;
    println!("NetID verified.");
    Ok(())
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn open_persistence(data_dir: &Path) -> Result<Arc<VaultPersistence>> {
    let key = KeyFile::new(KeyFile::default_path(data_dir))
        .load_or_create()
        .context("failed to load session key")?;
    let db_path = data_dir.join(SESSION_DB);
    let vault = Vault::open(&db_path, &key)
        .with_context(|| format!("failed to open session cache {}", db_path.display()))?;
    debug!(path = %db_path.display(), "session cache opened");
    Ok(Arc::new(VaultPersistence::new(vault)))
}

fn open_session(config: AuthConfig, data_dir: &Path) -> Result<Session> {
    let persistence = open_persistence(data_dir)?;
    Session::from_config(config, persistence).map_err(user_facing)
}

fn print_signed_in(session: &Session, destination: &str) {
    if let Some(credential) = session.credentials().get() {
        println!(
            "Signed in as {} ({}).",
            credential.identity.display_name, credential.identity.subject_id
        );
    }
    println!("Continue at {destination}");
}

/// Keep the detailed error in the log and show the user-facing text.
fn user_facing(e: AuthError) -> anyhow::Error {
    tracing::debug!(error = %e, "command failed");
    anyhow!(e.user_message())
}

fn init_tracing(default_level: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(io::stderr)
        .compact()
        .init();
}
