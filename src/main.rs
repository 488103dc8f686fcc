use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use crossterm::{
    event::{DisableBracketedPaste, EnableBracketedPaste},
    execute,
    terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen},
};
use ratatui::{backend::CrosstermBackend, Terminal};
use std::io::{self, Write};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time;

mod attestation;
mod backend;
mod config;
mod dispatch;
mod error;
mod logger;
mod model;
mod session;
mod summarize;
#[cfg(test)]
mod testing;
mod ui;

use crate::backend::local::{LocalAuth, LocalBlobStore, LocalCaptcha, Repo};
use crate::backend::remote::{ApiClient, RemoteAuth};
use crate::backend::{AuthService, Backend};
use crate::config::{AppConfig, TokenStore};
use crate::model::AuthProvider;
use crate::session::Session;
use crate::summarize::{LocalSummarizer, OpenAiCompletion};

const LOGIN_WAIT: Duration = Duration::from_secs(300);

#[derive(Parser)]
#[command(version, about, long_about = None)]
struct Args {
    /// Use the local store instead of the hosted service
    #[arg(long, global = true)]
    offline: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the TUI application (default)
    Tui,
    /// Sign in through the browser
    Login {
        #[arg(long, value_enum, default_value_t = AuthProvider::Google)]
        provider: AuthProvider,
        /// Token from a solved reCAPTCHA challenge
        #[arg(long)]
        captcha_token: String,
    },
    /// Sign out and forget the stored tokens
    Logout,
    /// Show the signed-in user
    Whoami,
    /// Delete every note in the local store
    ResetLocal,
}

fn local_db_path(config_dir: &Path) -> std::path::PathBuf {
    config_dir.join("local.db")
}

fn remote_backend(config: &AppConfig, config_dir: &Path) -> Result<Backend> {
    let api = ApiClient::new(
        &config.api_base_url(),
        TokenStore::new(config_dir),
        Duration::from_millis(config.general.poll_interval_ms),
    )?;
    let auth = Arc::new(RemoteAuth::new(api.clone()));
    let api = Arc::new(api);
    Ok(Backend {
        auth,
        notes: api.clone(),
        blobs: api.clone(),
        summarizer: api.clone(),
        captcha: api,
    })
}

fn local_backend(config: &AppConfig, config_dir: &Path) -> Result<Backend> {
    let repo = Repo::open(&local_db_path(config_dir))?;
    let auth = Arc::new(LocalAuth::new());
    let llm = Arc::new(OpenAiCompletion::new(&config.llm)?);
    if config.llm.api_key().is_none() {
        tracing::warn!(
            "{} is not set; summaries will fail against hosted models",
            config.llm.api_key_env
        );
    }
    let summarizer = LocalSummarizer::new(repo.clone(), auth.listen(), llm);
    Ok(Backend {
        auth,
        notes: Arc::new(repo),
        blobs: Arc::new(LocalBlobStore::new(config_dir.join("blobs"))),
        summarizer: Arc::new(summarizer),
        captcha: Arc::new(LocalCaptcha::new(config.captcha.secret.as_deref())),
    })
}

fn build_backend(config: &AppConfig, config_dir: &Path, offline: bool) -> Result<Backend> {
    if offline {
        tracing::info!("Using local backend in {}", config_dir.display());
        local_backend(config, config_dir)
    } else {
        tracing::info!("Using hosted backend at {}", config.api_base_url());
        remote_backend(config, config_dir)
    }
}

fn restore_terminal() -> Result<()> {
    disable_raw_mode()?;
    execute!(io::stdout(), LeaveAlternateScreen, DisableBracketedPaste)?;
    Ok(())
}

async fn handle_cli_login(backend: Backend, provider: AuthProvider, captcha_token: &str) -> Result<()> {
    let mut auth = backend.auth.listen();
    if let Some(user) = auth.borrow_and_update().clone() {
        println!("Already logged in as: {}", user.label());
        return Ok(());
    }

    let session = Session::new(backend.clone());
    session.verify_captcha(captcha_token).await;
    if !session.state().captcha_ok {
        anyhow::bail!("{}", session.state().status);
    }

    println!("Starting login with {}...", provider);
    backend
        .auth
        .sign_in(provider)
        .await
        .context("failed to start login")?;
    println!("Complete the sign-in in your browser.");

    print!("Waiting for authentication... ");
    io::stdout().flush()?;
    let user = match time::timeout(LOGIN_WAIT, auth.wait_for(|u| u.is_some())).await {
        Ok(Ok(user)) => user.clone(),
        Ok(Err(_)) => anyhow::bail!("auth feed closed before sign-in finished"),
        Err(_) => anyhow::bail!("login timed out; please try again"),
    };
    let Some(user) = user else {
        anyhow::bail!("sign-in did not complete");
    };
    println!("\nLogin successful!");
    println!("Logged in as: {}", user.label());
    if let Some(email) = &user.email {
        println!("Email: {}", email);
    }
    Ok(())
}

async fn handle_logout(backend: Backend) -> Result<()> {
    if backend.auth.listen().borrow().is_none() {
        println!("Already logged out.");
        return Ok(());
    }
    backend
        .auth
        .sign_out()
        .await
        .context("failed to sign out")?;
    println!("Logged out successfully.");
    Ok(())
}

fn handle_whoami(config_dir: &Path, offline: bool) {
    if offline {
        println!("Offline mode: notes belong to the local user");
        return;
    }
    match TokenStore::new(config_dir).current_user() {
        Some(user) => {
            println!("Logged in as: {}", user.label());
            println!("User id: {}", user.uid);
            if let Some(email) = &user.email {
                println!("Email: {}", email);
            }
        }
        None => println!("Not logged in."),
    }
}

async fn run_tui(backend: Backend, config: &AppConfig, offline: bool) -> Result<()> {
    let session = Arc::new(Session::new(backend));
    let (stop_tx, stop_rx) = watch::channel(false);
    let controller = {
        let session = Arc::clone(&session);
        tokio::spawn(async move { session.run(stop_rx).await })
    };

    enable_raw_mode()?;
    let mut stdout = io::stdout();
    execute!(stdout, EnterAlternateScreen, EnableBracketedPaste)?;
    let mut terminal = Terminal::new(CrosstermBackend::new(stdout))?;

    let mut model = ui::Model::new(Arc::clone(&session), config.theme.clone(), offline)
        .with_captcha_site_key(config.captcha.site_key.clone());
    let model_result = model.run(&mut terminal).await;

    drop(model);
    stop_tx.send_replace(true);
    let _ = time::timeout(Duration::from_secs(1), controller).await;
    let _ = restore_terminal();
    if let Err(err) = model_result {
        eprintln!("Error: {:?}", err);
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        let _ = restore_terminal();
        default_hook(info);
    }));

    let args = Args::parse();
    let config_dir = config::get_config_dir();
    let _log_guard = logger::init(&config_dir);
    let app_config = config::load_config(&config_dir);
    attestation::init(app_config.attestation.site_key.as_deref());
    let offline = args.offline || app_config.general.offline_mode;

    match args.command {
        Some(Commands::Login {
            provider,
            captcha_token,
        }) => {
            if offline {
                println!("Offline mode has a single local user; no login needed.");
                return Ok(());
            }
            let backend = build_backend(&app_config, &config_dir, offline)?;
            handle_cli_login(backend, provider, &captcha_token).await
        }
        Some(Commands::Logout) => {
            let backend = build_backend(&app_config, &config_dir, offline)?;
            handle_logout(backend).await
        }
        Some(Commands::Whoami) => {
            handle_whoami(&config_dir, offline);
            Ok(())
        }
        Some(Commands::ResetLocal) => {
            let repo = Repo::open(&local_db_path(&config_dir))?;
            repo.clear_all_data()
                .await
                .context("failed to reset the local store")?;
            println!("Local store reset successfully.");
            Ok(())
        }
        None | Some(Commands::Tui) => {
            let backend = build_backend(&app_config, &config_dir, offline)?;
            run_tui(backend, &app_config, offline).await
        }
    }
}
