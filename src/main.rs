use clap::{Parser, Subcommand, ValueEnum};
use gp_connect::config::{Config, SsoMode, default_config_path};
use gp_connect::credentials::{CredentialVault, PromptCredentialSource};
use gp_connect::diagnostics;
use gp_connect::error::{ConnectError, Stage};
use gp_connect::gp::hip::{find_hip_wrapper, reporter_for};
use gp_connect::gp::http::{ClientParams, GpHttp, RetryPolicy};
use gp_connect::identity::IdentityReference;
use gp_connect::orchestrator::{ConnectRequest, Orchestrator};
use gp_connect::session::SessionStore;
use gp_connect::sso::SsoEngine;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{Level, debug, error, info, warn};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser)]
#[command(name = "gp-connect")]
#[command(about = "GlobalProtect authentication and session establishment")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose output (raw protocol bodies included)
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Config file (default: $XDG_CONFIG_HOME/gp-connect/config.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,
}

#[derive(Clone, Copy, ValueEnum)]
enum SsoModeArg {
    Browser,
    Remote,
}

impl From<SsoModeArg> for SsoMode {
    fn from(mode: SsoModeArg) -> Self {
        match mode {
            SsoModeArg::Browser => SsoMode::Browser,
            SsoModeArg::Remote => SsoMode::Remote,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Authenticate and print the tunnel handoff as JSON
    Connect {
        /// Portal host or URL
        #[arg(short, long)]
        portal: Option<String>,

        /// Client certificate: PEM file path or PKCS#11 URI
        #[arg(long)]
        certificate: Option<String>,

        /// Always submit a HIP report before requesting tunnel configuration
        #[arg(long)]
        hip: bool,

        /// How to present the SSO login page
        #[arg(long, value_enum)]
        sso_mode: Option<SsoModeArg>,

        /// Ignore and discard any stored session
        #[arg(long)]
        clean: bool,

        /// Username for direct authentication
        #[arg(short, long)]
        user: Option<String>,

        /// Remember the password after prompting
        #[arg(short = 's', long)]
        save_password: bool,
    },
    /// Report local capabilities (certificate, HIP wrapper, last gateway)
    Diagnose {
        /// Certificate input to classify
        #[arg(long)]
        certificate: Option<String>,

        #[arg(short, long)]
        portal: Option<String>,
    },
    /// Delete the stored password and session for a portal
    Forget {
        #[arg(short, long)]
        user: Option<String>,

        #[arg(short, long)]
        portal: Option<String>,
    },
    /// Generate default config file
    Init,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let level = if cli.verbose { Level::DEBUG } else { Level::INFO };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let config_path = cli.config.clone().or_else(default_config_path);

    match cli.command {
        Commands::Connect {
            portal,
            certificate,
            hip,
            sso_mode,
            clean,
            user,
            save_password,
        } => {
            let mut config = load_config(config_path.as_deref());
            if let Some(portal) = portal {
                config.portal.host = portal;
            }
            if let Some(certificate) = certificate {
                config.portal.certificate = Some(certificate);
            }
            if let Some(mode) = sso_mode {
                config.sso.mode = mode.into();
            }
            if user.is_some() {
                config.portal.username = user;
            }
            config.hip.required |= hip;

            match connect(&config, clean, save_password).await {
                Ok(()) => {}
                Err(e) => {
                    error!("Connection failed: {}", e);
                    std::process::exit(1);
                }
            }
        }
        Commands::Diagnose { certificate, portal } => {
            let config = load_config(config_path.as_deref());
            let certificate = certificate.or(config.portal.certificate.clone());
            let identity = certificate.as_deref().map(IdentityReference::classify);
            let portal = portal.unwrap_or(config.portal.host.clone());
            let store = session_store(&config)?;

            let report = diagnostics::collect(
                identity.as_ref(),
                config.hip.wrapper.as_deref(),
                Some((&store, &portal)),
                cli.verbose,
            );
            print!("{}", report);
        }
        Commands::Forget { user, portal } => {
            let config = load_config(config_path.as_deref());
            let portal = portal.unwrap_or(config.portal.host.clone());

            let store = session_store(&config)?;
            store.invalidate(&portal).await?;

            if let Some(user) = user.or(config.portal.username.clone()) {
                let vault = CredentialVault::default_location()?;
                match vault.delete(&portal, &user) {
                    Ok(()) => println!("Stored password deleted for {} on {}", user, portal),
                    Err(e) => {
                        error!("Failed to delete password: {}", e);
                        std::process::exit(1);
                    }
                }
            }
            println!("Stored session cleared for {}", portal);
        }
        Commands::Init => {
            info!("Generating default config...");
            let path = config_path.ok_or("could not determine config directory")?;
            if path.exists() {
                println!("Config already exists: {}", path.display());
                return Ok(());
            }
            Config::default().save(&path)?;
            println!("Created default config: {}", path.display());
        }
    }

    Ok(())
}

fn load_config(path: Option<&Path>) -> Config {
    let Some(path) = path else {
        return Config::default();
    };
    if !path.exists() {
        debug!("No config at {}, using defaults", path.display());
        return Config::default();
    }
    match Config::load(path) {
        Ok(config) => {
            debug!("Loaded config from {}", path.display());
            config
        }
        Err(e) => {
            warn!("Ignoring config {}: {}", path.display(), e);
            Config::default()
        }
    }
}

fn session_store(config: &Config) -> Result<SessionStore, Box<dyn std::error::Error>> {
    let dir = match &config.session.dir {
        Some(dir) => dir.clone(),
        None => SessionStore::default_dir()?,
    };
    Ok(SessionStore::new(dir))
}

async fn connect(config: &Config, clean: bool, save_password: bool) -> Result<(), Box<dyn std::error::Error>> {
    let identity = config
        .portal
        .certificate
        .as_deref()
        .map(IdentityReference::classify);
    if let Some(identity) = &identity {
        info!("Client identity: {} ({})", identity, identity.mode());
    }

    let params = ClientParams::new(
        &config.portal.user_agent,
        &config.portal.client_os,
        &config.portal.client_version,
    )
    .with_os_version(config.portal.os_version.as_deref());
    let retry = RetryPolicy {
        attempts: config.retry.attempts,
        base_delay: Duration::from_millis(config.retry.base_delay_ms),
    };
    let http = GpHttp::new(
        params,
        retry,
        Duration::from_secs(config.retry.request_timeout_secs),
        identity.as_ref(),
    )
    .map_err(|e| ConnectError::new(Stage::Prelogin, e))?;

    let store = session_store(config)?;
    let vault = CredentialVault::default_location()?;
    let credentials = PromptCredentialSource::new(config.portal.username.clone(), vault, save_password);

    let hip_wrapper = find_hip_wrapper(config.hip.wrapper.as_deref());
    match &hip_wrapper {
        Some(path) => info!("Using HIP wrapper {}", path.display()),
        None => debug!("No HIP wrapper found, using built-in report"),
    }

    let orchestrator = Orchestrator::new(
        Arc::new(http),
        store,
        SsoEngine::from_settings(&config.sso),
        Box::new(credentials),
        reporter_for(hip_wrapper.clone()),
    )
    .with_hip_wrapper(hip_wrapper);

    let cancel = CancellationToken::new();
    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupted, cancelling");
            signal_cancel.cancel();
        }
    });

    let request = ConnectRequest {
        portal: config.portal.host.clone(),
        identity,
        hip_required: config.hip.required,
        clean_session: clean,
    };
    info!("Connecting to {}...", request.portal);
    let handoff = orchestrator.connect(&request, &cancel).await?;

    println!("{}", serde_json::to_string_pretty(&handoff)?);
    Ok(())
}
