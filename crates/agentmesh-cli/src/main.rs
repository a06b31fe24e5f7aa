mod config;

use agentmesh_broker::InMemoryBroker;
use agentmesh_gateway::{AppState, GatewayServer};
use agentmesh_security::{
    ChallengeAuthenticator, InMemoryChallengeStore, InMemoryKeyDirectory, SignatureVerifier,
    TokenIssuer,
};
use clap::{Parser, Subcommand, ValueEnum};
use config::{MeshConfig, TOKEN_SECRET_ENV};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "agentmesh", about = "agentmesh — multi-tenant agent messaging gateway")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "agentmesh.toml")]
    config: PathBuf,

    /// Log output format
    #[arg(long, value_enum, default_value_t = LogFormat::Json)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum LogFormat {
    Json,
    Pretty,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the gateway server
    Serve {
        /// Host to bind to (overrides config)
        #[arg(long)]
        host: Option<String>,
        /// Port to listen on (overrides config)
        #[arg(short, long)]
        port: Option<u16>,
    },
    /// Inspect public keys
    Keys {
        #[command(subcommand)]
        action: KeysAction,
    },
}

#[derive(Subcommand)]
enum KeysAction {
    /// Print the SHA-256 fingerprint of a PEM public key
    Fingerprint { path: PathBuf },
    /// List the keys configured under [[keys]]
    List,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let cli = Cli::parse();
    match cli.log_format {
        LogFormat::Json => tracing_subscriber::fmt().with_env_filter(filter).json().init(),
        LogFormat::Pretty => tracing_subscriber::fmt().with_env_filter(filter).init(),
    }

    // Resolve config base directory (for relative key paths)
    let config_dir = cli
        .config
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."))
        .to_path_buf();

    match cli.command {
        Commands::Serve { host, port } => {
            let config = MeshConfig::load(&cli.config).await?;
            serve(config, &config_dir, host, port).await?;
        }
        Commands::Keys { action } => match action {
            KeysAction::Fingerprint { path } => {
                let pem = tokio::fs::read_to_string(&path).await.map_err(|e| {
                    anyhow::anyhow!("Failed to read key file '{}': {e}", path.display())
                })?;
                println!("{}", SignatureVerifier::fingerprint(&pem)?);
            }
            KeysAction::List => {
                let config = MeshConfig::load(&cli.config).await?;
                if config.keys.is_empty() {
                    println!("No keys configured.");
                    println!("Add keys to agentmesh.toml under [[keys]]");
                    return Ok(());
                }
                let directory = InMemoryKeyDirectory::new();
                config.seed_keys(&directory, &config_dir).await?;
                println!("Configured keys:");
                for entry in &config.keys {
                    let owner = entry.owner_agent_id.as_deref().unwrap_or("-");
                    let state = if entry.revoked {
                        "revoked"
                    } else if entry.active {
                        "active"
                    } else {
                        "inactive"
                    };
                    println!(
                        "  {}/{}  owner={owner}  {state}",
                        entry.tenant_id, entry.key_id
                    );
                }
            }
        },
    }

    Ok(())
}

async fn serve(
    config: MeshConfig,
    config_dir: &Path,
    host: Option<String>,
    port: Option<u16>,
) -> anyhow::Result<()> {
    let host = host.unwrap_or_else(|| config.server.host.clone());
    let port = port.unwrap_or(config.server.port);

    let secret = config.token_secret().ok_or_else(|| {
        anyhow::anyhow!("No token secret: set [auth].token_secret or {TOKEN_SECRET_ENV}")
    })?;
    let tokens = Arc::new(TokenIssuer::new(
        secret.as_bytes(),
        Duration::from_secs(config.auth.token_ttl_secs),
    )?);

    // Initialize authentication
    let keys = InMemoryKeyDirectory::new();
    let loaded = config.seed_keys(&keys, config_dir).await?;
    if loaded == 0 {
        warn!("No keys configured, agents will not be able to authenticate");
    }
    let challenges = InMemoryChallengeStore::new();
    let _sweeper = challenges.spawn_sweeper(Duration::from_secs(60));
    let authenticator = Arc::new(
        ChallengeAuthenticator::new(challenges, keys)
            .with_ttl(Duration::from_secs(config.auth.challenge_ttl_secs)),
    );

    let authorizer = Arc::new(config.build_authorizer()?);
    info!(
        tenants = authorizer.tenant_count(),
        roots = ?config.authorization.default_roots,
        "Authorization configured"
    );

    let state = AppState::new(
        config.gateway_config(),
        InMemoryBroker::new(),
        authorizer,
        authenticator,
        tokens,
        config.protocol_config(),
    );
    let _background = GatewayServer::spawn_background(&state);
    let app = GatewayServer::build(state);

    let addr = format!("{host}:{port}");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("agentmesh gateway listening on {}", addr);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    info!("agentmesh gateway stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
}
