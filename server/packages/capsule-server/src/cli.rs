use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use axum::http::{HeaderValue, Method};
use clap::{Args, Parser, Subcommand};
use thiserror::Error;
use tower_http::cors::{AllowHeaders, AllowOrigin, CorsLayer};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::{RelayConfig, DEFAULT_KEEPALIVE_INTERVAL, DEFAULT_STREAM_TIMEOUT};
use crate::generator::{ClaudeCliGenerator, CodeGenerator, MockGenerator};
use crate::relay::GenerationRelay;
use crate::router::{build_router, AppState};
use crate::sandbox::{
    E2bConnector, SandboxConnector, StaticSandboxConnector, DEFAULT_E2B_API_URL,
    DEFAULT_E2B_DOMAIN,
};
use crate::store::JsonFileProjectStore;
use crate::usage::InMemoryUsageTracker;

const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_PORT: u16 = 3001;
const DEFAULT_CLAUDE_BIN: &str = "claude";
const E2B_API_KEY_ENV: &str = "E2B_API_KEY";

#[derive(Parser, Debug)]
#[command(name = "capsule-server", bin_name = "capsule-server")]
#[command(about = "Streams Claude code generations for Capsule projects", version)]
#[command(arg_required_else_help = true)]
pub struct CapsuleCli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the generation HTTP server.
    Server(ServerArgs),
}

#[derive(Args, Debug)]
pub struct ServerArgs {
    #[arg(long, short = 'H', default_value = DEFAULT_HOST)]
    host: String,

    #[arg(long, short = 'p', default_value_t = DEFAULT_PORT)]
    port: u16,

    #[arg(long = "cors-allow-origin", short = 'O')]
    cors_allow_origin: Vec<String>,

    #[arg(long = "cors-allow-credentials", short = 'C')]
    cors_allow_credentials: bool,

    /// Seconds of silence before a keepalive frame is sent.
    #[arg(long = "keepalive-secs", default_value_t = DEFAULT_KEEPALIVE_INTERVAL.as_secs())]
    keepalive_secs: u64,

    /// Seconds a generation may run before it is failed.
    #[arg(long = "timeout-secs", default_value_t = DEFAULT_STREAM_TIMEOUT.as_secs())]
    timeout_secs: u64,

    #[arg(long = "projects-file", env = "CAPSULE_PROJECTS_FILE")]
    projects_file: Option<PathBuf>,

    #[arg(long = "claude-bin", env = "CAPSULE_CLAUDE_BIN", default_value = DEFAULT_CLAUDE_BIN)]
    claude_bin: PathBuf,

    #[arg(long = "claude-model", env = "CAPSULE_CLAUDE_MODEL")]
    claude_model: Option<String>,

    #[arg(long = "claude-workdir", env = "CAPSULE_CLAUDE_WORKDIR")]
    claude_workdir: Option<PathBuf>,

    /// Extra argument passed through to the Claude CLI. Repeatable.
    #[arg(long = "claude-arg", allow_hyphen_values = true)]
    claude_args: Vec<String>,

    #[arg(long = "e2b-api-url", env = "CAPSULE_E2B_API_URL", default_value = DEFAULT_E2B_API_URL)]
    e2b_api_url: String,

    /// Use the scripted generator instead of the Claude CLI.
    #[arg(long)]
    mock: bool,
}

#[derive(Debug, Error)]
pub enum CliError {
    #[error("invalid cors origin: {0}")]
    InvalidCorsOrigin(String),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Capsule(#[from] capsule_error::CapsuleError),
    #[error("server error: {0}")]
    Server(String),
}

pub fn run_capsule_server() -> Result<(), CliError> {
    let cli = CapsuleCli::parse();
    init_logging()?;
    run_command(&cli.command)
}

pub fn init_logging() -> Result<(), CliError> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_logfmt::builder()
                .layer()
                .with_writer(std::io::stderr),
        )
        .init();
    Ok(())
}

pub fn run_command(command: &Command) -> Result<(), CliError> {
    match command {
        Command::Server(args) => run_server(args),
    }
}

fn run_server(server: &ServerArgs) -> Result<(), CliError> {
    let config = relay_config(server)?;
    let generator = build_generator(server);
    let sandboxes = build_sandbox_connector(server)?;
    let cors = build_cors_layer(server)?;
    let projects_path = server
        .projects_file
        .clone()
        .unwrap_or_else(default_projects_file);

    let addr = format!("{}:{}", server.host, server.port);
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| CliError::Server(err.to_string()))?;

    runtime.block_on(async move {
        let projects = Arc::new(JsonFileProjectStore::open(&projects_path).await?);
        let usage = Arc::new(InMemoryUsageTracker::new());
        let relay = GenerationRelay::new(
            config,
            sandboxes,
            generator,
            usage.clone(),
            projects.clone(),
        );
        let router = build_router(AppState::new(relay, projects.clone(), usage)).layer(cors);

        let listener = tokio::net::TcpListener::bind(&addr).await?;
        tracing::info!(addr = %addr, projects = %projects.path().display(), "server listening");
        axum::serve(listener, router)
            .with_graceful_shutdown(async move {
                let _ = tokio::signal::ctrl_c().await;
                tracing::info!("shutting down");
            })
            .await
            .map_err(|err| CliError::Server(err.to_string()))
    })
}

fn relay_config(server: &ServerArgs) -> Result<RelayConfig, CliError> {
    if server.keepalive_secs == 0 {
        return Err(CliError::InvalidArgument(
            "--keepalive-secs must be greater than zero".to_string(),
        ));
    }
    if server.timeout_secs == 0 {
        return Err(CliError::InvalidArgument(
            "--timeout-secs must be greater than zero".to_string(),
        ));
    }
    let mut config = RelayConfig::default()
        .with_keepalive_interval(Duration::from_secs(server.keepalive_secs))
        .with_stream_timeout(Duration::from_secs(server.timeout_secs));
    if let Some(model) = &server.claude_model {
        config = config.with_model(model.clone());
    }
    Ok(config)
}

fn build_generator(server: &ServerArgs) -> Arc<dyn CodeGenerator> {
    if server.mock {
        tracing::info!("using scripted mock generator");
        return Arc::new(MockGenerator::default());
    }
    Arc::new(
        ClaudeCliGenerator::new(&server.claude_bin)
            .with_model(server.claude_model.clone())
            .with_working_dir(server.claude_workdir.clone())
            .with_extra_args(server.claude_args.clone()),
    )
}

fn build_sandbox_connector(server: &ServerArgs) -> Result<Arc<dyn SandboxConnector>, CliError> {
    match std::env::var(E2B_API_KEY_ENV) {
        Ok(api_key) if !api_key.trim().is_empty() => {
            Ok(Arc::new(E2bConnector::new(&server.e2b_api_url, api_key)?))
        }
        _ => {
            tracing::warn!(
                "{E2B_API_KEY_ENV} not set; sandboxes are assumed reachable without verification"
            );
            Ok(Arc::new(StaticSandboxConnector::new(DEFAULT_E2B_DOMAIN)))
        }
    }
}

fn default_projects_file() -> PathBuf {
    dirs::data_dir()
        .map(|dir| dir.join("capsule").join("projects.json"))
        .unwrap_or_else(|| PathBuf::from(".").join(".capsule").join("projects.json"))
}

fn build_cors_layer(server: &ServerArgs) -> Result<CorsLayer, CliError> {
    let origins = server
        .cors_allow_origin
        .iter()
        .map(|origin| {
            origin
                .parse::<HeaderValue>()
                .map_err(|_| CliError::InvalidCorsOrigin(origin.clone()))
        })
        .collect::<Result<Vec<_>, _>>()?;
    // No configured origin refuses every cross-origin request.
    let allow_origin = if origins.is_empty() {
        AllowOrigin::predicate(|_, _| false)
    } else {
        AllowOrigin::list(origins)
    };

    Ok(CorsLayer::new()
        .allow_origin(allow_origin)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers(AllowHeaders::mirror_request())
        .allow_credentials(server.cors_allow_credentials))
}
