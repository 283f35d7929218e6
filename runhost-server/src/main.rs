//! runhost server - HTTP API for creating and running instances of declared executables.

mod error;
mod routes;
mod sse;
mod state;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use runhost::core::spec::ApiSpec;
use runhost::io::config::{ServerConfig, load_config, write_config};
use runhost::io::runner::SystemProcessRunner;
use runhost::io::spec_store::load_api_spec;
use runhost::io::store::{Instances, open_store};
use runhost::lifecycle::LifecycleManager;
use runhost::logging;
use runhost::recovery::recover_interrupted;
use tower_http::cors::{Any, CorsLayer};
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::state::AppState;

#[derive(Parser)]
#[command(name = "runhost-server")]
#[command(about = "Expose declared executables as HTTP-invokable instances")]
struct Args {
    /// Config file (TOML); missing file means defaults
    #[arg(long, default_value = "runhost.toml")]
    config: PathBuf,

    /// Address to bind the server to
    #[arg(long)]
    bind: Option<String>,

    /// Port to listen on
    #[arg(long)]
    port: Option<u16>,

    /// Path to apispec.json
    #[arg(long)]
    spec: Option<PathBuf>,

    /// Directory served as static files for unmatched routes
    #[arg(long)]
    static_dir: Option<PathBuf>,

    /// Include internal error details in responses
    #[arg(long)]
    dev: bool,

    /// Write the effective configuration to `--config` and exit
    #[arg(long)]
    write_config: bool,
}

impl Args {
    fn apply(self, mut config: ServerConfig) -> ServerConfig {
        if let Some(bind) = self.bind {
            config.bind = bind;
        }
        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(spec) = self.spec {
            config.spec_path = spec;
        }
        if let Some(dir) = self.static_dir {
            config.static_dir = Some(dir);
        }
        if self.dev {
            config.development = true;
        }
        config
    }
}

#[tokio::main]
async fn main() {
    logging::init(logging::DEFAULT_DIRECTIVE);
    if let Err(err) = run(Args::parse()).await {
        eprintln!("error: {err:#}");
        std::process::exit(1);
    }
}

async fn run(args: Args) -> Result<()> {
    let config_path = args.config.clone();
    let write_only = args.write_config;
    let config = args.apply(load_config(&config_path)?);
    config.validate().context("invalid configuration")?;
    if write_only {
        write_config(&config_path, &config)?;
        info!(path = %config_path.display(), "wrote configuration");
        return Ok(());
    }

    let spec = Arc::new(load_api_spec(&config.spec_path)?);
    let backend = open_store(&config.store)?;
    let store = Instances::new(backend, config.store.inline_limit_bytes);
    recover_interrupted(&spec, &store).context("recover interrupted instances")?;

    let runner = Arc::new(SystemProcessRunner {
        timeout: config.invocation.timeout(),
        output_limit_bytes: config.invocation.output_limit_bytes,
    });
    let state = AppState::new(config.development, |observer| {
        LifecycleManager::new(Arc::clone(&spec), store, runner, observer)
    });

    let app = build_app(state, &config, &spec);

    let addr: SocketAddr = format!("{}:{}", config.bind, config.port)
        .parse()
        .with_context(|| format!("invalid listen address {}:{}", config.bind, config.port))?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("bind {}", addr))?;
    info!(addr = %addr, development = config.development, "listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("serve")?;
    info!("server stopped");
    Ok(())
}

fn build_app(state: AppState, config: &ServerConfig, spec: &ApiSpec) -> axum::Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any)
        .expose_headers(Any);

    let mut app = routes::router()
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state);

    match &config.static_dir {
        Some(dir) if dir.exists() => {
            info!(static_dir = %dir.display(), "serving static files");
            app = app.fallback_service(ServeDir::new(dir).append_index_html_on_directories(true));
        }
        Some(dir) => {
            info!(static_dir = %dir.display(), "static directory not found, API-only mode");
        }
        None => {}
    }
    info!(
        executables = spec.executables.len(),
        invokers = spec.invokers.len(),
        "routes ready"
    );
    app
}

async fn shutdown_signal() {
    if tokio::signal::ctrl_c().await.is_ok() {
        info!("shutdown requested");
    }
}
