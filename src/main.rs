//! Caliper server entry point.

use std::sync::Arc;

use caliper::api::{create_combined_router, RestApiConfig};
use caliper::bus::MessageBus;
use caliper::config::Config;
use caliper::messages::SessionId;
use caliper::orchestrator::{build_pipeline, Orchestrator};
use caliper::services::{create_inference, HttpQueryService, QueryService};
use caliper::session::{SessionMirror, SessionStore};
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Caliper: conversational analytics for press-shop production data
#[derive(Parser, Debug)]
#[command(name = "caliper")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, global = true)]
    config: Option<String>,

    /// Output as JSON
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the HTTP server (default behavior)
    Serve {
        /// HTTP port. If not specified, uses config file value.
        #[arg(short, long)]
        port: Option<u16>,
        /// Enable JSON logging format
        #[arg(long)]
        json_logs: bool,
    },
    /// Ask a single question from the terminal
    Ask {
        /// Question text
        question: String,
        /// Session id to continue a conversation
        #[arg(short, long)]
        session: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    match args.command {
        Some(Command::Ask { question, session }) => {
            run_ask(&args.config, question, session, args.json).await
        }
        Some(Command::Serve { port, json_logs }) => {
            run_http_server(&args.config, port, json_logs).await
        }
        None => run_http_server(&args.config, None, false).await,
    }
}

fn load_config(config_path: &Option<String>) -> anyhow::Result<Config> {
    let config = if let Some(path) = config_path {
        Config::from_file(path)?
    } else {
        Config::load()?
    };
    Ok(config)
}

/// Assemble the full engine: session store, external services, workers,
/// orchestrator. Shared by the server and the one-shot CLI path.
fn build_engine(config: &Config) -> anyhow::Result<(Arc<Orchestrator>, Arc<dyn QueryService>)> {
    let mirror = if config.mirror.enabled {
        let (mirror, _writer) = SessionMirror::spawn(config.mirror_dir()?);
        Some(mirror)
    } else {
        None
    };

    let store = Arc::new(SessionStore::new(config.session.clone(), mirror));
    store.spawn_sweeper();

    let query: Arc<dyn QueryService> = Arc::new(HttpQueryService::new(&config.query_service)?);
    let inference = create_inference(&config.inference)?;

    let orchestrator = build_pipeline(
        Arc::new(MessageBus::new()),
        store,
        Arc::clone(&query),
        inference,
        config.pipeline.clone(),
    );

    Ok((orchestrator, query))
}

/// Run the HTTP server.
async fn run_http_server(
    config_path: &Option<String>,
    port: Option<u16>,
    json_logs: bool,
) -> anyhow::Result<()> {
    let mut config = load_config(config_path)?;
    if let Some(p) = port {
        config.server.http_port = p;
    }

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.logging.level.clone()));

    if json_logs || config.logging.json {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }

    tracing::info!("Starting Caliper v{}", env!("CARGO_PKG_VERSION"));
    tracing::info!(
        query_service = %config.query_service.base_url,
        inference_enabled = config.inference.enabled,
        mirror_enabled = config.mirror.enabled,
        "Configuration loaded"
    );

    let (orchestrator, query) = build_engine(&config)?;

    let rest_config = RestApiConfig {
        enable_cors: config.server.cors,
        ..Default::default()
    };
    let router = create_combined_router(orchestrator, query, &rest_config);

    let addr = format!("{}:{}", config.server.host, config.server.http_port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!(%addr, "HTTP server listening");
    axum::serve(listener, router).await?;

    Ok(())
}

/// Run one conversation turn and print the response.
async fn run_ask(
    config_path: &Option<String>,
    question: String,
    session: Option<String>,
    json: bool,
) -> anyhow::Result<()> {
    // Minimal logging for CLI use
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::WARN)
        .with_writer(std::io::stderr)
        .init();

    let config = load_config(config_path)?;

    let session_id = match session.as_deref() {
        Some(raw) => Some(
            SessionId::parse(raw).ok_or_else(|| anyhow::anyhow!("invalid session id: {raw}"))?,
        ),
        None => None,
    };

    let (orchestrator, _query) = build_engine(&config)?;
    let output = orchestrator.handle_turn(session_id, &question).await?;

    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&serde_json::json!({
                "session_id": output.session_id,
                "request_id": output.request_id,
                "response": output.response,
            }))?
        );
    } else {
        println!("{}", output.response.narrative);
        if !output.response.follow_ups.is_empty() {
            println!();
            println!("You could ask:");
            for follow_up in &output.response.follow_ups {
                println!("  - {follow_up}");
            }
        }
        println!();
        println!("session: {}", output.session_id);
    }

    Ok(())
}
