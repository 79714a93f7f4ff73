mod demo;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use axum::{
    extract::{Json, State},
    http::StatusCode,
    response::{Html, IntoResponse},
    routing::{get, post},
    Router,
};
use clap::Parser;
use kiln_core::{Agent, AgentConfig};
use tokio::{net::TcpListener, sync::Mutex};
use tracing_subscriber::EnvFilter;

use demo::{
    build_container, render_form, render_response, Demo, FormLayout, ProcessRequest,
    ProcessResponse,
};

// Define command line arguments
#[derive(Parser, Debug)]
#[command(author, version, about = "Kiln demo server")]
struct Args {
    /// Which demo front-end to serve
    #[arg(long, value_enum, default_value_t = Demo::Diffusers)]
    demo: Demo,

    /// Agent config to run; defaults to the demo's sample config
    #[arg(long, env = "KILN_AGENT_CONFIG")]
    config: Option<PathBuf>,

    /// Host address to bind the server to
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Port to bind the server to
    #[arg(long, default_value_t = 8000)]
    port: u16,
}

// Application state containing the loaded agent and the form it was built for.
struct AppState {
    demo: Demo,
    layout: FormLayout,
    agent: Mutex<Agent>,
}

async fn form_handler(State(state): State<Arc<AppState>>) -> Html<String> {
    Html(render_form(state.demo, &state.layout))
}

async fn process_handler(
    State(state): State<Arc<AppState>>,
    Json(req): Json<ProcessRequest>,
) -> impl IntoResponse {
    if let Some(warning) = state.layout.missing_input(&req) {
        tracing::warn!("{warning}");
        return Json(ProcessResponse::warning(warning)).into_response();
    }
    match process(req, state).await {
        Ok(response) => Json(response).into_response(),
        Err(e) => {
            tracing::error!("Error processing request: {:?}", e);
            (StatusCode::INTERNAL_SERVER_ERROR, format!("Error: {:?}", e)).into_response()
        }
    }
}

/// Runs the agent on the blocking pool; requests are served one at a time.
async fn process(req: ProcessRequest, state: Arc<AppState>) -> Result<ProcessResponse> {
    tokio::task::spawn_blocking(move || {
        let container = build_container(&state.layout, &req)?;
        let result = state.agent.blocking_lock().run(container)?;
        render_response(state.demo, &state.layout, &result)
    })
    .await
    .map_err(|e| anyhow!("agent task failed: {e}"))?
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let config_path = args
        .config
        .unwrap_or_else(|| PathBuf::from(args.demo.default_config()));

    let config = AgentConfig::from_file(&config_path)?;
    let layout = FormLayout::for_demo(args.demo, &config);
    tracing::info!(config = %config_path.display(), ?layout, "loading agent");
    let agent = tokio::task::spawn_blocking(move || Agent::from_config(&config)).await??;

    // Build application state and wrap in Arc.
    let shared_state = Arc::new(AppState {
        demo: args.demo,
        layout,
        agent: Mutex::new(agent),
    });

    // --- Build axum router with shared state ---
    let app = Router::new()
        .route("/", get(form_handler))
        .route("/v1/process", post(process_handler))
        .with_state(shared_state);

    // --- Start the server ---
    let bind_address = format!("{}:{}", args.host, args.port);
    let listener = TcpListener::bind(&bind_address).await?;
    tracing::info!("Started server on {}", listener.local_addr()?);
    axum::serve(listener, app.into_make_service()).await?;

    Ok(())
}
