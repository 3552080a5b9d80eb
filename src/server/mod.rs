//! HTTP surface: job submission, SSE streaming, stop, and health.
//!
//! Handlers stay thin; all pipeline work happens in a spawned task driven by
//! the [`Orchestrator`]. Subscribers reconnecting mid-run get the full event
//! history replayed before live delivery, so the endpoint is safe to poll
//! from a browser `EventSource` that drops and retries.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::{
    extract::{Path, State},
    http::{HeaderValue, StatusCode},
    response::sse::{Event as SseEvent, KeepAlive, Sse},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use futures::stream::{Stream, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio_stream::wrappers::ReceiverStream;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use uuid::Uuid;

use crate::adapters::openai::OpenAiGenerator;
use crate::config::Config;
use crate::core::{EventBroker, JobRegistry, Orchestrator};
use crate::domain::Event;

const SWEEP_INTERVAL: Duration = Duration::from_secs(5);
const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(15);

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<JobRegistry>,
    pub broker: Arc<EventBroker>,
    pub orchestrator: Arc<Orchestrator>,
}

#[derive(Debug, Deserialize)]
struct GenerateRequest {
    prompt: String,
}

#[derive(Debug, Deserialize)]
struct StopRequest {
    #[serde(rename = "jobId")]
    job_id: Uuid,
}

/// Build the application router.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/generate", post(generate))
        .route("/stream/:job_id", get(stream))
        .route("/stop", post(stop))
        .route("/health", get(health))
        .with_state(state)
}

async fn generate(
    State(state): State<AppState>,
    Json(request): Json<GenerateRequest>,
) -> Response {
    if request.prompt.trim().is_empty() {
        return error_response(StatusCode::BAD_REQUEST, "prompt must not be empty");
    }

    let job = state.registry.create(request.prompt).await;
    state.broker.open(job.id).await;
    info!(job_id = %job.id, "job accepted");

    let orchestrator = Arc::clone(&state.orchestrator);
    let job_id = job.id;
    tokio::spawn(async move {
        orchestrator.run(job_id).await;
    });

    (StatusCode::ACCEPTED, Json(json!({ "jobId": job.id }))).into_response()
}

async fn stream(State(state): State<AppState>, Path(job_id): Path<Uuid>) -> Response {
    let subscription = match state.broker.attach(job_id).await {
        Ok(subscription) => subscription,
        Err(error) => {
            warn!(%job_id, %error, "stream requested for unknown job");
            return error_response(StatusCode::NOT_FOUND, "unknown job");
        }
    };

    let replay = futures::stream::iter(subscription.replay.into_iter().map(sse_event));
    let live: std::pin::Pin<Box<dyn Stream<Item = Result<SseEvent, Infallible>> + Send>> =
        match subscription.live {
            Some(receiver) => ReceiverStream::new(receiver).map(sse_event).boxed(),
            None => futures::stream::empty().boxed(),
        };

    Sse::new(replay.chain(live))
        .keep_alive(
            KeepAlive::new()
                .interval(KEEP_ALIVE_INTERVAL)
                .text("keep-alive"),
        )
        .into_response()
}

async fn stop(State(state): State<AppState>, Json(request): Json<StopRequest>) -> Response {
    if state.registry.stop(request.job_id).await {
        info!(job_id = %request.job_id, "stop requested");
        (StatusCode::OK, Json(json!({ "ok": true }))).into_response()
    } else {
        error_response(StatusCode::NOT_FOUND, "unknown job")
    }
}

async fn health() -> Response {
    (StatusCode::OK, Json(json!({ "status": "ok" }))).into_response()
}

/// Translate a stored event into its wire form: SSE event name is the tag,
/// `id` carries the per-job sequence number, `data` the JSON payload.
fn sse_event(event: Event) -> Result<SseEvent, Infallible> {
    let value = serde_json::to_value(&event.payload).unwrap_or(Value::Null);
    let data = value.get("data").cloned().unwrap_or(Value::Null);
    let sse = SseEvent::default()
        .event(event.payload.name())
        .id(event.seq.to_string());
    Ok(match sse.json_data(&data) {
        Ok(sse) => sse,
        Err(_) => SseEvent::default()
            .event("error")
            .data("event serialization failed"),
    })
}

fn error_response(status: StatusCode, message: &str) -> Response {
    (status, Json(json!({ "error": message }))).into_response()
}

fn cors_layer(origins: &[String]) -> CorsLayer {
    if origins.iter().any(|origin| origin == "*") {
        return CorsLayer::permissive();
    }
    let parsed: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|origin| match origin.parse::<HeaderValue>() {
            Ok(value) => Some(value),
            Err(_) => {
                warn!(origin, "ignoring unparseable CORS origin");
                None
            }
        })
        .collect();
    CorsLayer::new()
        .allow_origin(AllowOrigin::list(parsed))
        .allow_methods(Any)
        .allow_headers(Any)
}

/// Periodically evict expired terminal jobs and their event channels.
fn spawn_sweeper(registry: Arc<JobRegistry>, broker: Arc<EventBroker>) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
        loop {
            ticker.tick().await;
            let expired = registry.sweep(Utc::now()).await;
            for job_id in expired {
                broker.remove(job_id).await;
                info!(%job_id, "evicted expired job");
            }
        }
    });
}

/// Assemble state from configuration.
pub fn build_state(config: &Config) -> AppState {
    let registry = Arc::new(JobRegistry::new(config.job_ttl));
    let broker = Arc::new(EventBroker::default());
    let generator = Arc::new(OpenAiGenerator::new(
        config.api_key.clone(),
        config.model.clone(),
        config.base_url.clone(),
    ));
    let orchestrator = Arc::new(Orchestrator::new(
        Arc::clone(&registry),
        Arc::clone(&broker),
        generator,
        config.retry_policy(),
        config.call_timeout,
        config.pipeline_settings(),
    ));
    AppState {
        registry,
        broker,
        orchestrator,
    }
}

/// Bind and run the HTTP server until ctrl-c.
pub async fn serve(config: Config) -> Result<()> {
    let state = build_state(&config);
    spawn_sweeper(Arc::clone(&state.registry), Arc::clone(&state.broker));

    let app = build_router(state)
        .layer(cors_layer(&config.cors_origins))
        .layer(TraceLayer::new_for_http());

    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .with_context(|| format!("failed to bind to {}", config.bind_addr))?;
    info!(addr = %listener.local_addr()?, "listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    info!("server shut down");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(error) = tokio::signal::ctrl_c().await {
        warn!(%error, "failed to install ctrl-c handler");
        std::future::pending::<()>().await;
    }
    info!("shutdown signal received");
}
