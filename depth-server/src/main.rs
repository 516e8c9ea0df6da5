mod handler;
mod websocket;

use std::sync::Arc;

use axum::routing::{delete, get, post};
use axum::Router;
use depth_core::config::Settings;
use depth_core::inference::{InferenceEngine, SyntheticDepthEstimator};
use depth_core::session::SessionManager;
use tokio::runtime::Builder;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

#[derive(Clone)]
pub struct AppState {
    pub manager: Arc<SessionManager>,
    pub settings: Arc<Settings>,
    pub engine: Arc<InferenceEngine>,
}

fn main() -> anyhow::Result<()> {
    let settings = Arc::new(Settings::from_env());
    depth_core::init(&settings.log_level);

    let rt = Builder::new_multi_thread().enable_all().build()?;
    rt.block_on(run(settings))
}

async fn run(settings: Arc<Settings>) -> anyhow::Result<()> {
    let manager = SessionManager::new(settings.clone());
    manager.clear_cache().await;

    let estimator = Arc::new(SyntheticDepthEstimator);
    let engine = Arc::new(InferenceEngine::new(estimator, settings.inference_worker_count));

    let state = AppState {
        manager,
        settings: settings.clone(),
        engine,
    };

    let cors = build_cors(&state.settings);

    let app = Router::new()
        .route("/api/sessions", post(handler::create_session))
        .route("/api/sessions/:id", delete(handler::delete_session))
        .route("/api/sessions/:id/status", get(handler::session_status))
        .route("/api/sessions/:id/stream", get(websocket::depth_stream))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let addr = "0.0.0.0:8000".parse()?;
    info!(%addr, "depth server listening");
    axum::Server::bind(&addr)
        .serve(app.into_make_service())
        .await?;
    Ok(())
}

fn build_cors(settings: &Settings) -> CorsLayer {
    if settings.cors_origins.is_empty() {
        return CorsLayer::permissive();
    }

    let origins: Vec<_> = settings
        .cors_origins
        .iter()
        .filter_map(|origin| origin.parse().ok())
        .collect();
    CorsLayer::new()
        .allow_origin(AllowOrigin::list(origins))
        .allow_methods(tower_http::cors::Any)
        .allow_headers(tower_http::cors::Any)
}
