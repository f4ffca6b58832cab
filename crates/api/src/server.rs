use anyhow::Context;
use axum::{
    extract::{
        rejection::{PathRejection, QueryRejection},
        Path, Query, State,
    },
    http::StatusCode,
    routing::get,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::{sync::Arc, time::Duration};
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tracing::{error, info, warn};

use inferwatch_indexer::service::{
    EpochRewardTotal, EpochStats, ModelScope, ModelsOverview, ParticipantDetail,
    ParticipantInferences, Timeline,
};
use inferwatch_indexer::{spawn_pollers, Config, ReadService, ServiceError, SyncEngine};

#[derive(Clone)]
struct AppState {
    service: Arc<ReadService>,
}

/// Build the API router over a read service.
pub fn router(service: Arc<ReadService>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/v1/inference/current", get(get_current_epoch))
        .route("/v1/inference/epochs/:epoch_id", get(get_epoch))
        .route("/v1/participants/:participant_id", get(get_participant))
        .route(
            "/v1/participants/:participant_id/inferences",
            get(get_participant_inferences),
        )
        .route("/v1/epochs/:epoch_id/total-rewards", get(get_epoch_total_rewards))
        .route("/v1/timeline", get(get_timeline))
        .route("/v1/models/current", get(get_current_models))
        .route("/v1/models/epochs/:epoch_id", get(get_epoch_models))
        .layer(CorsLayer::permissive())
        .with_state(AppState { service })
}

/// Run the API server (and, when configured, the pollers) until shutdown.
pub async fn run_with_config(config: Config) -> anyhow::Result<()> {
    let engine = Arc::new(SyncEngine::connect(&config).await?);

    let token = CancellationToken::new();
    let pollers = if config.api.run_pollers {
        spawn_pollers(Arc::clone(&engine), token.clone())
    } else {
        info!("Pollers disabled; serving from cache and inline fallback only");
        Vec::new()
    };

    let service = Arc::new(ReadService::new(
        Arc::clone(&engine),
        Duration::from_secs(config.api.current_epoch_max_age_secs),
    ));
    let app = router(service);

    let listener = tokio::net::TcpListener::bind(&config.api.bind_address)
        .await
        .with_context(|| format!("Failed to bind {}", config.api.bind_address))?;
    info!("inferwatch API server listening on {}", config.api.bind_address);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    token.cancel();
    for handle in pollers {
        if let Err(e) = handle.await {
            warn!("Poller task ended abnormally: {}", e);
        }
    }
    engine.storage().close().await;
    info!("inferwatch API server shutdown complete");
    Ok(())
}

/// Run the API server from a configuration file.
pub async fn run_from_file(path: &str) -> anyhow::Result<()> {
    let config = Config::from_file(path).context("Failed to load configuration")?;
    run_with_config(config).await
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", err);
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(err) => {
                error!("Failed to install SIGTERM handler: {}", err);
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received");
}

const ERROR_CODE_NOT_FOUND: &str = "not_found";
const ERROR_CODE_INVALID_REQUEST: &str = "invalid_request";
const ERROR_CODE_UPSTREAM_UNAVAILABLE: &str = "upstream_unavailable";
const ERROR_CODE_INTERNAL_ERROR: &str = "internal_error";

#[derive(Serialize)]
struct ErrorResponse {
    error: ErrorInfo,
}

#[derive(Serialize)]
struct ErrorInfo {
    code: &'static str,
    message: String,
}

type ApiError = (StatusCode, Json<ErrorResponse>);
type ApiResult<T> = Result<Json<T>, ApiError>;

fn api_error(status: StatusCode, code: &'static str, message: impl Into<String>) -> ApiError {
    (
        status,
        Json(ErrorResponse {
            error: ErrorInfo {
                code,
                message: message.into(),
            },
        }),
    )
}

fn bad_request(msg: impl Into<String>) -> ApiError {
    api_error(StatusCode::BAD_REQUEST, ERROR_CODE_INVALID_REQUEST, msg)
}

fn service_error(err: ServiceError) -> ApiError {
    match err {
        ServiceError::NotFound(msg) => api_error(StatusCode::NOT_FOUND, ERROR_CODE_NOT_FOUND, msg),
        ServiceError::InvalidRequest(msg) => bad_request(msg),
        ServiceError::Upstream(e) => {
            warn!("Upstream failure: {:#}", e);
            api_error(
                StatusCode::BAD_GATEWAY,
                ERROR_CODE_UPSTREAM_UNAVAILABLE,
                format!("Upstream unavailable: {:#}", e),
            )
        }
        ServiceError::Storage(e) => {
            error!("Storage failure: {:#}", e);
            api_error(
                StatusCode::INTERNAL_SERVER_ERROR,
                ERROR_CODE_INTERNAL_ERROR,
                format!("Internal error: {:#}", e),
            )
        }
    }
}

fn positive(name: &str, value: u64) -> Result<u64, ApiError> {
    if value < 1 {
        return Err(bad_request(format!("{} must be >= 1", name)));
    }
    Ok(value)
}

fn positive_opt(name: &str, value: Option<u64>) -> Result<Option<u64>, ApiError> {
    value.map(|v| positive(name, v)).transpose()
}

fn path_u64(path: Result<Path<u64>, PathRejection>, name: &str) -> Result<u64, ApiError> {
    let Path(value) = path.map_err(|e| bad_request(format!("Invalid {}: {}", name, e)))?;
    positive(name, value)
}

fn query<T>(query: Result<Query<T>, QueryRejection>) -> Result<T, ApiError> {
    query
        .map(|Query(q)| q)
        .map_err(|e| bad_request(format!("Invalid query: {}", e)))
}

#[derive(Debug, Default, Deserialize)]
struct ReloadQuery {
    #[serde(default)]
    reload: bool,
}

#[derive(Debug, Default, Deserialize)]
struct HeightQuery {
    height: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct EpochHeightQuery {
    epoch_id: Option<u64>,
    height: Option<u64>,
}

async fn health() -> &'static str {
    "OK"
}

async fn get_current_epoch(
    State(state): State<AppState>,
    params: Result<Query<ReloadQuery>, QueryRejection>,
) -> ApiResult<EpochStats> {
    let params = query(params)?;
    state
        .service
        .current_epoch_stats(params.reload)
        .await
        .map(Json)
        .map_err(service_error)
}

async fn get_epoch(
    State(state): State<AppState>,
    epoch_id: Result<Path<u64>, PathRejection>,
    params: Result<Query<HeightQuery>, QueryRejection>,
) -> ApiResult<EpochStats> {
    let epoch_id = path_u64(epoch_id, "epoch_id")?;
    let height = positive_opt("height", query(params)?.height)?;
    state
        .service
        .epoch_stats(epoch_id, height)
        .await
        .map(Json)
        .map_err(service_error)
}

async fn get_participant(
    State(state): State<AppState>,
    Path(participant_id): Path<String>,
    params: Result<Query<EpochHeightQuery>, QueryRejection>,
) -> ApiResult<ParticipantDetail> {
    let params = query(params)?;
    let epoch_id = params
        .epoch_id
        .ok_or_else(|| bad_request("epoch_id is required"))?;
    let epoch_id = positive("epoch_id", epoch_id)?;
    let height = positive_opt("height", params.height)?;
    state
        .service
        .participant_detail(&participant_id, epoch_id, height)
        .await
        .map(Json)
        .map_err(service_error)
}

async fn get_participant_inferences(
    State(state): State<AppState>,
    Path(participant_id): Path<String>,
    params: Result<Query<EpochHeightQuery>, QueryRejection>,
) -> ApiResult<ParticipantInferences> {
    let epoch_id = query(params)?
        .epoch_id
        .ok_or_else(|| bad_request("epoch_id is required"))?;
    let epoch_id = positive("epoch_id", epoch_id)?;
    state
        .service
        .participant_inferences(&participant_id, epoch_id)
        .await
        .map(Json)
        .map_err(service_error)
}

async fn get_epoch_total_rewards(
    State(state): State<AppState>,
    epoch_id: Result<Path<u64>, PathRejection>,
) -> ApiResult<EpochRewardTotal> {
    let epoch_id = path_u64(epoch_id, "epoch_id")?;
    state
        .service
        .epoch_reward_total(epoch_id)
        .await
        .map(Json)
        .map_err(service_error)
}

async fn get_timeline(State(state): State<AppState>) -> ApiResult<Timeline> {
    state
        .service
        .timeline()
        .await
        .map(Json)
        .map_err(service_error)
}

async fn get_current_models(State(state): State<AppState>) -> ApiResult<ModelsOverview> {
    state
        .service
        .models(ModelScope::Current)
        .await
        .map(Json)
        .map_err(service_error)
}

async fn get_epoch_models(
    State(state): State<AppState>,
    epoch_id: Result<Path<u64>, PathRejection>,
    params: Result<Query<HeightQuery>, QueryRejection>,
) -> ApiResult<ModelsOverview> {
    let epoch_id = path_u64(epoch_id, "epoch_id")?;
    let height = positive_opt("height", query(params)?.height)?;
    state
        .service
        .models(ModelScope::Epoch { epoch_id, height })
        .await
        .map(Json)
        .map_err(service_error)
}
