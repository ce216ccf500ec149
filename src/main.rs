use axum::{
    extract::State,
    http::StatusCode,
    response::Json,
    routing::{get, post},
    Router,
};
use clap::Parser;
use giftrec::{init_tracing, AppState, Config, PersonalizedRequest, PopularItemsRequest, RecError, RecommendationResponse};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[arg(short, long, default_value = "config/default.toml")]
    config: String,

    #[arg(short, long, default_value = "info")]
    log_level: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct ApiResponse<T> {
    success: bool,
    data: Option<T>,
    message: String,
}

impl<T> ApiResponse<T> {
    fn success(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            message: "Success".to_string(),
        }
    }

    fn error(message: String) -> Self {
        Self {
            success: false,
            data: None,
            message,
        }
    }
}

type ApiResult<T> = Result<Json<ApiResponse<T>>, (StatusCode, Json<ApiResponse<()>>)>;

fn api_error(e: RecError) -> (StatusCode, Json<ApiResponse<()>>) {
    let status = match e {
        RecError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
        _ if e.is_store_unavailable() => {
            tracing::error!("Store unavailable while serving recommendations: {}", e);
            StatusCode::SERVICE_UNAVAILABLE
        }
        _ => {
            tracing::error!("Failed to serve recommendations: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR
        }
    };
    (status, Json(ApiResponse::error(e.to_string())))
}

async fn health_check() -> Json<ApiResponse<HashMap<String, String>>> {
    let mut status = HashMap::new();
    status.insert("status".to_string(), "healthy".to_string());
    status.insert("service".to_string(), "giftrec".to_string());
    status.insert("version".to_string(), env!("CARGO_PKG_VERSION").to_string());

    Json(ApiResponse::success(status))
}

async fn popular_items(
    State(state): State<AppState>,
    Json(request): Json<PopularItemsRequest>,
) -> ApiResult<RecommendationResponse> {
    state
        .serving
        .popular_items(request)
        .await
        .map(|response| Json(ApiResponse::success(response)))
        .map_err(api_error)
}

async fn personalized_items(
    State(state): State<AppState>,
    Json(request): Json<PersonalizedRequest>,
) -> ApiResult<RecommendationResponse> {
    state
        .serving
        .personalized_items(request)
        .await
        .map(|response| Json(ApiResponse::success(response)))
        .map_err(api_error)
}

async fn serving_stats(State(state): State<AppState>) -> Json<ApiResponse<HashMap<String, u64>>> {
    Json(ApiResponse::success(state.serving.get_serving_stats()))
}

fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/popular", post(popular_items))
        .route("/recommendations", post(personalized_items))
        .route("/stats", get(serving_stats))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive()),
        )
        .with_state(state)
}

async fn serve(config: Config) -> anyhow::Result<()> {
    let addr = config.server.socket_addr()?;
    let state = AppState::new(config).await?;
    let app = create_router(state);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("Server listening on {}", addr);

    axum::serve(listener, app).await?;

    Ok(())
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    std::env::set_var("RUST_LOG", &args.log_level);
    let config = Config::load_or_default(&args.config)?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(config.server.workers.max(1))
        .enable_all()
        .build()?;

    runtime.block_on(async {
        init_tracing().await;
        info!("Starting giftrec server with config: {:?}", config.server);
        serve(config).await
    })
}
