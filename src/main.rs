#![allow(clippy::multiple_crate_versions)]

use std::sync::{Arc, Mutex};

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use treasury_dashboard::config::{AppConfig, ConfigError};
use treasury_dashboard::db::{self, DbError};
use treasury_dashboard::query_builder::catalog::ColumnTypeCache;
use treasury_dashboard::query_builder::filter::NumericBinding;
use treasury_dashboard::query_builder::QueryError;
use treasury_dashboard::query_spec::QuerySpec;
use treasury_dashboard::service::{FacetRequest, FacetResponse, QueryResult, QueryService, TableSchema};

#[derive(Clone)]
struct AppState {
    db: Arc<Mutex<rusqlite::Connection>>,
    cache: Arc<ColumnTypeCache>,
    numeric_binding: NumericBinding,
}

#[derive(Debug, thiserror::Error)]
enum AppError {
    #[error("config error: {0}")]
    Config(#[from] ConfigError),
    #[error("db error: {0}")]
    Db(#[from] DbError),
    #[error("{0}")]
    Query(#[from] QueryError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("task join error")]
    Join,
    #[error("db lock error")]
    Lock,
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

impl AppError {
    fn status(&self) -> StatusCode {
        match self {
            Self::Query(QueryError::UnknownCustomTable(_)) => StatusCode::NOT_FOUND,
            Self::Query(err) if err.is_client_error() => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> axum::response::Response {
        let status = self.status();
        if status.is_server_error() {
            error!("{}", self);
        } else {
            warn!(%status, "{}", self);
        }
        (
            status,
            Json(ErrorResponse {
                error: self.to_string(),
            }),
        )
            .into_response()
    }
}

#[tokio::main]
async fn main() -> Result<(), AppError> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config = AppConfig::from_env()?;

    let db_init = db::init_db(&config)?;
    info!("Database path: {:?}", db_init.path);
    if db_init.seeded {
        info!("Database seeded on startup");
    }

    let state = AppState {
        db: Arc::new(Mutex::new(db_init.connection)),
        cache: Arc::new(ColumnTypeCache::new()),
        numeric_binding: config.numeric_binding,
    };

    let app = Router::new()
        .route("/api/health", get(health_handler))
        .route("/api/query", post(query_handler))
        .route("/api/query/facets", post(facets_handler))
        .route("/api/query/schema", get(schema_handler))
        .route("/api/custom-tables/:name/schema", get(custom_table_schema_handler))
        .nest_service("/static", ServeDir::new(&config.static_dir))
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(config.bind_addr).await?;
    info!("Listening on http://{}", config.bind_addr);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        error!("failed to listen for shutdown signal: {err}");
    }
    info!("Shutting down");
}

async fn health_handler() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

async fn query_handler(
    State(state): State<AppState>,
    Json(spec): Json<QuerySpec>,
) -> Result<Json<QueryResult>, AppError> {
    let binding = state.numeric_binding;
    let cache = state.cache.clone();
    let result = with_db(state, move |conn| {
        Ok(QueryService::new(conn, &cache, binding).run(&spec)?)
    })
    .await?;
    Ok(Json(result))
}

async fn facets_handler(
    State(state): State<AppState>,
    Json(request): Json<FacetRequest>,
) -> Result<Json<FacetResponse>, AppError> {
    let binding = state.numeric_binding;
    let cache = state.cache.clone();
    let facets = with_db(state, move |conn| {
        Ok(QueryService::new(conn, &cache, binding).facets(&request)?)
    })
    .await?;
    Ok(Json(facets))
}

#[derive(Serialize)]
struct SchemaResponse {
    tables: Vec<TableSchema>,
}

async fn schema_handler(State(state): State<AppState>) -> Result<Json<SchemaResponse>, AppError> {
    let binding = state.numeric_binding;
    let cache = state.cache.clone();
    let tables = with_db(state, move |conn| {
        Ok(QueryService::new(conn, &cache, binding).schema()?)
    })
    .await?;
    Ok(Json(SchemaResponse { tables }))
}

async fn custom_table_schema_handler(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<TableSchema>, AppError> {
    let binding = state.numeric_binding;
    let cache = state.cache.clone();
    let schema = with_db(state, move |conn| {
        Ok(QueryService::new(conn, &cache, binding).custom_table_schema(&name)?)
    })
    .await?;
    Ok(Json(schema))
}

async fn with_db<T, F>(state: AppState, func: F) -> Result<T, AppError>
where
    T: Send + 'static,
    F: FnOnce(&rusqlite::Connection) -> Result<T, AppError> + Send + 'static,
{
    let db = state.db.clone();
    tokio::task::spawn_blocking(move || {
        let guard = db.lock().map_err(|_| AppError::Lock)?;
        func(&guard)
    })
    .await
    .map_err(|_| AppError::Join)?
}
