//! JSON HTTP API over the engine.
//!
//! A thin caller: every handler maps query parameters onto one engine
//! operation and the result (or [`EngineError`]) onto a JSON response.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET`  | `/health` | Health check (returns version) |
//! | `GET`  | `/api/v1/status` | Per-table materialization status |
//! | `GET`  | `/api/v1/stats` | Store and table sizes |
//! | `GET`  | `/api/v1/tables/{table}` | Table layout, status and row count |
//! | `GET`  | `/api/v1/search?q&limit` | Unified search |
//! | `GET`  | `/api/v1/cage/search?q&limit&offset` | Contractor search |
//! | `GET`  | `/api/v1/cage/location?state&city&country&limit` | Contractors by location |
//! | `GET`  | `/api/v1/cage/stats` | Contractor counts |
//! | `GET`  | `/api/v1/cage/{code}` | Contractor by CAGE code |
//! | `GET`  | `/api/v1/fsg` | Supply groups |
//! | `GET`  | `/api/v1/fsg/{fsg}/fsc` | Classes in a group |
//! | `GET`  | `/api/v1/fsc` | All supply classes |
//! | `GET`  | `/api/v1/fsc/search?q&limit&offset` | Class search |
//! | `GET`  | `/api/v1/fsc/{code}` | Class by code |
//! | `GET`  | `/api/v1/fsc/{code}/nsn?limit&offset` | Stock numbers in a class |
//! | `GET`  | `/api/v1/nsn/search?q&fsc&limit&offset` | Stock number search |
//! | `GET`  | `/api/v1/nsn/{niin}` | Stock number detail |
//! | `GET`  | `/api/v1/nsn/{niin}/management` | Management rows |
//! | `GET`  | `/api/v1/nsn/{niin}/characteristics` | Characteristics rows |
//! | `GET`  | `/api/v1/inc?limit` | Item names by title |
//! | `GET`  | `/api/v1/inc/search?q&limit&offset` | Item name search |
//! | `GET`  | `/api/v1/inc/{code}` | Item name by INC |
//! | `POST` | `/api/v1/admin/materialize/{table}?force` | Start indexing one table |
//! | `POST` | `/api/v1/admin/materialize-all?class&force` | Start indexing a class |
//! | `DELETE` | `/api/v1/admin/tables/{table}` | Drop a table |
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "not_indexed", "message": "table P_CAGE is not indexed" } }
//! ```
//!
//! `not_indexed`, `unavailable` and `busy` are 409; `query_error` is 400;
//! `not_found` is 404; `ingest_error` and `internal` are 500.
//!
//! Materialization endpoints answer 202 immediately; progress is visible
//! through `/api/v1/status`.

use axum::{
    extract::{rejection::QueryRejection, FromRequestParts, Path, Query, State},
    http::{request::Parts, StatusCode},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};

use crate::engine::{parse_class_selector, Engine, TableInfo, TableStatus};
use crate::error::EngineError;
use crate::models::Record;
use crate::search::UnifiedSearch;
use crate::services::{CageStats, LocationFilter, NsnDetail, SupplyGroup};
use crate::store::{MaterializeOptions, StoreStats};

type AppState = Arc<Engine>;
type ApiResult<T> = Result<Json<T>, AppError>;

/// Builds the router. Exposed so tests can serve it on an ephemeral port.
pub fn router(engine: Arc<Engine>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(handle_health))
        .route("/api/v1/status", get(handle_status))
        .route("/api/v1/stats", get(handle_stats))
        .route("/api/v1/tables/{table}", get(handle_table_info))
        .route("/api/v1/search", get(handle_search))
        .route("/api/v1/cage/search", get(handle_cage_search))
        .route("/api/v1/cage/location", get(handle_cage_location))
        .route("/api/v1/cage/stats", get(handle_cage_stats))
        .route("/api/v1/cage/{code}", get(handle_cage_get))
        .route("/api/v1/fsg", get(handle_fsg_list))
        .route("/api/v1/fsg/{fsg}/fsc", get(handle_fsg_classes))
        .route("/api/v1/fsc", get(handle_fsc_list))
        .route("/api/v1/fsc/search", get(handle_fsc_search))
        .route("/api/v1/fsc/{code}", get(handle_fsc_get))
        .route("/api/v1/fsc/{code}/nsn", get(handle_fsc_nsn))
        .route("/api/v1/nsn/search", get(handle_nsn_search))
        .route("/api/v1/nsn/{niin}", get(handle_nsn_get))
        .route("/api/v1/nsn/{niin}/management", get(handle_nsn_management))
        .route("/api/v1/nsn/{niin}/characteristics", get(handle_nsn_characteristics))
        .route("/api/v1/inc", get(handle_inc_list))
        .route("/api/v1/inc/search", get(handle_inc_search))
        .route("/api/v1/inc/{code}", get(handle_inc_get))
        .route("/api/v1/admin/materialize/{table}", post(handle_materialize))
        .route("/api/v1/admin/materialize-all", post(handle_materialize_all))
        .route("/api/v1/admin/tables/{table}", delete(handle_drop_table))
        .layer(cors)
        .with_state(engine)
}

/// Serves the API on `bind` until Ctrl-C, then aborts background
/// ingestions and closes the store.
pub async fn run_server(engine: Arc<Engine>, bind: &str) -> anyhow::Result<()> {
    let app = router(Arc::clone(&engine));
    let listener = tokio::net::TcpListener::bind(bind).await?;
    tracing::info!(bind = %bind, "http server listening");
    println!("PubLog API listening on http://{}", bind);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::warn!(error = %e, "cannot listen for shutdown signal");
                std::future::pending::<()>().await;
            }
        })
        .await?;

    tracing::info!("shutting down");
    engine.shutdown().await;
    Ok(())
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

struct AppError {
    status: StatusCode,
    code: String,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code,
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

impl From<EngineError> for AppError {
    fn from(err: EngineError) -> Self {
        let status = match &err {
            EngineError::NotIndexed { .. }
            | EngineError::Unavailable { .. }
            | EngineError::Busy { .. } => StatusCode::CONFLICT,
            EngineError::Query(_) => StatusCode::BAD_REQUEST,
            EngineError::UnknownTable(_) => StatusCode::NOT_FOUND,
            EngineError::Ingest { .. } | EngineError::Store(_) => {
                tracing::warn!(error = %err, "request failed");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        AppError {
            status,
            code: err.code().to_string(),
            message: err.to_string(),
        }
    }
}

impl From<QueryRejection> for AppError {
    fn from(rejection: QueryRejection) -> Self {
        AppError {
            status: StatusCode::BAD_REQUEST,
            code: "query_error".to_string(),
            message: rejection.body_text(),
        }
    }
}

fn not_found(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::NOT_FOUND,
        code: "not_found".to_string(),
        message: message.into(),
    }
}

fn found<T>(value: Option<T>, what: &str, key: &str) -> ApiResult<T> {
    value
        .map(Json)
        .ok_or_else(|| not_found(format!("{} {} not found", what, key)))
}

// ============ Parameters ============

/// Query-string extractor whose rejection uses the JSON error contract.
struct ApiQuery<T>(T);

impl<T, S> FromRequestParts<S> for ApiQuery<T>
where
    T: DeserializeOwned,
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let Query(value) = Query::<T>::try_from_uri(&parts.uri)?;
        Ok(ApiQuery(value))
    }
}

#[derive(Debug, Default, Deserialize)]
struct SearchParams {
    q: Option<String>,
    limit: Option<u32>,
    offset: Option<u64>,
    fsc: Option<String>,
}

impl SearchParams {
    fn text(&self) -> &str {
        self.q.as_deref().unwrap_or("")
    }
}

#[derive(Debug, Default, Deserialize)]
struct PageParams {
    limit: Option<u32>,
    offset: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct LocationParams {
    state: Option<String>,
    city: Option<String>,
    country: Option<String>,
    limit: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
struct MaterializeParams {
    class: Option<String>,
    #[serde(default)]
    force: bool,
}

#[derive(Serialize)]
struct Scheduled {
    status: &'static str,
    tables: Vec<String>,
}

// ============ Handlers ============

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

async fn handle_status(State(engine): State<AppState>) -> Json<Vec<TableStatus>> {
    Json(engine.status())
}

async fn handle_stats(State(engine): State<AppState>) -> ApiResult<StoreStats> {
    Ok(Json(engine.stats().await?))
}

async fn handle_table_info(
    State(engine): State<AppState>,
    Path(table): Path<String>,
) -> ApiResult<TableInfo> {
    Ok(Json(engine.table_info(&table).await?))
}

async fn handle_search(
    State(engine): State<AppState>,
    ApiQuery(params): ApiQuery<SearchParams>,
) -> ApiResult<UnifiedSearch> {
    let limit = params.limit.unwrap_or(engine.default_limit());
    Ok(Json(engine.search(params.text(), limit).await?))
}

async fn handle_cage_search(
    State(engine): State<AppState>,
    ApiQuery(params): ApiQuery<SearchParams>,
) -> ApiResult<Vec<Record>> {
    let limit = params.limit.unwrap_or(engine.default_limit());
    let rows = engine
        .cage()
        .search(params.text(), limit, params.offset.unwrap_or(0))
        .await?;
    Ok(Json(rows))
}

async fn handle_cage_location(
    State(engine): State<AppState>,
    ApiQuery(params): ApiQuery<LocationParams>,
) -> ApiResult<Vec<Record>> {
    let limit = params.limit.unwrap_or(engine.default_limit());
    let filter = LocationFilter {
        state: params.state,
        city: params.city,
        country: params.country,
    };
    Ok(Json(engine.cage().search_by_location(&filter, limit).await?))
}

async fn handle_cage_stats(State(engine): State<AppState>) -> ApiResult<CageStats> {
    Ok(Json(engine.cage().stats().await?))
}

async fn handle_cage_get(
    State(engine): State<AppState>,
    Path(code): Path<String>,
) -> ApiResult<Record> {
    found(engine.cage().get_by_code(&code).await?, "CAGE", &code)
}

async fn handle_fsg_list(State(engine): State<AppState>) -> ApiResult<Vec<SupplyGroup>> {
    Ok(Json(engine.fsc().list_groups().await?))
}

async fn handle_fsg_classes(
    State(engine): State<AppState>,
    Path(fsg): Path<String>,
) -> ApiResult<Vec<Record>> {
    Ok(Json(engine.fsc().classes_in_group(&fsg).await?))
}

async fn handle_fsc_list(State(engine): State<AppState>) -> ApiResult<Vec<Record>> {
    Ok(Json(engine.fsc().list_classes().await?))
}

async fn handle_fsc_search(
    State(engine): State<AppState>,
    ApiQuery(params): ApiQuery<SearchParams>,
) -> ApiResult<Vec<Record>> {
    let limit = params.limit.unwrap_or(engine.default_limit());
    let rows = engine
        .fsc()
        .search(params.text(), limit, params.offset.unwrap_or(0))
        .await?;
    Ok(Json(rows))
}

async fn handle_fsc_get(
    State(engine): State<AppState>,
    Path(code): Path<String>,
) -> ApiResult<Record> {
    found(engine.fsc().get_class(&code).await?, "FSC", &code)
}

async fn handle_fsc_nsn(
    State(engine): State<AppState>,
    Path(code): Path<String>,
    ApiQuery(params): ApiQuery<PageParams>,
) -> ApiResult<Vec<Record>> {
    let limit = params.limit.unwrap_or(engine.default_limit());
    let rows = engine
        .nsn()
        .by_fsc(&code, limit, params.offset.unwrap_or(0))
        .await?;
    Ok(Json(rows))
}

async fn handle_nsn_search(
    State(engine): State<AppState>,
    ApiQuery(params): ApiQuery<SearchParams>,
) -> ApiResult<Vec<Record>> {
    let limit = params.limit.unwrap_or(engine.default_limit());
    let rows = engine
        .nsn()
        .search(
            params.text(),
            params.fsc.as_deref(),
            limit,
            params.offset.unwrap_or(0),
        )
        .await?;
    Ok(Json(rows))
}

async fn handle_nsn_get(
    State(engine): State<AppState>,
    Path(niin): Path<String>,
) -> ApiResult<NsnDetail> {
    found(engine.nsn().detail(&niin).await?, "NIIN", &niin)
}

async fn handle_nsn_management(
    State(engine): State<AppState>,
    Path(niin): Path<String>,
) -> ApiResult<Vec<Record>> {
    Ok(Json(engine.nsn().management(&niin).await?))
}

async fn handle_nsn_characteristics(
    State(engine): State<AppState>,
    Path(niin): Path<String>,
) -> ApiResult<Vec<Record>> {
    Ok(Json(engine.nsn().characteristics(&niin).await?))
}

async fn handle_inc_list(
    State(engine): State<AppState>,
    ApiQuery(params): ApiQuery<PageParams>,
) -> ApiResult<Vec<Record>> {
    let limit = params.limit.unwrap_or(engine.store().max_limit());
    Ok(Json(engine.item_names().list_all(limit).await?))
}

async fn handle_inc_search(
    State(engine): State<AppState>,
    ApiQuery(params): ApiQuery<SearchParams>,
) -> ApiResult<Vec<Record>> {
    let limit = params.limit.unwrap_or(engine.default_limit());
    let rows = engine
        .item_names()
        .search(params.text(), limit, params.offset.unwrap_or(0))
        .await?;
    Ok(Json(rows))
}

async fn handle_inc_get(
    State(engine): State<AppState>,
    Path(code): Path<String>,
) -> ApiResult<Record> {
    found(engine.item_names().get_by_inc(&code).await?, "INC", &code)
}

async fn handle_materialize(
    State(engine): State<AppState>,
    Path(table): Path<String>,
    ApiQuery(params): ApiQuery<MaterializeParams>,
) -> Result<(StatusCode, Json<Scheduled>), AppError> {
    let name = engine.trigger_materialize(&table, MaterializeOptions { force: params.force })?;
    Ok((
        StatusCode::ACCEPTED,
        Json(Scheduled {
            status: "scheduled",
            tables: vec![name],
        }),
    ))
}

async fn handle_materialize_all(
    State(engine): State<AppState>,
    ApiQuery(params): ApiQuery<MaterializeParams>,
) -> Result<(StatusCode, Json<Scheduled>), AppError> {
    let class = parse_class_selector(params.class.as_deref().unwrap_or("all"))?;
    let tables = engine.trigger_materialize_all(class, MaterializeOptions { force: params.force });
    Ok((
        StatusCode::ACCEPTED,
        Json(Scheduled {
            status: "scheduled",
            tables,
        }),
    ))
}

async fn handle_drop_table(
    State(engine): State<AppState>,
    Path(table): Path<String>,
) -> Result<StatusCode, AppError> {
    engine.drop_table(&table).await?;
    Ok(StatusCode::NO_CONTENT)
}
