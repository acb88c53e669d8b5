//! HTTP API server implementation

use axum::{
    extract::{
        rejection::{PathRejection, QueryRejection},
        Path, Query, State,
    },
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::get,
    Router,
};
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::cors::{Any as CorsAny, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};
use utoipa::{IntoParams, OpenApi, ToSchema};

use crate::core::client::AsyncTranslator;
use crate::core::errors::TranslationError;
use crate::core::models::{Direction, TranslationRequest};

/// Application state
#[derive(Clone)]
pub struct AppState {
    translator: AsyncTranslator,
}

impl AppState {
    /// State around a translator
    pub fn new(translator: AsyncTranslator) -> Self {
        Self { translator }
    }
}

/// Every JSON body this API returns, success or failure
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct DetailResponse {
    /// Translation or error message
    pub detail: String,
}

impl DetailResponse {
    fn new(detail: impl Into<String>) -> Self {
        Self {
            detail: detail.into(),
        }
    }
}

/// Health check response
#[derive(Debug, Serialize, ToSchema)]
pub struct HealthResponse {
    status: String,
    service: String,
    version: String,
    model_loaded: bool,
}

/// Query string of the translation endpoint
#[derive(Debug, Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct TranslationQuery {
    /// Target language: `russian` or `nanai`
    pub direction: Option<String>,
    /// Upper bound on generated tokens
    pub max_length: Option<usize>,
    /// 1 for the canonical translation, higher for alternatives
    pub attempt: Option<u32>,
}

/// Failures of a request, mapped to status codes at the boundary
#[derive(Debug)]
pub enum ApiError {
    /// Malformed path or query (400)
    BadRequest(String),
    /// Model produced nothing (404)
    EmptyTranslation,
    /// Failure from the translator, mapped by kind
    Translation(TranslationError),
}

impl From<TranslationError> for ApiError {
    fn from(err: TranslationError) -> Self {
        ApiError::Translation(err)
    }
}

fn internal_error() -> (StatusCode, Json<DetailResponse>) {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(DetailResponse::new("Internal Server Error")),
    )
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::BadRequest(message) => {
                (StatusCode::BAD_REQUEST, Json(DetailResponse::new(message))).into_response()
            }
            ApiError::EmptyTranslation => {
                (StatusCode::NOT_FOUND, Json(DetailResponse::new("Failed to translate"))).into_response()
            }
            ApiError::Translation(TranslationError::InvalidInput { message }) => {
                (StatusCode::BAD_REQUEST, Json(DetailResponse::new(message))).into_response()
            }
            ApiError::Translation(TranslationError::TimeoutError) => (
                StatusCode::GATEWAY_TIMEOUT,
                Json(DetailResponse::new("Translation timed out")),
            )
                .into_response(),
            ApiError::Translation(TranslationError::Cancelled) => {
                debug!("Client went away before the translation finished");
                internal_error().into_response()
            }
            ApiError::Translation(err) => {
                error!("Translation failed: {}", err);
                internal_error().into_response()
            }
        }
    }
}

/// Translate `text` into the language named by `direction`
#[utoipa::path(
    get,
    path = "/translation/{text}",
    tag = "translation",
    params(
        ("text" = String, Path, description = "Text to translate"),
        TranslationQuery
    ),
    responses(
        (status = 200, description = "Translated text", body = DetailResponse),
        (status = 400, description = "Missing or invalid parameters", body = DetailResponse),
        (status = 404, description = "Model produced no translation", body = DetailResponse),
        (status = 500, description = "Internal error", body = DetailResponse),
        (status = 504, description = "Generation exceeded its time budget", body = DetailResponse)
    )
)]
async fn translate(
    State(state): State<Arc<AppState>>,
    text: Result<Path<String>, PathRejection>,
    query: Result<Query<TranslationQuery>, QueryRejection>,
) -> Result<Json<DetailResponse>, ApiError> {
    let Path(text) = text.map_err(|e| ApiError::BadRequest(e.body_text()))?;
    let Query(query) = query.map_err(|e| ApiError::BadRequest(e.body_text()))?;

    let direction: Direction = query
        .direction
        .as_deref()
        .ok_or_else(|| ApiError::BadRequest("Missing query parameter 'direction'".to_string()))?
        .parse()?;

    let mut request = TranslationRequest::new(text, direction).with_attempt(query.attempt.unwrap_or(1));
    if let Some(max_length) = query.max_length {
        request = request.with_max_length(max_length);
    }

    let translation = state.translator.translate(request).await?;

    if translation.is_empty() {
        warn!("Empty translation to {}", direction);
        return Err(ApiError::EmptyTranslation);
    }

    Ok(Json(DetailResponse::new(translation)))
}

/// Health check handler
#[utoipa::path(
    get,
    path = "/health",
    tag = "service",
    responses((status = 200, description = "Service is up", body = HealthResponse))
)]
async fn health_check(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        service: crate::NAME.to_string(),
        version: crate::VERSION.to_string(),
        model_loaded: state.translator.is_ready(),
    })
}

async fn openapi_json() -> Json<utoipa::openapi::OpenApi> {
    Json(ApiDoc::openapi())
}

async fn not_found() -> (StatusCode, Json<DetailResponse>) {
    (StatusCode::NOT_FOUND, Json(DetailResponse::new("Not Found")))
}

fn handle_panic(err: Box<dyn Any + Send + 'static>) -> Response {
    let message = err
        .downcast_ref::<String>()
        .map(String::as_str)
        .or_else(|| err.downcast_ref::<&str>().copied())
        .unwrap_or("unknown panic");
    error!("Request handler panicked: {}", message);
    internal_error().into_response()
}

/// OpenAPI document of the service
#[derive(OpenApi)]
#[openapi(
    paths(translate, health_check),
    components(schemas(DetailResponse, HealthResponse, Direction)),
    tags(
        (name = "translation", description = "Russian and Nanai translation"),
        (name = "service", description = "Service status")
    )
)]
pub struct ApiDoc;

/// Build the application router
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(health_check))
        .route("/health", get(health_check))
        .route("/translation/:text", get(translate))
        .route("/api-docs/openapi.json", get(openapi_json))
        .fallback(not_found)
        .with_state(Arc::new(state))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::new().allow_origin(CorsAny).allow_methods(CorsAny).allow_headers(CorsAny))
        .layer(CatchPanicLayer::custom(handle_panic))
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutting down");
}

/// Run the HTTP server
pub async fn run_server(translator: AsyncTranslator, host: String, port: u16) -> anyhow::Result<()> {
    let app = router(AppState::new(translator));

    // Bind address
    let addr: SocketAddr = format!("{}:{}", host, port).parse()?;

    info!("Starting server on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::errors::Result;
    use crate::core::generation::GenerationBudget;
    use crate::core::lazy::ServiceCell;
    use crate::core::service::Translate;
    use assert_json_diff::assert_json_eq;
    use axum::body::Body;
    use axum::http::Request;
    use serde_json::{json, Value};
    use std::sync::Mutex;
    use tower::ServiceExt;

    /// Returns a fixed reply and records what it was asked
    struct Fixed {
        reply: std::result::Result<String, fn() -> TranslationError>,
        seen: Mutex<Vec<TranslationRequest>>,
    }

    impl Fixed {
        fn reply(text: &str) -> Arc<Self> {
            Arc::new(Self {
                reply: Ok(text.to_string()),
                seen: Mutex::new(Vec::new()),
            })
        }

        fn failing(err: fn() -> TranslationError) -> Arc<Self> {
            Arc::new(Self {
                reply: Err(err),
                seen: Mutex::new(Vec::new()),
            })
        }
    }

    impl Translate for Fixed {
        fn translate(&self, request: &TranslationRequest, _budget: &GenerationBudget) -> Result<String> {
            self.seen.lock().unwrap().push(request.clone());
            match &self.reply {
                Ok(text) => Ok(text.clone()),
                Err(make) => Err(make()),
            }
        }
    }

    struct Panicking;

    impl Translate for Panicking {
        fn translate(&self, _request: &TranslationRequest, _budget: &GenerationBudget) -> Result<String> {
            panic!("decoder state corrupted");
        }
    }

    fn app(service: Arc<dyn Translate>) -> Router {
        let translator = AsyncTranslator::new(Arc::new(ServiceCell::ready(service)), 1, None);
        router(AppState::new(translator))
    }

    async fn get(app: Router, uri: &str) -> (StatusCode, Value) {
        let response = app
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn test_empty_translation_is_not_found() {
        let (status, body) = get(app(Fixed::reply("")), "/translation/hello?direction=russian").await;

        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_json_eq!(body, json!({"detail": "Failed to translate"}));
    }

    #[tokio::test]
    async fn test_translation_is_returned_in_detail() {
        let stub = Fixed::reply("привет");
        let (status, body) = get(app(stub.clone()), "/translation/hello?direction=russian").await;

        assert_eq!(status, StatusCode::OK);
        assert_json_eq!(body, json!({"detail": "привет"}));

        let seen = stub.seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].text, "hello");
        assert_eq!(seen[0].direction, Direction::Russian);
        assert_eq!(seen[0].attempt, 1);
    }

    #[tokio::test]
    async fn test_path_and_query_are_decoded() {
        let stub = Fixed::reply("сэвэн");
        let (status, _) = get(
            app(stub.clone()),
            "/translation/%D0%B4%D1%83%D1%85%20%D0%BB%D0%B5%D1%81%D0%B0?direction=nanai&max_length=64&attempt=3",
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        let seen = stub.seen.lock().unwrap();
        assert_eq!(seen[0].text, "дух леса");
        assert_eq!(seen[0].direction, Direction::Nanai);
        assert_eq!(seen[0].max_length, Some(64));
        assert_eq!(seen[0].attempt, 3);
    }

    #[tokio::test]
    async fn test_direction_is_required_and_validated() {
        let stub = Fixed::reply("привет");

        let (status, body) = get(app(stub.clone()), "/translation/hello").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_json_eq!(body, json!({"detail": "Missing query parameter 'direction'"}));

        let (status, _) = get(app(stub.clone()), "/translation/hello?direction=english").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = get(app(stub.clone()), "/translation/hello?direction=nanai&max_length=lots").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        assert!(stub.seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_undecodable_path_is_bad_request() {
        let stub = Fixed::reply("привет");
        let (status, body) = get(app(stub.clone()), "/translation/%FF?direction=nanai").await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["detail"].as_str().unwrap().contains("UTF-8"));
        assert!(stub.seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_blank_text_is_bad_request() {
        let stub = Fixed::reply("привет");
        let (status, _) = get(app(stub.clone()), "/translation/%20%20?direction=nanai").await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(stub.seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_timeout_maps_to_gateway_timeout() {
        let (status, body) = get(
            app(Fixed::failing(|| TranslationError::TimeoutError)),
            "/translation/hello?direction=nanai",
        )
        .await;

        assert_eq!(status, StatusCode::GATEWAY_TIMEOUT);
        assert_json_eq!(body, json!({"detail": "Translation timed out"}));
    }

    #[tokio::test]
    async fn test_internal_errors_do_not_leak() {
        let (status, body) = get(
            app(Fixed::failing(|| TranslationError::InternalError("tensor shape [1, 7]".to_string()))),
            "/translation/hello?direction=nanai",
        )
        .await;

        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_json_eq!(body, json!({"detail": "Internal Server Error"}));

        let (status, body) = get(app(Arc::new(Panicking)), "/translation/hello?direction=nanai").await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_json_eq!(body, json!({"detail": "Internal Server Error"}));
    }

    #[tokio::test]
    async fn test_health_and_unknown_routes() {
        let (status, body) = get(app(Fixed::reply("")), "/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_json_eq!(
            body,
            json!({
                "status": "ok",
                "service": crate::NAME,
                "version": crate::VERSION,
                "model_loaded": true
            })
        );

        let (status, body) = get(app(Fixed::reply("")), "/v1/models").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_json_eq!(body, json!({"detail": "Not Found"}));
    }

    #[tokio::test]
    async fn test_openapi_document_lists_translation_route() {
        let (status, body) = get(app(Fixed::reply("")), "/api-docs/openapi.json").await;

        assert_eq!(status, StatusCode::OK);
        assert!(body["paths"]["/translation/{text}"]["get"].is_object());
        assert!(body["components"]["schemas"]["DetailResponse"].is_object());
    }
}
