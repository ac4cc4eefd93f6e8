//! HTTP surface: a single `POST /` endpoint that returns a raw
//! little-endian float32 embedding for the posted document.

use crate::catalog::Catalog;
use crate::config::Config;
use crate::orchestrator::Orchestrator;
use axum::extract::{Multipart, Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::Router;
use serde::Deserialize;
use std::sync::Arc;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, warn};

/// Shared state for the worker's axum app. Built once per worker process,
/// not once per request (Design Notes: no process-wide mutable globals).
pub struct AppState {
    pub config: Config,
    pub orchestrator: Orchestrator,
}

#[derive(Debug, Deserialize)]
struct EmbedQuery {
    model_name: Option<String>,
    #[serde(default = "default_true")]
    read_cache: bool,
    #[serde(default = "default_true")]
    write_cache: bool,
    #[serde(default = "default_emb_type")]
    emb_type: String,
}

fn default_true() -> bool {
    true
}

fn default_emb_type() -> String {
    "sentence".to_string()
}

pub fn build_router(state: Arc<AppState>) -> Router {
    let cors = if state.config.cors_origins.iter().any(|o| o == "*") {
        CorsLayer::new().allow_origin(AllowOrigin::any())
    } else {
        let origins: Vec<_> = state
            .config
            .cors_origins
            .iter()
            .filter_map(|o| o.parse().ok())
            .collect();
        CorsLayer::new().allow_origin(origins)
    };

    Router::new()
        .route("/", post(embed))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn embed(
    State(state): State<Arc<AppState>>,
    Query(query): Query<EmbedQuery>,
    mut multipart: Multipart,
) -> Response {
    if query.emb_type == "word" {
        return (StatusCode::NOT_IMPLEMENTED, "word embeddings are not implemented").into_response();
    }
    if query.emb_type != "sentence" {
        return (
            StatusCode::UNPROCESSABLE_ENTITY,
            format!("unsupported emb_type: {}", query.emb_type),
        )
            .into_response();
    }

    let model_name = query
        .model_name
        .unwrap_or_else(|| state.config.default_model.clone());

    let mut document: Option<String> = None;
    loop {
        let field = match multipart.next_field().await {
            Ok(Some(f)) => f,
            Ok(None) => break,
            Err(e) => {
                return (StatusCode::UNPROCESSABLE_ENTITY, format!("bad multipart body: {e}")).into_response();
            }
        };
        if field.name() == Some("document") {
            document = match field.text().await {
                Ok(text) => Some(text),
                Err(e) => {
                    return (StatusCode::UNPROCESSABLE_ENTITY, format!("bad document field: {e}")).into_response();
                }
            };
        }
    }

    let Some(document) = document else {
        return (StatusCode::UNPROCESSABLE_ENTITY, "missing document field").into_response();
    };

    let (vector, deferred) =
        match state.orchestrator.get_embeddings(&document, &model_name, query.read_cache) {
            Ok(pair) => pair,
            Err(e) => return (StatusCode::UNPROCESSABLE_ENTITY, e.to_string()).into_response(),
        };

    if query.write_cache {
        if let Some(deferred) = deferred {
            let state = Arc::clone(&state);
            tokio::task::spawn_blocking(move || match state.orchestrator.write_embeddings(deferred) {
                Ok(crate::client::WriteOutcome::Dropped) => {
                    warn!("deferred embedding write was dropped, shared-memory channel was full")
                }
                Ok(crate::client::WriteOutcome::Sent) => {}
                Err(e) => error!(error = %e, "deferred embedding write failed"),
            });
        }
    }

    let mut bytes = Vec::with_capacity(vector.len() * 4);
    for v in &vector {
        bytes.extend_from_slice(&v.to_le_bytes());
    }

    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "application/octet-stream")],
        bytes,
    )
        .into_response()
}

pub fn known_models(catalog: &Catalog) -> Vec<String> {
    catalog.autoloaded().map(|m| m.name.clone()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::Catalog;
    use crate::client::CacheClient;
    use crate::shm::channel::{WorkerRegion, DEFAULT_NUM_CELLS};
    use axum::body::Body;
    use axum::http::Request;
    use tempfile::tempdir;
    use tower::ServiceExt;

    fn test_state(tag: u32) -> (Arc<AppState>, u32) {
        use std::time::{SystemTime, UNIX_EPOCH};
        let nanos = SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_nanos();
        let pid = (nanos % 100_000) as u32 * 10 + tag;
        let region = WorkerRegion::create(pid, DEFAULT_NUM_CELLS).unwrap();
        for cell in region.cells() {
            cell.clear();
        }
        let client = CacheClient::new_for_test(pid, region, None);

        let dir = tempdir().unwrap();
        let config = Config::builder().data_dir(dir.path()).build();
        let catalog = Catalog::parse("m 8 1\n");
        let orchestrator = Orchestrator::new(config.clone(), catalog, client);
        (Arc::new(AppState { config, orchestrator }), pid)
    }

    #[tokio::test]
    async fn unsupported_emb_type_is_unprocessable() {
        let (state, pid) = test_state(1);
        let app = build_router(Arc::clone(&state));

        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/?model_name=m&emb_type=nonsense")
                    .header("content-type", "multipart/form-data; boundary=X")
                    .body(Body::from("--X--\r\n"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
        WorkerRegion::unlink(pid).ok();
    }

    #[tokio::test]
    async fn word_emb_type_is_not_implemented() {
        let (state, pid) = test_state(2);
        let app = build_router(Arc::clone(&state));

        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/?model_name=m&emb_type=word")
                    .header("content-type", "multipart/form-data; boundary=X")
                    .body(Body::from("--X--\r\n"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_IMPLEMENTED);
        WorkerRegion::unlink(pid).ok();
    }

    #[tokio::test]
    async fn unknown_model_is_unprocessable() {
        let (state, pid) = test_state(3);
        let app = build_router(Arc::clone(&state));

        let body = "--X\r\nContent-Disposition: form-data; name=\"document\"\r\n\r\nhello\r\n--X--\r\n";
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/?model_name=nope")
                    .header("content-type", "multipart/form-data; boundary=X")
                    .body(Body::from(body))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
        WorkerRegion::unlink(pid).ok();
    }

    #[tokio::test]
    async fn valid_request_returns_raw_f32_bytes() {
        let (state, pid) = test_state(4);
        let app = build_router(Arc::clone(&state));

        let body = "--X\r\nContent-Disposition: form-data; name=\"document\"\r\n\r\nhello\r\n--X--\r\n";
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/?model_name=m")
                    .header("content-type", "multipart/form-data; boundary=X")
                    .body(Body::from(body))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(bytes.len(), 8 * 4);
        WorkerRegion::unlink(pid).ok();
    }
}
