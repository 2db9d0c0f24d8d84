//! A very simple HTTP interface to the cache.
//!
//! `POST /<key>` stores the raw request body under the key; `GET /<key>`
//! returns the raw value. 200 on success, 500 on any store error. Nothing
//! else is routed.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use bytes::Bytes;
use tower_http::trace::TraceLayer;
use tracing::debug;

use crate::rpc::Cache;

pub fn router(cache: Arc<dyn Cache>) -> Router {
    Router::new()
        .route("/*key", get(get_key).post(set_key))
        .with_state(cache)
        .layer(TraceLayer::new_for_http())
}

async fn set_key(
    State(cache): State<Arc<dyn Cache>>,
    Path(key): Path<String>,
    body: Bytes,
) -> StatusCode {
    match cache.set(&key, body.to_vec()).await {
        Ok(()) => StatusCode::OK,
        Err(e) => {
            debug!(key, error = %e, "http set failed");
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

async fn get_key(State(cache): State<Arc<dyn Cache>>, Path(key): Path<String>) -> Response {
    match cache.get(&key).await {
        Ok(value) => (StatusCode::OK, value).into_response(),
        Err(e) => {
            debug!(key, error = %e, "http get failed");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    use crate::cache::MemoryCache;

    #[tokio::test]
    async fn post_then_get() {
        let app = router(Arc::new(MemoryCache::new()));

        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/testkey")
                    .body(Body::from("testval"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = app
            .oneshot(Request::builder().uri("/testkey").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        assert_eq!(&body[..], b"testval");
    }

    #[tokio::test]
    async fn missing_key_is_a_500() {
        let app = router(Arc::new(MemoryCache::new()));

        let response = app
            .oneshot(Request::builder().uri("/absent").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn whole_body_is_the_value() {
        let app = router(Arc::new(MemoryCache::new()));
        let value = vec![7u8; 32 * 1024];

        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/big")
                    .body(Body::from(value.clone()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = app
            .oneshot(Request::builder().uri("/big").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        assert_eq!(body.len(), value.len());
    }
}
