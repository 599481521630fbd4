//! Companion HTTP server
//!
//! Serves the root certificate so devices can install it, and the scripts
//! the battle page injection points at.

use crate::proxy::headers::paths;
use axum::extract::State;
use axum::http::header;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use std::path::Path;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;

pub const CA_CONTENT_TYPE: &str = "application/x-x509-ca-cert";

#[derive(Debug)]
struct AssetState {
    root_certificate_pem: String,
}

/// Routes: `/` status, `/cert` and `/ca.crt` root download, `/js/*` scripts
pub fn router(root_certificate_pem: String, static_dir: &Path) -> Router {
    let state = Arc::new(AssetState {
        root_certificate_pem,
    });

    Router::new()
        .route("/", get(status))
        .route(paths::CERT, get(root_certificate))
        .route(paths::CERT_FILE, get(root_certificate))
        .nest_service(paths::SCRIPTS, ServeDir::new(static_dir))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

pub async fn serve(listener: TcpListener, router: Router) -> std::io::Result<()> {
    axum::serve(listener, router).await
}

async fn status() -> &'static str {
    "FFRK proxy is running. Install the root certificate from /cert"
}

async fn root_certificate(State(state): State<Arc<AssetState>>) -> impl IntoResponse {
    (
        [
            (header::CONTENT_TYPE, CA_CONTENT_TYPE),
            (header::CONTENT_DISPOSITION, "attachment; filename=\"ca.crt\""),
        ],
        state.root_certificate_pem.clone(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use http_body_util::BodyExt;
    use rstest::rstest;
    use tower::ServiceExt;

    const PEM: &str = "-----BEGIN CERTIFICATE-----\nMIIB\n-----END CERTIFICATE-----\n";

    async fn get_path(router: Router, path: &str) -> (StatusCode, Option<String>, String) {
        let response = router
            .oneshot(Request::get(path).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let content_type = response
            .headers()
            .get(header::CONTENT_TYPE)
            .map(|v| v.to_str().unwrap().to_string());
        let body = response.into_body().collect().await.unwrap().to_bytes();
        (status, content_type, String::from_utf8(body.to_vec()).unwrap())
    }

    #[rstest]
    #[case("/cert")]
    #[case("/ca.crt")]
    #[tokio::test]
    async fn test_root_certificate_download(#[case] path: &str) {
        let dir = tempfile::tempdir().unwrap();
        let (status, content_type, body) =
            get_path(router(PEM.to_string(), dir.path()), path).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(content_type.as_deref(), Some(CA_CONTENT_TYPE));
        assert_eq!(body, PEM);
    }

    #[tokio::test]
    async fn test_scripts_are_served_from_static_dir() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("inject.js"), "var loaded = true;").unwrap();

        let (status, _, body) =
            get_path(router(PEM.to_string(), dir.path()), "/js/inject.js").await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "var loaded = true;");
    }

    #[tokio::test]
    async fn test_missing_script_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let (status, _, _) = get_path(router(PEM.to_string(), dir.path()), "/js/nope.js").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_status_page() {
        let dir = tempfile::tempdir().unwrap();
        let (status, _, body) = get_path(router(PEM.to_string(), dir.path()), "/").await;

        assert_eq!(status, StatusCode::OK);
        assert!(body.contains("/cert"));
    }
}
