use axum::{
    http::{header, StatusCode, Uri},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use rust_embed::Embed;

use crate::error::AppError;

/// Viewer page and its assets
#[derive(Embed)]
#[folder = "assets/"]
#[prefix = ""]
pub struct StaticAssets;

/// Create router for static file serving
pub fn static_file_router<S>() -> Router<S>
where
    S: Clone + Send + Sync + 'static,
{
    Router::new()
        .route("/", get(index_handler))
        .route("/*path", get(static_handler))
}

async fn index_handler() -> Response {
    serve_file("index.html")
}

async fn static_handler(uri: Uri) -> Response {
    serve_file(uri.path().trim_start_matches('/'))
}

fn serve_file(path: &str) -> Response {
    match StaticAssets::get(path) {
        Some(asset) => {
            let mime = mime_guess::from_path(path)
                .first_or_octet_stream()
                .to_string();
            (
                StatusCode::OK,
                [
                    (header::CONTENT_TYPE, mime),
                    (header::CACHE_CONTROL, "no-cache".to_string()),
                ],
                asset.data.into_owned(),
            )
                .into_response()
        }
        None => {
            tracing::debug!("Static file not found: {}", path);
            AppError::NotFound(format!("no such file: {}", path)).into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_index_is_embedded() {
        let index = StaticAssets::get("index.html").unwrap();
        let html = std::str::from_utf8(&index.data).unwrap();
        assert!(html.contains("/ws"));
    }

    #[tokio::test]
    async fn test_missing_file_is_404_with_error_body() {
        let response = serve_file("nope.js");
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let body: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(body["success"], false);
        assert!(body["message"].as_str().unwrap().contains("nope.js"));

        assert_eq!(serve_file("index.html").status(), StatusCode::OK);
    }
}
