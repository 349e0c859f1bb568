use crate::{config::Config, routes::api_routes, state::ServiceState};
use axum::{extract::DefaultBodyLimit, Router};
use std::sync::Arc;
use tokio::{net::TcpListener, signal};
use tower_http::cors::CorsLayer;

pub fn build_router(state: ServiceState, max_upload_bytes: usize) -> Router {
    Router::new()
        .merge(api_routes())
        .with_state(Arc::new(state))
        .layer(DefaultBodyLimit::max(max_upload_bytes))
        .layer(CorsLayer::permissive())
}

pub struct HttpServer {
    router: Router,
    listener: TcpListener,
}

impl HttpServer {
    pub async fn new(state: ServiceState, config: &Config) -> anyhow::Result<Self> {
        let addr = config.server.get_address();
        let router = build_router(state, config.server.max_upload_bytes);
        let listener = TcpListener::bind(&addr).await?;

        Ok(Self { router, listener })
    }

    pub async fn run(self) -> anyhow::Result<()> {
        tracing::info!("Classifier service listening on {}", self.listener.local_addr()?);

        let shutdown = async {
            shutdown_signal().await;
            tracing::info!("Shutdown signal received, starting graceful shutdown")
        };

        axum::serve(self.listener, self.router)
            .with_graceful_shutdown(shutdown)
            .await?;
        Ok(())
    }
}

pub async fn start_server(config: Config) -> anyhow::Result<()> {
    // Weights are read once, before the listener opens.
    let state = tokio::task::block_in_place(|| ServiceState::from_config(&config))?;
    if !state.model_loaded() {
        tracing::warn!(
            "Serving without a model, predictions will fail until {:?} exists and the service restarts",
            state.model_path()
        );
    }

    let server = HttpServer::new(state, &config).await?;
    server.run().await?;

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install signal handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        model_service::Classifier,
        state::tests::{mock_state, png_bytes, MockClassifier},
    };
    use axum::{
        body::Body,
        http::{header, Request, StatusCode},
    };
    use serde_json::Value;
    use tower::ServiceExt;

    const BOUNDARY: &str = "crop-upload-boundary";

    fn loaded_router(probabilities: &[f32]) -> Router {
        let model: Arc<dyn Classifier> = Arc::new(MockClassifier::with_probabilities(probabilities));
        build_router(mock_state(Some(model)), 1024 * 1024)
    }

    fn upload(field: &str, payload: &[u8]) -> Request<Body> {
        let mut body = format!(
            "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"{field}\"; filename=\"leaf.png\"\r\nContent-Type: image/png\r\n\r\n"
        )
        .into_bytes();
        body.extend_from_slice(payload);
        body.extend_from_slice(format!("\r\n--{BOUNDARY}--\r\n").as_bytes());

        Request::builder()
            .method("POST")
            .uri("/predict-crop")
            .header(
                header::CONTENT_TYPE,
                format!("multipart/form-data; boundary={BOUNDARY}"),
            )
            .body(Body::from(body))
            .unwrap()
    }

    async fn send(router: Router, request: Request<Body>) -> (StatusCode, Value) {
        let response = router.oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    #[tokio::test]
    async fn test_health_with_model() {
        let (status, body) = send(loaded_router(&[0.1, 0.85, 0.05]), get("/health")).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
        assert_eq!(body["device"], "cpu");
        assert_eq!(body["model_loaded"], true);
        assert_eq!(body["model_path"], "/srv/models/best_vit_tiny_patch16_224.pth");
    }

    #[tokio::test]
    async fn test_health_without_model() {
        let router = build_router(mock_state(None), 1024);
        let (status, body) = send(router, get("/health")).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["model_loaded"], false);
    }

    #[tokio::test]
    async fn test_predict_crop() {
        let router = loaded_router(&[0.1, 0.85, 0.05]);
        let (status, body) = send(router, upload("image", &png_bytes(300, 200))).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["predicted_class"], "wheat_rust");
        assert!((body["confidence"].as_f64().unwrap() - 0.85).abs() < 1e-5);
        assert_eq!(body["is_unknown"], false);

        let top: Vec<&str> = body["top_3"]
            .as_array()
            .unwrap()
            .iter()
            .map(|entry| entry["label"].as_str().unwrap())
            .collect();
        assert_eq!(top, vec!["wheat_rust", "wheat_healthy", "corn_healthy"]);
    }

    #[tokio::test]
    async fn test_predict_accepts_file_field() {
        let router = loaded_router(&[0.5, 0.3, 0.2]);
        let (status, body) = send(router, upload("file", &png_bytes(64, 64))).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["predicted_class"], "wheat_healthy");
        assert_eq!(body["is_unknown"], true);
    }

    #[tokio::test]
    async fn test_predict_without_model() {
        let router = build_router(mock_state(None), 1024 * 1024);
        let (status, body) = send(router, upload("image", &png_bytes(8, 8))).await;

        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["error"], "Model not loaded. Please check model path.");
        assert_eq!(body["model_path"], "/srv/models/best_vit_tiny_patch16_224.pth");
    }

    #[tokio::test]
    async fn test_predict_rejects_non_image() {
        let router = loaded_router(&[0.1, 0.85, 0.05]);
        let (status, body) = send(router, upload("image", b"plain text, not pixels")).await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().unwrap().contains("decode"));
    }

    #[tokio::test]
    async fn test_predict_requires_image_field() {
        let router = loaded_router(&[0.1, 0.85, 0.05]);
        let (status, _) = send(router, upload("avatar", &png_bytes(8, 8))).await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_predict_rejects_oversized_upload() {
        let model: Arc<dyn Classifier> =
            Arc::new(MockClassifier::with_probabilities(&[0.1, 0.85, 0.05]));
        let router = build_router(mock_state(Some(model)), 512);
        let response = router
            .oneshot(upload("image", &[0u8; 4096]))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
    }

    #[tokio::test]
    async fn test_labels() {
        let (status, body) = send(loaded_router(&[0.1, 0.85, 0.05]), get("/labels")).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(
            body["labels"],
            serde_json::json!(["wheat_healthy", "wheat_rust", "corn_healthy"])
        );
    }

    #[tokio::test]
    async fn test_cors_headers() {
        let request = Request::builder()
            .uri("/health")
            .header(header::ORIGIN, "http://localhost:5173")
            .body(Body::empty())
            .unwrap();
        let response = loaded_router(&[0.1, 0.85, 0.05])
            .oneshot(request)
            .await
            .unwrap();

        assert_eq!(
            response.headers()[header::ACCESS_CONTROL_ALLOW_ORIGIN],
            "*"
        );
    }
}
