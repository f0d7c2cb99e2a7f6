mod common;

#[cfg(test)]
mod tests {
    use crate::common::{MemoryStorage, ScriptedSource};
    use axum::{
        body::Body,
        http::{Request, StatusCode},
    };
    use clap::Parser;
    use std::sync::Arc;
    use streamgate::*;
    use tower::util::ServiceExt;

    fn test_state(source: ScriptedSource) -> Arc<AppState> {
        let args = Arc::new(Args::parse_from([
            "streamgate",
            "--static-dir",
            "does-not-exist",
            "--circuit-breaker-threshold",
            "1",
        ]));
        Arc::new(AppState::new(
            args,
            Arc::new(source),
            Arc::new(MemoryStorage::new()),
        ))
    }

    async fn get_json(app: axum::Router, uri: &str) -> (StatusCode, serde_json::Value) {
        let response = app
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let body = axum::body::to_bytes(response.into_body(), 4096)
            .await
            .unwrap();
        (status, serde_json::from_slice(&body).unwrap())
    }

    #[tokio::test]
    async fn test_health_liveness() {
        let app = build_router(test_state(ScriptedSource::new(&[])));
        let (status, json) = get_json(app, "/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["status"], "ok");
    }

    #[tokio::test]
    async fn test_health_readiness_ok() {
        let app = build_router(test_state(ScriptedSource::new(&[])));
        let (status, json) = get_json(app, "/readyz").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["status"], "ready");
        assert_eq!(json["circuit_breaker"], "closed");
        assert_eq!(json["total_requests"], 0);
    }

    #[tokio::test]
    async fn test_readiness_reflects_open_breaker() {
        let state = test_state(ScriptedSource::failing_open());
        assert!(state.token_source.open("q", "p").await.is_err());

        let (status, json) = get_json(build_router(state), "/readyz").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(json["circuit_breaker"], "open");
        assert_eq!(json["total_requests"], 1);
        assert_eq!(json["failed_requests"], 1);
    }

    #[tokio::test]
    async fn test_request_id_is_echoed() {
        let app = build_router(test_state(ScriptedSource::new(&[])));
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/health")
                    .header("x-request-id", "abc-123")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(
            response.headers().get("x-request-id").unwrap(),
            "abc-123"
        );
    }

    #[tokio::test]
    async fn test_unknown_path_without_static_dir() {
        let app = build_router(test_state(ScriptedSource::new(&[])));
        let response = app
            .oneshot(Request::builder().uri("/nope").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_static_client_page_is_served() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("index.html"), "<html>client</html>").unwrap();
        let args = Arc::new(Args::parse_from([
            "streamgate",
            "--static-dir",
            dir.path().to_str().unwrap(),
        ]));
        let state = Arc::new(AppState::new(
            args,
            Arc::new(ScriptedSource::new(&[])),
            Arc::new(MemoryStorage::new()),
        ));

        let response = build_router(state)
            .oneshot(Request::builder().uri("/").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = axum::body::to_bytes(response.into_body(), 4096)
            .await
            .unwrap();
        assert_eq!(&body[..], b"<html>client</html>");
    }
}
