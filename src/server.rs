// Server module - HTTP exposition of the current snapshot
//
// A scrape is a read of whatever the collector last published; it never
// triggers collection and never waits on an in-flight pass. Before the
// first pass completes, /metrics answers with an empty body.

use axum::extract::State;
use axum::http::header;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::info;

use crate::snapshot::{render, SnapshotPublisher};

/// Prometheus text exposition content type
const TEXT_FORMAT: &str = "text/plain; version=0.0.4; charset=utf-8";

/// Builds the exporter's router.
pub fn router(publisher: Arc<SnapshotPublisher>) -> Router {
    Router::new()
        .route("/metrics", get(handle_metrics))
        .route("/health", get(handle_health))
        .with_state(publisher)
}

/// Binds the listener and serves scrape requests until the process exits.
pub async fn serve(addr: SocketAddr, publisher: Arc<SnapshotPublisher>) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("serving metrics on http://{}/metrics", addr);
    axum::serve(listener, router(publisher)).await
}

/// Renders the currently published snapshot in exposition format.
async fn handle_metrics(State(publisher): State<Arc<SnapshotPublisher>>) -> impl IntoResponse {
    let body = render(publisher.current().as_deref());
    ([(header::CONTENT_TYPE, TEXT_FORMAT)], body)
}

async fn handle_health() -> &'static str {
    "ok"
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::MetricSnapshot;
    use crate::usage::ImageUsage;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    async fn get_metrics(publisher: Arc<SnapshotPublisher>) -> (StatusCode, String) {
        let response = router(publisher)
            .oneshot(
                Request::builder()
                    .uri("/metrics")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, String::from_utf8(bytes.to_vec()).unwrap())
    }

    #[tokio::test]
    async fn test_metrics_empty_before_first_collection() {
        let publisher = Arc::new(SnapshotPublisher::new());
        let (status, body) = get_metrics(publisher).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "");
    }

    #[tokio::test]
    async fn test_metrics_serves_published_snapshot() {
        let publisher = Arc::new(SnapshotPublisher::new());
        publisher.publish(Arc::new(MetricSnapshot::new(
            vec![ImageUsage {
                pool: "rbd".to_string(),
                image: "img1".to_string(),
                id: "1".to_string(),
                provisioned_size: 1073741824,
                used_size: 536870912,
            }],
            0.5,
        )));

        let (status, body) = get_metrics(publisher).await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.contains("rbd_usage_bytes{image=\"img1\",pool=\"rbd\",id=\"1\"} 536870912"));
        assert!(body.contains("rbd_usage_scrape_duration_seconds 0.5"));
    }

    #[tokio::test]
    async fn test_health() {
        let response = router(Arc::new(SnapshotPublisher::new()))
            .oneshot(
                Request::builder()
                    .uri("/health")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
}
