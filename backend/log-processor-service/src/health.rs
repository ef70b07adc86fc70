//! Liveness endpoint
//!
//! Reports only that the process is up. Redis, PostgreSQL and the supervisor
//! state are not consulted.

use crate::metrics;
use actix_web::{web, App, HttpResponse, HttpServer};
use tracing::info;

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.route("/", web::get().to(liveness))
        .route("/health", web::get().to(liveness))
        .route("/metrics", web::get().to(prometheus_metrics));
}

async fn liveness() -> HttpResponse {
    HttpResponse::Ok().content_type("text/plain").body("OK")
}

async fn prometheus_metrics() -> HttpResponse {
    HttpResponse::Ok()
        .content_type("text/plain; version=0.0.4")
        .body(metrics::gather())
}

/// Serve until the returned future is dropped. Signals are handled by the caller.
pub async fn serve(port: u16) -> std::io::Result<()> {
    info!(port, "Starting health server");

    // Only the `Server` handle may live across the await; it is `Send`, the
    // builder is not.
    let server = HttpServer::new(|| App::new().configure(configure))
        .workers(1)
        .disable_signals()
        .bind(("0.0.0.0", port))?
        .run();
    server.await
}

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::{body, test};

    #[actix_web::test]
    async fn test_health_returns_ok() {
        let app = test::init_service(App::new().configure(configure)).await;

        for uri in ["/", "/health"] {
            let req = test::TestRequest::get().uri(uri).to_request();
            let resp = test::call_service(&app, req).await;
            assert!(resp.status().is_success(), "{}", uri);

            let bytes = body::to_bytes(resp.into_body()).await.unwrap();
            assert_eq!(bytes.as_ref(), b"OK");
        }
    }

    #[actix_web::test]
    async fn test_metrics_endpoint_serves_text_format() {
        metrics::record_batch();
        let app = test::init_service(App::new().configure(configure)).await;

        let req = test::TestRequest::get().uri("/metrics").to_request();
        let resp = test::call_service(&app, req).await;
        assert!(resp.status().is_success());

        let bytes = body::to_bytes(resp.into_body()).await.unwrap();
        let text = String::from_utf8(bytes.to_vec()).unwrap();
        assert!(text.contains("log_processor_batches_total"));
    }

    fn assert_send<T: Send>(_: &T) {}

    #[core::prelude::v1::test]
    fn test_serve_future_can_be_spawned() {
        let server = serve(0);
        assert_send(&server);
    }

    #[actix_web::test]
    async fn test_unknown_path_is_not_found() {
        let app = test::init_service(App::new().configure(configure)).await;
        let req = test::TestRequest::get().uri("/ready").to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), actix_web::http::StatusCode::NOT_FOUND);
    }
}
