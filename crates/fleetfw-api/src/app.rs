use std::sync::Arc;

use axum::middleware;
use axum::routing::{get, post};
use axum::Router;
use fleetfw_protocol::ProtocolManager;
use fleetfw_runner::Scheduler;
use fleetfw_store::RunStore;
use tower_http::trace::TraceLayer;

use crate::auth::require_bearer_token;
use crate::handlers;
use crate::state::AppState;

pub fn build_app(
    store: Arc<dyn RunStore>,
    scheduler: Arc<Scheduler>,
    manager: Arc<ProtocolManager>,
    auth_token: Arc<String>,
) -> Router {
    let state = AppState { store, scheduler, manager, auth_token };

    Router::new()
        // Health
        .route("/health", get(handlers::health))
        .route("/ready", get(handlers::ready))
        // Plans
        .route("/plans", post(handlers::create_plan).get(handlers::list_plans))
        .route("/plans/:id/start", post(handlers::start_plan))
        .route("/plans/:id/status", get(handlers::plan_status))
        // Host-runs
        .route("/runs/:id", get(handlers::get_run))
        .route("/runs/:id/cancel", post(handlers::cancel_run))
        // Hosts
        .route("/hosts", get(handlers::list_hosts))
        .route("/hosts/:id", post(handlers::register_host))
        .route("/hosts/:id/discover", post(handlers::discover_host))
        // Events
        .route("/events", get(handlers::list_events))
        // Auth middleware applies to all routes above
        .route_layer(middleware::from_fn_with_state(state.clone(), require_bearer_token))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use fleetfw_protocol::RetryPolicy;
    use fleetfw_runner::{HostRunner, RunnerConfig, SchedulerOptions};
    use fleetfw_store::InMemoryStore;
    use serde_json::{json, Value};
    use tower::util::ServiceExt;

    const TEST_TOKEN: &str = "test-token";

    fn test_app() -> Router {
        let store = Arc::new(InMemoryStore::new());
        let settings = fleetfw_protocol::HttpSettings::default();
        let redfish = Arc::new(fleetfw_protocol::RedfishClient::with_base(
            &settings,
            "https://127.0.0.1:1",
        ));
        let manager = Arc::new(ProtocolManager::new(
            vec![redfish.clone()],
            RetryPolicy::default(),
            std::time::Duration::from_secs(1),
        ));
        let planner = Arc::new(fleetfw_catalog::FirmwarePlanner::new(
            fleetfw_catalog::CatalogCache::new(
                reqwest::Client::new(),
                std::time::Duration::from_secs(60),
            ),
            "https://downloads.dell.com/catalog/Catalog.xml.gz",
        ));
        let secrets = fleetfw_secrets::provider_from_ref("env:FLEETFW_TEST").unwrap();
        let runner = Arc::new(HostRunner::new(
            store.clone(),
            secrets,
            manager.clone(),
            redfish,
            planner,
            settings,
            RunnerConfig::default(),
        ));
        let scheduler = Arc::new(Scheduler::new(
            store.clone(),
            runner,
            SchedulerOptions::default(),
        ));
        build_app(store, scheduler, manager, Arc::new(TEST_TOKEN.to_string()))
    }

    fn authed(req: axum::http::request::Builder) -> axum::http::request::Builder {
        req.header("Authorization", format!("Bearer {}", TEST_TOKEN))
    }

    async fn body_json(resp: axum::response::Response) -> Value {
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn unauthenticated_request_returns_401() {
        let app = test_app();
        let resp = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn wrong_token_returns_401() {
        let app = test_app();
        let resp = app
            .oneshot(
                Request::builder()
                    .uri("/health")
                    .header("Authorization", "Bearer wrong-token")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn health_with_token_returns_200() {
        let app = test_app();
        let resp = app
            .oneshot(authed(Request::builder().uri("/health")).body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn plan_create_start_dry_run_and_status() {
        let app = test_app();

        let create = app
            .clone()
            .oneshot(
                authed(Request::builder().method("POST").uri("/plans"))
                    .header("content-type", "application/json")
                    .body(Body::from(
                        json!({
                            "id": "p1",
                            "name": "test plan",
                            "policy": { "update_mode": "SPECIFIC_URL" },
                            "targets": ["10.0.0.10"],
                            "artifacts": [{
                                "component": "iDRAC",
                                "image_uri": "https://fw.example/idrac-7.10.exe"
                            }]
                        })
                        .to_string(),
                    ))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(create.status(), StatusCode::OK);
        assert_eq!(body_json(create).await["id"], "p1");

        let dry = app
            .clone()
            .oneshot(
                authed(Request::builder().method("POST").uri("/plans/p1/start?dryRun=true"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(dry.status(), StatusCode::OK);
        let dry_body = body_json(dry).await;
        assert_eq!(dry_body["dryRun"], true);
        assert_eq!(dry_body["targets"][0], "10.0.0.10");

        let start = app
            .clone()
            .oneshot(
                authed(Request::builder().method("POST").uri("/plans/p1/start"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(start.status(), StatusCode::OK);
        let start_body = body_json(start).await;
        assert_eq!(start_body["started"], true);
        assert_eq!(start_body["count"], 1);

        // Starting again is idempotent: no new runs.
        let restart = app
            .clone()
            .oneshot(
                authed(Request::builder().method("POST").uri("/plans/p1/start"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(body_json(restart).await["count"], 0);

        let status = app
            .clone()
            .oneshot(
                authed(Request::builder().uri("/plans/p1/status"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let runs = body_json(status).await;
        assert_eq!(runs.as_array().unwrap().len(), 1);
        assert_eq!(runs[0]["state"], "PRECHECKS");
    }

    #[tokio::test]
    async fn plan_without_targets_is_unprocessable() {
        let app = test_app();
        let resp = app
            .oneshot(
                authed(Request::builder().method("POST").uri("/plans"))
                    .header("content-type", "application/json")
                    .body(Body::from(
                        json!({
                            "name": "empty",
                            "policy": { "update_mode": "LATEST_FROM_CATALOG" },
                            "targets": []
                        })
                        .to_string(),
                    ))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::UNPROCESSABLE_ENTITY);
    }

    #[tokio::test]
    async fn host_register_rejects_endpoint_change() {
        let app = test_app();
        let register = |endpoint: &str| {
            authed(Request::builder().method("POST").uri("/hosts/esx-01"))
                .header("content-type", "application/json")
                .body(Body::from(
                    json!({ "management_endpoint": endpoint }).to_string(),
                ))
                .unwrap()
        };

        let first = app.clone().oneshot(register("10.0.0.10")).await.unwrap();
        assert_eq!(first.status(), StatusCode::OK);

        let same = app.clone().oneshot(register("10.0.0.10")).await.unwrap();
        assert_eq!(same.status(), StatusCode::OK);

        let changed = app.clone().oneshot(register("10.0.0.99")).await.unwrap();
        assert_eq!(changed.status(), StatusCode::UNPROCESSABLE_ENTITY);
    }

    #[tokio::test]
    async fn discover_unknown_host_is_404() {
        let app = test_app();
        let resp = app
            .oneshot(
                authed(Request::builder().method("POST").uri("/hosts/nope/discover"))
                    .header("content-type", "application/json")
                    .body(Body::from(
                        json!({ "username": "root", "password": "calvin" }).to_string(),
                    ))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }
}
