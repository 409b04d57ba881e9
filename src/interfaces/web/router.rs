use axum::{
    Json, Router,
    body::Body,
    http::{HeaderValue, Request, header},
    middleware,
    middleware::Next,
    routing::{delete, get, post},
};
use serde_json::json;

use super::AppState;
use super::handlers::{events, runs, triggers, versions};

pub fn build_api_router(state: AppState) -> Router {
    Router::new()
        .route("/api/health", get(|| async { Json(json!({ "success": true })) }))
        .route("/api/versions", post(versions::publish_version_endpoint))
        .route("/api/versions/{version_id}", get(versions::get_version_endpoint))
        .route(
            "/api/agents/{agent_id}/versions",
            get(versions::list_agent_versions_endpoint),
        )
        .route(
            "/api/agents/{agent_id}/versions/latest",
            get(versions::latest_agent_version_endpoint),
        )
        .route(
            "/api/runs",
            get(runs::list_runs_endpoint).post(runs::submit_run_endpoint),
        )
        .route("/api/runs/{run_id}", get(runs::get_run_endpoint))
        .route("/api/runs/{run_id}/cancel", post(runs::cancel_run_endpoint))
        .route(
            "/api/triggers",
            get(triggers::list_triggers_endpoint).post(triggers::create_trigger_endpoint),
        )
        .route(
            "/api/triggers/{trigger_id}",
            delete(triggers::delete_trigger_endpoint),
        )
        .route(
            "/api/triggers/{trigger_id}/fire",
            post(triggers::fire_trigger_endpoint),
        )
        .route(
            "/api/triggers/{trigger_id}/fires",
            get(triggers::list_fires_endpoint),
        )
        .route("/api/events/{source}", post(events::ingest_event_endpoint))
        .layer(middleware::from_fn(security_headers))
        .with_state(state)
}

async fn security_headers(req: Request<Body>, next: Next) -> axum::response::Response {
    let mut response = next.run(req).await;
    let headers = response.headers_mut();
    headers.insert(
        header::X_CONTENT_TYPE_OPTIONS,
        HeaderValue::from_static("nosniff"),
    );
    headers.insert(header::X_FRAME_OPTIONS, HeaderValue::from_static("DENY"));
    headers.insert(
        header::CONTENT_SECURITY_POLICY,
        HeaderValue::from_static("default-src 'none'"),
    );
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::orchestrator::Orchestrator;
    use crate::core::queue::{CancelRegistry, JobQueue, RetryPolicy};
    use crate::core::store::Store;
    use crate::core::triggers::{CancelPreviousMode, TriggerScheduler};
    use crate::core::version::VersionStore;
    use axum::http::{Method, StatusCode};
    use serde_json::Value;
    use std::sync::Arc;
    use std::time::Duration;
    use tower::util::ServiceExt;

    fn state() -> AppState {
        let store = Store::open_in_memory().unwrap();
        let queue = JobQueue::new(
            store.clone(),
            RetryPolicy {
                max_attempts: 3,
                base_backoff: Duration::ZERO,
                max_backoff: Duration::ZERO,
            },
            Duration::from_secs(30),
        );
        let orchestrator = Orchestrator::new(
            store.clone(),
            Arc::new(VersionStore::new(store)),
            queue,
            CancelRegistry::new(),
        );
        AppState {
            scheduler: TriggerScheduler::new(orchestrator.clone(), CancelPreviousMode::Immediate),
            orchestrator,
        }
    }

    async fn json_request(
        app: Router,
        method: Method,
        path: &str,
        body: Option<Value>,
    ) -> (StatusCode, Value) {
        let body = match body {
            Some(json) => Body::from(serde_json::to_string(&json).unwrap()),
            None => Body::empty(),
        };
        let req = Request::builder()
            .method(method)
            .uri(path)
            .header("content-type", "application/json")
            .body(body)
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        let status = resp.status();
        let body_bytes = axum::body::to_bytes(resp.into_body(), 1024 * 1024)
            .await
            .unwrap();
        let json: Value = serde_json::from_slice(&body_bytes).unwrap_or(json!({}));
        (status, json)
    }

    fn agent_body() -> Value {
        json!({
            "agent_id": "researcher",
            "config": {
                "model": { "provider": "openai", "model": "gpt-4o-mini" },
                "instructions": "Research the topic.",
                "tools": ["execute_code"]
            }
        })
    }

    #[tokio::test]
    async fn security_headers_present_on_responses() {
        let app = build_api_router(state());
        let req = Request::builder()
            .method(Method::GET)
            .uri("/api/health")
            .body(Body::empty())
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();

        assert_eq!(
            resp.headers().get("x-content-type-options").unwrap(),
            "nosniff"
        );
        assert_eq!(resp.headers().get("x-frame-options").unwrap(), "DENY");
        assert!(resp.headers().get("content-security-policy").is_some());
    }

    #[tokio::test]
    async fn publish_submit_status_cancel() {
        let app = build_api_router(state());

        let (status, body) =
            json_request(app.clone(), Method::POST, "/api/versions", Some(agent_body())).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], true);
        let version_id = body["version_id"].as_str().unwrap().to_string();

        let (_, body) = json_request(
            app.clone(),
            Method::GET,
            &format!("/api/versions/{}", version_id),
            None,
        )
        .await;
        assert_eq!(body["version"]["config"]["instructions"], "Research the topic.");

        let (_, body) = json_request(
            app.clone(),
            Method::POST,
            "/api/runs",
            Some(json!({ "version_id": version_id, "input": "tides" })),
        )
        .await;
        assert_eq!(body["success"], true);
        let run_id = body["run_id"].as_str().unwrap().to_string();

        let (_, body) =
            json_request(app.clone(), Method::GET, &format!("/api/runs/{}", run_id), None).await;
        assert_eq!(body["run"]["run"]["status"], "queued");
        assert_eq!(body["run"]["job"]["state"], "queued");

        let (_, body) = json_request(
            app.clone(),
            Method::POST,
            &format!("/api/runs/{}/cancel", run_id),
            None,
        )
        .await;
        assert_eq!(body["cancel"]["outcome"], "cancelled_before_start");

        let (_, body) = json_request(app, Method::GET, "/api/runs?limit=5", None).await;
        assert_eq!(body["runs"][0]["status"], "cancelled");
    }

    #[tokio::test]
    async fn submit_records_forwarded_trigger_provenance() {
        let state = state();
        let app = build_api_router(state.clone());
        let (_, body) =
            json_request(app.clone(), Method::POST, "/api/versions", Some(agent_body())).await;
        let version_id = body["version_id"].as_str().unwrap().to_string();

        let (_, body) = json_request(
            app.clone(),
            Method::POST,
            "/api/runs",
            Some(json!({
                "version_id": version_id,
                "input": "tides",
                "trigger": {
                    "trigger_id": "ext-1",
                    "name": "webhook relay",
                    "kind": "event",
                    "fired_at": 1700000000000i64,
                    "event": { "ref": "main" }
                }
            })),
        )
        .await;
        assert_eq!(body["success"], true, "{}", body);
        let run_id = body["run_id"].as_str().unwrap().to_string();

        let run = state
            .orchestrator
            .store()
            .get_run(&run_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(run.trigger_id.as_deref(), Some("ext-1"));
        let meta: Value = serde_json::from_str(run.trigger_json.as_deref().unwrap()).unwrap();
        assert_eq!(meta["event"]["ref"], "main");

        let (_, body) = json_request(
            app,
            Method::POST,
            "/api/runs",
            Some(json!({ "version_id": version_id, "trigger": { "trigger_id": "x" } })),
        )
        .await;
        assert_ne!(body["success"], true);
    }

    #[tokio::test]
    async fn latest_version_endpoint_returns_newest_publish() {
        let app = build_api_router(state());
        let (_, body) = json_request(
            app.clone(),
            Method::GET,
            "/api/agents/researcher/versions/latest",
            None,
        )
        .await;
        assert_eq!(body["success"], false);

        json_request(app.clone(), Method::POST, "/api/versions", Some(agent_body())).await;
        let mut edited = agent_body();
        edited["config"]["instructions"] = json!("Research the topic twice.");
        let (_, body) =
            json_request(app.clone(), Method::POST, "/api/versions", Some(edited)).await;
        let newest = body["version_id"].as_str().unwrap().to_string();

        let (_, body) = json_request(
            app,
            Method::GET,
            "/api/agents/researcher/versions/latest",
            None,
        )
        .await;
        assert_eq!(body["success"], true);
        assert_eq!(body["version"]["version_id"], newest);
        assert_eq!(
            body["version"]["config"]["instructions"],
            "Research the topic twice."
        );
    }

    #[tokio::test]
    async fn submitting_against_unknown_version_fails() {
        let app = build_api_router(state());
        let (_, body) = json_request(
            app,
            Method::POST,
            "/api/runs",
            Some(json!({ "version_id": "missing", "input": null })),
        )
        .await;
        assert_eq!(body["success"], false);
        assert!(body["error"].as_str().unwrap().contains("unknown agent version"));
    }

    #[tokio::test]
    async fn cancelling_unknown_run_reports_not_found() {
        let app = build_api_router(state());
        let (_, body) = json_request(app, Method::POST, "/api/runs/nope/cancel", None).await;
        assert_eq!(body["success"], true);
        assert_eq!(body["cancel"]["outcome"], "not_found");
    }

    #[tokio::test]
    async fn events_fire_registered_triggers() {
        let app = build_api_router(state());
        let (_, body) =
            json_request(app.clone(), Method::POST, "/api/versions", Some(agent_body())).await;
        let version_id = body["version_id"].as_str().unwrap().to_string();

        let (_, body) = json_request(
            app.clone(),
            Method::POST,
            "/api/triggers",
            Some(json!({
                "name": "on-push",
                "kind": { "type": "event", "source": "git", "filter": { "pointer": "/ref", "equals": "main" } },
                "version_id": version_id,
                "overlap": "queue"
            })),
        )
        .await;
        assert_eq!(body["success"], true, "{}", body);
        let trigger_id = body["trigger"]["trigger_id"].as_str().unwrap().to_string();

        let (_, body) = json_request(
            app.clone(),
            Method::POST,
            "/api/events/git",
            Some(json!({ "ref": "main" })),
        )
        .await;
        assert_eq!(body["fired"].as_array().unwrap().len(), 1);
        assert_eq!(body["fired"][0]["fire"]["outcome"], "enqueued");

        let (_, body) = json_request(
            app.clone(),
            Method::GET,
            &format!("/api/triggers/{}/fires", trigger_id),
            None,
        )
        .await;
        assert_eq!(body["fires"].as_array().unwrap().len(), 1);

        let (_, body) = json_request(
            app,
            Method::DELETE,
            &format!("/api/triggers/{}", trigger_id),
            None,
        )
        .await;
        assert_eq!(body["success"], true);
    }
}
