//! Job API Handlers
//!
//! Submission, inspection and cancellation of jobs on this node.

use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
};
use infrax_core::domain::job::JobRecord;
use infrax_core::dto::job::{ListJobsQuery, SubmitJob};
use std::sync::Arc;
use uuid::Uuid;

use crate::api::error::ApiResult;
use crate::node::Node;

/// POST /job
/// Queue a job; 429 when the queue is full
pub async fn submit_job(
    State(node): State<Arc<Node>>,
    Json(req): Json<SubmitJob>,
) -> ApiResult<(StatusCode, Json<JobRecord>)> {
    tracing::info!("Received job for app: {}", req.app);

    let record = node.submit_job(req).await?;

    Ok((StatusCode::CREATED, Json(record)))
}

/// GET /job/{id}
pub async fn get_job(
    State(node): State<Arc<Node>>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<JobRecord>> {
    tracing::debug!("Getting job: {}", id);

    Ok(Json(node.get_job(id).await?))
}

/// GET /jobs?state=
pub async fn list_jobs(
    State(node): State<Arc<Node>>,
    Query(query): Query<ListJobsQuery>,
) -> ApiResult<Json<Vec<JobRecord>>> {
    tracing::debug!("Listing jobs (state: {:?})", query.state);

    Ok(Json(node.list_jobs(query.state).await?))
}

/// POST /job/{id}/cancel
/// Answers once the job is recorded Cancelled
pub async fn cancel_job(
    State(node): State<Arc<Node>>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<JobRecord>> {
    tracing::info!("Cancelling job: {}", id);

    Ok(Json(node.cancel(id).await?))
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::api::create_router;
    use crate::config::Config;
    use crate::db::test_support::{scratch_dir, test_pool};
    use crate::sandbox::{ProcessSandbox, SandboxPolicy};
    use crate::upload::LogSink;
    use axum::body::Body;
    use axum::http::Request;
    use axum::Router;
    use http_body_util::BodyExt;
    use infrax_core::domain::job::JobState;
    use infrax_core::domain::node::NodeStatus;
    use std::time::Duration;
    use tower::ServiceExt;

    async fn test_app(queue_capacity: usize) -> (Router, Arc<Node>) {
        let config = Config {
            local_only: true,
            max_concurrent_jobs: 1,
            queue_capacity,
            workspace_base: scratch_dir("api"),
            ..Default::default()
        };
        let runner = Arc::new(ProcessSandbox::new(SandboxPolicy::from_config(&config)));
        let node = Arc::new(
            Node::with_parts(config, test_pool().await, runner, Arc::new(LogSink))
                .await
                .unwrap(),
        );
        (create_router(Arc::clone(&node)), node)
    }

    async fn call(app: &Router, request: Request<Body>) -> (StatusCode, serde_json::Value) {
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let body = serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null);
        (status, body)
    }

    fn post_json(uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::post(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn get(uri: &str) -> Request<Body> {
        Request::get(uri).body(Body::empty()).unwrap()
    }

    #[tokio::test]
    async fn test_submit_and_get_job() {
        let (app, node) = test_app(8).await;

        let (status, body) = call(
            &app,
            post_json("/job", serde_json::json!({ "app": "sh", "args": ["-c", "echo hi"] })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        let record: JobRecord = serde_json::from_value(body).unwrap();
        assert_eq!(record.state, JobState::Queued);

        let (status, body) = call(&app, get(&format!("/job/{}", record.id()))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["request"]["app"], "sh");

        let (status, _) = call(&app, get(&format!("/job/{}", Uuid::new_v4()))).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        node.shutdown().await;
    }

    #[tokio::test]
    async fn test_submit_rejections() {
        let (app, node) = test_app(1).await;

        let (status, body) = call(&app, post_json("/job", serde_json::json!({ "app": "" }))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().unwrap().contains("app"));

        let id = Uuid::new_v4();
        let sleeper = serde_json::json!({ "id": id, "app": "sh", "args": ["-c", "sleep 30"] });
        let (status, _) = call(&app, post_json("/job", sleeper.clone())).await;
        assert_eq!(status, StatusCode::CREATED);

        // Wait for the sleeper to take the only slot
        for _ in 0..200 {
            if node.get_job(id).await.unwrap().state == JobState::Running {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let (status, _) = call(&app, post_json("/job", sleeper)).await;
        assert_eq!(status, StatusCode::CONFLICT);

        let queued = serde_json::json!({ "app": "sh", "args": ["-c", "true"] });
        let (status, _) = call(&app, post_json("/job", queued.clone())).await;
        assert_eq!(status, StatusCode::CREATED);

        let response = app.clone().oneshot(post_json("/job", queued)).await.unwrap();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert!(response.headers().contains_key("retry-after"));

        let (status, body) = call(&app, post_json(&format!("/job/{}/cancel", id), serde_json::json!({}))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["state"], "Cancelled");

        let (status, _) = call(&app, post_json(&format!("/job/{}/cancel", id), serde_json::json!({}))).await;
        assert_eq!(status, StatusCode::CONFLICT);

        node.shutdown().await;
    }

    #[tokio::test]
    async fn test_list_jobs_by_state_and_status() {
        let (app, node) = test_app(8).await;

        let (_, body) = call(
            &app,
            post_json("/job", serde_json::json!({ "app": "sh", "args": ["-c", "exit 0"] })),
        )
        .await;
        let id: Uuid = serde_json::from_value(body["request"]["id"].clone()).unwrap();

        for _ in 0..300 {
            if node.get_job(id).await.unwrap().state == JobState::Succeeded {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let (status, body) = call(&app, get("/jobs?state=Succeeded")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body.as_array().unwrap().len(), 1);

        let (_, body) = call(&app, get("/jobs?state=Queued")).await;
        assert!(body.as_array().unwrap().is_empty());

        let (status, body) = call(&app, get("/status")).await;
        assert_eq!(status, StatusCode::OK);
        let status: NodeStatus = serde_json::from_value(body).unwrap();
        assert_eq!(status.slots_total, 1);
        assert_eq!(status.queue_capacity, 8);

        let response = app.clone().oneshot(get("/__health")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        node.shutdown().await;
    }
}
