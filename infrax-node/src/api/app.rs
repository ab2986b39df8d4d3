//! App API Handlers
//!
//! Install and removal of apps on nodes with an app directory.

use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
};
use std::sync::Arc;

use crate::api::error::ApiResult;
use crate::node::Node;

/// POST /app/{app_id}
/// Starts the install; failures are reported to the router
pub async fn install_app(
    State(node): State<Arc<Node>>,
    Path(app_id): Path<String>,
) -> ApiResult<StatusCode> {
    tracing::info!("Install requested for app: {}", app_id);

    node.install_app(&app_id)?;

    Ok(StatusCode::ACCEPTED)
}

/// DELETE /app/{app_id}
pub async fn uninstall_app(
    State(node): State<Arc<Node>>,
    Path(app_id): Path<String>,
) -> ApiResult<StatusCode> {
    tracing::info!("Uninstall requested for app: {}", app_id);

    node.uninstall_app(&app_id).await?;

    Ok(StatusCode::NO_CONTENT)
}

/// GET /apps
pub async fn list_apps(State(node): State<Arc<Node>>) -> ApiResult<Json<Vec<String>>> {
    Ok(Json(node.list_apps().await?))
}

#[cfg(all(test, unix))]
mod tests {
    use crate::api::create_router;
    use crate::config::Config;
    use crate::db::test_support::{scratch_dir, test_pool};
    use crate::node::apps::test_support::MemoryCatalog;
    use crate::node::{Node, NodeServices};
    use crate::sandbox::{ProcessSandbox, SandboxPolicy};
    use axum::Router;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use http_body_util::BodyExt;
    use std::path::PathBuf;
    use std::sync::Arc;
    use std::time::Duration;
    use tower::ServiceExt;

    async fn test_app(app_dir: Option<PathBuf>) -> (Router, Arc<Node>, Arc<MemoryCatalog>) {
        let config = Config {
            local_only: true,
            workspace_base: scratch_dir("api"),
            app_dir,
            ..Default::default()
        };
        let catalog = Arc::new(MemoryCatalog::default().with_app("hello"));
        let runner = Arc::new(ProcessSandbox::new(SandboxPolicy::from_config(&config)));
        let services = NodeServices {
            catalog: Some(catalog.clone()),
            ..NodeServices::local()
        };
        let node = Arc::new(
            Node::with_services(config, test_pool().await, runner, services)
                .await
                .unwrap(),
        );
        (create_router(Arc::clone(&node)), node, catalog)
    }

    async fn call(app: &Router, method: &str, uri: &str) -> (StatusCode, serde_json::Value) {
        let request = Request::builder()
            .method(method)
            .uri(uri)
            .body(Body::empty())
            .unwrap();
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let body = serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null);
        (status, body)
    }

    async fn wait_for_apps(app: &Router, expected: serde_json::Value) {
        for _ in 0..200 {
            let (status, body) = call(app, "GET", "/apps").await;
            assert_eq!(status, StatusCode::OK);
            if body == expected {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("apps never became {}", expected);
    }

    #[tokio::test]
    async fn test_install_list_uninstall() {
        let (app, node, catalog) = test_app(Some(scratch_dir("apps"))).await;

        let (status, _) = call(&app, "POST", "/app/hello").await;
        assert_eq!(status, StatusCode::ACCEPTED);
        wait_for_apps(&app, serde_json::json!(["hello"])).await;
        for _ in 0..200 {
            if !catalog.events().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let (status, body) = call(&app, "POST", "/app/hello").await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert!(body["error"].as_str().unwrap().contains("hello"));

        let (status, _) = call(&app, "DELETE", "/app/hello").await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        wait_for_apps(&app, serde_json::json!([])).await;

        let (status, _) = call(&app, "DELETE", "/app/hello").await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        assert_eq!(
            catalog.events(),
            vec!["installed hello".to_string(), "uninstalled hello".to_string()]
        );
        node.shutdown().await;
    }

    #[tokio::test]
    async fn test_invalid_app_id() {
        let (app, node, _catalog) = test_app(Some(scratch_dir("apps"))).await;

        let (status, _) = call(&app, "POST", "/app/.staging-hello").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        node.shutdown().await;
    }

    #[tokio::test]
    async fn test_apps_need_an_app_dir() {
        let (app, node, _catalog) = test_app(None).await;

        let (status, body) = call(&app, "POST", "/app/hello").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().unwrap().contains("app_dir"));

        let (status, _) = call(&app, "GET", "/apps").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        node.shutdown().await;
    }
}
