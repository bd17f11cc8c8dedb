#![allow(dead_code)]

use std::sync::Arc;

use a6hub_api::auth::jwt::{generate_access_token, JwtConfig};
use a6hub_api::config::ServerConfig;
use a6hub_api::router::build_app_router;
use a6hub_api::state::AppState;
use a6hub_api::ws::JobFanout;
use a6hub_core::job_type::JobType;
use a6hub_core::types::DbId;
use a6hub_db::models::job::{CreateJob, Job};
use a6hub_db::store::{JobStore, MemoryStore};
use a6hub_events::{LocalBus, ProgressPublisher};
use axum::body::Body;
use axum::http::{Method, Request};
use axum::response::Response;
use axum::Router;
use http_body_util::BodyExt;
use serde_json::Value;
use tower::ServiceExt;

const JWT_SECRET: &str = "test-secret-that-is-long-enough-for-hmac";

/// In-memory backends plus the state wired over them.
pub struct TestContext {
    pub store: Arc<MemoryStore>,
    pub bus: Arc<LocalBus>,
    pub state: AppState,
}

pub fn test_config() -> ServerConfig {
    ServerConfig {
        host: "127.0.0.1".to_string(),
        port: 0,
        cors_origins: vec!["http://localhost:5173".to_string()],
        request_timeout_secs: 30,
        shutdown_timeout_secs: 30,
        jwt: JwtConfig {
            secret: JWT_SECRET.to_string(),
        },
    }
}

pub fn context() -> TestContext {
    let store = Arc::new(MemoryStore::new());
    let bus = Arc::new(LocalBus::default());
    let state = AppState {
        store: store.clone(),
        queue: store.clone(),
        config: Arc::new(test_config()),
        publisher: ProgressPublisher::new(bus.clone()),
        fanout: Arc::new(JobFanout::new(bus.clone())),
    };
    TestContext { store, bus, state }
}

pub fn build_test_app(state: AppState) -> Router {
    build_app_router(state)
}

pub fn token(user_id: DbId) -> String {
    generate_access_token(
        user_id,
        900,
        &JwtConfig {
            secret: JWT_SECRET.to_string(),
        },
    )
    .unwrap()
}

pub async fn create_job(store: &MemoryStore, project_id: DbId, user_id: DbId) -> Job {
    store
        .create_job(&CreateJob {
            job_type: JobType::Build,
            config: serde_json::json!({ "design_name": "adder" }),
            project_id,
            user_id,
        })
        .await
        .unwrap()
}

/// Issue a request, authenticated as `user` when given.
pub async fn send(
    app: Router,
    method: Method,
    uri: &str,
    user: Option<DbId>,
    body: Option<Value>,
) -> Response {
    let mut builder = Request::builder().method(method).uri(uri);
    if let Some(user_id) = user {
        builder = builder.header("authorization", format!("Bearer {}", token(user_id)));
    }
    let body = match body {
        Some(json) => {
            builder = builder.header("content-type", "application/json");
            Body::from(json.to_string())
        }
        None => Body::empty(),
    };
    app.oneshot(builder.body(body).unwrap()).await.unwrap()
}

pub async fn get(app: Router, uri: &str, user: Option<DbId>) -> Response {
    send(app, Method::GET, uri, user, None).await
}

pub async fn post_json(app: Router, uri: &str, user: Option<DbId>, body: Value) -> Response {
    send(app, Method::POST, uri, user, Some(body)).await
}

pub async fn body_json(response: Response) -> Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}
