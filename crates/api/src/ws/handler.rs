use a6hub_core::job_events::JobUpdate;
use a6hub_core::job_status::JobStatus;
use a6hub_core::types::DbId;
use a6hub_db::models::job::Job;
use axum::extract::ws::{CloseFrame, Message, Utf8Bytes, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::response::IntoResponse;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;

use crate::access;
use crate::middleware::auth::authenticate;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct SubscribeParams {
    pub token: Option<String>,
}

/// Why a subscription was refused. Sent as the close frame right after the
/// upgrade.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    Unauthenticated,
    NotFound,
    Forbidden,
    Unavailable,
}

impl Rejection {
    pub fn close_code(self) -> u16 {
        match self {
            Rejection::Unauthenticated => 4001,
            Rejection::Forbidden => 4003,
            Rejection::NotFound => 4004,
            Rejection::Unavailable => 1011,
        }
    }

    fn reason(self) -> &'static str {
        match self {
            Rejection::Unauthenticated => "Authentication failed",
            Rejection::Forbidden => "Access denied",
            Rejection::NotFound => "Job not found",
            Rejection::Unavailable => "Job state unavailable",
        }
    }
}

/// GET /api/v1/ws/jobs/{job_id}?token=<jwt>
///
/// Upgrades unconditionally so refusals can carry a close code.
pub async fn job_updates_ws(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Path(job_id): Path<DbId>,
    Query(params): Query<SubscribeParams>,
) -> impl IntoResponse {
    let access = authorize(&state, job_id, params.token.as_deref()).await;
    ws.on_upgrade(move |socket| async move {
        match access {
            Ok((job, status)) => handle_socket(socket, state, job, status).await,
            Err(rejection) => refuse(socket, job_id, rejection).await,
        }
    })
}

/// Check the token, the job and read access, in that order.
pub async fn authorize(
    state: &AppState,
    job_id: DbId,
    token: Option<&str>,
) -> Result<(Job, JobStatus), Rejection> {
    let user_id = token
        .and_then(|t| authenticate(t, &state.config.jwt).ok())
        .ok_or(Rejection::Unauthenticated)?;

    let job = match state.store.find_job(job_id).await {
        Ok(Some(job)) => job,
        Ok(None) => return Err(Rejection::NotFound),
        Err(e) => {
            tracing::error!(job_id, error = %e, "Failed to load job for subscription");
            return Err(Rejection::Unavailable);
        }
    };
    let project = match state.store.find_project(job.project_id).await {
        Ok(project) => project,
        Err(e) => {
            tracing::error!(job_id, error = %e, "Failed to load project for subscription");
            return Err(Rejection::Unavailable);
        }
    };

    if !access::can_read(user_id, &job, project.as_ref()) {
        return Err(Rejection::Forbidden);
    }
    let status = job.status().ok_or(Rejection::Unavailable)?;
    Ok((job, status))
}

async fn refuse(mut socket: WebSocket, job_id: DbId, rejection: Rejection) {
    tracing::info!(job_id, code = rejection.close_code(), "Job subscription refused");
    let frame = CloseFrame {
        code: rejection.close_code(),
        reason: Utf8Bytes::from_static(rejection.reason()),
    };
    let _ = socket.send(Message::Close(Some(frame))).await;
}

/// The `connected` snapshot every subscriber receives first.
pub fn snapshot(job: &Job, status: JobStatus) -> Message {
    let update = JobUpdate::connected(job.id, status, &job.progress());
    match serde_json::to_string(&update) {
        Ok(text) => Message::Text(text.into()),
        Err(_) => Message::Text(Utf8Bytes::from_static(r#"{"type":"connected"}"#)),
    }
}

async fn handle_socket(socket: WebSocket, state: AppState, job: Job, status: JobStatus) {
    let job_id = job.id;
    let conn_id = uuid::Uuid::new_v4().to_string();
    tracing::info!(job_id, conn_id = %conn_id, "Job subscriber connected");

    let mut updates = state.fanout.join(job_id, conn_id.clone()).await;

    // Re-read after joining so nothing relayed predates the snapshot.
    let (job, status) = match state.store.find_job(job_id).await {
        Ok(Some(fresh)) => match fresh.status() {
            Some(fresh_status) => (fresh, fresh_status),
            None => (job, status),
        },
        _ => (job, status),
    };

    let (mut sink, mut stream) = socket.split();

    if sink.send(snapshot(&job, status)).await.is_ok() {
        let mut relaying = true;
        loop {
            tokio::select! {
                outbound = updates.recv(), if relaying => match outbound {
                    Some(message) => {
                        if sink.send(message).await.is_err() {
                            break;
                        }
                    }
                    None => relaying = false,
                },
                inbound = stream.next() => match inbound {
                    Some(Ok(Message::Text(text))) if text.as_str().trim() == "ping" => {
                        let pong = Message::Text(Utf8Bytes::from_static(r#"{"type":"pong"}"#));
                        if sink.send(pong).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Pong(_))) => {
                        tracing::trace!(conn_id = %conn_id, "Pong received");
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        tracing::debug!(conn_id = %conn_id, error = %e, "WebSocket receive error");
                        break;
                    }
                },
            }
        }
    }

    state.fanout.leave(job_id, &conn_id).await;
    tracing::info!(job_id, conn_id = %conn_id, "Job subscriber disconnected");
}
