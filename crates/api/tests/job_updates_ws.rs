//! Live job subscriptions against a real listener.

mod common;

use std::net::SocketAddr;
use std::time::Duration;

use a6hub_api::state::AppState;
use a6hub_core::job_events::JobUpdate;
use a6hub_core::progress::ProgressData;
use a6hub_core::types::DbId;
use a6hub_db::store::JobStore;
use a6hub_events::UpdateBus;
use common::{context, create_job, token};
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

async fn serve(state: AppState) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = common::build_test_app(state);
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

async fn connect(addr: SocketAddr, job_id: DbId, token: &str) -> Client {
    let url = format!("ws://{addr}/api/v1/ws/jobs/{job_id}?token={token}");
    let (client, _) = connect_async(url).await.unwrap();
    client
}

/// Next text frame as JSON.
async fn next_json(client: &mut Client) -> Value {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match client.next().await {
                Some(Ok(Message::Text(text))) => return serde_json::from_str(&text).unwrap(),
                Some(Ok(_)) => continue,
                other => panic!("stream ended: {other:?}"),
            }
        }
    })
    .await
    .expect("no frame received")
}

/// Close code the server refused with.
async fn close_code(client: &mut Client) -> u16 {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match client.next().await {
                Some(Ok(Message::Close(Some(frame)))) => return u16::from(frame.code),
                Some(Ok(_)) => continue,
                other => panic!("expected close frame, got {other:?}"),
            }
        }
    })
    .await
    .expect("no close frame received")
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[tokio::test]
async fn snapshot_comes_before_relayed_updates() {
    let ctx = context();
    let project = ctx.store.insert_project(1, "private").await;
    let job = create_job(&ctx.store, project.id, 1).await;
    ctx.store.mark_running(job.id, "w-1").await.unwrap();
    let progress = ProgressData {
        current_step: Some("floorplan".into()),
        progress_percent: 20,
        completed_steps: vec!["synthesis".into()],
        steps_info: vec![],
    };
    ctx.store.update_progress(job.id, &progress).await.unwrap();

    // Published before anyone listens; never delivered.
    ctx.bus.publish(&JobUpdate::log(job.id, "early")).await.unwrap();

    let addr = serve(ctx.state.clone()).await;
    let mut client = connect(addr, job.id, &token(1)).await;

    let snapshot = next_json(&mut client).await;
    assert_eq!(snapshot["type"], "connected");
    assert_eq!(snapshot["job_id"], job.id);
    assert_eq!(snapshot["status"], "running");
    assert_eq!(snapshot["current_step"], "floorplan");
    assert_eq!(snapshot["progress"], 20);
    assert_eq!(snapshot["completed_steps"], serde_json::json!(["synthesis"]));

    ctx.state.publisher.log(job.id, "[INFO] Running Placement").await;
    let update = next_json(&mut client).await;
    assert_eq!(update["type"], "log");
    assert_eq!(update["log_line"], "[INFO] Running Placement");
}

#[tokio::test]
async fn two_subscribers_both_receive_and_one_leaving_does_not_block_the_other() {
    let ctx = context();
    let project = ctx.store.insert_project(1, "public").await;
    let job = create_job(&ctx.store, project.id, 1).await;
    let addr = serve(ctx.state.clone()).await;

    let mut first = connect(addr, job.id, &token(1)).await;
    let mut second = connect(addr, job.id, &token(2)).await;
    assert_eq!(next_json(&mut first).await["type"], "connected");
    assert_eq!(next_json(&mut second).await["type"], "connected");
    assert_eq!(ctx.state.fanout.subscriber_count(job.id).await, 2);

    ctx.state.publisher.log(job.id, "shared line").await;
    assert_eq!(next_json(&mut first).await["log_line"], "shared line");
    assert_eq!(next_json(&mut second).await["log_line"], "shared line");

    drop(first);
    ctx.state.publisher.log(job.id, "after leave").await;
    assert_eq!(next_json(&mut second).await["log_line"], "after leave");

    tokio::time::timeout(Duration::from_secs(5), async {
        while ctx.state.fanout.subscriber_count(job.id).await != 1 {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("dropped subscriber was not removed");
}

#[tokio::test]
async fn last_subscriber_leaving_releases_the_bus_subscription() {
    let ctx = context();
    let project = ctx.store.insert_project(1, "private").await;
    let job = create_job(&ctx.store, project.id, 1).await;
    let addr = serve(ctx.state.clone()).await;

    let mut client = connect(addr, job.id, &token(1)).await;
    next_json(&mut client).await;
    assert_eq!(ctx.bus.receiver_count(), 1);

    client.close(None).await.unwrap();
    tokio::time::timeout(Duration::from_secs(5), async {
        while ctx.bus.receiver_count() != 0 || ctx.state.fanout.job_count().await != 0 {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("relay was not stopped");
}

#[tokio::test]
async fn text_ping_is_answered_with_pong() {
    let ctx = context();
    let project = ctx.store.insert_project(1, "private").await;
    let job = create_job(&ctx.store, project.id, 1).await;
    let addr = serve(ctx.state).await;

    let mut client = connect(addr, job.id, &token(1)).await;
    next_json(&mut client).await;
    client.send(Message::Text("ping".into())).await.unwrap();
    assert_eq!(next_json(&mut client).await, serde_json::json!({ "type": "pong" }));
}

#[tokio::test]
async fn refusals_carry_close_codes() {
    let ctx = context();
    let private = ctx.store.insert_project(1, "private").await;
    let job = create_job(&ctx.store, private.id, 1).await;
    let addr = serve(ctx.state).await;

    let mut client = connect(addr, job.id, "not-a-token").await;
    assert_eq!(close_code(&mut client).await, 4001);

    let mut client = connect(addr, 9999, &token(1)).await;
    assert_eq!(close_code(&mut client).await, 4004);

    let mut client = connect(addr, job.id, &token(2)).await;
    assert_eq!(close_code(&mut client).await, 4003);
}
