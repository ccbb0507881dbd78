use anyhow::{ensure, Result};
use colored::*;
use serde_json::json;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use crate::output::{print_record, TestResult};
use crate::tcp_client::Connection;
use crate::udp_client::Endpoint;

const TIMEOUT: Duration = Duration::from_secs(5);
const SILENCE_WINDOW: Duration = Duration::from_millis(500);

/// Unique user id so runs against a shared server do not collide.
fn test_user(prefix: &str) -> String {
    format!("{prefix}-{}", uuid::Uuid::new_v4())
}

fn finish(scenario: &str, start: Instant, outcome: Result<()>) -> TestResult {
    match outcome {
        Ok(()) => {
            println!("{} {} passed", "✓".green(), scenario);
            TestResult {
                scenario: scenario.to_string(),
                passed: true,
                message: None,
                duration: start.elapsed(),
            }
        }
        Err(e) => {
            println!("{} {} failed: {:#}", "✗".red(), scenario, e);
            TestResult {
                scenario: scenario.to_string(),
                passed: false,
                message: Some(format!("{e:#}")),
                duration: start.elapsed(),
            }
        }
    }
}

/// Two sessions of one user; progress sent on one shows up on the other.
pub async fn test_multi_device(tcp_addr: SocketAddr) -> TestResult {
    let start = Instant::now();
    println!("\n{}", "=== TEST: Multi Device ===".bright_cyan().bold());

    let outcome = async {
        let user_id = test_user("reader");

        println!("{} Connecting phone and tablet as {}...", "→".blue(), user_id);
        let mut phone = Connection::connect(tcp_addr, "phone").await?;
        let mut tablet = Connection::connect(tcp_addr, "tablet").await?;

        for device in [&mut phone, &mut tablet] {
            let ack = device.authenticate(&user_id, TIMEOUT).await?;
            ensure!(ack["status"] == "ok", "{} was refused: {ack}", device.label);
        }
        println!("{} Both devices authenticated", "✓".green());

        println!("{} Phone reports progress...", "→".blue());
        phone
            .send(&json!({
                "type": "progress",
                "content_id": "sync-test-content",
                "position": 17,
            }))
            .await?;

        let update = tablet.wait_for("progress", TIMEOUT).await?;
        print_record(&tablet.label, &update);

        ensure!(update["user_id"] == user_id.as_str(), "wrong user on update: {update}");
        ensure!(update["content_id"] == "sync-test-content", "wrong content: {update}");
        ensure!(update["position"] == 17, "wrong position: {update}");
        ensure!(
            update["timestamp"].as_i64().unwrap_or(0) > 0,
            "update was not stamped: {update}"
        );
        Ok::<(), anyhow::Error>(())
    }
    .await;

    finish("multi_device", start, outcome)
}

/// An empty user id is refused with a reason and the stream is closed.
pub async fn test_auth_rejected(tcp_addr: SocketAddr) -> TestResult {
    let start = Instant::now();
    println!("\n{}", "=== TEST: Auth Rejected ===".bright_cyan().bold());

    let outcome = async {
        let mut anonymous = Connection::connect(tcp_addr, "anonymous").await?;

        println!("{} Authenticating with an empty user id...", "→".blue());
        let ack = anonymous.authenticate("", TIMEOUT).await?;
        print_record(&anonymous.label, &ack);

        ensure!(ack["status"] == "error", "expected a refusal: {ack}");
        ensure!(ack["error"] == "missing_user_id", "unexpected reason: {ack}");

        let after = anonymous.next_record(TIMEOUT).await?;
        ensure!(after.is_none(), "stream stayed open and sent {after:?}");
        println!("{} Server closed the stream", "✓".green());
        Ok::<(), anyhow::Error>(())
    }
    .await;

    finish("auth_rejected", start, outcome)
}

/// Register over UDP, trigger a release and receive it.
pub async fn test_release(udp_addr: SocketAddr) -> TestResult {
    let start = Instant::now();
    println!("\n{}", "=== TEST: Release Notification ===".bright_cyan().bold());

    let outcome = async {
        let user_id = test_user("listener");
        let listener = Endpoint::bind(udp_addr, "listener").await?;
        let admin = Endpoint::bind(udp_addr, "admin").await?;

        println!("{} Registering {}...", "→".blue(), user_id);
        listener
            .send(&json!({
                "type": "register",
                "user_id": user_id,
                "topic_ids": ["sync-test-topic"],
                "client_label": "sync-test-client",
            }))
            .await?;
        let reply = listener.wait_for("register_response", TIMEOUT).await?;
        ensure!(reply["status"] == "ok", "registration refused: {reply}");
        println!("{} Registered", "✓".green());

        println!("{} Triggering a release...", "→".blue());
        admin
            .send(&json!({
                "type": "release",
                "topic_id": "sync-test-topic",
                "title": "Sync Test",
                "milestone": 3,
                "message": "Milestone 3 is out",
            }))
            .await?;

        let release = listener.wait_for("release", TIMEOUT).await?;
        print_record(&listener.label, &release);
        ensure!(release["topic_id"] == "sync-test-topic", "wrong topic: {release}");
        ensure!(release["milestone"] == 3, "wrong milestone: {release}");

        listener
            .send(&json!({"type": "unregister", "user_id": user_id}))
            .await?;
        listener.wait_for("register_response", TIMEOUT).await?;
        Ok::<(), anyhow::Error>(())
    }
    .await;

    finish("release", start, outcome)
}

/// A scoped unregister only removes a registration whose topics overlap.
pub async fn test_scoped_unregister(udp_addr: SocketAddr) -> TestResult {
    let start = Instant::now();
    println!("\n{}", "=== TEST: Scoped Unregister ===".bright_cyan().bold());

    let outcome = async {
        let user_id = test_user("listener");
        let listener = Endpoint::bind(udp_addr, "listener").await?;
        let admin = Endpoint::bind(udp_addr, "admin").await?;
        let release = json!({
            "type": "release",
            "topic_id": "c1",
            "title": "Sync Test",
            "milestone": 1,
            "message": "probe",
        });

        listener
            .send(&json!({"type": "register", "user_id": user_id, "topic_ids": ["c1", "c2"]}))
            .await?;
        listener.wait_for("register_response", TIMEOUT).await?;

        println!("{} Unregistering topic c3 (no overlap)...", "→".blue());
        listener
            .send(&json!({"type": "unregister", "user_id": user_id, "topic_ids": ["c3"]}))
            .await?;
        listener.wait_for("register_response", TIMEOUT).await?;

        admin.send(&release).await?;
        listener.wait_for("release", TIMEOUT).await?;
        println!("{} Registration survived", "✓".green());

        println!("{} Unregistering topic c2 (overlap)...", "→".blue());
        listener
            .send(&json!({"type": "unregister", "user_id": user_id, "topic_ids": ["c2"]}))
            .await?;
        listener.wait_for("register_response", TIMEOUT).await?;

        admin.send(&release).await?;
        ensure!(
            listener.stays_silent("release", SILENCE_WINDOW).await,
            "release still delivered after unregister"
        );
        println!("{} Registration removed", "✓".green());
        Ok::<(), anyhow::Error>(())
    }
    .await;

    finish("scoped_unregister", start, outcome)
}
