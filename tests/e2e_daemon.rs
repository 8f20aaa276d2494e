#![cfg(unix)]


use e2e_harness::{DaemonHarness, TestResult, ensure_success};
use futures_util::StreamExt;
use serde_json::{Value, json};
use tokio_tungstenite::tungstenite::Message as WsMessage;

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn sign_task_lifecycle_drives_the_schedule() -> TestResult<()> {
    let daemon = DaemonHarness::spawn("echo").await?;

    let created = daemon
        .request_json(
            reqwest::Method::POST,
            "/api/sign-tasks",
            Some(json!({
                "name": "daily-checkin",
                "account_name": "alice",
                "sign_at": "09:00",
                "chats": []
            })),
        )
        .await?;
    ensure_success(&created, "create sign task")?;
    assert_eq!(
        daemon.cron_of("sign-daily-checkin").await?.as_deref(),
        Some("0 9 * * *")
    );

    let updated = daemon
        .request_json(
            reqwest::Method::PUT,
            "/api/sign-tasks/daily-checkin",
            Some(json!({ "sign_at": "07:45" })),
        )
        .await?;
    ensure_success(&updated, "reschedule sign task")?;
    assert_eq!(
        daemon.cron_of("sign-daily-checkin").await?.as_deref(),
        Some("45 7 * * *")
    );

    let disabled = daemon
        .request_json(
            reqwest::Method::PUT,
            "/api/sign-tasks/daily-checkin",
            Some(json!({ "enabled": false })),
        )
        .await?;
    ensure_success(&disabled, "disable sign task")?;
    assert_eq!(daemon.cron_of("sign-daily-checkin").await?, None);
    assert!(
        daemon
            .schedule()
            .await?
            .iter()
            .any(|job| job["job_id"] == "system-maintenance")
    );
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn manual_run_records_history() -> TestResult<()> {
    let daemon = DaemonHarness::spawn("echo").await?;
    let created = daemon
        .request_json(
            reqwest::Method::POST,
            "/api/sign-tasks",
            Some(json!({
                "name": "weekly",
                "account_name": "bob",
                "sign_at": "0 8 * * 1"
            })),
        )
        .await?;
    ensure_success(&created, "create sign task")?;

    let run = daemon
        .request_json(reqwest::Method::POST, "/api/sign-tasks/weekly/run", None)
        .await?;
    ensure_success(&run, "run sign task")?;
    assert_eq!(run["state"], "succeeded");
    assert!(
        run["output"]
            .as_str()
            .unwrap_or_default()
            .contains("run-once weekly")
    );

    let history = daemon
        .request_json(
            reqwest::Method::GET,
            "/api/sign-tasks/weekly/history",
            None,
        )
        .await?;
    assert_eq!(history["history"][0]["account"], "bob");
    assert_eq!(history["history"][0]["success"], true);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn api_requires_the_issued_token() -> TestResult<()> {
    let daemon = DaemonHarness::spawn("true").await?;
    assert_eq!(
        daemon
            .request_status(reqwest::Method::GET, "/api/schedule", None)
            .await?,
        401
    );
    assert_eq!(
        daemon
            .request_status(reqwest::Method::GET, "/api/schedule", Some("sdk_wrong"))
            .await?,
        401
    );
    assert_eq!(
        daemon
            .request_status(reqwest::Method::GET, "/api/schedule", Some(&daemon.token))
            .await?,
        200
    );
    Ok(())
}

fn slow_signer(dir: &std::path::Path) -> TestResult<String> {
    use std::os::unix::fs::PermissionsExt;
    let path = dir.join("slow-signer.sh");
    std::fs::write(&path, "#!/bin/sh\necho start\nsleep 1\necho finish\n")?;
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755))?;
    Ok(path.to_string_lossy().into_owned())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn live_logs_refuse_a_bad_token_with_policy_close() -> TestResult<()> {
    let daemon = DaemonHarness::spawn("true").await?;
    for query in ["?token=sdk_wrong", ""] {
        let url = format!(
            "ws://127.0.0.1:{}/api/ws/runs/sign-anything{}",
            daemon.api_port, query
        );
        let (mut socket, _) = tokio_tungstenite::connect_async(url).await?;
        match socket.next().await {
            Some(Ok(WsMessage::Close(Some(frame)))) => {
                assert_eq!(u16::from(frame.code), 1008);
            }
            other => return Err(format!("expected policy close, got {other:?}").into()),
        }
    }
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn live_logs_stream_a_run_until_done() -> TestResult<()> {
    let scripts = tempfile::tempdir()?;
    let daemon = DaemonHarness::spawn(&slow_signer(scripts.path())?).await?;
    let created = daemon
        .request_json(
            reqwest::Method::POST,
            "/api/sign-tasks",
            Some(json!({ "name": "slow", "account_name": "carol", "sign_at": "06:00" })),
        )
        .await?;
    ensure_success(&created, "create sign task")?;

    let run = tokio::spawn(
        reqwest::Client::new()
            .post(format!("{}/api/sign-tasks/slow/run", daemon.api_base))
            .bearer_auth(daemon.token.clone())
            .send(),
    );
    let mut running = false;
    for _ in 0..50 {
        let task = daemon
            .request_json(reqwest::Method::GET, "/api/sign-tasks/slow", None)
            .await?;
        if task["running"] == true {
            running = true;
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    }
    assert!(running, "run never started");

    let url = format!(
        "ws://127.0.0.1:{}/api/ws/runs/sign-slow?token={}",
        daemon.api_port, daemon.token
    );
    let (mut socket, _) = tokio_tungstenite::connect_async(url).await?;
    let mut lines = Vec::new();
    let mut done = false;
    let mut close_code = None;
    while let Some(message) = socket.next().await {
        match message? {
            WsMessage::Text(text) => {
                let frame: Value = serde_json::from_str(&text)?;
                match frame["type"].as_str() {
                    Some("logs") => {
                        for line in frame["data"].as_array().into_iter().flatten() {
                            lines.push(line.as_str().unwrap_or_default().to_string());
                        }
                    }
                    Some("done") => {
                        assert_eq!(frame["is_running"], false);
                        done = true;
                    }
                    other => return Err(format!("unexpected frame type {other:?}").into()),
                }
            }
            WsMessage::Close(frame) => {
                close_code = frame.map(|f| u16::from(f.code));
                break;
            }
            _ => {}
        }
    }
    assert!(done);
    assert_eq!(close_code, Some(1000));
    assert_eq!(lines, vec!["start", "finish"]);

    let result: Value = run.await??.json().await?;
    assert_eq!(result["success"], true);
    Ok(())
}
