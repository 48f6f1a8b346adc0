//! Admission queue behaviour under moderate pressure, on paused Tokio time.

mod common;

use std::time::Duration;

use common::{test_config, test_gate, test_gate_with};
use tool_gate::resources::{AdmissionError, DegradationLevel};
use tool_gate::ErrorCode;

#[tokio::test(start_paused = true)]
async fn test_queued_requests_released_when_pressure_drops() {
    let t = test_gate();
    t.set_pressure(0.8);
    let resources = t.gate.resources().clone();
    assert_eq!(resources.current_strategy().level, DegradationLevel::Moderate);

    let mut handles = Vec::new();
    for _ in 0..3 {
        let resources = resources.clone();
        handles.push(tokio::spawn(async move {
            resources.should_allow_request("convert_color").await
        }));
    }

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(resources.queue_length(), 3);

    t.set_pressure(0.1);
    for handle in handles {
        assert_eq!(handle.await.unwrap(), Ok(()));
    }
    assert_eq!(resources.queue_length(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_queue_wait_times_out() {
    let t = test_gate();
    t.set_pressure(0.8);
    let resources = t.gate.resources().clone();

    let started = tokio::time::Instant::now();
    let result = resources.should_allow_request("analyze_color").await;
    assert_eq!(result, Err(AdmissionError::QueueTimeout { waited_ms: 30_000 }));
    assert!(started.elapsed() >= Duration::from_millis(30_000));
    assert_eq!(resources.queue_length(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_queue_overflow() {
    let mut config = test_config();
    config.resources.max_queue_size = 2;
    let t = test_gate_with(config);
    t.set_pressure(0.8);
    let resources = t.gate.resources().clone();

    let mut waiters = Vec::new();
    for _ in 0..2 {
        let resources = resources.clone();
        waiters.push(tokio::spawn(async move {
            resources.should_allow_request("convert_color").await
        }));
    }
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(resources.queue_length(), 2);

    assert_eq!(
        resources.should_allow_request("convert_color").await,
        Err(AdmissionError::QueueOverflow)
    );

    t.set_pressure(0.0);
    for waiter in waiters {
        assert_eq!(waiter.await.unwrap(), Ok(()));
    }
}

#[tokio::test(start_paused = true)]
async fn test_destroy_fails_waiters() {
    let t = test_gate();
    t.set_pressure(0.8);
    let resources = t.gate.resources().clone();

    let waiter = {
        let resources = resources.clone();
        tokio::spawn(async move { resources.should_allow_request("convert_color").await })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(resources.queue_length(), 1);

    t.gate.destroy().await;
    assert_eq!(waiter.await.unwrap(), Err(AdmissionError::ShuttingDown));
    assert_eq!(
        resources.should_allow_request("convert_color").await,
        Err(AdmissionError::ShuttingDown)
    );
}

#[tokio::test(start_paused = true)]
async fn test_check_waits_then_passes() {
    let t = test_gate();
    t.set_pressure(0.8);
    let gate = t.gate.clone();

    let check = tokio::spawn(async move {
        gate.check_security("convert_color", "c1", serde_json::json!({"color": "#00FF00", "output_format": "hsl"}))
            .await
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!check.is_finished());

    t.set_pressure(0.2);
    let result = check.await.unwrap();
    assert!(result.allowed, "{:?}", result.errors);
}

#[tokio::test(start_paused = true)]
async fn test_check_timeout_is_resource_exhausted() {
    let t = test_gate();
    t.set_pressure(0.8);

    let result = t
        .gate
        .check_security("convert_color", "c1", serde_json::json!({"color": "#00FF00", "output_format": "hsl"}))
        .await;
    assert!(!result.allowed);
    assert!(result.has_error(ErrorCode::ResourceExhausted));
    let metrics = t.gate.auditor().metrics();
    assert_eq!(metrics.events_by_type["resource_abuse"], 1);
    // High-severity resource abuse escalates.
    assert_eq!(t.gate.auditor().client_event_count("c1", 60_000), 2);
}
