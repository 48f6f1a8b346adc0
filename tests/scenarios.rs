mod common;

use serde_json::json;

use common::{test_gate, EchoHandler};
use tool_gate::resources::{degradation_strategy, AdmissionError, DegradationLevel, UsageSnapshot};
use tool_gate::security::{sanitize_color_input, EventType, NewSecurityEvent, Severity};
use tool_gate::{ErrorCode, Gate, GateError, SecurityCheckResult};

#[tokio::test]
async fn test_rate_limit_denies_after_limit() {
    let t = test_gate();
    let limiter = t.gate.rate_limiter();

    for i in 0..10 {
        let info = limiter.check_rate_limit("extract_palette_from_image", "c1", None);
        assert!(info.allowed, "request {} denied", i + 1);
        assert_eq!(info.remaining_requests, 9 - i);
    }

    let denied = limiter.check_rate_limit("extract_palette_from_image", "c1", None);
    assert!(!denied.allowed);
    assert_eq!(denied.remaining_requests, 0);
    assert!(denied.retry_after_ms.unwrap() > 0);

    // Another caller has its own window.
    assert!(limiter
        .check_rate_limit("extract_palette_from_image", "c2", None)
        .allowed);

    t.clock.advance(60_000);
    let fresh = limiter.check_rate_limit("extract_palette_from_image", "c1", None);
    assert!(fresh.allowed);
    assert_eq!(fresh.remaining_requests, 9);
}

#[tokio::test]
async fn test_rate_limit_through_gate_logs_event() {
    let t = test_gate();
    let params = json!({"image_url": "https://images.example.com/p.png"});
    for _ in 0..10 {
        let result = t
            .gate
            .check_security("extract_palette_from_image", "c1", params.clone())
            .await;
        assert!(result.allowed, "{:?}", result.errors);
    }

    let result = t
        .gate
        .check_security("extract_palette_from_image", "c1", params)
        .await;
    assert!(!result.allowed);
    assert!(result.has_error(ErrorCode::RateLimitExceeded));
    assert_eq!(t.gate.auditor().metrics().events_by_type["rate_limit"], 1);
}

#[tokio::test]
async fn test_rate_limited_caller_allowed_after_window() {
    let t = test_gate();
    async fn check(gate: &Gate) -> SecurityCheckResult {
        let params = json!({"image_url": "https://images.example.com/p.png"});
        gate.check_security("extract_palette_from_image", "c", params).await
    }

    for _ in 0..10 {
        assert!(check(&t.gate).await.allowed);
    }
    for _ in 0..20 {
        assert!(check(&t.gate).await.has_error(ErrorCode::RateLimitExceeded));
    }
    assert_eq!(t.gate.auditor().client_risk_score("c"), 100);
    assert_eq!(t.gate.auditor().client_block_score("c"), 0);

    t.clock.advance(60_001);
    let result = check(&t.gate).await;
    assert!(result.allowed, "{:?}", result.errors);

    t.clock.advance(24 * 60 * 60 * 1000);
    assert!(check(&t.gate).await.allowed);
}

#[tokio::test]
async fn test_high_risk_caller_blocked() {
    let t = test_gate();
    for _ in 0..150 {
        t.gate.auditor().log_security_event(NewSecurityEvent::new(
            EventType::SuspiciousActivity,
            Severity::High,
            "analyze_color",
            "x",
        ));
    }
    assert_eq!(t.gate.auditor().client_risk_score("x"), 100);

    let result = t
        .gate
        .check_security(
            "convert_color",
            "x",
            json!({"color": "<script>alert(1)</script>#FF0000", "output_format": "rgb"}),
        )
        .await;
    assert!(!result.allowed);
    assert!(result.has_error(ErrorCode::SecurityBlocked));
    assert!(result.errors[0].message.to_lowercase().contains("blocked"));

    // A clean caller sending the same input is only sanitized.
    let clean = t
        .gate
        .check_security(
            "convert_color",
            "y",
            json!({"color": "<script>alert(1)</script>#FF0000", "output_format": "rgb"}),
        )
        .await;
    assert!(clean.allowed, "{:?}", clean.errors);
    assert_eq!(clean.sanitized_parameters.unwrap()["color"], "#FF0000");
}

#[tokio::test]
async fn test_aggressive_pressure_rejects() {
    let limits = common::test_config().resources;
    let snapshot = UsageSnapshot {
        memory_usage_bytes: (limits.memory_limit_bytes as f64 * 0.95) as u64,
        concurrent_requests: (limits.max_concurrent_requests as f64 * 0.96) as usize,
        cache_size_bytes: (limits.max_cache_bytes as f64 * 0.98) as u64,
    };
    assert_eq!(
        degradation_strategy(&snapshot, &limits).level,
        DegradationLevel::Aggressive
    );

    let t = test_gate();
    t.set_pressure(0.95);
    let resources = t.gate.resources();
    for op in ["convert_color", "analyze_color", "create_palette_png"] {
        assert!(matches!(
            resources.should_allow_request(op).await,
            Err(AdmissionError::Rejected { .. })
        ));
    }
    assert!(!resources.is_operation_allowed("extract_palette_from_image"));

    let handler = EchoHandler::default();
    let err = t
        .gate
        .execute("analyze_color", "c", json!({"color": "red"}), &handler)
        .await
        .unwrap_err();
    assert!(matches!(err, GateError::Denied(f) if f.code == ErrorCode::ResourceExhausted));
    assert_eq!(handler.calls(), 0);
}

#[test]
fn test_color_script_stripped() {
    let result = sanitize_color_input("<script>alert(1)</script>#FF0000");
    assert_eq!(result.value, "#FF0000");
    assert!(result.was_modified);
    assert!(!result.issues.is_empty());
}

#[tokio::test]
async fn test_execute_end_to_end() {
    let t = test_gate();
    let handler = EchoHandler::default();
    let params = json!({
        "palette": ["#112233", "<img src=x onerror=alert(1)>#445566"],
        "title": "<b>Brand</b>",
        "width": "800",
        "height": 600
    });

    let output = t
        .gate
        .execute("create_palette_png", "designer", params.clone(), &handler)
        .await
        .unwrap();
    assert!(!output.cached);
    assert_eq!(output.value["palette"][1], "#445566");
    assert_eq!(output.value["title"], "<b>Brand</b>");
    assert_eq!(output.value["width"], 800);

    let again = t
        .gate
        .execute("create_palette_png", "designer", params, &handler)
        .await
        .unwrap();
    assert!(again.cached);
    assert_eq!(handler.calls(), 1);
    assert_eq!(t.gate.caches().cache("image").len(), 1);
}
