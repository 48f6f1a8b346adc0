//! Read-only admin HTTP surface.
//!
//! # Routes
//! - `GET /admin/status`            health, degradation level, queue length
//! - `GET /admin/security/metrics`  24 h security aggregates
//! - `GET /admin/security/report`   metrics plus trends and recommendations
//! - `GET /admin/rate-limits`       rate limiter statistics
//! - `GET /admin/cache`             per-cache statistics and totals
//! - `GET /admin/performance`       monitor statistics and resource status
//!
//! Every route requires `Authorization: Bearer <admin.api_key>`.

pub mod auth;
pub mod handlers;

use std::sync::Arc;
use std::time::Duration;

use axum::{middleware, routing::get, Router};
use tower::ServiceBuilder;
use tower_http::{timeout::TimeoutLayer, trace::TraceLayer};

use self::auth::admin_auth_middleware;
use self::handlers::*;
use crate::gate::Gate;
use crate::security::headers::security_header_layers;

/// Shared state for admin handlers.
#[derive(Clone)]
pub struct AdminState {
    pub gate: Arc<Gate>,
}

pub fn setup_admin_router(gate: Arc<Gate>) -> Router {
    let config = gate.config();
    let state = AdminState { gate };

    let mut router = Router::new()
        .route("/admin/status", get(get_status))
        .route("/admin/security/metrics", get(get_security_metrics))
        .route("/admin/security/report", get(get_security_report))
        .route("/admin/rate-limits", get(get_rate_limits))
        .route("/admin/cache", get(get_cache))
        .route("/admin/performance", get(get_performance))
        .layer(middleware::from_fn_with_state(state.clone(), admin_auth_middleware))
        .with_state(state);

    if config.security.enable_headers {
        for layer in security_header_layers() {
            router = router.layer(layer);
        }
    }

    router.layer(
        ServiceBuilder::new()
            .layer(TraceLayer::new_for_http())
            .layer(TimeoutLayer::new(Duration::from_secs(config.admin.request_timeout_secs))),
    )
}
