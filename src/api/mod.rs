//! Admin and status API.

pub mod accounts;
pub mod keys;
pub mod status;

use std::sync::Arc;

use axum::{
    extract::{Request, State},
    http::StatusCode,
    middleware::{self, Next},
    response::Response,
    routing::{get, post},
    Router,
};

use crate::AppState;

/// Routes mounted under `/api`. Status endpoints are public; everything
/// else sits behind the admin bearer password.
pub fn api_router(state: Arc<AppState>) -> Router<Arc<AppState>> {
    let admin = Router::new()
        .route(
            "/accounts",
            get(accounts::list).post(accounts::create),
        )
        .route(
            "/accounts/:id",
            get(accounts::get_one)
                .put(accounts::update)
                .delete(accounts::delete),
        )
        .route("/accounts/:id/refresh", post(accounts::refresh))
        .route("/accounts/:id/verify", post(accounts::verify))
        .route("/accounts/:id/usage", get(accounts::usage))
        .route("/keys", get(keys::list).post(keys::create))
        .route(
            "/keys/:id",
            get(keys::get_one).put(keys::update).delete(keys::delete),
        )
        .route("/proxy/stats", get(status::stats))
        .route("/proxy/logs", get(status::logs))
        .route(
            "/proxy/config",
            get(status::get_config).put(status::put_config),
        )
        .route(
            "/settings",
            get(status::get_settings).put(status::put_settings),
        )
        .layer(middleware::from_fn_with_state(state, admin_auth));

    Router::new()
        .route("/proxy/status", get(status::public_status))
        .route("/proxy/health", get(status::public_health))
        .route("/metrics", get(status::public_metrics))
        .merge(admin)
}

/// Bearer check against `ADMIN_PASSWORD`. An unset password locks the
/// admin surface entirely.
async fn admin_auth(
    State(state): State<Arc<AppState>>,
    req: Request,
    next: Next,
) -> Result<Response, StatusCode> {
    let expected = state.config.admin_password.as_str();
    if expected.is_empty() {
        tracing::error!("ADMIN_PASSWORD is not set; admin API disabled");
        return Err(StatusCode::SERVICE_UNAVAILABLE);
    }

    let presented = req
        .headers()
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim);

    match presented {
        Some(p) if p == expected => Ok(next.run(req).await),
        _ => Err(StatusCode::UNAUTHORIZED),
    }
}
