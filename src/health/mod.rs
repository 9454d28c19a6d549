use std::sync::LazyLock;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use axum::Router;
use tokio_util::sync::CancellationToken;

use crate::engine::{internal_error, Engine, EngineResult};
use crate::logger::Logger;

static LOGGER: LazyLock<Logger> = LazyLock::new(|| Logger::new("@discovery/health"));

/// Serves `GET /healthz` until the token is cancelled: 200 while the engine
/// is ready, 503 with the failure text otherwise.
///
/// Liveness is intentionally not served here: a process that can answer
/// HTTP is alive, and readiness is the interesting signal.
pub async fn serve(port: u16, engine: Engine, token: CancellationToken) -> EngineResult<()> {
    let app = Router::new()
        .route("/healthz", get(healthz))
        .with_state(engine);

    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port))
        .await
        .map_err(|err| internal_error(format!("failed to bind health port {port}: {err}")))?;

    LOGGER.info(format!("readiness probe listening on port {port}"));
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { token.cancelled().await })
        .await
        .map_err(|err| internal_error(format!("health listener failed: {err}")))
}

async fn healthz(State(engine): State<Engine>) -> (StatusCode, String) {
    match engine.ready() {
        Ok(()) => (StatusCode::OK, "ok".to_string()),
        Err(err) => (StatusCode::SERVICE_UNAVAILABLE, err.to_string()),
    }
}
