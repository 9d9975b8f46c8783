//! The HTTP surface.
//!
//! Two routes: `GET /healthz` answers 204 while the cluster API is
//! reachable, and `GET /handlers/{engine}` schedules a scan and
//! answers 202 immediately - the scan itself runs asynchronously behind
//! the debouncer. Trigger handling never fails the request; errors
//! stay in the logs.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::get;
use axum::Router;
use koney_core::api::CaptorStrategy;
use koney_core::cluster::ClusterClient;
use tracing::{debug, warn};

use crate::debounce::Trigger;

/// Shared state of the HTTP handlers.
pub struct AppState {
    /// Cluster client used for the reachability probe.
    pub client: Arc<dyn ClusterClient>,

    /// Sending half of the debounce channel.
    pub trigger: Trigger,
}

/// Build the forwarder router.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/handlers/{engine}", get(handle_engine))
        .with_state(state)
}

/// Reachability probe: 204 when the cluster API answers, 503 otherwise.
async fn healthz(State(state): State<Arc<AppState>>) -> StatusCode {
    match state.client.ping().await {
        Ok(()) => StatusCode::NO_CONTENT,
        Err(err) => {
            warn!(error = %err, "health check failed");
            StatusCode::SERVICE_UNAVAILABLE
        }
    }
}

/// Webhook target of the tracing policies: authenticates against the
/// cluster API, schedules a scan, answers 202.
async fn handle_engine(
    Path(engine): Path<String>,
    State(state): State<Arc<AppState>>,
) -> StatusCode {
    let Ok(engine) = engine.parse::<CaptorStrategy>() else {
        return StatusCode::NOT_FOUND;
    };
    debug!(engine = %engine, "trigger received");

    if let Err(err) = state.client.ping().await {
        warn!(error = %err, "rejecting trigger; cluster API unreachable");
        return StatusCode::UNAUTHORIZED;
    }

    state.trigger.fire();
    StatusCode::ACCEPTED
}

#[cfg(test)]
mod tests {
    use koney_core::cluster::InMemoryCluster;
    use tokio::sync::mpsc::Receiver;

    use super::*;
    use crate::debounce;

    fn test_state() -> (Arc<AppState>, Receiver<()>) {
        let (trigger, rx) = debounce::channel();
        let state = Arc::new(AppState {
            client: Arc::new(InMemoryCluster::new()),
            trigger,
        });
        (state, rx)
    }

    #[tokio::test]
    async fn test_healthz_is_no_content_when_reachable() {
        let (state, _rx) = test_state();
        assert_eq!(healthz(State(state)).await, StatusCode::NO_CONTENT);
    }

    #[tokio::test]
    async fn test_known_engines_are_accepted() {
        let (state, mut rx) = test_state();
        let status = handle_engine(
            Path("tetragon".to_string()),
            State(Arc::clone(&state)),
        )
        .await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert!(rx.try_recv().is_ok(), "a scan was scheduled");

        let status = handle_engine(Path("kive".to_string()), State(state)).await;
        assert_eq!(status, StatusCode::ACCEPTED);
    }

    #[tokio::test]
    async fn test_unknown_engine_is_not_found() {
        let (state, _rx) = test_state();
        let status = handle_engine(Path("strace".to_string()), State(state)).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_triggers_beyond_capacity_still_accepted() {
        let (state, _rx) = test_state();
        for _ in 0..3 {
            let status = handle_engine(
                Path("tetragon".to_string()),
                State(Arc::clone(&state)),
            )
            .await;
            assert_eq!(status, StatusCode::ACCEPTED);
        }
    }
}
