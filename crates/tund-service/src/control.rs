//! Control API
//!
//! HTTP routes used by the desktop client: network resets and profile
//! management.

use axum::{
    extract::{rejection::JsonRejection, Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use tund_profile::{ErrorKind, Profile, ProfileId, ProfileRegistry, RegistryError, RuntimeRecord};

/// Application state shared across handlers
pub struct ControlState {
    pub registry: ProfileRegistry,
    /// Running with development features enabled
    pub dev: bool,
}

/// Error response
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kind: Option<ErrorKind>,
}

/// Service status response
#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub profiles: usize,
    pub dev: bool,
}

type ApiError = (StatusCode, Json<ErrorResponse>);

fn api_error(status: StatusCode, error: impl ToString, kind: Option<ErrorKind>) -> ApiError {
    (
        status,
        Json(ErrorResponse {
            error: error.to_string(),
            kind,
        }),
    )
}

impl From<RegistryError> for ErrorResponse {
    fn from(e: RegistryError) -> Self {
        Self {
            kind: e.kind(),
            error: e.to_string(),
        }
    }
}

fn registry_error(e: RegistryError) -> ApiError {
    let status = match &e {
        RegistryError::AlreadyActive(_) => StatusCode::CONFLICT,
        RegistryError::NotFound(_) => StatusCode::NOT_FOUND,
        RegistryError::Config(_) => StatusCode::BAD_REQUEST,
        RegistryError::NotReady | RegistryError::ShuttingDown => StatusCode::SERVICE_UNAVAILABLE,
    };
    (status, Json(e.into()))
}

fn parse_id(id: &str) -> Result<ProfileId, ApiError> {
    ProfileId::new(id).map_err(|e| api_error(StatusCode::NOT_FOUND, e, None))
}

/// Build the control router.
pub fn router(state: Arc<ControlState>) -> Router {
    Router::new()
        .route("/status", get(status_handler))
        .route("/network/dns/reset", post(dns_reset_handler))
        .route("/network/all/reset", post(all_reset_handler))
        .route("/profile", get(list_handler).post(add_handler))
        .route("/profile/{id}", get(get_handler).delete(remove_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// GET /status
pub async fn status_handler(State(state): State<Arc<ControlState>>) -> Json<StatusResponse> {
    Json(StatusResponse {
        status: "running",
        version: env!("CARGO_PKG_VERSION"),
        profiles: state.registry.len(),
        dev: state.dev,
    })
}

/// POST /network/dns/reset - Restore default DNS and flush the resolver cache
///
/// Failures are logged by the cleaner; the client always gets 200.
pub async fn dns_reset_handler(State(state): State<Arc<ControlState>>) -> StatusCode {
    let cleaner = state.registry.cleaner();
    let _ = cleaner.reset_dns().await;
    let _ = cleaner.clear_dns_cache().await;
    StatusCode::OK
}

/// POST /network/all/reset - Full network reset, then restart every profile
pub async fn all_reset_handler(State(state): State<Arc<ControlState>>) -> StatusCode {
    let _ = state.registry.cleaner().global_reset().await;
    let restarted = state.registry.restart_all(false).await;
    info!("Network reset done, {} profile(s) restarted", restarted);
    StatusCode::OK
}

/// GET /profile
pub async fn list_handler(State(state): State<Arc<ControlState>>) -> Json<Vec<RuntimeRecord>> {
    Json(state.registry.list())
}

/// GET /profile/{id}
pub async fn get_handler(
    State(state): State<Arc<ControlState>>,
    Path(id): Path<String>,
) -> Result<Json<RuntimeRecord>, ApiError> {
    let id = parse_id(&id)?;
    state
        .registry
        .get(&id)
        .map(Json)
        .ok_or_else(|| registry_error(RegistryError::NotFound(id)))
}

/// POST /profile - Start a profile
pub async fn add_handler(
    State(state): State<Arc<ControlState>>,
    body: Result<Json<Profile>, JsonRejection>,
) -> Result<Response, ApiError> {
    let Json(profile) = body.map_err(|e| {
        warn!("Rejected profile body: {}", e.body_text());
        api_error(StatusCode::BAD_REQUEST, e.body_text(), Some(ErrorKind::Config))
    })?;
    let id = profile.id.clone();
    state.registry.add(profile).map_err(registry_error)?;
    let record = state.registry.get(&id);
    Ok((StatusCode::OK, Json(record)).into_response())
}

/// DELETE /profile/{id} - Stop a profile
pub async fn remove_handler(
    State(state): State<Arc<ControlState>>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    let id = parse_id(&id)?;
    state.registry.remove(&id).map_err(registry_error)?;
    Ok(StatusCode::OK)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Method, Request};
    use http_body_util::BodyExt;
    use std::time::Duration;
    use tower::ServiceExt;
    use tund_net::testing::{FakePlatform, Journal};
    use tund_net::{CleanerConfig, NetworkCleaner};
    use tund_profile::testing::{Script, ScriptedLauncher};
    use tund_profile::{ProfileState, RegistryConfig};

    struct Harness {
        app: Router,
        registry: ProfileRegistry,
        launcher: ScriptedLauncher,
        host: FakePlatform,
        journal: Journal,
    }

    fn harness() -> Harness {
        let journal = Journal::new();
        let host = FakePlatform::with_journal(journal.clone());
        let launcher =
            ScriptedLauncher::new(journal.clone(), Script::connects("tun0")).with_host(host.clone());
        let cleaner = NetworkCleaner::new(Arc::new(host.clone()), CleanerConfig::default());
        let config = RegistryConfig {
            stop_grace: Duration::from_millis(200),
            ..RegistryConfig::default()
        };
        let registry = ProfileRegistry::new(Arc::new(launcher.clone()), cleaner, config);
        registry.open();
        let app = router(Arc::new(ControlState {
            registry: registry.clone(),
            dev: false,
        }));
        Harness {
            app,
            registry,
            launcher,
            host,
            journal,
        }
    }

    async fn send(app: &Router, method: Method, uri: &str, body: Option<&str>) -> (StatusCode, String) {
        let mut builder = Request::builder().method(method).uri(uri);
        if body.is_some() {
            builder = builder.header("content-type", "application/json");
        }
        let request = builder
            .body(body.map(|b| Body::from(b.to_string())).unwrap_or_else(Body::empty))
            .unwrap();
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        (status, String::from_utf8(bytes.to_vec()).unwrap())
    }

    async fn wait_state(registry: &ProfileRegistry, id: &str, state: ProfileState) {
        let id = ProfileId::new(id).unwrap();
        for _ in 0..500 {
            if registry.get(&id).map(|r| r.state) == Some(state) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("{} never reached {}", id, state);
    }

    const WORK: &str = r#"{"id": "work", "server": "vpn.example.com"}"#;

    #[tokio::test]
    async fn test_status() {
        let h = harness();
        let (status, body) = send(&h.app, Method::GET, "/status", None).await;
        assert_eq!(status, StatusCode::OK);
        let json: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(json["status"], "running");
        assert_eq!(json["version"], env!("CARGO_PKG_VERSION"));
        assert_eq!(json["profiles"], 0);
    }

    #[tokio::test]
    async fn test_dns_reset() {
        let h = harness();
        let (status, body) = send(&h.app, Method::POST, "/network/dns/reset", None).await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.is_empty());
        assert_eq!(h.host.calls("reset_dns"), 1);
        assert_eq!(h.host.calls("clear_dns_cache"), 1);
        assert_eq!(h.host.calls("clear_dns"), 0);
        assert_eq!(h.host.calls("flush_routes"), 0);
    }

    #[tokio::test]
    async fn test_dns_reset_swallows_errors() {
        let h = harness();
        h.host.fail_on("reset_dns");
        let (status, _) = send(&h.app, Method::POST, "/network/dns/reset", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(h.host.calls("clear_dns_cache"), 1);
    }

    #[tokio::test]
    async fn test_all_reset_reconnects_profiles() {
        let h = harness();
        let (status, _) = send(&h.app, Method::POST, "/profile", Some(WORK)).await;
        assert_eq!(status, StatusCode::OK);
        wait_state(&h.registry, "work", ProfileState::Connected).await;
        let before = h.journal.len();

        h.host.fail_on("flush_routes");
        let (status, _) = send(&h.app, Method::POST, "/network/all/reset", None).await;
        assert_eq!(status, StatusCode::OK);
        wait_state(&h.registry, "work", ProfileState::Connected).await;

        let id = ProfileId::new("work").unwrap();
        assert_eq!(h.launcher.spawns(&id), 2);
        assert_eq!(h.launcher.max_live(&id), 1);
        assert_eq!(h.registry.cleaner().global_reset_count(), 1);

        // Reset, then the old tunnel is gone, then the new one starts
        let entries: Vec<String> = h.journal.entries().split_off(before);
        let pos = |name: &str| entries.iter().position(|e| e == name).unwrap();
        assert!(pos("platform:reset_dns") < pos("platform:clear_dns"));
        assert!(pos("platform:clear_dns") < pos("platform:flush_routes"));
        assert!(pos("platform:flush_routes") < pos("platform:clear_dns_cache"));
        assert!(pos("platform:clear_dns_cache") < pos("process:kill:work"));
        assert!(pos("process:kill:work") < pos("spawn:work"));
    }

    #[tokio::test]
    async fn test_profile_lifecycle() {
        let h = harness();
        let (status, body) = send(&h.app, Method::POST, "/profile", Some(WORK)).await;
        assert_eq!(status, StatusCode::OK);
        let record: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(record["id"], "work");

        let (status, body) = send(&h.app, Method::POST, "/profile", Some(WORK)).await;
        assert_eq!(status, StatusCode::CONFLICT);
        let error: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(error["kind"], "resource_conflict");

        wait_state(&h.registry, "work", ProfileState::Connected).await;
        let (status, body) = send(&h.app, Method::GET, "/profile", None).await;
        assert_eq!(status, StatusCode::OK);
        let list: Vec<RuntimeRecord> = serde_json::from_str(&body).unwrap();
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].state, ProfileState::Connected);
        assert_eq!(list[0].interface.as_deref(), Some("tun0"));

        let (status, body) = send(&h.app, Method::GET, "/profile/work", None).await;
        assert_eq!(status, StatusCode::OK);
        let record: RuntimeRecord = serde_json::from_str(&body).unwrap();
        assert_eq!(record.id.as_str(), "work");

        let (status, _) = send(&h.app, Method::DELETE, "/profile/work", None).await;
        assert_eq!(status, StatusCode::OK);
        for _ in 0..500 {
            if h.registry.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let (status, _) = send(&h.app, Method::GET, "/profile/work", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert!(h.host.host().is_clean());
    }

    #[tokio::test]
    async fn test_unknown_profile() {
        let h = harness();
        let (status, _) = send(&h.app, Method::GET, "/profile/nope", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let (status, _) = send(&h.app, Method::DELETE, "/profile/nope", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let (status, _) = send(&h.app, Method::DELETE, "/profile/..bad", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_invalid_profile_body() {
        let h = harness();
        let (status, _) = send(&h.app, Method::POST, "/profile", Some("{not json")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        let (status, _) = send(&h.app, Method::POST, "/profile", Some(r#"{"server": "x"}"#)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        let (status, body) =
            send(&h.app, Method::POST, "/profile", Some(r#"{"id": "work", "server": ""}"#)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body.contains("config"));
        assert!(h.registry.is_empty());
    }

    #[tokio::test]
    async fn test_add_rejected_while_closed() {
        let h = harness();
        h.registry.close();
        let (status, _) = send(&h.app, Method::POST, "/profile", Some(WORK)).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    }
}
