//! Battery Telemetry Service
//!
//! Runs the OBD polling engine and serves its status snapshot over HTTP for
//! the dashboard.

use anyhow::Context;
use axum::{routing::get, Router};
use obd_poller::{PollingEngine, ShutdownHandle, Status};
use obd_protocol::ObdError;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

mod routes;
mod settings;

pub use settings::{ApiError, AppConfig, LogConfig, ServerConfig, CONFIG_PATH_ENV};

/// Program name reported by the about route
pub const NAME: &str = "pi-obd";

/// Application state shared across handlers
pub struct AppState {
    /// Latest status published by the polling engine
    pub status: watch::Receiver<Status>,
    pub name: String,
    pub version: String,
}

impl AppState {
    pub fn new(status: watch::Receiver<Status>) -> Self {
        Self {
            status,
            name: NAME.to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

/// Create the application router
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/data/obd", get(routes::obd::get_status))
        .route("/data/server/about", get(routes::about::get_about))
        .fallback(routes::not_found)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Install the global tracing subscriber
///
/// `RUST_LOG` takes precedence over the configured level.
pub fn init_logging(config: &LogConfig) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true);

    let result = if config.json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    if let Err(e) = result {
        eprintln!("Failed to set tracing subscriber: {}", e);
    }
}

/// Running HTTP server that can be stopped gracefully
pub struct ServerHandle {
    stop: oneshot::Sender<()>,
    task: JoinHandle<std::io::Result<()>>,
    pub local_addr: SocketAddr,
}

impl ServerHandle {
    /// Stop accepting connections and wait for the server task
    pub async fn stop(self) -> anyhow::Result<()> {
        let _ = self.stop.send(());
        self.task.await.context("server task failed")??;
        info!("Server stopped");
        Ok(())
    }
}

/// Bind `addr` and serve the router in a background task
pub async fn start_server(state: Arc<AppState>, addr: SocketAddr) -> anyhow::Result<ServerHandle> {
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding {}", addr))?;
    let local_addr = listener.local_addr()?;
    let app = create_router(state);
    let (stop, stopped) = oneshot::channel::<()>();

    let task = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async {
                let _ = stopped.await;
            })
            .await
    });
    info!("Server started: http://localhost:{}", local_addr.port());

    Ok(ServerHandle {
        stop,
        task,
        local_addr,
    })
}

type EngineTask = JoinHandle<(PollingEngine, Result<(), ObdError>)>;

/// Run the polling engine on its own task
pub fn spawn_engine(mut engine: PollingEngine) -> EngineTask {
    tokio::spawn(async move {
        let result = engine.run().await;
        (engine, result)
    })
}

/// Stop the server, the polling loop and the transport
///
/// The engine gets `grace` to finish the read in flight; after that the read
/// is cancelled so the transport can still be closed. Returns the number of
/// failed steps.
pub async fn shutdown(
    handle: ShutdownHandle,
    server: Option<ServerHandle>,
    mut engine_task: EngineTask,
    grace: Duration,
) -> usize {
    handle.request_stop();
    let mut failures = 0;

    if let Some(server) = server {
        match tokio::time::timeout(grace, server.stop()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                error!("Stopping server: {:#}", e);
                failures += 1;
            }
            Err(_) => {
                error!("Server did not stop within {:?}", grace);
                failures += 1;
            }
        }
    }

    let joined = match tokio::time::timeout(grace, &mut engine_task).await {
        Ok(joined) => joined,
        Err(_) => {
            warn!("Polling engine busy after {:?}, cancelling its read", grace);
            handle.cancel_pending_read();
            match tokio::time::timeout(grace, &mut engine_task).await {
                Ok(joined) => joined,
                Err(_) => {
                    error!("Some jobs hanging after {:?}, giving up", grace);
                    engine_task.abort();
                    return failures + 1;
                }
            }
        }
    };

    match joined {
        Ok((mut engine, result)) => {
            if let Err(e) = result {
                warn!("Polling engine ended with: {}", e);
                failures += 1;
            }
            if let Err(e) = engine.shutdown().await {
                error!("Closing transport: {}", e);
                failures += 1;
            }
        }
        Err(e) => {
            error!("Polling task failed: {}", e);
            failures += 1;
        }
    }
    failures
}

/// Start everything, wait for Ctrl-C and shut down
pub async fn run(config: AppConfig) -> anyhow::Result<()> {
    let mut engine =
        PollingEngine::from_config(&config.obd).context("invalid OBD configuration")?;
    engine.connect().await.context("connecting to adapter")?;

    let handle = engine.shutdown_handle();
    let state = Arc::new(AppState::new(engine.subscribe()));

    let server = if config.server.start {
        let addr = SocketAddr::from(([0, 0, 0, 0], config.server.port));
        Some(start_server(state, addr).await?)
    } else {
        None
    };

    let engine_task = spawn_engine(engine);
    info!("Startup finished, entering normal running mode");

    tokio::signal::ctrl_c()
        .await
        .context("listening for interrupt signal")?;
    info!("Starting shutdown (interrupt signal)");

    let grace = Duration::from_millis(config.shutdown_millis);
    let failures = shutdown(handle, server, engine_task, grace).await;
    if failures > 0 {
        anyhow::bail!("shutdown finished with {} failure(s)", failures);
    }
    info!("Shutdown successfully finished");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{to_bytes, Body};
    use axum::http::{Request, StatusCode};
    use obd_poller::ObdConfig;
    use async_trait::async_trait;
    use obd_protocol::{ResponseCorrelator, Transport, TransportKind};
    use std::sync::atomic::{AtomicBool, Ordering};
    use tower::ServiceExt;

    async fn get_json(app: Router, uri: &str) -> (StatusCode, serde_json::Value) {
        let response = app
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&body).unwrap())
    }

    #[tokio::test]
    async fn test_obd_route_serves_latest_snapshot() {
        let (tx, rx) = watch::channel(Status::new());
        let app = create_router(Arc::new(AppState::new(rx)));

        let mut status = Status::new();
        status.set_connected(true);
        status.set_adapter_type(TransportKind::Sim);
        status.set_current("14.2A (12:30:01)");
        status.push_message("2105: Err2");
        tx.send_replace(status);

        let (code, json) = get_json(app, "/data/obd").await;
        assert_eq!(code, StatusCode::OK);
        assert_eq!(json["connected"], true);
        assert_eq!(json["adapterType"], "sim");
        assert_eq!(json["current"], "14.2A (12:30:01)");
        assert_eq!(json["recentMessages"][0]["message"], "2105: Err2");
        assert!(json.get("soc").is_none());
    }

    #[tokio::test]
    async fn test_about_route() {
        let (_tx, rx) = watch::channel(Status::new());
        let app = create_router(Arc::new(AppState::new(rx)));

        let (code, json) = get_json(app, "/data/server/about").await;
        assert_eq!(code, StatusCode::OK);
        assert_eq!(json["name"], NAME);
        assert_eq!(json["version"], env!("CARGO_PKG_VERSION"));
    }

    #[tokio::test]
    async fn test_unknown_route_is_json_404() {
        let (_tx, rx) = watch::channel(Status::new());
        let app = create_router(Arc::new(AppState::new(rx)));

        let (code, json) = get_json(app, "/data/nothing").await;
        assert_eq!(code, StatusCode::NOT_FOUND);
        assert_eq!(json["error"], "Not Found (404) - /data/nothing");
    }

    #[tokio::test]
    async fn test_cors_header_present() {
        let (_tx, rx) = watch::channel(Status::new());
        let app = create_router(Arc::new(AppState::new(rx)));

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/data/obd")
                    .header("origin", "http://dashboard.local")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert!(response
            .headers()
            .contains_key("access-control-allow-origin"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_with_simulator() {
        let mut engine = PollingEngine::from_config(&ObdConfig::simulated()).unwrap();
        engine.connect().await.unwrap();
        let handle = engine.shutdown_handle();
        let status = engine.subscribe();
        let task = spawn_engine(engine);

        tokio::time::sleep(Duration::from_millis(3250)).await;
        assert!(status.borrow().soc().is_some());

        // the request in flight needs at most another 500ms
        let failures = shutdown(handle, None, task, Duration::from_millis(1000)).await;
        assert_eq!(failures, 0);
    }

    /// Adapter that accepts every command and never answers
    struct SilentTransport {
        open: Arc<AtomicBool>,
        correlator: ResponseCorrelator,
    }

    #[async_trait]
    impl Transport for SilentTransport {
        async fn connect(&mut self) -> Result<(), ObdError> {
            self.open.store(true, Ordering::SeqCst);
            Ok(())
        }

        async fn disconnect(&mut self) -> Result<(), ObdError> {
            self.open.store(false, Ordering::SeqCst);
            Ok(())
        }

        fn is_open(&self) -> bool {
            self.open.load(Ordering::SeqCst)
        }

        async fn write(&mut self, _data: &[u8]) -> Result<(), ObdError> {
            Ok(())
        }

        fn correlator(&self) -> &ResponseCorrelator {
            &self.correlator
        }

        fn kind(&self) -> TransportKind {
            TransportKind::Usb
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_closes_silent_transport() {
        let open = Arc::new(AtomicBool::new(false));
        let transport = SilentTransport {
            open: Arc::clone(&open),
            correlator: ResponseCorrelator::new(),
        };
        let mut engine = PollingEngine::new(Box::new(transport), Duration::from_millis(15_000));
        engine.connect().await.unwrap();
        let handle = engine.shutdown_handle();
        let status = engine.subscribe();
        let task = spawn_engine(engine);

        // init takes 6s against a silent adapter; this lands inside the 0100 read
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(open.load(Ordering::SeqCst));

        let failures = shutdown(handle, None, task, Duration::from_millis(500)).await;
        assert_eq!(failures, 0);
        assert!(!open.load(Ordering::SeqCst));
        assert_eq!(status.borrow().recent_messages().count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_cancels_simulator_read_after_grace() {
        let mut engine = PollingEngine::from_config(&ObdConfig::simulated()).unwrap();
        engine.connect().await.unwrap();
        let handle = engine.shutdown_handle();
        let task = spawn_engine(engine);

        tokio::time::sleep(Duration::from_millis(3250)).await;
        let start = tokio::time::Instant::now();
        let failures = shutdown(handle, None, task, Duration::from_millis(100)).await;
        assert_eq!(failures, 0);
        assert!(start.elapsed() < Duration::from_millis(250));
    }

    #[tokio::test]
    async fn test_server_start_and_stop() {
        let (_tx, rx) = watch::channel(Status::new());
        let server = start_server(
            Arc::new(AppState::new(rx)),
            SocketAddr::from(([127, 0, 0, 1], 0)),
        )
        .await
        .unwrap();
        assert_ne!(server.local_addr.port(), 0);
        server.stop().await.unwrap();
    }
}
