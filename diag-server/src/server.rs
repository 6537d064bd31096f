//! Handler registration and the start/shutdown lifecycle of the diagnostics server.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use axum::Router;
use continuous_profiling::{ContinuousProfilingConfig, ContinuousProfilingError, RunningAgent};
use heartbeat::{HeartbeatMonitor, HeartbeatSlot, ProbeCallback};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::endpoints::{healthz_routes, metrics_recorder, metrics_routes, track_metrics};
use crate::error::ServerError;

/// How often the heartbeat probe is issued.
pub const HEARTBEAT_SIGNAL_INTERVAL: Duration = Duration::from_secs(1);
/// How long an issued probe may stay unacknowledged.
pub const HEARTBEAT_ACK_TIMEOUT: Duration = Duration::from_secs(2);
/// Upper bound on draining in-flight requests once shutdown starts.
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

/// Diagnostics HTTP server.
///
/// Endpoints are registered through `&mut self` before [`start`](Self::start),
/// which borrows the server immutably for the whole run: the handler table is
/// frozen while serving.
pub struct Server {
    listen_addr: String,
    router: Router,
    metrics_enabled: bool,
    healthz_enabled: bool,
    pprof_enabled: bool,
    heartbeat: HeartbeatSlot,
    probe: ProbeCallback,
    signal_interval: Duration,
    ack_timeout: Duration,
    shutdown_timeout: Duration,
    profiling: ContinuousProfilingConfig,
    // Only touched through `&mut self`; the Mutex makes `Server` Sync so it
    // can be shared as `Arc<Server>` while `start` runs.
    pyro_agent: Mutex<Option<RunningAgent>>,
    local_addr: Arc<Mutex<Option<SocketAddr>>>,
}

impl Server {
    /// New server with an empty handler table. Nothing is bound until [`start`](Self::start).
    pub fn new(listen_addr: impl Into<String>) -> Self {
        Self {
            listen_addr: listen_addr.into(),
            router: Router::new(),
            metrics_enabled: false,
            healthz_enabled: false,
            pprof_enabled: false,
            heartbeat: HeartbeatSlot::new(),
            probe: Arc::new(invoke_heartbeat),
            signal_interval: HEARTBEAT_SIGNAL_INTERVAL,
            ack_timeout: HEARTBEAT_ACK_TIMEOUT,
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
            profiling: ContinuousProfilingConfig::default(),
            pyro_agent: Mutex::new(None),
            local_addr: Arc::new(Mutex::new(None)),
        }
    }

    /// Build a server and register the endpoints enabled in `config`.
    ///
    /// A pyroscope start failure is logged, the rest of the server is unaffected.
    pub fn from_config(config: &Config) -> Self {
        let mut server = Server::new(config.bind())
            .with_heartbeat_timing(
                config.heartbeat_signal_interval_ms.0,
                config.heartbeat_ack_timeout_ms.0,
            )
            .with_shutdown_timeout(config.shutdown_timeout_ms.0)
            .with_profiling_config(config.profiling.clone());

        if config.enable_healthz {
            server.enable_healthz_endpoint();
        }
        if config.enable_metrics {
            server.enable_metrics_endpoint();
        }
        if config.enable_pprof {
            server.enable_pprof_endpoint();
        }
        if config.enable_pyroscope {
            if let Err(e) = server.enable_pyro_agent() {
                error!(error = %e, "Starting pyroscope agent");
            }
        }
        server
    }

    pub fn with_heartbeat_timing(mut self, signal_interval: Duration, ack_timeout: Duration) -> Self {
        self.signal_interval = signal_interval;
        self.ack_timeout = ack_timeout;
        self
    }

    /// Replace the liveness probe. It runs on the blocking pool once per tick.
    pub fn with_heartbeat_probe<F>(mut self, probe: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.probe = Arc::new(probe);
        self
    }

    pub fn with_shutdown_timeout(mut self, shutdown_timeout: Duration) -> Self {
        self.shutdown_timeout = shutdown_timeout;
        self
    }

    pub fn with_profiling_config(mut self, profiling: ContinuousProfilingConfig) -> Self {
        self.profiling = profiling;
        self
    }

    pub fn enable_metrics_endpoint(&mut self) {
        if self.metrics_enabled {
            warn!("metrics endpoint already registered");
            return;
        }
        self.register(metrics_routes(metrics_recorder()));
        self.metrics_enabled = true;
    }

    pub fn enable_healthz_endpoint(&mut self) {
        if self.healthz_enabled {
            warn!("healthz endpoint already registered");
            return;
        }
        self.register(healthz_routes(self.heartbeat.clone()));
        self.healthz_enabled = true;
    }

    pub fn enable_pprof_endpoint(&mut self) {
        if self.pprof_enabled {
            warn!("pprof endpoints already registered");
            return;
        }
        self.register(profiler::apply_pprof_routes(Router::new()));
        self.pprof_enabled = true;
    }

    /// Start the pyroscope agent in push mode. The agent lives as long as the server.
    pub fn enable_pyro_agent(&mut self) -> Result<(), ContinuousProfilingError> {
        let agent = self.profiling.start_agent()?;
        *self
            .pyro_agent
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner) = Some(agent);
        Ok(())
    }

    pub fn metrics_endpoint_enabled(&self) -> bool {
        self.metrics_enabled
    }

    pub fn listen_addr(&self) -> &str {
        &self.listen_addr
    }

    /// Address the serving loop is bound to, while it runs.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Read-only view of the heartbeat state.
    pub fn heartbeat(&self) -> HeartbeatSlot {
        self.heartbeat.clone()
    }

    /// Serve the handler table and run the heartbeat until `ctx` is cancelled
    /// or the serving loop exits on its own.
    ///
    /// On cancellation, in-flight requests get [`DEFAULT_SHUTDOWN_TIMEOUT`]
    /// (or the configured timeout) to drain; a failed drain is logged and
    /// `Ok` is returned. A bind or serve failure is returned as an error.
    /// The heartbeat ticking loop has exited by the time this returns.
    pub async fn start(&self, ctx: CancellationToken) -> Result<(), ServerError> {
        let srv_ctx = ctx.child_token();
        let _srv_guard = srv_ctx.clone().drop_guard();

        let serving = self.spawn_serving_loop(srv_ctx.clone());

        let heartbeat_ctx = srv_ctx.child_token();
        let _heartbeat_guard = heartbeat_ctx.clone().drop_guard();
        let monitor = self.start_heartbeat(&heartbeat_ctx);

        let result = tokio::select! {
            biased;

            _ = ctx.cancelled() => {
                debug!("Context cancelled, shutting down diagnostics server");
                self.drain(serving).await;
                Ok(())
            }
            // the serving loop exited while the caller is still running
            _ = srv_ctx.cancelled() => match serving.await {
                Ok(result) => result,
                Err(e) => Err(ServerError::ServeTask(e)),
            },
        };

        heartbeat_ctx.cancel();
        if let Some(monitor) = monitor {
            monitor.stopped().await;
        }
        *self.local_addr.lock().unwrap_or_else(PoisonError::into_inner) = None;

        result
    }

    fn handler_table(&self) -> Router {
        let router = self.router.clone().layer(TraceLayer::new_for_http());
        if self.metrics_enabled {
            router.layer(axum::middleware::from_fn(track_metrics))
        } else {
            router
        }
    }

    fn register(&mut self, routes: Router) {
        let router = std::mem::take(&mut self.router);
        self.router = router.merge(routes);
    }

    fn spawn_serving_loop(&self, srv_ctx: CancellationToken) -> JoinHandle<Result<(), ServerError>> {
        let app = self.handler_table();
        let listen_addr = self.listen_addr.clone();
        let local_addr = self.local_addr.clone();

        tokio::spawn(async move {
            debug!(address = %listen_addr, "Starting diagnostics server task");

            let result = serve(&listen_addr, app, &local_addr, srv_ctx.clone()).await;
            if let Err(e) = &result {
                error!(address = %listen_addr, error = %e, "Serving diagnostics endpoints");
            }

            debug!("Stopped diagnostics server task");
            srv_ctx.cancel();
            result
        })
    }

    fn start_heartbeat(&self, scope: &CancellationToken) -> Option<HeartbeatMonitor> {
        let monitor = match self
            .heartbeat
            .init(scope, self.signal_interval, self.ack_timeout)
        {
            Ok(monitor) => monitor,
            Err(e) => {
                error!(error = %e, "Initializing heartbeat monitor");
                return None;
            }
        };

        let probe = self.probe.clone();
        monitor.set_callback(move || probe());
        if let Err(e) = monitor.start() {
            error!(error = %e, "Starting heartbeat monitor");
        }
        Some(monitor)
    }

    async fn drain(&self, mut serving: JoinHandle<Result<(), ServerError>>) {
        match tokio::time::timeout(self.shutdown_timeout, &mut serving).await {
            Ok(Ok(Ok(()))) => info!("Diagnostics server stopped"),
            Ok(Ok(Err(e))) => error!(error = %e, "Stopping diagnostics server"),
            Ok(Err(e)) => error!(error = %e, "Stopping diagnostics server"),
            Err(_) => {
                error!(
                    timeout_secs = self.shutdown_timeout.as_secs_f64(),
                    "Stopping diagnostics server: graceful shutdown timed out"
                );
                serving.abort();
                if let Err(e) = serving.await {
                    debug!(error = %e, "Serving task aborted");
                }
            }
        }
    }
}

async fn serve(
    listen_addr: &str,
    app: Router,
    local_addr: &Mutex<Option<SocketAddr>>,
    shutdown: CancellationToken,
) -> Result<(), ServerError> {
    let listener = TcpListener::bind(listen_addr)
        .await
        .map_err(|source| ServerError::Bind {
            address: listen_addr.to_string(),
            source,
        })?;
    let bound = listener.local_addr().map_err(ServerError::Serve)?;
    *local_addr.lock().unwrap_or_else(PoisonError::into_inner) = Some(bound);
    info!(address = %bound, "Diagnostics server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await
        .map_err(ServerError::Serve)
}

// Intentionally empty. Never inlined so the call stays visible to profilers.
#[inline(never)]
fn invoke_heartbeat() {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_server_has_nothing_registered() {
        let server = Server::new("127.0.0.1:0");
        assert_eq!(server.listen_addr(), "127.0.0.1:0");
        assert!(!server.metrics_endpoint_enabled());
        assert!(server.local_addr().is_none());
        assert!(server.heartbeat().get_instance().is_none());
    }

    #[tokio::test]
    async fn metrics_flag_round_trips() {
        let mut server = Server::new("127.0.0.1:0");
        assert!(!server.metrics_endpoint_enabled());
        server.enable_metrics_endpoint();
        assert!(server.metrics_endpoint_enabled());

        // Registering twice is a no-op rather than a route collision
        server.enable_metrics_endpoint();
        assert!(server.metrics_endpoint_enabled());
    }

    #[test]
    fn repeated_registration_does_not_panic() {
        let mut server = Server::new("127.0.0.1:0");
        server.enable_healthz_endpoint();
        server.enable_healthz_endpoint();
        server.enable_pprof_endpoint();
        server.enable_pprof_endpoint();
        assert!(!server.metrics_endpoint_enabled());
    }

    #[test]
    fn from_config_registers_enabled_endpoints() {
        use envconfig::Envconfig;
        use std::collections::HashMap;

        let env = HashMap::from([
            ("BIND_HOST".to_string(), "127.0.0.1".to_string()),
            ("BIND_PORT".to_string(), "0".to_string()),
            ("ENABLE_METRICS".to_string(), "false".to_string()),
            ("HEARTBEAT_SIGNAL_INTERVAL_MS".to_string(), "100".to_string()),
        ]);
        let config = Config::init_from_hashmap(&env).unwrap();
        let server = Server::from_config(&config);

        assert_eq!(server.listen_addr(), "127.0.0.1:0");
        assert!(!server.metrics_endpoint_enabled());
        assert!(server.healthz_enabled);
        assert!(!server.pprof_enabled);
        assert_eq!(server.signal_interval, Duration::from_millis(100));
        assert_eq!(server.ack_timeout, HEARTBEAT_ACK_TIMEOUT);
    }
}
