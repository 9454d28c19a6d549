mod config;
mod connection;
mod dispatch;
mod get_list_mutex;
mod heartbeat;
mod requests;
mod tracker;

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::AtomicUsize;
use std::sync::{Arc, LazyLock, Mutex, RwLock};

use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::adapter::{Adapter, AdapterHost, HostResult};
use crate::bus::nats::NatsConnector;
use crate::bus::watcher::ConnectionWatcher;
use crate::bus::{BusConnection, BusConnector, ConnectionState};
use crate::logger::Logger;
use crate::runtime;
use crate::util::backoff;

#[doc(inline)]
pub use config::{
    EngineConfig, DEFAULT_EXECUTION_GRACE_PERIOD, DEFAULT_FLUSH_TIMEOUT,
    DEFAULT_HEARTBEAT_FREQUENCY, DEFAULT_MAX_REQUEST_TIMEOUT,
};
#[doc(inline)]
pub use get_list_mutex::GetListMutex;
#[doc(inline)]
pub use heartbeat::{
    heartbeat_failed, HeartbeatPayload, ManagementClient, ManagementError, ManagementErrorCode,
    ManagementResult,
};
#[doc(inline)]
pub use requests::ResponseSender;
#[doc(inline)]
pub use tracker::{QueryOutcome, QueryTracker};

static LOGGER: LazyLock<Logger> = LazyLock::new(|| Logger::new("@discovery/engine"));

/// The discovery source runtime.
///
/// Owns the adapter registry, the bus connection, the method-partitioned
/// worker pools, and every background loop (watcher, heartbeats, cache
/// purgers, readiness probe). Cheap to clone; all clones share state.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

struct EngineInner {
    config: EngineConfig,
    host: AdapterHost,
    get_list_mutex: GetListMutex,
    get_pool: Arc<Semaphore>,
    list_pool: Arc<Semaphore>,
    gets_in_flight: AtomicUsize,
    lists_in_flight: AtomicUsize,
    connector: Option<Arc<dyn BusConnector>>,
    management: Option<Arc<dyn ManagementClient>>,
    connection: Mutex<Option<Arc<dyn BusConnection>>>,
    watcher: Mutex<Option<ConnectionWatcher>>,
    reader_token: Mutex<Option<CancellationToken>>,
    background_token: Mutex<Option<CancellationToken>>,
    heartbeat_token: Mutex<Option<CancellationToken>>,
    health_token: Mutex<Option<CancellationToken>>,
    tracked: RwLock<HashMap<Uuid, CancellationToken>>,
    init_error: Mutex<Option<String>>,
    uuid: Mutex<Option<Uuid>>,
    restart_lock: async_lock::Mutex<()>,
}

impl Engine {
    /// Builds an engine from config alone, dialling NATS when configured.
    pub fn new(config: EngineConfig) -> EngineResult<Self> {
        let connector = config
            .nats
            .clone()
            .map(|options| Arc::new(NatsConnector::new(options)) as Arc<dyn BusConnector>);
        Self::with_connector(config, connector, None)
    }

    /// Builds an engine over an explicit transport and management client.
    /// Tests wire the in-memory bus through here.
    pub fn with_connector(
        config: EngineConfig,
        connector: Option<Arc<dyn BusConnector>>,
        management: Option<Arc<dyn ManagementClient>>,
    ) -> EngineResult<Self> {
        config.validate()?;
        let permits = config.max_parallel_executions;
        Ok(Self {
            inner: Arc::new(EngineInner {
                host: AdapterHost::new(),
                get_list_mutex: GetListMutex::new(),
                get_pool: Arc::new(Semaphore::new(permits)),
                list_pool: Arc::new(Semaphore::new(permits)),
                gets_in_flight: AtomicUsize::new(0),
                lists_in_flight: AtomicUsize::new(0),
                connector,
                management,
                connection: Mutex::new(None),
                watcher: Mutex::new(None),
                reader_token: Mutex::new(None),
                background_token: Mutex::new(None),
                heartbeat_token: Mutex::new(None),
                health_token: Mutex::new(None),
                tracked: RwLock::new(HashMap::new()),
                init_error: Mutex::new(None),
                uuid: Mutex::new(config.source_uuid),
                restart_lock: async_lock::Mutex::new(()),
                config,
            }),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    pub fn source_name(&self) -> &str {
        &self.inner.config.source_name
    }

    /// The engine's identity; `None` until configured or started.
    pub fn uuid(&self) -> Option<Uuid> {
        *self.inner.uuid.lock().unwrap()
    }

    pub fn add_adapters(&self, adapters: Vec<Arc<dyn Adapter>>) -> HostResult<()> {
        self.inner.host.add_adapters(adapters)
    }

    pub fn visible_adapters(&self) -> Vec<Arc<dyn Adapter>> {
        self.inner.host.visible_adapters()
    }

    /// Brings the runtime up: identity, bus connection, cache purgers,
    /// heartbeats, readiness probe.
    ///
    /// A failed connection attempt does not fail `start`; it is surfaced
    /// through heartbeats and the readiness probe so the process keeps
    /// serving health checks while the watcher-driven reconnect does its
    /// work.
    pub async fn start(&self) -> EngineResult<()> {
        {
            let mut uuid = self.inner.uuid.lock().unwrap();
            if uuid.is_none() {
                *uuid = Some(Uuid::new_v4());
            }
        }

        let background = CancellationToken::new();
        if let Some(previous) = self
            .inner
            .background_token
            .lock()
            .unwrap()
            .replace(background.clone())
        {
            previous.cancel();
        }

        if let Err(err) = self.connect().await {
            LOGGER.error(format!("failed to connect on startup: {err}"));
        }

        self.inner
            .host
            .start_purgers(&background, self.inner.config.cache_purge_interval);
        self.start_heartbeats();

        if let Some(port) = self.inner.config.health_check_port {
            let token = CancellationToken::new();
            if let Some(previous) = self
                .inner
                .health_token
                .lock()
                .unwrap()
                .replace(token.clone())
            {
                previous.cancel();
            }
            let engine = self.clone();
            runtime::spawn_detached(async move {
                if let Err(err) = crate::health::serve(port, engine, token).await {
                    LOGGER.error(format!("health listener failed: {err}"));
                }
            });
        }

        LOGGER.info(format!(
            "engine {} started as {:?}",
            self.inner.config.source_name,
            self.uuid()
        ));
        Ok(())
    }

    /// Tears the runtime down: bus connection, background loops, caches.
    pub async fn stop(&self) -> EngineResult<()> {
        self.disconnect().await;
        for slot in [
            &self.inner.background_token,
            &self.inner.heartbeat_token,
            &self.inner.health_token,
        ] {
            if let Some(token) = slot.lock().unwrap().take() {
                token.cancel();
            }
        }
        self.inner.host.clear_caches();
        LOGGER.info(format!("engine {} stopped", self.inner.config.source_name));
        Ok(())
    }

    /// Serialized stop-then-start.
    pub async fn restart(&self) -> EngineResult<()> {
        let _guard = self.inner.restart_lock.lock().await;
        self.stop().await?;
        self.start().await
    }

    pub fn set_init_error(&self, error: impl Into<String>) {
        *self.inner.init_error.lock().unwrap() = Some(error.into());
    }

    pub fn clear_init_error(&self) {
        self.inner.init_error.lock().unwrap().take();
    }

    pub fn get_init_error(&self) -> Option<String> {
        self.inner.init_error.lock().unwrap().clone()
    }

    /// Readiness check backing the probe and the heartbeat error field.
    pub fn ready(&self) -> EngineResult<()> {
        if let Some(error) = self.get_init_error() {
            return Err(not_ready(error));
        }
        self.connection_health().map_err(not_ready)
    }

    /// `Err` describes why the bus connection is unusable; healthy or
    /// bus-less engines return `Ok`.
    pub(crate) fn connection_health(&self) -> Result<(), String> {
        if self.inner.connector.is_none() {
            return Ok(());
        }
        let connected = self
            .inner
            .connection
            .lock()
            .unwrap()
            .as_ref()
            .is_some_and(|connection| connection.status() == ConnectionState::Connected);
        if connected {
            Ok(())
        } else {
            Err("NATS connection is not connected".to_string())
        }
    }

    /// Runs `init` until it succeeds or the token fires, with jittered
    /// exponential backoff capped at five minutes. Failures land in the
    /// init-error slot so heartbeats and readiness report them; success
    /// clears it.
    pub async fn initialise_adapters<F, Fut>(
        &self,
        token: &CancellationToken,
        mut init: F,
    ) -> EngineResult<()>
    where
        F: FnMut(Engine) -> Fut,
        Fut: std::future::Future<Output = Result<(), Box<dyn std::error::Error + Send + Sync>>>,
    {
        let mut attempt: u32 = 0;
        loop {
            if token.is_cancelled() {
                return Err(cancelled("adapter initialisation cancelled"));
            }
            match init(self.clone()).await {
                Ok(()) => {
                    self.clear_init_error();
                    return Ok(());
                }
                Err(err) => {
                    let message = format!("adapter initialisation failed: {err}");
                    LOGGER.warn(&message);
                    self.set_init_error(message);
                }
            }
            let delay = backoff::calculate_backoff(attempt);
            attempt = attempt.saturating_add(1);
            tokio::select! {
                _ = token.cancelled() => {
                    return Err(cancelled("adapter initialisation cancelled"));
                }
                _ = runtime::sleep(delay) => {}
            }
        }
    }

    /// Number of in-flight executions, `(gets, lists)`. GET and SEARCH share
    /// the first counter.
    pub fn in_flight(&self) -> (usize, usize) {
        (
            self.inner
                .gets_in_flight
                .load(std::sync::atomic::Ordering::SeqCst),
            self.inner
                .lists_in_flight
                .load(std::sync::atomic::Ordering::SeqCst),
        )
    }

    pub(crate) fn connection(&self) -> Option<Arc<dyn BusConnection>> {
        self.inner.connection.lock().unwrap().clone()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EngineErrorCode {
    InvalidConfig,
    NotReady,
    ConnectionFailed,
    Cancelled,
    Internal,
}

impl EngineErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            EngineErrorCode::InvalidConfig => "engine/invalid-config",
            EngineErrorCode::NotReady => "engine/not-ready",
            EngineErrorCode::ConnectionFailed => "engine/connection-failed",
            EngineErrorCode::Cancelled => "engine/cancelled",
            EngineErrorCode::Internal => "engine/internal",
        }
    }
}

#[derive(Clone, Debug)]
pub struct EngineError {
    pub code: EngineErrorCode,
    message: String,
}

impl EngineError {
    pub fn new(code: EngineErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn code_str(&self) -> &'static str {
        self.code.as_str()
    }
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.message, self.code_str())
    }
}

impl std::error::Error for EngineError {}

pub type EngineResult<T> = Result<T, EngineError>;

pub fn invalid_config(message: impl Into<String>) -> EngineError {
    EngineError::new(EngineErrorCode::InvalidConfig, message)
}

pub fn not_ready(message: impl Into<String>) -> EngineError {
    EngineError::new(EngineErrorCode::NotReady, message)
}

pub fn cancelled(message: impl Into<String>) -> EngineError {
    EngineError::new(EngineErrorCode::Cancelled, message)
}

pub fn internal_error(message: impl Into<String>) -> EngineError {
    EngineError::new(EngineErrorCode::Internal, message)
}
