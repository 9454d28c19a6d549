use std::collections::BTreeSet;
use std::fmt;
use std::sync::LazyLock;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::adapter::AdapterMetadata;
use crate::engine::Engine;
use crate::logger::Logger;
use crate::runtime;

static LOGGER: LazyLock<Logger> = LazyLock::new(|| Logger::new("@discovery/heartbeat"));

/// Multiplier applied to the heartbeat frequency to tell the management
/// service when to consider this source dead.
const NEXT_HEARTBEAT_FACTOR: f64 = 2.5;

/// One liveness report.
#[derive(Clone, Debug)]
pub struct HeartbeatPayload {
    pub uuid: Option<Uuid>,
    pub version: String,
    pub name: String,
    pub engine_type: String,
    pub managed: bool,
    /// Joined init-error and connection-health text; `None` when healthy.
    pub error: Option<String>,
    /// Scopes served by non-hidden adapters, deduplicated and sorted.
    pub available_scopes: Vec<String>,
    pub adapter_metadata: Vec<AdapterMetadata>,
    /// If no further heartbeat arrives within this window the source should
    /// be considered gone.
    pub next_heartbeat_max: Duration,
}

/// The management RPC surface the engine reports liveness to.
#[async_trait]
pub trait ManagementClient: Send + Sync {
    async fn submit_source_heartbeat(&self, heartbeat: HeartbeatPayload) -> ManagementResult<()>;
}

impl Engine {
    /// Sends the initial heartbeat immediately, then one per configured
    /// frequency until stopped. Disabled by a zero frequency or a missing
    /// management client.
    pub(crate) fn start_heartbeats(&self) {
        if self.inner.config.heartbeat_frequency.is_zero() || self.inner.management.is_none() {
            return;
        }

        let token = CancellationToken::new();
        if let Some(previous) = self
            .inner
            .heartbeat_token
            .lock()
            .unwrap()
            .replace(token.clone())
        {
            previous.cancel();
        }

        let engine = self.clone();
        let frequency = self.inner.config.heartbeat_frequency;
        runtime::spawn_detached(async move {
            loop {
                if let Err(err) = engine.send_heartbeat().await {
                    LOGGER.warn(format!("heartbeat failed: {err}"));
                }
                tokio::select! {
                    _ = token.cancelled() => return,
                    _ = runtime::sleep(frequency) => {}
                }
            }
        });
    }

    /// Builds and submits one heartbeat. No-op without a management client.
    pub async fn send_heartbeat(&self) -> ManagementResult<()> {
        let Some(management) = self.inner.management.clone() else {
            return Ok(());
        };

        let mut error_parts = Vec::new();
        if let Some(init_error) = self.get_init_error() {
            error_parts.push(init_error);
        }
        if let Err(health) = self.connection_health() {
            error_parts.push(health);
        }
        let error = if error_parts.is_empty() {
            None
        } else {
            Some(error_parts.join("; "))
        };

        let mut scopes = BTreeSet::new();
        for adapter in self.inner.host.visible_adapters() {
            scopes.extend(adapter.scopes());
        }
        let adapter_metadata = self
            .inner
            .host
            .adapters()
            .iter()
            .map(|adapter| adapter.metadata())
            .collect();

        management
            .submit_source_heartbeat(HeartbeatPayload {
                uuid: self.uuid(),
                version: self.inner.config.version.clone(),
                name: self.inner.config.source_name.clone(),
                engine_type: self.inner.config.engine_type.clone(),
                managed: self.inner.config.managed,
                error,
                available_scopes: scopes.into_iter().collect(),
                adapter_metadata,
                next_heartbeat_max: self
                    .inner
                    .config
                    .heartbeat_frequency
                    .mul_f64(NEXT_HEARTBEAT_FACTOR),
            })
            .await
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ManagementErrorCode {
    HeartbeatFailed,
}

impl ManagementErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ManagementErrorCode::HeartbeatFailed => "management/heartbeat-failed",
        }
    }
}

#[derive(Clone, Debug)]
pub struct ManagementError {
    pub code: ManagementErrorCode,
    message: String,
}

impl ManagementError {
    pub fn new(code: ManagementErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn code_str(&self) -> &'static str {
        self.code.as_str()
    }
}

impl fmt::Display for ManagementError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.message, self.code_str())
    }
}

impl std::error::Error for ManagementError {}

pub type ManagementResult<T> = Result<T, ManagementError>;

pub fn heartbeat_failed(message: impl Into<String>) -> ManagementError {
    ManagementError::new(ManagementErrorCode::HeartbeatFailed, message)
}
