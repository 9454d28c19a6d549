use std::time::Duration;

use url::Url;
use uuid::Uuid;

use crate::bus::nats::NatsOptions;
use crate::engine::{invalid_config, EngineResult};

/// Hard ceiling on any client-supplied deadline.
pub const DEFAULT_MAX_REQUEST_TIMEOUT: Duration = Duration::from_secs(5 * 60);
/// How often heartbeats are reported; zero disables the background loop.
pub const DEFAULT_HEARTBEAT_FREQUENCY: Duration = Duration::from_secs(5 * 60);
/// How long cancelled queries may keep running before their workers are
/// logged as stragglers.
pub const DEFAULT_EXECUTION_GRACE_PERIOD: Duration = Duration::from_secs(2 * 60);
/// Ceiling on the pre-subscribe flush when (re)connecting.
pub const DEFAULT_FLUSH_TIMEOUT: Duration = Duration::from_secs(10 * 60);

/// Everything an [`Engine`](crate::engine::Engine) needs to know up front.
#[derive(Clone, Debug)]
pub struct EngineConfig {
    /// Identifier reported in heartbeats and stamped on errors. Defaults to
    /// `<engine_type>-<hostname>`.
    pub source_name: String,
    /// Stable identity; generated at start when absent.
    pub source_uuid: Option<Uuid>,
    /// The kind of infrastructure this engine discovers, e.g. `aws`.
    pub engine_type: String,
    /// Reported in heartbeats.
    pub version: String,
    /// Whether this source is managed by the platform or user-run.
    pub managed: bool,
    /// Worker-pool size, per query method.
    pub max_parallel_executions: usize,
    pub max_request_timeout: Duration,
    pub heartbeat_frequency: Duration,
    /// Watcher escalation threshold; `None` escalates only on a terminally
    /// closed connection.
    pub reconnection_timeout: Option<Duration>,
    pub execution_grace_period: Duration,
    /// Readiness probe port; `None` disables the HTTP listener.
    pub health_check_port: Option<u16>,
    /// NATS dial parameters; `None` runs the engine without a bus (local and
    /// test use).
    pub nats: Option<NatsOptions>,
    /// Queue group shared by load-balanced engine instances.
    pub queue_name: Option<String>,
    /// Override for the cache purger interval.
    pub cache_purge_interval: Option<Duration>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        let engine_type = "discovery".to_string();
        Self {
            source_name: format!("{engine_type}-{}", local_hostname()),
            source_uuid: None,
            engine_type,
            version: env!("CARGO_PKG_VERSION").to_string(),
            managed: false,
            max_parallel_executions: default_parallelism(),
            max_request_timeout: DEFAULT_MAX_REQUEST_TIMEOUT,
            heartbeat_frequency: DEFAULT_HEARTBEAT_FREQUENCY,
            reconnection_timeout: None,
            execution_grace_period: DEFAULT_EXECUTION_GRACE_PERIOD,
            health_check_port: None,
            nats: None,
            queue_name: None,
            cache_purge_interval: None,
        }
    }
}

impl EngineConfig {
    pub fn validate(&self) -> EngineResult<()> {
        if self.engine_type.is_empty() {
            return Err(invalid_config("engine_type must not be empty"));
        }
        if self.source_name.is_empty() {
            return Err(invalid_config("source_name must not be empty"));
        }
        if self.max_parallel_executions == 0 {
            return Err(invalid_config("max_parallel_executions must be at least 1"));
        }
        if self.max_request_timeout.is_zero() {
            return Err(invalid_config("max_request_timeout must not be zero"));
        }
        if let Some(nats) = &self.nats {
            if nats.servers.is_empty() {
                return Err(invalid_config("at least one NATS server is required"));
            }
            for server in &nats.servers {
                Url::parse(server).map_err(|err| {
                    invalid_config(format!("invalid NATS server url \"{server}\": {err}"))
                })?;
            }
        }
        Ok(())
    }
}

fn local_hostname() -> String {
    hostname::get()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "unknown".to_string())
}

fn default_parallelism() -> usize {
    std::thread::available_parallelism()
        .map(|count| count.get())
        .unwrap_or(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        EngineConfig::default().validate().unwrap();
    }

    #[test]
    fn default_source_name_includes_engine_type() {
        let config = EngineConfig::default();
        assert!(config.source_name.starts_with("discovery-"));
    }

    #[test]
    fn zero_parallelism_rejected() {
        let config = EngineConfig {
            max_parallel_executions: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn bad_nats_url_rejected() {
        let config = EngineConfig {
            nats: Some(NatsOptions {
                servers: vec!["not a url".to_string()],
                ..Default::default()
            }),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
