use std::sync::{Arc, LazyLock, Weak};
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

use crate::bus::{BusConnection, ConnectionState};
use crate::logger::Logger;
use crate::runtime;

static LOGGER: LazyLock<Logger> = LazyLock::new(|| Logger::new("@discovery/watcher"));

pub const DEFAULT_CHECK_INTERVAL: Duration = Duration::from_secs(3);

pub type FailureHandler = Arc<dyn Fn() + Send + Sync>;

#[derive(Clone, Debug)]
pub struct WatcherConfig {
    pub check_interval: Duration,
    /// `None`: only escalate on a terminally closed connection. `Some(t)`:
    /// also escalate once a disconnection has lasted longer than `t`.
    pub reconnection_timeout: Option<Duration>,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            check_interval: DEFAULT_CHECK_INTERVAL,
            reconnection_timeout: None,
        }
    }
}

/// Polls connection status and escalates to the failure handler at most once
/// per continuous disconnection.
///
/// Holds only a weak reference to the connection: the engine owns the
/// connection's lifetime and the watch loop exits when it is dropped.
pub struct ConnectionWatcher {
    token: CancellationToken,
}

impl ConnectionWatcher {
    pub fn start(
        connection: Weak<dyn BusConnection>,
        config: WatcherConfig,
        on_failure: FailureHandler,
    ) -> Self {
        let token = CancellationToken::new();
        let loop_token = token.clone();

        runtime::spawn_detached(async move {
            let mut disconnected_since: Option<Instant> = None;
            let mut failure_handler_triggered = false;

            loop {
                tokio::select! {
                    _ = loop_token.cancelled() => return,
                    _ = runtime::sleep(config.check_interval) => {}
                }

                let Some(connection) = connection.upgrade() else {
                    return;
                };

                match connection.status() {
                    ConnectionState::Connected => {
                        if disconnected_since.take().is_some() {
                            LOGGER.info("connection recovered");
                        }
                        failure_handler_triggered = false;
                    }
                    state => {
                        let since = *disconnected_since.get_or_insert_with(Instant::now);
                        if failure_handler_triggered {
                            continue;
                        }
                        let escalate = state == ConnectionState::Closed
                            || config
                                .reconnection_timeout
                                .is_some_and(|timeout| since.elapsed() > timeout);
                        if escalate {
                            LOGGER.warn(format!(
                                "connection unhealthy ({state:?}); triggering failure handler"
                            ));
                            failure_handler_triggered = true;
                            (on_failure)();
                        }
                    }
                }
            }
        });

        Self { token }
    }

    pub fn stop(&self) {
        self.token.cancel();
    }
}

impl Drop for ConnectionWatcher {
    fn drop(&mut self) {
        self.token.cancel();
    }
}
