use std::fmt;
use std::future::Future;
use std::sync::LazyLock;
use std::time::Duration;

use tokio::runtime::{Builder, Handle, Runtime};

/// Spawns an async task that runs in the background, from either an async or
/// a sync context.
///
/// Callers outside a tokio runtime (the watcher failure handler, drop paths)
/// fall back to a shared single-threaded runtime.
pub fn spawn_detached<F>(future: F)
where
    F: Future<Output = ()> + Send + 'static,
{
    static BACKGROUND_RUNTIME: LazyLock<Runtime> = LazyLock::new(|| {
        Builder::new_current_thread()
            .enable_all()
            .build()
            .expect("failed to build background tokio runtime")
    });

    if let Ok(handle) = Handle::try_current() {
        handle.spawn(future);
    } else {
        let _ = BACKGROUND_RUNTIME.spawn(future);
    }
}

/// Asynchronously waits for the provided duration.
pub async fn sleep(duration: Duration) {
    if duration.is_zero() {
        return;
    }
    tokio::time::sleep(duration).await;
}

/// Timeout error returned when an operation exceeds the allotted duration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeoutError;

impl fmt::Display for TimeoutError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "operation timed out")
    }
}

impl std::error::Error for TimeoutError {}

/// Runs the provided future and resolves with `TimeoutError` if it does not
/// complete within the specified duration. A zero duration means no timeout.
pub async fn with_timeout<F, T>(future: F, duration: Duration) -> Result<T, TimeoutError>
where
    F: Future<Output = T>,
{
    if duration.is_zero() {
        return Ok(future.await);
    }

    tokio::time::timeout(duration, future)
        .await
        .map_err(|_| TimeoutError)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    #[tokio::test(flavor = "current_thread")]
    async fn spawn_detached_runs_inside_runtime() {
        let flag = Arc::new(AtomicBool::new(false));
        let task_flag = flag.clone();
        spawn_detached(async move {
            task_flag.store(true, Ordering::SeqCst);
        });
        tokio::task::yield_now().await;
        sleep(Duration::from_millis(10)).await;
        assert!(flag.load(Ordering::SeqCst));
    }

    #[tokio::test(flavor = "current_thread")]
    async fn with_timeout_times_out() {
        let result = with_timeout(
            sleep(Duration::from_secs(5)),
            Duration::from_millis(10),
        )
        .await;
        assert_eq!(result, Err(TimeoutError));
    }

    #[tokio::test(flavor = "current_thread")]
    async fn zero_duration_disables_timeout() {
        let result = with_timeout(async { 42 }, Duration::ZERO).await;
        assert_eq!(result, Ok(42));
    }
}
