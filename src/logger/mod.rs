use chrono::{SecondsFormat, Utc};
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, LazyLock, Mutex, RwLock, Weak};

static GLOBAL_LOG_LEVEL: AtomicU8 = AtomicU8::new(LogLevel::Info as u8);
static INSTANCES: LazyLock<Mutex<Vec<Weak<LoggerInner>>>> =
    LazyLock::new(|| Mutex::new(Vec::new()));

pub type LogHandler = Arc<dyn Fn(&Logger, LogLevel, &str) + Send + Sync + 'static>;

/// Named, leveled logger used throughout the engine.
///
/// Every module holds its own instance (`@discovery/<area>`); the handler can
/// be swapped per instance, which is how tests capture output without global
/// state.
#[derive(Clone)]
pub struct Logger {
    inner: Arc<LoggerInner>,
}

struct LoggerInner {
    name: String,
    log_level: AtomicU8,
    handler: RwLock<LogHandler>,
}

impl Logger {
    pub fn new(name: impl Into<String>) -> Self {
        let inner = Arc::new(LoggerInner {
            name: name.into(),
            log_level: AtomicU8::new(GLOBAL_LOG_LEVEL.load(Ordering::SeqCst)),
            handler: RwLock::new(default_log_handler_arc()),
        });
        INSTANCES.lock().unwrap().push(Arc::downgrade(&inner));
        Self { inner }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn log_level(&self) -> LogLevel {
        LogLevel::from_u8(self.inner.log_level.load(Ordering::SeqCst))
    }

    pub fn set_log_level(&self, level: LogLevel) {
        self.inner.log_level.store(level as u8, Ordering::SeqCst);
    }

    pub fn set_log_handler<F>(&self, handler: F)
    where
        F: Fn(&Logger, LogLevel, &str) + Send + Sync + 'static,
    {
        *self.inner.handler.write().unwrap() = Arc::new(handler);
    }

    pub fn reset_log_handler(&self) {
        *self.inner.handler.write().unwrap() = default_log_handler_arc();
    }

    pub fn debug(&self, message: impl AsRef<str>) {
        self.dispatch(LogLevel::Debug, message.as_ref());
    }

    pub fn verbose(&self, message: impl AsRef<str>) {
        self.dispatch(LogLevel::Verbose, message.as_ref());
    }

    pub fn info(&self, message: impl AsRef<str>) {
        self.dispatch(LogLevel::Info, message.as_ref());
    }

    pub fn warn(&self, message: impl AsRef<str>) {
        self.dispatch(LogLevel::Warn, message.as_ref());
    }

    pub fn error(&self, message: impl AsRef<str>) {
        self.dispatch(LogLevel::Error, message.as_ref());
    }

    fn dispatch(&self, level: LogLevel, message: &str) {
        let handler = self.inner.handler.read().unwrap().clone();
        handler(self, level, message);
    }

    fn from_inner(inner: Arc<LoggerInner>) -> Self {
        Self { inner }
    }
}

fn default_log_handler_arc() -> LogHandler {
    Arc::new(default_log_handler)
}

fn default_log_handler(logger: &Logger, level: LogLevel, message: &str) {
    if level < logger.log_level() || level == LogLevel::Silent {
        return;
    }

    // Mirror into the `log` facade so embedders wiring env_logger or similar
    // see engine output alongside their own.
    log::log!(target: "discovery_source", level.to_log_level(), "{}: {message}", logger.name());

    let now = Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true);
    let line = format!("[{}] {} {}: {message}", now, level, logger.name());
    match level {
        LogLevel::Warn | LogLevel::Error => eprintln!("{line}"),
        _ => println!("{line}"),
    }
}

fn with_instances<F>(mut f: F)
where
    F: FnMut(Logger),
{
    let mut instances = INSTANCES.lock().unwrap();
    let mut i = 0;
    while i < instances.len() {
        match instances[i].upgrade() {
            Some(inner) => {
                f(Logger::from_inner(inner));
                i += 1;
            }
            None => {
                instances.swap_remove(i);
            }
        }
    }
}

/// Sets the level on every live logger instance as well as the default for
/// loggers created later.
pub fn set_log_level(level: LogLevel) {
    GLOBAL_LOG_LEVEL.store(level as u8, Ordering::SeqCst);
    with_instances(|logger| logger.set_log_level(level));
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum LogLevel {
    Debug = 0,
    Verbose = 1,
    Info = 2,
    Warn = 3,
    Error = 4,
    Silent = 5,
}

impl LogLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Verbose => "verbose",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
            LogLevel::Silent => "silent",
        }
    }

    fn from_u8(value: u8) -> Self {
        match value {
            0 => LogLevel::Debug,
            1 => LogLevel::Verbose,
            2 => LogLevel::Info,
            3 => LogLevel::Warn,
            4 => LogLevel::Error,
            _ => LogLevel::Silent,
        }
    }

    fn to_log_level(self) -> log::Level {
        match self {
            LogLevel::Debug => log::Level::Debug,
            LogLevel::Verbose => log::Level::Trace,
            LogLevel::Info => log::Level::Info,
            LogLevel::Warn => log::Level::Warn,
            LogLevel::Error | LogLevel::Silent => log::Level::Error,
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            LogLevel::Debug => "DEBUG",
            LogLevel::Verbose => "VERBOSE",
            LogLevel::Info => "INFO",
            LogLevel::Warn => "WARN",
            LogLevel::Error => "ERROR",
            LogLevel::Silent => "SILENT",
        };
        f.write_str(label)
    }
}

impl FromStr for LogLevel {
    type Err = LogError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "debug" => Ok(LogLevel::Debug),
            "verbose" => Ok(LogLevel::Verbose),
            "info" => Ok(LogLevel::Info),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "error" => Ok(LogLevel::Error),
            "silent" => Ok(LogLevel::Silent),
            other => Err(LogError::InvalidLogLevel(other.to_string())),
        }
    }
}

#[derive(Debug, Clone)]
pub enum LogError {
    InvalidLogLevel(String),
}

impl fmt::Display for LogError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogError::InvalidLogLevel(level) => {
                write!(f, "invalid value \"{level}\" assigned to `logLevel`")
            }
        }
    }
}

impl std::error::Error for LogError {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    static TEST_GUARD: LazyLock<Mutex<()>> = LazyLock::new(|| Mutex::new(()));

    #[test]
    fn handler_sees_all_levels_in_order() {
        let _guard = TEST_GUARD.lock().unwrap();
        let logger = Logger::new("@discovery/logger-test");
        logger.set_log_level(LogLevel::Debug);

        let records = Arc::new(Mutex::new(Vec::new()));
        let captured = Arc::clone(&records);
        logger.set_log_handler(move |instance, level, message| {
            if level < instance.log_level() {
                return;
            }
            captured.lock().unwrap().push((level, message.to_owned()));
        });

        logger.debug("debug message");
        logger.verbose("verbose message");
        logger.info("info message");
        logger.warn("warn message");
        logger.error("error message");

        let stored = records.lock().unwrap();
        let levels: Vec<_> = stored.iter().map(|(level, _)| *level).collect();
        assert_eq!(
            levels,
            [
                LogLevel::Debug,
                LogLevel::Verbose,
                LogLevel::Info,
                LogLevel::Warn,
                LogLevel::Error,
            ]
        );
        assert_eq!(stored[0].1, "debug message");
    }

    #[test]
    fn instance_level_filters() {
        let _guard = TEST_GUARD.lock().unwrap();
        let logger = Logger::new("@discovery/logger-filter-test");
        logger.set_log_level(LogLevel::Warn);

        let records = Arc::new(Mutex::new(Vec::new()));
        let captured = Arc::clone(&records);
        logger.set_log_handler(move |instance, level, message| {
            if level < instance.log_level() {
                return;
            }
            captured.lock().unwrap().push((level, message.to_owned()));
        });

        logger.info("info message");
        logger.warn("warn message");
        logger.error("error message");

        let stored = records.lock().unwrap();
        let levels: Vec<_> = stored.iter().map(|(level, _)| *level).collect();
        assert_eq!(levels, [LogLevel::Warn, LogLevel::Error]);
    }

    #[test]
    fn global_level_applies_to_live_instances() {
        let _guard = TEST_GUARD.lock().unwrap();
        let logger = Logger::new("@discovery/logger-global-test");
        set_log_level(LogLevel::Error);
        assert_eq!(logger.log_level(), LogLevel::Error);
        set_log_level(LogLevel::Info);
        assert_eq!(logger.log_level(), LogLevel::Info);
    }

    #[test]
    fn level_parses_from_strings() {
        assert_eq!(LogLevel::from_str("warning").unwrap(), LogLevel::Warn);
        assert_eq!(LogLevel::from_str("SILENT").unwrap(), LogLevel::Silent);
        assert!(LogLevel::from_str("loud").is_err());
    }
}
