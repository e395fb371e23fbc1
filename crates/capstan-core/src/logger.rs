//! Levelled logger contract with grouped push/pop buffering
//!
//! The engine does not format logs itself; it requires a logger with the
//! usual levels plus named per-level groups. Messages pushed under a group
//! accumulate silently and are flushed in order when the group pops. Level
//! reads/writes and push/pop are thread-safe so operations running on
//! different workers can report into shared groups.

use std::collections::HashMap;
use std::sync::{Mutex, RwLock};

use serde::{Deserialize, Serialize};

/// Log verbosity level, from fully muted to most verbose
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "kebab-case")]
pub enum Level {
    Silent,
    Error,
    Warn,
    #[default]
    Info,
    Debug,
    Trace,
}

impl Level {
    /// Human-readable level name
    pub fn as_str(&self) -> &'static str {
        match self {
            Level::Silent => "silent",
            Level::Error => "error",
            Level::Warn => "warn",
            Level::Info => "info",
            Level::Debug => "debug",
            Level::Trace => "trace",
        }
    }
}

impl std::fmt::Display for Level {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for Level {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "silent" => Ok(Level::Silent),
            "error" => Ok(Level::Error),
            "warn" | "warning" => Ok(Level::Warn),
            "info" => Ok(Level::Info),
            "debug" => Ok(Level::Debug),
            "trace" => Ok(Level::Trace),
            _ => Err(format!("unknown log level: {}", s)),
        }
    }
}

/// Logging contract required by the engine
///
/// Implementations must be safe to share across workers. `push` buffers a
/// message under a named group at the given level; `pop` flushes the group's
/// messages in insertion order and forgets the group.
pub trait Logger: Send + Sync {
    /// Emit a message at the given level
    fn log(&self, level: Level, message: &str);

    /// Buffer a message under a named group
    fn push(&self, level: Level, group: &str, message: &str);

    /// Flush and forget a named group
    fn pop(&self, level: Level, group: &str);

    /// Change the accepted level
    fn set_level(&self, level: Level);

    /// Current accepted level
    fn level(&self) -> Level;

    /// Whether a message at `level` would currently be emitted
    fn accepts(&self, level: Level) -> bool {
        level != Level::Silent && self.level() >= level
    }

    fn trace(&self, message: &str) {
        self.log(Level::Trace, message);
    }

    fn debug(&self, message: &str) {
        self.log(Level::Debug, message);
    }

    fn info(&self, message: &str) {
        self.log(Level::Info, message);
    }

    fn warn(&self, message: &str) {
        self.log(Level::Warn, message);
    }

    fn error(&self, message: &str) {
        self.log(Level::Error, message);
    }
}

/// Logger implementation forwarding to the `tracing` ecosystem
pub struct TracingLogger {
    level: RwLock<Level>,
    stash: Mutex<HashMap<(Level, String), Vec<String>>>,
}

impl TracingLogger {
    /// Create a logger accepting `info` and below
    pub fn new() -> Self {
        Self::with_level(Level::Info)
    }

    /// Create a logger with an explicit accepted level
    pub fn with_level(level: Level) -> Self {
        Self {
            level: RwLock::new(level),
            stash: Mutex::new(HashMap::new()),
        }
    }

    /// Number of messages currently buffered under a group
    pub fn pending(&self, level: Level, group: &str) -> usize {
        self.stash
            .lock()
            .expect("logger stash poisoned")
            .get(&(level, group.to_string()))
            .map(|msgs| msgs.len())
            .unwrap_or(0)
    }
}

impl Default for TracingLogger {
    fn default() -> Self {
        Self::new()
    }
}

impl Logger for TracingLogger {
    fn log(&self, level: Level, message: &str) {
        if !self.accepts(level) {
            return;
        }

        match level {
            Level::Silent => {}
            Level::Error => tracing::error!("{}", message),
            Level::Warn => tracing::warn!("{}", message),
            Level::Info => tracing::info!("{}", message),
            Level::Debug => tracing::debug!("{}", message),
            Level::Trace => tracing::trace!("{}", message),
        }
    }

    fn push(&self, level: Level, group: &str, message: &str) {
        let mut stash = self.stash.lock().expect("logger stash poisoned");
        stash
            .entry((level, group.to_string()))
            .or_default()
            .push(message.to_string());
    }

    fn pop(&self, level: Level, group: &str) {
        let messages = {
            let mut stash = self.stash.lock().expect("logger stash poisoned");
            stash.remove(&(level, group.to_string())).unwrap_or_default()
        };

        for message in messages {
            self.log(level, &message);
        }
    }

    fn set_level(&self, level: Level) {
        *self.level.write().expect("logger level poisoned") = level;
    }

    fn level(&self) -> Level {
        *self.level.read().expect("logger level poisoned")
    }
}

/// Logger that records nothing, for tests and silent embedding
pub struct NullLogger {
    level: RwLock<Level>,
}

impl NullLogger {
    pub fn new() -> Self {
        Self {
            level: RwLock::new(Level::Silent),
        }
    }
}

impl Default for NullLogger {
    fn default() -> Self {
        Self::new()
    }
}

impl Logger for NullLogger {
    fn log(&self, _level: Level, _message: &str) {}

    fn push(&self, _level: Level, _group: &str, _message: &str) {}

    fn pop(&self, _level: Level, _group: &str) {}

    fn set_level(&self, level: Level) {
        *self.level.write().expect("logger level poisoned") = level;
    }

    fn level(&self) -> Level {
        *self.level.read().expect("logger level poisoned")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_ordering() {
        assert!(Level::Trace > Level::Debug);
        assert!(Level::Debug > Level::Info);
        assert!(Level::Info > Level::Warn);
        assert!(Level::Warn > Level::Error);
        assert!(Level::Error > Level::Silent);
    }

    #[test]
    fn test_level_parse() {
        assert_eq!("info".parse::<Level>().unwrap(), Level::Info);
        assert_eq!("WARN".parse::<Level>().unwrap(), Level::Warn);
        assert_eq!("warning".parse::<Level>().unwrap(), Level::Warn);
        assert!("verbose".parse::<Level>().is_err());
    }

    #[test]
    fn test_accepts_respects_current_level() {
        let logger = TracingLogger::with_level(Level::Warn);

        assert!(logger.accepts(Level::Error));
        assert!(logger.accepts(Level::Warn));
        assert!(!logger.accepts(Level::Info));
        assert!(!logger.accepts(Level::Trace));
    }

    #[test]
    fn test_silent_never_accepted() {
        let logger = TracingLogger::with_level(Level::Trace);
        assert!(!logger.accepts(Level::Silent));

        logger.set_level(Level::Silent);
        assert!(!logger.accepts(Level::Error));
    }

    #[test]
    fn test_set_level() {
        let logger = TracingLogger::new();
        assert_eq!(logger.level(), Level::Info);

        logger.set_level(Level::Trace);
        assert_eq!(logger.level(), Level::Trace);
    }

    #[test]
    fn test_push_accumulates_until_pop() {
        let logger = TracingLogger::new();

        logger.push(Level::Info, "completed", "apply resource: ConfigMap/cfg");
        logger.push(Level::Info, "completed", "apply resource: Deployment/web");
        assert_eq!(logger.pending(Level::Info, "completed"), 2);

        logger.pop(Level::Info, "completed");
        assert_eq!(logger.pending(Level::Info, "completed"), 0);
    }

    #[test]
    fn test_groups_are_independent_per_level() {
        let logger = TracingLogger::new();

        logger.push(Level::Info, "ops", "one");
        logger.push(Level::Error, "ops", "two");

        logger.pop(Level::Info, "ops");
        assert_eq!(logger.pending(Level::Info, "ops"), 0);
        assert_eq!(logger.pending(Level::Error, "ops"), 1);
    }

    #[test]
    fn test_pop_unknown_group_is_noop() {
        let logger = TracingLogger::new();
        logger.pop(Level::Debug, "nothing-here");
    }

    #[test]
    fn test_push_pop_across_threads() {
        let logger = std::sync::Arc::new(TracingLogger::new());

        let handles: Vec<_> = (0..4)
            .map(|i| {
                let logger = logger.clone();
                std::thread::spawn(move || {
                    for j in 0..25 {
                        logger.push(Level::Debug, "shared", &format!("{}-{}", i, j));
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(logger.pending(Level::Debug, "shared"), 100);
    }
}
