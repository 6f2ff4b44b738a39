//! Structured logging via `tracing`
//!
//! Store operations log through `tracing` macros; this module only builds
//! the subscriber. `RUST_LOG` takes precedence over the configured filter
//! and the first initialization wins.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Once;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        };
        f.write_str(s)
    }
}

impl FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "trace" => Ok(LogLevel::Trace),
            "debug" => Ok(LogLevel::Debug),
            "info" => Ok(LogLevel::Info),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "error" => Ok(LogLevel::Error),
            other => Err(format!("unknown log level '{}'", other)),
        }
    }
}

/// Subscriber settings, embedded in `StoreConfig`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TracingConfig {
    pub default_level: LogLevel,
    /// Per-target overrides, e.g. `world_core::registry` -> debug
    pub module_filters: Vec<(String, LogLevel)>,
    pub show_targets: bool,
    pub show_thread_ids: bool,
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self {
            default_level: LogLevel::Info,
            module_filters: vec![("heed".to_string(), LogLevel::Warn)],
            show_targets: true,
            show_thread_ids: false,
        }
    }
}

impl TracingConfig {
    /// Per-mutation debug output from collections, spatial layers and the
    /// registry
    pub fn verbose() -> Self {
        Self::default()
            .with_module("world_core::collection", LogLevel::Debug)
            .with_module("world_core::spatial", LogLevel::Debug)
            .with_module("world_core::registry", LogLevel::Debug)
            .with_thread_ids(true)
    }

    /// Set (or replace) the level for one target
    pub fn with_module(mut self, module: &str, level: LogLevel) -> Self {
        match self.module_filters.iter_mut().find(|(m, _)| m == module) {
            Some(entry) => entry.1 = level,
            None => self.module_filters.push((module.to_string(), level)),
        }
        self
    }

    pub fn with_thread_ids(mut self, show: bool) -> Self {
        self.show_thread_ids = show;
        self
    }

    /// `EnvFilter` directive string: default level first, then overrides
    pub fn directives(&self) -> String {
        std::iter::once(self.default_level.to_string())
            .chain(
                self.module_filters
                    .iter()
                    .map(|(module, level)| format!("{}={}", module, level)),
            )
            .collect::<Vec<_>>()
            .join(",")
    }
}

static TRACING_INIT: Once = Once::new();

pub fn init_tracing_default() {
    init_tracing(&TracingConfig::default());
}

/// Install the global subscriber (first call wins)
pub fn init_tracing(config: &TracingConfig) {
    let directives = config.directives();
    let (targets, thread_ids) = (config.show_targets, config.show_thread_ids);
    TRACING_INIT.call_once(move || {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(directives));
        let subscriber = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(targets)
            .with_thread_ids(thread_ids)
            .compact();
        // A host or test harness may have installed one already
        let _ = subscriber.try_init();
    });
}

/// Entered span around a named store operation
pub struct TimingSpan {
    _span: tracing::span::EnteredSpan,
}

impl TimingSpan {
    pub fn new(name: &str) -> Self {
        Self {
            _span: tracing::info_span!("store_op", name = name).entered(),
        }
    }
}
