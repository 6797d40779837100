//! Explicit logger handle.
//!
//! Every session and recovery run receives a [`Logger`] instead of reaching
//! for a process-wide logger, so several recordings in one process can log
//! to different sinks.

use std::fmt;
use std::sync::Arc;

use log::{Level, Log, Metadata, Record};

const DEFAULT_TARGET: &str = "media_encapsuler";

#[derive(Clone)]
pub struct Logger {
    /// `None` forwards to whatever logger the host process installed.
    sink: Option<Arc<dyn Log>>,
    target: String,
}

impl Logger {
    /// Log into an arbitrary `log::Log` implementation.
    pub fn new(sink: Arc<dyn Log>) -> Self {
        Self {
            sink: Some(sink),
            target: DEFAULT_TARGET.to_string(),
        }
    }

    /// Build a private env_logger filtered by `RUST_LOG` (default `info`).
    /// The logger is not installed globally.
    pub fn from_env() -> Self {
        let logger = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
            .build();
        Self::new(Arc::new(logger))
    }

    /// Forward to the process-wide `log` facade.
    pub fn global() -> Self {
        Self {
            sink: None,
            target: DEFAULT_TARGET.to_string(),
        }
    }

    pub fn with_target(mut self, target: impl Into<String>) -> Self {
        self.target = target.into();
        self
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn log(&self, level: Level, args: fmt::Arguments<'_>) {
        let sink: &dyn Log = match &self.sink {
            Some(sink) => sink.as_ref(),
            None => {
                if level > log::max_level() {
                    return;
                }
                log::logger()
            }
        };
        let metadata = Metadata::builder().level(level).target(&self.target).build();
        if !sink.enabled(&metadata) {
            return;
        }
        sink.log(&Record::builder().metadata(metadata).args(args).build());
    }

    pub fn error(&self, args: fmt::Arguments<'_>) {
        self.log(Level::Error, args);
    }

    pub fn warn(&self, args: fmt::Arguments<'_>) {
        self.log(Level::Warn, args);
    }

    pub fn info(&self, args: fmt::Arguments<'_>) {
        self.log(Level::Info, args);
    }

    pub fn debug(&self, args: fmt::Arguments<'_>) {
        self.log(Level::Debug, args);
    }
}

impl Default for Logger {
    fn default() -> Self {
        Self::global()
    }
}

impl fmt::Debug for Logger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Logger")
            .field("target", &self.target)
            .field("private_sink", &self.sink.is_some())
            .finish()
    }
}
