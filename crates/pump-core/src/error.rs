//! Error types shared by every pipeline component.

use thiserror::Error;

/// Boxed error used to carry arbitrary causes.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Crate-wide result type.
pub type Result<T> = std::result::Result<T, PumpError>;

/// Error type for pipeline operations.
#[derive(Error, Debug)]
pub enum PumpError {
    /// A wiring defect: an event escaped its depth unconsumed, or a depth
    /// index has no matching processor list.
    #[error("Construction error: {0}")]
    Construction(String),

    /// A deliberate per-event failure signaled by a processor.
    #[error("Processing failed in {processor}: {source}")]
    Processing {
        processor: String,
        #[source]
        source: BoxError,
    },

    #[error("Operation was cancelled")]
    Cancelled,

    #[error("Channel closed: {0}")]
    ChannelClosed(&'static str),

    #[error("Queue is full: {0}")]
    QueueFull(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    /// A supervised task panicked or was aborted.
    #[error("Task failed: {0}")]
    Task(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(#[source] BoxError),
}

impl PumpError {
    pub fn construction(msg: impl Into<String>) -> Self {
        Self::Construction(msg.into())
    }

    pub fn processing(
        processor: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Processing {
            processor: processor.into(),
            source: Box::new(source),
        }
    }

    pub fn other(source: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self::Other(Box::new(source))
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    pub fn is_construction(&self) -> bool {
        matches!(self, Self::Construction(_))
    }
}
