//! Reusable generic stages.

mod generators;
mod sinks;
mod sources;
mod stages;

pub use generators::IteratorGenerator;
pub use sinks::{CollectSink, FnSink, NullSink};
pub use sources::{IteratorSource, ManualSource};
pub use stages::{FnProcessor, LatchProcessor};
