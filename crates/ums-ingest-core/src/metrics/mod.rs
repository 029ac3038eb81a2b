//! Source counters and their Prometheus text rendering.

mod source_counter;

pub use source_counter::{CounterSnapshot, SourceCounter};
