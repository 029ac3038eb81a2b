//! Poll loop and its scheduler.

mod runner;
mod source;

pub use runner::{BackoffPolicy, PollRunner};
pub use source::{KafkaSource, KafkaSourceBuilder, Status};
