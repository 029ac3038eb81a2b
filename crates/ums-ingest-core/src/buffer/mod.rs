//! Per-cycle batch accumulation.
//!
//! The accumulator is owned by the source and only touched under its
//! lifecycle lock, so a batch never outlives the cycle that built it.

mod accumulator;

pub use accumulator::{Batch, BatchAccumulator};
