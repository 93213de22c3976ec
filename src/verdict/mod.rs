//! Result collection
//!
//! Turns an orchestration report into the caller's result after the
//! sandbox is gone.

pub mod collector;

pub use collector::ResultCollector;
