//! tidegate-metrics — counters for Tidegate control-loop events.
//!
//! # Architecture
//!
//! ```text
//! CounterRegistry
//!   ├── incr_counter(["cluster", "aws", "instance_terminations"], 1)
//!   └── get(path) → current value
//! ```

pub mod counters;

pub use counters::CounterRegistry;
