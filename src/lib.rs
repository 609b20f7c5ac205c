//! Convoy - a library for orchestrating trees of asynchronous work units.
//!
//! Callers declare trees of steps: leaf units wrap a single action, lanes
//! drain an ordered queue of children strictly in sequence, and lane pools
//! distribute an unbounded queue across a fixed number of lanes. Lifecycle
//! activity (executing/progress/done/error) bubbles to ancestors under
//! relabeled signal names, and the final result resolves through the root's
//! execution handle.

// Core infrastructure modules
pub mod core {
    pub mod errors;
}

// The execution model: units, queues, lanes, pools
pub mod flow;

// Re-exports for convenience
pub use crate::core::errors::{ConvoyError, Result};
pub use crate::flow::*;
