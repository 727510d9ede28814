//! Tower middleware layers wrapped around handler execution.
//!
//! - [`outcome`]: per-entry outcome classes and the `call` span
//! - [`admission`]: node-wide and per-entry concurrency caps
//! - [`timeout`]: per-call budget
//! - [`pipeline`]: composes them around the [`HandlerExecutor`](pipeline::HandlerExecutor)

pub mod admission;
pub mod outcome;
pub mod pipeline;
pub mod timeout;

pub use admission::{AdmissionLayer, ShedScope};
pub use outcome::{OutcomeLayer, OutcomeTally};
pub use pipeline::{build_call_stack, CallStack, HandlerExecutor};
pub use timeout::TimeoutLayer;
