//! Workflow execution runtime
//!
//! This crate provides the engine that runs workflows: the frozen node type
//! registry, per-type rate limits, and DAG-based parallel execution.

mod executor;
mod limits;
mod registry;
mod runtime;

pub use executor::WorkflowExecutor;
pub use limits::{RateLimiter, RateLimiters, RatePermit};
pub use registry::NodeRegistry;
pub use runtime::{ExecutionHandle, FlowRuntime, RuntimeConfig};
