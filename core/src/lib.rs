//! # Nightbloom Engine Core
//!
//! Core crate for Nightbloom Engine: the CPU task graph runtime, wait
//! objects, allocation-reuse pooling, and profiling instrumentation.

pub mod pool;
pub mod profiling;
pub mod sync;
pub mod task;
pub mod task_pool;

pub use sync::WaitObject;
pub use task::{Task, TaskPriority, TaskSet, TaskSetHandle};
pub use task_pool::{TaskPool, ThreadPriority};

/// Core library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
