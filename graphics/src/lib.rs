//! # Nightbloom Graphics
//!
//! Per-frame GPU render-graph scheduler for Nightbloom.
//!
//! Each frame, clients declare passes and the resources they consume and
//! produce; the graph derives execution order, state-transition barriers,
//! cross-queue fences, and a task graph for the CPU worker pool. See
//! [`graph`] for the frame lifecycle.

pub mod graph;
pub mod renderer;

pub use graph::{
    AggregateNode, Dependency, GpuResource, PassHandle, PassType, RenderGraph, ResourceState,
    TransitionBarrier,
};
pub use renderer::{CommandList, Renderer};

/// Graphics library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
