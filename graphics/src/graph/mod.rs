//! Render graph infrastructure.
//!
//! The render graph accepts a dynamically declared set of passes and the
//! resources they consume and produce each frame, then derives everything
//! needed to execute the frame correctly and concurrently:
//!
//! - a legal execution order (topological sort over producer/consumer edges)
//! - the minimal set of resource state-transition barriers between passes
//! - cross-queue synchronization between the graphics queue and the
//!   async-compute queue, with transitive fences elided
//! - a task graph handed to the CPU worker pool for concurrent command-list
//!   recording and submission
//!
//! # Frame lifecycle
//!
//! ```ignore
//! graph.begin_frame();
//! graph.register_resource(Some(gbuffer), GBUFFER_ID, ResourceState::COMMON, true);
//! let gbuffer_pass = graph.register_pass("gbuffer", PassType::Graphics, record_gbuffer, false);
//! graph.move_to_post_register();
//!
//! graph.add_output(gbuffer_pass, GBUFFER_ID, ResourceState::RENDER_TARGET);
//!
//! let mut ts = TaskSet::new();
//! graph.build(&mut ts);
//! ts.finalize(pool.signals());
//! pool.enqueue_set(ts);
//! while !pool.try_flush() {}
//! ```
//!
//! The graph does not own GPU objects; command lists, queue waits, and
//! fences go through the [`Renderer`] façade.

mod build;
mod node;
mod resource;
mod submit;

pub use node::{
    AggregateNode, MAX_RENDER_PASSES, PassHandle, PassType, RecordFn, RenderNode,
    TransitionBarrier,
};
pub use resource::{
    Dependency, GpuResource, MAX_PRODUCERS, MAX_RESOURCES, NUM_RESERVED_PATHS, ResourceMetadata,
    ResourceState, ResourceTable, is_reserved_path,
};

use std::sync::Arc;
use std::sync::atomic::Ordering;

use nightbloom_core::pool::Pooled;
use nightbloom_core::sync::WaitObject;
use nightbloom_core::task::TaskSet;
use nightbloom_core::profile_scope;

use crate::renderer::Renderer;
use build::BuildScratch;
use submit::FrameExecState;

/// The per-frame render-graph scheduler.
///
/// See the [module documentation](self) for the frame lifecycle. All methods
/// take `&mut self`; concurrent declaration from multiple threads is
/// serialized by the caller.
pub struct RenderGraph {
    renderer: Arc<dyn Renderer>,
    resources: ResourceTable,
    /// Registered passes; permuted into execution order by `build`.
    nodes: Vec<RenderNode>,
    /// `mapping[original_handle] = execution-order index`, filled by `build`.
    mapping: Vec<u32>,
    /// Builder scratch retained across frames.
    scratch: Pooled<BuildScratch>,
    /// Execution state of the frame most recently built.
    exec: Option<Arc<FrameExecState>>,
    /// Signalled once when the last aggregate of the frame submits.
    submission_wait: Option<WaitObject>,
    in_begin_end: bool,
    in_pre_register: bool,
}

impl RenderGraph {
    /// Create a render graph driving the given renderer façade.
    pub fn new(renderer: Arc<dyn Renderer>) -> Self {
        Self {
            renderer,
            resources: ResourceTable::new(),
            nodes: Vec::with_capacity(MAX_RENDER_PASSES),
            mapping: Vec::new(),
            scratch: Pooled::default(),
            exec: None,
            submission_wait: None,
            in_begin_end: false,
            in_pre_register: false,
        }
    }

    /// Open the frame's begin/end block and enter the pre-register phase.
    pub fn begin_frame(&mut self) {
        debug_assert!(
            !self.in_begin_end && !self.in_pre_register,
            "begin_frame called inside a begin/end block"
        );

        self.resources.begin_frame();
        self.nodes.clear();
        self.mapping.clear();
        self.exec = None;
        self.in_begin_end = true;
        self.in_pre_register = true;
    }

    /// Register a GPU resource for this frame.
    ///
    /// Valid only during pre-register. Re-registering an id carried over from
    /// a previous frame is a no-op unless the native resource changed.
    /// `resource` may be `None` only for dummy ids below
    /// [`NUM_RESERVED_PATHS`].
    pub fn register_resource(
        &mut self,
        resource: Option<GpuResource>,
        id: u64,
        initial_state: ResourceState,
        window_size_dependent: bool,
    ) {
        debug_assert!(
            self.in_begin_end && self.in_pre_register,
            "register_resource is only valid during pre-register"
        );

        self.resources
            .register(resource, id, initial_state, window_size_dependent);
    }

    /// Remove a tracked resource.
    ///
    /// Valid only outside the begin/end block.
    pub fn remove_resource(&mut self, id: u64) {
        debug_assert!(!self.in_begin_end, "remove_resource inside a begin/end block");
        self.resources.remove(id);
    }

    /// Remove a batch of tracked resources.
    ///
    /// Valid only outside the begin/end block.
    pub fn remove_resources(&mut self, ids: &[u64]) {
        debug_assert!(!self.in_begin_end, "remove_resources inside a begin/end block");
        self.resources.remove_many(ids);
    }

    /// Drop window-size-dependent resources after a resize.
    ///
    /// Valid only outside the begin/end block; the client re-registers the
    /// resized resources during the next pre-register.
    pub fn reset(&mut self) {
        debug_assert!(!self.in_begin_end, "reset inside a begin/end block");
        self.resources.reset();
        self.nodes.clear();
        self.mapping.clear();
        self.exec = None;
    }

    /// Register a render pass.
    ///
    /// Valid only during pre-register. The returned handle stays valid for
    /// the whole frame.
    pub fn register_pass(
        &mut self,
        name: impl Into<String>,
        pass_type: PassType,
        record: impl Fn(&mut crate::renderer::CommandList) + Send + Sync + 'static,
        force_separate_cmdlist: bool,
    ) -> PassHandle {
        debug_assert!(
            self.in_begin_end && self.in_pre_register,
            "register_pass is only valid during pre-register"
        );
        debug_assert!(
            self.nodes.len() < MAX_RENDER_PASSES,
            "render pass count exceeded MAX_RENDER_PASSES"
        );

        self.nodes.push(RenderNode::new(
            name.into(),
            pass_type,
            Box::new(record),
            force_separate_cmdlist,
        ));
        PassHandle::new((self.nodes.len() - 1) as u32)
    }

    /// Close pre-register: sort the resource table and allow dependency
    /// declaration.
    pub fn move_to_post_register(&mut self) {
        debug_assert!(
            self.in_begin_end && self.in_pre_register,
            "move_to_post_register outside pre-register"
        );

        self.resources.seal();
        self.in_pre_register = false;
    }

    /// Declare that a pass consumes a resource in the given state.
    ///
    /// Valid only in post-register. The resource's existence is checked at
    /// build time.
    pub fn add_input(&mut self, handle: PassHandle, resource_id: u64, expected_state: ResourceState) {
        debug_assert!(
            self.in_begin_end && !self.in_pre_register,
            "add_input is only valid in post-register"
        );
        debug_assert!(handle.index() < self.nodes.len(), "invalid pass handle");
        debug_assert!(
            expected_state.is_read(),
            "input expected state must name only read states"
        );

        self.nodes[handle.index()].inputs.push(Dependency {
            resource_id,
            expected_state,
        });
    }

    /// Declare that a pass produces a resource in the given state.
    ///
    /// Valid only in post-register. Appends the pass to the resource's
    /// producer list.
    pub fn add_output(&mut self, handle: PassHandle, resource_id: u64, expected_state: ResourceState) {
        debug_assert!(
            self.in_begin_end && !self.in_pre_register,
            "add_output is only valid in post-register"
        );
        debug_assert!(handle.index() < self.nodes.len(), "invalid pass handle");
        debug_assert!(
            expected_state.is_write(),
            "output expected state must name only write states"
        );
        debug_assert!(
            self.nodes[handle.index()].pass_type != PassType::AsyncCompute
                || !expected_state.intersects(ResourceState::ILLEGAL_COMPUTE_STATES),
            "state {expected_state:?} is not supported on an async-compute command list"
        );

        self.nodes[handle.index()].outputs.push(Dependency {
            resource_id,
            expected_state,
        });

        let idx = self
            .resources
            .find(resource_id)
            .unwrap_or_else(|| panic!("unknown resource path {resource_id}"));

        let producers = &mut self.resources.entry_mut(idx).producers;
        debug_assert!(
            producers.len() < MAX_PRODUCERS,
            "producer count for resource {resource_id} exceeded MAX_PRODUCERS"
        );
        producers.push(handle);
    }

    /// Register a wait object signalled exactly once when the frame's last
    /// aggregate submits. The registration clears itself after firing.
    pub fn set_frame_submission_wait_object(&mut self, wait: WaitObject) {
        self.submission_wait = Some(wait);
    }

    /// Close the begin/end block: derive execution order, barriers,
    /// cross-queue fences, and aggregates, and emit one task per aggregate
    /// into `ts`.
    ///
    /// The caller finalizes and enqueues the task set.
    pub fn build(&mut self, ts: &mut TaskSet) {
        debug_assert!(
            self.in_begin_end && !self.in_pre_register,
            "build is only valid in post-register"
        );
        self.in_begin_end = false;

        assert!(!self.nodes.is_empty(), "no render passes were registered");
        profile_scope!("render graph build");

        let mut scratch = std::mem::take(&mut self.scratch);
        {
            let scratch = scratch.activate();
            self.build_edges(scratch);
            self.sort_nodes(scratch);
        }
        scratch.release();
        self.scratch = scratch;

        self.insert_barriers();
        let mut aggregates = self.join_nodes();
        let merged_count = build::merge_small_nodes(&mut aggregates);

        let exec = Arc::new(FrameExecState::new(
            Arc::clone(&self.renderer),
            aggregates,
            merged_count,
            self.submission_wait.take(),
        ));
        submit::emit_tasks(&exec, ts);

        log::debug!(
            "render graph built: {} passes, {} batches, {} aggregates, {} merge chains",
            self.nodes.len(),
            self.num_batches(),
            exec.aggregates.len(),
            merged_count,
        );
        self.exec = Some(exec);

        if log::log_enabled!(log::Level::Trace) {
            self.log_graph();
        }
    }

    /// Get the completion fence of the aggregate containing `handle`'s pass.
    ///
    /// Valid after `build`; fatal for passes folded into a merged command
    /// list. The value is meaningful once the aggregate's task has submitted.
    pub fn completion_fence(&self, handle: PassHandle) -> u64 {
        debug_assert!(
            !self.in_begin_end && !self.in_pre_register,
            "completion_fence inside a begin/end block"
        );
        debug_assert!(handle.index() < self.mapping.len(), "invalid pass handle");

        let sorted = self.mapping[handle.index()] as usize;
        let agg_idx = self.nodes[sorted]
            .aggregate_idx
            .expect("render graph has not been built");
        let exec = self.exec.as_ref().expect("render graph has not been built");

        assert!(
            exec.aggregates[agg_idx].merged_cmdlist_idx.is_none(),
            "completion fences for merged command lists are unsupported"
        );
        exec.fences[agg_idx].load(Ordering::Acquire)
    }

    /// Get the completion fence of the frame's last aggregate.
    pub fn frame_completion_fence(&self) -> u64 {
        debug_assert!(
            !self.in_begin_end && !self.in_pre_register,
            "frame_completion_fence inside a begin/end block"
        );

        let exec = self.exec.as_ref().expect("render graph has not been built");
        exec.fences
            .last()
            .expect("render graph has no aggregates")
            .load(Ordering::Acquire)
    }

    /// Render nodes in execution order. Meaningful after `build`.
    pub fn nodes(&self) -> &[RenderNode] {
        &self.nodes
    }

    /// Tracked state of a resource, if present in the table.
    pub fn resource_state(&self, id: u64) -> Option<ResourceState> {
        self.resources
            .find(id)
            .map(|idx| self.resources.entry(idx).state)
    }

    /// Aggregate nodes in execution order. Empty before `build`.
    pub fn aggregates(&self) -> &[AggregateNode] {
        self.exec
            .as_ref()
            .map(|exec| exec.aggregates.as_slice())
            .unwrap_or(&[])
    }

    /// Execution-order index of a registered pass. Meaningful after `build`.
    pub fn sorted_index(&self, handle: PassHandle) -> usize {
        debug_assert!(handle.index() < self.mapping.len(), "invalid pass handle");
        self.mapping[handle.index()] as usize
    }

    /// Number of batches in the built graph.
    pub fn num_batches(&self) -> usize {
        self.nodes
            .iter()
            .map(|node| node.batch_idx + 1)
            .max()
            .unwrap_or(0) as usize
    }

    /// Dump the built graph to the log, one line per aggregate.
    pub fn log_graph(&self) {
        for (i, agg) in self.aggregates().iter().enumerate() {
            log::trace!(
                "aggregate {i} '{}': batch {}, queue {}, {} barriers, gpu dep {:?}{}{}",
                agg.name,
                agg.batch_idx,
                if agg.is_async_compute { "compute" } else { "graphics" },
                agg.barriers.len(),
                agg.gpu_dep_idx,
                if agg.has_unsupported_barrier { ", unsupported barrier" } else { "" },
                if agg.merged_cmdlist_idx.is_some() { ", merged" } else { "" },
            );
        }
    }
}

impl std::fmt::Debug for RenderGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RenderGraph")
            .field("resources", &self.resources.len())
            .field("passes", &self.nodes.len())
            .field("in_begin_end", &self.in_begin_end)
            .field("in_pre_register", &self.in_pre_register)
            .finish()
    }
}
