//! Render nodes and aggregate nodes.
//!
//! A [`RenderNode`] is one registered pass: its queue, callback, declared
//! dependencies, and everything the builder computes for it. After building,
//! same-batch same-queue nodes are grouped into [`AggregateNode`]s, each of
//! which records onto a single command list.

use crate::renderer::CommandList;

use super::resource::{Dependency, GpuResource, ResourceState};

/// Maximum number of passes per frame.
pub const MAX_RENDER_PASSES: usize = 64;

/// Which GPU queue a pass records for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PassType {
    /// The direct (graphics) queue.
    Graphics,
    /// The asynchronous compute queue.
    AsyncCompute,
}

/// Handle to a registered pass.
///
/// The handle is the pass's pre-sort index and stays valid for the whole
/// frame, across the builder's reordering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PassHandle(pub(crate) u32);

impl PassHandle {
    pub(crate) fn new(index: u32) -> Self {
        Self(index)
    }

    pub(crate) fn index(self) -> usize {
        self.0 as usize
    }
}

/// A resource state transition recorded between passes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransitionBarrier {
    /// The native resource being transitioned.
    pub resource: GpuResource,
    /// State the resource is currently in.
    pub before: ResourceState,
    /// State the resource transitions to.
    pub after: ResourceState,
}

/// Pass record callback, invoked with the command list to record into.
pub type RecordFn = Box<dyn Fn(&mut CommandList) + Send + Sync>;

/// One registered pass and everything the builder derives for it.
pub struct RenderNode {
    /// Display name.
    pub name: String,
    /// Queue the pass records for.
    pub pass_type: PassType,
    /// Record callback; taken when the node is folded into an aggregate.
    pub(crate) record: Option<RecordFn>,
    /// The pass must record onto its own command list.
    pub force_separate: bool,
    /// Declared inputs.
    pub inputs: Vec<Dependency>,
    /// Declared outputs.
    pub outputs: Vec<Dependency>,

    // Derived by the builder:
    /// Number of unsatisfied dependencies during the topological sort.
    pub(crate) in_degree: i32,
    /// Length of the longest dependency path ending at this node.
    pub batch_idx: i32,
    /// Barriers recorded before the pass callback runs.
    pub barriers: Vec<TransitionBarrier>,
    /// Sorted index of the opposite-queue producer to fence against.
    pub(crate) gpu_dep_source: Option<usize>,
    /// Bits marking outputs whose resource is also an input of this node;
    /// such outputs get no barrier and no state update.
    pub(crate) output_mask: u32,
    /// Index of the aggregate this node was folded into.
    pub(crate) aggregate_idx: Option<usize>,
    /// A barrier in this node's list must execute on the graphics queue.
    pub has_unsupported_barrier: bool,
}

impl Default for RenderNode {
    /// An empty slot, used when permuting the node table.
    fn default() -> Self {
        Self {
            name: String::new(),
            pass_type: PassType::Graphics,
            record: None,
            force_separate: false,
            inputs: Vec::new(),
            outputs: Vec::new(),
            in_degree: 0,
            batch_idx: -1,
            barriers: Vec::new(),
            gpu_dep_source: None,
            output_mask: 0,
            aggregate_idx: None,
            has_unsupported_barrier: false,
        }
    }
}

impl RenderNode {
    pub(crate) fn new(
        name: String,
        pass_type: PassType,
        record: RecordFn,
        force_separate: bool,
    ) -> Self {
        Self {
            name,
            pass_type,
            record: Some(record),
            force_separate,
            inputs: Vec::new(),
            outputs: Vec::new(),
            in_degree: 0,
            batch_idx: -1,
            barriers: Vec::new(),
            gpu_dep_source: None,
            output_mask: 0,
            aggregate_idx: None,
            has_unsupported_barrier: false,
        }
    }

    /// Check if the pass runs on the async-compute queue.
    pub fn is_async_compute(&self) -> bool {
        self.pass_type == PassType::AsyncCompute
    }
}

impl std::fmt::Debug for RenderNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RenderNode")
            .field("name", &self.name)
            .field("pass_type", &self.pass_type)
            .field("force_separate", &self.force_separate)
            .field("batch_idx", &self.batch_idx)
            .field("barriers", &self.barriers.len())
            .field("gpu_dep_source", &self.gpu_dep_source)
            .field("has_unsupported_barrier", &self.has_unsupported_barrier)
            .finish()
    }
}

/// A group of same-batch same-queue render nodes recorded on one command
/// list.
pub struct AggregateNode {
    /// Concatenated names of the member passes.
    pub name: String,
    /// Batch index shared by every member.
    pub batch_idx: i32,
    /// The aggregate records on the async-compute queue.
    pub is_async_compute: bool,
    /// Singleton aggregate isolated from same-batch aggregation.
    pub force_separate: bool,
    /// Concatenated barriers of the member passes.
    pub barriers: Vec<TransitionBarrier>,
    /// Member record callbacks, in execution order.
    pub(crate) callbacks: Vec<RecordFn>,
    /// Aggregate this one must fence against on the opposite queue.
    pub gpu_dep_idx: Option<usize>,
    /// Barriers must be pre-submitted on the graphics queue.
    pub has_unsupported_barrier: bool,
    /// First aggregate of a merged command-list chain.
    pub merge_start: bool,
    /// Last aggregate of a merged command-list chain.
    pub merge_end: bool,
    /// Shared command-list slot for the merge chain this aggregate is in.
    pub merged_cmdlist_idx: Option<usize>,
    /// Final aggregate of the frame.
    pub is_last: bool,
}

impl AggregateNode {
    pub(crate) fn new(is_async_compute: bool) -> Self {
        Self {
            name: String::new(),
            batch_idx: -1,
            is_async_compute,
            force_separate: false,
            barriers: Vec::new(),
            callbacks: Vec::new(),
            gpu_dep_idx: None,
            has_unsupported_barrier: false,
            merge_start: false,
            merge_end: false,
            merged_cmdlist_idx: None,
            is_last: false,
        }
    }

    /// Fold a render node into this aggregate.
    ///
    /// `mapped_gpu_dep` is the node's cross-queue dependency translated to an
    /// aggregate index; the aggregate keeps the maximum over its members.
    pub(crate) fn append(
        &mut self,
        node: &mut RenderNode,
        mapped_gpu_dep: Option<usize>,
        force_separate: bool,
    ) {
        assert_eq!(
            self.is_async_compute,
            node.is_async_compute(),
            "all nodes in an aggregate must share a queue type"
        );
        assert!(
            self.callbacks.is_empty() || node.batch_idx == self.batch_idx,
            "all nodes in an aggregate must share a batch index"
        );
        assert!(
            !force_separate || self.callbacks.is_empty(),
            "force-separate aggregates hold exactly one pass"
        );
        assert!(
            !node.has_unsupported_barrier || node.is_async_compute(),
            "unsupported barriers only arise on async-compute nodes"
        );

        self.barriers.append(&mut node.barriers);
        self.callbacks
            .push(node.record.take().expect("node already consumed"));
        self.batch_idx = node.batch_idx;
        self.force_separate = force_separate;
        self.gpu_dep_idx = match (self.gpu_dep_idx, mapped_gpu_dep) {
            (a, None) => a,
            (None, b) => b,
            (Some(a), Some(b)) => Some(a.max(b)),
        };
        self.has_unsupported_barrier |= node.has_unsupported_barrier;

        if !self.name.is_empty() {
            self.name.push('_');
        }
        self.name.push_str(&node.name);
    }

    /// Number of member passes.
    pub fn len(&self) -> usize {
        self.callbacks.len()
    }

    /// Check whether the aggregate has no members yet.
    pub fn is_empty(&self) -> bool {
        self.callbacks.is_empty()
    }
}

impl std::fmt::Debug for AggregateNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AggregateNode")
            .field("name", &self.name)
            .field("batch_idx", &self.batch_idx)
            .field("is_async_compute", &self.is_async_compute)
            .field("force_separate", &self.force_separate)
            .field("passes", &self.callbacks.len())
            .field("barriers", &self.barriers.len())
            .field("gpu_dep_idx", &self.gpu_dep_idx)
            .field("has_unsupported_barrier", &self.has_unsupported_barrier)
            .field("merge_start", &self.merge_start)
            .field("merge_end", &self.merge_end)
            .field("merged_cmdlist_idx", &self.merged_cmdlist_idx)
            .field("is_last", &self.is_last)
            .finish()
    }
}
