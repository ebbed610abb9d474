//! Task emission and the per-aggregate execution protocol.
//!
//! `build` hands each aggregate to the task pool as one task. Task bodies
//! only read the immutable aggregate metadata in [`FrameExecState`]; the
//! sole cross-task writes are each aggregate's completion fence (an atomic)
//! and the shared command-list slots of merge chains, which are handed off
//! strictly sequentially along the chain.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

use nightbloom_core::sync::WaitObject;
use nightbloom_core::task::TaskSet;

use super::node::AggregateNode;
use crate::renderer::{CommandList, Renderer};

/// Sentinel for a completion fence that has not been written yet.
pub(crate) const FENCE_UNSET: u64 = u64::MAX;

/// Everything a frame's tasks need at execution time.
pub(crate) struct FrameExecState {
    pub renderer: Arc<dyn Renderer>,
    pub aggregates: Vec<AggregateNode>,
    /// Completion fence per aggregate, `FENCE_UNSET` until submitted.
    pub fences: Vec<AtomicU64>,
    /// Shared command-list slot per merge chain.
    pub merged_cmdlists: Vec<Mutex<Option<CommandList>>>,
    /// Signalled once when the last aggregate submits.
    pub submission_wait: Mutex<Option<WaitObject>>,
}

impl FrameExecState {
    pub fn new(
        renderer: Arc<dyn Renderer>,
        aggregates: Vec<AggregateNode>,
        merged_cmdlist_count: usize,
        submission_wait: Option<WaitObject>,
    ) -> Self {
        let fences = (0..aggregates.len())
            .map(|_| AtomicU64::new(FENCE_UNSET))
            .collect();
        let merged_cmdlists = (0..merged_cmdlist_count)
            .map(|_| Mutex::new(None))
            .collect();

        Self {
            renderer,
            aggregates,
            fences,
            merged_cmdlists,
            submission_wait: Mutex::new(submission_wait),
        }
    }
}

/// Emit one task per aggregate into `ts` and wire the task-graph edges.
///
/// Edges: every batch-b aggregate precedes every batch-(b+1) aggregate, and
/// a `force_separate` aggregate additionally waits on every earlier
/// aggregate of its own batch. Aggregates are batch-monotonic, so the
/// forward scan stops at the first batch beyond b+1.
pub(crate) fn emit_tasks(state: &Arc<FrameExecState>, ts: &mut TaskSet) {
    let count = state.aggregates.len();
    let mut handles = Vec::with_capacity(count);

    for i in 0..count {
        let state = Arc::clone(state);
        let name = state.aggregates[i].name.clone();
        handles.push(ts.emplace_task(name, move || execute_aggregate(&state, i)));
    }

    for i in 0..count.saturating_sub(1) {
        let curr_batch = state.aggregates[i].batch_idx;

        for j in (i + 1)..count {
            let next_batch = state.aggregates[j].batch_idx;

            if next_batch > curr_batch + 1 {
                break;
            }
            if next_batch == curr_batch + 1 {
                ts.add_outgoing_edge(handles[i], handles[j]);
            }
            if next_batch == curr_batch && state.aggregates[j].force_separate {
                ts.add_outgoing_edge(handles[i], handles[j]);
            }
        }
    }
}

/// Task body: record and submit one aggregate.
fn execute_aggregate(state: &FrameExecState, idx: usize) {
    let aggregate = &state.aggregates[idx];
    let renderer = &*state.renderer;

    // Acquire a command list: the head of a merge chain creates the shared
    // list, later chain members take it from the slot, everything else gets
    // a fresh list for its queue.
    let mut list = if aggregate.merge_start {
        renderer.acquire_graphics_cmdlist()
    } else if let Some(slot) = aggregate.merged_cmdlist_idx {
        state.merged_cmdlists[slot]
            .lock()
            .take()
            .expect("merged command list should have been published by the chain head")
    } else if aggregate.is_async_compute {
        renderer.acquire_compute_cmdlist()
    } else {
        renderer.acquire_graphics_cmdlist()
    };

    if cfg!(debug_assertions) {
        renderer.set_cmdlist_name(&mut list, &aggregate.name);
    }

    if aggregate.has_unsupported_barrier {
        // The barriers are illegal on the compute queue: record them on a
        // separate graphics list, submit it, and stall the compute queue on
        // its fence before this aggregate's own work runs.
        let mut barrier_list = renderer.acquire_graphics_cmdlist();
        if cfg!(debug_assertions) {
            renderer.set_cmdlist_name(&mut barrier_list, "barrier");
        }
        renderer.record_barriers(&mut barrier_list, &aggregate.barriers);
        let fence = renderer.submit_cmdlist(barrier_list);

        renderer.wait_direct_on_compute(fence);
    } else if !aggregate.barriers.is_empty() {
        renderer.record_barriers(&mut list, &aggregate.barriers);
    }

    for callback in &aggregate.callbacks {
        callback(&mut list);
    }

    // Cross-queue fence against the dependency aggregate. Skipped when an
    // unsupported-barrier submission above already synced the queues.
    if !aggregate.has_unsupported_barrier {
        if let Some(dep) = aggregate.gpu_dep_idx {
            let fence = state.fences[dep].load(Ordering::Acquire);
            assert!(
                fence != FENCE_UNSET,
                "dependency aggregate has not submitted yet"
            );

            if aggregate.is_async_compute {
                renderer.wait_direct_on_compute(fence);
            } else {
                renderer.wait_compute_on_direct(fence);
            }
        }
    }

    if aggregate.is_last {
        renderer.end_gpu_frame_query(&mut list);
    }

    if aggregate.merged_cmdlist_idx.is_none() || aggregate.merge_end {
        let fence = renderer.submit_cmdlist(list);
        state.fences[idx].store(fence, Ordering::Release);

        if aggregate.merge_end {
            // The whole chain completes with this submission; propagate the
            // fence back to the earlier members.
            let chain = aggregate.merged_cmdlist_idx;
            for j in (0..idx).rev() {
                if state.aggregates[j].merged_cmdlist_idx != chain {
                    break;
                }
                state.fences[j].store(fence, Ordering::Release);
            }
        }
    } else {
        // Mid-chain: hand the shared list to the next chain member.
        let slot = aggregate
            .merged_cmdlist_idx
            .expect("unsubmitted aggregate must be part of a merge chain");
        let _previous = state.merged_cmdlists[slot].lock().replace(list);
        debug_assert!(
            _previous.is_none(),
            "merged command-list slot was not drained"
        );
    }

    if aggregate.is_last {
        if let Some(wait) = state.submission_wait.lock().take() {
            wait.notify();
        }
    }
}
