//! Graph building: edges, topological sort, barriers, aggregation, merging.
//!
//! Runs single-threaded inside [`RenderGraph::build`]. The stages mutate the
//! node table in place and in order: producer/consumer edges correct the
//! in-degrees, the sort permutes the table into execution order, barrier
//! insertion walks resources in that order, and aggregation folds the nodes
//! into per-batch per-queue groups.

use nightbloom_core::pool::Poolable;

use super::RenderGraph;
use super::node::{AggregateNode, RenderNode};
use super::resource::is_reserved_path;

/// Per-build scratch retained across frames.
#[derive(Debug, Default)]
pub(crate) struct BuildScratch {
    /// For each node (original handle), the nodes consuming its outputs.
    pub adjacency: Vec<Vec<u32>>,
    /// Execution order as original handles; doubles as the sort queue.
    pub sorted: Vec<u32>,
}

impl Poolable for BuildScratch {
    fn new_empty() -> Self {
        Self::default()
    }

    fn reset(&mut self) {
        self.sorted.clear();
        for list in &mut self.adjacency {
            list.clear();
        }
    }
}

impl RenderGraph {
    /// Build dependency edges and correct node in-degrees.
    ///
    /// For each input of node N, every producer P of that input contributes
    /// an edge P → N. A node listing the same resource as both input and
    /// output would form a self-cycle; instead the matching output bit is set
    /// in `output_mask` and the builder transitions only to the input state —
    /// the pass handles any ping-pong transitions internally and restores the
    /// input state before returning.
    pub(crate) fn build_edges(&mut self, scratch: &mut BuildScratch) {
        let nodes = &mut self.nodes;
        let resources = &self.resources;

        while scratch.adjacency.len() < nodes.len() {
            scratch.adjacency.push(Vec::new());
        }

        for node in nodes.iter_mut() {
            node.in_degree = node.inputs.len() as i32;
        }

        for curr in 0..nodes.len() {
            for k in 0..nodes[curr].inputs.len() {
                let input = nodes[curr].inputs[k];
                let res_idx = resources.find(input.resource_id).unwrap_or_else(|| {
                    panic!(
                        "pass '{}' references unknown resource {}",
                        nodes[curr].name, input.resource_id
                    )
                });

                let producers = &resources.entry(res_idx).producers;

                if producers.is_empty() {
                    // Null resource, or produced in a prior frame.
                    nodes[curr].in_degree -= 1;
                    assert!(
                        nodes[curr].in_degree >= 0,
                        "invalid in-degree for pass '{}'",
                        nodes[curr].name
                    );
                } else {
                    // Every producer decrements the dependency counter; the
                    // input itself was already counted once.
                    nodes[curr].in_degree += producers.len() as i32 - 1;
                }

                for producer in producers {
                    let producer = producer.index();
                    if producer == curr {
                        nodes[curr].in_degree -= 1;

                        assert!(
                            !nodes[curr].outputs.is_empty(),
                            "pass '{}' produces a resource it consumes but declares no outputs",
                            nodes[curr].name
                        );
                        for (o, output) in nodes[curr].outputs.iter().enumerate() {
                            if output.resource_id == input.resource_id {
                                nodes[curr].output_mask |= 1 << o;
                                break;
                            }
                        }
                    } else {
                        scratch.adjacency[producer].push(curr as u32);
                    }
                }
            }
        }
    }

    /// Kahn topological sort, longest-path batch assignment, and the stable
    /// reorder of the node table into execution order.
    ///
    /// Fills `mapping[original_handle] = execution index`; producer lists
    /// still refer to original handles afterwards and must be translated
    /// through it.
    pub(crate) fn sort_nodes(&mut self, scratch: &mut BuildScratch) {
        let nodes = &mut self.nodes;
        let adjacency = &scratch.adjacency;
        let sorted = &mut scratch.sorted;
        let count = nodes.len();

        for (i, node) in nodes.iter_mut().enumerate() {
            if node.in_degree == 0 {
                // A frontier node has no dependencies this frame.
                node.batch_idx = 0;
                sorted.push(i as u32);
            }
        }
        assert!(!sorted.is_empty(), "render graph is not a DAG");

        let mut cursor = 0;
        while cursor < sorted.len() {
            let curr = sorted[cursor] as usize;
            for &adjacent in &adjacency[curr] {
                let adjacent = adjacent as usize;
                nodes[adjacent].in_degree -= 1;
                if nodes[adjacent].in_degree == 0 {
                    sorted.push(adjacent as u32);
                }
            }
            cursor += 1;
        }
        assert!(sorted.len() == count, "render graph is not a DAG");

        // Longest path ending at each node, walked in topological order.
        for i in 0..count {
            let curr = sorted[i] as usize;
            for &adjacent in &adjacency[curr] {
                let adjacent = adjacent as usize;
                nodes[adjacent].batch_idx =
                    nodes[adjacent].batch_idx.max(nodes[curr].batch_idx + 1);
            }
        }

        // Stable with respect to the topological order above.
        sorted.sort_by_key(|&handle| nodes[handle as usize].batch_idx);

        // Producer handles were recorded pre-sort; `mapping` translates them
        // into execution order for everything downstream.
        self.mapping.resize(count, 0);
        for (pos, &original) in sorted.iter().enumerate() {
            self.mapping[original as usize] = pos as u32;
        }

        let mut reordered = Vec::with_capacity(count);
        for &original in sorted.iter() {
            reordered.push(std::mem::take(&mut nodes[original as usize]));
        }
        *nodes = reordered;
    }

    /// Insert transition barriers and select cross-queue sync points,
    /// walking nodes in execution order.
    ///
    /// Cross-queue reduction, with numbers meaning execution-order indices:
    ///
    /// Case a — a later sync subsumes earlier syncs on the same path, because
    /// each GPU queue is FIFO. 5 only needs to sync with 4:
    ///
    /// ```text
    ///     queue1      1 ------> 3 ------> 5
    ///                                     |
    ///                 |---------|---------
    ///     queue2      2 ------> 4 ------> 6
    /// ```
    ///
    /// Case b — since 4 has synced with 1, 6 no longer needs to:
    ///
    /// ```text
    ///     queue1      1 ------> 2 ------> 3
    ///                 |------------------
    ///                 |                  |
    ///     queue2      4 ------> 5 ------> 6
    /// ```
    pub(crate) fn insert_barriers(&mut self) {
        let nodes = &mut self.nodes;
        let resources = &mut self.resources;
        let mapping = &self.mapping;

        // Largest execution index on the opposite queue that this queue has
        // already synced with (case b).
        let mut last_synced_direct: Option<usize> = None;
        let mut last_synced_compute: Option<usize> = None;

        for curr in 0..nodes.len() {
            let is_async = nodes[curr].is_async_compute();
            let mut largest_producer: Option<usize> = None;

            // Inputs: transition into the expected state where needed.
            for k in 0..nodes[curr].inputs.len() {
                let input = nodes[curr].inputs[k];
                if is_reserved_path(input.resource_id) {
                    continue;
                }

                let res_idx = resources.find(input.resource_id).unwrap_or_else(|| {
                    panic!("resource {} was not found", input.resource_id)
                });
                let state = resources.entry(res_idx).state;

                if !state.intersects(input.expected_state) {
                    // An unsupported state *after* was rejected at
                    // declaration; only the before-state can force the
                    // barrier onto the graphics queue.
                    nodes[curr].has_unsupported_barrier |=
                        is_async && !state.legal_on_compute();

                    let resource = resources.entry(res_idx).resource.unwrap_or_else(|| {
                        panic!("resource {} has no native handle", input.resource_id)
                    });
                    nodes[curr].barriers.push(super::TransitionBarrier {
                        resource,
                        before: state,
                        after: input.expected_state,
                    });
                    resources.entry_mut(res_idx).state = input.expected_state;
                }

                // Case a: keep only the largest opposite-queue producer.
                for producer in &resources.entry(res_idx).producers {
                    let sorted_idx = mapping[producer.index()] as usize;
                    if nodes[sorted_idx].is_async_compute() != is_async {
                        assert!(
                            nodes[sorted_idx].batch_idx < nodes[curr].batch_idx,
                            "cross-queue producer must precede its consumer"
                        );
                        largest_producer =
                            Some(largest_producer.map_or(sorted_idx, |l| l.max(sorted_idx)));
                    }
                }
            }

            // Case b: skip the fence if an earlier node on this queue already
            // synced at least as far.
            let cursor = if is_async {
                &mut last_synced_direct
            } else {
                &mut last_synced_compute
            };
            if let Some(largest) = largest_producer {
                if cursor.is_none_or(|synced| largest > synced) {
                    *cursor = Some(largest);
                    nodes[curr].gpu_dep_source = Some(largest);
                }
            }

            // Outputs: same transition rules, except for masked (ping-pong)
            // outputs, which get no barrier and no state update.
            for o in 0..nodes[curr].outputs.len() {
                let output = nodes[curr].outputs[o];
                if is_reserved_path(output.resource_id) {
                    continue;
                }
                if nodes[curr].output_mask & (1 << o) != 0 {
                    continue;
                }

                let res_idx = resources.find(output.resource_id).unwrap_or_else(|| {
                    panic!("resource {} was not found", output.resource_id)
                });
                let state = resources.entry(res_idx).state;

                if !state.intersects(output.expected_state) {
                    nodes[curr].has_unsupported_barrier |=
                        is_async && !state.legal_on_compute();

                    let resource = resources.entry(res_idx).resource.unwrap_or_else(|| {
                        panic!("resource {} has no native handle", output.resource_id)
                    });
                    nodes[curr].barriers.push(super::TransitionBarrier {
                        resource,
                        before: state,
                        after: output.expected_state,
                    });
                }
                resources.entry_mut(res_idx).state = output.expected_state;
            }
        }

        // The graph assumes some pass logically transitions the backbuffer;
        // force the tracked state to match.
        let backbuffer = self.renderer.current_backbuffer_id();
        if let Some(idx) = resources.find(backbuffer) {
            resources.entry_mut(idx).state = super::ResourceState::PRESENT;
        }
    }

    /// Fold execution-ordered nodes into per-batch per-queue aggregates.
    ///
    /// On every batch boundary the async-compute bucket flushes first, then
    /// the graphics bucket. A `force_separate` node always becomes its own
    /// singleton aggregate.
    pub(crate) fn join_nodes(&mut self) -> Vec<AggregateNode> {
        let nodes = &mut self.nodes;
        let mut aggregates = Vec::with_capacity(nodes.len());

        let mut curr_batch = 0;
        let mut async_bucket: Vec<usize> = Vec::new();
        let mut graphics_bucket: Vec<usize> = Vec::new();

        for curr in 0..nodes.len() {
            if nodes[curr].batch_idx != curr_batch {
                // Both buckets can be empty here if the previous batch held
                // only force-separate passes.
                if !async_bucket.is_empty() || !graphics_bucket.is_empty() {
                    flush_buckets(nodes, &mut aggregates, &mut async_bucket, &mut graphics_bucket);
                }
                curr_batch = nodes[curr].batch_idx;
            }

            if nodes[curr].force_separate {
                // Earlier same-batch passes aggregate ahead of the isolated
                // one; passes after it start fresh buckets.
                if !async_bucket.is_empty() || !graphics_bucket.is_empty() {
                    flush_buckets(nodes, &mut aggregates, &mut async_bucket, &mut graphics_bucket);
                }

                let agg_idx = aggregates.len();
                let mut agg = AggregateNode::new(nodes[curr].is_async_compute());
                let mapped = mapped_gpu_dep(nodes, curr);
                agg.append(&mut nodes[curr], mapped, true);
                nodes[curr].aggregate_idx = Some(agg_idx);
                aggregates.push(agg);
                continue;
            }

            if nodes[curr].is_async_compute() {
                async_bucket.push(curr);
            } else {
                graphics_bucket.push(curr);
            }
        }

        if !async_bucket.is_empty() || !graphics_bucket.is_empty() {
            flush_buckets(nodes, &mut aggregates, &mut async_bucket, &mut graphics_bucket);
        }

        aggregates
            .last_mut()
            .expect("graph produced no aggregates")
            .is_last = true;
        aggregates
    }
}

/// Translate a node's cross-queue sync source from an execution index to the
/// index of the aggregate it was folded into.
fn mapped_gpu_dep(nodes: &[RenderNode], curr: usize) -> Option<usize> {
    nodes[curr].gpu_dep_source.map(|dep| {
        nodes[dep]
            .aggregate_idx
            .expect("dependency aggregate must precede the dependent node")
    })
}

fn flush_buckets(
    nodes: &mut [RenderNode],
    aggregates: &mut Vec<AggregateNode>,
    async_bucket: &mut Vec<usize>,
    graphics_bucket: &mut Vec<usize>,
) {
    if !async_bucket.is_empty() {
        let agg_idx = aggregates.len();
        let mut agg = AggregateNode::new(true);
        let mut has_fence = false;
        let mut has_unsupported = false;

        for &node_idx in async_bucket.iter() {
            has_fence |= nodes[node_idx].gpu_dep_source.is_some();
            has_unsupported |= nodes[node_idx].has_unsupported_barrier;

            let mapped = mapped_gpu_dep(nodes, node_idx);
            agg.append(&mut nodes[node_idx], mapped, false);
            nodes[node_idx].aggregate_idx = Some(agg_idx);
        }

        // An unsupported barrier makes this aggregate sync with the direct
        // queue immediately before execution, which supersedes any other
        // cross-queue fence.
        if has_fence && has_unsupported {
            agg.gpu_dep_idx = None;
        }
        aggregates.push(agg);
    }

    if !graphics_bucket.is_empty() {
        let agg_idx = aggregates.len();
        let mut agg = AggregateNode::new(false);

        for &node_idx in graphics_bucket.iter() {
            let mapped = mapped_gpu_dep(nodes, node_idx);
            agg.append(&mut nodes[node_idx], mapped, false);
            nodes[node_idx].aggregate_idx = Some(agg_idx);
        }
        aggregates.push(agg);
    }

    async_bucket.clear();
    graphics_bucket.clear();
}

/// Merge consecutive single-pass graphics aggregates onto shared command
/// lists.
///
/// A run of length ≥ 2 becomes a merge chain: the first aggregate acquires
/// the shared list, the last submits it. Runs of length 1 are un-merged.
/// Returns the number of chains, which sizes the shared command-list slots.
pub(crate) fn merge_small_nodes(aggregates: &mut [AggregateNode]) -> usize {
    fn close_run(
        aggregates: &mut [AggregateNode],
        last: usize,
        run_len: usize,
        cmdlist_idx: &mut usize,
    ) {
        if run_len == 1 {
            let prev = &mut aggregates[last];
            assert!(prev.merge_start && prev.merged_cmdlist_idx.is_some(), "bug");
            prev.merge_start = false;
            prev.merged_cmdlist_idx = None;
        } else if run_len > 1 {
            aggregates[last].merge_end = true;
            *cmdlist_idx += 1;
        }
    }

    let mut cmdlist_idx = 0;
    let mut run_len = 0;

    for i in 0..aggregates.len() {
        let node = &aggregates[i];
        if !node.is_async_compute && !node.force_separate && node.len() == 1 {
            let node = &mut aggregates[i];
            node.merge_start = run_len == 0;
            node.merged_cmdlist_idx = Some(cmdlist_idx);
            run_len += 1;
        } else {
            if run_len > 0 {
                close_run(aggregates, i - 1, run_len, &mut cmdlist_idx);
            }
            run_len = 0;
        }
    }
    if run_len > 0 {
        let last = aggregates.len() - 1;
        close_run(aggregates, last, run_len, &mut cmdlist_idx);
    }

    #[cfg(debug_assertions)]
    validate_merge_chains(aggregates);

    cmdlist_idx
}

/// Walk the aggregate sequence verifying merge brackets are properly nested
/// and every chain spans at least two aggregates.
#[cfg(debug_assertions)]
pub(crate) fn validate_merge_chains(aggregates: &[AggregateNode]) {
    let mut in_chain = false;
    let mut chain_len = 0;

    for agg in aggregates {
        if in_chain {
            assert!(!agg.merge_start, "merge chain validation failed");
        } else {
            assert!(!agg.merge_end, "merge chain validation failed");
        }

        if agg.merge_start {
            in_chain = true;
        }
        if in_chain {
            chain_len += 1;
        }
        if agg.merge_end {
            assert!(!agg.merge_start, "merge chain validation failed");
            assert!(chain_len > 1, "merge chain validation failed");
            in_chain = false;
            chain_len = 0;
        }
    }
    assert!(!in_chain, "merge chain validation failed");
}
