//! End-to-end render graph tests against a mock renderer.
//!
//! The mock records every façade call, so the tests can assert both the
//! built graph structure (batches, barriers, fences, merge chains) and the
//! runtime protocol (what gets recorded and submitted, in what order).

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;

use parking_lot::Mutex;
use rstest::rstest;

use nightbloom_core::sync::WaitObject;
use nightbloom_core::task::TaskSet;
use nightbloom_core::task_pool::{TaskPool, ThreadPriority};
use nightbloom_graphics::{
    CommandList, GpuResource, PassHandle, PassType, RenderGraph, Renderer, ResourceState,
    TransitionBarrier,
};

// ---------------------------------------------------------------------------
// Mock renderer
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
enum Event {
    AcquireGraphics(u64),
    AcquireCompute(u64),
    Barriers(u64, Vec<TransitionBarrier>),
    Submit(u64, u64),
    WaitDirectOnCompute(u64),
    WaitComputeOnDirect(u64),
    EndFrameQuery(u64),
}

#[derive(Debug)]
struct MockRenderer {
    next_list: AtomicU64,
    next_fence: AtomicU64,
    backbuffer: u64,
    events: Mutex<Vec<Event>>,
}

impl MockRenderer {
    fn new(backbuffer: u64) -> Self {
        Self {
            next_list: AtomicU64::new(0),
            next_fence: AtomicU64::new(1),
            backbuffer,
            events: Mutex::new(Vec::new()),
        }
    }

    fn events(&self) -> Vec<Event> {
        self.events.lock().clone()
    }

    fn submits(&self) -> Vec<(u64, u64)> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                Event::Submit(list, fence) => Some((list, fence)),
                _ => None,
            })
            .collect()
    }

    fn push(&self, event: Event) {
        self.events.lock().push(event);
    }
}

impl Renderer for MockRenderer {
    fn acquire_graphics_cmdlist(&self) -> CommandList {
        let id = self.next_list.fetch_add(1, Ordering::Relaxed);
        self.push(Event::AcquireGraphics(id));
        CommandList::new(id, false)
    }

    fn acquire_compute_cmdlist(&self) -> CommandList {
        let id = self.next_list.fetch_add(1, Ordering::Relaxed);
        self.push(Event::AcquireCompute(id));
        CommandList::new(id, true)
    }

    fn record_barriers(&self, list: &mut CommandList, barriers: &[TransitionBarrier]) {
        self.push(Event::Barriers(list.id(), barriers.to_vec()));
    }

    fn submit_cmdlist(&self, list: CommandList) -> u64 {
        let fence = self.next_fence.fetch_add(1, Ordering::Relaxed);
        self.push(Event::Submit(list.id(), fence));
        fence
    }

    fn wait_direct_on_compute(&self, fence: u64) {
        self.push(Event::WaitDirectOnCompute(fence));
    }

    fn wait_compute_on_direct(&self, fence: u64) {
        self.push(Event::WaitComputeOnDirect(fence));
    }

    fn current_backbuffer_id(&self) -> u64 {
        self.backbuffer
    }

    fn end_gpu_frame_query(&self, list: &mut CommandList) {
        self.push(Event::EndFrameQuery(list.id()));
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

const BACKBUFFER_ID: u64 = 9000;

fn harness() -> (Arc<MockRenderer>, RenderGraph) {
    let mock = Arc::new(MockRenderer::new(BACKBUFFER_ID));
    let graph = RenderGraph::new(mock.clone());
    (mock, graph)
}

fn make_pool(workers: usize) -> TaskPool {
    let pool = TaskPool::init(workers, workers + 1, "graph_test", ThreadPriority::Normal);
    let mut ids = pool.worker_thread_ids().to_vec();
    ids.push(thread::current().id());
    pool.start(&ids);
    pool
}

/// Build the declared frame and run it to completion on a worker pool.
fn run_frame(graph: &mut RenderGraph, pool: &TaskPool) {
    let mut ts = TaskSet::new();
    graph.build(&mut ts);
    ts.finalize(pool.signals());
    pool.enqueue_set(ts);
    while !pool.try_flush() {}
}

/// Shorthand for a callback that logs (tag, command list id).
fn record_into(log: &Arc<Mutex<Vec<(&'static str, u64)>>>, tag: &'static str) -> impl Fn(&mut CommandList) + Send + Sync + use<> {
    let log = Arc::clone(log);
    move |list| log.lock().push((tag, list.id()))
}

fn barrier(resource: u64, before: ResourceState, after: ResourceState) -> TransitionBarrier {
    TransitionBarrier {
        resource: GpuResource(resource),
        before,
        after,
    }
}

// ---------------------------------------------------------------------------
// S1: linear chain on the graphics queue
// ---------------------------------------------------------------------------

#[test]
fn linear_chain_batches_and_barriers() {
    let (mock, mut graph) = harness();
    let log = Arc::new(Mutex::new(Vec::new()));

    graph.begin_frame();
    graph.register_resource(Some(GpuResource(0x100)), 100, ResourceState::RENDER_TARGET, false);
    let a = graph.register_pass("a", PassType::Graphics, record_into(&log, "a"), false);
    let b = graph.register_pass("b", PassType::Graphics, record_into(&log, "b"), false);
    graph.move_to_post_register();

    graph.add_output(a, 100, ResourceState::UNORDERED_ACCESS);
    graph.add_input(b, 100, ResourceState::NON_PIXEL_SHADER_RESOURCE);

    let pool = make_pool(2);
    run_frame(&mut graph, &pool);

    // Two batches, a before b.
    assert_eq!(graph.num_batches(), 2);
    assert_eq!(graph.sorted_index(a), 0);
    assert_eq!(graph.sorted_index(b), 1);
    assert_eq!(graph.nodes()[0].batch_idx, 0);
    assert_eq!(graph.nodes()[1].batch_idx, 1);

    // One transition per pass, no cross-queue fences. Barriers move into
    // the aggregates at join time.
    assert_eq!(
        graph.aggregates()[0].barriers,
        vec![barrier(0x100, ResourceState::RENDER_TARGET, ResourceState::UNORDERED_ACCESS)]
    );
    assert_eq!(
        graph.aggregates()[1].barriers,
        vec![barrier(
            0x100,
            ResourceState::UNORDERED_ACCESS,
            ResourceState::NON_PIXEL_SHADER_RESOURCE
        )]
    );
    assert!(graph.aggregates().iter().all(|agg| agg.gpu_dep_idx.is_none()));

    // Two consecutive single-pass graphics aggregates merge onto one list.
    let submits = mock.submits();
    assert_eq!(submits.len(), 1);
    let list = submits[0].0;
    assert_eq!(*log.lock(), vec![("a", list), ("b", list)]);
}

// ---------------------------------------------------------------------------
// S2: transitive cross-queue sync elimination
// ---------------------------------------------------------------------------

#[test]
fn cross_queue_sync_is_transitive() {
    let (_mock, mut graph) = harness();
    let log = Arc::new(Mutex::new(Vec::new()));

    // Graphics chain a -> b -> c and compute chain x -> y -> z, with
    // cross-queue inputs a -> x, b -> y, c -> z.
    let ra = 100;
    let rb = 101;
    let rc = 102;

    graph.begin_frame();
    for id in [ra, rb, rc] {
        graph.register_resource(Some(GpuResource(id)), id, ResourceState::COMMON, false);
    }
    // Dummy resources carry the intra-queue ordering.
    for id in 1..5u64 {
        graph.register_resource(None, id, ResourceState::COMMON, false);
    }

    let a = graph.register_pass("a", PassType::Graphics, record_into(&log, "a"), false);
    let b = graph.register_pass("b", PassType::Graphics, record_into(&log, "b"), false);
    let c = graph.register_pass("c", PassType::Graphics, record_into(&log, "c"), false);
    let x = graph.register_pass("x", PassType::AsyncCompute, record_into(&log, "x"), false);
    let y = graph.register_pass("y", PassType::AsyncCompute, record_into(&log, "y"), false);
    let z = graph.register_pass("z", PassType::AsyncCompute, record_into(&log, "z"), false);
    graph.move_to_post_register();

    let chain = |graph: &mut RenderGraph, from: PassHandle, to: PassHandle, dummy: u64| {
        graph.add_output(from, dummy, ResourceState::UNORDERED_ACCESS);
        graph.add_input(to, dummy, ResourceState::NON_PIXEL_SHADER_RESOURCE);
    };
    chain(&mut graph, a, b, 1);
    chain(&mut graph, b, c, 2);
    chain(&mut graph, x, y, 3);
    chain(&mut graph, y, z, 4);

    graph.add_output(a, ra, ResourceState::UNORDERED_ACCESS);
    graph.add_input(x, ra, ResourceState::NON_PIXEL_SHADER_RESOURCE);
    graph.add_output(b, rb, ResourceState::UNORDERED_ACCESS);
    graph.add_input(y, rb, ResourceState::NON_PIXEL_SHADER_RESOURCE);
    graph.add_output(c, rc, ResourceState::UNORDERED_ACCESS);
    graph.add_input(z, rc, ResourceState::NON_PIXEL_SHADER_RESOURCE);

    let pool = make_pool(3);
    run_frame(&mut graph, &pool);

    // Expected aggregate order: [a], [x], [b], [y], [c], [z].
    let names: Vec<_> = graph.aggregates().iter().map(|agg| agg.name.as_str()).collect();
    assert_eq!(names, vec!["a", "x", "b", "y", "c", "z"]);

    let dep_name = |i: usize| {
        graph.aggregates()[i]
            .gpu_dep_idx
            .map(|d| graph.aggregates()[d].name.as_str())
    };

    // x waits on a; y waits on b (not a); z waits on c (not a or b).
    assert_eq!(dep_name(1), Some("a"));
    assert_eq!(dep_name(3), Some("b"));
    assert_eq!(dep_name(5), Some("c"));

    // The graphics chain itself never fences.
    assert_eq!(dep_name(0), None);
    assert_eq!(dep_name(2), None);
    assert_eq!(dep_name(4), None);
}

// ---------------------------------------------------------------------------
// S3: unsupported barrier on the compute queue
// ---------------------------------------------------------------------------

#[test]
fn unsupported_barrier_pre_submits_on_graphics_queue() {
    let (mock, mut graph) = harness();
    let log = Arc::new(Mutex::new(Vec::new()));

    graph.begin_frame();
    graph.register_resource(
        Some(GpuResource(0x200)),
        200,
        ResourceState::PIXEL_SHADER_RESOURCE,
        false,
    );
    let c = graph.register_pass("c", PassType::AsyncCompute, record_into(&log, "c"), false);
    graph.move_to_post_register();

    graph.add_input(c, 200, ResourceState::UNORDERED_ACCESS);

    let pool = make_pool(2);
    run_frame(&mut graph, &pool);

    assert!(graph.nodes()[0].has_unsupported_barrier);
    assert!(graph.aggregates()[0].has_unsupported_barrier);

    // Protocol: acquire compute list, then a separate graphics list carrying
    // the barrier, submit it, and stall the compute queue on its fence
    // before the pass records.
    let events = mock.events();
    let expected_barrier = barrier(
        0x200,
        ResourceState::PIXEL_SHADER_RESOURCE,
        ResourceState::UNORDERED_ACCESS,
    );
    assert_eq!(
        events,
        vec![
            Event::AcquireCompute(0),
            Event::AcquireGraphics(1),
            Event::Barriers(1, vec![expected_barrier]),
            Event::Submit(1, 1),
            Event::WaitDirectOnCompute(1),
            Event::EndFrameQuery(0),
            Event::Submit(0, 2),
        ]
    );
    assert_eq!(*log.lock(), vec![("c", 0)]);
}

// ---------------------------------------------------------------------------
// S4: ping-pong input/output on one pass
// ---------------------------------------------------------------------------

#[test]
fn ping_pong_resource_gets_single_entry_barrier() {
    let (_mock, mut graph) = harness();
    let log = Arc::new(Mutex::new(Vec::new()));

    graph.begin_frame();
    graph.register_resource(Some(GpuResource(0x300)), 300, ResourceState::RENDER_TARGET, false);
    let p = graph.register_pass("p", PassType::Graphics, record_into(&log, "p"), false);
    graph.move_to_post_register();

    graph.add_input(p, 300, ResourceState::UNORDERED_ACCESS);
    graph.add_output(p, 300, ResourceState::UNORDERED_ACCESS);

    let pool = make_pool(2);
    run_frame(&mut graph, &pool);

    // The self-edge is eliminated: p is a frontier node.
    assert_eq!(graph.nodes()[0].batch_idx, 0);

    // Exactly one entry barrier, no output barrier, and the tracked state is
    // the input state.
    assert_eq!(
        graph.aggregates()[0].barriers,
        vec![barrier(0x300, ResourceState::RENDER_TARGET, ResourceState::UNORDERED_ACCESS)]
    );
    assert_eq!(graph.resource_state(300), Some(ResourceState::UNORDERED_ACCESS));
}

// ---------------------------------------------------------------------------
// S5: merge chain of small graphics aggregates
// ---------------------------------------------------------------------------

#[test]
fn merge_chain_shares_one_command_list() {
    let (mock, mut graph) = harness();
    let log = Arc::new(Mutex::new(Vec::new()));

    graph.begin_frame();
    for id in 1..3u64 {
        graph.register_resource(None, id, ResourceState::COMMON, false);
    }
    let a = graph.register_pass("a", PassType::Graphics, record_into(&log, "a"), false);
    let b = graph.register_pass("b", PassType::Graphics, record_into(&log, "b"), false);
    let c = graph.register_pass("c", PassType::Graphics, record_into(&log, "c"), false);
    graph.move_to_post_register();

    graph.add_output(a, 1, ResourceState::UNORDERED_ACCESS);
    graph.add_input(b, 1, ResourceState::NON_PIXEL_SHADER_RESOURCE);
    graph.add_output(b, 2, ResourceState::UNORDERED_ACCESS);
    graph.add_input(c, 2, ResourceState::NON_PIXEL_SHADER_RESOURCE);

    let pool = make_pool(2);
    run_frame(&mut graph, &pool);

    let aggs = graph.aggregates();
    assert_eq!(aggs.len(), 3);
    assert!(aggs[0].merge_start && !aggs[0].merge_end);
    assert!(!aggs[1].merge_start && !aggs[1].merge_end);
    assert!(!aggs[2].merge_start && aggs[2].merge_end);
    assert!(aggs.iter().all(|agg| agg.merged_cmdlist_idx == Some(0)));

    // One list acquired, one submission, all passes recorded on it in order.
    let submits = mock.submits();
    assert_eq!(submits.len(), 1);
    let (list, fence) = submits[0];
    assert_eq!(*log.lock(), vec![("a", list), ("b", list), ("c", list)]);

    // The chain's submit fence is the frame completion fence.
    assert_eq!(graph.frame_completion_fence(), fence);
}

#[test]
#[should_panic(expected = "merged command lists")]
fn completion_fence_rejected_for_merged_chain() {
    let (_mock, mut graph) = harness();

    graph.begin_frame();
    graph.register_resource(None, 1, ResourceState::COMMON, false);
    let a = graph.register_pass("a", PassType::Graphics, |_| {}, false);
    let b = graph.register_pass("b", PassType::Graphics, |_| {}, false);
    graph.move_to_post_register();

    graph.add_output(a, 1, ResourceState::UNORDERED_ACCESS);
    graph.add_input(b, 1, ResourceState::NON_PIXEL_SHADER_RESOURCE);

    let pool = make_pool(2);
    run_frame(&mut graph, &pool);

    let _ = graph.completion_fence(a);
}

// ---------------------------------------------------------------------------
// S6: force-separate within a batch
// ---------------------------------------------------------------------------

#[test]
fn force_separate_isolates_within_batch() {
    let (mock, mut graph) = harness();
    let log = Arc::new(Mutex::new(Vec::new()));

    graph.begin_frame();
    graph.register_resource(Some(GpuResource(0x400)), 400, ResourceState::COMMON, false);
    graph.register_resource(Some(GpuResource(0x401)), 401, ResourceState::COMMON, false);
    let a = graph.register_pass("a", PassType::Graphics, record_into(&log, "a"), false);
    let b = graph.register_pass("b", PassType::Graphics, record_into(&log, "b"), true);
    graph.move_to_post_register();

    graph.add_output(a, 400, ResourceState::UNORDERED_ACCESS);
    graph.add_output(b, 401, ResourceState::UNORDERED_ACCESS);

    let mut ts = TaskSet::new();
    graph.build(&mut ts);

    // Same batch, aggregate order a then b, b isolated.
    let aggs = graph.aggregates();
    assert_eq!(aggs.len(), 2);
    assert_eq!(aggs[0].name, "a");
    assert_eq!(aggs[1].name, "b");
    assert_eq!(aggs[0].batch_idx, aggs[1].batch_idx);
    assert!(!aggs[0].force_separate);
    assert!(aggs[1].force_separate);

    // The only task edge is the same-batch edge into the isolated task.
    assert_eq!(ts.edge_count(), 1);

    let pool = make_pool(2);
    ts.finalize(pool.signals());
    pool.enqueue_set(ts);
    while !pool.try_flush() {}

    // The edge orders submission: a's submit precedes b's.
    let submits = mock.submits();
    assert_eq!(submits.len(), 2);
    let log = log.lock();
    assert_eq!(log[0].0, "a");
    assert_eq!(log[1].0, "b");
    // Separate command lists.
    assert_ne!(log[0].1, log[1].1);
    drop(log);

    assert_eq!(graph.completion_fence(a), submits[0].1);
    assert_eq!(graph.completion_fence(b), submits[1].1);
}

// ---------------------------------------------------------------------------
// Same-batch aggregation and fan-in
// ---------------------------------------------------------------------------

#[test]
fn same_batch_same_queue_nodes_aggregate() {
    let (mock, mut graph) = harness();
    let log = Arc::new(Mutex::new(Vec::new()));

    graph.begin_frame();
    graph.register_resource(Some(GpuResource(0x500)), 500, ResourceState::COMMON, false);
    graph.register_resource(Some(GpuResource(0x501)), 501, ResourceState::COMMON, false);
    let a = graph.register_pass("a", PassType::Graphics, record_into(&log, "a"), false);
    let b = graph.register_pass("b", PassType::Graphics, record_into(&log, "b"), false);
    let join = graph.register_pass("join", PassType::Graphics, record_into(&log, "join"), false);
    graph.move_to_post_register();

    graph.add_output(a, 500, ResourceState::UNORDERED_ACCESS);
    graph.add_output(b, 501, ResourceState::UNORDERED_ACCESS);
    graph.add_input(join, 500, ResourceState::NON_PIXEL_SHADER_RESOURCE);
    graph.add_input(join, 501, ResourceState::NON_PIXEL_SHADER_RESOURCE);

    let pool = make_pool(2);
    run_frame(&mut graph, &pool);

    // a and b are independent: one aggregate with both, then the join.
    let aggs = graph.aggregates();
    assert_eq!(aggs.len(), 2);
    assert_eq!(aggs[0].name, "a_b");
    assert_eq!(aggs[0].len(), 2);
    assert_eq!(aggs[1].name, "join");
    assert_eq!(aggs[1].batch_idx, 1);

    // The join carries both transitions on one list.
    assert_eq!(aggs[1].barriers.len(), 2);
    assert_eq!(mock.submits().len(), 2);
}

#[test]
fn multi_producer_fan_in_corrects_in_degree() {
    let (_mock, mut graph) = harness();

    graph.begin_frame();
    graph.register_resource(Some(GpuResource(0x600)), 600, ResourceState::COMMON, false);
    let p0 = graph.register_pass("p0", PassType::Graphics, |_| {}, false);
    let p1 = graph.register_pass("p1", PassType::Graphics, |_| {}, false);
    let consumer = graph.register_pass("consumer", PassType::Graphics, |_| {}, false);
    graph.move_to_post_register();

    // Both passes produce the same resource; the consumer must wait for both.
    graph.add_output(p0, 600, ResourceState::UNORDERED_ACCESS);
    graph.add_output(p1, 600, ResourceState::UNORDERED_ACCESS);
    graph.add_input(consumer, 600, ResourceState::NON_PIXEL_SHADER_RESOURCE);

    let mut ts = TaskSet::new();
    graph.build(&mut ts);

    assert_eq!(graph.num_batches(), 2);
    assert_eq!(graph.sorted_index(consumer), 2);
    assert_eq!(graph.nodes()[2].batch_idx, 1);
}

// ---------------------------------------------------------------------------
// Boundary behaviors
// ---------------------------------------------------------------------------

#[test]
fn input_without_producers_needs_no_barrier_or_wait() {
    let (_mock, mut graph) = harness();

    graph.begin_frame();
    // Carried over from a "previous frame": already in the expected state.
    graph.register_resource(
        Some(GpuResource(0x700)),
        700,
        ResourceState::NON_PIXEL_SHADER_RESOURCE,
        false,
    );
    let p = graph.register_pass("p", PassType::Graphics, |_| {}, false);
    graph.move_to_post_register();

    graph.add_input(p, 700, ResourceState::NON_PIXEL_SHADER_RESOURCE);

    let mut ts = TaskSet::new();
    graph.build(&mut ts);

    assert_eq!(graph.nodes()[0].batch_idx, 0);
    assert!(graph.nodes()[0].barriers.is_empty());
    assert!(graph.aggregates()[0].gpu_dep_idx.is_none());
}

#[test]
fn backbuffer_state_is_forced_to_present() {
    let (_mock, mut graph) = harness();

    graph.begin_frame();
    graph.register_resource(
        Some(GpuResource(0x900)),
        BACKBUFFER_ID,
        ResourceState::COMMON,
        true,
    );
    let p = graph.register_pass("p", PassType::Graphics, |_| {}, false);
    graph.move_to_post_register();

    graph.add_output(p, BACKBUFFER_ID, ResourceState::RENDER_TARGET);

    let mut ts = TaskSet::new();
    graph.build(&mut ts);

    assert_eq!(graph.resource_state(BACKBUFFER_ID), Some(ResourceState::PRESENT));
}

#[test]
fn mapping_is_a_permutation() {
    let (_mock, mut graph) = harness();

    // Diamond: top -> {left, right} -> bottom.
    graph.begin_frame();
    for id in [100u64, 101, 102, 103] {
        graph.register_resource(Some(GpuResource(id)), id, ResourceState::COMMON, false);
    }
    let top = graph.register_pass("top", PassType::Graphics, |_| {}, false);
    let left = graph.register_pass("left", PassType::Graphics, |_| {}, false);
    let right = graph.register_pass("right", PassType::Graphics, |_| {}, false);
    let bottom = graph.register_pass("bottom", PassType::Graphics, |_| {}, false);
    graph.move_to_post_register();

    graph.add_output(top, 100, ResourceState::UNORDERED_ACCESS);
    graph.add_input(left, 100, ResourceState::NON_PIXEL_SHADER_RESOURCE);
    graph.add_input(right, 100, ResourceState::NON_PIXEL_SHADER_RESOURCE);
    graph.add_output(left, 101, ResourceState::UNORDERED_ACCESS);
    graph.add_output(right, 102, ResourceState::UNORDERED_ACCESS);
    graph.add_input(bottom, 101, ResourceState::NON_PIXEL_SHADER_RESOURCE);
    graph.add_input(bottom, 102, ResourceState::NON_PIXEL_SHADER_RESOURCE);

    let mut ts = TaskSet::new();
    graph.build(&mut ts);

    let mut seen = [false; 4];
    for handle in [top, left, right, bottom] {
        let idx = graph.sorted_index(handle);
        assert!(!seen[idx], "mapping must be a bijection");
        seen[idx] = true;
    }
    assert!(seen.iter().all(|&s| s));

    // Every edge goes forward in execution order.
    assert!(graph.sorted_index(top) < graph.sorted_index(left));
    assert!(graph.sorted_index(top) < graph.sorted_index(right));
    assert!(graph.sorted_index(left) < graph.sorted_index(bottom));
    assert!(graph.sorted_index(right) < graph.sorted_index(bottom));
}

// ---------------------------------------------------------------------------
// Frame-over-frame behavior
// ---------------------------------------------------------------------------

#[test]
fn identical_frames_build_identical_graphs() {
    let (_mock, mut graph) = harness();
    let pool = make_pool(2);

    let declare_and_run = |graph: &mut RenderGraph, pool: &TaskPool| {
        graph.begin_frame();
        graph.register_resource(Some(GpuResource(0x800)), 800, ResourceState::COMMON, false);
        graph.register_resource(Some(GpuResource(0x801)), 801, ResourceState::COMMON, false);
        let a = graph.register_pass("a", PassType::Graphics, |_| {}, false);
        let x = graph.register_pass("x", PassType::AsyncCompute, |_| {}, false);
        let b = graph.register_pass("b", PassType::Graphics, |_| {}, false);
        graph.move_to_post_register();

        graph.add_output(a, 800, ResourceState::UNORDERED_ACCESS);
        graph.add_input(x, 800, ResourceState::NON_PIXEL_SHADER_RESOURCE);
        graph.add_output(x, 801, ResourceState::UNORDERED_ACCESS);
        graph.add_input(b, 801, ResourceState::NON_PIXEL_SHADER_RESOURCE);

        run_frame(graph, pool);

        let aggregates: Vec<_> = graph
            .aggregates()
            .iter()
            .map(|agg| {
                (
                    agg.name.clone(),
                    agg.batch_idx,
                    agg.is_async_compute,
                    agg.gpu_dep_idx,
                    agg.merged_cmdlist_idx,
                )
            })
            .collect();
        let barriers: Vec<_> = graph
            .aggregates()
            .iter()
            .map(|agg| agg.barriers.clone())
            .collect();
        let mapping = vec![
            graph.sorted_index(a),
            graph.sorted_index(x),
            graph.sorted_index(b),
        ];
        (aggregates, barriers, mapping)
    };

    // Frame 1 transitions resources out of COMMON; frames 2 and 3 run from
    // the steady state and must match each other exactly.
    let _frame1 = declare_and_run(&mut graph, &pool);
    let frame2 = declare_and_run(&mut graph, &pool);
    let frame3 = declare_and_run(&mut graph, &pool);

    assert_eq!(frame2, frame3);
}

#[test]
fn frame_submission_wait_object_signals_once() {
    let (_mock, mut graph) = harness();
    let wait = WaitObject::new();

    graph.begin_frame();
    graph.register_resource(Some(GpuResource(0xa00)), 1000, ResourceState::COMMON, false);
    let p = graph.register_pass("p", PassType::Graphics, |_| {}, false);
    graph.move_to_post_register();
    graph.add_output(p, 1000, ResourceState::RENDER_TARGET);
    graph.set_frame_submission_wait_object(wait.clone());

    let pool = make_pool(2);
    run_frame(&mut graph, &pool);

    wait.wait();
    assert!(wait.is_signaled());
}

// ---------------------------------------------------------------------------
// Declaration-time validation
// ---------------------------------------------------------------------------

#[rstest]
#[case(ResourceState::RENDER_TARGET)]
#[case(ResourceState::DEPTH_WRITE)]
#[should_panic(expected = "not supported on an async-compute")]
fn async_compute_output_rejects_illegal_states(#[case] state: ResourceState) {
    let (_mock, mut graph) = harness();

    graph.begin_frame();
    graph.register_resource(Some(GpuResource(0xb00)), 1100, ResourceState::COMMON, false);
    let c = graph.register_pass("c", PassType::AsyncCompute, |_| {}, false);
    graph.move_to_post_register();

    graph.add_output(c, 1100, state);
}

#[test]
#[should_panic(expected = "read states")]
fn input_rejects_write_only_state() {
    let (_mock, mut graph) = harness();

    graph.begin_frame();
    graph.register_resource(Some(GpuResource(0xb01)), 1101, ResourceState::COMMON, false);
    let p = graph.register_pass("p", PassType::Graphics, |_| {}, false);
    graph.move_to_post_register();

    graph.add_input(p, 1101, ResourceState::RENDER_TARGET);
}

#[test]
#[should_panic(expected = "unknown resource")]
fn build_rejects_unknown_input_resource() {
    let (_mock, mut graph) = harness();

    graph.begin_frame();
    let p = graph.register_pass("p", PassType::Graphics, |_| {}, false);
    graph.move_to_post_register();

    graph.add_input(p, 4242, ResourceState::NON_PIXEL_SHADER_RESOURCE);

    let mut ts = TaskSet::new();
    graph.build(&mut ts);
}

#[test]
#[should_panic(expected = "pre-register")]
fn register_pass_outside_pre_register_panics() {
    let (_mock, mut graph) = harness();

    graph.begin_frame();
    graph.move_to_post_register();
    let _ = graph.register_pass("late", PassType::Graphics, |_| {}, false);
}
