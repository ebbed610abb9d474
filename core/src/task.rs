//! Tasks, task sets, and dependency signalling.
//!
//! A [`Task`] is a unit of CPU work: a callback plus the bookkeeping the
//! worker pool needs to order it against other tasks. Standalone tasks are
//! enqueued directly; related tasks are staged in a [`TaskSet`], wired
//! together with edges, finalized, and enqueued in bulk.
//!
//! Ordering between tasks uses signal slots from a [`SignalRegistry`]: every
//! non-background task in a finalized set owns one slot, sized to its number
//! of inbound edges. A worker blocks on the slot before running the task and
//! notifies the slots of all dependent tasks afterwards.

use parking_lot::{Condvar, Mutex};

/// Scheduling class of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskPriority {
    /// Participates in the dependency-signal protocol.
    Normal,
    /// Fire-and-forget work that never blocks on or signals other tasks.
    Background,
}

/// A unit of CPU work for the task pool.
pub struct Task {
    name: String,
    priority: TaskPriority,
    callback: Option<Box<dyn FnOnce() + Send>>,
    /// Slot this task waits on before running; `None` outside task sets.
    signal_handle: Option<usize>,
    /// Slots of dependent tasks, notified after the callback returns.
    adjacencies: Vec<usize>,
}

impl Task {
    /// Create a standalone task.
    ///
    /// Standalone tasks have no inbound or outbound dependencies; use a
    /// [`TaskSet`] to express ordering.
    pub fn new(
        name: impl Into<String>,
        priority: TaskPriority,
        callback: impl FnOnce() + Send + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            priority,
            callback: Some(Box::new(callback)),
            signal_handle: None,
            adjacencies: Vec::new(),
        }
    }

    /// Get the task's display name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Get the task's priority.
    pub fn priority(&self) -> TaskPriority {
        self.priority
    }

    pub(crate) fn signal_handle(&self) -> Option<usize> {
        self.signal_handle
    }

    pub(crate) fn adjacencies(&self) -> &[usize] {
        &self.adjacencies
    }

    pub(crate) fn invoke(&mut self) {
        if let Some(callback) = self.callback.take() {
            callback();
        }
    }
}

impl std::fmt::Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task")
            .field("name", &self.name)
            .field("priority", &self.priority)
            .field("signal_handle", &self.signal_handle)
            .field("adjacencies", &self.adjacencies)
            .finish()
    }
}

/// Handle to a task within a [`TaskSet`].
///
/// Only valid for the set that created it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaskSetHandle(u16);

impl TaskSetHandle {
    fn index(self) -> usize {
        self.0 as usize
    }
}

/// A staging container for a batch of interdependent tasks.
///
/// Tasks are added with [`emplace_task`](Self::emplace_task), ordered with
/// [`add_outgoing_edge`](Self::add_outgoing_edge), and wired to signal slots
/// by [`finalize`](Self::finalize). Only a finalized set may be enqueued in
/// bulk.
#[derive(Debug, Default)]
pub struct TaskSet {
    tasks: Vec<Task>,
    /// Edges as (from, to) pairs over set handles.
    edges: Vec<(u16, u16)>,
    finalized: bool,
}

impl TaskSet {
    /// Create a new empty task set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a task to the set.
    ///
    /// Tasks in a set always participate in the dependency protocol, so they
    /// are created with [`TaskPriority::Normal`].
    pub fn emplace_task(
        &mut self,
        name: impl Into<String>,
        callback: impl FnOnce() + Send + 'static,
    ) -> TaskSetHandle {
        debug_assert!(!self.finalized, "task set is already finalized");
        debug_assert!(self.tasks.len() < u16::MAX as usize, "task set overflow");

        self.tasks.push(Task::new(name, TaskPriority::Normal, callback));
        TaskSetHandle((self.tasks.len() - 1) as u16)
    }

    /// Declare that `to` must not start before `from` has finished.
    pub fn add_outgoing_edge(&mut self, from: TaskSetHandle, to: TaskSetHandle) {
        debug_assert!(!self.finalized, "task set is already finalized");
        debug_assert!(from != to, "task cannot depend on itself");
        debug_assert!(
            from.index() < self.tasks.len() && to.index() < self.tasks.len(),
            "edge references an unregistered task"
        );

        self.edges.push((from.0, to.0));
    }

    /// Allocate signal slots and fill adjacency lists.
    ///
    /// After this call the set is immutable and ready for bulk enqueue.
    pub fn finalize(&mut self, signals: &SignalRegistry) {
        debug_assert!(!self.finalized, "task set is already finalized");

        // Duplicate edges would inflate in-degrees past the number of
        // notifications actually delivered, deadlocking the consumer.
        self.edges.sort_unstable();
        self.edges.dedup();

        let mut in_degrees = vec![0u32; self.tasks.len()];
        for &(_, to) in &self.edges {
            in_degrees[to as usize] += 1;
        }

        for (task, in_degree) in self.tasks.iter_mut().zip(&in_degrees) {
            task.signal_handle = Some(signals.alloc(*in_degree));
        }

        for &(from, to) in &self.edges {
            let handle = self.tasks[to as usize]
                .signal_handle
                .expect("signal slots were just allocated");
            self.tasks[from as usize].adjacencies.push(handle);
        }

        self.finalized = true;
    }

    /// Check whether the set has been finalized.
    pub fn is_finalized(&self) -> bool {
        self.finalized
    }

    /// Get the number of tasks in the set.
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    /// Get the number of declared edges.
    pub fn edge_count(&self) -> usize {
        self.edges.len()
    }

    /// Check whether the set is empty.
    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub(crate) fn into_tasks(self) -> Vec<Task> {
        self.tasks
    }
}

/// Table of signal slots used for inter-task ordering.
///
/// A slot is allocated with the number of inbound signals its task expects,
/// counted down by [`notify`](Self::notify), waited on with
/// [`wait_all`](Self::wait_all), and recycled with
/// [`release`](Self::release) once its owner has consumed the waits.
#[derive(Debug, Default)]
pub struct SignalRegistry {
    slots: Mutex<SlotTable>,
    condvar: Condvar,
}

#[derive(Debug, Default)]
struct SlotTable {
    /// Remaining inbound signals per slot.
    remaining: Vec<u32>,
    free: Vec<usize>,
}

impl SignalRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a slot expecting `in_degree` inbound signals.
    pub fn alloc(&self, in_degree: u32) -> usize {
        let mut table = self.slots.lock();
        if let Some(slot) = table.free.pop() {
            table.remaining[slot] = in_degree;
            slot
        } else {
            table.remaining.push(in_degree);
            table.remaining.len() - 1
        }
    }

    /// Block until every inbound signal for `slot` has arrived.
    pub fn wait_all(&self, slot: usize) {
        let mut table = self.slots.lock();
        while table.remaining[slot] > 0 {
            self.condvar.wait(&mut table);
        }
    }

    /// Deliver one inbound signal to `slot`.
    pub fn notify(&self, slot: usize) {
        let mut table = self.slots.lock();
        debug_assert!(table.remaining[slot] > 0, "slot signaled too many times");
        table.remaining[slot] -= 1;
        if table.remaining[slot] == 0 {
            self.condvar.notify_all();
        }
    }

    /// Return `slot` to the free list.
    ///
    /// The caller must guarantee no further waits or notifications target it.
    pub fn release(&self, slot: usize) {
        let mut table = self.slots.lock();
        debug_assert!(
            table.remaining[slot] == 0,
            "released a slot with outstanding signals"
        );
        table.free.push(slot);
    }
}
