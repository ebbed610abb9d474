//! Worker pool draining an MPMC task queue.
//!
//! [`TaskPool`] owns a set of worker threads that block on a lock-free
//! multi-producer multi-consumer channel. Every participating thread —
//! workers plus any external submitter threads registered at
//! [`start`](TaskPool::start) — holds its own producer and consumer token
//! (channel endpoint clones), selected by a linear scan of the registered
//! thread-id set.
//!
//! Submitter threads can also drain the queue cooperatively with
//! [`pump_until_empty`](TaskPool::pump_until_empty), which is what
//! [`try_flush`](TaskPool::try_flush) falls back to while a frame's tasks
//! are still in flight.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread::{self, JoinHandle, ThreadId};

use crossbeam_channel::{Receiver, Sender, TryRecvError};
use parking_lot::RwLock;

use crate::task::{SignalRegistry, Task, TaskPriority, TaskSet};
use crate::{profile_scope_dynamic, set_thread_name};

/// Requested scheduling priority for worker threads.
///
/// Advisory: recorded for the pool and applied where the platform exposes a
/// portable way to do so.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadPriority {
    /// Default OS scheduling.
    Normal,
    /// Workers intended for low-priority background work.
    Background,
}

/// A pool of worker threads executing [`Task`]s.
pub struct TaskPool {
    shared: Arc<Shared>,
    workers: Vec<JoinHandle<()>>,
    worker_ids: Vec<ThreadId>,
    /// Producer token per registered thread slot.
    senders: Vec<Sender<Task>>,
    /// Consumer token per registered thread slot, used by pumping threads.
    receivers: Vec<Receiver<Task>>,
    pool_size: usize,
    total_threads: usize,
    #[allow(dead_code)]
    priority: ThreadPriority,
}

struct Shared {
    signals: SignalRegistry,
    start: AtomicBool,
    shutdown: AtomicBool,
    /// Tasks currently sitting in the queue.
    queued: AtomicUsize,
    /// Tasks executed to completion since the last counter reset.
    finished: AtomicUsize,
    /// Tasks enqueued since the last counter reset.
    outstanding_target: AtomicUsize,
    /// Ids of every participating thread, published by `start`.
    thread_ids: RwLock<Vec<ThreadId>>,
}

impl TaskPool {
    /// Spawn `pool_size` workers and pre-allocate queue tokens for
    /// `total_threads` participants (workers plus external submitters).
    ///
    /// Workers are named `<name_prefix>_<index>` and block on a start flag
    /// until [`start`](Self::start) publishes the registered thread set.
    pub fn init(
        pool_size: usize,
        total_threads: usize,
        name_prefix: &str,
        priority: ThreadPriority,
    ) -> Self {
        assert!(pool_size > 0, "task pool needs at least one worker");
        assert!(
            total_threads >= pool_size,
            "total thread count must include the workers"
        );

        let (sender, receiver) = crossbeam_channel::unbounded::<Task>();
        let senders: Vec<_> = (0..total_threads).map(|_| sender.clone()).collect();
        let receivers: Vec<_> = (0..total_threads).map(|_| receiver.clone()).collect();

        let shared = Arc::new(Shared {
            signals: SignalRegistry::new(),
            start: AtomicBool::new(false),
            shutdown: AtomicBool::new(false),
            queued: AtomicUsize::new(0),
            finished: AtomicUsize::new(0),
            outstanding_target: AtomicUsize::new(0),
            thread_ids: RwLock::new(Vec::new()),
        });

        let mut workers = Vec::with_capacity(pool_size);
        for i in 0..pool_size {
            let name = format!("{name_prefix}_{i}");
            let shared = Arc::clone(&shared);
            let receiver = receiver.clone();
            let handle = thread::Builder::new()
                .name(name)
                .spawn(move || worker_loop(&shared, &receiver))
                .expect("failed to spawn task pool worker");
            workers.push(handle);
        }

        let worker_ids = workers.iter().map(|h| h.thread().id()).collect();

        Self {
            shared,
            workers,
            worker_ids,
            senders,
            receivers,
            pool_size,
            total_threads,
            priority,
        }
    }

    /// Get the ids of the pool's worker threads.
    ///
    /// The caller combines these with its own submitter thread ids to build
    /// the full set passed to [`start`](Self::start).
    pub fn worker_thread_ids(&self) -> &[ThreadId] {
        &self.worker_ids
    }

    /// Get the signal registry used by task sets targeting this pool.
    pub fn signals(&self) -> &SignalRegistry {
        &self.shared.signals
    }

    /// Publish the full set of participating thread ids and release the
    /// workers.
    ///
    /// `thread_ids` must contain exactly `total_threads` entries, including
    /// every worker id.
    pub fn start(&self, thread_ids: &[ThreadId]) {
        assert_eq!(
            thread_ids.len(),
            self.total_threads,
            "thread id count must match the total registered at init"
        );

        *self.shared.thread_ids.write() = thread_ids.to_vec();
        self.shared.start.store(true, Ordering::Release);
    }

    /// Enqueue a single task from the calling thread.
    ///
    /// The calling thread must be one of the registered participants.
    pub fn enqueue(&self, task: Task) {
        let idx = self.current_thread_index();

        self.senders[idx]
            .send(task)
            .expect("task queue is disconnected");

        // Relaxed is fine for the target: the queued increment below is the
        // release operation consumers synchronize with.
        self.shared
            .outstanding_target
            .fetch_add(1, Ordering::Relaxed);
        self.shared.queued.fetch_add(1, Ordering::Release);
    }

    /// Enqueue every task of a finalized [`TaskSet`].
    pub fn enqueue_set(&self, set: TaskSet) {
        debug_assert!(set.is_finalized(), "task set must be finalized");

        let count = set.len();
        self.shared
            .outstanding_target
            .fetch_add(count, Ordering::Relaxed);
        self.shared.queued.fetch_add(count, Ordering::Release);

        let idx = self.current_thread_index();
        for task in set.into_tasks() {
            self.senders[idx]
                .send(task)
                .expect("task queue is disconnected");
        }
    }

    /// Dequeue and execute tasks on the calling thread until the queue reads
    /// empty.
    ///
    /// A failed dequeue does not imply the queue is empty (another consumer
    /// may be mid-dequeue), so the loop keeps rechecking the queued counter.
    pub fn pump_until_empty(&self) {
        let idx = self.current_thread_index();

        while self.shared.queued.load(Ordering::Acquire) != 0 {
            match self.receivers[idx].try_recv() {
                Ok(task) => {
                    self.shared.queued.fetch_sub(1, Ordering::Relaxed);
                    run_task(task, &self.shared.signals);
                    self.shared.finished.fetch_add(1, Ordering::Release);
                }
                Err(TryRecvError::Empty) => std::hint::spin_loop(),
                Err(TryRecvError::Disconnected) => break,
            }
        }
    }

    /// Check whether every enqueued task has finished.
    ///
    /// Returns `true` exactly when the finished count has caught up with the
    /// enqueue target, resetting both counters for the next frame. Otherwise
    /// pumps the queue on the calling thread and returns `false`; the caller
    /// retries.
    pub fn try_flush(&self) -> bool {
        let success = self.shared.finished.load(Ordering::Acquire)
            == self.shared.outstanding_target.load(Ordering::Acquire);

        if success {
            self.shared.finished.store(0, Ordering::Relaxed);
            self.shared.outstanding_target.store(0, Ordering::Relaxed);
        } else {
            self.pump_until_empty();
        }

        success
    }

    /// Shut the pool down: set the shutdown flag, wake every worker with a
    /// no-op task, and join them.
    pub fn shutdown(&mut self) {
        if self.workers.is_empty() {
            return;
        }

        // Relaxed is sufficient: the no-op enqueues below publish with
        // release ordering.
        self.shared.shutdown.store(true, Ordering::Relaxed);
        // Unblock workers still parked on the start flag.
        self.shared.start.store(true, Ordering::Release);

        for _ in 0..self.pool_size {
            let idx = self.current_thread_index();
            self.senders[idx]
                .send(Task::new("noop", TaskPriority::Normal, || {}))
                .expect("task queue is disconnected");
        }

        // Dropping the producer side disconnects the channel, so any worker
        // that raced past its no-op still wakes up.
        self.senders.clear();

        for handle in self.workers.drain(..) {
            if handle.join().is_err() {
                log::error!("task pool: worker terminated with a panic");
            }
        }
    }

    fn current_thread_index(&self) -> usize {
        let id = thread::current().id();
        let ids = self.shared.thread_ids.read();
        ids.iter()
            .position(|&t| t == id)
            .expect("calling thread is not registered with the task pool")
    }
}

impl Drop for TaskPool {
    fn drop(&mut self) {
        // Joining without the no-op protocol is fine here: disconnecting the
        // channel wakes blocked workers.
        self.shared.shutdown.store(true, Ordering::Relaxed);
        self.shared.start.store(true, Ordering::Release);
        self.senders.clear();
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
    }
}

fn worker_loop(shared: &Shared, receiver: &Receiver<Task>) {
    while !shared.start.load(Ordering::Acquire) {
        std::hint::spin_loop();
    }

    set_thread_name!("task pool worker");
    log::info!(
        "task pool: thread '{}' waiting for tasks",
        thread::current().name().unwrap_or("?")
    );

    loop {
        if shared.shutdown.load(Ordering::Acquire) {
            break;
        }

        // Blocks until a task arrives or the channel disconnects.
        let Ok(task) = receiver.recv() else { break };
        shared.queued.fetch_sub(1, Ordering::Acquire);

        run_task(task, &shared.signals);

        shared.finished.fetch_add(1, Ordering::Release);
    }

    log::info!(
        "task pool: thread '{}' exiting",
        thread::current().name().unwrap_or("?")
    );
}

fn run_task(mut task: Task, signals: &SignalRegistry) {
    profile_scope_dynamic!(task.name());

    let participates = task.priority() != TaskPriority::Background;

    // Block until every predecessor has signaled.
    if participates {
        if let Some(slot) = task.signal_handle() {
            signals.wait_all(slot);
            signals.release(slot);
        }
    }

    task.invoke();

    // Wake dependents.
    if participates {
        for &adjacent in task.adjacencies() {
            signals.notify(adjacent);
        }
    }
}
