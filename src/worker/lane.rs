//! Shared worker machinery.
//!
//! A `Lane` owns one bounded priority queue and one dedicated OS thread. The
//! thread builds its own current-thread tokio runtime, prepares the executor
//! (device, model, warm-up), then pops and runs tasks one at a time until the
//! queue is closed. Completion callbacks always fire on that thread.
//!
//! Lock order: registry, then queue. The queue never calls out while holding
//! its own lock.

use std::any::Any;
use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, mpsc};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::runtime::Runtime;

use super::{ProgressCallback, TaskCallback, Worker, WorkerStats, WorkerStatus};
use crate::config::WorkerKind;
use crate::device::Device;
use crate::error::{BackendError, QueueError, SubmitError, WorkerError};
use crate::queue::{Admission, Dequeued, TaskQueue};
use crate::task::{Task, TaskId, TaskOutput, TaskState};
use crate::telemetry::DeviceTelemetry;

const UNINITIALIZED: u8 = 0;
const RUNNING: u8 = 1;
const STOPPED: u8 = 2;

/// Queue and scheduling parameters an executor asks its lane for.
#[derive(Debug, Clone, PartialEq)]
pub struct LaneOptions {
    /// Ceiling on concurrently executing tasks.
    pub max_concurrent: usize,
    /// 0 = unbounded.
    pub max_queued: usize,
    pub soft_deadline: Option<Duration>,
    pub device: Device,
}

impl Default for LaneOptions {
    fn default() -> Self {
        Self {
            max_concurrent: 1,
            max_queued: 0,
            soft_deadline: None,
            device: Device::Cpu,
        }
    }
}

/// Per-task handle passed to the executor.
pub struct ExecutionContext {
    task_id: TaskId,
    progress: Option<ProgressCallback>,
}

impl ExecutionContext {
    pub fn new(task_id: impl Into<TaskId>, progress: Option<ProgressCallback>) -> Self {
        Self {
            task_id: task_id.into(),
            progress,
        }
    }

    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    /// Forward a progress fraction to the registered listener, if any.
    pub fn report_progress(&self, fraction: f32) {
        let Some(callback) = &self.progress else {
            return;
        };
        if catch_unwind(AssertUnwindSafe(|| callback(&self.task_id, fraction))).is_err() {
            tracing::error!(task_id = %self.task_id, "Progress callback panicked");
        }
    }
}

/// The kind-specific part of a worker. Runs entirely on the lane thread.
#[async_trait]
pub trait LaneExecutor: Send + 'static {
    fn options(&self) -> LaneOptions;

    /// Bind the device, load the model, warm up.
    async fn prepare(&mut self) -> Result<(), WorkerError>;

    async fn execute(
        &mut self,
        task: &Task,
        ctx: &ExecutionContext,
    ) -> Result<TaskOutput, BackendError>;

    /// Unload and release the device.
    async fn teardown(&mut self);
}

#[derive(Debug, Clone, Copy)]
struct Tracked {
    queue_id: u64,
    state: TaskState,
}

#[derive(Default)]
struct Counters {
    active: AtomicUsize,
    completed: AtomicU64,
    failed: AtomicU64,
    cancelled: AtomicU64,
    slow: AtomicU64,
    total_ms: AtomicU64,
}

/// State reachable from both the lane thread and callers.
struct LaneShared {
    name: String,
    kind: WorkerKind,
    lifecycle: AtomicU8,
    device: Mutex<Device>,
    registry: Mutex<HashMap<TaskId, Tracked>>,
    callback: RwLock<Option<TaskCallback>>,
    progress: RwLock<Option<ProgressCallback>>,
    counters: Counters,
    telemetry: Arc<dyn DeviceTelemetry>,
}

impl LaneShared {
    fn registry(&self) -> MutexGuard<'_, HashMap<TaskId, Tracked>> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn device(&self) -> Device {
        *self.device.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn run_task<E: LaneExecutor>(
        &self,
        runtime: &Runtime,
        executor: &mut E,
        admission: Admission<Task>,
        soft_deadline: Option<Duration>,
    ) {
        let priority = admission.priority();
        let (mut task, slot) = admission.split();

        if let Some(tracked) = self.registry().get_mut(&task.id) {
            tracked.state = TaskState::Executing;
        }
        if let Err(e) = task.transition_to(TaskState::Executing, None) {
            tracing::error!(worker = %self.name, error = %e, "Admitted task in unexpected state");
        }
        self.counters.active.fetch_add(1, Ordering::SeqCst);

        let progress = self
            .progress
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        let ctx = ExecutionContext::new(task.id.clone(), progress);

        tracing::info!(
            worker = %self.name,
            task_id = %task.id,
            priority = priority.0,
            "Task started"
        );
        let started = Instant::now();
        let outcome = catch_unwind(AssertUnwindSafe(|| {
            runtime.block_on(executor.execute(&task, &ctx))
        }))
        .unwrap_or_else(|payload| Err(BackendError::Panicked(panic_message(&*payload))));
        let elapsed = started.elapsed();
        let elapsed_ms = u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX);

        let recorded = match outcome {
            Ok(output) => task.complete(output).map(|()| {
                self.counters.completed.fetch_add(1, Ordering::SeqCst);
                tracing::info!(worker = %self.name, task_id = %task.id, elapsed_ms, "Task completed");
            }),
            Err(e) => task.fail(e.to_string()).map(|()| {
                self.counters.failed.fetch_add(1, Ordering::SeqCst);
                tracing::warn!(worker = %self.name, task_id = %task.id, error = %e, "Task failed");
            }),
        };
        if let Err(e) = recorded {
            tracing::error!(worker = %self.name, error = %e, "Failed to record task outcome");
        }

        self.counters.total_ms.fetch_add(elapsed_ms, Ordering::SeqCst);
        if let Some(deadline) = soft_deadline
            && elapsed > deadline
        {
            self.counters.slow.fetch_add(1, Ordering::SeqCst);
            tracing::warn!(
                worker = %self.name,
                task_id = %task.id,
                elapsed_ms,
                deadline_ms = u64::try_from(deadline.as_millis()).unwrap_or(u64::MAX),
                "Task exceeded soft deadline"
            );
        }

        self.counters.active.fetch_sub(1, Ordering::SeqCst);
        slot.release();
        self.telemetry.record_activity(self.device(), elapsed);
        self.deliver(task);
    }

    fn finish_cancelled(&self, mut task: Task, reason: &str) {
        if let Err(e) = task.cancel(reason) {
            tracing::error!(worker = %self.name, error = %e, "Failed to cancel task");
        }
        self.counters.cancelled.fetch_add(1, Ordering::SeqCst);
        tracing::info!(worker = %self.name, task_id = %task.id, reason, "Task cancelled");
        self.deliver(task);
    }

    /// Hand a terminal task to the callback, then forget it.
    fn deliver(&self, task: Task) {
        if let Some(tracked) = self.registry().get_mut(&task.id) {
            tracked.state = task.state;
        }

        let callback = self
            .callback
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if let Some(callback) = callback
            && catch_unwind(AssertUnwindSafe(|| callback(&task))).is_err()
        {
            tracing::error!(worker = %self.name, task_id = %task.id, "Completion callback panicked");
        }

        self.registry().remove(&task.id);
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}

/// Body of the lane thread. Returns the executor so the lane can be
/// initialized again after shutdown.
fn run_lane<E: LaneExecutor>(
    shared: Arc<LaneShared>,
    queue: TaskQueue<Task>,
    mut executor: E,
    soft_deadline: Option<Duration>,
    ready: mpsc::Sender<Result<(), WorkerError>>,
) -> E {
    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            let _ = ready.send(Err(WorkerError::Thread {
                worker: shared.name.clone(),
                reason: format!("failed to build runtime: {e}"),
            }));
            return executor;
        }
    };

    let prepared = catch_unwind(AssertUnwindSafe(|| runtime.block_on(executor.prepare())))
        .unwrap_or_else(|payload| {
            Err(WorkerError::BackendInit {
                worker: shared.name.clone(),
                reason: format!("panicked: {}", panic_message(&*payload)),
            })
        });
    if let Err(e) = prepared {
        teardown(&shared, &runtime, &mut executor);
        let _ = ready.send(Err(e));
        return executor;
    }
    let _ = ready.send(Ok(()));
    drop(ready);

    while let Some(next) = queue.pop() {
        match next {
            Dequeued::Run(admission) => {
                shared.run_task(&runtime, &mut executor, admission, soft_deadline)
            }
            Dequeued::Cancelled { work, .. } => {
                shared.finish_cancelled(work, "cancelled before execution")
            }
        }
    }

    for task in queue.drain() {
        shared.finish_cancelled(task, "worker shut down");
    }
    teardown(&shared, &runtime, &mut executor);
    executor
}

fn teardown<E: LaneExecutor>(shared: &LaneShared, runtime: &Runtime, executor: &mut E) {
    if catch_unwind(AssertUnwindSafe(|| runtime.block_on(executor.teardown()))).is_err() {
        tracing::error!(worker = %shared.name, "Executor teardown panicked");
    }
}

struct Running<E> {
    queue: TaskQueue<Task>,
    thread: JoinHandle<E>,
}

/// A worker built from an executor.
pub struct Lane<E: LaneExecutor> {
    shared: Arc<LaneShared>,
    /// Present while the lane thread is not running.
    executor: Mutex<Option<E>>,
    running: Mutex<Option<Running<E>>>,
    /// Set while `initialize` waits for the thread to prepare. `running` is
    /// not held during that wait.
    starting: AtomicBool,
}

impl<E: LaneExecutor> Lane<E> {
    pub fn with_executor(
        name: impl Into<String>,
        kind: WorkerKind,
        executor: E,
        telemetry: Arc<dyn DeviceTelemetry>,
    ) -> Self {
        let device = executor.options().device;
        Self {
            shared: Arc::new(LaneShared {
                name: name.into(),
                kind,
                lifecycle: AtomicU8::new(UNINITIALIZED),
                device: Mutex::new(device),
                registry: Mutex::new(HashMap::new()),
                callback: RwLock::new(None),
                progress: RwLock::new(None),
                counters: Counters::default(),
                telemetry,
            }),
            executor: Mutex::new(Some(executor)),
            running: Mutex::new(None),
            starting: AtomicBool::new(false),
        }
    }

    /// Inspect the executor while the lane is stopped. `None` while running.
    pub fn with_idle_executor<R>(&self, f: impl FnOnce(&mut E) -> R) -> Option<R> {
        self.executor
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_mut()
            .map(f)
    }

    fn queue(&self) -> Option<TaskQueue<Task>> {
        self.running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|running| running.queue.clone())
    }

    fn lifecycle(&self) -> u8 {
        self.shared.lifecycle.load(Ordering::SeqCst)
    }
}

impl<E: LaneExecutor> Worker for Lane<E> {
    fn name(&self) -> &str {
        &self.shared.name
    }

    fn kind(&self) -> WorkerKind {
        self.shared.kind
    }

    fn initialize(&self) -> Result<(), WorkerError> {
        if self.starting.swap(true, Ordering::SeqCst) {
            return Err(WorkerError::AlreadyRunning {
                worker: self.shared.name.clone(),
            });
        }
        let result = self.start();
        self.starting.store(false, Ordering::SeqCst);
        result
    }

    fn shutdown(&self) {
        let taken = self
            .running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(Running { queue, thread }) = taken else {
            return;
        };

        if thread.thread().id() == std::thread::current().id() {
            tracing::error!(worker = %self.shared.name, "Shutdown called from the worker's own thread, ignoring");
            *self.running.lock().unwrap_or_else(PoisonError::into_inner) =
                Some(Running { queue, thread });
            return;
        }

        self.shared.lifecycle.store(STOPPED, Ordering::SeqCst);
        queue.close();
        self.restore(thread);
        tracing::info!(worker = %self.shared.name, "Worker stopped");
    }

    fn submit_task(&self, mut task: Task) -> Result<TaskId, SubmitError> {
        let worker = || self.shared.name.clone();
        match self.lifecycle() {
            UNINITIALIZED => return Err(SubmitError::NotInitialized { worker: worker() }),
            STOPPED => return Err(SubmitError::NotRunning { worker: worker() }),
            _ => {}
        }
        if task.kind.worker_kind() != self.shared.kind {
            return Err(SubmitError::WrongKind {
                worker: worker(),
                kind: task.kind.to_string(),
            });
        }
        let invalid_state = |task: &Task| SubmitError::InvalidState {
            id: task.id.clone(),
            state: task.state.to_string(),
        };
        if task.state != TaskState::Pending {
            return Err(invalid_state(&task));
        }

        let queue = self
            .queue()
            .ok_or_else(|| SubmitError::NotRunning { worker: worker() })?;
        task.transition_to(TaskState::Queued, None)
            .map_err(|_| invalid_state(&task))?;

        let id = task.id.clone();
        let priority = task.priority;
        let mut registry = self.shared.registry();
        let queue_id = queue.enqueue(task, priority).map_err(|e| match e {
            QueueError::Full { capacity } => SubmitError::QueueFull {
                worker: worker(),
                capacity,
            },
            QueueError::Closed => SubmitError::NotRunning { worker: worker() },
        })?;
        registry.insert(
            id.clone(),
            Tracked {
                queue_id,
                state: TaskState::Queued,
            },
        );
        drop(registry);

        tracing::debug!(
            worker = %self.shared.name,
            task_id = %id,
            queue_id,
            priority = priority.0,
            "Task queued"
        );
        Ok(id)
    }

    fn cancel_task(&self, task_id: &str) -> bool {
        let Some(queue) = self.queue() else {
            return false;
        };
        let mut registry = self.shared.registry();
        let Some(tracked) = registry.get_mut(task_id) else {
            return false;
        };
        if tracked.state != TaskState::Queued || !queue.cancel(tracked.queue_id) {
            return false;
        }
        tracked.state = TaskState::Cancelled;
        tracing::debug!(worker = %self.shared.name, task_id, "Queued task cancelled");
        true
    }

    fn task_state(&self, task_id: &str) -> Option<TaskState> {
        self.shared.registry().get(task_id).map(|tracked| tracked.state)
    }

    fn status(&self) -> WorkerStatus {
        match self.lifecycle() {
            RUNNING if self.shared.counters.active.load(Ordering::SeqCst) > 0 => {
                WorkerStatus::Busy
            }
            RUNNING => WorkerStatus::Ready,
            STOPPED => WorkerStatus::Stopped,
            _ => WorkerStatus::Uninitialized,
        }
    }

    fn stats(&self) -> WorkerStats {
        let counters = &self.shared.counters;
        let status = self.status();
        let device = self.shared.device();
        let sample = self.shared.telemetry.sample(device);

        let completed = counters.completed.load(Ordering::SeqCst);
        let failed = counters.failed.load(Ordering::SeqCst);
        let total_ms = counters.total_ms.load(Ordering::SeqCst);
        let finished = completed + failed;

        WorkerStats {
            worker: self.shared.name.clone(),
            kind: self.shared.kind,
            device: device.to_string(),
            initialized: status != WorkerStatus::Uninitialized,
            running: status.is_running(),
            busy: status == WorkerStatus::Busy,
            queued_tasks: self.queue().map(|q| q.len()).unwrap_or(0),
            active_tasks: counters.active.load(Ordering::SeqCst),
            completed_tasks: completed,
            failed_tasks: failed,
            cancelled_tasks: counters.cancelled.load(Ordering::SeqCst),
            slow_tasks: counters.slow.load(Ordering::SeqCst),
            device_utilization: sample.utilization,
            device_memory_mb: sample.memory_used_mb,
            total_processing_ms: total_ms,
            avg_processing_ms: if finished == 0 {
                0.0
            } else {
                total_ms as f64 / finished as f64
            },
        }
    }

    fn set_task_completed_callback(&self, callback: TaskCallback) {
        *self
            .shared
            .callback
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(callback);
    }

    fn set_progress_callback(&self, callback: ProgressCallback) {
        *self
            .shared
            .progress
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(callback);
    }
}

impl<E: LaneExecutor> Lane<E> {
    /// Join the lane thread and keep its executor for the next initialize.
    fn start(&self) -> Result<(), WorkerError> {
        let name = self.shared.name.clone();
        if self
            .running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
        {
            return Err(WorkerError::AlreadyRunning { worker: name });
        }

        let executor = self
            .executor
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or_else(|| WorkerError::Thread {
                worker: name.clone(),
                reason: "executor was lost when a previous thread panicked".into(),
            })?;

        let options = executor.options();
        *self.shared.device.lock().unwrap_or_else(PoisonError::into_inner) = options.device;
        let queue = TaskQueue::new(options.max_concurrent, options.max_queued);

        let (ready_tx, ready_rx) = mpsc::channel();
        let thread_shared = Arc::clone(&self.shared);
        let thread_queue = queue.clone();
        let soft_deadline = options.soft_deadline;
        let thread = std::thread::Builder::new()
            .name(name.clone())
            .spawn(move || run_lane(thread_shared, thread_queue, executor, soft_deadline, ready_tx))
            .map_err(|e| WorkerError::Thread {
                worker: name.clone(),
                reason: e.to_string(),
            })?;

        let startup = ready_rx.recv();
        match startup {
            Ok(Ok(())) => {
                *self.running.lock().unwrap_or_else(PoisonError::into_inner) =
                    Some(Running { queue, thread });
                self.shared.lifecycle.store(RUNNING, Ordering::SeqCst);
                tracing::info!(
                    worker = %name,
                    device = %options.device,
                    max_concurrent = options.max_concurrent,
                    max_queued = options.max_queued,
                    "Worker initialized"
                );
                Ok(())
            }
            Ok(Err(e)) => {
                self.restore(thread);
                tracing::error!(worker = %name, error = %e, "Worker failed to initialize");
                Err(e)
            }
            Err(_) => {
                self.restore(thread);
                Err(WorkerError::Thread {
                    worker: name,
                    reason: "execution thread exited during startup".into(),
                })
            }
        }
    }

    fn restore(&self, thread: JoinHandle<E>) {
        match thread.join() {
            Ok(executor) => {
                *self.executor.lock().unwrap_or_else(PoisonError::into_inner) = Some(executor);
            }
            Err(payload) => {
                tracing::error!(
                    worker = %self.shared.name,
                    panic = %panic_message(&*payload),
                    "Worker thread panicked"
                );
            }
        }
    }
}

impl<E: LaneExecutor> Drop for Lane<E> {
    fn drop(&mut self) {
        self.shutdown();
    }
}
