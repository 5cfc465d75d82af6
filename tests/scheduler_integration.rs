//! Integration tests for the scheduler facade.
//!
//! Workers run on their own threads; tests observe them through the
//! completion callback, with stub backends that can hold a task in flight.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, mpsc};
use std::time::{Duration, Instant};

use async_trait::async_trait;

use ai_lanes::backends::{
    GeneratedImage, Generation, GenerationRequest, ImageBackend, ImageRequest, InferenceBackend,
    ModelSpec,
};
use ai_lanes::config::{ConfigStore, WorkerKind};
use ai_lanes::device::Hardware;
use ai_lanes::error::{BackendError, SubmitError};
use ai_lanes::task::{ImageParams, LlmParams, TaskPayload, TtsParams};
use ai_lanes::worker::{ImageWorker, LlmWorker, TtsWorker, Worker};
use ai_lanes::{Scheduler, Task, TaskKind, TaskOutput, TaskRequest, TaskState};

/// Maximum time to wait for any callback.
const TEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Prompt that parks the stub runtime until the gate opens.
const BLOCK: &str = "block";

#[derive(Clone, Default)]
struct Gate(Arc<(Mutex<bool>, Condvar)>);

impl Gate {
    fn open(&self) {
        *self.0.0.lock().unwrap() = true;
        self.0.1.notify_all();
    }

    fn wait(&self) {
        let mut open = self.0.0.lock().unwrap();
        while !*open {
            open = self.0.1.wait(open).unwrap();
        }
    }
}

/// Echo runtime that blocks on `BLOCK` prompts.
struct GatedInference {
    gate: Gate,
    loaded: bool,
}

#[async_trait]
impl InferenceBackend for GatedInference {
    fn name(&self) -> &'static str {
        "gated"
    }

    async fn load(&mut self, _spec: &ModelSpec) -> Result<(), BackendError> {
        self.loaded = true;
        Ok(())
    }

    async fn unload(&mut self) {
        self.loaded = false;
    }

    fn is_loaded(&self) -> bool {
        self.loaded
    }

    async fn generate(&mut self, request: &GenerationRequest) -> Result<Generation, BackendError> {
        if request.prompt == BLOCK {
            self.gate.wait();
        }
        Ok(Generation {
            text: request.prompt.clone(),
            tokens: 1,
        })
    }
}

/// Diffusion stub that records how many generations overlap.
struct CountingDiffusion {
    current: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
}

#[async_trait]
impl ImageBackend for CountingDiffusion {
    fn name(&self) -> &'static str {
        "counting"
    }

    fn file_extension(&self) -> &'static str {
        "png"
    }

    async fn load(&mut self, _spec: &ModelSpec) -> Result<(), BackendError> {
        Ok(())
    }

    async fn unload(&mut self) {}

    fn is_loaded(&self) -> bool {
        true
    }

    async fn generate(
        &mut self,
        request: &ImageRequest,
        progress: &(dyn Fn(f32) + Send + Sync),
    ) -> Result<GeneratedImage, BackendError> {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(5)).await;
        progress(0.5);
        self.current.fetch_sub(1, Ordering::SeqCst);
        Ok(GeneratedImage {
            path: request.output_path.clone(),
            width: request.width,
            height: request.height,
            seed: request.seed,
            steps: request.steps,
        })
    }
}

fn config(dir: &std::path::Path) -> Arc<ConfigStore> {
    let store = ConfigStore::new();
    store.initialize(None).unwrap();
    store.set_global_config("output_dir", dir.to_string_lossy().to_string());
    store.set_worker_config(WorkerKind::GpuImage, "width", 8);
    store.set_worker_config(WorkerKind::GpuImage, "height", 8);
    Arc::new(store)
}

/// Scheduler whose LLM worker uses the gated runtime.
fn gated_scheduler(dir: &std::path::Path, gate: &Gate) -> Arc<Scheduler> {
    let config = config(dir);
    let hardware = Hardware::default();
    let llm = LlmWorker::with_backend(
        Arc::clone(&config),
        hardware.clone(),
        Box::new(GatedInference {
            gate: gate.clone(),
            loaded: false,
        }),
    );
    let tts = TtsWorker::new(Arc::clone(&config), hardware);
    let scheduler = Scheduler::with_workers(config, vec![Arc::new(llm), Arc::new(tts)]);
    assert!(scheduler.initialize().all_started());
    Arc::new(scheduler)
}

fn completions(scheduler: &Scheduler) -> mpsc::Receiver<Task> {
    let (tx, rx) = mpsc::channel();
    scheduler.set_task_completed_callback(move |task: &Task| {
        let _ = tx.send(task.clone());
    });
    rx
}

fn llm(prompt: &str, priority: i32) -> TaskRequest {
    TaskRequest::new(TaskPayload::Llm(LlmParams::new(prompt))).with_priority(priority)
}

fn wait_for_state(scheduler: &Scheduler, id: &str, state: TaskState) {
    let deadline = Instant::now() + TEST_TIMEOUT;
    while scheduler.task_state(id) != Some(state) {
        assert!(Instant::now() < deadline, "task {id} never reached {state}");
        std::thread::sleep(Duration::from_millis(5));
    }
}

#[test]
fn submissions_rejected_before_initialize_and_after_shutdown() {
    let dir = tempfile::tempdir().unwrap();
    let scheduler = Scheduler::new(config(dir.path()));
    let tts = || TaskRequest::new(TaskPayload::Tts(TtsParams::new("hello")));

    assert!(matches!(
        scheduler.submit(tts()),
        Err(SubmitError::NotInitialized { .. })
    ));

    assert!(scheduler.initialize().all_started());
    scheduler.submit(tts()).unwrap();
    scheduler.shutdown();

    assert!(matches!(
        scheduler.submit(tts()),
        Err(SubmitError::NotRunning { .. })
    ));
}

#[test]
fn higher_priority_runs_first_behind_busy_task() {
    let dir = tempfile::tempdir().unwrap();
    let gate = Gate::default();
    let scheduler = gated_scheduler(dir.path(), &gate);
    let rx = completions(&scheduler);

    let busy = scheduler.submit(llm(BLOCK, 1)).unwrap();
    wait_for_state(&scheduler, &busy, TaskState::Executing);

    let low = scheduler.submit(llm("three", 3)).unwrap();
    let high = scheduler.submit(llm("five", 5)).unwrap();
    gate.open();

    let order: Vec<String> = (0..3)
        .map(|_| rx.recv_timeout(TEST_TIMEOUT).unwrap().id)
        .collect();
    assert_eq!(order, vec![busy, high, low]);
}

#[test]
fn queued_cancel_reports_cancelled_only() {
    let dir = tempfile::tempdir().unwrap();
    let gate = Gate::default();
    let scheduler = gated_scheduler(dir.path(), &gate);
    let rx = completions(&scheduler);

    let busy = scheduler.submit(llm(BLOCK, 5)).unwrap();
    wait_for_state(&scheduler, &busy, TaskState::Executing);
    let queued = scheduler.submit(llm("never runs", 5)).unwrap();

    assert!(scheduler.cancel(TaskKind::LlmInference, &queued));
    gate.open();

    let mut events = Vec::new();
    while let Ok(task) = rx.recv_timeout(Duration::from_millis(300)) {
        events.push(task);
    }
    let queued_events: Vec<_> = events.iter().filter(|t| t.id == queued).collect();
    assert_eq!(queued_events.len(), 1);
    assert_eq!(queued_events[0].state, TaskState::Cancelled);
    assert!(queued_events[0].output.is_none());

    let busy_event = events.iter().find(|t| t.id == busy).unwrap();
    assert_eq!(busy_event.state, TaskState::Completed);
}

#[test]
fn executing_cancel_returns_false() {
    let dir = tempfile::tempdir().unwrap();
    let gate = Gate::default();
    let scheduler = gated_scheduler(dir.path(), &gate);
    let rx = completions(&scheduler);

    let busy = scheduler.submit(llm(BLOCK, 5)).unwrap();
    wait_for_state(&scheduler, &busy, TaskState::Executing);

    assert!(!scheduler.cancel(TaskKind::LlmInference, &busy));
    // Wrong kind never reaches the owning worker.
    assert!(!scheduler.cancel(TaskKind::TtsSynthesis, &busy));
    gate.open();

    let task = rx.recv_timeout(TEST_TIMEOUT).unwrap();
    assert_eq!(task.id, busy);
    assert!(task.is_terminal());
    assert_eq!(task.state, TaskState::Completed);
}

#[test]
fn image_worker_never_overlaps_generations() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(dir.path());
    let current = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let image = ImageWorker::with_backend(
        Arc::clone(&config),
        Hardware::default(),
        Box::new(CountingDiffusion {
            current: Arc::clone(&current),
            peak: Arc::clone(&peak),
        }),
    );
    let scheduler = Arc::new(Scheduler::with_workers(config, vec![Arc::new(image)]));
    assert!(scheduler.initialize().all_started());
    let rx = completions(&scheduler);

    let submitters: Vec<_> = (0..4)
        .map(|n| {
            let scheduler = Arc::clone(&scheduler);
            std::thread::spawn(move || {
                for i in 0..3 {
                    let params = ImageParams::new(format!("frame {n}-{i}"));
                    scheduler
                        .submit(TaskRequest::new(TaskPayload::Image(params)).with_priority(i))
                        .unwrap();
                }
            })
        })
        .collect();
    for submitter in submitters {
        submitter.join().unwrap();
    }

    for _ in 0..12 {
        let task = rx.recv_timeout(TEST_TIMEOUT).unwrap();
        assert_eq!(task.state, TaskState::Completed);
    }
    assert_eq!(peak.load(Ordering::SeqCst), 1);
    assert_eq!(current.load(Ordering::SeqCst), 0);

    let stats = scheduler.worker(WorkerKind::GpuImage).unwrap().stats();
    assert_eq!(stats.completed_tasks, 12);
}

#[test]
fn turbo_image_reduces_steps_with_rising_progress() {
    let dir = tempfile::tempdir().unwrap();
    let scheduler = Scheduler::new(config(dir.path()));
    let progress = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&progress);
    scheduler.set_progress_callback(move |task_id: &str, fraction: f32| {
        sink.lock().unwrap().push((task_id.to_string(), fraction));
    });
    let rx = completions(&scheduler);
    assert!(scheduler.initialize().all_started());

    let mut params = ImageParams::new("harbor at dusk");
    params.num_inference_steps = Some(40);
    params.use_turbo_mode = true;
    let id = scheduler
        .submit(TaskRequest::new(TaskPayload::Image(params)))
        .unwrap();

    let task = rx.recv_timeout(TEST_TIMEOUT).unwrap();
    assert_eq!(task.id, id);
    match task.output {
        Some(TaskOutput::Image { steps, .. }) => assert_eq!(steps, 4),
        other => panic!("unexpected output: {other:?}"),
    }

    let fractions: Vec<f32> = progress
        .lock()
        .unwrap()
        .iter()
        .filter(|(task_id, _)| *task_id == id)
        .map(|(_, fraction)| *fraction)
        .collect();
    assert!(!fractions.is_empty());
    assert!(fractions.windows(2).all(|pair| pair[1] > pair[0]));
    assert_eq!(fractions.last().copied(), Some(1.0));
}

#[test]
fn failing_task_does_not_stop_the_lane() {
    let dir = tempfile::tempdir().unwrap();
    let scheduler = Scheduler::new(config(dir.path()));
    let rx = completions(&scheduler);
    assert!(scheduler.initialize().all_started());

    let mut bad = TtsParams::new("hello");
    bad.voice = Some("nobody".into());
    scheduler
        .submit(TaskRequest::new(TaskPayload::Tts(bad)))
        .unwrap();
    let failed = rx.recv_timeout(TEST_TIMEOUT).unwrap();
    assert_eq!(failed.state, TaskState::Failed);
    assert!(failed.error.is_some());

    scheduler
        .submit(TaskRequest::new(TaskPayload::Tts(TtsParams::new("fine"))))
        .unwrap();
    assert_eq!(
        rx.recv_timeout(TEST_TIMEOUT).unwrap().state,
        TaskState::Completed
    );

    let stats = scheduler.aggregate_stats();
    assert_eq!(stats.failed_tasks, 1);
    assert_eq!(stats.completed_tasks, 1);
}
