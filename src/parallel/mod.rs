//! Parallel batch scheduling over a work-stealing thread pool

use std::any::Any;
use std::iter;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam::channel::{unbounded, Receiver};
use crossbeam::deque::{Injector, Stealer, Worker};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::config::{Config, EngineConfig, OptimizationOptions};
use crate::error::{IronPressError, Result, TaskError};
use crate::processing::{DecodeBudget, ImageTask, OptimizationResult, OutputPlan, ProcessingEngine};

pub mod progress;

pub use progress::{BatchEvent, BatchProgress, BatchSummary, IngestEvent, ProgressReporter};

/// Work performed for one task on a worker thread
pub trait TaskProcessor: Send + Sync {
    fn process(&self, task: &ImageTask) -> Result<OptimizationResult>;
}

impl TaskProcessor for ProcessingEngine {
    fn process(&self, task: &ImageTask) -> Result<OptimizationResult> {
        ProcessingEngine::process(self, task)
    }
}

/// Cooperative cancellation flag shared between a handle and its workers
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// In-flight tasks finish; no new task starts afterwards
    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Dispatches optimization batches onto a fixed-size worker pool
#[derive(Debug, Clone)]
pub struct BatchScheduler {
    workers: usize,
    engine: EngineConfig,
    worker_stack_size: Option<usize>,
}

impl BatchScheduler {
    /// Create a scheduler sized to the logical cores
    pub fn new() -> Self {
        Self::with_engine(EngineConfig::default())
    }

    pub fn from_config(config: &Config) -> Self {
        Self::with_engine(config.engine.clone())
    }

    pub fn with_engine(engine: EngineConfig) -> Self {
        let workers = engine.worker_count();
        info!("Initializing batch scheduler with {} workers", workers);
        Self {
            workers,
            engine,
            worker_stack_size: None,
        }
    }

    /// Override the pool size
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    /// Stack size of each worker thread, in bytes; the platform default otherwise
    pub fn with_worker_stack_size(mut self, bytes: usize) -> Self {
        self.worker_stack_size = Some(bytes);
        self
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Validate options, applying the lossless JPEG correction when enabled
    pub fn prepare_options(&self, options: OptimizationOptions) -> Result<OptimizationOptions> {
        let options = if self.engine.auto_correct_lossless_jpeg {
            options.corrected()
        } else {
            options
        };
        options.validate()?;
        Ok(options)
    }

    /// Start a batch and return immediately
    pub fn dispatch(&self, tasks: Vec<ImageTask>, options: OptimizationOptions) -> Result<BatchHandle> {
        let options = self.prepare_options(options)?;
        let budget = DecodeBudget::new(self.workers);
        let plan = OutputPlan::new(&tasks, &options);
        let engine = ProcessingEngine::new(options)
            .with_limits(&self.engine)
            .with_budget(Arc::clone(&budget))
            .with_output_plan(Arc::new(plan));

        let mut handle = self.dispatch_with(tasks, Arc::new(engine))?;
        handle.budget = Some(budget);
        Ok(handle)
    }

    /// Start a batch driven by a custom processor
    pub fn dispatch_with<P>(&self, tasks: Vec<ImageTask>, processor: Arc<P>) -> Result<BatchHandle>
    where
        P: TaskProcessor + 'static,
    {
        let (sender, events) = unbounded();
        let reporter = Arc::new(ProgressReporter::new(tasks.len(), sender));
        let cancel = CancelToken::new();

        if tasks.is_empty() {
            reporter.start();
            let summary = reporter.finish();
            return Ok(BatchHandle {
                events,
                reporter,
                cancel,
                budget: None,
                completion: Completion::Done(summary),
            });
        }

        let pool = Pool {
            workers: self.workers.min(tasks.len()),
            stack_size: self.worker_stack_size,
        };
        let dispatcher = {
            let reporter = Arc::clone(&reporter);
            let cancel = cancel.clone();
            thread::Builder::new()
                .name("ironpress-dispatch".to_string())
                .spawn(move || run_pool(tasks, pool, processor.as_ref(), &reporter, &cancel))
                .map_err(|e| IronPressError::system(format!("Failed to start dispatcher: {e}")))?
        };

        Ok(BatchHandle {
            events,
            reporter,
            cancel,
            budget: None,
            completion: Completion::Running(dispatcher),
        })
    }

    /// Run a batch to completion
    pub fn run(&self, tasks: Vec<ImageTask>, options: OptimizationOptions) -> Result<BatchReport> {
        self.dispatch(tasks, options)?.collect()
    }
}

impl Default for BatchScheduler {
    fn default() -> Self {
        Self::new()
    }
}

enum Completion {
    Running(JoinHandle<BatchSummary>),
    Done(BatchSummary),
}

/// Control surface of a running batch
pub struct BatchHandle {
    events: Receiver<BatchEvent>,
    reporter: Arc<ProgressReporter>,
    cancel: CancelToken,
    budget: Option<Arc<DecodeBudget>>,
    completion: Completion,
}

impl BatchHandle {
    /// Events in emission order; the stream ends with `Finished`
    pub fn events(&self) -> &Receiver<BatchEvent> {
        &self.events
    }

    pub fn progress(&self) -> BatchProgress {
        self.reporter.snapshot_progress()
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Decode budget of the batch, when it was dispatched with the stock engine
    pub fn decode_budget(&self) -> Option<&Arc<DecodeBudget>> {
        self.budget.as_ref()
    }

    pub fn is_finished(&self) -> bool {
        match &self.completion {
            Completion::Running(handle) => handle.is_finished(),
            Completion::Done(_) => true,
        }
    }

    /// Block until every worker has stopped
    pub fn wait(self) -> Result<BatchSummary> {
        self.join().map(|(summary, _)| summary)
    }

    /// Block until the batch ends and gather every result and failure
    pub fn collect(self) -> Result<BatchReport> {
        let (summary, events) = self.join()?;

        let mut results = Vec::new();
        let mut errors = Vec::new();
        for event in events.try_iter() {
            match event {
                BatchEvent::TaskCompleted { result, .. } => results.push(result),
                BatchEvent::TaskFailed { error, .. } => errors.push(error),
                _ => {}
            }
        }

        results.sort_by(|a, b| a.original_path.cmp(&b.original_path));
        errors.sort_by(|a, b| a.path.cmp(&b.path));

        Ok(BatchReport {
            results,
            errors,
            summary,
        })
    }

    fn join(self) -> Result<(BatchSummary, Receiver<BatchEvent>)> {
        let summary = match self.completion {
            Completion::Done(summary) => summary,
            Completion::Running(handle) => handle.join().map_err(|payload| {
                IronPressError::system(format!(
                    "Batch dispatcher panicked: {}",
                    panic_message(&*payload)
                ))
            })?,
        };
        Ok((summary, self.events))
    }
}

/// Everything a finished batch produced; both lists are sorted by path
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchReport {
    pub results: Vec<OptimizationResult>,
    pub errors: Vec<TaskError>,
    pub summary: BatchSummary,
}

#[derive(Debug, Clone, Copy)]
struct Pool {
    workers: usize,
    stack_size: Option<usize>,
}

fn run_pool(
    tasks: Vec<ImageTask>,
    pool: Pool,
    processor: &dyn TaskProcessor,
    reporter: &ProgressReporter,
    cancel: &CancelToken,
) -> BatchSummary {
    reporter.start();

    let injector = Injector::new();
    for task in tasks {
        injector.push(task);
    }

    let locals: Vec<Worker<ImageTask>> = (0..pool.workers).map(|_| Worker::new_fifo()).collect();
    let stealers: Vec<Stealer<ImageTask>> = locals.iter().map(Worker::stealer).collect();

    thread::scope(|scope| {
        let mut started = 0usize;
        for (index, local) in locals.into_iter().enumerate() {
            let (injector, stealers) = (&injector, stealers.as_slice());
            let mut builder = thread::Builder::new().name(format!("ironpress-worker-{index}"));
            if let Some(bytes) = pool.stack_size {
                builder = builder.stack_size(bytes);
            }
            let spawned = builder.spawn_scoped(scope, move || {
                worker_loop(index, &local, injector, stealers, processor, reporter, cancel)
            });

            match spawned {
                Ok(_) => started += 1,
                Err(e) => error!("Failed to spawn worker {}: {}", index, e),
            }
        }

        // Queued tasks live in the injector, so the dispatcher can drain them
        // itself when no worker came up
        if started == 0 {
            warn!("No worker thread could be started, processing on the dispatcher thread");
            let local = Worker::new_fifo();
            worker_loop(pool.workers, &local, &injector, &stealers, processor, reporter, cancel);
        }
    });

    if cancel.is_cancelled() {
        warn!("Batch cancelled");
    }
    reporter.finish()
}

fn worker_loop(
    index: usize,
    local: &Worker<ImageTask>,
    injector: &Injector<ImageTask>,
    stealers: &[Stealer<ImageTask>],
    processor: &dyn TaskProcessor,
    reporter: &ProgressReporter,
    cancel: &CancelToken,
) {
    debug!("Worker {} started", index);
    let mut processed = 0usize;

    while !cancel.is_cancelled() {
        let Some(task) = find_task(local, injector, stealers) else {
            break;
        };
        run_task(task, processor, reporter);
        processed += 1;
    }

    debug!("Worker {} stopped after {} tasks", index, processed);
}

/// Own queue first, then a batch from the injector, then a sibling
fn find_task<T>(local: &Worker<T>, injector: &Injector<T>, stealers: &[Stealer<T>]) -> Option<T> {
    local.pop().or_else(|| {
        iter::repeat_with(|| {
            injector
                .steal_batch_and_pop(local)
                .or_else(|| stealers.iter().map(Stealer::steal).collect())
        })
        .find(|steal| !steal.is_retry())
        .and_then(|steal| steal.success())
    })
}

fn run_task(task: ImageTask, processor: &dyn TaskProcessor, reporter: &ProgressReporter) {
    let path = task.source_path.clone();
    reporter.task_started(path.clone());

    let outcome = panic::catch_unwind(AssertUnwindSafe(|| processor.process(&task))).unwrap_or_else(|payload| {
        Err(IronPressError::panicked(
            panic_message(&*payload),
            Some(path.clone()),
        ))
    });

    match outcome {
        Ok(result) => reporter.on_task_complete(Ok(result)),
        Err(e) => {
            warn!("Failed to process {:?}: {}", path, e);
            reporter.on_task_complete(Err(TaskError::new(&path, &e)));
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}
