use crate::engine::cursor::Cursor;
use crate::engine::executor::{lock, ExecutorControl};
use crate::utils::error::{FedError, FedResult};
use async_trait::async_trait;
use futures_util::future::{BoxFuture, FutureExt};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Unit of work executed by a scheduler worker
#[async_trait]
pub trait ParallelTask<T: Send + 'static>: Send + Sync + 'static {
    /// Produce this task's sub-result
    async fn perform(&self) -> FedResult<Cursor<T>>;

    /// Executor receiving the result or error
    fn control(&self) -> &Arc<ExecutorControl<T>>;

    fn describe(&self) -> String;
}

type Job = BoxFuture<'static, ()>;

/// Deregisters the task and releases the executor's barrier, also when the
/// job is dropped before it ran
struct TaskGuard<T: Send + 'static> {
    control: Arc<ExecutorControl<T>>,
    task_id: u64,
}

impl<T: Send + 'static> Drop for TaskGuard<T> {
    fn drop(&mut self) {
        self.control.query_info().deregister_task(self.task_id);
        self.control.task_finished();
    }
}

#[derive(Debug, Default)]
struct SchedulerCounters {
    scheduled: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    cancelled: AtomicU64,
}

/// Point-in-time scheduler statistics
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulerStats {
    pub workers: usize,
    pub scheduled: u64,
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
}

/// Fixed-size worker pool draining an unbounded FIFO queue
pub struct Scheduler {
    name: String,
    worker_count: usize,
    sender: Mutex<Option<mpsc::UnboundedSender<Job>>>,
    receiver: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<Job>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    running: AtomicBool,
    counters: Arc<SchedulerCounters>,
}

impl Scheduler {
    /// Pool with at least one worker; nothing runs until [`Scheduler::start`]
    pub fn new(name: impl Into<String>, worker_count: usize) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        Self {
            name: name.into(),
            worker_count: worker_count.max(1),
            sender: Mutex::new(Some(sender)),
            receiver: Arc::new(tokio::sync::Mutex::new(receiver)),
            workers: Mutex::new(Vec::new()),
            running: AtomicBool::new(false),
            counters: Arc::new(SchedulerCounters::default()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn worker_count(&self) -> usize {
        self.worker_count
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Spawn the workers; must be called from within a tokio runtime
    pub fn start(&self) {
        if self.running.swap(true, Ordering::AcqRel) {
            return;
        }
        let mut workers = lock(&self.workers);
        for worker in 0..self.worker_count {
            let receiver = self.receiver.clone();
            let name = self.name.clone();
            workers.push(tokio::spawn(async move {
                loop {
                    let job = {
                        let mut queue = receiver.lock().await;
                        queue.recv().await
                    };
                    match job {
                        Some(job) => job.await,
                        None => break,
                    }
                }
                debug!(scheduler = %name, worker, "worker stopped");
            }));
        }
        info!(scheduler = %self.name, workers = self.worker_count, "scheduler started");
    }

    /// Enqueue a task; never blocks the caller
    pub fn schedule<T: Send + 'static>(&self, task: Arc<dyn ParallelTask<T>>) -> FedResult<()> {
        let sender = lock(&self.sender).clone().ok_or_else(|| {
            FedError::InternalScheduling(format!("scheduler {} is shut down", self.name))
        })?;

        let control = task.control().clone();
        let registration = control.query_info().register_task(control.token())?;
        control.task_scheduled();

        let guard = TaskGuard {
            control: control.clone(),
            task_id: registration.task_id,
        };
        let counters = self.counters.clone();
        let token = registration.token;

        let job: Job = async move {
            let _guard = guard;
            let outcome = tokio::select! {
                biased;
                _ = token.cancelled() => None,
                result = AssertUnwindSafe(task.perform()).catch_unwind() => Some(result),
            };
            match outcome {
                None => {
                    counters.cancelled.fetch_add(1, Ordering::Relaxed);
                    debug!(task = %task.describe(), "task cancelled");
                }
                Some(Ok(Ok(cursor))) => {
                    counters.completed.fetch_add(1, Ordering::Relaxed);
                    control.add_result(cursor).await;
                }
                Some(Ok(Err(e))) => {
                    counters.failed.fetch_add(1, Ordering::Relaxed);
                    control.toss(e);
                }
                Some(Err(_)) => {
                    counters.failed.fetch_add(1, Ordering::Relaxed);
                    error!(task = %task.describe(), "task panicked");
                    control.toss(FedError::InternalScheduling(format!(
                        "task {} panicked",
                        task.describe()
                    )));
                }
            }
        }
        .boxed();

        sender.send(job).map_err(|_| {
            FedError::InternalScheduling(format!("scheduler {} stopped accepting tasks", self.name))
        })?;
        self.counters.scheduled.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Snapshot of the pool counters
    pub fn stats(&self) -> SchedulerStats {
        SchedulerStats {
            workers: self.worker_count,
            scheduled: self.counters.scheduled.load(Ordering::Relaxed),
            completed: self.counters.completed.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
            cancelled: self.counters.cancelled.load(Ordering::Relaxed),
        }
    }

    /// Stop intake and interrupt running tasks; queued tasks are discarded
    pub async fn abort(&self, timeout: Duration) {
        self.running.store(false, Ordering::Release);
        lock(&self.sender).take();

        let mut handles: Vec<JoinHandle<()>> = lock(&self.workers).drain(..).collect();
        for handle in &handles {
            handle.abort();
        }
        let stopped = tokio::time::timeout(timeout, async {
            for handle in handles.iter_mut() {
                let _ = handle.await;
            }
        })
        .await
        .is_ok();
        if !stopped {
            warn!(scheduler = %self.name, "workers did not stop within {:?}", timeout);
        }

        if let Ok(mut queue) = tokio::time::timeout(timeout, self.receiver.lock()).await {
            queue.close();
            while let Ok(job) = queue.try_recv() {
                drop(job);
            }
        }
        info!(scheduler = %self.name, "scheduler aborted");
    }

    /// Stop intake and let workers drain the queue, bounded by `timeout`
    pub async fn shutdown(&self, timeout: Duration) {
        self.running.store(false, Ordering::Release);
        lock(&self.sender).take();

        let mut handles: Vec<JoinHandle<()>> = lock(&self.workers).drain(..).collect();
        let drained = tokio::time::timeout(timeout, async {
            for handle in handles.iter_mut() {
                let _ = handle.await;
            }
        })
        .await
        .is_ok();

        if drained {
            info!(scheduler = %self.name, "scheduler shut down");
        } else {
            warn!(scheduler = %self.name, "shutdown timed out after {:?}, aborting workers", timeout);
            for handle in &handles {
                handle.abort();
            }
        }
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("name", &self.name)
            .field("worker_count", &self.worker_count)
            .field("running", &self.is_running())
            .finish()
    }
}
