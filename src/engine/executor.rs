use crate::engine::barrier::WaitGroup;
use crate::engine::cursor::Cursor;
use crate::engine::query_info::QueryInfo;
use crate::utils::error::{FedError, FedResult};
use async_trait::async_trait;
use futures_util::stream::{Stream, StreamExt};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{Context, Poll};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Capacity of the queue between sub-task results and the consumer
pub const RESULT_QUEUE_CAPACITY: usize = 1024;

static NEXT_EXECUTOR_ID: AtomicU64 = AtomicU64::new(1);

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Flavor of a parallel executor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutorKind {
    NestedLoopJoin,
    BoundJoin,
    Union,
    ExistenceCheck,
}

/// Producer-side handle shared by an executor and the tasks it schedules.
///
/// Tasks push their result cursors with [`add_result`](Self::add_result) or
/// report failure with [`toss`](Self::toss); the consumer sees results in
/// completion order followed by the first captured error.
pub struct ExecutorControl<T> {
    id: u64,
    kind: ExecutorKind,
    query_info: Arc<QueryInfo>,
    token: CancellationToken,
    sender: Mutex<Option<mpsc::Sender<Cursor<T>>>>,
    error: Mutex<Option<FedError>>,
    pending: WaitGroup,
    closed: AtomicBool,
    first_result_only: bool,
}

impl<T: Send + 'static> ExecutorControl<T> {
    pub fn new(
        kind: ExecutorKind,
        query_info: Arc<QueryInfo>,
        first_result_only: bool,
    ) -> (Arc<Self>, mpsc::Receiver<Cursor<T>>) {
        let (sender, receiver) = mpsc::channel(RESULT_QUEUE_CAPACITY);
        let control = Arc::new(Self {
            id: NEXT_EXECUTOR_ID.fetch_add(1, Ordering::Relaxed),
            kind,
            token: query_info.child_token(),
            query_info,
            sender: Mutex::new(Some(sender)),
            error: Mutex::new(None),
            pending: WaitGroup::new(),
            closed: AtomicBool::new(false),
            first_result_only,
        });
        (control, receiver)
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn kind(&self) -> ExecutorKind {
        self.kind
    }

    pub fn query_info(&self) -> &Arc<QueryInfo> {
        &self.query_info
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// False once cancelled or closed
    pub fn is_active(&self) -> bool {
        !self.token.is_cancelled() && !self.closed.load(Ordering::Acquire)
    }

    /// Fail when the query was aborted or ran past its deadline
    pub fn check_active(&self) -> FedResult<()> {
        self.query_info.check_aborted()?;
        self.query_info.check_timeout()
    }

    pub fn has_error(&self) -> bool {
        lock(&self.error).is_some()
    }

    /// Count a sub-task handed to a scheduler
    pub fn task_scheduled(&self) {
        self.pending.add(1);
    }

    pub fn task_finished(&self) {
        self.pending.done();
    }

    pub fn pending_tasks(&self) -> usize {
        self.pending.count()
    }

    /// Queue a completed sub-result; empty results are dropped
    pub async fn add_result(&self, mut cursor: Cursor<T>) {
        if cursor.is_known_empty() {
            return;
        }
        if !self.is_active() || self.has_error() {
            cursor.close();
            return;
        }
        let sender = match lock(&self.sender).clone() {
            Some(sender) => sender,
            None => {
                cursor.close();
                return;
            }
        };

        tokio::select! {
            biased;
            _ = self.token.cancelled() => {}
            sent = sender.send(cursor) => {
                if sent.is_err() {
                    debug!(executor = self.id, "consumer gone, discarding result");
                } else if self.first_result_only {
                    debug!(executor = self.id, "first result received, stopping production");
                    self.done();
                    self.token.cancel();
                }
            }
        }
    }

    /// Record a sub-task failure; the first error wins and production stops
    pub fn toss(&self, error: FedError) {
        if self.closed.load(Ordering::Acquire) {
            debug!(executor = self.id, error = %error, "ignoring error on closed executor");
            return;
        }
        {
            let mut slot = lock(&self.error);
            if slot.is_none() {
                debug!(executor = self.id, kind = ?self.kind, error = %error, "sub-task failed");
                *slot = Some(error);
            }
        }
        self.done();
        self.token.cancel();
    }

    /// First error tossed by a sub-task, if any
    pub fn take_error(&self) -> Option<FedError> {
        lock(&self.error).take()
    }

    /// Signal that no further results will be produced
    pub fn done(&self) {
        lock(&self.sender).take();
    }

    /// Wait for all scheduled sub-tasks, bounded by the query's remaining time
    pub async fn await_pending(&self) -> FedResult<()> {
        let remaining = self.query_info.remaining_time();
        tokio::select! {
            biased;
            _ = self.token.cancelled() => Ok(()),
            completed = self.pending.wait_timeout(remaining) => {
                if completed {
                    Ok(())
                } else {
                    let outstanding = self.pending.count();
                    self.query_info.abort();
                    Err(FedError::Timeout(format!(
                        "query {} timed out with {} outstanding sub-task(s)",
                        self.query_info.id(),
                        outstanding
                    )))
                }
            }
        }
    }

    fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.token.cancel();
            self.done();
        }
    }
}

/// Producer half of a parallel executor
#[async_trait]
pub trait ParallelExecutor<T: Send + 'static>: Send + 'static {
    /// Schedule sub-tasks and wait for them via the control
    async fn perform_execution(&mut self, control: &Arc<ExecutorControl<T>>) -> FedResult<()>;

    fn describe(&self) -> String;
}

/// Spawn the producer and return the consumer side as a cursor
pub fn start_executor<T, E>(
    executor: E,
    kind: ExecutorKind,
    query_info: Arc<QueryInfo>,
    first_result_only: bool,
) -> Cursor<T>
where
    T: Send + 'static,
    E: ParallelExecutor<T>,
{
    let (control, receiver) = ExecutorControl::new(kind, query_info, first_result_only);
    let producer_control = control.clone();

    let producer = tokio::spawn(async move {
        let mut executor = executor;
        let token = producer_control.token().clone();
        debug!(
            executor = producer_control.id(),
            query_id = producer_control.query_info().id(),
            "starting {}",
            executor.describe()
        );

        let outcome = tokio::select! {
            biased;
            _ = token.cancelled() => None,
            result = executor.perform_execution(&producer_control) => Some(result),
        };
        if let Some(result) = outcome {
            let result = result.and_then(|_| producer_control.query_info().check_timeout());
            if let Err(e) = result {
                producer_control.toss(e);
            }
        }
        producer_control.done();
    });

    Cursor::from_stream(ExecutorCursor {
        control,
        receiver,
        current: None,
        producer: Some(producer),
        finished: false,
    })
}

/// Consumer half: drains one queued sub-result at a time
pub struct ExecutorCursor<T: Send + 'static> {
    control: Arc<ExecutorControl<T>>,
    receiver: mpsc::Receiver<Cursor<T>>,
    current: Option<Cursor<T>>,
    producer: Option<JoinHandle<()>>,
    finished: bool,
}

impl<T: Send + 'static> Unpin for ExecutorCursor<T> {}

impl<T: Send + 'static> ExecutorCursor<T> {
    /// Stop the producer and release every buffered sub-result
    pub fn close(&mut self) {
        self.finished = true;
        self.control.close();
        if let Some(producer) = self.producer.take() {
            producer.abort();
        }
        if let Some(mut current) = self.current.take() {
            current.close();
        }
        self.receiver.close();
        while let Ok(mut queued) = self.receiver.try_recv() {
            queued.close();
        }
    }
}

impl<T: Send + 'static> Stream for ExecutorCursor<T> {
    type Item = FedResult<T>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        loop {
            if this.finished {
                return Poll::Ready(None);
            }

            if let Some(current) = this.current.as_mut() {
                match current.poll_next_unpin(cx) {
                    Poll::Ready(Some(Ok(item))) => return Poll::Ready(Some(Ok(item))),
                    Poll::Ready(Some(Err(e))) => {
                        this.close();
                        return Poll::Ready(Some(Err(e)));
                    }
                    Poll::Ready(None) => this.current = None,
                    Poll::Pending => return Poll::Pending,
                }
            }

            match this.receiver.poll_recv(cx) {
                Poll::Ready(Some(next)) => this.current = Some(next),
                Poll::Ready(None) => {
                    let error = this.control.take_error();
                    this.close();
                    return Poll::Ready(error.map(Err));
                }
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

impl<T: Send + 'static> Drop for ExecutorCursor<T> {
    fn drop(&mut self) {
        if !self.finished || self.producer.is_some() {
            self.close();
        }
    }
}
