use crate::algebra::tuple_expr::QueryType;
use crate::utils::error::{FedError, FedResult};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

static NEXT_QUERY_ID: AtomicU64 = AtomicU64::new(1);

/// Per-query execution context: identity, deadline and the registry of
/// scheduled tasks used for cancellation.
#[derive(Debug)]
pub struct QueryInfo {
    id: u64,
    query: String,
    query_type: QueryType,
    started_at: DateTime<Utc>,
    deadline: Option<Instant>,
    token: CancellationToken,
    tasks: DashMap<u64, CancellationToken>,
    next_task_id: AtomicU64,
    aborted: AtomicBool,
}

/// Registration of one scheduled task
#[derive(Debug, Clone)]
pub struct TaskRegistration {
    pub task_id: u64,
    pub token: CancellationToken,
}

impl QueryInfo {
    /// New query context; the deadline starts counting now
    pub fn new(query: impl Into<String>, query_type: QueryType, timeout: Option<Duration>) -> Self {
        Self {
            id: NEXT_QUERY_ID.fetch_add(1, Ordering::Relaxed),
            query: query.into(),
            query_type,
            started_at: Utc::now(),
            deadline: timeout.map(|t| Instant::now() + t),
            token: CancellationToken::new(),
            tasks: DashMap::new(),
            next_task_id: AtomicU64::new(1),
            aborted: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn query(&self) -> &str {
        &self.query
    }

    pub fn query_type(&self) -> QueryType {
        self.query_type
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Time left before the deadline; `None` when the query is unbounded
    pub fn remaining_time(&self) -> Option<Duration> {
        self.deadline
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }

    pub fn is_expired(&self) -> bool {
        matches!(self.deadline, Some(deadline) if Instant::now() >= deadline)
    }

    /// Fail with [`FedError::Timeout`] past the deadline
    pub fn check_timeout(&self) -> FedResult<()> {
        if self.is_expired() {
            return Err(FedError::Timeout(format!(
                "query {} exceeded its deadline",
                self.id
            )));
        }
        Ok(())
    }

    pub fn check_aborted(&self) -> FedResult<()> {
        if self.is_aborted() {
            return Err(FedError::Aborted(self.id));
        }
        Ok(())
    }

    /// Root cancellation token of the query
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Token cancelled together with the query
    pub fn child_token(&self) -> CancellationToken {
        self.token.child_token()
    }

    /// Register a task whose token descends from `parent`
    pub fn register_task(&self, parent: &CancellationToken) -> FedResult<TaskRegistration> {
        self.check_aborted()?;
        let task_id = self.next_task_id.fetch_add(1, Ordering::Relaxed);
        let token = parent.child_token();
        self.tasks.insert(task_id, token.clone());
        Ok(TaskRegistration { task_id, token })
    }

    pub fn deregister_task(&self, task_id: u64) {
        self.tasks.remove(&task_id);
    }

    pub fn scheduled_task_count(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::Acquire)
    }

    /// Cancel every task registered under this query
    pub fn abort(&self) {
        if self.aborted.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!(query_id = self.id, tasks = self.tasks.len(), "aborting query");
        for task in self.tasks.iter() {
            task.value().cancel();
        }
        self.token.cancel();
    }

    /// Release outstanding work after the consumer is done with the query
    pub fn close(&self) {
        if !self.token.is_cancelled() {
            self.token.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_query_ids_are_unique() {
        let a = QueryInfo::new("SELECT * WHERE { ?s ?p ?o }", QueryType::Select, None);
        let b = QueryInfo::new("ASK { ?s ?p ?o }", QueryType::Ask, None);
        assert_ne!(a.id(), b.id());
        assert_eq!(b.query_type(), QueryType::Ask);
        assert!(a.remaining_time().is_none());
        assert!(a.check_timeout().is_ok());
    }

    #[tokio::test]
    async fn test_deadline_expiry() {
        let info = QueryInfo::new("q", QueryType::Select, Some(Duration::from_millis(1)));
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert!(info.is_expired());
        assert_eq!(info.remaining_time(), Some(Duration::ZERO));
        match info.check_timeout() {
            Err(FedError::Timeout(_)) => {}
            _ => panic!("Expected Timeout error"),
        }
    }

    #[test]
    fn test_abort_cancels_registered_tasks() {
        let info = QueryInfo::new("q", QueryType::Select, None);
        let parent = info.child_token();
        let first = info.register_task(&parent).unwrap();
        let second = info.register_task(&parent).unwrap();
        assert_eq!(info.scheduled_task_count(), 2);

        info.abort();
        assert!(first.token.is_cancelled());
        assert!(second.token.is_cancelled());

        info.deregister_task(first.task_id);
        info.deregister_task(second.task_id);
        assert_eq!(info.scheduled_task_count(), 0);
    }

    #[test]
    fn test_register_after_abort_fails() {
        let info = QueryInfo::new("q", QueryType::Select, None);
        info.abort();
        match info.register_task(info.token()) {
            Err(FedError::Aborted(id)) => assert_eq!(id, info.id()),
            _ => panic!("Expected Aborted error"),
        }
    }
}
