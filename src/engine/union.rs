use crate::algebra::pattern::StatementPattern;
use crate::algebra::plan::PlanNode;
use crate::endpoints::endpoint_trait::{Endpoint, StatementRequest};
use crate::engine::cursor::Cursor;
use crate::engine::executor::{ExecutorControl, ParallelExecutor};
use crate::engine::query_info::QueryInfo;
use crate::engine::scheduler::{ParallelTask, Scheduler};
use crate::engine::strategy::EvaluationStrategy;
use crate::utils::error::FedResult;
use crate::utils::types::{BindingSet, Term, Triple};
use async_trait::async_trait;
use std::sync::Arc;

/// Builds a task once the union's executor control exists
pub type TaskFactory<T> = Box<dyn FnOnce(Arc<ExecutorControl<T>>) -> Arc<dyn ParallelTask<T>> + Send>;

/// Union over concurrently evaluated branches.
///
/// Every branch is scheduled up front; results are concatenated in
/// completion order without deduplication.
pub struct ControlledWorkerUnion<T: Send + 'static> {
    scheduler: Arc<Scheduler>,
    factories: Vec<TaskFactory<T>>,
    label: String,
}

impl<T: Send + 'static> ControlledWorkerUnion<T> {
    pub fn new(scheduler: Arc<Scheduler>, label: impl Into<String>) -> Self {
        Self {
            scheduler,
            factories: Vec::new(),
            label: label.into(),
        }
    }

    /// Add a branch; the factory runs once the executor starts
    pub fn add_task<F>(&mut self, factory: F)
    where
        F: FnOnce(Arc<ExecutorControl<T>>) -> Arc<dyn ParallelTask<T>> + Send + 'static,
    {
        self.factories.push(Box::new(factory));
    }

    pub fn branch_count(&self) -> usize {
        self.factories.len()
    }
}

#[async_trait]
impl<T: Send + 'static> ParallelExecutor<T> for ControlledWorkerUnion<T> {
    async fn perform_execution(&mut self, control: &Arc<ExecutorControl<T>>) -> FedResult<()> {
        for factory in self.factories.drain(..) {
            control.check_active()?;
            if !control.is_active() {
                break;
            }
            self.scheduler.schedule(factory(control.clone()))?;
        }
        control.await_pending().await
    }

    fn describe(&self) -> String {
        format!("union {} ({} branches)", self.label, self.factories.len())
    }
}

/// Evaluates one union argument
pub struct UnionArgTask {
    pub strategy: EvaluationStrategy,
    pub node: Arc<PlanNode>,
    pub bindings: BindingSet,
    pub query_info: Arc<QueryInfo>,
    pub control: Arc<ExecutorControl<BindingSet>>,
}

#[async_trait]
impl ParallelTask<BindingSet> for UnionArgTask {
    async fn perform(&self) -> FedResult<Cursor<BindingSet>> {
        self.strategy
            .evaluate(self.node.clone(), self.bindings.clone(), self.query_info.clone())
            .await
    }

    fn control(&self) -> &Arc<ExecutorControl<BindingSet>> {
        &self.control
    }

    fn describe(&self) -> String {
        format!("UnionArg {}", self.node.label())
    }
}

/// Fetches a multi-source statement from one of its sources
pub struct StatementSourceTask {
    pub strategy: EvaluationStrategy,
    pub endpoint: Arc<dyn Endpoint>,
    pub request: StatementRequest,
    pub control: Arc<ExecutorControl<BindingSet>>,
}

#[async_trait]
impl ParallelTask<BindingSet> for StatementSourceTask {
    async fn perform(&self) -> FedResult<Cursor<BindingSet>> {
        let result = self.endpoint.get_statements(&self.request).await;
        self.strategy.repair_on_fault(result).await
    }

    fn control(&self) -> &Arc<ExecutorControl<BindingSet>> {
        &self.control
    }

    fn describe(&self) -> String {
        format!("StatementSource @{}", self.endpoint.id())
    }
}

/// Existence check of a fully bound pattern against one source; a match
/// yields the input bindings once
pub struct ExistenceCheckTask {
    pub strategy: EvaluationStrategy,
    pub endpoint: Arc<dyn Endpoint>,
    pub pattern: StatementPattern,
    pub bindings: BindingSet,
    pub control: Arc<ExecutorControl<BindingSet>>,
}

#[async_trait]
impl ParallelTask<BindingSet> for ExistenceCheckTask {
    async fn perform(&self) -> FedResult<Cursor<BindingSet>> {
        let result = self.endpoint.has_statements(&self.pattern, &self.bindings).await;
        if self.strategy.repair_on_fault(result).await? {
            Ok(Cursor::single(self.bindings.clone()))
        } else {
            Ok(Cursor::empty())
        }
    }

    fn control(&self) -> &Arc<ExecutorControl<BindingSet>> {
        &self.control
    }

    fn describe(&self) -> String {
        format!("ExistenceCheck @{}", self.endpoint.id())
    }
}

/// Triple retrieval from one source
pub struct GetStatementsTask {
    pub strategy: EvaluationStrategy,
    pub endpoint: Arc<dyn Endpoint>,
    pub subject: Option<Term>,
    pub predicate: Option<Term>,
    pub object: Option<Term>,
    pub control: Arc<ExecutorControl<Triple>>,
}

#[async_trait]
impl ParallelTask<Triple> for GetStatementsTask {
    async fn perform(&self) -> FedResult<Cursor<Triple>> {
        let result = self
            .endpoint
            .get_triples(self.subject.as_ref(), self.predicate.as_ref(), self.object.as_ref())
            .await;
        self.strategy.repair_on_fault(result).await
    }

    fn control(&self) -> &Arc<ExecutorControl<Triple>> {
        &self.control
    }

    fn describe(&self) -> String {
        format!("GetStatements @{}", self.endpoint.id())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algebra::tuple_expr::QueryType;
    use crate::engine::executor::{start_executor, ExecutorKind};
    use crate::utils::error::FedError;

    struct FixedTask {
        rows: Vec<u32>,
        delay_ms: u64,
        fail: bool,
        control: Arc<ExecutorControl<u32>>,
    }

    #[async_trait]
    impl ParallelTask<u32> for FixedTask {
        async fn perform(&self) -> FedResult<Cursor<u32>> {
            tokio::time::sleep(std::time::Duration::from_millis(self.delay_ms)).await;
            if self.fail {
                return Err(FedError::InternalScheduling("branch failed".into()));
            }
            Ok(Cursor::from_vec(self.rows.clone()))
        }

        fn control(&self) -> &Arc<ExecutorControl<u32>> {
            &self.control
        }

        fn describe(&self) -> String {
            "FixedTask".to_string()
        }
    }

    fn union_of(branches: Vec<(Vec<u32>, u64, bool)>, scheduler: Arc<Scheduler>) -> ControlledWorkerUnion<u32> {
        let mut union = ControlledWorkerUnion::new(scheduler, "test");
        for (rows, delay_ms, fail) in branches {
            union.add_task(move |control| {
                Arc::new(FixedTask { rows, delay_ms, fail, control }) as Arc<dyn ParallelTask<u32>>
            });
        }
        union
    }

    #[tokio::test]
    async fn test_union_concatenates_all_branches() {
        let scheduler = Arc::new(Scheduler::new("union", 4));
        scheduler.start();
        let union = union_of(vec![(vec![1, 2], 20, false), (vec![], 0, false), (vec![3], 5, false)], scheduler);
        assert_eq!(union.branch_count(), 3);

        let info = Arc::new(QueryInfo::new("q", QueryType::Select, None));
        let cursor = start_executor(union, ExecutorKind::Union, info, false);
        let mut rows = cursor.collect_all().await.unwrap();
        rows.sort();
        assert_eq!(rows, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_union_surfaces_branch_error() {
        let scheduler = Arc::new(Scheduler::new("union", 2));
        scheduler.start();
        let union = union_of(vec![(vec![1], 0, false), (vec![], 30, true)], scheduler);

        let info = Arc::new(QueryInfo::new("q", QueryType::Select, None));
        let result = start_executor(union, ExecutorKind::Union, info, false).collect_all().await;
        match result {
            Err(FedError::InternalScheduling(msg)) => assert_eq!(msg, "branch failed"),
            _ => panic!("Expected InternalScheduling error"),
        }
    }

    #[tokio::test]
    async fn test_first_result_only_short_circuits() {
        let scheduler = Arc::new(Scheduler::new("union", 4));
        scheduler.start();
        let union = union_of(vec![(vec![7], 0, false), (vec![8], 500, false)], scheduler);

        let info = Arc::new(QueryInfo::new("q", QueryType::Select, None));
        let started = std::time::Instant::now();
        let rows = start_executor(union, ExecutorKind::ExistenceCheck, info, true)
            .collect_all()
            .await
            .unwrap();
        assert_eq!(rows, vec![7]);
        assert!(started.elapsed() < std::time::Duration::from_millis(400));
    }
}
