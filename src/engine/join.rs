use crate::algebra::plan::{PlanNode, ServiceNode, StatementNode};
use crate::endpoints::endpoint_trait::{untag_row, BoundRequest, Endpoint};
use crate::engine::cursor::Cursor;
use crate::engine::executor::{ExecutorControl, ParallelExecutor};
use crate::engine::query_info::QueryInfo;
use crate::engine::scheduler::{ParallelTask, Scheduler};
use crate::engine::strategy::EvaluationStrategy;
use crate::utils::error::{EndpointError, FedError, FedResult};
use crate::utils::types::BindingSet;
use async_trait::async_trait;
use futures_util::future::join_all;
use futures_util::StreamExt;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, warn};

/// Block size used until more than [`SMALL_BLOCK_THRESHOLD`] bindings were consumed
pub const SMALL_BLOCK_SIZE: usize = 3;
pub const SMALL_BLOCK_THRESHOLD: usize = 10;

/// Tuple-at-a-time join: one task per left binding evaluating the right argument
pub struct ControlledWorkerJoin {
    strategy: EvaluationStrategy,
    scheduler: Arc<Scheduler>,
    left: Cursor<BindingSet>,
    right: Arc<PlanNode>,
    query_info: Arc<QueryInfo>,
}

impl ControlledWorkerJoin {
    pub fn new(
        strategy: EvaluationStrategy,
        left: Cursor<BindingSet>,
        right: Arc<PlanNode>,
        query_info: Arc<QueryInfo>,
    ) -> Self {
        Self {
            scheduler: strategy.join_scheduler().clone(),
            strategy,
            left,
            right,
            query_info,
        }
    }
}

fn schedule_nested_loop(
    strategy: &EvaluationStrategy,
    scheduler: &Scheduler,
    control: &Arc<ExecutorControl<BindingSet>>,
    right: &Arc<PlanNode>,
    bindings: BindingSet,
    query_info: &Arc<QueryInfo>,
) -> FedResult<()> {
    scheduler.schedule::<BindingSet>(Arc::new(JoinTask {
        strategy: strategy.clone(),
        right: right.clone(),
        bindings,
        query_info: query_info.clone(),
        control: control.clone(),
    }))
}

#[async_trait]
impl ParallelExecutor<BindingSet> for ControlledWorkerJoin {
    async fn perform_execution(&mut self, control: &Arc<ExecutorControl<BindingSet>>) -> FedResult<()> {
        while let Some(row) = self.left.next().await {
            let row = row?;
            control.check_active()?;
            if !control.is_active() {
                break;
            }
            schedule_nested_loop(&self.strategy, &self.scheduler, control, &self.right, row, &self.query_info)?;
        }
        control.await_pending().await
    }

    fn describe(&self) -> String {
        format!("nested loop join with {}", self.right.label())
    }
}

/// Strategy chosen from the first left binding
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BoundTaskKind {
    /// Statement with free variables left: one UNION request per block
    BoundJoin,
    /// Statement fully bound by the bindings: existence check per binding
    CheckJoin,
    /// SERVICE body instantiated per binding
    ServiceJoin,
    IndependentGroupJoin,
}

impl BoundTaskKind {
    /// Task kind for `right` under `first`; `None` when the shape cannot be batched
    pub fn choose(right: &PlanNode, first: &BindingSet, service_as_bound_join: bool) -> Option<Self> {
        match right {
            PlanNode::Statement(stmt) => Some(if stmt.has_free_vars_for(first) {
                BoundTaskKind::BoundJoin
            } else {
                BoundTaskKind::CheckJoin
            }),
            PlanNode::Service(service) if service_as_bound_join && service.bgp().is_some() => {
                Some(BoundTaskKind::ServiceJoin)
            }
            PlanNode::IndependentJoinGroup(_) => Some(BoundTaskKind::IndependentGroupJoin),
            _ => None,
        }
    }

    /// Whether the join with `right` may run as a bound join at all
    pub fn supports(right: &PlanNode, service_as_bound_join: bool) -> bool {
        match right {
            PlanNode::Statement(_) | PlanNode::IndependentJoinGroup(_) => true,
            PlanNode::Service(service) => service_as_bound_join && service.bgp().is_some(),
            _ => false,
        }
    }
}

/// Vectored join: left bindings are sent to the right argument in blocks.
///
/// The first binding goes alone; the following blocks hold
/// [`SMALL_BLOCK_SIZE`] bindings until more than [`SMALL_BLOCK_THRESHOLD`]
/// bindings were consumed, then the configured block size.
pub struct ControlledWorkerBoundJoin {
    strategy: EvaluationStrategy,
    scheduler: Arc<Scheduler>,
    left: Cursor<BindingSet>,
    right: Arc<PlanNode>,
    query_info: Arc<QueryInfo>,
    block_size: usize,
    service_as_bound_join: bool,
}

impl ControlledWorkerBoundJoin {
    /// Join `left` with `right`, block size taken from the configuration
    pub fn new(
        strategy: EvaluationStrategy,
        left: Cursor<BindingSet>,
        right: Arc<PlanNode>,
        query_info: Arc<QueryInfo>,
    ) -> Self {
        let config = strategy.config();
        Self {
            scheduler: strategy.join_scheduler().clone(),
            block_size: config.bound_join_block_size.max(1),
            service_as_bound_join: config.enable_service_as_bound_join,
            strategy,
            left,
            right,
            query_info,
        }
    }

    fn create_task(
        &self,
        kind: BoundTaskKind,
        bindings: Vec<BindingSet>,
        control: &Arc<ExecutorControl<BindingSet>>,
    ) -> Arc<dyn ParallelTask<BindingSet>> {
        let context = BoundTaskContext {
            strategy: self.strategy.clone(),
            right: self.right.clone(),
            bindings,
            control: control.clone(),
        };
        match kind {
            BoundTaskKind::BoundJoin => Arc::new(BoundJoinTask(context)),
            BoundTaskKind::CheckJoin => Arc::new(CheckJoinTask(context)),
            BoundTaskKind::ServiceJoin => Arc::new(ServiceJoinTask(context)),
            BoundTaskKind::IndependentGroupJoin => Arc::new(IndependentGroupJoinTask(context)),
        }
    }

    async fn nested_loop_rest(
        &mut self,
        first: BindingSet,
        control: &Arc<ExecutorControl<BindingSet>>,
    ) -> FedResult<()> {
        debug!(right = %self.right.label(), "bound join not applicable, joining tuple at a time");
        schedule_nested_loop(&self.strategy, &self.scheduler, control, &self.right, first, &self.query_info)?;
        while let Some(row) = self.left.next().await {
            let row = row?;
            control.check_active()?;
            if !control.is_active() {
                break;
            }
            schedule_nested_loop(&self.strategy, &self.scheduler, control, &self.right, row, &self.query_info)?;
        }
        Ok(())
    }
}

#[async_trait]
impl ParallelExecutor<BindingSet> for ControlledWorkerBoundJoin {
    async fn perform_execution(&mut self, control: &Arc<ExecutorControl<BindingSet>>) -> FedResult<()> {
        let first = match self.left.next().await {
            Some(row) => row?,
            None => return Ok(()),
        };
        control.check_active()?;

        let kind = match BoundTaskKind::choose(&self.right, &first, self.service_as_bound_join) {
            Some(kind) => kind,
            None => {
                self.nested_loop_rest(first, control).await?;
                return control.await_pending().await;
            }
        };

        self.scheduler.schedule(self.create_task(kind, vec![first], control))?;
        let mut total = 1usize;
        let mut blocks = 1usize;

        loop {
            let block_size = if total <= SMALL_BLOCK_THRESHOLD {
                SMALL_BLOCK_SIZE
            } else {
                self.block_size
            };
            let mut block = Vec::with_capacity(block_size);
            while block.len() < block_size {
                match self.left.next().await {
                    Some(row) => block.push(row?),
                    None => break,
                }
            }
            if block.is_empty() {
                break;
            }
            control.check_active()?;
            if !control.is_active() {
                break;
            }

            total += block.len();
            blocks += 1;
            let exhausted = block.len() < block_size;
            self.scheduler.schedule(self.create_task(kind, block, control))?;
            if exhausted {
                break;
            }
        }

        debug!(
            executor = control.id(),
            bindings = total,
            blocks,
            kind = ?kind,
            "bound join scheduled"
        );
        control.await_pending().await
    }

    fn describe(&self) -> String {
        format!("bound join with {}", self.right.label())
    }
}

/// Evaluates the right argument for a single left binding
pub struct JoinTask {
    strategy: EvaluationStrategy,
    right: Arc<PlanNode>,
    bindings: BindingSet,
    query_info: Arc<QueryInfo>,
    control: Arc<ExecutorControl<BindingSet>>,
}

#[async_trait]
impl ParallelTask<BindingSet> for JoinTask {
    async fn perform(&self) -> FedResult<Cursor<BindingSet>> {
        self.strategy
            .evaluate(self.right.clone(), self.bindings.clone(), self.query_info.clone())
            .await
    }

    fn control(&self) -> &Arc<ExecutorControl<BindingSet>> {
        &self.control
    }

    fn describe(&self) -> String {
        format!("Join {}", self.right.label())
    }
}

/// State shared by the bound join task flavors
pub struct BoundTaskContext {
    strategy: EvaluationStrategy,
    right: Arc<PlanNode>,
    bindings: Vec<BindingSet>,
    control: Arc<ExecutorControl<BindingSet>>,
}

impl BoundTaskContext {
    /// Tagged rows of every source of `stmt` for this block
    async fn fetch_tagged(&self, stmt: &StatementNode) -> FedResult<Vec<(usize, BindingSet)>> {
        let request = BoundRequest {
            patterns: vec![stmt.effective_pattern()],
            bindings: self.bindings.clone(),
            filter: stmt.filter.clone(),
        };
        let registry = self.strategy.registry();
        let endpoints = stmt
            .sources
            .iter()
            .map(|source| registry.get(&source.endpoint_id))
            .collect::<FedResult<Vec<Arc<dyn Endpoint>>>>()?;

        let request = &request;
        let responses = join_all(endpoints.iter().map(|endpoint| async move {
            let cursor = endpoint.get_bound_statements(request).await?;
            cursor.collect_all().await
        }))
        .await;

        let mut tagged = Vec::new();
        for response in responses {
            let rows = self.strategy.repair_on_fault(response).await?;
            tagged.extend(rows.into_iter().filter_map(untag_row));
        }
        Ok(tagged)
    }

    /// Merge tagged rows back into their originating bindings
    fn demultiplex(&self, tagged: Vec<(usize, BindingSet)>) -> Vec<BindingSet> {
        tagged
            .into_iter()
            .filter_map(|(index, row)| self.bindings.get(index)?.merge(&row))
            .collect()
    }

    fn statement(&self) -> Option<&StatementNode> {
        match self.right.as_ref() {
            PlanNode::Statement(stmt) => Some(stmt),
            _ => None,
        }
    }

    fn describe(&self, flavor: &str) -> String {
        format!("{} {} ({} bindings)", flavor, self.right.label(), self.bindings.len())
    }
}

fn unexpected_shape(context: &BoundTaskContext, flavor: &str) -> FedError {
    FedError::InternalScheduling(format!(
        "{} cannot evaluate {}",
        flavor,
        context.right.label()
    ))
}

pub struct BoundJoinTask(BoundTaskContext);

#[async_trait]
impl ParallelTask<BindingSet> for BoundJoinTask {
    async fn perform(&self) -> FedResult<Cursor<BindingSet>> {
        let stmt = self.0.statement().ok_or_else(|| unexpected_shape(&self.0, "BoundJoin"))?;
        let tagged = self.0.fetch_tagged(stmt).await?;
        Ok(Cursor::from_vec(self.0.demultiplex(tagged)))
    }

    fn control(&self) -> &Arc<ExecutorControl<BindingSet>> {
        &self.0.control
    }

    fn describe(&self) -> String {
        self.0.describe("BoundJoin")
    }
}

/// Existence check per binding; each confirmed binding is emitted once
pub struct CheckJoinTask(BoundTaskContext);

#[async_trait]
impl ParallelTask<BindingSet> for CheckJoinTask {
    async fn perform(&self) -> FedResult<Cursor<BindingSet>> {
        let stmt = self.0.statement().ok_or_else(|| unexpected_shape(&self.0, "CheckJoin"))?;
        let confirmed: BTreeSet<usize> = self
            .0
            .fetch_tagged(stmt)
            .await?
            .into_iter()
            .map(|(index, _)| index)
            .collect();
        let rows = confirmed
            .into_iter()
            .filter_map(|index| self.0.bindings.get(index).cloned())
            .collect();
        Ok(Cursor::from_vec(rows))
    }

    fn control(&self) -> &Arc<ExecutorControl<BindingSet>> {
        &self.0.control
    }

    fn describe(&self) -> String {
        self.0.describe("CheckJoin")
    }
}

pub struct ServiceJoinTask(BoundTaskContext);

impl ServiceJoinTask {
    async fn evaluate(&self, service: &ServiceNode) -> FedResult<Vec<BindingSet>> {
        let (patterns, filter) = service.bgp().ok_or_else(|| unexpected_shape(&self.0, "ServiceJoin"))?;
        let endpoint = self
            .0
            .strategy
            .registry()
            .resolve(&service.service_ref)
            .ok_or_else(|| EndpointError::UnknownEndpoint(service.service_ref.clone()))?;

        let request = BoundRequest {
            patterns,
            bindings: self.0.bindings.clone(),
            filter,
        };
        let rows = match endpoint.get_bound_statements(&request).await {
            Ok(cursor) => cursor.collect_all().await,
            Err(e) => Err(e),
        };
        let rows = self.0.strategy.repair_on_fault(rows).await?;
        Ok(self.0.demultiplex(rows.into_iter().filter_map(untag_row).collect()))
    }
}

#[async_trait]
impl ParallelTask<BindingSet> for ServiceJoinTask {
    async fn perform(&self) -> FedResult<Cursor<BindingSet>> {
        let service = match self.0.right.as_ref() {
            PlanNode::Service(service) => service,
            _ => return Err(unexpected_shape(&self.0, "ServiceJoin")),
        };
        match self.evaluate(service).await {
            Ok(rows) => Ok(Cursor::from_vec(rows)),
            Err(e) if service.silent => {
                warn!(service = %service.service_ref, error = %e, "silent service failed");
                Ok(Cursor::from_vec(self.0.bindings.clone()))
            }
            Err(e) => Err(e),
        }
    }

    fn control(&self) -> &Arc<ExecutorControl<BindingSet>> {
        &self.0.control
    }

    fn describe(&self) -> String {
        self.0.describe("ServiceJoin")
    }
}

/// Independent statements fetched per block, combined per binding
pub struct IndependentGroupJoinTask(BoundTaskContext);

#[async_trait]
impl ParallelTask<BindingSet> for IndependentGroupJoinTask {
    async fn perform(&self) -> FedResult<Cursor<BindingSet>> {
        let members = match self.0.right.as_ref() {
            PlanNode::IndependentJoinGroup(members) => members,
            _ => return Err(unexpected_shape(&self.0, "IndependentGroupJoin")),
        };

        let fetched = join_all(members.iter().map(|member| self.0.fetch_tagged(member))).await;
        let count = self.0.bindings.len();
        let mut per_member: Vec<Vec<Vec<BindingSet>>> = Vec::with_capacity(members.len());
        for result in fetched {
            let mut by_index = vec![Vec::new(); count];
            for (index, row) in result? {
                if let Some(slot) = by_index.get_mut(index) {
                    slot.push(row);
                }
            }
            per_member.push(by_index);
        }

        let mut rows = Vec::new();
        for (index, bindings) in self.0.bindings.iter().enumerate() {
            let mut partial = vec![bindings.clone()];
            for member_rows in &per_member {
                let mut next = Vec::new();
                for left in &partial {
                    for right in &member_rows[index] {
                        if let Some(merged) = left.merge(right) {
                            next.push(merged);
                        }
                    }
                }
                partial = next;
                if partial.is_empty() {
                    break;
                }
            }
            rows.extend(partial);
        }
        Ok(Cursor::from_vec(rows))
    }

    fn control(&self) -> &Arc<ExecutorControl<BindingSet>> {
        &self.0.control
    }

    fn describe(&self) -> String {
        self.0.describe("IndependentGroupJoin")
    }
}
