use crate::algebra::expr::ValueExpr;
use crate::algebra::pattern::StatementPattern;
use crate::algebra::plan::{ExclusiveGroup, PlanNode, ServiceNode, SourceKind, StatementNode};
use crate::endpoints::endpoint_trait::{Endpoint, EndpointRegistry, StatementRequest};
use crate::endpoints::query_string;
use crate::engine::cursor::Cursor;
use crate::engine::executor::{start_executor, ExecutorKind};
use crate::engine::federation::FederationContext;
use crate::engine::join::{BoundTaskKind, ControlledWorkerBoundJoin, ControlledWorkerJoin};
use crate::engine::query_info::QueryInfo;
use crate::engine::scheduler::{ParallelTask, Scheduler};
use crate::engine::union::{ControlledWorkerUnion, ExistenceCheckTask, StatementSourceTask, UnionArgTask};
use crate::utils::config::FederationConfig;
use crate::utils::error::{EndpointError, FedResult};
use crate::utils::types::BindingSet;
use futures_util::future::{join_all, BoxFuture, FutureExt};
use futures_util::stream::{self, StreamExt};
use std::sync::Arc;
use tracing::{debug, warn};

/// Evaluates plan nodes against the federation members.
///
/// Every cursor produced here yields rows that include the input bindings.
#[derive(Clone)]
pub struct EvaluationStrategy {
    ctx: Arc<FederationContext>,
}

impl EvaluationStrategy {
    pub fn new(ctx: Arc<FederationContext>) -> Self {
        Self { ctx }
    }

    pub fn config(&self) -> &FederationConfig {
        &self.ctx.config
    }

    pub fn registry(&self) -> &Arc<EndpointRegistry> {
        &self.ctx.registry
    }

    /// Pool running join sub-tasks
    pub fn join_scheduler(&self) -> &Arc<Scheduler> {
        &self.ctx.join_scheduler
    }

    pub fn union_scheduler(&self) -> &Arc<Scheduler> {
        &self.ctx.union_scheduler
    }

    /// Ask the registry to repair the endpoint behind a connection fault.
    /// The result is returned unchanged.
    pub async fn repair_on_fault<T>(&self, result: FedResult<T>) -> FedResult<T> {
        if let Err(e) = &result {
            if e.is_connection_fault() {
                if let Some(endpoint_id) = e.endpoint_id() {
                    self.ctx.registry.repair_connection(endpoint_id).await;
                }
            }
        }
        result
    }

    /// Evaluate `node` with `bindings` substituted
    pub fn evaluate(
        &self,
        node: Arc<PlanNode>,
        bindings: BindingSet,
        query_info: Arc<QueryInfo>,
    ) -> BoxFuture<'static, FedResult<Cursor<BindingSet>>> {
        let strategy = self.clone();
        async move {
            query_info.check_aborted()?;
            query_info.check_timeout()?;
            let result = strategy.evaluate_node(&node, bindings, &query_info).await;
            strategy.repair_on_fault(result).await
        }
        .boxed()
    }

    async fn evaluate_node(
        &self,
        node: &Arc<PlanNode>,
        bindings: BindingSet,
        query_info: &Arc<QueryInfo>,
    ) -> FedResult<Cursor<BindingSet>> {
        match node.as_ref() {
            PlanNode::Statement(stmt) => self.evaluate_statement(stmt, bindings, query_info).await,
            PlanNode::ExclusiveGroup(group) => self.evaluate_group(group, bindings).await,
            PlanNode::NJoin { args, .. } => self.evaluate_join(args, bindings, query_info).await,
            PlanNode::NUnion(args) => Ok(self.evaluate_union(args, bindings, query_info)),
            PlanNode::Service(service) => self.evaluate_service(service, bindings).await,
            PlanNode::IndependentJoinGroup(members) => {
                self.evaluate_independent_group(members, bindings, query_info).await
            }
            PlanNode::SingleSourceQuery { endpoint_id, query } => {
                let endpoint = self.ctx.registry.get(endpoint_id)?;
                let text = query_string::render_query(query)?;
                debug!(endpoint = %endpoint_id, query_id = query_info.id(), "single source pass-through");
                endpoint.evaluate_query(&text, &bindings).await
            }
            PlanNode::Empty => Ok(Cursor::empty()),
            PlanNode::Filter { condition, arg } => {
                let condition = condition.clone();
                let cursor = self.evaluate_child(arg, bindings, query_info).await?;
                Ok(cursor.filter_ok(move |row| condition.passes(row)))
            }
            PlanNode::LeftJoin { left, right, condition } => {
                self.evaluate_left_join(left, right, condition.clone(), bindings, query_info)
                    .await
            }
            PlanNode::Projection { vars, inserted, arg } => {
                let cursor = self.evaluate_child(arg, bindings.clone(), query_info).await?;
                let vars = vars.clone();
                let inserted = inserted.clone();
                Ok(cursor.map_ok(move |row| {
                    let mut row = row;
                    for (name, value) in inserted.iter() {
                        row.insert(name.clone(), value.clone());
                    }
                    let projected = row.project(&vars);
                    match bindings.merge(&projected) {
                        Some(merged) => merged,
                        None => projected,
                    }
                }))
            }
            PlanNode::Slice { offset, limit, arg } => {
                let cursor = self.evaluate_child(arg, bindings, query_info).await?;
                Ok(cursor.slice(*offset, *limit))
            }
            PlanNode::Distinct(arg) => Ok(self.evaluate_child(arg, bindings, query_info).await?.distinct()),
        }
    }

    fn evaluate_child(
        &self,
        child: &PlanNode,
        bindings: BindingSet,
        query_info: &Arc<QueryInfo>,
    ) -> BoxFuture<'static, FedResult<Cursor<BindingSet>>> {
        self.evaluate(Arc::new(child.clone()), bindings, query_info.clone())
    }

    fn endpoint(&self, endpoint_id: &str) -> FedResult<Arc<dyn Endpoint>> {
        self.ctx.registry.get(endpoint_id)
    }

    async fn evaluate_statement(
        &self,
        stmt: &StatementNode,
        bindings: BindingSet,
        query_info: &Arc<QueryInfo>,
    ) -> FedResult<Cursor<BindingSet>> {
        if stmt.sources.is_empty() {
            return Ok(Cursor::empty());
        }
        let pattern = stmt.effective_pattern();

        if !pattern.has_free_vars(&bindings) {
            if let Some(filter) = &stmt.filter {
                if !filter.passes(&bindings) {
                    return Ok(Cursor::empty());
                }
            }
            return self.check_statement(stmt, pattern, bindings, query_info).await;
        }

        let projection = Self::projection(pattern.free_vars(&bindings), &stmt.local_vars);
        let request = StatementRequest::new(vec![pattern], bindings)
            .with_filter(stmt.filter.clone())
            .with_projection(projection);

        match stmt.kind() {
            SourceKind::Exclusive => {
                let endpoint = self.endpoint(&stmt.sources[0].endpoint_id)?;
                endpoint.get_statements(&request).await
            }
            SourceKind::MultiSource => {
                let mut union = ControlledWorkerUnion::new(self.union_scheduler().clone(), format!("statement #{}", stmt.id));
                for source in &stmt.sources {
                    let endpoint = self.endpoint(&source.endpoint_id)?;
                    let strategy = self.clone();
                    let request = request.clone();
                    union.add_task(move |control| {
                        Arc::new(StatementSourceTask { strategy, endpoint, request, control })
                            as Arc<dyn ParallelTask<BindingSet>>
                    });
                }
                Ok(start_executor(union, ExecutorKind::Union, query_info.clone(), false))
            }
        }
    }

    /// Existence check of a fully bound statement
    async fn check_statement(
        &self,
        stmt: &StatementNode,
        pattern: StatementPattern,
        bindings: BindingSet,
        query_info: &Arc<QueryInfo>,
    ) -> FedResult<Cursor<BindingSet>> {
        match stmt.kind() {
            SourceKind::Exclusive => {
                let endpoint = self.endpoint(&stmt.sources[0].endpoint_id)?;
                if endpoint.has_statements(&pattern, &bindings).await? {
                    Ok(Cursor::single(bindings))
                } else {
                    Ok(Cursor::empty())
                }
            }
            SourceKind::MultiSource => {
                let mut union =
                    ControlledWorkerUnion::new(self.union_scheduler().clone(), format!("check #{}", stmt.id));
                for source in &stmt.sources {
                    let endpoint = self.endpoint(&source.endpoint_id)?;
                    let strategy = self.clone();
                    let pattern = pattern.clone();
                    let bindings = bindings.clone();
                    union.add_task(move |control| {
                        Arc::new(ExistenceCheckTask { strategy, endpoint, pattern, bindings, control })
                            as Arc<dyn ParallelTask<BindingSet>>
                    });
                }
                let cursor = start_executor(union, ExecutorKind::ExistenceCheck, query_info.clone(), true);
                Ok(cursor.slice(0, Some(1)))
            }
        }
    }

    /// Variables to request from the endpoint; `None` when nothing can be dropped
    fn projection(free_vars: Vec<String>, local_vars: &[String]) -> Option<Vec<String>> {
        if local_vars.is_empty() {
            return None;
        }
        Some(free_vars.into_iter().filter(|v| !local_vars.contains(v)).collect())
    }

    async fn evaluate_group(&self, group: &ExclusiveGroup, bindings: BindingSet) -> FedResult<Cursor<BindingSet>> {
        let endpoint = self.endpoint(&group.owner.endpoint_id)?;
        let patterns: Vec<StatementPattern> = group.patterns().iter().map(|p| p.bind(&bindings)).collect();

        if patterns.iter().all(|p| !p.has_free_vars(&BindingSet::new())) {
            if let Some(filter) = &group.filter {
                if !filter.passes(&bindings) {
                    return Ok(Cursor::empty());
                }
            }
            for pattern in &patterns {
                let found = endpoint.has_statements(pattern, &BindingSet::new()).await;
                if !self.repair_on_fault(found).await? {
                    return Ok(Cursor::empty());
                }
            }
            return Ok(Cursor::single(bindings));
        }

        let mut free_vars = Vec::new();
        for pattern in &patterns {
            for var in pattern.vars() {
                if !free_vars.contains(&var) {
                    free_vars.push(var);
                }
            }
        }
        let request = StatementRequest::new(group.patterns(), bindings)
            .with_filter(group.filter.clone())
            .with_projection(Self::projection(free_vars, &group.local_vars()));
        endpoint.get_statements(&request).await
    }

    async fn evaluate_join(
        &self,
        args: &[PlanNode],
        bindings: BindingSet,
        query_info: &Arc<QueryInfo>,
    ) -> FedResult<Cursor<BindingSet>> {
        let (first, rest) = match args.split_first() {
            Some(split) => split,
            None => return Ok(Cursor::single(bindings)),
        };
        let mut cursor = self.evaluate_child(first, bindings, query_info).await?;
        let service_as_bound_join = self.config().enable_service_as_bound_join;

        for arg in rest {
            if cursor.is_known_empty() {
                return Ok(Cursor::empty());
            }
            let right = Arc::new(arg.clone());
            cursor = if BoundTaskKind::supports(&right, service_as_bound_join) {
                let join = ControlledWorkerBoundJoin::new(self.clone(), cursor, right, query_info.clone());
                start_executor(join, ExecutorKind::BoundJoin, query_info.clone(), false)
            } else {
                let join = ControlledWorkerJoin::new(self.clone(), cursor, right, query_info.clone());
                start_executor(join, ExecutorKind::NestedLoopJoin, query_info.clone(), false)
            };
        }
        Ok(cursor)
    }

    fn evaluate_union(&self, args: &[PlanNode], bindings: BindingSet, query_info: &Arc<QueryInfo>) -> Cursor<BindingSet> {
        let mut union = ControlledWorkerUnion::new(self.union_scheduler().clone(), format!("NUnion[{}]", args.len()));
        for arg in args {
            let task_strategy = self.clone();
            let node = Arc::new(arg.clone());
            let bindings = bindings.clone();
            let task_info = query_info.clone();
            union.add_task(move |control| {
                Arc::new(UnionArgTask {
                    strategy: task_strategy,
                    node,
                    bindings,
                    query_info: task_info,
                    control,
                }) as Arc<dyn ParallelTask<BindingSet>>
            });
        }
        start_executor(union, ExecutorKind::Union, query_info.clone(), false)
    }

    async fn evaluate_service(&self, service: &ServiceNode, bindings: BindingSet) -> FedResult<Cursor<BindingSet>> {
        let result = match self.ctx.registry.resolve(&service.service_ref) {
            Some(endpoint) => self.evaluate_service_at(endpoint, service, &bindings).await,
            None => Err(EndpointError::UnknownEndpoint(service.service_ref.clone()).into()),
        };
        match result {
            Err(e) if service.silent => {
                warn!(service = %service.service_ref, error = %e, "silent service failed");
                Ok(Cursor::single(bindings))
            }
            other => other,
        }
    }

    async fn evaluate_service_at(
        &self,
        endpoint: Arc<dyn Endpoint>,
        service: &ServiceNode,
        bindings: &BindingSet,
    ) -> FedResult<Cursor<BindingSet>> {
        if let Some((patterns, filter)) = service.bgp() {
            if patterns.iter().any(|p| p.has_free_vars(bindings)) {
                let request = StatementRequest::new(patterns, bindings.clone()).with_filter(filter);
                return endpoint.get_statements(&request).await;
            }
            if let Some(filter) = &filter {
                if !filter.passes(bindings) {
                    return Ok(Cursor::empty());
                }
            }
            for pattern in &patterns {
                if !endpoint.has_statements(pattern, bindings).await? {
                    return Ok(Cursor::empty());
                }
            }
            return Ok(Cursor::single(bindings.clone()));
        }

        if !endpoint.capabilities().supports_prepared_queries {
            return Err(EndpointError::Unsupported {
                endpoint_id: endpoint.id().to_string(),
                operation: "SERVICE with a non basic graph pattern body".to_string(),
            }
            .into());
        }
        let text = format!("SELECT * WHERE {{ {} }}", query_string::render_group(&service.expr)?);
        endpoint.evaluate_query(&text, bindings).await
    }

    async fn evaluate_independent_group(
        &self,
        members: &[StatementNode],
        bindings: BindingSet,
        query_info: &Arc<QueryInfo>,
    ) -> FedResult<Cursor<BindingSet>> {
        let evaluations = members.iter().map(|member| {
            let node = Arc::new(PlanNode::Statement(member.clone()));
            let cursor = self.evaluate(node, bindings.clone(), query_info.clone());
            async move {
                match cursor.await {
                    Ok(cursor) => cursor.collect_all().await,
                    Err(e) => Err(e),
                }
            }
        });

        let mut partial = vec![bindings.clone()];
        for rows in join_all(evaluations).await {
            let rows = rows?;
            let mut next = Vec::new();
            for left in &partial {
                for right in &rows {
                    if let Some(merged) = left.merge(right) {
                        next.push(merged);
                    }
                }
            }
            partial = next;
        }
        Ok(Cursor::from_vec(partial))
    }

    async fn evaluate_left_join(
        &self,
        left: &PlanNode,
        right: &PlanNode,
        condition: Option<ValueExpr>,
        bindings: BindingSet,
        query_info: &Arc<QueryInfo>,
    ) -> FedResult<Cursor<BindingSet>> {
        let left_cursor = self.evaluate_child(left, bindings, query_info).await?;
        let right = Arc::new(right.clone());
        let strategy = self.clone();
        let query_info = query_info.clone();

        let rows = left_cursor
            .then(move |row| {
                optional_matches(
                    strategy.clone(),
                    right.clone(),
                    condition.clone(),
                    row,
                    query_info.clone(),
                )
            })
            .flat_map(|result| {
                let items: Vec<FedResult<BindingSet>> = match result {
                    Ok(rows) => rows.into_iter().map(Ok).collect(),
                    Err(e) => vec![Err(e)],
                };
                stream::iter(items)
            });
        Ok(Cursor::from_stream(rows))
    }
}

/// Rows of the optional side for one left row, or the left row alone
async fn optional_matches(
    strategy: EvaluationStrategy,
    right: Arc<PlanNode>,
    condition: Option<ValueExpr>,
    row: FedResult<BindingSet>,
    query_info: Arc<QueryInfo>,
) -> FedResult<Vec<BindingSet>> {
    let row = row?;
    let matches = strategy
        .evaluate(right, row.clone(), query_info)
        .await?
        .collect_all()
        .await?;
    let matches: Vec<BindingSet> = match &condition {
        Some(condition) => matches.into_iter().filter(|m| condition.passes(m)).collect(),
        None => matches,
    };
    Ok(if matches.is_empty() { vec![row] } else { matches })
}

impl std::fmt::Debug for EvaluationStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EvaluationStrategy")
            .field("endpoints", &self.ctx.registry.len())
            .finish()
    }
}
