use crate::algebra::pattern::StatementPattern;
use crate::algebra::plan::PlanNode;
use crate::algebra::tuple_expr::{ParsedQuery, QueryType};
use crate::endpoints::endpoint_trait::{Endpoint, EndpointRegistry};
use crate::engine::cache::{CacheStats, SourceSelectionCache};
use crate::engine::cursor::Cursor;
use crate::engine::executor::{start_executor, ExecutorKind};
use crate::engine::query_info::QueryInfo;
use crate::engine::scheduler::{ParallelTask, Scheduler, SchedulerStats};
use crate::engine::source_selection::SourceSelector;
use crate::engine::strategy::EvaluationStrategy;
use crate::engine::union::{ControlledWorkerUnion, GetStatementsTask};
use crate::optimizer;
use crate::utils::{
    config::FederationConfig,
    error::{EndpointError, FedError, FedResult},
    types::{BindingSet, Term, Triple},
};
use futures_util::stream::{Stream, StreamExt};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::time::Sleep;
use tracing::{debug, info, warn};

/// Shared state of one federation: members, cache and worker pools
pub struct FederationContext {
    pub config: FederationConfig,
    pub registry: Arc<EndpointRegistry>,
    pub cache: Arc<SourceSelectionCache>,
    pub join_scheduler: Arc<Scheduler>,
    pub union_scheduler: Arc<Scheduler>,
}

impl FederationContext {
    pub fn new(config: FederationConfig) -> Self {
        Self {
            registry: Arc::new(EndpointRegistry::new()),
            cache: Arc::new(SourceSelectionCache::new(config.cache_ttl())),
            join_scheduler: Arc::new(Scheduler::new("join", config.join_worker_threads)),
            union_scheduler: Arc::new(Scheduler::new("union", config.union_worker_threads)),
            config,
        }
    }

    /// Source selector sharing this federation's registry and cache
    pub fn source_selector(&self) -> SourceSelector {
        SourceSelector::new(
            self.registry.clone(),
            self.cache.clone(),
            self.config.source_selection.clone(),
        )
    }
}

/// Builder for creating Federation instances
pub struct FederationBuilder {
    config: FederationConfig,
    endpoints: Vec<Arc<dyn Endpoint>>,
}

impl FederationBuilder {
    pub fn new() -> Self {
        Self {
            config: FederationConfig::default(),
            endpoints: Vec::new(),
        }
    }

    pub fn with_config(mut self, config: FederationConfig) -> Self {
        self.config = config;
        self
    }

    /// Add a member; ids must be unique
    pub fn with_endpoint(mut self, endpoint: Arc<dyn Endpoint>) -> Self {
        self.endpoints.push(endpoint);
        self
    }

    /// Build the federation; call [`Federation::initialize`] before querying
    pub fn build(self) -> FedResult<Federation> {
        self.config.validate()?;
        let ctx = Arc::new(FederationContext::new(self.config));
        for endpoint in self.endpoints {
            ctx.registry.register(endpoint)?;
        }
        Ok(Federation {
            strategy: EvaluationStrategy::new(ctx.clone()),
            ctx,
            initialized: AtomicBool::new(false),
        })
    }
}

impl Default for FederationBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Federated query engine over a set of endpoints
pub struct Federation {
    ctx: Arc<FederationContext>,
    strategy: EvaluationStrategy,
    initialized: AtomicBool,
}

impl Federation {
    pub fn builder() -> FederationBuilder {
        FederationBuilder::new()
    }

    /// Initialize every endpoint and start the worker pools
    pub async fn initialize(&self) -> FedResult<()> {
        if self.initialized.load(Ordering::Acquire) {
            return Ok(());
        }
        for endpoint in self.ctx.registry.list() {
            endpoint.initialize().await?;
        }
        self.ctx.join_scheduler.start();
        self.ctx.union_scheduler.start();
        self.initialized.store(true, Ordering::Release);
        info!(
            endpoints = self.ctx.registry.len(),
            join_workers = self.ctx.config.join_worker_threads,
            union_workers = self.ctx.config.union_worker_threads,
            "federation initialized"
        );
        Ok(())
    }

    /// Stop the worker pools and shut every endpoint down
    pub async fn shutdown(&self) -> FedResult<()> {
        if !self.initialized.swap(false, Ordering::AcqRel) {
            return Ok(());
        }
        let timeout = self.ctx.config.shutdown_timeout();
        self.ctx.join_scheduler.shutdown(timeout).await;
        self.ctx.union_scheduler.shutdown(timeout).await;
        for endpoint in self.ctx.registry.list() {
            if let Err(e) = endpoint.shutdown().await {
                warn!(endpoint = %endpoint.id(), error = %e, "endpoint shutdown failed");
            }
        }
        info!("federation shut down");
        Ok(())
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    pub fn context(&self) -> &Arc<FederationContext> {
        &self.ctx
    }

    pub fn config(&self) -> &FederationConfig {
        &self.ctx.config
    }

    pub fn registry(&self) -> &Arc<EndpointRegistry> {
        &self.ctx.registry
    }

    /// Register a member at runtime and forget cached sources for its id
    pub async fn add_endpoint(&self, endpoint: Arc<dyn Endpoint>) -> FedResult<()> {
        if self.is_initialized() {
            endpoint.initialize().await?;
        }
        let id = endpoint.id().to_string();
        self.ctx.registry.register(endpoint)?;
        self.ctx.cache.invalidate_endpoint(&id);
        info!(endpoint = %id, "endpoint added");
        Ok(())
    }

    /// Unregister a member and shut it down
    pub async fn remove_endpoint(&self, endpoint_id: &str) -> FedResult<Arc<dyn Endpoint>> {
        let endpoint = self
            .ctx
            .registry
            .unregister(endpoint_id)
            .ok_or_else(|| EndpointError::UnknownEndpoint(endpoint_id.to_string()))?;
        self.ctx.cache.invalidate_endpoint(endpoint_id);
        if self.is_initialized() {
            if let Err(e) = endpoint.shutdown().await {
                warn!(endpoint = %endpoint_id, error = %e, "endpoint shutdown failed");
            }
        }
        info!(endpoint = %endpoint_id, "endpoint removed");
        Ok(endpoint)
    }

    /// Forget all source selection results
    pub fn clear_cache(&self) {
        self.ctx.cache.clear();
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.ctx.cache.stats()
    }

    /// Join and union pool statistics
    pub fn scheduler_stats(&self) -> (SchedulerStats, SchedulerStats) {
        (self.ctx.join_scheduler.stats(), self.ctx.union_scheduler.stats())
    }

    fn ensure_initialized(&self) -> FedResult<()> {
        if self.is_initialized() {
            Ok(())
        } else {
            Err(FedError::Configuration(
                "federation is not initialized".to_string(),
            ))
        }
    }

    /// Fresh query context carrying the configured timeout
    pub fn new_query_info(&self, query: &ParsedQuery) -> Arc<QueryInfo> {
        Arc::new(QueryInfo::new(
            query.text.clone(),
            query.query_type,
            self.ctx.config.query_timeout(),
        ))
    }

    /// Run the optimizer pipeline under an existing query context
    pub async fn optimize(&self, query: &ParsedQuery, query_info: &Arc<QueryInfo>) -> FedResult<PlanNode> {
        optimizer::optimize(&self.ctx, query, query_info).await
    }

    /// Executable plan of `query`, for inspection
    pub async fn prepare(&self, query: &ParsedQuery) -> FedResult<PlanNode> {
        let query_info = self.new_query_info(query);
        let plan = self.optimize(query, &query_info).await;
        query_info.close();
        plan
    }

    /// Evaluate a query; rows are pulled lazily from the returned cursor
    pub async fn evaluate(&self, query: &ParsedQuery) -> FedResult<QueryCursor> {
        self.ensure_initialized()?;
        match query.query_type {
            QueryType::Select | QueryType::Ask => {}
            other => {
                return Err(FedError::MalformedQuery(format!(
                    "{:?} queries are not supported",
                    other
                )))
            }
        }

        let query_info = self.new_query_info(query);
        if self.ctx.config.log_queries {
            info!(
                query_id = query_info.id(),
                query_type = ?query.query_type,
                started_at = %query_info.started_at(),
                query = %query.text,
                "evaluating query"
            );
        }

        let plan = match self.optimize(query, &query_info).await {
            Ok(plan) => plan,
            Err(e) => {
                query_info.abort();
                return Err(e);
            }
        };
        debug!(query_id = query_info.id(), plan = %plan.label(), "plan ready");
        Ok(self.start_evaluation(Arc::new(plan), BindingSet::new(), query_info, query.query_type))
    }

    /// Evaluate a prepared plan with initial bindings
    pub fn evaluate_plan(
        &self,
        plan: Arc<PlanNode>,
        bindings: BindingSet,
        query_info: Arc<QueryInfo>,
    ) -> FedResult<QueryCursor> {
        self.ensure_initialized()?;
        let query_type = query_info.query_type();
        Ok(self.start_evaluation(plan, bindings, query_info, query_type))
    }

    fn start_evaluation(
        &self,
        plan: Arc<PlanNode>,
        bindings: BindingSet,
        query_info: Arc<QueryInfo>,
        query_type: QueryType,
    ) -> QueryCursor {
        let evaluation = self.strategy.evaluate(plan, bindings, query_info.clone());
        let rows = futures_util::stream::once(evaluation)
            .map(|result| match result {
                Ok(cursor) => cursor,
                Err(e) => Cursor::from_stream(futures_util::stream::iter(vec![Err(e)])),
            })
            .flatten();
        let mut cursor = Cursor::from_stream(rows);
        if query_type == QueryType::Ask {
            cursor = cursor.slice(0, Some(1)).map_ok(|_| BindingSet::new());
        }
        QueryCursor::new(cursor, query_info)
    }

    /// Triples matching the given positions across all members
    pub async fn get_statements(
        &self,
        subject: Option<Term>,
        predicate: Option<Term>,
        object: Option<Term>,
    ) -> FedResult<Cursor<Triple>> {
        self.ensure_initialized()?;
        let pattern = StatementPattern::from_positions(subject.as_ref(), predicate.as_ref(), object.as_ref());
        let query_info = Arc::new(QueryInfo::new(
            format!("getStatements({})", pattern),
            QueryType::Select,
            self.ctx.config.query_timeout(),
        ));
        let sources = self
            .ctx
            .source_selector()
            .select_for_pattern(&pattern, &query_info)
            .await?;

        if let (Some(s), Some(p), Some(o)) = (&subject, &predicate, &object) {
            // Source selection already ran the existence checks
            return Ok(if sources.is_empty() {
                Cursor::empty()
            } else {
                Cursor::single(Triple::new(s.clone(), p.clone(), o.clone()))
            });
        }

        match sources.as_slice() {
            [] => Ok(Cursor::empty()),
            [single] => {
                let endpoint = self.ctx.registry.get(&single.endpoint_id)?;
                let result = endpoint
                    .get_triples(subject.as_ref(), predicate.as_ref(), object.as_ref())
                    .await;
                self.strategy.repair_on_fault(result).await
            }
            _ => {
                let mut union = ControlledWorkerUnion::new(self.ctx.union_scheduler.clone(), "getStatements");
                for source in &sources {
                    let endpoint = self.ctx.registry.get(&source.endpoint_id)?;
                    let strategy = self.strategy.clone();
                    let (subject, predicate, object) = (subject.clone(), predicate.clone(), object.clone());
                    union.add_task(move |control| {
                        Arc::new(GetStatementsTask {
                            strategy,
                            endpoint,
                            subject,
                            predicate,
                            object,
                            control,
                        }) as Arc<dyn ParallelTask<Triple>>
                    });
                }
                Ok(start_executor(union, ExecutorKind::Union, query_info, false))
            }
        }
    }
}

/// Rows of one evaluated query.
///
/// Enforces the query deadline and releases every outstanding task when
/// closed or dropped.
pub struct QueryCursor {
    inner: Cursor<BindingSet>,
    query_info: Arc<QueryInfo>,
    deadline: Option<Pin<Box<Sleep>>>,
    finished: bool,
}

impl QueryCursor {
    fn new(inner: Cursor<BindingSet>, query_info: Arc<QueryInfo>) -> Self {
        let deadline = query_info
            .deadline()
            .map(|deadline| Box::pin(tokio::time::sleep_until(deadline)));
        Self {
            inner,
            query_info,
            deadline,
            finished: false,
        }
    }

    pub fn query_id(&self) -> u64 {
        self.query_info.id()
    }

    pub fn query_info(&self) -> &Arc<QueryInfo> {
        &self.query_info
    }

    /// Stop evaluation and release all resources of the query
    pub fn close(&mut self) {
        if !self.finished {
            self.finished = true;
            self.inner.close();
            self.query_info.close();
        }
    }

    /// Drain all rows, stopping at the first error
    pub async fn collect_all(mut self) -> FedResult<Vec<BindingSet>> {
        let mut rows = Vec::new();
        while let Some(row) = self.next().await {
            rows.push(row?);
        }
        Ok(rows)
    }
}

impl Stream for QueryCursor {
    type Item = FedResult<BindingSet>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.finished {
            return Poll::Ready(None);
        }

        if let Some(deadline) = this.deadline.as_mut() {
            if deadline.as_mut().poll(cx).is_ready() {
                let query_id = this.query_info.id();
                this.query_info.abort();
                this.close();
                return Poll::Ready(Some(Err(FedError::Timeout(format!(
                    "query {} exceeded its deadline",
                    query_id
                )))));
            }
        }

        match this.inner.poll_next_unpin(cx) {
            Poll::Ready(Some(Ok(row))) => Poll::Ready(Some(Ok(row))),
            Poll::Ready(Some(Err(e))) => {
                this.close();
                Poll::Ready(Some(Err(e)))
            }
            Poll::Ready(None) => {
                this.close();
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for QueryCursor {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for QueryCursor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryCursor")
            .field("query_id", &self.query_info.id())
            .field("finished", &self.finished)
            .finish()
    }
}
