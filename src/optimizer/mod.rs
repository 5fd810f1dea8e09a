// Query optimizer pipeline
pub mod filter;
pub mod info;
pub mod scope;
pub mod sources;

pub use info::{build_plan, QueryStructure};

use crate::algebra::plan::PlanNode;
use crate::algebra::tuple_expr::{ParsedQuery, QueryType};
use crate::engine::federation::FederationContext;
use crate::engine::query_info::QueryInfo;
use crate::utils::error::FedResult;
use tracing::debug;

/// Turn a parsed query into an executable plan.
///
/// A federation with a single member that accepts whole queries gets the
/// query passed through untouched; otherwise the plan goes through
/// structure analysis, source selection, filter pushdown and variable
/// scoping, in that order.
pub async fn optimize(ctx: &FederationContext, query: &ParsedQuery, query_info: &QueryInfo) -> FedResult<PlanNode> {
    query_info.check_aborted()?;
    if let Some(endpoint_id) = single_source(ctx, query) {
        debug!(query_id = query_info.id(), endpoint = %endpoint_id, "single source pass-through");
        return Ok(PlanNode::SingleSourceQuery {
            endpoint_id,
            query: query.clone(),
        });
    }

    let (plan, structure, mut next_id) = build_plan(&query.expr);
    debug!(
        query_id = query_info.id(),
        statements = structure.statement_count,
        union = structure.has_union,
        filter = structure.has_filter,
        service = structure.has_service,
        limit = ?structure.limit,
        "query structure"
    );

    let selector = ctx.source_selector();
    let plan = sources::optimize(plan, &selector, query_info, &mut next_id).await?;
    let plan = if structure.has_filter { filter::optimize(plan) } else { plan };
    let plan = scope::optimize(plan);
    debug!(query_id = query_info.id(), root = %plan.label(), "optimized plan");
    Ok(plan)
}

fn single_source(ctx: &FederationContext, query: &ParsedQuery) -> Option<String> {
    if !matches!(query.query_type, QueryType::Select | QueryType::Ask) {
        return None;
    }
    match ctx.registry.list().as_slice() {
        [only] if only.capabilities().supports_prepared_queries => Some(only.id().to_string()),
        _ => None,
    }
}
