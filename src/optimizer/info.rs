use crate::algebra::plan::{PlanNode, ServiceNode, StatementNode};
use crate::algebra::tuple_expr::TupleExpr;

/// Facts about a query collected in one traversal
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryStructure {
    /// Statements outside SERVICE bodies
    pub statement_count: usize,
    pub has_union: bool,
    pub has_filter: bool,
    pub has_service: bool,
    pub has_optional: bool,
    /// LIMIT of the outermost slice, ignoring slices inside sub-selects
    pub limit: Option<usize>,
}

/// Translate the parsed tree into an unsourced plan.
///
/// Binary joins and unions are flattened into n-ary nodes and statements
/// are numbered in document order. Returns the plan together with the
/// next free node id.
pub fn build_plan(expr: &TupleExpr) -> (PlanNode, QueryStructure, usize) {
    let mut builder = PlanBuilder::default();
    let plan = builder.build(expr, false);
    (plan, builder.structure, builder.next_id)
}

#[derive(Default)]
struct PlanBuilder {
    structure: QueryStructure,
    next_id: usize,
    seen_projection: bool,
}

impl PlanBuilder {
    fn build(&mut self, expr: &TupleExpr, in_subquery: bool) -> PlanNode {
        match expr {
            TupleExpr::Pattern(pattern) => {
                let id = self.next_id;
                self.next_id += 1;
                self.structure.statement_count += 1;
                PlanNode::Statement(StatementNode::new(id, pattern.clone(), Vec::new()))
            }
            TupleExpr::Join(_, _) => {
                let mut operands = Vec::new();
                flatten_join(expr, &mut operands);
                let args = operands.into_iter().map(|e| self.build(e, in_subquery)).collect();
                PlanNode::NJoin {
                    args,
                    join_vars: Vec::new(),
                }
            }
            TupleExpr::Union(_, _) => {
                self.structure.has_union = true;
                let mut operands = Vec::new();
                flatten_union(expr, &mut operands);
                PlanNode::NUnion(operands.into_iter().map(|e| self.build(e, in_subquery)).collect())
            }
            TupleExpr::LeftJoin { left, right, condition } => {
                self.structure.has_optional = true;
                PlanNode::LeftJoin {
                    left: Box::new(self.build(left, in_subquery)),
                    right: Box::new(self.build(right, in_subquery)),
                    condition: condition.clone(),
                }
            }
            TupleExpr::Filter { condition, arg } => {
                self.structure.has_filter = true;
                PlanNode::Filter {
                    condition: condition.clone(),
                    arg: Box::new(self.build(arg, in_subquery)),
                }
            }
            TupleExpr::Projection { vars, arg } => {
                let nested = in_subquery || self.seen_projection;
                self.seen_projection = true;
                PlanNode::Projection {
                    vars: vars.clone(),
                    inserted: Default::default(),
                    arg: Box::new(self.build(arg, nested)),
                }
            }
            TupleExpr::Slice { offset, limit, arg } => {
                if !in_subquery && self.structure.limit.is_none() {
                    self.structure.limit = *limit;
                }
                PlanNode::Slice {
                    offset: *offset,
                    limit: *limit,
                    arg: Box::new(self.build(arg, in_subquery)),
                }
            }
            TupleExpr::Distinct(arg) => PlanNode::Distinct(Box::new(self.build(arg, in_subquery))),
            TupleExpr::Service { endpoint, arg, silent } => {
                self.structure.has_service = true;
                PlanNode::Service(ServiceNode {
                    service_ref: endpoint.clone(),
                    expr: (**arg).clone(),
                    silent: *silent,
                })
            }
        }
    }
}

fn flatten_join<'a>(expr: &'a TupleExpr, out: &mut Vec<&'a TupleExpr>) {
    match expr {
        TupleExpr::Join(left, right) => {
            flatten_join(left, out);
            flatten_join(right, out);
        }
        other => out.push(other),
    }
}

fn flatten_union<'a>(expr: &'a TupleExpr, out: &mut Vec<&'a TupleExpr>) {
    match expr {
        TupleExpr::Union(left, right) => {
            flatten_union(left, out);
            flatten_union(right, out);
        }
        other => out.push(other),
    }
}
