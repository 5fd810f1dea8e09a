use crate::algebra::expr::ValueExpr;
use crate::algebra::pattern::StatementPattern;
use crate::algebra::tuple_expr::{ParsedQuery, TupleExpr};
use crate::utils::types::{BindingSet, Term};
use serde::{Deserialize, Serialize};

/// Where a source lives relative to the federation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SourceType {
    Local,
    Remote,
}

/// Reference to an endpoint able to answer a plan node
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StatementSource {
    pub endpoint_id: String,
    pub source_type: SourceType,
}

/// Source multiplicity of a statement
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKind {
    /// Exactly one owning source
    Exclusive,
    /// Two or more candidate sources, evaluated as a union
    MultiSource,
}

/// A triple pattern annotated with its sources and pushed-down filters
#[derive(Debug, Clone, PartialEq)]
pub struct StatementNode {
    pub id: usize,
    pub pattern: StatementPattern,
    pub sources: Vec<StatementSource>,
    pub filter: Option<ValueExpr>,
    /// Variable substitutions produced by filter pushdown
    pub bound_filters: BindingSet,
    pub local_vars: Vec<String>,
}

/// Statements sharing one exclusive owner, sent as a single request
#[derive(Debug, Clone, PartialEq)]
pub struct ExclusiveGroup {
    pub id: usize,
    pub statements: Vec<StatementNode>,
    pub owner: StatementSource,
    pub filter: Option<ValueExpr>,
    pub bound_filters: BindingSet,
}

/// SERVICE clause; the body is opaque to the optimizer
#[derive(Debug, Clone, PartialEq)]
pub struct ServiceNode {
    pub service_ref: String,
    pub expr: TupleExpr,
    pub silent: bool,
}

/// Executable plan
#[derive(Debug, Clone, PartialEq)]
pub enum PlanNode {
    Statement(StatementNode),
    ExclusiveGroup(ExclusiveGroup),
    NJoin {
        args: Vec<PlanNode>,
        join_vars: Vec<String>,
    },
    NUnion(Vec<PlanNode>),
    Service(ServiceNode),
    /// Statements depending only on earlier join arguments; a bound join
    /// fetches all of them per block and combines the rows per binding
    IndependentJoinGroup(Vec<StatementNode>),
    SingleSourceQuery {
        endpoint_id: String,
        query: ParsedQuery,
    },
    /// Proven to produce no solutions
    Empty,
    Filter {
        condition: ValueExpr,
        arg: Box<PlanNode>,
    },
    LeftJoin {
        left: Box<PlanNode>,
        right: Box<PlanNode>,
        condition: Option<ValueExpr>,
    },
    Projection {
        vars: Vec<String>,
        /// Values fixed by filter pushdown, re-inserted into every row
        inserted: BindingSet,
        arg: Box<PlanNode>,
    },
    Slice {
        offset: usize,
        limit: Option<usize>,
        arg: Box<PlanNode>,
    },
    Distinct(Box<PlanNode>),
}

fn push_unique(out: &mut Vec<String>, vars: impl IntoIterator<Item = String>) {
    for var in vars {
        if !out.contains(&var) {
            out.push(var);
        }
    }
}

impl StatementSource {
    pub fn new(endpoint_id: impl Into<String>, source_type: SourceType) -> Self {
        Self {
            endpoint_id: endpoint_id.into(),
            source_type,
        }
    }
}

impl StatementNode {
    pub fn new(id: usize, pattern: StatementPattern, sources: Vec<StatementSource>) -> Self {
        Self {
            id,
            pattern,
            sources,
            filter: None,
            bound_filters: BindingSet::new(),
            local_vars: Vec::new(),
        }
    }

    pub fn kind(&self) -> SourceKind {
        if self.sources.len() == 1 {
            SourceKind::Exclusive
        } else {
            SourceKind::MultiSource
        }
    }

    /// Owning source of an exclusive statement
    pub fn owner(&self) -> Option<&StatementSource> {
        match self.kind() {
            SourceKind::Exclusive => self.sources.first(),
            SourceKind::MultiSource => None,
        }
    }

    /// Pattern with bound filters applied
    pub fn effective_pattern(&self) -> StatementPattern {
        self.pattern.bind(&self.bound_filters)
    }

    pub fn free_vars(&self) -> Vec<String> {
        self.pattern.free_vars(&self.bound_filters)
    }

    pub fn has_free_vars_for(&self, bindings: &BindingSet) -> bool {
        self.effective_pattern().has_free_vars(bindings)
    }

    pub fn add_filter_expr(&mut self, expr: ValueExpr) {
        self.filter = Some(match self.filter.take() {
            Some(existing) => ValueExpr::and(existing, expr),
            None => expr,
        });
    }

    pub fn add_bound_filter(&mut self, var: &str, value: Term) {
        self.bound_filters.insert(var, value);
        if let Some(filter) = self.filter.take() {
            self.filter = Some(filter.substitute(&self.bound_filters));
        }
    }
}

impl ExclusiveGroup {
    /// Group statements owned by `owner`, merging their filters
    pub fn new(id: usize, statements: Vec<StatementNode>, owner: StatementSource) -> Self {
        let mut group = Self {
            id,
            statements: Vec::with_capacity(statements.len()),
            owner,
            filter: None,
            bound_filters: BindingSet::new(),
        };
        for mut stmt in statements {
            if let Some(filter) = stmt.filter.take() {
                group.add_filter_expr(filter);
            }
            for (var, value) in stmt.bound_filters.iter() {
                group.bound_filters.insert(var.clone(), value.clone());
            }
            group.statements.push(stmt);
        }
        group
    }

    pub fn patterns(&self) -> Vec<StatementPattern> {
        self.statements
            .iter()
            .map(|s| s.pattern.bind(&self.bound_filters).bind(&s.bound_filters))
            .collect()
    }

    pub fn free_vars(&self) -> Vec<String> {
        let mut vars = Vec::new();
        for pattern in self.patterns() {
            push_unique(&mut vars, pattern.vars());
        }
        vars
    }

    pub fn add_filter_expr(&mut self, expr: ValueExpr) {
        self.filter = Some(match self.filter.take() {
            Some(existing) => ValueExpr::and(existing, expr),
            None => expr,
        });
    }

    pub fn add_bound_filter(&mut self, var: &str, value: Term) {
        self.bound_filters.insert(var, value);
        if let Some(filter) = self.filter.take() {
            self.filter = Some(filter.substitute(&self.bound_filters));
        }
    }

    pub fn local_vars(&self) -> Vec<String> {
        let mut vars = Vec::new();
        for stmt in &self.statements {
            push_unique(&mut vars, stmt.local_vars.iter().cloned());
        }
        vars
    }
}

impl ServiceNode {
    /// Body as a basic graph pattern with an optional filter, when it is one
    pub fn bgp(&self) -> Option<(Vec<StatementPattern>, Option<ValueExpr>)> {
        fn walk(expr: &TupleExpr, patterns: &mut Vec<StatementPattern>, filters: &mut Vec<ValueExpr>) -> bool {
            match expr {
                TupleExpr::Pattern(p) => {
                    patterns.push(p.clone());
                    true
                }
                TupleExpr::Join(l, r) => walk(l, patterns, filters) && walk(r, patterns, filters),
                TupleExpr::Filter { condition, arg } => {
                    filters.push(condition.clone());
                    walk(arg, patterns, filters)
                }
                _ => false,
            }
        }

        let mut patterns = Vec::new();
        let mut filters = Vec::new();
        if walk(&self.expr, &mut patterns, &mut filters) && !patterns.is_empty() {
            Some((patterns, ValueExpr::and_all(filters)))
        } else {
            None
        }
    }

    pub fn vars(&self) -> Vec<String> {
        let mut vars = Vec::new();
        for pattern in self.expr.patterns() {
            push_unique(&mut vars, pattern.vars());
        }
        vars
    }
}

impl PlanNode {
    pub fn is_empty_node(&self) -> bool {
        matches!(self, PlanNode::Empty)
    }

    /// Variables the node can bind
    pub fn free_vars(&self) -> Vec<String> {
        let mut vars = Vec::new();
        match self {
            PlanNode::Statement(stmt) => push_unique(&mut vars, stmt.free_vars()),
            PlanNode::ExclusiveGroup(group) => push_unique(&mut vars, group.free_vars()),
            PlanNode::NJoin { args, .. } | PlanNode::NUnion(args) => {
                for arg in args {
                    push_unique(&mut vars, arg.free_vars());
                }
            }
            PlanNode::IndependentJoinGroup(members) => {
                for member in members {
                    push_unique(&mut vars, member.free_vars());
                }
            }
            PlanNode::Service(service) => push_unique(&mut vars, service.vars()),
            PlanNode::SingleSourceQuery { query, .. } => {
                for pattern in query.expr.patterns() {
                    push_unique(&mut vars, pattern.vars());
                }
            }
            PlanNode::Empty => {}
            PlanNode::Filter { arg, .. } | PlanNode::Slice { arg, .. } | PlanNode::Distinct(arg) => {
                push_unique(&mut vars, arg.free_vars());
            }
            PlanNode::LeftJoin { left, right, .. } => {
                push_unique(&mut vars, left.free_vars());
                push_unique(&mut vars, right.free_vars());
            }
            PlanNode::Projection { vars: projected, .. } => push_unique(&mut vars, projected.iter().cloned()),
        }
        vars
    }

    /// Short label for logging
    pub fn label(&self) -> String {
        match self {
            PlanNode::Statement(stmt) => format!("Statement#{}[{} source(s)]", stmt.id, stmt.sources.len()),
            PlanNode::ExclusiveGroup(group) => {
                format!("ExclusiveGroup#{}@{}", group.id, group.owner.endpoint_id)
            }
            PlanNode::NJoin { args, .. } => format!("NJoin[{}]", args.len()),
            PlanNode::NUnion(args) => format!("NUnion[{}]", args.len()),
            PlanNode::Service(service) => format!("Service<{}>", service.service_ref),
            PlanNode::IndependentJoinGroup(members) => format!("IndependentJoinGroup[{}]", members.len()),
            PlanNode::SingleSourceQuery { endpoint_id, .. } => format!("SingleSourceQuery@{}", endpoint_id),
            PlanNode::Empty => "Empty".to_string(),
            PlanNode::Filter { .. } => "Filter".to_string(),
            PlanNode::LeftJoin { .. } => "LeftJoin".to_string(),
            PlanNode::Projection { .. } => "Projection".to_string(),
            PlanNode::Slice { .. } => "Slice".to_string(),
            PlanNode::Distinct(_) => "Distinct".to_string(),
        }
    }

    /// Visit every statement node, descending into groups
    pub fn statements(&self) -> Vec<&StatementNode> {
        let mut out = Vec::new();
        self.collect_statements(&mut out);
        out
    }

    fn collect_statements<'a>(&'a self, out: &mut Vec<&'a StatementNode>) {
        match self {
            PlanNode::Statement(stmt) => out.push(stmt),
            PlanNode::ExclusiveGroup(group) => out.extend(group.statements.iter()),
            PlanNode::IndependentJoinGroup(members) => out.extend(members.iter()),
            PlanNode::NJoin { args, .. } | PlanNode::NUnion(args) => {
                for arg in args {
                    arg.collect_statements(out);
                }
            }
            PlanNode::Filter { arg, .. }
            | PlanNode::Projection { arg, .. }
            | PlanNode::Slice { arg, .. }
            | PlanNode::Distinct(arg) => arg.collect_statements(out),
            PlanNode::LeftJoin { left, right, .. } => {
                left.collect_statements(out);
                right.collect_statements(out);
            }
            PlanNode::Service(_) | PlanNode::SingleSourceQuery { .. } | PlanNode::Empty => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algebra::pattern::PatternTerm;

    fn stmt(id: usize, s: &str, p: &str, o: &str, sources: &[&str]) -> StatementNode {
        StatementNode::new(
            id,
            StatementPattern::new(PatternTerm::var(s), PatternTerm::iri(p), PatternTerm::var(o)),
            sources
                .iter()
                .map(|e| StatementSource::new(*e, SourceType::Local))
                .collect(),
        )
    }

    #[test]
    fn test_source_kind_from_sources() {
        assert_eq!(stmt(0, "s", "p", "o", &["e1"]).kind(), SourceKind::Exclusive);
        assert_eq!(stmt(0, "s", "p", "o", &["e1", "e2"]).kind(), SourceKind::MultiSource);
        assert!(stmt(0, "s", "p", "o", &["e1", "e2"]).owner().is_none());
    }

    #[test]
    fn test_bound_filter_removes_free_var() {
        let mut node = stmt(0, "s", "p", "o", &["e1"]);
        node.add_filter_expr(ValueExpr::Bound("o".into()));
        node.add_bound_filter("o", Term::iri("http://ex.org/b"));

        assert_eq!(node.free_vars(), vec!["s".to_string()]);
        assert!(node.filter.as_ref().unwrap().vars().is_empty());
    }

    #[test]
    fn test_exclusive_group_merges_filters() {
        let mut a = stmt(0, "s", "p", "o", &["e1"]);
        a.add_filter_expr(ValueExpr::Bound("s".into()));
        let mut b = stmt(1, "o", "q", "x", &["e1"]);
        b.add_filter_expr(ValueExpr::Bound("x".into()));

        let owner = StatementSource::new("e1", SourceType::Local);
        let group = ExclusiveGroup::new(2, vec![a, b], owner);

        assert_eq!(group.filter.as_ref().unwrap().conjuncts().len(), 2);
        assert!(group.statements.iter().all(|s| s.filter.is_none()));
        assert_eq!(group.free_vars(), vec!["s", "o", "x"]);
    }

    #[test]
    fn test_service_bgp_extraction() {
        let body = TupleExpr::filter(
            ValueExpr::Bound("o".into()),
            TupleExpr::pattern(StatementPattern::new(
                PatternTerm::var("s"),
                PatternTerm::iri("p"),
                PatternTerm::var("o"),
            )),
        );
        let service = ServiceNode { service_ref: "e1".into(), expr: body, silent: false };
        let (patterns, filter) = service.bgp().unwrap();
        assert_eq!(patterns.len(), 1);
        assert!(filter.is_some());
    }
}
