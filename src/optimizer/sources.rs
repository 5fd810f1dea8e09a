use crate::algebra::pattern::StatementPattern;
use crate::algebra::plan::{ExclusiveGroup, PlanNode, SourceKind, StatementNode, StatementSource};
use crate::engine::query_info::QueryInfo;
use crate::engine::source_selection::SourceSelector;
use crate::utils::error::FedResult;
use std::collections::{HashMap, HashSet};
use tracing::debug;

/// Attach sources to every statement and restructure joins around them.
///
/// Statements without sources collapse to `Empty`, which then propagates
/// through the operators that cannot produce rows without that argument.
pub async fn optimize(
    plan: PlanNode,
    selector: &SourceSelector,
    query_info: &QueryInfo,
    next_id: &mut usize,
) -> FedResult<PlanNode> {
    let (ids, patterns): (Vec<usize>, Vec<StatementPattern>) = plan
        .statements()
        .into_iter()
        .map(|s| (s.id, s.pattern.clone()))
        .unzip();
    if patterns.is_empty() {
        return Ok(plan);
    }

    let selected = selector.select(&patterns, query_info).await?;
    let sources: HashMap<usize, Vec<StatementSource>> = ids.into_iter().zip(selected).collect();
    debug!(
        query_id = query_info.id(),
        statements = sources.len(),
        exclusive = sources.values().filter(|s| s.len() == 1).count(),
        "sources attached"
    );
    Ok(attach(plan, &sources, next_id))
}

fn attach(node: PlanNode, sources: &HashMap<usize, Vec<StatementSource>>, next_id: &mut usize) -> PlanNode {
    match node {
        PlanNode::Statement(mut stmt) => {
            stmt.sources = sources.get(&stmt.id).cloned().unwrap_or_default();
            if stmt.sources.is_empty() {
                PlanNode::Empty
            } else {
                PlanNode::Statement(stmt)
            }
        }
        PlanNode::NJoin { args, .. } => {
            let args: Vec<PlanNode> = args.into_iter().map(|a| attach(a, sources, next_id)).collect();
            if args.iter().any(PlanNode::is_empty_node) {
                return PlanNode::Empty;
            }
            let args = group_independent(order_join_args(group_exclusive(args, next_id)));
            make_join(args)
        }
        PlanNode::NUnion(args) => {
            let mut args: Vec<PlanNode> = args
                .into_iter()
                .map(|a| attach(a, sources, next_id))
                .filter(|a| !a.is_empty_node())
                .collect();
            match args.len() {
                0 => PlanNode::Empty,
                1 => args.remove(0),
                _ => PlanNode::NUnion(args),
            }
        }
        PlanNode::LeftJoin { left, right, condition } => {
            let left = attach(*left, sources, next_id);
            if left.is_empty_node() {
                return PlanNode::Empty;
            }
            let right = attach(*right, sources, next_id);
            if right.is_empty_node() {
                return left;
            }
            PlanNode::LeftJoin {
                left: Box::new(left),
                right: Box::new(right),
                condition,
            }
        }
        PlanNode::Filter { condition, arg } => match attach(*arg, sources, next_id) {
            PlanNode::Empty => PlanNode::Empty,
            arg => PlanNode::Filter {
                condition,
                arg: Box::new(arg),
            },
        },
        PlanNode::Projection { vars, inserted, arg } => match attach(*arg, sources, next_id) {
            PlanNode::Empty => PlanNode::Empty,
            arg => PlanNode::Projection {
                vars,
                inserted,
                arg: Box::new(arg),
            },
        },
        PlanNode::Slice { offset, limit, arg } => match attach(*arg, sources, next_id) {
            PlanNode::Empty => PlanNode::Empty,
            arg => PlanNode::Slice {
                offset,
                limit,
                arg: Box::new(arg),
            },
        },
        PlanNode::Distinct(arg) => match attach(*arg, sources, next_id) {
            PlanNode::Empty => PlanNode::Empty,
            arg => PlanNode::Distinct(Box::new(arg)),
        },
        other => other,
    }
}

/// Merge direct exclusive statements with the same owner into groups,
/// each placed where its first member was
fn group_exclusive(args: Vec<PlanNode>, next_id: &mut usize) -> Vec<PlanNode> {
    let mut owners: HashMap<String, usize> = HashMap::new();
    for arg in &args {
        if let Some(owner) = exclusive_owner(arg) {
            *owners.entry(owner.endpoint_id.clone()).or_default() += 1;
        }
    }

    let mut slots: Vec<Option<PlanNode>> = Vec::with_capacity(args.len());
    let mut members: HashMap<String, (usize, StatementSource, Vec<StatementNode>)> = HashMap::new();
    for arg in args {
        let grouped_owner = exclusive_owner(&arg)
            .filter(|owner| owners.get(&owner.endpoint_id).copied().unwrap_or(0) > 1)
            .cloned();
        match (grouped_owner, arg) {
            (Some(owner), PlanNode::Statement(stmt)) => {
                let slot = slots.len();
                let entry = members
                    .entry(owner.endpoint_id.clone())
                    .or_insert_with(|| {
                        slots.push(None);
                        (slot, owner, Vec::new())
                    });
                entry.2.push(stmt);
            }
            (_, arg) => slots.push(Some(arg)),
        }
    }

    let mut groups: Vec<(usize, StatementSource, Vec<StatementNode>)> = members.into_values().collect();
    groups.sort_by_key(|(slot, _, _)| *slot);
    for (slot, owner, statements) in groups {
        let group = ExclusiveGroup::new(*next_id, statements, owner);
        *next_id += 1;
        slots[slot] = Some(PlanNode::ExclusiveGroup(group));
    }
    slots.into_iter().flatten().collect()
}

fn exclusive_owner(node: &PlanNode) -> Option<&StatementSource> {
    match node {
        PlanNode::Statement(stmt) if stmt.kind() == SourceKind::Exclusive => stmt.owner(),
        _ => None,
    }
}

/// Greedy ordering: prefer arguments connected to what is already bound,
/// then fewer unbound variables, then document order
fn order_join_args(args: Vec<PlanNode>) -> Vec<PlanNode> {
    let mut remaining: Vec<(usize, PlanNode, Vec<String>)> = args
        .into_iter()
        .enumerate()
        .map(|(i, a)| {
            let vars = a.free_vars();
            (i, a, vars)
        })
        .collect();
    let mut bound: HashSet<String> = HashSet::new();
    let mut ordered = Vec::with_capacity(remaining.len());

    while !remaining.is_empty() {
        let best = remaining
            .iter()
            .enumerate()
            .min_by_key(|(_, (index, _, vars))| {
                let connected = vars.iter().any(|v| bound.contains(v));
                let unbound = vars.iter().filter(|v| !bound.contains(*v)).count();
                (!connected && !bound.is_empty(), unbound, *index)
            })
            .map(|(position, _)| position)
            .unwrap_or(0);
        let (_, arg, vars) = remaining.remove(best);
        bound.extend(vars);
        ordered.push(arg);
    }
    ordered
}

/// Group consecutive statements that each connect to the arguments before
/// them and share no other variable with one another. A bound join then
/// fetches all members for a block of bindings at once.
///
/// Grouping stops after an argument that may leave variables unbound.
fn group_independent(args: Vec<PlanNode>) -> Vec<PlanNode> {
    let mut grouped: Vec<PlanNode> = Vec::with_capacity(args.len());
    let mut run = IndependentRun::default();
    let mut reliable = true;

    for arg in args {
        let stmt = match arg {
            PlanNode::Statement(stmt) if reliable && !(grouped.is_empty() && run.members.is_empty()) => stmt,
            other => {
                run.flush(&mut grouped);
                reliable &= matches!(other, PlanNode::Statement(_) | PlanNode::ExclusiveGroup(_));
                run.bind(other.free_vars());
                grouped.push(other);
                continue;
            }
        };
        if !run.accepts(&stmt) {
            run.flush(&mut grouped);
        }
        if run.accepts(&stmt) {
            run.push(stmt);
        } else {
            run.bind(stmt.free_vars());
            grouped.push(PlanNode::Statement(stmt));
        }
    }
    run.flush(&mut grouped);
    grouped
}

#[derive(Default)]
struct IndependentRun {
    /// Variables bound by the arguments before the run
    bound: Vec<String>,
    /// Variables the members introduce
    introduced: Vec<String>,
    members: Vec<StatementNode>,
}

impl IndependentRun {
    fn accepts(&self, stmt: &StatementNode) -> bool {
        let vars = stmt.free_vars();
        let connected = vars.iter().any(|v| self.bound.contains(v));
        let fresh: Vec<&String> = vars.iter().filter(|v| !self.bound.contains(*v)).collect();
        connected && !fresh.is_empty() && fresh.iter().all(|v| !self.introduced.contains(*v))
    }

    fn push(&mut self, stmt: StatementNode) {
        for var in stmt.free_vars() {
            if !self.bound.contains(&var) {
                self.introduced.push(var);
            }
        }
        self.members.push(stmt);
    }

    fn bind(&mut self, vars: Vec<String>) {
        for var in vars {
            if !self.bound.contains(&var) {
                self.bound.push(var);
            }
        }
    }

    fn flush(&mut self, out: &mut Vec<PlanNode>) {
        let introduced = std::mem::take(&mut self.introduced);
        self.bind(introduced);
        let mut members = std::mem::take(&mut self.members);
        match members.len() {
            0 => {}
            1 => out.push(PlanNode::Statement(members.remove(0))),
            _ => out.push(PlanNode::IndependentJoinGroup(members)),
        }
    }
}

/// n-ary join over `args`; a single argument stands alone
pub(crate) fn make_join(mut args: Vec<PlanNode>) -> PlanNode {
    match args.len() {
        0 => PlanNode::Empty,
        1 => args.remove(0),
        _ => {
            let join_vars = join_vars(&args);
            PlanNode::NJoin { args, join_vars }
        }
    }
}

/// Variables shared by at least two join arguments
pub(crate) fn join_vars(args: &[PlanNode]) -> Vec<String> {
    let mut counts: Vec<(String, usize)> = Vec::new();
    for arg in args {
        for var in arg.free_vars() {
            match counts.iter_mut().find(|(v, _)| *v == var) {
                Some((_, count)) => *count += 1,
                None => counts.push((var, 1)),
            }
        }
    }
    counts
        .into_iter()
        .filter(|(_, count)| *count > 1)
        .map(|(var, _)| var)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algebra::pattern::PatternTerm;
    use crate::algebra::plan::SourceType;

    fn stmt(id: usize, s: &str, p: &str, o: &str, sources: &[&str]) -> PlanNode {
        PlanNode::Statement(StatementNode::new(
            id,
            StatementPattern::new(PatternTerm::var(s), PatternTerm::iri(p), PatternTerm::var(o)),
            sources.iter().map(|e| StatementSource::new(*e, SourceType::Local)).collect(),
        ))
    }

    fn sources_of(entries: &[(usize, &[&str])]) -> HashMap<usize, Vec<StatementSource>> {
        entries
            .iter()
            .map(|(id, eps)| {
                (*id, eps.iter().map(|e| StatementSource::new(*e, SourceType::Local)).collect())
            })
            .collect()
    }

    #[test]
    fn test_exclusive_statements_are_grouped() {
        let args = vec![
            stmt(0, "a", "p1", "b", &["e1"]),
            stmt(1, "b", "p2", "c", &["e2"]),
            stmt(2, "c", "p3", "d", &["e1"]),
        ];
        let mut next_id = 3;
        let grouped = group_exclusive(args, &mut next_id);

        assert_eq!(grouped.len(), 2);
        match &grouped[0] {
            PlanNode::ExclusiveGroup(group) => {
                assert_eq!(group.id, 3);
                assert_eq!(group.owner.endpoint_id, "e1");
                assert_eq!(group.statements.len(), 2);
            }
            _ => panic!("Expected ExclusiveGroup"),
        }
        assert!(matches!(&grouped[1], PlanNode::Statement(s) if s.id == 1));
        assert_eq!(next_id, 4);
    }

    #[test]
    fn test_empty_statement_empties_join() {
        let plan = PlanNode::NJoin {
            args: vec![stmt(0, "a", "p1", "b", &[]), stmt(1, "b", "p2", "c", &[])],
            join_vars: Vec::new(),
        };
        let sources = sources_of(&[(0, &["e1"]), (1, &[])]);
        assert_eq!(attach(plan, &sources, &mut 2), PlanNode::Empty);
    }

    #[test]
    fn test_union_drops_empty_branches() {
        let plan = PlanNode::NUnion(vec![
            stmt(0, "a", "p1", "b", &[]),
            stmt(1, "a", "p2", "b", &[]),
            stmt(2, "a", "p3", "b", &[]),
        ]);
        let sources = sources_of(&[(0, &["e1"]), (1, &[]), (2, &["e1", "e2"])]);
        match attach(plan, &sources, &mut 3) {
            PlanNode::NUnion(args) => assert_eq!(args.len(), 2),
            other => panic!("Expected NUnion, got {}", other.label()),
        }
    }

    #[test]
    fn test_optional_with_empty_right_keeps_left() {
        let plan = PlanNode::LeftJoin {
            left: Box::new(stmt(0, "a", "p1", "b", &[])),
            right: Box::new(stmt(1, "b", "p2", "c", &[])),
            condition: None,
        };
        let sources = sources_of(&[(0, &["e1"]), (1, &[])]);
        assert!(matches!(attach(plan, &sources, &mut 2), PlanNode::Statement(s) if s.id == 0));
    }

    #[test]
    fn test_join_order_prefers_connected_arguments() {
        // ?x p1 ?y, ?a p2 ?b, ?y p3 ?a
        let args = vec![
            stmt(0, "x", "p1", "y", &["e1", "e2"]),
            stmt(1, "a", "p2", "b", &["e1", "e2"]),
            stmt(2, "y", "p3", "a", &["e1", "e2"]),
        ];
        let ordered: Vec<usize> = order_join_args(args)
            .iter()
            .map(|a| match a {
                PlanNode::Statement(s) => s.id,
                _ => panic!("Expected statement"),
            })
            .collect();
        assert_eq!(ordered, vec![0, 2, 1]);
    }

    fn ids(args: &[PlanNode]) -> Vec<Vec<usize>> {
        args.iter()
            .map(|a| match a {
                PlanNode::Statement(s) => vec![s.id],
                PlanNode::IndependentJoinGroup(members) => members.iter().map(|m| m.id).collect(),
                other => panic!("Unexpected {}", other.label()),
            })
            .collect()
    }

    #[test]
    fn test_independent_statements_are_grouped() {
        // ?p knows ?f . ?f name ?n . ?f age ?a . ?n label ?l
        let args = vec![
            stmt(0, "p", "knows", "f", &["e1"]),
            stmt(1, "f", "name", "n", &["e2"]),
            stmt(2, "f", "age", "a", &["e3"]),
            stmt(3, "n", "label", "l", &["e2", "e3"]),
        ];
        let grouped = group_independent(args);
        assert_eq!(ids(&grouped), vec![vec![0], vec![1, 2], vec![3]]);
    }

    #[test]
    fn test_statements_sharing_new_variables_stay_apart() {
        // ?p knows ?f . ?f name ?n . ?n label ?f
        let args = vec![
            stmt(0, "p", "knows", "f", &["e1"]),
            stmt(1, "f", "name", "n", &["e2"]),
            stmt(2, "n", "label", "f", &["e3"]),
        ];
        assert_eq!(ids(&group_independent(args)), vec![vec![0], vec![1], vec![2]]);
    }

    #[test]
    fn test_no_grouping_after_optional_argument() {
        let optional = PlanNode::LeftJoin {
            left: Box::new(stmt(0, "p", "knows", "f", &["e1"])),
            right: Box::new(stmt(1, "f", "mail", "m", &["e1"])),
            condition: None,
        };
        let args = vec![optional, stmt(2, "f", "name", "n", &["e2"]), stmt(3, "f", "age", "a", &["e3"])];
        let grouped = group_independent(args);
        assert_eq!(grouped.len(), 3);
        assert!(grouped.iter().all(|a| !matches!(a, PlanNode::IndependentJoinGroup(_))));
    }

    #[test]
    fn test_join_vars_are_shared_variables() {
        let args = vec![stmt(0, "a", "p1", "b", &["e1"]), stmt(1, "b", "p2", "c", &["e2"])];
        assert_eq!(join_vars(&args), vec!["b".to_string()]);
    }
}
