use crate::algebra::expr::ValueExpr;
use crate::algebra::plan::PlanNode;
use crate::utils::types::BindingSet;

/// Push filter conjuncts into the statements and exclusive groups that
/// cover their variables.
///
/// Directly below a projection, `?x = <resource>` conjuncts are turned
/// into bound values on the statements instead; the projection re-inserts
/// the value into every row.
pub fn optimize(plan: PlanNode) -> PlanNode {
    rewrite(plan)
}

fn rewrite(node: PlanNode) -> PlanNode {
    match node {
        PlanNode::Filter { condition, arg } => push_filter(condition, *arg, false).0,
        PlanNode::Projection { vars, mut inserted, arg } => {
            let arg = match *arg {
                PlanNode::Filter { condition, arg } => {
                    let (arg, bound) = push_filter(condition, *arg, true);
                    for (var, value) in bound.iter() {
                        inserted.insert(var.clone(), value.clone());
                    }
                    arg
                }
                other => rewrite(other),
            };
            PlanNode::Projection {
                vars,
                inserted,
                arg: Box::new(arg),
            }
        }
        PlanNode::NJoin { args, join_vars } => PlanNode::NJoin {
            args: args.into_iter().map(rewrite).collect(),
            join_vars,
        },
        PlanNode::NUnion(args) => PlanNode::NUnion(args.into_iter().map(rewrite).collect()),
        PlanNode::LeftJoin { left, right, condition } => PlanNode::LeftJoin {
            left: Box::new(rewrite(*left)),
            right: Box::new(rewrite(*right)),
            condition,
        },
        PlanNode::Slice { offset, limit, arg } => PlanNode::Slice {
            offset,
            limit,
            arg: Box::new(rewrite(*arg)),
        },
        PlanNode::Distinct(arg) => PlanNode::Distinct(Box::new(rewrite(*arg))),
        other => other,
    }
}

/// Returns the rewritten subtree and the values bound by equality conjuncts
fn push_filter(condition: ValueExpr, arg: PlanNode, allow_bound: bool) -> (PlanNode, BindingSet) {
    let mut arg = rewrite(arg);
    let mut bound = BindingSet::new();
    if arg.is_empty_node() {
        return (arg, bound);
    }

    let mut conjuncts = condition.conjuncts();
    if allow_bound {
        let mut blocked = Vec::new();
        opaque_vars(&arg, &mut blocked);
        let mut reachable = Vec::new();
        reachable_vars(&arg, &mut reachable);

        conjuncts.retain(|conjunct| match conjunct.as_resource_equality() {
            Some((var, value))
                if !bound.contains(var) && !blocked.iter().any(|b| b == var) && reachable.iter().any(|r| r == var) =>
            {
                bound.insert(var, value.clone());
                false
            }
            _ => true,
        });
        if !bound.is_empty() {
            arg = apply_bound(arg, &bound);
        }
    }

    let mut residual = Vec::new();
    for conjunct in conjuncts {
        let conjunct = conjunct.substitute(&bound);
        let vars = conjunct.vars();
        if vars.is_empty() || !conjunct.is_pushable() || !push_into(&mut arg, &conjunct, &vars) {
            residual.push(conjunct);
        }
    }

    let node = match ValueExpr::and_all(residual) {
        Some(condition) => PlanNode::Filter {
            condition,
            arg: Box::new(arg),
        },
        None => arg,
    };
    (node, bound)
}

/// Attach `conjunct` to the first statement or group binding all of `vars`
fn push_into(node: &mut PlanNode, conjunct: &ValueExpr, vars: &[String]) -> bool {
    match node {
        PlanNode::Statement(stmt) => {
            let free = stmt.free_vars();
            if vars.iter().all(|v| free.contains(v)) {
                stmt.add_filter_expr(conjunct.clone());
                return true;
            }
            false
        }
        PlanNode::ExclusiveGroup(group) => {
            let free = group.free_vars();
            if vars.iter().all(|v| free.contains(v)) {
                group.add_filter_expr(conjunct.clone());
                return true;
            }
            false
        }
        PlanNode::IndependentJoinGroup(members) => members.iter_mut().any(|member| {
            let free = member.free_vars();
            if vars.iter().all(|v| free.contains(v)) {
                member.add_filter_expr(conjunct.clone());
                return true;
            }
            false
        }),
        PlanNode::NJoin { args, .. } => args.iter_mut().any(|arg| push_into(arg, conjunct, vars)),
        PlanNode::Filter { arg, .. } => push_into(arg, conjunct, vars),
        PlanNode::LeftJoin { left, .. } => push_into(left, conjunct, vars),
        _ => false,
    }
}

fn apply_bound(node: PlanNode, bound: &BindingSet) -> PlanNode {
    match node {
        PlanNode::Statement(mut stmt) => {
            for var in stmt.pattern.vars() {
                if let Some(value) = bound.get(&var) {
                    stmt.add_bound_filter(&var, value.clone());
                }
            }
            PlanNode::Statement(stmt)
        }
        PlanNode::ExclusiveGroup(mut group) => {
            for var in group.free_vars() {
                if let Some(value) = bound.get(&var) {
                    group.add_bound_filter(&var, value.clone());
                }
            }
            PlanNode::ExclusiveGroup(group)
        }
        PlanNode::IndependentJoinGroup(mut members) => {
            for member in &mut members {
                for var in member.pattern.vars() {
                    if let Some(value) = bound.get(&var) {
                        member.add_bound_filter(&var, value.clone());
                    }
                }
            }
            PlanNode::IndependentJoinGroup(members)
        }
        PlanNode::NJoin { args, join_vars } => PlanNode::NJoin {
            args: args.into_iter().map(|a| apply_bound(a, bound)).collect(),
            join_vars: join_vars.into_iter().filter(|v| !bound.contains(v)).collect(),
        },
        PlanNode::Filter { condition, arg } => PlanNode::Filter {
            condition: condition.substitute(bound),
            arg: Box::new(apply_bound(*arg, bound)),
        },
        PlanNode::LeftJoin { left, right, condition } => PlanNode::LeftJoin {
            left: Box::new(apply_bound(*left, bound)),
            right,
            condition,
        },
        other => other,
    }
}

/// Variables of parts a binding cannot be pushed through
fn opaque_vars(node: &PlanNode, out: &mut Vec<String>) {
    match node {
        PlanNode::Statement(_) | PlanNode::ExclusiveGroup(_) | PlanNode::IndependentJoinGroup(_) | PlanNode::Empty => {}
        PlanNode::NJoin { args, .. } => {
            for arg in args {
                opaque_vars(arg, out);
            }
        }
        PlanNode::Filter { arg, .. } => opaque_vars(arg, out),
        PlanNode::LeftJoin { left, right, condition } => {
            opaque_vars(left, out);
            out.extend(right.free_vars());
            if let Some(condition) = condition {
                out.extend(condition.vars());
            }
        }
        other => out.extend(other.free_vars()),
    }
}

/// Variables bound by statements on every row of `node`
fn reachable_vars(node: &PlanNode, out: &mut Vec<String>) {
    match node {
        PlanNode::Statement(stmt) => out.extend(stmt.free_vars()),
        PlanNode::ExclusiveGroup(group) => out.extend(group.free_vars()),
        PlanNode::IndependentJoinGroup(members) => {
            for member in members {
                out.extend(member.free_vars());
            }
        }
        PlanNode::NJoin { args, .. } => {
            for arg in args {
                reachable_vars(arg, out);
            }
        }
        PlanNode::Filter { arg, .. } => reachable_vars(arg, out),
        PlanNode::LeftJoin { left, .. } => reachable_vars(left, out),
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algebra::expr::CompareOp;
    use crate::algebra::pattern::{PatternTerm, StatementPattern};
    use crate::algebra::plan::{SourceType, StatementNode, StatementSource};
    use crate::utils::types::Term;

    fn stmt(id: usize, s: &str, p: &str, o: &str) -> PlanNode {
        PlanNode::Statement(StatementNode::new(
            id,
            StatementPattern::new(PatternTerm::var(s), PatternTerm::iri(p), PatternTerm::var(o)),
            vec![
                StatementSource::new("e1", SourceType::Local),
                StatementSource::new("e2", SourceType::Local),
            ],
        ))
    }

    fn join(args: Vec<PlanNode>) -> PlanNode {
        PlanNode::NJoin {
            args,
            join_vars: vec!["b".to_string()],
        }
    }

    fn gt(var: &str, value: i64) -> ValueExpr {
        ValueExpr::compare(CompareOp::Gt, ValueExpr::var(var), ValueExpr::constant(Term::integer(value)))
    }

    fn statement_filters(plan: &PlanNode) -> Vec<Option<ValueExpr>> {
        plan.statements().iter().map(|s| s.filter.clone()).collect()
    }

    #[test]
    fn test_covered_conjuncts_are_pushed() {
        let condition = ValueExpr::and(gt("a", 1), gt("c", 2));
        let plan = PlanNode::Filter {
            condition,
            arg: Box::new(join(vec![stmt(0, "a", "p1", "b"), stmt(1, "b", "p2", "c")])),
        };
        let optimized = optimize(plan);

        assert!(matches!(optimized, PlanNode::NJoin { .. }));
        assert_eq!(statement_filters(&optimized), vec![Some(gt("a", 1)), Some(gt("c", 2))]);
    }

    #[test]
    fn test_spanning_conjunct_stays_residual() {
        let spanning = ValueExpr::compare(CompareOp::Ne, ValueExpr::var("a"), ValueExpr::var("c"));
        let plan = PlanNode::Filter {
            condition: ValueExpr::and(spanning.clone(), gt("a", 1)),
            arg: Box::new(join(vec![stmt(0, "a", "p1", "b"), stmt(1, "b", "p2", "c")])),
        };
        match optimize(plan) {
            PlanNode::Filter { condition, arg } => {
                assert_eq!(condition, spanning);
                assert_eq!(statement_filters(&arg), vec![Some(gt("a", 1)), None]);
            }
            other => panic!("Expected residual filter, got {}", other.label()),
        }
    }

    #[test]
    fn test_resource_equality_becomes_bound_value() {
        let target = Term::iri("http://ex.org/x");
        let plan = PlanNode::Projection {
            vars: vec!["a".to_string(), "b".to_string()],
            inserted: BindingSet::new(),
            arg: Box::new(PlanNode::Filter {
                condition: ValueExpr::eq(ValueExpr::var("b"), ValueExpr::constant(target.clone())),
                arg: Box::new(join(vec![stmt(0, "a", "p1", "b"), stmt(1, "b", "p2", "c")])),
            }),
        };

        match optimize(plan) {
            PlanNode::Projection { inserted, arg, .. } => {
                assert_eq!(inserted.get("b"), Some(&target));
                match *arg {
                    PlanNode::NJoin { args, join_vars } => {
                        assert!(join_vars.is_empty());
                        for arg in &args {
                            assert!(!arg.free_vars().contains(&"b".to_string()));
                        }
                    }
                    other => panic!("Expected NJoin, got {}", other.label()),
                }
            }
            other => panic!("Expected Projection, got {}", other.label()),
        }
    }

    #[test]
    fn test_equality_on_optional_variable_is_not_bound() {
        let target = Term::iri("http://ex.org/x");
        let plan = PlanNode::Projection {
            vars: vec!["a".to_string()],
            inserted: BindingSet::new(),
            arg: Box::new(PlanNode::Filter {
                condition: ValueExpr::eq(ValueExpr::var("b"), ValueExpr::constant(target)),
                arg: Box::new(PlanNode::LeftJoin {
                    left: Box::new(stmt(0, "a", "p1", "b")),
                    right: Box::new(stmt(1, "b", "p2", "c")),
                    condition: None,
                }),
            }),
        };

        match optimize(plan) {
            PlanNode::Projection { inserted, arg, .. } => {
                assert!(inserted.is_empty());
                // pushed as a plain filter onto the mandatory side instead
                assert!(arg.statements()[0].filter.is_some());
                assert!(arg.statements()[1].filter.is_none());
            }
            other => panic!("Expected Projection, got {}", other.label()),
        }
    }

    #[test]
    fn test_conjunct_reaches_independent_group_member() {
        let group = PlanNode::IndependentJoinGroup(
            [stmt(1, "b", "p2", "c"), stmt(2, "b", "p3", "d")]
                .into_iter()
                .map(|node| match node {
                    PlanNode::Statement(s) => s,
                    _ => unreachable!(),
                })
                .collect(),
        );
        let plan = PlanNode::Filter {
            condition: gt("d", 3),
            arg: Box::new(join(vec![stmt(0, "a", "p1", "b"), group])),
        };
        let optimized = optimize(plan);

        assert!(matches!(optimized, PlanNode::NJoin { .. }));
        assert_eq!(statement_filters(&optimized), vec![None, None, Some(gt("d", 3))]);
    }

    #[test]
    fn test_disjunction_is_not_pushed() {
        let plan = PlanNode::Filter {
            condition: ValueExpr::or(gt("a", 1), gt("a", 5)),
            arg: Box::new(stmt(0, "a", "p1", "b")),
        };
        assert!(matches!(optimize(plan), PlanNode::Filter { .. }));
    }
}
