use crate::algebra::plan::PlanNode;
use std::collections::HashMap;

/// Mark variables that only one join argument references and that nothing
/// outside needs as local, so endpoints can leave them out of results.
///
/// Only plans under a projection are analyzed. OPTIONAL, SERVICE, UNION and
/// sub-select parts are opaque: every variable they mention stays global.
pub fn optimize(plan: PlanNode) -> PlanNode {
    let projected = match top_projection(&plan) {
        Some(vars) => vars.to_vec(),
        None => return plan,
    };

    let mut scope = Scope {
        global: projected,
        owners: HashMap::new(),
        next_arg: 0,
    };
    scope.visit(&plan, true);

    let local: HashMap<String, usize> = scope
        .owners
        .into_iter()
        .filter_map(|(var, owners)| match owners.as_slice() {
            [owner] if !scope.global.contains(&var) => Some((var, *owner)),
            _ => None,
        })
        .collect();
    if local.is_empty() {
        return plan;
    }
    let mut plan = plan;
    let mut next_arg = 0;
    assign(&mut plan, &local, &mut next_arg, true);
    plan
}

fn top_projection(plan: &PlanNode) -> Option<&[String]> {
    match plan {
        PlanNode::Projection { vars, .. } => Some(vars),
        PlanNode::Slice { arg, .. } | PlanNode::Distinct(arg) => top_projection(arg),
        _ => None,
    }
}

struct Scope {
    global: Vec<String>,
    /// Join arguments referencing each variable
    owners: HashMap<String, Vec<usize>>,
    next_arg: usize,
}

impl Scope {
    fn mark_global(&mut self, vars: impl IntoIterator<Item = String>) {
        for var in vars {
            if !self.global.contains(&var) {
                self.global.push(var);
            }
        }
    }

    fn record(&mut self, vars: Vec<String>) {
        let arg = self.next_arg;
        self.next_arg += 1;
        for var in vars {
            let owners = self.owners.entry(var).or_default();
            if !owners.contains(&arg) {
                owners.push(arg);
            }
        }
    }

    fn visit(&mut self, node: &PlanNode, top: bool) {
        match node {
            PlanNode::Statement(stmt) => self.record(stmt.free_vars()),
            PlanNode::ExclusiveGroup(group) => self.record(group.free_vars()),
            PlanNode::IndependentJoinGroup(members) => {
                for member in members {
                    self.record(member.free_vars());
                }
            }
            PlanNode::NJoin { args, .. } => {
                for arg in args {
                    self.visit(arg, false);
                }
            }
            PlanNode::Filter { condition, arg } => {
                self.mark_global(condition.vars());
                self.visit(arg, false);
            }
            PlanNode::Projection { arg, .. } if top => self.visit(arg, false),
            PlanNode::Slice { arg, .. } | PlanNode::Distinct(arg) if top => self.visit(arg, true),
            PlanNode::Empty => {}
            opaque => {
                let mut vars = opaque.free_vars();
                for stmt in opaque.statements() {
                    vars.extend(stmt.pattern.vars());
                }
                self.mark_global(vars);
            }
        }
    }
}

/// Replays the traversal order of [`Scope::visit`] to hand each join
/// argument its local variables
fn assign(node: &mut PlanNode, local: &HashMap<String, usize>, next_arg: &mut usize, top: bool) {
    match node {
        PlanNode::Statement(stmt) => {
            let arg = *next_arg;
            *next_arg += 1;
            stmt.local_vars = stmt
                .free_vars()
                .into_iter()
                .filter(|v| local.get(v) == Some(&arg))
                .collect();
        }
        PlanNode::ExclusiveGroup(group) => {
            let arg = *next_arg;
            *next_arg += 1;
            let mut claimed: Vec<String> = Vec::new();
            for stmt in &mut group.statements {
                let vars = stmt.pattern.bind(&group.bound_filters).free_vars(&stmt.bound_filters);
                stmt.local_vars = vars
                    .into_iter()
                    .filter(|v| local.get(v) == Some(&arg) && !claimed.contains(v))
                    .collect();
                claimed.extend(stmt.local_vars.iter().cloned());
            }
        }
        PlanNode::IndependentJoinGroup(members) => {
            for member in members {
                let arg = *next_arg;
                *next_arg += 1;
                member.local_vars = member
                    .free_vars()
                    .into_iter()
                    .filter(|v| local.get(v) == Some(&arg))
                    .collect();
            }
        }
        PlanNode::NJoin { args, .. } => {
            for arg in args {
                assign(arg, local, next_arg, false);
            }
        }
        PlanNode::Filter { arg, .. } => assign(arg, local, next_arg, false),
        PlanNode::Projection { arg, .. } if top => assign(arg, local, next_arg, false),
        PlanNode::Slice { arg, .. } | PlanNode::Distinct(arg) if top => assign(arg, local, next_arg, true),
        _ => {}
    }
}
