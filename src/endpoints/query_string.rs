// SPARQL query text construction
use crate::algebra::{
    expr::ValueExpr,
    pattern::StatementPattern,
    tuple_expr::{ParsedQuery, QueryType, TupleExpr},
};
use crate::endpoints::endpoint_trait::BOUND_JOIN_INDEX_VAR;
use crate::utils::{
    error::{FedError, FedResult},
    types::BindingSet,
};

fn group_body(patterns: &[StatementPattern], bindings: &BindingSet, filter: Option<&ValueExpr>) -> String {
    let mut parts: Vec<String> = patterns.iter().map(|p| p.bind(bindings).to_sparql()).collect();
    if let Some(filter) = filter {
        parts.push(format!("FILTER {}", filter.substitute(bindings).to_sparql()));
    }
    parts.join(" ")
}

/// `SELECT` over the patterns with `bindings` substituted
pub fn select_query(
    patterns: &[StatementPattern],
    bindings: &BindingSet,
    filter: Option<&ValueExpr>,
    projection: Option<&[String]>,
) -> FedResult<String> {
    let mut vars: Vec<String> = Vec::new();
    for pattern in patterns {
        for var in pattern.free_vars(bindings) {
            if !vars.contains(&var) {
                vars.push(var);
            }
        }
    }
    if vars.is_empty() {
        return Err(FedError::MalformedQuery(
            "cannot build SELECT query: all variables are bound".to_string(),
        ));
    }

    let selected: Vec<&String> = match projection {
        Some(projection) => {
            let kept: Vec<&String> = vars.iter().filter(|v| projection.contains(*v)).collect();
            if kept.is_empty() {
                vars.iter().collect()
            } else {
                kept
            }
        }
        None => vars.iter().collect(),
    };
    let head: Vec<String> = selected.iter().map(|v| format!("?{}", v)).collect();

    Ok(format!(
        "SELECT {} WHERE {{ {} }}",
        head.join(" "),
        group_body(patterns, bindings, filter)
    ))
}

pub fn ask_query(pattern: &StatementPattern, bindings: &BindingSet) -> String {
    format!("ASK {{ {} }}", pattern.bind(bindings).to_sparql())
}

/// Existence check for endpoints without `ASK` support
pub fn select_limit1_query(pattern: &StatementPattern, bindings: &BindingSet) -> String {
    format!("SELECT * WHERE {{ {} }} LIMIT 1", pattern.bind(bindings).to_sparql())
}

/// One `UNION` branch per binding, each tagged with its index
pub fn bound_join_query(
    patterns: &[StatementPattern],
    bindings: &[BindingSet],
    filter: Option<&ValueExpr>,
) -> FedResult<String> {
    if bindings.is_empty() {
        return Err(FedError::MalformedQuery(
            "bound join query requires at least one binding".to_string(),
        ));
    }
    let branches: Vec<String> = bindings
        .iter()
        .enumerate()
        .map(|(index, b)| {
            format!(
                "{{ {} BIND({} AS ?{}) }}",
                group_body(patterns, b, filter),
                index,
                BOUND_JOIN_INDEX_VAR
            )
        })
        .collect();
    Ok(format!("SELECT * WHERE {{ {} }}", branches.join(" UNION ")))
}

/// Render a full query for pass-through evaluation
pub fn render_query(query: &ParsedQuery) -> FedResult<String> {
    match query.query_type {
        QueryType::Select => render_select(&query.expr),
        QueryType::Ask => Ok(format!("ASK {{ {} }}", render_group(&query.expr)?)),
        other => Err(FedError::MalformedQuery(format!(
            "{:?} queries cannot be rendered for pass-through",
            other
        ))),
    }
}

fn render_select(expr: &TupleExpr) -> FedResult<String> {
    let mut distinct = false;
    let mut vars: Option<&Vec<String>> = None;
    let mut modifiers = String::new();
    let mut current = expr;
    loop {
        match current {
            TupleExpr::Slice { offset, limit, arg } => {
                if *offset > 0 {
                    modifiers.push_str(&format!(" OFFSET {}", offset));
                }
                if let Some(limit) = limit {
                    modifiers.push_str(&format!(" LIMIT {}", limit));
                }
                current = &**arg;
            }
            TupleExpr::Distinct(arg) => {
                distinct = true;
                current = &**arg;
            }
            TupleExpr::Projection { vars: projected, arg } if vars.is_none() => {
                vars = Some(projected);
                current = &**arg;
            }
            _ => break,
        }
    }

    let head = match vars {
        Some(vars) if !vars.is_empty() => vars.iter().map(|v| format!("?{}", v)).collect::<Vec<_>>().join(" "),
        _ => "*".to_string(),
    };
    Ok(format!(
        "SELECT {}{} WHERE {{ {} }}{}",
        if distinct { "DISTINCT " } else { "" },
        head,
        render_group(current)?,
        modifiers
    ))
}

/// Render the body of a group graph pattern
pub fn render_group(expr: &TupleExpr) -> FedResult<String> {
    Ok(match expr {
        TupleExpr::Pattern(p) => p.to_sparql(),
        TupleExpr::Join(l, r) => format!("{} {}", render_group(l)?, render_group(r)?),
        TupleExpr::Union(l, r) => format!("{{ {} }} UNION {{ {} }}", render_group(l)?, render_group(r)?),
        TupleExpr::Filter { condition, arg } => {
            format!("{} FILTER {}", render_group(arg)?, condition.to_sparql())
        }
        TupleExpr::LeftJoin { left, right, condition } => {
            let filter = condition
                .as_ref()
                .map(|c| format!(" FILTER {}", c.to_sparql()))
                .unwrap_or_default();
            format!("{} OPTIONAL {{ {}{} }}", render_group(left)?, render_group(right)?, filter)
        }
        TupleExpr::Service { endpoint, arg, silent } => format!(
            "SERVICE {}<{}> {{ {} }}",
            if *silent { "SILENT " } else { "" },
            endpoint,
            render_group(arg)?
        ),
        TupleExpr::Projection { .. } | TupleExpr::Slice { .. } | TupleExpr::Distinct(_) => {
            format!("{{ {} }}", render_select(expr)?)
        }
    })
}
