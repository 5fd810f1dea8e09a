use crate::utils::types::{BindingSet, Term, XSD_BOOLEAN};
use regex::RegexBuilder;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

/// Comparison operators
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CompareOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

/// Filter / value expression
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ValueExpr {
    Var(String),
    Constant(Term),
    Compare {
        op: CompareOp,
        left: Box<ValueExpr>,
        right: Box<ValueExpr>,
    },
    And(Box<ValueExpr>, Box<ValueExpr>),
    Or(Box<ValueExpr>, Box<ValueExpr>),
    Not(Box<ValueExpr>),
    Bound(String),
    Regex {
        arg: Box<ValueExpr>,
        pattern: Box<ValueExpr>,
        flags: Option<Box<ValueExpr>>,
    },
}

impl CompareOp {
    pub fn symbol(&self) -> &'static str {
        match self {
            CompareOp::Eq => "=",
            CompareOp::Ne => "!=",
            CompareOp::Lt => "<",
            CompareOp::Le => "<=",
            CompareOp::Gt => ">",
            CompareOp::Ge => ">=",
        }
    }

    fn accepts(&self, ordering: Ordering) -> bool {
        match self {
            CompareOp::Eq => ordering == Ordering::Equal,
            CompareOp::Ne => ordering != Ordering::Equal,
            CompareOp::Lt => ordering == Ordering::Less,
            CompareOp::Le => ordering != Ordering::Greater,
            CompareOp::Gt => ordering == Ordering::Greater,
            CompareOp::Ge => ordering != Ordering::Less,
        }
    }
}

impl ValueExpr {
    pub fn var(name: impl Into<String>) -> Self {
        ValueExpr::Var(name.into())
    }

    pub fn constant(term: Term) -> Self {
        ValueExpr::Constant(term)
    }

    pub fn compare(op: CompareOp, left: ValueExpr, right: ValueExpr) -> Self {
        ValueExpr::Compare {
            op,
            left: Box::new(left),
            right: Box::new(right),
        }
    }

    pub fn eq(left: ValueExpr, right: ValueExpr) -> Self {
        Self::compare(CompareOp::Eq, left, right)
    }

    pub fn and(left: ValueExpr, right: ValueExpr) -> Self {
        ValueExpr::And(Box::new(left), Box::new(right))
    }

    pub fn or(left: ValueExpr, right: ValueExpr) -> Self {
        ValueExpr::Or(Box::new(left), Box::new(right))
    }

    pub fn not(arg: ValueExpr) -> Self {
        ValueExpr::Not(Box::new(arg))
    }

    pub fn regex(arg: ValueExpr, pattern: &str, flags: Option<&str>) -> Self {
        ValueExpr::Regex {
            arg: Box::new(arg),
            pattern: Box::new(ValueExpr::Constant(Term::literal(pattern))),
            flags: flags.map(|f| Box::new(ValueExpr::Constant(Term::literal(f)))),
        }
    }

    /// Distinct variables referenced by the expression
    pub fn vars(&self) -> Vec<String> {
        let mut vars = Vec::new();
        self.collect_vars(&mut vars);
        vars
    }

    fn collect_vars(&self, out: &mut Vec<String>) {
        match self {
            ValueExpr::Var(name) | ValueExpr::Bound(name) => {
                if !out.iter().any(|v| v == name) {
                    out.push(name.clone());
                }
            }
            ValueExpr::Constant(_) => {}
            ValueExpr::Compare { left, right, .. }
            | ValueExpr::And(left, right)
            | ValueExpr::Or(left, right) => {
                left.collect_vars(out);
                right.collect_vars(out);
            }
            ValueExpr::Not(arg) => arg.collect_vars(out),
            ValueExpr::Regex { arg, pattern, flags } => {
                arg.collect_vars(out);
                pattern.collect_vars(out);
                if let Some(flags) = flags {
                    flags.collect_vars(out);
                }
            }
        }
    }

    /// Split a conjunction into its leaves
    pub fn conjuncts(&self) -> Vec<ValueExpr> {
        match self {
            ValueExpr::And(left, right) => {
                let mut leaves = left.conjuncts();
                leaves.extend(right.conjuncts());
                leaves
            }
            other => vec![other.clone()],
        }
    }

    /// Rebuild a left-deep conjunction; `None` for no leaves
    pub fn and_all(leaves: Vec<ValueExpr>) -> Option<ValueExpr> {
        leaves.into_iter().reduce(ValueExpr::and)
    }

    /// Whether the expression can be evaluated next to a single pattern.
    /// Disjunctions are kept where they are.
    pub fn is_pushable(&self) -> bool {
        match self {
            ValueExpr::Or(_, _) => false,
            ValueExpr::And(left, right) => left.is_pushable() && right.is_pushable(),
            ValueExpr::Not(arg) => arg.is_pushable(),
            _ => true,
        }
    }

    /// `?var = <resource>` in either orientation
    pub fn as_resource_equality(&self) -> Option<(&str, &Term)> {
        match self {
            ValueExpr::Compare { op: CompareOp::Eq, left, right } => match (left.as_ref(), right.as_ref()) {
                (ValueExpr::Var(name), ValueExpr::Constant(term))
                | (ValueExpr::Constant(term), ValueExpr::Var(name))
                    if term.is_resource() =>
                {
                    Some((name.as_str(), term))
                }
                _ => None,
            },
            _ => None,
        }
    }

    /// Replace bound variables by their values
    pub fn substitute(&self, bindings: &BindingSet) -> ValueExpr {
        match self {
            ValueExpr::Var(name) => match bindings.get(name) {
                Some(value) => ValueExpr::Constant(value.clone()),
                None => self.clone(),
            },
            ValueExpr::Bound(name) if bindings.contains(name) => ValueExpr::Constant(Term::boolean(true)),
            ValueExpr::Bound(_) | ValueExpr::Constant(_) => self.clone(),
            ValueExpr::Compare { op, left, right } => ValueExpr::Compare {
                op: *op,
                left: Box::new(left.substitute(bindings)),
                right: Box::new(right.substitute(bindings)),
            },
            ValueExpr::And(left, right) => ValueExpr::and(left.substitute(bindings), right.substitute(bindings)),
            ValueExpr::Or(left, right) => ValueExpr::or(left.substitute(bindings), right.substitute(bindings)),
            ValueExpr::Not(arg) => ValueExpr::not(arg.substitute(bindings)),
            ValueExpr::Regex { arg, pattern, flags } => ValueExpr::Regex {
                arg: Box::new(arg.substitute(bindings)),
                pattern: Box::new(pattern.substitute(bindings)),
                flags: flags.as_ref().map(|f| Box::new(f.substitute(bindings))),
            },
        }
    }

    /// Evaluate to a term; `None` signals an evaluation error
    pub fn evaluate(&self, bindings: &BindingSet) -> Option<Term> {
        match self {
            ValueExpr::Var(name) => bindings.get(name).cloned(),
            ValueExpr::Constant(term) => Some(term.clone()),
            _ => self.effective_boolean(bindings).map(Term::boolean),
        }
    }

    /// SPARQL effective boolean value; `None` signals an evaluation error
    pub fn effective_boolean(&self, bindings: &BindingSet) -> Option<bool> {
        match self {
            ValueExpr::Var(_) | ValueExpr::Constant(_) => {
                self.evaluate(bindings).and_then(|t| term_boolean(&t))
            }
            ValueExpr::Bound(name) => Some(bindings.contains(name)),
            ValueExpr::Compare { op, left, right } => {
                let left = left.evaluate(bindings)?;
                let right = right.evaluate(bindings)?;
                compare_terms(*op, &left, &right)
            }
            ValueExpr::And(left, right) => {
                match (left.effective_boolean(bindings), right.effective_boolean(bindings)) {
                    (Some(false), _) | (_, Some(false)) => Some(false),
                    (Some(true), Some(true)) => Some(true),
                    _ => None,
                }
            }
            ValueExpr::Or(left, right) => {
                match (left.effective_boolean(bindings), right.effective_boolean(bindings)) {
                    (Some(true), _) | (_, Some(true)) => Some(true),
                    (Some(false), Some(false)) => Some(false),
                    _ => None,
                }
            }
            ValueExpr::Not(arg) => arg.effective_boolean(bindings).map(|b| !b),
            ValueExpr::Regex { arg, pattern, flags } => {
                let text = arg.evaluate(bindings)?;
                let pattern = pattern.evaluate(bindings)?;
                let flags = match flags {
                    Some(f) => Some(f.evaluate(bindings)?),
                    None => None,
                };
                if !text.is_literal() {
                    return None;
                }
                let mut builder = RegexBuilder::new(pattern.value());
                if let Some(flags) = &flags {
                    for flag in flags.value().chars() {
                        match flag {
                            'i' => { builder.case_insensitive(true); }
                            's' => { builder.dot_matches_new_line(true); }
                            'm' => { builder.multi_line(true); }
                            'x' => { builder.ignore_whitespace(true); }
                            _ => return None,
                        }
                    }
                }
                builder.build().ok().map(|re| re.is_match(text.value()))
            }
        }
    }

    /// Filter semantics: errors reject the solution
    pub fn passes(&self, bindings: &BindingSet) -> bool {
        self.effective_boolean(bindings).unwrap_or(false)
    }

    pub fn to_sparql(&self) -> String {
        match self {
            ValueExpr::Var(name) => format!("?{}", name),
            ValueExpr::Constant(term) => term.to_sparql(),
            ValueExpr::Compare { op, left, right } => {
                format!("({} {} {})", left.to_sparql(), op.symbol(), right.to_sparql())
            }
            ValueExpr::And(left, right) => format!("({} && {})", left.to_sparql(), right.to_sparql()),
            ValueExpr::Or(left, right) => format!("({} || {})", left.to_sparql(), right.to_sparql()),
            ValueExpr::Not(arg) => format!("(!{})", arg.to_sparql()),
            ValueExpr::Bound(name) => format!("bound(?{})", name),
            ValueExpr::Regex { arg, pattern, flags } => match flags {
                Some(flags) => format!(
                    "regex({}, {}, {})",
                    arg.to_sparql(),
                    pattern.to_sparql(),
                    flags.to_sparql()
                ),
                None => format!("regex({}, {})", arg.to_sparql(), pattern.to_sparql()),
            },
        }
    }
}

impl fmt::Display for ValueExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_sparql())
    }
}

fn term_boolean(term: &Term) -> Option<bool> {
    match term {
        Term::Literal(lit) => {
            if lit.datatype.as_deref() == Some(XSD_BOOLEAN) {
                return match lit.lexical.as_str() {
                    "true" | "1" => Some(true),
                    "false" | "0" => Some(false),
                    _ => None,
                };
            }
            if let Some(n) = term.numeric_value() {
                return Some(n != 0.0 && !n.is_nan());
            }
            if term.is_plain_string() {
                return Some(!lit.lexical.is_empty());
            }
            None
        }
        _ => None,
    }
}

fn compare_terms(op: CompareOp, left: &Term, right: &Term) -> Option<bool> {
    if let (Some(l), Some(r)) = (left.numeric_value(), right.numeric_value()) {
        return l.partial_cmp(&r).map(|ord| op.accepts(ord));
    }
    if left.is_plain_string() && right.is_plain_string() {
        return Some(op.accepts(left.value().cmp(right.value())));
    }
    match op {
        CompareOp::Eq => Some(left == right),
        CompareOp::Ne => Some(left != right),
        _ => None,
    }
}
