use crate::algebra::expr::ValueExpr;
use crate::algebra::pattern::StatementPattern;
use serde::{Deserialize, Serialize};

/// Query form of an incoming query
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum QueryType {
    Select,
    Ask,
    Construct,
    Describe,
}

/// Parsed query algebra handed to the optimizer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TupleExpr {
    Pattern(StatementPattern),
    Join(Box<TupleExpr>, Box<TupleExpr>),
    LeftJoin {
        left: Box<TupleExpr>,
        right: Box<TupleExpr>,
        condition: Option<ValueExpr>,
    },
    Union(Box<TupleExpr>, Box<TupleExpr>),
    Filter {
        condition: ValueExpr,
        arg: Box<TupleExpr>,
    },
    Projection {
        vars: Vec<String>,
        arg: Box<TupleExpr>,
    },
    Slice {
        offset: usize,
        limit: Option<usize>,
        arg: Box<TupleExpr>,
    },
    Distinct(Box<TupleExpr>),
    Service {
        endpoint: String,
        arg: Box<TupleExpr>,
        silent: bool,
    },
}

/// An incoming query: original text, form and algebra
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParsedQuery {
    pub text: String,
    pub query_type: QueryType,
    pub expr: TupleExpr,
}

impl TupleExpr {
    pub fn pattern(pattern: StatementPattern) -> Self {
        TupleExpr::Pattern(pattern)
    }

    pub fn join(left: TupleExpr, right: TupleExpr) -> Self {
        TupleExpr::Join(Box::new(left), Box::new(right))
    }

    /// Left-deep join over all arguments
    pub fn join_all(args: Vec<TupleExpr>) -> Option<Self> {
        args.into_iter().reduce(TupleExpr::join)
    }

    pub fn left_join(left: TupleExpr, right: TupleExpr, condition: Option<ValueExpr>) -> Self {
        TupleExpr::LeftJoin {
            left: Box::new(left),
            right: Box::new(right),
            condition,
        }
    }

    pub fn union(left: TupleExpr, right: TupleExpr) -> Self {
        TupleExpr::Union(Box::new(left), Box::new(right))
    }

    pub fn filter(condition: ValueExpr, arg: TupleExpr) -> Self {
        TupleExpr::Filter {
            condition,
            arg: Box::new(arg),
        }
    }

    pub fn projection(vars: Vec<&str>, arg: TupleExpr) -> Self {
        TupleExpr::Projection {
            vars: vars.into_iter().map(String::from).collect(),
            arg: Box::new(arg),
        }
    }

    pub fn slice(offset: usize, limit: Option<usize>, arg: TupleExpr) -> Self {
        TupleExpr::Slice {
            offset,
            limit,
            arg: Box::new(arg),
        }
    }

    pub fn distinct(arg: TupleExpr) -> Self {
        TupleExpr::Distinct(Box::new(arg))
    }

    pub fn service(endpoint: impl Into<String>, arg: TupleExpr, silent: bool) -> Self {
        TupleExpr::Service {
            endpoint: endpoint.into(),
            arg: Box::new(arg),
            silent,
        }
    }

    /// Statement patterns in document order
    pub fn patterns(&self) -> Vec<&StatementPattern> {
        let mut out = Vec::new();
        self.collect_patterns(&mut out);
        out
    }

    fn collect_patterns<'a>(&'a self, out: &mut Vec<&'a StatementPattern>) {
        match self {
            TupleExpr::Pattern(p) => out.push(p),
            TupleExpr::Join(l, r) | TupleExpr::Union(l, r) => {
                l.collect_patterns(out);
                r.collect_patterns(out);
            }
            TupleExpr::LeftJoin { left, right, .. } => {
                left.collect_patterns(out);
                right.collect_patterns(out);
            }
            TupleExpr::Filter { arg, .. }
            | TupleExpr::Projection { arg, .. }
            | TupleExpr::Slice { arg, .. }
            | TupleExpr::Distinct(arg)
            | TupleExpr::Service { arg, .. } => arg.collect_patterns(out),
        }
    }
}

impl ParsedQuery {
    pub fn new(text: impl Into<String>, query_type: QueryType, expr: TupleExpr) -> Self {
        Self {
            text: text.into(),
            query_type,
            expr,
        }
    }

    pub fn select(text: impl Into<String>, expr: TupleExpr) -> Self {
        Self::new(text, QueryType::Select, expr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algebra::pattern::PatternTerm;

    fn sp(s: &str, p: &str, o: &str) -> StatementPattern {
        StatementPattern::new(PatternTerm::var(s), PatternTerm::iri(p), PatternTerm::var(o))
    }

    #[test]
    fn test_patterns_in_document_order() {
        let expr = TupleExpr::projection(
            vec!["a"],
            TupleExpr::join(
                TupleExpr::pattern(sp("a", "http://ex.org/p", "b")),
                TupleExpr::union(
                    TupleExpr::pattern(sp("b", "http://ex.org/q", "c")),
                    TupleExpr::pattern(sp("b", "http://ex.org/r", "c")),
                ),
            ),
        );
        let patterns = expr.patterns();
        assert_eq!(patterns.len(), 3);
        assert_eq!(patterns[2].predicate, PatternTerm::iri("http://ex.org/r"));
    }

    #[test]
    fn test_join_all_is_left_deep() {
        let joined = TupleExpr::join_all(vec![
            TupleExpr::pattern(sp("a", "p1", "b")),
            TupleExpr::pattern(sp("b", "p2", "c")),
            TupleExpr::pattern(sp("c", "p3", "d")),
        ])
        .unwrap();
        match joined {
            TupleExpr::Join(left, _) => assert!(matches!(*left, TupleExpr::Join(_, _))),
            _ => panic!("Expected Join"),
        }
    }
}
