use crate::utils::types::{BindingSet, Term, Triple};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Position of a triple pattern: variable or constant
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PatternTerm {
    Var(String),
    Const(Term),
}

/// Triple pattern
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StatementPattern {
    pub subject: PatternTerm,
    pub predicate: PatternTerm,
    pub object: PatternTerm,
}

impl PatternTerm {
    pub fn var(name: impl Into<String>) -> Self {
        PatternTerm::Var(name.into())
    }

    pub fn iri(value: impl Into<String>) -> Self {
        PatternTerm::Const(Term::iri(value))
    }

    pub fn constant(term: Term) -> Self {
        PatternTerm::Const(term)
    }

    pub fn var_name(&self) -> Option<&str> {
        match self {
            PatternTerm::Var(name) => Some(name),
            PatternTerm::Const(_) => None,
        }
    }

    pub fn value(&self) -> Option<&Term> {
        match self {
            PatternTerm::Var(_) => None,
            PatternTerm::Const(term) => Some(term),
        }
    }

    fn bind(&self, bindings: &BindingSet) -> PatternTerm {
        match self {
            PatternTerm::Var(name) => match bindings.get(name) {
                Some(value) => PatternTerm::Const(value.clone()),
                None => self.clone(),
            },
            PatternTerm::Const(_) => self.clone(),
        }
    }

    /// Value under `bindings`, if bound or constant
    pub fn resolve<'a>(&'a self, bindings: &'a BindingSet) -> Option<&'a Term> {
        match self {
            PatternTerm::Var(name) => bindings.get(name),
            PatternTerm::Const(term) => Some(term),
        }
    }

    pub fn to_sparql(&self) -> String {
        match self {
            PatternTerm::Var(name) => format!("?{}", name),
            PatternTerm::Const(term) => term.to_sparql(),
        }
    }
}

impl fmt::Display for PatternTerm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_sparql())
    }
}

impl StatementPattern {
    pub fn new(subject: PatternTerm, predicate: PatternTerm, object: PatternTerm) -> Self {
        Self { subject, predicate, object }
    }

    /// Pattern over `?s ?p ?o` with the given positions fixed
    pub fn from_positions(subject: Option<&Term>, predicate: Option<&Term>, object: Option<&Term>) -> Self {
        let position = |term: Option<&Term>, var: &str| match term {
            Some(value) => PatternTerm::Const(value.clone()),
            None => PatternTerm::var(var),
        };
        Self::new(position(subject, "s"), position(predicate, "p"), position(object, "o"))
    }

    pub fn terms(&self) -> [&PatternTerm; 3] {
        [&self.subject, &self.predicate, &self.object]
    }

    /// Distinct variable names in subject, predicate, object order
    pub fn vars(&self) -> Vec<String> {
        let mut vars: Vec<String> = Vec::new();
        for term in self.terms() {
            if let Some(name) = term.var_name() {
                if !vars.iter().any(|v| v == name) {
                    vars.push(name.to_string());
                }
            }
        }
        vars
    }

    /// Variables not bound by `bindings`
    pub fn free_vars(&self, bindings: &BindingSet) -> Vec<String> {
        self.vars()
            .into_iter()
            .filter(|name| !bindings.contains(name))
            .collect()
    }

    pub fn has_free_vars(&self, bindings: &BindingSet) -> bool {
        self.terms()
            .iter()
            .any(|t| matches!(t.var_name(), Some(name) if !bindings.contains(name)))
    }

    pub fn is_fully_bound(&self) -> bool {
        self.terms().iter().all(|t| t.var_name().is_none())
    }

    /// Substitute bound variables with their values
    pub fn bind(&self, bindings: &BindingSet) -> StatementPattern {
        StatementPattern {
            subject: self.subject.bind(bindings),
            predicate: self.predicate.bind(bindings),
            object: self.object.bind(bindings),
        }
    }

    pub fn bind_var(&self, name: &str, value: &Term) -> StatementPattern {
        self.bind(&BindingSet::new().with(name, value.clone()))
    }

    /// Solution produced by `triple` for this pattern, honoring repeated variables
    pub fn matches(&self, triple: &Triple) -> Option<BindingSet> {
        let mut solution = BindingSet::new();
        let pairs = [
            (&self.subject, &triple.subject),
            (&self.predicate, &triple.predicate),
            (&self.object, &triple.object),
        ];
        for (pattern, value) in pairs {
            match pattern {
                PatternTerm::Const(term) => {
                    if term != value {
                        return None;
                    }
                }
                PatternTerm::Var(name) => match solution.get(name) {
                    Some(existing) if existing != value => return None,
                    Some(_) => {}
                    None => {
                        solution.insert(name.clone(), value.clone());
                    }
                },
            }
        }
        Some(solution)
    }

    pub fn to_sparql(&self) -> String {
        format!(
            "{} {} {} .",
            self.subject.to_sparql(),
            self.predicate.to_sparql(),
            self.object.to_sparql()
        )
    }
}

impl fmt::Display for StatementPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_sparql())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pattern() -> StatementPattern {
        StatementPattern::new(
            PatternTerm::var("s"),
            PatternTerm::iri("http://ex.org/p"),
            PatternTerm::var("o"),
        )
    }

    #[test]
    fn test_free_vars_respect_bindings() {
        let bindings = BindingSet::new().with("s", Term::iri("http://ex.org/a"));
        assert_eq!(pattern().vars(), vec!["s".to_string(), "o".to_string()]);
        assert_eq!(pattern().free_vars(&bindings), vec!["o".to_string()]);
        assert!(pattern().has_free_vars(&bindings));
    }

    #[test]
    fn test_bind_produces_constants() {
        let bindings = BindingSet::new()
            .with("s", Term::iri("http://ex.org/a"))
            .with("o", Term::iri("http://ex.org/b"));
        let bound = pattern().bind(&bindings);

        assert!(bound.is_fully_bound());
        assert_eq!(
            bound.to_sparql(),
            "<http://ex.org/a> <http://ex.org/p> <http://ex.org/b> ."
        );
    }

    #[test]
    fn test_matches_repeated_variable() {
        let p = StatementPattern::new(
            PatternTerm::var("x"),
            PatternTerm::iri("http://ex.org/p"),
            PatternTerm::var("x"),
        );
        let same = Triple::new(Term::iri("a"), Term::iri("http://ex.org/p"), Term::iri("a"));
        let different = Triple::new(Term::iri("a"), Term::iri("http://ex.org/p"), Term::iri("b"));

        assert_eq!(p.matches(&same).map(|s| s.len()), Some(1));
        assert!(p.matches(&different).is_none());
    }

    #[test]
    fn test_matches_rejects_other_predicate() {
        let triple = Triple::new(Term::iri("a"), Term::iri("http://ex.org/q"), Term::iri("b"));
        assert!(pattern().matches(&triple).is_none());
    }
}
