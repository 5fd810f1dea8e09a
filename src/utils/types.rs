use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

pub const XSD_STRING: &str = "http://www.w3.org/2001/XMLSchema#string";
pub const XSD_INTEGER: &str = "http://www.w3.org/2001/XMLSchema#integer";
pub const XSD_DECIMAL: &str = "http://www.w3.org/2001/XMLSchema#decimal";
pub const XSD_DOUBLE: &str = "http://www.w3.org/2001/XMLSchema#double";
pub const XSD_BOOLEAN: &str = "http://www.w3.org/2001/XMLSchema#boolean";

/// RDF term
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Term {
    Iri(String),
    BlankNode(String),
    Literal(Literal),
}

/// RDF literal with optional datatype or language tag
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Literal {
    pub lexical: String,
    pub datatype: Option<String>,
    pub language: Option<String>,
}

/// RDF statement
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Triple {
    pub subject: Term,
    pub predicate: Term,
    pub object: Term,
}

/// A solution mapping from variable names to terms
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BindingSet {
    bindings: BTreeMap<String, Term>,
}

impl Term {
    pub fn iri(value: impl Into<String>) -> Self {
        Term::Iri(value.into())
    }

    pub fn blank(id: impl Into<String>) -> Self {
        Term::BlankNode(id.into())
    }

    pub fn literal(lexical: impl Into<String>) -> Self {
        Term::Literal(Literal {
            lexical: lexical.into(),
            datatype: None,
            language: None,
        })
    }

    pub fn typed_literal(lexical: impl Into<String>, datatype: impl Into<String>) -> Self {
        Term::Literal(Literal {
            lexical: lexical.into(),
            datatype: Some(datatype.into()),
            language: None,
        })
    }

    pub fn lang_literal(lexical: impl Into<String>, language: impl Into<String>) -> Self {
        Term::Literal(Literal {
            lexical: lexical.into(),
            datatype: None,
            language: Some(language.into()),
        })
    }

    pub fn integer(value: i64) -> Self {
        Term::typed_literal(value.to_string(), XSD_INTEGER)
    }

    pub fn boolean(value: bool) -> Self {
        Term::typed_literal(value.to_string(), XSD_BOOLEAN)
    }

    /// IRIs and blank nodes
    pub fn is_resource(&self) -> bool {
        matches!(self, Term::Iri(_) | Term::BlankNode(_))
    }

    pub fn is_literal(&self) -> bool {
        matches!(self, Term::Literal(_))
    }

    /// IRI text, blank node label or literal lexical form
    pub fn value(&self) -> &str {
        match self {
            Term::Iri(v) | Term::BlankNode(v) => v,
            Term::Literal(lit) => &lit.lexical,
        }
    }

    /// Numeric value of a numeric-typed literal
    pub fn numeric_value(&self) -> Option<f64> {
        match self {
            Term::Literal(Literal { lexical, datatype: Some(dt), .. })
                if dt == XSD_INTEGER || dt == XSD_DECIMAL || dt == XSD_DOUBLE =>
            {
                lexical.trim().parse::<f64>().ok()
            }
            _ => None,
        }
    }

    pub fn is_plain_string(&self) -> bool {
        match self {
            Term::Literal(Literal { datatype, language: None, .. }) => {
                datatype.as_deref().map_or(true, |dt| dt == XSD_STRING)
            }
            _ => false,
        }
    }

    /// SPARQL surface syntax
    pub fn to_sparql(&self) -> String {
        match self {
            Term::Iri(iri) => format!("<{}>", iri),
            Term::BlankNode(id) => format!("_:{}", id),
            Term::Literal(lit) => {
                let quoted = format!("\"{}\"", escape_literal(&lit.lexical));
                match (&lit.language, &lit.datatype) {
                    (Some(lang), _) => format!("{}@{}", quoted, lang),
                    (None, Some(dt)) if dt != XSD_STRING => format!("{}^^<{}>", quoted, dt),
                    _ => quoted,
                }
            }
        }
    }
}

fn escape_literal(raw: &str) -> String {
    let mut escaped = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '\\' => escaped.push_str("\\\\"),
            '"' => escaped.push_str("\\\""),
            '\n' => escaped.push_str("\\n"),
            '\r' => escaped.push_str("\\r"),
            '\t' => escaped.push_str("\\t"),
            other => escaped.push(other),
        }
    }
    escaped
}

impl fmt::Display for Term {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_sparql())
    }
}

impl Triple {
    pub fn new(subject: Term, predicate: Term, object: Term) -> Self {
        Self { subject, predicate, object }
    }
}

impl fmt::Display for Triple {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {} .", self.subject, self.predicate, self.object)
    }
}

impl BindingSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: impl Into<String>, value: Term) -> Self {
        self.insert(name, value);
        self
    }

    pub fn get(&self, name: &str) -> Option<&Term> {
        self.bindings.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.bindings.contains_key(name)
    }

    pub fn insert(&mut self, name: impl Into<String>, value: Term) -> Option<Term> {
        self.bindings.insert(name.into(), value)
    }

    pub fn remove(&mut self, name: &str) -> Option<Term> {
        self.bindings.remove(name)
    }

    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &String> {
        self.bindings.keys()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Term)> {
        self.bindings.iter()
    }

    /// Join two solutions; `None` when a shared variable disagrees
    pub fn merge(&self, other: &BindingSet) -> Option<BindingSet> {
        let mut merged = self.clone();
        for (name, value) in other.iter() {
            match merged.get(name) {
                Some(existing) if existing != value => return None,
                Some(_) => {}
                None => {
                    merged.insert(name.clone(), value.clone());
                }
            }
        }
        Some(merged)
    }

    /// Keep only the named variables
    pub fn project(&self, vars: &[String]) -> BindingSet {
        let bindings = self
            .bindings
            .iter()
            .filter(|(name, _)| vars.contains(name))
            .map(|(name, value)| (name.clone(), value.clone()))
            .collect();
        BindingSet { bindings }
    }
}

impl FromIterator<(String, Term)> for BindingSet {
    fn from_iter<I: IntoIterator<Item = (String, Term)>>(iter: I) -> Self {
        BindingSet {
            bindings: iter.into_iter().collect(),
        }
    }
}

impl fmt::Display for BindingSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self
            .bindings
            .iter()
            .map(|(name, value)| format!("{}={}", name, value))
            .collect();
        write!(f, "[{}]", parts.join(";"))
    }
}
