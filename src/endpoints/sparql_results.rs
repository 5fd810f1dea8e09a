use serde::Deserialize;
use std::collections::HashMap;
use crate::utils::{
    error::{FedError, FedResult},
    types::{BindingSet, Literal, Term},
};

/// SPARQL 1.1 query results, JSON serialization
#[derive(Debug, Clone, Deserialize)]
pub struct SparqlResults {
    #[serde(default)]
    pub head: ResultsHead,
    pub results: Option<ResultsBody>,
    pub boolean: Option<bool>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ResultsHead {
    #[serde(default)]
    pub vars: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ResultsBody {
    pub bindings: Vec<HashMap<String, RdfValue>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RdfValue {
    #[serde(rename = "type")]
    pub kind: String,
    pub value: String,
    #[serde(rename = "xml:lang")]
    pub lang: Option<String>,
    pub datatype: Option<String>,
}

impl RdfValue {
    pub fn to_term(&self) -> FedResult<Term> {
        match self.kind.as_str() {
            "uri" => Ok(Term::Iri(self.value.clone())),
            "bnode" => Ok(Term::BlankNode(self.value.clone())),
            "literal" | "typed-literal" => Ok(Term::Literal(Literal {
                lexical: self.value.clone(),
                datatype: self.datatype.clone(),
                language: self.lang.clone(),
            })),
            other => Err(FedError::MalformedQuery(format!(
                "unknown RDF term type '{}' in results",
                other
            ))),
        }
    }
}

impl SparqlResults {
    pub fn parse(body: &str) -> FedResult<Self> {
        serde_json::from_str(body)
            .map_err(|e| FedError::MalformedQuery(format!("Failed to parse SPARQL results: {}", e)))
    }

    /// Solution rows; empty for boolean results
    pub fn into_rows(self) -> FedResult<Vec<BindingSet>> {
        let body = match self.results {
            Some(body) => body,
            None => return Ok(Vec::new()),
        };
        body.bindings
            .into_iter()
            .map(|solution| {
                solution
                    .into_iter()
                    .map(|(name, value)| value.to_term().map(|term| (name, term)))
                    .collect::<FedResult<BindingSet>>()
            })
            .collect()
    }
}
