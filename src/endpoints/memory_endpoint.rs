use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::RwLock;
use std::time::Duration;
use crate::algebra::{expr::ValueExpr, pattern::StatementPattern};
use crate::endpoints::endpoint_trait::{
    tag_row, BoundRequest, Endpoint, EndpointCapabilities, EndpointClassification, StatementRequest,
};
use crate::engine::cursor::Cursor;
use crate::utils::{
    error::{connection_error, remote_evaluation_error, FedResult},
    types::{BindingSet, Term, Triple},
};

/// In-memory endpoint with deterministic data, for embedding and testing.
///
/// Supports an artificial response delay, failure injection and counts every
/// data request and existence probe it serves.
#[derive(Debug)]
pub struct MemoryEndpoint {
    id: String,
    name: String,
    triples: RwLock<Vec<Triple>>,
    delay: Option<Duration>,
    capabilities: EndpointCapabilities,
    fail_requests: AtomicBool,
    fail_probes: AtomicBool,
    connection_faults: AtomicBool,
    request_count: AtomicUsize,
    probe_count: AtomicUsize,
    repair_count: AtomicUsize,
}

impl MemoryEndpoint {
    pub fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            name: id.to_string(),
            triples: RwLock::new(Vec::new()),
            delay: None,
            capabilities: EndpointCapabilities::default(),
            fail_requests: AtomicBool::new(false),
            fail_probes: AtomicBool::new(false),
            connection_faults: AtomicBool::new(false),
            request_count: AtomicUsize::new(0),
            probe_count: AtomicUsize::new(0),
            repair_count: AtomicUsize::new(0),
        }
    }

    pub fn with_name(mut self, name: &str) -> Self {
        self.name = name.to_string();
        self
    }

    /// Delay every request and probe
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn with_capabilities(mut self, capabilities: EndpointCapabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    pub fn with_triple(self, subject: Term, predicate: Term, object: Term) -> Self {
        self.add_triple(Triple::new(subject, predicate, object));
        self
    }

    pub fn with_triples(self, triples: impl IntoIterator<Item = Triple>) -> Self {
        for triple in triples {
            self.add_triple(triple);
        }
        self
    }

    pub fn add_triple(&self, triple: Triple) {
        let mut triples = self.triples.write().unwrap_or_else(|p| p.into_inner());
        triples.push(triple);
    }

    pub fn triple_count(&self) -> usize {
        self.triples.read().unwrap_or_else(|p| p.into_inner()).len()
    }

    /// Make data requests fail with a remote evaluation error
    pub fn set_fail_requests(&self, fail: bool) {
        self.fail_requests.store(fail, Ordering::SeqCst);
    }

    /// Make existence probes fail with a remote evaluation error
    pub fn set_fail_probes(&self, fail: bool) {
        self.fail_probes.store(fail, Ordering::SeqCst);
    }

    /// Report failures as connection faults instead of remote errors
    pub fn set_connection_faults(&self, faults: bool) {
        self.connection_faults.store(faults, Ordering::SeqCst);
    }

    pub fn request_count(&self) -> usize {
        self.request_count.load(Ordering::SeqCst)
    }

    pub fn probe_count(&self) -> usize {
        self.probe_count.load(Ordering::SeqCst)
    }

    pub fn repair_count(&self) -> usize {
        self.repair_count.load(Ordering::SeqCst)
    }

    pub fn reset_counters(&self) {
        self.request_count.store(0, Ordering::SeqCst);
        self.probe_count.store(0, Ordering::SeqCst);
    }

    async fn simulate_latency(&self) {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
    }

    fn failure(&self, operation: &str) -> FedResult<()> {
        let failing = match operation {
            "probe" => self.fail_probes.load(Ordering::SeqCst),
            _ => self.fail_requests.load(Ordering::SeqCst),
        };
        if !failing {
            return Ok(());
        }
        if self.connection_faults.load(Ordering::SeqCst) {
            Err(connection_error(&self.id, format!("{} failed: connection refused", operation)))
        } else {
            Err(remote_evaluation_error(
                &self.id,
                &format!("simulated {} failure", operation),
                "",
            ))
        }
    }

    /// Nested-loop evaluation of a basic graph pattern seeded with `bindings`
    fn evaluate_bgp(&self, patterns: &[StatementPattern], bindings: &BindingSet) -> Vec<BindingSet> {
        let triples = self.triples.read().unwrap_or_else(|p| p.into_inner());
        let mut solutions = vec![bindings.clone()];
        for pattern in patterns {
            let mut next = Vec::new();
            for partial in &solutions {
                let bound = pattern.bind(partial);
                for triple in triples.iter() {
                    if let Some(solution) = bound.matches(triple) {
                        if let Some(merged) = partial.merge(&solution) {
                            next.push(merged);
                        }
                    }
                }
            }
            solutions = next;
            if solutions.is_empty() {
                break;
            }
        }
        solutions
    }

    fn apply_filter(rows: Vec<BindingSet>, filter: Option<&ValueExpr>) -> Vec<BindingSet> {
        match filter {
            Some(filter) => rows.into_iter().filter(|row| filter.passes(row)).collect(),
            None => rows,
        }
    }
}

#[async_trait]
impl Endpoint for MemoryEndpoint {
    fn id(&self) -> &str {
        &self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn classification(&self) -> EndpointClassification {
        EndpointClassification::Local
    }

    fn capabilities(&self) -> EndpointCapabilities {
        self.capabilities.clone()
    }

    async fn has_statements(&self, pattern: &StatementPattern, bindings: &BindingSet) -> FedResult<bool> {
        self.probe_count.fetch_add(1, Ordering::SeqCst);
        self.simulate_latency().await;
        self.failure("probe")?;

        let bound = pattern.bind(bindings);
        let triples = self.triples.read().unwrap_or_else(|p| p.into_inner());
        Ok(triples.iter().any(|t| bound.matches(t).is_some()))
    }

    async fn get_statements(&self, request: &StatementRequest) -> FedResult<Cursor<BindingSet>> {
        self.request_count.fetch_add(1, Ordering::SeqCst);
        self.simulate_latency().await;
        self.failure("request")?;

        let rows = self.evaluate_bgp(&request.patterns, &request.bindings);
        let rows = Self::apply_filter(rows, request.filter.as_ref());
        let rows = match &request.projection {
            Some(vars) => {
                let mut keep: Vec<String> = vars.clone();
                keep.extend(request.bindings.names().cloned());
                rows.into_iter().map(|row| row.project(&keep)).collect()
            }
            None => rows,
        };
        Ok(Cursor::from_vec(rows))
    }

    async fn get_bound_statements(&self, request: &BoundRequest) -> FedResult<Cursor<BindingSet>> {
        self.request_count.fetch_add(1, Ordering::SeqCst);
        self.simulate_latency().await;
        self.failure("request")?;

        let mut rows = Vec::new();
        for (index, bindings) in request.bindings.iter().enumerate() {
            let solutions = self.evaluate_bgp(&request.patterns, bindings);
            for row in Self::apply_filter(solutions, request.filter.as_ref()) {
                rows.push(tag_row(row, index));
            }
        }
        Ok(Cursor::from_vec(rows))
    }

    async fn get_triples(
        &self,
        subject: Option<&Term>,
        predicate: Option<&Term>,
        object: Option<&Term>,
    ) -> FedResult<Cursor<Triple>> {
        self.request_count.fetch_add(1, Ordering::SeqCst);
        self.simulate_latency().await;
        self.failure("request")?;

        let pattern = StatementPattern::from_positions(subject, predicate, object);
        let triples = self.triples.read().unwrap_or_else(|p| p.into_inner());
        let matching: Vec<Triple> = triples
            .iter()
            .filter(|t| pattern.matches(t).is_some())
            .cloned()
            .collect();
        Ok(Cursor::from_vec(matching))
    }

    async fn repair_connection(&self) -> FedResult<()> {
        self.repair_count.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algebra::pattern::PatternTerm;
    use crate::endpoints::endpoint_trait::untag_row;
    use crate::utils::error::{EndpointError, FedError};

    const P: &str = "http://ex.org/p";
    const Q: &str = "http://ex.org/q";

    fn endpoint() -> MemoryEndpoint {
        MemoryEndpoint::new("mem")
            .with_triple(Term::iri("a"), Term::iri(P), Term::iri("b"))
            .with_triple(Term::iri("b"), Term::iri(Q), Term::iri("c"))
            .with_triple(Term::iri("x"), Term::iri(P), Term::iri("y"))
    }

    fn sp(s: PatternTerm, p: &str, o: PatternTerm) -> StatementPattern {
        StatementPattern::new(s, PatternTerm::iri(p), o)
    }

    #[tokio::test]
    async fn test_get_statements_joins_patterns() {
        let ep = endpoint();
        let request = StatementRequest::new(
            vec![
                sp(PatternTerm::var("s"), P, PatternTerm::var("o")),
                sp(PatternTerm::var("o"), Q, PatternTerm::var("z")),
            ],
            BindingSet::new(),
        );
        let rows = ep.get_statements(&request).await.unwrap().collect_all().await.unwrap();

        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].get("z"), Some(&Term::iri("c")));
        assert_eq!(ep.request_count(), 1);
    }

    #[tokio::test]
    async fn test_rows_include_input_bindings() {
        let ep = endpoint();
        let bindings = BindingSet::new().with("s", Term::iri("a")).with("extra", Term::literal("kept"));
        let request = StatementRequest::new(vec![sp(PatternTerm::var("s"), P, PatternTerm::var("o"))], bindings)
            .with_projection(Some(vec!["o".to_string()]));
        let rows = ep.get_statements(&request).await.unwrap().collect_all().await.unwrap();

        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].get("extra"), Some(&Term::literal("kept")));
        assert_eq!(rows[0].get("o"), Some(&Term::iri("b")));
    }

    #[tokio::test]
    async fn test_bound_statements_are_tagged() {
        let ep = endpoint();
        let request = BoundRequest {
            patterns: vec![sp(PatternTerm::var("s"), P, PatternTerm::var("o"))],
            bindings: vec![
                BindingSet::new().with("s", Term::iri("x")),
                BindingSet::new().with("s", Term::iri("nothing")),
                BindingSet::new().with("s", Term::iri("a")),
            ],
            filter: None,
        };
        let rows = ep.get_bound_statements(&request).await.unwrap().collect_all().await.unwrap();
        let mut indexes: Vec<usize> = rows.into_iter().filter_map(untag_row).map(|(i, _)| i).collect();
        indexes.sort();

        assert_eq!(indexes, vec![0, 2]);
        assert_eq!(ep.request_count(), 1);
    }

    #[tokio::test]
    async fn test_has_statements_counts_probes() {
        let ep = endpoint();
        let pattern = sp(PatternTerm::var("s"), Q, PatternTerm::var("o"));
        assert!(ep.has_statements(&pattern, &BindingSet::new()).await.unwrap());
        assert!(!ep
            .has_statements(&pattern, &BindingSet::new().with("s", Term::iri("a")))
            .await
            .unwrap());
        assert_eq!(ep.probe_count(), 2);
        assert_eq!(ep.request_count(), 0);
    }

    #[tokio::test]
    async fn test_failure_injection() {
        let ep = endpoint();
        ep.set_fail_requests(true);
        let request = StatementRequest::new(vec![sp(PatternTerm::var("s"), P, PatternTerm::var("o"))], BindingSet::new());
        match ep.get_statements(&request).await {
            Err(FedError::Endpoint(EndpointError::RemoteEvaluation { endpoint_id, .. })) => {
                assert_eq!(endpoint_id, "mem")
            }
            _ => panic!("Expected RemoteEvaluation error"),
        }

        ep.set_connection_faults(true);
        let err = ep.get_statements(&request).await.unwrap_err();
        assert!(err.is_connection_fault());
    }

    #[tokio::test]
    async fn test_get_triples_filters_positions() {
        let ep = endpoint();
        let triples = ep
            .get_triples(None, Some(&Term::iri(P)), None)
            .await
            .unwrap()
            .collect_all()
            .await
            .unwrap();
        assert_eq!(triples.len(), 2);
    }
}
