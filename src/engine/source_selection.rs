use crate::algebra::pattern::StatementPattern;
use crate::algebra::plan::StatementSource;
use crate::endpoints::endpoint_trait::{Endpoint, EndpointRegistry};
use crate::engine::cache::{Membership, PatternKey, SourceSelectionCache};
use crate::engine::query_info::QueryInfo;
use crate::utils::config::SourceSelectionConfig;
use crate::utils::error::{FedError, FedResult};
use crate::utils::types::BindingSet;
use futures_util::stream::{self, StreamExt};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

struct Probe {
    key: PatternKey,
    pattern: StatementPattern,
    endpoint: Arc<dyn Endpoint>,
    /// Patterns sharing this (key, endpoint) pair
    patterns: Vec<usize>,
}

/// Determines the endpoints able to contribute to each pattern, probing
/// endpoints concurrently on cache misses
pub struct SourceSelector {
    registry: Arc<EndpointRegistry>,
    cache: Arc<SourceSelectionCache>,
    config: SourceSelectionConfig,
}

impl SourceSelector {
    pub fn new(
        registry: Arc<EndpointRegistry>,
        cache: Arc<SourceSelectionCache>,
        config: SourceSelectionConfig,
    ) -> Self {
        Self { registry, cache, config }
    }

    /// Sources of a single pattern
    pub async fn select_for_pattern(
        &self,
        pattern: &StatementPattern,
        query_info: &QueryInfo,
    ) -> FedResult<Vec<StatementSource>> {
        let mut sources = self.select(std::slice::from_ref(pattern), query_info).await?;
        Ok(sources.pop().unwrap_or_default())
    }

    /// Sources per pattern, in input order; each list is ordered by endpoint id
    pub async fn select(
        &self,
        patterns: &[StatementPattern],
        query_info: &QueryInfo,
    ) -> FedResult<Vec<Vec<StatementSource>>> {
        query_info.check_aborted()?;
        let endpoints = self.registry.list();
        let mut sources: Vec<Vec<StatementSource>> = vec![Vec::new(); patterns.len()];
        let mut probes: Vec<Probe> = Vec::new();
        let mut probe_index: HashMap<(PatternKey, String), usize> = HashMap::new();

        for (i, pattern) in patterns.iter().enumerate() {
            let key = PatternKey::from_pattern(pattern);
            for endpoint in &endpoints {
                match self.cache.lookup(&key, endpoint.id()) {
                    Membership::Confirmed => {
                        sources[i].push(StatementSource::new(endpoint.id(), endpoint.source_type()))
                    }
                    Membership::Absent => {}
                    Membership::Unknown => {
                        let slot = (key.clone(), endpoint.id().to_string());
                        match probe_index.get(&slot) {
                            Some(&existing) => probes[existing].patterns.push(i),
                            None => {
                                probe_index.insert(slot, probes.len());
                                probes.push(Probe {
                                    key: key.clone(),
                                    pattern: pattern.clone(),
                                    endpoint: endpoint.clone(),
                                    patterns: vec![i],
                                });
                            }
                        }
                    }
                }
            }
        }

        if !probes.is_empty() {
            debug!(query_id = query_info.id(), probes = probes.len(), "probing endpoints");
            let mut failures: Vec<Option<FedError>> = vec![None; patterns.len()];
            for (probe, outcome) in self.run_probes(probes, query_info).await? {
                match outcome {
                    Ok(has_data) => {
                        self.cache.update(&probe.key, probe.endpoint.id(), has_data);
                        if has_data {
                            for &i in &probe.patterns {
                                sources[i].push(StatementSource::new(
                                    probe.endpoint.id(),
                                    probe.endpoint.source_type(),
                                ));
                            }
                        }
                    }
                    Err(e) => {
                        warn!(
                            endpoint = %probe.endpoint.id(),
                            pattern = %probe.pattern,
                            error = %e,
                            "source probe failed, treating endpoint as not contributing"
                        );
                        for &i in &probe.patterns {
                            failures[i].get_or_insert_with(|| e.clone());
                        }
                    }
                }
            }

            if self.config.fail_on_unresolved_sources {
                for (i, failure) in failures.into_iter().enumerate() {
                    if let (true, Some(e)) = (sources[i].is_empty(), failure) {
                        return Err(e);
                    }
                }
            }
        }

        for list in &mut sources {
            list.sort_by(|a, b| a.endpoint_id.cmp(&b.endpoint_id));
        }
        Ok(sources)
    }

    async fn run_probes(
        &self,
        probes: Vec<Probe>,
        query_info: &QueryInfo,
    ) -> FedResult<Vec<(Probe, FedResult<bool>)>> {
        let concurrency = match self.config.probe_concurrency {
            0 => probes.len().max(1),
            n => n,
        };
        let all = stream::iter(probes)
            .map(|probe| async move {
                let outcome = probe.endpoint.has_statements(&probe.pattern, &BindingSet::new()).await;
                (probe, outcome)
            })
            .buffer_unordered(concurrency)
            .collect::<Vec<_>>();

        match query_info.remaining_time() {
            Some(remaining) => tokio::time::timeout(remaining, all).await.map_err(|_| {
                FedError::Timeout(format!(
                    "query {} timed out during source selection",
                    query_info.id()
                ))
            }),
            None => Ok(all.await),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algebra::pattern::PatternTerm;
    use crate::algebra::tuple_expr::QueryType;
    use crate::endpoints::memory_endpoint::MemoryEndpoint;
    use crate::utils::types::Term;

    const P: &str = "http://ex.org/p";
    const Q: &str = "http://ex.org/q";

    fn pattern(p: &str) -> StatementPattern {
        StatementPattern::new(PatternTerm::var("s"), PatternTerm::iri(p), PatternTerm::var("o"))
    }

    fn setup(config: SourceSelectionConfig) -> (Arc<MemoryEndpoint>, Arc<MemoryEndpoint>, SourceSelector) {
        let e1 = Arc::new(MemoryEndpoint::new("e1").with_triple(Term::iri("a"), Term::iri(P), Term::iri("b")));
        let e2 = Arc::new(MemoryEndpoint::new("e2").with_triple(Term::iri("c"), Term::iri(Q), Term::iri("d")));
        let registry = Arc::new(EndpointRegistry::new());
        registry.register(e1.clone()).unwrap();
        registry.register(e2.clone()).unwrap();
        let selector = SourceSelector::new(registry, Arc::new(SourceSelectionCache::default()), config);
        (e1, e2, selector)
    }

    fn query_info() -> QueryInfo {
        QueryInfo::new("test", QueryType::Select, None)
    }

    #[tokio::test]
    async fn test_exclusive_sources_and_warm_cache() {
        let (e1, e2, selector) = setup(SourceSelectionConfig::default());
        let info = query_info();

        let sources = selector.select(&[pattern(P), pattern(Q)], &info).await.unwrap();
        assert_eq!(sources[0].len(), 1);
        assert_eq!(sources[0][0].endpoint_id, "e1");
        assert_eq!(sources[1][0].endpoint_id, "e2");
        assert_eq!(e1.probe_count() + e2.probe_count(), 4);

        e1.reset_counters();
        e2.reset_counters();
        selector.select(&[pattern(P), pattern(Q)], &info).await.unwrap();
        assert_eq!(e1.probe_count() + e2.probe_count(), 0);
    }

    #[tokio::test]
    async fn test_duplicate_patterns_probe_once() {
        let (e1, _e2, selector) = setup(SourceSelectionConfig::default());
        let sources = selector.select(&[pattern(P), pattern(P)], &query_info()).await.unwrap();

        assert_eq!(sources[0], sources[1]);
        assert_eq!(e1.probe_count(), 1);
    }

    #[tokio::test]
    async fn test_probe_failure_is_not_fatal_by_default() {
        let (e1, _e2, selector) = setup(SourceSelectionConfig::default());
        e1.set_fail_probes(true);

        let sources = selector.select_for_pattern(&pattern(P), &query_info()).await.unwrap();
        assert!(sources.is_empty());
    }

    #[tokio::test]
    async fn test_probe_failure_can_be_fatal() {
        let config = SourceSelectionConfig {
            fail_on_unresolved_sources: true,
            probe_concurrency: 1,
        };
        let (e1, _e2, selector) = setup(config);
        e1.set_fail_probes(true);

        let result = selector.select_for_pattern(&pattern(P), &query_info()).await;
        match result {
            Err(e) => assert_eq!(e.endpoint_id(), Some("e1")),
            _ => panic!("Expected probe error"),
        }
    }
}
