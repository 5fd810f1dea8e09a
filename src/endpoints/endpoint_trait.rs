use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{info, warn};
use crate::algebra::{expr::ValueExpr, pattern::StatementPattern, plan::SourceType};
use crate::engine::cursor::Cursor;
use crate::engine::executor::lock;
use crate::utils::{
    error::{EndpointError, FedError, FedResult},
    types::{BindingSet, Term, Triple},
};

/// Variable carrying the originating binding index in bound join results
pub const BOUND_JOIN_INDEX_VAR: &str = "__fedx_idx";

/// Minimum interval between two connection repairs of the same endpoint
pub const REPAIR_DEBOUNCE: Duration = Duration::from_secs(3);

/// Where an endpoint's data lives
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EndpointClassification {
    Local,
    Remote,
}

/// Capabilities supported by an endpoint
#[derive(Debug, Clone)]
pub struct EndpointCapabilities {
    pub supports_prepared_queries: bool,
    pub supports_ask_queries: bool,
}

impl Default for EndpointCapabilities {
    fn default() -> Self {
        Self {
            supports_prepared_queries: false,
            supports_ask_queries: true,
        }
    }
}

/// Request for the solutions of a group of patterns under one binding
#[derive(Debug, Clone)]
pub struct StatementRequest {
    pub patterns: Vec<StatementPattern>,
    pub bindings: BindingSet,
    pub filter: Option<ValueExpr>,
    /// Variables to return besides the input bindings; `None` returns all
    pub projection: Option<Vec<String>>,
}

/// Request instantiating the same patterns once per binding
#[derive(Debug, Clone)]
pub struct BoundRequest {
    pub patterns: Vec<StatementPattern>,
    pub bindings: Vec<BindingSet>,
    pub filter: Option<ValueExpr>,
}

impl StatementRequest {
    pub fn new(patterns: Vec<StatementPattern>, bindings: BindingSet) -> Self {
        Self {
            patterns,
            bindings,
            filter: None,
            projection: None,
        }
    }

    pub fn with_filter(mut self, filter: Option<ValueExpr>) -> Self {
        self.filter = filter;
        self
    }

    pub fn with_projection(mut self, projection: Option<Vec<String>>) -> Self {
        self.projection = projection;
        self
    }
}

/// Tag a bound join result row with the index of its originating binding
pub fn tag_row(mut row: BindingSet, index: usize) -> BindingSet {
    row.insert(BOUND_JOIN_INDEX_VAR, Term::integer(index as i64));
    row
}

/// Split a tagged row into its binding index and payload
pub fn untag_row(mut row: BindingSet) -> Option<(usize, BindingSet)> {
    let tag = row.remove(BOUND_JOIN_INDEX_VAR)?;
    let index = tag.value().trim().parse::<usize>().ok()?;
    Some((index, row))
}

/// A federation member
#[async_trait]
pub trait Endpoint: Send + Sync {
    /// Unique identifier within the federation
    fn id(&self) -> &str;

    /// Display name
    fn name(&self) -> &str;

    /// Service location, for remote endpoints
    fn url(&self) -> Option<&str> {
        None
    }

    fn classification(&self) -> EndpointClassification;

    fn capabilities(&self) -> EndpointCapabilities;

    /// Prepare the endpoint for use
    async fn initialize(&self) -> FedResult<()> {
        Ok(())
    }

    /// Release resources
    async fn shutdown(&self) -> FedResult<()> {
        Ok(())
    }

    /// Existence check for a pattern under the given bindings
    async fn has_statements(&self, pattern: &StatementPattern, bindings: &BindingSet) -> FedResult<bool>;

    /// Solutions of the request's patterns; each row includes the input bindings
    async fn get_statements(&self, request: &StatementRequest) -> FedResult<Cursor<BindingSet>>;

    /// One request for all bindings; rows are tagged with [`BOUND_JOIN_INDEX_VAR`]
    async fn get_bound_statements(&self, request: &BoundRequest) -> FedResult<Cursor<BindingSet>>;

    /// Matching triples; `None` positions are unconstrained
    async fn get_triples(
        &self,
        subject: Option<&Term>,
        predicate: Option<&Term>,
        object: Option<&Term>,
    ) -> FedResult<Cursor<Triple>>;

    /// Evaluate a complete query text as-is
    async fn evaluate_query(&self, _query: &str, _bindings: &BindingSet) -> FedResult<Cursor<BindingSet>> {
        Err(EndpointError::Unsupported {
            endpoint_id: self.id().to_string(),
            operation: "prepared queries".to_string(),
        }
        .into())
    }

    /// Best-effort recovery after a transient network fault
    async fn repair_connection(&self) -> FedResult<()> {
        Ok(())
    }

    fn source_type(&self) -> SourceType {
        match self.classification() {
            EndpointClassification::Local => SourceType::Local,
            EndpointClassification::Remote => SourceType::Remote,
        }
    }
}

/// Endpoints participating in a federation
pub struct EndpointRegistry {
    endpoints: DashMap<String, Arc<dyn Endpoint>>,
    last_repair: Mutex<HashMap<String, Instant>>,
}

impl EndpointRegistry {
    pub fn new() -> Self {
        Self {
            endpoints: DashMap::new(),
            last_repair: Mutex::new(HashMap::new()),
        }
    }

    /// Register an endpoint under its id
    pub fn register(&self, endpoint: Arc<dyn Endpoint>) -> FedResult<()> {
        let id = endpoint.id().to_string();
        if self.endpoints.contains_key(&id) {
            return Err(FedError::Configuration(format!(
                "Endpoint '{}' is already registered",
                id
            )));
        }
        self.endpoints.insert(id, endpoint);
        Ok(())
    }

    pub fn unregister(&self, id: &str) -> Option<Arc<dyn Endpoint>> {
        self.endpoints.remove(id).map(|(_, endpoint)| endpoint)
    }

    pub fn get(&self, id: &str) -> FedResult<Arc<dyn Endpoint>> {
        self.endpoints
            .get(id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| EndpointError::UnknownEndpoint(id.to_string()).into())
    }

    /// Find an endpoint by id, name or URL
    pub fn resolve(&self, reference: &str) -> Option<Arc<dyn Endpoint>> {
        if let Some(entry) = self.endpoints.get(reference) {
            return Some(entry.value().clone());
        }
        self.endpoints
            .iter()
            .find(|entry| entry.name() == reference || entry.url() == Some(reference))
            .map(|entry| entry.value().clone())
    }

    /// All endpoints ordered by id
    pub fn list(&self) -> Vec<Arc<dyn Endpoint>> {
        let mut endpoints: Vec<Arc<dyn Endpoint>> =
            self.endpoints.iter().map(|entry| entry.value().clone()).collect();
        endpoints.sort_by(|a, b| a.id().cmp(b.id()));
        endpoints
    }

    pub fn ids(&self) -> Vec<String> {
        self.list().iter().map(|e| e.id().to_string()).collect()
    }

    pub fn len(&self) -> usize {
        self.endpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }

    /// Repair an endpoint's connection, at most once per debounce window.
    /// Returns whether a repair was attempted.
    pub async fn repair_connection(&self, id: &str) -> bool {
        {
            let mut last = lock(&self.last_repair);
            let now = Instant::now();
            if let Some(previous) = last.get(id) {
                if now.duration_since(*previous) < REPAIR_DEBOUNCE {
                    return false;
                }
            }
            last.insert(id.to_string(), now);
        }

        let endpoint = match self.get(id) {
            Ok(endpoint) => endpoint,
            Err(_) => return false,
        };
        match endpoint.repair_connection().await {
            Ok(()) => info!(endpoint = %id, "connection repaired"),
            Err(e) => warn!(endpoint = %id, error = %e, "connection repair failed"),
        }
        true
    }

    pub async fn repair_all_connections(&self) {
        for id in self.ids() {
            self.repair_connection(&id).await;
        }
    }
}

impl Default for EndpointRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoints::memory_endpoint::MemoryEndpoint;

    #[test]
    fn test_registry_rejects_duplicates() {
        let registry = EndpointRegistry::new();
        assert!(registry.register(Arc::new(MemoryEndpoint::new("e1"))).is_ok());

        match registry.register(Arc::new(MemoryEndpoint::new("e1"))) {
            Err(FedError::Configuration(msg)) => assert!(msg.contains("already registered")),
            _ => panic!("Expected Configuration error"),
        }
    }

    #[test]
    fn test_registry_lists_sorted_and_resolves() {
        let registry = EndpointRegistry::new();
        registry.register(Arc::new(MemoryEndpoint::new("zeta"))).unwrap();
        registry
            .register(Arc::new(MemoryEndpoint::new("alpha").with_name("Alpha Store")))
            .unwrap();

        assert_eq!(registry.ids(), vec!["alpha", "zeta"]);
        assert_eq!(registry.resolve("Alpha Store").map(|e| e.id().to_string()), Some("alpha".to_string()));
        assert!(registry.resolve("missing").is_none());
        match registry.get("missing") {
            Err(FedError::Endpoint(EndpointError::UnknownEndpoint(id))) => assert_eq!(id, "missing"),
            _ => panic!("Expected UnknownEndpoint error"),
        }
    }

    #[tokio::test]
    async fn test_repair_is_debounced() {
        let registry = EndpointRegistry::new();
        registry.register(Arc::new(MemoryEndpoint::new("e1"))).unwrap();

        assert!(registry.repair_connection("e1").await);
        assert!(!registry.repair_connection("e1").await);
        assert!(!registry.repair_connection("unknown").await);
    }

    #[test]
    fn test_row_tagging() {
        let row = BindingSet::new().with("o", Term::iri("b"));
        let (index, payload) = untag_row(tag_row(row.clone(), 7)).unwrap();
        assert_eq!(index, 7);
        assert_eq!(payload, row);
        assert!(untag_row(row).is_none());
    }
}
