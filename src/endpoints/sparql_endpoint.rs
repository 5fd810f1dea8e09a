use async_trait::async_trait;
use reqwest::{header, Client, StatusCode};
use std::sync::RwLock;
use std::time::Duration;
use tracing::{debug, info};
use url::Url;
use crate::algebra::pattern::StatementPattern;
use crate::endpoints::endpoint_trait::{
    BoundRequest, Endpoint, EndpointCapabilities, EndpointClassification, StatementRequest,
};
use crate::endpoints::query_string;
use crate::endpoints::sparql_results::SparqlResults;
use crate::engine::cursor::Cursor;
use crate::utils::{
    error::{connection_error, remote_evaluation_error, FedError, FedResult},
    types::{BindingSet, Term, Triple},
};

const SPARQL_RESULTS_JSON: &str = "application/sparql-results+json";

/// Remote SPARQL 1.1 protocol endpoint
pub struct SparqlEndpoint {
    id: String,
    name: String,
    url: Url,
    url_text: String,
    client: RwLock<Client>,
    request_timeout: Duration,
    capabilities: EndpointCapabilities,
}

impl SparqlEndpoint {
    pub fn new(id: &str, url: &str) -> FedResult<Self> {
        let url = Url::parse(url)
            .map_err(|e| FedError::Configuration(format!("Invalid endpoint URL '{}': {}", url, e)))?;
        let request_timeout = Duration::from_secs(30);
        Ok(Self {
            id: id.to_string(),
            name: id.to_string(),
            url_text: url.to_string(),
            url,
            client: RwLock::new(Self::build_client(request_timeout)?),
            request_timeout,
            capabilities: EndpointCapabilities {
                supports_prepared_queries: true,
                supports_ask_queries: true,
            },
        })
    }

    pub fn with_name(mut self, name: &str) -> Self {
        self.name = name.to_string();
        self
    }

    /// Endpoint answers existence checks with `SELECT ... LIMIT 1`
    pub fn without_ask_support(mut self) -> Self {
        self.capabilities.supports_ask_queries = false;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> FedResult<Self> {
        self.request_timeout = timeout;
        self.client = RwLock::new(Self::build_client(timeout)?);
        Ok(self)
    }

    fn build_client(timeout: Duration) -> FedResult<Client> {
        Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| FedError::Configuration(format!("Failed to create HTTP client: {}", e)))
    }

    fn client(&self) -> Client {
        self.client.read().unwrap_or_else(|p| p.into_inner()).clone()
    }

    /// POST the query and parse the JSON results
    async fn execute(&self, query: &str) -> FedResult<SparqlResults> {
        debug!(endpoint = %self.id, query = %query, "sending query");
        let response = self
            .client()
            .post(self.url.clone())
            .header(header::ACCEPT, SPARQL_RESULTS_JSON)
            .form(&[("query", query)])
            .send()
            .await
            .map_err(|e| {
                if e.is_connect() || e.is_timeout() {
                    connection_error(&self.id, e.to_string())
                } else {
                    remote_evaluation_error(&self.id, &e.to_string(), "")
                }
            })?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| connection_error(&self.id, format!("Failed to read response: {}", e)))?;

        if !status.is_success() {
            return Err(Self::status_error(&self.id, status, &body, query));
        }
        SparqlResults::parse(&body).map_err(|e| {
            remote_evaluation_error(&self.id, &e.to_string(), &format!("Query: {}", query))
        })
    }

    fn status_error(id: &str, status: StatusCode, body: &str, query: &str) -> FedError {
        let raw = if body.trim().is_empty() {
            format!("HTTP request failed with status: {}", status)
        } else {
            body.to_string()
        };
        remote_evaluation_error(id, &raw, &format!("Query: {}", query))
    }

    async fn select(&self, query: &str, bindings: &BindingSet) -> FedResult<Cursor<BindingSet>> {
        let rows = self.execute(query).await?.into_rows()?;
        let merged: Vec<BindingSet> = rows
            .into_iter()
            .filter_map(|row| bindings.merge(&row))
            .collect();
        Ok(Cursor::from_vec(merged))
    }
}

#[async_trait]
impl Endpoint for SparqlEndpoint {
    fn id(&self) -> &str {
        &self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn url(&self) -> Option<&str> {
        Some(&self.url_text)
    }

    fn classification(&self) -> EndpointClassification {
        EndpointClassification::Remote
    }

    fn capabilities(&self) -> EndpointCapabilities {
        self.capabilities.clone()
    }

    async fn has_statements(&self, pattern: &StatementPattern, bindings: &BindingSet) -> FedResult<bool> {
        if self.capabilities.supports_ask_queries {
            let results = self.execute(&query_string::ask_query(pattern, bindings)).await?;
            Ok(results.boolean.unwrap_or(false))
        } else {
            let rows = self
                .execute(&query_string::select_limit1_query(pattern, bindings))
                .await?
                .into_rows()?;
            Ok(!rows.is_empty())
        }
    }

    async fn get_statements(&self, request: &StatementRequest) -> FedResult<Cursor<BindingSet>> {
        let query = query_string::select_query(
            &request.patterns,
            &request.bindings,
            request.filter.as_ref(),
            request.projection.as_deref(),
        )?;
        self.select(&query, &request.bindings).await
    }

    async fn get_bound_statements(&self, request: &BoundRequest) -> FedResult<Cursor<BindingSet>> {
        let query = query_string::bound_join_query(&request.patterns, &request.bindings, request.filter.as_ref())?;
        let rows = self.execute(&query).await?.into_rows()?;
        Ok(Cursor::from_vec(rows))
    }

    async fn get_triples(
        &self,
        subject: Option<&Term>,
        predicate: Option<&Term>,
        object: Option<&Term>,
    ) -> FedResult<Cursor<Triple>> {
        let pattern = StatementPattern::from_positions(subject, predicate, object);
        if pattern.is_fully_bound() {
            let exists = self.has_statements(&pattern, &BindingSet::new()).await?;
            return Ok(match (exists, subject, predicate, object) {
                (true, Some(s), Some(p), Some(o)) => Cursor::single(Triple::new(s.clone(), p.clone(), o.clone())),
                _ => Cursor::empty(),
            });
        }

        let query = query_string::select_query(&[pattern.clone()], &BindingSet::new(), None, None)?;
        let rows = self.execute(&query).await?.into_rows()?;
        let triples: Vec<Triple> = rows
            .iter()
            .filter_map(|row| {
                Some(Triple::new(
                    pattern.subject.resolve(row)?.clone(),
                    pattern.predicate.resolve(row)?.clone(),
                    pattern.object.resolve(row)?.clone(),
                ))
            })
            .collect();
        Ok(Cursor::from_vec(triples))
    }

    async fn evaluate_query(&self, query: &str, bindings: &BindingSet) -> FedResult<Cursor<BindingSet>> {
        let results = self.execute(query).await?;
        if let Some(answer) = results.boolean {
            return Ok(if answer {
                Cursor::single(bindings.clone())
            } else {
                Cursor::empty()
            });
        }
        let merged: Vec<BindingSet> = results
            .into_rows()?
            .into_iter()
            .filter_map(|row| bindings.merge(&row))
            .collect();
        Ok(Cursor::from_vec(merged))
    }

    async fn repair_connection(&self) -> FedResult<()> {
        let client = Self::build_client(self.request_timeout)?;
        *self.client.write().unwrap_or_else(|p| p.into_inner()) = client;
        info!(endpoint = %self.id, "HTTP client rebuilt");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algebra::pattern::PatternTerm;
    use crate::utils::error::EndpointError;

    #[test]
    fn test_invalid_url_rejected() {
        match SparqlEndpoint::new("bad", "not a url") {
            Err(FedError::Configuration(msg)) => assert!(msg.contains("Invalid endpoint URL")),
            _ => panic!("Expected Configuration error"),
        }
    }

    #[test]
    fn test_endpoint_metadata() {
        let endpoint = SparqlEndpoint::new("dbpedia", "http://dbpedia.org/sparql")
            .unwrap()
            .with_name("DBpedia")
            .without_ask_support();

        assert_eq!(endpoint.id(), "dbpedia");
        assert_eq!(endpoint.name(), "DBpedia");
        assert_eq!(endpoint.url(), Some("http://dbpedia.org/sparql"));
        assert_eq!(endpoint.classification(), EndpointClassification::Remote);
        assert!(!endpoint.capabilities().supports_ask_queries);
        assert!(endpoint.capabilities().supports_prepared_queries);
    }

    #[test]
    fn test_status_error_uses_page_title() {
        let page = "<html><head><title>502 Bad Gateway</title></head></html>";
        let err = SparqlEndpoint::status_error("e1", StatusCode::BAD_GATEWAY, page, "ASK {}");
        match err {
            FedError::Endpoint(EndpointError::RemoteEvaluation { http_status, message, .. }) => {
                assert_eq!(http_status.as_deref(), Some("502 Bad Gateway"));
                assert!(message.starts_with("HTTP Error: 502 Bad Gateway"));
            }
            _ => panic!("Expected RemoteEvaluation error"),
        }
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_is_connection_fault() {
        let endpoint = SparqlEndpoint::new("down", "http://127.0.0.1:9/sparql")
            .unwrap()
            .with_timeout(Duration::from_millis(500))
            .unwrap();
        let pattern = StatementPattern::new(PatternTerm::var("s"), PatternTerm::var("p"), PatternTerm::var("o"));
        let err = endpoint.has_statements(&pattern, &BindingSet::new()).await.unwrap_err();
        assert!(err.is_connection_fault());
        assert!(endpoint.repair_connection().await.is_ok());
    }
}
