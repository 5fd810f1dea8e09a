use fedx_engine::{
    BindingSet, Endpoint, FedError, FedResult, Federation, FederationConfig, MemoryEndpoint, ParsedQuery,
    PatternTerm, QueryType, StatementPattern, Term, TupleExpr,
};
use futures_util::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio_test::{assert_err, assert_ok};

const P: &str = "http://ex.org/p";
const Q: &str = "http://ex.org/q";

fn iri(local: &str) -> Term {
    Term::iri(format!("http://ex.org/{}", local))
}

fn sp(s: &str, p: &str, o: &str) -> TupleExpr {
    TupleExpr::pattern(StatementPattern::new(PatternTerm::var(s), PatternTerm::iri(p), PatternTerm::var(o)))
}

/// Rows as sorted strings, for order-independent comparison
fn multiset(rows: &[BindingSet]) -> Vec<String> {
    let mut rows: Vec<String> = rows.iter().map(|r| r.to_string()).collect();
    rows.sort();
    rows
}

async fn federation(endpoints: Vec<Arc<MemoryEndpoint>>, config: FederationConfig) -> FedResult<Federation> {
    let mut builder = Federation::builder().with_config(config);
    for endpoint in endpoints {
        builder = builder.with_endpoint(endpoint as Arc<dyn Endpoint>);
    }
    let federation = builder.build()?;
    federation.initialize().await?;
    Ok(federation)
}

fn two_endpoints() -> (Arc<MemoryEndpoint>, Arc<MemoryEndpoint>) {
    let e1 = Arc::new(MemoryEndpoint::new("e1").with_triple(iri("a"), Term::iri(P), iri("b")));
    let e2 = Arc::new(MemoryEndpoint::new("e2").with_triple(iri("c"), Term::iri(P), iri("d")));
    (e1, e2)
}

/// A pattern answered by two endpoints yields the rows of both
#[tokio::test]
async fn test_multi_source_pattern_collects_all_sources() -> FedResult<()> {
    let (e1, e2) = two_endpoints();
    let federation = federation(vec![e1, e2], FederationConfig::default()).await?;

    let query = ParsedQuery::select("SELECT * WHERE { ?s :p ?o }", sp("s", P, "o"));
    let rows = federation.evaluate(&query).await?.collect_all().await?;

    let expected = vec![
        BindingSet::new().with("s", iri("a")).with("o", iri("b")),
        BindingSet::new().with("s", iri("c")).with("o", iri("d")),
    ];
    assert_eq!(multiset(&rows), multiset(&expected));

    federation.shutdown().await?;
    Ok(())
}

/// UNION equals the multiset union of its evaluated branches
#[tokio::test]
async fn test_union_completeness() -> FedResult<()> {
    let e1 = Arc::new(
        MemoryEndpoint::new("e1")
            .with_triple(iri("a"), Term::iri(P), iri("b"))
            .with_triple(iri("a"), Term::iri(Q), iri("b")),
    );
    let e2 = Arc::new(
        MemoryEndpoint::new("e2")
            .with_triple(iri("c"), Term::iri(P), iri("d"))
            .with_triple(iri("e"), Term::iri(Q), iri("f")),
    );
    let federation = federation(vec![e1, e2], FederationConfig::default()).await?;

    let union = ParsedQuery::select("union", TupleExpr::union(sp("s", P, "o"), sp("s", Q, "o")));
    let rows = federation.evaluate(&union).await?.collect_all().await?;

    let mut expected = Vec::new();
    for branch in [sp("s", P, "o"), sp("s", Q, "o")] {
        let query = ParsedQuery::select("branch", branch);
        expected.extend(federation.evaluate(&query).await?.collect_all().await?);
    }
    assert_eq!(rows.len(), 4);
    assert_eq!(multiset(&rows), multiset(&expected));
    Ok(())
}

/// Joins across endpoints combine matching rows only
#[tokio::test]
async fn test_join_across_endpoints() -> FedResult<()> {
    let e1 = Arc::new(
        MemoryEndpoint::new("e1")
            .with_triple(iri("a"), Term::iri(P), iri("b"))
            .with_triple(iri("c"), Term::iri(P), iri("d")),
    );
    let e2 = Arc::new(MemoryEndpoint::new("e2").with_triple(iri("b"), Term::iri(Q), iri("x")));
    let federation = federation(vec![e1, e2], FederationConfig::default()).await?;

    let query = ParsedQuery::select("join", TupleExpr::join(sp("s", P, "o"), sp("o", Q, "x")));
    let rows = federation.evaluate(&query).await?.collect_all().await?;

    let expected = vec![BindingSet::new().with("s", iri("a")).with("o", iri("b")).with("x", iri("x"))];
    assert_eq!(multiset(&rows), multiset(&expected));
    Ok(())
}

/// OPTIONAL keeps left rows without a match
#[tokio::test]
async fn test_optional_keeps_unmatched_rows() -> FedResult<()> {
    let e1 = Arc::new(
        MemoryEndpoint::new("e1")
            .with_triple(iri("a"), Term::iri(P), iri("b"))
            .with_triple(iri("c"), Term::iri(P), iri("d")),
    );
    let e2 = Arc::new(MemoryEndpoint::new("e2").with_triple(iri("b"), Term::iri(Q), iri("x")));
    let federation = federation(vec![e1, e2], FederationConfig::default()).await?;

    let query = ParsedQuery::select("optional", TupleExpr::left_join(sp("s", P, "o"), sp("o", Q, "x"), None));
    let rows = federation.evaluate(&query).await?.collect_all().await?;

    let expected = vec![
        BindingSet::new().with("s", iri("a")).with("o", iri("b")).with("x", iri("x")),
        BindingSet::new().with("s", iri("c")).with("o", iri("d")),
    ];
    assert_eq!(multiset(&rows), multiset(&expected));
    Ok(())
}

/// ASK yields at most one empty row
#[tokio::test]
async fn test_ask_query() -> FedResult<()> {
    let (e1, e2) = two_endpoints();
    let federation = federation(vec![e1, e2], FederationConfig::default()).await?;

    let found = ParsedQuery::new("ask", QueryType::Ask, sp("s", P, "o"));
    let rows = federation.evaluate(&found).await?.collect_all().await?;
    assert_eq!(rows, vec![BindingSet::new()]);

    let missing = ParsedQuery::new("ask", QueryType::Ask, sp("s", Q, "o"));
    assert!(federation.evaluate(&missing).await?.collect_all().await?.is_empty());
    Ok(())
}

/// A 1ms deadline against a slow endpoint surfaces a timeout
#[tokio::test]
async fn test_query_deadline_surfaces_timeout() -> FedResult<()> {
    let slow = Arc::new(
        MemoryEndpoint::new("slow")
            .with_delay(Duration::from_millis(100))
            .with_triple(iri("a"), Term::iri(P), iri("b")),
    );
    let config = FederationConfig::default().with_query_timeout(Duration::from_millis(1));
    let federation = federation(vec![slow], config).await?;

    let query = ParsedQuery::select("slow", sp("s", P, "o"));
    let outcome = tokio::time::timeout(Duration::from_secs(5), async {
        match federation.evaluate(&query).await {
            Ok(cursor) => cursor.collect_all().await,
            Err(e) => Err(e),
        }
    })
    .await
    .expect("query must not hang");

    match outcome {
        Err(FedError::Timeout(_)) => {}
        Err(other) => panic!("Expected timeout, got {}", other),
        Ok(rows) => panic!("Expected timeout, got {} rows", rows.len()),
    }
    Ok(())
}

/// Closing a cursor cancels every outstanding task of the query
#[tokio::test]
async fn test_close_cancels_outstanding_tasks() -> FedResult<()> {
    let mut left = MemoryEndpoint::new("left");
    for i in 0..20 {
        left = left.with_triple(iri(&format!("s{}", i)), Term::iri(P), iri(&format!("o{}", i)));
    }
    let mut right = MemoryEndpoint::new("right").with_delay(Duration::from_millis(300));
    for i in 0..20 {
        right = right.with_triple(iri(&format!("o{}", i)), Term::iri(Q), iri("x"));
    }
    let federation = federation(vec![Arc::new(left), Arc::new(right)], FederationConfig::default()).await?;

    let query = ParsedQuery::select("join", TupleExpr::join(sp("s", P, "o"), sp("o", Q, "x")));
    let mut cursor = federation.evaluate(&query).await?;
    let query_info = cursor.query_info().clone();

    let first = tokio::time::timeout(Duration::from_millis(50), cursor.next()).await;
    assert!(first.is_err(), "right side is still pending");

    cursor.close();
    assert!(cursor.next().await.is_none());

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(query_info.is_aborted() || query_info.token().is_cancelled());
    assert_eq!(query_info.scheduled_task_count(), 0);
    Ok(())
}

/// Exclusive patterns are probed once and then served from the cache
#[tokio::test]
async fn test_warm_cache_issues_no_probes() -> FedResult<()> {
    let e1 = Arc::new(MemoryEndpoint::new("e1").with_triple(iri("a"), Term::iri(P), iri("b")));
    let e2 = Arc::new(MemoryEndpoint::new("e2").with_triple(iri("b"), Term::iri(Q), iri("c")));
    let federation = federation(vec![e1.clone(), e2.clone()], FederationConfig::default()).await?;
    let query = ParsedQuery::select("join", TupleExpr::join(sp("s", P, "o"), sp("o", Q, "x")));

    federation.evaluate(&query).await?.collect_all().await?;
    // two patterns, two endpoints
    assert!(e1.probe_count() + e2.probe_count() <= 4);

    e1.reset_counters();
    e2.reset_counters();
    let rows = federation.evaluate(&query).await?.collect_all().await?;
    assert_eq!(rows.len(), 1);
    assert_eq!(e1.probe_count() + e2.probe_count(), 0);

    federation.clear_cache();
    federation.evaluate(&query).await?.collect_all().await?;
    assert_eq!(e1.probe_count() + e2.probe_count(), 4);
    Ok(())
}

/// A pattern repeating a variable caches its own sources and does not hide
/// the endpoints of the general pattern
#[tokio::test]
async fn test_repeated_variable_pattern_keeps_general_sources() -> FedResult<()> {
    let (e1, e2) = two_endpoints();
    let federation = federation(vec![e1, e2], FederationConfig::default()).await?;

    let reflexive = ParsedQuery::select("reflexive", sp("x", P, "x"));
    assert!(federation.evaluate(&reflexive).await?.collect_all().await?.is_empty());

    let general = ParsedQuery::select("general", sp("s", P, "o"));
    let warm = federation.evaluate(&general).await?.collect_all().await?;
    assert_eq!(warm.len(), 2);

    federation.clear_cache();
    let cold = federation.evaluate(&general).await?.collect_all().await?;
    assert_eq!(multiset(&warm), multiset(&cold));
    Ok(())
}

/// Adding an endpoint makes its data visible to later queries
#[tokio::test]
async fn test_membership_changes_invalidate_cache() -> FedResult<()> {
    let (e1, e2) = two_endpoints();
    let federation = federation(vec![e1], FederationConfig::default()).await?;
    let query = ParsedQuery::select("q", sp("s", P, "o"));

    assert_eq!(federation.evaluate(&query).await?.collect_all().await?.len(), 1);

    federation.add_endpoint(e2).await?;
    assert_eq!(federation.evaluate(&query).await?.collect_all().await?.len(), 2);

    federation.remove_endpoint("e2").await?;
    assert_eq!(federation.evaluate(&query).await?.collect_all().await?.len(), 1);

    match federation.remove_endpoint("e2").await {
        Err(e) => assert_eq!(e.endpoint_id(), Some("e2")),
        Ok(_) => panic!("Expected unknown endpoint error"),
    }
    Ok(())
}

/// Triple lookups across the federation
#[tokio::test]
async fn test_get_statements() -> FedResult<()> {
    let (e1, e2) = two_endpoints();
    let federation = federation(vec![e1, e2], FederationConfig::default()).await?;

    let all = assert_ok!(federation.get_statements(None, Some(Term::iri(P)), None).await?.collect_all().await);
    assert_eq!(all.len(), 2);

    let single = federation
        .get_statements(Some(iri("a")), Some(Term::iri(P)), Some(iri("b")))
        .await?
        .collect_all()
        .await?;
    assert_eq!(single.len(), 1);
    assert_eq!(single[0].subject, iri("a"));

    let none = federation.get_statements(None, Some(Term::iri(Q)), None).await?.collect_all().await?;
    assert!(none.is_empty());
    Ok(())
}

/// Connection faults trigger a repair and still fail the query
#[tokio::test]
async fn test_connection_fault_triggers_repair() -> FedResult<()> {
    let e1 = Arc::new(MemoryEndpoint::new("e1").with_triple(iri("a"), Term::iri(P), iri("b")));
    let federation = federation(vec![e1.clone()], FederationConfig::default()).await?;
    e1.set_fail_requests(true);
    e1.set_connection_faults(true);

    let query = ParsedQuery::select("q", sp("s", P, "o"));
    let error = assert_err!(federation.evaluate(&query).await?.collect_all().await);

    assert!(error.is_connection_fault());
    assert_eq!(e1.repair_count(), 1);
    Ok(())
}

/// Unsupported query forms and uninitialized federations are rejected
#[tokio::test]
async fn test_rejected_evaluations() -> FedResult<()> {
    let (e1, _) = two_endpoints();
    let federation = Federation::builder().with_endpoint(e1).build()?;
    let query = ParsedQuery::select("q", sp("s", P, "o"));

    match federation.evaluate(&query).await {
        Err(FedError::Configuration(_)) => {}
        _ => panic!("Expected configuration error before initialize"),
    }

    federation.initialize().await?;
    let construct = ParsedQuery::new("construct", QueryType::Construct, sp("s", P, "o"));
    match federation.evaluate(&construct).await {
        Err(FedError::MalformedQuery(_)) => {}
        _ => panic!("Expected malformed query error"),
    }

    assert_ok!(federation.shutdown().await);
    assert!(!federation.is_initialized());
    Ok(())
}

/// Invalid configurations fail at build time
#[test]
fn test_invalid_config_is_rejected() {
    let config = FederationConfig::default().with_block_size(0);
    match Federation::builder().with_config(config).build() {
        Err(FedError::Configuration(msg)) => assert!(msg.contains("bound_join_block_size")),
        _ => panic!("Expected configuration error"),
    }
}
