use crate::algebra::pattern::{PatternTerm, StatementPattern};
use crate::utils::types::Term;
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::debug;

/// Cache key: the predicate plus whichever of subject and object are bound,
/// and which positions repeat the same variable
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PatternKey {
    pub subject: Option<Term>,
    pub predicate: Option<Term>,
    pub object: Option<Term>,
    /// Bit set of [`SAME_SUBJECT_PREDICATE`], [`SAME_SUBJECT_OBJECT`] and [`SAME_PREDICATE_OBJECT`]
    pub repeated: u8,
}

pub const SAME_SUBJECT_PREDICATE: u8 = 0b001;
pub const SAME_SUBJECT_OBJECT: u8 = 0b010;
pub const SAME_PREDICATE_OBJECT: u8 = 0b100;

impl PatternKey {
    /// Key of a pattern: constants by position plus its repeated variables
    pub fn from_pattern(pattern: &StatementPattern) -> Self {
        Self {
            subject: pattern.subject.value().cloned(),
            predicate: pattern.predicate.value().cloned(),
            object: pattern.object.value().cloned(),
            repeated: repeated_vars(pattern),
        }
    }

    /// Key without bound subject, object or repeated variables that covers
    /// this one; `None` when this key is already that general
    pub fn generalized(&self) -> Option<PatternKey> {
        if self.subject.is_none() && self.object.is_none() && self.repeated == 0 {
            return None;
        }
        Some(PatternKey {
            subject: None,
            predicate: self.predicate.clone(),
            object: None,
            repeated: 0,
        })
    }
}

fn repeated_vars(pattern: &StatementPattern) -> u8 {
    let same = |a: &PatternTerm, b: &PatternTerm| match (a.var_name(), b.var_name()) {
        (Some(x), Some(y)) => x == y,
        _ => false,
    };
    let mut repeated = 0;
    if same(&pattern.subject, &pattern.predicate) {
        repeated |= SAME_SUBJECT_PREDICATE;
    }
    if same(&pattern.subject, &pattern.object) {
        repeated |= SAME_SUBJECT_OBJECT;
    }
    if same(&pattern.predicate, &pattern.object) {
        repeated |= SAME_PREDICATE_OBJECT;
    }
    repeated
}

/// Cached knowledge about one (pattern, endpoint) pair
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Membership {
    Confirmed,
    Absent,
    /// Not cached, or expired; a probe is needed
    Unknown,
}

#[derive(Debug, Clone, Copy)]
struct Observation {
    has_data: bool,
    recorded_at: Instant,
}

#[derive(Debug, Default)]
struct CacheEntry {
    endpoints: HashMap<String, Observation>,
}

/// Point-in-time cache statistics
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheStats {
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
}

/// Per-pattern membership cache shared by all queries of a federation
#[derive(Debug)]
pub struct SourceSelectionCache {
    entries: DashMap<PatternKey, CacheEntry>,
    ttl: Option<Duration>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl SourceSelectionCache {
    /// Empty cache; entries older than `ttl` count as unknown
    pub fn new(ttl: Option<Duration>) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    fn is_fresh(&self, observation: &Observation) -> bool {
        match self.ttl {
            Some(ttl) => observation.recorded_at.elapsed() < ttl,
            None => true,
        }
    }

    fn cached(&self, key: &PatternKey, endpoint_id: &str) -> Membership {
        let entry = match self.entries.get(key) {
            Some(entry) => entry,
            None => return Membership::Unknown,
        };
        match entry.endpoints.get(endpoint_id) {
            Some(obs) if self.is_fresh(obs) => {
                if obs.has_data {
                    Membership::Confirmed
                } else {
                    Membership::Absent
                }
            }
            _ => Membership::Unknown,
        }
    }

    /// Whether `endpoint_id` can contribute to patterns with this key.
    ///
    /// An endpoint without any triple for the predicate cannot match a more
    /// specific pattern either, so the generalized key is consulted on a miss.
    pub fn lookup(&self, key: &PatternKey, endpoint_id: &str) -> Membership {
        let mut membership = self.cached(key, endpoint_id);
        if membership == Membership::Unknown {
            if let Some(general) = key.generalized() {
                if self.cached(&general, endpoint_id) == Membership::Absent {
                    membership = Membership::Absent;
                }
            }
        }

        if membership == Membership::Unknown {
            self.misses.fetch_add(1, Ordering::Relaxed);
        } else {
            self.hits.fetch_add(1, Ordering::Relaxed);
        }
        membership
    }

    /// Merge one probe outcome
    pub fn update(&self, key: &PatternKey, endpoint_id: &str, has_data: bool) {
        let observation = Observation {
            has_data,
            recorded_at: Instant::now(),
        };
        self.entries
            .entry(key.clone())
            .or_default()
            .endpoints
            .insert(endpoint_id.to_string(), observation);

        // A match for the specific pattern is a match for the predicate
        if has_data {
            if let Some(general) = key.generalized() {
                self.entries
                    .entry(general)
                    .or_default()
                    .endpoints
                    .insert(endpoint_id.to_string(), observation);
            }
        }
    }

    /// Drop everything known about an endpoint, e.g. after it joined or
    /// left the federation
    pub fn invalidate_endpoint(&self, endpoint_id: &str) {
        for mut entry in self.entries.iter_mut() {
            entry.endpoints.remove(endpoint_id);
        }
        self.entries.retain(|_, entry| !entry.endpoints.is_empty());
        debug!(endpoint = %endpoint_id, "source selection cache invalidated");
    }

    /// Forget every entry, keeping the hit and miss counters
    pub fn clear(&self) {
        self.entries.clear();
        debug!("source selection cache cleared");
    }

    /// Number of cached pattern keys
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entry count and lookup hits and misses since creation
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            entries: self.entries.len(),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }
}

impl Default for SourceSelectionCache {
    fn default() -> Self {
        Self::new(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(subject: Option<&str>) -> PatternKey {
        let s = match subject {
            Some(iri) => PatternTerm::iri(iri),
            None => PatternTerm::var("s"),
        };
        PatternKey::from_pattern(&StatementPattern::new(
            s,
            PatternTerm::iri("http://ex.org/p"),
            PatternTerm::var("o"),
        ))
    }

    #[test]
    fn test_lookup_and_update() {
        let cache = SourceSelectionCache::default();
        let k = key(None);
        assert_eq!(cache.lookup(&k, "e1"), Membership::Unknown);

        cache.update(&k, "e1", true);
        cache.update(&k, "e2", false);
        assert_eq!(cache.lookup(&k, "e1"), Membership::Confirmed);
        assert_eq!(cache.lookup(&k, "e2"), Membership::Absent);

        let stats = cache.stats();
        assert_eq!(stats.hits, 2);
        assert_eq!(stats.misses, 1);
    }

    #[test]
    fn test_generalized_absence_applies_to_specific_key() {
        let cache = SourceSelectionCache::default();
        cache.update(&key(None), "e1", false);

        assert_eq!(cache.lookup(&key(Some("http://ex.org/a")), "e1"), Membership::Absent);
    }

    #[test]
    fn test_specific_match_confirms_predicate() {
        let cache = SourceSelectionCache::default();
        cache.update(&key(Some("http://ex.org/a")), "e1", true);

        assert_eq!(cache.lookup(&key(None), "e1"), Membership::Confirmed);
        assert_eq!(cache.lookup(&key(Some("http://ex.org/b")), "e1"), Membership::Unknown);
    }

    #[test]
    fn test_repeated_variables_get_their_own_key() {
        let cache = SourceSelectionCache::default();
        let p = PatternTerm::iri("http://ex.org/p");
        let reflexive =
            PatternKey::from_pattern(&StatementPattern::new(PatternTerm::var("x"), p.clone(), PatternTerm::var("x")));
        assert_eq!(reflexive.repeated, SAME_SUBJECT_OBJECT);
        assert_ne!(reflexive, key(None));

        cache.update(&reflexive, "e1", false);
        assert_eq!(cache.lookup(&key(None), "e1"), Membership::Unknown);

        // nothing for the predicate means nothing for the reflexive pattern either
        cache.update(&key(None), "e2", false);
        assert_eq!(cache.lookup(&reflexive, "e2"), Membership::Absent);

        cache.update(&reflexive, "e3", true);
        assert_eq!(cache.lookup(&key(None), "e3"), Membership::Confirmed);
    }

    #[test]
    fn test_invalidate_endpoint() {
        let cache = SourceSelectionCache::default();
        cache.update(&key(None), "e1", true);
        cache.update(&key(None), "e2", true);

        cache.invalidate_endpoint("e1");
        assert_eq!(cache.lookup(&key(None), "e1"), Membership::Unknown);
        assert_eq!(cache.lookup(&key(None), "e2"), Membership::Confirmed);

        cache.invalidate_endpoint("e2");
        assert!(cache.is_empty());
    }

    #[test]
    fn test_expired_entries_are_unknown() {
        let cache = SourceSelectionCache::new(Some(Duration::from_millis(0)));
        cache.update(&key(None), "e1", true);
        assert_eq!(cache.lookup(&key(None), "e1"), Membership::Unknown);
    }
}
