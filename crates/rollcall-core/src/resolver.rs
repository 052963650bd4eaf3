//! Per-face identity resolution by majority vote over threshold matches.

use crate::store::EncodingStore;
use crate::types::{DetectedFace, Embedding, Identity};
use std::str::FromStr;
use std::sync::Arc;

/// Default Euclidean tolerance, as used by dlib-style face encoders.
pub const DEFAULT_TOLERANCE: f32 = 0.6;

/// Boolean is-a-match rule applied to each (probe, reference) pair.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MatchRule {
    /// Match when the Euclidean distance is at most `tolerance`.
    Euclidean { tolerance: f32 },
    /// Match when cosine similarity is at least `threshold`.
    Cosine { threshold: f32 },
}

impl Default for MatchRule {
    fn default() -> Self {
        MatchRule::Euclidean {
            tolerance: DEFAULT_TOLERANCE,
        }
    }
}

impl MatchRule {
    /// Build a rule from a metric name (`euclidean` or `cosine`) and its bound.
    pub fn from_metric(metric: &str, bound: f32) -> Result<Self, String> {
        match metric.parse::<Metric>()? {
            Metric::Euclidean => Ok(MatchRule::Euclidean { tolerance: bound }),
            Metric::Cosine => Ok(MatchRule::Cosine { threshold: bound }),
        }
    }

    /// Vectors of different dimension never match.
    pub fn is_match(&self, probe: &Embedding, reference: &Embedding) -> bool {
        if probe.dimension() != reference.dimension() {
            return false;
        }
        match *self {
            MatchRule::Euclidean { tolerance } => probe.euclidean_distance(reference) <= tolerance,
            MatchRule::Cosine { threshold } => probe.similarity(reference) >= threshold,
        }
    }
}

enum Metric {
    Euclidean,
    Cosine,
}

impl FromStr for Metric {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "euclidean" => Ok(Metric::Euclidean),
            "cosine" => Ok(Metric::Cosine),
            other => Err(format!("unknown match metric {other:?} (expected euclidean or cosine)")),
        }
    }
}

/// Strategy for finding every reference that matches a probe.
///
/// Implementations must return indices into the store in ascending order;
/// the resolver's tie-break depends on it.
pub trait MatchIndex: Send + Sync {
    fn matching(&self, store: &EncodingStore, probe: &Embedding) -> Vec<usize>;
}

/// Exhaustive scan over the whole gallery.
#[derive(Debug, Clone, Copy, Default)]
pub struct LinearIndex {
    rule: MatchRule,
}

impl LinearIndex {
    pub fn new(rule: MatchRule) -> Self {
        Self { rule }
    }
}

impl MatchIndex for LinearIndex {
    fn matching(&self, store: &EncodingStore, probe: &Embedding) -> Vec<usize> {
        store
            .references()
            .iter()
            .enumerate()
            .filter(|(_, r)| self.rule.is_match(probe, &r.embedding))
            .map(|(i, _)| i)
            .collect()
    }
}

/// Vote counts for one face's comparison pass, in first-matched order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MatchTally {
    entries: Vec<(String, usize)>,
}

impl MatchTally {
    pub fn add(&mut self, label: &str) {
        match self.entries.iter_mut().find(|(l, _)| l == label) {
            Some((_, count)) => *count += 1,
            None => self.entries.push((label.to_string(), 1)),
        }
    }

    pub fn count(&self, label: &str) -> usize {
        self.entries
            .iter()
            .find(|(l, _)| l == label)
            .map_or(0, |(_, c)| *c)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[(String, usize)] {
        &self.entries
    }

    /// Label with the most votes; the earliest entry wins a tie.
    pub fn winner(&self) -> Option<&str> {
        let mut best: Option<&(String, usize)> = None;
        for entry in &self.entries {
            if best.map_or(true, |b| entry.1 > b.1) {
                best = Some(entry);
            }
        }
        best.map(|(label, _)| label.as_str())
    }
}

/// Resolves detected faces to identity labels against a shared gallery.
#[derive(Clone)]
pub struct CandidateResolver<I = LinearIndex> {
    store: Arc<EncodingStore>,
    index: I,
}

impl CandidateResolver<LinearIndex> {
    pub fn new(store: Arc<EncodingStore>, rule: MatchRule) -> Self {
        Self::with_index(store, LinearIndex::new(rule))
    }
}

impl<I: MatchIndex> CandidateResolver<I> {
    pub fn with_index(store: Arc<EncodingStore>, index: I) -> Self {
        Self { store, index }
    }

    pub fn store(&self) -> &EncodingStore {
        &self.store
    }

    /// Count matches per label for a single probe.
    pub fn tally(&self, probe: &Embedding) -> MatchTally {
        let mut tally = MatchTally::default();
        for i in self.index.matching(&self.store, probe) {
            if let Some(r) = self.store.get(i) {
                tally.add(&r.label);
            }
        }
        tally
    }

    pub fn resolve_embedding(&self, probe: &Embedding) -> Identity {
        match self.tally(probe).winner() {
            Some(label) => Identity::Known(label.to_string()),
            None => Identity::Unknown,
        }
    }

    pub fn resolve(&self, face: &DetectedFace) -> Identity {
        self.resolve_embedding(&face.encoding)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::ReferenceEncoding;
    use crate::types::BoundingBox;

    fn reference(label: &str, values: Vec<f32>) -> ReferenceEncoding {
        ReferenceEncoding {
            label: label.into(),
            embedding: Embedding::new(values),
        }
    }

    fn face(values: Vec<f32>) -> DetectedFace {
        DetectedFace {
            bbox: BoundingBox { top: 0, right: 10, bottom: 10, left: 0 },
            encoding: Embedding::new(values),
        }
    }

    fn resolver(refs: Vec<ReferenceEncoding>) -> CandidateResolver {
        let store = EncodingStore::from_references(refs).unwrap();
        CandidateResolver::new(Arc::new(store), MatchRule::default())
    }

    #[test]
    fn test_resolves_single_match() {
        let r = resolver(vec![
            reference("Alice", vec![0.0, 0.0]),
            reference("Bob", vec![5.0, 5.0]),
        ]);
        assert_eq!(r.resolve(&face(vec![0.1, 0.1])), Identity::Known("Alice".into()));
    }

    #[test]
    fn test_no_match_is_unknown() {
        let r = resolver(vec![
            reference("Alice", vec![0.0, 0.0]),
            reference("Bob", vec![5.0, 5.0]),
        ]);
        assert_eq!(r.resolve(&face(vec![2.5, 2.5])), Identity::Unknown);
        assert!(r.tally(&Embedding::new(vec![2.5, 2.5])).is_empty());
    }

    #[test]
    fn test_majority_vote_wins() {
        // Probe sits within tolerance of one Alice and two Bob references.
        let r = resolver(vec![
            reference("Alice", vec![0.0, 0.0]),
            reference("Bob", vec![0.4, 0.0]),
            reference("Bob", vec![0.0, 0.4]),
        ]);
        let probe = Embedding::new(vec![0.2, 0.2]);
        let tally = r.tally(&probe);
        assert_eq!(tally.count("Alice"), 1);
        assert_eq!(tally.count("Bob"), 2);
        assert_eq!(r.resolve_embedding(&probe), Identity::Known("Bob".into()));
    }

    #[test]
    fn test_tie_goes_to_first_in_store_order() {
        let r = resolver(vec![
            reference("Bob", vec![0.3, 0.0]),
            reference("Alice", vec![0.0, 0.3]),
        ]);
        assert_eq!(r.resolve(&face(vec![0.0, 0.0])), Identity::Known("Bob".into()));

        let r = resolver(vec![
            reference("Alice", vec![0.0, 0.3]),
            reference("Bob", vec![0.3, 0.0]),
        ]);
        assert_eq!(r.resolve(&face(vec![0.0, 0.0])), Identity::Known("Alice".into()));
    }

    #[test]
    fn test_tie_is_reproducible() {
        let r = resolver(vec![
            reference("Carol", vec![0.1, 0.0]),
            reference("Dave", vec![0.0, 0.1]),
            reference("Carol", vec![9.0, 9.0]),
            reference("Dave", vec![0.1, 0.1]),
            reference("Carol", vec![0.0, 0.2]),
        ]);
        for _ in 0..10 {
            assert_eq!(r.resolve(&face(vec![0.0, 0.0])), Identity::Known("Carol".into()));
        }
    }

    #[test]
    fn test_dimension_mismatch_never_matches() {
        let r = resolver(vec![reference("Alice", vec![0.0, 0.0])]);
        assert_eq!(r.resolve(&face(vec![0.0, 0.0, 0.0])), Identity::Unknown);
    }

    #[test]
    fn test_cosine_rule() {
        let rule = MatchRule::from_metric("cosine", 0.9).unwrap();
        let a = Embedding::new(vec![1.0, 0.0]);
        assert!(rule.is_match(&a, &Embedding::new(vec![2.0, 0.1])));
        assert!(!rule.is_match(&a, &Embedding::new(vec![0.0, 1.0])));
    }

    #[test]
    fn test_euclidean_boundary_is_inclusive() {
        let rule = MatchRule::Euclidean { tolerance: 0.5 };
        assert!(rule.is_match(&Embedding::new(vec![0.0]), &Embedding::new(vec![0.5])));
        assert!(!rule.is_match(&Embedding::new(vec![0.0]), &Embedding::new(vec![0.51])));
    }

    #[test]
    fn test_unknown_metric_rejected() {
        assert!(MatchRule::from_metric("manhattan", 1.0).is_err());
    }

    #[test]
    fn test_custom_index_is_used() {
        struct AlwaysLast;
        impl MatchIndex for AlwaysLast {
            fn matching(&self, store: &EncodingStore, _probe: &Embedding) -> Vec<usize> {
                vec![store.len() - 1]
            }
        }

        let store = EncodingStore::from_references(vec![
            reference("Alice", vec![0.0]),
            reference("Bob", vec![9.0]),
        ])
        .unwrap();
        let r = CandidateResolver::with_index(Arc::new(store), AlwaysLast);
        assert_eq!(r.resolve(&face(vec![0.0])), Identity::Known("Bob".into()));
    }

    #[test]
    fn test_tally_winner_empty() {
        assert_eq!(MatchTally::default().winner(), None);
    }
}
