//! The shared pattern data model.
//!
//! A pattern is a unit of learned quality-engineering knowledge: a content
//! block with an embedding, quality metrics, a semantic version bound to a
//! vector clock, and a sharing policy controlling who may receive it and
//! under which privacy transformations.

use aqe_common::ReplicaId;
use aqe_crdt::VectorClock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Deterministic hex digest of pattern content, used for deduplication.
pub fn content_hash(raw: &str) -> String {
    use sha2::{Digest, Sha256};
    let mut hasher = Sha256::new();
    hasher.update(raw.as_bytes());
    hex::encode(hasher.finalize())
}

/// What kind of knowledge a pattern captures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PatternCategory {
    Test,
    Code,
    Refactor,
    DefectFix,
    Performance,
    Security,
}

/// How much confidence the mesh has in a pattern.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum QualityLevel {
    Experimental,
    Validated,
    Trusted,
    Golden,
}

/// Who may see a pattern.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Visibility {
    Private,
    Federation,
    Public,
}

/// Which privacy transformation applies before sharing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PrivacyLevel {
    None,
    Anonymized,
    Differential,
}

/// The content block of a pattern.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatternContent {
    /// Raw source text as learned.
    pub raw: String,
    /// Whitespace/format-normalized variant, when computed.
    pub normalized: Option<String>,
    /// Anonymized variant, when computed.
    pub anonymized: Option<String>,
    /// Deterministic digest of `raw`.
    pub content_hash: String,
    pub language: String,
    pub framework: Option<String>,
    /// Placeholder name to description, for templated patterns.
    pub placeholders: HashMap<String, String>,
}

impl PatternContent {
    /// Build a content block from raw text, computing the hash.
    pub fn from_raw(raw: impl Into<String>, language: impl Into<String>) -> Self {
        let raw = raw.into();
        let hash = content_hash(&raw);
        Self {
            raw,
            normalized: None,
            anonymized: None,
            content_hash: hash,
            language: language.into(),
            framework: None,
            placeholders: HashMap::new(),
        }
    }
}

/// Descriptive metadata attached to a pattern.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PatternMetadata {
    pub tags: Vec<String>,
    /// Where the pattern was learned from, if tracked.
    pub source: Option<String>,
    /// Ids of patterns this one depends on.
    pub dependencies: Vec<String>,
}

/// Version of a pattern: a semantic version anchored to the vector clock of
/// the edit that produced it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatternVersion {
    /// Semantic version string, e.g. "1.2.0".
    pub version: String,
    pub vector_clock: VectorClock,
    /// Id of the previous version, when this is an edit.
    pub previous_version: Option<String>,
}

impl PatternVersion {
    /// Initial version with an empty clock.
    pub fn initial() -> Self {
        Self {
            version: "1.0.0".to_string(),
            vector_clock: VectorClock::new(),
            previous_version: None,
        }
    }

    /// Parse the semantic version, tolerating malformed strings as 0.0.0.
    pub fn semver(&self) -> semver::Version {
        semver::Version::parse(&self.version).unwrap_or_else(|_| semver::Version::new(0, 0, 0))
    }
}

/// Observed quality of a pattern.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QualityMetrics {
    pub level: QualityLevel,
    /// Fraction of applications that succeeded, in [0, 1].
    pub success_rate: f64,
    pub usage_count: u64,
    /// Mean confidence reported by consumers, in [0, 1].
    pub avg_confidence: f64,
    /// Aggregated feedback, in [0, 1].
    pub feedback_score: f64,
}

impl Default for QualityMetrics {
    fn default() -> Self {
        Self {
            level: QualityLevel::Experimental,
            success_rate: 0.0,
            usage_count: 0,
            avg_confidence: 0.0,
            feedback_score: 0.5,
        }
    }
}

impl QualityMetrics {
    /// Composite score used for concurrent-edit resolution and search
    /// filters.
    pub fn score(&self) -> f64 {
        self.success_rate * 0.5 + self.avg_confidence * 0.3 + self.feedback_score * 0.2
    }
}

/// Differential-privacy parameters carried by a sharing policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SharingDpParams {
    pub epsilon: f64,
    pub delta: f64,
    pub sensitivity: f64,
    pub clip_norm: f64,
}

/// Who may receive a pattern and under which transformations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SharingPolicy {
    pub visibility: Visibility,
    pub privacy: PrivacyLevel,
    /// When non-empty, only these peers may receive the pattern.
    pub allowed_peers: Vec<ReplicaId>,
    pub blocked_peers: Vec<ReplicaId>,
    /// Whether differential privacy must be applied to the embedding.
    pub differential_privacy: bool,
    pub dp_params: Option<SharingDpParams>,
    /// Whether receivers may forward the pattern onward.
    pub redistributable: bool,
}

impl Default for SharingPolicy {
    fn default() -> Self {
        Self {
            visibility: Visibility::Federation,
            privacy: PrivacyLevel::None,
            allowed_peers: Vec::new(),
            blocked_peers: Vec::new(),
            differential_privacy: false,
            dp_params: None,
            redistributable: true,
        }
    }
}

impl SharingPolicy {
    /// Whether this policy permits sharing with the given peer.
    pub fn permits(&self, peer: &ReplicaId) -> bool {
        if self.visibility == Visibility::Private {
            return false;
        }
        if self.blocked_peers.contains(peer) {
            return false;
        }
        if !self.allowed_peers.is_empty() && !self.allowed_peers.contains(peer) {
            return false;
        }
        true
    }
}

/// A unit of shared quality-engineering knowledge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SharedPattern {
    pub id: String,
    pub category: PatternCategory,
    /// Free-form pattern type, e.g. "unit-test", "retry-wrapper".
    pub pattern_type: String,
    /// Application domain, e.g. "web", "embedded".
    pub domain: String,
    pub name: String,
    pub description: String,
    pub content: PatternContent,
    /// Fixed-dimension embedding; carried outside the JSON payload on the
    /// wire, hence the default.
    #[serde(default)]
    pub embedding: Vec<f32>,
    pub metadata: PatternMetadata,
    pub version: PatternVersion,
    pub quality: QualityMetrics,
    pub sharing: SharingPolicy,
    pub created_at_ms: u64,
    pub updated_at_ms: u64,
    pub expires_at_ms: Option<u64>,
}

impl SharedPattern {
    /// Build a pattern with sensible defaults around a content block.
    pub fn new(
        id: impl Into<String>,
        category: PatternCategory,
        content: PatternContent,
        embedding: Vec<f32>,
        now_ms: u64,
    ) -> Self {
        Self {
            id: id.into(),
            category,
            pattern_type: String::new(),
            domain: String::new(),
            name: String::new(),
            description: String::new(),
            content,
            embedding,
            metadata: PatternMetadata::default(),
            version: PatternVersion::initial(),
            quality: QualityMetrics::default(),
            sharing: SharingPolicy::default(),
            created_at_ms: now_ms,
            updated_at_ms: now_ms,
            expires_at_ms: None,
        }
    }

    /// Whether the pattern has expired at the given time.
    pub fn is_expired(&self, now_ms: u64) -> bool {
        self.expires_at_ms.map(|t| t <= now_ms).unwrap_or(false)
    }

    /// Summary form for announcements: no raw content, embedding only when
    /// the policy permits.
    pub fn summary(&self) -> PatternSummary {
        let embedding = if self.sharing.privacy == PrivacyLevel::None {
            Some(self.embedding.clone())
        } else {
            None
        };
        PatternSummary {
            id: self.id.clone(),
            content_hash: self.content.content_hash.clone(),
            category: self.category,
            domain: self.domain.clone(),
            quality: self.quality.level,
            tags: self.metadata.tags.clone(),
            embedding,
        }
    }
}

/// Reduced pattern form shipped in announcements and search responses.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatternSummary {
    pub id: String,
    pub content_hash: String,
    pub category: PatternCategory,
    pub domain: String,
    pub quality: QualityLevel,
    pub tags: Vec<String>,
    pub embedding: Option<Vec<f32>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pattern() -> SharedPattern {
        SharedPattern::new(
            "p1",
            PatternCategory::Test,
            PatternContent::from_raw("expect(sum(1, 2)).toBe(3);", "typescript"),
            vec![0.1, 0.2, 0.3, 0.4],
            1_000,
        )
    }

    #[test]
    fn test_content_hash_is_deterministic() {
        let a = content_hash("same content");
        let b = content_hash("same content");
        let c = content_hash("other content");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn test_pattern_expiry() {
        let mut p = pattern();
        assert!(!p.is_expired(u64::MAX));

        p.expires_at_ms = Some(5_000);
        assert!(!p.is_expired(4_999));
        assert!(p.is_expired(5_000));
    }

    #[test]
    fn test_sharing_policy_permits() {
        let peer = ReplicaId::new("peer-1");
        let other = ReplicaId::new("peer-2");

        let mut policy = SharingPolicy::default();
        assert!(policy.permits(&peer));

        policy.blocked_peers.push(peer.clone());
        assert!(!policy.permits(&peer));
        assert!(policy.permits(&other));

        policy.blocked_peers.clear();
        policy.allowed_peers.push(other.clone());
        assert!(!policy.permits(&peer));
        assert!(policy.permits(&other));

        policy.visibility = Visibility::Private;
        assert!(!policy.permits(&other));
    }

    #[test]
    fn test_summary_withholds_embedding_under_privacy() {
        let mut p = pattern();
        let summary = p.summary();
        assert_eq!(summary.embedding, Some(vec![0.1, 0.2, 0.3, 0.4]));
        assert_eq!(summary.content_hash, p.content.content_hash);

        p.sharing.privacy = PrivacyLevel::Anonymized;
        assert!(p.summary().embedding.is_none());
    }

    #[test]
    fn test_quality_score_weighting() {
        let metrics = QualityMetrics {
            level: QualityLevel::Validated,
            success_rate: 1.0,
            usage_count: 10,
            avg_confidence: 1.0,
            feedback_score: 1.0,
        };
        assert!((metrics.score() - 1.0).abs() < f64::EPSILON);

        let zero = QualityMetrics {
            feedback_score: 0.0,
            ..QualityMetrics::default()
        };
        assert_eq!(zero.score(), 0.0);
    }

    #[test]
    fn test_version_semver_parsing() {
        let mut version = PatternVersion::initial();
        assert_eq!(version.semver(), semver::Version::new(1, 0, 0));

        version.version = "not-a-version".to_string();
        assert_eq!(version.semver(), semver::Version::new(0, 0, 0));
    }
}
