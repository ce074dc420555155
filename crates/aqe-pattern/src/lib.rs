//! # AQE Pattern Crate
//!
//! Everything about learned patterns in the AQE mesh: the shared pattern
//! model, the binary wire codec, content anonymization, differential
//! privacy on embeddings, typed f32 vector operations, the bounded
//! in-memory pattern index, and the pattern CRDT used for replication.

pub mod anonymizer;
pub mod crdt;
pub mod index;
pub mod model;
pub mod privacy;
pub mod serializer;
pub mod vector;

pub use anonymizer::{AnonymizationReport, Anonymizer, AnonymizerConfig};
pub use crdt::PatternCrdt;
pub use index::{IndexConfig, IndexStats, PatternIndex, PatternQuery, SearchResult};
pub use model::{
    content_hash, PatternCategory, PatternContent, PatternMetadata, PatternSummary,
    PatternVersion, PrivacyLevel, QualityLevel, QualityMetrics, SharedPattern, SharingDpParams,
    SharingPolicy, Visibility,
};
pub use privacy::{apply_differential_privacy, DpMechanism, DpNoiseResult, DpParams};
pub use serializer::{PatternCodec, MAX_PATTERN_SIZE, PATTERN_FORMAT_VERSION, PATTERN_MAGIC};

/// Errors surfaced by pattern handling.
#[derive(Debug, thiserror::Error)]
pub enum PatternError {
    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Pattern not found: {0}")]
    PatternNotFound(String),

    #[error("Duplicate pattern content: {0}")]
    DuplicatePattern(String),

    #[error("Pattern too large: {size} bytes (max {max})")]
    PatternTooLarge { size: usize, max: usize },

    #[error("Index is full")]
    IndexFull,

    #[error("Sharing policy violation: {0}")]
    PolicyViolation(String),

    #[error("Invalid embedding: {0}")]
    InvalidEmbedding(String),

    #[error("Invalid privacy parameters: {0}")]
    InvalidPrivacyParams(String),

    #[error(transparent)]
    Crdt(#[from] aqe_crdt::CrdtError),
}

/// Result type for pattern operations.
pub type PatternResult<T> = Result<T, PatternError>;
