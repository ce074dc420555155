//! Bounded in-memory pattern index with vector and attribute search.
//!
//! The index dedupes by content hash, evicts least-recently-used entries
//! when it grows past its threshold, lazily drops expired patterns, and
//! ranks query results by cosine similarity over normalized embeddings.

use crate::model::{PatternCategory, SharedPattern};
use crate::vector::{cosine_similarity, normalize};
use crate::{PatternError, PatternResult};
use aqe_common::TimeProvider;
use log::debug;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

/// Index sizing and behavior.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexConfig {
    /// Steady-state capacity.
    pub max_patterns: usize,
    /// Eviction starts above `eviction_threshold · max_patterns`.
    pub eviction_threshold: f64,
    /// Reject patterns whose content hash is already present.
    pub dedup_enabled: bool,
    /// Above this many entries, similarity ranking only considers entries
    /// passing the category/domain coarse filter.
    pub coarse_filter_threshold: usize,
    /// Expected embedding dimension; 0 disables the check.
    pub embedding_dim: usize,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            max_patterns: 10_000,
            eviction_threshold: 1.1,
            dedup_enabled: true,
            coarse_filter_threshold: 2_000,
            embedding_dim: 0,
        }
    }
}

/// A search request against the index.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PatternQuery {
    /// Rank by cosine similarity to this embedding.
    pub embedding: Option<Vec<f32>>,
    /// Substring match on name, description, or raw content.
    pub text: Option<String>,
    pub category: Option<PatternCategory>,
    pub pattern_type: Option<String>,
    pub domain: Option<String>,
    /// All listed tags must be present.
    pub tags: Vec<String>,
    pub language: Option<String>,
    pub framework: Option<String>,
    pub min_quality: Option<f64>,
    pub min_success_rate: Option<f64>,
    pub min_usage_count: Option<u64>,
    /// Drop results below this similarity; only meaningful with an
    /// embedding.
    pub min_similarity: Option<f32>,
    pub limit: Option<usize>,
    pub offset: usize,
}

/// One ranked search hit.
#[derive(Debug, Clone)]
pub struct SearchResult {
    pub pattern: SharedPattern,
    /// Cosine similarity when the query carried an embedding.
    pub similarity: Option<f32>,
}

/// Counters describing index state.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IndexStats {
    pub patterns: usize,
    pub evictions: u64,
    pub expired_removed: u64,
    pub dedup_rejections: u64,
}

#[derive(Debug, Clone)]
struct IndexEntry {
    pattern: SharedPattern,
    normalized_embedding: Vec<f32>,
    inserted_seq: u64,
    access_count: u64,
    last_access_ms: u64,
}

/// Bounded pattern store with vector and attribute search.
pub struct PatternIndex {
    config: IndexConfig,
    entries: HashMap<String, IndexEntry>,
    by_hash: HashMap<String, String>,
    insert_seq: u64,
    stats: IndexStats,
    time: Arc<dyn TimeProvider>,
}

impl PatternIndex {
    /// Create an index with the given configuration.
    pub fn new(config: IndexConfig, time: Arc<dyn TimeProvider>) -> Self {
        Self {
            config,
            entries: HashMap::new(),
            by_hash: HashMap::new(),
            insert_seq: 0,
            stats: IndexStats::default(),
            time,
        }
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the index is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Current counters.
    pub fn stats(&self) -> IndexStats {
        IndexStats {
            patterns: self.entries.len(),
            ..self.stats.clone()
        }
    }

    /// Ids of all live entries.
    pub fn ids(&self) -> Vec<String> {
        self.entries.keys().cloned().collect()
    }

    /// Insert a pattern. Returns false when deduplication rejected it (the
    /// existing entry's access count is bumped instead).
    pub fn add(&mut self, pattern: SharedPattern) -> PatternResult<bool> {
        if self.config.embedding_dim != 0
            && !pattern.embedding.is_empty()
            && pattern.embedding.len() != self.config.embedding_dim
        {
            return Err(PatternError::InvalidEmbedding(format!(
                "expected {} dimensions, got {}",
                self.config.embedding_dim,
                pattern.embedding.len()
            )));
        }

        let now = self.time.unix_millis();
        if pattern.is_expired(now) {
            return Err(PatternError::PatternNotFound(format!(
                "pattern {} is already expired",
                pattern.id
            )));
        }

        if self.config.dedup_enabled {
            if let Some(existing_id) = self.by_hash.get(&pattern.content.content_hash) {
                if existing_id != &pattern.id {
                    if let Some(existing) = self.entries.get_mut(existing_id) {
                        existing.access_count += 1;
                        existing.last_access_ms = now;
                    }
                    self.stats.dedup_rejections += 1;
                    debug!(
                        "dedup rejected pattern {} (hash held by {existing_id})",
                        pattern.id
                    );
                    return Ok(false);
                }
            }
        }

        // replacing an existing id: clear its old hash mapping first
        if let Some(old) = self.entries.get(&pattern.id) {
            self.by_hash.remove(&old.pattern.content.content_hash);
        }

        self.insert_seq += 1;
        self.by_hash
            .insert(pattern.content.content_hash.clone(), pattern.id.clone());
        let normalized_embedding = normalize(&pattern.embedding);
        self.entries.insert(
            pattern.id.clone(),
            IndexEntry {
                pattern,
                normalized_embedding,
                inserted_seq: self.insert_seq,
                access_count: 0,
                last_access_ms: now,
            },
        );

        self.evict_if_needed();
        Ok(true)
    }

    /// Fetch a pattern, bumping its access statistics. Expired entries are
    /// removed on access.
    pub fn get(&mut self, id: &str) -> Option<SharedPattern> {
        let now = self.time.unix_millis();
        let expired = self
            .entries
            .get(id)
            .map(|e| e.pattern.is_expired(now))
            .unwrap_or(false);
        if expired {
            self.remove(id);
            self.stats.expired_removed += 1;
            return None;
        }

        let entry = self.entries.get_mut(id)?;
        entry.access_count += 1;
        entry.last_access_ms = now;
        Some(entry.pattern.clone())
    }

    /// Remove a pattern by id.
    pub fn remove(&mut self, id: &str) -> Option<SharedPattern> {
        let entry = self.entries.remove(id)?;
        self.by_hash.remove(&entry.pattern.content.content_hash);
        Some(entry.pattern)
    }

    /// Remove all expired entries; returns how many were dropped.
    pub fn sweep_expired(&mut self) -> usize {
        let now = self.time.unix_millis();
        let expired: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, e)| e.pattern.is_expired(now))
            .map(|(id, _)| id.clone())
            .collect();
        for id in &expired {
            self.remove(id);
        }
        self.stats.expired_removed += expired.len() as u64;
        expired.len()
    }

    /// Search the index.
    pub fn search(&mut self, query: &PatternQuery) -> Vec<SearchResult> {
        let now = self.time.unix_millis();
        self.sweep_expired();

        let query_embedding = query.embedding.as_deref().map(normalize);
        if self.entries.len() > self.config.coarse_filter_threshold
            && query_embedding.is_some()
            && query.category.is_none()
            && query.domain.is_none()
        {
            debug!(
                "similarity search over {} entries without a category/domain prefilter",
                self.entries.len()
            );
        }

        let mut hits: Vec<(String, Option<f32>)> = Vec::new();
        for (id, entry) in &self.entries {
            let p = &entry.pattern;

            if let Some(category) = query.category {
                if p.category != category {
                    continue;
                }
            }
            if let Some(domain) = &query.domain {
                if &p.domain != domain {
                    continue;
                }
            }
            if let Some(pattern_type) = &query.pattern_type {
                if &p.pattern_type != pattern_type {
                    continue;
                }
            }
            if let Some(language) = &query.language {
                if &p.content.language != language {
                    continue;
                }
            }
            if let Some(framework) = &query.framework {
                if p.content.framework.as_ref() != Some(framework) {
                    continue;
                }
            }
            if !query.tags.iter().all(|t| p.metadata.tags.contains(t)) {
                continue;
            }
            if let Some(min_quality) = query.min_quality {
                if p.quality.score() < min_quality {
                    continue;
                }
            }
            if let Some(min_success) = query.min_success_rate {
                if p.quality.success_rate < min_success {
                    continue;
                }
            }
            if let Some(min_usage) = query.min_usage_count {
                if p.quality.usage_count < min_usage {
                    continue;
                }
            }
            if let Some(text) = &query.text {
                let needle = text.to_lowercase();
                let haystacks = [&p.name, &p.description, &p.content.raw];
                if !haystacks
                    .iter()
                    .any(|h| h.to_lowercase().contains(&needle))
                {
                    continue;
                }
            }

            let similarity = match &query_embedding {
                Some(qe) => {
                    let sim = cosine_similarity(qe, &entry.normalized_embedding);
                    match sim {
                        Some(s) => {
                            if let Some(min) = query.min_similarity {
                                if s < min {
                                    continue;
                                }
                            }
                            Some(s)
                        }
                        None => {
                            if query.min_similarity.is_some() {
                                continue;
                            }
                            None
                        }
                    }
                }
                None => None,
            };

            hits.push((id.clone(), similarity));
        }

        // rank by similarity (desc) then quality then recency
        hits.sort_by(|a, b| {
            let sim = b
                .1
                .unwrap_or(f32::MIN)
                .partial_cmp(&a.1.unwrap_or(f32::MIN))
                .unwrap_or(std::cmp::Ordering::Equal);
            if sim != std::cmp::Ordering::Equal {
                return sim;
            }
            let qa = self.entries[&a.0].pattern.quality.score();
            let qb = self.entries[&b.0].pattern.quality.score();
            qb.partial_cmp(&qa).unwrap_or(std::cmp::Ordering::Equal)
        });

        let limit = query.limit.unwrap_or(usize::MAX);
        let page: Vec<(String, Option<f32>)> = hits
            .into_iter()
            .skip(query.offset)
            .take(limit)
            .collect();

        let mut results = Vec::with_capacity(page.len());
        for (id, similarity) in page {
            if let Some(entry) = self.entries.get_mut(&id) {
                entry.access_count += 1;
                entry.last_access_ms = now;
                results.push(SearchResult {
                    pattern: entry.pattern.clone(),
                    similarity,
                });
            }
        }
        results
    }

    fn evict_if_needed(&mut self) {
        let threshold =
            (self.config.max_patterns as f64 * self.config.eviction_threshold) as usize;
        if self.entries.len() <= threshold {
            return;
        }

        let mut order: Vec<(String, u64, u64)> = self
            .entries
            .iter()
            .map(|(id, e)| (id.clone(), e.last_access_ms, e.inserted_seq))
            .collect();
        // least recently used first; insertion order breaks ties
        order.sort_by(|a, b| a.1.cmp(&b.1).then(a.2.cmp(&b.2)));

        let excess = self.entries.len() - self.config.max_patterns;
        for (id, _, _) in order.into_iter().take(excess) {
            self.remove(&id);
            self.stats.evictions += 1;
        }
        debug!(
            "evicted {excess} patterns, index back to {}",
            self.entries.len()
        );
    }
}
