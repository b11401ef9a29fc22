//! Response cache with exact and semantic lookup
//!
//! Entries live in a concurrent map keyed by the normalised request hash.
//! Lookups never take a store-wide lock: hit counts and access times are
//! per-entry atomics. Inserts are serialised so the capacity check and the
//! evictions it triggers happen as one step.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use super::key::cache_key;
use crate::backend::Embedder;
use crate::telemetry::{export, MetricsCollector};
use crate::types::{LlmRequest, LlmResponse, RequestKind};

/// Configuration for the cache store
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Maximum number of entries; 0 disables caching
    pub capacity: usize,
    /// TTL used when a write names none
    pub default_ttl: Duration,
    /// Minimum cosine similarity for a semantic hit; `None` disables the
    /// semantic path unless a call supplies its own threshold
    pub similarity_threshold: Option<f32>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            capacity: 10_000,
            default_ttl: Duration::from_secs(3600),
            similarity_threshold: None,
        }
    }
}

/// A cached response
///
/// The payload is immutable; only the hit count and access time change.
#[derive(Debug)]
pub struct CacheEntry {
    pub key: String,
    pub kind: RequestKind,
    /// Model that produced the response
    pub model: String,
    pub embedding: Option<Vec<f32>>,
    pub response: LlmResponse,
    pub tokens_in: u32,
    pub tokens_out: u32,
    pub created_at: DateTime<Utc>,
    pub ttl: Duration,
    hits: AtomicU64,
    last_access_ms: AtomicI64,
    /// Logical clock value of the last access, for LRU ordering
    access_seq: AtomicU64,
}

impl CacheEntry {
    pub fn expires_at(&self) -> DateTime<Utc> {
        chrono::Duration::from_std(self.ttl)
            .ok()
            .and_then(|ttl| self.created_at.checked_add_signed(ttl))
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at()
    }

    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn last_access(&self) -> DateTime<Utc> {
        DateTime::from_timestamp_millis(self.last_access_ms.load(Ordering::Relaxed))
            .unwrap_or(self.created_at)
    }

    fn access_seq(&self) -> u64 {
        self.access_seq.load(Ordering::Relaxed)
    }

    fn touch(&self, seq: u64, now: DateTime<Utc>) {
        self.hits.fetch_add(1, Ordering::Relaxed);
        self.last_access_ms
            .store(now.timestamp_millis(), Ordering::Relaxed);
        self.access_seq.fetch_max(seq, Ordering::Relaxed);
    }
}

/// Serialized cache entry for restart survival
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntrySnapshot {
    pub key: String,
    pub kind: RequestKind,
    pub model: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
    pub response: LlmResponse,
    pub tokens_in: u32,
    pub tokens_out: u32,
    pub created_at: DateTime<Utc>,
    pub ttl_ms: u64,
    pub hits: u64,
    pub last_access: DateTime<Utc>,
}

/// How a lookup matched
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MatchKind {
    Exact,
    Semantic { similarity: f32 },
}

#[derive(Debug, Clone)]
pub struct CacheHit {
    pub entry: Arc<CacheEntry>,
    pub kind: MatchKind,
}

/// What a miss already computed, reused when writing the fresh response
#[derive(Debug, Clone)]
pub struct CacheMiss {
    pub key: String,
    pub kind: RequestKind,
    pub embedding: Option<Vec<f32>>,
}

#[derive(Debug, Clone)]
pub enum CacheLookup {
    Hit(CacheHit),
    Miss(CacheMiss),
}

/// Predicate over entries for administrative invalidation
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CacheFilter {
    /// Only entries produced by this model
    pub model: Option<String>,
    pub kind: Option<RequestKind>,
    /// Only entries created more than this many seconds ago
    pub older_than_secs: Option<u64>,
}

impl CacheFilter {
    pub fn matches(&self, entry: &CacheEntry, now: DateTime<Utc>) -> bool {
        self.model.as_deref().map_or(true, |m| entry.model == m)
            && self.kind.map_or(true, |k| entry.kind == k)
            && self.older_than_secs.map_or(true, |secs| {
                now.signed_duration_since(entry.created_at).num_seconds() >= secs as i64
            })
    }
}

/// Cosine similarity; `None` when dimensions differ or a vector is zero
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> Option<f32> {
    if a.len() != b.len() || a.is_empty() {
        return None;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return None;
    }
    Some(dot / (norm_a * norm_b))
}

/// Exact + semantic response cache
pub struct CacheStore {
    entries: DashMap<String, Arc<CacheEntry>>,
    write_lock: Mutex<()>,
    clock: AtomicU64,
    embedder: Option<Arc<dyn Embedder>>,
    metrics: Arc<MetricsCollector>,
    config: CacheConfig,
}

impl CacheStore {
    pub fn new(
        config: CacheConfig,
        embedder: Option<Arc<dyn Embedder>>,
        metrics: Arc<MetricsCollector>,
    ) -> Self {
        Self {
            entries: DashMap::new(),
            write_lock: Mutex::new(()),
            clock: AtomicU64::new(0),
            embedder,
            metrics,
            config,
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn tick(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Look a request up, exact match first
    ///
    /// `threshold` overrides the configured similarity threshold for this
    /// call. Never calls a backend; the only await is the embedder.
    #[instrument(skip_all, fields(kind = %request.kind))]
    pub async fn lookup(&self, request: &LlmRequest, threshold: Option<f32>) -> CacheLookup {
        let key = cache_key(request);
        let now = Utc::now();

        if let Some(entry) = self.live_entry(&key, now) {
            entry.touch(self.tick(), now);
            self.metrics.record_cache_hit(&entry.model, false);
            debug!(key = %key, model = %entry.model, "Exact cache hit");
            return CacheLookup::Hit(CacheHit {
                entry,
                kind: MatchKind::Exact,
            });
        }

        let mut embedding = None;
        if let Some(threshold) = threshold.or(self.config.similarity_threshold) {
            embedding = self.embed(request).await;
            if let Some(vector) = &embedding {
                if let Some((entry, similarity)) = self.nearest(request.kind, vector, threshold, now) {
                    entry.touch(self.tick(), now);
                    self.metrics.record_cache_hit(&entry.model, true);
                    debug!(
                        model = %entry.model,
                        similarity = similarity,
                        threshold = threshold,
                        "Semantic cache hit"
                    );
                    return CacheLookup::Hit(CacheHit {
                        entry,
                        kind: MatchKind::Semantic { similarity },
                    });
                }
            }
        }

        self.metrics.record_cache_miss();
        CacheLookup::Miss(CacheMiss {
            key,
            kind: request.kind,
            embedding,
        })
    }

    /// Convenience form of [`lookup`](Self::lookup) returning only the entry
    pub async fn get(&self, request: &LlmRequest) -> Option<Arc<CacheEntry>> {
        match self.lookup(request, None).await {
            CacheLookup::Hit(hit) => Some(hit.entry),
            CacheLookup::Miss(_) => None,
        }
    }

    fn live_entry(&self, key: &str, now: DateTime<Utc>) -> Option<Arc<CacheEntry>> {
        let entry = self.entries.get(key)?.clone();
        if entry.is_expired_at(now) {
            if self
                .entries
                .remove_if(key, |_, e| Arc::ptr_eq(e, &entry))
                .is_some()
            {
                self.metrics.record_cache_eviction("expired");
            }
            return None;
        }
        Some(entry)
    }

    async fn embed(&self, request: &LlmRequest) -> Option<Vec<f32>> {
        let embedder = self.embedder.as_ref()?;
        match embedder.embed(&request.text()).await {
            Ok(vector) => Some(vector),
            Err(e) => {
                warn!(error = %e, "Embedding failed, skipping semantic cache");
                None
            }
        }
    }

    /// Best live entry of the same kind at or above `threshold`
    ///
    /// Ties go to the most recently accessed entry.
    fn nearest(
        &self,
        kind: RequestKind,
        vector: &[f32],
        threshold: f32,
        now: DateTime<Utc>,
    ) -> Option<(Arc<CacheEntry>, f32)> {
        let mut best: Option<(Arc<CacheEntry>, f32)> = None;
        for item in self.entries.iter() {
            let entry = item.value();
            if entry.kind != kind || entry.is_expired_at(now) {
                continue;
            }
            let Some(similarity) = entry
                .embedding
                .as_deref()
                .and_then(|e| cosine_similarity(vector, e))
            else {
                continue;
            };
            if similarity < threshold {
                continue;
            }
            let better = match &best {
                None => true,
                Some((current, best_similarity)) => {
                    similarity > *best_similarity
                        || (similarity == *best_similarity
                            && entry.access_seq() > current.access_seq())
                }
            };
            if better {
                best = Some((entry.clone(), similarity));
            }
        }
        best
    }

    /// Write a response for a request
    ///
    /// `ttl` of `None` uses the configured default.
    pub async fn put(
        &self,
        request: &LlmRequest,
        model: &str,
        response: &LlmResponse,
        tokens: (u32, u32),
        ttl: Option<Duration>,
    ) {
        let miss = CacheMiss {
            key: cache_key(request),
            kind: request.kind,
            embedding: None,
        };
        self.put_after_miss(miss, request, model, response, tokens, ttl)
            .await;
    }

    /// Write a response reusing the key and embedding computed by a miss
    pub async fn put_after_miss(
        &self,
        miss: CacheMiss,
        request: &LlmRequest,
        model: &str,
        response: &LlmResponse,
        tokens: (u32, u32),
        ttl: Option<Duration>,
    ) {
        let ttl = ttl.unwrap_or(self.config.default_ttl);
        if self.config.capacity == 0 || ttl.is_zero() {
            return;
        }
        let embedding = match miss.embedding {
            Some(vector) => Some(vector),
            None => self.embed(request).await,
        };

        let now = Utc::now();
        let entry = CacheEntry {
            key: miss.key,
            kind: miss.kind,
            model: model.to_string(),
            embedding,
            response: response.clone(),
            tokens_in: tokens.0,
            tokens_out: tokens.1,
            created_at: now,
            ttl,
            hits: AtomicU64::new(0),
            last_access_ms: AtomicI64::new(now.timestamp_millis()),
            access_seq: AtomicU64::new(self.tick()),
        };
        self.insert(entry, now);
        export::record_cache_operation("put", "ok");
    }

    fn insert(&self, entry: CacheEntry, now: DateTime<Utc>) {
        let _guard = self.write_lock.lock();
        if !self.entries.contains_key(&entry.key) && self.entries.len() >= self.config.capacity {
            self.purge_expired_at(now);
            while self.entries.len() >= self.config.capacity {
                if !self.evict_least_recent() {
                    break;
                }
            }
        }
        debug!(key = %entry.key, model = %entry.model, ttl_secs = entry.ttl.as_secs(), "Cached response");
        self.entries.insert(entry.key.clone(), Arc::new(entry));
    }

    fn evict_least_recent(&self) -> bool {
        let victim = self
            .entries
            .iter()
            .min_by_key(|item| item.value().access_seq())
            .map(|item| item.key().clone());
        match victim {
            Some(key) => {
                self.entries.remove(&key);
                self.metrics.record_cache_eviction("lru");
                debug!(key = %key, "Evicted least recently used cache entry");
                true
            }
            None => false,
        }
    }

    /// Drop every expired entry; returns how many were removed
    pub fn purge_expired(&self) -> usize {
        self.purge_expired_at(Utc::now())
    }

    fn purge_expired_at(&self, now: DateTime<Utc>) -> usize {
        let mut removed = 0;
        self.entries.retain(|_, entry| {
            let keep = !entry.is_expired_at(now);
            if !keep {
                removed += 1;
            }
            keep
        });
        for _ in 0..removed {
            self.metrics.record_cache_eviction("expired");
        }
        if removed > 0 {
            debug!(removed = removed, "Purged expired cache entries");
        }
        removed
    }

    /// Remove entries matching a predicate; returns how many were removed
    pub fn invalidate(&self, predicate: impl Fn(&CacheEntry) -> bool) -> usize {
        let mut removed = 0;
        self.entries.retain(|_, entry| {
            let matched = predicate(entry);
            if matched {
                removed += 1;
            }
            !matched
        });
        info!(removed = removed, "Invalidated cache entries");
        removed
    }

    pub fn invalidate_matching(&self, filter: &CacheFilter) -> usize {
        let now = Utc::now();
        self.invalidate(|entry| filter.matches(entry, now))
    }

    /// Live entries in serializable form
    pub fn snapshot(&self) -> Vec<CacheEntrySnapshot> {
        let now = Utc::now();
        let mut entries: Vec<CacheEntrySnapshot> = self
            .entries
            .iter()
            .filter(|item| !item.value().is_expired_at(now))
            .map(|item| {
                let entry = item.value();
                CacheEntrySnapshot {
                    key: entry.key.clone(),
                    kind: entry.kind,
                    model: entry.model.clone(),
                    embedding: entry.embedding.clone(),
                    response: entry.response.clone(),
                    tokens_in: entry.tokens_in,
                    tokens_out: entry.tokens_out,
                    created_at: entry.created_at,
                    ttl_ms: entry.ttl.as_millis() as u64,
                    hits: entry.hits(),
                    last_access: entry.last_access(),
                }
            })
            .collect();
        entries.sort_by_key(|e| e.last_access);
        entries
    }

    /// Load snapshot entries that have not expired; returns how many
    pub fn restore(&self, entries: Vec<CacheEntrySnapshot>) -> usize {
        let now = Utc::now();
        let mut restored = 0;
        // Oldest access first so the logical clock keeps their order
        let mut entries = entries;
        entries.sort_by_key(|e| e.last_access);
        for snapshot in entries {
            let entry = CacheEntry {
                key: snapshot.key,
                kind: snapshot.kind,
                model: snapshot.model,
                embedding: snapshot.embedding,
                response: snapshot.response,
                tokens_in: snapshot.tokens_in,
                tokens_out: snapshot.tokens_out,
                created_at: snapshot.created_at,
                ttl: Duration::from_millis(snapshot.ttl_ms),
                hits: AtomicU64::new(snapshot.hits),
                last_access_ms: AtomicI64::new(snapshot.last_access.timestamp_millis()),
                access_seq: AtomicU64::new(self.tick()),
            };
            if entry.is_expired_at(now) || self.config.capacity == 0 {
                continue;
            }
            self.insert(entry, now);
            restored += 1;
        }
        info!(restored = restored, "Restored cache entries");
        restored
    }
}
