//! Cache store
//!
//! Exact-match lookup by normalised request hash, semantic lookup by
//! embedding similarity, TTL expiry and LRU eviction.

mod key;
mod store;

pub use key::{cache_key, normalize, normalize_text};
pub use store::{
    cosine_similarity, CacheConfig, CacheEntry, CacheEntrySnapshot, CacheFilter, CacheHit,
    CacheLookup, CacheMiss, CacheStore, MatchKind,
};
