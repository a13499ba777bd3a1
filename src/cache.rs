//! Unit Cache for Lumen Build
//!
//! Per source-unit memory of everything the pipeline already computed: the
//! transformed byte snapshot of each stage, an optional parsed-representation
//! handle, and a generic load-result cache used by resource resolution.
//!
//! Invalidation is transitive by construction: a cache entry for stage n is
//! only valid while every upstream stage input for the same unit is unchanged,
//! so `invalidate` drops *all* stage entries for a path. No stage-partial
//! invalidation is exposed. Absence always means "recompute", never an error.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};

// ═══════════════════════════════════════════════════════════════════════════════
// STAGE NAMES
// ═══════════════════════════════════════════════════════════════════════════════

pub const STAGE_EMIT: &str = "emit";
pub const STAGE_TRANSFORM: &str = "transform";

// ═══════════════════════════════════════════════════════════════════════════════
// ENTRIES
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheEntry {
    /// Fingerprint of the *input* that produced these bytes.
    pub fingerprint: String,
    pub bytes: Vec<u8>,
    pub source_map: Option<String>,
}

/// Memoized result of a resource load, keyed by synthetic module path and
/// owned by the importing unit so it dies with it.
#[derive(Debug, Clone)]
pub struct CachedLoad {
    pub importer: String,
    pub contents: Option<String>,
}

// ═══════════════════════════════════════════════════════════════════════════════
// UNIT CACHE
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Default)]
pub struct UnitCache {
    /// path -> stage -> entry
    stages: HashMap<String, HashMap<String, CacheEntry>>,
    /// synthetic path -> load result
    loads: HashMap<String, CachedLoad>,
}

impl UnitCache {
    pub fn new() -> Self {
        UnitCache::default()
    }

    /// Content fingerprint used as the cache-validity key for a unit at a
    /// given stage.
    pub fn compute_fingerprint(input: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(input);
        format!("{:x}", hasher.finalize())
    }

    pub fn get(&self, stage: &str, path: &str) -> Option<&CacheEntry> {
        self.stages.get(path)?.get(stage)
    }

    /// Entry for (stage, path) only if it was produced from `fingerprint`.
    pub fn get_if_current(&self, stage: &str, path: &str, fingerprint: &str) -> Option<&CacheEntry> {
        self.get(stage, path)
            .filter(|entry| entry.fingerprint == fingerprint)
    }

    pub fn put(&mut self, stage: &str, path: &str, entry: CacheEntry) {
        self.stages
            .entry(path.to_string())
            .or_default()
            .insert(stage.to_string(), entry);
    }

    /// Drop every stage entry for each given path, plus any load results the
    /// path imported. Transitivity: an upstream change never leaves a stale
    /// downstream artifact behind.
    pub fn invalidate(&mut self, paths: &HashSet<String>) {
        for path in paths {
            self.stages.remove(path);
        }
        self.loads.retain(|_, load| !paths.contains(&load.importer));
    }

    pub fn get_load(&self, synthetic_path: &str) -> Option<&CachedLoad> {
        self.loads.get(synthetic_path)
    }

    pub fn put_load(&mut self, synthetic_path: &str, load: CachedLoad) {
        self.loads.insert(synthetic_path.to_string(), load);
    }

    pub fn tracked_paths(&self) -> impl Iterator<Item = &String> {
        self.stages.keys()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(fingerprint: &str, bytes: &[u8]) -> CacheEntry {
        CacheEntry {
            fingerprint: fingerprint.to_string(),
            bytes: bytes.to_vec(),
            source_map: None,
        }
    }

    #[test]
    fn test_absence_means_recompute() {
        let cache = UnitCache::new();
        assert!(cache.get(STAGE_EMIT, "/a.lum").is_none());
    }

    #[test]
    fn test_get_if_current_rejects_stale_fingerprint() {
        let mut cache = UnitCache::new();
        cache.put(STAGE_EMIT, "/a.lum", entry("f1", b"one"));
        assert!(cache.get_if_current(STAGE_EMIT, "/a.lum", "f1").is_some());
        assert!(cache.get_if_current(STAGE_EMIT, "/a.lum", "f2").is_none());
    }

    #[test]
    fn test_unchanged_fingerprint_returns_exact_bytes() {
        let mut cache = UnitCache::new();
        cache.put(STAGE_TRANSFORM, "/a.lum", entry("f1", b"transformed output"));
        let hit = cache
            .get_if_current(STAGE_TRANSFORM, "/a.lum", "f1")
            .expect("hit");
        assert_eq!(hit.bytes, b"transformed output");
    }

    #[test]
    fn test_invalidation_is_transitive_across_stages() {
        let mut cache = UnitCache::new();
        // Stage-2 output depends on stage-1 output of the same unit.
        cache.put(STAGE_EMIT, "/a.lum", entry("f1", b"emitted"));
        cache.put(STAGE_TRANSFORM, "/a.lum", entry("f2", b"rewritten"));
        cache.put(STAGE_EMIT, "/b.lum", entry("f3", b"other"));

        let changed: HashSet<String> = ["/a.lum".to_string()].into_iter().collect();
        cache.invalidate(&changed);

        assert!(cache.get(STAGE_EMIT, "/a.lum").is_none());
        assert!(
            cache.get(STAGE_TRANSFORM, "/a.lum").is_none(),
            "stale downstream entry must not survive"
        );
        assert!(cache.get(STAGE_EMIT, "/b.lum").is_some());
    }

    #[test]
    fn test_invalidation_drops_owned_loads() {
        let mut cache = UnitCache::new();
        cache.put_load(
            "/a.css",
            CachedLoad {
                importer: "/a.lum".to_string(),
                contents: Some("p{}".to_string()),
            },
        );
        cache.put_load(
            "/b.css",
            CachedLoad {
                importer: "/b.lum".to_string(),
                contents: None,
            },
        );

        let changed: HashSet<String> = ["/a.lum".to_string()].into_iter().collect();
        cache.invalidate(&changed);

        assert!(cache.get_load("/a.css").is_none());
        assert!(cache.get_load("/b.css").is_some());
    }

    #[test]
    fn test_fingerprint_is_stable_sha256_hex() {
        let a = UnitCache::compute_fingerprint(b"same input");
        let b = UnitCache::compute_fingerprint(b"same input");
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
        assert_ne!(a, UnitCache::compute_fingerprint(b"different input"));
    }
}
