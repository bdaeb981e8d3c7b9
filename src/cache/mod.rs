//! Two-tier artifact cache with TTL, compression, and eviction.
//!
//! The memory tier is an in-process LRU map bounded by entry count and
//! total byte size. The disk tier holds one file per entry under
//! `cache/<type>/<sha256(key)>`; values whose serialized form exceeds
//! 10 KiB are gzip-compressed inside a self-describing envelope:
//!
//! ```json
//! { "compressed": true, "data": "<base64 gzip>", "timestamp": "<iso-8601>" }
//! ```
//!
//! An entry is live iff `now <= created + ttl`; expired entries are never
//! returned and are deleted on sight. Disk write failure degrades the
//! cache to memory-only for the rest of the session, with a single
//! warning.

pub mod fingerprint;

pub use fingerprint::{canonicalize, fingerprint, hash_str};

use crate::error::{ProcessorError, Result};
use crate::health::HealthMonitor;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use lru::LruCache;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::io::{Read, Write};
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Serialized values above this are gzip-compressed on disk.
const COMPRESSION_THRESHOLD: usize = 10 * 1024;

/// Which entry to sacrifice when the memory tier is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvictionPolicy {
    /// Least recently used first.
    Lru,
    /// Soonest-to-expire first.
    SoonestTtl,
    /// Largest serialized value first.
    Largest,
}

/// Cache tunables.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Memory-tier entry bound.
    pub max_entries: usize,
    /// Memory-tier total byte bound.
    pub max_total_bytes: usize,
    /// Largest accepted serialized value; bigger sets are rejected.
    pub max_value_bytes: usize,
    /// Eviction policy for the memory tier.
    pub eviction: EvictionPolicy,
    /// TTL per cache type; types not listed use `default_ttl`.
    pub ttl_by_type: HashMap<String, Duration>,
    /// TTL for types without an explicit entry.
    pub default_ttl: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        let day = Duration::from_secs(24 * 3600);
        Self {
            max_entries: 1000,
            max_total_bytes: 64 * 1024 * 1024,
            max_value_bytes: 8 * 1024 * 1024,
            eviction: EvictionPolicy::Lru,
            ttl_by_type: HashMap::from([
                ("reasoning_cache".to_string(), 2 * day),
                ("thinking_cache".to_string(), day),
                ("generation_cache".to_string(), 7 * day),
            ]),
            default_ttl: day,
        }
    }
}

/// One cached artifact with its bookkeeping.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    /// Caller-supplied key (pre-hashing).
    pub key: String,
    /// The cached value.
    pub value: Value,
    /// Creation time.
    pub created: DateTime<Utc>,
    /// Time-to-live in milliseconds.
    pub ttl_ms: u64,
    /// Reads served from this entry.
    pub hits: u64,
    /// Last read time.
    pub last_accessed: DateTime<Utc>,
    /// Serialized value size in bytes.
    pub size_bytes: usize,
}

impl CacheEntry {
    /// Whether the entry is still live at `now`.
    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        now <= self.created + ChronoDuration::milliseconds(self.ttl_ms as i64)
    }
}

/// On-disk envelope for compressed entries.
#[derive(Debug, Serialize, Deserialize)]
struct CompressedEnvelope {
    compressed: bool,
    data: String,
    timestamp: String,
}

/// Per-type and aggregate lookup counters.
#[derive(Debug, Clone, Default, Serialize)]
pub struct TypeStats {
    /// Lookups answered from the memory tier.
    pub memory_hits: u64,
    /// Lookups answered from the disk tier.
    pub disk_hits: u64,
    /// Lookups answered by neither tier.
    pub misses: u64,
    /// Live entries currently in the memory tier.
    pub entries: usize,
    /// Bytes held by those entries.
    pub bytes: usize,
}

/// Aggregate cache statistics.
#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    /// Total hits (memory + disk).
    pub hits: u64,
    /// Total misses.
    pub misses: u64,
    /// Hit rate in `[0,1]`.
    pub hit_rate: f64,
    /// Memory-tier entry count.
    pub entries: usize,
    /// Memory-tier byte total.
    pub total_bytes: usize,
    /// Per-type breakdown.
    pub per_type: HashMap<String, TypeStats>,
}

struct MemoryTier {
    entries: LruCache<String, CacheEntry>,
    total_bytes: usize,
}

/// Two-tier artifact cache (C4).
pub struct CacheLayer {
    memory: Mutex<MemoryTier>,
    counters: Mutex<HashMap<String, TypeStats>>,
    config: CacheConfig,
    /// `cache/` root; `None` disables the disk tier outright.
    disk_root: Option<PathBuf>,
    /// Cleared on the first disk failure; a single warning is logged.
    disk_ok: AtomicBool,
    health: Option<Arc<HealthMonitor>>,
}

impl CacheLayer {
    /// Create a cache with a disk tier rooted at `disk_root`.
    pub fn new(config: CacheConfig, disk_root: PathBuf) -> Self {
        Self::build(config, Some(disk_root))
    }

    /// Create a memory-only cache.
    pub fn memory_only(config: CacheConfig) -> Self {
        Self::build(config, None)
    }

    fn build(config: CacheConfig, disk_root: Option<PathBuf>) -> Self {
        let cap = NonZeroUsize::new(config.max_entries.max(1)).expect("max_entries >= 1");
        Self {
            memory: Mutex::new(MemoryTier {
                entries: LruCache::new(cap),
                total_bytes: 0,
            }),
            counters: Mutex::new(HashMap::new()),
            config,
            disk_root,
            disk_ok: AtomicBool::new(true),
            health: None,
        }
    }

    /// Report lookup outcomes to a health monitor.
    pub fn with_health(mut self, health: Arc<HealthMonitor>) -> Self {
        self.health = Some(health);
        self
    }

    /// TTL for a cache type, from the per-type table.
    pub fn ttl_for(&self, cache_type: &str) -> Duration {
        self.config
            .ttl_by_type
            .get(cache_type)
            .copied()
            .unwrap_or(self.config.default_ttl)
    }

    fn composite_key(cache_type: &str, key: &str) -> String {
        format!("{}/{}", cache_type, hash_str(key))
    }

    fn entry_path(&self, cache_type: &str, key: &str) -> Option<PathBuf> {
        self.disk_root
            .as_ref()
            .map(|root| root.join(sanitize_type(cache_type)).join(hash_str(key)))
    }

    /// Look up a value. Memory tier first, then disk; a disk hit
    /// repopulates the memory tier. Expired entries are deleted, never
    /// returned.
    pub fn get(&self, cache_type: &str, key: &str) -> Option<Value> {
        let composite = Self::composite_key(cache_type, key);
        let now = Utc::now();

        // Memory tier.
        {
            let mut memory = self.memory.lock();
            if let Some(entry) = memory.entries.get_mut(&composite) {
                if entry.is_live(now) {
                    entry.hits += 1;
                    entry.last_accessed = now;
                    let value = entry.value.clone();
                    drop(memory);
                    self.count(cache_type, |s| s.memory_hits += 1);
                    self.record_health(true);
                    return Some(value);
                }
                // Expired in memory: drop from both tiers.
                let size = entry.size_bytes;
                memory.entries.pop(&composite);
                memory.total_bytes = memory.total_bytes.saturating_sub(size);
            }
        }

        // Disk tier.
        if let Some(entry) = self.read_disk(cache_type, key) {
            if entry.is_live(now) {
                let mut entry = entry;
                entry.hits += 1;
                entry.last_accessed = now;
                let value = entry.value.clone();
                self.admit(composite, entry);
                self.count(cache_type, |s| s.disk_hits += 1);
                self.record_health(true);
                return Some(value);
            }
            self.remove_disk(cache_type, key);
        }

        self.count(cache_type, |s| s.misses += 1);
        self.record_health(false);
        None
    }

    /// Store a value with the per-type TTL (or an explicit override).
    ///
    /// Oversized values are rejected with `CacheTooLarge`. The memory
    /// tier evicts per policy until the new entry fits; the disk tier is
    /// written synchronously unless the cache has degraded to
    /// memory-only.
    pub fn set(
        &self,
        cache_type: &str,
        key: &str,
        value: Value,
        ttl: Option<Duration>,
    ) -> Result<()> {
        let serialized = serde_json::to_vec(&value)?;
        if serialized.len() > self.config.max_value_bytes {
            return Err(ProcessorError::CacheTooLarge {
                size: serialized.len(),
                limit: self.config.max_value_bytes,
            });
        }

        let now = Utc::now();
        let ttl = ttl.unwrap_or_else(|| self.ttl_for(cache_type));
        let entry = CacheEntry {
            key: key.to_string(),
            value,
            created: now,
            ttl_ms: ttl.as_millis() as u64,
            hits: 0,
            last_accessed: now,
            size_bytes: serialized.len(),
        };

        self.write_disk(cache_type, key, &entry, &serialized);
        self.admit(Self::composite_key(cache_type, key), entry);
        Ok(())
    }

    /// Insert into the memory tier, evicting per policy until feasible.
    fn admit(&self, composite: String, entry: CacheEntry) {
        let mut memory = self.memory.lock();
        if let Some(old) = memory.entries.pop(&composite) {
            memory.total_bytes = memory.total_bytes.saturating_sub(old.size_bytes);
        }
        while memory.entries.len() >= self.config.max_entries
            || memory.total_bytes + entry.size_bytes > self.config.max_total_bytes
        {
            if !self.evict_one(&mut memory) {
                break;
            }
        }
        memory.total_bytes += entry.size_bytes;
        memory.entries.push(composite, entry);
    }

    /// Evict a single victim chosen by the configured policy.
    fn evict_one(&self, memory: &mut MemoryTier) -> bool {
        let victim = match self.config.eviction {
            EvictionPolicy::Lru => memory.entries.pop_lru().map(|(k, e)| (k, e.size_bytes)),
            EvictionPolicy::SoonestTtl => {
                let key = memory
                    .entries
                    .iter()
                    .min_by_key(|(_, e)| e.created + ChronoDuration::milliseconds(e.ttl_ms as i64))
                    .map(|(k, _)| k.clone());
                key.and_then(|k| memory.entries.pop(&k).map(|e| (k, e.size_bytes)))
            }
            EvictionPolicy::Largest => {
                let key = memory
                    .entries
                    .iter()
                    .max_by_key(|(_, e)| e.size_bytes)
                    .map(|(k, _)| k.clone());
                key.and_then(|k| memory.entries.pop(&k).map(|e| (k, e.size_bytes)))
            }
        };
        match victim {
            Some((_, size)) => {
                memory.total_bytes = memory.total_bytes.saturating_sub(size);
                true
            }
            None => false,
        }
    }

    /// Remove an entry from both tiers.
    pub fn delete(&self, cache_type: &str, key: &str) {
        let composite = Self::composite_key(cache_type, key);
        let mut memory = self.memory.lock();
        if let Some(entry) = memory.entries.pop(&composite) {
            memory.total_bytes = memory.total_bytes.saturating_sub(entry.size_bytes);
        }
        drop(memory);
        self.remove_disk(cache_type, key);
    }

    /// Drop everything from both tiers.
    pub fn clear(&self) {
        let mut memory = self.memory.lock();
        memory.entries.clear();
        memory.total_bytes = 0;
        drop(memory);
        if let Some(ref root) = self.disk_root {
            if root.exists() {
                let _ = std::fs::remove_dir_all(root);
            }
        }
    }

    /// Clear the memory tier, then walk the disk tier deleting expired
    /// or corrupt files. Returns the number of files removed.
    pub fn maintenance(&self) -> usize {
        {
            let mut memory = self.memory.lock();
            memory.entries.clear();
            memory.total_bytes = 0;
        }

        let Some(ref root) = self.disk_root else {
            return 0;
        };
        if !root.exists() {
            return 0;
        }

        let now = Utc::now();
        let mut removed = 0;
        for type_dir in read_dir_paths(root) {
            if !type_dir.is_dir() {
                continue;
            }
            for file in read_dir_paths(&type_dir) {
                match read_entry_file(&file) {
                    Ok(entry) if entry.is_live(now) => {}
                    _ => {
                        if std::fs::remove_file(&file).is_ok() {
                            removed += 1;
                        }
                    }
                }
            }
        }
        tracing::debug!(removed, "cache maintenance swept disk tier");
        removed
    }

    /// Current statistics.
    pub fn stats(&self) -> CacheStats {
        let memory = self.memory.lock();
        let mut per_type = self.counters.lock().clone();
        // Fold live entry counts/bytes into the per-type rows.
        for row in per_type.values_mut() {
            row.entries = 0;
            row.bytes = 0;
        }
        for (composite, entry) in memory.entries.iter() {
            let cache_type = composite.split('/').next().unwrap_or("").to_string();
            let row = per_type.entry(cache_type).or_default();
            row.entries += 1;
            row.bytes += entry.size_bytes;
        }

        let hits: u64 = per_type.values().map(|s| s.memory_hits + s.disk_hits).sum();
        let misses: u64 = per_type.values().map(|s| s.misses).sum();
        CacheStats {
            hits,
            misses,
            hit_rate: if hits + misses == 0 {
                0.0
            } else {
                hits as f64 / (hits + misses) as f64
            },
            entries: memory.entries.len(),
            total_bytes: memory.total_bytes,
            per_type,
        }
    }

    /// Statistics for one cache type.
    pub fn stats_for(&self, cache_type: &str) -> TypeStats {
        self.stats().per_type.get(cache_type).cloned().unwrap_or_default()
    }

    fn count(&self, cache_type: &str, f: impl FnOnce(&mut TypeStats)) {
        let mut counters = self.counters.lock();
        f(counters.entry(cache_type.to_string()).or_default());
    }

    fn record_health(&self, hit: bool) {
        if let Some(ref health) = self.health {
            health.record_cache(hit);
        }
    }

    // ---- disk tier ----

    fn disk_enabled(&self) -> bool {
        self.disk_root.is_some() && self.disk_ok.load(Ordering::Relaxed)
    }

    fn write_disk(&self, cache_type: &str, key: &str, entry: &CacheEntry, serialized_value: &[u8]) {
        if !self.disk_enabled() {
            return;
        }
        let Some(path) = self.entry_path(cache_type, key) else {
            return;
        };
        let result = (|| -> Result<()> {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let body = serde_json::to_vec(entry)?;
            let body = if serialized_value.len() > COMPRESSION_THRESHOLD {
                let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
                encoder.write_all(&body)?;
                let compressed = encoder.finish()?;
                serde_json::to_vec(&CompressedEnvelope {
                    compressed: true,
                    data: BASE64.encode(compressed),
                    timestamp: entry.created.to_rfc3339(),
                })?
            } else {
                body
            };
            std::fs::write(&path, body)?;
            Ok(())
        })();

        if let Err(e) = result {
            // One warning per session; the memory entry stays valid.
            if self.disk_ok.swap(false, Ordering::Relaxed) {
                tracing::warn!(error = %e, "cache disk write failed; continuing memory-only");
            }
        }
    }

    fn read_disk(&self, cache_type: &str, key: &str) -> Option<CacheEntry> {
        if !self.disk_enabled() {
            return None;
        }
        let path = self.entry_path(cache_type, key)?;
        match read_entry_file(&path) {
            Ok(entry) => Some(entry),
            Err(_) => None,
        }
    }

    fn remove_disk(&self, cache_type: &str, key: &str) {
        if let Some(path) = self.entry_path(cache_type, key) {
            let _ = std::fs::remove_file(path);
        }
    }

}

fn sanitize_type(cache_type: &str) -> String {
    cache_type
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

fn read_dir_paths(dir: &Path) -> Vec<PathBuf> {
    std::fs::read_dir(dir)
        .map(|entries| entries.flatten().map(|e| e.path()).collect())
        .unwrap_or_default()
}

/// Parse an entry file, transparently unwrapping the compressed envelope.
fn read_entry_file(path: &Path) -> Result<CacheEntry> {
    let raw = std::fs::read(path)?;
    let parsed: Value = serde_json::from_slice(&raw)?;
    if parsed.get("compressed").and_then(Value::as_bool) == Some(true) {
        let envelope: CompressedEnvelope = serde_json::from_value(parsed)?;
        let compressed = BASE64
            .decode(envelope.data.as_bytes())
            .map_err(|e| ProcessorError::Persistence(format!("bad envelope base64: {}", e)))?;
        let mut decoder = GzDecoder::new(&compressed[..]);
        let mut body = Vec::new();
        decoder.read_to_end(&mut body)?;
        Ok(serde_json::from_slice(&body)?)
    } else {
        Ok(serde_json::from_value(parsed)?)
    }
}
