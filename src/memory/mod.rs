//! Typed associative memory with hybrid retrieval and persistence.
//!
//! Items are typed (`working`, `episodic`, `semantic`, `procedural`),
//! carry an importance weight and a connection set, and get a vector
//! companion computed at store time. Retrieval ranks by a hybrid of
//! vector similarity and lexical overlap (see [`retrieval`]).
//!
//! Persistence layout under the data directory:
//!
//! ```text
//! memory.json             master item list (rewritten atomically)
//! memory/<id>             per-item copy
//! vectors/vectors.json    master vector list
//! vectors/<id>            per-item vector
//! ```
//!
//! Disk failure degrades the store to memory-only for the session with
//! a single warning.

pub mod embedding;
pub mod retrieval;

pub use embedding::{Embedder, HashEmbedder, DEFAULT_DIMENSIONS};

use crate::error::{ProcessorError, Result};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// The four memory types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemoryKind {
    /// Short-lived task context.
    Working,
    /// Recorded happenings.
    Episodic,
    /// Distilled facts.
    Semantic,
    /// How-to knowledge.
    Procedural,
}

impl MemoryKind {
    /// Retrieval boost for this type.
    pub fn type_boost(&self) -> f64 {
        match self {
            MemoryKind::Working => 1.5,
            MemoryKind::Semantic => 1.2,
            MemoryKind::Episodic => 1.0,
            MemoryKind::Procedural => 0.8,
        }
    }

    /// Stable wire string.
    pub fn as_str(&self) -> &'static str {
        match self {
            MemoryKind::Working => "working",
            MemoryKind::Episodic => "episodic",
            MemoryKind::Semantic => "semantic",
            MemoryKind::Procedural => "procedural",
        }
    }

    /// Parse a wire string.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "working" => Some(MemoryKind::Working),
            "episodic" => Some(MemoryKind::Episodic),
            "semantic" => Some(MemoryKind::Semantic),
            "procedural" => Some(MemoryKind::Procedural),
            _ => None,
        }
    }
}

/// One memory item.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryItem {
    /// Unique id.
    pub id: String,
    /// Memory type.
    #[serde(rename = "type")]
    pub kind: MemoryKind,
    /// The remembered content.
    pub content: String,
    /// Weight in `[0,1]` multiplied into retrieval scores.
    pub importance: f64,
    /// Ids of connected items. Dangling references are pruned by
    /// maintenance; cycles are permitted.
    #[serde(default)]
    pub connections: BTreeSet<String>,
    /// Creation time.
    pub created: DateTime<Utc>,
    /// Last retrieval relevance, in `[0,1]`.
    #[serde(default)]
    pub relevance: f64,
}

/// Vector companion of one item.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryVector {
    /// Owning item id.
    pub item_id: String,
    /// Unit-normalized embedding.
    pub vector: Vec<f32>,
    /// Creation time.
    pub created: DateTime<Utc>,
}

/// A retrieval result.
#[derive(Debug, Clone, Serialize)]
pub struct ScoredItem {
    /// The matched item.
    pub item: MemoryItem,
    /// Hybrid score; higher is better.
    pub score: f64,
}

/// Per-type entry counts for the stats resource.
#[derive(Debug, Clone, Serialize)]
pub struct MemoryStats {
    /// Total live items.
    pub total: usize,
    /// Items per type.
    pub by_type: HashMap<String, usize>,
}

/// Typed memory store (C5).
pub struct MemoryStore {
    items: RwLock<HashMap<String, MemoryItem>>,
    vectors: RwLock<HashMap<String, Vec<f32>>>,
    embedder: Arc<dyn Embedder>,
    data_dir: Option<PathBuf>,
    disk_ok: AtomicBool,
}

impl MemoryStore {
    /// Open a store rooted at `data_dir`, loading the master files if
    /// they exist.
    pub fn open(embedder: Arc<dyn Embedder>, data_dir: PathBuf) -> Result<Self> {
        let store = Self {
            items: RwLock::new(HashMap::new()),
            vectors: RwLock::new(HashMap::new()),
            embedder,
            data_dir: Some(data_dir),
            disk_ok: AtomicBool::new(true),
        };
        store.load()?;
        Ok(store)
    }

    /// A store with no persistence.
    pub fn in_memory(embedder: Arc<dyn Embedder>) -> Self {
        Self {
            items: RwLock::new(HashMap::new()),
            vectors: RwLock::new(HashMap::new()),
            embedder,
            data_dir: None,
            disk_ok: AtomicBool::new(true),
        }
    }

    /// Store new content; returns the assigned id.
    ///
    /// Connection ids that do not resolve are dropped. A vector is
    /// computed and persisted alongside the item.
    pub fn store(
        &self,
        kind: MemoryKind,
        content: impl Into<String>,
        importance: f64,
        connections: BTreeSet<String>,
    ) -> Result<String> {
        let content = content.into();
        if content.trim().is_empty() {
            return Err(ProcessorError::invalid_input(
                "memory content must not be empty",
                &["pass the text to remember in `content`"],
            ));
        }

        let id = uuid::Uuid::new_v4().to_string();
        let vector = self.embedder.embed(&content);
        let item = {
            let mut items = self.items.write();
            let connections = connections
                .into_iter()
                .filter(|c| items.contains_key(c))
                .collect();
            let item = MemoryItem {
                id: id.clone(),
                kind,
                content,
                importance: importance.clamp(0.0, 1.0),
                connections,
                created: Utc::now(),
                relevance: 1.0,
            };
            items.insert(id.clone(), item.clone());
            item
        };
        self.vectors.write().insert(id.clone(), vector.clone());

        self.persist_item(&item, &vector);
        self.persist_masters();
        Ok(id)
    }

    /// Fetch one item by id.
    pub fn get_by_id(&self, id: &str) -> Option<MemoryItem> {
        self.items.read().get(id).cloned()
    }

    /// All items, unordered.
    pub fn get_all(&self) -> Vec<MemoryItem> {
        self.items.read().values().cloned().collect()
    }

    /// All items of one type.
    pub fn get_by_type(&self, kind: MemoryKind) -> Vec<MemoryItem> {
        self.items
            .read()
            .values()
            .filter(|i| i.kind == kind)
            .cloned()
            .collect()
    }

    /// Replace an item's connections, dropping unresolvable ids.
    pub fn update_connections(&self, id: &str, connections: BTreeSet<String>) -> Result<()> {
        let item = {
            let mut items = self.items.write();
            let valid: BTreeSet<String> = connections
                .into_iter()
                .filter(|c| c != id && items.contains_key(c))
                .collect();
            let item = items
                .get_mut(id)
                .ok_or_else(|| ProcessorError::invalid_input("unknown memory id", &[]))?;
            item.connections = valid;
            item.clone()
        };
        let vector = self.vectors.read().get(id).cloned().unwrap_or_default();
        self.persist_item(&item, &vector);
        self.persist_masters();
        Ok(())
    }

    /// Resolve an item's connections to items.
    pub fn get_connected(&self, id: &str) -> Vec<MemoryItem> {
        let items = self.items.read();
        items
            .get(id)
            .map(|item| {
                item.connections
                    .iter()
                    .filter_map(|c| items.get(c).cloned())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Hybrid retrieval: top `limit` items ranked by
    /// [`retrieval::score`].
    pub fn retrieve(&self, query: &str, limit: usize) -> Vec<ScoredItem> {
        let query_vector = self.embedder.embed(query);
        let now = Utc::now();
        let items = self.items.read();
        let vectors = self.vectors.read();

        let mut scored: Vec<ScoredItem> = items
            .values()
            .map(|item| {
                // Items loaded without a vector get one lazily.
                let owned;
                let vector = match vectors.get(&item.id) {
                    Some(v) => v.as_slice(),
                    None => {
                        owned = self.embedder.embed(&item.content);
                        owned.as_slice()
                    }
                };
                ScoredItem {
                    score: retrieval::score(item, vector, &query_vector, query, now),
                    item: item.clone(),
                }
            })
            .collect();

        scored.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(limit);
        scored
    }

    /// Drop orphan connections and vectors for missing items; persist.
    ///
    /// Returns the number of repairs (edges pruned + vectors dropped).
    pub fn maintenance(&self) -> usize {
        let mut cleaned = 0;

        {
            let mut items = self.items.write();
            let live: std::collections::HashSet<String> = items.keys().cloned().collect();
            for item in items.values_mut() {
                let before = item.connections.len();
                item.connections.retain(|c| live.contains(c));
                cleaned += before - item.connections.len();
            }
        }

        {
            let items = self.items.read();
            let mut vectors = self.vectors.write();
            let stale: Vec<String> = vectors
                .keys()
                .filter(|id| !items.contains_key(*id))
                .cloned()
                .collect();
            for id in stale {
                vectors.remove(&id);
                if let Some(ref dir) = self.data_dir {
                    let _ = std::fs::remove_file(dir.join("vectors").join(&id));
                    let _ = std::fs::remove_file(dir.join("memory").join(&id));
                }
                cleaned += 1;
            }
        }

        // Stray vector files with no live item.
        if let Some(ref dir) = self.data_dir {
            let items = self.items.read();
            let vectors_dir = dir.join("vectors");
            if let Ok(entries) = std::fs::read_dir(&vectors_dir) {
                for entry in entries.flatten() {
                    let name = entry.file_name().to_string_lossy().to_string();
                    if name != "vectors.json" && !items.contains_key(&name) {
                        if std::fs::remove_file(entry.path()).is_ok() {
                            cleaned += 1;
                        }
                    }
                }
            }
        }

        self.persist_masters();
        cleaned
    }

    /// Entry counts for the stats resource.
    pub fn stats(&self) -> MemoryStats {
        let items = self.items.read();
        let mut by_type: HashMap<String, usize> = HashMap::new();
        for item in items.values() {
            *by_type.entry(item.kind.as_str().to_string()).or_default() += 1;
        }
        MemoryStats {
            total: items.len(),
            by_type,
        }
    }

    /// Number of stored items.
    pub fn len(&self) -> usize {
        self.items.read().len()
    }

    /// Whether the store is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    // ---- persistence ----

    fn load(&self) -> Result<()> {
        let Some(ref dir) = self.data_dir else {
            return Ok(());
        };

        let master = dir.join("memory.json");
        if master.exists() {
            let raw = std::fs::read(&master)?;
            let list: Vec<MemoryItem> = serde_json::from_slice(&raw)?;
            let mut items = self.items.write();
            for item in list {
                items.insert(item.id.clone(), item);
            }
        }

        let vector_master = dir.join("vectors").join("vectors.json");
        if vector_master.exists() {
            let raw = std::fs::read(&vector_master)?;
            let list: Vec<MemoryVector> = serde_json::from_slice(&raw)?;
            let mut vectors = self.vectors.write();
            for v in list {
                vectors.insert(v.item_id.clone(), v.vector);
            }
        }
        Ok(())
    }

    fn persist_item(&self, item: &MemoryItem, vector: &[f32]) {
        if !self.disk_enabled() {
            return;
        }
        let Some(ref dir) = self.data_dir else { return };
        let result = (|| -> Result<()> {
            let memory_dir = dir.join("memory");
            let vectors_dir = dir.join("vectors");
            std::fs::create_dir_all(&memory_dir)?;
            std::fs::create_dir_all(&vectors_dir)?;
            std::fs::write(memory_dir.join(&item.id), serde_json::to_vec_pretty(item)?)?;
            let mv = MemoryVector {
                item_id: item.id.clone(),
                vector: vector.to_vec(),
                created: item.created,
            };
            std::fs::write(vectors_dir.join(&item.id), serde_json::to_vec(&mv)?)?;
            Ok(())
        })();
        self.note_disk(result);
    }

    /// Rewrite both master files atomically (write-to-temp + rename).
    fn persist_masters(&self) {
        if !self.disk_enabled() {
            return;
        }
        let Some(ref dir) = self.data_dir else { return };
        let result = (|| -> Result<()> {
            std::fs::create_dir_all(dir.join("vectors"))?;
            let items: Vec<MemoryItem> = self.items.read().values().cloned().collect();
            write_atomic(&dir.join("memory.json"), &serde_json::to_vec_pretty(&items)?)?;

            let vectors: Vec<MemoryVector> = {
                let items = self.items.read();
                let vectors = self.vectors.read();
                vectors
                    .iter()
                    .map(|(id, v)| MemoryVector {
                        item_id: id.clone(),
                        vector: v.clone(),
                        created: items.get(id).map(|i| i.created).unwrap_or_else(Utc::now),
                    })
                    .collect()
            };
            write_atomic(
                &dir.join("vectors").join("vectors.json"),
                &serde_json::to_vec(&vectors)?,
            )?;
            Ok(())
        })();
        self.note_disk(result);
    }

    fn disk_enabled(&self) -> bool {
        self.data_dir.is_some() && self.disk_ok.load(Ordering::Relaxed)
    }

    fn note_disk(&self, result: Result<()>) {
        if let Err(e) = result {
            if self.disk_ok.swap(false, Ordering::Relaxed) {
                tracing::warn!(error = %e, "memory store disk write failed; continuing memory-only");
            }
        }
    }
}

/// Write `body` to `path` via a temp file and rename.
fn write_atomic(path: &Path, body: &[u8]) -> Result<()> {
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, body)?;
    std::fs::rename(&tmp, path)
        .map_err(|e| ProcessorError::Persistence(format!("rename {}: {}", path.display(), e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> MemoryStore {
        MemoryStore::in_memory(Arc::new(HashEmbedder::default()))
    }

    #[test]
    fn test_store_assigns_id_and_kind() {
        let s = store();
        let id = s
            .store(MemoryKind::Semantic, "a fact", 0.5, BTreeSet::new())
            .unwrap();
        let item = s.get_by_id(&id).unwrap();
        assert_eq!(item.kind, MemoryKind::Semantic);
        assert_eq!(item.content, "a fact");
        assert_eq!(s.len(), 1);
    }

    #[test]
    fn test_empty_content_rejected() {
        let s = store();
        assert!(s
            .store(MemoryKind::Working, "  ", 0.5, BTreeSet::new())
            .is_err());
    }

    #[test]
    fn test_importance_clamped() {
        let s = store();
        let id = s
            .store(MemoryKind::Working, "x", 7.5, BTreeSet::new())
            .unwrap();
        assert_eq!(s.get_by_id(&id).unwrap().importance, 1.0);
    }

    #[test]
    fn test_get_by_type_filters() {
        let s = store();
        s.store(MemoryKind::Working, "w", 0.5, BTreeSet::new()).unwrap();
        s.store(MemoryKind::Episodic, "e", 0.5, BTreeSet::new()).unwrap();
        s.store(MemoryKind::Episodic, "e2", 0.5, BTreeSet::new()).unwrap();
        assert_eq!(s.get_by_type(MemoryKind::Episodic).len(), 2);
        assert_eq!(s.get_by_type(MemoryKind::Procedural).len(), 0);
    }

    #[test]
    fn test_connections_dropped_when_unresolvable() {
        let s = store();
        let a = s.store(MemoryKind::Semantic, "a", 0.5, BTreeSet::new()).unwrap();
        let b = s
            .store(
                MemoryKind::Semantic,
                "b",
                0.5,
                BTreeSet::from([a.clone(), "ghost".to_string()]),
            )
            .unwrap();
        let item = s.get_by_id(&b).unwrap();
        assert_eq!(item.connections, BTreeSet::from([a.clone()]));

        s.update_connections(&b, BTreeSet::from(["another-ghost".to_string()]))
            .unwrap();
        assert!(s.get_by_id(&b).unwrap().connections.is_empty());
    }

    #[test]
    fn test_get_connected_resolves() {
        let s = store();
        let a = s.store(MemoryKind::Semantic, "a", 0.5, BTreeSet::new()).unwrap();
        let b = s
            .store(MemoryKind::Semantic, "b", 0.5, BTreeSet::from([a.clone()]))
            .unwrap();
        let connected = s.get_connected(&b);
        assert_eq!(connected.len(), 1);
        assert_eq!(connected[0].id, a);
    }

    #[test]
    fn test_cyclic_connections_permitted() {
        let s = store();
        let a = s.store(MemoryKind::Semantic, "a", 0.5, BTreeSet::new()).unwrap();
        let b = s
            .store(MemoryKind::Semantic, "b", 0.5, BTreeSet::from([a.clone()]))
            .unwrap();
        s.update_connections(&a, BTreeSet::from([b.clone()])).unwrap();
        assert_eq!(s.get_connected(&a)[0].id, b);
        assert_eq!(s.get_connected(&b)[0].id, a);
    }

    #[test]
    fn test_exact_content_query_is_top_hit() {
        let s = store();
        s.store(MemoryKind::Semantic, "completely unrelated", 0.5, BTreeSet::new())
            .unwrap();
        let target = s
            .store(
                MemoryKind::Semantic,
                "the exact content being sought",
                0.5,
                BTreeSet::new(),
            )
            .unwrap();
        s.store(MemoryKind::Semantic, "another distractor entry", 0.5, BTreeSet::new())
            .unwrap();

        let results = s.retrieve("the exact content being sought", 3);
        assert_eq!(results[0].item.id, target);
        assert!(results[0].score > results[1].score);
    }

    /// Ranking scenario with a controlled embedder: the sorting items
    /// must outrank the graph item for a sorting query, with the
    /// closest-vector item first.
    #[test]
    fn test_topical_ranking() {
        struct TopicEmbedder;
        impl Embedder for TopicEmbedder {
            fn embed(&self, text: &str) -> Vec<f32> {
                let t = text.to_lowercase();
                let mut v = if t.contains("quicksort") || t.contains("efficient") {
                    vec![1.0, 0.0, 0.0]
                } else if t.contains("bubble") {
                    vec![0.7, 0.7, 0.0]
                } else {
                    vec![0.0, 0.0, 1.0]
                };
                embedding::normalize(&mut v);
                v
            }
            fn dimensions(&self) -> usize {
                3
            }
        }

        let s = MemoryStore::in_memory(Arc::new(TopicEmbedder));
        let quick = s
            .store(MemoryKind::Semantic, "quicksort is O(n log n)", 0.5, BTreeSet::new())
            .unwrap();
        s.store(MemoryKind::Semantic, "bubble sort is O(n^2)", 0.5, BTreeSet::new())
            .unwrap();
        let graph = s
            .store(
                MemoryKind::Semantic,
                "graphs can be traversed with BFS",
                0.5,
                BTreeSet::new(),
            )
            .unwrap();

        let results = s.retrieve("efficient sort complexity", 3);
        assert_eq!(results[0].item.id, quick);
        assert_eq!(results[2].item.id, graph);
    }

    #[test]
    fn test_retrieve_respects_limit() {
        let s = store();
        for i in 0..5 {
            s.store(MemoryKind::Semantic, format!("item {}", i), 0.5, BTreeSet::new())
                .unwrap();
        }
        assert_eq!(s.retrieve("item", 2).len(), 2);
    }

    #[test]
    fn test_persistence_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let embedder: Arc<dyn Embedder> = Arc::new(HashEmbedder::default());
        let id = {
            let s = MemoryStore::open(Arc::clone(&embedder), dir.path().to_path_buf()).unwrap();
            s.store(MemoryKind::Procedural, "how to sort", 0.8, BTreeSet::new())
                .unwrap()
        };

        assert!(dir.path().join("memory.json").exists());
        assert!(dir.path().join("memory").join(&id).exists());
        assert!(dir.path().join("vectors").join(&id).exists());
        assert!(dir.path().join("vectors").join("vectors.json").exists());

        let reloaded = MemoryStore::open(embedder, dir.path().to_path_buf()).unwrap();
        let item = reloaded.get_by_id(&id).unwrap();
        assert_eq!(item.content, "how to sort");
        assert_eq!(item.kind, MemoryKind::Procedural);
        // Vector came back too: exact-content retrieval still ranks first.
        assert_eq!(reloaded.retrieve("how to sort", 1)[0].item.id, id);
    }

    #[test]
    fn test_maintenance_prunes_orphans_and_stray_vectors() {
        let dir = tempfile::tempdir().unwrap();
        let s = MemoryStore::open(Arc::new(HashEmbedder::default()), dir.path().to_path_buf())
            .unwrap();
        let a = s.store(MemoryKind::Semantic, "a", 0.5, BTreeSet::new()).unwrap();
        let b = s
            .store(MemoryKind::Semantic, "b", 0.5, BTreeSet::from([a.clone()]))
            .unwrap();

        // Simulate a lost item: drop it from the maps behind the store's back.
        s.items.write().remove(&a);

        let cleaned = s.maintenance();
        // One pruned edge on b, one stale vector for a.
        assert!(cleaned >= 2);
        assert!(s.get_by_id(&b).unwrap().connections.is_empty());
        assert!(!dir.path().join("vectors").join(&a).exists());
    }

    #[test]
    fn test_stats_by_type() {
        let s = store();
        s.store(MemoryKind::Working, "w", 0.5, BTreeSet::new()).unwrap();
        s.store(MemoryKind::Working, "w2", 0.5, BTreeSet::new()).unwrap();
        s.store(MemoryKind::Semantic, "s", 0.5, BTreeSet::new()).unwrap();
        let stats = s.stats();
        assert_eq!(stats.total, 3);
        assert_eq!(stats.by_type["working"], 2);
        assert_eq!(stats.by_type["semantic"], 1);
    }

    #[test]
    fn test_kind_parse_round_trip() {
        for kind in [
            MemoryKind::Working,
            MemoryKind::Episodic,
            MemoryKind::Semantic,
            MemoryKind::Procedural,
        ] {
            assert_eq!(MemoryKind::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(MemoryKind::parse("bogus"), None);
    }
}
