//! File-backed repositories.
//! One `Repository<R>` per record file. Each language pair is loaded into its
//! own in-memory index on first touch and persisted by rewriting the whole
//! pair file atomically after every write.

pub mod normalize;
pub mod record;
pub mod user;

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::cache::CacheManager;
use crate::config::HistorySection;
use crate::error::{RepositoryResult, ValidationError};
use crate::memory::{MemoryManaged, MemoryManager};
use crate::storage::Storage;
use normalize::{is_valid_language_pair, lookup_keys};
use record::{
    now_millis, AsRule, DictionaryEntry, GrammarRule, PhraseEntry, PostProcessingRule, Record,
    WordOrderRule,
};
use user::UserDataRepository;

#[derive(Debug, Clone)]
struct Slot<R> {
    id: u64,
    record: R,
}

/// Canonical key → record for one language pair, with a monotonic id counter.
#[derive(Debug, Clone)]
struct LanguagePairIndex<R> {
    entries: HashMap<String, Slot<R>>,
    next_id: u64,
    bytes: usize,
}

impl<R: Record> LanguagePairIndex<R> {
    fn new() -> Self {
        Self {
            entries: HashMap::new(),
            next_id: 1,
            bytes: 0,
        }
    }

    /// Insert or merge. Returns true if the key was new.
    fn upsert(&mut self, record: R) -> bool {
        let key = record.key();
        match self.entries.get_mut(&key) {
            Some(slot) => {
                self.bytes -= slot.record.estimated_size();
                slot.record.merge(record);
                self.bytes += slot.record.estimated_size();
                false
            }
            None => {
                self.bytes += record.estimated_size();
                let id = self.next_id;
                self.next_id += 1;
                self.entries.insert(key, Slot { id, record });
                true
            }
        }
    }

    /// Loader path: later lines replace earlier ones with the same key.
    fn replace(&mut self, record: R) {
        let key = record.key();
        self.bytes += record.estimated_size();
        match self.entries.get_mut(&key) {
            Some(slot) => {
                self.bytes -= slot.record.estimated_size();
                slot.record = record;
            }
            None => {
                let id = self.next_id;
                self.next_id += 1;
                self.entries.insert(key, Slot { id, record });
            }
        }
    }

    fn remove(&mut self, key: &str) -> Option<R> {
        let slot = self.entries.remove(key)?;
        self.bytes -= slot.record.estimated_size();
        Some(slot.record)
    }

    /// Records in insertion order.
    fn ordered(&self) -> Vec<R> {
        let mut slots: Vec<&Slot<R>> = self.entries.values().collect();
        slots.sort_by_key(|s| s.id);
        slots.into_iter().map(|s| s.record.clone()).collect()
    }
}

/// Result of a lookup, with whether it was served from cache.
#[derive(Debug, Clone)]
pub struct Lookup<R> {
    pub record: Option<R>,
    pub cache_hit: bool,
}

fn check_pair(language_pair: &str) -> Result<(), ValidationError> {
    if is_valid_language_pair(language_pair) {
        Ok(())
    } else {
        Err(ValidationError::new(
            "language_pair",
            format!("`{language_pair}` does not match ^[a-z]{{2}}-[a-z]{{2}}$"),
        ))
    }
}

/// Lazily loaded, atomically persisted store for one record file.
pub struct Repository<R: Record> {
    storage: Storage,
    indexes: RwLock<HashMap<String, LanguagePairIndex<R>>>,
    // one writer at a time; readers are never blocked by disk I/O
    write_gate: Mutex<()>,
    memory: Option<Arc<MemoryManager>>,
    cache: Option<Arc<CacheManager>>,
}

impl<R: Record> Repository<R> {
    /// Build the repository and register it with the memory manager.
    pub fn open(
        storage: Storage,
        memory: Option<Arc<MemoryManager>>,
        cache: Option<Arc<CacheManager>>,
    ) -> Arc<Self> {
        let repo = Arc::new(Self {
            storage,
            indexes: RwLock::new(HashMap::new()),
            write_gate: Mutex::new(()),
            memory,
            cache,
        });
        if let Some(memory) = &repo.memory {
            let weak: Weak<dyn MemoryManaged> = Arc::downgrade(&repo) as Weak<dyn MemoryManaged>;
            memory.register_repository(R::KIND, weak);
        }
        repo
    }

    pub fn name(&self) -> &'static str {
        R::KIND
    }

    fn cache_key(language_pair: &str, key: &str) -> String {
        format!("{language_pair}:{key}")
    }

    fn load_index(&self, language_pair: &str) -> RepositoryResult<LanguagePairIndex<R>> {
        let path = self.storage.pair_file(language_pair, R::FILE_NAME);
        let load = self.storage.read_jsonl::<R>(&path)?;
        let now = now_millis();
        let mut index = LanguagePairIndex::new();
        let mut rejected = 0usize;
        for mut record in load.records {
            if record.language_pair() != language_pair || record.validate().is_err() {
                rejected += 1;
                continue;
            }
            record.normalize(now);
            index.replace(record);
        }
        if rejected > 0 {
            warn!(repository = R::KIND, language_pair, rejected, "invalid records skipped at load");
        }
        info!(
            repository = R::KIND,
            language_pair,
            entries = index.entries.len(),
            skipped = load.skipped + rejected,
            "language_pair_loaded"
        );
        Ok(index)
    }

    fn touch(&self, language_pair: &str) {
        if let Some(memory) = &self.memory {
            memory.touch_language_pair(R::KIND, language_pair);
        }
    }

    /// Load the pair's file on first touch, then record the access.
    pub fn ensure_loaded(&self, language_pair: &str) -> RepositoryResult<()> {
        check_pair(language_pair)?;
        if !self.indexes.read().contains_key(language_pair) {
            let index = self.load_index(language_pair)?;
            self.indexes
                .write()
                .entry(language_pair.to_string())
                .or_insert(index);
        }
        // never while holding `indexes`: eviction calls back into unload
        self.touch(language_pair);
        Ok(())
    }

    pub fn is_loaded(&self, language_pair: &str) -> bool {
        self.indexes.read().contains_key(language_pair)
    }

    pub fn loaded_language_pairs(&self) -> Vec<String> {
        let mut pairs: Vec<String> = self.indexes.read().keys().cloned().collect();
        pairs.sort();
        pairs
    }

    /// Pairs whose file for this repository exists on disk.
    pub fn available_language_pairs(&self) -> Vec<String> {
        self.storage
            .language_pairs_on_disk()
            .into_iter()
            .filter(|pair| self.storage.pair_file(pair, R::FILE_NAME).exists())
            .collect()
    }

    pub fn get_translation(&self, text: &str, language_pair: &str) -> RepositoryResult<Option<R>> {
        Ok(self.lookup(text, language_pair)?.record)
    }

    /// Cache first, then the primary key, then (for phrases) the fallback keys.
    pub fn lookup(&self, text: &str, language_pair: &str) -> RepositoryResult<Lookup<R>> {
        let keys = lookup_keys(text, R::FALLBACK_KEYS);
        if keys[0].is_empty() {
            return Ok(Lookup {
                record: None,
                cache_hit: false,
            });
        }
        check_pair(language_pair)?;

        let cache = self.cache.as_deref().and_then(R::cache);
        let cache_key = Self::cache_key(language_pair, &keys[0]);
        if let Some(hit) = cache.and_then(|c| c.get(&cache_key)) {
            // keep the pair's recency current while the cache serves it
            if self.is_loaded(language_pair) {
                self.touch(language_pair);
            }
            return Ok(Lookup {
                record: Some(hit),
                cache_hit: true,
            });
        }

        self.ensure_loaded(language_pair)?;
        let found = {
            let indexes = self.indexes.read();
            indexes.get(language_pair).and_then(|index| {
                keys.iter()
                    .find_map(|key| index.entries.get(key))
                    .map(|slot| slot.record.clone())
            })
        };

        if let (Some(cache), Some(record)) = (cache, &found) {
            cache.set(cache_key, record.clone());
        }
        Ok(Lookup {
            record: found,
            cache_hit: false,
        })
    }

    /// Validate every record, then normalize, merge, and persist each touched pair.
    /// Nothing is written if any record fails validation or any pair fails to
    /// load or stage. Every pair file is staged before the first rename, so
    /// only a failing rename can leave earlier pairs committed.
    pub fn bulk_upsert(&self, records: Vec<R>) -> RepositoryResult<usize> {
        for record in &records {
            record.validate()?;
        }
        let now = now_millis();
        let total = records.len();
        let mut by_pair: BTreeMap<String, Vec<R>> = BTreeMap::new();
        for mut record in records {
            record.normalize(now);
            by_pair
                .entry(record.language_pair().to_string())
                .or_default()
                .push(record);
        }

        let _gate = self.write_gate.lock();
        let mut staged = Vec::with_capacity(by_pair.len());
        for (language_pair, batch) in by_pair {
            let keys: Vec<String> = batch.iter().map(|r| r.key()).collect();
            let mut index = self.working_copy(&language_pair)?;
            let mut inserted = 0usize;
            for record in batch {
                if index.upsert(record) {
                    inserted += 1;
                }
            }
            let path = self.storage.pair_file(&language_pair, R::FILE_NAME);
            let pending = self.storage.stage_jsonl(&path, &index.ordered())?;
            staged.push((language_pair, keys, inserted, index, pending));
        }

        for (language_pair, keys, inserted, index, pending) in staged {
            pending.commit()?;
            self.install(&language_pair, index);
            self.invalidate(&language_pair, &keys);
            debug!(
                repository = R::KIND,
                language_pair = %language_pair,
                inserted,
                merged = keys.len() - inserted,
                "bulk_upsert"
            );
        }
        Ok(total)
    }

    /// Upsert one record and return the stored (merged) value.
    pub fn upsert(&self, record: R) -> RepositoryResult<R> {
        let language_pair = record.language_pair().to_string();
        let key = R::key_for(record.source());
        self.bulk_upsert(vec![record])?;
        self.ensure_loaded(&language_pair)?;
        let stored = self
            .indexes
            .read()
            .get(&language_pair)
            .and_then(|index| index.entries.get(&key))
            .map(|slot| slot.record.clone());
        match stored {
            Some(record) => Ok(record),
            // evicted between write and read: the file is authoritative
            None => Ok(self
                .load_index(&language_pair)?
                .entries
                .remove(&key)
                .map(|slot| slot.record)
                .ok_or_else(|| ValidationError::new("source", "record vanished after upsert"))?),
        }
    }

    /// Remove by source text. Returns whether anything was removed.
    pub fn remove(&self, source: &str, language_pair: &str) -> RepositoryResult<bool> {
        check_pair(language_pair)?;
        let key = R::key_for(source);
        let _gate = self.write_gate.lock();
        let mut index = self.working_copy(language_pair)?;
        if index.remove(&key).is_none() {
            return Ok(false);
        }
        self.commit(language_pair, index)?;
        self.invalidate(language_pair, std::slice::from_ref(&key));
        debug!(repository = R::KIND, language_pair, key = %key, "record_removed");
        Ok(true)
    }

    /// Delete the pair's file and drop its index.
    pub fn clear_language_pair(&self, language_pair: &str) -> RepositoryResult<()> {
        check_pair(language_pair)?;
        let _gate = self.write_gate.lock();
        self.storage
            .remove(&self.storage.pair_file(language_pair, R::FILE_NAME))?;
        self.indexes.write().remove(language_pair);
        if let Some(memory) = &self.memory {
            memory.untrack(R::KIND, language_pair);
        }
        self.invalidate_pair(language_pair);
        info!(repository = R::KIND, language_pair, "language_pair_cleared");
        Ok(())
    }

    /// Records for a pair in insertion order.
    pub fn all_entries(&self, language_pair: &str) -> RepositoryResult<Vec<R>> {
        self.ensure_loaded(language_pair)?;
        Ok(self
            .indexes
            .read()
            .get(language_pair)
            .map(LanguagePairIndex::ordered)
            .unwrap_or_default())
    }

    pub fn count(&self, language_pair: &str) -> RepositoryResult<usize> {
        self.ensure_loaded(language_pair)?;
        Ok(self
            .indexes
            .read()
            .get(language_pair)
            .map(|index| index.entries.len())
            .unwrap_or(0))
    }

    /// Estimated bytes held for a loaded pair, 0 if not loaded.
    pub fn estimated_size(&self, language_pair: &str) -> usize {
        self.indexes
            .read()
            .get(language_pair)
            .map(|index| index.bytes)
            .unwrap_or(0)
    }

    /// Drop the pair's index and stop tracking it.
    pub fn unload(&self, language_pair: &str) {
        self.drop_index(language_pair);
        if let Some(memory) = &self.memory {
            memory.untrack(R::KIND, language_pair);
        }
    }

    pub fn unload_all(&self) {
        for pair in self.loaded_language_pairs() {
            self.unload(&pair);
        }
    }

    fn drop_index(&self, language_pair: &str) -> bool {
        let removed = self.indexes.write().remove(language_pair).is_some();
        if removed {
            debug!(repository = R::KIND, language_pair, "language_pair_unloaded");
        }
        removed
    }

    fn working_copy(&self, language_pair: &str) -> RepositoryResult<LanguagePairIndex<R>> {
        if let Some(index) = self.indexes.read().get(language_pair) {
            return Ok(index.clone());
        }
        self.load_index(language_pair)
    }

    /// Persist first; the in-memory index is replaced only after the rename.
    fn commit(&self, language_pair: &str, index: LanguagePairIndex<R>) -> RepositoryResult<()> {
        let path = self.storage.pair_file(language_pair, R::FILE_NAME);
        self.storage.write_jsonl(&path, &index.ordered())?;
        self.install(language_pair, index);
        Ok(())
    }

    /// Swap in an index whose file is already on disk.
    fn install(&self, language_pair: &str, index: LanguagePairIndex<R>) {
        self.indexes.write().insert(language_pair.to_string(), index);
        self.touch(language_pair);
        if let Some(memory) = &self.memory {
            memory.refresh_size(R::KIND, language_pair);
        }
    }

    fn invalidate(&self, language_pair: &str, keys: &[String]) {
        let Some(cache) = self.cache.as_deref().and_then(R::cache) else {
            return;
        };
        if R::FALLBACK_KEYS {
            // fallback hits are cached under the caller's key, which a write can't enumerate
            self.invalidate_pair(language_pair);
            return;
        }
        for key in keys {
            cache.remove(&Self::cache_key(language_pair, key));
        }
    }

    fn invalidate_pair(&self, language_pair: &str) {
        if let Some(cache) = self.cache.as_deref().and_then(R::cache) {
            let prefix = format!("{language_pair}:");
            cache.remove_where(|k| k.starts_with(&prefix));
        }
    }
}

impl<R: Record + AsRule> Repository<R> {
    /// Enabled rules ordered by ascending priority, then insertion order.
    pub fn rules(&self, language_pair: &str) -> RepositoryResult<Vec<R>> {
        let mut rules: Vec<R> = self
            .all_entries(language_pair)?
            .into_iter()
            .filter(|r| r.rule().enabled)
            .collect();
        // stable sort keeps insertion order among equal priorities
        rules.sort_by_key(|r| r.rule().priority);
        Ok(rules)
    }
}

impl<R: Record> MemoryManaged for Repository<R> {
    fn estimate_size(&self, language_pair: &str) -> usize {
        self.estimated_size(language_pair)
    }

    fn unload_language_pair(&self, language_pair: &str) {
        self.drop_index(language_pair);
    }
}

/// Loaded-state summary for one repository.
#[derive(Debug, Clone, Serialize)]
pub struct RepositoryStatus {
    pub name: &'static str,
    pub loaded_pairs: Vec<String>,
    pub estimated_bytes: usize,
}

/// Every repository over one data directory.
pub struct Repositories {
    pub dictionary: Arc<Repository<DictionaryEntry>>,
    pub phrases: Arc<Repository<PhraseEntry>>,
    pub grammar: Arc<Repository<GrammarRule>>,
    pub word_order: Arc<Repository<WordOrderRule>>,
    pub post_processing: Arc<Repository<PostProcessingRule>>,
    pub user: Arc<UserDataRepository>,
}

impl Repositories {
    pub fn open(
        storage: &Storage,
        memory: Option<Arc<MemoryManager>>,
        cache: Option<Arc<CacheManager>>,
        history: &HistorySection,
    ) -> Self {
        Self {
            dictionary: Repository::open(storage.clone(), memory.clone(), cache.clone()),
            phrases: Repository::open(storage.clone(), memory.clone(), cache.clone()),
            grammar: Repository::open(storage.clone(), memory.clone(), cache.clone()),
            word_order: Repository::open(storage.clone(), memory.clone(), cache.clone()),
            post_processing: Repository::open(storage.clone(), memory, cache),
            user: Arc::new(UserDataRepository::new(storage.clone(), history.max_entries)),
        }
    }

    pub fn status(&self) -> Vec<RepositoryStatus> {
        fn status_of<R: Record>(repo: &Repository<R>) -> RepositoryStatus {
            let loaded_pairs = repo.loaded_language_pairs();
            let estimated_bytes = loaded_pairs.iter().map(|p| repo.estimated_size(p)).sum();
            RepositoryStatus {
                name: repo.name(),
                loaded_pairs,
                estimated_bytes,
            }
        }
        vec![
            status_of(&self.dictionary),
            status_of(&self.phrases),
            status_of(&self.grammar),
            status_of(&self.word_order),
            status_of(&self.post_processing),
        ]
    }

    pub fn unload_all(&self) {
        self.dictionary.unload_all();
        self.phrases.unload_all();
        self.grammar.unload_all();
        self.word_order.unload_all();
        self.post_processing.unload_all();
    }
}
