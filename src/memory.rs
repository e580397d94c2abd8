//! Cross-repository memory budget.
//! Tracks every loaded (repository, language pair) index with its estimated
//! size and recency. When aggregate bytes or loaded-pair count crosses
//! `limit × eviction_threshold`, least-recently-used pairs are unloaded via the
//! owning repository until both fall to 60% of their limit.
//! Eviction runs synchronously on the caller of `touch_language_pair`.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Weak;
use std::time::Instant;

use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::MemorySection;

/// Usage falls back to this fraction of each limit after an eviction pass.
pub const EVICTION_TARGET_RATIO: f64 = 0.6;

/// Implemented by repositories whose per-pair indexes can be dropped.
pub trait MemoryManaged: Send + Sync {
    /// Estimated bytes held by the loaded index for `language_pair`.
    fn estimate_size(&self, language_pair: &str) -> usize;

    /// Drop the in-memory index for `language_pair`. Must not call back into
    /// the memory manager.
    fn unload_language_pair(&self, language_pair: &str);
}

type PairKey = (String, String);

#[derive(Debug, Clone)]
struct PairMeta {
    last_access: Instant,
    access_seq: u64,
    estimated_bytes: usize,
    access_count: u64,
}

/// Reporting view of one tracked index.
#[derive(Debug, Clone, Serialize)]
pub struct LanguagePairMetadata {
    pub repository: String,
    pub language_pair: String,
    pub estimated_bytes: usize,
    pub access_count: u64,
    pub idle_ms: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct MemoryUsage {
    pub enabled: bool,
    pub total_bytes: usize,
    pub loaded_pairs: usize,
    pub max_memory_bytes: u64,
    pub max_language_pairs: usize,
    pub eviction_threshold: f64,
    pub evictions: u64,
    pub pairs: Vec<LanguagePairMetadata>,
}

#[derive(Debug, Clone, Copy)]
pub struct MemoryLimits {
    pub max_memory_bytes: u64,
    pub max_language_pairs: usize,
    pub eviction_threshold: f64,
}

impl From<&MemorySection> for MemoryLimits {
    fn from(section: &MemorySection) -> Self {
        Self {
            max_memory_bytes: section.max_memory_bytes(),
            max_language_pairs: section.max_language_pairs,
            eviction_threshold: section.eviction_threshold,
        }
    }
}

#[derive(Default)]
struct State {
    tracked: HashMap<PairKey, PairMeta>,
    repositories: HashMap<String, Weak<dyn MemoryManaged>>,
    unloading: HashSet<PairKey>,
    next_seq: u64,
    evictions: u64,
}

impl State {
    fn totals(&self) -> (usize, usize) {
        let bytes = self.tracked.values().map(|m| m.estimated_bytes).sum();
        (bytes, self.tracked.len())
    }
}

pub struct MemoryManager {
    enabled: bool,
    limits: Mutex<MemoryLimits>,
    state: Mutex<State>,
    disposed: AtomicBool,
}

impl MemoryManager {
    pub fn new(enabled: bool, limits: MemoryLimits) -> Self {
        Self {
            enabled,
            limits: Mutex::new(limits),
            state: Mutex::new(State::default()),
            disposed: AtomicBool::new(false),
        }
    }

    pub fn from_config(section: &MemorySection) -> Self {
        Self::new(section.enabled, MemoryLimits::from(section))
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled && !self.disposed.load(Ordering::Acquire)
    }

    pub fn configure(&self, limits: MemoryLimits) {
        *self.limits.lock() = limits;
        self.check_eviction(None);
    }

    /// Register the unload/estimate callbacks for a repository name.
    pub fn register_repository(&self, name: &str, repository: Weak<dyn MemoryManaged>) {
        self.state
            .lock()
            .repositories
            .insert(name.to_string(), repository);
    }

    /// Record an access to a loaded index, creating its record on first touch,
    /// then run an eviction check. The touched pair itself is never a candidate.
    pub fn touch_language_pair(&self, repository: &str, language_pair: &str) {
        if !self.is_enabled() {
            return;
        }
        let key: PairKey = (repository.to_string(), language_pair.to_string());

        let needs_estimate = {
            let mut state = self.state.lock();
            state.next_seq += 1;
            let seq = state.next_seq;
            match state.tracked.get_mut(&key) {
                Some(meta) => {
                    meta.last_access = Instant::now();
                    meta.access_seq = seq;
                    meta.access_count += 1;
                    None
                }
                None => Some((seq, state.repositories.get(repository).cloned())),
            }
        };

        if let Some((seq, repo)) = needs_estimate {
            let estimated_bytes = repo
                .and_then(|weak| weak.upgrade())
                .map(|repo| repo.estimate_size(language_pair))
                .unwrap_or(0);
            let mut state = self.state.lock();
            let meta = state.tracked.entry(key.clone()).or_insert(PairMeta {
                last_access: Instant::now(),
                access_seq: seq,
                estimated_bytes,
                access_count: 0,
            });
            meta.access_count += 1;
            debug!(repository, language_pair, estimated_bytes, "language_pair_tracked");
        }

        self.check_eviction(Some(&key));
    }

    /// Re-query the estimator after the index changed size.
    pub fn refresh_size(&self, repository: &str, language_pair: &str) {
        if !self.is_enabled() {
            return;
        }
        let key: PairKey = (repository.to_string(), language_pair.to_string());
        let repo = {
            let state = self.state.lock();
            if !state.tracked.contains_key(&key) {
                return;
            }
            state.repositories.get(repository).cloned()
        };
        let Some(estimated_bytes) = repo
            .and_then(|weak| weak.upgrade())
            .map(|repo| repo.estimate_size(language_pair))
        else {
            return;
        };
        if let Some(meta) = self.state.lock().tracked.get_mut(&key) {
            meta.estimated_bytes = estimated_bytes;
        }
        self.check_eviction(Some(&key));
    }

    /// Forget a pair the repository unloaded on its own.
    pub fn untrack(&self, repository: &str, language_pair: &str) {
        self.state
            .lock()
            .tracked
            .remove(&(repository.to_string(), language_pair.to_string()));
    }

    /// Trigger check and LRU eviction down to 60% of each limit.
    fn check_eviction(&self, protect: Option<&PairKey>) {
        let limits = *self.limits.lock();
        let byte_trigger = limits.max_memory_bytes as f64 * limits.eviction_threshold;
        let pair_trigger = limits.max_language_pairs as f64 * limits.eviction_threshold;
        let byte_target = limits.max_memory_bytes as f64 * EVICTION_TARGET_RATIO;
        let pair_target = limits.max_language_pairs as f64 * EVICTION_TARGET_RATIO;

        let victims: Vec<(PairKey, Option<Weak<dyn MemoryManaged>>)> = {
            let mut state = self.state.lock();
            let (mut bytes, mut pairs) = state.totals();
            if (bytes as f64) <= byte_trigger && (pairs as f64) <= pair_trigger {
                return;
            }
            info!(bytes, pairs, byte_trigger, pair_trigger, "memory_eviction_triggered");

            let mut candidates: Vec<(&PairKey, &PairMeta)> = state
                .tracked
                .iter()
                .filter(|(k, _)| Some(*k) != protect && !state.unloading.contains(*k))
                .collect();
            candidates.sort_by_key(|(_, m)| m.access_seq);

            let mut chosen = Vec::new();
            for (key, meta) in candidates {
                if (bytes as f64) <= byte_target && (pairs as f64) <= pair_target {
                    break;
                }
                bytes = bytes.saturating_sub(meta.estimated_bytes);
                pairs -= 1;
                chosen.push(key.clone());
            }

            chosen
                .into_iter()
                .map(|key| {
                    // untracked before the callback: a reload racing the unload re-tracks cleanly
                    state.tracked.remove(&key);
                    state.unloading.insert(key.clone());
                    let repo = state.repositories.get(&key.0).cloned();
                    (key, repo)
                })
                .collect()
        };

        for (key, repo) in victims {
            self.unload_key(&key, repo);
        }
    }

    fn unload_key(&self, key: &PairKey, repo: Option<Weak<dyn MemoryManaged>>) {
        match repo.and_then(|weak| weak.upgrade()) {
            Some(repo) => repo.unload_language_pair(&key.1),
            None => warn!(repository = %key.0, "unload target dropped, forgetting pair"),
        }
        let mut state = self.state.lock();
        state.unloading.remove(key);
        state.evictions += 1;
        info!(repository = %key.0, language_pair = %key.1, "language_pair_evicted");
    }

    /// Unload every tracked pair through its repository.
    pub fn clear_all(&self) {
        let victims: Vec<(PairKey, Option<Weak<dyn MemoryManaged>>)> = {
            let mut state = self.state.lock();
            let keys: Vec<PairKey> = state
                .tracked
                .keys()
                .filter(|k| !state.unloading.contains(*k))
                .cloned()
                .collect();
            keys.into_iter()
                .map(|key| {
                    state.tracked.remove(&key);
                    state.unloading.insert(key.clone());
                    let repo = state.repositories.get(&key.0).cloned();
                    (key, repo)
                })
                .collect()
        };
        for (key, repo) in victims {
            self.unload_key(&key, repo);
        }
    }

    /// Drop all bookkeeping without invoking unload callbacks. Irreversible.
    pub fn dispose(&self) {
        self.disposed.store(true, Ordering::Release);
        let mut state = self.state.lock();
        state.tracked.clear();
        state.repositories.clear();
        state.unloading.clear();
    }

    pub fn is_tracked(&self, repository: &str, language_pair: &str) -> bool {
        self.state
            .lock()
            .tracked
            .contains_key(&(repository.to_string(), language_pair.to_string()))
    }

    pub fn usage(&self) -> MemoryUsage {
        let limits = *self.limits.lock();
        let state = self.state.lock();
        let (total_bytes, loaded_pairs) = state.totals();
        let mut pairs: Vec<LanguagePairMetadata> = state
            .tracked
            .iter()
            .map(|((repository, language_pair), meta)| LanguagePairMetadata {
                repository: repository.clone(),
                language_pair: language_pair.clone(),
                estimated_bytes: meta.estimated_bytes,
                access_count: meta.access_count,
                idle_ms: meta.last_access.elapsed().as_millis() as u64,
            })
            .collect();
        pairs.sort_by(|a, b| (&a.repository, &a.language_pair).cmp(&(&b.repository, &b.language_pair)));
        MemoryUsage {
            enabled: self.is_enabled(),
            total_bytes,
            loaded_pairs,
            max_memory_bytes: limits.max_memory_bytes,
            max_language_pairs: limits.max_language_pairs,
            eviction_threshold: limits.eviction_threshold,
            evictions: state.evictions,
            pairs,
        }
    }
}

impl std::fmt::Debug for MemoryManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let usage = self.usage();
        f.debug_struct("MemoryManager")
            .field("enabled", &usage.enabled)
            .field("total_bytes", &usage.total_bytes)
            .field("loaded_pairs", &usage.loaded_pairs)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    /// Fake repository: fixed size per pair, records unload calls.
    struct FakeRepo {
        sizes: HashMap<String, usize>,
        unloaded: Mutex<Vec<String>>,
    }

    impl FakeRepo {
        fn new(sizes: &[(&str, usize)]) -> Arc<Self> {
            Arc::new(Self {
                sizes: sizes.iter().map(|(p, s)| (p.to_string(), *s)).collect(),
                unloaded: Mutex::new(Vec::new()),
            })
        }
    }

    impl MemoryManaged for FakeRepo {
        fn estimate_size(&self, language_pair: &str) -> usize {
            self.sizes.get(language_pair).copied().unwrap_or(0)
        }

        fn unload_language_pair(&self, language_pair: &str) {
            self.unloaded.lock().push(language_pair.to_string());
        }
    }

    fn manager(max_bytes: u64, max_pairs: usize) -> MemoryManager {
        MemoryManager::new(
            true,
            MemoryLimits {
                max_memory_bytes: max_bytes,
                max_language_pairs: max_pairs,
                eviction_threshold: 0.8,
            },
        )
    }

    fn register(m: &MemoryManager, name: &str, repo: &Arc<FakeRepo>) {
        let weak: Weak<dyn MemoryManaged> = Arc::downgrade(repo) as Weak<dyn MemoryManaged>;
        m.register_repository(name, weak);
    }

    #[test]
    fn evicts_lru_until_sixty_percent_of_bytes() {
        let m = manager(1000, 100);
        let repo = FakeRepo::new(&[
            ("en-ru", 250),
            ("en-de", 250),
            ("en-fr", 250),
            ("en-es", 200),
        ]);
        register(&m, "dictionary", &repo);

        m.touch_language_pair("dictionary", "en-ru");
        m.touch_language_pair("dictionary", "en-de");
        m.touch_language_pair("dictionary", "en-fr");
        // 750 bytes: under the 800 trigger
        assert!(repo.unloaded.lock().is_empty());

        // re-touch en-ru so en-de becomes the least recently used
        m.touch_language_pair("dictionary", "en-ru");
        m.touch_language_pair("dictionary", "en-es");
        // 950 > 800 → unload en-de (700), en-fr (450) ≤ 600
        assert_eq!(*repo.unloaded.lock(), vec!["en-de", "en-fr"]);
        let usage = m.usage();
        assert_eq!(usage.total_bytes, 450);
        assert!(usage.total_bytes as f64 <= 600.0);
        assert_eq!(usage.evictions, 2);
        assert!(m.is_tracked("dictionary", "en-ru"));
        assert!(m.is_tracked("dictionary", "en-es"));
    }

    #[test]
    fn pair_count_limit_triggers_across_repositories() {
        let m = manager(u64::MAX / 2, 5);
        let dict = FakeRepo::new(&[("en-ru", 1), ("en-de", 1), ("en-fr", 1)]);
        let phrases = FakeRepo::new(&[("en-ru", 1), ("en-de", 1)]);
        register(&m, "dictionary", &dict);
        register(&m, "phrases", &phrases);

        m.touch_language_pair("dictionary", "en-ru");
        m.touch_language_pair("phrases", "en-ru");
        m.touch_language_pair("dictionary", "en-de");
        m.touch_language_pair("phrases", "en-de");
        // 4 pairs == 5 × 0.8: not over
        assert_eq!(m.usage().loaded_pairs, 4);

        m.touch_language_pair("dictionary", "en-fr");
        // 5 > 4 → unload down to 3 (= 5 × 0.6)
        assert_eq!(m.usage().loaded_pairs, 3);
        assert_eq!(*dict.unloaded.lock(), vec!["en-ru"]);
        assert_eq!(*phrases.unloaded.lock(), vec!["en-ru"]);
    }

    /// Reloads `pair` from inside its own unload, like a reader on another
    /// thread that calls `ensure_loaded` while the eviction is in progress.
    struct ReloadingRepo {
        pair: &'static str,
        manager: Mutex<Weak<MemoryManager>>,
        unloaded: Mutex<Vec<String>>,
    }

    impl MemoryManaged for ReloadingRepo {
        fn estimate_size(&self, _language_pair: &str) -> usize {
            1
        }

        fn unload_language_pair(&self, language_pair: &str) {
            self.unloaded.lock().push(language_pair.to_string());
            if language_pair == self.pair {
                if let Some(m) = self.manager.lock().upgrade() {
                    m.touch_language_pair("dictionary", language_pair);
                }
            }
        }
    }

    #[test]
    fn pair_reloaded_during_its_eviction_stays_tracked() {
        let m = Arc::new(manager(u64::MAX / 2, 5));
        let dict = Arc::new(ReloadingRepo {
            pair: "en-ru",
            manager: Mutex::new(Arc::downgrade(&m)),
            unloaded: Mutex::new(Vec::new()),
        });
        let weak: Weak<dyn MemoryManaged> = Arc::downgrade(&dict) as Weak<dyn MemoryManaged>;
        m.register_repository("dictionary", weak);
        let phrases = FakeRepo::new(&[("en-ru", 1), ("en-de", 1)]);
        register(&m, "phrases", &phrases);

        m.touch_language_pair("dictionary", "en-ru");
        m.touch_language_pair("dictionary", "en-de");
        m.touch_language_pair("dictionary", "en-fr");
        m.touch_language_pair("phrases", "en-ru");
        // 5 > 4: dictionary en-ru and en-de go, en-ru comes straight back
        m.touch_language_pair("phrases", "en-de");

        assert_eq!(*dict.unloaded.lock(), vec!["en-ru", "en-de"]);
        assert!(m.is_tracked("dictionary", "en-ru"));
        assert!(!m.is_tracked("dictionary", "en-de"));
        let usage = m.usage();
        assert_eq!(usage.loaded_pairs, 4);
        assert_eq!(usage.total_bytes, 4);
        assert_eq!(usage.evictions, 2);
    }

    #[test]
    fn touched_pair_is_never_evicted() {
        let m = manager(100, 100);
        let repo = FakeRepo::new(&[("en-ru", 500)]);
        register(&m, "dictionary", &repo);
        m.touch_language_pair("dictionary", "en-ru");
        assert!(repo.unloaded.lock().is_empty());
        assert!(m.is_tracked("dictionary", "en-ru"));
    }

    #[test]
    fn clear_all_invokes_callbacks_dispose_does_not() {
        let m = manager(10_000, 100);
        let repo = FakeRepo::new(&[("en-ru", 10), ("en-de", 10)]);
        register(&m, "dictionary", &repo);
        m.touch_language_pair("dictionary", "en-ru");
        m.touch_language_pair("dictionary", "en-de");

        m.clear_all();
        let mut unloaded = repo.unloaded.lock().clone();
        unloaded.sort();
        assert_eq!(unloaded, vec!["en-de", "en-ru"]);
        assert_eq!(m.usage().loaded_pairs, 0);

        m.touch_language_pair("dictionary", "en-ru");
        m.dispose();
        assert_eq!(repo.unloaded.lock().len(), 2);
        assert_eq!(m.usage().loaded_pairs, 0);
        // disposed manager ignores further touches
        m.touch_language_pair("dictionary", "en-ru");
        assert_eq!(m.usage().loaded_pairs, 0);
    }

    #[test]
    fn disabled_manager_tracks_nothing() {
        let m = MemoryManager::new(
            false,
            MemoryLimits {
                max_memory_bytes: 1,
                max_language_pairs: 1,
                eviction_threshold: 0.5,
            },
        );
        m.touch_language_pair("dictionary", "en-ru");
        assert!(!m.is_tracked("dictionary", "en-ru"));
    }

    #[test]
    fn access_count_accumulates() {
        let m = manager(10_000, 100);
        let repo = FakeRepo::new(&[("en-ru", 10)]);
        register(&m, "dictionary", &repo);
        for _ in 0..3 {
            m.touch_language_pair("dictionary", "en-ru");
        }
        assert_eq!(m.usage().pairs[0].access_count, 3);
    }
}
