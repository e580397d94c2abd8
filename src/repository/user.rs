//! Per-user data under `<dataRoot>/user/`: translation history, settings,
//! and saved translation edits.
//! History is appended through a background batch writer so the translate
//! path never waits on disk I/O.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use super::normalize::{canonical_key, collapse_whitespace, is_valid_language_pair};
use super::record::now_millis;
use crate::error::{RepositoryResult, ValidationError};
use crate::storage::Storage;

pub const HISTORY_FILE: &str = "translation_history.jsonl";
pub const SETTINGS_FILE: &str = "user_settings.json";
pub const EDITS_FILE: &str = "user_translation_edits.jsonl";

const FLUSH_INTERVAL: Duration = Duration::from_millis(300);

/// A single translation history record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryRecord {
    pub request_id: String,
    pub source_text: String,
    pub translated_text: String,
    pub source_lang: String,
    pub target_lang: String,
    #[serde(default)]
    pub confidence: f64,
    #[serde(default)]
    pub processing_time_ms: u64,
    pub created_at: i64,
}

/// A user's correction of a translation, keyed by original text + pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranslationEdit {
    pub original_text: String,
    pub edited_text: String,
    pub language_pair: String,
    #[serde(default)]
    pub created_at: i64,
    #[serde(default)]
    pub updated_at: i64,
}

impl TranslationEdit {
    pub fn new(
        original_text: impl Into<String>,
        edited_text: impl Into<String>,
        language_pair: impl Into<String>,
    ) -> Self {
        Self {
            original_text: original_text.into(),
            edited_text: edited_text.into(),
            language_pair: language_pair.into(),
            created_at: 0,
            updated_at: 0,
        }
    }

    fn validate(&self) -> Result<(), ValidationError> {
        if self.original_text.trim().is_empty() {
            return Err(ValidationError::new("original_text", "must not be empty"));
        }
        if self.edited_text.trim().is_empty() {
            return Err(ValidationError::new("edited_text", "must not be empty"));
        }
        if !is_valid_language_pair(&self.language_pair) {
            return Err(ValidationError::new(
                "language_pair",
                format!("`{}` does not match ^[a-z]{{2}}-[a-z]{{2}}$", self.language_pair),
            ));
        }
        Ok(())
    }

    fn matches(&self, key: &str, language_pair: &str) -> bool {
        self.language_pair == language_pair && canonical_key(&self.original_text) == key
    }
}

pub struct UserDataRepository {
    storage: Storage,
    max_history: usize,
    gate: Mutex<()>,
    // lines in the history file, counted lazily on first append
    history_len: Mutex<Option<usize>>,
}

impl UserDataRepository {
    pub fn new(storage: Storage, max_history: usize) -> Self {
        Self {
            storage,
            max_history: max_history.max(1),
            gate: Mutex::new(()),
            history_len: Mutex::new(None),
        }
    }

    // ── history ──

    /// Append records, then trim the file to the newest `max_history` lines.
    pub fn append_history(&self, records: &[HistoryRecord]) -> RepositoryResult<()> {
        if records.is_empty() {
            return Ok(());
        }
        let path = self.storage.user_file(HISTORY_FILE);
        let _gate = self.gate.lock();
        for record in records {
            self.storage.append_jsonl(&path, record)?;
        }

        let mut len_guard = self.history_len.lock();
        let len = match *len_guard {
            Some(len) => len + records.len(),
            None => self.storage.read_jsonl::<HistoryRecord>(&path)?.records.len(),
        };
        if len > self.max_history {
            let mut all = self.storage.read_jsonl::<HistoryRecord>(&path)?.records;
            let excess = all.len().saturating_sub(self.max_history);
            all.drain(..excess);
            self.storage.write_jsonl(&path, &all)?;
            debug!(trimmed = excess, kept = all.len(), "history trimmed");
            *len_guard = Some(all.len());
        } else {
            *len_guard = Some(len);
        }
        Ok(())
    }

    /// Newest first.
    pub fn recent_history(&self, limit: usize) -> RepositoryResult<Vec<HistoryRecord>> {
        let path = self.storage.user_file(HISTORY_FILE);
        let all = self.storage.read_jsonl::<HistoryRecord>(&path)?.records;
        Ok(all.into_iter().rev().take(limit).collect())
    }

    pub fn clear_history(&self) -> RepositoryResult<()> {
        let _gate = self.gate.lock();
        self.storage.remove(&self.storage.user_file(HISTORY_FILE))?;
        *self.history_len.lock() = Some(0);
        info!("history cleared");
        Ok(())
    }

    // ── settings ──

    pub fn settings(&self) -> RepositoryResult<Map<String, Value>> {
        self.storage.read_json(&self.storage.user_file(SETTINGS_FILE))
    }

    pub fn get_setting(&self, key: &str) -> RepositoryResult<Option<Value>> {
        Ok(self.settings()?.remove(key))
    }

    pub fn set_setting(&self, key: &str, value: Value) -> RepositoryResult<()> {
        if key.trim().is_empty() {
            return Err(ValidationError::new("key", "must not be empty").into());
        }
        let _gate = self.gate.lock();
        let mut settings = self.settings()?;
        settings.insert(key.to_string(), value);
        self.storage
            .write_json(&self.storage.user_file(SETTINGS_FILE), &settings)
    }

    pub fn remove_setting(&self, key: &str) -> RepositoryResult<bool> {
        let _gate = self.gate.lock();
        let mut settings = self.settings()?;
        if settings.remove(key).is_none() {
            return Ok(false);
        }
        self.storage
            .write_json(&self.storage.user_file(SETTINGS_FILE), &settings)?;
        Ok(true)
    }

    // ── edits ──

    /// Insert or replace the edit for (original text, language pair).
    pub fn save_edit(&self, mut edit: TranslationEdit) -> RepositoryResult<TranslationEdit> {
        edit.validate()?;
        let now = now_millis();
        edit.original_text = collapse_whitespace(&edit.original_text);
        edit.edited_text = collapse_whitespace(&edit.edited_text);
        let key = canonical_key(&edit.original_text);

        let _gate = self.gate.lock();
        let path = self.storage.user_file(EDITS_FILE);
        let mut edits = self.storage.read_jsonl::<TranslationEdit>(&path)?.records;
        match edits.iter_mut().find(|e| e.matches(&key, &edit.language_pair)) {
            Some(existing) => {
                existing.edited_text = edit.edited_text;
                existing.updated_at = now;
                edit = existing.clone();
            }
            None => {
                edit.created_at = now;
                edit.updated_at = now;
                edits.push(edit.clone());
            }
        }
        self.storage.write_jsonl(&path, &edits)?;
        Ok(edit)
    }

    pub fn find_edit(
        &self,
        original_text: &str,
        language_pair: &str,
    ) -> RepositoryResult<Option<TranslationEdit>> {
        let key = canonical_key(original_text);
        Ok(self
            .edits()?
            .into_iter()
            .find(|e| e.matches(&key, language_pair)))
    }

    pub fn edits(&self) -> RepositoryResult<Vec<TranslationEdit>> {
        let path = self.storage.user_file(EDITS_FILE);
        Ok(self.storage.read_jsonl(&path)?.records)
    }

    pub fn remove_edit(&self, original_text: &str, language_pair: &str) -> RepositoryResult<bool> {
        let key = canonical_key(original_text);
        let _gate = self.gate.lock();
        let path = self.storage.user_file(EDITS_FILE);
        let mut edits = self.storage.read_jsonl::<TranslationEdit>(&path)?.records;
        let before = edits.len();
        edits.retain(|e| !e.matches(&key, language_pair));
        if edits.len() == before {
            return Ok(false);
        }
        self.storage.write_jsonl(&path, &edits)?;
        Ok(true)
    }
}

enum HistoryCommand {
    Record(HistoryRecord),
    Flush(oneshot::Sender<()>),
}

/// Channel front for history appends. Records are batched and written on the
/// blocking pool every 300ms; dropping the writer flushes what is left.
#[derive(Clone)]
pub struct HistoryWriter {
    tx: mpsc::UnboundedSender<HistoryCommand>,
}

impl HistoryWriter {
    /// Must be called inside a tokio runtime.
    pub fn spawn(repository: Arc<UserDataRepository>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(flush_loop(rx, repository));
        Self { tx }
    }

    /// Queue a record. Never blocks.
    pub fn record(&self, record: HistoryRecord) {
        if self.tx.send(HistoryCommand::Record(record)).is_err() {
            warn!("history channel closed, record dropped");
        }
    }

    /// Wait until everything queued so far is on disk.
    pub async fn flush(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        if self.tx.send(HistoryCommand::Flush(done_tx)).is_ok() {
            let _ = done_rx.await;
        }
    }
}

async fn flush_loop(
    mut rx: mpsc::UnboundedReceiver<HistoryCommand>,
    repository: Arc<UserDataRepository>,
) {
    let mut buffer: Vec<HistoryRecord> = Vec::with_capacity(32);
    let mut waiters: Vec<oneshot::Sender<()>> = Vec::new();

    loop {
        let mut closed = false;
        tokio::select! {
            _ = tokio::time::sleep(FLUSH_INTERVAL) => {}
            msg = rx.recv() => match msg {
                Some(HistoryCommand::Record(record)) => buffer.push(record),
                Some(HistoryCommand::Flush(done)) => waiters.push(done),
                None => closed = true,
            }
        }

        while let Ok(cmd) = rx.try_recv() {
            match cmd {
                HistoryCommand::Record(record) => buffer.push(record),
                HistoryCommand::Flush(done) => waiters.push(done),
            }
        }

        if !buffer.is_empty() {
            let batch = std::mem::take(&mut buffer);
            let repo = repository.clone();
            let count = batch.len();
            match tokio::task::spawn_blocking(move || repo.append_history(&batch)).await {
                Ok(Ok(())) => debug!(count, "history batch flushed"),
                Ok(Err(e)) => warn!(error = %e, count, "history batch write failed"),
                Err(e) => warn!(error = %e, "history flush task failed"),
            }
        }
        for done in waiters.drain(..) {
            let _ = done.send(());
        }

        if closed {
            info!("history flush loop exiting (channel closed)");
            return;
        }
    }
}
