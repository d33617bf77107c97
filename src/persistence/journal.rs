use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::config::JournalConfig;
use crate::error::Result;
use crate::models::AgentId;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum JournalEntryType {
    Decision,
    LongOpened,
    ShortOpened,
    PositionClosed,
    Error,
}

/// One immutable record of agent activity
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct JournalEntry {
    /// Milliseconds since epoch, stamped by the store
    pub timestamp: i64,
    #[serde(rename = "type")]
    pub entry_type: JournalEntryType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub symbol: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decision: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub amount: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub leverage: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entry_price: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_loss: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub take_profit: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_ref: Option<String>,
}

impl JournalEntry {
    pub fn new(entry_type: JournalEntryType) -> Self {
        Self {
            timestamp: 0,
            entry_type,
            symbol: None,
            decision: None,
            reasoning: None,
            amount: None,
            leverage: None,
            entry_price: None,
            stop_loss: None,
            take_profit: None,
            confidence: None,
            result: None,
            external_ref: None,
        }
    }

    pub fn symbol(mut self, symbol: impl Into<String>) -> Self {
        self.symbol = Some(symbol.into());
        self
    }

    pub fn decision(mut self, decision: impl Into<String>) -> Self {
        self.decision = Some(decision.into());
        self
    }

    pub fn reasoning(mut self, reasoning: impl Into<String>) -> Self {
        self.reasoning = Some(reasoning.into());
        self
    }

    pub fn amount(mut self, amount: f64) -> Self {
        self.amount = Some(amount);
        self
    }

    pub fn leverage(mut self, leverage: u32) -> Self {
        self.leverage = Some(leverage);
        self
    }

    pub fn entry_price(mut self, price: f64) -> Self {
        self.entry_price = Some(price);
        self
    }

    pub fn protection(mut self, stop_loss: Option<f64>, take_profit: Option<f64>) -> Self {
        self.stop_loss = stop_loss;
        self.take_profit = take_profit;
        self
    }

    pub fn confidence(mut self, confidence: f64) -> Self {
        self.confidence = Some(confidence);
        self
    }

    pub fn result(mut self, result: impl Into<String>) -> Self {
        self.result = Some(result.into());
        self
    }

    pub fn external_ref(mut self, reference: impl Into<String>) -> Self {
        self.external_ref = Some(reference.into());
        self
    }
}

/// On-disk form: the entry tagged with its agent
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StoredEntry {
    agent_id: AgentId,
    #[serde(flatten)]
    entry: JournalEntry,
}

struct JournalInner {
    path: PathBuf,
    per_agent_cap: usize,
    total_cap: usize,
    entries: Mutex<BTreeMap<AgentId, VecDeque<JournalEntry>>>,
    dirty: AtomicBool,
    // Serializes file writes between the background writer and flush()
    write_lock: Mutex<()>,
}

/// Bounded, disk-backed journal of agent activity.
///
/// Appends are in-memory and cheap; a background writer persists the whole
/// journal when it has changed. Clones share the same store.
#[derive(Clone)]
pub struct JournalStore {
    inner: Arc<JournalInner>,
}

impl JournalStore {
    /// Open the journal, recovering entries from `config.path` if present
    pub fn open(config: &JournalConfig) -> Result<Self> {
        let store = Self {
            inner: Arc::new(JournalInner {
                path: config.path.clone(),
                per_agent_cap: config.per_agent_cap.max(1),
                total_cap: config.total_cap.max(1),
                entries: Mutex::new(BTreeMap::new()),
                dirty: AtomicBool::new(false),
                write_lock: Mutex::new(()),
            }),
        };

        let recovered = store.load()?;
        if recovered > 0 {
            tracing::info!(
                "Recovered {} journal entries from {}",
                recovered,
                store.inner.path.display()
            );
        }
        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    fn entries_guard(&self) -> MutexGuard<'_, BTreeMap<AgentId, VecDeque<JournalEntry>>> {
        self.inner
            .entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn load(&self) -> Result<usize> {
        let path = &self.inner.path;
        if !path.exists() {
            return Ok(0);
        }

        let raw = std::fs::read_to_string(path)?;
        let stored: Vec<StoredEntry> = match serde_json::from_str(&raw) {
            Ok(stored) => stored,
            Err(e) => {
                let backup = path.with_extension(format!(
                    "corrupt-{}.json",
                    chrono::Utc::now().timestamp()
                ));
                tracing::warn!(
                    "Journal {} is unreadable ({}), moving it to {} and starting empty",
                    path.display(),
                    e,
                    backup.display()
                );
                std::fs::rename(path, &backup)?;
                return Ok(0);
            }
        };

        let count = stored.len();
        let cap = self.inner.per_agent_cap;
        let mut entries = self.entries_guard();
        for StoredEntry { agent_id, entry } in stored {
            let list = entries.entry(agent_id).or_default();
            list.push_back(entry);
            while list.len() > cap {
                list.pop_front();
            }
        }
        Ok(count)
    }

    /// Append an entry, stamping its timestamp
    pub fn add_entry(&self, agent: AgentId, mut entry: JournalEntry) -> JournalEntry {
        let now = chrono::Utc::now().timestamp_millis();
        let mut entries = self.entries_guard();
        let list = entries.entry(agent).or_default();

        // Never stamp earlier than the previous entry, keeps per-agent order
        entry.timestamp = list.back().map_or(now, |last| now.max(last.timestamp));
        list.push_back(entry.clone());
        while list.len() > self.inner.per_agent_cap {
            list.pop_front();
        }
        drop(entries);

        self.inner.dirty.store(true, Ordering::Release);
        entry
    }

    /// Entries for one agent, oldest first
    pub fn entries(&self, agent: AgentId) -> Vec<JournalEntry> {
        self.entries_guard()
            .get(&agent)
            .map(|list| list.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn all_entries(&self) -> BTreeMap<AgentId, Vec<JournalEntry>> {
        self.entries_guard()
            .iter()
            .map(|(agent, list)| (*agent, list.iter().cloned().collect()))
            .collect()
    }

    /// Clear one agent's entries, or everything
    pub fn clear(&self, agent: Option<AgentId>) {
        let mut entries = self.entries_guard();
        match agent {
            Some(id) => {
                entries.remove(&id);
            }
            None => entries.clear(),
        }
        drop(entries);
        self.inner.dirty.store(true, Ordering::Release);
    }

    /// Every in-memory entry, flattened and sorted by time, as pretty JSON
    pub fn export_json(&self) -> Result<String> {
        let flattened = self.flatten(usize::MAX);
        Ok(serde_json::to_string_pretty(&flattened)?)
    }

    fn flatten(&self, keep: usize) -> Vec<StoredEntry> {
        let mut flattened: Vec<StoredEntry> = self
            .entries_guard()
            .iter()
            .flat_map(|(agent, list)| {
                list.iter().map(move |entry| StoredEntry {
                    agent_id: *agent,
                    entry: entry.clone(),
                })
            })
            .collect();

        flattened.sort_by_key(|s| s.entry.timestamp);
        if flattened.len() > keep {
            flattened.drain(..flattened.len() - keep);
        }
        flattened
    }

    /// Write the persisted document now (temp file + rename)
    pub fn flush(&self) -> Result<()> {
        self.inner.dirty.store(false, Ordering::Release);
        if let Err(e) = self.write_snapshot() {
            self.inner.dirty.store(true, Ordering::Release);
            return Err(e);
        }
        Ok(())
    }

    /// Write only if something changed since the last write
    fn flush_if_dirty(&self) -> Result<bool> {
        if !self.inner.dirty.swap(false, Ordering::AcqRel) {
            return Ok(false);
        }
        if let Err(e) = self.write_snapshot() {
            self.inner.dirty.store(true, Ordering::Release);
            return Err(e);
        }
        Ok(true)
    }

    fn write_snapshot(&self) -> Result<()> {
        let _guard = self
            .inner
            .write_lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        let document = self.flatten(self.inner.total_cap);
        let json = serde_json::to_string_pretty(&document)?;

        let path = &self.inner.path;
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, path)?;

        tracing::debug!("Journal saved: {} entries", document.len());
        Ok(())
    }

    /// Start the write-coalescing task
    pub fn spawn_writer(&self, tick: Duration) -> JournalWriter {
        let (stop_tx, mut stop_rx) = watch::channel(false);
        let store = self.clone();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(tick);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let writer = store.clone();
                        match tokio::task::spawn_blocking(move || writer.flush_if_dirty()).await {
                            Ok(Ok(_)) => {}
                            Ok(Err(e)) => tracing::error!("Failed to save journal: {}", e),
                            Err(e) => tracing::error!("Journal writer task failed: {}", e),
                        }
                    }
                    _ = stop_rx.changed() => break,
                }
            }

            if let Err(e) = store.flush_if_dirty() {
                tracing::error!("Final journal save failed: {}", e);
            }
        });

        JournalWriter { stop_tx, handle }
    }
}

/// Handle to the background journal writer
pub struct JournalWriter {
    stop_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl JournalWriter {
    /// Stop the writer after a final save of pending changes
    pub async fn shutdown(self) {
        let _ = self.stop_tx.send(true);
        if let Err(e) = self.handle.await {
            tracing::error!("Journal writer did not stop cleanly: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(dir: &tempfile::TempDir, per_agent_cap: usize, total_cap: usize) -> JournalConfig {
        JournalConfig {
            path: dir.path().join("logs").join("journal.json"),
            per_agent_cap,
            total_cap,
            flush_interval_ms: 10,
        }
    }

    fn decision(n: usize) -> JournalEntry {
        JournalEntry::new(JournalEntryType::Decision)
            .symbol("BTCUSDT")
            .reasoning(format!("entry {}", n))
    }

    #[test]
    fn test_eviction_keeps_most_recent_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let store = JournalStore::open(&config(&dir, 5, 500)).unwrap();

        for n in 0..12 {
            store.add_entry(1, decision(n));
        }

        let reasons: Vec<String> = store
            .entries(1)
            .into_iter()
            .map(|e| e.reasoning.unwrap())
            .collect();
        assert_eq!(
            reasons,
            vec!["entry 7", "entry 8", "entry 9", "entry 10", "entry 11"]
        );
    }

    #[test]
    fn test_timestamps_are_monotonic_per_agent() {
        let dir = tempfile::tempdir().unwrap();
        let store = JournalStore::open(&config(&dir, 100, 500)).unwrap();

        for n in 0..20 {
            store.add_entry(2, decision(n));
        }
        let entries = store.entries(2);
        assert!(entries.windows(2).all(|w| w[0].timestamp <= w[1].timestamp));
        assert!(entries[0].timestamp > 0);
    }

    #[test]
    fn test_flush_and_reopen_regroups_by_agent() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config(&dir, 100, 500);
        let store = JournalStore::open(&cfg).unwrap();

        store.add_entry(1, decision(1));
        store.add_entry(
            2,
            JournalEntry::new(JournalEntryType::LongOpened)
                .symbol("ETHUSDT")
                .amount(100.0)
                .leverage(10)
                .protection(Some(2900.0), Some(3300.0))
                .external_ref("123"),
        );
        store.add_entry(1, JournalEntry::new(JournalEntryType::Error).result("timeout"));
        store.flush().unwrap();

        let reopened = JournalStore::open(&cfg).unwrap();
        assert_eq!(reopened.entries(1).len(), 2);
        assert_eq!(reopened.entries(1)[1].entry_type, JournalEntryType::Error);

        let long = &reopened.entries(2)[0];
        assert_eq!(long.leverage, Some(10));
        assert_eq!(long.stop_loss, Some(2900.0));
        assert_eq!(long.external_ref.as_deref(), Some("123"));
    }

    #[test]
    fn test_document_format() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config(&dir, 100, 500);
        let store = JournalStore::open(&cfg).unwrap();
        store.add_entry(
            3,
            JournalEntry::new(JournalEntryType::PositionClosed)
                .symbol("SOLUSDT")
                .entry_price(150.5),
        );
        store.flush().unwrap();

        let raw = std::fs::read_to_string(&cfg.path).unwrap();
        let doc: serde_json::Value = serde_json::from_str(&raw).unwrap();
        let first = &doc[0];
        assert_eq!(first["agentId"], 3);
        assert_eq!(first["type"], "position-closed");
        assert_eq!(first["entryPrice"], 150.5);
        assert!(first.get("stopLoss").is_none());
        // Pretty printed
        assert!(raw.contains('\n'));
    }

    #[test]
    fn test_persisted_document_keeps_most_recent_total() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config(&dir, 100, 10);
        let store = JournalStore::open(&cfg).unwrap();

        for n in 0..8 {
            store.add_entry(1, decision(n));
            store.add_entry(2, decision(100 + n));
        }
        store.flush().unwrap();

        let reopened = JournalStore::open(&cfg).unwrap();
        let total: usize = reopened.all_entries().values().map(Vec::len).sum();
        assert_eq!(total, 10);
        // The newest entry survives
        assert_eq!(
            reopened.entries(2).last().unwrap().reasoning.as_deref(),
            Some("entry 107")
        );
    }

    #[test]
    fn test_corrupt_file_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config(&dir, 100, 500);
        std::fs::create_dir_all(cfg.path.parent().unwrap()).unwrap();
        std::fs::write(&cfg.path, "{ not json").unwrap();

        let store = JournalStore::open(&cfg).unwrap();
        assert!(store.all_entries().is_empty());
        assert!(!cfg.path.exists());
    }

    #[test]
    fn test_clear_and_export() {
        let dir = tempfile::tempdir().unwrap();
        let store = JournalStore::open(&config(&dir, 100, 500)).unwrap();
        store.add_entry(1, decision(1));
        store.add_entry(2, decision(2));

        store.clear(Some(1));
        assert!(store.entries(1).is_empty());
        assert_eq!(store.entries(2).len(), 1);

        let exported: Vec<serde_json::Value> =
            serde_json::from_str(&store.export_json().unwrap()).unwrap();
        assert_eq!(exported.len(), 1);
        assert_eq!(exported[0]["agentId"], 2);

        store.clear(None);
        assert!(store.all_entries().is_empty());
    }

    #[tokio::test]
    async fn test_background_writer_persists_changes() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config(&dir, 100, 500);
        let store = JournalStore::open(&cfg).unwrap();
        let writer = store.spawn_writer(Duration::from_millis(10));

        store.add_entry(4, decision(1));
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(cfg.path.exists());

        store.add_entry(4, decision(2));
        writer.shutdown().await;

        let reopened = JournalStore::open(&cfg).unwrap();
        assert_eq!(reopened.entries(4).len(), 2);
    }
}
