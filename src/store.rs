//! Shared observable map of operation id to its latest known status.
//!
//! Every writer (scheduled polls, manual refreshes, bulk history loads and
//! launches) goes through [`ReconciliationStore::merge`]. The merge rules
//! keep a record from regressing no matter in which order responses land:
//!
//! 1. an unknown id is inserted as-is;
//! 2. a write carrying an older revision than the stored one is dropped;
//! 3. otherwise phase only moves forward, log lines are appended without
//!    duplicates and never truncated, and the remaining fields are replaced.
//!
//! The first time a record reaches a terminal phase the terminal listeners
//! fire once, after the regular listeners.
//!
//! Writes and their notifications are serialised: listeners observe events
//! in merge order, even with writers on several threads. Listeners may read
//! the store but must not write to it.

use crate::classifier::FailureClassifier;
use crate::model::{LogLine, OperationId, Phase, StatusRecord, unix_millis};
use chrono::Utc;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use tracing::debug;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MergeOutcome {
    Inserted,
    Updated,
    Unchanged,
    RejectedStale,
}

#[derive(Clone, Debug)]
pub struct Merged {
    pub outcome: MergeOutcome,
    pub became_terminal: bool,
    /// The stored record after the merge.
    pub current: Option<StatusRecord>,
}

impl Merged {
    fn untouched() -> Self {
        Self {
            outcome: MergeOutcome::Unchanged,
            became_terminal: false,
            current: None,
        }
    }

    pub fn accepted(&self) -> bool {
        matches!(self.outcome, MergeOutcome::Inserted | MergeOutcome::Updated)
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum StoreEvent {
    Upserted {
        id: OperationId,
        record: StatusRecord,
    },
    Replaced {
        provisional: OperationId,
        id: OperationId,
        record: StatusRecord,
    },
    Removed {
        id: OperationId,
    },
}

impl StoreEvent {
    pub fn id(&self) -> &OperationId {
        match self {
            Self::Upserted { id, .. } | Self::Replaced { id, .. } | Self::Removed { id } => id,
        }
    }
}

type Listener = Arc<dyn Fn(&StoreEvent) + Send + Sync>;
type TerminalListener = Arc<dyn Fn(&OperationId, &StatusRecord) + Send + Sync>;

#[derive(Default)]
struct Inner {
    records: HashMap<OperationId, StatusRecord>,
    terminal_seen: HashSet<OperationId>,
    last_revision: u64,
}

pub struct ReconciliationStore {
    inner: Mutex<Inner>,
    /// Held from the start of a write until its listeners return.
    emit_lock: Mutex<()>,
    listeners: RwLock<Vec<(u64, Listener)>>,
    terminal_listeners: RwLock<Vec<(u64, TerminalListener)>>,
    listener_seq: AtomicU64,
    classifier: FailureClassifier,
}

impl Default for ReconciliationStore {
    fn default() -> Self {
        Self::new(FailureClassifier::new())
    }
}

impl ReconciliationStore {
    pub fn new(classifier: FailureClassifier) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            emit_lock: Mutex::new(()),
            listeners: RwLock::new(Vec::new()),
            terminal_listeners: RwLock::new(Vec::new()),
            listener_seq: AtomicU64::new(1),
            classifier,
        }
    }

    pub fn classifier(&self) -> &FailureClassifier {
        &self.classifier
    }

    /// Hands out a revision newer than every revision handed out before and
    /// never older than the wall clock in milliseconds.
    pub fn next_revision(&self) -> u64 {
        let now = unix_millis(Utc::now());
        match self.inner.lock() {
            Ok(mut inner) => {
                let next = now.max(inner.last_revision.saturating_add(1));
                inner.last_revision = next;
                next
            }
            Err(_) => now,
        }
    }

    pub fn get(&self, id: &OperationId) -> Option<StatusRecord> {
        self.inner
            .lock()
            .ok()
            .and_then(|inner| inner.records.get(id).cloned())
    }

    pub fn contains(&self, id: &OperationId) -> bool {
        self.inner
            .lock()
            .map(|inner| inner.records.contains_key(id))
            .unwrap_or(false)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().map(|inner| inner.records.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// All records ordered by revision, oldest first.
    pub fn snapshot(&self) -> Vec<(OperationId, StatusRecord)> {
        let mut entries: Vec<_> = match self.inner.lock() {
            Ok(inner) => inner
                .records
                .iter()
                .map(|(id, record)| (id.clone(), record.clone()))
                .collect(),
            Err(_) => Vec::new(),
        };
        entries.sort_by(|a, b| a.1.revision.cmp(&b.1.revision).then_with(|| a.0.cmp(&b.0)));
        entries
    }

    pub fn merge(&self, id: &OperationId, incoming: StatusRecord) -> Merged {
        let _emitting = self.emit_lock.lock();
        let merged = match self.inner.lock() {
            Ok(mut inner) => merge_locked(&mut inner, &self.classifier, id, incoming),
            Err(_) => return Merged::untouched(),
        };
        self.notify(id, merged)
    }

    /// Merges only if `id` is still present; `None` when it was removed.
    /// Check and merge share one critical section, so a concurrent
    /// `remove` cannot be undone by a late write.
    pub fn merge_existing(&self, id: &OperationId, incoming: StatusRecord) -> Option<Merged> {
        let _emitting = self.emit_lock.lock();
        let merged = match self.inner.lock() {
            Ok(mut inner) => {
                if !inner.records.contains_key(id) {
                    return None;
                }
                merge_locked(&mut inner, &self.classifier, id, incoming)
            }
            Err(_) => return Some(Merged::untouched()),
        };
        Some(self.notify(id, merged))
    }

    fn notify(&self, id: &OperationId, merged: Merged) -> Merged {
        debug!(
            "store-merge id={id} outcome={:?} terminal={}",
            merged.outcome, merged.became_terminal
        );
        if merged.accepted() {
            if let Some(record) = merged.current.clone() {
                self.emit(&StoreEvent::Upserted {
                    id: id.clone(),
                    record,
                });
            }
        }
        self.emit_terminal(id, &merged);
        merged
    }

    /// Swaps a provisional entry for the record under its real id in one
    /// critical section, so no reader sees both or neither.
    pub fn replace_provisional(
        &self,
        provisional: &OperationId,
        id: &OperationId,
        record: StatusRecord,
    ) -> Merged {
        let _emitting = self.emit_lock.lock();
        let merged = match self.inner.lock() {
            Ok(mut inner) => {
                inner.records.remove(provisional);
                inner.terminal_seen.remove(provisional);
                merge_locked(&mut inner, &self.classifier, id, record)
            }
            Err(_) => return Merged::untouched(),
        };
        if let Some(record) = merged.current.clone() {
            self.emit(&StoreEvent::Replaced {
                provisional: provisional.clone(),
                id: id.clone(),
                record,
            });
        }
        self.emit_terminal(id, &merged);
        merged
    }

    pub fn remove(&self, id: &OperationId) -> Option<StatusRecord> {
        let _emitting = self.emit_lock.lock();
        let removed = self.inner.lock().ok().and_then(|mut inner| {
            inner.terminal_seen.remove(id);
            inner.records.remove(id)
        });
        if removed.is_some() {
            self.emit(&StoreEvent::Removed { id: id.clone() });
        }
        removed
    }

    pub fn subscribe<F>(self: &Arc<Self>, listener: F) -> Subscription
    where
        F: Fn(&StoreEvent) + Send + Sync + 'static,
    {
        let key = self.listener_seq.fetch_add(1, Ordering::Relaxed);
        if let Ok(mut listeners) = self.listeners.write() {
            listeners.push((key, Arc::new(listener)));
        }
        Subscription {
            store: Arc::downgrade(self),
            key,
            channel: Channel::Events,
        }
    }

    /// Listener for the one-shot "became terminal" notification.
    pub fn subscribe_terminal<F>(self: &Arc<Self>, listener: F) -> Subscription
    where
        F: Fn(&OperationId, &StatusRecord) + Send + Sync + 'static,
    {
        let key = self.listener_seq.fetch_add(1, Ordering::Relaxed);
        if let Ok(mut listeners) = self.terminal_listeners.write() {
            listeners.push((key, Arc::new(listener)));
        }
        Subscription {
            store: Arc::downgrade(self),
            key,
            channel: Channel::Terminal,
        }
    }

    fn unsubscribe(&self, key: u64, channel: Channel) {
        match channel {
            Channel::Events => {
                if let Ok(mut listeners) = self.listeners.write() {
                    listeners.retain(|(k, _)| *k != key);
                }
            }
            Channel::Terminal => {
                if let Ok(mut listeners) = self.terminal_listeners.write() {
                    listeners.retain(|(k, _)| *k != key);
                }
            }
        }
    }

    fn emit(&self, event: &StoreEvent) {
        let listeners: Vec<Listener> = match self.listeners.read() {
            Ok(listeners) => listeners.iter().map(|(_, l)| l.clone()).collect(),
            Err(_) => return,
        };
        for listener in listeners {
            listener(event);
        }
    }

    fn emit_terminal(&self, id: &OperationId, merged: &Merged) {
        if !merged.became_terminal {
            return;
        }
        let Some(record) = merged.current.as_ref() else {
            return;
        };
        let listeners: Vec<TerminalListener> = match self.terminal_listeners.read() {
            Ok(listeners) => listeners.iter().map(|(_, l)| l.clone()).collect(),
            Err(_) => return,
        };
        for listener in listeners {
            listener(id, record);
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Channel {
    Events,
    Terminal,
}

/// Keeps a listener registered until dropped.
#[must_use = "dropping a Subscription unsubscribes the listener"]
pub struct Subscription {
    store: Weak<ReconciliationStore>,
    key: u64,
    channel: Channel,
}

impl Subscription {
    pub fn unsubscribe(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(store) = self.store.upgrade() {
            store.unsubscribe(self.key, self.channel);
        }
    }
}

fn merge_locked(
    inner: &mut Inner,
    classifier: &FailureClassifier,
    id: &OperationId,
    mut incoming: StatusRecord,
) -> Merged {
    inner.last_revision = inner.last_revision.max(incoming.revision);

    let Some(existing) = inner.records.get(id) else {
        incoming.normalize();
        classify_if_failed(classifier, &mut incoming);
        let became_terminal = incoming.is_terminal() && inner.terminal_seen.insert(id.clone());
        inner.records.insert(id.clone(), incoming.clone());
        return Merged {
            outcome: MergeOutcome::Inserted,
            became_terminal,
            current: Some(incoming),
        };
    };

    if incoming.revision < existing.revision {
        return Merged {
            outcome: MergeOutcome::RejectedStale,
            became_terminal: false,
            current: Some(existing.clone()),
        };
    }

    let mut merged = existing.clone();
    merged.revision = incoming.revision;
    if !incoming.target.trim().is_empty() {
        merged.target = incoming.target;
    }
    if incoming.started_at.is_some() {
        merged.started_at = incoming.started_at;
    }
    if incoming.error.is_some() {
        merged.error = incoming.error;
    }
    merged.verified_by_listing |= incoming.verified_by_listing;

    if !existing.is_terminal() {
        append_unique(&mut merged.log_lines, incoming.log_lines);
        if incoming.phase.rank() >= existing.phase.rank() {
            merged.phase = incoming.phase;
            if incoming.phase.is_terminal() {
                merged.finished_at = incoming.finished_at.or(merged.finished_at);
                merged.failure_category = incoming.failure_category;
            }
        }
    }
    merged.normalize();
    classify_if_failed(classifier, &mut merged);

    let same_content = {
        let mut candidate = merged.clone();
        candidate.revision = existing.revision;
        &candidate == existing
    };
    if same_content {
        // Only the revision moved; keep it so older writes stay rejected.
        if let Some(stored) = inner.records.get_mut(id) {
            stored.revision = merged.revision;
        }
        return Merged {
            outcome: MergeOutcome::Unchanged,
            became_terminal: false,
            current: Some(merged),
        };
    }

    let became_terminal = merged.is_terminal() && inner.terminal_seen.insert(id.clone());
    inner.records.insert(id.clone(), merged.clone());
    Merged {
        outcome: MergeOutcome::Updated,
        became_terminal,
        current: Some(merged),
    }
}

fn classify_if_failed(classifier: &FailureClassifier, record: &mut StatusRecord) {
    if record.phase == Phase::Failed && record.failure_category.is_none() {
        record.failure_category = Some(classifier.classify(&record.log_lines));
    }
}

/// Appends the lines of `incoming` that `existing` does not already hold.
/// Identity counts are kept as a multiset so repeated identical lines
/// survive.
fn append_unique(existing: &mut Vec<LogLine>, incoming: Vec<LogLine>) {
    let mut held: HashMap<String, usize> = HashMap::new();
    for line in existing.iter() {
        *held.entry(line.identity()).or_default() += 1;
    }
    for line in incoming {
        match held.get_mut(&line.identity()) {
            Some(count) if *count > 0 => *count -= 1,
            _ => existing.push(line),
        }
    }
}
