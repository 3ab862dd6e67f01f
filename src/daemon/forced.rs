//! Registry of on-demand compactions keyed by `(kind, name)`.

use std::collections::HashMap;

use crate::process::{ExitReason, LinkedProcess, ProcessId};

/// Completion callback invoked with the final exit reason of a forced run.
pub type Continuation = Box<dyn FnOnce(ExitReason) + Send + Sync + 'static>;

/// What a forced registration targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum ForcedKind {
    /// Whole bucket: data files plus every index group.
    Bucket,
    /// Whole bucket with eager tombstone purging.
    BucketPurge,
    /// Data files only.
    Db,
    /// One index group.
    View,
    /// Data files, dropping a caller-supplied set of obsolete keys.
    DbPartial,
}

impl ForcedKind {
    pub(crate) fn label(self) -> &'static str {
        match self {
            ForcedKind::Bucket => "bucket",
            ForcedKind::BucketPurge => "bucket-purge",
            ForcedKind::Db => "db",
            ForcedKind::View => "view",
            ForcedKind::DbPartial => "db-partial",
        }
    }
}

/// Registry key; at most one registration may exist per key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) struct ForcedKey {
    pub(crate) kind: ForcedKind,
    pub(crate) name: String,
}

/// A live forced compaction and the continuations waiting on it.
pub(crate) struct ForcedEntry {
    pub(crate) process: LinkedProcess,
    /// Pending continuations in arrival order, keyed by caller-supplied id.
    pub(crate) continuations: Vec<(String, Continuation)>,
}

/// All in-flight forced compactions.
#[derive(Default)]
pub(crate) struct ForcedRegistry {
    entries: HashMap<ForcedKey, ForcedEntry>,
}

impl ForcedRegistry {
    pub(crate) fn contains(&self, key: &ForcedKey) -> bool {
        self.entries.contains_key(key)
    }

    pub(crate) fn get(&self, key: &ForcedKey) -> Option<&ForcedEntry> {
        self.entries.get(key)
    }

    pub(crate) fn insert(&mut self, key: ForcedKey, entry: ForcedEntry) {
        debug_assert!(!self.entries.contains_key(&key));
        self.entries.insert(key, entry);
    }

    /// Append a continuation to an existing registration. A repeated
    /// continuation id replaces that caller's callback instead of queueing a
    /// duplicate. Returns `false` when no registration exists for `key`.
    pub(crate) fn append_continuation(
        &mut self,
        key: &ForcedKey,
        id: String,
        continuation: Continuation,
    ) -> bool {
        let Some(entry) = self.entries.get_mut(key) else {
            return false;
        };
        if let Some(slot) = entry.continuations.iter_mut().find(|(cid, _)| *cid == id) {
            slot.1 = continuation;
        } else {
            entry.continuations.push((id, continuation));
        }
        true
    }

    /// Remove the registration for `key`, but only if its process identity
    /// matches; a mismatch leaves the registry untouched.
    pub(crate) fn remove_matching(
        &mut self,
        key: &ForcedKey,
        id: ProcessId,
    ) -> Option<ForcedEntry> {
        let matches = self
            .entries
            .get(key)
            .map(|entry| entry.process.id() == id)
            .unwrap_or(false);
        if !matches {
            return None;
        }
        self.entries.remove(key)
    }

    /// Take every registration, leaving the registry empty.
    pub(crate) fn drain(&mut self) -> Vec<(ForcedKey, ForcedEntry)> {
        self.entries.drain().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::spawn_linked;

    fn dummy_process() -> (LinkedProcess, flume::Receiver<ExitReason>) {
        let (tx, rx) = flume::unbounded();
        let process = spawn_linked(
            tx,
            |_id, reason| reason,
            |cancel| async move {
                cancel.cancelled().await;
                ExitReason::Shutdown
            },
        );
        (process, rx)
    }

    #[tokio::test]
    async fn continuations_append_and_replace_by_id() {
        let mut registry = ForcedRegistry::default();
        let key = ForcedKey {
            kind: ForcedKind::DbPartial,
            name: "travel".to_string(),
        };
        let (process, _rx) = dummy_process();
        registry.insert(
            key.clone(),
            ForcedEntry {
                process,
                continuations: vec![("a".to_string(), Box::new(|_| {}))],
            },
        );

        assert!(registry.append_continuation(&key, "b".to_string(), Box::new(|_| {})));
        assert!(registry.append_continuation(&key, "a".to_string(), Box::new(|_| {})));
        let entry = registry.get(&key).expect("entry");
        assert_eq!(entry.continuations.len(), 2);

        let missing = ForcedKey {
            kind: ForcedKind::Db,
            name: "travel".to_string(),
        };
        assert!(!registry.append_continuation(&missing, "c".to_string(), Box::new(|_| {})));
    }

    #[tokio::test]
    async fn remove_requires_a_matching_process_identity() {
        let mut registry = ForcedRegistry::default();
        let key = ForcedKey {
            kind: ForcedKind::Bucket,
            name: "travel".to_string(),
        };
        let (process, _rx) = dummy_process();
        let id = process.id();
        registry.insert(
            key.clone(),
            ForcedEntry {
                process,
                continuations: Vec::new(),
            },
        );

        let (stranger, _rx2) = dummy_process();
        assert!(registry.remove_matching(&key, stranger.id()).is_none());
        assert!(registry.contains(&key));
        assert!(registry.remove_matching(&key, id).is_some());
        assert!(!registry.contains(&key));
    }
}
