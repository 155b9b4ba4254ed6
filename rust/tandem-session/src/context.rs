//! Replicated key/value context.

use std::collections::BTreeMap;
use std::fmt;
use std::marker::PhantomData;

use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use tandem_wire::{SerializationFormat, SerializedPayload};
use tracing::trace;

use crate::error::SessionError;
use crate::update::{ContextUpdateRequest, ContextUpdateResult, ItemUpdate, RejectReason};

/// Typed name of a context entry.
pub struct Key<V> {
    name: &'static str,
    _value: PhantomData<fn() -> V>,
}

impl<V> Key<V> {
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            _value: PhantomData,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}

impl<V> Clone for Key<V> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<V> Copy for Key<V> {}

impl<V> fmt::Debug for Key<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Key").field(&self.name).finish()
    }
}

/// A value together with the revision it was stored at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Item<V> {
    pub revision: u64,
    pub value: V,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Entry {
    pub(crate) revision: u64,
    /// `None` for a removed key.
    pub(crate) value: Option<SerializedPayload>,
}

/// One side's replica of the session context.
///
/// Values are stored serialized in the connection's format and decoded on
/// access.
pub struct SessionContext {
    format: SerializationFormat,
    entries: Mutex<BTreeMap<String, Entry>>,
}

impl fmt::Debug for SessionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionContext")
            .field("format", &self.format)
            .field("keys", &self.keys())
            .finish()
    }
}

impl SessionContext {
    pub fn new(format: SerializationFormat) -> Self {
        Self {
            format,
            entries: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn format(&self) -> SerializationFormat {
        self.format
    }

    pub fn get<V: DeserializeOwned>(&self, key: &Key<V>) -> Result<Option<Item<V>>, SessionError> {
        let entry = self.entries.lock().get(key.name()).cloned();
        match entry {
            Some(Entry {
                revision,
                value: Some(value),
            }) => Ok(Some(Item {
                revision,
                value: self.format.deserialize(&value)?,
            })),
            _ => Ok(None),
        }
    }

    /// Current revision of a key, tombstones included.
    pub fn revision(&self, name: &str) -> Option<u64> {
        self.entries.lock().get(name).map(|entry| entry.revision)
    }

    pub fn contains(&self, name: &str) -> bool {
        matches!(self.entries.lock().get(name), Some(Entry { value: Some(_), .. }))
    }

    /// Names of the keys holding a value.
    pub fn keys(&self) -> Vec<String> {
        self.entries
            .lock()
            .iter()
            .filter(|(_, entry)| entry.value.is_some())
            .map(|(name, _)| name.clone())
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().values().all(|entry| entry.value.is_none())
    }

    /// Drop every entry, tombstones included.
    pub fn clear(&self) {
        self.entries.lock().clear();
    }

    pub(crate) fn entry(&self, name: &str) -> Option<Entry> {
        self.entries.lock().get(name).cloned()
    }

    /// Validate `request` against this replica and commit it if every assumed
    /// revision matches.
    pub(crate) fn try_commit(&self, request: &ContextUpdateRequest) -> ContextUpdateResult {
        let mut entries = self.entries.lock();
        let reasons: Vec<(String, RejectReason)> = request
            .updates
            .iter()
            .filter_map(|(name, update)| {
                let current = entries.get(name);
                let current_revision = current.map(|entry| entry.revision);
                if current_revision == update.old_revision() {
                    return None;
                }
                let reason = match current {
                    Some(Entry {
                        revision,
                        value: Some(value),
                    }) => RejectReason::Updated {
                        revision: *revision,
                        value: value.clone(),
                    },
                    _ => RejectReason::Removed {
                        revision: current_revision,
                    },
                };
                Some((name.clone(), reason))
            })
            .collect();
        if !reasons.is_empty() {
            trace!(rejected = reasons.len(), "update rejected");
            return ContextUpdateResult::Rejected { reasons };
        }
        apply_to(&mut entries, request);
        ContextUpdateResult::Accepted
    }

    /// Apply an accepted request, keeping whatever is already newer here.
    pub(crate) fn apply(&self, request: &ContextUpdateRequest) {
        apply_to(&mut self.entries.lock(), request);
    }

    /// Take over the authoritative state sent along with a rejection.
    pub(crate) fn reconcile(&self, reasons: Vec<(String, RejectReason)>) {
        let mut entries = self.entries.lock();
        for (name, reason) in reasons {
            match reason {
                RejectReason::Updated { revision, value } => {
                    entries.insert(
                        name,
                        Entry {
                            revision,
                            value: Some(value),
                        },
                    );
                }
                RejectReason::Removed {
                    revision: Some(revision),
                } => {
                    entries.insert(
                        name,
                        Entry {
                            revision,
                            value: None,
                        },
                    );
                }
                RejectReason::Removed { revision: None } => {
                    entries.remove(&name);
                }
            }
        }
    }
}

fn apply_to(entries: &mut BTreeMap<String, Entry>, request: &ContextUpdateRequest) {
    for (name, update) in &request.updates {
        let value = match update {
            ItemUpdate::Required { .. } => continue,
            ItemUpdate::Set { value, .. } => Some(value.clone()),
            ItemUpdate::Remove { .. } => None,
        };
        let Some(revision) = update.new_revision() else {
            continue;
        };
        match entries.get(name) {
            Some(existing) if existing.revision >= revision => {
                trace!(key = %name, revision, "stale update ignored");
            }
            _ => {
                entries.insert(name.clone(), Entry { revision, value });
            }
        }
    }
}
