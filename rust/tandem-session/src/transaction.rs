//! Batched context mutations.

use std::collections::BTreeMap;

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::context::{Key, SessionContext};
use crate::error::SessionError;
use crate::update::{ContextUpdateRequest, ItemUpdate};

/// Reads and writes staged against one replica.
///
/// The first access to a key records the revision the transaction builds
/// on. Reads see the transaction's own writes. Nothing is visible to the
/// context until the whole batch is accepted.
pub struct Transaction<'c> {
    context: &'c SessionContext,
    touched: BTreeMap<String, ItemUpdate>,
}

impl<'c> Transaction<'c> {
    pub(crate) fn new(context: &'c SessionContext) -> Self {
        Self {
            context,
            touched: BTreeMap::new(),
        }
    }

    /// Revision the context held for `name` when the transaction first saw it.
    fn base_revision(&self, name: &str) -> Option<u64> {
        match self.touched.get(name) {
            Some(update) => update.old_revision(),
            None => self.context.revision(name),
        }
    }

    pub fn get<V: DeserializeOwned>(&mut self, key: &Key<V>) -> Result<Option<V>, SessionError> {
        let format = self.context.format();
        match self.touched.get(key.name()) {
            Some(ItemUpdate::Set { value, .. }) => return Ok(Some(format.deserialize(value)?)),
            Some(ItemUpdate::Remove { .. }) => return Ok(None),
            Some(ItemUpdate::Required { .. }) | None => {}
        }
        let entry = self.context.entry(key.name());
        let old_revision = entry.as_ref().map(|entry| entry.revision);
        self.touched
            .entry(key.name().to_string())
            .or_insert(ItemUpdate::Required { old_revision });
        match entry.and_then(|entry| entry.value) {
            Some(value) => Ok(Some(format.deserialize(&value)?)),
            None => Ok(None),
        }
    }

    pub fn set<V: Serialize>(&mut self, key: &Key<V>, value: &V) -> Result<(), SessionError> {
        let value = self.context.format().serialize(value)?;
        let old_revision = self.base_revision(key.name());
        self.touched
            .insert(key.name().to_string(), ItemUpdate::Set { old_revision, value });
        Ok(())
    }

    pub fn remove<V>(&mut self, key: &Key<V>) {
        let old_revision = self.base_revision(key.name());
        self.touched
            .insert(key.name().to_string(), ItemUpdate::Remove { old_revision });
    }

    pub(crate) fn into_request(self) -> ContextUpdateRequest {
        ContextUpdateRequest {
            updates: self.touched.into_iter().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tandem_wire::SerializationFormat;

    const THEME: Key<String> = Key::new("theme");
    const FONT: Key<String> = Key::new("font");

    fn seeded() -> SessionContext {
        let ctx = SessionContext::new(SerializationFormat::Json);
        let mut tx = Transaction::new(&ctx);
        tx.set(&THEME, &"system".to_string()).unwrap();
        assert!(ctx.try_commit(&tx.into_request()).is_accepted());
        ctx
    }

    #[test]
    fn reads_record_their_revision() {
        let ctx = seeded();
        let mut tx = Transaction::new(&ctx);
        assert_eq!(tx.get(&THEME).unwrap().as_deref(), Some("system"));
        assert_eq!(tx.get(&FONT).unwrap(), None);
        let request = tx.into_request();
        assert_eq!(
            request.updates,
            vec![
                ("font".to_string(), ItemUpdate::Required { old_revision: None }),
                (
                    "theme".to_string(),
                    ItemUpdate::Required {
                        old_revision: Some(0)
                    }
                ),
            ]
        );
        assert!(!request.has_mutations());
    }

    #[test]
    fn writes_are_visible_inside_the_transaction_only() {
        let ctx = seeded();
        let mut tx = Transaction::new(&ctx);
        tx.get(&THEME).unwrap();
        tx.set(&THEME, &"dark".to_string()).unwrap();
        assert_eq!(tx.get(&THEME).unwrap().as_deref(), Some("dark"));
        assert_eq!(ctx.get(&THEME).unwrap().unwrap().value, "system");

        let request = tx.into_request();
        let (_, update) = &request.updates[0];
        assert_eq!(update.old_revision(), Some(0));
        assert!(ctx.try_commit(&request).is_accepted());
        assert_eq!(ctx.get(&THEME).unwrap().unwrap().revision, 1);
    }

    #[test]
    fn removing_then_reading_sees_nothing() {
        let ctx = seeded();
        let mut tx = Transaction::new(&ctx);
        tx.remove(&THEME);
        assert_eq!(tx.get(&THEME).unwrap(), None);
        let request = tx.into_request();
        assert_eq!(
            request.updates,
            vec![(
                "theme".to_string(),
                ItemUpdate::Remove {
                    old_revision: Some(0)
                }
            )]
        );
    }
}
