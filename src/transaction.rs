//! Transactions: one pending state change addressed to one slice.

use std::any::Any;
use std::collections::BTreeMap;
use std::fmt;
use std::rc::Rc;

/// Metadata key holding the name of the store that dispatched the transaction.
pub const META_STORE_NAME: &str = "storeName";

/// Metadata key holding the per-store transaction id (`tx_1`, `tx_2`, ...).
pub const META_STORE_TX_ID: &str = "storeTxId";

/// Metadata key recording who dispatched the transaction. Effects append
/// `effect:<slice>/<effect>` here; hosts may append their own markers.
pub const META_ORIGIN: &str = "origin";

/// An immutable description of one state change: slice, action, payload.
///
/// Only the metadata map is mutable, and entries are only ever added or
/// overwritten, never removed. Transactions are created by
/// [`Slice::action`](crate::Slice::action) or parsed by an
/// [`ActionSerializer`](crate::ActionSerializer).
#[derive(Clone)]
pub struct Transaction {
    slice_key: String,
    action_id: String,
    payload: Rc<dyn Any>,
    metadata: BTreeMap<String, String>,
}

impl Transaction {
    pub(crate) fn new(
        slice_key: impl Into<String>,
        action_id: impl Into<String>,
        payload: Rc<dyn Any>,
    ) -> Self {
        Self {
            slice_key: slice_key.into(),
            action_id: action_id.into(),
            payload,
            metadata: BTreeMap::new(),
        }
    }

    /// Key of the slice this transaction targets.
    pub fn slice_key(&self) -> &str {
        &self.slice_key
    }

    /// Name of the action to apply.
    pub fn action_id(&self) -> &str {
        &self.action_id
    }

    /// The payload, if it is of type `P`.
    pub fn payload<P: 'static>(&self) -> Option<&P> {
        self.payload.downcast_ref::<P>()
    }

    pub(crate) fn raw_payload(&self) -> &dyn Any {
        &*self.payload
    }

    /// Set a metadata entry, overwriting any previous value.
    pub fn set_metadata(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.metadata.insert(key.into(), value.into());
    }

    /// Append to a metadata entry, comma-separating it from any previous
    /// value.
    ///
    /// # Examples
    ///
    /// ```
    /// # use std::rc::Rc;
    /// # use slicefold::{Slice, StoreState};
    /// # let slice = Slice::builder("s", ())
    /// #     .action("noop", |s: &Rc<()>, _: &(), _: &StoreState| Rc::clone(s))
    /// #     .build()
    /// #     .unwrap();
    /// let mut tx = slice.action("noop", ()).unwrap();
    /// tx.append_metadata("origin", "ui");
    /// tx.append_metadata("origin", "undo");
    /// assert_eq!(tx.metadata("origin"), Some("ui,undo"));
    /// ```
    pub fn append_metadata(&mut self, key: impl Into<String>, value: impl AsRef<str>) {
        let entry = self.metadata.entry(key.into()).or_default();
        if !entry.is_empty() {
            entry.push(',');
        }
        entry.push_str(value.as_ref());
    }

    /// A metadata value.
    pub fn metadata(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).map(String::as_str)
    }

    /// Every metadata entry.
    pub fn metadata_map(&self) -> &BTreeMap<String, String> {
        &self.metadata
    }

    /// The per-store transaction id, once the transaction has been dispatched.
    pub fn id(&self) -> Option<&str> {
        self.metadata(META_STORE_TX_ID)
    }

    pub(crate) fn with_metadata(mut self, metadata: BTreeMap<String, String>) -> Self {
        self.metadata.extend(metadata);
        self
    }
}

impl fmt::Debug for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transaction")
            .field("slice_key", &self.slice_key)
            .field("action_id", &self.action_id)
            .field("metadata", &self.metadata)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tx() -> Transaction {
        Transaction::new("slice", "act", Rc::new(7_u32))
    }

    #[test]
    fn payload_downcasts_to_declared_type_only() {
        let tx = tx();
        assert_eq!(tx.payload::<u32>(), Some(&7));
        assert_eq!(tx.payload::<i64>(), None);
    }

    #[test]
    fn set_metadata_overwrites() {
        let mut tx = tx();
        tx.set_metadata(META_STORE_NAME, "a");
        tx.set_metadata(META_STORE_NAME, "b");
        assert_eq!(tx.metadata(META_STORE_NAME), Some("b"));
    }

    #[test]
    fn append_metadata_joins_values() {
        let mut tx = tx();
        tx.append_metadata(META_ORIGIN, "first");
        tx.append_metadata(META_ORIGIN, "second");
        assert_eq!(tx.metadata(META_ORIGIN), Some("first,second"));
    }

    #[test]
    fn id_reads_store_tx_id() {
        let mut tx = tx();
        assert_eq!(tx.id(), None);
        tx.set_metadata(META_STORE_TX_ID, "tx_3");
        assert_eq!(tx.id(), Some("tx_3"));
    }

    #[test]
    fn debug_omits_payload() {
        let rendered = format!("{:?}", tx());
        assert!(rendered.contains("slice_key: \"slice\""));
        assert!(rendered.contains(".."));
    }
}
