//! Action payload (de)serialization for mirroring slices across contexts.
//!
//! Only actions declared with
//! [`SliceBuilder::serial_action`](crate::SliceBuilder::serial_action) carry a
//! codec. The payload type's serde implementation doubles as its schema: a
//! wire payload that does not deserialize into it is rejected.

use std::any::Any;
use std::collections::BTreeMap;
use std::rc::Rc;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::SerializeError;
use crate::slice::{ActionDef, AnySlice};
use crate::transaction::Transaction;

type ParseFn = fn(Value) -> Result<Rc<dyn Any>, serde_json::Error>;

/// `None` when the payload is not of the codec's type.
type SerializeFn = fn(&dyn Any) -> Option<Result<Value, serde_json::Error>>;

/// Wire codec for one action's payload type.
#[derive(Clone, Copy)]
pub(crate) struct PayloadCodec {
    parse: ParseFn,
    serialize: SerializeFn,
}

impl PayloadCodec {
    pub(crate) fn of<P: Serialize + DeserializeOwned + 'static>() -> Self {
        Self {
            parse: |value| {
                let payload: P = serde_json::from_value(value)?;
                let payload: Rc<dyn Any> = Rc::new(payload);
                Ok(payload)
            },
            serialize: |payload| payload.downcast_ref::<P>().map(serde_json::to_value),
        }
    }
}

/// A transaction in wire form.
///
/// # Examples
///
/// ```
/// use slicefold::SerializedTransaction;
///
/// let wire: SerializedTransaction = serde_json::from_str(
///     r#"{"slice_key": "counter", "action_id": "add", "payload": 3}"#,
/// )
/// .unwrap();
/// assert_eq!(wire.payload, serde_json::json!(3));
/// assert!(wire.metadata.is_empty());
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SerializedTransaction {
    /// Target slice key.
    pub slice_key: String,
    /// Action name.
    pub action_id: String,
    /// Payload as JSON.
    pub payload: Value,
    /// Transaction metadata, carried over unchanged.
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

/// Converts transactions of one slice to and from their wire form.
///
/// # Examples
///
/// ```
/// use std::rc::Rc;
/// use slicefold::{ActionSerializer, Slice, StoreState};
///
/// let counter = Slice::builder("counter", 0_i64)
///     .serial_action("add", |n: &Rc<i64>, by: &i64, _: &StoreState| Rc::new(**n + by))
///     .build()
///     .unwrap();
///
/// let serializer = ActionSerializer::new(&counter);
/// assert!(serializer.is_sync_ready());
///
/// let tx = serializer
///     .parse_action_payload("add", serde_json::json!(2))
///     .unwrap();
/// assert_eq!(tx.payload::<i64>(), Some(&2));
/// assert!(serializer.parse_action_payload("add", serde_json::json!("two")).is_err());
/// ```
#[derive(Debug, Clone)]
pub struct ActionSerializer {
    slice: AnySlice,
}

impl ActionSerializer {
    /// A serializer for `slice`'s actions.
    pub fn new(slice: impl Into<AnySlice>) -> Self {
        Self {
            slice: slice.into(),
        }
    }

    /// See [`AnySlice::is_sync_ready`].
    pub fn is_sync_ready(&self) -> bool {
        self.slice.is_sync_ready()
    }

    /// Validate a wire payload and build a transaction for `action_id`.
    ///
    /// # Errors
    ///
    /// - [`SerializeError::UnknownAction`] if the slice has no such action.
    /// - [`SerializeError::NotSerializable`] if the action is not serial.
    /// - [`SerializeError::Parse`] if the payload does not fit the action's
    ///   payload type.
    pub fn parse_action_payload(
        &self,
        action_id: &str,
        payload: Value,
    ) -> Result<Transaction, SerializeError> {
        let codec = self.codec(action_id)?;
        let payload = (codec.parse)(payload).map_err(|source| SerializeError::Parse {
            action: action_id.to_owned(),
            source,
        })?;
        Ok(Transaction::new(self.slice.key(), action_id, payload))
    }

    /// Convert `tx`'s payload to JSON.
    ///
    /// # Errors
    ///
    /// - [`SerializeError::SliceMismatch`] if `tx` targets another slice.
    /// - [`SerializeError::UnknownAction`] or
    ///   [`SerializeError::NotSerializable`] as for parsing.
    /// - [`SerializeError::Serialize`] if serde fails, or the payload is not
    ///   of the action's declared type.
    pub fn serialize_action_payload(&self, tx: &Transaction) -> Result<Value, SerializeError> {
        if tx.slice_key() != self.slice.key() {
            return Err(SerializeError::SliceMismatch {
                expected: self.slice.key().to_owned(),
                found: tx.slice_key().to_owned(),
            });
        }
        let codec = self.codec(tx.action_id())?;
        match (codec.serialize)(tx.raw_payload()) {
            Some(result) => result.map_err(|source| SerializeError::Serialize {
                action: tx.action_id().to_owned(),
                source,
            }),
            None => Err(SerializeError::Serialize {
                action: tx.action_id().to_owned(),
                source: <serde_json::Error as serde::ser::Error>::custom(
                    "payload is not of the action's declared type",
                ),
            }),
        }
    }

    /// `tx` in wire form, metadata included.
    ///
    /// # Errors
    ///
    /// See [`serialize_action_payload`](ActionSerializer::serialize_action_payload).
    pub fn serialize_transaction(
        &self,
        tx: &Transaction,
    ) -> Result<SerializedTransaction, SerializeError> {
        Ok(SerializedTransaction {
            slice_key: tx.slice_key().to_owned(),
            action_id: tx.action_id().to_owned(),
            payload: self.serialize_action_payload(tx)?,
            metadata: tx.metadata_map().clone(),
        })
    }

    /// Rebuild a transaction from wire form, metadata included.
    ///
    /// # Errors
    ///
    /// [`SerializeError::SliceMismatch`] if `wire` targets another slice,
    /// otherwise see [`parse_action_payload`](ActionSerializer::parse_action_payload).
    pub fn parse_transaction(
        &self,
        wire: SerializedTransaction,
    ) -> Result<Transaction, SerializeError> {
        if wire.slice_key != self.slice.key() {
            return Err(SerializeError::SliceMismatch {
                expected: self.slice.key().to_owned(),
                found: wire.slice_key,
            });
        }
        let tx = self.parse_action_payload(&wire.action_id, wire.payload)?;
        Ok(tx.with_metadata(wire.metadata))
    }

    fn codec(&self, action_id: &str) -> Result<PayloadCodec, SerializeError> {
        let def: &ActionDef =
            self.slice
                .action_def(action_id)
                .ok_or_else(|| SerializeError::UnknownAction {
                    slice: self.slice.key().to_owned(),
                    action: action_id.to_owned(),
                })?;
        def.codec.ok_or_else(|| SerializeError::NotSerializable {
            slice: self.slice.key().to_owned(),
            action: action_id.to_owned(),
        })
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::slice::Slice;
    use crate::slice::test_fixtures::num_slice;
    use crate::state::StoreState;
    use crate::transaction::META_STORE_TX_ID;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Move {
        x: i32,
        y: i32,
    }

    fn board() -> Slice<(i32, i32)> {
        Slice::builder("board", (0, 0))
            .serial_action("move", |_: &Rc<(i32, i32)>, m: &Move, _: &StoreState| {
                Rc::new((m.x, m.y))
            })
            .action("reset", |_: &Rc<(i32, i32)>, _: &(), _: &StoreState| Rc::new((0, 0)))
            .build()
            .unwrap()
    }

    #[test]
    fn parse_validates_against_payload_type() {
        let serializer = ActionSerializer::new(&board());
        let tx = serializer
            .parse_action_payload("move", json!({"x": 1, "y": 2}))
            .unwrap();
        assert_eq!(tx.payload::<Move>(), Some(&Move { x: 1, y: 2 }));

        let err = serializer
            .parse_action_payload("move", json!({"x": "left"}))
            .unwrap_err();
        assert!(matches!(err, SerializeError::Parse { ref action, .. } if action == "move"));
    }

    #[test]
    fn non_serial_action_is_rejected() {
        let serializer = ActionSerializer::new(&board());
        assert!(!serializer.is_sync_ready());
        assert!(matches!(
            serializer.parse_action_payload("reset", json!(null)),
            Err(SerializeError::NotSerializable { .. })
        ));
        let reset = board().action("reset", ()).unwrap();
        assert!(matches!(
            serializer.serialize_action_payload(&reset),
            Err(SerializeError::NotSerializable { .. })
        ));
    }

    #[test]
    fn unknown_action_is_rejected() {
        let serializer = ActionSerializer::new(&board());
        assert!(matches!(
            serializer.parse_action_payload("jump", json!(1)),
            Err(SerializeError::UnknownAction { .. })
        ));
    }

    #[test]
    fn serialize_rejects_foreign_slice() {
        let serializer = ActionSerializer::new(&board());
        let tx = num_slice("n", 0).action("set", 1_i64).unwrap();
        let err = serializer.serialize_action_payload(&tx).unwrap_err();
        assert_eq!(
            err.to_string(),
            "transaction for slice \"n\" handed to serializer of slice \"board\""
        );
    }

    #[test]
    fn transaction_survives_the_wire_with_metadata() {
        let slice = board();
        let serializer = ActionSerializer::new(&slice);
        let mut tx = slice.action("move", Move { x: 3, y: 4 }).unwrap();
        tx.set_metadata(META_STORE_TX_ID, "tx_9");

        let wire = serializer.serialize_transaction(&tx).unwrap();
        assert_eq!(wire.payload, json!({"x": 3, "y": 4}));
        let text = serde_json::to_string(&wire).unwrap();

        let parsed = serializer
            .parse_transaction(serde_json::from_str(&text).unwrap())
            .unwrap();
        assert_eq!(parsed.payload::<Move>(), Some(&Move { x: 3, y: 4 }));
        assert_eq!(parsed.id(), Some("tx_9"));

        let state = StoreState::create([slice.erased()]).unwrap();
        let state = state.apply_transaction(&parsed);
        assert_eq!(*slice.get_state(&state).unwrap(), (3, 4));
    }
}
