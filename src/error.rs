//! Crate-level error types for slice construction, store access, and
//! action serialization.

/// Error type returned by effect callbacks.
///
/// Effects are user code, so any error type is accepted. A failing effect is
/// reported to the store's `on_error` hook and does not stall the queue.
pub type EffectError = Box<dyn std::error::Error>;

/// Error returned when defining slices, building a [`StoreState`](crate::StoreState),
/// or creating a transaction from an action name.
///
/// Every variant is raised synchronously at construction time. Messages are
/// deterministic so callers and tests can match on them.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SliceError {
    /// Two registered slices share the same key.
    #[error("duplicate slice key \"{key}\"")]
    DuplicateSlice {
        /// The repeated key.
        key: String,
    },

    /// A slice depends on a key that is not registered at all.
    #[error("slice \"{slice}\" depends on \"{dependency}\", which is not registered")]
    UnregisteredDependency {
        /// The dependent slice.
        slice: String,
        /// The missing dependency.
        dependency: String,
    },

    /// A slice depends on a key that is registered, but after it.
    ///
    /// Registration order must be topological: every dependency comes first.
    #[error("slice \"{slice}\" depends on \"{dependency}\", which must be registered before it")]
    DependencyOutOfOrder {
        /// The dependent slice.
        slice: String,
        /// The dependency registered too late.
        dependency: String,
    },

    /// A slice (transitively) depends on itself.
    #[error("circular dependency: slice \"{slice}\" is reachable from its dependency \"{via}\"")]
    CircularDependency {
        /// The slice being defined.
        slice: String,
        /// The direct dependency through which the cycle closes.
        via: String,
    },

    /// Two actions on one slice share a name.
    #[error("slice \"{slice}\" defines action \"{action}\" more than once")]
    DuplicateAction {
        /// The slice being defined.
        slice: String,
        /// The repeated action name.
        action: String,
    },

    /// The slice has no action with the requested name.
    #[error("slice \"{slice}\" has no action \"{action}\"")]
    UnknownAction {
        /// The slice addressed.
        slice: String,
        /// The requested action name.
        action: String,
    },

    /// The payload handed to an action is not the type its reducer expects.
    #[error("action \"{action}\" on slice \"{slice}\" expects a payload of type {expected}")]
    PayloadType {
        /// The slice addressed.
        slice: String,
        /// The action addressed.
        action: String,
        /// Name of the payload type the reducer was declared with.
        expected: &'static str,
    },

    /// A state override names a slice that is not registered.
    #[error("state override for \"{key}\" does not match any registered slice")]
    UnregisteredOverride {
        /// The override's key.
        key: String,
    },
}

/// Error returned by store operations that address a specific slice.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    /// A [`ReducedStore`](crate::ReducedStore) was asked to read or dispatch
    /// to a slice outside its declared subset.
    #[error("slice \"{slice}\" is not accessible from this view of store \"{store}\"")]
    SliceOutOfScope {
        /// The slice addressed.
        slice: String,
        /// Name of the backing store.
        store: String,
    },

    /// The slice is in scope but has no state in the store.
    #[error("slice \"{slice}\" is not registered in store \"{store}\"")]
    SliceNotRegistered {
        /// The slice addressed.
        slice: String,
        /// Name of the backing store.
        store: String,
    },
}

/// Error returned when (de)serializing action payloads for cross-context sync.
#[derive(Debug, thiserror::Error)]
pub enum SerializeError {
    /// The action exists but was not declared with `serial_action`.
    #[error("action \"{action}\" on slice \"{slice}\" is not serializable")]
    NotSerializable {
        /// The slice addressed.
        slice: String,
        /// The action addressed.
        action: String,
    },

    /// The slice has no action with this name.
    #[error("slice \"{slice}\" has no action \"{action}\"")]
    UnknownAction {
        /// The slice addressed.
        slice: String,
        /// The requested action name.
        action: String,
    },

    /// The transaction targets a different slice than the serializer's.
    #[error("transaction for slice \"{found}\" handed to serializer of slice \"{expected}\"")]
    SliceMismatch {
        /// The serializer's slice key.
        expected: String,
        /// The transaction's slice key.
        found: String,
    },

    /// The wire payload failed validation against the action's payload type.
    #[error("invalid payload for action \"{action}\": {source}")]
    Parse {
        /// The action addressed.
        action: String,
        /// The underlying validation failure.
        #[source]
        source: serde_json::Error,
    },

    /// The payload could not be converted to its wire form.
    #[error("failed to serialize payload for action \"{action}\": {source}")]
    Serialize {
        /// The action addressed.
        action: String,
        /// The underlying serialization failure.
        #[source]
        source: serde_json::Error,
    },
}
