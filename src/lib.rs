//! Slice-based reactive state store.
//!
//! State is split into [`Slice`]s: named units with their own reducers,
//! selectors, and effects, optionally depending on other slices. A [`Store`]
//! holds an immutable [`StoreState`] snapshot, applies dispatched
//! [`Transaction`]s, and drains the effects made stale by each change in two
//! phases: sync effects in a microtask, deferred effects through a pluggable
//! [`Scheduler`].
//!
//! Everything is single-threaded. Stores with effects must be driven from a
//! [`tokio::task::LocalSet`].

mod effect;
mod error;
mod graph;
mod scheduler;
mod serial;
mod side_effects;
mod slice;
mod state;
mod store;
mod transaction;

pub use effect::{Effect, EffectInfo, EffectPhase};
pub use error::{EffectError, SerializeError, SliceError, StoreError};
pub use graph::{
    DependencyMap, calc_dependencies, calc_reverse_dependencies, flatten_reverse_dependencies,
};
pub use scheduler::{
    IdleScheduler, ImmediateScheduler, ScheduleToken, Scheduler, SchedulerConfig, Task,
    TimeoutScheduler,
};
pub use serial::{ActionSerializer, SerializedTransaction};
pub use side_effects::{DebugHook, ErrorHook};
pub use slice::{
    AnySlice, ErasedState, ON_READY_ACTION, Picker, ResolvedState, Slice, SliceBuilder,
    SliceConfig, SliceKey,
};
pub use state::{StateOverride, StoreState};
pub use store::{DispatchTx, ReducedStore, Store, StoreBuilder, StoreConfig, default_dispatch_tx};
pub use transaction::{META_ORIGIN, META_STORE_NAME, META_STORE_TX_ID, Transaction};
