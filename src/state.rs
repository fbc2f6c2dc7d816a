//! Immutable, structurally shared store snapshots.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::rc::Rc;

use crate::error::SliceError;
use crate::slice::{AnySlice, ErasedState, Slice};
use crate::transaction::Transaction;

/// Replacement initial state for one slice, used by
/// [`StoreState::create_with_overrides`].
pub struct StateOverride {
    key: String,
    state: ErasedState,
}

impl StateOverride {
    /// Start `slice` from `state` instead of its declared initial state.
    pub fn new<S: 'static>(slice: &Slice<S>, state: S) -> Self {
        Self {
            key: slice.key().to_owned(),
            state: Rc::new(state),
        }
    }
}

/// An immutable snapshot of every registered slice's state.
///
/// Cloning is a pointer copy. [`apply_transaction`](StoreState::apply_transaction)
/// never mutates: it returns either this same snapshot or a fork that shares
/// every untouched slice's state `Rc` with its predecessor. Compare snapshots
/// with [`StoreState::ptr_eq`].
#[derive(Clone)]
pub struct StoreState {
    inner: Rc<StoreStateInner>,
}

struct StoreStateInner {
    slices: Rc<[AnySlice]>,
    states: HashMap<String, ErasedState>,
}

impl StoreState {
    /// Build the initial snapshot from slices in registration order.
    ///
    /// # Errors
    ///
    /// - [`SliceError::DuplicateSlice`] if two slices share a key.
    /// - [`SliceError::UnregisteredDependency`] if a dependency is missing.
    /// - [`SliceError::DependencyOutOfOrder`] if a dependency is registered
    ///   after the slice that needs it.
    pub fn create(slices: impl IntoIterator<Item = AnySlice>) -> Result<Self, SliceError> {
        Self::create_with_overrides(slices, [])
    }

    /// Like [`create`](StoreState::create), replacing the initial state of
    /// the slices named by `overrides`.
    ///
    /// # Errors
    ///
    /// Everything [`create`](StoreState::create) returns, plus
    /// [`SliceError::UnregisteredOverride`] for an override whose slice is
    /// not in `slices`.
    pub fn create_with_overrides(
        slices: impl IntoIterator<Item = AnySlice>,
        overrides: impl IntoIterator<Item = StateOverride>,
    ) -> Result<Self, SliceError> {
        let slices: Rc<[AnySlice]> = slices.into_iter().collect();
        validate_registration(&slices)?;

        let mut states: HashMap<String, ErasedState> = slices
            .iter()
            .map(|slice| {
                (
                    slice.key().to_owned(),
                    Rc::clone(slice.slice_key().init_state()),
                )
            })
            .collect();

        for o in overrides {
            match states.get_mut(&o.key) {
                Some(state) => *state = o.state,
                None => return Err(SliceError::UnregisteredOverride { key: o.key }),
            }
        }

        Ok(Self {
            inner: Rc::new(StoreStateInner { slices, states }),
        })
    }

    /// Apply `tx`, returning the next snapshot.
    ///
    /// Returns this same snapshot (pointer-equal) when no registered slice
    /// matches `tx`, when the slice has no such action, or when the reducer
    /// hands back the identical state `Rc`. Unregistered slices are tolerated
    /// so optional slices can be composed freely.
    pub fn apply_transaction(&self, tx: &Transaction) -> StoreState {
        let Some(slice) = self.slice(tx.slice_key()) else {
            tracing::trace!(slice = tx.slice_key(), "transaction for unregistered slice ignored");
            return self.clone();
        };
        let Some(action) = slice.action_def(tx.action_id()) else {
            tracing::warn!(
                slice = tx.slice_key(),
                action = tx.action_id(),
                "transaction names an unknown action, ignoring"
            );
            return self.clone();
        };
        let Some(current) = self.inner.states.get(slice.key()) else {
            return self.clone();
        };

        let Some(next) = (action.reducer)(current, tx.raw_payload(), self) else {
            // Slice state or payload has a different type than the reducer
            // was declared with (e.g. a mistyped override).
            tracing::warn!(
                slice = tx.slice_key(),
                action = tx.action_id(),
                "reducer skipped: state or payload type mismatch"
            );
            return self.clone();
        };

        if Rc::ptr_eq(&next, current) {
            return self.clone();
        }

        let mut states = self.inner.states.clone();
        states.insert(slice.key().to_owned(), next);
        StoreState {
            inner: Rc::new(StoreStateInner {
                slices: Rc::clone(&self.inner.slices),
                states,
            }),
        }
    }

    /// Registered slices, in registration order.
    pub fn slices(&self) -> &[AnySlice] {
        &self.inner.slices
    }

    /// The registered slice with this key.
    pub fn slice(&self, key: &str) -> Option<&AnySlice> {
        self.inner.slices.iter().find(|s| s.key() == key)
    }

    /// The type-erased state of the slice with this key.
    pub fn get_slice_state(&self, key: &str) -> Option<&ErasedState> {
        self.inner.states.get(key)
    }

    /// The typed state of `slice`, or `None` if it is not registered.
    pub fn get<S: 'static>(&self, slice: &Slice<S>) -> Option<Rc<S>> {
        let state = self.get_slice_state(slice.key())?;
        Rc::clone(state).downcast::<S>().ok()
    }

    /// Whether two handles refer to the very same snapshot.
    pub fn ptr_eq(a: &StoreState, b: &StoreState) -> bool {
        Rc::ptr_eq(&a.inner, &b.inner)
    }
}

impl fmt::Debug for StoreState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoreState")
            .field(
                "slices",
                &self.inner.slices.iter().map(AnySlice::key).collect::<Vec<_>>(),
            )
            .finish_non_exhaustive()
    }
}

/// Check that keys are unique and every dependency is registered earlier.
fn validate_registration(slices: &[AnySlice]) -> Result<(), SliceError> {
    let mut all = HashSet::with_capacity(slices.len());
    for slice in slices {
        if !all.insert(slice.key()) {
            return Err(SliceError::DuplicateSlice {
                key: slice.key().to_owned(),
            });
        }
    }

    let mut seen = HashSet::with_capacity(slices.len());
    for slice in slices {
        for dep in slice.slice_key().dependencies() {
            if seen.contains(dep.key()) {
                continue;
            }
            let err = if all.contains(dep.key()) {
                SliceError::DependencyOutOfOrder {
                    slice: slice.key().to_owned(),
                    dependency: dep.key().to_owned(),
                }
            } else {
                SliceError::UnregisteredDependency {
                    slice: slice.key().to_owned(),
                    dependency: dep.key().to_owned(),
                }
            };
            return Err(err);
        }
        seen.insert(slice.key());
    }
    Ok(())
}
