//! Slice descriptors: keys, actions, selectors, and effects.
//!
//! A [`Slice`] is a named unit of state with its own reducers and optional
//! dependencies on other slices. Slices are plain immutable descriptors,
//! created once and shared by any number of stores.

use std::any::{Any, TypeId};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::marker::PhantomData;
use std::rc::Rc;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::effect::{Effect, ErasedEffect};
use crate::error::SliceError;
use crate::serial::PayloadCodec;
use crate::state::StoreState;
use crate::transaction::Transaction;

/// Name of the reserved action dispatched once on every slice that defines
/// it, right after its store is built.
pub const ON_READY_ACTION: &str = "@on-ready";

/// Type-erased per-slice state as held by a [`StoreState`].
pub type ErasedState = Rc<dyn Any>;

/// Reducer after erasure. Returns `None` when the state or payload is not of
/// the type the reducer was declared with.
type ErasedReducer = Rc<dyn Fn(&ErasedState, &dyn Any, &StoreState) -> Option<ErasedState>>;

type ErasedSelector = Rc<dyn Fn(&ErasedState, &StoreState) -> Option<Rc<dyn Any>>>;

/// Static configuration attached to a slice.
///
/// # Examples
///
/// ```
/// use slicefold::SliceConfig;
///
/// let config: SliceConfig = serde_json::from_str(r#"{"log_transactions": true}"#).unwrap();
/// assert!(config.log_transactions);
/// assert_eq!(config.description, None);
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SliceConfig {
    /// Human-readable description, shown in debug output.
    pub description: Option<String>,
    /// Emit a `tracing` debug event for every state change of this slice.
    pub log_transactions: bool,
}

#[derive(Clone)]
struct SelectorDef {
    name: String,
    compute: ErasedSelector,
}

/// The static identity of a slice: key, initial state, dependencies, and
/// selectors.
///
/// Cloning is cheap; all clones share one allocation.
#[derive(Clone)]
pub struct SliceKey {
    inner: Rc<SliceKeyInner>,
}

struct SliceKeyInner {
    key: String,
    dependencies: Vec<SliceKey>,
    init_state: ErasedState,
    selectors: Vec<SelectorDef>,
    fingerprint: String,
    flat_dependencies: BTreeSet<String>,
}

impl SliceKey {
    /// The globally unique slice key.
    pub fn key(&self) -> &str {
        &self.inner.key
    }

    /// Direct dependencies, in declaration order.
    pub fn dependencies(&self) -> &[SliceKey] {
        &self.inner.dependencies
    }

    /// Structural signature of this slice's position in the dependency DAG.
    ///
    /// `key` for a slice without dependencies, otherwise
    /// `key(dep1,dep2,...)` with each dependency's own fingerprint.
    pub fn fingerprint(&self) -> &str {
        &self.inner.fingerprint
    }

    /// Every key this slice depends on, directly or transitively.
    pub fn flat_dependencies(&self) -> &BTreeSet<String> {
        &self.inner.flat_dependencies
    }

    pub(crate) fn init_state(&self) -> &ErasedState {
        &self.inner.init_state
    }
}

impl fmt::Debug for SliceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SliceKey")
            .field("key", &self.inner.key)
            .field("fingerprint", &self.inner.fingerprint)
            .finish_non_exhaustive()
    }
}

/// One named action: its reducer plus the optional wire codec that makes it
/// serializable.
pub(crate) struct ActionDef {
    pub(crate) name: String,
    pub(crate) payload_type: TypeId,
    pub(crate) payload_type_name: &'static str,
    pub(crate) reducer: ErasedReducer,
    pub(crate) codec: Option<PayloadCodec>,
}

pub(crate) struct SliceSpec {
    key: SliceKey,
    actions: Vec<ActionDef>,
    effects: Vec<ErasedEffect>,
    config: SliceConfig,
}

/// A slice with its state type erased, as registered in a store.
///
/// Obtained from a typed slice via [`Slice::erased`] or `AnySlice::from(&slice)`.
#[derive(Clone)]
pub struct AnySlice {
    spec: Rc<SliceSpec>,
}

impl AnySlice {
    /// The slice key string.
    pub fn key(&self) -> &str {
        self.spec.key.key()
    }

    /// The static slice descriptor.
    pub fn slice_key(&self) -> &SliceKey {
        &self.spec.key
    }

    /// See [`SliceKey::fingerprint`].
    pub fn fingerprint(&self) -> &str {
        self.spec.key.fingerprint()
    }

    /// Static configuration of this slice.
    pub fn config(&self) -> &SliceConfig {
        &self.spec.config
    }

    /// Names of every action, in declaration order.
    pub fn action_names(&self) -> impl Iterator<Item = &str> {
        self.spec.actions.iter().map(|a| a.name.as_str())
    }

    /// `true` iff every action on this slice can be (de)serialized.
    ///
    /// A receiver mirroring this slice must be able to replay any transaction
    /// dispatched to it, so one non-serial action makes the whole slice
    /// unsafe to sync.
    pub fn is_sync_ready(&self) -> bool {
        self.spec.actions.iter().all(|a| a.codec.is_some())
    }

    /// Whether this slice defines the reserved on-ready action.
    pub fn has_on_ready(&self) -> bool {
        self.action_def(ON_READY_ACTION).is_some()
    }

    /// Identity comparison: both handles refer to the same definition.
    pub fn ptr_eq(a: &AnySlice, b: &AnySlice) -> bool {
        Rc::ptr_eq(&a.spec, &b.spec)
    }

    pub(crate) fn action_def(&self, name: &str) -> Option<&ActionDef> {
        self.spec.actions.iter().find(|a| a.name == name)
    }

    pub(crate) fn effects(&self) -> &[ErasedEffect] {
        &self.spec.effects
    }

    pub(crate) fn on_ready_transaction(&self) -> Option<Transaction> {
        self.has_on_ready()
            .then(|| Transaction::new(self.key(), ON_READY_ACTION, Rc::new(())))
    }
}

impl fmt::Debug for AnySlice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Slice")
            .field("key", &self.key())
            .field("fingerprint", &self.fingerprint())
            .field("actions", &self.action_names().collect::<Vec<_>>())
            .field("effects", &self.spec.effects.len())
            .finish()
    }
}

impl<S: 'static> From<&Slice<S>> for AnySlice {
    fn from(slice: &Slice<S>) -> Self {
        slice.erased()
    }
}

/// A typed slice definition with state of type `S`.
///
/// Built with [`Slice::builder`]. Actions never run their reducer directly:
/// [`Slice::action`] only creates a [`Transaction`], and the reducer runs when
/// a store applies it.
///
/// # Examples
///
/// ```
/// use std::rc::Rc;
/// use slicefold::{Slice, StoreState};
///
/// let counter = Slice::builder("counter", 0_i64)
///     .action("add", |n: &Rc<i64>, by: &i64, _: &StoreState| Rc::new(**n + by))
///     .build()
///     .unwrap();
///
/// let state = StoreState::create([counter.erased()]).unwrap();
/// let state = state.apply_transaction(&counter.action("add", 5_i64).unwrap());
/// assert_eq!(*counter.get_state(&state).unwrap(), 5);
/// ```
pub struct Slice<S> {
    any: AnySlice,
    _state: PhantomData<fn() -> S>,
}

impl<S> Clone for Slice<S> {
    fn clone(&self) -> Self {
        Self {
            any: self.any.clone(),
            _state: PhantomData,
        }
    }
}

impl<S> fmt::Debug for Slice<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.any, f)
    }
}

impl<S: 'static> Slice<S> {
    /// Start defining a slice with the given key and initial state.
    pub fn builder(key: impl Into<String>, init_state: S) -> SliceBuilder<S> {
        SliceBuilder {
            key: key.into(),
            init_state: Rc::new(init_state),
            dependencies: Vec::new(),
            actions: Vec::new(),
            selectors: Vec::new(),
            effects: Vec::new(),
            config: SliceConfig::default(),
            duplicate_action: None,
        }
    }

    /// Re-type an erased handle. Only sound when the state type is `S`,
    /// which every caller guarantees by construction.
    pub(crate) fn from_erased(any: AnySlice) -> Self {
        Self {
            any,
            _state: PhantomData,
        }
    }

    /// The slice key string.
    pub fn key(&self) -> &str {
        self.any.key()
    }

    /// The static slice descriptor.
    pub fn slice_key(&self) -> &SliceKey {
        self.any.slice_key()
    }

    /// See [`SliceKey::fingerprint`].
    pub fn fingerprint(&self) -> &str {
        self.any.fingerprint()
    }

    /// Borrow the type-erased handle.
    pub fn as_any(&self) -> &AnySlice {
        &self.any
    }

    /// A type-erased handle, for registering the slice with a store.
    pub fn erased(&self) -> AnySlice {
        self.any.clone()
    }

    /// See [`AnySlice::is_sync_ready`].
    pub fn is_sync_ready(&self) -> bool {
        self.any.is_sync_ready()
    }

    /// Create a transaction for the named action.
    ///
    /// # Errors
    ///
    /// - [`SliceError::UnknownAction`] if the slice has no such action.
    /// - [`SliceError::PayloadType`] if `P` is not the action's payload type.
    pub fn action<P: 'static>(&self, name: &str, payload: P) -> Result<Transaction, SliceError> {
        let def = self
            .any
            .action_def(name)
            .ok_or_else(|| SliceError::UnknownAction {
                slice: self.key().to_owned(),
                action: name.to_owned(),
            })?;
        if def.payload_type != TypeId::of::<P>() {
            return Err(SliceError::PayloadType {
                slice: self.key().to_owned(),
                action: name.to_owned(),
                expected: def.payload_type_name,
            });
        }
        Ok(Transaction::new(self.key(), name, Rc::new(payload)))
    }

    /// This slice's current state in `store_state`, or `None` if the slice
    /// is not registered there.
    pub fn get_state(&self, store_state: &StoreState) -> Option<Rc<S>> {
        store_state.get(self)
    }

    /// Raw state together with every selector value.
    ///
    /// Selectors see this slice's state and the full `store_state`, so they
    /// may read dependency slices.
    pub fn resolve_state(&self, store_state: &StoreState) -> Option<ResolvedState<S>> {
        let raw = store_state.get_slice_state(self.key())?;
        let state = Rc::clone(raw).downcast::<S>().ok()?;
        let selectors = self
            .slice_key()
            .inner
            .selectors
            .iter()
            .filter_map(|sel| {
                (sel.compute)(raw, store_state).map(|value| (sel.name.clone(), value))
            })
            .collect();
        Some(ResolvedState { state, selectors })
    }

    /// Project the resolved state through `pick`.
    ///
    /// Effects use the returned [`Picker`] to ask whether the part of the
    /// state they care about changed between two snapshots.
    pub fn pick<T, F>(&self, pick: F) -> Picker<S, T>
    where
        F: Fn(&ResolvedState<S>) -> T + 'static,
    {
        Picker {
            slice: self.clone(),
            pick: Rc::new(pick),
        }
    }
}

/// A slice's raw state plus its computed selector values.
pub struct ResolvedState<S> {
    state: Rc<S>,
    selectors: BTreeMap<String, Rc<dyn Any>>,
}

impl<S: 'static> ResolvedState<S> {
    /// The raw slice state.
    pub fn state(&self) -> &Rc<S> {
        &self.state
    }

    /// A selector value, if the selector exists and produced a `T`.
    pub fn selector<T: 'static>(&self, name: &str) -> Option<&T> {
        self.selectors.get(name)?.downcast_ref::<T>()
    }
}

impl<S> std::ops::Deref for ResolvedState<S> {
    type Target = S;

    fn deref(&self) -> &S {
        &self.state
    }
}

/// A projection of one slice's resolved state. See [`Slice::pick`].
pub struct Picker<S, T> {
    slice: Slice<S>,
    pick: Rc<dyn Fn(&ResolvedState<S>) -> T>,
}

impl<S, T> Clone for Picker<S, T> {
    fn clone(&self) -> Self {
        Self {
            slice: self.slice.clone(),
            pick: Rc::clone(&self.pick),
        }
    }
}

impl<S: 'static, T> Picker<S, T> {
    /// The picked value in `store_state`.
    pub fn get(&self, store_state: &StoreState) -> Option<T> {
        self.slice
            .resolve_state(store_state)
            .map(|resolved| (self.pick)(&resolved))
    }

    /// Whether the picked value differs between two snapshots.
    pub fn changed(&self, prev: &StoreState, next: &StoreState) -> bool
    where
        T: PartialEq,
    {
        self.get(prev) != self.get(next)
    }
}

/// Builder for [`Slice`]. See [`Slice::builder`].
pub struct SliceBuilder<S> {
    key: String,
    init_state: Rc<S>,
    dependencies: Vec<SliceKey>,
    actions: Vec<ActionDef>,
    selectors: Vec<SelectorDef>,
    effects: Vec<ErasedEffect>,
    config: SliceConfig,
    duplicate_action: Option<String>,
}

impl<S: 'static> SliceBuilder<S> {
    /// Declare a dependency on another slice.
    ///
    /// The dependency must be registered before this slice in any store.
    pub fn dependency<D: 'static>(mut self, dependency: &Slice<D>) -> Self {
        self.dependencies.push(dependency.slice_key().clone());
        self
    }

    /// Add an action whose payload stays local to this process.
    ///
    /// The reducer returns the next state. Returning a clone of the input
    /// `Rc` means "unchanged" and the store skips all downstream work.
    pub fn action<P, F>(self, name: impl Into<String>, reducer: F) -> Self
    where
        P: 'static,
        F: Fn(&Rc<S>, &P, &StoreState) -> Rc<S> + 'static,
    {
        self.push_action::<P, F>(name.into(), reducer, None)
    }

    /// Add an action whose payload can cross a synchronization boundary.
    ///
    /// `P`'s serde implementation is the payload schema: parsing a wire
    /// payload that does not deserialize into `P` fails.
    pub fn serial_action<P, F>(self, name: impl Into<String>, reducer: F) -> Self
    where
        P: Serialize + DeserializeOwned + 'static,
        F: Fn(&Rc<S>, &P, &StoreState) -> Rc<S> + 'static,
    {
        self.push_action::<P, F>(name.into(), reducer, Some(PayloadCodec::of::<P>()))
    }

    /// Reducer for the reserved [`ON_READY_ACTION`], dispatched once when a
    /// store containing this slice is built.
    pub fn on_ready<F>(self, reducer: F) -> Self
    where
        F: Fn(&Rc<S>, &StoreState) -> Rc<S> + 'static,
    {
        self.push_action::<(), _>(
            ON_READY_ACTION.to_owned(),
            move |state: &Rc<S>, _: &(), store: &StoreState| reducer(state, store),
            Some(PayloadCodec::of::<()>()),
        )
    }

    /// Add a named selector computed from this slice's state and the full
    /// store state.
    pub fn selector<T, F>(mut self, name: impl Into<String>, select: F) -> Self
    where
        T: 'static,
        F: Fn(&S, &StoreState) -> T + 'static,
    {
        let compute: ErasedSelector = Rc::new(
            move |state: &ErasedState, store: &StoreState| -> Option<Rc<dyn Any>> {
                let state = (**state).downcast_ref::<S>()?;
                let value: Rc<dyn Any> = Rc::new(select(state, store));
                Some(value)
            },
        );
        self.selectors.push(SelectorDef {
            name: name.into(),
            compute,
        });
        self
    }

    /// Attach an effect. Effects of one slice run in attachment order.
    pub fn effect(mut self, effect: Effect<S>) -> Self {
        self.effects.push(effect.erase());
        self
    }

    /// Replace the slice configuration.
    pub fn config(mut self, config: SliceConfig) -> Self {
        self.config = config;
        self
    }

    /// Finish the definition.
    ///
    /// # Errors
    ///
    /// - [`SliceError::DuplicateAction`] if two actions share a name.
    /// - [`SliceError::CircularDependency`] if the slice would depend on
    ///   itself through any dependency.
    pub fn build(self) -> Result<Slice<S>, SliceError> {
        if let Some(action) = self.duplicate_action {
            return Err(SliceError::DuplicateAction {
                slice: self.key,
                action,
            });
        }

        let mut flat_dependencies = BTreeSet::new();
        for dep in &self.dependencies {
            if dep.key() == self.key || dep.flat_dependencies().contains(&self.key) {
                return Err(SliceError::CircularDependency {
                    slice: self.key,
                    via: dep.key().to_owned(),
                });
            }
            flat_dependencies.insert(dep.key().to_owned());
            flat_dependencies.extend(dep.flat_dependencies().iter().cloned());
        }

        let fingerprint = if self.dependencies.is_empty() {
            self.key.clone()
        } else {
            let deps: Vec<&str> = self.dependencies.iter().map(|d| d.fingerprint()).collect();
            format!("{}({})", self.key, deps.join(","))
        };

        let init_state: ErasedState = self.init_state;
        let key = SliceKey {
            inner: Rc::new(SliceKeyInner {
                key: self.key,
                dependencies: self.dependencies,
                init_state,
                selectors: self.selectors,
                fingerprint,
                flat_dependencies,
            }),
        };

        Ok(Slice {
            any: AnySlice {
                spec: Rc::new(SliceSpec {
                    key,
                    actions: self.actions,
                    effects: self.effects,
                    config: self.config,
                }),
            },
            _state: PhantomData,
        })
    }

    fn push_action<P, F>(mut self, name: String, reducer: F, codec: Option<PayloadCodec>) -> Self
    where
        P: 'static,
        F: Fn(&Rc<S>, &P, &StoreState) -> Rc<S> + 'static,
    {
        if self.actions.iter().any(|a| a.name == name) {
            self.duplicate_action.get_or_insert_with(|| name.clone());
            return self;
        }
        let reducer: ErasedReducer = Rc::new(
            move |state: &ErasedState, payload: &dyn Any, store: &StoreState| -> Option<ErasedState> {
                let typed = Rc::clone(state).downcast::<S>().ok()?;
                let payload = payload.downcast_ref::<P>()?;
                let next: ErasedState = reducer(&typed, payload, store);
                Some(next)
            },
        );
        self.actions.push(ActionDef {
            name,
            payload_type: TypeId::of::<P>(),
            payload_type_name: std::any::type_name::<P>(),
            reducer,
            codec,
        });
        self
    }
}
