//! Top-level entry point that owns the live [`StoreState`], the dispatch
//! pipeline, and the side-effects manager.
//!
//! A [`Store`] is opened via [`StoreBuilder`]. [`ReducedStore`] is a
//! capability-narrowed view over a store, handed to effects so they can only
//! address their own slice and its dependencies.

use std::cell::{Cell, RefCell};
use std::collections::BTreeSet;
use std::fmt;
use std::rc::{Rc, Weak};

use serde::{Deserialize, Serialize};

use crate::effect::EffectInfo;
use crate::error::{EffectError, SliceError, StoreError};
use crate::scheduler::{Scheduler, SchedulerConfig};
use crate::side_effects::{DebugHook, ErrorHook, SideEffectsManager};
use crate::slice::{AnySlice, Slice};
use crate::state::StoreState;
use crate::transaction::{META_ORIGIN, META_STORE_NAME, META_STORE_TX_ID, Transaction};

/// The function through which every dispatched transaction flows.
///
/// The default, [`default_dispatch_tx`], applies the transaction and calls
/// [`Store::update_state`] if the state changed. Hosts can wrap or replace
/// it to audit, veto, or record transactions.
pub type DispatchTx = Rc<dyn Fn(&Store, Transaction)>;

/// Options controlling store construction.
///
/// # Examples
///
/// ```
/// use slicefold::{SchedulerConfig, StoreConfig};
///
/// let config: StoreConfig = serde_json::from_str(
///     r#"{"scheduler": {"kind": "idle", "timeout_ms": 50}}"#,
/// )
/// .unwrap();
/// assert_eq!(config.scheduler, SchedulerConfig::Idle { timeout_ms: 50 });
/// assert!(!config.disable_side_effects);
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Scheduler for deferred effects, unless one is passed to
    /// [`StoreBuilder::scheduler`] directly.
    pub scheduler: SchedulerConfig,
    /// Do not create a side-effects manager; no effect ever runs.
    pub disable_side_effects: bool,
}

/// Apply `tx` to the store's current state, and publish the result if it
/// differs by identity.
pub fn default_dispatch_tx(store: &Store, tx: Transaction) {
    let current = store.state();
    let next = current.apply_transaction(&tx);
    if !StoreState::ptr_eq(&current, &next) {
        store.update_state(next, Some(&tx));
    }
}

/// A single-threaded state container.
///
/// `Clone` is cheap: all clones share one store. Effects and the built-in
/// schedulers spawn local tasks, so a store with effects must be driven from
/// inside a [`tokio::task::LocalSet`].
#[derive(Clone)]
pub struct Store {
    inner: Rc<StoreInner>,
}

struct StoreInner {
    name: String,
    state: RefCell<StoreState>,
    dispatch_tx: DispatchTx,
    side_effects: Option<SideEffectsManager>,
    destroyed: Cell<bool>,
    tx_seq: Cell<u64>,
    on_destroy: RefCell<Vec<Box<dyn FnOnce()>>>,
}

/// Non-owning handle held by scheduled tasks, so pending work never keeps a
/// dropped store alive.
#[derive(Clone)]
pub(crate) struct WeakStore {
    inner: Weak<StoreInner>,
}

impl WeakStore {
    pub(crate) fn upgrade(&self) -> Option<Store> {
        self.inner.upgrade().map(|inner| Store { inner })
    }
}

impl fmt::Debug for Store {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Store")
            .field("name", &self.inner.name)
            .field("state", &*self.inner.state.borrow())
            .field("destroyed", &self.inner.destroyed.get())
            .finish_non_exhaustive()
    }
}

impl Store {
    /// Start configuring a store with the given name.
    pub fn builder(name: impl Into<String>) -> StoreBuilder {
        StoreBuilder {
            name: name.into(),
            ..StoreBuilder::default()
        }
    }

    /// The store's name.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// The current snapshot.
    ///
    /// Snapshots never change. Re-read after dispatching to see the result.
    pub fn state(&self) -> StoreState {
        self.inner.state.borrow().clone()
    }

    /// The current state of `slice`, if registered.
    pub fn get<S: 'static>(&self, slice: &Slice<S>) -> Option<Rc<S>> {
        self.state().get(slice)
    }

    /// Whether [`destroy`](Store::destroy) has been called.
    pub fn is_destroyed(&self) -> bool {
        self.inner.destroyed.get()
    }

    /// Dispatch a transaction.
    ///
    /// Stamps the store name and a per-store transaction id (`tx_1`,
    /// `tx_2`, ...) into the metadata, then hands it to the dispatch
    /// function. The state change is visible as soon as this returns;
    /// effects run later. Does nothing once the store is destroyed.
    ///
    /// # Panics
    ///
    /// Panics when the change queues an effect and the caller is not running
    /// inside a [`tokio::task::LocalSet`].
    pub fn dispatch(&self, mut tx: Transaction) {
        if self.is_destroyed() {
            tracing::debug!(
                store = %self.inner.name,
                slice = tx.slice_key(),
                action = tx.action_id(),
                "dispatch on destroyed store ignored"
            );
            return;
        }
        let seq = self.inner.tx_seq.get() + 1;
        self.inner.tx_seq.set(seq);
        tx.set_metadata(META_STORE_NAME, self.inner.name.as_str());
        tx.set_metadata(META_STORE_TX_ID, format!("tx_{seq}"));

        let dispatch_tx = Rc::clone(&self.inner.dispatch_tx);
        dispatch_tx(self, tx);
    }

    /// Replace the current snapshot.
    ///
    /// When `tx` is given, effects of `tx`'s slice and of every slice
    /// depending on it are queued.
    pub fn update_state(&self, state: StoreState, tx: Option<&Transaction>) {
        if self.is_destroyed() {
            return;
        }
        *self.inner.state.borrow_mut() = state;

        let Some(tx) = tx else {
            return;
        };
        if let Some(slice) = self.state().slice(tx.slice_key()) {
            if slice.config().log_transactions {
                tracing::debug!(
                    store = %self.inner.name,
                    slice = tx.slice_key(),
                    action = tx.action_id(),
                    tx_id = tx.id().unwrap_or_default(),
                    "slice state changed"
                );
            }
        }
        if let Some(manager) = &self.inner.side_effects {
            manager.queue_side_effect_execution(
                self,
                tx.slice_key(),
                tx.id().unwrap_or_default(),
            );
        }
    }

    /// Destroy the store. Idempotent.
    ///
    /// Cancels scheduled effect work, turns every later dispatch into a
    /// no-op, and runs the [`on_destroy`](Store::on_destroy) callbacks once.
    pub fn destroy(&self) {
        if self.inner.destroyed.replace(true) {
            return;
        }
        if let Some(manager) = &self.inner.side_effects {
            manager.destroy();
        }
        let callbacks = std::mem::take(&mut *self.inner.on_destroy.borrow_mut());
        for callback in callbacks {
            callback();
        }
        tracing::debug!(store = %self.inner.name, "store destroyed");
    }

    /// Register a callback for [`destroy`](Store::destroy). Runs immediately
    /// if the store is already destroyed.
    pub fn on_destroy(&self, callback: impl FnOnce() + 'static) {
        if self.is_destroyed() {
            callback();
            return;
        }
        self.inner.on_destroy.borrow_mut().push(Box::new(callback));
    }

    /// A view of this store restricted to `slices`.
    pub fn reduced(&self, slices: impl IntoIterator<Item = AnySlice>) -> ReducedStore {
        ReducedStore::new(self.clone(), slices)
    }

    pub(crate) fn downgrade(&self) -> WeakStore {
        WeakStore {
            inner: Rc::downgrade(&self.inner),
        }
    }

    pub(crate) fn side_effects(&self) -> Option<&SideEffectsManager> {
        self.inner.side_effects.as_ref()
    }
}

/// Builder for [`Store`]. See [`Store::builder`].
pub struct StoreBuilder {
    name: String,
    slices: Vec<AnySlice>,
    state: Option<StoreState>,
    scheduler: Option<Rc<dyn Scheduler>>,
    config: StoreConfig,
    dispatch_tx: Option<DispatchTx>,
    debug: Option<DebugHook>,
    on_error: Option<ErrorHook>,
}

impl Default for StoreBuilder {
    /// A builder with a random store name.
    fn default() -> Self {
        Self {
            name: format!("store-{}", uuid::Uuid::new_v4()),
            slices: Vec::new(),
            state: None,
            scheduler: None,
            config: StoreConfig::default(),
            dispatch_tx: None,
            debug: None,
            on_error: None,
        }
    }
}

impl StoreBuilder {
    /// Register slices, in order. Dependencies must come first.
    pub fn slices(mut self, slices: impl IntoIterator<Item = AnySlice>) -> Self {
        self.slices.extend(slices);
        self
    }

    /// Start from an existing snapshot instead of building one from
    /// [`slices`](StoreBuilder::slices). Takes precedence when both are set.
    pub fn state(mut self, state: StoreState) -> Self {
        self.state = Some(state);
        self
    }

    /// Scheduler for deferred effects. Overrides the configured one.
    pub fn scheduler(mut self, scheduler: Rc<dyn Scheduler>) -> Self {
        self.scheduler = Some(scheduler);
        self
    }

    /// Apply a [`StoreConfig`].
    pub fn config(mut self, config: StoreConfig) -> Self {
        self.config = config;
        self
    }

    /// Replace the dispatch function. See [`DispatchTx`].
    pub fn dispatch_tx(mut self, dispatch_tx: impl Fn(&Store, Transaction) + 'static) -> Self {
        self.dispatch_tx = Some(Rc::new(dispatch_tx));
        self
    }

    /// Receive errors returned by effects. Without a hook they are logged.
    pub fn on_error(mut self, hook: impl Fn(&EffectInfo, &EffectError) + 'static) -> Self {
        self.on_error = Some(Rc::new(hook));
        self
    }

    /// Observe every effect right before it runs.
    pub fn debug(mut self, hook: impl Fn(&EffectInfo, &[String]) + 'static) -> Self {
        self.debug = Some(Rc::new(hook));
        self
    }

    /// Never run effects.
    pub fn disable_side_effects(mut self) -> Self {
        self.config.disable_side_effects = true;
        self
    }

    /// Build the store and dispatch the on-ready action of every slice that
    /// defines one.
    ///
    /// # Errors
    ///
    /// Returns a [`SliceError`] if the slices fail registration checks. See
    /// [`StoreState::create`].
    ///
    /// # Panics
    ///
    /// Panics outside a [`tokio::task::LocalSet`] when an on-ready action
    /// changes a slice that has effects. See [`Store::dispatch`].
    pub fn build(self) -> Result<Store, SliceError> {
        let state = match self.state {
            Some(state) => state,
            None => StoreState::create(self.slices)?,
        };

        let side_effects = (!self.config.disable_side_effects).then(|| {
            let scheduler = self
                .scheduler
                .unwrap_or_else(|| self.config.scheduler.build());
            SideEffectsManager::new(state.slices(), &state, scheduler, self.debug, self.on_error)
        });

        tracing::debug!(
            store = %self.name,
            slices = state.slices().len(),
            side_effects = side_effects.is_some(),
            "store created"
        );

        let on_ready: Vec<Transaction> = state
            .slices()
            .iter()
            .filter_map(AnySlice::on_ready_transaction)
            .collect();

        let store = Store {
            inner: Rc::new(StoreInner {
                name: self.name,
                state: RefCell::new(state),
                dispatch_tx: self
                    .dispatch_tx
                    .unwrap_or_else(|| Rc::new(default_dispatch_tx)),
                side_effects,
                destroyed: Cell::new(false),
                tx_seq: Cell::new(0),
                on_destroy: RefCell::new(Vec::new()),
            }),
        };

        for tx in on_ready {
            store.dispatch(tx);
        }
        Ok(store)
    }
}

/// A view over a [`Store`] exposing only a chosen subset of slices.
///
/// Reads and dispatches addressing any other slice fail with
/// [`StoreError::SliceOutOfScope`]. The view shares the backing store's
/// state; it never copies it.
#[derive(Clone)]
pub struct ReducedStore {
    store: Store,
    scope: Rc<BTreeSet<String>>,
    origin: Option<Rc<str>>,
}

impl fmt::Debug for ReducedStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReducedStore")
            .field("store", &self.store.name())
            .field("scope", &self.scope)
            .finish_non_exhaustive()
    }
}

impl ReducedStore {
    /// A view of `store` restricted to `slices`.
    pub fn new(store: Store, slices: impl IntoIterator<Item = AnySlice>) -> Self {
        let scope = slices.into_iter().map(|s| s.key().to_owned()).collect();
        Self::scoped(store, Rc::new(scope), None)
    }

    pub(crate) fn scoped(store: Store, scope: Rc<BTreeSet<String>>, origin: Option<Rc<str>>) -> Self {
        Self {
            store,
            scope,
            origin,
        }
    }

    /// Name of the backing store.
    pub fn name(&self) -> &str {
        self.store.name()
    }

    /// Whether this view may address the slice with `key`.
    pub fn allows(&self, key: &str) -> bool {
        self.scope.contains(key)
    }

    /// The backing store's current snapshot.
    pub fn state(&self) -> StoreState {
        self.store.state()
    }

    /// The current state of `slice`.
    ///
    /// # Errors
    ///
    /// - [`StoreError::SliceOutOfScope`] if `slice` is outside this view.
    /// - [`StoreError::SliceNotRegistered`] if the store lacks `slice`.
    pub fn get<S: 'static>(&self, slice: &Slice<S>) -> Result<Rc<S>, StoreError> {
        self.check_scope(slice.key())?;
        self.store
            .get(slice)
            .ok_or_else(|| StoreError::SliceNotRegistered {
                slice: slice.key().to_owned(),
                store: self.store.name().to_owned(),
            })
    }

    /// Dispatch `tx` to the backing store.
    ///
    /// When the view belongs to an effect, the effect is appended to the
    /// transaction's `origin` metadata.
    ///
    /// # Errors
    ///
    /// [`StoreError::SliceOutOfScope`] if `tx` targets a slice outside this
    /// view. Nothing is dispatched in that case.
    pub fn dispatch(&self, mut tx: Transaction) -> Result<(), StoreError> {
        if let Err(err) = self.check_scope(tx.slice_key()) {
            tracing::warn!(
                store = self.store.name(),
                slice = tx.slice_key(),
                action = tx.action_id(),
                "rejected dispatch outside reduced store scope"
            );
            return Err(err);
        }
        if let Some(origin) = &self.origin {
            tx.append_metadata(META_ORIGIN, &**origin);
        }
        self.store.dispatch(tx);
        Ok(())
    }

    /// Destroy the backing store.
    pub fn destroy(&self) {
        self.store.destroy();
    }

    /// Whether the backing store is destroyed.
    pub fn is_destroyed(&self) -> bool {
        self.store.is_destroyed()
    }

    fn check_scope(&self, key: &str) -> Result<(), StoreError> {
        if self.allows(key) {
            Ok(())
        } else {
            Err(StoreError::SliceOutOfScope {
                slice: key.to_owned(),
                store: self.store.name().to_owned(),
            })
        }
    }
}
