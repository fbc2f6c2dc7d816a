//! Queueing and draining of slice effects.
//!
//! When a transaction changes a slice, every effect attached to that slice
//! or to any slice transitively depending on it becomes stale. Stale
//! handlers are collected into two insertion-ordered, de-duplicated queues
//! and drained in two phases:
//!
//! 1. **sync**: drained completely inside one microtask.
//! 2. **deferred**: one handler at a time through the store's
//!    [`Scheduler`], each preceded by a full sync drain so that no deferred
//!    effect ever observes pending sync work.
//!
//! Effects may dispatch. Their transactions apply immediately and refill the
//! queues; the loop keeps going until both queues are empty or the store is
//! destroyed.

use std::cell::RefCell;
use std::collections::hash_map::Entry;
use std::collections::{HashMap, VecDeque};
use std::rc::Rc;

use crate::effect::{EffectHandler, EffectInfo, EffectPhase};
use crate::error::EffectError;
use crate::graph::{
    DependencyMap, calc_dependencies, calc_reverse_dependencies, flatten_reverse_dependencies,
};
use crate::scheduler::{ScheduleToken, Scheduler, queue_microtask};
use crate::slice::AnySlice;
use crate::state::StoreState;
use crate::store::Store;

/// Hook invoked right before an effect runs, with the ids of every
/// transaction that queued it since its last run.
pub type DebugHook = Rc<dyn Fn(&EffectInfo, &[String])>;

/// Hook receiving errors returned by effect callbacks.
pub type ErrorHook = Rc<dyn Fn(&EffectInfo, &EffectError)>;

/// Insertion-ordered set of pending handler ids.
#[derive(Default)]
struct EffectQueue {
    order: VecDeque<usize>,
    origins: HashMap<usize, Vec<String>>,
}

impl EffectQueue {
    /// Queue `id`, or record one more origin if it is already pending.
    fn push(&mut self, id: usize, origin: &str) {
        match self.origins.entry(id) {
            Entry::Occupied(entry) => entry.into_mut().push(origin.to_owned()),
            Entry::Vacant(entry) => {
                entry.insert(vec![origin.to_owned()]);
                self.order.push_back(id);
            }
        }
    }

    fn pop(&mut self) -> Option<(usize, Vec<String>)> {
        let id = self.order.pop_front()?;
        let origins = self.origins.remove(&id).unwrap_or_default();
        Some((id, origins))
    }

    fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    fn clear(&mut self) {
        self.order.clear();
        self.origins.clear();
    }
}

#[derive(Default)]
struct RunState {
    sync: EffectQueue,
    deferred: EffectQueue,
    /// The pending microtask that will call the run loop.
    drain_token: Option<ScheduleToken>,
    /// The pending scheduler task that will run the next deferred handler.
    /// The handler stays in `deferred` until that task fires.
    deferred_token: Option<ScheduleToken>,
}

/// Owns every effect handler of one store and decides when each runs.
pub(crate) struct SideEffectsManager {
    handlers: Vec<EffectHandler>,
    sync_handlers: HashMap<String, Vec<usize>>,
    deferred_handlers: HashMap<String, Vec<usize>>,
    /// Slice keys in registration (topological) order.
    slice_order: Vec<String>,
    flat_reverse_deps: DependencyMap,
    scheduler: Rc<dyn Scheduler>,
    debug: Option<DebugHook>,
    on_error: Option<ErrorHook>,
    run: RefCell<RunState>,
}

impl SideEffectsManager {
    pub(crate) fn new(
        slices: &[AnySlice],
        initial: &StoreState,
        scheduler: Rc<dyn Scheduler>,
        debug: Option<DebugHook>,
        on_error: Option<ErrorHook>,
    ) -> Self {
        let mut handlers = Vec::new();
        let mut sync_handlers: HashMap<String, Vec<usize>> = HashMap::new();
        let mut deferred_handlers: HashMap<String, Vec<usize>> = HashMap::new();

        for slice in slices {
            for effect in slice.effects() {
                let id = handlers.len();
                handlers.push(EffectHandler::new(slice, effect, initial));
                if effect.has_phase(EffectPhase::Sync) {
                    sync_handlers.entry(slice.key().to_owned()).or_default().push(id);
                }
                if effect.has_phase(EffectPhase::Deferred) {
                    deferred_handlers
                        .entry(slice.key().to_owned())
                        .or_default()
                        .push(id);
                }
            }
        }

        let flat_reverse_deps =
            flatten_reverse_dependencies(&calc_reverse_dependencies(&calc_dependencies(slices)));

        Self {
            handlers,
            sync_handlers,
            deferred_handlers,
            slice_order: slices.iter().map(|s| s.key().to_owned()).collect(),
            flat_reverse_deps,
            scheduler,
            debug,
            on_error,
            run: RefCell::new(RunState::default()),
        }
    }

    /// Queue every handler made stale by a change to `origin_slice_key`.
    ///
    /// Returns without running anything: the drain starts in a microtask, so
    /// a caller reading the store right after dispatching sees only its own
    /// change.
    pub(crate) fn queue_side_effect_execution(
        &self,
        store: &Store,
        origin_slice_key: &str,
        origin_tx_id: &str,
    ) {
        if store.is_destroyed() {
            return;
        }
        let dependents = self.flat_reverse_deps.get(origin_slice_key);
        let affected = self.slice_order.iter().filter(|key| {
            key.as_str() == origin_slice_key || dependents.is_some_and(|d| d.contains(*key))
        });

        let start_drain = {
            let mut run = self.run.borrow_mut();
            let mut queued = false;
            for key in affected {
                for &id in self.sync_handlers.get(key).into_iter().flatten() {
                    run.sync.push(id, origin_tx_id);
                    queued = true;
                }
                for &id in self.deferred_handlers.get(key).into_iter().flatten() {
                    run.deferred.push(id, origin_tx_id);
                    queued = true;
                }
            }
            queued && run.drain_token.is_none()
        };

        if start_drain {
            let weak = store.downgrade();
            let token = queue_microtask(Box::new(move || {
                let Some(store) = weak.upgrade() else {
                    return;
                };
                if let Some(manager) = store.side_effects() {
                    manager.run.borrow_mut().drain_token = None;
                    manager.run_loop(&store);
                }
            }));
            self.run.borrow_mut().drain_token = Some(token);
        }
    }

    /// Drain all sync work, then hand the next deferred handler to the
    /// scheduler.
    pub(crate) fn run_loop(&self, store: &Store) {
        if store.is_destroyed() {
            return;
        }
        self.drain_sync(store);
        self.schedule_next_deferred(store);
    }

    /// Cancel everything still scheduled and forget pending work.
    pub(crate) fn destroy(&self) {
        let tokens = {
            let mut run = self.run.borrow_mut();
            run.sync.clear();
            run.deferred.clear();
            [run.drain_token.take(), run.deferred_token.take()]
        };
        for token in tokens.into_iter().flatten() {
            token.cancel();
        }
    }

    fn drain_sync(&self, store: &Store) {
        loop {
            if store.is_destroyed() {
                return;
            }
            // The borrow ends with this statement; the handler may re-enter
            // `queue_side_effect_execution`.
            let next = self.run.borrow_mut().sync.pop();
            let Some((id, origins)) = next else {
                return;
            };
            self.execute(store, id, EffectPhase::Sync, &origins);
        }
    }

    /// Hand the deferred queue to the scheduler, unless a hand-off is
    /// already pending.
    ///
    /// The handler to run is only popped when the scheduled task fires, so
    /// re-queueing it in the meantime still collapses into one run.
    fn schedule_next_deferred(&self, store: &Store) {
        {
            let run = self.run.borrow();
            if run.deferred_token.is_some() || run.deferred.is_empty() {
                return;
            }
        }

        let weak = store.downgrade();
        let token = self.scheduler.schedule(Box::new(move || {
            let Some(store) = weak.upgrade() else {
                return;
            };
            let Some(manager) = store.side_effects() else {
                return;
            };
            manager.run.borrow_mut().deferred_token = None;
            if store.is_destroyed() {
                return;
            }
            manager.drain_sync(&store);
            if store.is_destroyed() {
                return;
            }
            let next = manager.run.borrow_mut().deferred.pop();
            if let Some((id, origins)) = next {
                manager.execute(&store, id, EffectPhase::Deferred, &origins);
            }
            manager.run_loop(&store);
        }));
        self.run.borrow_mut().deferred_token = Some(token);
    }

    fn execute(&self, store: &Store, id: usize, phase: EffectPhase, origins: &[String]) {
        let Some(handler) = self.handlers.get(id) else {
            return;
        };
        let info = handler.info(phase);
        let _span = tracing::debug_span!(
            "effect",
            store = store.name(),
            slice = %info.slice_key,
            effect = %info.effect_name,
            %phase,
        )
        .entered();

        if let Some(debug) = &self.debug {
            debug(&info, origins);
        }
        tracing::trace!(origins = ?origins, "running effect");

        if let Err(error) = handler.run(store, phase) {
            match &self.on_error {
                Some(hook) => hook(&info, &error),
                None => tracing::error!(error = %error, "effect failed"),
            }
        }
    }
}
