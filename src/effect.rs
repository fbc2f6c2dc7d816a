//! Effect descriptors and the stateful handlers that run them.
//!
//! An [`Effect`] carries up to two callbacks: `on_sync_update` runs in the
//! microtask that follows a state change, `on_deferred_update` runs later via
//! the store's [`Scheduler`](crate::Scheduler). Each callback receives the
//! slice, a [`ReducedStore`] scoped to that slice and its direct
//! dependencies, and the store state as it was the last time this callback
//! ran, for diffing.

use std::cell::RefCell;
use std::collections::BTreeSet;
use std::fmt;
use std::rc::Rc;

use crate::error::EffectError;
use crate::slice::{AnySlice, Slice};
use crate::state::StoreState;
use crate::store::{ReducedStore, Store};

type EffectFn<S> = Rc<dyn Fn(&Slice<S>, &ReducedStore, &StoreState) -> Result<(), EffectError>>;

type ErasedEffectFn = Rc<dyn Fn(&AnySlice, &ReducedStore, &StoreState) -> Result<(), EffectError>>;

/// Which of the two drain phases an effect callback belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EffectPhase {
    /// Runs in the microtask following the state change.
    Sync,
    /// Runs through the store's scheduler after all sync work.
    Deferred,
}

impl fmt::Display for EffectPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EffectPhase::Sync => f.write_str("sync"),
            EffectPhase::Deferred => f.write_str("deferred"),
        }
    }
}

/// Identifies one effect callback in debug and error hooks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EffectInfo {
    /// Key of the slice the effect is attached to.
    pub slice_key: String,
    /// The effect's name.
    pub effect_name: String,
    /// The phase being run.
    pub phase: EffectPhase,
}

/// A side effect attached to a slice of state type `S`.
///
/// # Examples
///
/// ```
/// use slicefold::Effect;
///
/// let effect = Effect::<u32>::new("log-changes")
///     .on_sync_update(|slice, store, prev| {
///         let now = slice.get_state(&store.state());
///         let before = slice.get_state(prev);
///         if now != before {
///             println!("{before:?} -> {now:?}");
///         }
///         Ok(())
///     });
/// assert!(effect.has_sync_update());
/// assert!(!effect.has_deferred_update());
/// ```
pub struct Effect<S> {
    name: String,
    on_sync_update: Option<EffectFn<S>>,
    on_deferred_update: Option<EffectFn<S>>,
}

impl<S> Clone for Effect<S> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            on_sync_update: self.on_sync_update.clone(),
            on_deferred_update: self.on_deferred_update.clone(),
        }
    }
}

impl<S: 'static> Effect<S> {
    /// A named effect with no callbacks yet.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            on_sync_update: None,
            on_deferred_update: None,
        }
    }

    /// Run `callback` in the microtask following every change of this slice
    /// or of anything it depends on.
    pub fn on_sync_update<F>(mut self, callback: F) -> Self
    where
        F: Fn(&Slice<S>, &ReducedStore, &StoreState) -> Result<(), EffectError> + 'static,
    {
        self.on_sync_update = Some(Rc::new(callback));
        self
    }

    /// Run `callback` through the store's scheduler, after all pending sync
    /// effects.
    pub fn on_deferred_update<F>(mut self, callback: F) -> Self
    where
        F: Fn(&Slice<S>, &ReducedStore, &StoreState) -> Result<(), EffectError> + 'static,
    {
        self.on_deferred_update = Some(Rc::new(callback));
        self
    }

    /// The effect's name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether a sync callback is set.
    pub fn has_sync_update(&self) -> bool {
        self.on_sync_update.is_some()
    }

    /// Whether a deferred callback is set.
    pub fn has_deferred_update(&self) -> bool {
        self.on_deferred_update.is_some()
    }

    pub(crate) fn erase(self) -> ErasedEffect {
        ErasedEffect {
            name: self.name,
            on_sync_update: self.on_sync_update.map(erase_fn),
            on_deferred_update: self.on_deferred_update.map(erase_fn),
        }
    }
}

fn erase_fn<S: 'static>(callback: EffectFn<S>) -> ErasedEffectFn {
    Rc::new(
        move |slice: &AnySlice, store: &ReducedStore, prev: &StoreState| {
            callback(&Slice::from_erased(slice.clone()), store, prev)
        },
    )
}

/// An [`Effect`] with its state type erased, as stored on a slice.
#[derive(Clone)]
pub(crate) struct ErasedEffect {
    name: String,
    on_sync_update: Option<ErasedEffectFn>,
    on_deferred_update: Option<ErasedEffectFn>,
}

impl ErasedEffect {
    pub(crate) fn has_phase(&self, phase: EffectPhase) -> bool {
        self.callback(phase).is_some()
    }

    fn callback(&self, phase: EffectPhase) -> Option<&ErasedEffectFn> {
        match phase {
            EffectPhase::Sync => self.on_sync_update.as_ref(),
            EffectPhase::Deferred => self.on_deferred_update.as_ref(),
        }
    }
}

/// Runs one effect of one slice, remembering the state each phase last saw.
pub(crate) struct EffectHandler {
    slice: AnySlice,
    effect: ErasedEffect,
    scope: Rc<BTreeSet<String>>,
    origin: Rc<str>,
    last_seen_sync: RefCell<StoreState>,
    last_seen_deferred: RefCell<StoreState>,
}

impl EffectHandler {
    pub(crate) fn new(slice: &AnySlice, effect: &ErasedEffect, initial: &StoreState) -> Self {
        let scope = std::iter::once(slice.key().to_owned())
            .chain(
                slice
                    .slice_key()
                    .dependencies()
                    .iter()
                    .map(|dep| dep.key().to_owned()),
            )
            .collect();
        Self {
            slice: slice.clone(),
            effect: effect.clone(),
            scope: Rc::new(scope),
            origin: format!("effect:{}/{}", slice.key(), effect.name).into(),
            last_seen_sync: RefCell::new(initial.clone()),
            last_seen_deferred: RefCell::new(initial.clone()),
        }
    }

    pub(crate) fn info(&self, phase: EffectPhase) -> EffectInfo {
        EffectInfo {
            slice_key: self.slice.key().to_owned(),
            effect_name: self.effect.name.clone(),
            phase,
        }
    }

    /// Invoke the callback for `phase`.
    ///
    /// The baseline is moved to the current state *before* the callback runs,
    /// so a dispatch made by the callback itself shows up as a change on its
    /// next run.
    pub(crate) fn run(&self, store: &Store, phase: EffectPhase) -> Result<(), EffectError> {
        let Some(callback) = self.effect.callback(phase) else {
            return Ok(());
        };
        let baseline = match phase {
            EffectPhase::Sync => &self.last_seen_sync,
            EffectPhase::Deferred => &self.last_seen_deferred,
        };
        let prev = baseline.replace(store.state());
        let reduced = ReducedStore::scoped(
            store.clone(),
            Rc::clone(&self.scope),
            Some(Rc::clone(&self.origin)),
        );
        callback(&self.slice, &reduced, &prev)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::slice::test_fixtures::{num_slice, num_slice_with_deps};

    #[test]
    fn erase_keeps_phases() {
        let effect = Effect::<u8>::new("e").on_deferred_update(|_, _, _| Ok(()));
        let erased = effect.erase();
        assert!(!erased.has_phase(EffectPhase::Sync));
        assert!(erased.has_phase(EffectPhase::Deferred));
    }

    #[test]
    fn handler_scope_is_slice_plus_direct_dependencies() {
        let root = num_slice("root", 0);
        let mid = num_slice_with_deps("mid", &[&root]);
        let leaf = num_slice_with_deps("leaf", &[&mid]);
        let state = StoreState::create([root.erased(), mid.erased(), leaf.erased()]).unwrap();
        let effect = Effect::<()>::new("noop").on_sync_update(|_, _, _| Ok(())).erase();

        let handler = EffectHandler::new(leaf.as_any(), &effect, &state);
        let scope: Vec<&str> = handler.scope.iter().map(String::as_str).collect();
        assert_eq!(scope, vec!["leaf", "mid"]);
        assert_eq!(&*handler.origin, "effect:leaf/noop");
    }

    #[test]
    fn phase_display() {
        assert_eq!(EffectPhase::Sync.to_string(), "sync");
        assert_eq!(EffectPhase::Deferred.to_string(), "deferred");
        let info = EffectInfo {
            slice_key: "s".into(),
            effect_name: "e".into(),
            phase: EffectPhase::Deferred,
        };
        assert_eq!(info.phase, EffectPhase::Deferred);
    }
}
