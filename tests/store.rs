use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use slicefold::{
    Effect, EffectPhase, ReducedStore, SchedulerConfig, Slice, Store, StoreConfig, StoreError,
    StoreState, TimeoutScheduler,
};
use tokio::task::LocalSet;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Num {
    num: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Increment {
    increment: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Decrement {
    decrement: bool,
}

type Log = Rc<RefCell<Vec<String>>>;

fn log() -> Log {
    Rc::new(RefCell::new(Vec::new()))
}

/// Let every pending microtask and short timer run.
async fn settle() {
    tokio::time::sleep(Duration::from_millis(100)).await;
}

fn counter(key: &str, num: i64) -> Slice<Num> {
    Slice::builder(key, Num { num })
        .serial_action("increment", |s: &Rc<Num>, p: &Increment, _: &StoreState| {
            if p.increment {
                Rc::new(Num { num: s.num + 1 })
            } else {
                Rc::clone(s)
            }
        })
        .serial_action("decrement", |s: &Rc<Num>, p: &Decrement, _: &StoreState| {
            if p.decrement {
                Rc::new(Num { num: s.num - 1 })
            } else {
                Rc::clone(s)
            }
        })
        .serial_action("set", |_: &Rc<Num>, n: &i64, _: &StoreState| Rc::new(Num { num: *n }))
        .build()
        .unwrap()
}

/// A counter whose only effect appends `label` to `log` on every sync run.
fn logging_counter(key: &str, deps: &[&Slice<Num>], label: &'static str, log: &Log) -> Slice<Num> {
    let log = Rc::clone(log);
    deps.iter()
        .fold(Slice::builder(key, Num { num: 0 }), |b, dep| b.dependency(*dep))
        .serial_action("set", |_: &Rc<Num>, n: &i64, _: &StoreState| Rc::new(Num { num: *n }))
        .effect(Effect::<Num>::new("log").on_sync_update(move |_, _, _| {
            log.borrow_mut().push(label.to_owned());
            Ok(())
        }))
        .build()
        .unwrap()
}

#[test]
fn counter_scenario_reaches_six() {
    let test_1 = counter("test-1", 4);
    let store = Store::builder("counter")
        .slices([test_1.erased()])
        .disable_side_effects()
        .build()
        .unwrap();

    for _ in 0..3 {
        store.dispatch(test_1.action("increment", Increment { increment: true }).unwrap());
    }
    store.dispatch(test_1.action("decrement", Decrement { decrement: true }).unwrap());

    assert_eq!(*store.get(&test_1).unwrap(), Num { num: 6 });
}

#[tokio::test(start_paused = true)]
async fn repeated_dispatches_run_effect_once_per_cycle() {
    LocalSet::new()
        .run_until(async {
            let runs = Rc::new(Cell::new(0));
            let counted = Rc::clone(&runs);
            let slice = Slice::builder("n", Num { num: 0 })
                .serial_action("set", |_: &Rc<Num>, n: &i64, _: &StoreState| {
                    Rc::new(Num { num: *n })
                })
                .effect(Effect::<Num>::new("count").on_sync_update(move |_, _, _| {
                    counted.set(counted.get() + 1);
                    Ok(())
                }))
                .build()
                .unwrap();

            let origins = log();
            let seen = Rc::clone(&origins);
            let store = Store::builder("once")
                .slices([slice.erased()])
                .debug(move |_, txs| seen.borrow_mut().extend(txs.iter().cloned()))
                .build()
                .unwrap();

            for n in 1..=3 {
                store.dispatch(slice.action("set", n as i64).unwrap());
            }
            assert_eq!(runs.get(), 0);

            settle().await;
            assert_eq!(runs.get(), 1);
            assert_eq!(*origins.borrow(), vec!["tx_1", "tx_2", "tx_3"]);

            store.dispatch(slice.action("set", 9_i64).unwrap());
            settle().await;
            assert_eq!(runs.get(), 2);
        })
        .await;
}

#[tokio::test(start_paused = true)]
async fn chained_effects_run_in_dependency_order_after_dispatch() {
    LocalSet::new()
        .run_until(async {
            let order = log();
            let e1 = logging_counter("e1", &[], "e1", &order);
            let e2 = logging_counter("e2", &[&e1], "e2", &order);
            let store = Store::builder("chain")
                .slices([e1.erased(), e2.erased()])
                .build()
                .unwrap();

            store.dispatch(e1.action("set", 1_i64).unwrap());
            assert!(order.borrow().is_empty());

            settle().await;
            assert_eq!(*order.borrow(), vec!["e1", "e2"]);

            // Changing the dependent does not re-run the dependency's effect.
            order.borrow_mut().clear();
            store.dispatch(e2.action("set", 1_i64).unwrap());
            settle().await;
            assert_eq!(*order.borrow(), vec!["e2"]);
        })
        .await;
}

#[tokio::test(start_paused = true)]
async fn deferred_effects_follow_sync_and_reenter_the_loop() {
    LocalSet::new()
        .run_until(async {
            let order = log();
            let src = logging_counter("src", &[], "sync:src", &order);

            let (sync_log, deferred_log) = (Rc::clone(&order), Rc::clone(&order));
            let source = src.clone();
            let mirror = Slice::builder("mirror", Num { num: 0 })
                .dependency(&src)
                .serial_action("set", |_: &Rc<Num>, n: &i64, _: &StoreState| {
                    Rc::new(Num { num: *n })
                })
                .effect(Effect::<Num>::new("observe").on_sync_update(
                    move |mirror, store: &ReducedStore, _| {
                        let num = store.get(mirror)?.num;
                        sync_log.borrow_mut().push(format!("sync:mirror:{num}"));
                        Ok(())
                    },
                ))
                .effect(Effect::<Num>::new("copy").on_deferred_update(
                    move |mirror, store: &ReducedStore, _| {
                        deferred_log.borrow_mut().push("deferred:mirror".to_owned());
                        let value = store.get(&source)?.num;
                        if store.get(mirror)?.num != value {
                            store.dispatch(mirror.action("set", value)?)?;
                        }
                        Ok(())
                    },
                ))
                .build()
                .unwrap();

            let store = Store::builder("phases")
                .slices([src.erased(), mirror.erased()])
                .build()
                .unwrap();

            store.dispatch(src.action("set", 5_i64).unwrap());
            settle().await;

            assert_eq!(
                *order.borrow(),
                vec![
                    "sync:src",
                    "sync:mirror:0",
                    "deferred:mirror",
                    "sync:mirror:5",
                    "deferred:mirror",
                ]
            );
            assert_eq!(store.get(&mirror).unwrap().num, 5);
        })
        .await;
}

#[tokio::test(start_paused = true)]
async fn effect_sees_previous_state() {
    LocalSet::new()
        .run_until(async {
            let transitions = Rc::new(RefCell::new(Vec::new()));
            let seen = Rc::clone(&transitions);
            let slice = Slice::builder("n", Num { num: 1 })
                .serial_action("set", |_: &Rc<Num>, n: &i64, _: &StoreState| {
                    Rc::new(Num { num: *n })
                })
                .effect(Effect::<Num>::new("diff").on_sync_update(
                    move |slice, store: &ReducedStore, prev: &StoreState| {
                        let before = slice.get_state(prev).map(|s| s.num);
                        let after = store.get(slice)?.num;
                        seen.borrow_mut().push((before, after));
                        Ok(())
                    },
                ))
                .build()
                .unwrap();
            let store = Store::builder("diff").slices([slice.erased()]).build().unwrap();

            store.dispatch(slice.action("set", 2_i64).unwrap());
            settle().await;
            store.dispatch(slice.action("set", 3_i64).unwrap());
            settle().await;

            assert_eq!(*transitions.borrow(), vec![(Some(1), 2), (Some(2), 3)]);
        })
        .await;
}

#[tokio::test(start_paused = true)]
async fn failing_effect_is_reported_and_queue_continues() {
    LocalSet::new()
        .run_until(async {
            let order = log();
            let ran = Rc::clone(&order);
            let slice = Slice::builder("n", Num { num: 0 })
                .serial_action("set", |_: &Rc<Num>, n: &i64, _: &StoreState| {
                    Rc::new(Num { num: *n })
                })
                .effect(Effect::<Num>::new("broken").on_sync_update(|_, _, _| Err("boom".into())))
                .effect(Effect::<Num>::new("after").on_sync_update(move |_, _, _| {
                    ran.borrow_mut().push("after".to_owned());
                    Ok(())
                }))
                .build()
                .unwrap();

            let errors = Rc::new(RefCell::new(Vec::new()));
            let reported = Rc::clone(&errors);
            let store = Store::builder("errors")
                .slices([slice.erased()])
                .on_error(move |info, err| {
                    reported
                        .borrow_mut()
                        .push((info.effect_name.clone(), info.phase, err.to_string()));
                })
                .build()
                .unwrap();

            store.dispatch(slice.action("set", 1_i64).unwrap());
            settle().await;

            assert_eq!(
                *errors.borrow(),
                vec![("broken".to_owned(), EffectPhase::Sync, "boom".to_owned())]
            );
            assert_eq!(*order.borrow(), vec!["after"]);
        })
        .await;
}

#[tokio::test(start_paused = true)]
async fn destroy_cancels_scheduled_deferred_effect() {
    LocalSet::new()
        .run_until(async {
            let fired = Rc::new(Cell::new(false));
            let flag = Rc::clone(&fired);
            let slice = Slice::builder("n", Num { num: 0 })
                .serial_action("set", |_: &Rc<Num>, n: &i64, _: &StoreState| {
                    Rc::new(Num { num: *n })
                })
                .effect(Effect::<Num>::new("late").on_deferred_update(move |_, _, _| {
                    flag.set(true);
                    Ok(())
                }))
                .build()
                .unwrap();
            let store = Store::builder("cancel")
                .slices([slice.erased()])
                .scheduler(Rc::new(TimeoutScheduler::new(Duration::from_millis(50))))
                .build()
                .unwrap();

            store.dispatch(slice.action("set", 1_i64).unwrap());
            tokio::time::sleep(Duration::from_millis(10)).await;
            store.destroy();
            tokio::time::sleep(Duration::from_millis(200)).await;

            assert!(!fired.get());
            assert!(store.is_destroyed());
        })
        .await;
}

#[tokio::test(start_paused = true)]
async fn configured_timeout_scheduler_delays_deferred_effects() {
    LocalSet::new()
        .run_until(async {
            let fired = Rc::new(Cell::new(false));
            let flag = Rc::clone(&fired);
            let slice = Slice::builder("n", Num { num: 0 })
                .serial_action("set", |_: &Rc<Num>, n: &i64, _: &StoreState| {
                    Rc::new(Num { num: *n })
                })
                .effect(Effect::<Num>::new("late").on_deferred_update(move |_, _, _| {
                    flag.set(true);
                    Ok(())
                }))
                .build()
                .unwrap();
            let store = Store::builder("configured")
                .slices([slice.erased()])
                .config(StoreConfig {
                    scheduler: SchedulerConfig::Timeout { delay_ms: 500 },
                    ..StoreConfig::default()
                })
                .build()
                .unwrap();

            store.dispatch(slice.action("set", 1_i64).unwrap());
            tokio::time::sleep(Duration::from_millis(100)).await;
            assert!(!fired.get());
            tokio::time::sleep(Duration::from_millis(500)).await;
            assert!(fired.get());
        })
        .await;
}

#[tokio::test(start_paused = true)]
async fn effect_cannot_reach_slices_outside_its_dependencies() {
    LocalSet::new()
        .run_until(async {
            let outcome = Rc::new(RefCell::new(None));
            let captured = Rc::clone(&outcome);
            let unrelated = counter("unrelated", 0);
            let target = unrelated.clone();
            let nosy = Slice::builder("nosy", Num { num: 0 })
                .serial_action("set", |_: &Rc<Num>, n: &i64, _: &StoreState| {
                    Rc::new(Num { num: *n })
                })
                .effect(Effect::<Num>::new("peek").on_sync_update(
                    move |_, store: &ReducedStore, _| {
                        *captured.borrow_mut() = Some(store.get(&target).err());
                        Ok(())
                    },
                ))
                .build()
                .unwrap();
            let store = Store::builder("scope")
                .slices([unrelated.erased(), nosy.erased()])
                .build()
                .unwrap();

            store.dispatch(nosy.action("set", 1_i64).unwrap());
            settle().await;

            assert_eq!(
                *outcome.borrow(),
                Some(Some(StoreError::SliceOutOfScope {
                    slice: "unrelated".into(),
                    store: "scope".into(),
                }))
            );
        })
        .await;
}

#[test]
fn reduced_store_mirrors_included_slices() {
    let a = counter("a", 1);
    let b = counter("b", 2);
    let store = Store::builder("parent")
        .slices([a.erased(), b.erased()])
        .disable_side_effects()
        .build()
        .unwrap();
    let view = store.reduced([a.erased()]);

    store.dispatch(a.action("set", 10_i64).unwrap());
    assert_eq!(view.get(&a).unwrap(), store.get(&a).unwrap());
    assert!(view.get(&b).is_err());
    assert_eq!(view.name(), "parent");

    view.destroy();
    assert!(store.is_destroyed());
}

/// A `set` slice over `deps` with no effects.
fn plain(key: &str, deps: &[&Slice<Num>]) -> Slice<Num> {
    deps.iter()
        .fold(Slice::builder(key, Num { num: 0 }), |b, dep| b.dependency(*dep))
        .serial_action("set", |_: &Rc<Num>, n: &i64, _: &StoreState| Rc::new(Num { num: *n }))
        .build()
        .unwrap()
}

#[tokio::test(start_paused = true)]
async fn change_reaches_effects_through_transitive_dependencies() {
    LocalSet::new()
        .run_until(async {
            let order = log();
            let root = plain("root", &[]);
            let mid = plain("mid", &[&root]);
            let leaf = logging_counter("leaf", &[&mid], "leaf", &order);
            let store = Store::builder("transitive")
                .slices([root.erased(), mid.erased(), leaf.erased()])
                .build()
                .unwrap();

            store.dispatch(root.action("set", 1_i64).unwrap());
            settle().await;

            assert_eq!(*order.borrow(), vec!["leaf"]);
        })
        .await;
}

#[tokio::test(start_paused = true)]
async fn diamond_dependency_runs_shared_dependent_once() {
    LocalSet::new()
        .run_until(async {
            let order = log();
            let base = plain("base", &[]);
            let left = plain("left", &[&base]);
            let right = plain("right", &[&base]);
            let leaf = logging_counter("leaf", &[&left, &right], "leaf", &order);
            let store = Store::builder("diamond")
                .slices([base.erased(), left.erased(), right.erased(), leaf.erased()])
                .build()
                .unwrap();

            store.dispatch(base.action("set", 1_i64).unwrap());
            settle().await;

            assert_eq!(*order.borrow(), vec!["leaf"]);
        })
        .await;
}
