//! Heap growth under allocation pressure.

use std::cell::RefCell;
use std::rc::Rc;

use loam_gc::{ArrayBody, Collector, Config, ObjectBody, RootProvider, RootSink, Value};

#[derive(Clone, Default)]
struct SharedRoots(Rc<RefCell<Vec<Value>>>);

impl RootProvider for SharedRoots {
    fn enumerate_roots(&mut self, sink: &mut RootSink<'_, '_>) {
        for value in self.0.borrow().iter() {
            sink.mark(*value);
        }
    }
}

fn collector() -> (Collector, SharedRoots) {
    let mut gc = Collector::with_config(Config {
        min_arena_slots: 64,
        free_min: 4,
        ..Config::default()
    })
    .expect("collector");
    let roots = SharedRoots::default();
    gc.register_root_provider(Box::new(roots.clone()));
    (gc, roots)
}

#[test]
fn retained_allocations_grow_the_arena_count() {
    let (mut gc, roots) = collector();
    assert_eq!(gc.statistics().arenas, 1);

    let mut last_arenas = 1;
    for round in 1..=6 {
        for _ in 0..64 {
            let v = gc
                .new_object(Value::True, ObjectBody::Array(ArrayBody::Owned(Vec::new())))
                .unwrap();
            roots.0.borrow_mut().push(v);
        }
        let arenas = gc.statistics().arenas;
        assert!(
            arenas >= last_arenas,
            "arena count regressed in round {round}"
        );
        last_arenas = arenas;
    }

    assert!(last_arenas > 1);
    assert_eq!(gc.statistics().objects, 6 * 64);
}

#[test]
fn disabled_collection_grows_instead_of_collecting() {
    let (mut gc, _roots) = collector();
    assert!(!gc.disable());
    assert!(gc.disable(), "second disable reports the previous state");

    // Nothing is rooted; with collection enabled this would be reclaimed.
    for _ in 0..200 {
        let _ = gc
            .new_object(Value::True, ObjectBody::Float(0.25))
            .unwrap();
    }
    assert_eq!(gc.cycles(), 0, "no cycle may run while disabled");
    assert!(gc.statistics().arenas > 1);

    assert!(gc.enable(), "enable reports the previous (disabled) state");
    gc.collect().unwrap();
    assert!(gc.cycles() > 0);
    assert_eq!(gc.statistics().objects, 0);
}

#[test]
fn fully_free_arenas_are_retired_after_pressure_drops() {
    let (mut gc, roots) = collector();

    // Inflate the heap with rooted objects, then drop them all.
    for _ in 0..500 {
        let v = gc
            .new_object(Value::True, ObjectBody::Float(1.0))
            .unwrap();
        roots.0.borrow_mut().push(v);
    }
    let inflated = gc.statistics().arenas;
    assert!(inflated > 1);

    roots.0.borrow_mut().clear();
    gc.collect().unwrap();

    // Emptied arenas beyond the free target were retired and released.
    assert!(gc.statistics().arenas < inflated);
    assert_eq!(gc.statistics().objects, 0);
}

#[test]
fn adaptive_accounting_triggers_a_cycle() {
    let (mut gc, _roots) = collector();
    let before = gc.cycles();
    // Far past the default 8 MB adaptive limit in one step.
    gc.account_allocation(64 * 1024 * 1024);
    assert!(gc.cycles() > before);
}
