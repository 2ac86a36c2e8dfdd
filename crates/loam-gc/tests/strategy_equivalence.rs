//! The inline and bitfield strategies must reclaim exactly the same
//! objects for the same heap shape and root set.

use std::cell::RefCell;
use std::rc::Rc;

use loam_gc::{
    ArrayBody, ClassBody, Collector, Config, HashBody, IdentTable, ObjectBody, RootProvider,
    RootSink, StrBody, Value,
};

#[derive(Clone, Default)]
struct SharedRoots(Rc<RefCell<Vec<Value>>>);

impl RootProvider for SharedRoots {
    fn enumerate_roots(&mut self, sink: &mut RootSink<'_, '_>) {
        for value in self.0.borrow().iter() {
            sink.mark(*value);
        }
    }
}

/// Build a fixed object graph, drop a fixed subset of roots, collect, and
/// report which of the created objects survived.
fn run_scenario(gc: &mut Collector, roots: &SharedRoots) -> Vec<bool> {
    let mut created = Vec::new();
    let mut track = |v: Value| {
        roots.0.borrow_mut().push(v);
        created.push(v);
    };

    let leaf = gc
        .new_object(Value::True, ObjectBody::Str(StrBody::Owned("leaf".into())))
        .unwrap();
    track(leaf);
    let shared = gc
        .new_object(Value::True, ObjectBody::Str(StrBody::Shared { origin: leaf }))
        .unwrap();
    track(shared);
    let arr = gc
        .new_object(Value::True, ObjectBody::Array(ArrayBody::Owned(vec![shared])))
        .unwrap();
    track(arr);
    let hash = gc
        .new_object(
            Value::True,
            ObjectBody::Hash(HashBody {
                entries: vec![(Value::Symbol(1), arr)],
                default: Value::Nil,
            }),
        )
        .unwrap();
    track(hash);
    let class = gc
        .new_object(
            Value::True,
            ObjectBody::Class(ClassBody {
                superclass: Value::Nil,
                methods: IdentTable::new(),
                ivars: IdentTable::new(),
                module: false,
            }),
        )
        .unwrap();
    track(class);
    let orphan_a = gc
        .new_object(Value::True, ObjectBody::Float(2.5))
        .unwrap();
    track(orphan_a);
    let orphan_b = gc
        .new_object(Value::True, ObjectBody::Array(ArrayBody::Owned(vec![orphan_a])))
        .unwrap();
    track(orphan_b);
    drop(track);

    // Keep the hash (which transitively holds arr, shared, leaf) and the
    // class; drop both orphans.
    *roots.0.borrow_mut() = vec![hash, class];
    gc.collect().unwrap();

    created
        .iter()
        .map(|v| gc.resolve(gc.identity_of(*v)).is_ok())
        .collect()
}

fn collector_with(cow: bool) -> (Collector, SharedRoots) {
    let mut gc = Collector::with_config(Config {
        min_arena_slots: 128,
        free_min: 8,
        ..Config::default()
    })
    .expect("collector");
    if cow {
        gc.use_bitfield_strategy();
    }
    let roots = SharedRoots::default();
    gc.register_root_provider(Box::new(roots.clone()));
    (gc, roots)
}

#[test]
fn both_strategies_reclaim_the_same_set() {
    let (mut inline_gc, inline_roots) = collector_with(false);
    let (mut bitfield_gc, bitfield_roots) = collector_with(true);

    assert!(!inline_gc.is_cow_friendly());
    assert!(bitfield_gc.is_cow_friendly());

    let inline_survivors = run_scenario(&mut inline_gc, &inline_roots);
    let bitfield_survivors = run_scenario(&mut bitfield_gc, &bitfield_roots);

    assert_eq!(inline_survivors, bitfield_survivors);
    assert_eq!(
        inline_survivors,
        vec![true, true, true, true, true, false, false]
    );
    assert_eq!(
        inline_gc.statistics().objects,
        bitfield_gc.statistics().objects
    );
}

#[test]
fn bitfield_collection_leaves_object_flags_untouched() {
    let (mut gc, roots) = collector_with(true);

    let v = gc
        .new_object(Value::True, ObjectBody::Array(ArrayBody::Owned(Vec::new())))
        .unwrap();
    roots.0.borrow_mut().push(v);
    let _ = gc
        .new_object(Value::True, ObjectBody::Float(9.0))
        .unwrap();

    gc.collect().unwrap();

    let slot = v.as_slot().unwrap();
    // SAFETY: v is rooted and live; the test owns the collector.
    assert!(unsafe { slot.as_ref() }.flags().is_empty());
}

#[test]
fn switching_strategies_between_cycles_is_safe() {
    let (mut gc, roots) = collector_with(false);

    let kept = gc
        .new_object(Value::True, ObjectBody::Array(ArrayBody::Owned(Vec::new())))
        .unwrap();
    roots.0.borrow_mut().push(kept);
    let dropped = gc
        .new_object(Value::True, ObjectBody::Float(1.0))
        .unwrap();
    let dropped_id = gc.identity_of(dropped);

    gc.collect().unwrap();
    gc.use_bitfield_strategy();
    gc.collect().unwrap();
    gc.use_inline_strategy();
    gc.collect().unwrap();

    assert!(gc.resolve(gc.identity_of(kept)).is_ok());
    assert!(gc.resolve(dropped_id).is_err());
    assert_eq!(gc.statistics().objects, 1);
}
