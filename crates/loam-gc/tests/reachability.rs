//! Reachability and reclamation scenarios.

use std::cell::RefCell;
use std::rc::Rc;

use loam_gc::{ArrayBody, Collector, Config, ObjectBody, RootProvider, RootSink, Value};

/// Root set the test mutates after registration.
#[derive(Clone, Default)]
struct SharedRoots(Rc<RefCell<Vec<Value>>>);

impl RootProvider for SharedRoots {
    fn enumerate_roots(&mut self, sink: &mut RootSink<'_, '_>) {
        for value in self.0.borrow().iter() {
            sink.mark(*value);
        }
    }
}

fn small_collector() -> (Collector, SharedRoots) {
    let mut gc = Collector::with_config(Config {
        min_arena_slots: 128,
        free_min: 8,
        ..Config::default()
    })
    .expect("collector");
    let roots = SharedRoots::default();
    gc.register_root_provider(Box::new(roots.clone()));
    (gc, roots)
}

fn new_array(gc: &mut Collector, elems: Vec<Value>) -> Value {
    gc.new_object(Value::True, ObjectBody::Array(ArrayBody::Owned(elems)))
        .expect("allocation")
}

#[test]
fn rooted_objects_survive_collection() {
    let (mut gc, roots) = small_collector();

    let mut values = Vec::new();
    for _ in 0..10 {
        let v = new_array(&mut gc, Vec::new());
        roots.0.borrow_mut().push(v);
        values.push(v);
    }

    for _ in 0..3 {
        gc.collect().unwrap();
    }

    assert_eq!(gc.statistics().objects, 10);
    for v in values {
        let id = gc.identity_of(v);
        assert_eq!(gc.resolve(id).unwrap(), v);
    }
}

#[test]
fn unreachable_objects_are_reclaimed_and_slots_reused() {
    let (mut gc, roots) = small_collector();

    let kept = new_array(&mut gc, Vec::new());
    roots.0.borrow_mut().push(kept);
    let dropped = new_array(&mut gc, Vec::new());
    let dropped_id = gc.identity_of(dropped);
    let free_before = gc.statistics().free_slots;

    gc.collect().unwrap();

    assert!(gc.resolve(dropped_id).is_err());
    assert_eq!(gc.resolve(gc.identity_of(kept)).unwrap(), kept);
    assert!(gc.statistics().free_slots > free_before);

    // The reclaimed slot is reusable: keep allocating and it comes back.
    let total = gc.statistics().total_slots;
    let mut reused = false;
    for _ in 0..2 * total {
        let slot = gc.allocate().unwrap();
        if gc.identity_of(Value::Object(slot)) == dropped_id {
            reused = true;
            break;
        }
    }
    assert!(reused, "freed slot never came back from the free list");
}

#[test]
fn chain_is_kept_alive_through_its_root() {
    let (mut gc, roots) = small_collector();

    // A -> B -> C, with temporary roots while building bottom-up.
    let c = new_array(&mut gc, Vec::new());
    roots.0.borrow_mut().push(c);
    let b = new_array(&mut gc, vec![c]);
    roots.0.borrow_mut().push(b);
    let a = new_array(&mut gc, vec![b]);
    roots.0.borrow_mut().push(a);

    let ids = [a, b, c].map(|v| gc.identity_of(v));

    // Only A stays rooted; B and C survive through it.
    *roots.0.borrow_mut() = vec![a];
    gc.collect().unwrap();
    for id in ids {
        assert!(gc.resolve(id).is_ok());
    }

    // Dropping the root to A reclaims the whole chain.
    roots.0.borrow_mut().clear();
    gc.collect().unwrap();
    for id in ids {
        assert!(gc.resolve(id).is_err());
    }
    assert_eq!(gc.statistics().objects, 0);
}

#[test]
fn middle_root_keeps_only_the_tail() {
    let (mut gc, roots) = small_collector();

    let c = new_array(&mut gc, Vec::new());
    roots.0.borrow_mut().push(c);
    let b = new_array(&mut gc, vec![c]);
    roots.0.borrow_mut().push(b);
    let a = new_array(&mut gc, vec![b]);
    roots.0.borrow_mut().push(a);

    let [a_id, b_id, c_id] = [a, b, c].map(|v| gc.identity_of(v));

    // Keep a root to B only: B and C survive, A is freed.
    *roots.0.borrow_mut() = vec![b];
    gc.collect().unwrap();

    assert!(gc.resolve(a_id).is_err());
    assert!(gc.resolve(b_id).is_ok());
    assert!(gc.resolve(c_id).is_ok());
    assert_eq!(gc.statistics().objects, 2);
}

#[test]
fn cyclic_garbage_is_reclaimed() {
    let (mut gc, roots) = small_collector();

    // a <-> b through a hash, unreachable once the roots go away.
    let a = new_array(&mut gc, Vec::new());
    roots.0.borrow_mut().push(a);
    let b = gc
        .new_object(
            Value::True,
            ObjectBody::Hash(loam_gc::HashBody {
                entries: vec![(Value::Fixnum(0), a)],
                default: a,
            }),
        )
        .unwrap();
    roots.0.borrow_mut().push(b);

    let ids = [a, b].map(|v| gc.identity_of(v));
    gc.collect().unwrap();
    for id in ids {
        assert!(gc.resolve(id).is_ok());
    }

    roots.0.borrow_mut().clear();
    gc.collect().unwrap();
    for id in ids {
        assert!(gc.resolve(id).is_err());
    }
}

#[test]
fn registered_addresses_are_roots() {
    let (mut gc, _roots) = small_collector();

    let v = new_array(&mut gc, Vec::new());
    let id = gc.identity_of(v);
    let holder = Box::leak(Box::new(v));
    let addr = std::ptr::NonNull::from(&mut *holder);

    // SAFETY: the leaked box outlives the registration.
    unsafe { gc.register_address(addr) };
    gc.collect().unwrap();
    assert!(gc.resolve(id).is_ok());

    gc.unregister_address(addr);
    gc.collect().unwrap();
    assert!(gc.resolve(id).is_err());
}
