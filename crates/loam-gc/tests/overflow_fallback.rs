//! Mark-stack overflow recovery and deep-graph traversal.

use std::cell::RefCell;
use std::rc::Rc;

use loam_gc::{
    ArrayBody, ClassBody, Collector, Config, IdentTable, ObjectBody, RootProvider, RootSink,
    Value,
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

fn collector(config: Config) -> (Collector, SharedRoots) {
    let mut gc = Collector::with_config(config).expect("collector");
    let roots = SharedRoots::default();
    gc.register_root_provider(Box::new(roots.clone()));
    (gc, roots)
}

fn new_array(gc: &mut Collector, elems: Vec<Value>) -> Value {
    gc.new_object(Value::True, ObjectBody::Array(ArrayBody::Owned(elems)))
        .expect("allocation")
}

/// Build a `fanout`-ary tree of the given depth, rooting every created
/// object so it survives allocation-triggered cycles during construction.
fn build_tree(
    gc: &mut Collector,
    roots: &SharedRoots,
    depth: usize,
    fanout: usize,
    count: &mut usize,
) -> Value {
    let children = if depth == 0 {
        Vec::new()
    } else {
        (0..fanout)
            .map(|_| build_tree(gc, roots, depth - 1, fanout, count))
            .collect()
    };
    let node = new_array(gc, children);
    roots.0.borrow_mut().push(node);
    *count += 1;
    node
}

#[test]
fn overflowed_mark_stack_still_marks_everything() {
    // A tiny mark stack and recursion ceiling force overflow immediately.
    let (mut gc, roots) = collector(Config {
        min_arena_slots: 4096,
        free_min: 8,
        mark_stack_capacity: 4,
        mark_recursion_limit: 2,
        ..Config::default()
    });

    let mut count = 0;
    let root = build_tree(&mut gc, &roots, 5, 4, &mut count);
    assert_eq!(count, 1365);

    // Only the tree root stays rooted; everything must survive through it.
    *roots.0.borrow_mut() = vec![root];
    gc.collect().unwrap();
    assert_eq!(gc.statistics().objects, count);

    // A second cycle over the already-marked-and-reset heap agrees.
    gc.collect().unwrap();
    assert_eq!(gc.statistics().objects, count);

    // Dropping the root reclaims the whole tree even under overflow.
    roots.0.borrow_mut().clear();
    gc.collect().unwrap();
    assert_eq!(gc.statistics().objects, 0);
}

#[test]
fn deep_element_chain_survives_bounded_recursion() {
    let (mut gc, roots) = collector(Config {
        min_arena_slots: 4096,
        free_min: 8,
        ..Config::default()
    });

    // next points at the previous head through an array element, far past
    // the recursion ceiling.
    let mut head = new_array(&mut gc, Vec::new());
    roots.0.borrow_mut().push(head);
    for _ in 0..20_000 {
        head = new_array(&mut gc, vec![head]);
        roots.0.borrow_mut().push(head);
    }

    *roots.0.borrow_mut() = vec![head];
    gc.collect().unwrap();
    assert_eq!(gc.statistics().objects, 20_001);

    roots.0.borrow_mut().clear();
    gc.collect().unwrap();
    assert_eq!(gc.statistics().objects, 0);
}

#[test]
fn deep_superclass_chain_costs_no_mark_stack() {
    // Superclass links are tail references; even a tiny mark stack never
    // overflows on them.
    let (mut gc, roots) = collector(Config {
        min_arena_slots: 4096,
        free_min: 8,
        mark_stack_capacity: 2,
        mark_recursion_limit: 4,
        ..Config::default()
    });

    let mut superclass = Value::Nil;
    let mut last = Value::Nil;
    for _ in 0..10_000 {
        last = gc
            .new_object(
                Value::True,
                ObjectBody::Class(ClassBody {
                    superclass,
                    methods: IdentTable::new(),
                    ivars: IdentTable::new(),
                    module: false,
                }),
            )
            .unwrap();
        roots.0.borrow_mut().push(last);
        superclass = last;
    }

    *roots.0.borrow_mut() = vec![last];
    gc.collect().unwrap();
    assert_eq!(gc.statistics().objects, 10_000);
}
