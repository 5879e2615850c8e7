//! Transactions: queued writes, one notification pass per batch.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use cascade_core::{Atom, Engine, Handle, Registry, Selector};

struct Fixture {
    engine: Engine,
    width: Handle<u32>,
    height: Handle<u32>,
    area: Handle<u32>,
    notified: Arc<AtomicUsize>,
}

fn fixture() -> Fixture {
    let registry = Arc::new(Registry::new());
    let width = registry.atom(Atom::new("width").default(2_u32)).unwrap();
    let height = registry.atom(Atom::new("height").default(3_u32)).unwrap();
    let (w, h) = (width.clone(), height.clone());
    let area = registry
        .selector(Selector::new("area", move |get| Ok(get.get(&w)? * get.get(&h)?)))
        .unwrap();

    let engine = Engine::new(registry);
    let notified = Arc::new(AtomicUsize::new(0));
    let n = notified.clone();
    engine.subscribe(&area, move || {
        n.fetch_add(1, Ordering::SeqCst);
    });
    engine.get(&area).unwrap();

    Fixture {
        engine,
        width,
        height,
        area,
        notified,
    }
}

/// Test that every write outside a batch notifies.
#[test]
fn unbatched_writes_notify_each_time() {
    let f = fixture();
    f.engine.set(&f.width, 4).unwrap();
    f.engine.get(&f.area).unwrap();
    f.engine.set(&f.height, 5).unwrap();
    assert_eq!(f.notified.load(Ordering::SeqCst), 2);
}

/// Test that subscribers run once, after the whole batch.
#[test]
fn batch_notifies_once_after_both_writes() {
    let f = fixture();
    let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));

    let (engine, area, s) = (f.engine.clone(), f.area.clone(), seen.clone());
    f.engine.subscribe(&f.area, move || {
        s.lock().push(engine.get(&area).ok().and_then(|area| area.value().copied()));
    });

    f.engine
        .batch(|| {
            f.engine.set(&f.width, 4).unwrap();
            f.engine.set(&f.height, 5).unwrap();
            assert_eq!(f.notified.load(Ordering::SeqCst), 0);
        })
        .unwrap();

    assert_eq!(f.notified.load(Ordering::SeqCst), 1);
    assert_eq!(*seen.lock(), vec![Some(20)]);
}

/// Test that queued writes wait for the commit.
#[test]
fn writes_inside_a_batch_are_not_visible_until_it_closes() {
    let f = fixture();
    let tx = f.engine.transaction();
    f.engine.set(&f.width, 10).unwrap();
    assert_eq!(f.engine.get(&f.width).unwrap().value(), Some(&2));
    tx.commit().unwrap();
    assert_eq!(f.engine.get(&f.width).unwrap().value(), Some(&10));
}

/// Test that dropping a transaction commits it.
#[test]
fn dropping_a_transaction_applies_its_writes() {
    let f = fixture();
    {
        let _tx = f.engine.transaction();
        f.engine.set(&f.width, 7).unwrap();
    }
    assert_eq!(f.engine.get(&f.area).unwrap().value(), Some(&21));
    assert_eq!(f.notified.load(Ordering::SeqCst), 1);
}

/// Test that queued updaters run in order.
#[test]
fn updaters_see_earlier_writes_in_the_same_batch() {
    let f = fixture();
    f.engine
        .batch(|| {
            f.engine.set(&f.width, 1).unwrap();
            f.engine.update(&f.width, |w| w + 1).unwrap();
            f.engine.update(&f.width, |w| w * 10).unwrap();
        })
        .unwrap();
    assert_eq!(f.engine.get(&f.width).unwrap().value(), Some(&20));
}
