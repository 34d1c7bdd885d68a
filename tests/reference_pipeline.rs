//! End-to-end pipeline: registration, enumeration, explicit removal, and
//! collector-driven processing against one shared processor.

use std::sync::Arc;

use refproc::object_space::ObjectSpaceService;
use refproc::processor::ReferenceProcessor;
use refproc::runtime::{RuntimeContext, RuntimeOptions};
use refproc::{CleanupError, FinalizerService, ProcessingReference, ReferenceService};

fn fixture() -> (Arc<RuntimeContext>, Arc<ReferenceProcessor>) {
    let context = RuntimeContext::initialized(RuntimeOptions {
        single_threaded: true,
        debug: false,
    });
    let processor = Arc::new(ReferenceProcessor::new(Arc::clone(&context)));
    (context, processor)
}

fn names(space: &ObjectSpaceService<String>) -> Vec<String> {
    space
        .each_object()
        .iter()
        .map(|name| name.to_string())
        .collect()
}

#[test]
fn register_enumerate_remove_then_collect() {
    let (context, processor) = fixture();
    let space = ObjectSpaceService::new(context, Arc::clone(&processor));

    let a = Arc::new(String::from("A"));
    let b = Arc::new(String::from("B"));
    let c = Arc::new(String::from("C"));

    let ref_a = space.track(&a).unwrap();
    let ref_b = space.track(&b).unwrap();
    let ref_c = space.track(&c).unwrap();

    // Traversal from the head yields reverse registration order.
    assert_eq!(names(&space), ["C", "B", "A"]);
    assert_eq!(space.registry().first().unwrap().id(), ref_c.id());

    assert!(space.untrack(&ref_b));
    assert_eq!(names(&space), ["C", "A"]);
    assert!(ref_b.is_tombstoned());

    // The collector reclaims C and delivers its dead handle.
    drop(c);
    processor.queue().push(ref_c.as_notification());
    assert_eq!(processor.drain_reference_queue().unwrap(), 1);

    assert_eq!(names(&space), ["A"]);
    assert!(ref_c.is_tombstoned());
    assert!(!ref_a.is_tombstoned());
}

#[test]
fn one_processor_serves_multiple_categories() {
    let (context, processor) = fixture();
    let space = ObjectSpaceService::new(Arc::clone(&context), Arc::clone(&processor));
    let finalizers = FinalizerService::new(context, Arc::clone(&processor));

    let tracked = Arc::new(String::from("tracked"));
    let weak = space.track(&tracked).unwrap();
    let phantom = finalizers
        .register(0xbeefu64, "io", Box::new(|| Ok(())))
        .unwrap();

    // Both dead handles land on the same queue; dispatch goes by each
    // notification's self-reported owner.
    drop(tracked);
    processor.queue().push(phantom.as_notification());
    processor.queue().push(weak.as_notification());
    assert_eq!(processor.drain_reference_queue().unwrap(), 2);

    assert!(weak.is_tombstoned());
    assert!(phantom.is_tombstoned());
    assert_eq!(space.tracked(), 0);
    assert_eq!(finalizers.pending(), 0);
}

#[test]
fn guest_errors_from_one_category_do_not_leak_into_another() {
    let (context, processor) = fixture();
    let space = ObjectSpaceService::new(Arc::clone(&context), Arc::clone(&processor));
    let finalizers = FinalizerService::new(context, Arc::clone(&processor));

    let raising = finalizers
        .register(
            1u64,
            "guest",
            Box::new(|| Err(CleanupError::GuestRaise("undefined method".into()))),
        )
        .unwrap();

    let tracked = Arc::new(String::from("survivor"));
    let weak = space.track(&tracked).unwrap();
    drop(tracked);

    processor.queue().push(raising.as_notification());
    processor.queue().push(weak.as_notification());
    assert_eq!(processor.drain_reference_queue().unwrap(), 2);

    assert!(raising.is_tombstoned());
    assert!(weak.is_tombstoned());
}
