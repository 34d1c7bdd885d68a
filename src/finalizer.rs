//! User-defined finalizer category.
//!
//! Objects register cleanup actions that run after the collector reports
//! them unreachable. Each tracked object gets one phantom reference carrying
//! its action list; actions are tagged with an owner token so a subsystem
//! can withdraw the ones it registered. Processing a dead handle removes
//! the node, then runs every action through the error-isolation wrapper —
//! one faulty finalizer never stops the shared consumer.

use std::hash::Hash;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use dashmap::DashMap;
use parking_lot::Mutex;

use crate::error::{CleanupError, RefProcResult};
use crate::processor::ReferenceProcessor;
use crate::reference::PhantomReference;
use crate::registry::ReferenceRegistry;
use crate::runtime::RuntimeContext;
use crate::service::{ReferenceService, run_catching_errors};

const FINALIZER_CATEGORY: &str = "finalizers";

/// A finalizer action that runs once its object is unreachable.
pub type FinalizerFn = Box<dyn FnOnce() -> Result<(), CleanupError> + Send + 'static>;

struct Finalizer {
    owner: &'static str,
    run: FinalizerFn,
}

/// Payload of a finalizer reference: the key it was registered under plus
/// the pending actions.
pub struct FinalizerPayload<K: Send + Sync + 'static> {
    key: K,
    finalizers: Mutex<Vec<Finalizer>>,
}

impl<K: Send + Sync + 'static> FinalizerPayload<K> {
    pub fn key(&self) -> &K {
        &self.key
    }

    pub fn pending_actions(&self) -> usize {
        self.finalizers.lock().len()
    }
}

/// Phantom reference carrying an object's finalizer actions.
pub type FinalizerReference<K> = PhantomReference<FinalizerPayload<K>>;

/// Registry of user-defined finalizers, keyed by an embedder-chosen object
/// identity (typically the object's address or handle).
///
/// # Examples
///
/// ```
/// use std::sync::Arc;
/// use refproc::finalizer::FinalizerService;
/// use refproc::processor::ReferenceProcessor;
/// use refproc::reference::ProcessingReference;
/// use refproc::runtime::{RuntimeContext, RuntimeOptions};
///
/// let context = RuntimeContext::initialized(RuntimeOptions {
///     single_threaded: true,
///     debug: false,
/// });
/// let processor = Arc::new(ReferenceProcessor::new(Arc::clone(&context)));
/// let finalizers = FinalizerService::new(context, Arc::clone(&processor));
///
/// let reference = finalizers
///     .register(0x4000u64, "io", Box::new(|| Ok(())))
///     .unwrap();
///
/// // The collector reports the object dead:
/// processor.queue().push(reference.as_notification());
/// processor.drain_reference_queue().unwrap();
/// assert!(reference.is_tombstoned());
/// assert_eq!(finalizers.pending(), 0);
/// ```
pub struct FinalizerService<K: Eq + Hash + Clone + Send + Sync + 'static> {
    context: Arc<RuntimeContext>,
    processor: Arc<ReferenceProcessor>,
    registry: ReferenceRegistry<FinalizerReference<K>>,
    by_key: DashMap<K, FinalizerReference<K>>,
    total_registered: AtomicUsize,
    total_finalized: AtomicUsize,
}

impl<K: Eq + Hash + Clone + Send + Sync + 'static> FinalizerService<K> {
    pub fn new(context: Arc<RuntimeContext>, processor: Arc<ReferenceProcessor>) -> Arc<Self> {
        Arc::new(Self {
            context,
            processor,
            registry: ReferenceRegistry::new(),
            by_key: DashMap::new(),
            total_registered: AtomicUsize::new(0),
            total_finalized: AtomicUsize::new(0),
        })
    }

    /// Register `action` to run once the object identified by `key` becomes
    /// unreachable. A key already being tracked gets the action appended to
    /// its existing reference.
    ///
    /// Registration is what creates the consumer thread on first real
    /// demand (or drains synchronously in constrained embeddings).
    pub fn register(
        self: &Arc<Self>,
        key: K,
        owner: &'static str,
        action: FinalizerFn,
    ) -> RefProcResult<FinalizerReference<K>> {
        use dashmap::mapref::entry::Entry;

        let reference = match self.by_key.entry(key.clone()) {
            Entry::Occupied(entry) => {
                let reference = entry.get().clone();
                reference
                    .payload()
                    .finalizers
                    .lock()
                    .push(Finalizer { owner, run: action });
                reference
            }
            Entry::Vacant(entry) => {
                let payload = FinalizerPayload {
                    key,
                    finalizers: Mutex::new(vec![Finalizer { owner, run: action }]),
                };
                let reference = PhantomReference::new(payload, self);
                self.registry.add(&reference);
                entry.insert(reference.clone());
                reference
            }
        };

        self.total_registered.fetch_add(1, Ordering::Relaxed);
        self.processor.process_reference_queue(FINALIZER_CATEGORY)?;
        Ok(reference)
    }

    /// Withdraw every action `owner` registered for `key`. When no actions
    /// remain the reference itself is removed from the registry; a collector
    /// notification for the same node arriving later is then a no-op.
    pub fn unregister(&self, key: &K, owner: &'static str) {
        let Some(reference) = self.by_key.get(key).map(|entry| entry.value().clone()) else {
            return;
        };

        reference
            .payload()
            .finalizers
            .lock()
            .retain(|finalizer| finalizer.owner != owner);

        if let Some((_, removed)) = self
            .by_key
            .remove_if(key, |_, r| r.payload().finalizers.lock().is_empty())
        {
            self.registry.remove(&removed);
        }
    }

    /// The reference currently tracking `key`, if any.
    pub fn reference_for(&self, key: &K) -> Option<FinalizerReference<K>> {
        self.by_key.get(key).map(|entry| entry.value().clone())
    }

    /// Keys with pending finalizers, in reverse registration order. Used by
    /// runtime introspection to list objects that still await finalization.
    pub fn pending_keys(&self) -> Vec<K> {
        self.registry
            .snapshot()
            .iter()
            .map(|reference| reference.payload().key().clone())
            .collect()
    }

    pub fn pending(&self) -> usize {
        self.registry.len()
    }

    pub fn get_stats(&self) -> FinalizerServiceStats {
        FinalizerServiceStats {
            total_registered: self.total_registered.load(Ordering::Relaxed),
            total_finalized: self.total_finalized.load(Ordering::Relaxed),
            currently_pending: self.pending(),
        }
    }
}

impl<K: Eq + Hash + Clone + Send + Sync + 'static> ReferenceService for FinalizerService<K> {
    type Ref = FinalizerReference<K>;

    fn registry(&self) -> &ReferenceRegistry<Self::Ref> {
        &self.registry
    }

    fn context(&self) -> &Arc<RuntimeContext> {
        &self.context
    }

    fn process_reference(&self, dead: &Self::Ref) -> RefProcResult<()> {
        self.by_key.remove(dead.payload().key());
        self.registry.remove(dead);

        let finalizers = std::mem::take(&mut *dead.payload().finalizers.lock());
        for finalizer in finalizers {
            run_catching_errors(&self.context, dead, |_| (finalizer.run)())?;
        }

        self.total_finalized.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

/// Statistics for a finalizer service.
#[derive(Debug, Clone)]
pub struct FinalizerServiceStats {
    pub total_registered: usize,
    pub total_finalized: usize,
    pub currently_pending: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reference::ProcessingReference;
    use crate::runtime::RuntimeOptions;
    use std::sync::atomic::AtomicBool;

    fn service() -> (Arc<FinalizerService<u64>>, Arc<ReferenceProcessor>) {
        let context = RuntimeContext::initialized(RuntimeOptions {
            single_threaded: true,
            debug: false,
        });
        let processor = Arc::new(ReferenceProcessor::new(Arc::clone(&context)));
        let finalizers = FinalizerService::new(context, Arc::clone(&processor));
        (finalizers, processor)
    }

    #[test]
    fn dead_notification_runs_registered_actions() {
        let (finalizers, processor) = service();
        let ran = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&ran);

        let reference = finalizers
            .register(
                1,
                "test",
                Box::new(move || {
                    flag.store(true, Ordering::Release);
                    Ok(())
                }),
            )
            .unwrap();

        processor.queue().push(reference.as_notification());
        processor.drain_reference_queue().unwrap();

        assert!(ran.load(Ordering::Acquire));
        assert!(reference.is_tombstoned());
        assert_eq!(finalizers.pending(), 0);
        assert_eq!(finalizers.get_stats().total_finalized, 1);
    }

    #[test]
    fn same_key_appends_to_one_reference() {
        let (finalizers, _processor) = service();
        let first = finalizers.register(7, "a", Box::new(|| Ok(()))).unwrap();
        let second = finalizers.register(7, "b", Box::new(|| Ok(()))).unwrap();

        assert_eq!(first.id(), second.id());
        assert_eq!(first.payload().pending_actions(), 2);
        assert_eq!(finalizers.pending(), 1);
        assert_eq!(finalizers.get_stats().total_registered, 2);
    }

    #[test]
    fn unregister_withdraws_one_owners_actions() {
        let (finalizers, processor) = service();
        let ran_a = Arc::new(AtomicBool::new(false));
        let ran_b = Arc::new(AtomicBool::new(false));
        let flag_a = Arc::clone(&ran_a);
        let flag_b = Arc::clone(&ran_b);

        let reference = finalizers
            .register(
                9,
                "a",
                Box::new(move || {
                    flag_a.store(true, Ordering::Release);
                    Ok(())
                }),
            )
            .unwrap();
        finalizers
            .register(
                9,
                "b",
                Box::new(move || {
                    flag_b.store(true, Ordering::Release);
                    Ok(())
                }),
            )
            .unwrap();

        finalizers.unregister(&9, "a");
        assert_eq!(reference.payload().pending_actions(), 1);

        processor.queue().push(reference.as_notification());
        processor.drain_reference_queue().unwrap();
        assert!(!ran_a.load(Ordering::Acquire));
        assert!(ran_b.load(Ordering::Acquire));
    }

    #[test]
    fn unregister_of_last_owner_drops_the_reference() {
        let (finalizers, processor) = service();
        let reference = finalizers.register(3, "only", Box::new(|| Ok(()))).unwrap();

        finalizers.unregister(&3, "only");
        assert!(reference.is_tombstoned());
        assert_eq!(finalizers.pending(), 0);
        assert!(finalizers.reference_for(&3).is_none());

        // The collector notification for the same node arrives afterwards;
        // removal is at-most-once, so this is a harmless no-op.
        processor.queue().push(reference.as_notification());
        processor.drain_reference_queue().unwrap();
        assert!(reference.is_tombstoned());
    }

    #[test]
    fn pending_keys_enumerates_in_reverse_registration_order() {
        let (finalizers, _processor) = service();
        for key in [10, 11, 12] {
            finalizers.register(key, "test", Box::new(|| Ok(()))).unwrap();
        }
        assert_eq!(finalizers.pending_keys(), vec![12, 11, 10]);
    }

    #[test]
    fn failing_action_does_not_block_later_ones() {
        let (finalizers, processor) = service();
        let ran = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&ran);

        let failing = finalizers
            .register(
                20,
                "test",
                Box::new(|| Err(CleanupError::Failed("broken".into()))),
            )
            .unwrap();
        let panicking = finalizers
            .register(21, "test", Box::new(|| panic!("finalizer bug")))
            .unwrap();
        let healthy = finalizers
            .register(
                22,
                "test",
                Box::new(move || {
                    flag.store(true, Ordering::Release);
                    Ok(())
                }),
            )
            .unwrap();

        processor.queue().push(failing.as_notification());
        processor.queue().push(panicking.as_notification());
        processor.queue().push(healthy.as_notification());
        assert_eq!(processor.drain_reference_queue().unwrap(), 3);

        assert!(ran.load(Ordering::Acquire));
        assert!(failing.is_tombstoned());
        assert!(panicking.is_tombstoned());
        assert!(healthy.is_tombstoned());
    }

    #[test]
    fn termination_stops_the_drain_and_leaves_the_rest_queued() {
        let (finalizers, processor) = service();

        let terminating = finalizers
            .register(30, "test", Box::new(|| Err(CleanupError::Termination)))
            .unwrap();
        let later = finalizers.register(31, "test", Box::new(|| Ok(()))).unwrap();

        processor.queue().push(terminating.as_notification());
        processor.queue().push(later.as_notification());

        assert!(processor.drain_reference_queue().is_err());
        assert_eq!(processor.pending(), 1);
        assert!(!later.is_tombstoned());
    }
}
