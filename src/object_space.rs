//! Enumerable weak tracking of live objects.
//!
//! The weak-variant counterpart of the finalizer category: the runtime's
//! object-space introspection registers every object it wants to enumerate,
//! reads still-live targets through the handles, and relies on the default
//! dead-handle processing (plain removal) to keep the registry from
//! accumulating garbage entries.

use std::sync::Arc;

use crate::error::RefProcResult;
use crate::processor::ReferenceProcessor;
use crate::reference::WeakReference;
use crate::registry::ReferenceRegistry;
use crate::runtime::RuntimeContext;
use crate::service::ReferenceService;

const OBJECT_SPACE_CATEGORY: &str = "object-space";

/// Weak-reference bookkeeping for object-space enumeration.
pub struct ObjectSpaceService<T: Send + Sync + 'static> {
    context: Arc<RuntimeContext>,
    processor: Arc<ReferenceProcessor>,
    registry: ReferenceRegistry<WeakReference<T>>,
}

impl<T: Send + Sync + 'static> ObjectSpaceService<T> {
    pub fn new(context: Arc<RuntimeContext>, processor: Arc<ReferenceProcessor>) -> Arc<Self> {
        Arc::new(Self {
            context,
            processor,
            registry: ReferenceRegistry::new(),
        })
    }

    /// Start tracking `target` without keeping it reachable.
    pub fn track(self: &Arc<Self>, target: &Arc<T>) -> RefProcResult<WeakReference<T>> {
        let reference = WeakReference::new(target, self);
        self.registry.add(&reference);
        self.processor.process_reference_queue(OBJECT_SPACE_CATEGORY)?;
        Ok(reference)
    }

    /// Stop tracking explicitly, ahead of any collector notification.
    pub fn untrack(&self, reference: &WeakReference<T>) -> bool {
        self.registry.remove(reference)
    }

    /// Every tracked object that is still reachable, in reverse
    /// registration order.
    pub fn each_object(&self) -> Vec<Arc<T>> {
        self.registry
            .snapshot()
            .iter()
            .filter_map(|reference| reference.get())
            .collect()
    }

    /// Number of tracked handles, dead targets included until their
    /// notifications are processed.
    pub fn tracked(&self) -> usize {
        self.registry.len()
    }
}

impl<T: Send + Sync + 'static> ReferenceService for ObjectSpaceService<T> {
    type Ref = WeakReference<T>;

    fn registry(&self) -> &ReferenceRegistry<Self::Ref> {
        &self.registry
    }

    fn context(&self) -> &Arc<RuntimeContext> {
        &self.context
    }
}
