//! Per-category registry of live processing references.
//!
//! A singly-rooted doubly-linked list with O(1) insert and remove. The list
//! topology (head pointer plus the id-keyed table of strong handles) lives
//! behind one mutex per registry instance; the lock is held for the full
//! duration of every operation, but only for pointer surgery, never across a
//! cleanup action.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;

use crate::reference::{ProcessingReference, ReferenceId};

struct RegistryInner<R> {
    head: Option<ReferenceId>,
    // Strong handles of all currently linked nodes. This table is what keeps
    // references alive for processing after the collector lets go of them.
    nodes: HashMap<ReferenceId, R>,
}

/// Doubly-linked list of live processing references for one finalization
/// category.
///
/// # Examples
///
/// ```
/// use std::sync::Arc;
/// use refproc::object_space::ObjectSpaceService;
/// use refproc::processor::ReferenceProcessor;
/// use refproc::runtime::{RuntimeContext, RuntimeOptions};
/// use refproc::{ProcessingReference, ReferenceService, WeakReference};
///
/// let context = RuntimeContext::initialized(RuntimeOptions::default());
/// let processor = Arc::new(ReferenceProcessor::new(Arc::clone(&context)));
/// let space = ObjectSpaceService::new(context, processor);
///
/// let target = Arc::new(1u32);
/// let reference = WeakReference::new(&target, &space);
/// space.registry().add(&reference);
/// assert_eq!(space.registry().len(), 1);
///
/// assert!(space.registry().remove(&reference));
/// assert!(reference.is_tombstoned());
/// // At-most-once semantics: the second removal is a no-op.
/// assert!(!space.registry().remove(&reference));
/// ```
pub struct ReferenceRegistry<R: ProcessingReference> {
    inner: Mutex<RegistryInner<R>>,
    total_added: AtomicUsize,
    total_removed: AtomicUsize,
}

impl<R: ProcessingReference> ReferenceRegistry<R> {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(RegistryInner {
                head: None,
                nodes: HashMap::new(),
            }),
            total_added: AtomicUsize::new(0),
            total_removed: AtomicUsize::new(0),
        }
    }

    /// Link `reference` at the head of the list. O(1).
    ///
    /// The reference must not be linked or tombstoned already; a violation
    /// is an internal-consistency fault.
    pub fn add(&self, reference: &R) {
        let mut inner = self.inner.lock();
        let id = reference.id();

        if reference.is_tombstoned() || inner.nodes.contains_key(&id) {
            panic!("processing reference {id:?} added while already linked or removed");
        }

        if let Some(head_id) = inner.head {
            let head = inner
                .nodes
                .get(&head_id)
                .unwrap_or_else(|| missing_node(head_id));
            reference.node().set_next(Some(head_id));
            head.node().set_previous(Some(id));
        }
        inner.head = Some(id);
        inner.nodes.insert(id, reference.clone());
        self.total_added.fetch_add(1, Ordering::Relaxed);
    }

    /// Unlink `reference` and tombstone it. O(1).
    ///
    /// Returns `false` if the reference was already removed: the same node
    /// may be presented more than once, e.g. once explicitly and once via a
    /// collector notification.
    pub fn remove(&self, reference: &R) -> bool {
        let mut inner = self.inner.lock();

        if reference.is_tombstoned() {
            // Already removed.
            return false;
        }

        let id = reference.id();
        let next = reference.node().next();
        let previous = reference.node().previous();

        if inner.head == Some(id) {
            // Advances to the next node, or empties the list.
            inner.head = next;
        }

        if let Some(next_id) = next {
            inner
                .nodes
                .get(&next_id)
                .unwrap_or_else(|| missing_node(next_id))
                .node()
                .set_previous(previous);
        }
        if let Some(previous_id) = previous {
            inner
                .nodes
                .get(&previous_id)
                .unwrap_or_else(|| missing_node(previous_id))
                .node()
                .set_next(next);
        }

        inner.nodes.remove(&id);
        reference.node().tombstone();
        self.total_removed.fetch_add(1, Ordering::Relaxed);
        true
    }

    /// The most recently linked reference, for category-specific
    /// enumeration.
    pub fn first(&self) -> Option<R> {
        let inner = self.inner.lock();
        inner.head.map(|id| {
            inner
                .nodes
                .get(&id)
                .unwrap_or_else(|| missing_node(id))
                .clone()
        })
    }

    /// All linked references in list order (reverse registration order),
    /// collected under the registry lock.
    pub fn snapshot(&self) -> Vec<R> {
        let inner = self.inner.lock();
        let mut out = Vec::with_capacity(inner.nodes.len());
        let mut cursor = inner.head;
        while let Some(id) = cursor {
            let reference = inner
                .nodes
                .get(&id)
                .unwrap_or_else(|| missing_node(id));
            out.push(reference.clone());
            if out.len() > inner.nodes.len() {
                panic!("cycle in doubly-linked list of processing references at {id:?}");
            }
            cursor = reference.node().next();
        }
        out
    }

    pub fn len(&self) -> usize {
        self.inner.lock().nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().nodes.is_empty()
    }

    pub fn get_stats(&self) -> RegistryStats {
        RegistryStats {
            total_added: self.total_added.load(Ordering::Relaxed),
            total_removed: self.total_removed.load(Ordering::Relaxed),
            currently_linked: self.len(),
        }
    }
}

impl<R: ProcessingReference> Default for ReferenceRegistry<R> {
    fn default() -> Self {
        Self::new()
    }
}

fn missing_node(id: ReferenceId) -> ! {
    panic!("reference registry table is missing linked node {id:?}");
}

/// Statistics for one registry.
#[derive(Debug, Clone)]
pub struct RegistryStats {
    pub total_added: usize,
    pub total_removed: usize,
    pub currently_linked: usize,
}
