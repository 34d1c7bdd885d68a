//! Processing-reference handles and their linkage state.
//!
//! A processing reference pairs a tracked object with the doubly-linked-list
//! bookkeeping of its owning registry. Linkage "pointers" are
//! [`ReferenceId`]s rather than owning pointers: the registry's table holds
//! the strong handles and keeps references alive until they are processed,
//! so the tombstone self-loop never forms an `Arc` cycle.
//!
//! Two variants exist with identical linkage behavior:
//!
//! - [`WeakReference`] keeps the target readable (upgradeable) until the
//!   collector drops the last strong reference.
//! - [`PhantomReference`] exposes no target at all; the handle exists purely
//!   as an unreachability signal and carries the category payload needed by
//!   its cleanup action.

use std::any::Any;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::service::AnyService;

/// Process-unique identity of a processing reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ReferenceId(u64);

static NEXT_REFERENCE_ID: AtomicU64 = AtomicU64::new(1);

fn next_reference_id() -> ReferenceId {
    ReferenceId(NEXT_REFERENCE_ID.fetch_add(1, Ordering::Relaxed))
}

#[derive(Debug, Default, Clone, Copy)]
struct Links {
    next: Option<ReferenceId>,
    previous: Option<ReferenceId>,
}

/// Linkage state embedded in every reference variant: the id, the list
/// neighbors, and a non-owning back-reference to the owning service.
///
/// Link mutation happens only inside the owning registry's locked
/// operations; the setters are crate-private for that reason.
pub struct RefNode {
    id: ReferenceId,
    links: Mutex<Links>,
    service: Weak<dyn AnyService>,
}

impl RefNode {
    pub(crate) fn new(service: Weak<dyn AnyService>) -> Self {
        Self {
            id: next_reference_id(),
            links: Mutex::new(Links::default()),
            service,
        }
    }

    pub fn id(&self) -> ReferenceId {
        self.id
    }

    pub fn next(&self) -> Option<ReferenceId> {
        self.links.lock().next
    }

    pub fn previous(&self) -> Option<ReferenceId> {
        self.links.lock().previous
    }

    pub(crate) fn set_next(&self, next: Option<ReferenceId>) {
        let mut links = self.links.lock();
        check(self.id, links.previous, next);
        links.next = next;
    }

    pub(crate) fn set_previous(&self, previous: Option<ReferenceId>) {
        let mut links = self.links.lock();
        check(self.id, previous, links.next);
        links.previous = previous;
    }

    /// Whether this node has been removed from its registry.
    ///
    /// The removed state is the self-loop `next == previous == id`; a linked
    /// single-element list keeps both neighbors empty, so the two states are
    /// always distinguishable.
    pub fn is_tombstoned(&self) -> bool {
        self.links.lock().next == Some(self.id)
    }

    // The tombstone is the one write allowed to make next == previous; it
    // bypasses the checked setters.
    pub(crate) fn tombstone(&self) {
        let mut links = self.links.lock();
        links.next = Some(self.id);
        links.previous = Some(self.id);
    }

    /// The owning service, used by the processor purely for dispatch.
    pub fn service(&self) -> Option<Arc<dyn AnyService>> {
        self.service.upgrade()
    }
}

fn check(id: ReferenceId, previous: Option<ReferenceId>, next: Option<ReferenceId>) {
    if next.is_some() && next == previous {
        panic!("broken doubly-linked list of processing references: next == previous on {id:?}");
    }
}

impl std::fmt::Debug for RefNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let links = self.links.lock();
        f.debug_struct("RefNode")
            .field("id", &self.id)
            .field("next", &links.next)
            .field("previous", &links.previous)
            .finish()
    }
}

/// Type-erased dead-handle view carried on the processor queue.
pub trait AnyReference: Send + Sync + 'static {
    fn node(&self) -> &RefNode;
    fn as_any_arc(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

/// A dead handle as delivered by the collector to the processor queue.
pub type Notification = Arc<dyn AnyReference>;

/// Common surface of both reference variants.
pub trait ProcessingReference: Clone + Send + Sync + 'static {
    fn node(&self) -> &RefNode;

    fn id(&self) -> ReferenceId {
        self.node().id()
    }

    fn is_tombstoned(&self) -> bool {
        self.node().is_tombstoned()
    }

    /// The owning service, for dispatch after a notification arrives.
    fn service(&self) -> Option<Arc<dyn AnyService>> {
        self.node().service()
    }

    /// Erase this handle into the form carried on the processor queue.
    fn as_notification(&self) -> Notification;

    /// Recover a typed handle from an erased one. Returns `None` when the
    /// notification belongs to a different category.
    fn from_notification(notification: &Notification) -> Option<Self>;
}

struct WeakState<T: Send + Sync + 'static> {
    node: RefNode,
    target: Weak<T>,
}

impl<T: Send + Sync + 'static> AnyReference for WeakState<T> {
    fn node(&self) -> &RefNode {
        &self.node
    }

    fn as_any_arc(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

/// Weak variant: the target stays readable through this handle until the
/// collector reclaims it.
///
/// # Examples
///
/// ```
/// use std::sync::Arc;
/// use refproc::object_space::ObjectSpaceService;
/// use refproc::processor::ReferenceProcessor;
/// use refproc::reference::WeakReference;
/// use refproc::runtime::{RuntimeContext, RuntimeOptions};
///
/// let context = RuntimeContext::initialized(RuntimeOptions {
///     single_threaded: true,
///     debug: false,
/// });
/// let processor = Arc::new(ReferenceProcessor::new(Arc::clone(&context)));
/// let space = ObjectSpaceService::<u32>::new(context, processor);
///
/// let target = Arc::new(42u32);
/// let reference = WeakReference::new(&target, &space);
/// assert_eq!(reference.get().as_deref(), Some(&42));
///
/// drop(target);
/// assert!(reference.get().is_none());
/// ```
pub struct WeakReference<T: Send + Sync + 'static> {
    state: Arc<WeakState<T>>,
}

impl<T: Send + Sync + 'static> WeakReference<T> {
    pub fn new<S: AnyService>(target: &Arc<T>, service: &Arc<S>) -> Self {
        let service = Arc::downgrade(service);
        let service: Weak<dyn AnyService> = service;
        Self {
            state: Arc::new(WeakState {
                node: RefNode::new(service),
                target: Arc::downgrade(target),
            }),
        }
    }

    /// The tracked object, if the collector has not reclaimed it yet.
    pub fn get(&self) -> Option<Arc<T>> {
        self.state.target.upgrade()
    }
}

impl<T: Send + Sync + 'static> Clone for WeakReference<T> {
    fn clone(&self) -> Self {
        Self {
            state: Arc::clone(&self.state),
        }
    }
}

impl<T: Send + Sync + 'static> ProcessingReference for WeakReference<T> {
    fn node(&self) -> &RefNode {
        &self.state.node
    }

    fn as_notification(&self) -> Notification {
        let state = Arc::clone(&self.state);
        let state: Arc<dyn AnyReference> = state;
        state
    }

    fn from_notification(notification: &Notification) -> Option<Self> {
        Arc::clone(notification)
            .as_any_arc()
            .downcast::<WeakState<T>>()
            .ok()
            .map(|state| Self { state })
    }
}

impl<T: Send + Sync + 'static> std::fmt::Debug for WeakReference<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("WeakReference").field(&self.state.node).finish()
    }
}

struct PhantomState<P: Send + Sync + 'static> {
    node: RefNode,
    payload: P,
}

impl<P: Send + Sync + 'static> AnyReference for PhantomState<P> {
    fn node(&self) -> &RefNode {
        &self.node
    }

    fn as_any_arc(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

/// Phantom variant: the target is already cleared from this handle's
/// perspective; the handle is kept alive by the registry table so the
/// category payload survives until the cleanup action has run.
pub struct PhantomReference<P: Send + Sync + 'static> {
    state: Arc<PhantomState<P>>,
}

impl<P: Send + Sync + 'static> PhantomReference<P> {
    pub fn new<S: AnyService>(payload: P, service: &Arc<S>) -> Self {
        let service = Arc::downgrade(service);
        let service: Weak<dyn AnyService> = service;
        Self {
            state: Arc::new(PhantomState {
                node: RefNode::new(service),
                payload,
            }),
        }
    }

    pub fn payload(&self) -> &P {
        &self.state.payload
    }
}

impl<P: Send + Sync + 'static> Clone for PhantomReference<P> {
    fn clone(&self) -> Self {
        Self {
            state: Arc::clone(&self.state),
        }
    }
}

impl<P: Send + Sync + 'static> ProcessingReference for PhantomReference<P> {
    fn node(&self) -> &RefNode {
        &self.state.node
    }

    fn as_notification(&self) -> Notification {
        let state = Arc::clone(&self.state);
        let state: Arc<dyn AnyReference> = state;
        state
    }

    fn from_notification(notification: &Notification) -> Option<Self> {
        Arc::clone(notification)
            .as_any_arc()
            .downcast::<PhantomState<P>>()
            .ok()
            .map(|state| Self { state })
    }
}

impl<P: Send + Sync + 'static> std::fmt::Debug for PhantomReference<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("PhantomReference")
            .field(&self.state.node)
            .finish()
    }
}
