//! Category services and the error-isolation wrapper.
//!
//! A [`ReferenceService`] owns the registry for one finalization category
//! and decides what processing a dead handle gets; the default is plain
//! removal. The processor never sees category types: it dispatches through
//! the type-erased [`AnyService`] surface that every service implements.

use std::any::Any;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use crate::error::{CleanupError, RefProcError, RefProcResult};
use crate::reference::{Notification, ProcessingReference};
use crate::registry::ReferenceRegistry;
use crate::runtime::RuntimeContext;

/// One finalization category: a registry of processing references plus the
/// processing a dead handle receives.
pub trait ReferenceService: Send + Sync + 'static {
    type Ref: ProcessingReference;

    fn registry(&self) -> &ReferenceRegistry<Self::Ref>;

    fn context(&self) -> &Arc<RuntimeContext>;

    /// Called by the processor once the collector reports `dead`
    /// unreachable. The default removes the node from this category's
    /// registry; categories with cleanup actions override this and route
    /// the action through [`run_catching_errors`].
    fn process_reference(&self, dead: &Self::Ref) -> RefProcResult<()> {
        self.registry().remove(dead);
        Ok(())
    }
}

/// Type-erased dispatch surface used by the processor.
///
/// Implemented for every [`ReferenceService`]; a notification arriving at a
/// service of a different category is an internal-consistency fault.
pub trait AnyService: Send + Sync + 'static {
    fn process_notification(&self, notification: &Notification) -> RefProcResult<()>;
}

impl<S: ReferenceService> AnyService for S {
    fn process_notification(&self, notification: &Notification) -> RefProcResult<()> {
        let dead = <S::Ref as ProcessingReference>::from_notification(notification).unwrap_or_else(|| {
            panic!(
                "notification {:?} dispatched to a service of a different category",
                notification.node().id()
            )
        });
        self.process_reference(&dead)
    }
}

/// Run one category-supplied cleanup action against a dead reference,
/// applying the fixed isolation policy:
///
/// 1. a termination signal is never swallowed — it propagates as
///    [`RefProcError::Terminated`] and stops processing on this path;
/// 2. a guest-level raised error is reported only when the runtime debug
///    flag is set, and otherwise discarded;
/// 3. any other failure, including a panic from the action, is likewise
///    debug-reported at most.
pub fn run_catching_errors<R, F>(
    context: &RuntimeContext,
    reference: &R,
    action: F,
) -> RefProcResult<()>
where
    F: FnOnce(&R) -> Result<(), CleanupError>,
{
    match catch_unwind(AssertUnwindSafe(move || action(reference))) {
        Ok(Ok(())) => Ok(()),
        Ok(Err(CleanupError::Termination)) => Err(RefProcError::Terminated),
        Ok(Err(CleanupError::GuestRaise(message))) => {
            if context.debug_enabled() {
                eprintln!("[refproc] guest error raised by cleanup action: {message}");
            }
            Ok(())
        }
        Ok(Err(CleanupError::Failed(message))) => {
            // Do nothing; the consumer must continue to process references.
            if context.debug_enabled() {
                eprintln!("[refproc] cleanup action failed: {message}");
            }
            Ok(())
        }
        Err(payload) => {
            if context.debug_enabled() {
                eprintln!(
                    "[refproc] cleanup action panicked: {}",
                    describe_panic(payload.as_ref())
                );
            }
            Ok(())
        }
    }
}

fn describe_panic(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&'static str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message
    } else {
        "opaque panic payload"
    }
}
