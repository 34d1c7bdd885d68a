//! Cross-category reference processor.
//!
//! One processor is shared by every registry in the runtime. The collector
//! pushes dead handles into the notification queue from arbitrary threads;
//! a single consumer — a dedicated background thread, or the calling thread
//! during a synchronous drain — pops them one at a time and dispatches each
//! to its owning service. Dispatch needs only the notification's
//! self-reported owner, never per-category knowledge.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread::JoinHandle;

use crossbeam::channel::{Receiver, Sender, unbounded};
use parking_lot::Mutex;

use crate::error::RefProcResult;
use crate::reference::Notification;
use crate::runtime::RuntimeContext;

/// Name given to the background consumer thread.
pub const PROCESSOR_THREAD_NAME: &str = "reference-processor";

/// Clonable push handle for the collector integration.
///
/// This is the only enqueue surface the crate exposes: the host collector
/// holds a clone of the handle the processor was constructed with and pushes
/// dead handles through it.
#[derive(Clone)]
pub struct NotificationQueue {
    sender: Sender<Notification>,
}

impl NotificationQueue {
    /// Deliver a dead handle. Never blocks.
    pub fn push(&self, notification: Notification) {
        let _ = self.sender.send(notification);
    }

    pub fn len(&self) -> usize {
        self.sender.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sender.is_empty()
    }
}

/// Queue-plus-consumer mechanism turning collector notifications into
/// dispatched cleanup invocations.
pub struct ReferenceProcessor {
    context: Arc<RuntimeContext>,
    notifications: Receiver<Notification>,
    queue: NotificationQueue,
    shutdown_sender: Sender<()>,
    shutdown_receiver: Receiver<()>,
    consumer: Mutex<Option<JoinHandle<()>>>,
    processed: Arc<AtomicUsize>,
    drains: AtomicUsize,
}

impl ReferenceProcessor {
    pub fn new(context: Arc<RuntimeContext>) -> Self {
        let (sender, notifications) = unbounded();
        let (shutdown_sender, shutdown_receiver) = unbounded();
        Self {
            context,
            notifications,
            queue: NotificationQueue { sender },
            shutdown_sender,
            shutdown_receiver,
            consumer: Mutex::new(None),
            processed: Arc::new(AtomicUsize::new(0)),
            drains: AtomicUsize::new(0),
        }
    }

    /// The push handle the host collector enqueues through.
    pub fn queue(&self) -> NotificationQueue {
        self.queue.clone()
    }

    /// React to demand for reference processing from `category`.
    ///
    /// Single-threaded embeddings, and processes hosting foreign execution
    /// contexts, are drained synchronously on the calling thread. Everyone
    /// else gets a dedicated consumer thread, created lazily on the first
    /// call that arrives while the runtime lifecycle permits background
    /// work; outside that window the queued notifications simply wait for a
    /// later trigger.
    pub fn process_reference_queue(&self, category: &str) -> RefProcResult<()> {
        if self.context.options().single_threaded || self.context.has_foreign_contexts() {
            self.drain_reference_queue()?;
            return Ok(());
        }

        let mut consumer = self.consumer.lock();
        if consumer.is_none() && self.context.lifecycle().allows_background_work() {
            *consumer = Some(self.spawn_consumer(category)?);
        }
        Ok(())
    }

    /// Synchronously dispatch every queued notification on the calling
    /// thread. Returns the number processed. A termination signal raised by
    /// a cleanup action propagates to the caller and leaves the rest of the
    /// queue untouched.
    pub fn drain_reference_queue(&self) -> RefProcResult<usize> {
        let mut drained = 0;
        while let Ok(notification) = self.notifications.try_recv() {
            dispatch(&notification)?;
            self.processed.fetch_add(1, Ordering::Relaxed);
            drained += 1;
        }
        self.drains.fetch_add(1, Ordering::Relaxed);
        Ok(drained)
    }

    fn spawn_consumer(&self, category: &str) -> RefProcResult<JoinHandle<()>> {
        if self.context.debug_enabled() {
            eprintln!("[refproc] creating {PROCESSOR_THREAD_NAME} thread for {category}");
        }

        let notifications = self.notifications.clone();
        let shutdown = self.shutdown_receiver.clone();
        let processed = Arc::clone(&self.processed);
        self.context.spawner().spawn(
            PROCESSOR_THREAD_NAME,
            Box::new(move || consumer_loop(notifications, shutdown, processed)),
        )
    }

    /// Whether the dedicated consumer thread has been created.
    pub fn consumer_running(&self) -> bool {
        self.consumer.lock().is_some()
    }

    /// Notifications delivered by the collector but not yet dispatched.
    pub fn pending(&self) -> usize {
        self.notifications.len()
    }

    /// Signal the consumer thread to exit and wait for it. Called from the
    /// runtime's teardown sequence; in-flight cleanup actions are not
    /// preemptible and run to completion first.
    pub fn shutdown(&self) {
        let _ = self.shutdown_sender.send(());
        if let Some(handle) = self.consumer.lock().take() {
            let _ = handle.join();
        }
    }

    pub fn get_stats(&self) -> ProcessorStats {
        ProcessorStats {
            processed: self.processed.load(Ordering::Relaxed),
            drains: self.drains.load(Ordering::Relaxed),
            pending: self.pending(),
            consumer_running: self.consumer_running(),
        }
    }
}

impl Drop for ReferenceProcessor {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Dispatch one notification to its owning service.
fn dispatch(notification: &Notification) -> RefProcResult<()> {
    match notification.node().service() {
        Some(service) => service.process_notification(notification),
        // The owning category was torn down; nothing left to clean up.
        None => Ok(()),
    }
}

// Consumer thread body: block popping one notification at a time for the
// runtime's lifetime, until the shutdown signal or a propagated termination.
fn consumer_loop(
    notifications: Receiver<Notification>,
    shutdown: Receiver<()>,
    processed: Arc<AtomicUsize>,
) {
    loop {
        crossbeam::select! {
            recv(notifications) -> message => match message {
                Ok(notification) => {
                    if dispatch(&notification).is_err() {
                        break;
                    }
                    processed.fetch_add(1, Ordering::Relaxed);
                }
                Err(_) => break,
            },
            recv(shutdown) -> _ => break,
        }
    }
}

/// Statistics for the shared processor.
#[derive(Debug, Clone)]
pub struct ProcessorStats {
    pub processed: usize,
    pub drains: usize,
    pub pending: usize,
    pub consumer_running: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object_space::ObjectSpaceService;
    use crate::reference::{ProcessingReference, WeakReference};
    use crate::runtime::{LifecyclePhase, RuntimeContext, RuntimeOptions};
    use std::time::Duration;

    fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
        for _ in 0..500 {
            if condition() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(2));
        }
        false
    }

    #[test]
    fn drain_dispatches_to_owning_service() {
        let context = RuntimeContext::initialized(RuntimeOptions {
            single_threaded: true,
            debug: false,
        });
        let processor = Arc::new(ReferenceProcessor::new(Arc::clone(&context)));
        let space = ObjectSpaceService::new(context, Arc::clone(&processor));

        let target = Arc::new(5u32);
        let reference = space.track(&target).unwrap();
        assert_eq!(space.tracked(), 1);

        drop(target);
        processor.queue().push(reference.as_notification());
        assert_eq!(processor.drain_reference_queue().unwrap(), 1);

        assert!(reference.is_tombstoned());
        assert_eq!(space.tracked(), 0);
    }

    #[test]
    fn single_threaded_mode_never_spawns() {
        let context = RuntimeContext::initialized(RuntimeOptions {
            single_threaded: true,
            debug: false,
        });
        let processor = ReferenceProcessor::new(context);
        processor.process_reference_queue("test").unwrap();
        assert!(!processor.consumer_running());
    }

    #[test]
    fn foreign_contexts_force_synchronous_drains() {
        let context = RuntimeContext::initialized(RuntimeOptions::default());
        context.set_foreign_contexts(true);
        let processor = Arc::new(ReferenceProcessor::new(Arc::clone(&context)));
        let space = ObjectSpaceService::new(context, Arc::clone(&processor));

        let target = Arc::new(9u32);
        let reference = space.track(&target).unwrap();
        processor.queue().push(reference.as_notification());

        // The next demand drains on the calling thread instead of spawning.
        processor.process_reference_queue("test").unwrap();
        assert!(!processor.consumer_running());
        assert!(reference.is_tombstoned());
    }

    #[test]
    fn consumer_is_not_created_outside_the_initialized_window() {
        let context = RuntimeContext::new(RuntimeOptions::default());
        let processor = Arc::new(ReferenceProcessor::new(Arc::clone(&context)));
        let space = ObjectSpaceService::new(Arc::clone(&context), Arc::clone(&processor));

        let target = Arc::new(3u32);
        let reference = space.track(&target).unwrap();
        drop(target);
        processor.queue().push(reference.as_notification());

        processor.process_reference_queue("test").unwrap();
        assert!(!processor.consumer_running());
        assert_eq!(processor.pending(), 1);

        context.lifecycle().set_phase(LifecyclePhase::Finalizing);
        processor.process_reference_queue("test").unwrap();
        assert!(!processor.consumer_running());

        // Once initialized, the next trigger creates the consumer and the
        // backlog gets processed.
        context.lifecycle().set_phase(LifecyclePhase::Initialized);
        processor.process_reference_queue("test").unwrap();
        assert!(processor.consumer_running());
        assert!(wait_until(|| reference.is_tombstoned()));

        processor.shutdown();
    }

    #[test]
    fn consumer_processes_every_queued_notification() {
        let context = RuntimeContext::initialized(RuntimeOptions::default());
        let processor = Arc::new(ReferenceProcessor::new(Arc::clone(&context)));
        let space = ObjectSpaceService::new(context, Arc::clone(&processor));

        let targets: Vec<Arc<u32>> = (0..4).map(Arc::new).collect();
        let references: Vec<WeakReference<u32>> = targets
            .iter()
            .map(|target| space.track(target).unwrap())
            .collect();

        for reference in &references {
            processor.queue().push(reference.as_notification());
        }

        processor.process_reference_queue("test").unwrap();
        assert!(wait_until(|| space.tracked() == 0));
        assert!(references.iter().all(|r| r.is_tombstoned()));
        assert!(processor.get_stats().processed >= 4);

        processor.shutdown();
        assert!(!processor.consumer_running());
    }
}
