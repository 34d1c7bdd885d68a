//! Runtime context shared by the reference-processing components.
//!
//! Bundles the embedder-facing options, the coarse runtime lifecycle used to
//! gate background work, and the thread-lifecycle collaborator. Components
//! receive an `Arc<RuntimeContext>` explicitly rather than reaching for
//! global state.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};

use crate::threading::{OsThreadSpawner, ThreadSpawner};

/// Embedder-supplied options consulted by the reference processor.
#[derive(Debug, Clone, Copy, Default)]
pub struct RuntimeOptions {
    /// The embedding is single-threaded; never create a consumer thread and
    /// drain synchronously instead.
    pub single_threaded: bool,
    /// Report absorbed cleanup-action failures on stderr.
    pub debug: bool,
}

/// Coarse runtime lifecycle phases.
///
/// Background work is permitted only while the runtime is `Initialized`;
/// during the startup and teardown windows, notifications stay queued until
/// a later trigger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum LifecyclePhase {
    PreInitializing = 0,
    Initializing = 1,
    Initialized = 2,
    Finalizing = 3,
}

impl LifecyclePhase {
    fn from_raw(raw: u8) -> Self {
        match raw {
            0 => LifecyclePhase::PreInitializing,
            1 => LifecyclePhase::Initializing,
            2 => LifecyclePhase::Initialized,
            _ => LifecyclePhase::Finalizing,
        }
    }
}

/// Current lifecycle phase, stored as an atomic for lock-free reads from the
/// processing paths.
#[derive(Debug)]
pub struct Lifecycle {
    phase: AtomicU8, // LifecyclePhase as u8
}

impl Lifecycle {
    fn new() -> Self {
        Self {
            phase: AtomicU8::new(LifecyclePhase::Initializing as u8),
        }
    }

    pub fn phase(&self) -> LifecyclePhase {
        LifecyclePhase::from_raw(self.phase.load(Ordering::SeqCst))
    }

    pub fn set_phase(&self, phase: LifecyclePhase) {
        self.phase.store(phase as u8, Ordering::SeqCst);
    }

    /// Whether a background consumer thread may be created right now.
    pub fn allows_background_work(&self) -> bool {
        self.phase() == LifecyclePhase::Initialized
    }

    pub fn is_finalizing(&self) -> bool {
        self.phase() == LifecyclePhase::Finalizing
    }
}

/// Shared runtime context injected into every service and the processor.
///
/// # Examples
///
/// ```
/// use refproc::runtime::{LifecyclePhase, RuntimeContext, RuntimeOptions};
///
/// let context = RuntimeContext::new(RuntimeOptions::default());
/// assert!(!context.lifecycle().allows_background_work());
///
/// context.lifecycle().set_phase(LifecyclePhase::Initialized);
/// assert!(context.lifecycle().allows_background_work());
/// ```
pub struct RuntimeContext {
    options: RuntimeOptions,
    lifecycle: Lifecycle,
    foreign_contexts: AtomicBool,
    spawner: Box<dyn ThreadSpawner>,
}

impl RuntimeContext {
    /// Create a context in the `Initializing` phase with the OS spawner.
    pub fn new(options: RuntimeOptions) -> Arc<Self> {
        Self::with_spawner(options, Box::new(OsThreadSpawner))
    }

    /// Convenience constructor for embeddings that are already past startup.
    pub fn initialized(options: RuntimeOptions) -> Arc<Self> {
        let context = Self::new(options);
        context.lifecycle.set_phase(LifecyclePhase::Initialized);
        context
    }

    pub fn with_spawner(options: RuntimeOptions, spawner: Box<dyn ThreadSpawner>) -> Arc<Self> {
        Arc::new(Self {
            options,
            lifecycle: Lifecycle::new(),
            foreign_contexts: AtomicBool::new(false),
            spawner,
        })
    }

    pub fn options(&self) -> &RuntimeOptions {
        &self.options
    }

    pub fn lifecycle(&self) -> &Lifecycle {
        &self.lifecycle
    }

    pub fn debug_enabled(&self) -> bool {
        self.options.debug
    }

    /// Other guest execution contexts are embedded in this process; the
    /// processor must not own a dedicated thread and drains synchronously.
    pub fn has_foreign_contexts(&self) -> bool {
        self.foreign_contexts.load(Ordering::SeqCst)
    }

    pub fn set_foreign_contexts(&self, present: bool) {
        self.foreign_contexts.store(present, Ordering::SeqCst);
    }

    pub(crate) fn spawner(&self) -> &dyn ThreadSpawner {
        self.spawner.as_ref()
    }
}

impl std::fmt::Debug for RuntimeContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuntimeContext")
            .field("options", &self.options)
            .field("phase", &self.lifecycle.phase())
            .field("foreign_contexts", &self.has_foreign_contexts())
            .finish()
    }
}
