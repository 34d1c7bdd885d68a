// Thread-lifecycle collaborator interface and production adapter.
//
// The core only decides whether and when a consumer thread is needed; the
// actual creation is delegated through this trait so embedders can route it
// to their own thread-management subsystem.

use std::thread::{self, JoinHandle};

use crate::error::RefProcError;

/// Thread spawner trait - encapsulates consumer-thread creation.
pub trait ThreadSpawner: Send + Sync + 'static {
    fn spawn(
        &self,
        name: &str,
        body: Box<dyn FnOnce() + Send + 'static>,
    ) -> Result<JoinHandle<()>, RefProcError>;
}

/// Production implementation backed by named OS threads.
#[derive(Debug, Clone, Copy, Default)]
pub struct OsThreadSpawner;

impl ThreadSpawner for OsThreadSpawner {
    fn spawn(
        &self,
        name: &str,
        body: Box<dyn FnOnce() + Send + 'static>,
    ) -> Result<JoinHandle<()>, RefProcError> {
        thread::Builder::new()
            .name(name.to_string())
            .spawn(body)
            .map_err(|error| RefProcError::ThreadSpawn(error.to_string()))
    }
}
