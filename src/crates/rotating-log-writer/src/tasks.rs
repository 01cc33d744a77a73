use parking_lot::Mutex;
use std::thread::{self, JoinHandle};

#[allow(unused_imports)]
use tracing::{debug, error, warn};

/// Detached background threads started by a writer.
///
/// Threads run independently of the write path; [`Tasks::wait`] joins every
/// thread started so far, including threads started by other tasks while
/// waiting.
#[derive(Debug, Default)]
pub(crate) struct Tasks {
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl Tasks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts `f` on a named background thread. Spawn failures are logged.
    pub fn spawn<F>(&self, name: &str, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let builder = thread::Builder::new().name(name.to_string());

        match builder.spawn(f) {
            Ok(handle) => {
                let mut handles = self.handles.lock();
                handles.retain(|h| !h.is_finished());
                handles.push(handle);
            }
            Err(e) => {
                error!("failed to spawn background task {}: {}", name, e);
            }
        }
    }

    /// Blocks until all background tasks have finished.
    pub fn wait(&self) {
        loop {
            let handles = std::mem::take(&mut *self.handles.lock());
            if handles.is_empty() {
                break;
            }

            for handle in handles {
                let name = handle.thread().name().map(String::from);
                if handle.join().is_err() {
                    warn!("background task {:?} panicked", name);
                }
            }
        }
    }
}
