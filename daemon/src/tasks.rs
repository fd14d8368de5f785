use std::future::Future;
use tokio::task::JoinHandle;

/// Handles to the futures a system spawned. Dropping the set aborts all of
/// them, tying background-task lifetime to the owning system.
#[derive(Default)]
pub struct Tasks(Vec<JoinHandle<()>>);

impl Tasks {
    pub fn add(&mut self, future: impl Future<Output = ()> + Send + 'static) {
        self.0.push(tokio::spawn(future));
    }

    /// Spawns a fallible task, logging the error if it ends with one.
    pub fn add_fallible(
        &mut self,
        future: impl Future<Output = anyhow::Result<()>> + Send + 'static,
    ) {
        self.0.push(tokio::spawn(async move {
            if let Err(e) = future.await {
                tracing::error!("Task failed: {e:#}");
            }
        }));
    }
}

impl Drop for Tasks {
    fn drop(&mut self) {
        for handle in &self.0 {
            handle.abort();
        }
    }
}
