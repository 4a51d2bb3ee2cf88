use crate::model::{DependencyDeclaration, ResolutionBatch, ResolutionResult};
use crate::resolve::AncestorResolver;
use crate::traits::VersionControl;
use std::sync::Arc;
use tokio::sync::{watch, Semaphore};
use tracing::{error, info, instrument, warn};

/// Process-wide cancellation flag shared by every worker.
#[derive(Debug, Clone)]
pub struct CancelSignal {
    tx: Arc<watch::Sender<bool>>,
    rx: watch::Receiver<bool>,
}

impl CancelSignal {
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(false);
        Self {
            tx: Arc::new(tx),
            rx,
        }
    }

    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Completes once [`CancelSignal::cancel`] has been called.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        let _ = rx.wait_for(|cancelled| *cancelled).await;
    }
}

impl Default for CancelSignal {
    fn default() -> Self {
        Self::new()
    }
}

enum Outcome {
    Finished(ResolutionResult),
    Skipped,
}

/// Resolves many dependencies on a bounded pool of tasks.
pub struct ResolverExecutor<V>
where
    V: VersionControl + 'static,
{
    resolver: Arc<AncestorResolver<V>>,
    semaphore: Arc<Semaphore>,
    cancel: CancelSignal,
}

impl<V> ResolverExecutor<V>
where
    V: VersionControl + 'static,
{
    pub fn new(resolver: AncestorResolver<V>, concurrency_limit: usize) -> Self {
        Self {
            resolver: Arc::new(resolver),
            semaphore: Arc::new(Semaphore::new(concurrency_limit.max(1))),
            cancel: CancelSignal::new(),
        }
    }

    pub fn with_cancel(mut self, cancel: CancelSignal) -> Self {
        self.cancel = cancel;
        self
    }

    /// Resolves every dependency and merges the outcomes into one batch.
    ///
    /// Workers only return their result; the batch is built here, in one
    /// place, after each task has been joined.
    #[instrument(skip(self, deps), fields(dependencies = deps.len()))]
    pub async fn resolve_all(&self, deps: &[DependencyDeclaration]) -> ResolutionBatch {
        let mut handles = Vec::with_capacity(deps.len());

        for dep in deps.iter().cloned() {
            let resolver = Arc::clone(&self.resolver);
            let semaphore = Arc::clone(&self.semaphore);
            let cancel = self.cancel.clone();
            let name = dep.name.clone();

            let handle = tokio::spawn(async move {
                let _permit = tokio::select! {
                    permit = semaphore.acquire_owned() => match permit {
                        Ok(permit) => permit,
                        Err(_) => return Outcome::Skipped,
                    },
                    _ = cancel.cancelled() => return Outcome::Skipped,
                };
                if cancel.is_cancelled() {
                    return Outcome::Skipped;
                }

                // Dropping the resolution future kills any running git child.
                tokio::select! {
                    result = resolver.resolve(&dep) => Outcome::Finished(result),
                    _ = cancel.cancelled() => Outcome::Skipped,
                }
            });
            handles.push((name, handle));
        }

        let mut batch = ResolutionBatch::default();
        for (name, handle) in handles {
            match handle.await {
                Ok(Outcome::Finished(result)) => batch.record(&name, result),
                Ok(Outcome::Skipped) => {
                    warn!(dependency = %name, "Skipped after cancellation");
                    batch.record_skipped(&name);
                }
                Err(e) => {
                    error!(dependency = %name, error = %e, "Resolution task failed");
                    batch.record_skipped(&name);
                }
            }
        }

        let batch = batch.finish();
        info!(
            resolved = batch.resolved.len(),
            failed = batch.failed.len(),
            stale = batch.stale.len(),
            skipped = batch.skipped.len(),
            "Finished ancestor resolution"
        );
        batch
    }
}
