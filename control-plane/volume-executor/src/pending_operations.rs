//! Nested pending operations.
//!
//! Tracks the in-flight operations keyed by volume name and, optionally, by pod name.
//! An operation is rejected immediately, never queued, if a conflicting operation is
//! still running or if its key is backing off from a previous failure.
//!
//! Two keys conflict when they refer to the same volume and either one of them has an
//! empty pod name or both have the same pod name. This allows several pods to mount the
//! same non-attachable volume in parallel while attach, detach and device operations,
//! which use an empty pod name, exclude every other operation on the volume.
//! Operations with an empty volume name are never tracked and never conflict.

use crate::{
    backoff::{BackoffConfig, ExponentialBackoff},
    errors::{AlreadyExists, Backoff, ExecutorError, NoRuntime, OperationError},
    types::{PodName, VolumeName},
};

use futures::{future::BoxFuture, FutureExt};
use parking_lot::Mutex;
use std::{collections::HashMap, panic::AssertUnwindSafe, sync::Arc};
use tokio::sync::Notify;
use tracing::Instrument;

/// A unit of work which runs to completion on its own task once accepted.
pub type Operation = BoxFuture<'static, Result<(), OperationError>>;

/// State of a single operation key.
#[derive(Debug, Default)]
struct PendingOperation {
    running: bool,
    failures: u32,
    backoff: ExponentialBackoff,
}

/// Pending operations, nested by volume and then by pod.
#[derive(Debug, Default)]
struct Operations {
    volumes: HashMap<VolumeName, HashMap<PodName, PendingOperation>>,
    untracked: usize,
}

impl Operations {
    /// Check if an operation which conflicts with the given key is running.
    fn conflicting(&self, volume: &VolumeName, pod: &PodName) -> bool {
        let Some(pods) = self.volumes.get(volume) else {
            return false;
        };
        if pod.is_empty() {
            pods.values().any(|op| op.running)
        } else {
            [&PodName::empty(), pod]
                .into_iter()
                .any(|pod| pods.get(pod).map(|op| op.running).unwrap_or_default())
        }
    }
    fn get_mut(&mut self, volume: &VolumeName, pod: &PodName) -> Option<&mut PendingOperation> {
        self.volumes
            .get_mut(volume)
            .and_then(|pods| pods.get_mut(pod))
    }
    /// Number of operations currently running, tracked or not.
    fn running(&self) -> usize {
        let tracked = self
            .volumes
            .values()
            .flat_map(|pods| pods.values())
            .filter(|op| op.running)
            .count();
        tracked + self.untracked
    }
}

#[derive(Debug)]
struct Inner {
    operations: Mutex<Operations>,
    exponential_backoff_on_error: bool,
    backoff: BackoffConfig,
    idle: Notify,
}

/// Registry of the in-flight volume operations.
/// Cloning returns a handle to the same registry.
#[derive(Debug, Clone)]
pub struct NestedPendingOperations {
    inner: Arc<Inner>,
}

impl NestedPendingOperations {
    /// Return a new, empty, `Self`.
    /// When `exponential_backoff_on_error` is set, a failed key is not allowed to run again
    /// until its backoff window has elapsed.
    pub fn new(exponential_backoff_on_error: bool, backoff: BackoffConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                operations: Mutex::new(Operations::default()),
                exponential_backoff_on_error,
                backoff,
                idle: Notify::new(),
            }),
        }
    }

    /// Run the operation under the given key, on a new task of the current tokio runtime.
    /// Returns as soon as the operation is accepted or rejected; the outcome of the operation
    /// itself is only logged and recorded against the key.
    pub fn run(
        &self,
        volume: &VolumeName,
        pod: &PodName,
        operation: Operation,
    ) -> Result<(), ExecutorError> {
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| {
            NoRuntime {
                volume: volume.clone(),
                pod: pod.clone(),
            }
            .build()
        })?;

        let tracked = {
            let mut operations = self.inner.operations.lock();
            if volume.is_empty() {
                operations.untracked += 1;
                false
            } else {
                if operations.conflicting(volume, pod) {
                    tracing::trace!(volume.name = %volume, pod.name = %pod, "Operation already in progress");
                    return AlreadyExists {
                        volume: volume.clone(),
                        pod: pod.clone(),
                    }
                    .fail();
                }
                let entry = operations
                    .volumes
                    .entry(volume.clone())
                    .or_default()
                    .entry(pod.clone())
                    .or_default();
                if let Some(remaining) = entry.backoff.retry_after() {
                    return Backoff {
                        volume: volume.clone(),
                        pod: pod.clone(),
                        remaining,
                        duration_before_retry: entry.backoff.duration_before_retry(),
                        last_error: entry.backoff.last_error(),
                    }
                    .fail();
                }
                entry.running = true;
                true
            }
        };

        let span = tracing::debug_span!("operation", volume.name = %volume, pod.name = %pod);
        let registry = self.clone();
        let (volume, pod) = (volume.clone(), pod.clone());
        runtime.spawn(
            async move {
                let result = match AssertUnwindSafe(operation).catch_unwind().await {
                    Ok(result) => result,
                    Err(panic) => Err(OperationError::Panicked {
                        details: panic_details(panic.as_ref()),
                    }),
                };
                registry.complete(tracked.then_some((&volume, &pod)), result);
            }
            .instrument(span),
        );
        Ok(())
    }

    /// Check if an operation which conflicts with the given key is running.
    pub fn is_operation_pending(&self, volume: &VolumeName, pod: &PodName) -> bool {
        self.inner.operations.lock().conflicting(volume, pod)
    }

    /// Number of consecutive failures of the given key.
    pub fn failures(&self, volume: &VolumeName, pod: &PodName) -> u32 {
        self.inner
            .operations
            .lock()
            .get_mut(volume, pod)
            .map(|op| op.failures)
            .unwrap_or_default()
    }

    /// Wait until no operation is running.
    pub async fn wait(&self) {
        loop {
            let idle = self.inner.idle.notified();
            if self.inner.operations.lock().running() == 0 {
                return;
            }
            idle.await;
        }
    }

    /// Record the outcome of an operation and release its key.
    fn complete(&self, key: Option<(&VolumeName, &PodName)>, result: Result<(), OperationError>) {
        let idle = {
            let mut operations = self.inner.operations.lock();
            match key {
                None => {
                    operations.untracked = operations.untracked.saturating_sub(1);
                }
                Some((volume, pod)) => match operations.get_mut(volume, pod) {
                    Some(entry) => {
                        entry.running = false;
                        match &result {
                            Ok(()) => {
                                entry.failures = 0;
                                entry.backoff.reset();
                            }
                            Err(error) => {
                                entry.failures += 1;
                                if self.inner.exponential_backoff_on_error {
                                    entry
                                        .backoff
                                        .update(&error.to_string(), &self.inner.backoff);
                                }
                            }
                        }
                    }
                    None => {
                        tracing::error!("Completed operation has no pending entry");
                    }
                },
            }
            operations.running() == 0
        };

        match result {
            Ok(()) => tracing::debug!("Operation completed"),
            Err(error) => tracing::error!(%error, "Operation failed"),
        }

        if idle {
            self.inner.idle.notify_waiters();
        }
    }
}

fn panic_details(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
