#![warn(missing_docs)]
//! Volume operation executor.
//!
//! Starts attach, detach, mount and unmount operations on their own tasks, making sure
//! no two conflicting operations on the same volume are ever in flight at the same time,
//! and backing off from operations which keep failing.

mod backoff;
mod mount;

/// Command line arguments.
pub mod config;
/// Executor, generator and plugin errors.
pub mod errors;
/// The operation executor.
pub mod executor;
/// Generation of the volume operations.
pub mod generator;
/// The nested pending operations.
pub mod pending_operations;
/// Volume plugin capabilities.
pub mod plugin;
/// Actual state of world updaters.
pub mod state;
/// Volume, pod and node types.
pub mod types;

pub use backoff::BackoffConfig;
pub use config::{ExecutorArgs, LogArgs};
pub use executor::{OperationExecutor, VolumeOperationExecutor};
pub use generator::{OperationGenerator, VolumeOperationGenerator};
pub use mount::has_mount_refs;
pub use pending_operations::{NestedPendingOperations, Operation};

#[cfg(test)]
mod tests;
