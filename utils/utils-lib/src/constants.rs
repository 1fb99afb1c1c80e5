/// Various common constants used by the volume operation executor.

/// The initial duration an operation key is held off after its first failure.
pub const DEFAULT_INITIAL_DURATION_BEFORE_RETRY: &str = "500ms";

/// The maximum duration an operation key is held off after repeated failures.
/// The backoff doubles on each failure until it is capped at this value.
pub const DEFAULT_MAX_DURATION_BEFORE_RETRY: &str = "2m 2s";

/// How long a mount operation waits for an external attach to complete.
pub const DEFAULT_WAIT_FOR_ATTACH_TIMEOUT: &str = "10m";

/// Default log filter used when `RUST_LOG` is not set.
pub const DEFAULT_LOG_FILTER: &str = "info";

/// Name of the service, used when tagging log output.
pub const EXECUTOR_SERVICE_NAME: &str = "volume-executor";
