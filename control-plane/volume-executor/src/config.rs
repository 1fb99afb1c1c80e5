use crate::{backoff::BackoffConfig, pending_operations::NestedPendingOperations};
use std::time::Duration;
use utils::tracing_telemetry::{FmtLayer, FmtStyle, TracingTelemetry};

/// Command line arguments of the volume operation executor.
/// Meant to be flattened into the arguments of the binary which hosts the executor.
#[derive(Debug, Clone, clap::Args)]
pub struct ExecutorArgs {
    /// Allow a failed operation to be retried straight away, rather than after an
    /// exponentially increasing delay.
    #[clap(long, env = "NO_EXPONENTIAL_BACKOFF")]
    pub no_exponential_backoff: bool,

    /// The delay before retrying an operation after its first failure.
    #[clap(long, default_value = utils::DEFAULT_INITIAL_DURATION_BEFORE_RETRY)]
    pub initial_duration_before_retry: humantime::Duration,

    /// The maximum delay before retrying a failed operation.
    #[clap(long, default_value = utils::DEFAULT_MAX_DURATION_BEFORE_RETRY)]
    pub max_duration_before_retry: humantime::Duration,

    /// How long a mount waits for its volume to be attached.
    #[clap(long, default_value = utils::DEFAULT_WAIT_FOR_ATTACH_TIMEOUT)]
    pub wait_for_attach_timeout: humantime::Duration,

    /// Check the node has what it takes to mount a volume before setting it up.
    #[clap(long)]
    pub check_node_capabilities_before_mount: bool,
}

impl ExecutorArgs {
    /// The retry backoff configuration.
    pub fn backoff(&self) -> BackoffConfig {
        BackoffConfig {
            initial: self.initial_duration_before_retry.into(),
            max: self.max_duration_before_retry.into(),
        }
    }
    /// New pending operations configured from the arguments.
    pub fn pending_operations(&self) -> NestedPendingOperations {
        NestedPendingOperations::new(!self.no_exponential_backoff, self.backoff())
    }
    /// How long a mount waits for its volume to be attached.
    pub fn wait_for_attach_timeout(&self) -> Duration {
        self.wait_for_attach_timeout.into()
    }
}

/// Logging arguments of the binary which hosts the executor.
#[derive(Debug, Clone, clap::Args)]
pub struct LogArgs {
    /// Formatting style to be used while logging.
    #[clap(long, default_value = "pretty")]
    pub fmt_style: FmtStyle,

    /// Use ANSI colors for the logs.
    #[clap(long, default_value_t = true, action = clap::ArgAction::Set)]
    pub ansi_colors: bool,
}

impl LogArgs {
    /// Initialize the global tracing subscriber, filtered by `RUST_LOG`.
    /// Returns false if a global subscriber was already set.
    pub fn init_tracing(&self) -> bool {
        TracingTelemetry::builder()
            .with_writer(FmtLayer::Stdout)
            .with_style(self.fmt_style)
            .with_colours(self.ansi_colors)
            .init(utils::EXECUTOR_SERVICE_NAME)
    }
}
