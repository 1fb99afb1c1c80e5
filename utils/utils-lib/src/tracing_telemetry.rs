use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Registry};

/// Fmt Layer for console output.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum FmtLayer {
    /// Output traces to stdout.
    Stdout,
    /// Output traces to stderr.
    Stderr,
    /// Send traces through the libtest capture, useful for unit tests.
    Test,
    /// Don't output traces to console.
    None,
}

/// Tracing telemetry style.
#[derive(Debug, Clone, Copy, Eq, PartialEq, strum_macros::EnumString, strum_macros::AsRefStr)]
#[strum(serialize_all = "lowercase")]
pub enum FmtStyle {
    /// Compact style.
    Compact,
    /// Pretty Style.
    Pretty,
    /// JSON Style.
    Json,
}

/// Builds the log filter from `RUST_LOG`, falling back to the given directives.
pub fn rust_log_filter(default: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default))
}

/// Tracing telemetry builder.
#[derive(Debug)]
pub struct TracingTelemetry {
    writer: FmtLayer,
    style: FmtStyle,
    colours: bool,
    default_filter: String,
}

impl TracingTelemetry {
    /// Tracing telemetry default builder.
    pub fn builder() -> Self {
        Self {
            writer: FmtLayer::Stdout,
            style: FmtStyle::Pretty,
            colours: true,
            default_filter: crate::DEFAULT_LOG_FILTER.to_string(),
        }
    }
    /// Specify writer stream.
    pub fn with_writer(self, writer: FmtLayer) -> TracingTelemetry {
        TracingTelemetry { writer, ..self }
    }
    /// Specify style.
    pub fn with_style(self, style: FmtStyle) -> TracingTelemetry {
        TracingTelemetry { style, ..self }
    }
    /// Specify whether colour is needed or not.
    pub fn with_colours(self, colours: bool) -> TracingTelemetry {
        TracingTelemetry { colours, ..self }
    }
    /// Specify the filter directives used when `RUST_LOG` is not set.
    pub fn with_default_filter(self, default_filter: &str) -> TracingTelemetry {
        TracingTelemetry {
            default_filter: default_filter.to_string(),
            ..self
        }
    }

    /// Initialize the global subscriber.
    /// Returns false if a global subscriber had already been installed, which is expected
    /// when several tests in the same binary initialise logging.
    pub fn init(self, service_name: &str) -> bool {
        let stdout = tracing_subscriber::fmt::layer()
            .with_writer(std::io::stdout)
            .with_ansi(self.colours);
        let stderr = tracing_subscriber::fmt::layer()
            .with_writer(std::io::stderr)
            .with_ansi(self.colours);

        let subscriber = Registry::default().with(rust_log_filter(&self.default_filter));

        let result = match (self.writer, self.style) {
            (FmtLayer::None, _) => subscriber.try_init(),
            (FmtLayer::Test, _) => subscriber
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_test_writer()
                        .with_ansi(false)
                        .compact(),
                )
                .try_init(),
            (FmtLayer::Stdout, FmtStyle::Compact) => subscriber.with(stdout.compact()).try_init(),
            (FmtLayer::Stdout, FmtStyle::Pretty) => subscriber.with(stdout.pretty()).try_init(),
            (FmtLayer::Stdout, FmtStyle::Json) => subscriber.with(stdout.json()).try_init(),
            (FmtLayer::Stderr, FmtStyle::Compact) => subscriber.with(stderr.compact()).try_init(),
            (FmtLayer::Stderr, FmtStyle::Pretty) => subscriber.with(stderr.pretty()).try_init(),
            (FmtLayer::Stderr, FmtStyle::Json) => subscriber.with(stderr.json()).try_init(),
        };

        match result {
            Ok(()) => {
                tracing::debug!(service = service_name, "Tracing initialised");
                true
            }
            Err(_) => false,
        }
    }
}

/// Initialise tracing for unit and integration tests.
/// Safe to call more than once.
pub fn init_test_tracing() {
    TracingTelemetry::builder()
        .with_writer(FmtLayer::Test)
        .with_default_filter("debug")
        .init(crate::EXECUTOR_SERVICE_NAME);
}
