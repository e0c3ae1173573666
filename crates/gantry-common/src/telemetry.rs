//! Telemetry initialization for the Gantry operator
//!
//! Structured logging via `tracing`, with optional OTLP export of traces and
//! metrics when `OTEL_EXPORTER_OTLP_ENDPOINT` is set. In-cluster runs log
//! JSON for the log pipeline; `GANTRY_LOG_FORMAT=text` switches to compact
//! text for local development.
//!
//! [`init_telemetry`] returns a [`TelemetryGuard`] that owns the exporter
//! providers. Hold it for the lifetime of the process: dropping it flushes
//! buffered spans and metrics, so a controller shutting down on SIGTERM does
//! not lose the tail of its telemetry.

use opentelemetry::trace::TracerProvider as _;
use opentelemetry::{global, KeyValue};
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::metrics::{PeriodicReader, SdkMeterProvider};
use opentelemetry_sdk::propagation::TraceContextPropagator;
use opentelemetry_sdk::trace::TracerProvider;
use opentelemetry_sdk::{runtime, Resource};
use thiserror::Error;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Environment variable selecting the log output format
pub const LOG_FORMAT_ENV: &str = "GANTRY_LOG_FORMAT";

/// Attributes read from the Kubernetes downward API when running in a pod.
///
/// Pairs of (environment variable, OpenTelemetry resource attribute); unset
/// variables are skipped, so local runs simply carry fewer attributes.
const K8S_RESOURCE_ENV: &[(&str, &str)] = &[
    ("POD_NAME", "k8s.pod.name"),
    ("POD_NAMESPACE", "k8s.namespace.name"),
    ("NODE_NAME", "k8s.node.name"),
];

/// Errors that can occur during telemetry initialization
#[derive(Debug, Error)]
pub enum TelemetryError {
    /// An OTLP exporter could not be built
    #[error("failed to initialize {signal} exporter: {message}")]
    ExporterInit {
        /// Which signal the exporter was for ("trace" or "metric")
        signal: &'static str,
        /// Underlying builder error
        message: String,
    },

    /// The tracing subscriber could not be installed
    #[error("failed to initialize tracing subscriber: {0}")]
    SubscriberInit(String),
}

impl TelemetryError {
    fn exporter(signal: &'static str, err: impl std::fmt::Display) -> Self {
        Self::ExporterInit {
            signal,
            message: err.to_string(),
        }
    }
}

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// One JSON object per line, for in-cluster log pipelines
    Json,
    /// Compact human-readable lines, for local development
    Text,
}

impl LogFormat {
    /// Parse a format name; anything unrecognized falls back to JSON
    pub fn parse(value: &str) -> Self {
        match value.to_ascii_lowercase().as_str() {
            "text" | "plain" | "compact" => Self::Text,
            _ => Self::Json,
        }
    }

    fn from_env() -> Self {
        std::env::var(LOG_FORMAT_ENV)
            .map(|v| Self::parse(&v))
            .unwrap_or(Self::Json)
    }
}

/// Configuration for telemetry initialization
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    /// Service name for traces and metrics (e.g., "gantry-operator")
    pub service_name: String,

    /// OTLP endpoint for trace and metric export (e.g., "http://otel-collector:4317").
    /// If None, spans and metrics stay local.
    pub otlp_endpoint: Option<String>,

    /// Log output format
    pub log_format: LogFormat,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            service_name: "gantry".to_string(),
            otlp_endpoint: std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT").ok(),
            log_format: LogFormat::from_env(),
        }
    }
}

/// Owns the exporter providers created by [`init_telemetry`].
///
/// Dropping the guard shuts both providers down, flushing anything still
/// buffered. Without OTLP configured the guard is empty and dropping it is
/// a no-op.
#[derive(Default)]
pub struct TelemetryGuard {
    tracer_provider: Option<TracerProvider>,
    meter_provider: Option<SdkMeterProvider>,
}

impl Drop for TelemetryGuard {
    fn drop(&mut self) {
        // The subscriber may already be torn down here, so failures go to
        // stderr rather than through tracing
        if let Some(provider) = self.meter_provider.take() {
            if let Err(e) = provider.shutdown() {
                eprintln!("failed to flush metrics on shutdown: {e}");
            }
        }
        if let Some(provider) = self.tracer_provider.take() {
            if let Err(e) = provider.shutdown() {
                eprintln!("failed to flush traces on shutdown: {e}");
            }
        }
    }
}

/// Initialize telemetry with the given configuration
///
/// Sets up W3C TraceContext propagation, the tracing subscriber in the
/// configured log format, and OTLP export for traces and metrics when an
/// endpoint is configured. Returns the guard keeping the exporters alive.
pub fn init_telemetry(config: TelemetryConfig) -> Result<TelemetryGuard, TelemetryError> {
    global::set_text_map_propagator(TraceContextPropagator::new());

    let resource = build_resource(&config.service_name);

    let mut guard = TelemetryGuard::default();
    let otel_layer = match &config.otlp_endpoint {
        Some(endpoint) => {
            let tracer_provider = otlp_tracer_provider(endpoint, resource.clone())?;
            let meter_provider = otlp_meter_provider(endpoint, resource)?;
            let tracer = tracer_provider.tracer(config.service_name.clone());

            global::set_tracer_provider(tracer_provider.clone());
            global::set_meter_provider(meter_provider.clone());
            guard.tracer_provider = Some(tracer_provider);
            guard.meter_provider = Some(meter_provider);

            Some(tracing_opentelemetry::layer().with_tracer(tracer))
        }
        None => None,
    };

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,gantry=debug,kube=info,tower=warn,hyper=warn"));

    let registry = tracing_subscriber::registry()
        .with(env_filter)
        .with(otel_layer);

    // The two fmt layers are distinct types, so each arm installs its own
    match config.log_format {
        LogFormat::Json => registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_current_span(true)
                    .with_span_list(false)
                    .with_target(true),
            )
            .try_init(),
        LogFormat::Text => registry
            .with(tracing_subscriber::fmt::layer().compact().with_target(true))
            .try_init(),
    }
    .map_err(|e| TelemetryError::SubscriberInit(e.to_string()))?;

    Ok(guard)
}

/// Build the OpenTelemetry resource: service identity plus whatever the
/// Kubernetes downward API exposed into the environment
fn build_resource(service_name: &str) -> Resource {
    let mut attributes = vec![
        KeyValue::new(
            opentelemetry_semantic_conventions::resource::SERVICE_NAME,
            service_name.to_string(),
        ),
        KeyValue::new(
            opentelemetry_semantic_conventions::resource::SERVICE_VERSION,
            env!("CARGO_PKG_VERSION"),
        ),
    ];

    attributes.extend(K8S_RESOURCE_ENV.iter().filter_map(|(env_var, attribute)| {
        std::env::var(env_var)
            .ok()
            .map(|value| KeyValue::new(*attribute, value))
    }));

    Resource::new(attributes)
}

fn otlp_tracer_provider(
    endpoint: &str,
    resource: Resource,
) -> Result<TracerProvider, TelemetryError> {
    let exporter = opentelemetry_otlp::SpanExporter::builder()
        .with_tonic()
        .with_endpoint(endpoint)
        .build()
        .map_err(|e| TelemetryError::exporter("trace", e))?;

    Ok(TracerProvider::builder()
        .with_batch_exporter(exporter, runtime::Tokio)
        .with_resource(resource)
        .build())
}

fn otlp_meter_provider(
    endpoint: &str,
    resource: Resource,
) -> Result<SdkMeterProvider, TelemetryError> {
    let exporter = opentelemetry_otlp::MetricExporter::builder()
        .with_tonic()
        .with_endpoint(endpoint)
        .build()
        .map_err(|e| TelemetryError::exporter("metric", e))?;

    let reader = PeriodicReader::builder(exporter, runtime::Tokio).build();

    Ok(SdkMeterProvider::builder()
        .with_reader(reader)
        .with_resource(resource)
        .build())
}
