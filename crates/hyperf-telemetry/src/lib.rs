mod metrics;

pub use metrics::{HistogramSummary, MetricSample, MetricType, MetricsRecorder};

use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, Registry};

/// Output format for the stdout log layer.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "pretty" | "text" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            other => Err(format!("unknown log format: {other}")),
        }
    }
}

/// Configuration for the telemetry subsystem.
#[derive(Clone, Debug)]
pub struct TelemetryConfig {
    /// Default log level. Overridden by RUST_LOG env var.
    pub log_level: Level,
    /// Per-module level overrides (e.g. "hyperf_server" => DEBUG).
    pub module_levels: Vec<(String, Level)>,
    pub format: LogFormat,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: Level::INFO,
            module_levels: Vec::new(),
            format: LogFormat::Pretty,
        }
    }
}

impl TelemetryConfig {
    /// The `EnvFilter` directive string this config stands for.
    pub fn filter_directives(&self) -> String {
        let mut filter = self.log_level.to_string().to_lowercase();
        for (module, level) in &self.module_levels {
            filter.push_str(&format!(",{}={}", module, level.to_string().to_lowercase()));
        }
        filter
    }
}

/// Handle to the process-wide telemetry state.
pub struct TelemetryGuard {
    metrics: Arc<MetricsRecorder>,
}

impl TelemetryGuard {
    /// Shared recorder for the dispatcher and connection layer.
    pub fn metrics(&self) -> Arc<MetricsRecorder> {
        Arc::clone(&self.metrics)
    }
}

/// Initialize the telemetry subsystem. Call once at startup.
///
/// If a global subscriber is already installed (tests, embedding), the
/// existing one is kept and only the metrics recorder is created.
pub fn init_telemetry(config: TelemetryConfig) -> TelemetryGuard {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.filter_directives()));

    let fmt_layer: Box<dyn Layer<Registry> + Send + Sync> = match config.format {
        LogFormat::Json => tracing_subscriber::fmt::layer()
            .json()
            .with_target(true)
            .with_span_list(true)
            .with_filter(env_filter)
            .boxed(),
        LogFormat::Pretty => tracing_subscriber::fmt::layer()
            .with_target(true)
            .with_filter(env_filter)
            .boxed(),
    };

    if tracing_subscriber::registry().with(fmt_layer).try_init().is_err() {
        tracing::debug!("global subscriber already set, keeping it");
    }

    TelemetryGuard {
        metrics: Arc::new(MetricsRecorder::new()),
    }
}
