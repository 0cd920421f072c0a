use std::collections::HashMap;
use std::sync::OnceLock;

use anyhow::Context as _;
use http::{HeaderMap, HeaderName, HeaderValue};
use opentelemetry::Context;
use opentelemetry::KeyValue;
use opentelemetry::trace::TraceContextExt as _;
use tracing_opentelemetry::OpenTelemetrySpanExt as _;

static PROPAGATOR_INSTALLED: OnceLock<()> = OnceLock::new();

pub const DEFAULT_ENV_FILTER: &str = "info,hyper=warn,reqwest=warn";

#[derive(Debug, Clone)]
pub struct TracingInitOptions<'a> {
    pub service_name: &'a str,
    pub service_version: &'a str,
    pub default_env_filter: &'a str,
}

fn ensure_propagator_installed() {
    PROPAGATOR_INSTALLED.get_or_init(|| {
        opentelemetry::global::set_text_map_propagator(
            opentelemetry_sdk::propagation::TraceContextPropagator::new(),
        );
    });
}

fn env_true(name: &str) -> bool {
    let Ok(v) = std::env::var(name) else {
        return false;
    };
    matches!(
        v.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

fn non_empty_env(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn otel_enabled() -> bool {
    non_empty_env("OTEL_EXPORTER_OTLP_ENDPOINT").is_some() || env_true("TICKETBRIDGE_OTEL")
}

fn join_otlp_endpoint(base: &str, path: &str) -> String {
    format!("{}{path}", base.trim_end_matches('/'))
}

fn otlp_endpoint(signal_var: &str, path: &str) -> String {
    if let Some(v) = non_empty_env(signal_var) {
        return v;
    }
    // Local collector default; only reached when TICKETBRIDGE_OTEL is set.
    let base = non_empty_env("OTEL_EXPORTER_OTLP_ENDPOINT")
        .unwrap_or_else(|| "http://127.0.0.1:4318".to_string());
    join_otlp_endpoint(&base, path)
}

/// Install the global subscriber: JSON logs filtered by `RUST_LOG`, plus OTLP
/// traces and metrics when an exporter endpoint is configured.
pub fn init_tracing(opts: TracingInitOptions<'_>) -> anyhow::Result<()> {
    ensure_propagator_installed();

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| opts.default_env_filter.into());

    if !otel_enabled() {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .json()
            .with_writer(std::io::stderr)
            .try_init()
            .map_err(|e| anyhow::anyhow!("install tracing subscriber: {e}"))?;
        return Ok(());
    }

    use opentelemetry_otlp::{Protocol, WithExportConfig as _};
    use opentelemetry_sdk::trace::{Sampler, SdkTracerProvider};
    use tracing_subscriber::layer::SubscriberExt as _;
    use tracing_subscriber::util::SubscriberInitExt as _;

    let resource = opentelemetry_sdk::Resource::builder()
        .with_service_name(opts.service_name.to_string())
        .with_attributes([KeyValue::new(
            opentelemetry_semantic_conventions::resource::SERVICE_VERSION,
            opts.service_version.to_string(),
        )])
        .build();

    let span_exporter = opentelemetry_otlp::SpanExporter::builder()
        .with_http()
        .with_endpoint(otlp_endpoint("OTEL_EXPORTER_OTLP_TRACES_ENDPOINT", "/v1/traces"))
        .with_protocol(Protocol::HttpBinary)
        .build()
        .context("build otlp span exporter")?;

    let tracer_provider = SdkTracerProvider::builder()
        .with_batch_exporter(span_exporter)
        .with_sampler(Sampler::ParentBased(Box::new(Sampler::AlwaysOn)))
        .with_resource(resource.clone())
        .build();
    let tracer = opentelemetry::trace::TracerProvider::tracer(
        &tracer_provider,
        opts.service_name.to_string(),
    );
    opentelemetry::global::set_tracer_provider(tracer_provider);

    let metric_exporter = opentelemetry_otlp::MetricExporter::builder()
        .with_http()
        .with_endpoint(otlp_endpoint("OTEL_EXPORTER_OTLP_METRICS_ENDPOINT", "/v1/metrics"))
        .with_protocol(Protocol::HttpBinary)
        .build()
        .context("build otlp metric exporter")?;
    let meter_provider = opentelemetry_sdk::metrics::SdkMeterProvider::builder()
        .with_periodic_exporter(metric_exporter)
        .with_resource(resource)
        .build();
    opentelemetry::global::set_meter_provider(meter_provider);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_writer(std::io::stderr),
        )
        .with(tracing_opentelemetry::layer().with_tracer(tracer))
        .try_init()
        .context("install tracing subscriber")?;
    Ok(())
}

/// W3C trace headers for an outbound backend call, empty outside a trace.
pub fn trace_headers() -> HeaderMap {
    ensure_propagator_installed();
    let cx = tracing::Span::current().context();
    if !cx.span().span_context().is_valid() {
        return HeaderMap::new();
    }

    let mut carrier: HashMap<String, String> = HashMap::new();
    opentelemetry::global::get_text_map_propagator(|prop| prop.inject_context(&cx, &mut carrier));
    carrier
        .into_iter()
        .filter_map(|(k, v)| {
            Some((
                HeaderName::from_bytes(k.as_bytes()).ok()?,
                HeaderValue::from_str(&v).ok()?,
            ))
        })
        .collect()
}

/// Parent context sent by the caller of an inbound request, if any.
pub fn remote_parent(headers: &HeaderMap) -> Context {
    ensure_propagator_installed();
    opentelemetry::global::get_text_map_propagator(|prop| {
        let carrier: HashMap<String, String> = prop
            .fields()
            .filter_map(|f| {
                let v = headers.get(f)?.to_str().ok()?;
                Some((f.to_string(), v.to_string()))
            })
            .collect();
        prop.extract(&carrier)
    })
}

#[derive(Debug, Clone)]
pub struct Metrics {
    token_refresh_total: opentelemetry::metrics::Counter<u64>,
    user_cache_lookups_total: opentelemetry::metrics::Counter<u64>,
    tool_calls_total: opentelemetry::metrics::Counter<u64>,
}

static METRICS: OnceLock<Metrics> = OnceLock::new();

pub fn metrics() -> &'static Metrics {
    METRICS.get_or_init(|| {
        let meter = opentelemetry::global::meter("ticketbridge");

        let token_refresh_total = meter
            .u64_counter("ticketbridge_token_refresh_total")
            .with_description("Backend authentication attempts by trigger and outcome.")
            .build();

        let user_cache_lookups_total = meter
            .u64_counter("ticketbridge_user_cache_lookups_total")
            .with_description("User cache lookups by result (hit, miss, expired).")
            .build();

        let tool_calls_total = meter
            .u64_counter("ticketbridge_tool_calls_total")
            .with_description("MCP tool calls by tool and outcome.")
            .build();

        Metrics {
            token_refresh_total,
            user_cache_lookups_total,
            tool_calls_total,
        }
    })
}

impl Metrics {
    pub fn record_token_refresh(&self, trigger: &'static str, outcome: &'static str) {
        self.token_refresh_total.add(
            1,
            &[
                KeyValue::new("trigger", trigger),
                KeyValue::new("outcome", outcome),
            ],
        );
    }

    pub fn record_user_cache_lookup(&self, result: &'static str) {
        self.user_cache_lookups_total
            .add(1, &[KeyValue::new("result", result)]);
    }

    pub fn record_tool_call(&self, tool: &str, outcome: &'static str) {
        self.tool_calls_total.add(
            1,
            &[
                KeyValue::new("tool", tool.to_string()),
                KeyValue::new("outcome", outcome),
            ],
        );
    }
}
