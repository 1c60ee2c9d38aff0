use anyhow::Result;
use opentelemetry::{trace::TracerProvider, KeyValue};
use opentelemetry_appender_tracing::layer::OpenTelemetryTracingBridge;
use opentelemetry_otlp::{LogExporter, WithExportConfig};
use opentelemetry_sdk::{
    logs::{BatchLogProcessor, LoggerProvider},
    propagation::TraceContextPropagator,
    runtime,
    trace::{RandomIdGenerator, Sampler, TracerProvider as SdkTracerProvider},
    Resource,
};
use tracing::Subscriber;
use tracing_subscriber::{
    fmt::{
        self,
        format::{Format, Json, JsonFields},
    },
    layer::SubscriberExt,
    registry::LookupSpan,
    util::SubscriberInitExt,
    EnvFilter,
};

use super::{LogFormat, TelemetryConfig, TelemetryProviders};

/// Install the global tracing subscriber.
///
/// Console output is JSON or plain text per `log_format`; `RUST_LOG`
/// overrides the configured level. With OTEL enabled, spans and log events
/// are additionally exported over OTLP/gRPC.
pub fn init_telemetry(config: &TelemetryConfig) -> Result<Option<TelemetryProviders>> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    if !config.otel_enabled {
        let (json_layer, text_layer) = fmt_layers(config.log_format);
        tracing_subscriber::registry()
            .with(env_filter)
            .with(json_layer)
            .with(text_layer)
            .init();
        return Ok(None);
    }

    opentelemetry::global::set_text_map_propagator(TraceContextPropagator::new());

    let resource = Resource::new(vec![KeyValue::new(
        opentelemetry_semantic_conventions::resource::SERVICE_NAME,
        config.service_name.clone(),
    )]);

    let trace_exporter = opentelemetry_otlp::SpanExporter::builder()
        .with_tonic()
        .with_endpoint(&config.otel_endpoint)
        .build()?;

    let tracer_provider = SdkTracerProvider::builder()
        .with_batch_exporter(trace_exporter, runtime::Tokio)
        .with_sampler(Sampler::AlwaysOn)
        .with_id_generator(RandomIdGenerator::default())
        .with_resource(resource.clone())
        .build();

    let log_exporter = LogExporter::builder()
        .with_tonic()
        .with_endpoint(&config.otel_endpoint)
        .build()?;

    let logger_provider = LoggerProvider::builder()
        .with_log_processor(BatchLogProcessor::builder(log_exporter, runtime::Tokio).build())
        .with_resource(resource)
        .build();

    let tracer = tracer_provider.tracer("meshtopo");

    // Span layer must precede the log bridge so events carry trace context
    let (json_layer, text_layer) = fmt_layers(config.log_format);
    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_opentelemetry::layer().with_tracer(tracer))
        .with(OpenTelemetryTracingBridge::new(&logger_provider))
        .with(json_layer)
        .with(text_layer)
        .init();

    Ok(Some(TelemetryProviders {
        tracer_provider,
        logger_provider,
    }))
}

/// Console layers for `format`; exactly one of the pair is `Some`.
///
/// Generic over the subscriber so each stack gets layers typed for it.
fn fmt_layers<S, T>(
    format: LogFormat,
) -> (
    Option<fmt::Layer<S, JsonFields, Format<Json>>>,
    Option<fmt::Layer<T>>,
)
where
    S: Subscriber + for<'span> LookupSpan<'span>,
    T: Subscriber + for<'span> LookupSpan<'span>,
{
    match format {
        LogFormat::Json => (
            Some(
                fmt::layer()
                    .json()
                    .with_span_list(true)
                    .with_current_span(true),
            ),
            None,
        ),
        LogFormat::Text => (None, Some(fmt::layer().with_target(false))),
    }
}

/// Flush and shut down exporters, if any were installed
pub fn shutdown_telemetry(providers: Option<TelemetryProviders>) {
    let Some(providers) = providers else {
        return;
    };
    if let Err(e) = providers.tracer_provider.shutdown() {
        eprintln!("Error shutting down tracer provider: {:?}", e);
    }
    if let Err(e) = providers.logger_provider.shutdown() {
        eprintln!("Error shutting down logger provider: {:?}", e);
    }
}
