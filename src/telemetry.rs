use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::{prelude::*, EnvFilter, Registry};

fn env_filter() -> EnvFilter {
    // Default to info when RUST_LOG is empty
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
}

fn fmt_layer<S>() -> impl tracing_subscriber::Layer<S>
where
    S: tracing::Subscriber + for<'a> tracing_subscriber::registry::LookupSpan<'a>,
{
    tracing_subscriber::fmt::layer()
        .with_span_events(FmtSpan::CLOSE)
        .with_target(false)
}

fn init_local() -> anyhow::Result<()> {
    Registry::default().with(env_filter()).with(fmt_layer()).try_init()?;
    Ok(())
}

/// Install the global subscriber. With an endpoint, spans are also exported
/// over OTLP/gRPC.
#[cfg(feature = "otlp")]
pub fn init_telemetry(service_name: &str, otlp_endpoint: Option<&str>) -> anyhow::Result<()> {
    let Some(endpoint) = otlp_endpoint else {
        return init_local();
    };
    let otel_layer = otlp::layer(service_name, endpoint)?;
    Registry::default()
        .with(env_filter())
        .with(fmt_layer())
        .with(otel_layer)
        .try_init()?;
    Ok(())
}

#[cfg(not(feature = "otlp"))]
pub fn init_telemetry(_service_name: &str, otlp_endpoint: Option<&str>) -> anyhow::Result<()> {
    init_local()?;
    if otlp_endpoint.is_some() {
        tracing::warn!("OTLP endpoint set but built without the otlp feature; exporting logs only");
    }
    Ok(())
}

#[cfg(feature = "otlp")]
pub fn shutdown_telemetry() {
    opentelemetry::global::shutdown_tracer_provider();
}

#[cfg(not(feature = "otlp"))]
pub fn shutdown_telemetry() {}

#[cfg(feature = "otlp")]
mod otlp {
    use opentelemetry::sdk::{propagation::TraceContextPropagator, trace as sdktrace, Resource};
    use opentelemetry::{global, KeyValue};
    use opentelemetry_otlp::WithExportConfig;

    pub fn layer<S>(
        service_name: &str,
        endpoint: &str,
    ) -> anyhow::Result<tracing_opentelemetry::OpenTelemetryLayer<S, sdktrace::Tracer>>
    where
        S: tracing::Subscriber + for<'a> tracing_subscriber::registry::LookupSpan<'a>,
    {
        global::set_text_map_propagator(TraceContextPropagator::new());

        let exporter = opentelemetry_otlp::new_exporter().tonic().with_endpoint(endpoint);
        let tracer = opentelemetry_otlp::new_pipeline()
            .tracing()
            .with_exporter(exporter)
            .with_trace_config(
                sdktrace::config()
                    .with_resource(Resource::new(vec![KeyValue::new("service.name", service_name.to_string())])),
            )
            .install_batch(opentelemetry::runtime::Tokio)?;

        Ok(tracing_opentelemetry::layer().with_tracer(tracer))
    }
}
