use tracing_subscriber::{
    fmt::format::format,
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
    Layer,
};

/// Call at service startup. `RUST_LOG` filters; `LOG_FORMAT` picks the
/// event format (compact, json, pretty).
pub fn config_service() {
    let format_layer = tracing_subscriber::fmt::layer().with_writer(std::io::stdout);
    let format_layer = match std::env::var("LOG_FORMAT") {
        Ok(s) if s == "json" => format_layer.event_format(format().json()).boxed(),
        Ok(s) if s == "pretty" => format_layer.event_format(format().pretty()).boxed(),
        _ => format_layer.event_format(format().compact()).boxed(),
    };
    let format_layer = format_layer.with_filter(
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    );
    tracing_subscriber::registry().with(format_layer).init();
}
