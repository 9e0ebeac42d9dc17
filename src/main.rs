use anyhow::Context;
use async_trait::async_trait;
use cdc_listener::engine::JsonLinesEngineFactory;
use cdc_listener::{Arguments, Config, Listener, Method, MethodName, Service, ServiceError};
use clap::{ArgAction, Parser, ValueEnum};
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing::level_filters::LevelFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

/// Overrides the default log filter, e.g. `CDC_LISTENER_LOG=cdc_listener::dispatcher=trace`.
const LOG_FILTER_ENV: &str = "CDC_LISTENER_LOG";

#[derive(Parser, Debug)]
#[command(name = "cdc-listener", version)]
#[command(about = "Routes change-data-capture events to handler services", long_about = None)]
struct Args {
    /// Listener configuration file (TOML).
    #[arg(short, long, value_name = "FILE", default_value = "config.toml")]
    config: PathBuf,

    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    /// Raise the listener's own log level; repeat for trace output.
    #[arg(short, long, action = ArgAction::Count)]
    verbose: u8,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum LogFormat {
    Text,
    /// One JSON object per line, carrying the listener span.
    Json,
}

/// Catch-all service that logs every change it receives.
struct ChangeLogger;

#[async_trait]
impl Service for ChangeLogger {
    fn name(&self) -> &str {
        "change-logger"
    }

    fn methods(&self) -> Vec<Method> {
        vec![
            Method::on_read::<Option<Value>>().with_table_name(),
            Method::on_create::<Option<Value>>().with_table_name(),
            Method::on_update::<Option<Value>>().with_table_name(),
            Method::on_delete::<Option<Value>>().with_table_name(),
            Method::on_truncate().with_table_name(),
            Method::on_error(),
        ]
    }

    async fn call(&self, method: MethodName, args: Arguments) -> Result<(), ServiceError> {
        if method == MethodName::OnError {
            if let Some(event_error) = args.error() {
                warn!(kind = event_error.kind(), error = %event_error, "Change event failed");
            }
            return Ok(());
        }

        let before = row_image(args.before::<Option<Value>>());
        let after = row_image(args.after::<Option<Value>>());
        info!(
            operation = %method,
            table = args.table_name().unwrap_or_default(),
            before = %before,
            after = %after,
            "Change received"
        );
        Ok(())
    }
}

fn row_image(image: Option<&Option<Value>>) -> String {
    match image {
        Some(Some(value)) => value.to_string(),
        _ => "null".to_string(),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    init_logging(args.log_format, args.verbose);

    info!("Starting cdc-listener");
    info!("Loading configuration from {:?}", args.config);

    let config = match Config::from_file(&args.config) {
        Ok(cfg) => {
            info!("Configuration loaded successfully");
            cfg
        }
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            return Err(e).context("loading configuration");
        }
    };

    let properties = config.engine_properties();
    info!(
        shutdown_timeout_secs = config.listener.shutdown_timeout_secs,
        engine_properties = properties.len(),
        "Configuration summary"
    );

    let listener = Listener::with_settings(JsonLinesEngineFactory, config.listener_settings());
    listener.attach(Arc::new(ChangeLogger)).await?;
    listener.start(properties).await.context("starting listener")?;

    info!(listener_id = %listener.id(), "Listening for changes, press Ctrl-C to stop");
    tokio::signal::ctrl_c().await.context("waiting for Ctrl-C")?;

    info!("Shutdown requested");
    listener.graceful_stop().await.context("stopping listener")?;

    Ok(())
}

/// Listener lines at the requested level; everything else, engine and
/// runtime chatter included, only from `warn` up.
fn default_filter(verbose: u8) -> EnvFilter {
    let level = match verbose {
        0 => LevelFilter::INFO,
        1 => LevelFilter::DEBUG,
        _ => LevelFilter::TRACE,
    };
    EnvFilter::builder()
        .with_default_directive(LevelFilter::WARN.into())
        .parse_lossy(format!("cdc_listener={}", level))
}

fn init_logging(format: LogFormat, verbose: u8) {
    let env_filter = match std::env::var(LOG_FILTER_ENV) {
        Ok(directives) if !directives.trim().is_empty() => EnvFilter::new(directives),
        _ => default_filter(verbose),
    };

    let fmt_layer = match format {
        LogFormat::Json => tracing_subscriber::fmt::layer()
            .json()
            .flatten_event(true)
            .with_current_span(true)
            .with_span_list(false)
            .boxed(),
        LogFormat::Text => tracing_subscriber::fmt::layer().with_target(false).compact().boxed(),
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .init();
}
