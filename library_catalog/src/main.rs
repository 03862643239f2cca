use std::sync::Arc;

use actix_web::{App, HttpServer};
use opentelemetry::global;
use opentelemetry_sdk::propagation::TraceContextPropagator;
use opentelemetry_sdk::runtime::TokioCurrentThread;
use paperclip::actix::{web, OpenApiExt};
use serde::Deserialize;
use tracing_actix_web::TracingLogger;
use tracing_bunyan_formatter::{BunyanFormattingLayer, JsonStorageLayer};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::{EnvFilter, Registry};

use library_catalog::app_config::config_app;
use library_catalog::books_repository::{
    BookRepository, InMemoryBookRepository, PostgresBooksRepository,
    PostgresBooksRepositoryConfig,
};

#[derive(Debug, Deserialize)]
struct CatalogSettings {
    port: u16,
    use_in_memory_db: bool,
    db_host: String,
    db_username: String,
    db_password: String,
}

fn load_settings() -> anyhow::Result<CatalogSettings> {
    Ok(config::Config::builder()
        .set_default("port", 8080)?
        .set_default("use_in_memory_db", false)?
        .set_default("db_host", "127.0.0.1")?
        .set_default("db_username", "postgres")?
        .set_default("db_password", "postgres")?
        .add_source(config::Environment::default().try_parsing(true))
        .build()?
        .try_deserialize()?)
}

// Based on https://github.com/LukeMathWalker/tracing-actix-web/blob/main/examples/opentelemetry/src/main.rs#L15
fn init_telemetry() {
    let app_name = "library_catalog";

    // Start a new Jaeger trace pipeline.
    // Spans are exported in batch - recommended setup for a production application.
    global::set_text_map_propagator(TraceContextPropagator::new());
    #[allow(deprecated)]
    let tracer = opentelemetry_jaeger::new_agent_pipeline()
        .with_service_name(app_name)
        .install_batch(TokioCurrentThread)
        .expect("Failed to install OpenTelemetry tracer.");

    // Filter based on level - trace, debug, info, warn, error
    // Tunable via `RUST_LOG` env variable
    let env_filter = EnvFilter::try_from_default_env().unwrap_or(EnvFilter::new("info"));
    // Create a `tracing` layer using the Jaeger tracer
    let telemetry = tracing_opentelemetry::layer().with_tracer(tracer);
    // Create a `tracing` layer to emit spans as structured logs to stdout
    let formatting_layer = BunyanFormattingLayer::new(app_name.into(), std::io::stdout);
    // Combined them all together in a `tracing` subscriber
    let subscriber = Registry::default()
        .with(env_filter)
        .with(telemetry)
        .with(JsonStorageLayer)
        .with(formatting_layer);
    tracing::subscriber::set_global_default(subscriber)
        .expect("Failed to install `tracing` subscriber.")
}

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    init_telemetry();
    let settings = load_settings()?;
    tracing::info!(port = settings.port, "Starting library catalog");

    let books_repository: Arc<dyn BookRepository + Send + Sync> = if settings.use_in_memory_db {
        Arc::new(InMemoryBookRepository::default())
    } else {
        Arc::new(
            PostgresBooksRepository::init(PostgresBooksRepositoryConfig {
                hostname: settings.db_host,
                username: settings.db_username,
                password: settings.db_password,
            })
            .await?,
        )
    };

    HttpServer::new(move || {
        App::new()
            .wrap_api()
            .app_data(web::Data::new(books_repository.clone()))
            .wrap(TracingLogger::default())
            .configure(config_app)
            .with_json_spec_at("/apispec/v2")
            .build()
    })
    .bind(("0.0.0.0", settings.port))?
    .run()
    .await?;
    Ok(())
}
