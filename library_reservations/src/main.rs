use std::sync::Arc;

use actix_web::{App, HttpServer};
use opentelemetry::global;
use opentelemetry_sdk::propagation::TraceContextPropagator;
use opentelemetry_sdk::runtime::TokioCurrentThread;
use paperclip::actix::{web, OpenApiExt};
use tracing_actix_web::TracingLogger;
use tracing_bunyan_formatter::{BunyanFormattingLayer, JsonStorageLayer};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::{EnvFilter, Registry};

use library_reservations::app_config::config_app;
use library_reservations::book_catalog::HttpBookCatalog;
use library_reservations::clock::SystemClock;
use library_reservations::document_store::{
    DocumentStore, InMemoryDocumentStore, PostgresDocumentStore, PostgresDocumentStoreConfig,
};
use library_reservations::lifecycle::ReservationService;
use library_reservations::reconciliation::Reconciler;
use library_reservations::reservations_repository::ReservationsRepository;
use library_reservations::settings::Settings;

// Based on https://github.com/LukeMathWalker/tracing-actix-web/blob/main/examples/opentelemetry/src/main.rs#L15
fn init_telemetry() {
    let app_name = "library_reservations";

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
    let telemetry = tracing_opentelemetry::layer().with_tracer(tracer);
    let formatting_layer = BunyanFormattingLayer::new(app_name.into(), std::io::stdout);
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
    let settings = Settings::load()?;
    tracing::info!(
        port = settings.port,
        catalog_url = %settings.catalog_url,
        legacy_collections = settings.legacy_collections,
        "Starting library reservations"
    );

    let store: Arc<dyn DocumentStore> = if settings.use_in_memory_db {
        Arc::new(InMemoryDocumentStore::default())
    } else {
        Arc::new(
            PostgresDocumentStore::init(PostgresDocumentStoreConfig {
                hostname: settings.db_host.clone(),
                username: settings.db_username.clone(),
                password: settings.db_password.clone(),
            })
            .await?,
        )
    };

    let repository = Arc::new(
        ReservationsRepository::new(store).with_legacy_collections(settings.legacy_collections),
    );
    let service = Arc::new(
        ReservationService::new(
            repository,
            Arc::new(HttpBookCatalog::new(&settings.catalog_url)?),
            Arc::new(SystemClock),
            settings.retry.clone(),
        )
        .with_resume_after(settings.reconciliation.grace()),
    );

    let reconciler = Arc::new(Reconciler::new(
        service.clone(),
        settings.reconciliation.grace(),
    ));
    tokio::spawn(
        reconciler
            .clone()
            .run_periodically(settings.reconciliation.interval()),
    );

    HttpServer::new(move || {
        App::new()
            .wrap_api()
            .app_data(web::Data::new(service.clone()))
            .app_data(web::Data::new(reconciler.clone()))
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
