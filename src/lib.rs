use actix_web::{
    middleware::{NormalizePath, TrailingSlash},
    web::{Data, JsonConfig},
    App, HttpServer,
};
use config::Config;
use service::MessageService;
use tracing::level_filters::LevelFilter;
use tracing_actix_web::TracingLogger;
use tracing_subscriber::{util::SubscriberInitExt, EnvFilter, FmtSubscriber};

pub mod api;
pub mod cache;
pub mod config;
pub mod db;
pub mod dispatcher;
pub mod error;
pub mod message;
pub mod scheduler;
pub mod service;
pub mod store;
pub mod transport;

fn init_logging() -> eyre::Result<()> {
    let filter = EnvFilter::builder()
        .with_env_var("POSTBOX_LOG")
        .with_default_directive(LevelFilter::INFO.into())
        .from_env()?;

    #[cfg(debug_assertions)]
    FmtSubscriber::builder()
        .pretty()
        .with_env_filter(filter)
        .finish()
        .try_init()?;

    #[cfg(not(debug_assertions))]
    FmtSubscriber::builder()
        .json()
        .with_env_filter(filter)
        .finish()
        .try_init()?;

    Ok(())
}

/// Returns a builder for the main application.
///
/// Without an explicit `config`, settings are read from `POSTBOX_*`
/// environment variables.
#[bon::builder(finish_fn = start)]
pub async fn run(config: Option<Config>) -> eyre::Result<()> {
    init_logging()?;

    let config = match config {
        Some(config) => config,
        None => Config::load()?,
    };

    let service = Data::new(MessageService::connect_with(&config).await?);

    if config.autostart {
        service.start_auto_sending().await?;
    }

    let server_data = service.clone();

    tracing::info!(addr = %config.bind_addr, port = config.port, "Starting HTTP server");

    let served = HttpServer::new(move || {
        let json_cfg = JsonConfig::default().content_type_required(false);

        App::new()
            .wrap(NormalizePath::new(TrailingSlash::Trim))
            .wrap(TracingLogger::default())
            .service(api::health::health)
            .service(api::messages::service())
            .app_data(server_data.clone())
            .app_data(json_cfg)
    })
    .bind((config.bind_addr.as_str(), config.port))?
    .run()
    .await;

    // Let the in-flight tick finish before the process exits.
    service.stop_auto_sending().await?;

    served?;

    Ok(())
}
