mod cors;
mod sweep;

use std::sync::Arc;

use actix_web::{
    App, HttpServer,
    web::{self},
};
use api_subs::StripeProcessor;
use billing::{
    Billing, Deps, Settings,
    clock::SystemClock,
    directory::HttpUserDirectory,
    notifier::LogNotifier,
    store::PgStore,
};
use common::env_config::Config;

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    // get env vars
    let config = Config::from_env();
    let config_data = config.clone();

    // get info
    let is_production = config.environment == "production";
    let origin = config.cors_allowed_origin.clone();

    // init logger
    if config.console_logging_enabled {
        logger::setup().expect("Failed to set up logger");
    }

    // init db connection
    let pool = db::setup(&config.database_url, is_production)
        .await
        .expect("Failed to set up database");

    // wire the engine
    let billing = Billing::new(Deps {
        store: Arc::new(PgStore::new(pool)),
        clock: Arc::new(SystemClock),
        directory: Arc::new(HttpUserDirectory::new(
            config.user_directory_url.clone(),
            config.user_directory_api_key.clone(),
        )),
        notifier: Arc::new(LogNotifier),
        processor: Arc::new(StripeProcessor::new(&config)),
        settings: Settings {
            trial_days: config.trial_days,
            processor_timeout: config.processor_timeout,
        },
    });

    sweep::spawn(billing.clone(), config.expiry_sweep_interval);

    log::info!(
        "Billing service listening on {}:{}",
        config.server_host,
        config.server_port
    );

    HttpServer::new(move || {
        App::new()
            .app_data(web::Data::new(config_data.clone()))
            .app_data(web::Data::new(billing.clone()))
            .wrap(limiter::global_middleware(config_data.global_rate_limit)) // 4th
            .wrap(logger::middleware()) // 3rd
            .wrap(extractor::middleware()) // 2nd
            .wrap(cors::middleware(&origin)) // 1st
            .service(
                web::scope("/api")
                    .service(api_subs::mount_webhook())
                    .service(
                        api_subs::mount_subs()
                            .wrap(limiter::user_middleware(config_data.user_rate_limit))
                            .wrap(extractor::require_claims()),
                    ),
            )
    })
    .bind((config.server_host.as_str(), config.server_port))?
    .workers(config.num_workers)
    .run()
    .await
}
