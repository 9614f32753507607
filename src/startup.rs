use std::net::TcpListener;

use actix_web::dev::Server;
use actix_web::web;
use actix_web::web::Data;
use actix_web::App;
use actix_web::HttpServer;
use actix_web_lab::middleware::from_fn;
use secrecy::Secret;
use sqlx::mysql::MySqlPoolOptions;
use sqlx::MySqlPool;
use tracing_actix_web::TracingLogger;

use crate::authentication::reject_invalid_api_key;
use crate::authentication::ApiKey;
use crate::configuration::DatabaseSettings;
use crate::configuration::EmailDeliverySettings;
use crate::configuration::Settings;
use crate::routes::create_campaign;
use crate::routes::create_segment;
use crate::routes::create_template;
use crate::routes::create_transaction;
use crate::routes::create_user;
use crate::routes::delete_campaign;
use crate::routes::delete_segment;
use crate::routes::delete_template;
use crate::routes::delete_transaction;
use crate::routes::delete_user;
use crate::routes::emit_event;
use crate::routes::get_campaign;
use crate::routes::get_segment;
use crate::routes::get_template;
use crate::routes::get_transaction;
use crate::routes::get_user;
use crate::routes::health_check;
use crate::routes::list_campaigns;
use crate::routes::list_segment_users;
use crate::routes::list_segments;
use crate::routes::list_templates;
use crate::routes::list_transactions;
use crate::routes::list_user_events;
use crate::routes::list_user_segments;
use crate::routes::push_config;
use crate::routes::set_email_config;
use crate::routes::update_segment;
use crate::routes::update_template;
use crate::routes::update_transaction;
use crate::routes::update_user;

/// Wrapper for actix's `Server` with access to the bound port. The flow
/// executor worker is *not* in here; it is spawned separately by `main` (or
/// driven by hand in tests).
pub struct Application {
    /// Left private; use `get_port` to access
    port: u16,
    server: Server,
}

impl Application {
    pub async fn build(cfg: Settings) -> Result<Self, anyhow::Error> {
        let addr = format!("{}:{}", cfg.application.host, cfg.application.port);
        let listener = TcpListener::bind(addr)?;
        // the OS assigns the port when the config asked for 0
        let port = listener.local_addr()?.port();

        let pool = get_connection_pool(&cfg.database)?;
        let server = run(
            listener,
            pool,
            cfg.email_delivery,
            cfg.application.api_key,
        )?;

        Ok(Self { port, server })
    }

    pub fn get_port(&self) -> u16 { self.port }

    /// Because this consumes `self`, this should be the final function call
    /// (or passed to `tokio::spawn`)
    pub async fn run_until_stopped(self) -> Result<(), std::io::Error> { self.server.await }
}

/// `connect_lazy` so db-free requests (e.g. health_check) work before the
/// database does.
pub fn get_connection_pool(db_cfg: &DatabaseSettings) -> Result<MySqlPool, sqlx::Error> {
    Ok(MySqlPoolOptions::new().connect_lazy_with(db_cfg.connect_options()?))
}

/// Declares all API endpoints. The server is not responsible for binding to
/// an address, it only listens to an already bound one.
pub fn run(
    listener: TcpListener,
    pool: MySqlPool,
    email_settings: EmailDeliverySettings,
    api_key: Secret<String>,
) -> Result<Server, anyhow::Error> {
    let pool = Data::new(pool);
    let email_settings = Data::new(email_settings);
    let api_key = Data::new(ApiKey(api_key));

    let server = HttpServer::new(move || {
        App::new()
            .wrap(TracingLogger::default())
            .route("/health_check", web::get().to(health_check))
            .service(
                web::scope("/api")
                    .wrap(from_fn(reject_invalid_api_key))
                    .route("/user/{id}", web::post().to(create_user))
                    .route("/user/{id}", web::patch().to(update_user))
                    .route("/user/{id}", web::get().to(get_user))
                    .route("/user/{id}", web::delete().to(delete_user))
                    .route("/user/{id}/event/{name}", web::post().to(emit_event))
                    .route("/user/{id}/event", web::get().to(list_user_events))
                    .route("/user/{id}/segment", web::get().to(list_user_segments))
                    .route("/segment", web::get().to(list_segments))
                    .route("/segment/{id}", web::post().to(create_segment))
                    .route("/segment/{id}", web::patch().to(update_segment))
                    .route("/segment/{id}", web::delete().to(delete_segment))
                    .route("/segment/{id}", web::get().to(get_segment))
                    .route("/segment/{id}/user", web::get().to(list_segment_users))
                    .route("/campaign", web::get().to(list_campaigns))
                    .route("/campaign/{id}", web::post().to(create_campaign))
                    .route("/campaign/{id}", web::delete().to(delete_campaign))
                    .route("/campaign/{id}", web::get().to(get_campaign))
                    .route("/template", web::get().to(list_templates))
                    .route("/template/{id}", web::post().to(create_template))
                    .route("/template/{id}", web::patch().to(update_template))
                    .route("/template/{id}", web::delete().to(delete_template))
                    .route("/template/{id}", web::get().to(get_template))
                    .route("/transaction", web::get().to(list_transactions))
                    .route("/transaction/{id}", web::post().to(create_transaction))
                    .route("/transaction/{id}", web::patch().to(update_transaction))
                    .route("/transaction/{id}", web::delete().to(delete_transaction))
                    .route("/transaction/{id}", web::get().to(get_transaction))
                    .route("/email/config", web::post().to(set_email_config))
                    .route("/config", web::post().to(push_config)),
            )
            .app_data(pool.clone())
            .app_data(email_settings.clone())
            .app_data(api_key.clone())
    })
    .listen(listener)?
    .run();

    Ok(server)
}
