#![forbid(unsafe_code)]
#![allow(dead_code)]

use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use secrecy::SecretString;
use tracing::{error, info, warn};

mod cli;
mod config;
mod connector;
mod convert;
mod db;
mod error;
mod events;
mod identity;
mod ingest;
mod matrix;
mod matrix_admin;
mod mattermost;
mod media;
mod portal;
mod registry;
mod relay;
mod runtime;
mod sync;
mod utils;
mod web;

use cli::Cli;
use config::Config;
use connector::MattermostConnector;
use convert::MessageConverter;
use identity::IdentityManager;
use ingest::{Dispatcher, WebSocketListener};
use matrix::{MatrixAppservice, MatrixEventProcessor, RelayProvider};
use matrix_admin::MatrixAdmin;
use mattermost::HttpClientFactory;
use media::MediaHandler;
use registry::SessionRegistry;
use runtime::LocalRuntime;
use sync::MirrorSync;
use web::WebServer;
use web::handlers::command::SlashCommands;
use web::metrics::Metrics;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = Arc::new(Config::load_from_file(&cli.config)?);
    utils::logging::init_tracing(&config.logging);
    Metrics::start();

    let matrix = Arc::new(MatrixAppservice::new(config.clone()).await?);
    if cli.print_registration {
        println!("{}", serde_yaml::to_string(&matrix.registration_preview())?);
        return Ok(());
    }
    info!(mode = %config.mattermost.mode, "matrix-mattermost bridge starting up");

    let db = db::DatabaseManager::new(&config.database).await?;
    db.migrate().await?;

    let timeout = config.mattermost.request_timeout();
    let as_token = config.registration.appservice_token.clone();
    let media = Arc::new(MediaHandler::new(
        &config.bridge.homeserver_url,
        SecretString::from(as_token.clone()),
        config.mattermost.max_file_size,
        timeout,
    )?);
    let converter = Arc::new(MessageConverter::new(config.mattermost.max_file_size));

    let messages = db.message_store();
    let runtime = LocalRuntime::new(
        config.clone(),
        db,
        matrix.clone(),
        media.clone(),
        converter.clone(),
    );

    let clients = Arc::new(HttpClientFactory::new(
        &config.mattermost.server_url,
        &config.mattermost.admin_token,
        timeout,
    )?);
    let identity = Arc::new(IdentityManager::new(
        clients.clone(),
        runtime.clone(),
        config.mattermost.ghost_prefix.clone(),
        config.mattermost.ghost_email_domain.clone(),
    ));
    let sessions = Arc::new(SessionRegistry::new());
    let connector = Arc::new(MattermostConnector::new(
        config.clone(),
        clients,
        runtime.clone(),
        identity.clone(),
        converter,
        media,
        sessions.clone(),
    ));
    let relays: Arc<dyn RelayProvider> = connector.clone();
    runtime.attach_relays(Arc::downgrade(&relays));

    connector.init().await?;
    connector.start().await?;

    let processor = Arc::new(MatrixEventProcessor::new(
        matrix.clone(),
        runtime.clone(),
        messages,
        relays,
    ));
    matrix.set_processor(processor).await;

    let admin = match &config.synapse_admin {
        Some(admin) => Some(Arc::new(
            MatrixAdmin::new(&admin.url, &admin.token, timeout)?.with_appservice_token(&as_token),
        )),
        None => None,
    };

    let dispatcher = Arc::new(Dispatcher::new(
        sessions.clone(),
        runtime.clone(),
        identity.clone(),
        config.mattermost.mode,
    ));
    let listener = Arc::new(WebSocketListener::new(
        config.mattermost.websocket_url(),
        SecretString::from(config.mattermost.admin_token.clone()),
        config.mattermost.reconnect.clone(),
        dispatcher,
    ));

    if config.is_mirror_mode() {
        match sessions.first() {
            Some(login) => {
                let mirror = MirrorSync::new(
                    login,
                    runtime.clone(),
                    identity,
                    admin.clone(),
                    config.mirror.clone(),
                    config.bridge.domain.clone(),
                );
                tokio::spawn(async move {
                    match mirror.sync_all().await {
                        Ok(stats) => info!(?stats, "mirror sync finished"),
                        Err(err) => error!(error = %err, "mirror sync failed"),
                    }
                });
            }
            None => warn!("mirror mode without a login, skipping sync"),
        }
    }

    let commands = Arc::new(SlashCommands::new(
        config.clone(),
        connector.clone(),
        runtime,
        admin,
        Some(listener.clone()),
    ));
    let web_server = WebServer::new(config.clone(), matrix, commands);

    let web_handle = tokio::spawn(async move {
        if let Err(e) = web_server.start().await {
            error!(error = %e, "web server error");
        }
    });
    let listener_handle = tokio::spawn(listener.clone().run());

    tokio::select! {
        _ = web_handle => {},
        result = listener_handle => match result {
            Ok(Err(e)) => error!(error = %e, "websocket listener stopped"),
            Err(e) => error!(error = %e, "websocket listener panicked"),
            Ok(Ok(())) => {}
        },
        _ = tokio::signal::ctrl_c() => info!("interrupt received"),
    }

    listener.stop();
    connector.stop();
    info!("matrix-mattermost bridge shutting down");
    Ok(())
}
