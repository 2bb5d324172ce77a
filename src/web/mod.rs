use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use once_cell::sync::OnceCell;
use salvo::prelude::*;
use tracing::info;

use crate::config::Config;
use crate::matrix::MatrixAppservice;

pub mod handlers;
pub mod metrics;
pub mod middleware;

use self::handlers::command::SlashCommands;
use self::middleware::auth::create_router;

#[derive(Clone)]
pub struct WebState {
    pub config: Arc<Config>,
    pub matrix: Arc<MatrixAppservice>,
    pub commands: Arc<SlashCommands>,
    pub started_at: Instant,
}

static WEB_STATE: OnceCell<WebState> = OnceCell::new();

pub fn web_state() -> &'static WebState {
    WEB_STATE
        .get()
        .expect("web state is not initialized before handler execution")
}

#[derive(Clone)]
pub struct WebServer {
    config: Arc<Config>,
}

impl WebServer {
    pub fn new(
        config: Arc<Config>,
        matrix: Arc<MatrixAppservice>,
        commands: Arc<SlashCommands>,
    ) -> Self {
        let _ = WEB_STATE.set(WebState {
            config: config.clone(),
            matrix,
            commands,
            started_at: Instant::now(),
        });

        Self { config }
    }

    pub async fn start(&self) -> Result<()> {
        let bind_addr = format!(
            "{}:{}",
            self.config.bridge.bind_address, self.config.bridge.port
        );
        info!(bind_addr, "starting web server");

        let acceptor = TcpListener::new(bind_addr).bind().await;
        Server::new(acceptor).serve(create_router()).await;

        Ok(())
    }
}
