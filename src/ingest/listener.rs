use std::sync::Arc;
use std::time::Duration;

use anyhow::{Result, anyhow};
use futures::{SinkExt, StreamExt};
use parking_lot::RwLock;
use rand::Rng;
use secrecy::{ExposeSecret, SecretString};
use tokio::sync::watch;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::{debug, error, info, warn};

use super::Dispatcher;
use crate::config::ReconnectConfig;
use crate::mattermost::websocket::{WsEvent, authentication_challenge, parse_frame};
use crate::web::metrics::Metrics;

const AUTH_SEQ: i64 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Listening,
}

/// Delay before reconnect attempt `attempt` (1-based): exponential from the initial delay,
/// capped at the maximum, with the upper half jittered.
pub fn backoff_delay(config: &ReconnectConfig, attempt: u32) -> Duration {
    let initial = config.initial_delay_ms.max(1);
    let exponent = attempt.saturating_sub(1).min(20);
    let base = initial
        .saturating_mul(1u64 << exponent)
        .min(config.max_delay_ms.max(initial));
    let jittered = base / 2 + rand::thread_rng().gen_range(0..=base / 2);
    Duration::from_millis(jittered)
}

enum SessionEnd {
    Closed,
    Shutdown,
}

/// Owns the Mattermost websocket: connects, authenticates, feeds frames to the dispatcher and
/// reconnects with backoff until stopped or out of retries.
pub struct WebSocketListener {
    url: String,
    token: SecretString,
    reconnect: ReconnectConfig,
    dispatcher: Arc<Dispatcher>,
    state: RwLock<ConnectionState>,
    shutdown_tx: watch::Sender<bool>,
}

impl WebSocketListener {
    pub fn new(
        url: impl Into<String>,
        token: SecretString,
        reconnect: ReconnectConfig,
        dispatcher: Arc<Dispatcher>,
    ) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            url: url.into(),
            token,
            reconnect,
            dispatcher,
            state: RwLock::new(ConnectionState::Disconnected),
            shutdown_tx,
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.read()
    }

    fn set_state(&self, state: ConnectionState) {
        let previous = std::mem::replace(&mut *self.state.write(), state);
        if previous != state {
            debug!(from = ?previous, to = ?state, "websocket state changed");
        }
    }

    pub fn stop(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// Runs until [`stop`](Self::stop) is called or `max_retries` consecutive attempts fail.
    pub async fn run(self: Arc<Self>) -> Result<()> {
        let mut shutdown = self.shutdown_tx.subscribe();
        let mut failures: u32 = 0;

        loop {
            if *shutdown.borrow() {
                break;
            }
            self.set_state(ConnectionState::Connecting);
            match self.session(&mut shutdown, &mut failures).await {
                Ok(SessionEnd::Shutdown) => break,
                Ok(SessionEnd::Closed) => info!("mattermost websocket closed"),
                Err(err) => warn!(error = %err, "mattermost websocket failed"),
            }
            self.set_state(ConnectionState::Disconnected);

            failures += 1;
            if self.reconnect.max_retries > 0 && failures > self.reconnect.max_retries {
                error!(
                    attempts = failures,
                    "giving up on the mattermost websocket after repeated failures"
                );
                return Err(anyhow!("websocket reconnect limit reached"));
            }
            let delay = backoff_delay(&self.reconnect, failures);
            info!(attempt = failures, delay_ms = delay.as_millis() as u64, "reconnecting to mattermost");
            Metrics::websocket_reconnect();
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown.changed() => break,
            }
        }

        self.set_state(ConnectionState::Disconnected);
        info!("mattermost websocket listener stopped");
        Ok(())
    }

    async fn session(
        &self,
        shutdown: &mut watch::Receiver<bool>,
        failures: &mut u32,
    ) -> Result<SessionEnd> {
        let (stream, _) = connect_async(self.url.as_str()).await?;
        let (mut sink, mut source) = stream.split();
        sink.send(WsMessage::Text(authentication_challenge(
            AUTH_SEQ,
            self.token.expose_secret(),
        )))
        .await?;

        loop {
            let message = tokio::select! {
                message = source.next() => message,
                _ = shutdown.changed() => {
                    let _ = sink.send(WsMessage::Close(None)).await;
                    return Ok(SessionEnd::Shutdown);
                }
            };
            let Some(message) = message else {
                return Ok(SessionEnd::Closed);
            };

            match message? {
                WsMessage::Text(text) => match parse_frame(&text) {
                    Ok(WsEvent::Hello) => {
                        self.set_state(ConnectionState::Listening);
                        *failures = 0;
                        info!(url = %self.url, "listening on the mattermost websocket");
                    }
                    Ok(WsEvent::Reply { seq_reply, ok }) => {
                        if seq_reply == AUTH_SEQ && !ok {
                            return Err(anyhow!("websocket authentication rejected"));
                        }
                    }
                    Ok(event) => {
                        self.dispatcher.dispatch(event).await;
                    }
                    Err(err) => warn!(error = %err, "dropping websocket frame"),
                },
                WsMessage::Ping(payload) => sink.send(WsMessage::Pong(payload)).await?,
                WsMessage::Close(frame) => {
                    debug!(?frame, "server closed the websocket");
                    return Ok(SessionEnd::Closed);
                }
                _ => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use secrecy::SecretString;

    use super::{ConnectionState, WebSocketListener, backoff_delay};
    use crate::config::{BridgeMode, ReconnectConfig};
    use crate::identity::IdentityManager;
    use crate::ingest::Dispatcher;
    use crate::mattermost::testing::FakeMattermost;
    use crate::registry::SessionRegistry;
    use crate::runtime::testing::RecordingRuntime;

    fn config(max_retries: u32) -> ReconnectConfig {
        ReconnectConfig {
            initial_delay_ms: 100,
            max_delay_ms: 1_000,
            max_retries,
        }
    }

    #[test]
    fn backoff_grows_and_stays_capped() {
        let cfg = config(0);
        for _ in 0..20 {
            let first = backoff_delay(&cfg, 1);
            assert!(first >= Duration::from_millis(50) && first <= Duration::from_millis(100));
            let third = backoff_delay(&cfg, 3);
            assert!(third >= Duration::from_millis(200) && third <= Duration::from_millis(400));
            let late = backoff_delay(&cfg, 30);
            assert!(late >= Duration::from_millis(500) && late <= Duration::from_millis(1_000));
        }
    }

    #[tokio::test]
    async fn listener_gives_up_after_max_retries() {
        let fake = FakeMattermost::new();
        let runtime = Arc::new(RecordingRuntime::new());
        let identity = Arc::new(IdentityManager::new(
            Arc::new(fake),
            runtime.clone(),
            "mx.",
            "matrix.bridge.local",
        ));
        let dispatcher = Arc::new(Dispatcher::new(
            Arc::new(SessionRegistry::new()),
            runtime,
            identity,
            BridgeMode::Puppet,
        ));
        let listener = Arc::new(WebSocketListener::new(
            "ws://127.0.0.1:1/api/v4/websocket",
            SecretString::from("token".to_string()),
            ReconnectConfig {
                initial_delay_ms: 1,
                max_delay_ms: 2,
                max_retries: 2,
            },
            dispatcher,
        ));

        let result = tokio::time::timeout(Duration::from_secs(10), listener.clone().run())
            .await
            .expect("listener finished");
        assert!(result.is_err());
        assert_eq!(listener.state(), ConnectionState::Disconnected);
    }
}
