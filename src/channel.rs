//! The persistent realtime channel.
//!
//! One authenticated WebSocket to the server, owned exclusively by
//! [`ChannelManager`]. Observers learn about connectivity through the
//! [`ChannelState`] watch and receive inbound [`ServerEvent`]s through a
//! broadcast; nothing else ever holds the socket across a reconnect.

use crate::auth::{AuthEvent, CredentialGuard};
use crate::config::ClientConfig;
use crate::error::{Error, Result};
use crate::events::{ClientEvent, DisconnectCode, ServerEvent};
use crate::models::ChannelState;
use futures::stream::SplitStream;
use futures::{SinkExt, StreamExt};
use log::{debug, error, info, warn};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::{
    connect_async, tungstenite::Message as WsMessage, MaybeTlsStream, WebSocketStream,
};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
/// Auth-flavored disconnects get refresh-and-reconnect up to this budget.
const MAX_AUTH_ATTEMPTS: u32 = 5;
const MAX_RECONNECT_DELAY: Duration = Duration::from_secs(5);
/// Transient disconnects get a single retry after this fixed delay.
const TRANSIENT_RETRY_DELAY: Duration = Duration::from_secs(1);

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Why the channel went down, as an enumerated set. Only the auth-flavored
/// reasons drain the reconnect budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DisconnectReason {
    Auth(DisconnectCode),
    ServerShutdown,
    Transport,
}

impl DisconnectReason {
    fn from_code(code: DisconnectCode) -> Self {
        match code {
            DisconnectCode::AuthExpired | DisconnectCode::AuthInvalid => Self::Auth(code),
            DisconnectCode::ServerShutdown => Self::ServerShutdown,
            DisconnectCode::Unknown => Self::Transport,
        }
    }
}

struct PumpTasks {
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

pub struct ChannelManager {
    config: ClientConfig,
    guard: Arc<CredentialGuard>,
    state_tx: watch::Sender<ChannelState>,
    events_tx: broadcast::Sender<ServerEvent>,
    writer: parking_lot::Mutex<Option<mpsc::UnboundedSender<String>>>,
    tasks: parking_lot::Mutex<Option<PumpTasks>>,
    disconnect_tx: mpsc::Sender<(u64, DisconnectReason)>,
    /// Serializes connect attempts; reconnects are strictly sequential.
    connect_lock: tokio::sync::Mutex<()>,
    /// Bumped per opened socket so late disconnect reports from a replaced
    /// connection are ignored.
    epoch: AtomicU64,
    auth_attempts: AtomicU32,
    closing: AtomicBool,
}

impl ChannelManager {
    pub fn new(config: ClientConfig, guard: Arc<CredentialGuard>) -> Arc<Self> {
        let (state_tx, _) = watch::channel(ChannelState::Disconnected);
        let (events_tx, _) = broadcast::channel(256);
        let (disconnect_tx, disconnect_rx) = mpsc::channel(8);

        let manager = Arc::new(Self {
            config,
            guard,
            state_tx,
            events_tx,
            writer: parking_lot::Mutex::new(None),
            tasks: parking_lot::Mutex::new(None),
            disconnect_tx,
            connect_lock: tokio::sync::Mutex::new(()),
            epoch: AtomicU64::new(0),
            auth_attempts: AtomicU32::new(0),
            closing: AtomicBool::new(false),
        });

        tokio::spawn(manager.clone().supervise(disconnect_rx));
        tokio::spawn(manager.clone().watch_logout());
        manager
    }

    pub fn state(&self) -> ChannelState {
        *self.state_tx.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ChannelState::Connected
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ChannelState> {
        self.state_tx.subscribe()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ServerEvent> {
        self.events_tx.subscribe()
    }

    /// Obtain a valid credential and open the channel. Returns the resulting
    /// state; `Failed` without dialing when no credential is obtainable.
    pub async fn connect(self: &Arc<Self>) -> ChannelState {
        let _serial = self.connect_lock.lock().await;
        self.closing.store(false, Ordering::SeqCst);
        self.teardown_handle();

        let Some(token) = self.guard.valid_token().await else {
            warn!("No credential available, channel stays down");
            self.set_state(ChannelState::Failed);
            return ChannelState::Failed;
        };

        self.set_state(ChannelState::Connecting);
        match self.open_channel(&token).await {
            Ok(()) => self.set_state(ChannelState::Connected),
            Err(e) => {
                warn!("Channel connect failed: {e}");
                self.set_state(ChannelState::Reconnecting);
                let epoch = self.epoch.load(Ordering::SeqCst);
                let _ = self
                    .disconnect_tx
                    .send((epoch, DisconnectReason::Transport))
                    .await;
            }
        }
        self.state()
    }

    /// Queue an outbound event. Fails fast when the channel is down; nothing
    /// is queued for later.
    pub fn send(&self, event: &ClientEvent) -> Result<()> {
        if self.state() != ChannelState::Connected {
            return Err(Error::ChannelDown);
        }
        let frame = event.to_frame()?;
        match self.writer.lock().as_ref() {
            Some(tx) => tx.send(frame).map_err(|_| Error::ChannelDown),
            None => Err(Error::ChannelDown),
        }
    }

    /// Tear the channel down. Idempotent; never fails, even when the
    /// underlying transport's close path does.
    pub fn close(&self) {
        self.closing.store(true, Ordering::SeqCst);
        self.teardown_handle();
        if self.state() != ChannelState::Failed {
            self.set_state(ChannelState::Disconnected);
        }
    }

    fn set_state(&self, state: ChannelState) {
        let previous = self.state_tx.send_replace(state);
        if previous != state {
            debug!("Channel state {previous:?} -> {state:?}");
        }
    }

    fn teardown_handle(&self) {
        *self.writer.lock() = None;
        if let Some(tasks) = self.tasks.lock().take() {
            tasks.reader.abort();
            tasks.writer.abort();
        }
    }

    async fn open_channel(self: &Arc<Self>, token: &str) -> Result<()> {
        self.teardown_handle();

        let url = self.config.ws_url();
        let (ws, _) = tokio::time::timeout(CONNECT_TIMEOUT, connect_async(url))
            .await
            .map_err(|_| Error::Channel("connection attempt timed out".to_string()))??;
        let (mut write, read) = ws.split();

        let auth_frame = ClientEvent::Authenticate {
            token: token.to_string(),
        }
        .to_frame()?;
        write.send(WsMessage::Text(auth_frame)).await?;

        let (tx, mut rx) = mpsc::unbounded_channel::<String>();
        let writer_task = tokio::spawn(async move {
            while let Some(frame) = rx.recv().await {
                if write.send(WsMessage::Text(frame)).await.is_err() {
                    break;
                }
            }
            let _ = write.close().await;
        });

        let epoch = self.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        let reader_task = tokio::spawn(self.clone().read_loop(read, epoch));

        *self.writer.lock() = Some(tx);
        *self.tasks.lock() = Some(PumpTasks {
            reader: reader_task,
            writer: writer_task,
        });
        Ok(())
    }

    async fn read_loop(self: Arc<Self>, mut read: SplitStream<WsStream>, epoch: u64) {
        let reason = loop {
            match read.next().await {
                Some(Ok(WsMessage::Text(text))) => {
                    let Some(event) = ServerEvent::from_frame(&text) else {
                        continue;
                    };
                    match &event {
                        ServerEvent::Authenticated => {
                            // Only a confirmed authentication resets the
                            // reconnect budget.
                            self.auth_attempts.store(0, Ordering::SeqCst);
                            self.set_state(ChannelState::Connected);
                            let _ = self.events_tx.send(event);
                        }
                        ServerEvent::ConnectError { code, message } => {
                            warn!(
                                "Channel error from server: {code:?} ({})",
                                message.as_deref().unwrap_or("no detail")
                            );
                            let code = *code;
                            let _ = self.events_tx.send(event);
                            break DisconnectReason::from_code(code);
                        }
                        _ => {
                            let _ = self.events_tx.send(event);
                        }
                    }
                }
                Some(Ok(WsMessage::Close(_))) => break DisconnectReason::ServerShutdown,
                Some(Ok(_)) => {} // ping/pong/binary
                Some(Err(e)) => {
                    warn!("Channel read error: {e}");
                    break DisconnectReason::Transport;
                }
                None => break DisconnectReason::Transport,
            }
        };

        if self.closing.load(Ordering::SeqCst) {
            return;
        }
        let _ = self.disconnect_tx.send((epoch, reason)).await;
    }

    async fn supervise(self: Arc<Self>, mut rx: mpsc::Receiver<(u64, DisconnectReason)>) {
        while let Some((epoch, reason)) = rx.recv().await {
            if self.closing.load(Ordering::SeqCst) {
                continue;
            }
            if epoch != self.epoch.load(Ordering::SeqCst) {
                debug!("Ignoring disconnect report from a replaced connection");
                continue;
            }
            let _serial = self.connect_lock.lock().await;
            match reason {
                DisconnectReason::Auth(code) => {
                    info!("Channel lost to auth error ({code:?}), reconnecting");
                    self.reconnect_with_refresh().await;
                }
                DisconnectReason::ServerShutdown | DisconnectReason::Transport => {
                    info!("Channel lost ({reason:?}), retrying once");
                    self.retry_once().await;
                }
            }
        }
    }

    /// Bounded refresh-and-reconnect loop for auth-flavored failures.
    async fn reconnect_with_refresh(self: &Arc<Self>) {
        self.set_state(ChannelState::Reconnecting);
        loop {
            if self.closing.load(Ordering::SeqCst) {
                return;
            }
            let attempt = self.auth_attempts.fetch_add(1, Ordering::SeqCst) + 1;
            if attempt > MAX_AUTH_ATTEMPTS {
                error!("Reconnect budget exhausted after {MAX_AUTH_ATTEMPTS} attempts, giving up");
                self.set_state(ChannelState::Failed);
                self.guard.logout();
                return;
            }

            let delay = Duration::from_secs(u64::from(attempt)).min(MAX_RECONNECT_DELAY);
            debug!("Reconnect attempt {attempt} in {delay:?}");
            tokio::time::sleep(delay).await;

            let Some(credential) = self.guard.refresh().await else {
                // Refresh failure already surfaced as logout.
                self.set_state(ChannelState::Failed);
                return;
            };
            match self.open_channel(&credential.token).await {
                Ok(()) => {
                    self.set_state(ChannelState::Connected);
                    return;
                }
                Err(e) => warn!("Reconnect attempt {attempt} failed: {e}"),
            }
        }
    }

    /// Single refresh-and-reconnect for transient disconnects, independent
    /// of the auth budget.
    async fn retry_once(self: &Arc<Self>) {
        self.set_state(ChannelState::Reconnecting);
        tokio::time::sleep(TRANSIENT_RETRY_DELAY).await;
        if self.closing.load(Ordering::SeqCst) {
            return;
        }

        let Some(credential) = self.guard.refresh().await else {
            self.set_state(ChannelState::Failed);
            return;
        };
        match self.open_channel(&credential.token).await {
            Ok(()) => self.set_state(ChannelState::Connected),
            Err(e) => {
                warn!("Transient reconnect failed: {e}");
                self.set_state(ChannelState::Disconnected);
            }
        }
    }

    async fn watch_logout(self: Arc<Self>) {
        let mut events = self.guard.subscribe();
        loop {
            match events.recv().await {
                Ok(AuthEvent::LoggedOut) => {
                    info!("Logout observed, closing channel");
                    self.close();
                }
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return,
            }
        }
    }
}

#[cfg(test)]
impl ChannelManager {
    /// A manager that believes it is connected, with the outbound frame
    /// queue exposed so tests can assert on emissions.
    pub(crate) fn stub_connected(
        guard: Arc<CredentialGuard>,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<String>) {
        let manager = Self::new(ClientConfig::default(), guard);
        let (tx, rx) = mpsc::unbounded_channel();
        *manager.writer.lock() = Some(tx);
        manager.set_state(ChannelState::Connected);
        (manager, rx)
    }

    pub(crate) fn inject(&self, event: ServerEvent) {
        let _ = self.events_tx.send(event);
    }

    pub(crate) fn set_state_for_tests(&self, state: ChannelState) {
        self.set_state(state);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::CredentialStore;
    use crate::test_util::{make_token, MockRefresh};
    use tokio::net::TcpListener;
    use tokio_tungstenite::accept_async;

    fn guard_with_token(ttl: i64) -> (Arc<CredentialGuard>, Arc<MockRefresh>) {
        let store = Arc::new(CredentialStore::in_memory().unwrap());
        store.save_token(&make_token("alice", ttl)).unwrap();
        let transport = Arc::new(MockRefresh::new());
        (CredentialGuard::new(transport.clone(), store), transport)
    }

    fn config_for(port: u16) -> ClientConfig {
        ClientConfig::new("127.0.0.1", port, false)
    }

    fn frame(event: &ServerEvent) -> WsMessage {
        WsMessage::Text(serde_json::to_string(event).unwrap())
    }

    fn auth_token_of(msg: &WsMessage) -> String {
        let WsMessage::Text(text) = msg else {
            panic!("expected text frame, got {msg:?}");
        };
        let value: serde_json::Value = serde_json::from_str(text).unwrap();
        assert_eq!(value["type"], "authenticate");
        value["payload"]["token"].as_str().unwrap().to_string()
    }

    #[tokio::test]
    async fn connects_authenticates_and_broadcasts_events() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let expected_token = make_token("alice", 3600);
        let server_token = expected_token.clone();

        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(stream).await.unwrap();
            let first = ws.next().await.unwrap().unwrap();
            assert_eq!(auth_token_of(&first), server_token);
            ws.send(frame(&ServerEvent::Authenticated)).await.unwrap();
            ws.send(frame(&ServerEvent::UserLeft {
                room_id: "r1".into(),
                user_id: "bob".into(),
            }))
            .await
            .unwrap();
            // Hold the connection open until the client hangs up.
            while ws.next().await.is_some() {}
        });

        let store = Arc::new(CredentialStore::in_memory().unwrap());
        store.save_token(&expected_token).unwrap();
        let guard = CredentialGuard::new(Arc::new(MockRefresh::new()), store);
        let manager = ChannelManager::new(config_for(port), guard);
        let mut events = manager.subscribe_events();

        assert_eq!(manager.connect().await, ChannelState::Connected);

        let timeout = Duration::from_secs(5);
        let first = tokio::time::timeout(timeout, events.recv()).await.unwrap().unwrap();
        assert!(matches!(first, ServerEvent::Authenticated));
        let second = tokio::time::timeout(timeout, events.recv()).await.unwrap().unwrap();
        assert!(matches!(second, ServerEvent::UserLeft { .. }));

        manager.close();
        assert_eq!(manager.state(), ChannelState::Disconnected);
        manager.close(); // idempotent
        assert_eq!(manager.state(), ChannelState::Disconnected);
    }

    #[tokio::test]
    async fn auth_error_triggers_refresh_and_reconnect() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let (tokens_tx, mut tokens_rx) = mpsc::unbounded_channel::<String>();

        tokio::spawn(async move {
            // First connection: reject the session as expired.
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(stream).await.unwrap();
            let first = ws.next().await.unwrap().unwrap();
            tokens_tx.send(auth_token_of(&first)).unwrap();
            ws.send(frame(&ServerEvent::ConnectError {
                code: DisconnectCode::AuthExpired,
                message: None,
            }))
            .await
            .unwrap();
            let _ = ws.close(None).await;

            // Second connection: accept the refreshed token.
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(stream).await.unwrap();
            let second = ws.next().await.unwrap().unwrap();
            tokens_tx.send(auth_token_of(&second)).unwrap();
            ws.send(frame(&ServerEvent::Authenticated)).await.unwrap();
            while ws.next().await.is_some() {}
        });

        let (guard, transport) = guard_with_token(3600);
        let manager = ChannelManager::new(config_for(port), guard);
        let mut states = manager.subscribe_state();

        assert_eq!(manager.connect().await, ChannelState::Connected);

        let timeout = Duration::from_secs(10);
        let first_token = tokio::time::timeout(timeout, tokens_rx.recv())
            .await
            .unwrap()
            .unwrap();
        let second_token = tokio::time::timeout(timeout, tokens_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_ne!(first_token, second_token, "reconnect must use a refreshed token");
        assert_eq!(transport.calls(), 1);

        // Wait for the state to settle back on Connected.
        tokio::time::timeout(timeout, async {
            loop {
                if *states.borrow_and_update() == ChannelState::Connected
                    && manager.is_connected()
                {
                    break;
                }
                if states.changed().await.is_err() {
                    break;
                }
            }
        })
        .await
        .unwrap();
        assert!(manager.is_connected());
    }

    #[tokio::test]
    async fn missing_credential_fails_without_dialing() {
        let store = Arc::new(CredentialStore::in_memory().unwrap());
        let guard = CredentialGuard::new(Arc::new(MockRefresh::new()), store);
        let manager = ChannelManager::new(config_for(9), guard);

        assert_eq!(manager.connect().await, ChannelState::Failed);
    }

    #[tokio::test]
    async fn send_fails_fast_when_disconnected() {
        let (guard, _) = guard_with_token(3600);
        let manager = ChannelManager::new(config_for(9), guard);

        let err = manager
            .send(&ClientEvent::JoinRoom {
                room_id: "r1".into(),
            })
            .unwrap_err();
        assert!(matches!(err, Error::ChannelDown));
    }
}
