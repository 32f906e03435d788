//! Core client library for the linkup chat service.
//!
//! The crate wires four cooperating pieces around one credential:
//!
//! - [`auth::CredentialGuard`] owns the bearer token, refreshing it
//!   proactively and collapsing concurrent refreshes into a single request.
//! - [`channel::ChannelManager`] keeps the authenticated realtime WebSocket
//!   alive, reconnecting within a bounded budget.
//! - [`chat::ChatSession`] tracks the active room or conversation and its
//!   typing indicators.
//! - [`call::CallSignaling`] drives one-to-one video calls over the channel,
//!   with media devices and the peer transport behind trait seams.
//!
//! [`Client`] assembles all of them for embedders that want the whole stack;
//! each piece also works on its own.

pub mod api;
pub mod auth;
pub mod call;
pub mod channel;
pub mod chat;
pub mod config;
pub mod error;
pub mod events;
pub mod models;
pub mod storage;

#[cfg(test)]
pub(crate) mod test_util;

pub use api::ApiClient;
pub use auth::{AuthEvent, CredentialGuard, HttpRefresh};
pub use call::{CallSignaling, CallUpdate};
pub use channel::ChannelManager;
pub use chat::{ChatSession, ChatUpdate};
pub use config::ClientConfig;
pub use error::{Error, Result};
pub use models::{
    CallSession, CallStatus, ChannelState, ChatContext, Credential, MediaControls,
    OutgoingMessage,
};

use call::media::SystemMediaDevices;
use call::transport::WebRtcTransportFactory;
use std::path::Path;
use std::sync::Arc;
use storage::CredentialStore;
use tokio::sync::mpsc;

/// Update streams for the UI layer, handed out once at construction.
pub struct ClientEvents {
    pub chat: mpsc::UnboundedReceiver<ChatUpdate>,
    pub calls: mpsc::UnboundedReceiver<CallUpdate>,
}

/// The fully assembled client.
pub struct Client {
    pub config: ClientConfig,
    pub auth: Arc<CredentialGuard>,
    pub api: Arc<ApiClient>,
    pub channel: Arc<ChannelManager>,
    pub chat: Arc<ChatSession>,
    pub calls: Arc<CallSignaling>,
}

impl Client {
    /// Build the client against `data_dir`, picking up any credential a
    /// previous run persisted there.
    pub fn new(config: ClientConfig, data_dir: &Path) -> Result<(Self, ClientEvents)> {
        let store = Arc::new(CredentialStore::open(data_dir)?);
        let auth = CredentialGuard::new(Arc::new(HttpRefresh::new(&config)), store);
        let api = Arc::new(ApiClient::new(&config, auth.clone()));
        let channel = ChannelManager::new(config.clone(), auth.clone());
        let (chat, chat_updates) = ChatSession::new(channel.clone(), auth.clone());
        let (calls, call_updates) = CallSignaling::new(
            channel.clone(),
            auth.clone(),
            api.clone(),
            Arc::new(SystemMediaDevices),
            Arc::new(WebRtcTransportFactory::default()),
        );

        Ok((
            Self {
                config,
                auth,
                api,
                channel,
                chat,
                calls,
            },
            ClientEvents {
                chat: chat_updates,
                calls: call_updates,
            },
        ))
    }

    /// Authenticate with the server and open the realtime channel.
    pub async fn login(&self, username: &str, password: &str) -> Result<()> {
        let credential = self.api.login(username, password).await?;
        self.auth.install(credential);
        self.connect().await;
        Ok(())
    }

    pub async fn register(&self, username: &str, email: &str, password: &str) -> Result<()> {
        let credential = self.api.register(username, email, password).await?;
        self.auth.install(credential);
        self.connect().await;
        Ok(())
    }

    /// Open the realtime channel with whatever credential is installed.
    pub async fn connect(&self) -> ChannelState {
        self.channel.connect().await
    }

    pub fn is_logged_in(&self) -> bool {
        self.auth.current().is_some()
    }

    /// Drop the credential and tear everything down. The channel closes and
    /// any live call is released through the logout broadcast.
    pub async fn logout(&self) {
        self.calls.shutdown().await;
        self.auth.logout();
        self.channel.close();
    }
}
