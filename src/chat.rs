//! Chat session semantics on top of the realtime channel.
//!
//! A [`ChatSession`] tracks exactly one active context (a room or a direct
//! conversation), keeps the server informed when the user switches between
//! them, debounces outbound typing notifications, and ages out stale typing
//! indicators that never received an explicit stop.

use crate::auth::{AuthEvent, CredentialGuard};
use crate::channel::ChannelManager;
use crate::error::Result;
use crate::events::{ClientEvent, IncomingMessage, ServerEvent};
use crate::models::{ChannelState, ChatContext, OutgoingMessage, TypingUser};
use log::{debug, warn};
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

/// Quiet period after the last keystroke before `stopTyping` goes out.
const TYPING_DEBOUNCE: Duration = Duration::from_secs(2);
/// A typing indicator with no traffic for this long is dropped.
const TYPING_TTL: Duration = Duration::from_secs(5);
const TYPING_SWEEP_INTERVAL: Duration = Duration::from_secs(1);

/// What the session surfaces to the UI layer.
#[derive(Debug, Clone)]
pub enum ChatUpdate {
    Message(IncomingMessage),
    TypingChanged {
        context_id: String,
        users: Vec<TypingUser>,
    },
    UserJoined {
        room_id: String,
        user: TypingUser,
    },
    UserLeft {
        room_id: String,
        user_id: String,
    },
    RoomUsers {
        room_id: String,
        users: Vec<TypingUser>,
    },
}

struct ChatState {
    context: ChatContext,
    /// user_id -> (profile, last activity). Refreshed on every typing event.
    typing: HashMap<String, (TypingUser, tokio::time::Instant)>,
    /// Whether our own `typing` is currently live on the server.
    typing_sent: bool,
    /// Bumped on every context switch so a stale debounce countdown can tell
    /// it has been superseded.
    generation: u64,
    countdown: Option<JoinHandle<()>>,
}

pub struct ChatSession {
    channel: Arc<ChannelManager>,
    state: parking_lot::Mutex<ChatState>,
    updates_tx: mpsc::UnboundedSender<ChatUpdate>,
}

impl ChatSession {
    pub fn new(
        channel: Arc<ChannelManager>,
        guard: Arc<CredentialGuard>,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<ChatUpdate>) {
        let (updates_tx, updates_rx) = mpsc::unbounded_channel();
        let session = Arc::new(Self {
            channel: channel.clone(),
            state: parking_lot::Mutex::new(ChatState {
                context: ChatContext::None,
                typing: HashMap::new(),
                typing_sent: false,
                generation: 0,
                countdown: None,
            }),
            updates_tx,
        });

        tokio::spawn(session.clone().run(
            channel.subscribe_events(),
            channel.subscribe_state(),
            guard.subscribe(),
        ));
        tokio::spawn(Self::sweep_typing(Arc::downgrade(&session)));
        (session, updates_rx)
    }

    pub fn context(&self) -> ChatContext {
        self.state.lock().context.clone()
    }

    /// Switch the active context. The old context is left before the new one
    /// is joined; typing state from the old context is discarded. The local
    /// context is updated even while the channel is down, and re-announced
    /// once it comes back.
    pub fn switch_to(&self, context: ChatContext) {
        let (leave, join);
        {
            let mut state = self.state.lock();
            if state.context == context {
                return;
            }
            leave = Self::leave_event(&state.context);
            join = Self::join_event(&context);
            state.context = context;
            state.typing.clear();
            state.typing_sent = false;
            state.generation += 1;
            if let Some(handle) = state.countdown.take() {
                handle.abort();
            }
        }
        if let Some(event) = leave {
            if let Err(e) = self.channel.send(&event) {
                debug!("Leave not sent ({e}), server will drop us on its own");
            }
        }
        if let Some(event) = join {
            if let Err(e) = self.channel.send(&event) {
                debug!("Join not sent ({e}), will re-announce on reconnect");
            }
        }
    }

    /// Send a message into the active context. Empty payloads and messages
    /// with no context joined are dropped, never queued; a live typing
    /// indicator is retracted before the message goes out.
    pub fn send_message(&self, message: OutgoingMessage) -> Result<()> {
        if message.is_empty() {
            debug!("Dropping empty outbound message");
            return Ok(());
        }
        let (context, retract) = {
            let mut state = self.state.lock();
            let retract = state.typing_sent;
            state.typing_sent = false;
            if let Some(handle) = state.countdown.take() {
                handle.abort();
            }
            (state.context.clone(), retract)
        };

        let event = match &context {
            ChatContext::None => {
                debug!("Dropping outbound message, no context joined");
                return Ok(());
            }
            ChatContext::Room(room_id) => {
                if retract {
                    let _ = self.channel.send(&ClientEvent::StopTyping {
                        context_id: room_id.clone(),
                    });
                }
                ClientEvent::ChatMessage {
                    room_id: room_id.clone(),
                    content: message.content,
                    attachment_id: message.attachment_id,
                }
            }
            ChatContext::Conversation(conversation_id) => {
                if retract {
                    let _ = self.channel.send(&ClientEvent::StopTyping {
                        context_id: conversation_id.clone(),
                    });
                }
                ClientEvent::DirectMessage {
                    conversation_id: conversation_id.clone(),
                    content: message.content,
                    attachment_id: message.attachment_id,
                }
            }
        };
        self.channel.send(&event)
    }

    /// Register a keystroke. The first call announces `typing`; every call
    /// restarts the debounce countdown, and `stopTyping` goes out once the
    /// user has been quiet for the full debounce window.
    pub fn emit_typing(self: &Arc<Self>) {
        let mut state = self.state.lock();
        let Some(context_id) = state.context.id().map(str::to_string) else {
            return;
        };

        if !state.typing_sent {
            match self.channel.send(&ClientEvent::Typing {
                context_id: context_id.clone(),
            }) {
                Ok(()) => state.typing_sent = true,
                Err(e) => {
                    debug!("Typing not sent: {e}");
                    return;
                }
            }
        }

        if let Some(handle) = state.countdown.take() {
            handle.abort();
        }
        let generation = state.generation;
        let session = Arc::downgrade(self);
        state.countdown = Some(tokio::spawn(async move {
            tokio::time::sleep(TYPING_DEBOUNCE).await;
            let Some(session) = session.upgrade() else {
                return;
            };
            let mut state = session.state.lock();
            if state.generation != generation || !state.typing_sent {
                return;
            }
            state.typing_sent = false;
            state.countdown = None;
            drop(state);
            let _ = session
                .channel
                .send(&ClientEvent::StopTyping { context_id });
        }));
    }

    fn join_event(context: &ChatContext) -> Option<ClientEvent> {
        match context {
            ChatContext::None => None,
            ChatContext::Room(id) => Some(ClientEvent::JoinRoom {
                room_id: id.clone(),
            }),
            ChatContext::Conversation(id) => Some(ClientEvent::DirectJoin {
                conversation_id: id.clone(),
            }),
        }
    }

    fn leave_event(context: &ChatContext) -> Option<ClientEvent> {
        match context {
            ChatContext::None => None,
            ChatContext::Room(id) => Some(ClientEvent::LeaveRoom {
                room_id: id.clone(),
            }),
            ChatContext::Conversation(id) => Some(ClientEvent::DirectLeave {
                conversation_id: id.clone(),
            }),
        }
    }

    async fn run(
        self: Arc<Self>,
        mut events: broadcast::Receiver<ServerEvent>,
        mut states: tokio::sync::watch::Receiver<ChannelState>,
        mut auth: broadcast::Receiver<AuthEvent>,
    ) {
        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Ok(event) => self.handle_event(event),
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("Chat event stream lagged, {n} events lost");
                    }
                    Err(broadcast::error::RecvError::Closed) => return,
                },
                changed = states.changed() => {
                    if changed.is_err() {
                        return;
                    }
                    if *states.borrow_and_update() == ChannelState::Connected {
                        self.rejoin();
                    }
                }
                event = auth.recv() => match event {
                    Ok(AuthEvent::LoggedOut) => self.reset(),
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(_)) => {}
                    Err(broadcast::error::RecvError::Closed) => return,
                },
            }
        }
    }

    /// Re-announce the active context after a reconnect; server-side
    /// membership does not survive a dropped socket, and neither does any
    /// typing state buffered for it.
    fn rejoin(&self) {
        let join = {
            let mut state = self.state.lock();
            state.typing.clear();
            state.typing_sent = false;
            state.generation += 1;
            if let Some(handle) = state.countdown.take() {
                handle.abort();
            }
            Self::join_event(&state.context)
        };
        if let Some(event) = join {
            debug!("Re-announcing chat context after reconnect");
            if let Err(e) = self.channel.send(&event) {
                debug!("Rejoin not sent: {e}");
            }
        }
    }

    fn reset(&self) {
        let mut state = self.state.lock();
        state.context = ChatContext::None;
        state.typing.clear();
        state.typing_sent = false;
        state.generation += 1;
        if let Some(handle) = state.countdown.take() {
            handle.abort();
        }
    }

    fn handle_event(&self, event: ServerEvent) {
        match event {
            ServerEvent::ChatMessage(message) | ServerEvent::DirectMessage(message) => {
                if self.in_context(&message.context_id) {
                    self.emit(ChatUpdate::Message(message));
                } else {
                    debug!("Dropping message for inactive context {}", message.context_id);
                }
            }
            ServerEvent::Typing { context_id, user } => {
                if !self.in_context(&context_id) {
                    return;
                }
                let changed = {
                    let mut state = self.state.lock();
                    state
                        .typing
                        .insert(user.user_id.clone(), (user, tokio::time::Instant::now()))
                        .is_none()
                };
                if changed {
                    self.emit_typing_snapshot(&context_id);
                }
            }
            ServerEvent::StopTyping { context_id, user_id } => {
                if !self.in_context(&context_id) {
                    return;
                }
                let changed = self.state.lock().typing.remove(&user_id).is_some();
                if changed {
                    self.emit_typing_snapshot(&context_id);
                }
            }
            ServerEvent::UserJoined { room_id, user } => {
                if self.in_context(&room_id) {
                    self.emit(ChatUpdate::UserJoined { room_id, user });
                }
            }
            ServerEvent::UserLeft { room_id, user_id } => {
                if !self.in_context(&room_id) {
                    return;
                }
                let typing_changed = self.state.lock().typing.remove(&user_id).is_some();
                if typing_changed {
                    self.emit_typing_snapshot(&room_id);
                }
                self.emit(ChatUpdate::UserLeft { room_id, user_id });
            }
            ServerEvent::RoomUsers { room_id, users } => {
                if self.in_context(&room_id) {
                    self.emit(ChatUpdate::RoomUsers { room_id, users });
                }
            }
            _ => {}
        }
    }

    /// Drop typing entries that went quiet without an explicit stop.
    async fn sweep_typing(session: Weak<Self>) {
        let mut tick = tokio::time::interval(TYPING_SWEEP_INTERVAL);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tick.tick().await;
            let Some(session) = session.upgrade() else {
                return;
            };
            let expired_in = {
                let mut state = session.state.lock();
                let before = state.typing.len();
                let now = tokio::time::Instant::now();
                state
                    .typing
                    .retain(|_, (_, seen)| now.duration_since(*seen) < TYPING_TTL);
                if state.typing.len() < before {
                    state.context.id().map(str::to_string)
                } else {
                    None
                }
            };
            if let Some(context_id) = expired_in {
                session.emit_typing_snapshot(&context_id);
            }
        }
    }

    fn in_context(&self, context_id: &str) -> bool {
        self.state.lock().context.id() == Some(context_id)
    }

    fn emit_typing_snapshot(&self, context_id: &str) {
        let users = {
            let state = self.state.lock();
            state
                .typing
                .values()
                .map(|(user, _)| user.clone())
                .collect()
        };
        self.emit(ChatUpdate::TypingChanged {
            context_id: context_id.to_string(),
            users,
        });
    }

    fn emit(&self, update: ChatUpdate) {
        let _ = self.updates_tx.send(update);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::CredentialStore;
    use crate::test_util::{make_token, MockRefresh};
    use serde_json::Value;

    fn session() -> (
        Arc<ChatSession>,
        mpsc::UnboundedReceiver<ChatUpdate>,
        mpsc::UnboundedReceiver<String>,
        Arc<ChannelManager>,
    ) {
        let store = Arc::new(CredentialStore::in_memory().unwrap());
        store.save_token(&make_token("alice", 3600)).unwrap();
        let guard = CredentialGuard::new(Arc::new(MockRefresh::new()), store);
        let (channel, frames) = ChannelManager::stub_connected(guard.clone());
        let (chat, updates) = ChatSession::new(channel.clone(), guard);
        (chat, updates, frames, channel)
    }

    fn kind(frame: &str) -> String {
        let value: Value = serde_json::from_str(frame).unwrap();
        value["type"].as_str().unwrap().to_string()
    }

    fn user(id: &str) -> TypingUser {
        TypingUser {
            user_id: id.to_string(),
            username: id.to_string(),
            avatar_url: None,
        }
    }

    fn message_in(context_id: &str) -> IncomingMessage {
        IncomingMessage {
            message_id: "m1".to_string(),
            context_id: context_id.to_string(),
            sender: user("bob"),
            content: "hi".to_string(),
            attachment_id: None,
            timestamp: 0,
        }
    }

    #[tokio::test]
    async fn switching_rooms_leaves_before_joining() {
        let (chat, _updates, mut frames, _channel) = session();

        chat.switch_to(ChatContext::Room("general".to_string()));
        assert_eq!(kind(&frames.recv().await.unwrap()), "joinRoom");

        chat.switch_to(ChatContext::Room("random".to_string()));
        let leave: Value = serde_json::from_str(&frames.recv().await.unwrap()).unwrap();
        assert_eq!(leave["type"], "leaveRoom");
        assert_eq!(leave["payload"]["room_id"], "general");
        let join: Value = serde_json::from_str(&frames.recv().await.unwrap()).unwrap();
        assert_eq!(join["type"], "joinRoom");
        assert_eq!(join["payload"]["room_id"], "random");
    }

    #[tokio::test]
    async fn switching_to_the_same_context_sends_nothing() {
        let (chat, _updates, mut frames, _channel) = session();

        chat.switch_to(ChatContext::Room("general".to_string()));
        let _ = frames.recv().await.unwrap();
        chat.switch_to(ChatContext::Room("general".to_string()));
        assert!(frames.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn typing_bursts_collapse_to_one_stop() {
        let (chat, _updates, mut frames, _channel) = session();
        chat.switch_to(ChatContext::Room("general".to_string()));
        let _ = frames.recv().await.unwrap();

        for _ in 0..3 {
            chat.emit_typing();
            tokio::time::sleep(Duration::from_millis(500)).await;
        }
        // One typing announcement, and no stop while the burst is alive.
        assert_eq!(kind(&frames.recv().await.unwrap()), "chat:typing");
        assert!(frames.try_recv().is_err());

        tokio::time::sleep(TYPING_DEBOUNCE).await;
        assert_eq!(kind(&frames.recv().await.unwrap()), "chat:stopTyping");
        assert!(frames.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn context_switch_cancels_the_pending_stop() {
        let (chat, _updates, mut frames, _channel) = session();
        chat.switch_to(ChatContext::Room("general".to_string()));
        let _ = frames.recv().await.unwrap();

        chat.emit_typing();
        assert_eq!(kind(&frames.recv().await.unwrap()), "chat:typing");

        chat.switch_to(ChatContext::Room("random".to_string()));
        let _ = frames.recv().await.unwrap(); // leave
        let _ = frames.recv().await.unwrap(); // join

        tokio::time::sleep(TYPING_DEBOUNCE * 2).await;
        assert!(frames.try_recv().is_err(), "countdown must die with its context");
    }

    #[tokio::test(start_paused = true)]
    async fn messages_for_other_contexts_are_dropped() {
        let (chat, mut updates, mut frames, channel) = session();
        chat.switch_to(ChatContext::Room("general".to_string()));
        let _ = frames.recv().await.unwrap();

        channel.inject(ServerEvent::ChatMessage(message_in("random")));
        channel.inject(ServerEvent::ChatMessage(message_in("general")));
        tokio::time::sleep(Duration::from_millis(10)).await;

        let update = updates.recv().await.unwrap();
        let ChatUpdate::Message(message) = update else {
            panic!("expected a message update");
        };
        assert_eq!(message.context_id, "general");
        assert!(updates.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn typing_indicators_are_idempotent_and_expire() {
        let (chat, mut updates, mut frames, channel) = session();
        chat.switch_to(ChatContext::Room("general".to_string()));
        let _ = frames.recv().await.unwrap();

        channel.inject(ServerEvent::Typing {
            context_id: "general".to_string(),
            user: user("bob"),
        });
        channel.inject(ServerEvent::Typing {
            context_id: "general".to_string(),
            user: user("bob"),
        });
        tokio::time::sleep(Duration::from_millis(10)).await;

        let ChatUpdate::TypingChanged { users, .. } = updates.recv().await.unwrap() else {
            panic!("expected a typing update");
        };
        assert_eq!(users.len(), 1);
        assert!(updates.try_recv().is_err(), "repeat typing must not re-emit");

        tokio::time::sleep(TYPING_TTL + Duration::from_secs(2)).await;
        let ChatUpdate::TypingChanged { users, .. } = updates.recv().await.unwrap() else {
            panic!("expected the expiry update");
        };
        assert!(users.is_empty());
    }

    #[tokio::test]
    async fn send_message_guards_context_and_content() {
        let (chat, _updates, mut frames, _channel) = session();

        assert!(chat.send_message(OutgoingMessage::text("   ")).is_ok());
        assert!(frames.try_recv().is_err());

        // No context joined: dropped, not queued.
        assert!(chat.send_message(OutgoingMessage::text("hi")).is_ok());
        assert!(frames.try_recv().is_err());

        chat.switch_to(ChatContext::Conversation("c1".to_string()));
        let _ = frames.recv().await.unwrap();
        chat.send_message(OutgoingMessage::text("hi")).unwrap();
        assert_eq!(kind(&frames.recv().await.unwrap()), "direct:message");
    }
}
