use std::sync::Arc;

use chrono::{DateTime, Utc};
use shared::{
    domain::{ConversationId, ConversationKind, MessageId, MessageKind, UserId},
    protocol::{
        ClientAction, CreateConversationRequest, MessagePayload, RealtimeEvent, SendMessageRequest,
    },
};
use tokio::{
    sync::{broadcast, Mutex},
    task::JoinHandle,
};
use tracing::{debug, warn};
use uuid::Uuid;

pub mod error;
pub mod realtime;
pub mod session;
pub mod transport;
pub mod types;

pub use error::ClientError;
pub use realtime::{
    BridgeEvent, DisconnectReason, MissingRealtimeBridge, RealtimeBridge, ReconnectPolicy,
    WsRealtimeBridge,
};
pub use session::{
    CredentialStore, FileCredentialStore, MemoryCredentialStore, SessionManager, StoredCredentials,
};
pub use transport::ApiClient;
pub use types::{Conversation, Message, MessageState, User};

const MESSAGE_PAGE_LIMIT: u32 = 50;

/// Reconciler state: the conversation set plus the message list of the one
/// active conversation. Messages of inactive conversations are not retained;
/// only their `last_message` summaries are.
#[derive(Debug, Clone, Default)]
pub struct ChatState {
    pub conversations: Vec<Conversation>,
    pub active_conversation: Option<Conversation>,
    pub messages: Vec<Message>,
    pub is_loading: bool,
    pub current_user_id: Option<UserId>,
}

#[derive(Debug, Clone)]
pub enum ChatEvent {
    ConversationsUpdated,
    MessagesUpdated {
        conversation_id: ConversationId,
    },
    MessageReceived {
        message: Message,
    },
    PresenceChanged {
        user_id: UserId,
        is_online: bool,
    },
    TypingChanged {
        conversation_id: ConversationId,
        user_id: UserId,
        username: String,
        is_typing: bool,
    },
    MessagesRead {
        conversation_id: ConversationId,
        user_id: UserId,
        message_ids: Vec<MessageId>,
    },
    MembershipChanged {
        conversation_id: ConversationId,
        user_id: UserId,
        joined: bool,
    },
    Error(String),
}

#[derive(Debug, Clone, Default)]
pub struct CreateConversationOptions {
    pub kind: Option<ConversationKind>,
    pub name: Option<String>,
    pub description: Option<String>,
}

/// Merges REST fetch results, realtime push events, and local optimistic
/// sends into one consistent conversation/message view.
pub struct ChatClient {
    api: Arc<ApiClient>,
    bridge: Arc<dyn RealtimeBridge>,
    inner: Mutex<ChatState>,
    events: broadcast::Sender<ChatEvent>,
}

impl ChatClient {
    pub fn new(api: Arc<ApiClient>, bridge: Arc<dyn RealtimeBridge>) -> Arc<Self> {
        let (events, _) = broadcast::channel(1024);
        Arc::new(Self {
            api,
            bridge,
            inner: Mutex::new(ChatState::default()),
            events,
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ChatEvent> {
        self.events.subscribe()
    }

    pub async fn state(&self) -> ChatState {
        self.inner.lock().await.clone()
    }

    /// Cold/refresh load: replaces the whole conversation set on success and
    /// leaves prior state untouched on failure (the loading flag always
    /// resets).
    pub async fn load_conversations(&self, current_user_id: UserId) -> Result<(), ClientError> {
        {
            let mut guard = self.inner.lock().await;
            guard.current_user_id = Some(current_user_id);
            guard.is_loading = true;
        }

        match self.api.list_conversations().await {
            Ok(payloads) => {
                let conversations: Vec<Conversation> =
                    payloads.into_iter().map(Conversation::from).collect();
                {
                    let mut guard = self.inner.lock().await;
                    guard.conversations = conversations;
                    guard.is_loading = false;
                }
                let _ = self.events.send(ChatEvent::ConversationsUpdated);
                Ok(())
            }
            Err(err) => {
                self.inner.lock().await.is_loading = false;
                warn!("chat: conversation load failed: {err}");
                Err(err)
            }
        }
    }

    /// Activates a conversation. The previous message list is cleared
    /// synchronously, before any fetch resolves, so a message from the old
    /// conversation can never show under the new one.
    pub async fn select_conversation(
        &self,
        conversation: Conversation,
        current_user_id: UserId,
    ) -> Result<(), ClientError> {
        let conversation_id = conversation.id.clone();
        {
            let mut guard = self.inner.lock().await;
            guard.current_user_id = Some(current_user_id.clone());
            guard.messages.clear();
            guard.is_loading = true;
            if let Some(entry) = guard
                .conversations
                .iter_mut()
                .find(|c| c.id == conversation_id)
            {
                entry.unread_count = 0;
            }
            let mut active = conversation;
            active.unread_count = 0;
            guard.active_conversation = Some(active);
        }
        let _ = self.events.send(ChatEvent::MessagesUpdated {
            conversation_id: conversation_id.clone(),
        });

        self.bridge
            .send(ClientAction::JoinConversation {
                conversation_id: conversation_id.clone(),
            })
            .await;

        let page = match self
            .api
            .list_messages(&conversation_id, 1, MESSAGE_PAGE_LIMIT)
            .await
        {
            Ok(page) => page,
            Err(err) => {
                let mut guard = self.inner.lock().await;
                if guard
                    .active_conversation
                    .as_ref()
                    .is_some_and(|c| c.id == conversation_id)
                {
                    guard.is_loading = false;
                }
                warn!(
                    conversation_id = %conversation_id.0,
                    "chat: message fetch failed: {err}"
                );
                return Err(err);
            }
        };

        let messages: Vec<Message> = page.messages.into_iter().map(Message::from).collect();
        let unread_ids: Vec<MessageId> = messages
            .iter()
            .filter(|m| m.sender_id != current_user_id && !m.is_read)
            .filter_map(|m| m.server_id().cloned())
            .collect();

        {
            let mut guard = self.inner.lock().await;
            if !guard
                .active_conversation
                .as_ref()
                .is_some_and(|c| c.id == conversation_id)
            {
                // The user switched away while this fetch was in flight.
                debug!(
                    conversation_id = %conversation_id.0,
                    "chat: discarding stale message fetch"
                );
                return Ok(());
            }
            guard.messages = messages;
            guard.is_loading = false;
        }

        if !unread_ids.is_empty() {
            self.bridge
                .send(ClientAction::MarkMessagesRead {
                    conversation_id: conversation_id.clone(),
                    message_ids: unread_ids,
                })
                .await;
        }

        let _ = self
            .events
            .send(ChatEvent::MessagesUpdated { conversation_id });
        Ok(())
    }

    /// Optimistic send. A Pending entry appears immediately (only when the
    /// target conversation is active) and is replaced in place once the
    /// server echoes the persisted record. A failed send keeps the Pending
    /// entry visible and reports the error; there is no automatic rollback.
    pub async fn send_message(
        &self,
        content: &str,
        conversation_id: ConversationId,
        sender_id: UserId,
    ) -> Result<(), ClientError> {
        let local_id = Uuid::new_v4();
        let pending = Message {
            state: MessageState::Pending { local_id },
            conversation_id: conversation_id.clone(),
            sender_id: sender_id.clone(),
            content: content.to_string(),
            timestamp: Utc::now(),
            kind: MessageKind::Text,
            is_read: false,
            is_delivered: Some(false),
        };

        {
            let mut guard = self.inner.lock().await;
            guard.current_user_id = Some(sender_id);
            if guard
                .active_conversation
                .as_ref()
                .is_some_and(|c| c.id == conversation_id)
            {
                guard.messages.push(pending);
            }
        }
        let _ = self.events.send(ChatEvent::MessagesUpdated {
            conversation_id: conversation_id.clone(),
        });

        let payload = match self
            .api
            .send_message(&SendMessageRequest {
                conversation_id: conversation_id.clone(),
                content: content.to_string(),
                kind: MessageKind::Text,
            })
            .await
        {
            Ok(payload) => payload,
            Err(err) => {
                warn!(
                    conversation_id = %conversation_id.0,
                    "chat: send failed, pending message kept: {err}"
                );
                return Err(err);
            }
        };

        let confirmed = Message::from(payload);
        {
            let mut guard = self.inner.lock().await;
            if guard
                .active_conversation
                .as_ref()
                .is_some_and(|c| c.id == conversation_id)
            {
                // Matched by the placeholder's own identity, never by
                // content: two identical rapid sends must not cross-match.
                if let Some(slot) = guard.messages.iter_mut().find(|m| {
                    matches!(m.state, MessageState::Pending { local_id: id } if id == local_id)
                }) {
                    *slot = confirmed.clone();
                }
            }
            if let Some(pos) = guard
                .conversations
                .iter()
                .position(|c| c.id == conversation_id)
            {
                let mut conversation = guard.conversations.remove(pos);
                conversation.updated_at = Utc::now();
                conversation.last_message = Some(confirmed.clone());
                guard.conversations.insert(0, conversation);
            }
            if let Some(active) = guard
                .active_conversation
                .as_mut()
                .filter(|c| c.id == conversation_id)
            {
                active.updated_at = Utc::now();
                active.last_message = Some(confirmed);
            }
        }

        let _ = self.events.send(ChatEvent::MessagesUpdated {
            conversation_id: conversation_id.clone(),
        });
        let _ = self.events.send(ChatEvent::ConversationsUpdated);
        Ok(())
    }

    pub async fn create_conversation(
        &self,
        participant_ids: Vec<UserId>,
        current_user_id: UserId,
        options: CreateConversationOptions,
    ) -> Result<Conversation, ClientError> {
        let request = CreateConversationRequest {
            participants: participant_ids,
            kind: options.kind.unwrap_or_default(),
            name: options.name,
            description: options.description,
        };
        let payload = self.api.create_conversation(&request).await?;
        let conversation = Conversation::from(payload);
        {
            let mut guard = self.inner.lock().await;
            guard.current_user_id = Some(current_user_id);
            guard.conversations.insert(0, conversation.clone());
        }
        let _ = self.events.send(ChatEvent::ConversationsUpdated);
        Ok(conversation)
    }

    /// Spawns the single pump task feeding bridge events into the handlers.
    pub fn attach_bridge_events(self: &Arc<Self>) -> JoinHandle<()> {
        let mut receiver = self.bridge.subscribe();
        let client = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                match receiver.recv().await {
                    Ok(BridgeEvent::Push(event)) => client.handle_push(event).await,
                    Ok(BridgeEvent::ReconnectExhausted { attempts }) => {
                        let _ = client.events.send(ChatEvent::Error(
                            ClientError::ReconnectExhausted { attempts }.to_string(),
                        ));
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "chat: push receiver lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }

    pub async fn handle_push(&self, event: RealtimeEvent) {
        match event {
            RealtimeEvent::NewMessage { message } => self.handle_new_message(message).await,
            RealtimeEvent::UserOnline { user_id, .. } => {
                self.handle_presence(&user_id, true, None).await;
            }
            RealtimeEvent::UserOffline {
                user_id, last_seen, ..
            } => {
                self.handle_presence(&user_id, false, Some(last_seen)).await;
            }
            RealtimeEvent::UserTyping {
                user_id,
                username,
                conversation_id,
            } => {
                let _ = self.events.send(ChatEvent::TypingChanged {
                    conversation_id,
                    user_id,
                    username,
                    is_typing: true,
                });
            }
            RealtimeEvent::UserStoppedTyping {
                user_id,
                username,
                conversation_id,
            } => {
                let _ = self.events.send(ChatEvent::TypingChanged {
                    conversation_id,
                    user_id,
                    username,
                    is_typing: false,
                });
            }
            RealtimeEvent::MessagesRead {
                user_id,
                conversation_id,
                message_ids,
            } => {
                let _ = self.events.send(ChatEvent::MessagesRead {
                    conversation_id,
                    user_id,
                    message_ids,
                });
            }
            RealtimeEvent::UserJoinedConversation {
                user_id,
                conversation_id,
                ..
            } => {
                let _ = self.events.send(ChatEvent::MembershipChanged {
                    conversation_id,
                    user_id,
                    joined: true,
                });
            }
            RealtimeEvent::UserLeftConversation {
                user_id,
                conversation_id,
                ..
            } => {
                let _ = self.events.send(ChatEvent::MembershipChanged {
                    conversation_id,
                    user_id,
                    joined: false,
                });
            }
            RealtimeEvent::Error { message } => {
                let _ = self.events.send(ChatEvent::Error(message));
            }
        }
    }

    /// Push path for another participant's message. Echoes of the local
    /// session's own sends are discarded: the REST round-trip is the sole
    /// confirmation path for those.
    async fn handle_new_message(&self, payload: MessagePayload) {
        let message = {
            let mut guard = self.inner.lock().await;
            if guard
                .current_user_id
                .as_ref()
                .is_some_and(|current| *current == payload.sender_id)
            {
                debug!(message_id = %payload.id.0, "chat: skipping own message echo");
                return;
            }

            let message = Message::from(payload);
            let is_active = guard
                .active_conversation
                .as_ref()
                .is_some_and(|c| c.id == message.conversation_id);

            if is_active {
                let duplicate = message.server_id().is_some_and(|id| {
                    guard.messages.iter().any(|m| m.server_id() == Some(id))
                });
                if duplicate {
                    debug!(
                        conversation_id = %message.conversation_id.0,
                        "chat: dropping redelivered push"
                    );
                } else {
                    guard.messages.push(message.clone());
                }
            }

            if let Some(pos) = guard
                .conversations
                .iter()
                .position(|c| c.id == message.conversation_id)
            {
                let mut conversation = guard.conversations.remove(pos);
                conversation.last_message = Some(message.clone());
                conversation.updated_at = message.timestamp;
                if !is_active {
                    conversation.unread_count += 1;
                }
                guard.conversations.insert(0, conversation);
            }
            if is_active {
                if let Some(active) = guard.active_conversation.as_mut() {
                    active.last_message = Some(message.clone());
                    active.updated_at = message.timestamp;
                }
            }
            message
        };

        let _ = self.events.send(ChatEvent::MessageReceived { message });
        let _ = self.events.send(ChatEvent::ConversationsUpdated);
    }

    /// O(conversations x participants) scan; fine at chat-app scale.
    async fn handle_presence(
        &self,
        user_id: &UserId,
        is_online: bool,
        last_seen: Option<DateTime<Utc>>,
    ) {
        {
            let mut guard = self.inner.lock().await;
            let update = |participants: &mut Vec<User>| {
                for participant in participants.iter_mut().filter(|p| &p.id == user_id) {
                    participant.is_online = is_online;
                    if !is_online {
                        participant.last_seen = last_seen;
                    }
                }
            };
            for conversation in guard.conversations.iter_mut() {
                update(&mut conversation.participants);
            }
            if let Some(active) = guard.active_conversation.as_mut() {
                update(&mut active.participants);
            }
        }
        let _ = self.events.send(ChatEvent::PresenceChanged {
            user_id: user_id.clone(),
            is_online,
        });
    }
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
