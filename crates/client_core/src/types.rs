use chrono::{DateTime, Utc};
use shared::{
    domain::{ConversationId, ConversationKind, MessageId, MessageKind, UserId},
    protocol::{ConversationPayload, MessagePayload, UserPayload},
};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq)]
pub struct User {
    pub id: UserId,
    pub username: String,
    pub email: String,
    pub avatar: Option<String>,
    pub is_online: bool,
    /// Meaningful only while `is_online` is false.
    pub last_seen: Option<DateTime<Utc>>,
    pub role: Option<String>,
    pub permissions: Vec<String>,
}

impl From<UserPayload> for User {
    fn from(payload: UserPayload) -> Self {
        Self {
            id: payload.id,
            username: payload.username,
            email: payload.email,
            avatar: payload.avatar,
            is_online: payload.is_online,
            last_seen: payload.last_seen,
            role: payload.role,
            permissions: payload.permissions,
        }
    }
}

/// Send lifecycle of a message. A pending placeholder id and a server id can
/// never collide: they live in different variants.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum MessageState {
    Pending { local_id: Uuid },
    Confirmed { message_id: MessageId },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub state: MessageState,
    pub conversation_id: ConversationId,
    pub sender_id: UserId,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    pub kind: MessageKind,
    pub is_read: bool,
    pub is_delivered: Option<bool>,
}

impl Message {
    pub fn server_id(&self) -> Option<&MessageId> {
        match &self.state {
            MessageState::Confirmed { message_id } => Some(message_id),
            MessageState::Pending { .. } => None,
        }
    }

    pub fn is_pending(&self) -> bool {
        matches!(self.state, MessageState::Pending { .. })
    }
}

impl From<MessagePayload> for Message {
    fn from(payload: MessagePayload) -> Self {
        Self {
            state: MessageState::Confirmed {
                message_id: payload.id,
            },
            conversation_id: payload.conversation_id,
            sender_id: payload.sender_id,
            content: payload.content,
            timestamp: payload.timestamp,
            kind: payload.kind,
            is_read: payload.is_read,
            is_delivered: payload.is_delivered,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Conversation {
    pub id: ConversationId,
    pub participants: Vec<User>,
    pub last_message: Option<Message>,
    pub unread_count: u32,
    pub updated_at: DateTime<Utc>,
    pub kind: ConversationKind,
    pub name: Option<String>,
    pub description: Option<String>,
    pub avatar: Option<String>,
    pub created_by: Option<UserId>,
}

impl From<ConversationPayload> for Conversation {
    fn from(payload: ConversationPayload) -> Self {
        Self {
            id: payload.id,
            participants: payload.participants.into_iter().map(User::from).collect(),
            last_message: payload.last_message.map(Message::from),
            unread_count: payload.unread_count,
            updated_at: payload.updated_at,
            kind: payload.kind,
            name: payload.name,
            description: payload.description,
            avatar: payload.avatar,
            created_by: payload.created_by,
        }
    }
}
