use super::*;

use std::{collections::HashMap, time::Duration};

use async_trait::async_trait;
use axum::{
    extract::{Path, State},
    routing::{get, post},
    Json, Router,
};
use shared::protocol::{
    ApiEnvelope, ConversationData, ConversationPayload, ConversationsData, MessageData,
    MessagesData, PageInfo, UserPayload,
};
use tokio::{net::TcpListener, time::timeout};

struct RecordingBridge {
    actions: Arc<Mutex<Vec<ClientAction>>>,
    events: broadcast::Sender<BridgeEvent>,
}

impl RecordingBridge {
    fn new() -> Arc<Self> {
        let (events, _) = broadcast::channel(64);
        Arc::new(Self {
            actions: Arc::new(Mutex::new(Vec::new())),
            events,
        })
    }
}

#[async_trait]
impl RealtimeBridge for RecordingBridge {
    async fn connect(&self, _token: &str) -> Result<(), ClientError> {
        Ok(())
    }

    async fn disconnect(&self) {}

    async fn send(&self, action: ClientAction) {
        self.actions.lock().await.push(action);
    }

    fn subscribe(&self) -> broadcast::Receiver<BridgeEvent> {
        self.events.subscribe()
    }

    async fn is_connected(&self) -> bool {
        true
    }
}

fn user(id: &str) -> UserPayload {
    UserPayload {
        id: UserId::new(id),
        username: id.to_string(),
        email: format!("{id}@example.com"),
        avatar: None,
        is_online: true,
        last_seen: None,
        role: None,
        permissions: Vec::new(),
    }
}

fn message(id: &str, conversation: &str, sender: &str, content: &str) -> MessagePayload {
    MessagePayload {
        id: MessageId::new(id),
        conversation_id: ConversationId::new(conversation),
        sender_id: UserId::new(sender),
        content: content.to_string(),
        timestamp: Utc::now(),
        kind: MessageKind::Text,
        is_read: false,
        is_delivered: Some(true),
    }
}

fn conversation(id: &str, participants: Vec<UserPayload>) -> ConversationPayload {
    ConversationPayload {
        id: ConversationId::new(id),
        participants,
        last_message: None,
        unread_count: 0,
        updated_at: Utc::now(),
        kind: ConversationKind::Direct,
        name: None,
        description: None,
        avatar: None,
        created_by: None,
    }
}

fn ok_envelope<T>(data: T) -> Json<ApiEnvelope<T>> {
    Json(ApiEnvelope {
        success: true,
        message: "ok".to_string(),
        data: Some(data),
        errors: None,
    })
}

#[derive(Clone, Default)]
struct ApiState {
    conversations: Arc<Mutex<Vec<ConversationPayload>>>,
    // conversation id -> (response delay, page contents)
    messages: Arc<Mutex<HashMap<String, (Duration, Vec<MessagePayload>)>>>,
}

async fn handle_list_conversations(
    State(state): State<ApiState>,
) -> Json<ApiEnvelope<ConversationsData>> {
    let conversations = state.conversations.lock().await.clone();
    ok_envelope(ConversationsData { conversations })
}

async fn handle_list_messages(
    State(state): State<ApiState>,
    Path(conversation_id): Path<String>,
) -> Json<ApiEnvelope<MessagesData>> {
    let (delay, messages) = state
        .messages
        .lock()
        .await
        .get(&conversation_id)
        .cloned()
        .unwrap_or((Duration::ZERO, Vec::new()));
    tokio::time::sleep(delay).await;
    ok_envelope(MessagesData {
        messages,
        pagination: PageInfo {
            page: 1,
            limit: 50,
            has_more: false,
        },
    })
}

async fn handle_send_message(
    Json(request): Json<SendMessageRequest>,
) -> Json<ApiEnvelope<MessageData>> {
    let message = MessagePayload {
        id: MessageId::new(format!("srv-{}", request.content)),
        conversation_id: request.conversation_id,
        sender_id: UserId::new("me"),
        content: request.content,
        timestamp: Utc::now(),
        kind: request.kind,
        is_read: false,
        is_delivered: Some(true),
    };
    ok_envelope(MessageData { message })
}

async fn handle_create_conversation(
    Json(request): Json<CreateConversationRequest>,
) -> Json<ApiEnvelope<ConversationData>> {
    let mut created = conversation(
        "created",
        request
            .participants
            .iter()
            .map(|id| user(&id.0))
            .collect(),
    );
    created.kind = request.kind;
    created.name = request.name;
    ok_envelope(ConversationData {
        conversation: created,
    })
}

async fn spawn_api(state: ApiState) -> String {
    std::env::set_var("NO_PROXY", "127.0.0.1,localhost");
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    let app = Router::new()
        .route(
            "/conversations",
            get(handle_list_conversations).post(handle_create_conversation),
        )
        .route("/messages/:conversation_id", get(handle_list_messages))
        .route("/messages", post(handle_send_message))
        .with_state(state);
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    format!("http://{addr}")
}

async fn dead_base_url() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    drop(listener);
    format!("http://{addr}")
}

fn client_with(base_url: &str, bridge: Arc<RecordingBridge>) -> Arc<ChatClient> {
    ChatClient::new(Arc::new(ApiClient::new(base_url)), bridge)
}

#[tokio::test]
async fn own_message_push_is_discarded() {
    let client = client_with("http://127.0.0.1:9", RecordingBridge::new());
    {
        let mut inner = client.inner.lock().await;
        inner.current_user_id = Some(UserId::new("me"));
        inner.conversations = vec![Conversation::from(conversation(
            "c1",
            vec![user("me"), user("peer")],
        ))];
        inner.active_conversation = inner.conversations.first().cloned();
    }
    let mut rx = client.subscribe();

    client
        .handle_push(RealtimeEvent::NewMessage {
            message: message("m1", "c1", "me", "echo of my own send"),
        })
        .await;

    let state = client.state().await;
    assert!(state.messages.is_empty());
    assert_eq!(state.conversations[0].unread_count, 0);
    assert!(state.conversations[0].last_message.is_none());
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn push_appends_to_active_conversation_and_moves_it_to_front() {
    let client = client_with("http://127.0.0.1:9", RecordingBridge::new());
    {
        let mut inner = client.inner.lock().await;
        inner.current_user_id = Some(UserId::new("me"));
        inner.conversations = vec![
            Conversation::from(conversation("c2", vec![user("me"), user("other")])),
            Conversation::from(conversation("c1", vec![user("me"), user("peer")])),
        ];
        inner.active_conversation = Some(inner.conversations[1].clone());
    }
    let mut rx = client.subscribe();

    client
        .handle_push(RealtimeEvent::NewMessage {
            message: message("m1", "c1", "peer", "hello"),
        })
        .await;

    let state = client.state().await;
    assert_eq!(state.messages.len(), 1);
    assert_eq!(
        state.messages[0].server_id(),
        Some(&MessageId::new("m1"))
    );
    assert_eq!(state.conversations[0].id, ConversationId::new("c1"));
    assert_eq!(state.conversations[0].unread_count, 0);
    let active = state.active_conversation.expect("active");
    assert_eq!(
        active.last_message.expect("last message").content,
        "hello"
    );

    match timeout(Duration::from_secs(1), rx.recv()).await {
        Ok(Ok(ChatEvent::MessageReceived { message })) => assert_eq!(message.content, "hello"),
        other => panic!("unexpected event: {other:?}"),
    }
}

#[tokio::test]
async fn push_to_inactive_conversation_increments_unread() {
    let client = client_with("http://127.0.0.1:9", RecordingBridge::new());
    {
        let mut inner = client.inner.lock().await;
        inner.current_user_id = Some(UserId::new("me"));
        inner.conversations = vec![
            Conversation::from(conversation("c1", vec![user("me"), user("peer")])),
            Conversation::from(conversation("c2", vec![user("me"), user("other")])),
        ];
        inner.active_conversation = Some(inner.conversations[0].clone());
    }

    client
        .handle_push(RealtimeEvent::NewMessage {
            message: message("m9", "c2", "other", "psst"),
        })
        .await;

    let state = client.state().await;
    assert!(state.messages.is_empty());
    assert_eq!(state.conversations[0].id, ConversationId::new("c2"));
    assert_eq!(state.conversations[0].unread_count, 1);
}

#[tokio::test]
async fn redelivered_push_is_appended_once() {
    let client = client_with("http://127.0.0.1:9", RecordingBridge::new());
    {
        let mut inner = client.inner.lock().await;
        inner.current_user_id = Some(UserId::new("me"));
        inner.conversations = vec![Conversation::from(conversation(
            "c1",
            vec![user("me"), user("peer")],
        ))];
        inner.active_conversation = inner.conversations.first().cloned();
    }

    for _ in 0..2 {
        client
            .handle_push(RealtimeEvent::NewMessage {
                message: message("m1", "c1", "peer", "hello"),
            })
            .await;
    }

    assert_eq!(client.state().await.messages.len(), 1);
}

#[tokio::test]
async fn presence_change_updates_every_conversation() {
    let client = client_with("http://127.0.0.1:9", RecordingBridge::new());
    {
        let mut inner = client.inner.lock().await;
        inner.conversations = vec![
            Conversation::from(conversation("c1", vec![user("me"), user("peer")])),
            Conversation::from(conversation("c2", vec![user("me"), user("peer")])),
        ];
        inner.active_conversation = Some(inner.conversations[0].clone());
    }
    let mut rx = client.subscribe();
    let last_seen: DateTime<Utc> = "2026-08-27T10:00:00Z".parse().expect("timestamp");

    client
        .handle_push(RealtimeEvent::UserOffline {
            user_id: UserId::new("peer"),
            username: "peer".to_string(),
            last_seen,
        })
        .await;

    let state = client.state().await;
    for conversation in &state.conversations {
        let peer = conversation
            .participants
            .iter()
            .find(|p| p.id == UserId::new("peer"))
            .expect("peer");
        assert!(!peer.is_online);
        assert_eq!(peer.last_seen, Some(last_seen));
    }
    let active_peer = state
        .active_conversation
        .expect("active")
        .participants
        .into_iter()
        .find(|p| p.id == UserId::new("peer"))
        .expect("peer");
    assert!(!active_peer.is_online);

    match timeout(Duration::from_secs(1), rx.recv()).await {
        Ok(Ok(ChatEvent::PresenceChanged { user_id, is_online })) => {
            assert_eq!(user_id, UserId::new("peer"));
            assert!(!is_online);
        }
        other => panic!("unexpected event: {other:?}"),
    }
}

#[tokio::test]
async fn typing_pushes_are_forwarded() {
    let client = client_with("http://127.0.0.1:9", RecordingBridge::new());
    let mut rx = client.subscribe();

    client
        .handle_push(RealtimeEvent::UserTyping {
            user_id: UserId::new("peer"),
            username: "peer".to_string(),
            conversation_id: ConversationId::new("c1"),
        })
        .await;

    match timeout(Duration::from_secs(1), rx.recv()).await {
        Ok(Ok(ChatEvent::TypingChanged {
            is_typing,
            username,
            ..
        })) => {
            assert!(is_typing);
            assert_eq!(username, "peer");
        }
        other => panic!("unexpected event: {other:?}"),
    }
}

#[tokio::test]
async fn load_conversations_replaces_the_list() {
    let state = ApiState::default();
    *state.conversations.lock().await = vec![
        conversation("c1", vec![user("me"), user("peer")]),
        conversation("c2", vec![user("me"), user("other")]),
    ];
    let base_url = spawn_api(state).await;
    let client = client_with(&base_url, RecordingBridge::new());

    client
        .load_conversations(UserId::new("me"))
        .await
        .expect("load");

    let state = client.state().await;
    assert_eq!(state.conversations.len(), 2);
    assert!(!state.is_loading);
    assert_eq!(state.current_user_id, Some(UserId::new("me")));
}

#[tokio::test]
async fn failed_conversation_load_keeps_previous_list() {
    let base_url = dead_base_url().await;
    let client = client_with(&base_url, RecordingBridge::new());
    {
        let mut inner = client.inner.lock().await;
        inner.conversations = vec![Conversation::from(conversation(
            "c1",
            vec![user("me"), user("peer")],
        ))];
    }

    let err = client
        .load_conversations(UserId::new("me"))
        .await
        .expect_err("must fail");
    assert!(matches!(err, ClientError::Transport(_)));
    assert_eq!(err.status(), 0);

    let state = client.state().await;
    assert_eq!(state.conversations.len(), 1);
    assert!(!state.is_loading);
}

#[tokio::test]
async fn select_conversation_fetches_and_batches_one_mark_read() {
    let api_state = ApiState::default();
    {
        let mut unread_a = message("m1", "c1", "peer", "first");
        unread_a.is_read = false;
        let mut own = message("m2", "c1", "me", "mine");
        own.is_read = false;
        let mut already_read = message("m3", "c1", "peer", "seen");
        already_read.is_read = true;
        let mut unread_b = message("m4", "c1", "peer", "second");
        unread_b.is_read = false;
        api_state.messages.lock().await.insert(
            "c1".to_string(),
            (Duration::ZERO, vec![unread_a, own, already_read, unread_b]),
        );
    }
    let base_url = spawn_api(api_state).await;
    let bridge = RecordingBridge::new();
    let client = client_with(&base_url, bridge.clone());

    let mut selected = Conversation::from(conversation("c1", vec![user("me"), user("peer")]));
    selected.unread_count = 3;
    {
        let mut inner = client.inner.lock().await;
        inner.conversations = vec![selected.clone()];
    }

    client
        .select_conversation(selected, UserId::new("me"))
        .await
        .expect("select");

    let state = client.state().await;
    assert_eq!(state.messages.len(), 4);
    assert!(!state.is_loading);
    assert_eq!(state.conversations[0].unread_count, 0);
    assert_eq!(
        state.active_conversation.expect("active").unread_count,
        0
    );

    let actions = bridge.actions.lock().await.clone();
    assert_eq!(actions.len(), 2);
    assert_eq!(
        actions[0],
        ClientAction::JoinConversation {
            conversation_id: ConversationId::new("c1"),
        }
    );
    assert_eq!(
        actions[1],
        ClientAction::MarkMessagesRead {
            conversation_id: ConversationId::new("c1"),
            message_ids: vec![MessageId::new("m1"), MessageId::new("m4")],
        }
    );
}

#[tokio::test]
async fn select_without_unread_messages_skips_mark_read() {
    let api_state = ApiState::default();
    {
        let mut seen = message("m1", "c1", "peer", "seen");
        seen.is_read = true;
        api_state
            .messages
            .lock()
            .await
            .insert("c1".to_string(), (Duration::ZERO, vec![seen]));
    }
    let base_url = spawn_api(api_state).await;
    let bridge = RecordingBridge::new();
    let client = client_with(&base_url, bridge.clone());

    client
        .select_conversation(
            Conversation::from(conversation("c1", vec![user("me"), user("peer")])),
            UserId::new("me"),
        )
        .await
        .expect("select");

    let actions = bridge.actions.lock().await.clone();
    assert_eq!(actions.len(), 1);
    assert!(matches!(actions[0], ClientAction::JoinConversation { .. }));
}

#[tokio::test]
async fn stale_message_fetch_is_discarded_after_reselection() {
    let api_state = ApiState::default();
    {
        let mut messages = api_state.messages.lock().await;
        messages.insert(
            "c1".to_string(),
            (
                Duration::from_millis(200),
                vec![message("m1", "c1", "peer", "old conversation")],
            ),
        );
        messages.insert(
            "c2".to_string(),
            (
                Duration::ZERO,
                vec![message("m2", "c2", "other", "new conversation")],
            ),
        );
    }
    let base_url = spawn_api(api_state).await;
    let client = client_with(&base_url, RecordingBridge::new());
    let first = Conversation::from(conversation("c1", vec![user("me"), user("peer")]));
    let second = Conversation::from(conversation("c2", vec![user("me"), user("other")]));
    {
        let mut inner = client.inner.lock().await;
        inner.conversations = vec![first.clone(), second.clone()];
    }

    let slow = {
        let client = Arc::clone(&client);
        tokio::spawn(async move { client.select_conversation(first, UserId::new("me")).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    client
        .select_conversation(second, UserId::new("me"))
        .await
        .expect("select second");
    slow.await.expect("join").expect("first select completes");

    let state = client.state().await;
    assert_eq!(
        state.active_conversation.expect("active").id,
        ConversationId::new("c2")
    );
    assert_eq!(state.messages.len(), 1);
    assert_eq!(state.messages[0].content, "new conversation");
    assert!(!state.is_loading);
}

#[tokio::test]
async fn failed_message_fetch_resets_loading_flag() {
    let base_url = dead_base_url().await;
    let client = client_with(&base_url, RecordingBridge::new());

    let err = client
        .select_conversation(
            Conversation::from(conversation("c1", vec![user("me"), user("peer")])),
            UserId::new("me"),
        )
        .await
        .expect_err("must fail");
    assert!(matches!(err, ClientError::Transport(_)));

    let state = client.state().await;
    assert!(!state.is_loading);
    assert!(state.messages.is_empty());
    assert_eq!(
        state.active_conversation.expect("active").id,
        ConversationId::new("c1")
    );
}

#[tokio::test]
async fn send_confirms_its_own_placeholder_and_reorders_conversations() {
    let base_url = spawn_api(ApiState::default()).await;
    let client = client_with(&base_url, RecordingBridge::new());
    let active = Conversation::from(conversation("c1", vec![user("me"), user("peer")]));
    {
        let mut inner = client.inner.lock().await;
        inner.conversations = vec![
            Conversation::from(conversation("c2", vec![user("me"), user("other")])),
            active.clone(),
        ];
        inner.active_conversation = Some(active);
        // A second in-flight placeholder with identical content must not be
        // matched by the confirmation below.
        inner.messages.push(Message {
            state: MessageState::Pending {
                local_id: Uuid::new_v4(),
            },
            conversation_id: ConversationId::new("c1"),
            sender_id: UserId::new("me"),
            content: "hi".to_string(),
            timestamp: Utc::now(),
            kind: MessageKind::Text,
            is_read: false,
            is_delivered: Some(false),
        });
    }

    client
        .send_message("hi", ConversationId::new("c1"), UserId::new("me"))
        .await
        .expect("send");

    let state = client.state().await;
    assert_eq!(state.messages.len(), 2);
    let confirmed: Vec<_> = state.messages.iter().filter(|m| !m.is_pending()).collect();
    assert_eq!(confirmed.len(), 1);
    assert_eq!(
        confirmed[0].server_id(),
        Some(&MessageId::new("srv-hi"))
    );
    assert_eq!(state.conversations[0].id, ConversationId::new("c1"));
    assert_eq!(
        state.conversations[0]
            .last_message
            .as_ref()
            .expect("last message")
            .content,
        "hi"
    );
}

#[tokio::test]
async fn failed_send_keeps_the_pending_placeholder() {
    let base_url = dead_base_url().await;
    let client = client_with(&base_url, RecordingBridge::new());
    {
        let mut inner = client.inner.lock().await;
        inner.conversations = vec![
            Conversation::from(conversation("c2", vec![user("me"), user("other")])),
            Conversation::from(conversation("c1", vec![user("me"), user("peer")])),
        ];
        inner.active_conversation = Some(inner.conversations[1].clone());
    }

    let err = client
        .send_message("hi", ConversationId::new("c1"), UserId::new("me"))
        .await
        .expect_err("must fail");
    assert!(matches!(err, ClientError::Transport(_)));

    let state = client.state().await;
    assert_eq!(state.messages.len(), 1);
    assert!(state.messages[0].is_pending());
    assert_eq!(state.messages[0].content, "hi");
    // A failed send must not pretend the conversation saw activity.
    assert_eq!(state.conversations[0].id, ConversationId::new("c2"));
}

#[tokio::test]
async fn send_into_inactive_conversation_skips_the_message_list() {
    let base_url = spawn_api(ApiState::default()).await;
    let client = client_with(&base_url, RecordingBridge::new());
    {
        let mut inner = client.inner.lock().await;
        inner.conversations = vec![
            Conversation::from(conversation("c1", vec![user("me"), user("peer")])),
            Conversation::from(conversation("c2", vec![user("me"), user("other")])),
        ];
        inner.active_conversation = Some(inner.conversations[0].clone());
    }

    client
        .send_message("aside", ConversationId::new("c2"), UserId::new("me"))
        .await
        .expect("send");

    let state = client.state().await;
    assert!(state.messages.is_empty());
    assert_eq!(state.conversations[0].id, ConversationId::new("c2"));
}

#[tokio::test]
async fn create_conversation_prepends_the_new_entry() {
    let base_url = spawn_api(ApiState::default()).await;
    let client = client_with(&base_url, RecordingBridge::new());
    {
        let mut inner = client.inner.lock().await;
        inner.conversations = vec![Conversation::from(conversation(
            "c1",
            vec![user("me"), user("peer")],
        ))];
    }

    let created = client
        .create_conversation(
            vec![UserId::new("peer"), UserId::new("other")],
            UserId::new("me"),
            CreateConversationOptions {
                kind: Some(ConversationKind::Group),
                name: Some("plans".to_string()),
                ..Default::default()
            },
        )
        .await
        .expect("create");

    assert_eq!(created.kind, ConversationKind::Group);
    assert_eq!(created.name.as_deref(), Some("plans"));
    let state = client.state().await;
    assert_eq!(state.conversations.len(), 2);
    assert_eq!(state.conversations[0].id, ConversationId::new("created"));
}

#[tokio::test]
async fn reconnect_exhaustion_surfaces_as_chat_error() {
    let bridge = RecordingBridge::new();
    let client = client_with("http://127.0.0.1:9", bridge.clone());
    let _pump = client.attach_bridge_events();
    let mut rx = client.subscribe();

    bridge
        .events
        .send(BridgeEvent::ReconnectExhausted { attempts: 5 })
        .expect("bridge subscriber");

    match timeout(Duration::from_secs(1), rx.recv()).await {
        Ok(Ok(ChatEvent::Error(message))) => {
            assert!(message.contains("5 reconnect attempts"), "{message}");
        }
        other => panic!("unexpected event: {other:?}"),
    }
}
