use reqwest::{Client, RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use shared::{
    domain::{ConversationId, MessageId, UserId},
    protocol::{
        AdminConversationsData, AdminCreateUserRequest, AdminListQuery, AdminUpdateUserRequest,
        AdminUsersData, ApiEnvelope, AuthData, ConversationData, ConversationPayload,
        ConversationStats, ConversationStatsData, ConversationsData, CreateConversationRequest,
        EditMessageRequest, LoginRequest, MessageData, MessagePayload, MessagesData,
        RefreshData, RegisterRequest, SendMessageRequest, UpdateConversationRequest,
        UpdateProfileRequest, UserData, UserPayload, UserStats, UserStatsData, UsersData,
    },
};
use tokio::sync::RwLock;
use tracing::debug;

use crate::error::ClientError;

/// REST client for the chat backend. Attaches the bearer credential when one
/// is installed and unwraps the `{success, message, data, errors}` envelope,
/// so callers only ever see typed payloads or a typed [`ClientError`].
pub struct ApiClient {
    http: Client,
    base_url: String,
    token: RwLock<Option<String>>,
}

impl ApiClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self {
            http: Client::new(),
            base_url,
            token: RwLock::new(None),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub async fn set_token(&self, token: impl Into<String>) {
        *self.token.write().await = Some(token.into());
    }

    pub async fn clear_token(&self) {
        *self.token.write().await = None;
    }

    pub async fn token(&self) -> Option<String> {
        self.token.read().await.clone()
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    async fn execute<T: DeserializeOwned>(&self, builder: RequestBuilder) -> Result<T, ClientError> {
        let envelope = self.execute_raw(builder).await?;
        let data = envelope.data.ok_or_else(|| ClientError::Request {
            status: 200,
            message: "response is missing its data payload".to_string(),
            field_errors: Vec::new(),
        })?;
        serde_json::from_value(data)
            .map_err(|err| ClientError::Transport(format!("unexpected payload shape: {err}")))
    }

    async fn execute_unit(&self, builder: RequestBuilder) -> Result<(), ClientError> {
        self.execute_raw(builder).await.map(|_| ())
    }

    async fn execute_raw(
        &self,
        builder: RequestBuilder,
    ) -> Result<ApiEnvelope<serde_json::Value>, ClientError> {
        let builder = match self.token().await {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        };

        let response = builder
            .send()
            .await
            .map_err(|err| ClientError::Transport(err.to_string()))?;
        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|err| ClientError::Transport(err.to_string()))?;

        let envelope: ApiEnvelope<serde_json::Value> = serde_json::from_str(&body)
            .map_err(|err| ClientError::Transport(format!("malformed response envelope: {err}")))?;

        if status == StatusCode::UNAUTHORIZED {
            debug!(status = status.as_u16(), "api: request rejected as unauthorized");
            return Err(ClientError::Auth(envelope.message));
        }

        if !status.is_success() || !envelope.success {
            return Err(ClientError::Request {
                status: status.as_u16(),
                message: envelope.message,
                field_errors: envelope.errors.unwrap_or_default(),
            });
        }

        Ok(envelope)
    }

    // Auth

    pub async fn login(&self, request: &LoginRequest) -> Result<AuthData, ClientError> {
        self.execute(self.http.post(self.url("/auth/login")).json(request))
            .await
    }

    pub async fn register(&self, request: &RegisterRequest) -> Result<AuthData, ClientError> {
        self.execute(self.http.post(self.url("/auth/register")).json(request))
            .await
    }

    pub async fn logout(&self) -> Result<(), ClientError> {
        self.execute_unit(self.http.post(self.url("/auth/logout")))
            .await
    }

    pub async fn me(&self) -> Result<UserPayload, ClientError> {
        let data: UserData = self.execute(self.http.get(self.url("/auth/me"))).await?;
        Ok(data.user)
    }

    pub async fn refresh(&self) -> Result<String, ClientError> {
        let data: RefreshData = self
            .execute(self.http.post(self.url("/auth/refresh")))
            .await?;
        Ok(data.token)
    }

    // Users

    pub async fn list_users(&self, limit: u32) -> Result<Vec<UserPayload>, ClientError> {
        let data: UsersData = self
            .execute(self.http.get(self.url("/users")).query(&[("limit", limit)]))
            .await?;
        Ok(data.users)
    }

    pub async fn search_users(
        &self,
        query: &str,
        limit: u32,
    ) -> Result<Vec<UserPayload>, ClientError> {
        let data: UsersData = self
            .execute(
                self.http
                    .get(self.url("/users/search"))
                    .query(&[("q", query)])
                    .query(&[("limit", limit)]),
            )
            .await?;
        Ok(data.users)
    }

    pub async fn update_profile(
        &self,
        request: &UpdateProfileRequest,
    ) -> Result<UserPayload, ClientError> {
        let data: UserData = self
            .execute(self.http.put(self.url("/users/profile")).json(request))
            .await?;
        Ok(data.user)
    }

    // Conversations

    pub async fn list_conversations(&self) -> Result<Vec<ConversationPayload>, ClientError> {
        let data: ConversationsData = self
            .execute(self.http.get(self.url("/conversations")))
            .await?;
        Ok(data.conversations)
    }

    pub async fn create_conversation(
        &self,
        request: &CreateConversationRequest,
    ) -> Result<ConversationPayload, ClientError> {
        let data: ConversationData = self
            .execute(self.http.post(self.url("/conversations")).json(request))
            .await?;
        Ok(data.conversation)
    }

    pub async fn get_conversation(
        &self,
        conversation_id: &ConversationId,
    ) -> Result<ConversationPayload, ClientError> {
        let data: ConversationData = self
            .execute(
                self.http
                    .get(self.url(&format!("/conversations/{}", conversation_id.0))),
            )
            .await?;
        Ok(data.conversation)
    }

    pub async fn update_conversation(
        &self,
        conversation_id: &ConversationId,
        request: &UpdateConversationRequest,
    ) -> Result<ConversationPayload, ClientError> {
        let data: ConversationData = self
            .execute(
                self.http
                    .put(self.url(&format!("/conversations/{}", conversation_id.0)))
                    .json(request),
            )
            .await?;
        Ok(data.conversation)
    }

    pub async fn leave_conversation(
        &self,
        conversation_id: &ConversationId,
    ) -> Result<(), ClientError> {
        self.execute_unit(
            self.http
                .delete(self.url(&format!("/conversations/{}", conversation_id.0))),
        )
        .await
    }

    pub async fn add_participant(
        &self,
        conversation_id: &ConversationId,
        user_id: &UserId,
    ) -> Result<ConversationPayload, ClientError> {
        let data: ConversationData = self
            .execute(
                self.http
                    .post(self.url(&format!(
                        "/conversations/{}/participants",
                        conversation_id.0
                    )))
                    .json(&serde_json::json!({ "userId": user_id })),
            )
            .await?;
        Ok(data.conversation)
    }

    // Messages

    pub async fn list_messages(
        &self,
        conversation_id: &ConversationId,
        page: u32,
        limit: u32,
    ) -> Result<MessagesData, ClientError> {
        self.execute(
            self.http
                .get(self.url(&format!("/messages/{}", conversation_id.0)))
                .query(&[("page", page), ("limit", limit)]),
        )
        .await
    }

    pub async fn send_message(
        &self,
        request: &SendMessageRequest,
    ) -> Result<MessagePayload, ClientError> {
        let data: MessageData = self
            .execute(self.http.post(self.url("/messages")).json(request))
            .await?;
        Ok(data.message)
    }

    pub async fn edit_message(
        &self,
        message_id: &MessageId,
        content: impl Into<String>,
    ) -> Result<MessagePayload, ClientError> {
        let data: MessageData = self
            .execute(
                self.http
                    .put(self.url(&format!("/messages/{}", message_id.0)))
                    .json(&EditMessageRequest {
                        content: content.into(),
                    }),
            )
            .await?;
        Ok(data.message)
    }

    pub async fn delete_message(&self, message_id: &MessageId) -> Result<(), ClientError> {
        self.execute_unit(
            self.http
                .delete(self.url(&format!("/messages/{}", message_id.0))),
        )
        .await
    }

    pub async fn mark_read(&self, message_id: &MessageId) -> Result<(), ClientError> {
        self.execute_unit(
            self.http
                .post(self.url(&format!("/messages/{}/read", message_id.0))),
        )
        .await
    }

    // Admin

    pub async fn admin_list_users(
        &self,
        query: &AdminListQuery,
    ) -> Result<AdminUsersData, ClientError> {
        self.execute(self.http.get(self.url("/admin/users")).query(query))
            .await
    }

    pub async fn admin_create_user(
        &self,
        request: &AdminCreateUserRequest,
    ) -> Result<UserPayload, ClientError> {
        let data: UserData = self
            .execute(self.http.post(self.url("/admin/users")).json(request))
            .await?;
        Ok(data.user)
    }

    pub async fn admin_update_user(
        &self,
        user_id: &UserId,
        request: &AdminUpdateUserRequest,
    ) -> Result<UserPayload, ClientError> {
        let data: UserData = self
            .execute(
                self.http
                    .put(self.url(&format!("/admin/users/{}", user_id.0)))
                    .json(request),
            )
            .await?;
        Ok(data.user)
    }

    pub async fn admin_delete_user(&self, user_id: &UserId) -> Result<(), ClientError> {
        self.execute_unit(
            self.http
                .delete(self.url(&format!("/admin/users/{}", user_id.0))),
        )
        .await
    }

    pub async fn admin_user_stats(&self) -> Result<UserStats, ClientError> {
        let data: UserStatsData = self
            .execute(self.http.get(self.url("/admin/users/stats/overview")))
            .await?;
        Ok(data.stats)
    }

    pub async fn admin_list_conversations(
        &self,
        query: &AdminListQuery,
    ) -> Result<AdminConversationsData, ClientError> {
        self.execute(self.http.get(self.url("/admin/conversations")).query(query))
            .await
    }

    pub async fn admin_delete_conversation(
        &self,
        conversation_id: &ConversationId,
    ) -> Result<(), ClientError> {
        self.execute_unit(
            self.http
                .delete(self.url(&format!("/admin/conversations/{}", conversation_id.0))),
        )
        .await
    }

    pub async fn admin_conversation_stats(&self) -> Result<ConversationStats, ClientError> {
        let data: ConversationStatsData = self
            .execute(self.http.get(self.url("/admin/conversations/stats/overview")))
            .await?;
        Ok(data.stats)
    }
}

#[cfg(test)]
#[path = "tests/transport_tests.rs"]
mod tests;
