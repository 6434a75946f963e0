use std::{io::ErrorKind, path::PathBuf, sync::Arc};

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use shared::{
    domain::AccountType,
    protocol::{AuthData, LoginRequest, RegisterRequest, UserPayload},
};
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::{error::ClientError, realtime::RealtimeBridge, transport::ApiClient, types::User};

/// Credential token plus the identity snapshot cached alongside it, read at
/// startup to attempt silent session restoration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredCredentials {
    pub token: String,
    pub user: UserPayload,
    #[serde(default)]
    pub user_type: AccountType,
}

#[async_trait]
pub trait CredentialStore: Send + Sync {
    async fn load(&self) -> Result<Option<StoredCredentials>>;
    async fn save(&self, credentials: &StoredCredentials) -> Result<()>;
    async fn clear(&self) -> Result<()>;
}

/// JSON file in client-local storage. A missing file means no session.
pub struct FileCredentialStore {
    path: PathBuf,
}

impl FileCredentialStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl CredentialStore for FileCredentialStore {
    async fn load(&self) -> Result<Option<StoredCredentials>> {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(err) => {
                return Err(err).with_context(|| {
                    format!("failed to read credentials from {}", self.path.display())
                })
            }
        };
        let credentials =
            serde_json::from_slice(&bytes).context("stored credentials are not valid JSON")?;
        Ok(Some(credentials))
    }

    async fn save(&self, credentials: &StoredCredentials) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await.with_context(|| {
                format!("failed to create credential directory {}", parent.display())
            })?;
        }
        let bytes = serde_json::to_vec_pretty(credentials)?;
        tokio::fs::write(&self.path, bytes).await.with_context(|| {
            format!("failed to write credentials to {}", self.path.display())
        })?;
        Ok(())
    }

    async fn clear(&self) -> Result<()> {
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err).with_context(|| {
                format!("failed to remove credentials at {}", self.path.display())
            }),
        }
    }
}

#[derive(Default)]
pub struct MemoryCredentialStore {
    inner: Mutex<Option<StoredCredentials>>,
}

impl MemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CredentialStore for MemoryCredentialStore {
    async fn load(&self) -> Result<Option<StoredCredentials>> {
        Ok(self.inner.lock().await.clone())
    }

    async fn save(&self, credentials: &StoredCredentials) -> Result<()> {
        *self.inner.lock().await = Some(credentials.clone());
        Ok(())
    }

    async fn clear(&self) -> Result<()> {
        *self.inner.lock().await = None;
        Ok(())
    }
}

#[derive(Debug, Clone, Default)]
pub struct SessionState {
    pub user: Option<User>,
    pub account_type: Option<AccountType>,
}

/// Holds the authenticated identity and drives the realtime bridge lifecycle
/// off session transitions. Administrative identities never open a realtime
/// connection.
pub struct SessionManager {
    api: Arc<ApiClient>,
    bridge: Arc<dyn RealtimeBridge>,
    store: Arc<dyn CredentialStore>,
    inner: Mutex<SessionState>,
}

impl SessionManager {
    pub fn new(
        api: Arc<ApiClient>,
        bridge: Arc<dyn RealtimeBridge>,
        store: Arc<dyn CredentialStore>,
    ) -> Self {
        Self {
            api,
            bridge,
            store,
            inner: Mutex::new(SessionState::default()),
        }
    }

    pub async fn login(&self, identifier: &str, password: &str) -> Result<User, ClientError> {
        let auth = self
            .api
            .login(&LoginRequest {
                identifier: identifier.to_string(),
                password: password.to_string(),
            })
            .await?;
        self.establish(auth).await
    }

    pub async fn signup(
        &self,
        email: &str,
        username: &str,
        password: &str,
    ) -> Result<User, ClientError> {
        let auth = self
            .api
            .register(&RegisterRequest {
                username: username.to_string(),
                email: email.to_string(),
                password: password.to_string(),
            })
            .await?;
        self.establish(auth).await
    }

    async fn establish(&self, auth: AuthData) -> Result<User, ClientError> {
        self.api.set_token(&auth.token).await;
        let credentials = StoredCredentials {
            token: auth.token.clone(),
            user: auth.user.clone(),
            user_type: auth.user_type,
        };
        if let Err(err) = self.store.save(&credentials).await {
            // A session without persistence is still a session.
            warn!("session: failed to persist credentials: {err:#}");
        }

        let user = User::from(auth.user);
        {
            let mut guard = self.inner.lock().await;
            guard.user = Some(user.clone());
            guard.account_type = Some(auth.user_type);
        }

        self.connect_bridge(auth.user_type, &auth.token).await;
        info!(user_id = %user.id.0, "session: authenticated");
        Ok(user)
    }

    async fn connect_bridge(&self, account_type: AccountType, token: &str) {
        if account_type == AccountType::Admin {
            info!("session: administrative account, realtime connection skipped");
            return;
        }
        if let Err(err) = self.bridge.connect(token).await {
            // The REST session stands on its own; the bridge reconnects on
            // its own schedule once reachable.
            warn!("session: realtime connect failed: {err}");
        }
    }

    /// Remote logout is best-effort; local identity, token, and stored
    /// credentials are cleared unconditionally.
    pub async fn logout(&self) {
        if let Err(err) = self.api.logout().await {
            warn!("session: remote logout failed: {err}");
        }
        self.clear_local().await;
        info!("session: logged out");
    }

    async fn clear_local(&self) {
        self.bridge.disconnect().await;
        self.api.clear_token().await;
        if let Err(err) = self.store.clear().await {
            warn!("session: failed to clear stored credentials: {err:#}");
        }
        let mut guard = self.inner.lock().await;
        guard.user = None;
        guard.account_type = None;
    }

    /// Silent restore from persisted credentials. Credentials are cleared
    /// only when the backend actually rejects them; an unreachable backend
    /// keeps them for a later attempt.
    pub async fn restore_session(&self) -> Result<User, ClientError> {
        let stored = match self.store.load().await {
            Ok(Some(stored)) => stored,
            Ok(None) => return Err(ClientError::Auth("no stored session".to_string())),
            Err(err) => {
                warn!("session: failed to read stored credentials: {err:#}");
                return Err(ClientError::Auth("credential store unavailable".to_string()));
            }
        };

        self.api.set_token(&stored.token).await;
        match self.api.me().await {
            Ok(payload) => {
                let user = User::from(payload);
                {
                    let mut guard = self.inner.lock().await;
                    guard.user = Some(user.clone());
                    guard.account_type = Some(stored.user_type);
                }
                self.connect_bridge(stored.user_type, &stored.token).await;
                info!(user_id = %user.id.0, "session: restored");
                Ok(user)
            }
            Err(err) if err.is_rejection() => {
                info!("session: stored credential rejected, clearing");
                self.clear_local().await;
                Err(ClientError::Auth(format!(
                    "stored credential rejected: {err}"
                )))
            }
            Err(err) => {
                self.api.clear_token().await;
                Err(err)
            }
        }
    }

    pub async fn current_user(&self) -> Option<User> {
        self.inner.lock().await.user.clone()
    }

    pub async fn account_type(&self) -> Option<AccountType> {
        self.inner.lock().await.account_type
    }

    pub async fn is_authenticated(&self) -> bool {
        self.inner.lock().await.user.is_some()
    }
}

#[cfg(test)]
#[path = "tests/session_tests.rs"]
mod tests;
