use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::{RwLock, broadcast};
use tracing::info;
use ulid::Ulid;

use crate::engine::now_ms;
use crate::limits::MAX_EMAIL_LEN;
use crate::model::{Ms, Principal, ProfileUpsert, Role};
use crate::store::{StoreError, UserStore};

const CHANGE_CAPACITY: usize = 64;

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("not signed in")]
    NotSignedIn,
    #[error("invalid identity: {0}")]
    InvalidIdentity(String),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("session file: {0}")]
    Io(#[from] std::io::Error),
    #[error("session file: {0}")]
    Format(#[from] serde_json::Error),
}

/// Who is signing in, as asserted by the identity provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub email: String,
    pub full_name: Option<String>,
    pub avatar_url: Option<String>,
}

impl Identity {
    pub fn email(email: impl Into<String>) -> Self {
        Self {
            email: email.into(),
            full_name: None,
            avatar_url: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionChange {
    SignedIn { user_id: Ulid },
    SignedOut { user_id: Ulid },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SessionRecord {
    token: String,
    user_id: Ulid,
    provider_token: Option<String>,
    created_at: Ms,
}

/// Session tokens persisted as JSON so sign-ins survive a restart.
pub struct SessionManager {
    path: PathBuf,
    users: Arc<dyn UserStore>,
    admin_emails: Vec<String>,
    sessions: RwLock<HashMap<String, SessionRecord>>,
    changes: broadcast::Sender<SessionChange>,
}

impl SessionManager {
    /// Load persisted sessions, dropping those whose user no longer exists.
    pub async fn open(
        path: PathBuf,
        users: Arc<dyn UserStore>,
        admin_emails: Vec<String>,
    ) -> Result<Self, SessionError> {
        let records: Vec<SessionRecord> = match tokio::fs::read(&path).await {
            Ok(bytes) if bytes.is_empty() => Vec::new(),
            Ok(bytes) => serde_json::from_slice(&bytes)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(e.into()),
        };

        let total = records.len();
        let mut sessions = HashMap::with_capacity(total);
        for record in records {
            if users.get_by_id(record.user_id).await?.is_some() {
                sessions.insert(record.token.clone(), record);
            }
        }

        let manager = Self {
            path,
            users,
            admin_emails: admin_emails.into_iter().map(|e| e.to_ascii_lowercase()).collect(),
            sessions: RwLock::new(sessions),
            changes: broadcast::channel(CHANGE_CAPACITY).0,
        };
        let kept = manager.sessions.read().await.len();
        if kept != total {
            let sessions = manager.sessions.read().await;
            manager.persist(&sessions).await?;
        }
        info!(sessions = kept, dropped = total - kept, "sessions loaded");
        Ok(manager)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionChange> {
        self.changes.subscribe()
    }

    /// Upsert the profile and issue a fresh session token. A user signed in
    /// on several connections holds one session per connection.
    pub async fn sign_in(&self, identity: Identity) -> Result<(String, Principal), SessionError> {
        let email = identity.email.trim().to_string();
        if email.is_empty() || !email.contains('@') || email.len() > MAX_EMAIL_LEN {
            return Err(SessionError::InvalidIdentity(identity.email));
        }
        let initial_role = if self.admin_emails.contains(&email.to_ascii_lowercase()) {
            Role::Admin
        } else {
            Role::User
        };
        let now = now_ms();
        let user = self
            .users
            .upsert(
                ProfileUpsert {
                    email,
                    full_name: identity.full_name,
                    avatar_url: identity.avatar_url,
                    initial_role,
                },
                now,
            )
            .await?;

        let mut sessions = self.sessions.write().await;
        let token = Ulid::new().to_string();
        sessions.insert(
            token.clone(),
            SessionRecord {
                token: token.clone(),
                user_id: user.id,
                provider_token: None,
                created_at: now,
            },
        );
        self.persist(&sessions).await?;
        drop(sessions);

        info!(user_id = %user.id, role = user.role.as_str(), "signed in");
        let _ = self.changes.send(SessionChange::SignedIn { user_id: user.id });
        Ok((
            token,
            Principal {
                id: user.id,
                email: user.email,
                role: user.role,
                provider_token: None,
            },
        ))
    }

    /// The principal behind `token`. The role is read fresh on every call.
    pub async fn current(&self, token: &str) -> Result<Principal, SessionError> {
        let record = self
            .sessions
            .read()
            .await
            .get(token)
            .cloned()
            .ok_or(SessionError::NotSignedIn)?;
        let user = self
            .users
            .get_by_id(record.user_id)
            .await?
            .ok_or(SessionError::NotSignedIn)?;
        Ok(Principal {
            id: user.id,
            email: user.email,
            role: user.role,
            provider_token: record.provider_token,
        })
    }

    pub async fn set_provider_token(&self, token: &str, value: Option<String>) -> Result<(), SessionError> {
        let mut sessions = self.sessions.write().await;
        let record = sessions.get_mut(token).ok_or(SessionError::NotSignedIn)?;
        record.provider_token = value.filter(|v| !v.is_empty());
        self.persist(&sessions).await
    }

    /// Forget the token in memory and on disk. Unknown tokens are a no-op.
    pub async fn sign_out(&self, token: &str) -> Result<(), SessionError> {
        let mut sessions = self.sessions.write().await;
        let Some(record) = sessions.remove(token) else {
            return Ok(());
        };
        self.persist(&sessions).await?;
        drop(sessions);

        info!(user_id = %record.user_id, "signed out");
        let _ = self.changes.send(SessionChange::SignedOut {
            user_id: record.user_id,
        });
        Ok(())
    }

    pub async fn active_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Write to a temp file, then rename over the old one.
    async fn persist(&self, sessions: &HashMap<String, SessionRecord>) -> Result<(), SessionError> {
        let mut records: Vec<&SessionRecord> = sessions.values().collect();
        records.sort_by(|a, b| a.token.cmp(&b.token));
        let bytes = serde_json::to_vec_pretty(&records)?;
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, bytes).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}
