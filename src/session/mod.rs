//! Chat session persistence seam.
//!
//! The service's relational store owns full session CRUD; the core only
//! needs ordered message history, counters, and tenant-scoped lookup. The
//! in-memory implementation backs tests and single-process deployments.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::RwLock;
use tracing::error;

use crate::errors::{RagError, Result};
use crate::types::{Message, SessionId, TenantId};

/// Session lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Active,
    Closed,
}

/// A conversation owned by a tenant.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatSession {
    pub session_id: SessionId,
    pub tenant_id: TenantId,
    pub created_at: DateTime<Utc>,
    pub status: SessionStatus,
    pub message_count: usize,
}

/// Seam to the external session store.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Create a fresh active session for a tenant.
    async fn create_session(&self, tenant_id: TenantId) -> Result<ChatSession>;

    /// Look up a session, scoped to the owning tenant. A wrong-tenant
    /// lookup returns `None`, never another tenant's session.
    async fn get_session(
        &self,
        tenant_id: TenantId,
        session_id: SessionId,
    ) -> Result<Option<ChatSession>>;

    /// Append a message; messages persist in the order they are accepted
    /// and the session counter advances.
    async fn append_message(&self, message: Message) -> Result<()>;

    /// Full ordered history for a session.
    async fn messages(&self, tenant_id: TenantId, session_id: SessionId) -> Result<Vec<Message>>;

    /// Delete every session owned by a tenant.
    async fn purge_tenant(&self, tenant_id: TenantId) -> Result<()>;
}

/// In-memory session store.
#[derive(Default)]
pub struct MemorySessionStore {
    sessions: RwLock<HashMap<SessionId, (ChatSession, Vec<Message>)>>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn create_session(&self, tenant_id: TenantId) -> Result<ChatSession> {
        let session = ChatSession {
            session_id: SessionId::new(),
            tenant_id,
            created_at: Utc::now(),
            status: SessionStatus::Active,
            message_count: 0,
        };
        self.sessions
            .write()
            .unwrap()
            .insert(session.session_id, (session.clone(), Vec::new()));
        Ok(session)
    }

    async fn get_session(
        &self,
        tenant_id: TenantId,
        session_id: SessionId,
    ) -> Result<Option<ChatSession>> {
        let sessions = self.sessions.read().unwrap();
        Ok(sessions
            .get(&session_id)
            .filter(|(session, _)| session.tenant_id == tenant_id)
            .map(|(session, _)| session.clone()))
    }

    async fn append_message(&self, message: Message) -> Result<()> {
        let mut sessions = self.sessions.write().unwrap();
        let Some((session, messages)) = sessions.get_mut(&message.session_id) else {
            return Err(RagError::Internal(format!(
                "unknown session {}",
                message.session_id
            )));
        };

        if session.tenant_id != message.tenant_id {
            error!(
                session_tenant = %session.tenant_id,
                message_tenant = %message.tenant_id,
                "message tenant does not own the session"
            );
            return Err(RagError::TenantScope(
                "message tenant does not own the session".to_string(),
            ));
        }

        messages.push(message);
        session.message_count = messages.len();
        Ok(())
    }

    async fn messages(&self, tenant_id: TenantId, session_id: SessionId) -> Result<Vec<Message>> {
        let sessions = self.sessions.read().unwrap();
        Ok(sessions
            .get(&session_id)
            .filter(|(session, _)| session.tenant_id == tenant_id)
            .map(|(_, messages)| messages.clone())
            .unwrap_or_default())
    }

    async fn purge_tenant(&self, tenant_id: TenantId) -> Result<()> {
        self.sessions
            .write()
            .unwrap()
            .retain(|_, (session, _)| session.tenant_id != tenant_id);
        Ok(())
    }
}
