//! In-memory wallet and session repositories.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::db::{DbError, SessionRepository, WalletRepository};
use crate::wallet::{Session, Wallet, WalletStatus};

/// WalletRepository backed by a HashMap.
#[derive(Clone)]
pub struct InMemoryWalletRepository {
    wallets: Arc<RwLock<HashMap<Uuid, Wallet>>>,
}

impl Default for InMemoryWalletRepository {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryWalletRepository {
    /// Creates an empty repository.
    pub fn new() -> Self {
        Self {
            wallets: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Creates a repository pre-populated with wallets.
    pub fn with_wallets(wallets: Vec<Wallet>) -> Self {
        let map: HashMap<Uuid, Wallet> = wallets.into_iter().map(|w| (w.id, w)).collect();
        Self {
            wallets: Arc::new(RwLock::new(map)),
        }
    }
}

#[async_trait]
impl WalletRepository for InMemoryWalletRepository {
    async fn create(&self, wallet: &Wallet) -> Result<Wallet, DbError> {
        let mut wallets = self.wallets.write().await;
        if wallets.contains_key(&wallet.id) {
            return Err(DbError::Constraint(format!(
                "Wallet with id '{}' already exists",
                wallet.id
            )));
        }
        wallets.insert(wallet.id, wallet.clone());
        Ok(wallet.clone())
    }

    async fn get(&self, id: Uuid) -> Result<Option<Wallet>, DbError> {
        Ok(self.wallets.read().await.get(&id).cloned())
    }

    async fn suspend_if_active(
        &self,
        id: Uuid,
        at: DateTime<Utc>,
        reason: &str,
    ) -> Result<bool, DbError> {
        let mut wallets = self.wallets.write().await;
        match wallets.get_mut(&id) {
            Some(wallet) if wallet.status == WalletStatus::Active => {
                wallet.status = WalletStatus::Suspended;
                wallet.suspended_at = Some(at);
                wallet.suspension_reason = Some(reason.to_string());
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn reactivate(&self, id: Uuid) -> Result<bool, DbError> {
        let mut wallets = self.wallets.write().await;
        match wallets.get_mut(&id) {
            Some(wallet) if wallet.status == WalletStatus::Suspended => {
                wallet.status = WalletStatus::Active;
                wallet.suspended_at = None;
                wallet.suspension_reason = None;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn suspend_all_active(&self, at: DateTime<Utc>, reason: &str) -> Result<u64, DbError> {
        let mut wallets = self.wallets.write().await;
        let mut suspended = 0;
        for wallet in wallets.values_mut().filter(|w| w.status == WalletStatus::Active) {
            wallet.status = WalletStatus::Suspended;
            wallet.suspended_at = Some(at);
            wallet.suspension_reason = Some(reason.to_string());
            suspended += 1;
        }
        Ok(suspended)
    }
}

/// SessionRepository backed by a HashMap.
#[derive(Clone)]
pub struct InMemorySessionRepository {
    sessions: Arc<RwLock<HashMap<Uuid, Session>>>,
}

impl Default for InMemorySessionRepository {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemorySessionRepository {
    /// Creates an empty repository.
    pub fn new() -> Self {
        Self {
            sessions: Arc::new(RwLock::new(HashMap::new())),
        }
    }
}

#[async_trait]
impl SessionRepository for InMemorySessionRepository {
    async fn create(&self, session: &Session) -> Result<Session, DbError> {
        let mut sessions = self.sessions.write().await;
        if sessions.contains_key(&session.id) {
            return Err(DbError::Constraint(format!(
                "Session with id '{}' already exists",
                session.id
            )));
        }
        sessions.insert(session.id, session.clone());
        Ok(session.clone())
    }

    async fn get(&self, id: Uuid) -> Result<Option<Session>, DbError> {
        Ok(self.sessions.read().await.get(&id).cloned())
    }

    async fn list_live(&self, now: DateTime<Utc>) -> Result<Vec<Session>, DbError> {
        let sessions = self.sessions.read().await;
        Ok(sessions.values().filter(|s| s.is_live(now)).cloned().collect())
    }

    async fn revoke_if_live(&self, id: Uuid, at: DateTime<Utc>) -> Result<bool, DbError> {
        let mut sessions = self.sessions.write().await;
        match sessions.get_mut(&id) {
            Some(session) if session.revoked_at.is_none() => {
                session.revoked_at = Some(at);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn revoke_all(&self, at: DateTime<Utc>) -> Result<u64, DbError> {
        let mut sessions = self.sessions.write().await;
        let mut revoked = 0;
        for session in sessions.values_mut().filter(|s| s.revoked_at.is_none()) {
            session.revoked_at = Some(at);
            revoked += 1;
        }
        Ok(revoked)
    }
}
