//! Per-user conversation sessions.
//!
//! Sessions are in-memory only and expire after a period of inactivity.
//! A background sweep evicts stale ones so the map stays bounded by the
//! number of recently-active users.

use chrono::{Duration as ChronoDuration, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex};

use tickmate_core::config::SessionConfig;
use tickmate_core::models::session::UserSession;

#[derive(Clone)]
pub struct SessionStore {
    sessions: Arc<Mutex<HashMap<u64, UserSession>>>,
    config: SessionConfig,
}

impl SessionStore {
    pub fn new(config: SessionConfig) -> Self {
        Self {
            sessions: Arc::new(Mutex::new(HashMap::new())),
            config,
        }
    }

    /// Fetch the user's session, creating a fresh one on first contact.
    /// Every fetch counts as activity and pushes the expiry window out.
    pub async fn get_or_create(&self, user_id: u64, chat_id: i64) -> UserSession {
        let mut sessions = self.sessions.lock().await;
        let session = sessions
            .entry(user_id)
            .or_insert_with(|| UserSession::new(user_id, chat_id));
        session.updated_at = Utc::now();
        session.clone()
    }

    /// Apply a mutation to an existing session. Missing sessions are a
    /// warn-and-skip, never an implicit create.
    pub async fn update<F>(&self, user_id: u64, mutate: F)
    where
        F: FnOnce(&mut UserSession),
    {
        let mut sessions = self.sessions.lock().await;
        match sessions.get_mut(&user_id) {
            Some(session) => {
                mutate(session);
                session.updated_at = Utc::now();
            }
            None => {
                tracing::warn!(user_id, "update for unknown session ignored");
            }
        }
    }

    pub async fn get(&self, user_id: u64) -> Option<UserSession> {
        self.sessions.lock().await.get(&user_id).cloned()
    }

    pub async fn delete(&self, user_id: u64) -> bool {
        self.sessions.lock().await.remove(&user_id).is_some()
    }

    pub async fn active_count(&self) -> usize {
        self.sessions.lock().await.len()
    }

    /// Evict sessions idle longer than the configured timeout. Returns
    /// the user ids that were dropped so callers can release connections.
    pub async fn sweep_expired(&self) -> Vec<u64> {
        let cutoff = Utc::now() - ChronoDuration::minutes(self.config.timeout_minutes as i64);
        let mut sessions = self.sessions.lock().await;
        let expired: Vec<u64> = sessions
            .iter()
            .filter(|(_, session)| session.updated_at < cutoff)
            .map(|(id, _)| *id)
            .collect();
        for id in &expired {
            sessions.remove(id);
        }
        if !expired.is_empty() {
            tracing::info!(count = expired.len(), "expired idle sessions");
        }
        expired
    }
}

/// Background eviction loop. Expired users also lose their broker
/// connection.
pub async fn run_session_sweep(
    store: SessionStore,
    registry: crate::registry::ConnectionRegistry,
    mut shutdown: broadcast::Receiver<()>,
) {
    let interval = tokio::time::Duration::from_secs(store.config.sweep_interval_secs);
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    tracing::info!(
        interval_secs = store.config.sweep_interval_secs,
        "session sweep loop started"
    );

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let expired = store.sweep_expired().await;
                for user_id in expired {
                    registry.remove(user_id).await;
                }
            }
            _ = shutdown.recv() => {
                tracing::info!("session sweep loop shutting down");
                break;
            }
        }
    }
}
