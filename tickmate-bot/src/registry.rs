//! Per-user broker connections.
//!
//! One authenticated [`AngelOneClient`] per user, created lazily on first
//! use and validated with a profile probe before reuse. A per-user login
//! mutex serializes the validate-or-create path so two concurrent
//! messages from the same user never race into a double login. A
//! background sweep drops connections the broker says are dead; network
//! blips keep the connection.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex};

use tickmate_core::broker::AngelOneClient;
use tickmate_core::config::{BrokerConfig, SessionConfig};
use tickmate_core::error::BrokerError;

#[derive(Clone)]
pub struct ConnectionRegistry {
    connections: Arc<Mutex<HashMap<u64, Arc<AngelOneClient>>>>,
    login_locks: Arc<Mutex<HashMap<u64, Arc<Mutex<()>>>>>,
    broker_config: BrokerConfig,
    session_config: SessionConfig,
}

impl ConnectionRegistry {
    pub fn new(broker_config: BrokerConfig, session_config: SessionConfig) -> Self {
        Self {
            connections: Arc::new(Mutex::new(HashMap::new())),
            login_locks: Arc::new(Mutex::new(HashMap::new())),
            broker_config,
            session_config,
        }
    }

    async fn login_lock(&self, user_id: u64) -> Arc<Mutex<()>> {
        let mut locks = self.login_locks.lock().await;
        locks
            .entry(user_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Return a verified connection for the user, logging in if none
    /// exists or the cached one no longer answers the profile probe.
    pub async fn get_or_create(&self, user_id: u64) -> Result<Arc<AngelOneClient>, BrokerError> {
        let lock = self.login_lock(user_id).await;
        let _guard = lock.lock().await;

        if let Some(client) = self.get(user_id).await {
            match client.get_profile().await {
                Ok(_) => return Ok(client),
                Err(e) if e.is_transient() => {
                    // The broker may be fine, the network is not. Reuse
                    // the cached session rather than forcing a re-login.
                    tracing::warn!(user_id, error = %e, "profile probe hit network error, keeping connection");
                    return Ok(client);
                }
                Err(e) => {
                    tracing::info!(user_id, error = %e, "cached connection invalid, re-logging in");
                    self.connections.lock().await.remove(&user_id);
                }
            }
        }

        let client = Arc::new(AngelOneClient::new(self.broker_config.clone())?);
        client.login().await?;
        self.connections
            .lock()
            .await
            .insert(user_id, client.clone());
        tracing::info!(user_id, "broker connection established");
        Ok(client)
    }

    pub async fn get(&self, user_id: u64) -> Option<Arc<AngelOneClient>> {
        self.connections.lock().await.get(&user_id).cloned()
    }

    pub async fn active_count(&self) -> usize {
        self.connections.lock().await.len()
    }

    /// Drop the user's connection with a best-effort remote logout.
    pub async fn remove(&self, user_id: u64) {
        let client = self.connections.lock().await.remove(&user_id);
        if let Some(client) = client {
            if let Err(e) = client.logout().await {
                tracing::warn!(user_id, error = %e, "logout during removal failed");
            }
            tracing::info!(user_id, "broker connection removed");
        }
    }

    /// Probe every cached connection, dropping only those the broker
    /// definitively rejects. Returns the user ids that were dropped.
    pub async fn sweep_invalid(&self) -> Vec<u64> {
        let snapshot: Vec<(u64, Arc<AngelOneClient>)> = {
            let connections = self.connections.lock().await;
            connections.iter().map(|(id, c)| (*id, c.clone())).collect()
        };

        let mut dropped = Vec::new();
        for (user_id, client) in snapshot {
            match client.get_profile().await {
                Ok(_) => {}
                Err(e) if e.is_transient() => {
                    tracing::debug!(user_id, error = %e, "sweep probe failed transiently, keeping connection");
                }
                Err(e) => {
                    tracing::info!(user_id, error = %e, "sweeping invalid broker connection");
                    self.connections.lock().await.remove(&user_id);
                    dropped.push(user_id);
                }
            }
        }
        dropped
    }

    /// Log every connection out. Used on process shutdown.
    pub async fn shutdown_all(&self) {
        let snapshot: Vec<(u64, Arc<AngelOneClient>)> = {
            let mut connections = self.connections.lock().await;
            connections.drain().collect()
        };
        for (user_id, client) in snapshot {
            if let Err(e) = client.logout().await {
                tracing::warn!(user_id, error = %e, "logout during shutdown failed");
            }
        }
    }
}

/// Background validity sweep over all cached connections.
pub async fn run_connection_sweep(
    registry: ConnectionRegistry,
    mut shutdown: broadcast::Receiver<()>,
) {
    let interval =
        tokio::time::Duration::from_secs(registry.session_config.connection_sweep_interval_secs);
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    tracing::info!(
        interval_secs = registry.session_config.connection_sweep_interval_secs,
        "connection sweep loop started"
    );

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let dropped = registry.sweep_invalid().await;
                if !dropped.is_empty() {
                    tracing::info!(count = dropped.len(), "dropped invalid broker connections");
                }
            }
            _ = shutdown.recv() => {
                tracing::info!("connection sweep loop shutting down");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tickmate_core::config::BrokerConfig;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const LOGIN_PATH: &str = "/rest/auth/angelbroking/user/v1/loginByPassword";
    const PROFILE_PATH: &str = "/rest/secure/angelbroking/user/v1/getProfile";
    const LOGOUT_PATH: &str = "/rest/secure/angelbroking/user/v1/logout";

    fn registry_for(server: &MockServer) -> ConnectionRegistry {
        let broker = BrokerConfig {
            api_key: "k".to_string(),
            client_code: "C1".to_string(),
            pin: "0000".to_string(),
            totp_secret: "JBSWY3DPEHPK3PXP".to_string(),
            base_url: server.uri(),
        };
        ConnectionRegistry::new(broker, SessionConfig::default())
    }

    async fn mount_login(server: &MockServer) {
        Mock::given(method("POST"))
            .and(path(LOGIN_PATH))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "status": true, "message": "SUCCESS", "errorcode": "",
                "data": { "jwtToken": "jwt", "refreshToken": "r", "feedToken": "f" }
            })))
            .mount(server)
            .await;
    }

    fn profile_ok() -> ResponseTemplate {
        ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "status": true, "message": "SUCCESS", "errorcode": "",
            "data": { "clientcode": "C1", "name": "Test" }
        }))
    }

    #[tokio::test]
    async fn first_use_logs_in_and_caches_the_connection() {
        let server = MockServer::start().await;
        mount_login(&server).await;
        Mock::given(method("GET"))
            .and(path(PROFILE_PATH))
            .respond_with(profile_ok())
            .mount(&server)
            .await;

        let registry = registry_for(&server);
        let first = registry.get_or_create(1).await.unwrap();
        let second = registry.get_or_create(1).await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(registry.active_count().await, 1);
    }

    #[tokio::test]
    async fn invalid_cached_connection_is_replaced() {
        let server = MockServer::start().await;
        mount_login(&server).await;

        // First probe after caching says the token expired, later probes
        // succeed for the replacement connection.
        Mock::given(method("GET"))
            .and(path(PROFILE_PATH))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "status": false, "message": "Token expired", "errorcode": "AG8001", "data": null
            })))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path(PROFILE_PATH))
            .respond_with(profile_ok())
            .mount(&server)
            .await;

        let registry = registry_for(&server);
        let first = registry.get_or_create(1).await.unwrap();
        let second = registry.get_or_create(1).await.unwrap();
        assert!(!Arc::ptr_eq(&first, &second));
        assert_eq!(registry.active_count().await, 1);
    }

    #[tokio::test]
    async fn sweep_keeps_connections_on_definitive_success() {
        let server = MockServer::start().await;
        mount_login(&server).await;
        Mock::given(method("GET"))
            .and(path(PROFILE_PATH))
            .respond_with(profile_ok())
            .mount(&server)
            .await;

        let registry = registry_for(&server);
        registry.get_or_create(1).await.unwrap();
        let dropped = registry.sweep_invalid().await;
        assert!(dropped.is_empty());
        assert_eq!(registry.active_count().await, 1);
    }

    #[tokio::test]
    async fn sweep_drops_connections_the_broker_rejects() {
        let server = MockServer::start().await;
        mount_login(&server).await;
        // Creation does not probe, so the sweep's probe is the first
        // profile call and it sees the dead-token answer.
        Mock::given(method("GET"))
            .and(path(PROFILE_PATH))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "status": false, "message": "Invalid token", "errorcode": "AB1000", "data": null
            })))
            .mount(&server)
            .await;

        let registry = registry_for(&server);
        registry.get_or_create(1).await.unwrap();
        let dropped = registry.sweep_invalid().await;
        assert_eq!(dropped, vec![1]);
        assert_eq!(registry.active_count().await, 0);
    }

    #[tokio::test]
    async fn remove_attempts_remote_logout() {
        let server = MockServer::start().await;
        mount_login(&server).await;
        Mock::given(method("GET"))
            .and(path(PROFILE_PATH))
            .respond_with(profile_ok())
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path(LOGOUT_PATH))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "status": true, "message": "SUCCESS", "errorcode": "", "data": {}
            })))
            .expect(1)
            .mount(&server)
            .await;

        let registry = registry_for(&server);
        registry.get_or_create(1).await.unwrap();
        registry.remove(1).await;
        assert_eq!(registry.active_count().await, 0);
    }
}
