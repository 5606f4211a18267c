use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Conversation state for one user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionState {
    Start,
    BrokerSelection,
    Authenticated,
    WaitingSymbol,
    WaitingQuantity,
    WaitingPrice,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserSession {
    pub user_id: u64,
    pub chat_id: i64,
    pub state: SessionState,
    pub selected_broker: Option<String>,
    pub broker_authenticated: bool,
    pub context: HashMap<String, String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl UserSession {
    pub fn new(user_id: u64, chat_id: i64) -> Self {
        let now = Utc::now();
        Self {
            user_id,
            chat_id,
            state: SessionState::Start,
            selected_broker: None,
            broker_authenticated: false,
            context: HashMap::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// AI mode is a per-session toggle kept in the free-form context.
    pub fn ai_enabled(&self) -> bool {
        self.context.get("ai_enabled").map(|v| v == "true").unwrap_or(false)
    }
}
