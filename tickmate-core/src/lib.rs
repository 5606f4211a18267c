pub mod broker;
pub mod config;
pub mod error;
pub mod instruments;
pub mod llm;
pub mod models;

pub use broker::{build_order_payload, AngelOneClient, OrderPayload, Profile};
pub use config::{AppConfig, BrokerConfig, OpenAiConfig};
pub use error::{BrokerError, CompletionError, ConfigError};
pub use instruments::{normalize_symbol, InstrumentCache};
pub use llm::{ChatMessage, CompletionClient, FunctionCall, ToolCall, ToolSpec};
