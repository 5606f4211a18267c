pub mod agent;
pub mod commands;
pub mod registry;
pub mod state;
pub mod tools;
pub mod transport;

pub use registry::ConnectionRegistry;
pub use state::SessionStore;
pub use transport::{AgentStore, AppContext};
