//! Telegram dispatcher wiring.
//!
//! Two branches: slash commands and free text. Free text only reaches the
//! agent when the user has switched AI mode on, and shows a typing
//! indicator while the agent works. All shared state rides in one
//! dependency-injected [`AppContext`].

use std::collections::HashMap;
use std::sync::Arc;
use teloxide::prelude::*;
use teloxide::types::{ChatAction, ParseMode};
use teloxide::utils::command::BotCommands;
use tokio::sync::Mutex;

use tickmate_core::config::AgentConfig;
use tickmate_core::llm::CompletionClient;

use crate::agent::ConversationalAgent;
use crate::commands::{handle_command, Command};
use crate::registry::ConnectionRegistry;
use crate::state::SessionStore;

/// One agent per user, created lazily. The per-agent mutex serializes a
/// user's own turns so a confirmation cannot race its proposal.
#[derive(Clone, Default)]
pub struct AgentStore {
    agents: Arc<Mutex<HashMap<u64, Arc<Mutex<ConversationalAgent>>>>>,
}

impl AgentStore {
    pub async fn get_or_create(
        &self,
        user_id: u64,
        llm: Arc<CompletionClient>,
        config: AgentConfig,
    ) -> Arc<Mutex<ConversationalAgent>> {
        let mut agents = self.agents.lock().await;
        agents
            .entry(user_id)
            .or_insert_with(|| Arc::new(Mutex::new(ConversationalAgent::new(llm, config))))
            .clone()
    }

    /// Forget the user's transcript and any pending proposal.
    pub async fn reset(&self, user_id: u64) {
        self.agents.lock().await.remove(&user_id);
    }
}

pub struct AppContext {
    pub sessions: SessionStore,
    pub registry: ConnectionRegistry,
    pub llm: Arc<CompletionClient>,
    pub agents: AgentStore,
    pub agent_config: AgentConfig,
}

async fn handle_text(bot: Bot, msg: Message, ctx: Arc<AppContext>) -> ResponseResult<()> {
    let user_id = match msg.from() {
        Some(user) => user.id.0,
        None => return Ok(()),
    };
    let text = match msg.text() {
        Some(text) if !text.trim().is_empty() => text.to_string(),
        _ => return Ok(()),
    };
    let chat_id = msg.chat.id;

    let session = ctx.sessions.get_or_create(user_id, chat_id.0).await;

    // Broker selection and the guided order flow consume free text before
    // the agent ever sees it, AI mode or not.
    if let Some(reply) = crate::commands::advance_session_flow(&ctx, user_id, &text).await {
        bot.send_message(chat_id, reply)
            .parse_mode(ParseMode::Html)
            .await?;
        return Ok(());
    }

    if !session.ai_enabled() {
        bot.send_message(
            chat_id,
            "AI mode is off. Turn it on with /ai on, or use slash commands (/help).",
        )
        .await?;
        return Ok(());
    }

    let client = match crate::commands::ensure_connection(&ctx, user_id).await {
        Ok(client) => client,
        Err(reply) => {
            bot.send_message(chat_id, reply)
                .parse_mode(ParseMode::Html)
                .await?;
            return Ok(());
        }
    };

    bot.send_chat_action(chat_id, ChatAction::Typing).await?;

    let agent = ctx
        .agents
        .get_or_create(user_id, ctx.llm.clone(), ctx.agent_config.clone())
        .await;
    let reply = {
        let mut agent = agent.lock().await;
        agent.handle_message(&text, &client).await
    };

    bot.send_message(chat_id, reply).await?;
    Ok(())
}

/// Register the command menu and run the dispatcher until shutdown.
pub async fn run_dispatcher(bot: Bot, ctx: Arc<AppContext>) {
    if let Err(e) = bot.set_my_commands(Command::bot_commands()).await {
        tracing::warn!(error = %e, "command menu registration failed");
    }

    let handler = Update::filter_message()
        .branch(
            dptree::entry()
                .filter_command::<Command>()
                .endpoint(handle_command),
        )
        .branch(dptree::endpoint(handle_text));

    Dispatcher::builder(bot, handler)
        .dependencies(dptree::deps![ctx])
        .enable_ctrlc_handler()
        .default_handler(|_| async {})
        .build()
        .dispatch()
        .await;
}
