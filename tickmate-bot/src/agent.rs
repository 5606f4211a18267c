//! Conversational trading agent.
//!
//! Each user gets one agent holding the chat transcript and at most one
//! pending trade awaiting confirmation. Plain greetings short-circuit to
//! a canned reply without spending a completion call. Trade tool calls
//! from the model are never executed directly: the proposal is parked
//! and the user must answer CONFIRM or CANCEL within the TTL.

use regex::Regex;
use std::sync::Arc;
use std::sync::OnceLock;
use std::time::{Duration, Instant};

use tickmate_core::broker::AngelOneClient;
use tickmate_core::config::AgentConfig;
use tickmate_core::llm::{ChatMessage, CompletionClient, ToolCall, ROLE_SYSTEM, ROLE_TOOL};

use crate::tools::{tool_specs, ToolInvocation};

const SYSTEM_PROMPT: &str = "You are a trading assistant for an AngelOne brokerage account. \
You can look up quotes, holdings, positions, orders, funds, market depth, candles and top movers, \
and you can propose buy/sell orders which the user must confirm before they execute. \
Keep replies short and factual. Prices are in INR. \
Never invent market data: always use the tools.";

const GREETING_REPLY: &str =
    "Hello! I'm your trading assistant. Ask me about quotes, your portfolio, \
or tell me to buy or sell something.";

fn greeting_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)^\s*(hi|hii+|hello|hey|heyy+|yo|good\s*(morning|afternoon|evening)|namaste)\s*[!.?]*\s*$")
            .unwrap_or_else(|e| panic!("greeting regex: {e}"))
    })
}

const TRADING_KEYWORDS: &[&str] = &[
    "buy", "sell", "order", "price", "quote", "holding", "position", "fund", "margin", "cancel",
    "stock", "share", "ltp", "portfolio",
];

/// A bare greeting with no trading content. "hey, buy reliance" is not
/// a greeting.
pub(crate) fn is_greeting(text: &str) -> bool {
    let lowered = text.to_lowercase();
    if TRADING_KEYWORDS.iter().any(|kw| lowered.contains(kw)) {
        return false;
    }
    greeting_regex().is_match(text)
}

const CONTEXT_KEYWORDS: &[&str] = &[
    "it", "that", "them", "those", "previous", "again", "same", "more", "also", "what about",
    "how about", "and", "instead",
];

/// Standalone lookups don't need transcript context; follow-ups do.
/// Short conversations always carry their history.
pub(crate) fn should_include_history(text: &str, history_len: usize) -> bool {
    if history_len <= 4 {
        return true;
    }
    let lowered = text.to_lowercase();
    CONTEXT_KEYWORDS.iter().any(|kw| {
        lowered
            .split_whitespace()
            .any(|word| word.trim_matches(|c: char| !c.is_alphanumeric()) == *kw)
    }) || lowered.contains("what about")
        || lowered.contains("how about")
}

fn is_confirmation(text: &str) -> bool {
    matches!(text.trim().to_lowercase().as_str(), "confirm" | "yes" | "y")
}

fn is_rejection(text: &str) -> bool {
    matches!(text.trim().to_lowercase().as_str(), "cancel" | "no" | "n")
}

struct PendingTrade {
    invocation: ToolInvocation,
    proposed_at: Instant,
}

pub struct ConversationalAgent {
    llm: Arc<CompletionClient>,
    config: AgentConfig,
    history: Vec<ChatMessage>,
    pending: Option<PendingTrade>,
}

impl ConversationalAgent {
    pub fn new(llm: Arc<CompletionClient>, config: AgentConfig) -> Self {
        Self {
            llm,
            config,
            history: vec![ChatMessage::system(SYSTEM_PROMPT)],
            pending: None,
        }
    }

    fn confirmation_ttl(&self) -> Duration {
        Duration::from_secs(self.config.confirmation_ttl_secs)
    }

    /// Drop the pending trade if the user took too long to answer.
    fn expire_stale_pending(&mut self) -> bool {
        match &self.pending {
            Some(pending) if pending.proposed_at.elapsed() > self.confirmation_ttl() => {
                self.pending = None;
                true
            }
            _ => false,
        }
    }

    /// Cap the transcript, always keeping the system prompt. Eviction
    /// works in turn units: an assistant message carrying tool calls
    /// leaves with its tool results, since a transcript starting with an
    /// orphan tool message is rejected by the completion API.
    fn trim_history(&mut self) {
        let max = self.config.max_history_messages;
        while self.history.len() > max {
            let index = match self.history.iter().position(|m| m.role != ROLE_SYSTEM) {
                Some(index) => index,
                None => break,
            };
            let had_tool_calls = !self.history[index].tool_calls.is_empty();
            self.history.remove(index);
            if had_tool_calls {
                while self
                    .history
                    .get(index)
                    .map(|m| m.role == ROLE_TOOL)
                    .unwrap_or(false)
                {
                    self.history.remove(index);
                }
            }
        }
    }

    fn messages_for(&self, text: &str) -> Vec<ChatMessage> {
        if should_include_history(text, self.history.len()) {
            let mut messages = self.history.clone();
            messages.push(ChatMessage::user(text));
            messages
        } else {
            vec![ChatMessage::system(SYSTEM_PROMPT), ChatMessage::user(text)]
        }
    }

    /// Process one user message, returning the reply to send back.
    pub async fn handle_message(&mut self, text: &str, client: &AngelOneClient) -> String {
        if self.expire_stale_pending() {
            if is_confirmation(text) || is_rejection(text) {
                return "That trade proposal expired. Please state the order again.".to_string();
            }
        }

        if self.pending.is_some() {
            if is_confirmation(text) {
                let pending = match self.pending.take() {
                    Some(p) => p,
                    None => return "Nothing to confirm.".to_string(),
                };
                return self.execute_confirmed(pending.invocation, client).await;
            }
            if is_rejection(text) {
                self.pending = None;
                self.history
                    .push(ChatMessage::assistant("Order cancelled."));
                return "Order cancelled. Nothing was placed.".to_string();
            }
            // Any other message leaves the proposal parked. A newer
            // trade proposal from the model will overwrite it below.
        }

        if is_greeting(text) {
            return GREETING_REPLY.to_string();
        }

        let messages = self.messages_for(text);
        let specs = tool_specs();
        let reply = match self.llm.chat(&messages, Some(specs.as_slice())).await {
            Ok(reply) => reply,
            Err(e) => {
                tracing::error!(error = %e, "completion failed");
                return "Sorry, I couldn't process that right now. Please try again.".to_string();
            }
        };

        self.history.push(ChatMessage::user(text));

        let response = if reply.tool_calls.is_empty() {
            let content = reply
                .content
                .clone()
                .unwrap_or_else(|| "I'm not sure how to help with that.".to_string());
            self.history.push(ChatMessage::assistant(content.clone()));
            content
        } else {
            self.handle_tool_calls(reply, client).await
        };

        self.trim_history();
        response
    }

    /// A trade proposal in the batch wins and parks for confirmation;
    /// otherwise every read-only call runs and the results go back for a
    /// final natural-language turn.
    async fn handle_tool_calls(
        &mut self,
        reply: ChatMessage,
        client: &AngelOneClient,
    ) -> String {
        for call in &reply.tool_calls {
            match ToolInvocation::parse(&call.function.name, &call.function.arguments) {
                Ok(invocation) if invocation.requires_confirmation() => {
                    let description = invocation.describe();
                    self.pending = Some(PendingTrade {
                        invocation,
                        proposed_at: Instant::now(),
                    });
                    let prompt = format!(
                        "About to place: {description}\n\nReply CONFIRM to place the order or CANCEL to abort."
                    );
                    self.history.push(ChatMessage::assistant(prompt.clone()));
                    return prompt;
                }
                _ => {}
            }
        }

        let tool_messages = self.execute_read_only(&reply.tool_calls, client).await;
        let mut messages = self.history.clone();
        messages.push(reply.clone());
        messages.extend(tool_messages.iter().cloned());

        self.history.push(reply);
        self.history.extend(tool_messages);

        match self.llm.chat(&messages, None).await {
            Ok(final_reply) => {
                let content = final_reply
                    .content
                    .unwrap_or_else(|| "Done.".to_string());
                self.history.push(ChatMessage::assistant(content.clone()));
                content
            }
            Err(e) => {
                tracing::error!(error = %e, "summary completion failed");
                "I fetched the data but couldn't summarise it. Please try again.".to_string()
            }
        }
    }

    async fn execute_read_only(
        &self,
        calls: &[ToolCall],
        client: &AngelOneClient,
    ) -> Vec<ChatMessage> {
        let mut results = Vec::with_capacity(calls.len());
        for call in calls {
            let outcome = match ToolInvocation::parse(&call.function.name, &call.function.arguments)
            {
                Ok(invocation) => match invocation.execute(client).await {
                    Ok(value) => value.to_string(),
                    Err(e) => {
                        tracing::warn!(tool = %call.function.name, error = %e, "tool execution failed");
                        serde_json::json!({ "error": e.to_string() }).to_string()
                    }
                },
                Err(e) => serde_json::json!({ "error": e.to_string() }).to_string(),
            };
            results.push(ChatMessage::tool_result(call.id.clone(), outcome));
        }
        results
    }

    async fn execute_confirmed(
        &mut self,
        invocation: ToolInvocation,
        client: &AngelOneClient,
    ) -> String {
        let description = invocation.describe();
        match invocation.execute(client).await {
            Ok(value) => {
                let order_id = value
                    .get("order_id")
                    .and_then(|v| v.as_str())
                    .unwrap_or("unknown");
                let reply = format!("Order placed: {description}\nOrder id: {order_id}");
                self.history.push(ChatMessage::assistant(reply.clone()));
                reply
            }
            Err(e) => {
                tracing::warn!(error = %e, "confirmed order failed");
                let reply = format!("Order failed: {e}");
                self.history.push(ChatMessage::assistant(reply.clone()));
                reply
            }
        }
    }

    #[cfg(test)]
    fn force_pending_age(&mut self, age: Duration) {
        if let Some(pending) = &mut self.pending {
            pending.proposed_at = Instant::now() - age;
        }
    }
}
