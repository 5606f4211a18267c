//! Slash-command surface.
//!
//! Every handler validates its arguments before any broker call, does one
//! thing against the user's connection, and answers with an HTML summary.
//! Handler errors become a reply, never a dispatcher crash.

use rust_decimal::Decimal;
use std::str::FromStr;
use std::sync::Arc;
use teloxide::prelude::*;
use teloxide::types::ParseMode;
use teloxide::utils::command::BotCommands;

use tickmate_core::broker::AngelOneClient;
use tickmate_core::models::session::SessionState;
use tickmate_core::models::trading::{
    Candle, CancelAllReport, CandleInterval, Exchange, FundsSummary, Holding, MarketDepth,
    MoverDirection, Order, OrderRequest, OrderType, Position, ProductType, Quote, TopMover,
    TransactionType,
};

use crate::transport::AppContext;

#[derive(BotCommands, Clone, Debug, PartialEq)]
#[command(rename_rule = "snake_case", description = "Supported commands:")]
pub enum Command {
    #[command(description = "start a session")]
    Start,
    #[command(description = "show this help")]
    Help,
    #[command(description = "connect your broker: /broker [NAME]")]
    Broker(String),
    #[command(description = "session and connection status")]
    Status,
    #[command(description = "available cash and margin")]
    Funds,
    #[command(description = "portfolio holdings")]
    Holdings,
    #[command(description = "open positions")]
    Positions,
    #[command(description = "today's orders")]
    Orders,
    #[command(description = "live price: /quote SYMBOL")]
    Quote(String),
    #[command(description = "order book depth: /depth SYMBOL")]
    Depth(String),
    #[command(description = "recent candles: /history SYMBOL INTERVAL")]
    History(String),
    #[command(description = "today's top gainers")]
    TopGainers,
    #[command(description = "today's top losers")]
    TopLosers,
    #[command(description = "buy: /buy SYMBOL QTY [PRICE]")]
    Buy(String),
    #[command(description = "sell: /sell SYMBOL QTY [PRICE]")]
    Sell(String),
    #[command(description = "cancel every pending order")]
    CancelAllPendingOrders,
    #[command(description = "toggle the AI assistant: /ai on|off")]
    Ai(String),
    #[command(description = "disconnect and forget the session")]
    Logout,
}

/// Parse `SYMBOL QTY [PRICE]`. A price makes the order LIMIT, otherwise
/// MARKET. All validation happens here, before any HTTP call.
pub(crate) fn parse_order_args(
    raw: &str,
    transaction_type: TransactionType,
) -> Result<OrderRequest, String> {
    let parts: Vec<&str> = raw.split_whitespace().collect();
    let (symbol, qty_raw, price_raw) = match parts.as_slice() {
        [symbol, qty] => (*symbol, *qty, None),
        [symbol, qty, price] => (*symbol, *qty, Some(*price)),
        _ => {
            return Err(format!(
                "Usage: /{} SYMBOL QTY [PRICE]",
                transaction_type.as_str().to_lowercase()
            ))
        }
    };

    let quantity: u32 = qty_raw
        .parse()
        .map_err(|_| format!("Quantity must be a whole number, got '{qty_raw}'"))?;
    if quantity == 0 {
        return Err("Quantity must be positive".to_string());
    }

    let price = match price_raw {
        None => None,
        Some(raw) => Some(
            Decimal::from_str(raw).map_err(|_| format!("Price must be a number, got '{raw}'"))?,
        ),
    };

    Ok(OrderRequest {
        symbol: symbol.to_string(),
        exchange: Exchange::Nse,
        transaction_type,
        order_type: if price.is_some() {
            OrderType::Limit
        } else {
            OrderType::Market
        },
        product_type: ProductType::Cnc,
        quantity,
        price,
        trigger_price: None,
    })
}

fn escape(text: &str) -> String {
    text.replace('&', "&amp;").replace('<', "&lt;").replace('>', "&gt;")
}

pub(crate) fn format_quote(q: &Quote) -> String {
    let arrow = if q.change >= Decimal::ZERO { "▲" } else { "▼" };
    format!(
        "<b>{}</b> ({})\nLTP: ₹{} {arrow} {} ({}%)\nO {} | H {} | L {} | C {}\nVolume: {}",
        escape(&q.symbol),
        q.exchange.as_str(),
        q.ltp,
        q.change,
        q.change_percent.round_dp(2),
        q.open,
        q.high,
        q.low,
        q.close,
        q.volume
    )
}

pub(crate) fn format_funds(f: &FundsSummary) -> String {
    format!(
        "<b>Funds</b>\nAvailable cash: ₹{}\nUtilised margin: ₹{}\nNet available: ₹{}",
        f.available_cash, f.utilised_margin, f.available_margin
    )
}

pub(crate) fn format_holdings(holdings: &[Holding]) -> String {
    if holdings.is_empty() {
        return "No holdings.".to_string();
    }
    let mut out = String::from("<b>Holdings</b>\n");
    let mut total_pnl = Decimal::ZERO;
    for h in holdings {
        total_pnl += h.pnl;
        out.push_str(&format!(
            "<code>{}</code> x {} | avg ₹{} | ltp ₹{} | P&amp;L ₹{}\n",
            escape(&h.symbol),
            h.quantity,
            h.average_price,
            h.last_price,
            h.pnl
        ));
    }
    out.push_str(&format!("\nTotal P&amp;L: ₹{total_pnl}"));
    out
}

pub(crate) fn format_positions(positions: &[Position]) -> String {
    if positions.is_empty() {
        return "No open positions.".to_string();
    }
    let mut out = String::from("<b>Positions</b>\n");
    for p in positions {
        out.push_str(&format!(
            "<code>{}</code> net {} | avg ₹{} | ltp ₹{} | P&amp;L ₹{}\n",
            escape(&p.symbol),
            p.net_quantity,
            p.average_price,
            p.last_price,
            p.pnl
        ));
    }
    out
}

pub(crate) fn format_orders(orders: &[Order]) -> String {
    if orders.is_empty() {
        return "No orders today.".to_string();
    }
    let mut out = String::from("<b>Orders</b>\n");
    for o in orders {
        let price = o
            .price
            .map(|p| format!("₹{p}"))
            .unwrap_or_else(|| "MKT".to_string());
        out.push_str(&format!(
            "<code>{}</code> {} {} x {} @ {} — {:?}\n",
            escape(&o.order_id),
            o.transaction_type.as_str(),
            escape(&o.symbol),
            o.quantity,
            price,
            o.status
        ));
    }
    out
}

pub(crate) fn format_depth(d: &MarketDepth) -> String {
    let mut out = format!(
        "<b>{}</b> ({})\nLTP ₹{} ({}%) | Vol {}\nBuy qty {} | Sell qty {}\n52w ₹{} – ₹{}\n\n<b>Bids</b>\n",
        escape(&d.symbol),
        d.exchange.as_str(),
        d.ltp,
        d.percent_change.round_dp(2),
        d.volume,
        d.total_buy_quantity,
        d.total_sell_quantity,
        d.week_52_low,
        d.week_52_high
    );
    for level in &d.bids {
        out.push_str(&format!("₹{} x {}\n", level.price, level.quantity));
    }
    out.push_str("\n<b>Asks</b>\n");
    for level in &d.asks {
        out.push_str(&format!("₹{} x {}\n", level.price, level.quantity));
    }
    out
}

pub(crate) fn format_candles(symbol: &str, interval: CandleInterval, candles: &[Candle]) -> String {
    if candles.is_empty() {
        return format!("No candle data for {}.", escape(symbol));
    }
    let mut out = format!(
        "<b>{}</b> — last {} candles ({})\n",
        escape(symbol),
        candles.len().min(10),
        interval.wire_name()
    );
    for c in candles.iter().rev().take(10).rev() {
        out.push_str(&format!(
            "<code>{}</code> O {} H {} L {} C {} V {}\n",
            escape(&c.timestamp),
            c.open,
            c.high,
            c.low,
            c.close,
            c.volume
        ));
    }
    out
}

pub(crate) fn format_movers(direction: MoverDirection, movers: &[TopMover]) -> String {
    let title = match direction {
        MoverDirection::Gainers => "Top gainers",
        MoverDirection::Losers => "Top losers",
    };
    if movers.is_empty() {
        return format!("No {} data right now.", title.to_lowercase());
    }
    let mut out = format!("<b>{title}</b>\n");
    for m in movers.iter().take(10) {
        out.push_str(&format!("<code>{}</code> {}%\n", escape(&m.symbol), m.percent_change));
    }
    out
}

pub(crate) fn format_cancel_report(report: &CancelAllReport) -> String {
    let mut out = format!(
        "Cancelled {} order(s), {} failed.",
        report.cancelled, report.failed
    );
    for failure in &report.failures {
        out.push_str(&format!(
            "\n<code>{}</code> ({}): {}",
            escape(&failure.order_id),
            escape(&failure.symbol),
            escape(&failure.reason)
        ));
    }
    out
}

/// Connected broker client for the user, establishing one if needed. The
/// success path here is the only place a session flips to AUTHENTICATED;
/// both the command branch and the free-text branch come through it.
pub(crate) async fn ensure_connection(
    ctx: &AppContext,
    user_id: u64,
) -> Result<Arc<AngelOneClient>, String> {
    match ctx.registry.get_or_create(user_id).await {
        Ok(client) => {
            ctx.sessions
                .update(user_id, |s| {
                    s.state = SessionState::Authenticated;
                    s.broker_authenticated = true;
                    s.selected_broker = Some("angelone".to_string());
                })
                .await;
            Ok(client)
        }
        Err(e) => {
            tracing::warn!(user_id, error = %e, "broker connection failed");
            Err(format!("Broker connection failed: {}", escape(&e.to_string())))
        }
    }
}

pub async fn handle_command(
    bot: Bot,
    msg: Message,
    cmd: Command,
    ctx: Arc<AppContext>,
) -> ResponseResult<()> {
    let user_id = match msg.from() {
        Some(user) => user.id.0,
        None => return Ok(()),
    };
    let chat_id = msg.chat.id;
    ctx.sessions.get_or_create(user_id, chat_id.0).await;

    let reply = dispatch(&ctx, user_id, cmd).await;
    bot.send_message(chat_id, reply)
        .parse_mode(ParseMode::Html)
        .await?;
    Ok(())
}

async fn dispatch(ctx: &AppContext, user_id: u64, cmd: Command) -> String {
    match cmd {
        Command::Start => {
            "Welcome to Tickmate 📈\n\nUse /broker to connect your AngelOne account, \
             then /help for everything I can do. Turn on free-text mode with /ai on."
                .to_string()
        }
        Command::Help => escape(&Command::descriptions().to_string()),
        Command::Broker(args) => match args.trim().to_lowercase().as_str() {
            "" => {
                ctx.sessions
                    .update(user_id, |s| s.state = SessionState::BrokerSelection)
                    .await;
                "Which broker? Currently supported: <b>angelone</b>.\nReply with the name or send /broker angelone."
                    .to_string()
            }
            "angelone" => connect_broker(ctx, user_id).await,
            other => format!("Unknown broker '{}'. Supported: angelone.", escape(other)),
        },
        Command::Status => {
            let session = ctx.sessions.get(user_id).await;
            let connected = ctx.registry.get(user_id).await.is_some();
            match session {
                Some(s) => format!(
                    "State: <code>{:?}</code>\nBroker connected: {}\nAI mode: {}",
                    s.state,
                    if connected { "yes" } else { "no" },
                    if s.ai_enabled() { "on" } else { "off" }
                ),
                None => "No active session. Send /start.".to_string(),
            }
        }
        Command::Funds => with_connection(ctx, user_id, |c| async move {
            c.get_funds().await.map(|f| format_funds(&f))
        })
        .await,
        Command::Holdings => with_connection(ctx, user_id, |c| async move {
            c.get_holdings().await.map(|h| format_holdings(&h))
        })
        .await,
        Command::Positions => with_connection(ctx, user_id, |c| async move {
            c.get_positions().await.map(|p| format_positions(&p))
        })
        .await,
        Command::Orders => with_connection(ctx, user_id, |c| async move {
            c.get_orders().await.map(|o| format_orders(&o))
        })
        .await,
        Command::Quote(args) => {
            let symbol = args.trim().to_string();
            if symbol.is_empty() {
                return "Usage: /quote SYMBOL".to_string();
            }
            with_connection(ctx, user_id, |c| async move {
                c.get_quote(&symbol, Exchange::Nse).await.map(|q| format_quote(&q))
            })
            .await
        }
        Command::Depth(args) => {
            let symbol = args.trim().to_string();
            if symbol.is_empty() {
                return "Usage: /depth SYMBOL".to_string();
            }
            with_connection(ctx, user_id, |c| async move {
                c.get_market_depth(&symbol, Exchange::Nse)
                    .await
                    .map(|d| format_depth(&d))
            })
            .await
        }
        Command::History(args) => {
            let parts: Vec<&str> = args.split_whitespace().collect();
            let (symbol, interval) = match parts.as_slice() {
                [symbol] => (symbol.to_string(), CandleInterval::OneDay),
                [symbol, raw] => match CandleInterval::parse(raw) {
                    Some(interval) => (symbol.to_string(), interval),
                    None => {
                        return format!(
                            "Unknown interval '{}'. Use one of 1m, 5m, 15m, 30m, 1h, 1d.",
                            escape(raw)
                        )
                    }
                },
                _ => return "Usage: /history SYMBOL [INTERVAL]".to_string(),
            };
            with_connection(ctx, user_id, |c| async move {
                c.get_historical_data(&symbol, interval, Exchange::Nse)
                    .await
                    .map(|candles| format_candles(&symbol, interval, &candles))
            })
            .await
        }
        Command::TopGainers => with_connection(ctx, user_id, |c| async move {
            c.get_top_movers(MoverDirection::Gainers)
                .await
                .map(|m| format_movers(MoverDirection::Gainers, &m))
        })
        .await,
        Command::TopLosers => with_connection(ctx, user_id, |c| async move {
            c.get_top_movers(MoverDirection::Losers)
                .await
                .map(|m| format_movers(MoverDirection::Losers, &m))
        })
        .await,
        Command::Buy(args) => {
            if args.trim().is_empty() {
                start_order_flow(ctx, user_id, TransactionType::Buy).await
            } else {
                place_from_command(ctx, user_id, &args, TransactionType::Buy).await
            }
        }
        Command::Sell(args) => {
            if args.trim().is_empty() {
                start_order_flow(ctx, user_id, TransactionType::Sell).await
            } else {
                place_from_command(ctx, user_id, &args, TransactionType::Sell).await
            }
        }
        Command::CancelAllPendingOrders => with_connection(ctx, user_id, |c| async move {
            c.cancel_all_pending_orders()
                .await
                .map(|r| format_cancel_report(&r))
        })
        .await,
        Command::Ai(args) => match args.trim().to_lowercase().as_str() {
            "on" => {
                ctx.sessions
                    .update(user_id, |s| {
                        s.context.insert("ai_enabled".to_string(), "true".to_string());
                    })
                    .await;
                "AI assistant is on. Just type what you want, e.g. \"price of reliance\".".to_string()
            }
            "off" => {
                ctx.sessions
                    .update(user_id, |s| {
                        s.context.insert("ai_enabled".to_string(), "false".to_string());
                    })
                    .await;
                "AI assistant is off. Slash commands still work.".to_string()
            }
            _ => "Usage: /ai on|off".to_string(),
        },
        Command::Logout => {
            ctx.registry.remove(user_id).await;
            ctx.sessions.delete(user_id).await;
            ctx.agents.reset(user_id).await;
            "Logged out. Your broker session and chat history are gone.".to_string()
        }
    }
}

async fn connect_broker(ctx: &AppContext, user_id: u64) -> String {
    match ensure_connection(ctx, user_id).await {
        Ok(client) => match client.get_profile().await {
            Ok(profile) => format!(
                "Connected to AngelOne as <b>{}</b> ({}).",
                escape(&profile.name),
                escape(&profile.client_code)
            ),
            Err(e) => format!("Connected, but profile fetch failed: {}", escape(&e.to_string())),
        },
        Err(e) => e,
    }
}

const ORDER_FLOW_KEYS: [&str; 3] = ["order_side", "order_symbol", "order_quantity"];

/// `/buy` or `/sell` without arguments enters the step-by-step flow.
async fn start_order_flow(ctx: &AppContext, user_id: u64, side: TransactionType) -> String {
    ctx.sessions
        .update(user_id, |s| {
            for key in ORDER_FLOW_KEYS {
                s.context.remove(key);
            }
            s.context
                .insert("order_side".to_string(), side.as_str().to_string());
            s.state = SessionState::WaitingSymbol;
        })
        .await;
    format!(
        "Which symbol do you want to {}? (or 'cancel' to stop)",
        side.as_str()
    )
}

async fn abort_order_flow(ctx: &AppContext, user_id: u64) -> String {
    ctx.sessions
        .update(user_id, |s| {
            for key in ORDER_FLOW_KEYS {
                s.context.remove(key);
            }
            s.state = if s.broker_authenticated {
                SessionState::Authenticated
            } else {
                SessionState::Start
            };
        })
        .await;
    "Order flow cancelled. Nothing was placed.".to_string()
}

/// Advance a session that is mid-flow (broker selection or the guided
/// order entry). Returns `None` when the session is in no such state and
/// the message should be handled normally.
pub(crate) async fn advance_session_flow(
    ctx: &AppContext,
    user_id: u64,
    text: &str,
) -> Option<String> {
    let session = ctx.sessions.get(user_id).await?;
    let input = text.trim();

    match session.state {
        SessionState::BrokerSelection => Some(match input.to_lowercase().as_str() {
            "angelone" => connect_broker(ctx, user_id).await,
            other => format!("Unknown broker '{}'. Supported: angelone.", escape(other)),
        }),
        SessionState::WaitingSymbol => {
            if input.eq_ignore_ascii_case("cancel") {
                return Some(abort_order_flow(ctx, user_id).await);
            }
            if input.is_empty() || input.split_whitespace().count() != 1 {
                return Some("One symbol please, e.g. RELIANCE. Or 'cancel' to stop.".to_string());
            }
            let symbol = input.to_ascii_uppercase();
            let prompt = format!("How many shares of {}?", escape(&symbol));
            ctx.sessions
                .update(user_id, |s| {
                    s.context.insert("order_symbol".to_string(), symbol);
                    s.state = SessionState::WaitingQuantity;
                })
                .await;
            Some(prompt)
        }
        SessionState::WaitingQuantity => {
            if input.eq_ignore_ascii_case("cancel") {
                return Some(abort_order_flow(ctx, user_id).await);
            }
            match input.parse::<u32>() {
                Ok(quantity) if quantity > 0 => {
                    ctx.sessions
                        .update(user_id, |s| {
                            s.context
                                .insert("order_quantity".to_string(), quantity.to_string());
                            s.state = SessionState::WaitingPrice;
                        })
                        .await;
                    Some("At what price? Type a number, or 'market'.".to_string())
                }
                _ => Some(
                    "Quantity must be a positive whole number. Or 'cancel' to stop.".to_string(),
                ),
            }
        }
        SessionState::WaitingPrice => {
            if input.eq_ignore_ascii_case("cancel") {
                return Some(abort_order_flow(ctx, user_id).await);
            }
            let price = if input.eq_ignore_ascii_case("market") || input.eq_ignore_ascii_case("mkt")
            {
                None
            } else {
                match Decimal::from_str(input) {
                    Ok(p) if p > Decimal::ZERO => Some(p),
                    _ => {
                        return Some(
                            "Price must be a positive number, or 'market'. Or 'cancel' to stop."
                                .to_string(),
                        )
                    }
                }
            };

            let transaction_type = TransactionType::from_wire(
                session
                    .context
                    .get("order_side")
                    .map(String::as_str)
                    .unwrap_or("BUY"),
            );
            let symbol = session.context.get("order_symbol").cloned().unwrap_or_default();
            let quantity: u32 = session
                .context
                .get("order_quantity")
                .and_then(|q| q.parse().ok())
                .unwrap_or(0);

            ctx.sessions
                .update(user_id, |s| {
                    for key in ORDER_FLOW_KEYS {
                        s.context.remove(key);
                    }
                    s.state = SessionState::Authenticated;
                })
                .await;

            if symbol.is_empty() || quantity == 0 {
                return Some(
                    "That order flow lost its context. Start again with /buy or /sell."
                        .to_string(),
                );
            }

            let request = OrderRequest {
                symbol,
                exchange: Exchange::Nse,
                transaction_type,
                order_type: if price.is_some() {
                    OrderType::Limit
                } else {
                    OrderType::Market
                },
                product_type: ProductType::Cnc,
                quantity,
                price,
                trigger_price: None,
            };
            Some(
                with_connection(ctx, user_id, |c| async move {
                    let summary = format!(
                        "{} {} x {}",
                        request.transaction_type.as_str(),
                        request.symbol.to_ascii_uppercase(),
                        request.quantity
                    );
                    c.place_order(&request).await.map(|order_id| {
                        format!("✅ {summary}\nOrder id: <code>{}</code>", escape(&order_id))
                    })
                })
                .await,
            )
        }
        SessionState::Start | SessionState::Authenticated => None,
    }
}

async fn place_from_command(
    ctx: &AppContext,
    user_id: u64,
    args: &str,
    transaction_type: TransactionType,
) -> String {
    let request = match parse_order_args(args, transaction_type) {
        Ok(request) => request,
        Err(e) => return escape(&e),
    };
    with_connection(ctx, user_id, |c| async move {
        let summary = format!(
            "{} {} x {}",
            request.transaction_type.as_str(),
            request.symbol.to_ascii_uppercase(),
            request.quantity
        );
        c.place_order(&request)
            .await
            .map(|order_id| format!("✅ {summary}\nOrder id: <code>{}</code>", escape(&order_id)))
    })
    .await
}

async fn with_connection<F, Fut>(ctx: &AppContext, user_id: u64, op: F) -> String
where
    F: FnOnce(Arc<AngelOneClient>) -> Fut,
    Fut: std::future::Future<Output = Result<String, tickmate_core::error::BrokerError>>,
{
    let client = match ensure_connection(ctx, user_id).await {
        Ok(client) => client,
        Err(e) => return e,
    };
    match op(client).await {
        Ok(reply) => reply,
        Err(e) => {
            tracing::warn!(user_id, error = %e, "command failed");
            format!("⚠️ {}", escape(&e.to_string()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn order_args_with_price_become_limit() {
        let req = parse_order_args("RELIANCE 10 2500.50", TransactionType::Buy).unwrap();
        assert_eq!(req.order_type, OrderType::Limit);
        assert_eq!(req.quantity, 10);
        assert_eq!(req.price, Some(Decimal::from_str("2500.50").unwrap()));
        assert_eq!(req.transaction_type, TransactionType::Buy);
    }

    #[test]
    fn order_args_without_price_become_market() {
        let req = parse_order_args("SBIN 5", TransactionType::Sell).unwrap();
        assert_eq!(req.order_type, OrderType::Market);
        assert_eq!(req.price, None);
    }

    #[test]
    fn bad_order_args_are_rejected_before_any_http() {
        assert!(parse_order_args("", TransactionType::Buy).is_err());
        assert!(parse_order_args("RELIANCE", TransactionType::Buy).is_err());
        assert!(parse_order_args("RELIANCE ten", TransactionType::Buy).is_err());
        assert!(parse_order_args("RELIANCE 0", TransactionType::Buy).is_err());
        assert!(parse_order_args("RELIANCE 5 cheap", TransactionType::Buy).is_err());
        assert!(parse_order_args("A B C D", TransactionType::Buy).is_err());
    }

    #[test]
    fn quote_formatting_escapes_html() {
        let quote = Quote {
            symbol: "M&M".to_string(),
            exchange: Exchange::Nse,
            ltp: Decimal::from_str("2900.10").unwrap(),
            open: Decimal::from_str("2880").unwrap(),
            high: Decimal::from_str("2910").unwrap(),
            low: Decimal::from_str("2875").unwrap(),
            close: Decimal::from_str("2890").unwrap(),
            change: Decimal::from_str("10.10").unwrap(),
            change_percent: Decimal::from_str("0.3495").unwrap(),
            volume: 12345,
            timestamp: Utc::now(),
        };
        let text = format_quote(&quote);
        assert!(text.contains("M&amp;M"));
        assert!(text.contains("2900.10"));
        assert!(text.contains("0.35"));
    }

    #[test]
    fn empty_collections_have_friendly_replies() {
        assert_eq!(format_holdings(&[]), "No holdings.");
        assert_eq!(format_positions(&[]), "No open positions.");
        assert_eq!(format_orders(&[]), "No orders today.");
    }

    #[test]
    fn cancel_report_lists_failures() {
        let report = CancelAllReport {
            cancelled: 2,
            failed: 1,
            failures: vec![tickmate_core::models::trading::CancelFailure {
                order_id: "42".to_string(),
                symbol: "ITC-EQ".to_string(),
                reason: "already executed".to_string(),
            }],
        };
        let text = format_cancel_report(&report);
        assert!(text.contains("Cancelled 2"));
        assert!(text.contains("1 failed"));
        assert!(text.contains("ITC-EQ"));
    }

    #[test]
    fn command_parser_accepts_the_advertised_surface() {
        let cmd = Command::parse("/buy RELIANCE 10 2500", "tickmate_bot").unwrap();
        assert_eq!(cmd, Command::Buy("RELIANCE 10 2500".to_string()));
        let cmd = Command::parse("/top_gainers", "tickmate_bot").unwrap();
        assert_eq!(cmd, Command::TopGainers);
        let cmd = Command::parse("/ai on", "tickmate_bot").unwrap();
        assert_eq!(cmd, Command::Ai("on".to_string()));
        let cmd = Command::parse("/broker", "tickmate_bot").unwrap();
        assert_eq!(cmd, Command::Broker(String::new()));
    }

    use crate::registry::ConnectionRegistry;
    use crate::state::SessionStore;
    use crate::transport::AgentStore;
    use tickmate_core::config::{
        AgentConfig, BrokerConfig, OpenAiConfig, SessionConfig,
    };
    use tickmate_core::llm::CompletionClient;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const LOGIN_PATH: &str = "/rest/auth/angelbroking/user/v1/loginByPassword";
    const PROFILE_PATH: &str = "/rest/secure/angelbroking/user/v1/getProfile";
    const PLACE_ORDER_PATH: &str = "/rest/secure/angelbroking/order/v1/placeOrder";

    fn test_ctx(server: &MockServer) -> AppContext {
        let broker = BrokerConfig {
            api_key: "k".to_string(),
            client_code: "C1".to_string(),
            pin: "0000".to_string(),
            totp_secret: "JBSWY3DPEHPK3PXP".to_string(),
            base_url: server.uri(),
        };
        let openai = OpenAiConfig {
            api_key: "k".to_string(),
            model: "gpt-4o-mini".to_string(),
            base_url: "http://127.0.0.1:9".to_string(),
            temperature: 0.1,
        };
        AppContext {
            sessions: SessionStore::new(SessionConfig::default()),
            registry: ConnectionRegistry::new(broker, SessionConfig::default()),
            llm: Arc::new(CompletionClient::new(openai).unwrap()),
            agents: AgentStore::default(),
            agent_config: AgentConfig::default(),
        }
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

    #[tokio::test]
    async fn establishing_a_connection_authenticates_the_session() {
        let server = MockServer::start().await;
        mount_login(&server).await;
        let ctx = test_ctx(&server);
        ctx.sessions.get_or_create(1, 10).await;

        ensure_connection(&ctx, 1).await.unwrap();

        let session = ctx.sessions.get(1).await.unwrap();
        assert_eq!(session.state, SessionState::Authenticated);
        assert!(session.broker_authenticated);
        assert_eq!(session.selected_broker.as_deref(), Some("angelone"));
    }

    #[tokio::test]
    async fn broker_command_walks_the_selection_state() {
        let server = MockServer::start().await;
        mount_login(&server).await;
        Mock::given(method("GET"))
            .and(path(PROFILE_PATH))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "status": true, "message": "SUCCESS", "errorcode": "",
                "data": { "clientcode": "C1", "name": "Test" }
            })))
            .mount(&server)
            .await;

        let ctx = test_ctx(&server);
        ctx.sessions.get_or_create(1, 10).await;

        let reply = dispatch(&ctx, 1, Command::Broker(String::new())).await;
        assert!(reply.contains("angelone"));
        let session = ctx.sessions.get(1).await.unwrap();
        assert_eq!(session.state, SessionState::BrokerSelection);

        let reply = advance_session_flow(&ctx, 1, "angelone").await.unwrap();
        assert!(reply.contains("Connected to AngelOne"));
        let session = ctx.sessions.get(1).await.unwrap();
        assert_eq!(session.state, SessionState::Authenticated);
        assert!(session.broker_authenticated);

        // Once authenticated, free text is no longer a flow step.
        assert!(advance_session_flow(&ctx, 1, "hello").await.is_none());
    }

    #[tokio::test]
    async fn bare_buy_walks_the_guided_order_flow() {
        let server = MockServer::start().await;
        mount_login(&server).await;
        Mock::given(method("POST"))
            .and(path(PLACE_ORDER_PATH))
            .and(body_partial_json(serde_json::json!({
                "tradingsymbol": "SBIN-EQ",
                "transactiontype": "BUY",
                "ordertype": "LIMIT",
                "quantity": "3",
                "price": "800.50"
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "status": true, "message": "SUCCESS", "errorcode": "",
                "data": { "orderid": "240101000000042" }
            })))
            .expect(1)
            .mount(&server)
            .await;

        let ctx = test_ctx(&server);
        ctx.sessions.get_or_create(1, 10).await;

        dispatch(&ctx, 1, Command::Buy(String::new())).await;
        let session = ctx.sessions.get(1).await.unwrap();
        assert_eq!(session.state, SessionState::WaitingSymbol);

        let reply = advance_session_flow(&ctx, 1, "sbin").await.unwrap();
        assert!(reply.contains("SBIN"));
        let session = ctx.sessions.get(1).await.unwrap();
        assert_eq!(session.state, SessionState::WaitingQuantity);

        // A bad quantity re-asks without leaving the state.
        advance_session_flow(&ctx, 1, "three").await.unwrap();
        let session = ctx.sessions.get(1).await.unwrap();
        assert_eq!(session.state, SessionState::WaitingQuantity);

        advance_session_flow(&ctx, 1, "3").await.unwrap();
        let session = ctx.sessions.get(1).await.unwrap();
        assert_eq!(session.state, SessionState::WaitingPrice);

        let reply = advance_session_flow(&ctx, 1, "800.50").await.unwrap();
        assert!(reply.contains("240101000000042"));

        let session = ctx.sessions.get(1).await.unwrap();
        assert_eq!(session.state, SessionState::Authenticated);
        assert!(!session.context.contains_key("order_symbol"));
        assert!(!session.context.contains_key("order_quantity"));
        assert!(!session.context.contains_key("order_side"));
    }

    #[tokio::test]
    async fn cancelling_mid_flow_returns_to_start() {
        let server = MockServer::start().await;
        let ctx = test_ctx(&server);
        ctx.sessions.get_or_create(1, 10).await;

        dispatch(&ctx, 1, Command::Sell(String::new())).await;
        advance_session_flow(&ctx, 1, "itc").await.unwrap();
        let reply = advance_session_flow(&ctx, 1, "cancel").await.unwrap();
        assert!(reply.contains("cancelled"));

        // Never authenticated, so the abort falls back to the start state.
        let session = ctx.sessions.get(1).await.unwrap();
        assert_eq!(session.state, SessionState::Start);
        assert!(session.context.is_empty());
    }
}
