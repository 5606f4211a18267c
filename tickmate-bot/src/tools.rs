//! Typed dispatch for the model's function calls.
//!
//! The completion API hands back a tool name and a JSON argument string;
//! both are parsed into a [`ToolInvocation`] up front so execution works
//! on typed values and an unknown or malformed call fails before any
//! broker traffic. Trade placements are flagged here so the agent can
//! route them through the confirmation flow instead of executing.

use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::{json, Value};
use thiserror::Error;

use tickmate_core::broker::AngelOneClient;
use tickmate_core::error::BrokerError;
use tickmate_core::llm::ToolSpec;
use tickmate_core::models::trading::{
    CandleInterval, Exchange, MoverDirection, OrderRequest, OrderType, ProductType,
    TransactionType,
};

#[derive(Error, Debug)]
pub enum ToolError {
    #[error("unknown tool: {0}")]
    UnknownTool(String),

    #[error("bad arguments for {tool}: {reason}")]
    BadArguments { tool: String, reason: String },

    #[error(transparent)]
    Broker(#[from] BrokerError),
}

#[derive(Debug, Deserialize)]
struct SymbolArgs {
    symbol: String,
    #[serde(default)]
    exchange: Option<String>,
}

#[derive(Debug, Deserialize)]
struct HistoryArgs {
    symbol: String,
    #[serde(default)]
    exchange: Option<String>,
    #[serde(default)]
    interval: Option<String>,
}

#[derive(Debug, Deserialize)]
struct MoversArgs {
    #[serde(default)]
    direction: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TradeArgs {
    symbol: String,
    quantity: u32,
    #[serde(default)]
    exchange: Option<String>,
    #[serde(default)]
    order_type: Option<String>,
    #[serde(default)]
    product_type: Option<String>,
    #[serde(default)]
    price: Option<Decimal>,
    #[serde(default)]
    trigger_price: Option<Decimal>,
}

#[derive(Debug, Deserialize)]
struct CancelArgs {
    order_id: String,
}

/// One fully-parsed tool call, ready to execute.
#[derive(Debug, Clone)]
pub enum ToolInvocation {
    GetProfile,
    GetFunds,
    GetQuote { symbol: String, exchange: Exchange },
    GetHoldings,
    GetPositions,
    GetOrders,
    GetMarketDepth { symbol: String, exchange: Exchange },
    GetHistoricalData {
        symbol: String,
        exchange: Exchange,
        interval: CandleInterval,
    },
    GetTopMovers { direction: MoverDirection },
    PlaceOrder(OrderRequest),
    CancelOrder { order_id: String },
    CancelAllPendingOrders,
}

fn args<T: serde::de::DeserializeOwned>(tool: &str, raw: &str) -> Result<T, ToolError> {
    // Some models send "" instead of "{}" for argument-free calls.
    let raw = if raw.trim().is_empty() { "{}" } else { raw };
    serde_json::from_str(raw).map_err(|e| ToolError::BadArguments {
        tool: tool.to_string(),
        reason: e.to_string(),
    })
}

fn parse_exchange(tool: &str, exchange: Option<String>) -> Result<Exchange, ToolError> {
    match exchange {
        None => Ok(Exchange::Nse),
        Some(raw) => Exchange::parse(&raw).ok_or_else(|| ToolError::BadArguments {
            tool: tool.to_string(),
            reason: format!("unknown exchange {raw}"),
        }),
    }
}

fn parse_trade(
    tool: &str,
    raw: &str,
    transaction_type: TransactionType,
) -> Result<OrderRequest, ToolError> {
    let trade: TradeArgs = args(tool, raw)?;
    if trade.quantity == 0 {
        return Err(ToolError::BadArguments {
            tool: tool.to_string(),
            reason: "quantity must be positive".to_string(),
        });
    }

    let order_type = match trade.order_type.as_deref() {
        None => {
            if trade.price.is_some() {
                OrderType::Limit
            } else {
                OrderType::Market
            }
        }
        Some(raw) => OrderType::from_wire(raw),
    };
    if order_type == OrderType::Limit && trade.price.is_none() {
        return Err(ToolError::BadArguments {
            tool: tool.to_string(),
            reason: "LIMIT orders need a price".to_string(),
        });
    }

    Ok(OrderRequest {
        symbol: trade.symbol,
        exchange: parse_exchange(tool, trade.exchange)?,
        transaction_type,
        order_type,
        product_type: trade
            .product_type
            .as_deref()
            .map(ProductType::from_wire)
            .unwrap_or(ProductType::Cnc),
        quantity: trade.quantity,
        price: trade.price,
        trigger_price: trade.trigger_price,
    })
}

impl ToolInvocation {
    /// Parse a raw function call from the model.
    pub fn parse(name: &str, arguments: &str) -> Result<Self, ToolError> {
        match name {
            "get_profile" => Ok(Self::GetProfile),
            "get_funds" => Ok(Self::GetFunds),
            "get_holdings" => Ok(Self::GetHoldings),
            "get_positions" => Ok(Self::GetPositions),
            "get_orders" => Ok(Self::GetOrders),
            "cancel_all_pending_orders" => Ok(Self::CancelAllPendingOrders),
            "get_quote" => {
                let a: SymbolArgs = args(name, arguments)?;
                Ok(Self::GetQuote {
                    symbol: a.symbol,
                    exchange: parse_exchange(name, a.exchange)?,
                })
            }
            "get_market_depth" => {
                let a: SymbolArgs = args(name, arguments)?;
                Ok(Self::GetMarketDepth {
                    symbol: a.symbol,
                    exchange: parse_exchange(name, a.exchange)?,
                })
            }
            "get_historical_data" => {
                let a: HistoryArgs = args(name, arguments)?;
                let interval = match a.interval.as_deref() {
                    None => CandleInterval::OneDay,
                    Some(raw) => {
                        CandleInterval::parse(raw).ok_or_else(|| ToolError::BadArguments {
                            tool: name.to_string(),
                            reason: format!("unknown interval {raw}"),
                        })?
                    }
                };
                Ok(Self::GetHistoricalData {
                    symbol: a.symbol,
                    exchange: parse_exchange(name, a.exchange)?,
                    interval,
                })
            }
            "get_top_movers" => {
                let a: MoversArgs = args(name, arguments)?;
                let direction = match a.direction.as_deref() {
                    Some("losers") => MoverDirection::Losers,
                    _ => MoverDirection::Gainers,
                };
                Ok(Self::GetTopMovers { direction })
            }
            "place_buy_order" => Ok(Self::PlaceOrder(parse_trade(
                name,
                arguments,
                TransactionType::Buy,
            )?)),
            "place_sell_order" => Ok(Self::PlaceOrder(parse_trade(
                name,
                arguments,
                TransactionType::Sell,
            )?)),
            "cancel_order" => {
                let a: CancelArgs = args(name, arguments)?;
                Ok(Self::CancelOrder { order_id: a.order_id })
            }
            other => Err(ToolError::UnknownTool(other.to_string())),
        }
    }

    /// Trade placements never execute directly, they go through the
    /// confirmation flow.
    pub fn requires_confirmation(&self) -> bool {
        matches!(self, Self::PlaceOrder(_))
    }

    /// Human summary of a pending trade for the confirmation prompt.
    pub fn describe(&self) -> String {
        match self {
            Self::PlaceOrder(req) => {
                let price = match req.price {
                    Some(p) => format!(" @ \u{20b9}{p}"),
                    None => " at market price".to_string(),
                };
                format!(
                    "{} {} x {} ({}{})",
                    req.transaction_type.as_str(),
                    req.symbol.to_ascii_uppercase(),
                    req.quantity,
                    req.order_type.as_str(),
                    price
                )
            }
            other => format!("{other:?}"),
        }
    }

    /// Execute against the user's broker connection. Results are JSON
    /// values fed back to the model as tool output.
    pub async fn execute(&self, client: &AngelOneClient) -> Result<Value, ToolError> {
        let value = match self {
            Self::GetProfile => serde_json::to_value(client.get_profile().await?),
            Self::GetFunds => serde_json::to_value(client.get_funds().await?),
            Self::GetQuote { symbol, exchange } => {
                serde_json::to_value(client.get_quote(symbol, *exchange).await?)
            }
            Self::GetHoldings => serde_json::to_value(client.get_holdings().await?),
            Self::GetPositions => serde_json::to_value(client.get_positions().await?),
            Self::GetOrders => serde_json::to_value(client.get_orders().await?),
            Self::GetMarketDepth { symbol, exchange } => {
                serde_json::to_value(client.get_market_depth(symbol, *exchange).await?)
            }
            Self::GetHistoricalData {
                symbol,
                exchange,
                interval,
            } => serde_json::to_value(
                client
                    .get_historical_data(symbol, *interval, *exchange)
                    .await?,
            ),
            Self::GetTopMovers { direction } => {
                serde_json::to_value(client.get_top_movers(*direction).await?)
            }
            Self::PlaceOrder(request) => {
                let order_id = client.place_order(request).await?;
                Ok(json!({ "order_id": order_id, "status": "placed" }))
            }
            Self::CancelOrder { order_id } => {
                client.cancel_order(order_id).await?;
                Ok(json!({ "order_id": order_id, "status": "cancelled" }))
            }
            Self::CancelAllPendingOrders => {
                serde_json::to_value(client.cancel_all_pending_orders().await?)
            }
        };
        value.map_err(|e| ToolError::BadArguments {
            tool: "serialize".to_string(),
            reason: e.to_string(),
        })
    }
}

fn symbol_params() -> Value {
    json!({
        "type": "object",
        "properties": {
            "symbol": { "type": "string", "description": "Trading symbol, e.g. RELIANCE" },
            "exchange": { "type": "string", "enum": ["NSE", "BSE", "NFO", "BFO", "MCX", "CDS"] }
        },
        "required": ["symbol"]
    })
}

fn trade_params() -> Value {
    json!({
        "type": "object",
        "properties": {
            "symbol": { "type": "string", "description": "Trading symbol, e.g. RELIANCE" },
            "quantity": { "type": "integer", "minimum": 1 },
            "exchange": { "type": "string", "enum": ["NSE", "BSE"] },
            "order_type": { "type": "string", "enum": ["MARKET", "LIMIT", "STOPLOSS_LIMIT", "STOPLOSS_MARKET"] },
            "product_type": { "type": "string", "enum": ["CNC", "MIS", "NRML"] },
            "price": { "type": "number", "description": "Limit price, required for LIMIT orders" },
            "trigger_price": { "type": "number" }
        },
        "required": ["symbol", "quantity"]
    })
}

fn no_params() -> Value {
    json!({ "type": "object", "properties": {} })
}

/// Schemas advertised to the model on every agent turn.
pub fn tool_specs() -> Vec<ToolSpec> {
    vec![
        ToolSpec::function("get_profile", "Get the user's broker account profile", no_params()),
        ToolSpec::function(
            "get_funds",
            "Get available cash, utilised margin and net available margin",
            no_params(),
        ),
        ToolSpec::function("get_quote", "Get the live price for a symbol", symbol_params()),
        ToolSpec::function("get_holdings", "List portfolio holdings with P&L", no_params()),
        ToolSpec::function("get_positions", "List open intraday/derivative positions", no_params()),
        ToolSpec::function("get_orders", "List today's orders with their status", no_params()),
        ToolSpec::function(
            "get_market_depth",
            "Get full quote with the 5-level bid/ask order book",
            symbol_params(),
        ),
        ToolSpec::function(
            "get_historical_data",
            "Get recent OHLCV candles for a symbol",
            json!({
                "type": "object",
                "properties": {
                    "symbol": { "type": "string" },
                    "exchange": { "type": "string", "enum": ["NSE", "BSE"] },
                    "interval": { "type": "string", "enum": ["1m", "5m", "15m", "30m", "1h", "1d"] }
                },
                "required": ["symbol"]
            }),
        ),
        ToolSpec::function(
            "get_top_movers",
            "Get today's top gaining or losing contracts",
            json!({
                "type": "object",
                "properties": {
                    "direction": { "type": "string", "enum": ["gainers", "losers"] }
                }
            }),
        ),
        ToolSpec::function("place_buy_order", "Place a buy order (asks the user to confirm first)", trade_params()),
        ToolSpec::function("place_sell_order", "Place a sell order (asks the user to confirm first)", trade_params()),
        ToolSpec::function(
            "cancel_order",
            "Cancel one open order by its id",
            json!({
                "type": "object",
                "properties": { "order_id": { "type": "string" } },
                "required": ["order_id"]
            }),
        ),
        ToolSpec::function(
            "cancel_all_pending_orders",
            "Cancel every pending or open order",
            no_params(),
        ),
    ]
}
