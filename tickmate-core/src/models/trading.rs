use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Exchange {
    Nse,
    Bse,
    Nfo,
    Bfo,
    Mcx,
    Cds,
}

impl Exchange {
    pub fn as_str(&self) -> &'static str {
        match self {
            Exchange::Nse => "NSE",
            Exchange::Bse => "BSE",
            Exchange::Nfo => "NFO",
            Exchange::Bfo => "BFO",
            Exchange::Mcx => "MCX",
            Exchange::Cds => "CDS",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_uppercase().as_str() {
            "NSE" => Some(Exchange::Nse),
            "BSE" => Some(Exchange::Bse),
            "NFO" => Some(Exchange::Nfo),
            "BFO" => Some(Exchange::Bfo),
            "MCX" => Some(Exchange::Mcx),
            "CDS" => Some(Exchange::Cds),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderType {
    #[serde(rename = "MARKET")]
    Market,
    #[serde(rename = "LIMIT")]
    Limit,
    #[serde(rename = "STOPLOSS_LIMIT")]
    StopLoss,
    #[serde(rename = "STOPLOSS_MARKET")]
    StopLossMarket,
}

impl OrderType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderType::Market => "MARKET",
            OrderType::Limit => "LIMIT",
            OrderType::StopLoss => "STOPLOSS_LIMIT",
            OrderType::StopLossMarket => "STOPLOSS_MARKET",
        }
    }

    /// Broker order variety: stop orders go through the STOPLOSS variety.
    pub fn variety(&self) -> &'static str {
        match self {
            OrderType::Market | OrderType::Limit => "NORMAL",
            OrderType::StopLoss | OrderType::StopLossMarket => "STOPLOSS",
        }
    }

    pub fn from_wire(s: &str) -> Self {
        match s.to_ascii_uppercase().as_str() {
            "LIMIT" => OrderType::Limit,
            "STOPLOSS_LIMIT" | "SL" => OrderType::StopLoss,
            "STOPLOSS_MARKET" | "SL-M" => OrderType::StopLossMarket,
            _ => OrderType::Market,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TransactionType {
    Buy,
    Sell,
}

impl TransactionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionType::Buy => "BUY",
            TransactionType::Sell => "SELL",
        }
    }

    pub fn from_wire(s: &str) -> Self {
        if s.eq_ignore_ascii_case("SELL") {
            TransactionType::Sell
        } else {
            TransactionType::Buy
        }
    }
}

/// Settlement classification. The broker wire names differ from the
/// user-facing ones (CNC -> DELIVERY, MIS -> INTRADAY, NRML -> NORMAL).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ProductType {
    Cnc,
    Mis,
    Nrml,
}

impl ProductType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProductType::Cnc => "CNC",
            ProductType::Mis => "MIS",
            ProductType::Nrml => "NRML",
        }
    }

    pub fn wire_name(&self) -> &'static str {
        match self {
            ProductType::Cnc => "DELIVERY",
            ProductType::Mis => "INTRADAY",
            ProductType::Nrml => "NORMAL",
        }
    }

    pub fn from_wire(s: &str) -> Self {
        match s.to_ascii_uppercase().as_str() {
            "INTRADAY" | "MIS" => ProductType::Mis,
            "NORMAL" | "MARGIN" | "NRML" => ProductType::Nrml,
            _ => ProductType::Cnc,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderStatus {
    Pending,
    Open,
    Complete,
    Cancelled,
    Rejected,
    Unknown,
}

impl OrderStatus {
    /// The broker mixes cases ("open", "OPEN", "trigger pending").
    pub fn parse(s: &str) -> Self {
        let s = s.to_ascii_lowercase();
        if s.contains("pending") {
            OrderStatus::Pending
        } else if s.contains("open") {
            OrderStatus::Open
        } else if s.contains("complete") {
            OrderStatus::Complete
        } else if s.contains("cancel") {
            OrderStatus::Cancelled
        } else if s.contains("reject") {
            OrderStatus::Rejected
        } else {
            OrderStatus::Unknown
        }
    }

    pub fn is_pending(&self) -> bool {
        matches!(self, OrderStatus::Pending | OrderStatus::Open)
    }
}

/// Order placement request. Built once from validated user input and
/// passed by value into the broker client; never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderRequest {
    pub symbol: String,
    pub exchange: Exchange,
    pub transaction_type: TransactionType,
    pub order_type: OrderType,
    pub product_type: ProductType,
    pub quantity: u32,
    pub price: Option<Decimal>,
    pub trigger_price: Option<Decimal>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    pub order_id: String,
    pub symbol: String,
    pub exchange: Exchange,
    pub transaction_type: TransactionType,
    pub order_type: OrderType,
    pub product_type: ProductType,
    pub quantity: u32,
    pub filled_quantity: u32,
    pub price: Option<Decimal>,
    pub average_price: Option<Decimal>,
    pub status: OrderStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Holding {
    pub symbol: String,
    pub exchange: Exchange,
    pub quantity: i64,
    pub average_price: Decimal,
    pub last_price: Decimal,
    pub pnl: Decimal,
    pub product_type: ProductType,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub symbol: String,
    pub exchange: Exchange,
    pub net_quantity: i64,
    pub average_price: Decimal,
    pub last_price: Decimal,
    pub pnl: Decimal,
    pub product_type: ProductType,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Quote {
    pub symbol: String,
    pub exchange: Exchange,
    pub ltp: Decimal,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub change: Decimal,
    pub change_percent: Decimal,
    pub volume: u64,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DepthLevel {
    pub price: Decimal,
    pub quantity: u64,
    pub orders: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketDepth {
    pub symbol: String,
    pub exchange: Exchange,
    pub ltp: Decimal,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub net_change: Decimal,
    pub percent_change: Decimal,
    pub volume: u64,
    pub total_buy_quantity: u64,
    pub total_sell_quantity: u64,
    pub week_52_high: Decimal,
    pub week_52_low: Decimal,
    pub bids: Vec<DepthLevel>,
    pub asks: Vec<DepthLevel>,
}

/// Candle granularities the broker's historical endpoint accepts. Each
/// lookback window is sized to return on the order of a hundred candles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CandleInterval {
    OneMinute,
    ThreeMinute,
    FiveMinute,
    TenMinute,
    FifteenMinute,
    ThirtyMinute,
    OneHour,
    OneDay,
}

impl CandleInterval {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_uppercase().as_str() {
            "1M" => Some(CandleInterval::OneMinute),
            "3M" => Some(CandleInterval::ThreeMinute),
            "5M" => Some(CandleInterval::FiveMinute),
            "10M" => Some(CandleInterval::TenMinute),
            "15M" => Some(CandleInterval::FifteenMinute),
            "30M" => Some(CandleInterval::ThirtyMinute),
            "1H" => Some(CandleInterval::OneHour),
            "1D" => Some(CandleInterval::OneDay),
            _ => None,
        }
    }

    pub fn wire_name(&self) -> &'static str {
        match self {
            CandleInterval::OneMinute => "ONE_MINUTE",
            CandleInterval::ThreeMinute => "THREE_MINUTE",
            CandleInterval::FiveMinute => "FIVE_MINUTE",
            CandleInterval::TenMinute => "TEN_MINUTE",
            CandleInterval::FifteenMinute => "FIFTEEN_MINUTE",
            CandleInterval::ThirtyMinute => "THIRTY_MINUTE",
            CandleInterval::OneHour => "ONE_HOUR",
            CandleInterval::OneDay => "ONE_DAY",
        }
    }

    pub fn lookback_days(&self) -> i64 {
        match self {
            CandleInterval::OneMinute | CandleInterval::ThreeMinute | CandleInterval::FiveMinute => 1,
            CandleInterval::TenMinute | CandleInterval::FifteenMinute => 2,
            CandleInterval::ThirtyMinute => 3,
            CandleInterval::OneHour => 5,
            CandleInterval::OneDay => 100,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MoverDirection {
    Gainers,
    Losers,
}

impl MoverDirection {
    pub fn wire_name(&self) -> &'static str {
        match self {
            MoverDirection::Gainers => "PercPriceGainers",
            MoverDirection::Losers => "PercPriceLosers",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Candle {
    pub timestamp: String,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FundsSummary {
    pub available_cash: Decimal,
    pub utilised_margin: Decimal,
    pub available_margin: Decimal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TopMover {
    pub symbol: String,
    pub percent_change: Decimal,
    pub symbol_token: String,
}

/// Tokens returned by the login handshake. The bearer (`jwt`) token
/// authorizes REST calls; the feed token is for market-data streaming.
#[derive(Debug, Clone)]
pub struct LoginSession {
    pub jwt_token: String,
    pub refresh_token: String,
    pub feed_token: String,
}

/// Outcome of a cancel-all batch. Per-order failures are counted, not
/// fatal to the batch.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CancelAllReport {
    pub cancelled: usize,
    pub failed: usize,
    pub failures: Vec<CancelFailure>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CancelFailure {
    pub order_id: String,
    pub symbol: String,
    pub reason: String,
}
