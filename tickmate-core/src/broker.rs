//! AngelOne SmartAPI client.
//!
//! One client per authenticated user: owns a reqwest session and the
//! bearer/refresh/feed tokens from the login handshake. Every method maps
//! to one HTTP call (symbol-token resolution and market-order pricing
//! chain an extra internal call). Errors never escape as panics; the
//! taxonomy in [`BrokerError`] tells callers whether to drop the cached
//! connection (`Auth`), show the message (`Api`), or treat the failure as
//! transient (`Network`).

use chrono::{Duration as ChronoDuration, Utc};
use reqwest::{Client, Method, StatusCode};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::str::FromStr;
use std::time::Duration;
use tokio::sync::RwLock;
use totp_rs::{Algorithm, Secret, TOTP};

use crate::config::BrokerConfig;
use crate::error::BrokerError;
use crate::instruments::{normalize_symbol, InstrumentCache};
use crate::models::trading::{
    Candle, CancelAllReport, CancelFailure, CandleInterval, DepthLevel, Exchange, FundsSummary,
    Holding, LoginSession, MarketDepth, MoverDirection, Order, OrderRequest, OrderStatus,
    OrderType, Position, ProductType, Quote, TopMover, TransactionType,
};

const LOGIN_PATH: &str = "/rest/auth/angelbroking/user/v1/loginByPassword";
const LOGOUT_PATH: &str = "/rest/secure/angelbroking/user/v1/logout";
const PROFILE_PATH: &str = "/rest/secure/angelbroking/user/v1/getProfile";
const FUNDS_PATH: &str = "/rest/secure/angelbroking/user/v1/getRMS";
const LTP_PATH: &str = "/rest/secure/angelbroking/order/v1/getLtpData";
const SEARCH_PATH: &str = "/rest/secure/angelbroking/order/v1/searchScrip";
const ORDER_BOOK_PATH: &str = "/rest/secure/angelbroking/order/v1/getOrderBook";
const PLACE_ORDER_PATH: &str = "/rest/secure/angelbroking/order/v1/placeOrder";
const CANCEL_ORDER_PATH: &str = "/rest/secure/angelbroking/order/v1/cancelOrder";
const HOLDINGS_PATH: &str = "/rest/secure/angelbroking/portfolio/v1/getAllHolding";
const POSITIONS_PATH: &str = "/rest/secure/angelbroking/order/v1/getPosition";
const DEPTH_PATH: &str = "/rest/secure/angelbroking/market/v1/quote/";
const CANDLES_PATH: &str = "/rest/secure/angelbroking/historical/v1/getCandleData";
const MOVERS_PATH: &str = "/rest/secure/angelbroking/marketData/v1/gainersLosers";

/// Profile payload used as the cheap session-validity probe.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Profile {
    pub client_code: String,
    pub name: String,
}

/// Order body on the wire. Numeric fields are strings by broker contract;
/// prices come from `Decimal::to_string` so the scale survives as typed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderPayload {
    pub variety: String,
    pub tradingsymbol: String,
    pub symboltoken: String,
    pub transactiontype: String,
    pub exchange: String,
    pub ordertype: String,
    pub producttype: String,
    pub duration: String,
    pub price: String,
    pub squareoff: String,
    pub stoploss: String,
    pub quantity: String,
}

/// Shape the order request into the broker's wire body. `market_price`
/// is the pre-fetched LTP for MARKET orders so we never submit "0".
pub fn build_order_payload(
    request: &OrderRequest,
    symbol_wire: &str,
    token: &str,
    market_price: Option<Decimal>,
) -> OrderPayload {
    let price = match request.order_type {
        OrderType::Market => market_price
            .map(|p| p.to_string())
            .unwrap_or_else(|| "0".to_string()),
        _ => request
            .price
            .map(|p| p.to_string())
            .unwrap_or_else(|| "0".to_string()),
    };

    OrderPayload {
        variety: request.order_type.variety().to_string(),
        tradingsymbol: symbol_wire.to_string(),
        symboltoken: token.to_string(),
        transactiontype: request.transaction_type.as_str().to_string(),
        exchange: request.exchange.as_str().to_string(),
        ordertype: request.order_type.as_str().to_string(),
        producttype: request.product_type.wire_name().to_string(),
        duration: "DAY".to_string(),
        price,
        squareoff: "0".to_string(),
        stoploss: request
            .trigger_price
            .map(|p| p.to_string())
            .unwrap_or_else(|| "0".to_string()),
        quantity: request.quantity.to_string(),
    }
}

#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(default)]
    status: bool,
    #[serde(default)]
    message: String,
    #[serde(default)]
    errorcode: String,
    #[serde(default)]
    data: Value,
}

/// Error codes the broker uses for dead or rejected sessions.
fn is_auth_error_code(code: &str) -> bool {
    matches!(
        code,
        "AG8001" | "AG8002" | "AG8003" | "AB1000" | "AB1001" | "AB1002" | "AB1007"
    )
}

pub struct AngelOneClient {
    http: Client,
    config: BrokerConfig,
    base_url: String,
    tokens: RwLock<Option<LoginSession>>,
    instruments: InstrumentCache,
}

impl AngelOneClient {
    pub fn new(config: BrokerConfig) -> Result<Self, BrokerError> {
        let base_url = config.base_url.clone();
        Self::with_base_url(config, base_url)
    }

    /// Create a client with a custom base URL (for testing / integration)
    pub fn with_base_url(config: BrokerConfig, base_url: String) -> Result<Self, BrokerError> {
        let http = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;

        Ok(Self {
            http,
            config,
            base_url,
            tokens: RwLock::new(None),
            instruments: InstrumentCache::new(),
        })
    }

    pub async fn is_authenticated(&self) -> bool {
        self.tokens.read().await.is_some()
    }

    async fn request(
        &self,
        method: Method,
        path: &str,
        body: Option<Value>,
        authenticated: bool,
    ) -> Result<Value, BrokerError> {
        let url = format!("{}{}", self.base_url, path);
        let mut req = self
            .http
            .request(method, &url)
            .header("Accept", "application/json")
            .header("X-UserType", "USER")
            .header("X-SourceID", "WEB")
            .header("X-ClientLocalIP", "127.0.0.1")
            .header("X-ClientPublicIP", "127.0.0.1")
            .header("X-MACAddress", "00:00:00:00:00:00")
            .header("X-PrivateKey", &self.config.api_key);

        if authenticated {
            let tokens = self.tokens.read().await;
            match tokens.as_ref() {
                Some(session) => {
                    req = req.bearer_auth(&session.jwt_token);
                }
                None => {
                    return Err(BrokerError::Auth(
                        "no active broker session, login required".to_string(),
                    ));
                }
            }
        }

        if let Some(body) = body {
            req = req.json(&body);
        }

        let response = req.send().await?;
        let status = response.status();
        let text = response.text().await?;

        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            tracing::warn!(status = %status, path, "broker rejected credentials");
            return Err(BrokerError::Auth(format!(
                "broker returned {status}, session may have expired"
            )));
        }

        let envelope: Envelope = match serde_json::from_str(&text) {
            Ok(envelope) => envelope,
            Err(_) if !status.is_success() => {
                return Err(BrokerError::Api {
                    code: status.as_u16().to_string(),
                    message: truncate(&text, 200),
                });
            }
            Err(e) => {
                return Err(BrokerError::InvalidResponse(format!(
                    "non-JSON body ({e}): {}",
                    truncate(&text, 200)
                )));
            }
        };

        if !envelope.status {
            let code = if envelope.errorcode.is_empty() {
                status.as_u16().to_string()
            } else {
                envelope.errorcode
            };
            tracing::warn!(code = %code, message = %envelope.message, path, "broker API error");
            if is_auth_error_code(&code) {
                return Err(BrokerError::Auth(envelope.message));
            }
            return Err(BrokerError::Api {
                code,
                message: envelope.message,
            });
        }

        Ok(envelope.data)
    }

    fn totp_code(&self) -> Result<String, BrokerError> {
        let secret = Secret::Encoded(self.config.totp_secret.trim().to_string())
            .to_bytes()
            .map_err(|e| BrokerError::Auth(format!("invalid TOTP secret: {e:?}")))?;
        let totp = TOTP::new_unchecked(Algorithm::SHA1, 6, 1, 30, secret);
        totp.generate_current()
            .map_err(|e| BrokerError::Auth(format!("TOTP generation failed: {e}")))
    }

    /// Login handshake: credentials + time-based one-time code in, the
    /// bearer/refresh/feed token triple out. Failure messages come back
    /// verbatim for display.
    pub async fn login(&self) -> Result<LoginSession, BrokerError> {
        let body = json!({
            "clientcode": self.config.client_code,
            "password": self.config.pin,
            "totp": self.totp_code()?,
        });

        let data = self.request(Method::POST, LOGIN_PATH, Some(body), false).await?;

        let session = LoginSession {
            jwt_token: str_field(&data, "jwtToken"),
            refresh_token: str_field(&data, "refreshToken"),
            feed_token: str_field(&data, "feedToken"),
        };
        if session.jwt_token.is_empty() {
            return Err(BrokerError::InvalidResponse(
                "login response carried no jwtToken".to_string(),
            ));
        }

        *self.tokens.write().await = Some(session.clone());
        tracing::info!(client_code = %self.config.client_code, "broker login succeeded");
        Ok(session)
    }

    pub async fn get_profile(&self) -> Result<Profile, BrokerError> {
        let data = self.request(Method::GET, PROFILE_PATH, None, true).await?;
        Ok(Profile {
            client_code: str_field(&data, "clientcode"),
            name: str_field(&data, "name"),
        })
    }

    pub async fn get_funds(&self) -> Result<FundsSummary, BrokerError> {
        let data = self.request(Method::GET, FUNDS_PATH, None, true).await?;
        Ok(FundsSummary {
            available_cash: dec_field(&data, "availablecash"),
            utilised_margin: dec_field(&data, "utiliseddebits"),
            available_margin: dec_field(&data, "net"),
        })
    }

    /// Resolve the broker's numeric instrument token, consulting the
    /// seeded cache first and the search endpoint on a miss.
    async fn resolve_token(&self, symbol_wire: &str, exchange: Exchange) -> Result<String, BrokerError> {
        if let Some(token) = self.instruments.get(exchange, symbol_wire) {
            return Ok(token);
        }

        let body = json!({
            "exchange": exchange.as_str(),
            "searchtext": symbol_wire,
        });
        let data = self.request(Method::POST, SEARCH_PATH, Some(body), true).await?;

        if let Some(items) = data.as_array() {
            for item in items {
                if str_field(item, "tradingsymbol") == symbol_wire {
                    let token = str_field(item, "symboltoken");
                    if !token.is_empty() {
                        tracing::debug!(symbol = symbol_wire, token = %token, "instrument token found via search");
                        self.instruments
                            .insert(exchange, symbol_wire.to_string(), token.clone());
                        return Ok(token);
                    }
                }
            }
        }

        Err(BrokerError::UnknownSymbol {
            symbol: symbol_wire.to_string(),
            exchange: exchange.as_str().to_string(),
        })
    }

    pub async fn get_quote(&self, symbol: &str, exchange: Exchange) -> Result<Quote, BrokerError> {
        let symbol_wire = normalize_symbol(symbol, exchange);
        let token = self.resolve_token(&symbol_wire, exchange).await?;

        let body = json!({
            "exchange": exchange.as_str(),
            "tradingsymbol": symbol_wire,
            "symboltoken": token,
        });
        let data = self.request(Method::POST, LTP_PATH, Some(body), true).await?;

        let ltp = dec_field(&data, "ltp");
        let close = {
            let close = dec_field(&data, "close");
            if close.is_zero() { ltp } else { close }
        };
        let change = ltp - close;
        let change_percent = if close > Decimal::ZERO {
            change * Decimal::from(100) / close
        } else {
            Decimal::ZERO
        };

        Ok(Quote {
            symbol: symbol.trim().to_ascii_uppercase(),
            exchange,
            ltp,
            open: dec_field(&data, "open"),
            high: dec_field(&data, "high"),
            low: dec_field(&data, "low"),
            close,
            change,
            change_percent,
            volume: uint_field(&data, "tradeVolume").max(uint_field(&data, "volume")),
            timestamp: Utc::now(),
        })
    }

    /// Empty/absent payloads yield an empty list; auth and transport
    /// failures stay errors so the registry can react to them.
    pub async fn get_holdings(&self) -> Result<Vec<Holding>, BrokerError> {
        let data = self.request(Method::GET, HOLDINGS_PATH, None, true).await?;
        let rows = match data.get("holdings").and_then(Value::as_array) {
            Some(rows) => rows,
            None => return Ok(Vec::new()),
        };

        Ok(rows
            .iter()
            .filter(|row| row.is_object())
            .map(|row| Holding {
                symbol: str_field(row, "tradingsymbol"),
                exchange: Exchange::parse(&str_field(row, "exchange")).unwrap_or(Exchange::Nse),
                quantity: int_field(row, "quantity"),
                average_price: dec_field(row, "averageprice"),
                last_price: dec_field(row, "ltp"),
                pnl: dec_field(row, "profitandloss"),
                product_type: ProductType::from_wire(&str_field(row, "product")),
            })
            .collect())
    }

    pub async fn get_positions(&self) -> Result<Vec<Position>, BrokerError> {
        let data = self.request(Method::GET, POSITIONS_PATH, None, true).await?;
        let rows = match data.as_array() {
            Some(rows) => rows,
            None => return Ok(Vec::new()),
        };

        Ok(rows
            .iter()
            .filter(|row| row.is_object())
            .map(|row| Position {
                symbol: str_field(row, "tradingsymbol"),
                exchange: Exchange::parse(&str_field(row, "exchange")).unwrap_or(Exchange::Nse),
                net_quantity: int_field(row, "netqty"),
                average_price: dec_field(row, "avgnetprice"),
                last_price: dec_field(row, "ltp"),
                pnl: dec_field(row, "pnl"),
                product_type: ProductType::from_wire(&str_field(row, "producttype")),
            })
            .collect())
    }

    pub async fn get_orders(&self) -> Result<Vec<Order>, BrokerError> {
        let data = self.request(Method::GET, ORDER_BOOK_PATH, None, true).await?;
        let rows = match data.as_array() {
            Some(rows) => rows,
            None => return Ok(Vec::new()),
        };

        Ok(rows
            .iter()
            .filter(|row| row.is_object())
            .map(|row| Order {
                order_id: str_field(row, "orderid"),
                symbol: str_field(row, "tradingsymbol"),
                exchange: Exchange::parse(&str_field(row, "exchange")).unwrap_or(Exchange::Nse),
                transaction_type: TransactionType::from_wire(&str_field(row, "transactiontype")),
                order_type: OrderType::from_wire(&str_field(row, "ordertype")),
                product_type: ProductType::from_wire(&str_field(row, "producttype")),
                quantity: int_field(row, "quantity").max(0) as u32,
                filled_quantity: int_field(row, "filledshares").max(0) as u32,
                price: non_zero(dec_field(row, "price")),
                average_price: non_zero(dec_field(row, "averageprice")),
                status: OrderStatus::parse(&str_field(row, "status")),
            })
            .collect())
    }

    /// Place one order. MARKET orders pre-fetch the live quote so the
    /// price field is never "0"; the quote failure path falls back to "0"
    /// with a warning rather than blocking the order.
    pub async fn place_order(&self, request: &OrderRequest) -> Result<String, BrokerError> {
        let symbol_wire = normalize_symbol(&request.symbol, request.exchange);
        let token = self.resolve_token(&symbol_wire, request.exchange).await?;

        let market_price = if request.order_type == OrderType::Market {
            match self.get_quote(&request.symbol, request.exchange).await {
                Ok(quote) => Some(quote.ltp),
                Err(e) => {
                    tracing::warn!(symbol = %request.symbol, error = %e, "market price prefetch failed, sending 0");
                    None
                }
            }
        } else {
            None
        };

        let payload = build_order_payload(request, &symbol_wire, &token, market_price);
        tracing::info!(
            symbol = %payload.tradingsymbol,
            side = %payload.transactiontype,
            quantity = %payload.quantity,
            price = %payload.price,
            "placing order"
        );

        let data = self
            .request(
                Method::POST,
                PLACE_ORDER_PATH,
                Some(serde_json::to_value(&payload).map_err(|e| {
                    BrokerError::InvalidResponse(format!("order payload serialization: {e}"))
                })?),
                true,
            )
            .await?;

        Ok(str_field(&data, "orderid"))
    }

    pub async fn cancel_order(&self, order_id: &str) -> Result<(), BrokerError> {
        let body = json!({ "variety": "NORMAL", "orderid": order_id });
        self.request(Method::POST, CANCEL_ORDER_PATH, Some(body), true).await?;
        Ok(())
    }

    /// Fetch the order book, cancel every pending/open order one by one.
    /// Individual failures are counted, never abort the batch.
    pub async fn cancel_all_pending_orders(&self) -> Result<CancelAllReport, BrokerError> {
        let orders = self.get_orders().await?;
        let pending: Vec<Order> = orders.into_iter().filter(|o| o.status.is_pending()).collect();

        let mut report = CancelAllReport::default();
        for order in pending {
            match self.cancel_order(&order.order_id).await {
                Ok(()) => report.cancelled += 1,
                Err(e) => {
                    tracing::warn!(order_id = %order.order_id, error = %e, "cancel failed");
                    report.failed += 1;
                    report.failures.push(CancelFailure {
                        order_id: order.order_id,
                        symbol: order.symbol,
                        reason: e.to_string(),
                    });
                }
            }
        }
        Ok(report)
    }

    pub async fn get_market_depth(
        &self,
        symbol: &str,
        exchange: Exchange,
    ) -> Result<MarketDepth, BrokerError> {
        let symbol_wire = normalize_symbol(symbol, exchange);
        let token = self.resolve_token(&symbol_wire, exchange).await?;

        let body = json!({
            "mode": "FULL",
            "exchangeTokens": { exchange.as_str(): [token] },
        });
        let data = self.request(Method::POST, DEPTH_PATH, Some(body), true).await?;

        let row = data
            .get("fetched")
            .and_then(Value::as_array)
            .and_then(|rows| rows.first())
            .ok_or_else(|| {
                BrokerError::InvalidResponse(format!("no depth data for {symbol_wire}"))
            })?;

        let depth = row.get("depth").cloned().unwrap_or(Value::Null);
        Ok(MarketDepth {
            symbol: str_field(row, "tradingSymbol"),
            exchange,
            ltp: dec_field(row, "ltp"),
            open: dec_field(row, "open"),
            high: dec_field(row, "high"),
            low: dec_field(row, "low"),
            close: dec_field(row, "close"),
            net_change: dec_field(row, "netChange"),
            percent_change: dec_field(row, "percentChange"),
            volume: uint_field(row, "tradeVolume"),
            total_buy_quantity: uint_field(row, "totBuyQuan"),
            total_sell_quantity: uint_field(row, "totSellQuan"),
            week_52_high: dec_field(row, "52WeekHigh"),
            week_52_low: dec_field(row, "52WeekLow"),
            bids: depth_levels(&depth, "buy"),
            asks: depth_levels(&depth, "sell"),
        })
    }

    pub async fn get_historical_data(
        &self,
        symbol: &str,
        interval: CandleInterval,
        exchange: Exchange,
    ) -> Result<Vec<Candle>, BrokerError> {
        let symbol_wire = normalize_symbol(symbol, exchange);
        let token = self.resolve_token(&symbol_wire, exchange).await?;

        let to = Utc::now();
        let from = to - ChronoDuration::days(interval.lookback_days());
        let body = json!({
            "exchange": exchange.as_str(),
            "symboltoken": token,
            "interval": interval.wire_name(),
            "fromdate": from.format("%Y-%m-%d %H:%M").to_string(),
            "todate": to.format("%Y-%m-%d %H:%M").to_string(),
        });
        let data = self.request(Method::POST, CANDLES_PATH, Some(body), true).await?;

        let rows = match data.as_array() {
            Some(rows) => rows,
            None => return Ok(Vec::new()),
        };

        Ok(rows
            .iter()
            .filter_map(|row| {
                let cols = row.as_array()?;
                if cols.len() < 6 {
                    return None;
                }
                Some(Candle {
                    timestamp: cols[0].as_str().unwrap_or_default().to_string(),
                    open: dec_value(&cols[1]),
                    high: dec_value(&cols[2]),
                    low: dec_value(&cols[3]),
                    close: dec_value(&cols[4]),
                    volume: cols[5].as_u64().unwrap_or(0),
                })
            })
            .collect())
    }

    pub async fn get_top_movers(
        &self,
        direction: MoverDirection,
    ) -> Result<Vec<TopMover>, BrokerError> {
        let body = json!({
            "datatype": direction.wire_name(),
            "expirytype": "NEAR",
        });
        let data = self.request(Method::POST, MOVERS_PATH, Some(body), true).await?;

        let rows = match data.as_array() {
            Some(rows) => rows,
            None => return Ok(Vec::new()),
        };

        Ok(rows
            .iter()
            .map(|row| TopMover {
                symbol: str_field(row, "tradingSymbol"),
                percent_change: dec_field(row, "percentChange"),
                symbol_token: str_field(row, "symbolToken"),
            })
            .collect())
    }

    /// Best-effort remote logout; local tokens are cleared no matter what
    /// the broker says.
    pub async fn logout(&self) -> Result<(), BrokerError> {
        let had_session = self.tokens.read().await.is_some();
        if had_session {
            let body = json!({ "clientcode": self.config.client_code });
            if let Err(e) = self.request(Method::POST, LOGOUT_PATH, Some(body), true).await {
                tracing::warn!(error = %e, "remote logout failed, clearing local session anyway");
            }
        }
        *self.tokens.write().await = None;
        Ok(())
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        s.to_string()
    } else {
        let mut end = max;
        while !s.is_char_boundary(end) {
            end -= 1;
        }
        s[..end].to_string()
    }
}

fn str_field(v: &Value, key: &str) -> String {
    match v.get(key) {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Number(n)) => n.to_string(),
        _ => String::new(),
    }
}

/// Broker payloads mix numbers and numeric strings; both parse, anything
/// else is zero.
fn dec_field(v: &Value, key: &str) -> Decimal {
    v.get(key).map(dec_value).unwrap_or(Decimal::ZERO)
}

fn dec_value(v: &Value) -> Decimal {
    match v {
        Value::String(s) => Decimal::from_str(s.trim()).unwrap_or(Decimal::ZERO),
        Value::Number(n) => Decimal::from_str(&n.to_string()).unwrap_or(Decimal::ZERO),
        _ => Decimal::ZERO,
    }
}

fn int_field(v: &Value, key: &str) -> i64 {
    match v.get(key) {
        Some(Value::Number(n)) => n.as_i64().unwrap_or(0),
        Some(Value::String(s)) => s.trim().parse().unwrap_or(0),
        _ => 0,
    }
}

fn uint_field(v: &Value, key: &str) -> u64 {
    int_field(v, key).max(0) as u64
}

fn non_zero(d: Decimal) -> Option<Decimal> {
    if d.is_zero() { None } else { Some(d) }
}

fn depth_levels(depth: &Value, side: &str) -> Vec<DepthLevel> {
    depth
        .get(side)
        .and_then(Value::as_array)
        .map(|levels| {
            levels
                .iter()
                .map(|level| DepthLevel {
                    price: dec_field(level, "price"),
                    quantity: uint_field(level, "quantity"),
                    orders: uint_field(level, "orders") as u32,
                })
                .filter(|level| level.price > Decimal::ZERO && level.quantity > 0)
                .take(5)
                .collect()
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_json, body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn test_config() -> BrokerConfig {
        BrokerConfig {
            api_key: "test-api-key".to_string(),
            client_code: "C12345".to_string(),
            pin: "0000".to_string(),
            totp_secret: "JBSWY3DPEHPK3PXP".to_string(),
            base_url: String::new(),
        }
    }

    async fn logged_in_client(server: &MockServer) -> AngelOneClient {
        Mock::given(method("POST"))
            .and(path(LOGIN_PATH))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "status": true,
                "message": "SUCCESS",
                "errorcode": "",
                "data": {
                    "jwtToken": "jwt-123",
                    "refreshToken": "refresh-123",
                    "feedToken": "feed-123"
                }
            })))
            .mount(server)
            .await;

        let client = AngelOneClient::with_base_url(test_config(), server.uri()).unwrap();
        client.login().await.unwrap();
        client
    }

    #[tokio::test]
    async fn login_stores_tokens_and_sends_bearer() {
        let server = MockServer::start().await;
        let client = logged_in_client(&server).await;
        assert!(client.is_authenticated().await);

        Mock::given(method("GET"))
            .and(path(PROFILE_PATH))
            .and(header("authorization", "Bearer jwt-123"))
            .and(header("x-privatekey", "test-api-key"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "status": true,
                "message": "SUCCESS",
                "errorcode": "",
                "data": { "clientcode": "C12345", "name": "Test User" }
            })))
            .mount(&server)
            .await;

        let profile = client.get_profile().await.unwrap();
        assert_eq!(profile.client_code, "C12345");
        assert_eq!(profile.name, "Test User");
    }

    #[tokio::test]
    async fn login_failure_surfaces_broker_message_verbatim() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(LOGIN_PATH))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "status": false,
                "message": "Invalid totp",
                "errorcode": "AB1050",
                "data": null
            })))
            .mount(&server)
            .await;

        let client = AngelOneClient::with_base_url(test_config(), server.uri()).unwrap();
        let err = client.login().await.unwrap_err();
        match err {
            BrokerError::Api { code, message } => {
                assert_eq!(code, "AB1050");
                assert_eq!(message, "Invalid totp");
            }
            other => panic!("expected Api error, got {other}"),
        }
        assert!(!client.is_authenticated().await);
    }

    #[tokio::test]
    async fn auth_error_codes_map_to_auth_errors() {
        let server = MockServer::start().await;
        let client = logged_in_client(&server).await;

        Mock::given(method("GET"))
            .and(path(PROFILE_PATH))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "status": false,
                "message": "Token expired",
                "errorcode": "AG8001",
                "data": null
            })))
            .mount(&server)
            .await;

        let err = client.get_profile().await.unwrap_err();
        assert!(matches!(err, BrokerError::Auth(_)), "got {err}");
        assert!(!err.is_transient());
    }

    #[tokio::test]
    async fn http_401_maps_to_auth_error() {
        let server = MockServer::start().await;
        let client = logged_in_client(&server).await;

        Mock::given(method("GET"))
            .and(path(FUNDS_PATH))
            .respond_with(ResponseTemplate::new(401).set_body_string("<html>denied</html>"))
            .mount(&server)
            .await;

        let err = client.get_funds().await.unwrap_err();
        assert!(matches!(err, BrokerError::Auth(_)), "got {err}");
    }

    #[tokio::test]
    async fn unauthenticated_call_fails_before_any_http() {
        let client =
            AngelOneClient::with_base_url(test_config(), "http://127.0.0.1:9".to_string()).unwrap();
        let err = client.get_funds().await.unwrap_err();
        assert!(matches!(err, BrokerError::Auth(_)), "got {err}");
    }

    #[test]
    fn limit_order_payload_keeps_decimal_scale() {
        let request = OrderRequest {
            symbol: "RELIANCE".to_string(),
            exchange: Exchange::Nse,
            transaction_type: TransactionType::Buy,
            order_type: OrderType::Limit,
            product_type: ProductType::Cnc,
            quantity: 10,
            price: Some(Decimal::from_str("2500.00").unwrap()),
            trigger_price: None,
        };

        let payload = build_order_payload(&request, "RELIANCE-EQ", "2885", None);
        assert_eq!(payload.price, "2500.00");
        assert_eq!(payload.quantity, "10");
        assert_eq!(payload.variety, "NORMAL");
        assert_eq!(payload.producttype, "DELIVERY");
        assert_eq!(payload.tradingsymbol, "RELIANCE-EQ");
        assert_eq!(payload.symboltoken, "2885");
    }

    #[tokio::test]
    async fn limit_order_posts_exact_wire_body() {
        let server = MockServer::start().await;
        let client = logged_in_client(&server).await;

        Mock::given(method("POST"))
            .and(path(PLACE_ORDER_PATH))
            .and(body_json(serde_json::json!({
                "variety": "NORMAL",
                "tradingsymbol": "RELIANCE-EQ",
                "symboltoken": "2885",
                "transactiontype": "BUY",
                "exchange": "NSE",
                "ordertype": "LIMIT",
                "producttype": "DELIVERY",
                "duration": "DAY",
                "price": "2500.00",
                "squareoff": "0",
                "stoploss": "0",
                "quantity": "10"
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "status": true,
                "message": "SUCCESS",
                "errorcode": "",
                "data": { "orderid": "240101000000001" }
            })))
            .expect(1)
            .mount(&server)
            .await;

        let request = OrderRequest {
            symbol: "RELIANCE".to_string(),
            exchange: Exchange::Nse,
            transaction_type: TransactionType::Buy,
            order_type: OrderType::Limit,
            product_type: ProductType::Cnc,
            quantity: 10,
            price: Some(Decimal::from_str("2500.00").unwrap()),
            trigger_price: None,
        };
        let order_id = client.place_order(&request).await.unwrap();
        assert_eq!(order_id, "240101000000001");
    }

    #[tokio::test]
    async fn market_order_prefetches_live_price() {
        let server = MockServer::start().await;
        let client = logged_in_client(&server).await;

        Mock::given(method("POST"))
            .and(path(LTP_PATH))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "status": true,
                "message": "SUCCESS",
                "errorcode": "",
                "data": { "ltp": "1450.50", "open": "1440", "high": "1460", "low": "1430", "close": "1445" }
            })))
            .mount(&server)
            .await;

        Mock::given(method("POST"))
            .and(path(PLACE_ORDER_PATH))
            .and(body_partial_json(serde_json::json!({
                "ordertype": "MARKET",
                "price": "1450.50"
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "status": true,
                "message": "SUCCESS",
                "errorcode": "",
                "data": { "orderid": "240101000000002" }
            })))
            .expect(1)
            .mount(&server)
            .await;

        let request = OrderRequest {
            symbol: "SBIN".to_string(),
            exchange: Exchange::Nse,
            transaction_type: TransactionType::Sell,
            order_type: OrderType::Market,
            product_type: ProductType::Cnc,
            quantity: 5,
            price: None,
            trigger_price: None,
        };
        let order_id = client.place_order(&request).await.unwrap();
        assert_eq!(order_id, "240101000000002");
    }

    #[tokio::test]
    async fn unknown_symbol_is_a_typed_error() {
        let server = MockServer::start().await;
        let client = logged_in_client(&server).await;

        Mock::given(method("POST"))
            .and(path(SEARCH_PATH))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "status": true,
                "message": "SUCCESS",
                "errorcode": "",
                "data": []
            })))
            .mount(&server)
            .await;

        let err = client.get_quote("NOSUCHSCRIP", Exchange::Nse).await.unwrap_err();
        assert!(matches!(err, BrokerError::UnknownSymbol { .. }), "got {err}");
    }

    #[tokio::test]
    async fn search_hit_is_cached_for_later_calls() {
        let server = MockServer::start().await;
        let client = logged_in_client(&server).await;

        Mock::given(method("POST"))
            .and(path(SEARCH_PATH))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "status": true,
                "message": "SUCCESS",
                "errorcode": "",
                "data": [
                    { "tradingsymbol": "TRIDENT-EQ", "symboltoken": "2029", "exchange": "NSE" }
                ]
            })))
            .expect(1)
            .mount(&server)
            .await;

        Mock::given(method("POST"))
            .and(path(LTP_PATH))
            .and(body_partial_json(serde_json::json!({ "symboltoken": "2029" })))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "status": true,
                "message": "SUCCESS",
                "errorcode": "",
                "data": { "ltp": "35.20", "close": "35.00" }
            })))
            .expect(2)
            .mount(&server)
            .await;

        client.get_quote("TRIDENT", Exchange::Nse).await.unwrap();
        // Second call must hit the token cache, not the search endpoint.
        let quote = client.get_quote("TRIDENT", Exchange::Nse).await.unwrap();
        assert_eq!(quote.ltp, Decimal::from_str("35.20").unwrap());
        assert_eq!(quote.change.to_string(), "0.20");
    }

    #[tokio::test]
    async fn cancel_all_issues_one_cancel_per_pending_order() {
        let server = MockServer::start().await;
        let client = logged_in_client(&server).await;

        Mock::given(method("GET"))
            .and(path(ORDER_BOOK_PATH))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "status": true,
                "message": "SUCCESS",
                "errorcode": "",
                "data": [
                    { "orderid": "1", "tradingsymbol": "SBIN-EQ", "status": "open",
                      "transactiontype": "BUY", "ordertype": "LIMIT", "producttype": "DELIVERY",
                      "quantity": "5", "filledshares": "0", "price": "800", "exchange": "NSE" },
                    { "orderid": "2", "tradingsymbol": "ITC-EQ", "status": "pending",
                      "transactiontype": "SELL", "ordertype": "LIMIT", "producttype": "DELIVERY",
                      "quantity": "3", "filledshares": "0", "price": "450", "exchange": "NSE" },
                    { "orderid": "3", "tradingsymbol": "TCS-EQ", "status": "complete",
                      "transactiontype": "BUY", "ordertype": "MARKET", "producttype": "DELIVERY",
                      "quantity": "1", "filledshares": "1", "price": "0", "exchange": "NSE" }
                ]
            })))
            .mount(&server)
            .await;

        Mock::given(method("POST"))
            .and(path(CANCEL_ORDER_PATH))
            .and(body_partial_json(serde_json::json!({ "orderid": "1" })))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "status": true, "message": "SUCCESS", "errorcode": "", "data": {}
            })))
            .expect(1)
            .mount(&server)
            .await;

        Mock::given(method("POST"))
            .and(path(CANCEL_ORDER_PATH))
            .and(body_partial_json(serde_json::json!({ "orderid": "2" })))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "status": false, "message": "Order already executed", "errorcode": "AB2001", "data": null
            })))
            .expect(1)
            .mount(&server)
            .await;

        let report = client.cancel_all_pending_orders().await.unwrap();
        assert_eq!(report.cancelled, 1);
        assert_eq!(report.failed, 1);
        assert_eq!(report.cancelled + report.failed, 2);
        assert_eq!(report.failures[0].order_id, "2");
        assert_eq!(report.failures[0].symbol, "ITC-EQ");
    }

    #[tokio::test]
    async fn empty_holdings_payload_yields_empty_list() {
        let server = MockServer::start().await;
        let client = logged_in_client(&server).await;

        Mock::given(method("GET"))
            .and(path(HOLDINGS_PATH))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "status": true, "message": "SUCCESS", "errorcode": "", "data": null
            })))
            .mount(&server)
            .await;

        let holdings = client.get_holdings().await.unwrap();
        assert!(holdings.is_empty());
    }

    #[tokio::test]
    async fn logout_clears_tokens_even_when_remote_call_fails() {
        let server = MockServer::start().await;
        let client = logged_in_client(&server).await;

        Mock::given(method("POST"))
            .and(path(LOGOUT_PATH))
            .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
            .mount(&server)
            .await;

        client.logout().await.unwrap();
        assert!(!client.is_authenticated().await);
    }
}
