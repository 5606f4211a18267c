//! Symbol-to-instrument-token resolution.
//!
//! The broker's order and quote endpoints want its internal numeric token,
//! not the ticker. A seeded cache covers the liquid NSE names; anything
//! else falls through to the broker's search endpoint and the hit is
//! cached for the life of the client.

use std::collections::HashMap;
use std::sync::RwLock;

use crate::models::trading::Exchange;

/// Liquid NSE equities, seeded so the common case needs no search call.
const NSE_SEED: &[(&str, &str)] = &[
    ("RELIANCE-EQ", "2885"),
    ("TCS-EQ", "11536"),
    ("HDFCBANK-EQ", "1333"),
    ("INFY-EQ", "1594"),
    ("ICICIBANK-EQ", "4963"),
    ("ITC-EQ", "1660"),
    ("KOTAKBANK-EQ", "1922"),
    ("SBIN-EQ", "3045"),
    ("BHARTIARTL-EQ", "10604"),
    ("HINDUNILVR-EQ", "1394"),
    ("ASIANPAINT-EQ", "236"),
    ("MARUTI-EQ", "2031"),
    ("AXISBANK-EQ", "5900"),
    ("LT-EQ", "11483"),
    ("SUNPHARMA-EQ", "3351"),
    ("TITAN-EQ", "3506"),
    ("NESTLEIND-EQ", "17963"),
    ("BAJFINANCE-EQ", "16669"),
    ("ULTRACEMCO-EQ", "11532"),
    ("WIPRO-EQ", "3787"),
    ("ONGC-EQ", "2475"),
    ("TATAMOTORS-EQ", "3456"),
    ("TECHM-EQ", "13538"),
    ("NTPC-EQ", "11630"),
    ("POWERGRID-EQ", "14977"),
    ("HCLTECH-EQ", "7229"),
    ("JSWSTEEL-EQ", "11723"),
    ("TATASTEEL-EQ", "3499"),
    ("INDUSINDBK-EQ", "5258"),
    ("BAJAJFINSV-EQ", "16675"),
    ("M&M-EQ", "1207"),
    ("ADANIPORTS-EQ", "15083"),
    ("COALINDIA-EQ", "20374"),
    ("BRITANNIA-EQ", "547"),
    ("DRREDDY-EQ", "881"),
    ("EICHERMOT-EQ", "910"),
    ("GRASIM-EQ", "1232"),
    ("HEROMOTOCO-EQ", "1348"),
    ("HINDALCO-EQ", "1363"),
    ("CIPLA-EQ", "694"),
    ("BPCL-EQ", "526"),
    ("DIVISLAB-EQ", "10940"),
    ("TATACONSUM-EQ", "3432"),
    ("APOLLOHOSP-EQ", "157"),
    ("UPL-EQ", "11287"),
    ("SHREECEM-EQ", "3103"),
    ("ADANIENT-EQ", "25"),
    ("SBILIFE-EQ", "21808"),
    ("HDFCLIFE-EQ", "467"),
    ("VEDL-EQ", "3063"),
    ("SAIL-EQ", "2963"),
    ("YESBANK-EQ", "11915"),
];

/// NSE cash-equity symbols carry an `-EQ` suffix on the wire.
pub fn normalize_symbol(symbol: &str, exchange: Exchange) -> String {
    let symbol = symbol.trim().to_ascii_uppercase();
    if exchange == Exchange::Nse && !symbol.ends_with("-EQ") {
        format!("{symbol}-EQ")
    } else {
        symbol
    }
}

#[derive(Debug)]
pub struct InstrumentCache {
    tokens: RwLock<HashMap<(Exchange, String), String>>,
}

impl Default for InstrumentCache {
    fn default() -> Self {
        Self::new()
    }
}

impl InstrumentCache {
    pub fn new() -> Self {
        let mut tokens = HashMap::new();
        for (symbol, token) in NSE_SEED {
            tokens.insert((Exchange::Nse, symbol.to_string()), token.to_string());
        }
        Self {
            tokens: RwLock::new(tokens),
        }
    }

    /// Cache hit for a wire-formatted symbol, or `None` on a miss. The
    /// caller is expected to consult the broker's search endpoint on a
    /// miss and feed the answer back through [`InstrumentCache::insert`].
    pub fn get(&self, exchange: Exchange, symbol: &str) -> Option<String> {
        let tokens = self.tokens.read().unwrap_or_else(|e| e.into_inner());
        tokens.get(&(exchange, symbol.to_string())).cloned()
    }

    pub fn insert(&self, exchange: Exchange, symbol: String, token: String) {
        let mut tokens = self.tokens.write().unwrap_or_else(|e| e.into_inner());
        tokens.insert((exchange, symbol), token);
    }
}
