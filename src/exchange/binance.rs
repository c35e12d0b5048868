//! Binance spot REST adapter
//!
//! Signed endpoints follow the venue's HMAC-SHA256 query-string scheme with
//! `timestamp` + `recvWindow`. The clock offset against the venue is
//! measured once at construction and biases every subsequent request
//! timestamp for the adapter's lifetime; venues reject requests whose
//! timestamp drifts beyond tolerance.

use super::error::ExchangeError;
use super::retry::{with_retry, RetryConfig};
use super::{ExchangeConnector, Fill, SpotExchange};
use crate::config::{BinanceApi, Config};
use crate::types::Credentials;
use async_trait::async_trait;
use chrono::Utc;
use hmac::{Hmac, Mac};
use rust_decimal::{Decimal, RoundingStrategy};
use serde::Deserialize;
use sha2::Sha256;
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Mutex;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

const HTTP_TIMEOUT: Duration = Duration::from_secs(10);

/// Fixed-delay retry for the post-order balance re-query (ground truth)
const BALANCE_RETRY_ATTEMPTS: u32 = 3;
const BALANCE_RETRY_DELAY_MS: u64 = 500;

type HmacSha256 = Hmac<Sha256>;

/// Venue LOT_SIZE filter for one symbol
#[derive(Debug, Clone)]
pub struct LotSizeFilter {
    pub min_qty: Decimal,
    pub step_size: Decimal,
}

/// Binance spot adapter bound to one user's credentials
pub struct BinanceSpot {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    api_secret: String,
    recv_window_ms: u64,
    /// serverTime − local clock, measured once at construction
    time_offset_ms: i64,
    lot_sizes: HashMap<String, LotSizeFilter>,
    /// Last observed ticker price, the fill-price fallback
    last_price: Mutex<Option<Decimal>>,
    balance_retry: RetryConfig,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ServerTime {
    server_time: i64,
}

#[derive(Debug, Deserialize)]
struct ExchangeInfo {
    symbols: Vec<SymbolInfo>,
}

#[derive(Debug, Deserialize)]
struct SymbolInfo {
    symbol: String,
    filters: Vec<SymbolFilter>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SymbolFilter {
    filter_type: String,
    #[serde(default)]
    min_qty: Option<String>,
    #[serde(default)]
    step_size: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TickerPrice {
    price: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AccountResponse {
    balances: Vec<AccountBalance>,
}

#[derive(Debug, Deserialize)]
struct AccountBalance {
    asset: String,
    free: String,
}

/// Venue order acknowledgment. Fill figures are optional: the MARKET
/// response may omit or zero them, in which case we fall back per the
/// adapter contract.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OrderResponse {
    order_id: u64,
    #[serde(default)]
    executed_qty: Option<String>,
    #[serde(default)]
    cummulative_quote_qty: Option<String>,
    #[serde(default)]
    fills: Vec<OrderFillLine>,
}

#[derive(Debug, Deserialize)]
struct OrderFillLine {
    price: String,
    qty: String,
}

impl BinanceSpot {
    /// Build an adapter for one user: HTTP client, clock-offset measurement
    /// and the symbol's LOT_SIZE filter. Any failure here is
    /// `ExchangeError::Unavailable` and the caller's step aborts without
    /// touching state.
    pub async fn connect(credentials: &Credentials, config: &Config) -> Result<Self, ExchangeError> {
        let http = reqwest::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .map_err(|e| ExchangeError::Unavailable(format!("http client: {e}")))?;

        let base_url = BinanceApi::base_url(credentials.sandbox).to_string();

        // Reject unusable secrets before the first signed call
        sign_payload(&credentials.api_secret, "probe")
            .map_err(|_| ExchangeError::Unavailable("unusable API secret".to_string()))?;

        let time_offset_ms = Self::measure_clock_offset(&http, &base_url).await?;
        debug!("venue clock offset measured: {}ms", time_offset_ms);

        let lot_sizes = Self::load_lot_sizes(&http, &base_url, &config.symbol).await?;
        info!(
            "connected to {} ({} LOT_SIZE filter(s) loaded)",
            base_url,
            lot_sizes.len()
        );

        Ok(Self {
            http,
            base_url,
            api_key: credentials.api_key.clone(),
            api_secret: credentials.api_secret.clone(),
            recv_window_ms: config.recv_window_ms,
            time_offset_ms,
            lot_sizes,
            last_price: Mutex::new(None),
            balance_retry: RetryConfig::fixed(BALANCE_RETRY_ATTEMPTS, BALANCE_RETRY_DELAY_MS),
        })
    }

    async fn measure_clock_offset(
        http: &reqwest::Client,
        base_url: &str,
    ) -> Result<i64, ExchangeError> {
        let server: ServerTime = http
            .get(format!("{base_url}/api/v3/time"))
            .send()
            .await
            .map_err(|e| ExchangeError::Unavailable(format!("time sync: {e}")))?
            .json()
            .await
            .map_err(|e| ExchangeError::Unavailable(format!("time sync: {e}")))?;

        Ok(server.server_time - Utc::now().timestamp_millis())
    }

    async fn load_lot_sizes(
        http: &reqwest::Client,
        base_url: &str,
        symbol: &str,
    ) -> Result<HashMap<String, LotSizeFilter>, ExchangeError> {
        let info: ExchangeInfo = http
            .get(format!("{base_url}/api/v3/exchangeInfo?symbol={symbol}"))
            .send()
            .await
            .map_err(|e| ExchangeError::Unavailable(format!("exchangeInfo: {e}")))?
            .json()
            .await
            .map_err(|e| ExchangeError::Unavailable(format!("exchangeInfo: {e}")))?;

        let mut lot_sizes = HashMap::new();
        for sym in info.symbols {
            let Some(filter) = sym.filters.iter().find(|f| f.filter_type == "LOT_SIZE") else {
                continue;
            };
            let min_qty = filter
                .min_qty
                .as_deref()
                .and_then(|v| Decimal::from_str(v).ok())
                .unwrap_or(Decimal::ZERO);
            let step_size = filter
                .step_size
                .as_deref()
                .and_then(|v| Decimal::from_str(v).ok())
                .unwrap_or(Decimal::ZERO);
            lot_sizes.insert(sym.symbol, LotSizeFilter { min_qty, step_size });
        }

        Ok(lot_sizes)
    }

    /// Timestamp biased by the one-time clock offset
    fn timestamp_ms(&self) -> i64 {
        Utc::now().timestamp_millis() + self.time_offset_ms
    }

    fn signed_url(&self, endpoint: &str, params: &str) -> Result<String, ExchangeError> {
        let suffix = format!(
            "timestamp={}&recvWindow={}",
            self.timestamp_ms(),
            self.recv_window_ms
        );
        let query = if params.is_empty() {
            suffix
        } else {
            format!("{params}&{suffix}")
        };
        let signature = sign_payload(&self.api_secret, &query)?;
        Ok(format!(
            "{}{}?{}&signature={}",
            self.base_url, endpoint, query, signature
        ))
    }

    async fn account_free_balance(
        &self,
        quote: &str,
        base: &str,
    ) -> Result<(Decimal, Decimal), ExchangeError> {
        let url = self.signed_url("/api/v3/account", "")?;
        let response = self
            .http
            .get(&url)
            .header("X-MBX-APIKEY", &self.api_key)
            .send()
            .await
            .map_err(|e| ExchangeError::from_network_error(&e))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| ExchangeError::from_network_error(&e))?;

        if !status.is_success() {
            return Err(ExchangeError::from_response(status.as_u16(), &text));
        }

        let account: AccountResponse = serde_json::from_str(&text)
            .map_err(|e| ExchangeError::InvalidResponse(format!("account: {e}")))?;

        let free = |asset: &str| {
            account
                .balances
                .iter()
                .find(|b| b.asset == asset)
                .and_then(|b| Decimal::from_str(&b.free).ok())
                .unwrap_or(Decimal::ZERO)
        };

        Ok((free(quote), free(base)))
    }

    async fn place_market(
        &self,
        symbol: &str,
        side: &str,
        qty: Decimal,
    ) -> Result<Fill, ExchangeError> {
        let client_order_id = Uuid::new_v4().simple().to_string();
        let params = format!(
            "symbol={symbol}&side={side}&type=MARKET&quantity={qty}&newClientOrderId={client_order_id}"
        );
        let url = self.signed_url("/api/v3/order", &params)?;

        let response = self
            .http
            .post(&url)
            .header("X-MBX-APIKEY", &self.api_key)
            .send()
            .await
            .map_err(|e| ExchangeError::from_network_error(&e))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| ExchangeError::from_network_error(&e))?;

        if !status.is_success() {
            return Err(ExchangeError::from_response(status.as_u16(), &text));
        }

        let order: OrderResponse = serde_json::from_str(&text)
            .map_err(|e| ExchangeError::InvalidResponse(format!("order: {e}")))?;

        let fallback_price = *self.last_price.lock().unwrap();
        resolve_fill(order, qty, fallback_price)
    }
}

#[async_trait]
impl SpotExchange for BinanceSpot {
    async fn fetch_price(&self, symbol: &str) -> Result<Decimal, ExchangeError> {
        let url = format!("{}/api/v3/ticker/price?symbol={symbol}", self.base_url);
        let response = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| ExchangeError::PriceUnavailable(e.to_string()))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| ExchangeError::PriceUnavailable(e.to_string()))?;

        if !status.is_success() {
            return Err(ExchangeError::PriceUnavailable(format!(
                "venue {status}: {}",
                text.chars().take(200).collect::<String>()
            )));
        }

        let ticker: TickerPrice = serde_json::from_str(&text)
            .map_err(|e| ExchangeError::PriceUnavailable(format!("ticker parse: {e}")))?;
        let price = Decimal::from_str(&ticker.price)
            .map_err(|e| ExchangeError::PriceUnavailable(format!("ticker parse: {e}")))?;

        *self.last_price.lock().unwrap() = Some(price);
        Ok(price)
    }

    async fn fetch_free_balance(
        &self,
        quote: &str,
        base: &str,
    ) -> Result<(Decimal, Decimal), ExchangeError> {
        with_retry(&self.balance_retry, "fetch_free_balance", || {
            self.account_free_balance(quote, base)
        })
        .await
    }

    fn round_qty(&self, symbol: &str, raw_qty: Decimal) -> Decimal {
        match self.lot_sizes.get(symbol) {
            Some(filter) => clamp_to_lot(filter, raw_qty),
            None => {
                warn!("LOT_SIZE filter not found for {symbol}, flooring to 8 decimals");
                raw_qty
                    .round_dp_with_strategy(8, RoundingStrategy::ToZero)
                    .normalize()
            }
        }
    }

    async fn place_market_buy(&self, symbol: &str, qty: Decimal) -> Result<Fill, ExchangeError> {
        self.place_market(symbol, "BUY", qty).await
    }

    async fn place_market_sell(&self, symbol: &str, qty: Decimal) -> Result<Fill, ExchangeError> {
        self.place_market(symbol, "SELL", qty).await
    }
}

/// Builds a [`BinanceSpot`] per user; the scheduler's construction seam
pub struct BinanceConnector {
    config: Config,
}

impl BinanceConnector {
    pub fn new(config: Config) -> Self {
        Self { config }
    }
}

#[async_trait]
impl ExchangeConnector for BinanceConnector {
    async fn connect(
        &self,
        credentials: &Credentials,
    ) -> Result<Box<dyn SpotExchange>, ExchangeError> {
        let adapter = BinanceSpot::connect(credentials, &self.config).await?;
        Ok(Box::new(adapter))
    }
}

/// HMAC-SHA256 hex signature over the raw query string
fn sign_payload(secret: &str, payload: &str) -> Result<String, ExchangeError> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|_| ExchangeError::AuthenticationFailed("unusable API secret".to_string()))?;
    mac.update(payload.as_bytes());
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Floor a raw quantity onto the LOT_SIZE step grid. Below minQty rounds to
/// zero rather than placing an order the venue would reject.
fn clamp_to_lot(filter: &LotSizeFilter, qty: Decimal) -> Decimal {
    if qty <= Decimal::ZERO {
        return Decimal::ZERO;
    }

    let mut qty = qty.round_dp_with_strategy(8, RoundingStrategy::ToZero);

    if filter.step_size > Decimal::ZERO {
        qty = (qty / filter.step_size).floor() * filter.step_size;
    }

    if qty < filter.min_qty {
        return Decimal::ZERO;
    }

    qty.normalize()
}

/// Derive the reported fill from a venue acknowledgment. Average price is
/// cummulativeQuoteQty / executedQty when present, then the weighted fill
/// lines, then the last observed ticker price; quantity falls back to the
/// requested amount.
fn resolve_fill(
    order: OrderResponse,
    requested_qty: Decimal,
    last_price: Option<Decimal>,
) -> Result<Fill, ExchangeError> {
    let executed = order
        .executed_qty
        .as_deref()
        .and_then(|q| Decimal::from_str(q).ok())
        .filter(|q| *q > Decimal::ZERO);
    let quote_spent = order
        .cummulative_quote_qty
        .as_deref()
        .and_then(|q| Decimal::from_str(q).ok())
        .filter(|q| *q > Decimal::ZERO);

    let qty = executed.unwrap_or(requested_qty);

    let price = match (quote_spent, executed) {
        (Some(quote), Some(filled)) => quote / filled,
        _ => weighted_fill_price(&order.fills)
            .or(last_price)
            .ok_or_else(|| {
                ExchangeError::InvalidResponse(
                    "order response carries no fill price and no ticker was observed".to_string(),
                )
            })?,
    };

    Ok(Fill {
        order_id: order.order_id.to_string(),
        price,
        qty,
    })
}

fn weighted_fill_price(fills: &[OrderFillLine]) -> Option<Decimal> {
    let mut total_qty = Decimal::ZERO;
    let mut total_quote = Decimal::ZERO;
    for line in fills {
        let price = Decimal::from_str(&line.price).ok()?;
        let qty = Decimal::from_str(&line.qty).ok()?;
        total_qty += qty;
        total_quote += price * qty;
    }
    if total_qty > Decimal::ZERO {
        Some(total_quote / total_qty)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    // Reference vector from the venue's API documentation
    #[test]
    fn signature_matches_known_vector() {
        let secret = "NhqPtmdSJYdKjVHjA7PZj4Mge3R5YNiP1e3UZjInClVN65XAbvqqM6A7H5fATj0j";
        let payload = "symbol=LTCBTC&side=BUY&type=LIMIT&timeInForce=GTC&quantity=1&price=0.1&recvWindow=5000&timestamp=1499827319559";
        assert_eq!(
            sign_payload(secret, payload).unwrap(),
            "c8db56825ae71d6d79447849e617115f4a920fa2acdcab2b053c4b2838bd6b71"
        );
    }

    #[test]
    fn clamp_floors_onto_step_grid() {
        let filter = LotSizeFilter {
            min_qty: dec!(0.00001),
            step_size: dec!(0.00001),
        };
        assert_eq!(clamp_to_lot(&filter, dec!(0.000123456789)), dec!(0.00012));
        assert_eq!(clamp_to_lot(&filter, dec!(1.5)), dec!(1.5));
    }

    #[test]
    fn clamp_rounds_below_minimum_to_zero() {
        let filter = LotSizeFilter {
            min_qty: dec!(0.001),
            step_size: dec!(0.001),
        };
        assert_eq!(clamp_to_lot(&filter, dec!(0.0004)), Decimal::ZERO);
        assert_eq!(clamp_to_lot(&filter, dec!(-1)), Decimal::ZERO);
    }

    #[test]
    fn fill_uses_quote_over_executed_when_present() {
        let order = OrderResponse {
            order_id: 42,
            executed_qty: Some("2".to_string()),
            cummulative_quote_qty: Some("201".to_string()),
            fills: vec![],
        };
        let fill = resolve_fill(order, dec!(2), None).unwrap();
        assert_eq!(fill.order_id, "42");
        assert_eq!(fill.price, dec!(100.5));
        assert_eq!(fill.qty, dec!(2));
    }

    #[test]
    fn fill_falls_back_to_weighted_fill_lines() {
        let order = OrderResponse {
            order_id: 7,
            executed_qty: None,
            cummulative_quote_qty: None,
            fills: vec![
                OrderFillLine {
                    price: "100".to_string(),
                    qty: "1".to_string(),
                },
                OrderFillLine {
                    price: "102".to_string(),
                    qty: "1".to_string(),
                },
            ],
        };
        let fill = resolve_fill(order, dec!(2), None).unwrap();
        assert_eq!(fill.price, dec!(101));
        assert_eq!(fill.qty, dec!(2));
    }

    #[test]
    fn fill_falls_back_to_last_ticker_and_requested_qty() {
        let order = OrderResponse {
            order_id: 9,
            executed_qty: Some("0".to_string()),
            cummulative_quote_qty: None,
            fills: vec![],
        };
        let fill = resolve_fill(order, dec!(0.5), Some(dec!(99.9))).unwrap();
        assert_eq!(fill.price, dec!(99.9));
        assert_eq!(fill.qty, dec!(0.5));

        let order = OrderResponse {
            order_id: 9,
            executed_qty: None,
            cummulative_quote_qty: None,
            fills: vec![],
        };
        assert!(resolve_fill(order, dec!(0.5), None).is_err());
    }
}
