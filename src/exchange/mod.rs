//! Exchange adapter boundary
//!
//! The engine talks to the venue exclusively through the [`SpotExchange`]
//! capability trait; [`BinanceSpot`] is the production implementation and
//! tests substitute mocks. [`ExchangeConnector`] is the construction seam
//! the scheduler uses to build a per-user adapter from stored credentials.

pub mod binance;
pub mod error;
pub mod retry;

pub use binance::{BinanceConnector, BinanceSpot};
pub use error::ExchangeError;
pub use retry::{with_retry, RetryConfig};

use crate::types::Credentials;
use async_trait::async_trait;
use rust_decimal::Decimal;

/// The venue's report of an actually executed order
#[derive(Debug, Clone, PartialEq)]
pub struct Fill {
    pub order_id: String,
    /// Average fill price; falls back to the last observed ticker price
    /// when the venue omits it
    pub price: Decimal,
    /// Filled quantity; falls back to the requested quantity when the venue
    /// omits it
    pub qty: Decimal,
}

/// Venue capabilities consumed by the step engine
#[async_trait]
pub trait SpotExchange: Send + Sync {
    /// Last traded price for the symbol
    async fn fetch_price(&self, symbol: &str) -> Result<Decimal, ExchangeError>;

    /// Free (quote, base) balances. Ground truth, re-queried after every
    /// order; implementations retry this within a fixed bound.
    async fn fetch_free_balance(
        &self,
        quote: &str,
        base: &str,
    ) -> Result<(Decimal, Decimal), ExchangeError>;

    /// Round a raw quantity down to the venue's tradable precision.
    /// Quantities below the venue minimum round to zero.
    fn round_qty(&self, symbol: &str, raw_qty: Decimal) -> Decimal;

    async fn place_market_buy(&self, symbol: &str, qty: Decimal) -> Result<Fill, ExchangeError>;

    async fn place_market_sell(&self, symbol: &str, qty: Decimal) -> Result<Fill, ExchangeError>;
}

/// Builds a per-user [`SpotExchange`] from credentials. Construction failure
/// (bad credentials, unreachable venue) surfaces as
/// [`ExchangeError::Unavailable`] and aborts the step without touching state.
#[async_trait]
pub trait ExchangeConnector: Send + Sync {
    async fn connect(
        &self,
        credentials: &Credentials,
    ) -> Result<Box<dyn SpotExchange>, ExchangeError>;
}
