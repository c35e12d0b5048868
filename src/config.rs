//! Configuration management for the spot trading bot

use anyhow::Result;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::env;
use std::str::FromStr;
use std::time::Duration;

/// Bot configuration loaded from environment
#[derive(Debug, Clone)]
pub struct Config {
    /// Path to SQLite database
    pub database_path: String,

    /// Trading pair symbol, venue notation (e.g. "BTCUSDT")
    pub symbol: String,

    /// Quote asset of the pair (e.g. "USDT")
    pub quote_asset: String,

    /// Base asset of the pair (e.g. "BTC")
    pub base_asset: String,

    /// Take-profit threshold as a rate above entry (0.004 = 0.4%)
    pub take_profit_rate: Decimal,

    /// Stop-loss threshold as a rate below entry (0.003 = 0.3%)
    pub stop_loss_rate: Decimal,

    /// Estimated taker fee rate used for fee/PnL figures
    pub fee_rate: Decimal,

    /// Fraction of free cash committed per entry
    pub order_fraction: Decimal,

    /// Minimum free cash required to place an entry, in quote currency
    pub min_quote_order: Decimal,

    /// Minimum seconds a position must be held before take-profit may fire.
    /// Stop-loss is never gated.
    pub min_hold_seconds: i64,

    /// Scheduler cadence in seconds
    pub loop_interval_seconds: u64,

    /// Consecutive user-level failures that trigger the extended cooldown
    pub max_consecutive_failures: u32,

    /// Extended cooldown applied after repeated failures, in seconds
    pub failure_cooldown_seconds: u64,

    /// recvWindow sent with signed venue requests, in milliseconds
    pub recv_window_ms: u64,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        // Load .env file if present
        dotenvy::dotenv().ok();

        let database_path =
            env::var("DATABASE_PATH").unwrap_or_else(|_| "spot-bot.db".to_string());

        let symbol = env::var("BOT_SYMBOL").unwrap_or_else(|_| "BTCUSDT".to_string());

        let quote_asset = env::var("QUOTE_ASSET").unwrap_or_else(|_| "USDT".to_string());

        let base_asset = env::var("BASE_ASSET").unwrap_or_else(|_| "BTC".to_string());

        let take_profit_rate = env::var("TAKE_PROFIT")
            .ok()
            .and_then(|v| Decimal::from_str(&v).ok())
            .unwrap_or(dec!(0.004));

        let stop_loss_rate = env::var("STOP_LOSS")
            .ok()
            .and_then(|v| Decimal::from_str(&v).ok())
            .unwrap_or(dec!(0.003));

        let fee_rate = env::var("FEE_RATE_EST")
            .ok()
            .and_then(|v| Decimal::from_str(&v).ok())
            .unwrap_or(dec!(0.001));

        let order_fraction = env::var("ORDER_FRACTION")
            .ok()
            .and_then(|v| Decimal::from_str(&v).ok())
            .unwrap_or(Decimal::ONE);

        let min_quote_order = env::var("MIN_QUOTE_ORDER")
            .ok()
            .and_then(|v| Decimal::from_str(&v).ok())
            .unwrap_or_else(|| Decimal::from(10));

        let min_hold_seconds = env::var("MIN_HOLD_SECONDS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);

        let loop_interval_seconds = env::var("LOOP_INTERVAL_SECONDS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(15);

        let max_consecutive_failures = env::var("MAX_CONSECUTIVE_FAILURES")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(5);

        let failure_cooldown_seconds = env::var("FAILURE_COOLDOWN_SECONDS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(120);

        let recv_window_ms = env::var("RECV_WINDOW_MS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(5000);

        // Validate configuration
        if take_profit_rate <= Decimal::ZERO || stop_loss_rate <= Decimal::ZERO {
            anyhow::bail!("TAKE_PROFIT and STOP_LOSS must be positive rates");
        }
        if order_fraction <= Decimal::ZERO || order_fraction > Decimal::ONE {
            anyhow::bail!("ORDER_FRACTION must be in (0, 1]");
        }
        if loop_interval_seconds == 0 {
            anyhow::bail!("LOOP_INTERVAL_SECONDS must be positive");
        }

        Ok(Self {
            database_path,
            symbol,
            quote_asset,
            base_asset,
            take_profit_rate,
            stop_loss_rate,
            fee_rate,
            order_fraction,
            min_quote_order,
            min_hold_seconds,
            loop_interval_seconds,
            max_consecutive_failures,
            failure_cooldown_seconds,
            recv_window_ms,
        })
    }

    pub fn loop_interval(&self) -> Duration {
        Duration::from_secs(self.loop_interval_seconds)
    }

    pub fn failure_cooldown(&self) -> Duration {
        Duration::from_secs(self.failure_cooldown_seconds)
    }
}

impl Default for Config {
    /// Reference defaults, used by tests and as the from_env fallback values
    fn default() -> Self {
        Self {
            database_path: "spot-bot.db".to_string(),
            symbol: "BTCUSDT".to_string(),
            quote_asset: "USDT".to_string(),
            base_asset: "BTC".to_string(),
            take_profit_rate: dec!(0.004),
            stop_loss_rate: dec!(0.003),
            fee_rate: dec!(0.001),
            order_fraction: Decimal::ONE,
            min_quote_order: Decimal::from(10),
            min_hold_seconds: 0,
            loop_interval_seconds: 15,
            max_consecutive_failures: 5,
            failure_cooldown_seconds: 120,
            recv_window_ms: 5000,
        }
    }
}

/// Venue REST endpoints
pub struct BinanceApi;

impl BinanceApi {
    pub const BASE_URL: &'static str = "https://api.binance.com";
    pub const TESTNET_URL: &'static str = "https://testnet.binance.vision";

    pub fn base_url(sandbox: bool) -> &'static str {
        if sandbox {
            Self::TESTNET_URL
        } else {
            Self::BASE_URL
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_reference_parameters() {
        let config = Config::default();
        assert_eq!(config.take_profit_rate, dec!(0.004));
        assert_eq!(config.stop_loss_rate, dec!(0.003));
        assert_eq!(config.fee_rate, dec!(0.001));
        assert_eq!(config.min_quote_order, Decimal::from(10));
        assert_eq!(config.loop_interval_seconds, 15);
    }

    #[test]
    fn sandbox_selects_testnet() {
        assert_eq!(BinanceApi::base_url(true), BinanceApi::TESTNET_URL);
        assert_eq!(BinanceApi::base_url(false), BinanceApi::BASE_URL);
    }
}
