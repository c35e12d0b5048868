//! Core types for the spot trading bot

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

/// User identifier, shared with the account system that owns the users table
pub type UserId = i64;

/// Trading side
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Buy => "BUY",
            Side::Sell => "SELL",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "BUY" => Some(Side::Buy),
            "SELL" => Some(Side::Sell),
            _ => None,
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Why a trade was placed. Stored verbatim in the trade history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TradeReason {
    AutoBuy,
    TakeProfit,
    StopLoss,
}

impl TradeReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            TradeReason::AutoBuy => "BUY_AUTO",
            TradeReason::TakeProfit => "TAKE_PROFIT",
            TradeReason::StopLoss => "STOP_LOSS",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "BUY_AUTO" => Some(TradeReason::AutoBuy),
            "TAKE_PROFIT" => Some(TradeReason::TakeProfit),
            "STOP_LOSS" => Some(TradeReason::StopLoss),
            _ => None,
        }
    }
}

impl fmt::Display for TradeReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// The open lot backing a LONG position.
///
/// Invariant: `qty > 0`. Constructed only through [`EntryLot::new`], which
/// rejects non-positive quantities, so a `Position::Long` can never carry an
/// empty entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntryLot {
    pub price: Decimal,
    pub qty: Decimal,
    pub time: DateTime<Utc>,
}

impl EntryLot {
    pub fn new(price: Decimal, qty: Decimal, time: DateTime<Utc>) -> Option<Self> {
        if qty <= Decimal::ZERO {
            return None;
        }
        Some(Self { price, qty, time })
    }

    /// Notional cost of the lot at entry
    pub fn cost(&self) -> Decimal {
        self.price * self.qty
    }

    /// Seconds this lot has been held as of `now`
    pub fn held_seconds(&self, now: DateTime<Utc>) -> i64 {
        (now - self.time).num_seconds()
    }
}

/// Position state. FLAT carries no entry data; LONG always carries a lot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Position {
    Flat,
    Long(EntryLot),
}

impl Position {
    pub fn is_long(&self) -> bool {
        matches!(self, Position::Long(_))
    }

    pub fn entry(&self) -> Option<&EntryLot> {
        match self {
            Position::Flat => None,
            Position::Long(lot) => Some(lot),
        }
    }
}

/// Per-user trading state, mirrored from the venue and persisted between steps
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BotState {
    pub user_id: UserId,
    pub enabled: bool,
    /// Free quote-currency balance mirror (e.g. USDT)
    pub cash: Decimal,
    /// Free base-currency balance mirror (e.g. BTC)
    pub asset: Decimal,
    pub position: Position,
    pub last_step_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl BotState {
    /// Fresh FLAT state seeded from the given balances
    pub fn seeded(user_id: UserId, cash: Decimal, asset: Decimal, now: DateTime<Utc>) -> Self {
        Self {
            user_id,
            enabled: true,
            cash,
            asset,
            position: Position::Flat,
            last_step_at: None,
            last_error: None,
            updated_at: now,
        }
    }
}

/// One executed order, appended to the per-user trade history.
/// Rows are written exactly once and never mutated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeRecord {
    pub time: DateTime<Utc>,
    pub symbol: String,
    pub side: Side,
    pub price: Decimal,
    pub qty: Decimal,
    /// Estimated fee in quote currency
    pub fee: Decimal,
    /// Free quote balance after the trade settled
    pub cash_after: Decimal,
    /// Free base balance after the trade settled
    pub asset_after: Decimal,
    pub reason: TradeReason,
    /// Realized PnL in quote currency; sells only
    pub pnl: Option<Decimal>,
    pub order_id: Option<String>,
}

/// Venue API credentials for one user. Read-only to the trading core;
/// written only through the operator path.
#[derive(Debug, Clone)]
pub struct Credentials {
    pub api_key: String,
    pub api_secret: String,
    pub sandbox: bool,
}

/// What a single engine step did, for logging and the scheduler
#[derive(Debug, Clone, PartialEq)]
pub enum StepOutcome {
    /// First-ever step: state seeded from venue balances, no order placed
    Seeded,
    /// Bot disabled; nothing evaluated
    Disabled,
    /// FLAT with insufficient cash; timestamp advanced only
    Idle,
    /// Market buy filled and position opened.
    /// `reconciled` is false when post-order balances are estimates.
    Entered { reconciled: bool },
    /// LONG with no exit trigger met
    Held,
    /// Position liquidated on an exit trigger
    Exited {
        reason: TradeReason,
        pnl: Decimal,
        reconciled: bool,
    },
}

/// Aggregate trade performance for one user, derived from sell history
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TradeStats {
    pub sells: i64,
    pub wins: i64,
    pub losses: i64,
    pub realized_pnl: Decimal,
}

impl TradeStats {
    pub fn win_rate(&self) -> f64 {
        let total = self.wins + self.losses;
        if total == 0 {
            return 0.0;
        }
        self.wins as f64 / total as f64 * 100.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn entry_lot_rejects_non_positive_qty() {
        assert!(EntryLot::new(dec!(100), Decimal::ZERO, Utc::now()).is_none());
        assert!(EntryLot::new(dec!(100), dec!(-1), Utc::now()).is_none());
        assert!(EntryLot::new(dec!(100), dec!(0.5), Utc::now()).is_some());
    }

    #[test]
    fn flat_position_has_no_entry() {
        assert!(Position::Flat.entry().is_none());
        let lot = EntryLot::new(dec!(100), dec!(1), Utc::now()).unwrap();
        let long = Position::Long(lot.clone());
        assert!(long.is_long());
        assert_eq!(long.entry().unwrap().qty, dec!(1));
    }

    #[test]
    fn reason_round_trips_through_strings() {
        for reason in [TradeReason::AutoBuy, TradeReason::TakeProfit, TradeReason::StopLoss] {
            assert_eq!(TradeReason::from_str(reason.as_str()), Some(reason));
        }
        assert_eq!(TradeReason::from_str("OTHER"), None);
    }

    #[test]
    fn win_rate_handles_empty_history() {
        let stats = TradeStats::default();
        assert_eq!(stats.win_rate(), 0.0);

        let stats = TradeStats {
            sells: 4,
            wins: 3,
            losses: 1,
            realized_pnl: dec!(1.5),
        };
        assert_eq!(stats.win_rate(), 75.0);
    }
}
