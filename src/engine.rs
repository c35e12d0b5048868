//! Step engine: the per-user trading state machine
//!
//! One call evaluates exactly one user for exactly one step and places at
//! most one order. Transitions:
//!
//! - no state row -> FLAT, seeded from the venue's real free balances
//! - FLAT with cash below the minimum -> FLAT (timestamp advances only)
//! - FLAT with cash -> LONG via market buy
//! - LONG -> LONG while no exit trigger is met
//! - LONG -> FLAT on STOP_LOSS (always eligible) or TAKE_PROFIT (hold-gated),
//!   stop-loss winning when both are satisfied
//!
//! After every order the venue's balances are re-queried as ground truth;
//! if that re-query fails the trade is still recorded with estimated
//! balances, flagged through `last_error`. All other adapter failures leave
//! state untouched except `last_error`/`last_step_at`.

use crate::config::Config;
use crate::db::Database;
use crate::exchange::{ExchangeError, SpotExchange};
use crate::funding::FundingSource;
use crate::types::{
    BotState, EntryLot, Position, Side, StepOutcome, TradeReason, TradeRecord, UserId,
};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};

pub(crate) const MAX_ERROR_LEN: usize = 500;

/// Failures that abort a step. The engine has already written `last_error`
/// before returning one of these; the scheduler only counts them.
#[derive(Debug, Error)]
pub enum StepError {
    #[error(transparent)]
    Exchange(#[from] ExchangeError),
    #[error("store error: {0}")]
    Store(String),
}

fn store_err(err: anyhow::Error) -> StepError {
    StepError::Store(err.to_string())
}

pub struct StepEngine {
    db: Arc<Database>,
    config: Config,
}

impl StepEngine {
    pub fn new(db: Arc<Database>, config: Config) -> Self {
        Self { db, config }
    }

    /// Run one step for one user against an already-constructed adapter
    pub async fn step(
        &self,
        user_id: UserId,
        venue: &dyn SpotExchange,
        funding: Option<&dyn FundingSource>,
    ) -> Result<StepOutcome, StepError> {
        let now = Utc::now();

        let state = self.db.get_state(user_id).await.map_err(store_err)?;
        let Some(mut state) = state else {
            return self.initialize(user_id, venue, funding, None, now).await;
        };

        if !state.enabled {
            return Ok(StepOutcome::Disabled);
        }

        // A row created on first enable starts zeroed and has never stepped;
        // its first step seeds from the venue exactly like a missing row.
        if state.last_step_at.is_none() && !state.position.is_long() {
            return self.initialize(user_id, venue, funding, Some(state), now).await;
        }

        let price = match venue.fetch_price(&self.config.symbol).await {
            Ok(price) => price,
            Err(err) => {
                self.record_failure(&mut state, &err, now).await;
                return Err(err.into());
            }
        };

        match state.position.clone() {
            Position::Flat => self.step_flat(state, venue, price, now).await,
            Position::Long(lot) => self.step_long(state, lot, venue, price, now).await,
        }
    }

    /// First-ever step: seed cash/asset from the venue, place no order.
    /// A balance failure here aborts without creating the row; persisting a
    /// zeroed mirror would turn a transient outage into wrong state.
    async fn initialize(
        &self,
        user_id: UserId,
        venue: &dyn SpotExchange,
        funding: Option<&dyn FundingSource>,
        existing: Option<BotState>,
        now: DateTime<Utc>,
    ) -> Result<StepOutcome, StepError> {
        let balances = venue
            .fetch_free_balance(&self.config.quote_asset, &self.config.base_asset)
            .await;
        let (mut cash, asset) = match balances {
            Ok(balances) => balances,
            Err(err) => {
                // With no row yet there is nowhere to record the error;
                // the next cycle retries from scratch.
                if let Some(mut state) = existing {
                    self.record_failure(&mut state, &err, now).await;
                }
                return Err(err.into());
            }
        };

        if cash == Decimal::ZERO {
            if let Some(funding) = funding {
                match funding.available_funds(user_id).await {
                    Ok(funds) if funds > Decimal::ZERO => cash = funds,
                    Ok(_) => {}
                    Err(err) => warn!("[user {user_id}] funding source unavailable: {err}"),
                }
            }
        }

        let mut state = BotState::seeded(user_id, cash, asset, now);
        state.last_step_at = Some(now);
        self.db.upsert_state(&state).await.map_err(store_err)?;

        info!("[user {user_id}] state seeded: cash={cash} asset={asset}");
        Ok(StepOutcome::Seeded)
    }

    async fn step_flat(
        &self,
        mut state: BotState,
        venue: &dyn SpotExchange,
        price: Decimal,
        now: DateTime<Utc>,
    ) -> Result<StepOutcome, StepError> {
        if state.cash < self.config.min_quote_order {
            self.commit_noop(&mut state, now).await?;
            return Ok(StepOutcome::Idle);
        }

        let spend = state.cash * self.config.order_fraction;
        let raw_qty = spend / price;
        let qty = venue.round_qty(&self.config.symbol, raw_qty);
        if qty <= Decimal::ZERO {
            let err = ExchangeError::OrderRejected {
                code: -1013,
                message: format!("quantity {raw_qty} rounds below the venue minimum"),
            };
            self.record_failure(&mut state, &err, now).await;
            return Err(err.into());
        }

        let fill = match venue.place_market_buy(&self.config.symbol, qty).await {
            Ok(fill) => fill,
            Err(err) => {
                self.record_failure(&mut state, &err, now).await;
                return Err(err.into());
            }
        };

        let Some(lot) = EntryLot::new(fill.price, fill.qty, now) else {
            let err = ExchangeError::InvalidResponse(
                "venue reported a non-positive buy fill quantity".to_string(),
            );
            self.record_failure(&mut state, &err, now).await;
            return Err(err.into());
        };

        let gross = fill.price * fill.qty;
        let fee = gross * self.config.fee_rate;

        // The order executed; balances are ground truth, estimates only if
        // the reconciliation re-query is down.
        let user_id = state.user_id;
        let (cash_after, asset_after, reconciled) = match venue
            .fetch_free_balance(&self.config.quote_asset, &self.config.base_asset)
            .await
        {
            Ok((cash, asset)) => (cash, asset, true),
            Err(err) => {
                warn!("[user {user_id}] balance reconciliation failed after buy: {err}");
                (state.cash - gross, state.asset + fill.qty, false)
            }
        };

        state.cash = cash_after;
        state.asset = asset_after;
        state.position = Position::Long(lot);
        state.last_step_at = Some(now);
        state.last_error = reconciliation_note(reconciled);
        state.updated_at = now;

        let trade = TradeRecord {
            time: now,
            symbol: self.config.symbol.clone(),
            side: Side::Buy,
            price: fill.price,
            qty: fill.qty,
            fee,
            cash_after,
            asset_after,
            reason: TradeReason::AutoBuy,
            pnl: None,
            order_id: Some(fill.order_id),
        };
        self.db
            .record_step(&state, Some(&trade))
            .await
            .map_err(store_err)?;

        info!(
            "[user {user_id}] BUY @ {} qty={} fee={}",
            fill.price, fill.qty, fee
        );
        Ok(StepOutcome::Entered { reconciled })
    }

    async fn step_long(
        &self,
        mut state: BotState,
        lot: EntryLot,
        venue: &dyn SpotExchange,
        price: Decimal,
        now: DateTime<Utc>,
    ) -> Result<StepOutcome, StepError> {
        let Some(reason) = self.exit_trigger(&lot, price, now) else {
            self.commit_noop(&mut state, now).await?;
            return Ok(StepOutcome::Held);
        };

        // Never sell the cached mirror; re-query what the account really holds
        let user_id = state.user_id;
        let held = match venue
            .fetch_free_balance(&self.config.quote_asset, &self.config.base_asset)
            .await
        {
            Ok((_, held)) => held,
            Err(err) => {
                self.record_failure(&mut state, &err, now).await;
                return Err(err.into());
            }
        };

        let qty = venue.round_qty(&self.config.symbol, held);
        if qty <= Decimal::ZERO {
            let err = ExchangeError::OrderRejected {
                code: -1013,
                message: format!("held quantity {held} rounds below the venue minimum"),
            };
            self.record_failure(&mut state, &err, now).await;
            return Err(err.into());
        }

        let fill = match venue.place_market_sell(&self.config.symbol, qty).await {
            Ok(fill) => fill,
            Err(err) => {
                self.record_failure(&mut state, &err, now).await;
                return Err(err.into());
            }
        };

        let gross = fill.price * fill.qty;
        let fee = gross * self.config.fee_rate;
        let pnl = (gross - fee) - lot.cost();

        let (cash_after, asset_after, reconciled) = match venue
            .fetch_free_balance(&self.config.quote_asset, &self.config.base_asset)
            .await
        {
            Ok((cash, asset)) => (cash, asset, true),
            Err(err) => {
                warn!("[user {user_id}] balance reconciliation failed after sell: {err}");
                let remaining = (held - fill.qty).max(Decimal::ZERO);
                (state.cash + gross - fee, remaining, false)
            }
        };

        state.cash = cash_after;
        state.asset = asset_after;
        state.position = Position::Flat;
        state.last_step_at = Some(now);
        state.last_error = reconciliation_note(reconciled);
        state.updated_at = now;

        let trade = TradeRecord {
            time: now,
            symbol: self.config.symbol.clone(),
            side: Side::Sell,
            price: fill.price,
            qty: fill.qty,
            fee,
            cash_after,
            asset_after,
            reason,
            pnl: Some(pnl),
            order_id: Some(fill.order_id),
        };
        self.db
            .record_step(&state, Some(&trade))
            .await
            .map_err(store_err)?;

        info!(
            "[user {user_id}] SELL ({reason}) @ {} qty={} pnl={pnl}",
            fill.price, fill.qty
        );
        Ok(StepOutcome::Exited {
            reason,
            pnl,
            reconciled,
        })
    }

    /// Exit triggers in strict priority: stop-loss first, regardless of the
    /// hold gate; take-profit only once the minimum hold has elapsed.
    fn exit_trigger(
        &self,
        lot: &EntryLot,
        price: Decimal,
        now: DateTime<Utc>,
    ) -> Option<TradeReason> {
        let stop = lot.price * (Decimal::ONE - self.config.stop_loss_rate);
        if price <= stop {
            return Some(TradeReason::StopLoss);
        }

        let target = lot.price * (Decimal::ONE + self.config.take_profit_rate);
        if lot.held_seconds(now) >= self.config.min_hold_seconds && price >= target {
            return Some(TradeReason::TakeProfit);
        }

        None
    }

    /// A step that placed no order: the timestamp advances, a previous error
    /// clears, everything else stays as it was.
    async fn commit_noop(&self, state: &mut BotState, now: DateTime<Utc>) -> Result<(), StepError> {
        state.last_step_at = Some(now);
        state.last_error = None;
        state.updated_at = now;
        self.db.upsert_state(state).await.map_err(store_err)
    }

    /// Write the failure to `last_error`/`last_step_at` without touching the
    /// rest of the state. A store failure here is only logged; the original
    /// error is what the caller needs to see.
    async fn record_failure(&self, state: &mut BotState, err: &ExchangeError, now: DateTime<Utc>) {
        let user_id = state.user_id;
        state.last_error = Some(err.to_string().chars().take(MAX_ERROR_LEN).collect());
        state.last_step_at = Some(now);
        state.updated_at = now;
        if let Err(db_err) = self.db.upsert_state(state).await {
            warn!("[user {user_id}] failed to record step error: {db_err}");
        }
    }
}

fn reconciliation_note(reconciled: bool) -> Option<String> {
    if reconciled {
        None
    } else {
        Some("balance reconciliation failed; balances estimated".to_string())
    }
}
