//! Funding collaborator boundary
//!
//! The funds ledger (deposits, withdrawals, approvals) lives outside this
//! core. All the trading engine ever consumes from it is a single
//! available-funds figure, used only to seed a user's trading cash on the
//! very first step when the venue reports no quote balance.

use crate::types::UserId;
use anyhow::Result;
use async_trait::async_trait;
use rust_decimal::Decimal;

/// Read-only view of a user's available funds
#[async_trait]
pub trait FundingSource: Send + Sync {
    async fn available_funds(&self, user_id: UserId) -> Result<Decimal>;
}
