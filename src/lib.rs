//! Spot Trading Bot Library
//!
//! An unattended per-user spot trading agent. For every enabled user the
//! scheduler loop watches one trading pair, enters with a market buy and
//! exits on a take-profit or stop-loss threshold, persisting all state in
//! SQLite so it survives restarts and process separation.
//!
//! The pieces, leaves first: the state store ([`db::Database`]), the venue
//! adapter behind [`exchange::SpotExchange`], the per-user state machine
//! ([`engine::StepEngine`]) and the multi-tenant loop
//! ([`scheduler::Scheduler`]).

pub mod config;
pub mod db;
pub mod engine;
pub mod exchange;
pub mod funding;
pub mod scheduler;
pub mod types;

pub use config::Config;
pub use db::Database;
pub use engine::{StepEngine, StepError};
pub use exchange::{
    BinanceConnector, BinanceSpot, ExchangeConnector, ExchangeError, Fill, SpotExchange,
};
pub use funding::FundingSource;
pub use scheduler::Scheduler;
pub use types::{BotState, Credentials, Position, Side, StepOutcome, TradeReason, TradeRecord};
