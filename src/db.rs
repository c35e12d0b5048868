//! SQLite state store for per-user bot state, trade history and credentials
//!
//! The scheduler process owns all state transitions; a presentation process
//! may read the same file concurrently (WAL). Every transition is committed
//! through [`Database::record_step`] so a state update and its trade row
//! land in one transaction.

use crate::types::{
    BotState, Credentials, EntryLot, Position, Side, TradeReason, TradeRecord, TradeStats, UserId,
};
use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;
use std::str::FromStr;

/// Database connection pool
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Open (creating if missing) the database at `path`
    pub async fn new(path: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(path)?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .context("Failed to connect to database")?;

        let db = Self { pool };
        db.initialize().await?;

        Ok(db)
    }

    /// In-memory database for tests. Single connection so every query sees
    /// the same memory store.
    pub async fn new_in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .context("Failed to open in-memory database")?;

        let db = Self { pool };
        db.initialize().await?;

        Ok(db)
    }

    /// Initialize database schema
    async fn initialize(&self) -> Result<()> {
        // Per-user venue API credentials. Written by the operator path only;
        // the trading core reads them.
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS user_keys (
                user_id    INTEGER PRIMARY KEY,
                api_key    TEXT NOT NULL,
                api_secret TEXT NOT NULL,
                sandbox    INTEGER NOT NULL DEFAULT 0,
                updated_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        // One row per user; full-row replaced on every step
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS bot_state (
                user_id      INTEGER PRIMARY KEY,
                enabled      INTEGER NOT NULL DEFAULT 0,
                cash         TEXT NOT NULL,
                asset        TEXT NOT NULL,
                in_position  INTEGER NOT NULL DEFAULT 0,
                entry_price  TEXT,
                entry_qty    TEXT,
                entry_time   TEXT,
                last_step_at TEXT,
                last_error   TEXT,
                updated_at   TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        // Append-only trade history; rows are never updated or deleted
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS bot_trades (
                id          INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id     INTEGER NOT NULL,
                time        TEXT NOT NULL,
                symbol      TEXT NOT NULL,
                side        TEXT NOT NULL CHECK(side IN ('BUY','SELL')),
                price       TEXT NOT NULL,
                qty         TEXT NOT NULL,
                fee         TEXT NOT NULL,
                cash_after  TEXT NOT NULL,
                asset_after TEXT NOT NULL,
                reason      TEXT NOT NULL,
                pnl         TEXT,
                order_id    TEXT
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_bot_trades_user_time ON bot_trades (user_id, time)",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    // ---- bot state ----

    /// Load a user's state. Absent row means the user has never stepped.
    pub async fn get_state(&self, user_id: UserId) -> Result<Option<BotState>> {
        let row = sqlx::query("SELECT * FROM bot_state WHERE user_id = ?")
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(r) => Ok(Some(row_to_state(&r)?)),
            None => Ok(None),
        }
    }

    /// Atomic full-row replace of a user's state
    pub async fn upsert_state(&self, state: &BotState) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        write_state(&mut tx, state).await?;
        tx.commit().await?;
        Ok(())
    }

    /// Commit one step: the new state row and, when an order executed, its
    /// trade row, in a single transaction. A crash cannot leave a trade
    /// without the matching state update or vice versa.
    pub async fn record_step(
        &self,
        state: &BotState,
        trade: Option<&TradeRecord>,
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        write_state(&mut tx, state).await?;
        if let Some(trade) = trade {
            write_trade(&mut tx, state.user_id, trade).await?;
        }
        tx.commit().await.context("Failed to commit step")?;
        Ok(())
    }

    /// Users with the bot enabled AND credentials on file, in id order
    pub async fn list_enabled_users(&self) -> Result<Vec<UserId>> {
        let rows: Vec<(i64,)> = sqlx::query_as(
            r#"
            SELECT bs.user_id FROM bot_state bs
            JOIN user_keys uk ON uk.user_id = bs.user_id
            WHERE bs.enabled = 1
            ORDER BY bs.user_id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(|(id,)| id).collect())
    }

    /// Flip the enabled flag. Enabling a user with no state yet creates a
    /// zeroed FLAT row; the engine seeds real balances on the first step.
    /// Disabling never deletes state.
    pub async fn set_enabled(&self, user_id: UserId, enabled: bool) -> Result<()> {
        let now = Utc::now();
        let result = sqlx::query(
            "UPDATE bot_state SET enabled = ?, updated_at = ? WHERE user_id = ?",
        )
        .bind(enabled)
        .bind(now.to_rfc3339())
        .bind(user_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 && enabled {
            let state = BotState::seeded(user_id, Decimal::ZERO, Decimal::ZERO, now);
            self.upsert_state(&state).await?;
        }

        Ok(())
    }

    // ---- credentials ----

    pub async fn get_credentials(&self, user_id: UserId) -> Result<Option<Credentials>> {
        let row: Option<(String, String, bool)> = sqlx::query_as(
            "SELECT api_key, api_secret, sandbox FROM user_keys WHERE user_id = ?",
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|(api_key, api_secret, sandbox)| Credentials {
            api_key,
            api_secret,
            sandbox,
        }))
    }

    pub async fn upsert_credentials(
        &self,
        user_id: UserId,
        api_key: &str,
        api_secret: &str,
        sandbox: bool,
    ) -> Result<()> {
        if api_key.trim().is_empty() || api_secret.trim().is_empty() {
            bail!("API key and secret are required");
        }

        sqlx::query(
            r#"
            INSERT INTO user_keys (user_id, api_key, api_secret, sandbox, updated_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(user_id) DO UPDATE SET
                api_key = excluded.api_key,
                api_secret = excluded.api_secret,
                sandbox = excluded.sandbox,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(user_id)
        .bind(api_key.trim())
        .bind(api_secret.trim())
        .bind(sandbox)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    // ---- trade history ----

    /// Most recent trades first
    pub async fn list_trades(&self, user_id: UserId, limit: i64) -> Result<Vec<TradeRecord>> {
        let rows = sqlx::query(
            "SELECT * FROM bot_trades WHERE user_id = ? ORDER BY time DESC, id DESC LIMIT ?",
        )
        .bind(user_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_trade).collect()
    }

    /// Sell-side performance summary for one user
    pub async fn trade_stats(&self, user_id: UserId) -> Result<TradeStats> {
        let (sells, wins, losses): (i64, i64, i64) = sqlx::query_as(
            r#"
            SELECT
                COUNT(*),
                COALESCE(SUM(CAST(pnl AS REAL) > 0), 0),
                COALESCE(SUM(CAST(pnl AS REAL) < 0), 0)
            FROM bot_trades
            WHERE user_id = ? AND side = 'SELL'
            "#,
        )
        .bind(user_id)
        .fetch_one(&self.pool)
        .await?;

        let pnls: Vec<(Option<String>,)> =
            sqlx::query_as("SELECT pnl FROM bot_trades WHERE user_id = ? AND side = 'SELL'")
                .bind(user_id)
                .fetch_all(&self.pool)
                .await?;

        // Summed in Decimal rather than SQL REAL to keep exact figures
        let realized_pnl = pnls
            .into_iter()
            .filter_map(|(p,)| p.and_then(|s| Decimal::from_str(&s).ok()))
            .sum();

        Ok(TradeStats {
            sells,
            wins,
            losses,
            realized_pnl,
        })
    }
}

async fn write_state(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    state: &BotState,
) -> Result<()> {
    let entry = state.position.entry();

    sqlx::query(
        r#"
        INSERT OR REPLACE INTO bot_state
            (user_id, enabled, cash, asset, in_position,
             entry_price, entry_qty, entry_time, last_step_at, last_error, updated_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(state.user_id)
    .bind(state.enabled)
    .bind(state.cash.to_string())
    .bind(state.asset.to_string())
    .bind(state.position.is_long())
    .bind(entry.map(|e| e.price.to_string()))
    .bind(entry.map(|e| e.qty.to_string()))
    .bind(entry.map(|e| e.time.to_rfc3339()))
    .bind(state.last_step_at.map(|t| t.to_rfc3339()))
    .bind(state.last_error.as_deref())
    .bind(state.updated_at.to_rfc3339())
    .execute(&mut **tx)
    .await
    .context("Failed to write bot state")?;

    Ok(())
}

async fn write_trade(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    user_id: UserId,
    trade: &TradeRecord,
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO bot_trades
            (user_id, time, symbol, side, price, qty, fee,
             cash_after, asset_after, reason, pnl, order_id)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(user_id)
    .bind(trade.time.to_rfc3339())
    .bind(&trade.symbol)
    .bind(trade.side.as_str())
    .bind(trade.price.to_string())
    .bind(trade.qty.to_string())
    .bind(trade.fee.to_string())
    .bind(trade.cash_after.to_string())
    .bind(trade.asset_after.to_string())
    .bind(trade.reason.as_str())
    .bind(trade.pnl.map(|p| p.to_string()))
    .bind(trade.order_id.as_deref())
    .execute(&mut **tx)
    .await
    .context("Failed to append trade")?;

    Ok(())
}

fn parse_decimal(value: &str, column: &str) -> Result<Decimal> {
    Decimal::from_str(value).with_context(|| format!("Invalid decimal in column {column}"))
}

fn parse_time(value: &str, column: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|t| t.with_timezone(&Utc))
        .with_context(|| format!("Invalid timestamp in column {column}"))
}

/// Decode a state row, enforcing the FLAT/LONG invariant: a LONG row must
/// carry a complete entry lot with positive quantity, a FLAT row must carry
/// none. Violations are store corruption, not something to repair silently.
fn row_to_state(row: &SqliteRow) -> Result<BotState> {
    let in_position: bool = row.get("in_position");
    let entry_price: Option<String> = row.get("entry_price");
    let entry_qty: Option<String> = row.get("entry_qty");
    let entry_time: Option<String> = row.get("entry_time");

    let position = if in_position {
        let (price, qty, time) = match (entry_price, entry_qty, entry_time) {
            (Some(p), Some(q), Some(t)) => (p, q, t),
            _ => bail!("LONG state row is missing entry fields"),
        };
        let lot = EntryLot::new(
            parse_decimal(&price, "entry_price")?,
            parse_decimal(&qty, "entry_qty")?,
            parse_time(&time, "entry_time")?,
        )
        .context("LONG state row has non-positive entry_qty")?;
        Position::Long(lot)
    } else {
        if entry_price.is_some() || entry_qty.is_some() || entry_time.is_some() {
            bail!("FLAT state row carries entry fields");
        }
        Position::Flat
    };

    let cash: String = row.get("cash");
    let asset: String = row.get("asset");
    let last_step_at: Option<String> = row.get("last_step_at");
    let updated_at: String = row.get("updated_at");

    Ok(BotState {
        user_id: row.get("user_id"),
        enabled: row.get("enabled"),
        cash: parse_decimal(&cash, "cash")?,
        asset: parse_decimal(&asset, "asset")?,
        position,
        last_step_at: last_step_at
            .map(|t| parse_time(&t, "last_step_at"))
            .transpose()?,
        last_error: row.get("last_error"),
        updated_at: parse_time(&updated_at, "updated_at")?,
    })
}

fn row_to_trade(row: &SqliteRow) -> Result<TradeRecord> {
    let side: String = row.get("side");
    let reason: String = row.get("reason");
    let time: String = row.get("time");
    let price: String = row.get("price");
    let qty: String = row.get("qty");
    let fee: String = row.get("fee");
    let cash_after: String = row.get("cash_after");
    let asset_after: String = row.get("asset_after");
    let pnl: Option<String> = row.get("pnl");

    Ok(TradeRecord {
        time: parse_time(&time, "time")?,
        symbol: row.get("symbol"),
        side: Side::from_str(&side).with_context(|| format!("Unknown trade side {side}"))?,
        price: parse_decimal(&price, "price")?,
        qty: parse_decimal(&qty, "qty")?,
        fee: parse_decimal(&fee, "fee")?,
        cash_after: parse_decimal(&cash_after, "cash_after")?,
        asset_after: parse_decimal(&asset_after, "asset_after")?,
        reason: TradeReason::from_str(&reason)
            .with_context(|| format!("Unknown trade reason {reason}"))?,
        pnl: pnl.map(|p| parse_decimal(&p, "pnl")).transpose()?,
        order_id: row.get("order_id"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn long_state(user_id: UserId) -> BotState {
        let now = Utc::now();
        BotState {
            user_id,
            enabled: true,
            cash: dec!(1.25),
            asset: dec!(0.0005),
            position: Position::Long(EntryLot::new(dec!(100.5), dec!(0.0005), now).unwrap()),
            last_step_at: Some(now),
            last_error: None,
            updated_at: now,
        }
    }

    fn sell_trade(pnl: Decimal) -> TradeRecord {
        TradeRecord {
            time: Utc::now(),
            symbol: "BTCUSDT".to_string(),
            side: Side::Sell,
            price: dec!(100.4),
            qty: dec!(1),
            fee: dec!(0.1004),
            cash_after: dec!(100.2996),
            asset_after: Decimal::ZERO,
            reason: TradeReason::TakeProfit,
            pnl: Some(pnl),
            order_id: Some("1".to_string()),
        }
    }

    #[tokio::test]
    async fn state_round_trips_flat_and_long() {
        let db = Database::new_in_memory().await.unwrap();

        assert!(db.get_state(1).await.unwrap().is_none());

        let flat = BotState::seeded(1, dec!(50), Decimal::ZERO, Utc::now());
        db.upsert_state(&flat).await.unwrap();
        let loaded = db.get_state(1).await.unwrap().unwrap();
        assert_eq!(loaded.cash, dec!(50));
        assert_eq!(loaded.position, Position::Flat);

        let long = long_state(1);
        db.upsert_state(&long).await.unwrap();
        let loaded = db.get_state(1).await.unwrap().unwrap();
        assert!(loaded.position.is_long());
        assert_eq!(loaded.position.entry().unwrap().price, dec!(100.5));
    }

    #[tokio::test]
    async fn record_step_commits_state_and_trade_together() {
        let db = Database::new_in_memory().await.unwrap();

        let mut state = BotState::seeded(7, dec!(100.2996), Decimal::ZERO, Utc::now());
        state.last_step_at = Some(Utc::now());
        db.record_step(&state, Some(&sell_trade(dec!(0.2996))))
            .await
            .unwrap();

        let loaded = db.get_state(7).await.unwrap().unwrap();
        assert_eq!(loaded.cash, dec!(100.2996));

        let trades = db.list_trades(7, 10).await.unwrap();
        assert_eq!(trades.len(), 1);
        assert_eq!(trades[0].reason, TradeReason::TakeProfit);
        assert_eq!(trades[0].pnl, Some(dec!(0.2996)));
    }

    #[tokio::test]
    async fn corrupt_long_row_fails_to_decode() {
        let db = Database::new_in_memory().await.unwrap();

        sqlx::query(
            r#"
            INSERT INTO bot_state
                (user_id, enabled, cash, asset, in_position, entry_price, entry_qty,
                 entry_time, last_step_at, last_error, updated_at)
            VALUES (3, 1, '10', '0', 1, '100', NULL, NULL, NULL, NULL, ?)
            "#,
        )
        .bind(Utc::now().to_rfc3339())
        .execute(&db.pool)
        .await
        .unwrap();

        assert!(db.get_state(3).await.is_err());
    }

    #[tokio::test]
    async fn enabled_users_require_credentials() {
        let db = Database::new_in_memory().await.unwrap();

        db.set_enabled(1, true).await.unwrap();
        db.set_enabled(2, true).await.unwrap();
        db.upsert_credentials(2, "key", "secret", true).await.unwrap();

        // User 1 has no keys on file and is skipped entirely
        assert_eq!(db.list_enabled_users().await.unwrap(), vec![2]);

        db.set_enabled(2, false).await.unwrap();
        assert!(db.list_enabled_users().await.unwrap().is_empty());

        // Disabling never deletes the row
        assert!(db.get_state(2).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn first_enable_creates_zeroed_state() {
        let db = Database::new_in_memory().await.unwrap();

        db.set_enabled(9, true).await.unwrap();
        let state = db.get_state(9).await.unwrap().unwrap();
        assert!(state.enabled);
        assert_eq!(state.cash, Decimal::ZERO);
        assert_eq!(state.position, Position::Flat);
    }

    #[tokio::test]
    async fn trade_stats_summarize_sells() {
        let db = Database::new_in_memory().await.unwrap();

        let state = BotState::seeded(4, dec!(100), Decimal::ZERO, Utc::now());
        db.record_step(&state, Some(&sell_trade(dec!(0.30)))).await.unwrap();
        db.record_step(&state, Some(&sell_trade(dec!(-0.10)))).await.unwrap();

        let mut buy = sell_trade(Decimal::ZERO);
        buy.side = Side::Buy;
        buy.reason = TradeReason::AutoBuy;
        buy.pnl = None;
        db.record_step(&state, Some(&buy)).await.unwrap();

        let stats = db.trade_stats(4).await.unwrap();
        assert_eq!(stats.sells, 2);
        assert_eq!(stats.wins, 1);
        assert_eq!(stats.losses, 1);
        assert_eq!(stats.realized_pnl, dec!(0.20));
        assert_eq!(stats.win_rate(), 50.0);
    }
}
