//! Multi-tenant scheduling loop
//!
//! Drives the step engine across all enabled users on a fixed cadence, one
//! sequential worker. Each user's failure is isolated: it is logged,
//! recorded on that user's state and counted, but never stops the other
//! users or the process. N consecutive user-level failures abort the
//! current cycle and apply an extended cooldown, after which the counter
//! resets and normal cadence resumes.
//!
//! All state transitions happen in this loop. Operator commands and any
//! presentation process only read state or flip flags.

use crate::config::Config;
use crate::db::Database;
use crate::engine::{StepEngine, StepError, MAX_ERROR_LEN};
use crate::exchange::ExchangeConnector;
use crate::funding::FundingSource;
use crate::types::{StepOutcome, UserId};
use chrono::Utc;
use std::sync::Arc;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

/// Counts consecutive user-level failures across cycles. Any success resets
/// the count; reaching the threshold trips the cooldown and resets.
#[derive(Debug)]
pub struct FailureTracker {
    threshold: u32,
    consecutive: u32,
}

impl FailureTracker {
    pub fn new(threshold: u32) -> Self {
        Self {
            threshold,
            consecutive: 0,
        }
    }

    pub fn record_success(&mut self) {
        self.consecutive = 0;
    }

    /// Returns true when the failure trips the threshold. The counter
    /// resets so the next window starts clean after the cooldown.
    pub fn record_failure(&mut self) -> bool {
        self.consecutive += 1;
        if self.consecutive >= self.threshold {
            self.consecutive = 0;
            true
        } else {
            false
        }
    }
}

/// What one cycle did, for logging and tests
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CycleReport {
    /// Steps that ran to an outcome
    pub steps: usize,
    /// Users skipped for missing credentials
    pub skipped: usize,
    /// Steps that failed
    pub failures: usize,
    /// The failure threshold tripped; the cycle was cut short
    pub cooldown: bool,
}

pub struct Scheduler {
    db: Arc<Database>,
    engine: StepEngine,
    connector: Arc<dyn ExchangeConnector>,
    funding: Option<Arc<dyn FundingSource>>,
    config: Config,
    failures: FailureTracker,
}

impl Scheduler {
    pub fn new(
        db: Arc<Database>,
        config: Config,
        connector: Arc<dyn ExchangeConnector>,
        funding: Option<Arc<dyn FundingSource>>,
    ) -> Self {
        let engine = StepEngine::new(Arc::clone(&db), config.clone());
        let failures = FailureTracker::new(config.max_consecutive_failures);
        Self {
            db,
            engine,
            connector,
            funding,
            config,
            failures,
        }
    }

    /// Run until process exit
    pub async fn run(mut self) {
        info!(
            "scheduler started: {} | TP {}% | SL {}% | every {}s",
            self.config.symbol,
            self.config.take_profit_rate * rust_decimal::Decimal::from(100),
            self.config.stop_loss_rate * rust_decimal::Decimal::from(100),
            self.config.loop_interval_seconds
        );

        loop {
            let report = self.run_cycle().await;

            if report.cooldown {
                warn!(
                    "{} consecutive failures; cooling down for {}s",
                    self.config.max_consecutive_failures, self.config.failure_cooldown_seconds
                );
                sleep(self.config.failure_cooldown()).await;
            } else {
                sleep(self.config.loop_interval()).await;
            }
        }
    }

    /// One pass over all enabled users
    pub async fn run_cycle(&mut self) -> CycleReport {
        let mut report = CycleReport::default();

        let users = match self.db.list_enabled_users().await {
            Ok(users) => users,
            Err(err) => {
                error!("failed to list enabled users: {err}");
                report.failures += 1;
                report.cooldown = self.failures.record_failure();
                return report;
            }
        };

        if users.is_empty() {
            debug!("no enabled bots");
            return report;
        }

        debug!("cycle: {} enabled user(s)", users.len());

        for user_id in users {
            match self.step_user(user_id).await {
                Ok(Some(outcome)) => {
                    report.steps += 1;
                    self.failures.record_success();
                    debug!("[user {user_id}] step: {outcome:?}");
                }
                Ok(None) => {
                    // Credentials disappeared between listing and stepping;
                    // skip silently per the credential-provider contract.
                    report.skipped += 1;
                }
                Err(err) => {
                    error!("[user {user_id}] step failed: {err}");
                    report.failures += 1;
                    if self.failures.record_failure() {
                        report.cooldown = true;
                        break;
                    }
                }
            }
        }

        report
    }

    /// One step for one user: credentials -> adapter -> engine
    async fn step_user(&self, user_id: UserId) -> Result<Option<StepOutcome>, StepError> {
        let credentials = self
            .db
            .get_credentials(user_id)
            .await
            .map_err(|e| StepError::Store(e.to_string()))?;
        let Some(credentials) = credentials else {
            return Ok(None);
        };

        let venue = match self.connector.connect(&credentials).await {
            Ok(venue) => venue,
            Err(err) => {
                self.record_adapter_failure(user_id, &err).await;
                return Err(err.into());
            }
        };

        let outcome = self
            .engine
            .step(user_id, venue.as_ref(), self.funding.as_deref())
            .await?;
        Ok(Some(outcome))
    }

    /// Adapter construction failed before the engine could run; the error
    /// still belongs on the user's state surface.
    async fn record_adapter_failure(&self, user_id: UserId, err: &crate::exchange::ExchangeError) {
        let now = Utc::now();
        match self.db.get_state(user_id).await {
            Ok(Some(mut state)) => {
                state.last_error = Some(err.to_string().chars().take(MAX_ERROR_LEN).collect());
                state.last_step_at = Some(now);
                state.updated_at = now;
                if let Err(db_err) = self.db.upsert_state(&state).await {
                    warn!("[user {user_id}] failed to record adapter failure: {db_err}");
                }
            }
            Ok(None) => {}
            Err(db_err) => warn!("[user {user_id}] failed to load state: {db_err}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::{ExchangeError, Fill, SpotExchange};
    use crate::types::Credentials;
    use async_trait::async_trait;
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn tracker_trips_at_threshold_and_resets() {
        let mut tracker = FailureTracker::new(5);
        for _ in 0..4 {
            assert!(!tracker.record_failure());
        }
        assert!(tracker.record_failure());

        // Counter reset: another full window is needed to trip again
        for _ in 0..4 {
            assert!(!tracker.record_failure());
        }
        assert!(tracker.record_failure());
    }

    #[test]
    fn tracker_success_resets_the_window() {
        let mut tracker = FailureTracker::new(3);
        assert!(!tracker.record_failure());
        assert!(!tracker.record_failure());
        tracker.record_success();
        assert!(!tracker.record_failure());
        assert!(!tracker.record_failure());
        assert!(tracker.record_failure());
    }

    /// Venue whose account is empty; first steps seed, later steps idle
    struct StubVenue;

    #[async_trait]
    impl SpotExchange for StubVenue {
        async fn fetch_price(&self, _symbol: &str) -> Result<Decimal, ExchangeError> {
            Ok(dec!(100))
        }

        async fn fetch_free_balance(
            &self,
            _quote: &str,
            _base: &str,
        ) -> Result<(Decimal, Decimal), ExchangeError> {
            Ok((Decimal::ZERO, Decimal::ZERO))
        }

        fn round_qty(&self, _symbol: &str, raw_qty: Decimal) -> Decimal {
            raw_qty
        }

        async fn place_market_buy(
            &self,
            _symbol: &str,
            _qty: Decimal,
        ) -> Result<Fill, ExchangeError> {
            unreachable!("stub venue never trades")
        }

        async fn place_market_sell(
            &self,
            _symbol: &str,
            _qty: Decimal,
        ) -> Result<Fill, ExchangeError> {
            unreachable!("stub venue never trades")
        }
    }

    #[derive(Default)]
    struct GoodConnector {
        calls: AtomicU32,
    }

    #[async_trait]
    impl ExchangeConnector for GoodConnector {
        async fn connect(
            &self,
            _credentials: &Credentials,
        ) -> Result<Box<dyn SpotExchange>, ExchangeError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(StubVenue))
        }
    }

    #[derive(Default)]
    struct FailingConnector {
        calls: AtomicU32,
    }

    #[async_trait]
    impl ExchangeConnector for FailingConnector {
        async fn connect(
            &self,
            _credentials: &Credentials,
        ) -> Result<Box<dyn SpotExchange>, ExchangeError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(ExchangeError::Unavailable("venue down".to_string()))
        }
    }

    async fn db_with_users(user_ids: &[UserId]) -> Arc<Database> {
        let db = Arc::new(Database::new_in_memory().await.unwrap());
        for &user_id in user_ids {
            db.set_enabled(user_id, true).await.unwrap();
            db.upsert_credentials(user_id, "key", "secret", true)
                .await
                .unwrap();
        }
        db
    }

    #[tokio::test]
    async fn cycle_steps_every_enabled_user() {
        let db = db_with_users(&[1, 2, 3]).await;
        let connector = Arc::new(GoodConnector::default());
        let mut scheduler = Scheduler::new(
            Arc::clone(&db),
            Config::default(),
            Arc::clone(&connector) as Arc<dyn ExchangeConnector>,
            None,
        );

        let report = scheduler.run_cycle().await;
        assert_eq!(report.steps, 3);
        assert_eq!(report.failures, 0);
        assert!(!report.cooldown);
        assert_eq!(connector.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn one_failing_user_does_not_stop_the_others() {
        // Threshold above the user count: failures isolate, cycle completes
        let db = db_with_users(&[1, 2, 3]).await;
        let connector = Arc::new(FailingConnector::default());
        let mut config = Config::default();
        config.max_consecutive_failures = 10;
        let mut scheduler = Scheduler::new(
            Arc::clone(&db),
            config,
            Arc::clone(&connector) as Arc<dyn ExchangeConnector>,
            None,
        );

        let report = scheduler.run_cycle().await;
        assert_eq!(report.failures, 3);
        assert!(!report.cooldown);
        assert_eq!(connector.calls.load(Ordering::SeqCst), 3);

        // Adapter failures land on each user's error surface
        for user_id in [1, 2, 3] {
            let state = db.get_state(user_id).await.unwrap().unwrap();
            assert!(state.last_error.as_deref().unwrap().contains("unavailable"));
        }
    }

    #[tokio::test]
    async fn threshold_cuts_the_cycle_short_and_resets() {
        let db = db_with_users(&[1, 2, 3]).await;
        let connector = Arc::new(FailingConnector::default());
        let mut config = Config::default();
        config.max_consecutive_failures = 2;
        let mut scheduler = Scheduler::new(
            Arc::clone(&db),
            config,
            Arc::clone(&connector) as Arc<dyn ExchangeConnector>,
            None,
        );

        let report = scheduler.run_cycle().await;
        assert!(report.cooldown);
        assert_eq!(report.failures, 2);
        // User 3 was never attempted once the threshold tripped
        assert_eq!(connector.calls.load(Ordering::SeqCst), 2);

        // Counter reset: the next cycle gets a full window again
        let report = scheduler.run_cycle().await;
        assert!(report.cooldown);
        assert_eq!(report.failures, 2);
        assert_eq!(connector.calls.load(Ordering::SeqCst), 4);
    }
}
