//! Sandbox wiring
//!
//! Builds the managers over one store, owns the background job schedule,
//! and exposes the calls an API façade consumes: order entry, position
//! closing, read projections, config writes with hot-applied effects.

use chrono::{NaiveTime, Utc};
use chrono_tz::Tz;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::config::{ConfigEffect, SandboxConfig};
use crate::error::{SandboxError, SandboxResult};
use crate::execution::ExecutionEngine;
use crate::funds::Ledger;
use crate::orders::OrderManager;
use crate::providers::{QuoteProvider, SymbolMetaProvider};
use crate::scheduler::{JobFn, Scheduler};
use crate::settlement::SettlementManager;
use crate::squareoff::{reverse_market_order, SquareoffManager};
use crate::store::{self, Funds, Holding, Order, Position, PositionKey, SandboxStore, Trade};
use crate::types::{ExchangeGroup, Money};

/// Result of closing a position through the synthetic-order path
#[derive(Debug, Clone)]
pub struct CloseReceipt {
    pub orderid: String,
    pub realized_pnl: Money,
}

pub struct Sandbox {
    store: Arc<SandboxStore>,
    config: Arc<SandboxConfig>,
    ledger: Arc<Ledger>,
    orders: Arc<OrderManager>,
    engine: Arc<ExecutionEngine>,
    squareoff: Arc<SquareoffManager>,
    settlement: Arc<SettlementManager>,
    scheduler: Arc<Scheduler>,
    active: AtomicBool,
}

impl Sandbox {
    pub fn new(
        store: Arc<SandboxStore>,
        zone: Tz,
        quotes: Arc<dyn QuoteProvider>,
        symbols: Arc<dyn SymbolMetaProvider>,
    ) -> SandboxResult<Self> {
        let config = Arc::new(
            SandboxConfig::new(store.clone(), zone)
                .map_err(|e| SandboxError::Internal(format!("config init failed: {e}")))?,
        );
        let ledger = Arc::new(Ledger::new(config.clone()));
        let orders = Arc::new(OrderManager::new(
            store.clone(),
            config.clone(),
            ledger.clone(),
            quotes.clone(),
            symbols,
        ));
        let engine = Arc::new(ExecutionEngine::new(
            store.clone(),
            config.clone(),
            ledger.clone(),
            quotes,
        ));
        let squareoff = Arc::new(SquareoffManager::new(
            store.clone(),
            config.clone(),
            orders.clone(),
            engine.clone(),
        ));
        let settlement = Arc::new(SettlementManager::new(
            store.clone(),
            config.clone(),
            ledger.clone(),
        ));
        let scheduler = Arc::new(Scheduler::new(zone));

        Ok(Self {
            store,
            config,
            ledger,
            orders,
            engine,
            squareoff,
            settlement,
            scheduler,
            active: AtomicBool::new(false),
        })
    }

    pub fn orders(&self) -> &OrderManager {
        &self.orders
    }

    pub fn engine(&self) -> &ExecutionEngine {
        &self.engine
    }

    pub fn squareoff(&self) -> &SquareoffManager {
        &self.squareoff
    }

    pub fn settlement(&self) -> &SettlementManager {
        &self.settlement
    }

    pub fn config(&self) -> &SandboxConfig {
        &self.config
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// Activate the sandbox: run the T+1 catch-up sweep, then bring up the
    /// background jobs. Must run inside a tokio runtime.
    pub fn start(&self) -> SandboxResult<()> {
        if self.active.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        if let Err(e) = self.settlement.run_catchup() {
            warn!(error = %e, "T+1 catch-up failed at startup");
        }
        self.schedule_engine()?;
        self.schedule_mtm()?;
        for group in ExchangeGroup::ALL {
            self.schedule_squareoff(group)?;
        }
        self.schedule_squareoff_backup();
        self.schedule_settlement();
        self.schedule_reset()?;
        info!("sandbox started");
        Ok(())
    }

    /// Deactivate: stop every background job. State stays put.
    pub fn stop(&self) {
        if !self.active.swap(false, Ordering::SeqCst) {
            return;
        }
        self.scheduler.shutdown();
        info!("sandbox stopped");
    }

    /// Write a config value and hot-apply its effects to the job schedule
    pub fn set_config(&self, key: &str, value: &str) -> SandboxResult<()> {
        let effects = self.config.set(key, value)?;
        if !self.is_active() {
            return Ok(());
        }
        for effect in effects {
            match effect {
                ConfigEffect::RescheduleSquareoff(group) => self.schedule_squareoff(group)?,
                ConfigEffect::RescheduleReset => self.schedule_reset()?,
                ConfigEffect::RescheduleEngine => self.schedule_engine()?,
                ConfigEffect::RescheduleMtm => self.schedule_mtm()?,
                ConfigEffect::FundsRebased => {}
            }
        }
        Ok(())
    }

    /// Close one open position via a synthetic reverse MARKET order
    pub async fn close_position(&self, key: &PositionKey) -> SandboxResult<CloseReceipt> {
        let position = self
            .store
            .read(|conn| store::get_position(conn, key))?
            .filter(|p| p.quantity != 0)
            .ok_or_else(|| {
                SandboxError::Validation(format!(
                    "no open position for {} {} {}",
                    key.symbol, key.exchange, key.product
                ))
            })?;

        let order = reverse_market_order(&position);
        let orderid = order.orderid.clone();
        let (_, outcome) = self.engine.execute_synthetic(order).await?;
        Ok(CloseReceipt {
            orderid,
            realized_pnl: outcome.realized_delta,
        })
    }

    /// Close every nonzero position of the user; failures are logged and
    /// skipped. Returns the number closed.
    pub async fn close_all_positions(&self, user: &str) -> SandboxResult<usize> {
        let positions = self
            .store
            .read(|conn| store::positions_for_user(conn, user))?;
        let mut closed = 0;
        for position in positions.iter().filter(|p| p.quantity != 0) {
            match self.close_position(&position.key()).await {
                Ok(_) => closed += 1,
                Err(e) => warn!(
                    user,
                    symbol = %position.symbol,
                    error = %e,
                    "close-all skipped position"
                ),
            }
        }
        Ok(closed)
    }

    /// Weekly reset body: restore funds and wipe the session for every user.
    /// Guarded so a catch-up firing cannot reset twice on the same local day.
    pub fn run_weekly_reset(&self) -> SandboxResult<usize> {
        weekly_reset_once(&self.store, &self.ledger, &self.config)
    }

    // ------------------------------------------------------------------
    // Read projections
    // ------------------------------------------------------------------

    pub fn list_orders(&self, user: &str, strategy: Option<&str>) -> SandboxResult<Vec<Order>> {
        self.store
            .read(|conn| store::list_orders(conn, user, strategy))
    }

    pub fn list_trades(&self, user: &str) -> SandboxResult<Vec<Trade>> {
        self.store.read(|conn| store::list_trades(conn, user))
    }

    pub fn list_positions(&self, user: &str) -> SandboxResult<Vec<Position>> {
        self.store
            .read(|conn| store::positions_for_user(conn, user))
    }

    pub fn list_holdings(&self, user: &str) -> SandboxResult<Vec<Holding>> {
        self.store
            .read(|conn| store::holdings_for_user(conn, user))
    }

    /// Funds row, provisioned at starting capital on first touch
    pub fn get_funds(&self, user: &str) -> SandboxResult<Funds> {
        let capital = self.config.starting_capital()?;
        self.store
            .with_user_tx(user, |conn| store::ensure_funds(conn, user, capital))
    }

    // ------------------------------------------------------------------
    // Job scheduling
    // ------------------------------------------------------------------

    fn schedule_engine(&self) -> SandboxResult<()> {
        let period = Duration::from_secs(self.config.order_check_interval()?);
        let engine = self.engine.clone();
        let job: JobFn = Arc::new(move || {
            let engine = engine.clone();
            Box::pin(async move {
                if let Err(e) = engine.run_tick().await {
                    warn!(error = %e, "engine tick failed");
                }
            })
        });
        self.scheduler.schedule_interval("execution_engine", period, job);
        Ok(())
    }

    fn schedule_mtm(&self) -> SandboxResult<()> {
        let secs = self.config.mtm_update_interval()?;
        if secs == 0 {
            self.scheduler.cancel("mtm");
            return Ok(());
        }
        let engine = self.engine.clone();
        let job: JobFn = Arc::new(move || {
            let engine = engine.clone();
            Box::pin(async move {
                if let Err(e) = engine.refresh_mtm().await {
                    warn!(error = %e, "MTM refresh failed");
                }
            })
        });
        self.scheduler
            .schedule_interval("mtm", Duration::from_secs(secs), job);
        Ok(())
    }

    fn schedule_squareoff(&self, group: ExchangeGroup) -> SandboxResult<()> {
        let at = self.config.square_off_time(group)?;
        let squareoff = self.squareoff.clone();
        let job: JobFn = Arc::new(move || {
            let squareoff = squareoff.clone();
            Box::pin(async move {
                if let Err(e) = squareoff.square_off_group(group).await {
                    warn!(group = %group, error = %e, "square-off job failed");
                }
            })
        });
        self.scheduler
            .schedule_daily(&format!("squareoff_{}", group.as_str().to_lowercase()), at, job);
        Ok(())
    }

    fn schedule_squareoff_backup(&self) {
        let squareoff = self.squareoff.clone();
        let job: JobFn = Arc::new(move || {
            let squareoff = squareoff.clone();
            Box::pin(async move {
                if let Err(e) = squareoff.backup_sweep().await {
                    warn!(error = %e, "square-off backup sweep failed");
                }
            })
        });
        self.scheduler
            .schedule_interval("squareoff_backup", Duration::from_secs(60), job);
    }

    fn schedule_settlement(&self) {
        let settlement = self.settlement.clone();
        let job: JobFn = Arc::new(move || {
            let settlement = settlement.clone();
            Box::pin(async move {
                if let Err(e) = settlement.settle_t1() {
                    warn!(error = %e, "T+1 settlement job failed");
                }
            })
        });
        let midnight = NaiveTime::from_hms_opt(0, 0, 0).unwrap();
        self.scheduler
            .schedule_daily("t1_settlement", midnight, job);
    }

    fn schedule_reset(&self) -> SandboxResult<()> {
        let day = self.config.reset_day()?;
        let at = self.config.reset_time()?;
        let store = self.store.clone();
        let ledger = self.ledger.clone();
        let config = self.config.clone();
        let job: JobFn = Arc::new(move || {
            let store = store.clone();
            let ledger = ledger.clone();
            let config = config.clone();
            Box::pin(async move {
                if let Err(e) = weekly_reset_once(&store, &ledger, &config) {
                    warn!(error = %e, "weekly reset job failed");
                }
            })
        });
        self.scheduler.schedule_weekly("auto_reset", day, at, job);
        Ok(())
    }
}

/// Free-standing weekly reset used by the scheduled job; mirrors
/// [`Sandbox::run_weekly_reset`]
fn weekly_reset_once(
    store: &SandboxStore,
    ledger: &Ledger,
    config: &SandboxConfig,
) -> SandboxResult<usize> {
    let today = Utc::now().with_timezone(&config.zone()).date_naive();
    if config.last_auto_reset_on()? == Some(today) {
        return Ok(0);
    }
    let users = store.read(store::all_fund_users)?;
    let mut reset_count = 0;
    for user in &users {
        let result = store.with_user_tx(user, |conn| {
            store::wipe_user_session(conn, user)?;
            ledger.reset(conn, user)
        });
        match result {
            Ok(()) => reset_count += 1,
            Err(e) => warn!(%user, error = %e, "weekly reset failed for user"),
        }
    }
    config.mark_auto_reset(today)?;
    info!(users = reset_count, "weekly reset done");
    Ok(reset_count)
}
