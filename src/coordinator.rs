//! The event loop: an explicit state machine (`Init -> Loading -> Restoring
//! -> Running -> Halted* -> Stopping`) that composes every other component,
//! driven by one `tokio::select!` over price ticks, order updates, and the
//! periodic reconciliation timer.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use rust_decimal::Decimal;
use tokio::sync::mpsc;

use crate::circuit_breaker::{CircuitBreaker, PositionLedger};
use crate::exchange::{ExchangePort, StreamEvent};
use crate::executor::OrderExecutor;
use crate::price_monitor::PriceMonitor;
use crate::reconciler::Reconciler;
use crate::risk_monitor::{Candle as RiskCandle, RiskMonitor};
use crate::slot::{PriceKey, Side};
use crate::slot_manager::{ActionOutcome, OrderUpdate, SlotManager};
use crate::store::{GridState, Store};
use crate::strategy::{self, StrategyConfig};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoordinatorState {
    Init,
    Loading,
    Restoring,
    Running,
    HaltedBuys,
    HaltedAll,
    Stopping,
}

pub struct GridCoordinator {
    symbol: String,
    strategy_id: String,
    strategy_config: StrategyConfig,
    reconciler_interval: Duration,
    save_cooldown: Duration,
    risk_symbols: Vec<String>,
    kline_interval: String,

    exchange: Arc<dyn ExchangePort>,
    price_monitor: Arc<PriceMonitor>,
    risk_monitor: Mutex<RiskMonitor>,
    breaker: Mutex<CircuitBreaker>,
    pnl_ledger: Mutex<PositionLedger>,
    slot_manager: Arc<SlotManager>,
    executor: OrderExecutor,
    reconciler: Reconciler,
    store: Store,

    state: Mutex<CoordinatorState>,
    last_persist: Mutex<Instant>,
    last_price: Mutex<Decimal>,
    consecutive_persist_failures: Mutex<u32>,
}

/// Sustained persistence failure opens the breaker (spec §7): a single
/// dropped write just skips that tick, but this many *consecutive* failures
/// indicates the store itself is down, not a transient hiccup.
const MAX_CONSECUTIVE_PERSIST_FAILURES: u32 = 5;

impl GridCoordinator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        symbol: String,
        strategy_id: String,
        strategy_config: StrategyConfig,
        reconciler_interval: Duration,
        save_cooldown: Duration,
        risk_symbols: Vec<String>,
        kline_interval: String,
        exchange: Arc<dyn ExchangePort>,
        price_monitor: Arc<PriceMonitor>,
        risk_monitor: RiskMonitor,
        breaker: CircuitBreaker,
        slot_manager: Arc<SlotManager>,
        executor: OrderExecutor,
        reconciler: Reconciler,
        store: Store,
    ) -> Self {
        Self {
            symbol,
            strategy_id,
            strategy_config,
            reconciler_interval,
            save_cooldown,
            risk_symbols,
            kline_interval,
            exchange,
            price_monitor,
            risk_monitor: Mutex::new(risk_monitor),
            breaker: Mutex::new(breaker),
            pnl_ledger: Mutex::new(PositionLedger::new()),
            slot_manager,
            executor,
            reconciler,
            store,
            state: Mutex::new(CoordinatorState::Init),
            last_persist: Mutex::new(Instant::now() - Duration::from_secs(3600)),
            last_price: Mutex::new(Decimal::ZERO),
            consecutive_persist_failures: Mutex::new(0),
        }
    }

    pub fn state(&self) -> CoordinatorState {
        *self.state.lock()
    }

    /// Runs `Init -> Loading -> Restoring -> Running`, then the hot loop
    /// until `stop_rx` fires.
    pub async fn run(&self, mut stop_rx: mpsc::Receiver<()>) {
        *self.state.lock() = CoordinatorState::Loading;

        if let Some(saved) = self.store.load(&self.symbol, &self.strategy_id) {
            for slot in saved.slots {
                self.slot_manager.restore_slot(slot);
            }
            if let Some(breaker_state) = saved.breaker_state {
                self.breaker.lock().restore(breaker_state);
            }
            *self.last_price.lock() = saved.last_price;
        }

        *self.state.lock() = CoordinatorState::Restoring;
        {
            let mut breaker = self.breaker.lock();
            self.reconciler
                .run(&self.symbol, &*self.exchange, &self.slot_manager, &mut breaker)
                .await;
        }

        *self.state.lock() = CoordinatorState::Running;

        let mut price_rx = self.price_monitor.subscribe();
        let mut order_rx = self.exchange.stream_orders();
        let mut kline_rx = self.exchange.stream_klines(&self.risk_symbols, &self.kline_interval);
        let mut reconcile_timer = tokio::time::interval(self.reconciler_interval);

        loop {
            tokio::select! {
                _ = stop_rx.recv() => {
                    *self.state.lock() = CoordinatorState::Stopping;
                    self.persist(true).await;
                    break;
                }
                Ok(tick) = price_rx.recv() => {
                    self.on_price_tick(tick.price).await;
                }
                Some(event) = order_rx.recv() => {
                    match event {
                        StreamEvent::Data(update) => self.on_order_update(update).await,
                        StreamEvent::Reconnected => self.run_reconciliation().await,
                    }
                }
                Some(event) = kline_rx.recv() => {
                    match event {
                        StreamEvent::Data((symbol, candle)) => self.on_candle(&symbol, candle).await,
                        StreamEvent::Reconnected => log::info!("[COORDINATOR] kline stream reconnected"),
                    }
                }
                _ = reconcile_timer.tick() => {
                    self.run_reconciliation().await;
                }
            }
        }
    }

    /// The risk monitor observes candles independently of the price feed
    /// (spec §4.3); it never cancels orders itself — the coordinator reads
    /// `is_triggered()` on the next price tick and halts BUY placements.
    async fn on_candle(&self, symbol: &str, candle: crate::exchange::Candle) {
        self.risk_monitor.lock().on_candle(
            symbol,
            RiskCandle {
                open: candle.open,
                high: candle.high,
                low: candle.low,
                close: candle.close,
                volume: candle.volume,
                closed: candle.closed,
            },
        );
    }

    async fn run_reconciliation(&self) {
        let mut breaker = self.breaker.lock();
        self.reconciler
            .run(&self.symbol, &*self.exchange, &self.slot_manager, &mut breaker)
            .await;
    }

    /// The hot path. Must be correct under concurrency: snapshot + decide +
    /// mark_pending all happen before the manager lock (implicit in
    /// `SlotManager`'s own locking) is released to the executor.
    async fn on_price_tick(&self, price: Decimal) {
        if matches!(self.state(), CoordinatorState::Stopping) {
            return;
        }

        *self.last_price.lock() = price;

        let risk_triggered = self.risk_monitor.lock().is_triggered();
        let breaker_tripped = self.breaker.lock().is_tripped();

        let new_state = match (breaker_tripped, risk_triggered) {
            (true, _) => CoordinatorState::HaltedAll,
            (false, true) => CoordinatorState::HaltedBuys,
            (false, false) => CoordinatorState::Running,
        };
        let previous = { *self.state.lock() };
        *self.state.lock() = new_state;

        if new_state == CoordinatorState::HaltedAll {
            if previous != CoordinatorState::HaltedAll {
                self.cancel_all_orders().await;
            }
            return;
        }

        if new_state == CoordinatorState::HaltedBuys && previous != CoordinatorState::HaltedBuys {
            self.cancel_all_buy_orders().await;
        }

        let atr = self.risk_monitor.lock().atr(&self.symbol).unwrap_or(0.0);
        let inventory = total_inventory(&self.slot_manager.snapshot());

        // Lazily create a slot for every level the active window now covers
        // (spec §3 Lifecycle) so `mark_pending` below has a slot to find;
        // `ensure_slot` is a no-op for levels that already have one.
        for (key, level_price, side) in
            strategy::active_window_levels(&self.strategy_config, price, atr, inventory)
        {
            let client_oid = crate::slot::derive_client_oid(
                &self.strategy_id,
                key,
                side,
                self.strategy_config.max_client_oid_len,
            );
            self.slot_manager.ensure_slot(key, level_price, side, client_oid);
        }

        let snapshot = self.slot_manager.snapshot();
        let actions = strategy::decide(
            &self.strategy_config,
            price,
            atr,
            inventory,
            &snapshot,
            &self.strategy_id,
            new_state == CoordinatorState::HaltedBuys,
        );

        if actions.is_empty() {
            self.persist(false).await;
            return;
        }

        self.slot_manager.mark_pending(&actions);
        let results = self.executor.submit(&*self.exchange, actions).await;
        if results
            .iter()
            .any(|r| matches!(r, ActionOutcome::PlaceRejectedInvalidParam { .. }))
        {
            self.breaker.lock().open("invalid_param_rejection");
        }
        self.slot_manager.apply_results(results);
        self.persist(true).await;
    }

    /// Applies an order update to the slot, then — on a fill — realizes PnL
    /// against the running position ledger and feeds it to the breaker
    /// (§4.9: "Order update -> Running: Apply to slot; record PnL on fill;
    /// feed circuit breaker").
    async fn on_order_update(&self, update: OrderUpdate) {
        if let Some(fill) = self.slot_manager.on_order_update(update) {
            let signed_qty = match fill.side {
                Side::Buy => fill.executed_qty,
                Side::Sell => -fill.executed_qty,
            };
            let realized = self.pnl_ledger.lock().apply_fill(signed_qty, fill.price);
            self.breaker.lock().record_fill_pnl(realized);
        }
    }

    /// Risk trigger: cancel every resting BUY order, leave SELL/exit orders
    /// standing (§4.9 Running -> Halted-Buys).
    async fn cancel_all_buy_orders(&self) {
        self.cancel_locked_orders_where(|s| s.side == Side::Buy).await;
    }

    /// Breaker open: cancel every resting order on both sides (§4.9
    /// Running -> Halted-All) — unlike a risk trigger, a tripped breaker
    /// does not leave exit orders resting.
    async fn cancel_all_orders(&self) {
        self.cancel_locked_orders_where(|_| true).await;
    }

    async fn cancel_locked_orders_where(&self, pred: impl Fn(&crate::slot::Slot) -> bool) {
        let snapshot = self.slot_manager.snapshot();
        let targets: Vec<(PriceKey, u64)> = snapshot
            .iter()
            .filter(|(_, s)| s.slot_status == crate::slot::SlotStatus::Locked && pred(s))
            .map(|(k, s)| (*k, s.order_id))
            .collect();
        if targets.is_empty() {
            return;
        }
        let order_ids: Vec<u64> = targets.iter().map(|(_, id)| *id).collect();
        let outcomes = self.exchange.batch_cancel(&self.symbol, &order_ids).await;
        let results = targets
            .iter()
            .zip(outcomes.iter())
            .map(|((price_key, _), outcome)| match &outcome.result {
                Ok(()) | Err(crate::error::ExchangeError::OrderNotFound) => {
                    ActionOutcome::Canceled { price_key: *price_key }
                }
                Err(_) => ActionOutcome::CancelFailed { price_key: *price_key },
            })
            .collect();
        self.slot_manager.apply_results(results);
    }

    /// Writes state on every action-producing tick and at most every
    /// `save_cooldown` otherwise, bounding I/O.
    async fn persist(&self, action_produced: bool) {
        let should_write = {
            let mut last = self.last_persist.lock();
            if action_produced || last.elapsed() >= self.save_cooldown {
                *last = Instant::now();
                true
            } else {
                false
            }
        };
        if !should_write {
            return;
        }

        let snapshot = self.slot_manager.get_snapshot_pb();
        let mut state = GridState::new(self.symbol.clone(), self.strategy_id.clone());
        state.slots = snapshot.values().cloned().collect();
        state.breaker_state = Some(self.breaker.lock().snapshot());
        state.last_price = *self.last_price.lock();
        state.last_update_time_ms = chrono::Utc::now().timestamp_millis() as u64;

        match self.store.save(&state) {
            Ok(()) => {
                *self.consecutive_persist_failures.lock() = 0;
            }
            Err(e) => {
                log::error!("[COORDINATOR] persistence failure: {}", e);
                let exceeded = {
                    let mut failures = self.consecutive_persist_failures.lock();
                    *failures += 1;
                    *failures > MAX_CONSECUTIVE_PERSIST_FAILURES
                };
                if exceeded {
                    self.breaker.lock().open("sustained_persistence_failure");
                }
            }
        }
    }
}

fn total_inventory(snapshot: &std::collections::BTreeMap<PriceKey, crate::slot::Slot>) -> Decimal {
    snapshot
        .values()
        .filter(|s| s.has_inventory())
        .map(|s| match s.side {
            Side::Buy => s.position_qty,
            Side::Sell => -s.position_qty,
        })
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit_breaker::BreakerConfig;
    use crate::exchange::{ExchangePort, OrderSide, PlaceOrderRequest, SimExchange, TimeInForce};
    use crate::risk_monitor::{Candle, GlobalStrategy, RiskMonitor};
    use crate::slot::{PositionStatus, SlotStatus};
    use crate::slot_manager::ActionOutcome;
    use crate::store::Store;
    use rust_decimal_macros::dec;

    fn strategy_cfg() -> StrategyConfig {
        StrategyConfig {
            base_interval: dec!(10),
            buy_window_size: 2,
            sell_window_size: 2,
            order_quantity: dec!(0.01),
            tick_scale: 100,
            enable_dynamic_interval: false,
            volatility_scale: 1.0,
            baseline_atr: 1.0,
            enable_skew: false,
            skew_factor: 0.0,
            target_inventory: Decimal::ZERO,
            max_client_oid_len: 36,
        }
    }

    /// S3: a risk trigger cancels every resting BUY order but leaves SELL
    /// orders standing, and blocks new BUY placements while triggered.
    #[tokio::test]
    async fn risk_trigger_cancels_buys_but_keeps_sells() {
        let exchange = Arc::new(SimExchange::new(dec!(10_000)));
        let slot_manager = Arc::new(SlotManager::new());

        let buy_key = PriceKey::from_decimal(dec!(990), 100);
        let sell_key = PriceKey::from_decimal(dec!(1010), 100);
        slot_manager.ensure_slot(buy_key, dec!(990), Side::Buy, "buy-oid".into());
        slot_manager.ensure_slot(sell_key, dec!(1010), Side::Sell, "sell-oid".into());

        let buy_ack = exchange
            .place_order(PlaceOrderRequest {
                symbol: "BTC".into(),
                side: OrderSide::Buy,
                price: dec!(990),
                qty: dec!(0.01),
                tif: TimeInForce::GoodTilCancel,
                reduce_only: false,
                post_only: false,
                client_oid: "buy-oid".into(),
            })
            .await
            .unwrap();
        let sell_ack = exchange
            .place_order(PlaceOrderRequest {
                symbol: "BTC".into(),
                side: OrderSide::Sell,
                price: dec!(1010),
                qty: dec!(0.01),
                tif: TimeInForce::GoodTilCancel,
                reduce_only: false,
                post_only: false,
                client_oid: "sell-oid".into(),
            })
            .await
            .unwrap();

        for (key, oid) in [(buy_key, "buy-oid"), (sell_key, "sell-oid")] {
            slot_manager.mark_pending(&[crate::strategy::Action::Place {
                price_key: key,
                price: PriceKey::to_decimal(key, 100),
                side: if key == buy_key { Side::Buy } else { Side::Sell },
                qty: dec!(0.01),
                client_oid: oid.into(),
            }]);
        }
        slot_manager.apply_results(vec![
            ActionOutcome::Placed { price_key: buy_key, order_id: buy_ack.order_id },
            ActionOutcome::Placed { price_key: sell_key, order_id: sell_ack.order_id },
        ]);

        let mut risk_monitor = RiskMonitor::new(&["BTC".into()], 5, 2.0, 1, GlobalStrategy::All);
        for _ in 0..5 {
            risk_monitor.on_candle("BTC", Candle { open: 100.0, high: 100.0, low: 100.0, close: 100.0, volume: 1000.0, closed: true });
        }
        risk_monitor.on_candle("BTC", Candle { open: 100.0, high: 100.0, low: 100.0, close: 90.0, volume: 5000.0, closed: false });
        assert!(risk_monitor.is_triggered());

        let coordinator = GridCoordinator::new(
            "BTC".into(),
            "grid-1".into(),
            strategy_cfg(),
            Duration::from_secs(60),
            Duration::from_millis(500),
            vec!["BTC".into()],
            "1m".into(),
            exchange.clone() as Arc<dyn ExchangePort>,
            Arc::new(PriceMonitor::new(&["BTC".into()], Duration::from_secs(5))),
            risk_monitor,
            CircuitBreaker::new(BreakerConfig::default()),
            slot_manager.clone(),
            OrderExecutor::new("BTC", crate::executor::ExecutorConfig::default()),
            Reconciler::new(crate::reconciler::ReconcilerConfig::default(), 100),
            Store::new(std::env::temp_dir().join("grid_coordinator_test_risk_trigger.json")),
        );
        *coordinator.state.lock() = CoordinatorState::Running;

        coordinator.on_price_tick(dec!(1000)).await;

        let open_orders = exchange.get_open_orders("BTC").await.unwrap();
        assert!(!open_orders.iter().any(|o| o.order_id == buy_ack.order_id));
        assert!(open_orders.iter().any(|o| o.order_id == sell_ack.order_id));

        let snap = slot_manager.snapshot();
        assert_eq!(snap[&buy_key].slot_status, SlotStatus::Free);
        assert_eq!(snap[&sell_key].slot_status, SlotStatus::Locked);
        assert_eq!(snap[&sell_key].position_status, PositionStatus::Empty);
        assert_eq!(coordinator.state(), CoordinatorState::HaltedBuys);
    }

    /// Spec §7: a single dropped persistence write just skips that tick, but
    /// a sustained run of failures opens the breaker.
    #[tokio::test]
    async fn sustained_persist_failures_open_breaker() {
        let exchange = Arc::new(SimExchange::new(dec!(10_000)));
        let slot_manager = Arc::new(SlotManager::new());

        // A directory in place of the checkpoint file path: every `save()`
        // attempt fails with an I/O error, deterministically, every call.
        let bad_path = std::env::temp_dir().join("grid_coordinator_test_bad_store_dir");
        let _ = std::fs::remove_file(&bad_path);
        std::fs::create_dir_all(&bad_path).unwrap();

        let coordinator = GridCoordinator::new(
            "BTC".into(),
            "grid-1".into(),
            strategy_cfg(),
            Duration::from_secs(60),
            Duration::from_millis(0),
            vec!["BTC".into()],
            "1m".into(),
            exchange.clone() as Arc<dyn ExchangePort>,
            Arc::new(PriceMonitor::new(&["BTC".into()], Duration::from_secs(5))),
            RiskMonitor::new(&["BTC".into()], 5, 2.0, 1, GlobalStrategy::All),
            CircuitBreaker::new(BreakerConfig::default()),
            slot_manager.clone(),
            OrderExecutor::new("BTC", crate::executor::ExecutorConfig::default()),
            Reconciler::new(crate::reconciler::ReconcilerConfig::default(), 100),
            Store::new(bad_path.clone()),
        );
        *coordinator.state.lock() = CoordinatorState::Running;

        for _ in 0..(MAX_CONSECUTIVE_PERSIST_FAILURES as usize + 1) {
            coordinator.persist(true).await;
        }

        assert!(coordinator.breaker.lock().is_tripped());
        assert_eq!(coordinator.breaker.lock().reason(), Some("sustained_persistence_failure"));

        let _ = std::fs::remove_dir(&bad_path);
        let mut tmp_path = bad_path.into_os_string();
        tmp_path.push(".tmp");
        let _ = std::fs::remove_file(&tmp_path);
    }

    /// An `ExchangePort` that rejects every placement with `InvalidParam`,
    /// standing in for a strategy/symbol-metadata bug the exchange refuses.
    struct InvalidParamExchange {
        inner: SimExchange,
    }

    #[async_trait::async_trait]
    impl ExchangePort for InvalidParamExchange {
        async fn place_order(
            &self,
            _req: crate::exchange::PlaceOrderRequest,
        ) -> Result<crate::exchange::OrderAck, crate::error::ExchangeError> {
            Err(crate::error::ExchangeError::InvalidParam("bad tick size".into()))
        }
        async fn cancel_order(&self, symbol: &str, order_id: u64) -> Result<(), crate::error::ExchangeError> {
            self.inner.cancel_order(symbol, order_id).await
        }
        async fn batch_cancel(&self, symbol: &str, order_ids: &[u64]) -> Vec<crate::exchange::CancelOutcome> {
            self.inner.batch_cancel(symbol, order_ids).await
        }
        async fn get_open_orders(&self, symbol: &str) -> Result<Vec<crate::exchange::OpenOrder>, crate::error::ExchangeError> {
            self.inner.get_open_orders(symbol).await
        }
        async fn get_positions(&self, symbol: &str) -> Result<Vec<crate::exchange::ExchangePosition>, crate::error::ExchangeError> {
            self.inner.get_positions(symbol).await
        }
        async fn get_account(&self) -> Result<crate::exchange::AccountInfo, crate::error::ExchangeError> {
            self.inner.get_account().await
        }
        fn stream_prices(&self, symbols: &[String]) -> mpsc::Receiver<crate::exchange::StreamEvent<(String, crate::exchange::PriceTick)>> {
            self.inner.stream_prices(symbols)
        }
        fn stream_orders(&self) -> mpsc::Receiver<crate::exchange::StreamEvent<OrderUpdate>> {
            self.inner.stream_orders()
        }
        fn stream_klines(&self, symbols: &[String], interval: &str) -> mpsc::Receiver<crate::exchange::StreamEvent<(String, crate::exchange::Candle)>> {
            self.inner.stream_klines(symbols, interval)
        }
    }

    /// Spec §7: `InvalidParam` on a placement is not retried and is not a
    /// mere dropped tick — it indicates a strategy/symbol-metadata bug, so
    /// the coordinator raises the breaker to halt new entries.
    #[tokio::test]
    async fn invalid_param_rejection_opens_breaker() {
        let exchange = Arc::new(InvalidParamExchange { inner: SimExchange::new(dec!(10_000)) });
        let slot_manager = Arc::new(SlotManager::new());

        let coordinator = GridCoordinator::new(
            "BTC".into(),
            "grid-1".into(),
            strategy_cfg(),
            Duration::from_secs(60),
            Duration::from_millis(500),
            vec!["BTC".into()],
            "1m".into(),
            exchange.clone() as Arc<dyn ExchangePort>,
            Arc::new(PriceMonitor::new(&["BTC".into()], Duration::from_secs(5))),
            RiskMonitor::new(&["BTC".into()], 5, 2.0, 1, GlobalStrategy::All),
            CircuitBreaker::new(BreakerConfig::default()),
            slot_manager.clone(),
            OrderExecutor::new("BTC", crate::executor::ExecutorConfig::default()),
            Reconciler::new(crate::reconciler::ReconcilerConfig::default(), 100),
            Store::new(std::env::temp_dir().join("grid_coordinator_test_invalid_param.json")),
        );
        *coordinator.state.lock() = CoordinatorState::Running;

        coordinator.on_price_tick(dec!(1000)).await;

        assert!(coordinator.breaker.lock().is_tripped());
        assert_eq!(coordinator.breaker.lock().reason(), Some("invalid_param_rejection"));
    }
}
