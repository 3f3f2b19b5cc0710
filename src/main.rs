//! Thin binary: load config, wire collaborators, run the coordinator. The
//! engine's own logic lives in the library crate; this file is just wiring.

use std::sync::Arc;
use std::time::Duration;

use grid_slot_engine::circuit_breaker::{BreakerConfig, CircuitBreaker};
use grid_slot_engine::config::EngineConfig;
use grid_slot_engine::coordinator::GridCoordinator;
use grid_slot_engine::exchange::{ExchangePort, SimExchange, StreamEvent};
use grid_slot_engine::executor::{ExecutorConfig, OrderExecutor};
use grid_slot_engine::price_monitor::PriceMonitor;
use grid_slot_engine::reconciler::{Reconciler, ReconcilerConfig};
use grid_slot_engine::risk_monitor::RiskMonitor;
use grid_slot_engine::slot_manager::SlotManager;
use grid_slot_engine::store::Store;
use grid_slot_engine::strategy::StrategyConfig;

const TICK_SCALE: i64 = 100;

#[tokio::main]
async fn main() {
    env_logger::init();
    log::info!("grid-slot-engine starting");

    let cfg = EngineConfig::from_env();
    if let Err(e) = cfg.validate() {
        log::error!("[CONFIG] {}", e);
        std::process::exit(1);
    }
    log::info!(
        "symbol={} strategy_id={} base_interval={}",
        cfg.symbol, cfg.strategy_id, cfg.grid.base_interval
    );

    let exchange: Arc<dyn ExchangePort> = Arc::new(SimExchange::new(rust_decimal::Decimal::new(10_000, 0)));

    let price_monitor = Arc::new(PriceMonitor::new(&[cfg.symbol.clone()], Duration::from_secs(5)));

    let risk_monitor = RiskMonitor::new(
        &cfg.risk.risk_symbols,
        cfg.risk.average_window,
        cfg.risk.volume_multiplier,
        cfg.risk.recovery_threshold,
        cfg.risk.global_strategy,
    );

    let breaker = CircuitBreaker::new(BreakerConfig {
        max_consecutive_losses: cfg.breaker.max_consecutive_losses,
        max_drawdown_amount: cfg.breaker.max_drawdown_amount,
        cooldown: cfg.breaker.cooldown,
    });

    let slot_manager = Arc::new(SlotManager::new());

    let executor = OrderExecutor::new(
        cfg.symbol.clone(),
        ExecutorConfig {
            rate_limit_per_sec: cfg.executor.rate_limit_per_sec,
            post_only_retries: cfg.executor.post_only_retries,
            allow_taker_fallback: cfg.executor.allow_taker_fallback,
            ..ExecutorConfig::default()
        },
    );

    let reconciler = Reconciler::new(
        ReconcilerConfig {
            divergence_trip_pct: cfg.reconciler.divergence_trip_pct,
        },
        TICK_SCALE,
    );

    let store = Store::new(&cfg.persistence.path);

    let strategy_config = StrategyConfig {
        base_interval: cfg.grid.base_interval,
        buy_window_size: cfg.grid.buy_window_size,
        sell_window_size: cfg.grid.sell_window_size,
        order_quantity: cfg.grid.order_quantity,
        tick_scale: TICK_SCALE,
        enable_dynamic_interval: cfg.dynamic_interval.enable_dynamic_interval,
        volatility_scale: cfg.dynamic_interval.volatility_scale,
        baseline_atr: cfg.dynamic_interval.baseline_atr,
        enable_skew: cfg.skew.enable_skew,
        skew_factor: cfg.skew.skew_factor,
        target_inventory: cfg.skew.target_inventory,
        max_client_oid_len: 36,
    };

    let coordinator = GridCoordinator::new(
        cfg.symbol.clone(),
        cfg.strategy_id.clone(),
        strategy_config,
        Duration::from_secs(cfg.reconciler.interval_sec),
        Duration::from_millis(cfg.persistence.save_cooldown_ms),
        cfg.risk.risk_symbols.clone(),
        cfg.risk.kline_interval.clone(),
        exchange.clone(),
        price_monitor.clone(),
        risk_monitor,
        breaker,
        slot_manager,
        executor,
        reconciler,
        store,
    );

    // The price monitor is the single source of truth for "latest price";
    // only this task ever writes to it, fed straight from the exchange's
    // websocket stream (steady-state REST polling for price is forbidden).
    {
        let price_feed_exchange = exchange.clone();
        let price_feed_monitor = price_monitor.clone();
        let price_feed_symbol = cfg.symbol.clone();
        tokio::spawn(async move {
            let mut rx = price_feed_exchange.stream_prices(std::slice::from_ref(&price_feed_symbol));
            while let Some(event) = rx.recv().await {
                match event {
                    StreamEvent::Data((symbol, tick)) => {
                        price_feed_monitor.on_tick(&symbol, tick.price, tick.ts_ms);
                    }
                    StreamEvent::Reconnected => {
                        log::info!("[PRICE_FEED] stream reconnected");
                    }
                }
            }
        });
    }

    let (stop_tx, stop_rx) = tokio::sync::mpsc::channel(1);
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        log::warn!("shutdown signal received");
        let _ = stop_tx.send(()).await;
    });

    // Root recovery: the event loop runs in its own task so a panic there
    // surfaces as a `JoinError` here instead of taking the whole process
    // down silently. There is no breaker instance left to close once the
    // loop itself has died, so the recovery is to log and exit cleanly.
    let coordinator = Arc::new(coordinator);
    let loop_handle = {
        let coordinator = coordinator.clone();
        tokio::spawn(async move { coordinator.run(stop_rx).await })
    };
    if let Err(e) = loop_handle.await {
        log::error!("grid-slot-engine event loop panicked: {}", e);
    }
    log::info!("grid-slot-engine stopped");
}
