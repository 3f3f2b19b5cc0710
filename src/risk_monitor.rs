//! Per-symbol anomaly detector: volume spike + price drop, with ATR export,
//! over a bounded rolling window of closed candles.

use std::collections::{HashMap, VecDeque};

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum GlobalStrategy {
    Any,
    All,
}

/// An event published on the alert fan-out when the global trigger flips.
/// Back-pressure policy is deliberately lossy here (spec §9): a full
/// outbound queue blocks every other stream in this engine, but a slow risk
/// subscriber must never stall candle ingestion, so this uses `broadcast`
/// and accepts dropped alerts for lagging receivers rather than applying
/// the engine's usual block-on-full-queue policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RiskAlert {
    Triggered,
    Recovered,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Candle {
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    pub closed: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerReason {
    VolumeSpike,
    PriceDrop,
    Both,
}

struct SymbolWindow {
    window: usize,
    candles: VecDeque<Candle>,
    triggered: bool,
}

impl SymbolWindow {
    fn new(window: usize) -> Self {
        Self {
            window,
            candles: VecDeque::new(),
            triggered: false,
        }
    }

    /// Closed candles contribute to the rolling average; the latest candle
    /// (open or closed) is evaluated against it so the trigger can fire
    /// intra-bar.
    fn closed_iter(&self) -> impl Iterator<Item = &Candle> {
        self.candles.iter().filter(|c| c.closed)
    }

    fn push_closed(&mut self, candle: Candle) {
        if self.candles.len() >= self.window {
            self.candles.pop_front();
        }
        self.candles.push_back(candle);
    }

    fn avg_volume(&self) -> f64 {
        let closed: Vec<&Candle> = self.closed_iter().collect();
        if closed.is_empty() {
            return 0.0;
        }
        closed.iter().map(|c| c.volume).sum::<f64>() / closed.len() as f64
    }

    fn avg_close(&self) -> f64 {
        let closed: Vec<&Candle> = self.closed_iter().collect();
        if closed.is_empty() {
            return 0.0;
        }
        closed.iter().map(|c| c.close).sum::<f64>() / closed.len() as f64
    }

    fn atr(&self) -> f64 {
        let closed: Vec<&Candle> = self.closed_iter().collect();
        if closed.is_empty() {
            return 0.0;
        }
        let mut true_ranges = Vec::with_capacity(closed.len());
        let mut prev_close: Option<f64> = None;
        for c in &closed {
            let range = match prev_close {
                Some(prev) => (c.high - c.low)
                    .max((c.high - prev).abs())
                    .max((c.low - prev).abs()),
                None => c.high - c.low,
            };
            true_ranges.push(range);
            prev_close = Some(c.close);
        }
        true_ranges.iter().sum::<f64>() / true_ranges.len() as f64
    }
}

/// Evaluates volume-spike + price-drop anomalies across a set of monitored
/// symbols, with configurable Any/All aggregation for the global trigger.
pub struct RiskMonitor {
    volume_multiplier: f64,
    window: usize,
    recovery_threshold: usize,
    global_strategy: GlobalStrategy,
    symbols: HashMap<String, SymbolWindow>,
    /// Latched global trigger. Set the instant the Any/All condition holds;
    /// cleared only once `has_recovered()` holds (spec §4.3 recovery), not
    /// merely when the instantaneous condition stops holding.
    global_triggered: bool,
    alert_tx: broadcast::Sender<RiskAlert>,
}

impl RiskMonitor {
    pub fn new(
        symbols: &[String],
        window: usize,
        volume_multiplier: f64,
        recovery_threshold: usize,
        global_strategy: GlobalStrategy,
    ) -> Self {
        let (alert_tx, _rx) = broadcast::channel(64);
        Self {
            volume_multiplier,
            window,
            recovery_threshold,
            global_strategy,
            symbols: symbols
                .iter()
                .map(|s| (s.clone(), SymbolWindow::new(window)))
                .collect(),
            global_triggered: false,
            alert_tx,
        }
    }

    /// Subscribes to the trigger/recovery alert fan-out (spec §4.3).
    pub fn subscribe(&self) -> broadcast::Receiver<RiskAlert> {
        self.alert_tx.subscribe()
    }

    /// Feeds a candle for a symbol. `latest` is evaluated against the window
    /// of prior closed candles regardless of whether it itself is closed;
    /// only closed candles are folded into the rolling window afterward.
    pub fn on_candle(&mut self, symbol: &str, latest: Candle) {
        let sw = match self.symbols.get_mut(symbol) {
            Some(sw) => sw,
            None => {
                self.symbols
                    .insert(symbol.to_string(), SymbolWindow::new(self.window));
                self.symbols.get_mut(symbol).unwrap()
            }
        };

        let avg_volume = sw.avg_volume();
        let avg_close = sw.avg_close();
        let has_history = sw.closed_iter().next().is_some();

        let volume_spike = has_history && latest.volume > avg_volume * self.volume_multiplier;
        let price_drop = has_history && latest.close < avg_close;
        sw.triggered = volume_spike && price_drop;

        if latest.closed {
            sw.push_closed(latest);
        }

        let instantaneous = self.instantaneous_trigger();
        if instantaneous && !self.global_triggered {
            self.global_triggered = true;
            let _ = self.alert_tx.send(RiskAlert::Triggered);
        } else if !instantaneous && self.global_triggered && self.has_recovered() {
            self.global_triggered = false;
            let _ = self.alert_tx.send(RiskAlert::Recovered);
        }
    }

    fn instantaneous_trigger(&self) -> bool {
        if self.symbols.is_empty() {
            return false;
        }
        match self.global_strategy {
            GlobalStrategy::Any => self.symbols.values().any(|sw| sw.triggered),
            GlobalStrategy::All => self.symbols.values().all(|sw| sw.triggered),
        }
    }

    /// Whether the global trigger is latched. Clears only through
    /// `has_recovered()`'s hysteresis, not merely when the instantaneous
    /// per-candle condition stops holding.
    pub fn is_triggered(&self) -> bool {
        self.global_triggered
    }

    /// True once at least `recovery_threshold` symbols show normal readings.
    pub fn has_recovered(&self) -> bool {
        let normal = self.symbols.values().filter(|sw| !sw.triggered).count();
        normal >= self.recovery_threshold
    }

    pub fn atr(&self, symbol: &str) -> Option<f64> {
        self.symbols.get(symbol).map(|sw| sw.atr())
    }

    pub fn trigger_reason(&self, symbol: &str) -> Option<TriggerReason> {
        let sw = self.symbols.get(symbol)?;
        if !sw.triggered {
            return None;
        }
        let avg_volume = sw.avg_volume();
        let avg_close = sw.avg_close();
        let latest = sw.candles.back()?;
        let volume_spike = latest.volume > avg_volume * self.volume_multiplier;
        let price_drop = latest.close < avg_close;
        Some(match (volume_spike, price_drop) {
            (true, true) => TriggerReason::Both,
            (true, false) => TriggerReason::VolumeSpike,
            (false, true) => TriggerReason::PriceDrop,
            (false, false) => TriggerReason::Both,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candle(close: f64, volume: f64, closed: bool) -> Candle {
        Candle {
            open: close,
            high: close,
            low: close,
            close,
            volume,
            closed,
        }
    }

    #[test]
    fn no_trigger_without_history() {
        let mut rm = RiskMonitor::new(&["BTC".into()], 5, 2.0, 1, GlobalStrategy::All);
        rm.on_candle("BTC", candle(100.0, 1000.0, true));
        assert!(!rm.is_triggered());
    }

    #[test]
    fn triggers_on_volume_and_price_drop() {
        let mut rm = RiskMonitor::new(&["BTC".into()], 5, 2.0, 1, GlobalStrategy::All);
        for _ in 0..5 {
            rm.on_candle("BTC", candle(100.0, 1000.0, true));
        }
        rm.on_candle("BTC", candle(90.0, 5000.0, false));
        assert!(rm.is_triggered());
    }

    #[test]
    fn all_strategy_requires_every_symbol() {
        let mut rm = RiskMonitor::new(
            &["BTC".into(), "ETH".into()],
            5,
            2.0,
            1,
            GlobalStrategy::All,
        );
        for _ in 0..5 {
            rm.on_candle("BTC", candle(100.0, 1000.0, true));
            rm.on_candle("ETH", candle(100.0, 1000.0, true));
        }
        rm.on_candle("BTC", candle(90.0, 5000.0, false));
        rm.on_candle("ETH", candle(101.0, 1000.0, false));
        assert!(!rm.is_triggered());
    }

    #[test]
    fn any_strategy_trips_on_single_symbol() {
        let mut rm = RiskMonitor::new(
            &["BTC".into(), "ETH".into()],
            5,
            2.0,
            1,
            GlobalStrategy::Any,
        );
        for _ in 0..5 {
            rm.on_candle("BTC", candle(100.0, 1000.0, true));
            rm.on_candle("ETH", candle(100.0, 1000.0, true));
        }
        rm.on_candle("BTC", candle(90.0, 5000.0, false));
        rm.on_candle("ETH", candle(101.0, 1000.0, false));
        assert!(rm.is_triggered());
    }

    #[test]
    fn trigger_latches_until_recovery_threshold_met() {
        let mut rm = RiskMonitor::new(
            &["BTC".into(), "ETH".into()],
            5,
            2.0,
            2,
            GlobalStrategy::All,
        );
        for _ in 0..5 {
            rm.on_candle("BTC", candle(100.0, 1000.0, true));
            rm.on_candle("ETH", candle(100.0, 1000.0, true));
        }
        // both symbols trigger simultaneously.
        rm.on_candle("BTC", candle(90.0, 5000.0, false));
        rm.on_candle("ETH", candle(90.0, 5000.0, false));
        assert!(rm.is_triggered());

        // BTC recovers but ETH is still anomalous: only 1 of 2 symbols
        // normal, recovery_threshold=2 is not met yet, trigger stays latched
        // even though the instantaneous All condition no longer holds.
        rm.on_candle("BTC", candle(100.0, 1000.0, false));
        assert!(rm.is_triggered());

        // ETH recovers too: both symbols now normal, recovery_threshold met.
        rm.on_candle("ETH", candle(100.0, 1000.0, false));
        assert!(!rm.is_triggered());
    }

    #[tokio::test]
    async fn alert_fan_out_publishes_on_trigger_and_recovery() {
        let mut rm = RiskMonitor::new(&["BTC".into()], 5, 2.0, 1, GlobalStrategy::All);
        let mut alerts = rm.subscribe();

        for _ in 0..5 {
            rm.on_candle("BTC", candle(100.0, 1000.0, true));
        }
        rm.on_candle("BTC", candle(90.0, 5000.0, false));
        assert_eq!(alerts.try_recv().unwrap(), RiskAlert::Triggered);

        rm.on_candle("BTC", candle(100.0, 1000.0, false));
        assert_eq!(alerts.try_recv().unwrap(), RiskAlert::Recovered);
    }

    #[test]
    fn atr_over_flat_window_is_zero() {
        let mut rm = RiskMonitor::new(&["BTC".into()], 5, 2.0, 1, GlobalStrategy::All);
        for _ in 0..5 {
            rm.on_candle("BTC", candle(100.0, 1000.0, true));
        }
        assert_eq!(rm.atr("BTC"), Some(0.0));
    }
}
