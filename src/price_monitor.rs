//! Single source of truth for last trade price: a latest-snapshot-per-symbol
//! store behind a lock, with tick fan-out and a stale-feed watch tightened to
//! a 1s cadence, since a price-tick gap is a harder real-time requirement
//! than an L2-book gap.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use rust_decimal::Decimal;
use tokio::sync::broadcast;

#[derive(Debug, Clone, Copy)]
pub struct PriceSample {
    pub price: Decimal,
    pub ts_ms: u64,
}

#[derive(Debug, Clone, Copy)]
pub struct PriceTick {
    pub symbol_index: usize,
    pub price: Decimal,
    pub ts_ms: u64,
}

struct TrackedSymbol {
    latest: Option<PriceSample>,
    last_seen: Instant,
}

/// Holds the latest price per symbol; `latest` returns `None` until the
/// first tick arrives, which is what makes "no order before first tick" a
/// type-level fact rather than a convention — callers cannot build a
/// decision snapshot without unwrapping a real sample.
pub struct PriceMonitor {
    symbols: RwLock<HashMap<String, TrackedSymbol>>,
    tx: broadcast::Sender<PriceTick>,
    stale_after: Duration,
}

impl PriceMonitor {
    pub fn new(symbols: &[String], stale_after: Duration) -> Self {
        let (tx, _rx) = broadcast::channel(1024);
        Self {
            symbols: RwLock::new(
                symbols
                    .iter()
                    .map(|s| {
                        (
                            s.clone(),
                            TrackedSymbol {
                                latest: None,
                                last_seen: Instant::now(),
                            },
                        )
                    })
                    .collect(),
            ),
            tx,
            stale_after,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PriceTick> {
        self.tx.subscribe()
    }

    pub fn on_tick(&self, symbol: &str, price: Decimal, ts_ms: u64) {
        let mut symbols = self.symbols.write();
        let index = symbols.keys().position(|k| k == symbol).unwrap_or(0);
        let entry = symbols
            .entry(symbol.to_string())
            .or_insert_with(|| TrackedSymbol {
                latest: None,
                last_seen: Instant::now(),
            });
        entry.latest = Some(PriceSample { price, ts_ms });
        entry.last_seen = Instant::now();
        drop(symbols);

        let _ = self.tx.send(PriceTick {
            symbol_index: index,
            price,
            ts_ms,
        });
    }

    pub fn latest(&self, symbol: &str) -> Option<PriceSample> {
        self.symbols.read().get(symbol).and_then(|s| s.latest)
    }

    pub fn has_ticked(&self, symbol: &str) -> bool {
        self.latest(symbol).is_some()
    }

    /// A stale-tick guard: no order placement decision is blocked by this —
    /// it only raises a health signal. By the time a feed is this stale the
    /// risk monitor is expected to have already tripped.
    pub fn is_stalled(&self, symbol: &str) -> bool {
        self.symbols
            .read()
            .get(symbol)
            .map(|s| s.last_seen.elapsed() > self.stale_after)
            .unwrap_or(true)
    }

    pub fn stalled_symbols(&self) -> Vec<String> {
        self.symbols
            .read()
            .iter()
            .filter(|(_, s)| s.last_seen.elapsed() > self.stale_after)
            .map(|(k, _)| k.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn no_price_before_first_tick() {
        let pm = PriceMonitor::new(&["BTC".into()], Duration::from_secs(5));
        assert!(pm.latest("BTC").is_none());
        assert!(!pm.has_ticked("BTC"));
    }

    #[test]
    fn tick_updates_latest() {
        let pm = PriceMonitor::new(&["BTC".into()], Duration::from_secs(5));
        pm.on_tick("BTC", dec!(100), 1);
        assert_eq!(pm.latest("BTC").unwrap().price, dec!(100));
    }

    #[test]
    fn fresh_symbol_is_not_stalled() {
        let pm = PriceMonitor::new(&["BTC".into()], Duration::from_secs(5));
        pm.on_tick("BTC", dec!(100), 1);
        assert!(!pm.is_stalled("BTC"));
    }

    #[test]
    fn unknown_symbol_is_treated_as_stalled() {
        let pm = PriceMonitor::new(&["BTC".into()], Duration::from_secs(5));
        assert!(pm.is_stalled("ETH"));
    }
}
