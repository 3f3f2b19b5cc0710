//! Periodic exchange<->local delta correction: a non-destructive sweep over
//! orphan orders, missing orders, and position divergence. Slots carry
//! long-lived exit-order state, so a reconnect can never cancel-all and
//! start over — it must diff and correct instead.

use std::collections::BTreeMap;

use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;

use crate::circuit_breaker::CircuitBreaker;
use crate::exchange::ExchangePort;
use crate::slot::{PriceKey, PositionStatus, Slot, SlotStatus};
use crate::slot_manager::SlotManager;

#[derive(Debug, Clone, Copy)]
pub struct ReconcilerConfig {
    pub divergence_trip_pct: f64,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            divergence_trip_pct: 5.0,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ReconciliationRecord {
    pub id: u64,
    pub orphans_canceled: usize,
    pub missing_resolved: usize,
    pub pending_resolved: usize,
    pub divergence_pct: f64,
    pub breaker_opened: bool,
}

pub struct Reconciler {
    config: ReconcilerConfig,
    tick_scale: i64,
    next_id: parking_lot::Mutex<u64>,
    running: parking_lot::Mutex<()>,
}

impl Reconciler {
    pub fn new(config: ReconcilerConfig, tick_scale: i64) -> Self {
        Self {
            config,
            tick_scale,
            next_id: parking_lot::Mutex::new(1),
            running: parking_lot::Mutex::new(()),
        }
    }

    /// Runs are serialized: a new run waits for the previous to finish.
    /// Never holds a slot lock while making network calls — everything
    /// network-facing here operates on the deep-copy `snapshot()`.
    pub async fn run(
        &self,
        symbol: &str,
        exchange: &dyn ExchangePort,
        slot_manager: &SlotManager,
        breaker: &mut CircuitBreaker,
    ) -> ReconciliationRecord {
        let _guard = self.running.lock();

        let snapshot = slot_manager.snapshot();

        let open_orders = exchange.get_open_orders(symbol).await.unwrap_or_default();
        let positions = exchange.get_positions(symbol).await.unwrap_or_default();

        let mut record = ReconciliationRecord {
            id: self.next_id(),
            ..Default::default()
        };

        // Crash recovery (S4): a slot left PENDING by a crash between
        // `mark_pending` and the executor's result is resolved against the
        // freshly fetched open-orders set — LOCKED if its client_oid landed
        // on the exchange, FREE otherwise.
        for (_, slot) in snapshot.iter().filter(|(_, s)| s.slot_status == SlotStatus::Pending) {
            let found = open_orders.iter().find(|o| o.client_oid == slot.client_oid);
            slot_manager.resolve_pending_from_reconciliation(&slot.client_oid, found.map(|o| o.order_id));
            record.pending_resolved += 1;
        }

        // Orphan orders: exchange order with no matching local slot by order_id/client_oid.
        for order in &open_orders {
            let matched = snapshot
                .values()
                .any(|s| s.order_id == order.order_id || s.client_oid == order.client_oid);
            if !matched {
                if exchange.cancel_order(symbol, order.order_id).await.is_ok() {
                    record.orphans_canceled += 1;
                }
            }
        }

        // Missing orders: local LOCKED slot with no matching exchange order.
        let exchange_qty_by_symbol: Decimal = positions.iter().map(|p| p.qty).sum();
        let local_qty = total_local_qty(&snapshot);
        for (key, slot) in snapshot.iter().filter(|(_, s)| s.slot_status == SlotStatus::Locked) {
            let still_open = open_orders.iter().any(|o| o.order_id == slot.order_id);
            if still_open {
                continue;
            }
            // A genuine fill moves the exchange position away from the local
            // net by roughly `original_qty` in this slot's direction; a
            // canceled order (lost cancel-ack) leaves that residual near
            // zero regardless of how much inventory other slots hold.
            let expected_delta = match slot.side {
                crate::slot::Side::Buy => slot.original_qty,
                crate::slot::Side::Sell => -slot.original_qty,
            };
            let residual = exchange_qty_by_symbol - local_qty;
            let same_direction = (residual > Decimal::ZERO && expected_delta > Decimal::ZERO)
                || (residual < Decimal::ZERO && expected_delta < Decimal::ZERO);
            let position_increased = same_direction && residual.abs() >= expected_delta.abs() / Decimal::from(2);
            if position_increased {
                slot_manager.synthesize_missing_order(*key, true, slot.original_qty);
            } else {
                slot_manager.synthesize_missing_order(*key, false, Decimal::ZERO);
            }
            record.missing_resolved += 1;
        }

        // Position divergence.
        let epsilon = Decimal::new(1, 8);
        let denom = exchange_qty_by_symbol.abs().max(epsilon);
        let delta = ((exchange_qty_by_symbol - local_qty).abs() / denom)
            .to_f64()
            .unwrap_or(0.0)
            * 100.0;
        record.divergence_pct = delta;

        if delta < self.config.divergence_trip_pct {
            slot_manager.force_sync(
                exchange_qty_by_symbol,
                reference_price_from_snapshot(&snapshot, self.tick_scale),
                self.tick_scale,
            );
        } else {
            breaker.open("large_position_divergence");
            record.breaker_opened = true;
        }

        record
    }

    fn next_id(&self) -> u64 {
        let mut n = self.next_id.lock();
        let id = *n;
        *n += 1;
        id
    }
}

fn total_local_qty(snapshot: &BTreeMap<PriceKey, Slot>) -> Decimal {
    snapshot
        .values()
        .filter(|s| s.position_status == PositionStatus::Filled)
        .map(|s| match s.side {
            crate::slot::Side::Buy => s.position_qty,
            crate::slot::Side::Sell => -s.position_qty,
        })
        .sum()
}

fn reference_price_from_snapshot(snapshot: &BTreeMap<PriceKey, Slot>, tick_scale: i64) -> Decimal {
    snapshot
        .values()
        .find(|s| s.position_status == PositionStatus::Filled)
        .map(|s| s.price)
        .unwrap_or_else(|| PriceKey(0).to_decimal(tick_scale))
}
