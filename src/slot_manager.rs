//! Thread-safe slot map: the full per-slot lifecycle, with a manager-lock
//! then slot-lock acquisition discipline enforced structurally — every
//! method here takes the manager lock first and the per-slot lock second,
//! and none hands back a guard a caller could use to re-enter in the other
//! order.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use rust_decimal::Decimal;

use crate::slot::{PriceKey, PositionStatus, Side, Slot, SlotStatus};
use crate::strategy::Action;

/// Outcome of submitting one action to the executor, fed back via
/// `apply_results`.
#[derive(Debug, Clone)]
pub enum ActionOutcome {
    Placed { price_key: PriceKey, order_id: u64 },
    PlaceFailed { price_key: PriceKey },
    /// Distinguished from a plain `PlaceFailed` so the coordinator can raise
    /// the circuit breaker (spec §7: "InvalidParam: indicates strategy or
    /// symbol-metadata bug; raise and halt new entries via breaker").
    PlaceRejectedInvalidParam { price_key: PriceKey },
    Canceled { price_key: PriceKey },
    CancelFailed { price_key: PriceKey },
}

/// An order-update event from the exchange stream, routed by `order_id`.
#[derive(Debug, Clone)]
pub struct OrderUpdate {
    pub order_id: u64,
    pub status: OrderUpdateStatus,
    pub executed_qty: Decimal,
    pub update_time_ms: u64,
}

/// The fill facts `on_order_update` hands back to the coordinator so it can
/// feed the circuit breaker's realized-PnL ledger — the slot itself only
/// tracks position, not PnL attribution.
#[derive(Debug, Clone, Copy)]
pub struct FillEvent {
    pub side: Side,
    pub price: Decimal,
    pub executed_qty: Decimal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderUpdateStatus {
    Filled,
    Canceled,
    Rejected,
    PartiallyFilled,
}

struct Inner {
    slots: HashMap<PriceKey, Arc<Mutex<Slot>>>,
    order_id_index: HashMap<u64, PriceKey>,
    pending_oids: HashSet<String>,
    last_update_time: HashMap<PriceKey, u64>,
}

/// Owns the slot map. One `RwLock` protects the map and the
/// order_id->slot index (manager lock); per-slot `Mutex`es protect
/// individual slot fields. Every method here takes the manager lock first
/// and the per-slot lock second, and none returns a guard that would let a
/// caller take them in the other order.
pub struct SlotManager {
    inner: RwLock<Inner>,
}

impl SlotManager {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner {
                slots: HashMap::new(),
                order_id_index: HashMap::new(),
                pending_oids: HashSet::new(),
                last_update_time: HashMap::new(),
            }),
        }
    }

    /// Lazily creates a FREE slot for a price level the active window now
    /// covers, if one doesn't already exist. Called by the coordinator
    /// before taking a strategy snapshot.
    pub fn ensure_slot(&self, price_key: PriceKey, price: Decimal, side: Side, client_oid: String) {
        let mut inner = self.inner.write();
        inner
            .slots
            .entry(price_key)
            .or_insert_with(|| Arc::new(Mutex::new(Slot::new_free(price_key, price, side, client_oid))));
    }

    /// Reinserts a slot exactly as persisted — status, order_id,
    /// position_qty and all — for the boot-time restore path. Unlike
    /// `ensure_slot`, which only ever fabricates a fresh FREE slot, this
    /// preserves whatever lifecycle state the store captured, and reindexes
    /// `order_id_index` for a restored LOCKED slot so `on_order_update` can
    /// still route a later fill or cancel to it. Without this, a restart
    /// would silently reset every slot to FREE+EMPTY regardless of what was
    /// actually checkpointed.
    pub fn restore_slot(&self, slot: Slot) {
        let mut inner = self.inner.write();
        let price_key = slot.price_key;
        if slot.slot_status == SlotStatus::Locked && slot.order_id != 0 {
            inner.order_id_index.insert(slot.order_id, price_key);
        }
        inner.slots.insert(price_key, Arc::new(Mutex::new(slot)));
    }

    /// Deep-copy snapshot for the strategy and the reconciler: values, not
    /// shared references, so neither can observe concurrent mutation.
    pub fn snapshot(&self) -> BTreeMap<PriceKey, Slot> {
        let inner = self.inner.read();
        inner
            .slots
            .iter()
            .map(|(k, v)| (*k, v.lock().clone()))
            .collect()
    }

    /// Alias for `snapshot`, named to match the durable/RPC use case: a
    /// mutex-free deep copy for persistence and external inspection.
    pub fn get_snapshot_pb(&self) -> BTreeMap<PriceKey, Slot> {
        self.snapshot()
    }

    /// Transitions FREE -> PENDING for each PLACE action, atomically with
    /// the decision to execute (called while still holding the same manager
    /// write lock that protected the strategy snapshot). Skips any
    /// client_oid already pending, which is what prevents double-placement
    /// under concurrent ticks.
    pub fn mark_pending(&self, actions: &[Action]) {
        let mut inner = self.inner.write();
        for action in actions {
            if let Action::Place {
                price_key,
                client_oid,
                qty,
                ..
            } = action
            {
                if inner.pending_oids.contains(client_oid) {
                    continue;
                }
                if let Some(slot) = inner.slots.get(price_key).cloned() {
                    let mut slot = slot.lock();
                    if slot.slot_status == SlotStatus::Free {
                        slot.slot_status = SlotStatus::Pending;
                        slot.original_qty = *qty;
                        inner.pending_oids.insert(client_oid.clone());
                    }
                }
            }
        }
    }

    /// PENDING -> LOCKED with the new order_id on success; PENDING -> FREE
    /// on failure. A successful cancel transitions LOCKED -> FREE and clears
    /// the order_id index. A *failed* cancel leaves the slot exactly as it
    /// was — the order is still resting on the exchange — so it stays
    /// LOCKED and indexed; freeing it here would orphan a live order that
    /// `on_order_update` could no longer route a fill or cancel back to, and
    /// that the reconciler's orphan sweep would never catch either (the
    /// slot's `client_oid` still matches it).
    pub fn apply_results(&self, results: Vec<ActionOutcome>) {
        let mut inner = self.inner.write();
        for outcome in results {
            match outcome {
                ActionOutcome::Placed { price_key, order_id } => {
                    if let Some(slot) = inner.slots.get(&price_key).cloned() {
                        let mut slot = slot.lock();
                        inner.pending_oids.remove(&slot.client_oid);
                        slot.slot_status = SlotStatus::Locked;
                        slot.order_id = order_id;
                        inner.order_id_index.insert(order_id, price_key);
                    }
                }
                ActionOutcome::PlaceFailed { price_key } | ActionOutcome::PlaceRejectedInvalidParam { price_key } => {
                    if let Some(slot) = inner.slots.get(&price_key).cloned() {
                        let mut slot = slot.lock();
                        inner.pending_oids.remove(&slot.client_oid);
                        slot.slot_status = SlotStatus::Free;
                    }
                }
                ActionOutcome::Canceled { price_key } => {
                    if let Some(slot) = inner.slots.get(&price_key).cloned() {
                        let mut slot = slot.lock();
                        if slot.position_status == PositionStatus::Empty {
                            inner.order_id_index.remove(&slot.order_id);
                            slot.order_id = 0;
                            slot.slot_status = SlotStatus::Free;
                        }
                    }
                }
                ActionOutcome::CancelFailed { .. } => {
                    // order is still resting on the exchange; nothing to do.
                }
            }
        }
    }

    /// Routes an order-update event to the slot by order_id index.
    /// Out-of-order updates (older than the last applied update for that
    /// slot) are dropped.
    pub fn on_order_update(&self, update: OrderUpdate) -> Option<FillEvent> {
        let inner = self.inner.read();
        let price_key = *inner.order_id_index.get(&update.order_id)?;
        let slot_arc = inner.slots.get(&price_key)?.clone();
        let last_seen = inner.last_update_time.get(&price_key).copied().unwrap_or(0);
        drop(inner);

        if update.update_time_ms < last_seen {
            return None;
        }

        let mut fill = None;
        {
            let mut slot = slot_arc.lock();
            match update.status {
                OrderUpdateStatus::Filled => {
                    slot.position_qty += update.executed_qty;
                    slot.position_status = PositionStatus::Filled;
                    slot.slot_status = SlotStatus::Free;
                    slot.order_id = 0;
                    fill = Some(FillEvent { side: slot.side, price: slot.price, executed_qty: update.executed_qty });
                }
                OrderUpdateStatus::PartiallyFilled => {
                    slot.position_qty += update.executed_qty;
                    slot.position_status = PositionStatus::Filled;
                    fill = Some(FillEvent { side: slot.side, price: slot.price, executed_qty: update.executed_qty });
                }
                OrderUpdateStatus::Canceled | OrderUpdateStatus::Rejected => {
                    slot.slot_status = SlotStatus::Free;
                    slot.order_id = 0;
                }
            }
        }

        let mut inner = self.inner.write();
        inner.last_update_time.insert(price_key, update.update_time_ms);
        if matches!(update.status, OrderUpdateStatus::Filled | OrderUpdateStatus::Canceled | OrderUpdateStatus::Rejected) {
            inner.order_id_index.remove(&update.order_id);
        }
        fill
    }

    /// Brings local inventory to a given total by adjusting the filled slot
    /// nearest the current reference price. Only invoked by the reconciler
    /// for small divergence (`δ < 5%`); large divergence opens the breaker
    /// instead of calling this.
    pub fn force_sync(&self, exchange_qty: Decimal, reference_price: Decimal, tick_scale: i64) {
        let inner = self.inner.read();
        let reference_key = PriceKey::from_decimal(reference_price, tick_scale);

        let filled: Vec<(PriceKey, Arc<Mutex<Slot>>)> = inner
            .slots
            .iter()
            .filter(|(_, s)| s.lock().has_inventory())
            .map(|(k, v)| (*k, v.clone()))
            .collect();

        drop(inner);

        // Aggregate across every filled slot, signed the same way the
        // reconciler's own local-net computation is: Buy positive, Sell
        // negative. The nearest-slot adjustment below must close the gap
        // between this total and `exchange_qty`, not just its own qty.
        let local_total: Decimal = filled
            .iter()
            .map(|(_, v)| {
                let slot = v.lock();
                match slot.side {
                    Side::Buy => slot.position_qty,
                    Side::Sell => -slot.position_qty,
                }
            })
            .sum();

        let nearest = filled
            .into_iter()
            .min_by_key(|(k, _)| (k.0 - reference_key.0).abs())
            .map(|(_, v)| v);

        if let Some(slot_arc) = nearest {
            let mut slot = slot_arc.lock();
            let delta = exchange_qty - local_total;
            let signed_qty = match slot.side {
                Side::Buy => slot.position_qty,
                Side::Sell => -slot.position_qty,
            } + delta;
            slot.position_qty = signed_qty.abs();
            slot.position_status = if slot.position_qty > Decimal::ZERO {
                PositionStatus::Filled
            } else {
                PositionStatus::Empty
            };
            log::info!(
                "[SLOT_MANAGER] force_sync adjusted nearest slot by {} to bring local_total={} to exchange_qty={}",
                delta,
                local_total,
                exchange_qty
            );
        } else {
            log::warn!(
                "[SLOT_MANAGER] force_sync({}): no filled slot to adjust, inventory remains unreconciled",
                exchange_qty
            );
        }
    }

    /// Transitions a PENDING slot to LOCKED (its client_oid exists on the
    /// exchange) or FREE (it doesn't) — the crash-recovery path in S4.
    pub fn resolve_pending_from_reconciliation(&self, client_oid: &str, found_order_id: Option<u64>) {
        let mut inner = self.inner.write();
        let key = inner
            .slots
            .iter()
            .find(|(_, s)| s.lock().client_oid == client_oid)
            .map(|(k, _)| *k);
        if let Some(key) = key {
            inner.pending_oids.remove(client_oid);
            if let Some(slot_arc) = inner.slots.get(&key).cloned() {
                let mut slot = slot_arc.lock();
                if slot.slot_status == SlotStatus::Pending {
                    match found_order_id {
                        Some(order_id) => {
                            slot.slot_status = SlotStatus::Locked;
                            slot.order_id = order_id;
                            inner.order_id_index.insert(order_id, key);
                        }
                        None => {
                            slot.slot_status = SlotStatus::Free;
                        }
                    }
                }
            }
        }
    }

    pub fn pending_client_oid_count(&self) -> usize {
        self.inner.read().pending_oids.len()
    }

    /// Resolves a LOCKED slot whose order vanished from the exchange's open
    /// orders during a reconciliation sweep — the reconciler's "missing
    /// orders" path (§4.8). If `filled` the disappearance is attributed to a
    /// fill missed during a disconnect and a FILLED transition is
    /// synthesized with `fill_qty`; otherwise it is treated as a plain
    /// cancel (LOCKED -> FREE).
    pub fn synthesize_missing_order(&self, price_key: PriceKey, filled: bool, fill_qty: Decimal) {
        let mut inner = self.inner.write();
        let slot_arc = match inner.slots.get(&price_key).cloned() {
            Some(s) => s,
            None => return,
        };
        let mut slot = slot_arc.lock();
        if slot.slot_status != SlotStatus::Locked {
            return;
        }
        inner.order_id_index.remove(&slot.order_id);
        if filled {
            slot.position_qty += fill_qty;
            slot.position_status = PositionStatus::Filled;
        }
        slot.slot_status = SlotStatus::Free;
        slot.order_id = 0;
    }
}

impl Default for SlotManager {
    fn default() -> Self {
        Self::new()
    }
}
