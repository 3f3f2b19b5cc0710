//! Pure strategy function: `(price, atr, inventory, slot snapshot) -> actions`.
//! Diffs the active grid window against a persisted slot snapshot, rather
//! than building quotes from scratch each tick, so slots survive across
//! ticks and restarts.

use std::collections::BTreeMap;

use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;
use serde::{Deserialize, Serialize};

use crate::slot::{derive_client_oid, PriceKey, PositionStatus, Side, Slot, SlotStatus};

#[derive(Debug, Clone, Copy)]
pub struct StrategyConfig {
    pub base_interval: Decimal,
    pub buy_window_size: u32,
    pub sell_window_size: u32,
    pub order_quantity: Decimal,
    pub tick_scale: i64,
    pub enable_dynamic_interval: bool,
    pub volatility_scale: f64,
    pub baseline_atr: f64,
    pub enable_skew: bool,
    pub skew_factor: f64,
    pub target_inventory: Decimal,
    pub max_client_oid_len: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Action {
    Place {
        price_key: PriceKey,
        price: Decimal,
        side: Side,
        qty: Decimal,
        client_oid: String,
    },
    Cancel {
        order_id: u64,
        price_key: PriceKey,
    },
}

impl Action {
    fn sort_key(&self, center: PriceKey) -> (u8, i64) {
        match self {
            Action::Cancel { price_key, .. } => (0, (price_key.0 - center.0).abs()),
            Action::Place { price_key, .. } => (1, (price_key.0 - center.0).abs()),
        }
    }
}

/// Computes the effective (volatility-scaled) interval, in price units.
pub fn effective_interval(cfg: &StrategyConfig, atr: f64) -> Decimal {
    if !cfg.enable_dynamic_interval || cfg.baseline_atr <= 0.0 {
        return cfg.base_interval;
    }
    let scale = cfg.volatility_scale * (atr / cfg.baseline_atr);
    let scale = Decimal::from_f64_retain(scale).unwrap_or(Decimal::ONE);
    cfg.base_interval * scale
}

/// Applies inventory skew to the reference price used for centering.
pub fn skewed_reference_price(cfg: &StrategyConfig, current_price: Decimal, inventory: Decimal) -> Decimal {
    if !cfg.enable_skew || cfg.target_inventory.is_zero() {
        return current_price;
    }
    let skew = Decimal::from_f64_retain(cfg.skew_factor).unwrap_or(Decimal::ZERO);
    let bias = Decimal::ONE - skew * (inventory - cfg.target_inventory) / cfg.target_inventory;
    current_price * bias
}

pub fn grid_center(reference_price: Decimal, interval: Decimal, tick_scale: i64) -> PriceKey {
    if interval.is_zero() {
        return PriceKey::from_decimal(reference_price, tick_scale);
    }
    let steps = (reference_price / interval).round();
    PriceKey::from_decimal(steps * interval, tick_scale)
}

/// Levels (by offset count from center) that fall inside the active window
/// for a side, where a positive offset is further from center.
fn window_offsets(window_size: u32) -> impl Iterator<Item = u32> {
    1..=window_size
}

/// The price levels the active buy/sell windows cover for this tick,
/// independent of whether a slot already exists at each level. The
/// coordinator calls this *before* taking its strategy snapshot so it can
/// lazily `ensure_slot` every level the window now covers (spec §3
/// Lifecycle) — `decide()` alone cannot create slots, since it only
/// diffs against the snapshot it's handed.
pub fn active_window_levels(
    cfg: &StrategyConfig,
    current_price: Decimal,
    atr: f64,
    inventory_net_qty: Decimal,
) -> Vec<(PriceKey, Decimal, Side)> {
    let interval = effective_interval(cfg, atr);
    let reference = skewed_reference_price(cfg, current_price, inventory_net_qty);
    let center = grid_center(reference, interval, cfg.tick_scale);

    let mut levels = Vec::with_capacity((cfg.buy_window_size + cfg.sell_window_size) as usize);
    for offset in window_offsets(cfg.buy_window_size) {
        let price = center.to_decimal(cfg.tick_scale) - Decimal::from(offset) * interval;
        let key = PriceKey::from_decimal(price, cfg.tick_scale);
        levels.push((key, key.to_decimal(cfg.tick_scale), Side::Buy));
    }
    for offset in window_offsets(cfg.sell_window_size) {
        let price = center.to_decimal(cfg.tick_scale) + Decimal::from(offset) * interval;
        let key = PriceKey::from_decimal(price, cfg.tick_scale);
        levels.push((key, key.to_decimal(cfg.tick_scale), Side::Sell));
    }
    levels
}

/// Computes the target action list for one tick. Deterministic and
/// side-effect-free: identical inputs always produce a byte-equal action
/// list.
pub fn decide(
    cfg: &StrategyConfig,
    current_price: Decimal,
    atr: f64,
    inventory_net_qty: Decimal,
    slot_snapshot: &BTreeMap<PriceKey, Slot>,
    strategy_id: &str,
    buys_blocked: bool,
) -> Vec<Action> {
    let interval = effective_interval(cfg, atr);
    let reference = skewed_reference_price(cfg, current_price, inventory_net_qty);
    let center = grid_center(reference, interval, cfg.tick_scale);

    let active_levels: BTreeMap<PriceKey, Side> = active_window_levels(cfg, current_price, atr, inventory_net_qty)
        .into_iter()
        .map(|(key, _, side)| (key, side))
        .collect();

    let mut actions = Vec::new();

    let all_keys: std::collections::BTreeSet<PriceKey> = active_levels
        .keys()
        .copied()
        .chain(slot_snapshot.iter().filter(|(_, s)| s.has_inventory()).map(|(k, _)| *k))
        .collect();

    for key in all_keys {
        let in_window = active_levels.contains_key(&key);
        let side = active_levels.get(&key).copied();

        match slot_snapshot.get(&key) {
            None => {
                if in_window {
                    let side = side.unwrap();
                    if side == Side::Buy && buys_blocked {
                        continue;
                    }
                    let client_oid =
                        derive_client_oid(strategy_id, key, side, cfg.max_client_oid_len);
                    actions.push(Action::Place {
                        price_key: key,
                        price: key.to_decimal(cfg.tick_scale),
                        side,
                        qty: cfg.order_quantity,
                        client_oid,
                    });
                }
            }
            Some(slot) => {
                match slot.slot_status {
                    SlotStatus::Free => {
                        if in_window {
                            let side = side.unwrap_or(slot.side);
                            if side == Side::Buy && buys_blocked {
                                continue;
                            }
                            actions.push(Action::Place {
                                price_key: key,
                                price: slot.price,
                                side,
                                qty: cfg.order_quantity,
                                client_oid: slot.client_oid.clone(),
                            });
                        }
                    }
                    SlotStatus::Locked => {
                        if !in_window && slot.position_status == PositionStatus::Empty {
                            actions.push(Action::Cancel {
                                order_id: slot.order_id,
                                price_key: key,
                            });
                        }
                        // in-window or holding inventory: no action (retain exit order).
                    }
                    SlotStatus::Pending => {
                        // awaiting executor result; nothing to do this tick.
                    }
                }
            }
        }
    }

    actions.sort_by_key(|a| a.sort_key(center));
    actions
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn cfg() -> StrategyConfig {
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

    #[test]
    fn s1_trailing_happy_path() {
        let cfg = cfg();
        let mut slots = BTreeMap::new();

        let actions = decide(&cfg, dec!(1000), 1.0, Decimal::ZERO, &slots, "grid-1", false);
        let places: Vec<Decimal> = actions
            .iter()
            .filter_map(|a| match a {
                Action::Place { price, .. } => Some(*price),
                _ => None,
            })
            .collect();
        assert_eq!(places.len(), 4);
        assert!(places.contains(&dec!(980)));
        assert!(places.contains(&dec!(990)));
        assert!(places.contains(&dec!(1010)));
        assert!(places.contains(&dec!(1020)));

        for a in &actions {
            if let Action::Place { price_key, price, side, client_oid, .. } = a {
                slots.insert(
                    *price_key,
                    Slot {
                        price_key: *price_key,
                        price: *price,
                        side: *side,
                        slot_status: SlotStatus::Locked,
                        position_status: PositionStatus::Empty,
                        order_id: price_key.0 as u64,
                        client_oid: client_oid.clone(),
                        original_qty: cfg.order_quantity,
                        position_qty: Decimal::ZERO,
                    },
                );
            }
        }

        let actions2 = decide(&cfg, dec!(1010), 1.0, Decimal::ZERO, &slots, "grid-1", false);
        let cancels: Vec<PriceKey> = actions2
            .iter()
            .filter_map(|a| match a {
                Action::Cancel { price_key, .. } => Some(*price_key),
                _ => None,
            })
            .collect();
        assert!(cancels.contains(&PriceKey::from_decimal(dec!(980), 100)));
    }

    #[test]
    fn purity_same_inputs_same_actions() {
        let cfg = cfg();
        let slots = BTreeMap::new();
        let a = decide(&cfg, dec!(1000), 1.0, Decimal::ZERO, &slots, "grid-1", false);
        let b = decide(&cfg, dec!(1000), 1.0, Decimal::ZERO, &slots, "grid-1", false);
        assert_eq!(a, b);
    }

    #[test]
    fn blocked_buys_are_skipped() {
        let cfg = cfg();
        let slots = BTreeMap::new();
        let actions = decide(&cfg, dec!(1000), 1.0, Decimal::ZERO, &slots, "grid-1", true);
        assert!(actions.iter().all(|a| match a {
            Action::Place { side, .. } => *side == Side::Sell,
            _ => true,
        }));
    }

    #[test]
    fn cancels_sort_before_places() {
        let cfg = cfg();
        let mut slots = BTreeMap::new();
        let key = PriceKey::from_decimal(dec!(1200), 100);
        slots.insert(
            key,
            Slot {
                price_key: key,
                price: dec!(1200),
                side: Side::Sell,
                slot_status: SlotStatus::Locked,
                position_status: PositionStatus::Empty,
                order_id: 1,
                client_oid: "x".into(),
                original_qty: cfg.order_quantity,
                position_qty: Decimal::ZERO,
            },
        );
        let actions = decide(&cfg, dec!(1000), 1.0, Decimal::ZERO, &slots, "grid-1", false);
        let first_cancel = actions.iter().position(|a| matches!(a, Action::Cancel { .. }));
        let first_place = actions.iter().position(|a| matches!(a, Action::Place { .. }));
        if let (Some(c), Some(p)) = (first_cancel, first_place) {
            assert!(c < p);
        }
    }
}
