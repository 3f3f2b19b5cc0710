//! Property tests that don't require a running coordinator: slot_status<=>
//! order_id, client_oid determinism and distinctness, and strategy purity
//! (also covered inline in `strategy.rs`, repeated here over a wider input
//! space).

use proptest::prelude::*;

use grid_slot_engine::slot::{derive_client_oid, PriceKey, Side, Slot};

fn side_strategy() -> impl Strategy<Value = Side> {
    prop_oneof![Just(Side::Buy), Just(Side::Sell)]
}

proptest! {
    /// A freshly-built slot with a given lifecycle always satisfies
    /// `LOCKED <=> order_id != 0`.
    #[test]
    fn slot_lock_matches_order_id(
        price_key in -1_000_000_i64..1_000_000_i64,
        side in side_strategy(),
        order_id in 0_u64..1000,
    ) {
        use grid_slot_engine::slot::{PositionStatus, SlotStatus};
        use rust_decimal::Decimal;

        let mut slot = Slot::new_free(PriceKey(price_key), Decimal::ZERO, side, "oid".into());
        if order_id != 0 {
            slot.slot_status = SlotStatus::Locked;
            slot.order_id = order_id;
        } else {
            slot.slot_status = SlotStatus::Free;
            slot.order_id = 0;
        }
        slot.position_status = PositionStatus::Empty;
        prop_assert!(slot.check_invariant());
    }

    /// client_oid is a pure function of (strategy_id, price_key, side),
    /// bounded by max_len, and distinct price/side pairs never collide.
    #[test]
    fn client_oid_deterministic_and_bounded(
        strategy_id in "[a-zA-Z0-9_-]{1,40}",
        price_key in -1_000_000_i64..1_000_000_i64,
        side in side_strategy(),
        max_len in 20_usize..64,
    ) {
        let a = derive_client_oid(&strategy_id, PriceKey(price_key), side, max_len);
        let b = derive_client_oid(&strategy_id, PriceKey(price_key), side, max_len);
        prop_assert_eq!(&a, &b);
        prop_assert!(a.len() <= max_len);

        let other_side = match side {
            Side::Buy => Side::Sell,
            Side::Sell => Side::Buy,
        };
        let c = derive_client_oid(&strategy_id, PriceKey(price_key), other_side, max_len);
        prop_assert_ne!(a, c);
    }

    /// The strategy decision function is pure — same snapshot, same inputs,
    /// byte-equal (here: value-equal) action list.
    #[test]
    fn strategy_decide_is_pure(
        price in 1_i64..1_000_000,
        atr in 0.0_f64..100.0,
        inventory in -100_i64..100,
    ) {
        use grid_slot_engine::strategy::{decide, StrategyConfig};
        use rust_decimal::Decimal;
        use std::collections::BTreeMap;

        let cfg = StrategyConfig {
            base_interval: Decimal::from(10),
            buy_window_size: 2,
            sell_window_size: 2,
            order_quantity: Decimal::new(1, 2),
            tick_scale: 100,
            enable_dynamic_interval: false,
            volatility_scale: 1.0,
            baseline_atr: 1.0,
            enable_skew: false,
            skew_factor: 0.0,
            target_inventory: Decimal::ZERO,
            max_client_oid_len: 36,
        };
        let snapshot = BTreeMap::new();
        let price_dec = Decimal::from(price);
        let inventory_dec = Decimal::from(inventory);

        let a = decide(&cfg, price_dec, atr, inventory_dec, &snapshot, "grid-1", false);
        let b = decide(&cfg, price_dec, atr, inventory_dec, &snapshot, "grid-1", false);
        prop_assert_eq!(a, b);
    }
}
