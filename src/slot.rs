//! The central entity: one grid price level and its order lifecycle.

use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;
use serde::{Deserialize, Serialize};

/// Canonical integer-scaled price key. Two decimal representations of the
/// same level (`"100.10"` vs `100.1`) always hash to the same key, because
/// the slot map is keyed on this instead of on `Decimal` or a string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PriceKey(pub i64);

impl PriceKey {
    /// `tick_scale` is the number of ticks per unit price (e.g. 100 for a
    /// 0.01 tick size), supplied by exchange instrument metadata.
    pub fn from_decimal(price: Decimal, tick_scale: i64) -> Self {
        let scaled = (price * Decimal::from(tick_scale))
            .round()
            .to_i64()
            .expect("price out of scaled-integer range");
        PriceKey(scaled)
    }

    pub fn to_decimal(self, tick_scale: i64) -> Decimal {
        Decimal::from(self.0) / Decimal::from(tick_scale)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SlotStatus {
    Free,
    Pending,
    Locked,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PositionStatus {
    Empty,
    Filled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn code(self) -> &'static str {
        match self {
            Side::Buy => "b",
            Side::Sell => "s",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Slot {
    pub price_key: PriceKey,
    pub price: Decimal,
    pub side: Side,
    pub slot_status: SlotStatus,
    pub position_status: PositionStatus,
    pub order_id: u64,
    pub client_oid: String,
    pub original_qty: Decimal,
    pub position_qty: Decimal,
}

impl Slot {
    pub fn new_free(price_key: PriceKey, price: Decimal, side: Side, client_oid: String) -> Self {
        Self {
            price_key,
            price,
            side,
            slot_status: SlotStatus::Free,
            position_status: PositionStatus::Empty,
            order_id: 0,
            client_oid,
            original_qty: Decimal::ZERO,
            position_qty: Decimal::ZERO,
        }
    }

    /// `LOCKED <=> order_id != 0`.
    pub fn check_invariant(&self) -> bool {
        match self.slot_status {
            SlotStatus::Locked => self.order_id != 0,
            SlotStatus::Free => self.order_id == 0,
            SlotStatus::Pending => true,
        }
    }

    pub fn has_inventory(&self) -> bool {
        matches!(self.position_status, PositionStatus::Filled) && self.position_qty > Decimal::ZERO
    }
}

/// Derives the deterministic, crash-stable client order id for a
/// `(strategy_id, price, side)` triple.
///
/// Format: `t-<hash>-<suffix>`, where `suffix` encodes price+side and is
/// never truncated; if the whole id would exceed `max_len`, characters are
/// removed from the middle of `strategy_id` first.
pub fn derive_client_oid(strategy_id: &str, price_key: PriceKey, side: Side, max_len: usize) -> String {
    use std::collections::hash_map::DefaultHasher;
    use std::hash::{Hash, Hasher};

    const MARKER: &str = "t-";
    const SEP: &str = "-";
    const OVERHEAD: usize = MARKER.len() + SEP.len();

    let mut hasher = DefaultHasher::new();
    strategy_id.hash(&mut hasher);
    price_key.hash(&mut hasher);
    side.code().hash(&mut hasher);
    let digest = hasher.finish();

    // Last 10 chars of hex(price)+side_code: the side code always lands as
    // the final character, so two distinct (price, side) pairs can only
    // collide here if their price hex digits coincide for 9+ positions.
    let raw_suffix = format!("{:x}{}", price_key.0.unsigned_abs(), side.code());
    let full_suffix: String = raw_suffix.chars().rev().take(10).collect::<String>().chars().rev().collect();

    // Budget top-down: marker/separator overhead first, then the
    // price/side suffix, then the hash, then whatever's left for
    // strategy_id — so the cap is always respected even when max_len is
    // too small to fit every component at full size.
    let after_overhead = max_len.saturating_sub(OVERHEAD);
    let suffix_len = full_suffix.len().min(after_overhead);
    let suffix = &full_suffix[full_suffix.len() - suffix_len..];

    let after_suffix = after_overhead - suffix_len;
    let full_hash_hex = format!("{:x}", digest & 0xffff_ffff);
    let hash_len = full_hash_hex.len().min(after_suffix);
    let hash_hex = &full_hash_hex[..hash_len];

    let strategy_budget = after_suffix - hash_len;
    let chars: Vec<char> = strategy_id.chars().collect();
    let trimmed_strategy: String = if chars.len() <= strategy_budget {
        chars.into_iter().collect()
    } else {
        let head = strategy_budget - strategy_budget / 2;
        let tail = strategy_budget - head;
        chars[..head]
            .iter()
            .chain(chars[chars.len() - tail..].iter())
            .collect()
    };

    let oid = format!("{}{}{}{}{}", MARKER, hash_hex, SEP, trimmed_strategy, suffix);
    if oid.len() > max_len {
        // Only reachable when max_len is too small even for the marker and
        // separator alone (far below any realistic exchange cap); keep the
        // rightmost characters since that's where the price/side suffix lives.
        let skip = oid.len() - max_len;
        oid.chars().skip(skip).collect()
    } else {
        oid
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn price_key_roundtrips() {
        let p = Decimal::new(10010, 2); // 100.10
        let key = PriceKey::from_decimal(p, 100);
        assert_eq!(key.to_decimal(100), p);
    }

    #[test]
    fn equal_decimals_collide_to_same_key() {
        let a = PriceKey::from_decimal(Decimal::new(10010, 2), 100);
        let b = PriceKey::from_decimal("100.1".parse().unwrap(), 100);
        assert_eq!(a, b);
    }

    #[test]
    fn client_oid_is_deterministic_and_distinct() {
        let a1 = derive_client_oid("grid-1", PriceKey(10000), Side::Buy, 36);
        let a2 = derive_client_oid("grid-1", PriceKey(10000), Side::Buy, 36);
        assert_eq!(a1, a2);

        let b = derive_client_oid("grid-1", PriceKey(10100), Side::Buy, 36);
        assert_ne!(a1, b);

        let c = derive_client_oid("grid-1", PriceKey(10000), Side::Sell, 36);
        assert_ne!(a1, c);
    }

    #[test]
    fn client_oid_respects_length_cap() {
        let oid = derive_client_oid(
            "a-very-long-strategy-identifier-that-blows-the-budget",
            PriceKey(123456),
            Side::Sell,
            32,
        );
        assert!(oid.len() <= 32);
    }
}
