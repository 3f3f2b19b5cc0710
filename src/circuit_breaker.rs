//! Per-engine loss guard (consecutive losses + cumulative drawdown).

use std::time::{Duration, Instant};

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct BreakerConfig {
    pub max_consecutive_losses: u32,
    pub max_drawdown_amount: Decimal,
    pub cooldown: Option<Duration>,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            max_consecutive_losses: 5,
            max_drawdown_amount: Decimal::new(1000, 0),
            cooldown: None,
        }
    }
}

/// Durable snapshot of breaker state, written to the store and restored on boot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerState {
    pub consecutive_losses: u32,
    pub cumulative_pnl: Decimal,
    pub tripped: bool,
    pub reason: Option<String>,
    pub tripped_at: Option<chrono::DateTime<chrono::Utc>>,
}

impl Default for BreakerState {
    fn default() -> Self {
        Self {
            consecutive_losses: 0,
            cumulative_pnl: Decimal::ZERO,
            tripped: false,
            reason: None,
            tripped_at: None,
        }
    }
}

/// Running weighted-average-cost inventory ledger, used only to turn raw
/// fills into the realized PnL the breaker's `record_fill_pnl` expects.
/// Independent of which slot a closing fill lands in — the grid can close
/// a buy slot's inventory with a sell fill at a different price level
/// entirely, so PnL attribution can't live on the slot itself.
#[derive(Debug, Clone, Copy, Default)]
pub struct PositionLedger {
    net_qty: Decimal,
    avg_entry: Decimal,
}

impl PositionLedger {
    pub fn new() -> Self {
        Self {
            net_qty: Decimal::ZERO,
            avg_entry: Decimal::ZERO,
        }
    }

    /// Applies one fill (`signed_qty` positive for a buy, negative for a
    /// sell) and returns the PnL realized by any portion that closed
    /// existing inventory. Flipping net-long to net-short (or back) resets
    /// the cost basis to the flip's fill price for the remainder.
    pub fn apply_fill(&mut self, signed_qty: Decimal, price: Decimal) -> Decimal {
        if signed_qty.is_zero() {
            return Decimal::ZERO;
        }

        let same_direction =
            self.net_qty.is_zero() || self.net_qty.is_sign_positive() == signed_qty.is_sign_positive();

        if same_direction {
            let new_qty = self.net_qty + signed_qty;
            if !new_qty.is_zero() {
                self.avg_entry = (self.avg_entry * self.net_qty.abs() + price * signed_qty.abs()) / new_qty.abs();
            }
            self.net_qty = new_qty;
            return Decimal::ZERO;
        }

        let was_positive = self.net_qty.is_sign_positive();
        let closing_qty = signed_qty.abs().min(self.net_qty.abs());
        let pnl_per_unit = if was_positive {
            price - self.avg_entry
        } else {
            self.avg_entry - price
        };
        let realized = pnl_per_unit * closing_qty;

        let new_qty = self.net_qty + signed_qty;
        if new_qty.is_zero() {
            self.avg_entry = Decimal::ZERO;
        } else if new_qty.is_sign_positive() != was_positive {
            self.avg_entry = price;
        }
        self.net_qty = new_qty;
        realized
    }

    pub fn net_qty(&self) -> Decimal {
        self.net_qty
    }
}

pub struct CircuitBreaker {
    config: BreakerConfig,
    consecutive_losses: u32,
    cumulative_pnl: Decimal,
    tripped: bool,
    reason: Option<String>,
    tripped_at: Option<Instant>,
}

impl CircuitBreaker {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            consecutive_losses: 0,
            cumulative_pnl: Decimal::ZERO,
            tripped: false,
            reason: None,
            tripped_at: None,
        }
    }

    /// Feeds a realized fill PnL. Trips the breaker if either threshold is breached.
    pub fn record_fill_pnl(&mut self, pnl: Decimal) {
        self.cumulative_pnl += pnl;
        if pnl.is_sign_negative() && !pnl.is_zero() {
            self.consecutive_losses += 1;
        } else {
            self.consecutive_losses = 0;
        }

        if self.consecutive_losses >= self.config.max_consecutive_losses {
            self.trip(format!(
                "consecutive_losses={}",
                self.consecutive_losses
            ));
        } else if self.cumulative_pnl <= -self.config.max_drawdown_amount {
            self.trip(format!("cumulative_pnl={}", self.cumulative_pnl));
        }
    }

    /// Opens the breaker externally (e.g. reconciler on large position divergence).
    pub fn open(&mut self, reason: impl Into<String>) {
        self.trip(reason.into());
    }

    fn trip(&mut self, reason: String) {
        if !self.tripped {
            log::error!("[BREAKER] tripped: {}", reason);
        }
        self.tripped = true;
        self.reason = Some(reason);
        self.tripped_at = Some(Instant::now());
    }

    pub fn is_tripped(&mut self) -> bool {
        if self.tripped {
            if let (Some(cooldown), Some(since)) = (self.config.cooldown, self.tripped_at) {
                if since.elapsed() >= cooldown {
                    log::info!("[BREAKER] cooldown elapsed, auto-closing");
                    self.reset();
                }
            }
        }
        self.tripped
    }

    /// Manual reset, required when no cooldown is configured.
    pub fn reset(&mut self) {
        self.tripped = false;
        self.reason = None;
        self.tripped_at = None;
        self.consecutive_losses = 0;
    }

    pub fn reason(&self) -> Option<&str> {
        self.reason.as_deref()
    }

    pub fn snapshot(&self) -> BreakerState {
        BreakerState {
            consecutive_losses: self.consecutive_losses,
            cumulative_pnl: self.cumulative_pnl,
            tripped: self.tripped,
            reason: self.reason.clone(),
            tripped_at: self.tripped.then(|| chrono::Utc::now()),
        }
    }

    pub fn restore(&mut self, state: BreakerState) {
        self.consecutive_losses = state.consecutive_losses;
        self.cumulative_pnl = state.cumulative_pnl;
        self.tripped = state.tripped;
        self.reason = state.reason;
        self.tripped_at = state.tripped.then(Instant::now);
    }
}
