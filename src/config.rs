//! Typed configuration, loaded from environment variables into one place
//! instead of scattered `std::env::var` calls through `main`.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

use crate::error::EngineError;
use crate::risk_monitor::GlobalStrategy;

/// Strips separators for *comparison only* — `BTC_USDT` and `BTCUSDT` compare
/// equal, but the original string is always what's stored and logged. Symbols
/// are never silently merged on this basis; see [`EngineConfig::validate`].
pub fn normalize_symbol(symbol: &str) -> String {
    symbol.chars().filter(|c| c.is_alphanumeric()).collect::<String>().to_uppercase()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GridConfig {
    /// Base spacing between grid levels, in price units.
    pub base_interval: rust_decimal::Decimal,
    pub buy_window_size: u32,
    pub sell_window_size: u32,
    pub order_quantity: rust_decimal::Decimal,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct DynamicIntervalConfig {
    pub enable_dynamic_interval: bool,
    pub volatility_scale: f64,
    pub baseline_atr: f64,
}

impl Default for DynamicIntervalConfig {
    fn default() -> Self {
        Self {
            enable_dynamic_interval: false,
            volatility_scale: 1.0,
            baseline_atr: 1.0,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct InventorySkewConfig {
    pub enable_skew: bool,
    pub skew_factor: f64,
    pub target_inventory: rust_decimal::Decimal,
}

impl Default for InventorySkewConfig {
    fn default() -> Self {
        Self {
            enable_skew: false,
            skew_factor: 0.0,
            target_inventory: rust_decimal::Decimal::ZERO,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskConfig {
    pub risk_symbols: Vec<String>,
    pub kline_interval: String,
    pub volume_multiplier: f64,
    pub average_window: usize,
    pub recovery_threshold: usize,
    pub global_strategy: GlobalStrategy,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            risk_symbols: Vec::new(),
            kline_interval: "1m".to_string(),
            volume_multiplier: 2.0,
            average_window: 10,
            recovery_threshold: 1,
            global_strategy: GlobalStrategy::All,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct BreakerConfig {
    pub max_consecutive_losses: u32,
    pub max_drawdown_amount: rust_decimal::Decimal,
    pub cooldown: Option<Duration>,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            max_consecutive_losses: 5,
            max_drawdown_amount: rust_decimal::Decimal::new(1000, 0),
            cooldown: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ExecutorConfig {
    pub rate_limit_per_sec: u32,
    pub post_only_retries: u32,
    pub allow_taker_fallback: bool,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            rate_limit_per_sec: 10,
            post_only_retries: 3,
            allow_taker_fallback: false,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ReconcilerConfig {
    pub interval_sec: u64,
    pub divergence_trip_pct: f64,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            interval_sec: 60,
            divergence_trip_pct: 5.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistenceConfig {
    pub path: String,
    pub save_cooldown_ms: u64,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            path: "grid_state.json".to_string(),
            save_cooldown_ms: 500,
        }
    }
}

/// The full engine configuration, assembled from env vars by [`EngineConfig::from_env`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    pub symbol: String,
    pub strategy_id: String,
    pub grid: GridConfig,
    pub dynamic_interval: DynamicIntervalConfig,
    pub skew: InventorySkewConfig,
    pub risk: RiskConfig,
    pub breaker: BreakerConfig,
    pub executor: ExecutorConfig,
    pub reconciler: ReconcilerConfig,
    pub persistence: PersistenceConfig,
}

impl EngineConfig {
    /// Loads configuration from environment variables, falling back to
    /// defaults for anything unset.
    pub fn from_env() -> Self {
        dotenvy::dotenv().ok();

        let env_dec = |key: &str, default: &str| -> rust_decimal::Decimal {
            std::env::var(key)
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or_else(|| default.parse().unwrap())
        };
        let env_f64 = |key: &str, default: f64| -> f64 {
            std::env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
        };
        let env_u32 = |key: &str, default: u32| -> u32 {
            std::env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
        };
        let env_usize = |key: &str, default: usize| -> usize {
            std::env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
        };
        let env_bool = |key: &str, default: bool| -> bool {
            std::env::var(key)
                .ok()
                .map(|v| v == "true" || v == "1")
                .unwrap_or(default)
        };

        Self {
            symbol: std::env::var("GRID_SYMBOL").unwrap_or_else(|_| "BTCUSDT".to_string()),
            strategy_id: std::env::var("GRID_STRATEGY_ID").unwrap_or_else(|_| "grid-1".to_string()),
            grid: GridConfig {
                base_interval: env_dec("GRID_BASE_INTERVAL", "10"),
                buy_window_size: env_u32("GRID_BUY_WINDOW_SIZE", 2),
                sell_window_size: env_u32("GRID_SELL_WINDOW_SIZE", 2),
                order_quantity: env_dec("GRID_ORDER_QUANTITY", "0.01"),
            },
            dynamic_interval: DynamicIntervalConfig {
                enable_dynamic_interval: env_bool("GRID_ENABLE_DYNAMIC_INTERVAL", false),
                volatility_scale: env_f64("GRID_VOLATILITY_SCALE", 1.0),
                baseline_atr: env_f64("GRID_BASELINE_ATR", 1.0),
            },
            skew: InventorySkewConfig {
                enable_skew: env_bool("GRID_ENABLE_SKEW", false),
                skew_factor: env_f64("GRID_SKEW_FACTOR", 0.0),
                target_inventory: env_dec("GRID_TARGET_INVENTORY", "0"),
            },
            risk: RiskConfig {
                risk_symbols: std::env::var("GRID_RISK_SYMBOLS")
                    .map(|v| v.split(',').map(|s| s.trim().to_string()).collect())
                    .unwrap_or_default(),
                kline_interval: std::env::var("GRID_KLINE_INTERVAL").unwrap_or_else(|_| "1m".to_string()),
                volume_multiplier: env_f64("GRID_VOLUME_MULTIPLIER", 2.0),
                average_window: env_usize("GRID_AVERAGE_WINDOW", 10),
                recovery_threshold: env_usize("GRID_RECOVERY_THRESHOLD", 1),
                global_strategy: if env_bool("GRID_RISK_GLOBAL_ANY", false) {
                    GlobalStrategy::Any
                } else {
                    GlobalStrategy::All
                },
            },
            breaker: BreakerConfig {
                max_consecutive_losses: env_u32("GRID_MAX_CONSECUTIVE_LOSSES", 5),
                max_drawdown_amount: env_dec("GRID_MAX_DRAWDOWN_AMOUNT", "1000"),
                cooldown: std::env::var("GRID_BREAKER_COOLDOWN_SECS")
                    .ok()
                    .and_then(|v| v.parse::<u64>().ok())
                    .map(Duration::from_secs),
            },
            executor: ExecutorConfig {
                rate_limit_per_sec: env_u32("GRID_RATE_LIMIT_PER_SEC", 10),
                post_only_retries: env_u32("GRID_POST_ONLY_RETRIES", 3),
                allow_taker_fallback: env_bool("GRID_ALLOW_TAKER_FALLBACK", false),
            },
            reconciler: ReconcilerConfig {
                interval_sec: std::env::var("GRID_RECONCILER_INTERVAL_SEC")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(60),
                divergence_trip_pct: env_f64("GRID_DIVERGENCE_TRIP_PCT", 5.0),
            },
            persistence: PersistenceConfig {
                path: std::env::var("GRID_STATE_PATH").unwrap_or_else(|_| "grid_state.json".to_string()),
                save_cooldown_ms: std::env::var("GRID_SAVE_COOLDOWN_MS")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(500),
            },
        }
    }

    /// Rejects configurations where two distinct symbols would normalize to
    /// the same key — the engine fails loudly here rather than silently
    /// unifying `BTC_USDT` and `BTCUSDT` into one risk-monitor bucket.
    pub fn validate(&self) -> Result<(), EngineError> {
        let mut seen: HashMap<String, &str> = HashMap::new();
        for symbol in self.risk.risk_symbols.iter().chain(std::iter::once(&self.symbol)) {
            let key = normalize_symbol(symbol);
            if let Some(existing) = seen.insert(key.clone(), symbol.as_str()) {
                if existing != symbol {
                    return Err(EngineError::Config(format!(
                        "symbols {:?} and {:?} both normalize to {:?}",
                        existing, symbol, key
                    )));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn distinct_symbols_normalizing_to_the_same_key_are_rejected() {
        let mut cfg = EngineConfig::from_env();
        cfg.symbol = "BTCUSDT".to_string();
        cfg.risk.risk_symbols = vec!["BTC_USDT".to_string()];
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn identical_symbols_do_not_collide_with_themselves() {
        let mut cfg = EngineConfig::from_env();
        cfg.symbol = "BTCUSDT".to_string();
        cfg.risk.risk_symbols = vec!["BTCUSDT".to_string(), "ETHUSDT".to_string()];
        assert!(cfg.validate().is_ok());
    }
}
