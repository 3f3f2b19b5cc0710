//! Durable checkpoint of the slot map: an atomic write-new-then-rename so a
//! crash mid-write can never leave a half-written checkpoint in place of the
//! previous good one.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::circuit_breaker::BreakerState;
use crate::slot::{PriceKey, Slot};

const SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GridState {
    pub schema_version: u32,
    pub symbol: String,
    pub strategy_id: String,
    pub slots: Vec<Slot>,
    pub last_price: Decimal,
    pub last_update_time_ms: u64,
    pub breaker_state: Option<BreakerState>,
}

impl GridState {
    pub fn new(symbol: String, strategy_id: String) -> Self {
        Self {
            schema_version: SCHEMA_VERSION,
            symbol,
            strategy_id,
            slots: Vec::new(),
            last_price: Decimal::ZERO,
            last_update_time_ms: 0,
            breaker_state: None,
        }
    }

    pub fn slot_map(&self) -> BTreeMap<PriceKey, Slot> {
        self.slots.iter().map(|s| (s.price_key, s.clone())).collect()
    }
}

pub struct Store {
    path: PathBuf,
}

impl Store {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Loads state at boot. Schema evolution is handled by a migration tool
    /// external to the engine; this assumes `schema_version` is current and
    /// logs a warning rather than failing outright if it isn't (the engine
    /// still trusts the reconciler to correct drift after load).
    pub fn load(&self, symbol: &str, strategy_id: &str) -> Option<GridState> {
        if !self.path.exists() {
            log::info!("[STORE] no checkpoint at {:?}, starting fresh", self.path);
            return None;
        }
        match std::fs::read_to_string(&self.path) {
            Ok(content) => match serde_json::from_str::<GridState>(&content) {
                Ok(state) => {
                    if state.schema_version != SCHEMA_VERSION {
                        log::warn!(
                            "[STORE] schema_version {} on disk, engine expects {}",
                            state.schema_version,
                            SCHEMA_VERSION
                        );
                    }
                    log::info!(
                        "[STORE] loaded {} slots for {}/{}",
                        state.slots.len(),
                        state.symbol,
                        state.strategy_id
                    );
                    Some(state)
                }
                Err(e) => {
                    log::error!("[STORE] failed to parse checkpoint: {}", e);
                    None
                }
            },
            Err(e) => {
                log::error!("[STORE] failed to read checkpoint: {}", e);
                None
            }
        }
        .filter(|s| s.symbol == symbol && s.strategy_id == strategy_id)
    }

    /// Atomic write: serialize to a sibling temp file, then rename over the
    /// target. A crash mid-write leaves the previous checkpoint intact
    /// instead of a half-written file.
    pub fn save(&self, state: &GridState) -> std::io::Result<()> {
        let content = serde_json::to_string_pretty(state)?;
        let tmp_path = tmp_path_for(&self.path);
        std::fs::write(&tmp_path, content)?;
        std::fs::rename(&tmp_path, &self.path)?;
        Ok(())
    }
}

fn tmp_path_for(path: &Path) -> PathBuf {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    PathBuf::from(tmp)
}
