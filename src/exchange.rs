//! Abstract exchange boundary. Concrete venue adapters (REST signing,
//! websocket framing) are external collaborators and are not implemented
//! here — only the capability set the core depends on, plus an in-memory
//! `SimExchange` used by tests and by shadow-mode runs.

use std::collections::HashMap;

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::ExchangeError;
use crate::slot_manager::{OrderUpdate, OrderUpdateStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderSide {
    Buy,
    Sell,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TimeInForce {
    GoodTilCancel,
    ImmediateOrCancel,
}

#[derive(Debug, Clone)]
pub struct PlaceOrderRequest {
    pub symbol: String,
    pub side: OrderSide,
    pub price: Decimal,
    pub qty: Decimal,
    pub tif: TimeInForce,
    pub reduce_only: bool,
    pub post_only: bool,
    pub client_oid: String,
}

#[derive(Debug, Clone)]
pub struct OrderAck {
    pub order_id: u64,
    pub client_oid: String,
}

#[derive(Debug, Clone)]
pub struct OpenOrder {
    pub order_id: u64,
    pub client_oid: String,
    pub symbol: String,
    pub side: OrderSide,
    pub price: Decimal,
    pub qty: Decimal,
    pub timestamp_ms: u64,
}

#[derive(Debug, Clone)]
pub struct ExchangePosition {
    pub symbol: String,
    pub qty: Decimal,
}

#[derive(Debug, Clone)]
pub struct AccountInfo {
    pub balance: Decimal,
}

#[derive(Debug, Clone)]
pub struct CancelOutcome {
    pub order_id: u64,
    pub result: Result<(), ExchangeError>,
}

#[derive(Debug, Clone, Copy)]
pub struct PriceTick {
    pub price: Decimal,
    pub ts_ms: u64,
}

#[derive(Debug, Clone, Copy)]
pub struct Candle {
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    pub closed: bool,
    pub ts_ms: u64,
}

/// One item from a reconnecting stream: either real data, or a marker that
/// the stream just reconnected (which must trigger reconciliation).
#[derive(Debug, Clone)]
pub enum StreamEvent<T> {
    Data(T),
    Reconnected,
}

/// The contract the core consumes. Concrete venues implement this; the
/// strategy/executor/reconciler only ever see this trait object.
#[async_trait]
pub trait ExchangePort: Send + Sync {
    async fn place_order(&self, req: PlaceOrderRequest) -> Result<OrderAck, ExchangeError>;

    /// `OrderNotFound` is success from the caller's point of view — this
    /// still surfaces it as an error so the executor can apply that policy
    /// explicitly rather than the port hiding it.
    async fn cancel_order(&self, symbol: &str, order_id: u64) -> Result<(), ExchangeError>;

    async fn batch_cancel(&self, symbol: &str, order_ids: &[u64]) -> Vec<CancelOutcome>;

    async fn get_open_orders(&self, symbol: &str) -> Result<Vec<OpenOrder>, ExchangeError>;

    async fn get_positions(&self, symbol: &str) -> Result<Vec<ExchangePosition>, ExchangeError>;

    async fn get_account(&self) -> Result<AccountInfo, ExchangeError>;

    fn stream_prices(&self, symbols: &[String]) -> mpsc::Receiver<StreamEvent<(String, PriceTick)>>;

    fn stream_orders(&self) -> mpsc::Receiver<StreamEvent<OrderUpdate>>;

    fn stream_klines(&self, symbols: &[String], interval: &str) -> mpsc::Receiver<StreamEvent<(String, Candle)>>;
}

// ─── Sim Exchange (in-memory reference implementation) ─────────────

struct SimOrder {
    symbol: String,
    side: OrderSide,
    price: Decimal,
    qty: Decimal,
    client_oid: String,
    timestamp_ms: u64,
}

pub struct SimExchange {
    state: parking_lot::Mutex<SimState>,
    order_tx: mpsc::Sender<StreamEvent<OrderUpdate>>,
    order_rx: parking_lot::Mutex<Option<mpsc::Receiver<StreamEvent<OrderUpdate>>>>,
}

struct SimState {
    next_order_id: u64,
    orders: HashMap<u64, SimOrder>,
    client_oid_index: HashMap<String, u64>,
    positions: HashMap<String, Decimal>,
    balance: Decimal,
}

impl SimExchange {
    pub fn new(initial_balance: Decimal) -> Self {
        let (order_tx, order_rx) = mpsc::channel(1024);
        Self {
            state: parking_lot::Mutex::new(SimState {
                next_order_id: 1,
                orders: HashMap::new(),
                client_oid_index: HashMap::new(),
                positions: HashMap::new(),
                balance: initial_balance,
            }),
            order_tx,
            order_rx: parking_lot::Mutex::new(Some(order_rx)),
        }
    }

    /// Test/shadow-mode hook: immediately fills a resting order.
    pub async fn simulate_fill(&self, order_id: u64, executed_qty: Decimal) {
        let symbol_and_qty = {
            let mut state = self.state.lock();
            let order = match state.orders.remove(&order_id) {
                Some(o) => o,
                None => return,
            };
            state.client_oid_index.remove(&order.client_oid);
            let signed = match order.side {
                OrderSide::Buy => executed_qty,
                OrderSide::Sell => -executed_qty,
            };
            *state.positions.entry(order.symbol.clone()).or_insert(Decimal::ZERO) += signed;
            (order.symbol, executed_qty)
        };
        let _ = symbol_and_qty;
        let _ = self
            .order_tx
            .send(StreamEvent::Data(OrderUpdate {
                order_id,
                status: OrderUpdateStatus::Filled,
                executed_qty,
                update_time_ms: chrono::Utc::now().timestamp_millis() as u64,
            }))
            .await;
    }
}

#[async_trait]
impl ExchangePort for SimExchange {
    async fn place_order(&self, req: PlaceOrderRequest) -> Result<OrderAck, ExchangeError> {
        let mut state = self.state.lock();
        if let Some(&existing) = state.client_oid_index.get(&req.client_oid) {
            return Err(ExchangeError::DuplicateClientOid(format!(
                "client_oid {} already resolves to order {}",
                req.client_oid, existing
            )));
        }
        let order_id = state.next_order_id;
        state.next_order_id += 1;
        state.client_oid_index.insert(req.client_oid.clone(), order_id);
        state.orders.insert(
            order_id,
            SimOrder {
                symbol: req.symbol,
                side: req.side,
                price: req.price,
                qty: req.qty,
                client_oid: req.client_oid.clone(),
                timestamp_ms: chrono::Utc::now().timestamp_millis() as u64,
            },
        );
        Ok(OrderAck {
            order_id,
            client_oid: req.client_oid,
        })
    }

    async fn cancel_order(&self, _symbol: &str, order_id: u64) -> Result<(), ExchangeError> {
        let mut state = self.state.lock();
        match state.orders.remove(&order_id) {
            Some(order) => {
                state.client_oid_index.remove(&order.client_oid);
                Ok(())
            }
            None => Err(ExchangeError::OrderNotFound),
        }
    }

    async fn batch_cancel(&self, symbol: &str, order_ids: &[u64]) -> Vec<CancelOutcome> {
        let mut outcomes = Vec::with_capacity(order_ids.len());
        for &id in order_ids {
            let result = self.cancel_order(symbol, id).await;
            outcomes.push(CancelOutcome { order_id: id, result });
        }
        outcomes
    }

    async fn get_open_orders(&self, symbol: &str) -> Result<Vec<OpenOrder>, ExchangeError> {
        let state = self.state.lock();
        Ok(state
            .orders
            .iter()
            .filter(|(_, o)| symbol.is_empty() || o.symbol == symbol)
            .map(|(&id, o)| OpenOrder {
                order_id: id,
                client_oid: o.client_oid.clone(),
                symbol: o.symbol.clone(),
                side: o.side,
                price: o.price,
                qty: o.qty,
                timestamp_ms: o.timestamp_ms,
            })
            .collect())
    }

    async fn get_positions(&self, symbol: &str) -> Result<Vec<ExchangePosition>, ExchangeError> {
        let state = self.state.lock();
        Ok(state
            .positions
            .iter()
            .filter(|(s, _)| symbol.is_empty() || s.as_str() == symbol)
            .map(|(s, &qty)| ExchangePosition {
                symbol: s.clone(),
                qty,
            })
            .collect())
    }

    async fn get_account(&self) -> Result<AccountInfo, ExchangeError> {
        Ok(AccountInfo {
            balance: self.state.lock().balance,
        })
    }

    fn stream_prices(&self, _symbols: &[String]) -> mpsc::Receiver<StreamEvent<(String, PriceTick)>> {
        let (_tx, rx) = mpsc::channel(1);
        rx
    }

    fn stream_orders(&self) -> mpsc::Receiver<StreamEvent<OrderUpdate>> {
        self.order_rx
            .lock()
            .take()
            .unwrap_or_else(|| mpsc::channel(1).1)
    }

    fn stream_klines(&self, _symbols: &[String], _interval: &str) -> mpsc::Receiver<StreamEvent<(String, Candle)>> {
        let (_tx, rx) = mpsc::channel(1);
        rx
    }
}
