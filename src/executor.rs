//! Rate-limited, retrying, idempotent order executor. Cancels batch through
//! exchange-sized chunks with a per-item outcome; places retry with jittered
//! backoff and a post-only downgrade path, tracking recent errors in a
//! bounded ring buffer.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use futures::stream::{FuturesUnordered, StreamExt};
use rand::Rng;

use crate::error::ExchangeError;
use crate::exchange::{ExchangePort, OrderSide, PlaceOrderRequest, TimeInForce};
use crate::slot::Side;
use crate::slot_manager::ActionOutcome;
use crate::strategy::Action;

#[derive(Debug, Clone, Copy)]
pub struct ExecutorConfig {
    pub rate_limit_per_sec: u32,
    pub post_only_retries: u32,
    pub allow_taker_fallback: bool,
    pub batch_cancel_chunk: usize,
    pub max_retries: u32,
    pub error_window: Duration,
    /// Bound on in-flight `place_one` futures within one `submit` call — the
    /// token bucket still caps the actual request rate, this just bounds how
    /// many placements are outstanding (retrying, backing off) at once.
    pub max_concurrent_places: usize,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            rate_limit_per_sec: 10,
            post_only_retries: 3,
            allow_taker_fallback: false,
            batch_cancel_chunk: 20,
            max_retries: 5,
            error_window: Duration::from_secs(60),
            max_concurrent_places: 8,
        }
    }
}

/// Simple token bucket: refills continuously at `rate_per_sec`, capped at
/// one second's worth of tokens.
struct TokenBucket {
    capacity: f64,
    tokens: f64,
    rate_per_sec: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn new(rate_per_sec: u32) -> Self {
        let rate = rate_per_sec.max(1) as f64;
        Self {
            capacity: rate,
            tokens: rate,
            rate_per_sec: rate,
            last_refill: Instant::now(),
        }
    }

    fn refill(&mut self) {
        let elapsed = self.last_refill.elapsed().as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.rate_per_sec).min(self.capacity);
        self.last_refill = Instant::now();
    }

    async fn acquire(&mut self) {
        loop {
            self.refill();
            if self.tokens >= 1.0 {
                self.tokens -= 1.0;
                return;
            }
            let wait = Duration::from_secs_f64((1.0 - self.tokens) / self.rate_per_sec);
            tokio::time::sleep(wait).await;
        }
    }
}

/// Bounded ring buffer of error timestamps; exposes a recent-error count for
/// health checks without unbounded growth.
struct ErrorRing {
    window: Duration,
    timestamps: VecDeque<Instant>,
}

impl ErrorRing {
    fn new(window: Duration) -> Self {
        Self {
            window,
            timestamps: VecDeque::new(),
        }
    }

    fn record(&mut self) {
        let now = Instant::now();
        self.timestamps.push_back(now);
        while let Some(&front) = self.timestamps.front() {
            if now.duration_since(front) > self.window {
                self.timestamps.pop_front();
            } else {
                break;
            }
        }
    }

    fn recent_error_count(&mut self) -> usize {
        let now = Instant::now();
        while let Some(&front) = self.timestamps.front() {
            if now.duration_since(front) > self.window {
                self.timestamps.pop_front();
            } else {
                break;
            }
        }
        self.timestamps.len()
    }
}

pub struct OrderExecutor {
    config: ExecutorConfig,
    symbol: String,
    bucket: parking_lot::Mutex<TokenBucket>,
    errors: parking_lot::Mutex<ErrorRing>,
}

impl OrderExecutor {
    pub fn new(symbol: impl Into<String>, config: ExecutorConfig) -> Self {
        Self {
            bucket: parking_lot::Mutex::new(TokenBucket::new(config.rate_limit_per_sec)),
            errors: parking_lot::Mutex::new(ErrorRing::new(config.error_window)),
            symbol: symbol.into(),
            config,
        }
    }

    pub fn recent_error_count(&self) -> usize {
        self.errors.lock().recent_error_count()
    }

    /// Submits a batch of strategy actions concurrently and returns the
    /// executor's outcomes for `apply_results`.
    pub async fn submit(&self, exchange: &dyn ExchangePort, actions: Vec<Action>) -> Vec<ActionOutcome> {
        let (cancels, places): (Vec<_>, Vec<_>) = actions
            .into_iter()
            .partition(|a| matches!(a, Action::Cancel { .. }));

        let mut outcomes = Vec::new();

        let cancel_ids: Vec<(u64, crate::slot::PriceKey)> = cancels
            .into_iter()
            .filter_map(|a| match a {
                Action::Cancel { order_id, price_key } => Some((order_id, price_key)),
                _ => None,
            })
            .collect();
        outcomes.extend(self.batch_cancel(exchange, cancel_ids).await);
        outcomes.extend(self.place_all(exchange, places).await);

        outcomes
    }

    /// Issues placements with up to `max_concurrent_places` in flight at
    /// once, instead of awaiting each one's own retry/backoff before the
    /// next starts.
    async fn place_all(&self, exchange: &dyn ExchangePort, places: Vec<Action>) -> Vec<ActionOutcome> {
        let limit = self.config.max_concurrent_places.max(1);
        let mut outcomes = Vec::with_capacity(places.len());
        let mut pending = places.into_iter();
        let mut in_flight = FuturesUnordered::new();

        for place in pending.by_ref().take(limit) {
            in_flight.push(self.place_one(exchange, place));
        }

        while let Some(outcome) = in_flight.next().await {
            outcomes.push(outcome);
            if let Some(place) = pending.next() {
                in_flight.push(self.place_one(exchange, place));
            }
        }

        outcomes
    }

    async fn batch_cancel(
        &self,
        exchange: &dyn ExchangePort,
        cancels: Vec<(u64, crate::slot::PriceKey)>,
    ) -> Vec<ActionOutcome> {
        let mut outcomes = Vec::with_capacity(cancels.len());
        for chunk in cancels.chunks(self.config.batch_cancel_chunk) {
            let ids: Vec<u64> = chunk.iter().map(|(id, _)| *id).collect();
            self.bucket.lock().acquire().await;
            let results = exchange.batch_cancel(&self.symbol, &ids).await;
            for ((_, price_key), outcome) in chunk.iter().zip(results.iter()) {
                match &outcome.result {
                    Ok(()) => outcomes.push(ActionOutcome::Canceled { price_key: *price_key }),
                    Err(ExchangeError::OrderNotFound) => {
                        outcomes.push(ActionOutcome::Canceled { price_key: *price_key })
                    }
                    Err(_) => {
                        self.errors.lock().record();
                        outcomes.push(ActionOutcome::CancelFailed { price_key: *price_key })
                    }
                }
            }
        }
        outcomes
    }

    async fn place_one(&self, exchange: &dyn ExchangePort, action: Action) -> ActionOutcome {
        let (price_key, price, side, qty, client_oid) = match action {
            Action::Place {
                price_key,
                price,
                side,
                qty,
                client_oid,
            } => (price_key, price, side, qty, client_oid),
            Action::Cancel { .. } => unreachable!("cancels are routed through batch_cancel"),
        };

        let order_side = match side {
            Side::Buy => OrderSide::Buy,
            Side::Sell => OrderSide::Sell,
        };

        let mut post_only = true;
        let mut attempt = 0;
        let mut backoff = Duration::from_millis(200);

        loop {
            self.bucket.lock().acquire().await;

            let req = PlaceOrderRequest {
                symbol: self.symbol.clone(),
                side: order_side,
                price,
                qty,
                tif: TimeInForce::GoodTilCancel,
                reduce_only: false,
                post_only,
                client_oid: client_oid.clone(),
            };

            match exchange.place_order(req).await {
                Ok(ack) => {
                    return ActionOutcome::Placed {
                        price_key,
                        order_id: ack.order_id,
                    }
                }
                Err(ExchangeError::DuplicateClientOid(_)) => {
                    // crash-recovery path: fetch and adopt the existing order.
                    if let Ok(open) = exchange.get_open_orders(&self.symbol).await {
                        if let Some(existing) = open.iter().find(|o| o.client_oid == client_oid) {
                            return ActionOutcome::Placed {
                                price_key,
                                order_id: existing.order_id,
                            };
                        }
                    }
                    return ActionOutcome::PlaceFailed { price_key };
                }
                Err(ExchangeError::InsufficientFunds(_)) => {
                    self.errors.lock().record();
                    return ActionOutcome::PlaceFailed { price_key };
                }
                Err(ExchangeError::InvalidParam(_)) => {
                    self.errors.lock().record();
                    return ActionOutcome::PlaceRejectedInvalidParam { price_key };
                }
                Err(e) if e.is_retryable() => {
                    self.errors.lock().record();
                    attempt += 1;
                    if attempt > self.config.max_retries {
                        return ActionOutcome::PlaceFailed { price_key };
                    }
                    let jitter_ms = rand::thread_rng().gen_range(0..100);
                    tokio::time::sleep(backoff + Duration::from_millis(jitter_ms)).await;
                    backoff = (backoff * 2).min(Duration::from_secs(30));
                }
                Err(_) if post_only && attempt < self.config.post_only_retries => {
                    // post-only rejection downgrade path.
                    attempt += 1;
                    tokio::time::sleep(backoff).await;
                }
                Err(_) => {
                    self.errors.lock().record();
                    if post_only && self.config.allow_taker_fallback {
                        post_only = false;
                        attempt = 0;
                        continue;
                    }
                    return ActionOutcome::PlaceFailed { price_key };
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::SimExchange;
    use crate::slot::PriceKey;
    use rust_decimal_macros::dec;

    #[tokio::test]
    async fn places_and_returns_order_id() {
        let exchange = SimExchange::new(dec!(1000));
        let executor = OrderExecutor::new("BTC", ExecutorConfig::default());
        let actions = vec![Action::Place {
            price_key: PriceKey(100),
            price: dec!(100),
            side: Side::Buy,
            qty: dec!(0.01),
            client_oid: "t-1".into(),
        }];
        let outcomes = executor.submit(&exchange, actions).await;
        assert_eq!(outcomes.len(), 1);
        assert!(matches!(outcomes[0], ActionOutcome::Placed { .. }));
    }

    #[tokio::test]
    async fn cancel_not_found_is_success() {
        let exchange = SimExchange::new(dec!(1000));
        let executor = OrderExecutor::new("BTC", ExecutorConfig::default());
        let actions = vec![Action::Cancel {
            order_id: 999,
            price_key: PriceKey(100),
        }];
        let outcomes = executor.submit(&exchange, actions).await;
        assert!(matches!(outcomes[0], ActionOutcome::Canceled { .. }));
    }

    #[tokio::test]
    async fn duplicate_client_oid_adopts_existing_order() {
        let exchange = SimExchange::new(dec!(1000));
        let executor = OrderExecutor::new("BTC", ExecutorConfig::default());
        let actions = vec![Action::Place {
            price_key: PriceKey(100),
            price: dec!(100),
            side: Side::Buy,
            qty: dec!(0.01),
            client_oid: "t-dup".into(),
        }];
        let first = executor.submit(&exchange, actions.clone()).await;
        let second = executor.submit(&exchange, actions).await;
        match (&first[0], &second[0]) {
            (ActionOutcome::Placed { order_id: a, .. }, ActionOutcome::Placed { order_id: b, .. }) => {
                assert_eq!(a, b);
            }
            other => panic!("expected both placed with same order_id, got {:?}", other),
        }
    }
}
