//! Closed error taxonomy shared by every collaborator.

use thiserror::Error;

/// Errors surfaced by the [`crate::exchange::ExchangePort`] boundary.
///
/// This is a closed set: the core's retry/halt policy in [`crate::executor`]
/// and [`crate::coordinator`] matches on every variant, so adding one here
/// means updating those call sites too.
#[derive(Debug, Clone, Error)]
pub enum ExchangeError {
    #[error("auth error: {0}")]
    Auth(String),
    #[error("insufficient funds: {0}")]
    InsufficientFunds(String),
    #[error("order not found")]
    OrderNotFound,
    #[error("invalid param: {0}")]
    InvalidParam(String),
    #[error("rate limited")]
    RateLimited,
    #[error("transiently unavailable: {0}")]
    TransientUnavailable(String),
    #[error("duplicate client_oid: {0}")]
    DuplicateClientOid(String),
    #[error("other: {0}")]
    Other(String),
}

impl ExchangeError {
    /// Transient errors are retried by the executor; these are not.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ExchangeError::RateLimited | ExchangeError::TransientUnavailable(_)
        )
    }
}

/// Errors raised by the engine's own components (not the exchange boundary).
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("exchange error: {0}")]
    Exchange(#[from] ExchangeError),
    #[error("persistence failure: {0}")]
    Persistence(String),
    #[error("configuration error: {0}")]
    Config(String),
    #[error("strategy/symbol-metadata bug: {0}")]
    InvalidParam(String),
}

pub type EngineResult<T> = Result<T, EngineError>;
