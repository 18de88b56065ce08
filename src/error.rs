//! Error taxonomy for the backtesting core.
//!
//! Connectors, the pipeline, and the experiment runner classify failures into
//! these kinds so that retry policy can be decided at the call site:
//! transient errors (network, 5xx, rate limits) are retried with backoff,
//! deterministic errors (unknown symbol, bad parameters) are not.

use thiserror::Error;

use crate::market::series::SeriesKind;

/// Failures raised by exchange connectors and the symbol mapper.
#[derive(Debug, Error)]
pub enum ExchangeError {
    /// Transport or protocol failure after retries were exhausted.
    #[error("exchange API error: {0}")]
    Api(String),

    /// The exchange responded, but the payload did not parse into the
    /// expected shape.
    #[error("malformed exchange response: {0}")]
    Format(String),

    #[error("symbol not found on exchange: {0}")]
    SymbolNotFound(String),

    /// Surfaced only once the connector's internal 429 handling gave up.
    #[error("rate limit exceeded: {0}")]
    RateLimited(String),

    #[error("{exchange} does not support {capability}")]
    NotSupported {
        exchange: &'static str,
        capability: &'static str,
    },

    #[error("unknown exchange: {0}")]
    UnknownExchange(String),

    #[error("ambiguous symbol {0}: no known quote suffix matches")]
    AmbiguousSymbol(String),
}

impl ExchangeError {
    /// Whether a retry at a higher layer could plausibly succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Api(_) | Self::RateLimited(_))
    }
}

/// Failures raised by the storage layer and quality controller.
#[derive(Debug, Error)]
pub enum DataError {
    #[error("storage I/O: {0}")]
    Io(#[from] std::io::Error),

    #[error("storage encoding: {0}")]
    Encoding(#[from] polars::error::PolarsError),

    /// A required series failed quality control with critical findings.
    #[error("data quality failure for {symbol} {kind}: {detail}")]
    Quality {
        symbol: String,
        kind: SeriesKind,
        detail: String,
    },

    /// A required series could not be produced by storage or any connector.
    #[error("missing required series {kind} for {symbol}")]
    Missing { symbol: String, kind: SeriesKind },

    #[error(transparent)]
    Exchange(#[from] ExchangeError),
}

impl DataError {
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Exchange(e) => e.is_transient(),
            Self::Io(_) => true,
            _ => false,
        }
    }
}

/// User-facing configuration and parameter errors. Never retried.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid parameter {name}: {detail}")]
    InvalidParameter { name: String, detail: String },

    #[error("unknown strategy: {0}")]
    UnknownStrategy(String),

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Top-level error for operations that cross layer boundaries.
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Exchange(#[from] ExchangeError),

    #[error(transparent)]
    Data(#[from] DataError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    /// An experiment task exceeded its per-run deadline.
    #[error("task timed out after {0:.1}s")]
    Timeout(f64),
}

impl Error {
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Exchange(e) => e.is_transient(),
            Self::Data(e) => e.is_transient(),
            Self::Config(_) | Self::Timeout(_) => false,
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
