//! Data pipeline: rate-limited exchange connectors, on-disk storage,
//! quality control, and the storage-first loader that feeds the engine.

pub mod binance;
pub mod bybit;
pub mod connector;
pub mod limiter;
pub mod okx;
pub mod pipeline;
pub mod quality;
pub mod storage;
