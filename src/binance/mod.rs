// =============================================================================
// Binance USDⓈ-M futures connectivity
// =============================================================================

pub mod client;
pub mod rate_limit;

pub use client::BinanceClient;
