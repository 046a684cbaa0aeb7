//! CCData futures historical provider
//!
//! REST pagination over `/futures/v1/historical/...` keyed by market,
//! instrument and an inclusive `to_ts`.

mod client;

pub use client::CcdataProvider;
