//! Consolidated error handling shared by the feed-sync crates.
//!
//! This module provides:
//! - Common error types that can be reused across crates
//! - Error classification traits consumed by the retry policy
//!
//! # Usage
//!
//! ```rust,ignore
//! use feed_common::error::ErrorClassification;
//!
//! fn handle_error(err: impl ErrorClassification) {
//!     if err.is_transient() {
//!         if let Some(delay) = err.suggested_retry_delay() {
//!             // Retry after delay
//!         }
//!     }
//! }
//! ```

mod common;
mod traits;

pub use common::*;
pub use traits::*;
