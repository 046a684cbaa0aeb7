//! Data provider abstractions and implementations
//!
//! This module defines the provider interface the syncer pages through and
//! implements the HTTP provider plus a deterministic mock for tests.

pub mod ccdata;
pub mod mock;
mod traits;

pub use traits::*;
