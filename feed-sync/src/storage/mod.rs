//! Storage layer for series data
//!
//! PostgreSQL persistence with bulk `COPY` loads, an in-memory gateway for
//! tests, and the instrument catalog that feeds the sync targets.

mod catalog;
mod gateway;
mod memory;
mod postgres;
mod staging;

pub use catalog::*;
pub use gateway::*;
pub use memory::*;
pub use postgres::*;
pub use staging::*;
