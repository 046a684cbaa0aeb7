//! Configuration management
//!
//! Layered file + environment settings, loaded once by the binary.

mod settings;

pub use settings::*;
