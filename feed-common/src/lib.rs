// feed-common: error taxonomy, retry policy and logging shared by the
// feed-sync crates.

pub mod error;
pub mod logging;
pub mod retry;

pub use error::{ErrorCategory, ErrorClassification};
pub use retry::RetryPolicy;
