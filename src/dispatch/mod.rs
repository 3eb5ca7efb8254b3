pub mod executor;
pub mod retry;

pub use executor::{AttemptContext, CallRequest, LoadBalancedExecutor};
pub use retry::{PathPattern, RetryPolicy};
