pub mod bulkhead;
pub mod circuit_breaker;
pub mod config;
pub mod error;
pub mod types;
