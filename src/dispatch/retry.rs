//! Retry classification and wait calculation for load-balanced calls.
//!
//! Whether a failed attempt may be repeated depends on how far the request
//! got. A connect failure, an open circuit or a full bulkhead means nothing
//! reached the upstream, so any method can be retried. A read timeout means the upstream
//! may already be acting on the request, so only idempotent calls (`GET`, or
//! paths explicitly listed as safe) are retried.

use http::Method;
use regex::Regex;
use std::time::Duration;

use crate::core::config::{ClientConfig, RetryConfig};
use crate::core::error::{BalancerError, BalancerResult, CallError};

/// Ant-style path pattern
///
/// `*` matches exactly one path segment, `**` matches any number of
/// segments (including none). A `*` inside a segment matches within that
/// segment only.
#[derive(Debug, Clone)]
pub struct PathPattern {
    source: String,
    regex: Regex,
}

impl PathPattern {
    pub fn new(pattern: &str) -> BalancerResult<Self> {
        if !pattern.starts_with('/') {
            return Err(BalancerError::config(format!(
                "Path pattern '{}' must start with '/'",
                pattern
            )));
        }

        let mut expr = String::from("^");
        for segment in pattern.split('/').skip(1) {
            match segment {
                "**" => expr.push_str("(?:/.*)?"),
                "*" => expr.push_str("/[^/]+"),
                _ => {
                    expr.push('/');
                    let parts: Vec<String> = segment.split('*').map(regex::escape).collect();
                    expr.push_str(&parts.join("[^/]*"));
                }
            }
        }
        expr.push('$');

        let regex = Regex::new(&expr).map_err(|e| {
            BalancerError::config(format!("Invalid path pattern '{}': {}", pattern, e))
        })?;
        Ok(Self {
            source: pattern.to_string(),
            regex,
        })
    }

    /// Match against a request path; any query string is ignored
    pub fn matches(&self, path: &str) -> bool {
        let path = path.split('?').next().unwrap_or(path);
        self.regex.is_match(path)
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }
}

/// Compiled retry settings for one service
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    config: RetryConfig,
    retryable_paths: Vec<PathPattern>,
}

impl RetryPolicy {
    pub fn from_config(config: &ClientConfig) -> BalancerResult<Self> {
        config.retry.validate()?;
        let retryable_paths = config
            .retryable_paths
            .iter()
            .map(|pattern| PathPattern::new(pattern))
            .collect::<BalancerResult<Vec<_>>>()?;
        Ok(Self {
            config: config.retry.clone(),
            retryable_paths,
        })
    }

    pub fn max_attempts(&self) -> u32 {
        self.config.max_attempts
    }

    /// Whether a call that may already have been processed is safe to repeat
    pub fn is_idempotent(&self, method: &Method, path: &str) -> bool {
        method == Method::GET || self.retryable_paths.iter().any(|p| p.matches(path))
    }

    /// Decide whether `error` from one attempt warrants another attempt
    pub fn should_retry(&self, method: &Method, path: &str, error: &BalancerError) -> bool {
        match error {
            BalancerError::UpstreamCall { error, .. } => match error {
                CallError::CircuitOpen(_) | CallError::BulkheadFull(_) | CallError::Connect(_) => {
                    true
                }
                CallError::ReadTimeout(_) => self.is_idempotent(method, path),
                CallError::Io(_) if error.request_possibly_sent() => {
                    self.is_idempotent(method, path)
                }
                CallError::Io(_) => true,
                CallError::Status { .. } => error.is_transient(),
                CallError::Other(_) => false,
            },
            other => other.is_retryable(),
        }
    }

    /// Wait before the next attempt, drawn uniformly from `wait * (1 ± factor)`
    pub fn next_wait(&self) -> Duration {
        let base = self.config.wait_duration;
        let factor = self.config.randomized_wait_factor;
        if factor <= 0.0 || base.is_zero() {
            return base;
        }
        let scale = 1.0 - factor + 2.0 * factor * fastrand::f64();
        base.mul_f64(scale)
    }
}
