//! Retry and error classification for chain interactions
//!
//! Provides exponential backoff and the string classifier that maps raw
//! RPC / revert messages onto retry decisions.

use std::time::Duration;

/// Exponential backoff shared by the watcher, submitter and store recovery loop
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Attempts before a transient failure becomes final
    pub max_retries: u32,
    pub initial_backoff: Duration,
    /// Ceiling for a single sleep
    pub max_backoff: Duration,
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 5,
            initial_backoff: Duration::from_secs(2),
            max_backoff: Duration::from_secs(60),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    pub fn new(max_retries: u32, initial_backoff: Duration) -> Self {
        Self {
            max_retries,
            initial_backoff,
            ..Self::default()
        }
    }

    /// Sleep before retry number `attempt + 1` (0-indexed)
    pub fn backoff_for_attempt(&self, attempt: u32) -> Duration {
        let factor = self.backoff_multiplier.powi(attempt.min(i32::MAX as u32) as i32);
        let secs = (self.initial_backoff.as_secs_f64() * factor).min(self.max_backoff.as_secs_f64());
        Duration::from_secs_f64(secs)
    }

    /// `attempt` failures so far
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_retries
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// RPC timeout, rate limit, mempool churn
    Transient,
    /// Replay guard tripped, the transfer is already delivered
    AlreadyProcessed,
    /// Bad signature, proof or relayer
    InvalidAuthorization,
    Permanent,
    /// Retried like a transient error
    Unknown,
}

/// Map a raw RPC or revert message onto an [`ErrorClass`]
pub fn classify_error(error: &str) -> ErrorClass {
    let error_lower = error.to_lowercase();

    // Replay guard on the destination contract
    if error_lower.contains("already processed")
        || error_lower.contains("already been processed")
        || error_lower.contains("nonce already used")
        || error_lower.contains("already minted")
        || error_lower.contains("already released")
    {
        return ErrorClass::AlreadyProcessed;
    }

    if error_lower.contains("invalid signature")
        || error_lower.contains("invalid proof")
        || error_lower.contains("invalid merkle proof")
        || error_lower.contains("not authorized")
        || error_lower.contains("unauthorized relayer")
        || error_lower.contains("invalid nonce")
    {
        return ErrorClass::InvalidAuthorization;
    }

    if error_lower.contains("timeout")
        || error_lower.contains("timed out")
        || error_lower.contains("connection")
        || error_lower.contains("network")
        || error_lower.contains("rate limit")
        || error_lower.contains("too many requests")
        || error_lower.contains("503")
        || error_lower.contains("502")
        || error_lower.contains("temporarily unavailable")
        || error_lower.contains("underpriced")
        || error_lower.contains("replacement transaction")
        || error_lower.contains("nonce too low")
        || error_lower.contains("nonce too high")
        || error_lower.contains("already known")
    {
        return ErrorClass::Transient;
    }

    if error_lower.contains("reverted")
        || error_lower.contains("execution reverted")
        || error_lower.contains("insufficient funds")
        || error_lower.contains("out of gas")
        || error_lower.contains("invalid parameters")
    {
        return ErrorClass::Permanent;
    }

    ErrorClass::Unknown
}

/// The node already holds these exact transaction bytes
pub fn is_known_transaction(error: &str) -> bool {
    let error_lower = error.to_lowercase();
    error_lower.contains("already known")
        || error_lower.contains("known transaction")
        || error_lower.contains("already imported")
}

/// The sender nonce of a signed transaction has been consumed
pub fn is_nonce_too_low(error: &str) -> bool {
    let error_lower = error.to_lowercase();
    error_lower.contains("nonce too low") || error_lower.contains("nonce is too low")
}
