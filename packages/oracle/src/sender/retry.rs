//! Submission retry policy
//!
//! Maps node rejections onto what the sender does next: wait and resend,
//! resend at a higher gas price, re-read the nonce, defer the task to a later
//! cycle, or give up and mark it failed.

use std::time::Duration;

use tracing::debug;

use crate::error::RpcError;

#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Node rejections tolerated per task before giving up; also the failed
    /// broadcasts per round before an unreachable node defers the task
    pub max_retries: u32,
    /// First backoff; doubles with every further failure
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    /// Each underpriced rejection raises the price by this share of the base
    pub gas_bump_percent: u32,
    /// Bumped prices stop at this percentage of the base price
    pub gas_ceiling_percent: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 5,
            initial_backoff: Duration::from_secs(2),
            max_backoff: Duration::from_secs(60),
            gas_bump_percent: 20,
            gas_ceiling_percent: 300,
        }
    }
}

impl RetryConfig {
    /// Backoff after `failures` earlier failures (0 gives the initial delay)
    pub fn backoff(&self, failures: u32) -> Duration {
        let factor = 1u32.checked_shl(failures).unwrap_or(u32::MAX);
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }

    pub fn exhausted(&self, failures: u32) -> bool {
        failures >= self.max_retries
    }

    /// Highest price a bump may reach for `base`
    pub fn gas_ceiling(&self, base: u128) -> u128 {
        base.saturating_mul(self.gas_ceiling_percent as u128) / 100
    }

    /// `base` raised by `bumps` steps of `gas_bump_percent`, capped
    pub fn bumped_gas_price(&self, base: u128, bumps: u32) -> u128 {
        let percent = 100 + self.gas_bump_percent as u128 * bumps as u128;
        (base.saturating_mul(percent) / 100).min(self.gas_ceiling(base).max(base))
    }
}

/// What kind of failure a node error represents
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Network trouble or rate limiting
    Transient,
    Underpriced,
    /// The nonce was consumed, usually by an earlier broadcast
    NonceTooLow,
    /// The node already holds this exact transaction
    AlreadyKnown,
    NonceTooHigh,
    /// Resending the same call cannot succeed
    Permanent,
    Unknown,
}

impl ErrorClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorClass::Transient => "transient",
            ErrorClass::Underpriced => "underpriced",
            ErrorClass::NonceTooLow => "nonce_too_low",
            ErrorClass::AlreadyKnown => "already_known",
            ErrorClass::NonceTooHigh => "nonce_too_high",
            ErrorClass::Permanent => "permanent",
            ErrorClass::Unknown => "unknown",
        }
    }
}

/// Message fragments per class; the first matching row wins, so
/// "already known" is checked before the nonce rows
const MESSAGE_PATTERNS: &[(ErrorClass, &[&str])] = &[
    (
        ErrorClass::Transient,
        &[
            "timeout",
            "connection",
            "rate limit",
            "too many requests",
            "temporarily unavailable",
        ],
    ),
    (ErrorClass::AlreadyKnown, &["already known", "known transaction"]),
    (
        ErrorClass::Underpriced,
        &[
            "underpriced",
            "replacement transaction",
            "gas price too low",
            "fee too low",
        ],
    ),
    (
        ErrorClass::NonceTooLow,
        &["nonce too low", "already been processed"],
    ),
    (ErrorClass::NonceTooHigh, &["nonce too high"]),
    (
        ErrorClass::Permanent,
        &[
            "reverted",
            "invalid signature",
            "insufficient funds",
            "out of gas",
            "intrinsic gas too low",
            "exceeds block gas limit",
            "invalid sender",
        ],
    ),
];

/// Classify the message of a JSON-RPC error object
pub fn classify_message(message: &str) -> ErrorClass {
    let message = message.to_ascii_lowercase();
    MESSAGE_PATTERNS
        .iter()
        .find(|(_, fragments)| fragments.iter().any(|f| message.contains(f)))
        .map(|(class, _)| *class)
        .unwrap_or(ErrorClass::Unknown)
}

pub fn classify_error(error: &RpcError) -> ErrorClass {
    match error {
        RpcError::Unavailable(_) => ErrorClass::Transient,
        RpcError::Rejected { message, .. } => classify_message(message),
        RpcError::InvalidResponse(_) => ErrorClass::Unknown,
    }
}

/// The sender's next step after a rejected broadcast
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryAction {
    /// Resend unchanged after the delay
    Backoff(Duration),
    /// Resend at `gas_price` after the delay
    BumpGas { after: Duration, gas_price: u128 },
    /// Re-read the account nonce after the delay, then resend
    RefreshNonce { after: Duration },
    /// The node has the transaction already; record it as sent
    AlreadySubmitted,
    /// The node is unreachable; stop for this cycle, the task stays Claimed
    Defer,
    /// Mark the task failed
    DeadLetter,
}

/// Failure history of one task submission round
///
/// `failures` covers this round only. `rejections` is the task's running
/// total of node rejections, seeded from the store, so a task that keeps
/// getting rejected runs out of budget even when every round ends early.
#[derive(Debug, Clone)]
pub struct RetryContext {
    config: RetryConfig,
    base_gas_price: u128,
    failures: u32,
    rejections: u32,
    last_error: Option<RpcError>,
}

impl RetryContext {
    /// `base_gas_price` is the network price the first broadcast used
    pub fn new(config: RetryConfig, base_gas_price: u128) -> Self {
        Self {
            config,
            base_gas_price,
            failures: 0,
            rejections: 0,
            last_error: None,
        }
    }

    /// Continue from the rejections earlier rounds already spent
    pub fn with_prior_rejections(mut self, rejections: u32) -> Self {
        self.rejections = rejections;
        self
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }

    pub fn rejections(&self) -> u32 {
        self.rejections
    }

    pub fn last_error(&self) -> Option<&RpcError> {
        self.last_error.as_ref()
    }

    /// Whether the last failure was the node being unreachable rather than
    /// a rejection of the transaction
    pub fn last_was_unavailable(&self) -> bool {
        matches!(self.last_error, Some(RpcError::Unavailable(_)))
    }

    pub fn record_failure(&mut self, error: RpcError) {
        self.failures += 1;
        if !matches!(error, RpcError::Unavailable(_)) {
            self.rejections += 1;
        }
        self.last_error = Some(error);
    }

    pub fn last_class(&self) -> ErrorClass {
        self.last_error
            .as_ref()
            .map_or(ErrorClass::Unknown, classify_error)
    }

    pub fn next_action(&self) -> RetryAction {
        let class = self.last_class();

        let action = if self.last_was_unavailable() {
            if self.config.exhausted(self.failures) {
                RetryAction::Defer
            } else {
                RetryAction::Backoff(self.config.backoff(self.failures.saturating_sub(1)))
            }
        } else {
            self.after_rejection(class)
        };

        debug!(
            class = class.as_str(),
            failures = self.failures,
            rejections = self.rejections,
            ?action,
            "Retry decision"
        );
        action
    }

    fn after_rejection(&self, class: ErrorClass) -> RetryAction {
        match (class, self.config.exhausted(self.rejections)) {
            (ErrorClass::Permanent, _) => RetryAction::DeadLetter,
            (ErrorClass::AlreadyKnown, _) => RetryAction::AlreadySubmitted,
            (_, true) => RetryAction::DeadLetter,
            (ErrorClass::NonceTooLow, false) => RetryAction::RefreshNonce {
                after: Duration::ZERO,
            },
            (ErrorClass::NonceTooHigh, false) => RetryAction::RefreshNonce {
                after: self.config.backoff(self.failures),
            },
            (ErrorClass::Underpriced, false) => RetryAction::BumpGas {
                after: Duration::ZERO,
                gas_price: self
                    .config
                    .bumped_gas_price(self.base_gas_price, self.failures),
            },
            (ErrorClass::Transient | ErrorClass::Unknown, false) => {
                RetryAction::Backoff(self.config.backoff(self.failures.saturating_sub(1)))
            }
        }
    }
}
