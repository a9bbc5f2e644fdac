use tracing::debug;

use super::RetryPolicy;
use crate::core::StatusCode;

/// Outcome of asking a source context whether to reconnect
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Schedule another connection attempt
    Retry,
    /// Give up and finish the stream cleanly
    Stop,
    /// Retrying does not apply, the stream fails
    NoNeed,
}

/// Retry bookkeeping of one stream
#[derive(Debug, Clone)]
pub struct SourceContext {
    policy: RetryPolicy,
    reconnect_on_eof: bool,
    source_url: Option<String>,
    last_status: StatusCode,
    attempts: u32,
    eof_cycle: bool,
}

impl SourceContext {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            reconnect_on_eof: false,
            source_url: None,
            last_status: StatusCode::Ok,
            attempts: 0,
            eof_cycle: false,
        }
    }

    /// Also reconnect when the source reports a clean end of data
    pub fn with_reconnect_on_eof(mut self, reconnect: bool) -> Self {
        self.reconnect_on_eof = reconnect;
        self
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn source_url(&self) -> Option<&str> {
        self.source_url.as_deref()
    }

    pub fn set_source_url(&mut self, url: impl Into<String>) {
        self.source_url = Some(url.into());
    }

    pub fn last_status(&self) -> StatusCode {
        self.last_status
    }

    /// Attempts made since data was last delivered
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Whether the current retry cycle started at a clean end of data
    pub fn in_eof_cycle(&self) -> bool {
        self.eof_cycle
    }

    /// Records the outcome of the last read or reconnect. Opening a
    /// connection alone does not reset the attempt counter.
    pub fn set_last_process_status(&mut self, status: StatusCode) {
        if status == StatusCode::NoData {
            self.eof_cycle = true;
        }
        self.last_status = status;
    }

    /// The source produced data again: the retry cycle is over
    pub fn record_delivery(&mut self) {
        self.attempts = 0;
        self.eof_cycle = false;
        self.last_status = StatusCode::Success;
    }

    pub fn need_retry(&mut self) -> RetryDecision {
        let clean_end = self.last_status == StatusCode::NoData;
        if clean_end && !self.reconnect_on_eof {
            return RetryDecision::Stop;
        }

        if self.attempts >= self.policy.max_attempts() {
            debug!(
                attempts = self.attempts,
                last_status = %self.last_status,
                "retry attempts exhausted"
            );
            return if clean_end || self.eof_cycle {
                RetryDecision::Stop
            } else {
                RetryDecision::NoNeed
            };
        }

        self.attempts += 1;
        RetryDecision::Retry
    }

    /// Delay before the attempt most recently granted by `need_retry`
    pub fn retry_interval(&self) -> std::time::Duration {
        self.policy.interval(self.attempts.max(1))
    }
}
