use std::fmt;
use std::time::Duration;

use crate::config::PipelineConfig;
use crate::transport::TransportError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureKind {
    Transport(TransportError),
    Status(u16),
    BadContentType(String),
}

impl FailureKind {
    pub fn is_retryable(&self) -> bool {
        match self {
            FailureKind::Transport(err) => err.is_transient(),
            FailureKind::Status(status) => *status == 429 || (500..600).contains(status),
            FailureKind::BadContentType(_) => true,
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureKind::Transport(err) => write!(f, "{err}"),
            FailureKind::Status(status) => write!(f, "HTTP {status}"),
            FailureKind::BadContentType(ct) => write!(f, "unexpected Content-Type={ct}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum NextAction {
    Retry(Duration),
    SwitchToPatient(Duration),
    Fail,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownloadState {
    Attempting { attempt: u32 },
    Backoff { attempt: u32 },
    PatientFinal { attempt: u32 },
    Succeeded { attempt: u32 },
    Failed { attempt: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub patient_mode: bool,
    pub backoff_cap: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &PipelineConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            patient_mode: config.patient_mode,
            backoff_cap: Duration::from_secs(config.backoff_cap_secs),
        }
    }

    pub fn is_patient(&self, attempt: u32) -> bool {
        self.patient_mode && attempt == self.max_attempts
    }

    /// `min(cap, 2^attempt + jitter)` seconds, with `jitter` in `[0, 1)`.
    pub fn backoff(&self, attempt: u32, jitter: f64) -> Duration {
        let base = 2f64.powi(attempt.min(30) as i32) + jitter.clamp(0.0, 1.0);
        Duration::from_secs_f64(base).min(self.backoff_cap)
    }

    pub fn next_action(&self, attempt: u32, failure: &FailureKind, jitter: f64) -> NextAction {
        if !failure.is_retryable() || attempt >= self.max_attempts {
            return NextAction::Fail;
        }
        let delay = self.backoff(attempt, jitter);
        if self.is_patient(attempt + 1) {
            NextAction::SwitchToPatient(delay)
        } else {
            NextAction::Retry(delay)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(max_attempts: u32, patient_mode: bool) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            patient_mode,
            backoff_cap: Duration::from_secs(60),
        }
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = policy(10, false);
        assert_eq!(policy.backoff(1, 0.0), Duration::from_secs(2));
        assert_eq!(policy.backoff(3, 0.5), Duration::from_secs_f64(8.5));
        assert_eq!(policy.backoff(6, 0.9), Duration::from_secs(60));
    }

    #[test]
    fn transient_failures_retry_until_ceiling() {
        let policy = policy(3, false);
        let failure = FailureKind::Transport(TransportError::ReadTimeout);
        assert_eq!(
            policy.next_action(1, &failure, 0.0),
            NextAction::Retry(Duration::from_secs(2))
        );
        assert_eq!(
            policy.next_action(2, &failure, 0.0),
            NextAction::Retry(Duration::from_secs(4))
        );
        assert_eq!(policy.next_action(3, &failure, 0.0), NextAction::Fail);
    }

    #[test]
    fn last_attempt_switches_to_patient() {
        let policy = policy(3, true);
        let failure = FailureKind::Status(503);
        assert_eq!(
            policy.next_action(2, &failure, 0.0),
            NextAction::SwitchToPatient(Duration::from_secs(4))
        );
        assert!(policy.is_patient(3));
        assert!(!policy.is_patient(2));
    }

    #[test]
    fn client_errors_fail_immediately() {
        let policy = policy(5, true);
        assert_eq!(
            policy.next_action(1, &FailureKind::Status(404), 0.0),
            NextAction::Fail
        );
        assert_eq!(
            policy.next_action(
                1,
                &FailureKind::BadContentType("text/html".to_string()),
                0.0
            ),
            NextAction::Retry(Duration::from_secs(2))
        );
    }

    #[test]
    fn throttling_is_retried() {
        let policy = policy(4, false);
        assert!(FailureKind::Status(429).is_retryable());
        assert_eq!(
            policy.next_action(1, &FailureKind::Status(429), 0.0),
            NextAction::Retry(Duration::from_secs(2))
        );
    }
}
