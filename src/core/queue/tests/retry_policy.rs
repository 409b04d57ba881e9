use std::time::Duration;

use crate::core::error::JobErrorClass;
use crate::core::queue::{RetryDecision, RetryPolicy};

fn policy() -> RetryPolicy {
    RetryPolicy {
        max_attempts: 3,
        base_backoff: Duration::from_millis(100),
        max_backoff: Duration::from_secs(1),
    }
}

#[test]
fn validation_errors_fail_immediately() {
    assert_eq!(policy().decide(1, JobErrorClass::Validation), RetryDecision::Fail);
}

#[test]
fn transient_errors_retry_until_the_last_attempt() {
    let p = policy();
    assert!(matches!(p.decide(1, JobErrorClass::Transient), RetryDecision::Retry(d) if d <= Duration::from_millis(100)));
    assert!(matches!(p.decide(2, JobErrorClass::Transient), RetryDecision::Retry(d) if d <= Duration::from_millis(200)));
    assert_eq!(p.decide(3, JobErrorClass::Transient), RetryDecision::Dead);
    assert_eq!(p.decide(7, JobErrorClass::Transient), RetryDecision::Dead);
}
