//! Retry bookkeeping carried in message headers.

use lapin::types::{AMQPValue, FieldTable, ShortString};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Header holding the number of failed attempts seen on the retry queue.
pub const RETRY_COUNT_HEADER: &str = "retry-count";
/// Header read by the delayed-message exchange before it routes the message.
pub const DELAY_HEADER: &str = "x-delay";

/// Bound on the retry loop.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Highest `retry-count` that is still republished.
    pub max_attempts: u32,
    /// Delay hint written to `x-delay` the first time a message reaches the retry queue.
    pub delay: Duration,
}

impl RetryPolicy {
    /// `max_attempts` is the highest counter a message is republished with.
    pub fn new(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            delay,
        }
    }

    /// Checks if a message should be republished once its counter reached `state`.
    pub fn should_retry(&self, state: RetryState) -> bool {
        state.count <= self.max_attempts
    }

    /// The delay as the `x-delay` header value, saturated at `i64::MAX`.
    pub fn delay_ms(&self) -> i64 {
        i64::try_from(self.delay.as_millis()).unwrap_or(i64::MAX)
    }
}

impl Default for RetryPolicy {
    /// Three retries, twenty seconds apart.
    fn default() -> Self {
        Self::new(3, Duration::from_secs(20))
    }
}

/// Number of failed attempts of one message, as found in its headers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct RetryState {
    pub count: u32,
}

impl RetryState {
    pub fn new(count: u32) -> Self {
        Self { count }
    }

    /// Reads `retry-count`. A missing, negative or non-integer value counts as zero.
    pub fn from_headers(headers: &FieldTable) -> Self {
        let count = headers
            .inner()
            .get(RETRY_COUNT_HEADER)
            .and_then(integer_value)
            .and_then(|count| u32::try_from(count).ok())
            .unwrap_or(0);
        Self { count }
    }

    /// State after one more failure.
    #[must_use]
    pub fn on_failure(self) -> Self {
        Self {
            count: self.count.saturating_add(1),
        }
    }

    pub fn write_to(self, headers: &mut FieldTable) {
        headers.insert(
            ShortString::from(RETRY_COUNT_HEADER),
            AMQPValue::LongLongInt(i64::from(self.count)),
        );
    }
}

/// Fills in the retry headers of a message entering the retry queue for the first time.
///
/// Existing headers are returned unchanged apart from the added entries.
pub fn initialize_headers(headers: Option<&FieldTable>, policy: &RetryPolicy) -> FieldTable {
    let mut headers = headers.cloned().unwrap_or_default();
    if !headers.inner().contains_key(RETRY_COUNT_HEADER) {
        RetryState::default().write_to(&mut headers);
        if !headers.inner().contains_key(DELAY_HEADER) {
            headers.insert(
                ShortString::from(DELAY_HEADER),
                AMQPValue::LongLongInt(policy.delay_ms()),
            );
        }
    }
    headers
}

fn integer_value(value: &AMQPValue) -> Option<i64> {
    match value {
        AMQPValue::ShortShortInt(v) => Some(i64::from(*v)),
        AMQPValue::ShortShortUInt(v) => Some(i64::from(*v)),
        AMQPValue::ShortInt(v) => Some(i64::from(*v)),
        AMQPValue::ShortUInt(v) => Some(i64::from(*v)),
        AMQPValue::LongInt(v) => Some(i64::from(*v)),
        AMQPValue::LongUInt(v) => Some(i64::from(*v)),
        AMQPValue::LongLongInt(v) => Some(*v),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers_with(key: &str, value: AMQPValue) -> FieldTable {
        let mut headers = FieldTable::default();
        headers.insert(key.into(), value);
        headers
    }

    #[test]
    fn reads_any_integer_width() {
        for value in [
            AMQPValue::ShortShortUInt(2),
            AMQPValue::ShortInt(2),
            AMQPValue::LongInt(2),
            AMQPValue::LongLongInt(2),
        ] {
            let headers = headers_with(RETRY_COUNT_HEADER, value);
            assert_eq!(RetryState::from_headers(&headers), RetryState::new(2));
        }
    }

    #[test]
    fn unusable_counter_reads_as_zero() {
        assert_eq!(RetryState::from_headers(&FieldTable::default()).count, 0);
        let negative = headers_with(RETRY_COUNT_HEADER, AMQPValue::LongInt(-4));
        assert_eq!(RetryState::from_headers(&negative).count, 0);
        let text = headers_with(RETRY_COUNT_HEADER, AMQPValue::LongString("3".into()));
        assert_eq!(RetryState::from_headers(&text).count, 0);
    }

    #[test]
    fn bound_is_inclusive() {
        let policy = RetryPolicy::default();
        assert!(policy.should_retry(RetryState::new(1)));
        assert!(policy.should_retry(RetryState::new(3)));
        assert!(!policy.should_retry(RetryState::new(4)));
    }

    #[test]
    fn failure_increments_and_writes_back() {
        let mut headers = FieldTable::default();
        let next = RetryState::new(2).on_failure();
        next.write_to(&mut headers);
        assert_eq!(
            headers.inner().get(RETRY_COUNT_HEADER),
            Some(&AMQPValue::LongLongInt(3))
        );
    }

    #[test]
    fn initialization_adds_counter_and_delay_once() {
        let policy = RetryPolicy::default();
        let mut existing = headers_with("trace-id", AMQPValue::LongString("abc".into()));

        let initialized = initialize_headers(Some(&existing), &policy);
        assert_eq!(
            initialized.inner().get(RETRY_COUNT_HEADER),
            Some(&AMQPValue::LongLongInt(0))
        );
        assert_eq!(
            initialized.inner().get(DELAY_HEADER),
            Some(&AMQPValue::LongLongInt(20_000))
        );
        assert!(initialized.inner().contains_key("trace-id"));

        existing.insert(RETRY_COUNT_HEADER.into(), AMQPValue::LongInt(2));
        let untouched = initialize_headers(Some(&existing), &policy);
        assert_eq!(untouched, existing);
    }

    #[test]
    fn initialization_without_headers() {
        let headers = initialize_headers(None, &RetryPolicy::default());
        assert_eq!(RetryState::from_headers(&headers), RetryState::default());
        assert_eq!(headers.inner().len(), 2);
    }
}
