//! Defines the check that decides whether processing a message failed.

use crate::message::Message;

/// Business check applied to each decoded message.
///
/// Implement this trait to plug real processing into a consumer. Returning `true`
/// sends the message down the consumer's failure path.
pub trait FailurePredicate: Send + Sync {
    fn is_failure(&self, message: &Message) -> bool;

    /// A name for the predicate, used for logging.
    fn name(&self) -> &str;
}

/// Simulated failure: the text equals a fixed value, ignoring case.
#[derive(Debug, Clone)]
pub struct TextEquals {
    expected: String,
    name: String,
}

impl TextEquals {
    pub fn new(expected: impl Into<String>) -> Self {
        let expected: String = expected.into().to_lowercase();
        let name = format!("text == {expected:?}");
        Self { expected, name }
    }
}

impl FailurePredicate for TextEquals {
    fn is_failure(&self, message: &Message) -> bool {
        message.text.to_lowercase() == self.expected
    }

    fn name(&self) -> &str {
        &self.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn match_ignores_case() {
        let predicate = TextEquals::new("error");
        assert!(predicate.is_failure(&Message::new("error")));
        assert!(predicate.is_failure(&Message::new("ERROR")));
        assert!(predicate.is_failure(&Message::new("Error")));
    }

    #[test]
    fn match_is_exact() {
        let predicate = TextEquals::new("Error Retry");
        assert!(predicate.is_failure(&Message::new("error retry")));
        assert!(!predicate.is_failure(&Message::new("error")));
        assert!(!predicate.is_failure(&Message::new(" error retry")));
        assert!(!predicate.is_failure(&Message::new("hello")));
    }
}
