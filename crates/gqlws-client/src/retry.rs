//! Retry classification for connection teardowns.
//!
//! Decides whether a disconnect is worth another dial: configured close-code
//! ranges first, then a built-in set of transient transport codes. Errors
//! carrying no close code at all are treated as network blips.

use crate::error::SubscriptionError;

/// Close codes that are always worth retrying: the peer went away, restarted,
/// or asked us to try again later.
const TRANSIENT_CLOSE_CODES: &[u16] = &[1001, 1005, 1006, 1012, 1013, 1014];

/// Parse close-code range expressions such as `"4400"` or `"4400-4499"`.
///
/// Single numbers become degenerate ranges. Bounds are inclusive.
///
/// # Errors
/// Returns [`SubscriptionError::InvalidStatusCode`] naming the offending
/// token when an expression is not `\d+` or `\d+-\d+`.
pub fn parse_int_ranges<S: AsRef<str>>(
    inputs: &[S],
) -> Result<Vec<(i32, i32)>, SubscriptionError> {
    fn parse_bound(token: &str) -> Option<i32> {
        if token.is_empty() || !token.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        token.parse().ok()
    }

    let mut ranges = Vec::with_capacity(inputs.len());
    for input in inputs {
        let token = input.as_ref();
        let invalid = || SubscriptionError::InvalidStatusCode(token.to_string());

        let range = match token.split_once('-') {
            None => {
                let code = parse_bound(token).ok_or_else(invalid)?;
                (code, code)
            }
            Some((low, high)) => {
                let low = parse_bound(low).ok_or_else(invalid)?;
                let high = parse_bound(high).ok_or_else(invalid)?;
                (low, high)
            }
        };
        ranges.push(range);
    }
    Ok(ranges)
}

/// Decides retry vs. fatal for a disconnect error.
#[derive(Debug, Clone, Default)]
pub struct RetryClassifier {
    ranges: Vec<(i32, i32)>,
}

impl RetryClassifier {
    /// Build a classifier from parsed ranges.
    #[must_use]
    pub const fn new(ranges: Vec<(i32, i32)>) -> Self {
        Self { ranges }
    }

    /// Build a classifier from raw range expressions.
    ///
    /// # Errors
    /// Returns [`SubscriptionError::InvalidStatusCode`] for a bad expression.
    pub fn from_expressions<S: AsRef<str>>(inputs: &[S]) -> Result<Self, SubscriptionError> {
        Ok(Self::new(parse_int_ranges(inputs)?))
    }

    /// Whether a close code falls in the configured or transient sets.
    #[must_use]
    pub fn is_retryable_code(&self, code: u16) -> bool {
        let code_i32 = i32::from(code);
        self.ranges
            .iter()
            .any(|(low, high)| (*low..=*high).contains(&code_i32))
            || TRANSIENT_CLOSE_CODES.contains(&code)
    }

    /// Whether a disconnect error should trigger a reconnect.
    ///
    /// Errors without a close code (dial failures, EOF, timer expiries) are
    /// retryable network blips.
    #[must_use]
    pub fn is_retryable(&self, error: &SubscriptionError) -> bool {
        error
            .close_status()
            .map_or(true, |code| self.is_retryable_code(code))
    }
}
