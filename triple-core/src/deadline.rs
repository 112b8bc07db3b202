//! `grpc-timeout` header encoding and deadline arithmetic.
//!
//! The wire form is `<value><unit>` where the value has at most eight
//! decimal digits and the unit is one of `H` (hours), `M` (minutes),
//! `S` (seconds), `m` (milliseconds), `u` (microseconds), `n`
//! (nanoseconds). The encoder picks the smallest unit whose value fits.

use std::time::{Duration, Instant};

use crate::error::{Result, TripleError};

/// Name of the request header carrying the negotiated timeout.
pub const GRPC_TIMEOUT: &str = "grpc-timeout";

const MAX_TIMEOUT_VALUE: u128 = 99_999_999;

/// Encode a timeout budget for the `grpc-timeout` request header.
///
/// Durations too large for even the hour unit are clamped to the maximum
/// representable value.
pub fn encode_grpc_timeout(timeout: Duration) -> String {
    let nanos = timeout.as_nanos();
    if nanos <= MAX_TIMEOUT_VALUE {
        return format!("{nanos}n");
    }
    let micros = nanos / 1_000;
    if micros <= MAX_TIMEOUT_VALUE {
        return format!("{micros}u");
    }
    let millis = micros / 1_000;
    if millis <= MAX_TIMEOUT_VALUE {
        return format!("{millis}m");
    }
    let secs = millis / 1_000;
    if secs <= MAX_TIMEOUT_VALUE {
        return format!("{secs}S");
    }
    let minutes = secs / 60;
    if minutes <= MAX_TIMEOUT_VALUE {
        return format!("{minutes}M");
    }
    let hours = minutes / 60;
    format!("{}H", hours.min(MAX_TIMEOUT_VALUE))
}

/// Decode a `grpc-timeout` header value into a timeout budget.
pub fn decode_grpc_timeout(raw: &str) -> Result<Duration> {
    if raw.len() < 2 {
        return Err(TripleError::MalformedHeaders(format!(
            "grpc-timeout {raw:?} is too short"
        )));
    }
    let (digits, unit) = raw.split_at(raw.len() - 1);
    if digits.len() > 8 || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return Err(TripleError::MalformedHeaders(format!(
            "grpc-timeout value {digits:?} is not 1-8 decimal digits"
        )));
    }
    let value: u64 = digits
        .parse()
        .map_err(|_| TripleError::MalformedHeaders(format!("grpc-timeout value {digits:?}")))?;
    let duration = match unit {
        "H" => Duration::from_secs(value * 3_600),
        "M" => Duration::from_secs(value * 60),
        "S" => Duration::from_secs(value),
        "m" => Duration::from_millis(value),
        "u" => Duration::from_micros(value),
        "n" => Duration::from_nanos(value),
        other => {
            return Err(TripleError::MalformedHeaders(format!(
                "grpc-timeout unit {other:?} is not one of H M S m u n"
            )))
        }
    };
    Ok(duration)
}

/// Absolute deadline for a call, against the monotonic clock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Deadline(Instant);

impl Deadline {
    pub fn after(timeout: Duration) -> Deadline {
        Deadline(Instant::now() + timeout)
    }

    pub fn at(instant: Instant) -> Deadline {
        Deadline(instant)
    }

    pub fn instant(&self) -> Instant {
        self.0
    }

    /// Remaining budget; zero once the deadline has passed.
    pub fn remaining(&self) -> Duration {
        self.0.saturating_duration_since(Instant::now())
    }

    pub fn expired(&self) -> bool {
        self.remaining() == Duration::ZERO
    }
}
