//! Building blocks for the [`clap`]-driven configuration of the event ingester.
//!
//! Each block is flattened into a subcommand's config and only validates and shapes the raw
//! values; turning them into queue clients, object stores and pipeline settings happens in the
//! binary.

use std::{convert::Infallible, time::Duration};

use non_empty_string::NonEmptyString;

pub mod endpoint;
pub mod flush;
pub mod logging;
pub mod object_store;
pub mod queue;

/// An empty string parses as `None`, so an empty env var behaves like an unset one.
pub(crate) fn parse_optional_string(s: &str) -> Result<Option<NonEmptyString>, Infallible> {
    Ok(NonEmptyString::new(s.to_string()).ok())
}

/// A bare number of seconds (`"20"`), or a [`humantime`] duration (`"20s"`, `"1m 30s"`).
pub(crate) fn parse_duration(s: &str) -> Result<Duration, humantime::DurationError> {
    match s.trim().parse::<u64>() {
        Ok(secs) => Ok(Duration::from_secs(secs)),
        Err(_) => humantime::parse_duration(s),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn durations_accept_bare_seconds() {
        assert_eq!(parse_duration("20").unwrap(), Duration::from_secs(20));
        assert_eq!(parse_duration("0").unwrap(), Duration::ZERO);
        assert_eq!(parse_duration("250ms").unwrap(), Duration::from_millis(250));
        assert_eq!(parse_duration("1m 30s").unwrap(), Duration::from_secs(90));
        assert!(parse_duration("-1").is_err());
        assert!(parse_duration("soon").is_err());
    }
}
