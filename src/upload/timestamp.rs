// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Timestamp format shared with the profile store: UTC, seven fractional digits.

use chrono::{DateTime, SecondsFormat, Utc};

pub fn timestamp_to_string(time: DateTime<Utc>) -> String {
    format!(
        "{}.{:07}Z",
        time.format("%Y-%m-%dT%H:%M:%S"),
        time.timestamp_subsec_nanos() / 100
    )
}

/// Format a millisecond Unix timestamp. Out of range values format as the epoch.
pub fn timestamp_millis_to_string(millis: i64) -> String {
    timestamp_to_string(DateTime::from_timestamp_millis(millis).unwrap_or_default())
}

/// Re-pad an RFC 3339 timestamp returned by the backend to seven fractional
/// digits. Timestamps that don't parse are returned unchanged.
pub fn pad_nanos(timestamp: &str) -> String {
    match DateTime::parse_from_rfc3339(timestamp) {
        Ok(time) => timestamp_to_string(time.with_timezone(&Utc)),
        Err(err) => {
            tracing::debug!(?err, timestamp, "unable to parse timestamp");
            timestamp.to_owned()
        }
    }
}

/// Second-resolution RFC 3339 with `:` replaced, suitable for file names.
pub(crate) fn file_name_timestamp(time: DateTime<Utc>) -> String {
    time.to_rfc3339_opts(SecondsFormat::Secs, true)
        .replace(":", "-")
}

#[cfg(test)]
mod tests {
    use test_case::test_case;

    use super::*;

    #[test]
    fn test_timestamp_millis_to_string() {
        assert_eq!(
            timestamp_millis_to_string(1_600_000_000_123),
            "2020-09-13T12:26:40.1230000Z"
        );
        assert_eq!(timestamp_millis_to_string(0), "1970-01-01T00:00:00.0000000Z");
    }

    #[test_case("2020-10-14T12:00:00.123Z", "2020-10-14T12:00:00.1230000Z"; "short")]
    #[test_case("2020-10-14T12:00:00Z", "2020-10-14T12:00:00.0000000Z"; "no fraction")]
    #[test_case("2020-10-14T12:00:00.123456789+00:00", "2020-10-14T12:00:00.1234567Z"; "nanos")]
    #[test_case("2020-10-14T14:00:00.5+02:00", "2020-10-14T12:00:00.5000000Z"; "offset")]
    #[test_case("garbage", "garbage"; "unparsable")]
    fn test_pad_nanos(input: &str, expected: &str) {
        assert_eq!(pad_nanos(input), expected);
    }

    #[test]
    fn test_file_name_timestamp() {
        let time = DateTime::from_timestamp(1_600_000_000, 0).unwrap();
        assert_eq!(file_name_timestamp(time), "2020-09-13T12-26-40Z");
    }
}
