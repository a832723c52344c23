//! Pluggable response decoding.

use crate::error::NetResult;
use serde::de::DeserializeOwned;

/// Turns a successful response body into a typed value.
pub trait ResponseDecoder: Send + Sync {
    /// Decodes `bytes` as `T`.
    fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> NetResult<T>;
}

/// JSON decoder.
///
/// Timestamps are expected as RFC 3339 / ISO-8601 strings, which is how
/// `chrono`'s serde support reads `DateTime<Utc>`.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonDecoder;

impl ResponseDecoder for JsonDecoder {
    fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> NetResult<T> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::NetError;
    use chrono::{DateTime, TimeZone, Utc};
    use serde::Deserialize;

    #[derive(Debug, Deserialize, PartialEq)]
    struct Stamp {
        id: u32,
        at: DateTime<Utc>,
    }

    #[test]
    fn decodes_iso8601_dates() {
        let stamp: Stamp = JsonDecoder
            .decode(br#"{"id": 7, "at": "2024-03-01T12:30:00Z"}"#)
            .unwrap();
        assert_eq!(stamp.id, 7);
        assert_eq!(stamp.at, Utc.with_ymd_and_hms(2024, 3, 1, 12, 30, 0).unwrap());
    }

    #[test]
    fn schema_mismatch_is_decoding_error() {
        let result: NetResult<Stamp> = JsonDecoder.decode(br#"{"id": "seven"}"#);
        assert!(matches!(result, Err(NetError::Decoding(_))));
    }
}
