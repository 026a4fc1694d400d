use chrono::{DateTime, NaiveDateTime, Utc};
use http::header::{HeaderMap, DATE};

/// Header carrying the server's own UTC timestamp
pub const SERVER_TIME_HEADER: &str = "x-server-time";

/// One round trip's worth of clock evidence. Consumed immediately by the
/// estimator; all values are epoch milliseconds.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClockSample {
    pub server_timestamp_ms: f64,
    pub request_sent_at_ms: Option<f64>,
    pub response_received_at_ms: f64,
}

impl ClockSample {
    pub fn new(
        server_timestamp: DateTime<Utc>,
        request_sent_at: Option<DateTime<Utc>>,
        response_received_at: DateTime<Utc>,
    ) -> Self {
        Self {
            server_timestamp_ms: server_timestamp.timestamp_millis() as f64,
            request_sent_at_ms: request_sent_at.map(|t| t.timestamp_millis() as f64),
            response_received_at_ms: response_received_at.timestamp_millis() as f64,
        }
    }

    pub fn from_millis(
        server_timestamp_ms: f64,
        request_sent_at_ms: Option<f64>,
        response_received_at_ms: f64,
    ) -> Self {
        Self {
            server_timestamp_ms,
            request_sent_at_ms,
            response_received_at_ms,
        }
    }

    /// Build a sample from response headers, preferring `X-Server-Time` over
    /// the standard `Date` header. `None` if neither is present and parseable.
    pub fn from_headers(
        headers: &HeaderMap,
        request_sent_at: Option<DateTime<Utc>>,
        response_received_at: DateTime<Utc>,
    ) -> Option<Self> {
        let server_time = headers
            .get(SERVER_TIME_HEADER)
            .and_then(|v| v.to_str().ok())
            .and_then(parse_server_timestamp)
            .or_else(|| {
                headers
                    .get(DATE)
                    .and_then(|v| v.to_str().ok())
                    .and_then(parse_server_timestamp)
            })?;

        Some(Self::new(server_time, request_sent_at, response_received_at))
    }

    /// Round-trip time, never negative; a missing or unusable send time is 0
    pub fn rtt_ms(&self) -> f64 {
        match self.request_sent_at_ms {
            Some(sent) if sent.is_finite() => {
                let rtt = self.response_received_at_ms - sent;
                if rtt.is_finite() && rtt > 0.0 {
                    rtt
                } else {
                    0.0
                }
            }
            _ => 0.0,
        }
    }

    /// `serverTime - localTime` as seen by this sample, assuming the server
    /// stamped the response halfway through the round trip
    pub fn observed_offset_ms(&self) -> f64 {
        (self.server_timestamp_ms + self.rtt_ms() / 2.0) - self.response_received_at_ms
    }
}

/// Parse a server-generated timestamp.
///
/// Accepts RFC 3339 (with or without offset; naive values are UTC), epoch
/// milliseconds, and the RFC 2822 form used by the HTTP `Date` header.
pub fn parse_server_timestamp(value: &str) -> Option<DateTime<Utc>> {
    let value = value.trim();
    if value.is_empty() {
        return None;
    }

    if let Ok(parsed) = DateTime::parse_from_rfc3339(value) {
        return Some(parsed.with_timezone(&Utc));
    }

    if let Ok(naive) = NaiveDateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S%.f") {
        return Some(naive.and_utc());
    }

    if let Ok(millis) = value.parse::<i64>() {
        return DateTime::from_timestamp_millis(millis);
    }

    DateTime::parse_from_rfc2822(value)
        .ok()
        .map(|parsed| parsed.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use http::HeaderValue;

    #[test]
    fn test_observed_offset_uses_rtt_midpoint() {
        let sample = ClockSample::from_millis(950.0, Some(900.0), 1000.0);
        assert_eq!(sample.rtt_ms(), 100.0);
        assert_eq!(sample.observed_offset_ms(), 0.0);
    }

    #[test]
    fn test_negative_rtt_clamped_to_zero() {
        let sample = ClockSample::from_millis(1200.0, Some(1500.0), 1000.0);
        assert_eq!(sample.rtt_ms(), 0.0);
        assert_eq!(sample.observed_offset_ms(), 200.0);
    }

    #[test]
    fn test_missing_rtt_is_zero() {
        let sample = ClockSample::from_millis(1200.0, None, 1000.0);
        assert_eq!(sample.rtt_ms(), 0.0);

        let sample = ClockSample::from_millis(1200.0, Some(f64::NAN), 1000.0);
        assert_eq!(sample.rtt_ms(), 0.0);
    }

    #[test]
    fn test_parse_rfc3339_and_naive() {
        let expected = Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 0).unwrap();
        assert_eq!(parse_server_timestamp("2025-03-01T12:00:00Z"), Some(expected));
        assert_eq!(parse_server_timestamp("2025-03-01T21:00:00+09:00"), Some(expected));
        assert_eq!(parse_server_timestamp("2025-03-01T12:00:00"), Some(expected));
        assert_eq!(
            parse_server_timestamp("2025-03-01T12:00:00.5"),
            Some(expected + chrono::Duration::milliseconds(500))
        );
    }

    #[test]
    fn test_parse_http_date_and_millis() {
        let expected = Utc.with_ymd_and_hms(1994, 11, 6, 8, 49, 37).unwrap();
        assert_eq!(
            parse_server_timestamp("Sun, 06 Nov 1994 08:49:37 GMT"),
            Some(expected)
        );
        assert_eq!(
            parse_server_timestamp(&expected.timestamp_millis().to_string()),
            Some(expected)
        );
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert_eq!(parse_server_timestamp(""), None);
        assert_eq!(parse_server_timestamp("yesterday"), None);
    }

    #[test]
    fn test_from_headers_prefers_server_time_header() {
        let mut headers = HeaderMap::new();
        headers.insert(DATE, HeaderValue::from_static("Sun, 06 Nov 1994 08:49:37 GMT"));
        headers.insert(
            SERVER_TIME_HEADER,
            HeaderValue::from_static("2025-03-01T12:00:00Z"),
        );

        let received = Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 1).unwrap();
        let sample = ClockSample::from_headers(&headers, None, received).unwrap();
        assert_eq!(sample.observed_offset_ms(), -1000.0);
    }

    #[test]
    fn test_from_headers_falls_back_to_date() {
        let mut headers = HeaderMap::new();
        headers.insert(SERVER_TIME_HEADER, HeaderValue::from_static("not a time"));
        headers.insert(DATE, HeaderValue::from_static("Sat, 01 Mar 2025 12:00:05 GMT"));

        let received = Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 0).unwrap();
        let sample = ClockSample::from_headers(&headers, Some(received), received).unwrap();
        assert_eq!(sample.observed_offset_ms(), 5000.0);
    }

    #[test]
    fn test_from_headers_without_timestamp() {
        let headers = HeaderMap::new();
        assert!(ClockSample::from_headers(&headers, None, Utc::now()).is_none());
    }
}
