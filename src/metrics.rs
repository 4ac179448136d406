use metriken::{AtomicHistogram, Counter, Gauge, LazyCounter, LazyGauge, metric};
use std::time::Duration;

#[derive(Debug, Clone, Copy)]
pub enum RequestStatus {
    Success,
    Failed(ErrorType),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorType {
    Connection,
    Http4xx(u16),
    Http5xx(u16),
    Parse,
    Timeout,
    Other,
}

#[metric(
    name = "requests",
    description = "Total number of requests",
    metadata = { status = "sent" }
)]
pub static REQUESTS_SENT: LazyCounter = LazyCounter::new(Counter::default);

#[metric(
    name = "requests",
    description = "Successful requests",
    metadata = { status = "success" }
)]
pub static REQUESTS_SUCCESS: LazyCounter = LazyCounter::new(Counter::default);

#[metric(
    name = "requests",
    description = "Failed requests",
    metadata = { status = "failed" }
)]
pub static REQUESTS_FAILED: LazyCounter = LazyCounter::new(Counter::default);

#[metric(
    name = "requests",
    description = "Timed out requests",
    metadata = { status = "timeout" }
)]
pub static REQUESTS_TIMEOUT: LazyCounter = LazyCounter::new(Counter::default);

#[metric(
    name = "errors",
    description = "Connection errors",
    metadata = { "type" = "connection" }
)]
pub static ERRORS_CONNECTION: LazyCounter = LazyCounter::new(Counter::default);

#[metric(
    name = "errors",
    description = "HTTP 4xx errors",
    metadata = { "type" = "http_4xx" }
)]
pub static ERRORS_HTTP_4XX: LazyCounter = LazyCounter::new(Counter::default);

#[metric(
    name = "errors",
    description = "HTTP 5xx errors",
    metadata = { "type" = "http_5xx" }
)]
pub static ERRORS_HTTP_5XX: LazyCounter = LazyCounter::new(Counter::default);

#[metric(
    name = "errors",
    description = "Parse errors",
    metadata = { "type" = "parse" }
)]
pub static ERRORS_PARSE: LazyCounter = LazyCounter::new(Counter::default);

#[metric(
    name = "errors",
    description = "Other errors",
    metadata = { "type" = "other" }
)]
pub static ERRORS_OTHER: LazyCounter = LazyCounter::new(Counter::default);

#[metric(
    name = "tokens",
    description = "Prompt tokens reported by the server",
    metadata = { direction = "input" }
)]
pub static TOKENS_INPUT: LazyCounter = LazyCounter::new(Counter::default);

#[metric(
    name = "tokens",
    description = "Completion tokens reported by the server",
    metadata = { direction = "output" }
)]
pub static TOKENS_OUTPUT: LazyCounter = LazyCounter::new(Counter::default);

#[metric(
    name = "requests_inflight",
    description = "Current number of requests in flight"
)]
pub static REQUESTS_INFLIGHT: LazyGauge = LazyGauge::new(Gauge::default);

// Histogram parameters: (grouping_power=5, max_value_power=64)
#[metric(
    name = "ttft",
    description = "Time to first token in nanoseconds",
    metadata = { unit = "nanoseconds" }
)]
pub static TTFT: AtomicHistogram = AtomicHistogram::new(5, 64);

#[metric(
    name = "request_latency",
    description = "Non-streaming request latency in nanoseconds",
    metadata = { unit = "nanoseconds" }
)]
pub static REQUEST_LATENCY: AtomicHistogram = AtomicHistogram::new(5, 64);

/// Process-wide request accounting, shared by every batch.
pub struct Metrics;

impl Metrics {
    pub fn record_request_sent() {
        REQUESTS_SENT.increment();
        REQUESTS_INFLIGHT.increment();
    }

    pub fn record_request_complete(status: RequestStatus) {
        REQUESTS_INFLIGHT.decrement();
        match status {
            RequestStatus::Success => {
                REQUESTS_SUCCESS.increment();
            }
            RequestStatus::Failed(error_type) => {
                REQUESTS_FAILED.increment();
                match error_type {
                    ErrorType::Connection => ERRORS_CONNECTION.increment(),
                    ErrorType::Http4xx(_) => ERRORS_HTTP_4XX.increment(),
                    ErrorType::Http5xx(_) => ERRORS_HTTP_5XX.increment(),
                    ErrorType::Parse => ERRORS_PARSE.increment(),
                    ErrorType::Timeout => REQUESTS_TIMEOUT.increment(),
                    ErrorType::Other => ERRORS_OTHER.increment(),
                };
            }
        }
    }

    pub fn record_tokens(input: u64, output: u64) {
        TOKENS_INPUT.add(input);
        TOKENS_OUTPUT.add(output);
    }

    pub fn record_ttft(duration: Duration) {
        let _ = TTFT.increment(duration.as_nanos() as u64);
    }

    pub fn record_latency(duration: Duration) {
        let _ = REQUEST_LATENCY.increment(duration.as_nanos() as u64);
    }
}

/// Point-in-time copy of the request counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct RequestCounts {
    pub sent: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub timeouts: u64,
    pub connection_errors: u64,
    pub http_4xx_errors: u64,
    pub http_5xx_errors: u64,
    pub parse_errors: u64,
    pub other_errors: u64,
    pub input_tokens: u64,
    pub output_tokens: u64,
}

impl RequestCounts {
    pub fn snapshot() -> Self {
        Self {
            sent: REQUESTS_SENT.value(),
            succeeded: REQUESTS_SUCCESS.value(),
            failed: REQUESTS_FAILED.value(),
            timeouts: REQUESTS_TIMEOUT.value(),
            connection_errors: ERRORS_CONNECTION.value(),
            http_4xx_errors: ERRORS_HTTP_4XX.value(),
            http_5xx_errors: ERRORS_HTTP_5XX.value(),
            parse_errors: ERRORS_PARSE.value(),
            other_errors: ERRORS_OTHER.value(),
            input_tokens: TOKENS_INPUT.value(),
            output_tokens: TOKENS_OUTPUT.value(),
        }
    }

    /// Counts accumulated since `earlier`.
    pub fn since(&self, earlier: &RequestCounts) -> RequestCounts {
        RequestCounts {
            sent: self.sent.saturating_sub(earlier.sent),
            succeeded: self.succeeded.saturating_sub(earlier.succeeded),
            failed: self.failed.saturating_sub(earlier.failed),
            timeouts: self.timeouts.saturating_sub(earlier.timeouts),
            connection_errors: self.connection_errors.saturating_sub(earlier.connection_errors),
            http_4xx_errors: self.http_4xx_errors.saturating_sub(earlier.http_4xx_errors),
            http_5xx_errors: self.http_5xx_errors.saturating_sub(earlier.http_5xx_errors),
            parse_errors: self.parse_errors.saturating_sub(earlier.parse_errors),
            other_errors: self.other_errors.saturating_sub(earlier.other_errors),
            input_tokens: self.input_tokens.saturating_sub(earlier.input_tokens),
            output_tokens: self.output_tokens.saturating_sub(earlier.output_tokens),
        }
    }

    pub fn total_errors(&self) -> u64 {
        self.connection_errors
            + self.http_4xx_errors
            + self.http_5xx_errors
            + self.parse_errors
            + self.timeouts
            + self.other_errors
    }

    pub fn success_rate(&self) -> f64 {
        let completed = self.succeeded + self.failed;
        if completed > 0 {
            self.succeeded as f64 / completed as f64
        } else {
            0.0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counts_since() {
        let earlier = RequestCounts {
            sent: 4,
            succeeded: 3,
            failed: 1,
            ..Default::default()
        };
        let later = RequestCounts {
            sent: 10,
            succeeded: 7,
            failed: 3,
            timeouts: 1,
            ..Default::default()
        };
        let delta = later.since(&earlier);
        assert_eq!(delta.sent, 6);
        assert_eq!(delta.succeeded, 4);
        assert_eq!(delta.failed, 2);
        assert_eq!(delta.total_errors(), 1);
        assert!((delta.success_rate() - 4.0 / 6.0).abs() < 1e-9);
    }

    #[test]
    fn test_success_rate_without_requests() {
        assert_eq!(RequestCounts::default().success_rate(), 0.0);
    }
}
