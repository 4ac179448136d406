use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt::Write as _;
use std::time::{Duration, SystemTime};

use crate::metrics::RequestCounts;
use crate::prompt::PromptSpec;
use crate::throughput::{SpeedMeasurement, ThroughputOutcome};

#[derive(Debug, Clone, Serialize)]
pub struct BenchmarkReport {
    // Metadata
    pub timestamp: DateTime<Utc>,
    pub duration: Duration,
    pub version: String,

    // Test configuration
    pub endpoint: String,
    pub model: String,
    pub input: PromptSpec,
    pub max_tokens: u32,
    pub network_latency_ms: f64,

    // Results
    pub levels: Vec<LevelResult>,
    pub requests: RequestCounts,
}

/// Headline numbers for one concurrency level.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct LevelResult {
    pub concurrency: usize,
    #[serde(flatten)]
    pub measurement: SpeedMeasurement,
    pub succeeded: usize,
    pub failed: usize,
}

impl LevelResult {
    pub fn from_outcome(concurrency: usize, outcome: &ThroughputOutcome) -> Self {
        Self {
            concurrency,
            measurement: outcome.measurement(),
            succeeded: outcome.succeeded,
            failed: outcome.failed,
        }
    }
}

pub struct ReportBuilder {
    start_time: SystemTime,
    counts_at_start: RequestCounts,
    endpoint: String,
    model: String,
    input: PromptSpec,
    max_tokens: u32,
    network_latency_ms: f64,
    levels: Vec<LevelResult>,
}

impl ReportBuilder {
    pub fn new(endpoint: &str, model: &str, input: PromptSpec, max_tokens: u32, network_latency_ms: f64) -> Self {
        Self {
            start_time: SystemTime::now(),
            counts_at_start: RequestCounts::snapshot(),
            endpoint: endpoint.to_string(),
            model: model.to_string(),
            input,
            max_tokens,
            network_latency_ms,
            levels: Vec::new(),
        }
    }

    pub fn record(&mut self, level: LevelResult) {
        self.levels.push(level);
    }

    pub fn levels(&self) -> &[LevelResult] {
        &self.levels
    }

    pub fn build(&self) -> Result<BenchmarkReport> {
        let duration = SystemTime::now().duration_since(self.start_time)?;

        Ok(BenchmarkReport {
            timestamp: self.start_time.into(),
            duration,
            version: env!("CARGO_PKG_VERSION").to_string(),
            endpoint: self.endpoint.clone(),
            model: self.model.clone(),
            input: self.input.clone(),
            max_tokens: self.max_tokens,
            network_latency_ms: self.network_latency_ms,
            levels: self.levels.clone(),
            requests: RequestCounts::snapshot().since(&self.counts_at_start),
        })
    }

    pub fn print_console_report(&self) -> Result<()> {
        let report = self.build()?;
        let timestamp = Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, false);

        println!();
        println!("{} -----", timestamp);
        println!("{} Benchmark Complete", timestamp);
        println!("{} Endpoint: {}  Model: {}", timestamp, report.endpoint, report.model);
        println!(
            "{} Input: {}  Max tokens: {}  Latency: {:.2}ms",
            timestamp,
            report.input.describe(),
            report.max_tokens,
            report.network_latency_ms
        );
        println!("{} Duration: {:.1}s", timestamp, report.duration.as_secs_f64());
        println!(
            "{} Requests: Sent: {} Ok: {} Err: {} Success: {:.2}%",
            timestamp,
            report.requests.sent,
            report.requests.succeeded,
            report.requests.failed,
            report.requests.success_rate() * 100.0
        );

        if report.requests.total_errors() > 0 {
            println!(
                "{} Errors: Connection: {} 4xx: {} 5xx: {} Timeout: {} Parse: {} Other: {}",
                timestamp,
                report.requests.connection_errors,
                report.requests.http_4xx_errors,
                report.requests.http_5xx_errors,
                report.requests.timeouts,
                report.requests.parse_errors,
                report.requests.other_errors
            );
        }

        println!(
            "{} Tokens: Input: {} Output: {}",
            timestamp, report.requests.input_tokens, report.requests.output_tokens
        );
        println!();
        print!("{}", format_table(&report.levels));
        println!();

        Ok(())
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(&self.build()?)?)
    }
}

/// Render a rate or latency, with the zero sentinel shown as `-`.
fn cell(value: f64, precision: usize) -> String {
    if value == 0.0 || !value.is_finite() {
        "-".to_string()
    } else {
        format!("{:.*}", precision, value)
    }
}

pub fn format_table(levels: &[LevelResult]) -> String {
    let mut out = String::new();
    let _ = writeln!(
        out,
        "| {:>11} | {:>18} | {:>14} | {:>12} | {:>12} |",
        "Concurrency", "Generation (tok/s)", "Prompt (tok/s)", "Min TTFT (s)", "Max TTFT (s)"
    );
    let _ = writeln!(
        out,
        "|{}|{}|{}|{}|{}|",
        "-".repeat(13),
        "-".repeat(20),
        "-".repeat(16),
        "-".repeat(14),
        "-".repeat(14)
    );
    for level in levels {
        let m = &level.measurement;
        let _ = writeln!(
            out,
            "| {:>11} | {:>18} | {:>14} | {:>12} | {:>12} |",
            level.concurrency,
            cell(m.generation_speed, 2),
            cell(m.prompt_throughput, 2),
            cell(m.min_ttft, 3),
            cell(m.max_ttft, 3)
        );
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn level(concurrency: usize, generation_speed: f64, max_ttft: f64, min_ttft: f64) -> LevelResult {
        LevelResult {
            concurrency,
            measurement: SpeedMeasurement {
                generation_speed,
                prompt_throughput: 0.0,
                max_ttft,
                min_ttft,
            },
            succeeded: concurrency,
            failed: 0,
        }
    }

    #[test]
    fn test_table_renders_rows_and_sentinels() {
        let table = format_table(&[level(1, 215.384, 0.2, 0.1), level(8, 0.0, 0.0, 0.0)]);
        let lines: Vec<&str> = table.lines().collect();
        assert_eq!(lines.len(), 4);
        assert!(lines[0].contains("Generation (tok/s)"));
        assert!(lines[2].contains("215.38"));
        assert!(lines[2].contains("0.200"));
        assert!(lines[2].contains("0.100"));
        assert!(lines[3].contains('8'));
        assert_eq!(lines[3].matches(" - ").count(), 4);
    }

    #[test]
    fn test_json_report_flattens_measurements() {
        let mut builder = ReportBuilder::new("http://x/v1", "m", PromptSpec::random(10), 512, 3.0);
        builder.record(level(4, 100.0, 0.5, 0.2));
        let json: serde_json::Value = serde_json::from_str(&builder.to_json().unwrap()).unwrap();

        assert_eq!(json["model"], "m");
        assert_eq!(json["input"]["mode"], "random");
        assert_eq!(json["input"]["words"], 10);
        assert_eq!(json["levels"][0]["concurrency"], 4);
        assert_eq!(json["levels"][0]["generation_speed"], 100.0);
        assert_eq!(json["levels"][0]["max_ttft"], 0.5);
    }
}
