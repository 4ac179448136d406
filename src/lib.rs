pub mod aggregate;
pub mod batch;
pub mod benchmark;
pub mod cli;
pub mod client;
pub mod config;
pub mod latency;
pub mod metrics;
pub mod probe;
pub mod prompt;
pub mod report;
pub mod throughput;
pub mod tokenizer;

#[cfg(test)]
mod testing;

pub use aggregate::{Batch, Sample, ThroughputSummary, TokenUsage, TtftSummary};
pub use benchmark::{BenchmarkRunner, measure};
pub use cli::Cli;
pub use client::{ClientConfig, CompletionClient, OpenAIClient};
pub use config::Config;
pub use probe::{TtftProber, probe_ttft};
pub use prompt::PromptSpec;
pub use report::{BenchmarkReport, LevelResult, ReportBuilder};
pub use throughput::{SpeedMeasurement, ThroughputRunner, run_throughput};
