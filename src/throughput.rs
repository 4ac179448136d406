use log::{debug, info, warn};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use crate::aggregate::{
    Batch, Diagnostic, LatencyCorrection, Sample, ThroughputSummary, TokenUsage, derive_throughput,
    failure_diagnostics, total_usage,
};
use crate::batch::fan_out;
use crate::client::{ChatCompletionRequest, ClientError, CompletionClient, FailureStage};
use crate::metrics::{Metrics, RequestStatus};
use crate::probe::{DEFAULT_REQUEST_TIMEOUT, ProbeOutcome, TtftProber};
use crate::prompt::PromptSpec;

/// The four headline numbers for one concurrency level.
///
/// Zero in any field means no usable measurement for it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct SpeedMeasurement {
    /// Completion tokens per second across the batch.
    pub generation_speed: f64,
    /// Prompt tokens per second, using the slowest TTFT as processing time.
    pub prompt_throughput: f64,
    /// Seconds.
    pub max_ttft: f64,
    /// Seconds.
    pub min_ttft: f64,
}

/// Everything one throughput pass produced, including its TTFT probe.
#[derive(Debug)]
pub struct ThroughputOutcome {
    pub probe: ProbeOutcome,
    pub batch: Batch<TokenUsage>,
    pub duration: Duration,
    pub totals: TokenUsage,
    pub correction: LatencyCorrection,
    pub summary: ThroughputSummary,
    pub succeeded: usize,
    pub failed: usize,
    pub diagnostics: Vec<Diagnostic>,
}

impl ThroughputOutcome {
    pub fn measurement(&self) -> SpeedMeasurement {
        SpeedMeasurement {
            generation_speed: self.summary.generation_speed,
            prompt_throughput: self.summary.prompt_throughput,
            max_ttft: self.probe.summary.max,
            min_ttft: self.probe.summary.min,
        }
    }
}

/// Drives a TTFT probe followed by an independent batch of full
/// non-streaming completions, and derives token rates from both.
pub struct ThroughputRunner<C> {
    client: Arc<C>,
    model: String,
    max_tokens: u32,
    network_latency_ms: f64,
    request_timeout: Duration,
}

impl<C: CompletionClient> ThroughputRunner<C> {
    pub fn new(client: Arc<C>, model: impl Into<String>, max_tokens: u32, network_latency_ms: f64) -> Self {
        Self {
            client,
            model: model.into(),
            max_tokens,
            network_latency_ms,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }

    pub fn with_request_timeout(mut self, request_timeout: Duration) -> Self {
        if !request_timeout.is_zero() {
            self.request_timeout = request_timeout;
        }
        self
    }

    /// Fixed prompts get latency-corrected denominators; random input does not.
    pub fn correction_for(&self, prompt: &PromptSpec) -> LatencyCorrection {
        if prompt.applies_latency_correction() {
            LatencyCorrection::Corrected {
                network_latency_ms: self.network_latency_ms,
            }
        } else {
            LatencyCorrection::Raw
        }
    }

    pub async fn run(&self, prompt: &PromptSpec, concurrency: usize) -> ThroughputOutcome {
        let probe = TtftProber::new(Arc::clone(&self.client), self.model.clone())
            .with_request_timeout(self.request_timeout)
            .probe(prompt, concurrency)
            .await;

        debug!(
            "Running throughput batch: {} workers, max_tokens {}",
            concurrency, self.max_tokens
        );

        let start = Instant::now();
        let run = fan_out(concurrency, |index| {
            let client = Arc::clone(&self.client);
            let model = self.model.clone();
            let prompt = prompt.clone();
            let max_tokens = self.max_tokens;
            let timeout = self.request_timeout;
            async move { exchange_worker(client, model, prompt, max_tokens, index, timeout).await }
        })
        .await;
        let duration = start.elapsed();

        let totals = total_usage(&run.batch);
        let correction = self.correction_for(prompt);
        let (summary, mut diagnostics) = derive_throughput(totals, duration, &probe.summary, correction);

        let succeeded = run.counters.succeeded();
        let failed = run.counters.failed();
        diagnostics.extend(failure_diagnostics(succeeded, failed));
        for diagnostic in &diagnostics {
            diagnostic.emit();
        }

        info!(
            "Concurrency {}: {:.2} tok/s generation, {:.2} tok/s prompt, TTFT {:.3}s..{:.3}s",
            concurrency,
            summary.generation_speed,
            summary.prompt_throughput,
            probe.summary.min,
            probe.summary.max
        );

        ThroughputOutcome {
            probe,
            batch: run.batch,
            duration,
            totals,
            correction,
            summary,
            succeeded,
            failed,
            diagnostics,
        }
    }
}

/// `(generation_speed, prompt_throughput, max_ttft, min_ttft)` for one
/// concurrency level.
pub async fn run_throughput<C: CompletionClient>(
    client: Arc<C>,
    model: &str,
    prompt: &PromptSpec,
    concurrency: usize,
    max_tokens: u32,
    network_latency_ms: f64,
) -> SpeedMeasurement {
    ThroughputRunner::new(client, model, max_tokens, network_latency_ms)
        .run(prompt, concurrency)
        .await
        .measurement()
}

async fn exchange_worker<C: CompletionClient>(
    client: Arc<C>,
    model: String,
    prompt: PromptSpec,
    max_tokens: u32,
    index: usize,
    timeout: Duration,
) -> Sample<TokenUsage> {
    let request = ChatCompletionRequest::new(&model, &prompt.resolve(), max_tokens, false);

    Metrics::record_request_sent();
    let start = Instant::now();

    let result = match tokio::time::timeout(timeout, client.complete(request)).await {
        Ok(result) => result,
        Err(_) => Err(ClientError::Timeout(timeout)),
    };

    match result {
        Ok(completion) => {
            let usage = completion.usage;
            Metrics::record_latency(start.elapsed());
            Metrics::record_tokens(usage.prompt_tokens, usage.completion_tokens);
            Metrics::record_request_complete(RequestStatus::Success);
            debug!(
                "Request {} completed: {} prompt, {} completion tokens",
                index, usage.prompt_tokens, usage.completion_tokens
            );
            Sample::Succeeded(usage)
        }
        Err(e) => {
            warn!("Request {} {} failed: {}", index, FailureStage::Exchange, e);
            Metrics::record_request_complete(RequestStatus::Failed(e.error_type()));
            Sample::Failed
        }
    }
}
