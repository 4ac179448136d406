use log::{debug, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use crate::aggregate::{Batch, Diagnostic, Sample, TtftSummary, summarize_ttft, ttft_diagnostic};
use crate::batch::fan_out;
use crate::client::{ChatCompletionRequest, ChunkStream, ClientError, CompletionClient, FailureStage};
use crate::metrics::{Metrics, RequestStatus};
use crate::prompt::PromptSpec;

/// Upper bound on one worker's whole request lifecycle.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(90);

/// Completion cap for probe requests; only the first chunk is ever read.
pub const PROBE_MAX_TOKENS: u32 = 512;

/// Everything one TTFT batch produced.
#[derive(Debug)]
pub struct ProbeOutcome {
    pub batch: Batch<Duration>,
    pub summary: TtftSummary,
    pub diagnostics: Vec<Diagnostic>,
}

/// Measures time to first token across a batch of parallel streaming
/// requests.
pub struct TtftProber<C> {
    client: Arc<C>,
    model: String,
    request_timeout: Duration,
}

impl<C: CompletionClient> TtftProber<C> {
    pub fn new(client: Arc<C>, model: impl Into<String>) -> Self {
        Self {
            client,
            model: model.into(),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }

    pub fn with_request_timeout(mut self, request_timeout: Duration) -> Self {
        if !request_timeout.is_zero() {
            self.request_timeout = request_timeout;
        }
        self
    }

    /// Run `concurrency` streaming requests at once and reduce their first
    /// chunk latencies.
    ///
    /// Failed workers are logged and excluded. When none succeed the summary
    /// is the (0, 0) sentinel and a single diagnostic is emitted.
    pub async fn probe(&self, prompt: &PromptSpec, concurrency: usize) -> ProbeOutcome {
        debug!("Probing TTFT with {} concurrent streams", concurrency);

        let run = fan_out(concurrency, |index| {
            let client = Arc::clone(&self.client);
            let model = self.model.clone();
            let prompt = prompt.clone();
            let timeout = self.request_timeout;
            async move { ttft_worker(client, model, prompt, index, timeout).await }
        })
        .await;

        let summary = summarize_ttft(&run.batch);
        let diagnostics: Vec<Diagnostic> = ttft_diagnostic(&summary, concurrency).into_iter().collect();
        for diagnostic in &diagnostics {
            diagnostic.emit();
        }

        ProbeOutcome {
            batch: run.batch,
            summary,
            diagnostics,
        }
    }
}

/// `(max_ttft, min_ttft)` in seconds; `(0.0, 0.0)` means no usable measurement.
pub async fn probe_ttft<C: CompletionClient>(
    client: Arc<C>,
    model: &str,
    prompt: &PromptSpec,
    concurrency: usize,
) -> (f64, f64) {
    let outcome = TtftProber::new(client, model).probe(prompt, concurrency).await;
    (outcome.summary.max, outcome.summary.min)
}

async fn ttft_worker<C: CompletionClient>(
    client: Arc<C>,
    model: String,
    prompt: PromptSpec,
    index: usize,
    timeout: Duration,
) -> Sample<Duration> {
    let request = ChatCompletionRequest::new(&model, &prompt.resolve(), PROBE_MAX_TOKENS, true);

    Metrics::record_request_sent();
    let start = Instant::now();

    let result = match tokio::time::timeout(timeout, first_chunk(client.as_ref(), request, start)).await {
        Ok(result) => result,
        Err(_) => Err((FailureStage::FirstChunk, ClientError::Timeout(timeout))),
    };

    match result {
        Ok(ttft) => {
            Metrics::record_ttft(ttft);
            Metrics::record_request_complete(RequestStatus::Success);
            debug!("TTFT worker {}: {:.3}s", index, ttft.as_secs_f64());
            Sample::Succeeded(ttft)
        }
        Err((stage, e)) => {
            warn!("TTFT {} error (worker {}): {}", stage, index, e);
            Metrics::record_request_complete(RequestStatus::Failed(e.error_type()));
            Sample::Failed
        }
    }
}

/// Open the stream and wait for exactly one chunk. The stream is dropped,
/// closing the connection, as soon as that chunk is observed.
async fn first_chunk<C: CompletionClient>(
    client: &C,
    request: ChatCompletionRequest,
    start: Instant,
) -> Result<Duration, (FailureStage, ClientError)> {
    let mut stream = client
        .open_stream(request)
        .await
        .map_err(|e| (FailureStage::StreamOpen, e))?;

    match stream.next_chunk().await {
        Ok(Some(_)) => Ok(start.elapsed()),
        Ok(None) => Err((FailureStage::FirstChunk, ClientError::StreamClosed)),
        Err(e) => Err((FailureStage::FirstChunk, e)),
    }
}
