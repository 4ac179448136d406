//! Reduction of per-worker samples into headline numbers.
//!
//! Everything here is pure: the prober and runner fill a [`Batch`] and hand
//! it over once every worker has finished. Max, min and sum are commutative,
//! so the order in which workers complete never matters.

use serde::Serialize;
use std::fmt;
use std::ops::{Add, AddAssign};
use std::time::Duration;

/// Prompt and completion token counts reported for one exchange.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TokenUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
}

impl Add for TokenUsage {
    type Output = TokenUsage;

    fn add(self, rhs: TokenUsage) -> TokenUsage {
        TokenUsage {
            prompt_tokens: self.prompt_tokens + rhs.prompt_tokens,
            completion_tokens: self.completion_tokens + rhs.completion_tokens,
        }
    }
}

impl AddAssign for TokenUsage {
    fn add_assign(&mut self, rhs: TokenUsage) {
        *self = *self + rhs;
    }
}

/// Outcome of one worker's single attempt.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Sample<T> {
    Succeeded(T),
    Failed,
}

impl<T> Sample<T> {
    pub fn is_success(&self) -> bool {
        matches!(self, Sample::Succeeded(_))
    }

    pub fn value(&self) -> Option<&T> {
        match self {
            Sample::Succeeded(value) => Some(value),
            Sample::Failed => None,
        }
    }
}

/// One sample per logical client, indexed by worker.
#[derive(Debug, Clone)]
pub struct Batch<T> {
    samples: Vec<Sample<T>>,
}

impl<T> Batch<T> {
    /// Build a batch from per-index slots. A slot nobody wrote counts as a
    /// failure.
    pub fn from_slots(slots: Vec<Option<Sample<T>>>) -> Self {
        Self {
            samples: slots
                .into_iter()
                .map(|slot| slot.unwrap_or(Sample::Failed))
                .collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn samples(&self) -> &[Sample<T>] {
        &self.samples
    }

    pub fn successes(&self) -> impl Iterator<Item = &T> {
        self.samples.iter().filter_map(Sample::value)
    }

    pub fn succeeded(&self) -> usize {
        self.samples.iter().filter(|s| s.is_success()).count()
    }

    pub fn failed(&self) -> usize {
        self.len() - self.succeeded()
    }
}

impl<T> FromIterator<Sample<T>> for Batch<T> {
    fn from_iter<I: IntoIterator<Item = Sample<T>>>(iter: I) -> Self {
        Self {
            samples: iter.into_iter().collect(),
        }
    }
}

/// Max and min TTFT in seconds over successful samples.
///
/// Both are 0.0 when nothing succeeded; callers must treat that as "no usable
/// measurement", never as a fast response.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct TtftSummary {
    pub max: f64,
    pub min: f64,
    pub valid: usize,
}

impl TtftSummary {
    pub fn is_empty(&self) -> bool {
        self.valid == 0
    }
}

pub fn summarize_ttft(batch: &Batch<Duration>) -> TtftSummary {
    batch
        .successes()
        .map(Duration::as_secs_f64)
        .fold(TtftSummary::default(), |acc, ttft| {
            if acc.valid == 0 {
                TtftSummary {
                    max: ttft,
                    min: ttft,
                    valid: 1,
                }
            } else {
                TtftSummary {
                    max: acc.max.max(ttft),
                    min: acc.min.min(ttft),
                    valid: acc.valid + 1,
                }
            }
        })
}

/// Token sums over every slot; failed slots contribute zero.
pub fn total_usage(batch: &Batch<TokenUsage>) -> TokenUsage {
    batch
        .samples()
        .iter()
        .map(|s| s.value().copied().unwrap_or_default())
        .fold(TokenUsage::default(), |acc, usage| acc + usage)
}

/// How wall-clock denominators are adjusted before dividing.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "lowercase", tag = "kind")]
pub enum LatencyCorrection {
    /// Divide by the raw measured seconds.
    Raw,
    /// Subtract a one-way network latency estimate (milliseconds) first.
    Corrected { network_latency_ms: f64 },
}

impl LatencyCorrection {
    pub fn apply(&self, seconds: f64) -> f64 {
        match self {
            LatencyCorrection::Raw => seconds,
            LatencyCorrection::Corrected { network_latency_ms } => {
                seconds - network_latency_ms / 1000.0
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RateMetric {
    GenerationSpeed,
    PromptThroughput,
}

impl fmt::Display for RateMetric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RateMetric::GenerationSpeed => write!(f, "generation speed"),
            RateMetric::PromptThroughput => write!(f, "prompt throughput"),
        }
    }
}

/// Tokens per second, or `Err(denominator)` when the corrected denominator
/// is not a positive finite number.
pub fn token_rate(tokens: u64, seconds: f64, correction: LatencyCorrection) -> Result<f64, f64> {
    let denominator = correction.apply(seconds);
    if denominator.is_finite() && denominator > 0.0 {
        Ok(tokens as f64 / denominator)
    } else {
        Err(denominator)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct ThroughputSummary {
    pub generation_speed: f64,
    pub prompt_throughput: f64,
}

/// Observability side effects of a batch. They never alter control flow.
#[derive(Debug, Clone, PartialEq)]
pub enum Diagnostic {
    NoValidTtft {
        concurrency: usize,
    },
    PartialFailure {
        concurrency: usize,
        succeeded: usize,
        failed: usize,
    },
    MajorityFailed {
        concurrency: usize,
    },
    InvalidDenominator {
        metric: RateMetric,
        denominator: f64,
    },
}

impl Diagnostic {
    pub fn emit(&self) {
        log::warn!("{}", self);
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Diagnostic::NoValidTtft { concurrency } => write!(
                f,
                "No valid TTFT measurements for concurrency {}",
                concurrency
            ),
            Diagnostic::PartialFailure {
                concurrency,
                succeeded,
                failed,
            } => write!(
                f,
                "Concurrency {}: {} successful, {} failed requests",
                concurrency, succeeded, failed
            ),
            Diagnostic::MajorityFailed { concurrency } => write!(
                f,
                "More than 50% requests failed for concurrency {}",
                concurrency
            ),
            Diagnostic::InvalidDenominator {
                metric,
                denominator,
            } => write!(
                f,
                "Latency-corrected time for {} is {:.4}s, reporting 0",
                metric, denominator
            ),
        }
    }
}

pub fn ttft_diagnostic(summary: &TtftSummary, concurrency: usize) -> Option<Diagnostic> {
    summary
        .is_empty()
        .then_some(Diagnostic::NoValidTtft { concurrency })
}

/// Success/failure counts when anything failed, plus a warning once
/// failures are strictly more than half of the batch.
pub fn failure_diagnostics(succeeded: usize, failed: usize) -> Vec<Diagnostic> {
    let concurrency = succeeded + failed;
    let mut diagnostics = Vec::new();
    if failed > 0 {
        diagnostics.push(Diagnostic::PartialFailure {
            concurrency,
            succeeded,
            failed,
        });
        if failed * 2 > concurrency {
            diagnostics.push(Diagnostic::MajorityFailed { concurrency });
        }
    }
    diagnostics
}

/// Generation speed from total completion tokens over the batch duration;
/// prompt throughput from total prompt tokens over the slowest TTFT.
///
/// A metric whose corrected denominator is zero, negative or non-finite is
/// reported as 0.0 together with a diagnostic.
pub fn derive_throughput(
    totals: TokenUsage,
    duration: Duration,
    ttft: &TtftSummary,
    correction: LatencyCorrection,
) -> (ThroughputSummary, Vec<Diagnostic>) {
    let mut diagnostics = Vec::new();
    let mut rate_or_zero = |metric, tokens, seconds| match token_rate(tokens, seconds, correction) {
        Ok(rate) => rate,
        Err(denominator) => {
            diagnostics.push(Diagnostic::InvalidDenominator {
                metric,
                denominator,
            });
            0.0
        }
    };

    let generation_speed = rate_or_zero(
        RateMetric::GenerationSpeed,
        totals.completion_tokens,
        duration.as_secs_f64(),
    );
    let prompt_throughput = if ttft.is_empty() {
        0.0
    } else {
        rate_or_zero(RateMetric::PromptThroughput, totals.prompt_tokens, ttft.max)
    };

    (
        ThroughputSummary {
            generation_speed,
            prompt_throughput,
        },
        diagnostics,
    )
}
