use anyhow::Result;
use log::{debug, info};
use std::sync::Arc;
use std::time::Duration;

use crate::client::{ClientConfig, OpenAIClient};
use crate::config::{Config, OutputFormat};
use crate::latency::probe_network_latency;
use crate::prompt::PromptSpec;
use crate::report::{LevelResult, ReportBuilder};
use crate::throughput::{SpeedMeasurement, ThroughputRunner};

/// Sweeps the configured concurrency levels against one endpoint.
///
/// Each level runs a TTFT probe followed by a throughput batch; levels run
/// one after another so they never compete for the server.
///
/// # Examples
///
/// ```no_run
/// use llm_speed_bench::{BenchmarkRunner, Config};
/// use std::path::Path;
///
/// #[tokio::main]
/// async fn main() -> anyhow::Result<()> {
///     let config = Config::load(Path::new("bench.toml"))?;
///     let runner = BenchmarkRunner::new(config).await?;
///     runner.run().await?;
///     Ok(())
/// }
/// ```
pub struct BenchmarkRunner {
    client: Arc<OpenAIClient>,
    config: Config,
    model: String,
    prompt: PromptSpec,
    network_latency_ms: f64,
}

impl BenchmarkRunner {
    /// Waits for the server if configured, resolves the model and the
    /// network latency estimate, and builds a pooled client.
    pub async fn new(mut config: Config) -> Result<Self> {
        let timeout = Duration::from_secs(config.endpoint.timeout);

        if config.endpoint.health_check_timeout > 0 {
            crate::client::check_server_ready(
                &config.endpoint.base_url,
                config.endpoint.api_key.as_deref(),
                Duration::from_secs(config.endpoint.health_check_timeout),
                Duration::from_secs(config.endpoint.health_check_interval),
            )
            .await?;
        }

        let model = if let Some(model) = config.endpoint.model.clone() {
            model
        } else {
            info!("Model not specified, querying server for available models");
            let detected = crate::client::detect_model(
                &config.endpoint.base_url,
                config.endpoint.api_key.as_deref(),
                timeout,
            )
            .await?;
            config.endpoint.model = Some(detected.clone());
            detected
        };

        let network_latency_ms = match config.load.network_latency_ms {
            Some(ms) => ms,
            None => {
                probe_network_latency(
                    &config.endpoint.base_url,
                    config.endpoint.api_key.as_deref(),
                    timeout,
                )
                .await
            }
        };

        let client = OpenAIClient::new(ClientConfig {
            base_url: config.endpoint.base_url.clone(),
            api_key: config.endpoint.api_key.clone(),
            model: model.clone(),
            timeout,
            pool_size: config.max_concurrency(),
        })?;

        let prompt = config.prompt_spec();
        debug!("Input: {}", prompt.describe());

        Ok(Self {
            client: Arc::new(client),
            config,
            model,
            prompt,
            network_latency_ms,
        })
    }

    pub async fn run(&self) -> Result<Vec<LevelResult>> {
        let mut report = ReportBuilder::new(
            &self.config.endpoint.base_url,
            &self.model,
            self.prompt.clone(),
            self.config.load.max_tokens,
            self.network_latency_ms,
        );

        let runner = ThroughputRunner::new(
            Arc::clone(&self.client),
            self.model.clone(),
            self.config.load.max_tokens,
            self.network_latency_ms,
        )
        .with_request_timeout(Duration::from_secs(self.config.load.request_timeout));

        for &concurrency in &self.config.load.concurrency {
            info!("Measuring concurrency {}", concurrency);
            let outcome = runner.run(&self.prompt, concurrency).await;
            report.record(LevelResult::from_outcome(concurrency, &outcome));
        }

        match self.config.output.format {
            OutputFormat::Console => {
                if !self.config.output.quiet {
                    report.print_console_report()?;
                }
            }
            OutputFormat::Json => println!("{}", report.to_json()?),
        }

        Ok(report.levels().to_vec())
    }
}

/// Measure one concurrency level against an endpoint.
///
/// `network_latency_ms` only corrects fixed-prompt runs; random input uses
/// raw timings. Zero in any returned field means no usable measurement.
pub async fn measure(
    base_url: &str,
    api_key: Option<&str>,
    model: &str,
    concurrency: usize,
    max_tokens: u32,
    prompt: &PromptSpec,
    network_latency_ms: f64,
) -> Result<SpeedMeasurement> {
    if concurrency == 0 {
        anyhow::bail!("concurrency must be greater than 0");
    }

    let client = OpenAIClient::new(ClientConfig {
        base_url: base_url.to_string(),
        api_key: api_key.map(str::to_string),
        model: model.to_string(),
        timeout: Duration::from_secs(120),
        pool_size: concurrency,
    })?;

    Ok(crate::throughput::run_throughput(
        Arc::new(client),
        model,
        prompt,
        concurrency,
        max_tokens,
        network_latency_ms,
    )
    .await)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_measure_rejects_zero_concurrency() {
        let err = measure("http://127.0.0.1:9/v1", None, "m", 0, 64, &PromptSpec::random(3), 0.0)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("concurrency"));
    }

    #[tokio::test]
    async fn test_measure_against_unreachable_endpoint_reports_sentinels() {
        let measurement = measure(
            "http://127.0.0.1:9/v1",
            None,
            "m",
            2,
            16,
            &PromptSpec::fixed("hi"),
            0.0,
        )
        .await
        .unwrap();
        assert_eq!(measurement.max_ttft, 0.0);
        assert_eq!(measurement.min_ttft, 0.0);
        assert_eq!(measurement.prompt_throughput, 0.0);
    }
}
