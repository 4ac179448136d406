use log::{debug, info, warn};
use std::future::Future;
use std::time::{Duration, Instant};

use crate::client::list_models;

pub const LATENCY_PROBE_ATTEMPTS: usize = 3;

/// Network latency estimate for the endpoint, in milliseconds.
///
/// Times a few sequential `GET /models` round trips and keeps the fastest.
/// Returns 0 with a warning when none of them succeed.
pub async fn probe_network_latency(base_url: &str, api_key: Option<&str>, timeout: Duration) -> f64 {
    let latency = fastest_round_trip(LATENCY_PROBE_ATTEMPTS, move || async move {
        list_models(base_url, api_key, timeout).await.map(|_| ())
    })
    .await;

    match latency {
        Some(rtt) => {
            let ms = rtt.as_secs_f64() * 1000.0;
            info!("Measured network latency to {}: {:.2}ms", base_url, ms);
            ms
        }
        None => {
            warn!("Could not measure network latency to {}, assuming 0ms", base_url);
            0.0
        }
    }
}

async fn fastest_round_trip<F, Fut>(attempts: usize, mut request: F) -> Option<Duration>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = anyhow::Result<()>>,
{
    let mut fastest: Option<Duration> = None;
    for attempt in 1..=attempts {
        let start = Instant::now();
        match request().await {
            Ok(()) => {
                let elapsed = start.elapsed();
                debug!("Latency probe {}: {:?}", attempt, elapsed);
                fastest = Some(fastest.map_or(elapsed, |f| f.min(elapsed)));
            }
            Err(e) => debug!("Latency probe {} failed: {}", attempt, e),
        }
    }
    fastest
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_fastest_round_trip_skips_failures() {
        let calls = AtomicUsize::new(0);
        let fastest = fastest_round_trip(3, || {
            let call = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if call == 1 {
                    anyhow::bail!("refused");
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
                Ok(())
            }
        })
        .await;

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert!(fastest.is_some());
    }

    #[tokio::test]
    async fn test_all_failures_give_none() {
        let fastest = fastest_round_trip(2, || async { Err::<(), _>(anyhow::anyhow!("down")) }).await;
        assert!(fastest.is_none());
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_reports_zero() {
        let ms = probe_network_latency("http://127.0.0.1:9/v1", None, Duration::from_millis(200)).await;
        assert_eq!(ms, 0.0);
    }
}
