use anyhow::Result;
use llm_speed_bench::{Cli, Config};
use log::{LevelFilter, Metadata, Record, info};
use ringlog::{Drain, LogBuilder, MultiLogBuilder, Output, Stderr};
use std::collections::HashMap;
use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

const LOG_FLUSH_INTERVAL: Duration = Duration::from_millis(100);

/// Parse log filter strings like "hyper=info" into a map of module prefix to level filter
fn parse_log_filters(filters: &[String]) -> HashMap<String, LevelFilter> {
    let mut map = HashMap::new();
    for filter in filters {
        if let Some((module, level)) = filter.split_once('=') {
            let level_filter = match level.to_lowercase().as_str() {
                "error" => LevelFilter::Error,
                "warn" => LevelFilter::Warn,
                "info" => LevelFilter::Info,
                "debug" => LevelFilter::Debug,
                "trace" => LevelFilter::Trace,
                "off" => LevelFilter::Off,
                _ => continue,
            };
            map.insert(module.to_string(), level_filter);
        }
    }
    map
}

fn should_log(metadata: &Metadata, filters: &HashMap<String, LevelFilter>) -> bool {
    let target = metadata.target();
    for (module_prefix, level_filter) in filters {
        if target.starts_with(module_prefix) {
            return metadata.level() <= *level_filter;
        }
    }
    true
}

/// Per-module filtering logger over a ringlog output
struct FilteredLogger {
    output: Mutex<Box<dyn Output>>,
    max_level: LevelFilter,
    filters: HashMap<String, LevelFilter>,
}

impl log::Log for FilteredLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.max_level && should_log(metadata, &self.filters)
    }

    fn log(&self, record: &Record) {
        if self.enabled(record.metadata()) {
            if let Ok(mut output) = self.output.lock() {
                let message = format!("{} {}\n", record.level(), record.args());
                let _ = output.write_all(message.as_bytes());
            }
        }
    }

    fn flush(&self) {
        if let Ok(mut output) = self.output.lock() {
            let _ = output.flush();
        }
    }
}

/// Background thread that periodically flushes the ringlog drain and does a
/// final flush on shutdown.
struct LogFlusher {
    worker: Option<(Arc<AtomicBool>, JoinHandle<()>)>,
}

impl LogFlusher {
    fn spawn<F>(mut flush: F, interval: Duration) -> Self
    where
        F: FnMut() + Send + 'static,
    {
        let stop = Arc::new(AtomicBool::new(false));
        let stopping = Arc::clone(&stop);
        let handle = std::thread::spawn(move || {
            loop {
                let last = stopping.load(Ordering::Acquire);
                flush();
                if last {
                    break;
                }
                std::thread::park_timeout(interval);
            }
        });
        Self {
            worker: Some((stop, handle)),
        }
    }

    fn direct() -> Self {
        Self { worker: None }
    }

    fn shutdown(self) {
        if let Some((stop, handle)) = self.worker {
            stop.store(true, Ordering::Release);
            handle.thread().unpark();
            let _ = handle.join();
        }
        log::logger().flush();
    }
}

fn init_logging(config: &Config) -> Result<LogFlusher> {
    let log_level = config.log.level.to_level_filter();
    let output: Box<dyn Output> = Box::new(Stderr::new());
    let filters = parse_log_filters(&config.log.filter);

    if filters.is_empty() {
        let base_log = LogBuilder::new()
            .output(output)
            .build()
            .map_err(|e| anyhow::anyhow!("failed to initialize logger: {}", e))?;

        let mut drain = MultiLogBuilder::new()
            .level_filter(log_level)
            .default(base_log)
            .build()
            .start();

        Ok(LogFlusher::spawn(
            move || {
                let _ = drain.flush();
            },
            LOG_FLUSH_INTERVAL,
        ))
    } else {
        let logger = FilteredLogger {
            output: Mutex::new(output),
            max_level: log_level,
            filters,
        };

        log::set_boxed_logger(Box::new(logger))?;
        log::set_max_level(log_level);
        Ok(LogFlusher::direct())
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse_args();

    let mut config = Config::load(&cli.config)?;
    if let Some(levels) = cli.concurrency {
        config.load.concurrency = levels;
        config.validate()?;
    }

    let flusher = init_logging(&config)?;

    if !config.output.quiet {
        println!("LLM Speed Benchmark");
        println!("   Config: {}", cli.config.display());
        println!("   Target: {}", config.endpoint.base_url);
        println!("   Input: {}", config.prompt_spec().describe());
        println!("   Concurrency: {:?}", config.load.concurrency);
        println!();
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(config.runtime.worker_threads)
        .enable_all()
        .build()?;

    let result = runtime.block_on(async {
        let runner = llm_speed_bench::BenchmarkRunner::new(config).await?;
        info!("Starting benchmark run");
        runner.run().await?;
        info!("Benchmark completed successfully");
        Ok::<(), anyhow::Error>(())
    });

    flusher.shutdown();
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_log_filters() {
        let filters = parse_log_filters(&[
            "hyper=warn".to_string(),
            "reqwest=OFF".to_string(),
            "bogus".to_string(),
            "h2=loud".to_string(),
        ]);
        assert_eq!(filters.len(), 2);
        assert_eq!(filters["hyper"], LevelFilter::Warn);
        assert_eq!(filters["reqwest"], LevelFilter::Off);
    }

    #[test]
    fn test_shutdown_flushes_messages_logged_late() {
        let pending = Arc::new(Mutex::new(Vec::new()));
        let flushed = Arc::new(Mutex::new(Vec::new()));

        let flusher = {
            let pending = Arc::clone(&pending);
            let flushed = Arc::clone(&flushed);
            LogFlusher::spawn(
                move || {
                    let mut pending = pending.lock().unwrap();
                    flushed.lock().unwrap().extend(pending.drain(..));
                },
                Duration::from_secs(3600),
            )
        };

        pending.lock().unwrap().push("More than 50% requests failed");
        flusher.shutdown();

        assert!(pending.lock().unwrap().is_empty());
        assert_eq!(*flushed.lock().unwrap(), vec!["More than 50% requests failed"]);
    }
}
