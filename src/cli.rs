use clap::Parser;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "llm-speed-bench")]
#[command(author, version, about = "Measure TTFT and token throughput of OpenAI-compatible chat endpoints", long_about = None)]
pub struct Cli {
    /// Path to the TOML configuration file
    pub config: PathBuf,

    /// Override the configured concurrency levels (e.g. --concurrency 1,8,32)
    #[arg(long, value_delimiter = ',')]
    pub concurrency: Option<Vec<usize>>,
}

impl Cli {
    pub fn parse_args() -> Self {
        Cli::parse()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_concurrency_override() {
        let cli = Cli::parse_from(["llm-speed-bench", "bench.toml", "--concurrency", "1,8,32"]);
        assert_eq!(cli.config, PathBuf::from("bench.toml"));
        assert_eq!(cli.concurrency, Some(vec![1, 8, 32]));
    }
}
