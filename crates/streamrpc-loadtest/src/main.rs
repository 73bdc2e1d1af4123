//! stream-loadtest: 2 つの Broker 間でデータを流して検証する

use std::process::ExitCode;

use clap::Parser;
use streamrpc_loadtest::{run, LoadConfig};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "stream-loadtest", about = "Integration load test for the streamrpc stream engine")]
struct Cli {
    #[command(flatten)]
    load: LoadConfig,

    /// パケット単位のログを出す（RUST_LOG が優先）
    #[arg(long)]
    verbose: bool,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = &cli.load;
    println!("Starting stream load test");
    println!("  Data size:   {} bytes", config.size);
    println!("  Delay:       {} ms, skew: {} ms", config.delay_ms, config.skew_ms);
    println!("  Window size: {}", config.window_size);
    if config.slow_reader > 0 {
        println!("  Slow reader: {} bytes/sec", config.slow_reader);
    }

    match run(config) {
        Ok(report) => {
            print!("{}", report);
            println!("TEST PASSED");
            ExitCode::SUCCESS
        }
        Err(e) => {
            tracing::error!(error = %e, "load test failed");
            eprintln!("TEST FAILED: {}", e);
            ExitCode::FAILURE
        }
    }
}
