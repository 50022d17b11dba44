use std::process::ExitCode;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use fanout::{Config, Dispatcher, FanoutError};

/// `RUST_LOG` wins; otherwise `-v` raises the level one step at a time.
fn init_logging(verbosity: u8) {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        match verbosity {
            0 => EnvFilter::new("fanout=warn"),
            1 => EnvFilter::new("fanout=info"),
            2 => EnvFilter::new("fanout=debug"),
            _ => EnvFilter::new("fanout=trace,openssh=debug"),
        }
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(true)
        .init();
}

async fn run(cli: &Config) -> Result<i32, FanoutError> {
    let hosts = cli.targets()?;
    let dispatcher = Dispatcher::new(cli.options()?, cli.registry()?);
    tracing::info!(hosts = hosts.len(), fanout = cli.fanout, "dispatching");
    let report = dispatcher.run(hosts, cli.payload()).await?;
    Ok(report.exit_code())
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Config::parse();
    init_logging(cli.verbose);

    match run(&cli).await {
        Ok(code) => ExitCode::from(code.clamp(0, 255) as u8),
        Err(FanoutError::Aborted(reason)) => {
            eprintln!("fanout: aborting: {}", reason);
            ExitCode::FAILURE
        }
        Err(e) => {
            eprintln!("fanout: {}", e);
            ExitCode::FAILURE
        }
    }
}
