//! Verification client binary.
//!
//! Usage:
//!   cargo run -p voxel_client -- [--url ws://127.0.0.1:8081] [--name Verifier] [--timeout-secs 5]
//!
//! Authenticates, fetches chunk (0, 0) and exits with status 0 on success or
//! 1 on any failure.

use std::env;
use std::process::ExitCode;
use std::time::Duration;

use tracing::{error, info};
use voxel_client::client::{verify, DEFAULT_TIMEOUT};

struct Args {
    url: String,
    name: String,
    timeout: Duration,
}

fn parse_args() -> Args {
    let mut out = Args {
        url: env::var("WS_URL").unwrap_or_else(|_| "ws://127.0.0.1:8081".to_string()),
        name: "Verifier".to_string(),
        timeout: DEFAULT_TIMEOUT,
    };
    let args: Vec<String> = env::args().collect();
    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--url" if i + 1 < args.len() => {
                out.url = args[i + 1].clone();
                i += 2;
            }
            "--name" if i + 1 < args.len() => {
                out.name = args[i + 1].clone();
                i += 2;
            }
            "--timeout-secs" if i + 1 < args.len() => {
                out.timeout = args[i + 1]
                    .parse()
                    .map(Duration::from_secs)
                    .unwrap_or(DEFAULT_TIMEOUT);
                i += 2;
            }
            _ => i += 1,
        }
    }
    out
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args = parse_args();
    info!(url = %args.url, "Starting verification");

    match verify(&args.url, &args.name, args.timeout).await {
        Ok(report) => {
            info!(
                player_id = %report.player_id,
                chunk = %report.chunk,
                solid = report.solid_voxels,
                "Verification passed"
            );
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(error = %format!("{e:#}"), "Verification failed");
            ExitCode::FAILURE
        }
    }
}
