//! Standalone server binary.
//!
//! Usage:
//!   cargo run -p voxel_server -- [--config server.json] [--addr 0.0.0.0:8081]
//!       [--world world.json] [--seed 12345] [--tick-hz 10] [--worker <program> [-- <args>...]]
//!
//! Console commands:
//!   status  - Show server status
//!   save    - Write the world snapshot now
//!   quit    - Save and shut down

use std::env;
use std::io::{BufRead, Write};
use std::path::Path;

use anyhow::{bail, Context};
use tokio::sync::mpsc;
use tracing::{error, info};
use voxel_server::{worker::WorkerChannel, GameServer};
use voxel_shared::config::ServerConfig;

fn flag_value<'a>(args: &'a [String], i: usize) -> anyhow::Result<&'a str> {
    args.get(i + 1)
        .map(String::as_str)
        .with_context(|| format!("{} needs a value", args[i]))
}

/// Defaults, then `--config`, then environment, then the remaining flags.
fn parse_args(args: &[String]) -> anyhow::Result<ServerConfig> {
    let mut cfg = match args.iter().position(|a| a == "--config") {
        Some(i) => {
            let path = flag_value(args, i)?;
            ServerConfig::from_file(Path::new(path))?
        }
        None => ServerConfig::default(),
    };
    cfg.apply_env()?;

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--config" => {}
            "--addr" => cfg.ws_addr = flag_value(args, i)?.to_string(),
            "--world" => cfg.world_file = flag_value(args, i)?.into(),
            "--seed" => {
                let v = flag_value(args, i)?;
                cfg.world_seed = v.parse().with_context(|| format!("bad --seed {v}"))?;
            }
            "--tick-hz" => {
                let v = flag_value(args, i)?;
                cfg.tick_hz = match v.parse::<u32>() {
                    Ok(hz) if hz > 0 => hz,
                    _ => bail!("bad --tick-hz {v}"),
                };
            }
            "--worker" => {
                cfg.worker.program = flag_value(args, i)?.to_string();
                cfg.worker.args.clear();
            }
            "--" => {
                cfg.worker.args = args[i + 1..].to_vec();
                break;
            }
            other => bail!("unknown argument {other}"),
        }
        i += 2;
    }
    Ok(cfg)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();

    std::panic::set_hook(Box::new(|panic| {
        error!(%panic, "Server panicked");
    }));

    let args: Vec<String> = env::args().collect();
    let cfg = parse_args(&args)?;
    info!(
        addr = %cfg.ws_addr,
        world = %cfg.world_file.display(),
        seed = cfg.world_seed,
        tick_hz = cfg.tick_hz,
        "Starting server"
    );

    let worker = WorkerChannel::spawn(&cfg.worker);
    let mut server = GameServer::bind(cfg, worker)
        .await
        .context("create server")?;
    let local = server.local_addr()?;
    info!(%local, "Server listening");

    // Set up console input channel.
    let (console_tx, console_rx) = mpsc::channel::<String>(32);
    server.set_console_input(console_rx);

    // Spawn stdin reader thread.
    std::thread::spawn(move || {
        let stdin = std::io::stdin();
        let mut stdout = std::io::stdout();
        loop {
            print!("] ");
            let _ = stdout.flush();
            let mut line = String::new();
            match stdin.lock().read_line(&mut line) {
                Ok(0) | Err(_) => break,
                Ok(_) => {}
            }
            let line = line.trim().to_string();
            if !line.is_empty() && console_tx.blocking_send(line).is_err() {
                break;
            }
        }
    });

    println!("Server ready. Type 'status' for info, 'save' to snapshot, 'quit' to exit.");
    println!();

    server
        .run(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!(error = %e, "Failed to listen for Ctrl-C");
                std::future::pending::<()>().await;
            }
        })
        .await
}
