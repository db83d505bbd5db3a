//! Worker daemon entry point.
//!
//! Exit codes: 0 clean shutdown, 1 unrecoverable startup error,
//! 2 authentication failure.

use std::io::Write;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use secrecy::{ExposeSecret, SecretString};

use agentboard::worker::{ServerClient, WorkerConfig, WorkerRunner};

#[derive(Parser, Debug)]
#[command(
    name = "agentboard-worker",
    version,
    about = "Polls the agentboard server for tasks and executes them locally"
)]
struct Args {
    /// Server base URL.
    #[arg(long, default_value = "http://localhost:8000")]
    server: String,

    /// Username to authenticate as.
    #[arg(long)]
    user: Option<String>,

    /// Password. Prompted when required and not given here or via
    /// AGENTBOARD_PASSWORD.
    #[arg(long)]
    password: Option<String>,

    /// Poll interval in seconds.
    #[arg(long)]
    poll: Option<u64>,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let args = Args::parse();

    let mut config = WorkerConfig::from_env();
    config.server_url = args.server.clone();
    if let Some(poll) = args.poll {
        config.poll_interval = Duration::from_secs(poll);
    }

    eprintln!("agentboard worker v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Server: {}", config.server_url);

    let mut server = ServerClient::new(&config.server_url);

    // Token from the environment wins; otherwise log in with credentials.
    let token = match std::env::var("AGENTBOARD_TOKEN") {
        Ok(token) if !token.is_empty() => token,
        _ => {
            let username = match args.user.or_else(|| prompt("Username: ")) {
                Some(u) if !u.is_empty() => u,
                _ => {
                    eprintln!("Error: no username given");
                    return ExitCode::from(1);
                }
            };
            let password = SecretString::from(
                args.password
                    .or_else(|| std::env::var("AGENTBOARD_PASSWORD").ok())
                    .or_else(|| prompt("Password: "))
                    .unwrap_or_default(),
            );

            match server.login(&username, password.expose_secret()).await {
                Ok(token) => {
                    eprintln!("   Logged in as {username}");
                    token
                }
                Err(e) => {
                    eprintln!("Login failed: {e}");
                    return ExitCode::from(2);
                }
            }
        }
    };
    server.set_token(&token);

    let poll_interval = config.poll_interval;
    let runner = match WorkerRunner::register(config, Arc::new(server)).await {
        Ok(runner) => Arc::new(runner),
        Err(e) => {
            if e.status() == Some(401) || e.status() == Some(403) {
                eprintln!("Registration rejected: {e}");
                return ExitCode::from(2);
            }
            eprintln!("Registration failed: {e}");
            return ExitCode::from(1);
        }
    };

    eprintln!("   Worker id: {}", runner.worker_id());
    eprintln!("   Polling every {}s. Ctrl+C to stop.", poll_interval.as_secs());

    tokio::select! {
        _ = runner.run() => {}
        _ = shutdown_signal() => {
            runner.shutdown().await;
        }
    }

    ExitCode::SUCCESS
}

/// Resolve on SIGINT or SIGTERM.
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        let mut sigterm = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(s) => s,
            Err(_) => return tokio::signal::ctrl_c().await.unwrap_or(()),
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

fn prompt(label: &str) -> Option<String> {
    eprint!("{label}");
    std::io::stderr().flush().ok()?;
    let mut line = String::new();
    std::io::stdin().read_line(&mut line).ok()?;
    let line = line.trim().to_string();
    if line.is_empty() {
        None
    } else {
        Some(line)
    }
}
