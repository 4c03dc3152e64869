// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// ippproxy — registers a local output device with an infrastructure
// printer and relays its jobs to a local command.

use clap::Parser;
use hyper::Uri;
use inftprint_proxy::agent::{self, AgentConfig};

#[derive(Parser)]
#[command(name = "ippproxy")]
#[command(about = "Proxy agent for an IPP infrastructure printer")]
struct Cli {
    /// URI of the infrastructure printer to register with.
    printer_uri: String,

    /// Local command to run against each fetched document.
    #[arg(short = 'c', long = "command")]
    command: Option<String>,

    /// Local device URI advertised to the infrastructure printer.
    #[arg(short = 'd', long = "device-uri")]
    device_uri: Option<String>,

    /// Authentication username.
    #[arg(short = 'u', long = "user")]
    user: Option<String>,

    /// Authentication password (also read from `IPPPROXY_PASSWORD`).
    #[arg(short = 'p', long = "password")]
    password: Option<String>,
}

fn init_logging() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> std::process::ExitCode {
    let cli = Cli::parse();
    init_logging();

    let printer_uri: Uri = match cli.printer_uri.parse() {
        Ok(uri) => uri,
        Err(err) => {
            eprintln!("invalid infrastructure printer URI {}: {err}", cli.printer_uri);
            return std::process::ExitCode::FAILURE;
        }
    };

    let password = cli.password.or_else(|| std::env::var("IPPPROXY_PASSWORD").ok());
    let device_uri = agent::resolve_device_uri(cli.device_uri.as_deref());

    let config = AgentConfig {
        printer_uri,
        local_command: cli.command,
        device_uri,
        username: cli.user,
        password,
    };

    match agent::run(config).await {
        Ok(()) => std::process::ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("ippproxy: {err}");
            std::process::ExitCode::FAILURE
        }
    }
}
