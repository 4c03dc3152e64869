// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// infrprintd — the Infrastructure Printer daemon. Loads configuration,
// materializes the configured printers, and serves IPP over HTTP/1.1.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use inftprint_core::config::ServerConfig;
use inftprint_core::model::{Printer, PrinterId};
use inftprint_security::AuditLog;
use inftprint_server::store::Store;
use inftprint_server::{http, Context};
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "infrprintd")]
#[command(about = "IPP Infrastructure Printer daemon")]
struct Cli {
    /// Path to the server's TOML configuration file.
    #[arg(short, long, default_value = "/etc/inftprint/infrprintd.toml")]
    config: PathBuf,

    /// Override `listen_address` from the config file.
    #[arg(short, long)]
    listen_address: Option<String>,
}

fn init_logging(config: &ServerConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.log_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn materialize_printers(store: &Store, config: &ServerConfig) {
    for printer_config in &config.printers {
        let id: PrinterId = store.allocate_printer_id();
        let uuid = format!("urn:uuid:printer-{}", id.0);
        let mut printer = Printer::new(id, printer_config.name.clone(), printer_config.resource_path.clone(), uuid);
        printer.local_command = printer_config.local_command.clone();
        printer.proxy_mode = printer_config.proxy_mode;
        info!(name = %printer_config.name, path = %printer_config.resource_path, "materialized printer");
        store.insert_printer(printer).await;
    }
}

#[tokio::main]
async fn main() -> std::process::ExitCode {
    let cli = Cli::parse();

    let config_text = match std::fs::read_to_string(&cli.config) {
        Ok(text) => text,
        Err(err) => {
            eprintln!("failed to read {}: {err}", cli.config.display());
            return std::process::ExitCode::FAILURE;
        }
    };
    let mut config = match ServerConfig::from_toml_str(&config_text) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("failed to parse {}: {err}", cli.config.display());
            return std::process::ExitCode::FAILURE;
        }
    };
    if let Some(addr) = cli.listen_address {
        config.listen_address = addr;
    }

    init_logging(&config);

    let addr = match config.listen_address.parse() {
        Ok(addr) => addr,
        Err(err) => {
            error!(address = %config.listen_address, error = %err, "invalid listen address");
            return std::process::ExitCode::FAILURE;
        }
    };

    if let Err(err) = std::fs::create_dir_all(&config.spool_directory) {
        error!(dir = %config.spool_directory.display(), error = %err, "failed to create spool directory");
        return std::process::ExitCode::FAILURE;
    }
    let audit_path = config.spool_directory.join("audit.db");
    let audit = match AuditLog::open(&audit_path) {
        Ok(audit) => audit,
        Err(err) => {
            error!(path = %audit_path.display(), error = %err, "failed to open audit log");
            return std::process::ExitCode::FAILURE;
        }
    };

    let store = Store::new();
    materialize_printers(&store, &config).await;

    let ctx = Context { store, config: Arc::new(config), audit: Arc::new(audit) };

    tokio::select! {
        result = http::serve(addr, ctx) => {
            if let Err(err) = result {
                error!(error = %err, "server exited");
                return std::process::ExitCode::FAILURE;
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("received interrupt, shutting down");
        }
    }

    std::process::ExitCode::SUCCESS
}
