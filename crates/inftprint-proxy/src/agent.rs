// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// The proxy agent's run loop: derive a device identity, register with the
// infrastructure printer, then alternate between long-polling for
// notifications and running fetchable jobs through the configured local
// command, until a signal asks it to stop.

use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use hyper::Uri;
use inftprint_core::error::{InftError, Result};
use inftprint_security::identity::{device_uuid, null_device_uri};
use tokio::process::Command;
use tracing::{error, info, warn};

use crate::client::ProxyClient;
use crate::reconnect;

/// Everything the agent needs to run, gathered from CLI flags or a config
/// file before `run` is called.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub printer_uri: Uri,
    pub local_command: Option<String>,
    pub device_uri: String,
    pub username: Option<String>,
    pub password: Option<String>,
}

/// Drive one proxy session end-to-end. Returns `Ok(())` on a clean signal
/// shutdown, `Err` if registration never succeeded before a stop signal
/// arrived (the caller maps this to exit status 1).
pub async fn run(config: AgentConfig) -> Result<()> {
    let stop = Arc::new(AtomicBool::new(false));
    install_signal_handlers(stop.clone());

    let device_uuid = device_uuid(&config.device_uri);
    let device_name = device_display_name(&config.device_uri);
    info!(uuid = %device_uuid, uri = %config.device_uri, "derived device identity");

    let client = ProxyClient::new(config.printer_uri.clone(), config.username.as_deref(), config.password.as_deref());

    let registered = reconnect::until_connected(
        || async {
            client.update_output_device_attributes(&device_uuid, &device_name).await?;
            client.subscribe().await
        },
        &stop,
    )
    .await;

    let Some(subscription_id) = registered else {
        info!("stopped before registration completed");
        return Ok(());
    };
    info!(subscription_id, "registered with infrastructure printer");

    let mut since = 0;
    while !stop.load(Ordering::SeqCst) {
        let notifications = tokio::select! {
            result = client.get_notifications(subscription_id, since) => result,
            _ = wait_for_stop(&stop) => break,
        };

        let notifications = match notifications {
            Ok(events) => events,
            Err(err) => {
                warn!(error = %err, "get-notifications failed, will retry");
                tokio::time::sleep(reconnect::RETRY_INTERVAL).await;
                continue;
            }
        };

        for notification in &notifications {
            since = since.max(notification.sequence + 1);
            if notification.event != "job-fetchable" {
                continue;
            }
            let Some(job_id) = notification.job_id else {
                warn!(event = %notification.event, "job-fetchable notification carried no job id");
                continue;
            };
            if let Err(err) = process_job(&client, &config, &device_uuid, job_id).await {
                error!(job_id, error = %err, "failed to process fetched job");
            }
        }
    }

    info!("shutting down, deregistering");
    if let Err(err) = client.deregister(subscription_id).await {
        warn!(error = %err, "failed to deregister cleanly");
    }
    Ok(())
}

async fn wait_for_stop(stop: &AtomicBool) {
    while !stop.load(Ordering::SeqCst) {
        tokio::time::sleep(std::time::Duration::from_millis(200)).await;
    }
}

/// `Acknowledge-Job` → `Fetch-Job` → `Fetch-Document` → run the configured
/// local command → `Acknowledge-Document` → `Update-Job-Status`.
async fn process_job(client: &ProxyClient, config: &AgentConfig, device_uuid: &str, job_id: i32) -> Result<()> {
    let fetched = client.acknowledge_and_fetch_job(job_id, device_uuid).await?;
    let document = client.fetch_document(job_id).await?;
    client.acknowledge_document(job_id).await?;

    let impressions = match &config.local_command {
        Some(cmd) => run_local_command(cmd, &document, &fetched.format, config).await?,
        None => 1,
    };

    client.update_job_status(job_id, impressions, true).await?;
    Ok(())
}

/// Spawn the configured command with the fetched document on its stdin,
/// mirroring the environment the infrastructure printer's own transform
/// path sets for a job it runs locally.
async fn run_local_command(cmd: &str, document: &[u8], format: &str, config: &AgentConfig) -> Result<i32> {
    let mut child = Command::new(cmd)
        .env("CONTENT_TYPE", format)
        .env("DEVICE_URI", &config.device_uri)
        .env("OUTPUT_TYPE", format)
        .stdin(Stdio::piped())
        .stdout(Stdio::null())
        .stderr(Stdio::inherit())
        .spawn()
        .map_err(|e| InftError::ProxyConnection(format!("failed to spawn local command: {e}")))?;

    if let Some(mut stdin) = child.stdin.take() {
        use tokio::io::AsyncWriteExt;
        stdin
            .write_all(document)
            .await
            .map_err(|e| InftError::ProxyConnection(format!("failed to write document to local command: {e}")))?;
    }

    let status = child.wait().await.map_err(|e| InftError::ProxyConnection(format!("failed to reap local command: {e}")))?;
    if !status.success() {
        return Err(InftError::ProxyConnection(format!("local command exited with {status}")));
    }
    Ok(1)
}

fn device_display_name(device_uri: &str) -> String {
    if device_uri.is_empty() {
        "proxy".to_string()
    } else {
        device_uri.to_string()
    }
}

/// Resolve the device URI a proxy advertises: the configured one, or a
/// null device URI derived from the local hostname when none was given.
pub fn resolve_device_uri(configured: Option<&str>) -> String {
    match configured {
        Some(uri) if !uri.is_empty() => uri.to_string(),
        _ => {
            let host = hostname();
            null_device_uri(&host)
        }
    }
}

fn hostname() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string())
}

fn install_signal_handlers(stop: Arc<AtomicBool>) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        for kind in [SignalKind::hangup(), SignalKind::interrupt(), SignalKind::terminate()] {
            let stop = stop.clone();
            let Ok(mut stream) = signal(kind) else { continue };
            tokio::spawn(async move {
                stream.recv().await;
                info!("received stop signal");
                stop.store(true, Ordering::SeqCst);
            });
        }
    }
    #[cfg(not(unix))]
    {
        tokio::spawn(async move {
            let _ = tokio::signal::ctrl_c().await;
            stop.store(true, Ordering::SeqCst);
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_device_uri_uses_configured_value() {
        assert_eq!(resolve_device_uri(Some("usb://Example/Printer")), "usb://Example/Printer");
    }

    #[test]
    fn resolve_device_uri_falls_back_to_null_device() {
        let uri = resolve_device_uri(None);
        assert!(uri.starts_with("file://"));
        assert!(uri.ends_with("/dev/null"));
    }

    #[test]
    fn device_display_name_falls_back_when_empty() {
        assert_eq!(device_display_name(""), "proxy");
    }
}
