// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Connection retry — classifies a failed attempt to reach the
// infrastructure printer and decides whether it is worth trying again.
// Unlike a print job's transform errors, a lost connection here is always
// transient from the proxy's point of view: there is no local user to
// surface a permanent failure to, so every classification retries on the
// same flat interval.

use std::time::Duration;

use inftprint_core::error::InftError;
use tracing::warn;

/// Fixed interval between connection attempts, per the proxy's registration
/// loop. The infrastructure printer side uses exponential backoff for its
/// own outbound calls; this agent does not, since a human is expected to be
/// watching its logs while it waits for its target to come up.
pub const RETRY_INTERVAL: Duration = Duration::from_secs(30);

/// What kind of failure a connection attempt hit, for logging purposes.
/// The decision to retry is the same regardless — this only shapes the
/// message the operator sees.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Transport,
    Protocol,
    Authorization,
}

pub fn classify_error(err: &InftError) -> ErrorClass {
    match err {
        InftError::ProxyConnection(_) => ErrorClass::Transport,
        InftError::AuthenticationRequired | InftError::Forbidden(_) | InftError::NotAuthorized(_) => ErrorClass::Authorization,
        _ => ErrorClass::Protocol,
    }
}

/// Run `attempt` until it succeeds or `stop` becomes true, sleeping
/// [`RETRY_INTERVAL`] between failures. Returns `None` if `stop` fired
/// before an attempt succeeded.
pub async fn until_connected<T, F, Fut>(mut attempt: F, stop: &std::sync::atomic::AtomicBool) -> Option<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, InftError>>,
{
    loop {
        if stop.load(std::sync::atomic::Ordering::SeqCst) {
            return None;
        }
        match attempt().await {
            Ok(value) => return Some(value),
            Err(err) => {
                let class = classify_error(&err);
                warn!(?class, error = %err, "could not reach infrastructure printer, retrying");
                tokio::select! {
                    _ = tokio::time::sleep(RETRY_INTERVAL) => {}
                    _ = wait_for_stop(stop) => return None,
                }
            }
        }
    }
}

async fn wait_for_stop(stop: &std::sync::atomic::AtomicBool) {
    while !stop.load(std::sync::atomic::Ordering::SeqCst) {
        tokio::time::sleep(Duration::from_millis(200)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_errors_classify_as_transport() {
        let err = InftError::ProxyConnection("connection refused".into());
        assert_eq!(classify_error(&err), ErrorClass::Transport);
    }

    #[test]
    fn auth_errors_classify_as_authorization() {
        let err = InftError::AuthenticationRequired;
        assert_eq!(classify_error(&err), ErrorClass::Authorization);
    }

    #[tokio::test]
    async fn until_connected_returns_first_success() {
        let stop = std::sync::atomic::AtomicBool::new(false);
        let mut calls = 0;
        let result = until_connected(
            || {
                calls += 1;
                async move { if calls < 2 { Err(InftError::ProxyConnection("not yet".into())) } else { Ok(42) } }
            },
            &stop,
        )
        .await;
        assert_eq!(result, Some(42));
    }

    #[tokio::test]
    async fn until_connected_stops_when_flag_set() {
        let stop = std::sync::atomic::AtomicBool::new(true);
        let result: Option<i32> = until_connected(|| async { Err(InftError::ProxyConnection("down".into())) }, &stop).await;
        assert_eq!(result, None);
    }
}
