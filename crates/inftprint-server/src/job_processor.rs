// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Job Processor — the per-job worker `CheckJobs` hands a dispatched job to.
// Runs the printer's configured transform path (a local command, a proxy
// hand-off, or a bare simulated delay), then finalizes the job and re-enters
// the scheduler.

use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use inftprint_core::config::ServerConfig;
use inftprint_core::model::{Job, JobId, JobState, PrinterId, PrinterState};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tracing::{debug, instrument, warn};

use crate::events::{self, event_mask, Scope};
use crate::lifecycle;
use crate::store::Store;

fn now_epoch() -> i64 {
    chrono::Utc::now().timestamp()
}

/// Run `CheckJobs` and, if it dispatches a job, spawn a detached worker for
/// it. Called everywhere a handler would otherwise discard `CheckJobs`'s
/// result: job admission, printer resume/startup, and a job's own
/// finalization re-entering the scheduler for the next one.
pub async fn check_and_dispatch(store: &Store, config: &Arc<ServerConfig>, printer_id: PrinterId) {
    if let Ok(Some(job_id)) = lifecycle::check_jobs(store, printer_id, now_epoch()).await {
        spawn(store.clone(), config.clone(), printer_id, job_id);
    }
}

/// Detach a worker for a job `CheckJobs` has just marked `processing`. The
/// caller never awaits this; it races independently, the way a per-job
/// thread would.
pub fn spawn(store: Store, config: Arc<ServerConfig>, printer_id: PrinterId, job_id: JobId) {
    tokio::spawn(async move {
        run_job(store, config, printer_id, job_id).await;
    });
}

enum TransformPath {
    LocalCommand(String),
    Proxy,
    Simulated,
}

#[instrument(skip(store, config))]
async fn run_job(store: Store, config: Arc<ServerConfig>, printer_id: PrinterId, job_id: JobId) {
    let Ok(record) = store.printer_by_id(printer_id).await else { return };
    let path = {
        let guard = record.read().await;
        if guard.printer.proxy_mode {
            TransformPath::Proxy
        } else if let Some(cmd) = guard.printer.local_command.clone() {
            TransformPath::LocalCommand(cmd)
        } else {
            TransformPath::Simulated
        }
    };

    match path {
        TransformPath::Proxy => {
            hand_off_to_proxy(&store, &config, printer_id, job_id).await;
            return;
        }
        TransformPath::LocalCommand(cmd) => {
            let job = record.read().await.jobs.get(&job_id).cloned();
            let Some(job) = job else { return };
            if let Err(e) = run_local_command(&store, printer_id, job_id, &cmd, &job, &config).await {
                warn!(printer = printer_id.0, job = job_id.0, error = %e, "job transform command failed");
            }
        }
        TransformPath::Simulated => {
            tokio::time::sleep(simulated_duration(job_id)).await;
        }
    }

    finish_job(&store, &config, printer_id, job_id).await;
}

/// 1–4 simulated seconds, varied per job so concurrent simulated jobs on a
/// printer don't all land at once.
fn simulated_duration(job_id: JobId) -> Duration {
    Duration::from_secs(1 + (job_id.0.unsigned_abs() as u64 % 4))
}

/// Path 2: hand the job to a registered output device instead of running a
/// local command. `processing_job` is cleared immediately so the printer can
/// pick up its next pending job while this one waits on a proxy.
async fn hand_off_to_proxy(store: &Store, config: &Arc<ServerConfig>, printer_id: PrinterId, job_id: JobId) {
    let Ok(record) = store.printer_by_id(printer_id).await else { return };
    {
        let mut guard = record.write().await;
        if let Some(job) = guard.jobs.get_mut(&job_id) {
            job.state_reasons.insert("job-fetchable".to_string());
            let _ = lifecycle::transition_job(job, JobState::Stopped);
        }
        guard.printer.processing_job = None;
        if guard.printer.state == PrinterState::Processing {
            guard.printer.state = PrinterState::Idle;
        }
    }
    lifecycle::notify_job_state_changed(store, printer_id, job_id, "job-fetchable").await;
    events::publish(store, event_mask::JOB_FETCHABLE, Scope::Job(printer_id, job_id), "job-fetchable", "job-fetchable").await;
    check_and_dispatch(store, config, printer_id).await;
}

/// Path 1: spawn the printer's configured local command against the job's
/// spool file, with the job attributes and printer defaults the spec
/// requires in its environment, and parse its stderr for `STATE:`/`ATTR:`
/// control lines while it runs.
async fn run_local_command(store: &Store, printer_id: PrinterId, job_id: JobId, cmd: &str, job: &Job, config: &ServerConfig) -> Result<(), String> {
    let spool_filename = job.spool_filename.as_ref().ok_or_else(|| "job has no spooled document".to_string())?;
    let spool_path = config.spool_directory.join(printer_id.0.to_string()).join(spool_filename);

    let mut child = Command::new(cmd)
        .arg(&spool_path)
        .envs(job_environment(job, config))
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| format!("failed to spawn transform command: {e}"))?;

    if let Some(pid) = child.id() {
        store.register_transform_child(job_id, pid).await;
    }

    if let Some(stderr) = child.stderr.take() {
        let mut lines = BufReader::new(stderr).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            handle_stderr_line(store, printer_id, job_id, &line).await;
        }
    }

    let status = child.wait().await.map_err(|e| format!("failed to reap transform command: {e}"))?;
    store.clear_transform_child(job_id).await;

    if status.success() {
        return Ok(());
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if status.signal() == Some(libc::SIGTERM) {
            return Ok(());
        }
    }
    Err(format!("transform command exited with {status}"))
}

/// Environment a local transform command sees, per the attributes and
/// printer defaults this service tracks. Attributes the model doesn't carry
/// as named fields (finishings, media, sides, raster parameters) are left
/// for a future attribute-bag extension rather than fabricated here.
fn job_environment(job: &Job, config: &ServerConfig) -> Vec<(String, String)> {
    vec![
        ("CONTENT_TYPE".to_string(), job.format.clone()),
        ("DEVICE_URI".to_string(), job.device_uuid.clone().unwrap_or_default()),
        ("DOCUMENT_NAME".to_string(), job.spool_filename.clone().unwrap_or_default()),
        ("OUTPUT_TYPE".to_string(), job.format.clone()),
        ("SERVER_LOGLEVEL".to_string(), config.log_level.clone()),
        ("IPP_JOB_ID".to_string(), job.id.0.to_string()),
        ("IPP_JOB_PRIORITY".to_string(), job.priority.to_string()),
        ("IPP_JOB_ORIGINATING_USER_NAME".to_string(), job.originating_user.clone()),
        ("IPP_DOCUMENT_FORMAT".to_string(), job.format.clone()),
    ]
}

enum StateOp {
    Add,
    Remove,
    Replace,
}

fn strip_reason_suffix(keyword: &str) -> &str {
    for suffix in ["-report", "-warning", "-error"] {
        if let Some(stripped) = keyword.strip_suffix(suffix) {
            return stripped;
        }
    }
    keyword
}

fn parse_state_line(line: &str) -> Option<(StateOp, Vec<String>)> {
    let rest = line.strip_prefix("STATE:")?.trim();
    let (op, rest) = match rest.strip_prefix('+') {
        Some(r) => (StateOp::Add, r),
        None => match rest.strip_prefix('-') {
            Some(r) => (StateOp::Remove, r),
            None => (StateOp::Replace, rest),
        },
    };
    let keywords = rest.split(',').map(str::trim).filter(|k| !k.is_empty()).map(strip_reason_suffix).map(String::from).collect();
    Some((op, keywords))
}

fn parse_attr_line(line: &str) -> Option<Vec<(String, String)>> {
    let rest = line.strip_prefix("ATTR:")?.trim();
    Some(rest.split_whitespace().filter_map(|pair| pair.split_once('=')).map(|(k, v)| (k.to_string(), v.to_string())).collect())
}

async fn handle_stderr_line(store: &Store, printer_id: PrinterId, job_id: JobId, line: &str) {
    if let Some((op, keywords)) = parse_state_line(line) {
        if let Ok(record) = store.printer_by_id(printer_id).await {
            let mut guard = record.write().await;
            match op {
                StateOp::Add => {
                    guard.printer.state_reasons.extend(keywords);
                }
                StateOp::Remove => {
                    for k in &keywords {
                        guard.printer.state_reasons.remove(k);
                    }
                }
                StateOp::Replace => {
                    guard.printer.state_reasons = keywords.into_iter().collect();
                }
            }
        }
        return;
    }

    if let Some(pairs) = parse_attr_line(line) {
        if let Ok(record) = store.printer_by_id(printer_id).await {
            let mut guard = record.write().await;
            if let Some(job) = guard.jobs.get_mut(&job_id) {
                for (name, value) in &pairs {
                    match name.as_str() {
                        "impressions" => {
                            if let Ok(n) = value.parse() {
                                job.impressions = Some(n);
                            }
                        }
                        "impressions-completed" => {
                            if let Ok(n) = value.parse() {
                                job.impressions_completed = n;
                            }
                        }
                        _ => debug!(printer = printer_id.0, job = job_id.0, attr = %name, value = %value, "unhandled ATTR from transform command"),
                    }
                }
            }
        }
        return;
    }

    debug!(printer = printer_id.0, job = job_id.0, line, "transform command stderr");
}

/// Finalize a job once its transform path has run (or a device has
/// reported it complete): observes `cancel_requested` to decide between
/// `canceled` and `completed`, retires it from the active-jobs index,
/// resolves any deferred printer transition, and re-enters the scheduler.
///
/// Only the job whose transform actually ran is allowed to clear the
/// printer's `processing_job`/advance it to `Idle` — mirrors the guard
/// `apply_transition` already applies in handlers/job.rs for cancel/abort.
/// Without it, a job that was handed off to a proxy (which clears
/// `processing_job` and re-enters the scheduler immediately) would, on
/// finishing later, stomp on whatever job the scheduler picked up next.
pub async fn finish_job(store: &Store, config: &Arc<ServerConfig>, printer_id: PrinterId, job_id: JobId) {
    let Ok(record) = store.printer_by_id(printer_id).await else { return };
    let outcome = {
        let mut guard = record.write().await;
        let Some(job) = guard.jobs.get_mut(&job_id) else { return };
        let next = if job.cancel_requested { JobState::Canceled } else { JobState::Completed };
        let _ = lifecycle::transition_job(job, next);
        if next == JobState::Completed {
            job.completed_at = Some(now_epoch());
        }

        let bound = config.max_completed_jobs_per_printer;
        lifecycle::retire_job(&mut guard.printer, &mut guard.jobs, job_id, bound);

        if guard.printer.processing_job == Some(job_id) {
            guard.printer.processing_job = None;
            if guard.printer.state_reasons.remove("moving-to-paused") {
                guard.printer.state = PrinterState::Stopped;
                guard.printer.state_reasons.insert("paused".to_string());
            } else if !guard.printer.is_deleted {
                guard.printer.state = PrinterState::Idle;
            }
            guard.printer.state_reasons.remove("printer-restarted");
        }

        (next, guard.printer.is_deleted)
    };
    let (final_state, deleting) = outcome;

    let (text, event, name) = if final_state == JobState::Canceled {
        ("canceled", event_mask::JOB_STOPPED, "job-stopped")
    } else {
        ("completed", event_mask::JOB_COMPLETED, "job-completed")
    };
    lifecycle::notify_job_state_changed(store, printer_id, job_id, text).await;
    events::publish(store, event, Scope::Job(printer_id, job_id), name, text).await;

    if deleting {
        let _ = lifecycle::delete_printer(store, printer_id).await;
    } else {
        check_and_dispatch(store, config, printer_id).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_state_line_plus_strips_report_suffix() {
        let (op, keywords) = parse_state_line("STATE: +media-empty-warning,cover-open").unwrap();
        assert!(matches!(op, StateOp::Add));
        assert_eq!(keywords, vec!["media-empty", "cover-open"]);
    }

    #[test]
    fn parse_state_line_minus_is_remove() {
        let (op, keywords) = parse_state_line("STATE: -paused").unwrap();
        assert!(matches!(op, StateOp::Remove));
        assert_eq!(keywords, vec!["paused"]);
    }

    #[test]
    fn parse_state_line_bare_is_replace() {
        let (op, _) = parse_state_line("STATE: idle").unwrap();
        assert!(matches!(op, StateOp::Replace));
    }

    #[test]
    fn parse_attr_line_splits_name_value_pairs() {
        let pairs = parse_attr_line("ATTR: impressions-completed=3 marker-levels=80").unwrap();
        assert_eq!(pairs, vec![("impressions-completed".to_string(), "3".to_string()), ("marker-levels".to_string(), "80".to_string())]);
    }

    #[test]
    fn non_control_line_is_not_state_or_attr() {
        assert!(parse_state_line("just a log line").is_none());
        assert!(parse_attr_line("just a log line").is_none());
    }

    #[test]
    fn simulated_duration_is_bounded() {
        let d = simulated_duration(JobId(7));
        assert!(d.as_secs() >= 1 && d.as_secs() <= 4);
    }

    #[tokio::test]
    async fn finish_job_marks_completed_and_retires() {
        let store = Store::new();
        let printer_id = store.allocate_printer_id();
        let record = store
            .insert_printer(inftprint_core::model::Printer::new(printer_id, "p1", "/ipp/print/p1", "urn:uuid:p1"))
            .await;
        let job_id = JobId(1);
        {
            let mut guard = record.write().await;
            let mut job = sample_job(job_id, printer_id);
            job.state = JobState::Processing;
            guard.printer.active_jobs.push(job_id);
            guard.printer.jobs.push(job_id);
            guard.printer.processing_job = Some(job_id);
            guard.printer.state = PrinterState::Processing;
            guard.jobs.insert(job_id, job);
        }

        let config = Arc::new(ServerConfig::default());
        finish_job(&store, &config, printer_id, job_id).await;

        let guard = record.read().await;
        assert_eq!(guard.jobs[&job_id].state, JobState::Completed);
        assert_eq!(guard.printer.state, PrinterState::Idle);
        assert!(guard.printer.processing_job.is_none());
        assert!(guard.printer.completed_jobs.contains(&job_id));
    }

    #[tokio::test]
    async fn finish_job_does_not_clobber_a_job_the_scheduler_already_moved_past() {
        // job_a was handed off to a proxy, which cleared `processing_job` and
        // let the scheduler pick up job_b. job_a's late completion report
        // must not touch job_b's tracking or the printer's state.
        let store = Store::new();
        let printer_id = store.allocate_printer_id();
        let record = store
            .insert_printer(inftprint_core::model::Printer::new(printer_id, "p1", "/ipp/print/p1", "urn:uuid:p1"))
            .await;
        let job_a = JobId(1);
        let job_b = JobId(2);
        {
            let mut guard = record.write().await;
            let mut a = sample_job(job_a, printer_id);
            a.state = JobState::Processing;
            let mut b = sample_job(job_b, printer_id);
            b.state = JobState::Processing;
            guard.printer.active_jobs.push(job_a);
            guard.printer.active_jobs.push(job_b);
            guard.printer.jobs.push(job_a);
            guard.printer.jobs.push(job_b);
            guard.printer.processing_job = Some(job_b);
            guard.printer.state = PrinterState::Processing;
            guard.jobs.insert(job_a, a);
            guard.jobs.insert(job_b, b);
        }

        let config = Arc::new(ServerConfig::default());
        finish_job(&store, &config, printer_id, job_a).await;

        let guard = record.read().await;
        assert_eq!(guard.jobs[&job_a].state, JobState::Completed);
        assert_eq!(guard.jobs[&job_b].state, JobState::Processing);
        assert_eq!(guard.printer.processing_job, Some(job_b));
        assert_eq!(guard.printer.state, PrinterState::Processing);
    }

    fn sample_job(id: JobId, printer_id: PrinterId) -> Job {
        Job {
            id,
            printer_id,
            uuid: "urn:uuid:job".into(),
            originating_user: "alice".into(),
            format: "application/pdf".into(),
            priority: 50,
            hold_until: inftprint_core::model::HoldUntil::At(0),
            state: JobState::Pending,
            state_reasons: Default::default(),
            impressions: None,
            impressions_completed: 0,
            device_uuid: None,
            device_state: None,
            device_state_reasons: Default::default(),
            spool_filename: None,
            spool_sha256: None,
            cancel_requested: false,
            created_at: 0,
            processing_at: None,
            completed_at: None,
        }
    }
}
