// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Lifecycle Engine — the printer, job, subscription, and device state
// machines, and the `CheckJobs` scheduler that threads them together.

use std::collections::HashMap;

use chrono::{Datelike, Local, TimeZone, Timelike};
use inftprint_core::error::{InftError, Result};
use inftprint_core::model::{Job, JobId, JobState, Printer, PrinterId, PrinterState};
use tracing::{info, instrument};

use crate::events::{self, event_mask, Scope};
use crate::store::Store;

/// Resolve a `job-hold-until` keyword or absolute date-time (already parsed
/// to epoch seconds by the caller) into a concrete hold instant.
///
/// `now` and the shift boundaries are evaluated in local time, matching a
/// CUPS-style scheduler's "night shift" semantics.
pub fn resolve_hold_until(keyword: &str, now_epoch: i64) -> i64 {
    let now = Local
        .timestamp_opt(now_epoch, 0)
        .single()
        .unwrap_or_else(Local::now);

    match keyword {
        "no-hold" | "none" => 0,
        "indefinite" => -1,
        "evening" | "night" => next_local_hour(now, 18, |h| !(6..18).contains(&h)),
        "second-shift" => next_local_hour(now, 16, |h| h >= 16),
        "third-shift" => next_local_hour(now, 0, |h| h < 8),
        "weekend" => next_saturday_midnight(now),
        _ => 0,
    }
}

fn next_local_hour(now: chrono::DateTime<Local>, hour: u32, immediate_if: impl Fn(u32) -> bool) -> i64 {
    if immediate_if(now.hour()) {
        return now.timestamp();
    }
    let today_target = now.date_naive().and_hms_opt(hour, 0, 0).unwrap();
    let target = Local.from_local_datetime(&today_target).single().unwrap_or(now);
    if target <= now {
        (target + chrono::Duration::days(1)).timestamp()
    } else {
        target.timestamp()
    }
}

fn next_saturday_midnight(now: chrono::DateTime<Local>) -> i64 {
    use chrono::Weekday;
    let weekday = now.weekday();
    if matches!(weekday, Weekday::Sat | Weekday::Sun) {
        return now.timestamp();
    }
    let days_ahead = (Weekday::Sat.num_days_from_monday() as i64 - weekday.num_days_from_monday() as i64
        + 7)
        % 7;
    let days_ahead = if days_ahead == 0 { 7 } else { days_ahead };
    let midnight = now.date_naive().and_hms_opt(0, 0, 0).unwrap() + chrono::Duration::days(days_ahead);
    Local.from_local_datetime(&midnight).single().map(|d| d.timestamp()).unwrap_or(now.timestamp())
}

/// Transition a job to `next`, rejecting edges the state machine forbids.
/// Terminal-state no-ops (`Hold-Job; Hold-Job`, `Release-Job; Release-Job`
/// on a job already past that state) are rejected identically to a fresh
/// invalid transition, giving the idempotent-hold/release property for free.
pub fn transition_job(job: &mut Job, next: JobState) -> Result<()> {
    if job.state == next {
        return Ok(());
    }
    if !job.state.can_transition_to(next) {
        return Err(InftError::NotPossible(format!(
            "job cannot move from {:?} to {:?}",
            job.state, next
        )));
    }
    job.state = next;
    Ok(())
}

/// `CheckJobs`: scan a printer's active jobs, release any elapsed holds,
/// and if the printer is idle, hand the next runnable job to a worker.
///
/// Returns the job id the caller should spawn a worker for, if any.
#[instrument(skip(store))]
pub async fn check_jobs(store: &Store, printer_id: PrinterId, now: i64) -> Result<Option<JobId>> {
    let record = store.printer_by_id(printer_id).await?;
    let mut guard = record.write().await;

    let active_ids = guard.printer.active_jobs.clone();
    for job_id in &active_ids {
        if let Some(job) = guard.jobs.get_mut(job_id) {
            if job.state == JobState::Held {
                if let inftprint_core::model::HoldUntil::At(at) = job.hold_until {
                    if at > 0 && at <= now {
                        job.state = JobState::Pending;
                        job.state_reasons.remove("job-hold-until-specified");
                    }
                }
            }
        }
    }

    if guard.printer.is_shutdown || guard.printer.state != PrinterState::Idle {
        return Ok(None);
    }

    let proxy_mode = guard.printer.proxy_mode;
    let runnable = active_ids.iter().copied().find(|id| {
        guard
            .jobs
            .get(id)
            .map(|j| j.state == JobState::Pending)
            .unwrap_or(false)
    }).or_else(|| {
        active_ids.into_iter().find(|id| {
            guard
                .jobs
                .get(id)
                .map(|j| proxy_mode && j.state == JobState::Stopped && !j.state_reasons.contains("job-fetchable"))
                .unwrap_or(false)
        })
    });

    if let Some(job_id) = runnable {
        guard.printer.state = PrinterState::Processing;
        guard.printer.processing_job = Some(job_id);
        if let Some(job) = guard.jobs.get_mut(&job_id) {
            job.state = JobState::Processing;
            job.processing_at = Some(now);
        }
        info!(printer = printer_id.0, job = job_id.0, "checkjobs dispatched worker");
    }

    Ok(runnable)
}

/// `Pause-Printer`. If a job is currently processing, the printer only
/// reaches `stopped/paused` once that job's worker exits; until then it
/// carries `moving-to-paused`.
pub async fn pause_printer(store: &Store, printer_id: PrinterId) -> Result<()> {
    let record = store.printer_by_id(printer_id).await?;
    let mut guard = record.write().await;
    if guard.printer.processing_job.is_some() {
        guard.printer.state_reasons.insert("moving-to-paused".to_string());
    } else {
        guard.printer.state = PrinterState::Stopped;
        guard.printer.state_reasons.insert("paused".to_string());
    }
    Ok(())
}

pub async fn resume_printer(store: &Store, printer_id: PrinterId) -> Result<()> {
    let record = store.printer_by_id(printer_id).await?;
    let mut guard = record.write().await;
    guard.printer.state_reasons.remove("paused");
    guard.printer.state_reasons.remove("moving-to-paused");
    guard.printer.state = PrinterState::Idle;
    Ok(())
}

pub async fn hold_new_jobs(store: &Store, printer_id: PrinterId) -> Result<()> {
    let record = store.printer_by_id(printer_id).await?;
    record.write().await.printer.state_reasons.insert("hold-new-jobs".to_string());
    Ok(())
}

/// `Release-Held-New-Jobs`: clears the printer-wide hold and releases every
/// job that was only held because of it (`job-hold-until = none`).
pub async fn release_held_new_jobs(store: &Store, printer_id: PrinterId) -> Result<()> {
    let record = store.printer_by_id(printer_id).await?;
    let mut guard = record.write().await;
    guard.printer.state_reasons.remove("hold-new-jobs");
    for job_id in guard.printer.active_jobs.clone() {
        if let Some(job) = guard.jobs.get_mut(&job_id) {
            if job.state == JobState::Held
                && matches!(job.hold_until, inftprint_core::model::HoldUntil::At(0))
                && job.state_reasons.remove("hold-new-jobs")
                && job.state_reasons.is_empty()
            {
                job.state = JobState::Pending;
            }
        }
    }
    Ok(())
}

/// `Delete-Printer`. Jobs still pending/held become `aborted`; if a job is
/// processing, deletion is deferred (signaled via `deleting` reason) until
/// the worker observes it and calls this again.
pub async fn delete_printer(store: &Store, printer_id: PrinterId) -> Result<bool> {
    let record = store.printer_by_id(printer_id).await?;
    let (deferred, path) = {
        let mut guard = record.write().await;
        guard.printer.is_deleted = true;
        guard.printer.state_reasons.insert("deleting".to_string());
        if guard.printer.processing_job.is_some() {
            (true, guard.printer.resource_path.clone())
        } else {
            for job_id in guard.printer.active_jobs.clone() {
                if let Some(job) = guard.jobs.get_mut(&job_id) {
                    if matches!(job.state, JobState::Pending | JobState::Held) {
                        job.state = JobState::Aborted;
                    }
                }
            }
            (false, guard.printer.resource_path.clone())
        }
    };

    if !deferred {
        store.remove_printer(printer_id, &path).await;
        for sub in store.all_subscriptions().await {
            if sub.printer_id == Some(printer_id) {
                let _ = store
                    .with_subscription_mut(sub.id, |s| s.lease_expire = Some(chrono_now() + 30))
                    .await;
            }
        }
    }
    Ok(!deferred)
}

fn chrono_now() -> i64 {
    chrono::Utc::now().timestamp()
}

/// Recompute a printer's effective state from its own state and its
/// devices' reported states.
pub async fn effective_state(store: &Store, printer_id: PrinterId) -> Result<PrinterState> {
    let record = store.printer_by_id(printer_id).await?;
    let own = record.read().await.printer.state;
    let devices = store.devices_for_printer(printer_id).await;
    let device_states: Vec<PrinterState> = devices.iter().map(|d| d.state).collect();
    Ok(record.read().await.printer.effective_state(&device_states))
}

/// Emit the `printer-state-changed` event for the given printer.
pub async fn notify_printer_state_changed(store: &Store, printer_id: PrinterId, text: &str) {
    events::publish(store, event_mask::PRINTER_STATE_CHANGED, Scope::Printer(printer_id), "printer-state-changed", text).await;
}

/// Emit the `job-state-changed` event for the given job.
pub async fn notify_job_state_changed(store: &Store, printer_id: PrinterId, job_id: JobId, text: &str) {
    events::publish(store, event_mask::JOB_STATE_CHANGED, Scope::Job(printer_id, job_id), "job-state-changed", text).await;
}

/// Move a job that has just reached a terminal state out of the active-jobs
/// index and into the completed-jobs index, trimming the oldest completed
/// entries (and dropping them from the all-time `jobs` index and the job
/// table entirely) once `bound` is exceeded.
pub fn retire_job(printer: &mut Printer, jobs: &mut HashMap<JobId, Job>, job_id: JobId, bound: usize) {
    printer.active_jobs.retain(|&id| id != job_id);
    if !printer.completed_jobs.contains(&job_id) {
        printer.completed_jobs.push(job_id);
    }
    while printer.completed_jobs.len() > bound {
        let oldest = printer.completed_jobs.remove(0);
        printer.jobs.retain(|&id| id != oldest);
        jobs.remove(&oldest);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use inftprint_core::model::HoldUntil;

    #[test]
    fn no_hold_resolves_to_zero() {
        assert_eq!(resolve_hold_until("no-hold", 1_700_000_000), 0);
    }

    #[test]
    fn indefinite_resolves_to_negative_one() {
        assert_eq!(resolve_hold_until("indefinite", 1_700_000_000), -1);
    }

    #[test]
    fn job_completed_is_a_dead_end() {
        let mut job = sample_job(JobState::Processing);
        transition_job(&mut job, JobState::Completed).unwrap();
        assert!(transition_job(&mut job, JobState::Pending).is_err());
    }

    #[test]
    fn repeated_hold_is_idempotent() {
        let mut job = sample_job(JobState::Held);
        assert!(transition_job(&mut job, JobState::Held).is_ok());
        assert_eq!(job.state, JobState::Held);
    }

    fn sample_job(state: JobState) -> Job {
        Job {
            id: JobId(1),
            printer_id: PrinterId(1),
            uuid: "urn:uuid:job".into(),
            originating_user: "alice".into(),
            format: "application/pdf".into(),
            priority: 50,
            hold_until: HoldUntil::At(0),
            state,
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

    #[test]
    fn retire_job_trims_oldest_completed_beyond_bound() {
        let mut printer = Printer::new(PrinterId(1), "p1", "/ipp/print/p1", "urn:uuid:p1");
        let mut jobs = std::collections::HashMap::new();
        for i in 1..=3 {
            let job_id = JobId(i);
            printer.jobs.push(job_id);
            printer.active_jobs.push(job_id);
            jobs.insert(job_id, sample_job(JobState::Completed));
        }
        for i in 1..=3 {
            retire_job(&mut printer, &mut jobs, JobId(i), 2);
        }
        assert_eq!(printer.completed_jobs, vec![JobId(2), JobId(3)]);
        assert!(!printer.jobs.contains(&JobId(1)));
        assert!(!jobs.contains_key(&JobId(1)));
    }

    #[tokio::test]
    async fn check_jobs_dispatches_pending_job_on_idle_printer() {
        let store = Store::new();
        let printer_id = store.allocate_printer_id();
        let record = store
            .insert_printer(Printer::new(printer_id, "p1", "/ipp/print/p1", "urn:uuid:p1"))
            .await;
        {
            let mut guard = record.write().await;
            let job = sample_job(JobState::Pending);
            guard.printer.active_jobs.push(job.id);
            guard.jobs.insert(job.id, job);
        }

        let dispatched = check_jobs(&store, printer_id, 0).await.unwrap();
        assert_eq!(dispatched, Some(JobId(1)));

        let guard = record.read().await;
        assert_eq!(guard.printer.state, PrinterState::Processing);
        assert_eq!(guard.jobs[&JobId(1)].state, JobState::Processing);
    }

    #[tokio::test]
    async fn check_jobs_picks_stopped_fetchable_job_on_proxy_printer() {
        let store = Store::new();
        let printer_id = store.allocate_printer_id();
        let record = store
            .insert_printer(Printer::new(printer_id, "p1", "/ipp/print/p1", "urn:uuid:p1"))
            .await;
        {
            let mut guard = record.write().await;
            guard.printer.proxy_mode = true;
            let job = sample_job(JobState::Stopped);
            guard.printer.active_jobs.push(job.id);
            guard.jobs.insert(job.id, job);
        }

        let dispatched = check_jobs(&store, printer_id, 0).await.unwrap();
        assert_eq!(dispatched, Some(JobId(1)));
    }

    #[tokio::test]
    async fn check_jobs_ignores_stopped_fetchable_job_marked_job_fetchable() {
        let store = Store::new();
        let printer_id = store.allocate_printer_id();
        let record = store
            .insert_printer(Printer::new(printer_id, "p1", "/ipp/print/p1", "urn:uuid:p1"))
            .await;
        {
            let mut guard = record.write().await;
            guard.printer.proxy_mode = true;
            let mut job = sample_job(JobState::Stopped);
            job.state_reasons.insert("job-fetchable".to_string());
            guard.printer.active_jobs.push(job.id);
            guard.jobs.insert(job.id, job);
        }

        let dispatched = check_jobs(&store, printer_id, 0).await.unwrap();
        assert_eq!(dispatched, None);
    }

    #[tokio::test]
    async fn release_held_new_jobs_keeps_job_held_while_document_incoming() {
        let store = Store::new();
        let printer_id = store.allocate_printer_id();
        let record = store
            .insert_printer(Printer::new(printer_id, "p1", "/ipp/print/p1", "urn:uuid:p1"))
            .await;
        {
            let mut guard = record.write().await;
            guard.printer.state_reasons.insert("hold-new-jobs".to_string());
            let mut job = sample_job(JobState::Held);
            job.state_reasons.insert("hold-new-jobs".to_string());
            job.state_reasons.insert("job-incoming".to_string());
            guard.printer.active_jobs.push(job.id);
            guard.jobs.insert(job.id, job);
        }

        release_held_new_jobs(&store, printer_id).await.unwrap();

        let guard = record.read().await;
        let job = &guard.jobs[&JobId(1)];
        assert_eq!(job.state, JobState::Held);
        assert!(!job.state_reasons.contains("hold-new-jobs"));
        assert!(job.state_reasons.contains("job-incoming"));
    }
}
