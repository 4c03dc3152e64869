// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Job submission and control: Print-Job, Create-Job/Send-Document, Cancel-Job,
// Hold-Job/Release-Job, Close-Job and the bulk-cancel operations.

use inftprint_core::attribute;
use inftprint_core::error::{InftError, Result};
use inftprint_core::model::{HoldUntil, Job, JobId, JobState, PrinterId};
use inftprint_security::{access, Identity};
use ipp::attribute::IppAttribute;
use ipp::model::DelimiterTag;
use ipp::request::IppRequestResponse;
use ipp::value::IppValue;
use tracing::instrument;

use crate::dispatcher::{self, Context, Target};
use crate::{events, lifecycle};

use super::requesting_user;

const MAX_SPOOL_BYTES: u64 = 1024 * 1024 * 1024;

fn job_response(req: &IppRequestResponse, job: &Job, printer_path: &str) -> IppRequestResponse {
    let mut resp = dispatcher::success_response(req.header().version, req.header().request_id);
    attach_job_group(&mut resp, job, printer_path);
    resp
}

fn job_state_reasons_value(job: &Job) -> IppValue {
    let mut reasons: Vec<IppValue> = job.state_reasons.iter().cloned().map(IppValue::Keyword).collect();
    if reasons.is_empty() {
        reasons.push(IppValue::Keyword("none".to_string()));
    }
    if reasons.len() == 1 {
        reasons.into_iter().next().unwrap()
    } else {
        IppValue::Array(reasons)
    }
}

fn job_state_code(state: JobState) -> i32 {
    match state {
        JobState::Pending => 3,
        JobState::Held => 4,
        JobState::Processing => 5,
        JobState::Stopped => 6,
        JobState::Canceled => 7,
        JobState::Aborted => 8,
        JobState::Completed => 9,
    }
}

fn new_job(store_job_id: JobId, printer_id: PrinterId, req: &IppRequestResponse, identity: &Option<Identity>, now: i64) -> Job {
    let attrs = req.attributes();
    let format = attribute::first_value(attrs, DelimiterTag::OperationAttributes, "document-format")
        .and_then(attribute::as_text)
        .unwrap_or_else(|| "application/octet-stream".to_string());

    let hold_keyword = attribute::first_value(attrs, DelimiterTag::JobAttributes, "job-hold-until")
        .and_then(attribute::as_text);
    let hold_until = match hold_keyword.as_deref() {
        Some("indefinite") => HoldUntil::Indefinite,
        Some(keyword) => HoldUntil::At(lifecycle::resolve_hold_until(keyword, now)),
        None => HoldUntil::At(0),
    };

    let mut state_reasons = std::collections::HashSet::new();
    let mut state = JobState::Pending;
    if matches!(hold_until, HoldUntil::Indefinite) || matches!(hold_until, HoldUntil::At(at) if at > now) {
        state = JobState::Held;
        state_reasons.insert("job-hold-until-specified".to_string());
    }

    Job {
        id: store_job_id,
        printer_id,
        uuid: format!("urn:uuid:job-{}-{}", printer_id.0, store_job_id.0),
        originating_user: requesting_user(req, identity),
        format,
        priority: attribute::first_value(attrs, DelimiterTag::JobAttributes, "job-priority")
            .and_then(attribute::as_i32)
            .unwrap_or(50),
        hold_until,
        state,
        state_reasons,
        impressions: None,
        impressions_completed: 0,
        device_uuid: None,
        device_state: None,
        device_state_reasons: Default::default(),
        spool_filename: None,
        spool_sha256: None,
        cancel_requested: false,
        created_at: now,
        processing_at: None,
        completed_at: None,
    }
}

async fn require_printer(ctx: &Context, req: &IppRequestResponse) -> Result<PrinterId> {
    match dispatcher::resolve_target(ctx, req, false).await? {
        Target::Printer(id) => Ok(id),
        Target::Job(id, _) => Ok(id),
        Target::System => Err(InftError::MalformedRequest("operation requires a printer target".into())),
    }
}

/// Insert a new job in `Pending`/`Held` state, publish `job-created`, and
/// kick the scheduler in case the printer is idle.
///
/// `awaits_document` is set for `Create-Job`, whose document arrives later
/// via `Send-Document`/`Send-URI`: the job is held with reason
/// `job-incoming` so `check_jobs` never hands it to a worker before there's
/// anything to print. `Print-Job`/`Print-URI` carry the document with the
/// same request and never set it.
async fn admit_job(
    ctx: &Context,
    printer_id: PrinterId,
    req: &IppRequestResponse,
    identity: &Option<Identity>,
    awaits_document: bool,
) -> Result<Job> {
    let record = ctx.store.printer_by_id(printer_id).await?;
    let job = {
        let mut guard = record.write().await;
        if guard.printer.is_deleted || guard.printer.is_shutdown {
            return Err(InftError::ServiceUnavailable("printer is shut down".into()));
        }
        if !guard.printer.is_accepting_jobs {
            return Err(InftError::NotAcceptingJobs);
        }
        if guard.printer.active_jobs.len() >= ctx.config.max_active_jobs_per_printer {
            return Err(InftError::TooManyJobs);
        }
        let job_id = JobId(guard.printer.allocate_job_id());
        let now = now_epoch();
        let mut job = new_job(job_id, printer_id, req, identity, now);
        if awaits_document {
            job.state = JobState::Held;
            job.state_reasons.insert("job-incoming".to_string());
        }
        if guard.printer.state_reasons.contains("hold-new-jobs") {
            job.state = JobState::Held;
            job.state_reasons.insert("hold-new-jobs".to_string());
        }
        guard.printer.jobs.push(job_id);
        guard.printer.active_jobs.push(job_id);
        guard.jobs.insert(job_id, job.clone());
        job
    };

    events::publish(&ctx.store, events::event_mask::JOB_CREATED, events::Scope::Job(printer_id, job.id), "job-created", &job.uuid).await;
    crate::job_processor::check_and_dispatch(&ctx.store, &ctx.config, printer_id).await;
    ctx.audit.record("Create-Job", &job.originating_user, &job.uuid, true, None).ok();
    Ok(job)
}

fn now_epoch() -> i64 {
    chrono::Utc::now().timestamp()
}

async fn spool_payload(ctx: &Context, printer_id: PrinterId, job_id: JobId, req: IppRequestResponse) -> Result<String> {
    let format = {
        let record = ctx.store.printer_by_id(printer_id).await?;
        let guard = record.read().await;
        guard.jobs.get(&job_id).map(|j| j.format.clone()).unwrap_or_default()
    };
    let ext = extension_for(&format);
    let dir = ctx.config.spool_directory.join(printer_id.0.to_string());
    tokio::fs::create_dir_all(&dir).await?;
    let filename = format!("{}-doc.{ext}", job_id.0);
    let path = dir.join(&filename);

    let mut payload = req.into_payload();
    let mut file = tokio::fs::File::create(&path).await?;
    let written = tokio::io::copy(&mut payload, &mut file).await?;
    if written > MAX_SPOOL_BYTES {
        let _ = tokio::fs::remove_file(&path).await;
        return Err(InftError::DocumentAccess("document exceeds maximum spool size".into()));
    }

    let digest = tokio::fs::read(&path).await.map(|bytes| inftprint_security::integrity::hash_bytes(&bytes)).ok();

    let record = ctx.store.printer_by_id(printer_id).await?;
    let mut guard = record.write().await;
    if let Some(job) = guard.jobs.get_mut(&job_id) {
        job.spool_filename = Some(filename.clone());
        job.spool_sha256 = digest;
    }
    Ok(filename)
}

fn extension_for(mime: &str) -> &'static str {
    match mime {
        "application/pdf" => "pdf",
        "image/jpeg" => "jpg",
        "image/png" => "png",
        "application/postscript" => "ps",
        "text/plain" => "txt",
        _ => "bin",
    }
}

#[instrument(skip(ctx, req, identity))]
pub async fn print_job(ctx: &Context, req: IppRequestResponse, identity: Option<Identity>) -> Result<IppRequestResponse> {
    let printer_id = require_printer(ctx, &req).await?;
    let job = admit_job(ctx, printer_id, &req, &identity, false).await?;
    let path = printer_path(ctx, printer_id).await?;
    let version = req.header().version;
    let request_id = req.header().request_id;

    spool_payload(ctx, printer_id, job.id, req).await?;
    crate::job_processor::check_and_dispatch(&ctx.store, &ctx.config, printer_id).await;

    let record = ctx.store.printer_by_id(printer_id).await?;
    let guard = record.read().await;
    let job = guard.jobs.get(&job.id).cloned().ok_or(InftError::JobNotFound(job.id.0))?;
    drop(guard);

    let mut resp = dispatcher::success_response(version, request_id);
    attach_job_group(&mut resp, &job, &path);
    Ok(resp)
}

fn attach_job_group(resp: &mut IppRequestResponse, job: &Job, printer_path: &str) {
    let group = resp.attributes_mut();
    group.add(DelimiterTag::JobAttributes, IppAttribute::new(IppAttribute::JOB_ID, IppValue::Integer(job.id.0)));
    group.add(
        DelimiterTag::JobAttributes,
        IppAttribute::new(IppAttribute::JOB_URI, IppValue::Uri(format!("{printer_path}/{}", job.id.0))),
    );
    group.add(DelimiterTag::JobAttributes, IppAttribute::new(IppAttribute::JOB_STATE, IppValue::Enum(job_state_code(job.state))));
    group.add(DelimiterTag::JobAttributes, IppAttribute::new(IppAttribute::JOB_STATE_REASONS, job_state_reasons_value(job)));
}

#[instrument(skip(ctx, req, identity))]
pub async fn print_uri(ctx: &Context, req: &IppRequestResponse, identity: Option<Identity>) -> Result<IppRequestResponse> {
    let printer_id = require_printer(ctx, req).await?;
    let job = admit_job(ctx, printer_id, req, &identity, false).await?;
    let path = printer_path(ctx, printer_id).await?;
    Ok(job_response(req, &job, &path))
}

#[instrument(skip(ctx, req, _identity))]
pub async fn validate_job(ctx: &Context, req: &IppRequestResponse, _identity: Option<Identity>) -> Result<IppRequestResponse> {
    let _ = require_printer(ctx, req).await?;
    Ok(dispatcher::success_response(req.header().version, req.header().request_id))
}

#[instrument(skip(ctx, req, identity))]
pub async fn create_job(ctx: &Context, req: &IppRequestResponse, identity: Option<Identity>) -> Result<IppRequestResponse> {
    let printer_id = require_printer(ctx, req).await?;
    let job = admit_job(ctx, printer_id, req, &identity, true).await?;
    let path = printer_path(ctx, printer_id).await?;
    Ok(job_response(req, &job, &path))
}

/// `Send-Document`: attaches a document to a job created by `Create-Job`.
/// Per the single-document invariant this service enforces, a second
/// `Send-Document` against the same job is rejected.
#[instrument(skip(ctx, req, identity))]
pub async fn send_document(ctx: &Context, req: IppRequestResponse, identity: Option<Identity>) -> Result<IppRequestResponse> {
    let (printer_id, job_id) = match dispatcher::resolve_target(ctx, &req, false).await? {
        Target::Job(p, j) => (p, j),
        _ => return Err(InftError::MalformedRequest("Send-Document requires a job target".into())),
    };

    {
        let record = ctx.store.printer_by_id(printer_id).await?;
        let guard = record.read().await;
        let job = guard.jobs.get(&job_id).ok_or(InftError::JobNotFound(job_id.0))?;
        access::authorize_user(
            identity.as_ref(),
            access::Scope::Owner,
            Some(&job.originating_user),
            &ctx.config.admin_group,
            &ctx.config.operator_group,
        )?;
        if job.spool_filename.is_some() {
            return Err(InftError::NotPossible("multiple documents not supported for this job".into()));
        }
    }

    let version = req.header().version;
    let request_id = req.header().request_id;
    let last_document = attribute::first_value(req.attributes(), DelimiterTag::OperationAttributes, "last-document")
        .and_then(attribute::as_bool)
        .unwrap_or(true);

    spool_payload(ctx, printer_id, job_id, req).await?;

    let record = ctx.store.printer_by_id(printer_id).await?;
    if last_document {
        let mut guard = record.write().await;
        if let Some(job) = guard.jobs.get_mut(&job_id) {
            if job.state_reasons.remove("job-incoming") && job.state == JobState::Held && job.state_reasons.is_empty() {
                job.state = JobState::Pending;
            }
        }
    }
    crate::job_processor::check_and_dispatch(&ctx.store, &ctx.config, printer_id).await;

    let guard = record.read().await;
    let job = guard.jobs.get(&job_id).cloned().ok_or(InftError::JobNotFound(job_id.0))?;
    let path = guard.printer.resource_path.clone();
    drop(guard);

    let mut resp = dispatcher::success_response(version, request_id);
    attach_job_group(&mut resp, &job, &path);
    Ok(resp)
}

#[instrument(skip(ctx, req, identity))]
pub async fn send_uri(ctx: &Context, req: &IppRequestResponse, identity: Option<Identity>) -> Result<IppRequestResponse> {
    let (printer_id, job_id) = match dispatcher::resolve_target(ctx, req, false).await? {
        Target::Job(p, j) => (p, j),
        _ => return Err(InftError::MalformedRequest("Send-URI requires a job target".into())),
    };
    let uri = attribute::first_value(req.attributes(), DelimiterTag::OperationAttributes, "document-uri")
        .and_then(attribute::as_text)
        .ok_or_else(|| InftError::MalformedRequest("missing document-uri".into()))?;
    if !uri.starts_with("http://") && !uri.starts_with("https://") {
        return Err(InftError::DocumentAccess(format!("unsupported document-uri scheme: {uri}")));
    }

    let record = ctx.store.printer_by_id(printer_id).await?;
    let guard = record.read().await;
    let job = guard.jobs.get(&job_id).ok_or(InftError::JobNotFound(job_id.0))?;
    access::authorize_user(
        identity.as_ref(),
        access::Scope::Owner,
        Some(&job.originating_user),
        &ctx.config.admin_group,
        &ctx.config.operator_group,
    )?;
    let path = guard.printer.resource_path.clone();
    let job = job.clone();
    Ok(job_response(req, &job, &path))
}

async fn printer_path(ctx: &Context, printer_id: PrinterId) -> Result<String> {
    let record = ctx.store.printer_by_id(printer_id).await?;
    Ok(record.read().await.printer.resource_path.clone())
}

/// Transition a job by applying `lifecycle::transition_job` and, on
/// success, notifying and re-running the scheduler.
///
/// Canceling (or aborting) a job that is currently processing cannot apply
/// the state change here: the worker owns that job's terminal transition.
/// Instead this sets `cancel_requested`, adds `job-stopped`, and signals the
/// transform child; the worker observes `cancel_requested` when it finishes
/// and finalizes the job as `canceled`.
async fn apply_transition(ctx: &Context, printer_id: PrinterId, job_id: JobId, next: JobState) -> Result<()> {
    let record = ctx.store.printer_by_id(printer_id).await?;
    let deferred = {
        let mut guard = record.write().await;
        let processing = guard.printer.processing_job == Some(job_id);
        let job = guard.jobs.get_mut(&job_id).ok_or(InftError::JobNotFound(job_id.0))?;
        if processing && matches!(next, JobState::Canceled | JobState::Aborted) {
            job.cancel_requested = true;
            job.state_reasons.insert("job-stopped".to_string());
            true
        } else {
            lifecycle::transition_job(job, next)?;
            if matches!(next, JobState::Canceled | JobState::Aborted) {
                job.cancel_requested = true;
            }
            if next.is_terminal() {
                let bound = ctx.config.max_completed_jobs_per_printer;
                lifecycle::retire_job(&mut guard.printer, &mut guard.jobs, job_id, bound);
            }
            false
        }
    };

    if deferred {
        ctx.store.signal_transform_child(job_id).await;
        lifecycle::notify_job_state_changed(&ctx.store, printer_id, job_id, "job-stopped").await;
    } else {
        lifecycle::notify_job_state_changed(&ctx.store, printer_id, job_id, &format!("{next:?}")).await;
        crate::job_processor::check_and_dispatch(&ctx.store, &ctx.config, printer_id).await;
    }
    Ok(())
}

async fn require_job_owner_or_operator(ctx: &Context, printer_id: PrinterId, job_id: JobId, identity: &Option<Identity>) -> Result<()> {
    let record = ctx.store.printer_by_id(printer_id).await?;
    let guard = record.read().await;
    let job = guard.jobs.get(&job_id).ok_or(InftError::JobNotFound(job_id.0))?;
    access::authorize_user(
        identity.as_ref(),
        access::Scope::Owner,
        Some(&job.originating_user),
        &ctx.config.admin_group,
        &ctx.config.operator_group,
    )
}

#[instrument(skip(ctx, req, identity))]
pub async fn cancel_job(ctx: &Context, req: &IppRequestResponse, identity: Option<Identity>) -> Result<IppRequestResponse> {
    let (printer_id, job_id) = match dispatcher::resolve_target(ctx, req, false).await? {
        Target::Job(p, j) => (p, j),
        Target::Printer(p) => {
            let record = ctx.store.printer_by_id(p).await?;
            let job_id = record.read().await.printer.processing_job.ok_or(InftError::JobNotFound(0))?;
            (p, job_id)
        }
        Target::System => return Err(InftError::MalformedRequest("Cancel-Job requires a job target".into())),
    };
    require_job_owner_or_operator(ctx, printer_id, job_id, &identity).await?;
    apply_transition(ctx, printer_id, job_id, JobState::Canceled).await?;
    ctx.audit.record("Cancel-Job", &requesting_user(req, &identity), &job_id.0.to_string(), true, None).ok();
    Ok(dispatcher::success_response(req.header().version, req.header().request_id))
}

#[instrument(skip(ctx, req, identity))]
pub async fn hold_job(ctx: &Context, req: &IppRequestResponse, identity: Option<Identity>) -> Result<IppRequestResponse> {
    let (printer_id, job_id) = match dispatcher::resolve_target(ctx, req, false).await? {
        Target::Job(p, j) => (p, j),
        _ => return Err(InftError::MalformedRequest("Hold-Job requires a job target".into())),
    };
    require_job_owner_or_operator(ctx, printer_id, job_id, &identity).await?;
    apply_transition(ctx, printer_id, job_id, JobState::Held).await?;
    Ok(dispatcher::success_response(req.header().version, req.header().request_id))
}

#[instrument(skip(ctx, req, identity))]
pub async fn release_job(ctx: &Context, req: &IppRequestResponse, identity: Option<Identity>) -> Result<IppRequestResponse> {
    let (printer_id, job_id) = match dispatcher::resolve_target(ctx, req, false).await? {
        Target::Job(p, j) => (p, j),
        _ => return Err(InftError::MalformedRequest("Release-Job requires a job target".into())),
    };
    require_job_owner_or_operator(ctx, printer_id, job_id, &identity).await?;
    apply_transition(ctx, printer_id, job_id, JobState::Pending).await?;
    Ok(dispatcher::success_response(req.header().version, req.header().request_id))
}

/// `Close-Job`: a no-op acknowledgement once a client has finished sending
/// all documents for a multi-document job; this service admits only a
/// single document per job, so this simply validates the job exists.
#[instrument(skip(ctx, req, identity))]
pub async fn close_job(ctx: &Context, req: &IppRequestResponse, identity: Option<Identity>) -> Result<IppRequestResponse> {
    let (printer_id, job_id) = match dispatcher::resolve_target(ctx, req, false).await? {
        Target::Job(p, j) => (p, j),
        _ => return Err(InftError::MalformedRequest("Close-Job requires a job target".into())),
    };
    require_job_owner_or_operator(ctx, printer_id, job_id, &identity).await?;
    Ok(dispatcher::success_response(req.header().version, req.header().request_id))
}

/// `Cancel-Jobs`/`Cancel-My-Jobs`: cancel every active job on the target
/// printer, optionally restricted to jobs owned by the requester.
#[instrument(skip(ctx, req, identity))]
pub async fn cancel_jobs(ctx: &Context, req: &IppRequestResponse, identity: Option<Identity>, mine_only: bool) -> Result<IppRequestResponse> {
    let printer_id = require_printer(ctx, req).await?;
    if !mine_only {
        access::authorize_user(identity.as_ref(), access::Scope::Operator, None, &ctx.config.admin_group, &ctx.config.operator_group)?;
    }
    let user = requesting_user(req, &identity);

    let record = ctx.store.printer_by_id(printer_id).await?;
    let active: Vec<JobId> = {
        let guard = record.read().await;
        guard
            .printer
            .active_jobs
            .iter()
            .filter(|id| !mine_only || guard.jobs.get(id).is_some_and(|j| j.originating_user == user))
            .copied()
            .collect()
    };
    for job_id in active {
        let _ = apply_transition(ctx, printer_id, job_id, JobState::Canceled).await;
    }
    Ok(dispatcher::success_response(req.header().version, req.header().request_id))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_state_code_matches_rfc8011_enum_values() {
        assert_eq!(job_state_code(JobState::Pending), 3);
        assert_eq!(job_state_code(JobState::Completed), 9);
    }

    #[test]
    fn extension_for_known_and_unknown_formats() {
        assert_eq!(extension_for("application/pdf"), "pdf");
        assert_eq!(extension_for("application/x-unknown"), "bin");
    }
}
