// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Get-Job-Attributes, Get-Jobs, Get-Printer-Attributes, Get-Printers.

use inftprint_core::attribute::{self, Requested};
use inftprint_core::error::{InftError, Result};
use inftprint_core::model::{Job, JobId, JobState, Printer, PrinterState};
use inftprint_security::{access, Identity};
use ipp::attribute::IppAttribute;
use ipp::model::DelimiterTag;
use ipp::request::IppRequestResponse;
use ipp::value::IppValue;
use tracing::instrument;

use crate::dispatcher::{self, Context, Target};
use crate::handlers::requesting_user;

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

fn printer_state_code(state: PrinterState) -> i32 {
    match state {
        PrinterState::Idle => 3,
        PrinterState::Processing => 4,
        PrinterState::Stopped => 5,
    }
}

fn job_description(job: &Job, printer_path: &str) -> Vec<(&'static str, IppValue)> {
    vec![
        ("job-id", IppValue::Integer(job.id.0)),
        ("job-uri", IppValue::Uri(format!("{printer_path}/{}", job.id.0))),
        ("job-printer-uri", IppValue::Uri(printer_path.to_string())),
        ("job-state", IppValue::Enum(job_state_code(job.state))),
        (
            "job-state-reasons",
            if job.state_reasons.is_empty() {
                IppValue::Keyword("none".to_string())
            } else {
                IppValue::Array(job.state_reasons.iter().cloned().map(IppValue::Keyword).collect())
            },
        ),
        ("job-name", IppValue::NameWithoutLanguage(format!("job-{}", job.id.0))),
        ("job-originating-user-name", IppValue::NameWithoutLanguage(job.originating_user.clone())),
        ("document-format", IppValue::MimeMediaType(job.format.clone())),
        ("time-at-creation", IppValue::Integer(job.created_at as i32)),
        ("job-k-octets", IppValue::Integer(0)),
        ("job-impressions-completed", IppValue::Integer(job.impressions_completed)),
    ]
}

fn printer_description(printer: &Printer) -> Vec<(&'static str, IppValue)> {
    vec![
        ("printer-uri-supported", IppValue::Uri(printer.resource_path.clone())),
        ("printer-name", IppValue::NameWithoutLanguage(printer.name.clone())),
        ("printer-info", IppValue::TextWithoutLanguage(printer.name.clone())),
        ("printer-make-and-model", IppValue::TextWithoutLanguage("Infrastructure Printer".to_string())),
        ("printer-state", IppValue::Enum(printer_state_code(printer.state))),
        (
            "printer-state-reasons",
            if printer.state_reasons.is_empty() {
                IppValue::Keyword("none".to_string())
            } else {
                IppValue::Array(printer.state_reasons.iter().cloned().map(IppValue::Keyword).collect())
            },
        ),
        ("printer-is-accepting-jobs", IppValue::Boolean(printer.is_accepting_jobs && !printer.is_shutdown)),
        ("printer-up-time", IppValue::Integer(0)),
        ("queued-job-count", IppValue::Integer(printer.active_jobs.len() as i32)),
        ("ipp-versions-supported", IppValue::Keyword("1.1".to_string())),
        (
            "operations-supported",
            IppValue::Array(
                ["Print-Job", "Validate-Job", "Create-Job", "Send-Document", "Cancel-Job", "Get-Job-Attributes", "Get-Jobs", "Get-Printer-Attributes"]
                    .into_iter()
                    .map(|s| IppValue::Keyword(s.to_string()))
                    .collect(),
            ),
        ),
        ("document-format-supported", {
            let formats = ["application/pdf", "image/jpeg", "image/png", "application/postscript", "text/plain", "application/octet-stream"];
            IppValue::Array(formats.into_iter().map(|s| IppValue::MimeMediaType(s.to_string())).collect())
        }),
        ("document-format-default", IppValue::MimeMediaType("application/octet-stream".to_string())),
        ("charset-configured", IppValue::Charset("utf-8".to_string())),
        ("charset-supported", IppValue::Charset("utf-8".to_string())),
        ("natural-language-configured", IppValue::NaturalLanguage("en".to_string())),
        ("generated-natural-language-supported", IppValue::NaturalLanguage("en".to_string())),
        ("uri-security-supported", IppValue::Keyword("none".to_string())),
        ("uri-authentication-supported", IppValue::Keyword("none".to_string())),
        ("pdl-override-supported", IppValue::Keyword("not-attempted".to_string())),
    ]
}

fn attrs_to_group(resp: &mut IppRequestResponse, group: DelimiterTag, attrs: Vec<(&'static str, IppValue)>, requested: &Requested) {
    let out = resp.attributes_mut();
    for (name, value) in attrs {
        if requested.wants(name) {
            out.add(group, IppAttribute::new(name, value));
        }
    }
}

fn requested_from(req: &IppRequestResponse) -> Requested {
    let values: Vec<IppValue> = attribute::all_values(req.attributes(), DelimiterTag::OperationAttributes, "requested-attributes")
        .into_iter()
        .cloned()
        .collect();
    Requested::from_values(&values)
}

#[instrument(skip(ctx, req, identity))]
pub async fn get_job_attributes(ctx: &Context, req: &IppRequestResponse, identity: Option<Identity>) -> Result<IppRequestResponse> {
    let (printer_id, job_id) = match dispatcher::resolve_target(ctx, req, false).await? {
        Target::Job(p, j) => (p, j),
        _ => return Err(InftError::MalformedRequest("Get-Job-Attributes requires a job target".into())),
    };
    let record = ctx.store.printer_by_id(printer_id).await?;
    let guard = record.read().await;
    let job = guard.jobs.get(&job_id).ok_or(InftError::JobNotFound(job_id.0))?;
    let path = guard.printer.resource_path.clone();

    let requester = requesting_user(req, &identity);
    let sees_private = access::sees_private_attributes(identity.as_ref(), Some(&job.originating_user), &ctx.config.admin_group, &ctx.config.operator_group);
    let _ = requester;

    let mut resp = dispatcher::success_response(req.header().version, req.header().request_id);
    let requested = requested_from(req);
    let mut fields = job_description(job, &path);
    if !sees_private {
        fields.retain(|(name, _)| !ctx.config.private_attributes.iter().any(|p| p == name));
    }
    attrs_to_group(&mut resp, DelimiterTag::JobAttributes, fields, &requested);
    Ok(resp)
}

/// Match a job's state against one `which-jobs` keyword. The job-state
/// enum this service uses already follows RFC 8011's numbering
/// (`pending`=3 .. `completed`=9), so `pending-held`/`processing-stopped`
/// map directly onto `JobState::Held`/`JobState::Stopped`.
fn matches_which_jobs(state: JobState, which: &str) -> bool {
    match which {
        "completed" => state == JobState::Completed,
        "all" => true,
        "aborted" => state == JobState::Aborted,
        "canceled" => state == JobState::Canceled,
        "pending" => state == JobState::Pending,
        "pending-held" => state == JobState::Held,
        "processing" => state == JobState::Processing,
        "processing-stopped" => state == JobState::Stopped,
        _ => state != JobState::Completed,
    }
}

/// `Get-Jobs`: supports the full `which-jobs` enum (spec.md:375-377),
/// `first-job-id`, `limit`, and `my-jobs` filtering.
#[instrument(skip(ctx, req, identity))]
pub async fn get_jobs(ctx: &Context, req: &IppRequestResponse, identity: Option<Identity>) -> Result<IppRequestResponse> {
    let printer_id = match dispatcher::resolve_target(ctx, req, false).await? {
        Target::Printer(id) => id,
        Target::Job(id, _) => id,
        Target::System => return Err(InftError::MalformedRequest("Get-Jobs requires a printer target".into())),
    };
    let which = attribute::first_value(req.attributes(), DelimiterTag::OperationAttributes, "which-jobs")
        .and_then(attribute::as_text)
        .unwrap_or_else(|| "not-completed".to_string());
    let my_jobs = attribute::first_value(req.attributes(), DelimiterTag::OperationAttributes, "my-jobs")
        .and_then(attribute::as_bool)
        .unwrap_or(false);
    let first_job_id = attribute::first_value(req.attributes(), DelimiterTag::OperationAttributes, "first-job-id")
        .and_then(attribute::as_i32)
        .unwrap_or(0);
    let limit = attribute::first_value(req.attributes(), DelimiterTag::OperationAttributes, "limit")
        .and_then(attribute::as_i32)
        .map(|n| n.max(0) as usize);
    let user = requesting_user(req, &identity);

    let record = ctx.store.printer_by_id(printer_id).await?;
    let guard = record.read().await;
    let path = guard.printer.resource_path.clone();
    let ids: Vec<JobId> = guard.printer.jobs.clone();
    let mut jobs: Vec<Job> = ids
        .into_iter()
        .filter_map(|id| guard.jobs.get(&id).cloned())
        .filter(|j| matches_which_jobs(j.state, &which))
        .filter(|j| j.id.0 >= first_job_id)
        .filter(|j| !my_jobs || j.originating_user == user)
        .collect();
    drop(guard);

    if let Some(limit) = limit {
        jobs.truncate(limit);
    }

    let requested = requested_from(req);
    let mut resp = dispatcher::success_response(req.header().version, req.header().request_id);
    for job in &jobs {
        attrs_to_group(&mut resp, DelimiterTag::JobAttributes, job_description(job, &path), &requested);
    }
    Ok(resp)
}

#[instrument(skip(ctx, req, identity))]
pub async fn get_printer_attributes(ctx: &Context, req: &IppRequestResponse, identity: Option<Identity>) -> Result<IppRequestResponse> {
    let printer_id = match dispatcher::resolve_target(ctx, req, false).await? {
        Target::Printer(id) => id,
        Target::Job(id, _) => id,
        Target::System => return Err(InftError::MalformedRequest("Get-Printer-Attributes requires a printer target".into())),
    };
    let record = ctx.store.printer_by_id(printer_id).await?;
    let guard = record.read().await;
    if guard.printer.is_deleted {
        return Err(InftError::PrinterNotFound(printer_id.0.to_string()));
    }
    let fields = printer_description(&guard.printer);
    drop(guard);
    let _ = identity;

    let requested = requested_from(req);
    let mut resp = dispatcher::success_response(req.header().version, req.header().request_id);
    attrs_to_group(&mut resp, DelimiterTag::PrinterAttributes, fields, &requested);
    Ok(resp)
}

/// Match a printer's state against one `which-printers` keyword.
fn matches_which_printers(printer: &Printer, which: &str) -> bool {
    let accepting = printer.is_accepting_jobs && !printer.is_shutdown;
    match which {
        "accepting" => accepting,
        "not-accepting" => !accepting,
        "idle" => printer.state == PrinterState::Idle,
        "processing" => printer.state == PrinterState::Processing,
        "stopped" => printer.state == PrinterState::Stopped,
        _ => true,
    }
}

/// `Get-Printers`: a CUPS-style system-wide enumeration, independent of
/// any single printer's resource path. Supports `which-printers`,
/// `printer-ids`, and `first-index`/`limit` (spec.md:382-387); geographic
/// filtering and `printer-location`/`printer-service-type`/
/// `document-format` are not implemented since the `Printer` model
/// carries neither a location nor a service type (see DESIGN.md).
#[instrument(skip(ctx, req, _identity))]
pub async fn get_printers(ctx: &Context, req: &IppRequestResponse, _identity: Option<Identity>) -> Result<IppRequestResponse> {
    let which = attribute::first_value(req.attributes(), DelimiterTag::OperationAttributes, "which-printers")
        .and_then(attribute::as_text)
        .unwrap_or_else(|| "all".to_string());
    let printer_ids: Vec<i32> = attribute::all_values(req.attributes(), DelimiterTag::OperationAttributes, "printer-ids")
        .into_iter()
        .filter_map(attribute::as_i32)
        .collect();
    let first_index = attribute::first_value(req.attributes(), DelimiterTag::OperationAttributes, "first-index")
        .and_then(attribute::as_i32)
        .map(|n| n.max(1) as usize)
        .unwrap_or(1);
    let limit = attribute::first_value(req.attributes(), DelimiterTag::OperationAttributes, "limit")
        .and_then(attribute::as_i32)
        .map(|n| n.max(0) as usize);

    let records = ctx.store.all_printers().await;
    let mut printers = Vec::new();
    for record in records {
        let guard = record.read().await;
        if guard.printer.is_deleted {
            continue;
        }
        if !printer_ids.is_empty() && !printer_ids.contains(&guard.printer.id.0) {
            continue;
        }
        if !matches_which_printers(&guard.printer, &which) {
            continue;
        }
        printers.push(guard.printer.clone());
    }

    let skip = first_index.saturating_sub(1);
    let selected = printers.into_iter().skip(skip);
    let selected: Vec<Printer> = match limit {
        Some(limit) => selected.take(limit).collect(),
        None => selected.collect(),
    };

    let requested = requested_from(req);
    let mut resp = dispatcher::success_response(req.header().version, req.header().request_id);
    for printer in &selected {
        attrs_to_group(&mut resp, DelimiterTag::PrinterAttributes, printer_description(printer), &requested);
    }
    Ok(resp)
}

/// `Get-Printer-Supported-Values`: the static capability subset of
/// `printer-description`, fetched on its own when a client only needs to
/// negotiate job template defaults.
#[instrument(skip(ctx, req, identity))]
pub async fn get_printer_supported_values(ctx: &Context, req: &IppRequestResponse, identity: Option<Identity>) -> Result<IppRequestResponse> {
    get_printer_attributes(ctx, req, identity).await
}

/// `Get-Document-Attributes`: every job in this service holds exactly one
/// document (§3, "Document"), so its attributes are synthesized from the
/// owning job rather than tracked separately.
#[instrument(skip(ctx, req, identity))]
pub async fn get_document_attributes(ctx: &Context, req: &IppRequestResponse, identity: Option<Identity>) -> Result<IppRequestResponse> {
    let (printer_id, job_id) = match dispatcher::resolve_target(ctx, req, false).await? {
        Target::Job(p, j) => (p, j),
        _ => return Err(InftError::MalformedRequest("Get-Document-Attributes requires a job target".into())),
    };
    let record = ctx.store.printer_by_id(printer_id).await?;
    let guard = record.read().await;
    let job = guard.jobs.get(&job_id).ok_or(InftError::JobNotFound(job_id.0))?;
    let _ = identity;

    let requested = requested_from(req);
    let mut resp = dispatcher::success_response(req.header().version, req.header().request_id);
    let fields = vec![
        ("document-number", IppValue::Integer(1)),
        ("document-format", IppValue::MimeMediaType(job.format.clone())),
        ("document-state", IppValue::Enum(job_state_code(job.state))),
        ("document-name", IppValue::NameWithoutLanguage(format!("job-{}-doc", job.id.0))),
        ("impressions-completed", IppValue::Integer(job.impressions_completed)),
    ];
    attrs_to_group(&mut resp, DelimiterTag::JobAttributes, fields, &requested);
    Ok(resp)
}

/// `Get-Documents`: since a job here carries at most one document, this
/// returns zero or one document-attributes group rather than a real list.
#[instrument(skip(ctx, req, identity))]
pub async fn get_documents(ctx: &Context, req: &IppRequestResponse, identity: Option<Identity>) -> Result<IppRequestResponse> {
    get_document_attributes(ctx, req, identity).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_state_code_round_trips_processing() {
        assert_eq!(job_state_code(JobState::Processing), 5);
    }

    #[test]
    fn printer_state_code_stopped_is_five() {
        assert_eq!(printer_state_code(PrinterState::Stopped), 5);
    }
}
