// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Output-device callbacks (§4.3.4, §4.6): the operations a proxy agent
// issues once it has registered a device and is fetching fetchable jobs.

use inftprint_core::attribute;
use inftprint_core::error::{InftError, Result};
use inftprint_core::model::{Device, JobId, JobState, PrinterId};
use inftprint_security::{access, Identity};
use ipp::attribute::IppAttribute;
use ipp::model::DelimiterTag;
use ipp::payload::IppPayload;
use ipp::request::IppRequestResponse;
use ipp::value::IppValue;
use tokio_util::compat::TokioAsyncReadCompatExt;
use tracing::instrument;

use crate::dispatcher::{self, Context, Target};
use crate::{events, lifecycle};

use super::requesting_user;

/// This service has no distinct `proxy` access-control group; a proxy
/// authenticates as a member of the configured operator group, the same
/// scope `Pause-Printer` and friends use.
fn require_proxy(identity: &Option<Identity>, ctx: &Context) -> Result<()> {
    access::authorize_user(identity.as_ref(), access::Scope::Operator, None, &ctx.config.admin_group, &ctx.config.operator_group)
}

fn output_device_uuid(req: &IppRequestResponse) -> Option<String> {
    attribute::first_value(req.attributes(), DelimiterTag::OperationAttributes, "output-device-uuid").and_then(attribute::as_text)
}

async fn require_job(ctx: &Context, req: &IppRequestResponse) -> Result<(PrinterId, JobId)> {
    match dispatcher::resolve_target(ctx, req, false).await? {
        Target::Job(p, j) => Ok((p, j)),
        _ => Err(InftError::MalformedRequest("operation requires a job target".into())),
    }
}

/// `Acknowledge-Job`: clears the `job-fetchable` reason a stopped job was
/// given at proxy hand-off (§4.7 path 2) and binds it to the acknowledging
/// device, resuming the job towards `processing`.
#[instrument(skip(ctx, req, identity))]
pub async fn acknowledge_job(ctx: &Context, req: &IppRequestResponse, identity: Option<Identity>) -> Result<IppRequestResponse> {
    require_proxy(&identity, ctx)?;
    let (printer_id, job_id) = require_job(ctx, req).await?;
    let device_uuid = output_device_uuid(req).ok_or_else(|| InftError::MalformedRequest("missing output-device-uuid".into()))?;

    let record = ctx.store.printer_by_id(printer_id).await?;
    {
        let mut guard = record.write().await;
        let job = guard.jobs.get_mut(&job_id).ok_or(InftError::JobNotFound(job_id.0))?;
        if !job.state_reasons.contains("job-fetchable") {
            return Err(InftError::NotPossible("job is not fetchable".into()));
        }
        job.device_uuid = Some(device_uuid);
        job.state_reasons.remove("job-fetchable");
        lifecycle::transition_job(job, JobState::Processing)?;
    }
    lifecycle::notify_job_state_changed(&ctx.store, printer_id, job_id, "job-state-changed").await;
    Ok(dispatcher::success_response(req.header().version, req.header().request_id))
}

/// `Acknowledge-Document`: confirms a fetched document was received
/// intact. Advisory only — the spool file already exists independent of
/// this acknowledgement.
#[instrument(skip(ctx, req, identity))]
pub async fn acknowledge_document(ctx: &Context, req: &IppRequestResponse, identity: Option<Identity>) -> Result<IppRequestResponse> {
    require_proxy(&identity, ctx)?;
    let (printer_id, job_id) = require_job(ctx, req).await?;
    let record = ctx.store.printer_by_id(printer_id).await?;
    record.write().await.jobs.get_mut(&job_id).ok_or(InftError::JobNotFound(job_id.0))?.state_reasons.remove("document-fetchable");
    Ok(dispatcher::success_response(req.header().version, req.header().request_id))
}

/// `Acknowledge-Identify-Printer`: clears the pending identify request a
/// proxy has just acted on.
#[instrument(skip(ctx, req, identity))]
pub async fn acknowledge_identify_printer(ctx: &Context, req: &IppRequestResponse, identity: Option<Identity>) -> Result<IppRequestResponse> {
    require_proxy(&identity, ctx)?;
    let printer_id = match dispatcher::resolve_target(ctx, req, false).await? {
        Target::Printer(id) => id,
        Target::Job(id, _) => id,
        Target::System => return Err(InftError::MalformedRequest("operation requires a printer target".into())),
    };
    let record = ctx.store.printer_by_id(printer_id).await?;
    record.write().await.printer.pending_identify = None;
    Ok(dispatcher::success_response(req.header().version, req.header().request_id))
}

/// `Fetch-Job`: returns the job-attributes group for a fetchable job the
/// acknowledging device owns.
#[instrument(skip(ctx, req, identity))]
pub async fn fetch_job(ctx: &Context, req: &IppRequestResponse, identity: Option<Identity>) -> Result<IppRequestResponse> {
    require_proxy(&identity, ctx)?;
    let (printer_id, job_id) = require_job(ctx, req).await?;
    let record = ctx.store.printer_by_id(printer_id).await?;
    let guard = record.read().await;
    let job = guard.jobs.get(&job_id).ok_or(InftError::JobNotFound(job_id.0))?;
    let path = guard.printer.resource_path.clone();

    let mut resp = dispatcher::success_response(req.header().version, req.header().request_id);
    let group = resp.attributes_mut();
    group.add(DelimiterTag::JobAttributes, IppAttribute::new(IppAttribute::JOB_ID, IppValue::Integer(job.id.0)));
    group.add(DelimiterTag::JobAttributes, IppAttribute::new(IppAttribute::JOB_URI, IppValue::Uri(format!("{path}/{}", job.id.0))));
    group.add(DelimiterTag::JobAttributes, IppAttribute::new("document-format", IppValue::MimeMediaType(job.format.clone())));
    Ok(resp)
}

/// `Fetch-Document`: streams the job's single spool file back to the
/// proxy. Format negotiation against `document-format-accepted` is not
/// implemented — the spool's native format is always returned, since this
/// service carries no transform path of its own (§1 Non-goal).
#[instrument(skip(ctx, req, identity))]
pub async fn fetch_document(ctx: &Context, req: IppRequestResponse, identity: Option<Identity>) -> Result<IppRequestResponse> {
    require_proxy(&identity, ctx)?;
    let (printer_id, job_id) = require_job(ctx, &req).await?;
    let version = req.header().version;
    let request_id = req.header().request_id;

    let (filename, format, expected_hash) = {
        let record = ctx.store.printer_by_id(printer_id).await?;
        let guard = record.read().await;
        let job = guard.jobs.get(&job_id).ok_or(InftError::JobNotFound(job_id.0))?;
        let filename = job.spool_filename.clone().ok_or_else(|| InftError::DocumentAccess("job has no spooled document".into()))?;
        (filename, job.format.clone(), job.spool_sha256.clone())
    };
    let path = ctx.config.spool_directory.join(printer_id.0.to_string()).join(&filename);

    if let Some(expected) = expected_hash {
        let bytes = tokio::fs::read(&path).await?;
        inftprint_security::integrity::verify_hash(&bytes, &expected)?;
    }
    let file = tokio::fs::File::open(&path).await?;

    let mut resp = dispatcher::success_response(version, request_id);
    resp.attributes_mut().add(DelimiterTag::OperationAttributes, IppAttribute::new("document-format", IppValue::MimeMediaType(format)));
    // `with_payload` is not exercised by any in-repo caller building an outbound
    // payload-bearing response; see DESIGN.md for the grounding this rests on.
    Ok(resp.with_payload(IppPayload::new_async(file.compat())))
}

/// `Update-Active-Jobs`: the device reports which job ids it still
/// considers active; this service answers with the subset it disagrees
/// with (jobs it no longer considers active), which the device should
/// cancel locally.
#[instrument(skip(ctx, req, identity))]
pub async fn update_active_jobs(ctx: &Context, req: &IppRequestResponse, identity: Option<Identity>) -> Result<IppRequestResponse> {
    require_proxy(&identity, ctx)?;
    let printer_id = match dispatcher::resolve_target(ctx, req, false).await? {
        Target::Printer(id) => id,
        Target::Job(id, _) => id,
        Target::System => return Err(InftError::MalformedRequest("operation requires a printer target".into())),
    };
    let reported: Vec<i32> = attribute::all_values(req.attributes(), DelimiterTag::OperationAttributes, "job-ids")
        .into_iter()
        .filter_map(attribute::as_i32)
        .collect();

    let record = ctx.store.printer_by_id(printer_id).await?;
    let active: std::collections::HashSet<i32> = record.read().await.printer.active_jobs.iter().map(|j| j.0).collect();
    let stale: Vec<IppValue> = reported.into_iter().filter(|id| !active.contains(id)).map(IppValue::Integer).collect();

    let mut resp = dispatcher::success_response(req.header().version, req.header().request_id);
    if !stale.is_empty() {
        resp.attributes_mut().add(DelimiterTag::OperationAttributes, IppAttribute::new("job-ids", IppValue::Array(stale)));
    }
    Ok(resp)
}

/// Returns `true` if the device reports the job as fully completed
/// (`output-device-job-state == 9`), which triggers the same finalization a
/// local transform command's exit would.
fn apply_job_status_attrs(job: &mut inftprint_core::model::Job, req: &IppRequestResponse) -> bool {
    if let Some(completed) = attribute::first_value(req.attributes(), DelimiterTag::OperationAttributes, "impressions-completed").and_then(attribute::as_i32) {
        job.impressions_completed = completed;
    }
    attribute::first_value(req.attributes(), DelimiterTag::OperationAttributes, "output-device-job-state")
        .and_then(attribute::as_i32)
        == Some(9)
}

/// `Update-Job-Status`: the device reports progress (impressions
/// completed, its own notion of job state) for a job it owns. A reported
/// `output-device-job-state` of `9` (completed) finalizes the job the same
/// way a local transform command's successful exit would.
#[instrument(skip(ctx, req, identity))]
pub async fn update_job_status(ctx: &Context, req: &IppRequestResponse, identity: Option<Identity>) -> Result<IppRequestResponse> {
    require_proxy(&identity, ctx)?;
    let (printer_id, job_id) = require_job(ctx, req).await?;
    let record = ctx.store.printer_by_id(printer_id).await?;
    let device_completed = {
        let mut guard = record.write().await;
        let job = guard.jobs.get_mut(&job_id).ok_or(InftError::JobNotFound(job_id.0))?;
        let completed = apply_job_status_attrs(job, req);
        if !job.impressions_consistent() {
            return Err(InftError::NotPossible("impressions-completed exceeds impressions".into()));
        }
        completed
    };
    events::publish(&ctx.store, events::event_mask::JOB_PROGRESS, events::Scope::Job(printer_id, job_id), "job-progress-changed", &requesting_user(req, &identity)).await;
    if device_completed {
        crate::job_processor::finish_job(&ctx.store, &ctx.config, printer_id, job_id).await;
    }
    Ok(dispatcher::success_response(req.header().version, req.header().request_id))
}

/// `Update-Document-Status`: per-document counterpart of
/// `Update-Job-Status`; since every job carries exactly one document, this
/// updates the same job-level impressions counter.
#[instrument(skip(ctx, req, identity))]
pub async fn update_document_status(ctx: &Context, req: &IppRequestResponse, identity: Option<Identity>) -> Result<IppRequestResponse> {
    update_job_status(ctx, req, identity).await
}

fn parse_sparse_index(name: &str) -> (&str, Option<(usize, usize)>) {
    let Some(dot) = name.rfind('.') else {
        return (name, None);
    };
    let (base, suffix) = (&name[..dot], &name[dot + 1..]);
    match suffix.split_once('-') {
        Some((lo, hi)) => match (lo.parse(), hi.parse()) {
            (Ok(lo), Ok(hi)) => (base, Some((lo, hi))),
            _ => (name, None),
        },
        None => match suffix.parse() {
            Ok(index) => (base, Some((index, index))),
            Err(_) => (name, None),
        },
    }
}

/// `Update-Output-Device-Attributes`: creates or updates the device named
/// by `output-device-uuid`, applying full-replacement or sparse `name.N` /
/// `name.N-M` indexed updates per attribute (§4.3.4), then refreshes the
/// printer's effective state.
#[instrument(skip(ctx, req, identity))]
pub async fn update_output_device_attributes(ctx: &Context, req: &IppRequestResponse, identity: Option<Identity>) -> Result<IppRequestResponse> {
    require_proxy(&identity, ctx)?;
    let printer_id = match dispatcher::resolve_target(ctx, req, false).await? {
        Target::Printer(id) => id,
        Target::Job(id, _) => id,
        Target::System => return Err(InftError::MalformedRequest("operation requires a printer target".into())),
    };
    let uuid = output_device_uuid(req).ok_or_else(|| InftError::MalformedRequest("missing output-device-uuid".into()))?;

    let mut device = ctx.store.device(&uuid).await.unwrap_or_else(|| Device::new(uuid.clone(), uuid.clone(), printer_id));
    let mut unsupported = Vec::new();

    for attr in req.attributes().groups_of(DelimiterTag::PrinterAttributes).flat_map(|g| g.attributes().values()) {
        let (base, index) = parse_sparse_index(attr.name());
        match base {
            "output-device-state" => {
                if let Some(code) = attribute::as_i32(attr.value()) {
                    device.state = match code {
                        4 => inftprint_core::model::PrinterState::Processing,
                        5 => inftprint_core::model::PrinterState::Stopped,
                        _ => inftprint_core::model::PrinterState::Idle,
                    };
                }
            }
            "output-device-state-reasons" => {
                device.state_reasons = attribute::all_values(req.attributes(), DelimiterTag::PrinterAttributes, "output-device-state-reasons")
                    .into_iter()
                    .filter_map(attribute::as_text)
                    .collect();
            }
            _ => {
                let values: Vec<String> = match attr.value() {
                    IppValue::Array(vs) => vs.iter().filter_map(attribute::as_text).collect(),
                    other => attribute::as_text(other).into_iter().collect(),
                };
                if values.is_empty() && !matches!(attr.value(), IppValue::Array(v) if v.is_empty()) {
                    unsupported.push(attr.clone());
                    continue;
                }
                device.splice_attribute(base, index, values);
            }
        }
    }

    ctx.store.upsert_device(device).await;
    let _ = lifecycle::effective_state(&ctx.store, printer_id).await;

    let mut resp = dispatcher::success_response(req.header().version, req.header().request_id);
    dispatcher::add_unsupported(&mut resp, unsupported);
    Ok(resp)
}

/// `Get-Output-Device-Attributes`: query counterpart for a proxy to read
/// back the device record it last pushed.
#[instrument(skip(ctx, req, identity))]
pub async fn get_output_device_attributes(ctx: &Context, req: &IppRequestResponse, identity: Option<Identity>) -> Result<IppRequestResponse> {
    require_proxy(&identity, ctx)?;
    let uuid = output_device_uuid(req).ok_or_else(|| InftError::MalformedRequest("missing output-device-uuid".into()))?;
    let device = ctx.store.device(&uuid).await.ok_or_else(|| InftError::DeviceNotFound(uuid.clone()))?;

    let mut resp = dispatcher::success_response(req.header().version, req.header().request_id);
    let group = resp.attributes_mut();
    group.add(DelimiterTag::PrinterAttributes, IppAttribute::new("output-device-uuid", IppValue::Uri(device.uuid.clone())));
    group.add(DelimiterTag::PrinterAttributes, IppAttribute::new("output-device-name", IppValue::NameWithoutLanguage(device.name.clone())));
    for (name, values) in &device.attributes {
        let value = if values.len() == 1 {
            IppValue::NameWithoutLanguage(values[0].clone())
        } else {
            IppValue::Array(values.iter().cloned().map(|v| IppValue::NameWithoutLanguage(v)).collect())
        };
        group.add(DelimiterTag::PrinterAttributes, IppAttribute::new(name.clone(), value));
    }
    Ok(resp)
}

/// `Deregister-Output-Device`: removes the device and refreshes the
/// printer's effective state.
#[instrument(skip(ctx, req, identity))]
pub async fn deregister_output_device(ctx: &Context, req: &IppRequestResponse, identity: Option<Identity>) -> Result<IppRequestResponse> {
    require_proxy(&identity, ctx)?;
    let printer_id = match dispatcher::resolve_target(ctx, req, false).await? {
        Target::Printer(id) => id,
        Target::Job(id, _) => id,
        Target::System => return Err(InftError::MalformedRequest("operation requires a printer target".into())),
    };
    let uuid = output_device_uuid(req).ok_or_else(|| InftError::MalformedRequest("missing output-device-uuid".into()))?;
    ctx.store.remove_device(&uuid).await.ok_or_else(|| InftError::DeviceNotFound(uuid.clone()))?;
    let _ = lifecycle::effective_state(&ctx.store, printer_id).await;
    Ok(dispatcher::success_response(req.header().version, req.header().request_id))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_sparse_index_plain_name_has_no_index() {
        assert_eq!(parse_sparse_index("marker-levels"), ("marker-levels", None));
    }

    #[test]
    fn parse_sparse_index_single_position() {
        assert_eq!(parse_sparse_index("marker-levels.2"), ("marker-levels", Some((2, 2))));
    }

    #[test]
    fn parse_sparse_index_range() {
        assert_eq!(parse_sparse_index("marker-levels.1-3"), ("marker-levels", Some((1, 3))));
    }
}
