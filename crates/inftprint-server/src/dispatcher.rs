// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Operation Dispatcher — validates the request envelope, resolves the
// target object, and routes to the handler for one of the roughly seventy
// operations this service implements.

use std::sync::Arc;

use inftprint_core::config::ServerConfig;
use inftprint_core::error::{InftError, Result};
use inftprint_core::model::{JobId, PrinterId};
use inftprint_security::{AuditLog, Identity};
use ipp::attribute::{IppAttribute, IppAttributes};
use ipp::model::{DelimiterTag, Operation, StatusCode};
use ipp::request::IppRequestResponse;
use ipp::value::IppValue;
use tracing::{instrument, warn};

use crate::handlers;
use crate::store::Store;

/// Shared service context threaded through every handler.
#[derive(Clone)]
pub struct Context {
    pub store: Store,
    pub config: Arc<ServerConfig>,
    pub audit: Arc<AuditLog>,
}

/// The object an operation targets, resolved from its URI (and, for a job,
/// either the path's trailing segment or a `job-id` operation attribute).
pub enum Target {
    System,
    Printer(PrinterId),
    Job(PrinterId, JobId),
}

/// Wire order of group tags per RFC 8010 §3.5.1 / PWG 5100.x extensions,
/// used to enforce rule 4 below. Unrecognized tags sort last rather than
/// rejecting a request over a tag this service doesn't otherwise handle.
fn group_tag_rank(tag: DelimiterTag) -> u8 {
    match tag {
        DelimiterTag::OperationAttributes => 0x01,
        DelimiterTag::JobAttributes => 0x02,
        DelimiterTag::PrinterAttributes => 0x04,
        DelimiterTag::UnsupportedAttributes => 0x05,
        DelimiterTag::SubscriptionAttributes => 0x06,
        DelimiterTag::EventNotificationAttributes => 0x07,
        DelimiterTag::SystemAttributes => 0x0B,
        _ => 0xFF,
    }
}

/// Validate the envelope per RFC 8011 §4.1 framing rules this service
/// enforces: supported version, positive request-id, at least one
/// attribute, monotonic group ordering, the first-three-operation-
/// attributes rule (relaxable per config), and a supported charset.
pub fn validate_envelope(req: &IppRequestResponse, relaxed: bool) -> Result<()> {
    let major = (req.header().version.0 >> 8) as u8;
    if !(1..=2).contains(&major) {
        return Err(InftError::VersionNotSupported);
    }
    if req.header().request_id == 0 {
        return Err(InftError::MalformedRequest("request-id must be positive".into()));
    }
    let groups = req.attributes().groups();
    if groups.is_empty() {
        return Err(InftError::MalformedRequest("no attribute groups present".into()));
    }

    let mut last_rank = 0u8;
    for group in groups {
        let rank = group_tag_rank(group.tag());
        if rank < last_rank {
            return Err(InftError::MalformedRequest("attribute groups are not monotonic in group-tag".into()));
        }
        last_rank = rank;
    }

    let operation_attrs: Vec<&IppAttribute> = req
        .attributes()
        .groups_of(DelimiterTag::OperationAttributes)
        .flat_map(|g| g.attributes().values())
        .collect();
    let first_three: Vec<&str> = operation_attrs.iter().take(3).map(|a| a.name()).collect();
    if first_three.first() != Some(&IppAttribute::ATTRIBUTES_CHARSET) || first_three.get(1) != Some(&IppAttribute::ATTRIBUTES_NATURAL_LANGUAGE) {
        return Err(InftError::MalformedRequest("attributes-charset/attributes-natural-language must be first".into()));
    }
    let target_names = ["printer-uri", "job-uri", "system-uri"];
    if relaxed {
        if !operation_attrs.iter().any(|a| target_names.contains(&a.name())) {
            return Err(InftError::MalformedRequest("missing target URI attribute".into()));
        }
    } else if !first_three.get(2).is_some_and(|name| target_names.contains(name)) {
        return Err(InftError::MalformedRequest("target URI attribute must be third".into()));
    }

    let charset = inftprint_core::attribute::first_value(
        req.attributes(),
        DelimiterTag::OperationAttributes,
        "attributes-charset",
    )
    .and_then(inftprint_core::attribute::as_text);

    match charset.as_deref() {
        Some("us-ascii") | Some("utf-8") => Ok(()),
        Some(other) => Err(InftError::MalformedRequest(format!("unsupported charset {other}"))),
        None => Err(InftError::MalformedRequest("missing attributes-charset".into())),
    }
}

/// Resolve the operation's target from its `printer-uri` / `job-uri` /
/// `system-uri` attribute (and `job-id`, when present) into a concrete
/// object reference.
///
/// A shut-down printer is unreachable for every operation except
/// `Startup-Printer`, which resolves its own target with
/// `allow_shutdown = true` so it can bring the printer back up.
#[instrument(skip(ctx, req))]
pub async fn resolve_target(ctx: &Context, req: &IppRequestResponse, allow_shutdown: bool) -> Result<Target> {
    let attrs = req.attributes();
    for name in ["printer-uri", "job-uri", "system-uri"] {
        let Some(value) = inftprint_core::attribute::first_value(attrs, DelimiterTag::OperationAttributes, name) else {
            continue;
        };
        let Some(uri) = inftprint_core::attribute::as_text(value) else {
            continue;
        };
        let path = resource_path(&uri);

        if path == "/ipp/system" {
            return Ok(Target::System);
        }

        if name == "job-uri" {
            if let Some((printer_path, job_id)) = split_job_path(&path) {
                let record = ctx.store.printer_by_path(&printer_path).await?;
                let guard = record.read().await;
                if guard.printer.is_shutdown && !allow_shutdown {
                    return Err(InftError::ServiceUnavailable("printer is shut down".into()));
                }
                let printer_id = guard.printer.id;
                return Ok(Target::Job(printer_id, JobId(job_id)));
            }
        }

        let record = match ctx.store.printer_by_path(&path).await {
            Ok(r) => r,
            Err(_) => continue,
        };
        let guard = record.read().await;
        if guard.printer.is_shutdown && !allow_shutdown {
            return Err(InftError::ServiceUnavailable("printer is shut down".into()));
        }
        let printer_id = guard.printer.id;

        if let Some(job_id) = inftprint_core::attribute::first_value(attrs, DelimiterTag::OperationAttributes, "job-id")
            .and_then(inftprint_core::attribute::as_i32)
        {
            return Ok(Target::Job(printer_id, JobId(job_id)));
        }
        return Ok(Target::Printer(printer_id));
    }

    Err(InftError::MalformedRequest("missing target URI attribute".into()))
}

fn resource_path(uri: &str) -> String {
    match uri.find("://") {
        Some(idx) => {
            let rest = &uri[idx + 3..];
            match rest.find('/') {
                Some(slash) => rest[slash..].to_string(),
                None => "/".to_string(),
            }
        }
        None => uri.to_string(),
    }
}

fn split_job_path(path: &str) -> Option<(String, i32)> {
    let idx = path.rfind('/')?;
    let job_id: i32 = path[idx + 1..].parse().ok()?;
    Some((path[..idx].to_string(), job_id))
}

/// Dispatch a validated request to its operation handler, converting any
/// error into a well-formed IPP error response so the process never
/// terminates because of a bad request.
#[instrument(skip(ctx, req, identity), fields(op = req.header().operation_or_status))]
pub async fn dispatch(ctx: &Context, req: IppRequestResponse, identity: Option<Identity>) -> IppRequestResponse {
    let version = req.header().version;
    let request_id = req.header().request_id;

    let result = dispatch_result(ctx, req, identity).await;

    match result {
        Ok(resp) => resp,
        Err(err) => {
            warn!(error = %err, "operation failed");
            error_response(version, request_id, err)
        }
    }
}

/// As [`dispatch`], but surfaces the error instead of folding it into an IPP
/// response. The HTTP layer needs this distinction: `AuthenticationRequired`
/// and `Forbidden` are answered with an HTTP status and no IPP body, while
/// every other error is carried as an IPP status inside a `200 OK` response.
pub async fn dispatch_result(ctx: &Context, req: IppRequestResponse, identity: Option<Identity>) -> Result<IppRequestResponse> {
    run(ctx, req, identity).await
}

/// Operation codes this service recognizes, beyond what `ipp::model::Operation`
/// models directly: subscription, system-service and output-device operations
/// from the notifications and infrastructure-printer extensions.
mod opcode {
    pub const CANCEL_CURRENT_JOB: u16 = 0x002D;
    pub const CANCEL_JOBS: u16 = 0x0038;
    pub const CANCEL_MY_JOBS: u16 = 0x0039;
    pub const CLOSE_JOB: u16 = 0x003B;
    pub const HOLD_NEW_JOBS: u16 = 0x0025;
    pub const RELEASE_HELD_NEW_JOBS: u16 = 0x0026;
    pub const IDENTIFY_PRINTER: u16 = 0x003C;
    pub const VALIDATE_DOCUMENT: u16 = 0x0040;

    pub const CREATE_PRINTER_SUBSCRIPTIONS: u16 = 0x0016;
    pub const CREATE_JOB_SUBSCRIPTIONS: u16 = 0x0017;
    pub const GET_SUBSCRIPTION_ATTRIBUTES: u16 = 0x0018;
    pub const GET_SUBSCRIPTIONS: u16 = 0x0019;
    pub const RENEW_SUBSCRIPTION: u16 = 0x001A;
    pub const CANCEL_SUBSCRIPTION: u16 = 0x001B;
    pub const GET_NOTIFICATIONS: u16 = 0x001C;

    pub const ENABLE_PRINTER: u16 = 0x0022;
    pub const DISABLE_PRINTER: u16 = 0x0023;
    pub const SHUTDOWN_PRINTER: u16 = 0x002A;
    pub const STARTUP_PRINTER: u16 = 0x002B;

    pub const ACKNOWLEDGE_DOCUMENT: u16 = 0x003F;
    pub const ACKNOWLEDGE_IDENTIFY_PRINTER: u16 = 0x0041;
    pub const ACKNOWLEDGE_JOB: u16 = 0x0042;
    pub const FETCH_DOCUMENT: u16 = 0x0043;
    pub const FETCH_JOB: u16 = 0x0044;
    pub const UPDATE_ACTIVE_JOBS: u16 = 0x0045;
    pub const DEREGISTER_OUTPUT_DEVICE: u16 = 0x0046;
    pub const UPDATE_DOCUMENT_STATUS: u16 = 0x0047;
    pub const UPDATE_JOB_STATUS: u16 = 0x0048;
    pub const UPDATE_OUTPUT_DEVICE_ATTRIBUTES: u16 = 0x0049;
    pub const GET_OUTPUT_DEVICE_ATTRIBUTES: u16 = 0x004B;

    pub const CREATE_PRINTER: u16 = 0x004C;
    pub const DELETE_PRINTER: u16 = 0x004E;
    pub const GET_PRINTERS: u16 = 0x004F;
    pub const CREATE_SYSTEM_SUBSCRIPTIONS: u16 = 0x004A;
    pub const PAUSE_ALL_PRINTERS: u16 = 0x0050;
    pub const RESUME_ALL_PRINTERS: u16 = 0x0051;
    pub const ENABLE_ALL_PRINTERS: u16 = 0x0052;
    pub const DISABLE_ALL_PRINTERS: u16 = 0x0053;
    pub const SHUTDOWN_ALL_PRINTERS: u16 = 0x0057;
    pub const STARTUP_ALL_PRINTERS: u16 = 0x0058;
    pub const GET_SYSTEM_SUPPORTED_VALUES: u16 = 0x0059;
    pub const SET_SYSTEM_ATTRIBUTES: u16 = 0x0055;
    pub const RESTART_SYSTEM: u16 = 0x0056;
    pub const GET_SYSTEM_ATTRIBUTES: u16 = 0x005B;
    pub const GET_PRINTER_SUPPORTED_VALUES: u16 = 0x0013;
    pub const GET_DOCUMENT_ATTRIBUTES: u16 = 0x0030;
    pub const GET_DOCUMENTS: u16 = 0x0031;
}

async fn run(ctx: &Context, req: IppRequestResponse, identity: Option<Identity>) -> Result<IppRequestResponse> {
    validate_envelope(&req, ctx.config.relaxed_envelope_validation)?;

    let code = req.header().operation_or_status;

    if let Some(operation) = Operation::from_u16(code) {
        use Operation::*;
        match operation {
            PrintJob => return handlers::job::print_job(ctx, req, identity).await,
            PrintUri => return handlers::job::print_uri(ctx, req, identity).await,
            ValidateJob => return handlers::job::validate_job(ctx, &req, identity).await,
            CreateJob => return handlers::job::create_job(ctx, &req, identity).await,
            SendDocument => return handlers::job::send_document(ctx, req, identity).await,
            SendUri => return handlers::job::send_uri(ctx, &req, identity).await,
            CancelJob => return handlers::job::cancel_job(ctx, &req, identity).await,
            HoldJob => return handlers::job::hold_job(ctx, &req, identity).await,
            ReleaseJob => return handlers::job::release_job(ctx, &req, identity).await,
            GetJobAttributes => return handlers::query::get_job_attributes(ctx, &req, identity).await,
            GetJobs => return handlers::query::get_jobs(ctx, &req, identity).await,
            GetPrinterAttributes => return handlers::query::get_printer_attributes(ctx, &req, identity).await,
            PausePrinter => return handlers::printer::pause_printer(ctx, &req, identity).await,
            ResumePrinter => return handlers::printer::resume_printer(ctx, &req, identity).await,
            _ => {}
        }
    }

    match code {
        opcode::CANCEL_CURRENT_JOB => handlers::job::cancel_job(ctx, &req, identity).await,
        opcode::CANCEL_JOBS => handlers::job::cancel_jobs(ctx, &req, identity, false).await,
        opcode::CANCEL_MY_JOBS => handlers::job::cancel_jobs(ctx, &req, identity, true).await,
        opcode::CLOSE_JOB => handlers::job::close_job(ctx, &req, identity).await,
        opcode::HOLD_NEW_JOBS => handlers::printer::hold_new_jobs(ctx, &req, identity).await,
        opcode::RELEASE_HELD_NEW_JOBS => handlers::printer::release_held_new_jobs(ctx, &req, identity).await,
        opcode::IDENTIFY_PRINTER => handlers::printer::identify_printer(ctx, &req, identity).await,
        opcode::VALIDATE_DOCUMENT => handlers::job::validate_job(ctx, &req, identity).await,

        opcode::CREATE_PRINTER_SUBSCRIPTIONS | opcode::CREATE_JOB_SUBSCRIPTIONS => {
            handlers::subscription::create_subscriptions(ctx, &req, identity).await
        }
        opcode::GET_SUBSCRIPTION_ATTRIBUTES => handlers::subscription::get_subscription_attributes(ctx, &req, identity).await,
        opcode::GET_SUBSCRIPTIONS => handlers::subscription::get_subscriptions(ctx, &req, identity).await,
        opcode::RENEW_SUBSCRIPTION => handlers::subscription::renew_subscription(ctx, &req, identity).await,
        opcode::CANCEL_SUBSCRIPTION => handlers::subscription::cancel_subscription(ctx, &req, identity).await,
        opcode::GET_NOTIFICATIONS => handlers::subscription::get_notifications(ctx, &req, identity).await,

        opcode::ENABLE_PRINTER => handlers::printer::resume_printer(ctx, &req, identity).await,
        opcode::DISABLE_PRINTER => handlers::printer::pause_printer(ctx, &req, identity).await,
        opcode::SHUTDOWN_PRINTER => handlers::printer::shutdown_printer(ctx, &req, identity).await,
        opcode::STARTUP_PRINTER => handlers::printer::startup_printer(ctx, &req, identity).await,

        opcode::ACKNOWLEDGE_DOCUMENT => handlers::proxy::acknowledge_document(ctx, &req, identity).await,
        opcode::ACKNOWLEDGE_IDENTIFY_PRINTER => handlers::proxy::acknowledge_identify_printer(ctx, &req, identity).await,
        opcode::ACKNOWLEDGE_JOB => handlers::proxy::acknowledge_job(ctx, &req, identity).await,
        opcode::FETCH_DOCUMENT => handlers::proxy::fetch_document(ctx, req, identity).await,
        opcode::FETCH_JOB => handlers::proxy::fetch_job(ctx, &req, identity).await,
        opcode::UPDATE_ACTIVE_JOBS => handlers::proxy::update_active_jobs(ctx, &req, identity).await,
        opcode::DEREGISTER_OUTPUT_DEVICE => handlers::proxy::deregister_output_device(ctx, &req, identity).await,
        opcode::UPDATE_DOCUMENT_STATUS => handlers::proxy::update_document_status(ctx, &req, identity).await,
        opcode::UPDATE_JOB_STATUS => handlers::proxy::update_job_status(ctx, &req, identity).await,
        opcode::UPDATE_OUTPUT_DEVICE_ATTRIBUTES => handlers::proxy::update_output_device_attributes(ctx, &req, identity).await,
        opcode::GET_OUTPUT_DEVICE_ATTRIBUTES => handlers::proxy::get_output_device_attributes(ctx, &req, identity).await,

        opcode::CREATE_PRINTER => handlers::printer::create_printer(ctx, &req, identity).await,
        opcode::DELETE_PRINTER => handlers::printer::delete_printer(ctx, &req, identity).await,
        opcode::GET_PRINTERS => handlers::query::get_printers(ctx, &req, identity).await,
        opcode::GET_PRINTER_SUPPORTED_VALUES => handlers::query::get_printer_supported_values(ctx, &req, identity).await,
        opcode::GET_DOCUMENT_ATTRIBUTES => handlers::query::get_document_attributes(ctx, &req, identity).await,
        opcode::GET_DOCUMENTS => handlers::query::get_documents(ctx, &req, identity).await,

        opcode::CREATE_SYSTEM_SUBSCRIPTIONS => handlers::subscription::create_subscriptions(ctx, &req, identity).await,
        opcode::PAUSE_ALL_PRINTERS => handlers::system::pause_all_printers(ctx, &req, identity).await,
        opcode::RESUME_ALL_PRINTERS => handlers::system::resume_all_printers(ctx, &req, identity).await,
        opcode::ENABLE_ALL_PRINTERS => handlers::system::enable_all_printers(ctx, &req, identity).await,
        opcode::DISABLE_ALL_PRINTERS => handlers::system::disable_all_printers(ctx, &req, identity).await,
        opcode::SHUTDOWN_ALL_PRINTERS => handlers::system::shutdown_all_printers(ctx, &req, identity).await,
        opcode::STARTUP_ALL_PRINTERS => handlers::system::startup_all_printers(ctx, &req, identity).await,
        opcode::GET_SYSTEM_SUPPORTED_VALUES => handlers::system::get_system_supported_values(ctx, &req, identity).await,
        opcode::SET_SYSTEM_ATTRIBUTES => handlers::system::set_system_attributes(ctx, &req, identity).await,
        opcode::RESTART_SYSTEM => handlers::system::restart_system(ctx, &req, identity).await,
        opcode::GET_SYSTEM_ATTRIBUTES => handlers::system::get_system_attributes(ctx, &req, identity).await,

        other => Err(InftError::OperationNotSupported(format!("0x{other:04X}"))),
    }
}

/// Build an IPP error response carrying `err`'s status code and a
/// `status-message` text attribute.
pub fn error_response(version: ipp::model::IppVersion, request_id: u32, err: InftError) -> IppRequestResponse {
    let mut resp = IppRequestResponse::new_response(version, err.status_code(), request_id);
    resp.attributes_mut().add(
        DelimiterTag::OperationAttributes,
        IppAttribute::new(IppAttribute::STATUS_MESSAGE, IppValue::TextWithoutLanguage(err.to_string())),
    );
    resp
}

/// Build a bare successful-ok response, used by handlers that have nothing
/// else to add.
pub fn success_response(version: ipp::model::IppVersion, request_id: u32) -> IppRequestResponse {
    IppRequestResponse::new_response(version, StatusCode::SuccessfulOk, request_id)
}

/// Copy an offending attribute into the response's `unsupported` group.
pub fn add_unsupported(resp: &mut IppRequestResponse, attrs: Vec<IppAttribute>) {
    for attr in attrs {
        resp.attributes_mut().add(DelimiterTag::UnsupportedAttributes, attr);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resource_path_strips_scheme_and_host() {
        assert_eq!(resource_path("ipp://printhost:631/ipp/print/p1"), "/ipp/print/p1");
    }

    #[test]
    fn resource_path_handles_bare_path() {
        assert_eq!(resource_path("/ipp/system"), "/ipp/system");
    }

    #[test]
    fn split_job_path_extracts_id() {
        let (printer_path, job_id) = split_job_path("/ipp/print/p1/42").unwrap();
        assert_eq!(printer_path, "/ipp/print/p1");
        assert_eq!(job_id, 42);
    }
}
