// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Printer lifecycle: Create-Printer, Delete-Printer, Pause/Resume-Printer,
// Hold/Release-Held-New-Jobs, Identify-Printer, Shutdown/Startup-Printer.

use inftprint_core::attribute;
use inftprint_core::error::{InftError, Result};
use inftprint_core::model::{IdentifyRequest, Printer, PrinterId};
use inftprint_security::{access, Identity};
use ipp::attribute::IppAttribute;
use ipp::model::DelimiterTag;
use ipp::request::IppRequestResponse;
use ipp::value::IppValue;
use tracing::instrument;

use crate::dispatcher::{self, Context, Target};
use crate::lifecycle;

async fn require_printer(ctx: &Context, req: &IppRequestResponse) -> Result<PrinterId> {
    require_printer_allow_shutdown(ctx, req, false).await
}

/// As [`require_printer`], but for `Startup-Printer`, the one operation a
/// shut-down printer must still accept.
async fn require_printer_allow_shutdown(ctx: &Context, req: &IppRequestResponse, allow_shutdown: bool) -> Result<PrinterId> {
    match dispatcher::resolve_target(ctx, req, allow_shutdown).await? {
        Target::Printer(id) => Ok(id),
        Target::Job(id, _) => Ok(id),
        Target::System => Err(InftError::MalformedRequest("operation requires a printer target".into())),
    }
}

fn require_admin(identity: &Option<Identity>, ctx: &Context) -> Result<()> {
    access::authorize_user(identity.as_ref(), access::Scope::Admin, None, &ctx.config.admin_group, &ctx.config.operator_group)
}

fn require_operator(identity: &Option<Identity>, ctx: &Context) -> Result<()> {
    access::authorize_user(identity.as_ref(), access::Scope::Operator, None, &ctx.config.admin_group, &ctx.config.operator_group)
}

/// `Create-Printer`: materializes a new printer under a generated resource
/// path; unlike the printers enumerated at startup, these live only for the
/// life of the process.
#[instrument(skip(ctx, req, identity))]
pub async fn create_printer(ctx: &Context, req: &IppRequestResponse, identity: Option<Identity>) -> Result<IppRequestResponse> {
    require_admin(&identity, ctx)?;
    let attrs = req.attributes();
    let name = attribute::first_value(attrs, DelimiterTag::OperationAttributes, "printer-name")
        .and_then(attribute::as_text)
        .ok_or_else(|| InftError::MalformedRequest("missing printer-name".into()))?;

    let id = ctx.store.allocate_printer_id();
    let path = format!("/ipp/print/{}", id.0);
    let uuid = format!("urn:uuid:printer-{}", id.0);
    let printer = Printer::new(id, name, path.clone(), uuid);
    ctx.store.insert_printer(printer).await;

    let mut resp = dispatcher::success_response(req.header().version, req.header().request_id);
    let group = resp.attributes_mut();
    group.add(DelimiterTag::PrinterAttributes, IppAttribute::new(IppAttribute::PRINTER_URI_SUPPORTED, IppValue::Uri(path)));
    Ok(resp)
}

/// `Delete-Printer`: Admin-only. Deletion may be deferred while a job is
/// processing, in which case the printer remains visible with a
/// `deleting` state reason until the worker finishes.
#[instrument(skip(ctx, req, identity))]
pub async fn delete_printer(ctx: &Context, req: &IppRequestResponse, identity: Option<Identity>) -> Result<IppRequestResponse> {
    require_admin(&identity, ctx)?;
    let printer_id = require_printer(ctx, req).await?;
    lifecycle::delete_printer(&ctx.store, printer_id).await?;
    Ok(dispatcher::success_response(req.header().version, req.header().request_id))
}

#[instrument(skip(ctx, req, identity))]
pub async fn pause_printer(ctx: &Context, req: &IppRequestResponse, identity: Option<Identity>) -> Result<IppRequestResponse> {
    require_operator(&identity, ctx)?;
    let printer_id = require_printer(ctx, req).await?;
    lifecycle::pause_printer(&ctx.store, printer_id).await?;
    lifecycle::notify_printer_state_changed(&ctx.store, printer_id, "printer-stopped").await;
    Ok(dispatcher::success_response(req.header().version, req.header().request_id))
}

#[instrument(skip(ctx, req, identity))]
pub async fn resume_printer(ctx: &Context, req: &IppRequestResponse, identity: Option<Identity>) -> Result<IppRequestResponse> {
    require_operator(&identity, ctx)?;
    let printer_id = require_printer(ctx, req).await?;
    lifecycle::resume_printer(&ctx.store, printer_id).await?;
    lifecycle::notify_printer_state_changed(&ctx.store, printer_id, "printer-restarted").await;
    crate::job_processor::check_and_dispatch(&ctx.store, &ctx.config, printer_id).await;
    Ok(dispatcher::success_response(req.header().version, req.header().request_id))
}

#[instrument(skip(ctx, req, identity))]
pub async fn hold_new_jobs(ctx: &Context, req: &IppRequestResponse, identity: Option<Identity>) -> Result<IppRequestResponse> {
    require_operator(&identity, ctx)?;
    let printer_id = require_printer(ctx, req).await?;
    lifecycle::hold_new_jobs(&ctx.store, printer_id).await?;
    Ok(dispatcher::success_response(req.header().version, req.header().request_id))
}

#[instrument(skip(ctx, req, identity))]
pub async fn release_held_new_jobs(ctx: &Context, req: &IppRequestResponse, identity: Option<Identity>) -> Result<IppRequestResponse> {
    require_operator(&identity, ctx)?;
    let printer_id = require_printer(ctx, req).await?;
    lifecycle::release_held_new_jobs(&ctx.store, printer_id).await?;
    crate::job_processor::check_and_dispatch(&ctx.store, &ctx.config, printer_id).await;
    Ok(dispatcher::success_response(req.header().version, req.header().request_id))
}

/// `Shutdown-Printer`/`Startup-Printer`: a harder stop than pause/resume —
/// a shut-down printer refuses new jobs outright rather than merely
/// queuing them.
#[instrument(skip(ctx, req, identity))]
pub async fn shutdown_printer(ctx: &Context, req: &IppRequestResponse, identity: Option<Identity>) -> Result<IppRequestResponse> {
    require_admin(&identity, ctx)?;
    let printer_id = require_printer(ctx, req).await?;
    let record = ctx.store.printer_by_id(printer_id).await?;
    record.write().await.printer.is_shutdown = true;
    lifecycle::notify_printer_state_changed(&ctx.store, printer_id, "printer-shutdown").await;
    Ok(dispatcher::success_response(req.header().version, req.header().request_id))
}

#[instrument(skip(ctx, req, identity))]
pub async fn startup_printer(ctx: &Context, req: &IppRequestResponse, identity: Option<Identity>) -> Result<IppRequestResponse> {
    require_admin(&identity, ctx)?;
    let printer_id = require_printer_allow_shutdown(ctx, req, true).await?;
    let record = ctx.store.printer_by_id(printer_id).await?;
    record.write().await.printer.is_shutdown = false;
    lifecycle::notify_printer_state_changed(&ctx.store, printer_id, "printer-restarted").await;
    crate::job_processor::check_and_dispatch(&ctx.store, &ctx.config, printer_id).await;
    Ok(dispatcher::success_response(req.header().version, req.header().request_id))
}

/// `Identify-Printer`: records the requested actions (and optional message)
/// for the next worker tick or proxy poll to act on; this service has no
/// physical indicator of its own, so the request is otherwise a no-op.
#[instrument(skip(ctx, req, identity))]
pub async fn identify_printer(ctx: &Context, req: &IppRequestResponse, identity: Option<Identity>) -> Result<IppRequestResponse> {
    require_operator(&identity, ctx)?;
    let printer_id = require_printer(ctx, req).await?;
    let attrs = req.attributes();
    let actions: std::collections::HashSet<String> =
        attribute::all_values(attrs, DelimiterTag::OperationAttributes, "identify-actions")
            .into_iter()
            .filter_map(attribute::as_text)
            .collect();
    let actions = if actions.is_empty() { std::collections::HashSet::from(["flash".to_string()]) } else { actions };
    let message = attribute::first_value(attrs, DelimiterTag::OperationAttributes, "message").and_then(attribute::as_text);

    let record = ctx.store.printer_by_id(printer_id).await?;
    record.write().await.printer.pending_identify = Some(IdentifyRequest { actions, message });
    Ok(dispatcher::success_response(req.header().version, req.header().request_id))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn require_admin_rejects_anonymous() {
        let config = std::sync::Arc::new(inftprint_core::config::ServerConfig::default());
        assert!(require_admin(&None, &test_context(config)).is_err());
    }

    fn test_context(config: std::sync::Arc<inftprint_core::config::ServerConfig>) -> Context {
        Context {
            store: crate::store::Store::new(),
            config,
            audit: std::sync::Arc::new(inftprint_security::AuditLog::open_in_memory().unwrap()),
        }
    }
}
