// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// System-wide operations: Get/Set-System-Attributes, Get-System-Supported-
// Values, Restart-System, and the `-All-Printers` bulk printer-lifecycle
// operations.

use inftprint_core::attribute::{self, Requested};
use inftprint_core::error::Result;
use inftprint_security::{access, Identity};
use ipp::attribute::IppAttribute;
use ipp::model::DelimiterTag;
use ipp::request::IppRequestResponse;
use ipp::value::IppValue;
use tracing::instrument;

use crate::dispatcher::{self, Context};
use crate::lifecycle;

fn require_admin(identity: &Option<Identity>, ctx: &Context) -> Result<()> {
    access::authorize_user(identity.as_ref(), access::Scope::Admin, None, &ctx.config.admin_group, &ctx.config.operator_group)
}

fn requested_from(req: &IppRequestResponse) -> Requested {
    let values: Vec<IppValue> = attribute::all_values(req.attributes(), DelimiterTag::OperationAttributes, "requested-attributes")
        .into_iter()
        .cloned()
        .collect();
    Requested::from_values(&values)
}

/// `Get-System-Attributes`. This service's system object carries whatever
/// has been set via `Set-System-Attributes` plus a handful of computed
/// read-only values (config-change counter, a fixed idle `system-state`
/// since the system object itself never processes jobs).
#[instrument(skip(ctx, req, _identity))]
pub async fn get_system_attributes(ctx: &Context, req: &IppRequestResponse, _identity: Option<Identity>) -> Result<IppRequestResponse> {
    let requested = requested_from(req);
    let mut resp = dispatcher::success_response(req.header().version, req.header().request_id);
    let group = resp.attributes_mut();

    if requested.wants("system-state") {
        group.add(DelimiterTag::SystemAttributes, IppAttribute::new("system-state", IppValue::Enum(3)));
    }
    if requested.wants("system-state-reasons") {
        group.add(DelimiterTag::SystemAttributes, IppAttribute::new("system-state-reasons", IppValue::Keyword("none".to_string())));
    }
    if requested.wants("system-config-change-date-time") || requested.wants("all") {
        group.add(
            DelimiterTag::SystemAttributes,
            IppAttribute::new("system-config-change-date-time", IppValue::Integer(chrono::Utc::now().timestamp() as i32)),
        );
    }
    for name in ["system-name", "system-location", "system-geo-location", "system-contact-col"] {
        if requested.wants(name) {
            if let Some(value) = ctx.store.system_attribute(name).await {
                group.add(DelimiterTag::SystemAttributes, IppAttribute::new(name, IppValue::NameWithoutLanguage(value)));
            }
        }
    }
    Ok(resp)
}

/// `Set-System-Attributes`: admin-only. Values land in the process-wide
/// system attribute bag (§3, "System attribute bag"); any change bumps the
/// config-change counter the way printer/subscription membership changes
/// do.
#[instrument(skip(ctx, req, identity))]
pub async fn set_system_attributes(ctx: &Context, req: &IppRequestResponse, identity: Option<Identity>) -> Result<IppRequestResponse> {
    require_admin(&identity, ctx)?;
    for attr in req.attributes().groups_of(DelimiterTag::SystemAttributes).flat_map(|g| g.attributes().values()) {
        if let Some(text) = attribute::as_text(attr.value()) {
            ctx.store.set_system_attribute(attr.name().to_string(), text).await;
        }
    }
    Ok(dispatcher::success_response(req.header().version, req.header().request_id))
}

/// `Get-System-Supported-Values`: the static capability set this system
/// object advertises, independent of any individual printer.
#[instrument(skip(ctx, req, _identity))]
pub async fn get_system_supported_values(ctx: &Context, req: &IppRequestResponse, _identity: Option<Identity>) -> Result<IppRequestResponse> {
    let _ = ctx;
    let requested = requested_from(req);
    let mut resp = dispatcher::success_response(req.header().version, req.header().request_id);
    let group = resp.attributes_mut();
    if requested.wants("charset-supported") {
        group.add(DelimiterTag::SystemAttributes, IppAttribute::new("charset-supported", IppValue::Charset("utf-8".to_string())));
    }
    if requested.wants("natural-language-supported") {
        group.add(DelimiterTag::SystemAttributes, IppAttribute::new("natural-language-supported", IppValue::NaturalLanguage("en".to_string())));
    }
    if requested.wants("ipp-features-supported") {
        group.add(DelimiterTag::SystemAttributes, IppAttribute::new("ipp-features-supported", IppValue::Keyword("infrastructure-printer".to_string())));
    }
    Ok(resp)
}

/// `Restart-System`: admin-only. There is no process to actually restart in
/// this architecture (printers and subscriptions live in the same process
/// as the listener); this simply bumps the config-change counter so
/// pollers observe a generation change, matching the source's behavior of
/// re-reading configuration without dropping connections.
#[instrument(skip(ctx, req, identity))]
pub async fn restart_system(ctx: &Context, req: &IppRequestResponse, identity: Option<Identity>) -> Result<IppRequestResponse> {
    require_admin(&identity, ctx)?;
    ctx.store.bump_config_change();
    Ok(dispatcher::success_response(req.header().version, req.header().request_id))
}

async fn for_each_printer<F, Fut>(ctx: &Context, f: F) -> Result<()>
where
    F: Fn(crate::store::Store, inftprint_core::model::PrinterId) -> Fut,
    Fut: std::future::Future<Output = Result<()>>,
{
    for record in ctx.store.all_printers().await {
        let printer_id = record.read().await.printer.id;
        f(ctx.store.clone(), printer_id).await?;
    }
    Ok(())
}

/// `Pause-All-Printers` / `Resume-All-Printers` / `Enable-All-Printers` /
/// `Disable-All-Printers` / `Shutdown-All-Printers` / `Startup-All-Printers`:
/// operator (pause/resume/enable/disable) or admin (shutdown/startup)
/// bulk variants of the single-printer operations in §4.6.
#[instrument(skip(ctx, req, identity))]
pub async fn pause_all_printers(ctx: &Context, req: &IppRequestResponse, identity: Option<Identity>) -> Result<IppRequestResponse> {
    access::authorize_user(identity.as_ref(), access::Scope::Operator, None, &ctx.config.admin_group, &ctx.config.operator_group)?;
    for_each_printer(ctx, |store, id| async move { lifecycle::pause_printer(&store, id).await }).await?;
    Ok(dispatcher::success_response(req.header().version, req.header().request_id))
}

#[instrument(skip(ctx, req, identity))]
pub async fn resume_all_printers(ctx: &Context, req: &IppRequestResponse, identity: Option<Identity>) -> Result<IppRequestResponse> {
    access::authorize_user(identity.as_ref(), access::Scope::Operator, None, &ctx.config.admin_group, &ctx.config.operator_group)?;
    for_each_printer(ctx, |store, id| async move { lifecycle::resume_printer(&store, id).await }).await?;
    Ok(dispatcher::success_response(req.header().version, req.header().request_id))
}

#[instrument(skip(ctx, req, identity))]
pub async fn enable_all_printers(ctx: &Context, req: &IppRequestResponse, identity: Option<Identity>) -> Result<IppRequestResponse> {
    resume_all_printers(ctx, req, identity).await
}

#[instrument(skip(ctx, req, identity))]
pub async fn disable_all_printers(ctx: &Context, req: &IppRequestResponse, identity: Option<Identity>) -> Result<IppRequestResponse> {
    pause_all_printers(ctx, req, identity).await
}

#[instrument(skip(ctx, req, identity))]
pub async fn shutdown_all_printers(ctx: &Context, req: &IppRequestResponse, identity: Option<Identity>) -> Result<IppRequestResponse> {
    require_admin(&identity, ctx)?;
    for record in ctx.store.all_printers().await {
        record.write().await.printer.is_shutdown = true;
    }
    Ok(dispatcher::success_response(req.header().version, req.header().request_id))
}

#[instrument(skip(ctx, req, identity))]
pub async fn startup_all_printers(ctx: &Context, req: &IppRequestResponse, identity: Option<Identity>) -> Result<IppRequestResponse> {
    require_admin(&identity, ctx)?;
    for record in ctx.store.all_printers().await {
        record.write().await.printer.is_shutdown = false;
    }
    Ok(dispatcher::success_response(req.header().version, req.header().request_id))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_context() -> Context {
        Context {
            store: crate::store::Store::new(),
            config: std::sync::Arc::new(inftprint_core::config::ServerConfig::default()),
            audit: std::sync::Arc::new(inftprint_security::AuditLog::open_in_memory().unwrap()),
        }
    }

    #[test]
    fn restart_requires_admin() {
        assert!(require_admin(&None, &test_context()).is_err());
    }
}
