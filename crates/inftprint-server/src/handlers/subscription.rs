// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Subscription lifecycle (§4.3.3) and the Get-Notifications long-poll
// (§4.4): create/renew/cancel/get plus the pull-mode delivery path.

use std::collections::VecDeque;

use inftprint_core::attribute;
use inftprint_core::error::{InftError, Result};
use inftprint_core::model::{Subscription, SubscriptionId, SubscriptionLifecycle};
use inftprint_security::{access, Identity};
use ipp::attribute::IppAttribute;
use ipp::model::{DelimiterTag, StatusCode};
use ipp::request::IppRequestResponse;
use ipp::value::IppValue;
use tracing::instrument;

use crate::dispatcher::{self, Context, Target};
use crate::events;

use super::requesting_user;

/// Maximum `notify-lease-duration`, per RFC 3995: `2^26 - 1` seconds.
const MAX_LEASE_SECONDS: i64 = (1 << 26) - 1;

fn now_epoch() -> i64 {
    chrono::Utc::now().timestamp()
}

fn lease_remaining(sub: &Subscription, now: i64) -> i32 {
    match sub.lease_expire {
        None => 0,
        Some(expire) => (expire - now).max(0) as i32,
    }
}

fn can_see(identity: &Option<Identity>, sub: &Subscription, ctx: &Context) -> Result<()> {
    access::authorize_user(
        identity.as_ref(),
        access::Scope::Owner,
        Some(&sub.owner),
        &ctx.config.admin_group,
        &ctx.config.operator_group,
    )
}

fn subscription_group(resp: &mut IppRequestResponse, sub: &Subscription, now: i64) {
    let group = resp.attributes_mut();
    group.add(
        DelimiterTag::SubscriptionAttributes,
        IppAttribute::new("notify-subscription-id", IppValue::Integer(sub.id.0)),
    );
    group.add(
        DelimiterTag::SubscriptionAttributes,
        IppAttribute::new("notify-lease-duration", IppValue::Integer(lease_remaining(sub, now))),
    );
    group.add(
        DelimiterTag::SubscriptionAttributes,
        IppAttribute::new("notify-pull-method", IppValue::Keyword("ippget".to_string())),
    );
    let keywords = events::event_mask::to_keywords(sub.event_mask);
    let events_value = if keywords.is_empty() {
        IppValue::Keyword("none".to_string())
    } else if keywords.len() == 1 {
        IppValue::Keyword(keywords[0].to_string())
    } else {
        IppValue::Array(keywords.into_iter().map(|k| IppValue::Keyword(k.to_string())).collect())
    };
    group.add(DelimiterTag::SubscriptionAttributes, IppAttribute::new("notify-events", events_value));
    group.add(
        DelimiterTag::SubscriptionAttributes,
        IppAttribute::new("notify-subscriber-user-name", IppValue::NameWithoutLanguage(sub.owner.clone())),
    );
}

/// `Create-Printer-Subscriptions` / `Create-Job-Subscriptions` /
/// `Create-System-Subscriptions`: one subscription attempt per
/// `subscription-attributes` group in the request. Only pull-mode
/// (`notify-pull-method = ippget`) is accepted.
#[instrument(skip(ctx, req, identity))]
pub async fn create_subscriptions(ctx: &Context, req: &IppRequestResponse, identity: Option<Identity>) -> Result<IppRequestResponse> {
    let target = dispatcher::resolve_target(ctx, req, false).await?;
    let (printer_id, job_id) = match target {
        Target::Printer(p) => (Some(p), None),
        Target::Job(p, j) => (Some(p), Some(j)),
        Target::System => (None, None),
    };
    let owner = requesting_user(req, &identity);
    let now = now_epoch();

    let attrs = req.attributes();
    let groups: Vec<_> = attrs.groups_of(DelimiterTag::SubscriptionAttributes).collect();
    if groups.is_empty() {
        return Err(InftError::MalformedRequest("missing subscription-attributes group".into()));
    }

    let total = groups.len();
    let mut accepted: Vec<Subscription> = Vec::new();

    for group in &groups {
        let values: Vec<&IppAttribute> = group.attributes().values().into_iter().collect();

        let pull_method = values
            .iter()
            .find(|a| a.name() == "notify-pull-method")
            .and_then(|a| attribute::as_text(a.value()));
        if pull_method.as_deref() != Some("ippget") {
            continue;
        }

        let mask = values
            .iter()
            .find(|a| a.name() == "notify-events")
            .map(|a| match a.value() {
                IppValue::Array(vs) => vs.iter().filter_map(attribute::as_text).fold(0u32, |acc, kw| acc | events::event_mask::from_keyword(&kw)),
                other => attribute::as_text(other).map(|kw| events::event_mask::from_keyword(&kw)).unwrap_or(0),
            })
            .unwrap_or(0);

        let lease_requested = values
            .iter()
            .find(|a| a.name() == "notify-lease-duration")
            .and_then(|a| attribute::as_i32(a.value()))
            .map(|v| v as i64)
            .unwrap_or(ctx.config.default_lease_seconds);
        let lease_seconds = lease_requested.clamp(0, MAX_LEASE_SECONDS);

        let charset = values
            .iter()
            .find(|a| a.name() == "notify-charset")
            .and_then(|a| attribute::as_text(a.value()))
            .unwrap_or_else(|| "utf-8".to_string());
        let natural_language = values
            .iter()
            .find(|a| a.name() == "notify-natural-language")
            .and_then(|a| attribute::as_text(a.value()))
            .unwrap_or_else(|| "en".to_string());

        let id = ctx.store.allocate_subscription_id();
        let sub = Subscription {
            id,
            uuid: format!("urn:uuid:subscription-{}", id.0),
            event_mask: mask,
            printer_id,
            job_id,
            resource_id: None,
            notify_charset: charset,
            notify_natural_language: natural_language,
            notify_user_data: None,
            lease_expire: if lease_seconds == 0 { None } else { Some(now + lease_seconds) },
            interval_seconds: 0,
            first_sequence: 1,
            last_sequence: 0,
            events: VecDeque::new(),
            owner: owner.clone(),
            lifecycle: SubscriptionLifecycle::Active,
            pending_delete: false,
        };
        ctx.store.insert_subscription(sub.clone()).await;
        accepted.push(sub);
    }

    let created = accepted.len();
    let status = if created == 0 {
        StatusCode::ClientErrorIgnoredAllSubscriptions
    } else if created < total {
        StatusCode::SuccessfulOkIgnoredSubscriptions
    } else {
        StatusCode::SuccessfulOk
    };

    let mut resp = IppRequestResponse::new_response(req.header().version, status, req.header().request_id);
    for sub in &accepted {
        subscription_group(&mut resp, sub, now);
    }
    Ok(resp)
}

fn requested_subscription_id(req: &IppRequestResponse) -> Result<SubscriptionId> {
    attribute::first_value(req.attributes(), DelimiterTag::OperationAttributes, "notify-subscription-id")
        .and_then(attribute::as_i32)
        .map(SubscriptionId)
        .ok_or_else(|| InftError::MalformedRequest("missing notify-subscription-id".into()))
}

#[instrument(skip(ctx, req, identity))]
pub async fn get_subscription_attributes(ctx: &Context, req: &IppRequestResponse, identity: Option<Identity>) -> Result<IppRequestResponse> {
    let id = requested_subscription_id(req)?;
    let sub = ctx.store.subscription(id).await?;
    can_see(&identity, &sub, ctx)?;

    let mut resp = dispatcher::success_response(req.header().version, req.header().request_id);
    subscription_group(&mut resp, &sub, now_epoch());
    Ok(resp)
}

/// `Get-Subscriptions`: subscriptions targeting the resolved printer/job,
/// restricted to the caller's own unless they hold operator/admin.
#[instrument(skip(ctx, req, identity))]
pub async fn get_subscriptions(ctx: &Context, req: &IppRequestResponse, identity: Option<Identity>) -> Result<IppRequestResponse> {
    let target = dispatcher::resolve_target(ctx, req, false).await?;
    let user = requesting_user(req, &identity);
    let is_operator = access::authorize_user(identity.as_ref(), access::Scope::Operator, None, &ctx.config.admin_group, &ctx.config.operator_group).is_ok();
    let now = now_epoch();

    let mut resp = dispatcher::success_response(req.header().version, req.header().request_id);
    for sub in ctx.store.all_subscriptions().await {
        let matches_target = match target {
            Target::Printer(p) => sub.printer_id == Some(p) && sub.job_id.is_none(),
            Target::Job(p, j) => sub.printer_id == Some(p) && sub.job_id == Some(j),
            Target::System => sub.printer_id.is_none() && sub.job_id.is_none(),
        };
        if !matches_target {
            continue;
        }
        if !is_operator && sub.owner != user {
            continue;
        }
        subscription_group(&mut resp, &sub, now);
    }
    Ok(resp)
}

/// `Renew-Subscription`. Job-scoped subscriptions cannot be renewed.
#[instrument(skip(ctx, req, identity))]
pub async fn renew_subscription(ctx: &Context, req: &IppRequestResponse, identity: Option<Identity>) -> Result<IppRequestResponse> {
    let id = requested_subscription_id(req)?;
    let sub = ctx.store.subscription(id).await?;
    can_see(&identity, &sub, ctx)?;
    if !sub.is_renewable() {
        return Err(InftError::NotPossible("job-scoped subscriptions cannot be renewed".into()));
    }

    let lease_requested = attribute::first_value(req.attributes(), DelimiterTag::OperationAttributes, "notify-lease-duration")
        .and_then(attribute::as_i32)
        .map(|v| v as i64)
        .unwrap_or(ctx.config.default_lease_seconds);
    let lease_seconds = lease_requested.clamp(0, MAX_LEASE_SECONDS);
    let now = now_epoch();

    let updated = ctx
        .store
        .with_subscription_mut(id, |s| {
            s.lease_expire = if lease_seconds == 0 { None } else { Some(now + lease_seconds) };
            s.clone()
        })
        .await?;

    let mut resp = dispatcher::success_response(req.header().version, req.header().request_id);
    subscription_group(&mut resp, &updated, now);
    Ok(resp)
}

/// `Cancel-Subscription`: removes the subscription and frees its queue.
#[instrument(skip(ctx, req, identity))]
pub async fn cancel_subscription(ctx: &Context, req: &IppRequestResponse, identity: Option<Identity>) -> Result<IppRequestResponse> {
    let id = requested_subscription_id(req)?;
    let sub = ctx.store.subscription(id).await?;
    can_see(&identity, &sub, ctx)?;
    ctx.store.remove_subscription(id).await;
    Ok(dispatcher::success_response(req.header().version, req.header().request_id))
}

fn sequence_for(req: &IppRequestResponse, index: usize) -> i64 {
    attribute::all_values(req.attributes(), DelimiterTag::OperationAttributes, "notify-sequence-numbers")
        .get(index)
        .and_then(|v| attribute::as_i32(v))
        .unwrap_or(0) as i64
}

/// `Get-Notifications`: collects events for one or more subscriptions,
/// optionally blocking up to 30s (`notify-wait=true`) when none are ready
/// yet.
#[instrument(skip(ctx, req, identity))]
pub async fn get_notifications(ctx: &Context, req: &IppRequestResponse, identity: Option<Identity>) -> Result<IppRequestResponse> {
    let ids: Vec<SubscriptionId> = attribute::all_values(req.attributes(), DelimiterTag::OperationAttributes, "notify-subscription-ids")
        .into_iter()
        .filter_map(attribute::as_i32)
        .map(SubscriptionId)
        .collect();
    if ids.is_empty() {
        return Err(InftError::MalformedRequest("missing notify-subscription-ids".into()));
    }
    let wait = attribute::first_value(req.attributes(), DelimiterTag::OperationAttributes, "notify-wait")
        .and_then(attribute::as_bool)
        .unwrap_or(false);

    for (idx, id) in ids.iter().enumerate() {
        let sub = ctx.store.subscription(*id).await?;
        can_see(&identity, &sub, ctx)?;
        let _ = idx;
    }

    let mut collected = collect_events(ctx, &ids, req).await?;
    if collected.is_empty() && wait {
        events::wait_for_notification(&ctx.store).await;
        collected = collect_events(ctx, &ids, req).await?;
    }

    let mut resp = dispatcher::success_response(req.header().version, req.header().request_id);
    for (sub_id, event) in &collected {
        let group = resp.attributes_mut();
        group.add(
            DelimiterTag::EventNotificationAttributes,
            IppAttribute::new("notify-subscription-id", IppValue::Integer(sub_id.0)),
        );
        group.add(
            DelimiterTag::EventNotificationAttributes,
            IppAttribute::new("notify-sequence-number", IppValue::Integer(event.sequence as i32)),
        );
        group.add(
            DelimiterTag::EventNotificationAttributes,
            IppAttribute::new("notify-subscribed-event", IppValue::Keyword(event.event_name.clone())),
        );
        group.add(
            DelimiterTag::EventNotificationAttributes,
            IppAttribute::new("notify-text", IppValue::TextWithoutLanguage(event.text.clone())),
        );
        if let Some(job_id) = event.job_id {
            group.add(
                DelimiterTag::EventNotificationAttributes,
                IppAttribute::new("notify-job-id", IppValue::Integer(job_id)),
            );
        }
    }
    resp.attributes_mut().add(
        DelimiterTag::OperationAttributes,
        IppAttribute::new("notify-get-interval", IppValue::Integer(events::NOTIFY_WAIT_SECONDS as i32)),
    );
    Ok(resp)
}

async fn collect_events(
    ctx: &Context,
    ids: &[SubscriptionId],
    req: &IppRequestResponse,
) -> Result<Vec<(SubscriptionId, inftprint_core::model::NotificationEvent)>> {
    let mut out = Vec::new();
    for (idx, id) in ids.iter().enumerate() {
        let since = sequence_for(req, idx);
        for event in events::events_since(&ctx.store, *id, since).await? {
            out.push((*id, event));
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lease_remaining_clamps_to_zero_past_expiry() {
        let sub = test_subscription(Some(100));
        assert_eq!(lease_remaining(&sub, 200), 0);
    }

    #[test]
    fn lease_remaining_counts_down_before_expiry() {
        let sub = test_subscription(Some(200));
        assert_eq!(lease_remaining(&sub, 100), 100);
    }

    #[test]
    fn never_expiring_lease_reports_zero_duration() {
        let sub = test_subscription(None);
        assert_eq!(lease_remaining(&sub, 0), 0);
    }

    fn test_subscription(lease_expire: Option<i64>) -> Subscription {
        Subscription {
            id: SubscriptionId(1),
            uuid: "urn:uuid:test".into(),
            event_mask: 0,
            printer_id: None,
            job_id: None,
            resource_id: None,
            notify_charset: "utf-8".into(),
            notify_natural_language: "en".into(),
            notify_user_data: None,
            lease_expire,
            interval_seconds: 0,
            first_sequence: 1,
            last_sequence: 0,
            events: VecDeque::new(),
            owner: "alice".into(),
            lifecycle: SubscriptionLifecycle::Active,
            pending_delete: false,
        }
    }
}
