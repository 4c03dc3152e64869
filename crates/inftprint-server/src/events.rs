// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Event Engine — fans a state change out to every subscription whose mask
// and scope match, then wakes anyone blocked in Get-Notifications.

use std::time::Duration;

use inftprint_core::model::{JobId, PrinterId, ResourceId, SubscriptionId};
use tracing::{debug, instrument};

use crate::store::Store;

/// How long `Get-Notifications` with `notify-wait=true` blocks before
/// returning empty, per the server's `notify-get-interval` hint.
pub const NOTIFY_WAIT_SECONDS: u64 = 30;

/// Event categories, matched against a subscription's `notify-events`
/// mask. Named after the RFC 3995 / PWG 5100.x keywords they stand in for.
#[allow(dead_code)]
pub mod event_mask {
    pub const JOB_COMPLETED: u32 = 1 << 0;
    pub const JOB_CONFIG_CHANGED: u32 = 1 << 1;
    pub const JOB_CREATED: u32 = 1 << 2;
    pub const JOB_PROGRESS: u32 = 1 << 3;
    pub const JOB_STATE_CHANGED: u32 = 1 << 4;
    pub const JOB_STOPPED: u32 = 1 << 5;
    pub const JOB_FETCHABLE: u32 = 1 << 6;
    pub const PRINTER_CONFIG_CHANGED: u32 = 1 << 7;
    pub const PRINTER_FINISHINGS_CHANGED: u32 = 1 << 8;
    pub const PRINTER_MEDIA_CHANGED: u32 = 1 << 9;
    pub const PRINTER_QUEUE_ORDER_CHANGED: u32 = 1 << 10;
    pub const PRINTER_RESTARTED: u32 = 1 << 11;
    pub const PRINTER_SHUTDOWN: u32 = 1 << 12;
    pub const PRINTER_STATE_CHANGED: u32 = 1 << 13;
    pub const PRINTER_STOPPED: u32 = 1 << 14;
    pub const DOCUMENT_CONFIG_CHANGED: u32 = 1 << 15;
    pub const DOCUMENT_STATE_CHANGED: u32 = 1 << 16;
    pub const RESOURCE_STATE_CHANGED: u32 = 1 << 17;
    pub const SYSTEM_CONFIG_CHANGED: u32 = 1 << 18;
    pub const SYSTEM_STATE_CHANGED: u32 = 1 << 19;

    /// Map a `notify-events` keyword to its mask bit, per the vocabulary
    /// this service recognizes. Unknown keywords contribute no bits, which
    /// is how an unsupported keyword is silently ignored rather than
    /// rejecting the whole subscription group.
    pub fn from_keyword(keyword: &str) -> u32 {
        match keyword {
            "job-completed" => JOB_COMPLETED,
            "job-config-changed" => JOB_CONFIG_CHANGED,
            "job-created" => JOB_CREATED,
            "job-progress" => JOB_PROGRESS,
            "job-state-changed" => JOB_STATE_CHANGED,
            "job-stopped" => JOB_STOPPED,
            "job-fetchable" => JOB_FETCHABLE,
            "printer-config-changed" => PRINTER_CONFIG_CHANGED,
            "printer-finishings-changed" => PRINTER_FINISHINGS_CHANGED,
            "printer-media-changed" => PRINTER_MEDIA_CHANGED,
            "printer-queue-order-changed" => PRINTER_QUEUE_ORDER_CHANGED,
            "printer-restarted" => PRINTER_RESTARTED,
            "printer-shutdown" => PRINTER_SHUTDOWN,
            "printer-state-changed" => PRINTER_STATE_CHANGED,
            "printer-stopped" => PRINTER_STOPPED,
            "document-config-changed" => DOCUMENT_CONFIG_CHANGED,
            "document-state-changed" => DOCUMENT_STATE_CHANGED,
            "resource-state-changed" => RESOURCE_STATE_CHANGED,
            "system-config-changed" => SYSTEM_CONFIG_CHANGED,
            "system-state-changed" => SYSTEM_STATE_CHANGED,
            _ => 0,
        }
    }

    /// Inverse of [`from_keyword`], used to echo `notify-events` back in a
    /// `Get-Subscription-Attributes` response.
    pub fn to_keywords(mask: u32) -> Vec<&'static str> {
        let table: &[(u32, &str)] = &[
            (JOB_COMPLETED, "job-completed"),
            (JOB_CONFIG_CHANGED, "job-config-changed"),
            (JOB_CREATED, "job-created"),
            (JOB_PROGRESS, "job-progress"),
            (JOB_STATE_CHANGED, "job-state-changed"),
            (JOB_STOPPED, "job-stopped"),
            (JOB_FETCHABLE, "job-fetchable"),
            (PRINTER_CONFIG_CHANGED, "printer-config-changed"),
            (PRINTER_FINISHINGS_CHANGED, "printer-finishings-changed"),
            (PRINTER_MEDIA_CHANGED, "printer-media-changed"),
            (PRINTER_QUEUE_ORDER_CHANGED, "printer-queue-order-changed"),
            (PRINTER_RESTARTED, "printer-restarted"),
            (PRINTER_SHUTDOWN, "printer-shutdown"),
            (PRINTER_STATE_CHANGED, "printer-state-changed"),
            (PRINTER_STOPPED, "printer-stopped"),
            (DOCUMENT_CONFIG_CHANGED, "document-config-changed"),
            (DOCUMENT_STATE_CHANGED, "document-state-changed"),
            (RESOURCE_STATE_CHANGED, "resource-state-changed"),
            (SYSTEM_CONFIG_CHANGED, "system-config-changed"),
            (SYSTEM_STATE_CHANGED, "system-state-changed"),
        ];
        table.iter().filter(|(bit, _)| mask & bit != 0).map(|(_, kw)| *kw).collect()
    }
}

/// The scope a notification concerns; used to find matching subscriptions
/// alongside the event-mask bit.
pub enum Scope {
    Job(PrinterId, JobId),
    Printer(PrinterId),
    Resource(ResourceId),
    System,
}

/// Publish `event_name` (e.g. `"job-completed"`) with human-readable `text`
/// to every subscription whose mask includes `event` and whose target
/// matches `scope`. Returns once every matching queue has the event and the
/// global notification condition has been signaled.
#[instrument(skip(store, text))]
pub async fn publish(store: &Store, event: u32, scope: Scope, event_name: &str, text: &str) {
    let subs = store.all_subscriptions().await;
    let mut matched = 0usize;
    let job_id = match scope {
        Scope::Job(_, job_id) => Some(job_id.0),
        _ => None,
    };

    for sub in subs {
        if sub.event_mask & event == 0 {
            continue;
        }
        if !scope_matches(&sub, &scope) {
            continue;
        }
        let capacity = crate::DEFAULT_SUBSCRIPTION_QUEUE_CAPACITY;
        let _ = store
            .with_subscription_mut(sub.id, |s| s.push_event(event_name, text, job_id, capacity))
            .await;
        matched += 1;
    }

    if matched > 0 {
        debug!(matched, event_name, "event published");
        store.notification.notify_waiters();
    }
}

fn scope_matches(sub: &inftprint_core::model::Subscription, scope: &Scope) -> bool {
    match scope {
        Scope::Job(printer_id, job_id) => {
            sub.job_id == Some(*job_id) || (sub.job_id.is_none() && sub.printer_id == Some(*printer_id))
        }
        Scope::Printer(printer_id) => sub.job_id.is_none() && sub.printer_id == Some(*printer_id),
        Scope::Resource(resource_id) => sub.resource_id == Some(*resource_id),
        Scope::System => sub.printer_id.is_none() && sub.job_id.is_none() && sub.resource_id.is_none(),
    }
}

/// Collect the events a `Get-Notifications` call for `id` should return,
/// given the client's last-seen sequence number.
pub async fn events_since(store: &Store, id: SubscriptionId, since: i64) -> inftprint_core::error::Result<Vec<inftprint_core::model::NotificationEvent>> {
    let sub = store.subscription(id).await?;
    let floor = since.max(sub.first_sequence);
    Ok(sub.events.iter().filter(|e| e.sequence >= floor).cloned().collect())
}

/// Block until either new events land on any subscription or the
/// 30-second bound elapses.
pub async fn wait_for_notification(store: &Store) {
    let _ = tokio::time::timeout(Duration::from_secs(NOTIFY_WAIT_SECONDS), store.notification.notified()).await;
}

/// Finalize every subscription whose lease has expired: deletes it and
/// frees its queued events. Intended to run on the same wake path as
/// `Get-Notifications`'s long-poll, never holding the registry lock across
/// this removal.
pub async fn sweep_expired_subscriptions(store: &Store, now: i64) {
    let subs = store.all_subscriptions().await;
    for sub in subs {
        if let Some(expire) = sub.lease_expire {
            if expire <= now {
                store.remove_subscription(sub.id).await;
                debug!(subscription_id = sub.id.0, "subscription lease expired");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use inftprint_core::model::{Printer, Subscription, SubscriptionId as SubId, SubscriptionLifecycle};
    use std::collections::VecDeque;

    fn sub_for_printer(id: i32, printer_id: PrinterId, mask: u32) -> Subscription {
        Subscription {
            id: SubId(id),
            uuid: "urn:uuid:test".into(),
            event_mask: mask,
            printer_id: Some(printer_id),
            job_id: None,
            resource_id: None,
            notify_charset: "utf-8".into(),
            notify_natural_language: "en".into(),
            notify_user_data: None,
            lease_expire: None,
            interval_seconds: 0,
            first_sequence: 1,
            last_sequence: 0,
            events: VecDeque::new(),
            owner: "alice".into(),
            lifecycle: SubscriptionLifecycle::Active,
            pending_delete: false,
        }
    }

    #[tokio::test]
    async fn publish_appends_to_matching_subscription() {
        let store = Store::new();
        let printer_id = store.allocate_printer_id();
        store.insert_printer(Printer::new(printer_id, "p1", "/ipp/print/p1", "urn:uuid:p1")).await;
        store
            .insert_subscription(sub_for_printer(1, printer_id, event_mask::PRINTER_STATE_CHANGED))
            .await;

        publish(
            &store,
            event_mask::PRINTER_STATE_CHANGED,
            Scope::Printer(printer_id),
            "printer-state-changed",
            "printer stopped",
        )
        .await;

        let events = events_since(&store, SubId(1), 0).await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_name, "printer-state-changed");
    }

    #[tokio::test]
    async fn publish_ignores_non_matching_mask() {
        let store = Store::new();
        let printer_id = store.allocate_printer_id();
        store.insert_printer(Printer::new(printer_id, "p1", "/ipp/print/p1", "urn:uuid:p1")).await;
        store
            .insert_subscription(sub_for_printer(1, printer_id, event_mask::JOB_COMPLETED))
            .await;

        publish(
            &store,
            event_mask::PRINTER_STATE_CHANGED,
            Scope::Printer(printer_id),
            "printer-state-changed",
            "printer stopped",
        )
        .await;

        let events = events_since(&store, SubId(1), 0).await.unwrap();
        assert!(events.is_empty());
    }

    #[test]
    fn keyword_mask_round_trips() {
        let mask = event_mask::from_keyword("job-completed") | event_mask::from_keyword("job-fetchable");
        let mut keywords = event_mask::to_keywords(mask);
        keywords.sort_unstable();
        assert_eq!(keywords, vec!["job-completed", "job-fetchable"]);
    }

    #[test]
    fn unknown_keyword_contributes_no_bits() {
        assert_eq!(event_mask::from_keyword("not-a-real-event"), 0);
    }

    #[tokio::test]
    async fn sweep_removes_expired_subscription() {
        let store = Store::new();
        let mut sub = sub_for_printer(1, PrinterId(1), 0);
        sub.lease_expire = Some(100);
        store.insert_subscription(sub).await;

        sweep_expired_subscriptions(&store, 200).await;

        assert!(store.subscription(SubId(1)).await.is_err());
    }
}
