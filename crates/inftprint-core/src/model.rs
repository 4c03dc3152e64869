// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Process-wide data model: Printer, Job, Subscription, Device, Resource and
// their state machines, independent of wire representation.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

/// Bitset of printer state-reasons. Stored as a set of keywords rather than
/// a fixed-width bitfield since the reason vocabulary is open-ended per
/// RFC 8011 (`printer-state-reasons` permits vendor extensions).
pub type StateReasons = HashSet<String>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PrinterState {
    Idle,
    Processing,
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobState {
    Pending,
    Held,
    Processing,
    Stopped,
    Canceled,
    Aborted,
    Completed,
}

impl JobState {
    /// Jobs in these states still occupy the active-jobs index.
    pub fn is_active(self) -> bool {
        matches!(
            self,
            JobState::Pending | JobState::Held | JobState::Processing | JobState::Stopped
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Canceled | JobState::Aborted | JobState::Completed)
    }

    /// Whether `self -> next` is a legal edge in the job state machine.
    pub fn can_transition_to(self, next: JobState) -> bool {
        use JobState::*;
        matches!(
            (self, next),
            (Pending, Held)
                | (Pending, Processing)
                | (Pending, Canceled)
                | (Pending, Aborted)
                | (Held, Pending)
                | (Held, Canceled)
                | (Held, Aborted)
                | (Processing, Stopped)
                | (Processing, Canceled)
                | (Processing, Aborted)
                | (Processing, Completed)
                | (Stopped, Processing)
                | (Stopped, Canceled)
                | (Stopped, Aborted)
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SubscriptionLifecycle {
    Active,
    Expired,
    Canceled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResourceState {
    Pending,
    Available,
    Installed,
    Canceled,
    Aborted,
}

impl ResourceState {
    pub fn is_terminal(self) -> bool {
        matches!(self, ResourceState::Canceled | ResourceState::Aborted)
    }
}

/// A job's hold-until time: either an absolute epoch second, or indefinite.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HoldUntil {
    Indefinite,
    At(i64),
}

/// Process-local integer id, distinct kinds kept separate so a job id can
/// never be compared against a printer id by accident.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PrinterId(pub i32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct JobId(pub i32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SubscriptionId(pub i32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResourceId(pub i32);

#[derive(Debug, Clone)]
pub struct Printer {
    pub id: PrinterId,
    pub name: String,
    pub resource_path: String,
    pub uuid: String,
    pub state: PrinterState,
    pub state_reasons: StateReasons,
    pub is_accepting_jobs: bool,
    pub is_shutdown: bool,
    pub is_deleted: bool,
    pub next_job_id: i32,
    pub jobs: Vec<JobId>,
    pub active_jobs: Vec<JobId>,
    pub completed_jobs: Vec<JobId>,
    pub processing_job: Option<JobId>,
    pub devices: HashSet<String>,
    pub pending_identify: Option<IdentifyRequest>,
    /// External command the Job Processor spawns per job; `None` means no
    /// local transform path is configured for this printer.
    pub local_command: Option<String>,
    /// When set, the Job Processor always hands jobs to a registered output
    /// device instead of running `local_command`.
    pub proxy_mode: bool,
}

#[derive(Debug, Clone)]
pub struct IdentifyRequest {
    pub actions: HashSet<String>,
    pub message: Option<String>,
}

impl Printer {
    pub fn new(id: PrinterId, name: impl Into<String>, resource_path: impl Into<String>, uuid: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            resource_path: resource_path.into(),
            uuid: uuid.into(),
            state: PrinterState::Idle,
            state_reasons: StateReasons::new(),
            is_accepting_jobs: true,
            is_shutdown: false,
            is_deleted: false,
            next_job_id: 1,
            jobs: Vec::new(),
            active_jobs: Vec::new(),
            completed_jobs: Vec::new(),
            processing_job: None,
            devices: HashSet::new(),
            pending_identify: None,
            local_command: None,
            proxy_mode: false,
        }
    }

    /// Effective state is the max of the printer's own state and its
    /// devices' reported states, where `Stopped > Processing > Idle`.
    pub fn effective_state(&self, device_states: &[PrinterState]) -> PrinterState {
        device_states.iter().fold(self.state, |acc, &s| max_state(acc, s))
    }

    pub fn allocate_job_id(&mut self) -> i32 {
        let id = self.next_job_id;
        self.next_job_id += 1;
        id
    }
}

fn max_state(a: PrinterState, b: PrinterState) -> PrinterState {
    fn rank(s: PrinterState) -> u8 {
        match s {
            PrinterState::Idle => 0,
            PrinterState::Processing => 1,
            PrinterState::Stopped => 2,
        }
    }
    if rank(a) >= rank(b) { a } else { b }
}

#[derive(Debug, Clone)]
pub struct Job {
    pub id: JobId,
    pub printer_id: PrinterId,
    pub uuid: String,
    pub originating_user: String,
    pub format: String,
    pub priority: i32,
    pub hold_until: HoldUntil,
    pub state: JobState,
    pub state_reasons: StateReasons,
    pub impressions: Option<i32>,
    pub impressions_completed: i32,
    pub device_uuid: Option<String>,
    pub device_state: Option<PrinterState>,
    pub device_state_reasons: StateReasons,
    pub spool_filename: Option<String>,
    /// SHA-256 hex digest of the spooled document, computed once the
    /// document is fully written. `Fetch-Document` recomputes and compares
    /// this before streaming, so a spool file corrupted on disk is caught
    /// rather than handed to an output device.
    pub spool_sha256: Option<String>,
    pub cancel_requested: bool,
    pub created_at: i64,
    pub processing_at: Option<i64>,
    pub completed_at: Option<i64>,
}

impl Job {
    /// True only while the job may still be handed to a device, per the
    /// invariant that `device_uuid` is set at most once.
    pub fn may_assign_device(&self) -> bool {
        self.device_uuid.is_none()
            && matches!(self.state, JobState::Pending | JobState::Held | JobState::Processing)
    }

    pub fn impressions_consistent(&self) -> bool {
        match self.impressions {
            Some(total) => self.impressions_completed <= total,
            None => true,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Subscription {
    pub id: SubscriptionId,
    pub uuid: String,
    pub event_mask: u32,
    pub printer_id: Option<PrinterId>,
    pub job_id: Option<JobId>,
    pub resource_id: Option<ResourceId>,
    pub notify_charset: String,
    pub notify_natural_language: String,
    pub notify_user_data: Option<Vec<u8>>,
    pub lease_expire: Option<i64>,
    pub interval_seconds: i32,
    pub first_sequence: i64,
    pub last_sequence: i64,
    pub events: std::collections::VecDeque<NotificationEvent>,
    pub owner: String,
    pub lifecycle: SubscriptionLifecycle,
    pub pending_delete: bool,
}

#[derive(Debug, Clone)]
pub struct NotificationEvent {
    pub sequence: i64,
    pub event_name: String,
    pub text: String,
    /// The job an event concerns, when it was published with a job scope.
    /// `None` for printer/resource/system-scoped events.
    pub job_id: Option<i32>,
}

impl Subscription {
    /// Job-scoped subscriptions (created implicitly via `Create-Job`'s
    /// `notify-events` attribute) are single-shot and cannot be renewed.
    pub fn is_renewable(&self) -> bool {
        self.job_id.is_none()
    }

    /// Append an event, trimming the oldest entries once `capacity` is
    /// exceeded and advancing `first_sequence` by the trimmed count.
    pub fn push_event(&mut self, event_name: impl Into<String>, text: impl Into<String>, job_id: Option<i32>, capacity: usize) {
        self.last_sequence += 1;
        self.events.push_back(NotificationEvent {
            sequence: self.last_sequence,
            event_name: event_name.into(),
            text: text.into(),
            job_id,
        });
        while self.events.len() > capacity {
            self.events.pop_front();
            self.first_sequence += 1;
        }
        if self.events.is_empty() {
            self.first_sequence = self.last_sequence + 1;
        }
    }
}

/// A proxy-registered output device. `attributes` is the generic bag a
/// proxy populates via `Update-Output-Device-Attributes` (marker levels,
/// supply levels, and anything else beyond the state fields tracked
/// directly), keyed by attribute name to its (possibly multi-valued)
/// string representation.
#[derive(Debug, Clone)]
pub struct Device {
    pub name: String,
    pub uuid: String,
    pub printer_id: PrinterId,
    pub state: PrinterState,
    pub state_reasons: StateReasons,
    pub attributes: std::collections::HashMap<String, Vec<String>>,
}

impl Device {
    pub fn new(name: impl Into<String>, uuid: impl Into<String>, printer_id: PrinterId) -> Self {
        Self {
            name: name.into(),
            uuid: uuid.into(),
            printer_id,
            state: PrinterState::Idle,
            state_reasons: StateReasons::new(),
            attributes: std::collections::HashMap::new(),
        }
    }

    /// Apply a full-replacement or sparse indexed update to `attributes`.
    /// `index` of `None` replaces the whole (possibly multi-valued)
    /// attribute; `Some((lo, hi))` splices `values` into the existing
    /// vector at `[lo, hi]` inclusive, growing the vector if needed.
    /// `values` empty with an index present deletes that range.
    pub fn splice_attribute(&mut self, name: &str, index: Option<(usize, usize)>, values: Vec<String>) {
        match index {
            None => {
                if values.is_empty() {
                    self.attributes.remove(name);
                } else {
                    self.attributes.insert(name.to_string(), values);
                }
            }
            Some((lo, hi)) => {
                let existing = self.attributes.entry(name.to_string()).or_default();
                if existing.len() <= hi {
                    existing.resize(hi + 1, String::new());
                }
                existing.splice(lo..=hi, values);
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct Resource {
    pub id: ResourceId,
    pub uuid: String,
    pub external_path: Option<String>,
    pub local_filename: Option<String>,
    pub mime_type: Option<String>,
    pub state: ResourceState,
    pub use_count: u32,
}

impl Resource {
    pub fn new(id: ResourceId, uuid: impl Into<String>) -> Self {
        Self {
            id,
            uuid: uuid.into(),
            external_path: None,
            local_filename: None,
            mime_type: None,
            state: ResourceState::Pending,
            use_count: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_state_pending_to_processing_allowed() {
        assert!(JobState::Pending.can_transition_to(JobState::Processing));
    }

    #[test]
    fn job_state_completed_is_terminal_dead_end() {
        assert!(JobState::Completed.is_terminal());
        assert!(!JobState::Completed.can_transition_to(JobState::Pending));
    }

    #[test]
    fn subscription_queue_trims_and_advances_first_sequence() {
        let mut sub = Subscription {
            id: SubscriptionId(1),
            uuid: "urn:uuid:test".into(),
            event_mask: 0,
            printer_id: None,
            job_id: None,
            resource_id: None,
            notify_charset: "utf-8".into(),
            notify_natural_language: "en".into(),
            notify_user_data: None,
            lease_expire: None,
            interval_seconds: 0,
            first_sequence: 1,
            last_sequence: 0,
            events: std::collections::VecDeque::new(),
            owner: "alice".into(),
            lifecycle: SubscriptionLifecycle::Active,
            pending_delete: false,
        };
        for i in 0..5 {
            sub.push_event("job-state-changed", format!("event {i}"), None, 3);
        }
        assert_eq!(sub.events.len(), 3);
        assert_eq!(sub.last_sequence - sub.first_sequence + 1, 3);
    }

    #[test]
    fn device_splice_attribute_replaces_whole_value() {
        let mut device = Device::new("dev1", "urn:uuid:dev1", PrinterId(1));
        device.splice_attribute("marker-levels", None, vec!["50".to_string(), "60".to_string()]);
        assert_eq!(device.attributes["marker-levels"], vec!["50", "60"]);
    }

    #[test]
    fn device_splice_attribute_indexed_range_updates_in_place() {
        let mut device = Device::new("dev1", "urn:uuid:dev1", PrinterId(1));
        device.splice_attribute("marker-levels", None, vec!["50".to_string(), "60".to_string(), "70".to_string()]);
        device.splice_attribute("marker-levels", Some((1, 1)), vec!["99".to_string()]);
        assert_eq!(device.attributes["marker-levels"], vec!["50", "99", "70"]);
    }

    #[test]
    fn job_scoped_subscription_not_renewable() {
        let sub = Subscription {
            id: SubscriptionId(1),
            uuid: "urn:uuid:test".into(),
            event_mask: 0,
            printer_id: None,
            job_id: Some(JobId(4)),
            resource_id: None,
            notify_charset: "utf-8".into(),
            notify_natural_language: "en".into(),
            notify_user_data: None,
            lease_expire: None,
            interval_seconds: 0,
            first_sequence: 1,
            last_sequence: 0,
            events: std::collections::VecDeque::new(),
            owner: "alice".into(),
            lifecycle: SubscriptionLifecycle::Active,
            pending_delete: false,
        };
        assert!(!sub.is_renewable());
    }
}
