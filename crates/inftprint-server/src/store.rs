// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Object Store — process-wide registries for printers, subscriptions,
// resources, and devices, with the lock discipline the lifecycle engine and
// dispatcher rely on: a registry-level lock guards membership, a
// printer-level lock guards everything that printer owns (including its
// jobs), and a dedicated lock guards each other category.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;

use inftprint_core::error::{InftError, Result};
use inftprint_core::model::{
    Device, Job, JobId, Printer, PrinterId, Resource, ResourceId, Subscription, SubscriptionId,
};
use tokio::sync::{Notify, RwLock};

/// A printer together with the jobs it owns. One `RwLock` guards both, per
/// the rule that a job's fields are always reached through its printer.
pub struct PrinterRecord {
    pub printer: Printer,
    pub jobs: HashMap<JobId, Job>,
}

impl PrinterRecord {
    pub fn new(printer: Printer) -> Self {
        Self {
            printer,
            jobs: HashMap::new(),
        }
    }
}

/// Process-wide object store. Cloning shares the underlying registries
/// (cheap `Arc` handles), the way a background task receives a weak-ish
/// handle to the same service context the HTTP handlers use.
#[derive(Clone)]
pub struct Store {
    inner: Arc<Inner>,
}

struct Inner {
    printers_by_id: RwLock<HashMap<PrinterId, Arc<RwLock<PrinterRecord>>>>,
    printers_by_path: RwLock<HashMap<String, PrinterId>>,
    subscriptions: RwLock<HashMap<SubscriptionId, Subscription>>,
    resources_by_id: RwLock<HashMap<ResourceId, Resource>>,
    resources_by_path: RwLock<HashMap<String, ResourceId>>,
    devices: RwLock<HashMap<String, Device>>,
    system_attributes: RwLock<HashMap<String, String>>,
    /// OS pid of a job's transform child, while one is running, so `StopJob`
    /// can signal it without the job processor itself holding any registry
    /// lock at the moment the stop request arrives.
    transform_children: RwLock<HashMap<JobId, u32>>,
    next_printer_id: AtomicI32,
    next_subscription_id: AtomicI32,
    next_resource_id: AtomicI32,
    /// Signaled whenever an event is appended to any subscription's queue,
    /// so `Get-Notifications` long-polls and the lease sweep can wake.
    pub notification: Notify,
    pub config_change_time: AtomicI32,
}

impl Default for Store {
    fn default() -> Self {
        Self::new()
    }
}

impl Store {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                printers_by_id: RwLock::new(HashMap::new()),
                printers_by_path: RwLock::new(HashMap::new()),
                subscriptions: RwLock::new(HashMap::new()),
                resources_by_id: RwLock::new(HashMap::new()),
                resources_by_path: RwLock::new(HashMap::new()),
                devices: RwLock::new(HashMap::new()),
                system_attributes: RwLock::new(HashMap::new()),
                transform_children: RwLock::new(HashMap::new()),
                next_printer_id: AtomicI32::new(1),
                next_subscription_id: AtomicI32::new(1),
                next_resource_id: AtomicI32::new(1),
                notification: Notify::new(),
                config_change_time: AtomicI32::new(0),
            }),
        }
    }

    pub fn allocate_printer_id(&self) -> PrinterId {
        PrinterId(self.inner.next_printer_id.fetch_add(1, Ordering::SeqCst))
    }

    pub fn allocate_subscription_id(&self) -> SubscriptionId {
        SubscriptionId(self.inner.next_subscription_id.fetch_add(1, Ordering::SeqCst))
    }

    pub fn allocate_resource_id(&self) -> ResourceId {
        ResourceId(self.inner.next_resource_id.fetch_add(1, Ordering::SeqCst))
    }

    pub fn bump_config_change(&self) {
        self.inner.config_change_time.fetch_add(1, Ordering::SeqCst);
    }

    /// Register a newly created printer under both indices.
    pub async fn insert_printer(&self, printer: Printer) -> Arc<RwLock<PrinterRecord>> {
        let id = printer.id;
        let path = printer.resource_path.clone();
        let record = Arc::new(RwLock::new(PrinterRecord::new(printer)));
        self.inner.printers_by_id.write().await.insert(id, record.clone());
        self.inner.printers_by_path.write().await.insert(path, id);
        self.bump_config_change();
        record
    }

    pub async fn printer_by_id(&self, id: PrinterId) -> Result<Arc<RwLock<PrinterRecord>>> {
        self.inner
            .printers_by_id
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or_else(|| InftError::PrinterNotFound(format!("{}", id.0)))
    }

    pub async fn printer_by_path(&self, path: &str) -> Result<Arc<RwLock<PrinterRecord>>> {
        let id = *self
            .inner
            .printers_by_path
            .read()
            .await
            .get(path)
            .ok_or_else(|| InftError::PrinterNotFound(path.to_string()))?;
        self.printer_by_id(id).await
    }

    pub async fn all_printers(&self) -> Vec<Arc<RwLock<PrinterRecord>>> {
        self.inner.printers_by_id.read().await.values().cloned().collect()
    }

    /// Remove a printer from both indices. The caller is responsible for
    /// having already cascaded jobs/subscriptions.
    pub async fn remove_printer(&self, id: PrinterId, path: &str) {
        self.inner.printers_by_id.write().await.remove(&id);
        self.inner.printers_by_path.write().await.remove(path);
        self.bump_config_change();
    }

    pub async fn insert_subscription(&self, sub: Subscription) {
        self.inner.subscriptions.write().await.insert(sub.id, sub);
    }

    pub async fn subscription(&self, id: SubscriptionId) -> Result<Subscription> {
        self.inner
            .subscriptions
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or(InftError::SubscriptionNotFound(id.0))
    }

    pub async fn with_subscription_mut<F, T>(&self, id: SubscriptionId, f: F) -> Result<T>
    where
        F: FnOnce(&mut Subscription) -> T,
    {
        let mut guard = self.inner.subscriptions.write().await;
        let sub = guard.get_mut(&id).ok_or(InftError::SubscriptionNotFound(id.0))?;
        Ok(f(sub))
    }

    pub async fn remove_subscription(&self, id: SubscriptionId) -> Option<Subscription> {
        self.inner.subscriptions.write().await.remove(&id)
    }

    pub async fn all_subscriptions(&self) -> Vec<Subscription> {
        self.inner.subscriptions.read().await.values().cloned().collect()
    }

    pub async fn insert_resource(&self, resource: Resource) {
        let id = resource.id;
        if let Some(path) = resource.external_path.clone() {
            self.inner.resources_by_path.write().await.insert(path, id);
        }
        self.inner.resources_by_id.write().await.insert(id, resource);
    }

    pub async fn resource(&self, id: ResourceId) -> Result<Resource> {
        self.inner
            .resources_by_id
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or(InftError::ResourceNotFound(id.0))
    }

    pub async fn with_resource_mut<F, T>(&self, id: ResourceId, f: F) -> Result<T>
    where
        F: FnOnce(&mut Resource) -> T,
    {
        let mut guard = self.inner.resources_by_id.write().await;
        let resource = guard.get_mut(&id).ok_or(InftError::ResourceNotFound(id.0))?;
        Ok(f(resource))
    }

    pub async fn upsert_device(&self, device: Device) {
        self.inner.devices.write().await.insert(device.uuid.clone(), device);
    }

    pub async fn device(&self, uuid: &str) -> Option<Device> {
        self.inner.devices.read().await.get(uuid).cloned()
    }

    pub async fn remove_device(&self, uuid: &str) -> Option<Device> {
        self.inner.devices.write().await.remove(uuid)
    }

    pub async fn devices_for_printer(&self, printer_id: PrinterId) -> Vec<Device> {
        self.inner
            .devices
            .read()
            .await
            .values()
            .filter(|d| d.printer_id == printer_id)
            .cloned()
            .collect()
    }

    pub async fn system_attribute(&self, name: &str) -> Option<String> {
        self.inner.system_attributes.read().await.get(name).cloned()
    }

    pub async fn set_system_attribute(&self, name: impl Into<String>, value: impl Into<String>) {
        self.inner.system_attributes.write().await.insert(name.into(), value.into());
        self.bump_config_change();
    }

    /// Record the pid of a job's freshly spawned transform child.
    pub async fn register_transform_child(&self, job_id: JobId, pid: u32) {
        self.inner.transform_children.write().await.insert(job_id, pid);
    }

    /// Clear a job's transform-child entry once it has been reaped.
    pub async fn clear_transform_child(&self, job_id: JobId) {
        self.inner.transform_children.write().await.remove(&job_id);
    }

    /// Send `SIGTERM` to a job's transform child, if one is currently
    /// running. Returns `true` if a signal was sent.
    pub async fn signal_transform_child(&self, job_id: JobId) -> bool {
        let Some(&pid) = self.inner.transform_children.read().await.get(&job_id) else {
            return false;
        };
        // SAFETY: `pid` names a child of this process recorded by
        // `register_transform_child`; sending it a signal it may have
        // already exited and been reaped is a documented, harmless ESRCH.
        unsafe { libc::kill(pid as i32, libc::SIGTERM) == 0 }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use inftprint_core::model::Printer;

    #[tokio::test]
    async fn insert_and_lookup_printer_by_path() {
        let store = Store::new();
        let id = store.allocate_printer_id();
        let printer = Printer::new(id, "p1", "/ipp/print/p1", "urn:uuid:test");
        store.insert_printer(printer).await;

        let record = store.printer_by_path("/ipp/print/p1").await.unwrap();
        assert_eq!(record.read().await.printer.id, id);
    }

    #[tokio::test]
    async fn missing_printer_returns_not_found() {
        let store = Store::new();
        let result = store.printer_by_id(PrinterId(999)).await;
        assert!(matches!(result, Err(InftError::PrinterNotFound(_))));
    }

    #[tokio::test]
    async fn allocate_printer_id_is_monotone() {
        let store = Store::new();
        let a = store.allocate_printer_id();
        let b = store.allocate_printer_id();
        assert!(b.0 > a.0);
    }
}
