// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Resource lifecycle — external files (fonts, icons, PPD-like capability
// bundles) the system tracks by id and by path.

use inftprint_core::error::{InftError, Result};
use inftprint_core::model::{Resource, ResourceId, ResourceState};
use tracing::instrument;

use crate::store::Store;

/// Create a resource record in `pending` state; a file is not yet attached.
pub async fn create_resource(store: &Store, uuid: impl Into<String>) -> Resource {
    let id = store.allocate_resource_id();
    let resource = Resource::new(id, uuid);
    store.insert_resource(resource.clone()).await;
    resource
}

/// Attach uploaded bytes to a resource, moving it `pending -> available`.
#[instrument(skip(store))]
pub async fn mark_available(
    store: &Store,
    id: ResourceId,
    local_filename: impl Into<String>,
    mime_type: impl Into<String>,
) -> Result<()> {
    store
        .with_resource_mut(id, |r| {
            if r.state.is_terminal() {
                return Err(InftError::NotPossible(format!(
                    "resource {} is in terminal state {:?}",
                    id.0, r.state
                )));
            }
            r.local_filename = Some(local_filename.into());
            r.mime_type = Some(mime_type.into());
            r.state = ResourceState::Available;
            Ok(())
        })
        .await?
}

/// `available -> installed` on an explicit install request.
pub async fn install(store: &Store, id: ResourceId) -> Result<()> {
    store
        .with_resource_mut(id, |r| match r.state {
            ResourceState::Available => {
                r.state = ResourceState::Installed;
                Ok(())
            }
            other => Err(InftError::NotPossible(format!(
                "resource {} cannot be installed from state {other:?}",
                id.0
            ))),
        })
        .await?
}

/// Cancel or abort a resource, moving it to a terminal state.
pub async fn cancel(store: &Store, id: ResourceId, aborted: bool) -> Result<()> {
    let next = if aborted { ResourceState::Aborted } else { ResourceState::Canceled };
    store
        .with_resource_mut(id, |r| {
            if r.state.is_terminal() {
                return Err(InftError::NotPossible(format!("resource {} already terminal", id.0)));
            }
            r.state = next;
            Ok(())
        })
        .await?
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn new_resource_starts_pending() {
        let store = Store::new();
        let resource = create_resource(&store, "urn:uuid:res").await;
        assert_eq!(resource.state, ResourceState::Pending);
    }

    #[tokio::test]
    async fn mark_available_then_install() {
        let store = Store::new();
        let resource = create_resource(&store, "urn:uuid:res").await;
        mark_available(&store, resource.id, "42-font.pfb", "application/x-font").await.unwrap();
        install(&store, resource.id).await.unwrap();

        let fetched = store.resource(resource.id).await.unwrap();
        assert_eq!(fetched.state, ResourceState::Installed);
    }

    #[tokio::test]
    async fn cancel_terminal_resource_rejected() {
        let store = Store::new();
        let resource = create_resource(&store, "urn:uuid:res").await;
        cancel(&store, resource.id, false).await.unwrap();
        assert!(cancel(&store, resource.id, false).await.is_err());
    }
}
